//! The DSO table and post-parse build-id resolution.
//!
//! Every MMAP filename gets a [DsoInfo] entry; sample mapping marks the
//! entries it hits and records which threads hit them. After the event
//! loop, build-ids are filled in from two layers: whatever the capture
//! itself carried, then (when configured) a [DsoProbe] that inspects the
//! live system. Probe results are only trusted when the file's device and
//! inode still match what the MMAP recorded, so a recycled path name
//! cannot smuggle in the wrong binary's build-id.

use crate::errors::ParseError;
use crate::reader::EventReader;
use std::collections::{BTreeSet, HashMap};
use std::fs::File;
use std::io;
use std::path::Path;
use std::sync::Arc;

/// Everything known about one mapped object file.
#[derive(Clone, Debug)]
pub struct DsoInfo {
    pub(crate) name: Arc<str>,
    /// Device and inode from the MMAP2 record that introduced the file;
    /// all zero for plain MMAP.
    pub(crate) maj: u32,
    pub(crate) min: u32,
    pub(crate) ino: u64,
    /// Hex-encoded build-id; empty when unknown.
    pub(crate) build_id: String,
    /// Whether any sample resolved into this object.
    pub(crate) hit: bool,
    /// The (pid, tid) pairs that sampled into this object, kept sorted so
    /// the probe visits threads of one process adjacently.
    pub(crate) threads: BTreeSet<(u32, u32)>,
}

impl DsoInfo {
    pub(crate) fn new(name: Arc<str>, maj: u32, min: u32, ino: u64) -> Self {
        Self {
            name,
            maj,
            min,
            ino,
            build_id: String::new(),
            hit: false,
            threads: BTreeSet::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn maj(&self) -> u32 {
        self.maj
    }

    pub fn min(&self) -> u32 {
        self.min
    }

    pub fn ino(&self) -> u64 {
        self.ino
    }

    pub fn build_id(&self) -> &str {
        &self.build_id
    }

    pub fn hit(&self) -> bool {
        self.hit
    }

    pub fn threads(&self) -> &BTreeSet<(u32, u32)> {
        &self.threads
    }
}

/// A file's identity on its filesystem.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct FileIdentity {
    pub maj: u32,
    pub min: u32,
    pub ino: u64,
}

/// Filesystem access needed to resolve build-ids. Everything that does I/O
/// lives behind this seam; the acceptance logic stays in the parser.
pub trait DsoProbe {
    fn file_identity(&self, path: &Path) -> io::Result<FileIdentity>;

    /// The GNU build-id note of the ELF file at `path`, raw bytes.
    fn read_build_id(&self, path: &Path) -> io::Result<Option<Vec<u8>>>;

    /// The build-id of a loaded kernel module, by module name.
    fn read_module_build_id(&self, module: &str) -> io::Result<Option<Vec<u8>>>;
}

/// The obvious [DsoProbe]: ask the filesystem.
#[derive(Debug, Default)]
pub struct FsProbe;

impl DsoProbe for FsProbe {
    fn file_identity(&self, path: &Path) -> io::Result<FileIdentity> {
        use std::os::unix::fs::MetadataExt;
        let md = std::fs::metadata(path)?;
        Ok(FileIdentity {
            maj: libc::major(md.dev()) as u32,
            min: libc::minor(md.dev()) as u32,
            ino: md.ino(),
        })
    }

    fn read_build_id(&self, path: &Path) -> io::Result<Option<Vec<u8>>> {
        use object::Object;
        let file = File::open(path)?;
        let mmap = unsafe { memmap2::Mmap::map(&file)? };
        let obj = object::File::parse(&*mmap)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        let build_id = obj
            .build_id()
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        Ok(build_id.map(|b| b.to_vec()))
    }

    fn read_module_build_id(&self, module: &str) -> io::Result<Option<Vec<u8>>> {
        let path = format!("/sys/module/{module}/notes/.note.gnu.build-id");
        let data = std::fs::read(path)?;
        Ok(parse_build_id_note(&data))
    }
}

/// Extracts the GNU build-id from a raw ELF note blob, as exported by
/// `/sys/module/<name>/notes/`.
fn parse_build_id_note(data: &[u8]) -> Option<Vec<u8>> {
    const NT_GNU_BUILD_ID: u32 = 3;
    let align4 = |x: usize| (x + 3) & !3;
    let mut rest = data;
    while rest.len() >= 12 {
        let namesz = u32::from_ne_bytes(rest[0..4].try_into().unwrap()) as usize;
        let descsz = u32::from_ne_bytes(rest[4..8].try_into().unwrap()) as usize;
        let type_ = u32::from_ne_bytes(rest[8..12].try_into().unwrap());
        let name_end = 12usize.checked_add(namesz)?;
        let desc_start = 12usize.checked_add(align4(namesz))?;
        let desc_end = desc_start.checked_add(descsz)?;
        if name_end > rest.len() || desc_end > rest.len() {
            return None;
        }
        if type_ == NT_GNU_BUILD_ID && &rest[12..name_end] == b"GNU\0" {
            return Some(rest[desc_start..desc_end].to_vec());
        }
        rest = &rest[desc_start.checked_add(align4(descsz))?.min(rest.len())..];
    }
    None
}

/// Kernel image pseudo-files; there is no path to probe for these.
fn is_kernel_non_module_name(name: &str) -> bool {
    name.starts_with("[kernel.kallsyms]") || name == "[vdso]" || name == "[vsyscall]"
}

/// `"[modname]"` → `"modname"`; `None` for anything else.
fn module_name(name: &str) -> Option<&str> {
    name.strip_prefix('[')?.strip_suffix(']')
}

/// Reads the build-id at `path` if the file still looks like the one the
/// MMAP described. The device/inode comparison is skipped when the DSO
/// carries no device info at all (plain MMAP records leave maj/min zero).
fn read_build_id_if_same_inode(
    probe: &dyn DsoProbe,
    path: &Path,
    dso: &DsoInfo,
) -> Option<Vec<u8>> {
    let identity = match probe.file_identity(path) {
        Ok(identity) => identity,
        Err(e) => {
            if e.kind() != io::ErrorKind::NotFound {
                log::warn!("failed to stat {}: {e}", path.display());
            }
            return None;
        }
    };
    if dso.maj != 0
        && dso.min != 0
        && identity
            != (FileIdentity {
                maj: dso.maj,
                min: dso.min,
                ino: dso.ino,
            })
    {
        return None;
    }
    probe.read_build_id(path).ok().flatten()
}

/// Looks up the build-id of a DSO that was hit by at least one sample.
///
/// Regular files are searched through the mount namespaces of the threads
/// that sampled into the DSO (`/proc/<tid>/root/...`), then their
/// processes, then the host filesystem. The thread set is sorted, so
/// threads of one process are adjacent and the per-process retry can be
/// skipped after the first attempt.
fn find_build_id(probe: &dyn DsoProbe, dso: &DsoInfo) -> Option<Vec<u8>> {
    let name = dso.name();
    if is_kernel_non_module_name(name) {
        return None;
    }
    if let Some(module) = module_name(name) {
        return probe.read_module_build_id(module).ok().flatten();
    }
    let mut last_pid = None;
    for &(pid, tid) in &dso.threads {
        let path = format!("/proc/{tid}/root/{name}");
        if let Some(id) = read_build_id_if_same_inode(probe, Path::new(&path), dso) {
            return Some(id);
        }
        if last_pid == Some(pid) || pid == tid {
            continue;
        }
        last_pid = Some(pid);
        let path = format!("/proc/{pid}/root/{name}");
        if let Some(id) = read_build_id_if_same_inode(probe, Path::new(&path), dso) {
            return Some(id);
        }
    }
    read_build_id_if_same_inode(probe, Path::new(name), dso)
}

/// Fills in DSO build-ids after the event loop: capture-supplied ids
/// first, then probed ids for hit DSOs (probed ids win). Newly discovered
/// ids are handed back to the reader.
pub(crate) fn fill_build_ids(
    reader: &mut dyn EventReader,
    probe: &dyn DsoProbe,
    read_missing_buildids: bool,
    dsos: &mut HashMap<Arc<str>, DsoInfo>,
) -> Result<(), ParseError> {
    let known = reader.filenames_to_build_ids();
    let mut discovered: HashMap<String, String> = HashMap::new();
    for dso in dsos.values_mut() {
        if let Some(id) = known.get(dso.name()) {
            dso.build_id = id.clone();
        }
        if read_missing_buildids && dso.hit {
            if let Some(raw) = find_build_id(probe, dso) {
                dso.build_id = hex::encode(raw);
                discovered.insert(dso.name().to_owned(), dso.build_id.clone());
            }
        }
    }
    if discovered.is_empty() {
        return Ok(());
    }
    reader
        .inject_build_ids(discovered)
        .map_err(ParseError::InjectBuildIds)
}
