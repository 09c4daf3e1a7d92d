//! The event processor.
//!
//! A [PerfParser] walks the decoded record list once, maintaining one
//! [AddressMapper] per process, the command table, and the DSO table, and
//! resolves every sampled address to the mapping that owns it. With
//! remapping enabled it also rewrites all addresses (MMAP starts, sample
//! ips and data addresses, call chains, branch stacks) into the mappers'
//! synthetic space, so the output leaks no real layout.

use crate::dso::{self, DsoInfo, DsoProbe, FsProbe};
use crate::errors::ParseError;
use crate::event::{
    record_type_name, PERF_CONTEXT_MAX, PERF_RECORD_AUX, PERF_RECORD_AUXTRACE,
    PERF_RECORD_AUXTRACE_ERROR, PERF_RECORD_AUXTRACE_INFO, PERF_RECORD_CGROUP, PERF_RECORD_COMM,
    PERF_RECORD_EXIT, PERF_RECORD_FINISHED_ROUND, PERF_RECORD_FORK, PERF_RECORD_ITRACE_START,
    PERF_RECORD_LOST, PERF_RECORD_LOST_SAMPLES, PERF_RECORD_MISC_CPUMODE_MASK,
    PERF_RECORD_MISC_KERNEL, PERF_RECORD_MMAP, PERF_RECORD_MMAP2, PERF_RECORD_NAMESPACES,
    PERF_RECORD_SAMPLE, PERF_RECORD_STAT, PERF_RECORD_STAT_CONFIG, PERF_RECORD_STAT_ROUND,
    PERF_RECORD_SWITCH, PERF_RECORD_SWITCH_CPU_WIDE, PERF_RECORD_THREAD_MAP,
    PERF_RECORD_THROTTLE, PERF_RECORD_TIME_CONV, PERF_RECORD_UNTHROTTLE,
    PERF_RECORD_USER_TYPE_START, CALLCHAIN_UNMAPPED_BIT,
};
use crate::huge_pages;
use crate::reader::EventReader;
use addrmap::AddressMapper;
use index_vec::IndexVec;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, LazyLock};

/// The kernel idle task. perf never records a COMM for it, so its command
/// is seeded by hand.
pub const SWAPPER_PID: u32 = 0;
const SWAPPER_COMMAND: &str = "swapper";

/// perf reports kernel MMAPs with pid -1. The mapper owned by this pid
/// holds the kernel mappings and serves as the template for processes
/// whose parent mapper is unknown.
pub const KERNEL_PID: u32 = u32::MAX;

/// MMAPs are aligned to pages of this many bytes.
static SYSTEM_PAGE_SIZE: LazyLock<u64> =
    LazyLock::new(|| u64::try_from(unsafe { libc::sysconf(libc::_SC_PAGESIZE) }).unwrap());

index_vec::define_index_type! {
    /// Index of a record in the parsed-event vector. Doubles as the stable
    /// id handed to the address mappers, so a resolved address leads back
    /// to the MMAP record that created its mapping.
    pub struct EventIdx = u32;
}

/// Parser behavior switches. The defaults match what a capture
/// post-processor normally wants; remapping and build-id probing are
/// opt-in.
#[derive(Clone, Debug)]
pub struct ParserConfig {
    /// Ask the reader to time-sort records before parsing.
    pub sort_events_by_time: bool,
    /// Repair MMAP fragments produced by transparent huge pages.
    pub deduce_huge_page_mappings: bool,
    /// Merge contiguous same-file MMAPs.
    pub combine_mappings: bool,
    /// Drop MMAP records that no sample resolved into.
    pub discard_unused_events: bool,
    /// Rewrite all addresses into synthetic space.
    pub do_remap: bool,
    /// Probe the filesystem for build-ids the capture is missing.
    pub read_missing_buildids: bool,
    /// Treat mappings whose filename contains "jitted-" as JIT regions,
    /// which need not be page aligned.
    pub allow_unaligned_jit_mappings: bool,
    /// Minimum percentage of samples that must map for the parse to
    /// succeed.
    pub sample_mapping_percentage_threshold: f64,
    /// Page size used for mapping alignment. Defaults to the system page
    /// size.
    pub page_alignment: u64,
}

impl Default for ParserConfig {
    fn default() -> Self {
        Self {
            sort_events_by_time: true,
            deduce_huge_page_mappings: true,
            combine_mappings: true,
            discard_unused_events: false,
            do_remap: false,
            read_missing_buildids: false,
            allow_unaligned_jit_mappings: false,
            sample_mapping_percentage_threshold: 95.0,
            page_alignment: *SYSTEM_PAGE_SIZE,
        }
    }
}

/// Counters accumulated over one parse.
#[derive(Clone, Copy, Debug, Default)]
pub struct ParserStats {
    pub num_mmap_events: u64,
    pub num_comm_events: u64,
    pub num_fork_events: u64,
    pub num_exit_events: u64,
    pub num_sample_events: u64,
    pub num_sample_events_mapped: u64,
    pub num_data_sample_events: u64,
    pub num_data_sample_events_mapped: u64,
    /// Whether the parse that produced these stats rewrote addresses.
    pub did_remap: bool,
}

/// A resolved address: the object it fell into and the byte offset within
/// that object's file.
#[derive(Clone, Debug)]
pub struct DsoAndOffset {
    dso: Arc<str>,
    offset: u64,
}

impl DsoAndOffset {
    pub fn dso(&self) -> &str {
        &self.dso
    }

    pub fn offset(&self) -> u64 {
        self.offset
    }
}

/// One resolved branch-stack entry.
#[derive(Clone, Debug)]
pub struct BranchEntry {
    pub from: DsoAndOffset,
    pub to: DsoAndOffset,
    pub mispredicted: bool,
    pub predicted: bool,
    pub in_transaction: bool,
    pub aborted_transaction: bool,
    pub cycles: u32,
}

/// Per-record results of a parse, parallel to the reader's record list.
#[derive(Clone, Debug, Default)]
pub struct ParsedEvent {
    /// Index of the record in the reader's (post-pre-pass) list.
    raw_idx: usize,
    /// The command of the sampling thread, for SAMPLE records.
    command: Option<Arc<str>>,
    /// Resolution of the sampled ip.
    dso_and_offset: Option<DsoAndOffset>,
    /// Resolution of the sampled data address.
    data_dso_and_offset: Option<DsoAndOffset>,
    /// Resolutions of the successfully mapped callchain entries, dense.
    callchain: Vec<DsoAndOffset>,
    /// Resolutions of the branch-stack entries.
    branch_stack: Vec<BranchEntry>,
    /// For MMAP records: how many sampled addresses resolved into this
    /// mapping. Drives unused-MMAP pruning.
    num_samples_in_mmap_region: u64,
}

impl ParsedEvent {
    fn new(raw_idx: usize) -> Self {
        Self {
            raw_idx,
            ..Default::default()
        }
    }

    pub fn raw_index(&self) -> usize {
        self.raw_idx
    }

    pub fn command(&self) -> Option<&str> {
        self.command.as_deref()
    }

    pub fn dso_and_offset(&self) -> Option<&DsoAndOffset> {
        self.dso_and_offset.as_ref()
    }

    pub fn data_dso_and_offset(&self) -> Option<&DsoAndOffset> {
        self.data_dso_and_offset.as_ref()
    }

    pub fn callchain(&self) -> &[DsoAndOffset] {
        &self.callchain
    }

    pub fn branch_stack(&self) -> &[BranchEntry] {
        &self.branch_stack
    }

    pub fn num_samples_in_mmap_region(&self) -> u64 {
        self.num_samples_in_mmap_region
    }
}

fn page_offset(page_alignment: u64, addr: u64) -> u64 {
    if page_alignment == 0 {
        return 0;
    }
    addr & (page_alignment - 1)
}

fn log_user_event(type_: u32) {
    match type_ {
        PERF_RECORD_AUXTRACE_INFO | PERF_RECORD_AUXTRACE | PERF_RECORD_AUXTRACE_ERROR
        | PERF_RECORD_THREAD_MAP | PERF_RECORD_STAT_CONFIG | PERF_RECORD_STAT
        | PERF_RECORD_STAT_ROUND | PERF_RECORD_TIME_CONV => {
            log::debug!("parsed user record {}: nothing to do", record_type_name(type_));
        }
        _ => log::debug!("unsupported user record type {type_}"),
    }
}

/// Walks a decoded record list and resolves every sampled address.
pub struct PerfParser<'a> {
    reader: &'a mut dyn EventReader,
    config: ParserConfig,
    probe: Box<dyn DsoProbe>,
    parsed_events: IndexVec<EventIdx, ParsedEvent>,
    process_mappers: HashMap<u32, AddressMapper>,
    commands: HashSet<Arc<str>>,
    pidtid_to_comm: HashMap<(u32, u32), Arc<str>>,
    dsos: HashMap<Arc<str>, DsoInfo>,
    stats: ParserStats,
}

impl<'a> PerfParser<'a> {
    pub fn new(reader: &'a mut dyn EventReader, config: ParserConfig) -> Self {
        Self {
            reader,
            config,
            probe: Box::new(FsProbe),
            parsed_events: IndexVec::new(),
            process_mappers: HashMap::new(),
            commands: HashSet::new(),
            pidtid_to_comm: HashMap::new(),
            dsos: HashMap::new(),
            stats: ParserStats::default(),
        }
    }

    /// Replaces the build-id probe. Only consulted when
    /// `read_missing_buildids` is set.
    pub fn with_probe(mut self, probe: Box<dyn DsoProbe>) -> Self {
        self.probe = probe;
        self
    }

    pub fn stats(&self) -> &ParserStats {
        &self.stats
    }

    pub fn parsed_events(&self) -> &IndexVec<EventIdx, ParsedEvent> {
        &self.parsed_events
    }

    pub fn dso(&self, name: &str) -> Option<&DsoInfo> {
        self.dsos.get(name)
    }

    pub fn dsos(&self) -> impl Iterator<Item = &DsoInfo> {
        self.dsos.values()
    }

    /// The interned command strings seen during the parse.
    pub fn commands(&self) -> impl Iterator<Item = &str> {
        self.commands.iter().map(|c| &**c)
    }

    pub fn command_for(&self, pid: u32, tid: u32) -> Option<&str> {
        self.pidtid_to_comm.get(&(pid, tid)).map(|c| &**c)
    }

    /// Runs the parse. The reader's records are rewritten in place as
    /// configured; per-record results land in [Self::parsed_events].
    pub fn parse(&mut self) -> Result<(), ParseError> {
        if self.config.sort_events_by_time {
            self.reader.maybe_sort_events_by_time();
        }

        // In case there is state from a previous parse.
        self.clear();

        if self.config.deduce_huge_page_mappings {
            huge_pages::deduce_huge_pages(self.reader.events_mut());
        }
        if self.config.combine_mappings {
            huge_pages::combine_mappings(self.reader.events_mut());
        }

        // FINISHED_ROUND records carry no timestamp and nothing downstream
        // wants them; they never get a parsed slot.
        for (i, event) in self.reader.events().iter().enumerate() {
            if event.header().type_ == PERF_RECORD_FINISHED_ROUND {
                continue;
            }
            self.parsed_events.push(ParsedEvent::new(i));
        }

        self.process_events()?;

        if self.config.discard_unused_events {
            self.discard_unused_events();
        }
        Ok(())
    }

    fn clear(&mut self) {
        self.parsed_events = IndexVec::new();
        self.process_mappers.clear();
        self.commands.clear();
        self.pidtid_to_comm.clear();
        self.dsos.clear();
        self.stats = ParserStats::default();
    }

    fn process_events(&mut self) -> Result<(), ParseError> {
        // Pid 0 never gets a COMM record; seed it, as perf itself does.
        let swapper: Arc<str> = Arc::from(SWAPPER_COMMAND);
        self.commands.insert(swapper.clone());
        self.pidtid_to_comm
            .insert((SWAPPER_PID, SWAPPER_PID), swapper);

        // The first kernel-mode MMAP is the kernel image and needs special
        // handling. User mappings may precede it, and a capture recorded
        // without kernel access has none at all.
        let mut first_kernel_mmap = true;

        for i in 0..self.parsed_events.len() {
            let idx = EventIdx::from_usize(i);
            let raw_idx = self.parsed_events[idx].raw_idx;
            let header = self.reader.events()[raw_idx].header();

            if header.type_ >= PERF_RECORD_USER_TYPE_START {
                log_user_event(header.type_);
                continue;
            }

            match header.type_ {
                PERF_RECORD_SAMPLE => {
                    self.stats.num_sample_events += 1;
                    self.map_sample_event(idx)?;
                }
                PERF_RECORD_MMAP | PERF_RECORD_MMAP2 => {
                    self.stats.num_mmap_events += 1;
                    let is_kernel = first_kernel_mmap
                        && header.misc & PERF_RECORD_MISC_CPUMODE_MASK == PERF_RECORD_MISC_KERNEL;
                    self.map_mmap_event(idx, is_kernel)?;
                    self.register_dso(raw_idx, header.type_ == PERF_RECORD_MMAP2)?;
                    if is_kernel {
                        first_kernel_mmap = false;
                    }
                }
                PERF_RECORD_FORK => {
                    self.stats.num_fork_events += 1;
                    self.map_fork_event(raw_idx)?;
                }
                PERF_RECORD_EXIT => {
                    self.stats.num_exit_events += 1;
                }
                PERF_RECORD_COMM => {
                    self.stats.num_comm_events += 1;
                    self.map_comm_event(raw_idx)?;
                }
                PERF_RECORD_LOST | PERF_RECORD_THROTTLE | PERF_RECORD_UNTHROTTLE
                | PERF_RECORD_AUX | PERF_RECORD_ITRACE_START | PERF_RECORD_LOST_SAMPLES
                | PERF_RECORD_SWITCH | PERF_RECORD_SWITCH_CPU_WIDE | PERF_RECORD_NAMESPACES
                | PERF_RECORD_CGROUP => {
                    log::trace!("{}: nothing to do", record_type_name(header.type_));
                }
                other => {
                    log::error!("unknown record type {other}");
                    return Err(ParseError::UnknownRecordType(other));
                }
            }
        }

        dso::fill_build_ids(
            &mut *self.reader,
            &*self.probe,
            self.config.read_missing_buildids,
            &mut self.dsos,
        )?;

        log::info!(
            "parser processed: {} MMAP/MMAP2 events, {} COMM events, {} FORK events, \
             {} EXIT events, {} SAMPLE events, {} of these mapped, \
             {} SAMPLE events with a data address, {} of these mapped",
            self.stats.num_mmap_events,
            self.stats.num_comm_events,
            self.stats.num_fork_events,
            self.stats.num_exit_events,
            self.stats.num_sample_events,
            self.stats.num_sample_events_mapped,
            self.stats.num_data_sample_events,
            self.stats.num_data_sample_events_mapped,
        );

        if self.stats.num_sample_events == 0 {
            if self
                .reader
                .event_types_to_skip_when_serializing()
                .contains(&PERF_RECORD_SAMPLE)
            {
                log::info!("input has no sample events because SAMPLE records were filtered");
            } else {
                return Err(ParseError::NoSamples);
            }
        } else {
            let mapped = self.stats.num_sample_events_mapped;
            let total = self.stats.num_sample_events;
            let percentage = mapped as f64 / total as f64 * 100.0;
            let threshold = self.config.sample_mapping_percentage_threshold;
            if percentage < threshold {
                return Err(ParseError::LowMappingRatio {
                    mapped,
                    total,
                    percentage,
                    threshold,
                });
            }
        }

        self.stats.did_remap = self.config.do_remap;
        Ok(())
    }

    fn register_dso(&mut self, raw_idx: usize, is_mmap2: bool) -> Result<(), ParseError> {
        let (filename, maj, min, ino) = {
            let mmap = self.reader.events()[raw_idx]
                .mmap_event()
                .ok_or(ParseError::CorruptRecord { index: raw_idx })?;
            let (maj, min, ino) = if is_mmap2 {
                (mmap.maj, mmap.min, mmap.ino)
            } else {
                (0, 0, 0)
            };
            (mmap.filename.clone(), maj, min, ino)
        };
        // First record naming the file wins; later MMAPs of the same file
        // do not update the entry.
        if !self.dsos.contains_key(filename.as_str()) {
            let name: Arc<str> = Arc::from(filename.as_str());
            self.dsos
                .insert(name.clone(), DsoInfo::new(name, maj, min, ino));
        }
        Ok(())
    }

    fn map_mmap_event(&mut self, idx: EventIdx, is_kernel: bool) -> Result<(), ParseError> {
        let raw_idx = self.parsed_events[idx].raw_idx;
        let (pid, mut start, mut len, mut pgoff, jit_name) = {
            let mmap = self.reader.events()[raw_idx]
                .mmap_event()
                .ok_or(ParseError::CorruptRecord { index: raw_idx })?;
            log::trace!("{}: {}", record_type_name(self.reader.events()[raw_idx].header().type_), mmap.filename);
            (
                mmap.pid,
                mmap.start,
                mmap.len,
                mmap.pgoff,
                mmap.filename.contains("jitted-"),
            )
        };

        // The kernel mapping comes in several shapes. On ARM and x86 under
        // sudo, pgoff == start. On x86-64 under sudo, pgoff lies strictly
        // inside [start, start + len) and samples only occur from pgoff
        // onward; shrink the mapping to that region. Without kernel
        // access, start == pgoff == 0 and len is the pointer limit. In
        // every shape pgoff is then dropped: under ASLR it is the kernel
        // load address, which remapped output must not reveal.
        if is_kernel {
            if (pgoff as u128) > (start as u128)
                && (pgoff as u128) < (start as u128) + (len as u128)
            {
                len -= pgoff - start;
                start = pgoff;
            }
            pgoff = 0;
        }

        let is_jit = self.config.allow_unaligned_jit_mappings && jit_name;

        self.get_or_create_process_mapper(pid, None);
        let do_remap = self.config.do_remap;
        let page_alignment = self.config.page_alignment;
        let mapper = self.process_mappers.get_mut(&pid).unwrap();
        if let Err(e) = mapper.map_with_id(start, len, idx.index() as u64, pgoff, true, is_jit) {
            mapper.dump_to_log();
            return Err(e.into());
        }

        if do_remap {
            let (mapped_start, range_is_jit) = {
                let Some((mapped_start, range)) = mapper.mapped_address(start) else {
                    return Err(ParseError::RemapLookupFailed { start });
                };
                (mapped_start, range.is_jit())
            };
            if !range_is_jit
                && page_offset(page_alignment, mapped_start) != page_offset(page_alignment, start)
            {
                return Err(ParseError::RemapMisaligned {
                    addr: start,
                    remapped: mapped_start,
                });
            }
            let mmap = self.reader.events_mut()[raw_idx].mmap_event_mut().unwrap();
            mmap.start = mapped_start;
            mmap.len = len;
            mmap.pgoff = pgoff;
        }
        Ok(())
    }

    fn map_comm_event(&mut self, raw_idx: usize) -> Result<(), ParseError> {
        let (pid, tid, comm) = {
            let comm = self.reader.events()[raw_idx]
                .comm_event()
                .ok_or(ParseError::CorruptRecord { index: raw_idx })?;
            (comm.pid, comm.tid, comm.comm.clone())
        };
        log::trace!("COMM: {pid}:{tid}: {comm}");
        self.get_or_create_process_mapper(pid, None);
        let interned = self.intern_command(&comm);
        self.pidtid_to_comm.insert((pid, tid), interned);
        Ok(())
    }

    fn map_fork_event(&mut self, raw_idx: usize) -> Result<(), ParseError> {
        let fork = *self.reader.events()[raw_idx]
            .fork_event()
            .ok_or(ParseError::CorruptRecord { index: raw_idx })?;
        log::trace!(
            "FORK: {}:{} -> {}:{}",
            fork.ppid,
            fork.ptid,
            fork.pid,
            fork.tid
        );
        let parent = (fork.ppid, fork.ptid);
        let child = (fork.pid, fork.tid);
        if parent != child {
            if let Some(comm) = self.pidtid_to_comm.get(&parent).cloned() {
                self.pidtid_to_comm.insert(child, comm);
            }
        }

        // A new thread within an existing process shares its address
        // space; only a new process gets a mapper.
        if fork.ppid == fork.pid {
            return Ok(());
        }
        if !self.get_or_create_process_mapper(fork.pid, Some(fork.ppid)) {
            log::debug!("found an existing process mapper for pid {}", fork.pid);
        }
        Ok(())
    }

    /// Ensures a mapper exists for `pid`, cloning the parent's when known,
    /// otherwise the kernel template. Returns whether a mapper was
    /// created.
    ///
    /// The kernel fallback matters beyond kernel samples: perf emits an
    /// explicit FORK from the swapper to init, and the swapper may own no
    /// mappings at all.
    fn get_or_create_process_mapper(&mut self, pid: u32, ppid: Option<u32>) -> bool {
        if self.process_mappers.contains_key(&pid) {
            return false;
        }
        let template = ppid
            .and_then(|ppid| self.process_mappers.get(&ppid))
            .or_else(|| self.process_mappers.get(&KERNEL_PID));
        let mapper = match template {
            Some(parent) => parent.clone(),
            None => AddressMapper::new(self.config.page_alignment),
        };
        self.process_mappers.insert(pid, mapper);
        true
    }

    fn intern_command(&mut self, comm: &str) -> Arc<str> {
        if let Some(existing) = self.commands.get(comm) {
            return existing.clone();
        }
        let interned: Arc<str> = Arc::from(comm);
        self.commands.insert(interned.clone());
        interned
    }

    fn map_sample_event(&mut self, idx: EventIdx) -> Result<(), ParseError> {
        let raw_idx = self.parsed_events[idx].raw_idx;
        let Some(sample) = self.reader.events()[raw_idx].sample_event() else {
            return Ok(());
        };
        let pidtid = (sample.pid, sample.tid);
        let unmapped_ip = sample.ip;
        let addr = sample.addr;
        let has_callchain = !sample.callchain.is_empty();
        let has_branch_stack = !sample.branch_stack.is_empty();

        if let Some(comm) = self.pidtid_to_comm.get(&pidtid).cloned() {
            self.parsed_events[idx].command = Some(comm);
        }

        let mut mapping_ok = true;

        match self.map_ip_and_pid(unmapped_ip, pidtid)? {
            Some((new_ip, dso_and_offset)) => {
                self.parsed_events[idx].dso_and_offset = Some(dso_and_offset);
                self.reader.events_mut()[raw_idx].sample_event_mut().unwrap().ip = new_ip;
            }
            None => mapping_ok = false,
        }

        if addr != 0 {
            self.stats.num_data_sample_events += 1;
            if let Some((new_addr, dso_and_offset)) = self.map_ip_and_pid(addr, pidtid)? {
                self.stats.num_data_sample_events_mapped += 1;
                self.parsed_events[idx].data_dso_and_offset = Some(dso_and_offset);
                self.reader.events_mut()[raw_idx]
                    .sample_event_mut()
                    .unwrap()
                    .addr = new_addr;
            }
        }

        if has_callchain {
            let resolved_ip = self.reader.events()[raw_idx].sample_event().unwrap().ip;
            if !self.map_callchain(idx, raw_idx, resolved_ip, unmapped_ip, pidtid)? {
                mapping_ok = false;
            }
        }

        if has_branch_stack && !self.map_branch_stack(idx, raw_idx, pidtid)? {
            mapping_ok = false;
        }

        if mapping_ok {
            self.stats.num_sample_events_mapped += 1;
        }
        Ok(())
    }

    /// Resolves one sampled address for one thread. `Ok(None)` means the
    /// address lies in no known mapping, which is not fatal; errors mean
    /// the parse state itself is corrupt.
    fn map_ip_and_pid(
        &mut self,
        addr: u64,
        pidtid: (u32, u32),
    ) -> Result<Option<(u64, DsoAndOffset)>, ParseError> {
        let (pid, tid) = pidtid;
        // A SAMPLE can arrive before any record created a mapper for its
        // pid (pid 0, typically).
        self.get_or_create_process_mapper(pid, None);
        let (synthetic, id, offset, is_jit) = {
            let mapper = &self.process_mappers[&pid];
            let Some((synthetic, range)) = mapper.mapped_address(addr) else {
                return Ok(None);
            };
            let (id, offset) = range.id_and_offset(addr);
            (synthetic, id, offset, range.is_jit())
        };

        if id as usize >= self.parsed_events.len() {
            return Err(ParseError::BadMappingId { id });
        }
        let target = EventIdx::from_usize(id as usize);
        let target_raw = self.parsed_events[target].raw_idx;
        let filename = {
            let Some(mmap) = self.reader.events()[target_raw].mmap_event() else {
                return Err(ParseError::BadMappingId { id });
            };
            mmap.filename.clone()
        };
        let Some(dso) = self.dsos.get_mut(filename.as_str()) else {
            return Err(ParseError::BadMappingId { id });
        };
        dso.hit = true;
        dso.threads.insert((pid, tid));
        let dso_name = dso.name.clone();
        self.parsed_events[target].num_samples_in_mmap_region += 1;

        let new_addr = if self.config.do_remap {
            // JIT regions are exempt: they pack densely and give up page
            // compatibility by design of the mapping itself.
            if !is_jit
                && page_offset(self.config.page_alignment, synthetic)
                    != page_offset(self.config.page_alignment, addr)
            {
                log::error!(
                    "remapped address {synthetic:#x} does not share a page offset with {addr:#x}"
                );
                return Ok(None);
            }
            synthetic
        } else {
            addr
        };
        Ok(Some((
            new_addr,
            DsoAndOffset {
                dso: dso_name,
                offset,
            },
        )))
    }

    fn map_callchain(
        &mut self,
        idx: EventIdx,
        raw_idx: usize,
        resolved_ip: u64,
        original_ip: u64,
        pidtid: (u32, u32),
    ) -> Result<bool, ParseError> {
        let mut mapping_ok = true;
        let len = self.reader.events()[raw_idx]
            .sample_event()
            .unwrap()
            .callchain
            .len();
        for i in 0..len {
            let entry = self.reader.events()[raw_idx].sample_event().unwrap().callchain[i];
            // Context markers flag cpu-mode transitions; they are not
            // addresses and stay as they are.
            if entry >= PERF_CONTEXT_MAX {
                continue;
            }
            // The sampled ip was already mapped; mirror its result.
            if entry == original_ip {
                self.reader.events_mut()[raw_idx]
                    .sample_event_mut()
                    .unwrap()
                    .callchain[i] = resolved_ip;
                continue;
            }
            let new_entry = match self.map_ip_and_pid(entry, pidtid)? {
                Some((mapped, dso_and_offset)) => {
                    self.parsed_events[idx].callchain.push(dso_and_offset);
                    mapped
                }
                None => {
                    // Leaving the raw address in place would let it collide
                    // with synthetic space downstream; the high bit marks
                    // it as unmapped.
                    mapping_ok = false;
                    entry | CALLCHAIN_UNMAPPED_BIT
                }
            };
            self.reader.events_mut()[raw_idx]
                .sample_event_mut()
                .unwrap()
                .callchain[i] = new_entry;
        }
        Ok(mapping_ok)
    }

    fn map_branch_stack(
        &mut self,
        idx: EventIdx,
        raw_idx: usize,
        pidtid: (u32, u32),
    ) -> Result<bool, ParseError> {
        // The branch stack is a fixed-size ring; unused slots at the tail
        // are all-zero padding.
        let (trimmed, total) = {
            let stack = &self.reader.events()[raw_idx]
                .sample_event()
                .unwrap()
                .branch_stack;
            (
                stack.iter().take_while(|e| !e.is_null()).count(),
                stack.len(),
            )
        };
        for i in trimmed..total {
            let entry = self.reader.events()[raw_idx].sample_event().unwrap().branch_stack[i];
            if !entry.is_null() {
                log::error!(
                    "non-null branch stack entry {:#x} -> {:#x} after null entry",
                    entry.from_ip,
                    entry.to_ip
                );
                return Err(ParseError::MalformedBranchStack);
            }
        }

        let mut resolved = Vec::with_capacity(trimmed);
        for i in 0..trimmed {
            let entry = self.reader.events()[raw_idx].sample_event().unwrap().branch_stack[i];
            let Some((from_mapped, from)) = self.map_ip_and_pid(entry.from_ip, pidtid)? else {
                return Ok(false);
            };
            let Some((to_mapped, to)) = self.map_ip_and_pid(entry.to_ip, pidtid)? else {
                return Ok(false);
            };
            {
                let stack = &mut self.reader.events_mut()[raw_idx]
                    .sample_event_mut()
                    .unwrap()
                    .branch_stack;
                stack[i].from_ip = from_mapped;
                stack[i].to_ip = to_mapped;
            }
            resolved.push(BranchEntry {
                from,
                to,
                mispredicted: entry.mispredicted,
                predicted: entry.predicted,
                in_transaction: entry.in_transaction,
                aborted_transaction: entry.abort,
                cycles: entry.cycles,
            });
        }
        self.parsed_events[idx].branch_stack = resolved;
        Ok(true)
    }

    /// Drops MMAP records no sample resolved into, then rewrites the
    /// reader's record list to the retained order. FINISHED_ROUND records,
    /// which never had a parsed slot, disappear here too.
    fn discard_unused_events(&mut self) {
        let keep: Vec<bool> = {
            let events = self.reader.events();
            self.parsed_events
                .iter()
                .map(|pe| {
                    !(events[pe.raw_idx].mmap_event().is_some()
                        && pe.num_samples_in_mmap_region == 0)
                })
                .collect()
        };
        let old = std::mem::take(&mut self.parsed_events);
        for (parsed, keep) in old.into_iter().zip(keep) {
            if keep {
                self.parsed_events.push(parsed);
            }
        }

        // Retained raw indices are strictly increasing, so compaction can
        // move records up in place.
        let kept_raw: Vec<usize> = self.parsed_events.iter().map(|pe| pe.raw_idx).collect();
        let events = self.reader.events_mut();
        for (new_idx, &raw) in kept_raw.iter().enumerate() {
            if new_idx != raw {
                events.swap(new_idx, raw);
            }
        }
        events.truncate(kept_raw.len());
        for (new_idx, parsed) in self.parsed_events.iter_mut().enumerate() {
            parsed.raw_idx = new_idx;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::{CommEvent, MmapEvent, PerfEvent, SampleEvent};
    use crate::reader::InMemoryReader;

    fn test_config() -> ParserConfig {
        ParserConfig {
            page_alignment: 0x1000,
            ..Default::default()
        }
    }

    #[test]
    fn swapper_command_is_seeded() {
        let mut reader = InMemoryReader::new(vec![
            PerfEvent::mmap(MmapEvent {
                pid: SWAPPER_PID,
                tid: SWAPPER_PID,
                start: 0x1000,
                len: 0x1000,
                filename: "/sbin/init".into(),
                ..Default::default()
            }),
            PerfEvent::sample(SampleEvent {
                pid: SWAPPER_PID,
                tid: SWAPPER_PID,
                ip: 0x1080,
                ..Default::default()
            }),
        ]);
        let mut parser = PerfParser::new(&mut reader, test_config());
        parser.parse().unwrap();
        assert_eq!(parser.parsed_events()[EventIdx::from_usize(1)].command(), Some("swapper"));
        assert_eq!(parser.command_for(0, 0), Some("swapper"));
    }

    #[test]
    fn commands_are_interned_once() {
        let comm = |pid: u32, tid: u32| {
            PerfEvent::comm(CommEvent {
                pid,
                tid,
                comm: "worker".into(),
            })
        };
        let mut reader = InMemoryReader::new(vec![
            comm(1, 1),
            comm(1, 2),
            comm(3, 3),
            PerfEvent::mmap(MmapEvent {
                pid: 1,
                tid: 1,
                start: 0x1000,
                len: 0x1000,
                filename: "/bin/w".into(),
                ..Default::default()
            }),
            PerfEvent::sample(SampleEvent {
                pid: 1,
                tid: 2,
                ip: 0x1010,
                ..Default::default()
            }),
        ]);
        let mut parser = PerfParser::new(&mut reader, test_config());
        parser.parse().unwrap();
        // "swapper" + "worker".
        assert_eq!(parser.commands().count(), 2);
        assert_eq!(parser.command_for(1, 2), Some("worker"));
        assert_eq!(parser.command_for(3, 3), Some("worker"));
    }

    #[test]
    fn mapper_inherits_kernel_template_when_parent_unknown() {
        let mut reader = InMemoryReader::new(Vec::new());
        let mut parser = PerfParser::new(&mut reader, test_config());
        parser
            .process_mappers
            .insert(KERNEL_PID, AddressMapper::new(0x1000));
        parser
            .process_mappers
            .get_mut(&KERNEL_PID)
            .unwrap()
            .map_with_id(0xffff_0000, 0x1000, 0, 0, true, false)
            .unwrap();
        assert!(parser.get_or_create_process_mapper(42, Some(41)));
        assert_eq!(parser.process_mappers[&42].len(), 1);
        // Already there now.
        assert!(!parser.get_or_create_process_mapper(42, None));
    }

    #[test]
    fn fresh_mapper_when_no_template_exists() {
        let mut reader = InMemoryReader::new(Vec::new());
        let mut parser = PerfParser::new(&mut reader, test_config());
        assert!(parser.get_or_create_process_mapper(42, None));
        assert!(parser.process_mappers[&42].is_empty());
        assert_eq!(parser.process_mappers[&42].page_alignment(), 0x1000);
    }
}
