//! MMAP repair pre-passes.
//!
//! Both passes rewrite the decoded record list in place, before the parser
//! assigns record indices, so that every id handed to the address mappers
//! refers to a post-pass record.
//!
//! Transparent huge pages split a single file mapping into several VMAs,
//! some of which the kernel reports with an anonymous placeholder filename
//! and a zero file offset. [deduce_huge_pages] reconstructs the placeholder
//! fragments' identity from their file-backed neighbors and folds the
//! repaired fragments back into one logical mapping. [combine_mappings]
//! merges mappings of the same file that the kernel emitted as separate
//! contiguous records.

use crate::event::{MmapEvent, PerfEvent};

/// Filenames the kernel uses for huge-page-backed VMAs that have lost
/// their file identity.
fn is_huge_page_placeholder(filename: &str) -> bool {
    filename == "//anon" || filename.starts_with("/anon_hugepage")
}

/// The fields of an MMAP record that decide whether two records describe
/// adjacent pieces of one mapping.
#[derive(Clone)]
struct MmapFields {
    type_: u32,
    pid: u32,
    start: u64,
    len: u64,
    pgoff: u64,
    maj: u32,
    min: u32,
    ino: u64,
    filename: String,
}

fn mmap_fields(event: &PerfEvent) -> Option<MmapFields> {
    let m = event.mmap_event()?;
    Some(MmapFields {
        type_: event.header().type_,
        pid: m.pid,
        start: m.start,
        len: m.len,
        pgoff: m.pgoff,
        maj: m.maj,
        min: m.min,
        ino: m.ino,
        filename: m.filename.clone(),
    })
}

/// True if `cur` begins exactly where `prev` ends, in both address space
/// and file offset, and both describe the same file on the same device.
fn is_coalescable(prev: &MmapFields, cur: &MmapFields) -> bool {
    prev.type_ == cur.type_
        && prev.pid == cur.pid
        && prev.filename == cur.filename
        && prev.maj == cur.maj
        && prev.min == cur.min
        && prev.ino == cur.ino
        && prev.start.wrapping_add(prev.len) == cur.start
        && prev.pgoff.wrapping_add(prev.len) == cur.pgoff
}

fn copy_identity(dst: &mut MmapEvent, filename: &str, pgoff: u64, src: &MmapFields) {
    dst.filename = filename.to_owned();
    dst.pgoff = pgoff;
    dst.maj = src.maj;
    dst.min = src.min;
    dst.ino = src.ino;
}

/// Rebuilds the identity of huge-page placeholder fragments from their
/// file-backed neighbors, then merges each repaired run into one mapping.
/// Records the pass does not touch keep their order.
pub fn deduce_huge_pages(events: &mut Vec<PerfEvent>) {
    let n = events.len();
    let mut repaired = vec![false; n];

    // File-backed mapping followed by placeholder fragments: the fragment
    // continues the file, so its offset is the end of its predecessor's.
    // Left to right, so a repaired fragment can seed the next one.
    for i in 1..n {
        let Some(prev) = mmap_fields(&events[i - 1]) else {
            continue;
        };
        if is_huge_page_placeholder(&prev.filename) {
            continue;
        }
        if events[i].mmap_event().is_none()
            || events[i - 1].header().type_ != events[i].header().type_
        {
            continue;
        }
        let cur = events[i].mmap_event_mut().unwrap();
        if prev.pid == cur.pid
            && is_huge_page_placeholder(&cur.filename)
            && cur.pgoff == 0
            && prev.start.wrapping_add(prev.len) == cur.start
        {
            let pgoff = prev.pgoff + prev.len;
            copy_identity(cur, &prev.filename, pgoff, &prev);
            log::debug!(
                "deduced huge page mapping at {:#x} as {} offset {:#x}",
                cur.start,
                cur.filename,
                pgoff,
            );
            repaired[i] = true;
        }
    }

    // Placeholder fragments followed by the file-backed remainder: the
    // fragment holds the bytes just before its successor's offset. Right
    // to left, for the same chaining reason.
    for i in (0..n.saturating_sub(1)).rev() {
        let Some(next) = mmap_fields(&events[i + 1]) else {
            continue;
        };
        if is_huge_page_placeholder(&next.filename) {
            continue;
        }
        if events[i].mmap_event().is_none()
            || events[i].header().type_ != events[i + 1].header().type_
        {
            continue;
        }
        let cur = events[i].mmap_event_mut().unwrap();
        if next.pid == cur.pid
            && is_huge_page_placeholder(&cur.filename)
            && cur.pgoff == 0
            && cur.start.wrapping_add(cur.len) == next.start
            && next.pgoff >= cur.len
        {
            let pgoff = next.pgoff - cur.len;
            copy_identity(cur, &next.filename, pgoff, &next);
            log::debug!(
                "deduced huge page mapping at {:#x} as {} offset {:#x}",
                cur.start,
                cur.filename,
                pgoff,
            );
            repaired[i] = true;
        }
    }

    // Fold each repaired run back into one mapping. Only runs involving a
    // repaired fragment are touched here; general coalescing is
    // combine_mappings' job.
    let mut out: Vec<PerfEvent> = Vec::with_capacity(n);
    let mut out_repaired: Vec<bool> = Vec::with_capacity(n);
    let mut last_mmap: Option<usize> = None;
    for (i, ev) in events.drain(..).enumerate() {
        let Some(cur) = mmap_fields(&ev) else {
            out.push(ev);
            out_repaired.push(false);
            continue;
        };
        if let Some(j) = last_mmap {
            let prev = mmap_fields(&out[j]).unwrap();
            if (repaired[i] || out_repaired[j]) && is_coalescable(&prev, &cur) {
                out[j].mmap_event_mut().unwrap().len += cur.len;
                out_repaired[j] = out_repaired[j] || repaired[i];
                continue;
            }
        }
        out.push(ev);
        out_repaired.push(repaired[i]);
        last_mmap = Some(out.len() - 1);
    }
    *events = out;
}

/// Merges contiguous same-file mappings the kernel emitted as separate
/// records. Records the pass does not merge keep their order.
pub fn combine_mappings(events: &mut Vec<PerfEvent>) {
    let mut out: Vec<PerfEvent> = Vec::with_capacity(events.len());
    let mut last_mmap: Option<usize> = None;
    for ev in events.drain(..) {
        let Some(cur) = mmap_fields(&ev) else {
            out.push(ev);
            continue;
        };
        if let Some(j) = last_mmap {
            let prev = mmap_fields(&out[j]).unwrap();
            if is_coalescable(&prev, &cur) {
                log::debug!(
                    "combining mapping [{:#x}, {:#x}) into its predecessor",
                    cur.start,
                    cur.start.wrapping_add(cur.len),
                );
                out[j].mmap_event_mut().unwrap().len += cur.len;
                continue;
            }
        }
        out.push(ev);
        last_mmap = Some(out.len() - 1);
    }
    *events = out;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::{CommEvent, MmapEvent, PerfEvent};

    fn file_mmap(start: u64, len: u64, pgoff: u64, filename: &str) -> PerfEvent {
        PerfEvent::mmap(MmapEvent {
            pid: 5,
            tid: 5,
            start,
            len,
            pgoff,
            filename: filename.into(),
            ..Default::default()
        })
    }

    fn anon_mmap(start: u64, len: u64) -> PerfEvent {
        file_mmap(start, len, 0, "//anon")
    }

    fn mmap_of(events: &[PerfEvent], i: usize) -> &MmapEvent {
        events[i].mmap_event().unwrap()
    }

    #[test]
    fn forward_deduction_extends_file_mapping() {
        let mut events = vec![
            file_mmap(0x200000, 0x200000, 0, "/opt/app"),
            anon_mmap(0x400000, 0x200000),
        ];
        deduce_huge_pages(&mut events);
        assert_eq!(events.len(), 1);
        let m = mmap_of(&events, 0);
        assert_eq!((m.start, m.len, m.pgoff), (0x200000, 0x400000, 0));
        assert_eq!(m.filename, "/opt/app");
    }

    #[test]
    fn backward_deduction_fills_leading_fragment() {
        let mut events = vec![
            anon_mmap(0x200000, 0x200000),
            file_mmap(0x400000, 0x100000, 0x200000, "/opt/app"),
        ];
        deduce_huge_pages(&mut events);
        assert_eq!(events.len(), 1);
        let m = mmap_of(&events, 0);
        assert_eq!((m.start, m.len, m.pgoff), (0x200000, 0x300000, 0));
        assert_eq!(m.filename, "/opt/app");
    }

    #[test]
    fn chained_fragments_deduce_through_each_other() {
        let mut events = vec![
            anon_mmap(0x200000, 0x200000),
            anon_mmap(0x400000, 0x200000),
            file_mmap(0x600000, 0x100000, 0x400000, "/opt/app"),
        ];
        deduce_huge_pages(&mut events);
        assert_eq!(events.len(), 1);
        let m = mmap_of(&events, 0);
        assert_eq!((m.start, m.len, m.pgoff), (0x200000, 0x500000, 0));
    }

    #[test]
    fn unrelated_anon_mapping_is_left_alone() {
        let mut events = vec![
            file_mmap(0x200000, 0x200000, 0, "/opt/app"),
            // Not contiguous with the file mapping.
            anon_mmap(0x800000, 0x200000),
        ];
        deduce_huge_pages(&mut events);
        assert_eq!(events.len(), 2);
        assert_eq!(mmap_of(&events, 1).filename, "//anon");
    }

    #[test]
    fn anon_hugepage_form_is_recognized() {
        let mut events = vec![
            file_mmap(0x200000, 0x200000, 0, "/opt/app"),
            file_mmap(0x400000, 0x200000, 0, "/anon_hugepage (deleted)"),
        ];
        deduce_huge_pages(&mut events);
        assert_eq!(events.len(), 1);
        assert_eq!(mmap_of(&events, 0).len, 0x400000);
    }

    #[test]
    fn deduce_does_not_merge_untouched_mappings() {
        // Contiguous same-file mappings, but nothing huge-page-ish about
        // them: that merge belongs to combine_mappings.
        let mut events = vec![
            file_mmap(0x1000, 0x1000, 0, "/bin/x"),
            file_mmap(0x2000, 0x1000, 0x1000, "/bin/x"),
        ];
        deduce_huge_pages(&mut events);
        assert_eq!(events.len(), 2);
    }

    #[test]
    fn combine_merges_contiguous_same_file_mappings() {
        let mut events = vec![
            file_mmap(0x1000, 0x1000, 0, "/bin/x"),
            file_mmap(0x2000, 0x1000, 0x1000, "/bin/x"),
        ];
        combine_mappings(&mut events);
        assert_eq!(events.len(), 1);
        let m = mmap_of(&events, 0);
        assert_eq!((m.start, m.len, m.pgoff), (0x1000, 0x2000, 0));
    }

    #[test]
    fn combine_skips_discontiguous_offsets() {
        let mut events = vec![
            file_mmap(0x1000, 0x1000, 0, "/bin/x"),
            // Address-contiguous but the file offset jumps.
            file_mmap(0x2000, 0x1000, 0x5000, "/bin/x"),
        ];
        combine_mappings(&mut events);
        assert_eq!(events.len(), 2);
    }

    #[test]
    fn combine_requires_matching_device_identity() {
        let a = PerfEvent::mmap2(MmapEvent {
            pid: 5,
            tid: 5,
            start: 0x1000,
            len: 0x1000,
            pgoff: 0,
            maj: 8,
            min: 1,
            ino: 42,
            filename: "/bin/x".into(),
        });
        let b = PerfEvent::mmap2(MmapEvent {
            pid: 5,
            tid: 5,
            start: 0x2000,
            len: 0x1000,
            pgoff: 0x1000,
            maj: 8,
            min: 2,
            ino: 42,
            filename: "/bin/x".into(),
        });
        let mut events = vec![a, b];
        combine_mappings(&mut events);
        assert_eq!(events.len(), 2);
    }

    #[test]
    fn combine_reaches_across_non_mmap_records() {
        let mut events = vec![
            file_mmap(0x1000, 0x1000, 0, "/bin/x"),
            PerfEvent::comm(CommEvent {
                pid: 5,
                tid: 5,
                comm: "x".into(),
            }),
            file_mmap(0x2000, 0x1000, 0x1000, "/bin/x"),
        ];
        combine_mappings(&mut events);
        assert_eq!(events.len(), 2);
        assert_eq!(mmap_of(&events, 0).len, 0x2000);
        assert!(events[1].comm_event().is_some());
    }

    #[test]
    fn combine_keeps_different_pids_apart() {
        let mut a = file_mmap(0x1000, 0x1000, 0, "/bin/x");
        a.mmap_event_mut().unwrap().pid = 1;
        let mut events = vec![a, file_mmap(0x2000, 0x1000, 0x1000, "/bin/x")];
        combine_mappings(&mut events);
        assert_eq!(events.len(), 2);
    }
}
