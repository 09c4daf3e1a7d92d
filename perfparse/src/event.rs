//! Decoded perf records.
//!
//! These are the shapes the external capture decoder hands us: one
//! [PerfEvent] per kernel-emitted record, already byte-swapped and pulled
//! apart. Only the payloads the parser consumes are modeled; everything
//! else (LOST, THROTTLE, user-level records, ...) is carried as
//! [EventPayload::Other] so that record order and counts survive a parse
//! untouched.

/// Kernel-emitted record types, as in `perf_event.h`.
pub const PERF_RECORD_MMAP: u32 = 1;
pub const PERF_RECORD_LOST: u32 = 2;
pub const PERF_RECORD_COMM: u32 = 3;
pub const PERF_RECORD_EXIT: u32 = 4;
pub const PERF_RECORD_THROTTLE: u32 = 5;
pub const PERF_RECORD_UNTHROTTLE: u32 = 6;
pub const PERF_RECORD_FORK: u32 = 7;
pub const PERF_RECORD_SAMPLE: u32 = 9;
pub const PERF_RECORD_MMAP2: u32 = 10;
pub const PERF_RECORD_AUX: u32 = 11;
pub const PERF_RECORD_ITRACE_START: u32 = 12;
pub const PERF_RECORD_LOST_SAMPLES: u32 = 13;
pub const PERF_RECORD_SWITCH: u32 = 14;
pub const PERF_RECORD_SWITCH_CPU_WIDE: u32 = 15;
pub const PERF_RECORD_NAMESPACES: u32 = 16;
pub const PERF_RECORD_CGROUP: u32 = 19;

/// Synthetic record types emitted by the perf tool itself rather than the
/// kernel.
pub const PERF_RECORD_USER_TYPE_START: u32 = 64;
pub const PERF_RECORD_FINISHED_ROUND: u32 = 68;
pub const PERF_RECORD_AUXTRACE_INFO: u32 = 70;
pub const PERF_RECORD_AUXTRACE: u32 = 71;
pub const PERF_RECORD_AUXTRACE_ERROR: u32 = 72;
pub const PERF_RECORD_THREAD_MAP: u32 = 73;
pub const PERF_RECORD_STAT_CONFIG: u32 = 75;
pub const PERF_RECORD_STAT: u32 = 76;
pub const PERF_RECORD_STAT_ROUND: u32 = 77;
pub const PERF_RECORD_TIME_CONV: u32 = 79;

/// Bits of the header `misc` field identifying the cpu mode of a record.
pub const PERF_RECORD_MISC_CPUMODE_MASK: u16 = 0x7;
pub const PERF_RECORD_MISC_KERNEL: u16 = 0x1;
pub const PERF_RECORD_MISC_USER: u16 = 0x2;

/// Callchain context markers. The kernel interleaves these with real
/// instruction pointers to flag transitions between cpu modes; anything at
/// or above [PERF_CONTEXT_MAX] is a marker, not an address.
pub const PERF_CONTEXT_HV: u64 = -32i64 as u64;
pub const PERF_CONTEXT_KERNEL: u64 = -128i64 as u64;
pub const PERF_CONTEXT_USER: u64 = -512i64 as u64;
pub const PERF_CONTEXT_GUEST_KERNEL: u64 = -2176i64 as u64;
pub const PERF_CONTEXT_GUEST_USER: u64 = -2560i64 as u64;
pub const PERF_CONTEXT_MAX: u64 = -4095i64 as u64;

/// Set on a callchain entry whose address could not be resolved to any
/// mapping, so that downstream consumers can tell a raw leftover address
/// from a remapped one. Real kernel addresses on x86 and ARM have the top
/// 16 bits set and PowerPC reserves 0x1000000000000000..0xBFFFFFFFFFFFFFFF,
/// so the bit cannot collide with a mappable address, and remapped
/// addresses are far too small to reach it.
pub const CALLCHAIN_UNMAPPED_BIT: u64 = 1 << 63;

/// Returns a printable name for a record type.
pub fn record_type_name(type_: u32) -> &'static str {
    match type_ {
        PERF_RECORD_MMAP => "MMAP",
        PERF_RECORD_LOST => "LOST",
        PERF_RECORD_COMM => "COMM",
        PERF_RECORD_EXIT => "EXIT",
        PERF_RECORD_THROTTLE => "THROTTLE",
        PERF_RECORD_UNTHROTTLE => "UNTHROTTLE",
        PERF_RECORD_FORK => "FORK",
        PERF_RECORD_SAMPLE => "SAMPLE",
        PERF_RECORD_MMAP2 => "MMAP2",
        PERF_RECORD_AUX => "AUX",
        PERF_RECORD_ITRACE_START => "ITRACE_START",
        PERF_RECORD_LOST_SAMPLES => "LOST_SAMPLES",
        PERF_RECORD_SWITCH => "SWITCH",
        PERF_RECORD_SWITCH_CPU_WIDE => "SWITCH_CPU_WIDE",
        PERF_RECORD_NAMESPACES => "NAMESPACES",
        PERF_RECORD_CGROUP => "CGROUP",
        PERF_RECORD_FINISHED_ROUND => "FINISHED_ROUND",
        PERF_RECORD_AUXTRACE_INFO => "AUXTRACE_INFO",
        PERF_RECORD_AUXTRACE => "AUXTRACE",
        PERF_RECORD_AUXTRACE_ERROR => "AUXTRACE_ERROR",
        PERF_RECORD_THREAD_MAP => "THREAD_MAP",
        PERF_RECORD_STAT_CONFIG => "STAT_CONFIG",
        PERF_RECORD_STAT => "STAT",
        PERF_RECORD_STAT_ROUND => "STAT_ROUND",
        PERF_RECORD_TIME_CONV => "TIME_CONV",
        _ => "UNKNOWN",
    }
}

/// The type and misc flags of a record, as carried on the wire.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct EventHeader {
    pub type_: u32,
    pub misc: u16,
}

/// One decoded record.
#[derive(Clone, Debug, PartialEq)]
pub struct PerfEvent {
    header: EventHeader,
    /// Record timestamp, when the capture's sample format included one.
    /// FINISHED_ROUND records never carry a timestamp.
    timestamp: Option<u64>,
    payload: EventPayload,
}

#[derive(Clone, Debug, PartialEq)]
pub enum EventPayload {
    Sample(SampleEvent),
    Mmap(MmapEvent),
    Comm(CommEvent),
    Fork(ForkEvent),
    /// EXIT records share the FORK payload layout.
    Exit(ForkEvent),
    /// Any record whose payload the parser does not consume.
    Other,
}

/// A performance sample: the sampled instruction pointer plus the optional
/// data address, call chain, and branch stack that the event's sample
/// format requested.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct SampleEvent {
    pub pid: u32,
    pub tid: u32,
    pub ip: u64,
    /// Sampled data address; zero when the sample has none.
    pub addr: u64,
    pub callchain: Vec<u64>,
    pub branch_stack: Vec<BranchStackEntry>,
}

/// One last-branch-record entry of a sample's branch stack.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct BranchStackEntry {
    pub from_ip: u64,
    pub to_ip: u64,
    pub mispredicted: bool,
    pub predicted: bool,
    pub in_transaction: bool,
    pub abort: bool,
    pub cycles: u32,
}

impl BranchStackEntry {
    /// The hardware pads unused branch-stack slots with all-zero entries.
    pub fn is_null(&self) -> bool {
        self.from_ip == 0 && self.to_ip == 0
    }
}

/// A new virtual-memory mapping. `maj`, `min` and `ino` are only populated
/// for MMAP2 records; plain MMAP leaves them zero.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct MmapEvent {
    pub pid: u32,
    pub tid: u32,
    pub start: u64,
    pub len: u64,
    pub pgoff: u64,
    pub maj: u32,
    pub min: u32,
    pub ino: u64,
    pub filename: String,
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct CommEvent {
    pub pid: u32,
    pub tid: u32,
    pub comm: String,
}

/// FORK and EXIT records: the affected (pid, tid) and its parent.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct ForkEvent {
    pub pid: u32,
    pub tid: u32,
    pub ppid: u32,
    pub ptid: u32,
}

impl PerfEvent {
    pub fn new(header: EventHeader, payload: EventPayload) -> Self {
        Self {
            header,
            timestamp: None,
            payload,
        }
    }

    pub fn sample(sample: SampleEvent) -> Self {
        Self::new(
            EventHeader {
                type_: PERF_RECORD_SAMPLE,
                misc: PERF_RECORD_MISC_USER,
            },
            EventPayload::Sample(sample),
        )
    }

    pub fn mmap(mmap: MmapEvent) -> Self {
        Self::new(
            EventHeader {
                type_: PERF_RECORD_MMAP,
                misc: PERF_RECORD_MISC_USER,
            },
            EventPayload::Mmap(mmap),
        )
    }

    pub fn mmap2(mmap: MmapEvent) -> Self {
        Self::new(
            EventHeader {
                type_: PERF_RECORD_MMAP2,
                misc: PERF_RECORD_MISC_USER,
            },
            EventPayload::Mmap(mmap),
        )
    }

    pub fn comm(comm: CommEvent) -> Self {
        Self::new(
            EventHeader {
                type_: PERF_RECORD_COMM,
                misc: 0,
            },
            EventPayload::Comm(comm),
        )
    }

    pub fn fork(fork: ForkEvent) -> Self {
        Self::new(
            EventHeader {
                type_: PERF_RECORD_FORK,
                misc: 0,
            },
            EventPayload::Fork(fork),
        )
    }

    pub fn exit(exit: ForkEvent) -> Self {
        Self::new(
            EventHeader {
                type_: PERF_RECORD_EXIT,
                misc: 0,
            },
            EventPayload::Exit(exit),
        )
    }

    /// A payload-less record of the given type.
    pub fn other(type_: u32) -> Self {
        Self::new(EventHeader { type_, misc: 0 }, EventPayload::Other)
    }

    pub fn with_misc(mut self, misc: u16) -> Self {
        self.header.misc = misc;
        self
    }

    pub fn with_timestamp(mut self, timestamp: u64) -> Self {
        self.timestamp = Some(timestamp);
        self
    }

    pub fn header(&self) -> EventHeader {
        self.header
    }

    pub fn timestamp(&self) -> Option<u64> {
        self.timestamp
    }

    pub fn payload(&self) -> &EventPayload {
        &self.payload
    }

    pub fn sample_event(&self) -> Option<&SampleEvent> {
        match &self.payload {
            EventPayload::Sample(s) => Some(s),
            _ => None,
        }
    }

    pub fn sample_event_mut(&mut self) -> Option<&mut SampleEvent> {
        match &mut self.payload {
            EventPayload::Sample(s) => Some(s),
            _ => None,
        }
    }

    pub fn mmap_event(&self) -> Option<&MmapEvent> {
        match &self.payload {
            EventPayload::Mmap(m) => Some(m),
            _ => None,
        }
    }

    pub fn mmap_event_mut(&mut self) -> Option<&mut MmapEvent> {
        match &mut self.payload {
            EventPayload::Mmap(m) => Some(m),
            _ => None,
        }
    }

    pub fn comm_event(&self) -> Option<&CommEvent> {
        match &self.payload {
            EventPayload::Comm(c) => Some(c),
            _ => None,
        }
    }

    pub fn fork_event(&self) -> Option<&ForkEvent> {
        match &self.payload {
            EventPayload::Fork(f) | EventPayload::Exit(f) => Some(f),
            _ => None,
        }
    }
}
