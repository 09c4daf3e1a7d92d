use thiserror::Error;

/// A fatal parse failure. Per-sample mapping misses are not errors; they
/// only lower the mapping ratio, which is checked at the end of the parse.
#[derive(Debug, Error)]
pub enum ParseError {
    /// A kernel record type this parser does not know about.
    #[error("unknown record type {0}")]
    UnknownRecordType(u32),
    /// A record whose payload does not match its header type.
    #[error("record {index} payload does not match its header type")]
    CorruptRecord { index: usize },
    /// The address mapper could not reconcile an MMAP with the existing
    /// address-space layout.
    #[error("cannot map MMAP region: {0}")]
    Mmap(#[from] addrmap::MapError),
    /// An MMAP start address vanished from its own mapper under remap.
    #[error("no mapping found for remapped MMAP start {start:#x}")]
    RemapLookupFailed { start: u64 },
    /// A remapped MMAP start landed on a different page offset than the
    /// real address.
    #[error("remapped address {remapped:#x} does not share a page offset with {addr:#x}")]
    RemapMisaligned { addr: u64, remapped: u64 },
    /// A mapper range's id does not point at an MMAP record.
    #[error("mapping id {id} does not refer to an MMAP record")]
    BadMappingId { id: u64 },
    #[error("branch stack has a non-null entry after a null entry")]
    MalformedBranchStack,
    #[error("input has no sample events")]
    NoSamples,
    #[error(
        "only {mapped} of {total} samples mapped ({percentage:.0}%), expected at least {threshold:.0}%"
    )]
    LowMappingRatio {
        mapped: u64,
        total: u64,
        percentage: f64,
        threshold: f64,
    },
    #[error("failed to inject build ids into reader: {0}")]
    InjectBuildIds(#[source] std::io::Error),
}
