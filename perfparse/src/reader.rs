//! The contract between the parser and the capture decoder.

use crate::event::{PerfEvent, PERF_RECORD_SAMPLE};
use std::collections::{HashMap, HashSet};
use std::io;

/// What the parser needs from whatever decoded the capture.
///
/// The decoder owns the record list; the parser reads it, may rewrite
/// addresses in place, and may reorder or drop records when configured to
/// discard unused MMAPs. Build-id exchange goes both ways: the capture may
/// already carry filename→build-id pairs, and build-ids discovered after
/// the parse are handed back for re-serialization.
pub trait EventReader {
    fn events(&self) -> &[PerfEvent];

    fn events_mut(&mut self) -> &mut Vec<PerfEvent>;

    /// Sort records into time order if they are not already.
    fn maybe_sort_events_by_time(&mut self);

    /// The filename→build-id pairs the capture itself carried.
    fn filenames_to_build_ids(&self) -> HashMap<String, String>;

    /// Record build-ids discovered after parsing, so they survive
    /// re-serialization.
    fn inject_build_ids(&mut self, build_ids: HashMap<String, String>) -> io::Result<()>;

    /// Record types the decoder was told to drop when serializing. A
    /// capture with zero samples is only an error if SAMPLE is not in this
    /// set.
    fn event_types_to_skip_when_serializing(&self) -> &HashSet<u32>;
}

/// An [EventReader] over records already decoded into memory. Used by the
/// integration tests, and by embedders whose decoder produces a plain
/// record vector.
#[derive(Debug, Default)]
pub struct InMemoryReader {
    events: Vec<PerfEvent>,
    build_ids: HashMap<String, String>,
    skip_when_serializing: HashSet<u32>,
}

impl InMemoryReader {
    pub fn new(events: Vec<PerfEvent>) -> Self {
        Self {
            events,
            build_ids: HashMap::new(),
            skip_when_serializing: HashSet::new(),
        }
    }

    pub fn with_build_ids(mut self, build_ids: HashMap<String, String>) -> Self {
        self.build_ids = build_ids;
        self
    }

    /// Marks SAMPLE as a type the capture deliberately dropped.
    pub fn skipping_samples(mut self) -> Self {
        self.skip_when_serializing.insert(PERF_RECORD_SAMPLE);
        self
    }

    pub fn build_ids(&self) -> &HashMap<String, String> {
        &self.build_ids
    }
}

impl EventReader for InMemoryReader {
    fn events(&self) -> &[PerfEvent] {
        &self.events
    }

    fn events_mut(&mut self) -> &mut Vec<PerfEvent> {
        &mut self.events
    }

    fn maybe_sort_events_by_time(&mut self) {
        // Stable, so records without timestamps (and FINISHED_ROUND
        // boundaries) keep their relative positions.
        self.events.sort_by_key(|e| e.timestamp().unwrap_or(0));
    }

    fn filenames_to_build_ids(&self) -> HashMap<String, String> {
        self.build_ids.clone()
    }

    fn inject_build_ids(&mut self, build_ids: HashMap<String, String>) -> io::Result<()> {
        self.build_ids.extend(build_ids);
        Ok(())
    }

    fn event_types_to_skip_when_serializing(&self) -> &HashSet<u32> {
        &self.skip_when_serializing
    }
}
