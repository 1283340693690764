//! Trace file loading

use crate::dispatch::{EventDispatcher, EventError, EventKind, RawEvent};
use calltree::{SampleList, SampleListBuilder, Timestamp};
use gcheap::{Address, DotNetHeapInfo, GcHeapSegment, RecordError};
use log::{debug, info, warn};
use serde::Deserialize;
use std::{
    fs::File,
    io::{self, BufReader, Read},
    path::{Path, PathBuf},
    str::FromStr,
};
use strum::IntoEnumIterator;
use thiserror::Error;

/// Contents of a JSON trace file
#[derive(Clone, Debug, Default, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct TraceFile {
    /// Recorded events
    #[serde(default)]
    pub events: Vec<RawEvent>,

    /// Longest time span that one sample may cover in a histogram (ms)
    #[serde(default)]
    pub max_bucket_width: Option<Timestamp>,

    /// Layout of the GC heap, if it was recorded
    #[serde(default)]
    pub heap_segments: Option<Vec<SegmentDesc>>,
}
//
impl TraceFile {
    /// Turn the events of some kinds into samples
    ///
    /// If `kinds` is empty, every kind of event is used.
    ///
    pub fn ingest(&self, kinds: &[EventKind]) -> Result<LoadedTrace, LoadError> {
        let all_kinds;
        let kinds = if kinds.is_empty() {
            all_kinds = EventKind::iter().collect::<Vec<_>>();
            &all_kinds[..]
        } else {
            kinds
        };
        let mut dispatcher = EventDispatcher::with_default_handlers(kinds, self.max_bucket_width);
        let mut samples = SampleListBuilder::new();
        for (index, event) in self.events.iter().enumerate() {
            dispatcher
                .dispatch(event, &mut samples)
                .map_err(|source| LoadError::BadEvent {
                    index,
                    kind: event.kind(),
                    source,
                })?;
        }

        debug!("Trace ingestion statistics:");
        let mut skipped = 0;
        for kind in EventKind::iter() {
            let stats = dispatcher.stats(kind);
            if stats.handled + stats.skipped > 0 {
                debug!(
                    "- {kind} events: {} handled, {} skipped",
                    stats.handled, stats.skipped
                );
            }
            skipped += stats.skipped;
        }
        if skipped > 0 {
            warn!("Skipped {skipped} events of unselected kinds");
        }

        let heap = match &self.heap_segments {
            Some(segments) => DotNetHeapInfo::with_segments(
                segments.iter().map(GcHeapSegment::from).collect::<Vec<_>>(),
            ),
            None => DotNetHeapInfo::new(),
        };
        Ok(LoadedTrace {
            samples: samples.build(),
            heap,
        })
    }
}
//
impl FromStr for TraceFile {
    type Err = LoadError;

    fn from_str(s: &str) -> Result<Self, LoadError> {
        Ok(serde_json::from_str(s)?)
    }
}

/// Description of a GC heap segment in a trace file
///
/// Traces which predate the fifth generation do not specify `gen4_end`, which
/// then defaults to the start of the segment.
///
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct SegmentDesc {
    /// First address of the segment
    pub start: Address,

    /// Address past the end of the segment
    pub end: Address,

    /// End of generation 0
    pub gen0_end: Address,

    /// End of generation 1
    pub gen1_end: Address,

    /// End of generation 2
    pub gen2_end: Address,

    /// End of generation 3
    pub gen3_end: Address,

    /// End of generation 4
    #[serde(default)]
    pub gen4_end: Option<Address>,
}
//
impl From<&SegmentDesc> for GcHeapSegment {
    fn from(desc: &SegmentDesc) -> Self {
        Self {
            start: desc.start,
            end: desc.end,
            gen0_end: desc.gen0_end,
            gen1_end: desc.gen1_end,
            gen2_end: desc.gen2_end,
            gen3_end: desc.gen3_end,
            gen4_end: desc.gen4_end.unwrap_or(desc.start),
        }
    }
}

/// Trace whose events were turned into samples
#[derive(Clone, Debug)]
pub struct LoadedTrace {
    /// Samples, ready for call tree building
    pub samples: SampleList,

    /// GC heap layout
    pub heap: DotNetHeapInfo,
}

/// Load a JSON trace file and turn the events of some kinds into samples
///
/// If `kinds` is empty, every kind of event is used.
///
pub fn load_trace(path: &Path, kinds: &[EventKind]) -> Result<LoadedTrace, LoadError> {
    info!("Loading trace file {}...", path.display());
    let file = File::open(path).map_err(|source| LoadError::Io {
        path: path.to_owned(),
        source,
    })?;
    let trace: TraceFile = serde_json::from_reader(BufReader::new(file))?;
    let loaded = trace.ingest(kinds)?;
    info!("Loaded {} samples", loaded.samples.len());
    Ok(loaded)
}

/// Load a GC heap layout
///
/// This can be either a binary heap segment record or a JSON trace file with
/// a `heap_segments` entry.
///
pub fn load_heap(path: &Path) -> Result<DotNetHeapInfo, LoadError> {
    let io_error = |source| LoadError::Io {
        path: path.to_owned(),
        source,
    };
    let mut file = BufReader::new(File::open(path).map_err(io_error)?);
    let mut contents = Vec::new();
    file.read_to_end(&mut contents).map_err(io_error)?;
    if contents.starts_with(gcheap::record::MAGIC) {
        debug!("Reading binary heap segment record {}", path.display());
        Ok(DotNetHeapInfo::from_reader(&mut &contents[..])?)
    } else {
        debug!("Reading heap segments from trace file {}", path.display());
        let trace: TraceFile = serde_json::from_slice(&contents)?;
        let segments = trace.heap_segments.ok_or(LoadError::NoHeapSegments)?;
        Ok(DotNetHeapInfo::with_segments(
            segments.iter().map(GcHeapSegment::from).collect::<Vec<_>>(),
        ))
    }
}

/// What can go wrong while loading a trace
#[derive(Debug, Error)]
pub enum LoadError {
    /// Failed to read a file
    #[error("failed to read {path} ({source})")]
    Io {
        /// File that could not be read
        path: PathBuf,

        /// Underlying I/O error
        #[source]
        source: io::Error,
    },

    /// Failed to parse a JSON trace file
    #[error("failed to parse trace file ({0})")]
    Json(#[from] serde_json::Error),

    /// An event could not be turned into samples
    #[error("failed to process {kind} event #{index} ({source})")]
    BadEvent {
        /// Position of the event in the trace file
        index: usize,

        /// Kind of event
        kind: EventKind,

        /// What is wrong with the event
        #[source]
        source: EventError,
    },

    /// Failed to decode a binary heap segment record
    #[error("failed to read heap segment record ({0})")]
    Record(#[from] RecordError),

    /// The trace file does not describe the GC heap
    #[error("trace file has no heap_segments entry")]
    NoHeapSegments,
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use calltree::SampleSource;
    use gcheap::Generation;
    use pretty_assertions::assert_eq;
    use std::io::Write;

    const TRACE: &str = r#"{
        "events": [
            {"kind": "cpu", "stack": ["main", "work"], "time": 0, "weight": 3},
            {"kind": "alloc", "stack": ["main"], "time": 5, "type": "Foo", "size": 128},
            {"kind": "contention", "stack": ["main", "lock"], "time": 10, "duration": 30}
        ],
        "max_bucket_width": 20,
        "heap_segments": [
            {"start": 0, "end": 1000, "gen0_end": 1000, "gen1_end": 800,
             "gen2_end": 600, "gen3_end": 400, "gen4_end": 100}
        ]
    }"#;

    fn trace_file(contents: &[u8]) -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(contents).unwrap();
        file
    }

    #[test]
    fn ingest_all_kinds() {
        let trace = TraceFile::from_str(TRACE).unwrap();
        assert_eq!(trace.events.len(), 3);
        assert_eq!(trace.max_bucket_width, Some(20.0));

        let loaded = trace.ingest(&[]).unwrap();
        let metrics = loaded
            .samples
            .as_slice()
            .iter()
            .map(|sample| sample.metric)
            .collect::<Vec<_>>();
        assert_eq!(metrics, [3.0, 128.0, 20.0, 10.0]);
        let names = loaded
            .samples
            .stacks()
            .frame_names(loaded.samples.as_slice()[1].stack);
        assert_eq!(names, ["main", "Type Foo"]);
        assert_eq!(loaded.heap.generation_for(450).unwrap(), Some(Generation::Gen2));
    }

    #[test]
    fn ingest_selected_kinds() {
        let trace = TraceFile::from_str(TRACE).unwrap();
        let loaded = trace.ingest(&[EventKind::Cpu, EventKind::Exception]).unwrap();
        assert_eq!(loaded.samples.len(), 1);
        assert_eq!(loaded.samples.as_slice()[0].metric, 3.0);
    }

    #[test]
    fn missing_heap() {
        let trace = TraceFile::from_str(r#"{"events": []}"#).unwrap();
        let loaded = trace.ingest(&[]).unwrap();
        assert!(loaded.samples.is_empty());
        assert!(loaded.heap.generation_for(0).is_err());
    }

    #[test]
    fn bad_inputs() {
        assert_matches!(TraceFile::from_str("{"), Err(LoadError::Json(_)));
        assert_matches!(
            TraceFile::from_str(r#"{"events": [], "frobnicate": 1}"#),
            Err(LoadError::Json(_))
        );
        let trace = TraceFile::from_str(
            r#"{"events": [
                {"kind": "cpu", "stack": ["main"], "time": 0},
                {"kind": "contention", "stack": ["main"], "time": 0, "duration": -5}
            ]}"#,
        )
        .unwrap();
        assert_matches!(
            trace.ingest(&[]),
            Err(LoadError::BadEvent {
                index: 1,
                kind: EventKind::Contention,
                source: EventError::InvalidDuration(_)
            })
        );
        assert_matches!(
            load_trace(Path::new("/this/file/does/not/exist.json"), &[]),
            Err(LoadError::Io { .. })
        );
    }

    #[test]
    fn load_from_disk() {
        let file = trace_file(TRACE.as_bytes());
        let loaded = load_trace(file.path(), &[EventKind::Alloc]).unwrap();
        assert_eq!(loaded.samples.len(), 1);

        let heap = load_heap(file.path()).unwrap();
        assert_eq!(heap.generation_for(50).unwrap(), Some(Generation::Gen4));
    }

    #[test]
    fn load_binary_heap() {
        let segments = [GcHeapSegment {
            start: 0x1000,
            end: 0x2000,
            gen0_end: 0x2000,
            gen1_end: 0x1800,
            gen2_end: 0x1400,
            gen3_end: 0x1000,
            gen4_end: 0x1000,
        }];
        let mut record = Vec::new();
        DotNetHeapInfo::with_segments(segments.to_vec())
            .write_to(&mut record)
            .unwrap();
        let file = trace_file(&record);
        let heap = load_heap(file.path()).unwrap();
        assert_eq!(heap.segments(), Some(&segments[..]));
        assert_eq!(heap.generation_for(0x1900).unwrap(), Some(Generation::Gen0));
        assert_eq!(heap.generation_for(0x3000).unwrap(), None);

        let no_heap = trace_file(br#"{"events": []}"#);
        assert_matches!(load_heap(no_heap.path()), Err(LoadError::NoHeapSegments));
    }
}
