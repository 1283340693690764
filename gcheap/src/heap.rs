//! Generation lookup over the segments of a heap dump

use crate::{
    segment::{GcHeapSegment, Generation},
    Address,
};
use log::debug;
use std::sync::atomic::{AtomicUsize, Ordering};
use thiserror::Error;

/// Segments of a managed heap dump
///
/// The segment list is fixed once loaded. Lookups remember the last segment
/// that matched, so that repeated lookups of nearby addresses do not need to
/// scan the segment list. That memory is only an accelerator: it never
/// affects lookup results, and it is safe to share this struct between
/// threads.
///
#[derive(Debug, Default)]
pub struct DotNetHeapInfo {
    /// Heap segments, if they were loaded
    segments: Option<Box<[GcHeapSegment]>>,

    /// Total size of all segments in bytes
    size_of_all_segments: u64,

    /// Index of the segment which the last successful lookup landed in
    last_segment: AtomicUsize,
}
//
impl DotNetHeapInfo {
    /// Set up heap information without any segment
    ///
    /// Generation lookups will fail until segments are provided via
    /// [`with_segments()`](Self::with_segments).
    ///
    pub fn new() -> Self {
        Self::default()
    }

    /// Set up heap information from a list of segments
    pub fn with_segments(segments: impl Into<Box<[GcHeapSegment]>>) -> Self {
        let segments = segments.into();
        let size_of_all_segments = segments.iter().map(GcHeapSegment::size).sum();
        debug!(
            "Loaded {} heap segments covering {size_of_all_segments} bytes",
            segments.len()
        );
        Self {
            segments: Some(segments),
            size_of_all_segments,
            last_segment: AtomicUsize::new(0),
        }
    }

    /// Heap segments, if they were loaded
    pub fn segments(&self) -> Option<&[GcHeapSegment]> {
        self.segments.as_deref()
    }

    /// Total size of all segments in bytes
    pub fn size_of_all_segments(&self) -> u64 {
        self.size_of_all_segments
    }

    /// Segment which an address belongs to, if any
    pub fn segment_for(&self, address: Address) -> Result<Option<&GcHeapSegment>, HeapInfoError> {
        let segments = self
            .segments
            .as_deref()
            .ok_or(HeapInfoError::SegmentsNotLoaded)?;

        // Fast path: same segment as the previous lookup
        let last = self.last_segment.load(Ordering::Relaxed);
        if let Some(segment) = segments.get(last).filter(|s| s.contains(address)) {
            return Ok(Some(segment));
        }

        // Slow path: scan every segment
        let found = segments
            .iter()
            .enumerate()
            .find(|(_, segment)| segment.contains(address));
        Ok(found.map(|(idx, segment)| {
            self.last_segment.store(idx, Ordering::Relaxed);
            segment
        }))
    }

    /// Generation which an address belongs to
    ///
    /// Returns `Ok(None)` if no segment contains the address.
    ///
    pub fn generation_for(&self, address: Address) -> Result<Option<Generation>, HeapInfoError> {
        Ok(self
            .segment_for(address)?
            .and_then(|segment| segment.generation_for(address)))
    }
}
//
impl Clone for DotNetHeapInfo {
    fn clone(&self) -> Self {
        Self {
            segments: self.segments.clone(),
            size_of_all_segments: self.size_of_all_segments,
            last_segment: AtomicUsize::new(self.last_segment.load(Ordering::Relaxed)),
        }
    }
}

/// What can go wrong while looking up heap addresses
#[derive(Clone, Copy, Debug, Eq, Error, PartialEq)]
pub enum HeapInfoError {
    /// No segment list was loaded
    #[error("heap segments were not loaded")]
    SegmentsNotLoaded,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::segment::tests::nested_segment;
    use assert_matches::assert_matches;
    use pretty_assertions::assert_eq;
    use proptest::prelude::*;

    fn two_segments() -> DotNetHeapInfo {
        DotNetHeapInfo::with_segments(vec![
            nested_segment(),
            GcHeapSegment {
                start: 5000,
                end: 6000,
                gen0_end: 6000,
                gen1_end: 5500,
                gen2_end: 5000,
                gen3_end: 5000,
                gen4_end: 5000,
            },
        ])
    }

    #[test]
    fn not_loaded() {
        let heap = DotNetHeapInfo::new();
        assert_eq!(heap.segments(), None);
        assert_eq!(heap.size_of_all_segments(), 0);
        assert_matches!(heap.generation_for(42), Err(HeapInfoError::SegmentsNotLoaded));
    }

    #[test]
    fn lookup() {
        let heap = two_segments();
        assert_eq!(heap.size_of_all_segments(), 2000);
        assert_eq!(heap.generation_for(50), Ok(Some(Generation::Gen4)));
        assert_eq!(heap.generation_for(300), Ok(Some(Generation::Gen3)));
        assert_eq!(heap.generation_for(999), Ok(Some(Generation::Gen0)));
        assert_eq!(heap.generation_for(1000), Ok(None));
        assert_eq!(heap.generation_for(u64::MAX), Ok(None));
        assert_eq!(heap.generation_for(5100), Ok(Some(Generation::Gen1)));
        assert_eq!(heap.last_segment.load(Ordering::Relaxed), 1);
        assert_eq!(heap.generation_for(5600), Ok(Some(Generation::Gen0)));
        assert_eq!(heap.generation_for(10), Ok(Some(Generation::Gen4)));
        assert_eq!(heap.last_segment.load(Ordering::Relaxed), 0);

        // Misses do not disturb the last segment
        assert_eq!(heap.generation_for(3000), Ok(None));
        assert_eq!(heap.last_segment.load(Ordering::Relaxed), 0);

        let clone = heap.clone();
        assert_eq!(clone.generation_for(5999), Ok(Some(Generation::Gen0)));
        assert_eq!(clone.segments(), heap.segments());
    }

    #[test]
    fn shared_between_threads() {
        let heap = two_segments();
        std::thread::scope(|scope| {
            for base in [0, 5000] {
                let heap = &heap;
                scope.spawn(move || {
                    for offset in 0..1000 {
                        assert!(heap.generation_for(base + offset).unwrap().is_some());
                    }
                });
            }
        });
    }

    proptest! {
        #[test]
        fn cache_does_not_affect_results(addresses in prop::collection::vec(0u64..7000, 1..64)) {
            let heap = two_segments();
            let segments = heap.segments().unwrap().to_vec();
            for address in addresses {
                let expected = segments.iter().find_map(|segment| segment.generation_for(address));
                prop_assert_eq!(heap.generation_for(address), Ok(expected));
            }
        }
    }
}
