//! Versioned binary records of heap segment lists
//!
//! ```text
//! Header:  MAGIC (4 bytes) + version (u32 LE) + segment count (u64 LE)
//! Segment: start, end, gen0_end, gen1_end, gen2_end, gen3_end (u64 LE each)
//!          + gen4_end (u64 LE) from version 1 onwards
//! ```
//!
//! Version 0 records predate generation 4 support. Their segments are read
//! back with `gen4_end == start`, i.e. without a large object region.

use crate::{
    heap::{DotNetHeapInfo, HeapInfoError},
    segment::GcHeapSegment,
    Address,
};
use log::debug;
use std::io::{self, Read, Write};
use thiserror::Error;

/// Magic bytes at the start of every segment list record
pub const MAGIC: &[u8; 4] = b"GCHS";

/// Version of the format written by this crate
pub const CURRENT_VERSION: u32 = 1;

/// First version where segments carry a generation 4 boundary
pub const GEN4_VERSION: u32 = 1;

/// Upper bound on the capacity preallocated from the segment count header
const MAX_PREALLOCATED_SEGMENTS: usize = 4096;

/// Write a segment list using the current format version
pub fn write_segments(
    output: &mut impl Write,
    segments: &[GcHeapSegment],
) -> Result<(), RecordError> {
    write_segments_versioned(output, segments, CURRENT_VERSION)
}

/// Write a segment list using a specific format version
///
/// Generation 4 boundaries are lost when writing a version 0 record.
///
pub fn write_segments_versioned(
    output: &mut impl Write,
    segments: &[GcHeapSegment],
    version: u32,
) -> Result<(), RecordError> {
    check_version(version)?;
    output.write_all(MAGIC)?;
    output.write_all(&version.to_le_bytes())?;
    output.write_all(&(segments.len() as u64).to_le_bytes())?;
    for segment in segments {
        write_segment(output, segment, version)?;
    }
    Ok(())
}

/// Write a single segment, without header
pub fn write_segment(
    output: &mut impl Write,
    segment: &GcHeapSegment,
    version: u32,
) -> Result<(), RecordError> {
    check_version(version)?;
    for field in [
        segment.start,
        segment.end,
        segment.gen0_end,
        segment.gen1_end,
        segment.gen2_end,
        segment.gen3_end,
    ] {
        output.write_all(&field.to_le_bytes())?;
    }
    if version >= GEN4_VERSION {
        output.write_all(&segment.gen4_end.to_le_bytes())?;
    }
    Ok(())
}

/// Read a segment list, whatever its format version
pub fn read_segments(input: &mut impl Read) -> Result<Vec<GcHeapSegment>, RecordError> {
    let mut magic = [0; 4];
    input.read_exact(&mut magic)?;
    if &magic != MAGIC {
        return Err(RecordError::BadMagic(magic));
    }
    let version = read_u32(input)?;
    check_version(version)?;
    let count = read_u64(input)?;
    let count = usize::try_from(count).map_err(|_| RecordError::TooManySegments(count))?;
    debug!("Reading {count} heap segments from a version {version} record");

    let mut segments = Vec::with_capacity(count.min(MAX_PREALLOCATED_SEGMENTS));
    for _ in 0..count {
        segments.push(read_segment(input, version)?);
    }
    Ok(segments)
}

/// Read a single segment, without header
pub fn read_segment(input: &mut impl Read, version: u32) -> Result<GcHeapSegment, RecordError> {
    check_version(version)?;
    let start = read_u64(input)?;
    let end = read_u64(input)?;
    if start > end {
        return Err(RecordError::ReversedSegment { start, end });
    }
    let gen0_end = read_u64(input)?;
    let gen1_end = read_u64(input)?;
    let gen2_end = read_u64(input)?;
    let gen3_end = read_u64(input)?;
    let gen4_end = if version >= GEN4_VERSION {
        read_u64(input)?
    } else {
        start
    };
    Ok(GcHeapSegment {
        start,
        end,
        gen0_end,
        gen1_end,
        gen2_end,
        gen3_end,
        gen4_end,
    })
}

/// Reject format versions from the future
fn check_version(version: u32) -> Result<(), RecordError> {
    if version > CURRENT_VERSION {
        Err(RecordError::UnsupportedVersion(version))
    } else {
        Ok(())
    }
}

/// Read a little-endian u32
fn read_u32(input: &mut impl Read) -> io::Result<u32> {
    let mut bytes = [0; 4];
    input.read_exact(&mut bytes)?;
    Ok(u32::from_le_bytes(bytes))
}

/// Read a little-endian u64
fn read_u64(input: &mut impl Read) -> io::Result<Address> {
    let mut bytes = [0; 8];
    input.read_exact(&mut bytes)?;
    Ok(u64::from_le_bytes(bytes))
}

impl DotNetHeapInfo {
    /// Load heap information from a segment list record
    pub fn from_reader(input: &mut impl Read) -> Result<Self, RecordError> {
        Ok(Self::with_segments(read_segments(input)?))
    }

    /// Save the segment list as a record in the current format version
    pub fn write_to(&self, output: &mut impl Write) -> Result<(), RecordError> {
        let segments = self.segments().ok_or(HeapInfoError::SegmentsNotLoaded)?;
        write_segments(output, segments)
    }
}

/// What can go wrong while reading or writing segment list records
#[derive(Debug, Error)]
pub enum RecordError {
    /// Failed to read or write the underlying stream
    #[error("failed to access segment record ({0})")]
    Io(#[from] io::Error),

    /// The stream does not start with the expected magic bytes
    #[error("not a heap segment record (magic bytes {0:?})")]
    BadMagic([u8; 4]),

    /// The record was written by a newer version of this crate
    #[error("unsupported segment record version {0}")]
    UnsupportedVersion(u32),

    /// The segment count does not fit in memory
    #[error("segment count {0} is too large")]
    TooManySegments(u64),

    /// A segment ends before it starts
    #[error("heap segment {start:#x}..{end:#x} is reversed")]
    ReversedSegment {
        /// Start of the segment
        start: Address,

        /// End of the segment
        end: Address,
    },

    /// There is no segment list to be saved
    #[error("cannot save heap segments ({0})")]
    Heap(#[from] HeapInfoError),
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::segment::{tests::nested_segment, Generation};
    use assert_matches::assert_matches;
    use pretty_assertions::assert_eq;

    fn segments() -> Vec<GcHeapSegment> {
        vec![
            nested_segment(),
            GcHeapSegment {
                start: 0x1_0000,
                end: 0x2_0000,
                gen0_end: 0x2_0000,
                gen1_end: 0x1_8000,
                gen2_end: 0x1_4000,
                gen3_end: 0x1_2000,
                gen4_end: 0x1_1000,
            },
        ]
    }

    #[test]
    fn current_version() {
        let mut buffer = Vec::new();
        write_segments(&mut buffer, &segments()).unwrap();
        assert_eq!(&buffer[..4], MAGIC);
        assert_eq!(buffer.len(), 4 + 4 + 8 + 2 * 7 * 8);
        assert_eq!(read_segments(&mut &buffer[..]).unwrap(), segments());
    }

    #[test]
    fn version_zero_has_no_large_object_region() {
        let mut buffer = Vec::new();
        write_segments_versioned(&mut buffer, &segments(), 0).unwrap();
        assert_eq!(buffer.len(), 4 + 4 + 8 + 2 * 6 * 8);

        let read = read_segments(&mut &buffer[..]).unwrap();
        for (read, written) in read.iter().zip(segments()) {
            assert_eq!(read.gen4_end, read.start);
            assert_eq!(
                *read,
                GcHeapSegment {
                    gen4_end: written.start,
                    ..written
                }
            );
        }

        // Addresses that used to be in generation 4 now fall in generation 3
        let heap = DotNetHeapInfo::with_segments(read);
        assert_eq!(heap.generation_for(50), Ok(Some(Generation::Gen3)));
    }

    #[test]
    fn heap_roundtrip() {
        let heap = DotNetHeapInfo::with_segments(segments());
        let mut buffer = Vec::new();
        heap.write_to(&mut buffer).unwrap();
        let read = DotNetHeapInfo::from_reader(&mut &buffer[..]).unwrap();
        assert_eq!(read.segments(), heap.segments());
        assert_eq!(read.size_of_all_segments(), heap.size_of_all_segments());

        assert_matches!(
            DotNetHeapInfo::new().write_to(&mut Vec::new()),
            Err(RecordError::Heap(HeapInfoError::SegmentsNotLoaded))
        );
    }

    #[test]
    fn malformed_records() {
        assert_matches!(
            read_segments(&mut &b"NOPE\x01\0\0\0"[..]),
            Err(RecordError::BadMagic(magic)) => assert_eq!(&magic, b"NOPE")
        );

        let mut future = MAGIC.to_vec();
        future.extend_from_slice(&(CURRENT_VERSION + 1).to_le_bytes());
        future.extend_from_slice(&0u64.to_le_bytes());
        assert_matches!(
            read_segments(&mut &future[..]),
            Err(RecordError::UnsupportedVersion(v)) if v == CURRENT_VERSION + 1
        );
        assert_matches!(
            write_segments_versioned(&mut Vec::new(), &[], CURRENT_VERSION + 1),
            Err(RecordError::UnsupportedVersion(_))
        );

        let mut truncated = Vec::new();
        write_segments(&mut truncated, &segments()).unwrap();
        truncated.truncate(truncated.len() - 3);
        assert_matches!(read_segments(&mut &truncated[..]), Err(RecordError::Io(_)));

        let reversed = GcHeapSegment {
            start: 0x2000,
            end: 0x1000,
            ..GcHeapSegment::default()
        };
        let mut buffer = Vec::new();
        write_segments(&mut buffer, &[reversed]).unwrap();
        assert_matches!(
            read_segments(&mut &buffer[..]),
            Err(RecordError::ReversedSegment {
                start: 0x2000,
                end: 0x1000
            })
        );
    }
}
