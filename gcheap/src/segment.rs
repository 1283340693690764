//! Heap segments and the generations they are split into

use crate::Address;
use strum::{Display, EnumIter, EnumString, IntoStaticStr};

/// Garbage collector generation
///
/// Higher-numbered generations are scanned less often by the collector.
/// `Gen4` stands for the large object heap equivalent.
///
#[derive(
    Clone,
    Copy,
    Debug,
    Display,
    EnumIter,
    EnumString,
    Eq,
    Hash,
    IntoStaticStr,
    Ord,
    PartialEq,
    PartialOrd,
)]
#[strum(serialize_all = "lowercase")]
pub enum Generation {
    /// Youngest objects
    Gen0,

    /// Objects which survived one collection
    Gen1,

    /// Long-lived objects
    Gen2,

    /// Pinned or frozen object region
    Gen3,

    /// Large objects
    Gen4,
}
//
impl Generation {
    /// Order in which generation boundaries are checked
    pub const LOOKUP_ORDER: [Self; 5] = [Self::Gen4, Self::Gen3, Self::Gen2, Self::Gen1, Self::Gen0];

    /// Generation number, from 0 to 4
    pub fn number(self) -> u8 {
        self as u8
    }

    /// Generation from its number, if valid
    pub fn from_number(number: u8) -> Option<Self> {
        match number {
            0 => Some(Self::Gen0),
            1 => Some(Self::Gen1),
            2 => Some(Self::Gen2),
            3 => Some(Self::Gen3),
            4 => Some(Self::Gen4),
            _ => None,
        }
    }
}

/// Contiguous range of the managed heap `[start, end)`, split into
/// generations by per-generation end boundaries
#[derive(Clone, Copy, Debug, Default, Eq, Hash, PartialEq)]
pub struct GcHeapSegment {
    /// First address of the segment
    pub start: Address,

    /// First address past the end of the segment
    pub end: Address,

    /// End of generation 0
    pub gen0_end: Address,

    /// End of generation 1
    pub gen1_end: Address,

    /// End of generation 2
    pub gen2_end: Address,

    /// End of generation 3
    pub gen3_end: Address,

    /// End of generation 4, equal to `start` if there is no large object region
    pub gen4_end: Address,
}
//
impl GcHeapSegment {
    /// Truth that an address lies within `[start, end)`
    pub fn contains(&self, address: Address) -> bool {
        (self.start..self.end).contains(&address)
    }

    /// Number of bytes covered by this segment
    pub fn size(&self) -> u64 {
        self.end.saturating_sub(self.start)
    }

    /// End boundary of a generation
    pub fn generation_end(&self, generation: Generation) -> Address {
        match generation {
            Generation::Gen0 => self.gen0_end,
            Generation::Gen1 => self.gen1_end,
            Generation::Gen2 => self.gen2_end,
            Generation::Gen3 => self.gen3_end,
            Generation::Gen4 => self.gen4_end,
        }
    }

    /// Generation of an address, if it belongs to this segment
    ///
    /// Boundaries are checked from generation 4 down to generation 0, and the
    /// first one that lies strictly above the address decides. Addresses
    /// which lie past every boundary but before `end` are reported as
    /// generation 0.
    ///
    pub fn generation_for(&self, address: Address) -> Option<Generation> {
        if !self.contains(address) {
            return None;
        }
        let generation = Generation::LOOKUP_ORDER
            .into_iter()
            .find(|&generation| address < self.generation_end(generation))
            .unwrap_or(Generation::Gen0);
        Some(generation)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::str::FromStr;
    use strum::IntoEnumIterator;

    /// Segment with every generation represented
    pub(crate) fn nested_segment() -> GcHeapSegment {
        GcHeapSegment {
            start: 0,
            end: 1000,
            gen0_end: 1000,
            gen1_end: 800,
            gen2_end: 600,
            gen3_end: 400,
            gen4_end: 100,
        }
    }

    #[test]
    fn generation_names() {
        for (number, generation) in Generation::iter().enumerate() {
            assert_eq!(usize::from(generation.number()), number);
            assert_eq!(Generation::from_number(generation.number()), Some(generation));
            assert_eq!(generation.to_string(), format!("gen{number}"));
            assert_eq!(Generation::from_str(&generation.to_string()), Ok(generation));
        }
        assert_eq!(Generation::from_number(5), None);
        assert_eq!(<&'static str>::from(Generation::Gen4), "gen4");
    }

    #[test]
    fn generation_lookup() {
        let segment = nested_segment();
        assert_eq!(segment.size(), 1000);
        assert_eq!(segment.generation_for(0), Some(Generation::Gen4));
        assert_eq!(segment.generation_for(50), Some(Generation::Gen4));
        assert_eq!(segment.generation_for(100), Some(Generation::Gen3));
        assert_eq!(segment.generation_for(300), Some(Generation::Gen3));
        assert_eq!(segment.generation_for(500), Some(Generation::Gen2));
        assert_eq!(segment.generation_for(700), Some(Generation::Gen1));
        assert_eq!(segment.generation_for(999), Some(Generation::Gen0));
        assert_eq!(segment.generation_for(1000), None);
        assert_eq!(segment.generation_for(u64::MAX), None);
    }

    #[test]
    fn without_large_object_region() {
        let segment = GcHeapSegment {
            start: 100,
            end: 200,
            gen0_end: 200,
            gen1_end: 150,
            gen2_end: 120,
            gen3_end: 100,
            gen4_end: 100,
        };
        assert_eq!(segment.generation_for(99), None);
        assert_eq!(segment.generation_for(100), Some(Generation::Gen2));
        assert_eq!(segment.generation_for(130), Some(Generation::Gen1));
        assert_eq!(segment.generation_for(199), Some(Generation::Gen0));
    }

    #[test]
    fn boundaries_past_end() {
        let segment = GcHeapSegment {
            start: 0,
            end: 100,
            gen0_end: 50,
            ..GcHeapSegment::default()
        };
        assert_eq!(segment.generation_for(10), Some(Generation::Gen0));
        assert_eq!(segment.generation_for(60), Some(Generation::Gen0));
    }
}
