//! Per-node time histograms

use crate::{Metric, Timestamp};
use std::ops::{Index, Range};

/// Mapping from timestamps to histogram buckets
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct HistogramController {
    /// Start of the covered time range
    start: Timestamp,

    /// End of the covered time range (inclusive)
    end: Timestamp,

    /// Number of buckets
    bucket_count: usize,
}
//
impl HistogramController {
    /// Split the time range `[start, end]` into `bucket_count` buckets
    ///
    /// Panics if there are no buckets or if the time range is reversed.
    ///
    pub fn new(start: Timestamp, end: Timestamp, bucket_count: usize) -> Self {
        assert!(bucket_count > 0, "Histograms need at least one bucket");
        assert!(start <= end, "Histogram time range is reversed");
        Self {
            start,
            end,
            bucket_count,
        }
    }

    /// Start of the covered time range
    pub fn start(&self) -> Timestamp {
        self.start
    }

    /// End of the covered time range
    pub fn end(&self) -> Timestamp {
        self.end
    }

    /// Number of buckets
    pub fn bucket_count(&self) -> usize {
        self.bucket_count
    }

    /// Time span covered by each bucket
    pub fn bucket_width(&self) -> Timestamp {
        (self.end - self.start) / self.bucket_count as Timestamp
    }

    /// Bucket that a timestamp falls into, if it is in the covered range
    ///
    /// The end of the time range belongs to the last bucket. If the time range
    /// is empty, its only instant belongs to the first bucket.
    ///
    pub fn bucket_for(&self, time: Timestamp) -> Option<usize> {
        if !(self.start..=self.end).contains(&time) {
            return None;
        }
        let width = self.bucket_width();
        if width <= 0.0 {
            return Some(0);
        }
        let bucket = ((time - self.start) / width) as usize;
        Some(bucket.min(self.bucket_count - 1))
    }

    /// Time range covered by a bucket
    pub fn bucket_range(&self, bucket: usize) -> Range<Timestamp> {
        let width = self.bucket_width();
        let start = self.start + bucket as Timestamp * width;
        start..start + width
    }

    /// Make an empty histogram with the right number of buckets
    pub fn histogram(&self) -> Histogram {
        Histogram::new(self.bucket_count)
    }
}

/// Metric accumulated over a fixed number of time buckets
///
/// Most call tree nodes only receive samples within one time bucket, so
/// histograms start out tracking a single bucket and only allocate storage for
/// all buckets once a second bucket receives a value.
///
#[derive(Clone, Debug, PartialEq)]
pub struct Histogram {
    /// Number of buckets
    bucket_count: usize,

    /// Accumulated metric
    buckets: Buckets,
}
//
/// Storage of histogram buckets
#[derive(Clone, Debug, PartialEq)]
enum Buckets {
    /// No bucket has received any value yet
    Empty,

    /// Only one bucket has received values
    Single { bucket: usize, value: Metric },

    /// Several buckets have received values
    Full(Box<[Metric]>),
}
//
impl Histogram {
    /// Make an empty histogram with a certain number of buckets
    pub fn new(bucket_count: usize) -> Self {
        Self {
            bucket_count,
            buckets: Buckets::Empty,
        }
    }

    /// Number of buckets
    pub fn bucket_count(&self) -> usize {
        self.bucket_count
    }

    /// Truth that no bucket has received any value yet
    pub fn is_empty(&self) -> bool {
        matches!(self.buckets, Buckets::Empty)
    }

    /// Accumulate a value into a bucket
    ///
    /// Panics if the bucket index is out of range.
    ///
    pub fn add_metric(&mut self, value: Metric, bucket: usize) {
        self.check_bucket(bucket);
        match self.buckets {
            Buckets::Empty => self.buckets = Buckets::Single { bucket, value },
            Buckets::Single {
                bucket: single_bucket,
                value: ref mut single_value,
            } if single_bucket == bucket => *single_value += value,
            // A second distinct bucket, or full storage already: the single
            // value must have been migrated before the new value is added
            Buckets::Single { .. } | Buckets::Full(_) => self.promote()[bucket] += value,
        }
    }

    /// Accumulate the buckets of another histogram, multiplied by `scale`
    ///
    /// Panics if the histograms do not have the same number of buckets.
    ///
    pub fn add_scaled(&mut self, other: &Histogram, scale: Metric) {
        assert_eq!(
            self.bucket_count, other.bucket_count,
            "Histograms have different bucket counts"
        );
        match &other.buckets {
            Buckets::Empty => {}
            Buckets::Single { bucket, value } => self.add_metric(value * scale, *bucket),
            Buckets::Full(other_buckets) => {
                for (bucket, value) in self.promote().iter_mut().zip(other_buckets.iter()) {
                    *bucket += value * scale;
                }
            }
        }
    }

    /// Accumulated value of a bucket, 0 if it never received anything
    pub fn get(&self, bucket: usize) -> Metric {
        self.check_bucket(bucket);
        match &self.buckets {
            Buckets::Empty => 0.0,
            Buckets::Single {
                bucket: single_bucket,
                value,
            } => {
                if *single_bucket == bucket {
                    *value
                } else {
                    0.0
                }
            }
            Buckets::Full(buckets) => buckets[bucket],
        }
    }

    /// Iterate over the accumulated value of every bucket
    pub fn iter(&self) -> impl Iterator<Item = Metric> + '_ {
        (0..self.bucket_count).map(|bucket| self.get(bucket))
    }

    /// Sum of all buckets
    pub fn total(&self) -> Metric {
        match &self.buckets {
            Buckets::Empty => 0.0,
            Buckets::Single { value, .. } => *value,
            Buckets::Full(buckets) => buckets.iter().sum(),
        }
    }

    /// Switch to full bucket storage, migrating any single-bucket value
    fn promote(&mut self) -> &mut [Metric] {
        if let Buckets::Empty | Buckets::Single { .. } = self.buckets {
            let mut buckets = vec![0.0; self.bucket_count].into_boxed_slice();
            if let Buckets::Single { bucket, value } = self.buckets {
                buckets[bucket] = value;
            }
            self.buckets = Buckets::Full(buckets);
        }
        match &mut self.buckets {
            Buckets::Full(buckets) => &mut buckets[..],
            Buckets::Empty | Buckets::Single { .. } => unreachable!("Just promoted"),
        }
    }

    /// Panic if a bucket index is out of range
    fn check_bucket(&self, bucket: usize) {
        assert!(
            bucket < self.bucket_count,
            "Bucket {bucket} is out of range (histogram has {} buckets)",
            self.bucket_count
        );
    }
}
//
impl Index<usize> for Histogram {
    type Output = Metric;

    fn index(&self, bucket: usize) -> &Metric {
        self.check_bucket(bucket);
        match &self.buckets {
            Buckets::Single {
                bucket: single_bucket,
                value,
            } if *single_bucket == bucket => value,
            Buckets::Full(buckets) => &buckets[bucket],
            Buckets::Empty | Buckets::Single { .. } => &0.0,
        }
    }
}
