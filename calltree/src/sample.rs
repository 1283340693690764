//! Samples and the sources that provide them to the call tree aggregator

use crate::{
    interner::{CallStackIndex, InternedStacks, StackInterner},
    Metric, Timestamp,
};
use log::debug;
use std::{ops::Range, sync::Arc};

/// Position of a sample in the stream produced by its original source
pub type SampleIndex = usize;

/// Maximal number of samples that one time interval is split into
pub const MAX_SPLIT_PIECES: usize = 1 << 16;

/// Timestamped, weighted observation of a call stack
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Sample {
    /// Call stack that was observed
    pub stack: CallStackIndex,

    /// Metric attributed to this call stack (CPU time, bytes, ...)
    pub metric: Metric,

    /// Number of events this sample stands for
    pub count: Metric,

    /// Time at which the sample was taken, relative to trace start
    pub time: Timestamp,

    /// Position of this sample in the original sample stream
    pub index: SampleIndex,
}

/// Restartable sequence of samples
///
/// Every call stack referenced by the samples must be known to the
/// [`InternedStacks`] returned by `stacks()`. Every call to `samples()` starts
/// over from the first sample, so that trees can be rebuilt with different
/// filter configurations from the same source.
///
pub trait SampleSource {
    /// Interned frames and call stacks which samples refer to
    fn stacks(&self) -> &Arc<InternedStacks>;

    /// Iterate over samples from the beginning
    fn samples(&self) -> Box<dyn Iterator<Item = Sample> + '_>;
}

/// In-memory sample source
#[derive(Clone, Debug)]
pub struct SampleList {
    /// Interned call stacks
    stacks: Arc<InternedStacks>,

    /// Samples, in order of arrival
    samples: Box<[Sample]>,
}
//
impl SampleList {
    /// Build a sample list from previously interned stacks and samples
    pub fn new(stacks: Arc<InternedStacks>, samples: impl Into<Box<[Sample]>>) -> Self {
        Self {
            stacks,
            samples: samples.into(),
        }
    }

    /// Samples, in order of arrival
    pub fn as_slice(&self) -> &[Sample] {
        &self.samples
    }

    /// Truth that there are no samples
    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// Number of samples
    pub fn len(&self) -> usize {
        self.samples.len()
    }
}
//
impl SampleSource for SampleList {
    fn stacks(&self) -> &Arc<InternedStacks> {
        &self.stacks
    }

    fn samples(&self) -> Box<dyn Iterator<Item = Sample> + '_> {
        Box::new(self.samples.iter().copied())
    }
}

/// Mechanism to build a SampleList
#[derive(Debug, Default)]
pub struct SampleListBuilder {
    /// Frames and call stacks seen so far
    stacks: StackInterner,

    /// Samples collected so far
    samples: Vec<Sample>,
}
//
impl SampleListBuilder {
    /// Prepare to collect samples
    pub fn new() -> Self {
        Self::default()
    }

    /// Access the frame and call stack interner
    pub fn interner(&mut self) -> &mut StackInterner {
        &mut self.stacks
    }

    /// Record a sample of an already interned call stack
    pub fn add_sample(
        &mut self,
        stack: CallStackIndex,
        metric: Metric,
        count: Metric,
        time: Timestamp,
    ) -> SampleIndex {
        let index = self.samples.len();
        self.samples.push(Sample {
            stack,
            metric,
            count,
            time,
            index,
        });
        index
    }

    /// Record a sample of a call stack given as frame names from root to leaf
    ///
    /// Returns `None` and records nothing if there are no frames.
    ///
    pub fn add_stack_sample<'name>(
        &mut self,
        root_to_leaf: impl IntoIterator<Item = &'name str>,
        metric: Metric,
        count: Metric,
        time: Timestamp,
    ) -> Option<SampleIndex> {
        let stack = self.stacks.intern_stack(root_to_leaf)?;
        Some(self.add_sample(stack, metric, count, time))
    }

    /// Record a sample that spans a time interval, splitting it into several
    /// samples that each span at most `max_width`
    ///
    /// The metric and count are distributed in proportion to the width of
    /// each piece, and the timestamp of each piece is the start of the time
    /// range that it covers. If `max_width` is not a positive finite number or
    /// the interval fits in one piece, a single sample is recorded at `start`.
    /// Pieces are widened as needed so that there are at most
    /// [`MAX_SPLIT_PIECES`] of them.
    ///
    pub fn add_split_sample(
        &mut self,
        stack: CallStackIndex,
        metric: Metric,
        count: Metric,
        start: Timestamp,
        duration: Timestamp,
        max_width: Timestamp,
    ) -> Range<SampleIndex> {
        let first = self.samples.len();
        if !(max_width > 0.0 && max_width.is_finite()) || !(duration > max_width) {
            self.add_sample(stack, metric, count, start);
            return first..self.samples.len();
        }
        let min_width = duration / MAX_SPLIT_PIECES as Timestamp;
        let max_width = if max_width < min_width {
            debug!("Widening pieces of a {duration} ms sample from {max_width} to {min_width} ms");
            min_width
        } else {
            max_width
        };
        let num_pieces = (duration / max_width).ceil() as usize;
        let offsets = (0..num_pieces)
            .map(|piece| piece as Timestamp * max_width)
            .take_while(|&offset| offset < duration);
        for offset in offsets {
            let width = max_width.min(duration - offset);
            self.add_sample(
                stack,
                metric * width / duration,
                count * width / duration,
                start + offset,
            );
        }
        first..self.samples.len()
    }

    /// Number of samples collected so far
    pub fn len(&self) -> usize {
        self.samples.len()
    }

    /// Truth that no sample was collected so far
    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// Finish collecting samples
    pub fn build(self) -> SampleList {
        SampleList {
            stacks: Arc::new(self.stacks.finalize()),
            samples: self.samples.into_boxed_slice(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use more_asserts::{assert_gt, assert_le, assert_lt};
    use pretty_assertions::assert_eq;

    #[test]
    fn build_list() {
        let mut builder = SampleListBuilder::new();
        assert!(builder.is_empty());
        assert_eq!(builder.add_stack_sample(["main", "foo"], 1.0, 1.0, 0.5), Some(0));
        assert_eq!(builder.add_stack_sample(std::iter::empty(), 1.0, 1.0, 0.5), None);
        let stack = builder.interner().intern_stack(["main"]).unwrap();
        assert_eq!(builder.add_sample(stack, 2.0, 1.0, 3.0), 1);
        assert_eq!(builder.len(), 2);

        let list = builder.build();
        assert_eq!(list.len(), 2);
        let samples = list.samples().collect::<Vec<_>>();
        assert_eq!(samples, list.as_slice());
        assert_eq!(list.stacks().frame_names(samples[0].stack), ["main", "foo"]);
        assert_eq!(samples[1].index, 1);

        // Sources must be restartable
        assert_eq!(list.samples().count(), 2);
    }

    #[test]
    fn split_sample() {
        let mut builder = SampleListBuilder::new();
        let stack = builder.interner().intern_stack(["main"]).unwrap();
        let range = builder.add_split_sample(stack, 25.0, 1.0, 100.0, 25.0, 10.0);
        assert_eq!(range, 0..3);

        let list = builder.build();
        let times = list.as_slice().iter().map(|s| s.time).collect::<Vec<_>>();
        assert_eq!(times, [100.0, 110.0, 120.0]);
        let metrics = list.as_slice().iter().map(|s| s.metric).collect::<Vec<_>>();
        assert_eq!(metrics, [10.0, 10.0, 5.0]);
        let total_count = list.as_slice().iter().map(|s| s.count).sum::<f64>();
        assert!((total_count - 1.0).abs() < 1e-12);
        for sample in list.as_slice() {
            assert_eq!(sample.stack, stack);
            assert_le!(sample.metric, 10.0);
        }
    }

    #[test]
    fn split_sample_degenerate() {
        let mut builder = SampleListBuilder::new();
        let stack = builder.interner().intern_stack(["main"]).unwrap();
        assert_eq!(builder.add_split_sample(stack, 5.0, 1.0, 0.0, 5.0, 10.0), 0..1);
        assert_eq!(builder.add_split_sample(stack, 5.0, 1.0, 0.0, 50.0, 0.0), 1..2);
        assert_eq!(builder.add_split_sample(stack, 5.0, 1.0, 0.0, 50.0, f64::NAN), 2..3);
        let list = builder.build();
        assert!(list.as_slice().iter().all(|s| s.metric == 5.0 && s.time == 0.0));
    }

    #[test]
    fn split_sample_rounding() {
        // 1999 * 0.01 / 0.01 rounds up past 1999
        let mut builder = SampleListBuilder::new();
        let stack = builder.interner().intern_stack(["main"]).unwrap();
        let duration = 1999.0 * 0.01;
        let range = builder.add_split_sample(stack, 10.0, 1.0, 0.0, duration, 0.01);
        assert_eq!(range, 0..1999);

        let list = builder.build();
        for sample in list.as_slice() {
            assert_lt!(sample.time, duration);
            assert_gt!(sample.metric, 0.0);
            assert_gt!(sample.count, 0.0);
        }
        let total_metric = list.as_slice().iter().map(|s| s.metric).sum::<f64>();
        assert!((total_metric - 10.0).abs() < 1e-9);
    }

    #[test]
    fn split_sample_bounded() {
        let mut builder = SampleListBuilder::new();
        let stack = builder.interner().intern_stack(["main"]).unwrap();
        let range = builder.add_split_sample(stack, 1.0, 1.0, 0.0, 1e12, 1e-9);
        assert_le!(range.len(), MAX_SPLIT_PIECES);
        assert_gt!(range.len(), MAX_SPLIT_PIECES / 2);

        let list = builder.build();
        let total_count = list.as_slice().iter().map(|s| s.count).sum::<f64>();
        assert!((total_count - 1.0).abs() < 1e-9);
    }
}
