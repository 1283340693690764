//! Aggregation of timestamped call stack samples into call trees
//!
//! Samples reference call stacks that were canonicalized by a
//! [`StackInterner`]. A [`CallTree`] is built from any [`SampleSource`] under
//! a [`FilterParams`] configuration which controls the time window, frame
//! grouping, folding and sample inclusion/exclusion. Built trees are
//! immutable, and may be queried concurrently for hotspots, caller trees,
//! per-node histograms, or drilled into to produce the input of a new build.

#![deny(missing_docs)]

pub mod cancel;
pub mod filter;
pub mod histogram;
pub mod interner;
pub mod sample;
pub mod tree;

/// Additive quantity attributed to samples (CPU time, bytes allocated, ...)
pub type Metric = f64;

/// Time in milliseconds, relative to the start of the trace
pub type Timestamp = f64;

// Reexport types which appear in the public interface
pub use self::{
    cancel::CancellationToken,
    filter::{FilterError, FilterParams, StackFilter},
    histogram::{Histogram, HistogramController},
    interner::{CallStackIndex, FrameIndex, InternedStacks, StackInterner},
    sample::{
        Sample, SampleIndex, SampleList, SampleListBuilder, SampleSource, MAX_SPLIT_PIECES,
    },
    tree::{
        BuildStats, ByNameEntry, CallTree, CallTreeError, CallTreeNode, CallerTree,
        CallerTreeNode, DrillKind, InvariantError, NodeId, NodeName,
    },
};

/// Re-export used crates to avoid duplicate dependencies
pub use asylum;
