//! Mapping of managed heap addresses to garbage collector generations
//!
//! A heap dump describes the managed heap as a list of [`GcHeapSegment`]s,
//! each of which is split into generations by a set of boundaries.
//! [`DotNetHeapInfo`] owns such a list and tells which [`Generation`] an
//! object address belongs to. Segment lists can be persisted in a versioned
//! binary format, see the [`record`] module.

#![deny(missing_docs)]

pub mod heap;
pub mod record;
pub mod segment;

/// Address within the managed heap
pub type Address = u64;

// Reexport types which appear in the public interface
pub use self::{
    heap::{DotNetHeapInfo, HeapInfoError},
    record::RecordError,
    segment::{GcHeapSegment, Generation},
};
