//! Typed dispatch of trace events to sample-producing handlers

use calltree::{Metric, SampleListBuilder, Timestamp};
use log::warn;
use serde::Deserialize;
use std::collections::HashMap;
use strum::{Display, EnumIter, EnumString};
use thiserror::Error;

/// Kind of trace event
#[derive(
    Clone, Copy, Debug, Display, EnumIter, EnumString, Eq, Hash, Ord, PartialEq, PartialOrd,
)]
#[strum(serialize_all = "lowercase")]
pub enum EventKind {
    /// CPU stack sample
    Cpu,

    /// Memory allocation
    Alloc,

    /// Thrown exception
    Exception,

    /// Lock contention
    Contention,
}

/// Trace event, as found in trace files
#[derive(Clone, Debug, Deserialize, PartialEq)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum RawEvent {
    /// CPU stack sample
    Cpu(CpuEvent),

    /// Memory allocation
    Alloc(AllocEvent),

    /// Thrown exception
    Exception(ExceptionEvent),

    /// Lock contention
    Contention(ContentionEvent),
}
//
impl RawEvent {
    /// Kind of event
    pub fn kind(&self) -> EventKind {
        match self {
            Self::Cpu(_) => EventKind::Cpu,
            Self::Alloc(_) => EventKind::Alloc,
            Self::Exception(_) => EventKind::Exception,
            Self::Contention(_) => EventKind::Contention,
        }
    }
}

/// CPU stack sample
#[derive(Clone, Debug, Deserialize, PartialEq)]
pub struct CpuEvent {
    /// Frames from root to leaf
    pub stack: Vec<String>,

    /// Time at which the sample was taken
    pub time: Timestamp,

    /// CPU time that the sample stands for
    #[serde(default = "default_weight")]
    pub weight: Metric,
}

/// Default CPU sample weight
fn default_weight() -> Metric {
    1.0
}

/// Memory allocation
#[derive(Clone, Debug, Deserialize, PartialEq)]
pub struct AllocEvent {
    /// Frames from root to leaf
    pub stack: Vec<String>,

    /// Time of the allocation
    pub time: Timestamp,

    /// Type of the allocated object
    #[serde(rename = "type")]
    pub type_name: String,

    /// Size of the allocation in bytes
    pub size: u64,
}

/// Thrown exception
#[derive(Clone, Debug, Deserialize, PartialEq)]
pub struct ExceptionEvent {
    /// Frames from root to leaf
    pub stack: Vec<String>,

    /// Time at which the exception was thrown
    pub time: Timestamp,

    /// Type of the exception
    #[serde(rename = "type")]
    pub type_name: String,

    /// Exception message
    #[serde(default)]
    pub message: String,
}

/// Lock contention
#[derive(Clone, Debug, Deserialize, PartialEq)]
pub struct ContentionEvent {
    /// Frames from root to leaf
    pub stack: Vec<String>,

    /// Time at which the wait started
    pub time: Timestamp,

    /// Time spent waiting
    pub duration: Timestamp,
}

/// Event handler
type Handler<'h, Event> =
    Box<dyn FnMut(&Event, &mut SampleListBuilder) -> Result<(), EventError> + 'h>;

/// Table of event handlers, used for one sequential pass over some events
///
/// Events of a kind which has no handler are counted and skipped.
///
#[derive(Default)]
pub struct EventDispatcher<'h> {
    /// Handler for CPU samples
    cpu: Option<Handler<'h, CpuEvent>>,

    /// Handler for allocations
    alloc: Option<Handler<'h, AllocEvent>>,

    /// Handler for exceptions
    exception: Option<Handler<'h, ExceptionEvent>>,

    /// Handler for contention events
    contention: Option<Handler<'h, ContentionEvent>>,

    /// Number of events seen so far, by kind
    stats: HashMap<EventKind, DispatchStats>,
}
//
impl<'h> EventDispatcher<'h> {
    /// Set up a dispatcher without any handler
    pub fn new() -> Self {
        Self::default()
    }

    /// Set up the standard handlers for some event kinds
    ///
    /// Contention events which last longer than `max_bucket_width` are split
    /// into several samples.
    ///
    pub fn with_default_handlers(kinds: &[EventKind], max_bucket_width: Option<Timestamp>) -> Self {
        let mut dispatcher = Self::new();
        for kind in kinds {
            match kind {
                EventKind::Cpu => dispatcher.on_cpu(record_cpu),
                EventKind::Alloc => dispatcher.on_alloc(record_alloc),
                EventKind::Exception => dispatcher.on_exception(record_exception),
                EventKind::Contention => dispatcher.on_contention(move |event, samples| {
                    record_contention(event, samples, max_bucket_width)
                }),
            };
        }
        dispatcher
    }

    /// Handle CPU samples
    pub fn on_cpu(
        &mut self,
        handler: impl FnMut(&CpuEvent, &mut SampleListBuilder) -> Result<(), EventError> + 'h,
    ) -> &mut Self {
        self.cpu = Some(Box::new(handler));
        self
    }

    /// Handle allocations
    pub fn on_alloc(
        &mut self,
        handler: impl FnMut(&AllocEvent, &mut SampleListBuilder) -> Result<(), EventError> + 'h,
    ) -> &mut Self {
        self.alloc = Some(Box::new(handler));
        self
    }

    /// Handle exceptions
    pub fn on_exception(
        &mut self,
        handler: impl FnMut(&ExceptionEvent, &mut SampleListBuilder) -> Result<(), EventError> + 'h,
    ) -> &mut Self {
        self.exception = Some(Box::new(handler));
        self
    }

    /// Handle contention events
    pub fn on_contention(
        &mut self,
        handler: impl FnMut(&ContentionEvent, &mut SampleListBuilder) -> Result<(), EventError>
            + 'h,
    ) -> &mut Self {
        self.contention = Some(Box::new(handler));
        self
    }

    /// Send an event to the matching handler, if any
    ///
    /// Returns whether the event was handled.
    ///
    pub fn dispatch(
        &mut self,
        event: &RawEvent,
        samples: &mut SampleListBuilder,
    ) -> Result<bool, EventError> {
        let handled = match event {
            RawEvent::Cpu(event) => call(&mut self.cpu, event, samples)?,
            RawEvent::Alloc(event) => call(&mut self.alloc, event, samples)?,
            RawEvent::Exception(event) => call(&mut self.exception, event, samples)?,
            RawEvent::Contention(event) => call(&mut self.contention, event, samples)?,
        };
        let stats = self.stats.entry(event.kind()).or_default();
        if handled {
            stats.handled += 1;
        } else {
            stats.skipped += 1;
        }
        Ok(handled)
    }

    /// Number of events seen so far for a kind
    pub fn stats(&self, kind: EventKind) -> DispatchStats {
        self.stats.get(&kind).copied().unwrap_or_default()
    }
}

/// Invoke an optional handler
fn call<Event>(
    handler: &mut Option<Handler<'_, Event>>,
    event: &Event,
    samples: &mut SampleListBuilder,
) -> Result<bool, EventError> {
    match handler {
        Some(handler) => {
            handler(event, samples)?;
            Ok(true)
        }
        None => Ok(false),
    }
}

/// Number of events of a kind which went through an EventDispatcher
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct DispatchStats {
    /// Events which were sent to a handler
    pub handled: usize,

    /// Events which had no handler
    pub skipped: usize,
}

/// Record a CPU sample, weighted by CPU time
pub fn record_cpu(event: &CpuEvent, samples: &mut SampleListBuilder) -> Result<(), EventError> {
    check_time(event.time)?;
    if !event.weight.is_finite() {
        return Err(EventError::InvalidWeight(event.weight));
    }
    let stack = event.stack.iter().map(String::as_str);
    if samples.add_stack_sample(stack, event.weight, 1.0, event.time).is_none() {
        warn!("Skipping CPU sample at {} ms with an empty stack", event.time);
    }
    Ok(())
}

/// Record an allocation as a sample with a `Type <name>` leaf frame, weighted
/// by allocation size
pub fn record_alloc(event: &AllocEvent, samples: &mut SampleListBuilder) -> Result<(), EventError> {
    check_time(event.time)?;
    let leaf = format!("Type {}", event.type_name);
    let stack = event.stack.iter().map(String::as_str).chain(Some(&leaf[..]));
    samples.add_stack_sample(stack, event.size as Metric, 1.0, event.time);
    Ok(())
}

/// Record an exception as a sample with a `Throw(<type>) <message>` leaf frame
pub fn record_exception(
    event: &ExceptionEvent,
    samples: &mut SampleListBuilder,
) -> Result<(), EventError> {
    check_time(event.time)?;
    let leaf = format!("Throw({}) {}", event.type_name, event.message);
    let stack = event
        .stack
        .iter()
        .map(String::as_str)
        .chain(Some(leaf.trim_end()));
    samples.add_stack_sample(stack, 1.0, 1.0, event.time);
    Ok(())
}

/// Record a contention event, weighted by wait duration and split into pieces
/// no longer than `max_bucket_width`
pub fn record_contention(
    event: &ContentionEvent,
    samples: &mut SampleListBuilder,
    max_bucket_width: Option<Timestamp>,
) -> Result<(), EventError> {
    check_time(event.time)?;
    if !(event.duration >= 0.0 && event.duration.is_finite()) {
        return Err(EventError::InvalidDuration(event.duration));
    }
    let Some(stack) = samples
        .interner()
        .intern_stack(event.stack.iter().map(String::as_str))
    else {
        warn!("Skipping contention event at {} ms with an empty stack", event.time);
        return Ok(());
    };
    samples.add_split_sample(
        stack,
        event.duration,
        1.0,
        event.time,
        event.duration,
        max_bucket_width.unwrap_or(Timestamp::INFINITY),
    );
    Ok(())
}

/// Reject timestamps which are not numbers
fn check_time(time: Timestamp) -> Result<(), EventError> {
    if time.is_finite() {
        Ok(())
    } else {
        Err(EventError::InvalidTime(time))
    }
}

/// What can go wrong while handling an event
#[derive(Clone, Debug, Error, PartialEq)]
pub enum EventError {
    /// Event timestamp is not a finite number
    #[error("invalid event time {0}")]
    InvalidTime(Timestamp),

    /// CPU sample weight is not a finite number
    #[error("invalid CPU sample weight {0}")]
    InvalidWeight(Metric),

    /// Contention duration is negative or not a finite number
    #[error("invalid contention duration {0}")]
    InvalidDuration(Timestamp),
}
