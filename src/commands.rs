//! Execution of CLI commands

use crate::{
    batch,
    dispatch::EventKind,
    display,
    input::{self, LoadError, LoadedTrace},
    Command, TraceArgs,
};
use calltree::{CallTree, CallTreeError, CallTreeNode, CancellationToken, DrillKind};
use gcheap::{HeapInfoError, RecordError};
use log::debug;
use rescache::{BoundedCache, CacheStats};
use std::{
    fs::File,
    io::{self, BufWriter, Write},
    num::NonZeroUsize,
    path::PathBuf,
    sync::Arc,
};
use strum::IntoEnumIterator;
use thiserror::Error;

/// Run a command, writing its results to `output`
pub fn run(command: Command, output: &mut dyn Write) -> Result<(), CliError> {
    match command {
        Command::Batch { script, cache_size } => {
            batch::run_script(&script, &TraceCache::new(cache_size), output)
        }
        other => run_command(&other, &TraceCache::new(NonZeroUsize::MIN), output),
    }
}

/// Run a command other than `batch`, loading traces through a cache
pub fn run_command(
    command: &Command,
    traces: &TraceCache,
    output: &mut dyn Write,
) -> Result<(), CliError> {
    match command {
        Command::Hotspots { trace, count } => {
            let tree = build_tree(&*traces.get(trace)?, trace)?;
            writeln!(
                output,
                "Hotspots of {} ({} samples aggregated):",
                trace.input.display(),
                tree.stats().aggregated
            )?;
            write!(output, "{}", display::hotspots(&tree, &tree.hotspots(*count)))?;
        }
        Command::Tree {
            trace,
            max_depth,
            path,
        } => {
            let tree = build_tree(&*traces.get(trace)?, trace)?;
            let node = find_node(&tree, path)?;
            write!(output, "{}", display::call_tree(&tree, node, *max_depth))?;
        }
        Command::Callers { trace, name } => {
            let tree = build_tree(&*traces.get(trace)?, trace)?;
            let callers = tree
                .caller_tree(name)
                .ok_or_else(|| CliError::NoSuchName(name.clone()))?;
            write!(output, "{}", display::caller_tree(callers.root()))?;
        }
        Command::Drill {
            trace,
            exclusive,
            max_depth,
            path,
        } => {
            let loaded = traces.get(trace)?;
            let tree = build_tree(&loaded, trace)?;
            let node = find_node(&tree, path)?;
            let kind = if *exclusive {
                DrillKind::Exclusive
            } else {
                DrillKind::Inclusive
            };
            let selected =
                tree.drill_into(node.id(), kind, &loaded.samples, &CancellationToken::new())?;
            writeln!(
                output,
                "Selected {} samples of {}",
                selected.len(),
                node.path().join(" > ")
            )?;
            let drilled = CallTree::build(&selected, &trace.filters.params()?)?;
            write!(
                output,
                "{}",
                display::call_tree(&drilled, drilled.root(), *max_depth)
            )?;
        }
        Command::Histogram { trace, path } => {
            let tree = build_tree(&*traces.get(trace)?, trace)?;
            let node = find_node(&tree, path)?;
            let controller = tree.histogram_controller();
            writeln!(
                output,
                "Histogram of {} ({} buckets of {:.2} ms):",
                node.name(),
                controller.bucket_count(),
                controller.bucket_width()
            )?;
            write!(output, "{}", display::histogram(&tree, node))?;
        }
        Command::Generation {
            heap,
            addresses,
            export,
        } => {
            let heap_info = input::load_heap(heap)?;
            for &address in addresses {
                match heap_info.generation_for(address)? {
                    Some(generation) => writeln!(output, "{address:#x}: {generation}")?,
                    None => writeln!(output, "{address:#x}: outside of the managed heap")?,
                }
            }
            if let Some(path) = export {
                let write_record = || -> Result<(), RecordError> {
                    let mut file = BufWriter::new(File::create(path)?);
                    heap_info.write_to(&mut file)?;
                    file.flush()?;
                    Ok(())
                };
                write_record().map_err(|source| CliError::Export {
                    path: path.clone(),
                    source,
                })?;
                writeln!(output, "Heap segments saved to {}", path.display())?;
            }
        }
        Command::Batch { .. } => return Err(CliError::NestedBatch),
    }
    Ok(())
}

/// Aggregate a loaded trace into a call tree
fn build_tree(trace: &LoadedTrace, args: &TraceArgs) -> Result<CallTree, CliError> {
    Ok(CallTree::build(&trace.samples, &args.filters.params()?)?)
}

/// Locate a call tree node from the names on the way to it
fn find_node<'tree>(
    tree: &'tree CallTree,
    path: &[String],
) -> Result<CallTreeNode<'tree>, CliError> {
    tree.find_path(path.iter().map(String::as_str))
        .ok_or_else(|| CliError::NoSuchNode(path.join(" > ")))
}

/// Parsed traces, identified by file path and selected event kinds
pub struct TraceCache(BoundedCache<TraceKey, LoadedTrace>);
//
impl TraceCache {
    /// Set up a cache which keeps at most `max_entries` traces around
    pub fn new(max_entries: NonZeroUsize) -> Self {
        Self(BoundedCache::new(max_entries))
    }

    /// Load a trace, or reuse a previously loaded copy
    pub fn get(&self, args: &TraceArgs) -> Result<Arc<LoadedTrace>, LoadError> {
        let key = TraceKey::new(args);
        debug!("Looking up trace {key:?}");
        self.0.get_or_try_insert_with(key, || {
            input::load_trace(&args.input, &args.events)
        })
    }

    /// Cache usage statistics
    pub fn stats(&self) -> CacheStats {
        self.0.stats()
    }
}

/// Identity of a parsed trace
#[derive(Clone, Debug, Eq, PartialEq)]
struct TraceKey {
    /// Trace file
    path: PathBuf,

    /// Kinds of events that were turned into samples
    events: Vec<EventKind>,
}
//
impl TraceKey {
    /// Key of the trace that some CLI arguments refer to
    fn new(args: &TraceArgs) -> Self {
        let mut events = if args.events.is_empty() {
            EventKind::iter().collect()
        } else {
            args.events.clone()
        };
        events.sort_unstable();
        events.dedup();
        Self {
            path: args.input.clone(),
            events,
        }
    }
}

/// What can go wrong while running a command
#[derive(Debug, Error)]
pub enum CliError {
    /// Failed to load a trace file
    #[error("failed to load trace ({0})")]
    Load(#[from] LoadError),

    /// Failed to open a filter configuration file
    #[error("failed to open filter configuration {path} ({source})")]
    FilterFile {
        /// Configuration file
        path: PathBuf,

        /// Underlying I/O error
        #[source]
        source: io::Error,
    },

    /// Failed to parse a filter configuration file
    #[error("failed to parse filter configuration {path} ({source})")]
    FilterConfig {
        /// Configuration file
        path: PathBuf,

        /// Underlying parse error
        #[source]
        source: serde_json::Error,
    },

    /// Failed to build or query a call tree
    #[error("failed to process call tree ({0})")]
    CallTree(#[from] CallTreeError),

    /// No call tree node is reached by some path
    #[error("no call tree node at path {0:?}")]
    NoSuchNode(String),

    /// No call tree node has some name
    #[error("no call tree node is named {0:?}")]
    NoSuchName(String),

    /// Failed to look up a heap address
    #[error("failed to look up heap address ({0})")]
    Heap(#[from] HeapInfoError),

    /// Failed to save heap segments
    #[error("failed to export heap segments to {path} ({source})")]
    Export {
        /// Destination file
        path: PathBuf,

        /// Underlying error
        #[source]
        source: RecordError,
    },

    /// Failed to write results
    #[error("failed to write output ({0})")]
    Output(#[from] io::Error),

    /// Failed to read a batch script
    #[error("failed to read script {path} ({source})")]
    Script {
        /// Script file
        path: PathBuf,

        /// Underlying I/O error
        #[source]
        source: io::Error,
    },

    /// A batch script line has unbalanced quotes
    #[error("bad quoting on script line {line}")]
    Quoting {
        /// Line number, starting at 1
        line: usize,
    },

    /// A batch script line is not a valid command
    #[error("invalid command on script line {line} ({source})")]
    Usage {
        /// Line number, starting at 1
        line: usize,

        /// Command-line parsing error
        #[source]
        source: clap::Error,
    },

    /// A batch script tried to run another batch script
    #[error("batch scripts cannot run other batch scripts")]
    NestedBatch,

    /// A batch script command failed
    #[error("command on script line {line} failed ({source})")]
    Line {
        /// Line number, starting at 1
        line: usize,

        /// What went wrong
        #[source]
        source: Box<CliError>,
    },
}
