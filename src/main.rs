//! Performance trace analysis: call trees, hotspots and GC heap generations

#![deny(missing_docs)]

mod batch;
mod commands;
mod dispatch;
mod display;
mod input;

use crate::{commands::CliError, dispatch::EventKind};
use calltree::FilterParams;
use clap::{Args, Parser, Subcommand};
use gcheap::Address;
use log::error;
use std::{
    fs::File,
    io::{self, BufReader},
    num::{NonZeroUsize, ParseIntError},
    path::PathBuf,
    process::ExitCode,
};

/// Aggregate the samples of a performance trace into call trees and query them
#[derive(Parser, Debug)]
#[clap(author, version, about)]
pub struct CliArgs {
    /// Analysis to be performed
    #[clap(subcommand)]
    pub command: Command,
}

/// Analysis to be performed
#[derive(Subcommand, Debug)]
pub enum Command {
    /// List the names with the highest exclusive metric
    Hotspots {
        /// Trace to be analyzed
        #[clap(flatten)]
        trace: TraceArgs,

        /// Number of names to be listed
        #[clap(short = 'n', long, default_value = "20")]
        count: usize,
    },

    /// Display the call tree, or the subtree below a node
    Tree {
        /// Trace to be analyzed
        #[clap(flatten)]
        trace: TraceArgs,

        /// Maximal depth to be displayed
        #[clap(short = 'd', long)]
        max_depth: Option<usize>,

        /// Names from the root to the node to be displayed
        path: Vec<String>,
    },

    /// Display the callers of every node with a certain name
    Callers {
        /// Trace to be analyzed
        #[clap(flatten)]
        trace: TraceArgs,

        /// Name whose callers should be displayed
        name: String,
    },

    /// Select the samples of a node and display their call tree
    Drill {
        /// Trace to be analyzed
        #[clap(flatten)]
        trace: TraceArgs,

        /// Only select samples which land in the node's own metric
        #[clap(short = 'x', long)]
        exclusive: bool,

        /// Maximal depth to be displayed
        #[clap(short = 'd', long)]
        max_depth: Option<usize>,

        /// Names from the root to the node of interest
        #[clap(required = true)]
        path: Vec<String>,
    },

    /// Display the time histogram of a node
    Histogram {
        /// Trace to be analyzed
        #[clap(flatten)]
        trace: TraceArgs,

        /// Names from the root to the node of interest (default: root)
        path: Vec<String>,
    },

    /// Tell which GC generation some heap addresses belong to
    Generation {
        /// Binary heap segment record, or JSON trace file with heap segments
        heap: PathBuf,

        /// Addresses to be looked up, in decimal or 0x-prefixed hexadecimal
        #[clap(required = true, value_parser = parse_address)]
        addresses: Vec<Address>,

        /// Save the heap segments as a binary record
        #[clap(long)]
        export: Option<PathBuf>,
    },

    /// Run commands from a script, one per line
    ///
    /// Lines are split into arguments following shell quoting rules. Empty
    /// lines and lines starting with # are ignored. Parsed traces are kept
    /// around and reused by subsequent commands.
    Batch {
        /// Script to be executed
        script: PathBuf,

        /// Maximal number of parsed traces kept around
        #[clap(long, default_value = "4")]
        cache_size: NonZeroUsize,
    },
}

/// Trace selection and filtering options
#[derive(Args, Clone, Debug)]
pub struct TraceArgs {
    /// JSON trace file to be analyzed
    pub input: PathBuf,

    /// Comma-separated kinds of events to be analyzed (default: all)
    #[clap(short = 'e', long, value_delimiter = ',')]
    pub events: Vec<EventKind>,

    /// Call tree filters
    #[clap(flatten)]
    pub filters: FilterArgs,
}

/// Call tree filter options
///
/// Patterns given on the command line are appended to those of the `--filters`
/// configuration file, other options replace its settings.
///
#[derive(Args, Clone, Debug, Default)]
pub struct FilterArgs {
    /// JSON file with base filter settings
    #[clap(long)]
    pub filters: Option<PathBuf>,

    /// Ignore samples taken before this time (ms)
    #[clap(long)]
    pub start: Option<f64>,

    /// Ignore samples taken after this time (ms)
    #[clap(long)]
    pub end: Option<f64>,

    /// Rename frames matching a regex, as "regex->name" or "regex"
    #[clap(short = 'g', long = "group")]
    pub group_pats: Vec<String>,

    /// Fold callees whose total is below this percentage into their caller
    #[clap(long)]
    pub fold_pct: Option<f64>,

    /// Fold frames matching a regex into their caller
    #[clap(short = 'f', long = "fold")]
    pub fold_pats: Vec<String>,

    /// Only keep samples with a frame matching each of these regexes
    #[clap(short = 'i', long = "include")]
    pub include_pats: Vec<String>,

    /// Drop samples with a frame matching any of these regexes
    #[clap(long = "exclude")]
    pub exclude_pats: Vec<String>,

    /// Number of histogram buckets
    #[clap(long)]
    pub buckets: Option<usize>,
}
//
impl FilterArgs {
    /// Combine the configuration file, if any, with command-line options
    pub fn params(&self) -> Result<FilterParams, CliError> {
        let mut params = match &self.filters {
            Some(path) => {
                let file = File::open(path).map_err(|source| CliError::FilterFile {
                    path: path.clone(),
                    source,
                })?;
                serde_json::from_reader(BufReader::new(file)).map_err(|source| {
                    CliError::FilterConfig {
                        path: path.clone(),
                        source,
                    }
                })?
            }
            None => FilterParams::default(),
        };
        if self.start.is_some() {
            params.start = self.start;
        }
        if self.end.is_some() {
            params.end = self.end;
        }
        params.group_pats.extend(self.group_pats.iter().cloned());
        if let Some(fold_pct) = self.fold_pct {
            params.fold_pct = fold_pct;
        }
        params.fold_pats.extend(self.fold_pats.iter().cloned());
        params.include_pats.extend(self.include_pats.iter().cloned());
        params.exclude_pats.extend(self.exclude_pats.iter().cloned());
        if let Some(buckets) = self.buckets {
            params.bucket_count = buckets;
        }
        Ok(params)
    }
}

/// Parse a heap address in decimal or 0x-prefixed hexadecimal
fn parse_address(s: &str) -> Result<Address, ParseIntError> {
    match s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        Some(hex) => Address::from_str_radix(hex, 16),
        None => s.parse(),
    }
}

fn main() -> ExitCode {
    env_logger::init();
    let args = CliArgs::parse();
    let stdout = io::stdout();
    match commands::run(args.command, &mut stdout.lock()) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{e}");
            ExitCode::FAILURE
        }
    }
}
