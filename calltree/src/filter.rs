//! Grouping, folding, inclusion and exclusion of call stack frames
//!
//! Raw call stacks go through the following steps before being aggregated
//! into a call tree:
//!
//! 1. Each frame name is rewritten by the first grouping rule that matches
//!    it, and consecutive frames rewritten into the same group are collapsed.
//! 2. Samples with a frame matching an exclusion pattern are dropped.
//! 3. Samples for which some inclusion pattern matches no frame are dropped.
//! 4. Frames matching a folding pattern are removed, so that their cost is
//!    attributed to their caller.
//!
//! All patterns are evaluated against post-grouping names. Samples outside of
//! the time window are dropped before any of this happens, and percentage
//! based folding happens after aggregation (see the `tree` module).

use crate::{
    interner::{CallStackIndex, FrameIndex, InternedStacks},
    tree::NodeName,
    Timestamp,
};
use asylum::name::{InternedNames, NameInterner};
use regex::Regex;
use serde::Deserialize;
use thiserror::Error;

/// Default number of histogram buckets per call tree node
pub const DEFAULT_BUCKET_COUNT: usize = 32;

/// Call tree construction parameters
#[derive(Clone, Debug, Deserialize, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct FilterParams {
    /// Samples taken before this time are ignored
    pub start: Option<Timestamp>,

    /// Samples taken after this time are ignored
    pub end: Option<Timestamp>,

    /// Grouping rules of the form `regex->replacement`, first match wins
    ///
    /// The replacement may refer to capture groups (`$1`, `$name`). A rule
    /// without `->` renames matching frames to the pattern itself.
    pub group_pats: Vec<String>,

    /// Nodes whose inclusive metric is below this percentage of the total are
    /// folded into their parent
    pub fold_pct: f64,

    /// Frames matching these patterns are folded into their caller
    pub fold_pats: Vec<String>,

    /// Each of these patterns must match some frame of a sample's stack
    pub include_pats: Vec<String>,

    /// Samples with a frame matching any of these patterns are dropped
    pub exclude_pats: Vec<String>,

    /// Number of histogram buckets per call tree node
    pub bucket_count: usize,
}
//
impl FilterParams {
    /// Validate the parameters and prepare them for use
    pub fn compile(&self) -> Result<StackFilter, FilterError> {
        if let (Some(start), Some(end)) = (self.start, self.end) {
            if !(start <= end) {
                return Err(FilterError::InvalidTimeWindow { start, end });
            }
        }
        for bound in [self.start, self.end].into_iter().flatten() {
            if bound.is_nan() {
                return Err(FilterError::InvalidTimeWindow {
                    start: self.start.unwrap_or(Timestamp::NEG_INFINITY),
                    end: self.end.unwrap_or(Timestamp::INFINITY),
                });
            }
        }
        if !(self.fold_pct >= 0.0 && self.fold_pct.is_finite()) {
            return Err(FilterError::InvalidFoldPercent(self.fold_pct));
        }
        if self.bucket_count == 0 {
            return Err(FilterError::NoBuckets);
        }
        Ok(StackFilter {
            start: self.start,
            end: self.end,
            groups: self
                .group_pats
                .iter()
                .map(|rule| GroupRule::parse(rule))
                .collect::<Result<_, _>>()?,
            fold_pct: self.fold_pct,
            fold: compile_patterns(&self.fold_pats)?,
            include: compile_patterns(&self.include_pats)?,
            exclude: compile_patterns(&self.exclude_pats)?,
            bucket_count: self.bucket_count,
        })
    }
}
//
impl Default for FilterParams {
    fn default() -> Self {
        Self {
            start: None,
            end: None,
            group_pats: Vec::new(),
            fold_pct: 0.0,
            fold_pats: Vec::new(),
            include_pats: Vec::new(),
            exclude_pats: Vec::new(),
            bucket_count: DEFAULT_BUCKET_COUNT,
        }
    }
}

/// Compile a list of regexes
fn compile_patterns(patterns: &[String]) -> Result<Box<[Regex]>, FilterError> {
    patterns.iter().map(|pattern| compile_pattern(pattern)).collect()
}

/// Compile a regex, keeping track of the pattern on failure
fn compile_pattern(pattern: &str) -> Result<Regex, FilterError> {
    Regex::new(pattern).map_err(|source| FilterError::InvalidPattern {
        pattern: pattern.into(),
        source,
    })
}

/// What can go wrong while validating call tree construction parameters
#[derive(Debug, Error)]
pub enum FilterError {
    /// The time window is reversed or not made of numbers
    #[error("invalid time window (start {start} must not come after end {end})")]
    InvalidTimeWindow {
        /// Requested start of the time window
        start: Timestamp,

        /// Requested end of the time window
        end: Timestamp,
    },

    /// A grouping, folding, inclusion or exclusion pattern is not a valid regex
    #[error("invalid pattern {pattern:?} ({source})")]
    InvalidPattern {
        /// Pattern which failed to compile
        pattern: Box<str>,

        /// Reason why it failed to compile
        #[source]
        source: regex::Error,
    },

    /// The fold percentage is negative or not finite
    #[error("fold percentage must be a finite non-negative number, got {0}")]
    InvalidFoldPercent(f64),

    /// Histograms would have no bucket
    #[error("histograms need at least one bucket")]
    NoBuckets,
}

/// Grouping rule
#[derive(Clone, Debug)]
struct GroupRule {
    /// Frames matching this pattern belong to the group
    pattern: Regex,

    /// Group name, possibly referring to capture groups of the pattern
    replacement: Box<str>,
}
//
impl GroupRule {
    /// Parse a `regex->replacement` rule
    fn parse(rule: &str) -> Result<Self, FilterError> {
        let (pattern, replacement) = rule
            .split_once("->")
            .map(|(pattern, replacement)| (pattern.trim(), replacement.trim()))
            .unwrap_or((rule.trim(), rule.trim()));
        Ok(Self {
            pattern: compile_pattern(pattern)?,
            replacement: replacement.into(),
        })
    }

    /// Group name of a frame, if it belongs to this group
    fn apply(&self, name: &str) -> Option<String> {
        let captures = self.pattern.captures(name)?;
        let mut group = String::new();
        captures.expand(&self.replacement, &mut group);
        Some(group)
    }
}

/// Validated call tree construction parameters
#[derive(Clone, Debug)]
pub struct StackFilter {
    /// Samples taken before this time are ignored
    start: Option<Timestamp>,

    /// Samples taken after this time are ignored
    end: Option<Timestamp>,

    /// Grouping rules, first match wins
    groups: Box<[GroupRule]>,

    /// Percentage-based folding threshold
    fold_pct: f64,

    /// Frames to be folded into their caller
    fold: Box<[Regex]>,

    /// Patterns that must all match some frame
    include: Box<[Regex]>,

    /// Patterns that must not match any frame
    exclude: Box<[Regex]>,

    /// Number of histogram buckets per node
    bucket_count: usize,
}
//
impl StackFilter {
    /// Truth that a sample taken at a certain time should be considered
    pub fn in_window(&self, time: Timestamp) -> bool {
        !time.is_nan()
            && self.start.map_or(true, |start| time >= start)
            && self.end.map_or(true, |end| time <= end)
    }

    /// Start of the time window, if bounded
    pub fn start(&self) -> Option<Timestamp> {
        self.start
    }

    /// End of the time window, if bounded
    pub fn end(&self) -> Option<Timestamp> {
        self.end
    }

    /// Percentage-based folding threshold
    pub fn fold_pct(&self) -> f64 {
        self.fold_pct
    }

    /// Number of histogram buckets per node
    pub fn bucket_count(&self) -> usize {
        self.bucket_count
    }

    /// Display name of a frame, and whether it comes from a grouping rule
    pub fn group(&self, name: &str) -> (Box<str>, bool) {
        self.groups
            .iter()
            .find_map(|rule| rule.apply(name))
            .map_or_else(|| (name.into(), false), |group| (group.into(), true))
    }

    /// Run a call stack, given as frame names from root to leaf, through the
    /// grouping, exclusion, inclusion and folding steps
    ///
    /// Returns `None` if the stack is filtered out, otherwise the display name
    /// path from root to leaf (which may be empty if all frames were folded).
    ///
    pub fn resolve_names<'name>(
        &self,
        root_to_leaf: impl IntoIterator<Item = &'name str>,
    ) -> Option<Vec<Box<str>>> {
        let frames = root_to_leaf
            .into_iter()
            .map(|name| DisplayFrame::new(self, name))
            .collect::<Vec<_>>();
        resolve_path(self, frames.iter(), |name| Some(name.into()))
    }
}

/// Display properties of a frame
#[derive(Clone, Debug)]
struct DisplayFrame {
    /// Post-grouping name
    name: Box<str>,

    /// Truth that the name comes from a grouping rule
    grouped: bool,

    /// Truth that the name matches an exclusion pattern
    excluded: bool,

    /// Which inclusion patterns the name matches
    included: Box<[bool]>,

    /// Truth that the name matches a folding pattern
    folded: bool,
}
//
impl DisplayFrame {
    /// Evaluate the display properties of a raw frame name
    fn new(filter: &StackFilter, raw_name: &str) -> Self {
        let (name, grouped) = filter.group(raw_name);
        let excluded = filter.exclude.iter().any(|regex| regex.is_match(&name));
        let included = filter
            .include
            .iter()
            .map(|regex| regex.is_match(&name))
            .collect();
        let folded = filter.fold.iter().any(|regex| regex.is_match(&name));
        Self {
            name,
            grouped,
            excluded,
            included,
            folded,
        }
    }
}

/// Turn root-to-leaf display frames into a path of node names
///
/// Returns `None` if the stack is filtered out or if `key` fails.
///
fn resolve_path<'frame, Key>(
    filter: &StackFilter,
    root_to_leaf: impl Iterator<Item = &'frame DisplayFrame>,
    mut key: impl FnMut(&str) -> Option<Key>,
) -> Option<Vec<Key>> {
    let mut included = vec![false; filter.include.len()];
    let mut path = Vec::new();
    let mut previous: Option<&DisplayFrame> = None;
    for frame in root_to_leaf {
        if frame.excluded {
            return None;
        }
        for (included, matched) in included.iter_mut().zip(frame.included.iter()) {
            *included |= *matched;
        }
        let collapsed = previous.map_or(false, |previous| {
            frame.grouped && previous.grouped && previous.name == frame.name
        });
        previous = Some(frame);
        if collapsed || frame.folded {
            continue;
        }
        path.push(key(&frame.name)?);
    }
    included.iter().all(|&matched| matched).then_some(path)
}

/// Source of node name keys for the path resolver
pub(crate) trait NameTable {
    /// Key of a display name, if it is (or can be) part of the table
    fn key(&mut self, name: &str) -> Option<NodeName>;
}
//
impl NameTable for NameInterner<NodeName> {
    fn key(&mut self, name: &str) -> Option<NodeName> {
        Some(self.intern(name))
    }
}
//
impl NameTable for &InternedNames<NodeName> {
    fn key(&mut self, name: &str) -> Option<NodeName> {
        self.lookup(name)
    }
}

/// Memoized translation of call stacks into paths of node names
///
/// Each distinct frame and call stack is only run through the filter once.
///
pub(crate) struct PathResolver<'a> {
    /// Filter being applied
    filter: &'a StackFilter,

    /// Call stacks being resolved
    stacks: &'a InternedStacks,

    /// Display properties of frames, indexed by FrameIndex
    frames: Vec<Option<DisplayFrame>>,

    /// Resolved paths, indexed by CallStackIndex
    ///
    /// The outer Option tells if the stack was resolved yet, the inner one
    /// tells if the stack passed the filter.
    paths: Vec<Option<Option<Box<[NodeName]>>>>,

    /// Buffer for frames of the stack being resolved
    buffer: Vec<FrameIndex>,
}
//
impl<'a> PathResolver<'a> {
    /// Prepare to resolve call stacks
    pub fn new(filter: &'a StackFilter, stacks: &'a InternedStacks) -> Self {
        Self {
            filter,
            stacks,
            frames: vec![None; stacks.num_frames()],
            paths: vec![None; stacks.num_stacks()],
            buffer: Vec::new(),
        }
    }

    /// Root-to-leaf node name path of a call stack, if it passes the filter
    ///
    /// Panics if the call stack does not belong to the underlying stacks.
    ///
    pub fn resolve(
        &mut self,
        stack: CallStackIndex,
        names: &mut impl NameTable,
    ) -> Option<&[NodeName]> {
        let idx = stack.index();
        if self.paths[idx].is_none() {
            let path = self.compute(stack, names);
            self.paths[idx] = Some(path);
        }
        self.paths[idx].as_ref().and_then(|path| path.as_deref())
    }

    /// Number of distinct call stacks resolved so far
    pub fn num_resolved(&self) -> usize {
        self.paths.iter().filter(|path| path.is_some()).count()
    }

    /// Resolve a call stack that was not seen before
    fn compute(
        &mut self,
        stack: CallStackIndex,
        names: &mut impl NameTable,
    ) -> Option<Box<[NodeName]>> {
        self.buffer.clear();
        self.buffer.extend(self.stacks.frames_from_leaf(stack));
        self.buffer.reverse();
        for &frame in &self.buffer {
            let slot = &mut self.frames[frame.index()];
            if slot.is_none() {
                *slot = Some(DisplayFrame::new(
                    self.filter,
                    self.stacks.frame_name(frame),
                ));
            }
        }
        let frames = &self.frames;
        let display_frames = self
            .buffer
            .iter()
            .filter_map(|frame| frames[frame.index()].as_ref());
        resolve_path(self.filter, display_frames, |name| names.key(name))
            .map(Vec::into_boxed_slice)
    }
}
