//! Caller->callee tree of aggregated samples

use crate::{
    cancel::CancellationToken,
    filter::{FilterParams, PathResolver, StackFilter},
    histogram::{Histogram, HistogramController},
    interner::CallStackIndex,
    sample::{Sample, SampleIndex, SampleList, SampleSource},
    FilterError, Metric, Timestamp,
};
use ahash::RandomState;
use asylum::{
    interner_key,
    name::{InternedNames, NameInterner},
};
use hashbrown::HashMap;
use log::debug;
use std::{
    cmp::Ordering,
    collections::VecDeque,
    fmt::{self, Debug, Formatter},
    mem,
};
use thiserror::Error;

interner_key! {
    /// Interned display name of a call tree node
    pub struct NodeName;
}

/// Display name of the root of every call tree
pub const ROOT_NAME: &str = "ROOT";

/// Relative tolerance of the additivity checks
const ADDITIVITY_TOLERANCE: f64 = 1e-9;

/// Identifier of a node within a call tree
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct NodeId(usize);
//
impl NodeId {
    /// Root of every call tree
    pub const ROOT: Self = Self(0);

    /// Index of this node in the tree's node arena
    pub fn index(self) -> usize {
        self.0
    }
}

/// Tree of aggregated samples
///
/// Each node stands for a display name reached through a given sequence of
/// callers. The tree is immutable once built: changing the filter
/// configuration means building a new tree from the same sample source.
///
#[derive(Debug)]
pub struct CallTree {
    /// Nodes in breadth-first order, starting with the root
    nodes: Box<[NodeData]>,

    /// Display names of nodes
    names: InternedNames<NodeName>,

    /// Configuration which the tree was built with
    filter: StackFilter,

    /// Time range covered by node histograms
    controller: HistogramController,

    /// Inclusive metric of the root, which percentages are relative to
    percentage_basis: Metric,

    /// Statistics collected while building the tree
    stats: BuildStats,
}
//
impl CallTree {
    /// Aggregate the samples of a source into a tree
    pub fn build<Source: SampleSource + ?Sized>(
        source: &Source,
        params: &FilterParams,
    ) -> Result<Self, CallTreeError> {
        Self::build_with_cancel(source, params, &CancellationToken::new())
    }

    /// Like [`build()`](Self::build), but stop early if `cancel` is triggered
    ///
    /// Configuration errors are reported before any sample is looked at. If
    /// some sample references a call stack that the source's interner does not
    /// know about, or if the build is cancelled, an error is returned and no
    /// tree is built.
    ///
    pub fn build_with_cancel<Source: SampleSource + ?Sized>(
        source: &Source,
        params: &FilterParams,
        cancel: &CancellationToken,
    ) -> Result<Self, CallTreeError> {
        let filter = params.compile()?;
        let stacks = source.stacks();
        let controller = histogram_controller(source, &filter, cancel)?;

        // Aggregate samples into the tree
        let mut stats = BuildStats::default();
        let mut builder = TreeBuilder::new(controller);
        let mut resolver = PathResolver::new(&filter, stacks);
        for sample in source.samples() {
            if cancel.is_cancelled() {
                return Err(CallTreeError::Cancelled);
            }
            stats.samples += 1;
            if !filter.in_window(sample.time) {
                stats.out_of_window += 1;
                continue;
            }
            if !stacks.contains(sample.stack) {
                return Err(CallTreeError::UnknownStack {
                    sample: sample.index,
                    stack: sample.stack,
                });
            }
            match resolver.resolve(sample.stack, &mut builder.names) {
                Some(path) if !path.is_empty() => {
                    builder.record(path, &sample);
                    stats.aggregated += 1;
                }
                _ => stats.filtered += 1,
            }
        }
        stats.distinct_stacks = resolver.num_resolved();
        stats.nodes_before_folding = builder.nodes.len();

        // Fold nodes which are too small, then compact the node arena
        let TreeBuilder { mut nodes, names, .. } = builder;
        let names = names.finalize();
        let percentage_basis = nodes[NodeId::ROOT.index()].inclusive_metric;
        stats.folded = fold_small_nodes(&mut nodes, filter.fold_pct(), percentage_basis);
        let nodes = compact(nodes, &names);
        stats.nodes = nodes.len();
        stats.log();

        Ok(Self {
            nodes,
            names,
            filter,
            controller,
            percentage_basis,
            stats,
        })
    }

    /// Root of the tree
    pub fn root(&self) -> CallTreeNode<'_> {
        self.view(NodeId::ROOT)
    }

    /// Access a node by its identifier
    pub fn node(&self, id: NodeId) -> Option<CallTreeNode<'_>> {
        (id.index() < self.nodes.len()).then(|| self.view(id))
    }

    /// Every node of the tree, in breadth-first order starting from the root
    pub fn nodes(&self) -> impl Iterator<Item = CallTreeNode<'_>> + Clone {
        (0..self.nodes.len()).map(|idx| self.view(NodeId(idx)))
    }

    /// Number of nodes, including the root
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    /// Truth that the tree only has a root
    pub fn is_empty(&self) -> bool {
        self.nodes.len() == 1
    }

    /// Metric which percentages are relative to (root inclusive metric)
    pub fn percentage_basis(&self) -> Metric {
        self.percentage_basis
    }

    /// Express a metric as a percentage of the percentage basis
    pub fn percent(&self, metric: Metric) -> f64 {
        if self.percentage_basis == 0.0 {
            0.0
        } else {
            metric * 100.0 / self.percentage_basis
        }
    }

    /// Time range covered by node histograms
    pub fn histogram_controller(&self) -> &HistogramController {
        &self.controller
    }

    /// Configuration which the tree was built with
    pub fn filter(&self) -> &StackFilter {
        &self.filter
    }

    /// Statistics collected while building the tree
    pub fn stats(&self) -> &BuildStats {
        &self.stats
    }

    /// Locate a node by the display names on the way to it from the root
    ///
    /// The root itself is found at the empty path.
    ///
    pub fn find_path<'name>(
        &self,
        path: impl IntoIterator<Item = &'name str>,
    ) -> Option<CallTreeNode<'_>> {
        let mut node = self.root();
        for name in path {
            let name = self.names.lookup(name)?;
            node = node.children().find(|child| child.data.name == name)?;
        }
        Some(node)
    }

    /// Check that metrics add up on every node
    ///
    /// The inclusive metric and count of a node must be the sum of its
    /// exclusive and exclusive-folded quantities and of the inclusive
    /// quantities of its children, up to floating-point rounding.
    ///
    pub fn check_invariants(&self) -> Result<(), InvariantError> {
        for node in self.nodes() {
            let mut metric_parts = vec![node.exclusive_metric(), node.exclusive_folded_metric()];
            let mut count_parts = vec![node.exclusive_count(), node.exclusive_folded_count()];
            for child in node.children() {
                if child.data.parent != Some(node.id) {
                    return Err(InvariantError::BrokenParentLink {
                        parent: node.id,
                        child: child.id,
                    });
                }
                metric_parts.push(child.inclusive_metric());
                count_parts.push(child.inclusive_count());
            }
            let metric_sum = metric_parts.iter().sum::<Metric>();
            if !nearly_equal(node.inclusive_metric(), &metric_parts) {
                return Err(InvariantError::MetricNotAdditive {
                    node: node.id,
                    inclusive: node.inclusive_metric(),
                    parts: metric_sum,
                });
            }
            let count_sum = count_parts.iter().sum::<Metric>();
            if !nearly_equal(node.inclusive_count(), &count_parts) {
                return Err(InvariantError::CountNotAdditive {
                    node: node.id,
                    inclusive: node.inclusive_count(),
                    parts: count_sum,
                });
            }
        }
        Ok(())
    }

    /// Merge all nodes which share a display name
    ///
    /// Exclusive quantities are summed over every node with a given name,
    /// while inclusive quantities are only summed over outermost occurrences
    /// so that recursion is not counted twice. Entries are sorted by
    /// decreasing exclusive metric, then by name. The root is not listed.
    ///
    pub fn by_name(&self) -> Vec<ByNameEntry<'_>> {
        let mut entries = HashMap::<NodeName, ByNameEntry, RandomState>::default();
        for (node, outermost) in self.outermost_walk() {
            if node.is_root() {
                continue;
            }
            let entry = entries
                .entry(node.data.name)
                .or_insert_with(|| ByNameEntry::new(node.name()));
            entry.exclusive_metric += node.exclusive_metric();
            entry.exclusive_count += node.exclusive_count();
            entry.exclusive_folded_metric += node.exclusive_folded_metric();
            entry.exclusive_folded_count += node.exclusive_folded_count();
            if outermost {
                entry.inclusive_metric += node.inclusive_metric();
                entry.inclusive_count += node.inclusive_count();
            }
            if let Some(first_time) = node.first_time() {
                entry.first_time = Some(entry.first_time.map_or(first_time, |t| t.min(first_time)));
            }
            if let Some(last_time) = node.last_time() {
                entry.last_time = Some(entry.last_time.map_or(last_time, |t| t.max(last_time)));
            }
            entry.nodes.push(node.id);
        }
        let mut entries = entries.into_values().collect::<Vec<_>>();
        entries.sort_unstable_by(|a, b| {
            b.exclusive_metric
                .total_cmp(&a.exclusive_metric)
                .then_with(|| a.name.cmp(b.name))
        });
        entries
    }

    /// Names with the highest exclusive metric
    pub fn hotspots(&self, count: usize) -> Vec<ByNameEntry<'_>> {
        let mut entries = self.by_name();
        entries.truncate(count);
        entries
    }

    /// Inverted tree of the callers of every node with a certain name
    ///
    /// The caller tree is rooted at the named node. Its children are the
    /// callers of that node, its grandchildren are the callers of the callers,
    /// and so on. Each caller path is weighted by the inclusive metric of the
    /// outermost occurrences of the name that it leads to.
    ///
    /// Returns `None` if no node other than the root has this name.
    ///
    pub fn caller_tree(&self, name: &str) -> Option<CallerTree> {
        let name = self.names.lookup(name)?;
        let mut callers = CallerTreeBuilder::new(self.names.resolve(name));
        let mut found = false;
        for (node, outermost) in self.outermost_walk() {
            if node.is_root() || node.data.name != name || !outermost {
                continue;
            }
            found = true;
            let (metric, count) = (node.inclusive_metric(), node.inclusive_count());
            let mut current = 0;
            callers.add(current, metric, count);
            let mut caller = node.parent();
            while let Some(node) = caller.filter(|node| !node.is_root()) {
                current = callers.child(current, node.name());
                callers.add(current, metric, count);
                caller = node.parent();
            }
        }
        found.then(|| callers.build(self.percentage_basis))
    }

    /// Select the samples of a source which contribute to a node
    ///
    /// This reproduces the filtering of the tree build on `source`, which
    /// should be the source the tree was built from or a subset thereof. With
    /// [`DrillKind::Inclusive`], every sample whose path goes through `node`
    /// is selected. With [`DrillKind::Exclusive`], only samples whose metric
    /// ends up in the exclusive or exclusive-folded metric of `node` are.
    ///
    /// The resulting samples keep their original index and share the
    /// source's interned call stacks, ready for a new tree build.
    ///
    pub fn drill_into<Source: SampleSource + ?Sized>(
        &self,
        node: NodeId,
        kind: DrillKind,
        source: &Source,
        cancel: &CancellationToken,
    ) -> Result<SampleList, CallTreeError> {
        let target = self.node(node).ok_or(CallTreeError::UnknownNode(node))?;
        let mut target_path = target
            .ancestors()
            .filter(|node| !node.is_root())
            .map(|node| node.data.name)
            .collect::<Vec<_>>();
        target_path.reverse();

        let stacks = source.stacks();
        let mut resolver = PathResolver::new(&self.filter, stacks);
        let mut names = &self.names;
        let mut selected = Vec::new();
        for sample in source.samples() {
            if cancel.is_cancelled() {
                return Err(CallTreeError::Cancelled);
            }
            if !self.filter.in_window(sample.time) {
                continue;
            }
            if !stacks.contains(sample.stack) {
                return Err(CallTreeError::UnknownStack {
                    sample: sample.index,
                    stack: sample.stack,
                });
            }
            let Some(path) = resolver.resolve(sample.stack, &mut names) else {
                continue;
            };
            if path.is_empty() || !path.starts_with(&target_path) {
                continue;
            }
            let contributes = match kind {
                DrillKind::Inclusive => true,
                DrillKind::Exclusive => match path.get(target_path.len()) {
                    None => true,
                    Some(&callee) => target.children().all(|child| child.data.name != callee),
                },
            };
            if contributes {
                selected.push(sample);
            }
        }
        debug!(
            "Drilled into {:?} ({kind:?}): selected {} samples",
            target.path(),
            selected.len()
        );
        Ok(SampleList::new(stacks.clone(), selected))
    }

    /// Walk the tree depth-first, telling for each node if it is the outermost
    /// occurrence of its name on the path from the root
    fn outermost_walk(&self) -> Vec<(CallTreeNode<'_>, bool)> {
        let mut nesting = vec![0usize; self.names.len()];
        let mut result = Vec::with_capacity(self.nodes.len());
        let mut todo = vec![(NodeId::ROOT, true)];
        while let Some((id, entering)) = todo.pop() {
            let node = self.view(id);
            let depth = &mut nesting[node.data.name.index()];
            if !entering {
                *depth -= 1;
                continue;
            }
            result.push((node, *depth == 0));
            *depth += 1;
            todo.push((id, false));
            todo.extend(node.data.children.iter().rev().map(|&child| (child, true)));
        }
        result
    }

    /// Build a view of a node, panics on invalid identifiers
    fn view(&self, id: NodeId) -> CallTreeNode<'_> {
        CallTreeNode {
            tree: self,
            id,
            data: &self.nodes[id.index()],
        }
    }
}

/// Prepare histograms to cover the time window, or the in-window samples if
/// the time window is not fully specified
fn histogram_controller<Source: SampleSource + ?Sized>(
    source: &Source,
    filter: &StackFilter,
    cancel: &CancellationToken,
) -> Result<HistogramController, CallTreeError> {
    let observed = if let (Some(start), Some(end)) = (filter.start(), filter.end()) {
        Some((start, end))
    } else {
        let mut observed: Option<(Timestamp, Timestamp)> = None;
        for sample in source.samples() {
            if cancel.is_cancelled() {
                return Err(CallTreeError::Cancelled);
            }
            if filter.in_window(sample.time) && sample.time.is_finite() {
                observed = Some(observed.map_or((sample.time, sample.time), |(min, max)| {
                    (min.min(sample.time), max.max(sample.time))
                }));
            }
        }
        observed
    };
    let start = filter
        .start()
        .or(observed.map(|(min, _)| min))
        .or(filter.end())
        .unwrap_or(0.0);
    let end = filter
        .end()
        .or(observed.map(|(_, max)| max))
        .unwrap_or(start)
        .max(start);
    Ok(HistogramController::new(start, end, filter.bucket_count()))
}

/// Compare a value with the sum of some parts, with some rounding tolerance
fn nearly_equal(value: Metric, parts: &[Metric]) -> bool {
    let sum = parts.iter().sum::<Metric>();
    let scale = parts
        .iter()
        .fold(value.abs(), |scale, part| scale.max(part.abs()));
    (value - sum).abs() <= ADDITIVITY_TOLERANCE * scale.max(1.0)
}

/// Hierarchical view of a call tree node
#[derive(Clone, Copy)]
pub struct CallTreeNode<'tree> {
    /// Tree which this node belongs to
    tree: &'tree CallTree,

    /// Identifier of this node
    id: NodeId,

    /// Node which we are looking at
    data: &'tree NodeData,
}
//
impl<'tree> CallTreeNode<'tree> {
    /// Identifier of this node, can be used to get back to it later on
    pub fn id(&self) -> NodeId {
        self.id
    }

    /// Post-grouping display name
    pub fn name(&self) -> &'tree str {
        self.tree.names.resolve(self.data.name)
    }

    /// Truth that this is the root of the tree
    pub fn is_root(&self) -> bool {
        self.id == NodeId::ROOT
    }

    /// Metric of every sample whose path goes through this node
    pub fn inclusive_metric(&self) -> Metric {
        self.data.inclusive_metric
    }

    /// Count of every sample whose path goes through this node
    pub fn inclusive_count(&self) -> Metric {
        self.data.inclusive_count
    }

    /// Metric of samples whose path ends at this node
    pub fn exclusive_metric(&self) -> Metric {
        self.data.exclusive_metric
    }

    /// Count of samples whose path ends at this node
    pub fn exclusive_count(&self) -> Metric {
        self.data.exclusive_count
    }

    /// Metric of children which were folded into this node
    pub fn exclusive_folded_metric(&self) -> Metric {
        self.data.exclusive_folded_metric
    }

    /// Count of children which were folded into this node
    pub fn exclusive_folded_count(&self) -> Metric {
        self.data.exclusive_folded_count
    }

    /// Inclusive metric as a percentage of the root's
    pub fn inclusive_percent(&self) -> f64 {
        self.tree.percent(self.data.inclusive_metric)
    }

    /// Exclusive metric as a percentage of the root's inclusive metric
    pub fn exclusive_percent(&self) -> f64 {
        self.tree.percent(self.data.exclusive_metric)
    }

    /// Time of the earliest sample that went through this node
    pub fn first_time(&self) -> Option<Timestamp> {
        self.data.time_range().map(|(first, _)| first)
    }

    /// Time of the latest sample that went through this node
    pub fn last_time(&self) -> Option<Timestamp> {
        self.data.time_range().map(|(_, last)| last)
    }

    /// Inclusive metric over time
    pub fn histogram(&self) -> &'tree Histogram {
        &self.data.histogram
    }

    /// Caller of this node, if this is not the root
    pub fn parent(&self) -> Option<CallTreeNode<'tree>> {
        self.data.parent.map(|id| self.tree.view(id))
    }

    /// Path from this node to the root, starting with this node
    pub fn ancestors(&self) -> impl Iterator<Item = CallTreeNode<'tree>> + Clone {
        std::iter::successors(Some(*self), |node| node.parent())
    }

    /// Callees of this node, by decreasing inclusive metric then name
    pub fn children(&self) -> impl Iterator<Item = CallTreeNode<'tree>> + Clone {
        let tree = self.tree;
        self.data.children.iter().map(move |&id| tree.view(id))
    }

    /// Display names from the root (excluded) to this node (included)
    pub fn path(&self) -> Vec<&'tree str> {
        let mut path = self
            .ancestors()
            .filter(|node| !node.is_root())
            .map(|node| node.name())
            .collect::<Vec<_>>();
        path.reverse();
        path
    }
}
//
impl Debug for CallTreeNode<'_> {
    fn fmt(&self, f: &mut Formatter<'_>) -> Result<(), fmt::Error> {
        f.debug_struct("CallTreeNode")
            .field("id", &self.id)
            .field("name", &self.name())
            .field("data", &self.data)
            // Elide the CallTree from output as that's huge
            .finish_non_exhaustive()
    }
}

/// Aggregated quantities of a call tree node
#[derive(Clone, Debug, PartialEq)]
struct NodeData {
    /// Display name
    name: NodeName,

    /// Caller node, if this is not the root
    parent: Option<NodeId>,

    /// Callee nodes
    children: Vec<NodeId>,

    /// Metric of samples going through this node
    inclusive_metric: Metric,

    /// Count of samples going through this node
    inclusive_count: Metric,

    /// Metric of samples ending at this node
    exclusive_metric: Metric,

    /// Count of samples ending at this node
    exclusive_count: Metric,

    /// Inclusive metric of folded children
    exclusive_folded_metric: Metric,

    /// Inclusive count of folded children
    exclusive_folded_count: Metric,

    /// Earliest sample time, +inf if there was no sample
    first_time: Timestamp,

    /// Latest sample time, -inf if there was no sample
    last_time: Timestamp,

    /// Inclusive metric over time
    histogram: Histogram,
}
//
impl NodeData {
    /// Set up a node which has not received any sample yet
    fn new(name: NodeName, parent: Option<NodeId>, histogram: Histogram) -> Self {
        Self {
            name,
            parent,
            children: Vec::new(),
            inclusive_metric: 0.0,
            inclusive_count: 0.0,
            exclusive_metric: 0.0,
            exclusive_count: 0.0,
            exclusive_folded_metric: 0.0,
            exclusive_folded_count: 0.0,
            first_time: Timestamp::INFINITY,
            last_time: Timestamp::NEG_INFINITY,
            histogram,
        }
    }

    /// Account for a sample whose path goes through this node
    fn add_inclusive(&mut self, sample: &Sample, bucket: Option<usize>) {
        self.inclusive_metric += sample.metric;
        self.inclusive_count += sample.count;
        self.first_time = self.first_time.min(sample.time);
        self.last_time = self.last_time.max(sample.time);
        if let Some(bucket) = bucket {
            self.histogram.add_metric(sample.metric, bucket);
        }
    }

    /// First and last sample time, if some sample went through this node
    fn time_range(&self) -> Option<(Timestamp, Timestamp)> {
        (self.first_time <= self.last_time).then_some((self.first_time, self.last_time))
    }
}

/// Mechanism to aggregate samples into a node arena
struct TreeBuilder {
    /// Nodes created so far, starting with the root
    nodes: Vec<NodeData>,

    /// Child of each (parent, name) pair
    children: HashMap<(NodeId, NodeName), NodeId, RandomState>,

    /// Display names seen so far
    names: NameInterner<NodeName>,

    /// Time range covered by histograms
    controller: HistogramController,
}
//
impl TreeBuilder {
    /// Set up a tree with only a root
    fn new(controller: HistogramController) -> Self {
        let mut names = NameInterner::new();
        let root_name = names.intern(ROOT_NAME);
        Self {
            nodes: vec![NodeData::new(root_name, None, controller.histogram())],
            children: HashMap::default(),
            names,
            controller,
        }
    }

    /// Record a sample whose path was already resolved
    ///
    /// The root and every node on the path receive the sample inclusively,
    /// and the last node also receives it exclusively.
    ///
    fn record(&mut self, path: &[NodeName], sample: &Sample) {
        let bucket = self.controller.bucket_for(sample.time);
        let mut current = NodeId::ROOT;
        self.nodes[current.index()].add_inclusive(sample, bucket);
        for &name in path {
            current = self.child(current, name);
            self.nodes[current.index()].add_inclusive(sample, bucket);
        }
        let leaf = &mut self.nodes[current.index()];
        leaf.exclusive_metric += sample.metric;
        leaf.exclusive_count += sample.count;
    }

    /// Locate or create the child of a node with a certain name
    fn child(&mut self, parent: NodeId, name: NodeName) -> NodeId {
        let nodes = &mut self.nodes;
        let controller = &self.controller;
        *self.children.entry((parent, name)).or_insert_with(|| {
            let id = NodeId(nodes.len());
            nodes.push(NodeData::new(name, Some(parent), controller.histogram()));
            nodes[parent.index()].children.push(id);
            id
        })
    }
}

/// Fold nodes whose inclusive metric is too small a percentage of the basis
/// into their parent, return how many subtrees were folded
///
/// Folded subtrees are detached from their parent but stay in the arena.
///
fn fold_small_nodes(nodes: &mut [NodeData], fold_pct: f64, basis: Metric) -> usize {
    if fold_pct <= 0.0 || basis == 0.0 {
        return 0;
    }
    let mut folded = 0;
    let mut todo = vec![NodeId::ROOT];
    while let Some(id) = todo.pop() {
        let children = mem::take(&mut nodes[id.index()].children);
        let mut kept = Vec::with_capacity(children.len());
        for child in children {
            let (metric, count) = {
                let child = &nodes[child.index()];
                (child.inclusive_metric, child.inclusive_count)
            };
            if metric.abs() * 100.0 / basis.abs() < fold_pct {
                let parent = &mut nodes[id.index()];
                parent.exclusive_folded_metric += metric;
                parent.exclusive_folded_count += count;
                folded += 1;
            } else {
                kept.push(child);
                todo.push(child);
            }
        }
        nodes[id.index()].children = kept;
    }
    folded
}

/// Drop detached nodes, renumber the others in breadth-first order, and sort
/// children by decreasing inclusive metric then name
fn compact(nodes: Vec<NodeData>, names: &InternedNames<NodeName>) -> Box<[NodeData]> {
    let mut slots = nodes.into_iter().map(Some).collect::<Vec<_>>();
    let mut compacted = Vec::new();
    let mut todo = VecDeque::from([(NodeId::ROOT, None)]);
    let mut next_id = 1;
    while let Some((old_id, parent)) = todo.pop_front() {
        let Some(mut data) = slots[old_id.index()].take() else {
            continue;
        };
        let new_id = NodeId(compacted.len());
        let mut children = mem::take(&mut data.children);
        children.sort_by(|a, b| {
            match (&slots[a.index()], &slots[b.index()]) {
                (Some(a), Some(b)) => b
                    .inclusive_metric
                    .total_cmp(&a.inclusive_metric)
                    .then_with(|| names.resolve(a.name).cmp(names.resolve(b.name))),
                _ => Ordering::Equal,
            }
        });
        data.parent = parent;
        data.children = (next_id..next_id + children.len()).map(NodeId).collect();
        next_id += children.len();
        todo.extend(children.into_iter().map(|child| (child, Some(new_id))));
        compacted.push(data);
    }
    compacted.into_boxed_slice()
}

/// Statistics collected while building a call tree
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct BuildStats {
    /// Samples provided by the source
    pub samples: usize,

    /// Samples outside of the time window
    pub out_of_window: usize,

    /// In-window samples rejected by filters or with an empty path
    pub filtered: usize,

    /// Samples aggregated into the tree
    pub aggregated: usize,

    /// Distinct call stacks that went through the filters
    pub distinct_stacks: usize,

    /// Nodes before percentage-based folding
    pub nodes_before_folding: usize,

    /// Subtrees folded into their parent
    pub folded: usize,

    /// Nodes in the final tree, including the root
    pub nodes: usize,
}
//
impl BuildStats {
    /// Log these statistics
    fn log(&self) {
        debug!("Call tree build statistics:");
        debug!(
            "- Samples: {} total, {} out of window, {} filtered out, {} aggregated",
            self.samples, self.out_of_window, self.filtered, self.aggregated
        );
        debug!("- Distinct call stacks: {}", self.distinct_stacks);
        debug!(
            "- Nodes: {} before folding, {} subtrees folded, {} in final tree",
            self.nodes_before_folding, self.folded, self.nodes
        );
    }
}

/// Quantities of every call tree node with a given name
#[derive(Clone, Debug, PartialEq)]
pub struct ByNameEntry<'tree> {
    /// Display name
    pub name: &'tree str,

    /// Inclusive metric of the outermost nodes with this name
    pub inclusive_metric: Metric,

    /// Inclusive count of the outermost nodes with this name
    pub inclusive_count: Metric,

    /// Exclusive metric of all nodes with this name
    pub exclusive_metric: Metric,

    /// Exclusive count of all nodes with this name
    pub exclusive_count: Metric,

    /// Exclusive folded metric of all nodes with this name
    pub exclusive_folded_metric: Metric,

    /// Exclusive folded count of all nodes with this name
    pub exclusive_folded_count: Metric,

    /// Earliest sample time across nodes with this name
    pub first_time: Option<Timestamp>,

    /// Latest sample time across nodes with this name
    pub last_time: Option<Timestamp>,

    /// Nodes with this name, in depth-first order
    pub nodes: Vec<NodeId>,
}
//
impl<'tree> ByNameEntry<'tree> {
    /// Set up an entry for a name that has no node yet
    fn new(name: &'tree str) -> Self {
        Self {
            name,
            inclusive_metric: 0.0,
            inclusive_count: 0.0,
            exclusive_metric: 0.0,
            exclusive_count: 0.0,
            exclusive_folded_metric: 0.0,
            exclusive_folded_count: 0.0,
            first_time: None,
            last_time: None,
            nodes: Vec::new(),
        }
    }
}

/// Inverted call tree, from a node up to its transitive callers
#[derive(Clone, Debug, PartialEq)]
pub struct CallerTree {
    /// Nodes in creation order, starting with the callee of interest
    nodes: Box<[CallerNode]>,

    /// Metric which percentages are relative to
    percentage_basis: Metric,
}
//
impl CallerTree {
    /// Node which callers are being looked up
    pub fn root(&self) -> CallerTreeNode<'_> {
        CallerTreeNode { tree: self, idx: 0 }
    }

    /// Number of nodes, including the root
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    /// Truth that the node of interest has no caller except the call tree root
    pub fn is_empty(&self) -> bool {
        self.nodes.len() == 1
    }
}

/// Hierarchical view of a caller tree node
#[derive(Clone, Copy)]
pub struct CallerTreeNode<'callers> {
    /// Tree which this node belongs to
    tree: &'callers CallerTree,

    /// Index of this node in CallerTree::nodes
    idx: usize,
}
//
impl<'callers> CallerTreeNode<'callers> {
    /// Display name
    pub fn name(&self) -> &'callers str {
        &self.node().name
    }

    /// Metric going through this chain of callers
    pub fn metric(&self) -> Metric {
        self.node().metric
    }

    /// Count going through this chain of callers
    pub fn count(&self) -> Metric {
        self.node().count
    }

    /// Metric as a percentage of the call tree's percentage basis
    pub fn percent(&self) -> f64 {
        let basis = self.tree.percentage_basis;
        if basis == 0.0 {
            0.0
        } else {
            self.metric() * 100.0 / basis
        }
    }

    /// Callers of this node, by decreasing metric then name
    pub fn callers(&self) -> impl Iterator<Item = CallerTreeNode<'callers>> + Clone {
        let tree = self.tree;
        tree.nodes[self.idx]
            .children
            .iter()
            .map(move |&idx| CallerTreeNode { tree, idx })
    }

    /// Underlying node data
    fn node(&self) -> &'callers CallerNode {
        &self.tree.nodes[self.idx]
    }
}
//
impl Debug for CallerTreeNode<'_> {
    fn fmt(&self, f: &mut Formatter<'_>) -> Result<(), fmt::Error> {
        f.debug_struct("CallerTreeNode")
            .field("node", self.node())
            .finish_non_exhaustive()
    }
}

/// Node of a caller tree
#[derive(Clone, Debug, PartialEq)]
struct CallerNode {
    /// Display name
    name: Box<str>,

    /// Metric going through this chain of callers
    metric: Metric,

    /// Count going through this chain of callers
    count: Metric,

    /// Indices of caller nodes
    children: Vec<usize>,
}

/// Mechanism to build a CallerTree
struct CallerTreeBuilder<'tree> {
    /// Nodes created so far
    nodes: Vec<CallerNode>,

    /// Child of each (node index, name) pair
    children: HashMap<(usize, &'tree str), usize, RandomState>,
}
//
impl<'tree> CallerTreeBuilder<'tree> {
    /// Start with the node whose callers are being looked up
    fn new(name: &str) -> Self {
        Self {
            nodes: vec![CallerNode::new(name)],
            children: HashMap::default(),
        }
    }

    /// Locate or create the caller of a node with a certain name
    fn child(&mut self, parent: usize, name: &'tree str) -> usize {
        let nodes = &mut self.nodes;
        *self.children.entry((parent, name)).or_insert_with(|| {
            let idx = nodes.len();
            nodes.push(CallerNode::new(name));
            nodes[parent].children.push(idx);
            idx
        })
    }

    /// Add some metric to a node
    fn add(&mut self, idx: usize, metric: Metric, count: Metric) {
        let node = &mut self.nodes[idx];
        node.metric += metric;
        node.count += count;
    }

    /// Sort callers and finish building the tree
    fn build(mut self, percentage_basis: Metric) -> CallerTree {
        for idx in 0..self.nodes.len() {
            let mut children = mem::take(&mut self.nodes[idx].children);
            let nodes = &self.nodes;
            children.sort_by(|&a, &b| {
                nodes[b]
                    .metric
                    .total_cmp(&nodes[a].metric)
                    .then_with(|| nodes[a].name.cmp(&nodes[b].name))
            });
            self.nodes[idx].children = children;
        }
        CallerTree {
            nodes: self.nodes.into_boxed_slice(),
            percentage_basis,
        }
    }
}
//
impl CallerNode {
    /// Set up a node with no metric yet
    fn new(name: &str) -> Self {
        Self {
            name: name.into(),
            metric: 0.0,
            count: 0.0,
            children: Vec::new(),
        }
    }
}

/// Which samples of a node [`CallTree::drill_into()`] selects
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum DrillKind {
    /// Samples whose path goes through the node
    Inclusive,

    /// Samples whose metric lands in the node's exclusive or exclusive-folded
    /// metric
    Exclusive,
}

/// What can go wrong while building or querying a call tree
#[derive(Debug, Error)]
pub enum CallTreeError {
    /// The filter configuration is invalid
    #[error("invalid call tree configuration ({0})")]
    Filter(#[from] FilterError),

    /// A sample references a call stack which its source does not know about
    #[error("sample #{sample} references unknown call stack {stack:?}")]
    UnknownStack {
        /// Index of the offending sample
        sample: SampleIndex,

        /// Call stack which the sample references
        stack: CallStackIndex,
    },

    /// A node identifier does not belong to this tree
    #[error("no node {0:?} in this call tree")]
    UnknownNode(NodeId),

    /// The operation was cancelled
    #[error("call tree processing was cancelled")]
    Cancelled,
}

/// Metric additivity violation found by [`CallTree::check_invariants()`]
#[derive(Clone, Debug, Error, PartialEq)]
pub enum InvariantError {
    /// Inclusive metric does not match exclusive + folded + children
    #[error("inclusive metric {inclusive} of node {node:?} does not match the sum of its parts {parts}")]
    MetricNotAdditive {
        /// Offending node
        node: NodeId,

        /// Inclusive metric of the node
        inclusive: Metric,

        /// Sum of exclusive, exclusive folded and children inclusive metric
        parts: Metric,
    },

    /// Inclusive count does not match exclusive + folded + children
    #[error("inclusive count {inclusive} of node {node:?} does not match the sum of its parts {parts}")]
    CountNotAdditive {
        /// Offending node
        node: NodeId,

        /// Inclusive count of the node
        inclusive: Metric,

        /// Sum of exclusive, exclusive folded and children inclusive count
        parts: Metric,
    },

    /// A child does not point back to its parent
    #[error("node {child:?} is a child of {parent:?} but does not point back to it")]
    BrokenParentLink {
        /// Parent node
        parent: NodeId,

        /// Child node
        child: NodeId,
    },
}
