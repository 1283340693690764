//! Text rendering of analysis results

use calltree::{ByNameEntry, CallTree, CallTreeNode, CallerTreeNode, Metric};
use std::fmt::Write;
use termtree::{GlyphPalette, Tree};

/// Width of the longest histogram bar, in characters
const MAX_BAR_WIDTH: usize = 40;

/// Glyphs used to draw trees
fn palette() -> GlyphPalette {
    GlyphPalette {
        middle_item: "├",
        last_item: "└",
        item_indent: "─",
        middle_skip: "│",
        last_skip: " ",
        skip_indent: " ",
    }
}

/// Render a call tree, down to a certain depth below `root`
pub fn call_tree(tree: &CallTree, root: CallTreeNode, max_depth: Option<usize>) -> Tree<Box<str>> {
    call_tree_node(tree, palette(), root, max_depth.unwrap_or(usize::MAX))
}

/// Render a call tree node and its callees
fn call_tree_node(
    tree: &CallTree,
    palette: GlyphPalette,
    node: CallTreeNode,
    depth_left: usize,
) -> Tree<Box<str>> {
    let mut label = format!(
        "{} [{}, {:.1}%",
        node.name(),
        metric(node.inclusive_metric()),
        node.inclusive_percent()
    );
    if node.exclusive_metric() != 0.0 {
        write!(
            label,
            " | self {}, {:.1}%",
            metric(node.exclusive_metric()),
            node.exclusive_percent()
        )
        .expect("Writing to a String cannot fail");
    }
    label.push(']');
    let mut rendered = Tree::new(label.into_boxed_str()).with_glyphs(palette);

    let num_children = node.children().count();
    if depth_left == 0 {
        if num_children > 0 {
            rendered.push(terminator(
                palette,
                format!("…{num_children} callee(s) below maximal depth…"),
            ));
        }
        return rendered;
    }
    for child in node.children() {
        rendered.push(call_tree_node(tree, palette, child, depth_left - 1));
    }
    if node.exclusive_folded_metric() != 0.0 {
        rendered.push(terminator(
            palette,
            format!(
                "…callees below {}%: {}, {:.1}%…",
                tree.filter().fold_pct(),
                metric(node.exclusive_folded_metric()),
                tree.percent(node.exclusive_folded_metric())
            ),
        ));
    }
    rendered
}

/// Leaf which tells that some nodes are not displayed
fn terminator(palette: GlyphPalette, text: String) -> Tree<Box<str>> {
    Tree::new(text.into_boxed_str()).with_glyphs(palette)
}

/// Render a table of the names with the highest exclusive metric
pub fn hotspots(tree: &CallTree, entries: &[ByNameEntry]) -> String {
    let mut output = format!(
        "{:>12} {:>7} {:>12} {:>7} {:>8}  Name\n",
        "Self", "Self%", "Total", "Total%", "Count"
    );
    for entry in entries {
        writeln!(
            output,
            "{:>12} {:>6.1}% {:>12} {:>6.1}% {:>8} {}",
            metric(entry.exclusive_metric),
            tree.percent(entry.exclusive_metric),
            metric(entry.inclusive_metric),
            tree.percent(entry.inclusive_metric),
            metric(entry.inclusive_count),
            entry.name
        )
        .expect("Writing to a String cannot fail");
    }
    output
}

/// Render a caller tree
pub fn caller_tree(root: CallerTreeNode) -> Tree<Box<str>> {
    caller_tree_node(palette(), root)
}

/// Render a caller tree node and its callers
fn caller_tree_node(palette: GlyphPalette, node: CallerTreeNode) -> Tree<Box<str>> {
    let label = format!(
        "{} [{}, {:.1}%]",
        node.name(),
        metric(node.metric()),
        node.percent()
    );
    Tree::new(label.into_boxed_str())
        .with_glyphs(palette)
        .with_leaves(node.callers().map(|caller| caller_tree_node(palette, caller)))
}

/// Render the time histogram of a call tree node as horizontal bars
pub fn histogram(tree: &CallTree, node: CallTreeNode) -> String {
    let controller = tree.histogram_controller();
    let histogram = node.histogram();
    let max = histogram.iter().fold(0.0, |max: Metric, value| max.max(value.abs()));
    let mut output = String::new();
    for (bucket, value) in histogram.iter().enumerate() {
        let range = controller.bucket_range(bucket);
        let bar_width = if max > 0.0 {
            (value.abs() / max * MAX_BAR_WIDTH as Metric).round() as usize
        } else {
            0
        };
        writeln!(
            output,
            "{:>12.2} ms {:<width$} {}",
            range.start,
            "#".repeat(bar_width),
            metric(value),
            width = MAX_BAR_WIDTH
        )
        .expect("Writing to a String cannot fail");
    }
    output
}

/// Format a metric without needless decimals
fn metric(value: Metric) -> String {
    if value.fract() == 0.0 && value.abs() < 1e15 {
        format!("{value:.0}")
    } else {
        format!("{value:.2}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use calltree::{FilterParams, SampleListBuilder};
    use pretty_assertions::assert_eq;

    /// Labels of a rendered tree, with their depth
    fn labels(rendered: &str) -> Vec<(usize, &str)> {
        let mut indents = Vec::new();
        rendered
            .lines()
            .map(|line| {
                let label = line.trim_start_matches(|c| "├└─│ ".contains(c));
                let indent = line.chars().count() - label.chars().count();
                let depth = indents.iter().filter(|&&other| other < indent).count();
                indents.retain(|&other| other <= indent);
                if !indents.contains(&indent) {
                    indents.push(indent);
                }
                (depth, label)
            })
            .collect()
    }

    fn tree(params: &FilterParams) -> CallTree {
        let mut samples = SampleListBuilder::new();
        samples.add_stack_sample(["main", "work", "compute"], 6.0, 1.0, 0.0);
        samples.add_stack_sample(["main", "work"], 2.0, 1.0, 1.0);
        samples.add_stack_sample(["main", "idle"], 1.0, 1.0, 3.0);
        samples.add_stack_sample(["main", "log"], 1.0, 1.0, 4.0);
        CallTree::build(&samples.build(), params).unwrap()
    }

    #[test]
    fn render_call_tree() {
        let tree = tree(&FilterParams::default());
        let rendered = call_tree(&tree, tree.root(), None).to_string();
        assert_eq!(
            labels(&rendered),
            [
                (0, "ROOT [10, 100.0%]"),
                (1, "main [10, 100.0%]"),
                (2, "work [8, 80.0% | self 2, 20.0%]"),
                (3, "compute [6, 60.0% | self 6, 60.0%]"),
                (2, "idle [1, 10.0% | self 1, 10.0%]"),
                (2, "log [1, 10.0% | self 1, 10.0%]"),
            ]
        );

        let shallow = call_tree(&tree, tree.root(), Some(1)).to_string();
        assert!(shallow.contains("…3 callee(s) below maximal depth…"));
        assert!(!shallow.contains("work"));
    }

    #[test]
    fn render_folded_tree() {
        let tree = tree(&FilterParams {
            fold_pct: 15.0,
            ..FilterParams::default()
        });
        let rendered = call_tree(&tree, tree.root(), None).to_string();
        assert!(!rendered.contains("idle"));
        assert!(rendered.contains("…callees below 15%: 2, 20.0%…"));
    }

    #[test]
    fn render_hotspots() {
        let tree = tree(&FilterParams::default());
        let table = hotspots(&tree, &tree.hotspots(2));
        let lines = table.lines().collect::<Vec<_>>();
        assert_eq!(lines.len(), 3);
        assert!(lines[0].ends_with("Name"));
        assert!(lines[1].ends_with(" compute"));
        assert!(lines[1].contains("60.0%"));
        assert!(lines[2].ends_with(" work"));
    }

    #[test]
    fn render_caller_tree() {
        let tree = tree(&FilterParams::default());
        let callers = tree.caller_tree("compute").unwrap();
        assert_eq!(
            labels(&caller_tree(callers.root()).to_string()),
            [
                (0, "compute [6, 60.0%]"),
                (1, "work [6, 60.0%]"),
                (2, "main [6, 60.0%]"),
            ]
        );
    }

    #[test]
    fn render_histogram() {
        let tree = tree(&FilterParams {
            bucket_count: 2,
            ..FilterParams::default()
        });
        let work = tree.find_path(["main", "work"]).unwrap();
        let rendered = histogram(&tree, work);
        let lines = rendered.lines().collect::<Vec<_>>();
        assert_eq!(lines.len(), 2);
        assert!(lines[0].contains(&"#".repeat(MAX_BAR_WIDTH)));
        assert!(lines[0].trim_end().ends_with(" 8"));
        assert!(!lines[1].contains('#'));
        assert!(lines[1].trim_end().ends_with(" 0"));
    }

    #[test]
    fn metric_formatting() {
        assert_eq!(metric(3.0), "3");
        assert_eq!(metric(2.5), "2.50");
        assert_eq!(metric(-1.0), "-1");
    }
}
