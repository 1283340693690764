//! Execution of command scripts

use crate::{
    commands::{self, CliError, TraceCache},
    CliArgs,
};
use clap::Parser;
use log::debug;
use std::{fs, io::Write, iter, path::Path};

/// Run every command of a script, stopping at the first failure
///
/// Each non-empty line that does not start with `#` is split into arguments
/// with shell quoting rules and run as if it were given on the command line.
/// Traces are loaded through `traces`, so that commands which analyze the
/// same trace do not parse it again.
///
pub fn run_script(path: &Path, traces: &TraceCache, output: &mut dyn Write) -> Result<(), CliError> {
    let script = fs::read_to_string(path).map_err(|source| CliError::Script {
        path: path.to_owned(),
        source,
    })?;
    for (idx, line) in script.lines().enumerate() {
        let line_no = idx + 1;
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        debug!("Running script line {line_no}: {line}");
        let words = shlex::split(line).ok_or(CliError::Quoting { line: line_no })?;
        let args = CliArgs::try_parse_from(iter::once("tracelens".to_owned()).chain(words))
            .map_err(|source| CliError::Usage {
                line: line_no,
                source,
            })?;
        writeln!(output, "$ {line}")?;
        commands::run_command(&args.command, traces, output).map_err(|e| CliError::Line {
            line: line_no,
            source: Box::new(e),
        })?;
    }

    let stats = traces.stats();
    debug!("Trace cache statistics:");
    debug!(
        "- Lookups: {} hits, {} misses ({:.0}% hit rate)",
        stats.hits,
        stats.misses,
        stats.hit_rate() * 100.0
    );
    debug!(
        "- Updates: {} insertions, {} evictions",
        stats.insertions, stats.evictions
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::commands::tests::trace_file;
    use assert_matches::assert_matches;
    use pretty_assertions::assert_eq;
    use std::num::NonZeroUsize;
    use tempfile::NamedTempFile;

    fn script(lines: &[String]) -> NamedTempFile {
        let mut file = NamedTempFile::new().unwrap();
        for line in lines {
            writeln!(file, "{line}").unwrap();
        }
        file
    }

    #[test]
    fn run_commands() {
        let trace = trace_file();
        let trace_path = trace.path().to_str().unwrap();
        let script = script(&[
            "# Where does time go?".to_owned(),
            format!("hotspots '{trace_path}' -e cpu -n 1"),
            String::new(),
            format!("tree {trace_path} -e cpu --max-depth 1"),
            format!("callers {trace_path} -e exception \"Throw(E) boom\""),
        ]);
        let traces = TraceCache::new(NonZeroUsize::new(1).unwrap());
        let mut output = Vec::new();
        run_script(script.path(), &traces, &mut output).unwrap();

        let output = String::from_utf8(output).unwrap();
        let commands = output
            .lines()
            .filter_map(|line| line.strip_prefix("$ "))
            .collect::<Vec<_>>();
        assert_eq!(commands.len(), 3);
        assert!(commands[0].starts_with("hotspots"));
        assert!(output.contains("Throw(E) boom [1, 100.0%]"));
        assert!(output.contains("…2 callee(s) below maximal depth…"));

        let stats = traces.stats();
        assert_eq!((stats.hits, stats.misses, stats.evictions), (1, 2, 1));
    }

    #[test]
    fn script_errors() {
        let traces = TraceCache::new(NonZeroUsize::new(1).unwrap());
        let mut output = Vec::new();
        assert_matches!(
            run_script(Path::new("/this/script/does/not/exist"), &traces, &mut output),
            Err(CliError::Script { .. })
        );

        let trace = trace_file();
        let trace_path = trace.path().to_str().unwrap();
        let cases = [
            vec![format!("tree {trace_path}"), "tree 'unbalanced".to_owned()],
            vec!["frobnicate".to_owned()],
            vec![String::new(), "batch other.txt".to_owned()],
            vec![format!("callers {trace_path} nobody")],
        ];
        let errors = cases
            .iter()
            .map(|lines| run_script(script(lines).path(), &traces, &mut output).unwrap_err())
            .collect::<Vec<_>>();
        assert_matches!(errors[0], CliError::Quoting { line: 2 });
        assert_matches!(errors[1], CliError::Usage { line: 1, .. });
        assert_matches!(
            &errors[2],
            CliError::Line { line: 2, source } if matches!(**source, CliError::NestedBatch)
        );
        assert_matches!(
            &errors[3],
            CliError::Line { line: 1, source } if matches!(**source, CliError::NoSuchName(_))
        );
    }
}
