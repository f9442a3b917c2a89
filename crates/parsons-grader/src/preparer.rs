//! Turns a learner's assembled source into an executable doctest script.
//!
//! The problem header carries the real `def` line and its docstring. The
//! learner's first line is only checked for a definition keyword and then
//! replaced by the header, so the script reads:
//!
//! ```text
//! <header up to and including the closing """>   <- doc region
//! <learner body lines>
//! <flush-left header lines after the docstring>  <- tail
//! <test preamble>
//! ```
//!
//! [`PreparedScript::start_line`] records how many header lines precede the
//! body, which is what error remapping subtracts later.

use thiserror::Error;
use tracing::debug;

/// Marker that opens and closes the docstring holding the examples.
pub const DOC_DELIMITER: &str = "\"\"\"";

/// Lines appended after the learner's code: capture stdout, run doctests.
pub const TEST_PREAMBLE: &[&str] = &[
    "import sys",
    "import io",
    "sys.stdout = io.StringIO()",
    "import doctest",
    "doctest.testmod(verbose=True)",
];

/// Final expression of every execution request; its value is the report.
pub const CAPTURED_OUTPUT_READ: &str = "sys.stdout.getvalue()";

/// Structural rejection of a submission. Never reaches the execution unit.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PrepareError {
    #[error("First code line must be `def` or `class` declaration")]
    MissingDefinition,

    /// `line` is the 1-based line in the submission that sits flush-left.
    #[error(
        "All lines in a function or class definition should be indented at least once. \
         It looks like you have a line that has no indentation."
    )]
    MissingIndentation { line: usize },
}

/// An executable test script plus the offset needed to remap its line numbers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PreparedScript {
    text: String,
    start_line: usize,
}

impl PreparedScript {
    pub fn text(&self) -> &str {
        &self.text
    }

    /// Number of header lines before the learner's body; 0 when the header
    /// has no complete docstring.
    pub fn start_line(&self) -> usize {
        self.start_line
    }

    /// The message sent to the execution unit: the script followed by the
    /// captured-output read as its last expression.
    pub fn request_text(&self) -> String {
        format!("{}\n{}", self.text, CAPTURED_OUTPUT_READ)
    }
}

/// Validate `submitted` and splice it into `header` to build the test script.
pub fn prepare(submitted: &str, header: &str) -> Result<PreparedScript, PrepareError> {
    let submitted = format!("{submitted}\n");
    let mut body: Vec<&str> = submitted.split('\n').collect();
    let header_lines: Vec<&str> = header.split('\n').collect();

    let first = body.first().copied().unwrap_or_default();
    if !(first.contains("def") || first.contains("class")) {
        debug!(first_line = first, "submission rejected: no definition line");
        return Err(PrepareError::MissingDefinition);
    }
    body.remove(0);

    if let Some(idx) = first_flush_left_statement(&body) {
        debug!(line = idx + 2, "submission rejected: unindented body line");
        return Err(PrepareError::MissingIndentation { line: idx + 2 });
    }

    let boundary = doc_boundary(&header_lines);
    let (doc, tail) = match boundary {
        Some(n) => {
            let tail_start = first_flush_left(&header_lines, n);
            (&header_lines[..n], &header_lines[tail_start..])
        }
        None => (&header_lines[..0], &header_lines[..]),
    };

    let text = doc
        .iter()
        .chain(body.iter())
        .chain(tail.iter())
        .chain(TEST_PREAMBLE.iter())
        .copied()
        .collect::<Vec<_>>()
        .join("\n");

    let start_line = boundary.unwrap_or(0);
    debug!(start_line, lines = text.lines().count(), "prepared test script");
    Ok(PreparedScript { text, start_line })
}

/// Index just past the line holding the second delimiter, if there is one.
fn doc_boundary(lines: &[&str]) -> Option<usize> {
    let mut marked = lines
        .iter()
        .enumerate()
        .filter(|(_, line)| line.contains(DOC_DELIMITER))
        .map(|(i, _)| i);
    marked.next()?;
    marked.next().map(|close| close + 1)
}

/// First index at or after `from` whose line is non-empty and not indented.
/// Returns `lines.len()` when every remaining line is blank or indented.
fn first_flush_left(lines: &[&str], from: usize) -> usize {
    (from..lines.len())
        .find(|&i| !lines[i].is_empty() && !is_indented(lines[i]))
        .unwrap_or(lines.len())
}

/// Like [`first_flush_left`] over a body, but also lets whitespace-only and
/// comment-only lines sit anywhere.
fn first_flush_left_statement(lines: &[&str]) -> Option<usize> {
    lines.iter().position(|line| {
        let trimmed = line.trim();
        !trimmed.is_empty() && !trimmed.starts_with('#') && !is_indented(line)
    })
}

fn is_indented(line: &str) -> bool {
    line.starts_with(' ') || line.starts_with('\t')
}
