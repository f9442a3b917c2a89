//! Problem definitions as served to the block widget.
//!
//! A task carries a declaration header and a list of code blocks. The widget
//! receives them as plain lines: four spaces per indent level, `___` holes as
//! `!BLANK`, pre-filled blocks tagged `#0given`, followed by a fixed set of
//! distractor lines.

use serde::{Deserialize, Serialize};

/// Lines appended to every starter arrangement.
pub const DISTRACTOR_LINES: &[&str] = &[
    "print('DEBUG:', !BLANK)",
    "print('DEBUG:', !BLANK)",
    "# !BLANK",
    "# !BLANK",
];

const INDENT: &str = "    ";
const HOLE: &str = "___";
const WIDGET_HOLE: &str = "!BLANK";
const GIVEN_MARKER: &str = " #0given";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CodeBlock {
    pub code: String,
    #[serde(default)]
    pub indent: usize,
    #[serde(default)]
    pub given: bool,
}

impl CodeBlock {
    fn widget_line(&self) -> String {
        let mut line = format!("{}{}", INDENT.repeat(self.indent), self.code.replace(HOLE, WIDGET_HOLE));
        if self.given {
            line.push_str(GIVEN_MARKER);
        }
        line
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CodeBlocks {
    /// The `def` line and docstring the submission is spliced into.
    pub function_header: String,
    pub blocks: Vec<CodeBlock>,
}

impl CodeBlocks {
    /// The widget's initial lines, distractors included.
    pub fn starter_lines(&self) -> String {
        self.blocks
            .iter()
            .map(CodeBlock::widget_line)
            .chain(DISTRACTOR_LINES.iter().map(|l| l.to_string()))
            .collect::<Vec<_>>()
            .join("\n")
    }
}

/// A task as fetched from the problem backend; unknown fields are ignored.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Task {
    pub code_blocks: CodeBlocks,
}
