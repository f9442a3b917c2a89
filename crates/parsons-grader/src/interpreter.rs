//! Classifies a raw [`ExecutionOutcome`] into a display-ready [`GradingResult`].
//!
//! Every outcome takes exactly one branch:
//!
//! | outcome                                  | header                        |
//! |------------------------------------------|-------------------------------|
//! | output ending in `P passed and F failed.`| `P of P+F tests passed`       |
//! | output without a usable summary line     | `Unexpected error occurred`   |
//! | error starting with `Traceback`          | `Syntax error`                |
//! | error `Infinite loop`                    | `Infinite loop`               |
//! | error `Cancelled`                        | `Run cancelled`               |
//! | any other error                          | `Unexpected error occurred`   |
//!
//! Interpretation is pure: the same outcome and offset always give the same
//! result.

use std::sync::OnceLock;
use std::time::Duration;

use regex::Regex;
use tracing::debug;

use crate::types::{
    ExecutionOutcome, GradingResult, Status, CANCELLED_MESSAGE, DEFAULT_TIMEOUT_MS,
    INFINITE_LOOP_MESSAGE,
};

/// Line prefix doctest uses when reporting a failing example.
pub const FAILURE_LOCATION_PREFIX: &str = "File \"__main__\"";

/// Location line the guest emits for errors in the learner's script.
pub const EXEC_LOCATION_MARKER: &str = "File \"<exec>\", line";

/// Error classes whose traceback is remapped to the submission.
pub const RECOGNIZED_ERROR_CLASSES: &[&str] = &["SyntaxError", "IndentationError"];

pub const NO_ERROR_REPORT: &str = "No error report found.";

const FAILED_EXAMPLE: &str = "Failed example:";
const FAILED_EXAMPLE_MARKED: &str = "\n❌ Failed example:";
const CAPTURE_OFF_PREFIXES: &[&str] = &["Trying:", "1 items had no tests:"];

const UNEXPECTED_HEADER: &str = "Unexpected error occurred";
const UNEXPECTED_DETAILS: &str =
    "Something went wrong while running your code. Please check it and try again.";
const NO_SUMMARY_DETAILS: &str = "Could not find a test report in the program output.";

fn summary_pattern() -> &'static Regex {
    static SUMMARY: OnceLock<Regex> = OnceLock::new();
    SUMMARY.get_or_init(|| {
        Regex::new(r"(\d+) passed and (\d+) failed\.").expect("summary pattern is valid")
    })
}

/// Interpret `outcome` assuming the default one-minute execution budget.
pub fn interpret(outcome: &ExecutionOutcome, start_line: usize) -> GradingResult {
    interpret_with_limit(outcome, start_line, Duration::from_millis(DEFAULT_TIMEOUT_MS))
}

/// Interpret `outcome`; `limit` only feeds the timeout explanation.
pub fn interpret_with_limit(
    outcome: &ExecutionOutcome,
    start_line: usize,
    limit: Duration,
) -> GradingResult {
    let result = match outcome {
        ExecutionOutcome::Output { output } => interpret_report(output),
        ExecutionOutcome::Error { error_message } if error_message.starts_with("Traceback") => {
            GradingResult::fail("Syntax error", traceback_details(error_message, start_line))
        }
        ExecutionOutcome::Error { error_message } if error_message == INFINITE_LOOP_MESSAGE => {
            GradingResult::fail(
                "Infinite loop",
                format!(
                    "Your code did not finish executing within {} seconds. \
                     Please look to see if you accidentally coded an infinite loop.",
                    limit.as_secs()
                ),
            )
        }
        ExecutionOutcome::Error { error_message } if error_message == CANCELLED_MESSAGE => {
            GradingResult::fail("Run cancelled", "The test run was cancelled before it finished.")
        }
        ExecutionOutcome::Error { .. } => GradingResult::fail(UNEXPECTED_HEADER, UNEXPECTED_DETAILS),
    };
    debug!(status = ?result.status, header = %result.header, "interpreted execution outcome");
    result
}

fn interpret_report(output: &str) -> GradingResult {
    let Some((passed, total)) = parse_summary(output) else {
        return GradingResult::fail(UNEXPECTED_HEADER, NO_SUMMARY_DETAILS);
    };
    GradingResult {
        status: if passed == total {
            Status::Success
        } else {
            Status::Fail
        },
        header: format!("{passed} of {total} tests passed"),
        details: failure_details(output),
    }
}

/// `(passed, total)` from the last `P passed and F failed.` line. Doctest
/// prints its summary after every `Got:` block, so earlier matches are
/// guest output.
fn parse_summary(output: &str) -> Option<(u64, u64)> {
    let caps = summary_pattern().captures_iter(output).last()?;
    let passed: u64 = caps[1].parse().ok()?;
    let failed: u64 = caps[2].parse().ok()?;
    Some((passed, passed.checked_add(failed)?))
}

/// Collect the failing-example blocks of a verbose doctest report.
fn failure_details(output: &str) -> String {
    let mut captured = Vec::new();
    let mut capturing = false;
    for line in output.split('\n') {
        if line.starts_with(FAILURE_LOCATION_PREFIX) {
            capturing = true;
            continue;
        }
        if CAPTURE_OFF_PREFIXES.iter().any(|p| line.starts_with(p)) {
            capturing = false;
        }
        if capturing {
            captured.push(line.replace(FAILED_EXAMPLE, FAILED_EXAMPLE_MARKED));
        }
    }
    captured.join("\n")
}

/// Extract the remapped location and message of a syntax-class traceback.
fn traceback_details(message: &str, start_line: usize) -> String {
    let lines: Vec<&str> = message.split('\n').collect();
    let mut err_end = None;
    let mut location = None;

    for (i, line) in lines.iter().enumerate().rev() {
        if RECOGNIZED_ERROR_CLASSES.iter().any(|c| line.starts_with(c)) {
            err_end = Some(i);
        } else if line.contains(EXEC_LOCATION_MARKER) {
            location = reported_line(line).map(|n| (i, n));
            break;
        }
    }

    let (Some(err_end), Some((err_start, reported))) = (err_end, location) else {
        return NO_ERROR_REPORT.to_string();
    };
    let Some(original) = i64::try_from(start_line)
        .ok()
        .and_then(|start| reported.checked_sub(start)?.checked_add(1))
    else {
        return NO_ERROR_REPORT.to_string();
    };
    format!(
        "Error at line {original}:\n{}",
        lines[err_start + 1..=err_end].join("\n")
    )
}

/// `N` from `File "<exec>", line N[, in …]`.
fn reported_line(line: &str) -> Option<i64> {
    let (_, rest) = line.split_once(", line ")?;
    let digits: String = rest.chars().take_while(|c| c.is_ascii_digit()).collect();
    digits.parse().ok()
}
