//! Shared public types for the parsons-grader library.
//!
//! - [`GraderSettings`]: configuration for one grading attempt
//! - [`UnitReply`]: the message an execution unit posts back
//! - [`ExecutionOutcome`]: what the gateway resolves with
//! - [`GradingResult`]: the terminal, display-ready artifact

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Modules the learner's script may import directly.
///
/// A general-purpose scripting set plus what the test preamble needs
/// (`sys`, `io`, `doctest`). Network, filesystem and subprocess modules are
/// excluded. Stdlib modules importing their own dependencies are not gated.
pub const DEFAULT_ALLOWED_MODULES: &[&str] = &[
    "math",
    "re",
    "datetime",
    "collections",
    "itertools",
    "functools",
    "string",
    "random",
    "os.path",
    "sys",
    "io",
    "doctest",
];

/// Wall-clock budget for one execution unit.
pub const DEFAULT_TIMEOUT_MS: u64 = 60_000;

/// Error message the gateway resolves with when the timer wins the race.
pub const INFINITE_LOOP_MESSAGE: &str = "Infinite loop";

/// Error message the gateway resolves with when the attempt is cancelled.
pub const CANCELLED_MESSAGE: &str = "Cancelled";

/// Configuration for a grading attempt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GraderSettings {
    /// Milliseconds before the execution unit is terminated.
    /// Default: 60,000 (one minute).
    pub timeout_ms: u64,

    /// Maximum bytes the guest may write to stdout + stderr combined.
    /// Default: 1,048,576 bytes (1 MiB).
    pub max_output_bytes: usize,

    /// Modules the learner's script is permitted to import.
    pub allowed_modules: Vec<String>,
}

impl GraderSettings {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

impl Default for GraderSettings {
    fn default() -> Self {
        Self {
            timeout_ms: DEFAULT_TIMEOUT_MS,
            max_output_bytes: 1_048_576,
            allowed_modules: DEFAULT_ALLOWED_MODULES
                .iter()
                .map(|s| s.to_string())
                .collect(),
        }
    }
}

/// Error payload inside a [`UnitReply`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnitError {
    pub message: String,
}

/// The single message an execution unit sends back to the gateway.
///
/// Exactly one of `results` / `error` is expected to be set:
/// ```json
/// {"results":"Trying:\n    add(1, 2)\n..."}
/// {"error":{"message":"Traceback (most recent call last):\n..."}}
/// ```
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnitReply {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub results: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<UnitError>,
}

impl UnitReply {
    pub fn results(results: impl Into<String>) -> Self {
        Self {
            results: Some(results.into()),
            error: None,
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self {
            results: None,
            error: Some(UnitError {
                message: message.into(),
            }),
        }
    }
}

/// What one execution resolved with.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ExecutionOutcome {
    /// The guest finished; `output` is the captured doctest report.
    Output { output: String },
    /// The guest raised, the interpreter failed, or the gateway gave up.
    Error {
        #[serde(rename = "errorMessage")]
        error_message: String,
    },
}

impl ExecutionOutcome {
    pub fn output(output: impl Into<String>) -> Self {
        Self::Output {
            output: output.into(),
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self::Error {
            error_message: message.into(),
        }
    }

    pub fn timed_out() -> Self {
        Self::error(INFINITE_LOOP_MESSAGE)
    }

    pub fn cancelled() -> Self {
        Self::error(CANCELLED_MESSAGE)
    }
}

impl From<UnitReply> for ExecutionOutcome {
    /// `results` wins over `error`; a reply carrying neither is an error with
    /// an empty message, which interprets as an unexpected failure.
    fn from(reply: UnitReply) -> Self {
        match (reply.results, reply.error) {
            (Some(results), _) => Self::output(results),
            (None, Some(error)) => Self::error(error.message),
            (None, None) => Self::error(String::new()),
        }
    }
}

/// Overall verdict of a grading attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Status {
    Success,
    Fail,
}

/// Display-ready grading result handed to the presentation layer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GradingResult {
    pub status: Status,
    pub header: String,
    pub details: String,
}

impl GradingResult {
    pub fn fail(header: impl Into<String>, details: impl Into<String>) -> Self {
        Self {
            status: Status::Fail,
            header: header.into(),
            details: details.into(),
        }
    }

    pub fn is_success(&self) -> bool {
        self.status == Status::Success
    }
}
