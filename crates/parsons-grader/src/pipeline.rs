//! Submission → prepared script → execution → grading result.
//!
//! [`Grader::submit`] returns a [`PendingGrade`] that resolves exactly once.
//! Preparation failures are settled immediately and never spawn a unit.

use std::time::Duration;

use tracing::{info, info_span, warn};

use crate::gateway::{Attempt, Canceller, Gateway, UnitSpawner};
use crate::interpreter::interpret_with_limit;
use crate::preparer::prepare;
use crate::types::{ExecutionOutcome, GraderSettings, GradingResult};
use crate::unit::EmbeddedPython;

/// Header shown when a submission is rejected before execution.
pub const PREPARATION_FAILED_HEADER: &str = "Error running tests";

pub struct Grader<S = EmbeddedPython> {
    gateway: Gateway<S>,
}

impl Grader<EmbeddedPython> {
    pub fn new(settings: &GraderSettings) -> Self {
        Self::with_spawner(EmbeddedPython::new(settings), settings)
    }
}

impl Default for Grader<EmbeddedPython> {
    fn default() -> Self {
        Self::new(&GraderSettings::default())
    }
}

impl<S: UnitSpawner> Grader<S> {
    pub fn with_spawner(spawner: S, settings: &GraderSettings) -> Self {
        Self {
            gateway: Gateway::new(spawner, settings.timeout()),
        }
    }

    pub fn timeout(&self) -> Duration {
        self.gateway.timeout()
    }

    /// Start grading `submitted` against `header` without blocking on the run.
    pub fn submit(&self, submitted: &str, header: &str) -> PendingGrade {
        let _span = info_span!("grade").entered();
        let limit = self.gateway.timeout();

        let script = match prepare(submitted, header) {
            Ok(script) => script,
            Err(err) => {
                info!(error = %err, "submission rejected before execution");
                return PendingGrade::settled(
                    GradingResult::fail(PREPARATION_FAILED_HEADER, err.to_string()),
                    limit,
                );
            }
        };

        let start_line = script.start_line();
        match self.gateway.submit(script.request_text()) {
            Ok(attempt) => {
                info!(start_line, "grading attempt started");
                PendingGrade {
                    state: State::Running { attempt, start_line },
                    limit,
                }
            }
            Err(err) => {
                warn!(error = %err, "execution unit could not be started");
                let outcome = ExecutionOutcome::error(err.to_string());
                PendingGrade::settled(interpret_with_limit(&outcome, start_line, limit), limit)
            }
        }
    }

    /// Submit and block for the result.
    pub fn grade(&self, submitted: &str, header: &str) -> GradingResult {
        self.submit(submitted, header).wait()
    }
}

enum State {
    Settled(GradingResult),
    Running { attempt: Attempt, start_line: usize },
}

/// A grading attempt that resolves once, through [`wait`](PendingGrade::wait).
pub struct PendingGrade {
    state: State,
    limit: Duration,
}

impl PendingGrade {
    fn settled(result: GradingResult, limit: Duration) -> Self {
        Self {
            state: State::Settled(result),
            limit,
        }
    }

    /// `None` when the attempt was settled without running anything.
    pub fn canceller(&self) -> Option<Canceller> {
        match &self.state {
            State::Settled(_) => None,
            State::Running { attempt, .. } => Some(attempt.canceller()),
        }
    }

    pub fn wait(self) -> GradingResult {
        let result = match self.state {
            State::Settled(result) => result,
            State::Running { attempt, start_line } => {
                interpret_with_limit(&attempt.wait(), start_line, self.limit)
            }
        };
        info!(status = ?result.status, header = %result.header, "grading finished");
        result
    }
}
