//! One learner's view of one problem: the starting arrangement and grading.

use tracing::warn;

use crate::gateway::UnitSpawner;
use crate::pipeline::Grader;
use crate::problem::CodeBlocks;
use crate::store::ArrangementStore;
use crate::types::GradingResult;

pub struct ProblemSession<K> {
    problem_id: String,
    blocks: CodeBlocks,
    store: K,
}

impl<K: ArrangementStore> ProblemSession<K> {
    pub fn new(problem_id: impl Into<String>, blocks: CodeBlocks, store: K) -> Self {
        Self {
            problem_id: problem_id.into(),
            blocks,
            store,
        }
    }

    /// Storage key of the saved arrangement: `<problem id>-repr`.
    pub fn arrangement_key(&self) -> String {
        format!("{}-repr", self.problem_id)
    }

    /// The saved arrangement if there is a non-empty one, else the starter lines.
    pub fn initial_arrangement(&self) -> String {
        self.store
            .get(&self.arrangement_key())
            .filter(|saved| !saved.is_empty())
            .unwrap_or_else(|| self.blocks.starter_lines())
    }

    /// Grade `code`, then remember `arrangement` whatever the verdict.
    ///
    /// A store failure is logged and does not affect the result.
    pub fn submit<S: UnitSpawner>(
        &self,
        grader: &Grader<S>,
        code: &str,
        arrangement: &str,
    ) -> GradingResult {
        let result = grader.grade(code, &self.blocks.function_header);
        if let Err(err) = self.store.set(&self.arrangement_key(), arrangement) {
            warn!(problem = %self.problem_id, error = %err, "could not save arrangement");
        }
        result
    }

    pub fn blocks(&self) -> &CodeBlocks {
        &self.blocks
    }

    pub fn store(&self) -> &K {
        &self.store
    }
}
