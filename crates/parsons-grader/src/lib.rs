// parsons-grader: grades Parsons-problem submissions by running their doctests
// in an embedded RustPython VM.

pub mod gateway;
pub mod interpreter;
pub mod modules;
pub mod output;
pub mod pipeline;
pub mod preparer;
pub mod problem;
pub mod session;
pub mod store;
pub mod types;
pub mod unit;
pub(crate) mod vm;

pub use gateway::{Attempt, Canceller, ExecutionUnit, Gateway, GatewayError, Mailbox, UnitSpawner};
pub use interpreter::{interpret, interpret_with_limit};
pub use pipeline::{Grader, PendingGrade};
pub use preparer::{prepare, PrepareError, PreparedScript};
pub use problem::{CodeBlock, CodeBlocks, Task};
pub use session::ProblemSession;
pub use store::{ArrangementStore, FileStore, MemoryStore, StoreError};
pub use types::{
    ExecutionOutcome, GraderSettings, GradingResult, Status, UnitError, UnitReply,
    DEFAULT_ALLOWED_MODULES,
};
pub use unit::EmbeddedPython;
