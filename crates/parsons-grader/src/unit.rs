//! The embedded RustPython execution unit.
//!
//! Each [`PythonUnit`] owns one worker thread that builds a fresh interpreter,
//! runs the request and delivers a single [`UnitReply`]. The request's last
//! top-level expression is bound to `__result__` first (see
//! [`capture_last_expression`]) so its value becomes the reply's `results`.
//!
//! ## Termination
//!
//! Each unit owns the sending half of its interpreter's user signal channel.
//! [`terminate`](ExecutionUnit::terminate) sends an interrupt that raises
//! `KeyboardInterrupt` at the VM's next instruction, resending while the
//! worker is still alive in case guest code swallows it, then joins the
//! worker. A worker that outlives [`STOP_DEADLINE`] is detached.

use std::collections::HashSet;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use rustpython_vm::signal::{user_signal_channel, UserSignalSender};
use tracing::{debug, warn};

use crate::gateway::{ExecutionUnit, GatewayError, Mailbox, UnitSpawner};
use crate::modules::build_allowed_set;
use crate::output::OutputBuffer;
use crate::types::GraderSettings;
use crate::vm::{build_interpreter, request_interrupt, run_source, RESULT_BINDING};

/// RustPython recurses on the native stack; doctest plus learner recursion
/// needs more than the default 2 MiB.
const UNIT_STACK_BYTES: usize = 32 * 1024 * 1024;

/// How long `terminate` waits for an interrupted worker before detaching it.
pub const STOP_DEADLINE: Duration = Duration::from_secs(2);
const INTERRUPT_RESEND: Duration = Duration::from_millis(100);
const STOP_POLL: Duration = Duration::from_millis(5);

/// Spawns [`PythonUnit`]s configured from [`GraderSettings`].
#[derive(Debug, Clone)]
pub struct EmbeddedPython {
    allowed_set: Arc<HashSet<String>>,
    max_output_bytes: usize,
}

impl EmbeddedPython {
    pub fn new(settings: &GraderSettings) -> Self {
        Self {
            allowed_set: Arc::new(build_allowed_set(settings)),
            max_output_bytes: settings.max_output_bytes,
        }
    }
}

impl Default for EmbeddedPython {
    fn default() -> Self {
        Self::new(&GraderSettings::default())
    }
}

impl UnitSpawner for EmbeddedPython {
    fn spawn(&self) -> Result<Box<dyn ExecutionUnit>, GatewayError> {
        Ok(Box::new(PythonUnit {
            allowed_set: Arc::clone(&self.allowed_set),
            max_output_bytes: self.max_output_bytes,
            worker: None,
            interrupts: None,
            posted: false,
        }))
    }
}

/// One interpreter on one thread, used for exactly one request.
pub struct PythonUnit {
    allowed_set: Arc<HashSet<String>>,
    max_output_bytes: usize,
    worker: Option<JoinHandle<()>>,
    interrupts: Option<UserSignalSender>,
    posted: bool,
}

impl PythonUnit {
    /// Interrupt and join the worker. `true` when no worker is left running.
    fn stop_worker(&mut self) -> bool {
        let Some(worker) = self.worker.take() else {
            return true;
        };
        let interrupts = self.interrupts.take();

        let started = Instant::now();
        let mut last_sent: Option<Instant> = None;
        while !worker.is_finished() {
            if started.elapsed() >= STOP_DEADLINE {
                warn!("execution unit ignored interrupts; detaching its worker");
                return false;
            }
            if last_sent.map_or(true, |at| at.elapsed() >= INTERRUPT_RESEND) {
                // The receiver goes away with the interpreter; the worker is
                // about to finish then.
                if let Some(tx) = &interrupts {
                    request_interrupt(tx);
                }
                last_sent = Some(Instant::now());
            }
            thread::sleep(STOP_POLL);
        }

        if worker.join().is_err() {
            debug!("execution unit worker panicked");
        }
        true
    }
}

impl ExecutionUnit for PythonUnit {
    fn post(&mut self, request: String, mailbox: Mailbox) -> Result<(), GatewayError> {
        if self.posted {
            return Err(GatewayError::AlreadyPosted);
        }
        self.posted = true;

        let source = capture_last_expression(&request);
        let allowed_set = Arc::clone(&self.allowed_set);
        let output = OutputBuffer::new(self.max_output_bytes);
        let (interrupts, signals) = user_signal_channel();

        let worker = thread::Builder::new()
            .name("grader-unit".to_string())
            .stack_size(UNIT_STACK_BYTES)
            .spawn(move || {
                let interp = build_interpreter(allowed_set, signals);
                let reply = run_source(&interp, &source, output);
                mailbox.deliver(reply);
            })?;
        self.worker = Some(worker);
        self.interrupts = Some(interrupts);
        Ok(())
    }

    fn terminate(&mut self) {
        if self.stop_worker() {
            debug!("execution unit stopped");
        }
    }
}

/// Bind the last top-level expression of `code` to `__result__`.
///
/// The last non-blank line is left alone when it is indented, starts with a
/// statement keyword, or is an assignment; otherwise it becomes
/// `__result__ = <line>`. Calls are wrapped too: a call that returns `None`
/// simply yields no value.
///
/// ```
/// use parsons_grader::unit::capture_last_expression;
/// assert_eq!(
///     capture_last_expression("import sys\nsys.stdout.getvalue()"),
///     "import sys\n__result__ = sys.stdout.getvalue()"
/// );
/// assert_eq!(capture_last_expression("x = 1"), "x = 1");
/// ```
pub fn capture_last_expression(code: &str) -> String {
    const STATEMENT_KEYWORDS: &[&str] = &[
        "def", "class", "if", "elif", "else", "for", "while", "try", "except", "finally", "with",
        "import", "from", "return", "pass", "break", "continue", "raise", "assert", "del",
        "global", "nonlocal", "yield", "async", "await", "match", "case",
    ];

    let lines: Vec<&str> = code.split('\n').collect();
    let Some(last_idx) = lines.iter().rposition(|l| !l.trim().is_empty()) else {
        return code.to_string();
    };

    let original = lines[last_idx];
    if original.starts_with(' ') || original.starts_with('\t') {
        return code.to_string();
    }
    let last_line = original.trim();
    let first_word = last_line
        .split(|c: char| !(c.is_alphanumeric() || c == '_'))
        .next()
        .unwrap_or_default();
    if last_line.starts_with('@')
        || last_line.starts_with('#')
        || STATEMENT_KEYWORDS.contains(&first_word)
        || is_assignment(last_line)
    {
        return code.to_string();
    }

    let mut out: Vec<String> = lines.iter().map(|l| l.to_string()).collect();
    out[last_idx] = format!("{RESULT_BINDING} = {last_line}");
    out.join("\n")
}

/// A `=` at bracket depth zero that is not part of `==`, `!=`, `<=`, `>=`.
/// Augmented assignments (`+=` …) count; keyword arguments inside a call do not.
fn is_assignment(line: &str) -> bool {
    let chars: Vec<char> = line.chars().collect();
    let mut depth = 0i32;
    for (i, &c) in chars.iter().enumerate() {
        match c {
            '(' | '[' | '{' => depth += 1,
            ')' | ']' | '}' => depth -= 1,
            '=' if depth == 0 => {
                let next_is_eq = chars.get(i + 1) == Some(&'=');
                let prev = if i > 0 { Some(chars[i - 1]) } else { None };
                let comparison = matches!(prev, Some('!' | '<' | '>' | '='));
                if !next_is_eq && !comparison {
                    return true;
                }
            }
            _ => {}
        }
    }
    false
}
