//! Runs one prepared script in a fresh execution unit under a wall-clock limit.
//!
//! Every [`Gateway::submit`] spawns a new unit, posts the request, and hands
//! back an [`Attempt`]. The attempt races three signal sources over one
//! channel:
//!
//! 1. the unit's reply, delivered through its [`Mailbox`]
//! 2. the deadline (`recv_timeout`)
//! 3. a [`Canceller`] held by whoever may abandon the attempt
//!
//! The first signal to arrive settles the attempt. [`Attempt::wait`] consumes
//! the attempt, so an outcome is produced at most once; once it returns the
//! receiver is gone and later signals are dropped on the floor. Losing paths
//! never resolve anything, and unit termination is idempotent.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::sync::Arc;
use std::time::{Duration, Instant};

use thiserror::Error;
use tracing::{debug, info, warn};

use crate::types::{ExecutionOutcome, UnitReply};

/// Message used when a unit goes away without replying.
pub const UNIT_VANISHED_MESSAGE: &str = "Execution unit exited without a reply";

#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("failed to start execution unit: {0}")]
    Spawn(#[from] std::io::Error),

    #[error("execution unit already received its request")]
    AlreadyPosted,
}

enum Signal {
    Reply(UnitReply),
    Vanished,
    Cancelled,
}

/// One-shot reply slot handed to a unit with its request.
///
/// Dropping it without [`deliver`](Mailbox::deliver) (for example when the
/// unit's worker panics) reports the unit as vanished, so the attempt does
/// not sit out the full deadline.
pub struct Mailbox {
    tx: Option<Sender<Signal>>,
}

impl Mailbox {
    /// A mailbox nobody reads; for driving a unit outside a gateway.
    #[cfg(test)]
    pub(crate) fn detached() -> Self {
        Self { tx: None }
    }

    pub fn deliver(mut self, reply: UnitReply) {
        if let Some(tx) = self.tx.take() {
            // The attempt may already be settled; nobody is listening then.
            let _ = tx.send(Signal::Reply(reply));
        }
    }
}

impl Drop for Mailbox {
    fn drop(&mut self) {
        if let Some(tx) = self.tx.take() {
            let _ = tx.send(Signal::Vanished);
        }
    }
}

/// An isolated, single-use runtime that executes one request.
pub trait ExecutionUnit: Send {
    /// Hand the unit its only request. The reply goes through `mailbox`.
    fn post(&mut self, request: String, mailbox: Mailbox) -> Result<(), GatewayError>;

    /// Forcibly discard the unit. Must tolerate repeated calls.
    fn terminate(&mut self);
}

/// Produces a fresh [`ExecutionUnit`] per attempt.
pub trait UnitSpawner: Send + Sync {
    fn spawn(&self) -> Result<Box<dyn ExecutionUnit>, GatewayError>;
}

/// Handle that abandons an in-flight attempt from anywhere.
#[derive(Clone)]
pub struct Canceller {
    tx: Sender<Signal>,
    settled: Arc<AtomicBool>,
}

impl Canceller {
    /// Request cancellation. Returns `false` if the attempt already settled.
    pub fn cancel(&self) -> bool {
        if self.settled.load(Ordering::Acquire) {
            return false;
        }
        self.tx.send(Signal::Cancelled).is_ok()
    }
}

/// An in-flight execution. Resolve it with [`wait`](Attempt::wait); dropping
/// it unresolved terminates the unit.
pub struct Attempt {
    unit: Box<dyn ExecutionUnit>,
    signals: Receiver<Signal>,
    canceller: Canceller,
    deadline: Instant,
}

impl Attempt {
    pub fn canceller(&self) -> Canceller {
        self.canceller.clone()
    }

    pub fn is_settled(&self) -> bool {
        self.canceller.settled.load(Ordering::Acquire)
    }

    /// Block until the first signal arrives and map it to an outcome.
    pub fn wait(mut self) -> ExecutionOutcome {
        let remaining = self.deadline.saturating_duration_since(Instant::now());
        let outcome = match self.signals.recv_timeout(remaining) {
            Ok(Signal::Reply(reply)) => {
                debug!("execution unit replied");
                ExecutionOutcome::from(reply)
            }
            Ok(Signal::Cancelled) => {
                info!("grading attempt cancelled");
                ExecutionOutcome::cancelled()
            }
            Ok(Signal::Vanished) | Err(RecvTimeoutError::Disconnected) => {
                warn!("execution unit exited without a reply");
                ExecutionOutcome::error(UNIT_VANISHED_MESSAGE)
            }
            Err(RecvTimeoutError::Timeout) => {
                warn!("execution unit exceeded its deadline");
                ExecutionOutcome::timed_out()
            }
        };
        self.settle();
        outcome
    }

    fn settle(&mut self) {
        if !self.canceller.settled.swap(true, Ordering::AcqRel) {
            self.unit.terminate();
        }
    }
}

impl Drop for Attempt {
    fn drop(&mut self) {
        self.settle();
    }
}

/// Spawns a unit per request and enforces the deadline.
pub struct Gateway<S> {
    spawner: S,
    timeout: Duration,
}

impl<S: UnitSpawner> Gateway<S> {
    pub fn new(spawner: S, timeout: Duration) -> Self {
        Self { spawner, timeout }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn spawner(&self) -> &S {
        &self.spawner
    }

    /// Spawn a unit, post `request`, and start the clock.
    pub fn submit(&self, request: String) -> Result<Attempt, GatewayError> {
        let mut unit = self.spawner.spawn()?;
        let (tx, rx) = mpsc::channel();

        if let Err(err) = unit.post(request, Mailbox { tx: Some(tx.clone()) }) {
            unit.terminate();
            return Err(err);
        }
        debug!(timeout_ms = self.timeout.as_millis() as u64, "execution unit started");

        Ok(Attempt {
            unit,
            signals: rx,
            canceller: Canceller {
                tx,
                settled: Arc::new(AtomicBool::new(false)),
            },
            deadline: Instant::now() + self.timeout,
        })
    }

    /// Submit and block for the outcome. Start-up failures become error outcomes.
    pub fn execute(&self, request: &str) -> ExecutionOutcome {
        match self.submit(request.to_owned()) {
            Ok(attempt) => attempt.wait(),
            Err(err) => {
                warn!(error = %err, "execution unit could not be started");
                ExecutionOutcome::error(err.to_string())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Mutex;
    use std::thread;

    /// What a scripted unit does with its mailbox.
    #[derive(Clone)]
    enum Script {
        /// Deliver synchronously inside `post`.
        ReplyNow(UnitReply),
        /// Deliver from a worker thread after a delay.
        ReplyAfter(Duration, UnitReply),
        /// Keep the mailbox and never answer.
        Silent,
        /// Drop the mailbox without answering.
        Vanish,
    }

    #[derive(Default)]
    struct Counters {
        spawned: AtomicUsize,
        terminated: AtomicUsize,
        requests: Mutex<Vec<String>>,
    }

    struct ScriptedUnit {
        script: Script,
        held: Option<Mailbox>,
        counters: Arc<Counters>,
    }

    impl ExecutionUnit for ScriptedUnit {
        fn post(&mut self, request: String, mailbox: Mailbox) -> Result<(), GatewayError> {
            self.counters.requests.lock().expect("requests lock").push(request);
            match self.script.clone() {
                Script::ReplyNow(reply) => mailbox.deliver(reply),
                Script::ReplyAfter(delay, reply) => {
                    thread::spawn(move || {
                        thread::sleep(delay);
                        mailbox.deliver(reply);
                    });
                }
                Script::Silent => self.held = Some(mailbox),
                Script::Vanish => drop(mailbox),
            }
            Ok(())
        }

        fn terminate(&mut self) {
            self.held = None;
            self.counters.terminated.fetch_add(1, Ordering::SeqCst);
        }
    }

    struct ScriptedSpawner {
        script: Script,
        counters: Arc<Counters>,
    }

    impl ScriptedSpawner {
        fn new(script: Script) -> Self {
            Self {
                script,
                counters: Arc::default(),
            }
        }
    }

    impl UnitSpawner for ScriptedSpawner {
        fn spawn(&self) -> Result<Box<dyn ExecutionUnit>, GatewayError> {
            self.counters.spawned.fetch_add(1, Ordering::SeqCst);
            Ok(Box::new(ScriptedUnit {
                script: self.script.clone(),
                held: None,
                counters: Arc::clone(&self.counters),
            }))
        }
    }

    struct BrokenSpawner;

    impl UnitSpawner for BrokenSpawner {
        fn spawn(&self) -> Result<Box<dyn ExecutionUnit>, GatewayError> {
            Err(GatewayError::Spawn(std::io::Error::other("no threads left")))
        }
    }

    fn gateway(script: Script, timeout: Duration) -> Gateway<ScriptedSpawner> {
        Gateway::new(ScriptedSpawner::new(script), timeout)
    }

    #[test]
    fn test_reply_is_forwarded_as_output() {
        let gw = gateway(
            Script::ReplyNow(UnitReply::results("1 passed and 0 failed.")),
            Duration::from_secs(5),
        );
        assert_eq!(gw.execute("x"), ExecutionOutcome::output("1 passed and 0 failed."));
    }

    #[test]
    fn test_error_reply_is_forwarded_as_message() {
        let gw = gateway(Script::ReplyNow(UnitReply::error("Traceback ...")), Duration::from_secs(5));
        assert_eq!(gw.execute("x"), ExecutionOutcome::error("Traceback ..."));
    }

    #[test]
    fn test_silent_unit_times_out_and_is_terminated() {
        let gw = gateway(Script::Silent, Duration::from_millis(50));
        let start = Instant::now();
        assert_eq!(gw.execute("while True: pass"), ExecutionOutcome::timed_out());
        assert!(start.elapsed() >= Duration::from_millis(50));
        assert_eq!(gw.spawner.counters.terminated.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_reply_already_queued_beats_expired_timer() {
        // Deadline is zero, but the reply is in the channel before we wait.
        let gw = gateway(Script::ReplyNow(UnitReply::results("done")), Duration::ZERO);
        let attempt = gw.submit("x".to_string()).expect("submit");
        let canceller = attempt.canceller();
        assert_eq!(attempt.wait(), ExecutionOutcome::output("done"));
        assert!(!canceller.cancel(), "cancel after settlement must be inert");
        assert_eq!(gw.spawner.counters.terminated.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_late_reply_after_timeout_is_discarded() {
        let gw = gateway(
            Script::ReplyAfter(Duration::from_millis(200), UnitReply::results("late")),
            Duration::from_millis(20),
        );
        assert_eq!(gw.execute("x"), ExecutionOutcome::timed_out());
        // Let the worker deliver into the closed channel; nothing may panic.
        thread::sleep(Duration::from_millis(250));
        assert_eq!(gw.spawner.counters.terminated.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_cancel_from_another_thread() {
        let gw = gateway(Script::Silent, Duration::from_secs(60));
        let attempt = gw.submit("x".to_string()).expect("submit");
        let canceller = attempt.canceller();
        let handle = thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            canceller.cancel()
        });
        let start = Instant::now();
        assert_eq!(attempt.wait(), ExecutionOutcome::cancelled());
        assert!(start.elapsed() < Duration::from_secs(5));
        assert!(handle.join().expect("canceller thread"));
        assert_eq!(gw.spawner.counters.terminated.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_vanished_unit_resolves_without_waiting_for_deadline() {
        let gw = gateway(Script::Vanish, Duration::from_secs(60));
        let start = Instant::now();
        assert_eq!(gw.execute("x"), ExecutionOutcome::error(UNIT_VANISHED_MESSAGE));
        assert!(start.elapsed() < Duration::from_secs(5));
    }

    #[test]
    fn test_dropping_unresolved_attempt_terminates_unit_once() {
        let gw = gateway(Script::Silent, Duration::from_secs(60));
        let attempt = gw.submit("x".to_string()).expect("submit");
        assert!(!attempt.is_settled());
        drop(attempt);
        assert_eq!(gw.spawner.counters.terminated.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_each_execution_spawns_a_fresh_unit() {
        let gw = gateway(Script::ReplyNow(UnitReply::results("ok")), Duration::from_secs(5));
        gw.execute("a");
        gw.execute("b");
        assert_eq!(gw.spawner.counters.spawned.load(Ordering::SeqCst), 2);
        let requests = gw.spawner.counters.requests.lock().expect("requests lock");
        assert_eq!(*requests, vec!["a".to_string(), "b".to_string()]);
    }

    #[test]
    fn test_spawn_failure_becomes_error_outcome() {
        let gw = Gateway::new(BrokenSpawner, Duration::from_secs(5));
        match gw.execute("x") {
            ExecutionOutcome::Error { error_message } => {
                assert!(error_message.contains("no threads left"), "got {error_message}");
            }
            other => panic!("expected error outcome, got {other:?}"),
        }
    }
}
