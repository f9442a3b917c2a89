//! Grading through the public API with a scripted execution unit.
//!
//! Covers the seams between preparer, gateway and interpreter without paying
//! for a VM: the unit inspects the request it receives and answers with a
//! canned doctest report or traceback.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use parsons_grader::{
    interpret, prepare, ArrangementStore, CodeBlocks, ExecutionOutcome, ExecutionUnit, FileStore,
    GatewayError, Grader, GraderSettings, Mailbox, ProblemSession, Status, Task, UnitReply,
    UnitSpawner,
};

const HEADER: &str = "def square(n):\n    \"\"\"\n    >>> square(3)\n    9\n    >>> square(-2)\n    4\n    \"\"\"";

const PASSING_REPORT: &str = "\
Trying:
    square(3)
Expecting:
    9
ok
Trying:
    square(-2)
Expecting:
    4
ok
1 items had no tests:
    __main__
1 items passed all tests:
   2 tests in __main__.square
2 tests in 2 items.
2 passed and 0 failed.
Test passed.
";

const FAILING_REPORT: &str = "\
Trying:
    square(3)
Expecting:
    9
**********************************************************************
File \"__main__\", line 3, in __main__.square
Failed example:
    square(3)
Expected:
    9
Got:
    6
Trying:
    square(-2)
Expecting:
    4
ok
1 items had no tests:
    __main__
**********************************************************************
1 items had failures:
   1 of   2 in __main__.square
2 tests in 2 items.
1 passed and 1 failed.
***Test Failed*** 1 failures.
";

/// Answers like a doctest run of `square`: passes when the body multiplies
/// `n` by itself, fails otherwise, and never answers for a `while True` body.
#[derive(Default)]
struct DoctestDouble {
    spawned: Arc<AtomicUsize>,
}

struct DoctestDoubleUnit {
    held: Option<Mailbox>,
}

impl ExecutionUnit for DoctestDoubleUnit {
    fn post(&mut self, request: String, mailbox: Mailbox) -> Result<(), GatewayError> {
        if request.contains("while True") {
            self.held = Some(mailbox);
        } else if request.contains("n * n") {
            mailbox.deliver(UnitReply::results(PASSING_REPORT));
        } else {
            mailbox.deliver(UnitReply::results(FAILING_REPORT));
        }
        Ok(())
    }

    fn terminate(&mut self) {
        self.held = None;
    }
}

impl UnitSpawner for DoctestDouble {
    fn spawn(&self) -> Result<Box<dyn ExecutionUnit>, GatewayError> {
        self.spawned.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(DoctestDoubleUnit { held: None }))
    }
}

fn grader(timeout_ms: u64) -> (Grader<DoctestDouble>, Arc<AtomicUsize>) {
    let spawner = DoctestDouble::default();
    let spawned = Arc::clone(&spawner.spawned);
    let settings = GraderSettings {
        timeout_ms,
        ..GraderSettings::default()
    };
    (Grader::with_spawner(spawner, &settings), spawned)
}

#[test]
fn test_correct_submission_passes() {
    let (grader, _) = grader(5_000);
    let result = grader.grade("def square(n):\n    return n * n", HEADER);
    assert_eq!(result.status, Status::Success);
    assert_eq!(result.header, "2 of 2 tests passed");
    assert_eq!(result.details, "");
}

#[test]
fn test_wrong_submission_lists_failed_example() {
    let (grader, _) = grader(5_000);
    let result = grader.grade("def square(n):\n    return n + n", HEADER);
    assert_eq!(result.status, Status::Fail);
    assert_eq!(result.header, "1 of 2 tests passed");
    assert!(result.details.starts_with("\n❌ Failed example:"), "got {:?}", result.details);
    assert!(result.details.contains("Got:\n    6"));
    assert!(!result.details.contains("square(-2)"));
}

#[test]
fn test_structural_rejections_skip_execution() {
    let (grader, spawned) = grader(5_000);
    for submission in ["return n * n", "def square(n):\nreturn n * n"] {
        let result = grader.grade(submission, HEADER);
        assert_eq!(result.status, Status::Fail);
        assert_eq!(result.header, "Error running tests");
    }
    assert_eq!(spawned.load(Ordering::SeqCst), 0);
}

#[test]
fn test_endless_submission_times_out_with_configured_limit() {
    let (grader, _) = grader(2_000);
    let start = Instant::now();
    let result = grader.grade("def square(n):\n    while True:\n        pass", HEADER);
    assert!(start.elapsed() >= Duration::from_secs(2));
    assert_eq!(result.header, "Infinite loop");
    assert_eq!(
        result.details,
        "Your code did not finish executing within 2 seconds. \
         Please look to see if you accidentally coded an infinite loop."
    );
}

#[test]
fn test_cancel_from_ui_thread() {
    let (grader, _) = grader(60_000);
    let pending = grader.submit("def square(n):\n    while True:\n        pass", HEADER);
    let canceller = pending.canceller().expect("running grade is cancellable");
    let ui = thread::spawn(move || {
        thread::sleep(Duration::from_millis(20));
        canceller.cancel()
    });
    let result = pending.wait();
    assert!(ui.join().expect("ui thread"));
    assert_eq!(result.header, "Run cancelled");
}

#[test]
fn test_prepared_line_numbers_remap_to_submission() {
    let submission = "def square(n):\n    result = n * n\n    return result +";
    let script = prepare(submission, HEADER).expect("structurally valid");
    let script_lines: Vec<&str> = script.text().split('\n').collect();
    // Submission line 3 sits at 1-based script line start_line + 2.
    let reported = script.start_line() + 2;
    assert_eq!(script_lines[reported - 1], "    return result +");

    let trace = format!(
        "Traceback (most recent call last):\n  File \"<exec>\", line {reported}\n    return result +\n                   ^\nSyntaxError: invalid syntax"
    );
    let result = interpret(&ExecutionOutcome::error(trace), script.start_line());
    assert_eq!(result.header, "Syntax error");
    assert_eq!(
        result.details,
        "Error at line 3:\n    return result +\n                   ^\nSyntaxError: invalid syntax"
    );
}

#[test]
fn test_session_round_trip_through_file_store() {
    let task: Task = serde_json::from_str(
        r#"{"code_blocks": {
            "function_header": "def square(n):\n    \"\"\"\n    >>> square(3)\n    9\n    >>> square(-2)\n    4\n    \"\"\"",
            "blocks": [
                {"code": "def square(n):", "indent": 0, "given": true},
                {"code": "return n * ___", "indent": 1}
            ]
        }}"#,
    )
    .expect("task json");
    let blocks: CodeBlocks = task.code_blocks;
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("arrangements.json");
    let (grader, _) = grader(5_000);

    let session = ProblemSession::new("12", blocks.clone(), FileStore::new(&path));
    assert!(session.initial_arrangement().starts_with("def square(n): #0given\n    return n * !BLANK"));

    let arrangement = "def square(n): #0given\n    return n * n";
    let result = session.submit(&grader, "def square(n):\n    return n * n", arrangement);
    assert!(result.is_success());

    let reopened = ProblemSession::new("12", blocks, FileStore::new(&path));
    assert_eq!(reopened.initial_arrangement(), arrangement);
    assert_eq!(reopened.store().get("12-repr").as_deref(), Some(arrangement));
}
