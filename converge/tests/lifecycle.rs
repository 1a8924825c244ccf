//! Multi-cycle lifecycle tests.
//!
//! Each cycle builds a fresh `Agent` from the fixture, the way a restarted
//! controller process would, so every scenario also checks that progress
//! survives on records alone.

use std::fs;
use std::time::{Duration, SystemTime};

use converge::core::metrics::TestCounts;
use converge::core::spec::parse_dependencies;
use converge::core::types::{LifecycleStatus, SignalOutcome};
use converge::cycle::{Checkpoint, CycleOutcome, run_cycle};
use converge::io::resolver::DependencyTimeoutError;
use converge::io::signals::read_signal;
use converge::io::status::StatusStore;
use converge::reset::fresh_start;
use converge::test_support::{
    Fixture, ScriptedInvocation, ScriptedTestRunner, ScriptedWorker, counts_for_rate, set_mtime,
};

fn settled(outcome: CycleOutcome) -> converge::cycle::Settlement {
    match outcome {
        CycleOutcome::Settled(settlement) => settlement,
        other => panic!("expected settlement, got {other:?}"),
    }
}

/// Baselines 40% -> 61% -> 90% against a target of 85%: converges in cycle 3.
#[test]
fn converges_in_third_cycle_and_stays_settled() {
    let fixture = Fixture::new("api");
    let tests = ScriptedTestRunner::new(vec![
        counts_for_rate(40),
        counts_for_rate(55),
        counts_for_rate(61),
        counts_for_rate(75),
        counts_for_rate(90),
    ]);
    let worker = ScriptedWorker::new(vec![
        ScriptedInvocation::lines(&["modified: src/api.rs"]),
        ScriptedInvocation::lines(&["created: src/routes.rs"]),
    ]);

    for expected in 1..=2 {
        match run_cycle(&fixture.agent(), &tests, &worker).expect("cycle") {
            CycleOutcome::Completed { cycle, .. } => assert_eq!(cycle, expected),
            other => panic!("expected completed cycle, got {other:?}"),
        }
    }
    let status = fixture
        .agent()
        .records
        .status
        .load()
        .expect("load")
        .expect("status");
    assert_eq!(status.files_modified, vec!["src/routes.rs".to_string()]);

    let settlement = settled(run_cycle(&fixture.agent(), &tests, &worker).expect("cycle 3"));
    assert_eq!(settlement.cycle, 3);
    assert_eq!(settlement.outcome, SignalOutcome::Success);
    assert_eq!(settlement.counts, counts_for_rate(90));
    assert!(!settlement.resumed);
    assert_eq!(worker.invocations(), 2);

    let agent = fixture.agent();
    let paths = &agent.records.paths;
    let handoff = read_signal(&paths.handoff_path)
        .expect("read handoff")
        .expect("handoff present");
    assert_eq!(handoff.outcome, SignalOutcome::Success);
    assert_eq!(handoff.cycle, 3);
    assert_eq!(handoff.test_pass_rate, 90);
    assert!(!paths.blocker_path.exists());

    let status = agent.records.status.load().expect("load").expect("status");
    assert_eq!(status.status, LifecycleStatus::Completed);
    assert_eq!(status.restart_cycle, 3);
    assert_eq!(agent.records.counter.load().expect("counter"), 3);

    // A restarted process settles from the records without running anything.
    let again = settled(run_cycle(&fixture.agent(), &tests, &worker).expect("resume"));
    assert!(again.resumed);
    assert_eq!(again.outcome, SignalOutcome::Success);
    assert_eq!(tests.runs(), 5);
    assert_eq!(worker.invocations(), 2);
}

#[test]
fn minimum_test_count_blocks_early_convergence() {
    let mut fixture = Fixture::new("api");
    fixture.spec.min_total_tests = 50;
    let tests = ScriptedTestRunner::new(vec![
        TestCounts::new(9, 0),
        TestCounts::new(30, 2),
        TestCounts::new(60, 5),
    ]);
    let worker = ScriptedWorker::new(vec![ScriptedInvocation::default()]);

    let first = run_cycle(&fixture.agent(), &tests, &worker).expect("cycle 1");
    assert!(matches!(first, CycleOutcome::Completed { cycle: 1, .. }));

    let settlement = settled(run_cycle(&fixture.agent(), &tests, &worker).expect("cycle 2"));
    assert_eq!(settlement.cycle, 2);
    assert_eq!(settlement.counts, TestCounts::new(60, 5));
}

#[test]
fn exhaustion_publishes_blocker_and_resumes_as_failure() {
    let mut fixture = Fixture::new("api");
    fixture.spec.max_cycles = 3;
    let tests = ScriptedTestRunner::new(vec![
        counts_for_rate(40),
        counts_for_rate(50),
        counts_for_rate(50),
        counts_for_rate(60),
        counts_for_rate(60),
        counts_for_rate(70),
        counts_for_rate(70),
    ]);
    let worker = ScriptedWorker::new(Vec::new());

    for _ in 0..3 {
        let outcome = run_cycle(&fixture.agent(), &tests, &worker).expect("cycle");
        assert!(matches!(outcome, CycleOutcome::Completed { .. }));
    }
    let settlement = settled(run_cycle(&fixture.agent(), &tests, &worker).expect("final"));
    assert_eq!(settlement.outcome, SignalOutcome::Failure);
    assert_eq!(settlement.cycle, 3);
    assert_eq!(
        settlement.reason.as_deref(),
        Some("max cycles (3) reached at 70% (target 85%)")
    );
    assert_eq!(tests.runs(), 7);

    let agent = fixture.agent();
    let paths = &agent.records.paths;
    let blocker = read_signal(&paths.blocker_path)
        .expect("read blocker")
        .expect("blocker present");
    assert_eq!(blocker.outcome, SignalOutcome::Failure);
    assert_eq!(blocker.test_pass_rate, 70);
    assert_eq!(
        blocker.summary,
        "cycle 3: pass rate 60% -> 70% (70 passed, 30 failed)"
    );
    assert!(!paths.handoff_path.exists());
    assert!(paths.final_run_dir().join("baseline.log").exists());

    let status = agent.records.status.load().expect("load").expect("status");
    assert_eq!(status.status, LifecycleStatus::Stopped);
    assert_eq!(agent.records.counter.load().expect("counter"), 3);

    let resumed = settled(run_cycle(&fixture.agent(), &tests, &worker).expect("resume"));
    assert!(resumed.resumed);
    assert_eq!(resumed.outcome, SignalOutcome::Failure);
    assert_eq!(tests.runs(), 7);
}

#[test]
fn final_run_can_still_converge() {
    let mut fixture = Fixture::new("api");
    fixture.spec.max_cycles = 1;
    let tests = ScriptedTestRunner::new(vec![
        counts_for_rate(40),
        counts_for_rate(80),
        counts_for_rate(88),
    ]);
    let worker = ScriptedWorker::new(Vec::new());

    run_cycle(&fixture.agent(), &tests, &worker).expect("cycle 1");
    let settlement = settled(run_cycle(&fixture.agent(), &tests, &worker).expect("final"));
    assert_eq!(settlement.outcome, SignalOutcome::Success);
    assert_eq!(settlement.cycle, 1);

    let paths = &fixture.agent().records.paths;
    assert!(paths.handoff_path.exists());
    assert!(!paths.blocker_path.exists());
}

#[test]
fn dependency_update_during_worker_restarts_without_counting() {
    let mut fixture = Fixture::new("api");
    fixture.spec.depends_on = parse_dependencies("auth");
    let handoff = fixture.publish_handoff("auth");

    let tests = ScriptedTestRunner::new(vec![
        counts_for_rate(40),
        counts_for_rate(45),
        counts_for_rate(70),
    ]);
    let touched = handoff.clone();
    let worker = ScriptedWorker::new(vec![
        ScriptedInvocation::lines(&["modified: src/api.rs"]).with_hook(move |_| {
            set_mtime(&touched, SystemTime::now() + Duration::from_secs(5)).expect("touch handoff");
        }),
        ScriptedInvocation::default(),
    ]);

    let outcome = run_cycle(&fixture.agent(), &tests, &worker).expect("cycle");
    assert_eq!(
        outcome,
        CycleOutcome::Restart {
            cycle: 1,
            checkpoint: Checkpoint::DuringWorker(0),
            updated: vec!["auth".to_string()],
        }
    );
    // Only the baseline ran; the post-test was skipped.
    assert_eq!(tests.runs(), 1);

    let agent = fixture.agent();
    assert_eq!(agent.records.counter.load().expect("counter"), 0);
    let status = agent.records.status.load().expect("load").expect("status");
    assert!(
        status
            .reason
            .as_deref()
            .is_some_and(|r| r.contains("auth"))
    );
    let meta = fs::read_to_string(agent.records.paths.cycle_dir(1).join("meta.json"))
        .expect("meta");
    assert!(meta.contains("\"restarted\""));

    // The dependency settles; the retried attempt is still cycle 1.
    set_mtime(&handoff, SystemTime::now() - Duration::from_secs(1)).expect("settle handoff");
    match run_cycle(&fixture.agent(), &tests, &worker).expect("retry") {
        CycleOutcome::Completed { cycle, .. } => assert_eq!(cycle, 1),
        other => panic!("expected completed cycle, got {other:?}"),
    }
    assert_eq!(fixture.agent().records.counter.load().expect("counter"), 1);
}

#[test]
fn dependency_update_after_post_test_restarts_but_keeps_summary() {
    let mut fixture = Fixture::new("api");
    fixture.spec.depends_on = parse_dependencies("auth");
    let handoff = fixture.publish_handoff("auth");

    let touched = handoff.clone();
    let tests = ScriptedTestRunner::new(vec![counts_for_rate(40), counts_for_rate(70)])
        .with_after_run(move |run| {
            if run == 2 {
                set_mtime(&touched, SystemTime::now() + Duration::from_secs(5))
                    .expect("touch handoff");
            }
        });
    let worker = ScriptedWorker::new(Vec::new());

    let outcome = run_cycle(&fixture.agent(), &tests, &worker).expect("cycle");
    assert_eq!(
        outcome,
        CycleOutcome::Restart {
            cycle: 1,
            checkpoint: Checkpoint::AfterPostTest,
            updated: vec!["auth".to_string()],
        }
    );
    assert_eq!(worker.invocations(), 1);

    let agent = fixture.agent();
    assert_eq!(agent.records.counter.load().expect("counter"), 0);
    let status = agent.records.status.load().expect("load").expect("status");
    assert_eq!(status.restart_cycle, 0);
    assert_eq!(
        status.work_summary.as_deref(),
        Some("cycle 1: pass rate 40% -> 70% (70 passed, 30 failed)")
    );
    assert!(
        status
            .reason
            .as_deref()
            .is_some_and(|r| r.contains("after post-test"))
    );
}

#[test]
fn dependency_update_before_worker_skips_worker() {
    let mut fixture = Fixture::new("api");
    fixture.spec.depends_on = parse_dependencies("auth");
    let handoff = fixture.publish_handoff("auth");
    // Newer than any marker stamped in the next few seconds.
    set_mtime(&handoff, SystemTime::now() + Duration::from_secs(30)).expect("touch handoff");

    let tests = ScriptedTestRunner::new(vec![counts_for_rate(40)]);
    let worker = ScriptedWorker::new(Vec::new());

    let outcome = run_cycle(&fixture.agent(), &tests, &worker).expect("cycle");
    assert!(matches!(
        outcome,
        CycleOutcome::Restart {
            checkpoint: Checkpoint::BeforeWorker,
            ..
        }
    ));
    assert_eq!(worker.invocations(), 0);
    assert_eq!(fixture.agent().records.counter.load().expect("counter"), 0);
}

#[test]
fn dependency_kinds_gate_the_cycle() {
    let mut fixture = Fixture::new("schema-impl");
    fixture.spec.depends_on = parse_dependencies("schema-tests, schema-refactor");
    let tests = ScriptedTestRunner::new(vec![counts_for_rate(95)]);
    let worker = ScriptedWorker::new(Vec::new());

    let err = run_cycle(&fixture.agent(), &tests, &worker).expect_err("timeout");
    let timeout = err
        .downcast_ref::<DependencyTimeoutError>()
        .expect("dependency timeout");
    assert_eq!(
        timeout.pending,
        vec!["schema-tests".to_string(), "schema-refactor".to_string()]
    );
    let agent = fixture.agent();
    let status = agent.records.status.load().expect("load").expect("status");
    assert_eq!(status.status, LifecycleStatus::Stopped);
    assert!(status.reason.is_some());
    assert_eq!(agent.records.counter.load().expect("counter"), 1);

    // Test files satisfy `schema-tests`; a completed status satisfies `schema-refactor`.
    let test_file = fixture.project_dir().join("tests/unit/test_schema.py");
    fs::create_dir_all(test_file.parent().expect("parent")).expect("mkdir");
    fs::write(&test_file, "def test_schema(): pass\n").expect("write test file");
    StatusStore::new(
        "schema-refactor",
        fixture.layout().status_path("schema-refactor"),
    )
    .update(|s| s.status = LifecycleStatus::Completed)
    .expect("refactor status");

    let settlement = settled(run_cycle(&fixture.agent(), &tests, &worker).expect("cycle"));
    assert_eq!(settlement.outcome, SignalOutcome::Success);
    assert_eq!(settlement.cycle, 2);
}

#[test]
fn fresh_start_reopens_a_blocked_agent() {
    let mut fixture = Fixture::new("api");
    fixture.spec.max_cycles = 1;
    let tests = ScriptedTestRunner::new(vec![
        counts_for_rate(40),
        counts_for_rate(50),
        counts_for_rate(50),
        counts_for_rate(90),
    ]);
    let worker = ScriptedWorker::new(Vec::new());

    run_cycle(&fixture.agent(), &tests, &worker).expect("cycle 1");
    let blocked = settled(run_cycle(&fixture.agent(), &tests, &worker).expect("final"));
    assert_eq!(blocked.outcome, SignalOutcome::Failure);

    let agent = fixture.agent();
    let reset = fresh_start(&agent.records).expect("fresh start");
    assert_eq!(reset.previous_counter, 1);
    assert!(reset.marker_removed);
    assert_eq!(agent.records.counter.load().expect("counter"), 0);

    let settlement = settled(run_cycle(&fixture.agent(), &tests, &worker).expect("after reset"));
    assert_eq!(settlement.cycle, 1);
    assert_eq!(settlement.outcome, SignalOutcome::Success);
    let paths = &fixture.agent().records.paths;
    assert!(paths.handoff_path.exists());
    assert!(!paths.blocker_path.exists());
}

#[test]
fn crashed_worker_counts_as_an_attempt() {
    let fixture = Fixture::new("api");
    let tests = ScriptedTestRunner::new(vec![
        counts_for_rate(40),
        counts_for_rate(40),
        counts_for_rate(60),
    ]);
    let worker = ScriptedWorker::new(vec![
        ScriptedInvocation::failing("worker binary missing"),
        ScriptedInvocation::default(),
    ]);

    let err = run_cycle(&fixture.agent(), &tests, &worker).expect_err("worker error");
    assert!(format!("{err:#}").contains("worker binary missing"));
    assert_eq!(fixture.agent().records.counter.load().expect("counter"), 1);

    match run_cycle(&fixture.agent(), &tests, &worker).expect("resume") {
        CycleOutcome::Completed { cycle, post, .. } => {
            assert_eq!(cycle, 2);
            assert_eq!(post, counts_for_rate(60));
        }
        other => panic!("expected completed cycle, got {other:?}"),
    }
}

#[test]
fn worker_receives_feedback_and_previous_summary() {
    let fixture = Fixture::new("api");
    let tests = ScriptedTestRunner::new(vec![
        counts_for_rate(40),
        counts_for_rate(50),
        counts_for_rate(50),
        counts_for_rate(60),
    ]);
    let worker = ScriptedWorker::new(Vec::new());

    run_cycle(&fixture.agent(), &tests, &worker).expect("cycle 1");
    let feedback = fixture.layout().feedback_path("api");
    fs::create_dir_all(feedback.parent().expect("parent")).expect("mkdir");
    fs::write(&feedback, "Focus on the checkout flow.\n").expect("feedback");
    run_cycle(&fixture.agent(), &tests, &worker).expect("cycle 2");

    let request = worker.last_request().expect("request");
    assert_eq!(request.cycle, 2);
    assert!(request.bundle.contains("Focus on the checkout flow."));
    assert!(
        request
            .bundle
            .contains("cycle 1: pass rate 40% -> 50% (50 passed, 50 failed)")
    );
    let context = fs::read_to_string(fixture.agent().records.paths.cycle_dir(2).join("context.md"))
        .expect("context");
    assert_eq!(context, request.bundle);
}
