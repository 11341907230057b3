//! Pause, suspend, stop and abort requests against a running engine.

use daq_relay::error::EngineError;
use daq_relay::experiment::{
    Awaitable, Document, DocumentKind, EngineState, ExitStatus, Msg, RunEngine, RunOptions,
    RunOutcome, Suspender,
};
use daq_relay::distribution::Subscription;
use daq_relay::signal::SoftSignal;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

fn record_names(engine: &RunEngine) -> Arc<Mutex<Vec<&'static str>>> {
    let names = Arc::new(Mutex::new(Vec::new()));
    let sink = names.clone();
    engine.set_msg_hook(move |msg| sink.lock().push(msg.name()));
    names
}

fn record_documents(engine: &RunEngine) -> Arc<Mutex<Vec<Document>>> {
    let docs = Arc::new(Mutex::new(Vec::new()));
    let sink = docs.clone();
    engine.subscribe(Subscription::All, move |_, doc| {
        sink.lock().push(doc.clone());
        Ok(())
    });
    docs
}

/// Run `f` against the engine handle after `delay`.
fn after<F>(engine: &RunEngine, delay: Duration, f: F)
where
    F: FnOnce(&daq_relay::EngineHandle) + Send + 'static,
{
    let handle = engine.handle();
    tokio::spawn(async move {
        tokio::time::sleep(delay).await;
        f(&handle);
    });
}

#[tokio::test(start_paused = true)]
async fn test_pause_during_suspension_holds_until_resume() {
    let mut engine = RunEngine::new();
    let names = record_names(&engine);
    let sig = SoftSignal::new("interlock", 1.0);
    engine
        .install_suspender(&Arc::new(Suspender::bool_high(sig.shared())))
        .unwrap();

    after(&engine, Duration::from_millis(100), |h| h.request_pause(false));
    let setter = sig.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_secs(1)).await;
        setter.put(0.0);
    });

    let outcome = engine.run(vec![Msg::checkpoint(), Msg::null()]).await.unwrap();
    assert_eq!(outcome, RunOutcome::Paused);
    assert_eq!(engine.state(), EngineState::Paused);
    assert_eq!(*names.lock(), vec!["wait_for"]);

    let outcome = engine.resume().await.unwrap();
    assert!(matches!(outcome, RunOutcome::Completed { .. }));
    assert_eq!(*names.lock(), vec!["wait_for", "checkpoint", "null"]);
}

#[tokio::test(start_paused = true)]
async fn test_deferred_pause_during_suspension_stops_at_next_checkpoint() {
    let mut engine = RunEngine::new();
    let names = record_names(&engine);
    let sig = SoftSignal::new("interlock", 1.0);
    engine
        .install_suspender(&Arc::new(Suspender::bool_high(sig.shared())))
        .unwrap();

    after(&engine, Duration::from_millis(100), |h| h.request_pause(true));
    let setter = sig.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_secs(1)).await;
        setter.put(0.0);
    });

    let outcome = engine.run(vec![Msg::checkpoint(), Msg::null()]).await.unwrap();
    assert_eq!(outcome, RunOutcome::Paused);
    assert_eq!(*names.lock(), vec!["wait_for", "checkpoint"]);

    engine.resume().await.unwrap();
    assert_eq!(*names.lock(), vec!["wait_for", "checkpoint", "null"]);
}

#[tokio::test(start_paused = true)]
async fn test_stop_during_suspension_raises_interrupted() {
    let mut engine = RunEngine::new();
    let natural_clear = Duration::from_secs(10);
    let stop_at = Duration::from_millis(100);

    after(&engine, Duration::from_millis(10), move |h| {
        h.request_suspend(
            Awaitable::new(tokio::time::sleep(natural_clear)),
            None,
            None,
            "waiting for beam",
        );
    });
    after(&engine, stop_at, |h| h.stop());

    let start = Instant::now();
    let err = engine
        .run_with(
            vec![Msg::checkpoint(), Msg::sleep(Duration::from_secs(5))],
            RunOptions::strict(),
        )
        .await
        .unwrap_err();
    let elapsed = start.elapsed();

    let EngineError::Interrupted(interrupted) = err else {
        panic!("expected Interrupted, got {err:?}");
    };
    assert!(!interrupted.is_resumable());
    assert!(interrupted.reason.contains("suspending"));
    assert!(elapsed >= stop_at, "stopped too early: {elapsed:?}");
    assert!(elapsed < natural_clear, "waited for natural clear: {elapsed:?}");
    assert_eq!(engine.state(), EngineState::Idle);
}

#[tokio::test(start_paused = true)]
async fn test_strict_pause_is_resumable() {
    let mut engine = RunEngine::new();
    after(&engine, Duration::from_millis(100), |h| h.request_pause(false));

    let err = engine
        .run_with(
            vec![Msg::checkpoint(), Msg::sleep(Duration::from_secs(1))],
            RunOptions::strict(),
        )
        .await
        .unwrap_err();
    match err {
        EngineError::Interrupted(interrupted) => assert!(interrupted.is_resumable()),
        other => panic!("expected Interrupted, got {other:?}"),
    }

    let outcome = engine.resume().await.unwrap();
    assert!(matches!(outcome, RunOutcome::Completed { .. }));
}

#[tokio::test(start_paused = true)]
async fn test_deferred_pause_waits_for_checkpoint() {
    let mut engine = RunEngine::new();
    let names = record_names(&engine);
    let mut state = engine.handle().watch_state();
    after(&engine, Duration::from_millis(100), |h| h.request_pause(true));

    let outcome = engine
        .run(vec![
            Msg::checkpoint(),
            Msg::sleep(Duration::from_secs(1)),
            Msg::null(),
            Msg::checkpoint(),
            Msg::null(),
        ])
        .await
        .unwrap();

    assert_eq!(outcome, RunOutcome::Paused);
    assert!(state.has_changed().unwrap());
    assert_eq!(*state.borrow_and_update(), EngineState::Paused);
    assert_eq!(*names.lock(), vec!["checkpoint", "sleep", "null", "checkpoint"]);

    engine.resume().await.unwrap();
    assert_eq!(
        *names.lock(),
        vec!["checkpoint", "sleep", "null", "checkpoint", "null"]
    );
}

#[tokio::test(start_paused = true)]
async fn test_requested_suspension_runs_pre_and_post_plans() {
    let mut engine = RunEngine::new();
    let names = record_names(&engine);
    after(&engine, Duration::from_millis(100), |h| {
        h.request_suspend(
            Awaitable::new(tokio::time::sleep(Duration::from_millis(500))),
            Some(vec![Msg::null()]),
            Some(vec![Msg::null()]),
            "operator hold",
        );
    });

    let start = Instant::now();
    engine
        .run(vec![Msg::checkpoint(), Msg::sleep(Duration::from_secs(1))])
        .await
        .unwrap();

    assert!(start.elapsed() >= Duration::from_millis(1600));
    assert_eq!(
        *names.lock(),
        vec![
            "checkpoint",
            "sleep",
            "rewindable",
            "null",
            "wait_for",
            "null",
            "rewindable",
            "sleep"
        ]
    );
}

#[tokio::test(start_paused = true)]
async fn test_suspend_without_checkpoint_pauses_instead() {
    let mut engine = RunEngine::new();
    let names = record_names(&engine);
    after(&engine, Duration::from_millis(100), |h| {
        h.request_suspend(Awaitable::ready(), None, None, "operator hold");
    });

    let outcome = engine
        .run(vec![Msg::clear_checkpoint(), Msg::sleep(Duration::from_secs(1))])
        .await
        .unwrap();
    assert_eq!(outcome, RunOutcome::Paused);

    engine.resume().await.unwrap();
    assert_eq!(*names.lock(), vec!["clear_checkpoint", "sleep", "sleep"]);
}

#[tokio::test(start_paused = true)]
async fn test_strict_suspend_without_checkpoint_raises_promptly() {
    let mut engine = RunEngine::new();
    after(&engine, Duration::from_millis(100), |h| {
        h.request_suspend(
            Awaitable::new(tokio::time::sleep(Duration::from_secs(60))),
            None,
            None,
            "operator hold",
        );
    });

    let start = Instant::now();
    let err = engine
        .run_with(
            vec![Msg::clear_checkpoint(), Msg::sleep(Duration::from_secs(50))],
            RunOptions::strict(),
        )
        .await
        .unwrap_err();

    let EngineError::Interrupted(interrupted) = err else {
        panic!("expected Interrupted, got {err:?}");
    };
    assert!(interrupted.reason.contains("operator hold"));
    assert!(start.elapsed() < Duration::from_secs(1));
    assert_eq!(engine.state(), EngineState::Paused);
}

#[tokio::test(start_paused = true)]
async fn test_stop_closes_open_run_with_success() {
    let mut engine = RunEngine::new();
    let docs = record_documents(&engine);
    after(&engine, Duration::from_millis(100), |h| h.stop());

    let outcome = engine
        .run(vec![Msg::open_run(), Msg::sleep(Duration::from_secs(1)), Msg::close_run()])
        .await
        .unwrap();

    assert!(matches!(outcome, RunOutcome::Stopped { ref run_uids } if run_uids.len() == 1));
    let docs = docs.lock();
    assert_eq!(docs.len(), 2);
    let Document::Stop(stop) = &docs[1] else {
        panic!("expected stop, got {:?}", docs[1]);
    };
    assert_eq!(stop.exit_status, ExitStatus::Success);
    assert_eq!(stop.run_uid, docs[0].uid());
}

#[tokio::test(start_paused = true)]
async fn test_abort_records_reason() {
    let mut engine = RunEngine::new();
    let docs = record_documents(&engine);
    after(&engine, Duration::from_millis(100), |h| h.abort("sample drifted"));

    let outcome = engine
        .run(vec![Msg::open_run(), Msg::sleep(Duration::from_secs(1))])
        .await
        .unwrap();

    let RunOutcome::Aborted { reason, run_uids } = outcome else {
        panic!("expected Aborted, got {outcome:?}");
    };
    assert_eq!(reason, "sample drifted");
    assert_eq!(run_uids.len(), 1);

    let docs = docs.lock();
    let Document::Stop(stop) = &docs[1] else {
        panic!("expected stop, got {:?}", docs[1]);
    };
    assert_eq!(stop.exit_status, ExitStatus::Abort);
    assert_eq!(stop.reason, "sample drifted");
}

#[tokio::test(start_paused = true)]
async fn test_abort_while_paused() {
    let mut engine = RunEngine::new();
    after(&engine, Duration::from_millis(100), |h| h.request_pause(false));
    engine
        .run(vec![Msg::open_run(), Msg::sleep(Duration::from_secs(1))])
        .await
        .unwrap();

    // Handle requests are ignored once paused; the owner decides.
    engine.handle().abort("ignored");
    assert_eq!(engine.state(), EngineState::Paused);

    let outcome = engine.abort("operator").unwrap();
    assert!(matches!(outcome, RunOutcome::Aborted { ref reason, .. } if reason == "operator"));
    assert!(matches!(
        engine.resume().await,
        Err(EngineError::InvalidState { .. })
    ));
}

#[tokio::test]
async fn test_failing_callback_reports_on_failure_channel() {
    let mut engine = RunEngine::new();
    let handle = engine.handle();
    let mut failures = handle.callback_failures();
    let docs = record_documents(&engine);
    let token = engine.subscribe(DocumentKind::Start, |_, _| anyhow::bail!("disk full"));

    let outcome = engine
        .run(vec![Msg::open_run(), Msg::close_run()])
        .await
        .unwrap();
    assert!(matches!(outcome, RunOutcome::Completed { .. }));
    assert_eq!(docs.lock().len(), 2);

    let failure = failures.try_recv().unwrap();
    assert_eq!(failure.token, token);
    assert_eq!(failure.kind, DocumentKind::Start);
    assert!(failure.message.contains("disk full"));

    assert!(engine.unsubscribe(token));
    engine.run(vec![Msg::open_run()]).await.unwrap();
    assert!(failures.try_recv().is_err());
}

#[tokio::test]
async fn test_run_uids_in_order() {
    let mut engine = RunEngine::new();
    let docs = record_documents(&engine);
    let outcome = engine
        .run(vec![
            Msg::open_run(),
            Msg::close_run(),
            Msg::open_run(),
            Msg::close_run(),
        ])
        .await
        .unwrap();

    let starts: Vec<String> = docs
        .lock()
        .iter()
        .filter(|d| d.kind() == DocumentKind::Start)
        .map(|d| d.uid().to_string())
        .collect();
    assert_eq!(outcome.run_uids(), starts.as_slice());
}
