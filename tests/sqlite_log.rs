#![cfg(feature = "sqlite")]

mod common;

use std::sync::Arc;

use common::sum_step;

use runloom::config::RunConfig;
use runloom::events::{EventLog, EventPayload, RunEvent, SqliteEventLog};
use runloom::executor::InProcessExecutor;
use runloom::graph::GraphBuilder;
use runloom::io::InMemoryIoManager;
use runloom::plan::StepSelection;
use runloom::run::RunCoordinator;
use runloom::types::{RunId, RunStatus, StepKey};

async fn temp_log(dir: &tempfile::TempDir) -> SqliteEventLog {
    let path = dir.path().join("events.db");
    let url = format!("sqlite://{}", path.display());
    SqliteEventLog::connect(Some(&url)).await.unwrap()
}

fn started(run: &RunId, step: &str) -> RunEvent {
    RunEvent::step_scoped(
        run.clone(),
        StepKey::new(step),
        EventPayload::StepStarted { attempt: 1 },
    )
}

#[tokio::test]
async fn events_survive_a_reconnect() {
    let dir = tempfile::tempdir().unwrap();
    let run = RunId::new("r1");
    {
        let log = temp_log(&dir).await;
        log.append(started(&run, "a")).await.unwrap();
        log.append(RunEvent::step_scoped(
            run.clone(),
            StepKey::new("a"),
            EventPayload::StepSucceeded { version: None },
        ))
        .await
        .unwrap();
    }

    let log = temp_log(&dir).await;
    let events = log.events(&run).await.unwrap();
    assert_eq!(events.len(), 2);
    assert_eq!(events[0].seq, 1);
    assert!(matches!(
        events[1].event.payload,
        EventPayload::StepSucceeded { .. }
    ));
}

#[tokio::test]
async fn seq_is_per_run_and_events_since_filters() {
    let dir = tempfile::tempdir().unwrap();
    let log = temp_log(&dir).await;
    let r1 = RunId::new("r1");
    let r2 = RunId::new("r2");

    for step in ["a", "b", "c"] {
        log.append(started(&r1, step)).await.unwrap();
    }
    let other = log.append(started(&r2, "a")).await.unwrap();
    assert_eq!(other.seq, 1);

    let tail = log.events_since(&r1, 1).await.unwrap();
    assert_eq!(tail.len(), 2);
    assert_eq!(tail[0].seq, 2);

    let mut ids = log.run_ids().await.unwrap();
    ids.sort();
    assert_eq!(ids, vec![r1, r2]);
}

#[tokio::test]
async fn coordinator_wait_returns_on_a_live_only_watch() {
    let dir = tempfile::tempdir().unwrap();
    let log = Arc::new(temp_log(&dir).await);
    let coordinator = RunCoordinator::new(
        Arc::clone(&log) as Arc<dyn EventLog>,
        Arc::new(InMemoryIoManager::new()),
        Arc::new(InProcessExecutor::new()),
    );
    let graph = GraphBuilder::new("pair")
        .add_step(sum_step("a", &[]))
        .add_step(sum_step("b", &["a"]))
        .build()
        .unwrap();

    // The sqlite watch has no backlog replay, so wait must not leave a
    // window between its status read and its subscription.
    let run = coordinator
        .submit(&graph, RunConfig::default(), StepSelection::all())
        .await
        .unwrap();
    assert_eq!(coordinator.wait(&run).await.unwrap(), RunStatus::Success);

    let events = log.events(&run).await.unwrap();
    assert!(matches!(
        events.last().unwrap().event.payload,
        EventPayload::RunSuccess
    ));
}

#[tokio::test]
async fn watcher_receives_live_appends() {
    let dir = tempfile::tempdir().unwrap();
    let log = temp_log(&dir).await;
    let run = RunId::new("r1");

    let mut watcher = log.watch(&run);
    log.append(started(&run, "a")).await.unwrap();
    let event = watcher.recv().await.unwrap();
    assert_eq!(event.seq, 1);
    assert_eq!(event.event.step, Some(StepKey::new("a")));
}
