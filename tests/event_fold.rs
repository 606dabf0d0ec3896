mod common;

use common::{diamond, harness};

use proptest::prelude::*;

use runloom::config::RunConfig;
use runloom::events::{
    EventPayload, FailureInfo, RunEvent, RunStateFold, StoredEvent,
};
use runloom::plan::StepSelection;
use runloom::types::{RunId, RunStatus, SkipCause, StepKey, StepStatus};

#[tokio::test]
async fn replayed_fold_matches_live_statuses() {
    let h = harness();
    let run_id = h
        .coordinator
        .submit(&diamond(), RunConfig::default(), StepSelection::all())
        .await
        .unwrap();
    assert_eq!(h.coordinator.wait(&run_id).await.unwrap(), RunStatus::Success);

    let events = h.coordinator.events_since(&run_id, 0).await.unwrap();
    let fold = RunStateFold::replay(run_id.clone(), &events);
    let live = h.coordinator.step_statuses(&run_id).await.unwrap();

    assert_eq!(fold.status, RunStatus::Success);
    for (key, status) in &live {
        assert_eq!(fold.step_status(key), *status);
    }
    // Replaying a partial prefix then the full stream lands in the same
    // place as one replay: the fold is seq-idempotent.
    let mut partial = RunStateFold::new(run_id);
    for event in &events[..events.len() / 2] {
        partial.apply_stored(event);
    }
    for event in &events {
        partial.apply_stored(event);
    }
    assert_eq!(partial.status, fold.status);
    assert_eq!(partial.last_seq(), fold.last_seq());
}

fn mk_event(run: &RunId, step_idx: usize, kind: usize) -> RunEvent {
    let step = StepKey::new(format!("s{step_idx}"));
    match kind {
        0 => RunEvent::run_scoped(
            run.clone(),
            EventPayload::RunStarting {
                job: "prop".into(),
                mode: "default".into(),
                parent: None,
                tags: serde_json::json!({}),
                config: serde_json::json!({}),
            },
        ),
        1 => RunEvent::run_scoped(run.clone(), EventPayload::RunStarted),
        2 => RunEvent::run_scoped(run.clone(), EventPayload::RunSuccess),
        3 => RunEvent::run_scoped(
            run.clone(),
            EventPayload::RunFailure {
                failed_steps: vec![step],
            },
        ),
        4 => RunEvent::step_scoped(run.clone(), step, EventPayload::StepStarted { attempt: 1 }),
        5 => RunEvent::step_scoped(
            run.clone(),
            step,
            EventPayload::StepSucceeded { version: None },
        ),
        6 => RunEvent::step_scoped(
            run.clone(),
            step,
            EventPayload::StepFailed {
                failure: FailureInfo::msg("prop failure"),
            },
        ),
        _ => RunEvent::step_scoped(
            run.clone(),
            step,
            EventPayload::StepSkipped {
                cause: SkipCause::Memoized,
            },
        ),
    }
}

type Fingerprint = (RunStatus, Vec<(StepKey, StepStatus)>, Vec<StepKey>, u64);

fn fingerprint(fold: &RunStateFold) -> Fingerprint {
    let mut steps: Vec<(StepKey, StepStatus)> = fold
        .steps()
        .iter()
        .filter_map(|(k, s)| s.status.map(|st| (k.clone(), st)))
        .collect();
    steps.sort();
    (fold.status, steps, fold.interrupted_steps(), fold.last_seq())
}

proptest! {
    /// Folding is a pure function of the ordered stream: one-shot
    /// replay, incremental application, and at-least-once duplicated
    /// delivery all land in the same state.
    #[test]
    fn fold_is_delivery_insensitive(specs in proptest::collection::vec((0..4usize, 0..8usize), 0..40)) {
        let run = RunId::new("prop");
        let events: Vec<StoredEvent> = specs
            .iter()
            .enumerate()
            .map(|(i, (step, kind))| StoredEvent {
                seq: i as u64 + 1,
                event: mk_event(&run, *step, *kind),
            })
            .collect();

        let replayed = RunStateFold::replay(run.clone(), &events);

        let mut incremental = RunStateFold::new(run.clone());
        for event in &events {
            incremental.apply_stored(event);
        }
        prop_assert_eq!(fingerprint(&replayed), fingerprint(&incremental));

        let mut duplicated = RunStateFold::new(run.clone());
        for event in &events {
            duplicated.apply_stored(event);
            duplicated.apply_stored(event);
        }
        prop_assert_eq!(fingerprint(&replayed), fingerprint(&duplicated));
    }
}
