//! Integration tests for the execution and wave state machines.

use std::sync::Arc;

use observatory::hub::{
    EnvelopeKind, EnvelopePayload, Hub, HubConfig, SubscriptionFilter, Topic, TopicSet,
};
use observatory::lifecycle::{Transition, Tracker};
use observatory::model::*;
use observatory::normalizer::{Normalizer, NormalizerConfig};
use observatory::store::{EventStore, MemoryStore};

fn setup() -> (Arc<MemoryStore>, Tracker<Arc<MemoryStore>>) {
    let store = Arc::new(MemoryStore::new());
    let normalizer = Normalizer::new(Arc::clone(&store), Hub::default(), NormalizerConfig::default());
    (store, Tracker::new(normalizer))
}

fn entry_types(store: &MemoryStore) -> Vec<String> {
    store.events().into_iter().map(|r| r.entry_type).collect()
}

// ---------------------------------------------------------------------------
// Executions
// ---------------------------------------------------------------------------

#[tokio::test]
async fn create_execution_starts_running() {
    let (store, tracker) = setup();

    let exec = tracker.create_execution("work-1", 4, 2).await;
    let run = tracker.execution(exec).unwrap();
    assert_eq!(run.status, ExecutionStatus::Running);
    assert_eq!(run.current_wave, 1);
    assert_eq!(run.total_tasks, 4);
    assert!(run.completed_at.is_none());

    let stored = store.get_execution(exec).await.unwrap();
    assert_eq!(stored, run);

    let events = store.events();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].entry_type, "execution_start");
    assert_eq!(events[0].sequence, None);
    assert_eq!(events[0].correlation.execution_id, Some(exec));
}

#[tokio::test]
async fn execution_without_waves_has_no_current_wave() {
    let (_store, tracker) = setup();
    let exec = tracker.create_execution("work-1", 3, 0).await;
    assert_eq!(tracker.execution(exec).unwrap().current_wave, 0);
}

#[tokio::test]
async fn update_progress_is_last_write_wins() {
    let (store, tracker) = setup();
    let exec = tracker.create_execution("work-1", 10, 3).await;

    assert!(tracker.update_progress(exec, 5, 1, 2).await.is_applied());
    assert!(tracker.update_progress(exec, 3, 0, 1).await.is_applied());

    let run = store.get_execution(exec).await.unwrap();
    assert_eq!((run.completed_tasks, run.failed_tasks, run.current_wave), (3, 0, 1));

    let progress: Vec<Option<u64>> = store
        .events()
        .iter()
        .filter(|r| r.entry_type == "execution_progress")
        .map(|r| r.sequence)
        .collect();
    assert_eq!(progress, vec![Some(1), Some(2)]);
}

#[tokio::test]
async fn complete_execution_writes_completion() {
    let (store, tracker) = setup();
    let exec = tracker.create_execution("work-1", 2, 1).await;

    let outcome = tracker
        .complete_execution(exec, ExecutionStatus::Failed, Some("build broke".to_string()))
        .await;
    assert_eq!(outcome, Transition::Applied(()));

    let run = store.get_execution(exec).await.unwrap();
    assert_eq!(run.status, ExecutionStatus::Failed);
    assert_eq!(run.error.as_deref(), Some("build broke"));
    assert!(run.completed_at.is_some());

    let last = store.events().pop().unwrap();
    assert_eq!(last.entry_type, "execution_complete");
    assert_eq!(last.details["status"], "failed");
}

#[tokio::test]
async fn completing_twice_is_an_anomaly() {
    let (store, tracker) = setup();
    let exec = tracker.create_execution("work-1", 1, 0).await;

    assert!(
        tracker
            .complete_execution(exec, ExecutionStatus::Completed, None)
            .await
            .is_applied()
    );
    let second = tracker
        .complete_execution(exec, ExecutionStatus::Cancelled, None)
        .await;
    let anomaly = second.anomaly().unwrap();
    assert_eq!(anomaly.operation, "complete_execution");
    assert_eq!(anomaly.execution_id, Some(exec));

    // The first completion stands.
    let run = store.get_execution(exec).await.unwrap();
    assert_eq!(run.status, ExecutionStatus::Completed);

    let last = store.events().pop().unwrap();
    assert_eq!(last.entry_type, "lifecycle_anomaly");
    assert_eq!(last.category, Category::Error);
    assert_eq!(last.correlation.execution_id, Some(exec));
}

#[tokio::test]
async fn non_terminal_completion_status_is_rejected() {
    let (_store, tracker) = setup();
    let exec = tracker.create_execution("work-1", 1, 0).await;
    let outcome = tracker
        .complete_execution(exec, ExecutionStatus::Pending, None)
        .await;
    assert!(!outcome.is_applied());
    assert_eq!(tracker.execution(exec).unwrap().status, ExecutionStatus::Running);
}

#[tokio::test]
async fn progress_after_completion_is_rejected() {
    let (_store, tracker) = setup();
    let exec = tracker.create_execution("work-1", 2, 1).await;
    let _ = tracker
        .complete_execution(exec, ExecutionStatus::Completed, None)
        .await;

    let outcome = tracker.update_progress(exec, 2, 0, 1).await;
    assert!(outcome.anomaly().is_some());
    assert_eq!(tracker.execution(exec).unwrap().completed_tasks, 0);
}

#[tokio::test]
async fn unknown_ids_become_anomalies() {
    let (store, tracker) = setup();

    let outcome = tracker.update_progress(ExecutionId::new(), 1, 0, 1).await;
    assert!(outcome.anomaly().unwrap().reason.contains("unknown execution"));

    let outcome = tracker.complete_wave(WaveId::new(), 1, 0, 10).await;
    let anomaly = outcome.anomaly().unwrap();
    assert_eq!(anomaly.operation, "complete_wave");
    assert_eq!(anomaly.execution_id, None);

    assert_eq!(entry_types(&store), vec!["lifecycle_anomaly", "lifecycle_anomaly"]);
}

#[tokio::test]
async fn state_is_recovered_from_the_store() {
    let store = Arc::new(MemoryStore::new());
    let exec = {
        let normalizer =
            Normalizer::new(Arc::clone(&store), Hub::default(), NormalizerConfig::default());
        let tracker = Tracker::new(normalizer);
        let exec = tracker.create_execution("work-1", 2, 1).await;
        let _ = tracker.start_wave(exec, 1, 2).await;
        exec
    };

    // A fresh tracker over the same store, as after a restart.
    let normalizer = Normalizer::new(Arc::clone(&store), Hub::default(), NormalizerConfig::default());
    let tracker = Tracker::new(normalizer);
    assert!(tracker.execution(exec).is_none());

    let wave_id = store.list_waves(exec).await.unwrap()[0].id;
    assert!(tracker.complete_wave(wave_id, 2, 0, 100).await.is_applied());
    assert!(
        tracker
            .complete_execution(exec, ExecutionStatus::Completed, None)
            .await
            .is_applied()
    );
    assert_eq!(
        store.get_wave(wave_id).await.unwrap().status,
        WaveStatus::Completed
    );
}

#[tokio::test]
async fn sequence_numbers_continue_after_a_restart() {
    let store = Arc::new(MemoryStore::new());
    let exec = {
        let normalizer =
            Normalizer::new(Arc::clone(&store), Hub::default(), NormalizerConfig::default());
        let tracker = Tracker::new(normalizer.clone());
        let exec = tracker.create_execution("work-1", 3, 1).await;
        for n in 1..=3 {
            let emitted = normalizer
                .emit(
                    AgentRunContext::new(exec),
                    EventPayload::new("tool_start", Category::Tool, format!("call {n}")),
                )
                .await;
            assert_eq!(emitted.sequence(), Some(n));
        }
        exec
    };

    // New process: fresh counters, same store.
    let normalizer = Normalizer::new(Arc::clone(&store), Hub::default(), NormalizerConfig::default());
    let tracker = Tracker::new(normalizer);
    assert!(tracker.update_progress(exec, 1, 0, 1).await.is_applied());
    assert!(
        tracker
            .complete_execution(exec, ExecutionStatus::Completed, None)
            .await
            .is_applied()
    );

    let sequences: Vec<u64> = store
        .events()
        .iter()
        .filter(|r| r.correlation.execution_id == Some(exec))
        .filter_map(|r| r.sequence)
        .collect();
    assert_eq!(sequences, vec![1, 2, 3, 4, 5]);
}

#[tokio::test]
async fn finished_executions_are_released_beyond_the_retention_window() {
    let store = Arc::new(MemoryStore::new());
    let hub = Hub::new(HubConfig {
        retained_executions: 2,
        ..HubConfig::default()
    });
    let normalizer = Normalizer::new(Arc::clone(&store), hub.clone(), NormalizerConfig::default());
    let tracker = Tracker::new(normalizer.clone());

    let mut finished = Vec::new();
    for n in 0..5 {
        let exec = tracker.create_execution(&format!("work-{n}"), 1, 1).await;
        let wave = tracker.start_wave(exec, 1, 1).await.applied().unwrap();
        assert!(tracker.complete_wave(wave, 1, 0, 10).await.is_applied());
        assert!(
            tracker
                .complete_execution(exec, ExecutionStatus::Completed, None)
                .await
                .is_applied()
        );
        finished.push(exec);
    }

    // Subscribing to executions nobody ever ran leaves nothing behind.
    for _ in 0..10 {
        let (handle, _rx) = hub.subscribe_unbounded(SubscriptionFilter::execution(ExecutionId::new()));
        assert!(hub.unsubscribe(&handle));
    }

    assert_eq!(hub.stats().executions, 2);
    assert_eq!(normalizer.counters().tracked(), 2);
    assert!(tracker.execution(finished[0]).is_none());
    assert!(tracker.waves(finished[0]).is_empty());
    assert_eq!(
        tracker.execution(finished[4]).unwrap().status,
        ExecutionStatus::Completed
    );
    assert!(hub.buffered(finished[0]).is_empty());
    assert!(!hub.buffered(finished[4]).is_empty());

    // A released execution is still known through the store.
    let again = tracker
        .complete_execution(finished[0], ExecutionStatus::Completed, None)
        .await;
    assert!(again.anomaly().is_some());
    assert_eq!(hub.stats().executions, 2);
    assert_eq!(normalizer.counters().tracked(), 2);

    // Its anomaly record continued the persisted numbering.
    let last = store
        .events()
        .into_iter()
        .filter(|r| r.correlation.execution_id == Some(finished[0]))
        .last()
        .unwrap();
    assert_eq!(last.entry_type, "lifecycle_anomaly");
    assert_eq!(last.sequence, Some(3));
}

// ---------------------------------------------------------------------------
// Waves
// ---------------------------------------------------------------------------

#[tokio::test]
async fn wave_completes_only_without_failures() {
    let (store, tracker) = setup();
    let exec = tracker.create_execution("work-1", 7, 2).await;

    let w1 = tracker.start_wave(exec, 1, 4).await.applied().unwrap();
    let started = store.get_wave(w1).await.unwrap();
    assert_eq!(started.status, WaveStatus::InProgress);
    assert_eq!(started.wave_number, 1);

    assert!(tracker.complete_wave(w1, 4, 0, 900).await.is_applied());
    let wave = store.get_wave(w1).await.unwrap();
    assert_eq!(wave.status, WaveStatus::Completed);
    assert_eq!(wave.pass_rate, 1.0);
    assert_eq!(wave.duration_ms, Some(900));
    assert!(wave.completed_at.is_some());

    let w2 = tracker.start_wave(exec, 2, 3).await.applied().unwrap();
    assert!(tracker.complete_wave(w2, 2, 1, 400).await.is_applied());
    let wave = store.get_wave(w2).await.unwrap();
    assert_eq!(wave.status, WaveStatus::Failed);
    assert!((wave.pass_rate - 2.0 / 3.0).abs() < 1e-9);
    assert_eq!(tracker.execution(exec).unwrap().current_wave, 2);
}

#[tokio::test]
async fn oversized_wave_counts_are_accepted_without_overflow() {
    let (_store, tracker) = setup();
    let exec = tracker.create_execution("work-1", 2, 1).await;
    let wave = tracker.start_wave(exec, 1, 2).await.applied().unwrap();

    assert!(
        tracker
            .complete_wave(wave, u32::MAX, u32::MAX, 5)
            .await
            .is_applied()
    );
    let wave = tracker.wave(wave).unwrap();
    assert_eq!(wave.status, WaveStatus::Failed);
    assert_eq!(wave.failed_count, u32::MAX);
}

#[tokio::test]
async fn empty_wave_has_zero_pass_rate() {
    let (store, tracker) = setup();
    let exec = tracker.create_execution("work-1", 0, 1).await;
    let wave = tracker.start_wave(exec, 1, 0).await.applied().unwrap();
    assert!(tracker.complete_wave(wave, 0, 0, 5).await.is_applied());

    let wave = store.get_wave(wave).await.unwrap();
    assert_eq!(wave.status, WaveStatus::Completed);
    assert_eq!(wave.pass_rate, 0.0);
}

#[tokio::test]
async fn wave_records_carry_wave_correlation() {
    let (store, tracker) = setup();
    let exec = tracker.create_execution("work-1", 2, 1).await;
    let wave = tracker.start_wave(exec, 1, 2).await.applied().unwrap();
    let _ = tracker.complete_wave(wave, 2, 0, 50).await;

    let events = store.events();
    let start = events.iter().find(|r| r.entry_type == "wave_start").unwrap();
    assert_eq!(start.sequence, None);
    assert_eq!(start.correlation.wave_id, Some(wave));

    let complete = events.iter().find(|r| r.entry_type == "wave_complete").unwrap();
    assert_eq!(complete.sequence, Some(1));
    assert_eq!(complete.correlation.wave_number, Some(1));
    assert_eq!(complete.duration_ms, Some(50));
    assert_eq!(complete.details["pass_rate"], 1.0);
}

#[tokio::test]
async fn going_back_a_wave_is_an_anomaly_but_skipping_ahead_is_allowed() {
    let (_store, tracker) = setup();
    let exec = tracker.create_execution("work-1", 9, 5).await;

    assert!(tracker.start_wave(exec, 3, 3).await.is_applied());
    assert_eq!(tracker.execution(exec).unwrap().current_wave, 3);
    assert_eq!(tracker.waves(exec).len(), 1);

    let back = tracker.start_wave(exec, 2, 3).await;
    assert!(back.anomaly().unwrap().reason.contains("behind"));

    let duplicate = tracker.start_wave(exec, 3, 3).await;
    assert!(duplicate.anomaly().unwrap().reason.contains("already started"));

    assert!(!tracker.start_wave(exec, 0, 1).await.is_applied());
}

#[tokio::test]
async fn completing_a_wave_twice_is_an_anomaly() {
    let (store, tracker) = setup();
    let exec = tracker.create_execution("work-1", 2, 1).await;
    let wave = tracker.start_wave(exec, 1, 2).await.applied().unwrap();

    assert!(tracker.complete_wave(wave, 2, 0, 10).await.is_applied());
    let again = tracker.complete_wave(wave, 0, 2, 10).await;
    assert_eq!(again.anomaly().unwrap().execution_id, Some(exec));
    assert_eq!(store.get_wave(wave).await.unwrap().status, WaveStatus::Completed);
}

#[tokio::test]
async fn waves_cannot_start_on_a_finished_execution() {
    let (_store, tracker) = setup();
    let exec = tracker.create_execution("work-1", 2, 2).await;
    let _ = tracker
        .complete_execution(exec, ExecutionStatus::Cancelled, None)
        .await;
    assert!(tracker.start_wave(exec, 1, 2).await.anomaly().is_some());
}

// ---------------------------------------------------------------------------
// Signals and failure isolation
// ---------------------------------------------------------------------------

#[tokio::test]
async fn transitions_publish_lifecycle_signals() {
    let (_store, tracker) = setup();
    let hub = tracker.normalizer().hub().clone();
    let (_handle, mut rx) = hub.subscribe_unbounded(
        SubscriptionFilter::all().topics(TopicSet::only([Topic::Lifecycle])),
    );

    let exec = tracker.create_execution("work-1", 1, 1).await;
    let wave = tracker.start_wave(exec, 1, 1).await.applied().unwrap();
    let _ = tracker.complete_wave(wave, 1, 0, 10).await;

    let mut statuses = Vec::new();
    while let Ok(envelope) = rx.try_recv() {
        if envelope.kind == EnvelopeKind::Lifecycle {
            if let EnvelopePayload::Lifecycle(signal) = envelope.payload {
                assert_eq!(signal.execution_id, exec);
                statuses.push(signal.status);
            }
        }
    }
    assert_eq!(statuses, vec!["running", "in_progress", "completed"]);
}

#[tokio::test]
async fn aggregate_write_failures_do_not_abort_transitions() {
    let (store, tracker) = setup();
    let exec = tracker.create_execution("work-1", 1, 0).await;

    store.set_outage(true);
    let outcome = tracker
        .complete_execution(exec, ExecutionStatus::Completed, None)
        .await;
    assert!(outcome.is_applied());
    assert_eq!(
        tracker.execution(exec).unwrap().status,
        ExecutionStatus::Completed
    );
    store.set_outage(false);

    // The store still has the running snapshot; the dropped record was not broadcast.
    assert_eq!(
        store.get_execution(exec).await.unwrap().status,
        ExecutionStatus::Running
    );
    assert!(!entry_types(&store).contains(&"execution_complete".to_string()));
}
