//! Integration tests for the event normalizer.

use std::sync::Arc;
use std::time::Duration;

use observatory::hub::{Envelope, Hub, HubConfig, SubscriptionFilter};
use observatory::model::*;
use observatory::normalizer::{Emitted, Normalizer, NormalizerConfig};
use observatory::store::{EventQuery, EventStore, MemoryStore};
use serde_json::json;
use tokio::sync::mpsc;

fn setup() -> (Arc<MemoryStore>, Normalizer<Arc<MemoryStore>>) {
    let store = Arc::new(MemoryStore::new());
    let normalizer = Normalizer::new(
        Arc::clone(&store),
        Hub::new(HubConfig::default()),
        NormalizerConfig::default(),
    );
    (store, normalizer)
}

fn tool_call(n: usize) -> EventPayload {
    EventPayload::new("tool_start", Category::Tool, format!("call {n}"))
        .details(json!({ "tool_name": "bash" }))
}

fn drain(rx: &mut mpsc::UnboundedReceiver<Envelope>) -> Vec<Envelope> {
    let mut out = Vec::new();
    while let Ok(envelope) = rx.try_recv() {
        out.push(envelope);
    }
    out
}

// ---------------------------------------------------------------------------
// Normalization
// ---------------------------------------------------------------------------

#[tokio::test]
async fn emit_flattens_agent_run_context() {
    let (store, normalizer) = setup();
    let exec = ExecutionId::new();
    let wave = WaveId::new();

    let emitted = normalizer
        .emit(
            AgentRunContext::new(exec)
                .task("task-7")
                .agent_instance("agent-a")
                .wave(wave, 1)
                .correlation_id("req-1"),
            tool_call(0).duration_ms(42),
        )
        .await;
    assert!(emitted.is_recorded());

    let events = store.events();
    assert_eq!(events.len(), 1);
    let record = &events[0];
    assert_eq!(Some(record.id), emitted.id());
    assert_eq!(record.source, Source::AgentRun);
    assert_eq!(record.sequence, Some(1));
    assert_eq!(record.duration_ms, Some(42));
    assert_eq!(record.correlation.execution_id, Some(exec));
    assert_eq!(record.correlation.task_id.as_deref(), Some("task-7"));
    assert_eq!(record.correlation.agent_instance_id.as_deref(), Some("agent-a"));
    assert_eq!(record.correlation.wave_id, Some(wave));
    assert_eq!(record.correlation.wave_number, Some(1));
    assert_eq!(record.correlation.correlation_id.as_deref(), Some("req-1"));
    assert!(record.correlation.chat_id.is_none());
    assert!(record.correlation.webhook_url.is_none());
    assert_eq!(record.timestamp.timestamp_subsec_nanos() % 1_000_000, 0);
}

#[tokio::test]
async fn records_outside_an_execution_are_unsequenced() {
    let (store, normalizer) = setup();

    let emitted = normalizer
        .emit(
            ChatContext::new("chat-1").user("u-1"),
            EventPayload::new("chat_message", Category::Message, "hello"),
        )
        .await;
    assert_eq!(emitted.sequence(), None);
    assert!(emitted.is_recorded());

    let record = &store.events()[0];
    assert_eq!(record.source, Source::Chat);
    assert_eq!(record.correlation.chat_id.as_deref(), Some("chat-1"));
    assert_eq!(record.correlation.user_id.as_deref(), Some("u-1"));
    assert!(record.correlation.execution_id.is_none());
}

#[tokio::test]
async fn long_summaries_are_truncated_not_rejected() {
    let store = Arc::new(MemoryStore::new());
    let normalizer = Normalizer::new(
        Arc::clone(&store),
        Hub::default(),
        NormalizerConfig {
            summary_max_chars: 10,
            ..NormalizerConfig::default()
        },
    );

    let emitted = normalizer
        .emit_system("system_note", &"x".repeat(50), json!({}))
        .await;
    assert!(emitted.is_recorded());

    let summary = &store.events()[0].summary;
    assert_eq!(summary.chars().count(), 10);
    assert!(summary.ends_with('…'));
}

#[tokio::test]
async fn invalid_context_is_rejected_and_not_persisted() {
    let (store, normalizer) = setup();
    let (_handle, mut rx) = normalizer.hub().subscribe_unbounded(SubscriptionFilter::all());

    let bad_webhook = WebhookContext {
        webhook_url: "ftp://example.com/hook".to_string(),
        correlation_id: None,
    };
    let emitted = normalizer
        .emit(bad_webhook, EventPayload::new("webhook_received", Category::Custom, "x"))
        .await;
    assert!(matches!(emitted, Emitted::Rejected { .. }));
    assert_eq!(emitted.id(), None);

    let orphan_wave = SystemContext {
        wave_id: Some(WaveId::new()),
        wave_number: Some(1),
        ..SystemContext::default()
    };
    let emitted = normalizer
        .emit(orphan_wave, EventPayload::new("wave_note", Category::System, "x"))
        .await;
    assert!(matches!(emitted, Emitted::Rejected { .. }));

    let emitted = normalizer
        .emit(ChatContext::new("  "), EventPayload::new("chat_message", Category::Message, "x"))
        .await;
    assert!(matches!(emitted, Emitted::Rejected { .. }));

    let emitted = normalizer
        .emit(SystemContext::new(), EventPayload::new("", Category::System, "x"))
        .await;
    assert!(matches!(emitted, Emitted::Rejected { .. }));

    assert!(store.events().is_empty());
    assert!(drain(&mut rx).is_empty());
}

// ---------------------------------------------------------------------------
// Sequencing
// ---------------------------------------------------------------------------

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_emitters_get_gap_free_sequences() {
    const EMITTERS: usize = 8;
    const PER_EMITTER: usize = 25;

    let (store, normalizer) = setup();
    let exec = ExecutionId::new();
    let (_handle, mut rx) = normalizer
        .hub()
        .subscribe_unbounded(SubscriptionFilter::execution(exec));

    let mut tasks = Vec::new();
    for emitter in 0..EMITTERS {
        let normalizer = normalizer.clone();
        tasks.push(tokio::spawn(async move {
            let mut seqs = Vec::new();
            for n in 0..PER_EMITTER {
                let ctx = AgentRunContext::new(exec).task(format!("task-{emitter}"));
                let emitted = normalizer.emit(ctx, tool_call(n)).await;
                seqs.push(emitted.sequence().unwrap());
            }
            seqs
        }));
    }

    let mut all = Vec::new();
    for task in tasks {
        all.extend(task.await.unwrap());
    }
    all.sort_unstable();
    let expected: Vec<u64> = (1..=(EMITTERS * PER_EMITTER) as u64).collect();
    assert_eq!(all, expected);

    // Stored and broadcast in sequence order.
    let stored: Vec<u64> = store.events().iter().filter_map(|r| r.sequence).collect();
    assert_eq!(stored, expected);

    let broadcast: Vec<u64> = drain(&mut rx)
        .iter()
        .filter_map(|e| e.event_record().and_then(|r| r.sequence))
        .collect();
    assert_eq!(broadcast, expected);
}

#[tokio::test]
async fn reset_restarts_numbering_at_one() {
    let (_store, normalizer) = setup();
    let exec = ExecutionId::new();

    for n in 0..5 {
        normalizer.emit(AgentRunContext::new(exec), tool_call(n)).await;
    }
    assert_eq!(normalizer.counters().current(exec).await, 5);

    normalizer.counters().reset(exec).await;
    let emitted = normalizer.emit(AgentRunContext::new(exec), tool_call(5)).await;
    assert_eq!(emitted.sequence(), Some(1));
}

#[tokio::test]
async fn numbering_resumes_from_persisted_history() {
    let (store, normalizer) = setup();
    let exec = ExecutionId::new();
    for n in 0..3 {
        normalizer.emit(AgentRunContext::new(exec), tool_call(n)).await;
    }

    // Fresh counters over the same store.
    let restarted = Normalizer::new(Arc::clone(&store), Hub::default(), NormalizerConfig::default());
    assert_eq!(restarted.counters().current(exec).await, 0);
    let emitted = restarted.emit(AgentRunContext::new(exec), tool_call(3)).await;
    assert_eq!(emitted.sequence(), Some(4));
    assert_eq!(restarted.counters().current(exec).await, 4);
}

#[tokio::test]
async fn executions_are_numbered_independently() {
    let (_store, normalizer) = setup();
    let (a, b) = (ExecutionId::new(), ExecutionId::new());

    normalizer.emit(AgentRunContext::new(a), tool_call(0)).await;
    normalizer.emit(AgentRunContext::new(a), tool_call(1)).await;
    let first_b = normalizer
        .emit(ScriptContext::new("deploy.sh").execution(b), tool_call(0))
        .await;
    assert_eq!(first_b.sequence(), Some(1));
}

// ---------------------------------------------------------------------------
// Store failures
// ---------------------------------------------------------------------------

#[tokio::test]
async fn store_outage_drops_without_broadcast_or_gap() {
    let (store, normalizer) = setup();
    let exec = ExecutionId::new();
    let (_handle, mut rx) = normalizer
        .hub()
        .subscribe_unbounded(SubscriptionFilter::execution(exec));

    let first = normalizer.emit(AgentRunContext::new(exec), tool_call(0)).await;
    assert_eq!(first.sequence(), Some(1));

    store.set_outage(true);
    let dropped = normalizer.emit(AgentRunContext::new(exec), tool_call(1)).await;
    match &dropped {
        Emitted::Dropped { reason, .. } => assert!(reason.contains("unavailable")),
        other => panic!("expected Dropped, got {other:?}"),
    }
    assert!(dropped.id().is_some());

    store.set_outage(false);
    let next = normalizer.emit(AgentRunContext::new(exec), tool_call(2)).await;
    assert_eq!(next.sequence(), Some(2));

    let delivered: Vec<u64> = drain(&mut rx)
        .iter()
        .filter_map(|e| e.event_record().and_then(|r| r.sequence))
        .collect();
    assert_eq!(delivered, vec![1, 2]);

    let stored = store
        .query_events(&EventQuery::for_execution(exec))
        .await
        .unwrap();
    assert_eq!(stored.len(), 2);
    assert_eq!(normalizer.hub().buffered(exec).len(), 2);
}

#[tokio::test]
async fn slow_store_write_times_out_and_drops() {
    let store = Arc::new(MemoryStore::new());
    let normalizer = Normalizer::new(
        Arc::clone(&store),
        Hub::default(),
        NormalizerConfig {
            write_timeout: Duration::from_millis(20),
            ..NormalizerConfig::default()
        },
    );
    let exec = ExecutionId::new();

    store.set_write_delay(Some(Duration::from_millis(200)));
    let emitted = normalizer.emit(AgentRunContext::new(exec), tool_call(0)).await;
    match emitted {
        Emitted::Dropped { reason, .. } => assert!(reason.contains("timed out")),
        other => panic!("expected Dropped, got {other:?}"),
    }
    assert!(normalizer.hub().buffered(exec).is_empty());

    store.set_write_delay(None);
    let emitted = normalizer.emit(AgentRunContext::new(exec), tool_call(1)).await;
    assert_eq!(emitted.sequence(), Some(1));
}

#[tokio::test]
async fn wrappers_share_the_emit_path() {
    let (store, normalizer) = setup();
    let exec = ExecutionId::new();

    let system = normalizer
        .emit_system("system_started", "booted", json!({ "version": "1" }))
        .await;
    assert_eq!(system.sequence(), None);

    let lifecycle = normalizer
        .emit_lifecycle(exec, "task_started", "task 1 started", json!({}))
        .await;
    assert_eq!(lifecycle.sequence(), Some(1));

    let events = store.events();
    assert_eq!(events[0].source, Source::System);
    assert_eq!(events[0].category, Category::System);
    assert_eq!(events[1].category, Category::Lifecycle);
    assert_eq!(events[1].correlation.execution_id, Some(exec));
}
