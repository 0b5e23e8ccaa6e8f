//! Lifecycle tracker: execution and wave state machines.
//!
//! ```text
//! execution: pending ──► running ──► completed | failed | cancelled
//! wave:      pending ──► in_progress ──► completed | failed
//! ```
//!
//! Every applied transition upserts the aggregate (best-effort), records a
//! lifecycle event through the normalizer and publishes a compact
//! [`LifecycleSignal`]. An illegal transition is never an error for the
//! caller: it comes back as [`Transition::Rejected`] and is itself recorded
//! as a `lifecycle_anomaly` event.
//!
//! Finished executions are handed to the hub's retention window. Once the hub
//! lets one go, the tracker drops its in-memory run, waves and sequence
//! counter; later lookups go to the store.

mod anomaly;

pub use anomaly::{Anomaly, Transition};

use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};

use chrono::{SubsecRound, Utc};
use opentelemetry::KeyValue;
use serde_json::json;
use tracing::{Instrument, debug, info, warn};

use crate::hub::LifecycleSignal;
use crate::model::*;
use crate::normalizer::Normalizer;
use crate::store::EventStore;
use crate::telemetry::{metrics, spans};

#[derive(Default)]
struct State {
    executions: HashMap<ExecutionId, ExecutionRun>,
    waves: HashMap<WaveId, Wave>,
}

struct Inner<S> {
    normalizer: Normalizer<S>,
    state: RwLock<State>,
}

/// Cheap to clone; clones share state.
pub struct Tracker<S> {
    inner: Arc<Inner<S>>,
}

impl<S> Clone for Tracker<S> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<S: EventStore> Tracker<S> {
    pub fn new(normalizer: Normalizer<S>) -> Self {
        Self {
            inner: Arc::new(Inner {
                normalizer,
                state: RwLock::new(State::default()),
            }),
        }
    }

    pub fn normalizer(&self) -> &Normalizer<S> {
        &self.inner.normalizer
    }

    // -----------------------------------------------------------------------
    // Executions
    // -----------------------------------------------------------------------

    /// Start a new execution. It is running immediately.
    ///
    /// Resets the execution's sequence counter before anything is recorded
    /// for it, so its first sequenced record is always 1.
    pub async fn create_execution(
        &self,
        work_item_id: &str,
        total_tasks: u32,
        total_waves: u32,
    ) -> ExecutionId {
        let id = ExecutionId::new();
        let span = spans::start_lifecycle_span("create_execution", Some(id));
        async {
            let run = ExecutionRun {
                id,
                work_item_id: work_item_id.to_string(),
                status: ExecutionStatus::Running,
                total_tasks,
                completed_tasks: 0,
                failed_tasks: 0,
                total_waves,
                current_wave: if total_waves > 0 { 1 } else { 0 },
                error: None,
                started_at: now(),
                completed_at: None,
            };

            self.normalizer().counters().reset(id).await;
            self.write_state().executions.insert(id, run.clone());
            self.save_execution(&run).await;

            let payload = EventPayload::new(
                "execution_start",
                Category::Lifecycle,
                format!("Execution started for work item {work_item_id}"),
            )
            .details(json!({
                "work_item_id": work_item_id,
                "total_tasks": total_tasks,
                "total_waves": total_waves,
            }));
            self.normalizer()
                .emit_unsequenced(SystemContext::new().execution(id), payload)
                .await;

            self.transitioned("execution", ExecutionStatus::Pending.as_str(), run.status.as_str());
            self.signal(id, None, run.status.as_str());
            info!(work_item_id, total_tasks, total_waves, "execution created");
        }
        .instrument(span)
        .await;
        id
    }

    /// Overwrite progress counters. Last write wins.
    pub async fn update_progress(
        &self,
        execution_id: ExecutionId,
        completed: u32,
        failed: u32,
        current_wave: u32,
    ) -> Transition<()> {
        const OP: &str = "update_progress";
        let span = spans::start_lifecycle_span(OP, Some(execution_id));
        async {
            if !self.ensure_execution(execution_id).await {
                return self.reject(Anomaly::unknown_execution(OP, execution_id)).await;
            }

            let updated = {
                let mut state = self.write_state();
                match state.executions.get_mut(&execution_id) {
                    Some(run) if run.status.is_terminal() => Err(format!(
                        "execution is already {}",
                        run.status
                    )),
                    Some(run) => {
                        run.completed_tasks = completed;
                        run.failed_tasks = failed;
                        run.current_wave = current_wave;
                        Ok(run.clone())
                    }
                    None => Err("execution state missing".to_string()),
                }
            };
            let run = match updated {
                Ok(run) => run,
                Err(reason) => {
                    return self
                        .reject(Anomaly::new(OP, Some(execution_id), reason))
                        .await;
                }
            };

            self.save_execution(&run).await;
            let payload = EventPayload::new(
                "execution_progress",
                Category::Lifecycle,
                format!(
                    "{completed}/{} tasks completed, {failed} failed, wave {current_wave}",
                    run.total_tasks
                ),
            )
            .details(json!({
                "completed_tasks": completed,
                "failed_tasks": failed,
                "total_tasks": run.total_tasks,
                "current_wave": current_wave,
            }));
            self.normalizer()
                .emit(SystemContext::new().execution(execution_id), payload)
                .await;
            self.signal(execution_id, None, run.status.as_str());
            Transition::Applied(())
        }
        .instrument(span)
        .await
    }

    /// Move a running execution to a terminal status.
    ///
    /// Completing an execution that is already terminal is rejected.
    pub async fn complete_execution(
        &self,
        execution_id: ExecutionId,
        status: ExecutionStatus,
        error: Option<String>,
    ) -> Transition<()> {
        const OP: &str = "complete_execution";
        let span = spans::start_lifecycle_span(OP, Some(execution_id));
        let span_handle = span.clone();
        async {
            if !status.is_terminal() {
                return self
                    .reject(Anomaly::new(
                        OP,
                        Some(execution_id),
                        format!("{status} is not a terminal status"),
                    ))
                    .await;
            }
            if !self.ensure_execution(execution_id).await {
                return self.reject(Anomaly::unknown_execution(OP, execution_id)).await;
            }

            let updated = {
                let mut state = self.write_state();
                match state.executions.get_mut(&execution_id) {
                    Some(run) if !run.status.can_transition_to(status) => Err(format!(
                        "cannot move execution from {} to {status}",
                        run.status
                    )),
                    Some(run) => {
                        let from = run.status;
                        run.status = status;
                        run.error = error.clone();
                        run.completed_at = Some(now());
                        Ok((from, run.clone()))
                    }
                    None => Err("execution state missing".to_string()),
                }
            };
            let (from, run) = match updated {
                Ok(applied) => applied,
                Err(reason) => {
                    return self
                        .reject(Anomaly::new(OP, Some(execution_id), reason))
                        .await;
                }
            };

            self.save_execution(&run).await;
            let summary = match &error {
                Some(e) => format!("Execution {status}: {e}"),
                None => format!("Execution {status}"),
            };
            let payload = EventPayload::new("execution_complete", Category::Lifecycle, summary)
                .details(json!({
                    "status": status.as_str(),
                    "error": error,
                    "completed_tasks": run.completed_tasks,
                    "failed_tasks": run.failed_tasks,
                    "total_tasks": run.total_tasks,
                }));
            self.normalizer()
                .emit(SystemContext::new().execution(execution_id), payload)
                .await;

            spans::record_transition(&span_handle, from.as_str(), status.as_str());
            self.transitioned("execution", from.as_str(), status.as_str());
            self.signal(execution_id, None, status.as_str());
            self.release(execution_id).await;
            Transition::Applied(())
        }
        .instrument(span)
        .await
    }

    // -----------------------------------------------------------------------
    // Waves
    // -----------------------------------------------------------------------

    /// Open a wave. `wave_number` may not go below the execution's current wave.
    ///
    /// Skipping ahead is allowed and logged; skipped waves are not created.
    pub async fn start_wave(
        &self,
        execution_id: ExecutionId,
        wave_number: u32,
        task_count: u32,
    ) -> Transition<WaveId> {
        const OP: &str = "start_wave";
        let span = spans::start_lifecycle_span(OP, Some(execution_id));
        async {
            if wave_number == 0 {
                return self
                    .reject(Anomaly::new(OP, Some(execution_id), "wave numbers start at 1"))
                    .await;
            }
            if !self.ensure_execution(execution_id).await {
                return self.reject(Anomaly::unknown_execution(OP, execution_id)).await;
            }

            let opened = {
                let mut guard = self.write_state();
                let state = &mut *guard;
                let duplicate = state
                    .waves
                    .values()
                    .any(|w| w.execution_id == execution_id && w.wave_number == wave_number);
                match state.executions.get_mut(&execution_id) {
                    Some(run) if run.status != ExecutionStatus::Running => {
                        Err(format!("execution is {}", run.status))
                    }
                    Some(run) if wave_number < run.current_wave => Err(format!(
                        "wave {wave_number} is behind current wave {}",
                        run.current_wave
                    )),
                    Some(_) if duplicate => Err(format!("wave {wave_number} already started")),
                    Some(run) => {
                        if wave_number > run.current_wave + 1 {
                            warn!(
                                wave_number,
                                current_wave = run.current_wave,
                                "wave skips ahead of current wave"
                            );
                        }
                        run.current_wave = wave_number;
                        let wave = Wave {
                            id: WaveId::new(),
                            execution_id,
                            wave_number,
                            status: WaveStatus::InProgress,
                            task_count,
                            completed_count: 0,
                            failed_count: 0,
                            duration_ms: None,
                            pass_rate: 0.0,
                            started_at: now(),
                            completed_at: None,
                        };
                        state.waves.insert(wave.id, wave.clone());
                        Ok(wave)
                    }
                    None => Err("execution state missing".to_string()),
                }
            };
            let wave = match opened {
                Ok(wave) => wave,
                Err(reason) => {
                    return self
                        .reject(Anomaly::new(OP, Some(execution_id), reason))
                        .await;
                }
            };

            if let Some(run) = self.execution(execution_id) {
                self.save_execution(&run).await;
            }
            self.save_wave(&wave).await;

            let payload = EventPayload::new(
                "wave_start",
                Category::Lifecycle,
                format!("Wave {wave_number} started with {task_count} tasks"),
            )
            .details(json!({ "task_count": task_count }));
            self.normalizer()
                .emit_unsequenced(
                    SystemContext::new()
                        .execution(execution_id)
                        .wave(wave.id, wave_number),
                    payload,
                )
                .await;

            self.transitioned("wave", WaveStatus::Pending.as_str(), wave.status.as_str());
            self.signal(execution_id, Some(&wave), wave.status.as_str());
            Transition::Applied(wave.id)
        }
        .instrument(span)
        .await
    }

    /// Close a wave. It completes only if no task failed.
    pub async fn complete_wave(
        &self,
        wave_id: WaveId,
        completed: u32,
        failed: u32,
        duration_ms: u64,
    ) -> Transition<()> {
        const OP: &str = "complete_wave";
        if !self.ensure_wave(wave_id).await {
            let span = spans::start_lifecycle_span(OP, None);
            return self
                .reject(Anomaly::new(OP, None, format!("unknown wave {wave_id}")))
                .instrument(span)
                .await;
        }

        let execution_id = self.wave(wave_id).map(|w| w.execution_id);
        let span = spans::start_lifecycle_span(OP, execution_id);
        let span_handle = span.clone();
        async {
            let updated = {
                let mut state = self.write_state();
                match state.waves.get_mut(&wave_id) {
                    Some(wave) if wave.status.is_terminal() => Err((
                        Some(wave.execution_id),
                        format!("wave {} is already {}", wave.wave_number, wave.status),
                    )),
                    Some(wave) => {
                        let from = wave.status;
                        wave.status = WaveStatus::from_counts(failed);
                        wave.completed_count = completed;
                        wave.failed_count = failed;
                        wave.duration_ms = Some(duration_ms);
                        wave.pass_rate = pass_rate(completed, wave.task_count);
                        wave.completed_at = Some(now());
                        Ok((from, wave.clone()))
                    }
                    None => Err((None, "wave state missing".to_string())),
                }
            };
            let (from, wave) = match updated {
                Ok(applied) => applied,
                Err((execution_id, reason)) => {
                    return self
                        .reject(Anomaly::new(OP, execution_id, reason))
                        .await;
                }
            };

            if u64::from(completed) + u64::from(failed) > u64::from(wave.task_count) {
                warn!(
                    wave_number = wave.wave_number,
                    completed,
                    failed,
                    task_count = wave.task_count,
                    "wave reports more finished tasks than it started"
                );
            }

            self.save_wave(&wave).await;
            let payload = EventPayload::new(
                "wave_complete",
                Category::Lifecycle,
                format!(
                    "Wave {} {}: {completed}/{} passed",
                    wave.wave_number, wave.status, wave.task_count
                ),
            )
            .details(json!({
                "status": wave.status.as_str(),
                "completed_count": completed,
                "failed_count": failed,
                "task_count": wave.task_count,
                "pass_rate": wave.pass_rate,
            }))
            .duration_ms(duration_ms);
            self.normalizer()
                .emit(
                    SystemContext::new()
                        .execution(wave.execution_id)
                        .wave(wave.id, wave.wave_number),
                    payload,
                )
                .await;

            spans::record_transition(&span_handle, from.as_str(), wave.status.as_str());
            self.transitioned("wave", from.as_str(), wave.status.as_str());
            self.signal(wave.execution_id, Some(&wave), wave.status.as_str());
            Transition::Applied(())
        }
        .instrument(span)
        .await
    }

    // -----------------------------------------------------------------------
    // Snapshots
    // -----------------------------------------------------------------------

    /// In-memory snapshot of an execution this tracker knows about.
    pub fn execution(&self, id: ExecutionId) -> Option<ExecutionRun> {
        self.read_state().executions.get(&id).cloned()
    }

    pub fn wave(&self, id: WaveId) -> Option<Wave> {
        self.read_state().waves.get(&id).cloned()
    }

    /// Waves of one execution known to this tracker, by wave number.
    pub fn waves(&self, execution_id: ExecutionId) -> Vec<Wave> {
        let mut waves: Vec<Wave> = self
            .read_state()
            .waves
            .values()
            .filter(|w| w.execution_id == execution_id)
            .cloned()
            .collect();
        waves.sort_by_key(|w| w.wave_number);
        waves
    }

    // -----------------------------------------------------------------------
    // Internals
    // -----------------------------------------------------------------------

    fn read_state(&self) -> std::sync::RwLockReadGuard<'_, State> {
        self.inner.state.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write_state(&self) -> std::sync::RwLockWriteGuard<'_, State> {
        self.inner
            .state
            .write()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Make sure the execution is in memory, loading it (and its waves) from
    /// the store after a restart. False if neither knows it.
    async fn ensure_execution(&self, id: ExecutionId) -> bool {
        if self.read_state().executions.contains_key(&id) {
            return true;
        }
        let store = self.normalizer().store();
        let run = match store.get_execution(id).await {
            Ok(run) => run,
            Err(_) => return false,
        };
        let waves = store.list_waves(id).await.unwrap_or_default();
        let mut state = self.write_state();
        for wave in waves {
            state.waves.entry(wave.id).or_insert(wave);
        }
        state.executions.entry(id).or_insert(run);
        true
    }

    async fn ensure_wave(&self, id: WaveId) -> bool {
        if self.read_state().waves.contains_key(&id) {
            return true;
        }
        let wave = match self.normalizer().store().get_wave(id).await {
            Ok(wave) => wave,
            Err(_) => return false,
        };
        let execution_id = wave.execution_id;
        self.write_state().waves.entry(id).or_insert(wave);
        self.ensure_execution(execution_id).await;
        true
    }

    async fn save_execution(&self, run: &ExecutionRun) {
        let timeout = self.normalizer().config().write_timeout;
        let result =
            tokio::time::timeout(timeout, self.normalizer().store().upsert_execution(run)).await;
        if let Some(error) = write_error(result) {
            warn!(execution_id = %run.id, %error, "execution upsert failed");
            metrics::aggregate_write_failures().add(1, &[KeyValue::new("entity", "execution")]);
        }
    }

    async fn save_wave(&self, wave: &Wave) {
        let timeout = self.normalizer().config().write_timeout;
        let result =
            tokio::time::timeout(timeout, self.normalizer().store().upsert_wave(wave)).await;
        if let Some(error) = write_error(result) {
            warn!(wave_id = %wave.id, %error, "wave upsert failed");
            metrics::aggregate_write_failures().add(1, &[KeyValue::new("entity", "wave")]);
        }
    }

    /// Record the anomaly and hand it back to the caller.
    async fn reject<T>(&self, anomaly: Anomaly) -> Transition<T> {
        warn!(
            operation = anomaly.operation,
            execution_id = ?anomaly.execution_id,
            reason = %anomaly.reason,
            "lifecycle anomaly"
        );
        metrics::lifecycle_anomalies().add(1, &[KeyValue::new("operation", anomaly.operation)]);

        let payload = EventPayload::new(
            "lifecycle_anomaly",
            Category::Error,
            format!("{} rejected: {}", anomaly.operation, anomaly.reason),
        )
        .details(json!({
            "operation": anomaly.operation,
            "reason": anomaly.reason,
        }));
        let context = match anomaly.execution_id {
            Some(id) => SystemContext::new().execution(id),
            None => SystemContext::new(),
        };
        self.normalizer().emit(context, payload).await;

        // A finished execution reloaded from the store goes back into retention.
        if let Some(id) = anomaly.execution_id {
            let finished = self
                .read_state()
                .executions
                .get(&id)
                .is_some_and(|run| run.status.is_terminal());
            if finished {
                self.release(id).await;
            }
        }
        Transition::Rejected(anomaly)
    }

    /// Retire a finished execution on the hub and forget every execution the
    /// hub's retention window pushed out.
    async fn release(&self, execution_id: ExecutionId) {
        let expired = self.normalizer().hub().retire(execution_id);
        if expired.is_empty() {
            return;
        }
        {
            let mut state = self.write_state();
            for id in &expired {
                state.executions.remove(id);
            }
            state.waves.retain(|_, wave| !expired.contains(&wave.execution_id));
        }
        for id in expired {
            self.normalizer().counters().remove(id).await;
            debug!(execution_id = %id, "finished execution released");
        }
    }

    fn transitioned(&self, entity: &'static str, from: &str, to: &str) {
        info!(entity, from, to, "lifecycle transition");
        metrics::lifecycle_transitions().add(
            1,
            &[
                KeyValue::new("entity", entity),
                KeyValue::new("to", to.to_string()),
            ],
        );
    }

    fn signal(&self, execution_id: ExecutionId, wave: Option<&Wave>, status: &str) {
        self.normalizer().hub().publish_lifecycle(LifecycleSignal {
            execution_id,
            wave_id: wave.map(|w| w.id),
            wave_number: wave.map(|w| w.wave_number),
            status: status.to_string(),
        });
    }
}

fn now() -> chrono::DateTime<Utc> {
    Utc::now().trunc_subsecs(3)
}

fn write_error(
    result: std::result::Result<crate::error::Result<()>, tokio::time::error::Elapsed>,
) -> Option<String> {
    match result {
        Ok(Ok(())) => None,
        Ok(Err(e)) => Some(e.to_string()),
        Err(_) => Some("write timed out".to_string()),
    }
}
