//! Broadcast hub: in-process pub/sub for normalized records.
//!
//! ```text
//! Normalizer ──publish──► Hub ─┬─► execution channel ─► replay buffer (bounded)
//!                              │                     └─► scoped subscribers ─► Sink
//!                              └─► "all" subscribers ───────────────────────► Sink
//! ```
//!
//! ## Rules
//! - **Per-execution locking**: each execution has its own channel lock, so
//!   unrelated executions never contend. `All` subscribers share one lock,
//!   skipped entirely while there are none.
//! - **Replay before live**: a scoped subscription replays the buffer and is
//!   registered under the same lock `publish` takes, so no live record can
//!   slip in ahead of the history.
//! - **Non-blocking fan-out**: delivery goes through [`Sink::deliver`], which
//!   never waits. Closed sinks are removed; full sinks lose that envelope only.
//! - **Bounded retention**: a [`Hub::retire`]d execution keeps its replay
//!   buffer until `retained_executions` newer ones retired after it. Channels
//!   with no subscribers and nothing worth replaying are dropped.

pub mod connection;
pub mod envelope;
pub mod replay;
pub mod sink;
pub mod subscription;
pub mod topic;

pub use connection::{ClientMessage, ClientReply, Connection};
pub use envelope::{Envelope, EnvelopeKind, EnvelopePayload, LifecycleSignal};
pub use replay::ReplayBuffer;
pub use sink::{CallbackSink, Delivery, Sink};
pub use subscription::{
    Scope, SubscribeRequest, SubscriptionError, SubscriptionFilter, SubscriptionHandle,
    SubscriptionId,
};
pub use topic::{Topic, TopicSet};

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};
use std::time::Duration;

use opentelemetry::KeyValue;
use tokio::sync::{Notify, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

use crate::model::{EventRecord, ExecutionId};
use crate::telemetry::metrics;

/// Hub tuning.
#[derive(Debug, Clone)]
pub struct HubConfig {
    /// Records buffered per execution for replay. Oldest evicted first.
    pub replay_capacity: usize,
    /// Finished executions whose replay buffers are kept for late joiners.
    pub retained_executions: usize,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            replay_capacity: 100,
            retained_executions: 256,
        }
    }
}

/// Point-in-time counters, for health endpoints.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
pub struct HubStats {
    pub executions: usize,
    pub scoped_subscribers: usize,
    pub global_subscribers: usize,
    pub buffered_records: usize,
}

struct Subscriber {
    id: SubscriptionId,
    filter: SubscriptionFilter,
    sink: Arc<dyn Sink>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Retention {
    /// Execution still running, or never retired.
    Active,
    /// Finished; buffer kept for late joiners.
    Retained,
    /// Pushed out of retention; dropped once its last subscriber leaves.
    Expired,
}

struct ExecutionChannel {
    replay: ReplayBuffer,
    subscribers: Vec<Subscriber>,
    retention: Retention,
    /// Detached from the channel map; holders must look it up again.
    removed: bool,
}

impl ExecutionChannel {
    fn idle(&self) -> bool {
        self.subscribers.is_empty()
            && match self.retention {
                Retention::Active => self.replay.is_empty(),
                Retention::Retained => false,
                Retention::Expired => true,
            }
    }
}

struct Inner {
    config: HubConfig,
    channels: RwLock<HashMap<ExecutionId, Arc<Mutex<ExecutionChannel>>>>,
    global: Mutex<Vec<Subscriber>>,
    /// Length of `global`, readable without its lock.
    global_count: AtomicUsize,
    /// Retired executions, oldest first.
    retired: Mutex<VecDeque<ExecutionId>>,
    next_id: AtomicU64,
}

/// What a replaying subscriber actually received.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
struct ReplayReport {
    replayed: usize,
    dropped: usize,
}

/// Pub/sub router keyed by execution id, plus a synthetic `All` scope.
///
/// Cheap to clone; clones share state.
#[derive(Clone)]
pub struct Hub {
    inner: Arc<Inner>,
}

impl Default for Hub {
    fn default() -> Self {
        Self::new(HubConfig::default())
    }
}

impl Hub {
    pub fn new(config: HubConfig) -> Self {
        Self {
            inner: Arc::new(Inner {
                config,
                channels: RwLock::new(HashMap::new()),
                global: Mutex::new(Vec::new()),
                global_count: AtomicUsize::new(0),
                retired: Mutex::new(VecDeque::new()),
                next_id: AtomicU64::new(1),
            }),
        }
    }

    pub fn config(&self) -> &HubConfig {
        &self.inner.config
    }

    // -----------------------------------------------------------------------
    // Publishing
    // -----------------------------------------------------------------------

    /// Buffer a record under its execution and fan it out to matching subscribers.
    ///
    /// Records without an execution id reach `All` subscribers only.
    /// Returns the number of sinks that accepted the record.
    pub fn publish(&self, record: Arc<EventRecord>) -> usize {
        let topic = Topic::of(&record.entry_type);
        let mut delivered = 0;

        if let Some(execution_id) = record.execution_id() {
            delivered += self.with_channel(execution_id, |channel| {
                channel.replay.push(Arc::clone(&record));
                fan_out(&mut channel.subscribers, |sub| {
                    sub.filter
                        .matches(&record, topic)
                        .then(|| Envelope::event(Arc::clone(&record)))
                })
            });
        }

        delivered += self.fan_out_global(|sub| {
            sub.filter
                .matches(&record, topic)
                .then(|| Envelope::event(Arc::clone(&record)))
        });

        trace!(
            record_id = %record.id,
            sequence = ?record.sequence,
            topic = %topic,
            delivered,
            "record published"
        );
        delivered
    }

    /// Deliver a compact lifecycle notification. Not buffered.
    ///
    /// Reaches subscribers of the execution and `All` subscribers that want the
    /// lifecycle topic and have no task/tool field filters.
    pub fn publish_lifecycle(&self, signal: LifecycleSignal) -> usize {
        let wants = |sub: &Subscriber| {
            sub.filter.topics.contains(Topic::Lifecycle) && !sub.filter.has_field_filters()
        };
        let mut delivered = 0;

        if let Some(channel) = self.existing_channel(signal.execution_id) {
            delivered += fan_out(&mut lock(&channel).subscribers, |sub| {
                wants(sub).then(|| Envelope::lifecycle(signal.clone()))
            });
        }
        delivered += self.fan_out_global(|sub| {
            wants(sub).then(|| Envelope::lifecycle(signal.clone()))
        });
        delivered
    }

    /// Send a heartbeat to every subscriber, pruning closed sinks and the
    /// channels they leave idle.
    pub fn heartbeat(&self) -> usize {
        let mut delivered = 0;
        let mut idle = Vec::new();
        for (execution_id, channel) in self.channels_snapshot() {
            let mut channel = lock(&channel);
            delivered += fan_out(&mut channel.subscribers, |sub| {
                Some(Envelope::heartbeat(Some(execution_id), sub.id))
            });
            if channel.idle() {
                idle.push(execution_id);
            }
        }
        for execution_id in idle {
            self.drop_if_idle(execution_id);
        }
        delivered += self.fan_out_global(|sub| Some(Envelope::heartbeat(None, sub.id)));
        delivered
    }

    /// Mark an execution finished.
    ///
    /// Its replay buffer stays available to late joiners until
    /// `retained_executions` executions retired after it. Returns the
    /// executions pushed out of retention by this call, oldest first, so
    /// callers can release their own per-execution state.
    pub fn retire(&self, execution_id: ExecutionId) -> Vec<ExecutionId> {
        let newly_retired = self.with_channel(execution_id, |channel| {
            let newly = channel.retention != Retention::Retained;
            channel.retention = Retention::Retained;
            newly
        });
        if !newly_retired {
            return Vec::new();
        }

        let mut expired = Vec::new();
        {
            let mut retired = lock(&self.inner.retired);
            retired.push_back(execution_id);
            while retired.len() > self.inner.config.retained_executions {
                let Some(oldest) = retired.pop_front() else {
                    break;
                };
                expired.push(oldest);
            }
        }
        for &oldest in &expired {
            if let Some(channel) = self.existing_channel(oldest) {
                let mut channel = lock(&channel);
                if channel.retention == Retention::Retained {
                    channel.retention = Retention::Expired;
                }
            }
            self.drop_if_idle(oldest);
        }
        debug!(execution_id = %execution_id, expired = expired.len(), "execution retired");
        expired
    }

    /// Run [`Hub::heartbeat`] every `interval` until `shutdown` is notified.
    pub fn spawn_heartbeat(&self, interval: Duration, shutdown: Arc<Notify>) -> JoinHandle<()> {
        let hub = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = shutdown.notified() => {
                        info!("heartbeat stopped");
                        return;
                    }
                    _ = ticker.tick() => {
                        let delivered = hub.heartbeat();
                        trace!(delivered, "heartbeat sent");
                    }
                }
            }
        })
    }

    // -----------------------------------------------------------------------
    // Subscriptions
    // -----------------------------------------------------------------------

    /// Register a subscriber.
    ///
    /// A scoped subscription with `replay` set first receives the execution's
    /// buffered records (oldest first, filtered) and a `replay_complete`
    /// marker, synchronously, before any live record.
    pub fn subscribe(&self, filter: SubscriptionFilter, sink: Arc<dyn Sink>) -> SubscriptionHandle {
        let id = SubscriptionId(self.inner.next_id.fetch_add(1, Ordering::Relaxed));
        let scope = filter.scope;

        match scope {
            Scope::Execution(execution_id) => {
                let registered = self.with_channel(execution_id, |channel| {
                    let report = if filter.replay {
                        replay_history(channel, execution_id, id, &filter, &*sink)?
                    } else {
                        ReplayReport::default()
                    };
                    channel.subscribers.push(Subscriber { id, filter, sink });
                    Some(report)
                });
                let Some(report) = registered else {
                    debug!(subscription = %id, execution_id = %execution_id, "sink closed during replay, not registered");
                    self.drop_if_idle(execution_id);
                    return SubscriptionHandle { id, scope };
                };
                if report.dropped > 0 {
                    warn!(
                        subscription = %id,
                        execution_id = %execution_id,
                        replayed = report.replayed,
                        dropped = report.dropped,
                        "replay truncated, subscriber backlog full"
                    );
                }
                debug!(
                    subscription = %id,
                    execution_id = %execution_id,
                    replayed = report.replayed,
                    "subscribed"
                );
            }
            Scope::All => {
                let mut global = lock(&self.inner.global);
                global.push(Subscriber { id, filter, sink });
                self.inner.global_count.store(global.len(), Ordering::Release);
                debug!(subscription = %id, "subscribed to all executions");
            }
        }

        metrics::subscriptions().add(1, &[KeyValue::new("scope", scope.label())]);
        SubscriptionHandle { id, scope }
    }

    /// Subscribe with a bounded channel. Envelopes beyond `buffer` are dropped
    /// for this subscriber while its receiver lags.
    ///
    /// A replaying subscription gets room for a full replay buffer plus its
    /// `replay_complete` marker, whatever `buffer` says.
    pub fn subscribe_channel(
        &self,
        filter: SubscriptionFilter,
        buffer: usize,
    ) -> (SubscriptionHandle, mpsc::Receiver<Envelope>) {
        let buffer = match filter.scope {
            Scope::Execution(_) if filter.replay => {
                buffer.max(self.inner.config.replay_capacity + 1)
            }
            _ => buffer,
        };
        let (tx, rx) = mpsc::channel(buffer.max(1));
        (self.subscribe(filter, Arc::new(tx)), rx)
    }

    /// Subscribe with an unbounded channel. The backlog is the receiver's problem.
    pub fn subscribe_unbounded(
        &self,
        filter: SubscriptionFilter,
    ) -> (SubscriptionHandle, mpsc::UnboundedReceiver<Envelope>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (self.subscribe(filter, Arc::new(tx)), rx)
    }

    /// Revoke one subscription. Returns false if it was already gone.
    pub fn unsubscribe(&self, handle: &SubscriptionHandle) -> bool {
        let removed = match handle.scope {
            Scope::Execution(execution_id) => {
                let removed = match self.existing_channel(execution_id) {
                    Some(channel) => remove_subscriber(&mut lock(&channel).subscribers, handle.id),
                    None => false,
                };
                if removed {
                    self.drop_if_idle(execution_id);
                }
                removed
            }
            Scope::All => {
                let mut global = lock(&self.inner.global);
                let removed = remove_subscriber(&mut global, handle.id);
                self.inner.global_count.store(global.len(), Ordering::Release);
                removed
            }
        };
        if removed {
            debug!(subscription = %handle.id, "unsubscribed");
        }
        removed
    }

    // -----------------------------------------------------------------------
    // Introspection
    // -----------------------------------------------------------------------

    /// Buffered records of one execution, oldest first.
    pub fn buffered(&self, execution_id: ExecutionId) -> Vec<Arc<EventRecord>> {
        self.existing_channel(execution_id)
            .map(|channel| lock(&channel).replay.snapshot())
            .unwrap_or_default()
    }

    pub fn stats(&self) -> HubStats {
        let mut stats = HubStats {
            executions: 0,
            scoped_subscribers: 0,
            global_subscribers: self.inner.global_count.load(Ordering::Acquire),
            buffered_records: 0,
        };
        for (_, channel) in self.channels_snapshot() {
            let channel = lock(&channel);
            stats.executions += 1;
            stats.scoped_subscribers += channel.subscribers.len();
            stats.buffered_records += channel.replay.len();
        }
        stats
    }

    // -----------------------------------------------------------------------
    // Internals
    // -----------------------------------------------------------------------

    /// Run `f` on the execution's live channel, creating it if needed.
    fn with_channel<R>(
        &self,
        execution_id: ExecutionId,
        f: impl FnOnce(&mut ExecutionChannel) -> R,
    ) -> R {
        loop {
            let channel = self.channel(execution_id);
            let mut channel = lock(&channel);
            if channel.removed {
                continue;
            }
            return f(&mut channel);
        }
    }

    /// Remove a channel nobody needs any more. Takes the map lock first, then
    /// the channel lock; callers must not hold a channel lock.
    fn drop_if_idle(&self, execution_id: ExecutionId) {
        let mut channels = self
            .inner
            .channels
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        let Some(channel) = channels.get(&execution_id).cloned() else {
            return;
        };
        let mut channel = lock(&channel);
        if channel.idle() {
            channel.removed = true;
            channels.remove(&execution_id);
            trace!(execution_id = %execution_id, "channel dropped");
        }
    }

    /// Fan out to `All` subscribers, without locking while there are none.
    fn fan_out_global(&self, envelope_for: impl FnMut(&Subscriber) -> Option<Envelope>) -> usize {
        if self.inner.global_count.load(Ordering::Acquire) == 0 {
            return 0;
        }
        let mut global = lock(&self.inner.global);
        let delivered = fan_out(&mut global, envelope_for);
        self.inner.global_count.store(global.len(), Ordering::Release);
        delivered
    }

    fn channel(&self, execution_id: ExecutionId) -> Arc<Mutex<ExecutionChannel>> {
        if let Some(channel) = self.existing_channel(execution_id) {
            return channel;
        }
        let mut channels = self
            .inner
            .channels
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        Arc::clone(channels.entry(execution_id).or_insert_with(|| {
            Arc::new(Mutex::new(ExecutionChannel {
                replay: ReplayBuffer::new(self.inner.config.replay_capacity),
                subscribers: Vec::new(),
                retention: Retention::Active,
                removed: false,
            }))
        }))
    }

    fn existing_channel(&self, execution_id: ExecutionId) -> Option<Arc<Mutex<ExecutionChannel>>> {
        self.inner
            .channels
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&execution_id)
            .cloned()
    }

    fn channels_snapshot(&self) -> Vec<(ExecutionId, Arc<Mutex<ExecutionChannel>>)> {
        self.inner
            .channels
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|(id, channel)| (*id, Arc::clone(channel)))
            .collect()
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Deliver the buffered history matching `filter`, then the end marker.
/// `None` when the sink turned out to be closed.
fn replay_history(
    channel: &ExecutionChannel,
    execution_id: ExecutionId,
    id: SubscriptionId,
    filter: &SubscriptionFilter,
    sink: &dyn Sink,
) -> Option<ReplayReport> {
    let mut report = ReplayReport::default();
    for record in channel.replay.iter() {
        if !filter.matches(record, Topic::of(&record.entry_type)) {
            continue;
        }
        match sink.deliver(Envelope::replay(Arc::clone(record))) {
            Delivery::Sent => report.replayed += 1,
            Delivery::Full => report.dropped += 1,
            Delivery::Closed => return None,
        }
    }
    if report.dropped > 0 {
        metrics::deliveries_dropped().add(
            report.dropped as u64,
            &[KeyValue::new("reason", "replay_full")],
        );
    }
    let marker = Envelope::replay_complete(execution_id, id, report.replayed, report.dropped);
    match sink.deliver(marker) {
        Delivery::Sent => {}
        Delivery::Full => {
            warn!(subscription = %id, "replay_complete marker dropped, subscriber backlog full");
            metrics::deliveries_dropped().add(1, &[KeyValue::new("reason", "replay_full")]);
        }
        Delivery::Closed => return None,
    }
    Some(report)
}

/// Offer an envelope to each subscriber that wants one. Closed sinks are removed.
fn fan_out(
    subscribers: &mut Vec<Subscriber>,
    mut envelope_for: impl FnMut(&Subscriber) -> Option<Envelope>,
) -> usize {
    let mut delivered = 0;
    subscribers.retain(|sub| {
        let Some(envelope) = envelope_for(sub) else {
            return true;
        };
        let kind = envelope.kind;
        match sub.sink.deliver(envelope) {
            Delivery::Sent => {
                delivered += 1;
                metrics::deliveries().add(1, &[KeyValue::new("kind", kind.as_str())]);
                true
            }
            Delivery::Full => {
                debug!(subscription = %sub.id, kind = kind.as_str(), "subscriber backlog full, envelope dropped");
                metrics::deliveries_dropped().add(1, &[KeyValue::new("reason", "full")]);
                true
            }
            Delivery::Closed => {
                debug!(subscription = %sub.id, "subscriber closed, removing");
                metrics::deliveries_dropped().add(1, &[KeyValue::new("reason", "closed")]);
                metrics::subscriptions().add(-1, &[KeyValue::new("scope", sub.filter.scope.label())]);
                false
            }
        }
    });
    delivered
}

fn remove_subscriber(subscribers: &mut Vec<Subscriber>, id: SubscriptionId) -> bool {
    let Some(pos) = subscribers.iter().position(|s| s.id == id) else {
        return false;
    };
    let sub = subscribers.remove(pos);
    metrics::subscriptions().add(-1, &[KeyValue::new("scope", sub.filter.scope.label())]);
    true
}
