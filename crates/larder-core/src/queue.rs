// ABOUTME: Debounced, entity-coalescing autosave queue with retry/backoff and online awareness.
// ABOUTME: WriteQueue owns its pending state, timers, and connectivity listener; dispose() tears them down.

use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio::runtime::Handle;
use tokio::sync::Notify;
use tokio::task::JoinHandle;

use crate::connectivity::Connectivity;
use crate::operation::Operation;
use crate::retry::RetryPolicy;

/// Error type returned by persistence functions.
pub type PersistError = Box<dyn std::error::Error + Send + Sync>;

/// The bridge the queue drives: receives one ordered batch per flush and
/// either commits all of it or fails.
#[async_trait]
pub trait PersistBatch: Send + Sync {
    async fn persist(&self, batch: Vec<Operation>) -> Result<(), PersistError>;
}

/// Adapter turning an async closure into a `PersistBatch`.
pub struct PersistFn<F>(F);

/// Wrap an async closure as a persistence function.
pub fn persist_fn<F, Fut>(f: F) -> PersistFn<F>
where
    F: Fn(Vec<Operation>) -> Fut + Send + Sync,
    Fut: Future<Output = Result<(), PersistError>> + Send + 'static,
{
    PersistFn(f)
}

#[async_trait]
impl<F, Fut> PersistBatch for PersistFn<F>
where
    F: Fn(Vec<Operation>) -> Fut + Send + Sync,
    Fut: Future<Output = Result<(), PersistError>> + Send + 'static,
{
    async fn persist(&self, batch: Vec<Operation>) -> Result<(), PersistError> {
        (self.0)(batch).await
    }
}

/// Errors surfaced by an explicit `flush()`. Timer-driven flushes only log.
#[derive(Debug, Error)]
pub enum AutosaveError {
    #[error("host is offline; {pending} operation(s) remain queued")]
    Offline { pending: usize },

    #[error("write queue has been disposed")]
    Disposed,

    #[error("flush attempt {attempt} failed: {source}")]
    TransactionFailed {
        attempt: u32,
        #[source]
        source: PersistError,
    },

    #[error("dropped {dropped} operation(s) after {attempts} failed attempts: {source}")]
    RetriesExhausted {
        attempts: u32,
        dropped: usize,
        #[source]
        source: PersistError,
    },
}

/// Timing knobs for the autosave pipeline.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AutosaveConfig {
    pub debounce: Duration,
    pub retry: RetryPolicy,
}

impl Default for AutosaveConfig {
    fn default() -> Self {
        Self {
            debounce: Duration::from_millis(400),
            retry: RetryPolicy::default(),
        }
    }
}

struct Pending {
    seq: u64,
    op: Operation,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TimerPurpose {
    Debounce,
    Backoff,
}

struct Timer {
    epoch: u64,
    purpose: TimerPurpose,
    handle: JoinHandle<()>,
}

/// What one flush attempt snapshotted, so only those operations get cleared.
struct Snapshot {
    keyed: Vec<(String, u64)>,
    general: usize,
    ops: Vec<Operation>,
}

#[derive(Default)]
struct QueueState {
    order: Vec<String>,
    keyed: HashMap<String, Pending>,
    general: VecDeque<Pending>,
    next_seq: u64,
    next_epoch: u64,
    in_flight: bool,
    failures: u32,
    timer: Option<Timer>,
    disposed: bool,
}

impl QueueState {
    fn len(&self) -> usize {
        self.keyed.len() + self.general.len()
    }

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn insert(&mut self, op: Operation) {
        self.next_seq += 1;
        let pending = Pending {
            seq: self.next_seq,
            op,
        };
        match pending.op.entity_id.clone() {
            Some(id) => {
                // Re-queued ids move to the end of the order.
                self.order.retain(|queued| queued != &id);
                self.order.push(id.clone());
                self.keyed.insert(id, pending);
            }
            None => self.general.push_back(pending),
        }
    }

    fn snapshot(&self) -> Snapshot {
        let mut keyed = Vec::with_capacity(self.order.len());
        let mut ops = Vec::with_capacity(self.len());
        for id in &self.order {
            if let Some(pending) = self.keyed.get(id) {
                keyed.push((id.clone(), pending.seq));
                ops.push(pending.op.clone());
            }
        }
        ops.extend(self.general.iter().map(|pending| pending.op.clone()));
        Snapshot {
            keyed,
            general: self.general.len(),
            ops,
        }
    }

    /// Remove exactly the snapshotted operations; anything queued or
    /// replaced since the snapshot stays.
    fn clear_snapshot(&mut self, keyed: &[(String, u64)], general: usize) {
        for (id, seq) in keyed {
            if self.keyed.get(id).is_some_and(|pending| pending.seq == *seq) {
                self.keyed.remove(id);
                self.order.retain(|queued| queued != id);
            }
        }
        let general = general.min(self.general.len());
        self.general.drain(..general);
    }

    fn clear_all(&mut self) {
        self.order.clear();
        self.keyed.clear();
        self.general.clear();
    }

    fn cancel_timer(&mut self) {
        if let Some(timer) = self.timer.take() {
            timer.handle.abort();
        }
    }

    fn backoff_pending(&self) -> bool {
        self.timer
            .as_ref()
            .is_some_and(|timer| timer.purpose == TimerPurpose::Backoff)
    }
}

/// Result of one pass through the retry scheduler.
enum Attempt {
    Flushed,
    Idle,
    Busy,
    Offline(usize),
}

struct Inner {
    state: Mutex<QueueState>,
    config: AutosaveConfig,
    connectivity: Arc<dyn Connectivity>,
    persist: Arc<dyn PersistBatch>,
    runtime: Handle,
    idle: Notify,
}

impl Inner {
    fn lock(&self) -> MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Replace any pending timer with one that fires an attempt after `delay`.
    fn schedule(self: &Arc<Self>, state: &mut QueueState, delay: Duration, purpose: TimerPurpose) {
        state.cancel_timer();
        state.next_epoch += 1;
        let epoch = state.next_epoch;
        let inner = Arc::clone(self);

        let handle = self.runtime.spawn(async move {
            tokio::time::sleep(delay).await;
            {
                let mut state = inner.lock();
                match &state.timer {
                    Some(timer) if timer.epoch == epoch => state.timer = None,
                    _ => return,
                }
            }
            // Failures are logged inside; nothing to propagate from a timer.
            let _ = inner.attempt_flush().await;
        });

        tracing::debug!(?purpose, delay_ms = delay.as_millis() as u64, "autosave flush scheduled");
        state.timer = Some(Timer {
            epoch,
            purpose,
            handle,
        });
    }

    fn on_online(self: &Arc<Self>) {
        let mut state = self.lock();
        if state.disposed || state.in_flight || state.is_empty() {
            return;
        }
        tracing::info!(pending = state.len(), "back online, flushing autosave queue");
        self.schedule(&mut state, Duration::ZERO, TimerPurpose::Debounce);
    }

    async fn attempt_flush(self: &Arc<Self>) -> Result<Attempt, AutosaveError> {
        let Snapshot { keyed, general, ops } = {
            let mut state = self.lock();
            if state.disposed {
                return Err(AutosaveError::Disposed);
            }
            if state.in_flight {
                return Ok(Attempt::Busy);
            }
            if state.is_empty() {
                return Ok(Attempt::Idle);
            }
            if !self.connectivity.is_online() {
                return Ok(Attempt::Offline(state.len()));
            }
            state.in_flight = true;
            state.snapshot()
        };

        let count = ops.len();
        tracing::debug!(count, "flushing autosave batch");
        let result = self.persist.persist(ops).await;

        let outcome = {
            let mut state = self.lock();
            state.in_flight = false;
            if state.disposed {
                Err(AutosaveError::Disposed)
            } else {
                self.settle(&mut state, result, &keyed, general, count)
            }
        };
        self.idle.notify_waiters();
        outcome
    }

    fn settle(
        self: &Arc<Self>,
        state: &mut QueueState,
        result: Result<(), PersistError>,
        keyed: &[(String, u64)],
        general: usize,
        count: usize,
    ) -> Result<Attempt, AutosaveError> {
        match result {
            Ok(()) => {
                state.failures = 0;
                state.clear_snapshot(keyed, general);
                tracing::debug!(count, remaining = state.len(), "autosave batch committed");
                self.schedule_remaining(state);
                Ok(Attempt::Flushed)
            }
            Err(source) => {
                state.failures += 1;
                let attempts = state.failures;
                let policy = &self.config.retry;

                if policy.exhausted(attempts) {
                    state.clear_snapshot(keyed, general);
                    state.failures = 0;
                    tracing::error!(
                        attempts,
                        dropped = count,
                        error = %source,
                        "autosave batch dropped after retry ceiling"
                    );
                    self.schedule_remaining(state);
                    return Err(AutosaveError::RetriesExhausted {
                        attempts,
                        dropped: count,
                        source,
                    });
                }

                let delay = policy.delay_for(attempts, policy.sample_jitter());
                tracing::warn!(
                    attempt = attempts,
                    retry_in_ms = delay.as_millis() as u64,
                    error = %source,
                    "autosave flush failed, retrying"
                );
                self.schedule(state, delay, TimerPurpose::Backoff);
                Err(AutosaveError::TransactionFailed {
                    attempt: attempts,
                    source,
                })
            }
        }
    }

    fn schedule_remaining(self: &Arc<Self>, state: &mut QueueState) {
        if !state.is_empty() && self.connectivity.is_online() {
            self.schedule(state, self.config.debounce, TimerPurpose::Debounce);
        }
    }
}

/// An autosave write queue. Operations for the same entity coalesce to the
/// latest one; flushes are debounced, retried with backoff, and held while
/// the host is offline.
///
/// Must be created inside a tokio runtime. Dropping the queue disposes it.
pub struct WriteQueue {
    inner: Arc<Inner>,
    listener: Mutex<Option<JoinHandle<()>>>,
}

impl WriteQueue {
    pub fn new(
        config: AutosaveConfig,
        connectivity: Arc<dyn Connectivity>,
        persist: Arc<dyn PersistBatch>,
    ) -> Self {
        let runtime = Handle::current();
        let mut online_rx = connectivity.subscribe();
        let inner = Arc::new(Inner {
            state: Mutex::new(QueueState::default()),
            config,
            connectivity,
            persist,
            runtime: runtime.clone(),
            idle: Notify::new(),
        });

        let listener_inner = Arc::clone(&inner);
        let listener = runtime.spawn(async move {
            while online_rx.changed().await.is_ok() {
                let online = *online_rx.borrow_and_update();
                if online {
                    listener_inner.on_online();
                }
            }
        });

        Self {
            inner,
            listener: Mutex::new(Some(listener)),
        }
    }

    /// Queue an operation. Never blocks; a no-op after `dispose()`.
    pub fn queue(&self, op: Operation) {
        let mut state = self.inner.lock();
        if state.disposed {
            tracing::debug!("write queue disposed, ignoring operation");
            return;
        }
        state.insert(op);

        if !self.inner.connectivity.is_online() {
            tracing::debug!(pending = state.len(), "offline, holding operation");
            return;
        }
        // In-flight flushes reschedule on completion; a pending backoff is
        // not shortened by new input.
        if state.in_flight || state.backoff_pending() {
            return;
        }
        self.inner
            .schedule(&mut state, self.inner.config.debounce, TimerPurpose::Debounce);
    }

    /// Cancel the debounce timer and deliver pending operations now. Waits
    /// for an in-flight flush first. Unlike timer-driven flushes, failures
    /// are returned to the caller.
    pub async fn flush(&self) -> Result<(), AutosaveError> {
        loop {
            let notified = self.inner.idle.notified();
            {
                let mut state = self.inner.lock();
                if state.disposed {
                    return Err(AutosaveError::Disposed);
                }
                state.cancel_timer();
                if !state.in_flight {
                    if state.is_empty() {
                        return Ok(());
                    }
                    if !self.inner.connectivity.is_online() {
                        return Err(AutosaveError::Offline {
                            pending: state.len(),
                        });
                    }
                }
            }

            match self.inner.attempt_flush().await? {
                Attempt::Busy => notified.await,
                Attempt::Flushed | Attempt::Idle => return Ok(()),
                Attempt::Offline(pending) => return Err(AutosaveError::Offline { pending }),
            }
        }
    }

    /// Cancel timers, drop pending operations, and detach the connectivity
    /// listener. An in-flight flush finishes but its result is discarded.
    pub fn dispose(&self) {
        let dropped = {
            let mut state = self.inner.lock();
            if state.disposed {
                return;
            }
            state.disposed = true;
            state.cancel_timer();
            let dropped = state.len();
            state.clear_all();
            dropped
        };

        if let Some(listener) = self
            .listener
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            listener.abort();
        }
        self.inner.idle.notify_waiters();
        tracing::info!(dropped, "write queue disposed");
    }

    /// Number of operations waiting to be flushed.
    pub fn pending_len(&self) -> usize {
        self.inner.lock().len()
    }

    pub fn is_disposed(&self) -> bool {
        self.inner.lock().disposed
    }
}

impl Drop for WriteQueue {
    fn drop(&mut self) {
        self.dispose();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connectivity::ConnectivityMonitor;
    use serde_json::json;
    use tokio::time::{Instant, sleep};

    type BatchLog = Arc<Mutex<Vec<(Instant, Vec<Operation>)>>>;

    fn test_config() -> AutosaveConfig {
        AutosaveConfig {
            debounce: Duration::from_millis(400),
            retry: RetryPolicy {
                max_retries: 5,
                base_delay: Duration::from_secs(1),
                max_jitter: Duration::from_millis(250),
                max_delay: Duration::from_secs(60),
            },
        }
    }

    /// A persistence function that records every batch and then succeeds or
    /// fails, optionally after a simulated write latency.
    fn recorder(fail: bool, latency: Duration) -> (BatchLog, Arc<dyn PersistBatch>) {
        let log: BatchLog = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&log);
        let persist = persist_fn(move |batch: Vec<Operation>| {
            let sink = Arc::clone(&sink);
            async move {
                sink.lock().unwrap().push((Instant::now(), batch));
                if !latency.is_zero() {
                    sleep(latency).await;
                }
                if fail {
                    Err::<(), PersistError>("disk full".into())
                } else {
                    Ok(())
                }
            }
        });
        (log, Arc::new(persist))
    }

    fn ids(batch: &[Operation]) -> Vec<Option<&str>> {
        batch.iter().map(|op| op.entity_id.as_deref()).collect()
    }

    #[tokio::test(start_paused = true)]
    async fn coalesces_to_latest_payload() {
        let (log, persist) = recorder(false, Duration::ZERO);
        let queue = WriteQueue::new(test_config(), Arc::new(ConnectivityMonitor::online()), persist);

        queue.queue(Operation::upsert("profiles", "u1", json!({"name": "Ana"})));
        queue.queue(Operation::upsert("profiles", "u1", json!({"name": "Ana Souza"})));
        assert_eq!(queue.pending_len(), 1);

        sleep(Duration::from_secs(1)).await;

        let log = log.lock().unwrap();
        assert_eq!(log.len(), 1);
        assert_eq!(log[0].1.len(), 1);
        assert_eq!(log[0].1[0].payload, json!({"name": "Ana Souza"}));
        assert_eq!(queue.pending_len(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn flush_orders_keyed_then_general() {
        let (log, persist) = recorder(false, Duration::ZERO);
        let queue = WriteQueue::new(test_config(), Arc::new(ConnectivityMonitor::online()), persist);

        queue.queue(Operation::upsert("profiles", "A", json!({"v": 1})));
        queue.queue(Operation::upsert_unkeyed("projects", json!({"name": "g1"})));
        queue.queue(Operation::upsert("profiles", "B", json!({"v": 1})));
        queue.queue(Operation::upsert_unkeyed("projects", json!({"name": "g2"})));
        queue.queue(Operation::upsert("profiles", "A", json!({"v": 2})));

        queue.flush().await.unwrap();

        let log = log.lock().unwrap();
        assert_eq!(log.len(), 1);
        let batch = &log[0].1;
        assert_eq!(ids(batch), vec![Some("B"), Some("A"), None, None]);
        assert_eq!(batch[1].payload, json!({"v": 2}));
        assert_eq!(batch[2].payload["name"], "g1");
        assert_eq!(batch[3].payload["name"], "g2");
    }

    #[tokio::test(start_paused = true)]
    async fn debounce_restarts_on_each_queue() {
        let (log, persist) = recorder(false, Duration::ZERO);
        let queue = WriteQueue::new(test_config(), Arc::new(ConnectivityMonitor::online()), persist);

        queue.queue(Operation::upsert("settings", "theme", json!({"value": "dark"})));
        sleep(Duration::from_millis(300)).await;
        queue.queue(Operation::upsert("settings", "locale", json!({"value": "pt"})));
        sleep(Duration::from_millis(300)).await;
        assert!(log.lock().unwrap().is_empty(), "debounce should have restarted");

        sleep(Duration::from_millis(150)).await;
        let log = log.lock().unwrap();
        assert_eq!(log.len(), 1);
        assert_eq!(log[0].1.len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn failing_persist_stops_after_max_retries() {
        let (log, persist) = recorder(true, Duration::ZERO);
        let queue = WriteQueue::new(test_config(), Arc::new(ConnectivityMonitor::online()), persist);

        queue.queue(Operation::upsert("profiles", "u1", json!({"name": "Ana"})));
        sleep(Duration::from_secs(120)).await;

        {
            let log = log.lock().unwrap();
            assert_eq!(log.len(), 5);
            let gaps: Vec<Duration> = log.windows(2).map(|w| w[1].0 - w[0].0).collect();
            for pair in gaps.windows(2) {
                assert!(pair[1] > pair[0], "delays should grow: {:?}", gaps);
            }
            assert!(gaps[0] >= Duration::from_secs(1));
        }
        assert_eq!(queue.pending_len(), 0);

        sleep(Duration::from_secs(600)).await;
        assert_eq!(log.lock().unwrap().len(), 5, "no attempts after the ceiling");
    }

    #[tokio::test(start_paused = true)]
    async fn offline_holds_until_reconnect() {
        let (log, persist) = recorder(false, Duration::ZERO);
        let monitor = Arc::new(ConnectivityMonitor::offline());
        let queue = WriteQueue::new(test_config(), monitor.clone(), persist);

        queue.queue(Operation::upsert("profiles", "u1", json!({"name": "Ana"})));
        sleep(Duration::from_secs(5)).await;
        assert!(log.lock().unwrap().is_empty());
        assert_eq!(queue.pending_len(), 1);

        monitor.set_online(true);
        sleep(Duration::from_millis(10)).await;
        assert_eq!(log.lock().unwrap().len(), 1);

        sleep(Duration::from_secs(5)).await;
        assert_eq!(log.lock().unwrap().len(), 1);
        assert_eq!(queue.pending_len(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn reconnect_with_empty_queue_does_nothing() {
        let (log, persist) = recorder(false, Duration::ZERO);
        let monitor = Arc::new(ConnectivityMonitor::offline());
        let _queue = WriteQueue::new(test_config(), monitor.clone(), persist);

        monitor.set_online(true);
        sleep(Duration::from_secs(1)).await;
        assert!(log.lock().unwrap().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn operations_queued_mid_flight_survive_for_next_round() {
        let (log, persist) = recorder(false, Duration::from_secs(1));
        let queue = WriteQueue::new(test_config(), Arc::new(ConnectivityMonitor::online()), persist);

        queue.queue(Operation::upsert("profiles", "u1", json!({"v": 1})));
        // Debounce fires at 400ms; the write is in flight until 1400ms.
        sleep(Duration::from_millis(500)).await;
        queue.queue(Operation::upsert("profiles", "u1", json!({"v": 2})));
        queue.queue(Operation::upsert("profiles", "u2", json!({"v": 1})));

        sleep(Duration::from_secs(5)).await;

        let log = log.lock().unwrap();
        assert_eq!(log.len(), 2);
        assert_eq!(log[0].1[0].payload, json!({"v": 1}));
        assert_eq!(ids(&log[1].1), vec![Some("u1"), Some("u2")]);
        assert_eq!(log[1].1[0].payload, json!({"v": 2}));
        assert_eq!(queue.pending_len(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn explicit_flush_propagates_failures() {
        let (_log, persist) = recorder(true, Duration::ZERO);
        let queue = WriteQueue::new(test_config(), Arc::new(ConnectivityMonitor::online()), persist);

        queue.queue(Operation::upsert("profiles", "u1", json!({})));
        let err = queue.flush().await.unwrap_err();
        assert!(
            matches!(err, AutosaveError::TransactionFailed { attempt: 1, .. }),
            "expected TransactionFailed, got: {}",
            err
        );
        assert_eq!(queue.pending_len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn explicit_flush_reports_dropped_batch_at_ceiling() {
        let (_log, persist) = recorder(true, Duration::ZERO);
        let mut config = test_config();
        config.retry.max_retries = 1;
        let queue = WriteQueue::new(config, Arc::new(ConnectivityMonitor::online()), persist);

        queue.queue(Operation::upsert("profiles", "u1", json!({})));
        let err = queue.flush().await.unwrap_err();
        assert!(
            matches!(err, AutosaveError::RetriesExhausted { attempts: 1, dropped: 1, .. }),
            "expected RetriesExhausted, got: {}",
            err
        );
        assert_eq!(queue.pending_len(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn flush_while_offline_reports_pending() {
        let (log, persist) = recorder(false, Duration::ZERO);
        let queue = WriteQueue::new(test_config(), Arc::new(ConnectivityMonitor::offline()), persist);

        queue.queue(Operation::delete("profiles", "u1"));
        let err = queue.flush().await.unwrap_err();
        assert!(matches!(err, AutosaveError::Offline { pending: 1 }));
        assert!(log.lock().unwrap().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn flush_on_empty_queue_is_ok() {
        let (log, persist) = recorder(false, Duration::ZERO);
        let queue = WriteQueue::new(test_config(), Arc::new(ConnectivityMonitor::online()), persist);
        queue.flush().await.unwrap();
        assert!(log.lock().unwrap().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn dispose_drops_pending_and_ignores_new_work() {
        let (log, persist) = recorder(false, Duration::ZERO);
        let queue = WriteQueue::new(test_config(), Arc::new(ConnectivityMonitor::online()), persist);

        queue.queue(Operation::upsert("profiles", "u1", json!({})));
        queue.dispose();
        queue.queue(Operation::upsert("profiles", "u2", json!({})));

        sleep(Duration::from_secs(5)).await;
        assert!(log.lock().unwrap().is_empty());
        assert_eq!(queue.pending_len(), 0);
        assert!(queue.is_disposed());
        assert!(matches!(queue.flush().await, Err(AutosaveError::Disposed)));
    }

    #[tokio::test(start_paused = true)]
    async fn dispose_mid_flight_discards_result_and_stops_retries() {
        let (log, persist) = recorder(true, Duration::from_secs(1));
        let queue = WriteQueue::new(test_config(), Arc::new(ConnectivityMonitor::online()), persist);

        queue.queue(Operation::upsert("profiles", "u1", json!({})));
        sleep(Duration::from_millis(500)).await;
        assert_eq!(log.lock().unwrap().len(), 1, "flush should be in flight");

        queue.dispose();
        sleep(Duration::from_secs(60)).await;
        assert_eq!(log.lock().unwrap().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn new_input_does_not_shorten_backoff() {
        let (log, persist) = recorder(true, Duration::ZERO);
        let mut config = test_config();
        config.retry.max_jitter = Duration::ZERO;
        let queue = WriteQueue::new(config, Arc::new(ConnectivityMonitor::online()), persist);

        queue.queue(Operation::upsert("profiles", "u1", json!({})));
        sleep(Duration::from_millis(450)).await;
        assert_eq!(log.lock().unwrap().len(), 1);

        // Backoff is 1s from the failure at 400ms; new input must not pull
        // the retry forward to a 400ms debounce.
        queue.queue(Operation::upsert("profiles", "u2", json!({})));
        sleep(Duration::from_millis(500)).await;
        assert_eq!(log.lock().unwrap().len(), 1);

        sleep(Duration::from_millis(500)).await;
        let log = log.lock().unwrap();
        assert_eq!(log.len(), 2);
        assert_eq!(ids(&log[1].1), vec![Some("u1"), Some("u2")]);
    }
}
