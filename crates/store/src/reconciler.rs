//! Per-scope cache reconciler: snapshot, then follow the watch from the
//! snapshot's cursor, publishing an immutable view after every applied event.

use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use arc_swap::ArcSwapOption;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tokio::sync::watch;
use tracing::{debug, info, warn};
use vela_api::{Subscription, WatchTransport};
use vela_core::{Cursor, ReconnectPolicy, ResourceObject, SyncError, WatchEvent, WatchTarget};
use vela_kubehub::FetchClient;

use crate::cache::ViewModel;

/// What consumers of a reconciler observe.
#[derive(Debug, Clone, PartialEq)]
pub enum SyncStatus {
    /// Initial snapshot in flight.
    Loading,
    Live,
    /// Stream failed; a fresh snapshot is scheduled.
    Reconnecting { attempt: u32, error: SyncError },
    /// Terminal until restarted. The last published view stays readable.
    Failed(SyncError),
    Destroyed,
}

impl SyncStatus {
    pub fn is_loading(&self) -> bool {
        matches!(self, SyncStatus::Loading | SyncStatus::Reconnecting { .. })
    }

    pub fn error(&self) -> Option<&SyncError> {
        match self {
            SyncStatus::Reconnecting { error, .. } | SyncStatus::Failed(error) => Some(error),
            _ => None,
        }
    }
}

/// One published, immutable view of the cache.
#[derive(Debug, Clone)]
pub struct Synced<V> {
    pub data: V,
    /// Cursor of the snapshot or of the last applied event.
    pub cursor: Cursor,
    pub epoch: u64,
    pub synced_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Idle,
    Snapshotting,
    Live,
    Failed,
    Destroyed,
}

struct State<V> {
    phase: Phase,
    /// Bumped on every (re)start and on destroy; callbacks carry the value
    /// they were created with and are ignored once it is stale.
    generation: u64,
    working: Option<V>,
    cursor: Cursor,
    epoch: u64,
    subscription: Option<Subscription>,
    attempts: u32,
}

struct Inner<R, V> {
    target: WatchTarget,
    fetch: Arc<dyn FetchClient<R>>,
    transport: Arc<dyn WatchTransport<R>>,
    reconnect: ReconnectPolicy,
    view: ArcSwapOption<Synced<V>>,
    status_tx: watch::Sender<SyncStatus>,
    epoch_tx: watch::Sender<u64>,
    state: Mutex<State<V>>,
}

/// Keeps one cache for one `WatchTarget` in sync. Cheap to clone; clones
/// share state.
pub struct Reconciler<R, V> {
    inner: Arc<Inner<R, V>>,
}

impl<R, V> Clone for Reconciler<R, V> {
    fn clone(&self) -> Self {
        Self { inner: Arc::clone(&self.inner) }
    }
}

impl<R: ResourceObject, V: ViewModel<R>> Reconciler<R, V> {
    pub fn new(
        target: WatchTarget,
        fetch: Arc<dyn FetchClient<R>>,
        transport: Arc<dyn WatchTransport<R>>,
        reconnect: ReconnectPolicy,
    ) -> Self {
        let (status_tx, _) = watch::channel(SyncStatus::Loading);
        let (epoch_tx, _) = watch::channel(0u64);
        Self {
            inner: Arc::new(Inner {
                target,
                fetch,
                transport,
                reconnect,
                view: ArcSwapOption::empty(),
                status_tx,
                epoch_tx,
                state: Mutex::new(State {
                    phase: Phase::Idle,
                    generation: 0,
                    working: None,
                    cursor: Cursor::default(),
                    epoch: 0,
                    subscription: None,
                    attempts: 0,
                }),
            }),
        }
    }

    /// Begin Snapshotting. No-op unless the reconciler is idle.
    pub fn start(&self) {
        self.inner.begin(Phase::Idle);
    }

    /// Start over from a fresh snapshot after a terminal failure. Returns
    /// false (and does nothing) in any other phase.
    pub fn restart(&self) -> bool {
        self.inner.begin(Phase::Failed)
    }

    /// Unsubscribe and discard the cache. Idempotent.
    pub fn destroy(&self) {
        let sub = {
            let mut st = self.inner.state.lock();
            if st.phase == Phase::Destroyed {
                return;
            }
            st.phase = Phase::Destroyed;
            st.generation += 1;
            st.working = None;
            self.inner.view.store(None);
            self.inner.status_tx.send_replace(SyncStatus::Destroyed);
            st.subscription.take()
        };
        if let Some(sub) = sub {
            sub.unsubscribe();
        }
        debug!(target_scope = %self.inner.target, "reconciler: destroyed");
    }

    pub fn target(&self) -> &WatchTarget {
        &self.inner.target
    }

    /// Latest published view; `None` until the first snapshot lands.
    pub fn view(&self) -> Option<Arc<Synced<V>>> {
        self.inner.view.load_full()
    }

    pub fn status(&self) -> SyncStatus {
        self.inner.status_tx.borrow().clone()
    }

    pub fn watch_status(&self) -> watch::Receiver<SyncStatus> {
        self.inner.status_tx.subscribe()
    }

    /// Ticks once per published view.
    pub fn subscribe_epoch(&self) -> watch::Receiver<u64> {
        self.inner.epoch_tx.subscribe()
    }

    pub fn cursor(&self) -> Cursor {
        self.inner.state.lock().cursor.clone()
    }

    pub fn is_live(&self) -> bool {
        self.inner.state.lock().phase == Phase::Live
    }

    pub fn is_destroyed(&self) -> bool {
        self.inner.state.lock().phase == Phase::Destroyed
    }

    pub(crate) fn is_failed(&self) -> bool {
        self.inner.state.lock().phase == Phase::Failed
    }

    pub(crate) fn same(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl<R: ResourceObject, V: ViewModel<R>> Inner<R, V> {
    fn begin(self: &Arc<Self>, from: Phase) -> bool {
        let gen = {
            let mut st = self.state.lock();
            if st.phase != from {
                return false;
            }
            st.phase = Phase::Snapshotting;
            st.generation += 1;
            st.attempts = 0;
            self.status_tx.send_replace(SyncStatus::Loading);
            st.generation
        };
        tokio::spawn(Self::run(Arc::downgrade(self), gen, None));
        true
    }

    async fn run(weak: Weak<Self>, gen: u64, backoff: Option<Duration>) {
        if let Some(d) = backoff {
            tokio::time::sleep(d).await;
        }
        let Some(this) = weak.upgrade() else { return };
        if this.state.lock().generation != gen {
            return;
        }
        let started = Instant::now();
        let loaded = V::load(this.fetch.as_ref(), &this.target).await;
        metrics::histogram!("vela_snapshot_ms", started.elapsed().as_secs_f64() * 1000.0);
        match loaded {
            Ok((data, cursor)) => this.go_live(gen, data, cursor),
            Err(err) => this.fail(gen, err),
        }
    }

    fn go_live(self: &Arc<Self>, gen: u64, data: V, cursor: Cursor) {
        let subscribed = {
            let mut st = self.state.lock();
            if st.generation != gen || st.phase != Phase::Snapshotting {
                debug!(target_scope = %self.target, "reconciler: snapshot discarded");
                return;
            }
            st.cursor = cursor.clone();
            st.epoch += 1;
            self.publish(data.clone(), cursor.clone(), st.epoch);
            st.working = Some(data);

            // Callbacks block on this lock until Live is recorded.
            let on_event = {
                let weak = Arc::downgrade(self);
                move |ev: WatchEvent<R>| {
                    if let Some(this) = weak.upgrade() {
                        this.apply(gen, ev);
                    }
                }
            };
            let on_error = {
                let weak = Arc::downgrade(self);
                move |err: SyncError| {
                    if let Some(this) = weak.upgrade() {
                        this.fail(gen, err);
                    }
                }
            };
            match self.transport.subscribe(self.target.request(cursor.clone()), Box::new(on_event), Box::new(on_error)) {
                Ok(sub) => {
                    st.subscription = Some(sub);
                    st.phase = Phase::Live;
                    st.attempts = 0;
                    self.status_tx.send_replace(SyncStatus::Live);
                    Ok(())
                }
                Err(err) => Err(err),
            }
        };
        match subscribed {
            Ok(()) => info!(target_scope = %self.target, cursor = %cursor, "reconciler: live"),
            Err(err) => self.fail(gen, err),
        }
    }

    fn apply(&self, gen: u64, event: WatchEvent<R>) {
        let mut guard = self.state.lock();
        let st = &mut *guard;
        if st.generation != gen || st.phase != Phase::Live {
            return;
        }
        let Some(working) = st.working.as_mut() else { return };
        let rv = event.resource.resource_version().map(Cursor::new);
        let event_type = event.event_type;
        if let Err(err) = working.apply(event) {
            warn!(target_scope = %self.target, %event_type, error = %err, "reconciler: skipping event");
            metrics::counter!("vela_events_skipped_total", 1u64);
            return;
        }
        if let Some(rv) = rv {
            st.cursor = rv;
        }
        st.epoch += 1;
        self.publish(working.clone(), st.cursor.clone(), st.epoch);
        metrics::counter!("vela_events_applied_total", 1u64);
    }

    fn fail(self: &Arc<Self>, gen: u64, err: SyncError) {
        let sub = {
            let mut st = self.state.lock();
            if st.generation != gen || matches!(st.phase, Phase::Failed | Phase::Destroyed) {
                return;
            }
            let sub = st.subscription.take();
            // A snapshot failure while reconnecting keeps the retry loop going.
            let retryable = err.is_stream_failure() || (matches!(err, SyncError::Snapshot(_)) && st.attempts > 0);
            let attempt = st.attempts + 1;
            let status = if retryable && self.reconnect.allows(attempt) {
                st.attempts = attempt;
                st.generation += 1;
                st.phase = Phase::Snapshotting;
                st.working = None;
                let delay = self.reconnect.delay(attempt);
                tokio::spawn(Self::run(Arc::downgrade(self), st.generation, Some(delay)));
                metrics::counter!("vela_reconnect_total", 1u64);
                warn!(target_scope = %self.target, attempt, delay_ms = delay.as_millis() as u64, error = %err, "reconciler: reconnecting");
                SyncStatus::Reconnecting { attempt, error: err }
            } else {
                st.phase = Phase::Failed;
                st.working = None;
                warn!(target_scope = %self.target, error = %err, "reconciler: failed");
                SyncStatus::Failed(err)
            };
            self.status_tx.send_replace(status);
            sub
        };
        if let Some(sub) = sub {
            sub.unsubscribe();
        }
    }

    fn publish(&self, data: V, cursor: Cursor, epoch: u64) {
        self.view.store(Some(Arc::new(Synced { data, cursor, epoch, synced_at: Utc::now() })));
        self.epoch_tx.send_replace(epoch);
    }
}
