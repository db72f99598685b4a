//! Reference-counted sharing of reconcilers: one per `WatchTarget`, however
//! many consumers hold a lease on it.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use tokio::sync::watch;
use tracing::debug;
use vela_api::WatchTransport;
use vela_core::{ReconnectPolicy, ResourceObject, SyncError, WatchTarget};
use vela_kubehub::FetchClient;

use crate::cache::ViewModel;
use crate::reconciler::{Reconciler, SyncStatus, Synced};

struct Entry<R, V> {
    refs: usize,
    reconciler: Reconciler<R, V>,
}

struct HubInner<R, V> {
    fetch: Arc<dyn FetchClient<R>>,
    transport: Arc<dyn WatchTransport<R>>,
    reconnect: ReconnectPolicy,
    entries: Mutex<FxHashMap<WatchTarget, Entry<R, V>>>,
}

pub struct SubscriptionHub<R, V> {
    inner: Arc<HubInner<R, V>>,
}

impl<R, V> Clone for SubscriptionHub<R, V> {
    fn clone(&self) -> Self {
        Self { inner: Arc::clone(&self.inner) }
    }
}

impl<R: ResourceObject, V: ViewModel<R>> SubscriptionHub<R, V> {
    pub fn new(
        fetch: Arc<dyn FetchClient<R>>,
        transport: Arc<dyn WatchTransport<R>>,
        reconnect: ReconnectPolicy,
    ) -> Self {
        Self { inner: Arc::new(HubInner { fetch, transport, reconnect, entries: Mutex::new(FxHashMap::default()) }) }
    }

    /// Share the reconciler for `target`, creating and starting it on first
    /// use. A reconciler left `Failed` is restarted from a fresh snapshot.
    /// Must be called within a Tokio runtime.
    pub fn acquire(&self, target: WatchTarget) -> Lease<R, V> {
        let mut entries = self.inner.entries.lock();
        let reconciler = match entries.get_mut(&target) {
            Some(entry) => {
                entry.refs += 1;
                if entry.reconciler.is_failed() && entry.reconciler.restart() {
                    debug!(target_scope = %target, "hub: restarted failed scope");
                }
                debug!(target_scope = %target, refs = entry.refs, "hub: shared");
                entry.reconciler.clone()
            }
            None => {
                let reconciler = Reconciler::new(
                    target.clone(),
                    Arc::clone(&self.inner.fetch),
                    Arc::clone(&self.inner.transport),
                    self.inner.reconnect,
                );
                reconciler.start();
                entries.insert(target.clone(), Entry { refs: 1, reconciler: reconciler.clone() });
                metrics::gauge!("vela_hub_scopes", entries.len() as f64);
                debug!(target_scope = %target, "hub: new scope");
                reconciler
            }
        };
        drop(entries);
        Lease {
            hub: Arc::downgrade(&self.inner),
            target,
            reconciler,
            released: AtomicBool::new(false),
        }
    }

    /// Same as `lease.release()`.
    pub fn release(&self, lease: &Lease<R, V>) {
        lease.release();
    }

    pub fn scopes(&self) -> usize {
        self.inner.entries.lock().len()
    }

    pub fn refs(&self, target: &WatchTarget) -> usize {
        self.inner.entries.lock().get(target).map(|e| e.refs).unwrap_or(0)
    }
}

impl<R: ResourceObject, V: ViewModel<R>> HubInner<R, V> {
    fn release(&self, target: &WatchTarget, reconciler: &Reconciler<R, V>) {
        let mut entries = self.entries.lock();
        let Some(entry) = entries.get_mut(target) else { return };
        // The entry may already belong to a newer reconciler for the same target.
        if !entry.reconciler.same(reconciler) {
            return;
        }
        entry.refs = entry.refs.saturating_sub(1);
        if entry.refs > 0 {
            debug!(target_scope = %target, refs = entry.refs, "hub: released");
            return;
        }
        let removed = entries.remove(target);
        metrics::gauge!("vela_hub_scopes", entries.len() as f64);
        drop(entries);
        if let Some(entry) = removed {
            entry.reconciler.destroy();
            debug!(target_scope = %target, "hub: scope closed");
        }
    }
}

/// A consumer's handle on a shared reconciler. Releasing is idempotent and
/// also happens on drop.
pub struct Lease<R: ResourceObject, V: ViewModel<R>> {
    hub: Weak<HubInner<R, V>>,
    target: WatchTarget,
    reconciler: Reconciler<R, V>,
    released: AtomicBool,
}

impl<R: ResourceObject, V: ViewModel<R>> Lease<R, V> {
    pub fn target(&self) -> &WatchTarget {
        &self.target
    }

    /// Latest published view (read-only).
    pub fn view(&self) -> Option<Arc<Synced<V>>> {
        self.reconciler.view()
    }

    pub fn status(&self) -> SyncStatus {
        self.reconciler.status()
    }

    pub fn is_loading(&self) -> bool {
        self.status().is_loading()
    }

    pub fn error(&self) -> Option<SyncError> {
        self.status().error().cloned()
    }

    pub fn watch_status(&self) -> watch::Receiver<SyncStatus> {
        self.reconciler.watch_status()
    }

    pub fn subscribe_epoch(&self) -> watch::Receiver<u64> {
        self.reconciler.subscribe_epoch()
    }

    pub fn is_released(&self) -> bool {
        self.released.load(Ordering::SeqCst)
    }

    pub fn release(&self) {
        if self.released.swap(true, Ordering::SeqCst) {
            return;
        }
        // Without a hub the reconciler is torn down when its last clone drops.
        if let Some(hub) = self.hub.upgrade() {
            hub.release(&self.target, &self.reconciler);
        }
    }
}

impl<R: ResourceObject, V: ViewModel<R>> Drop for Lease<R, V> {
    fn drop(&mut self) {
        self.release();
    }
}
