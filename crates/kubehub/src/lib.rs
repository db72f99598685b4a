//! Vela kubehub: cluster clients and the watch-to-pull adapter.

#![forbid(unsafe_code)]

use std::sync::Arc;

use vela_core::{ItemSnapshot, ListSnapshot, ResourceKind, SyncError, SyncResult, WatchEvent, WatchEventType, WatchRequest};

pub mod adapter;
pub mod cluster;
pub mod mock;
pub mod queue;

pub use adapter::{WatchCanceller, WatchStream};
pub use cluster::{ClusterContext, KubeClient};
pub use queue::{EventQueue, QueueItem, Wait};

/// Producer side of one watch: the callbacks a watch client reports into.
/// Cheap to clone; never blocks.
pub struct WatchSink<R> {
    queue: Arc<EventQueue<WatchEvent<R>>>,
}

impl<R> Clone for WatchSink<R> {
    fn clone(&self) -> Self {
        Self { queue: Arc::clone(&self.queue) }
    }
}

impl<R> WatchSink<R> {
    pub fn new(queue: Arc<EventQueue<WatchEvent<R>>>) -> Self {
        Self { queue }
    }

    pub fn event(&self, event_type: WatchEventType, resource: R) {
        self.queue.emit(WatchEvent::new(event_type, resource));
    }

    pub fn error(&self, err: SyncError) {
        self.queue.emit_error(err);
    }

    /// True once the consuming side has gone away; producers may stop early.
    pub fn is_closed(&self) -> bool {
        self.queue.is_aborted()
    }
}

/// Handle to one open watch connection. Closing is idempotent and also
/// happens on drop.
pub struct ConnectionHandle {
    close: Option<Box<dyn FnOnce() + Send>>,
}

impl ConnectionHandle {
    pub fn new(close: impl FnOnce() + Send + 'static) -> Self {
        Self { close: Some(Box::new(close)) }
    }

    /// Close by aborting the task that drives the connection.
    pub fn from_task(task: tokio::task::JoinHandle<()>) -> Self {
        Self::new(move || task.abort())
    }

    pub fn close(&mut self) {
        if let Some(f) = self.close.take() {
            metrics::counter!("vela_watch_closed_total", 1u64);
            f();
        }
    }

    pub fn is_closed(&self) -> bool {
        self.close.is_none()
    }
}

impl Drop for ConnectionHandle {
    fn drop(&mut self) {
        self.close();
    }
}

/// Watch-capable client. Opens the connection immediately and reports every
/// notification into `sink` until the returned handle is closed.
pub trait WatchClient<R>: Send + Sync {
    fn watch(&self, request: &WatchRequest, sink: WatchSink<R>) -> SyncResult<ConnectionHandle>;
}

/// One-shot reads used to seed caches and cursors.
#[async_trait::async_trait]
pub trait FetchClient<R>: Send + Sync {
    async fn list(
        &self,
        kind: &ResourceKind,
        namespace: Option<&str>,
        label_selector: Option<&str>,
    ) -> SyncResult<ListSnapshot<R>>;

    async fn get(&self, kind: &ResourceKind, namespace: Option<&str>, name: &str) -> SyncResult<ItemSnapshot<R>>;
}
