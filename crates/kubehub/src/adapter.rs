//! Watch Stream Adapter: one watch call exposed as a cancellable pull sequence.

use std::sync::Arc;

use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};
use vela_core::{Cursor, QueueLimits, ResourceObject, SyncError, SyncResult, WatchEvent, WatchRequest};

use crate::queue::{EventQueue, QueueItem, Wait};
use crate::{ConnectionHandle, WatchClient, WatchSink};

struct Shared<R> {
    queue: Arc<EventQueue<WatchEvent<R>>>,
    token: CancellationToken,
    connection: Mutex<Option<ConnectionHandle>>,
}

impl<R> Shared<R> {
    fn close_connection(&self) {
        let conn = self.connection.lock().take();
        if let Some(mut conn) = conn {
            conn.close();
        }
    }
}

/// Cancels a `WatchStream` from outside its pull loop: closes the connection,
/// aborts the queue and releases a pending `next()`. Idempotent.
pub struct WatchCanceller<R> {
    shared: Arc<Shared<R>>,
}

impl<R> Clone for WatchCanceller<R> {
    fn clone(&self) -> Self {
        Self { shared: Arc::clone(&self.shared) }
    }
}

impl<R> WatchCanceller<R> {
    pub fn cancel(&self) {
        self.shared.token.cancel();
        self.shared.queue.abort();
        self.shared.close_connection();
    }

    pub fn is_cancelled(&self) -> bool {
        self.shared.token.is_cancelled()
    }

    pub async fn cancelled(&self) {
        self.shared.token.cancelled().await
    }
}

pub struct WatchStream<R> {
    shared: Arc<Shared<R>>,
    cursor: Cursor,
    label: String,
    finished: bool,
}

impl<R: ResourceObject> WatchStream<R> {
    /// Open the underlying watch at `request.cursor`. Fails only if the client
    /// refuses to open the connection.
    pub fn open<C>(client: &C, request: &WatchRequest, limits: QueueLimits) -> SyncResult<Self>
    where
        C: WatchClient<R> + ?Sized,
    {
        let queue = Arc::new(EventQueue::new(limits));
        let connection = client.watch(request, WatchSink::new(Arc::clone(&queue)))?;
        let label = format!("{}|{}", request.kind.key(), request.namespace.as_deref().unwrap_or(""));
        info!(target_key = %label, cursor = %request.cursor, "adapter: watch opened");
        metrics::counter!("vela_watch_opened_total", 1u64);
        Ok(Self {
            shared: Arc::new(Shared { queue, token: CancellationToken::new(), connection: Mutex::new(Some(connection)) }),
            cursor: request.cursor.clone(),
            label,
            finished: false,
        })
    }

    pub fn canceller(&self) -> WatchCanceller<R> {
        WatchCanceller { shared: Arc::clone(&self.shared) }
    }

    /// Cursor of the most recently yielded event (or the opening cursor).
    pub fn cursor(&self) -> &Cursor {
        &self.cursor
    }

    /// Next event; `Some(Err(_))` once on a connection failure, then `None`.
    /// `None` also after cancellation.
    pub async fn next(&mut self) -> Option<SyncResult<WatchEvent<R>>> {
        if self.finished {
            return None;
        }
        match self.shared.queue.wait_for_next(&self.shared.token).await {
            Wait::Ready => match self.shared.queue.shift() {
                Some(QueueItem::Event(ev)) => {
                    if let Some(rv) = ev.resource.resource_version() {
                        self.cursor = Cursor::new(rv);
                    }
                    Some(Ok(ev))
                }
                Some(QueueItem::Error(err)) => {
                    self.fail(&err);
                    Some(Err(err))
                }
                None => {
                    self.finished = true;
                    None
                }
            },
            Wait::Aborted | Wait::Cancelled => {
                debug!(target_key = %self.label, "adapter: pull ended by cancellation");
                self.finished = true;
                None
            }
        }
    }

    fn fail(&mut self, err: &SyncError) {
        info!(target_key = %self.label, error = %err, cursor = %self.cursor, "adapter: watch failed");
        self.finished = true;
        self.shared.queue.abort();
        self.shared.close_connection();
    }
}

impl<R> Drop for WatchStream<R> {
    fn drop(&mut self) {
        self.shared.token.cancel();
        self.shared.queue.abort();
        self.shared.close_connection();
    }
}
