//! Vela subscription API.
//!
//! This crate turns watch streams into push subscriptions: in-process
//! (`AdapterTransport`) or across the RPC boundary (`WatchService` on the
//! server, `RpcTransport` on the client). Cache layers depend only on the
//! `WatchTransport` trait.

#![forbid(unsafe_code)]

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use vela_core::{Cursor, SyncError, SyncResult, WatchEvent, WatchRequest};

pub mod rpc;
pub mod transport;

pub use rpc::{RpcTransport, SubscribeReply, WatchProcedures, WatchService, WireMessage};
pub use transport::AdapterTransport;

/// Called for each event, in order.
pub type EventFn<R> = Box<dyn FnMut(WatchEvent<R>) + Send>;
/// Called at most once, on the first error; no events follow it.
pub type ErrorFn = Box<dyn FnOnce(SyncError) + Send>;

/// Push-style subscription over a watch.
pub trait WatchTransport<R>: Send + Sync {
    /// Open exactly one underlying watch at `request.cursor` and start
    /// delivering. Nothing is opened before this call.
    fn subscribe(&self, request: WatchRequest, on_event: EventFn<R>, on_error: ErrorFn) -> SyncResult<Subscription>;
}

/// One open transport channel. Unsubscribing cancels the underlying watch
/// immediately; it is idempotent and also runs on drop.
pub struct Subscription {
    cursor: Cursor,
    live: Arc<AtomicBool>,
    cancel: Mutex<Option<Box<dyn FnOnce() + Send>>>,
}

impl Subscription {
    pub fn new(cursor: Cursor, live: Arc<AtomicBool>, cancel: impl FnOnce() + Send + 'static) -> Self {
        Self { cursor, live, cancel: Mutex::new(Some(Box::new(cancel))) }
    }

    pub fn unsubscribe(&self) {
        let cancel = self.cancel.lock().take();
        if let Some(f) = cancel {
            self.live.store(false, Ordering::SeqCst);
            f();
        }
    }

    /// False after unsubscribe or once the delivery loop has ended.
    pub fn is_live(&self) -> bool {
        self.live.load(Ordering::SeqCst)
    }

    /// Cursor the subscription was opened with.
    pub fn cursor(&self) -> &Cursor {
        &self.cursor
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.unsubscribe();
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription").field("cursor", &self.cursor).field("live", &self.is_live()).finish()
    }
}
