//! Callback-to-pull bridge: a FIFO buffer plus a single-waiter wakeup.
//!
//! Producers (`emit`, `emit_error`) never block and may run from synchronous
//! callback context. One consumer drains it with `wait_for_next` + `shift`.

use std::collections::VecDeque;

use parking_lot::Mutex;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use vela_core::{OverflowPolicy, QueueLimits, SyncError};

#[derive(Debug, Clone, PartialEq)]
pub enum QueueItem<T> {
    Event(T),
    Error(SyncError),
}

/// Why `wait_for_next` returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Wait {
    /// At least one item is buffered.
    Ready,
    /// `abort()` was called; nothing more will be delivered.
    Aborted,
    /// The caller's cancellation token fired.
    Cancelled,
}

struct Inner<T> {
    buf: VecDeque<QueueItem<T>>,
    /// Buffered events, excluding errors. Compared against the capacity.
    events: usize,
    aborted: bool,
    /// Set after an overflow under `OverflowPolicy::Fail`; further emits are ignored.
    sealed: bool,
    dropped: u64,
}

pub struct EventQueue<T> {
    inner: Mutex<Inner<T>>,
    notify: Notify,
    limits: QueueLimits,
}

impl<T> EventQueue<T> {
    pub fn new(limits: QueueLimits) -> Self {
        Self {
            inner: Mutex::new(Inner { buf: VecDeque::new(), events: 0, aborted: false, sealed: false, dropped: 0 }),
            notify: Notify::new(),
            limits,
        }
    }

    pub fn unbounded() -> Self {
        Self::new(QueueLimits::unbounded())
    }

    pub fn emit(&self, event: T) {
        {
            let mut inner = self.inner.lock();
            if inner.aborted || inner.sealed {
                return;
            }
            if let Some(cap) = self.limits.capacity {
                if inner.events >= cap {
                    match self.limits.overflow {
                        OverflowPolicy::DropOldest => {
                            if let Some(pos) = inner.buf.iter().position(|it| matches!(it, QueueItem::Event(_))) {
                                inner.buf.remove(pos);
                                inner.events -= 1;
                                inner.dropped += 1;
                                if inner.dropped == 1 {
                                    warn!(capacity = cap, "queue: capacity exceeded; evicting oldest events, consumers may diverge until resync");
                                }
                                metrics::counter!("vela_queue_dropped_total", 1u64);
                            }
                        }
                        OverflowPolicy::Fail => {
                            warn!(capacity = cap, "queue: capacity exceeded; failing stream");
                            metrics::counter!("vela_queue_overflow_total", 1u64);
                            inner.sealed = true;
                            inner.buf.push_back(QueueItem::Error(SyncError::Overflow { capacity: cap }));
                            drop(inner);
                            self.notify.notify_one();
                            return;
                        }
                    }
                }
            }
            inner.buf.push_back(QueueItem::Event(event));
            inner.events += 1;
        }
        self.notify.notify_one();
    }

    pub fn emit_error(&self, err: SyncError) {
        {
            let mut inner = self.inner.lock();
            if inner.aborted || inner.sealed {
                return;
            }
            inner.buf.push_back(QueueItem::Error(err));
        }
        self.notify.notify_one();
    }

    /// Stop the queue: pending items are discarded and the waiter is released.
    /// Idempotent.
    pub fn abort(&self) {
        {
            let mut inner = self.inner.lock();
            if inner.aborted {
                return;
            }
            inner.aborted = true;
            let discarded = inner.buf.len();
            inner.buf.clear();
            inner.events = 0;
            if discarded > 0 {
                debug!(discarded, "queue: aborted with pending items");
            }
        }
        self.notify.notify_one();
    }

    pub fn shift(&self) -> Option<QueueItem<T>> {
        let mut inner = self.inner.lock();
        let item = inner.buf.pop_front();
        if let Some(QueueItem::Event(_)) = item {
            inner.events -= 1;
        }
        item
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().buf.is_empty()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().buf.len()
    }

    pub fn is_aborted(&self) -> bool {
        self.inner.lock().aborted
    }

    /// Events evicted under `OverflowPolicy::DropOldest`.
    pub fn dropped(&self) -> u64 {
        self.inner.lock().dropped
    }

    /// Park until an item is buffered, the queue is aborted, or `cancel` fires.
    /// Only one waiter may be parked at a time.
    pub async fn wait_for_next(&self, cancel: &CancellationToken) -> Wait {
        loop {
            {
                let inner = self.inner.lock();
                if inner.aborted {
                    return Wait::Aborted;
                }
                if !inner.buf.is_empty() {
                    return Wait::Ready;
                }
            }
            if cancel.is_cancelled() {
                return Wait::Cancelled;
            }
            // A notify_one that raced ahead of this point left a permit behind,
            // so `notified()` completes immediately and the state is re-checked.
            tokio::select! {
                _ = self.notify.notified() => {}
                _ = cancel.cancelled() => return Wait::Cancelled,
            }
        }
    }
}
