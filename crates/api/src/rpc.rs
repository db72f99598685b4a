//! Watch procedures exposed over the RPC boundary.
//!
//! Server side, `WatchService` implements a subscribe/unsubscribe procedure
//! pair; each subscription streams JSON frames shaped
//! `{"type":"ADDED"|"MODIFIED"|"DELETED","data":R}` and ends with at most one
//! `{"type":"ERROR","data":<SyncError>}`. Client side, `RpcTransport` turns
//! those frames back into a `WatchTransport`.

use std::marker::PhantomData;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;
use vela_core::{QueueLimits, ResourceObject, SyncError, SyncResult, WatchEvent, WatchEventType, WatchRequest};
use vela_kubehub::{WatchCanceller, WatchClient, WatchStream};

use crate::{ErrorFn, EventFn, Subscription, WatchTransport};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "UPPERCASE")]
pub enum WireMessage<R> {
    Added(R),
    Modified(R),
    Deleted(R),
    Error(SyncError),
}

impl<R> From<WatchEvent<R>> for WireMessage<R> {
    fn from(ev: WatchEvent<R>) -> Self {
        match ev.event_type {
            WatchEventType::Added => WireMessage::Added(ev.resource),
            WatchEventType::Modified => WireMessage::Modified(ev.resource),
            WatchEventType::Deleted => WireMessage::Deleted(ev.resource),
        }
    }
}

impl<R> WireMessage<R> {
    pub fn into_event(self) -> SyncResult<WatchEvent<R>> {
        match self {
            WireMessage::Added(r) => Ok(WatchEvent::added(r)),
            WireMessage::Modified(r) => Ok(WatchEvent::modified(r)),
            WireMessage::Deleted(r) => Ok(WatchEvent::deleted(r)),
            WireMessage::Error(e) => Err(e),
        }
    }
}

pub struct SubscribeReply {
    pub id: Uuid,
    pub frames: mpsc::Receiver<String>,
}

/// The subscribe/unsubscribe procedure pair as seen by a client.
pub trait WatchProcedures: Send + Sync {
    fn subscribe(&self, request: WatchRequest) -> SyncResult<SubscribeReply>;
    /// Returns false if `id` was unknown or already gone. Idempotent.
    fn unsubscribe(&self, id: &Uuid) -> bool;
}

struct ServiceInner<R> {
    client: Arc<dyn WatchClient<R>>,
    limits: QueueLimits,
    frame_capacity: usize,
    subs: Mutex<FxHashMap<Uuid, WatchCanceller<R>>>,
}

impl<R> ServiceInner<R> {
    fn forget(&self, id: &Uuid) -> Option<WatchCanceller<R>> {
        let mut subs = self.subs.lock();
        let removed = subs.remove(id);
        metrics::gauge!("vela_rpc_subscriptions", subs.len() as f64);
        removed
    }
}

pub struct WatchService<R> {
    inner: Arc<ServiceInner<R>>,
}

impl<R> Clone for WatchService<R> {
    fn clone(&self) -> Self {
        Self { inner: Arc::clone(&self.inner) }
    }
}

impl<R> WatchService<R> {
    pub fn new(client: Arc<dyn WatchClient<R>>, limits: QueueLimits, frame_capacity: usize) -> Self {
        Self {
            inner: Arc::new(ServiceInner {
                client,
                limits,
                frame_capacity: frame_capacity.max(1),
                subs: Mutex::new(FxHashMap::default()),
            }),
        }
    }

    pub fn active(&self) -> usize {
        self.inner.subs.lock().len()
    }
}

impl<R: ResourceObject + Serialize> WatchProcedures for WatchService<R> {
    fn subscribe(&self, request: WatchRequest) -> SyncResult<SubscribeReply> {
        let stream = WatchStream::open(self.inner.client.as_ref(), &request, self.inner.limits)?;
        let canceller = stream.canceller();
        let id = Uuid::new_v4();
        {
            let mut subs = self.inner.subs.lock();
            subs.insert(id, canceller.clone());
            metrics::gauge!("vela_rpc_subscriptions", subs.len() as f64);
        }
        let (tx, rx) = mpsc::channel::<String>(self.inner.frame_capacity);
        info!(%id, kind = %request.kind.key(), ns = ?request.namespace, cursor = %request.cursor, "rpc: subscribe");
        tokio::spawn(serve(stream, canceller, tx, id, Arc::downgrade(&self.inner)));
        Ok(SubscribeReply { id, frames: rx })
    }

    fn unsubscribe(&self, id: &Uuid) -> bool {
        match self.inner.forget(id) {
            Some(c) => {
                c.cancel();
                info!(%id, "rpc: unsubscribe");
                true
            }
            None => false,
        }
    }
}

async fn serve<R: ResourceObject + Serialize>(
    mut stream: WatchStream<R>,
    canceller: WatchCanceller<R>,
    tx: mpsc::Sender<String>,
    id: Uuid,
    service: Weak<ServiceInner<R>>,
) {
    while let Some(item) = stream.next().await {
        let msg = match item {
            Ok(ev) => WireMessage::from(ev),
            Err(e) => WireMessage::Error(e),
        };
        let terminal = matches!(msg, WireMessage::Error(_));
        let frame = match serde_json::to_string(&msg) {
            Ok(f) => f,
            Err(e) => {
                warn!(%id, error = %e, "rpc: skipping unencodable event");
                continue;
            }
        };
        tokio::select! {
            biased;
            _ = canceller.cancelled() => break,
            sent = tx.send(frame) => {
                if sent.is_err() {
                    debug!(%id, "rpc: client went away");
                    break;
                }
            }
        }
        if terminal {
            break;
        }
    }
    if let Some(svc) = service.upgrade() {
        if let Some(c) = svc.forget(&id) {
            c.cancel();
        }
    }
    debug!(%id, "rpc: stream finished");
}

/// Client-side transport speaking to a `WatchProcedures` implementation.
pub struct RpcTransport<R> {
    procedures: Arc<dyn WatchProcedures>,
    _resource: PhantomData<fn() -> R>,
}

impl<R> RpcTransport<R> {
    pub fn new(procedures: Arc<dyn WatchProcedures>) -> Self {
        Self { procedures, _resource: PhantomData }
    }
}

impl<R: ResourceObject + DeserializeOwned> WatchTransport<R> for RpcTransport<R> {
    fn subscribe(&self, request: WatchRequest, mut on_event: EventFn<R>, on_error: ErrorFn) -> SyncResult<Subscription> {
        let SubscribeReply { id, mut frames } = self.procedures.subscribe(request.clone())?;
        let token = CancellationToken::new();
        let live = Arc::new(AtomicBool::new(true));

        let task_token = token.clone();
        let task_live = Arc::clone(&live);
        tokio::spawn(async move {
            let mut on_error = Some(on_error);
            loop {
                let frame = tokio::select! {
                    biased;
                    _ = task_token.cancelled() => break,
                    f = frames.recv() => f,
                };
                let Some(frame) = frame else {
                    task_live.store(false, Ordering::SeqCst);
                    if !task_token.is_cancelled() {
                        if let Some(f) = on_error.take() {
                            f(SyncError::Connection("subscription channel closed".into()));
                        }
                    }
                    break;
                };
                match serde_json::from_str::<WireMessage<R>>(&frame) {
                    Ok(msg) => match msg.into_event() {
                        Ok(ev) => on_event(ev),
                        Err(err) => {
                            task_live.store(false, Ordering::SeqCst);
                            if let Some(f) = on_error.take() {
                                f(err);
                            }
                            break;
                        }
                    },
                    Err(e) => warn!(%id, error = %e, "rpc: skipping undecodable frame"),
                }
            }
            task_live.store(false, Ordering::SeqCst);
        });

        let procedures = Arc::clone(&self.procedures);
        Ok(Subscription::new(request.cursor, live, move || {
            token.cancel();
            procedures.unsubscribe(&id);
        }))
    }
}
