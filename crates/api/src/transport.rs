//! In-process Subscription Transport driving a `WatchStream` pull loop.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tracing::debug;
use vela_core::{QueueLimits, ResourceObject, SyncResult, WatchRequest};
use vela_kubehub::{WatchClient, WatchStream};

use crate::{ErrorFn, EventFn, Subscription, WatchTransport};

pub struct AdapterTransport<R> {
    client: Arc<dyn WatchClient<R>>,
    limits: QueueLimits,
}

impl<R> AdapterTransport<R> {
    pub fn new(client: Arc<dyn WatchClient<R>>, limits: QueueLimits) -> Self {
        Self { client, limits }
    }
}

impl<R: ResourceObject> WatchTransport<R> for AdapterTransport<R> {
    fn subscribe(&self, request: WatchRequest, mut on_event: EventFn<R>, on_error: ErrorFn) -> SyncResult<Subscription> {
        let mut stream = WatchStream::open(self.client.as_ref(), &request, self.limits)?;
        let canceller = stream.canceller();
        let live = Arc::new(AtomicBool::new(true));

        let task_live = Arc::clone(&live);
        let task_cancel = canceller.clone();
        let key = request.kind.key();
        tokio::spawn(async move {
            let mut on_error = Some(on_error);
            let mut delivered = 0u64;
            while let Some(item) = stream.next().await {
                // Nothing reaches the consumer once it has unsubscribed.
                if task_cancel.is_cancelled() {
                    break;
                }
                match item {
                    Ok(ev) => {
                        delivered += 1;
                        on_event(ev);
                    }
                    Err(err) => {
                        task_live.store(false, Ordering::SeqCst);
                        if let Some(f) = on_error.take() {
                            f(err);
                        }
                        break;
                    }
                }
            }
            task_live.store(false, Ordering::SeqCst);
            debug!(kind = %key, delivered, "transport: pull loop ended");
        });

        Ok(Subscription::new(request.cursor, live, move || canceller.cancel()))
    }
}
