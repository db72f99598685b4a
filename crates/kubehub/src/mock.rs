//! In-memory cluster double for tests: seeded list/get responses, call
//! counters and manual control over open watches.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use vela_core::{
    Cursor, ItemSnapshot, ListSnapshot, ResourceKind, ResourceObject, SyncError, SyncResult, WatchEventType,
    WatchRequest,
};

use crate::{ConnectionHandle, FetchClient, WatchClient, WatchSink};

type ScopeKey = (String, Option<String>);

struct OpenWatch<R> {
    id: u64,
    request: WatchRequest,
    sink: WatchSink<R>,
}

struct State<R> {
    lists: HashMap<ScopeKey, ListSnapshot<R>>,
    items: HashMap<(String, Option<String>, String), ItemSnapshot<R>>,
    open: Vec<OpenWatch<R>>,
    next_id: u64,
    list_calls: usize,
    get_calls: usize,
    watch_calls: usize,
    closed: usize,
    watch_requests: Vec<WatchRequest>,
    fetch_error: Option<SyncError>,
    watch_error: Option<SyncError>,
    fetch_delay: Option<Duration>,
}

pub struct MockCluster<R = serde_json::Value> {
    state: Arc<Mutex<State<R>>>,
}

impl<R> Clone for MockCluster<R> {
    fn clone(&self) -> Self {
        Self { state: Arc::clone(&self.state) }
    }
}

impl<R: ResourceObject> Default for MockCluster<R> {
    fn default() -> Self {
        Self::new()
    }
}

fn scope(kind: &ResourceKind, namespace: Option<&str>) -> ScopeKey {
    (kind.key(), namespace.map(|s| s.to_string()))
}

impl<R: ResourceObject> MockCluster<R> {
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(State {
                lists: HashMap::new(),
                items: HashMap::new(),
                open: Vec::new(),
                next_id: 0,
                list_calls: 0,
                get_calls: 0,
                watch_calls: 0,
                closed: 0,
                watch_requests: Vec::new(),
                fetch_error: None,
                watch_error: None,
                fetch_delay: None,
            })),
        }
    }

    pub fn seed_list(&self, kind: &ResourceKind, namespace: Option<&str>, items: Vec<R>, resource_version: &str) {
        self.state
            .lock()
            .lists
            .insert(scope(kind, namespace), ListSnapshot { items, resource_version: Cursor::new(resource_version) });
    }

    pub fn seed_item(
        &self,
        kind: &ResourceKind,
        namespace: Option<&str>,
        name: &str,
        item: Option<R>,
        resource_version: &str,
    ) {
        let key = (kind.key(), namespace.map(|s| s.to_string()), name.to_string());
        self.state.lock().items.insert(key, ItemSnapshot { item, resource_version: Cursor::new(resource_version) });
    }

    /// Make every subsequent list/get fail (or succeed again with `None`).
    pub fn fail_fetches(&self, err: Option<SyncError>) {
        self.state.lock().fetch_error = err;
    }

    /// Make every subsequent watch call refuse to open.
    pub fn refuse_watches(&self, err: Option<SyncError>) {
        self.state.lock().watch_error = err;
    }

    pub fn set_fetch_delay(&self, delay: Option<Duration>) {
        self.state.lock().fetch_delay = delay;
    }

    /// Deliver an event to every open watch.
    pub fn push(&self, event_type: WatchEventType, resource: R) {
        let sinks: Vec<WatchSink<R>> = self.state.lock().open.iter().map(|w| w.sink.clone()).collect();
        for sink in sinks {
            sink.event(event_type, resource.clone());
        }
    }

    /// Deliver an event only to watches opened for `kind` in `namespace`.
    pub fn push_scoped(&self, kind: &ResourceKind, namespace: Option<&str>, event_type: WatchEventType, resource: R) {
        let sinks: Vec<WatchSink<R>> = self
            .state
            .lock()
            .open
            .iter()
            .filter(|w| w.request.kind.key() == kind.key() && w.request.namespace.as_deref() == namespace)
            .map(|w| w.sink.clone())
            .collect();
        for sink in sinks {
            sink.event(event_type, resource.clone());
        }
    }

    /// Report a connection error on every open watch.
    pub fn fail_watches(&self, err: SyncError) {
        let sinks: Vec<WatchSink<R>> = self.state.lock().open.iter().map(|w| w.sink.clone()).collect();
        for sink in sinks {
            sink.error(err.clone());
        }
    }

    pub fn list_calls(&self) -> usize {
        self.state.lock().list_calls
    }

    pub fn get_calls(&self) -> usize {
        self.state.lock().get_calls
    }

    pub fn watch_calls(&self) -> usize {
        self.state.lock().watch_calls
    }

    pub fn open_connections(&self) -> usize {
        self.state.lock().open.len()
    }

    pub fn closed_connections(&self) -> usize {
        self.state.lock().closed
    }

    pub fn watch_requests(&self) -> Vec<WatchRequest> {
        self.state.lock().watch_requests.clone()
    }

    /// Poll `pred` until it holds or two seconds pass.
    pub async fn wait_until(&self, pred: impl Fn(&Self) -> bool) -> bool {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
        while tokio::time::Instant::now() < deadline {
            if pred(self) {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        pred(self)
    }

    async fn delay(&self) {
        let delay = self.state.lock().fetch_delay;
        if let Some(d) = delay {
            tokio::time::sleep(d).await;
        }
    }
}

impl<R: ResourceObject> WatchClient<R> for MockCluster<R> {
    fn watch(&self, request: &WatchRequest, sink: WatchSink<R>) -> SyncResult<ConnectionHandle> {
        let mut st = self.state.lock();
        st.watch_calls += 1;
        st.watch_requests.push(request.clone());
        if let Some(err) = st.watch_error.clone() {
            return Err(err);
        }
        let id = st.next_id;
        st.next_id += 1;
        st.open.push(OpenWatch { id, request: request.clone(), sink });
        drop(st);

        let state = Arc::clone(&self.state);
        Ok(ConnectionHandle::new(move || {
            let mut st = state.lock();
            if let Some(pos) = st.open.iter().position(|w| w.id == id) {
                st.open.remove(pos);
                st.closed += 1;
            }
        }))
    }
}

#[async_trait::async_trait]
impl<R: ResourceObject> FetchClient<R> for MockCluster<R> {
    async fn list(
        &self,
        kind: &ResourceKind,
        namespace: Option<&str>,
        _label_selector: Option<&str>,
    ) -> SyncResult<ListSnapshot<R>> {
        self.state.lock().list_calls += 1;
        self.delay().await;
        let st = self.state.lock();
        if let Some(err) = st.fetch_error.clone() {
            return Err(err);
        }
        Ok(st
            .lists
            .get(&scope(kind, namespace))
            .cloned()
            .unwrap_or_else(|| ListSnapshot { items: Vec::new(), resource_version: Cursor::new("0") }))
    }

    async fn get(&self, kind: &ResourceKind, namespace: Option<&str>, name: &str) -> SyncResult<ItemSnapshot<R>> {
        self.state.lock().get_calls += 1;
        self.delay().await;
        let st = self.state.lock();
        if let Some(err) = st.fetch_error.clone() {
            return Err(err);
        }
        let key = (kind.key(), namespace.map(|s| s.to_string()), name.to_string());
        Ok(st
            .items
            .get(&key)
            .cloned()
            .unwrap_or_else(|| ItemSnapshot { item: None, resource_version: Cursor::new("0") }))
    }
}
