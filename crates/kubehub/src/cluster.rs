//! kube-rs backed watch/fetch clients.

use anyhow::{Context, Result};
use futures::StreamExt;
use kube::{
    api::{Api, ListParams, WatchEvent as KubeWatchEvent, WatchParams},
    core::{ApiResource, DynamicObject, GroupVersionKind},
    Client,
};
use tracing::{debug, info, warn};
use vela_core::{
    Cursor, ItemSnapshot, ListSnapshot, ResourceKind, SyncError, SyncResult, WatchEventType, WatchRequest,
};

use crate::{ConnectionHandle, FetchClient, WatchClient, WatchSink};

/// Explicit cluster connection state: one authenticated client plus a label
/// for logs. Passed to clients at construction instead of living in globals.
#[derive(Clone)]
pub struct ClusterContext {
    client: Client,
    name: String,
}

impl ClusterContext {
    pub fn new(client: Client, name: impl Into<String>) -> Self {
        Self { client, name: name.into() }
    }

    /// Build from kubeconfig or in-cluster environment.
    pub async fn infer() -> Result<Self> {
        let config = kube::Config::infer().await.context("inferring kube config")?;
        let name = config.cluster_url.to_string();
        let client = Client::try_from(config).context("building kube client")?;
        info!(cluster = %name, "cluster context ready");
        Ok(Self { client, name })
    }

    pub fn client(&self) -> Client {
        self.client.clone()
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Namespace of the active kubeconfig context (or the pod's namespace).
    pub fn default_namespace(&self) -> &str {
        self.client.default_namespace()
    }
}

/// Watch + fetch against a live API server. Objects travel as raw JSON with
/// `metadata.managedFields` stripped.
#[derive(Clone)]
pub struct KubeClient {
    ctx: ClusterContext,
}

impl KubeClient {
    pub fn new(ctx: ClusterContext) -> Self {
        Self { ctx }
    }

    fn api(&self, kind: &ResourceKind, namespace: Option<&str>) -> Api<DynamicObject> {
        let gvk = GroupVersionKind::gvk(&kind.group, &kind.version, &kind.kind);
        let ar = ApiResource::from_gvk_with_plural(&gvk, &kind.plural);
        match namespace {
            Some(ns) if kind.namespaced => Api::namespaced_with(self.ctx.client(), ns, &ar),
            _ => Api::all_with(self.ctx.client(), &ar),
        }
    }
}

fn strip_managed_fields(v: &mut serde_json::Value) {
    if let Some(meta) = v.get_mut("metadata") {
        if let Some(obj) = meta.as_object_mut() {
            obj.remove("managedFields");
        }
    }
}

fn to_raw(obj: &DynamicObject) -> Result<serde_json::Value> {
    let mut raw = serde_json::to_value(obj).context("serializing DynamicObject")?;
    strip_managed_fields(&mut raw);
    Ok(raw)
}

fn watch_params(request: &WatchRequest) -> WatchParams {
    let mut wp = WatchParams::default();
    if let Some(sel) = request.label_selector.as_deref() {
        wp = wp.labels(sel);
    }
    if let Some(sel) = request.field_selector.as_deref() {
        wp = wp.fields(sel);
    }
    wp
}

/// Drive one watch call until it fails, ends or the sink is closed.
async fn pump(api: Api<DynamicObject>, request: WatchRequest, sink: WatchSink<serde_json::Value>) {
    let wp = watch_params(&request);
    let stream = match api.watch(&wp, request.cursor.as_str()).await {
        Ok(s) => s,
        Err(e) => {
            sink.error(SyncError::Connection(e.to_string()));
            return;
        }
    };
    futures::pin_mut!(stream);
    while let Some(item) = stream.next().await {
        if sink.is_closed() {
            return;
        }
        let (event_type, obj) = match item {
            Ok(KubeWatchEvent::Added(o)) => (WatchEventType::Added, o),
            Ok(KubeWatchEvent::Modified(o)) => (WatchEventType::Modified, o),
            Ok(KubeWatchEvent::Deleted(o)) => (WatchEventType::Deleted, o),
            Ok(KubeWatchEvent::Bookmark(b)) => {
                debug!(rv = %b.metadata.resource_version, "kube: bookmark");
                continue;
            }
            Ok(KubeWatchEvent::Error(resp)) => {
                let err = if resp.code == 410 {
                    SyncError::Expired(resp.message)
                } else {
                    SyncError::Connection(format!("{} ({})", resp.message, resp.code))
                };
                sink.error(err);
                return;
            }
            Err(e) => {
                sink.error(SyncError::Connection(e.to_string()));
                return;
            }
        };
        match to_raw(&obj) {
            Ok(raw) => sink.event(event_type, raw),
            Err(e) => warn!(error = %e, "kube: dropping unserializable object"),
        }
    }
    sink.error(SyncError::Connection("watch stream closed by server".into()));
}

impl WatchClient<serde_json::Value> for KubeClient {
    fn watch(&self, request: &WatchRequest, sink: WatchSink<serde_json::Value>) -> SyncResult<ConnectionHandle> {
        let api = self.api(&request.kind, request.namespace.as_deref());
        let request = request.clone();
        debug!(cluster = %self.ctx.name(), kind = %request.kind.key(), ns = ?request.namespace, cursor = %request.cursor, "kube: watch");
        let task = tokio::spawn(pump(api, request, sink));
        Ok(ConnectionHandle::from_task(task))
    }
}

#[async_trait::async_trait]
impl FetchClient<serde_json::Value> for KubeClient {
    async fn list(
        &self,
        kind: &ResourceKind,
        namespace: Option<&str>,
        label_selector: Option<&str>,
    ) -> SyncResult<ListSnapshot<serde_json::Value>> {
        let api = self.api(kind, namespace);
        let mut lp = ListParams::default();
        if let Some(sel) = label_selector {
            lp = lp.labels(sel);
        }
        let list = api.list(&lp).await.map_err(|e| SyncError::Snapshot(e.to_string()))?;
        let resource_version = Cursor::new(list.metadata.resource_version.unwrap_or_default());
        let mut items = Vec::with_capacity(list.items.len());
        for obj in list.items.iter() {
            items.push(to_raw(obj).map_err(|e| SyncError::Snapshot(e.to_string()))?);
        }
        debug!(kind = %kind.key(), ns = ?namespace, count = items.len(), rv = %resource_version, "kube: list");
        Ok(ListSnapshot { items, resource_version })
    }

    async fn get(
        &self,
        kind: &ResourceKind,
        namespace: Option<&str>,
        name: &str,
    ) -> SyncResult<ItemSnapshot<serde_json::Value>> {
        let api = self.api(kind, namespace);
        match api.get_opt(name).await.map_err(|e| SyncError::Snapshot(e.to_string()))? {
            Some(obj) => {
                let resource_version = Cursor::new(obj.metadata.resource_version.clone().unwrap_or_default());
                let raw = to_raw(&obj).map_err(|e| SyncError::Snapshot(e.to_string()))?;
                Ok(ItemSnapshot { item: Some(raw), resource_version })
            }
            None => {
                // Watch the (currently empty) name-filtered collection from its version.
                let lp = ListParams::default().fields(&format!("metadata.name={}", name)).limit(1);
                let list = api.list(&lp).await.map_err(|e| SyncError::Snapshot(e.to_string()))?;
                let resource_version = Cursor::new(list.metadata.resource_version.unwrap_or_default());
                Ok(ItemSnapshot { item: None, resource_version })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use vela_core::WatchTarget;

    #[test]
    fn strips_managed_fields_only() {
        let mut v = json!({ "metadata": { "name": "x", "managedFields": [{ "manager": "kubectl" }] } });
        strip_managed_fields(&mut v);
        assert_eq!(v, json!({ "metadata": { "name": "x" } }));
    }

    #[test]
    fn watch_params_carry_selectors() {
        let kind = ResourceKind::new("tekton.dev", "v1", "Pipeline", "pipelines");
        let req = WatchTarget::item(kind, Some("ns1"), "build").with_labels("team=a").request(Cursor::new("5"));
        let wp = watch_params(&req);
        assert_eq!(wp.label_selector.as_deref(), Some("team=a"));
        assert_eq!(wp.field_selector.as_deref(), Some("metadata.name=build"));
    }
}
