//! Vela core types shared by the watch, transport and cache layers.

#![forbid(unsafe_code)]

use std::fmt;

use serde::{Deserialize, Serialize};

pub mod config;
pub mod error;

pub use config::{OverflowPolicy, QueueLimits, ReconnectPolicy, SyncConfig};
pub use error::{SyncError, SyncResult};

/// A served resource kind, addressed the way the watch/list endpoints expect.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct ResourceKind {
    pub group: String,
    pub version: String,
    /// Singular kind name (`Pipeline`). Informational for dynamic clients.
    pub kind: String,
    /// Plural resource name used in request paths (`pipelines`).
    pub plural: String,
    pub namespaced: bool,
}

impl ResourceKind {
    pub fn new(group: &str, version: &str, kind: &str, plural: &str) -> Self {
        Self {
            group: group.to_string(),
            version: version.to_string(),
            kind: kind.to_string(),
            plural: plural.to_string(),
            namespaced: true,
        }
    }

    pub fn cluster_scoped(mut self) -> Self {
        self.namespaced = false;
        self
    }

    /// `group/version/plural`, or `version/plural` for the core group.
    pub fn key(&self) -> String {
        if self.group.is_empty() {
            format!("{}/{}", self.version, self.plural)
        } else {
            format!("{}/{}/{}", self.group, self.version, self.plural)
        }
    }

    pub fn api_version(&self) -> String {
        if self.group.is_empty() {
            self.version.clone()
        } else {
            format!("{}/{}", self.group, self.version)
        }
    }

    /// Parse a `v1/pods` or `tekton.dev/v1/pipelines` key. The kind name is
    /// left empty and the result is namespaced; adjust with the builders.
    pub fn parse_key(key: &str) -> SyncResult<Self> {
        let parts: Vec<&str> = key.split('/').collect();
        match parts.as_slice() {
            [version, plural] if !version.is_empty() && !plural.is_empty() => {
                Ok(Self::new("", version, "", plural))
            }
            [group, version, plural] if !group.is_empty() && !version.is_empty() && !plural.is_empty() => {
                Ok(Self::new(group, version, "", plural))
            }
            _ => Err(SyncError::Validation(format!(
                "invalid resource key: {} (expect v1/plural or group/v1/plural)",
                key
            ))),
        }
    }
}

/// Opaque resource-version checkpoint. Never parsed or compared numerically.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(transparent)]
pub struct Cursor(String);

impl Cursor {
    pub fn new(rv: impl Into<String>) -> Self {
        Self(rv.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Display for Cursor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for Cursor {
    fn from(v: &str) -> Self {
        Self(v.to_string())
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "UPPERCASE")]
pub enum WatchEventType {
    Added,
    Modified,
    Deleted,
}

impl fmt::Display for WatchEventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            WatchEventType::Added => "ADDED",
            WatchEventType::Modified => "MODIFIED",
            WatchEventType::Deleted => "DELETED",
        };
        f.write_str(s)
    }
}

/// One control-plane notification. Immutable once produced.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WatchEvent<R> {
    pub event_type: WatchEventType,
    pub resource: R,
}

impl<R> WatchEvent<R> {
    pub fn new(event_type: WatchEventType, resource: R) -> Self {
        Self { event_type, resource }
    }

    pub fn added(resource: R) -> Self {
        Self::new(WatchEventType::Added, resource)
    }

    pub fn modified(resource: R) -> Self {
        Self::new(WatchEventType::Modified, resource)
    }

    pub fn deleted(resource: R) -> Self {
        Self::new(WatchEventType::Deleted, resource)
    }
}

/// Minimal view of a resource the sync engine needs: identity plus version.
pub trait ResourceObject: Clone + Send + Sync + 'static {
    fn name(&self) -> Option<&str>;
    fn namespace(&self) -> Option<&str>;
    fn resource_version(&self) -> Option<&str>;
}

/// Raw objects as served by the API (`{"metadata": {...}, ...}`).
impl ResourceObject for serde_json::Value {
    fn name(&self) -> Option<&str> {
        self.get("metadata")?.get("name")?.as_str()
    }

    fn namespace(&self) -> Option<&str> {
        self.get("metadata")?.get("namespace")?.as_str()
    }

    fn resource_version(&self) -> Option<&str> {
        self.get("metadata")?.get("resourceVersion")?.as_str()
    }
}

/// What a consumer observes: a kind within a scope, optionally a single name.
/// Also the identity under which live views are shared.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct WatchTarget {
    pub kind: ResourceKind,
    pub namespace: Option<String>,
    pub label_selector: Option<String>,
    pub name: Option<String>,
}

impl WatchTarget {
    pub fn list(kind: ResourceKind, namespace: Option<&str>) -> Self {
        Self { kind, namespace: namespace.map(|s| s.to_string()), label_selector: None, name: None }
    }

    pub fn item(kind: ResourceKind, namespace: Option<&str>, name: &str) -> Self {
        Self {
            kind,
            namespace: namespace.map(|s| s.to_string()),
            label_selector: None,
            name: Some(name.to_string()),
        }
    }

    pub fn with_labels(mut self, selector: &str) -> Self {
        self.label_selector = Some(selector.to_string()).filter(|s| !s.is_empty());
        self
    }

    /// Build the watch request resuming from `cursor`. Item targets are
    /// narrowed server-side with a name field selector.
    pub fn request(&self, cursor: Cursor) -> WatchRequest {
        WatchRequest {
            kind: self.kind.clone(),
            namespace: self.namespace.clone(),
            cursor,
            label_selector: self.label_selector.clone(),
            field_selector: self.name.as_ref().map(|n| format!("metadata.name={}", n)),
        }
    }
}

impl fmt::Display for WatchTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}|{}", self.kind.key(), self.namespace.as_deref().unwrap_or(""))?;
        if let Some(name) = &self.name {
            write!(f, "|{}", name)?;
        }
        if let Some(sel) = &self.label_selector {
            write!(f, "|{}", sel)?;
        }
        Ok(())
    }
}

/// Parameters of one watch call.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct WatchRequest {
    pub kind: ResourceKind,
    pub namespace: Option<String>,
    pub cursor: Cursor,
    pub label_selector: Option<String>,
    pub field_selector: Option<String>,
}

/// Result of a one-shot list.
#[derive(Debug, Clone)]
pub struct ListSnapshot<R> {
    pub items: Vec<R>,
    pub resource_version: Cursor,
}

/// Result of a one-shot get. `item` is `None` when the object does not exist;
/// `resource_version` is then the collection version to watch from.
#[derive(Debug, Clone)]
pub struct ItemSnapshot<R> {
    pub item: Option<R>,
    pub resource_version: Cursor,
}

pub mod prelude {
    pub use super::{
        Cursor, ItemSnapshot, ListSnapshot, ResourceKind, ResourceObject, SyncError, SyncResult, WatchEvent,
        WatchEventType, WatchRequest, WatchTarget,
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_key_core_and_grouped() {
        let k = ResourceKind::parse_key("v1/pods").expect("ok");
        assert_eq!(k.group, "");
        assert_eq!(k.version, "v1");
        assert_eq!(k.plural, "pods");
        assert_eq!(k.key(), "v1/pods");
        assert_eq!(k.api_version(), "v1");

        let k = ResourceKind::parse_key("tekton.dev/v1/pipelines").expect("ok");
        assert_eq!(k.group, "tekton.dev");
        assert_eq!(k.key(), "tekton.dev/v1/pipelines");
        assert_eq!(k.api_version(), "tekton.dev/v1");
    }

    #[test]
    fn parse_key_invalid_returns_err() {
        assert!(ResourceKind::parse_key("pods").is_err());
        assert!(ResourceKind::parse_key("").is_err());
        assert!(ResourceKind::parse_key("a/b/c/d").is_err());
        assert!(ResourceKind::parse_key("v1/").is_err());
    }

    #[test]
    fn raw_json_exposes_identity() {
        let v = serde_json::json!({
            "metadata": { "name": "x", "namespace": "ns1", "resourceVersion": "10" }
        });
        assert_eq!(v.name(), Some("x"));
        assert_eq!(v.namespace(), Some("ns1"));
        assert_eq!(v.resource_version(), Some("10"));

        let empty = serde_json::json!({ "spec": {} });
        assert_eq!(empty.name(), None);
        assert_eq!(empty.resource_version(), None);
    }

    #[test]
    fn item_request_carries_name_field_selector() {
        let kind = ResourceKind::new("", "v1", "Pod", "pods");
        let t = WatchTarget::item(kind.clone(), Some("ns1"), "x").with_labels("app=web");
        let req = t.request(Cursor::new("42"));
        assert_eq!(req.cursor.as_str(), "42");
        assert_eq!(req.field_selector.as_deref(), Some("metadata.name=x"));
        assert_eq!(req.label_selector.as_deref(), Some("app=web"));

        let list = WatchTarget::list(kind, Some("ns1")).request(Cursor::default());
        assert_eq!(list.field_selector, None);
    }

    #[test]
    fn event_type_serializes_uppercase() {
        let s = serde_json::to_string(&WatchEventType::Modified).expect("ser");
        assert_eq!(s, "\"MODIFIED\"");
    }
}
