//! Cache shapes kept by a reconciler: a keyed list or a single item.

use std::collections::BTreeMap;
use std::fmt;

use vela_core::{Cursor, ResourceObject, SyncError, SyncResult, WatchEvent, WatchEventType, WatchTarget};
use vela_kubehub::FetchClient;

/// A cache shape: how to seed it from a one-shot fetch and how to fold one
/// event into it. `apply` must leave the cache untouched when it fails.
#[async_trait::async_trait]
pub trait ViewModel<R: ResourceObject>: Clone + Send + Sync + Sized + 'static {
    async fn load(fetch: &dyn FetchClient<R>, target: &WatchTarget) -> SyncResult<(Self, Cursor)>;

    fn apply(&mut self, event: WatchEvent<R>) -> SyncResult<()>;
}

/// Identity of a listed object. A scope spanning all namespaces can hold the
/// same name several times, so the namespace is part of the key.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ObjectKey {
    pub namespace: Option<String>,
    pub name: String,
}

impl ObjectKey {
    pub fn new(namespace: Option<&str>, name: &str) -> Self {
        Self { namespace: namespace.map(str::to_string), name: name.to_string() }
    }

    fn of<R: ResourceObject>(obj: &R) -> Option<Self> {
        obj.name().map(|name| Self::new(obj.namespace(), name))
    }
}

impl fmt::Display for ObjectKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.namespace {
            Some(ns) => write!(f, "{}/{}", ns, self.name),
            None => f.write_str(&self.name),
        }
    }
}

/// `(namespace, name)` → latest object, ordered by namespace then name.
#[derive(Debug, Clone, PartialEq)]
pub struct ListCache<R> {
    items: BTreeMap<ObjectKey, R>,
}

impl<R> Default for ListCache<R> {
    fn default() -> Self {
        Self { items: BTreeMap::new() }
    }
}

impl<R: ResourceObject> ListCache<R> {
    pub fn from_items(items: Vec<R>) -> SyncResult<Self> {
        let mut cache = Self::default();
        for item in items {
            let key =
                ObjectKey::of(&item).ok_or_else(|| SyncError::Snapshot("listed object without metadata.name".into()))?;
            cache.items.insert(key, item);
        }
        Ok(cache)
    }

    /// Lookup by bare name. Unambiguous for a single-namespace or
    /// cluster-scoped list; across namespaces it returns the first match.
    pub fn get(&self, name: &str) -> Option<&R> {
        self.items.iter().find(|(k, _)| k.name == name).map(|(_, v)| v)
    }

    pub fn get_in(&self, namespace: Option<&str>, name: &str) -> Option<&R> {
        self.items.get(&ObjectKey::new(namespace, name))
    }

    pub fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    pub fn contains_key(&self, key: &ObjectKey) -> bool {
        self.items.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.items.keys().map(|k| k.name.as_str())
    }

    pub fn keys(&self) -> impl Iterator<Item = &ObjectKey> {
        self.items.keys()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&ObjectKey, &R)> {
        self.items.iter()
    }

    pub fn values(&self) -> impl Iterator<Item = &R> {
        self.items.values()
    }
}

#[async_trait::async_trait]
impl<R: ResourceObject> ViewModel<R> for ListCache<R> {
    async fn load(fetch: &dyn FetchClient<R>, target: &WatchTarget) -> SyncResult<(Self, Cursor)> {
        let snap = fetch.list(&target.kind, target.namespace.as_deref(), target.label_selector.as_deref()).await?;
        Ok((Self::from_items(snap.items)?, snap.resource_version))
    }

    fn apply(&mut self, event: WatchEvent<R>) -> SyncResult<()> {
        let key = ObjectKey::of(&event.resource)
            .ok_or_else(|| SyncError::Apply(format!("{} event without metadata.name", event.event_type)))?;
        match event.event_type {
            // MODIFIED for a key never seen (e.g. after a server resync) is an upsert too.
            WatchEventType::Added | WatchEventType::Modified => {
                self.items.insert(key, event.resource);
            }
            WatchEventType::Deleted => {
                self.items.remove(&key);
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ItemState<R> {
    Present(R),
    /// The object does not exist (never created, or deleted).
    NotFound,
}

/// A single named object.
#[derive(Debug, Clone, PartialEq)]
pub struct ItemCache<R> {
    name: String,
    state: ItemState<R>,
}

impl<R: ResourceObject> ItemCache<R> {
    pub fn new(name: &str, item: Option<R>) -> Self {
        let state = match item {
            Some(r) => ItemState::Present(r),
            None => ItemState::NotFound,
        };
        Self { name: name.to_string(), state }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn state(&self) -> &ItemState<R> {
        &self.state
    }

    pub fn item(&self) -> Option<&R> {
        match &self.state {
            ItemState::Present(r) => Some(r),
            ItemState::NotFound => None,
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self.state, ItemState::NotFound)
    }
}

#[async_trait::async_trait]
impl<R: ResourceObject> ViewModel<R> for ItemCache<R> {
    async fn load(fetch: &dyn FetchClient<R>, target: &WatchTarget) -> SyncResult<(Self, Cursor)> {
        let name = target
            .name
            .as_deref()
            .ok_or_else(|| SyncError::Validation(format!("item watch without a name: {}", target)))?;
        let snap = fetch.get(&target.kind, target.namespace.as_deref(), name).await?;
        Ok((Self::new(name, snap.item), snap.resource_version))
    }

    fn apply(&mut self, event: WatchEvent<R>) -> SyncResult<()> {
        match event.resource.name() {
            Some(n) if n == self.name => {}
            other => {
                return Err(SyncError::Apply(format!(
                    "{} event for {:?} on item watch {}",
                    event.event_type, other, self.name
                )))
            }
        }
        self.state = match event.event_type {
            WatchEventType::Added | WatchEventType::Modified => ItemState::Present(event.resource),
            WatchEventType::Deleted => ItemState::NotFound,
        };
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn obj(name: &str, v: &str) -> serde_json::Value {
        json!({ "metadata": { "name": name, "resourceVersion": v } })
    }

    fn rv(cache: &ListCache<serde_json::Value>, name: &str) -> Option<String> {
        cache.get(name).and_then(|o| o.resource_version()).map(str::to_string)
    }

    #[test]
    fn converges_to_last_event_per_name() {
        let mut cache = ListCache::default();
        let events = vec![
            WatchEvent::added(obj("a", "1")),
            WatchEvent::added(obj("b", "2")),
            WatchEvent::added(obj("c", "3")),
            WatchEvent::modified(obj("a", "4")),
            WatchEvent::deleted(obj("b", "5")),
            WatchEvent::deleted(obj("c", "6")),
            WatchEvent::added(obj("c", "7")),
            WatchEvent::modified(obj("c", "8")),
        ];
        for ev in events {
            cache.apply(ev).expect("apply");
        }
        assert_eq!(cache.names().collect::<Vec<_>>(), vec!["a", "c"]);
        assert_eq!(rv(&cache, "a").as_deref(), Some("4"));
        assert_eq!(rv(&cache, "c").as_deref(), Some("8"));
        assert!(!cache.contains("b"));
    }

    #[test]
    fn modified_for_unseen_name_is_an_upsert() {
        let mut cache = ListCache::default();
        cache.apply(WatchEvent::modified(obj("ghost", "9"))).expect("apply");
        assert_eq!(rv(&cache, "ghost").as_deref(), Some("9"));
    }

    #[test]
    fn delete_of_unknown_name_is_harmless() {
        let mut cache = ListCache::from_items(vec![obj("a", "1")]).expect("items");
        cache.apply(WatchEvent::deleted(obj("zzz", "2"))).expect("apply");
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn nameless_event_is_rejected_without_mutation() {
        let mut cache = ListCache::from_items(vec![obj("a", "1")]).expect("items");
        let before = cache.clone();
        let err = cache.apply(WatchEvent::added(json!({ "spec": {} }))).expect_err("must fail");
        assert!(matches!(err, SyncError::Apply(_)));
        assert_eq!(cache, before);
    }

    #[test]
    fn same_name_in_different_namespaces_stays_distinct() {
        let scoped = |ns: &str, rv: &str| json!({ "metadata": { "name": "default", "namespace": ns, "resourceVersion": rv } });
        let mut cache = ListCache::from_items(vec![scoped("ns-a", "1"), scoped("ns-b", "2")]).expect("items");
        assert_eq!(cache.len(), 2);

        cache.apply(WatchEvent::deleted(scoped("ns-a", "3"))).expect("apply");
        assert_eq!(cache.len(), 1);
        assert!(cache.get_in(Some("ns-a"), "default").is_none());
        assert_eq!(cache.get_in(Some("ns-b"), "default").and_then(|o| o.resource_version()), Some("2"));
        assert_eq!(cache.keys().map(ToString::to_string).collect::<Vec<_>>(), vec!["ns-b/default"]);
    }

    #[test]
    fn item_cache_tracks_presence() {
        let mut item = ItemCache::new("x", Some(obj("x", "10")));
        item.apply(WatchEvent::modified(obj("x", "11"))).expect("apply");
        assert_eq!(item.item().and_then(|o| o.resource_version()), Some("11"));
        item.apply(WatchEvent::deleted(obj("x", "12"))).expect("apply");
        assert!(item.is_not_found());
        item.apply(WatchEvent::added(obj("x", "13"))).expect("apply");
        assert!(matches!(item.state(), ItemState::Present(_)));
    }

    #[test]
    fn item_cache_rejects_other_names() {
        let mut item = ItemCache::new("x", None);
        assert!(item.apply(WatchEvent::added(obj("y", "1"))).is_err());
        assert!(item.is_not_found());
    }
}
