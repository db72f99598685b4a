#![forbid(unsafe_code)]

use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Value};
use tokio::time::timeout;
use vela_api::{AdapterTransport, WatchTransport};
use vela_core::{QueueLimits, ReconnectPolicy, ResourceKind, ResourceObject, SyncError, WatchEventType, WatchTarget};
use vela_kubehub::mock::MockCluster;
use vela_store::{ItemHub, Lease, ListHub, SyncStatus, ViewModel};

fn pods() -> ResourceKind {
    ResourceKind::new("", "v1", "Pod", "pods")
}

fn obj(name: &str, rv: &str) -> Value {
    json!({ "metadata": { "name": name, "namespace": "ns1", "resourceVersion": rv } })
}

fn transport(cluster: &MockCluster) -> Arc<dyn WatchTransport<Value>> {
    Arc::new(AdapterTransport::<Value>::new(Arc::new(cluster.clone()), QueueLimits::unbounded()))
}

fn list_hub(cluster: &MockCluster) -> ListHub {
    ListHub::new(Arc::new(cluster.clone()), transport(cluster), ReconnectPolicy::disabled())
}

async fn wait_status<V: ViewModel<Value>>(lease: &Lease<Value, V>, pred: impl Fn(&SyncStatus) -> bool) {
    let mut rx = lease.watch_status();
    timeout(Duration::from_secs(2), rx.wait_for(|s| pred(s)))
        .await
        .expect("timed out waiting for status")
        .expect("status channel closed");
}

async fn wait_epoch<V: ViewModel<Value>>(lease: &Lease<Value, V>, epoch: u64) {
    let mut rx = lease.subscribe_epoch();
    timeout(Duration::from_secs(2), rx.wait_for(|e| *e >= epoch))
        .await
        .expect("timed out waiting for epoch")
        .expect("epoch channel closed");
}

fn rv_of<'a>(obj: Option<&'a Value>) -> Option<&'a str> {
    obj.and_then(|o| o.resource_version())
}

#[tokio::test]
async fn list_watch_applies_events_on_top_of_snapshot() {
    let cluster: MockCluster = MockCluster::new();
    cluster.seed_list(&pods(), Some("ns1"), vec![obj("x", "10")], "10");
    let hub = list_hub(&cluster);

    let lease = hub.acquire(WatchTarget::list(pods(), Some("ns1")));
    wait_status(&lease, |s| *s == SyncStatus::Live).await;
    assert_eq!(cluster.watch_requests()[0].cursor.as_str(), "10");

    cluster.push(WatchEventType::Modified, obj("x", "11"));
    cluster.push(WatchEventType::Added, obj("y", "12"));
    wait_epoch(&lease, 3).await;

    let view = lease.view().expect("view");
    assert_eq!(view.data.names().collect::<Vec<_>>(), vec!["x", "y"]);
    assert_eq!(rv_of(view.data.get("x")), Some("11"));
    assert_eq!(rv_of(view.data.get("y")), Some("12"));
    assert_eq!(view.cursor.as_str(), "12");
}

#[tokio::test]
async fn item_watch_reports_not_found_after_delete() {
    let cluster: MockCluster = MockCluster::new();
    cluster.seed_item(&pods(), Some("ns1"), "x", Some(obj("x", "12")), "12");
    let hub: ItemHub = ItemHub::new(Arc::new(cluster.clone()), transport(&cluster), ReconnectPolicy::disabled());

    let lease = hub.acquire(WatchTarget::item(pods(), Some("ns1"), "x"));
    wait_status(&lease, |s| *s == SyncStatus::Live).await;
    assert_eq!(rv_of(lease.view().expect("view").data.item()), Some("12"));
    assert_eq!(cluster.get_calls(), 1);
    assert_eq!(cluster.list_calls(), 0);

    cluster.push(WatchEventType::Deleted, obj("x", "13"));
    wait_epoch(&lease, 2).await;

    let view = lease.view().expect("view");
    assert!(view.data.is_not_found());
    assert!(view.data.item().is_none());
    assert_eq!(view.cursor.as_str(), "13");
}

#[tokio::test]
async fn two_consumers_share_one_list_and_one_watch() {
    let cluster: MockCluster = MockCluster::new();
    cluster.seed_list(&pods(), Some("ns1"), vec![obj("a", "1")], "1");
    let hub = list_hub(&cluster);
    let target = WatchTarget::list(pods(), Some("ns1"));

    let first = hub.acquire(target.clone());
    let second = hub.acquire(target.clone());
    wait_status(&first, |s| *s == SyncStatus::Live).await;
    wait_status(&second, |s| *s == SyncStatus::Live).await;
    assert_eq!(cluster.list_calls(), 1);
    assert_eq!(cluster.watch_calls(), 1);
    assert_eq!(hub.refs(&target), 2);

    first.release();
    assert_eq!(cluster.open_connections(), 1);
    assert_eq!(second.status(), SyncStatus::Live);
    cluster.push(WatchEventType::Added, obj("b", "2"));
    wait_epoch(&second, 2).await;
    assert!(second.view().expect("view").data.contains("b"));

    second.release();
    assert_eq!(cluster.open_connections(), 0);
    assert_eq!(hub.scopes(), 0);
    assert_eq!(second.status(), SyncStatus::Destroyed);
    assert!(second.view().is_none());
}

#[tokio::test]
async fn connection_error_fails_the_reconciler_and_stops_applying() {
    let cluster: MockCluster = MockCluster::new();
    cluster.seed_list(&pods(), Some("ns1"), vec![obj("a", "1")], "1");
    let hub = list_hub(&cluster);
    let lease = hub.acquire(WatchTarget::list(pods(), Some("ns1")));
    wait_status(&lease, |s| *s == SyncStatus::Live).await;

    cluster.push(WatchEventType::Added, obj("b", "2"));
    wait_epoch(&lease, 2).await;

    // Error followed immediately by events still sitting in the queue.
    cluster.fail_watches(SyncError::Connection("reset by peer".into()));
    cluster.push(WatchEventType::Added, obj("late", "3"));
    wait_status(&lease, |s| matches!(s, SyncStatus::Failed(_))).await;

    assert_eq!(lease.error(), Some(SyncError::Connection("reset by peer".into())));
    assert!(!lease.is_loading());
    tokio::time::sleep(Duration::from_millis(30)).await;
    let view = lease.view().expect("last view stays readable");
    assert!(!view.data.contains("late"));
    assert_eq!(view.cursor.as_str(), "2");
    assert_eq!(cluster.open_connections(), 0);
    assert_eq!(cluster.list_calls(), 1, "no retry when reconnect is off");
}

#[tokio::test]
async fn cache_converges_to_last_event_per_name() {
    let cluster: MockCluster = MockCluster::new();
    let hub = list_hub(&cluster);
    let lease = hub.acquire(WatchTarget::list(pods(), Some("ns1")));
    wait_status(&lease, |s| *s == SyncStatus::Live).await;

    let events = [
        (WatchEventType::Added, "a", "1"),
        (WatchEventType::Added, "b", "2"),
        (WatchEventType::Modified, "a", "3"),
        (WatchEventType::Added, "c", "4"),
        (WatchEventType::Deleted, "a", "5"),
        (WatchEventType::Modified, "b", "6"),
        (WatchEventType::Deleted, "c", "7"),
        (WatchEventType::Added, "a", "8"),
        (WatchEventType::Modified, "a", "9"),
    ];
    for (ty, name, rv) in events {
        cluster.push(ty, obj(name, rv));
    }
    wait_epoch(&lease, 1 + events.len() as u64).await;

    let view = lease.view().expect("view");
    assert_eq!(view.data.names().collect::<Vec<_>>(), vec!["a", "b"]);
    assert_eq!(rv_of(view.data.get("a")), Some("9"));
    assert_eq!(rv_of(view.data.get("b")), Some("6"));
    assert_eq!(view.cursor.as_str(), "9");
}

#[tokio::test]
async fn release_is_idempotent() {
    let cluster: MockCluster = MockCluster::new();
    let hub = list_hub(&cluster);
    let target = WatchTarget::list(pods(), Some("ns1"));
    let first = hub.acquire(target.clone());
    let second = hub.acquire(target.clone());
    wait_status(&first, |s| *s == SyncStatus::Live).await;

    first.release();
    first.release();
    hub.release(&first);
    assert!(first.is_released());
    assert_eq!(hub.refs(&target), 1);
    assert_eq!(cluster.open_connections(), 1);
    drop(first);
    assert_eq!(hub.refs(&target), 1);

    second.release();
    second.release();
    drop(second);
    assert_eq!(hub.scopes(), 0);
    assert_eq!(cluster.open_connections(), 0);
    assert_eq!(cluster.closed_connections(), 1);
}

#[tokio::test]
async fn one_watch_per_scope() {
    let cluster: MockCluster = MockCluster::new();
    let hub = list_hub(&cluster);
    let ns1 = WatchTarget::list(pods(), Some("ns1"));
    let ns2 = WatchTarget::list(pods(), Some("ns2"));

    let leases: Vec<_> = (0..5).map(|_| hub.acquire(ns1.clone())).collect();
    for lease in &leases {
        wait_status(lease, |s| *s == SyncStatus::Live).await;
    }
    assert_eq!(cluster.watch_calls(), 1);
    assert_eq!(cluster.open_connections(), 1);

    let other = hub.acquire(ns2.clone());
    wait_status(&other, |s| *s == SyncStatus::Live).await;
    assert_eq!(cluster.watch_calls(), 2);
    assert_eq!(cluster.open_connections(), 2);
    assert_eq!(hub.scopes(), 2);

    drop(leases);
    assert_eq!(cluster.open_connections(), 1);
    assert_eq!(cluster.watch_requests()[1].namespace.as_deref(), Some("ns2"));
}

#[tokio::test]
async fn all_namespaces_list_keeps_same_name_apart() {
    let in_ns = |ns: &str, rv: &str| json!({ "metadata": { "name": "default", "namespace": ns, "resourceVersion": rv } });
    let cluster: MockCluster = MockCluster::new();
    cluster.seed_list(&pods(), None, vec![in_ns("ns-a", "1"), in_ns("ns-b", "2")], "2");
    let hub = list_hub(&cluster);

    let lease = hub.acquire(WatchTarget::list(pods(), None));
    wait_status(&lease, |s| *s == SyncStatus::Live).await;
    assert_eq!(lease.view().expect("view").data.len(), 2);
    assert_eq!(cluster.watch_requests()[0].namespace, None);

    cluster.push(WatchEventType::Deleted, in_ns("ns-a", "3"));
    wait_epoch(&lease, 2).await;

    let view = lease.view().expect("view");
    assert_eq!(view.data.len(), 1);
    assert!(view.data.get_in(Some("ns-a"), "default").is_none());
    assert_eq!(rv_of(view.data.get_in(Some("ns-b"), "default")), Some("2"));
    assert_eq!(view.cursor.as_str(), "3");
}
