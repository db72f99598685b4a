//! Vela store: live, read-only caches of cluster resources.
//!
//! A `Reconciler` owns one cache per `WatchTarget` (snapshot + watch from the
//! snapshot's cursor); a `SubscriptionHub` shares reconcilers between
//! consumers by reference count and hands out `Lease`s.

#![forbid(unsafe_code)]

pub mod cache;
pub mod hub;
pub mod reconciler;

pub use cache::{ItemCache, ItemState, ListCache, ObjectKey, ViewModel};
pub use hub::{Lease, SubscriptionHub};
pub use reconciler::{Reconciler, SyncStatus, Synced};

pub type ListReconciler<R = serde_json::Value> = Reconciler<R, ListCache<R>>;
pub type ItemReconciler<R = serde_json::Value> = Reconciler<R, ItemCache<R>>;
pub type ListHub<R = serde_json::Value> = SubscriptionHub<R, ListCache<R>>;
pub type ItemHub<R = serde_json::Value> = SubscriptionHub<R, ItemCache<R>>;
pub type ListLease<R = serde_json::Value> = Lease<R, ListCache<R>>;
pub type ItemLease<R = serde_json::Value> = Lease<R, ItemCache<R>>;
