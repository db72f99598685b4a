//! Runtime knobs, read from `VELA_*` environment variables.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::warn;

/// What the event queue does once `capacity` events are buffered.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "kebab-case")]
pub enum OverflowPolicy {
    /// Stop accepting events and fail the stream with `SyncError::Overflow`.
    #[default]
    Fail,
    /// Evict the oldest buffered event and keep the stream open. No resync
    /// follows, so a cache fed by the stream can diverge from the cluster
    /// (an evicted DELETED leaves its object behind) until the next snapshot.
    DropOldest,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct QueueLimits {
    /// `None` means unbounded.
    pub capacity: Option<usize>,
    pub overflow: OverflowPolicy,
}

impl QueueLimits {
    pub fn unbounded() -> Self {
        Self { capacity: None, overflow: OverflowPolicy::Fail }
    }

    pub fn bounded(capacity: usize, overflow: OverflowPolicy) -> Self {
        Self { capacity: Some(capacity.max(1)), overflow }
    }
}

impl Default for QueueLimits {
    fn default() -> Self {
        Self::bounded(2048, OverflowPolicy::Fail)
    }
}

/// Reconnect after a failed watch, always from a fresh snapshot.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct ReconnectPolicy {
    pub enabled: bool,
    pub initial_backoff_ms: u64,
    pub max_backoff_secs: u64,
    pub max_attempts: Option<u32>,
}

impl ReconnectPolicy {
    pub fn disabled() -> Self {
        Self { enabled: false, ..Self::default() }
    }

    pub fn with_backoff(initial: Duration, max: Duration) -> Self {
        Self {
            enabled: true,
            initial_backoff_ms: initial.as_millis() as u64,
            max_backoff_secs: max.as_secs(),
            max_attempts: None,
        }
    }

    /// Whether attempt number `attempt` (1-based) may run.
    pub fn allows(&self, attempt: u32) -> bool {
        self.enabled && self.max_attempts.map(|m| attempt <= m).unwrap_or(true)
    }

    /// `initial * 2^(attempt-1)`, capped at the max backoff.
    pub fn delay(&self, attempt: u32) -> Duration {
        let initial = Duration::from_millis(self.initial_backoff_ms);
        let max = Duration::from_secs(self.max_backoff_secs).max(initial);
        let shift = attempt.saturating_sub(1).min(20);
        initial.saturating_mul(1u32 << shift).min(max)
    }
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self { enabled: false, initial_backoff_ms: 500, max_backoff_secs: 30, max_attempts: None }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct SyncConfig {
    pub queue: QueueLimits,
    pub reconnect: ReconnectPolicy,
    /// Frames buffered per RPC subscription before the server stops pulling.
    pub rpc_frame_capacity: usize,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self { queue: QueueLimits::default(), reconnect: ReconnectPolicy::default(), rpc_frame_capacity: 256 }
    }
}

impl SyncConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from an arbitrary key lookup; unparsable values keep the default.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut cfg = Self::default();

        if let Some(cap) = parse::<usize>(&lookup, "VELA_QUEUE_CAP") {
            cfg.queue.capacity = if cap == 0 { None } else { Some(cap) };
        }
        if let Some(v) = lookup("VELA_QUEUE_OVERFLOW") {
            match v.trim() {
                "fail" => cfg.queue.overflow = OverflowPolicy::Fail,
                "drop-oldest" => cfg.queue.overflow = OverflowPolicy::DropOldest,
                other => warn!(value = %other, "invalid VELA_QUEUE_OVERFLOW; expected fail or drop-oldest"),
            }
        }
        if let Some(v) = lookup("VELA_RECONNECT") {
            cfg.reconnect.enabled = matches!(v.trim(), "1" | "true" | "yes" | "on");
        }
        if let Some(ms) = parse::<u64>(&lookup, "VELA_WATCH_BACKOFF_INITIAL_MS") {
            cfg.reconnect.initial_backoff_ms = ms;
        }
        if let Some(secs) = parse::<u64>(&lookup, "VELA_WATCH_BACKOFF_MAX_SECS") {
            cfg.reconnect.max_backoff_secs = secs;
        }
        if let Some(n) = parse::<u32>(&lookup, "VELA_RECONNECT_MAX_ATTEMPTS") {
            cfg.reconnect.max_attempts = Some(n);
        }
        if let Some(n) = parse::<usize>(&lookup, "VELA_RPC_FRAME_CAP") {
            cfg.rpc_frame_capacity = n.max(1);
        }
        cfg
    }
}

fn parse<T: std::str::FromStr>(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Option<T> {
    let raw = lookup(key)?;
    match raw.trim().parse::<T>() {
        Ok(v) => Some(v),
        Err(_) => {
            warn!(key = %key, value = %raw, "ignoring unparsable config value");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect();
        move |k| map.get(k).cloned()
    }

    #[test]
    fn defaults_without_env() {
        let cfg = SyncConfig::from_lookup(|_| None);
        assert_eq!(cfg, SyncConfig::default());
        assert_eq!(cfg.queue.capacity, Some(2048));
        assert!(!cfg.reconnect.enabled);
    }

    #[test]
    fn reads_overrides() {
        let cfg = SyncConfig::from_lookup(lookup(&[
            ("VELA_QUEUE_CAP", "0"),
            ("VELA_QUEUE_OVERFLOW", "drop-oldest"),
            ("VELA_RECONNECT", "true"),
            ("VELA_WATCH_BACKOFF_INITIAL_MS", "100"),
            ("VELA_WATCH_BACKOFF_MAX_SECS", "5"),
            ("VELA_RECONNECT_MAX_ATTEMPTS", "3"),
        ]));
        assert_eq!(cfg.queue.capacity, None);
        assert_eq!(cfg.queue.overflow, OverflowPolicy::DropOldest);
        assert!(cfg.reconnect.enabled);
        assert_eq!(cfg.reconnect.initial_backoff_ms, 100);
        assert_eq!(cfg.reconnect.max_backoff_secs, 5);
        assert_eq!(cfg.reconnect.max_attempts, Some(3));
    }

    #[test]
    fn bad_values_keep_defaults() {
        let cfg = SyncConfig::from_lookup(lookup(&[("VELA_QUEUE_CAP", "lots"), ("VELA_QUEUE_OVERFLOW", "explode")]));
        assert_eq!(cfg.queue, QueueLimits::default());
    }

    #[test]
    fn backoff_doubles_and_caps() {
        let p = ReconnectPolicy::with_backoff(Duration::from_millis(100), Duration::from_secs(1));
        assert_eq!(p.delay(1), Duration::from_millis(100));
        assert_eq!(p.delay(2), Duration::from_millis(200));
        assert_eq!(p.delay(4), Duration::from_millis(800));
        assert_eq!(p.delay(5), Duration::from_secs(1));
        assert_eq!(p.delay(60), Duration::from_secs(1));
    }

    #[test]
    fn attempts_are_bounded_when_configured() {
        let mut p = ReconnectPolicy::with_backoff(Duration::from_millis(10), Duration::from_secs(1));
        assert!(p.allows(100));
        p.max_attempts = Some(2);
        assert!(p.allows(2));
        assert!(!p.allows(3));
        assert!(!ReconnectPolicy::disabled().allows(1));
    }
}
