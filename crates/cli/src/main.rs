use std::collections::BTreeMap;
use std::str::FromStr;
use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use clap::{ArgAction, Parser, Subcommand, ValueEnum};
use serde_json::{json, Value};
use tokio::signal;
use tracing::{info, warn};
use vela_api::{AdapterTransport, RpcTransport, WatchService, WatchTransport};
use vela_core::{ResourceKind, ResourceObject, SyncConfig, WatchTarget};
use vela_kubehub::{ClusterContext, KubeClient};
use vela_store::{ItemCache, ItemHub, ItemState, Lease, ListCache, ListHub, SyncStatus, Synced, ViewModel};

#[derive(Parser, Debug)]
#[command(name = "velactl", version, about = "Vela live resource views")]
struct Cli {
    /// Output format
    #[arg(short = 'o', long = "output", value_enum, global = true, default_value_t = Output::Human)]
    output: Output,

    /// Namespace (watch: all namespaces when omitted; get: current context's)
    #[arg(long = "ns", global = true)]
    namespace: Option<String>,

    /// Label selector, e.g. "app.edp.epam.com/pipeline=build"
    #[arg(long = "selector", short = 'l', global = true)]
    selector: Option<String>,

    /// The resource is cluster-scoped
    #[arg(long = "cluster-scoped", action = ArgAction::SetTrue, global = true)]
    cluster_scoped: bool,

    /// Route the watch through the RPC subscribe/unsubscribe procedures
    #[arg(long = "via-rpc", action = ArgAction::SetTrue, global = true)]
    via_rpc: bool,

    /// Print the first synced view and exit
    #[arg(long = "once", action = ArgAction::SetTrue, global = true)]
    once: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum Output {
    Human,
    Json,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Keep a live list of a resource and print changes
    Watch {
        /// Resource key, e.g. "v1/configmaps" or "tekton.dev/v1/pipelineruns"
        key: String,
    },
    /// Keep one named object live and print each new state
    Get {
        /// Resource key, e.g. "v2.edp.epam.com/v1/codebases"
        key: String,
        name: String,
    },
}

fn init_tracing() {
    let env = std::env::var("VELA_LOG").unwrap_or_else(|_| "info".to_string());
    let filter =
        tracing_subscriber::EnvFilter::from_str(&env).unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(true).with_writer(std::io::stderr).init();
}

fn init_metrics() {
    if let Ok(addr) = std::env::var("VELA_METRICS_ADDR") {
        if let Ok(sock) = addr.parse::<std::net::SocketAddr>() {
            let builder = metrics_exporter_prometheus::PrometheusBuilder::new();
            match builder.with_http_listener(sock).install() {
                Ok(_) => info!(addr = %addr, "Prometheus metrics exporter listening"),
                Err(e) => warn!(error = %e, "failed to install metrics exporter"),
            }
        } else {
            warn!(addr = %addr, "invalid VELA_METRICS_ADDR; expected host:port");
        }
    }
}

fn transport(client: &KubeClient, cfg: &SyncConfig, via_rpc: bool) -> Arc<dyn WatchTransport<Value>> {
    let watcher = Arc::new(client.clone());
    if via_rpc {
        let service = WatchService::<Value>::new(watcher, cfg.queue, cfg.rpc_frame_capacity);
        Arc::new(RpcTransport::<Value>::new(Arc::new(service)))
    } else {
        Arc::new(AdapterTransport::<Value>::new(watcher, cfg.queue))
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    init_metrics();
    let cli = Cli::parse();
    let cfg = SyncConfig::from_env();

    let ctx = ClusterContext::infer().await?;
    let client = KubeClient::new(ctx.clone());
    let transport = transport(&client, &cfg, cli.via_rpc);
    let fetch = Arc::new(client);

    match &cli.command {
        Commands::Watch { key } => {
            let kind = resource_kind(key, cli.cluster_scoped)?;
            let ns = if kind.namespaced { cli.namespace.as_deref() } else { None };
            let mut target = WatchTarget::list(kind, ns);
            if let Some(sel) = cli.selector.as_deref() {
                target = target.with_labels(sel);
            }
            info!(target_scope = %target, via_rpc = cli.via_rpc, "velactl: watch");
            let hub: ListHub = ListHub::new(fetch, transport, cfg.reconnect);
            let lease = hub.acquire(target);
            let mut seen = BTreeMap::new();
            follow(&lease, cli.once, |view| render_list(view, &mut seen, cli.output)).await?;
        }
        Commands::Get { key, name } => {
            let kind = resource_kind(key, cli.cluster_scoped)?;
            let default_ns = ctx.default_namespace().to_string();
            let ns = kind.namespaced.then(|| cli.namespace.clone().unwrap_or(default_ns));
            let target = WatchTarget::item(kind, ns.as_deref(), name);
            info!(target_scope = %target, via_rpc = cli.via_rpc, "velactl: get");
            let hub: ItemHub = ItemHub::new(fetch, transport, cfg.reconnect);
            let lease = hub.acquire(target);
            follow(&lease, cli.once, |view| render_item(view, cli.output)).await?;
        }
    }
    Ok(())
}

fn resource_kind(key: &str, cluster_scoped: bool) -> Result<ResourceKind> {
    let kind = ResourceKind::parse_key(key)?;
    Ok(if cluster_scoped { kind.cluster_scoped() } else { kind })
}

/// Render every new view until Ctrl-C (or the first view with `once`). A
/// terminal failure releases the lease and becomes the exit error.
async fn follow<V: ViewModel<Value>>(
    lease: &Lease<Value, V>,
    once: bool,
    mut render: impl FnMut(&Synced<V>) -> Result<()>,
) -> Result<()> {
    let mut epochs = lease.subscribe_epoch();
    let mut status = lease.watch_status();
    let mut last_epoch = 0u64;

    let mut show = |view: Option<Arc<Synced<V>>>, last: &mut u64| -> Result<bool> {
        match view {
            Some(v) if v.epoch != *last => {
                *last = v.epoch;
                render(&v)?;
                Ok(true)
            }
            _ => Ok(false),
        }
    };

    // The first snapshot may have landed before the receivers were taken.
    if show(lease.view(), &mut last_epoch)? && once {
        lease.release();
        return Ok(());
    }

    let result = loop {
        tokio::select! {
            changed = epochs.changed() => {
                if changed.is_err() {
                    break Ok(());
                }
                if show(lease.view(), &mut last_epoch)? && once {
                    break Ok(());
                }
            }
            changed = status.changed() => {
                if changed.is_err() {
                    break Ok(());
                }
                let current = status.borrow_and_update().clone();
                match current {
                    SyncStatus::Live => info!(target_scope = %lease.target(), "velactl: live"),
                    SyncStatus::Reconnecting { attempt, error } => {
                        warn!(target_scope = %lease.target(), attempt, error = %error, "velactl: reconnecting")
                    }
                    SyncStatus::Failed(err) => break Err(anyhow!(err).context(format!("watching {}", lease.target()))),
                    SyncStatus::Loading | SyncStatus::Destroyed => {}
                }
            }
            _ = signal::ctrl_c() => {
                info!("Ctrl-C received; releasing watch");
                break Ok(());
            }
        }
    };
    lease.release();
    result
}

fn render_list(view: &Synced<ListCache<Value>>, seen: &mut BTreeMap<String, String>, output: Output) -> Result<()> {
    match output {
        Output::Human => {
            for line in diff_lines(&view.data, seen) {
                println!("{}", line);
            }
        }
        Output::Json => {
            let items: Vec<&Value> = view.data.values().collect();
            let doc = view_doc(view, "items", json!(items));
            println!("{}", serde_json::to_string(&doc).context("encoding view")?);
        }
    }
    Ok(())
}

/// `+ ns/name` for new or changed objects, `- ns/name` for removed ones.
/// `seen` tracks ns/name -> resourceVersion between calls.
fn diff_lines(cache: &ListCache<Value>, seen: &mut BTreeMap<String, String>) -> Vec<String> {
    let mut lines = Vec::new();
    let mut next = BTreeMap::new();
    for (key, obj) in cache.iter() {
        let key = key.to_string();
        let rv = obj.resource_version().unwrap_or_default().to_string();
        if seen.get(&key) != Some(&rv) {
            lines.push(format!("+ {:<40} rv={:<10} age={}", key, rv, render_age(obj)));
        }
        next.insert(key, rv);
    }
    for key in seen.keys() {
        if !next.contains_key(key) {
            lines.push(format!("- {}", key));
        }
    }
    *seen = next;
    lines
}

fn render_item(view: &Synced<ItemCache<Value>>, output: Output) -> Result<()> {
    match output {
        Output::Human => match view.data.state() {
            ItemState::Present(obj) => {
                println!("= {} rv={} age={}", json_key(obj), obj.resource_version().unwrap_or("-"), render_age(obj))
            }
            ItemState::NotFound => println!("! {} not found (cursor {})", view.data.name(), view.cursor),
        },
        Output::Json => {
            let doc = view_doc(view, "item", json!(view.data.item()));
            println!("{}", serde_json::to_string(&doc).context("encoding view")?);
        }
    }
    Ok(())
}

fn view_doc<V>(view: &Synced<V>, field: &str, payload: Value) -> Value {
    let mut doc = json!({ "epoch": view.epoch, "cursor": view.cursor, "synced_at": view.synced_at });
    doc[field] = payload;
    doc
}

fn render_age(obj: &Value) -> String {
    let created = obj
        .get("metadata")
        .and_then(|m| m.get("creationTimestamp"))
        .and_then(|v| v.as_str())
        .and_then(|s| chrono::DateTime::parse_from_rfc3339(s).ok());
    let Some(created) = created else { return "-".to_string() };
    let mut secs = (chrono::Utc::now().timestamp() - created.timestamp()).max(0) as u64;
    let days = secs / 86_400;
    secs %= 86_400;
    let hours = secs / 3600;
    secs %= 3600;
    let mins = secs / 60;
    secs %= 60;
    if days > 0 {
        format!("{}d{}h", days, hours)
    } else if hours > 0 {
        format!("{}h{}m", hours, mins)
    } else if mins > 0 {
        format!("{}m", mins)
    } else {
        format!("{}s", secs)
    }
}

fn json_key(v: &Value) -> String {
    match (v.namespace(), v.name()) {
        (Some(ns), Some(name)) => format!("{}/{}", ns, name),
        (None, Some(name)) => name.to_string(),
        _ => "<unnamed>".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cm(name: &str, rv: &str) -> Value {
        json!({ "metadata": { "name": name, "namespace": "edp", "resourceVersion": rv } })
    }

    #[test]
    fn diff_reports_changes_and_removals() {
        let mut seen = BTreeMap::new();
        let first = ListCache::from_items(vec![cm("a", "1"), cm("b", "2")]).expect("items");
        let lines = diff_lines(&first, &mut seen);
        assert_eq!(lines.len(), 2);
        assert!(lines[0].starts_with("+ edp/a"));

        let second = ListCache::from_items(vec![cm("a", "1"), cm("c", "3")]).expect("items");
        let lines = diff_lines(&second, &mut seen);
        assert_eq!(lines.len(), 2);
        assert!(lines[0].starts_with("+ edp/c"));
        assert_eq!(lines[1], "- edp/b");
        assert!(diff_lines(&second, &mut seen).is_empty());
    }

    #[test]
    fn json_view_carries_sync_time() {
        let view = Synced {
            data: ListCache::from_items(vec![cm("a", "1")]).expect("items"),
            cursor: "1".into(),
            epoch: 3,
            synced_at: chrono::DateTime::parse_from_rfc3339("2026-01-02T03:04:05Z").expect("ts").with_timezone(&chrono::Utc),
        };
        let doc = view_doc(&view, "items", json!(view.data.values().collect::<Vec<_>>()));
        assert_eq!(doc["epoch"], 3);
        assert_eq!(doc["cursor"], "1");
        assert_eq!(doc["synced_at"], "2026-01-02T03:04:05Z");
        assert_eq!(doc["items"][0]["metadata"]["name"], "a");
    }

    #[test]
    fn keys_and_ages() {
        assert_eq!(json_key(&cm("a", "1")), "edp/a");
        assert_eq!(json_key(&json!({ "metadata": { "name": "node-1" } })), "node-1");
        assert_eq!(render_age(&cm("a", "1")), "-");
        let old = json!({ "metadata": { "name": "x", "creationTimestamp": "2020-01-01T00:00:00Z" } });
        assert!(render_age(&old).ends_with('h'));
    }

    #[test]
    fn cli_parses_flags() {
        let cli = Cli::parse_from(["velactl", "--ns", "edp", "-o", "json", "--via-rpc", "get", "v1/configmaps", "cfg"]);
        assert_eq!(cli.output, Output::Json);
        assert!(cli.via_rpc);
        assert!(matches!(cli.command, Commands::Get { ref name, .. } if name == "cfg"));
        assert!(resource_kind("bad", false).is_err());
        assert!(!resource_kind("v1/nodes", true).expect("kind").namespaced);
    }
}
