//! Shoal Target - storage node daemon
//!
//! Serves object I/O on its mountpaths, participates in the intra-cluster
//! object stream, and rebalances ownership when membership or mountpaths
//! change.

mod api;
mod cloud;
mod ec;
mod getobj;
mod handlers;
mod putobj;
mod rebalance;
mod target;
#[cfg(test)]
mod tests;

use anyhow::{bail, Context};
use clap::Parser;
use handlers::{router, setup_rx, AppState};
use rebalance::RebManager;
use serde::Deserialize;
use shoal_cluster::{Smap, Snode};
use shoal_common::Config;
use shoal_fs::MountpathRegistry;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use target::Target;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser, Debug)]
#[command(name = "shoal-target")]
#[command(about = "Shoal storage target")]
#[command(version)]
struct Args {
    /// Configuration file path
    #[arg(short, long, default_value = "/etc/shoal/target.toml")]
    config: String,

    /// Listen address
    #[arg(short, long)]
    listen: Option<String>,

    /// Target id; generated when not set
    #[arg(long)]
    id: Option<String>,

    /// Public URL advertised to the cluster (derived from listen if unset)
    #[arg(long)]
    public_url: Option<String>,

    /// Mountpath directories
    #[arg(long)]
    mountpath: Vec<String>,

    /// Gateway to register with
    #[arg(long)]
    proxy_url: Option<String>,

    /// Log level
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[derive(Debug, Default, Deserialize)]
struct FileConfig {
    #[serde(default)]
    target: TargetSection,
    #[serde(default)]
    cluster: Config,
}

#[derive(Debug, Default, Deserialize)]
struct TargetSection {
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    listen: Option<String>,
    #[serde(default)]
    public_url: Option<String>,
    #[serde(default)]
    mountpaths: Vec<String>,
    #[serde(default)]
    proxy_url: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::try_new(&args.log_level)?)
        .with(tracing_subscriber::fmt::layer())
        .init();

    let file: FileConfig = match std::fs::read_to_string(&args.config) {
        Ok(raw) => toml::from_str(&raw).with_context(|| format!("parsing {}", args.config))?,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            warn!(config = args.config, "no config file, using defaults");
            FileConfig::default()
        }
        Err(e) => return Err(e).context("reading config file"),
    };

    let listen = args
        .listen
        .or(file.target.listen)
        .unwrap_or_else(|| "0.0.0.0:8081".to_string());
    let tid = args
        .id
        .or(file.target.id)
        .unwrap_or_else(|| format!("t-{}", &uuid::Uuid::new_v4().simple().to_string()[..12]));
    let public_url = args
        .public_url
        .or(file.target.public_url)
        .unwrap_or_else(|| format!("http://{listen}"));

    let registry = Arc::new(MountpathRegistry::new());
    let mut mountpaths = args.mountpath;
    mountpaths.extend(file.target.mountpaths);
    for path in &mountpaths {
        registry
            .add(path)
            .with_context(|| format!("registering mountpath {path}"))?;
    }
    if registry.num_avail() == 0 {
        bail!("no mountpaths configured; pass --mountpath or set target.mountpaths");
    }

    let snode = Snode::new(tid.clone(), public_url);
    let t = Target::new(snode.clone(), file.cluster, registry, cloud::MockCloud::new())
        .context("initializing target")?;
    setup_rx(&t).context("registering transport handlers")?;
    let reb = RebManager::new(Arc::clone(&t));

    // single-node map until a gateway hands us the real one
    let mut smap = Smap {
        version: 1,
        uuid: String::new(),
        targets: HashMap::new(),
        proxies: HashMap::new(),
    };
    smap.targets.insert(tid.clone(), Arc::new(snode.clone()));
    t.smap.put(smap).expect("initial cluster map");

    match t.refresh_cap() {
        Ok((used, oos)) => info!(used, oos, "capacity scanned"),
        Err(e) => warn!(%e, "capacity scan failed"),
    }
    spawn_cap_housekeeping(&t);
    spawn_mountpath_listener(&t, &reb);
    if let Some(proxy_url) = args.proxy_url.or(file.target.proxy_url) {
        spawn_registration(&t, proxy_url);
    }

    let app = router(AppState {
        t: Arc::clone(&t),
        reb,
    });
    let listener = tokio::net::TcpListener::bind(&listen)
        .await
        .with_context(|| format!("binding {listen}"))?;
    info!(tid, listen, mountpaths = t.mountpaths.num_avail(), "target is up");
    axum::serve(listener, app).await.context("serving")
}

fn spawn_cap_housekeeping(t: &Arc<Target>) {
    let t = Arc::clone(t);
    tokio::spawn(async move {
        let period = Duration::from_secs(t.config.capacity.period_secs.max(1));
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            ticker.tick().await;
            if let Err(e) = t.refresh_cap() {
                warn!(%e, "capacity scan failed");
            }
        }
    });
}

/// Mountpath transitions (including health-checker disables) open the local
/// GFN window and kick a resilver
fn spawn_mountpath_listener(t: &Arc<Target>, reb: &Arc<RebManager>) {
    let mut events = t.mountpaths.subscribe();
    let t = Arc::clone(t);
    let reb = Arc::clone(reb);
    tokio::spawn(async move {
        while let Ok(event) = events.recv().await {
            info!(mountpath = %event.mountpath(), "mountpath event");
            t.local_gfn.activate();
            let t2 = Arc::clone(&t);
            let reb2 = Arc::clone(&reb);
            tokio::spawn(async move {
                reb2.run_resilver().await;
                tokio::time::sleep(Duration::from_secs(t2.config.rebalance.grace_secs)).await;
                t2.local_gfn.deactivate();
            });
        }
    });
}

/// Register with the gateway, retrying with a fixed backoff; transient
/// refusals are expected while the cluster comes up
fn spawn_registration(t: &Arc<Target>, proxy_url: String) {
    let t = Arc::clone(t);
    tokio::spawn(async move {
        let url = format!("{}/v1/cluster/join", proxy_url.trim_end_matches('/'));
        for attempt in 1..=t.config.timeout.join_retries {
            match t.client.post(&url).json(&t.snode).send().await {
                Ok(resp) if resp.status().is_success() => match resp.json::<Smap>().await {
                    Ok(smap) => {
                        if let Err(e) = t.smap.put(smap) {
                            warn!(%e, "joined but could not install cluster map");
                        } else {
                            info!(proxy_url, "registered with gateway");
                        }
                        return;
                    }
                    Err(e) => warn!(%e, "join response unreadable"),
                },
                Ok(resp) => warn!(status = %resp.status(), attempt, "join refused"),
                Err(e) => warn!(%e, attempt, "join attempt failed"),
            }
            tokio::time::sleep(Duration::from_secs(1)).await;
        }
        error!(proxy_url, "giving up on gateway registration");
    });
}
