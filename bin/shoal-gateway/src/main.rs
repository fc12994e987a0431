//! Shoal Gateway - stateless redirecting proxy
//!
//! A client may contact any gateway; the gateway resolves the HRW owner of
//! the object under its current cluster map and answers with a 307 carrying
//! its own id and a redirect timestamp, which the target verifies. Targets
//! join the cluster here; the gateway bumps the map version and returns the
//! updated map.

use anyhow::Context;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Redirect, Response};
use axum::routing::{any, get, post};
use axum::{Json, Router};
use clap::Parser;
use serde::Deserialize;
use shoal_cluster::{hrw_target, lom::now_ns, Smap, SmapOwner, Snode};
use shoal_common::{Bck, Error, Provider};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser, Debug)]
#[command(name = "shoal-gateway")]
#[command(about = "Shoal gateway")]
#[command(version)]
struct Args {
    /// Configuration file path
    #[arg(short, long, default_value = "/etc/shoal/gateway.toml")]
    config: String,

    /// Listen address
    #[arg(short, long)]
    listen: Option<String>,

    /// Gateway id
    #[arg(long)]
    id: Option<String>,

    /// Public URL advertised in the cluster map
    #[arg(long)]
    public_url: Option<String>,

    /// Log level
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[derive(Debug, Default, Deserialize)]
struct FileConfig {
    #[serde(default)]
    gateway: GatewaySection,
}

#[derive(Debug, Default, Deserialize)]
struct GatewaySection {
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    listen: Option<String>,
    #[serde(default)]
    public_url: Option<String>,
}

#[derive(Clone)]
struct Gateway {
    pxid: String,
    smap: Arc<SmapOwner>,
}

#[derive(Debug, Deserialize)]
struct ObjQuery {
    #[serde(default)]
    provider: Option<String>,
}

fn err_response(err: &Error) -> Response {
    let status =
        StatusCode::from_u16(err.http_status_code()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    (status, err.to_string()).into_response()
}

/// 307 to the object's HRW owner, stamped with the proxy id and redirect
/// time so the target can verify and measure the hop
async fn redirect_object(
    State(gw): State<Gateway>,
    Path((bucket, objname)): Path<(String, String)>,
    Query(query): Query<ObjQuery>,
) -> Response {
    let run = || {
        let provider = Provider::parse(query.provider.as_deref().unwrap_or_default())?;
        let bck = Bck::new(bucket.clone(), provider);
        bck.validate()?;
        let smap = gw.smap.get();
        let target = hrw_target(&bck.make_uname(&objname), &smap)?.clone();
        let url = format!(
            "{}/v1/objects/{bucket}/{objname}?provider={provider}&pxid={}&rts={}",
            target.public_url, gw.pxid,
            now_ns(),
        );
        Ok::<String, Error>(url)
    };
    match run() {
        Ok(url) => Redirect::temporary(&url).into_response(),
        Err(e) => err_response(&e),
    }
}

/// Target registration: add to the map, bump the version, return the map
async fn join_cluster(State(gw): State<Gateway>, Json(snode): Json<Snode>) -> Response {
    if snode.id.is_empty() || snode.public_url.is_empty() {
        return err_response(&Error::bad_request("join requires an id and a public url"));
    }
    let old = gw.smap.get();
    let mut next = (*old).clone();
    next.version += 1;
    let known = next.targets.insert(snode.id.clone(), Arc::new(snode.clone()));
    if let Err(e) = gw.smap.put(next) {
        return err_response(&e);
    }
    let smap = gw.smap.get();
    if known.is_none() {
        info!(tid = snode.id, version = smap.version, "target joined");
    } else {
        info!(tid = snode.id, version = smap.version, "target re-joined");
    }
    // push the updated map to every registered target
    let push = (*smap).clone();
    tokio::spawn(async move {
        let client = reqwest_client();
        for target in push.targets.values() {
            let url = format!("{}/v1/daemon/smap", target.public_url);
            if let Err(e) = client.post(&url).json(&push).send().await {
                warn!(tid = target.id, %e, "cluster map push failed");
            }
        }
    });
    Json((*smap).clone()).into_response()
}

fn reqwest_client() -> reqwest::Client {
    reqwest::Client::builder()
        .timeout(std::time::Duration::from_secs(10))
        .build()
        .expect("client")
}

async fn get_smap(State(gw): State<Gateway>) -> Json<Smap> {
    Json((*gw.smap.get()).clone())
}

fn router(gw: Gateway) -> Router {
    Router::new()
        .route("/v1/objects/{bucket}/{*objname}", any(redirect_object))
        .route("/v1/cluster/join", post(join_cluster))
        .route("/v1/cluster/smap", get(get_smap))
        .route("/v1/health", get(|| async { "ok" }))
        .with_state(gw)
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
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => FileConfig::default(),
        Err(e) => return Err(e).context("reading config file"),
    };

    let listen = args
        .listen
        .or(file.gateway.listen)
        .unwrap_or_else(|| "0.0.0.0:8080".to_string());
    let pxid = args.id.or(file.gateway.id).unwrap_or_else(|| "p1".to_string());
    let public_url = args
        .public_url
        .or(file.gateway.public_url)
        .unwrap_or_else(|| format!("http://{listen}"));

    let smap_owner = Arc::new(SmapOwner::new());
    let mut smap = Smap {
        version: 1,
        uuid: String::new(),
        targets: HashMap::new(),
        proxies: HashMap::new(),
    };
    smap.proxies
        .insert(pxid.clone(), Arc::new(Snode::new(pxid.clone(), public_url)));
    smap_owner.put(smap).expect("initial cluster map");

    let gw = Gateway {
        pxid: pxid.clone(),
        smap: smap_owner,
    };
    let listener = tokio::net::TcpListener::bind(&listen)
        .await
        .with_context(|| format!("binding {listen}"))?;
    info!(pxid, listen, "gateway is up");
    axum::serve(listener, router(gw)).await.context("serving")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn gateway_with_targets(ids: &[&str]) -> Gateway {
        let owner = Arc::new(SmapOwner::new());
        let mut smap = Smap {
            version: 1,
            ..Default::default()
        };
        for id in ids {
            smap.targets.insert(
                id.to_string(),
                Arc::new(Snode::new(*id, format!("http://{id}.local"))),
            );
        }
        smap.proxies
            .insert("p1".into(), Arc::new(Snode::new("p1", "http://gw.local")));
        owner.put(smap).unwrap();
        Gateway {
            pxid: "p1".into(),
            smap: owner,
        }
    }

    #[tokio::test]
    async fn test_redirect_carries_pxid_and_timestamp() {
        let gw = gateway_with_targets(&["t1", "t2"]);
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, router(gw)).await.unwrap();
        });

        let client = reqwest::Client::builder()
            .redirect(reqwest::redirect::Policy::none())
            .build()
            .unwrap();
        let resp = client
            .get(format!("http://{addr}/v1/objects/data/some/obj"))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status().as_u16(), 307);
        let location = resp.headers().get("location").unwrap().to_str().unwrap();
        assert!(location.contains("/v1/objects/data/some/obj"));
        assert!(location.contains("pxid=p1"));
        assert!(location.contains("rts="));
        assert!(location.starts_with("http://t1.local") || location.starts_with("http://t2.local"));
    }

    #[tokio::test]
    async fn test_redirect_is_deterministic() {
        let gw = gateway_with_targets(&["t1", "t2", "t3"]);
        let smap = gw.smap.get();
        let uname = Bck::new("data", Provider::Ais).make_uname("obj");
        let a = hrw_target(&uname, &smap).unwrap().id.clone();
        let b = hrw_target(&uname, &smap).unwrap().id.clone();
        assert_eq!(a, b);
    }

    #[tokio::test]
    async fn test_join_bumps_version() {
        let gw = gateway_with_targets(&["t1"]);
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, router(gw)).await.unwrap();
        });

        let client = reqwest::Client::new();
        let resp = client
            .post(format!("http://{addr}/v1/cluster/join"))
            .json(&Snode::new("t-new", "http://127.0.0.1:9999"))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status().as_u16(), 200);
        let smap: Smap = resp.json().await.unwrap();
        assert_eq!(smap.version, 2);
        assert!(smap.targets.contains_key("t-new"));
        assert!(smap.targets.contains_key("t1"));
    }
}
