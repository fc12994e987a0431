//! Object and daemon HTTP handlers
//!
//! Every object operation follows the same skeleton: parse the path and
//! provider, verify the gateway redirect, construct a LOM, take the
//! appropriate object lock, execute, then fire the asynchronous mirror and
//! EC hooks. Internal reads (GFN GETs, silent HEAD broadcasts) skip the
//! redirect check.

use crate::api;
use crate::getobj::{self, cloud_bck};
use crate::putobj::{put_mirror, PutObj};
use crate::rebalance::RebManager;
use crate::target::Target;
use crate::{ec, rebalance};
use axum::body::Body;
use axum::extract::{Path, Query, State};
use axum::http::{header, HeaderMap, Method, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, on, post, MethodFilter};
use axum::{Json, Router};
use bytes::Bytes;
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use shoal_cluster::{lom::now_ns, Bmd, Lom, ReadGuard, Smap};
use shoal_common::{access, BckProps, Cksum, CksumType, Error, Provider, Result};
use shoal_fs::WorkfileTag;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use tokio::io::AsyncReadExt;
use tracing::{info, warn};

#[derive(Clone)]
pub struct AppState {
    pub t: Arc<Target>,
    pub reb: Arc<RebManager>,
}

/// Register the intra-cluster receive handlers (rebalance, EC slices)
pub fn setup_rx(t: &Arc<Target>) -> Result<()> {
    t.recv_registry.register(
        rebalance::REB_TRNAME,
        Arc::new(rebalance::RebReceiver { t: Arc::clone(t) }),
    )?;
    t.recv_registry.register(
        ec::EC_TRNAME,
        Arc::new(ec::EcReceiver { t: Arc::clone(t) }),
    )?;
    Ok(())
}

#[must_use]
pub fn router(state: AppState) -> Router {
    let transport = shoal_transport::router(Arc::clone(&state.t.recv_registry));
    Router::new()
        .route(
            "/v1/objects/{bucket}/{*objname}",
            on(MethodFilter::GET, obj_get)
                .on(MethodFilter::HEAD, obj_head)
                .on(MethodFilter::PUT, obj_put)
                .on(MethodFilter::DELETE, obj_delete),
        )
        .route("/v1/buckets", get(list_buckets))
        .route(
            "/v1/buckets/{bucket}",
            on(MethodFilter::PUT, create_bucket).on(MethodFilter::HEAD, head_bucket),
        )
        .route("/v1/ec/slices/{bucket}/{*objname}", get(get_slice))
        .route("/v1/daemon/smap", post(install_smap))
        .route("/v1/daemon/bmd", post(install_bmd))
        .route("/v1/daemon/mountpaths", post(mountpath_action))
        .route("/v1/daemon/prefetch", post(prefetch))
        .route("/v1/health", get(|| async { "ok" }))
        .route("/v1/daemon/stats", get(daemon_stats))
        .with_state(state)
        .merge(transport)
}

#[derive(Debug, Default, Deserialize)]
struct ObjQuery {
    #[serde(default)]
    provider: Option<String>,
    #[serde(default)]
    pxid: Option<String>,
    #[serde(default)]
    rts: Option<String>,
    #[serde(default)]
    gfn: Option<String>,
    #[serde(default)]
    silent: Option<String>,
    #[serde(default)]
    evict: Option<String>,
}

impl ObjQuery {
    fn provider(&self) -> Result<Provider> {
        Provider::parse(self.provider.as_deref().unwrap_or_default())
    }

    fn is_gfn(&self) -> bool {
        self.gfn.as_deref().is_some_and(api::parse_bool)
    }

    fn is_silent(&self) -> bool {
        self.silent.as_deref().is_some_and(api::parse_bool)
    }

    fn is_evict(&self) -> bool {
        self.evict.as_deref().is_some_and(api::parse_bool)
    }
}

fn err_response(err: &Error) -> Response {
    let status =
        StatusCode::from_u16(err.http_status_code()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    (status, err.to_string()).into_response()
}

/// The request must have been redirected by a known gateway
fn verify_redirect(t: &Target, query: &ObjQuery, method: &Method) -> Result<()> {
    let Some(pxid) = query.pxid.as_deref() else {
        return Err(Error::bad_request(format!(
            "{method} object requests are expected to be redirected"
        )));
    };
    if t.smap.get().get_proxy(pxid).is_none() {
        return Err(Error::SmapOutOfSync(format!(
            "{method} request from unknown proxy {pxid}"
        )));
    }
    if let Some(rts) = query.rts.as_deref().and_then(|v| v.parse::<i64>().ok()) {
        let delta = now_ns() - rts;
        if delta > 0 {
            t.stats.redirect_latency_ns.fetch_add(delta, Ordering::Relaxed);
        }
    }
    Ok(())
}

fn attr_headers(lom: &Lom) -> [(&'static str, String); 4] {
    let cksum = lom.cksum();
    [
        (api::HDR_CKSUM_TYPE, cksum.ty.as_str().into()),
        (api::HDR_CKSUM_VALUE, cksum.value),
        (api::HDR_VERSION, lom.version().into()),
        (api::HDR_ATIME, lom.atime_ns().to_string()),
    ]
}

/// Stream the object file while holding the shared lock
fn file_body(t: Arc<Target>, guard: ReadGuard, mut file: tokio::fs::File, size: i64) -> Body {
    Body::from_stream(async_stream::stream! {
        let _guard = guard;
        let mut buf = t.mem.alloc_default();
        let mut left = size;
        while left > 0 {
            let want = buf.len().min(left as usize);
            match file.read(&mut buf[..want]).await {
                Ok(0) => break,
                Ok(n) => {
                    left -= n as i64;
                    yield Ok::<Bytes, std::io::Error>(Bytes::copy_from_slice(&buf[..n]));
                }
                Err(e) => {
                    yield Err(e);
                    break;
                }
            }
        }
    })
}

async fn obj_get(
    State(state): State<AppState>,
    Path((bucket, objname)): Path<(String, String)>,
    Query(query): Query<ObjQuery>,
) -> Response {
    let t = &state.t;
    let is_gfn = query.is_gfn();
    let run = async {
        let provider = query.provider()?;
        if !is_gfn {
            verify_redirect(t, &query, &Method::GET)?;
        }
        t.stats.get_n.fetch_add(1, Ordering::Relaxed);
        let bck = shoal_common::Bck::new(bucket.clone(), provider);
        getobj::get_object(t, bck, &objname, is_gfn).await
    };
    match run.await {
        Ok((guard, lom)) => {
            let file = match tokio::fs::File::open(&lom.fqn).await {
                Ok(file) => file,
                Err(e) => {
                    let err = Error::Io(e);
                    t.fs_error(&err, &lom.fqn);
                    return err_response(&err);
                }
            };
            let mut response = Response::builder()
                .status(StatusCode::OK)
                .header(header::CONTENT_TYPE, "application/octet-stream")
                .header(header::CONTENT_LENGTH, lom.size());
            for (name, value) in attr_headers(&lom) {
                response = response.header(name, value);
            }
            let size = lom.size();
            response
                .body(file_body(Arc::clone(t), guard, file, size))
                .unwrap_or_else(|e| {
                    err_response(&Error::internal(e.to_string()))
                })
        }
        Err(e) => err_response(&e),
    }
}

async fn obj_put(
    State(state): State<AppState>,
    Path((bucket, objname)): Path<(String, String)>,
    Query(query): Query<ObjQuery>,
    headers: HeaderMap,
    body: Body,
) -> Response {
    let t = &state.t;
    let run = async {
        let provider = query.provider()?;
        verify_redirect(t, &query, &Method::PUT)?;
        t.check_oos()?;
        t.stats.put_n.fetch_add(1, Ordering::Relaxed);

        let bck = shoal_common::Bck::new(bucket.clone(), provider);
        let uname = bck.make_uname(&objname);
        let _guard = t.locks.lock_excl(&uname).await;

        let lom = t.lom(bck, &objname)?;
        lom.props.allow(access::PUT)?;
        let mut po = PutObj::new(t, lom, WorkfileTag::Put)?;
        po.expected_cksum = parse_content_cksum(&headers);
        let stream = body
            .into_data_stream()
            .map(|res| res.map_err(std::io::Error::other));
        po.write_stream(Box::pin(stream)).await?;
        po.finalize().await?;
        Ok(po.lom)
    };
    match run.await {
        Ok(lom) => {
            put_mirror(t, &lom);
            ec::on_put(t, &lom);
            let mut response = Response::builder().status(StatusCode::OK);
            for (name, value) in attr_headers(&lom) {
                response = response.header(name, value);
            }
            response.body(Body::empty()).unwrap_or_else(|e| {
                err_response(&Error::internal(e.to_string()))
            })
        }
        Err(e) => err_response(&e),
    }
}

fn parse_content_cksum(headers: &HeaderMap) -> Option<Cksum> {
    let raw = headers.get(api::HDR_CONTENT_CKSUM)?.to_str().ok()?;
    let (ty, value) = raw.split_once(':')?;
    let ty = CksumType::parse(ty);
    if ty == CksumType::None || value.is_empty() {
        return None;
    }
    Some(Cksum::new(ty, value))
}

async fn obj_delete(
    State(state): State<AppState>,
    Path((bucket, objname)): Path<(String, String)>,
    Query(query): Query<ObjQuery>,
) -> Response {
    let t = &state.t;
    let run = async {
        let provider = query.provider()?;
        verify_redirect(t, &query, &Method::DELETE)?;
        t.stats.delete_n.fetch_add(1, Ordering::Relaxed);

        let bck = shoal_common::Bck::new(bucket.clone(), provider);
        let uname = bck.make_uname(&objname);
        let _guard = t.locks.lock_excl(&uname).await;

        let mut lom = t.lom(bck.clone(), &objname)?;
        lom.props.allow(access::DELETE)?;
        let evict = query.is_evict();
        let cloud_backed = lom.props.provider.is_cloud() || lom.props.backend_bck.is_some();

        let mut cloud_err: Option<Error> = None;
        if cloud_backed && !evict {
            if let Err(e) = t.cloud.delete_obj(&cloud_bck(&lom), &objname).await {
                cloud_err = Some(e);
            }
        }
        let existed = match lom.load(&t.lom_cache) {
            Ok(()) => {
                lom.delete_all(&t.lom_cache)?;
                true
            }
            Err(Error::NotFound { .. }) => false,
            Err(e) => return Err(e),
        };
        ec::cleanup(t, &lom.bck, &objname);

        if let Some(e) = cloud_err {
            return Err(e);
        }
        if !existed && !cloud_backed {
            return Err(Error::NotFound {
                bucket: bck.to_string(),
                objname: objname.clone(),
            });
        }
        Ok(())
    };
    match run.await {
        Ok(()) => StatusCode::NO_CONTENT.into_response(),
        Err(e) => err_response(&e),
    }
}

async fn obj_head(
    State(state): State<AppState>,
    Path((bucket, objname)): Path<(String, String)>,
    Query(query): Query<ObjQuery>,
) -> Response {
    let t = &state.t;
    let silent = query.is_silent();
    let run = async {
        let provider = query.provider()?;
        if !silent {
            verify_redirect(t, &query, &Method::HEAD)?;
        }
        t.stats.head_n.fetch_add(1, Ordering::Relaxed);

        let bck = shoal_common::Bck::new(bucket.clone(), provider);
        let mut lom = t.lom(bck.clone(), &objname)?;
        lom.props.allow(access::HEAD)?;
        let uname = lom.uname();
        let _guard = t.locks.lock_shared(&uname).await;

        match lom.load(&t.lom_cache) {
            Ok(()) => Ok((lom, true)),
            Err(e @ Error::NotFound { .. }) => {
                let cloud_backed =
                    lom.props.provider.is_cloud() || lom.props.backend_bck.is_some();
                if silent || !cloud_backed {
                    return Err(e);
                }
                // not cached: answer from the authoritative store
                let meta = t.cloud.head_obj(&cloud_bck(&lom), &objname).await?;
                lom.set_size(meta.size);
                lom.set_cksum(meta.cksum);
                lom.set_version(meta.version);
                Ok((lom, false))
            }
            Err(e) => Err(e),
        }
    };
    match run.await {
        Ok((lom, present)) => {
            let mut response = Response::builder()
                .status(StatusCode::OK)
                .header(header::CONTENT_LENGTH, lom.size())
                .header(api::HDR_PRESENT, present.to_string());
            for (name, value) in attr_headers(&lom) {
                response = response.header(name, value);
            }
            response.body(Body::empty()).unwrap_or_else(|e| {
                err_response(&Error::internal(e.to_string()))
            })
        }
        Err(e) => err_response(&e),
    }
}

#[derive(Serialize)]
struct BucketNames {
    ais: Vec<String>,
    cloud: Vec<String>,
}

async fn list_buckets(State(state): State<AppState>) -> Response {
    let t = &state.t;
    let ais = t.bmd.get().ais_bucket_names();
    let cloud = match t.cloud.list_buckets().await {
        Ok(names) => names,
        Err(e) => {
            warn!(%e, "cloud bucket listing failed");
            Vec::new()
        }
    };
    Json(BucketNames { ais, cloud }).into_response()
}

async fn create_bucket(
    State(state): State<AppState>,
    Path(bucket): Path<String>,
    Query(query): Query<ObjQuery>,
    props: Option<Json<BckProps>>,
) -> Response {
    let t = &state.t;
    let run = async {
        let provider = query.provider()?;
        if provider.is_cloud() {
            return Err(Error::bad_request("cloud buckets are created in the cloud"));
        }
        let bck = shoal_common::Bck::new(bucket.clone(), provider);
        bck.validate()?;
        let props = props.map_or_else(BckProps::default, |Json(p)| p);

        let mut bmd = (*t.bmd.get()).clone();
        bmd.version += 1;
        bmd.add(&bck, props)?;
        t.bmd.put(bmd)?;
        info!(%bck, "bucket created");
        Ok(())
    };
    match run.await {
        Ok(()) => StatusCode::CREATED.into_response(),
        Err(e) => err_response(&e),
    }
}

async fn head_bucket(
    State(state): State<AppState>,
    Path(bucket): Path<String>,
    Query(query): Query<ObjQuery>,
) -> Response {
    let t = &state.t;
    let run = async {
        let provider = query.provider()?;
        let bck = shoal_common::Bck::new(bucket.clone(), provider);
        let mut props = t.bmd.get().resolve(&bck)?;
        if provider.is_cloud() {
            // confirm with the authoritative store, which also owns the
            // versioning switch
            let cloud_props = t.cloud.head_bucket(&bck).await?;
            props.versioning.enabled = cloud_props.versioning;
        }
        Ok(props)
    };
    match run.await {
        Ok(props) => Json(props).into_response(),
        Err(e) => err_response(&e),
    }
}

async fn get_slice(
    State(state): State<AppState>,
    Path((bucket, objname)): Path<(String, String)>,
    Query(query): Query<ObjQuery>,
) -> Response {
    let t = &state.t;
    let run = async {
        let provider = query.provider()?;
        let bck = shoal_common::Bck::new(bucket.clone(), provider);
        ec::load_slice(t, &bck, &objname)?.ok_or(Error::NotFound {
            bucket: bck.to_string(),
            objname: objname.clone(),
        })
    };
    match run.await {
        Ok((meta, shard)) => {
            let encoded = serde_json::to_string(&meta).unwrap_or_default();
            ([(api::HDR_SLICE_META, encoded)], shard).into_response()
        }
        Err(e) => err_response(&e),
    }
}

async fn install_smap(State(state): State<AppState>, Json(smap): Json<Smap>) -> Response {
    let t = &state.t;
    let old = t.smap.get();
    let membership_changed = {
        let mut old_ids: Vec<&String> = old.targets.keys().collect();
        let mut new_ids: Vec<&String> = smap.targets.keys().collect();
        old_ids.sort();
        new_ids.sort();
        old_ids != new_ids
    };
    if let Err(e) = t.smap.put(smap) {
        return err_response(&e);
    }
    let current = t.smap.get();
    info!(version = current.version, targets = current.count_targets(), "cluster map installed");
    if membership_changed && !old.targets.is_empty() {
        t.global_gfn.activate(t.config.gfn.after_join());
        let reb = Arc::clone(&state.reb);
        tokio::spawn(async move { reb.restart_global(current).await });
    }
    StatusCode::OK.into_response()
}

async fn install_bmd(State(state): State<AppState>, Json(bmd): Json<Bmd>) -> Response {
    match state.t.bmd.put(bmd) {
        Ok(()) => StatusCode::OK.into_response(),
        Err(e) => err_response(&e),
    }
}

#[derive(Debug, Deserialize)]
struct MountpathMsg {
    action: String,
    path: String,
}

/// Mountpath add/enable/disable/remove. Every operation opens the local
/// GFN window for its duration plus the configured grace period, and
/// triggers a resilver.
async fn mountpath_action(
    State(state): State<AppState>,
    Json(msg): Json<MountpathMsg>,
) -> Response {
    let t = &state.t;
    let was_active = t.local_gfn.activate();
    let res = match msg.action.as_str() {
        "add" => t.mountpaths.add(&msg.path).map(|_| ()),
        "enable" => t.mountpaths.enable(&msg.path).map(|_| ()),
        "disable" => t.mountpaths.disable(&msg.path).map(|changed| {
            if changed {
                t.lom_cache.evict_mountpath(std::path::Path::new(&msg.path));
            }
        }),
        "remove" => t.mountpaths.remove(&msg.path).map(|mp| {
            t.lom_cache.evict_mountpath(mp.path());
        }),
        other => Err(Error::bad_request(format!("unknown mountpath action {other}"))),
    };
    match res {
        // the registry event triggers the resilver and closes the GFN
        // window after the grace period
        Ok(()) => StatusCode::OK.into_response(),
        Err(e) => {
            if !was_active {
                t.local_gfn.deactivate();
            }
            err_response(&e)
        }
    }
}

#[derive(Debug, Deserialize)]
struct PrefetchMsg {
    bucket: String,
    #[serde(default)]
    provider: Option<String>,
    objnames: Vec<String>,
}

/// Warm the cache for a list of cloud objects; contended objects are
/// skipped, a GET in flight already fetches them
async fn prefetch(State(state): State<AppState>, Json(msg): Json<PrefetchMsg>) -> Response {
    let t = &state.t;
    let provider = match Provider::parse(msg.provider.as_deref().unwrap_or_default()) {
        Ok(provider) => provider,
        Err(e) => return err_response(&e),
    };
    if !provider.is_cloud() {
        return err_response(&Error::bad_request("prefetch applies to cloud buckets"));
    }
    let bck = shoal_common::Bck::new(msg.bucket, provider);
    for objname in msg.objnames {
        let t = Arc::clone(t);
        let bck = bck.clone();
        tokio::spawn(async move {
            let lom = match t.lom(bck, &objname) {
                Ok(lom) => lom,
                Err(e) => {
                    warn!(%e, objname, "prefetch skipped");
                    return;
                }
            };
            match getobj::cold_get(&t, lom, getobj::ColdGetMode::Prefetch).await {
                Ok(_) => {}
                Err(e) if e.is_retryable() => {}
                Err(e) => warn!(%e, objname, "prefetch failed"),
            }
        });
    }
    StatusCode::ACCEPTED.into_response()
}

#[derive(Serialize)]
struct DaemonStats {
    get_n: i64,
    put_n: i64,
    delete_n: i64,
    head_n: i64,
    cold_get_n: i64,
    gfn_restore_n: i64,
    redirect_latency_ns: i64,
    cap_used_pct: i32,
    oos: bool,
    mountpaths: usize,
}

async fn daemon_stats(State(state): State<AppState>) -> Json<DaemonStats> {
    let t = &state.t;
    let (cap_used_pct, oos) = t.avg_cap_used();
    Json(DaemonStats {
        get_n: t.stats.get_n.load(Ordering::Relaxed),
        put_n: t.stats.put_n.load(Ordering::Relaxed),
        delete_n: t.stats.delete_n.load(Ordering::Relaxed),
        head_n: t.stats.head_n.load(Ordering::Relaxed),
        cold_get_n: t.stats.cold_get_n.load(Ordering::Relaxed),
        gfn_restore_n: t.stats.gfn_restore_n.load(Ordering::Relaxed),
        redirect_latency_ns: t.stats.redirect_latency_ns.load(Ordering::Relaxed),
        cap_used_pct,
        oos,
        mountpaths: t.mountpaths.num_avail(),
    })
}
