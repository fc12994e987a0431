//! GET pipeline
//!
//! Warm reads validate the cached copy under a shared lock. A miss takes
//! one of three recovery routes: cold GET from the cloud backend, a
//! displaced-copy scan or neighbor lookup while a GFN window is open, or
//! erasure-coded reconstruction as the final fallback. All write paths
//! run under the exclusive object lock and finish with a downgrade, so the
//! pending read is served without a release/re-acquire gap.

use crate::api;
use crate::putobj::PutObj;
use crate::target::Target;
use futures::TryStreamExt;
use shoal_cluster::{Lom, Network, ReadGuard, Snode};
use shoal_common::{access, Bck, Cksum, CksumCalculator, CksumType, Error, Result};
use shoal_fs::WorkfileTag;
use std::path::{Path, PathBuf};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use tokio::io::AsyncReadExt;
use tracing::{debug, info, warn};

/// The bucket to address in the cloud: the backend bucket for AIS-over-cloud,
/// the bucket itself otherwise
pub fn cloud_bck(lom: &Lom) -> Bck {
    lom.props
        .backend_bck
        .clone()
        .unwrap_or_else(|| lom.bck.clone())
}

fn is_cloud_backed(lom: &Lom) -> bool {
    lom.props.provider.is_cloud() || lom.props.backend_bck.is_some()
}

/// Resolve an object for reading. Returns the LOM and the shared guard the
/// response body must hold until fully streamed.
pub async fn get_object(
    t: &Arc<Target>,
    bck: Bck,
    objname: &str,
    is_gfn: bool,
) -> Result<(ReadGuard, Lom)> {
    let mut lom = t.lom(bck, objname)?;
    lom.props.allow(access::GET)?;
    let uname = lom.uname();
    let guard = t.locks.lock_shared(&uname).await;

    match lom.load(&t.lom_cache) {
        Ok(()) => {
            if let Some(refetch) = validate_warm(t, &lom).await? {
                drop(guard);
                debug!(obj = %lom, why = refetch, "warm copy invalid, refetching");
                let (guard, lom) = cold_get(t, lom, ColdGetMode::Force).await?;
                return Ok((guard.expect("blocking cold GET holds the lock"), lom));
            }
            lom.touch();
            lom.recache(&t.lom_cache);
            Ok((guard, lom))
        }
        Err(Error::NotFound { .. }) if !is_gfn => {
            drop(guard);
            if is_cloud_backed(&lom) {
                let (guard, lom) = cold_get(t, lom, ColdGetMode::Get).await?;
                Ok((guard.expect("blocking cold GET holds the lock"), lom))
            } else {
                restore_missing(t, lom).await
            }
        }
        Err(e) => {
            t.fs_error(&e, &lom.fqn);
            Err(e)
        }
    }
}

/// Warm-GET validation; `Ok(Some(reason))` means the cached copy must be
/// refetched from the cloud
async fn validate_warm(t: &Arc<Target>, lom: &Lom) -> Result<Option<&'static str>> {
    if lom.props.cksum.validate_warm_get {
        match lom.validate_content() {
            Ok(()) => {}
            Err(e @ Error::ChecksumMismatch { .. }) => {
                if is_cloud_backed(lom) {
                    return Ok(Some("checksum mismatch"));
                }
                return Err(e);
            }
            Err(e) => {
                t.fs_error(&e, &lom.fqn);
                return Err(e);
            }
        }
    }
    if lom.props.versioning.validate_warm_get && is_cloud_backed(lom) && !lom.version().is_empty()
    {
        let meta = t.cloud.head_obj(&cloud_bck(lom), &lom.objname).await?;
        if meta.version != lom.version() {
            return Ok(Some("version changed"));
        }
    }
    Ok(None)
}

/// How a cold GET acquires the lock and treats an existing local copy
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ColdGetMode {
    /// Blocking: a pending read waits for the download
    Get,
    /// The cached copy failed validation; refetch over it
    Force,
    /// Best-effort: try-lock, skip when contended
    Prefetch,
}

/// Cold GET: stream from the cloud into a workfile under the exclusive
/// lock, promote, persist, then downgrade to serve the pending read.
/// Prefetch calls try-lock and skip on contention; they return no guard.
pub async fn cold_get(
    t: &Arc<Target>,
    mut lom: Lom,
    mode: ColdGetMode,
) -> Result<(Option<ReadGuard>, Lom)> {
    let uname = lom.uname();
    let wguard = if mode == ColdGetMode::Prefetch {
        match t.locks.try_lock_excl(&uname) {
            Some(guard) => guard,
            None => {
                debug!(obj = %lom, "prefetch: cold GET race, skipping");
                return Err(Error::transient("cold GET in progress"));
            }
        }
    } else {
        // one cold GET at a time per object
        t.locks.lock_excl(&uname).await
    };

    // the object may have landed while we waited for the lock
    t.lom_cache.uncache(&uname);
    if mode != ColdGetMode::Force && lom.load(&t.lom_cache).is_ok() {
        return Ok((Some(wguard.downgrade()), lom));
    }

    let cbck = cloud_bck(&lom);
    let workfile = lom.new_workfile(WorkfileTag::ColdGet)?;
    let meta = match t.cloud.get_obj(&cbck, &lom.objname, &workfile).await {
        Ok(meta) => meta,
        Err(e) => {
            remove_workfile(t, &workfile);
            return Err(e);
        }
    };
    if lom.props.cksum.validate_cold_get && !meta.cksum.is_empty() {
        if let Err(e) = verify_file(t, &workfile, &meta.cksum).await {
            remove_workfile(t, &workfile);
            return Err(e);
        }
    }
    lom.set_size(meta.size);
    lom.set_cksum(meta.cksum);
    lom.set_version(meta.version);
    lom.touch();

    let commit: Result<()> = (|| {
        if let Some(parent) = lom.fqn.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::rename(&workfile, &lom.fqn)?;
        Ok(())
    })();
    if let Err(e) = commit {
        t.fs_error(&e, &lom.fqn);
        remove_workfile(t, &workfile);
        return Err(e);
    }
    if let Err(e) = lom.persist(&t.lom_cache) {
        t.fs_error(&e, &lom.fqn);
        return Err(e);
    }
    t.stats.cold_get_n.fetch_add(1, Ordering::Relaxed);
    info!(obj = %lom, size = lom.size(), "cold GET");

    if mode == ColdGetMode::Prefetch {
        drop(wguard);
        Ok((None, lom))
    } else {
        // downgrade, not release: serve the pending GET under the read lock
        Ok((Some(wguard.downgrade()), lom))
    }
}

/// Attempt to restore a missing ais-bucket object, per the GFN decision
/// table: displaced local copy, then neighbor lookup, then EC.
async fn restore_missing(t: &Arc<Target>, mut lom: Lom) -> Result<(ReadGuard, Lom)> {
    let uname = lom.uname();
    let wguard = t.locks.lock_excl(&uname).await;
    t.lom_cache.uncache(&uname);
    if lom.load(&t.lom_cache).is_ok() {
        return Ok((wguard.downgrade(), lom));
    }

    // local resilver in progress: the object may sit displaced on another
    // mountpath
    if t.reb_state.resilver_running() || t.local_gfn.active() {
        if let Some((fqn, size)) = find_displaced(t, &lom) {
            info!(obj = %lom, displaced = %fqn.display(), "serving displaced copy");
            lom.fqn = fqn;
            lom.set_size(size);
            return Ok((wguard.downgrade(), lom));
        }
    }

    let smap = t.smap.get();
    let enough_ec_targets =
        lom.props.ec.required_restore_targets() <= smap.count_targets();
    if t.reb_state.global_running() || t.global_gfn.active() || !enough_ec_targets {
        let conf = t.config.gfn.clone();
        // retry: the object may be mid-flight to this target right now
        for _ in 0..conf.neigh_retries {
            match get_from_neighbor(t, &lom.bck, &lom.objname).await {
                Ok(restored) => {
                    t.stats.gfn_restore_n.fetch_add(1, Ordering::Relaxed);
                    info!(obj = %restored, size = restored.size(), "GFN restored");
                    return Ok((wguard.downgrade(), restored));
                }
                Err(e) => debug!(obj = %lom, %e, "neighbor lookup"),
            }
            tokio::time::sleep(conf.neigh_sleep()).await;
        }
    }

    if lom.props.ec.enabled {
        match crate::ec::restore(t, &mut lom).await {
            Ok(()) => {
                info!(obj = %lom, "EC restored");
                return Ok((wguard.downgrade(), lom));
            }
            Err(e) => warn!(obj = %lom, %e, "EC restore failed"),
        }
    }

    Err(Error::NotFound {
        bucket: lom.bck.to_string(),
        objname: lom.objname.clone(),
    })
}

/// Scan the other available mountpaths for a copy that has not been
/// resilvered yet
fn find_displaced(t: &Arc<Target>, lom: &Lom) -> Option<(PathBuf, i64)> {
    let snap = t.mountpaths.snapshot();
    for mp in snap.values() {
        if mp.path() == lom.mpath.path() {
            continue;
        }
        let candidate = mp.make_fqn(shoal_fs::ContentType::Object, &lom.bck, &lom.objname);
        if let Ok(stat) = std::fs::metadata(&candidate) {
            return Some((candidate, stat.len() as i64));
        }
    }
    None
}

/// HEAD-broadcast the cluster, then GET the object from the peer holding it
/// over the intra-data network
async fn get_from_neighbor(t: &Arc<Target>, bck: &Bck, objname: &str) -> Result<Lom> {
    let smap = t.smap.get();
    let neigh = lookup_remotely(t, bck, objname, &smap)
        .await
        .ok_or_else(|| Error::transient(format!("cluster-wide lookup failed for {bck}/{objname}")))?;
    debug!(%bck, objname, peer = neigh.id, "found on peer");

    let url = format!(
        "{}/v1/objects/{}/{}",
        neigh.url(Network::IntraData),
        bck.name,
        objname
    );
    let resp = t
        .data_client
        .get(url)
        .query(&[
            (api::QP_PROVIDER, bck.provider.as_str()),
            (api::QP_GFN, "true"),
        ])
        .send()
        .await
        .map_err(|e| Error::transient(e.to_string()))?;
    if !resp.status().is_success() {
        return Err(Error::Remote {
            status: resp.status().as_u16(),
            msg: format!("GFN GET {bck}/{objname} from {}", neigh.id),
        });
    }

    let hdr_str = |name: &str| {
        resp.headers()
            .get(name)
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default()
            .to_string()
    };
    let cksum = Cksum::new(CksumType::parse(&hdr_str(api::HDR_CKSUM_TYPE)), hdr_str(api::HDR_CKSUM_VALUE));
    let version = hdr_str(api::HDR_VERSION);
    let atime_ns = hdr_str(api::HDR_ATIME).parse::<i64>().unwrap_or(0);

    let lom = t.lom(bck.clone(), objname)?;
    let mut po = PutObj::new(t, lom, WorkfileTag::Remote)?;
    po.migrated = true;
    if !cksum.is_empty() {
        po.expected_cksum = Some(cksum);
    }
    let body = resp.bytes_stream().map_err(std::io::Error::other);
    po.write_stream(Box::pin(body)).await?;
    po.lom.set_version(version);
    if atime_ns != 0 {
        po.lom.set_atime_ns(atime_ns);
    }
    po.finalize().await?;
    Ok(po.lom)
}

/// Silent HEAD to every other target over the intra-control network; the
/// first positive answer wins
async fn lookup_remotely(
    t: &Arc<Target>,
    bck: &Bck,
    objname: &str,
    smap: &shoal_cluster::Smap,
) -> Option<Arc<Snode>> {
    let lookups = smap
        .targets
        .values()
        .filter(|node| node.id != t.tid())
        .map(|node| {
            let url = format!(
                "{}/v1/objects/{}/{}",
                node.url(Network::IntraControl),
                bck.name,
                objname
            );
            let client = t.client.clone();
            let provider = bck.provider.as_str();
            let node = Arc::clone(node);
            async move {
                let resp = client
                    .head(url)
                    .query(&[(api::QP_PROVIDER, provider), (api::QP_SILENT, "true")])
                    .send()
                    .await
                    .ok()?;
                resp.status().is_success().then_some(node)
            }
        });
    futures::future::join_all(lookups)
        .await
        .into_iter()
        .flatten()
        .next()
}

async fn verify_file(t: &Arc<Target>, path: &Path, expected: &Cksum) -> Result<()> {
    let mut file = tokio::fs::File::open(path).await?;
    let mut calc = CksumCalculator::new(expected.ty);
    let mut buf = t.mem.alloc_default();
    loop {
        let n = file.read(&mut buf[..]).await?;
        if n == 0 {
            break;
        }
        calc.update(&buf[..n]);
    }
    let actual = calc.finish();
    if !expected.matches(&actual) {
        return Err(Error::ChecksumMismatch {
            expected: expected.to_string(),
            actual: actual.to_string(),
        });
    }
    Ok(())
}

fn remove_workfile(t: &Arc<Target>, workfile: &Path) {
    if let Err(e) = std::fs::remove_file(workfile) {
        if e.kind() != std::io::ErrorKind::NotFound {
            warn!(workfile = %workfile.display(), %e, "workfile cleanup failed");
            t.fshc_io(&e, workfile);
        }
    }
}

impl Target {
    fn fshc_io(&self, err: &std::io::Error, path: &Path) {
        if self.fshc.on_error(err, path) {
            self.lom_cache.evict_mountpath(path);
        }
    }
}
