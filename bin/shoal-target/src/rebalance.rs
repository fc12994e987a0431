//! Rebalance and resilver
//!
//! Global rebalance runs on a membership change: every local object whose
//! HRW owner moved is shipped to the new owner over the object stream
//! (transport name `reb`) and deleted here once its completion ack arrives.
//! Resilver runs on a mountpath change and moves objects between local
//! mountpaths the same way, minus the network. Per-object failures are
//! logged and skipped; an abort cancels the job wholesale.

use crate::putobj::PutObj;
use crate::target::Target;
use async_trait::async_trait;
use shoal_cluster::{hrw_mpath, hrw_target, Lom, Network, Smap};
use shoal_common::{Bck, Error, Provider, Result};
use shoal_fs::{lmeta_fqn, unique_workfile, ContentType, Mountpath, WorkfileTag};
use shoal_transport::{Extra, Obj, ObjAttrs, ObjBody, ObjHdr, Receiver, Stream};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::{mpsc, watch, Semaphore};
use tracing::{debug, error, info, warn};

pub const REB_TRNAME: &str = "reb";

pub struct RebManager {
    t: Arc<Target>,
    abort_tx: watch::Sender<bool>,
}

impl RebManager {
    #[must_use]
    pub fn new(t: Arc<Target>) -> Arc<Self> {
        let (abort_tx, _) = watch::channel(false);
        Arc::new(Self { t, abort_tx })
    }

    /// Cancel outstanding jobs; a terminating target calls this and re-runs
    /// the job after rejoining
    pub fn abort(&self) {
        let _ = self.abort_tx.send(true);
    }

    /// Cancel a running global rebalance and start a fresh one under the
    /// new map
    pub async fn restart_global(self: &Arc<Self>, smap: Arc<Smap>) {
        if self.t.reb_state.global_running() {
            self.abort();
            while self.t.reb_state.global_running() {
                tokio::time::sleep(std::time::Duration::from_millis(50)).await;
            }
        }
        self.run_global(smap).await;
    }

    fn aborted(&self) -> bool {
        *self.abort_tx.borrow()
    }

    fn reset_abort(&self) {
        let _ = self.abort_tx.send(false);
    }

    /// Ship every misplaced object to its HRW owner under `smap`
    pub async fn run_global(self: &Arc<Self>, smap: Arc<Smap>) {
        let t = &self.t;
        if !t.config.rebalance.enabled {
            return;
        }
        if t.reb_state.global_running() {
            debug!("global rebalance already running");
            return;
        }
        t.reb_state.set_global(true);
        self.reset_abort();
        info!(smap_version = smap.version, "global rebalance: begin");

        // acks remove the local copy; per-object failures never abort the job
        let (ack_tx, mut ack_rx) = mpsc::unbounded_channel::<(ObjHdr, bool)>();
        let inflight = Arc::new(Semaphore::new(t.config.rebalance.concurrency));
        let acker = {
            let t = Arc::clone(t);
            let inflight = Arc::clone(&inflight);
            tokio::spawn(async move {
                let mut moved = 0u64;
                while let Some((hdr, ok)) = ack_rx.recv().await {
                    inflight.add_permits(1);
                    if !ok {
                        continue;
                    }
                    match delete_local(&t, &hdr.bck, &hdr.objname).await {
                        Ok(()) => moved += 1,
                        Err(e) => warn!(bck = %hdr.bck, objname = hdr.objname, %e,
                            "rebalanced object not removed"),
                    }
                }
                moved
            })
        };
        let ack_cb: shoal_transport::ObjSentCb = {
            let ack_tx = ack_tx.clone();
            Arc::new(move |hdr, err| {
                let _ = ack_tx.send((hdr.clone(), err.is_none()));
            })
        };

        let mut streams: HashMap<String, Stream> = HashMap::new();
        let snap = t.mountpaths.snapshot();
        'walk: for mp in snap.values() {
            for (bck, objname, _fqn) in walk_objects(mp) {
                if self.aborted() {
                    warn!("global rebalance: aborted");
                    break 'walk;
                }
                let uname = bck.make_uname(&objname);
                let winner = match hrw_target(&uname, &smap) {
                    Ok(winner) => Arc::clone(winner),
                    Err(e) => {
                        warn!(%e, "rebalance: no placement");
                        break 'walk;
                    }
                };
                if winner.id == t.tid() {
                    continue;
                }
                let permit = inflight.acquire().await.expect("semaphore open");
                permit.forget();
                if let Err(e) = self
                    .send_one(&mut streams, &winner, bck, &objname, &ack_cb)
                    .await
                {
                    inflight.add_permits(1);
                    warn!(objname, %e, "rebalance: send failed");
                }
            }
        }
        for (dest, stream) in streams {
            let (_, err) = stream.fin().await;
            if let Some(err) = err {
                warn!(dest, %err, "rebalance stream ended with error");
            }
        }
        drop(ack_cb);
        drop(ack_tx);
        let moved = acker.await.unwrap_or(0);
        t.reb_state.set_global(false);
        info!(moved, "global rebalance: done");
    }

    async fn send_one(
        &self,
        streams: &mut HashMap<String, Stream>,
        winner: &shoal_cluster::Snode,
        bck: Bck,
        objname: &str,
        ack_cb: &shoal_transport::ObjSentCb,
    ) -> Result<()> {
        let t = &self.t;
        let uname = bck.make_uname(objname);
        let _guard = t.locks.lock_shared(&uname).await;
        let mut lom = t.lom(bck.clone(), objname)?;
        lom.load(&t.lom_cache)?;

        if !streams.contains_key(&winner.id) {
            let url = format!(
                "{}/v1/transport/{REB_TRNAME}",
                winner.url(Network::IntraData)
            );
            let stream = Stream::new(
                Some(t.data_client.clone()),
                url,
                &t.collector,
                Extra {
                    callback: Some(Arc::clone(ack_cb)),
                    mem: Some(Arc::clone(&t.mem)),
                    ..Default::default()
                },
            )?;
            streams.insert(winner.id.clone(), stream);
        }
        let stream = streams.get(&winner.id).expect("inserted above");

        let cksum = lom.cksum();
        let hdr = ObjHdr {
            bck,
            objname: objname.to_string(),
            opaque: Vec::new(),
            attrs: ObjAttrs {
                size: lom.size(),
                atime_ns: lom.atime_ns(),
                cksum_type: cksum.ty.as_str().to_string(),
                cksum_value: cksum.value,
                version: lom.version().to_string(),
            },
        };
        let file = tokio::fs::File::from_std(std::fs::File::open(&lom.fqn)?);
        stream.send(Obj::new(hdr, Box::new(file))).await
    }

    /// Move objects between local mountpaths after an add/enable/remove
    pub async fn run_resilver(self: &Arc<Self>) {
        let t = &self.t;
        if t.reb_state.resilver_running() {
            debug!("resilver already running");
            return;
        }
        t.reb_state.set_resilver(true);
        self.reset_abort();
        info!("resilver: begin");

        let mut moved = 0u64;
        let snap = t.mountpaths.snapshot();
        let mpaths: Vec<Arc<Mountpath>> = snap.values().cloned().collect();
        'walk: for mp in snap.values() {
            for (bck, objname, fqn) in walk_objects(mp) {
                if self.aborted() {
                    warn!("resilver: aborted");
                    break 'walk;
                }
                let uname = bck.make_uname(&objname);
                let winner = match hrw_mpath(&uname, &mpaths) {
                    Ok(winner) => winner,
                    Err(e) => {
                        warn!(%e, "resilver: no mountpaths");
                        break 'walk;
                    }
                };
                if winner.path() == mp.path() {
                    continue;
                }
                let _guard = t.locks.lock_excl(&uname).await;
                match move_local(&winner, &bck, &objname, &fqn) {
                    Ok(()) => {
                        t.lom_cache.uncache(&uname);
                        moved += 1;
                    }
                    Err(e) => {
                        warn!(objname, %e, "resilver: move failed");
                        t.fs_error(&e, &fqn);
                    }
                }
            }
        }
        t.reb_state.set_resilver(false);
        info!(moved, "resilver: done");
    }
}

/// Copy to a workfile on the winning mountpath, promote, drop the source
fn move_local(winner: &Arc<Mountpath>, bck: &Bck, objname: &str, src: &Path) -> Result<()> {
    let dest = winner.make_fqn(ContentType::Object, bck, objname);
    let work_root = winner.make_fqn(ContentType::Workfile, bck, objname);
    if let Some(parent) = work_root.parent() {
        std::fs::create_dir_all(parent)?;
    }
    if let Some(parent) = dest.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let workfile = unique_workfile(&work_root, WorkfileTag::Rebalance);
    std::fs::copy(src, &workfile)?;
    std::fs::rename(&workfile, &dest)?;

    // metadata sidecar travels with the object
    let src_meta = lmeta_fqn(src);
    match std::fs::read(&src_meta) {
        Ok(bytes) => {
            let meta_work = unique_workfile(&lmeta_fqn(&dest), WorkfileTag::Rebalance);
            std::fs::write(&meta_work, bytes)?;
            std::fs::rename(&meta_work, lmeta_fqn(&dest))?;
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => return Err(Error::Io(e)),
    }
    std::fs::remove_file(src)?;
    let _ = std::fs::remove_file(&src_meta);
    Ok(())
}

async fn delete_local(t: &Arc<Target>, bck: &Bck, objname: &str) -> Result<()> {
    let uname = bck.make_uname(objname);
    let _guard = t.locks.lock_excl(&uname).await;
    let mut lom = t.lom(bck.clone(), objname)?;
    match lom.load(&t.lom_cache) {
        Ok(()) => lom.delete_all(&t.lom_cache),
        Err(Error::NotFound { .. }) => Ok(()),
        Err(e) => Err(e),
    }
}

/// All finalized objects under one mountpath
pub fn walk_objects(mp: &Arc<Mountpath>) -> Vec<(Bck, String, PathBuf)> {
    let mut out = Vec::new();
    for provider in Provider::ALL {
        let root = mp
            .path()
            .join(ContentType::Object.dir())
            .join(provider.as_str());
        let Ok(buckets) = std::fs::read_dir(&root) else {
            continue;
        };
        for bucket in buckets.flatten() {
            let bucket_dir = bucket.path();
            if !bucket_dir.is_dir() {
                continue;
            }
            let bck = Bck::new(bucket.file_name().to_string_lossy(), provider);
            let mut files = Vec::new();
            if let Err(e) = collect_files(&bucket_dir, &mut files) {
                error!(bucket = %bck, %e, "walk failed");
                continue;
            }
            for fqn in files {
                let Ok(rel) = fqn.strip_prefix(&bucket_dir) else {
                    continue;
                };
                let objname = rel.to_string_lossy().replace(std::path::MAIN_SEPARATOR, "/");
                out.push((bck.clone(), objname, fqn));
            }
        }
    }
    out
}

fn collect_files(dir: &Path, out: &mut Vec<PathBuf>) -> std::io::Result<()> {
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        let path = entry.path();
        if path.is_dir() {
            collect_files(&path, out)?;
        } else if !matches!(
            path.extension().and_then(|e| e.to_str()),
            Some("lmeta" | "ecmeta")
        ) {
            out.push(path);
        }
    }
    Ok(())
}

/// Inbound rebalanced objects (transport name `reb`)
pub struct RebReceiver {
    pub t: Arc<Target>,
}

#[async_trait]
impl Receiver for RebReceiver {
    async fn recv(&self, hdr: ObjHdr, body: &mut ObjBody<'_>) -> Result<()> {
        let t = &self.t;
        let uname = hdr.bck.make_uname(&hdr.objname);
        let _guard = t.locks.lock_excl(&uname).await;
        let lom = t.lom(hdr.bck.clone(), &hdr.objname)?;

        let mut po = PutObj::new(t, lom, WorkfileTag::Rebalance)?;
        po.migrated = true;
        let cksum_ty = shoal_common::CksumType::parse(&hdr.attrs.cksum_type);
        if cksum_ty != shoal_common::CksumType::None && !hdr.attrs.cksum_value.is_empty() {
            po.expected_cksum = Some(shoal_common::Cksum::new(
                cksum_ty,
                hdr.attrs.cksum_value.clone(),
            ));
        }
        let stream = Box::pin(async_stream::stream! {
            loop {
                match body.chunk().await {
                    Ok(Some(chunk)) => yield Ok(chunk),
                    Ok(None) => break,
                    Err(e) => {
                        yield Err(std::io::Error::other(e.to_string()));
                        break;
                    }
                }
            }
        });
        po.write_stream(stream).await?;
        po.lom.set_version(hdr.attrs.version.clone());
        if hdr.attrs.atime_ns != 0 {
            po.lom.set_atime_ns(hdr.attrs.atime_ns);
        }
        po.finalize().await?;
        debug!(bck = %hdr.bck, objname = hdr.objname, "rebalanced object received");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use shoal_fs::MountpathRegistry;

    #[test]
    fn test_walk_objects_skips_sidecars() {
        let registry = MountpathRegistry::new();
        let dir = tempfile::tempdir().unwrap();
        let mp = registry.add(dir.path()).unwrap();

        let bck = Bck::new("walkme", Provider::Ais);
        let obj = mp.make_fqn(ContentType::Object, &bck, "a/b/obj1");
        std::fs::create_dir_all(obj.parent().unwrap()).unwrap();
        std::fs::write(&obj, b"x").unwrap();
        std::fs::write(lmeta_fqn(&obj), b"{}").unwrap();

        let found = walk_objects(&mp);
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].1, "a/b/obj1");
        assert_eq!(found[0].0, bck);
    }

    #[test]
    fn test_move_local_carries_sidecar() {
        let registry = MountpathRegistry::new();
        let src_dir = tempfile::tempdir().unwrap();
        let dst_dir = tempfile::tempdir().unwrap();
        let src_mp = registry.add(src_dir.path()).unwrap();
        let dst_mp = registry.add(dst_dir.path()).unwrap();

        let bck = Bck::new("moveme", Provider::Ais);
        let src = src_mp.make_fqn(ContentType::Object, &bck, "obj");
        std::fs::create_dir_all(src.parent().unwrap()).unwrap();
        std::fs::write(&src, b"payload").unwrap();
        std::fs::write(lmeta_fqn(&src), b"{\"size\":7}").unwrap();

        move_local(&dst_mp, &bck, "obj", &src).unwrap();
        let dest = dst_mp.make_fqn(ContentType::Object, &bck, "obj");
        assert_eq!(std::fs::read(&dest).unwrap(), b"payload");
        assert!(lmeta_fqn(&dest).exists());
        assert!(!src.exists());
        assert!(!lmeta_fqn(&src).exists());
    }
}
