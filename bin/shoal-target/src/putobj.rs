//! PUT pipeline
//!
//! Every write lands in a workfile on the object's home mountpath, with the
//! checksum computed while streaming. Promotion to the final path is an
//! atomic rename under the exclusive object lock; only then is the LOM
//! persisted. Mirroring runs afterwards, asynchronously.

use crate::target::Target;
use bytes::Bytes;
use futures::Stream;
use futures::StreamExt;
use shoal_cluster::Lom;
use shoal_common::{Cksum, CksumCalculator, Error, Result};
use shoal_fs::{ContentType, WorkfileTag};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tracing::{debug, error, warn};

pub struct PutObj {
    pub t: Arc<Target>,
    pub lom: Lom,
    pub workfile: PathBuf,
    /// Client-supplied checksum to verify against, if any
    pub expected_cksum: Option<Cksum>,
    /// Intra-cluster replication (GFN, rebalance): keeps the sender's
    /// version and skips the cloud write-through
    pub migrated: bool,
}

impl PutObj {
    pub fn new(t: &Arc<Target>, lom: Lom, tag: WorkfileTag) -> Result<Self> {
        let workfile = lom.new_workfile(tag)?;
        Ok(Self {
            t: Arc::clone(t),
            lom,
            workfile,
            expected_cksum: None,
            migrated: false,
        })
    }

    /// Stream the body into the workfile, hashing as it goes
    pub async fn write_stream<S>(&mut self, mut body: S) -> Result<()>
    where
        S: Stream<Item = std::io::Result<Bytes>> + Unpin,
    {
        let cksum_ty = self
            .expected_cksum
            .as_ref()
            .map_or(self.lom.props.cksum.ty, |c| c.ty);
        let mut calc = CksumCalculator::new(cksum_ty);
        let mut size: i64 = 0;

        let res: Result<()> = async {
            let mut file = tokio::fs::File::create(&self.workfile).await?;
            while let Some(chunk) = body.next().await {
                let chunk = chunk.map_err(Error::Io)?;
                calc.update(&chunk);
                size += chunk.len() as i64;
                file.write_all(&chunk).await?;
            }
            file.flush().await?;
            Ok(())
        }
        .await;
        if let Err(e) = res {
            self.abort(&e);
            return Err(e);
        }

        let actual = calc.finish();
        if let Some(expected) = &self.expected_cksum {
            if !expected.matches(&actual) {
                let err = Error::ChecksumMismatch {
                    expected: expected.to_string(),
                    actual: actual.to_string(),
                };
                self.abort(&err);
                return Err(err);
            }
        }
        self.lom.set_size(size);
        self.lom.set_cksum(actual);
        Ok(())
    }

    /// Promote the workfile: rename over the final path, stamp the version,
    /// persist the metadata
    pub async fn finalize(&mut self) -> Result<()> {
        if !self.migrated {
            if self.lom.props.provider.is_cloud() || self.lom.props.backend_bck.is_some() {
                // the cloud stays authoritative: write through, keep its version
                let cloud_bck = crate::getobj::cloud_bck(&self.lom);
                let version = self
                    .t
                    .cloud
                    .put_obj(&cloud_bck, &self.lom.objname, &self.workfile)
                    .await;
                match version {
                    Ok(version) => self.lom.set_version(version),
                    Err(e) => {
                        self.abort(&e);
                        return Err(e);
                    }
                }
            } else if self.lom.props.versioning.enabled {
                self.lom.bump_version();
            }
        }
        self.lom.touch();

        let res: Result<()> = (|| {
            if let Some(parent) = self.lom.fqn.parent() {
                std::fs::create_dir_all(parent)?;
            }
            std::fs::rename(&self.workfile, &self.lom.fqn)?;
            Ok(())
        })();
        if let Err(e) = res {
            self.abort(&e);
            return Err(e);
        }
        if let Err(e) = self.lom.persist(&self.t.lom_cache) {
            self.t.fs_error(&e, &self.lom.fqn);
            return Err(e);
        }
        debug!(obj = %self.lom, size = self.lom.size(), "put finalized");
        Ok(())
    }

    /// Failed staging: drop the workfile, leave prior on-disk state intact
    fn abort(&self, err: &Error) {
        warn!(obj = %self.lom, %err, "put aborted");
        self.t.fs_error(err, &self.workfile);
        if let Err(rm_err) = std::fs::remove_file(&self.workfile) {
            if rm_err.kind() != std::io::ErrorKind::NotFound {
                warn!(workfile = %self.workfile.display(), %rm_err, "workfile cleanup failed");
            }
        }
    }
}

/// Asynchronous n-way mirroring after a successful PUT
pub fn put_mirror(t: &Arc<Target>, lom: &Lom) {
    let conf = &lom.props.mirror;
    if !conf.enabled || conf.copies < 2 {
        return;
    }
    if (t.mountpaths.num_avail() as i64) < conf.copies {
        warn!(
            obj = %lom,
            copies = conf.copies,
            avail = t.mountpaths.num_avail(),
            "not enough mountpaths to mirror"
        );
        return;
    }
    let t = Arc::clone(t);
    let bck = lom.bck.clone();
    let objname = lom.objname.clone();
    tokio::spawn(async move {
        if let Err(e) = mirror_one(&t, bck, &objname).await {
            error!(%e, "mirroring failed");
        }
    });
}

async fn mirror_one(t: &Arc<Target>, bck: shoal_common::Bck, objname: &str) -> Result<()> {
    let uname = bck.make_uname(objname);
    let _guard = t.locks.lock_excl(&uname).await;
    let mut lom = t.lom(bck, objname)?;
    lom.load(&t.lom_cache)?;

    let want = lom.props.mirror.copies as usize;
    let mut have = 1 + lom.copies().len();
    if have >= want {
        return Ok(());
    }
    let snap = t.mountpaths.snapshot();
    let existing: Vec<PathBuf> = lom.copies().to_vec();
    for mp in snap.values() {
        if have >= want {
            break;
        }
        if mp.path() == lom.mpath.path() || existing.iter().any(|c| c.starts_with(mp.path())) {
            continue;
        }
        let copy_fqn = mp.make_fqn(ContentType::Object, &lom.bck, &lom.objname);
        if let Some(parent) = copy_fqn.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::copy(&lom.fqn, &copy_fqn).await?;
        lom.add_copy(copy_fqn.clone());
        have += 1;
        debug!(obj = %lom, copy = %copy_fqn.display(), "mirrored");
    }
    lom.persist(&t.lom_cache)?;
    Ok(())
}
