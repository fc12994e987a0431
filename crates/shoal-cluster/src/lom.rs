//! LOM - local object metadata
//!
//! The in-memory handle for one object on this target. The authoritative
//! state is the object file plus its metadata sidecar; a LOM is a cache
//! entry over both, valid only while the corresponding object lock is held.
//! `persist` is atomic (workfile + rename-over), so a failed persist leaves
//! the prior on-disk metadata intact.

use crate::hrw::hrw_mpath;
use crate::smap::Bmd;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use shoal_common::{Bck, BckProps, Cksum, CksumCalculator, Error, Result};
use shoal_fs::{lmeta_fqn, unique_workfile, ContentType, Mountpath, MountpathRegistry, WorkfileTag};
use std::collections::HashMap;
use std::fmt;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use xxhash_rust::xxh64::xxh64;

/// Persisted object metadata
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct LomMeta {
    pub size: i64,
    #[serde(default)]
    pub cksum: Cksum,
    #[serde(default)]
    pub version: String,
    #[serde(default)]
    pub atime_ns: i64,
    /// Mirror copy locations, full paths
    #[serde(default)]
    pub copies: Vec<PathBuf>,
}

#[derive(Clone)]
struct CachedLom {
    meta: LomMeta,
    fqn: PathBuf,
}

const CACHE_SHARDS: usize = 64;

/// Process-wide cache of loaded object metadata, keyed by uname
pub struct LomCache {
    shards: Vec<Mutex<HashMap<String, CachedLom>>>,
}

impl LomCache {
    #[must_use]
    pub fn new() -> Arc<Self> {
        let shards = (0..CACHE_SHARDS).map(|_| Mutex::new(HashMap::new())).collect();
        Arc::new(Self { shards })
    }

    fn shard(&self, uname: &str) -> &Mutex<HashMap<String, CachedLom>> {
        &self.shards[xxh64(uname.as_bytes(), 0) as usize % CACHE_SHARDS]
    }

    fn get(&self, uname: &str) -> Option<CachedLom> {
        self.shard(uname).lock().get(uname).cloned()
    }

    fn insert(&self, uname: &str, cached: CachedLom) {
        self.shard(uname).lock().insert(uname.to_string(), cached);
    }

    /// Explicit invalidation of one entry
    pub fn uncache(&self, uname: &str) {
        self.shard(uname).lock().remove(uname);
    }

    /// Drop every entry that lives on the given mountpath
    pub fn evict_mountpath(&self, mpath_root: &Path) {
        for shard in &self.shards {
            shard.lock().retain(|_, c| !c.fqn.starts_with(mpath_root));
        }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.shards.iter().map(|s| s.lock().len()).sum()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Local object metadata handle
pub struct Lom {
    pub bck: Bck,
    pub objname: String,
    pub props: BckProps,
    pub mpath: Arc<Mountpath>,
    pub fqn: PathBuf,
    meta: Option<LomMeta>,
}

impl Lom {
    /// Resolve the object's home mountpath and properties. Does not touch
    /// the filesystem; call `load` to populate metadata.
    pub fn init(
        bck: Bck,
        objname: impl Into<String>,
        registry: &MountpathRegistry,
        bmd: &Bmd,
    ) -> Result<Self> {
        bck.validate()?;
        let objname = objname.into();
        if objname.is_empty() || objname.ends_with('/') {
            return Err(Error::bad_request(format!("invalid object name {objname:?}")));
        }
        let props = bmd.resolve(&bck)?;
        let snap = registry.snapshot();
        let mpaths: Vec<Arc<Mountpath>> = snap.values().cloned().collect();
        let uname = bck.make_uname(&objname);
        let mpath = hrw_mpath(&uname, &mpaths)?;
        let fqn = mpath.make_fqn(ContentType::Object, &bck, &objname);
        Ok(Self {
            bck,
            objname,
            props,
            mpath,
            fqn,
            meta: None,
        })
    }

    #[must_use]
    pub fn uname(&self) -> String {
        self.bck.make_uname(&self.objname)
    }

    /// Workfile root for this object (same mountpath, workfile content root)
    #[must_use]
    pub fn workfile_root(&self) -> PathBuf {
        self.mpath
            .make_fqn(ContentType::Workfile, &self.bck, &self.objname)
    }

    /// Generate a unique workfile path for the given staging operation
    pub fn new_workfile(&self, tag: WorkfileTag) -> Result<PathBuf> {
        let root = self.workfile_root();
        if let Some(parent) = root.parent() {
            std::fs::create_dir_all(parent)?;
        }
        Ok(unique_workfile(&root, tag))
    }

    /// Populate from cache or disk; `NotFound` if the object file is absent
    pub fn load(&mut self, cache: &LomCache) -> Result<()> {
        let uname = self.uname();
        if let Some(cached) = cache.get(&uname) {
            self.fqn = cached.fqn;
            self.meta = Some(cached.meta);
            return Ok(());
        }
        let stat = match std::fs::metadata(&self.fqn) {
            Ok(stat) => stat,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(Error::NotFound {
                    bucket: self.bck.to_string(),
                    objname: self.objname.clone(),
                })
            }
            Err(e) => return Err(Error::Io(e)),
        };
        let meta = match std::fs::read(lmeta_fqn(&self.fqn)) {
            Ok(bytes) => serde_json::from_slice(&bytes)
                .map_err(|e| Error::internal(format!("corrupt metadata sidecar: {e}")))?,
            // object without a sidecar: recoverable, derive what the stat gives us
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => LomMeta {
                size: stat.len() as i64,
                ..Default::default()
            },
            Err(e) => return Err(Error::Io(e)),
        };
        self.meta = Some(meta);
        self.recache(cache);
        Ok(())
    }

    #[must_use]
    pub fn exists(&self) -> bool {
        self.meta.is_some()
    }

    #[must_use]
    pub fn size(&self) -> i64 {
        self.meta.as_ref().map_or(0, |m| m.size)
    }

    #[must_use]
    pub fn cksum(&self) -> Cksum {
        self.meta.as_ref().map(|m| m.cksum.clone()).unwrap_or_default()
    }

    #[must_use]
    pub fn version(&self) -> &str {
        self.meta.as_ref().map_or("", |m| m.version.as_str())
    }

    #[must_use]
    pub fn atime_ns(&self) -> i64 {
        self.meta.as_ref().map_or(0, |m| m.atime_ns)
    }

    #[must_use]
    pub fn copies(&self) -> &[PathBuf] {
        self.meta.as_ref().map_or(&[], |m| m.copies.as_slice())
    }

    fn meta_mut(&mut self) -> &mut LomMeta {
        self.meta.get_or_insert_with(LomMeta::default)
    }

    pub fn set_size(&mut self, size: i64) {
        self.meta_mut().size = size;
    }

    pub fn set_cksum(&mut self, cksum: Cksum) {
        self.meta_mut().cksum = cksum;
    }

    pub fn set_version(&mut self, version: impl Into<String>) {
        self.meta_mut().version = version.into();
    }

    pub fn set_atime_ns(&mut self, atime_ns: i64) {
        self.meta_mut().atime_ns = atime_ns;
    }

    pub fn add_copy(&mut self, fqn: PathBuf) {
        let copies = &mut self.meta_mut().copies;
        if !copies.contains(&fqn) {
            copies.push(fqn);
        }
    }

    /// Stamp the access time with the current clock
    pub fn touch(&mut self) {
        self.set_atime_ns(now_ns());
    }

    /// Next version for a versioned ais bucket: numeric increment from 1
    pub fn bump_version(&mut self) {
        let next = self.version().parse::<u64>().map_or(1, |v| v + 1);
        self.set_version(next.to_string());
    }

    /// Write the metadata sidecar atomically and refresh the cache
    pub fn persist(&self, cache: &LomCache) -> Result<()> {
        let meta = self
            .meta
            .as_ref()
            .ok_or_else(|| Error::internal("persisting an unloaded LOM"))?;
        let sidecar = lmeta_fqn(&self.fqn);
        let tmp = unique_workfile(&sidecar, WorkfileTag::Put);
        let bytes = serde_json::to_vec(meta)
            .map_err(|e| Error::internal(format!("metadata encode: {e}")))?;
        if let Err(e) = std::fs::write(&tmp, &bytes) {
            let _ = std::fs::remove_file(&tmp);
            return Err(Error::Io(e));
        }
        if let Err(e) = std::fs::rename(&tmp, &sidecar) {
            let _ = std::fs::remove_file(&tmp);
            return Err(Error::Io(e));
        }
        self.recache(cache);
        Ok(())
    }

    /// Refresh this LOM's cache entry
    pub fn recache(&self, cache: &LomCache) {
        if let Some(meta) = &self.meta {
            cache.insert(
                &self.uname(),
                CachedLom {
                    meta: meta.clone(),
                    fqn: self.fqn.clone(),
                },
            );
        }
    }

    /// Re-read the object file and compare against the stored checksum
    pub fn validate_content(&self) -> Result<()> {
        let stored = self.cksum();
        if stored.is_empty() {
            return Ok(());
        }
        let mut file = std::fs::File::open(&self.fqn)?;
        let mut calc = CksumCalculator::new(stored.ty);
        let mut buf = vec![0u8; 64 * 1024];
        loop {
            let n = file.read(&mut buf)?;
            if n == 0 {
                break;
            }
            calc.update(&buf[..n]);
        }
        let actual = calc.finish();
        if !stored.matches(&actual) {
            return Err(Error::ChecksumMismatch {
                expected: stored.to_string(),
                actual: actual.to_string(),
            });
        }
        Ok(())
    }

    /// Remove the object, its copies, and its sidecar; uncache
    pub fn delete_all(&mut self, cache: &LomCache) -> Result<()> {
        let copies = self.copies().to_vec();
        for copy in copies {
            if copy != self.fqn {
                if let Err(e) = std::fs::remove_file(&copy) {
                    if e.kind() != std::io::ErrorKind::NotFound {
                        return Err(Error::Io(e));
                    }
                }
            }
        }
        let _ = std::fs::remove_file(lmeta_fqn(&self.fqn));
        match std::fs::remove_file(&self.fqn) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(Error::Io(e)),
        }
        cache.uncache(&self.uname());
        self.meta = None;
        Ok(())
    }
}

impl fmt::Display for Lom {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.bck, self.objname)
    }
}

/// Nanoseconds since the UNIX epoch
#[must_use]
pub fn now_ns() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |d| d.as_nanos() as i64)
}
