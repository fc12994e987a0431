//! Mountpath registry
//!
//! Copy-on-write maps of available and disabled mountpaths. Readers snapshot
//! an `Arc` under a read lock and never observe a half-applied change; every
//! state transition is broadcast so that the GFN window and the resilver
//! driver can react.

use crate::content::ContentType;
use parking_lot::RwLock;
use shoal_common::{Bck, Error, Result};
use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{info, warn};

/// A single local filesystem root reserved for object storage
#[derive(Debug, PartialEq, Eq, Hash)]
pub struct Mountpath {
    path: PathBuf,
}

impl Mountpath {
    fn new(path: PathBuf) -> Self {
        Self { path }
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Key under which this mountpath is registered
    #[must_use]
    pub fn key(&self) -> String {
        self.path.to_string_lossy().into_owned()
    }

    /// Root directory for a bucket's content of the given type
    #[must_use]
    pub fn bck_dir(&self, ct: ContentType, bck: &Bck) -> PathBuf {
        self.path
            .join(ct.dir())
            .join(bck.provider.as_str())
            .join(&bck.name)
    }

    /// Fully qualified name of an object (or its workfile root)
    #[must_use]
    pub fn make_fqn(&self, ct: ContentType, bck: &Bck, objname: &str) -> PathBuf {
        self.bck_dir(ct, bck).join(objname)
    }

    /// Capacity of the underlying filesystem: (used percent, total bytes)
    pub fn capacity(&self) -> Result<(i32, u64)> {
        let stat = nix::sys::statvfs::statvfs(&self.path)
            .map_err(|e| Error::Io(std::io::Error::from_raw_os_error(e as i32)))?;
        let total = stat.blocks() as u64 * stat.fragment_size() as u64;
        let avail = stat.blocks_available() as u64 * stat.fragment_size() as u64;
        if total == 0 {
            return Ok((0, 0));
        }
        let used_pct = ((total - avail) * 100 / total) as i32;
        Ok((used_pct, total))
    }
}

impl fmt::Display for Mountpath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "mp[{}]", self.path.display())
    }
}

/// Mountpath state transitions, broadcast to subscribers
#[derive(Clone, Debug)]
pub enum MountpathEvent {
    Added(Arc<Mountpath>),
    Enabled(Arc<Mountpath>),
    Disabled(Arc<Mountpath>),
    Removed(Arc<Mountpath>),
}

impl MountpathEvent {
    #[must_use]
    pub fn mountpath(&self) -> &Arc<Mountpath> {
        match self {
            Self::Added(mp) | Self::Enabled(mp) | Self::Disabled(mp) | Self::Removed(mp) => mp,
        }
    }
}

type MpathMap = Arc<HashMap<String, Arc<Mountpath>>>;

/// Registry of this target's mountpaths
pub struct MountpathRegistry {
    available: RwLock<MpathMap>,
    disabled: RwLock<MpathMap>,
    events: broadcast::Sender<MountpathEvent>,
}

impl Default for MountpathRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl MountpathRegistry {
    #[must_use]
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(64);
        Self {
            available: RwLock::new(Arc::new(HashMap::new())),
            disabled: RwLock::new(Arc::new(HashMap::new())),
            events,
        }
    }

    /// Subscribe to mountpath state transitions
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<MountpathEvent> {
        self.events.subscribe()
    }

    /// Snapshot of the available mountpaths
    #[must_use]
    pub fn snapshot(&self) -> MpathMap {
        Arc::clone(&self.available.read())
    }

    #[must_use]
    pub fn num_avail(&self) -> usize {
        self.available.read().len()
    }

    /// Find the available mountpath that owns `fqn`
    #[must_use]
    pub fn resolve(&self, fqn: &Path) -> Option<Arc<Mountpath>> {
        let snap = self.snapshot();
        snap.values()
            .find(|mp| fqn.starts_with(mp.path()))
            .cloned()
    }

    /// Register a new mountpath. The directory must exist; content
    /// subdirectories are created eagerly.
    pub fn add(&self, path: impl Into<PathBuf>) -> Result<Arc<Mountpath>> {
        let path = path.into();
        if !path.is_dir() {
            return Err(Error::Config(format!(
                "mountpath {} is not a directory",
                path.display()
            )));
        }
        let mp = Arc::new(Mountpath::new(path));
        for ct in ContentType::ALL {
            std::fs::create_dir_all(mp.path().join(ct.dir()))?;
        }

        let key = mp.key();
        {
            let mut avail = self.available.write();
            if avail.contains_key(&key) || self.disabled.read().contains_key(&key) {
                return Err(Error::Config(format!("duplicate mountpath {key}")));
            }
            let mut next = HashMap::clone(&avail);
            next.insert(key, Arc::clone(&mp));
            *avail = Arc::new(next);
        }
        info!(%mp, "mountpath added");
        let _ = self.events.send(MountpathEvent::Added(Arc::clone(&mp)));
        Ok(mp)
    }

    /// Re-enable a disabled mountpath; returns false if it was not disabled
    pub fn enable(&self, key: &str) -> Result<bool> {
        let mp = {
            let mut dis = self.disabled.write();
            let Some(mp) = dis.get(key).cloned() else {
                if self.available.read().contains_key(key) {
                    return Ok(false); // already enabled
                }
                return Err(Error::Config(format!("unknown mountpath {key}")));
            };
            let mut next = HashMap::clone(&dis);
            next.remove(key);
            *dis = Arc::new(next);
            mp
        };
        {
            let mut avail = self.available.write();
            let mut next = HashMap::clone(&avail);
            next.insert(key.to_string(), Arc::clone(&mp));
            *avail = Arc::new(next);
        }
        info!(%mp, "mountpath enabled");
        let _ = self.events.send(MountpathEvent::Enabled(Arc::clone(&mp)));
        Ok(true)
    }

    /// Disable an available mountpath, keeping it registered;
    /// returns false if it was already disabled
    pub fn disable(&self, key: &str) -> Result<bool> {
        let mp = {
            let mut avail = self.available.write();
            let Some(mp) = avail.get(key).cloned() else {
                if self.disabled.read().contains_key(key) {
                    return Ok(false);
                }
                return Err(Error::Config(format!("unknown mountpath {key}")));
            };
            let mut next = HashMap::clone(&avail);
            next.remove(key);
            *avail = Arc::new(next);
            mp
        };
        {
            let mut dis = self.disabled.write();
            let mut next = HashMap::clone(&dis);
            next.insert(key.to_string(), Arc::clone(&mp));
            *dis = Arc::new(next);
        }
        warn!(%mp, "mountpath disabled");
        let _ = self.events.send(MountpathEvent::Disabled(Arc::clone(&mp)));
        Ok(true)
    }

    /// Unregister a mountpath entirely (available or disabled)
    pub fn remove(&self, key: &str) -> Result<Arc<Mountpath>> {
        let from_avail = {
            let mut avail = self.available.write();
            if let Some(mp) = avail.get(key).cloned() {
                let mut next = HashMap::clone(&avail);
                next.remove(key);
                *avail = Arc::new(next);
                Some(mp)
            } else {
                None
            }
        };
        let mp = match from_avail {
            Some(mp) => mp,
            None => {
                let mut dis = self.disabled.write();
                let Some(mp) = dis.get(key).cloned() else {
                    return Err(Error::Config(format!("unknown mountpath {key}")));
                };
                let mut next = HashMap::clone(&dis);
                next.remove(key);
                *dis = Arc::new(next);
                mp
            }
        };
        info!(%mp, "mountpath removed");
        let _ = self.events.send(MountpathEvent::Removed(Arc::clone(&mp)));
        Ok(mp)
    }

    /// Average used capacity across available mountpaths and the OOS verdict
    /// against the given watermark
    pub fn avg_cap_used(&self, oos_wm: i32) -> Result<(i32, bool)> {
        let snap = self.snapshot();
        if snap.is_empty() {
            return Err(Error::NoMountpaths);
        }
        let mut sum = 0i64;
        for mp in snap.values() {
            let (used, _) = mp.capacity()?;
            sum += i64::from(used);
        }
        let avg = (sum / snap.len() as i64) as i32;
        Ok((avg, avg >= oos_wm))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use shoal_common::Provider;

    fn registry_with(n: usize) -> (MountpathRegistry, Vec<tempfile::TempDir>, Vec<String>) {
        let reg = MountpathRegistry::new();
        let mut dirs = Vec::new();
        let mut keys = Vec::new();
        for _ in 0..n {
            let dir = tempfile::tempdir().unwrap();
            let mp = reg.add(dir.path()).unwrap();
            keys.push(mp.key());
            dirs.push(dir);
        }
        (reg, dirs, keys)
    }

    #[test]
    fn test_add_disable_enable_remove() {
        let (reg, _dirs, keys) = registry_with(2);
        assert_eq!(reg.num_avail(), 2);

        assert!(reg.disable(&keys[0]).unwrap());
        assert_eq!(reg.num_avail(), 1);
        assert!(!reg.disable(&keys[0]).unwrap());

        assert!(reg.enable(&keys[0]).unwrap());
        assert_eq!(reg.num_avail(), 2);

        reg.remove(&keys[1]).unwrap();
        assert_eq!(reg.num_avail(), 1);
        assert!(reg.remove(&keys[1]).is_err());
    }

    #[test]
    fn test_duplicate_add_rejected() {
        let (reg, dirs, _keys) = registry_with(1);
        assert!(reg.add(dirs[0].path()).is_err());
    }

    #[test]
    fn test_events_emitted() {
        let (reg, _dirs, keys) = registry_with(1);
        let mut rx = reg.subscribe();
        reg.disable(&keys[0]).unwrap();
        match rx.try_recv().unwrap() {
            MountpathEvent::Disabled(mp) => assert_eq!(mp.key(), keys[0]),
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[test]
    fn test_snapshot_is_stable() {
        let (reg, _dirs, keys) = registry_with(2);
        let snap = reg.snapshot();
        reg.remove(&keys[0]).unwrap();
        // the old snapshot still sees both mountpaths
        assert_eq!(snap.len(), 2);
        assert_eq!(reg.num_avail(), 1);
    }

    #[test]
    fn test_fqn_layout() {
        let (reg, _dirs, _keys) = registry_with(1);
        let snap = reg.snapshot();
        let mp = snap.values().next().unwrap();
        let bck = Bck::new("photos", Provider::Ais);
        let fqn = mp.make_fqn(ContentType::Object, &bck, "cats/1.jpg");
        assert!(fqn.starts_with(mp.path()));
        assert!(fqn.to_string_lossy().contains("ais/photos/cats/1.jpg"));
    }
}
