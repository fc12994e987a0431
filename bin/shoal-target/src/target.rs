//! Target state
//!
//! Everything the request lifecycle needs, bundled behind one `Arc`:
//! membership and bucket snapshots, the mountpath registry and its health
//! counter, the LOM cache and lock table, the cloud backend, the GFN
//! window flags, and the capacity gate.

use crate::cloud::CloudBackend;
use shoal_cluster::{BmdOwner, Lom, LomCache, OlockTable, SmapOwner, Snode};
use shoal_common::{Bck, Config, Error, Result};
use shoal_fs::{FsHealth, MountpathRegistry};
use shoal_memsys::MemSys;
use shoal_transport::{Collector, RecvRegistry};
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

/// GFN window opened by mountpath operations on this target
#[derive(Default)]
pub struct LocalGfn {
    lookup: AtomicBool,
}

impl LocalGfn {
    #[must_use]
    pub fn active(&self) -> bool {
        self.lookup.load(Ordering::Acquire)
    }

    /// Returns whether the window was already open
    pub fn activate(&self) -> bool {
        let was = self.lookup.swap(true, Ordering::AcqRel);
        if !was {
            info!("local GFN activated");
        }
        was
    }

    pub fn deactivate(&self) {
        self.lookup.store(false, Ordering::Release);
        info!("local GFN deactivated");
    }
}

/// GFN window opened when cluster membership changes; self-expires at the
/// deadline even without an explicit deactivate
#[derive(Default)]
pub struct GlobalGfn {
    lookup: AtomicBool,
    deadline_ns: AtomicI64,
}

impl GlobalGfn {
    #[must_use]
    pub fn active(&self) -> bool {
        if !self.lookup.load(Ordering::Acquire) {
            return false;
        }
        // deadline exceeded: the membership change settled without a new one
        if shoal_cluster::lom::now_ns() > self.deadline_ns.load(Ordering::Acquire) {
            self.deactivate();
            return false;
        }
        true
    }

    pub fn activate(&self, window: Duration) {
        self.deadline_ns.store(
            shoal_cluster::lom::now_ns() + window.as_nanos() as i64,
            Ordering::Release,
        );
        self.lookup.store(true, Ordering::Release);
        info!("global GFN activated");
    }

    pub fn deactivate(&self) {
        self.lookup.store(false, Ordering::Release);
        info!("global GFN deactivated");
    }
}

/// Used-capacity gate; refreshed by housekeeping and on demand
#[derive(Default)]
pub struct CapUsed {
    used_pct: AtomicI32,
    oos: AtomicBool,
}

/// Whether rebalance/resilver jobs are currently running on this target
#[derive(Default)]
pub struct RebState {
    global: AtomicBool,
    resilver: AtomicBool,
}

impl RebState {
    #[must_use]
    pub fn global_running(&self) -> bool {
        self.global.load(Ordering::Acquire)
    }

    #[must_use]
    pub fn resilver_running(&self) -> bool {
        self.resilver.load(Ordering::Acquire)
    }

    pub fn set_global(&self, running: bool) {
        self.global.store(running, Ordering::Release);
    }

    pub fn set_resilver(&self, running: bool) {
        self.resilver.store(running, Ordering::Release);
    }
}

/// Request counters, exposed by the daemon stats endpoint
#[derive(Default)]
pub struct TargetStats {
    pub get_n: AtomicI64,
    pub put_n: AtomicI64,
    pub delete_n: AtomicI64,
    pub head_n: AtomicI64,
    pub cold_get_n: AtomicI64,
    pub gfn_restore_n: AtomicI64,
    pub redirect_latency_ns: AtomicI64,
}

pub struct Target {
    pub snode: Snode,
    pub config: Config,
    pub client: reqwest::Client,
    /// Client sized for large object transfers
    pub data_client: reqwest::Client,
    pub smap: SmapOwner,
    pub bmd: BmdOwner,
    pub mountpaths: Arc<MountpathRegistry>,
    pub lom_cache: Arc<LomCache>,
    pub locks: Arc<OlockTable>,
    pub fshc: FsHealth,
    pub mem: Arc<MemSys>,
    pub cloud: Arc<dyn CloudBackend>,
    pub collector: Collector,
    pub recv_registry: Arc<RecvRegistry>,
    pub local_gfn: LocalGfn,
    pub global_gfn: GlobalGfn,
    pub reb_state: RebState,
    pub stats: TargetStats,
    cap: CapUsed,
}

impl Target {
    pub fn new(
        snode: Snode,
        config: Config,
        mountpaths: Arc<MountpathRegistry>,
        cloud: Arc<dyn CloudBackend>,
    ) -> Result<Arc<Self>> {
        if mountpaths.num_avail() == 0 {
            return Err(Error::NoMountpaths);
        }
        let client = reqwest::Client::builder()
            .timeout(config.timeout.cplane())
            .build()
            .map_err(|e| Error::Config(e.to_string()))?;
        let data_client = reqwest::Client::builder()
            .timeout(config.timeout.send_file())
            .build()
            .map_err(|e| Error::Config(e.to_string()))?;
        let fshc = FsHealth::new(Arc::clone(&mountpaths), config.fshc.clone());
        Ok(Arc::new(Self {
            snode,
            config,
            client,
            data_client,
            smap: SmapOwner::new(),
            bmd: BmdOwner::new(),
            mountpaths,
            lom_cache: LomCache::new(),
            locks: OlockTable::new(),
            fshc,
            mem: MemSys::new(),
            cloud,
            collector: Collector::spawn(),
            recv_registry: RecvRegistry::new(),
            local_gfn: LocalGfn::default(),
            global_gfn: GlobalGfn::default(),
            reb_state: RebState::default(),
            stats: TargetStats::default(),
            cap: CapUsed::default(),
        }))
    }

    #[must_use]
    pub fn tid(&self) -> &str {
        &self.snode.id
    }

    /// Construct a LOM against the current BMD and mountpath snapshot
    pub fn lom(&self, bck: Bck, objname: &str) -> Result<Lom> {
        Lom::init(bck, objname, &self.mountpaths, &self.bmd.get())
    }

    /// Feed an I/O failure to the filesystem health checker
    pub fn fs_error(&self, err: &Error, path: &Path) {
        if let Error::Io(io_err) = err {
            if self.fshc.on_error(io_err, path) {
                self.lom_cache.evict_mountpath(path);
            }
        }
    }

    /// Refresh average used capacity and the OOS verdict
    pub fn refresh_cap(&self) -> Result<(i32, bool)> {
        let (used, oos) = self
            .mountpaths
            .avg_cap_used(self.config.capacity.oos_wm)?;
        self.cap.used_pct.store(used, Ordering::Relaxed);
        let was = self.cap.oos.swap(oos, Ordering::Relaxed);
        if oos && !was {
            warn!(used, "target is out of space");
        }
        Ok((used, oos))
    }

    /// Current average used capacity and OOS flag, without rescanning
    #[must_use]
    pub fn avg_cap_used(&self) -> (i32, bool) {
        (
            self.cap.used_pct.load(Ordering::Relaxed),
            self.cap.oos.load(Ordering::Relaxed),
        )
    }

    /// PUTs are rejected while out of space; GETs are not
    pub fn check_oos(&self) -> Result<()> {
        let (used, oos) = self.avg_cap_used();
        if oos {
            return Err(Error::OutOfSpace { used_pct: used });
        }
        Ok(())
    }

    #[cfg(test)]
    pub fn set_oos_for_test(&self, oos: bool) {
        self.cap.oos.store(oos, Ordering::Relaxed);
        self.cap.used_pct.store(if oos { 99 } else { 10 }, Ordering::Relaxed);
    }
}
