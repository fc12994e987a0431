//! Filesystem health checker
//!
//! Every I/O error observed on a mountpath feeds this counter. Past the
//! configured limit the mountpath is disabled through the registry, which
//! broadcasts the event that opens the GFN window and starts a resilver.

use crate::mountpath::MountpathRegistry;
use parking_lot::Mutex;
use shoal_common::config::FshcConf;
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use tracing::{error, warn};

pub struct FsHealth {
    registry: Arc<MountpathRegistry>,
    conf: FshcConf,
    errors: Mutex<HashMap<String, u32>>,
}

impl FsHealth {
    #[must_use]
    pub fn new(registry: Arc<MountpathRegistry>, conf: FshcConf) -> Self {
        Self {
            registry,
            conf,
            errors: Mutex::new(HashMap::new()),
        }
    }

    /// Record an I/O error against the mountpath owning `path`.
    /// Returns true if the mountpath was disabled as a result.
    pub fn on_error(&self, err: &std::io::Error, path: &Path) -> bool {
        if !self.conf.enabled {
            return false;
        }
        let Some(mp) = self.registry.resolve(path) else {
            return false;
        };
        let key = mp.key();
        let count = {
            let mut errors = self.errors.lock();
            let count = errors.entry(key.clone()).or_insert(0);
            *count += 1;
            *count
        };
        warn!(%mp, %err, count, "I/O error on mountpath");
        if count < self.conf.err_limit {
            return false;
        }
        error!(%mp, count, "error limit reached, disabling mountpath");
        self.errors.lock().remove(&key);
        matches!(self.registry.disable(&key), Ok(true))
    }

    /// Forget accumulated errors for a mountpath (e.g., after re-enable)
    pub fn reset(&self, key: &str) {
        self.errors.lock().remove(key);
    }
}
