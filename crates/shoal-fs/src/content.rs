//! On-disk content layout
//!
//! Object files and workfiles live under distinct roots of each mountpath so
//! that a crashed target can garbage-collect staging leftovers by type. A
//! workfile name carries the originating operation, the process id, and a
//! process-unique counter; it is only ever promoted by an atomic rename.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

/// Content categories stored on a mountpath
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ContentType {
    /// Finalized objects
    Object,
    /// Staging files pending atomic rename
    Workfile,
    /// Erasure-coded slices held for peers
    EcSlice,
}

impl ContentType {
    pub const ALL: [ContentType; 3] = [Self::Object, Self::Workfile, Self::EcSlice];

    /// Top-level directory under the mountpath root
    #[must_use]
    pub const fn dir(&self) -> &'static str {
        match self {
            Self::Object => "obj",
            Self::Workfile => "work",
            Self::EcSlice => "ec",
        }
    }
}

/// The operation a workfile stages for
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WorkfileTag {
    Put,
    ColdGet,
    Remote,
    Rebalance,
}

impl WorkfileTag {
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Put => "put",
            Self::ColdGet => "coldget",
            Self::Remote => "remote",
            Self::Rebalance => "reb",
        }
    }
}

static WORKFILE_SEQ: AtomicU64 = AtomicU64::new(1);

/// Derive a unique workfile path from an object workfile root
#[must_use]
pub fn unique_workfile(base: &Path, tag: WorkfileTag) -> PathBuf {
    let seq = WORKFILE_SEQ.fetch_add(1, Ordering::Relaxed);
    let pid = std::process::id();
    let name = match base.file_name() {
        Some(n) => format!("{}.{}.{pid}.{seq}", n.to_string_lossy(), tag.as_str()),
        None => format!("workfile.{}.{pid}.{seq}", tag.as_str()),
    };
    base.with_file_name(name)
}

/// Path of the metadata sidecar for an object fqn
#[must_use]
pub fn lmeta_fqn(fqn: &Path) -> PathBuf {
    let mut os = fqn.as_os_str().to_owned();
    os.push(".lmeta");
    PathBuf::from(os)
}
