//! Shoal Cluster - membership views, placement, and object metadata
//!
//! Read-only snapshots of cluster membership (Smap) and bucket properties
//! (BMD), the HRW placement function over them, the per-object metadata
//! cache (LOM), and the per-object lock table with write-to-read downgrade.
//! Snapshots are produced elsewhere (metasync); this crate only consumes
//! installed values.

pub mod hrw;
pub mod lock;
pub mod lom;
pub mod smap;

pub use hrw::{hrw_mpath, hrw_rank, hrw_target};
pub use lock::{OlockTable, ReadGuard, WriteGuard};
pub use lom::{Lom, LomCache, LomMeta};
pub use smap::{Bmd, BmdOwner, Network, Smap, SmapOwner, Snode};
