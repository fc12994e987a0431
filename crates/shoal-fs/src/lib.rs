//! Shoal FS - local filesystems of a storage target
//!
//! A *mountpath* is a local filesystem root reserved for object storage.
//! This crate owns the registry of available/disabled mountpaths, the
//! on-disk content layout (object files, metadata sidecars, workfiles),
//! capacity accounting, and the health counter that disables a mountpath
//! after repeated I/O errors.

pub mod content;
pub mod health;
pub mod mountpath;

pub use content::{lmeta_fqn, unique_workfile, ContentType, WorkfileTag};
pub use health::FsHealth;
pub use mountpath::{Mountpath, MountpathEvent, MountpathRegistry};
