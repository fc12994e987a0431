//! Shoal Common - shared types and utilities
//!
//! This crate provides the types, error definitions, checksums, and
//! configuration used across all shoal components.

pub mod cksum;
pub mod config;
pub mod error;
pub mod types;

pub use cksum::{Cksum, CksumCalculator, CksumType};
pub use config::Config;
pub use error::{Error, Result};
pub use types::*;
