//! Core type definitions for shoal
//!
//! Buckets, providers, namespaces, and per-bucket properties. A bucket is
//! the triple `(name, provider, namespace)`; its unique name (`uname`)
//! prefixes every object key in the cluster.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Bucket provider: native cluster buckets or a mirrored cloud backend
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Provider {
    #[default]
    Ais,
    Aws,
    Gcp,
    Azure,
}

impl Provider {
    /// All known provider names
    pub const ALL: [Provider; 4] = [Self::Ais, Self::Aws, Self::Gcp, Self::Azure];

    /// Parse a provider from its query-parameter form; empty means ais
    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "" | "ais" => Ok(Self::Ais),
            "aws" => Ok(Self::Aws),
            "gcp" => Ok(Self::Gcp),
            "azure" => Ok(Self::Azure),
            other => Err(Error::InvalidProvider(other.to_string())),
        }
    }

    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Ais => "ais",
            Self::Aws => "aws",
            Self::Gcp => "gcp",
            Self::Azure => "azure",
        }
    }

    /// True for cloud providers (anything that is not ais)
    #[must_use]
    pub const fn is_cloud(&self) -> bool {
        !matches!(self, Self::Ais)
    }
}

impl fmt::Display for Provider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Bucket namespace: a (name, uuid) pair; the default namespace is empty
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Ns {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub uuid: String,
}

impl Ns {
    #[must_use]
    pub fn is_global(&self) -> bool {
        self.name.is_empty() && self.uuid.is_empty()
    }
}

impl fmt::Display for Ns {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_global() {
            f.write_str("@")
        } else {
            write!(f, "@{}#{}", self.uuid, self.name)
        }
    }
}

/// Bucket identity: `(name, provider, namespace)`
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Bck {
    pub name: String,
    #[serde(default)]
    pub provider: Provider,
    #[serde(default)]
    pub ns: Ns,
}

impl Bck {
    #[must_use]
    pub fn new(name: impl Into<String>, provider: Provider) -> Self {
        Self {
            name: name.into(),
            provider,
            ns: Ns::default(),
        }
    }

    #[must_use]
    pub fn is_ais(&self) -> bool {
        self.provider == Provider::Ais
    }

    /// Unique bucket name, the cluster-wide prefix for all its objects
    #[must_use]
    pub fn uname(&self) -> String {
        format!("{}/{}/{}", self.provider, self.ns, self.name)
    }

    /// Unique object name: `uname` of the bucket joined with the object name
    #[must_use]
    pub fn make_uname(&self, objname: &str) -> String {
        format!("{}/{}/{}/{}", self.provider, self.ns, self.name, objname)
    }

    /// Validate the bucket name itself (not its properties)
    pub fn validate(&self) -> Result<()> {
        if self.name.is_empty() {
            return Err(Error::bad_request("empty bucket name"));
        }
        if self
            .name
            .bytes()
            .any(|b| !(b.is_ascii_alphanumeric() || b == b'-' || b == b'_' || b == b'.'))
        {
            return Err(Error::bad_request(format!(
                "bucket name {:?} contains invalid characters",
                self.name
            )));
        }
        Ok(())
    }
}

impl fmt::Display for Bck {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.provider, self.name)
    }
}

/// Access attribute bitmask
pub mod access {
    pub const GET: u64 = 1 << 0;
    pub const HEAD: u64 = 1 << 1;
    pub const PUT: u64 = 1 << 2;
    pub const DELETE: u64 = 1 << 3;
    pub const COLD_GET: u64 = 1 << 4;

    pub const ALL: u64 = GET | HEAD | PUT | DELETE | COLD_GET;
}

/// Per-bucket versioning configuration
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct VersionConf {
    pub enabled: bool,
    /// Validate the cached version against the cloud on warm GET
    #[serde(default)]
    pub validate_warm_get: bool,
}

impl Default for VersionConf {
    fn default() -> Self {
        Self {
            enabled: true,
            validate_warm_get: false,
        }
    }
}

/// Per-bucket checksum configuration
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CksumConf {
    #[serde(rename = "type", default)]
    pub ty: crate::cksum::CksumType,
    /// Re-validate stored objects on warm GET
    #[serde(default)]
    pub validate_warm_get: bool,
    /// Validate objects fetched from the cloud
    #[serde(default)]
    pub validate_cold_get: bool,
}

/// LRU watermarks, percent of used capacity
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct LruConf {
    pub enabled: bool,
    pub low_wm: i32,
    pub high_wm: i32,
    /// Beyond this point the target reports out-of-space
    pub oos_wm: i32,
}

impl Default for LruConf {
    fn default() -> Self {
        Self {
            enabled: true,
            low_wm: 75,
            high_wm: 90,
            oos_wm: 95,
        }
    }
}

/// Local mirroring (n-way replication within a target)
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MirrorConf {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub copies: i64,
}

/// Per-bucket erasure coding configuration
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EcConf {
    #[serde(default)]
    pub enabled: bool,
    /// Objects below this size are replicated instead of EC'ed
    #[serde(default)]
    pub obj_size_limit: i64,
    #[serde(default)]
    pub data_slices: i32,
    #[serde(default)]
    pub parity_slices: i32,
}

impl EcConf {
    /// Minimum number of targets required to restore an EC'ed object
    #[must_use]
    pub fn required_restore_targets(&self) -> usize {
        (self.data_slices + self.parity_slices) as usize
    }
}

/// Bucket properties
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct BckProps {
    #[serde(default)]
    pub provider: Provider,
    /// When set, this ais bucket caches the given cloud bucket
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub backend_bck: Option<Bck>,
    #[serde(default)]
    pub versioning: VersionConf,
    #[serde(default)]
    pub cksum: CksumConf,
    #[serde(default)]
    pub lru: LruConf,
    #[serde(default)]
    pub mirror: MirrorConf,
    #[serde(default)]
    pub ec: EcConf,
    #[serde(default = "default_access")]
    pub access: u64,
    #[serde(default)]
    pub created: i64,
}

fn default_access() -> u64 {
    access::ALL
}

impl BckProps {
    /// Validate property invariants
    pub fn validate(&self) -> Result<()> {
        if self.ec.enabled && self.mirror.enabled {
            return Err(Error::InvalidBucketProps(
                "erasure coding and mirroring are mutually exclusive".into(),
            ));
        }
        if self.ec.enabled && (self.ec.data_slices < 1 || self.ec.parity_slices < 1) {
            return Err(Error::InvalidBucketProps(format!(
                "invalid EC geometry {}+{}",
                self.ec.data_slices, self.ec.parity_slices
            )));
        }
        if let Some(backend) = &self.backend_bck {
            if self.provider.is_cloud() {
                return Err(Error::InvalidBucketProps(
                    "backend bucket is only legal on an ais bucket".into(),
                ));
            }
            if !backend.provider.is_cloud() {
                return Err(Error::InvalidBucketProps(
                    "backend bucket must name a cloud provider".into(),
                ));
            }
        }
        Ok(())
    }

    /// Check an operation against the access mask
    pub fn allow(&self, op: u64) -> Result<()> {
        if self.access & op == 0 {
            return Err(Error::bad_request("operation denied by bucket access mask"));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_provider_parse() {
        assert_eq!(Provider::parse("").unwrap(), Provider::Ais);
        assert_eq!(Provider::parse("aws").unwrap(), Provider::Aws);
        assert!(Provider::parse("s3").is_err());
    }

    #[test]
    fn test_uname_is_unambiguous() {
        let a = Bck::new("data", Provider::Ais);
        let b = Bck::new("data", Provider::Aws);
        assert_ne!(a.make_uname("x"), b.make_uname("x"));
        assert!(a.make_uname("x").starts_with(&a.uname()));
    }

    #[test]
    fn test_props_ec_mirror_exclusive() {
        let props = BckProps {
            ec: EcConf {
                enabled: true,
                data_slices: 2,
                parity_slices: 1,
                ..Default::default()
            },
            mirror: MirrorConf {
                enabled: true,
                copies: 2,
            },
            ..Default::default()
        };
        assert!(props.validate().is_err());
    }

    #[test]
    fn test_props_backend_bck() {
        let mut props = BckProps {
            backend_bck: Some(Bck::new("remote", Provider::Aws)),
            ..Default::default()
        };
        assert!(props.validate().is_ok());

        props.provider = Provider::Aws;
        assert!(props.validate().is_err());

        props.provider = Provider::Ais;
        props.backend_bck = Some(Bck::new("local", Provider::Ais));
        assert!(props.validate().is_err());
    }

    #[test]
    fn test_access_mask() {
        let props = BckProps {
            access: access::GET | access::HEAD,
            ..Default::default()
        };
        assert!(props.allow(access::GET).is_ok());
        assert!(props.allow(access::PUT).is_err());
    }
}
