//! Cluster map (Smap) and bucket map (BMD) snapshots
//!
//! Both are immutable values: an owner holds the current `Arc` and swaps it
//! wholesale when a new version is installed. Consumers clone the `Arc` once
//! and keep a consistent view for the duration of an operation.

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use shoal_common::{Bck, BckProps, Error, Provider, Result};
use std::collections::HashMap;
use std::sync::Arc;

/// Which of a node's addresses to use
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Network {
    Public,
    IntraControl,
    IntraData,
}

/// One cluster node (target or proxy)
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Snode {
    pub id: String,
    pub public_url: String,
    #[serde(default)]
    pub intra_control_url: String,
    #[serde(default)]
    pub intra_data_url: String,
}

impl Snode {
    #[must_use]
    pub fn new(id: impl Into<String>, public_url: impl Into<String>) -> Self {
        let public_url = public_url.into();
        Self {
            id: id.into(),
            intra_control_url: public_url.clone(),
            intra_data_url: public_url.clone(),
            public_url,
        }
    }

    /// Address for the given network, falling back to the public one
    #[must_use]
    pub fn url(&self, net: Network) -> &str {
        let url = match net {
            Network::Public => &self.public_url,
            Network::IntraControl => &self.intra_control_url,
            Network::IntraData => &self.intra_data_url,
        };
        if url.is_empty() {
            &self.public_url
        } else {
            url
        }
    }
}

/// Immutable snapshot of cluster membership
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct Smap {
    pub version: i64,
    pub uuid: String,
    pub targets: HashMap<String, Arc<Snode>>,
    pub proxies: HashMap<String, Arc<Snode>>,
}

impl Smap {
    #[must_use]
    pub fn count_targets(&self) -> usize {
        self.targets.len()
    }

    #[must_use]
    pub fn get_target(&self, id: &str) -> Option<&Arc<Snode>> {
        self.targets.get(id)
    }

    #[must_use]
    pub fn get_proxy(&self, id: &str) -> Option<&Arc<Snode>> {
        self.proxies.get(id)
    }
}

/// Holder of the current Smap
#[derive(Default)]
pub struct SmapOwner {
    inner: RwLock<Arc<Smap>>,
}

impl SmapOwner {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot the current map
    #[must_use]
    pub fn get(&self) -> Arc<Smap> {
        Arc::clone(&self.inner.read())
    }

    /// Install a new version; older versions are rejected
    pub fn put(&self, smap: Smap) -> Result<()> {
        let mut cur = self.inner.write();
        if smap.version < cur.version {
            return Err(Error::SmapOutOfSync(format!(
                "refusing to downgrade v{} -> v{}",
                cur.version, smap.version
            )));
        }
        *cur = Arc::new(smap);
        Ok(())
    }
}

/// Immutable snapshot of buckets and their properties
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct Bmd {
    pub version: i64,
    /// Keyed by bucket uname
    pub buckets: HashMap<String, BckProps>,
}

impl Bmd {
    /// Properties of a bucket, if registered
    #[must_use]
    pub fn get(&self, bck: &Bck) -> Option<&BckProps> {
        self.buckets.get(&bck.uname())
    }

    /// Resolve properties for an operation: ais buckets must be registered;
    /// cloud buckets fall back to defaults when not
    pub fn resolve(&self, bck: &Bck) -> Result<BckProps> {
        match self.get(bck) {
            Some(props) => Ok(props.clone()),
            None if bck.provider.is_cloud() => Ok(BckProps {
                provider: bck.provider,
                ..Default::default()
            }),
            None => Err(Error::BucketNotFound(bck.to_string())),
        }
    }

    /// Register a bucket; errors if it already exists
    pub fn add(&mut self, bck: &Bck, props: BckProps) -> Result<()> {
        props.validate()?;
        let uname = bck.uname();
        if self.buckets.contains_key(&uname) {
            return Err(Error::BucketExists(bck.to_string()));
        }
        self.buckets.insert(uname, props);
        Ok(())
    }

    /// Names of registered ais buckets
    #[must_use]
    pub fn ais_bucket_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .buckets
            .iter()
            .filter(|(_, p)| p.provider == Provider::Ais)
            .map(|(uname, _)| {
                uname
                    .rsplit('/')
                    .next()
                    .unwrap_or(uname.as_str())
                    .to_string()
            })
            .collect();
        names.sort();
        names
    }
}

/// Holder of the current BMD; installs are serialized by the write lock
#[derive(Default)]
pub struct BmdOwner {
    inner: RwLock<Arc<Bmd>>,
}

impl BmdOwner {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn get(&self) -> Arc<Bmd> {
        Arc::clone(&self.inner.read())
    }

    pub fn put(&self, bmd: Bmd) -> Result<()> {
        let mut cur = self.inner.write();
        if bmd.version < cur.version {
            return Err(Error::SmapOutOfSync(format!(
                "refusing to downgrade BMD v{} -> v{}",
                cur.version, bmd.version
            )));
        }
        *cur = Arc::new(bmd);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn smap_with(n: usize) -> Smap {
        let mut smap = Smap {
            version: 1,
            uuid: "u1".into(),
            ..Default::default()
        };
        for i in 0..n {
            let id = format!("t{i}");
            smap.targets.insert(
                id.clone(),
                Arc::new(Snode::new(id, format!("http://127.0.0.1:{}", 8080 + i))),
            );
        }
        smap
    }

    #[test]
    fn test_owner_rejects_downgrade() {
        let owner = SmapOwner::new();
        let mut smap = smap_with(2);
        smap.version = 5;
        owner.put(smap).unwrap();

        let mut old = smap_with(2);
        old.version = 3;
        assert!(owner.put(old).is_err());
        assert_eq!(owner.get().version, 5);
    }

    #[test]
    fn test_snapshot_survives_install() {
        let owner = SmapOwner::new();
        owner.put(smap_with(2)).unwrap();
        let snap = owner.get();
        let mut next = smap_with(4);
        next.version = 2;
        owner.put(next).unwrap();
        assert_eq!(snap.count_targets(), 2);
        assert_eq!(owner.get().count_targets(), 4);
    }

    #[test]
    fn test_bmd_resolve() {
        let mut bmd = Bmd::default();
        let ais = Bck::new("local", Provider::Ais);
        let cloud = Bck::new("remote", Provider::Aws);

        assert!(bmd.resolve(&ais).is_err());
        assert!(bmd.resolve(&cloud).is_ok());

        bmd.add(&ais, BckProps::default()).unwrap();
        assert!(bmd.resolve(&ais).is_ok());
        assert!(matches!(
            bmd.add(&ais, BckProps::default()),
            Err(Error::BucketExists(_))
        ));
    }

    #[test]
    fn test_snode_url_fallback() {
        let mut node = Snode::new("t0", "http://pub");
        node.intra_data_url = String::new();
        assert_eq!(node.url(Network::IntraData), "http://pub");
        node.intra_data_url = "http://data".into();
        assert_eq!(node.url(Network::IntraData), "http://data");
    }
}
