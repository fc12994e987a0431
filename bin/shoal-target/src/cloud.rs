//! Cloud backend interface
//!
//! The authoritative store for cloud-provider buckets. The target only ever
//! talks to it through this trait; production backends live out of tree, and
//! the in-memory mock backs tests and single-node development.

use async_trait::async_trait;
use parking_lot::RwLock;
use shoal_common::{cksum, Bck, Cksum, CksumType, Error, Result};
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

/// Object attributes as known to the cloud
#[derive(Clone, Debug, Default)]
pub struct CloudMeta {
    pub size: i64,
    pub cksum: Cksum,
    pub version: String,
}

/// Bucket properties as known to the cloud
#[derive(Clone, Debug, Default)]
pub struct CloudBckProps {
    pub versioning: bool,
}

#[async_trait]
pub trait CloudBackend: Send + Sync {
    async fn head_obj(&self, bck: &Bck, objname: &str) -> Result<CloudMeta>;

    /// Download an object into `workpath`, returning its attributes
    async fn get_obj(&self, bck: &Bck, objname: &str, workpath: &Path) -> Result<CloudMeta>;

    /// Upload an object from a local file, returning the new version
    async fn put_obj(&self, bck: &Bck, objname: &str, path: &Path) -> Result<String>;

    async fn delete_obj(&self, bck: &Bck, objname: &str) -> Result<()>;

    async fn head_bucket(&self, bck: &Bck) -> Result<CloudBckProps>;

    async fn list_buckets(&self) -> Result<Vec<String>>;
}

/// In-memory cloud for tests and development
#[derive(Default)]
pub struct MockCloud {
    objects: RwLock<HashMap<String, (Vec<u8>, CloudMeta)>>,
}

impl MockCloud {
    #[must_use]
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Seed an object directly, as if it had always lived in the cloud
    pub fn seed(&self, bck: &Bck, objname: &str, body: &[u8]) {
        let meta = CloudMeta {
            size: body.len() as i64,
            cksum: cksum::compute(CksumType::Xxhash64, body),
            version: "1".into(),
        };
        self.objects
            .write()
            .insert(bck.make_uname(objname), (body.to_vec(), meta));
    }

    fn not_found(bck: &Bck, objname: &str) -> Error {
        Error::NotFound {
            bucket: bck.to_string(),
            objname: objname.to_string(),
        }
    }
}

#[async_trait]
impl CloudBackend for MockCloud {
    async fn head_obj(&self, bck: &Bck, objname: &str) -> Result<CloudMeta> {
        self.objects
            .read()
            .get(&bck.make_uname(objname))
            .map(|(_, meta)| meta.clone())
            .ok_or_else(|| Self::not_found(bck, objname))
    }

    async fn get_obj(&self, bck: &Bck, objname: &str, workpath: &Path) -> Result<CloudMeta> {
        let (body, meta) = self
            .objects
            .read()
            .get(&bck.make_uname(objname))
            .cloned()
            .ok_or_else(|| Self::not_found(bck, objname))?;
        tokio::fs::write(workpath, &body).await?;
        Ok(meta)
    }

    async fn put_obj(&self, bck: &Bck, objname: &str, path: &Path) -> Result<String> {
        let body = tokio::fs::read(path).await?;
        let uname = bck.make_uname(objname);
        let mut objects = self.objects.write();
        let version = objects
            .get(&uname)
            .map_or_else(|| "1".to_string(), |(_, meta)| {
                meta.version.parse::<u64>().map_or(1, |v| v + 1).to_string()
            });
        let meta = CloudMeta {
            size: body.len() as i64,
            cksum: cksum::compute(CksumType::Xxhash64, &body),
            version: version.clone(),
        };
        objects.insert(uname, (body, meta));
        Ok(version)
    }

    async fn delete_obj(&self, bck: &Bck, objname: &str) -> Result<()> {
        self.objects
            .write()
            .remove(&bck.make_uname(objname))
            .map(|_| ())
            .ok_or_else(|| Self::not_found(bck, objname))
    }

    async fn head_bucket(&self, _bck: &Bck) -> Result<CloudBckProps> {
        Ok(CloudBckProps { versioning: true })
    }

    async fn list_buckets(&self) -> Result<Vec<String>> {
        let objects = self.objects.read();
        let mut names: Vec<String> = objects
            .keys()
            .filter_map(|uname| uname.split('/').nth(2).map(str::to_string))
            .collect();
        names.sort();
        names.dedup();
        Ok(names)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use shoal_common::Provider;

    #[tokio::test]
    async fn test_mock_cloud_round_trip() {
        let cloud = MockCloud::new();
        let bck = Bck::new("remote", Provider::Aws);
        cloud.seed(&bck, "x", b"abc");

        let meta = cloud.head_obj(&bck, "x").await.unwrap();
        assert_eq!(meta.size, 3);
        assert_eq!(meta.version, "1");

        let dir = tempfile::tempdir().unwrap();
        let work = dir.path().join("w");
        cloud.get_obj(&bck, "x", &work).await.unwrap();
        assert_eq!(std::fs::read(&work).unwrap(), b"abc");

        // put bumps the version
        std::fs::write(&work, b"abcd").unwrap();
        let ver = cloud.put_obj(&bck, "x", &work).await.unwrap();
        assert_eq!(ver, "2");

        cloud.delete_obj(&bck, "x").await.unwrap();
        assert!(cloud.head_obj(&bck, "x").await.is_err());
    }
}
