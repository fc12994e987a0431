//! Erasure-coded slices: distribution after PUT, reconstruction on a miss
//!
//! Slices ship over the regular object stream (transport name `ec`) to the
//! HRW-ranked targets for the object, self included. Reconstruction pulls
//! slices back from peers over the intra-data network and decodes once a
//! quorum of `data_slices` shards is in hand. Shards are padded to a
//! multiple of 64 bytes for the codec; the true object size travels in the
//! slice metadata.

use crate::api;
use crate::target::Target;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use shoal_cluster::{hrw_mpath, hrw_rank, Lom, Network};
use shoal_common::{cksum, Bck, Error, Result};
use shoal_fs::{ContentType, WorkfileTag};
use shoal_transport::{Extra, Obj, ObjBody, ObjHdr, Receiver, Stream};
use std::collections::HashMap;
use std::io::Cursor;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

pub const EC_TRNAME: &str = "ec";

const SHARD_ALIGN: usize = 64;

/// Travels in the stream header's opaque field, and in the `.ecmeta`
/// sidecar next to each stored slice
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SliceMeta {
    pub index: usize,
    pub data_slices: usize,
    pub parity_slices: usize,
    pub obj_size: i64,
    pub shard_len: usize,
}

fn slice_fqn(t: &Target, bck: &Bck, objname: &str) -> Result<PathBuf> {
    let uname = bck.make_uname(objname);
    let snap = t.mountpaths.snapshot();
    let mpaths: Vec<_> = snap.values().cloned().collect();
    let mp = hrw_mpath(&uname, &mpaths)?;
    Ok(mp.make_fqn(ContentType::EcSlice, bck, objname))
}

fn meta_fqn(slice: &PathBuf) -> PathBuf {
    let mut os = slice.as_os_str().to_owned();
    os.push(".ecmeta");
    PathBuf::from(os)
}

/// Store one slice locally (own share of a distribution, or inbound from
/// the putting target)
fn store_slice(t: &Target, bck: &Bck, objname: &str, meta: &SliceMeta, shard: &[u8]) -> Result<()> {
    let fqn = slice_fqn(t, bck, objname)?;
    if let Some(parent) = fqn.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(&fqn, shard)?;
    let encoded = serde_json::to_vec(meta).map_err(|e| Error::internal(e.to_string()))?;
    std::fs::write(meta_fqn(&fqn), encoded)?;
    Ok(())
}

/// Load the locally held slice, if any
pub fn load_slice(t: &Target, bck: &Bck, objname: &str) -> Result<Option<(SliceMeta, Vec<u8>)>> {
    let fqn = slice_fqn(t, bck, objname)?;
    let meta_bytes = match std::fs::read(meta_fqn(&fqn)) {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(Error::Io(e)),
    };
    let meta: SliceMeta =
        serde_json::from_slice(&meta_bytes).map_err(|e| Error::internal(e.to_string()))?;
    let shard = std::fs::read(&fqn)?;
    Ok(Some((meta, shard)))
}

/// Drop the local slice of a deleted object
pub fn cleanup(t: &Target, bck: &Bck, objname: &str) {
    if let Ok(fqn) = slice_fqn(t, bck, objname) {
        let _ = std::fs::remove_file(meta_fqn(&fqn));
        let _ = std::fs::remove_file(&fqn);
    }
}

/// Inbound slice handler (transport name `ec`)
pub struct EcReceiver {
    pub t: Arc<Target>,
}

#[async_trait]
impl Receiver for EcReceiver {
    async fn recv(&self, hdr: ObjHdr, body: &mut ObjBody<'_>) -> Result<()> {
        let meta: SliceMeta = serde_json::from_slice(&hdr.opaque)
            .map_err(|e| Error::ProtocolCorrupt(format!("slice metadata: {e}")))?;
        let shard = body.read_all().await?;
        if shard.len() != meta.shard_len {
            return Err(Error::ProtocolCorrupt(format!(
                "slice length {} != {}",
                shard.len(),
                meta.shard_len
            )));
        }
        store_slice(&self.t, &hdr.bck, &hdr.objname, &meta, &shard)?;
        debug!(bck = %hdr.bck, objname = hdr.objname, index = meta.index, "slice stored");
        Ok(())
    }
}

/// Post-PUT hook: encode and distribute slices when the bucket calls for it
pub fn on_put(t: &Arc<Target>, lom: &Lom) {
    let ec = &lom.props.ec;
    if !ec.enabled || lom.size() < ec.obj_size_limit {
        return;
    }
    let t = Arc::clone(t);
    let bck = lom.bck.clone();
    let objname = lom.objname.clone();
    tokio::spawn(async move {
        if let Err(e) = distribute(&t, bck, &objname).await {
            error!(%e, "EC distribution failed");
        }
    });
}

async fn distribute(t: &Arc<Target>, bck: Bck, objname: &str) -> Result<()> {
    let uname = bck.make_uname(objname);
    let _guard = t.locks.lock_shared(&uname).await;
    let mut lom = t.lom(bck.clone(), objname)?;
    lom.load(&t.lom_cache)?;

    let k = lom.props.ec.data_slices as usize;
    let m = lom.props.ec.parity_slices as usize;
    let data = tokio::fs::read(&lom.fqn).await?;
    let (shards, shard_len) = encode_shards(&data, k, m)?;

    let smap = t.smap.get();
    let ranked = hrw_rank(&uname, &smap);
    if ranked.is_empty() {
        return Err(Error::SmapOutOfSync("no targets for slice placement".into()));
    }

    let mut streams: HashMap<String, Stream> = HashMap::new();
    for (index, shard) in shards.iter().enumerate() {
        let meta = SliceMeta {
            index,
            data_slices: k,
            parity_slices: m,
            obj_size: lom.size(),
            shard_len,
        };
        let dest = &ranked[index % ranked.len()];
        if dest.id == t.tid() {
            store_slice(t, &bck, objname, &meta, shard)?;
            continue;
        }
        if !streams.contains_key(&dest.id) {
            let url = format!("{}/v1/transport/{EC_TRNAME}", dest.url(Network::IntraData));
            let stream = Stream::new(
                Some(t.data_client.clone()),
                url,
                &t.collector,
                Extra {
                    mem: Some(Arc::clone(&t.mem)),
                    ..Default::default()
                },
            )?;
            streams.insert(dest.id.clone(), stream);
        }
        let stream = streams.get(&dest.id).expect("inserted above");
        let hdr = ObjHdr {
            bck: bck.clone(),
            objname: objname.to_string(),
            opaque: serde_json::to_vec(&meta).map_err(|e| Error::internal(e.to_string()))?,
            attrs: shoal_transport::ObjAttrs {
                size: shard_len as i64,
                ..Default::default()
            },
        };
        stream
            .send(Obj::new(hdr, Box::new(Cursor::new(shard.clone()))))
            .await?;
    }
    for (dest, stream) in streams {
        let (_, err) = stream.fin().await;
        if let Some(err) = err {
            warn!(dest, %err, "slice stream ended with error");
        }
    }
    info!(obj = %lom, k, m, "slices distributed");
    Ok(())
}

/// Reconstruct a missing object from its slices. The caller holds the
/// exclusive object lock.
pub async fn restore(t: &Arc<Target>, lom: &mut Lom) -> Result<()> {
    let k = lom.props.ec.data_slices as usize;
    let m = lom.props.ec.parity_slices as usize;
    let mut shards: Vec<(usize, Vec<u8>)> = Vec::new();
    let mut meta: Option<SliceMeta> = None;

    if let Some((local_meta, shard)) = load_slice(t, &lom.bck, &lom.objname)? {
        shards.push((local_meta.index, shard));
        meta = Some(local_meta);
    }
    let smap = t.smap.get();
    for node in smap.targets.values().filter(|n| n.id != t.tid()) {
        if shards.len() >= k {
            break;
        }
        match fetch_slice(t, node.url(Network::IntraData), &lom.bck, &lom.objname).await {
            Ok(Some((peer_meta, shard))) => {
                if !shards.iter().any(|(idx, _)| *idx == peer_meta.index) {
                    shards.push((peer_meta.index, shard));
                    meta.get_or_insert(peer_meta);
                }
            }
            Ok(None) => {}
            Err(e) => debug!(peer = node.id, %e, "slice fetch"),
        }
    }
    let meta = meta.ok_or_else(|| Error::NotFound {
        bucket: lom.bck.to_string(),
        objname: lom.objname.clone(),
    })?;
    if shards.len() < k {
        return Err(Error::internal(format!(
            "not enough slices to restore: have {}, need {k}",
            shards.len()
        )));
    }

    let data = decode_shards(shards, k, m, meta.shard_len, meta.obj_size)?;

    let workfile = lom.new_workfile(WorkfileTag::Rebalance)?;
    tokio::fs::write(&workfile, &data).await?;
    if let Some(parent) = lom.fqn.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::rename(&workfile, &lom.fqn)?;

    lom.set_size(meta.obj_size);
    lom.set_cksum(cksum::compute(lom.props.cksum.ty, &data));
    lom.touch();
    lom.persist(&t.lom_cache)?;
    Ok(())
}

async fn fetch_slice(
    t: &Arc<Target>,
    base_url: &str,
    bck: &Bck,
    objname: &str,
) -> Result<Option<(SliceMeta, Vec<u8>)>> {
    let url = format!("{base_url}/v1/ec/slices/{}/{objname}", bck.name);
    let resp = t
        .client
        .get(url)
        .query(&[(api::QP_PROVIDER, bck.provider.as_str())])
        .send()
        .await
        .map_err(|e| Error::transient(e.to_string()))?;
    if resp.status().as_u16() == 404 {
        return Ok(None);
    }
    if !resp.status().is_success() {
        return Err(Error::Remote {
            status: resp.status().as_u16(),
            msg: "slice fetch".into(),
        });
    }
    let meta: SliceMeta = resp
        .headers()
        .get(api::HDR_SLICE_META)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| serde_json::from_str(v).ok())
        .ok_or_else(|| Error::ProtocolCorrupt("missing slice metadata header".into()))?;
    let body = resp
        .bytes()
        .await
        .map_err(|e| Error::transient(e.to_string()))?;
    Ok(Some((meta, body.to_vec())))
}

/// Split into `k` zero-padded data shards and `m` recovery shards
pub fn encode_shards(data: &[u8], k: usize, m: usize) -> Result<(Vec<Vec<u8>>, usize)> {
    if k == 0 {
        return Err(Error::InvalidBucketProps("zero data slices".into()));
    }
    let shard_len = (data.len().div_ceil(k)).next_multiple_of(SHARD_ALIGN).max(SHARD_ALIGN);
    let mut shards: Vec<Vec<u8>> = Vec::with_capacity(k + m);
    for i in 0..k {
        let start = (i * shard_len).min(data.len());
        let end = ((i + 1) * shard_len).min(data.len());
        let mut shard = data[start..end].to_vec();
        shard.resize(shard_len, 0);
        shards.push(shard);
    }
    let mut encoder = reed_solomon_simd::ReedSolomonEncoder::new(k, m, shard_len)
        .map_err(|e| Error::internal(e.to_string()))?;
    for shard in &shards {
        encoder
            .add_original_shard(shard)
            .map_err(|e| Error::internal(e.to_string()))?;
    }
    let result = encoder.encode().map_err(|e| Error::internal(e.to_string()))?;
    for recovery in result.recovery_iter() {
        shards.push(recovery.to_vec());
    }
    Ok((shards, shard_len))
}

/// Rebuild the object bytes from any `k` shards
pub fn decode_shards(
    shards: Vec<(usize, Vec<u8>)>,
    k: usize,
    m: usize,
    shard_len: usize,
    obj_size: i64,
) -> Result<Vec<u8>> {
    let mut originals: Vec<Option<Vec<u8>>> = vec![None; k];
    let mut decoder = reed_solomon_simd::ReedSolomonDecoder::new(k, m, shard_len)
        .map_err(|e| Error::internal(e.to_string()))?;
    for (index, shard) in shards {
        if index < k {
            decoder
                .add_original_shard(index, &shard)
                .map_err(|e| Error::internal(e.to_string()))?;
            originals[index] = Some(shard);
        } else {
            decoder
                .add_recovery_shard(index - k, &shard)
                .map_err(|e| Error::internal(e.to_string()))?;
        }
    }
    if originals.iter().any(Option::is_none) {
        let result = decoder.decode().map_err(|e| Error::internal(e.to_string()))?;
        for (index, restored) in result.restored_original_iter() {
            originals[index] = Some(restored.to_vec());
        }
    }
    let mut data = Vec::with_capacity(k * shard_len);
    for shard in originals {
        let shard = shard.ok_or_else(|| Error::internal("shard still missing after decode"))?;
        data.extend_from_slice(&shard);
    }
    data.truncate(obj_size as usize);
    Ok(data)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_shard_round_trip_all_originals() {
        let data: Vec<u8> = (0..10_000u32).map(|i| (i % 256) as u8).collect();
        let (shards, shard_len) = encode_shards(&data, 4, 2).unwrap();
        assert_eq!(shards.len(), 6);
        assert_eq!(shard_len % SHARD_ALIGN, 0);

        let avail: Vec<(usize, Vec<u8>)> = shards[..4]
            .iter()
            .cloned()
            .enumerate()
            .collect();
        let restored = decode_shards(avail, 4, 2, shard_len, data.len() as i64).unwrap();
        assert_eq!(restored, data);
    }

    #[test]
    fn test_shard_round_trip_with_losses() {
        let data: Vec<u8> = (0..50_000u32).map(|i| (i * 7 % 251) as u8).collect();
        let (shards, shard_len) = encode_shards(&data, 4, 2).unwrap();

        // lose two data shards, decode from the rest
        let avail: Vec<(usize, Vec<u8>)> = shards
            .iter()
            .cloned()
            .enumerate()
            .filter(|(i, _)| *i != 1 && *i != 3)
            .collect();
        let restored = decode_shards(avail, 4, 2, shard_len, data.len() as i64).unwrap();
        assert_eq!(restored, data);
    }

    #[test]
    fn test_too_few_shards_fails() {
        let data = vec![9u8; 4096];
        let (shards, shard_len) = encode_shards(&data, 3, 2).unwrap();
        let avail: Vec<(usize, Vec<u8>)> = shards
            .iter()
            .cloned()
            .enumerate()
            .take(2)
            .collect();
        assert!(decode_shards(avail, 3, 2, shard_len, data.len() as i64).is_err());
    }

    #[test]
    fn test_tiny_object_pads_to_alignment() {
        let data = b"tiny".to_vec();
        let (shards, shard_len) = encode_shards(&data, 2, 1).unwrap();
        assert_eq!(shard_len, SHARD_ALIGN);
        let avail: Vec<(usize, Vec<u8>)> = shards
            .iter()
            .cloned()
            .enumerate()
            .filter(|(i, _)| *i != 0)
            .collect();
        let restored = decode_shards(avail, 2, 1, shard_len, data.len() as i64).unwrap();
        assert_eq!(restored, data);
    }
}
