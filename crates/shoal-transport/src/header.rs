//! Wire header codec
//!
//! Every object on a stream is preceded by a framed header:
//!
//! ```text
//! i64 hlen       length of the trailing payload
//! u64 hchecksum  validating hash of hlen
//! payload        bucket, object name, provider, namespace, opaque, attrs
//! ```
//!
//! Strings and byte fields are length-prefixed with an 8-byte big-endian
//! count. Three `size` values are reserved for in-band control: the
//! last-marker (graceful end-of-stream), the idle-tick (internal, never on
//! the wire), and zero (header-only object, no data frame follows).

use shoal_common::{Bck, Error, Ns, Provider, Result};

/// Longest legal object name on the wire, bytes
pub const MAX_OBJNAME: usize = 1024;

/// Slack for every other header field: bucket name, namespace, opaque
/// control, checksum, version, and the 8-byte length prefixes
const HEADER_SLACK: usize = 3 * 1024;

/// Max encoded header frame (prefix + payload); sized so a maximum-length
/// object name always fits alongside the remaining fields
pub const MAX_HEADER_SIZE: usize = MAX_OBJNAME + HEADER_SLACK;

/// Fixed prefix: hlen + hchecksum
pub const PREFIX_SIZE: usize = 16;

/// Graceful end-of-stream
pub const LAST_MARKER: i64 = i64::MAX;
/// Internal idle teardown signal
pub const TICK_MARKER: i64 = i64::MAX ^ 0xA5A5_A5A5;

/// Attributes of the object being transmitted
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ObjAttrs {
    pub size: i64,
    /// Access time, nanoseconds since the UNIX epoch
    pub atime_ns: i64,
    pub cksum_type: String,
    pub cksum_value: String,
    pub version: String,
}

/// Per-object stream header
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ObjHdr {
    pub bck: Bck,
    pub objname: String,
    /// Caller-defined control, carried opaquely
    pub opaque: Vec<u8>,
    pub attrs: ObjAttrs,
}

impl ObjHdr {
    #[must_use]
    pub fn is_last(&self) -> bool {
        self.attrs.size == LAST_MARKER
    }

    #[must_use]
    pub fn is_idle_tick(&self) -> bool {
        self.attrs.size == TICK_MARKER
    }

    /// Header-only objects carry no data frame; the last-marker is one too
    #[must_use]
    pub fn is_header_only(&self) -> bool {
        self.attrs.size == 0 || self.is_last()
    }

    #[must_use]
    pub fn last_marker() -> Self {
        Self {
            attrs: ObjAttrs {
                size: LAST_MARKER,
                ..Default::default()
            },
            ..Default::default()
        }
    }

    #[must_use]
    pub fn idle_tick() -> Self {
        Self {
            attrs: ObjAttrs {
                size: TICK_MARKER,
                ..Default::default()
            },
            ..Default::default()
        }
    }
}

/// Validating hash over `hlen` (splitmix64 finalizer, the xoshiro256
/// seeding scramble)
#[must_use]
pub fn hdr_checksum(seed: u64) -> u64 {
    let mut z = seed.wrapping_add(0x9e37_79b9_7f4a_7c15);
    z = (z ^ (z >> 30)).wrapping_mul(0xbf58_476d_1ce4_e5b9);
    z = (z ^ (z >> 27)).wrapping_mul(0x94d0_49bb_1331_11eb);
    z ^ (z >> 31)
}

/// Encode a full header frame (prefix + payload) into `buf`
pub fn encode(hdr: &ObjHdr, buf: &mut Vec<u8>) {
    buf.clear();
    buf.extend_from_slice(&[0u8; PREFIX_SIZE]);
    put_str(buf, &hdr.bck.name);
    put_str(buf, &hdr.objname);
    put_str(buf, hdr.bck.provider.as_str());
    put_str(buf, &hdr.bck.ns.name);
    put_str(buf, &hdr.bck.ns.uuid);
    put_bytes(buf, &hdr.opaque);
    put_i64(buf, hdr.attrs.size);
    put_i64(buf, hdr.attrs.atime_ns);
    put_str(buf, &hdr.attrs.cksum_type);
    put_str(buf, &hdr.attrs.cksum_value);
    put_str(buf, &hdr.attrs.version);

    let hlen = (buf.len() - PREFIX_SIZE) as i64;
    debug_assert!(buf.len() <= MAX_HEADER_SIZE);
    buf[0..8].copy_from_slice(&hlen.to_be_bytes());
    buf[8..16].copy_from_slice(&hdr_checksum(hlen as u64).to_be_bytes());
}

/// Parse a header payload (the bytes following the validated prefix)
pub fn parse(payload: &[u8]) -> Result<ObjHdr> {
    let mut off = 0usize;
    let name = get_str(payload, &mut off)?;
    let objname = get_str(payload, &mut off)?;
    let provider = Provider::parse(&get_str(payload, &mut off)?)?;
    let ns_name = get_str(payload, &mut off)?;
    let ns_uuid = get_str(payload, &mut off)?;
    let opaque = get_bytes(payload, &mut off)?;
    let size = get_i64(payload, &mut off)?;
    let atime_ns = get_i64(payload, &mut off)?;
    let cksum_type = get_str(payload, &mut off)?;
    let cksum_value = get_str(payload, &mut off)?;
    let version = get_str(payload, &mut off)?;
    Ok(ObjHdr {
        bck: Bck {
            name,
            provider,
            ns: Ns {
                name: ns_name,
                uuid: ns_uuid,
            },
        },
        objname,
        opaque,
        attrs: ObjAttrs {
            size,
            atime_ns,
            cksum_type,
            cksum_value,
            version,
        },
    })
}

fn put_bytes(buf: &mut Vec<u8>, b: &[u8]) {
    buf.extend_from_slice(&(b.len() as u64).to_be_bytes());
    buf.extend_from_slice(b);
}

fn put_str(buf: &mut Vec<u8>, s: &str) {
    put_bytes(buf, s.as_bytes());
}

fn put_i64(buf: &mut Vec<u8>, v: i64) {
    buf.extend_from_slice(&(v as u64).to_be_bytes());
}

fn get_bytes(payload: &[u8], off: &mut usize) -> Result<Vec<u8>> {
    let len = get_i64(payload, off)? as usize;
    let end = off
        .checked_add(len)
        .filter(|end| *end <= payload.len())
        .ok_or_else(|| Error::ProtocolCorrupt("field length exceeds header".into()))?;
    let out = payload[*off..end].to_vec();
    *off = end;
    Ok(out)
}

fn get_str(payload: &[u8], off: &mut usize) -> Result<String> {
    let bytes = get_bytes(payload, off)?;
    String::from_utf8(bytes).map_err(|_| Error::ProtocolCorrupt("invalid utf-8 in header".into()))
}

fn get_i64(payload: &[u8], off: &mut usize) -> Result<i64> {
    let end = *off + 8;
    if end > payload.len() {
        return Err(Error::ProtocolCorrupt("truncated header field".into()));
    }
    let mut arr = [0u8; 8];
    arr.copy_from_slice(&payload[*off..end]);
    *off = end;
    Ok(u64::from_be_bytes(arr) as i64)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> ObjHdr {
        ObjHdr {
            bck: Bck {
                name: "photos".into(),
                provider: Provider::Aws,
                ns: Ns {
                    name: "team".into(),
                    uuid: "u-42".into(),
                },
            },
            objname: "cats/1.jpg".into(),
            opaque: vec![1, 2, 3],
            attrs: ObjAttrs {
                size: 65536,
                atime_ns: 1_700_000_000_000_000_000,
                cksum_type: "xxhash64".into(),
                cksum_value: "deadbeefcafe0123".into(),
                version: "7".into(),
            },
        }
    }

    #[test]
    fn test_round_trip() {
        for hdr in [
            sample(),
            ObjHdr::default(),
            ObjHdr::last_marker(),
            ObjHdr {
                attrs: ObjAttrs {
                    size: 0,
                    ..Default::default()
                },
                ..sample()
            },
        ] {
            let mut buf = Vec::new();
            encode(&hdr, &mut buf);

            let hlen = i64::from_be_bytes(buf[0..8].try_into().unwrap());
            let cksum = u64::from_be_bytes(buf[8..16].try_into().unwrap());
            assert_eq!(hlen as usize, buf.len() - PREFIX_SIZE);
            assert_eq!(cksum, hdr_checksum(hlen as u64));

            let parsed = parse(&buf[PREFIX_SIZE..]).unwrap();
            assert_eq!(parsed, hdr);
        }
    }

    #[test]
    fn test_markers() {
        assert!(ObjHdr::last_marker().is_last());
        assert!(ObjHdr::last_marker().is_header_only());
        assert!(ObjHdr::idle_tick().is_idle_tick());
        assert!(!ObjHdr::idle_tick().is_header_only());
        assert_ne!(LAST_MARKER, TICK_MARKER);
    }

    #[test]
    fn test_max_length_objname_fits() {
        let mut hdr = sample();
        hdr.objname = "x".repeat(MAX_OBJNAME);
        let mut buf = Vec::new();
        encode(&hdr, &mut buf);
        assert!(buf.len() <= MAX_HEADER_SIZE);
        let parsed = parse(&buf[PREFIX_SIZE..]).unwrap();
        assert_eq!(parsed, hdr);
    }

    #[test]
    fn test_truncated_payload_rejected() {
        let mut buf = Vec::new();
        encode(&sample(), &mut buf);
        let payload = &buf[PREFIX_SIZE..];
        for cut in [0, 1, 7, payload.len() - 1] {
            assert!(parse(&payload[..cut]).is_err());
        }
    }

    #[test]
    fn test_oversized_field_length_rejected() {
        let mut payload = Vec::new();
        payload.extend_from_slice(&u64::MAX.to_be_bytes());
        assert!(parse(&payload).is_err());
    }
}
