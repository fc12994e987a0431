//! Intra-cluster HTTP surface: query parameters and attribute headers

/// Bucket provider
pub const QP_PROVIDER: &str = "provider";
/// Internal get-from-neighbor read
pub const QP_GFN: &str = "gfn";
/// Local-only existence check (HEAD broadcast)
pub const QP_SILENT: &str = "silent";

/// Object attribute headers
pub const HDR_CKSUM_TYPE: &str = "x-obj-cksum-type";
pub const HDR_CKSUM_VALUE: &str = "x-obj-cksum-value";
pub const HDR_VERSION: &str = "x-obj-version";
pub const HDR_ATIME: &str = "x-obj-atime";
pub const HDR_PRESENT: &str = "x-obj-present";
/// Client-supplied checksum on PUT: `<type>:<value>`
pub const HDR_CONTENT_CKSUM: &str = "content-checksum";

/// EC slice geometry, JSON-encoded
pub const HDR_SLICE_META: &str = "x-slice-meta";

pub fn parse_bool(raw: &str) -> bool {
    matches!(raw, "1" | "true" | "t" | "yes" | "y")
}
