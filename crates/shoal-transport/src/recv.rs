//! Receive side of the object stream
//!
//! A registered handler serves the inbound HTTP PUT for its transport name.
//! The frame iterator validates each header prefix, hands the body slice to
//! the handler, and keeps the stream frame-aligned even when the handler
//! reads less than the advertised size. A mismatched header checksum or a
//! short body aborts the session.

use crate::header::{self, ObjHdr, MAX_HEADER_SIZE, PREFIX_SIZE};
use async_trait::async_trait;
use axum::body::Body;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::routing::put;
use axum::Router;
use bytes::{Buf, Bytes, BytesMut};
use futures::stream::BoxStream;
use futures::StreamExt;
use parking_lot::RwLock;
use serde::Deserialize;
use shoal_common::{Error, Result};
use std::collections::HashMap;
use std::io::Read;
use std::sync::Arc;
use tracing::{debug, warn};

/// Byte stream carrying one transport session
pub type BodyStream = BoxStream<'static, std::io::Result<Bytes>>;

/// Inbound object handler for one transport name
#[async_trait]
pub trait Receiver: Send + Sync {
    async fn recv(&self, hdr: ObjHdr, body: &mut ObjBody<'_>) -> Result<()>;
}

/// Registry of receive handlers, keyed by transport name
pub struct RecvRegistry {
    handlers: RwLock<HashMap<String, Arc<dyn Receiver>>>,
}

impl RecvRegistry {
    #[must_use]
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            handlers: RwLock::new(HashMap::new()),
        })
    }

    /// Register a handler; duplicate names are a setup error
    pub fn register(&self, trname: impl Into<String>, handler: Arc<dyn Receiver>) -> Result<()> {
        let trname = trname.into();
        let mut handlers = self.handlers.write();
        if handlers.contains_key(&trname) {
            return Err(Error::Config(format!("duplicate transport name {trname}")));
        }
        handlers.insert(trname, handler);
        Ok(())
    }

    pub fn unregister(&self, trname: &str) {
        self.handlers.write().remove(trname);
    }

    #[must_use]
    pub fn get(&self, trname: &str) -> Option<Arc<dyn Receiver>> {
        self.handlers.read().get(trname).cloned()
    }
}

#[derive(Debug, Deserialize)]
struct SessionQuery {
    #[serde(default)]
    session_id: Option<i64>,
    #[serde(default)]
    compression: Option<String>,
}

/// Router serving `PUT /v1/transport/{trname}`
#[must_use]
pub fn router(registry: Arc<RecvRegistry>) -> Router {
    Router::new()
        .route("/v1/transport/{trname}", put(handle_session))
        .with_state(registry)
}

async fn handle_session(
    State(registry): State<Arc<RecvRegistry>>,
    Path(trname): Path<String>,
    Query(query): Query<SessionQuery>,
    body: Body,
) -> (StatusCode, String) {
    let Some(handler) = registry.get(&trname) else {
        return (
            StatusCode::NOT_FOUND,
            format!("unknown transport name {trname}"),
        );
    };
    let session_id = query.session_id.unwrap_or_default();
    let stream: BodyStream = Box::pin(
        body.into_data_stream()
            .map(|res| res.map_err(std::io::Error::other)),
    );
    let stream = if query.compression.as_deref() == Some("lz4") {
        decompress(stream)
    } else {
        stream
    };

    match iterate(handler.as_ref(), stream).await {
        Ok(received) => {
            debug!(trname, session_id, received, "session ended");
            (StatusCode::OK, String::new())
        }
        Err(err) => {
            warn!(trname, session_id, %err, "session aborted");
            (
                StatusCode::from_u16(err.http_status_code()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR),
                err.to_string(),
            )
        }
    }
}

/// Drive the frame iterator over one session body
pub async fn iterate(handler: &dyn Receiver, stream: BodyStream) -> Result<u64> {
    let mut frames = FrameReader::new(stream);
    let mut received = 0u64;
    loop {
        let Some(hdr) = frames.next_frame().await? else {
            // idle teardown: the sender closed the body between objects
            return Ok(received);
        };
        if hdr.is_last() {
            return Ok(received);
        }
        let size = hdr.attrs.size;
        let mut body = ObjBody::new(&mut frames, size);
        handler.recv(hdr, &mut body).await?;
        body.discard().await?;
        received += 1;
    }
}

/// Pull-based reader over the framed session body
pub struct FrameReader {
    src: BodyStream,
    buf: BytesMut,
    eof: bool,
}

impl FrameReader {
    #[must_use]
    pub fn new(src: BodyStream) -> Self {
        Self {
            src,
            buf: BytesMut::new(),
            eof: false,
        }
    }

    /// Pull one more chunk into the buffer; false on end of body
    async fn fill(&mut self) -> Result<bool> {
        if self.eof {
            return Ok(false);
        }
        match self.src.next().await {
            Some(Ok(chunk)) => {
                self.buf.extend_from_slice(&chunk);
                Ok(true)
            }
            Some(Err(e)) => Err(Error::ProtocolCorrupt(format!("body read: {e}"))),
            None => {
                self.eof = true;
                Ok(false)
            }
        }
    }

    /// Next object header, or `None` on a clean end between frames
    pub async fn next_frame(&mut self) -> Result<Option<ObjHdr>> {
        while self.buf.len() < PREFIX_SIZE {
            if !self.fill().await? {
                if self.buf.is_empty() {
                    return Ok(None);
                }
                return Err(Error::ProtocolCorrupt("truncated header prefix".into()));
            }
        }
        let hlen = i64::from_be_bytes(self.buf[0..8].try_into().expect("prefix sized"));
        let cksum = u64::from_be_bytes(self.buf[8..16].try_into().expect("prefix sized"));
        if hlen <= 0 || hlen as usize > MAX_HEADER_SIZE {
            return Err(Error::ProtocolCorrupt(format!("bad header length {hlen}")));
        }
        if cksum != header::hdr_checksum(hlen as u64) {
            return Err(Error::ProtocolCorrupt("header checksum mismatch".into()));
        }
        self.buf.advance(PREFIX_SIZE);

        let hlen = hlen as usize;
        while self.buf.len() < hlen {
            if !self.fill().await? {
                return Err(Error::ProtocolCorrupt("truncated header payload".into()));
            }
        }
        let payload = self.buf.split_to(hlen);
        let hdr = header::parse(&payload)?;
        if hdr.is_idle_tick() {
            return Err(Error::ProtocolCorrupt("reserved marker on the wire".into()));
        }
        Ok(Some(hdr))
    }

    async fn data_chunk(&mut self, want: usize) -> Result<Bytes> {
        while self.buf.is_empty() {
            if !self.fill().await? {
                return Err(Error::ProtocolCorrupt("body shorter than object size".into()));
            }
        }
        let take = want.min(self.buf.len());
        Ok(self.buf.split_to(take).freeze())
    }
}

/// The data frame of one object, bounded by its advertised size
pub struct ObjBody<'a> {
    frames: &'a mut FrameReader,
    remaining: i64,
}

impl<'a> ObjBody<'a> {
    fn new(frames: &'a mut FrameReader, size: i64) -> Self {
        Self {
            frames,
            remaining: size.max(0),
        }
    }

    /// Next chunk of the object body; `None` once fully consumed
    pub async fn chunk(&mut self) -> Result<Option<Bytes>> {
        if self.remaining == 0 {
            return Ok(None);
        }
        let chunk = self.frames.data_chunk(self.remaining as usize).await?;
        self.remaining -= chunk.len() as i64;
        Ok(Some(chunk))
    }

    /// Read the remainder into memory
    pub async fn read_all(&mut self) -> Result<Vec<u8>> {
        let mut out = Vec::with_capacity(self.remaining.max(0) as usize);
        while let Some(chunk) = self.chunk().await? {
            out.extend_from_slice(&chunk);
        }
        Ok(out)
    }

    /// Consume whatever the handler left unread
    pub async fn discard(&mut self) -> Result<i64> {
        let mut n = 0i64;
        while let Some(chunk) = self.chunk().await? {
            n += chunk.len() as i64;
        }
        Ok(n)
    }
}

/// Bridge the sync lz4 frame decoder onto the async session body
fn decompress(src: BodyStream) -> BodyStream {
    let (in_tx, in_rx) = tokio::sync::mpsc::channel::<std::io::Result<Bytes>>(4);
    let (out_tx, mut out_rx) = tokio::sync::mpsc::channel::<std::io::Result<Bytes>>(4);

    tokio::spawn(async move {
        let mut src = src;
        while let Some(item) = src.next().await {
            if in_tx.send(item).await.is_err() {
                break;
            }
        }
    });
    tokio::task::spawn_blocking(move || {
        let mut dec = lz4_flex::frame::FrameDecoder::new(ChanRead {
            rx: in_rx,
            cur: Bytes::new(),
        });
        let mut buf = vec![0u8; 64 * 1024];
        loop {
            match dec.read(&mut buf) {
                Ok(0) => break,
                Ok(n) => {
                    if out_tx.blocking_send(Ok(Bytes::copy_from_slice(&buf[..n]))).is_err() {
                        break;
                    }
                }
                Err(e) => {
                    let _ = out_tx.blocking_send(Err(e));
                    break;
                }
            }
        }
    });

    Box::pin(async_stream::stream! {
        while let Some(item) = out_rx.recv().await {
            yield item;
        }
    })
}

struct ChanRead {
    rx: tokio::sync::mpsc::Receiver<std::io::Result<Bytes>>,
    cur: Bytes,
}

impl Read for ChanRead {
    fn read(&mut self, out: &mut [u8]) -> std::io::Result<usize> {
        while self.cur.is_empty() {
            match self.rx.blocking_recv() {
                Some(Ok(chunk)) => self.cur = chunk,
                Some(Err(e)) => return Err(e),
                None => return Ok(0),
            }
        }
        let n = out.len().min(self.cur.len());
        out[..n].copy_from_slice(&self.cur[..n]);
        self.cur.advance(n);
        Ok(n)
    }
}
