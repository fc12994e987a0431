//! Send side of the object stream
//!
//! A `Stream` is a caller-owned handle to a half-duplex pipeline between two
//! targets. Two bounded queues form the pipeline: the send queue (SQ) feeds
//! objects to the session body, the send completion queue (SCQ) delivers one
//! completion per object, in SQ order. Two tasks service them - the send
//! loop, which owns the HTTP sessions, and the completion loop, which fires
//! callbacks. Keeping the loops separate is what preserves exactly-one
//! completion per object across aborts.
//!
//! Session lifecycle: the stream starts inactive; the first `send` flips it
//! active and the send loop opens a single HTTP PUT whose body is the framed
//! object sequence. The body closes on the last-marker (`fin`) or when the
//! collector injects an idle tick into an empty SQ; the session then returns
//! to inactive until the next post.

use crate::collector::{Collector, CollectorCtrl};
use crate::header::{self, ObjHdr};
use crate::recv::{self, BodyStream, ObjBody, Receiver};
use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;
use parking_lot::Mutex;
use shoal_common::config::CompressionConf;
use shoal_common::{Error, Result};
use shoal_memsys::MemSys;
use std::io::Write;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::sync::{mpsc, watch, Semaphore};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Collector sweep period
pub const TICK_UNIT: Duration = Duration::from_secs(1);
/// Default stream idle timeout
pub const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(2);
/// Default SQ/SCQ capacity
pub const DEFAULT_BURST: usize = 32;

/// SQ/SCQ capacity override
pub const ENV_BURST: &str = "STREAM_BURST_NUM";
/// When truthy, sessions are parsed and discarded locally instead of opening
/// HTTP connections
pub const ENV_DRY_RUN: &str = "STREAM_DRY_RUN";

const REASON_UNKNOWN: &str = "unknown";
const REASON_ERROR: &str = "error";
const REASON_STOPPED: &str = "stopped";
const REASON_EOS: &str = "end-of-stream";

static NEXT_SESSION_ID: AtomicI64 = AtomicI64::new(100);

/// Object reader; closed (dropped) exactly once by the completion machinery
pub type ObjReader = Box<dyn AsyncRead + Send + Unpin>;

/// Completion callback: fired once per object (or once per ref-counted
/// batch), after its wire transmission finished or failed
pub type ObjSentCb = Arc<dyn Fn(&ObjHdr, Option<&Error>) + Send + Sync>;

/// An object to transmit
pub struct Obj {
    pub hdr: ObjHdr,
    /// Absent for header-only objects
    pub reader: Option<ObjReader>,
    /// Overrides the per-stream callback when set
    pub callback: Option<ObjSentCb>,
    /// Optional ref-counter: the callback fires when the count drops to zero
    pub prc: Option<Arc<AtomicI64>>,
}

impl Obj {
    #[must_use]
    pub fn new(hdr: ObjHdr, reader: ObjReader) -> Self {
        Self {
            hdr,
            reader: Some(reader),
            callback: None,
            prc: None,
        }
    }

    #[must_use]
    pub fn header_only(hdr: ObjHdr) -> Self {
        Self {
            hdr,
            reader: None,
            callback: None,
            prc: None,
        }
    }

    pub(crate) fn last_marker() -> Self {
        Self::header_only(ObjHdr::last_marker())
    }

    pub(crate) fn idle_tick() -> Self {
        Self::header_only(ObjHdr::idle_tick())
    }

    #[must_use]
    pub fn with_callback(mut self, cb: ObjSentCb) -> Self {
        self.callback = Some(cb);
        self
    }

    #[must_use]
    pub fn with_refcount(mut self, prc: Arc<AtomicI64>) -> Self {
        self.prc = Some(prc);
        self
    }
}

/// Stream construction options
#[derive(Default)]
pub struct Extra {
    pub idle_timeout: Option<Duration>,
    pub callback: Option<ObjSentCb>,
    pub compression: Option<CompressionConf>,
    pub mem: Option<Arc<MemSys>>,
    /// SQ/SCQ capacity; the environment override wins
    pub burst: Option<usize>,
    pub dry_run: bool,
}

/// Monotonic per-stream counters
#[derive(Default)]
pub(crate) struct Stats {
    pub(crate) num: AtomicI64,
    pub(crate) size: AtomicI64,
    pub(crate) offset: AtomicI64,
    pub(crate) compressed_size: AtomicI64,
}

/// Point-in-time copy of the stream counters
#[derive(Clone, Copy, Debug, Default)]
pub struct StatsSnapshot {
    /// Transferred objects, including header-only ones
    pub num: i64,
    /// Transferred object bytes, excluding transport headers
    pub size: i64,
    /// Bytes written to the wire, including headers
    pub offset: i64,
    /// Bytes after stream-level compression
    pub compressed_size: i64,
}

impl StatsSnapshot {
    #[must_use]
    pub fn compression_ratio(&self) -> f64 {
        self.offset as f64 / self.compressed_size as f64
    }
}

struct SendOff {
    hdr: ObjHdr,
    callback: Option<ObjSentCb>,
    prc: Option<Arc<AtomicI64>>,
}

struct Cmpl {
    hdr: ObjHdr,
    callback: Option<ObjSentCb>,
    prc: Option<Arc<AtomicI64>>,
    err: Option<Arc<Error>>,
}

impl Cmpl {
    fn last(err: Option<Arc<Error>>) -> Self {
        Self {
            hdr: ObjHdr::last_marker(),
            callback: None,
            prc: None,
            err,
        }
    }
}

struct Term {
    terminated: bool,
    reason: Option<&'static str>,
    err: Option<Arc<Error>>,
}

type SharedRx = Arc<tokio::sync::Mutex<mpsc::Receiver<Obj>>>;

pub(crate) struct StreamInner {
    client: Option<reqwest::Client>,
    to_url: String,
    trname: String,
    session_id: i64,
    idle_timeout: Duration,
    compression: Option<CompressionConf>,
    mem: Arc<MemSys>,
    dry_run: bool,

    pub(crate) sess_active: AtomicBool,
    pub(crate) in_send: AtomicBool,
    stats: Stats,

    pub(crate) work_tx: mpsc::Sender<Obj>,
    cmpl_tx: mpsc::Sender<Cmpl>,
    post_tx: mpsc::Sender<()>,
    stop_tx: watch::Sender<bool>,
    last_tx: watch::Sender<bool>,

    sendoff: Mutex<Option<SendOff>>,
    session_err: Mutex<Option<Arc<Error>>>,
    term: Mutex<Term>,
    callback: Option<ObjSentCb>,
    collector_tx: mpsc::UnboundedSender<CollectorCtrl>,
}

impl StreamInner {
    pub(crate) fn key(&self) -> String {
        format!("{}[{}]", self.trname, self.session_id)
    }

    pub(crate) fn idle_timeout(&self) -> Duration {
        self.idle_timeout
    }

    /// True when the SQ has no queued objects
    pub(crate) fn sq_empty(&self) -> bool {
        self.work_tx.capacity() == self.work_tx.max_capacity()
    }

    fn record_session_err(&self, err: Arc<Error>) {
        let mut slot = self.session_err.lock();
        if slot.is_none() {
            *slot = Some(err);
        }
    }

    fn take_session_err(&self) -> Option<Arc<Error>> {
        self.session_err.lock().take()
    }

    /// Ref-count, fire the callback, and let the reader drop
    fn obj_done(
        &self,
        hdr: &ObjHdr,
        callback: Option<ObjSentCb>,
        prc: Option<Arc<AtomicI64>>,
        err: Option<&Error>,
    ) {
        if let Some(prc) = prc {
            if prc.fetch_sub(1, Ordering::AcqRel) - 1 > 0 {
                return;
            }
        }
        if let Some(cb) = callback {
            cb(hdr, err);
        } else if let Some(cb) = &self.callback {
            cb(hdr, err);
        }
    }

    /// Mark terminated (sticky), wake everything, end the completion loop
    async fn terminate(&self, reason: &'static str, err: Option<Error>) {
        let arc = err.map(Arc::new);
        {
            let mut term = self.term.lock();
            if term.terminated {
                return;
            }
            term.terminated = true;
            term.reason = Some(reason);
            term.err = arc.clone();
        }
        let _ = self.stop_tx.send(true);
        let _ = self.cmpl_tx.send(Cmpl::last(arc)).await;
        let _ = self.collector_tx.send(CollectorCtrl::Remove(self.key()));
        if reason == REASON_ERROR {
            error!(stream = self.key(), reason, "stream terminated");
        } else {
            debug!(stream = self.key(), reason, "stream terminated");
        }
    }

    /// Framed session body: alternates header and payload emission per
    /// object pulled from the SQ; ends on last-marker or idle teardown
    fn session_body(self: Arc<Self>, rx: SharedRx) -> BodyStream {
        Box::pin(async_stream::stream! {
            let mut rx = rx.lock().await;
            let mut hdr_buf: Vec<u8> = Vec::with_capacity(header::MAX_HEADER_SIZE);
            let mut payload_buf = self.mem.alloc_default();
            loop {
                let Some(mut obj) = rx.recv().await else { return };
                self.in_send.store(true, Ordering::Relaxed);
                if obj.hdr.is_idle_tick() {
                    match rx.try_recv() {
                        Ok(next) => obj = next,
                        Err(_) => {
                            // teardown, unless a send raced the tick
                            self.sess_active.store(false, Ordering::Release);
                            match rx.try_recv() {
                                Ok(next) => {
                                    self.sess_active.store(true, Ordering::Release);
                                    obj = next;
                                }
                                Err(_) => {
                                    debug!(stream = self.key(), "idle teardown");
                                    return;
                                }
                            }
                        }
                    }
                }

                let Obj { hdr, reader, callback, prc } = obj;
                let osize = hdr.attrs.size;
                let is_last = hdr.is_last();
                let hdr_only = hdr.is_header_only();
                header::encode(&hdr, &mut hdr_buf);
                if is_last {
                    self.stats.offset.fetch_add(hdr_buf.len() as i64, Ordering::Relaxed);
                    yield Ok(Bytes::copy_from_slice(&hdr_buf));
                    let _ = self.last_tx.send(true);
                    return;
                }
                *self.sendoff.lock() = Some(SendOff { hdr, callback, prc });
                self.stats.offset.fetch_add(hdr_buf.len() as i64, Ordering::Relaxed);
                yield Ok(Bytes::copy_from_slice(&hdr_buf));

                let mut obj_err: Option<Error> = None;
                if !hdr_only {
                    let mut reader = reader.expect("checked on send");
                    let mut off: i64 = 0;
                    while off < osize {
                        let want = payload_buf.len().min((osize - off) as usize);
                        match reader.read(&mut payload_buf[..want]).await {
                            Ok(0) => {
                                obj_err = Some(Error::ShortRead { got: off, expected: osize });
                                break;
                            }
                            Ok(n) => {
                                off += n as i64;
                                self.stats.offset.fetch_add(n as i64, Ordering::Relaxed);
                                yield Ok(Bytes::copy_from_slice(&payload_buf[..n]));
                            }
                            Err(e) => {
                                obj_err = Some(Error::Io(e));
                                break;
                            }
                        }
                    }
                }

                // end of object: exactly one SCQ entry, in SQ order
                let Some(SendOff { hdr, callback, prc }) = self.sendoff.lock().take() else {
                    return;
                };
                match obj_err {
                    None => {
                        self.stats.size.fetch_add(osize, Ordering::Relaxed);
                        self.stats.num.fetch_add(1, Ordering::Relaxed);
                        let _ = self.cmpl_tx.send(Cmpl { hdr, callback, prc, err: None }).await;
                    }
                    Some(e) => {
                        let arc = Arc::new(e);
                        self.record_session_err(Arc::clone(&arc));
                        let _ = self.cmpl_tx
                            .send(Cmpl { hdr, callback, prc, err: Some(Arc::clone(&arc)) })
                            .await;
                        yield Err(std::io::Error::other(arc.to_string()));
                        return;
                    }
                }
            }
        })
    }

    /// One HTTP session: a single PUT whose body is the stream itself
    async fn run_session(self: &Arc<Self>, rx: &SharedRx) -> Result<()> {
        let mut stop_rx = self.stop_tx.subscribe();
        if *stop_rx.borrow() {
            return Err(Error::StreamStopped);
        }
        let body = self.clone().session_body(Arc::clone(rx));
        let body = match &self.compression {
            Some(conf) => compress_body(Arc::clone(self), body, conf.clone()),
            None => body,
        };
        let client = self.client.clone().expect("client present unless dry-run");
        let mut query: Vec<(&str, String)> = vec![("session_id", self.session_id.to_string())];
        if self.compression.is_some() {
            query.push(("compression", "lz4".into()));
        }
        let request = client
            .put(&self.to_url)
            .header(reqwest::header::CONTENT_TYPE, "application/octet-stream")
            .query(&query)
            .body(reqwest::Body::wrap_stream(body))
            .send();

        tokio::select! {
            res = request => match res {
                Ok(resp) if resp.status().is_success() => match self.take_session_err() {
                    None => Ok(()),
                    Some(err) => Err(Error::internal(err.to_string())),
                },
                Ok(resp) => {
                    let status = resp.status().as_u16();
                    if let Some(err) = self.take_session_err() {
                        return Err(Error::internal(err.to_string()));
                    }
                    let msg = resp.text().await.unwrap_or_default();
                    Err(Error::Remote { status, msg })
                }
                Err(e) => match self.take_session_err() {
                    Some(err) => Err(Error::internal(err.to_string())),
                    None => Err(Error::transient(e.to_string())),
                },
            },
            _ = stop_rx.changed() => Err(Error::StreamStopped),
        }
    }

    /// Dry-run session: parse own framing locally and discard the payloads
    async fn run_dry_session(self: &Arc<Self>, rx: &SharedRx) -> Result<()> {
        let mut stop_rx = self.stop_tx.subscribe();
        if *stop_rx.borrow() {
            return Err(Error::StreamStopped);
        }
        let body = self.clone().session_body(Arc::clone(rx));
        tokio::select! {
            res = recv::iterate(&Discard, body) => match res {
                Ok(_) => match self.take_session_err() {
                    None => Ok(()),
                    Some(err) => Err(Error::internal(err.to_string())),
                },
                Err(e) => match self.take_session_err() {
                    Some(err) => Err(Error::internal(err.to_string())),
                    None => Err(e),
                },
            },
            _ = stop_rx.changed() => Err(Error::StreamStopped),
        }
    }
}

struct Discard;

#[async_trait]
impl Receiver for Discard {
    async fn recv(&self, _hdr: ObjHdr, body: &mut ObjBody<'_>) -> Result<()> {
        body.discard().await?;
        Ok(())
    }
}

/// Caller-owned handle to the send pipeline
pub struct Stream {
    inner: Arc<StreamInner>,
    send_task: Mutex<Option<JoinHandle<()>>>,
    cmpl_task: Mutex<Option<JoinHandle<()>>>,
}

impl Stream {
    /// Create a stream to `to_url` (`http://<peer>/v1/transport/<trname>`)
    /// and start its send and completion loops. `client` may be omitted only
    /// in dry-run mode.
    pub fn new(
        client: Option<reqwest::Client>,
        to_url: impl Into<String>,
        collector: &Collector,
        extra: Extra,
    ) -> Result<Self> {
        let to_url = to_url.into();
        let trname = to_url
            .trim_end_matches('/')
            .rsplit('/')
            .next()
            .unwrap_or_default()
            .to_string();
        if trname.is_empty() {
            return Err(Error::Config(format!("cannot derive transport name from {to_url}")));
        }

        let dry_run = env_dry_run() || extra.dry_run;
        if client.is_none() && !dry_run {
            return Err(Error::Config("stream requires an http client".into()));
        }
        let burst = env_burst().or(extra.burst).unwrap_or(DEFAULT_BURST);
        let idle_timeout = extra
            .idle_timeout
            .unwrap_or(DEFAULT_IDLE_TIMEOUT)
            .max(TICK_UNIT);

        let (work_tx, work_rx) = mpsc::channel(burst);
        let (cmpl_tx, cmpl_rx) = mpsc::channel(burst);
        let (post_tx, post_rx) = mpsc::channel(1);
        let (stop_tx, _) = watch::channel(false);
        let (last_tx, _) = watch::channel(false);

        let inner = Arc::new(StreamInner {
            client,
            to_url,
            trname,
            session_id: NEXT_SESSION_ID.fetch_add(1, Ordering::Relaxed) + 1,
            idle_timeout,
            compression: extra.compression,
            mem: extra.mem.unwrap_or_else(MemSys::new),
            dry_run,
            sess_active: AtomicBool::new(false),
            in_send: AtomicBool::new(false),
            stats: Stats::default(),
            work_tx,
            cmpl_tx,
            post_tx,
            stop_tx,
            last_tx,
            sendoff: Mutex::new(None),
            session_err: Mutex::new(None),
            term: Mutex::new(Term {
                terminated: false,
                reason: None,
                err: None,
            }),
            callback: extra.callback,
            collector_tx: collector.ctrl_tx(),
        });

        let cmpl_done = Arc::new(Semaphore::new(0));
        let rx: SharedRx = Arc::new(tokio::sync::Mutex::new(work_rx));

        let send_task = tokio::spawn(send_loop(
            Arc::clone(&inner),
            rx,
            post_rx,
            Arc::clone(&cmpl_done),
        ));
        let cmpl_task = tokio::spawn(cmpl_loop(Arc::clone(&inner), cmpl_rx, cmpl_done));
        collector.add(Arc::clone(&inner));
        info!(stream = inner.key(), burst, dry_run, "stream opened");

        Ok(Self {
            inner,
            send_task: Mutex::new(Some(send_task)),
            cmpl_task: Mutex::new(Some(cmpl_task)),
        })
    }

    /// Asynchronously send an object. Blocks only while the SQ is full;
    /// fails once the stream is terminated. Objects with no reader must be
    /// header-only.
    pub async fn send(&self, obj: Obj) -> Result<()> {
        let inner = &self.inner;
        inner.in_send.store(true, Ordering::Relaxed);
        {
            let term = inner.term.lock();
            if term.terminated {
                return Err(Error::StreamTerminated {
                    reason: term.reason.unwrap_or(REASON_UNKNOWN).to_string(),
                });
            }
        }
        if obj.reader.is_none() && !obj.hdr.is_header_only() {
            return Err(Error::bad_request(format!(
                "object {} of size {} requires a reader",
                obj.hdr.objname, obj.hdr.attrs.size
            )));
        }
        if obj.hdr.objname.len() > header::MAX_OBJNAME {
            return Err(Error::bad_request(format!(
                "object name exceeds {} bytes",
                header::MAX_OBJNAME
            )));
        }
        if !inner.sess_active.swap(true, Ordering::AcqRel) {
            let _ = inner.post_tx.try_send(());
            debug!(stream = inner.key(), "inactive -> active");
        }
        inner
            .work_tx
            .send(obj)
            .await
            .map_err(|_| Error::StreamTerminated {
                reason: REASON_UNKNOWN.to_string(),
            })
    }

    /// Graceful shutdown: enqueue the last-marker and wait for both loops
    /// to drain
    pub async fn fin(&self) -> (Option<&'static str>, Option<Arc<Error>>) {
        let _ = self.send(Obj::last_marker()).await;
        let send_task = self.send_task.lock().take();
        if let Some(task) = send_task {
            let _ = task.await;
        }
        let cmpl_task = self.cmpl_task.lock().take();
        if let Some(task) = cmpl_task {
            let _ = task.await;
        }
        self.term_info()
    }

    /// Request an immediate abort
    pub fn stop(&self) {
        let _ = self.inner.stop_tx.send(true);
    }

    #[must_use]
    pub fn url(&self) -> &str {
        &self.inner.to_url
    }

    /// `(transport name, session id)`
    #[must_use]
    pub fn id(&self) -> (&str, i64) {
        (&self.inner.trname, self.inner.session_id)
    }

    #[must_use]
    pub fn is_terminated(&self) -> bool {
        self.inner.term.lock().terminated
    }

    /// Termination reason and error, once terminated
    #[must_use]
    pub fn term_info(&self) -> (Option<&'static str>, Option<Arc<Error>>) {
        let term = self.inner.term.lock();
        (term.reason, term.err.clone())
    }

    #[must_use]
    pub fn get_stats(&self) -> StatsSnapshot {
        let stats = &self.inner.stats;
        StatsSnapshot {
            num: stats.num.load(Ordering::Relaxed),
            size: stats.size.load(Ordering::Relaxed),
            offset: stats.offset.load(Ordering::Relaxed),
            compressed_size: stats.compressed_size.load(Ordering::Relaxed),
        }
    }
}

impl std::fmt::Display for Stream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.inner.key())
    }
}

async fn send_loop(
    inner: Arc<StreamInner>,
    rx: SharedRx,
    mut post_rx: mpsc::Receiver<()>,
    cmpl_done: Arc<Semaphore>,
) {
    let mut stop_rx = inner.stop_tx.subscribe();
    let mut last_rx = inner.last_tx.subscribe();
    let mut reason: &'static str = REASON_UNKNOWN;
    let mut term_err: Option<Error> = None;

    loop {
        if inner.sess_active.load(Ordering::Acquire) {
            let res = if inner.dry_run {
                inner.run_dry_session(&rx).await
            } else {
                inner.run_session(&rx).await
            };
            if let Err(e) = res {
                if matches!(e, Error::StreamStopped) {
                    reason = REASON_STOPPED;
                } else {
                    reason = REASON_ERROR;
                }
                term_err = Some(e);
                break;
            }
        }
        // an abort may have landed before this task subscribed
        if *stop_rx.borrow() {
            reason = REASON_STOPPED;
            term_err = Some(Error::StreamStopped);
            break;
        }
        // wait for the next post, the last-marker, or an abort
        tokio::select! {
            _ = last_rx.changed() => {
                reason = REASON_EOS;
                break;
            }
            _ = stop_rx.changed() => {
                reason = REASON_STOPPED;
                term_err = Some(Error::StreamStopped);
                break;
            }
            posted = post_rx.recv() => match posted {
                Some(()) => inner.sess_active.store(true, Ordering::Release),
                None => {
                    reason = REASON_UNKNOWN;
                    break;
                }
            },
        }
    }

    inner.terminate(reason, term_err).await;

    // termination ordering: the SCQ drains first, then the interrupted
    // in-flight object, then whatever is still queued in the SQ
    if reason != REASON_EOS {
        let _ = cmpl_done.acquire().await;
        let term_err = inner.term.lock().err.clone();
        if let Some(SendOff { hdr, callback, prc }) = inner.sendoff.lock().take() {
            inner.obj_done(&hdr, callback, prc, term_err.as_deref());
        }
        let mut rx = rx.lock().await;
        while let Ok(obj) = rx.try_recv() {
            if obj.hdr.is_idle_tick() || obj.hdr.is_last() {
                continue;
            }
            inner.obj_done(&obj.hdr, obj.callback, obj.prc, term_err.as_deref());
        }
    }
}

async fn cmpl_loop(inner: Arc<StreamInner>, mut cmpl_rx: mpsc::Receiver<Cmpl>, done: Arc<Semaphore>) {
    while let Some(cmpl) = cmpl_rx.recv().await {
        if cmpl.hdr.is_last() {
            break;
        }
        inner.obj_done(&cmpl.hdr, cmpl.callback, cmpl.prc, cmpl.err.as_deref());
    }
    done.add_permits(1);
}

/// Wrap the framed body with the lz4 frame encoder, flushing per source
/// chunk so the receiver never stalls on a partially filled block
fn compress_body(inner: Arc<StreamInner>, src: BodyStream, conf: CompressionConf) -> BodyStream {
    Box::pin(async_stream::stream! {
        let mut info = lz4_flex::frame::FrameInfo::new();
        info.block_size = block_size_for(conf.block_max_size);
        info.content_checksum = conf.frame_checksum;
        let mut enc = lz4_flex::frame::FrameEncoder::with_frame_info(
            info,
            Vec::with_capacity(conf.block_max_size),
        );
        let mut src = src;
        while let Some(item) = src.next().await {
            match item {
                Ok(chunk) => {
                    if let Err(e) = enc.write_all(&chunk).and_then(|()| enc.flush()) {
                        yield Err(e);
                        return;
                    }
                    let out = enc.get_mut();
                    if !out.is_empty() {
                        let bytes = Bytes::from(std::mem::take(out));
                        inner.stats.compressed_size.fetch_add(bytes.len() as i64, Ordering::Relaxed);
                        yield Ok(bytes);
                    }
                }
                Err(e) => {
                    yield Err(e);
                    return;
                }
            }
        }
        match enc.finish() {
            Ok(out) => {
                if !out.is_empty() {
                    inner.stats.compressed_size.fetch_add(out.len() as i64, Ordering::Relaxed);
                    yield Ok(Bytes::from(out));
                }
            }
            Err(e) => yield Err(std::io::Error::other(e)),
        }
    })
}

fn block_size_for(max: usize) -> lz4_flex::frame::BlockSize {
    use lz4_flex::frame::BlockSize;
    match max {
        0..=65_536 => BlockSize::Max64KB,
        65_537..=262_144 => BlockSize::Max256KB,
        262_145..=1_048_576 => BlockSize::Max1MB,
        _ => BlockSize::Max4MB,
    }
}

fn env_burst() -> Option<usize> {
    let raw = std::env::var(ENV_BURST).ok()?;
    match raw.parse::<usize>() {
        Ok(burst) if burst > 0 => Some(burst),
        _ => {
            warn!(%raw, "ignoring unparsable {ENV_BURST}");
            None
        }
    }
}

fn env_dry_run() -> bool {
    match std::env::var(ENV_DRY_RUN) {
        Ok(raw) => matches!(raw.as_str(), "1" | "true" | "t" | "yes" | "y"),
        Err(_) => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_block_size_mapping() {
        use lz4_flex::frame::BlockSize;
        assert!(matches!(block_size_for(64 * 1024), BlockSize::Max64KB));
        assert!(matches!(block_size_for(256 * 1024), BlockSize::Max256KB));
        assert!(matches!(block_size_for(10 << 20), BlockSize::Max4MB));
    }

    #[test]
    fn test_session_ids_unique() {
        let a = NEXT_SESSION_ID.fetch_add(1, Ordering::Relaxed) + 1;
        let b = NEXT_SESSION_ID.fetch_add(1, Ordering::Relaxed) + 1;
        assert!(b > a);
        assert!(a > 100);
    }
}
