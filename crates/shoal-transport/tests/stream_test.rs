//! End-to-end stream scenarios over a local receive endpoint

use async_trait::async_trait;
use axum::extract::Request;
use axum::middleware::{self, Next};
use axum::response::Response;
use parking_lot::Mutex;
use shoal_common::config::CompressionConf;
use shoal_common::Result;
use shoal_transport::{
    Collector, Extra, Obj, ObjBody, ObjHdr, Receiver, RecvRegistry, Stream,
};
use std::io::Cursor;
use std::pin::Pin;
use std::sync::atomic::{AtomicI64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::io::{AsyncRead, ReadBuf};

struct TestReceiver {
    objs: Mutex<Vec<(ObjHdr, Vec<u8>)>>,
}

impl TestReceiver {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            objs: Mutex::new(Vec::new()),
        })
    }

    fn names(&self) -> Vec<String> {
        self.objs.lock().iter().map(|(h, _)| h.objname.clone()).collect()
    }
}

#[async_trait]
impl Receiver for TestReceiver {
    async fn recv(&self, hdr: ObjHdr, body: &mut ObjBody<'_>) -> Result<()> {
        let data = body.read_all().await?;
        self.objs.lock().push((hdr, data));
        Ok(())
    }
}

struct Server {
    url: String,
    puts: Arc<AtomicUsize>,
    receiver: Arc<TestReceiver>,
}

async fn serve(trname: &str) -> Server {
    let registry = RecvRegistry::new();
    let receiver = TestReceiver::new();
    registry.register(trname, receiver.clone()).unwrap();

    let puts = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&puts);
    let app = shoal_transport::router(registry).layer(middleware::from_fn(
        move |req: Request, next: Next| {
            let counter = Arc::clone(&counter);
            async move {
                counter.fetch_add(1, Ordering::Relaxed);
                let resp: Response = next.run(req).await;
                resp
            }
        },
    ));
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    Server {
        url: format!("http://{addr}/v1/transport/{trname}"),
        puts,
        receiver,
    }
}

type CmplLog = Arc<Mutex<Vec<(String, Option<String>)>>>;

fn logging_callback() -> (shoal_transport::ObjSentCb, CmplLog) {
    let log: CmplLog = Arc::new(Mutex::new(Vec::new()));
    let cloned = Arc::clone(&log);
    let cb: shoal_transport::ObjSentCb = Arc::new(move |hdr, err| {
        cloned
            .lock()
            .push((hdr.objname.clone(), err.map(|e| e.to_string())));
    });
    (cb, log)
}

fn obj_of(name: &str, body: Vec<u8>) -> Obj {
    let mut hdr = ObjHdr::default();
    hdr.bck.name = "data".into();
    hdr.objname = name.into();
    hdr.attrs.size = body.len() as i64;
    if body.is_empty() {
        Obj::header_only(hdr)
    } else {
        Obj::new(hdr, Box::new(Cursor::new(body)))
    }
}

#[tokio::test]
async fn test_happy_path_stream() {
    let server = serve("tr-happy").await;
    let collector = Collector::spawn();
    let (cb, log) = logging_callback();
    let stream = Stream::new(
        Some(reqwest::Client::new()),
        &server.url,
        &collector,
        Extra {
            idle_timeout: Some(Duration::from_secs(1)),
            burst: Some(4),
            callback: Some(cb),
            ..Default::default()
        },
    )
    .unwrap();

    let sizes: [usize; 10] = [0, 1, 1024, 65536, 0, 1, 1, 1, 1, 1];
    for (i, size) in sizes.iter().enumerate() {
        let body = vec![i as u8; *size];
        stream.send(obj_of(&format!("obj-{i}"), body)).await.unwrap();
    }
    let (reason, err) = stream.fin().await;
    assert_eq!(reason, Some("end-of-stream"));
    assert!(err.is_none());

    // one completion per object, in send order, all successful
    let completions = log.lock().clone();
    assert_eq!(completions.len(), 10);
    for (i, (name, err)) in completions.iter().enumerate() {
        assert_eq!(name, &format!("obj-{i}"));
        assert!(err.is_none(), "unexpected error for {name}: {err:?}");
    }

    let stats = stream.get_stats();
    assert_eq!(stats.num, 10);
    assert_eq!(stats.size, sizes.iter().sum::<usize>() as i64);

    // a single PUT carried the whole batch
    assert_eq!(server.puts.load(Ordering::Relaxed), 1);
    let names = server.receiver.names();
    assert_eq!(names.len(), 10);
    assert_eq!(names[0], "obj-0");
    assert_eq!(names[9], "obj-9");
    for (hdr, data) in server.receiver.objs.lock().iter() {
        assert_eq!(hdr.attrs.size as usize, data.len());
    }
}

#[tokio::test]
async fn test_idle_cycle_reopens_session() {
    let server = serve("tr-idle").await;
    let collector = Collector::spawn();
    let stream = Stream::new(
        Some(reqwest::Client::new()),
        &server.url,
        &collector,
        Extra {
            idle_timeout: Some(Duration::from_secs(1)),
            ..Default::default()
        },
    )
    .unwrap();

    stream.send(obj_of("first", vec![1u8; 1024])).await.unwrap();
    tokio::time::sleep(Duration::from_secs(3)).await;
    stream.send(obj_of("second", vec![2u8; 1024])).await.unwrap();
    stream.fin().await;

    assert_eq!(stream.get_stats().num, 2);
    assert_eq!(server.puts.load(Ordering::Relaxed), 2);
    assert_eq!(server.receiver.names(), vec!["first", "second"]);
}

/// Emits a fixed number of bytes, then blocks forever
struct StallingReader {
    before_stall: usize,
}

impl AsyncRead for StallingReader {
    fn poll_read(
        self: Pin<&mut Self>,
        _cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        let this = self.get_mut();
        if this.before_stall == 0 {
            return Poll::Pending; // never wakes
        }
        let n = buf.remaining().min(this.before_stall).min(64 * 1024);
        buf.put_slice(&vec![0xEEu8; n]);
        this.before_stall -= n;
        Poll::Ready(Ok(()))
    }
}

#[tokio::test]
async fn test_abort_mid_transfer() {
    let server = serve("tr-abort").await;
    let collector = Collector::spawn();
    let (cb, log) = logging_callback();
    let stream = Stream::new(
        Some(reqwest::Client::new()),
        &server.url,
        &collector,
        Extra {
            callback: Some(cb),
            ..Default::default()
        },
    )
    .unwrap();

    let mut hdr = ObjHdr::default();
    hdr.bck.name = "data".into();
    hdr.objname = "big".into();
    hdr.attrs.size = 16 << 20;
    let obj = Obj::new(
        hdr,
        Box::new(StallingReader {
            before_stall: 1 << 20,
        }),
    );
    stream.send(obj).await.unwrap();

    tokio::time::sleep(Duration::from_millis(100)).await;
    stream.stop();
    let (reason, err) = stream.fin().await;
    assert_eq!(reason, Some("stopped"));
    assert!(err.is_some());

    // the in-flight object completed exactly once, with an error
    let completions = log.lock().clone();
    assert_eq!(completions.len(), 1);
    assert_eq!(completions[0].0, "big");
    assert!(completions[0].1.is_some());

    // terminated is sticky; further sends are rejected
    assert!(stream.is_terminated());
    assert!(stream.send(obj_of("late", vec![0u8; 8])).await.is_err());
}

#[tokio::test]
async fn test_truncated_body_aborts_session() {
    let server = serve("tr-trunc").await;
    let collector = Collector::spawn();
    let (cb, log) = logging_callback();
    let stream = Stream::new(
        Some(reqwest::Client::new()),
        &server.url,
        &collector,
        Extra {
            callback: Some(cb),
            ..Default::default()
        },
    )
    .unwrap();

    // advertises 2048 bytes, delivers 1000
    let mut hdr = ObjHdr::default();
    hdr.bck.name = "data".into();
    hdr.objname = "short".into();
    hdr.attrs.size = 2048;
    let obj = Obj::new(hdr, Box::new(Cursor::new(vec![7u8; 1000])));
    stream.send(obj).await.unwrap();

    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while !stream.is_terminated() && tokio::time::Instant::now() < deadline {
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    let (reason, err) = stream.fin().await;
    assert_eq!(reason, Some("error"));
    let err = err.expect("termination error");
    assert!(err.to_string().contains("shorter than expected"), "{err}");

    let completions = log.lock().clone();
    assert_eq!(completions.len(), 1);
    assert!(completions[0].1.as_deref().unwrap().contains("shorter"));

    // the receiver never observed a completed object
    assert!(server.receiver.objs.lock().is_empty());
}

#[tokio::test]
async fn test_compressed_round_trip() {
    let server = serve("tr-lz4").await;
    let collector = Collector::spawn();
    let stream = Stream::new(
        Some(reqwest::Client::new()),
        &server.url,
        &collector,
        Extra {
            compression: Some(CompressionConf {
                block_max_size: 64 * 1024,
                frame_checksum: true,
            }),
            ..Default::default()
        },
    )
    .unwrap();

    let payload: Vec<u8> = (0..200_000u32).map(|i| (i % 251) as u8).collect();
    stream.send(obj_of("zipped", payload.clone())).await.unwrap();
    stream.send(obj_of("tiny", b"abc".to_vec())).await.unwrap();
    let (reason, _) = stream.fin().await;
    assert_eq!(reason, Some("end-of-stream"));

    let objs = server.receiver.objs.lock();
    assert_eq!(objs.len(), 2);
    assert_eq!(objs[0].1, payload);
    assert_eq!(objs[1].1, b"abc");
    drop(objs);

    let stats = stream.get_stats();
    assert_eq!(stats.num, 2);
    assert!(stats.compressed_size > 0);
    // the repetitive payload must actually compress
    assert!(stats.compressed_size < stats.offset);
}

#[tokio::test]
async fn test_dry_run_discards_locally() {
    let collector = Collector::spawn();
    let (cb, log) = logging_callback();
    let stream = Stream::new(
        None,
        "http://invalid.localdomain/v1/transport/tr-dry",
        &collector,
        Extra {
            dry_run: true,
            callback: Some(cb),
            ..Default::default()
        },
    )
    .unwrap();

    stream.send(obj_of("a", vec![0u8; 4096])).await.unwrap();
    stream.send(obj_of("b", Vec::new())).await.unwrap();
    stream.send(obj_of("c", vec![1u8; 128])).await.unwrap();
    let (reason, err) = stream.fin().await;
    assert_eq!(reason, Some("end-of-stream"));
    assert!(err.is_none());

    assert_eq!(stream.get_stats().num, 3);
    assert_eq!(log.lock().len(), 3);
}

#[tokio::test]
async fn test_refcounted_batch_completes_once() {
    let server = serve("tr-batch").await;
    let collector = Collector::spawn();
    let stream = Stream::new(
        Some(reqwest::Client::new()),
        &server.url,
        &collector,
        Extra::default(),
    )
    .unwrap();

    let fired = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&fired);
    let cb: shoal_transport::ObjSentCb = Arc::new(move |_, _| {
        counter.fetch_add(1, Ordering::Relaxed);
    });
    let prc = Arc::new(AtomicI64::new(2));

    stream
        .send(
            obj_of("batch-1", vec![1u8; 64])
                .with_callback(Arc::clone(&cb))
                .with_refcount(Arc::clone(&prc)),
        )
        .await
        .unwrap();
    stream
        .send(
            obj_of("batch-2", vec![2u8; 64])
                .with_callback(cb)
                .with_refcount(prc),
        )
        .await
        .unwrap();
    stream.fin().await;

    assert_eq!(fired.load(Ordering::Relaxed), 1);
    assert_eq!(server.receiver.objs.lock().len(), 2);
}
