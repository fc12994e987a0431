//! Target end-to-end scenarios: lifecycle, cold GET, GFN, EC fallback

use crate::cloud::MockCloud;
use crate::ec;
use crate::handlers::{router, setup_rx, AppState};
use crate::rebalance::RebManager;
use crate::target::Target;
use shoal_cluster::{Bmd, Smap, Snode};
use shoal_common::{BckProps, Bck, Config, EcConf, Provider};
use shoal_fs::MountpathRegistry;
use std::collections::HashMap;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

struct TestNode {
    t: Arc<Target>,
    url: String,
    cloud: Arc<MockCloud>,
    _dirs: Vec<tempfile::TempDir>,
}

async fn start_node(id: &str, nmp: usize) -> TestNode {
    let registry = Arc::new(MountpathRegistry::new());
    let mut dirs = Vec::new();
    for _ in 0..nmp {
        let dir = tempfile::tempdir().unwrap();
        registry.add(dir.path()).unwrap();
        dirs.push(dir);
    }
    let cloud = MockCloud::new();

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let url = format!("http://{}", listener.local_addr().unwrap());
    let snode = Snode::new(id, url.clone());
    let t = Target::new(snode, Config::default(), registry, cloud.clone()).unwrap();
    setup_rx(&t).unwrap();
    let reb = RebManager::new(Arc::clone(&t));
    let app = router(AppState {
        t: Arc::clone(&t),
        reb,
    });
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    TestNode {
        t,
        url,
        cloud,
        _dirs: dirs,
    }
}

fn install_cluster(nodes: &[&TestNode], bmd: Bmd) {
    let mut smap = Smap {
        version: 1,
        uuid: "test-cluster".into(),
        targets: HashMap::new(),
        proxies: HashMap::new(),
    };
    for node in nodes {
        smap.targets
            .insert(node.t.snode.id.clone(), Arc::new(node.t.snode.clone()));
    }
    smap.proxies
        .insert("p1".into(), Arc::new(Snode::new("p1", "http://127.0.0.1:9")));
    for node in nodes {
        node.t.smap.put(smap.clone()).unwrap();
        node.t.bmd.put(bmd.clone()).unwrap();
    }
}

fn default_bmd() -> Bmd {
    let mut bmd = Bmd {
        version: 1,
        ..Default::default()
    };
    bmd.add(&Bck::new("data", Provider::Ais), BckProps::default())
        .unwrap();
    bmd.add(
        &Bck::new("ecb", Provider::Ais),
        BckProps {
            ec: EcConf {
                enabled: true,
                obj_size_limit: 0,
                data_slices: 1,
                parity_slices: 1,
            },
            ..Default::default()
        },
    )
    .unwrap();
    bmd
}

fn obj_url(node: &TestNode, bucket: &str, objname: &str) -> String {
    format!("{}/v1/objects/{bucket}/{objname}", node.url)
}

#[tokio::test]
async fn test_put_get_head_delete_cycle() {
    let node = start_node("t-cycle", 2).await;
    install_cluster(&[&node], default_bmd());
    let client = reqwest::Client::new();
    let url = obj_url(&node, "data", "dir/hello.bin");

    // unredirected requests are rejected
    let resp = client.get(&url).send().await.unwrap();
    assert_eq!(resp.status().as_u16(), 400);

    let body = b"hello, cluster".to_vec();
    let resp = client
        .put(&url)
        .query(&[("pxid", "p1")])
        .body(body.clone())
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status().as_u16(), 200);
    assert_eq!(
        resp.headers().get("x-obj-version").unwrap().to_str().unwrap(),
        "1"
    );

    let resp = client
        .get(&url)
        .query(&[("pxid", "p1")])
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status().as_u16(), 200);
    assert_eq!(resp.bytes().await.unwrap().to_vec(), body);

    let resp = client
        .head(&url)
        .query(&[("pxid", "p1")])
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status().as_u16(), 200);
    assert_eq!(
        resp.headers().get("x-obj-present").unwrap().to_str().unwrap(),
        "true"
    );
    assert_eq!(
        resp.headers().get("content-length").unwrap().to_str().unwrap(),
        body.len().to_string()
    );

    let resp = client
        .delete(&url)
        .query(&[("pxid", "p1")])
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status().as_u16(), 204);

    let resp = client
        .get(&url)
        .query(&[("pxid", "p1")])
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status().as_u16(), 404);
}

#[tokio::test]
async fn test_put_checksum_verification() {
    let node = start_node("t-cksum", 1).await;
    install_cluster(&[&node], default_bmd());
    let client = reqwest::Client::new();
    let url = obj_url(&node, "data", "checked");
    let body = b"payload".to_vec();
    let good = shoal_common::cksum::compute(shoal_common::CksumType::Xxhash64, &body);

    let resp = client
        .put(&url)
        .query(&[("pxid", "p1")])
        .header("content-checksum", format!("xxhash64:{}", good.value))
        .body(body.clone())
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status().as_u16(), 200);

    let resp = client
        .put(&url)
        .query(&[("pxid", "p1")])
        .header("content-checksum", "xxhash64:badbadbadbadbad0")
        .body(body)
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status().as_u16(), 500);
}

#[tokio::test]
async fn test_cold_get_from_cloud() {
    let node = start_node("t-cold", 2).await;
    install_cluster(&[&node], default_bmd());
    let bck = Bck::new("remote", Provider::Aws);
    let body = b"cloud resident data".to_vec();
    node.cloud.seed(&bck, "obj1", &body);

    let client = reqwest::Client::new();
    let url = obj_url(&node, "remote", "obj1");
    let resp = client
        .get(&url)
        .query(&[("pxid", "p1"), ("provider", "aws")])
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status().as_u16(), 200);
    assert_eq!(
        resp.headers().get("x-obj-version").unwrap().to_str().unwrap(),
        "1"
    );
    assert_eq!(resp.bytes().await.unwrap().to_vec(), body);
    assert_eq!(node.t.stats.cold_get_n.load(Ordering::Relaxed), 1);

    // warm on the second read
    let resp = client
        .get(&url)
        .query(&[("pxid", "p1"), ("provider", "aws")])
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status().as_u16(), 200);
    assert_eq!(node.t.stats.cold_get_n.load(Ordering::Relaxed), 1);

    // HEAD for a cloud object that was evicted answers from the cloud
    node.cloud.seed(&bck, "uncached", b"xyz");
    let head_url = obj_url(&node, "remote", "uncached");
    let resp = client
        .head(&head_url)
        .query(&[("pxid", "p1"), ("provider", "aws")])
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status().as_u16(), 200);
    assert_eq!(
        resp.headers().get("x-obj-present").unwrap().to_str().unwrap(),
        "false"
    );
}

#[tokio::test]
async fn test_oos_rejects_put_allows_get() {
    let node = start_node("t-oos", 1).await;
    install_cluster(&[&node], default_bmd());
    let client = reqwest::Client::new();
    let url = obj_url(&node, "data", "kept");

    let resp = client
        .put(&url)
        .query(&[("pxid", "p1")])
        .body("still fits")
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status().as_u16(), 200);

    node.t.set_oos_for_test(true);
    let resp = client
        .put(&obj_url(&node, "data", "rejected"))
        .query(&[("pxid", "p1")])
        .body("no room")
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status().as_u16(), 507);

    // reads still succeed while out of space
    let resp = client
        .get(&url)
        .query(&[("pxid", "p1")])
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status().as_u16(), 200);
}

#[tokio::test]
async fn test_gfn_restore_from_neighbor() {
    let a = start_node("t-gfn-a", 2).await;
    let b = start_node("t-gfn-b", 2).await;
    install_cluster(&[&a, &b], default_bmd());
    let client = reqwest::Client::new();
    let body: Vec<u8> = (0..64_000u32).map(|i| (i % 253) as u8).collect();

    // the object lives on B only
    let resp = client
        .put(&obj_url(&b, "data", "wandering"))
        .query(&[("pxid", "p1")])
        .body(body.clone())
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status().as_u16(), 200);

    // topology just changed from A's point of view
    a.t.global_gfn.activate(Duration::from_secs(30));

    let resp = client
        .get(&obj_url(&a, "data", "wandering"))
        .query(&[("pxid", "p1")])
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status().as_u16(), 200);
    assert_eq!(resp.bytes().await.unwrap().to_vec(), body);
    assert_eq!(a.t.stats.gfn_restore_n.load(Ordering::Relaxed), 1);

    // the object is now local to A: no GFN needed for the second read
    a.t.global_gfn.deactivate();
    let resp = client
        .get(&obj_url(&a, "data", "wandering"))
        .query(&[("pxid", "p1")])
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status().as_u16(), 200);
    assert_eq!(a.t.stats.gfn_restore_n.load(Ordering::Relaxed), 1);
}

#[tokio::test]
async fn test_ec_restore_fallback() {
    let a = start_node("t-ec-a", 2).await;
    let b = start_node("t-ec-b", 2).await;
    install_cluster(&[&a, &b], default_bmd());
    let client = reqwest::Client::new();
    let bck = Bck::new("ecb", Provider::Ais);
    let body: Vec<u8> = (0..30_000u32).map(|i| (i * 13 % 241) as u8).collect();

    let resp = client
        .put(&obj_url(&a, "ecb", "sliced"))
        .query(&[("pxid", "p1")])
        .body(body.clone())
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status().as_u16(), 200);

    // wait for the asynchronous slice distribution to settle
    let mut have_both = false;
    for _ in 0..100 {
        let on_a = ec::load_slice(&a.t, &bck, "sliced").unwrap().is_some();
        let on_b = ec::load_slice(&b.t, &bck, "sliced").unwrap().is_some();
        if on_a && on_b {
            have_both = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    assert!(have_both, "slices were not distributed");

    // lose the replica on A, keep the slices
    {
        let mut lom = a.t.lom(bck.clone(), "sliced").unwrap();
        lom.load(&a.t.lom_cache).unwrap();
        lom.delete_all(&a.t.lom_cache).unwrap();
    }

    let resp = client
        .get(&obj_url(&a, "ecb", "sliced"))
        .query(&[("pxid", "p1")])
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status().as_u16(), 200);
    assert_eq!(resp.bytes().await.unwrap().to_vec(), body);
}
