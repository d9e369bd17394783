use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use perfsentry::config::{ClientConfig, DetectorConfig, ServerConfig};
use perfsentry::driver::{FrameStatus, RankDriver};
use perfsentry::event::{CallEvent, Frame, FunctionTable, ThreadKey};
use perfsentry::ps::client::Client;
use perfsentry::ps::server::PsService;
use perfsentry::ps::{ParameterServer, StatsAggregator};
use perfsentry::stats::RunStats;

async fn start_service(dump_path: Option<std::path::PathBuf>) -> (PsService, SocketAddr) {
    let service = PsService::new(
        Arc::new(ParameterServer::new()),
        &ServerConfig {
            addr: "127.0.0.1:0".to_string(),
            dump_path,
        },
    )
    .expect("service");
    let addr = service.start().await.expect("start");
    (service, addr)
}

fn client(addr: SocketAddr) -> Client {
    Client::new(&ClientConfig {
        endpoint: format!("http://{addr}"),
        timeout: Duration::from_secs(5),
    })
    .expect("client")
}

#[tokio::test]
async fn rpc_surface_round_trip() {
    let (service, addr) = start_service(None).await;
    let client = client(addr);

    let merged = client
        .update(1, RunStats::from_samples([1.0, 2.0]))
        .await
        .expect("update");
    assert_eq!(merged.count(), (2, 0));

    let batch = client
        .update_all(HashMap::from([
            (1, RunStats::from_samples([3.0])),
            (2, RunStats::from_samples([10.0, 20.0])),
        ]))
        .await
        .expect("update_all");
    assert_eq!(batch.get(&1).map(|s| s.count().0), Some(3));
    assert_eq!(batch.get(&2).map(|s| s.mean()), Some(15.0));

    let one = client.get(1).await.expect("get");
    assert_eq!(one.mean(), 2.0);
    assert!(client.get(99).await.expect("get unknown").is_empty());

    assert_eq!(client.add_abnormal(2, 3).await.expect("add_abnormal"), 3);
    let counts = client
        .add_abnormal_all(HashMap::from([(1, 1), (2, 1)]))
        .await
        .expect("add_abnormal_all");
    assert_eq!(counts.get(&2), Some(&4));

    let all = client.get_all().await.expect("get_all");
    assert_eq!(all.len(), 2);
    assert_eq!(all.get(&2).map(|s| s.n_abnormal()), Some(4));

    // The server's store is the same object the HTTP surface mutates.
    assert_eq!(service.store().get(1).count(), (3, 1));

    client.clear().await.expect("clear");
    assert!(client.get(1).await.expect("get after clear").is_empty());

    service.stop().await.expect("stop");
}

#[tokio::test]
async fn resubmitted_partial_is_counted_twice() {
    let (service, addr) = start_service(None).await;
    let client = client(addr);
    let partial = RunStats::from_samples([4.0, 6.0]);

    client.update(5, partial).await.expect("first push");
    let twice = client.update(5, partial).await.expect("second push");

    assert_eq!(twice.count().0, 4);
    assert_eq!(twice.s1(), 20.0);

    service.stop().await.expect("stop");
}

#[tokio::test]
async fn concurrent_http_updates_merge_exactly() {
    let (service, addr) = start_service(None).await;

    let mut tasks = Vec::new();
    for rank in 0..8u64 {
        let client = client(addr);
        tasks.push(tokio::spawn(async move {
            for i in 0..10u64 {
                let x = (rank * 10 + i) as f64;
                client
                    .update(3, RunStats::from_samples([x]))
                    .await
                    .expect("update");
            }
        }));
    }
    for task in tasks {
        task.await.expect("join");
    }

    let stored = service.store().get(3);
    let expected = RunStats::from_samples((0..80).map(|x| x as f64));
    assert_eq!(stored.count(), expected.count());
    assert_eq!(stored.s1(), expected.s1());
    assert_eq!(stored.s2(), expected.s2());

    service.stop().await.expect("stop");
}

#[tokio::test]
async fn dump_metrics_and_health_endpoints() {
    let dump = std::env::temp_dir().join(format!("perfsentry-http-dump-{}.json", std::process::id()));
    let (service, addr) = start_service(Some(dump.clone())).await;
    let client = client(addr);
    client
        .update(9, RunStats::from_samples([2.0, 4.0]))
        .await
        .expect("update");

    let http = reqwest::Client::new();
    let base = format!("http://{addr}");

    let resp = http
        .post(format!("{base}/dump"))
        .send()
        .await
        .expect("dump request");
    assert!(resp.status().is_success());
    let body: serde_json::Value = resp.json().await.expect("dump body");
    assert_eq!(body["functions"], 1);

    let data = std::fs::read_to_string(&dump).expect("read dump");
    let rows: HashMap<String, Vec<f64>> = serde_json::from_str(&data).expect("parse dump");
    assert_eq!(rows.get("9"), Some(&vec![3.0, 1.0, 2e-6, 6.0, 20.0]));
    let _ = std::fs::remove_file(&dump);

    let health = http
        .get(format!("{base}/healthz"))
        .send()
        .await
        .expect("healthz");
    assert_eq!(health.text().await.expect("healthz body"), "ok");

    let metrics = http
        .get(format!("{base}/metrics"))
        .send()
        .await
        .expect("metrics")
        .text()
        .await
        .expect("metrics body");
    assert!(metrics.contains("perfsentry_ps_requests_total"));
    assert!(metrics.contains("perfsentry_ps_functions_tracked 1"));

    service.stop().await.expect("stop");
}

#[tokio::test]
async fn dump_writes_only_to_configured_path() {
    let pid = std::process::id();
    let configured = std::env::temp_dir().join(format!("perfsentry-dump-cfg-{pid}.json"));
    let requested = std::env::temp_dir()
        .join(format!("perfsentry-dump-req-{pid}"))
        .join("nested")
        .join("stats.json");
    let (service, addr) = start_service(Some(configured.clone())).await;
    client(addr)
        .update(1, RunStats::from_samples([1.0]))
        .await
        .expect("update");

    let resp = reqwest::Client::new()
        .post(format!("http://{addr}/dump"))
        .json(&serde_json::json!({ "path": requested }))
        .send()
        .await
        .expect("dump request");
    assert!(resp.status().is_success());
    let body: serde_json::Value = resp.json().await.expect("dump body");
    assert_eq!(body["path"], serde_json::json!(configured));

    assert!(configured.exists());
    assert!(!requested.exists());
    assert!(requested.parent().map_or(true, |dir| !dir.exists()));
    let _ = std::fs::remove_file(&configured);

    service.stop().await.expect("stop");
}

#[tokio::test]
async fn dump_without_configured_path_is_rejected() {
    let (service, addr) = start_service(None).await;

    let resp = reqwest::Client::new()
        .post(format!("http://{addr}/dump"))
        .json(&serde_json::json!({ "path": "/tmp/perfsentry-unconfigured.json" }))
        .send()
        .await
        .expect("dump request");
    assert_eq!(resp.status(), reqwest::StatusCode::BAD_REQUEST);

    service.stop().await.expect("stop");
}

#[tokio::test]
async fn malformed_bodies_count_as_errors() {
    let (service, addr) = start_service(None).await;
    let http = reqwest::Client::new();
    let base = format!("http://{addr}");

    let resp = http
        .post(format!("{base}/update"))
        .header("content-type", "application/json")
        .body(r#"{"id": "not-a-number"}"#)
        .send()
        .await
        .expect("update request");
    assert!(resp.status().is_client_error());

    let resp = http
        .post(format!("{base}/stat/abc"))
        .send()
        .await
        .expect("stat request");
    assert!(resp.status().is_client_error());

    let metrics = http
        .get(format!("{base}/metrics"))
        .send()
        .await
        .expect("metrics")
        .text()
        .await
        .expect("metrics body");
    assert!(metrics.contains(r#"perfsentry_ps_requests_total{route="update",status="error"} 1"#));
    assert!(metrics.contains(r#"perfsentry_ps_requests_total{route="stat",status="error"} 1"#));
    assert!(service.store().is_empty());

    service.stop().await.expect("stop");
}

#[tokio::test]
async fn shutdown_route_stops_service() {
    let (service, addr) = start_service(None).await;
    let client = client(addr);
    let token = service.shutdown_token().expect("token");

    let reply = client.shutdown().await.expect("shutdown");
    assert!(reply.contains("shutting down"));

    tokio::time::timeout(Duration::from_secs(5), token.cancelled())
        .await
        .expect("token cancelled");
    tokio::time::timeout(Duration::from_secs(5), service.wait())
        .await
        .expect("serve loop exited")
        .expect("join");
}

#[tokio::test]
async fn rank_driver_over_http() {
    let (service, addr) = start_service(None).await;
    let key = ThreadKey::new(0, 0, 0);

    let mut frame = Frame::new(0);
    frame.call_events.push(CallEvent::entry(key, 0, 0));
    let mut ts = 0;
    for r in [10, 10, 10, 10, 10, 10, 10, 10, 10, 500] {
        ts += 1;
        frame.call_events.push(CallEvent::entry(key, 1, ts));
        ts += r;
        frame.call_events.push(CallEvent::exit(key, 1, ts));
    }
    frame.call_events.push(CallEvent::exit(key, 0, ts + 1));

    let mut driver = RankDriver::new(
        0,
        FunctionTable::new(),
        DetectorConfig {
            sigma: 2.0,
            ..Default::default()
        },
        Some(client(addr)),
    );

    let status = driver.process_frame(&frame).await;
    let FrameStatus::Completed(out) = status else {
        panic!("expected completed frame, got {status:?}");
    };
    assert!(out.used_global_stats);
    assert_eq!(out.n_abnormal.get(&1), Some(&1));
    assert_eq!(service.store().get(1).count(), (10, 1));

    service.stop().await.expect("stop");
}

#[tokio::test]
async fn unreachable_server_falls_back_to_local() {
    let (service, addr) = start_service(None).await;
    service.stop().await.expect("stop");

    let key = ThreadKey::new(0, 0, 0);
    let mut frame = Frame::new(0);
    let mut ts = 0;
    for r in [10, 10, 10, 10, 10, 10, 10, 10, 10, 500] {
        ts += 1;
        frame.call_events.push(CallEvent::entry(key, 1, ts));
        ts += r;
        frame.call_events.push(CallEvent::exit(key, 1, ts));
    }

    let mut driver = RankDriver::new(
        0,
        FunctionTable::new(),
        DetectorConfig {
            sigma: 2.0,
            ..Default::default()
        },
        Some(Client::new(&ClientConfig {
            endpoint: format!("http://{addr}"),
            timeout: Duration::from_millis(500),
        })
        .expect("client")),
    );

    let status = driver.process_frame(&frame).await;
    let FrameStatus::Completed(out) = status else {
        panic!("expected completed frame, got {status:?}");
    };
    assert!(!out.used_global_stats);
    assert_eq!(out.n_abnormal.get(&1), Some(&1));
}
