//! Integration tests for target reconciliation against a real registry
//!
//! Fake Redis and Predixy endpoints answer `INFO` over TCP so the collectors
//! registered by the reconciler produce real samples.

#![allow(deprecated)]

use cacheeasy_exporter::collectors::{PrometheusAdapter, ScrapeOptions};
use cacheeasy_exporter::config::load_config;
use cacheeasy_exporter::reconcile::Reconciler;
use cacheeasy_exporter::scheduler::{refresh_once, ConfigFileSource};
use cacheeasy_exporter::server::{gather, ServerState};
use cacheeasy_exporter::target::{Target, TargetKind};
use prometheus::{Encoder, Registry, TextEncoder};
use std::fs;
use std::io::{Read, Write};
use std::net::TcpListener;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use tempfile::TempDir;

const REDIS_INFO: &str = "# Server\r\nuptime_in_seconds:120\r\n\r\n# Clients\r\nconnected_clients:7\r\n\r\n# Keyspace\r\ndb0:keys=3,expires=1,avg_ttl=0\r\n";

const PREDIXY_INFO: &str = "# Proxy\nWorkerThreads:2\n\n# Stats\nAccept:4\nTotalRequests:10\n\n# Servers\nServer:10.0.0.1:6379\nCurrentIsFail:0\nConnections:1\n";

/// Answer every `INFO` request on a fresh port until the test process exits
fn fake_endpoint(body: &'static str) -> String {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let address = listener.local_addr().unwrap().to_string();
    thread::spawn(move || {
        for stream in listener.incoming() {
            let Ok(mut stream) = stream else { continue };
            let mut request = [0u8; 14];
            if stream.read_exact(&mut request).is_err() {
                continue;
            }
            let reply = format!("${}\r\n{}\r\n", body.len(), body);
            let _ = stream.write_all(reply.as_bytes());
        }
    });
    address
}

/// Accept connections and never answer them
fn silent_endpoint() -> String {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let address = listener.local_addr().unwrap().to_string();
    thread::spawn(move || {
        let mut held = Vec::new();
        for stream in listener.incoming().flatten() {
            held.push(stream);
        }
    });
    address
}

fn exposition(registry: &Registry) -> String {
    let mut buffer = Vec::new();
    TextEncoder::new()
        .encode(&registry.gather(), &mut buffer)
        .unwrap();
    String::from_utf8(buffer).unwrap()
}

fn engine(registry: &Registry) -> Reconciler<PrometheusAdapter> {
    let options = ScrapeOptions {
        timeout: Duration::from_secs(1),
    };
    Reconciler::new(PrometheusAdapter::with_options(registry.clone(), options))
}

#[test]
fn test_targets_show_up_and_disappear() {
    let registry = Registry::new();
    let engine = engine(&registry);
    let redis = fake_endpoint(REDIS_INFO);
    let proxy = fake_endpoint(PREDIXY_INFO);

    engine
        .reconcile(&[
            Target::new(redis.clone(), "cache-a", TargetKind::CacheServer),
            Target::new(proxy.clone(), "proxy-a", TargetKind::Proxy),
        ])
        .unwrap();

    let text = exposition(&registry);
    assert!(text.contains(&format!("redis_up{{addr=\"{}\",alias=\"cache-a\"}} 1", redis)));
    assert!(text.contains(&format!(
        "redis_connected_clients{{addr=\"{}\",alias=\"cache-a\"}} 7",
        redis
    )));
    assert!(text.contains(&format!(
        "redis_db_keys{{addr=\"{}\",alias=\"cache-a\",db=\"db0\"}} 3",
        redis
    )));
    assert!(text.contains(&format!("predixy_up{{addr=\"{}\",alias=\"proxy-a\"}} 1", proxy)));
    assert!(text.contains(&format!(
        "predixy_server_connections{{addr=\"{}\",alias=\"proxy-a\",server=\"10.0.0.1:6379\"}} 1",
        proxy
    )));

    // Dropping the proxy removes every one of its samples
    engine
        .reconcile(&[Target::new(redis.clone(), "cache-a", TargetKind::CacheServer)])
        .unwrap();
    let text = exposition(&registry);
    assert!(text.contains("redis_up"));
    assert!(!text.contains("predixy_"));
}

#[test]
fn test_rename_swaps_alias_without_duplicates() {
    let registry = Registry::new();
    let engine = engine(&registry);
    let redis = fake_endpoint(REDIS_INFO);

    engine
        .reconcile(&[Target::new(redis.clone(), "tok1", TargetKind::CacheServer)])
        .unwrap();
    let report = engine
        .reconcile(&[Target::new(redis.clone(), "tok2", TargetKind::CacheServer)])
        .unwrap();
    assert_eq!(report.replaced, 1);

    let text = exposition(&registry);
    assert!(text.contains(&format!("redis_up{{addr=\"{}\",alias=\"tok2\"}} 1", redis)));
    assert!(!text.contains("alias=\"tok1\""));
    assert_eq!(text.matches("\nredis_up{").count(), 1);
}

#[test]
fn test_kind_change_switches_collector() {
    let registry = Registry::new();
    let engine = engine(&registry);
    let address = fake_endpoint(PREDIXY_INFO);

    engine
        .reconcile(&[Target::new(address.clone(), "edge", TargetKind::CacheServer)])
        .unwrap();
    engine
        .reconcile(&[Target::new(address.clone(), "edge", TargetKind::Proxy)])
        .unwrap();

    let text = exposition(&registry);
    assert!(text.contains(&format!("predixy_up{{addr=\"{}\",alias=\"edge\"}} 1", address)));
    assert!(!text.contains("redis_up"));
}

#[test]
fn test_unreachable_target_reports_down() {
    let registry = Registry::new();
    let engine = engine(&registry);

    engine
        .reconcile(&[Target::new("127.0.0.1:1", "gone", TargetKind::CacheServer)])
        .unwrap();

    let text = exposition(&registry);
    assert!(text.contains("redis_up{addr=\"127.0.0.1:1\",alias=\"gone\"} 0"));
    assert!(!text.contains("redis_connected_clients"));
}

#[tokio::test]
async fn test_config_edits_apply_on_refresh() {
    let temp_dir = TempDir::new().unwrap();
    let path = temp_dir.path().join("cacheeasy_exporter.yml");
    let redis = fake_endpoint(REDIS_INFO);
    let proxy = fake_endpoint(PREDIXY_INFO);

    fs::write(&path, format!("redis:\n  - \"{} cache-a\"\n", redis)).unwrap();
    let config = load_config(&path).unwrap();
    let (targets, _) = config.targets();

    let registry = Registry::new();
    let engine = Arc::new(engine(&registry));
    engine.reconcile(&targets).unwrap();

    fs::write(
        &path,
        format!("redis: []\npredixy:\n  - \"{} proxy-a\"\n", proxy),
    )
    .unwrap();
    let source = Arc::new(ConfigFileSource::new(&path));
    let report = refresh_once(&engine, &source).await.unwrap();
    assert_eq!(report.added, 1);
    assert_eq!(report.removed, 1);

    let text = tokio::task::spawn_blocking(move || exposition(&registry))
        .await
        .unwrap();
    assert!(text.contains("predixy_up"));
    assert!(!text.contains("redis_up"));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_hanging_targets_time_out_together() {
    let registry = Registry::new();
    let options = ScrapeOptions {
        timeout: Duration::from_millis(500),
    };
    let engine = Arc::new(Reconciler::new(PrometheusAdapter::with_options(
        registry.clone(),
        options,
    )));
    let targets: Vec<Target> = (0..4)
        .map(|i| Target::new(silent_endpoint(), format!("hang-{}", i), TargetKind::CacheServer))
        .collect();
    engine.reconcile(&targets).unwrap();

    let state = ServerState { registry, engine };
    let started = Instant::now();
    let families = gather(&state).await.unwrap();
    let elapsed = started.elapsed();

    // One timeout for all four, not one per target
    assert!(elapsed < Duration::from_millis(1500), "took {:?}", elapsed);
    let up = families
        .iter()
        .find(|family| family.get_name() == "redis_up")
        .unwrap();
    assert_eq!(up.get_metric().len(), 4);
    assert!(up.get_metric().iter().all(|m| m.get_gauge().value() == 0.0));
}
