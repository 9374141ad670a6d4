use super::*;

use std::time::Duration;

use bytes::Bytes;
use tempfile::TempDir;
use tokio::io::AsyncBufReadExt;
use tokio::net::TcpListener;
use tokio::time::{sleep, timeout};

fn fast_config(addr: &str) -> DestinationConfig {
    DestinationConfig::new(addr)
        .with_flush_period(Duration::from_millis(50))
        .with_reconnect_period(Duration::from_millis(150))
        .with_connect_timeout(Duration::from_secs(2))
        .with_write_timeout(Duration::from_secs(30))
}

fn fast_spool_config() -> SpoolConfig {
    SpoolConfig::default()
        .with_sync_every_n(100)
        .with_sync_period(Duration::from_millis(100))
}

/// Reserve a local port by binding and immediately releasing it
async fn reserve_addr() -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap().to_string();
    drop(listener);
    addr
}

/// Read `expected` newline-terminated records from one accepted connection
fn read_lines(
    listener: TcpListener,
    expected: usize,
) -> tokio::task::JoinHandle<Vec<String>> {
    tokio::spawn(async move {
        let (socket, _) = listener.accept().await.unwrap();
        let mut reader = tokio::io::BufReader::new(socket);
        let mut lines = Vec::new();
        let mut line = String::new();
        while lines.len() < expected {
            line.clear();
            if reader.read_line(&mut line).await.unwrap() == 0 {
                break;
            }
            lines.push(line.trim_end().to_string());
        }
        lines
    })
}

async fn wait_for(what: &str, mut cond: impl FnMut() -> bool) {
    for _ in 0..500 {
        if cond() {
            return;
        }
        sleep(Duration::from_millis(10)).await;
    }
    panic!("timed out waiting for {what}");
}

// =============================================================================
// Happy path (plaintext, no spool)
// =============================================================================

#[tokio::test]
async fn test_records_forwarded_in_order() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap().to_string();
    let server = read_lines(listener, 3);

    let registry = MetricsRegistry::new();
    let dest = Destination::new(fast_config(&addr), fast_spool_config(), Arc::clone(&registry))
        .unwrap();
    let metrics = dest.metrics_handle();
    let handle = dest.spawn().unwrap();

    wait_for("online", || handle.is_online()).await;

    for record in ["a.b 1 1700000000", "a.c 2 1700000001", "a.d 3 1700000002"] {
        handle.send(Bytes::from_static(record.as_bytes())).await.unwrap();
    }

    let lines = timeout(Duration::from_secs(5), server).await.unwrap().unwrap();
    assert_eq!(
        lines,
        vec!["a.b 1 1700000000", "a.c 2 1700000001", "a.d 3 1700000002"]
    );

    wait_for("deliveries counted", || metrics.snapshot().num_out == 3).await;
    let snapshot = metrics.snapshot();
    assert_eq!(snapshot.num_drop_slow_conn, 0);
    assert_eq!(snapshot.num_drop_slow_spool, 0);
    assert_eq!(snapshot.num_drop_no_conn_no_spool, 0);
    assert_eq!(snapshot.num_drop_bad_reencode, 0);

    handle.shutdown().await;
}

#[tokio::test]
async fn test_flush_reports_success() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap().to_string();
    let _server = read_lines(listener, 1);

    let registry = MetricsRegistry::new();
    let handle = Destination::new(fast_config(&addr), fast_spool_config(), registry)
        .unwrap()
        .spawn()
        .unwrap();

    wait_for("online", || handle.is_online()).await;
    handle.send(Bytes::from_static(b"a.b 1 1700000000")).await.unwrap();
    handle.flush().await.expect("flush");

    handle.shutdown().await;
}

// =============================================================================
// Drops without connection or spool
// =============================================================================

#[tokio::test]
async fn test_no_conn_no_spool_drops_are_counted() {
    let addr = reserve_addr().await;

    let registry = MetricsRegistry::new();
    let dest =
        Destination::new(fast_config(&addr), fast_spool_config(), Arc::clone(&registry)).unwrap();
    let metrics = dest.metrics_handle();
    let handle = dest.spawn().unwrap();

    for i in 0..5 {
        handle
            .send(Bytes::from(format!("a.b {i} 1700000000")))
            .await
            .unwrap();
    }

    wait_for("drops counted", || {
        metrics.snapshot().num_drop_no_conn_no_spool == 5
    })
    .await;
    assert!(!handle.is_online());

    handle.shutdown().await;
}

// =============================================================================
// Spool while down, replay after reconnect
// =============================================================================

#[tokio::test]
async fn test_spooled_records_replay_after_endpoint_returns() {
    let addr = reserve_addr().await;
    let spool_dir = TempDir::new().unwrap();

    let registry = MetricsRegistry::new();
    let config = fast_config(&addr).with_spool(spool_dir.path());
    let dest = Destination::new(config, fast_spool_config(), Arc::clone(&registry)).unwrap();
    let metrics = dest.metrics_handle();
    let handle = dest.spawn().unwrap();

    // no endpoint is listening; everything must land in the spool
    let sent: Vec<String> = (0..100)
        .map(|i| format!("spooled.metric {i} 1700000000"))
        .collect();
    for record in &sent {
        handle.send(Bytes::from(record.clone())).await.unwrap();
        sleep(Duration::from_millis(1)).await;
    }

    wait_for("records spooled", || metrics.snapshot().num_spool == 100).await;
    assert_eq!(metrics.snapshot().num_drop_slow_spool, 0);

    // bring the endpoint up; the engine reconnects and drains the spool
    let listener = TcpListener::bind(&addr).await.unwrap();
    let server = read_lines(listener, 100);

    let lines = timeout(Duration::from_secs(10), server).await.unwrap().unwrap();
    assert_eq!(lines.len(), 100);
    // ingress order is preserved within the replay stream
    assert_eq!(lines, sent);

    handle.shutdown().await;
}

// =============================================================================
// Slow connection
// =============================================================================

#[tokio::test]
async fn test_slow_connection_drops_but_never_blocks_ingress() {
    // accepts one connection and never reads from it
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap().to_string();
    let _server = tokio::spawn(async move {
        let (socket, _) = listener.accept().await.unwrap();
        // hold the socket open without reading
        sleep(Duration::from_secs(60)).await;
        drop(socket);
    });

    let registry = MetricsRegistry::new();
    let config = fast_config(&addr).with_io_buffer_size(10);
    let dest = Destination::new(config, fast_spool_config(), Arc::clone(&registry)).unwrap();
    let metrics = dest.metrics_handle();
    let handle = dest.spawn().unwrap();

    wait_for("online", || handle.is_online()).await;

    // enough volume to overrun the socket buffers and wedge the writer
    let ingress = handle.sender();
    let start = std::time::Instant::now();
    for i in 0..50_000 {
        ingress
            .send(Bytes::from(format!("flood.metric {i} 1700000000")))
            .await
            .unwrap();
    }
    let elapsed = start.elapsed();

    // the ingress never blocked on the slow destination
    assert!(elapsed < Duration::from_secs(30), "ingress stalled: {elapsed:?}");

    let snapshot = metrics.snapshot();
    assert!(snapshot.num_drop_slow_conn > 0, "expected slow-conn drops");
    assert!(snapshot.num_out < 50_000);

    handle.shutdown().await;
}

#[tokio::test]
async fn test_slow_connection_with_spool_fills_spool_after_death() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap().to_string();
    let _server = tokio::spawn(async move {
        let (socket, _) = listener.accept().await.unwrap();
        sleep(Duration::from_secs(60)).await;
        drop(socket);
    });

    let spool_dir = TempDir::new().unwrap();
    let registry = MetricsRegistry::new();
    let config = fast_config(&addr)
        .with_spool(spool_dir.path())
        .with_io_buffer_size(10)
        // a connection that cannot drain dies quickly
        .with_write_timeout(Duration::from_millis(200));
    let dest = Destination::new(config, fast_spool_config(), Arc::clone(&registry)).unwrap();
    let metrics = dest.metrics_handle();
    let handle = dest.spawn().unwrap();

    wait_for("online", || handle.is_online()).await;

    for i in 0..30_000 {
        handle
            .send(Bytes::from(format!("flood.metric {i} 1700000000")))
            .await
            .unwrap();
        if i % 500 == 0 {
            sleep(Duration::from_millis(1)).await;
        }
    }

    wait_for("slow-conn drops and spooled records", || {
        let s = metrics.snapshot();
        s.num_drop_slow_conn > 0 && s.num_spool > 0
    })
    .await;

    handle.shutdown().await;
}

// =============================================================================
// Redo recovery
// =============================================================================

#[tokio::test]
async fn test_unflushed_records_recovered_after_connection_death() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap().to_string();
    let spool_dir = TempDir::new().unwrap();

    let registry = MetricsRegistry::new();
    // long flush period: nothing reaches the wire until we let it
    let config = fast_config(&addr)
        .with_spool(spool_dir.path())
        .with_flush_period(Duration::from_secs(60));
    let dest = Destination::new(config, fast_spool_config(), Arc::clone(&registry)).unwrap();
    let metrics = dest.metrics_handle();
    let handle = dest.spawn().unwrap();

    let (socket, _) = listener.accept().await.unwrap();
    wait_for("online", || handle.is_online()).await;

    let sent: Vec<String> = (0..3).map(|i| format!("redo.metric {i} 1700000000")).collect();
    for record in &sent {
        handle.send(Bytes::from(record.clone())).await.unwrap();
    }
    wait_for("records buffered", || metrics.snapshot().num_buffered == 3).await;

    // kill the endpoint; the unflushed records must come back through the
    // spool and reach the endpoint after reconnect, exactly once each
    drop(socket);
    drop(listener);
    wait_for("offline", || !handle.is_online()).await;

    let listener = TcpListener::bind(&addr).await.unwrap();
    let server = read_lines(listener, 3);

    wait_for("online again", || handle.is_online()).await;
    // replay has finished once all three sit in the new connection's buffer
    wait_for("records replayed into conn", || {
        metrics.snapshot().num_buffered == 3
    })
    .await;
    handle.flush().await.expect("flush");

    let lines = timeout(Duration::from_secs(10), server).await.unwrap().unwrap();
    assert_eq!(lines, sent);

    handle.shutdown().await;
}

// =============================================================================
// Re-encoding
// =============================================================================

#[tokio::test]
async fn test_malformed_record_dropped_before_the_wire() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap().to_string();

    let server = tokio::spawn(async move {
        let (mut socket, _) = listener.accept().await.unwrap();
        let mut buf = Vec::new();
        tokio::io::AsyncReadExt::read_to_end(&mut socket, &mut buf)
            .await
            .unwrap();
        buf
    });

    let registry = MetricsRegistry::new();
    let config = fast_config(&addr).with_reencode();
    let dest = Destination::new(config, fast_spool_config(), Arc::clone(&registry)).unwrap();
    let metrics = dest.metrics_handle();
    let handle = dest.spawn().unwrap();

    wait_for("online", || handle.is_online()).await;

    handle.send(Bytes::from_static(b"only_two_fields 1")).await.unwrap();
    wait_for("bad re-encode counted", || {
        metrics.snapshot().num_drop_bad_reencode == 1
    })
    .await;

    // a well-formed record still goes out, framed
    handle.send(Bytes::from_static(b"a.b 2 1700000001")).await.unwrap();
    handle.flush().await.expect("flush");
    handle.shutdown().await;

    let received = server.await.unwrap();
    let (decoded, consumed) = ferry_protocol::decode_frame(&received).expect("one valid frame");
    assert_eq!(decoded.name, "a.b");
    assert_eq!(decoded.value, 2.0);
    assert_eq!(decoded.timestamp, 1_700_000_001);
    // the malformed line contributed zero bytes
    assert_eq!(consumed, received.len());
}

// =============================================================================
// Metrics reporting
// =============================================================================

#[tokio::test]
async fn test_snapshot_reports_spool_truncation() {
    let addr = reserve_addr().await;
    let spool_dir = TempDir::new().unwrap();

    let registry = MetricsRegistry::new();
    let config = fast_config(&addr).with_spool(spool_dir.path());
    let dest = Destination::new(config, fast_spool_config(), Arc::clone(&registry)).unwrap();
    let metrics = dest.metrics_handle();
    let handle = dest.spawn().unwrap();

    assert_eq!(metrics.snapshot().num_err_truncated, 0);

    // truncation is counted on the spool's set; the destination handle
    // must surface it
    let clean = ferry_protocol::clean_addr(&addr);
    registry.spool(&clean).num_err_truncated.inc();
    assert_eq!(metrics.snapshot().num_err_truncated, 1);

    handle.shutdown().await;
}

#[tokio::test]
async fn test_snapshot_without_spool_has_no_truncation() {
    let addr = reserve_addr().await;

    let registry = MetricsRegistry::new();
    let dest =
        Destination::new(fast_config(&addr), fast_spool_config(), Arc::clone(&registry)).unwrap();
    let metrics = dest.metrics_handle();
    let handle = dest.spawn().unwrap();

    // no spool, nothing to truncate; a stray spool series under the same
    // key must not leak into the destination snapshot
    registry.spool(&ferry_protocol::clean_addr(&addr)).num_err_truncated.inc();
    assert_eq!(metrics.snapshot().num_err_truncated, 0);

    handle.shutdown().await;
}

// =============================================================================
// Address updates
// =============================================================================

#[tokio::test]
async fn test_address_update_rebuilds_metric_labels() {
    let old_addr = reserve_addr().await;

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let new_addr = listener.local_addr().unwrap().to_string();
    let server = read_lines(listener, 1);

    let registry = MetricsRegistry::new();
    let handle = Destination::new(
        fast_config(&old_addr),
        fast_spool_config(),
        Arc::clone(&registry),
    )
    .unwrap()
    .spawn()
    .unwrap();

    handle.update_address(new_addr.clone()).await;
    wait_for("online at new address", || handle.is_online()).await;
    assert_eq!(handle.snapshot().addr, new_addr);

    handle.send(Bytes::from_static(b"moved.metric 1 1700000000")).await.unwrap();
    handle.flush().await.expect("flush");

    let lines = timeout(Duration::from_secs(5), server).await.unwrap().unwrap();
    assert_eq!(lines, vec!["moved.metric 1 1700000000"]);

    // the delivery is accounted under the new sanitised address
    let new_metrics = registry.destination(&ferry_protocol::clean_addr(&new_addr));
    assert_eq!(new_metrics.num_out.get(), 1);
    let old_metrics = registry.destination(&ferry_protocol::clean_addr(&old_addr));
    assert_eq!(old_metrics.num_out.get(), 0);

    handle.shutdown().await;
}

// =============================================================================
// Shutdown
// =============================================================================

#[tokio::test]
async fn test_shutdown_while_offline_does_not_hang() {
    let addr = reserve_addr().await;

    let registry = MetricsRegistry::new();
    let handle = Destination::new(fast_config(&addr), fast_spool_config(), registry)
        .unwrap()
        .spawn()
        .unwrap();

    // shut down immediately, likely racing the first connect attempt
    timeout(Duration::from_secs(10), handle.shutdown())
        .await
        .expect("shutdown hung");
}

#[tokio::test]
async fn test_shutdown_with_spool_persists_unsent_records() {
    let addr = reserve_addr().await;
    let spool_dir = TempDir::new().unwrap();

    let registry = MetricsRegistry::new();
    let config = fast_config(&addr).with_spool(spool_dir.path());
    let spool_config = fast_spool_config();
    let dest = Destination::new(config, spool_config.clone(), Arc::clone(&registry)).unwrap();
    let metrics = dest.metrics_handle();
    let handle = dest.spawn().unwrap();

    for i in 0..20 {
        handle
            .send(Bytes::from(format!("persisted.metric {i} 1700000000")))
            .await
            .unwrap();
        sleep(Duration::from_millis(1)).await;
    }
    wait_for("records spooled", || metrics.snapshot().num_spool == 20).await;

    handle.shutdown().await;

    // the disk queue still holds the records for the next run
    let clean = ferry_protocol::clean_addr(&addr);
    let spool_metrics = Arc::new(ferry_metrics::SpoolMetrics::new());
    let mut queue = ferry_spool::DiskQueue::open(
        &format!("spool_{clean}"),
        spool_dir.path(),
        &spool_config,
        spool_metrics,
    )
    .expect("reopen spool queue");
    // a handful of records can be in flight between the queue task, the
    // read channel, the throttle and the output slot when the spool closes
    let mut remaining = 0;
    while queue.pop().expect("pop").is_some() {
        remaining += 1;
    }
    assert!(remaining >= 15, "expected records on disk, got {remaining}");
}
