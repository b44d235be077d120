/*
 * Copyright 2024 ArpNetworking
 *
 * Licensed under the Apache License, Version 2.0 (the "License");
 * you may not use this file except in compliance with the License.
 * You may obtain a copy of the License at
 *
 *     http://www.apache.org/licenses/LICENSE-2.0
 *
 * Unless required by applicable law or agreed to in writing, software
 * distributed under the License is distributed on an "AS IS" BASIS,
 * WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
 * See the License for the specific language governing permissions and
 * limitations under the License.
 */

use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use statsdaemon::aggregation::stats::ThresholdMode;
use statsdaemon::aggregation::{AggregationEngine, AggregatorConfig, AggregatorHandle};
use statsdaemon::config::DaemonConfig;
use statsdaemon::sinks::{FlushBatch, MetricsSink};
use statsdaemon::sources::{MetricsSource, StatsdSource};
use statsdaemon::StatsDaemon;
use tokio::net::UdpSocket;

fn aggregator_config() -> AggregatorConfig {
    AggregatorConfig {
        flush_interval: Duration::from_secs(3600),
        percent_threshold: 90,
        threshold_mode: ThresholdMode::Truncated,
    }
}

#[derive(Clone, Default)]
struct CollectingSink {
    batches: Arc<Mutex<Vec<FlushBatch>>>,
}

#[async_trait]
impl MetricsSink for CollectingSink {
    async fn send(&self, batch: &FlushBatch) -> Result<()> {
        self.batches.lock().unwrap().push(batch.clone());
        Ok(())
    }

    fn name(&self) -> &str {
        "collecting"
    }
}

/// Value of `path` in a flushed batch, if present.
fn value_of(batch: &FlushBatch, path: &str) -> Option<i64> {
    batch.lines().find_map(|line| {
        let (name, rest) = line.split_once(' ')?;
        if name != path {
            return None;
        }
        rest.split(' ').next()?.parse().ok()
    })
}

/// Flush repeatedly until the summed `path` reaches `expected`.
///
/// Datagrams are parsed on independent tasks, so a single flush right after
/// sending may not see all of them yet.
async fn wait_for_count(handle: &AggregatorHandle, path: &str, expected: i64) -> i64 {
    let mut total = 0;
    for _ in 0..200 {
        if let Some(batch) = handle.flush().await.unwrap() {
            total += value_of(&batch, path).unwrap_or(0);
        }
        if total >= expected {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    total
}

async fn start_source(
    sinks: Vec<Box<dyn MetricsSink>>,
) -> (std::net::SocketAddr, AggregatorHandle) {
    let source = StatsdSource::bind("127.0.0.1:0".parse().unwrap(), 4)
        .await
        .unwrap();
    let addr = source.local_addr();
    let (handle, _engine) = AggregationEngine::new(aggregator_config(), sinks, 64).start();

    let source_handle = handle.clone();
    tokio::spawn(async move { source.run(source_handle).await });

    (addr, handle)
}

#[tokio::test]
async fn test_udp_samples_are_aggregated() {
    let sink = CollectingSink::default();
    let (addr, handle) = start_source(vec![Box::new(sink.clone())]).await;

    let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    client
        .send_to(b"requests:1|c|@0.5\nlatency:20|ms\nlatency:10|ms", addr)
        .await
        .unwrap();

    let total = wait_for_count(&handle, "stats_counts.requests", 2).await;
    assert_eq!(total, 2);

    let batches = sink.batches.lock().unwrap().clone();
    let timer_count: i64 = batches
        .iter()
        .filter_map(|batch| value_of(batch, "stats.timers.latency.count"))
        .sum();
    assert_eq!(timer_count, 2);
}

#[tokio::test]
async fn test_every_datagram_counted_exactly_once() {
    let (addr, handle) = start_source(Vec::new()).await;

    let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let datagrams = 50;
    for _ in 0..datagrams {
        client.send_to(b"hits:1|c", addr).await.unwrap();
        // Stay well below the loopback socket buffer.
        tokio::task::yield_now().await;
    }

    let total = wait_for_count(&handle, "stats_counts.hits", datagrams).await;
    assert_eq!(total, datagrams);
}

#[tokio::test]
async fn test_garbage_datagram_is_ignored() {
    let (addr, handle) = start_source(Vec::new()).await;

    let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    client.send_to(b"\xff\xfe not a metric", addr).await.unwrap();
    client.send_to(b"ok:3|c", addr).await.unwrap();

    let total = wait_for_count(&handle, "stats_counts.ok", 3).await;
    assert_eq!(total, 3);
}

#[tokio::test]
async fn test_oversized_datagram_is_truncated() {
    let sink = CollectingSink::default();
    let (addr, handle) = start_source(vec![Box::new(sink.clone())]).await;

    // The first sample ends right at the size limit, the second lies past it.
    let prefix = "x".repeat(505);
    let datagram = format!("{}\na:1|c\nb:1|c", prefix);
    assert!(datagram.len() > statsdaemon::sources::statsd::MAX_DATAGRAM_SIZE);

    let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    client.send_to(datagram.as_bytes(), addr).await.unwrap();

    // Newlines are not part of the bucket alphabet, so the prefix joins the first name.
    let first = format!("stats_counts.{}a", prefix);
    assert_eq!(wait_for_count(&handle, &first, 1).await, 1);
    handle.flush().await.unwrap();

    let batches = sink.batches.lock().unwrap().clone();
    assert!(!batches.is_empty());
    for batch in &batches {
        assert!(batch
            .lines()
            .all(|line| !line.starts_with("stats_counts.b ")));
    }
}

#[tokio::test]
async fn test_bind_failure_is_reported() {
    let taken = std::net::UdpSocket::bind("127.0.0.1:0").unwrap();
    let addr = taken.local_addr().unwrap();

    assert!(StatsdSource::bind(addr, 1).await.is_err());
}

#[tokio::test]
async fn test_daemon_flushes_to_file_on_shutdown() {
    let dir = tempfile::tempdir().unwrap();
    let output = dir.path().join("stats.csv");

    let config = DaemonConfig {
        listen_address: "127.0.0.1:0".parse().unwrap(),
        graphite_address: "-".to_string(),
        output_file: output.clone(),
        flush_interval: Duration::from_secs(3600),
        ..Default::default()
    };
    let mut daemon = StatsDaemon::new(config).unwrap();
    daemon.start().await.unwrap();
    let addr = daemon.local_addr().unwrap();

    // Submit straight to the engine so the final flush is guaranteed to see it.
    let handle = daemon.aggregator().unwrap().clone();
    for value in [3, 1, 2] {
        handle
            .submit(statsdaemon::model::Packet::timer("db", value).unwrap())
            .await
            .unwrap();
    }
    let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    client.send_to(b"ignored_if_late:1|c", addr).await.unwrap();

    daemon.shutdown();
    daemon.wait_for_shutdown().await.unwrap();

    let contents = std::fs::read_to_string(&output).unwrap();
    let lines: Vec<_> = contents.lines().collect();
    assert!(lines.iter().any(|l| l.starts_with("stats.timers.db.mean 2 ")));
    assert!(lines.iter().any(|l| l.starts_with("stats.timers.db.upper_90 3 ")));
    assert!(lines.iter().any(|l| l.starts_with("stats.timers.db.lower 1 ")));
    assert!(lines.last().unwrap().starts_with("statsd.numStats "));
    assert!(handle.flush().await.is_err());
}

#[tokio::test]
async fn test_daemon_rejects_invalid_config() {
    let config = DaemonConfig {
        percent_threshold: 150,
        ..Default::default()
    };
    assert!(StatsDaemon::new(config).is_err());
}
