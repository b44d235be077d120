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

//! Interval-based metrics aggregation engine
//!
//! The [`Aggregator`] holds all mutable counter and timer state. It is owned by
//! exactly one task, the [`AggregationEngine`] event loop, which alternates
//! between applying queued packets and flushing on each interval tick. Both
//! branches run on the same task, so a flush never observes a half-applied
//! sample and no lock is needed. Everything else talks to the engine through
//! an [`AggregatorHandle`] over a bounded queue.

use crate::config::DaemonConfig;
use crate::model::{Modifier, Packet};
use crate::sinks::{FlushBatch, FlushBatchBuilder, MetricsSink};
use ahash::{HashMap, HashMapExt};
use anyhow::{anyhow, Result};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{self, Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

pub mod stats;

use stats::{ThresholdMode, TimerSummary};

/// Shortest interval the engine ticks at
const MIN_FLUSH_INTERVAL: Duration = Duration::from_secs(1);

/// Parameters of the flush reduction
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AggregatorConfig {
    /// Flush interval; counter rates are divided by its whole seconds
    pub flush_interval: Duration,
    pub percent_threshold: u8,
    pub threshold_mode: ThresholdMode,
}

impl From<&DaemonConfig> for AggregatorConfig {
    fn from(config: &DaemonConfig) -> Self {
        Self {
            flush_interval: config.flush_interval,
            percent_threshold: config.percent_threshold,
            threshold_mode: config.threshold_mode,
        }
    }
}

/// Counter and timer state accumulated between flushes.
///
/// Entries are created on first use and reset, never removed, by a flush.
/// A bucket name used with both modifiers gets two independent entries.
#[derive(Debug)]
pub struct Aggregator {
    config: AggregatorConfig,
    counters: HashMap<String, i64>,
    timers: HashMap<String, Vec<i64>>,
}

impl Aggregator {
    pub fn new(config: AggregatorConfig) -> Self {
        Self {
            config,
            counters: HashMap::new(),
            timers: HashMap::new(),
        }
    }

    /// Apply one sample.
    ///
    /// Timers record the raw value; counters add the sampling-corrected value.
    pub fn record(&mut self, packet: &Packet) {
        match packet.modifier() {
            Modifier::Timer => match self.timers.get_mut(packet.bucket()) {
                Some(values) => values.push(packet.value()),
                None => {
                    self.warn_on_collision(packet);
                    self.timers
                        .insert(packet.bucket().to_owned(), vec![packet.value()]);
                }
            },
            Modifier::Counter => {
                let corrected = packet.corrected_value();
                match self.counters.get_mut(packet.bucket()) {
                    Some(count) => *count = count.saturating_add(corrected),
                    None => {
                        self.warn_on_collision(packet);
                        self.counters.insert(packet.bucket().to_owned(), corrected);
                    }
                }
            }
        }
    }

    fn warn_on_collision(&self, packet: &Packet) {
        let collides = match packet.modifier() {
            Modifier::Timer => self.counters.contains_key(packet.bucket()),
            Modifier::Counter => self.timers.contains_key(packet.bucket()),
        };
        if collides {
            warn!(
                bucket = packet.bucket(),
                "bucket is used as both counter and timer; keeping independent entries"
            );
        }
    }

    /// Reduce the accumulated state into output lines and reset it.
    ///
    /// Counters with a zero value and empty timers produce no output. Returns
    /// `None` when no bucket produced output.
    pub fn flush(&mut self, timestamp: i64) -> Option<FlushBatch> {
        let mut batch = FlushBatchBuilder::new(timestamp);
        let interval_secs = i64::try_from(self.config.flush_interval.as_secs())
            .unwrap_or(i64::MAX)
            .max(1);

        let mut counters: Vec<_> = self
            .counters
            .iter_mut()
            .filter(|(_, count)| **count != 0)
            .collect();
        counters.sort_unstable_by(|a, b| a.0.cmp(b.0));

        for (bucket, count) in counters {
            batch.line(format_args!("stats.{}", bucket), *count / interval_secs);
            batch.line(format_args!("stats_counts.{}", bucket), *count);
            batch.stat();
            *count = 0;
        }

        let mut timers: Vec<_> = self
            .timers
            .iter_mut()
            .filter(|(_, values)| !values.is_empty())
            .collect();
        timers.sort_unstable_by(|a, b| a.0.cmp(b.0));

        let percent = self.config.percent_threshold;
        for (bucket, values) in timers {
            let summary = TimerSummary::compute(values, percent, self.config.threshold_mode);
            values.clear();

            let Some(summary) = summary else {
                continue;
            };
            batch.line(format_args!("stats.timers.{}.mean", bucket), summary.mean);
            batch.line(format_args!("stats.timers.{}.upper", bucket), summary.upper);
            batch.line(
                format_args!("stats.timers.{}.upper_{}", bucket, percent),
                summary.upper_threshold,
            );
            batch.line(format_args!("stats.timers.{}.lower", bucket), summary.lower);
            batch.line(format_args!("stats.timers.{}.count", bucket), summary.count);
            batch.stat();
        }

        batch.finish()
    }

    /// Number of bucket entries (counter and timer) ever created
    pub fn bucket_count(&self) -> usize {
        self.counters.len() + self.timers.len()
    }
}

/// Messages accepted by the aggregation engine
#[derive(Debug)]
pub enum AggregatorMessage {
    /// Apply one parsed sample
    Submit(Packet),
    /// Flush now and report the emitted batch
    Flush(oneshot::Sender<Option<FlushBatch>>),
    /// Flush one last time, report the batch and stop the loop
    Shutdown(oneshot::Sender<Option<FlushBatch>>),
}

/// Cloneable sender side of the engine's bounded input queue
#[derive(Debug, Clone)]
pub struct AggregatorHandle {
    sender: mpsc::Sender<AggregatorMessage>,
}

impl AggregatorHandle {
    /// Enqueue a packet, waiting while the queue is full
    pub async fn submit(&self, packet: Packet) -> Result<()> {
        self.sender
            .send(AggregatorMessage::Submit(packet))
            .await
            .map_err(|_| anyhow!("aggregation engine has stopped"))
    }

    /// Run a flush cycle after every packet already queued has been applied
    pub async fn flush(&self) -> Result<Option<FlushBatch>> {
        self.request(AggregatorMessage::Flush).await
    }

    /// Flush remaining state and stop the engine
    pub async fn shutdown(&self) -> Result<Option<FlushBatch>> {
        self.request(AggregatorMessage::Shutdown).await
    }

    async fn request(
        &self,
        message: impl FnOnce(oneshot::Sender<Option<FlushBatch>>) -> AggregatorMessage,
    ) -> Result<Option<FlushBatch>> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(message(tx))
            .await
            .map_err(|_| anyhow!("aggregation engine has stopped"))?;
        rx.await
            .map_err(|_| anyhow!("aggregation engine stopped before responding"))
    }
}

/// Event loop that owns the [`Aggregator`] and delivers flushes to sinks
pub struct AggregationEngine {
    aggregator: Aggregator,
    sinks: Vec<Box<dyn MetricsSink>>,
    sink_timeout: Option<Duration>,
    queue_capacity: usize,
}

impl AggregationEngine {
    /// Create a new aggregation engine
    pub fn new(
        config: AggregatorConfig,
        sinks: Vec<Box<dyn MetricsSink>>,
        queue_capacity: usize,
    ) -> Self {
        Self {
            aggregator: Aggregator::new(config),
            sinks,
            sink_timeout: None,
            queue_capacity: queue_capacity.max(1),
        }
    }

    /// Bound every sink send by `timeout`
    pub fn with_sink_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.sink_timeout = timeout;
        self
    }

    /// Spawn the event loop, returning a handle to its input queue
    pub fn start(self) -> (AggregatorHandle, JoinHandle<()>) {
        let (sender, receiver) = mpsc::channel(self.queue_capacity);
        let task = tokio::spawn(self.run(receiver));
        (AggregatorHandle { sender }, task)
    }

    async fn run(mut self, mut receiver: mpsc::Receiver<AggregatorMessage>) {
        // Rates are computed per whole second, so tick no faster than that.
        let period = self.aggregator.config.flush_interval.max(MIN_FLUSH_INTERVAL);
        let mut ticker = time::interval_at(Instant::now() + period, period);
        // A slow sink delays the next flush rather than causing a burst.
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;

                _ = ticker.tick() => {
                    self.flush().await;
                }
                message = receiver.recv() => match message {
                    Some(AggregatorMessage::Submit(packet)) => self.aggregator.record(&packet),
                    Some(AggregatorMessage::Flush(reply)) => {
                        let batch = self.flush().await;
                        let _ = reply.send(batch);
                    }
                    Some(AggregatorMessage::Shutdown(reply)) => {
                        let batch = self.flush().await;
                        let _ = reply.send(batch);
                        break;
                    }
                    None => {
                        self.flush().await;
                        break;
                    }
                },
            }
        }

        info!("aggregation engine stopped");
    }

    async fn flush(&mut self) -> Option<FlushBatch> {
        let timestamp = chrono::Utc::now().timestamp();
        let Some(batch) = self.aggregator.flush(timestamp) else {
            debug!("nothing to flush");
            return None;
        };

        info!(
            num_stats = batch.num_stats(),
            bytes = batch.as_bytes().len(),
            "flushing stats"
        );

        for sink in &self.sinks {
            let result = match self.sink_timeout {
                Some(limit) => match time::timeout(limit, sink.send(&batch)).await {
                    Ok(result) => result,
                    Err(_) => Err(anyhow!("timed out after {:?}", limit)),
                },
                None => sink.send(&batch).await,
            };

            if let Err(err) = result {
                warn!(sink = sink.name(), error = %format!("{:#}", err), "sink failed, dropping flush");
            }
        }

        Some(batch)
    }
}
