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

//! # StatsD Aggregation Daemon
//!
//! Listens for StatsD counter and timer samples over UDP, aggregates them in
//! memory and periodically writes rates, counts and timer percentiles in the
//! Graphite plaintext format to a carbon endpoint and/or a local file.
//!
//! ## Pipeline
//!
//! - **Source**: UDP listener, one bounded parse task per datagram
//! - **Aggregation**: single-owner event loop fed by a bounded queue
//! - **Sinks**: Graphite over TCP and an append-only file, both optional
//!
//! ## Example
//!
//! ```rust,no_run
//! use statsdaemon::{StatsDaemon, config::DaemonConfig};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = DaemonConfig::from_file("statsdaemon.json")?;
//!     let mut daemon = StatsDaemon::new(config)?;
//!     daemon.start().await?;
//!     daemon.wait_for_shutdown().await?;
//!     Ok(())
//! }
//! ```

use anyhow::{bail, Context, Result};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::signal;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{info, warn};

pub mod aggregation;
pub mod config;
pub mod model;
pub mod parser;
pub mod sinks;
pub mod sources;

use aggregation::{AggregationEngine, AggregatorConfig, AggregatorHandle};
use config::DaemonConfig;
use sinks::{FileSink, GraphiteSink, MetricsSink};
use sources::{MetricsSource, StatsdSource};

/// Main daemon instance
pub struct StatsDaemon {
    config: DaemonConfig,
    shutdown_notify: Arc<Notify>,
    running: Option<Running>,
}

struct Running {
    local_addr: SocketAddr,
    aggregator: AggregatorHandle,
    source_task: JoinHandle<()>,
    engine_task: JoinHandle<()>,
}

impl StatsDaemon {
    /// Create a new daemon instance with the given configuration
    pub fn new(config: DaemonConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            config,
            shutdown_notify: Arc::new(Notify::new()),
            running: None,
        })
    }

    /// Bind the listener and start the aggregation engine and source.
    ///
    /// Failing to bind the listener is returned as an error.
    pub async fn start(&mut self) -> Result<()> {
        if self.running.is_some() {
            bail!("daemon is already running");
        }
        info!(
            percent_threshold = self.config.percent_threshold,
            threshold_mode = ?self.config.threshold_mode,
            flush_interval = ?self.config.flush_interval,
            "starting statsd daemon"
        );

        let source = StatsdSource::bind(self.config.listen_address, self.config.parse_workers)
            .await
            .context("Failed to start StatsD source")?;
        let local_addr = source.local_addr();

        let engine = AggregationEngine::new(
            AggregatorConfig::from(&self.config),
            self.build_sinks(),
            self.config.queue_capacity,
        )
        .with_sink_timeout(self.config.sink_timeout);
        let (aggregator, engine_task) = engine.start();

        let source_handle = aggregator.clone();
        let source_task = tokio::spawn(async move {
            if let Err(err) = source.run(source_handle).await {
                warn!(source = source.name(), error = %format!("{:#}", err), "source stopped");
            }
        });

        self.setup_signal_handlers();

        self.running = Some(Running {
            local_addr,
            aggregator,
            source_task,
            engine_task,
        });

        info!("all services started successfully");
        Ok(())
    }

    fn build_sinks(&self) -> Vec<Box<dyn MetricsSink>> {
        let mut sinks: Vec<Box<dyn MetricsSink>> = Vec::new();
        match self.config.graphite_target() {
            Some(address) => {
                info!(%address, "graphite sink enabled");
                sinks.push(Box::new(GraphiteSink::new(address)));
            }
            None => info!("graphite sink disabled"),
        }
        match self.config.output_target() {
            Some(path) => {
                info!(path = %path.display(), "file sink enabled");
                sinks.push(Box::new(FileSink::new(path)));
            }
            None => info!("file sink disabled"),
        }
        sinks
    }

    /// Address the listener is bound to, once started
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.running.as_ref().map(|running| running.local_addr)
    }

    /// Handle to the running aggregation engine, once started
    pub fn aggregator(&self) -> Option<&AggregatorHandle> {
        self.running.as_ref().map(|running| &running.aggregator)
    }

    /// Request shutdown, as a signal would
    pub fn shutdown(&self) {
        self.shutdown_notify.notify_one();
    }

    /// Wait for a shutdown request, then stop the source and flush once more
    pub async fn wait_for_shutdown(&mut self) -> Result<()> {
        let Some(running) = self.running.take() else {
            bail!("daemon is not running");
        };

        self.shutdown_notify.notified().await;
        info!("shutdown signal received, stopping services...");

        running.source_task.abort();
        let _ = running.source_task.await;

        match running.aggregator.shutdown().await {
            Ok(Some(batch)) => info!(num_stats = batch.num_stats(), "flushed remaining stats"),
            Ok(None) => info!("no remaining stats to flush"),
            Err(err) => warn!(error = %err, "final flush failed"),
        }
        running
            .engine_task
            .await
            .context("aggregation engine panicked")?;

        Ok(())
    }

    fn setup_signal_handlers(&self) {
        let shutdown_notify = Arc::clone(&self.shutdown_notify);

        tokio::spawn(async move {
            match signal::ctrl_c().await {
                Ok(()) => {
                    info!("received SIGINT, initiating shutdown");
                    shutdown_notify.notify_one();
                }
                Err(err) => {
                    warn!(error = %err, "failed to listen for SIGINT");
                }
            }
        });

        #[cfg(unix)]
        {
            let shutdown_notify = Arc::clone(&self.shutdown_notify);
            tokio::spawn(async move {
                let mut sigterm =
                    match signal::unix::signal(signal::unix::SignalKind::terminate()) {
                        Ok(sigterm) => sigterm,
                        Err(err) => {
                            warn!(error = %err, "failed to register SIGTERM handler");
                            return;
                        }
                    };

                sigterm.recv().await;
                info!("received SIGTERM, initiating shutdown");
                shutdown_notify.notify_one();
            });
        }
    }
}
