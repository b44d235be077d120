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

use anyhow::Result;
use clap::Parser;
use statsdaemon::aggregation::stats::ThresholdMode;
use statsdaemon::config::{self, DaemonConfig};
use statsdaemon::StatsDaemon;
use std::path::PathBuf;
use std::time::Duration;
use tracing::{info, Level};

/// StatsD-compatible aggregation daemon writing Graphite plaintext output.
#[derive(Debug, Parser)]
#[command(name = "statsdaemon", version, about)]
struct Cli {
    /// JSON configuration file; command line flags override its values.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// UDP service address, e.g. `:8125` or `127.0.0.1:8125`.
    #[arg(long)]
    address: Option<String>,

    /// Graphite service address (or `-` to disable).
    #[arg(long)]
    graphite: Option<String>,

    /// Data file to append stats to (or `-` to disable).
    #[arg(long)]
    output_file: Option<PathBuf>,

    /// Flush interval in seconds.
    #[arg(long)]
    flush_interval: Option<u64>,

    /// Threshold percent for timer statistics.
    #[arg(long)]
    percent_threshold: Option<u8>,

    /// How the threshold selects timer values: `truncated` or `fractional`.
    #[arg(long, value_parser = parse_threshold_mode)]
    threshold_mode: Option<ThresholdMode>,

    /// Capacity of the aggregator input queue.
    #[arg(long)]
    queue_capacity: Option<usize>,

    /// Maximum number of datagrams parsed concurrently.
    #[arg(long)]
    parse_workers: Option<usize>,

    /// Logging verbosity (trace, debug, info, warn, error).
    #[arg(long, default_value = "info")]
    log_level: Level,
}

fn parse_threshold_mode(value: &str) -> Result<ThresholdMode, String> {
    match value {
        "truncated" => Ok(ThresholdMode::Truncated),
        "fractional" => Ok(ThresholdMode::Fractional),
        other => Err(format!(
            "unknown threshold mode `{}`, expected `truncated` or `fractional`",
            other
        )),
    }
}

impl Cli {
    fn into_config(self) -> Result<DaemonConfig> {
        let mut config = match &self.config {
            Some(path) => DaemonConfig::from_file(path)?,
            None => DaemonConfig::default(),
        };

        if let Some(address) = &self.address {
            config.listen_address = config::parse_listen_address(address)?;
        }
        if let Some(graphite) = self.graphite {
            config.graphite_address = graphite;
        }
        if let Some(output_file) = self.output_file {
            config.output_file = output_file;
        }
        if let Some(seconds) = self.flush_interval {
            config.flush_interval = Duration::from_secs(seconds);
        }
        if let Some(percent) = self.percent_threshold {
            config.percent_threshold = percent;
        }
        if let Some(mode) = self.threshold_mode {
            config.threshold_mode = mode;
        }
        if let Some(capacity) = self.queue_capacity {
            config.queue_capacity = capacity;
        }
        if let Some(workers) = self.parse_workers {
            config.parse_workers = workers;
        }

        config.validate()?;
        Ok(config)
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize tracing
    tracing_subscriber::fmt()
        .with_max_level(cli.log_level)
        .with_target(false)
        .init();

    let config = cli.into_config()?;
    info!(listen = %config.listen_address, "configuration loaded");

    let mut daemon = StatsDaemon::new(config)?;
    daemon.start().await?;

    daemon.wait_for_shutdown().await?;
    info!("shutdown complete");

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config_from(args: &[&str]) -> Result<DaemonConfig> {
        let mut argv = vec!["statsdaemon"];
        argv.extend_from_slice(args);
        Cli::try_parse_from(argv)?.into_config()
    }

    #[test]
    fn test_address_override() {
        let config = config_from(&["--address", ":9000"]).unwrap();
        assert_eq!(config.listen_address, "0.0.0.0:9000".parse().unwrap());

        let config = config_from(&["--address", "127.0.0.1:9001"]).unwrap();
        assert_eq!(config.listen_address, "127.0.0.1:9001".parse().unwrap());

        assert!(config_from(&["--address", "nowhere"]).is_err());
    }

    #[test]
    fn test_disable_sinks_from_command_line() {
        let config = config_from(&["--graphite", "-", "--output-file", "-"]).unwrap();
        assert_eq!(config.graphite_target(), None);
        assert_eq!(config.output_target(), None);
    }

    #[test]
    fn test_overrides_are_validated() {
        assert!(config_from(&["--percent-threshold", "150"]).is_err());
        assert!(config_from(&["--flush-interval", "0"]).is_err());
        assert!(config_from(&["--parse-workers", "0"]).is_err());
    }

    #[test]
    fn test_overrides_apply_on_top_of_config_file() {
        let file = tempfile::NamedTempFile::new().unwrap();
        std::fs::write(
            file.path(),
            r#"{"percentThreshold": 75, "graphiteAddress": "carbon:2003", "flushInterval": "PT30S"}"#,
        )
        .unwrap();
        let path = file.path().to_str().unwrap();

        let config = config_from(&[
            "--config",
            path,
            "--flush-interval",
            "5",
            "--threshold-mode",
            "fractional",
        ])
        .unwrap();
        assert_eq!(config.percent_threshold, 75);
        assert_eq!(config.graphite_target(), Some("carbon:2003"));
        assert_eq!(config.flush_interval, Duration::from_secs(5));
        assert_eq!(config.threshold_mode, ThresholdMode::Fractional);

        assert!(config_from(&["--threshold-mode", "rounded"]).is_err());
    }
}
