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

//! Daemon configuration
//!
//! Configuration is an explicit structure handed to constructors at startup.
//! It can be loaded from a JSON file; every field has a default, and the
//! command line may override individual fields afterwards.

use crate::aggregation::stats::ThresholdMode;
use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Address value that disables the graphite sink or the file sink
pub const DISABLED: &str = "-";

/// Main daemon configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase", default)]
pub struct DaemonConfig {
    /// UDP address the StatsD listener binds to; `:port` binds all interfaces
    #[serde(deserialize_with = "deserialize_listen_address")]
    pub listen_address: SocketAddr,

    /// Graphite carbon address, or `-` to disable the graphite sink
    pub graphite_address: String,

    /// File each flush is appended to, or `-` to disable the file sink
    pub output_file: PathBuf,

    /// Time between flushes; whole seconds only are used for rates
    #[serde(with = "duration_serde")]
    pub flush_interval: Duration,

    /// Percentile threshold for timer statistics (0-100)
    pub percent_threshold: u8,

    /// How the percentile threshold selects in-threshold timer values
    pub threshold_mode: ThresholdMode,

    /// Capacity of the aggregator input queue; producers block when it is full
    pub queue_capacity: usize,

    /// Maximum number of datagrams being parsed concurrently
    pub parse_workers: usize,

    /// Upper bound on a single sink send; unbounded when absent
    #[serde(with = "option_duration_serde")]
    pub sink_timeout: Option<Duration>,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            listen_address: SocketAddr::from(([0, 0, 0, 0], 8125)),
            graphite_address: "localhost:2003".to_string(),
            output_file: PathBuf::from("stats.csv"),
            flush_interval: Duration::from_secs(10),
            percent_threshold: 90,
            threshold_mode: ThresholdMode::default(),
            queue_capacity: 10_000,
            parse_workers: 64,
            sink_timeout: None,
        }
    }
}

impl DaemonConfig {
    /// Load configuration from a file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        Self::from_json(&contents)
    }

    /// Parse configuration from JSON string
    pub fn from_json(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json).context("Failed to parse configuration")?;
        config.validate()?;
        Ok(config)
    }

    /// Check value ranges that the type system does not enforce
    pub fn validate(&self) -> Result<()> {
        if self.flush_interval.as_secs() == 0 {
            bail!(
                "flushInterval must be at least one second, got {:?}",
                self.flush_interval
            );
        }
        if self.percent_threshold > 100 {
            bail!(
                "percentThreshold must be between 0 and 100, got {}",
                self.percent_threshold
            );
        }
        if self.queue_capacity == 0 {
            bail!("queueCapacity must be greater than zero");
        }
        if self.parse_workers == 0 {
            bail!("parseWorkers must be greater than zero");
        }
        if self.sink_timeout == Some(Duration::ZERO) {
            bail!("sinkTimeout must be greater than zero when set");
        }
        Ok(())
    }

    /// Graphite address, unless the sink is disabled
    pub fn graphite_target(&self) -> Option<&str> {
        match self.graphite_address.trim() {
            "" | DISABLED => None,
            address => Some(address),
        }
    }

    /// Output file path, unless the sink is disabled
    pub fn output_target(&self) -> Option<&Path> {
        if self.output_file.as_os_str().is_empty() || self.output_file == Path::new(DISABLED) {
            None
        } else {
            Some(&self.output_file)
        }
    }
}

/// Parse a listen address, accepting the `:port` shorthand for all interfaces
pub fn parse_listen_address(address: &str) -> Result<SocketAddr> {
    let address = if address.starts_with(':') {
        format!("0.0.0.0{}", address)
    } else {
        address.to_string()
    };
    address
        .parse()
        .with_context(|| format!("Invalid listen address: {}", address))
}

fn deserialize_listen_address<'de, D>(deserializer: D) -> Result<SocketAddr, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let address = String::deserialize(deserializer)?;
    parse_listen_address(&address).map_err(|e| serde::de::Error::custom(format!("{:#}", e)))
}

// Duration serialization helpers
mod duration_serde {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        // Convert to ISO-8601 duration format (PT1.0S)
        let seconds = duration.as_secs_f64();
        let iso_duration = format!("PT{}S", seconds);
        serializer.serialize_str(&iso_duration)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        parse(&s).map_err(serde::de::Error::custom)
    }

    pub(super) fn parse(s: &str) -> Result<Duration, String> {
        match s.strip_prefix("PT").and_then(|rest| rest.strip_suffix('S')) {
            Some(seconds_str) => {
                let seconds: f64 = seconds_str.parse().map_err(|e| format!("{}", e))?;
                Duration::try_from_secs_f64(seconds).map_err(|e| format!("{}", e))
            }
            None => Err(format!("Invalid duration format: {}", s)),
        }
    }
}

mod option_duration_serde {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Option<Duration>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        match duration {
            Some(duration) => super::duration_serde::serialize(duration, serializer),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<Duration>, D::Error>
    where
        D: Deserializer<'de>,
    {
        Option::<String>::deserialize(deserializer)?
            .map(|s| super::duration_serde::parse(&s).map_err(serde::de::Error::custom))
            .transpose()
    }
}
