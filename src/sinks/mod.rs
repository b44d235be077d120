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

//! Metric sinks for outputting flushed data to various destinations
//!
//! Every sink receives the same serialized [`FlushBatch`] once per flush. A
//! sink acquires its destination (connection, file handle) per send, so a
//! failure only affects the current flush.

use anyhow::Result;
use async_trait::async_trait;
use std::fmt::{self, Write};

pub mod file;
pub mod graphite;

pub use file::FileSink;
pub use graphite::GraphiteSink;

/// Trait for all metric sinks
#[async_trait]
pub trait MetricsSink: Send + Sync {
    /// Write one flush worth of output lines to this sink
    async fn send(&self, batch: &FlushBatch) -> Result<()>;

    /// Get the name of this sink
    fn name(&self) -> &str;
}

/// Output of one flush cycle in the plaintext line protocol
///
/// Each line is `<metric-path> <value> <unix-timestamp>\n`. The buffer always
/// ends with the `statsd.numStats` line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FlushBatch {
    timestamp: i64,
    num_stats: usize,
    payload: String,
}

impl FlushBatch {
    /// Unix timestamp (seconds) stamped on every line
    pub fn timestamp(&self) -> i64 {
        self.timestamp
    }

    /// Number of buckets that produced output
    pub fn num_stats(&self) -> usize {
        self.num_stats
    }

    pub fn as_str(&self) -> &str {
        &self.payload
    }

    pub fn as_bytes(&self) -> &[u8] {
        self.payload.as_bytes()
    }

    /// Iterate over the lines of the batch, without their terminators
    pub fn lines(&self) -> impl Iterator<Item = &str> {
        self.payload.lines()
    }
}

/// Incremental builder for a [`FlushBatch`]
#[derive(Debug)]
pub(crate) struct FlushBatchBuilder {
    timestamp: i64,
    num_stats: usize,
    payload: String,
}

impl FlushBatchBuilder {
    pub(crate) fn new(timestamp: i64) -> Self {
        Self {
            timestamp,
            num_stats: 0,
            payload: String::new(),
        }
    }

    /// Append one `<path> <value> <timestamp>` line
    pub(crate) fn line(&mut self, path: fmt::Arguments<'_>, value: impl fmt::Display) {
        // Writing into a String cannot fail.
        let _ = writeln!(self.payload, "{} {} {}", path, value, self.timestamp);
    }

    /// Count one bucket as emitted
    pub(crate) fn stat(&mut self) {
        self.num_stats += 1;
    }

    /// Finish the batch, appending `statsd.numStats`.
    ///
    /// Returns `None` when no bucket produced output.
    pub(crate) fn finish(mut self) -> Option<FlushBatch> {
        if self.num_stats == 0 {
            return None;
        }
        let num_stats = self.num_stats;
        self.line(format_args!("statsd.numStats"), num_stats);

        Some(FlushBatch {
            timestamp: self.timestamp,
            num_stats,
            payload: self.payload,
        })
    }
}
