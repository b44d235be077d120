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

//! Core data model for metrics aggregation
//!
//! Defines the sample value produced by the protocol parser and consumed by
//! the aggregator.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Sampling rate assumed when a sample carries none (or an invalid one)
pub const DEFAULT_SAMPLING_RATE: f64 = 1.0;

/// Kind of a metric sample
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Modifier {
    /// Cumulative count, corrected by the sampling rate (`c`)
    Counter,
    /// Duration measurement, reduced to percentile statistics (`ms`)
    Timer,
}

impl Modifier {
    /// Wire token for this modifier
    pub fn as_str(&self) -> &'static str {
        match self {
            Modifier::Counter => "c",
            Modifier::Timer => "ms",
        }
    }

    /// Value substituted when the numeric field of a sample cannot be decoded
    pub fn default_value(&self) -> i64 {
        match self {
            Modifier::Counter => 1,
            Modifier::Timer => 0,
        }
    }
}

impl fmt::Display for Modifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One parsed metric sample
///
/// Packets are immutable once built; the only way to construct one is
/// [`Packet::new`], which enforces a non-empty bucket and a sampling rate in
/// `(0, 1]`.
#[derive(Debug, Clone, PartialEq)]
pub struct Packet {
    bucket: String,
    value: i64,
    modifier: Modifier,
    sampling_rate: f64,
}

impl Packet {
    /// Create a new packet.
    ///
    /// A sampling rate outside `(0, 1]` (including NaN) is replaced with
    /// [`DEFAULT_SAMPLING_RATE`]. Returns `None` for an empty bucket name.
    pub fn new(
        bucket: impl Into<String>,
        value: i64,
        modifier: Modifier,
        sampling_rate: f64,
    ) -> Option<Self> {
        let bucket = bucket.into();
        if bucket.is_empty() {
            return None;
        }

        let sampling_rate = if sampling_rate > 0.0 && sampling_rate <= 1.0 {
            sampling_rate
        } else {
            DEFAULT_SAMPLING_RATE
        };

        Some(Self {
            bucket,
            value,
            modifier,
            sampling_rate,
        })
    }

    /// Convenience constructor for an unsampled counter
    pub fn counter(bucket: impl Into<String>, value: i64) -> Option<Self> {
        Self::new(bucket, value, Modifier::Counter, DEFAULT_SAMPLING_RATE)
    }

    /// Convenience constructor for a timer sample
    pub fn timer(bucket: impl Into<String>, value: i64) -> Option<Self> {
        Self::new(bucket, value, Modifier::Timer, DEFAULT_SAMPLING_RATE)
    }

    pub fn bucket(&self) -> &str {
        &self.bucket
    }

    pub fn value(&self) -> i64 {
        self.value
    }

    pub fn modifier(&self) -> Modifier {
        self.modifier
    }

    pub fn sampling_rate(&self) -> f64 {
        self.sampling_rate
    }

    /// Counter contribution after sampling correction.
    ///
    /// `value / sampling_rate`, truncated toward zero and saturated to the
    /// `i64` range.
    pub fn corrected_value(&self) -> i64 {
        (self.value as f64 / self.sampling_rate).trunc() as i64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_packet_rejects_empty_bucket() {
        assert!(Packet::counter("", 1).is_none());
    }

    #[test]
    fn test_invalid_sampling_rate_defaults() {
        for rate in [0.0, -0.5, 1.5, f64::NAN, f64::INFINITY] {
            let packet = Packet::new("foo", 1, Modifier::Counter, rate).unwrap();
            assert_eq!(packet.sampling_rate(), DEFAULT_SAMPLING_RATE, "rate {rate}");
        }

        let packet = Packet::new("foo", 1, Modifier::Counter, 0.25).unwrap();
        assert_eq!(packet.sampling_rate(), 0.25);
    }

    #[test]
    fn test_corrected_value_truncates() {
        let packet = Packet::new("foo", 1, Modifier::Counter, 0.5).unwrap();
        assert_eq!(packet.corrected_value(), 2);

        // 1 / 0.3 = 3.33..
        let packet = Packet::new("foo", 1, Modifier::Counter, 0.3).unwrap();
        assert_eq!(packet.corrected_value(), 3);

        let packet = Packet::new("foo", -5, Modifier::Counter, 0.3).unwrap();
        assert_eq!(packet.corrected_value(), -16);
    }

    #[test]
    fn test_modifier_defaults() {
        assert_eq!(Modifier::Counter.default_value(), 1);
        assert_eq!(Modifier::Timer.default_value(), 0);
        assert_eq!(Modifier::Timer.to_string(), "ms");
    }
}
