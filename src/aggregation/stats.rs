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

//! Timer reduction statistics

use serde::{Deserialize, Serialize};

/// How the percentile threshold selects the in-threshold subset of a timer
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ThresholdMode {
    /// `((100 - pct) / 100) * count` in integer arithmetic.
    ///
    /// The division truncates to zero for every threshold below 100, so the
    /// whole sample set is in threshold and `upper_<pct>` equals `upper`.
    #[default]
    Truncated,
    /// `round((100 - pct) / 100 * count)` in floating point.
    ///
    /// At least one value is always kept in threshold; `upper_<pct>` is the
    /// largest in-threshold value.
    Fractional,
}

/// Reduced statistics for one timer bucket
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimerSummary {
    pub mean: i64,
    pub upper: i64,
    pub upper_threshold: i64,
    pub lower: i64,
    pub count: usize,
}

impl TimerSummary {
    /// Reduce a set of timer samples.
    ///
    /// `values` is sorted in place. Returns `None` for an empty set.
    pub fn compute(values: &mut [i64], percent_threshold: u8, mode: ThresholdMode) -> Option<Self> {
        values.sort_unstable();

        let lower = *values.first()?;
        let upper = *values.last()?;
        let count = values.len();

        if count == 1 {
            return Some(Self {
                mean: lower,
                upper,
                upper_threshold: upper,
                lower,
                count,
            });
        }

        let out_of_threshold = 100u8.saturating_sub(percent_threshold);
        let threshold_index = match mode {
            ThresholdMode::Truncated => (usize::from(out_of_threshold) / 100) * count,
            ThresholdMode::Fractional => {
                (f64::from(out_of_threshold) / 100.0 * count as f64).round() as usize
            }
        };
        // A zero threshold would leave nothing to average.
        let in_threshold = &values[..count - threshold_index.min(count - 1)];

        let sum: i128 = in_threshold.iter().map(|&v| i128::from(v)).sum();
        let mean = (sum / in_threshold.len() as i128) as i64;

        let upper_threshold = match mode {
            ThresholdMode::Truncated => upper,
            ThresholdMode::Fractional => *in_threshold.last()?,
        };

        Some(Self {
            mean,
            upper,
            upper_threshold,
            lower,
            count,
        })
    }
}
