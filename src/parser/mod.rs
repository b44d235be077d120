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

//! StatsD line protocol parser
//!
//! Turns the raw payload of one datagram into zero or more [`Packet`]s. The
//! payload is first sanitized down to the characters `[A-Za-z0-9-_.:|@]`, then
//! scanned left to right for samples of the form
//!
//! ```text
//! <bucket>:<value>|<c|ms>[|@<sampling rate>]
//! ```
//!
//! Samples may be concatenated without separators. Fragments that do not form
//! a sample are skipped silently. Numeric fields that cannot be decoded are
//! replaced with defaults instead of dropping the sample: the value becomes
//! [`Modifier::default_value`] and the sampling rate becomes
//! [`DEFAULT_SAMPLING_RATE`].

use crate::model::{Modifier, Packet, DEFAULT_SAMPLING_RATE};

const BUCKET_SEPARATOR: u8 = b':';
const FIELD_SEPARATOR: u8 = b'|';
const RATE_PREFIX: &[u8] = b"|@";

fn is_allowed(byte: u8) -> bool {
    byte.is_ascii_alphanumeric() || matches!(byte, b'-' | b'_' | b'.' | b':' | b'|' | b'@')
}

fn is_bucket_byte(byte: u8) -> bool {
    byte.is_ascii_alphanumeric() || byte == b'_'
}

fn is_value_byte(byte: u8) -> bool {
    byte.is_ascii_alphanumeric() || matches!(byte, b'-' | b'_' | b'.')
}

fn is_rate_byte(byte: u8) -> bool {
    byte.is_ascii_digit() || byte == b'.'
}

/// Strip every byte outside the protocol alphabet.
///
/// The result is pure ASCII.
pub fn sanitize(input: &[u8]) -> String {
    input
        .iter()
        .copied()
        .filter(|&b| is_allowed(b))
        .map(char::from)
        .collect()
}

/// Parse every sample contained in a datagram payload, in order of appearance.
pub fn parse(input: &[u8]) -> Vec<Packet> {
    let sanitized = sanitize(input);
    Scanner::new(&sanitized).collect()
}

/// Left-to-right scanner over sanitized input.
///
/// At each position a single sample is attempted; on failure the scanner
/// resumes at the earliest position that could still start a different
/// match.
struct Scanner<'a> {
    input: &'a str,
    pos: usize,
}

impl<'a> Scanner<'a> {
    fn new(input: &'a str) -> Self {
        Self { input, pos: 0 }
    }

    fn bytes(&self) -> &'a [u8] {
        self.input.as_bytes()
    }

    fn take_while(&self, start: usize, pred: impl Fn(u8) -> bool) -> usize {
        let bytes = self.bytes();
        let mut end = start;
        while end < bytes.len() && pred(bytes[end]) {
            end += 1;
        }
        end
    }

    /// Attempt to match one sample starting at `start`.
    ///
    /// Returns the packet and the position right after it, or the position to
    /// resume scanning from.
    fn match_at(&self, start: usize) -> Result<(Packet, usize), usize> {
        let bytes = self.bytes();

        let bucket_end = self.take_while(start, is_bucket_byte);
        if bucket_end == start {
            return Err(start + 1);
        }
        // Any start inside the same bucket run reaches the same separator and
        // fails the same way, so skip past it.
        let resume = bucket_end;

        if bytes.get(bucket_end) != Some(&BUCKET_SEPARATOR) {
            return Err(resume);
        }

        let value_start = bucket_end + 1;
        let value_end = self.take_while(value_start, is_value_byte);
        if value_end == value_start || bytes.get(value_end) != Some(&FIELD_SEPARATOR) {
            return Err(resume);
        }

        let modifier_start = value_end + 1;
        let rest = &bytes[modifier_start..];
        let (modifier, mut end) = if rest.starts_with(b"ms") {
            (Modifier::Timer, modifier_start + 2)
        } else if rest.starts_with(b"c") {
            (Modifier::Counter, modifier_start + 1)
        } else {
            return Err(resume);
        };

        let mut sampling_rate = DEFAULT_SAMPLING_RATE;
        if bytes[end..].starts_with(RATE_PREFIX) {
            let rate_start = end + RATE_PREFIX.len();
            let rate_end = self.take_while(rate_start, is_rate_byte);
            if rate_end > rate_start {
                sampling_rate = self.input[rate_start..rate_end]
                    .parse()
                    .unwrap_or(DEFAULT_SAMPLING_RATE);
                end = rate_end;
            }
        }

        let value = self.input[value_start..value_end]
            .parse()
            .unwrap_or_else(|_| modifier.default_value());

        match Packet::new(&self.input[start..bucket_end], value, modifier, sampling_rate) {
            Some(packet) => Ok((packet, end)),
            None => Err(resume),
        }
    }
}

impl Iterator for Scanner<'_> {
    type Item = Packet;

    fn next(&mut self) -> Option<Packet> {
        while self.pos < self.input.len() {
            match self.match_at(self.pos) {
                Ok((packet, end)) => {
                    self.pos = end;
                    return Some(packet);
                }
                Err(resume) => self.pos = resume,
            }
        }
        None
    }
}
