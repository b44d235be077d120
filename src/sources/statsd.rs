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

//! StatsD UDP source
//!
//! Each received datagram is handed to its own parse task, which submits the
//! resulting packets to the aggregator in order. A semaphore caps the number
//! of parse tasks in flight; while all permits are taken the receive loop
//! stops reading and the socket buffer absorbs (or drops) the excess.

use super::MetricsSource;
use crate::aggregation::AggregatorHandle;
use crate::parser;
use anyhow::{Context, Result};
use async_trait::async_trait;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::UdpSocket;
use tokio::sync::Semaphore;
use tracing::{debug, info, trace, warn};

/// Maximum number of bytes read from a single datagram
pub const MAX_DATAGRAM_SIZE: usize = 512;

/// Listener for the StatsD line protocol over UDP
#[derive(Debug)]
pub struct StatsdSource {
    socket: UdpSocket,
    local_addr: SocketAddr,
    parse_permits: Arc<Semaphore>,
}

impl StatsdSource {
    /// Bind the listening socket.
    ///
    /// Failing to bind is the one unrecoverable error of the pipeline and is
    /// returned to the caller.
    pub async fn bind(address: SocketAddr, parse_workers: usize) -> Result<Self> {
        let socket = UdpSocket::bind(address)
            .await
            .with_context(|| format!("Failed to bind StatsD listener on {}", address))?;
        let local_addr = socket.local_addr()?;
        info!(address = %local_addr, "listening for statsd packets");

        Ok(Self {
            socket,
            local_addr,
            parse_permits: Arc::new(Semaphore::new(parse_workers.max(1))),
        })
    }

    /// Address the socket is actually bound to
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }
}

#[async_trait]
impl MetricsSource for StatsdSource {
    async fn run(&self, aggregator: AggregatorHandle) -> Result<()> {
        loop {
            let mut message = vec![0u8; MAX_DATAGRAM_SIZE];
            let (len, peer) = match self.socket.recv_from(&mut message).await {
                Ok(received) => received,
                Err(err) => {
                    warn!(error = %err, "failed to read datagram");
                    continue;
                }
            };
            message.truncate(len);
            trace!(%peer, payload = %String::from_utf8_lossy(&message), "received datagram");

            let permit = Arc::clone(&self.parse_permits)
                .acquire_owned()
                .await
                .context("parse worker pool closed")?;
            let aggregator = aggregator.clone();

            tokio::spawn(async move {
                let _permit = permit;
                for packet in parser::parse(&message) {
                    if aggregator.submit(packet).await.is_err() {
                        debug!("aggregation engine stopped, dropping remaining samples");
                        break;
                    }
                }
            });
        }
    }

    fn name(&self) -> &str {
        "statsd"
    }
}
