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

//! Graphite plaintext protocol sink

use super::{FlushBatch, MetricsSink};
use anyhow::{Context, Result};
use async_trait::async_trait;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tracing::debug;

/// Writes each flush to a Graphite carbon endpoint over a fresh TCP connection
#[derive(Debug, Clone)]
pub struct GraphiteSink {
    address: String,
}

impl GraphiteSink {
    pub fn new(address: impl Into<String>) -> Self {
        Self {
            address: address.into(),
        }
    }

    pub fn address(&self) -> &str {
        &self.address
    }
}

#[async_trait]
impl MetricsSink for GraphiteSink {
    async fn send(&self, batch: &FlushBatch) -> Result<()> {
        let mut stream = TcpStream::connect(&self.address)
            .await
            .with_context(|| format!("Failed to connect to graphite at {}", self.address))?;

        stream
            .write_all(batch.as_bytes())
            .await
            .with_context(|| format!("Failed to write to graphite at {}", self.address))?;
        stream.shutdown().await.ok();

        debug!(address = %self.address, bytes = batch.as_bytes().len(), "wrote flush to graphite");
        Ok(())
    }

    fn name(&self) -> &str {
        "graphite"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sinks::FlushBatchBuilder;
    use tokio::io::AsyncReadExt;
    use tokio::net::TcpListener;

    fn batch() -> FlushBatch {
        let mut builder = FlushBatchBuilder::new(10);
        builder.line(format_args!("stats_counts.foo"), 3);
        builder.stat();
        builder.finish().unwrap()
    }

    #[tokio::test]
    async fn test_send_writes_lines() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let sink = GraphiteSink::new(listener.local_addr().unwrap().to_string());

        let accept = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut received = String::new();
            socket.read_to_string(&mut received).await.unwrap();
            received
        });

        sink.send(&batch()).await.unwrap();
        let received = accept.await.unwrap();

        assert_eq!(received, "stats_counts.foo 3 10\nstatsd.numStats 1 10\n");
    }

    #[tokio::test]
    async fn test_dial_failure_is_an_error() {
        // Bind then drop to get a port with nothing listening.
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap().to_string();
        drop(listener);

        let sink = GraphiteSink::new(address);
        assert!(sink.send(&batch()).await.is_err());
    }
}
