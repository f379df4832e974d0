// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Mock sinks for testing

use async_trait::async_trait;
use log_proxy::errors::SinkError;
use log_proxy::record::LogRecord;
use log_proxy::sink::Sink;
use std::fmt;
use tokio::sync::mpsc;

/// Sink handing every record to a channel
pub struct ChannelSink {
    connected: bool,
    tx: mpsc::UnboundedSender<LogRecord>,
}

impl ChannelSink {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<LogRecord>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Self {
                connected: false,
                tx,
            },
            rx,
        )
    }
}

impl fmt::Display for ChannelSink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "channel")
    }
}

#[async_trait]
impl Sink for ChannelSink {
    async fn connect(&mut self) -> Result<(), SinkError> {
        self.connected = true;
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected
    }

    async fn send(&mut self, record: &LogRecord) -> Result<(), SinkError> {
        self.tx
            .send(record.clone())
            .map_err(|_| SinkError::NotConnected)
    }

    fn invalidate(&mut self) {
        self.connected = false;
    }
}
