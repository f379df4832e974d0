// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use std::fmt;

use async_trait::async_trait;
use serde_json::json;
use tokio::io::BufWriter;
use tokio_rustls::TlsConnector;
use tracing::debug;

use crate::errors::SinkError;
use crate::protocol::write_message;
use crate::record::LogRecord;
use crate::sink::Sink;
use crate::tls::{connect_stream, BoxedStream};

#[derive(Clone)]
pub struct SocketSinkConfig {
    pub host: String,
    pub port: u16,
    pub tls: Option<TlsConnector>,
    /// Sent as `{"token": ...}` right after connecting.
    pub token: Option<String>,
}

/// Forwards records to another log server using the framed protocol.
pub struct SocketSink {
    config: SocketSinkConfig,
    stream: Option<BufWriter<BoxedStream>>,
}

impl SocketSink {
    pub fn new(config: SocketSinkConfig) -> Self {
        Self {
            config,
            stream: None,
        }
    }
}

impl fmt::Display for SocketSink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "socket {}:{}", self.config.host, self.config.port)
    }
}

#[async_trait]
impl Sink for SocketSink {
    async fn connect(&mut self) -> Result<(), SinkError> {
        let stream =
            connect_stream(&self.config.host, self.config.port, self.config.tls.as_ref()).await?;
        let mut stream = BufWriter::new(stream);

        if let Some(token) = &self.config.token {
            debug!("Authenticating against {}", self);
            write_message(&mut stream, &json!({ "token": token })).await?;
        }

        self.stream = Some(stream);
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.stream.is_some()
    }

    async fn send(&mut self, record: &LogRecord) -> Result<(), SinkError> {
        let stream = self.stream.as_mut().ok_or(SinkError::NotConnected)?;
        write_message(stream, record).await?;
        Ok(())
    }

    fn invalidate(&mut self) {
        self.stream = None;
    }
}
