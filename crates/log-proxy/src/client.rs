// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use serde_json::json;
use tokio::io::BufWriter;
use tokio_rustls::TlsConnector;
use tracing::debug;

use crate::errors::EmitError;
use crate::protocol::write_message;
use crate::record::LogRecord;
use crate::tls::{connect_stream, BoxedStream};

/// Sends records straight to a log server from the process that produces them.
///
/// The connection is opened on the first [`LogEmitter::emit`] and reopened after any failure.
pub struct LogEmitter {
    host: String,
    port: u16,
    tls: Option<TlsConnector>,
    token: Option<String>,
    stream: Option<BufWriter<BoxedStream>>,
}

impl LogEmitter {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            tls: None,
            token: None,
            stream: None,
        }
    }

    #[must_use]
    pub fn with_tls(mut self, tls: TlsConnector) -> Self {
        self.tls = Some(tls);
        self
    }

    #[must_use]
    pub fn with_token(mut self, token: impl Into<String>) -> Self {
        self.token = Some(token.into());
        self
    }

    pub fn is_connected(&self) -> bool {
        self.stream.is_some()
    }

    pub async fn emit(&mut self, record: &LogRecord) -> Result<(), EmitError> {
        let result = self.try_emit(record).await;
        if result.is_err() {
            self.stream = None;
        }
        result
    }

    async fn try_emit(&mut self, record: &LogRecord) -> Result<(), EmitError> {
        let stream = match self.stream.take() {
            Some(stream) => stream,
            None => {
                let stream = connect_stream(&self.host, self.port, self.tls.as_ref()).await?;
                let mut stream = BufWriter::new(stream);
                if let Some(token) = &self.token {
                    write_message(&mut stream, &json!({ "token": token })).await?;
                }
                debug!("Connected to {}:{}", self.host, self.port);
                stream
            }
        };

        write_message(self.stream.insert(stream), record).await?;
        Ok(())
    }
}
