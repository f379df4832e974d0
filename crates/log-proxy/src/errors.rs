// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use std::path::PathBuf;

/// Errors raised by the token store.
#[derive(Debug, thiserror::Error)]
pub enum TokenStoreError {
    /// The store is backed by a file, which is the single source of truth.
    #[error("Token file is used, tokens can't be managed at runtime")]
    FileBacked,

    #[error("Failed to read token file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse token file {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

/// Errors raised by a sink while connecting to or writing to its endpoint.
#[derive(Debug, thiserror::Error)]
pub enum SinkError {
    #[error("Sink is not connected")]
    NotConnected,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to encode record: {0}")]
    Encode(#[from] serde_json::Error),

    #[error("Database error: {0}")]
    Postgres(#[from] tokio_postgres::Error),

    #[error("MongoDB error: {0}")]
    Mongo(#[from] mongodb::error::Error),

    #[error("Record can't be stored: {0}")]
    InvalidRecord(String),

    #[error("Invalid table name: {0}")]
    InvalidTable(String),
}

impl SinkError {
    /// Whether the error is caused by the record alone, leaving the connection usable.
    pub fn is_record_error(&self) -> bool {
        matches!(self, Self::InvalidRecord(_))
    }
}

/// Errors raised by the log server outside of a single connection.
#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    #[error("Failed to bind {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Server is already running")]
    AlreadyRunning,

    #[error("Server stopped before it was listening")]
    NotListening,
}

/// Errors raised by the client side emitter.
#[derive(Debug, thiserror::Error)]
pub enum EmitError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to encode record: {0}")]
    Encode(#[from] crate::protocol::EncodeError),
}

/// Errors raised while building TLS contexts.
#[derive(Debug, thiserror::Error)]
pub enum TlsError {
    #[error("Failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("No certificate found in {0}")]
    NoCertificate(PathBuf),

    #[error("No private key found in {0}")]
    NoPrivateKey(PathBuf),

    #[error("A private key is required for the certificate")]
    MissingKey,

    #[error("No usable root certificates")]
    NoRootCertificates,

    #[error("TLS configuration error: {0}")]
    Rustls(#[from] rustls::Error),

    #[error("Client verifier error: {0}")]
    Verifier(#[from] rustls::server::VerifierBuilderError),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        assert_eq!(
            TokenStoreError::FileBacked.to_string(),
            "Token file is used, tokens can't be managed at runtime"
        );
        assert_eq!(SinkError::NotConnected.to_string(), "Sink is not connected");

        let error = ServerError::Bind {
            addr: "127.0.0.1:1".to_string(),
            source: std::io::Error::from(std::io::ErrorKind::AddrInUse),
        };
        assert!(error.to_string().starts_with("Failed to bind 127.0.0.1:1"));
    }

    #[test]
    fn test_record_errors() {
        assert!(SinkError::InvalidRecord("pid".to_string()).is_record_error());
        assert!(!SinkError::NotConnected.is_record_error());
        assert!(!SinkError::from(std::io::Error::from(std::io::ErrorKind::BrokenPipe)).is_record_error());
    }

    #[test]
    fn test_io_conversion() {
        let error: SinkError = std::io::Error::from(std::io::ErrorKind::ConnectionReset).into();
        assert!(matches!(error, SinkError::Io(_)));
    }
}
