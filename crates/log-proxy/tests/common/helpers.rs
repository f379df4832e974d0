// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Helper functions for integration tests

use log_proxy::errors::ServerError;
use log_proxy::protocol::encode;
use log_proxy::record::LogRecord;
use log_proxy::server::{LogServer, LogServerConfig};
use log_proxy::sink::ForwarderHandle;
use serde_json::{json, Value};
use std::net::SocketAddr;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{timeout, Duration};

/// A valid record with the given message
pub fn valid_record(message: &str) -> Value {
    json!({
        "level": 42,
        "pid": 123,
        "message": message,
        "created_at": "2024-01-01T00:00:00",
        "created_by": "me",
    })
}

pub fn server_config(use_auth: bool) -> LogServerConfig {
    LogServerConfig {
        host: "127.0.0.1".to_string(),
        port: 0,
        use_auth,
        ..LogServerConfig::default()
    }
}

/// Starts the server in the background and waits until it listens
pub async fn start_server(
    config: LogServerConfig,
    handle: ForwarderHandle,
) -> (LogServer, JoinHandle<Result<(), ServerError>>, SocketAddr) {
    let server = LogServer::new(config, handle).expect("Failed to create server");
    let task = tokio::spawn({
        let server = server.clone();
        async move { server.run().await }
    });
    let addr = timeout(Duration::from_secs(5), server.local_addr())
        .await
        .expect("Server didn't start in time")
        .expect("Server isn't listening");
    (server, task, addr)
}

/// Connects and writes every message as a frame
pub async fn send_frames(addr: SocketAddr, messages: &[Value]) -> TcpStream {
    let mut stream = TcpStream::connect(addr).await.expect("Failed to connect");
    for message in messages {
        stream
            .write_all(&encode(message).expect("Failed to encode"))
            .await
            .expect("Failed to write");
    }
    stream
}

/// Waits for the next record delivered to a sink
pub async fn next_record(rx: &mut mpsc::UnboundedReceiver<LogRecord>) -> LogRecord {
    timeout(Duration::from_secs(5), rx.recv())
        .await
        .expect("No record received in time")
        .expect("Sink channel closed")
}
