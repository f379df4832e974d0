// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

mod common;

use common::helpers::{next_record, send_frames, server_config, start_server, valid_record};
use common::mocks::ChannelSink;
use log_proxy::record::LogRecord;
use log_proxy::server::LogServerConfig;
use log_proxy::sink::{Forwarder, SocketSink, SocketSinkConfig};
use serde_json::{json, Map};
use std::io::{ErrorKind, Write};
use tempfile::NamedTempFile;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::{sleep, timeout, Duration};
use tokio_util::sync::CancellationToken;

#[tokio::test]
async fn forwards_records_unchanged_without_auth() {
    let (sink, mut rx) = ChannelSink::new();
    let (forwarder, handle) = Forwarder::new(sink, 0);
    let cancel = CancellationToken::new();
    tokio::spawn(forwarder.run(cancel.clone()));

    let (server, task, addr) = start_server(server_config(false), handle).await;

    let message = valid_record("hello");
    let _client = send_frames(addr, &[message.clone()]).await;

    let record = next_record(&mut rx).await;
    assert_eq!(record.into_value(), message);

    server.stop().await;
    task.await.unwrap().unwrap();
    cancel.cancel();
}

#[tokio::test]
async fn enriches_host_with_client_name() {
    let (sink, mut rx) = ChannelSink::new();
    let (forwarder, handle) = Forwarder::new(sink, 0);
    let cancel = CancellationToken::new();
    tokio::spawn(forwarder.run(cancel.clone()));

    let (server, task, addr) = start_server(server_config(true), handle).await;
    let metadata = json!({"name": "svc"}).as_object().cloned().unwrap();
    server.add_token("abc", metadata).unwrap();

    let mut remote = valid_record("with host");
    remote["host"] = json!("rem");
    let _client = send_frames(
        addr,
        &[json!({"token": "abc"}), valid_record("no host"), remote],
    )
    .await;

    let first = next_record(&mut rx).await;
    assert_eq!(first.str_field("message"), Some("no host"));
    assert_eq!(first.str_field("host"), Some("svc"));

    let second = next_record(&mut rx).await;
    assert_eq!(second.str_field("message"), Some("with host"));
    assert_eq!(second.str_field("host"), Some("rem"));

    server.stop().await;
    task.await.unwrap().unwrap();
    cancel.cancel();
}

#[tokio::test]
async fn invalid_first_message_closes_connection() {
    let (sink, _rx) = ChannelSink::new();
    let (_forwarder, handle) = Forwarder::new(sink, 0);
    let (server, task, addr) = start_server(server_config(true), handle.clone()).await;
    server.add_token("abc", Map::new()).unwrap();

    let mut client = send_frames(addr, &[valid_record("not a token")]).await;

    // The server closes the connection, so writing eventually fails
    let frame = log_proxy::protocol::encode(&valid_record("after")).unwrap();
    let error = timeout(Duration::from_secs(5), async {
        loop {
            if let Err(e) = client.write_all(&frame).await {
                return e;
            }
            sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .expect("Write never failed");
    assert!(matches!(
        error.kind(),
        ErrorKind::ConnectionReset | ErrorKind::BrokenPipe
    ));
    assert!(handle.empty());

    server.stop().await;
    task.await.unwrap().unwrap();
}

#[tokio::test]
async fn full_buffer_keeps_newest_records() {
    let (sink, mut rx) = ChannelSink::new();
    let (forwarder, handle) = Forwarder::new(sink, 2);
    let (server, task, addr) = start_server(server_config(false), handle.clone()).await;

    let mut records = Vec::new();
    for (i, message) in ["first", "second", "third"].into_iter().enumerate() {
        let mut record = valid_record(message);
        record["created_at"] = json!(format!("2024-01-01T00:00:0{i}"));
        records.push(record);
    }
    let _client = send_frames(addr, &records).await;

    timeout(Duration::from_secs(5), async {
        while handle.queue().dropped() < 1 {
            sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("Records never arrived");

    // The sink only starts draining now
    let cancel = CancellationToken::new();
    tokio::spawn(forwarder.run(cancel.clone()));

    assert_eq!(next_record(&mut rx).await.str_field("message"), Some("second"));
    assert_eq!(next_record(&mut rx).await.str_field("message"), Some("third"));
    assert!(handle.empty());

    server.stop().await;
    task.await.unwrap().unwrap();
    cancel.cancel();
}

#[tokio::test]
async fn token_file_authenticates_clients() {
    let mut file = NamedTempFile::new().unwrap();
    write!(file, r#"{{"filetoken": {{"name": "from-file"}}}}"#).unwrap();

    let (sink, mut rx) = ChannelSink::new();
    let (forwarder, handle) = Forwarder::new(sink, 0);
    let cancel = CancellationToken::new();
    tokio::spawn(forwarder.run(cancel.clone()));

    let config = LogServerConfig {
        token_file: Some(file.path().to_path_buf()),
        ..server_config(true)
    };
    let (server, task, addr) = start_server(config, handle).await;
    assert!(server.add_token("other", Map::new()).is_err());

    let _client = send_frames(
        addr,
        &[json!({"token": "filetoken"}), valid_record("hello")],
    )
    .await;
    assert_eq!(next_record(&mut rx).await.str_field("host"), Some("from-file"));

    server.stop().await;
    task.await.unwrap().unwrap();
    cancel.cancel();
}

#[tokio::test]
async fn chained_servers_forward_through_socket_sink() {
    // Downstream server collecting records
    let (sink, mut rx) = ChannelSink::new();
    let (forwarder, downstream_handle) = Forwarder::new(sink, 0);
    let cancel = CancellationToken::new();
    tokio::spawn(forwarder.run(cancel.clone()));
    let (downstream, downstream_task, downstream_addr) =
        start_server(server_config(true), downstream_handle).await;
    downstream
        .add_token("relay", json!({"name": "edge"}).as_object().cloned().unwrap())
        .unwrap();

    // Upstream server forwarding into the downstream one
    let socket = SocketSink::new(SocketSinkConfig {
        host: "127.0.0.1".to_string(),
        port: downstream_addr.port(),
        tls: None,
        token: Some("relay".to_string()),
    });
    let (forwarder, upstream_handle) = Forwarder::new(socket, 0);
    tokio::spawn(forwarder.run(cancel.clone()));
    let (upstream, upstream_task, upstream_addr) =
        start_server(server_config(false), upstream_handle).await;

    let _client = send_frames(upstream_addr, &[valid_record("relayed")]).await;

    let record: LogRecord = next_record(&mut rx).await;
    assert_eq!(record.str_field("message"), Some("relayed"));
    assert_eq!(record.str_field("host"), Some("edge"));

    upstream.stop().await;
    downstream.stop().await;
    upstream_task.await.unwrap().unwrap();
    downstream_task.await.unwrap().unwrap();
    cancel.cancel();
}

#[tokio::test]
async fn stop_lets_frame_in_flight_complete() {
    let (sink, mut rx) = ChannelSink::new();
    let (forwarder, handle) = Forwarder::new(sink, 0);
    let cancel = CancellationToken::new();
    tokio::spawn(forwarder.run(cancel.clone()));

    let (server, task, addr) = start_server(server_config(false), handle).await;

    let frame = log_proxy::protocol::encode(&valid_record("in flight")).unwrap();
    let (head, tail) = frame.split_at(10);
    let mut client = TcpStream::connect(addr).await.unwrap();
    client.write_all(head).await.unwrap();
    // Give the server time to start reading the frame
    sleep(Duration::from_millis(100)).await;

    server.stop().await;
    task.await.unwrap().unwrap();

    client.write_all(tail).await.unwrap();
    let record = next_record(&mut rx).await;
    assert_eq!(record.str_field("message"), Some("in flight"));

    // The connection is closed right after the frame
    let mut buf = [0u8; 1];
    let read = timeout(Duration::from_secs(5), client.read(&mut buf))
        .await
        .expect("Connection wasn't closed");
    assert!(matches!(read, Ok(0) | Err(_)));

    cancel.cancel();
}
