// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

#![cfg_attr(not(test), deny(clippy::panic))]
#![cfg_attr(not(test), deny(clippy::unwrap_used))]
#![cfg_attr(not(test), deny(clippy::expect_used))]
#![cfg_attr(not(test), deny(clippy::todo))]
#![cfg_attr(not(test), deny(clippy::unimplemented))]

mod config;

use std::path::PathBuf;

use anyhow::{bail, Context};
use clap::Parser;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio::time::{sleep, timeout, Duration};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

use log_proxy::layer::ForwardingLayer;
use log_proxy::server::{LogServer, LogServerConfig};
use log_proxy::sink::{
    Forwarder, ForwarderHandle, MongoSink, MongoSinkConfig, PostgresSink, PostgresSinkConfig,
    SocketSink, SocketSinkConfig,
};
use log_proxy::tls::{client_tls_connector, server_tls_acceptor};
use log_proxy::watcher::{FileWatcher, WatcherConfig};

use config::{Cli, Command, LogLevel, Settings, SinkCommand};

/// How long the client keeps draining its buffer once its inputs are exhausted.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(5);
const WATCH_CHANNEL_SIZE: usize = 1024;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let settings = Settings::load(&cli)?;

    match cli.command {
        Command::Server(sink) => run_server(sink, settings).await,
        Command::Client(_) => run_client(settings).await,
    }
}

fn init_logging(level: LogLevel, forwarding: Option<ForwardingLayer>) -> anyhow::Result<()> {
    let env_filter = format!("tokio_postgres=warn,mongodb=warn,rustls=warn,{}", level.as_str());

    let fmt_layer = tracing_subscriber::fmt::layer()
        .with_level(true)
        .with_thread_names(false)
        .with_thread_ids(false)
        .with_line_number(false)
        .with_file(false)
        .with_target(true);

    tracing_subscriber::registry()
        .with(EnvFilter::try_new(env_filter).context("could not parse log level")?)
        .with(fmt_layer)
        .with(forwarding)
        .try_init()
        .context("setting default subscriber failed")?;

    debug!("Logging subsystem enabled");
    Ok(())
}

fn socket_sink(settings: &Settings) -> anyhow::Result<SocketSink> {
    let (host, port) = settings.forward_address()?;
    let tls = if settings.forward_tls() {
        Some(client_tls_connector(
            settings.forward_ca.as_deref(),
            settings.forward_cert.as_deref(),
            settings.forward_key.as_deref(),
        )?)
    } else {
        None
    };

    Ok(SocketSink::new(SocketSinkConfig {
        host,
        port,
        tls,
        token: settings.forward_token.clone(),
    }))
}

fn postgres_sink(settings: &Settings) -> anyhow::Result<PostgresSink> {
    let dbname = settings
        .db
        .clone()
        .ok_or(config::ConfigError::Missing("db"))?;

    Ok(PostgresSink::new(PostgresSinkConfig {
        host: settings.db_host.clone(),
        port: settings.db_port,
        user: settings.db_user.clone(),
        password: settings.db_password.clone(),
        dbname,
        table: settings.db_table.clone(),
    })?)
}

fn mongo_sink(settings: &Settings) -> anyhow::Result<MongoSink> {
    let dbname = settings
        .db
        .clone()
        .ok_or(config::ConfigError::Missing("db"))?;

    Ok(MongoSink::new(MongoSinkConfig {
        host: settings.db_host.clone(),
        port: settings.db_port,
        user: settings.db_user.clone(),
        password: settings.db_password.clone(),
        collection: settings.db_table.clone(),
        ..MongoSinkConfig::new(dbname)
    })?)
}

async fn run_server(sink: SinkCommand, settings: Settings) -> anyhow::Result<()> {
    init_logging(settings.log_level, None)?;

    let (host, port) = settings.listen_address()?;
    let tls = match (&settings.cert, &settings.key) {
        (Some(cert), Some(key)) => Some(server_tls_acceptor(cert, key, settings.ca.as_deref())?),
        (None, None) => None,
        _ => bail!("--cert and --key must be used together"),
    };

    let (forwarder, handle) = match sink {
        SinkCommand::Socket { .. } => Forwarder::new(socket_sink(&settings)?, settings.max_size),
        SinkCommand::Postgres { .. } => {
            Forwarder::new(postgres_sink(&settings)?, settings.max_size)
        }
        SinkCommand::Mongodb { .. } => Forwarder::new(mongo_sink(&settings)?, settings.max_size),
    };

    let use_auth = !settings.no_auth;
    if use_auth && settings.token_file.is_none() {
        warn!("Authentication is enabled without a token file, every client will be rejected");
    }

    let server = LogServer::new(
        LogServerConfig {
            host,
            port,
            tls,
            token_file: settings.token_file.clone(),
            use_auth,
        },
        handle,
    )?;

    let cancel = CancellationToken::new();
    let forwarder_task = tokio::spawn(forwarder.run(cancel.clone()));
    let mut server_task = tokio::spawn({
        let server = server.clone();
        async move { server.run().await }
    });

    tokio::select! {
        result = &mut server_task => {
            cancel.cancel();
            result??;
        }
        result = tokio::signal::ctrl_c() => {
            result.context("failed to listen for shutdown signal")?;
            info!("Shutting down");
            server.stop().await;
            server_task.await??;
        }
    }

    cancel.cancel();
    forwarder_task.await?;
    Ok(())
}

async fn run_client(settings: Settings) -> anyhow::Result<()> {
    let (forwarder, handle) = Forwarder::new(socket_sink(&settings)?, settings.max_size);
    init_logging(
        settings.log_level,
        Some(ForwardingLayer::new(handle.clone()).with_skipped_target("rustls")),
    )?;

    let cancel = CancellationToken::new();
    let forwarder_task = tokio::spawn(forwarder.run(cancel.clone()));
    let mut inputs = JoinSet::new();

    if settings.log_stdin {
        inputs.spawn(forward_stdin(cancel.clone()));
    }

    if let Some(root) = &settings.watch {
        let (tx, rx) = mpsc::channel(WATCH_CHANNEL_SIZE);
        let watcher = FileWatcher::new(
            WatcherConfig {
                patterns: settings.watch_pattern.clone(),
                ignore: settings.watch_ignore.clone(),
                case_sensitive: !settings.watch_case_insensitive,
                ..WatcherConfig::new(root)
            },
            tx,
        )
        .await
        .context("invalid watch pattern")?;

        inputs.spawn(watcher.run(cancel.clone()));
        inputs.spawn(forward_watched_lines(rx));
        info!("Watching {}", root.display());
    }

    // Without inputs only the process' own logs are shipped, until interrupted
    let interrupted = tokio::select! {
        result = tokio::signal::ctrl_c() => {
            result.context("failed to listen for shutdown signal")?;
            true
        }
        () = async { while inputs.join_next().await.is_some() {} }, if !inputs.is_empty() => false,
    };

    if interrupted {
        info!("Shutting down");
    } else {
        debug!("All inputs are exhausted");
        drain(&handle).await;
    }

    cancel.cancel();
    inputs.shutdown().await;
    forwarder_task.await?;
    Ok(())
}

async fn forward_stdin(cancel: CancellationToken) {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        let line = tokio::select! {
            () = cancel.cancelled() => break,
            line = lines.next_line() => line,
        };

        match line {
            Ok(Some(line)) => {
                let line = line.trim();
                if !line.is_empty() {
                    info!(target: "stdin", "{}", line);
                }
            }
            Ok(None) => break,
            Err(e) => {
                warn!("Failed to read stdin: {}", e);
                break;
            }
        }
    }
}

async fn forward_watched_lines(mut rx: mpsc::Receiver<(PathBuf, String)>) {
    while let Some((path, line)) = rx.recv().await {
        info!(target: "watch", "{}: {}", path.display(), line);
    }
}

/// Waits until the buffer is empty or [`DRAIN_TIMEOUT`] expired.
async fn drain(handle: &ForwarderHandle) {
    let drained = timeout(DRAIN_TIMEOUT, async {
        while !handle.empty() {
            sleep(Duration::from_millis(50)).await;
        }
    })
    .await;

    if drained.is_err() {
        warn!("{} records weren't forwarded", handle.len());
    }
}
