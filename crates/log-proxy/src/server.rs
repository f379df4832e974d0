// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! TCP server receiving framed log records.
//!
//! Each connection optionally authenticates with a token as its first frame and then streams
//! records. Valid records are tagged with the client's display name and handed to the sink's
//! queue; everything else is dropped without answering the client.

use std::io;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use serde_json::{Map, Value};
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio::task::JoinSet;
use tokio_rustls::TlsAcceptor;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::errors::{ServerError, TokenStoreError};
use crate::protocol::{read_frame_start, read_message_from};
use crate::record::LogRecord;
use crate::sink::ForwarderHandle;
use crate::tokens::TokenStore;

pub const DEFAULT_PORT: u16 = 2773;

/// Pause after an accept error that isn't tied to a single connection.
const ACCEPT_ERROR_DELAY: Duration = Duration::from_millis(100);

#[derive(Clone)]
pub struct LogServerConfig {
    pub host: String,
    pub port: u16,
    pub tls: Option<TlsAcceptor>,
    /// JSON file with the accepted tokens. Without it tokens are managed at runtime.
    pub token_file: Option<PathBuf>,
    pub use_auth: bool,
}

impl Default for LogServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: DEFAULT_PORT,
            tls: None,
            token_file: None,
            use_auth: true,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ServerState {
    Idle,
    Binding,
    Listening(SocketAddr),
    /// Binding the listener failed. `run` may be called again.
    Failed,
    Stopped,
}

struct Inner {
    host: String,
    port: u16,
    tls: Option<TlsAcceptor>,
    use_auth: bool,
    tokens: TokenStore,
    forwarder: ForwarderHandle,
    cancel: CancellationToken,
    state: watch::Sender<ServerState>,
}

/// Cloneable handle to a log server. All clones control the same listener.
#[derive(Clone)]
pub struct LogServer {
    inner: Arc<Inner>,
}

impl LogServer {
    pub fn new(config: LogServerConfig, forwarder: ForwarderHandle) -> Result<Self, TokenStoreError> {
        let tokens = match config.token_file {
            Some(path) => TokenStore::from_file(path)?,
            None => TokenStore::in_memory(),
        };
        let (state, _) = watch::channel(ServerState::Idle);

        Ok(Self {
            inner: Arc::new(Inner {
                host: config.host,
                port: config.port,
                tls: config.tls,
                use_auth: config.use_auth,
                tokens,
                forwarder,
                cancel: CancellationToken::new(),
                state,
            }),
        })
    }

    /// Binds the listener and accepts connections until [`LogServer::stop`] is called.
    pub async fn run(&self) -> Result<(), ServerError> {
        let inner = &self.inner;
        let mut claimed = false;
        inner.state.send_if_modified(|state| {
            claimed = matches!(state, ServerState::Idle | ServerState::Failed);
            if claimed {
                *state = ServerState::Binding;
            }
            claimed
        });
        if !claimed {
            return Err(ServerError::AlreadyRunning);
        }

        let listener = match TcpListener::bind((inner.host.as_str(), inner.port)).await {
            Ok(listener) => listener,
            Err(source) => {
                inner.state.send_replace(ServerState::Failed);
                return Err(ServerError::Bind {
                    addr: format!("{}:{}", inner.host, inner.port),
                    source,
                });
            }
        };
        let addr = match listener.local_addr() {
            Ok(addr) => addr,
            Err(source) => {
                inner.state.send_replace(ServerState::Failed);
                return Err(ServerError::Bind {
                    addr: format!("{}:{}", inner.host, inner.port),
                    source,
                });
            }
        };
        inner.state.send_replace(ServerState::Listening(addr));
        info!("Log server listening on {}", addr);

        let mut connections = JoinSet::new();
        loop {
            let (stream, peer) = tokio::select! {
                biased;
                () = inner.cancel.cancelled() => break,
                accepted = listener.accept() => match accepted {
                    Ok(accepted) => accepted,
                    Err(e)
                        if matches!(
                            e.kind(),
                            io::ErrorKind::ConnectionAborted
                                | io::ErrorKind::ConnectionReset
                                | io::ErrorKind::ConnectionRefused
                        ) =>
                    {
                        continue;
                    }
                    Err(e) => {
                        error!("Failed to accept connection: {}", e);
                        tokio::time::sleep(ACCEPT_ERROR_DELAY).await;
                        continue;
                    }
                },
                Some(finished) = connections.join_next() => {
                    if let Err(e) = finished {
                        if e.is_panic() {
                            error!("Connection handler panicked: {:?}", e);
                        }
                    }
                    continue;
                }
            };

            debug!("Accepted connection from {}", peer);
            connections.spawn(Arc::clone(inner).handle_connection(stream, peer));
        }

        drop(listener);
        // Remaining connections stop on their own at the next frame boundary
        connections.detach_all();
        inner.state.send_replace(ServerState::Stopped);
        info!("Log server stopped");
        Ok(())
    }

    /// Stops accepting connections and waits until the listener is closed.
    pub async fn stop(&self) {
        self.inner.cancel.cancel();
        let mut state = self.inner.state.subscribe();
        let _ = state
            .wait_for(|state| {
                matches!(
                    state,
                    ServerState::Idle | ServerState::Failed | ServerState::Stopped
                )
            })
            .await;
    }

    /// Waits until the listener is bound and returns its address. Fails once binding failed or
    /// the server stopped.
    pub async fn local_addr(&self) -> Result<SocketAddr, ServerError> {
        let mut state = self.inner.state.subscribe();
        let state = state
            .wait_for(|state| {
                matches!(
                    state,
                    ServerState::Listening(_) | ServerState::Failed | ServerState::Stopped
                )
            })
            .await
            .map(|state| *state);
        match state {
            Ok(ServerState::Listening(addr)) => Ok(addr),
            _ => Err(ServerError::NotListening),
        }
    }

    pub fn add_token(
        &self,
        token: impl Into<String>,
        metadata: Map<String, Value>,
    ) -> Result<(), TokenStoreError> {
        self.inner.tokens.add_token(token, metadata)
    }

    pub fn delete_token(&self, token: &str) -> Result<bool, TokenStoreError> {
        self.inner.tokens.delete_token(token)
    }

    pub fn tokens(&self) -> &TokenStore {
        &self.inner.tokens
    }
}

impl Inner {
    async fn handle_connection(self: Arc<Self>, stream: TcpStream, peer: SocketAddr) {
        if let Err(e) = stream.set_nodelay(true) {
            debug!("Failed to set TCP_NODELAY for {}: {}", peer, e);
        }

        let result = match &self.tls {
            None => self.serve(stream, peer).await,
            Some(acceptor) => {
                let accepted = tokio::select! {
                    () = self.cancel.cancelled() => return,
                    accepted = acceptor.accept(stream) => accepted,
                };
                match accepted {
                    Ok(stream) => self.serve(stream, peer).await,
                    Err(e) => {
                        warn!("TLS handshake with {} failed: {}", peer, e);
                        return;
                    }
                }
            }
        };

        if let Err(e) = result {
            debug!("Connection from {} failed: {}", peer, e);
        }
    }

    async fn serve<S>(&self, mut stream: S, peer: SocketAddr) -> io::Result<()>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let display_name = if self.use_auth {
            match self.authenticate(&mut stream, peer).await? {
                Some(name) => Some(name),
                None => {
                    debug!("Rejected client {}", peer);
                    return close(stream).await;
                }
            }
        } else {
            None
        };

        while let Some(value) = self.next_frame(&mut stream).await? {
            let Some(mut record) = LogRecord::from_value(value) else {
                debug!("Received a non-object frame from {}", peer);
                break;
            };

            if let Some(field) = record.missing_field() {
                debug!("Dropping record from {} with invalid '{}'", peer, field);
                continue;
            }

            if let Some(name) = &display_name {
                record.enrich_host(name);
            }
            self.forwarder.put(record);
        }

        close(stream).await
    }

    async fn authenticate<S>(&self, stream: &mut S, peer: SocketAddr) -> io::Result<Option<String>>
    where
        S: AsyncRead + Unpin,
    {
        let Some(Value::Object(message)) = self.next_frame(stream).await? else {
            return Ok(None);
        };
        let Some(token) = message
            .get("token")
            .and_then(Value::as_str)
            .filter(|token| !token.is_empty())
        else {
            return Ok(None);
        };

        match self.tokens.authenticate(token).await {
            Ok(Some(name)) => {
                info!("Client '{}' connected from {}", name, peer);
                Ok(Some(name))
            }
            Ok(None) => Ok(None),
            Err(e) => {
                error!("Failed to refresh tokens: {}", e);
                Ok(None)
            }
        }
    }

    /// Reads the next frame, or `None` once the server is stopping and no frame is in flight.
    async fn next_frame<S>(&self, stream: &mut S) -> io::Result<Option<Value>>
    where
        S: AsyncRead + Unpin,
    {
        if self.cancel.is_cancelled() {
            return Ok(None);
        }
        let first = tokio::select! {
            biased;
            () = self.cancel.cancelled() => return Ok(None),
            first = read_frame_start(stream) => first?,
        };

        // A frame that started arriving is read to its end, even once stopping
        match first {
            Some(first) => read_message_from(stream, first).await,
            None => Ok(None),
        }
    }
}

async fn close<S: AsyncWrite + Unpin>(mut stream: S) -> io::Result<()> {
    match stream.shutdown().await {
        Ok(()) => Ok(()),
        // The peer may already be gone
        Err(e) if e.kind() == io::ErrorKind::NotConnected => Ok(()),
        Err(e) => Err(e),
    }
}
