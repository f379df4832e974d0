// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Sinks receive validated records and deliver them to a downstream endpoint.
//!
//! A [`Sink`] only knows how to connect and write a single record. The [`Forwarder`] owns the
//! sink together with its [`OrderedQueue`] and runs the drain loop, while cloned
//! [`ForwarderHandle`]s are used by producers to enqueue records.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::errors::SinkError;
use crate::queue::OrderedQueue;
use crate::record::LogRecord;

pub mod mongo;
pub mod postgres;
pub mod socket;

pub use mongo::{MongoSink, MongoSinkConfig};
pub use postgres::{PostgresSink, PostgresSinkConfig};
pub use socket::{SocketSink, SocketSinkConfig};

/// Pause after a failed connect or send before the next attempt.
pub const RETRY_DELAY: Duration = Duration::from_secs(5);

/// Downstream endpoint for log records.
#[async_trait]
pub trait Sink: fmt::Display + Send {
    /// Establishes the connection to the endpoint.
    async fn connect(&mut self) -> Result<(), SinkError>;

    fn is_connected(&self) -> bool;

    /// Delivers a single record. Only called while connected.
    async fn send(&mut self, record: &LogRecord) -> Result<(), SinkError>;

    /// Drops the current connection. Safe to call in any state.
    fn invalidate(&mut self);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SinkState {
    Disconnected,
    Connecting,
    Connected,
    Failed,
}

/// Producer side of a [`Forwarder`].
#[derive(Clone)]
pub struct ForwarderHandle {
    queue: Arc<OrderedQueue>,
    state: watch::Receiver<SinkState>,
}

impl ForwarderHandle {
    /// Enqueues a record. Never waits, even if the sink is down.
    pub fn put(&self, record: LogRecord) {
        self.queue.put(record);
    }

    pub fn empty(&self) -> bool {
        self.queue.empty()
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn queue(&self) -> &OrderedQueue {
        &self.queue
    }

    pub fn state(&self) -> SinkState {
        *self.state.borrow()
    }

    /// Waits until the sink reaches `state`.
    pub async fn wait_for_state(&mut self, state: SinkState) {
        // The sender lives as long as the forwarder, which is gone once it was cancelled.
        let _ = self.state.wait_for(|current| *current == state).await;
    }
}

/// Drain loop moving records from the queue into the sink.
pub struct Forwarder {
    sink: Box<dyn Sink>,
    queue: Arc<OrderedQueue>,
    state: watch::Sender<SinkState>,
    retry_delay: Duration,
}

impl Forwarder {
    pub fn new<S>(sink: S, max_size: usize) -> (Self, ForwarderHandle)
    where
        S: Sink + 'static,
    {
        let queue = Arc::new(OrderedQueue::new(max_size));
        let (state, state_rx) = watch::channel(SinkState::Disconnected);

        let forwarder = Self {
            sink: Box::new(sink),
            queue: Arc::clone(&queue),
            state,
            retry_delay: RETRY_DELAY,
        };
        let handle = ForwarderHandle {
            queue,
            state: state_rx,
        };
        (forwarder, handle)
    }

    #[must_use]
    pub fn with_retry_delay(mut self, retry_delay: Duration) -> Self {
        self.retry_delay = retry_delay;
        self
    }

    /// Runs until `cancel` fires. Errors never end the loop.
    ///
    /// A record the sink refuses on its own is skipped. Any other error drops the connection and
    /// pauses for the retry delay.
    pub async fn run(mut self, cancel: CancellationToken) {
        debug!("Forwarder for {} started", self.sink);

        loop {
            let result = tokio::select! {
                biased;
                () = cancel.cancelled() => break,
                result = self.step() => result,
            };

            match result {
                Ok(()) => continue,
                Err(e) if e.is_record_error() => {
                    warn!("Skipping record rejected by {}: {}", self.sink, e);
                    continue;
                }
                Err(e) => error!("Forwarding to {} failed: {}", self.sink, e),
            }

            self.sink.invalidate();
            self.state.send_replace(SinkState::Failed);

            tokio::select! {
                biased;
                () = cancel.cancelled() => break,
                () = tokio::time::sleep(self.retry_delay) => {}
            }
            self.state.send_replace(SinkState::Disconnected);
        }

        self.sink.invalidate();
        self.state.send_replace(SinkState::Disconnected);
        debug!("Forwarder for {} stopped", self.sink);
    }

    async fn step(&mut self) -> Result<(), SinkError> {
        if !self.sink.is_connected() {
            self.state.send_replace(SinkState::Connecting);
            self.sink.connect().await?;
            self.state.send_replace(SinkState::Connected);
            info!("Connected to {}", self.sink);
        }

        let record = self.queue.get().await;
        self.sink.send(&record).await
    }
}
