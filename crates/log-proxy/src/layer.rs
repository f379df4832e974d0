// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! `tracing` layer shipping the local process' events through a sink.

use std::fmt::{self, Write as _};

use chrono::Local;
use tracing::field::{Field, Visit};
use tracing::{Event, Level, Subscriber};
use tracing_subscriber::layer::Context;
use tracing_subscriber::Layer;

use crate::record::LogRecord;
use crate::sink::ForwarderHandle;

/// Targets whose events are never forwarded. Forwarding them would feed the sink its own logs.
const DEFAULT_SKIPPED_TARGETS: [&str; 2] = ["log_proxy::sink", "log_proxy::tls"];

/// Numeric severity stored in a record's `level` field.
pub fn level_number(level: &Level) -> i64 {
    match *level {
        Level::ERROR => 40,
        Level::WARN => 30,
        Level::INFO => 20,
        Level::DEBUG => 10,
        Level::TRACE => 5,
    }
}

pub struct ForwardingLayer {
    handle: ForwarderHandle,
    pid: u32,
    skipped_targets: Vec<String>,
}

impl ForwardingLayer {
    pub fn new(handle: ForwarderHandle) -> Self {
        Self {
            handle,
            pid: std::process::id(),
            skipped_targets: DEFAULT_SKIPPED_TARGETS.iter().map(|t| t.to_string()).collect(),
        }
    }

    /// Also skips events whose target starts with `prefix`.
    #[must_use]
    pub fn with_skipped_target(mut self, prefix: impl Into<String>) -> Self {
        self.skipped_targets.push(prefix.into());
        self
    }

    fn is_skipped(&self, target: &str) -> bool {
        self.skipped_targets
            .iter()
            .any(|prefix| target.starts_with(prefix.as_str()))
    }
}

impl<S: Subscriber> Layer<S> for ForwardingLayer {
    fn on_event(&self, event: &Event<'_>, _ctx: Context<'_, S>) {
        let metadata = event.metadata();
        if self.is_skipped(metadata.target()) {
            return;
        }

        let mut visitor = MessageVisitor::default();
        event.record(&mut visitor);

        let mut record = LogRecord::new();
        record.insert("level", level_number(metadata.level()));
        record.insert("pid", self.pid);
        record.insert("message", visitor.finish());
        record.insert(
            "created_at",
            Local::now().format("%Y-%m-%dT%H:%M:%S%.6f").to_string(),
        );
        record.insert("created_by", metadata.target());
        if let Some(file) = metadata.file() {
            record.insert("path", file);
        }
        if let Some(line) = metadata.line() {
            record.insert("lineno", line);
        }

        self.handle.put(record);
    }
}

/// Renders the `message` field followed by the remaining fields as `key=value`.
#[derive(Default)]
struct MessageVisitor {
    message: String,
    fields: String,
}

impl MessageVisitor {
    fn finish(self) -> String {
        if self.message.is_empty() {
            self.fields
        } else if self.fields.is_empty() {
            self.message
        } else {
            format!("{} {}", self.message, self.fields)
        }
    }
}

impl Visit for MessageVisitor {
    fn record_str(&mut self, field: &Field, value: &str) {
        if field.name() == "message" {
            self.message.push_str(value);
        } else {
            self.record_debug(field, &value);
        }
    }

    fn record_debug(&mut self, field: &Field, value: &dyn fmt::Debug) {
        if field.name() == "message" {
            let _ = write!(self.message, "{value:?}");
            return;
        }
        if !self.fields.is_empty() {
            self.fields.push(' ');
        }
        let _ = write!(self.fields, "{}={:?}", field.name(), value);
    }
}
