// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Log shipping proxy.
//!
//! Clients emit structured log records over a length-prefixed JSON socket protocol. A [`server::LogServer`]
//! authenticates and validates them and hands them to a sink, which buffers records in a bounded, time-ordered
//! queue and drains them into a downstream endpoint (another log server, PostgreSQL or MongoDB).

#![cfg_attr(not(test), deny(clippy::panic))]
#![cfg_attr(not(test), deny(clippy::unwrap_used))]
#![cfg_attr(not(test), deny(clippy::expect_used))]
#![cfg_attr(not(test), deny(clippy::todo))]
#![cfg_attr(not(test), deny(clippy::unimplemented))]

pub mod client;
pub mod errors;
pub mod layer;
pub mod protocol;
pub mod queue;
pub mod record;
pub mod server;
pub mod sink;
pub mod tls;
pub mod tokens;
pub mod watcher;
