// Copyright 2021-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! The remote-semaphore (`rsem`) service.
//!
//! A shoalfs cluster needs a few coarse distributed locks ("only one node
//! runs the reformat", "at most two concurrent scrubbers") long before it
//! needs real consensus. `rsem` is that primitive: named counting
//! semaphores held by one coordinator daemon ([`server::RsemServer`],
//! shipped as `shoalrsemd`) and taken/released by any node through
//! [`client::RsemClient`].
//!
//! The interesting case is a take that cannot be satisfied: instead of
//! holding the connection open, the server queues the waiter and later
//! dials back to a port the waiter is listening on: the delayed grant.
//! Waiters queue FIFO; an unreachable waiter is skipped rather than
//! stalling everyone behind it.

#![cfg(unix)]

pub mod client;
pub mod config;
pub mod fastlog;
pub mod protocol;
pub mod server;

pub use client::RsemClient;
pub use config::{RsemClientConfig, RsemServerConfig, SemConfig};
pub use protocol::{MessageType, ProtocolError};
pub use server::RsemServer;

/// Errors surfaced to rsem callers. Transport-level detail is collapsed;
/// callers mostly care whether to retry, give up, or fix their config.
#[derive(Debug, thiserror::Error)]
pub enum RsemError {
    #[error("invalid configuration: {0}")]
    Config(String),
    #[error("duplicate semaphore name '{0}'")]
    DuplicateSem(String),
    #[error("semaphore '{0}' is not known to the server")]
    NoSuchSem(String),
    #[error("server granted '{got}' but '{want}' was requested")]
    GrantMismatch { got: String, want: String },
    #[error("unexpected reply: {0:?}")]
    UnexpectedReply(MessageType),
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
