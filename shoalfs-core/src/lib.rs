// Copyright 2021-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! The runtime core shared by the shoalfs daemons.
//!
//! Every daemon (metadata server, object storage daemon, monitor, the
//! remote-semaphore coordinator) is assembled from the same concurrency
//! substrate: per-thread fast-log ring buffers dumpable from a fatal-signal
//! handler, the operator-facing glitch log, a fixed pool of mailbox worker
//! threads, and a poll-driven observer output service. This crate is that
//! substrate; `shoalfs-common` supplies the byte-level primitives.

#![cfg(unix)]

pub mod crash_log;
pub mod daemon;
pub mod fast_log;
pub mod glitch_log;
pub mod log_config;
pub mod output_service;
pub mod pid_file;
pub mod sigsafe;
pub mod worker;

pub use fast_log::{FastLogBuffer, FastLogDumper, FastLogEntry, FastLogScratch};
pub use log_config::{DaemonKind, LogConfig};
