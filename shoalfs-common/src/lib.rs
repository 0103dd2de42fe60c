// Copyright 2021-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

#![cfg(unix)]

pub mod net;
pub mod safe_io;
pub mod self_pipe;

pub use safe_io::{safe_pread, safe_pwrite, safe_read, safe_read_exact, safe_write, SafeIoError};
pub use self_pipe::SelfPipe;
