// Copyright 2021-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Fast-log instrumentation for the rsem server: one entry per semaphore
//! operation, so a crash dump shows the traffic the coordinator was
//! handling when it died.

use nix::errno::Errno;
use shoalfs_common::safe_io::safe_write;
use shoalfs_core::fast_log::{FastLogDumper, FastLogEntry, FAST_LOG_ENTRY_BODY};
use shoalfs_core::sigsafe::{format_u64, sigsafe_strlen};
use std::os::fd::RawFd;

/// Entry tag for a semaphore operation (tag 0 is reserved).
pub const TAG_RSEM_OP: u16 = 1;

pub const OP_TAKE: u8 = 1;
pub const OP_RELEASE: u8 = 2;
pub const OP_WAKE: u8 = 3;

/// Body layout: `[op, reply-code, name bytes..., NUL]`.
pub fn op_entry(op: u8, code: u8, name: &str) -> FastLogEntry {
    let mut body = [0u8; FAST_LOG_ENTRY_BODY];
    body[0] = op;
    body[1] = code;
    let n = name.len().min(FAST_LOG_ENTRY_BODY - 3);
    body[2..2 + n].copy_from_slice(&name.as_bytes()[..n]);
    FastLogEntry::new(TAG_RSEM_OP, &body)
}

fn op_name(op: u8) -> &'static [u8] {
    match op {
        OP_TAKE => b"take",
        OP_RELEASE => b"release",
        OP_WAKE => b"wake",
        _ => b"unknown",
    }
}

fn dump_rsem_op(entry: &FastLogEntry, fd: RawFd) -> Result<(), Errno> {
    let name = &entry.body[2..];
    safe_write(fd, b"rsem ")?;
    safe_write(fd, op_name(entry.body[0]))?;
    safe_write(fd, b" '")?;
    safe_write(fd, &name[..sigsafe_strlen(name)])?;
    safe_write(fd, b"' -> ")?;
    safe_write(fd, format_u64(entry.body[1] as u64).as_bytes())?;
    safe_write(fd, b"\n")
}

/// The dumper table `shoalrsemd` installs at startup.
pub static RSEM_DUMPERS: [Option<FastLogDumper>; 2] = [None, Some(dump_rsem_op)];

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_op_entry_layout() {
        let entry = op_entry(OP_TAKE, 6, "scrubber");
        assert_eq!(entry.tag, TAG_RSEM_OP);
        assert_eq!(entry.body[0], OP_TAKE);
        assert_eq!(entry.body[1], 6);
        assert_eq!(&entry.body[2..10], b"scrubber");
        assert_eq!(entry.body[10], 0);
    }

    #[test]
    fn test_op_entry_truncates_long_names() {
        let long = "n".repeat(200);
        let entry = op_entry(OP_RELEASE, 3, &long);
        // Name fills the body up to a final NUL.
        assert_eq!(entry.body[FAST_LOG_ENTRY_BODY - 1], 0);
        assert_eq!(entry.body[FAST_LOG_ENTRY_BODY - 2], b'n');
    }
}
