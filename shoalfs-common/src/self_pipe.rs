// Copyright 2021-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! The self-pipe trick.
//!
//! A pipe whose read end sits in a `poll` set so one thread can wake
//! another out of the kernel. A single byte travels over it and carries
//! the reason: [`SelfPipe::SHUTDOWN`] asks the service thread to exit,
//! [`SelfPipe::EVENT`] means "state changed, go look".

use crate::safe_io::{safe_read, safe_write};
use nix::errno::Errno;
use nix::fcntl::OFlag;
use nix::unistd::pipe2;
use std::os::fd::{AsFd, AsRawFd, BorrowedFd, OwnedFd, RawFd};

pub struct SelfPipe {
    read: OwnedFd,
    write: OwnedFd,
}

impl SelfPipe {
    /// The wakeup byte that asks the polling thread to terminate.
    pub const SHUTDOWN: u8 = 0;
    /// The wakeup byte that announces a state change.
    pub const EVENT: u8 = 1;

    pub fn new() -> Result<Self, Errno> {
        let (read, write) = pipe2(OFlag::O_CLOEXEC)?;
        Ok(Self { read, write })
    }

    /// The fd to include in a `poll` set with `POLLIN`.
    pub fn poll_fd(&self) -> RawFd {
        self.read.as_raw_fd()
    }

    /// Borrowed form of [`poll_fd`](Self::poll_fd), for `nix::poll`.
    pub fn poll_fd_borrowed(&self) -> BorrowedFd<'_> {
        self.read.as_fd()
    }

    pub fn notify_event(&self) -> Result<(), Errno> {
        safe_write(self.write.as_raw_fd(), &[Self::EVENT])
    }

    pub fn notify_shutdown(&self) -> Result<(), Errno> {
        safe_write(self.write.as_raw_fd(), &[Self::SHUTDOWN])
    }

    /// Drains one wakeup byte. Only the polling thread should call this,
    /// and only after `poll` reported the read end ready.
    pub fn read_byte(&self) -> Result<u8, Errno> {
        let mut buf = [0u8; 1];
        safe_read(self.read.as_raw_fd(), &mut buf)?;
        Ok(buf[0])
    }
}
