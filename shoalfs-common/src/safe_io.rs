// Copyright 2021-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Byte-exact fd I/O.
//!
//! Thin loops over raw `read`/`write` that retry on `EINTR` and keep going
//! until the requested count is transferred (or EOF, for reads). Every
//! function here is async-signal-safe: no allocation, no locking, no
//! buffered I/O. The fatal-signal handler depends on that.

use libc::c_void;
use nix::errno::Errno;
use std::os::fd::RawFd;

#[derive(Debug, Eq, PartialEq, thiserror::Error)]
pub enum SafeIoError {
    #[error("short read: got {got} of {want} bytes")]
    ShortRead { got: usize, want: usize },
    #[error("I/O error: {0}")]
    Os(#[from] Errno),
}

/// Writes the whole of `buf` to `fd`, retrying interrupted and partial
/// writes. Returns only once every byte is out, or the first hard error.
pub fn safe_write(fd: RawFd, buf: &[u8]) -> Result<(), Errno> {
    let mut off = 0;
    while off < buf.len() {
        // Safety: the slice bounds the pointer and length.
        let res = unsafe {
            libc::write(
                fd,
                buf[off..].as_ptr() as *const c_void,
                buf.len() - off,
            )
        };
        if res < 0 {
            let errno = Errno::last();
            if errno == Errno::EINTR {
                continue;
            }
            return Err(errno);
        }
        off += res as usize;
    }
    Ok(())
}

/// Reads up to `buf.len()` bytes, retrying `EINTR`. Returns the number of
/// bytes actually read; 0 means EOF before anything arrived, and a short
/// count means EOF was hit partway.
pub fn safe_read(fd: RawFd, buf: &mut [u8]) -> Result<usize, Errno> {
    let mut off = 0;
    while off < buf.len() {
        // Safety: the slice bounds the pointer and length.
        let res = unsafe {
            libc::read(
                fd,
                buf[off..].as_mut_ptr() as *mut c_void,
                buf.len() - off,
            )
        };
        if res < 0 {
            let errno = Errno::last();
            if errno == Errno::EINTR {
                continue;
            }
            return Err(errno);
        }
        if res == 0 {
            break;
        }
        off += res as usize;
    }
    Ok(off)
}

/// Like [`safe_read`], but anything other than exactly `buf.len()` bytes is
/// an error, so callers can tell a truncated peer from a failed one.
pub fn safe_read_exact(fd: RawFd, buf: &mut [u8]) -> Result<(), SafeIoError> {
    let got = safe_read(fd, buf)?;
    if got != buf.len() {
        return Err(SafeIoError::ShortRead {
            got,
            want: buf.len(),
        });
    }
    Ok(())
}

/// Positional [`safe_write`]: writes all of `buf` at `offset` without moving
/// the file cursor.
pub fn safe_pwrite(fd: RawFd, buf: &[u8], offset: i64) -> Result<(), Errno> {
    let mut off = 0;
    while off < buf.len() {
        // Safety: the slice bounds the pointer and length.
        let res = unsafe {
            libc::pwrite(
                fd,
                buf[off..].as_ptr() as *const c_void,
                buf.len() - off,
                offset + off as libc::off_t,
            )
        };
        if res < 0 {
            let errno = Errno::last();
            if errno == Errno::EINTR {
                continue;
            }
            return Err(errno);
        }
        off += res as usize;
    }
    Ok(())
}

/// Positional [`safe_read`].
pub fn safe_pread(fd: RawFd, buf: &mut [u8], offset: i64) -> Result<usize, Errno> {
    let mut off = 0;
    while off < buf.len() {
        // Safety: the slice bounds the pointer and length.
        let res = unsafe {
            libc::pread(
                fd,
                buf[off..].as_mut_ptr() as *mut c_void,
                buf.len() - off,
                offset + off as libc::off_t,
            )
        };
        if res < 0 {
            let errno = Errno::last();
            if errno == Errno::EINTR {
                continue;
            }
            return Err(errno);
        }
        if res == 0 {
            break;
        }
        off += res as usize;
    }
    Ok(off)
}
