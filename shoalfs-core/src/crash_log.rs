// Copyright 2021-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Post-mortem crash logging.
//!
//! [`init`] points the process at a crash-log file and installs one-shot
//! dispositions for the fatal signals on a dedicated alternate stack. When
//! one of them lands, the handler writes a fixed header, the backtrace, and
//! a snapshot of every registered fast-log ring to the crash file, mirrors
//! the file to syslog, and re-raises the signal so the default action
//! (core dump, termination) still happens.
//!
//! Note that this file makes use of the following async-signal safe
//! functions in a signal handler.
//! <https://man7.org/linux/man-pages/man7/signal-safety.7.html>
//! - write
//! - read
//! - lseek
//! - fsync
//! - raise
//! - syslog (glibc's is not formally listed, but it takes only
//!   preformatted stack buffers here)
//!
//! Everything is process-global because a signal handler cannot take a
//! context argument. Mutexes are not allowed in a signal handler, so the
//! state lives in atomics.

use crate::fast_log::{self, FastLogScratch};
use crate::sigsafe::{format_hex, format_u64, signal_name};
use anyhow::Context;
use nix::sys::signal::{self, SaFlags, SigAction, SigHandler, SigSet, Signal};
use shoalfs_common::safe_io::safe_write;
use std::fs::OpenOptions;
use std::os::fd::{IntoRawFd, RawFd};
use std::os::unix::fs::OpenOptionsExt;
use std::path::Path;
use std::ptr;
use std::sync::atomic::Ordering::SeqCst;
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicPtr, AtomicUsize};

/// The signals whose delivery means the process is done for.
pub const FATAL_SIGNALS: [Signal; 9] = [
    Signal::SIGSEGV,
    Signal::SIGBUS,
    Signal::SIGILL,
    Signal::SIGFPE,
    Signal::SIGABRT,
    Signal::SIGXCPU,
    Signal::SIGXFSZ,
    Signal::SIGSYS,
    Signal::SIGINT,
];

/// Called first from the handler, before any output. Must itself be
/// async-signal-safe; a plain fn pointer so no allocation is involved.
pub type FatalSignalCallback = fn(i32);

const MAX_BACKTRACE_FRAMES: usize = 128;

static INITIALIZED: AtomicBool = AtomicBool::new(false);
static CRASH_FD: AtomicI32 = AtomicI32::new(-1);
static CALLBACK: AtomicUsize = AtomicUsize::new(0);
static ALT_STACK_BASE: AtomicPtr<libc::c_void> = AtomicPtr::new(ptr::null_mut());
static ALT_STACK_TOTAL: AtomicUsize = AtomicUsize::new(0);
static SCRATCH: AtomicPtr<FastLogScratch> = AtomicPtr::new(ptr::null_mut());

/// Opens the crash log and installs the fatal-signal dispositions.
///
/// With `crash_log` absent, output goes to stderr and the syslog replay is
/// skipped. SIGPIPE is ignored as a side effect; a write to a dead peer is
/// an errno here, not a death sentence.
///
/// PRECONDITIONS:
///     A [`FastLogScratch`]-sized allocation must be affordable now; the
///     handler cannot allocate later.
/// SAFETY:
///     Crash-logging functions are not reentrant; do not call `init` and
///     [`reset`] concurrently.
/// ATOMICITY:
///     Guarded by a compare-exchange so a second call fails cleanly.
pub fn init(crash_log: Option<&Path>, callback: Option<FatalSignalCallback>) -> anyhow::Result<()> {
    anyhow::ensure!(
        INITIALIZED
            .compare_exchange(false, true, SeqCst, SeqCst)
            .is_ok(),
        "crash log already initialized"
    );

    let fd = match crash_log {
        Some(path) => OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .mode(0o600)
            .open(path)
            .with_context(|| format!("failed to open crash log '{}'", path.display()))?
            .into_raw_fd(),
        None => libc::STDERR_FILENO,
    };
    CRASH_FD.store(fd, SeqCst);
    CALLBACK.store(callback.map_or(0, |cb| cb as usize), SeqCst);

    // The scratch snapshot the handler will dump fast logs into.
    SCRATCH.store(Box::into_raw(Box::new(FastLogScratch::new())), SeqCst);

    // Safety: fresh mapping, registered before any disposition points at it.
    unsafe { create_alt_stack()? };

    let action = SigAction::new(
        SigHandler::SigAction(handle_fatal_signal),
        // One-shot on an alternate stack: the disposition reverts on
        // delivery, so the re-raise at the end of the handler takes the
        // default action. A second fatal signal arriving mid-handler also
        // gets the default action, which is the intended behavior.
        SaFlags::SA_RESETHAND | SaFlags::SA_ONSTACK,
        SigSet::empty(),
    );
    for sig in FATAL_SIGNALS {
        // Safety: the handler only calls the async-signal-safe routines
        // catalogued at the top of this file.
        unsafe { signal::sigaction(sig, &action) }
            .with_context(|| format!("sigaction({sig}) failed"))?;
    }
    // Safety: SigIgn installs no handler code at all.
    unsafe { signal::signal(Signal::SIGPIPE, SigHandler::SigIgn) }
        .context("failed to ignore SIGPIPE")?;
    Ok(())
}

/// Tears crash logging down: all fatal signals revert to ignored, the
/// alternate stack is unmapped, and the crash-log fd is closed exactly
/// once. Safe to call repeatedly; later calls do nothing.
pub fn reset() {
    if INITIALIZED
        .compare_exchange(true, false, SeqCst, SeqCst)
        .is_err()
    {
        return;
    }
    for sig in FATAL_SIGNALS {
        // Safety: SigIgn installs no handler code.
        let _ = unsafe { signal::signal(sig, SigHandler::SigIgn) };
    }
    let fd = CRASH_FD.swap(-1, SeqCst);
    if fd >= 0 && fd != libc::STDERR_FILENO {
        // Safety: fd came from into_raw_fd in init and nothing else closes
        // it; swapping to -1 above makes this close single-shot.
        unsafe { libc::close(fd) };
    }
    let base = ALT_STACK_BASE.swap(ptr::null_mut(), SeqCst);
    let total = ALT_STACK_TOTAL.swap(0, SeqCst);
    if !base.is_null() {
        // Safety: base/total describe the mapping made in create_alt_stack.
        unsafe { libc::munmap(base, total) };
    }
    let scratch = SCRATCH.swap(ptr::null_mut(), SeqCst);
    if !scratch.is_null() {
        // Safety: pointer came from Box::into_raw in init.
        unsafe { drop(Box::from_raw(scratch)) };
    }
}

/// Allocates the alternate signal stack with a guard page below it, sized
/// at least SIGSTKSZ and at least 16 pages; backtracing from a signal
/// handler has been seen to blow through the 8 KiB default.
unsafe fn create_alt_stack() -> anyhow::Result<()> {
    let page = page_size::get();
    let stack_size = std::cmp::max(libc::SIGSTKSZ, 16 * page);
    let total = stack_size + page;
    let base = libc::mmap(
        ptr::null_mut(),
        total,
        libc::PROT_READ | libc::PROT_WRITE,
        libc::MAP_PRIVATE | libc::MAP_ANON,
        -1,
        0,
    );
    anyhow::ensure!(base != libc::MAP_FAILED, "failed to map alternate stack");
    anyhow::ensure!(
        libc::mprotect(base, page, libc::PROT_NONE) == 0,
        "failed to place alternate-stack guard page"
    );
    let stack = libc::stack_t {
        ss_sp: base.add(page),
        ss_flags: 0,
        ss_size: stack_size,
    };
    anyhow::ensure!(
        libc::sigaltstack(&stack, ptr::null_mut()) == 0,
        "sigaltstack failed"
    );
    ALT_STACK_BASE.store(base, SeqCst);
    ALT_STACK_TOTAL.store(total, SeqCst);
    Ok(())
}

/// Writes the stable header line:
/// `HANDLE_FATAL_SIGNAL(sig=<n>, name=<s>)\n`. Log scrapers key on this
/// exact text. Async-signal-safe.
fn write_crash_header(fd: RawFd, sig: i32) {
    let _ = safe_write(fd, b"HANDLE_FATAL_SIGNAL(sig=");
    let _ = safe_write(fd, format_u64(sig as u64).as_bytes());
    let _ = safe_write(fd, b", name=");
    let _ = safe_write(fd, signal_name(sig).as_bytes());
    let _ = safe_write(fd, b")\n");
}

/// Captures the backtrace as raw instruction pointers, one per line.
/// Absolute addresses are the safe thing to collect during a crash; symbol
/// resolution can itself fault and is left to offline tooling.
fn write_backtrace(fd: RawFd) {
    let mut frames = 0usize;
    // Safety: walking frame pointers from a signal handler is not
    // guaranteed safe by the backtrace crate, but collecting bare ip
    // values (no symbol resolution, no allocation) is the tolerable
    // subset; this only runs when the process is already lost.
    unsafe {
        backtrace::trace_unsynchronized(|frame| {
            let _ = safe_write(fd, b"  ip=");
            let _ = safe_write(fd, format_hex(frame.ip() as usize).as_bytes());
            let _ = safe_write(fd, b"\n");
            frames += 1;
            frames < MAX_BACKTRACE_FRAMES
        });
    }
}

/// Replays the crash file into syslog one line at a time. fopen and friends
/// can allocate, so this reads single bytes into a stack line buffer.
fn cat_fd_to_syslog(fd: RawFd) {
    if unsafe { libc::lseek(fd, 0, libc::SEEK_SET) } != 0 {
        return;
    }
    let mut line = [0u8; 512];
    let mut len = 0usize;
    loop {
        let mut b = [0u8; 1];
        let res = unsafe { libc::read(fd, b.as_mut_ptr() as *mut libc::c_void, 1) };
        if res <= 0 || b[0] == b'\n' || len == line.len() - 1 {
            crate::sigsafe::syslog_line(
                libc::LOG_ERR | libc::LOG_USER | libc::LOG_PERROR,
                &line[..len],
            );
            if res <= 0 {
                return;
            }
            line.fill(0);
            len = 0;
        } else {
            line[len] = b[0];
            len += 1;
        }
    }
}

extern "C" fn handle_fatal_signal(
    sig: libc::c_int,
    _info: *mut libc::siginfo_t,
    _ctx: *mut libc::c_void,
) {
    let cb = CALLBACK.load(SeqCst);
    if cb != 0 {
        // Safety: the value was stored from a FatalSignalCallback in init.
        let cb: FatalSignalCallback = unsafe { std::mem::transmute(cb) };
        cb(sig);
    }

    let fd = CRASH_FD.load(SeqCst);
    if fd < 0 {
        // Safety: raise is async-signal-safe; the disposition already
        // reverted to default.
        unsafe { libc::raise(sig) };
        return;
    }

    write_crash_header(fd, sig);
    write_backtrace(fd);

    let scratch = SCRATCH.load(SeqCst);
    if !scratch.is_null() {
        // Safety: the scratch box lives until reset(), which cannot run
        // usefully while the process is crashing; no other thread writes
        // through this pointer.
        let _ = fast_log::dump_all(unsafe { &mut *scratch }, fd);
    }

    let _ = safe_write(fd, b"END_HANDLE_FATAL_SIGNAL\n");
    // Safety: fsync on an owned fd.
    unsafe { libc::fsync(fd) };

    if fd != libc::STDERR_FILENO {
        cat_fd_to_syslog(fd);
    }

    // Die: SA_RESETHAND restored the default disposition for this signal,
    // so the re-raise terminates the process.
    unsafe { libc::raise(sig) };
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Read, Seek, SeekFrom};
    use std::os::fd::AsRawFd;

    #[test]
    fn test_crash_header_is_the_stable_contract() {
        let mut file = tempfile::tempfile().unwrap();
        write_crash_header(file.as_raw_fd(), libc::SIGSEGV);
        file.seek(SeekFrom::Start(0)).unwrap();
        let mut out = String::new();
        file.read_to_string(&mut out).unwrap();
        assert_eq!(
            out,
            format!("HANDLE_FATAL_SIGNAL(sig={}, name=SIGSEGV)\n", libc::SIGSEGV)
        );
    }

    #[test]
    fn test_backtrace_emits_frames() {
        let mut file = tempfile::tempfile().unwrap();
        write_backtrace(file.as_raw_fd());
        file.seek(SeekFrom::Start(0)).unwrap();
        let mut out = String::new();
        file.read_to_string(&mut out).unwrap();
        assert!(out.lines().count() > 1);
        assert!(out.lines().all(|l| l.starts_with("  ip=0x")));
    }
}
