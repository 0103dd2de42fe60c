// Copyright 2021-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Per-thread lock-free diagnostic rings.
//!
//! A fast log is a fixed ring of fixed-size, type-tagged entries that one
//! producer thread appends to with a single copy. Nothing on the producer
//! path blocks or allocates, so the hot paths of the daemons can log
//! liberally. The payoff comes after a fatal signal: the crash handler
//! snapshots every registered ring into preallocated scratch memory and
//! renders the entries through the dumper table, giving a per-thread trace
//! of the moments before the crash.
//!
//! Concurrency contract: each ring has exactly one producer (enforced by
//! `&mut self` on [`FastLogBuffer::log`]). Everyone else, including the
//! signal handler, only ever reads a snapshot. The global registry is the
//! one piece of shared state, guarded by a spin lock because a mutex is not
//! async-signal-safe.

use crate::sigsafe::sigsafe_strlen;
use nix::errno::Errno;
use shoalfs_common::safe_io::safe_write;
use std::cell::UnsafeCell;
use std::os::fd::RawFd;
use std::ptr::{self, NonNull};
use std::sync::atomic::Ordering::{Acquire, Relaxed, Release};
use std::sync::atomic::{AtomicBool, AtomicU32};
use std::sync::OnceLock;

/// Maximum length of a ring's name, including the NUL padding.
pub const FAST_LOG_BUF_NAME_MAX: usize = 16;

/// Bytes of payload that fit in one entry after the type tag.
pub const FAST_LOG_ENTRY_BODY: usize = 62;

/// Reserved tag marking a slot that has never been written.
pub const FAST_LOG_TAG_NONE: u16 = 0;

const ENTRY_SIZE: usize = 64;
const BUF_SZ: usize = 16 * 1024;
const MAX_OFF: u32 = (BUF_SZ / ENTRY_SIZE) as u32;
const MAX_BUFS: usize = 128;

/// Renders one entry onto `fd`. Dumpers run under a fatal signal, so they
/// must be async-signal-safe: format into stack buffers and emit with
/// [`safe_write`], nothing else.
pub type FastLogDumper = fn(&FastLogEntry, RawFd) -> Result<(), Errno>;

/// One fixed-size record in a ring. The tag picks the dumper; the body is
/// opaque to the logger.
#[repr(C)]
#[derive(Clone, Copy)]
pub struct FastLogEntry {
    pub tag: u16,
    pub body: [u8; FAST_LOG_ENTRY_BODY],
}

impl FastLogEntry {
    /// Builds an entry from a payload, truncating to the fixed body size.
    pub fn new(tag: u16, payload: &[u8]) -> Self {
        let mut body = [0u8; FAST_LOG_ENTRY_BODY];
        let n = payload.len().min(FAST_LOG_ENTRY_BODY);
        body[..n].copy_from_slice(&payload[..n]);
        Self { tag, body }
    }
}

#[derive(Debug, Eq, PartialEq, thiserror::Error)]
pub enum FastLogError {
    #[error("fast log already initialized")]
    AlreadyInitialized,
    #[error("fast log registry is full ({MAX_BUFS} rings)")]
    RegistryFull,
    #[error("mmap of ring storage failed: {0}")]
    Map(Errno),
}

static DUMPERS: OnceLock<&'static [Option<FastLogDumper>]> = OnceLock::new();

/// A spin lock. Held only for the few instructions it takes to touch the
/// registry array, which is what makes taking it from a signal handler
/// tolerable.
struct SpinLock(AtomicBool);

impl SpinLock {
    fn lock(&self) {
        while self
            .0
            .compare_exchange_weak(false, true, Acquire, Relaxed)
            .is_err()
        {
            std::hint::spin_loop();
        }
    }

    fn unlock(&self) {
        self.0.store(false, Release);
    }
}

struct Registry {
    lock: SpinLock,
    slots: UnsafeCell<[*const FastLogBuffer; MAX_BUFS]>,
}

// Safety: `slots` is only read or written while `lock` is held; the raw
// pointers themselves are only dereferenced for snapshot copies, which the
// owning ring guarantees valid until it unregisters (in its Drop, under the
// same lock).
unsafe impl Sync for Registry {}

static REGISTRY: Registry = Registry {
    lock: SpinLock(AtomicBool::new(false)),
    slots: UnsafeCell::new([ptr::null(); MAX_BUFS]),
};

/// Installs the dumper table and clears the registry. Call once, before any
/// daemon thread starts.
pub fn init(dumpers: &'static [Option<FastLogDumper>]) -> Result<(), FastLogError> {
    DUMPERS
        .set(dumpers)
        .map_err(|_| FastLogError::AlreadyInitialized)?;
    REGISTRY.lock.lock();
    // Safety: lock held.
    unsafe {
        (*REGISTRY.slots.get()).fill(ptr::null());
    }
    REGISTRY.lock.unlock();
    Ok(())
}

/// A producer-exclusive ring of [`FastLogEntry`] records backed by an
/// anonymous page-aligned mapping. Created boxed so the registry's pointer
/// to it stays stable.
pub struct FastLogBuffer {
    name: [u8; FAST_LOG_BUF_NAME_MAX],
    region: NonNull<u8>,
    off: AtomicU32,
    registered: AtomicBool,
}

// Safety: the ring can move between threads; `region` is an exclusive
// mapping owned by this struct.
unsafe impl Send for FastLogBuffer {}

impl FastLogBuffer {
    /// Allocates a zeroed ring. The name is truncated to
    /// [`FAST_LOG_BUF_NAME_MAX`] − 1 bytes.
    pub fn create(name: &str) -> Result<Box<Self>, FastLogError> {
        // Safety: anonymous private mapping, not backed by a file.
        let p = unsafe {
            libc::mmap(
                ptr::null_mut(),
                BUF_SZ,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_PRIVATE | libc::MAP_ANON,
                -1,
                0,
            )
        };
        if p == libc::MAP_FAILED {
            return Err(FastLogError::Map(Errno::last()));
        }
        let mut name_buf = [0u8; FAST_LOG_BUF_NAME_MAX];
        let n = name.len().min(FAST_LOG_BUF_NAME_MAX - 1);
        name_buf[..n].copy_from_slice(&name.as_bytes()[..n]);
        Ok(Box::new(Self {
            name: name_buf,
            // Safety: mmap success checked above; the mapping is non-null.
            region: unsafe { NonNull::new_unchecked(p as *mut u8) },
            off: AtomicU32::new(0),
            registered: AtomicBool::new(false),
        }))
    }

    /// Inserts this ring into the global registry so `dump_all` (and hence
    /// the crash handler) can see it.
    pub fn register(&self) -> Result<(), FastLogError> {
        REGISTRY.lock.lock();
        // Safety: lock held.
        let slots = unsafe { &mut *REGISTRY.slots.get() };
        let Some(slot) = slots.iter_mut().find(|s| s.is_null()) else {
            REGISTRY.lock.unlock();
            return Err(FastLogError::RegistryFull);
        };
        *slot = self as *const FastLogBuffer;
        self.registered.store(true, Release);
        REGISTRY.lock.unlock();
        Ok(())
    }

    /// Appends one entry: a single copy into the ring, then the offset
    /// advances modulo the capacity, silently overwriting the oldest entry
    /// on wrap. Never blocks, never allocates, async-signal-safe.
    pub fn log(&mut self, entry: &FastLogEntry) {
        let off = self.off.load(Relaxed);
        // Safety: off is always < MAX_OFF, so the 64-byte write stays
        // inside the mapping.
        unsafe {
            ptr::copy_nonoverlapping(
                entry as *const FastLogEntry as *const u8,
                self.region.as_ptr().add(off as usize * ENTRY_SIZE),
                ENTRY_SIZE,
            );
        }
        self.off.store((off + 1) & (MAX_OFF - 1), Relaxed);
    }

    fn snapshot_into(&self, scratch: &mut FastLogScratch) {
        scratch.name = self.name;
        scratch.off = self.off.load(Relaxed);
        // Safety: both regions are BUF_SZ bytes. The producer may be
        // mid-copy on another thread, so an entry can come through torn;
        // snapshots are post-mortem diagnostics and a torn tail entry is
        // acceptable there.
        unsafe {
            ptr::copy_nonoverlapping(self.region.as_ptr(), scratch.region.as_mut_ptr(), BUF_SZ);
        }
    }

    /// Snapshots this ring into `scratch` and renders it onto `fd` in
    /// chronological order. Async-signal-safe.
    pub fn dump(&self, scratch: &mut FastLogScratch, fd: RawFd) -> Result<(), Errno> {
        self.snapshot_into(scratch);
        dump_scratch(scratch, fd)
    }
}

impl Drop for FastLogBuffer {
    fn drop(&mut self) {
        if self.registered.load(Acquire) {
            REGISTRY.lock.lock();
            // Safety: lock held.
            let slots = unsafe { &mut *REGISTRY.slots.get() };
            for slot in slots.iter_mut() {
                if *slot == self as *const FastLogBuffer {
                    *slot = ptr::null();
                    break;
                }
            }
            REGISTRY.lock.unlock();
        }
        // Safety: region came from mmap(BUF_SZ) in create.
        unsafe {
            libc::munmap(self.region.as_ptr() as *mut libc::c_void, BUF_SZ);
        }
    }
}

/// Preallocated snapshot storage. The crash handler cannot allocate, so
/// whoever installs it creates one of these up front.
pub struct FastLogScratch {
    name: [u8; FAST_LOG_BUF_NAME_MAX],
    off: u32,
    region: Box<[u8]>,
}

impl FastLogScratch {
    pub fn new() -> Self {
        Self {
            name: [0u8; FAST_LOG_BUF_NAME_MAX],
            off: 0,
            region: vec![0u8; BUF_SZ].into_boxed_slice(),
        }
    }
}

impl Default for FastLogScratch {
    fn default() -> Self {
        Self::new()
    }
}

const DUMP_HEADER: &[u8] = b"*** FASTLOG ";
const DUMP_ERROR: &[u8] = b"*** FASTLOG dump error\n";

/// Renders a snapshot: header line, then every populated entry starting at
/// the oldest (the slot the next write would claim) and wrapping once.
/// Async-signal-safe.
fn dump_scratch(scratch: &FastLogScratch, fd: RawFd) -> Result<(), Errno> {
    let Some(dumpers) = DUMPERS.get() else {
        return Ok(());
    };
    safe_write(fd, DUMP_HEADER)?;
    safe_write(fd, &scratch.name[..sigsafe_strlen(&scratch.name)])?;
    safe_write(fd, b"\n")?;

    for i in 0..MAX_OFF {
        let idx = ((scratch.off + i) & (MAX_OFF - 1)) as usize;
        let base = idx * ENTRY_SIZE;
        // Safety: base + ENTRY_SIZE <= BUF_SZ; the scratch region is ours
        // alone. read_unaligned because the boxed slice only guarantees
        // byte alignment.
        let entry = unsafe {
            ptr::read_unaligned(scratch.region[base..].as_ptr() as *const FastLogEntry)
        };
        if entry.tag == FAST_LOG_TAG_NONE {
            continue;
        }
        if let Some(Some(dumper)) = dumpers.get(entry.tag as usize) {
            dumper(&entry, fd)?;
        }
    }
    Ok(())
}

/// Snapshots and dumps every registered ring. Each ring is snapshotted
/// under the registry spin lock and rendered outside it; a dumper failure
/// is reported on `fd` and iteration continues with the next ring.
/// Async-signal-safe.
pub fn dump_all(scratch: &mut FastLogScratch, fd: RawFd) -> Result<(), Errno> {
    if DUMPERS.get().is_none() {
        return Ok(());
    }
    let mut last_err = None;
    for i in 0..MAX_BUFS {
        REGISTRY.lock.lock();
        // Safety: lock held for the pointer read and the snapshot; the
        // ring cannot unregister (and therefore cannot be freed) while we
        // hold the lock.
        let ptr = unsafe { (*REGISTRY.slots.get())[i] };
        if ptr.is_null() {
            REGISTRY.lock.unlock();
            continue;
        }
        unsafe { (*ptr).snapshot_into(scratch) };
        REGISTRY.lock.unlock();

        if let Err(e) = dump_scratch(scratch, fd) {
            let _ = safe_write(fd, DUMP_ERROR);
            last_err = Some(e);
        }
    }
    match last_err {
        Some(e) => Err(e),
        None => Ok(()),
    }
}
