// Copyright 2021-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! End-to-end crash-log validation: a child process installs the handler,
//! raises a fatal signal, and the parent checks what landed in the crash
//! file. Everything runs in one test function because signal dispositions
//! and the crash-log globals are process-wide.

use nix::sys::signal::{raise, Signal};
use nix::sys::wait::waitpid;
use nix::unistd::{fork, ForkResult};
use shoalfs_core::crash_log;
use std::path::Path;

fn crash_child_and_validate(dir: &Path, sig: Signal) {
    let crash_path = dir.join(format!("crash.log.{}", sig as i32));
    // Safety: the child only initializes crash logging and raises; it
    // never returns into the test harness.
    match unsafe { fork() }.expect("fork failed") {
        ForkResult::Child => {
            let ok = crash_log::init(Some(&crash_path), None).is_ok();
            if ok {
                let _ = raise(sig);
            }
            // Only reached if the signal did not kill us; report failure.
            unsafe { libc::_exit(1) };
        }
        ForkResult::Parent { child } => {
            waitpid(child, None).expect("waitpid failed");
        }
    }

    let contents = std::fs::read_to_string(&crash_path)
        .unwrap_or_else(|e| panic!("crash log '{}' unreadable: {e}", crash_path.display()));
    let expected = format!("HANDLE_FATAL_SIGNAL(sig={}, name=", sig as i32);
    assert!(
        contents.starts_with(&expected),
        "crash log for {sig} began with {:?}",
        &contents[..contents.len().min(64)]
    );
    assert!(
        contents.contains("END_HANDLE_FATAL_SIGNAL\n"),
        "crash log for {sig} missing trailer"
    );
}

#[test]
fn test_crash_log_lifecycle() {
    let dir = tempfile::tempdir().unwrap();

    for sig in [
        Signal::SIGSEGV,
        Signal::SIGBUS,
        Signal::SIGILL,
        Signal::SIGFPE,
        Signal::SIGABRT,
        Signal::SIGINT,
    ] {
        crash_child_and_validate(dir.path(), sig);
    }

    // Now exercise init/reset in this process: a second init is refused
    // while the first stands, and reset is idempotent.
    let crash_path = dir.path().join("crash.log.parent");
    crash_log::init(Some(&crash_path), None).unwrap();
    assert!(crash_log::init(Some(&crash_path), None).is_err());
    crash_log::reset();
    crash_log::reset();

    // After a full reset the subsystem can come back up.
    crash_log::init(Some(&crash_path), None).unwrap();
    crash_log::reset();
}
