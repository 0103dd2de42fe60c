// Copyright 2021-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Daemon bootstrap: the assembly every server `main` runs before its own
//! loop. Order matters: the glitch log must exist before anything can
//! fail loudly, crash logging before any worker thread starts, and the pid
//! file only once the process that will keep running is known (i.e. after
//! the daemonize fork).

use crate::fast_log::{self, FastLogDumper};
use crate::glitch_log;
use crate::log_config::{harmonize_log_config, DaemonKind, LogConfig};
use crate::pid_file;
use crate::{crash_log, glitch};
use anyhow::Context;

/// Brings up the shared runtime for a daemon: harmonizes the log config,
/// configures the glitch log, installs the fast-log dumper table and the
/// fatal-signal handler, optionally detaches, and writes the pid file.
/// On error everything already initialized is torn down again.
pub fn init(
    kind: DaemonKind,
    foreground: bool,
    lc: &mut LogConfig,
    dumpers: &'static [Option<FastLogDumper>],
) -> anyhow::Result<()> {
    let res = init_inner(kind, foreground, lc, dumpers);
    if let Err(e) = &res {
        glitch!("daemon init failed: {e:#}");
        shutdown();
    }
    res
}

fn init_inner(
    kind: DaemonKind,
    foreground: bool,
    lc: &mut LogConfig,
    dumpers: &'static [Option<FastLogDumper>],
) -> anyhow::Result<()> {
    harmonize_log_config(lc, kind).context("log config error")?;
    glitch_log::configure(lc);
    fast_log::init(dumpers).context("fast log init failed")?;
    crash_log::init(lc.crash_log.as_deref(), None).context("crash log init failed")?;
    if !foreground {
        nix::unistd::daemon(false, false).context("daemon(3) failed")?;
    }
    pid_file::create_pid_file(lc)?;
    Ok(())
}

/// Reverse of [`init`]. Idempotent; safe to call on a half-initialized
/// process.
pub fn shutdown() {
    pid_file::delete_pid_file();
    crash_log::reset();
    glitch_log::close();
}
