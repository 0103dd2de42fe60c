// Copyright 2021-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! The glitch log: the operator-facing error log, one line per event.
//!
//! Daemons hit trouble before their configuration is parsed, so the glitch
//! log is usable from the first instruction: lines emitted before
//! [`configure`] spool into a temp file and are replayed, in order, into
//! the real destination once it is known. Every line is also mirrored to
//! stderr, and to syslog when the configuration asks for it.
//!
//! All state is process-wide behind one mutex; emission order is total.

use crate::log_config::LogConfig;
use crate::sigsafe::syslog_line;
use std::fmt;
use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, Seek, SeekFrom, Write};
use std::os::unix::fs::OpenOptionsExt;
use std::path::PathBuf;
use std::sync::{Mutex, MutexGuard, PoisonError};
use tempfile::NamedTempFile;

struct Destination {
    file: File,
    path: PathBuf,
}

struct GlitchLogState {
    configured: bool,
    use_syslog: bool,
    dest: Option<Destination>,
    spool: Option<NamedTempFile>,
}

static STATE: Mutex<GlitchLogState> = Mutex::new(GlitchLogState {
    configured: false,
    use_syslog: false,
    dest: None,
    spool: None,
});

fn lock() -> MutexGuard<'static, GlitchLogState> {
    // A panic mid-log must not silence every later logger.
    STATE.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Logs one line. Use through the [`glitch!`](crate::glitch) macro.
pub fn glitch_log(args: fmt::Arguments<'_>) {
    let mut line = args.to_string();
    if !line.ends_with('\n') {
        line.push('\n');
    }
    let mut state = lock();
    state.emit(&line);
}

/// `format!`-style front end for [`glitch_log`].
#[macro_export]
macro_rules! glitch {
    ($($arg:tt)*) => {
        $crate::glitch_log::glitch_log(::std::format_args!($($arg)*))
    };
}

impl GlitchLogState {
    fn emit(&mut self, line: &str) {
        if self.dest.is_none() && self.spool.is_none() && !self.configured {
            // First pre-configure line: open the spool. Failure just means
            // early lines only reach stderr.
            self.spool = NamedTempFile::new().ok();
        }

        let mut dest_failed = None;
        if let Some(dest) = &mut self.dest {
            if let Err(e) = dest.file.write_all(line.as_bytes()) {
                dest_failed = Some(format!(
                    "error writing to log file '{}': {}\n",
                    dest.path.display(),
                    e
                ));
            }
        } else if let Some(spool) = &mut self.spool {
            let _ = spool.write_all(line.as_bytes());
        }
        if let Some(msg) = dest_failed {
            mirror(&msg, self.use_syslog);
            // Demote to stderr-only; drop closes the fd, once.
            self.dest = None;
        }

        mirror(line, self.use_syslog);
    }
}

fn mirror(line: &str, use_syslog: bool) {
    let _ = std::io::stderr().write_all(line.as_bytes());
    if use_syslog {
        syslog_line(libc::LOG_ERR | libc::LOG_USER, line.trim_end().as_bytes());
    }
}

/// Points the glitch log at its configured destination and replays any
/// spooled pre-configure lines into it (and syslog), in order. The spool
/// file is deleted afterwards. Calling this twice logs a warning and
/// otherwise does nothing.
pub fn configure(lc: &LogConfig) {
    let mut state = lock();
    if state.configured {
        drop(state);
        glitch!("glitch log already configured.");
        return;
    }
    state.use_syslog = lc.use_syslog.unwrap_or(false);

    let mut new_dest = None;
    if let Some(path) = &lc.glitch_log {
        match OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .mode(0o644)
            .open(path)
        {
            Ok(file) => {
                new_dest = Some(Destination {
                    file,
                    path: path.clone(),
                });
            }
            Err(e) => {
                // Degrade to stderr-only logging rather than aborting.
                let msg = format!(
                    "configure_glitch_log: error opening '{}': {}\n",
                    path.display(),
                    e
                );
                mirror(&msg, state.use_syslog);
            }
        }
    }

    if let Some(spool) = state.spool.take() {
        // into_file unlinks the spool path; the fd closes when the replay
        // is done and the File drops.
        let mut spool_file = spool.into_file();
        if spool_file.seek(SeekFrom::Start(0)).is_ok() {
            for line in BufReader::new(spool_file).lines().map_while(Result::ok) {
                if let Some(dest) = &mut new_dest {
                    let _ = dest.file.write_all(line.as_bytes());
                    let _ = dest.file.write_all(b"\n");
                }
                if state.use_syslog {
                    syslog_line(libc::LOG_ERR | libc::LOG_USER, line.as_bytes());
                }
            }
        }
    }

    state.dest = new_dest;
    state.configured = true;
}

/// Closes the destination (once; the fd is owned by the `File`) and
/// returns the glitch log to its unconfigured state.
pub fn close() {
    let mut state = lock();
    state.dest = None;
    state.configured = false;
}
