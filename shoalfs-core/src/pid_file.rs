// Copyright 2021-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Pid-file management: a single ASCII decimal plus newline, removed again
//! when the process exits. Deletion is hooked through `atexit` because the
//! daemons have no single shutdown path that is guaranteed to run.

use crate::log_config::LogConfig;
use anyhow::Context;
use std::fs::OpenOptions;
use std::io::Write;
use std::os::unix::fs::OpenOptionsExt;
use std::path::PathBuf;
use std::sync::OnceLock;

static PID_PATH: OnceLock<PathBuf> = OnceLock::new();

extern "C" fn delete_pid_file_at_exit() {
    delete_pid_file();
}

/// Writes the pid file named by the configuration and registers its
/// removal at process exit. A configuration without a pid file is fine; a
/// second call is not.
pub fn create_pid_file(lc: &LogConfig) -> anyhow::Result<()> {
    let Some(path) = &lc.pid_file else {
        return Ok(());
    };
    anyhow::ensure!(PID_PATH.get().is_none(), "create_pid_file was called twice");

    let mut file = OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .mode(0o644)
        .open(path)
        .with_context(|| format!("failed to open pid file '{}'", path.display()))?;
    writeln!(file, "{}", std::process::id())
        .with_context(|| format!("failed to write pid file '{}'", path.display()))?;

    let _ = PID_PATH.set(path.clone());
    // Safety: delete_pid_file_at_exit touches only the immutable OnceLock.
    anyhow::ensure!(
        unsafe { libc::atexit(delete_pid_file_at_exit) } == 0,
        "failed to register pid-file cleanup"
    );
    Ok(())
}

/// Removes the pid file now. Harmless if none was ever written.
pub fn delete_pid_file() {
    if let Some(path) = PID_PATH.get() {
        let _ = std::fs::remove_file(path);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // PID_PATH is process-global and sticky, so the full lifecycle runs as
    // one test.
    #[test]
    fn test_pid_file_lifecycle() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("pid");
        let lc = LogConfig {
            pid_file: Some(path.clone()),
            ..Default::default()
        };

        create_pid_file(&lc).unwrap();
        let text = std::fs::read_to_string(&path).unwrap();
        assert_eq!(text, format!("{}\n", std::process::id()));

        // Second call is refused while the first registration stands.
        assert!(create_pid_file(&lc).is_err());

        delete_pid_file();
        assert!(!path.exists());
    }

    #[test]
    fn test_no_pid_file_configured_is_a_no_op() {
        create_pid_file(&LogConfig::default()).unwrap();
    }
}
