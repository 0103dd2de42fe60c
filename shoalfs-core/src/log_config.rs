// Copyright 2021-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Logging/runtime paths shared by every daemon's configuration.
//!
//! Every field is optional in the JSON document; absent fields stay `None`
//! through a load→save round trip. [`harmonize_log_config`] then fills the
//! gaps from `base_dir` so the rest of the code never sees a missing path.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Which daemon this configuration belongs to. The monitor is the only one
/// with an observer socket.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum DaemonKind {
    /// Metadata server.
    Mds,
    /// Object storage daemon.
    Osd,
    /// Cluster monitor.
    Mon,
    /// Remote-semaphore coordinator.
    Rsemd,
}

#[derive(Clone, Debug, Default, Deserialize, PartialEq, Serialize)]
pub struct LogConfig {
    /// Directory that anchors every defaulted path below.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base_dir: Option<PathBuf>,
    /// Where the fatal-signal handler writes its post-mortem.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub crash_log: Option<PathBuf>,
    /// The operator-facing error log.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub glitch_log: Option<PathBuf>,
    /// Pid file, unlinked on process exit.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pid_file: Option<PathBuf>,
    /// UNIX-domain socket the monitor's observers connect to.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub socket_path: Option<PathBuf>,
    /// Mirror glitch-log lines to syslog.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub use_syslog: Option<bool>,
}

#[derive(Debug, Eq, PartialEq, thiserror::Error)]
pub enum ConfigError {
    #[error("you must specify {field}, or set base_dir")]
    MissingPath { field: &'static str },
}

fn resolve(
    field: &'static str,
    default_name: &str,
    slot: &mut Option<PathBuf>,
    base_dir: &Option<PathBuf>,
) -> Result<(), ConfigError> {
    if slot.is_some() {
        return Ok(());
    }
    match base_dir {
        Some(dir) => {
            *slot = Some(dir.join(default_name));
            Ok(())
        }
        None => Err(ConfigError::MissingPath { field }),
    }
}

/// Fills defaulted paths from `base_dir` and defaults `use_syslog` off.
/// After this returns `Ok`, `crash_log`, `glitch_log` and `pid_file` are
/// always set, and `socket_path` is set for the monitor.
pub fn harmonize_log_config(lc: &mut LogConfig, kind: DaemonKind) -> Result<(), ConfigError> {
    resolve("crash_log", "crash.log", &mut lc.crash_log, &lc.base_dir)?;
    resolve("glitch_log", "glitch.log", &mut lc.glitch_log, &lc.base_dir)?;
    resolve("pid_file", "pid", &mut lc.pid_file, &lc.base_dir)?;
    if kind == DaemonKind::Mon {
        resolve("socket_path", "socket", &mut lc.socket_path, &lc.base_dir)?;
    }
    if lc.use_syslog.is_none() {
        lc.use_syslog = Some(false);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_harmonize_fills_defaults_from_base_dir() {
        let mut lc = LogConfig {
            base_dir: Some(PathBuf::from("/srv/shoalfs")),
            ..Default::default()
        };
        harmonize_log_config(&mut lc, DaemonKind::Mon).unwrap();
        assert_eq!(lc.crash_log, Some(PathBuf::from("/srv/shoalfs/crash.log")));
        assert_eq!(lc.glitch_log, Some(PathBuf::from("/srv/shoalfs/glitch.log")));
        assert_eq!(lc.pid_file, Some(PathBuf::from("/srv/shoalfs/pid")));
        assert_eq!(lc.socket_path, Some(PathBuf::from("/srv/shoalfs/socket")));
        assert_eq!(lc.use_syslog, Some(false));
    }

    #[test]
    fn test_explicit_paths_win_over_base_dir() {
        let mut lc = LogConfig {
            base_dir: Some(PathBuf::from("/srv/shoalfs")),
            crash_log: Some(PathBuf::from("/var/log/crash.special")),
            ..Default::default()
        };
        harmonize_log_config(&mut lc, DaemonKind::Rsemd).unwrap();
        assert_eq!(
            lc.crash_log,
            Some(PathBuf::from("/var/log/crash.special"))
        );
        // No observer socket for the semaphore daemon.
        assert_eq!(lc.socket_path, None);
    }

    #[test]
    fn test_missing_base_dir_is_an_error() {
        let mut lc = LogConfig::default();
        let err = harmonize_log_config(&mut lc, DaemonKind::Osd).unwrap_err();
        assert_eq!(err, ConfigError::MissingPath { field: "crash_log" });
    }

    #[test]
    fn test_absent_fields_survive_a_round_trip() {
        let lc = LogConfig {
            glitch_log: Some(PathBuf::from("/tmp/g.log")),
            ..Default::default()
        };
        let text = serde_json::to_string(&lc).unwrap();
        // Only the populated field is serialized at all.
        assert!(!text.contains("crash_log"));
        let back: LogConfig = serde_json::from_str(&text).unwrap();
        assert_eq!(back, lc);
    }
}
