// Copyright 2021-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! rsem configuration schemas. Loaded from JSON; every omitted field is
//! genuinely absent (`None` / empty), and defaults are filled by the
//! harmonize pass at daemon startup, not by the deserializer.

use crate::RsemError;
use serde::{Deserialize, Serialize};
use shoalfs_core::log_config::LogConfig;

/// One semaphore the server hosts.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct SemConfig {
    pub name: String,
    pub init_val: u32,
}

/// Configuration for `shoalrsemd`.
#[derive(Clone, Debug, Default, Deserialize, PartialEq, Serialize)]
pub struct RsemServerConfig {
    /// TCP port the server listens on. 0 lets the kernel pick (tests).
    #[serde(default)]
    pub port: u16,
    /// The semaphores this deployment defines. Fixed at startup.
    #[serde(default)]
    pub sems: Vec<SemConfig>,
    /// Logging and pid-file paths.
    #[serde(default)]
    pub lc: LogConfig,
}

/// Configuration for the client side of rsem.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct RsemClientConfig {
    pub srv_host: String,
    pub srv_port: u16,
    /// Inclusive range of local ports used to listen for grant callbacks.
    pub cli_port_start: u16,
    pub cli_port_end: u16,
}

/// Hard cap on the callback-port range; a client holding more than this
/// many concurrent blocked takes is misconfigured, not busy.
pub const MAX_CLI_PORTS: usize = 1000;

impl RsemClientConfig {
    pub(crate) fn validate(&self) -> Result<(), RsemError> {
        if self.cli_port_start > self.cli_port_end {
            return Err(RsemError::Config(format!(
                "cli_port_start was {}, but cli_port_end was {}",
                self.cli_port_start, self.cli_port_end
            )));
        }
        let count = 1 + (self.cli_port_end - self.cli_port_start) as usize;
        if count > MAX_CLI_PORTS {
            return Err(RsemError::Config(format!(
                "can't allocate more than {MAX_CLI_PORTS} client ports"
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_server_config_parses_minimal_json() {
        let conf: RsemServerConfig = serde_json::from_str(
            r#"{
                "port": 30000,
                "sems": [
                    {"name": "foo", "init_val": 1},
                    {"name": "bar", "init_val": 0}
                ],
                "lc": {"base_dir": "/srv/shoalfs/rsemd"}
            }"#,
        )
        .unwrap();
        assert_eq!(conf.port, 30000);
        assert_eq!(conf.sems.len(), 2);
        assert_eq!(conf.sems[1].init_val, 0);
        assert!(conf.lc.crash_log.is_none());
    }

    #[test]
    fn test_server_config_round_trips_absent_fields() {
        let conf = RsemServerConfig {
            port: 7,
            ..Default::default()
        };
        let text = serde_json::to_string(&conf).unwrap();
        let back: RsemServerConfig = serde_json::from_str(&text).unwrap();
        assert_eq!(back, conf);
    }

    #[test]
    fn test_client_config_validation() {
        let mut conf = RsemClientConfig {
            srv_host: "localhost".into(),
            srv_port: 30000,
            cli_port_start: 30001,
            cli_port_end: 30005,
        };
        conf.validate().unwrap();

        conf.cli_port_start = 30006;
        assert!(matches!(conf.validate(), Err(RsemError::Config(_))));

        conf.cli_port_start = 20000;
        conf.cli_port_end = 29999;
        assert!(matches!(conf.validate(), Err(RsemError::Config(_))));
    }
}
