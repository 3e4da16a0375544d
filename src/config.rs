// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//!
//! Interfaces for parsing configuration files and working with the console
//! operator's configuration
//!

use camino::Utf8PathBuf;
use dropshot::{
    ConfigDropshot, ConfigLogging, ConfigLoggingLevel, HandlerTaskMode,
};
use serde::{Deserialize, Serialize};
use slog::{info, warn, Logger};
use std::net::{Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use thiserror::Error;

/// Operator tunables and collaborator addresses.
///
/// Defaults match a production deployment; a config file only needs to
/// name the values it overrides. The numeric tunables can additionally be
/// overridden through environment variables (with clamping) after load —
/// see [`OperatorConfig::apply_env_overrides`].
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
#[serde(default)]
pub struct OperatorConfig {
    /// Hard cap of mountain-class consoles a single worker will hold.
    pub max_mtn_nodes_per_worker: i64,
    /// Hard cap of river-class consoles a single worker will hold.
    pub max_rvr_nodes_per_worker: i64,
    /// Seconds between hardware-reconcile ticks.
    pub hardware_update_sec: u64,
    /// Seconds between heartbeat-staleness checks.
    pub heartbeat_check_sec: u64,
    /// Age in minutes past which a worker's node claims are considered stale.
    pub heartbeat_stale_minutes: u64,
    /// Debug-only mode; set from the `DEBUG` env var or the CLI flag.
    pub debug_only: bool,
    /// Base URL of the hardware state manager.
    pub hsm_base: String,
    /// Base URL of the console-data service.
    pub console_data_base: String,
    /// Base URL of the tenancy service.
    pub tapms_base: String,
    /// Namespace holding the worker set.
    pub worker_namespace: String,
    /// Name of the replicated worker set (also the worker pod name prefix).
    pub worker_set_name: String,
    /// Container within a worker pod that holds the console sessions.
    pub worker_container: String,
    /// Shared-volume file through which per-worker budgets are published.
    pub budget_file: Utf8PathBuf,
    /// External program that pre-stages console access keys on
    /// mountain-class hardware.
    pub key_deploy_program: Utf8PathBuf,
}

impl Default for OperatorConfig {
    fn default() -> Self {
        Self {
            max_mtn_nodes_per_worker: 750,
            max_rvr_nodes_per_worker: 2000,
            hardware_update_sec: 30,
            heartbeat_check_sec: 15,
            heartbeat_stale_minutes: 3,
            debug_only: false,
            hsm_base: "http://cray-smd".to_string(),
            console_data_base: "http://cray-console-data/v1".to_string(),
            tapms_base: "http://cray-tapms/v1alpha3".to_string(),
            worker_namespace: "services".to_string(),
            worker_set_name: "cray-console-node".to_string(),
            worker_container: "cray-console-node".to_string(),
            budget_file: Utf8PathBuf::from("/var/log/console/TargetNodes.txt"),
            key_deploy_program: Utf8PathBuf::from(
                "/app/deploy-console-keys.sh",
            ),
        }
    }
}

impl OperatorConfig {
    /// Apply environment-variable overrides with min/max clamping.
    ///
    /// Unparsable values are logged and ignored; out-of-range values are
    /// clamped to the nearer bound.
    pub fn apply_env_overrides(&mut self, log: &Logger) {
        env_override_int(
            "MAX_MTN_NODES_PER_POD",
            &mut self.max_mtn_nodes_per_worker,
            5,
            1500,
            log,
        );
        env_override_int(
            "MAX_RVR_NODES_PER_POD",
            &mut self.max_rvr_nodes_per_worker,
            5,
            4000,
            log,
        );
        // 10 sec -> 4 hrs
        env_override_int(
            "HARDWARE_UPDATE_SEC_FREQ",
            &mut self.hardware_update_sec,
            10,
            14400,
            log,
        );
        // 10 sec -> 5 min
        env_override_int(
            "HEARTBEAT_CHECK_SEC_FREQ",
            &mut self.heartbeat_check_sec,
            10,
            300,
            log,
        );
        // 1 min -> 60 min
        env_override_int(
            "HEARTBEAT_STALE_DURATION_MINUTES",
            &mut self.heartbeat_stale_minutes,
            1,
            60,
            log,
        );
        if std::env::var("DEBUG").as_deref() == Ok("TRUE") {
            info!(log, "running in DEBUG-ONLY mode");
            self.debug_only = true;
        }
    }
}

/// Read a single integer env variable into `out` with min/max clamping.
fn env_override_int<T>(
    env_var: &str,
    out: &mut T,
    min_val: T,
    max_val: T,
    log: &Logger,
) where
    T: Copy + Ord + std::str::FromStr + std::fmt::Display,
{
    let Ok(raw) = std::env::var(env_var) else {
        return;
    };
    if raw.is_empty() {
        return;
    }
    info!(log, "found env var override"; "var" => env_var, "value" => &raw);
    let Ok(mut value) = raw.parse::<T>() else {
        warn!(
            log, "error converting env var value; expected an integer";
            "var" => env_var,
            "value" => &raw,
        );
        return;
    };
    if value < min_val {
        warn!(
            log, "defaulting env var to minimum value";
            "var" => env_var,
            "min" => %min_val,
        );
        value = min_val;
    }
    if value > max_val {
        warn!(
            log, "defaulting env var to maximum value";
            "var" => env_var,
            "max" => %max_val,
        );
        value = max_val;
    }
    *out = value;
}

/// Configuration for the console operator server
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct Config {
    /// Dropshot configuration for the API server
    #[serde(default = "default_dropshot")]
    pub dropshot: ConfigDropshot,
    /// Server-wide logging configuration.
    #[serde(default = "default_logging")]
    pub log: ConfigLogging,
    /// Operator tunables.
    #[serde(default)]
    pub operator: OperatorConfig,
}

fn default_dropshot() -> ConfigDropshot {
    ConfigDropshot {
        bind_address: SocketAddr::from((Ipv4Addr::UNSPECIFIED, 26777)),
        default_handler_task_mode: HandlerTaskMode::Detached,
        ..Default::default()
    }
}

fn default_logging() -> ConfigLogging {
    ConfigLogging::StderrTerminal { level: ConfigLoggingLevel::Info }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            dropshot: default_dropshot(),
            log: default_logging(),
            operator: OperatorConfig::default(),
        }
    }
}

impl Config {
    /// Load a `Config` from the given TOML file
    pub fn from_file(path: &Utf8PathBuf) -> Result<Config, LoadError> {
        let file_contents = std::fs::read_to_string(path)
            .map_err(|e| (path.clone().into_std_path_buf(), e))?;
        let config_parsed: Config = toml::from_str(&file_contents)
            .map_err(|e| (path.clone().into_std_path_buf(), e))?;
        Ok(config_parsed)
    }
}

#[derive(Debug, Error)]
pub enum LoadError {
    #[error("error reading \"{}\": {}", path.display(), err)]
    Io { path: PathBuf, err: std::io::Error },
    #[error("error parsing \"{}\": {}", path.display(), err)]
    Parse { path: PathBuf, err: toml::de::Error },
}

impl From<(PathBuf, std::io::Error)> for LoadError {
    fn from((path, err): (PathBuf, std::io::Error)) -> Self {
        LoadError::Io { path, err }
    }
}

impl From<(PathBuf, toml::de::Error)> for LoadError {
    fn from((path, err): (PathBuf, toml::de::Error)) -> Self {
        LoadError::Parse { path, err }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use slog::o;

    fn test_logger() -> Logger {
        Logger::root(slog::Discard, o!())
    }

    #[test]
    fn defaults_are_complete() {
        let config: Config = toml::from_str("").unwrap();
        assert_eq!(config.operator, OperatorConfig::default());
        assert_eq!(config.dropshot.bind_address.port(), 26777);
    }

    #[test]
    fn partial_file_overrides_only_named_values() {
        let config: Config = toml::from_str(
            r#"
            [operator]
            hardware_update_sec = 120
            hsm_base = "http://hsm.test"
            "#,
        )
        .unwrap();
        assert_eq!(config.operator.hardware_update_sec, 120);
        assert_eq!(config.operator.hsm_base, "http://hsm.test");
        assert_eq!(config.operator.max_rvr_nodes_per_worker, 2000);
    }

    // Env var tests mutate process-global state; each test uses its own
    // variable name so they can run concurrently.
    #[test]
    fn env_override_clamps_low() {
        let mut out: u64 = 30;
        std::env::set_var("HARDWARE_UPDATE_SEC_FREQ_TEST_LO", "3");
        env_override_int(
            "HARDWARE_UPDATE_SEC_FREQ_TEST_LO",
            &mut out,
            10,
            14400,
            &test_logger(),
        );
        assert_eq!(out, 10);
    }

    #[test]
    fn env_override_clamps_high() {
        let mut out: i64 = 750;
        std::env::set_var("MAX_MTN_NODES_PER_POD_TEST_HI", "99999");
        env_override_int(
            "MAX_MTN_NODES_PER_POD_TEST_HI",
            &mut out,
            5,
            1500,
            &test_logger(),
        );
        assert_eq!(out, 1500);
    }

    #[test]
    fn env_override_ignores_garbage() {
        let mut out: i64 = 2000;
        std::env::set_var("MAX_RVR_NODES_PER_POD_TEST_BAD", "lots");
        env_override_int(
            "MAX_RVR_NODES_PER_POD_TEST_BAD",
            &mut out,
            5,
            4000,
            &test_logger(),
        );
        assert_eq!(out, 2000);
    }

    #[test]
    fn env_override_in_range() {
        let mut out: u64 = 15;
        std::env::set_var("HEARTBEAT_CHECK_SEC_FREQ_TEST_OK", "45");
        env_override_int(
            "HEARTBEAT_CHECK_SEC_FREQ_TEST_OK",
            &mut out,
            10,
            300,
            &test_logger(),
        );
        assert_eq!(out, 45);
    }
}
