use std::env;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};
use tracing::warn;

/// How a plugin function call travels to the peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display, EnumString)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase", ascii_case_insensitive)]
pub enum CallMode {
    /// Structural JSON over the command stream only.
    Json,
    /// Shared memory first, falling back to JSON when a region cannot be used.
    Binary,
}

pub const DEFAULT_PRELOAD_VARIABLES: &[&str] = &[
    "@primary",
    "@secondary",
    "@base-color",
    "@text-color",
    "@background-color",
    "@font-family",
    "@font-size",
    "@base-font-size",
    "@line-height",
    "@spacing",
    "@border-radius",
    "@breakpoint",
];

#[derive(Debug, Clone, PartialEq)]
pub struct Config {
    pub mode: CallMode,
    pub peer_command: String,
    pub peer_args: Vec<String>,
    pub call_timeout: Duration,
    pub protocol_timeout: Duration,
    pub poll_interval: Duration,
    pub startup_timeout: Duration,
    pub shutdown_grace: Duration,
    pub cache_results: bool,
    pub preload_variables: Vec<String>,
    pub shm_capacity: Option<usize>,
    pub log_level: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            mode: CallMode::Binary,
            peer_command: "node".to_string(),
            peer_args: Vec::new(),
            call_timeout: Duration::from_secs(30),
            protocol_timeout: Duration::from_secs(5),
            poll_interval: Duration::from_micros(50),
            startup_timeout: Duration::from_secs(10),
            shutdown_grace: Duration::from_secs(2),
            cache_results: true,
            preload_variables: DEFAULT_PRELOAD_VARIABLES.iter().map(|s| s.to_string()).collect(),
            shm_capacity: None,
            log_level: "less_bridge=info".to_string(),
        }
    }
}

impl Config {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Builds a config from defaults overridden by whatever `lookup` returns for each variable.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = Self::default();

        if let Some(mode) = lookup("LESS_BRIDGE_IPC_MODE") {
            match mode.parse::<CallMode>() {
                Ok(mode) => config.mode = mode,
                Err(_) => warn!(value = %mode, "Invalid LESS_BRIDGE_IPC_MODE, using {}", config.mode),
            }
        }

        if let Some(command) = lookup("LESS_BRIDGE_NODE") {
            config.peer_command = command;
        }

        if let Some(args) = lookup("LESS_BRIDGE_PEER_ARGS") {
            config.peer_args = args.split_whitespace().map(str::to_string).collect();
        }

        parse_millis(&lookup, "LESS_BRIDGE_CALL_TIMEOUT_MS", &mut config.call_timeout);
        parse_millis(&lookup, "LESS_BRIDGE_PROTOCOL_TIMEOUT_MS", &mut config.protocol_timeout);
        parse_millis(&lookup, "LESS_BRIDGE_STARTUP_TIMEOUT_MS", &mut config.startup_timeout);
        parse_millis(&lookup, "LESS_BRIDGE_SHUTDOWN_GRACE_MS", &mut config.shutdown_grace);

        if let Some(value) = lookup("LESS_BRIDGE_POLL_INTERVAL_US") {
            match value.parse::<u64>() {
                Ok(micros) => config.poll_interval = Duration::from_micros(micros),
                Err(_) => warn!(value = %value, "Invalid LESS_BRIDGE_POLL_INTERVAL_US, using default"),
            }
        }

        if let Some(value) = lookup("LESS_BRIDGE_CACHE") {
            match value.to_lowercase().as_str() {
                "1" | "true" | "on" => config.cache_results = true,
                "0" | "false" | "off" => config.cache_results = false,
                _ => warn!(value = %value, "Invalid LESS_BRIDGE_CACHE, using default"),
            }
        }

        if let Some(value) = lookup("LESS_BRIDGE_PRELOAD_VARS") {
            config.preload_variables = value
                .split(',')
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect();
        }

        if let Some(value) = lookup("LESS_BRIDGE_SHM_LIMIT") {
            match value.parse::<usize>() {
                Ok(limit) => config.shm_capacity = Some(limit),
                Err(_) => warn!(value = %value, "Invalid LESS_BRIDGE_SHM_LIMIT, leaving shared memory unlimited"),
            }
        }

        if let Some(level) = lookup("RUST_LOG").or_else(|| lookup("LESS_BRIDGE_LOG")) {
            config.log_level = level;
        }

        config
    }
}

fn parse_millis(lookup: &impl Fn(&str) -> Option<String>, key: &str, target: &mut Duration) {
    if let Some(value) = lookup(key) {
        match value.parse::<u64>() {
            Ok(millis) => *target = Duration::from_millis(millis),
            Err(_) => warn!(key, value = %value, "Invalid timeout, using default {:?}", target),
        }
    }
}
