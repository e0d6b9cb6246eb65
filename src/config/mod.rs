//! Configuration management for the OTA gateway

pub mod file;

use std::path::PathBuf;

use crate::gateway::DEFAULT_SESSION_BUFFER;

/// Port used when neither flag, env nor config file sets one
pub const DEFAULT_PORT: u16 = 8000;

/// Origins allowed when `ALLOWED_ORIGINS` is unset
pub const DEFAULT_ALLOWED_ORIGINS: &str = "http://localhost:3000,http://localhost:5173";

/// OTA gateway configuration
#[derive(Debug, Clone)]
pub struct Config {
    /// Port to listen on
    pub port: u16,

    /// Directory holding `devices.json`, `ota_logs.json` and `ota_results.json`
    pub data_dir: PathBuf,

    /// Origins allowed by CORS
    pub allowed_origins: Vec<String>,

    /// Outbound queue depth per session
    pub session_buffer: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            port: DEFAULT_PORT,
            data_dir: default_data_dir(),
            allowed_origins: parse_origins(DEFAULT_ALLOWED_ORIGINS),
            session_buffer: DEFAULT_SESSION_BUFFER,
        }
    }
}

/// Values taken from flags or the environment; these win over the config file
#[derive(Debug, Clone, Default)]
pub struct Overrides {
    pub port: Option<u16>,
    pub data_dir: Option<PathBuf>,
    pub allowed_origins: Option<String>,
}

impl Config {
    /// Load configuration: overrides, then the TOML file, then defaults
    #[must_use]
    pub fn load(overrides: Overrides) -> Self {
        Self::resolve(overrides, file::load_config_file())
    }

    /// Merge `overrides` over `fc` over defaults
    #[must_use]
    pub fn resolve(overrides: Overrides, fc: file::GatewayConfigFile) -> Self {
        let defaults = Self::default();

        let allowed_origins = overrides
            .allowed_origins
            .as_deref()
            .map(parse_origins)
            .or(fc.server.allowed_origins)
            .unwrap_or(defaults.allowed_origins);

        Self {
            port: overrides.port.or(fc.server.port).unwrap_or(defaults.port),
            data_dir: overrides
                .data_dir
                .or(fc.storage.data_dir)
                .unwrap_or(defaults.data_dir),
            allowed_origins,
            session_buffer: fc
                .server
                .session_buffer
                .filter(|n| *n > 0)
                .unwrap_or(defaults.session_buffer),
        }
    }
}

/// Default data directory: `<data_dir>/ota-gateway`
#[must_use]
pub fn default_data_dir() -> PathBuf {
    directories::BaseDirs::new()
        .map_or_else(|| PathBuf::from("."), |d| d.data_dir().join("ota-gateway"))
}

/// Split a comma-separated origin list, dropping blanks
#[must_use]
pub fn parse_origins(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|o| !o.is_empty())
        .map(ToString::to_string)
        .collect()
}
