//! TOML configuration file loading
//!
//! Supports `~/.config/ota-gateway/config.toml` as a persistent config source.
//! All fields are optional; the file is a partial overlay on top of defaults.

use std::path::{Path, PathBuf};

use serde::Deserialize;

/// Top-level TOML configuration file schema
#[derive(Debug, Default, Deserialize)]
pub struct GatewayConfigFile {
    /// Server/runtime configuration
    #[serde(default)]
    pub server: ServerFileConfig,

    /// Document store configuration
    #[serde(default)]
    pub storage: StorageFileConfig,
}

/// Server/runtime configuration
#[derive(Debug, Default, Deserialize)]
pub struct ServerFileConfig {
    /// API server port
    pub port: Option<u16>,

    /// Origins allowed by CORS
    pub allowed_origins: Option<Vec<String>>,

    /// Outbound queue depth per session
    pub session_buffer: Option<usize>,
}

/// Document store configuration
#[derive(Debug, Default, Deserialize)]
pub struct StorageFileConfig {
    /// Directory holding the JSON documents
    pub data_dir: Option<PathBuf>,
}

/// Load the TOML config file from the standard path
///
/// Returns `GatewayConfigFile::default()` if the file doesn't exist or can't be parsed.
pub fn load_config_file() -> GatewayConfigFile {
    config_file_path().map_or_else(GatewayConfigFile::default, |path| load_from(&path))
}

/// Load a TOML config file from `path`, falling back to defaults
pub fn load_from(path: &Path) -> GatewayConfigFile {
    if !path.exists() {
        return GatewayConfigFile::default();
    }

    match std::fs::read_to_string(path) {
        Ok(content) => match toml::from_str(&content) {
            Ok(config) => {
                tracing::info!(path = %path.display(), "loaded config file");
                config
            }
            Err(e) => {
                tracing::warn!(
                    path = %path.display(),
                    error = %e,
                    "failed to parse config file, using defaults"
                );
                GatewayConfigFile::default()
            }
        },
        Err(e) => {
            tracing::warn!(
                path = %path.display(),
                error = %e,
                "failed to read config file"
            );
            GatewayConfigFile::default()
        }
    }
}

/// Return the config file path: `~/.config/ota-gateway/config.toml`
pub fn config_file_path() -> Option<PathBuf> {
    directories::BaseDirs::new().map(|d| d.config_dir().join("ota-gateway").join("config.toml"))
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;

    #[test]
    fn partial_file_parses() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[server]\nport = 9100\n").unwrap();

        let config = load_from(file.path());
        assert_eq!(config.server.port, Some(9100));
        assert!(config.server.allowed_origins.is_none());
        assert!(config.storage.data_dir.is_none());
    }

    #[test]
    fn unparseable_file_falls_back_to_defaults() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[server\nport = ").unwrap();

        let config = load_from(file.path());
        assert!(config.server.port.is_none());
    }

    #[test]
    fn missing_file_is_default() {
        let config = load_from(Path::new("/nonexistent/ota-gateway/config.toml"));
        assert!(config.server.port.is_none());
    }
}
