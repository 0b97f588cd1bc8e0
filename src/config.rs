//! Configuration management for the exporter
//!
//! The configuration document lists the listen address and the targets to
//! monitor. It is re-read on every refresh, so edits take effect without a
//! restart.
//!
//! **YAML Format:**
//! ```yaml
//! bind: ":9123"
//! redis:
//!   - "127.0.0.1:6379 cache-a"
//! predixy:
//!   - "127.0.0.1:7617 proxy-a"
//! ```
//!
//! JSON (`.json`) and TOML (`.toml`) documents with the same fields are
//! accepted as well.

use crate::target::{parse_section, Target, TargetError, TargetKind};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Default configuration file looked up in the working directory
pub const DEFAULT_CONFIG_FILE: &str = "cacheeasy_exporter.yml";

/// Listen address used when neither the CLI nor the document sets one
pub const DEFAULT_BIND: &str = ":9123";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {}: {source}", .path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse config file {}: {message}", .path.display())]
    Parse { path: PathBuf, message: String },
}

/// Exporter configuration document
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExporterConfig {
    /// Listen address for the metrics endpoint
    #[serde(default)]
    pub bind: String,
    /// Redis servers, `"<address> <name>"` per entry
    #[serde(default)]
    pub redis: Vec<String>,
    /// Predixy proxies, `"<address> <name>"` per entry
    #[serde(default)]
    pub predixy: Vec<String>,
}

impl ExporterConfig {
    /// Desired targets in document order: redis entries first, then predixy.
    ///
    /// Malformed lines are skipped and returned separately.
    pub fn targets(&self) -> (Vec<Target>, Vec<TargetError>) {
        let (mut targets, mut skipped) = parse_section(TargetKind::CacheServer, &self.redis);
        let (proxies, proxy_skipped) = parse_section(TargetKind::Proxy, &self.predixy);
        targets.extend(proxies);
        skipped.extend(proxy_skipped);
        (targets, skipped)
    }

    /// Resolve the listen address: CLI override, then document, then default
    pub fn resolve_bind(&self, cli_bind: Option<&str>) -> String {
        match cli_bind {
            Some(bind) if !bind.is_empty() => bind.to_string(),
            _ if !self.bind.is_empty() => self.bind.clone(),
            _ => DEFAULT_BIND.to_string(),
        }
    }
}

/// Load the configuration document, picking the format from the file extension
pub fn load_config(path: &Path) -> Result<ExporterConfig, ConfigError> {
    let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: path.to_path_buf(),
        source,
    })?;

    let parse_err = |message: String| ConfigError::Parse {
        path: path.to_path_buf(),
        message,
    };

    let config: ExporterConfig = match path.extension().and_then(|ext| ext.to_str()) {
        Some("json") => serde_json::from_str(&contents).map_err(|e| parse_err(e.to_string()))?,
        Some("toml") => toml::from_str(&contents).map_err(|e| parse_err(e.to_string()))?,
        // An empty YAML document is a valid, empty configuration
        _ if contents.trim().is_empty() => ExporterConfig::default(),
        _ => serde_yaml::from_str(&contents).map_err(|e| parse_err(e.to_string()))?,
    };

    Ok(config)
}

/// Turn a bind string into something `TcpListener::bind` accepts.
///
/// A bare `:port` listens on every interface.
pub fn listen_address(bind: &str) -> String {
    if bind.starts_with(':') {
        format!("0.0.0.0{}", bind)
    } else {
        bind.to_string()
    }
}
