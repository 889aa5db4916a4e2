/*
 * Copyright 2020 Joyent, Inc.
 */

//! Server configuration, read once at start-up.
//!
//! Values come from an optional TOML file and are then overridden from the
//! environment:
//!
//! * `DATASERVE_OS` (falling back to `OSTYPE`) sets the OS name
//! * `DATASERVE_CONFIG_ID` sets the configuration id
//! * `DATASERVE_PROXY` sets the proxy target
//! * `DATASERVE_THIS` sets this server's own address

use std::fs;
use std::io;
use std::net::SocketAddr;
use std::path::Path;

use serde_derive::{Deserialize, Serialize};

use crate::protocol::DEFAULT_MAX_RECORD_SIZE;

pub const SERVER_VERSION: i32 = 9;
/// Clients at or below this version are served by the legacy engine.
pub const LEGACY_SERVER_VERSION: i32 = 6;
pub const DEFAULT_TIMEOUT_SECS: u64 = 600;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub listen: SocketAddr,
    pub server_version: i32,
    pub legacy_version: i32,
    /// Idle timeout used when a client asks for one longer than this.
    pub max_timeout_secs: u64,
    pub file_cache_capacity: usize,
    pub max_record_size: usize,
    /// Forward every request through this server, `host[:port]`.
    pub proxy: Option<String>,
    /// Address other servers use to reach this one.
    pub this_server: Option<String>,
    pub api_delimiter: String,
    pub os_name: String,
    pub config_id: String,
}

impl Default for ServerConfig {
    fn default() -> ServerConfig {
        ServerConfig {
            listen: SocketAddr::from(([127, 0, 0, 1], 56565)),
            server_version: SERVER_VERSION,
            legacy_version: LEGACY_SERVER_VERSION,
            max_timeout_secs: DEFAULT_TIMEOUT_SECS,
            file_cache_capacity: crate::cache::DEFAULT_CAPACITY,
            max_record_size: DEFAULT_MAX_RECORD_SIZE,
            proxy: None,
            this_server: None,
            api_delimiter: "::".to_string(),
            os_name: String::new(),
            config_id: String::new(),
        }
    }
}

impl ServerConfig {
    /// Read `path` if it exists, else start from defaults, then apply the
    /// process environment.
    pub fn load(path: &Path) -> io::Result<ServerConfig> {
        let mut cfg = if path.exists() {
            ServerConfig::parse(&fs::read_to_string(path)?)?
        } else {
            ServerConfig::default()
        };
        cfg.apply_env(|key| std::env::var(key).ok());
        Ok(cfg)
    }

    pub fn parse(text: &str) -> io::Result<ServerConfig> {
        let cfg: ServerConfig = toml::from_str(text)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn apply_env<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(os) = lookup("DATASERVE_OS").or_else(|| lookup("OSTYPE")) {
            self.os_name = os;
        }
        if let Some(id) = lookup("DATASERVE_CONFIG_ID") {
            self.config_id = id;
        }
        if let Some(proxy) = lookup("DATASERVE_PROXY") {
            self.proxy = Some(proxy).filter(|p| !p.is_empty());
        }
        if let Some(this) = lookup("DATASERVE_THIS") {
            self.this_server = Some(this).filter(|t| !t.is_empty());
        }
    }

    fn validate(&self) -> io::Result<()> {
        let invalid = |msg: &str| {
            Err(io::Error::new(io::ErrorKind::InvalidData, msg.to_string()))
        };
        if self.legacy_version >= self.server_version {
            return invalid("legacy_version must be below server_version");
        }
        if self.api_delimiter.is_empty() {
            return invalid("api_delimiter must not be empty");
        }
        if self.max_record_size == 0 {
            return invalid("max_record_size must be positive");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::collections::HashMap;
    use std::io::Write;

    use tempfile::NamedTempFile;

    #[test]
    fn missing_keys_use_defaults() {
        let cfg = ServerConfig::parse("server_version = 7\n").unwrap();
        assert_eq!(cfg.server_version, 7);
        assert_eq!(cfg.legacy_version, LEGACY_SERVER_VERSION);
        assert_eq!(cfg.api_delimiter, "::");
    }

    #[test]
    fn inconsistent_versions_are_rejected() {
        let err = ServerConfig::parse("server_version = 6\nlegacy_version = 6\n")
            .unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }

    #[test]
    fn environment_overrides_file_values() {
        let mut cfg = ServerConfig::parse(
            "os_name = \"file-os\"\nproxy = \"a:1\"\nconfig_id = \"file\"\n",
        )
        .unwrap();
        let env: HashMap<&str, &str> = [
            ("OSTYPE", "linux-gnu"),
            ("DATASERVE_CONFIG_ID", "site-b"),
            ("DATASERVE_PROXY", ""),
        ]
        .iter()
        .cloned()
        .collect();
        cfg.apply_env(|k| env.get(k).map(|v| v.to_string()));

        assert_eq!(cfg.os_name, "linux-gnu");
        assert_eq!(cfg.config_id, "site-b");
        assert_eq!(cfg.proxy, None);
    }

    #[test]
    fn load_reads_toml_files() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "listen = \"0.0.0.0:7000\"").unwrap();
        writeln!(file, "file_cache_capacity = 8").unwrap();

        let cfg = ServerConfig::load(file.path()).unwrap();
        assert_eq!(cfg.listen.port(), 7000);
        assert_eq!(cfg.file_cache_capacity, 8);
    }
}
