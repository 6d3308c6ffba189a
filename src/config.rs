//! Configuration for OrionKV
//!
//! Centralized configuration with sensible defaults, a builder, and a
//! plain-text config file reader (`key value` lines, `#` comments).

use std::fs;
use std::path::Path;

use crate::error::{OrionError, Result};

/// Main configuration for an OrionKV instance
#[derive(Debug, Clone)]
pub struct Config {
    // -------------------------------------------------------------------------
    // Network Configuration
    // -------------------------------------------------------------------------
    /// TCP listen port
    pub port: u16,

    /// TCP bind address
    pub bind_address: String,

    // -------------------------------------------------------------------------
    // Snapshot Configuration
    // -------------------------------------------------------------------------
    pub rdb: RdbOptions,

    // -------------------------------------------------------------------------
    // Append-Log Configuration
    // -------------------------------------------------------------------------
    pub aof: AofOptions,

    // -------------------------------------------------------------------------
    // Replication Configuration
    // -------------------------------------------------------------------------
    pub replica: ReplicaOptions,
}

/// Snapshot (RDB) behavior
#[derive(Debug, Clone)]
pub struct RdbOptions {
    /// Whether snapshots are read on startup and written on save triggers
    pub enabled: bool,

    /// Directory holding the snapshot file
    pub dir: String,

    /// Snapshot file name within `dir`
    pub filename: String,

    /// Periodic save interval in seconds (0 disables timed saves)
    pub save_interval_seconds: u64,
}

/// Append-log (AOF) behavior
#[derive(Debug, Clone)]
pub struct AofOptions {
    /// Whether every mutating command is appended to the log
    pub enabled: bool,

    /// Log file path
    pub path: String,

    /// How aggressively the writer fsyncs
    pub mode: AofMode,

    /// Pending-byte threshold that forces an early fsync in every-second mode
    pub rewrite_threshold_bytes: u64,
}

/// Fsync policy for the append log
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AofMode {
    /// fsync after every record, before the client is acknowledged
    Always,

    /// fsync when more than a second has passed or pending bytes pile up
    EverySecond,

    /// never fsync; the OS flushes on its own schedule
    NoFsync,
}

/// Client-side replication behavior
#[derive(Debug, Clone)]
pub struct ReplicaOptions {
    /// Whether this node follows a primary
    pub enabled: bool,

    /// Primary host to connect to
    pub master_host: String,

    /// Primary port to connect to
    pub master_port: u16,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            port: 6379,
            bind_address: "127.0.0.1".to_string(),
            rdb: RdbOptions {
                enabled: true,
                dir: "./data".to_string(),
                filename: "dump.mrdb".to_string(),
                save_interval_seconds: 0,
            },
            aof: AofOptions {
                enabled: false,
                path: "./data/appendonly.aof".to_string(),
                mode: AofMode::EverySecond,
                rewrite_threshold_bytes: 64 * 1024 * 1024,
            },
            replica: ReplicaOptions {
                enabled: false,
                master_host: "127.0.0.1".to_string(),
                master_port: 6379,
            },
        }
    }
}

impl Config {
    /// Create a new config builder
    pub fn builder() -> ConfigBuilder {
        ConfigBuilder::default()
    }

    /// Load configuration from a plain-text file.
    ///
    /// Lines are `key value` pairs; blank lines and `#` comments are skipped.
    /// Keys use the dotted names (`rdb.enabled`, `aof.mode`, ...). Unknown
    /// keys are rejected so typos do not silently fall back to defaults.
    pub fn from_file(path: &Path) -> Result<Self> {
        let mut config = Config::default();
        let text = fs::read_to_string(path)
            .map_err(|e| OrionError::Config(format!("cannot read {}: {}", path.display(), e)))?;
        config.apply_file_text(&text)?;
        Ok(config)
    }

    fn apply_file_text(&mut self, text: &str) -> Result<()> {
        for (lineno, raw) in text.lines().enumerate() {
            let line = raw.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let (key, value) = line.split_once(char::is_whitespace).ok_or_else(|| {
                OrionError::Config(format!("line {}: expected 'key value'", lineno + 1))
            })?;
            let value = value.trim();
            self.apply_option(key, value)
                .map_err(|e| OrionError::Config(format!("line {}: {}", lineno + 1, e)))?;
        }
        Ok(())
    }

    fn apply_option(&mut self, key: &str, value: &str) -> std::result::Result<(), String> {
        match key {
            "port" => self.port = parse(key, value)?,
            "bind_address" => self.bind_address = value.to_string(),
            "rdb.enabled" => self.rdb.enabled = parse_bool(key, value)?,
            "rdb.dir" => self.rdb.dir = value.to_string(),
            "rdb.filename" => self.rdb.filename = value.to_string(),
            "rdb.save_interval_seconds" => self.rdb.save_interval_seconds = parse(key, value)?,
            "aof.enabled" => self.aof.enabled = parse_bool(key, value)?,
            "aof.path" => self.aof.path = value.to_string(),
            "aof.mode" => {
                self.aof.mode = match value {
                    "always" => AofMode::Always,
                    "every-second" => AofMode::EverySecond,
                    "no-fsync" => AofMode::NoFsync,
                    other => return Err(format!("invalid aof.mode '{}'", other)),
                }
            }
            "aof.rewrite_threshold_bytes" => {
                self.aof.rewrite_threshold_bytes = parse(key, value)?
            }
            "replica.enabled" => self.replica.enabled = parse_bool(key, value)?,
            "replica.master_host" => self.replica.master_host = value.to_string(),
            "replica.master_port" => self.replica.master_port = parse(key, value)?,
            other => return Err(format!("unknown option '{}'", other)),
        }
        Ok(())
    }

    /// Full path of the snapshot file
    pub fn rdb_path(&self) -> std::path::PathBuf {
        Path::new(&self.rdb.dir).join(&self.rdb.filename)
    }

    /// Listen address in `host:port` form
    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.bind_address, self.port)
    }
}

fn parse<T: std::str::FromStr>(key: &str, value: &str) -> std::result::Result<T, String> {
    value
        .parse()
        .map_err(|_| format!("invalid value '{}' for {}", value, key))
}

fn parse_bool(key: &str, value: &str) -> std::result::Result<bool, String> {
    match value {
        "yes" | "true" | "1" => Ok(true),
        "no" | "false" | "0" => Ok(false),
        other => Err(format!("invalid value '{}' for {}", other, key)),
    }
}

/// Builder for Config
#[derive(Default)]
pub struct ConfigBuilder {
    config: Config,
}

impl ConfigBuilder {
    pub fn port(mut self, port: u16) -> Self {
        self.config.port = port;
        self
    }

    pub fn bind_address(mut self, addr: &str) -> Self {
        self.config.bind_address = addr.to_string();
        self
    }

    pub fn rdb_enabled(mut self, enabled: bool) -> Self {
        self.config.rdb.enabled = enabled;
        self
    }

    pub fn rdb_dir(mut self, dir: impl AsRef<Path>) -> Self {
        self.config.rdb.dir = dir.as_ref().to_string_lossy().into_owned();
        self
    }

    pub fn rdb_filename(mut self, name: &str) -> Self {
        self.config.rdb.filename = name.to_string();
        self
    }

    pub fn rdb_save_interval_seconds(mut self, secs: u64) -> Self {
        self.config.rdb.save_interval_seconds = secs;
        self
    }

    pub fn aof_enabled(mut self, enabled: bool) -> Self {
        self.config.aof.enabled = enabled;
        self
    }

    pub fn aof_path(mut self, path: impl AsRef<Path>) -> Self {
        self.config.aof.path = path.as_ref().to_string_lossy().into_owned();
        self
    }

    pub fn aof_mode(mut self, mode: AofMode) -> Self {
        self.config.aof.mode = mode;
        self
    }

    pub fn aof_rewrite_threshold_bytes(mut self, bytes: u64) -> Self {
        self.config.aof.rewrite_threshold_bytes = bytes;
        self
    }

    pub fn replica_of(mut self, host: &str, port: u16) -> Self {
        self.config.replica.enabled = true;
        self.config.replica.master_host = host.to_string();
        self.config.replica.master_port = port;
        self
    }

    pub fn build(self) -> Config {
        self.config
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_config_default() {
        let config = Config::default();

        assert_eq!(config.port, 6379);
        assert_eq!(config.bind_address, "127.0.0.1");
        assert!(config.rdb.enabled);
        assert_eq!(config.rdb.filename, "dump.mrdb");
        assert!(!config.aof.enabled);
        assert_eq!(config.aof.mode, AofMode::EverySecond);
        assert!(!config.replica.enabled);
    }

    #[test]
    fn test_config_builder() {
        let config = Config::builder()
            .port(7000)
            .bind_address("0.0.0.0")
            .rdb_dir("/custom/path")
            .aof_enabled(true)
            .aof_mode(AofMode::Always)
            .replica_of("10.0.0.1", 6380)
            .build();

        assert_eq!(config.port, 7000);
        assert_eq!(config.bind_address, "0.0.0.0");
        assert_eq!(config.rdb.dir, "/custom/path");
        assert!(config.aof.enabled);
        assert_eq!(config.aof.mode, AofMode::Always);
        assert!(config.replica.enabled);
        assert_eq!(config.replica.master_port, 6380);
    }

    #[test]
    fn test_config_file_round_trip() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "# test config").unwrap();
        writeln!(file, "port 7001").unwrap();
        writeln!(file).unwrap();
        writeln!(file, "rdb.enabled no").unwrap();
        writeln!(file, "aof.mode no-fsync").unwrap();
        writeln!(file, "replica.master_host 192.168.1.5").unwrap();

        let config = Config::from_file(file.path()).unwrap();
        assert_eq!(config.port, 7001);
        assert!(!config.rdb.enabled);
        assert_eq!(config.aof.mode, AofMode::NoFsync);
        assert_eq!(config.replica.master_host, "192.168.1.5");
    }

    #[test]
    fn test_config_file_rejects_unknown_key() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "prot 7001").unwrap();

        assert!(Config::from_file(file.path()).is_err());
    }
}
