use std::path::{Path, PathBuf};

use serde::Deserialize;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("cannot read config file {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("cannot parse config file {path}: {source}")]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },

    #[error("invalid config: {0}")]
    Invalid(String),
}

/// Service configuration, loaded from a TOML file.
/// Every field has a documented default; unknown keys are rejected.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    /// Number of concurrent upload workers.
    pub num_workers: usize,
    /// Transfer sessions per worker. The pool holds
    /// `num_workers * session_pool_factor` sessions, never fewer than the
    /// worker count.
    pub session_pool_factor: usize,
    /// Remote SFTP host.
    pub server: String,
    pub port: u16,
    pub username: String,
    /// Private key used for pubkey authentication.
    pub private_key_path: PathBuf,
    /// SHA-256 fingerprint of the remote host key, hex, optionally
    /// colon-separated.
    pub host_key_fingerprint: String,
    /// Local directory tree to watch and upload.
    pub source_root: PathBuf,
    /// On-disk state store location.
    pub db_path: PathBuf,
    /// Records whose last transition is older than this are purged.
    pub data_retention_days: i64,
    /// Retries after the first failed attempt of a transfer.
    pub max_retries: u32,
    /// Backoff between attempts is `retry_delay_base_secs ^ attempt` seconds.
    pub retry_delay_base_secs: u64,
    /// A file must be this old (seconds since last write) before it is
    /// considered safe to upload.
    pub min_file_age_secs: i64,
    /// When set, log to a file in this directory instead of stderr.
    pub log_dir: Option<PathBuf>,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            num_workers: 5,
            session_pool_factor: 4,
            server: "localhost".into(),
            port: 22,
            username: "uplink".into(),
            private_key_path: PathBuf::from("uplink_key"),
            host_key_fingerprint: String::new(),
            source_root: PathBuf::from("outbox"),
            db_path: PathBuf::from("uplink.db"),
            data_retention_days: 30,
            max_retries: 5,
            retry_delay_base_secs: 2,
            min_file_age_secs: 300,
            log_dir: None,
        }
    }
}

impl Config {
    pub fn load(path: &Path) -> Result<Config, ConfigError> {
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let config: Config = toml::from_str(&raw).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.num_workers == 0 {
            return Err(ConfigError::Invalid("num_workers must be at least 1".into()));
        }
        // A pool smaller than the worker count would deadlock workers
        // waiting on sessions.
        if self.session_pool_factor == 0 {
            return Err(ConfigError::Invalid(
                "session_pool_factor must be at least 1".into(),
            ));
        }
        if self.retry_delay_base_secs == 0 {
            return Err(ConfigError::Invalid(
                "retry_delay_base_secs must be at least 1".into(),
            ));
        }
        if self.min_file_age_secs < 0 {
            return Err(ConfigError::Invalid(
                "min_file_age_secs must not be negative".into(),
            ));
        }
        if self.data_retention_days <= 0 {
            return Err(ConfigError::Invalid(
                "data_retention_days must be at least 1".into(),
            ));
        }
        let fingerprint = normalize_fingerprint(&self.host_key_fingerprint);
        if fingerprint.len() != 64 || !fingerprint.bytes().all(|b| b.is_ascii_hexdigit()) {
            return Err(ConfigError::Invalid(
                "host_key_fingerprint must be a 64-character SHA-256 hex digest".into(),
            ));
        }
        Ok(())
    }

    /// Total size of the transfer session pool.
    pub fn pool_size(&self) -> usize {
        self.num_workers * self.session_pool_factor
    }
}

/// Canonical fingerprint form: lowercase hex, separators stripped.
pub fn normalize_fingerprint(raw: &str) -> String {
    raw.chars()
        .filter(|c| *c != ':')
        .collect::<String>()
        .to_ascii_lowercase()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    const FINGERPRINT: &str = "a3f1c2d4e5b6978812345678901234567890abcdefabcdefabcdefabcdefabcd";

    fn write_config(body: &str) -> (tempfile::TempDir, PathBuf) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("uplink.toml");
        let mut f = std::fs::File::create(&path).unwrap();
        f.write_all(body.as_bytes()).unwrap();
        (dir, path)
    }

    #[test]
    fn loads_minimal_config_with_defaults() {
        let (_dir, path) = write_config(&format!(
            "server = \"sftp.example.com\"\nhost_key_fingerprint = \"{FINGERPRINT}\"\n"
        ));

        let config = Config::load(&path).unwrap();

        assert_eq!(config.server, "sftp.example.com");
        assert_eq!(config.num_workers, 5);
        assert_eq!(config.min_file_age_secs, 300);
        assert_eq!(config.pool_size(), 20);
    }

    #[test]
    fn rejects_unknown_keys() {
        let (_dir, path) = write_config("workers = 3\n");
        assert!(matches!(Config::load(&path), Err(ConfigError::Parse { .. })));
    }

    #[test]
    fn rejects_zero_workers() {
        let (_dir, path) = write_config(&format!(
            "num_workers = 0\nhost_key_fingerprint = \"{FINGERPRINT}\"\n"
        ));
        assert!(matches!(Config::load(&path), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn rejects_short_fingerprint() {
        let (_dir, path) = write_config("host_key_fingerprint = \"ab:cd\"\n");
        assert!(matches!(Config::load(&path), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn missing_file_is_a_read_error() {
        assert!(matches!(
            Config::load(Path::new("/definitely/not/here.toml")),
            Err(ConfigError::Read { .. })
        ));
    }

    #[test]
    fn fingerprint_normalization_strips_colons_and_case() {
        assert_eq!(normalize_fingerprint("AB:cd:0F"), "abcd0f");
        assert_eq!(normalize_fingerprint("abcd0f"), "abcd0f");
    }
}
