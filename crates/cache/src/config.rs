//! Cache configuration for capacities, lifetimes and locations.
//!
//! This module provides a centralized configuration for the resource cache,
//! the directory-size cache, the decode permit pool and the web file cache.
//! Configuration can be loaded from a TOML file, environment variables, or
//! created programmatically.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

const MB: usize = 1024 * 1024;

/// Configuration for the caching subsystem.
#[derive(Debug, Clone, PartialEq)]
pub struct CacheConfig {
    /// Decoded resource cache capacity in bytes
    pub resource_cache_size: usize,
    /// How long a computed directory size stays valid
    pub dir_size_ttl: Duration,
    /// Directory-size entries kept before batch eviction kicks in
    pub dir_size_max_entries: usize,
    /// Concurrent decodes allowed per logical CPU
    pub decode_permits_per_cpu: usize,
    /// Timeout for downloading a remote file
    pub fetch_timeout: Duration,
    /// Directory where downloaded web files are stored
    pub web_cache_dir: PathBuf,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            resource_cache_size: 100 * MB,
            dir_size_ttl: Duration::from_secs(10 * 60),
            dir_size_max_entries: 512,
            decode_permits_per_cpu: 2,
            fetch_timeout: Duration::from_secs(30),
            web_cache_dir: Self::default_web_cache_dir(),
        }
    }
}

/// On-disk representation. Every key is optional so partial files work.
#[derive(Debug, Default, Serialize, Deserialize)]
struct ConfigFile {
    #[serde(skip_serializing_if = "Option::is_none")]
    resource_cache_mb: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    dir_size_ttl_secs: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    dir_size_max_entries: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    decode_permits_per_cpu: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    fetch_timeout_secs: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    web_cache_dir: Option<PathBuf>,
}

impl CacheConfig {
    /// Sets the resource cache capacity in megabytes.
    pub fn with_resource_cache_mb(mut self, mb: usize) -> Self {
        self.resource_cache_size = mb * MB;
        self
    }

    /// Sets the resource cache capacity in bytes.
    pub fn with_resource_cache_bytes(mut self, bytes: usize) -> Self {
        self.resource_cache_size = bytes;
        self
    }

    pub fn with_dir_size_ttl(mut self, ttl: Duration) -> Self {
        self.dir_size_ttl = ttl;
        self
    }

    pub fn with_dir_size_max_entries(mut self, entries: usize) -> Self {
        self.dir_size_max_entries = entries;
        self
    }

    pub fn with_decode_permits_per_cpu(mut self, permits: usize) -> Self {
        self.decode_permits_per_cpu = permits;
        self
    }

    pub fn with_fetch_timeout(mut self, timeout: Duration) -> Self {
        self.fetch_timeout = timeout;
        self
    }

    /// Sets the web file cache directory.
    pub fn with_web_cache_dir<P: AsRef<Path>>(mut self, path: P) -> Self {
        self.web_cache_dir = path.as_ref().to_path_buf();
        self
    }

    /// Returns the default web file cache directory for the current platform.
    ///
    /// - macOS: ~/Library/Caches/artcache/web
    /// - Linux: ~/.cache/artcache/web
    /// - Windows: %LOCALAPPDATA%\artcache\web
    pub fn default_web_cache_dir() -> PathBuf {
        if let Some(cache_dir) = dirs::cache_dir() {
            cache_dir.join("artcache").join("web")
        } else {
            PathBuf::from("cache/web")
        }
    }

    /// Loads configuration from environment variables.
    ///
    /// Environment variables:
    /// - `ARTCACHE_RESOURCE_CACHE_MB`: resource cache capacity in MB (default: 100)
    /// - `ARTCACHE_DIR_SIZE_TTL_SECS`: directory-size lifetime (default: 600)
    /// - `ARTCACHE_DIR_SIZE_MAX_ENTRIES`: directory-size entry limit (default: 512)
    /// - `ARTCACHE_DECODE_PERMITS_PER_CPU`: decode permits per CPU (default: 2)
    /// - `ARTCACHE_FETCH_TIMEOUT_SECS`: download timeout (default: 30)
    /// - `ARTCACHE_WEB_CACHE_DIR`: web file cache directory
    ///
    /// # Errors
    /// Returns an error if any environment variable contains an invalid value.
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Self::default();

        if let Some(mb) = env_number::<usize>("ARTCACHE_RESOURCE_CACHE_MB")? {
            config.resource_cache_size = mb * MB;
        }
        if let Some(secs) = env_number::<u64>("ARTCACHE_DIR_SIZE_TTL_SECS")? {
            config.dir_size_ttl = Duration::from_secs(secs);
        }
        if let Some(entries) = env_number::<usize>("ARTCACHE_DIR_SIZE_MAX_ENTRIES")? {
            config.dir_size_max_entries = entries;
        }
        if let Some(permits) = env_number::<usize>("ARTCACHE_DECODE_PERMITS_PER_CPU")? {
            config.decode_permits_per_cpu = permits;
        }
        if let Some(secs) = env_number::<u64>("ARTCACHE_FETCH_TIMEOUT_SECS")? {
            config.fetch_timeout = Duration::from_secs(secs);
        }
        if let Ok(val) = std::env::var("ARTCACHE_WEB_CACHE_DIR") {
            config.web_cache_dir = PathBuf::from(val);
        }

        config.validate()?;
        Ok(config)
    }

    /// Loads configuration from a TOML file.
    ///
    /// Expected file format (all keys optional):
    /// ```toml
    /// resource_cache_mb = 100
    /// dir_size_ttl_secs = 600
    /// dir_size_max_entries = 512
    /// decode_permits_per_cpu = 2
    /// fetch_timeout_secs = 30
    /// web_cache_dir = "/path/to/cache"
    /// ```
    ///
    /// # Errors
    /// Returns an error if the file cannot be read or parsed.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let contents = fs::read_to_string(path.as_ref())?;
        Self::from_toml(&contents)
    }

    /// Parses configuration from a TOML string.
    pub fn from_toml(toml_str: &str) -> Result<Self, ConfigError> {
        let file: ConfigFile = toml::from_str(toml_str)?;
        let mut config = Self::default();

        if let Some(mb) = file.resource_cache_mb {
            config.resource_cache_size = mb * MB;
        }
        if let Some(secs) = file.dir_size_ttl_secs {
            config.dir_size_ttl = Duration::from_secs(secs);
        }
        if let Some(entries) = file.dir_size_max_entries {
            config.dir_size_max_entries = entries;
        }
        if let Some(permits) = file.decode_permits_per_cpu {
            config.decode_permits_per_cpu = permits;
        }
        if let Some(secs) = file.fetch_timeout_secs {
            config.fetch_timeout = Duration::from_secs(secs);
        }
        if let Some(dir) = file.web_cache_dir {
            config.web_cache_dir = dir;
        }

        config.validate()?;
        Ok(config)
    }

    /// Saves configuration to a TOML file.
    ///
    /// # Errors
    /// Returns an error if the file cannot be written.
    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<(), ConfigError> {
        fs::write(path.as_ref(), self.to_toml()?)?;
        Ok(())
    }

    /// Converts configuration to TOML format.
    pub fn to_toml(&self) -> Result<String, ConfigError> {
        let file = ConfigFile {
            resource_cache_mb: Some(self.resource_cache_mb()),
            dir_size_ttl_secs: Some(self.dir_size_ttl.as_secs()),
            dir_size_max_entries: Some(self.dir_size_max_entries),
            decode_permits_per_cpu: Some(self.decode_permits_per_cpu),
            fetch_timeout_secs: Some(self.fetch_timeout.as_secs()),
            web_cache_dir: Some(self.web_cache_dir.clone()),
        };
        Ok(toml::to_string(&file)?)
    }

    /// Rejects values the caches cannot operate with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.resource_cache_size == 0 {
            return Err(ConfigError::InvalidValue("resource_cache_mb".to_string()));
        }
        if self.dir_size_max_entries == 0 {
            return Err(ConfigError::InvalidValue("dir_size_max_entries".to_string()));
        }
        if self.decode_permits_per_cpu == 0 {
            return Err(ConfigError::InvalidValue("decode_permits_per_cpu".to_string()));
        }
        if self.fetch_timeout.is_zero() {
            return Err(ConfigError::InvalidValue("fetch_timeout_secs".to_string()));
        }
        Ok(())
    }

    /// Returns the resource cache capacity in megabytes.
    pub fn resource_cache_mb(&self) -> usize {
        self.resource_cache_size / MB
    }
}

fn env_number<T: std::str::FromStr>(name: &str) -> Result<Option<T>, ConfigError> {
    match std::env::var(name) {
        Ok(val) => val
            .trim()
            .parse::<T>()
            .map(Some)
            .map_err(|_| ConfigError::InvalidValue(name.to_string())),
        Err(_) => Ok(None),
    }
}

/// Errors that can occur during configuration operations.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// Invalid value for a configuration parameter
    #[error("Invalid value for configuration key: {0}")]
    InvalidValue(String),

    /// I/O error reading or writing configuration file
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("Failed to parse configuration: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Failed to serialize configuration: {0}")]
    Serialize(#[from] toml::ser::Error),
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;
    use std::env;

    const ENV_VARS: &[&str] = &[
        "ARTCACHE_RESOURCE_CACHE_MB",
        "ARTCACHE_DIR_SIZE_TTL_SECS",
        "ARTCACHE_DIR_SIZE_MAX_ENTRIES",
        "ARTCACHE_DECODE_PERMITS_PER_CPU",
        "ARTCACHE_FETCH_TIMEOUT_SECS",
        "ARTCACHE_WEB_CACHE_DIR",
    ];

    #[test]
    fn test_default_config() {
        let config = CacheConfig::default();
        assert_eq!(config.resource_cache_size, 100 * 1024 * 1024);
        assert_eq!(config.dir_size_ttl, Duration::from_secs(600));
        assert_eq!(config.dir_size_max_entries, 512);
        assert_eq!(config.decode_permits_per_cpu, 2);
        assert_eq!(config.fetch_timeout, Duration::from_secs(30));
        assert!(config.web_cache_dir.ends_with("web"));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_builder_methods() {
        let config = CacheConfig::default()
            .with_resource_cache_mb(64)
            .with_dir_size_ttl(Duration::from_secs(5))
            .with_dir_size_max_entries(8)
            .with_decode_permits_per_cpu(1)
            .with_fetch_timeout(Duration::from_secs(3))
            .with_web_cache_dir("/custom/path");

        assert_eq!(config.resource_cache_size, 64 * 1024 * 1024);
        assert_eq!(config.resource_cache_mb(), 64);
        assert_eq!(config.dir_size_ttl, Duration::from_secs(5));
        assert_eq!(config.dir_size_max_entries, 8);
        assert_eq!(config.decode_permits_per_cpu, 1);
        assert_eq!(config.fetch_timeout, Duration::from_secs(3));
        assert_eq!(config.web_cache_dir, PathBuf::from("/custom/path"));
    }

    #[test]
    fn test_validate_rejects_zero_values() {
        let zeroed = [
            CacheConfig::default().with_resource_cache_bytes(0),
            CacheConfig::default().with_dir_size_max_entries(0),
            CacheConfig::default().with_decode_permits_per_cpu(0),
            CacheConfig::default().with_fetch_timeout(Duration::ZERO),
        ];
        for config in zeroed {
            assert!(config.validate().is_err());
        }
    }

    #[test]
    #[serial]
    fn test_from_env() {
        let _guard = EnvGuard::new(ENV_VARS);

        env::set_var("ARTCACHE_RESOURCE_CACHE_MB", "32");
        env::set_var("ARTCACHE_DIR_SIZE_TTL_SECS", "60");
        env::set_var("ARTCACHE_DIR_SIZE_MAX_ENTRIES", "16");
        env::set_var("ARTCACHE_DECODE_PERMITS_PER_CPU", "4");
        env::set_var("ARTCACHE_FETCH_TIMEOUT_SECS", "5");
        env::set_var("ARTCACHE_WEB_CACHE_DIR", "/tmp/test-web");

        let config = CacheConfig::from_env().unwrap();
        assert_eq!(config.resource_cache_size, 32 * 1024 * 1024);
        assert_eq!(config.dir_size_ttl, Duration::from_secs(60));
        assert_eq!(config.dir_size_max_entries, 16);
        assert_eq!(config.decode_permits_per_cpu, 4);
        assert_eq!(config.fetch_timeout, Duration::from_secs(5));
        assert_eq!(config.web_cache_dir, PathBuf::from("/tmp/test-web"));
    }

    #[test]
    #[serial]
    fn test_from_env_partial() {
        let _guard = EnvGuard::new(ENV_VARS);

        for name in ENV_VARS {
            env::remove_var(name);
        }
        env::set_var("ARTCACHE_RESOURCE_CACHE_MB", "8");

        let config = CacheConfig::from_env().unwrap();
        assert_eq!(config.resource_cache_size, 8 * 1024 * 1024);
        assert_eq!(config.dir_size_max_entries, 512); // default
        assert_eq!(config.dir_size_ttl, Duration::from_secs(600)); // default
    }

    #[test]
    #[serial]
    fn test_from_env_invalid() {
        let _guard = EnvGuard::new(ENV_VARS);

        env::set_var("ARTCACHE_RESOURCE_CACHE_MB", "not_a_number");
        let err = CacheConfig::from_env().unwrap_err();
        assert_eq!(
            err.to_string(),
            "Invalid value for configuration key: ARTCACHE_RESOURCE_CACHE_MB"
        );
    }

    #[test]
    #[serial]
    fn test_from_env_zero_is_invalid() {
        let _guard = EnvGuard::new(ENV_VARS);

        for name in ENV_VARS {
            env::remove_var(name);
        }
        env::set_var("ARTCACHE_DECODE_PERMITS_PER_CPU", "0");
        assert!(CacheConfig::from_env().is_err());
    }

    // Helper to save and restore environment variables
    struct EnvGuard {
        vars: Vec<(String, Option<String>)>,
    }

    impl EnvGuard {
        fn new(var_names: &[&str]) -> Self {
            let vars = var_names
                .iter()
                .map(|name| (name.to_string(), env::var(name).ok()))
                .collect();
            Self { vars }
        }
    }

    impl Drop for EnvGuard {
        fn drop(&mut self) {
            for (name, value) in &self.vars {
                match value {
                    Some(v) => env::set_var(name, v),
                    None => env::remove_var(name),
                }
            }
        }
    }

    #[test]
    fn test_toml_roundtrip() {
        let config = CacheConfig::default()
            .with_resource_cache_mb(12)
            .with_web_cache_dir("/tmp/cache");
        let toml = config.to_toml().unwrap();
        let parsed = CacheConfig::from_toml(&toml).unwrap();
        assert_eq!(config, parsed);
    }

    #[test]
    fn test_from_toml_partial() {
        let toml = r#"
            # Only the resource cache is overridden
            resource_cache_mb = 128
        "#;

        let config = CacheConfig::from_toml(toml).unwrap();
        assert_eq!(config.resource_cache_size, 128 * 1024 * 1024);
        assert_eq!(config.dir_size_max_entries, 512); // default
    }

    #[test]
    fn test_from_toml_rejects_wrong_type() {
        let err = CacheConfig::from_toml("resource_cache_mb = \"lots\"").unwrap_err();
        assert!(matches!(err, ConfigError::Parse(_)));
    }

    #[test]
    fn test_file_save_and_load() {
        let temp_dir = tempfile::tempdir().unwrap();
        let config_path = temp_dir.path().join("artcache.toml");

        let config = CacheConfig::default()
            .with_dir_size_ttl(Duration::from_secs(42))
            .with_web_cache_dir("/tmp/web");
        config.save_to_file(&config_path).unwrap();

        let loaded = CacheConfig::from_file(&config_path).unwrap();
        assert_eq!(config, loaded);
    }

    #[test]
    fn test_from_missing_file() {
        let err = CacheConfig::from_file("/definitely/not/here.toml").unwrap_err();
        assert!(matches!(err, ConfigError::Io(_)));
    }
}
