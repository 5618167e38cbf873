//! Configuration management for the farmreg client

use crate::error::{CoreError, CoreResult};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Environment prefix for configuration overrides (e.g. `FARMREG_BASE_URL`)
pub const ENV_PREFIX: &str = "FARMREG";

/// Client configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Base URL of the registry API, including any `/api` prefix
    pub base_url: String,

    /// Path of the auth routes relative to `base_url`
    pub auth_path: String,

    /// Per-request timeout in seconds (0 disables it)
    pub request_timeout_secs: u64,

    /// Upper bound on a single refresh exchange in seconds
    pub refresh_timeout_secs: u64,

    /// User agent sent with every request
    pub user_agent: String,

    /// File used to persist the session between runs
    pub storage_path: Option<PathBuf>,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            base_url: "http://127.0.0.1:8000/api".to_string(),
            auth_path: "/auth".to_string(),
            request_timeout_secs: 10,
            refresh_timeout_secs: 10,
            user_agent: concat!("farmreg-client/", env!("CARGO_PKG_VERSION")).to_string(),
            storage_path: None,
        }
    }
}

impl ClientConfig {
    /// Load configuration from an optional file with environment overrides
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or a value fails to parse
    pub fn load(path: Option<&Path>) -> CoreResult<Self> {
        let defaults = Self::default();

        let mut builder = config::Config::builder()
            .set_default("base_url", defaults.base_url)?
            .set_default("auth_path", defaults.auth_path)?
            .set_default("request_timeout_secs", defaults.request_timeout_secs)?
            .set_default("refresh_timeout_secs", defaults.refresh_timeout_secs)?
            .set_default("user_agent", defaults.user_agent)?;

        if let Some(path) = path {
            builder = builder.add_source(config::File::from(path));
        }

        let settings = builder
            .add_source(config::Environment::with_prefix(ENV_PREFIX).try_parsing(true))
            .build()?;

        let config: Self = settings.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Check that the base URL is usable
    ///
    /// # Errors
    ///
    /// Returns an error when `base_url` is not an absolute http(s) URL
    pub fn validate(&self) -> CoreResult<()> {
        let url = url::Url::parse(&self.base_url)
            .map_err(|e| CoreError::invalid_config(format!("base_url: {e}")))?;

        match url.scheme() {
            "http" | "https" => Ok(()),
            other => Err(CoreError::invalid_config(format!(
                "base_url: unsupported scheme {other}"
            ))),
        }
    }

    /// Base URL without a trailing slash
    pub fn normalized_base_url(&self) -> String {
        self.base_url.trim_end_matches('/').to_string()
    }

    /// Auth route prefix with a single leading slash and no trailing slash
    pub fn normalized_auth_path(&self) -> String {
        let trimmed = self.auth_path.trim_matches('/');
        if trimmed.is_empty() {
            String::new()
        } else {
            format!("/{trimmed}")
        }
    }

    pub fn request_timeout(&self) -> Option<Duration> {
        (self.request_timeout_secs > 0).then(|| Duration::from_secs(self.request_timeout_secs))
    }

    pub fn refresh_timeout(&self) -> Duration {
        Duration::from_secs(self.refresh_timeout_secs.max(1))
    }

    /// Write this configuration as TOML
    ///
    /// # Errors
    ///
    /// Returns an error if serialization or the write fails
    pub fn save(&self, path: &Path) -> CoreResult<()> {
        let content = toml_string(self)?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, content)?;
        Ok(())
    }
}

fn toml_string(config: &ClientConfig) -> CoreResult<String> {
    toml::to_string_pretty(config).map_err(|e| CoreError::serialization_error(e.to_string()))
}

/// Default state directory: `FARMREG_STATE_DIR`, else the platform data dir
pub fn default_state_dir() -> PathBuf {
    std::env::var("FARMREG_STATE_DIR")
        .map(PathBuf::from)
        .unwrap_or_else(|_| {
            dirs::data_dir()
                .unwrap_or_else(|| PathBuf::from("."))
                .join("farmreg")
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = ClientConfig::default();
        assert_eq!(config.base_url, "http://127.0.0.1:8000/api");
        assert_eq!(config.normalized_auth_path(), "/auth");
        assert_eq!(config.refresh_timeout(), Duration::from_secs(10));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_normalization() {
        let config = ClientConfig {
            base_url: "https://registry.example/api/".to_string(),
            auth_path: "auth/".to_string(),
            request_timeout_secs: 0,
            ..ClientConfig::default()
        };
        assert_eq!(config.normalized_base_url(), "https://registry.example/api");
        assert_eq!(config.normalized_auth_path(), "/auth");
        assert_eq!(config.request_timeout(), None);
    }

    #[test]
    fn test_rejects_non_http_base_url() {
        let config = ClientConfig {
            base_url: "ftp://registry.example".to_string(),
            ..ClientConfig::default()
        };
        assert!(matches!(
            config.validate(),
            Err(CoreError::InvalidConfig { .. })
        ));
    }

    #[test]
    fn test_save_and_load_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");

        let config = ClientConfig {
            base_url: "https://registry.example/api".to_string(),
            refresh_timeout_secs: 3,
            ..ClientConfig::default()
        };
        config.save(&path).unwrap();

        let loaded = ClientConfig::load(Some(&path)).unwrap();
        assert_eq!(loaded.base_url, "https://registry.example/api");
        assert_eq!(loaded.refresh_timeout_secs, 3);
        assert_eq!(loaded.auth_path, "/auth");
    }
}
