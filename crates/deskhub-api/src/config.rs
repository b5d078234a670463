//! Configuration management

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::limiter::LoginLimitConfig;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("TOML parse error: {0}")]
    Toml(#[from] toml::de::Error),
    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub listen_addr: SocketAddr,
    pub database_path: PathBuf,
    /// How often cached presence is written to the database
    pub flush_interval_secs: u64,
    /// How often stale login-limiter windows are evicted
    pub sweep_interval_secs: u64,
    pub token_ttl_secs: u64,
    pub disable_pwd_login: bool,
    /// Take the client address from `X-Forwarded-For` (behind a reverse proxy)
    pub trust_forwarded_for: bool,
    /// Password for the `admin` account created on first start
    pub admin_password: Option<String>,
    pub login_limit: LoginLimitConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: SocketAddr::from(([0, 0, 0, 0], 21114)),
            database_path: PathBuf::from("deskhub.db"),
            flush_interval_secs: 60,
            sweep_interval_secs: 300,
            token_ttl_secs: 7 * 24 * 3600,
            disable_pwd_login: false,
            trust_forwarded_for: false,
            admin_password: None,
            login_limit: LoginLimitConfig::default(),
        }
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Result<Option<T>, ConfigError>
where
    T::Err: std::fmt::Display,
{
    match std::env::var(key) {
        Ok(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|e| ConfigError::Invalid(format!("Invalid {}: {}", key, e))),
        Err(_) => Ok(None),
    }
}

impl ServerConfig {
    /// Load configuration from environment variables, then the TOML file named
    /// by `DESKHUB_CONFIG` (if any), and validate the result
    pub fn load() -> Result<Self, ConfigError> {
        let mut config = Self::default();
        config.apply_env()?;

        if let Ok(config_path) = std::env::var("DESKHUB_CONFIG") {
            config.load_from_toml(&config_path)?;
        }

        config.validate()?;
        Ok(config)
    }

    fn apply_env(&mut self) -> Result<(), ConfigError> {
        if let Some(addr) = env_parse("DESKHUB_LISTEN_ADDR")? {
            self.listen_addr = addr;
        }
        if let Ok(path) = std::env::var("DESKHUB_DATABASE_PATH") {
            self.database_path = PathBuf::from(path);
        }
        if let Some(secs) = env_parse("DESKHUB_FLUSH_INTERVAL_SECS")? {
            self.flush_interval_secs = secs;
        }
        if let Some(secs) = env_parse("DESKHUB_SWEEP_INTERVAL_SECS")? {
            self.sweep_interval_secs = secs;
        }
        if let Some(secs) = env_parse("DESKHUB_TOKEN_TTL_SECS")? {
            self.token_ttl_secs = secs;
        }
        if let Some(disabled) = env_parse("DESKHUB_DISABLE_PWD_LOGIN")? {
            self.disable_pwd_login = disabled;
        }
        if let Some(trust) = env_parse("DESKHUB_TRUST_FORWARDED_FOR")? {
            self.trust_forwarded_for = trust;
        }
        if let Ok(password) = std::env::var("DESKHUB_ADMIN_PASSWORD") {
            self.admin_password = Some(password);
        }
        if let Some(max) = env_parse("DESKHUB_LOGIN_MAX_ATTEMPTS")? {
            self.login_limit.max_attempts = max;
        }
        if let Some(secs) = env_parse("DESKHUB_LOGIN_WINDOW_SECS")? {
            self.login_limit.window_secs = secs;
        }
        if let Some(secs) = env_parse("DESKHUB_LOGIN_LOCKOUT_SECS")? {
            self.login_limit.lockout_secs = secs;
        }
        Ok(())
    }

    /// Overlay the keys present in a TOML file
    fn load_from_toml(&mut self, path: &str) -> Result<(), ConfigError> {
        let content = std::fs::read_to_string(path)?;
        self.merge_toml(&content)
    }

    fn merge_toml(&mut self, content: &str) -> Result<(), ConfigError> {
        let toml_config: toml::Value = toml::from_str(content)?;

        if let Some(addr) = toml_config.get("listen_addr").and_then(|v| v.as_str()) {
            self.listen_addr = addr.parse()
                .map_err(|e| ConfigError::Invalid(format!("Invalid listen_addr in TOML: {}", e)))?;
        }

        if let Some(path) = toml_config.get("database_path").and_then(|v| v.as_str()) {
            self.database_path = PathBuf::from(path);
        }

        if let Some(secs) = toml_config.get("flush_interval_secs").and_then(|v| v.as_integer()) {
            self.flush_interval_secs = secs.max(0) as u64;
        }

        if let Some(secs) = toml_config.get("sweep_interval_secs").and_then(|v| v.as_integer()) {
            self.sweep_interval_secs = secs.max(0) as u64;
        }

        if let Some(secs) = toml_config.get("token_ttl_secs").and_then(|v| v.as_integer()) {
            self.token_ttl_secs = secs.max(0) as u64;
        }

        if let Some(disabled) = toml_config.get("disable_pwd_login").and_then(|v| v.as_bool()) {
            self.disable_pwd_login = disabled;
        }

        if let Some(trust) = toml_config.get("trust_forwarded_for").and_then(|v| v.as_bool()) {
            self.trust_forwarded_for = trust;
        }

        if let Some(password) = toml_config.get("admin_password").and_then(|v| v.as_str()) {
            self.admin_password = Some(password.to_string());
        }

        if let Some(limit) = toml_config.get("login_limit") {
            self.login_limit = limit.clone().try_into()?;
        }

        Ok(())
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.flush_interval_secs == 0 {
            return Err(ConfigError::Invalid("flush_interval_secs must be > 0".to_string()));
        }

        if self.sweep_interval_secs == 0 {
            return Err(ConfigError::Invalid("sweep_interval_secs must be > 0".to_string()));
        }

        if self.token_ttl_secs == 0 {
            return Err(ConfigError::Invalid("token_ttl_secs must be > 0".to_string()));
        }

        let limit = &self.login_limit;
        if limit.max_attempts == 0 || limit.window_secs == 0 || limit.lockout_secs == 0 {
            return Err(ConfigError::Invalid(
                "login_limit values must all be > 0".to_string()
            ));
        }

        if matches!(&self.admin_password, Some(p) if p.is_empty()) {
            return Err(ConfigError::Invalid("admin_password must not be empty".to_string()));
        }

        Ok(())
    }

    pub fn flush_interval(&self) -> Duration {
        Duration::from_secs(self.flush_interval_secs)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }
}
