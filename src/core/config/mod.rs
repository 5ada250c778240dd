//! Layered process configuration.
//!
//! Values come from compiled defaults, then an optional TOML file
//! (`portal.toml`, or the path in `PORTAL_CONFIG`), then `PORTAL_*` environment
//! variables where `__` separates sections: `PORTAL_REMOTE__API_KEY` sets
//! `remote.api_key`.

use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};

pub const DEFAULT_CONFIG_FILE: &str = "portal.toml";
pub const CONFIG_PATH_VAR: &str = "PORTAL_CONFIG";
pub const ENV_PREFIX: &str = "PORTAL_";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read configuration: {0}")]
    Load(#[from] Box<figment::Error>),
    #[error("missing required setting `{0}`")]
    Missing(&'static str),
    #[error("invalid setting `{key}`: {reason}")]
    Invalid { key: &'static str, reason: String },
}

#[derive(Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub database_url: String,
    pub server: ServerConfig,
    pub remote: RemoteConfig,
    pub email: EmailConfig,
    pub support: SupportConfig,
    pub schedule: ScheduleConfig,
}

impl fmt::Debug for AppConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AppConfig")
            .field("database_url", &"<redacted>")
            .field("server", &self.server)
            .field("remote", &self.remote)
            .field("email", &self.email)
            .field("support", &self.support)
            .field("schedule", &self.schedule)
            .finish()
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    /// Public URL of the portal, used to build notification deep links.
    pub base_url: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8080,
            base_url: "http://localhost:8080".to_string(),
        }
    }
}

#[derive(Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RemoteConfig {
    pub api_url: String,
    pub api_key: String,
    pub verify_tls: bool,
    pub timeout_secs: u64,
    pub max_retries: u32,
    pub backoff_base_ms: u64,
    pub site_id: String,
    /// Account that authors imported worklogs.
    pub system_user_email: String,
}

impl Default for RemoteConfig {
    fn default() -> Self {
        Self {
            api_url: String::new(),
            api_key: String::new(),
            verify_tls: true,
            timeout_secs: 30,
            max_retries: 3,
            backoff_base_ms: 1000,
            site_id: "ITCBR".to_string(),
            system_user_email: "remote-system@portal.local".to_string(),
        }
    }
}

impl fmt::Debug for RemoteConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RemoteConfig")
            .field("api_url", &self.api_url)
            .field("api_key", &"<redacted>")
            .field("verify_tls", &self.verify_tls)
            .field("timeout_secs", &self.timeout_secs)
            .field("max_retries", &self.max_retries)
            .field("backoff_base_ms", &self.backoff_base_ms)
            .field("site_id", &self.site_id)
            .field("system_user_email", &self.system_user_email)
            .finish()
    }
}

#[derive(Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EmailConfig {
    pub smtp_server: String,
    pub smtp_port: u16,
    pub username: Option<String>,
    pub password: Option<String>,
    pub from_address: String,
    /// Shared mailbox of the support team; also the remote email listener.
    pub support_mailbox: String,
}

impl Default for EmailConfig {
    fn default() -> Self {
        Self {
            smtp_server: "localhost".to_string(),
            smtp_port: 25,
            username: None,
            password: None,
            from_address: "portal@localhost".to_string(),
            support_mailbox: "support@localhost".to_string(),
        }
    }
}

impl fmt::Debug for EmailConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EmailConfig")
            .field("smtp_server", &self.smtp_server)
            .field("smtp_port", &self.smtp_port)
            .field("username", &self.username)
            .field("password", &self.password.as_ref().map(|_| "<redacted>"))
            .field("from_address", &self.from_address)
            .field("support_mailbox", &self.support_mailbox)
            .finish()
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct SupportConfig {
    pub consultant_group: String,
    pub preview_chars: usize,
    pub inbox_limit: usize,
}

impl Default for SupportConfig {
    fn default() -> Self {
        Self {
            consultant_group: "Consultants".to_string(),
            preview_chars: 60,
            inbox_limit: 5,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct ScheduleConfig {
    /// Six-field cron expressions (seconds first).
    pub reconciliation: String,
    pub worklog_import: String,
}

impl Default for ScheduleConfig {
    fn default() -> Self {
        Self {
            reconciliation: "0 */15 * * * *".to_string(),
            worklog_import: "0 5/30 * * * *".to_string(),
        }
    }
}

impl AppConfig {
    /// Loads from the default file location and the process environment.
    pub fn load() -> Result<Self, ConfigError> {
        let path = std::env::var_os(CONFIG_PATH_VAR)
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_FILE));
        Self::load_from(&path)
    }

    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        Self::figment(path)
            .extract::<Self>()
            .map_err(|e| ConfigError::Load(Box::new(e)))
    }

    pub fn figment(path: &Path) -> Figment {
        Figment::from(Serialized::defaults(Self::default()))
            .merge(Toml::file(path))
            .merge(Env::prefixed(ENV_PREFIX).split("__"))
    }

    /// Settings every batch job needs before it can touch the remote system.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.database_url.trim().is_empty() {
            return Err(ConfigError::Missing("database_url"));
        }
        if self.remote.api_url.trim().is_empty() {
            return Err(ConfigError::Missing("remote.api_url"));
        }
        if self.remote.api_key.trim().is_empty() {
            return Err(ConfigError::Missing("remote.api_key"));
        }
        if self.remote.timeout_secs == 0 {
            return Err(ConfigError::Invalid {
                key: "remote.timeout_secs",
                reason: "must be greater than zero".to_string(),
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_toml(contents: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        file.write_all(contents.as_bytes()).unwrap();
        file
    }

    #[test]
    fn test_defaults_when_file_is_absent() {
        let dir = tempfile::tempdir().unwrap();
        let config = AppConfig::figment(&dir.path().join("missing.toml"))
            .extract::<AppConfig>()
            .unwrap();
        assert_eq!(config.remote.max_retries, 3);
        assert_eq!(config.support.preview_chars, 60);
        assert!(config.remote.verify_tls);
    }

    #[test]
    fn test_file_values_override_defaults() {
        let file = write_toml(
            r#"
            database_url = "postgres://portal:pw@db/portal"

            [remote]
            api_url = "https://remote.example/maximo/api/os/mxapisr"
            api_key = "k-123"
            verify_tls = false

            [support]
            consultant_group = "Consultores"
            "#,
        );
        let config = AppConfig::figment(file.path()).extract::<AppConfig>().unwrap();
        assert_eq!(config.remote.api_key, "k-123");
        assert!(!config.remote.verify_tls);
        assert_eq!(config.support.consultant_group, "Consultores");
        assert_eq!(config.remote.timeout_secs, 30);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_missing_credentials_fail_validation() {
        let file = write_toml("database_url = \"postgres://db/portal\"\n");
        let config = AppConfig::figment(file.path()).extract::<AppConfig>().unwrap();
        assert!(matches!(
            config.validate(),
            Err(ConfigError::Missing("remote.api_url"))
        ));
    }

    #[test]
    fn test_debug_redacts_secrets() {
        let mut config = AppConfig::default();
        config.database_url = "postgres://portal:hunter2@db/portal".to_string();
        config.remote.api_key = "k-123".to_string();
        config.email.password = Some("smtp-pass".to_string());
        let rendered = format!("{config:?}");
        assert!(!rendered.contains("hunter2"));
        assert!(!rendered.contains("k-123"));
        assert!(!rendered.contains("smtp-pass"));
    }
}
