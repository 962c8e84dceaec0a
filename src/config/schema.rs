use anyhow::{Context, Result};
use directories::UserDirs;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tokio::fs;

const CONFIG_FILE_NAME: &str = "config.toml";
const DEFAULT_DB_FILE_NAME: &str = "inbound.db";

// ── Top-level config ──────────────────────────────────────────────

/// Top-level wa-inbound configuration, loaded from `config.toml`.
///
/// Resolution order: `--config` path → `WA_INBOUND_CONFIG` env → `~/.wa-inbound/config.toml`.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct Config {
    /// Workspace directory - the config file's directory, not serialized
    #[serde(skip)]
    pub workspace_dir: PathBuf,
    /// Path to config.toml - computed at load time, not serialized
    #[serde(skip)]
    pub config_path: PathBuf,

    /// SQLite storage settings (`[storage]`).
    #[serde(default)]
    pub storage: StorageConfig,

    /// Media download settings (`[media]`).
    #[serde(default)]
    pub media: MediaConfig,

    /// Webhook gateway server settings (`[gateway]`).
    #[serde(default)]
    pub gateway: GatewayConfig,
}

impl Default for Config {
    fn default() -> Self {
        let workspace_dir = default_config_dir().unwrap_or_else(|_| PathBuf::from(".wa-inbound"));
        Self {
            config_path: workspace_dir.join(CONFIG_FILE_NAME),
            workspace_dir,
            storage: StorageConfig::default(),
            media: MediaConfig::default(),
            gateway: GatewayConfig::default(),
        }
    }
}

// ── Storage ───────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct StorageConfig {
    /// Database file. `~` is expanded; relative paths resolve against the
    /// workspace. Default: `{workspace}/inbound.db`. Overridden by `WA_INBOUND_DB_PATH`.
    #[serde(default)]
    pub db_path: Option<String>,
    /// How long a writer waits on a locked database before failing (default: 5000).
    #[serde(default = "default_busy_timeout_ms")]
    pub busy_timeout_ms: u64,
}

fn default_busy_timeout_ms() -> u64 {
    5_000
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            db_path: None,
            busy_timeout_ms: default_busy_timeout_ms(),
        }
    }
}

// ── Media ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct MediaConfig {
    /// Provider API base URL. When set, media is downloaded from
    /// `{provider_url}/messages/{message_id}/media`; otherwise from the URL
    /// carried in the message. Overridden by `WA_INBOUND_MEDIA_URL`.
    #[serde(default)]
    pub provider_url: Option<String>,
    /// Bearer token for the provider API. Overridden by `WA_INBOUND_MEDIA_API_KEY`.
    #[serde(default)]
    pub api_key: Option<String>,
    /// Per-download timeout in seconds (default: 30).
    #[serde(default = "default_media_timeout_secs")]
    pub timeout_secs: u64,
    /// Largest accepted download in bytes (default: 25 MiB).
    #[serde(default = "default_media_max_bytes")]
    pub max_bytes: usize,
}

fn default_media_timeout_secs() -> u64 {
    30
}

fn default_media_max_bytes() -> usize {
    25 * 1024 * 1024
}

impl Default for MediaConfig {
    fn default() -> Self {
        Self {
            provider_url: None,
            api_key: None,
            timeout_secs: default_media_timeout_secs(),
            max_bytes: default_media_max_bytes(),
        }
    }
}

// ── Gateway ───────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct GatewayConfig {
    /// Gateway port (default: 42718). Overridden by `WA_INBOUND_GATEWAY_PORT`.
    #[serde(default = "default_gateway_port")]
    pub port: u16,
    /// Gateway host (default: 127.0.0.1)
    #[serde(default = "default_gateway_host")]
    pub host: String,
    /// Largest accepted webhook body in bytes (default: 1 MiB).
    #[serde(default = "default_max_body_bytes")]
    pub max_body_bytes: usize,
    /// Whole-request timeout in seconds, media downloads included (default: 120).
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
}

fn default_gateway_port() -> u16 {
    42718
}

fn default_gateway_host() -> String {
    "127.0.0.1".into()
}

fn default_max_body_bytes() -> usize {
    1024 * 1024
}

fn default_request_timeout_secs() -> u64 {
    120
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            port: default_gateway_port(),
            host: default_gateway_host(),
            max_body_bytes: default_max_body_bytes(),
            request_timeout_secs: default_request_timeout_secs(),
        }
    }
}

// ── Loading ───────────────────────────────────────────────────────

fn default_config_dir() -> Result<PathBuf> {
    let home = UserDirs::new()
        .map(|u| u.home_dir().to_path_buf())
        .context("Could not find home directory")?;
    Ok(home.join(".wa-inbound"))
}

fn resolve_config_path(explicit: Option<&Path>) -> Result<PathBuf> {
    if let Some(path) = explicit {
        return Ok(path.to_path_buf());
    }
    if let Ok(path) = std::env::var("WA_INBOUND_CONFIG") {
        if !path.trim().is_empty() {
            return Ok(PathBuf::from(shellexpand::tilde(path.trim()).into_owned()));
        }
    }
    Ok(default_config_dir()?.join(CONFIG_FILE_NAME))
}

impl Config {
    /// Load config from disk. A missing file yields defaults.
    pub async fn load(explicit: Option<&Path>) -> Result<Self> {
        let config_path = resolve_config_path(explicit)?;
        let workspace_dir = config_path
            .parent()
            .filter(|parent| !parent.as_os_str().is_empty())
            .map_or_else(|| PathBuf::from("."), Path::to_path_buf);

        let exists = fs::try_exists(&config_path).await.unwrap_or(false);
        let mut config = if exists {
            let contents = fs::read_to_string(&config_path)
                .await
                .with_context(|| format!("Failed to read config file {}", config_path.display()))?;
            toml::from_str::<Config>(&contents)
                .with_context(|| format!("Failed to parse config file {}", config_path.display()))?
        } else {
            Config::default()
        };

        config.config_path = config_path;
        config.workspace_dir = workspace_dir;
        config.apply_env_overrides();
        config.validate()?;

        tracing::info!(
            path = %config.config_path.display(),
            workspace = %config.workspace_dir.display(),
            from_file = exists,
            "Config loaded"
        );
        Ok(config)
    }

    /// Validate configuration values that would cause runtime failures.
    pub fn validate(&self) -> Result<()> {
        if self.media.max_bytes == 0 {
            anyhow::bail!("media.max_bytes must be greater than 0");
        }
        if self.media.timeout_secs == 0 {
            anyhow::bail!("media.timeout_secs must be greater than 0");
        }
        if let Some(url) = self.media.provider_url.as_deref() {
            let url = url.trim();
            if !(url.starts_with("http://") || url.starts_with("https://")) {
                anyhow::bail!("media.provider_url must start with http:// or https:// (got {url:?})");
            }
        }

        if self.gateway.host.trim().is_empty() {
            anyhow::bail!("gateway.host must not be empty");
        }
        if self.gateway.port == 0 {
            anyhow::bail!("gateway.port must be greater than 0");
        }

        Ok(())
    }

    /// Apply environment variable overrides to config
    pub fn apply_env_overrides(&mut self) {
        // Workspace directory: WA_INBOUND_WORKSPACE
        if let Ok(workspace) = std::env::var("WA_INBOUND_WORKSPACE") {
            if !workspace.is_empty() {
                self.workspace_dir = PathBuf::from(shellexpand::tilde(&workspace).into_owned());
            }
        }

        // Database path: WA_INBOUND_DB_PATH
        if let Ok(path) = std::env::var("WA_INBOUND_DB_PATH") {
            if !path.is_empty() {
                self.storage.db_path = Some(path);
            }
        }

        // Media provider: WA_INBOUND_MEDIA_URL, WA_INBOUND_MEDIA_API_KEY
        if let Ok(url) = std::env::var("WA_INBOUND_MEDIA_URL") {
            if !url.is_empty() {
                self.media.provider_url = Some(url);
            }
        }
        if let Ok(key) = std::env::var("WA_INBOUND_MEDIA_API_KEY") {
            if !key.is_empty() {
                self.media.api_key = Some(key);
            }
        }

        // Gateway port: WA_INBOUND_GATEWAY_PORT
        if let Ok(port_str) = std::env::var("WA_INBOUND_GATEWAY_PORT") {
            match port_str.trim().parse::<u16>() {
                Ok(port) => self.gateway.port = port,
                Err(_) if port_str.trim().is_empty() => {}
                Err(_) => tracing::warn!("Ignoring invalid WA_INBOUND_GATEWAY_PORT={port_str:?}"),
            }
        }
    }

    /// Effective database file path.
    pub fn resolved_db_path(&self) -> PathBuf {
        match self.storage.db_path.as_deref().map(str::trim) {
            Some(raw) if !raw.is_empty() => {
                let expanded = PathBuf::from(shellexpand::tilde(raw).into_owned());
                if expanded.is_absolute() {
                    expanded
                } else {
                    self.workspace_dir.join(expanded)
                }
            }
            _ => self.workspace_dir.join(DEFAULT_DB_FILE_NAME),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::{Mutex, MutexGuard};
    use tokio::test;

    const ENV_KEYS: [&str; 6] = [
        "WA_INBOUND_CONFIG",
        "WA_INBOUND_WORKSPACE",
        "WA_INBOUND_DB_PATH",
        "WA_INBOUND_MEDIA_URL",
        "WA_INBOUND_MEDIA_API_KEY",
        "WA_INBOUND_GATEWAY_PORT",
    ];

    async fn env_override_lock() -> MutexGuard<'static, ()> {
        static ENV_OVERRIDE_TEST_LOCK: Mutex<()> = Mutex::const_new(());
        let guard = ENV_OVERRIDE_TEST_LOCK.lock().await;
        for key in ENV_KEYS {
            std::env::remove_var(key);
        }
        guard
    }

    #[test]
    async fn defaults_are_valid() {
        let config = Config::default();
        config.validate().unwrap();
        assert_eq!(config.storage.busy_timeout_ms, 5_000);
        assert_eq!(config.gateway.host, "127.0.0.1");
        assert!(config.resolved_db_path().ends_with("inbound.db"));
    }

    #[test]
    async fn partial_toml_fills_defaults() {
        let parsed: Config = toml::from_str(
            r#"
[media]
provider_url = "https://baileys.local"

[gateway]
port = 9000
"#,
        )
        .unwrap();
        assert_eq!(parsed.media.provider_url.as_deref(), Some("https://baileys.local"));
        assert_eq!(parsed.media.timeout_secs, 30);
        assert_eq!(parsed.gateway.port, 9000);
        assert_eq!(parsed.gateway.max_body_bytes, 1024 * 1024);
    }

    #[test]
    async fn validate_rejects_bad_values() {
        let mut config = Config::default();
        config.media.max_bytes = 0;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.media.timeout_secs = 0;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.media.provider_url = Some("ftp://example.com".into());
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.gateway.port = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    async fn db_path_resolution() {
        let mut config = Config {
            workspace_dir: PathBuf::from("/srv/wa"),
            ..Config::default()
        };
        assert_eq!(config.resolved_db_path(), PathBuf::from("/srv/wa/inbound.db"));

        config.storage.db_path = Some("data/messages.db".into());
        assert_eq!(
            config.resolved_db_path(),
            PathBuf::from("/srv/wa/data/messages.db")
        );

        config.storage.db_path = Some("/var/lib/wa/inbound.db".into());
        assert_eq!(
            config.resolved_db_path(),
            PathBuf::from("/var/lib/wa/inbound.db")
        );
    }

    #[test]
    async fn env_overrides_apply() {
        let _env_guard = env_override_lock().await;
        let mut config = Config::default();

        std::env::set_var("WA_INBOUND_DB_PATH", "/tmp/override.db");
        std::env::set_var("WA_INBOUND_MEDIA_URL", "http://provider:3025");
        std::env::set_var("WA_INBOUND_MEDIA_API_KEY", "secret");
        std::env::set_var("WA_INBOUND_GATEWAY_PORT", "8081");
        config.apply_env_overrides();

        assert_eq!(config.resolved_db_path(), PathBuf::from("/tmp/override.db"));
        assert_eq!(
            config.media.provider_url.as_deref(),
            Some("http://provider:3025")
        );
        assert_eq!(config.media.api_key.as_deref(), Some("secret"));
        assert_eq!(config.gateway.port, 8081);

        for key in ENV_KEYS {
            std::env::remove_var(key);
        }
    }

    #[test]
    async fn env_override_invalid_port_is_ignored() {
        let _env_guard = env_override_lock().await;
        let mut config = Config::default();

        std::env::set_var("WA_INBOUND_GATEWAY_PORT", "not-a-port");
        config.apply_env_overrides();
        assert_eq!(config.gateway.port, 42718);

        std::env::remove_var("WA_INBOUND_GATEWAY_PORT");
    }

    #[test]
    async fn load_missing_file_yields_defaults_in_its_directory() {
        let _env_guard = env_override_lock().await;
        let tmp = tempfile::TempDir::new().unwrap();
        let path = tmp.path().join("config.toml");

        let config = Config::load(Some(&path)).await.unwrap();
        assert_eq!(config.workspace_dir, tmp.path());
        assert_eq!(config.resolved_db_path(), tmp.path().join("inbound.db"));
        assert!(!path.exists());
    }

    #[test]
    async fn load_reads_file_from_env_path() {
        let _env_guard = env_override_lock().await;
        let tmp = tempfile::TempDir::new().unwrap();
        let path = tmp.path().join("custom.toml");
        fs::write(&path, "[storage]\nbusy_timeout_ms = 250\n")
            .await
            .unwrap();

        std::env::set_var("WA_INBOUND_CONFIG", &path);
        let config = Config::load(None).await.unwrap();
        std::env::remove_var("WA_INBOUND_CONFIG");

        assert_eq!(config.config_path, path);
        assert_eq!(config.storage.busy_timeout_ms, 250);
    }

    #[test]
    async fn load_rejects_invalid_file() {
        let _env_guard = env_override_lock().await;
        let tmp = tempfile::TempDir::new().unwrap();
        let path = tmp.path().join("config.toml");
        fs::write(&path, "[media]\nmax_bytes = 0\n").await.unwrap();

        assert!(Config::load(Some(&path)).await.is_err());
    }
}
