use std::net::SocketAddr;
use std::path::{Path, PathBuf};

use anyhow::Context;
use serde::{Deserialize, Serialize};

/// Provider vendor families the gateway can talk to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum Vendor {
    Jan,
    OpenRouter,
    Gemini,
}

impl std::fmt::Display for Vendor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Vendor::Jan => write!(f, "jan"),
            Vendor::OpenRouter => write!(f, "open-router"),
            Vendor::Gemini => write!(f, "gemini"),
        }
    }
}

/// Whether a provider is the system default or supplied by an organization.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ProviderType {
    System,
    Organization,
}

/// Top-level configuration loaded from `config.yaml`.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// HTTP server settings.
    #[serde(default)]
    pub server: ServerConfig,
    /// Cache backend settings.
    #[serde(default)]
    pub cache: CacheConfig,
    /// Relational store settings.
    #[serde(default)]
    pub store: StoreConfig,
    /// API-key table mapping bearer keys to principals.
    #[serde(default)]
    pub auth: AuthConfig,
    /// The default system provider every request can fall back to.
    pub system_provider: SystemProviderConfig,
    /// Organization- and project-scoped provider entries.
    #[serde(default)]
    pub providers: Vec<ProviderEntry>,
    /// Model registry endpoints and refresh schedule.
    #[serde(default)]
    pub registry: RegistryConfig,
}

/// HTTP server settings.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct ServerConfig {
    /// Listen address. `JAN_GATEWAY_ADDR` overrides.
    #[serde(default = "default_addr")]
    pub addr: SocketAddr,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            addr: default_addr(),
        }
    }
}

fn default_addr() -> SocketAddr {
    "127.0.0.1:1337".parse().expect("static addr")
}

/// Cache backend settings. Without `redis_url` the gateway runs on
/// the no-op cache (every lookup misses, mutexes degrade to
/// single-process success).
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct CacheConfig {
    /// Redis connection URL. `JAN_GATEWAY_REDIS_URL` overrides.
    #[serde(default)]
    pub redis_url: Option<String>,
    /// Key prefix for every cache entry.
    #[serde(default = "default_key_prefix")]
    pub key_prefix: String,
}

fn default_key_prefix() -> String {
    "jan".to_string()
}

/// Relational store settings.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct StoreConfig {
    /// SQLite database path. Default: `<gateway_home>/gateway.db`.
    #[serde(default)]
    pub path: Option<PathBuf>,
}

impl StoreConfig {
    /// Resolve the database path, falling back to the home default.
    pub fn resolved_path(&self) -> PathBuf {
        self.path
            .clone()
            .unwrap_or_else(|| crate::gateway_home().join("gateway.db"))
    }
}

/// API-key table. Empty table means the gateway boots open with a
/// single development principal (logged loudly at startup).
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct AuthConfig {
    #[serde(default)]
    pub api_keys: Vec<ApiKeyEntry>,
}

/// One bearer key and the principal it authenticates as.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct ApiKeyEntry {
    /// Bearer key value (plain or `$ENV_VAR` reference).
    pub key: String,
    pub user_id: String,
    #[serde(default)]
    pub organization_id: Option<String>,
    #[serde(default)]
    pub project_ids: Vec<String>,
}

/// The default system provider.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct SystemProviderConfig {
    /// Public id clients may pass to select this provider explicitly.
    pub id: String,
    pub vendor: Vendor,
    /// Chat-completions base URL (e.g. `https://api.jan.ai/v1`).
    pub endpoint: String,
    /// API key (plain or `$ENV_VAR` reference). Optional for local
    /// servers that need none.
    #[serde(default)]
    pub api_key: Option<String>,
}

/// A scoped provider entry.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct ProviderEntry {
    /// Opaque public id (e.g. `prov_…`).
    pub public_id: String,
    pub name: String,
    pub vendor: Vendor,
    /// Owning organization. Entries without a `project_id` are
    /// org-scoped; with one they are project-scoped.
    pub organization_id: String,
    #[serde(default)]
    pub project_id: Option<String>,
    pub endpoint: String,
    /// API key (plain or `$ENV_VAR` reference).
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default = "default_true")]
    pub active: bool,
}

fn default_true() -> bool {
    true
}

/// Model registry settings.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct RegistryConfig {
    /// Inference endpoints to poll for model catalogues.
    #[serde(default)]
    pub endpoints: Vec<String>,
    /// Cron schedule for the refresh job.
    #[serde(default = "default_refresh_schedule")]
    pub refresh_schedule: String,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            endpoints: Vec::new(),
            refresh_schedule: default_refresh_schedule(),
        }
    }
}

fn default_refresh_schedule() -> String {
    // Every 5 minutes.
    "0 */5 * * * *".to_string()
}

impl Config {
    /// Load and validate configuration from a YAML file.
    pub async fn load(path: &Path) -> anyhow::Result<Self> {
        let raw = tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("read config: {}", path.display()))?;
        Self::parse(&raw)
    }

    /// Parse and validate configuration from a YAML string.
    pub fn parse(raw: &str) -> anyhow::Result<Self> {
        let mut cfg: Config = serde_yaml_ng::from_str(raw).context("parse config yaml")?;
        cfg.apply_env_overrides();
        cfg.validate()?;
        Ok(cfg)
    }

    fn apply_env_overrides(&mut self) {
        if let Ok(addr) = std::env::var("JAN_GATEWAY_ADDR") {
            if let Ok(parsed) = addr.parse() {
                self.server.addr = parsed;
            } else {
                tracing::warn!(value = %addr, "invalid JAN_GATEWAY_ADDR, keeping config value");
            }
        }
        if let Ok(url) = std::env::var("JAN_GATEWAY_REDIS_URL") {
            if !url.is_empty() {
                self.cache.redis_url = Some(url);
            }
        }
    }

    fn validate(&self) -> anyhow::Result<()> {
        let mut seen = std::collections::HashSet::new();
        for p in &self.providers {
            if !seen.insert(p.public_id.as_str()) {
                anyhow::bail!("duplicate provider public_id: {}", p.public_id);
            }
        }
        if seen.contains(self.system_provider.id.as_str()) {
            anyhow::bail!(
                "system provider id collides with a provider entry: {}",
                self.system_provider.id
            );
        }
        Ok(())
    }
}

/// Resolve a secret value: `$ENV_VAR` references read the environment,
/// anything else is returned verbatim. Missing env vars resolve to an
/// empty string (local servers may need no key).
pub fn resolve_secret(value: Option<&str>) -> String {
    match value {
        Some(v) => {
            if let Some(var) = v.strip_prefix('$') {
                std::env::var(var).unwrap_or_default()
            } else {
                v.to_string()
            }
        }
        None => String::new(),
    }
}
