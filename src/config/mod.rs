use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::info;

use crate::transport::TransportProfile;
use crate::types::error::NotesError;
use crate::types::Platform;

/// Application configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    /// Identity platform registration
    pub identity: IdentityConfig,

    /// Remote comment list
    pub store: StoreConfig,

    /// Refresh and host polling
    #[serde(default)]
    pub sync: SyncSettings,

    /// Override the platform reported by the host
    #[serde(default)]
    pub platform: Option<Platform>,
}

/// Identity platform configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IdentityConfig {
    /// Application (client) id
    pub client_id: String,

    /// Authority URL, without the trailing `/oauth2/...`
    #[serde(default = "default_authority")]
    pub authority: String,

    /// Document-store host the attachment scope is derived from
    pub tenant_host: String,
}

/// Remote comment list configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Collaboration API root
    #[serde(default = "default_graph_base_url")]
    pub graph_base_url: String,

    /// Site holding the comment list
    pub site_id: String,

    /// Comment list id (a GUID)
    pub list_id: String,

    /// Document-store site root, e.g. `https://contoso.sharepoint.com/sites/ops`
    pub site_url: String,

    /// Where thread filtering happens
    #[serde(default)]
    pub filter: FilterMode,
}

/// Thread filtering strategy for listing comments
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FilterMode {
    /// Field-equality filter evaluated by the store
    Server,
    /// Fetch the whole list and compare normalized keys locally
    #[default]
    Client,
}

/// Sync loop timing
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncSettings {
    /// Interval between background refreshes
    #[serde(default = "default_refresh_interval_secs")]
    pub refresh_interval_secs: u64,

    /// Interval between host readiness checks
    #[serde(default = "default_host_poll_interval_ms")]
    pub host_poll_interval_ms: u64,

    /// Host readiness checks before giving up
    #[serde(default = "default_host_poll_attempts")]
    pub host_poll_attempts: u32,

    /// Directory entries fetched for the mention picker
    #[serde(default = "default_directory_page_size")]
    pub directory_page_size: u32,
}

fn default_authority() -> String {
    "https://login.microsoftonline.com/common".to_string()
}

fn default_graph_base_url() -> String {
    "https://graph.microsoft.com/v1.0".to_string()
}

fn default_refresh_interval_secs() -> u64 {
    15
}

fn default_host_poll_interval_ms() -> u64 {
    100
}

fn default_host_poll_attempts() -> u32 {
    600
}

fn default_directory_page_size() -> u32 {
    50
}

impl Default for SyncSettings {
    fn default() -> Self {
        Self {
            refresh_interval_secs: default_refresh_interval_secs(),
            host_poll_interval_ms: default_host_poll_interval_ms(),
            host_poll_attempts: default_host_poll_attempts(),
            directory_page_size: default_directory_page_size(),
        }
    }
}

impl SyncSettings {
    pub fn refresh_interval(&self) -> Duration {
        Duration::from_secs(self.refresh_interval_secs.max(1))
    }

    pub fn host_poll_interval(&self) -> Duration {
        Duration::from_millis(self.host_poll_interval_ms)
    }
}

impl AppConfig {
    /// Parse and validate a TOML document
    pub fn from_toml(content: &str) -> Result<Self, NotesError> {
        let config: AppConfig = toml::from_str(content)
            .map_err(|e| NotesError::Config(format!("Failed to parse config: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), NotesError> {
        let required = [
            ("identity.client_id", &self.identity.client_id),
            ("identity.tenant_host", &self.identity.tenant_host),
            ("store.site_id", &self.store.site_id),
            ("store.list_id", &self.store.list_id),
            ("store.site_url", &self.store.site_url),
        ];
        for (name, value) in required {
            if value.trim().is_empty() {
                return Err(NotesError::Config(format!("{} must not be empty", name)));
            }
        }
        Ok(())
    }

    /// Transport profile for the effective platform
    ///
    /// The configured override wins over what the host reports.
    pub fn transport_profile(&self, host_platform: Platform) -> TransportProfile {
        TransportProfile::for_platform(self.platform.unwrap_or(host_platform))
    }
}

/// Get default config paths
pub fn default_config_paths() -> Vec<PathBuf> {
    let mut paths = Vec::new();

    // XDG config path
    if let Some(config_dir) = dirs::config_dir() {
        paths.push(config_dir.join("threadnotes").join("config.toml"));
    }

    // Home directory fallback
    if let Some(home_dir) = dirs::home_dir() {
        paths.push(
            home_dir
                .join(".config")
                .join("threadnotes")
                .join("config.toml"),
        );
        paths.push(home_dir.join(".threadnotes.toml"));
    }

    paths
}

/// Load configuration from the first default path that exists
pub fn load_default() -> Result<AppConfig, NotesError> {
    info!("Loading configuration from default paths");

    for path in default_config_paths() {
        if path.exists() {
            info!("Found config at: {:?}", path);
            return load_from_path(&path);
        }
    }

    Err(NotesError::Config(
        "No config file found in default locations".to_string(),
    ))
}

/// Load configuration from a specific path
pub fn load_from_path(path: &Path) -> Result<AppConfig, NotesError> {
    info!("Loading configuration from: {:?}", path);

    let content = fs::read_to_string(path)
        .map_err(|e| NotesError::Config(format!("Failed to read config: {}", e)))?;

    AppConfig::from_toml(&content)
}
