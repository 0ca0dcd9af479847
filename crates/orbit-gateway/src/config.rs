use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;
use tokio::fs;

/// Environment variable selecting the credential backend (`file` | `remote`).
pub const ENV_AUTH_BACKEND: &str = "ORBIT_AUTH_BACKEND";
pub const ENV_AUTH_URL: &str = "ORBIT_AUTH_URL";
pub const ENV_AUTH_BUCKET: &str = "ORBIT_AUTH_BUCKET";
pub const ENV_AUTH_TOKEN: &str = "ORBIT_AUTH_TOKEN";
/// Set by the orchestrator; names the account's folder in remote storage.
pub const ENV_SESSION_ID: &str = "WHATSAPP_SESSION_ID";

// ============================================================================
// GatewayConfig (root)
// ============================================================================

#[derive(Debug, Clone, Default, Deserialize)]
pub struct GatewayConfig {
    #[serde(default)]
    pub auth: AuthConfig,
    #[serde(default)]
    pub adapter: AdapterConfig,
    #[serde(default)]
    pub timing: TimingConfig,
    #[serde(default)]
    pub queue: QueueConfig,
    #[serde(default)]
    pub history: HistoryConfig,
    #[serde(default)]
    pub media: MediaConfig,
    #[serde(default)]
    pub control: ControlConfig,
}

impl GatewayConfig {
    /// Load from a YAML file. A missing file yields defaults.
    pub async fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let contents = match fs::read_to_string(path).await {
            Ok(c) => c,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Self::default()),
            Err(e) => return Err(ConfigError::Io(e)),
        };
        Ok(serde_saphyr::from_str(&contents)?)
    }

    /// Apply environment overrides from the process environment.
    pub fn apply_env(&mut self) -> Result<(), ConfigError> {
        self.apply_env_from(|key| std::env::var(key).ok())
    }

    /// Apply environment overrides using the given lookup.
    pub fn apply_env_from(
        &mut self,
        lookup: impl Fn(&str) -> Option<String>,
    ) -> Result<(), ConfigError> {
        let non_empty = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        if let Some(backend) = non_empty(ENV_AUTH_BACKEND) {
            self.auth.backend = match backend.trim().to_ascii_lowercase().as_str() {
                "file" | "local" => AuthBackend::File,
                "remote" | "object" => AuthBackend::Remote,
                other => return Err(ConfigError::InvalidBackend(other.to_string())),
            };
        }
        if let Some(url) = non_empty(ENV_AUTH_URL) {
            self.auth.remote.url = Some(url);
        }
        if let Some(bucket) = non_empty(ENV_AUTH_BUCKET) {
            self.auth.remote.bucket = bucket;
        }
        if let Some(token) = non_empty(ENV_AUTH_TOKEN) {
            self.auth.remote.token = Some(token);
        }
        if let Some(session_id) = non_empty(ENV_SESSION_ID) {
            self.auth.remote.prefix = Some(session_id);
        }
        Ok(())
    }

    /// Media directory, defaulting to a `media` folder beside the auth dir.
    pub fn media_dir(&self, auth_dir: &Path) -> PathBuf {
        match &self.media.dir {
            Some(dir) => dir.clone(),
            None => auth_dir
                .parent()
                .unwrap_or_else(|| Path::new("."))
                .join("media"),
        }
    }
}

// ============================================================================
// AuthConfig
// ============================================================================

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuthBackend {
    #[default]
    File,
    Remote,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AuthConfig {
    #[serde(default)]
    pub backend: AuthBackend,
    /// Cap on simultaneous key writes.
    #[serde(default = "default_write_concurrency")]
    pub write_concurrency: usize,
    #[serde(default)]
    pub remote: RemoteAuthConfig,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            backend: AuthBackend::default(),
            write_concurrency: default_write_concurrency(),
            remote: RemoteAuthConfig::default(),
        }
    }
}

fn default_write_concurrency() -> usize {
    20
}

#[derive(Debug, Clone, Deserialize)]
pub struct RemoteAuthConfig {
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default = "default_bucket")]
    pub bucket: String,
    #[serde(default)]
    pub token: Option<String>,
    /// Folder for this account. Defaults to the auth directory's name.
    #[serde(default)]
    pub prefix: Option<String>,
    #[serde(default = "default_delete_batch")]
    pub delete_batch_size: usize,
    #[serde(default = "default_list_page")]
    pub list_page_size: usize,
}

impl RemoteAuthConfig {
    pub const DEFAULT_DELETE_BATCH: usize = 1000;
    pub const DEFAULT_LIST_PAGE: usize = 1000;
}

impl Default for RemoteAuthConfig {
    fn default() -> Self {
        Self {
            url: None,
            bucket: default_bucket(),
            token: None,
            prefix: None,
            delete_batch_size: default_delete_batch(),
            list_page_size: default_list_page(),
        }
    }
}

fn default_bucket() -> String {
    "orbit-auth".to_string()
}

fn default_delete_batch() -> usize {
    RemoteAuthConfig::DEFAULT_DELETE_BATCH
}

fn default_list_page() -> usize {
    RemoteAuthConfig::DEFAULT_LIST_PAGE
}

// ============================================================================
// AdapterConfig
// ============================================================================

#[derive(Debug, Clone, Deserialize)]
pub struct AdapterConfig {
    /// Session helper executable.
    #[serde(default = "default_helper_command")]
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default = "default_request_timeout")]
    pub request_timeout_seconds: u64,
}

impl Default for AdapterConfig {
    fn default() -> Self {
        Self {
            command: default_helper_command(),
            args: Vec::new(),
            request_timeout_seconds: default_request_timeout(),
        }
    }
}

impl AdapterConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_seconds)
    }
}

fn default_helper_command() -> String {
    "orbit-session-helper".to_string()
}

fn default_request_timeout() -> u64 {
    30
}

// ============================================================================
// TimingConfig
// ============================================================================

#[derive(Debug, Clone, Deserialize)]
pub struct TimingConfig {
    #[serde(default = "default_debounce_ms")]
    pub contact_debounce_ms: u64,
    #[serde(default = "default_resweep_secs")]
    pub contact_resweep_seconds: u64,
    #[serde(default = "default_heartbeat_secs")]
    pub heartbeat_seconds: u64,
    /// Must exceed the network's session-takeover grace window.
    #[serde(default = "default_logout_cooldown_secs")]
    pub logout_cooldown_seconds: u64,
    #[serde(default = "default_conflict_backoff_ms")]
    pub conflict_backoff_ms: u64,
    #[serde(default = "default_transient_backoff_ms")]
    pub transient_backoff_ms: u64,
}

impl Default for TimingConfig {
    fn default() -> Self {
        Self {
            contact_debounce_ms: default_debounce_ms(),
            contact_resweep_seconds: default_resweep_secs(),
            heartbeat_seconds: default_heartbeat_secs(),
            logout_cooldown_seconds: default_logout_cooldown_secs(),
            conflict_backoff_ms: default_conflict_backoff_ms(),
            transient_backoff_ms: default_transient_backoff_ms(),
        }
    }
}

impl TimingConfig {
    pub fn contact_debounce(&self) -> Duration {
        Duration::from_millis(self.contact_debounce_ms)
    }

    pub fn contact_resweep(&self) -> Duration {
        Duration::from_secs(self.contact_resweep_seconds.max(1))
    }

    pub fn heartbeat(&self) -> Duration {
        Duration::from_secs(self.heartbeat_seconds.max(1))
    }

    pub fn logout_cooldown(&self) -> Duration {
        Duration::from_secs(self.logout_cooldown_seconds)
    }

    pub fn conflict_backoff(&self) -> Duration {
        Duration::from_millis(self.conflict_backoff_ms)
    }

    pub fn transient_backoff(&self) -> Duration {
        Duration::from_millis(self.transient_backoff_ms)
    }
}

fn default_debounce_ms() -> u64 {
    1000
}

fn default_resweep_secs() -> u64 {
    300
}

fn default_heartbeat_secs() -> u64 {
    30
}

fn default_logout_cooldown_secs() -> u64 {
    12
}

fn default_conflict_backoff_ms() -> u64 {
    5000
}

fn default_transient_backoff_ms() -> u64 {
    500
}

// ============================================================================
// QueueConfig
// ============================================================================

#[derive(Debug, Clone, Deserialize)]
pub struct QueueConfig {
    /// Total attempts per command, including the first.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    /// Pause after every attempt.
    #[serde(default = "default_pause_ms")]
    pub pause_ms: u64,
    /// Toggle composing/paused presence around sends.
    #[serde(default = "default_true")]
    pub presence: bool,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            pause_ms: default_pause_ms(),
            presence: default_true(),
        }
    }
}

impl QueueConfig {
    pub fn pause(&self) -> Duration {
        Duration::from_millis(self.pause_ms)
    }
}

fn default_max_attempts() -> u32 {
    3
}

fn default_pause_ms() -> u64 {
    1000
}

fn default_true() -> bool {
    true
}

// ============================================================================
// HistoryConfig / MediaConfig / ControlConfig
// ============================================================================

#[derive(Debug, Clone, Deserialize)]
pub struct HistoryConfig {
    #[serde(default = "default_history_cap")]
    pub max_per_address: usize,
}

impl Default for HistoryConfig {
    fn default() -> Self {
        Self {
            max_per_address: default_history_cap(),
        }
    }
}

fn default_history_cap() -> usize {
    50
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct MediaConfig {
    #[serde(default)]
    pub dir: Option<PathBuf>,
}

/// Phrases the operator can send from their own device to pause or resume
/// the agent.
#[derive(Debug, Clone, Deserialize)]
pub struct ControlConfig {
    #[serde(default = "default_stop_phrase")]
    pub stop_phrase: String,
    #[serde(default = "default_start_phrase")]
    pub start_phrase: String,
}

impl Default for ControlConfig {
    fn default() -> Self {
        Self {
            stop_phrase: default_stop_phrase(),
            start_phrase: default_start_phrase(),
        }
    }
}

fn default_stop_phrase() -> String {
    "stop orbit".to_string()
}

fn default_start_phrase() -> String {
    "start orbit".to_string()
}

// ============================================================================
// ConfigError
// ============================================================================

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse config file: {0}")]
    Yaml(#[from] serde_saphyr::Error),

    #[error("unknown auth backend {0:?} (expected \"file\" or \"remote\")")]
    InvalidBackend(String),
}

// ============================================================================
// Tests
// ============================================================================
