use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::warn;

pub const ENV_PORT: &str = "PORT";
pub const ENV_BIND_ADDRESS: &str = "BIND_ADDRESS";
pub const ENV_LOG_LEVEL: &str = "LOG_LEVEL";
pub const ENV_API_BASE: &str = "API_BASE";
pub const ENV_AUTH_BASE_AUTHORIZE: &str = "AUTH_BASE_AUTHORIZE";
pub const ENV_AUTH_BASE_TOKEN: &str = "AUTH_BASE_TOKEN";
pub const ENV_CLIENT_ID: &str = "CLIENT_ID";
pub const ENV_TOKEN_FILE: &str = "TOKEN_FILE";
pub const ENV_ANTHROPIC_VERSION: &str = "ANTHROPIC_VERSION";
pub const ENV_ANTHROPIC_BETA: &str = "ANTHROPIC_BETA";
pub const ENV_REQUEST_TIMEOUT: &str = "REQUEST_TIMEOUT";
pub const ENV_CONNECT_TIMEOUT: &str = "CONNECT_TIMEOUT";
pub const ENV_DEFAULT_MODEL: &str = "DEFAULT_MODEL";
pub const ENV_THINKING_FORCE_ENABLED: &str = "THINKING_FORCE_ENABLED";
pub const ENV_THINKING_DEFAULT_BUDGET: &str = "THINKING_DEFAULT_BUDGET";

pub const DEFAULT_CLIENT_ID: &str = "9d1c250a-e61b-44d9-88ed-5944d1962f5e";
pub const DEFAULT_REDIRECT_URI: &str = "https://console.anthropic.com/oauth/code/callback";
pub const DEFAULT_SCOPES: &str = "org:create_api_key user:profile user:inference";

/// Fully resolved proxy settings.
///
/// Every field has a default so a partial `config.toml` is valid.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub server: ServerSettings,
    pub oauth: OAuthSettings,
    pub api: ApiSettings,
    pub thinking: ThinkingSettings,
    pub log_level: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerSettings {
    pub port: u16,
    pub bind_address: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OAuthSettings {
    /// Base for the interactive authorize page
    pub authorize_base: String,
    /// Base for the token endpoint (code exchange and refresh)
    pub token_base: String,
    pub client_id: String,
    pub redirect_uri: String,
    pub scopes: String,
    pub token_file: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ApiSettings {
    pub base_url: String,
    pub version: String,
    /// Extra comma-separated beta flags sent on every upstream call
    pub beta: Option<String>,
    pub default_model: String,
    /// Seconds to wait between reads from upstream
    pub request_timeout: u64,
    pub connect_timeout: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ThinkingSettings {
    /// Inject extended thinking into native requests that don't ask for it
    pub force_enabled: bool,
    pub default_budget: u64,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            server: ServerSettings::default(),
            oauth: OAuthSettings::default(),
            api: ApiSettings::default(),
            thinking: ThinkingSettings::default(),
            log_level: "info".to_string(),
        }
    }
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            port: 8081,
            bind_address: "127.0.0.1".to_string(),
        }
    }
}

impl Default for OAuthSettings {
    fn default() -> Self {
        Self {
            authorize_base: "https://claude.ai".to_string(),
            token_base: "https://console.anthropic.com".to_string(),
            client_id: DEFAULT_CLIENT_ID.to_string(),
            redirect_uri: DEFAULT_REDIRECT_URI.to_string(),
            scopes: DEFAULT_SCOPES.to_string(),
            token_file: default_token_file(),
        }
    }
}

impl Default for ApiSettings {
    fn default() -> Self {
        Self {
            base_url: "https://api.anthropic.com".to_string(),
            version: "2023-06-01".to_string(),
            beta: None,
            default_model: "claude-3-7-sonnet-latest".to_string(),
            request_timeout: 120,
            connect_timeout: 30,
        }
    }
}

impl Default for ThinkingSettings {
    fn default() -> Self {
        Self {
            force_enabled: false,
            default_budget: 16_000,
        }
    }
}

fn default_token_file() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".anthropic-oauth-proxy")
        .join("tokens.json")
}

/// Expand a leading `~/` against the home directory.
fn expand_home(path: &Path) -> PathBuf {
    if let Ok(rest) = path.strip_prefix("~")
        && let Some(home) = dirs::home_dir()
    {
        return home.join(rest);
    }
    path.to_path_buf()
}

/// Check if a string value represents a truthy boolean (1, true, yes, y, on)
pub fn is_truthy(value: &str) -> bool {
    matches!(
        value.trim().to_ascii_lowercase().as_str(),
        "1" | "true" | "yes" | "y" | "on"
    )
}

fn parse_env<T: std::str::FromStr>(key: &str, raw: &str) -> Option<T> {
    match raw.trim().parse() {
        Ok(value) => Some(value),
        Err(_) => {
            warn!("Ignoring unparsable {}={:?}", key, raw);
            None
        }
    }
}

impl Settings {
    /// Returns the default config directory path
    pub fn config_dir() -> Option<PathBuf> {
        dirs::config_dir().map(|p| p.join("anthropic-oauth-proxy"))
    }

    /// Returns the full path to the default config file
    pub fn config_file_path() -> Option<PathBuf> {
        Self::config_dir().map(|p| p.join("config.toml"))
    }

    /// Load settings: file (explicit path or default location), then
    /// environment overrides. A missing default file is not an error.
    pub fn load(explicit: Option<&Path>) -> Result<Self> {
        let mut settings = match explicit {
            Some(path) => Self::from_file(path)?,
            None => match Self::config_file_path() {
                Some(path) if path.exists() => Self::from_file(&path)?,
                _ => Self::default(),
            },
        };
        settings.apply_env(|key| std::env::var(key).ok());
        settings.oauth.token_file = expand_home(&settings.oauth.token_file);
        Ok(settings)
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let contents = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        toml::from_str(&contents)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))
    }

    /// Apply environment overrides using `lookup` to read variables.
    pub fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(v) = lookup(ENV_PORT).and_then(|v| parse_env(ENV_PORT, &v)) {
            self.server.port = v;
        }
        if let Some(v) = lookup(ENV_BIND_ADDRESS) {
            self.server.bind_address = v;
        }
        if let Some(v) = lookup(ENV_LOG_LEVEL) {
            self.log_level = v.to_ascii_lowercase();
        }
        if let Some(v) = lookup(ENV_API_BASE) {
            self.api.base_url = v;
        }
        if let Some(v) = lookup(ENV_AUTH_BASE_AUTHORIZE) {
            self.oauth.authorize_base = v;
        }
        if let Some(v) = lookup(ENV_AUTH_BASE_TOKEN) {
            self.oauth.token_base = v;
        }
        if let Some(v) = lookup(ENV_CLIENT_ID) {
            self.oauth.client_id = v;
        }
        if let Some(v) = lookup(ENV_TOKEN_FILE) {
            self.oauth.token_file = PathBuf::from(v);
        }
        if let Some(v) = lookup(ENV_ANTHROPIC_VERSION) {
            self.api.version = v;
        }
        if let Some(v) = lookup(ENV_ANTHROPIC_BETA) {
            self.api.beta = Some(v);
        }
        if let Some(v) = lookup(ENV_REQUEST_TIMEOUT)
            .and_then(|v| parse_env::<f64>(ENV_REQUEST_TIMEOUT, &v))
            .filter(|v| *v > 0.0)
        {
            self.api.request_timeout = v.ceil() as u64;
        }
        if let Some(v) = lookup(ENV_CONNECT_TIMEOUT)
            .and_then(|v| parse_env::<f64>(ENV_CONNECT_TIMEOUT, &v))
            .filter(|v| *v > 0.0)
        {
            self.api.connect_timeout = v.ceil() as u64;
        }
        if let Some(v) = lookup(ENV_DEFAULT_MODEL) {
            self.api.default_model = v;
        }
        if let Some(v) = lookup(ENV_THINKING_FORCE_ENABLED) {
            self.thinking.force_enabled = is_truthy(&v);
        }
        if let Some(v) = lookup(ENV_THINKING_DEFAULT_BUDGET)
            .and_then(|v| parse_env(ENV_THINKING_DEFAULT_BUDGET, &v))
        {
            self.thinking.default_budget = v;
        }
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.api.request_timeout)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.api.connect_timeout)
    }

    /// Scratch file holding the PKCE verifier between `login` and the code
    /// exchange. Lives beside the token file, in the same private directory.
    pub fn pkce_file(&self) -> PathBuf {
        self.oauth.token_file.with_file_name("pkce.json")
    }
}
