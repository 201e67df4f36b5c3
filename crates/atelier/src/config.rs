use anyhow::{Context, Result};
use serde::{Deserialize, Deserializer};
use std::{fs, path::Path, path::PathBuf, time::Duration};

const DEFAULT_API_BASE_URL: &str = "http://localhost:8888";
const DEFAULT_AI_BASE_URL: &str = "http://localhost:9999";

/// Endpoints and timing knobs for the client layer.
///
/// Every field has a default, so an empty file is a valid configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Identity service.
    pub api_base_url: String,
    /// AI feature and chat service.
    pub ai_base_url: String,
    pub refresh_path: String,
    /// Append the refresh token to `refresh_path` instead of relying on a cookie.
    pub refresh_token_in_path: bool,
    pub features_prefix: String,
    pub chat_prefix: String,
    #[serde(deserialize_with = "de_duration")]
    pub request_timeout: Duration,
    pub poll: PollConfig,
    pub tracker: TrackerConfig,
    pub rate_limit: RateLimitConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PollConfig {
    pub max_attempts: u32,
    #[serde(deserialize_with = "de_duration")]
    pub interval: Duration,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct TrackerConfig {
    #[serde(deserialize_with = "de_duration")]
    pub tick: Duration,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RateLimitConfig {
    pub max_calls: usize,
    #[serde(deserialize_with = "de_duration")]
    pub window: Duration,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            api_base_url: DEFAULT_API_BASE_URL.to_string(),
            ai_base_url: DEFAULT_AI_BASE_URL.to_string(),
            refresh_path: "/api/v1/identity/auth/refresh-token".to_string(),
            refresh_token_in_path: false,
            features_prefix: "/v1/features".to_string(),
            chat_prefix: "/chat/sessions".to_string(),
            request_timeout: Duration::from_secs(30),
            poll: PollConfig::default(),
            tracker: TrackerConfig::default(),
            rate_limit: RateLimitConfig::default(),
        }
    }
}

impl Default for PollConfig {
    fn default() -> Self {
        Self {
            max_attempts: 60,
            interval: Duration::from_millis(3000),
        }
    }
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            tick: Duration::from_secs(2),
        }
    }
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            max_calls: 5,
            window: Duration::from_secs(2),
        }
    }
}

/// Accepts either a humantime string (`"3s"`, `"250ms"`) or a bare number of
/// milliseconds.
fn de_duration<'de, D>(deserializer: D) -> std::result::Result<Duration, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Millis(u64),
        Text(String),
    }

    match Raw::deserialize(deserializer)? {
        Raw::Millis(ms) => Ok(Duration::from_millis(ms)),
        Raw::Text(s) => humantime::parse_duration(&s).map_err(serde::de::Error::custom),
    }
}

impl ClientConfig {
    pub fn from_toml_str(content: &str) -> Result<Self> {
        toml::from_str(content).context("Failed to parse client config")
    }

    pub fn from_path<P: AsRef<Path>>(path: P) -> Result<Self> {
        let p: &Path = path.as_ref();
        if !p.exists() {
            return Err(anyhow::anyhow!("Config file not found at: {}", p.display()));
        }
        let ext = p.extension().and_then(|e| e.to_str()).unwrap_or("");

        let content = fs::read_to_string(p)
            .with_context(|| format!("Failed to read config file at {}", p.display()))?;

        let config = match ext {
            "json" => serde_json::from_str(&content)?,
            "toml" => toml::from_str(&content)?,
            _ => return Err(anyhow::anyhow!("Unsupported config format: {}", ext)),
        };

        Ok(config)
    }

    /// `<config dir>/atelier/config.toml`, if the platform has a config dir.
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|d| d.join("atelier").join("config.toml"))
    }

    /// Loads the default config file when present, defaults otherwise.
    pub fn load_default() -> Result<Self> {
        match Self::default_path() {
            Some(path) if path.exists() => Self::from_path(path),
            _ => {
                log::debug!("No config file found, using defaults");
                Ok(Self::default())
            }
        }
    }

    pub fn with_env_overrides(mut self) -> Self {
        if let Ok(url) = std::env::var("ATELIER_API_BASE_URL") {
            self.api_base_url = url;
        }
        if let Ok(url) = std::env::var("ATELIER_AI_BASE_URL") {
            self.ai_base_url = url;
        }
        self
    }

    pub fn refresh_url(&self) -> String {
        join_url(&self.api_base_url, &self.refresh_path)
    }

    pub fn feature_url(&self, path: &str) -> String {
        join_url(&self.ai_base_url, &format!("{}/{}", self.features_prefix, path))
    }

    pub fn chat_url(&self) -> String {
        join_url(&self.ai_base_url, &self.chat_prefix)
    }
}

fn join_url(base: &str, path: &str) -> String {
    format!(
        "{}/{}",
        base.trim_end_matches('/'),
        path.trim_start_matches('/')
    )
}
