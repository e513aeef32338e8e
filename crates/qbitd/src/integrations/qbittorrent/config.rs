use std::fmt;
use std::time::Duration;

use serde::Deserialize;

fn default_true() -> bool {
    true
}

fn default_poll_interval_seconds() -> u64 {
    30
}

/// Configuration for one qBittorrent instance
#[derive(Clone, Deserialize)]
pub struct Config {
    /// WebUI base URL (e.g. "http://localhost:8080")
    pub url: String,

    pub username: String,

    pub password: String,

    /// Verify the WebUI's TLS certificate (default: true)
    #[serde(default = "default_true")]
    pub verify_ssl: bool,

    /// Seconds between scheduled refreshes (default: 30)
    #[serde(default = "default_poll_interval_seconds")]
    pub poll_interval_seconds: u64,

    /// Whether this instance is enabled (default: true)
    #[serde(default = "default_true")]
    pub enabled: bool,
}

impl Config {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_seconds)
    }

    /// Check field values that serde cannot express
    pub fn validate(&self) -> Result<(), String> {
        if self.poll_interval_seconds == 0 {
            return Err("poll_interval_seconds must be greater than 0".to_string());
        }

        let url = reqwest::Url::parse(&self.url)
            .map_err(|e| format!("url '{}' is invalid: {}", self.url, e))?;
        if !matches!(url.scheme(), "http" | "https") {
            return Err(format!("url '{}' must use http or https", self.url));
        }

        Ok(())
    }
}

// Hand-written so the password never ends up in logs
impl fmt::Debug for Config {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Config")
            .field("url", &self.url)
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .field("verify_ssl", &self.verify_ssl)
            .field("poll_interval_seconds", &self.poll_interval_seconds)
            .field("enabled", &self.enabled)
            .finish()
    }
}
