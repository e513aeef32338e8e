use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::StatusCode;
use reqwest::Url;
use reqwest::header;
use tracing::debug;

use super::QbittorrentConfig;

/// Full `sync/maindata` payload
pub type Snapshot = serde_json::Map<String, serde_json::Value>;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("login required")]
    LoginRequired,

    #[error("request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("{endpoint} returned HTTP {status}")]
    UnexpectedStatus { endpoint: String, status: StatusCode },

    #[error("invalid response from {endpoint}: {message}")]
    InvalidResponse { endpoint: String, message: String },
}

/// Operations qbitd needs from a qBittorrent instance
///
/// This trait allows for mocking the WebUI client for testing purposes
#[async_trait]
pub trait QbittorrentClient: Send + Sync {
    /// Authenticate and start a session
    async fn login(&self) -> Result<(), ClientError>;

    /// Fetch the full status payload
    async fn sync_main_data(&self) -> Result<Snapshot, ClientError>;

    /// Whether alternative speed limits are currently active
    async fn alternative_speed_status(&self) -> Result<bool, ClientError>;

    /// Flip the alternative speed limits mode
    async fn toggle_alternative_speed(&self) -> Result<(), ClientError>;
}

/// qBittorrent WebUI (API v2) client using reqwest
pub struct WebUiClient {
    http: reqwest::Client,
    base_url: Url,
    username: String,
    password: String,
    authenticated: AtomicBool,
}

impl WebUiClient {
    /// Create a new WebUiClient from configuration
    pub fn new(config: &QbittorrentConfig) -> anyhow::Result<Self> {
        let mut base_url = Url::parse(&config.url)?;
        // Url::join drops the last path segment unless it ends with a slash
        if !base_url.path().ends_with('/') {
            base_url.set_path(&format!("{}/", base_url.path()));
        }

        // The WebUI rejects requests whose Referer does not match its own host
        let mut headers = header::HeaderMap::new();
        headers.insert(
            header::REFERER,
            header::HeaderValue::from_str(base_url.as_str())?,
        );

        let http = reqwest::Client::builder()
            .cookie_store(true)
            .default_headers(headers)
            .timeout(REQUEST_TIMEOUT)
            .danger_accept_invalid_certs(!config.verify_ssl)
            .build()?;

        Ok(Self {
            http,
            base_url,
            username: config.username.clone(),
            password: config.password.clone(),
            authenticated: AtomicBool::new(false),
        })
    }

    fn endpoint(&self, path: &str) -> Result<Url, ClientError> {
        self.base_url
            .join("api/v2/")
            .and_then(|u| u.join(path))
            .map_err(|e| ClientError::InvalidResponse {
                endpoint: path.to_string(),
                message: e.to_string(),
            })
    }

    /// Check the session and HTTP status of a response
    fn check(
        &self,
        path: &str,
        response: reqwest::Response,
    ) -> Result<reqwest::Response, ClientError> {
        match response.status() {
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
                self.authenticated.store(false, Ordering::Release);
                Err(ClientError::LoginRequired)
            }
            status if status.is_success() => Ok(response),
            status => Err(ClientError::UnexpectedStatus {
                endpoint: path.to_string(),
                status,
            }),
        }
    }

    async fn get(
        &self,
        path: &str,
        query: &[(&str, &str)],
    ) -> Result<reqwest::Response, ClientError> {
        if !self.authenticated.load(Ordering::Acquire) {
            return Err(ClientError::LoginRequired);
        }
        let response = self
            .http
            .get(self.endpoint(path)?)
            .query(query)
            .send()
            .await?;
        self.check(path, response)
    }

    async fn post(&self, path: &str) -> Result<reqwest::Response, ClientError> {
        if !self.authenticated.load(Ordering::Acquire) {
            return Err(ClientError::LoginRequired);
        }
        let response = self.http.post(self.endpoint(path)?).send().await?;
        self.check(path, response)
    }
}

#[async_trait]
impl QbittorrentClient for WebUiClient {
    async fn login(&self) -> Result<(), ClientError> {
        let path = "auth/login";
        let response = self
            .http
            .post(self.endpoint(path)?)
            .form(&[
                ("username", self.username.as_str()),
                ("password", self.password.as_str()),
            ])
            .send()
            .await?;

        // Banned IPs get a 403, bad credentials a 200 with "Fails."
        if response.status() == StatusCode::FORBIDDEN {
            return Err(ClientError::LoginRequired);
        }
        let body = self.check(path, response)?.text().await?;
        if body.trim() != "Ok." {
            self.authenticated.store(false, Ordering::Release);
            return Err(ClientError::LoginRequired);
        }

        debug!("Logged in to {}", self.base_url);
        self.authenticated.store(true, Ordering::Release);
        Ok(())
    }

    async fn sync_main_data(&self) -> Result<Snapshot, ClientError> {
        let path = "sync/maindata";
        let value: serde_json::Value = self
            .get(path, &[("rid", "0")])
            .await?
            .json()
            .await?;
        match value {
            serde_json::Value::Object(map) => Ok(map),
            other => Err(ClientError::InvalidResponse {
                endpoint: path.to_string(),
                message: format!("expected a JSON object, got {}", other),
            }),
        }
    }

    async fn alternative_speed_status(&self) -> Result<bool, ClientError> {
        let path = "transfer/speedLimitsMode";
        let body = self.get(path, &[]).await?.text().await?;
        parse_speed_limits_mode(&body).ok_or_else(|| ClientError::InvalidResponse {
            endpoint: path.to_string(),
            message: format!("unexpected mode {:?}", body),
        })
    }

    async fn toggle_alternative_speed(&self) -> Result<(), ClientError> {
        self.post("transfer/toggleSpeedLimitsMode").await?;
        Ok(())
    }
}

/// `speedLimitsMode` is "1" when alternative limits are active, "0" otherwise
fn parse_speed_limits_mode(body: &str) -> Option<bool> {
    match body.trim() {
        "1" => Some(true),
        "0" => Some(false),
        _ => None,
    }
}

/// Scripted failure for the mock client
#[cfg(test)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MockFailure {
    LoginRequired,
    Unreachable,
}

#[cfg(test)]
impl MockFailure {
    fn into_error(self, endpoint: &str) -> ClientError {
        match self {
            MockFailure::LoginRequired => ClientError::LoginRequired,
            MockFailure::Unreachable => ClientError::UnexpectedStatus {
                endpoint: endpoint.to_string(),
                status: StatusCode::BAD_GATEWAY,
            },
        }
    }
}

/// Mock qBittorrent for testing
///
/// Holds the "remote" alternative speed mode and counts calls.
#[cfg(test)]
#[derive(Debug, Default)]
pub struct MockQbittorrentClient {
    pub alt_speed: AtomicBool,
    pub login_calls: std::sync::atomic::AtomicUsize,
    pub sync_calls: std::sync::atomic::AtomicUsize,
    pub toggle_calls: std::sync::atomic::AtomicUsize,
    pub fail_login: std::sync::Mutex<Option<MockFailure>>,
    pub fail_sync: std::sync::Mutex<Option<MockFailure>>,
    pub fail_status: std::sync::Mutex<Option<MockFailure>>,
    pub fail_toggle: std::sync::Mutex<Option<MockFailure>>,
}

#[cfg(test)]
impl MockQbittorrentClient {
    /// Create a new mock client with the given remote mode
    pub fn new(alt_speed: bool) -> Self {
        Self {
            alt_speed: AtomicBool::new(alt_speed),
            ..Default::default()
        }
    }

    pub fn set_remote_alt_speed(&self, enabled: bool) {
        self.alt_speed.store(enabled, Ordering::SeqCst);
    }

    pub fn fail_sync_with(&self, failure: Option<MockFailure>) {
        *self.fail_sync.lock().unwrap() = failure;
    }

    pub fn fail_status_with(&self, failure: Option<MockFailure>) {
        *self.fail_status.lock().unwrap() = failure;
    }

    pub fn fail_toggle_with(&self, failure: Option<MockFailure>) {
        *self.fail_toggle.lock().unwrap() = failure;
    }

    pub fn fail_login_with(&self, failure: Option<MockFailure>) {
        *self.fail_login.lock().unwrap() = failure;
    }

    pub fn login_calls(&self) -> usize {
        self.login_calls.load(Ordering::SeqCst)
    }

    pub fn sync_calls(&self) -> usize {
        self.sync_calls.load(Ordering::SeqCst)
    }

    pub fn toggle_calls(&self) -> usize {
        self.toggle_calls.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
#[async_trait]
impl QbittorrentClient for MockQbittorrentClient {
    async fn login(&self) -> Result<(), ClientError> {
        self.login_calls.fetch_add(1, Ordering::SeqCst);
        match *self.fail_login.lock().unwrap() {
            Some(failure) => Err(failure.into_error("auth/login")),
            None => Ok(()),
        }
    }

    async fn sync_main_data(&self) -> Result<Snapshot, ClientError> {
        let call = self.sync_calls.fetch_add(1, Ordering::SeqCst) + 1;
        if let Some(failure) = *self.fail_sync.lock().unwrap() {
            return Err(failure.into_error("sync/maindata"));
        }
        let mut snapshot = Snapshot::new();
        snapshot.insert("rid".to_string(), serde_json::json!(call));
        snapshot.insert(
            "server_state".to_string(),
            serde_json::json!({
                "use_alt_speed_limits": self.alt_speed.load(Ordering::SeqCst),
            }),
        );
        Ok(snapshot)
    }

    async fn alternative_speed_status(&self) -> Result<bool, ClientError> {
        if let Some(failure) = *self.fail_status.lock().unwrap() {
            return Err(failure.into_error("transfer/speedLimitsMode"));
        }
        Ok(self.alt_speed.load(Ordering::SeqCst))
    }

    async fn toggle_alternative_speed(&self) -> Result<(), ClientError> {
        if let Some(failure) = *self.fail_toggle.lock().unwrap() {
            return Err(failure.into_error("transfer/toggleSpeedLimitsMode"));
        }
        self.toggle_calls.fetch_add(1, Ordering::SeqCst);
        self.alt_speed.fetch_xor(true, Ordering::SeqCst);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(url: &str) -> QbittorrentConfig {
        QbittorrentConfig {
            url: url.to_string(),
            username: "admin".to_string(),
            password: "adminadmin".to_string(),
            verify_ssl: true,
            poll_interval_seconds: 30,
            enabled: true,
        }
    }

    #[test]
    fn test_parse_speed_limits_mode() {
        assert_eq!(parse_speed_limits_mode("1"), Some(true));
        assert_eq!(parse_speed_limits_mode("0\n"), Some(false));
        assert_eq!(parse_speed_limits_mode("yes"), None);
    }

    #[test]
    fn test_endpoint_keeps_base_path() {
        let client = WebUiClient::new(&config("https://example.com/qbittorrent")).unwrap();
        assert_eq!(
            client.endpoint("sync/maindata").unwrap().as_str(),
            "https://example.com/qbittorrent/api/v2/sync/maindata"
        );

        let client = WebUiClient::new(&config("http://localhost:8080")).unwrap();
        assert_eq!(
            client.endpoint("auth/login").unwrap().as_str(),
            "http://localhost:8080/api/v2/auth/login"
        );
    }

    #[test]
    fn test_invalid_url_is_rejected() {
        assert!(WebUiClient::new(&config("not a url")).is_err());
    }

    #[tokio::test]
    async fn test_requests_before_login_require_login() {
        let client = WebUiClient::new(&config("http://localhost:8080")).unwrap();
        assert!(matches!(
            client.sync_main_data().await,
            Err(ClientError::LoginRequired)
        ));
        assert!(matches!(
            client.toggle_alternative_speed().await,
            Err(ClientError::LoginRequired)
        ));
    }
}
