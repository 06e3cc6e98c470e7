use std::path::Path;
use std::time::Duration;

use serde::Deserialize;
use url::Url;

use crate::error::ClientError;

pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Connection settings shared by every component of one client.
#[derive(Debug, Clone)]
pub struct HomeAssistantConfig {
    pub url: String,
    pub token: String,
    /// Deadline applied to each correlated request. `None` waits forever.
    pub request_timeout: Option<Duration>,
    /// Deadline for the socket open plus authentication handshake.
    pub connect_timeout: Duration,
}

impl HomeAssistantConfig {
    pub fn new(url: String, token: String) -> Self {
        Self {
            url,
            token,
            request_timeout: None,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
        }
    }

    pub fn with_request_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.request_timeout = timeout;
        self
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn websocket_url(&self) -> Result<Url, ClientError> {
        let mut url = self.base_url()?;
        let new_scheme = match url.scheme() {
            "https" | "wss" => "wss",
            _ => "ws",
        };
        url.set_scheme(new_scheme)
            .map_err(|_| ClientError::InvalidConfig(format!("cannot use scheme for '{}'", self.url)))?;
        url.set_path("/api/websocket");
        Ok(url)
    }

    pub fn rest_url(&self, endpoint: &str) -> Result<Url, ClientError> {
        self.base_url()?
            .join(endpoint.trim_start_matches('/'))
            .map_err(|e| ClientError::InvalidConfig(format!("bad endpoint '{}': {}", endpoint, e)))
    }

    fn base_url(&self) -> Result<Url, ClientError> {
        let mut url = Url::parse(&self.url)
            .map_err(|e| ClientError::InvalidConfig(format!("invalid url '{}': {}", self.url, e)))?;
        if !url.path().ends_with('/') {
            let path = format!("{}/", url.path());
            url.set_path(&path);
        }
        Ok(url)
    }
}

/// On-disk form of the configuration. Every field is optional so the CLI and
/// environment can fill in or override whatever the file leaves out.
#[derive(Debug, Default, Deserialize)]
pub struct ConfigFile {
    pub url: Option<String>,
    pub token: Option<String>,
    pub request_timeout_secs: Option<u64>,
    pub connect_timeout_secs: Option<u64>,
}

impl ConfigFile {
    pub fn load(path: &Path) -> Result<Self, ClientError> {
        let raw = std::fs::read_to_string(path).map_err(|e| {
            ClientError::InvalidConfig(format!("cannot read {}: {}", path.display(), e))
        })?;
        serde_yaml::from_str(&raw).map_err(|e| {
            ClientError::InvalidConfig(format!("cannot parse {}: {}", path.display(), e))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn websocket_url_follows_http_scheme() {
        let config = HomeAssistantConfig::new("http://localhost:8123".into(), "t".into());
        assert_eq!(
            config.websocket_url().unwrap().as_str(),
            "ws://localhost:8123/api/websocket"
        );

        let config = HomeAssistantConfig::new("https://ha.example.com/".into(), "t".into());
        assert_eq!(
            config.websocket_url().unwrap().as_str(),
            "wss://ha.example.com/api/websocket"
        );
    }

    #[test]
    fn invalid_url_is_a_config_error() {
        let config = HomeAssistantConfig::new("not a url".into(), "t".into());
        assert!(matches!(
            config.websocket_url(),
            Err(ClientError::InvalidConfig(_))
        ));
    }

    #[test]
    fn rest_url_keeps_base_path() {
        let config = HomeAssistantConfig::new("http://host:8123/ha".into(), "t".into());
        assert_eq!(
            config.rest_url("/api/states").unwrap().as_str(),
            "http://host:8123/ha/api/states"
        );
    }

    #[test]
    fn config_file_parses_partial_yaml() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("hass.yaml");
        std::fs::write(&path, "url: http://ha.local:8123\nrequest_timeout_secs: 5\n").unwrap();

        let file = ConfigFile::load(&path).unwrap();
        assert_eq!(file.url.as_deref(), Some("http://ha.local:8123"));
        assert_eq!(file.token, None);
        assert_eq!(file.request_timeout_secs, Some(5));
    }
}
