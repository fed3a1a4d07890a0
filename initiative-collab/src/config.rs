//! Session configuration.

use std::time::Duration;

use thiserror::Error;
use url::Url;
use uuid::Uuid;

use crate::reconnect::{EscalationPolicy, ReconnectPolicy};
use crate::transport::DEFAULT_CONNECT_TIMEOUT;

/// Configuration for one collaboration session.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// API base URL, e.g. `https://app.example.com/api/v1`
    pub base_url: String,
    /// Document being edited
    pub document_id: String,
    /// Bearer token sent as the `token` query parameter
    pub token: String,
    /// Tenant scope sent as the `guild_id` query parameter
    pub guild_id: String,
    /// Retry backoff
    pub reconnect: ReconnectPolicy,
    /// Abnormal-close escalation
    pub escalation: EscalationPolicy,
    /// Bound on opening the socket; expiry counts as an abnormal close
    pub connect_timeout: Duration,
    /// Buffered events per subscriber before the slowest one lags
    pub event_capacity: usize,
    /// Identifies this client instance in logs
    pub client_id: Uuid,
}

impl SessionConfig {
    pub fn new(
        base_url: impl Into<String>,
        document_id: impl ToString,
        token: impl Into<String>,
        guild_id: impl ToString,
    ) -> Self {
        Self {
            base_url: base_url.into(),
            document_id: document_id.to_string(),
            token: token.into(),
            guild_id: guild_id.to_string(),
            reconnect: ReconnectPolicy::default(),
            escalation: EscalationPolicy::default(),
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            event_capacity: 256,
            client_id: Uuid::new_v4(),
        }
    }

    /// Sets the retry backoff.
    pub fn with_reconnect(mut self, reconnect: ReconnectPolicy) -> Self {
        self.reconnect = reconnect;
        self
    }

    /// Sets the abnormal-close escalation policy.
    pub fn with_escalation(mut self, escalation: EscalationPolicy) -> Self {
        self.escalation = escalation;
        self
    }

    /// Sets how long opening the socket may take.
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Sets the event buffer size.
    pub fn with_event_capacity(mut self, capacity: usize) -> Self {
        self.event_capacity = capacity.max(1);
        self
    }

    /// WebSocket URL for this document.
    ///
    /// `http` becomes `ws`, `https` becomes `wss`; socket schemes pass
    /// through. The collaborate path is appended to the base path and any
    /// existing query is replaced by `token` and `guild_id`.
    pub fn socket_url(&self) -> Result<Url, ConfigError> {
        let mut url = Url::parse(&self.base_url)?;

        let scheme = match url.scheme() {
            "http" | "ws" => "ws",
            "https" | "wss" => "wss",
            other => return Err(ConfigError::UnsupportedScheme(other.to_string())),
        };
        if url.scheme() != scheme {
            url.set_scheme(scheme)
                .map_err(|()| ConfigError::UnsupportedScheme(url.scheme().to_string()))?;
        }

        url.path_segments_mut()
            .map_err(|()| ConfigError::CannotBeABase)?
            .pop_if_empty()
            .extend(["collaboration", "documents", self.document_id.as_str(), "collaborate"]);

        url.set_fragment(None);
        url.query_pairs_mut()
            .clear()
            .append_pair("token", &self.token)
            .append_pair("guild_id", &self.guild_id);

        Ok(url)
    }
}

/// Configuration errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid base url: {0}")]
    InvalidUrl(#[from] url::ParseError),
    #[error("unsupported url scheme: {0}")]
    UnsupportedScheme(String),
    #[error("base url cannot carry a path")]
    CannotBeABase,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(base: &str) -> SessionConfig {
        SessionConfig::new(base, 42, "secret", 9)
    }

    #[test]
    fn test_https_becomes_wss() {
        let url = config("https://app.example.com").socket_url().unwrap();
        assert_eq!(
            url.as_str(),
            "wss://app.example.com/collaboration/documents/42/collaborate?token=secret&guild_id=9"
        );
    }

    #[test]
    fn test_http_becomes_ws_and_keeps_base_path() {
        let url = config("http://localhost:8000/api/v1/").socket_url().unwrap();
        assert_eq!(url.scheme(), "ws");
        assert_eq!(url.path(), "/api/v1/collaboration/documents/42/collaborate");
    }

    #[test]
    fn test_socket_scheme_passes_through() {
        let url = config("ws://127.0.0.1:9090").socket_url().unwrap();
        assert_eq!(url.scheme(), "ws");
        assert_eq!(url.port(), Some(9090));
    }

    #[test]
    fn test_query_is_replaced_and_encoded() {
        let mut cfg = config("https://app.example.com/api?stale=1");
        cfg.token = "a b&c".into();
        let url = cfg.socket_url().unwrap();

        let pairs: Vec<(String, String)> = url.query_pairs().into_owned().collect();
        assert_eq!(
            pairs,
            vec![
                ("token".to_string(), "a b&c".to_string()),
                ("guild_id".to_string(), "9".to_string()),
            ]
        );
    }

    #[test]
    fn test_document_id_is_escaped() {
        let url = SessionConfig::new("https://x.test", "a/b", "t", 1)
            .socket_url()
            .unwrap();
        assert_eq!(url.path(), "/collaboration/documents/a%2Fb/collaborate");
    }

    #[test]
    fn test_bad_urls() {
        assert!(matches!(
            config("not a url").socket_url(),
            Err(ConfigError::InvalidUrl(_))
        ));
        assert!(matches!(
            config("ftp://files.example.com").socket_url(),
            Err(ConfigError::UnsupportedScheme(_))
        ));
    }

    #[test]
    fn test_defaults() {
        let cfg = config("https://x.test");
        assert_eq!(cfg.reconnect, ReconnectPolicy::default());
        assert_eq!(cfg.escalation, EscalationPolicy::default());
        assert_eq!(cfg.event_capacity, 256);
        assert_eq!(cfg.connect_timeout, Duration::from_secs(10));
    }

    #[test]
    fn test_builders() {
        let cfg = config("https://x.test")
            .with_connect_timeout(Duration::from_millis(500))
            .with_event_capacity(0);
        assert_eq!(cfg.connect_timeout, Duration::from_millis(500));
        assert_eq!(cfg.event_capacity, 1);
    }
}
