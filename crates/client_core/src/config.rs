use std::time::Duration;

use serde::{Deserialize, Serialize};
use url::Url;

use crate::error::ClientError;

pub const DEFAULT_SERVER_URL: &str = "http://localhost:8000";
pub const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(30);
pub const RECONNECT_DELAY: Duration = Duration::from_secs(3);
pub const COMPLETION_RETENTION: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    pub server_url: String,
    /// Derived from `server_url` when absent.
    pub ws_url: Option<String>,
    /// Unset means no client-side timeout on REST calls.
    pub request_timeout_secs: Option<u64>,
    pub keepalive_secs: u64,
    pub reconnect_delay_secs: u64,
    pub completion_retention_secs: u64,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            server_url: DEFAULT_SERVER_URL.to_string(),
            ws_url: None,
            request_timeout_secs: None,
            keepalive_secs: KEEPALIVE_INTERVAL.as_secs(),
            reconnect_delay_secs: RECONNECT_DELAY.as_secs(),
            completion_retention_secs: COMPLETION_RETENTION.as_secs(),
        }
    }
}

impl ClientConfig {
    pub fn with_server_url(server_url: impl Into<String>) -> Self {
        Self {
            server_url: server_url.into(),
            ..Self::default()
        }
    }

    pub fn request_timeout(&self) -> Option<Duration> {
        self.request_timeout_secs.map(Duration::from_secs)
    }

    pub fn timings(&self) -> Timings {
        Timings {
            keepalive: Duration::from_secs(self.keepalive_secs.max(1)),
            reconnect_delay: Duration::from_secs(self.reconnect_delay_secs),
            completion_retention: Duration::from_secs(self.completion_retention_secs),
        }
    }

    pub fn push_url(&self) -> Result<String, ClientError> {
        match &self.ws_url {
            Some(ws_url) => {
                let parsed = parse_url(ws_url)?;
                if !matches!(parsed.scheme(), "ws" | "wss") {
                    return Err(ClientError::InvalidUrl {
                        url: ws_url.clone(),
                        reason: "push url must start with ws:// or wss://".to_string(),
                    });
                }
                Ok(ws_url.clone())
            }
            None => derive_push_url(&self.server_url),
        }
    }
}

/// Timers driving the push channel and progress retention.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Timings {
    pub keepalive: Duration,
    pub reconnect_delay: Duration,
    pub completion_retention: Duration,
}

impl Default for Timings {
    fn default() -> Self {
        Self {
            keepalive: KEEPALIVE_INTERVAL,
            reconnect_delay: RECONNECT_DELAY,
            completion_retention: COMPLETION_RETENTION,
        }
    }
}

pub(crate) fn parse_url(raw: &str) -> Result<Url, ClientError> {
    Url::parse(raw.trim()).map_err(|err| ClientError::InvalidUrl {
        url: raw.to_string(),
        reason: err.to_string(),
    })
}

/// `http://host:port/prefix` becomes `ws://host:port/prefix/ws`.
pub fn derive_push_url(server_url: &str) -> Result<String, ClientError> {
    let mut url = parse_url(server_url)?;
    let scheme = match url.scheme() {
        "http" => "ws",
        "https" => "wss",
        _ => {
            return Err(ClientError::InvalidUrl {
                url: server_url.to_string(),
                reason: "server_url must start with http:// or https://".to_string(),
            })
        }
    };
    url.set_scheme(scheme).map_err(|()| ClientError::InvalidUrl {
        url: server_url.to_string(),
        reason: format!("cannot switch scheme to {scheme}"),
    })?;
    let path = format!("{}/ws", url.path().trim_end_matches('/'));
    url.set_path(&path);
    url.set_query(None);
    Ok(url.to_string())
}
