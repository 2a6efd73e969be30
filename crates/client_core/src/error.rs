use std::path::PathBuf;

use shared::error::ApiError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("request to {endpoint} failed: {source}")]
    Http {
        endpoint: String,
        #[source]
        source: reqwest::Error,
    },
    #[error("backend rejected {endpoint}: {source}")]
    Api {
        endpoint: String,
        #[source]
        source: ApiError,
    },
    #[error("invalid server url '{url}': {reason}")]
    InvalidUrl { url: String, reason: String },
    #[error("failed to read input file '{}': {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl ClientError {
    pub(crate) fn http(endpoint: impl Into<String>, source: reqwest::Error) -> Self {
        Self::Http {
            endpoint: endpoint.into(),
            source,
        }
    }

    /// Backend error payload, when the failure came from a non-success response.
    pub fn api_error(&self) -> Option<&ApiError> {
        match self {
            ClientError::Api { source, .. } => Some(source),
            _ => None,
        }
    }
}

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("failed to connect push channel {url}: {reason}")]
    Connect { url: String, reason: String },
    #[error("push channel send failed: {0}")]
    Send(String),
    #[error("push channel receive failed: {0}")]
    Receive(String),
}

#[derive(Debug, Error)]
#[error("malformed push payload: {source}")]
pub struct DecodeError {
    pub raw: String,
    #[source]
    pub source: serde_json::Error,
}

#[derive(Debug, Error)]
pub enum SubmissionError {
    #[error("nothing to convert: no inputs were given")]
    NoInputs,
    #[error("conversion request for {input} failed: {source}")]
    Request {
        input: String,
        #[source]
        source: ClientError,
    },
}
