//! REST side of the conversion backend.

use async_trait::async_trait;
use reqwest::{multipart, Client, RequestBuilder, Response};
use serde::de::DeserializeOwned;
use shared::{
    domain::JobId,
    error::ApiError,
    protocol::{
        ApiKeyRequest, ApiSettings, ApiTestResult, BatchConversionResult, CancelResponse,
        ConversionResult, HealthStatus, SupportedFormats, UrlConversionRequest,
    },
};
use tracing::debug;
use url::Url;

use crate::{
    config::{parse_url, ClientConfig},
    error::ClientError,
    submission::LocalFile,
};

const CONVERSION_PREFIX: &str = "api/v1/conversion";
const SETTINGS_PREFIX: &str = "api/v1/settings/api";

#[async_trait]
pub trait ConversionBackend: Send + Sync {
    async fn upload_file(
        &self,
        file: &LocalFile,
        use_ai_mode: bool,
    ) -> Result<ConversionResult, ClientError>;
    async fn upload_batch(
        &self,
        files: &[LocalFile],
        use_ai_mode: bool,
    ) -> Result<BatchConversionResult, ClientError>;
    /// Standard-mode URL conversion.
    async fn convert_url(&self, url: &str) -> Result<ConversionResult, ClientError>;
    /// AI-enhanced URL conversion.
    async fn convert_url_enhanced(&self, url: &str) -> Result<ConversionResult, ClientError>;
    async fn supported_formats(&self) -> Result<Vec<String>, ClientError>;
    async fn api_settings(&self) -> Result<ApiSettings, ClientError>;
    async fn configure_api_key(&self, api_key: &str) -> Result<ApiSettings, ClientError>;
    async fn test_api_key(&self, api_key: &str) -> Result<ApiTestResult, ClientError>;
    async fn cancel(&self, id: &JobId) -> Result<CancelResponse, ClientError>;
    async fn download(&self, file_name: &str) -> Result<Vec<u8>, ClientError>;
    async fn health(&self) -> Result<HealthStatus, ClientError>;
}

#[derive(Clone)]
pub struct HttpBackend {
    http: Client,
    base: Url,
}

impl HttpBackend {
    pub fn new(server_url: &str) -> Result<Self, ClientError> {
        Self::with_client(server_url, Client::new())
    }

    pub fn from_config(config: &ClientConfig) -> Result<Self, ClientError> {
        let mut builder = Client::builder();
        if let Some(timeout) = config.request_timeout() {
            builder = builder.timeout(timeout);
        }
        let http = builder
            .build()
            .map_err(|err| ClientError::http("client setup", err))?;
        Self::with_client(&config.server_url, http)
    }

    pub fn with_client(server_url: &str, http: Client) -> Result<Self, ClientError> {
        let base = parse_url(server_url)?;
        if base.cannot_be_a_base() || !matches!(base.scheme(), "http" | "https") {
            return Err(ClientError::InvalidUrl {
                url: server_url.to_string(),
                reason: "server_url must be an http:// or https:// base url".to_string(),
            });
        }
        Ok(Self { http, base })
    }

    /// Appends path segments to the base url, percent-encoding each one.
    fn endpoint(&self, prefix: &str, segments: &[&str]) -> Url {
        let mut url = self.base.clone();
        url.set_query(None);
        if let Ok(mut path) = url.path_segments_mut() {
            path.pop_if_empty();
            path.extend(prefix.split('/'));
            path.extend(segments);
        }
        url
    }

    async fn send(&self, request: RequestBuilder, endpoint: &Url) -> Result<Response, ClientError> {
        debug!(endpoint = %endpoint, "backend: sending request");
        let response = request
            .send()
            .await
            .map_err(|err| ClientError::http(endpoint.path(), err))?;
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let body = response.text().await.unwrap_or_default();
        Err(ClientError::Api {
            endpoint: endpoint.path().to_string(),
            source: ApiError::from_body(status.as_u16(), &body),
        })
    }

    async fn send_json<T: DeserializeOwned>(
        &self,
        request: RequestBuilder,
        endpoint: &Url,
    ) -> Result<T, ClientError> {
        self.send(request, endpoint)
            .await?
            .json()
            .await
            .map_err(|err| ClientError::http(endpoint.path(), err))
    }
}

fn file_part(file: &LocalFile) -> Result<multipart::Part, ClientError> {
    let part = multipart::Part::bytes(file.bytes.clone()).file_name(file.file_name.clone());
    match &file.mime_type {
        Some(mime) => part
            .mime_str(mime)
            .map_err(|err| ClientError::http(format!("multipart {}", file.file_name), err)),
        None => Ok(part),
    }
}

#[async_trait]
impl ConversionBackend for HttpBackend {
    async fn upload_file(
        &self,
        file: &LocalFile,
        use_ai_mode: bool,
    ) -> Result<ConversionResult, ClientError> {
        let endpoint = self.endpoint(CONVERSION_PREFIX, &["upload"]);
        let form = multipart::Form::new().part("file", file_part(file)?);
        let request = self
            .http
            .post(endpoint.clone())
            .query(&[("use_ai_mode", use_ai_mode)])
            .multipart(form);
        self.send_json(request, &endpoint).await
    }

    async fn upload_batch(
        &self,
        files: &[LocalFile],
        use_ai_mode: bool,
    ) -> Result<BatchConversionResult, ClientError> {
        let endpoint = self.endpoint(CONVERSION_PREFIX, &["batch"]);
        let mut form = multipart::Form::new();
        for file in files {
            form = form.part("files", file_part(file)?);
        }
        let request = self
            .http
            .post(endpoint.clone())
            .query(&[("use_ai_mode", use_ai_mode)])
            .multipart(form);
        self.send_json(request, &endpoint).await
    }

    async fn convert_url(&self, url: &str) -> Result<ConversionResult, ClientError> {
        let endpoint = self.endpoint(CONVERSION_PREFIX, &["convert-url"]);
        let request = self.http.post(endpoint.clone()).json(&UrlConversionRequest {
            url: url.to_string(),
            use_api_enhancement: false,
        });
        self.send_json(request, &endpoint).await
    }

    async fn convert_url_enhanced(&self, url: &str) -> Result<ConversionResult, ClientError> {
        let endpoint = self.endpoint(CONVERSION_PREFIX, &["convert-youtube-enhanced"]);
        let request = self
            .http
            .post(endpoint.clone())
            .query(&[("url", url), ("use_ai_mode", "true")]);
        self.send_json(request, &endpoint).await
    }

    async fn supported_formats(&self) -> Result<Vec<String>, ClientError> {
        let endpoint = self.endpoint(CONVERSION_PREFIX, &["supported-formats"]);
        let formats: SupportedFormats = self
            .send_json(self.http.get(endpoint.clone()), &endpoint)
            .await?;
        Ok(formats.formats)
    }

    async fn api_settings(&self) -> Result<ApiSettings, ClientError> {
        let endpoint = self.endpoint(SETTINGS_PREFIX, &[]);
        self.send_json(self.http.get(endpoint.clone()), &endpoint)
            .await
    }

    async fn configure_api_key(&self, api_key: &str) -> Result<ApiSettings, ClientError> {
        let endpoint = self.endpoint(SETTINGS_PREFIX, &["configure"]);
        let request = self.http.post(endpoint.clone()).json(&ApiKeyRequest {
            api_key: api_key.to_string(),
        });
        self.send_json(request, &endpoint).await
    }

    async fn test_api_key(&self, api_key: &str) -> Result<ApiTestResult, ClientError> {
        let endpoint = self.endpoint(SETTINGS_PREFIX, &["test"]);
        let request = self.http.post(endpoint.clone()).json(&ApiKeyRequest {
            api_key: api_key.to_string(),
        });
        self.send_json(request, &endpoint).await
    }

    async fn cancel(&self, id: &JobId) -> Result<CancelResponse, ClientError> {
        let endpoint = self.endpoint(CONVERSION_PREFIX, &["cancel", id.as_str()]);
        self.send_json(self.http.post(endpoint.clone()), &endpoint)
            .await
    }

    async fn download(&self, file_name: &str) -> Result<Vec<u8>, ClientError> {
        let endpoint = self.endpoint(CONVERSION_PREFIX, &["download", file_name]);
        let bytes = self
            .send(self.http.get(endpoint.clone()), &endpoint)
            .await?
            .bytes()
            .await
            .map_err(|err| ClientError::http(endpoint.path(), err))?;
        Ok(bytes.to_vec())
    }

    async fn health(&self) -> Result<HealthStatus, ClientError> {
        let endpoint = self.endpoint("health", &[]);
        self.send_json(self.http.get(endpoint.clone()), &endpoint)
            .await
    }
}

#[cfg(test)]
#[path = "tests/backend_tests.rs"]
mod tests;
