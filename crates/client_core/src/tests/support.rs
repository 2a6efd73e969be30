//! In-memory backend shared by the unit tests.

use std::{
    collections::HashMap,
    sync::{Arc, Mutex as StdMutex},
};

use async_trait::async_trait;
use chrono::NaiveDate;
use shared::{
    domain::{ConversionStatus, JobId},
    error::ApiError,
    protocol::{
        ApiSettings, ApiTestResult, BatchConversionResult, CancelResponse, ConversionResult,
        HealthStatus,
    },
};
use tokio::sync::Notify;

use crate::{backend::ConversionBackend, error::ClientError, submission::LocalFile};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Call {
    UploadFile { file: String, ai: bool },
    UploadBatch { files: Vec<String>, ai: bool },
    ConvertUrl(String),
    ConvertUrlEnhanced(String),
    Cancel(JobId),
}

#[derive(Debug, Clone)]
pub enum CancelReply {
    Success(bool),
    Status(u16, &'static str),
}

pub fn result(id: &str, input_file: &str, status: ConversionStatus) -> ConversionResult {
    ConversionResult {
        id: JobId::from(id),
        input_file: input_file.to_string(),
        output_file: None,
        status,
        error_message: None,
        processing_time: None,
        markdown_content: None,
        created_at: NaiveDate::from_ymd_opt(2024, 5, 1)
            .and_then(|date| date.and_hms_opt(10, 0, 0))
            .expect("valid timestamp"),
        completed_at: None,
    }
}

/// Records every call. File results get the id `file:<name>` and URL results
/// `url:<url>`; batch results come back in reverse input order.
#[derive(Default)]
pub struct RecordingBackend {
    pub calls: StdMutex<Vec<Call>>,
    pub status: Option<ConversionStatus>,
    /// Input label whose request fails with a 500.
    pub fail_on: Option<String>,
    pub cancel_replies: HashMap<String, CancelReply>,
    /// When set, uploads wait for a permit before answering.
    pub gate: Option<Arc<Notify>>,
    /// Overrides the id of single-file upload results.
    pub upload_id: Option<String>,
}

impl RecordingBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_status(mut self, status: ConversionStatus) -> Self {
        self.status = Some(status);
        self
    }

    pub fn failing_on(mut self, label: &str) -> Self {
        self.fail_on = Some(label.to_string());
        self
    }

    pub fn with_cancel_reply(mut self, id: &str, reply: CancelReply) -> Self {
        self.cancel_replies.insert(id.to_string(), reply);
        self
    }

    pub fn with_upload_id(mut self, id: &str) -> Self {
        self.upload_id = Some(id.to_string());
        self
    }

    pub fn gated(mut self, gate: Arc<Notify>) -> Self {
        self.gate = Some(gate);
        self
    }

    pub fn calls(&self) -> Vec<Call> {
        self.calls.lock().expect("calls").clone()
    }

    fn record(&self, call: Call) {
        self.calls.lock().expect("calls").push(call);
    }

    fn status(&self) -> ConversionStatus {
        self.status.unwrap_or(ConversionStatus::Processing)
    }

    fn check(&self, label: &str, endpoint: &str) -> Result<(), ClientError> {
        if self.fail_on.as_deref() == Some(label) {
            return Err(ClientError::Api {
                endpoint: endpoint.to_string(),
                source: ApiError::new(500, format!("Conversion failed: {label}")),
            });
        }
        Ok(())
    }

    async fn wait_gate(&self) {
        if let Some(gate) = &self.gate {
            gate.notified().await;
        }
    }
}

#[async_trait]
impl ConversionBackend for RecordingBackend {
    async fn upload_file(
        &self,
        file: &LocalFile,
        use_ai_mode: bool,
    ) -> Result<ConversionResult, ClientError> {
        self.record(Call::UploadFile {
            file: file.file_name.clone(),
            ai: use_ai_mode,
        });
        self.wait_gate().await;
        self.check(&file.file_name, "upload")?;
        let id = self
            .upload_id
            .clone()
            .unwrap_or_else(|| format!("file:{}", file.file_name));
        Ok(result(&id, &file.file_name, self.status()))
    }

    async fn upload_batch(
        &self,
        files: &[LocalFile],
        use_ai_mode: bool,
    ) -> Result<BatchConversionResult, ClientError> {
        let names: Vec<String> = files.iter().map(|file| file.file_name.clone()).collect();
        self.record(Call::UploadBatch {
            files: names.clone(),
            ai: use_ai_mode,
        });
        self.wait_gate().await;
        for name in &names {
            self.check(name, "batch")?;
        }
        let results: Vec<ConversionResult> = names
            .iter()
            .rev()
            .map(|name| result(&format!("file:{name}"), name, self.status()))
            .collect();
        Ok(BatchConversionResult {
            total_files: results.len(),
            successful: results.len(),
            failed: 0,
            results,
        })
    }

    async fn convert_url(&self, url: &str) -> Result<ConversionResult, ClientError> {
        self.record(Call::ConvertUrl(url.to_string()));
        self.check(url, "convert-url")?;
        Ok(result(&format!("url:{url}"), url, self.status()))
    }

    async fn convert_url_enhanced(&self, url: &str) -> Result<ConversionResult, ClientError> {
        self.record(Call::ConvertUrlEnhanced(url.to_string()));
        self.check(url, "convert-youtube-enhanced")?;
        Ok(result(&format!("url:{url}"), url, self.status()))
    }

    async fn supported_formats(&self) -> Result<Vec<String>, ClientError> {
        Ok(vec![".pdf".to_string(), ".docx".to_string()])
    }

    async fn api_settings(&self) -> Result<ApiSettings, ClientError> {
        Ok(ApiSettings {
            api_key: None,
            is_configured: false,
        })
    }

    async fn configure_api_key(&self, api_key: &str) -> Result<ApiSettings, ClientError> {
        Ok(ApiSettings {
            api_key: Some(api_key.to_string()),
            is_configured: true,
        })
    }

    async fn test_api_key(&self, _api_key: &str) -> Result<ApiTestResult, ClientError> {
        Ok(ApiTestResult {
            is_valid: true,
            error_message: None,
        })
    }

    async fn cancel(&self, id: &JobId) -> Result<CancelResponse, ClientError> {
        self.record(Call::Cancel(id.clone()));
        match self.cancel_replies.get(id.as_str()) {
            Some(CancelReply::Status(status, detail)) => Err(ClientError::Api {
                endpoint: format!("cancel/{id}"),
                source: ApiError::new(*status, *detail),
            }),
            Some(CancelReply::Success(success)) => Ok(CancelResponse {
                success: *success,
                message: format!("cancel {id}: {success}"),
            }),
            None => Ok(CancelResponse {
                success: true,
                message: format!("Conversion {id} cancelled"),
            }),
        }
    }

    async fn download(&self, file_name: &str) -> Result<Vec<u8>, ClientError> {
        Ok(format!("# {file_name}\n").into_bytes())
    }

    async fn health(&self) -> Result<HealthStatus, ClientError> {
        Ok(HealthStatus {
            status: "healthy".to_string(),
            timestamp: NaiveDate::from_ymd_opt(2024, 5, 1)
                .and_then(|date| date.and_hms_opt(10, 0, 0))
                .expect("valid timestamp"),
            version: "1.0.0".to_string(),
        })
    }
}
