use std::collections::BTreeMap;

use chrono::NaiveDateTime;
use serde::{Deserialize, Deserializer, Serialize};

use crate::domain::{ConversionStatus, JobId, ProgressStatus};

/// Keepalive text the client sends on the push channel.
pub const KEEPALIVE_PING: &str = "ping";
/// Keepalive text the backend answers with.
pub const KEEPALIVE_PONG: &str = "pong";

/// Typed push-channel message. Every JSON frame is a flat object with a
/// `type` discriminant.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ProgressEvent {
    Progress {
        #[serde(rename = "conversion_id")]
        job_id: JobId,
        #[serde(rename = "progress", default, deserialize_with = "percent")]
        percent: u8,
        #[serde(default)]
        status: ProgressStatus,
        #[serde(
            rename = "current_step",
            default,
            deserialize_with = "non_empty",
            skip_serializing_if = "Option::is_none"
        )]
        step: Option<String>,
        #[serde(
            default,
            deserialize_with = "non_empty",
            skip_serializing_if = "Option::is_none"
        )]
        file_name: Option<String>,
    },
    BatchProgress {
        batch_id: JobId,
        #[serde(rename = "progress", default, deserialize_with = "percent")]
        percent: u8,
        #[serde(default)]
        status: ProgressStatus,
        #[serde(default)]
        files: BTreeMap<String, serde_json::Value>,
    },
    Completion {
        #[serde(rename = "conversion_id")]
        job_id: JobId,
        success: bool,
        #[serde(
            default,
            deserialize_with = "non_empty",
            skip_serializing_if = "Option::is_none"
        )]
        error_message: Option<String>,
    },
}

impl ProgressEvent {
    pub fn id(&self) -> &JobId {
        match self {
            ProgressEvent::Progress { job_id, .. } | ProgressEvent::Completion { job_id, .. } => {
                job_id
            }
            ProgressEvent::BatchProgress { batch_id, .. } => batch_id,
        }
    }

    /// Completion always reports 100 regardless of payload.
    pub fn percent(&self) -> u8 {
        match self {
            ProgressEvent::Progress { percent, .. }
            | ProgressEvent::BatchProgress { percent, .. } => *percent,
            ProgressEvent::Completion { .. } => 100,
        }
    }

    pub fn status(&self) -> ProgressStatus {
        match self {
            ProgressEvent::Progress { status, .. }
            | ProgressEvent::BatchProgress { status, .. } => *status,
            ProgressEvent::Completion { success: true, .. } => ProgressStatus::Completed,
            ProgressEvent::Completion { success: false, .. } => ProgressStatus::Error,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            ProgressEvent::Progress { .. } => "progress",
            ProgressEvent::BatchProgress { .. } => "batch_progress",
            ProgressEvent::Completion { .. } => "completion",
        }
    }
}

fn percent<'de, D>(deserializer: D) -> Result<u8, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = Option::<f64>::deserialize(deserializer)?.unwrap_or(0.0);
    if raw.is_nan() {
        return Ok(0);
    }
    Ok(raw.round().clamp(0.0, 100.0) as u8)
}

fn non_empty<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = Option::<String>::deserialize(deserializer)?;
    Ok(raw.filter(|value| !value.is_empty()))
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConversionResult {
    pub id: JobId,
    pub input_file: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_file: Option<String>,
    pub status: ConversionStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    /// Seconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub processing_time: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub markdown_content: Option<String>,
    pub created_at: NaiveDateTime,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<NaiveDateTime>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchConversionResult {
    pub total_files: usize,
    pub successful: usize,
    pub failed: usize,
    pub results: Vec<ConversionResult>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UrlConversionRequest {
    pub url: String,
    pub use_api_enhancement: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SupportedFormats {
    pub formats: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApiSettings {
    /// Masked by the backend.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,
    pub is_configured: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiKeyRequest {
    pub api_key: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApiTestResult {
    pub is_valid: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CancelResponse {
    pub success: bool,
    #[serde(default)]
    pub message: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthStatus {
    pub status: String,
    pub timestamp: NaiveDateTime,
    pub version: String,
}

#[cfg(test)]
#[path = "tests/protocol_tests.rs"]
mod tests;
