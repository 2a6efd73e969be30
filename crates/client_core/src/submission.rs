//! Turns a mixed list of inputs into backend calls.
//!
//! URL inputs are converted one at a time, in order, before any file is
//! uploaded. Files go out as a single upload when there is exactly one and
//! as one batch request otherwise. Results keep that order: URL results
//! first, then file results in the order the backend returned them.

use std::path::{Path, PathBuf};

use shared::{domain::ConversionMode, protocol::ConversionResult};
use tracing::{debug, info};

use crate::{
    backend::ConversionBackend,
    error::{ClientError, SubmissionError},
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalFile {
    pub file_name: String,
    pub mime_type: Option<String>,
    pub bytes: Vec<u8>,
}

impl LocalFile {
    pub fn new(file_name: impl Into<String>, bytes: Vec<u8>) -> Self {
        Self {
            file_name: file_name.into(),
            mime_type: None,
            bytes,
        }
    }

    pub async fn read(path: impl AsRef<Path>) -> Result<Self, ClientError> {
        let path = path.as_ref();
        let bytes = tokio::fs::read(path).await.map_err(|source| ClientError::Io {
            path: PathBuf::from(path),
            source,
        })?;
        let file_name = path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_else(|| path.display().to_string());
        Ok(Self::new(file_name, bytes))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConversionInput {
    LocalFile(LocalFile),
    RemoteUrl(String),
}

impl ConversionInput {
    /// Human-readable name, used for placeholders and error reports.
    pub fn label(&self) -> &str {
        match self {
            ConversionInput::LocalFile(file) => &file.file_name,
            ConversionInput::RemoteUrl(url) => url,
        }
    }
}

impl From<LocalFile> for ConversionInput {
    fn from(file: LocalFile) -> Self {
        ConversionInput::LocalFile(file)
    }
}

fn partition(inputs: Vec<ConversionInput>) -> (Vec<String>, Vec<LocalFile>) {
    let mut urls = Vec::new();
    let mut files = Vec::new();
    for input in inputs {
        match input {
            ConversionInput::RemoteUrl(url) => urls.push(url),
            ConversionInput::LocalFile(file) => files.push(file),
        }
    }
    (urls, files)
}

/// Runs one submission. The first failing request aborts the rest; requests
/// already completed are not rolled back.
pub async fn submit(
    backend: &dyn ConversionBackend,
    inputs: Vec<ConversionInput>,
    mode: ConversionMode,
) -> Result<Vec<ConversionResult>, SubmissionError> {
    if inputs.is_empty() {
        return Err(SubmissionError::NoInputs);
    }
    let (urls, files) = partition(inputs);
    info!(
        urls = urls.len(),
        files = files.len(),
        ai = mode.is_ai(),
        "submission: starting"
    );

    let mut results = Vec::with_capacity(urls.len() + files.len());
    for url in urls {
        let converted = if mode.is_ai() {
            backend.convert_url_enhanced(&url).await
        } else {
            backend.convert_url(&url).await
        };
        let result = converted.map_err(|source| SubmissionError::Request {
            input: url.clone(),
            source,
        })?;
        debug!(job_id = %result.id, url = %url, "submission: url accepted");
        results.push(result);
    }

    match files.as_slice() {
        [] => {}
        [file] => {
            let result = backend
                .upload_file(file, mode.is_ai())
                .await
                .map_err(|source| SubmissionError::Request {
                    input: file.file_name.clone(),
                    source,
                })?;
            debug!(job_id = %result.id, file = %file.file_name, "submission: file accepted");
            results.push(result);
        }
        many => {
            let batch = backend
                .upload_batch(many, mode.is_ai())
                .await
                .map_err(|source| SubmissionError::Request {
                    input: format!("batch of {} files", many.len()),
                    source,
                })?;
            debug!(
                total = batch.total_files,
                successful = batch.successful,
                failed = batch.failed,
                "submission: batch accepted"
            );
            results.extend(batch.results);
        }
    }

    Ok(results)
}

#[cfg(test)]
#[path = "tests/submission_tests.rs"]
mod tests;
