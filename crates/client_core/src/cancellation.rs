use shared::domain::JobId;
use tracing::{error, info, warn};

use crate::backend::ConversionBackend;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CancelResult {
    /// Backend acknowledged the cancel.
    Accepted(String),
    /// Backend answered but reported `success: false`.
    Rejected(String),
    /// The request itself failed.
    Failed(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CancelReport {
    pub id: JobId,
    pub result: CancelResult,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CancelOutcome {
    NothingToCancel,
    Requested(Vec<CancelReport>),
}

impl CancelOutcome {
    pub fn requested_ids(&self) -> Vec<JobId> {
        match self {
            CancelOutcome::NothingToCancel => Vec::new(),
            CancelOutcome::Requested(reports) => {
                reports.iter().map(|report| report.id.clone()).collect()
            }
        }
    }

    pub fn failures(&self) -> impl Iterator<Item = &CancelReport> {
        let reports: &[CancelReport] = match self {
            CancelOutcome::NothingToCancel => &[],
            CancelOutcome::Requested(reports) => reports,
        };
        reports
            .iter()
            .filter(|report| matches!(report.result, CancelResult::Failed(_)))
    }
}

/// The active job when there is one, otherwise every tracked id.
pub fn cancel_targets(active: Option<&JobId>, store_ids: Vec<JobId>) -> Vec<JobId> {
    match active {
        Some(id) => vec![id.clone()],
        None => store_ids,
    }
}

/// Requests cancellation of each target in turn. A failure is recorded and
/// the remaining targets are still attempted.
pub async fn request_cancellation(
    backend: &dyn ConversionBackend,
    targets: &[JobId],
) -> Vec<CancelReport> {
    let mut reports = Vec::with_capacity(targets.len());
    for id in targets {
        let result = match backend.cancel(id).await {
            Ok(response) if response.success => {
                info!(job_id = %id, message = %response.message, "cancel: accepted");
                CancelResult::Accepted(response.message)
            }
            Ok(response) => {
                warn!(job_id = %id, message = %response.message, "cancel: backend declined");
                CancelResult::Rejected(response.message)
            }
            Err(err) => {
                error!(job_id = %id, error = %err, "cancel: request failed");
                CancelResult::Failed(err.to_string())
            }
        };
        reports.push(CancelReport {
            id: id.clone(),
            result,
        });
    }
    reports
}

#[cfg(test)]
#[path = "tests/cancellation_tests.rs"]
mod tests;
