use shared::{domain::JobId, protocol::ConversionResult};

use crate::{cancellation::CancelReport, progress::ProgressSnapshot};

#[derive(Debug, Clone)]
pub enum SessionEvent {
    ConnectionChanged {
        connected: bool,
    },
    ProgressUpdated(ProgressSnapshot),
    JobExpired {
        id: JobId,
    },
    ResultsAppended {
        results: Vec<ConversionResult>,
    },
    SubmissionFailed {
        message: String,
    },
    CancellationRequested {
        reports: Vec<CancelReport>,
    },
}
