use std::sync::Arc;

use shared::{
    domain::{ConversionMode, JobId},
    protocol::{ApiSettings, ApiTestResult, ConversionResult, HealthStatus},
};
use tokio::{
    sync::{broadcast, watch, Mutex},
    task::JoinHandle,
};
use tracing::{debug, info, warn};

pub mod backend;
pub mod cancellation;
pub mod config;
pub mod correlator;
pub mod error;
pub mod events;
pub mod progress;
pub mod submission;
pub mod transport;

pub use backend::{ConversionBackend, HttpBackend};
pub use cancellation::{CancelOutcome, CancelReport, CancelResult};
pub use config::{ClientConfig, Timings};
pub use correlator::ProgressView;
pub use error::{ClientError, SubmissionError};
pub use events::SessionEvent;
pub use progress::ProgressSnapshot;
pub use submission::{ConversionInput, LocalFile};
pub use transport::{ConnectionState, PushConnector, WebSocketConnector};

use crate::{
    correlator::JobCorrelator,
    progress::ProgressTracker,
    transport::PushConnection,
};

const EVENT_CAPACITY: usize = 1024;

struct SessionState {
    correlator: JobCorrelator,
    /// Every result returned during this session, in submission order.
    results: Vec<ConversionResult>,
    /// Label for the placeholder view: the first input of the last submission.
    placeholder_label: Option<String>,
}

/// Client side of one conversion session: push channel, progress tracking
/// and the REST calls that start or stop jobs.
pub struct ConversionSession {
    backend: Arc<dyn ConversionBackend>,
    tracker: ProgressTracker,
    connection: PushConnection,
    state: Arc<Mutex<SessionState>>,
    watcher: Mutex<Option<JoinHandle<()>>>,
    events: broadcast::Sender<SessionEvent>,
}

impl ConversionSession {
    pub fn from_config(config: &ClientConfig) -> Result<Arc<Self>, ClientError> {
        let backend = HttpBackend::from_config(config)?;
        let push_url = config.push_url()?;
        Ok(Self::new_with_dependencies(
            Arc::new(backend),
            Arc::new(WebSocketConnector),
            push_url,
            config.timings(),
        ))
    }

    pub fn new_with_dependencies(
        backend: Arc<dyn ConversionBackend>,
        connector: Arc<dyn PushConnector>,
        push_url: impl Into<String>,
        timings: Timings,
    ) -> Arc<Self> {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let tracker = ProgressTracker::new(timings.completion_retention, events.clone());
        let connection = PushConnection::new(
            push_url,
            connector,
            tracker.clone(),
            timings,
            events.clone(),
        );
        Arc::new(Self {
            backend,
            tracker,
            connection,
            state: Arc::new(Mutex::new(SessionState {
                correlator: JobCorrelator::new(),
                results: Vec::new(),
                placeholder_label: None,
            })),
            watcher: Mutex::new(None),
            events,
        })
    }

    /// Opens the push channel and starts following progress for the
    /// active job. Calling it again while running does nothing.
    pub async fn start(&self) {
        {
            let mut watcher = self.watcher.lock().await;
            let running = watcher.as_ref().is_some_and(|handle| !handle.is_finished());
            if !running {
                *watcher = Some(self.spawn_watcher());
            }
        }
        self.connection.connect().await;
    }

    /// Closes the push channel and stops every timer the session owns.
    pub async fn shutdown(&self) {
        self.connection.disconnect().await;
        self.tracker.shutdown().await;
        if let Some(handle) = self.watcher.lock().await.take() {
            handle.abort();
        }
        info!("session: shut down");
    }

    /// Re-evaluates the active job whenever the store changes, so an id that
    /// appears and expires between two queries still counts as observed.
    fn spawn_watcher(&self) -> JoinHandle<()> {
        let mut events = self.events.subscribe();
        let state = Arc::clone(&self.state);
        let tracker = self.tracker.clone();
        tokio::spawn(async move {
            loop {
                match events.recv().await {
                    Ok(SessionEvent::ProgressUpdated(_) | SessionEvent::JobExpired { .. }) => {}
                    Ok(_) => continue,
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        debug!(skipped, "session: watcher lagged");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
                let mut state = state.lock().await;
                reconcile(&mut state, &tracker).await;
            }
        })
    }

    pub async fn submit(
        &self,
        inputs: Vec<ConversionInput>,
        mode: ConversionMode,
    ) -> Result<Vec<ConversionResult>, SubmissionError> {
        let ticket = {
            let mut state = self.state.lock().await;
            state.placeholder_label = inputs.first().map(|input| input.label().to_string());
            state.correlator.begin_submission()
        };

        match submission::submit(self.backend.as_ref(), inputs, mode).await {
            Ok(results) => {
                let outstanding = results.iter().any(|result| !result.status.is_terminal());
                let first = results.first().map(|result| result.id.clone());
                {
                    let mut state = self.state.lock().await;
                    if !state.correlator.confirm(ticket, first.clone(), outstanding) {
                        debug!("session: submission finished after being cancelled or superseded");
                    }
                    state.results.extend(results.iter().cloned());
                }
                info!(
                    count = results.len(),
                    active = ?first.as_ref().map(JobId::as_str),
                    "session: submission accepted"
                );
                let _ = self.events.send(SessionEvent::ResultsAppended {
                    results: results.clone(),
                });
                Ok(results)
            }
            Err(err) => {
                self.state.lock().await.correlator.fail(ticket);
                warn!(error = %err, "session: submission failed");
                let _ = self.events.send(SessionEvent::SubmissionFailed {
                    message: err.to_string(),
                });
                Err(err)
            }
        }
    }

    /// Cancels the active job, or every tracked job when none is active.
    /// Local state is cleared once requests were issued, whatever the
    /// backend answered.
    pub async fn cancel(&self) -> CancelOutcome {
        let targets = {
            let mut state = self.state.lock().await;
            let active = reconcile(&mut state, &self.tracker).await;
            let tracked = self.tracker.ids().await;
            cancellation::cancel_targets(active.as_ref(), tracked)
        };
        if targets.is_empty() {
            debug!("session: nothing to cancel");
            return CancelOutcome::NothingToCancel;
        }

        let reports = cancellation::request_cancellation(self.backend.as_ref(), &targets).await;
        self.state.lock().await.correlator.reset();
        let _ = self.events.send(SessionEvent::CancellationRequested {
            reports: reports.clone(),
        });
        CancelOutcome::Requested(reports)
    }

    /// Cancels explicit ids without touching the active job.
    pub async fn cancel_ids(&self, ids: &[JobId]) -> Vec<CancelReport> {
        cancellation::request_cancellation(self.backend.as_ref(), ids).await
    }

    pub async fn active_job(&self) -> Option<JobId> {
        let mut state = self.state.lock().await;
        reconcile(&mut state, &self.tracker).await
    }

    pub async fn active_progress(&self) -> ProgressView {
        let mut state = self.state.lock().await;
        let active = reconcile(&mut state, &self.tracker).await;
        let label = state.placeholder_label.clone();
        let Some(id) = active else {
            return ProgressView::placeholder(label.as_deref());
        };
        match self.tracker.snapshot(&id).await {
            Some(snapshot) => ProgressView::from_snapshot(&snapshot),
            None => ProgressView {
                id: Some(id),
                ..ProgressView::placeholder(label.as_deref())
            },
        }
    }

    pub async fn is_converting(&self) -> bool {
        let mut state = self.state.lock().await;
        reconcile(&mut state, &self.tracker).await;
        state.correlator.is_converting()
    }

    pub async fn results(&self) -> Vec<ConversionResult> {
        self.state.lock().await.results.clone()
    }

    pub async fn progress_snapshot(&self) -> Vec<ProgressSnapshot> {
        self.tracker.snapshots().await
    }

    /// Drops a job from the progress store right away.
    pub async fn clear_progress(&self, id: &JobId) -> Option<ProgressSnapshot> {
        self.tracker.clear(id).await
    }

    pub fn is_connected(&self) -> bool {
        self.connection.is_connected()
    }

    pub fn connection_state(&self) -> watch::Receiver<ConnectionState> {
        self.connection.subscribe_state()
    }

    pub fn push_url(&self) -> &str {
        self.connection.url()
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<SessionEvent> {
        self.events.subscribe()
    }

    pub async fn supported_formats(&self) -> Result<Vec<String>, ClientError> {
        self.backend.supported_formats().await
    }

    pub async fn api_settings(&self) -> Result<ApiSettings, ClientError> {
        self.backend.api_settings().await
    }

    pub async fn configure_api_key(&self, api_key: &str) -> Result<ApiSettings, ClientError> {
        self.backend.configure_api_key(api_key).await
    }

    pub async fn test_api_key(&self, api_key: &str) -> Result<ApiTestResult, ClientError> {
        self.backend.test_api_key(api_key).await
    }

    pub async fn download(&self, file_name: &str) -> Result<Vec<u8>, ClientError> {
        self.backend.download(file_name).await
    }

    pub async fn health(&self) -> Result<HealthStatus, ClientError> {
        self.backend.health().await
    }
}

impl Drop for ConversionSession {
    fn drop(&mut self) {
        if let Ok(mut watcher) = self.watcher.try_lock() {
            if let Some(handle) = watcher.take() {
                handle.abort();
            }
        }
    }
}

async fn reconcile(state: &mut SessionState, tracker: &ProgressTracker) -> Option<JobId> {
    tracker
        .with_store(|store| state.correlator.reconcile(store).cloned())
        .await
}

#[cfg(test)]
#[path = "tests/support.rs"]
pub(crate) mod test_support;

#[cfg(test)]
#[path = "tests/lib_tests.rs"]
mod tests;
