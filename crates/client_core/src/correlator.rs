//! Chooses the single job identifier the UI renders progress for.
//!
//! A REST call reveals its job id only when it returns, while push events
//! for that job may already be flowing. Until then the most recently
//! inserted store key is adopted tentatively. This is a heuristic: with two
//! submissions in flight the wrong id can be shown for a while.

use shared::domain::{JobId, ProgressStatus};

use crate::progress::{ProgressSnapshot, ProgressStore};

pub const PLACEHOLDER_STEP: &str = "starting conversion";
pub const PLACEHOLDER_LABEL: &str = "file";

/// Everything the selection depends on.
#[derive(Debug, Clone, Copy)]
pub struct CorrelationInput<'a> {
    pub current: Option<&'a JobId>,
    /// `current` came from a REST response rather than the heuristic.
    pub authoritative: bool,
    /// `current` has been present in the store at least once.
    pub observed: bool,
    pub converting: bool,
    pub store: &'a ProgressStore,
}

pub fn select_active_id(input: &CorrelationInput<'_>) -> Option<JobId> {
    if let Some(current) = input.current {
        if input.store.contains(current) {
            return Some(current.clone());
        }
        // Its events may simply not have arrived yet.
        if input.converting && input.authoritative && !input.observed {
            return Some(current.clone());
        }
    }
    if !input.converting {
        return None;
    }
    input.store.latest_id().cloned()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
enum Phase {
    #[default]
    Idle,
    /// REST call in flight, no authoritative id yet.
    Submitting,
    /// REST call returned; the job is still running on the backend.
    Tracking,
}

#[derive(Debug, Default)]
pub struct JobCorrelator {
    active: Option<JobId>,
    authoritative: bool,
    observed: bool,
    phase: Phase,
    generation: u64,
}

impl JobCorrelator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Starts a submission and returns the ticket its response must present.
    pub fn begin_submission(&mut self) -> u64 {
        self.generation += 1;
        self.active = None;
        self.authoritative = false;
        self.observed = false;
        self.phase = Phase::Submitting;
        self.generation
    }

    /// Seeds the authoritative id from a REST response. Ignored when the
    /// submission was reset (cancelled) or superseded in the meantime.
    pub fn confirm(&mut self, ticket: u64, id: Option<JobId>, outstanding: bool) -> bool {
        if ticket != self.generation || self.phase != Phase::Submitting {
            return false;
        }
        self.observed = false;
        match id {
            Some(id) if outstanding => {
                self.active = Some(id);
                self.authoritative = true;
                self.phase = Phase::Tracking;
            }
            // Nothing left running on the backend.
            _ => {
                self.active = None;
                self.authoritative = false;
                self.phase = Phase::Idle;
            }
        }
        true
    }

    pub fn fail(&mut self, ticket: u64) {
        if ticket == self.generation {
            self.reset();
        }
    }

    pub fn reset(&mut self) {
        self.active = None;
        self.authoritative = false;
        self.observed = false;
        self.phase = Phase::Idle;
    }

    pub fn is_converting(&self) -> bool {
        self.phase != Phase::Idle
    }

    pub fn active(&self) -> Option<&JobId> {
        self.active.as_ref()
    }

    pub fn is_authoritative(&self) -> bool {
        self.authoritative
    }

    /// Re-evaluates the selection against the current store contents.
    pub fn reconcile(&mut self, store: &ProgressStore) -> Option<&JobId> {
        let next = select_active_id(&CorrelationInput {
            current: self.active.as_ref(),
            authoritative: self.authoritative,
            observed: self.observed,
            converting: self.is_converting(),
            store,
        });

        if next != self.active {
            // Anything picked here is tentative; only REST responses are authoritative.
            self.authoritative = false;
            self.active = next;
        }
        self.observed = self
            .active
            .as_ref()
            .is_some_and(|id| store.contains(id));

        if self.active.is_none() && self.phase == Phase::Tracking {
            self.phase = Phase::Idle;
        }
        self.active.as_ref()
    }
}

/// What the UI draws for the active job.
#[derive(Debug, Clone, PartialEq)]
pub struct ProgressView {
    pub id: Option<JobId>,
    pub percent: u8,
    pub status: ProgressStatus,
    pub file_name: Option<String>,
    pub current_step: Option<String>,
}

impl ProgressView {
    /// Shown while no identifier is active.
    pub fn placeholder(label: Option<&str>) -> Self {
        Self {
            id: None,
            percent: 0,
            status: ProgressStatus::Processing,
            file_name: Some(label.unwrap_or(PLACEHOLDER_LABEL).to_string()),
            current_step: Some(PLACEHOLDER_STEP.to_string()),
        }
    }

    pub fn from_snapshot(snapshot: &ProgressSnapshot) -> Self {
        Self {
            id: Some(snapshot.id.clone()),
            percent: snapshot.percent,
            status: snapshot.status,
            file_name: snapshot.file_name.clone(),
            current_step: snapshot.current_step.clone(),
        }
    }
}

#[cfg(test)]
#[path = "tests/correlator_tests.rs"]
mod tests;
