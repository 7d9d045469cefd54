//! Folds progress updates into a monotonic per-job view.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::PoisonError;

use brand_audit_protocol::JobStatus;
use brand_audit_protocol::ProgressUpdate;
use tokio::sync::watch;

use crate::dispatcher::EventDispatcher;
use crate::dispatcher::EventType;
use crate::dispatcher::StreamEvent;
use crate::dispatcher::SubscribeOptions;
use crate::dispatcher::SubscriptionHandle;

/// Stages in the backend pipeline when an update does not list them.
pub const DEFAULT_STAGE_COUNT: usize = 6;

#[derive(Debug, Clone, PartialEq)]
pub struct ProgressSnapshot {
    pub job_id: String,
    /// 0 to 100, never decreasing.
    pub overall_progress: f64,
    pub current_stage_index: usize,
    /// 0 to 100.
    pub stage_progress: f64,
    pub status: JobStatus,
    pub elapsed_seconds: f64,
    pub estimated_remaining_seconds: Option<f64>,
    pub error_message: Option<String>,
    pub completed_stage_indices: BTreeSet<usize>,
    pub stage_count: usize,
}

impl ProgressSnapshot {
    pub fn initial(job_id: impl Into<String>, stage_count: usize) -> Self {
        Self {
            job_id: job_id.into(),
            overall_progress: 0.0,
            current_stage_index: 0,
            stage_progress: 0.0,
            status: JobStatus::Starting,
            elapsed_seconds: 0.0,
            estimated_remaining_seconds: None,
            error_message: None,
            completed_stage_indices: BTreeSet::new(),
            stage_count,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }
}

#[derive(Debug, Clone)]
pub struct ProgressReducer {
    snapshot: ProgressSnapshot,
}

impl ProgressReducer {
    pub fn new(job_id: impl Into<String>) -> Self {
        Self::with_stage_count(job_id, DEFAULT_STAGE_COUNT)
    }

    pub fn with_stage_count(job_id: impl Into<String>, stage_count: usize) -> Self {
        Self {
            snapshot: ProgressSnapshot::initial(job_id, stage_count),
        }
    }

    pub fn snapshot(&self) -> &ProgressSnapshot {
        &self.snapshot
    }

    /// Applies `update` and returns the resulting snapshot, or `None` when
    /// the update was ignored (job already terminal, or another job's).
    pub fn apply(&mut self, update: &ProgressUpdate) -> Option<&ProgressSnapshot> {
        let current = &self.snapshot;
        if current.is_terminal() {
            tracing::debug!(job_id = %current.job_id, status = %update.status, "ignoring update after terminal status");
            return None;
        }
        if update
            .analysis_id
            .as_deref()
            .is_some_and(|id| id != current.job_id)
        {
            return None;
        }

        let mut next = current.clone();
        if !update.stages.is_empty() {
            next.stage_count = update.stages.len();
        }
        next.status = update.status;
        // Stage indices from the wire are bounded by the known stage count.
        let last_stage = next.stage_count.max(1) - 1;
        next.current_stage_index = update
            .current_stage
            .min(last_stage)
            .max(current.current_stage_index);
        next.stage_progress = clamp_percent(update.stage_progress).unwrap_or(current.stage_progress);
        next.overall_progress = clamp_percent(update.overall_progress)
            .unwrap_or(current.overall_progress)
            .max(current.overall_progress);
        next.elapsed_seconds = non_negative(update.elapsed_time).unwrap_or(current.elapsed_seconds);
        next.estimated_remaining_seconds = update.time_remaining.and_then(non_negative);
        next.error_message = update.error_message.clone().or(next.error_message);

        next.completed_stage_indices.extend(0..next.current_stage_index);
        if next.status == JobStatus::Completed {
            next.overall_progress = 100.0;
            next.stage_progress = 100.0;
            next.estimated_remaining_seconds = Some(0.0);
            let total = next
                .stage_count
                .max(next.current_stage_index.saturating_add(1));
            next.completed_stage_indices.extend(0..total);
        }

        self.snapshot = next;
        Some(&self.snapshot)
    }
}

fn clamp_percent(value: f64) -> Option<f64> {
    value.is_finite().then(|| value.clamp(0.0, 100.0))
}

fn non_negative(value: f64) -> Option<f64> {
    value.is_finite().then(|| value.max(0.0))
}

/// Keeps a [`ProgressReducer`] fed from the dispatcher for one job.
///
/// Dropping the tracker removes its subscription, which in turn leaves the
/// job on the stream if nothing else watches it.
pub struct ProgressTracker {
    job_id: String,
    rx: watch::Receiver<ProgressSnapshot>,
    dispatcher: Arc<EventDispatcher>,
    handle: SubscriptionHandle,
}

impl ProgressTracker {
    pub fn start(dispatcher: Arc<EventDispatcher>, reducer: ProgressReducer) -> Self {
        let job_id = reducer.snapshot().job_id.clone();
        let (tx, rx) = watch::channel(reducer.snapshot().clone());
        let reducer = Mutex::new(reducer);

        let handle = dispatcher.subscribe(
            EventType::ProgressUpdate,
            move |event| {
                let StreamEvent::ProgressUpdate { update, .. } = event else {
                    return Ok(());
                };
                let mut reducer = reducer.lock().unwrap_or_else(PoisonError::into_inner);
                if let Some(snapshot) = reducer.apply(update) {
                    tx.send_replace(snapshot.clone());
                }
                Ok(())
            },
            SubscribeOptions::for_job(job_id.clone()),
        );

        Self {
            job_id,
            rx,
            dispatcher,
            handle,
        }
    }

    pub fn job_id(&self) -> &str {
        &self.job_id
    }

    pub fn snapshot(&self) -> ProgressSnapshot {
        self.rx.borrow().clone()
    }

    pub fn watch(&self) -> watch::Receiver<ProgressSnapshot> {
        self.rx.clone()
    }

    /// Resolves with the first completed or error snapshot.
    pub async fn wait_for_terminal(&self) -> ProgressSnapshot {
        let mut rx = self.rx.clone();
        if let Ok(snapshot) = rx.wait_for(ProgressSnapshot::is_terminal).await {
            return snapshot.clone();
        }
        rx.borrow().clone()
    }
}

impl Drop for ProgressTracker {
    fn drop(&mut self) {
        self.dispatcher.unsubscribe(&self.handle);
    }
}
