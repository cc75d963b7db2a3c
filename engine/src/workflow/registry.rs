use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use serde::Serialize;

/// Outcome of a cancellation request, reported back to the caller.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct CancelResult {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl CancelResult {
    fn accepted() -> Self {
        Self { success: true, message: None }
    }

    fn refused(message: &str) -> Self {
        Self { success: false, message: Some(message.to_string()) }
    }
}

#[derive(Default)]
struct WorkflowState {
    /// Set once the workflow has started mutating orchestrator state;
    /// cancellation is refused from this point on.
    committed: bool,
    cancellation_requested: bool,
}

/// Tracks in-flight workflow runs so cancellation updates can find them.
///
/// The deploy workflow honours cancellation at exactly one point, before
/// `PrepareDeployment`. Once it commits, a cancel request is refused and
/// the run proceeds normally; this keeps the state machine linear and
/// avoids partial rollbacks.
#[derive(Clone, Default)]
pub struct WorkflowRegistry {
    inner: Arc<Mutex<HashMap<String, WorkflowState>>>,
}

impl WorkflowRegistry {
    /// Register a fresh run for `workflow_id`. Called at the start of every
    /// run, including each continue-as-new iteration, so a cancellation
    /// aimed at the previous deployment does not leak into the next one.
    pub fn begin(&self, workflow_id: &str) {
        self.inner
            .lock()
            .unwrap()
            .insert(workflow_id.to_string(), WorkflowState::default());
    }

    pub fn request_cancellation(&self, workflow_id: &str) -> CancelResult {
        let mut inner = self.inner.lock().unwrap();
        match inner.get_mut(workflow_id) {
            None => CancelResult::refused("Deployment already finished"),
            Some(state) if state.committed => CancelResult::refused("Deployment already finished"),
            Some(state) if state.cancellation_requested => {
                CancelResult::refused("Cancellation already requested")
            }
            Some(state) => {
                state.cancellation_requested = true;
                CancelResult::accepted()
            }
        }
    }

    pub fn is_cancellation_requested(&self, workflow_id: &str) -> bool {
        self.inner
            .lock()
            .unwrap()
            .get(workflow_id)
            .map(|state| state.cancellation_requested)
            .unwrap_or(false)
    }

    /// Mark the run as past its cancellation point.
    pub fn commit(&self, workflow_id: &str) {
        if let Some(state) = self.inner.lock().unwrap().get_mut(workflow_id) {
            state.committed = true;
        }
    }

    /// Drop the run's state entirely once the workflow returns.
    pub fn finish(&self, workflow_id: &str) {
        self.inner.lock().unwrap().remove(workflow_id);
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn cancellation_is_accepted_once_before_commit() {
        let registry = WorkflowRegistry::default();
        registry.begin("deploy-app-p1");

        assert_eq!(registry.request_cancellation("deploy-app-p1"), CancelResult::accepted());
        assert!(registry.is_cancellation_requested("deploy-app-p1"));

        assert_eq!(
            registry.request_cancellation("deploy-app-p1"),
            CancelResult::refused("Cancellation already requested"),
        );
    }

    #[test]
    fn cancellation_is_refused_after_commit_or_finish() {
        let registry = WorkflowRegistry::default();
        registry.begin("deploy-app-p1");
        registry.commit("deploy-app-p1");

        assert_eq!(
            registry.request_cancellation("deploy-app-p1"),
            CancelResult::refused("Deployment already finished"),
        );

        registry.finish("deploy-app-p1");
        assert_eq!(
            registry.request_cancellation("deploy-app-p1"),
            CancelResult::refused("Deployment already finished"),
        );
    }

    #[test]
    fn a_new_run_resets_the_flag() {
        let registry = WorkflowRegistry::default();
        registry.begin("deploy-app-p1");
        let _ = registry.request_cancellation("deploy-app-p1");

        // Continue-as-new starts the next deployment with a clean slate.
        registry.begin("deploy-app-p1");
        assert!(!registry.is_cancellation_requested("deploy-app-p1"));
    }
}
