use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tokio::sync::mpsc::Sender;
use tracing::debug;

use super::{AndThenNotify, BoxedTask, TaskHandle, Worker};
use crate::error::{Error, Result};

/// Routes tasks onto per-workflow-ID serial queues.
///
/// The ID is deterministic (`deploy-{serviceId}-{projectId}`), so a second
/// submission for a service that is already rolling out lands behind the
/// active task instead of racing it.
#[derive(Clone, Default)]
pub struct TaskRouter {
    queues: Arc<Mutex<HashMap<String, Sender<BoxedTask>>>>,
}

impl TaskRouter {
    /// Enqueue `task` on the serial queue for `workflow_id`, creating the
    /// queue's worker on first use. The returned handle resolves when the
    /// task has run to completion.
    pub async fn route(&self, workflow_id: &str, task: BoxedTask) -> Result<TaskHandle> {
        let sender = {
            let mut queues = self.queues.lock().unwrap();
            match queues.get(workflow_id) {
                Some(sender) if !sender.is_closed() => sender.clone(),
                _ => {
                    debug!(%workflow_id, "starting workflow queue");
                    let worker = Worker::new();
                    let sender = worker.sender();
                    tokio::spawn(worker.start());
                    queues.insert(workflow_id.to_string(), sender.clone());
                    sender
                }
            }
        };

        let (task, handle) = AndThenNotify::after(task);
        sender
            .send(Box::new(task))
            .await
            .map_err(|_| Error::ServiceUnavailable)?;
        Ok(handle)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    use super::super::run_once;
    use super::*;

    #[tokio::test]
    async fn same_id_runs_serially_and_in_submission_order() {
        let router = TaskRouter::default();
        let log = Arc::new(Mutex::new(Vec::new()));

        let slow_log = Arc::clone(&log);
        let slow = router
            .route(
                "deploy-app-p1",
                Box::new(run_once(move || async move {
                    slow_log.lock().unwrap().push("slow:start");
                    tokio::time::sleep(Duration::from_millis(50)).await;
                    slow_log.lock().unwrap().push("slow:end");
                    Ok(())
                })),
            )
            .await
            .unwrap();

        let fast_log = Arc::clone(&log);
        let fast = router
            .route(
                "deploy-app-p1",
                Box::new(run_once(move || async move {
                    fast_log.lock().unwrap().push("fast");
                    Ok(())
                })),
            )
            .await
            .unwrap();

        slow.await;
        fast.await;

        assert_eq!(*log.lock().unwrap(), vec!["slow:start", "slow:end", "fast"]);
    }

    #[tokio::test]
    async fn distinct_ids_do_not_block_each_other() {
        let router = TaskRouter::default();
        let (release_tx, release_rx) = tokio::sync::oneshot::channel::<()>();

        let blocked = router
            .route(
                "deploy-a-p1",
                Box::new(run_once(move || async move {
                    let _ = release_rx.await;
                    Ok(())
                })),
            )
            .await
            .unwrap();

        // The other queue finishes while the first is still parked.
        let other = router
            .route("deploy-b-p1", Box::new(run_once(|| async { Ok(()) })))
            .await
            .unwrap();
        other.await;

        release_tx.send(()).unwrap();
        blocked.await;
    }
}
