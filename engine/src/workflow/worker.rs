use std::cmp::min;
use std::time::Duration;

use tokio::sync::mpsc::{channel, Receiver, Sender};
use tokio::time::sleep;
use tracing::{debug, error};

use super::{BoxedTask, TaskResult};

const WORKER_QUEUE_SIZE: usize = 32;

/// A serial task queue. Every workflow ID gets its own worker, so tasks
/// routed to the same ID run strictly one after another while distinct IDs
/// proceed independently.
pub struct Worker {
    send: Option<Sender<BoxedTask>>,
    recv: Receiver<BoxedTask>,
}

impl Default for Worker {
    fn default() -> Self {
        Self::new()
    }
}

impl Worker {
    pub fn new() -> Self {
        let (send, recv) = channel(WORKER_QUEUE_SIZE);
        Self { send: Some(send), recv }
    }

    /// Returns a [`Sender`] to push work to this worker.
    ///
    /// # Panics
    /// If this worker has already started.
    pub fn sender(&self) -> Sender<BoxedTask> {
        Sender::clone(self.send.as_ref().unwrap())
    }

    /// Waits for and processes tasks from the queue until the last sending
    /// end of the channel is dropped.
    pub async fn start(mut self) {
        // Drop the self-sender owned by this worker to prevent a deadlock
        // if all the other senders have already been dropped at this point.
        let _ = self.send.take().unwrap();
        debug!("starting worker");

        while let Some(task) = self.recv.recv().await {
            do_work(task).await;
        }
    }
}

/// Poll a task until it reports completion, backing off on `TryAgain` so a
/// flapping dependency does not get hammered.
pub async fn do_work(mut task: BoxedTask) {
    let mut tries: u32 = 0;
    loop {
        match task.poll(()).await {
            TaskResult::Pending(_) => {
                tries = 0;
            }
            TaskResult::TryAgain => {
                let backoff = min(3_u64.pow(tries), 30_000);
                tries += 1;
                sleep(Duration::from_millis(backoff)).await;
            }
            TaskResult::Done(_) | TaskResult::Cancelled => break,
            TaskResult::Err(err) => {
                error!(error = %err, "workflow task failure");
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};

    use super::super::run_once;
    use super::*;
    use crate::error::Error;

    #[tokio::test]
    async fn worker_processes_queued_tasks_in_order() {
        let worker = Worker::new();
        let sender = worker.sender();
        let seen = Arc::new(Mutex::new(Vec::new()));

        for index in 0..4 {
            let seen = Arc::clone(&seen);
            sender
                .send(Box::new(run_once(move || async move {
                    seen.lock().unwrap().push(index);
                    Ok::<_, Error>(())
                })))
                .await
                .unwrap();
        }
        drop(sender);

        worker.start().await;
        assert_eq!(*seen.lock().unwrap(), vec![0, 1, 2, 3]);
    }
}
