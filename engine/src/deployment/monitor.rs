//! Per-deployment monitor schedules.
//!
//! After a successful rollout the deployment gets a recurring schedule,
//! keyed `monitor-{hash}-{serviceId}-{projectId}`, that runs a single
//! oneshot pass of the healthcheck evaluator and writes the result back.
//! The schedule dies with the deployment: teardown unregisters it, and a
//! pass that finds the row or the swarm service gone stops the loop.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::activities::Activities;
use crate::dal::Dal;
use crate::deployment::MonitorTarget;
use crate::error::Error;

#[derive(Clone, Default)]
pub struct MonitorScheduler {
    schedules: Arc<Mutex<HashMap<String, JoinHandle<()>>>>,
}

impl MonitorScheduler {
    /// Register (or replace) the schedule for a deployment.
    pub fn register<D: Dal>(&self, activities: Arc<Activities<D>>, target: MonitorTarget) {
        let schedule_id = target.deployment.monitor_schedule_id();
        let interval = Duration::from_secs(activities.config().monitor_interval);

        let schedules = Arc::clone(&self.schedules);
        let loop_id = schedule_id.clone();
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            // The first tick fires immediately; skip it so a freshly
            // healthy deployment is not probed twice in a row.
            ticker.tick().await;

            loop {
                ticker.tick().await;
                match activities.run_monitor_pass(&target).await {
                    Ok(status) => {
                        debug!(schedule = %loop_id, ?status, "monitor pass finished");
                    }
                    Err(Error::NotFound(reason)) => {
                        info!(schedule = %loop_id, %reason, "deployment is gone, stopping monitor");
                        schedules.lock().unwrap().remove(&loop_id);
                        break;
                    }
                    Err(err) => {
                        warn!(schedule = %loop_id, error = %err, "monitor pass failed");
                    }
                }
            }
        });

        if let Some(previous) = self
            .schedules
            .lock()
            .unwrap()
            .insert(schedule_id.clone(), handle)
        {
            previous.abort();
        }
        info!(schedule = %schedule_id, "registered monitor schedule");
    }

    pub fn unregister(&self, schedule_id: &str) {
        if let Some(handle) = self.schedules.lock().unwrap().remove(schedule_id) {
            handle.abort();
            info!(schedule = %schedule_id, "unregistered monitor schedule");
        }
    }

    #[cfg(test)]
    pub fn is_registered(&self, schedule_id: &str) -> bool {
        self.schedules.lock().unwrap().contains_key(schedule_id)
    }
}
