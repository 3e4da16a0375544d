// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Common facilities for background tasks
//!
//! Each long-lived periodic activity (hardware reconcile, heartbeat reap,
//! zombie janitor) implements [`BackgroundTask`] and is registered with
//! the [`Driver`], which runs it on its own tokio task at a fixed period.
//! A task's first activation fires immediately at registration. Tasks are
//! aborted when the driver is dropped.

use futures::future::BoxFuture;
use slog::{debug, o, Logger};
use std::time::{Duration, Instant};
use tokio::time::MissedTickBehavior;

pub trait BackgroundTask: Send + Sync {
    fn activate(&mut self) -> BoxFuture<'_, ()>;
}

pub struct Driver {
    tasks: Vec<tokio::task::JoinHandle<()>>,
}

impl Driver {
    pub fn new() -> Driver {
        Driver { tasks: Vec::new() }
    }

    pub fn register(
        &mut self,
        name: &str,
        period: Duration,
        imp: Box<dyn BackgroundTask>,
        log: &Logger,
    ) {
        let log = log.new(o!("background_task" => name.to_string()));
        let task_exec = TaskExec { period, imp, log, iteration: 0 };
        self.tasks.push(tokio::spawn(task_exec.run()));
    }
}

impl Drop for Driver {
    fn drop(&mut self) {
        for task in &self.tasks {
            task.abort();
        }
    }
}

struct TaskExec {
    period: Duration,
    imp: Box<dyn BackgroundTask>,
    log: Logger,
    iteration: u64,
}

impl TaskExec {
    async fn run(mut self) {
        let mut interval = tokio::time::interval(self.period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            interval.tick().await;
            self.activate().await;
        }
    }

    async fn activate(&mut self) {
        self.iteration += 1;
        let iteration = self.iteration;
        let start_instant = Instant::now();

        debug!(&self.log, "activating"; "iteration" => iteration);

        self.imp.activate().await;

        debug!(
            &self.log, "activation complete";
            "elapsed" => ?start_instant.elapsed(),
            "iteration" => iteration,
        );
    }
}
