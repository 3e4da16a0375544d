// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Control-plane operator for the console-access fleet.
//!
//! The operator reconciles the hardware inventory against a pool of
//! console worker pods: it sizes the pool, publishes per-worker node
//! budgets, keeps the console-data service's inventory current, evicts
//! stale worker claims, and bridges authenticated clients to live console
//! streams over websockets.

mod background;
mod config;
mod console_channel;
mod console_data;
mod context;
mod error;
mod fleet;
mod inventory;
mod keys;
mod reconciler;
mod tenancy;
mod worker_set;
mod zombies;

pub mod http_entrypoints;

pub use config::{Config, LoadError, OperatorConfig};
pub use context::ServerContext;
pub use error::*;
pub use fleet::{size_fleet, FleetSizing, FleetState};

use slog::{info, o, Logger};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

/// Period of the zombie-janitor scan.
const ZOMBIE_SCAN_PERIOD: Duration = Duration::from_secs(30);

type HttpServer = dropshot::HttpServer<Arc<ServerContext>>;

pub struct Server {
    /// shared state used by API request handlers
    apictx: Arc<ServerContext>,
    http_server: HttpServer,
    /// periodic tasks: hardware reconcile, heartbeat reap, zombie janitor
    driver: background::Driver,
}

impl Server {
    /// Start a console-operator server.
    pub async fn start(config: Config, log: Logger) -> Result<Server, StartupError> {
        info!(log, "setting up console-operator server");

        let apictx = ServerContext::new(&config.operator, &log).await?;

        let http_server = dropshot::ServerBuilder::new(
            http_entrypoints::api(),
            Arc::clone(&apictx),
            log.new(o!("component" => "dropshot")),
        )
        .config(config.dropshot.clone())
        .start()
        .map_err(StartupError::HttpServer)?;
        info!(
            log, "console-operator API listening";
            "local_addr" => %http_server.local_addr(),
        );

        let operator = &config.operator;
        let mut driver = background::Driver::new();
        driver.register(
            "hardware_reconcile",
            Duration::from_secs(operator.hardware_update_sec),
            Box::new(reconciler::HardwareReconciler::new(
                Arc::clone(&apictx.fleet),
                Arc::clone(&apictx.suspended),
                inventory::HsmClient::new(&operator.hsm_base, &log),
                apictx.console_data.clone(),
                apictx.worker_set.clone(),
                keys::ScriptKeyStager::new(
                    operator.key_deploy_program.clone(),
                    &log,
                ),
                operator.budget_file.clone(),
                log.new(o!("component" => "reconciler")),
            )),
            &log,
        );
        driver.register(
            "heartbeat_reap",
            Duration::from_secs(operator.heartbeat_check_sec),
            Box::new(reconciler::HeartbeatReaper::new(
                apictx.console_data.clone(),
                operator.heartbeat_stale_minutes,
                log.new(o!("component" => "heartbeat")),
            )),
            &log,
        );
        driver.register(
            "zombie_janitor",
            ZOMBIE_SCAN_PERIOD,
            Box::new(zombies::ZombieReaper::new(
                log.new(o!("component" => "zombies")),
            )),
            &log,
        );

        Ok(Server { apictx, http_server, driver })
    }

    pub fn log(&self) -> &Logger {
        &self.apictx.log
    }

    /// Set the shutdown latch so no new reconcile work is scheduled.
    pub fn begin_shutdown(&self) {
        self.apictx.suspended.store(true, Ordering::SeqCst);
    }

    /// Shut down the HTTP server with a graceful drain and stop the
    /// periodic tasks. In-flight websockets run until their exec streams
    /// end.
    pub async fn close(self) -> Result<(), String> {
        let Server { apictx: _apictx, http_server, driver } = self;
        let result = http_server.close().await;
        drop(driver);
        result
    }

    /// Wait for the server to shut down without initiating it.
    pub async fn wait_for_finish(&self) -> Result<(), String> {
        self.http_server.wait_for_shutdown().await
    }
}

/// Build the logger from the config, apply environment overrides, and
/// start an instance of the [Server].
pub async fn start_server(mut config: Config) -> Result<Server, StartupError> {
    let log = config
        .log
        .to_logger("console-operator")
        .map_err(StartupError::Logger)?;
    config.operator.apply_env_overrides(&log);
    Server::start(config, log).await
}
