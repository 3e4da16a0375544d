// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use crate::config::OperatorConfig;
use crate::console_data::ConsoleDataClient;
use crate::error::StartupError;
use crate::fleet::FleetState;
use crate::tenancy::TenancyClient;
use crate::worker_set::WorkerSet;
use slog::Logger;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use tokio::sync::RwLock;

/// Shared state used by API request handlers
pub struct ServerContext {
    /// Cached node population and fleet sizing; written by the reconciler.
    pub fleet: Arc<RwLock<FleetState>>,
    /// Shutdown latch: pauses reconcile work during shutdown, and via the
    /// debug suspend/resume endpoints.
    pub suspended: Arc<AtomicBool>,
    pub console_data: ConsoleDataClient,
    pub tenancy: TenancyClient,
    pub worker_set: WorkerSet,
    pub operator_config: OperatorConfig,
    pub log: Logger,
}

impl ServerContext {
    pub async fn new(
        config: &OperatorConfig,
        log: &Logger,
    ) -> Result<Arc<Self>, StartupError> {
        let worker_set = WorkerSet::new(
            &config.worker_namespace,
            &config.worker_set_name,
            &config.worker_container,
            log,
        )
        .await?;

        let fleet = Arc::new(RwLock::new(FleetState::new(
            config.max_mtn_nodes_per_worker,
            config.max_rvr_nodes_per_worker,
        )));

        Ok(Arc::new(ServerContext {
            fleet,
            suspended: Arc::new(AtomicBool::new(false)),
            console_data: ConsoleDataClient::new(
                &config.console_data_base,
                &config.worker_set_name,
                log,
            ),
            tenancy: TenancyClient::new(&config.tapms_base, log),
            worker_set,
            operator_config: config.clone(),
            log: log.clone(),
        }))
    }
}
