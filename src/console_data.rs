// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Client for the console-data service, the durable store of which worker
//! owns which node console.

use crate::error::StateStoreError;
use crate::inventory::NodeRecord;
use async_trait::async_trait;
use reqwest::StatusCode;
use serde::Deserialize;
use slog::{info, o, warn, Logger};
use slog_error_chain::InlineErrorChain;
use std::time::Duration;

/// Synthesize the full worker pod name from the short console name the
/// data service stores (e.g. "3" -> "cray-console-node-3").
pub fn worker_pod_name(worker_set_name: &str, console_name: &str) -> String {
    format!("{worker_set_name}-{console_name}")
}

/// Capability interface over the console-data service.
#[async_trait]
pub trait StateStore: Send + Sync {
    /// Register newly discovered nodes. Returns whether the service
    /// accepted the update; on failure the caller schedules a full resync.
    async fn register_nodes(&self, nodes: &[NodeRecord]) -> bool;

    /// Deregister removed nodes. Best-effort; failures are logged.
    async fn deregister_nodes(&self, nodes: &[NodeRecord]);

    /// Resolve the worker pod currently holding a node's console.
    async fn lookup_worker(
        &self,
        node_id: &str,
    ) -> Result<String, StateStoreError>;

    /// Ask the service to expire worker claims older than `minutes`.
    async fn reap_stale(&self, minutes: u64) -> Result<(), StateStoreError>;
}

#[derive(Debug, Deserialize)]
struct StoreMessage {
    #[serde(default)]
    message: String,
}

#[derive(Debug, Deserialize)]
struct ConsolePodResponse {
    #[serde(rename = "nodeconsolename")]
    node_console_name: String,
}

#[derive(Clone)]
pub struct ConsoleDataClient {
    client: reqwest::Client,
    base_url: String,
    worker_set_name: String,
    log: Logger,
}

impl ConsoleDataClient {
    pub fn new(base_url: &str, worker_set_name: &str, log: &Logger) -> Self {
        let client = reqwest::ClientBuilder::new()
            .connect_timeout(Duration::from_secs(15))
            .timeout(Duration::from_secs(60))
            .build()
            .expect("Failed to build HTTP client");
        Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            worker_set_name: worker_set_name.to_string(),
            log: log.new(o!("component" => "console-data")),
        }
    }
}

#[async_trait]
impl StateStore for ConsoleDataClient {
    async fn register_nodes(&self, nodes: &[NodeRecord]) -> bool {
        info!(
            self.log, "sending nodes to console-data";
            "count" => nodes.len(),
        );

        let url = format!("{}/inventory", self.base_url);
        let resp = match self.client.put(&url).json(nodes).send().await {
            Ok(resp) => resp,
            Err(err) => {
                warn!(
                    self.log, "error adding new data to console-data inventory";
                    InlineErrorChain::new(&err),
                );
                return false;
            }
        };

        // anything below http 400 counts as success
        let ok = resp.status().as_u16() < 400;
        match resp.json::<StoreMessage>().await {
            Ok(body) if !body.message.is_empty() => {
                info!(
                    self.log, "console-data return message";
                    "message" => body.message,
                );
            }
            Ok(_) => {}
            Err(err) => {
                warn!(
                    self.log, "error decoding console-data response";
                    InlineErrorChain::new(&err),
                );
            }
        }
        ok
    }

    async fn deregister_nodes(&self, nodes: &[NodeRecord]) {
        for node in nodes {
            info!(
                self.log, "removing node from console-data";
                "node_id" => &node.node_id,
            );
        }

        let url = format!("{}/inventory", self.base_url);
        match self.client.delete(&url).json(nodes).send().await {
            Ok(resp) => {
                if !resp.status().is_success() {
                    warn!(
                        self.log, "console-data remove returned error status";
                        "status" => resp.status().as_u16(),
                    );
                }
            }
            Err(err) => {
                warn!(
                    self.log, "unable to remove elements from console-data";
                    InlineErrorChain::new(&err),
                );
            }
        }
    }

    async fn lookup_worker(
        &self,
        node_id: &str,
    ) -> Result<String, StateStoreError> {
        let url = format!("{}/consolepod/{}", self.base_url, node_id);
        let resp = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(StateStoreError::Unavailable)?;
        if resp.status() == StatusCode::NOT_FOUND {
            return Err(StateStoreError::NotMonitored(node_id.to_string()));
        }
        let body: ConsolePodResponse = resp
            .error_for_status()
            .map_err(StateStoreError::Unavailable)?
            .json()
            .await
            .map_err(StateStoreError::Unavailable)?;
        Ok(worker_pod_name(&self.worker_set_name, &body.node_console_name))
    }

    async fn reap_stale(&self, minutes: u64) -> Result<(), StateStoreError> {
        let url = format!("{}/consolepod/{}/clear", self.base_url, minutes);
        self.client
            .delete(&url)
            .send()
            .await
            .and_then(|r| r.error_for_status())
            .map_err(StateStoreError::Unavailable)?;
        Ok(())
    }
}
