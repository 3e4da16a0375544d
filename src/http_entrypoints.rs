// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! HTTP entrypoint functions for the console operator
//!
//! Everything lives under the `/console-operator` prefix. The two
//! websocket endpoints (`interact`, `follow`) validate the node and the
//! caller's tenancy *before* upgrading the connection so that errors can
//! still be returned as plain HTTP statuses.

use crate::console_data::StateStore;
use crate::error::http_err_with_message;
use crate::fleet::clamp_max_nodes;
use crate::ServerContext;
use dropshot::endpoint;
use dropshot::ApiDescription;
use dropshot::HttpError;
use dropshot::HttpResponseOk;
use dropshot::HttpResponseUpdatedNoContent;
use dropshot::Path;
use dropshot::RequestContext;
use dropshot::TypedBody;
use dropshot::WebsocketEndpointResult;
use dropshot::WebsocketUpgrade;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use slog::{info, o, warn};
use slog_error_chain::InlineErrorChain;
use std::collections::BTreeMap;
use std::sync::atomic::Ordering;
use std::sync::Arc;

// Header keys for console streaming options.
const HEADER_TENANT: &str = "Cray-Tenant-Name";
const HEADER_TAIL_LINES: &str = "Cray-Tail";
const HEADER_DUMP_ONLY: &str = "Cray-Dump-Only";

/// Service health summary.
///
/// Values are reported as strings for wire compatibility with existing
/// tooling; unset sizing values render as "-1".
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema)]
pub struct HealthResponse {
    #[serde(rename = "consoles")]
    pub number_consoles: String,
    #[serde(rename = "hardwareupdatesec")]
    pub hardware_update_sec: String,
    #[serde(rename = "hardwareupdate")]
    pub last_hardware_update: String,
    #[serde(rename = "nodepods")]
    pub number_node_pods: String,
    #[serde(rename = "rvrnodesperpod")]
    pub number_rvr_nodes_per_pod: String,
    #[serde(rename = "mtnnodesperpod")]
    pub number_mtn_nodes_per_pod: String,
    #[serde(rename = "maxrvrnodesperpod")]
    pub max_rvr_nodes_per_pod: String,
    #[serde(rename = "maxmtnnodesperpod")]
    pub max_mtn_nodes_per_pod: String,
    #[serde(rename = "heartbeatcheck")]
    pub heartbeat_check_sec: String,
    #[serde(rename = "heartbeatstale")]
    pub heartbeat_stale_min: String,
}

/// One worker pod and how many consoles it currently holds.
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema)]
pub struct NodePodPair {
    #[serde(rename = "PodID")]
    pub pod_id: String,
    #[serde(rename = "NumNodes")]
    pub num_nodes: i64,
}

#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema)]
pub struct InfoResponse {
    #[serde(rename = "Nodes")]
    pub nodes: Vec<NodePodPair>,
    #[serde(rename = "Health")]
    pub health: HealthResponse,
}

#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema)]
pub struct MaxNodeData {
    /// max number of river nodes per worker
    #[serde(rename = "maxRvr")]
    pub max_rvr_nodes: i64,
    /// max number of mountain nodes per worker
    #[serde(rename = "maxMtn")]
    pub max_mtn_nodes: i64,
}

#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema)]
pub struct NumNodeData {
    /// target number of river nodes per worker
    #[serde(rename = "numRvr")]
    pub num_rvr_nodes: i64,
    /// target number of mountain nodes per worker
    #[serde(rename = "numMtn")]
    pub num_mtn_nodes: i64,
}

#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema)]
pub struct GetNodeData {
    pub xname: String,
}

#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema)]
pub struct GetNodePodResponse {
    pub podname: String,
}

#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema)]
pub struct PodLocationResponse {
    pub podname: String,
    /// cluster node hosting the pod
    pub node: String,
}

#[derive(Deserialize, JsonSchema)]
struct PathPodId {
    #[serde(rename = "podID")]
    pod_id: String,
}

#[derive(Deserialize, JsonSchema)]
struct PathNodeXname {
    #[serde(rename = "nodeXname")]
    node_xname: String,
}

/// Basic liveness probe.
#[endpoint {
    method = GET,
    path = "/console-operator/liveness",
}]
async fn liveness(
    _rqctx: RequestContext<Arc<ServerContext>>,
) -> Result<HttpResponseUpdatedNoContent, HttpError> {
    Ok(HttpResponseUpdatedNoContent {})
}

/// Basic readiness probe.
#[endpoint {
    method = GET,
    path = "/console-operator/readiness",
}]
async fn readiness(
    _rqctx: RequestContext<Arc<ServerContext>>,
) -> Result<HttpResponseUpdatedNoContent, HttpError> {
    Ok(HttpResponseUpdatedNoContent {})
}

async fn current_health(apictx: &ServerContext) -> HealthResponse {
    let config = &apictx.operator_config;
    let fleet = apictx.fleet.read().await;
    HealthResponse {
        number_consoles: fleet.len().to_string(),
        hardware_update_sec: config.hardware_update_sec.to_string(),
        last_hardware_update: fleet
            .last_reconcile_time
            .map(|t| t.to_rfc3339())
            .unwrap_or_else(|| "Unknown".to_string()),
        number_node_pods: fleet.worker_count.unwrap_or(-1).to_string(),
        number_rvr_nodes_per_pod: fleet
            .rvr_budget_per_worker
            .unwrap_or(-1)
            .to_string(),
        number_mtn_nodes_per_pod: fleet
            .mtn_budget_per_worker
            .unwrap_or(-1)
            .to_string(),
        max_rvr_nodes_per_pod: fleet.max_rvr_per_worker.to_string(),
        max_mtn_nodes_per_pod: fleet.max_mtn_per_worker.to_string(),
        heartbeat_check_sec: config.heartbeat_check_sec.to_string(),
        heartbeat_stale_min: config.heartbeat_stale_minutes.to_string(),
    }
}

/// Service health summary.
#[endpoint {
    method = GET,
    path = "/console-operator/health",
}]
async fn health(
    rqctx: RequestContext<Arc<ServerContext>>,
) -> Result<HttpResponseOk<HealthResponse>, HttpError> {
    let apictx = rqctx.context();
    Ok(HttpResponseOk(current_health(apictx).await))
}

/// Debug summary: health plus the per-worker console tally.
#[endpoint {
    method = GET,
    path = "/console-operator/info",
}]
async fn info(
    rqctx: RequestContext<Arc<ServerContext>>,
) -> Result<HttpResponseOk<InfoResponse>, HttpError> {
    let apictx = rqctx.context();

    let node_ids = apictx.fleet.read().await.node_ids();
    let mut tally: BTreeMap<String, i64> = BTreeMap::new();
    for node_id in node_ids {
        match apictx.console_data.lookup_worker(&node_id).await {
            Ok(pod) => *tally.entry(pod).or_default() += 1,
            Err(_) => *tally.entry("Unassigned".to_string()).or_default() += 1,
        }
    }

    let nodes = tally
        .into_iter()
        .map(|(pod_id, num_nodes)| NodePodPair { pod_id, num_nodes })
        .collect();

    Ok(HttpResponseOk(InfoResponse {
        nodes,
        health: current_health(apictx).await,
    }))
}

/// Set the maximum number of nodes a single worker may hold, per class.
/// Out-of-range values are clamped.
#[endpoint {
    method = PATCH,
    path = "/console-operator/maxNodesPerPod",
}]
async fn set_max_nodes_per_pod(
    rqctx: RequestContext<Arc<ServerContext>>,
    body: TypedBody<MaxNodeData>,
) -> Result<HttpResponseOk<MaxNodeData>, HttpError> {
    let apictx = rqctx.context();
    let input = body.into_inner();

    info!(
        apictx.log, "resetting max nodes per worker";
        "max_mtn" => input.max_mtn_nodes,
        "max_rvr" => input.max_rvr_nodes,
    );
    let (max_mtn, mtn_ok) = clamp_max_nodes(input.max_mtn_nodes, 2, 750);
    if !mtn_ok {
        warn!(
            apictx.log, "invalid max mountain nodes per worker; clamped";
            "asked" => input.max_mtn_nodes,
            "stored" => max_mtn,
        );
    }
    let (max_rvr, rvr_ok) = clamp_max_nodes(input.max_rvr_nodes, 2, 2000);
    if !rvr_ok {
        warn!(
            apictx.log, "invalid max river nodes per worker; clamped";
            "asked" => input.max_rvr_nodes,
            "stored" => max_rvr,
        );
    }

    let mut fleet = apictx.fleet.write().await;
    fleet.max_mtn_per_worker = max_mtn;
    fleet.max_rvr_per_worker = max_rvr;

    Ok(HttpResponseOk(MaxNodeData {
        max_mtn_nodes: max_mtn,
        max_rvr_nodes: max_rvr,
    }))
}

/// Current target number of nodes per worker, per class.
#[endpoint {
    method = GET,
    path = "/console-operator/numNodesPerPod",
}]
async fn get_num_nodes_per_pod(
    rqctx: RequestContext<Arc<ServerContext>>,
) -> Result<HttpResponseOk<NumNodeData>, HttpError> {
    let apictx = rqctx.context();
    let fleet = apictx.fleet.read().await;
    Ok(HttpResponseOk(NumNodeData {
        num_rvr_nodes: fleet.rvr_budget_per_worker.unwrap_or(-1),
        num_mtn_nodes: fleet.mtn_budget_per_worker.unwrap_or(-1),
    }))
}

/// Debugging only: suspend the periodic reconcile work.
#[endpoint {
    method = POST,
    path = "/console-operator/suspend",
}]
async fn suspend(
    rqctx: RequestContext<Arc<ServerContext>>,
) -> Result<HttpResponseOk<()>, HttpError> {
    let apictx = rqctx.context();
    apictx.suspended.store(true, Ordering::SeqCst);
    info!(apictx.log, "updates suspended");
    Ok(HttpResponseOk(()))
}

/// Debugging only: resume the periodic reconcile work.
#[endpoint {
    method = POST,
    path = "/console-operator/resume",
}]
async fn resume(
    rqctx: RequestContext<Arc<ServerContext>>,
) -> Result<HttpResponseOk<()>, HttpError> {
    let apictx = rqctx.context();
    apictx.suspended.store(false, Ordering::SeqCst);
    info!(apictx.log, "updates resumed");
    Ok(HttpResponseOk(()))
}

/// Debugging only: wipe the node cache and deregister everything from
/// console-data. The next reconcile tick repopulates from HSM.
#[endpoint {
    method = DELETE,
    path = "/console-operator/clearData",
}]
async fn clear_data(
    rqctx: RequestContext<Arc<ServerContext>>,
) -> Result<HttpResponseOk<()>, HttpError> {
    let apictx = rqctx.context();
    info!(apictx.log, "clearing all cached node data");

    let removed = apictx.fleet.write().await.drain_all();
    if !removed.is_empty() {
        apictx.console_data.deregister_nodes(&removed).await;
    }
    Ok(HttpResponseOk(()))
}

/// Which worker pod holds a particular node's console.
#[endpoint {
    method = GET,
    path = "/console-operator/getNodePod",
}]
async fn get_node_pod(
    rqctx: RequestContext<Arc<ServerContext>>,
    body: TypedBody<GetNodeData>,
) -> Result<HttpResponseOk<GetNodePodResponse>, HttpError> {
    let apictx = rqctx.context();
    let input = body.into_inner();

    let podname = apictx
        .console_data
        .lookup_worker(&input.xname)
        .await
        .map_err(|err| {
            warn!(
                apictx.log, "error getting console worker from console-data";
                InlineErrorChain::new(&err),
            );
            http_err_with_message(
                dropshot::ErrorStatusCode::INTERNAL_SERVER_ERROR,
                "ConsoleDataError",
                format!(
                    "There was an error querying console-data service: {}",
                    InlineErrorChain::new(&err),
                ),
            )
        })?;

    Ok(HttpResponseOk(GetNodePodResponse { podname }))
}

/// Which cluster node hosts the given worker pod.
#[endpoint {
    method = GET,
    path = "/console-operator/location/{podID}",
}]
async fn pod_location(
    rqctx: RequestContext<Arc<ServerContext>>,
    path: Path<PathPodId>,
) -> Result<HttpResponseOk<PodLocationResponse>, HttpError> {
    let apictx = rqctx.context();
    let PathPodId { pod_id } = path.into_inner();

    let node = apictx.worker_set.get_pod_node(&pod_id).await?;
    Ok(HttpResponseOk(PodLocationResponse { podname: pod_id, node }))
}

/// Shared preconditions for the two streaming endpoints: the node must be
/// known, currently monitored, and allowed for the caller's tenant (if
/// any). Returns the owning worker pod name.
async fn validate_node(
    apictx: &ServerContext,
    node_xname: &str,
    tenant: Option<&str>,
) -> Result<String, HttpError> {
    if node_xname.is_empty() {
        return Err(HttpError::for_bad_request(
            None,
            "there was an error reading the node xname from the request"
                .to_string(),
        ));
    }

    if !apictx.fleet.read().await.contains_node(node_xname) {
        return Err(HttpError::for_not_found(
            None,
            format!("{node_xname} is not a valid node"),
        ));
    }

    let podname = apictx
        .console_data
        .lookup_worker(node_xname)
        .await
        .map_err(|err| {
            info!(
                apictx.log, "node is not being monitored";
                "node_id" => node_xname,
                InlineErrorChain::new(&err),
            );
            HttpError::for_not_found(
                None,
                format!("Node {node_xname} is not currently being monitored"),
            )
        })?;

    if let Some(tenant) = tenant {
        if !apictx.tenancy.node_allowed(tenant, node_xname).await {
            return Err(http_err_with_message(
                dropshot::ErrorStatusCode::FORBIDDEN,
                "TenantNotAllowed",
                format!(
                    "Tenant {tenant} is not allowed to access node \
                     {node_xname}"
                ),
            ));
        }
    }

    Ok(podname)
}

fn header_value(
    rqctx: &RequestContext<Arc<ServerContext>>,
    name: &str,
) -> Option<String> {
    rqctx
        .request
        .headers()
        .get(name)
        .and_then(|value| value.to_str().ok())
        .map(str::to_string)
}

/// Upgrade into a websocket connection attached to an interactive session
/// on the given node's console.
// This is a websocket endpoint; normally we'd expect to use
// `dropshot::channel` with `protocol = WEBSOCKETS` instead of
// `dropshot::endpoint`, but `dropshot::channel` doesn't allow us to return
// an error _before_ upgrading the connection, and we want to reject
// unknown nodes and unauthorized tenants with plain HTTP statuses.
// Therefore we take the special argument type `WebsocketUpgrade` and call
// `WebsocketUpgrade::handle()` by hand after our error checking.
#[endpoint {
    method = GET,
    path = "/console-operator/interact/{nodeXname}",
}]
async fn console_interact(
    rqctx: RequestContext<Arc<ServerContext>>,
    path: Path<PathNodeXname>,
    websocket: WebsocketUpgrade,
) -> WebsocketEndpointResult {
    let apictx = rqctx.context();
    let PathNodeXname { node_xname } = path.into_inner();

    let tenant = header_value(&rqctx, HEADER_TENANT);
    let podname =
        validate_node(apictx, &node_xname, tenant.as_deref()).await?;

    let command =
        vec!["conman".to_string(), "-j".to_string(), node_xname.clone()];
    let process = apictx
        .worker_set
        .open_console_exec(&podname, command, true, true)
        .await?;

    let log = apictx.log.new(o!(
        "node" => node_xname,
        "worker" => podname,
        "mode" => "interact",
    ));
    websocket.handle(move |conn| crate::console_channel::run(process, conn, log))
}

/// Upgrade into a websocket connection following the given node's console
/// log. Follow mode is the default; the `Cray-Dump-Only: True` header
/// dumps the current contents instead, and `Cray-Tail: <n>` bounds the
/// number of lines.
#[endpoint {
    method = GET,
    path = "/console-operator/follow/{nodeXname}",
}]
async fn console_follow(
    rqctx: RequestContext<Arc<ServerContext>>,
    path: Path<PathNodeXname>,
    websocket: WebsocketUpgrade,
) -> WebsocketEndpointResult {
    let apictx = rqctx.context();
    let PathNodeXname { node_xname } = path.into_inner();

    let tenant = header_value(&rqctx, HEADER_TENANT);
    let podname =
        validate_node(apictx, &node_xname, tenant.as_deref()).await?;

    let dump_only = header_value(&rqctx, HEADER_DUMP_ONLY)
        .map(|v| v == "True")
        .unwrap_or(false);
    let tail_lines = header_value(&rqctx, HEADER_TAIL_LINES);

    let mut command = vec!["tail".to_string()];
    if !dump_only {
        // '-F' so the follow survives a log rotation
        command.push("-F".to_string());
    }
    if let Some(lines) = tail_lines {
        command.push("-n".to_string());
        command.push(lines);
    }
    command.push(format!("/var/log/conman/console.{node_xname}"));

    let process = apictx
        .worker_set
        .open_console_exec(&podname, command, true, true)
        .await?;

    let log = apictx.log.new(o!(
        "node" => node_xname,
        "worker" => podname,
        "mode" => "follow",
    ));
    websocket.handle(move |conn| crate::console_channel::run(process, conn, log))
}

type ConsoleOperatorApiDescription = ApiDescription<Arc<ServerContext>>;

/// Returns a description of the console-operator API
pub fn api() -> ConsoleOperatorApiDescription {
    fn register_endpoints(
        api: &mut ConsoleOperatorApiDescription,
    ) -> Result<(), String> {
        api.register(liveness).map_err(|e| e.to_string())?;
        api.register(readiness).map_err(|e| e.to_string())?;
        api.register(health).map_err(|e| e.to_string())?;
        api.register(info).map_err(|e| e.to_string())?;
        api.register(set_max_nodes_per_pod).map_err(|e| e.to_string())?;
        api.register(get_num_nodes_per_pod).map_err(|e| e.to_string())?;
        api.register(suspend).map_err(|e| e.to_string())?;
        api.register(resume).map_err(|e| e.to_string())?;
        api.register(clear_data).map_err(|e| e.to_string())?;
        api.register(get_node_pod).map_err(|e| e.to_string())?;
        api.register(pod_location).map_err(|e| e.to_string())?;
        api.register(console_interact).map_err(|e| e.to_string())?;
        api.register(console_follow).map_err(|e| e.to_string())?;
        Ok(())
    }

    let mut api = ConsoleOperatorApiDescription::new();
    if let Err(err) = register_endpoints(&mut api) {
        panic!("failed to register entrypoints: {}", err);
    }
    api
}
