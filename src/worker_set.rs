// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Cluster-API adapter for the replicated console worker set.
//!
//! This is a pure capability: it can resize the worker StatefulSet, open
//! exec streams into worker pods, and report where a pod is scheduled.
//! All policy (when to resize, which pod owns a node) lives with the
//! reconciler and the gateway.

use crate::error::{ClusterError, StartupError};
use async_trait::async_trait;
use k8s_openapi::api::apps::v1::StatefulSet;
use k8s_openapi::api::core::v1::Pod;
use kube::api::{Api, AttachParams, AttachedProcess, Patch, PatchParams};
use slog::{info, o, Logger};

/// Capability interface for resizing the worker pool, for the reconciler.
#[async_trait]
pub trait ClusterControl: Send + Sync {
    async fn set_worker_replicas(&self, replicas: i32)
        -> Result<(), ClusterError>;
}

#[derive(Clone)]
pub struct WorkerSet {
    client: kube::Client,
    namespace: String,
    name: String,
    container: String,
    log: Logger,
}

impl WorkerSet {
    /// Construct the adapter from in-cluster credentials. Failure here is
    /// fatal: the operator cannot run without cluster access.
    pub async fn new(
        namespace: &str,
        name: &str,
        container: &str,
        log: &Logger,
    ) -> Result<Self, StartupError> {
        let client = kube::Client::try_default()
            .await
            .map_err(StartupError::Kubernetes)?;
        Ok(Self {
            client,
            namespace: namespace.to_string(),
            name: name.to_string(),
            container: container.to_string(),
            log: log.new(o!("component" => "worker-set")),
        })
    }

    fn stateful_sets(&self) -> Api<StatefulSet> {
        Api::namespaced(self.client.clone(), &self.namespace)
    }

    fn pods(&self) -> Api<Pod> {
        Api::namespaced(self.client.clone(), &self.namespace)
    }

    fn map_get_error(&self, err: kube::Error) -> ClusterError {
        match err {
            kube::Error::Api(ref resp) if resp.code == 404 => {
                ClusterError::WorkloadNotFound {
                    name: self.name.clone(),
                    namespace: self.namespace.clone(),
                }
            }
            err => ClusterError::Api(err),
        }
    }

    /// Open an exec stream into a worker pod's console container. The
    /// returned process carries the stdio pipes the gateway bridges to the
    /// client websocket; it runs until the remote command exits or the
    /// stream is torn down.
    pub async fn open_console_exec(
        &self,
        pod: &str,
        command: Vec<String>,
        stdin: bool,
        tty: bool,
    ) -> Result<AttachedProcess, ClusterError> {
        info!(
            self.log, "opening exec stream";
            "pod" => pod,
            "command" => command.join(" "),
        );
        let params = AttachParams::default()
            .container(self.container.clone())
            .stdin(stdin)
            .stdout(true)
            .stderr(false)
            .tty(tty);
        self.pods().exec(pod, command, &params).await.map_err(|err| {
            ClusterError::ExecSetupFailed { pod: pod.to_string(), err }
        })
    }

    /// Cluster node currently hosting `pod`.
    pub async fn get_pod_node(&self, pod: &str) -> Result<String, ClusterError> {
        let found = self.pods().get(pod).await.map_err(|err| match err {
            kube::Error::Api(ref resp) if resp.code == 404 => {
                ClusterError::PodNotFound(pod.to_string())
            }
            err => ClusterError::Api(err),
        })?;
        found
            .spec
            .and_then(|spec| spec.node_name)
            .ok_or_else(|| ClusterError::PodNotScheduled(pod.to_string()))
    }
}

#[async_trait]
impl ClusterControl for WorkerSet {
    /// Read the worker StatefulSet and patch its replica count if it
    /// differs from `replicas`.
    async fn set_worker_replicas(
        &self,
        replicas: i32,
    ) -> Result<(), ClusterError> {
        let api = self.stateful_sets();
        let sts =
            api.get(&self.name).await.map_err(|err| self.map_get_error(err))?;

        let current = sts.spec.as_ref().and_then(|s| s.replicas).unwrap_or(0);
        info!(
            self.log, "checking worker replicas";
            "current" => current,
            "requested" => replicas,
        );
        if current == replicas {
            info!(self.log, "worker set already at requested replica count");
            return Ok(());
        }

        let patch = serde_json::json!({ "spec": { "replicas": replicas } });
        api.patch(&self.name, &PatchParams::default(), &Patch::Merge(&patch))
            .await
            .map_err(|err| self.map_get_error(err))?;
        info!(self.log, "updated worker set replicas"; "replicas" => replicas);
        Ok(())
    }
}
