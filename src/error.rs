// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Error handling facilities for the console operator.

use dropshot::HttpError;
use slog_error_chain::{InlineErrorChain, SlogInlineError};
use thiserror::Error;

#[derive(Debug, Error, SlogInlineError)]
pub enum StartupError {
    #[error("failed to initialize cluster client from in-cluster credentials")]
    Kubernetes(#[source] kube::Error),

    #[error("initializing logger")]
    Logger(#[source] std::io::Error),

    #[error("initializing http server")]
    HttpServer(#[source] dropshot::BuildError),
}

/// Failures fetching the node population from HSM.
///
/// An inventory error carries no partial data; callers treat it as "no
/// information" and leave their cached population untouched.
#[derive(Debug, Error, SlogInlineError)]
pub enum InventoryError {
    #[error("unable to get {collection} from hsm")]
    Unavailable {
        collection: &'static str,
        #[source]
        err: reqwest::Error,
    },
}

/// Failures talking to the console-data service.
#[derive(Debug, Error, SlogInlineError)]
pub enum StateStoreError {
    #[error("console-data request failed")]
    Unavailable(#[source] reqwest::Error),

    #[error("node {0} is not currently claimed by any worker")]
    NotMonitored(String),
}

/// Failures from the cluster API.
#[derive(Debug, Error, SlogInlineError)]
pub enum ClusterError {
    #[error("worker set {name} not found in namespace {namespace}")]
    WorkloadNotFound { name: String, namespace: String },

    #[error("pod {0} not found")]
    PodNotFound(String),

    #[error("pod {0} is not scheduled on any cluster node")]
    PodNotScheduled(String),

    #[error("failed to establish exec stream into pod {pod}")]
    ExecSetupFailed {
        pod: String,
        #[source]
        err: kube::Error,
    },

    #[error("cluster api error")]
    Api(#[source] kube::Error),
}

impl From<ClusterError> for HttpError {
    fn from(error: ClusterError) -> Self {
        match error {
            ClusterError::PodNotFound(_) | ClusterError::PodNotScheduled(_) => {
                HttpError::for_not_found(
                    None,
                    InlineErrorChain::new(&error).to_string(),
                )
            }
            ClusterError::ExecSetupFailed { .. } => http_err_with_message(
                dropshot::ErrorStatusCode::INTERNAL_SERVER_ERROR,
                "ExecSetupFailed",
                InlineErrorChain::new(&error).to_string(),
            ),
            ClusterError::WorkloadNotFound { .. } | ClusterError::Api(_) => {
                http_err_with_message(
                    dropshot::ErrorStatusCode::SERVICE_UNAVAILABLE,
                    "ClusterApiError",
                    InlineErrorChain::new(&error).to_string(),
                )
            }
        }
    }
}

// Helper function to return an `HttpError` with the same internal and
// external message. The operator is an internal service; even on 500-level
// responses the caller gets real information about what went wrong.
pub(crate) fn http_err_with_message(
    status_code: dropshot::ErrorStatusCode,
    error_code: &str,
    message: String,
) -> HttpError {
    HttpError {
        status_code,
        error_code: Some(error_code.to_string()),
        external_message: message.clone(),
        internal_message: message,
        headers: None,
    }
}
