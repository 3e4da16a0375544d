// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Tenant authorization against the tapms service.
//!
//! Policy: when the tenancy service is unreachable or its response cannot
//! be decoded, access is permitted (fail-open) with a warning. A tenant
//! whose resources do not list the node is denied.

use serde::Deserialize;
use slog::{info, o, warn, Logger};
use slog_error_chain::InlineErrorChain;
use std::time::Duration;

#[derive(Debug, Default, Deserialize)]
struct TenantResource {
    #[serde(default)]
    xnames: Vec<String>,
}

#[derive(Debug, Default, Deserialize)]
struct TenantStatus {
    #[serde(default, rename = "tenantresources")]
    tenant_resources: Vec<TenantResource>,
}

#[derive(Debug, Default, Deserialize)]
struct Tenant {
    #[serde(default)]
    status: TenantStatus,
}

fn tenant_allows(tenant: &Tenant, node_id: &str) -> bool {
    tenant
        .status
        .tenant_resources
        .iter()
        .any(|resource| resource.xnames.iter().any(|xn| xn == node_id))
}

#[derive(Clone)]
pub struct TenancyClient {
    client: reqwest::Client,
    base_url: String,
    log: Logger,
}

impl TenancyClient {
    pub fn new(base_url: &str, log: &Logger) -> Self {
        let client = reqwest::ClientBuilder::new()
            .connect_timeout(Duration::from_secs(15))
            .timeout(Duration::from_secs(30))
            .build()
            .expect("Failed to build HTTP client");
        Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            log: log.new(o!("component" => "tenancy")),
        }
    }

    /// Whether `tenant` may access `node_id`.
    pub async fn node_allowed(&self, tenant: &str, node_id: &str) -> bool {
        let url = format!("{}/tenants/{}", self.base_url, tenant);
        info!(
            self.log, "checking tenant access";
            "tenant" => tenant,
            "node_id" => node_id,
        );

        let parsed: Tenant = match self
            .client
            .get(&url)
            .send()
            .await
            .and_then(|r| r.error_for_status())
        {
            Ok(resp) => match resp.json().await {
                Ok(parsed) => parsed,
                Err(err) => {
                    warn!(
                        self.log,
                        "error decoding tapms response; permitting access";
                        InlineErrorChain::new(&err),
                    );
                    return true;
                }
            },
            Err(err) => {
                warn!(
                    self.log, "error calling tapms; permitting access";
                    InlineErrorChain::new(&err),
                );
                return true;
            }
        };

        let allowed = tenant_allows(&parsed, node_id);
        if !allowed {
            info!(
                self.log, "tenant does not list node";
                "tenant" => tenant,
                "node_id" => node_id,
            );
        }
        allowed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_tenant() -> Tenant {
        serde_json::from_value(serde_json::json!({
            "status": {
                "childnamespaces": ["vcluster-blue-slurm"],
                "tenantresources": [
                    {
                        "type": "compute",
                        "xnames": ["x0c3s5b0n0", "x0c3s6b0n0"],
                        "hsmpartitionname": "blue",
                    },
                    {
                        "type": "application",
                        "xnames": ["x0c3s7b0n0"],
                    },
                ],
                "uuid": "550e8400-e29b-41d4-a716-446655440000",
            }
        }))
        .unwrap()
    }

    #[test]
    fn allows_node_in_any_resource() {
        let tenant = sample_tenant();
        assert!(tenant_allows(&tenant, "x0c3s5b0n0"));
        assert!(tenant_allows(&tenant, "x0c3s7b0n0"));
    }

    #[test]
    fn denies_unlisted_node() {
        let tenant = sample_tenant();
        assert!(!tenant_allows(&tenant, "x1c0s0b0n0"));
    }

    #[test]
    fn tolerates_sparse_payloads() {
        let tenant: Tenant = serde_json::from_value(serde_json::json!({}))
            .unwrap();
        assert!(!tenant_allows(&tenant, "x0c3s5b0n0"));

        let tenant: Tenant = serde_json::from_value(serde_json::json!({
            "status": { "tenantresources": [{ "type": "compute" }] }
        }))
        .unwrap();
        assert!(!tenant_allows(&tenant, "x0c3s5b0n0"));
    }
}
