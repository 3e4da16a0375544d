// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Node inventory sourced from the Hardware State Manager (HSM).
//!
//! The inventory adapter joins HSM's redfish-endpoints collection against
//! its state-components collection to produce the set of nodes whose
//! consoles the fleet must monitor. An error (or an empty result) means
//! "no information", never "all nodes gone" — callers must not treat it
//! as a removal of the whole population.

use crate::error::InventoryError;
use async_trait::async_trait;
use serde::de::Deserializer;
use serde::ser::Serializer;
use serde::{Deserialize, Serialize};
use slog::{info, o, warn, Logger};
use std::collections::HashMap;
use std::fmt;
use std::time::Duration;

/// Hardware cabinet family for a node.
///
/// Hill cabinets are a small variant of Mountain and are budgeted
/// identically, so `is_mountain_like` treats the two as one family.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum HardwareClass {
    Mountain,
    Hill,
    River,
    Other(String),
}

impl HardwareClass {
    pub fn as_str(&self) -> &str {
        match self {
            HardwareClass::Mountain => "Mountain",
            HardwareClass::Hill => "Hill",
            HardwareClass::River => "River",
            HardwareClass::Other(s) => s,
        }
    }
}

impl From<&str> for HardwareClass {
    fn from(s: &str) -> Self {
        match s {
            "Mountain" => HardwareClass::Mountain,
            "Hill" => HardwareClass::Hill,
            "River" => HardwareClass::River,
            other => HardwareClass::Other(other.to_string()),
        }
    }
}

impl fmt::Display for HardwareClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Serialize for HardwareClass {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for HardwareClass {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Ok(HardwareClass::from(s.as_str()))
    }
}

/// Everything needed to form a console connection to one node.
///
/// This is the unit of inventory exchanged with the console-data service;
/// the wire field names are part of that service's contract.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct NodeRecord {
    /// node xname; the system-wide node identifier
    #[serde(rename = "NodeName")]
    pub node_id: String,
    /// bmc xname, the node id with the trailing `n<digits>` stripped
    #[serde(rename = "BmcName")]
    pub bmc_id: String,
    #[serde(rename = "BmcFqdn")]
    pub bmc_fqdn: String,
    #[serde(rename = "Class")]
    pub hardware_class: HardwareClass,
    /// NID value is only valid if role is "Compute"
    #[serde(rename = "NID")]
    pub nid: i64,
    #[serde(rename = "Role")]
    pub role: String,
}

impl NodeRecord {
    pub fn is_mountain_like(&self) -> bool {
        matches!(
            self.hardware_class,
            HardwareClass::Mountain | HardwareClass::Hill
        )
    }

    pub fn is_river(&self) -> bool {
        matches!(self.hardware_class, HardwareClass::River)
    }
}

impl fmt::Display for NodeRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "NodeName:{}, BmcName:{}, BmcFqdn:{}, Class:{}, NID:{}, Role:{}",
            self.node_id,
            self.bmc_id,
            self.bmc_fqdn,
            self.hardware_class,
            self.nid,
            self.role
        )
    }
}

/// Derive the BMC xname from a node xname by truncating at the last `n`
/// segment. Node ids that contain no `n` (or nothing before it) have no
/// addressable BMC and yield `None`.
pub(crate) fn bmc_id_for(node_id: &str) -> Option<&str> {
    match node_id.rfind('n') {
        Some(0) | None => None,
        Some(pos) => Some(&node_id[..pos]),
    }
}

#[derive(Clone, Debug, Deserialize)]
pub(crate) struct RedfishEndpoint {
    #[serde(rename = "ID")]
    pub id: String,
    #[serde(rename = "FQDN", default)]
    pub fqdn: String,
}

#[derive(Clone, Debug, Deserialize)]
pub(crate) struct StateComponent {
    #[serde(rename = "ID")]
    pub id: String,
    #[serde(rename = "Type")]
    pub component_type: String,
    #[serde(rename = "Class", default)]
    pub class: Option<String>,
    // NID is only populated for components with Role="Compute"
    #[serde(rename = "NID", default)]
    pub nid: Option<i64>,
    #[serde(rename = "Role", default)]
    pub role: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RedfishEndpointsResponse {
    #[serde(rename = "RedfishEndpoints")]
    redfish_endpoints: Vec<RedfishEndpoint>,
}

#[derive(Debug, Deserialize)]
struct StateComponentsResponse {
    #[serde(rename = "Components")]
    components: Vec<StateComponent>,
}

/// Join the two HSM collections into NodeRecords.
///
/// Components whose BMC is absent from the endpoint index (or whose id
/// has no BMC segment at all) are logged and skipped.
pub(crate) fn join_inventory(
    endpoints: Vec<RedfishEndpoint>,
    components: Vec<StateComponent>,
    log: &Logger,
) -> Vec<NodeRecord> {
    let endpoint_index: HashMap<&str, &RedfishEndpoint> =
        endpoints.iter().map(|rf| (rf.id.as_str(), rf)).collect();

    let mut nodes = Vec::new();
    for sc in &components {
        if sc.component_type != "Node" {
            continue;
        }
        let Some(bmc_id) = bmc_id_for(&sc.id) else {
            warn!(
                log, "node id carries no BMC segment; skipping";
                "node_id" => &sc.id,
            );
            continue;
        };
        let Some(rf) = endpoint_index.get(bmc_id) else {
            info!(
                log, "node with no BMC present";
                "node_id" => &sc.id,
                "bmc_id" => bmc_id,
            );
            continue;
        };
        nodes.push(NodeRecord {
            node_id: sc.id.clone(),
            bmc_id: bmc_id.to_string(),
            bmc_fqdn: rf.fqdn.clone(),
            hardware_class: HardwareClass::from(
                sc.class.as_deref().unwrap_or(""),
            ),
            nid: sc.nid.unwrap_or(0),
            role: sc.role.clone().unwrap_or_default(),
        });
    }
    nodes
}

/// Capability interface over the hardware inventory, for the reconciler.
#[async_trait]
pub trait NodeInventory: Send + Sync {
    async fn fetch_nodes(&self) -> Result<Vec<NodeRecord>, InventoryError>;
}

/// HSM client implementing [`NodeInventory`].
#[derive(Clone)]
pub struct HsmClient {
    client: reqwest::Client,
    base_url: String,
    log: Logger,
}

impl HsmClient {
    pub fn new(base_url: &str, log: &Logger) -> Self {
        let client = reqwest::ClientBuilder::new()
            .connect_timeout(Duration::from_secs(15))
            .timeout(Duration::from_secs(60))
            .build()
            .expect("Failed to build HTTP client");
        Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            log: log.new(o!("component" => "hsm")),
        }
    }

    async fn get_redfish_endpoints(
        &self,
    ) -> Result<Vec<RedfishEndpoint>, InventoryError> {
        let url = format!("{}/hsm/v1/Inventory/RedfishEndpoints", self.base_url);
        let resp: RedfishEndpointsResponse = self
            .client
            .get(&url)
            .send()
            .await
            .and_then(|r| r.error_for_status())
            .map_err(|err| InventoryError::Unavailable {
                collection: "redfish-endpoints",
                err,
            })?
            .json()
            .await
            .map_err(|err| InventoryError::Unavailable {
                collection: "redfish-endpoints",
                err,
            })?;
        Ok(resp.redfish_endpoints)
    }

    async fn get_state_components(
        &self,
    ) -> Result<Vec<StateComponent>, InventoryError> {
        let url = format!("{}/hsm/v1/State/Components", self.base_url);
        let resp: StateComponentsResponse = self
            .client
            .get(&url)
            .send()
            .await
            .and_then(|r| r.error_for_status())
            .map_err(|err| InventoryError::Unavailable {
                collection: "state-components",
                err,
            })?
            .json()
            .await
            .map_err(|err| InventoryError::Unavailable {
                collection: "state-components",
                err,
            })?;
        Ok(resp.components)
    }
}

#[async_trait]
impl NodeInventory for HsmClient {
    async fn fetch_nodes(&self) -> Result<Vec<NodeRecord>, InventoryError> {
        let endpoints = self.get_redfish_endpoints().await?;
        let components = self.get_state_components().await?;
        Ok(join_inventory(endpoints, components, &self.log))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_logger() -> Logger {
        Logger::root(slog::Discard, o!())
    }

    #[test]
    fn bmc_derivation() {
        assert_eq!(bmc_id_for("x3000c0s19b1n0"), Some("x3000c0s19b1"));
        assert_eq!(bmc_id_for("x1c0s0b0n3"), Some("x1c0s0b0"));
        // multiple 'n's: only the last one is the node segment
        assert_eq!(bmc_id_for("xn0c0s0b0n1"), Some("xn0c0s0b0"));
        // no node segment at all
        assert_eq!(bmc_id_for("x3000c0"), None);
        assert_eq!(bmc_id_for("n0"), None);
        assert_eq!(bmc_id_for(""), None);
    }

    #[test]
    fn class_round_trip() {
        for (s, class) in [
            ("Mountain", HardwareClass::Mountain),
            ("Hill", HardwareClass::Hill),
            ("River", HardwareClass::River),
            ("Paddock", HardwareClass::Other("Paddock".to_string())),
        ] {
            assert_eq!(HardwareClass::from(s), class);
            assert_eq!(class.as_str(), s);
        }
    }

    #[test]
    fn join_skips_components_without_endpoints() {
        let endpoints = vec![
            RedfishEndpoint {
                id: "x1c0s0b0".to_string(),
                fqdn: "x1c0s0b0.local".to_string(),
            },
            RedfishEndpoint {
                id: "x9000c1s0b0".to_string(),
                fqdn: "x9000c1s0b0.local".to_string(),
            },
        ];
        let components = vec![
            StateComponent {
                id: "x1c0s0b0n0".to_string(),
                component_type: "Node".to_string(),
                class: Some("River".to_string()),
                nid: Some(1),
                role: Some("Compute".to_string()),
            },
            StateComponent {
                id: "x9000c1s0b0n0".to_string(),
                component_type: "Node".to_string(),
                class: Some("Mountain".to_string()),
                nid: Some(2),
                role: Some("Compute".to_string()),
            },
            // BMC missing from the endpoint collection
            StateComponent {
                id: "x2c0s0b0n0".to_string(),
                component_type: "Node".to_string(),
                class: Some("River".to_string()),
                nid: Some(3),
                role: Some("Compute".to_string()),
            },
            // not a node
            StateComponent {
                id: "x1c0s0b0".to_string(),
                component_type: "NodeBMC".to_string(),
                class: None,
                nid: None,
                role: None,
            },
            // no BMC segment in the id
            StateComponent {
                id: "x2c0".to_string(),
                component_type: "Node".to_string(),
                class: Some("River".to_string()),
                nid: None,
                role: None,
            },
        ];

        let nodes = join_inventory(endpoints, components, &test_logger());
        assert_eq!(nodes.len(), 2);
        assert_eq!(nodes[0].node_id, "x1c0s0b0n0");
        assert_eq!(nodes[0].bmc_id, "x1c0s0b0");
        assert_eq!(nodes[0].bmc_fqdn, "x1c0s0b0.local");
        assert!(nodes[0].is_river());
        assert_eq!(nodes[1].node_id, "x9000c1s0b0n0");
        assert!(nodes[1].is_mountain_like());
    }

    #[test]
    fn node_record_wire_format() {
        let node = NodeRecord {
            node_id: "x1c0s0b0n0".to_string(),
            bmc_id: "x1c0s0b0".to_string(),
            bmc_fqdn: "x1c0s0b0.local".to_string(),
            hardware_class: HardwareClass::Hill,
            nid: 17,
            role: "Compute".to_string(),
        };
        let json = serde_json::to_value(&node).unwrap();
        assert_eq!(
            json,
            serde_json::json!({
                "NodeName": "x1c0s0b0n0",
                "BmcName": "x1c0s0b0",
                "BmcFqdn": "x1c0s0b0.local",
                "Class": "Hill",
                "NID": 17,
                "Role": "Compute",
            })
        );
        let back: NodeRecord = serde_json::from_value(json).unwrap();
        assert_eq!(back, node);
    }
}
