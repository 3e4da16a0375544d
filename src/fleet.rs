// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Fleet state: the cached node population, worker-pool sizing, and the
//! reconciler's retry latches.
//!
//! This is the single owning component for all mutable control-plane
//! state. The hardware reconciler is the only writer of the node cache
//! and sizing values; the HTTP surface mutates only the configured maxima
//! (`PATCH /maxNodesPerPod`) and the debug cache wipe, both routed through
//! methods here. Readers take the lock briefly and tolerate mildly stale
//! snapshots.

use crate::inventory::NodeRecord;
use camino::Utf8Path;
use chrono::{DateTime, Utc};
use slog::{info, warn, Logger};
use std::collections::{HashMap, HashSet};

/// Number of completed reconcile ticks between forced full resyncs.
const FORCE_RESYNC_INTERVAL: i32 = 10;

/// Result of folding a fresh inventory into the cache.
#[derive(Debug, Default)]
pub struct InventoryDelta {
    /// Nodes that appeared since the last tick (already inserted).
    pub additions: Vec<NodeRecord>,
    /// Nodes that disappeared since the last tick (already removed).
    pub removals: Vec<NodeRecord>,
    /// Mountain-like subset of the additions, for key staging.
    pub new_mountain: Vec<NodeRecord>,
    /// Mountain-like population of the post-update cache.
    pub mountain_count: usize,
    /// River population of the post-update cache.
    pub river_count: usize,
}

/// Desired worker pool shape for a given node population.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FleetSizing {
    pub worker_count: i64,
    pub mtn_budget: i64,
    pub rvr_budget: i64,
}

/// Compute the worker count and per-worker budgets for `mountain` and
/// `river` nodes under the given per-worker maxima.
///
/// Returns `None` when the population is empty: an empty (or unreported)
/// inventory must never shrink the replica count. The `+ 1` padding on
/// both the worker count and the budgets covers exact multiples of the
/// maxima and small burst growth.
pub fn size_fleet(
    mountain: usize,
    river: usize,
    max_mtn: i64,
    max_rvr: i64,
) -> Option<FleetSizing> {
    if mountain + river == 0 {
        return None;
    }

    // guard the divisors against a zero-configured maximum
    let max_mtn = max_mtn.max(1) as u64;
    let max_rvr = max_rvr.max(1) as u64;

    let workers_m = (mountain as u64).div_ceil(max_mtn) + 1;
    let workers_r = (river as u64).div_ceil(max_rvr) + 1;
    let workers = workers_m.max(workers_r);

    let mtn_budget = (mountain as u64).div_ceil(workers) + 1;
    let rvr_budget = (river as u64).div_ceil(workers) + 1;

    Some(FleetSizing {
        worker_count: workers as i64,
        mtn_budget: mtn_budget as i64,
        rvr_budget: rvr_budget as i64,
    })
}

/// Clamp a requested per-worker maximum into `[num_min, num_max]`.
///
/// Returns the stored value and whether the request was already in range.
pub fn clamp_max_nodes(num_ask: i64, num_min: i64, num_max: i64) -> (i64, bool) {
    if num_ask < num_min {
        (num_min, false)
    } else if num_ask > num_max {
        (num_max, false)
    } else {
        (num_ask, true)
    }
}

pub struct FleetState {
    /// The node cache: node id -> record. Sole writer is the reconciler.
    nodes: HashMap<String, NodeRecord>,
    /// Desired worker replicas; recorded only after a successful resize.
    pub worker_count: Option<i64>,
    /// Last successfully published per-worker budgets.
    pub mtn_budget_per_worker: Option<i64>,
    pub rvr_budget_per_worker: Option<i64>,
    /// Configured per-worker maxima; mutable via the debug PATCH endpoint.
    pub max_mtn_per_worker: i64,
    pub max_rvr_per_worker: i64,
    /// Time of the last hardware-reconcile attempt.
    pub last_reconcile_time: Option<DateTime<Utc>>,
    /// 0 means "resend the full inventory on the next tick".
    pub force_full_resync_countdown: i32,
    /// Set when mountain key staging failed; forces a full key resweep.
    pub needs_mountain_key_redeploy: bool,
}

impl FleetState {
    pub fn new(max_mtn_per_worker: i64, max_rvr_per_worker: i64) -> Self {
        Self {
            nodes: HashMap::new(),
            worker_count: None,
            mtn_budget_per_worker: None,
            rvr_budget_per_worker: None,
            max_mtn_per_worker,
            max_rvr_per_worker,
            // start at zero so the first tick pushes the whole inventory
            force_full_resync_countdown: 0,
            needs_mountain_key_redeploy: false,
            last_reconcile_time: None,
        }
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn contains_node(&self, node_id: &str) -> bool {
        self.nodes.contains_key(node_id)
    }

    pub fn node_ids(&self) -> Vec<String> {
        self.nodes.keys().cloned().collect()
    }

    pub fn all_nodes(&self) -> Vec<NodeRecord> {
        self.nodes.values().cloned().collect()
    }

    pub fn mountain_nodes(&self) -> Vec<NodeRecord> {
        self.nodes.values().filter(|n| n.is_mountain_like()).cloned().collect()
    }

    /// Remove and return every cached node (the debug `clearData` path).
    pub fn drain_all(&mut self) -> Vec<NodeRecord> {
        self.nodes.drain().map(|(_, v)| v).collect()
    }

    /// Fold a fresh inventory into the cache, returning the delta and the
    /// post-update class counts. Nodes of an unknown class are kept in the
    /// cache (they remain valid console targets) but excluded from both
    /// counts.
    pub fn apply_inventory(
        &mut self,
        current: Vec<NodeRecord>,
        log: &Logger,
    ) -> InventoryDelta {
        let mut delta = InventoryDelta::default();

        let current_ids: HashSet<String> =
            current.iter().map(|n| n.node_id.clone()).collect();

        for node in current {
            if !self.nodes.contains_key(&node.node_id) {
                info!(log, "found new node"; "node" => %node);
                if node.is_mountain_like() {
                    delta.new_mountain.push(node.clone());
                }
                delta.additions.push(node.clone());
                self.nodes.insert(node.node_id.clone(), node);
            }
        }

        delta.removals = self
            .nodes
            .values()
            .filter(|v| !current_ids.contains(&v.node_id))
            .cloned()
            .collect();
        for removed in &delta.removals {
            info!(log, "removing node"; "node_id" => &removed.node_id);
            self.nodes.remove(&removed.node_id);
        }

        for node in self.nodes.values() {
            if node.is_mountain_like() {
                delta.mountain_count += 1;
            } else if node.is_river() {
                delta.river_count += 1;
            } else {
                warn!(
                    log, "unknown node class";
                    "class" => node.hardware_class.as_str(),
                    "node_id" => &node.node_id,
                );
            }
        }

        delta
    }

    /// Count down toward the next forced full resync. Called once per
    /// completed reconcile tick, before any failure overrides.
    pub fn advance_resync_countdown(&mut self) {
        self.force_full_resync_countdown -= 1;
        if self.force_full_resync_countdown < 0 {
            self.force_full_resync_countdown = FORCE_RESYNC_INTERVAL;
        }
    }
}

/// Serialize the per-worker budgets into the shared-volume file the
/// workers poll. Exactly two lines; overwrites are idempotent.
pub async fn write_budget_file(
    path: &Utf8Path,
    sizing: &FleetSizing,
) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    let contents =
        format!("River:{}\nMountain:{}\n", sizing.rvr_budget, sizing.mtn_budget);
    tokio::fs::write(path, contents).await
}

/// Parse a budget file back into its `(river, mountain)` pair. `None` for
/// anything that is not exactly the two expected lines.
pub fn parse_budget_file(contents: &str) -> Option<(i64, i64)> {
    let mut lines = contents.lines();
    let river = lines.next()?.strip_prefix("River:")?.parse().ok()?;
    let mountain = lines.next()?.strip_prefix("Mountain:")?.parse().ok()?;
    if lines.next().is_some() {
        return None;
    }
    Some((river, mountain))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::inventory::HardwareClass;
    use slog::o;

    fn test_logger() -> Logger {
        Logger::root(slog::Discard, o!())
    }

    fn node(id: &str, class: HardwareClass) -> NodeRecord {
        NodeRecord {
            node_id: id.to_string(),
            bmc_id: crate::inventory::bmc_id_for(id).unwrap_or(id).to_string(),
            bmc_fqdn: format!("{id}.local"),
            hardware_class: class,
            nid: 0,
            role: "Compute".to_string(),
        }
    }

    #[test]
    fn sizing_empty_population() {
        assert_eq!(size_fleet(0, 0, 750, 2000), None);
    }

    #[test]
    fn sizing_single_mountain_node() {
        let sizing = size_fleet(1, 0, 5, 2000).unwrap();
        assert_eq!(sizing.worker_count, 2);
        assert_eq!(sizing.mtn_budget, 2);
        assert_eq!(sizing.rvr_budget, 1);
    }

    #[test]
    fn sizing_large_river_system() {
        let sizing = size_fleet(0, 1600, 750, 2000).unwrap();
        assert_eq!(sizing.worker_count, 2);
        assert_eq!(sizing.rvr_budget, 801);
        assert_eq!(sizing.mtn_budget, 1);
    }

    #[test]
    fn sizing_exact_multiple_gets_headroom() {
        // 4000 river at 2000/worker: 2 needed, padded to 3
        let sizing = size_fleet(0, 4000, 750, 2000).unwrap();
        assert_eq!(sizing.worker_count, 3);
    }

    #[test]
    fn sizing_zero_maximum_does_not_divide_by_zero() {
        let sizing = size_fleet(10, 0, 0, 0).unwrap();
        assert_eq!(sizing.worker_count, 11);
    }

    #[test]
    fn sizing_invariant_holds() {
        for (m, r) in [(1, 0), (0, 1), (7, 3000), (750, 2000), (1501, 4001)] {
            let (max_m, max_r) = (750, 2000);
            let sizing = size_fleet(m, r, max_m, max_r).unwrap();
            let floor = ((m as u64).div_ceil(max_m as u64))
                .max((r as u64).div_ceil(max_r as u64))
                + 1;
            assert!(
                sizing.worker_count as u64 >= floor,
                "workers {} below floor {floor} for m={m} r={r}",
                sizing.worker_count,
            );
            assert!(sizing.mtn_budget >= 1);
            assert!(sizing.rvr_budget >= 1);
        }
    }

    #[test]
    fn clamp_max_nodes_bounds() {
        assert_eq!(clamp_max_nodes(10000, 2, 750), (750, false));
        assert_eq!(clamp_max_nodes(1, 2, 2000), (2, false));
        assert_eq!(clamp_max_nodes(500, 2, 750), (500, true));
    }

    #[test]
    fn apply_inventory_add_then_remove_round_trips() {
        let log = test_logger();
        let mut fleet = FleetState::new(750, 2000);
        let a = node("x1c0s0b0n0", HardwareClass::River);
        let b = node("x9000c1s0b0n0", HardwareClass::Mountain);

        let delta = fleet.apply_inventory(vec![a.clone(), b.clone()], &log);
        assert_eq!(delta.additions.len(), 2);
        assert!(delta.removals.is_empty());
        assert_eq!(delta.new_mountain, vec![b.clone()]);
        assert_eq!(delta.mountain_count, 1);
        assert_eq!(delta.river_count, 1);
        assert_eq!(fleet.len(), 2);

        // unchanged inventory: no delta
        let delta = fleet.apply_inventory(vec![a.clone(), b.clone()], &log);
        assert!(delta.additions.is_empty());
        assert!(delta.removals.is_empty());

        // remove both: payload element-wise equal to what went in
        let delta = fleet.apply_inventory(vec![a.clone()], &log);
        assert!(delta.additions.is_empty());
        assert_eq!(delta.removals, vec![b]);
        let delta = fleet.apply_inventory(vec![], &log);
        assert_eq!(delta.removals, vec![a]);
        assert!(fleet.is_empty());
    }

    #[test]
    fn unknown_class_kept_in_cache_but_uncounted() {
        let log = test_logger();
        let mut fleet = FleetState::new(750, 2000);
        let odd = node("x5c0s0b0n0", HardwareClass::Other("Foothill".into()));
        let delta = fleet.apply_inventory(vec![odd], &log);
        assert_eq!(delta.mountain_count, 0);
        assert_eq!(delta.river_count, 0);
        assert!(fleet.contains_node("x5c0s0b0n0"));
    }

    #[test]
    fn resync_countdown_cycles() {
        let mut fleet = FleetState::new(750, 2000);
        assert_eq!(fleet.force_full_resync_countdown, 0);
        fleet.advance_resync_countdown();
        assert_eq!(fleet.force_full_resync_countdown, 10);
        for expected in (0..10).rev() {
            fleet.advance_resync_countdown();
            assert_eq!(fleet.force_full_resync_countdown, expected);
        }
        fleet.advance_resync_countdown();
        assert_eq!(fleet.force_full_resync_countdown, 10);
    }

    #[tokio::test]
    async fn budget_file_round_trips() {
        let dir = camino_tempfile::tempdir().unwrap();
        let path = dir.path().join("console/TargetNodes.txt");
        let sizing =
            FleetSizing { worker_count: 2, mtn_budget: 1, rvr_budget: 801 };
        write_budget_file(&path, &sizing).await.unwrap();

        let contents = tokio::fs::read_to_string(&path).await.unwrap();
        assert_eq!(contents, "River:801\nMountain:1\n");
        assert_eq!(parse_budget_file(&contents), Some((801, 1)));

        // overwrite is idempotent
        write_budget_file(&path, &sizing).await.unwrap();
        let contents = tokio::fs::read_to_string(&path).await.unwrap();
        assert_eq!(parse_budget_file(&contents), Some((801, 1)));
    }

    #[test]
    fn budget_parse_rejects_malformed() {
        assert_eq!(parse_budget_file(""), None);
        assert_eq!(parse_budget_file("River:1\n"), None);
        assert_eq!(parse_budget_file("Mountain:1\nRiver:2\n"), None);
        assert_eq!(parse_budget_file("River:1\nMountain:2\nextra\n"), None);
        assert_eq!(parse_budget_file("River:x\nMountain:2\n"), None);
    }
}
