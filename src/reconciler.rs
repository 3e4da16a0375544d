// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The hardware-reconciliation control loop and the heartbeat reaper.
//!
//! Each tick diffs the HSM inventory against the cached node population,
//! pushes the delta to console-data, recomputes the worker-pool size and
//! per-worker budgets, and ensures console keys are staged on new
//! mountain-class nodes. Remote failures never abort the loop: they
//! adjust the resync latches and the next tick retries.

use crate::background::BackgroundTask;
use crate::console_data::StateStore;
use crate::fleet::{size_fleet, write_budget_file, FleetState};
use crate::inventory::NodeInventory;
use crate::keys::KeyStager;
use crate::worker_set::ClusterControl;
use camino::Utf8PathBuf;
use chrono::Utc;
use futures::future::BoxFuture;
use futures::FutureExt;
use slog::{debug, info, warn, Logger};
use slog_error_chain::InlineErrorChain;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::RwLock;

pub struct HardwareReconciler<I, D, C, K> {
    fleet: Arc<RwLock<FleetState>>,
    suspended: Arc<AtomicBool>,
    inventory: I,
    store: D,
    cluster: C,
    keys: K,
    budget_file: Utf8PathBuf,
    log: Logger,
}

impl<I, D, C, K> HardwareReconciler<I, D, C, K>
where
    I: NodeInventory,
    D: StateStore,
    C: ClusterControl,
    K: KeyStager,
{
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        fleet: Arc<RwLock<FleetState>>,
        suspended: Arc<AtomicBool>,
        inventory: I,
        store: D,
        cluster: C,
        keys: K,
        budget_file: Utf8PathBuf,
        log: Logger,
    ) -> Self {
        Self {
            fleet,
            suspended,
            inventory,
            store,
            cluster,
            keys,
            budget_file,
            log,
        }
    }

    /// One full pass of the control loop.
    pub(crate) async fn reconcile_tick(&self) {
        // record the attempt time whether or not the tick gets anywhere
        self.fleet.write().await.last_reconcile_time = Some(Utc::now());

        let current = match self.inventory.fetch_nodes().await {
            Ok(nodes) if nodes.is_empty() => {
                // an empty population is indistinguishable from an
                // unpopulated HSM; treat it as no information
                warn!(self.log, "inventory returned no nodes; skipping tick");
                return;
            }
            Ok(nodes) => nodes,
            Err(err) => {
                warn!(
                    self.log, "unable to fetch node inventory";
                    InlineErrorChain::new(&err),
                );
                return;
            }
        };

        let (delta, max_mtn, max_rvr) = {
            let mut fleet = self.fleet.write().await;
            let mut delta = fleet.apply_inventory(current, &self.log);
            if fleet.force_full_resync_countdown == 0 {
                info!(
                    self.log, "forcing inventory update of all nodes";
                    "count" => fleet.len(),
                );
                delta.additions = fleet.all_nodes();
            }
            if fleet.needs_mountain_key_redeploy {
                info!(self.log, "forcing update of all mountain console keys");
                delta.new_mountain = fleet.mountain_nodes();
            }
            (delta, fleet.max_mtn_per_worker, fleet.max_rvr_per_worker)
        };

        let ok_add = if delta.additions.is_empty() {
            debug!(self.log, "no new nodes to add");
            true
        } else {
            self.store.register_nodes(&delta.additions).await
        };
        if delta.removals.is_empty() {
            debug!(self.log, "no nodes being removed");
        } else {
            self.store.deregister_nodes(&delta.removals).await;
        }

        // size the pool every tick, in case something else changed the
        // deployed replica count out from under us
        self.resize_fleet(
            delta.mountain_count,
            delta.river_count,
            max_mtn,
            max_rvr,
        )
        .await;

        // key staging runs last so new workers can begin acquiring nodes
        // while staging (which can be slow) is still in flight
        let key_ok = if delta.new_mountain.is_empty() {
            true
        } else {
            self.keys.stage(&delta.new_mountain).await
        };

        let mut fleet = self.fleet.write().await;
        fleet.advance_resync_countdown();
        if !ok_add {
            warn!(
                self.log,
                "inventory update to console-data failed; forcing full resync",
            );
            fleet.force_full_resync_countdown = 0;
        }
        if key_ok {
            fleet.needs_mountain_key_redeploy = false;
        } else {
            warn!(
                self.log,
                "mountain key staging failed; forcing full key resweep",
            );
            fleet.needs_mountain_key_redeploy = true;
            fleet.force_full_resync_countdown = 0;
        }
    }

    async fn resize_fleet(
        &self,
        mountain: usize,
        river: usize,
        max_mtn: i64,
        max_rvr: i64,
    ) {
        info!(
            self.log, "node population";
            "mountain" => mountain,
            "river" => river,
            "max_mtn_per_worker" => max_mtn,
            "max_rvr_per_worker" => max_rvr,
        );
        let Some(sizing) = size_fleet(mountain, river, max_mtn, max_rvr)
        else {
            // refuse to touch the replica count on an empty population
            info!(self.log, "no nodes found, skipping fleet sizing");
            return;
        };

        if let Err(err) =
            self.cluster.set_worker_replicas(sizing.worker_count as i32).await
        {
            // leave worker_count unrecorded; the next tick retries
            warn!(
                self.log, "unable to resize worker set";
                InlineErrorChain::new(&err),
            );
            return;
        }

        let publish = {
            let mut fleet = self.fleet.write().await;
            fleet.worker_count = Some(sizing.worker_count);
            (fleet.mtn_budget_per_worker, fleet.rvr_budget_per_worker)
                != (Some(sizing.mtn_budget), Some(sizing.rvr_budget))
        };
        if publish {
            info!(
                self.log, "publishing new per-worker budgets";
                "mtn" => sizing.mtn_budget,
                "rvr" => sizing.rvr_budget,
            );
            match write_budget_file(&self.budget_file, &sizing).await {
                Ok(()) => {
                    let mut fleet = self.fleet.write().await;
                    fleet.mtn_budget_per_worker = Some(sizing.mtn_budget);
                    fleet.rvr_budget_per_worker = Some(sizing.rvr_budget);
                }
                Err(err) => {
                    // stored budgets stay stale, so the next tick rewrites
                    warn!(
                        self.log, "unable to write budget file";
                        "path" => self.budget_file.as_str(),
                        InlineErrorChain::new(&err),
                    );
                }
            }
        }
    }
}

impl<I, D, C, K> BackgroundTask for HardwareReconciler<I, D, C, K>
where
    I: NodeInventory,
    D: StateStore,
    C: ClusterControl,
    K: KeyStager,
{
    fn activate(&mut self) -> BoxFuture<'_, ()> {
        async move {
            if self.suspended.load(Ordering::SeqCst) {
                debug!(self.log, "updates suspended; skipping reconcile");
                return;
            }
            self.reconcile_tick().await;
        }
        .boxed()
    }
}

/// Periodically asks console-data to evict node claims whose worker has
/// stopped heartbeating.
pub struct HeartbeatReaper<D> {
    store: D,
    stale_minutes: u64,
    log: Logger,
}

impl<D: StateStore> HeartbeatReaper<D> {
    pub fn new(store: D, stale_minutes: u64, log: Logger) -> Self {
        Self { store, stale_minutes, log }
    }
}

impl<D: StateStore> BackgroundTask for HeartbeatReaper<D> {
    fn activate(&mut self) -> BoxFuture<'_, ()> {
        async move {
            debug!(self.log, "checking for stale heartbeats");
            if let Err(err) = self.store.reap_stale(self.stale_minutes).await {
                warn!(
                    self.log, "error clearing stale heartbeats";
                    InlineErrorChain::new(&err),
                );
            }
        }
        .boxed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{ClusterError, InventoryError, StateStoreError};
    use crate::inventory::{HardwareClass, NodeRecord};
    use async_trait::async_trait;
    use slog::o;
    use std::collections::VecDeque;
    use std::sync::Mutex;

    fn test_logger() -> Logger {
        Logger::root(slog::Discard, o!())
    }

    fn node(id: &str, class: HardwareClass) -> NodeRecord {
        NodeRecord {
            node_id: id.to_string(),
            bmc_id: crate::inventory::bmc_id_for(id)
                .unwrap_or(id)
                .to_string(),
            bmc_fqdn: format!("{id}.local"),
            hardware_class: class,
            nid: 0,
            role: "Compute".to_string(),
        }
    }

    fn transport_error() -> reqwest::Error {
        // an URL with no host fails at request build time
        reqwest::Client::new().get("http://").build().unwrap_err()
    }

    fn sorted_ids(nodes: &[NodeRecord]) -> Vec<String> {
        let mut ids: Vec<String> =
            nodes.iter().map(|n| n.node_id.clone()).collect();
        ids.sort();
        ids
    }

    enum FetchResult {
        Nodes(Vec<NodeRecord>),
        Fail,
    }

    #[derive(Clone, Default)]
    struct MockInventory {
        script: Arc<Mutex<VecDeque<FetchResult>>>,
    }

    impl MockInventory {
        fn push(&self, result: FetchResult) {
            self.script.lock().unwrap().push_back(result);
        }
    }

    #[async_trait]
    impl NodeInventory for MockInventory {
        async fn fetch_nodes(
            &self,
        ) -> Result<Vec<NodeRecord>, InventoryError> {
            match self.script.lock().unwrap().pop_front() {
                Some(FetchResult::Nodes(nodes)) => Ok(nodes),
                Some(FetchResult::Fail) => Err(InventoryError::Unavailable {
                    collection: "state-components",
                    err: transport_error(),
                }),
                None => Ok(Vec::new()),
            }
        }
    }

    #[derive(Clone, Default)]
    struct MockStore {
        registered: Arc<Mutex<Vec<Vec<String>>>>,
        deregistered: Arc<Mutex<Vec<Vec<String>>>>,
        reaped: Arc<Mutex<Vec<u64>>>,
        fail_register: Arc<AtomicBool>,
    }

    #[async_trait]
    impl StateStore for MockStore {
        async fn register_nodes(&self, nodes: &[NodeRecord]) -> bool {
            self.registered.lock().unwrap().push(sorted_ids(nodes));
            !self.fail_register.load(Ordering::SeqCst)
        }

        async fn deregister_nodes(&self, nodes: &[NodeRecord]) {
            self.deregistered.lock().unwrap().push(sorted_ids(nodes));
        }

        async fn lookup_worker(
            &self,
            node_id: &str,
        ) -> Result<String, StateStoreError> {
            Err(StateStoreError::NotMonitored(node_id.to_string()))
        }

        async fn reap_stale(
            &self,
            minutes: u64,
        ) -> Result<(), StateStoreError> {
            self.reaped.lock().unwrap().push(minutes);
            Ok(())
        }
    }

    #[derive(Clone, Default)]
    struct MockCluster {
        calls: Arc<Mutex<Vec<i32>>>,
        fail: Arc<AtomicBool>,
    }

    #[async_trait]
    impl ClusterControl for MockCluster {
        async fn set_worker_replicas(
            &self,
            replicas: i32,
        ) -> Result<(), ClusterError> {
            self.calls.lock().unwrap().push(replicas);
            if self.fail.load(Ordering::SeqCst) {
                Err(ClusterError::WorkloadNotFound {
                    name: "cray-console-node".to_string(),
                    namespace: "services".to_string(),
                })
            } else {
                Ok(())
            }
        }
    }

    #[derive(Clone, Default)]
    struct MockKeys {
        staged: Arc<Mutex<Vec<Vec<String>>>>,
        fail: Arc<AtomicBool>,
    }

    #[async_trait]
    impl KeyStager for MockKeys {
        async fn stage(&self, nodes: &[NodeRecord]) -> bool {
            self.staged.lock().unwrap().push(sorted_ids(nodes));
            !self.fail.load(Ordering::SeqCst)
        }
    }

    struct Harness {
        reconciler:
            HardwareReconciler<MockInventory, MockStore, MockCluster, MockKeys>,
        fleet: Arc<RwLock<FleetState>>,
        suspended: Arc<AtomicBool>,
        inventory: MockInventory,
        store: MockStore,
        cluster: MockCluster,
        keys: MockKeys,
        _dir: camino_tempfile::Utf8TempDir,
        budget_file: Utf8PathBuf,
    }

    fn harness(max_mtn: i64, max_rvr: i64) -> Harness {
        let fleet = Arc::new(RwLock::new(FleetState::new(max_mtn, max_rvr)));
        let suspended = Arc::new(AtomicBool::new(false));
        let inventory = MockInventory::default();
        let store = MockStore::default();
        let cluster = MockCluster::default();
        let keys = MockKeys::default();
        let dir = camino_tempfile::tempdir().unwrap();
        let budget_file = dir.path().join("TargetNodes.txt");
        let reconciler = HardwareReconciler::new(
            Arc::clone(&fleet),
            Arc::clone(&suspended),
            inventory.clone(),
            store.clone(),
            cluster.clone(),
            keys.clone(),
            budget_file.clone(),
            test_logger(),
        );
        Harness {
            reconciler,
            fleet,
            suspended,
            inventory,
            store,
            cluster,
            keys,
            _dir: dir,
            budget_file,
        }
    }

    #[tokio::test]
    async fn first_tick_registers_sizes_and_publishes() {
        let h = harness(5, 2000);
        let mtn = node("x9000c1s0b0n0", HardwareClass::Mountain);
        h.inventory.push(FetchResult::Nodes(vec![mtn.clone()]));

        h.reconciler.reconcile_tick().await;

        assert_eq!(
            *h.store.registered.lock().unwrap(),
            vec![vec!["x9000c1s0b0n0".to_string()]],
        );
        assert!(h.store.deregistered.lock().unwrap().is_empty());
        // one mountain node at max 5/worker: 2 workers, budgets 2/1
        assert_eq!(*h.cluster.calls.lock().unwrap(), vec![2]);
        let contents =
            tokio::fs::read_to_string(&h.budget_file).await.unwrap();
        assert_eq!(contents, "River:1\nMountain:2\n");
        assert_eq!(
            *h.keys.staged.lock().unwrap(),
            vec![vec!["x9000c1s0b0n0".to_string()]],
        );

        let fleet = h.fleet.read().await;
        assert_eq!(fleet.worker_count, Some(2));
        assert_eq!(fleet.mtn_budget_per_worker, Some(2));
        assert_eq!(fleet.rvr_budget_per_worker, Some(1));
        assert_eq!(fleet.force_full_resync_countdown, 10);
        assert!(fleet.last_reconcile_time.is_some());
    }

    #[tokio::test]
    async fn second_tick_with_unchanged_inventory_is_idempotent() {
        let h = harness(750, 2000);
        let river = node("x1c0s0b0n0", HardwareClass::River);
        h.inventory.push(FetchResult::Nodes(vec![river.clone()]));
        h.inventory.push(FetchResult::Nodes(vec![river.clone()]));

        h.reconciler.reconcile_tick().await;
        h.reconciler.reconcile_tick().await;

        // only the first tick registers; the second produces no writes
        assert_eq!(h.store.registered.lock().unwrap().len(), 1);
        assert!(h.store.deregistered.lock().unwrap().is_empty());
        // sizing is recomputed each tick with the same answer; the
        // adapter's compare-before-patch makes the second call a no-op
        assert_eq!(*h.cluster.calls.lock().unwrap(), vec![2, 2]);
        assert_eq!(h.fleet.read().await.force_full_resync_countdown, 9);
    }

    #[tokio::test]
    async fn inventory_outage_short_circuits() {
        let h = harness(750, 2000);
        let river = node("x1c0s0b0n0", HardwareClass::River);
        h.inventory.push(FetchResult::Nodes(vec![river.clone()]));
        h.inventory.push(FetchResult::Fail);
        h.inventory.push(FetchResult::Nodes(vec![]));

        h.reconciler.reconcile_tick().await;
        let countdown_after_first =
            h.fleet.read().await.force_full_resync_countdown;

        h.reconciler.reconcile_tick().await; // error
        h.reconciler.reconcile_tick().await; // empty

        // cache intact, no deregistrations, no further resizes, countdown
        // not advanced by the failed ticks
        let fleet = h.fleet.read().await;
        assert!(fleet.contains_node("x1c0s0b0n0"));
        assert_eq!(
            fleet.force_full_resync_countdown,
            countdown_after_first
        );
        assert!(fleet.last_reconcile_time.is_some());
        drop(fleet);
        assert!(h.store.deregistered.lock().unwrap().is_empty());
        assert_eq!(h.cluster.calls.lock().unwrap().len(), 1);
        assert_eq!(h.store.registered.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn removed_nodes_are_deregistered() {
        let h = harness(750, 2000);
        let a = node("x1c0s0b0n0", HardwareClass::River);
        let b = node("x1c0s1b0n0", HardwareClass::River);
        h.inventory
            .push(FetchResult::Nodes(vec![a.clone(), b.clone()]));
        h.inventory.push(FetchResult::Nodes(vec![a.clone()]));

        h.reconciler.reconcile_tick().await;
        h.reconciler.reconcile_tick().await;

        assert_eq!(
            *h.store.deregistered.lock().unwrap(),
            vec![vec!["x1c0s1b0n0".to_string()]],
        );
        let fleet = h.fleet.read().await;
        assert!(fleet.contains_node("x1c0s0b0n0"));
        assert!(!fleet.contains_node("x1c0s1b0n0"));
    }

    #[tokio::test]
    async fn register_failure_forces_full_resync() {
        let h = harness(750, 2000);
        let a = node("x1c0s0b0n0", HardwareClass::River);
        let b = node("x1c0s1b0n0", HardwareClass::River);
        h.inventory
            .push(FetchResult::Nodes(vec![a.clone(), b.clone()]));
        h.inventory
            .push(FetchResult::Nodes(vec![a.clone(), b.clone()]));
        h.store.fail_register.store(true, Ordering::SeqCst);

        h.reconciler.reconcile_tick().await;
        assert_eq!(h.fleet.read().await.force_full_resync_countdown, 0);
        // sizing still ran despite the add failure
        assert_eq!(h.cluster.calls.lock().unwrap().len(), 1);

        // next tick: nothing new, but the full cache is resent
        h.store.fail_register.store(false, Ordering::SeqCst);
        h.reconciler.reconcile_tick().await;
        let registered = h.store.registered.lock().unwrap();
        assert_eq!(registered.len(), 2);
        assert_eq!(
            registered[1],
            vec!["x1c0s0b0n0".to_string(), "x1c0s1b0n0".to_string()],
        );
    }

    #[tokio::test]
    async fn key_failure_latches_full_resweep() {
        let h = harness(750, 2000);
        let m1 = node("x9000c1s0b0n0", HardwareClass::Mountain);
        let m2 = node("x9000c1s1b0n0", HardwareClass::Hill);
        h.inventory
            .push(FetchResult::Nodes(vec![m1.clone(), m2.clone()]));
        h.inventory
            .push(FetchResult::Nodes(vec![m1.clone(), m2.clone()]));
        h.keys.fail.store(true, Ordering::SeqCst);

        h.reconciler.reconcile_tick().await;
        {
            let fleet = h.fleet.read().await;
            assert!(fleet.needs_mountain_key_redeploy);
            assert_eq!(fleet.force_full_resync_countdown, 0);
        }

        // second tick has no new nodes but restages every mountain node
        h.keys.fail.store(false, Ordering::SeqCst);
        h.reconciler.reconcile_tick().await;
        let staged = h.keys.staged.lock().unwrap();
        assert_eq!(staged.len(), 2);
        assert_eq!(
            staged[1],
            vec!["x9000c1s0b0n0".to_string(), "x9000c1s1b0n0".to_string()],
        );
        drop(staged);
        assert!(!h.fleet.read().await.needs_mountain_key_redeploy);
    }

    #[tokio::test]
    async fn resize_failure_leaves_worker_count_unset() {
        let h = harness(750, 2000);
        h.inventory.push(FetchResult::Nodes(vec![node(
            "x1c0s0b0n0",
            HardwareClass::River,
        )]));
        h.cluster.fail.store(true, Ordering::SeqCst);

        h.reconciler.reconcile_tick().await;

        let fleet = h.fleet.read().await;
        assert_eq!(fleet.worker_count, None);
        assert_eq!(fleet.mtn_budget_per_worker, None);
        // the budget file was never written
        assert!(tokio::fs::metadata(&h.budget_file).await.is_err());
    }

    #[tokio::test]
    async fn suspended_latch_skips_reconcile() {
        let mut h = harness(750, 2000);
        h.inventory.push(FetchResult::Nodes(vec![node(
            "x1c0s0b0n0",
            HardwareClass::River,
        )]));
        h.suspended.store(true, Ordering::SeqCst);

        h.reconciler.activate().await;

        assert!(h.store.registered.lock().unwrap().is_empty());
        assert!(h.fleet.read().await.last_reconcile_time.is_none());
    }

    #[tokio::test]
    async fn heartbeat_reaper_passes_stale_minutes() {
        let store = MockStore::default();
        let mut reaper =
            HeartbeatReaper::new(store.clone(), 3, test_logger());
        reaper.activate().await;
        reaper.activate().await;
        assert_eq!(*store.reaped.lock().unwrap(), vec![3, 3]);
    }
}
