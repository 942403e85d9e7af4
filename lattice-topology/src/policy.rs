//! Rebalance policy engine
//!
//! One [`RebalancePolicy`] per process coordinates the topology of every
//! named cache. It is a passive object: membership changes, cache joins and
//! leaves, and rebalance confirmations are pushed in from multiple threads,
//! serialized per cache by the status mutex, and may fan out into async
//! rebalance decision jobs.
//!
//! # Event flow
//!
//! - transport view change -> [`RebalancePolicy::update_members_list`]
//! - cache creation -> [`RebalancePolicy::init_cache`]
//! - partition merge -> [`RebalancePolicy::init_cache_with_topologies`]
//! - node joins a cache -> [`RebalancePolicy::add_joiners`]
//! - nodes leave -> [`RebalancePolicy::remove_leavers`]
//! - cluster-wide rebalance done -> [`RebalancePolicy::on_rebalance_completed`]
//!
//! Each event updates the cache status under its lock, optionally broadcasts
//! a new topology through the cluster topology manager, and optionally
//! schedules an asynchronous rebalance job.

use crate::config::PolicyConfig;
use crate::error::{Result, TopologyError};
use crate::executor::JobExecutor;
use crate::manager::{ClusterTopologyManager, Transport};
use crate::metrics;
use crate::status::{CacheState, CacheStatus};
use crate::topology::{Address, CacheJoinInfo, CacheTopology};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use tracing::{debug, info, trace, warn};

/// Decides when and how each cache's segment ownership changes
pub struct RebalancePolicy {
    config: PolicyConfig,
    manager: Arc<dyn ClusterTopologyManager>,
    transport: Arc<dyn Transport>,
    executor: Arc<dyn JobExecutor>,

    /// Latest transport view, replaced whole on every update
    cluster_members: RwLock<Vec<Address>>,

    /// Per-cache state; concurrent lookups, put-if-absent on cache creation
    caches: RwLock<HashMap<String, Arc<CacheStatus>>>,

    /// Runtime toggle seeded from `PolicyConfig::auto_rebalance`
    rebalancing_enabled: AtomicBool,

    /// Handle to self for the async rebalance jobs
    self_ref: Weak<RebalancePolicy>,
}

impl RebalancePolicy {
    pub fn new(
        config: PolicyConfig,
        manager: Arc<dyn ClusterTopologyManager>,
        transport: Arc<dyn Transport>,
        executor: Arc<dyn JobExecutor>,
    ) -> Arc<Self> {
        Arc::new_cyclic(|self_ref| Self {
            rebalancing_enabled: AtomicBool::new(config.auto_rebalance),
            config,
            manager,
            transport,
            executor,
            cluster_members: RwLock::new(Vec::new()),
            caches: RwLock::new(HashMap::new()),
            self_ref: Weak::clone(self_ref),
        })
    }

    /// Prime the member snapshot from the transport. Must run after the
    /// collaborators are wired and before any cache-topology activity.
    pub fn start(&self) {
        let members = self.transport.members();
        info!(
            "Rebalance policy started with {} cluster members",
            members.len()
        );
        *self.cluster_members.write() = members;
    }

    pub fn config(&self) -> &PolicyConfig {
        &self.config
    }

    /// Current transport view snapshot
    pub fn cluster_members(&self) -> Vec<Address> {
        self.cluster_members.read().clone()
    }

    pub fn cache_count(&self) -> usize {
        self.caches.read().len()
    }

    pub fn cache_names(&self) -> Vec<String> {
        self.caches.read().keys().cloned().collect()
    }

    // ========================================
    // Cache registration
    // ========================================

    /// Register a cache with its join parameters. Idempotent: the first
    /// writer wins and later calls are no-ops. Does not broadcast.
    pub fn init_cache(&self, cache_name: &str, join_info: CacheJoinInfo) {
        let mut caches = self.caches.write();
        if caches.contains_key(cache_name) {
            debug!("Cache {} already registered", cache_name);
            return;
        }
        caches.insert(
            cache_name.to_string(),
            Arc::new(CacheStatus::new(cache_name, join_info)),
        );
        metrics::update_cache_count(caches.len());
        info!("Registered cache {}", cache_name);
    }

    /// Absorb the topologies that sub-clusters held for the same cache after
    /// a partition merge. Installs the union topology under the highest seen
    /// id and broadcasts it. The follow-up rebalance is left to the next
    /// members update.
    pub fn init_cache_with_topologies(
        &self,
        cache_name: &str,
        join_info: CacheJoinInfo,
        partition_topologies: &[CacheTopology],
    ) -> Result<()> {
        if partition_topologies.is_empty() {
            debug!("Ignoring empty partition topology list for cache {}", cache_name);
            return Ok(());
        }
        let status = self.get_or_insert(cache_name, join_info);
        let factory = Arc::clone(status.join_info().factory());
        let mut state = status.lock();

        let union_id = partition_topologies
            .iter()
            .map(|topology| topology.topology_id)
            .max()
            .unwrap_or(CacheTopology::INITIAL_ID);

        let mut current_union = None;
        for topology in partition_topologies {
            if let Some(current) = &topology.current {
                current_union = Some(match current_union {
                    Some(union) => factory.union(&union, current)?,
                    None => current.clone(),
                });
            }
        }
        let mut pending_union = None;
        for topology in partition_topologies {
            if let Some(pending) = &topology.pending {
                pending_union = Some(match pending_union {
                    Some(union) => factory.union(&union, pending)?,
                    None => pending.clone(),
                });
            }
        }

        let topology = CacheTopology::new(union_id, current_union, pending_union);
        info!(
            "Installing merged topology for cache {}: topology id {}, {} partitions",
            cache_name,
            topology.topology_id,
            partition_topologies.len()
        );
        status.install(&mut state, topology.clone());
        if let Some(current) = &topology.current {
            state.remove_joiners_in(current);
        }
        metrics::record_topology_merge(cache_name, partition_topologies.len());
        metrics::record_topology_install(cache_name, topology.topology_id);
        self.manager.update_consistent_hash(cache_name, &topology);
        Ok(())
    }

    /// Drop a cache's state, typically when its last instance stops. Later
    /// events for the name fall into the unknown-cache path.
    pub fn remove_cache(&self, cache_name: &str) -> bool {
        let mut caches = self.caches.write();
        let removed = caches.remove(cache_name).is_some();
        if removed {
            metrics::update_cache_count(caches.len());
            info!("Removed cache {}", cache_name);
        }
        removed
    }

    // ========================================
    // Join / leave
    // ========================================

    /// Record nodes requesting membership in a cache.
    ///
    /// On the first joiner the initial topology is installed and returned
    /// without a broadcast; delivering it to the joining node is the
    /// caller's job. Later joiners schedule an async rebalance. Returns
    /// `None` for an unknown cache.
    pub fn add_joiners(
        &self,
        cache_name: &str,
        joiners: &[Address],
    ) -> Result<Option<CacheTopology>> {
        let Some(status) = self.cache_status(cache_name) else {
            trace!("Join for unknown cache {} ignored", cache_name);
            return Ok(None);
        };
        let mut state = status.lock();
        for joiner in joiners {
            if state.add_joiner(joiner.clone()) {
                debug!("Cache {} has new joiner {}", cache_name, joiner);
            }
        }
        if state.topology.current.is_none() {
            self.install_initial_topology(&status, &mut state)?;
        } else {
            self.trigger_rebalance(&status);
        }
        Ok(Some(state.topology.clone()))
    }

    /// Remove departed nodes from a cache, shrinking both hashes to the
    /// remaining cluster view
    pub fn remove_leavers(&self, cache_name: &str, leavers: &[Address]) -> Result<()> {
        let Some(status) = self.cache_status(cache_name) else {
            trace!("Leave for unknown cache {} ignored", cache_name);
            return Ok(());
        };
        let new_members: Vec<Address> = self
            .cluster_members
            .read()
            .iter()
            .filter(|member| !leavers.contains(member))
            .cloned()
            .collect();
        let mut state = status.lock();
        // a leaver that never made it into a hash must not rejoin by itself
        state.joiners.retain(|joiner| !leavers.contains(joiner));
        if state.topology.current.is_none() {
            trace!("Cache {} has no topology yet, ignoring leavers", cache_name);
            return Ok(());
        }
        self.update_cache_members(&status, &mut state, &new_members)
    }

    /// Replace the cluster view and reconcile every cache against it.
    ///
    /// Caches referencing departed members are shrunk; caches left
    /// unbalanced, or holding joiners that arrived before the view carrying
    /// them, get a rebalance scheduled. A failure while reconciling one
    /// cache is logged and does not stop the others from being processed.
    pub fn update_members_list(&self, new_cluster_members: Vec<Address>) {
        info!(
            "Cluster view updated: {} members",
            new_cluster_members.len()
        );
        *self.cluster_members.write() = new_cluster_members.clone();

        let statuses: Vec<Arc<CacheStatus>> = self.caches.read().values().cloned().collect();
        for status in statuses {
            let mut state = status.lock();
            let Some(current) = state.topology.current.clone() else {
                continue;
            };
            let current_valid = current
                .members()
                .iter()
                .all(|member| new_cluster_members.contains(member));
            let pending_valid = state.topology.pending.as_ref().map_or(true, |pending| {
                pending
                    .members()
                    .iter()
                    .all(|member| new_cluster_members.contains(member))
            });
            if !current_valid || !pending_valid {
                let surviving: Vec<Address> = current
                    .members()
                    .iter()
                    .filter(|member| new_cluster_members.contains(member))
                    .cloned()
                    .collect();
                if let Err(error) = self.update_cache_members(&status, &mut state, &surviving) {
                    warn!(
                        "Failed to update members of cache {}: {}",
                        status.cache_name(),
                        error
                    );
                    metrics::record_members_update_error(
                        status.cache_name(),
                        error.error_type(),
                    );
                    continue;
                }
            }
            let unbalanced = state
                .topology
                .current
                .as_ref()
                .map(|ch| !ch.is_balanced())
                .unwrap_or(false);
            if unbalanced || !state.joiners.is_empty() {
                self.trigger_rebalance(&status);
            }
        }
    }

    // ========================================
    // Rebalance lifecycle
    // ========================================

    /// Confirm that every node applied the pending hash of the given
    /// topology id. Promotes pending to current and broadcasts; a
    /// confirmation that does not match the outstanding rebalance fails with
    /// [`TopologyError::StaleRebalanceConfirmation`] and leaves the state
    /// untouched.
    pub fn on_rebalance_completed(&self, cache_name: &str, topology_id: i64) -> Result<()> {
        let Some(status) = self.cache_status(cache_name) else {
            trace!(
                "Rebalance confirmation for unknown cache {} ignored",
                cache_name
            );
            return Ok(());
        };
        let mut state = status.lock();
        if topology_id != state.topology.topology_id || state.topology.pending.is_none() {
            metrics::record_stale_confirmation(cache_name);
            return Err(TopologyError::StaleRebalanceConfirmation {
                cache: cache_name.to_string(),
                expected: state.topology.topology_id,
                received: topology_id,
            });
        }

        let promoted = CacheTopology::new(
            state.topology.topology_id + 1,
            state.topology.pending.clone(),
            None,
        );
        info!(
            "Rebalance of cache {} completed, promoting pending hash as topology id {}",
            cache_name, promoted.topology_id
        );
        status.install(&mut state, promoted.clone());
        metrics::record_topology_install(cache_name, promoted.topology_id);
        metrics::record_rebalance_completed(cache_name);
        self.manager.update_consistent_hash(cache_name, &promoted);

        if let Some(current) = &promoted.current {
            state.remove_joiners_in(current);
        }
        let unbalanced = promoted
            .current
            .as_ref()
            .map(|ch| !ch.is_balanced())
            .unwrap_or(false);
        if unbalanced || !state.joiners.is_empty() {
            self.trigger_rebalance(&status);
        } else {
            debug!("Cache {} is steady", cache_name);
        }
        Ok(())
    }

    /// Latest topology of a cache without contending with in-flight
    /// transitions. `None` for an unknown cache.
    pub fn get_topology(&self, cache_name: &str) -> Option<CacheTopology> {
        self.cache_status(cache_name)
            .map(|status| status.current_topology())
    }

    // ========================================
    // Rebalancing toggle
    // ========================================

    pub fn is_rebalancing_enabled(&self) -> bool {
        self.rebalancing_enabled.load(Ordering::SeqCst)
    }

    /// Enable or disable rebalancing at runtime. While disabled, triggers
    /// are logged no-ops; re-enabling schedules a rebalance check on every
    /// registered cache.
    pub fn set_rebalancing_enabled(&self, enabled: bool) {
        let was = self.rebalancing_enabled.swap(enabled, Ordering::SeqCst);
        if was == enabled {
            return;
        }
        info!("Rebalancing {}", if enabled { "enabled" } else { "disabled" });
        if enabled {
            let statuses: Vec<Arc<CacheStatus>> = self.caches.read().values().cloned().collect();
            for status in statuses {
                self.trigger_rebalance(&status);
            }
        }
    }

    // ========================================
    // Internals
    // ========================================

    fn cache_status(&self, cache_name: &str) -> Option<Arc<CacheStatus>> {
        self.caches.read().get(cache_name).cloned()
    }

    fn get_or_insert(&self, cache_name: &str, join_info: CacheJoinInfo) -> Arc<CacheStatus> {
        if let Some(status) = self.cache_status(cache_name) {
            return status;
        }
        let mut caches = self.caches.write();
        let status = caches
            .entry(cache_name.to_string())
            .or_insert_with(|| Arc::new(CacheStatus::new(cache_name, join_info)))
            .clone();
        metrics::update_cache_count(caches.len());
        status
    }

    /// Build the first balanced hash over the waiting joiners. No broadcast:
    /// the topology travels back on the join reply instead.
    fn install_initial_topology(&self, status: &CacheStatus, state: &mut CacheState) -> Result<()> {
        if state.joiners.is_empty() {
            trace!(
                "Cache {} has no joiners yet, keeping empty topology",
                status.cache_name()
            );
            return Ok(());
        }
        let info = status.join_info();
        let balanced =
            info.factory()
                .create(info.num_owners(), info.num_segments(), &state.joiners)?;
        state.remove_joiners_in(&balanced);
        let topology = CacheTopology::new(state.topology.topology_id + 1, Some(balanced), None);
        info!(
            "Installed initial topology for cache {}: topology id {}, {} members",
            status.cache_name(),
            topology.topology_id,
            topology.members().len()
        );
        metrics::record_topology_install(status.cache_name(), topology.topology_id);
        status.install(state, topology);
        Ok(())
    }

    /// Shrink both hashes to the given member view. The topology id is
    /// preserved: a membership shrink does not mint a new id by itself.
    fn update_cache_members(
        &self,
        status: &Arc<CacheStatus>,
        state: &mut CacheState,
        new_members: &[Address],
    ) -> Result<()> {
        let factory = Arc::clone(status.join_info().factory());
        let topology_id = state.topology.topology_id;

        let mut new_pending = match &state.topology.pending {
            Some(pending) => {
                let surviving: Vec<Address> = pending
                    .members()
                    .iter()
                    .filter(|member| new_members.contains(member))
                    .cloned()
                    .collect();
                if surviving.is_empty() {
                    None
                } else {
                    Some(factory.update_members(pending, &surviving)?)
                }
            }
            None => None,
        };

        let Some(current) = state.topology.current.clone() else {
            return Ok(());
        };
        let surviving: Vec<Address> = current
            .members()
            .iter()
            .filter(|member| new_members.contains(member))
            .cloned()
            .collect();
        let new_current = if surviving.is_empty() {
            // the cache survives on the pending members, if any
            new_pending.clone()
        } else {
            Some(factory.update_members(&current, &surviving)?)
        };

        // A pending identical to the shrunken current has nothing left to
        // transfer; dropping it also invalidates confirmations for the
        // rebalance it belonged to.
        if new_pending == new_current {
            new_pending = None;
        }

        let has_members = new_current.is_some();
        let topology = CacheTopology::new(topology_id, new_current, new_pending);
        debug!(
            "Cache {} members updated: topology id {}, {} members",
            status.cache_name(),
            topology.topology_id,
            topology.members().len()
        );
        status.install(state, topology.clone());
        if let Some(current) = &topology.current {
            state.remove_joiners_in(current);
        }
        if has_members {
            self.manager
                .update_consistent_hash(status.cache_name(), &topology);
            self.trigger_rebalance(status);
        } else {
            debug!(
                "Cache {} has no members left, suppressing broadcast",
                status.cache_name()
            );
        }
        Ok(())
    }

    /// Schedule an async rebalance decision. Submissions coalesce:
    /// `do_rebalance` discards itself when a rebalance is already in flight.
    fn trigger_rebalance(&self, status: &Arc<CacheStatus>) {
        if !self.rebalancing_enabled.load(Ordering::SeqCst) {
            debug!(
                "Rebalancing disabled, skipping trigger for cache {}",
                status.cache_name()
            );
            return;
        }
        let Some(policy) = self.self_ref.upgrade() else {
            return;
        };
        metrics::record_rebalance_trigger(status.cache_name());
        let status = Arc::clone(status);
        self.executor.submit(Box::pin(async move {
            policy.do_rebalance(&status).await;
        }));
    }

    /// The serialization point of all rebalance decisions for a cache. The
    /// status mutex covers the decision; the cluster-wide rebalance
    /// broadcast runs after it is released so concurrent events for the same
    /// cache are not blocked behind the protocol.
    async fn do_rebalance(&self, status: &CacheStatus) {
        let plan = {
            let mut state = status.lock();
            self.plan_rebalance(status, &mut state)
        };
        match plan {
            Ok(Some(topology)) => {
                if let Err(error) = self.manager.rebalance(status.cache_name(), &topology).await {
                    warn!(
                        "Rebalance broadcast for cache {} failed: {}",
                        status.cache_name(),
                        error
                    );
                    metrics::record_rebalance_error(status.cache_name(), error.error_type());
                }
            }
            Ok(None) => {}
            Err(error) => {
                warn!(
                    "Rebalance planning for cache {} failed: {}",
                    status.cache_name(),
                    error
                );
                metrics::record_rebalance_error(status.cache_name(), error.error_type());
            }
        }
    }

    /// Decide whether a rebalance is needed and, if so, install the pending
    /// hash under a fresh topology id. Returns the topology to broadcast.
    fn plan_rebalance(
        &self,
        status: &CacheStatus,
        state: &mut CacheState,
    ) -> Result<Option<CacheTopology>> {
        if state.topology.pending.is_some() {
            debug!(
                "Rebalance already in progress for cache {}, discarding trigger",
                status.cache_name()
            );
            return Ok(None);
        }

        let mut new_members = state.topology.members();
        for joiner in &state.joiners {
            if !new_members.contains(joiner) {
                new_members.push(joiner.clone());
            }
        }
        {
            let cluster = self.cluster_members.read();
            new_members.retain(|member| cluster.contains(member));
        }
        if new_members.is_empty() {
            debug!(
                "Cache {} has no eligible members, nothing to rebalance",
                status.cache_name()
            );
            return Ok(None);
        }

        let Some(current) = state.topology.current.clone() else {
            // every member left after the trigger was scheduled; bootstrap
            // again from the waiting joiners
            self.install_initial_topology(status, state)?;
            return Ok(None);
        };

        let factory = status.join_info().factory();
        let updated = factory.update_members(&current, &new_members)?;
        let balanced = factory.rebalance(&updated)?;
        if balanced == current {
            debug!("Cache {} is already balanced", status.cache_name());
            return Ok(None);
        }

        let topology = CacheTopology::new(
            state.topology.topology_id + 1,
            Some(current),
            Some(balanced),
        );
        info!(
            "Starting rebalance of cache {}: topology id {}, {} members",
            status.cache_name(),
            topology.topology_id,
            new_members.len()
        );
        metrics::record_rebalance_start(status.cache_name(), topology.topology_id);
        status.install(state, topology.clone());
        Ok(Some(topology))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::testing::ManualExecutor;
    use crate::hash::{ConsistentHash, ConsistentHashFactory, DefaultHashFactory};
    use async_trait::async_trait;
    use parking_lot::Mutex;

    #[derive(Default)]
    struct RecordingManager {
        updates: Mutex<Vec<(String, CacheTopology)>>,
        rebalances: Mutex<Vec<(String, CacheTopology)>>,
    }

    impl RecordingManager {
        fn updates(&self) -> Vec<(String, CacheTopology)> {
            self.updates.lock().clone()
        }

        fn rebalances(&self) -> Vec<(String, CacheTopology)> {
            self.rebalances.lock().clone()
        }
    }

    #[async_trait]
    impl ClusterTopologyManager for RecordingManager {
        fn update_consistent_hash(&self, cache_name: &str, topology: &CacheTopology) {
            self.updates
                .lock()
                .push((cache_name.to_string(), topology.clone()));
        }

        async fn rebalance(&self, cache_name: &str, topology: &CacheTopology) -> Result<()> {
            self.rebalances
                .lock()
                .push((cache_name.to_string(), topology.clone()));
            Ok(())
        }
    }

    /// Bootstraps normally but refuses every later member update
    struct FailingFactory;

    impl ConsistentHashFactory for FailingFactory {
        fn create(
            &self,
            num_owners: usize,
            num_segments: usize,
            members: &[Address],
        ) -> Result<ConsistentHash> {
            DefaultHashFactory.create(num_owners, num_segments, members)
        }

        fn update_members(
            &self,
            _ch: &ConsistentHash,
            _new_members: &[Address],
        ) -> Result<ConsistentHash> {
            Err(TopologyError::InvalidHash("induced failure".to_string()))
        }

        fn union(&self, a: &ConsistentHash, b: &ConsistentHash) -> Result<ConsistentHash> {
            DefaultHashFactory.union(a, b)
        }

        fn rebalance(&self, ch: &ConsistentHash) -> Result<ConsistentHash> {
            DefaultHashFactory.rebalance(ch)
        }
    }

    struct StaticTransport(Vec<Address>);

    impl Transport for StaticTransport {
        fn members(&self) -> Vec<Address> {
            self.0.clone()
        }
    }

    struct Fixture {
        policy: Arc<RebalancePolicy>,
        manager: Arc<RecordingManager>,
        executor: Arc<ManualExecutor>,
    }

    fn addr(name: &str) -> Address {
        Address::new(name)
    }

    fn addrs(names: &[&str]) -> Vec<Address> {
        names.iter().map(|n| Address::new(*n)).collect()
    }

    fn join_info() -> CacheJoinInfo {
        CacheJoinInfo::new("default", 2, 4, Arc::new(DefaultHashFactory))
    }

    fn fixture(cluster: &[&str]) -> Fixture {
        fixture_with_config(cluster, PolicyConfig::default())
    }

    fn fixture_with_config(cluster: &[&str], config: PolicyConfig) -> Fixture {
        let manager = Arc::new(RecordingManager::default());
        let executor = Arc::new(ManualExecutor::new());
        let transport = Arc::new(StaticTransport(addrs(cluster)));
        let policy = RebalancePolicy::new(
            config,
            manager.clone(),
            transport,
            executor.clone(),
        );
        policy.start();
        Fixture {
            policy,
            manager,
            executor,
        }
    }

    /// Bring a cache to the mid-rebalance state of the two-node scenario:
    /// current over [a], pending balanced over [a, b], topology id 1.
    async fn fixture_with_pending() -> Fixture {
        let f = fixture(&["a", "b"]);
        f.policy.init_cache("dist", join_info());
        f.policy.add_joiners("dist", &[addr("a")]).unwrap();
        f.policy.add_joiners("dist", &[addr("b")]).unwrap();
        f.executor.run_pending().await;
        f
    }

    #[tokio::test]
    async fn test_single_node_bootstrap() {
        let f = fixture(&["a"]);
        f.policy.init_cache("dist", join_info());
        let topology = f
            .policy
            .add_joiners("dist", &[addr("a")])
            .unwrap()
            .expect("cache is registered");

        assert_eq!(topology.topology_id, 0);
        let current = topology.current.expect("initial hash installed");
        assert_eq!(current.members(), addrs(&["a"]).as_slice());
        for segment in 0..4 {
            assert_eq!(current.owners(segment), &[addr("a")]);
        }
        assert!(topology.pending.is_none());
        // the initial topology goes back on the join reply, never broadcast
        assert!(f.manager.updates().is_empty());
        assert_eq!(f.executor.submitted(), 0);
    }

    #[tokio::test]
    async fn test_second_joiner_starts_rebalance() {
        let f = fixture_with_pending().await;

        let topology = f.policy.get_topology("dist").unwrap();
        assert_eq!(topology.topology_id, 1);
        assert_eq!(
            topology.current.as_ref().unwrap().members(),
            addrs(&["a"]).as_slice()
        );
        let pending = topology.pending.as_ref().expect("rebalance in flight");
        assert_eq!(pending.members(), addrs(&["a", "b"]).as_slice());
        assert!(pending.is_balanced());
        for segment in 0..4 {
            assert_eq!(pending.owners(segment).len(), 2);
        }

        let rebalances = f.manager.rebalances();
        assert_eq!(rebalances.len(), 1);
        assert_eq!(rebalances[0].1.topology_id, 1);
    }

    #[tokio::test]
    async fn test_completion_promotes_pending() {
        let f = fixture_with_pending().await;

        f.policy.on_rebalance_completed("dist", 1).unwrap();
        let topology = f.policy.get_topology("dist").unwrap();
        assert_eq!(topology.topology_id, 2);
        let current = topology.current.unwrap();
        assert_eq!(current.members(), addrs(&["a", "b"]).as_slice());
        assert!(current.is_balanced());
        assert!(topology.pending.is_none());

        // promotion is broadcast to all members
        let updates = f.manager.updates();
        assert_eq!(updates.last().unwrap().1.topology_id, 2);

        // cache is steady, no further work
        f.executor.run_pending().await;
        assert_eq!(f.manager.rebalances().len(), 1);
    }

    #[tokio::test]
    async fn test_leaver_mid_rebalance() {
        let f = fixture_with_pending().await;

        f.policy.remove_leavers("dist", &[addr("b")]).unwrap();
        let topology = f.policy.get_topology("dist").unwrap();
        // a shrink never mints a topology id
        assert_eq!(topology.topology_id, 1);
        assert_eq!(
            topology.current.as_ref().unwrap().members(),
            addrs(&["a"]).as_slice()
        );
        // the pending hash collapsed onto the shrunken current and was dropped
        assert!(topology.pending.is_none());

        // the fresh trigger finds the cache balanced again
        f.executor.run_pending().await;
        assert_eq!(f.manager.rebalances().len(), 1);

        // the in-flight rebalance no longer has anything to confirm
        let err = f.policy.on_rebalance_completed("dist", 1).unwrap_err();
        assert!(matches!(
            err,
            TopologyError::StaleRebalanceConfirmation { received: 1, .. }
        ));
    }

    #[tokio::test]
    async fn test_partition_heal_unions_topologies() {
        let f = fixture(&["a", "b", "c", "d"]);
        let factory = DefaultHashFactory;
        let ch_ab = factory.create(2, 4, &addrs(&["a", "b"])).unwrap();
        let ch_cd = factory.create(2, 4, &addrs(&["c", "d"])).unwrap();
        let t1 = CacheTopology::new(5, Some(ch_ab.clone()), None);
        let t2 = CacheTopology::new(7, Some(ch_cd.clone()), None);

        f.policy
            .init_cache_with_topologies("dist", join_info(), &[t1, t2])
            .unwrap();

        let topology = f.policy.get_topology("dist").unwrap();
        assert_eq!(topology.topology_id, 7);
        let merged = topology.current.as_ref().unwrap();
        assert_eq!(merged.members(), addrs(&["a", "b", "c", "d"]).as_slice());
        for segment in 0..4 {
            for owner in ch_ab.owners(segment).iter().chain(ch_cd.owners(segment)) {
                assert!(merged.owners(segment).contains(owner));
            }
        }
        assert!(topology.pending.is_none());
        assert_eq!(f.manager.updates().len(), 1);
        // the union is deliberately left unbalanced here
        assert_eq!(f.executor.submitted(), 0);

        // the next view update restores balance
        f.policy.update_members_list(addrs(&["a", "b", "c", "d"]));
        f.executor.run_pending().await;
        let topology = f.policy.get_topology("dist").unwrap();
        assert_eq!(topology.topology_id, 8);
        assert!(topology.pending.as_ref().unwrap().is_balanced());

        f.policy.on_rebalance_completed("dist", 8).unwrap();
        let topology = f.policy.get_topology("dist").unwrap();
        assert_eq!(topology.topology_id, 9);
        assert!(topology.current.as_ref().unwrap().is_balanced());
    }

    #[tokio::test]
    async fn test_duplicate_completion_is_stale() {
        let f = fixture_with_pending().await;

        f.policy.on_rebalance_completed("dist", 1).unwrap();
        let err = f.policy.on_rebalance_completed("dist", 1).unwrap_err();
        assert!(matches!(
            err,
            TopologyError::StaleRebalanceConfirmation {
                expected: 2,
                received: 1,
                ..
            }
        ));
        // the failed confirmation left the topology untouched
        assert_eq!(f.policy.get_topology("dist").unwrap().topology_id, 2);
    }

    #[tokio::test]
    async fn test_duplicate_joiner_is_recorded_once() {
        let f = fixture(&["a", "b"]);
        f.policy.init_cache("dist", join_info());
        f.policy.add_joiners("dist", &[addr("a")]).unwrap();
        f.policy.add_joiners("dist", &[addr("b")]).unwrap();
        f.policy
            .add_joiners("dist", &[addr("b"), addr("b")])
            .unwrap();
        f.executor.run_pending().await;

        // the duplicate triggers coalesce into a single rebalance
        let rebalances = f.manager.rebalances();
        assert_eq!(rebalances.len(), 1);
        let pending = rebalances[0].1.pending.as_ref().unwrap();
        assert_eq!(pending.members(), addrs(&["a", "b"]).as_slice());
    }

    #[tokio::test]
    async fn test_redundant_trigger_after_bootstrap_is_noop() {
        let f = fixture(&["a"]);
        f.policy.init_cache("dist", join_info());
        f.policy.add_joiners("dist", &[addr("a")]).unwrap();
        let before = f.policy.get_topology("dist").unwrap();

        f.policy.add_joiners("dist", &[addr("a")]).unwrap();
        f.executor.run_pending().await;

        assert_eq!(f.policy.get_topology("dist").unwrap(), before);
        assert!(f.manager.rebalances().is_empty());
    }

    #[tokio::test]
    async fn test_add_joiners_unknown_cache() {
        let f = fixture(&["a"]);
        assert!(f.policy.add_joiners("nope", &[addr("a")]).unwrap().is_none());
        assert!(f.manager.updates().is_empty());
        assert_eq!(f.executor.submitted(), 0);
    }

    #[tokio::test]
    async fn test_remove_leavers_unknown_cache() {
        let f = fixture(&["a"]);
        f.policy.remove_leavers("nope", &[addr("a")]).unwrap();
        assert!(f.manager.updates().is_empty());
    }

    #[tokio::test]
    async fn test_removing_last_member_suppresses_broadcast() {
        let f = fixture(&["a"]);
        f.policy.init_cache("dist", join_info());
        f.policy.add_joiners("dist", &[addr("a")]).unwrap();

        f.policy.remove_leavers("dist", &[addr("a")]).unwrap();
        let topology = f.policy.get_topology("dist").unwrap();
        assert_eq!(topology.topology_id, 0);
        assert!(topology.current.is_none());
        assert!(topology.pending.is_none());
        assert!(f.manager.updates().is_empty());
        assert_eq!(f.executor.submitted(), 0);
    }

    #[tokio::test]
    async fn test_merge_with_empty_list_is_noop() {
        let f = fixture(&["a"]);
        f.policy
            .init_cache_with_topologies("dist", join_info(), &[])
            .unwrap();
        assert!(f.policy.get_topology("dist").is_none());
    }

    #[tokio::test]
    async fn test_merge_with_mismatched_segments_fails() {
        let f = fixture(&["a", "b"]);
        let factory = DefaultHashFactory;
        let four = factory.create(1, 4, &addrs(&["a"])).unwrap();
        let eight = factory.create(1, 8, &addrs(&["b"])).unwrap();
        let t1 = CacheTopology::new(1, Some(four), None);
        let t2 = CacheTopology::new(2, Some(eight), None);

        let err = f
            .policy
            .init_cache_with_topologies("dist", join_info(), &[t1, t2])
            .unwrap_err();
        assert!(matches!(err, TopologyError::SegmentCountMismatch { .. }));
        // the entry exists but no topology was installed
        let topology = f.policy.get_topology("dist").unwrap();
        assert_eq!(topology.topology_id, CacheTopology::INITIAL_ID);
        assert!(f.manager.updates().is_empty());
    }

    #[tokio::test]
    async fn test_joiner_ahead_of_cluster_view() {
        let f = fixture(&["a"]);
        f.policy.init_cache("dist", join_info());
        f.policy.add_joiners("dist", &[addr("a")]).unwrap();

        // b asks to join before the view carrying it arrives
        f.policy.add_joiners("dist", &[addr("b")]).unwrap();
        f.executor.run_pending().await;
        assert!(f.manager.rebalances().is_empty());
        assert_eq!(f.policy.get_topology("dist").unwrap().topology_id, 0);

        // the view update picks the waiting joiner up
        f.policy.update_members_list(addrs(&["a", "b"]));
        f.executor.run_pending().await;
        let topology = f.policy.get_topology("dist").unwrap();
        assert_eq!(topology.topology_id, 1);
        assert_eq!(
            topology.pending.as_ref().unwrap().members(),
            addrs(&["a", "b"]).as_slice()
        );
    }

    #[tokio::test]
    async fn test_view_update_shrinks_cache() {
        let f = fixture_with_pending().await;
        f.policy.on_rebalance_completed("dist", 1).unwrap();

        f.policy.update_members_list(addrs(&["a", "c"]));
        f.executor.run_pending().await;

        let topology = f.policy.get_topology("dist").unwrap();
        // shrink preserves the id and c never joined this cache
        assert_eq!(topology.topology_id, 2);
        let current = topology.current.as_ref().unwrap();
        assert_eq!(current.members(), addrs(&["a"]).as_slice());
        assert!(current.is_balanced());
        assert!(topology.pending.is_none());
    }

    #[tokio::test]
    async fn test_view_update_isolates_cache_failures() {
        let f = fixture(&["a", "b"]);
        f.policy.init_cache(
            "bad",
            CacheJoinInfo::new("default", 2, 4, Arc::new(FailingFactory)),
        );
        f.policy.init_cache("good", join_info());
        f.policy
            .add_joiners("bad", &[addr("a"), addr("b")])
            .unwrap();
        f.policy
            .add_joiners("good", &[addr("a"), addr("b")])
            .unwrap();

        f.policy.update_members_list(addrs(&["a"]));

        // the failing cache is skipped, the healthy one still shrinks
        let good = f.policy.get_topology("good").unwrap();
        assert_eq!(
            good.current.as_ref().unwrap().members(),
            addrs(&["a"]).as_slice()
        );
        let bad = f.policy.get_topology("bad").unwrap();
        assert_eq!(
            bad.current.as_ref().unwrap().members(),
            addrs(&["a", "b"]).as_slice()
        );
    }

    #[tokio::test]
    async fn test_rebalancing_toggle_defers_work() {
        let config = PolicyConfig {
            auto_rebalance: false,
            ..Default::default()
        };
        let f = fixture_with_config(&["a", "b"], config);
        assert!(!f.policy.is_rebalancing_enabled());

        f.policy.init_cache("dist", join_info());
        f.policy.add_joiners("dist", &[addr("a")]).unwrap();
        f.policy.add_joiners("dist", &[addr("b")]).unwrap();
        assert_eq!(f.executor.submitted(), 0);

        f.policy.set_rebalancing_enabled(true);
        f.executor.run_pending().await;
        let topology = f.policy.get_topology("dist").unwrap();
        assert_eq!(topology.topology_id, 1);
        assert!(topology.pending.as_ref().unwrap().is_balanced());
    }

    #[tokio::test]
    async fn test_remove_cache_forgets_state() {
        let f = fixture(&["a"]);
        f.policy.init_cache("dist", join_info());
        f.policy.add_joiners("dist", &[addr("a")]).unwrap();
        assert_eq!(f.policy.cache_count(), 1);

        assert!(f.policy.remove_cache("dist"));
        assert!(!f.policy.remove_cache("dist"));
        assert!(f.policy.get_topology("dist").is_none());
        assert!(f.policy.add_joiners("dist", &[addr("a")]).unwrap().is_none());
    }

    #[tokio::test]
    async fn test_init_cache_is_idempotent() {
        let f = fixture(&["a"]);
        f.policy.init_cache("dist", join_info());
        f.policy.add_joiners("dist", &[addr("a")]).unwrap();
        let before = f.policy.get_topology("dist").unwrap();

        // a second registration must not reset the cache
        f.policy.init_cache("dist", join_info());
        assert_eq!(f.policy.get_topology("dist").unwrap(), before);
        assert_eq!(f.policy.cache_count(), 1);
    }

    #[tokio::test]
    async fn test_caches_are_independent() {
        let f = fixture(&["a", "b"]);
        f.policy.init_cache("dist", join_info());
        f.policy.init_cache("repl", join_info());
        f.policy.add_joiners("dist", &[addr("a")]).unwrap();
        f.policy.add_joiners("repl", &[addr("b")]).unwrap();

        let dist = f.policy.get_topology("dist").unwrap();
        let repl = f.policy.get_topology("repl").unwrap();
        assert_eq!(dist.current.unwrap().members(), addrs(&["a"]).as_slice());
        assert_eq!(repl.current.unwrap().members(), addrs(&["b"]).as_slice());
    }
}
