//! Topology observability metrics
//!
//! Prometheus-compatible metrics for the rebalance policy: trigger and
//! completion counters, per-cache topology ids, and the size of the cache
//! registry.

/// Record a rebalance trigger for a cache
pub fn record_rebalance_trigger(cache: &str) {
    metrics::counter!(
        "lattice_rebalance_triggers_total",
        "cache" => cache.to_string(),
    )
    .increment(1);
}

/// Record the start of a cluster-wide rebalance
pub fn record_rebalance_start(cache: &str, topology_id: i64) {
    metrics::counter!(
        "lattice_rebalance_started_total",
        "cache" => cache.to_string(),
    )
    .increment(1);

    metrics::gauge!(
        "lattice_rebalance_topology_id",
        "cache" => cache.to_string(),
    )
    .set(topology_id as f64);
}

/// Record a confirmed rebalance completion
pub fn record_rebalance_completed(cache: &str) {
    metrics::counter!(
        "lattice_rebalance_completed_total",
        "cache" => cache.to_string(),
    )
    .increment(1);
}

/// Record a failed rebalance step
pub fn record_rebalance_error(cache: &str, error_type: &str) {
    metrics::counter!(
        "lattice_rebalance_errors_total",
        "cache" => cache.to_string(),
        "error_type" => error_type.to_string(),
    )
    .increment(1);
}

/// Record a failed per-cache reconciliation during a cluster view update
pub fn record_members_update_error(cache: &str, error_type: &str) {
    metrics::counter!(
        "lattice_members_update_errors_total",
        "cache" => cache.to_string(),
        "error_type" => error_type.to_string(),
    )
    .increment(1);
}

/// Record a topology installation and expose its id
pub fn record_topology_install(cache: &str, topology_id: i64) {
    metrics::counter!(
        "lattice_topology_installs_total",
        "cache" => cache.to_string(),
    )
    .increment(1);

    metrics::gauge!(
        "lattice_topology_id",
        "cache" => cache.to_string(),
    )
    .set(topology_id as f64);
}

/// Record a partition-merge union install
pub fn record_topology_merge(cache: &str, partitions: usize) {
    metrics::counter!(
        "lattice_topology_merges_total",
        "cache" => cache.to_string(),
    )
    .increment(1);

    metrics::histogram!("lattice_topology_merge_partitions").record(partitions as f64);
}

/// Record a rebalance confirmation that did not match the outstanding id
pub fn record_stale_confirmation(cache: &str) {
    metrics::counter!(
        "lattice_stale_confirmations_total",
        "cache" => cache.to_string(),
    )
    .increment(1);
}

/// Update the registered-cache gauge
pub fn update_cache_count(count: usize) {
    metrics::gauge!("lattice_caches_registered").set(count as f64);
}
