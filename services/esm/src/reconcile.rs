//! The reconcile loop: watch catalog state, diff, dispatch probes.
//!
//! Two tasks cooperate here:
//!
//! - a check watch that long-polls the health listing (per namespace,
//!   merged) and publishes snapshots on a watch channel;
//! - the reconciler proper, which wakes on roster changes, check-list
//!   changes, or a fixed tick, computes the checks this instance owns,
//!   and converges the running executor set onto that.
//!
//! While the roster is empty or this instance's liveness is degraded, the
//! reconciler drops every probe and claims nothing: a catalog that looks
//! dead must not make one instance monitor the world.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use esm_catalog::{Catalog, HealthCheck, QueryOptions};
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::backoff::Backoff;
use crate::config::Config;
use crate::coordinator::{owner, LONG_POLL_WAIT};
use crate::error::Result;
use crate::probes::{spawn_executor, CheckSpec, ExecutorHandle};
use crate::status::{StatusWriter, EXTERNAL_NODE_CHECK_ID};

/// Service metadata marker identifying this daemon's own registrations.
pub const EXTERNAL_SOURCE_KEY: &str = "external-source";
pub const EXTERNAL_SOURCE_VALUE: &str = "consul-esm";

/// Fetch the health checks of every namespace visible to this instance,
/// merged and deduplicated. `indexes` carries per-namespace blocking
/// cursors across calls; pass `wait` to long-poll, `None` for an
/// immediate read.
pub async fn fetch_health_checks(
    catalog: &Arc<dyn Catalog>,
    config: &Config,
    indexes: &mut HashMap<String, u64>,
    wait: Option<Duration>,
) -> Result<Vec<HealthCheck>> {
    let base = QueryOptions::default().with_partition(config.query_partition());

    // A 404 means a catalog build without namespaces: poll the single
    // implicit one.
    let namespaces: Vec<String> = match catalog.namespaces(&base).await? {
        Some(list) => list.into_iter().map(|ns| ns.name).collect(),
        None => vec![String::new()],
    };

    let mut merged: Vec<HealthCheck> = Vec::new();
    let mut seen: HashSet<(String, String, String)> = HashSet::new();

    for ns in &namespaces {
        let mut opts = QueryOptions::default()
            .with_partition(config.query_partition())
            .with_namespace(ns);
        if let Some(wait) = wait {
            let index = indexes.get(ns).copied().unwrap_or(0);
            opts = opts.blocking(index, wait);
        }

        let (checks, index) = catalog.health_state("any", &opts).await?;
        let previous = indexes.insert(ns.clone(), index);
        if index < previous.unwrap_or(0) {
            // Catalog state reset; restart this namespace's cursor.
            indexes.insert(ns.clone(), 0);
        }

        for check in checks {
            let key = (
                check.namespace.clone(),
                check.node.clone(),
                check.check_id.clone(),
            );
            if seen.insert(key) {
                merged.push(check);
            }
        }
    }

    Ok(merged)
}

/// Spawn the check watch task publishing merged health-check snapshots.
pub fn spawn_check_watch(
    catalog: Arc<dyn Catalog>,
    config: Config,
    shutdown: watch::Receiver<bool>,
) -> watch::Receiver<Vec<HealthCheck>> {
    let (tx, rx) = watch::channel(Vec::new());
    tokio::spawn(run_check_watch(catalog, config, tx, shutdown));
    rx
}

async fn run_check_watch(
    catalog: Arc<dyn Catalog>,
    config: Config,
    tx: watch::Sender<Vec<HealthCheck>>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut indexes: HashMap<String, u64> = HashMap::new();
    let mut backoff = Backoff::for_catalog();

    loop {
        if *shutdown.borrow() {
            return;
        }

        // With several namespaces a full-length long-poll on each would
        // starve the rest, so shorten the wait to the reconcile cadence.
        let wait = if indexes.len() > 1 {
            config.reconcile_interval.max(Duration::from_secs(1))
        } else {
            LONG_POLL_WAIT
        };

        let result = tokio::select! {
            r = fetch_health_checks(&catalog, &config, &mut indexes, Some(wait)) => r,
            res = shutdown.changed() => {
                if res.is_err() {
                    return;
                }
                continue;
            }
        };

        match result {
            Ok(checks) => {
                backoff.reset();
                tx.send_if_modified(|current| {
                    if snapshot_key(current) != snapshot_key(&checks) {
                        *current = checks;
                        true
                    } else {
                        false
                    }
                });
            }
            Err(e) => {
                let delay = backoff.next_delay();
                warn!(error = %e, retry_in = ?delay, "check watch poll failed");
                tokio::select! {
                    _ = tokio::time::sleep(delay) => {}
                    _ = shutdown.changed() => {}
                }
            }
        }
    }
}

/// Cheap change detector over a snapshot: identity, status, definition
/// and freshness of every check.
fn snapshot_key(checks: &[HealthCheck]) -> Vec<(String, String, u64)> {
    let mut key: Vec<(String, String, u64)> = checks
        .iter()
        .map(|c| {
            (
                format!("{}/{}/{}", c.namespace, c.node, c.check_id),
                c.status.to_string(),
                c.modify_index,
            )
        })
        .collect();
    key.sort();
    key
}

pub struct Reconciler {
    catalog: Arc<dyn Catalog>,
    config: Config,
    instance_id: String,
    writer: Arc<StatusWriter>,
    healthy: Arc<AtomicBool>,
    roster_rx: watch::Receiver<Vec<String>>,
    checks_rx: watch::Receiver<Vec<HealthCheck>>,
    shutdown: watch::Receiver<bool>,
    executors: HashMap<String, ExecutorHandle>,
}

impl Reconciler {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        catalog: Arc<dyn Catalog>,
        config: Config,
        instance_id: String,
        writer: Arc<StatusWriter>,
        healthy: Arc<AtomicBool>,
        roster_rx: watch::Receiver<Vec<String>>,
        checks_rx: watch::Receiver<Vec<HealthCheck>>,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        Self {
            catalog,
            config,
            instance_id,
            writer,
            healthy,
            roster_rx,
            checks_rx,
            shutdown,
            executors: HashMap::new(),
        }
    }

    pub async fn run(mut self) {
        let mut tick = tokio::time::interval(self.config.reconcile_interval);
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        let mut roster_rx = self.roster_rx.clone();
        let mut checks_rx = self.checks_rx.clone();
        let mut shutdown = self.shutdown.clone();

        loop {
            tokio::select! {
                _ = tick.tick() => {}
                res = roster_rx.changed() => {
                    if res.is_err() {
                        break;
                    }
                }
                res = checks_rx.changed() => {
                    if res.is_err() {
                        break;
                    }
                }
                res = shutdown.changed() => {
                    if res.is_err() {
                        break;
                    }
                }
            }
            if *shutdown.borrow() {
                break;
            }

            let roster = roster_rx.borrow().clone();
            if roster.is_empty() || !self.healthy.load(Ordering::Acquire) {
                if !self.executors.is_empty() {
                    info!(
                        paused_probes = self.executors.len(),
                        roster_empty = roster.is_empty(),
                        "pausing reconciliation"
                    );
                    self.drain().await;
                }
                continue;
            }

            let checks = checks_rx.borrow().clone();
            match self.desired_checks(&roster, checks).await {
                Ok(desired) => self.apply(desired).await,
                Err(e) => {
                    // Keep the current probe set; a flaky read is not a
                    // reason to drop monitoring.
                    warn!(error = %e, "reconcile fetch failed");
                }
            }
        }

        self.drain().await;
    }

    /// The subset of catalog checks this instance owns, as executor
    /// specs, keyed by qualified id.
    async fn desired_checks(
        &self,
        roster: &[String],
        checks: Vec<HealthCheck>,
    ) -> Result<HashMap<String, (CheckSpec, HealthCheck)>> {
        let opts = QueryOptions::default().with_partition(self.config.query_partition());
        let (nodes, _) = self.catalog.catalog_nodes(&self.config.node_meta, &opts).await?;

        let external_nodes: HashSet<&str> = nodes
            .iter()
            .filter(|n| {
                n.meta.get(EXTERNAL_SOURCE_KEY).map(String::as_str) != Some(EXTERNAL_SOURCE_VALUE)
            })
            .map(|n| n.node.as_str())
            .collect();

        let mut desired = HashMap::new();
        for check in checks {
            if !external_nodes.contains(check.node.as_str()) {
                continue;
            }
            // Skip bookkeeping checks this daemon writes itself.
            if check.check_id == EXTERNAL_NODE_CHECK_ID
                || check.service_name == self.config.service
            {
                continue;
            }
            if owner(roster, &check.check_id) != Some(self.instance_id.as_str()) {
                continue;
            }
            let Some(spec) = CheckSpec::from_health_check(&check) else {
                debug!(
                    check_id = %check.check_id,
                    check_type = %check.check_type,
                    "ignoring check of unsupported type"
                );
                continue;
            };
            desired.insert(spec.qualified_id(), (spec, check));
        }
        Ok(desired)
    }

    /// Converge running executors onto the desired set.
    async fn apply(&mut self, desired: HashMap<String, (CheckSpec, HealthCheck)>) {
        let stale: Vec<String> = self
            .executors
            .keys()
            .filter(|id| !desired.contains_key(*id))
            .cloned()
            .collect();
        for id in stale {
            if let Some(handle) = self.executors.remove(&id) {
                debug!(check = %id, "stopping probe (no longer owned)");
                handle.cancel(self.config.probe_cancel_timeout).await;
                self.writer.tracker().forget(&id).await;
            }
        }

        for (id, (spec, check)) in desired {
            match self.executors.get(&id) {
                Some(handle) if handle.spec == spec => {
                    handle.observe(&check);
                }
                Some(_) => {
                    // Definition changed under us; restart the executor.
                    if let Some(handle) = self.executors.remove(&id) {
                        debug!(check = %id, "restarting probe (definition changed)");
                        handle.cancel(self.config.probe_cancel_timeout).await;
                    }
                    self.start(id, spec, &check);
                }
                None => {
                    self.start(id, spec, &check);
                }
            }
        }
    }

    fn start(&mut self, id: String, spec: CheckSpec, check: &HealthCheck) {
        debug!(check = %id, kind = ?spec.kind, "starting probe");
        let handle = spawn_executor(spec, Arc::clone(&self.writer), self.shutdown.clone());
        handle.observe(check);
        self.executors.insert(id, handle);
    }

    async fn drain(&mut self) {
        for (_, handle) in self.executors.drain() {
            handle.cancel(self.config.probe_cancel_timeout).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use esm_catalog::CheckStatus;

    fn check(ns: &str, node: &str, id: &str, status: CheckStatus) -> HealthCheck {
        HealthCheck {
            namespace: ns.to_string(),
            node: node.to_string(),
            check_id: id.to_string(),
            status,
            ..Default::default()
        }
    }

    #[test]
    fn snapshot_key_is_order_insensitive() {
        let a = vec![
            check("", "n1", "c1", CheckStatus::Passing),
            check("", "n2", "c2", CheckStatus::Critical),
        ];
        let b = vec![
            check("", "n2", "c2", CheckStatus::Critical),
            check("", "n1", "c1", CheckStatus::Passing),
        ];
        assert_eq!(snapshot_key(&a), snapshot_key(&b));
    }

    #[test]
    fn snapshot_key_sees_status_changes() {
        let a = vec![check("", "n1", "c1", CheckStatus::Passing)];
        let b = vec![check("", "n1", "c1", CheckStatus::Critical)];
        assert_ne!(snapshot_key(&a), snapshot_key(&b));
    }
}
