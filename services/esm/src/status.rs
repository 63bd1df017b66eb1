//! Status debouncing and catalog writeback.
//!
//! Probe results flow through two gates before touching the catalog:
//!
//! 1. [`Debouncer`] (one per executor) drops transient blips that return
//!    to the prior status within one probe interval. passing↔critical
//!    flips always pass through immediately.
//! 2. [`StatusWriter`] suppresses redundant same-status writes via the
//!    [`StatusTracker`] predicate, then performs the writes. Writes are
//!    serialized per check and parallel across checks, capped by a global
//!    semaphore to bound catalog load.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use esm_catalog::{Catalog, CatalogRegistration, CheckStatus, HealthCheck, QueryOptions};
use tokio::sync::{mpsc, watch, Mutex, Semaphore};
use tracing::{debug, warn};

/// Node-level check written for external nodes based on reachability.
pub const EXTERNAL_NODE_CHECK_ID: &str = "externalNodeHealth";
pub const EXTERNAL_NODE_CHECK_NAME: &str = "External Node Status";

/// A status we last wrote for some entity, and when.
#[derive(Debug, Clone)]
pub struct LastKnownStatus {
    pub status: String,
    pub time: Instant,
}

impl LastKnownStatus {
    pub fn new(status: &str) -> Self {
        Self {
            status: status.to_string(),
            time: Instant::now(),
        }
    }

    /// True once the record is older than `ttl`.
    pub fn is_expired(&self, ttl: Duration, now: Instant) -> bool {
        now.duration_since(self.time) > ttl
    }
}

/// Cache of last-written statuses keyed by entity (node name or
/// qualified check id). Guards against rewriting an unchanged status
/// more than once per refresh interval.
pub struct StatusTracker {
    known: Mutex<HashMap<String, LastKnownStatus>>,
    refresh_interval: Duration,
}

impl StatusTracker {
    pub fn new(refresh_interval: Duration) -> Self {
        Self {
            known: Mutex::new(HashMap::new()),
            refresh_interval,
        }
    }

    /// Whether a write of `status` for `key` should go to the catalog:
    /// yes when the status differs, the record is stale, or the entity
    /// was never seen.
    pub async fn should_update(&self, key: &str, status: &str) -> bool {
        let known = self.known.lock().await;
        match known.get(key) {
            Some(last) => {
                last.status != status || last.is_expired(self.refresh_interval, Instant::now())
            }
            None => true,
        }
    }

    /// Record a successful write.
    pub async fn record(&self, key: &str, status: &str) {
        let mut known = self.known.lock().await;
        known.insert(key.to_string(), LastKnownStatus::new(status));
    }

    /// Drop an entity from the cache (node or check went away).
    pub async fn forget(&self, key: &str) {
        self.known.lock().await.remove(key);
    }
}

/// Per-executor transition filter.
///
/// `observe` is called once per probe with the fresh result; the return
/// value says whether the observation should be forwarded to the writer.
#[derive(Debug)]
pub struct Debouncer {
    last: Option<CheckStatus>,
    pending: Option<CheckStatus>,
}

impl Debouncer {
    pub fn new() -> Self {
        Self {
            last: None,
            pending: None,
        }
    }

    pub fn observe(&mut self, status: CheckStatus) -> bool {
        let Some(last) = self.last else {
            // First result for this check always goes out.
            self.last = Some(status);
            return true;
        };

        if status == last {
            // Back to (or still at) the forwarded status. Any pending
            // transition was a blip.
            self.pending = None;
            return true;
        }

        let hard_flip = matches!(
            (last, status),
            (CheckStatus::Passing, CheckStatus::Critical)
                | (CheckStatus::Critical, CheckStatus::Passing)
        );
        if hard_flip {
            self.last = Some(status);
            self.pending = None;
            return true;
        }

        // Softer transition (warning/unknown involved): require two
        // consecutive observations before forwarding.
        if self.pending == Some(status) {
            self.last = Some(status);
            self.pending = None;
            return true;
        }
        self.pending = Some(status);
        false
    }
}

/// One catalog writeback.
#[derive(Debug, Clone)]
pub struct StatusUpdate {
    /// Node the check lives on.
    pub node: String,
    /// Check to write, with its new status and output filled in.
    pub check: HealthCheck,
    /// Partition for the registration body, verbatim.
    pub partition: String,
}

impl StatusUpdate {
    /// Tracker key: one write lane per (namespace, node, check).
    fn key(&self) -> String {
        format!(
            "{}/{}/{}",
            self.check.namespace, self.node, self.check.check_id
        )
    }
}

/// The writeback stage: predicate-gated, per-check serialized, globally
/// capped catalog writes.
pub struct StatusWriter {
    catalog: Arc<dyn Catalog>,
    tracker: StatusTracker,
    permits: Arc<Semaphore>,
    lanes: Mutex<HashMap<String, mpsc::Sender<StatusUpdate>>>,
    shutdown: watch::Receiver<bool>,
}

impl StatusWriter {
    pub fn new(
        catalog: Arc<dyn Catalog>,
        refresh_interval: Duration,
        concurrency: usize,
        shutdown: watch::Receiver<bool>,
    ) -> Arc<Self> {
        Arc::new(Self {
            catalog,
            tracker: StatusTracker::new(refresh_interval),
            permits: Arc::new(Semaphore::new(concurrency.max(1))),
            lanes: Mutex::new(HashMap::new()),
            shutdown,
        })
    }

    pub fn tracker(&self) -> &StatusTracker {
        &self.tracker
    }

    /// Queue a check-status writeback. Redundant updates are dropped by
    /// the tracker predicate.
    pub async fn submit(self: &Arc<Self>, update: StatusUpdate) {
        let key = update.key();
        if !self
            .tracker
            .should_update(&key, update.check.status.as_str())
            .await
        {
            return;
        }

        let tx = self.lane(&key).await;
        if tx.send(update).await.is_err() {
            debug!(key = %key, "write lane closed, dropping update");
        }
    }

    /// Queue a node-level reachability status write.
    pub async fn submit_node_health(
        self: &Arc<Self>,
        node: &str,
        namespace: &str,
        partition: &str,
        status: CheckStatus,
        output: &str,
    ) {
        if !self.tracker.should_update(node, status.as_str()).await {
            return;
        }

        let check = HealthCheck {
            node: node.to_string(),
            check_id: EXTERNAL_NODE_CHECK_ID.to_string(),
            name: EXTERNAL_NODE_CHECK_NAME.to_string(),
            status,
            output: output.to_string(),
            namespace: namespace.to_string(),
            ..Default::default()
        };
        let update = StatusUpdate {
            node: node.to_string(),
            check,
            partition: partition.to_string(),
        };

        // Node health shares the write path but is tracked under the
        // bare node name.
        let tx = self.lane(node).await;
        if tx.send(update).await.is_err() {
            debug!(node = %node, "write lane closed, dropping node health update");
        }
    }

    /// Get or create the serialized write lane for a key.
    async fn lane(self: &Arc<Self>, key: &str) -> mpsc::Sender<StatusUpdate> {
        let mut lanes = self.lanes.lock().await;
        if let Some(tx) = lanes.get(key) {
            if !tx.is_closed() {
                return tx.clone();
            }
        }

        let (tx, rx) = mpsc::channel(8);
        lanes.insert(key.to_string(), tx.clone());

        let writer = Arc::clone(self);
        let key = key.to_string();
        tokio::spawn(async move {
            writer.run_lane(key, rx).await;
        });
        tx
    }

    async fn run_lane(self: Arc<Self>, key: String, mut rx: mpsc::Receiver<StatusUpdate>) {
        let mut shutdown = self.shutdown.clone();
        loop {
            let update = tokio::select! {
                u = rx.recv() => match u {
                    Some(u) => u,
                    None => break,
                },
                res = shutdown.changed() => {
                    if res.is_err() || *shutdown.borrow() {
                        break;
                    }
                    continue;
                }
            };

            let permit = match Arc::clone(&self.permits).acquire_owned().await {
                Ok(p) => p,
                Err(_) => break,
            };
            self.write(&key, update).await;
            drop(permit);
        }
    }

    async fn write(&self, key: &str, update: StatusUpdate) {
        let status = update.check.status;
        let opts = QueryOptions::default()
            .with_partition(&update.partition)
            .with_namespace(&update.check.namespace);
        let reg = CatalogRegistration {
            node: update.node.clone(),
            skip_node_update: true,
            checks: vec![update.check],
            partition: update.partition.clone(),
            ..Default::default()
        };

        match self.catalog.catalog_register(&reg, &opts).await {
            Ok(()) => {
                debug!(key = %key, status = %status, "wrote check status");
                self.tracker.record(key, status.as_str()).await;
            }
            Err(e) if e.is_transient() => {
                // Next probe cycle retries; the tracker was not updated
                // so the write is not suppressed.
                warn!(key = %key, error = %e, "transient failure writing status");
            }
            Err(e) => {
                warn!(key = %key, error = %e, "failed to write status");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn last_known_status_expiry() {
        let cases = [
            // (age, ttl, expired)
            (Duration::from_secs(5 * 60), Duration::from_secs(3600), false),
            (Duration::from_secs(3600), Duration::from_secs(5 * 60), true),
        ];
        for (age, ttl, expected) in cases {
            let last = LastKnownStatus {
                status: "healthy".to_string(),
                time: Instant::now() - age,
            };
            assert_eq!(
                last.is_expired(ttl, Instant::now()),
                expected,
                "age {age:?} ttl {ttl:?}"
            );
        }
    }

    #[tokio::test]
    async fn should_update_predicate() {
        struct Case {
            scenario: &'static str,
            node: &'static str,
            status: &'static str,
            refresh_interval: Duration,
            expected: bool,
        }
        let cases = [
            Case {
                scenario: "existing node, fresh record, same status",
                node: "existing",
                status: "healthy",
                refresh_interval: Duration::from_secs(3600),
                expected: false,
            },
            Case {
                scenario: "existing node, expired record, same status",
                node: "existing",
                status: "healthy",
                refresh_interval: Duration::ZERO,
                expected: true,
            },
            Case {
                scenario: "existing node, fresh record, different status",
                node: "existing",
                status: "critical",
                refresh_interval: Duration::from_secs(3600),
                expected: true,
            },
            Case {
                scenario: "unknown node",
                node: "new node",
                status: "critical",
                refresh_interval: Duration::ZERO,
                expected: true,
            },
        ];

        for case in cases {
            let tracker = StatusTracker::new(case.refresh_interval);
            tracker.record("existing", "healthy").await;
            assert_eq!(
                tracker.should_update(case.node, case.status).await,
                case.expected,
                "{}",
                case.scenario
            );
        }
    }

    #[test]
    fn debouncer_first_result_emits() {
        let mut d = Debouncer::new();
        assert!(d.observe(CheckStatus::Passing));
    }

    #[test]
    fn debouncer_hard_flips_emit_immediately() {
        let mut d = Debouncer::new();
        assert!(d.observe(CheckStatus::Passing));
        assert!(d.observe(CheckStatus::Critical));
        assert!(d.observe(CheckStatus::Passing));
    }

    #[test]
    fn debouncer_drops_warning_blip() {
        let mut d = Debouncer::new();
        assert!(d.observe(CheckStatus::Passing));
        // One-off warning is held back...
        assert!(!d.observe(CheckStatus::Warning));
        // ...and dropped when the next probe returns to passing.
        assert!(d.observe(CheckStatus::Passing));
        // A repeated warning is forwarded.
        assert!(!d.observe(CheckStatus::Warning));
        assert!(d.observe(CheckStatus::Warning));
    }

    #[test]
    fn debouncer_same_status_keeps_emitting() {
        // Rate limiting same-status writes is the tracker's job, not the
        // debouncer's.
        let mut d = Debouncer::new();
        assert!(d.observe(CheckStatus::Critical));
        assert!(d.observe(CheckStatus::Critical));
    }
}
