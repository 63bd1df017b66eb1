//! Roster coordination and work sharding.
//!
//! The coordinator long-polls the catalog's service listing for this ESM
//! cluster (same service name, tag, and partition) and publishes the
//! sorted list of live instance ids on a watch channel. Consumers only
//! wake when the roster actually changes.
//!
//! Sharding is a plain consistent-ish hash: entity id → FNV-1a 64 →
//! modulo roster length. Adding or removing one instance reassigns about
//! 1/n of the entities while everything else stays put.

use std::sync::Arc;
use std::time::Duration;

use esm_catalog::{Catalog, QueryOptions};
use tokio::sync::watch;
use tracing::{debug, warn};

use crate::backoff::Backoff;
use crate::config::Config;

/// Max server-side wait for roster long-polls.
pub const LONG_POLL_WAIT: Duration = Duration::from_secs(300);

/// FNV-1a over the UTF-8 bytes of an entity id.
pub fn fnv1a64(data: &str) -> u64 {
    const OFFSET: u64 = 0xcbf2_9ce4_8422_2325;
    const PRIME: u64 = 0x0000_0100_0000_01b3;

    let mut hash = OFFSET;
    for byte in data.as_bytes() {
        hash ^= u64::from(*byte);
        hash = hash.wrapping_mul(PRIME);
    }
    hash
}

/// The instance owning `entity_id` under the given roster. `None` when
/// the roster is empty: nobody claims universal ownership while the
/// cluster looks dead.
pub fn owner<'a>(roster: &'a [String], entity_id: &str) -> Option<&'a str> {
    if roster.is_empty() {
        return None;
    }
    let idx = (fnv1a64(entity_id) % roster.len() as u64) as usize;
    Some(roster[idx].as_str())
}

/// Spawn the roster watch task. The receiver holds the latest roster;
/// an empty vec until the first successful poll.
pub fn spawn_roster_watch(
    catalog: Arc<dyn Catalog>,
    config: &Config,
    shutdown: watch::Receiver<bool>,
) -> watch::Receiver<Vec<String>> {
    let (tx, rx) = watch::channel(Vec::new());
    tokio::spawn(run(
        catalog,
        config.service.clone(),
        config.tag.clone(),
        config.query_partition().to_string(),
        tx,
        shutdown,
    ));
    rx
}

async fn run(
    catalog: Arc<dyn Catalog>,
    service: String,
    tag: String,
    partition: String,
    tx: watch::Sender<Vec<String>>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut index = 0u64;
    let mut backoff = Backoff::for_catalog();
    let prefix = format!("{service}:");

    loop {
        if *shutdown.borrow() {
            return;
        }

        let opts = QueryOptions::default()
            .with_partition(&partition)
            .blocking(index, LONG_POLL_WAIT);

        let result = tokio::select! {
            r = catalog.catalog_service(&service, &tag, &opts) => r,
            res = shutdown.changed() => {
                if res.is_err() {
                    return;
                }
                continue;
            }
        };

        match result {
            Ok((services, new_index)) => {
                backoff.reset();
                // A lower index means the catalog state was reset; start
                // from scratch rather than long-polling a stale cursor.
                index = if new_index < index { 0 } else { new_index };

                let mut roster: Vec<String> = services
                    .iter()
                    .filter_map(|s| s.service_id.strip_prefix(&prefix))
                    .map(str::to_string)
                    .collect();
                roster.sort();
                roster.dedup();

                tx.send_if_modified(|current| {
                    if *current != roster {
                        debug!(size = roster.len(), "roster changed");
                        *current = roster;
                        true
                    } else {
                        false
                    }
                });
            }
            Err(e) => {
                // Keep the last-known roster; a flaky catalog must not
                // make this instance believe it is alone.
                let delay = backoff.next_delay();
                warn!(error = %e, retry_in = ?delay, "roster poll failed");
                tokio::select! {
                    _ = tokio::time::sleep(delay) => {}
                    _ = shutdown.changed() => {}
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roster(ids: &[&str]) -> Vec<String> {
        ids.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn fnv1a64_known_vectors() {
        // Standard FNV-1a test vectors.
        assert_eq!(fnv1a64(""), 0xcbf2_9ce4_8422_2325);
        assert_eq!(fnv1a64("a"), 0xaf63_dc4c_8601_ec8c);
        assert_eq!(fnv1a64("foobar"), 0x85944171f73967e8);
    }

    #[test]
    fn empty_roster_owns_nothing() {
        assert_eq!(owner(&[], "check-1"), None);
    }

    #[test]
    fn ownership_is_deterministic() {
        let r = roster(&["esm-0", "esm-1", "esm-2"]);
        for id in ["web-http", "db-tcp", "cache-ttl"] {
            assert_eq!(owner(&r, id), owner(&r, id));
        }
    }

    #[test]
    fn every_entity_has_exactly_one_owner() {
        let r = roster(&["esm-0", "esm-1", "esm-2", "esm-3"]);
        for i in 0..200 {
            let id = format!("check-{i}");
            let who = owner(&r, &id).unwrap();
            assert_eq!(r.iter().filter(|m| m.as_str() == who).count(), 1);
        }
    }

    #[test]
    fn growing_the_roster_moves_about_one_nth() {
        let before = roster(&["esm-0", "esm-1", "esm-2", "esm-3"]);
        let after = roster(&["esm-0", "esm-1", "esm-2", "esm-3", "esm-4"]);

        let total = 1000;
        let moved = (0..total)
            .map(|i| format!("check-{i}"))
            .filter(|id| owner(&before, id) != owner(&after, id))
            .count();

        // Expected churn is total/5; allow a generous band around it.
        assert!(moved > total / 10, "moved {moved}");
        assert!(moved < total / 2, "moved {moved}");
    }

    #[test]
    fn distribution_is_roughly_even() {
        let r = roster(&["esm-0", "esm-1", "esm-2", "esm-3"]);
        let total = 2000usize;
        let mut counts = std::collections::HashMap::new();
        for i in 0..total {
            let id = format!("node-{i}/check-{i}");
            *counts.entry(owner(&r, &id).unwrap().to_string()).or_insert(0usize) += 1;
        }
        for (member, count) in counts {
            let share = count as f64 / total as f64;
            assert!((0.15..0.35).contains(&share), "{member} got {share}");
        }
    }
}
