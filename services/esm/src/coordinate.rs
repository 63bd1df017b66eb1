//! Coordinate updates and node reachability.
//!
//! On a fixed cadence the updater pings every owned external node with a
//! UDP sample and posts a network coordinate derived from the measured
//! round trip. Everything here is best-effort: a failed ping or POST
//! never feeds back into check statuses. Reachability does drive the
//! node-level health check, with the same write suppression as every
//! other status: a node unreachable for longer than
//! `node_reconnect_timeout` is written critical.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use esm_catalog::{Catalog, CheckStatus, Coord, CoordinateEntry, QueryOptions};
use tokio::net::UdpSocket;
use tokio::sync::watch;
use tokio::time::timeout;
use tracing::{debug, warn};

use crate::config::Config;
use crate::coordinator::owner;
use crate::reconcile::{EXTERNAL_SOURCE_KEY, EXTERNAL_SOURCE_VALUE};
use crate::status::StatusWriter;

/// UDP echo port used for RTT sampling. Hosts without an echo responder
/// still prove liveness through the ICMP port-unreachable reply, which
/// surfaces as a fast receive error.
const PING_PORT: u16 = 7;

const PING_PAYLOAD: &[u8] = b"consul-esm-ping";

const PING_TIMEOUT: Duration = Duration::from_secs(1);

pub struct CoordinateUpdater {
    catalog: Arc<dyn Catalog>,
    config: Config,
    instance_id: String,
    writer: Arc<StatusWriter>,
    roster_rx: watch::Receiver<Vec<String>>,
    shutdown: watch::Receiver<bool>,
    coords: HashMap<String, Coord>,
    failing_since: HashMap<String, Instant>,
}

impl CoordinateUpdater {
    pub fn spawn(
        catalog: Arc<dyn Catalog>,
        config: Config,
        instance_id: String,
        writer: Arc<StatusWriter>,
        roster_rx: watch::Receiver<Vec<String>>,
        shutdown: watch::Receiver<bool>,
    ) -> tokio::task::JoinHandle<()> {
        let updater = Self {
            catalog,
            config,
            instance_id,
            writer,
            roster_rx,
            shutdown,
            coords: HashMap::new(),
            failing_since: HashMap::new(),
        };
        tokio::spawn(updater.run())
    }

    async fn run(mut self) {
        let mut tick = tokio::time::interval(self.config.coordinate_update_interval);
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        let mut shutdown = self.shutdown.clone();

        loop {
            tokio::select! {
                _ = tick.tick() => {}
                res = shutdown.changed() => {
                    if res.is_err() {
                        return;
                    }
                }
            }
            if *shutdown.borrow() {
                return;
            }
            self.cycle().await;
        }
    }

    async fn cycle(&mut self) {
        let roster = self.roster_rx.borrow().clone();
        if roster.is_empty() {
            return;
        }

        let opts = QueryOptions::default().with_partition(self.config.query_partition());
        let nodes = match self.catalog.catalog_nodes(&self.config.node_meta, &opts).await {
            Ok((nodes, _)) => nodes,
            Err(e) => {
                debug!(error = %e, "node listing for coordinate pass failed");
                return;
            }
        };

        let owned: Vec<_> = nodes
            .into_iter()
            .filter(|n| {
                n.meta.get(EXTERNAL_SOURCE_KEY).map(String::as_str) != Some(EXTERNAL_SOURCE_VALUE)
            })
            .filter(|n| owner(&roster, &n.node) == Some(self.instance_id.as_str()))
            .collect();

        // Ping in parallel, process serially.
        let mut samples = Vec::with_capacity(owned.len());
        for node in owned {
            let address = node.address.clone();
            let task = tokio::spawn(async move { ping(&address).await });
            samples.push((node, task));
        }

        let owned_names: Vec<String> = samples.iter().map(|(n, _)| n.node.clone()).collect();
        for (node, task) in samples {
            let rtt = task.await.ok().flatten();
            match rtt {
                Some(rtt) => {
                    self.failing_since.remove(&node.node);
                    self.writer
                        .submit_node_health(
                            &node.node,
                            "",
                            self.config.partition_or_empty(),
                            CheckStatus::Passing,
                            "Node alive or reachable",
                        )
                        .await;
                    self.post_coordinate(&node.node, rtt).await;
                }
                None => {
                    let since = self
                        .failing_since
                        .entry(node.node.clone())
                        .or_insert_with(Instant::now);
                    let down_for = since.elapsed();
                    if down_for > self.config.node_reconnect_timeout {
                        self.writer
                            .submit_node_health(
                                &node.node,
                                "",
                                self.config.partition_or_empty(),
                                CheckStatus::Critical,
                                "Node not live or unreachable",
                            )
                            .await;
                    } else {
                        debug!(node = %node.node, down_for = ?down_for, "node unreachable");
                    }
                }
            }
        }

        // Forget nodes that moved to another instance or left the
        // catalog.
        self.coords.retain(|name, _| owned_names.contains(name));
        self.failing_since.retain(|name, _| owned_names.contains(name));
    }

    async fn post_coordinate(&mut self, node: &str, rtt: Duration) {
        let coord = self.coords.entry(node.to_string()).or_default();

        // Without peer coordinates a full force-model update is not
        // computable from one vantage point; model the node as pure
        // height (latency dominated by its access link), smoothed across
        // samples.
        let sample_height = (rtt.as_secs_f64() / 2.0).max(1.0e-5);
        coord.height = 0.75 * coord.height + 0.25 * sample_height;
        coord.error = (coord.error * 0.96).max(0.1);

        let entry = CoordinateEntry {
            node: node.to_string(),
            partition: self.config.partition_or_empty().to_string(),
            coord: coord.clone(),
        };
        let opts = QueryOptions::default().with_partition(self.config.query_partition());
        if let Err(e) = self.catalog.coordinate_update(&entry, &opts).await {
            if e.is_transient() {
                debug!(node = %node, error = %e, "coordinate update failed");
            } else {
                warn!(node = %node, error = %e, "coordinate update rejected");
            }
        }
    }
}

/// One UDP RTT sample against `address`. `None` means no evidence of
/// life within the timeout. A receive error counts as alive: it is the
/// kernel surfacing the host's port-unreachable reply.
async fn ping(address: &str) -> Option<Duration> {
    let socket = UdpSocket::bind("0.0.0.0:0").await.ok()?;
    socket.connect((address, PING_PORT)).await.ok()?;

    let started = Instant::now();
    socket.send(PING_PAYLOAD).await.ok()?;

    let mut buf = [0u8; 64];
    match timeout(PING_TIMEOUT, socket.recv(&mut buf)).await {
        Ok(Ok(_)) => Some(started.elapsed()),
        Ok(Err(_)) => Some(started.elapsed()),
        Err(_) => None,
    }
}
