//! Probe executors.
//!
//! One executor task per owned check. Executors probe on the check's
//! interval (first fire jittered into `rand(0, interval)` so a fleet
//! restart doesn't stampede targets), push results through a
//! [`Debouncer`], and submit surviving transitions to the
//! [`StatusWriter`].

mod http;
mod tcp;
mod ttl;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use esm_catalog::{CheckStatus, HealthCheck, HealthCheckDefinition};
use rand::Rng;
use tokio::sync::watch;
use tokio::time::timeout;
use tracing::{debug, warn};

use crate::status::{Debouncer, StatusUpdate, StatusWriter};

pub use ttl::TtlState;

/// Fallbacks for checks registered without explicit cadence.
const DEFAULT_PROBE_INTERVAL: Duration = Duration::from_secs(10);
const DEFAULT_PROBE_TIMEOUT: Duration = Duration::from_secs(10);

/// The kinds of check this daemon can execute.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProbeKind {
    Http,
    Tcp,
    Ttl,
    /// Recognized but never executed: running commands off catalog data
    /// is not something an external monitor should do.
    Script,
}

/// Everything an executor needs to know about its check.
#[derive(Debug, Clone, PartialEq)]
pub struct CheckSpec {
    pub check_id: String,
    pub name: String,
    pub node: String,
    pub namespace: String,
    pub partition: String,
    pub service_id: String,
    pub service_name: String,
    pub kind: ProbeKind,
    pub http: String,
    pub tcp: String,
    pub interval: Duration,
    pub timeout: Duration,
    pub tls_skip_verify: bool,
    pub headers: HashMap<String, Vec<String>>,
    /// Original wire form, written back alongside status updates so the
    /// catalog entry keeps its definition.
    pub check_type: String,
    pub definition: HealthCheckDefinition,
}

impl CheckSpec {
    /// Qualified identity, unique across namespaces and nodes.
    pub fn qualified_id(&self) -> String {
        format!("{}/{}/{}", self.namespace, self.node, self.check_id)
    }

    /// Build a spec from a catalog health check. `None` for kinds this
    /// daemon does not understand at all.
    pub fn from_health_check(hc: &HealthCheck) -> Option<Self> {
        let kind = match hc.check_type.as_str() {
            "http" => ProbeKind::Http,
            "tcp" => ProbeKind::Tcp,
            "ttl" => ProbeKind::Ttl,
            "script" | "docker" => ProbeKind::Script,
            // Older catalogs leave Type empty; infer from the definition.
            "" if !hc.definition.http.is_empty() => ProbeKind::Http,
            "" if !hc.definition.tcp.is_empty() => ProbeKind::Tcp,
            _ => return None,
        };

        Some(Self {
            check_id: hc.check_id.clone(),
            name: hc.name.clone(),
            node: hc.node.clone(),
            namespace: hc.namespace.clone(),
            partition: hc.partition.clone(),
            service_id: hc.service_id.clone(),
            service_name: hc.service_name.clone(),
            kind,
            http: hc.definition.http.clone(),
            tcp: hc.definition.tcp.clone(),
            interval: hc.definition.interval().unwrap_or(DEFAULT_PROBE_INTERVAL),
            timeout: hc.definition.timeout().unwrap_or(DEFAULT_PROBE_TIMEOUT),
            tls_skip_verify: hc.definition.tls_skip_verify,
            headers: hc.definition.header.clone(),
            check_type: hc.check_type.clone(),
            definition: hc.definition.clone(),
        })
    }

    /// The health check to write back, carrying `status` and `output`.
    fn to_update(&self, status: CheckStatus, output: String) -> StatusUpdate {
        StatusUpdate {
            node: self.node.clone(),
            partition: self.partition.clone(),
            check: HealthCheck {
                node: self.node.clone(),
                check_id: self.check_id.clone(),
                name: self.name.clone(),
                status,
                output,
                service_id: self.service_id.clone(),
                service_name: self.service_name.clone(),
                check_type: self.check_type.clone(),
                namespace: self.namespace.clone(),
                partition: self.partition.clone(),
                definition: self.definition.clone(),
                ..Default::default()
            },
        }
    }
}

/// A running executor.
pub struct ExecutorHandle {
    pub spec: CheckSpec,
    cancel_tx: watch::Sender<bool>,
    task: tokio::task::JoinHandle<()>,
    ttl: Option<Arc<TtlState>>,
}

impl ExecutorHandle {
    /// Feed a fresh catalog observation to a TTL executor. No-op for
    /// active probes.
    pub fn observe(&self, hc: &HealthCheck) {
        if let Some(ttl) = &self.ttl {
            ttl.observe(hc.status, hc.modify_index);
        }
    }

    /// Cooperatively stop the executor, waiting up to `deadline` for the
    /// task to exit. A task that overstays is abandoned, not aborted.
    pub async fn cancel(self, deadline: Duration) {
        let _ = self.cancel_tx.send(true);
        match timeout(deadline, self.task).await {
            Ok(_) => {}
            Err(_) => {
                warn!(
                    check = %self.spec.qualified_id(),
                    "probe executor did not exit within cancel deadline, abandoning"
                );
            }
        }
    }
}

/// Spawn the executor task for a check.
pub fn spawn_executor(
    spec: CheckSpec,
    writer: Arc<StatusWriter>,
    shutdown: watch::Receiver<bool>,
) -> ExecutorHandle {
    let (cancel_tx, cancel_rx) = watch::channel(false);

    let ttl = match spec.kind {
        ProbeKind::Ttl => Some(Arc::new(TtlState::new())),
        _ => None,
    };

    let task = tokio::spawn(run_executor(
        spec.clone(),
        writer,
        cancel_rx,
        shutdown,
        ttl.clone(),
    ));

    ExecutorHandle {
        spec,
        cancel_tx,
        task,
        ttl,
    }
}

async fn run_executor(
    spec: CheckSpec,
    writer: Arc<StatusWriter>,
    mut cancel: watch::Receiver<bool>,
    mut shutdown: watch::Receiver<bool>,
    ttl: Option<Arc<TtlState>>,
) {
    // Stagger first fire across the interval.
    let start_delay = {
        let millis = spec.interval.as_millis().max(1) as u64;
        Duration::from_millis(rand::thread_rng().gen_range(0..millis))
    };
    if wait_or_stopped(start_delay, &mut cancel, &mut shutdown).await {
        return;
    }

    enum Prober {
        Http(http::HttpProber),
        Tcp,
        Ttl(Arc<TtlState>),
    }

    let prober = match (spec.kind, &ttl) {
        (ProbeKind::Script, _) => {
            warn!(
                check = %spec.qualified_id(),
                "script checks are not executed by this daemon, skipping"
            );
            return;
        }
        (ProbeKind::Http, _) => match http::HttpProber::new(&spec) {
            Ok(p) => Prober::Http(p),
            Err(e) => {
                warn!(check = %spec.qualified_id(), error = %e, "failed to build http prober");
                return;
            }
        },
        (ProbeKind::Tcp, _) => Prober::Tcp,
        (ProbeKind::Ttl, Some(state)) => Prober::Ttl(Arc::clone(state)),
        (ProbeKind::Ttl, None) => return,
    };

    debug!(
        check = %spec.qualified_id(),
        kind = ?spec.kind,
        interval = ?spec.interval,
        "probe executor started"
    );

    let mut debounce = Debouncer::new();
    loop {
        let result = match &prober {
            Prober::Http(p) => p.probe().await,
            Prober::Tcp => tcp::probe(&spec.tcp, spec.timeout).await,
            Prober::Ttl(state) => state.evaluate(spec.interval),
        };

        if let Some((status, output)) = result {
            if debounce.observe(status) {
                writer.submit(spec.to_update(status, output)).await;
            }
        }

        if wait_or_stopped(spec.interval, &mut cancel, &mut shutdown).await {
            return;
        }
    }
}

/// Sleep for `period`, returning early with `true` when cancelled or
/// shutting down.
async fn wait_or_stopped(
    period: Duration,
    cancel: &mut watch::Receiver<bool>,
    shutdown: &mut watch::Receiver<bool>,
) -> bool {
    let sleep = tokio::time::sleep(period);
    tokio::pin!(sleep);
    loop {
        tokio::select! {
            _ = &mut sleep => return false,
            res = cancel.changed() => {
                if res.is_err() || *cancel.borrow() {
                    return true;
                }
            }
            res = shutdown.changed() => {
                if res.is_err() || *shutdown.borrow() {
                    return true;
                }
            }
        }
    }
}
