//! The ESM instance: registration, liveness, lifecycle.
//!
//! One `Agent` is one member of the ESM cluster. `run` registers the
//! instance with the catalog, keeps it alive (TTL check and session
//! renewals), spins up the coordination and probing machinery, and tears
//! everything down again on shutdown.
//!
//! With a local catalog agent, the service and its TTL check are
//! registered through the agent API. In agentless mode the instance
//! fabricates a virtual catalog node (`agentless:<instance_id>`)
//! registered directly through the catalog API; a node session bound to
//! the liveness check makes the catalog garbage-collect the node if this
//! process dies.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use esm_catalog::{
    AgentCheckRegistration, AgentService, AgentServiceRegistration, Catalog,
    CatalogDeregistration, CatalogRegistration, CheckStatus, HealthCheck, QueryOptions,
    SessionBehavior, SessionEntry,
};
use serde::Serialize;
use tokio::sync::{mpsc, watch};
use tokio::time::timeout;
use tracing::{debug, error, info, warn};

use crate::backoff::Backoff;
use crate::config::Config;
use crate::coordinate::CoordinateUpdater;
use crate::coordinator;
use crate::error::{EsmError, Result};
use crate::reconcile::{self, Reconciler, EXTERNAL_SOURCE_KEY, EXTERNAL_SOURCE_VALUE};
use crate::status::StatusWriter;

/// Display name of the instance liveness check.
pub const TTL_CHECK_NAME: &str = "Consul External Service Monitor Alive";

/// KV prefix for per-instance lock entries.
const KV_LOCK_PREFIX: &str = "consul-esm/agents/";

/// Node-meta key that seeds the virtual node's check status.
const INITIAL_HEALTH_META: &str = "initial-health";

/// Consecutive renewal failures before the instance degrades itself, and
/// before a session is presumed gone.
const RENEWAL_FAILURE_LIMIT: u32 = 3;

/// Attempts at re-acquiring a lost session before giving up for good.
const SESSION_REACQUIRE_LIMIT: u32 = 3;

/// How long we poll for catalog convergence after deregistering.
const DEREGISTER_SETTLE: Duration = Duration::from_secs(5);

/// Contents of the per-instance KV lock entry.
#[derive(Debug, Serialize)]
struct InstanceLock<'a> {
    instance_id: &'a str,
    started_at: String,
    version: &'static str,
}

/// What `register` produced and `teardown` must undo.
#[derive(Debug, Clone)]
struct Registration {
    /// Catalog node our sessions live on: the local agent's node, or the
    /// virtual node in agentless mode.
    node: String,
    service_session: String,
    node_session: Option<String>,
}

#[derive(Clone)]
pub struct Agent {
    config: Arc<Config>,
    catalog: Arc<dyn Catalog>,
    id: String,
    shutdown_tx: watch::Sender<bool>,
    ready_tx: watch::Sender<bool>,
    /// Cleared after repeated renewal failures; the reconciler pauses
    /// new assignments while this is false.
    healthy: Arc<AtomicBool>,
}

impl Agent {
    pub fn new(config: Config, catalog: Arc<dyn Catalog>) -> Result<Self> {
        let id = if config.instance_id.is_empty() {
            crate::config::derive_instance_id()
        } else {
            config.instance_id.clone()
        };

        let (shutdown_tx, _) = watch::channel(false);
        let (ready_tx, _) = watch::channel(false);

        Ok(Self {
            config: Arc::new(config),
            catalog,
            id,
            shutdown_tx,
            ready_tx,
            healthy: Arc::new(AtomicBool::new(true)),
        })
    }

    /// This instance's id within the cluster.
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn catalog(&self) -> &Arc<dyn Catalog> {
        &self.catalog
    }

    /// Unique service registration id: `<service>:<instance_id>`.
    pub fn service_id(&self) -> String {
        format!("{}:{}", self.config.service, self.id)
    }

    /// Id of the liveness TTL check.
    pub fn ttl_check_id(&self) -> String {
        format!("{}:agent-ttl", self.service_id())
    }

    /// Id of the virtual node in agentless mode.
    pub fn agentless_node_id(&self) -> String {
        format!("agentless:{}", self.id)
    }

    /// Name of the node session guarding the virtual node.
    pub fn agentless_session_name(&self) -> String {
        format!("{}:agentless-session", self.service_id())
    }

    /// Name of the service session holding the instance lock.
    pub fn service_session_name(&self) -> String {
        format!("{}:session", self.service_id())
    }

    /// KV key of the per-instance lock entry.
    pub fn kv_lock_key(&self) -> String {
        format!("{}{}", KV_LOCK_PREFIX, self.service_id())
    }

    /// Observers are woken once startup registration completed.
    pub fn ready(&self) -> watch::Receiver<bool> {
        self.ready_tx.subscribe()
    }

    pub fn is_healthy(&self) -> bool {
        self.healthy.load(Ordering::Acquire)
    }

    /// Request a graceful stop. Idempotent; safe from any task.
    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
    }

    fn query_opts(&self) -> QueryOptions {
        QueryOptions::default().with_partition(self.config.query_partition())
    }

    /// Run the instance until shutdown or a fatal error.
    pub async fn run(&self) -> Result<()> {
        let registration = self.register(None).await?;
        info!(
            service_id = %self.service_id(),
            node = %registration.node,
            agentless = self.config.enable_agentless,
            "instance registered"
        );

        let (fatal_tx, mut fatal_rx) = mpsc::channel::<EsmError>(1);
        let shutdown = self.shutdown_tx.subscribe();
        let mut tasks: Vec<(&'static str, tokio::task::JoinHandle<()>)> = Vec::new();

        // Liveness.
        {
            let agent = self.clone();
            let reg = registration.clone();
            let fatal = fatal_tx.clone();
            tasks.push((
                "session-keeper",
                tokio::spawn(async move { agent.run_session_keeper(reg, fatal).await }),
            ));
        }
        if !self.config.enable_agentless {
            let agent = self.clone();
            tasks.push((
                "ttl-renewal",
                tokio::spawn(async move { agent.run_ttl_renewal().await }),
            ));
        }
        {
            let agent = self.clone();
            tasks.push((
                "registration-watch",
                tokio::spawn(async move { agent.run_registration_watch().await }),
            ));
        }

        // Coordination and probing.
        let roster_rx = coordinator::spawn_roster_watch(
            Arc::clone(&self.catalog),
            &self.config,
            shutdown.clone(),
        );
        let checks_rx = reconcile::spawn_check_watch(
            Arc::clone(&self.catalog),
            (*self.config).clone(),
            shutdown.clone(),
        );
        let writer = StatusWriter::new(
            Arc::clone(&self.catalog),
            self.config.node_health_refresh_interval,
            self.config.writeback_concurrency,
            shutdown.clone(),
        );

        let reconciler = Reconciler::new(
            Arc::clone(&self.catalog),
            (*self.config).clone(),
            self.id.clone(),
            Arc::clone(&writer),
            Arc::clone(&self.healthy),
            roster_rx.clone(),
            checks_rx,
            shutdown.clone(),
        );
        tasks.push(("reconciler", tokio::spawn(reconciler.run())));

        if self.config.disable_coordinate_updates {
            info!("coordinate updates disabled");
        } else {
            tasks.push((
                "coordinate-updater",
                CoordinateUpdater::spawn(
                    Arc::clone(&self.catalog),
                    (*self.config).clone(),
                    self.id.clone(),
                    writer,
                    roster_rx,
                    shutdown.clone(),
                ),
            ));
        }

        let _ = self.ready_tx.send(true);
        info!(instance_id = %self.id, "instance running");

        // Park until something ends the party.
        let mut shutdown_rx = shutdown.clone();
        let result = tokio::select! {
            _ = wait_for_true(&mut shutdown_rx) => Ok(()),
            err = fatal_rx.recv() => match err {
                Some(err) => Err(err),
                None => Ok(()),
            },
        };

        let _ = self.shutdown_tx.send(true);
        self.teardown(&registration).await;

        for (name, task) in tasks {
            if timeout(self.config.probe_cancel_timeout, task).await.is_err() {
                warn!(task = name, "task did not stop in time, abandoning");
            }
        }

        if let Err(e) = &result {
            error!(error = %e, "instance run failed");
        }
        result
    }

    /// Register this instance with the catalog: duplicate preflight,
    /// service + TTL check, session(s), instance lock.
    ///
    /// `previous_session` is set on re-registration after a session loss
    /// so our own stale lock is not mistaken for a competing instance.
    async fn register(&self, previous_session: Option<&str>) -> Result<Registration> {
        let opts = self.query_opts();

        // Preflight: look for a service already registered under our id,
        // on the local agent or (agentless) on the catalog.
        let service_present = if self.config.enable_agentless {
            let (services, _) = self
                .catalog
                .catalog_service(&self.config.service, &self.config.tag, &opts)
                .await?;
            services.iter().any(|s| s.service_id == self.service_id())
        } else {
            self.catalog
                .agent_service(&self.service_id(), &opts)
                .await?
                .is_some()
        };

        // The instance lock tells a live holder from a leftover
        // registration: a registration whose lock session expired is
        // fair game for takeover.
        if let Some(pair) = self.catalog.kv_get(&self.kv_lock_key(), &opts).await? {
            if !pair.session.is_empty() {
                if previous_session == Some(pair.session.as_str()) {
                    debug!(session = %pair.session, "releasing our stale instance lock");
                    let _ = self.catalog.session_destroy(&pair.session, &opts).await;
                } else if service_present {
                    return Err(EsmError::AlreadyExists(format!(
                        "an instance with id {:?} is already registered and alive",
                        self.id
                    )));
                }
                // A held lock without a service registration loses at
                // the kv_acquire below instead.
            }
        }

        let node = if self.config.enable_agentless {
            self.register_virtual_node().await?;
            self.agentless_node_id()
        } else {
            self.register_agent_service().await?;
            let info = self.catalog.agent_self(&opts).await?;
            if info.config.node_name.is_empty() {
                return Err(EsmError::Fatal(
                    "local agent did not report a node name".to_string(),
                ));
            }
            info.config.node_name
        };

        let node_session = if self.config.enable_agentless {
            Some(self.create_session(&node, &self.agentless_session_name()).await?)
        } else {
            None
        };
        let service_session = self.create_session(&node, &self.service_session_name()).await?;

        // Take the instance lock under the service session.
        let lock = InstanceLock {
            instance_id: &self.id,
            started_at: humantime::format_rfc3339_seconds(SystemTime::now()).to_string(),
            version: env!("CARGO_PKG_VERSION"),
        };
        let blob = serde_json::to_vec(&lock)
            .map_err(|e| EsmError::Fatal(format!("encoding instance lock: {e}")))?;
        let acquired = self
            .catalog
            .kv_acquire(&self.kv_lock_key(), &blob, &service_session, &opts)
            .await?;
        if !acquired {
            // Lost the race between preflight and acquire.
            let _ = self.catalog.session_destroy(&service_session, &opts).await;
            if let Some(ns) = &node_session {
                let _ = self.catalog.session_destroy(ns, &opts).await;
            }
            return Err(EsmError::AlreadyExists(format!(
                "an instance with id {:?} holds the instance lock",
                self.id
            )));
        }

        Ok(Registration {
            node,
            service_session,
            node_session,
        })
    }

    /// Agent-mode registration: service and TTL check through the local
    /// agent API.
    async fn register_agent_service(&self) -> Result<()> {
        let opts = self.query_opts();

        let mut meta = HashMap::new();
        meta.insert(
            EXTERNAL_SOURCE_KEY.to_string(),
            EXTERNAL_SOURCE_VALUE.to_string(),
        );
        let service = AgentServiceRegistration {
            id: self.service_id(),
            name: self.config.service.clone(),
            tags: self.tags(),
            meta,
            partition: self.config.partition_or_empty().to_string(),
        };
        self.catalog.service_register(&service, &opts).await?;

        let check = AgentCheckRegistration {
            id: self.ttl_check_id(),
            name: TTL_CHECK_NAME.to_string(),
            service_id: self.service_id(),
            ttl: humantime::format_duration(self.config.check_ttl).to_string(),
            status: Some(CheckStatus::Passing),
            partition: self.config.partition_or_empty().to_string(),
        };
        self.catalog.check_register(&check, &opts).await?;
        Ok(())
    }

    /// Agentless registration: virtual node, service, and liveness check
    /// in one catalog write.
    async fn register_virtual_node(&self) -> Result<()> {
        let opts = self.query_opts();
        let node = self.agentless_node_id();

        let mut node_meta = self.config.node_meta.clone();
        // Mark the virtual node as ours so reconcilers never treat it as
        // an external node to be monitored.
        node_meta.insert(
            EXTERNAL_SOURCE_KEY.to_string(),
            EXTERNAL_SOURCE_VALUE.to_string(),
        );

        let initial_status = match node_meta.get(INITIAL_HEALTH_META).map(String::as_str) {
            Some("passing") => CheckStatus::Passing,
            Some("warning") => CheckStatus::Warning,
            _ => CheckStatus::Critical,
        };

        let mut service_meta = HashMap::new();
        service_meta.insert(
            EXTERNAL_SOURCE_KEY.to_string(),
            EXTERNAL_SOURCE_VALUE.to_string(),
        );

        let reg = CatalogRegistration {
            node: node.clone(),
            address: "127.0.0.1".to_string(),
            node_meta,
            service: Some(AgentService {
                id: self.service_id(),
                service: self.config.service.clone(),
                tags: self.tags(),
                meta: service_meta,
                ..Default::default()
            }),
            checks: vec![HealthCheck {
                node: node.clone(),
                check_id: self.ttl_check_id(),
                name: TTL_CHECK_NAME.to_string(),
                status: initial_status,
                service_id: self.service_id(),
                service_name: self.config.service.clone(),
                ..Default::default()
            }],
            skip_node_update: false,
            partition: self.config.partition_or_empty().to_string(),
        };
        self.catalog.catalog_register(&reg, &opts).await?;
        Ok(())
    }

    async fn create_session(&self, node: &str, name: &str) -> Result<String> {
        let entry = SessionEntry {
            name: name.to_string(),
            node: node.to_string(),
            ttl: humantime::format_duration(self.config.check_ttl).to_string(),
            behavior: SessionBehavior::Delete,
            node_checks: vec![self.ttl_check_id()],
            checks: vec![self.ttl_check_id()],
            ..Default::default()
        };
        let id = self.catalog.session_create(&entry, &self.query_opts()).await?;
        debug!(session = %id, name = %name, "session created");
        Ok(id)
    }

    fn tags(&self) -> Vec<String> {
        if self.config.tag.is_empty() {
            Vec::new()
        } else {
            vec![self.config.tag.clone()]
        }
    }

    /// Keep the TTL check passing. Repeated failures degrade the
    /// instance so the reconciler stops claiming new work.
    async fn run_ttl_renewal(&self) {
        let period = self.config.check_ttl / 2;
        let opts = self.query_opts();
        let mut shutdown = self.shutdown_tx.subscribe();
        let mut backoff = Backoff::new(Duration::from_secs(1), self.config.check_ttl);
        let mut failures = 0u32;

        loop {
            let wait = if failures == 0 {
                period
            } else {
                backoff.next_delay().min(period)
            };
            tokio::select! {
                _ = tokio::time::sleep(wait) => {}
                _ = wait_for_true(&mut shutdown) => return,
            }

            match self
                .catalog
                .check_update_ttl(
                    &self.ttl_check_id(),
                    CheckStatus::Passing,
                    "Agent alive and reachable",
                    &opts,
                )
                .await
            {
                Ok(()) => {
                    if failures > 0 {
                        info!("TTL renewal recovered");
                    }
                    failures = 0;
                    backoff.reset();
                    self.healthy.store(true, Ordering::Release);
                }
                Err(e) => {
                    failures += 1;
                    warn!(error = %e, failures, "TTL renewal failed");
                    if failures >= RENEWAL_FAILURE_LIMIT {
                        self.healthy.store(false, Ordering::Release);
                    }
                }
            }
        }
    }

    /// Renew the catalog session(s) at half their TTL. A session the
    /// catalog no longer knows means everything bound to it is gone:
    /// degrade, re-register under a fresh session, and give up for good
    /// after [`SESSION_REACQUIRE_LIMIT`] failed attempts.
    async fn run_session_keeper(&self, mut reg: Registration, fatal: mpsc::Sender<EsmError>) {
        let period = self.config.check_ttl / 2;
        let opts = self.query_opts();
        let mut shutdown = self.shutdown_tx.subscribe();
        let mut failures = 0u32;

        loop {
            tokio::select! {
                _ = tokio::time::sleep(period) => {}
                _ = wait_for_true(&mut shutdown) => return,
            }

            let mut lost = false;
            for session in std::iter::once(&reg.service_session).chain(reg.node_session.iter()) {
                match self.catalog.session_renew(session, &opts).await {
                    Ok(()) => {}
                    Err(e) if e.is_transient() => {
                        failures += 1;
                        warn!(error = %e, failures, "session renewal failed");
                        if failures >= RENEWAL_FAILURE_LIMIT {
                            lost = true;
                        }
                        break;
                    }
                    Err(e) => {
                        warn!(error = %e, session = %session, "session rejected by catalog");
                        lost = true;
                        break;
                    }
                }
            }

            if !lost {
                if failures > 0 {
                    info!("session renewal recovered");
                }
                failures = 0;
                if self.config.enable_agentless {
                    self.healthy.store(true, Ordering::Release);
                }
                continue;
            }

            // Session loss: stop claiming work, then try to come back
            // under a fresh identity.
            self.healthy.store(false, Ordering::Release);
            warn!("session lost, re-registering");

            let mut backoff = Backoff::new(Duration::from_millis(500), self.config.check_ttl);
            let mut reacquired = false;
            for attempt in 1..=SESSION_REACQUIRE_LIMIT {
                if *shutdown.borrow() {
                    return;
                }
                match self.register(Some(&reg.service_session)).await {
                    Ok(new_reg) => {
                        info!(attempt, "re-registered after session loss");
                        reg = new_reg;
                        failures = 0;
                        self.healthy.store(true, Ordering::Release);
                        reacquired = true;
                        break;
                    }
                    Err(e) => {
                        warn!(attempt, error = %e, "re-registration failed");
                        tokio::select! {
                            _ = tokio::time::sleep(backoff.next_delay()) => {}
                            _ = wait_for_true(&mut shutdown) => return,
                        }
                    }
                }
            }
            if !reacquired {
                let _ = fatal
                    .send(EsmError::SessionLost(format!(
                        "could not re-acquire a session after {SESSION_REACQUIRE_LIMIT} attempts"
                    )))
                    .await;
                return;
            }
        }
    }

    /// Restore the service registration if some external actor removed
    /// it (an operator cleanup pass, another instance reaping).
    async fn run_registration_watch(&self) {
        let period = self.config.reconcile_interval;
        let opts = self.query_opts();
        let mut shutdown = self.shutdown_tx.subscribe();

        loop {
            tokio::select! {
                _ = tokio::time::sleep(period) => {}
                _ = wait_for_true(&mut shutdown) => return,
            }

            let present = if self.config.enable_agentless {
                self.catalog
                    .catalog_service(&self.config.service, &self.config.tag, &opts)
                    .await
                    .map(|(services, _)| {
                        services.iter().any(|s| s.service_id == self.service_id())
                    })
            } else {
                self.catalog
                    .agent_service(&self.service_id(), &opts)
                    .await
                    .map(|s| s.is_some())
            };

            match present {
                Ok(true) => {}
                Ok(false) => {
                    warn!(service_id = %self.service_id(), "registration missing, restoring");
                    let restored = if self.config.enable_agentless {
                        self.register_virtual_node().await
                    } else {
                        self.register_agent_service().await
                    };
                    if let Err(e) = restored {
                        warn!(error = %e, "failed to restore registration");
                    }
                }
                Err(e) => {
                    debug!(error = %e, "registration watch poll failed");
                }
            }
        }
    }

    /// Undo the registration and wait for the catalog to agree.
    async fn teardown(&self, reg: &Registration) {
        let opts = self.query_opts();
        info!(service_id = %self.service_id(), "deregistering");

        if self.config.enable_agentless {
            let dereg = CatalogDeregistration {
                node: reg.node.clone(),
                partition: self.config.partition_or_empty().to_string(),
                ..Default::default()
            };
            if let Err(e) = self.catalog.catalog_deregister(&dereg, &opts).await {
                warn!(error = %e, "virtual node deregistration failed");
            }
        } else if let Err(e) = self.catalog.service_deregister(&self.service_id(), &opts).await {
            warn!(error = %e, "service deregistration failed");
        }

        if let Err(e) = self.catalog.kv_delete(&self.kv_lock_key(), &opts).await {
            debug!(error = %e, "instance lock cleanup failed");
        }
        for session in std::iter::once(&reg.service_session).chain(reg.node_session.iter()) {
            if let Err(e) = self.catalog.session_destroy(session, &opts).await {
                debug!(error = %e, session = %session, "session destroy failed");
            }
        }

        // One confirming read: poll until the catalog stops listing us,
        // bounded so a dead catalog cannot hang shutdown.
        let deadline = tokio::time::Instant::now() + DEREGISTER_SETTLE;
        loop {
            match self
                .catalog
                .catalog_service(&self.config.service, &self.config.tag, &opts)
                .await
            {
                Ok((services, _))
                    if !services.iter().any(|s| s.service_id == self.service_id()) =>
                {
                    debug!("deregistration converged");
                    return;
                }
                Ok(_) => {}
                Err(e) => {
                    debug!(error = %e, "convergence poll failed");
                }
            }
            if tokio::time::Instant::now() >= deadline {
                warn!("catalog still lists this instance after deregistration");
                return;
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
    }
}

/// Wait until a watch flag becomes true (or its sender goes away).
async fn wait_for_true(rx: &mut watch::Receiver<bool>) {
    while !*rx.borrow() {
        if rx.changed().await.is_err() {
            return;
        }
    }
}
