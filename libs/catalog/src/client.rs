//! The async catalog client.
//!
//! [`Catalog`] is the interface the daemon consumes; [`HttpCatalog`] is its
//! implementation over the catalog's `/v1` HTTP API. Read endpoints support
//! blocking queries: pass `wait_index`/`wait_time` in [`QueryOptions`] and
//! the call parks server-side until the watched data changes, returning the
//! new index from the `X-Consul-Index` response header.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::debug;

use crate::error::CatalogError;
use crate::types::{
    AgentCheckRegistration, AgentSelf, AgentService, AgentServiceRegistration,
    CatalogDeregistration, CatalogRegistration, CatalogService, CheckStatus, CoordinateEntry,
    HealthCheck, KvPair, Namespace, Node, SessionEntry,
};
use crate::Result;

/// Default deadline for non-blocking catalog calls.
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);

/// Grace added on top of a blocking query's wait time before the client
/// gives up on the connection.
const BLOCKING_GRACE: Duration = Duration::from_secs(60);

/// Index response header set on blocking-capable endpoints.
const INDEX_HEADER: &str = "X-Consul-Index";

/// Options attached to every catalog call.
#[derive(Debug, Clone, Default)]
pub struct QueryOptions {
    /// Admin partition to scope the call to. `None` means the default
    /// partition; use [`QueryOptions::with_partition`] to get the
    /// normalization right.
    pub partition: Option<String>,

    /// Namespace to scope the call to.
    pub namespace: Option<String>,

    /// Last seen index; makes the read a blocking query.
    pub wait_index: Option<u64>,

    /// Max server-side wait for a blocking query.
    pub wait_time: Option<Duration>,
}

impl QueryOptions {
    /// Scope to a partition. `""` and `"default"` both mean "unset": the
    /// catalog treats the default partition as the absence of the
    /// parameter, and sending it explicitly breaks against builds without
    /// partition support.
    pub fn with_partition(mut self, partition: &str) -> Self {
        self.partition = match partition {
            "" | "default" => None,
            p => Some(p.to_string()),
        };
        self
    }

    /// Scope to a namespace.
    pub fn with_namespace(mut self, namespace: &str) -> Self {
        if !namespace.is_empty() {
            self.namespace = Some(namespace.to_string());
        }
        self
    }

    /// Turn the read into a blocking query resuming from `index`.
    pub fn blocking(mut self, index: u64, wait: Duration) -> Self {
        self.wait_index = Some(index);
        self.wait_time = Some(wait);
        self
    }

    fn params(&self) -> Vec<(&'static str, String)> {
        let mut params = Vec::new();
        if let Some(p) = &self.partition {
            params.push(("partition", p.clone()));
        }
        if let Some(ns) = &self.namespace {
            params.push(("ns", ns.clone()));
        }
        if let Some(index) = self.wait_index {
            params.push(("index", index.to_string()));
        }
        if let Some(wait) = self.wait_time {
            params.push(("wait", format!("{}s", wait.as_secs().max(1))));
        }
        params
    }

    fn request_timeout(&self) -> Duration {
        match self.wait_time {
            Some(wait) => wait + BLOCKING_GRACE,
            None => DEFAULT_TIMEOUT,
        }
    }
}

/// The catalog operations the daemon consumes.
#[async_trait]
pub trait Catalog: Send + Sync {
    async fn agent_self(&self, opts: &QueryOptions) -> Result<AgentSelf>;

    /// Look up a service on the local agent. `None` when not registered.
    async fn agent_service(&self, id: &str, opts: &QueryOptions) -> Result<Option<AgentService>>;

    async fn service_register(
        &self,
        reg: &AgentServiceRegistration,
        opts: &QueryOptions,
    ) -> Result<()>;

    async fn service_deregister(&self, service_id: &str, opts: &QueryOptions) -> Result<()>;

    async fn check_register(&self, reg: &AgentCheckRegistration, opts: &QueryOptions)
        -> Result<()>;

    async fn check_update_ttl(
        &self,
        check_id: &str,
        status: CheckStatus,
        output: &str,
        opts: &QueryOptions,
    ) -> Result<()>;

    /// List instances of a service, with the blocking index.
    async fn catalog_service(
        &self,
        name: &str,
        tag: &str,
        opts: &QueryOptions,
    ) -> Result<(Vec<CatalogService>, u64)>;

    /// List nodes filtered by node metadata, with the blocking index.
    async fn catalog_nodes(
        &self,
        node_meta: &HashMap<String, String>,
        opts: &QueryOptions,
    ) -> Result<(Vec<Node>, u64)>;

    async fn catalog_register(&self, reg: &CatalogRegistration, opts: &QueryOptions) -> Result<()>;

    async fn catalog_deregister(
        &self,
        dereg: &CatalogDeregistration,
        opts: &QueryOptions,
    ) -> Result<()>;

    /// Checks in the given state ("any", "passing", ...), with the
    /// blocking index.
    async fn health_state(
        &self,
        state: &str,
        opts: &QueryOptions,
    ) -> Result<(Vec<HealthCheck>, u64)>;

    /// All checks registered against one node.
    async fn health_node(&self, node: &str, opts: &QueryOptions) -> Result<Vec<HealthCheck>>;

    /// Namespaces, or `None` when the catalog build has none (404).
    async fn namespaces(&self, opts: &QueryOptions) -> Result<Option<Vec<Namespace>>>;

    /// Create a session, returning its ID.
    async fn session_create(&self, entry: &SessionEntry, opts: &QueryOptions) -> Result<String>;

    async fn session_renew(&self, session_id: &str, opts: &QueryOptions) -> Result<()>;

    async fn session_destroy(&self, session_id: &str, opts: &QueryOptions) -> Result<()>;

    async fn session_list(&self, opts: &QueryOptions) -> Result<Vec<SessionEntry>>;

    async fn kv_get(&self, key: &str, opts: &QueryOptions) -> Result<Option<KvPair>>;

    /// Acquire the lock on `key` for `session`, writing `value`. Returns
    /// whether the lock was obtained.
    async fn kv_acquire(
        &self,
        key: &str,
        value: &[u8],
        session_id: &str,
        opts: &QueryOptions,
    ) -> Result<bool>;

    /// Release the lock held on `key` by `session`.
    async fn kv_release(&self, key: &str, session_id: &str, opts: &QueryOptions) -> Result<bool>;

    async fn kv_delete(&self, key: &str, opts: &QueryOptions) -> Result<()>;

    async fn coordinate_update(&self, entry: &CoordinateEntry, opts: &QueryOptions) -> Result<()>;

    /// Address of the current catalog leader.
    async fn status_leader(&self, opts: &QueryOptions) -> Result<String>;
}

/// HTTP implementation of [`Catalog`].
#[derive(Debug, Clone)]
pub struct HttpCatalog {
    client: reqwest::Client,
    base_url: String,
}

impl HttpCatalog {
    /// Build a client for the catalog at `addr` (host:port or full URL).
    pub fn new(addr: &str) -> Result<Self> {
        let base_url = if addr.starts_with("http://") || addr.starts_with("https://") {
            addr.trim_end_matches('/').to_string()
        } else {
            format!("http://{}", addr.trim_end_matches('/'))
        };

        let client = reqwest::Client::builder()
            .build()
            .map_err(CatalogError::Transport)?;

        Ok(Self { client, base_url })
    }

    fn url(&self, path: &str) -> String {
        format!("{}/v1/{}", self.base_url, path)
    }

    async fn get_json<T: DeserializeOwned>(
        &self,
        path: &str,
        extra: &[(&str, String)],
        opts: &QueryOptions,
    ) -> Result<(T, u64)> {
        let mut params = opts.params();
        params.extend(extra.iter().map(|(k, v)| (*k, v.clone())));

        let resp = self
            .client
            .get(self.url(path))
            .query(&params)
            .timeout(opts.request_timeout())
            .send()
            .await?;

        let index = resp
            .headers()
            .get(INDEX_HEADER)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse().ok())
            .unwrap_or(0);

        let status = resp.status();
        let body = resp.text().await?;
        if !status.is_success() {
            return Err(CatalogError::Status {
                status: status.as_u16(),
                body,
            });
        }

        let value = serde_json::from_str(&body)
            .map_err(|e| CatalogError::Decode(format!("{path}: {e}")))?;
        Ok((value, index))
    }

    async fn put_json<B: Serialize + ?Sized>(
        &self,
        path: &str,
        body: &B,
        opts: &QueryOptions,
    ) -> Result<String> {
        let resp = self
            .client
            .put(self.url(path))
            .query(&opts.params())
            .timeout(opts.request_timeout())
            .json(body)
            .send()
            .await?;

        let status = resp.status();
        let body = resp.text().await?;
        if !status.is_success() {
            return Err(CatalogError::Status {
                status: status.as_u16(),
                body,
            });
        }
        Ok(body)
    }

    async fn put_empty(&self, path: &str, opts: &QueryOptions) -> Result<()> {
        let resp = self
            .client
            .put(self.url(path))
            .query(&opts.params())
            .timeout(opts.request_timeout())
            .send()
            .await?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(CatalogError::Status {
                status: status.as_u16(),
                body,
            });
        }
        Ok(())
    }
}

#[async_trait]
impl Catalog for HttpCatalog {
    async fn agent_self(&self, opts: &QueryOptions) -> Result<AgentSelf> {
        let (info, _) = self.get_json("agent/self", &[], opts).await?;
        Ok(info)
    }

    async fn agent_service(&self, id: &str, opts: &QueryOptions) -> Result<Option<AgentService>> {
        match self
            .get_json::<AgentService>(&format!("agent/service/{id}"), &[], opts)
            .await
        {
            Ok((svc, _)) => Ok(Some(svc)),
            Err(e) if e.is_not_found() => Ok(None),
            Err(e) => Err(e),
        }
    }

    async fn service_register(
        &self,
        reg: &AgentServiceRegistration,
        opts: &QueryOptions,
    ) -> Result<()> {
        debug!(service_id = %reg.id, "registering service");
        self.put_json("agent/service/register", reg, opts).await?;
        Ok(())
    }

    async fn service_deregister(&self, service_id: &str, opts: &QueryOptions) -> Result<()> {
        self.put_empty(&format!("agent/service/deregister/{service_id}"), opts)
            .await
    }

    async fn check_register(
        &self,
        reg: &AgentCheckRegistration,
        opts: &QueryOptions,
    ) -> Result<()> {
        debug!(check_id = %reg.id, "registering check");
        self.put_json("agent/check/register", reg, opts).await?;
        Ok(())
    }

    async fn check_update_ttl(
        &self,
        check_id: &str,
        status: CheckStatus,
        output: &str,
        opts: &QueryOptions,
    ) -> Result<()> {
        #[derive(Serialize)]
        struct TtlUpdate<'a> {
            #[serde(rename = "Status")]
            status: CheckStatus,
            #[serde(rename = "Output")]
            output: &'a str,
        }
        self.put_json(
            &format!("agent/check/update/{check_id}"),
            &TtlUpdate { status, output },
            opts,
        )
        .await?;
        Ok(())
    }

    async fn catalog_service(
        &self,
        name: &str,
        tag: &str,
        opts: &QueryOptions,
    ) -> Result<(Vec<CatalogService>, u64)> {
        let mut extra = Vec::new();
        if !tag.is_empty() {
            extra.push(("tag", tag.to_string()));
        }
        self.get_json(&format!("catalog/service/{name}"), &extra, opts)
            .await
    }

    async fn catalog_nodes(
        &self,
        node_meta: &HashMap<String, String>,
        opts: &QueryOptions,
    ) -> Result<(Vec<Node>, u64)> {
        let extra: Vec<(&str, String)> = node_meta
            .iter()
            .map(|(k, v)| ("node-meta", format!("{k}:{v}")))
            .collect();
        self.get_json("catalog/nodes", &extra, opts).await
    }

    async fn catalog_register(&self, reg: &CatalogRegistration, opts: &QueryOptions) -> Result<()> {
        self.put_json("catalog/register", reg, opts).await?;
        Ok(())
    }

    async fn catalog_deregister(
        &self,
        dereg: &CatalogDeregistration,
        opts: &QueryOptions,
    ) -> Result<()> {
        self.put_json("catalog/deregister", dereg, opts).await?;
        Ok(())
    }

    async fn health_state(
        &self,
        state: &str,
        opts: &QueryOptions,
    ) -> Result<(Vec<HealthCheck>, u64)> {
        self.get_json(&format!("health/state/{state}"), &[], opts)
            .await
    }

    async fn health_node(&self, node: &str, opts: &QueryOptions) -> Result<Vec<HealthCheck>> {
        let (checks, _) = self.get_json(&format!("health/node/{node}"), &[], opts).await?;
        Ok(checks)
    }

    async fn namespaces(&self, opts: &QueryOptions) -> Result<Option<Vec<Namespace>>> {
        match self.get_json::<Vec<Namespace>>("namespaces", &[], opts).await {
            Ok((namespaces, _)) => Ok(Some(namespaces)),
            Err(e) if e.is_not_found() => Ok(None),
            Err(e) => Err(e),
        }
    }

    async fn session_create(&self, entry: &SessionEntry, opts: &QueryOptions) -> Result<String> {
        #[derive(serde::Deserialize)]
        struct Created {
            #[serde(rename = "ID")]
            id: String,
        }
        let body = self.put_json("session/create", entry, opts).await?;
        let created: Created = serde_json::from_str(&body)
            .map_err(|e| CatalogError::Decode(format!("session/create: {e}")))?;
        Ok(created.id)
    }

    async fn session_renew(&self, session_id: &str, opts: &QueryOptions) -> Result<()> {
        self.put_empty(&format!("session/renew/{session_id}"), opts)
            .await
    }

    async fn session_destroy(&self, session_id: &str, opts: &QueryOptions) -> Result<()> {
        self.put_empty(&format!("session/destroy/{session_id}"), opts)
            .await
    }

    async fn session_list(&self, opts: &QueryOptions) -> Result<Vec<SessionEntry>> {
        let (sessions, _) = self.get_json("session/list", &[], opts).await?;
        Ok(sessions)
    }

    async fn kv_get(&self, key: &str, opts: &QueryOptions) -> Result<Option<KvPair>> {
        match self
            .get_json::<Vec<KvPair>>(&format!("kv/{key}"), &[], opts)
            .await
        {
            Ok((pairs, _)) => Ok(pairs.into_iter().next()),
            Err(e) if e.is_not_found() => Ok(None),
            Err(e) => Err(e),
        }
    }

    async fn kv_acquire(
        &self,
        key: &str,
        value: &[u8],
        session_id: &str,
        opts: &QueryOptions,
    ) -> Result<bool> {
        let mut params = opts.params();
        params.push(("acquire", session_id.to_string()));

        let resp = self
            .client
            .put(self.url(&format!("kv/{key}")))
            .query(&params)
            .timeout(opts.request_timeout())
            .body(value.to_vec())
            .send()
            .await?;

        let status = resp.status();
        let body = resp.text().await?;
        if !status.is_success() {
            return Err(CatalogError::Status {
                status: status.as_u16(),
                body,
            });
        }
        Ok(body.trim() == "true")
    }

    async fn kv_release(&self, key: &str, session_id: &str, opts: &QueryOptions) -> Result<bool> {
        let mut params = opts.params();
        params.push(("release", session_id.to_string()));

        let resp = self
            .client
            .put(self.url(&format!("kv/{key}")))
            .query(&params)
            .timeout(opts.request_timeout())
            .send()
            .await?;

        let status = resp.status();
        let body = resp.text().await?;
        if !status.is_success() {
            return Err(CatalogError::Status {
                status: status.as_u16(),
                body,
            });
        }
        Ok(body.trim() == "true")
    }

    async fn kv_delete(&self, key: &str, opts: &QueryOptions) -> Result<()> {
        let resp = self
            .client
            .delete(self.url(&format!("kv/{key}")))
            .query(&opts.params())
            .timeout(opts.request_timeout())
            .send()
            .await?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(CatalogError::Status {
                status: status.as_u16(),
                body,
            });
        }
        Ok(())
    }

    async fn coordinate_update(&self, entry: &CoordinateEntry, opts: &QueryOptions) -> Result<()> {
        self.put_json("coordinate/update", entry, opts).await?;
        Ok(())
    }

    async fn status_leader(&self, opts: &QueryOptions) -> Result<String> {
        let (leader, _) = self.get_json::<String>("status/leader", &[], opts).await?;
        Ok(leader)
    }
}
