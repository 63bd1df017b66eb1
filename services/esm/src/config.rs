//! Daemon configuration.
//!
//! Defaults, then JSON config files merged in the order given on the
//! command line (`-config-file` / `-config-dir`), then the
//! `CONSUL_HTTP_ADDR` environment fallback. Durations are accepted as
//! humantime strings ("30s", "1m", "72h").

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Deserialize;

/// Default service name instances register under.
pub const DEFAULT_SERVICE: &str = "consul-esm";

/// Node-meta marker selecting externally monitored nodes.
pub const DEFAULT_NODE_META_KEY: &str = "external-node";

#[derive(Debug, Clone)]
pub struct Config {
    /// Service name used for registration.
    pub service: String,

    /// Tag scoping this ESM cluster. Instances only coordinate with
    /// peers carrying the same tag.
    pub tag: String,

    /// Stable unique instance id. Derived from the host when empty.
    pub instance_id: String,

    /// Admin partition. `""` and `"default"` mean unset for queries.
    pub partition: String,

    /// Run without a local catalog agent, under a virtual node.
    pub enable_agentless: bool,

    /// Catalog HTTP endpoint.
    pub http_addr: String,

    /// Node metadata selecting external nodes (and applied to the
    /// virtual node in agentless mode).
    pub node_meta: HashMap<String, String>,

    /// How long an unreachable node is tolerated before its health goes
    /// critical.
    pub node_reconnect_timeout: Duration,

    /// Minimum gap between redundant same-status writes.
    pub node_health_refresh_interval: Duration,

    /// Cadence of coordinate pings.
    pub coordinate_update_interval: Duration,

    /// Skip the coordinate updater entirely.
    pub disable_coordinate_updates: bool,

    pub log_level: String,
    pub log_json: bool,
    pub log_file: Option<PathBuf>,

    pub telemetry: Telemetry,

    // Internal cadences. Not part of the public file surface but
    // overridable in code, which the tests rely on to run fast.
    /// TTL of the liveness check and of catalog sessions.
    pub check_ttl: Duration,

    /// Reconcile tick.
    pub reconcile_interval: Duration,

    /// How long a cancelled probe gets to exit before being abandoned.
    pub probe_cancel_timeout: Duration,

    /// Cap on concurrent catalog writebacks.
    pub writeback_concurrency: usize,
}

#[derive(Debug, Clone, Default)]
pub struct Telemetry {
    pub statsd_addr: String,
    pub metrics_prefix: String,
}

impl Default for Config {
    fn default() -> Self {
        let mut node_meta = HashMap::new();
        node_meta.insert(DEFAULT_NODE_META_KEY.to_string(), "true".to_string());

        Self {
            service: DEFAULT_SERVICE.to_string(),
            tag: String::new(),
            instance_id: String::new(),
            partition: String::new(),
            enable_agentless: false,
            http_addr: "127.0.0.1:8500".to_string(),
            node_meta,
            node_reconnect_timeout: Duration::from_secs(72 * 3600),
            node_health_refresh_interval: Duration::from_secs(60),
            coordinate_update_interval: Duration::from_secs(10),
            disable_coordinate_updates: false,
            log_level: "info".to_string(),
            log_json: false,
            log_file: None,
            telemetry: Telemetry::default(),
            check_ttl: Duration::from_secs(30),
            reconcile_interval: Duration::from_secs(3),
            probe_cancel_timeout: Duration::from_secs(5),
            writeback_concurrency: 64,
        }
    }
}

/// Raw shape of a config file. Every field optional; later files win.
#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct ConfigFile {
    service: Option<String>,
    tag: Option<String>,
    instance_id: Option<String>,
    partition: Option<String>,
    enable_agentless: Option<bool>,
    http_addr: Option<String>,
    node_meta: Option<HashMap<String, String>>,
    node_reconnect_timeout: Option<String>,
    node_health_refresh_interval: Option<String>,
    coordinate_update_interval: Option<String>,
    disable_coordinate_updates: Option<bool>,
    log_level: Option<String>,
    log_json: Option<bool>,
    log_file: Option<PathBuf>,
    // Rotation knobs are accepted for config compatibility; rotation
    // itself is delegated to the operator's log shipper.
    log_rotate_bytes: Option<u64>,
    log_rotate_max_files: Option<u32>,
    log_rotate_duration: Option<String>,
    telemetry: Option<TelemetryFile>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct TelemetryFile {
    statsd_addr: Option<String>,
    metrics_prefix: Option<String>,
}

impl Config {
    /// Build a config from files (in order) and directories (each scanned
    /// for `*.json`, lexicographic order), then environment fallbacks.
    pub fn build(files: &[PathBuf], dirs: &[PathBuf]) -> Result<Self> {
        let mut config = Config::default();

        let mut paths: Vec<PathBuf> = files.to_vec();
        for dir in dirs {
            let mut entries: Vec<PathBuf> = fs::read_dir(dir)
                .with_context(|| format!("reading config dir {}", dir.display()))?
                .filter_map(|e| e.ok())
                .map(|e| e.path())
                .filter(|p| p.extension().is_some_and(|ext| ext == "json"))
                .collect();
            entries.sort();
            paths.extend(entries);
        }

        for path in &paths {
            config.apply_file(path)?;
        }

        if let Ok(addr) = std::env::var("CONSUL_HTTP_ADDR") {
            if !addr.is_empty() {
                config.http_addr = addr;
            }
        }

        if config.instance_id.is_empty() {
            config.instance_id = derive_instance_id();
        }

        config.validate()?;
        Ok(config)
    }

    fn apply_file(&mut self, path: &Path) -> Result<()> {
        let raw = fs::read_to_string(path)
            .with_context(|| format!("reading config file {}", path.display()))?;
        let file: ConfigFile = serde_json::from_str(&raw)
            .with_context(|| format!("parsing config file {}", path.display()))?;
        self.apply(file, path)
    }

    fn apply(&mut self, file: ConfigFile, path: &Path) -> Result<()> {
        let parse = |field: &str, value: &str| -> Result<Duration> {
            humantime::parse_duration(value).with_context(|| {
                format!("{}: {field} is not a duration: {value:?}", path.display())
            })
        };

        if let Some(v) = file.service {
            self.service = v;
        }
        if let Some(v) = file.tag {
            self.tag = v;
        }
        if let Some(v) = file.instance_id {
            self.instance_id = v;
        }
        if let Some(v) = file.partition {
            self.partition = v;
        }
        if let Some(v) = file.enable_agentless {
            self.enable_agentless = v;
        }
        if let Some(v) = file.http_addr {
            self.http_addr = v;
        }
        if let Some(v) = file.node_meta {
            self.node_meta = v;
        }
        if let Some(v) = file.node_reconnect_timeout {
            self.node_reconnect_timeout = parse("node_reconnect_timeout", &v)?;
        }
        if let Some(v) = file.node_health_refresh_interval {
            self.node_health_refresh_interval = parse("node_health_refresh_interval", &v)?;
        }
        if let Some(v) = file.coordinate_update_interval {
            self.coordinate_update_interval = parse("coordinate_update_interval", &v)?;
        }
        if let Some(v) = file.disable_coordinate_updates {
            self.disable_coordinate_updates = v;
        }
        if let Some(v) = file.log_level {
            self.log_level = v;
        }
        if let Some(v) = file.log_json {
            self.log_json = v;
        }
        if let Some(v) = file.log_file {
            self.log_file = Some(v);
        }
        if file.log_rotate_bytes.is_some()
            || file.log_rotate_max_files.is_some()
            || file.log_rotate_duration.is_some()
        {
            tracing::warn!(
                file = %path.display(),
                "log_rotate_* options are accepted but rotation is left to the log shipper"
            );
        }
        if let Some(t) = file.telemetry {
            if let Some(v) = t.statsd_addr {
                self.telemetry.statsd_addr = v;
            }
            if let Some(v) = t.metrics_prefix {
                self.telemetry.metrics_prefix = v;
            }
        }
        Ok(())
    }

    fn validate(&self) -> Result<()> {
        anyhow::ensure!(!self.service.is_empty(), "service name must not be empty");
        anyhow::ensure!(!self.http_addr.is_empty(), "http_addr must not be empty");
        anyhow::ensure!(
            !self.node_meta.is_empty(),
            "node_meta must select at least one metadata pair"
        );
        Ok(())
    }

    /// The configured partition verbatim, for registration bodies.
    pub fn partition_or_empty(&self) -> &str {
        &self.partition
    }

    /// The partition as used in query options, where `"default"` means
    /// unset.
    pub fn query_partition(&self) -> &str {
        match self.partition.as_str() {
            "default" => "",
            p => p,
        }
    }
}

/// Derive a stable instance id from the host when the operator supplies
/// none.
pub(crate) fn derive_instance_id() -> String {
    if let Ok(name) = std::env::var("HOSTNAME") {
        if !name.trim().is_empty() {
            return name.trim().to_string();
        }
    }
    if let Ok(name) = fs::read_to_string("/etc/hostname") {
        if !name.trim().is_empty() {
            return name.trim().to_string();
        }
    }
    // No usable host name; fall back to a random id. Not stable across
    // restarts, which only matters for operators who also set none.
    format!("esm-{:08x}", rand::random::<u32>())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_config(dir: &tempfile::TempDir, name: &str, body: &str) -> PathBuf {
        let path = dir.path().join(name);
        let mut f = fs::File::create(&path).unwrap();
        f.write_all(body.as_bytes()).unwrap();
        path
    }

    #[test]
    fn defaults() {
        let c = Config::default();
        assert_eq!(c.service, "consul-esm");
        assert_eq!(c.node_meta["external-node"], "true");
        assert_eq!(c.node_health_refresh_interval, Duration::from_secs(60));
        assert_eq!(c.coordinate_update_interval, Duration::from_secs(10));
    }

    #[test]
    fn files_merge_in_order() {
        let dir = tempfile::tempdir().unwrap();
        let a = write_config(&dir, "a.json", r#"{"service": "esm-a", "tag": "prod"}"#);
        let b = write_config(&dir, "b.json", r#"{"service": "esm-b"}"#);

        let config = Config::build(&[a, b], &[]).unwrap();
        assert_eq!(config.service, "esm-b");
        assert_eq!(config.tag, "prod");
    }

    #[test]
    fn config_dir_scans_json_sorted() {
        let dir = tempfile::tempdir().unwrap();
        write_config(&dir, "10-base.json", r#"{"instance_id": "base"}"#);
        write_config(&dir, "20-override.json", r#"{"instance_id": "override"}"#);
        write_config(&dir, "notes.txt", "not json");

        let config = Config::build(&[], &[dir.path().to_path_buf()]).unwrap();
        assert_eq!(config.instance_id, "override");
    }

    #[test]
    fn durations_parse_humantime() {
        let dir = tempfile::tempdir().unwrap();
        let f = write_config(
            &dir,
            "c.json",
            r#"{"node_reconnect_timeout": "1h", "coordinate_update_interval": "250ms", "instance_id": "x"}"#,
        );
        let config = Config::build(&[f], &[]).unwrap();
        assert_eq!(config.node_reconnect_timeout, Duration::from_secs(3600));
        assert_eq!(config.coordinate_update_interval, Duration::from_millis(250));
    }

    #[test]
    fn bad_duration_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let f = write_config(&dir, "c.json", r#"{"node_reconnect_timeout": "soon"}"#);
        assert!(Config::build(&[f], &[]).is_err());
    }

    #[test]
    fn unknown_keys_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let f = write_config(&dir, "c.json", r#"{"servise": "typo"}"#);
        assert!(Config::build(&[f], &[]).is_err());
    }

    #[test]
    fn partition_helpers() {
        let mut c = Config::default();
        assert_eq!(c.partition_or_empty(), "");
        assert_eq!(c.query_partition(), "");

        c.partition = "default".to_string();
        assert_eq!(c.partition_or_empty(), "default");
        assert_eq!(c.query_partition(), "");

        c.partition = "admin".to_string();
        assert_eq!(c.partition_or_empty(), "admin");
        assert_eq!(c.query_partition(), "admin");
    }
}
