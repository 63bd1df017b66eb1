//! Startup compatibility verification.
//!
//! Coordinated health checking leans on catalog features (sessions bound
//! to node checks, admin partitions) that older servers lack, and on
//! peers speaking the same sharding protocol. Verified once at startup;
//! servers joining later with older versions are the operator's problem.

use std::sync::Arc;

use esm_catalog::{Catalog, QueryOptions};
use semver::Version;
use tracing::warn;

use crate::config::Config;
use crate::error::{EsmError, Result};

/// Minimum catalog server and peer version.
pub const MIN_VERSION: Version = Version::new(1, 10, 0);

/// Service metadata key peers publish their version under.
const VERSION_META_KEY: &str = "version";

/// Parse a reported version leniently: strip build metadata and pad
/// missing components ("1.10" → 1.10.0).
fn parse_version(raw: &str) -> Option<Version> {
    let raw = raw.trim();
    if let Ok(v) = Version::parse(raw) {
        return Some(v);
    }
    let base = raw.split(['+', '-']).next()?;
    let mut parts = base.split('.');
    let major = parts.next()?.parse().ok()?;
    let minor = parts.next().unwrap_or("0").parse().ok()?;
    let patch = parts.next().unwrap_or("0").parse().ok()?;
    Some(Version::new(major, minor, patch))
}

/// Verify the catalog server and peer ESM instances are all at or above
/// [`MIN_VERSION`]. Peers without version metadata log a warning and are
/// tolerated.
pub async fn verify_compatibility(catalog: &Arc<dyn Catalog>, config: &Config) -> Result<()> {
    let opts = QueryOptions::default().with_partition(config.query_partition());

    let info = catalog.agent_self(&opts).await?;
    match parse_version(&info.config.version) {
        Some(v) if v >= MIN_VERSION => {}
        Some(v) => {
            return Err(EsmError::Incompatible(format!(
                "catalog server version {v} is below the minimum {MIN_VERSION}"
            )));
        }
        None => {
            return Err(EsmError::Incompatible(format!(
                "catalog server reported unparseable version {:?}",
                info.config.version
            )));
        }
    }

    let (peers, _) = catalog
        .catalog_service(&config.service, &config.tag, &opts)
        .await?;
    for peer in &peers {
        match peer.service_meta.get(VERSION_META_KEY) {
            None => {
                warn!(
                    service_id = %peer.service_id,
                    "peer instance has no version metadata, assuming compatible"
                );
            }
            Some(raw) => match parse_version(raw) {
                Some(v) if v >= MIN_VERSION => {}
                Some(v) => {
                    return Err(EsmError::Incompatible(format!(
                        "peer {} runs version {v}, below the minimum {MIN_VERSION}",
                        peer.service_id
                    )));
                }
                None => {
                    warn!(
                        service_id = %peer.service_id,
                        version = %raw,
                        "peer reported unparseable version, assuming compatible"
                    );
                }
            },
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_plain_and_decorated_versions() {
        assert_eq!(parse_version("1.10.0"), Some(Version::new(1, 10, 0)));
        assert_eq!(parse_version("1.10.0+ent"), Some(Version::new(1, 10, 0)));
        assert_eq!(parse_version("1.10"), Some(Version::new(1, 10, 0)));
        assert_eq!(parse_version("2"), Some(Version::new(2, 0, 0)));
        assert_eq!(parse_version("not-a-version"), None);
    }

    #[test]
    fn minimum_comparison() {
        assert!(parse_version("1.10.0").unwrap() >= MIN_VERSION);
        assert!(parse_version("1.17.3").unwrap() >= MIN_VERSION);
        assert!(parse_version("1.0.0").unwrap() < MIN_VERSION);
        assert!(parse_version("1.9.17").unwrap() < MIN_VERSION);
        // A pre-release of the minimum does not satisfy it.
        assert!(Version::parse("1.10.0-rc1").unwrap() < MIN_VERSION);
    }
}
