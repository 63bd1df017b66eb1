//! TCP probe.

use std::time::Duration;

use esm_catalog::CheckStatus;
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::debug;

/// Dial `target` (host:port). Connected means passing; refused or timed
/// out means critical.
pub async fn probe(target: &str, deadline: Duration) -> Option<(CheckStatus, String)> {
    match timeout(deadline, TcpStream::connect(target)).await {
        Ok(Ok(_stream)) => Some((
            CheckStatus::Passing,
            format!("TCP connect {target}: Success"),
        )),
        Ok(Err(e)) => {
            debug!(target = %target, error = %e, "tcp probe failed");
            Some((CheckStatus::Critical, format!("TCP connect {target}: {e}")))
        }
        Err(_) => {
            debug!(target = %target, "tcp probe timed out");
            Some((
                CheckStatus::Critical,
                format!("TCP connect {target}: timeout after {deadline:?}"),
            ))
        }
    }
}
