//! TTL check expiry enforcement.
//!
//! TTL checks are refreshed by an external reporter; the daemon never
//! probes them. The executor's only job is marking a check critical once
//! its reporter goes quiet for longer than the TTL. Refreshes are
//! detected by the check's modify index moving in catalog reads, which
//! the reconciler feeds in via [`TtlState::observe`].

use std::sync::Mutex;
use std::time::{Duration, Instant};

use esm_catalog::CheckStatus;

#[derive(Debug)]
struct Observed {
    status: CheckStatus,
    modify_index: u64,
    refreshed_at: Instant,
}

#[derive(Debug)]
pub struct TtlState {
    inner: Mutex<Option<Observed>>,
}

impl TtlState {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(None),
        }
    }

    /// Record what the catalog currently says about the check.
    pub fn observe(&self, status: CheckStatus, modify_index: u64) {
        let mut inner = self.inner.lock().unwrap();
        match inner.as_mut() {
            Some(observed) if observed.modify_index == modify_index => {}
            _ => {
                *inner = Some(Observed {
                    status,
                    modify_index,
                    refreshed_at: Instant::now(),
                });
            }
        }
    }

    /// Expiry decision: emit critical once the last refresh is older than
    /// the TTL and the check is not already critical. Otherwise nothing
    /// to write.
    pub fn evaluate(&self, ttl: Duration) -> Option<(CheckStatus, String)> {
        let inner = self.inner.lock().unwrap();
        let observed = inner.as_ref()?;

        if observed.status == CheckStatus::Critical {
            return None;
        }
        if observed.refreshed_at.elapsed() > ttl {
            return Some((
                CheckStatus::Critical,
                format!("TTL expired (no update within {})", humantime::format_duration(ttl)),
            ));
        }
        None
    }
}
