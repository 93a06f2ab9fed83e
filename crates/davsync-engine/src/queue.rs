//! Global job queue
//!
//! Bounds the number of concurrent HTTP jobs across all sync roots so the
//! client never starves the host. FIFO through tokio's semaphore, with a
//! small reserved lane for user-visible jobs (explicit hydrations) that
//! must not wait behind a bulk transfer backlog.

use std::sync::Arc;

use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::trace;

/// Share of permits reserved for priority jobs.
const PRIORITY_RESERVE: usize = 2;

/// A held queue slot; dropping it releases the slot.
pub struct JobPermit {
    _permit: OwnedSemaphorePermit,
}

/// Process-wide bound on in-flight HTTP jobs.
pub struct JobQueue {
    normal: Arc<Semaphore>,
    reserved: Arc<Semaphore>,
}

impl JobQueue {
    pub fn new(limit: usize) -> Self {
        let reserve = PRIORITY_RESERVE.min(limit.saturating_sub(1));
        Self {
            normal: Arc::new(Semaphore::new(limit - reserve)),
            reserved: Arc::new(Semaphore::new(reserve)),
        }
    }

    /// Waits for a slot. Priority jobs may use the reserved lane; all
    /// waits observe cancellation promptly and return `None` when the
    /// token fires.
    pub async fn acquire(&self, priority: bool, cancel: &CancellationToken) -> Option<JobPermit> {
        if priority {
            // whichever lane frees up first
            tokio::select! {
                biased;
                _ = cancel.cancelled() => return None,
                permit = self.reserved.clone().acquire_owned() => {
                    if let Ok(permit) = permit {
                        trace!("Priority job admitted via reserved lane");
                        return Some(JobPermit { _permit: permit });
                    }
                    None
                }
                permit = self.normal.clone().acquire_owned() => {
                    permit.ok().map(|p| JobPermit { _permit: p })
                }
            }
        } else {
            tokio::select! {
                _ = cancel.cancelled() => None,
                permit = self.normal.clone().acquire_owned() => {
                    permit.ok().map(|p| JobPermit { _permit: p })
                }
            }
        }
    }

    /// Slots currently free in the normal lane (diagnostics).
    pub fn available(&self) -> usize {
        self.normal.available_permits()
    }
}
