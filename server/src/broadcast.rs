//! Fan-out of chat lines to every other registered session

use crate::session_registry::SessionRegistry;
use log::{debug, warn};
use std::sync::Arc;

/// Outcome of one broadcast call
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct BroadcastReport {
    pub delivered: usize,
    pub failed: usize,
}

#[derive(Debug, Clone)]
pub struct Broadcaster {
    registry: Arc<SessionRegistry>,
}

impl Broadcaster {
    pub fn new(registry: Arc<SessionRegistry>) -> Self {
        Self { registry }
    }

    /// Writes `line` to every session except `sender`
    ///
    /// A failed write is logged and skipped; the remaining peers still get
    /// the line and the sender never sees the error. Each peer's write
    /// completes before the next one starts, which keeps one sender's lines
    /// in order at every recipient.
    pub async fn broadcast(&self, sender: &str, line: &str) -> BroadcastReport {
        let mut report = BroadcastReport::default();

        for (username, peer) in self.registry.snapshot_others(sender) {
            match peer.send_line(line).await {
                Ok(()) => report.delivered += 1,
                Err(e) => {
                    warn!(
                        "Failed to deliver message from {} to {} ({}): {}",
                        sender,
                        username,
                        peer.addr(),
                        e
                    );
                    report.failed += 1;
                }
            }
        }

        debug!(
            "Broadcast from {}: {} delivered, {} failed",
            sender, report.delivered, report.failed
        );
        report
    }
}
