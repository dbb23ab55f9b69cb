//! Debounce dispatcher.
//!
//! Coalesces bursts of significant changes per path into a single
//! [`WorkItem`] once the path has been quiet for the configured window. At
//! most one item per path is in flight; changes arriving meanwhile keep
//! coalescing into the next item, which is released when the running one
//! reports completion.
//!
//! The state machine ([`DebounceState`]) is synchronous and takes explicit
//! instants; [`run_dispatcher`] drives it from channels with a single timer
//! armed for the earliest deadline.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::mpsc;
use tokio::time::{Instant, sleep_until};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use crate::detect::SignificantChange;
use crate::error::{PipelineError, Result};
use crate::metrics::PipelineMetrics;
use crate::types::{ContentHash, WorkItem, WorkReason};

/// Sent back by the orchestrator when a work item finishes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Completion {
    pub path: PathBuf,
    pub sequence: u64,
}

#[derive(Debug)]
struct Pending {
    content_hash: ContentHash,
    reason: WorkReason,
    deadline: Instant,
    coalesced: u32,
}

#[derive(Debug)]
pub struct DebounceState {
    quiet_window: Duration,
    pending: HashMap<PathBuf, Pending>,
    running: HashSet<PathBuf>,
    next_sequence: u64,
}

impl DebounceState {
    pub fn new(quiet_window: Duration) -> Self {
        Self {
            quiet_window,
            pending: HashMap::new(),
            running: HashSet::new(),
            next_sequence: 0,
        }
    }

    /// Record a significant change, restarting the path's quiet window and
    /// replacing the hash with the latest one.
    pub fn observe(&mut self, change: SignificantChange, now: Instant) {
        let deadline = now + self.quiet_window;
        match self.pending.get_mut(&change.path) {
            Some(entry) => {
                entry.content_hash = change.content_hash;
                entry.reason = change.reason;
                entry.deadline = deadline;
                entry.coalesced += 1;
                trace!(
                    target: "vigil::debounce",
                    path = %change.path.display(),
                    coalesced = entry.coalesced,
                    "quiet window restarted"
                );
            }
            None => {
                self.pending.insert(
                    change.path,
                    Pending {
                        content_hash: change.content_hash,
                        reason: change.reason,
                        deadline,
                        coalesced: 1,
                    },
                );
            }
        }
    }

    /// Release the in-flight slot for `path`.
    pub fn complete(&mut self, path: &Path) {
        self.running.remove(path);
    }

    /// Earliest deadline among entries that are allowed to fire.
    pub fn next_deadline(&self) -> Option<Instant> {
        self.pending
            .iter()
            .filter(|(path, _)| !self.running.contains(*path))
            .map(|(_, entry)| entry.deadline)
            .min()
    }

    /// Emit a work item for every quiet path with nothing in flight, oldest
    /// deadline first. Emitted paths are marked running.
    pub fn take_ready(&mut self, now: Instant) -> Vec<WorkItem> {
        let mut ready: Vec<(PathBuf, Instant)> = self
            .pending
            .iter()
            .filter(|(path, entry)| entry.deadline <= now && !self.running.contains(*path))
            .map(|(path, entry)| (path.clone(), entry.deadline))
            .collect();
        ready.sort_by(|a, b| a.1.cmp(&b.1).then_with(|| a.0.cmp(&b.0)));

        let mut items = Vec::with_capacity(ready.len());
        for (path, _) in ready {
            let Some(entry) = self.pending.remove(&path) else {
                continue;
            };
            self.next_sequence += 1;
            debug!(
                target: "vigil::debounce",
                path = %path.display(),
                hash = %entry.content_hash.short(),
                reason = %entry.reason,
                coalesced = entry.coalesced,
                sequence = self.next_sequence,
                "work item emitted"
            );
            self.running.insert(path.clone());
            items.push(WorkItem {
                path,
                content_hash: entry.content_hash,
                enqueued_at: Utc::now(),
                reason: entry.reason,
                sequence: self.next_sequence,
            });
        }
        items
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    pub fn running_len(&self) -> usize {
        self.running.len()
    }

    pub fn is_idle(&self) -> bool {
        self.pending.is_empty() && self.running.is_empty()
    }
}

/// Drive a [`DebounceState`] until shutdown, or until the change stream has
/// closed and every emitted item has completed.
pub async fn run_dispatcher(
    mut state: DebounceState,
    mut changes: mpsc::Receiver<SignificantChange>,
    mut completions: mpsc::UnboundedReceiver<Completion>,
    work_tx: mpsc::Sender<WorkItem>,
    metrics: Arc<PipelineMetrics>,
    shutdown: CancellationToken,
) -> Result<()> {
    let mut changes_open = true;

    loop {
        for item in state.take_ready(Instant::now()) {
            metrics.item_queued();
            tokio::select! {
                biased;
                _ = shutdown.cancelled() => return Ok(()),
                sent = work_tx.send(item) => {
                    if sent.is_err() {
                        return Err(PipelineError::Internal(
                            "work queue closed while dispatching".into(),
                        ));
                    }
                }
            }
        }
        metrics.set_pending_paths(state.pending_len() as u64);

        if !changes_open && state.is_idle() {
            debug!(target: "vigil::debounce", "change stream closed and drained");
            return Ok(());
        }

        let deadline = state.next_deadline();
        tokio::select! {
            biased;
            _ = shutdown.cancelled() => return Ok(()),
            done = completions.recv() => match done {
                Some(done) => state.complete(&done.path),
                None => {
                    return Err(PipelineError::Internal(
                        "completion channel closed".into(),
                    ));
                }
            },
            change = changes.recv(), if changes_open => match change {
                Some(change) => state.observe(change, Instant::now()),
                None => changes_open = false,
            },
            _ = sleep_until(deadline.unwrap_or_else(Instant::now)), if deadline.is_some() => {}
        }
    }
}
