//! Ordered, fire-and-forget media dispatch
//!
//! Every captured audio block and camera frame goes through one queue that a
//! single writer task drains, so the remote side sees input in capture order.
//! Payloads are checked against the call guard both when queued and again
//! right before the send.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use super::state::CallGuard;
use crate::session::{MediaBlob, RealtimeSession};

/// Counters for one call's outbound media
#[derive(Debug, Default)]
pub struct DispatchStats {
    sent: AtomicU64,
    dropped: AtomicU64,
    failed: AtomicU64,
}

impl DispatchStats {
    /// Payloads delivered to the session
    #[must_use]
    pub fn sent(&self) -> u64 {
        self.sent.load(Ordering::Relaxed)
    }

    /// Payloads discarded because the call was no longer connected
    #[must_use]
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Payloads the session rejected
    #[must_use]
    pub fn failed(&self) -> u64 {
        self.failed.load(Ordering::Relaxed)
    }
}

/// Queue in front of a live session
pub struct Dispatcher {
    tx: mpsc::UnboundedSender<MediaBlob>,
    guard: CallGuard,
    stats: Arc<DispatchStats>,
    writer: JoinHandle<()>,
}

impl Dispatcher {
    /// Spawn the writer task for a session
    #[must_use]
    pub fn spawn(session: Arc<dyn RealtimeSession>, guard: CallGuard) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let stats = Arc::new(DispatchStats::default());
        let writer = tokio::spawn(write_loop(session, guard.clone(), rx, Arc::clone(&stats)));

        Self {
            tx,
            guard,
            stats,
            writer,
        }
    }

    /// Queue a payload; returns false if it was dropped instead
    pub fn dispatch(&self, blob: MediaBlob) -> bool {
        if !self.guard.is_live() {
            self.stats.dropped.fetch_add(1, Ordering::Relaxed);
            tracing::trace!(mime_type = %blob.mime_type, "call not connected, payload dropped");
            return false;
        }

        if self.tx.send(blob).is_err() {
            self.stats.dropped.fetch_add(1, Ordering::Relaxed);
            return false;
        }
        true
    }

    /// Shared counters
    #[must_use]
    pub fn stats(&self) -> Arc<DispatchStats> {
        Arc::clone(&self.stats)
    }

    /// Wait for the writer to exit
    ///
    /// The writer exits once the call token is cancelled, or once every
    /// queued payload has been handled after the dispatcher is dropped.
    pub async fn join(self) {
        let Self { tx, writer, .. } = self;
        drop(tx);
        if let Err(e) = writer.await {
            tracing::debug!(error = %e, "dispatch writer ended abnormally");
        }
    }
}

async fn write_loop(
    session: Arc<dyn RealtimeSession>,
    guard: CallGuard,
    mut rx: mpsc::UnboundedReceiver<MediaBlob>,
    stats: Arc<DispatchStats>,
) {
    loop {
        let blob = tokio::select! {
            biased;
            () = guard.token().cancelled() => break,
            next = rx.recv() => match next {
                Some(blob) => blob,
                None => break,
            },
        };

        // Queued while connected, but the call may have ended since
        if !guard.is_live() {
            stats.dropped.fetch_add(1, Ordering::Relaxed);
            tracing::trace!(mime_type = %blob.mime_type, "stale payload dropped");
            continue;
        }

        let mime_type = blob.mime_type.clone();
        match session.send_realtime_input(blob).await {
            Ok(()) => {
                stats.sent.fetch_add(1, Ordering::Relaxed);
            }
            Err(e) => {
                stats.failed.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(%mime_type, error = %e, "realtime input send failed");
            }
        }
    }

    let dropped = rx.len();
    if dropped > 0 {
        stats
            .dropped
            .fetch_add(u64::try_from(dropped).unwrap_or(u64::MAX), Ordering::Relaxed);
    }
    tracing::debug!(
        sent = stats.sent(),
        dropped = stats.dropped(),
        failed = stats.failed(),
        "dispatch writer stopped"
    );
}
