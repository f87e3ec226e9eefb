use std::sync::Mutex;

use chrono::{DateTime, Utc};
use tracing::{debug, info};

use tandem_proto::ServerEnvelope;

use crate::registry::{Registry, Session};

/// A participant waiting to be paired.
#[derive(Debug, Clone)]
pub struct QueueEntry {
    pub user_id: i64,
    pub topic: Option<String>,
    pub joined_at: DateTime<Utc>,
}

impl QueueEntry {
    pub fn new(user_id: i64, topic: Option<String>) -> Self {
        Self {
            user_id,
            topic,
            joined_at: Utc::now(),
        }
    }

    /// Same tag, or either side has no preference.
    fn compatible_with(&self, other: &QueueEntry) -> bool {
        match (&self.topic, &other.topic) {
            (Some(a), Some(b)) => a == b,
            _ => true,
        }
    }
}

/// Topic both sides end up with: the concrete tag if anyone named one,
/// otherwise "General".
fn agreed_topic(a: &QueueEntry, b: &QueueEntry) -> String {
    a.topic
        .clone()
        .or_else(|| b.topic.clone())
        .unwrap_or_else(|| "General".to_string())
}

#[derive(Debug, PartialEq, Eq)]
pub enum JoinOutcome {
    /// Paired immediately; `matched` was pushed to both sides.
    Matched,
    /// No compatible partner yet; `searching` was pushed to the caller.
    Enqueued,
    /// The caller already holds a queue entry.
    AlreadyQueued,
    /// The caller already has an active session.
    AlreadyMatched,
}

/// The waiting list. All pairing decisions happen under one lock so a
/// waiting entry is removed atomically with the decision to match it:
/// two concurrent joins can never both claim the same entry.
///
/// Matching policy is strict: mismatched tags never pair, and there is no
/// timed relaxation. An entry with no topic matches any tag.
pub struct Matchmaker {
    waiting: Mutex<Vec<QueueEntry>>,
}

impl Matchmaker {
    pub fn new() -> Self {
        Self {
            waiting: Mutex::new(Vec::new()),
        }
    }

    /// Join the queue, pairing with the earliest compatible waiting entry if
    /// one exists. Session creation and the `matched`/`searching` pushes
    /// happen inside the waiting-list lock, so a disconnect racing a match
    /// observes either no entry or a full session, never a half-formed one.
    pub fn join(&self, registry: &Registry, entry: QueueEntry) -> JoinOutcome {
        let mut waiting = self.waiting.lock().expect("waiting list poisoned");

        if waiting.iter().any(|e| e.user_id == entry.user_id) {
            return JoinOutcome::AlreadyQueued;
        }
        if registry.in_session(entry.user_id) {
            return JoinOutcome::AlreadyMatched;
        }

        // FIFO: the list is in insertion order, the first compatible and
        // still-connected entry wins.
        let candidate = waiting
            .iter()
            .position(|e| e.compatible_with(&entry) && registry.is_connected(e.user_id));

        match candidate {
            Some(index) => {
                let peer = waiting.remove(index);
                let topic = agreed_topic(&peer, &entry);
                match (
                    registry.connection(peer.user_id),
                    registry.connection(entry.user_id),
                ) {
                    (Some(a), Some(b)) => {
                        let session: Session = registry.create_session(&a, &b, topic);
                        debug!(session_id = %session.id, "pairing formed");
                        JoinOutcome::Matched
                    }
                    // The peer vanished between the liveness check and here;
                    // its entry is already gone, so just queue the caller.
                    _ => {
                        info!(peer = peer.user_id, "waiting entry vanished, enqueueing caller");
                        waiting.push(entry.clone());
                        registry.send_to(entry.user_id, ServerEnvelope::Searching);
                        JoinOutcome::Enqueued
                    }
                }
            }
            None => {
                registry.send_to(entry.user_id, ServerEnvelope::Searching);
                waiting.push(entry);
                JoinOutcome::Enqueued
            }
        }
    }

    /// Remove a queue entry if present. Idempotent, never errors; a
    /// participant who disconnects while queued is silently dropped.
    pub fn cancel(&self, user_id: i64) {
        let mut waiting = self.waiting.lock().expect("waiting list poisoned");
        waiting.retain(|e| e.user_id != user_id);
    }

    pub fn waiting_count(&self) -> usize {
        self.waiting.lock().expect("waiting list poisoned").len()
    }
}

impl Default for Matchmaker {
    fn default() -> Self {
        Self::new()
    }
}
