use chrono::{DateTime, Utc};
use dashmap::DashMap;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use tandem_proto::{ClientEnvelope, PartnerInfo, ServerEnvelope};

/// Outbound side of one participant's signaling channel.
#[derive(Clone)]
pub struct ConnectionHandle {
    pub user_id: i64,
    pub full_name: String,
    pub tx: mpsc::UnboundedSender<ServerEnvelope>,
}

/// A matched pair of participants.
#[derive(Debug, Clone)]
pub struct Session {
    pub id: String,
    pub participants: [i64; 2],
    pub topic: String,
    pub created_at: DateTime<Utc>,
    /// Per-participant relay sequence counters, indexed like `participants`.
    /// Each counter only ever grows.
    seq: [u64; 2],
}

impl Session {
    pub fn partner_of(&self, user_id: i64) -> Option<i64> {
        match self.participants {
            [a, b] if a == user_id => Some(b),
            [a, b] if b == user_id => Some(a),
            _ => None,
        }
    }

    fn member_index(&self, user_id: i64) -> Option<usize> {
        self.participants.iter().position(|&p| p == user_id)
    }
}

#[derive(Debug, thiserror::Error)]
#[error("user {0} already has an open signaling channel")]
pub struct AlreadyConnected(pub i64);

/// Connection and session state for the whole lobby. Explicitly owned and
/// injectable so tests can run several isolated instances.
pub struct Registry {
    connections: DashMap<i64, ConnectionHandle>,
    sessions: DashMap<String, Session>,
    /// participant id -> session id. A participant appears here at most once.
    membership: DashMap<i64, String>,
}

impl Registry {
    pub fn new() -> Self {
        Self {
            connections: DashMap::new(),
            sessions: DashMap::new(),
            membership: DashMap::new(),
        }
    }

    pub fn register(&self, handle: ConnectionHandle) -> Result<(), AlreadyConnected> {
        let user_id = handle.user_id;
        match self.connections.entry(user_id) {
            dashmap::mapref::entry::Entry::Occupied(_) => Err(AlreadyConnected(user_id)),
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                slot.insert(handle);
                Ok(())
            }
        }
    }

    pub fn deregister(&self, user_id: i64) {
        self.connections.remove(&user_id);
    }

    pub fn is_connected(&self, user_id: i64) -> bool {
        self.connections.contains_key(&user_id)
    }

    pub fn connection(&self, user_id: i64) -> Option<ConnectionHandle> {
        self.connections.get(&user_id).map(|c| c.clone())
    }

    /// Push an envelope to a participant. Send failures are logged, never
    /// propagated: a sender is not blocked by its recipient.
    pub fn send_to(&self, user_id: i64, envelope: ServerEnvelope) {
        match self.connections.get(&user_id) {
            Some(conn) => {
                if conn.tx.send(envelope).is_err() {
                    warn!(user_id, "dropping envelope: connection task gone");
                }
            }
            None => debug!(user_id, "dropping envelope: not connected"),
        }
    }

    pub fn session_of(&self, user_id: i64) -> Option<String> {
        self.membership.get(&user_id).map(|s| s.clone())
    }

    pub fn in_session(&self, user_id: i64) -> bool {
        self.membership.contains_key(&user_id)
    }

    /// Record a freshly formed pairing and announce it to both sides.
    pub fn create_session(&self, a: &ConnectionHandle, b: &ConnectionHandle, topic: String) -> Session {
        let session = Session {
            id: tandem_proto::generate_session_id(),
            participants: [a.user_id, b.user_id],
            topic: topic.clone(),
            created_at: Utc::now(),
            seq: [0, 0],
        };
        self.sessions.insert(session.id.clone(), session.clone());
        self.membership.insert(a.user_id, session.id.clone());
        self.membership.insert(b.user_id, session.id.clone());
        info!(
            session_id = %session.id,
            a = a.user_id,
            b = b.user_id,
            topic = %topic,
            "session created"
        );

        self.send_to(
            a.user_id,
            ServerEnvelope::Matched {
                session_id: session.id.clone(),
                partner: PartnerInfo {
                    id: b.user_id,
                    full_name: b.full_name.clone(),
                },
                topic: topic.clone(),
            },
        );
        self.send_to(
            b.user_id,
            ServerEnvelope::Matched {
                session_id: session.id.clone(),
                partner: PartnerInfo {
                    id: a.user_id,
                    full_name: a.full_name.clone(),
                },
                topic,
            },
        );
        session
    }

    /// Forward an envelope to the sender's partner, verbatim except for the
    /// chat stamp. The relay never inspects signaling payloads. Missing
    /// session or recipient is logged and swallowed.
    ///
    /// Every relayed envelope advances the sender's sequence counter, so a
    /// participant's relayed traffic is totally ordered within the session.
    pub fn relay(&self, session_id: &str, sender_id: i64, envelope: ClientEnvelope) {
        let (partner, seq) = {
            let Some(mut session) = self.sessions.get_mut(session_id) else {
                debug!(session_id, sender_id, "relay into missing session");
                return;
            };
            let Some(index) = session.member_index(sender_id) else {
                warn!(session_id, sender_id, "relay from non-member");
                return;
            };
            session.seq[index] += 1;
            (session.participants[1 - index], session.seq[index])
        };
        let Some(relayed) = envelope.into_relay(sender_id, seq, Utc::now()) else {
            warn!(session_id, sender_id, "envelope is not relayable");
            return;
        };
        self.send_to(partner, relayed);
    }

    /// Destroy a session on behalf of one participant, notifying the other.
    /// Idempotent: a second leave for the same session is a no-op.
    pub fn leave(&self, session_id: &str, participant_id: i64) {
        let Some((_, session)) = self.sessions.remove(session_id) else {
            return;
        };
        for id in session.participants {
            self.membership.remove(&id);
        }
        if let Some(partner) = session.partner_of(participant_id) {
            self.send_to(
                partner,
                ServerEnvelope::PartnerLeft {
                    message: "Your partner left the conversation".to_string(),
                },
            );
        }
        info!(session_id, participant_id, "session destroyed");
    }

    #[cfg(test)]
    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    #[cfg(test)]
    pub fn sequence_of(&self, session_id: &str, user_id: i64) -> Option<u64> {
        let session = self.sessions.get(session_id)?;
        let index = session.member_index(user_id)?;
        Some(session.seq[index])
    }
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn connect(registry: &Registry, id: i64, name: &str) -> mpsc::UnboundedReceiver<ServerEnvelope> {
        let (tx, rx) = mpsc::unbounded_channel();
        registry
            .register(ConnectionHandle {
                user_id: id,
                full_name: name.to_string(),
                tx,
            })
            .unwrap();
        rx
    }

    fn handle(registry: &Registry, id: i64) -> ConnectionHandle {
        registry.connection(id).unwrap()
    }

    #[test]
    fn second_channel_for_same_user_is_rejected() {
        let registry = Registry::new();
        let _rx = connect(&registry, 1, "Ana");
        let (tx, _rx2) = mpsc::unbounded_channel();
        let err = registry.register(ConnectionHandle {
            user_id: 1,
            full_name: "Ana".into(),
            tx,
        });
        assert!(err.is_err());
    }

    #[test]
    fn matched_is_symmetric() {
        let registry = Registry::new();
        let mut rx_a = connect(&registry, 1, "Ana");
        let mut rx_b = connect(&registry, 2, "Ben");
        let session =
            registry.create_session(&handle(&registry, 1), &handle(&registry, 2), "travel".into());

        let (sid_a, partner_a) = match rx_a.try_recv().unwrap() {
            ServerEnvelope::Matched {
                session_id,
                partner,
                topic,
            } => {
                assert_eq!(topic, "travel");
                (session_id, partner)
            }
            other => panic!("unexpected: {other:?}"),
        };
        let (sid_b, partner_b) = match rx_b.try_recv().unwrap() {
            ServerEnvelope::Matched {
                session_id, partner, ..
            } => (session_id, partner),
            other => panic!("unexpected: {other:?}"),
        };
        assert_eq!(sid_a, sid_b);
        assert_eq!(sid_a, session.id);
        assert_eq!(partner_a.id, 2);
        assert_eq!(partner_a.full_name, "Ben");
        assert_eq!(partner_b.id, 1);
        assert_eq!(registry.session_of(1), registry.session_of(2));
    }

    #[test]
    fn chat_is_stamped_and_signaling_passes_verbatim() {
        let registry = Registry::new();
        let _rx_a = connect(&registry, 1, "Ana");
        let mut rx_b = connect(&registry, 2, "Ben");
        let session =
            registry.create_session(&handle(&registry, 1), &handle(&registry, 2), "General".into());
        let _ = rx_b.try_recv(); // drain matched

        registry.relay(
            &session.id,
            1,
            ClientEnvelope::Chat {
                content: "hello".into(),
            },
        );
        match rx_b.try_recv().unwrap() {
            ServerEnvelope::Chat {
                content,
                from_user_id,
                ..
            } => {
                assert_eq!(content, "hello");
                assert_eq!(from_user_id, 1);
            }
            other => panic!("unexpected: {other:?}"),
        }

        let payload = serde_json::json!({"candidate": "candidate:1 1 udp 1 10.0.0.1 9 typ host"});
        registry.relay(
            &session.id,
            1,
            ClientEnvelope::IceCandidate {
                data: payload.clone(),
            },
        );
        match rx_b.try_recv().unwrap() {
            ServerEnvelope::IceCandidate { data } => assert_eq!(data, payload),
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn relay_sequence_grows_per_sender() {
        let registry = Registry::new();
        let mut rx_a = connect(&registry, 1, "Ana");
        let mut rx_b = connect(&registry, 2, "Ben");
        let session =
            registry.create_session(&handle(&registry, 1), &handle(&registry, 2), "General".into());
        let _ = rx_a.try_recv();
        let _ = rx_b.try_recv();

        let chat = |content: &str| ClientEnvelope::Chat {
            content: content.to_string(),
        };
        registry.relay(&session.id, 1, chat("one"));
        // Signaling traffic advances the sender's counter too.
        registry.relay(&session.id, 1, ClientEnvelope::VoiceRequest);
        registry.relay(&session.id, 1, chat("three"));
        registry.relay(&session.id, 2, chat("reply"));

        let seq_of_chat = |envelope: ServerEnvelope| match envelope {
            ServerEnvelope::Chat { seq, .. } => Some(seq),
            _ => None,
        };
        let first = seq_of_chat(rx_b.try_recv().unwrap()).unwrap();
        let _voice = rx_b.try_recv().unwrap();
        let second = seq_of_chat(rx_b.try_recv().unwrap()).unwrap();
        assert_eq!(first, 1);
        assert_eq!(second, 3);
        assert!(second > first);

        // The partner's counter is independent.
        assert_eq!(seq_of_chat(rx_a.try_recv().unwrap()), Some(1));
        assert_eq!(registry.sequence_of(&session.id, 1), Some(3));
        assert_eq!(registry.sequence_of(&session.id, 2), Some(1));
    }

    #[test]
    fn relay_into_missing_session_is_silent() {
        let registry = Registry::new();
        let _rx = connect(&registry, 1, "Ana");
        // Must not panic or error.
        registry.relay("nope", 1, ClientEnvelope::VoiceRequest);
    }

    #[test]
    fn relay_to_disconnected_partner_does_not_block_sender() {
        let registry = Registry::new();
        let _rx_a = connect(&registry, 1, "Ana");
        let rx_b = connect(&registry, 2, "Ben");
        let session =
            registry.create_session(&handle(&registry, 1), &handle(&registry, 2), "General".into());
        drop(rx_b);
        registry.deregister(2);
        registry.relay(&session.id, 1, ClientEnvelope::VoiceRequest);
    }

    #[test]
    fn leave_notifies_partner_and_clears_membership() {
        let registry = Registry::new();
        let _rx_a = connect(&registry, 1, "Ana");
        let mut rx_b = connect(&registry, 2, "Ben");
        let session =
            registry.create_session(&handle(&registry, 1), &handle(&registry, 2), "General".into());
        let _ = rx_b.try_recv();

        registry.leave(&session.id, 1);
        assert!(matches!(
            rx_b.try_recv().unwrap(),
            ServerEnvelope::PartnerLeft { .. }
        ));
        assert!(!registry.in_session(1));
        assert!(!registry.in_session(2));
        assert_eq!(registry.session_count(), 0);

        // Second leave is a no-op.
        registry.leave(&session.id, 2);
        assert!(rx_b.try_recv().is_err());
    }
}
