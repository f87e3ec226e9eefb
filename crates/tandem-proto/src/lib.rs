//! Wire protocol for the tandem signaling channel.
//! Kept in a dedicated crate so the lobby server and the client core share
//! one definition of the envelope set without pulling in either runtime.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Identity of a matched conversation partner, as delivered in `matched`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartnerInfo {
    pub id: i64,
    pub full_name: String,
}

/// Envelopes sent from a participant to the lobby server.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientEnvelope {
    /// Enter the matchmaking queue, optionally constrained to a topic.
    JoinQueue {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        topic: Option<String>,
    },
    /// Withdraw from the queue. Idempotent.
    CancelQueue,
    /// Chat line for the current session partner.
    Chat { content: String },
    VoiceRequest,
    VoiceAccept,
    VoiceReject,
    VoiceEnd,
    /// SDP offer. Opaque to the relay.
    Offer { data: serde_json::Value },
    /// SDP answer. Opaque to the relay.
    Answer { data: serde_json::Value },
    /// ICE candidate. Opaque to the relay.
    #[serde(rename = "ice-candidate")]
    IceCandidate { data: serde_json::Value },
    /// Leave the current session.
    Leave,
}

/// Envelopes sent from the lobby server to a participant.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerEnvelope {
    /// Handshake acknowledgment; the connection is registered.
    Connected,
    /// Queued, no compatible partner yet.
    Searching,
    /// A pairing was formed.
    Matched {
        session_id: String,
        partner: PartnerInfo,
        topic: String,
    },
    /// Relayed chat line. Sender identity, per-sender sequence number, and
    /// timestamp are stamped by the relay, never taken from the sender.
    Chat {
        content: String,
        from_user_id: i64,
        seq: u64,
        timestamp: DateTime<Utc>,
    },
    PartnerLeft {
        message: String,
    },
    VoiceRequest,
    VoiceAccept,
    VoiceReject,
    VoiceEnd,
    Offer {
        data: serde_json::Value,
    },
    Answer {
        data: serde_json::Value,
    },
    #[serde(rename = "ice-candidate")]
    IceCandidate {
        data: serde_json::Value,
    },
    Error {
        message: String,
    },
}

impl ClientEnvelope {
    /// Convert an inbound envelope into its relayed form for the session
    /// partner. Returns `None` for envelopes the relay never forwards
    /// (queue control and leave are handled by the server itself).
    ///
    /// Payloads pass through verbatim; only `chat` gains server-stamped
    /// sender identity, sequence number, and timestamp.
    pub fn into_relay(
        self,
        from_user_id: i64,
        seq: u64,
        timestamp: DateTime<Utc>,
    ) -> Option<ServerEnvelope> {
        match self {
            ClientEnvelope::Chat { content } => Some(ServerEnvelope::Chat {
                content,
                from_user_id,
                seq,
                timestamp,
            }),
            ClientEnvelope::VoiceRequest => Some(ServerEnvelope::VoiceRequest),
            ClientEnvelope::VoiceAccept => Some(ServerEnvelope::VoiceAccept),
            ClientEnvelope::VoiceReject => Some(ServerEnvelope::VoiceReject),
            ClientEnvelope::VoiceEnd => Some(ServerEnvelope::VoiceEnd),
            ClientEnvelope::Offer { data } => Some(ServerEnvelope::Offer { data }),
            ClientEnvelope::Answer { data } => Some(ServerEnvelope::Answer { data }),
            ClientEnvelope::IceCandidate { data } => Some(ServerEnvelope::IceCandidate { data }),
            ClientEnvelope::JoinQueue { .. }
            | ClientEnvelope::CancelQueue
            | ClientEnvelope::Leave => None,
        }
    }
}

/// Generate a fresh session identifier.
pub fn generate_session_id() -> String {
    Uuid::new_v4().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tag_values_match_the_wire_contract() {
        let cases = [
            (
                serde_json::to_value(ClientEnvelope::JoinQueue {
                    topic: Some("travel".into()),
                })
                .unwrap(),
                "join_queue",
            ),
            (
                serde_json::to_value(ClientEnvelope::VoiceRequest).unwrap(),
                "voice_request",
            ),
            (
                serde_json::to_value(ClientEnvelope::IceCandidate {
                    data: serde_json::json!({"candidate": "candidate:0"}),
                })
                .unwrap(),
                "ice-candidate",
            ),
        ];
        for (value, tag) in cases {
            assert_eq!(value["type"], tag);
        }
    }

    #[test]
    fn matched_payload_shape() {
        let envelope = ServerEnvelope::Matched {
            session_id: "abc".into(),
            partner: PartnerInfo {
                id: 7,
                full_name: "Nadia".into(),
            },
            topic: "travel".into(),
        };
        let value = serde_json::to_value(&envelope).unwrap();
        assert_eq!(value["type"], "matched");
        assert_eq!(value["session_id"], "abc");
        assert_eq!(value["partner"]["id"], 7);
        assert_eq!(value["partner"]["full_name"], "Nadia");
        assert_eq!(value["topic"], "travel");
    }

    #[test]
    fn join_queue_without_topic_omits_the_field() {
        let json = serde_json::to_string(&ClientEnvelope::JoinQueue { topic: None }).unwrap();
        assert_eq!(json, r#"{"type":"join_queue"}"#);
        // And the sparse form parses back.
        let parsed: ClientEnvelope = serde_json::from_str(&json).unwrap();
        assert!(matches!(parsed, ClientEnvelope::JoinQueue { topic: None }));
    }

    #[test]
    fn chat_relay_is_stamped_by_the_server() {
        let now = Utc::now();
        let relayed = ClientEnvelope::Chat {
            content: "hoi".into(),
        }
        .into_relay(42, 3, now)
        .unwrap();
        match relayed {
            ServerEnvelope::Chat {
                content,
                from_user_id,
                seq,
                timestamp,
            } => {
                assert_eq!(content, "hoi");
                assert_eq!(from_user_id, 42);
                assert_eq!(seq, 3);
                assert_eq!(timestamp, now);
            }
            other => panic!("unexpected relay form: {other:?}"),
        }
    }

    #[test]
    fn signaling_payloads_relay_verbatim() {
        let data = serde_json::json!({"sdp": "v=0...", "type": "offer"});
        let relayed = ClientEnvelope::Offer { data: data.clone() }
            .into_relay(1, 1, Utc::now())
            .unwrap();
        match relayed {
            ServerEnvelope::Offer { data: forwarded } => assert_eq!(forwarded, data),
            other => panic!("unexpected relay form: {other:?}"),
        }
    }

    #[test]
    fn queue_control_is_never_relayed() {
        assert!(ClientEnvelope::CancelQueue
            .into_relay(1, 1, Utc::now())
            .is_none());
        assert!(ClientEnvelope::Leave.into_relay(1, 1, Utc::now()).is_none());
        assert!(ClientEnvelope::JoinQueue { topic: None }
            .into_relay(1, 1, Utc::now())
            .is_none());
    }
}
