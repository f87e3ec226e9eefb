use std::collections::VecDeque;
use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use webrtc::api::media_engine::MediaEngine;
use webrtc::api::APIBuilder;
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::ice_transport::ice_connection_state::RTCIceConnectionState;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::offer_answer_options::RTCOfferOptions;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::track::track_local::TrackLocal;

use crate::error::VoiceError;
use crate::media::AudioTrack;

/// ICE candidate as carried in `ice-candidate` envelopes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CandidatePayload {
    pub candidate: String,
    pub sdp_mid: Option<String>,
    pub sdp_mline_index: Option<u16>,
}

impl CandidatePayload {
    fn from_init(init: RTCIceCandidateInit) -> Self {
        Self {
            candidate: init.candidate,
            sdp_mid: init.sdp_mid,
            sdp_mline_index: init.sdp_mline_index,
        }
    }

    fn into_init(self) -> RTCIceCandidateInit {
        RTCIceCandidateInit {
            candidate: self.candidate,
            sdp_mid: self.sdp_mid,
            sdp_mline_index: self.sdp_mline_index,
            username_fragment: None,
        }
    }
}

/// What happened to a remote candidate handed to the link.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CandidateDisposition {
    /// Held until the remote description exists.
    Buffered,
    /// Applied to the peer connection directly.
    Applied,
}

/// Holds remote candidates that arrive before the remote description.
/// Candidates are never dropped for being early; they are replayed in
/// arrival order by a drain that runs exactly once, right after the remote
/// description is applied. Candidates arriving after the drain bypass the
/// buffer entirely.
pub struct CandidateBuffer {
    pending: VecDeque<RTCIceCandidateInit>,
    drained: bool,
    cap: usize,
}

impl CandidateBuffer {
    pub fn new(cap: usize) -> Self {
        Self {
            pending: VecDeque::new(),
            drained: false,
            cap,
        }
    }

    /// `Some(init)` means the caller should apply the candidate now;
    /// `None` means it was buffered.
    pub fn admit(&mut self, init: RTCIceCandidateInit) -> Option<RTCIceCandidateInit> {
        if self.drained {
            return Some(init);
        }
        if self.pending.len() == self.cap {
            warn!("candidate buffer full, dropping oldest");
            self.pending.pop_front();
        }
        self.pending.push_back(init);
        None
    }

    /// One-shot: the first call yields everything in arrival order, any
    /// later call yields nothing (retry paths must not re-apply).
    pub fn drain(&mut self) -> Vec<RTCIceCandidateInit> {
        self.drained = true;
        self.pending.drain(..).collect()
    }

    pub fn clear(&mut self) {
        self.pending.clear();
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}

/// Events the link pushes to the session controller. Tagged with the voice
/// epoch they belong to so events from a torn-down link are discarded
/// instead of driving a dead negotiation.
#[derive(Debug)]
pub enum LinkEvent {
    LocalCandidate {
        epoch: u64,
        payload: serde_json::Value,
    },
    IceState {
        epoch: u64,
        state: RTCIceConnectionState,
    },
}

/// One peer connection for one voice attempt: SDP exchange, candidate
/// buffering, and unconditional teardown.
pub struct VoiceLink {
    pc: Arc<RTCPeerConnection>,
    track: AudioTrack,
    buffer: Mutex<CandidateBuffer>,
    initiator: bool,
}

pub(crate) const CANDIDATE_BUFFER_CAP: usize = 64;

impl VoiceLink {
    pub async fn new(
        track: AudioTrack,
        initiator: bool,
        epoch: u64,
        events: mpsc::UnboundedSender<LinkEvent>,
    ) -> Result<Self, VoiceError> {
        let mut media = MediaEngine::default();
        media.register_default_codecs()?;
        let api = APIBuilder::new().with_media_engine(media).build();
        let pc = Arc::new(
            api.new_peer_connection(RTCConfiguration::default())
                .await?,
        );

        let local: Arc<dyn TrackLocal + Send + Sync> = track.local();
        pc.add_track(local).await?;

        // Candidates go out the moment they are discovered; they may reach
        // the peer before or after the SDP exchange completes.
        let events_ice = events.clone();
        pc.on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
            let events = events_ice.clone();
            Box::pin(async move {
                let Some(candidate) = candidate else { return };
                match candidate.to_json() {
                    Ok(init) => {
                        let payload = CandidatePayload::from_init(init);
                        if let Ok(payload) = serde_json::to_value(&payload) {
                            let _ = events.send(LinkEvent::LocalCandidate { epoch, payload });
                        }
                    }
                    Err(err) => warn!("failed to encode local candidate: {err}"),
                }
            })
        }));

        let events_state = events.clone();
        pc.on_ice_connection_state_change(Box::new(move |state: RTCIceConnectionState| {
            let events = events_state.clone();
            Box::pin(async move {
                let _ = events.send(LinkEvent::IceState { epoch, state });
            })
        }));

        Ok(Self {
            pc,
            track,
            buffer: Mutex::new(CandidateBuffer::new(CANDIDATE_BUFFER_CAP)),
            initiator,
        })
    }

    pub fn is_initiator(&self) -> bool {
        self.initiator
    }

    pub fn buffered_len(&self) -> usize {
        self.buffer.lock().len()
    }

    /// Create and install a local offer. `ice_restart` re-keys ICE for
    /// recovery after `disconnected`/`failed`.
    pub async fn create_offer(&self, ice_restart: bool) -> Result<serde_json::Value, VoiceError> {
        let options = if ice_restart {
            Some(RTCOfferOptions {
                ice_restart: true,
                ..Default::default()
            })
        } else {
            None
        };
        let offer = self.pc.create_offer(options).await?;
        self.pc.set_local_description(offer.clone()).await?;
        serde_json::to_value(&offer).map_err(|err| VoiceError::Payload(err.to_string()))
    }

    /// Apply a remote offer, replay buffered candidates, answer.
    pub async fn accept_offer(
        &self,
        data: serde_json::Value,
    ) -> Result<serde_json::Value, VoiceError> {
        let offer = remote_description(&data, RTCSessionDescription::offer)?;
        self.pc.set_remote_description(offer).await?;
        self.drain_buffered().await?;
        let answer = self.pc.create_answer(None).await?;
        self.pc.set_local_description(answer.clone()).await?;
        serde_json::to_value(&answer).map_err(|err| VoiceError::Payload(err.to_string()))
    }

    /// Apply a remote answer and replay buffered candidates.
    pub async fn accept_answer(&self, data: serde_json::Value) -> Result<(), VoiceError> {
        let answer = remote_description(&data, RTCSessionDescription::answer)?;
        self.pc.set_remote_description(answer).await?;
        self.drain_buffered().await?;
        Ok(())
    }

    /// Apply or buffer a remote candidate per the ordering rule: nothing is
    /// applied before the remote description exists.
    pub async fn handle_remote_candidate(
        &self,
        data: serde_json::Value,
    ) -> Result<CandidateDisposition, VoiceError> {
        let payload: CandidatePayload =
            serde_json::from_value(data).map_err(|err| VoiceError::Payload(err.to_string()))?;
        let direct = self.buffer.lock().admit(payload.into_init());
        match direct {
            Some(init) => {
                self.pc.add_ice_candidate(init).await?;
                Ok(CandidateDisposition::Applied)
            }
            None => Ok(CandidateDisposition::Buffered),
        }
    }

    async fn drain_buffered(&self) -> Result<usize, VoiceError> {
        let drained = self.buffer.lock().drain();
        let count = drained.len();
        for init in drained {
            self.pc.add_ice_candidate(init).await?;
        }
        if count > 0 {
            debug!(count, "applied buffered remote candidates");
        }
        Ok(count)
    }

    pub fn connection_state(&self) -> RTCPeerConnectionState {
        self.pc.connection_state()
    }

    /// Unconditional teardown: stop the capture, close the peer connection,
    /// clear buffered candidates. Safe to call from any state.
    pub async fn teardown(&self) {
        self.track.stop();
        self.buffer.lock().clear();
        if let Err(err) = self.pc.close().await {
            debug!("peer connection close: {err}");
        }
    }
}

fn remote_description(
    data: &serde_json::Value,
    build: impl Fn(String) -> Result<RTCSessionDescription, webrtc::Error>,
) -> Result<RTCSessionDescription, VoiceError> {
    let sdp = data
        .get("sdp")
        .and_then(|v| v.as_str())
        .ok_or_else(|| VoiceError::Payload("missing sdp field".to_string()))?;
    Ok(build(sdp.to_string())?)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn init(n: u16) -> RTCIceCandidateInit {
        RTCIceCandidateInit {
            candidate: format!("candidate:{n} 1 udp 2130706431 127.0.0.1 {} typ host", 50000 + n),
            sdp_mid: Some("0".to_string()),
            sdp_mline_index: Some(0),
            username_fragment: None,
        }
    }

    #[test]
    fn buffer_holds_until_drain_and_preserves_arrival_order() {
        let mut buffer = CandidateBuffer::new(8);
        for n in 0..3 {
            assert!(buffer.admit(init(n)).is_none());
        }
        assert_eq!(buffer.len(), 3);

        let drained = buffer.drain();
        let candidates: Vec<_> = drained.iter().map(|c| c.candidate.clone()).collect();
        assert_eq!(
            candidates,
            vec![init(0).candidate, init(1).candidate, init(2).candidate]
        );
    }

    #[test]
    fn drain_is_one_shot() {
        let mut buffer = CandidateBuffer::new(8);
        buffer.admit(init(0));
        assert_eq!(buffer.drain().len(), 1);
        assert!(buffer.drain().is_empty());
        // After the drain, candidates bypass the buffer.
        assert!(buffer.admit(init(1)).is_some());
        assert!(buffer.is_empty());
    }

    #[test]
    fn buffer_overflow_drops_oldest() {
        let mut buffer = CandidateBuffer::new(2);
        buffer.admit(init(0));
        buffer.admit(init(1));
        buffer.admit(init(2));
        let drained = buffer.drain();
        assert_eq!(drained.len(), 2);
        assert_eq!(drained[0].candidate, init(1).candidate);
        assert_eq!(drained[1].candidate, init(2).candidate);
    }

    #[test]
    fn candidate_payload_round_trips() {
        let payload = CandidatePayload::from_init(init(4));
        let value = serde_json::to_value(&payload).unwrap();
        assert!(value["candidate"].as_str().unwrap().starts_with("candidate:4"));
        let back: CandidatePayload = serde_json::from_value(value).unwrap();
        assert_eq!(back.sdp_mline_index, Some(0));
    }

    fn link_events() -> mpsc::UnboundedSender<LinkEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        // Keep the receiver alive for the test duration.
        std::mem::forget(rx);
        tx
    }

    #[tokio::test]
    async fn early_candidates_apply_after_remote_description() {
        let initiator = VoiceLink::new(AudioTrack::new("a"), true, 1, link_events())
            .await
            .unwrap();
        let responder = VoiceLink::new(AudioTrack::new("b"), false, 1, link_events())
            .await
            .unwrap();

        // Three candidates land before the offer does.
        for n in 0..3 {
            let payload = serde_json::to_value(CandidatePayload::from_init(init(n))).unwrap();
            let disposition = responder.handle_remote_candidate(payload).await.unwrap();
            assert_eq!(disposition, CandidateDisposition::Buffered);
        }
        assert_eq!(responder.buffered_len(), 3);

        let offer = initiator.create_offer(false).await.unwrap();
        let answer = responder.accept_offer(offer).await.unwrap();
        // All three were applied, none dropped.
        assert_eq!(responder.buffered_len(), 0);

        initiator.accept_answer(answer).await.unwrap();

        // A candidate arriving after the drain is applied directly.
        let late = serde_json::to_value(CandidatePayload::from_init(init(7))).unwrap();
        let disposition = responder.handle_remote_candidate(late).await.unwrap();
        assert_eq!(disposition, CandidateDisposition::Applied);

        initiator.teardown().await;
        responder.teardown().await;
    }

    #[tokio::test]
    async fn teardown_stops_capture_and_closes_connection() {
        let track = AudioTrack::new("mic");
        let capture = track.clone();
        let link = VoiceLink::new(track, true, 1, link_events()).await.unwrap();
        let _ = link.create_offer(false).await.unwrap();

        link.teardown().await;

        assert!(!capture.is_active());
        assert_eq!(link.connection_state(), RTCPeerConnectionState::Closed);
        assert_eq!(link.buffered_len(), 0);
    }
}
