use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use webrtc::api::media_engine::MIME_TYPE_OPUS;
use webrtc::rtp_transceiver::rtp_codec::RTCRtpCodecCapability;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;

use crate::error::MediaError;

/// Handle to a local audio capture. The voice negotiation exclusively owns
/// it; `stop()` must run on every teardown path so the capture indicator is
/// never left on.
#[derive(Clone)]
pub struct AudioTrack {
    track: Arc<TrackLocalStaticSample>,
    active: Arc<AtomicBool>,
}

impl AudioTrack {
    pub fn new(label: &str) -> Self {
        let track = Arc::new(TrackLocalStaticSample::new(
            RTCRtpCodecCapability {
                mime_type: MIME_TYPE_OPUS.to_owned(),
                clock_rate: 48000,
                channels: 2,
                ..Default::default()
            },
            "audio".to_owned(),
            label.to_owned(),
        ));
        Self {
            track,
            active: Arc::new(AtomicBool::new(true)),
        }
    }

    pub fn local(&self) -> Arc<TrackLocalStaticSample> {
        self.track.clone()
    }

    pub fn stop(&self) {
        self.active.store(false, Ordering::SeqCst);
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }
}

/// Seam for microphone acquisition. Acquisition may suspend arbitrarily long
/// (permission prompt) and may fail; both are local concerns that never
/// produce a signaling envelope.
#[async_trait]
pub trait AudioSource: Send + Sync {
    async fn open(&self) -> Result<AudioTrack, MediaError>;
}

/// Headless stand-in: an Opus track with no samples behind it. Real capture
/// hardware is outside this crate; anything that can produce an
/// `AudioTrack` plugs in through `AudioSource`.
pub struct SilentSource;

#[async_trait]
impl AudioSource for SilentSource {
    async fn open(&self) -> Result<AudioTrack, MediaError> {
        Ok(AudioTrack::new("tandem-mic"))
    }
}
