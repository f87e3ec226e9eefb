use thiserror::Error;

#[derive(Debug, Error)]
pub enum SignalError {
    #[error("failed to connect to lobby: {0}")]
    Connect(#[from] tokio_tungstenite::tungstenite::Error),
    #[error("handshake timed out")]
    HandshakeTimeout,
    #[error("channel closed during handshake")]
    ClosedDuringHandshake,
    #[error("unexpected handshake envelope: {0}")]
    Handshake(String),
    #[error("signaling channel closed")]
    Closed,
}

#[derive(Debug, Clone, Error)]
pub enum MediaError {
    #[error("microphone permission denied")]
    Denied,
    #[error("microphone unavailable: {0}")]
    Unavailable(String),
}

#[derive(Debug, Error)]
pub enum VoiceError {
    #[error(transparent)]
    Media(#[from] MediaError),
    #[error("negotiation failed: {0}")]
    Negotiation(#[from] webrtc::Error),
    #[error("malformed signaling payload: {0}")]
    Payload(String),
}

#[derive(Debug, Error)]
pub enum AssistError {
    #[error("assist request failed: {0}")]
    Http(#[from] reqwest::Error),
}
