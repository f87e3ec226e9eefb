pub mod assist;
pub mod error;
pub mod media;
pub mod session;
pub mod signaling;
pub mod voice;
