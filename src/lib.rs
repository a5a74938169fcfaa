//! voicebridge — real-time telephony voice bridge.
//!
//! Relays a live phone call's audio between the provider's media-stream
//! WebSocket and a speech-AI backend (realtime speech-to-speech, or a
//! transcribe → dialogue → synthesize pipeline), converting between μ-law
//! 8 kHz and linear PCM on the way, detecting turns and suppressing echo,
//! accumulating a structured emergency report mid-call, and hanging the
//! call up once the case is filed.

#![forbid(unsafe_code)]

/// Speech-AI backend contract shared by both adapter variants.
pub mod backend;
/// Bridge orchestrator: the two forwarding loops and the call lifecycle.
pub mod bridge;
/// G.711 μ-law codec, resampling, RMS, WAV container.
pub mod codec;
/// External collaborator interfaces (STT, dialogue, TTS, case store,
/// call control) and their HTTP implementations.
pub mod collaborators;
/// Environment configuration.
pub mod config;
/// Structured emergency-report extraction.
pub mod extract;
/// Turn-based pipeline backend adapter.
pub mod pipeline;
/// Realtime speech-to-speech backend adapter.
pub mod realtime;
/// HTTP/WebSocket front door.
pub mod server;
/// Per-call session state and lifecycle.
pub mod session;
/// Telephony media-stream duplex adapter.
pub mod telephony;
