//! Speech-AI backend contract.
//!
//! Two interchangeable implementations share this contract: the realtime
//! adapter (one persistent speech-to-speech stream, backend-side VAD and
//! function calling) and the pipeline adapter (local silence detection, then
//! transcription → dialogue → synthesis per turn). The orchestrator is
//! written against these traits only.

use async_trait::async_trait;

use crate::collaborators::CollaboratorError;
use crate::extract::ToolInvocation;
use crate::session::{AudioFrame, Role};

#[derive(Debug, thiserror::Error)]
pub enum BackendError {
    #[error("backend socket error: {0}")]
    Socket(#[from] tokio_tungstenite::tungstenite::Error),

    #[error("backend connection closed")]
    Closed,

    #[error("backend protocol error: {0}")]
    Protocol(String),

    #[error(transparent)]
    Collaborator(#[from] CollaboratorError),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// One item surfaced by the backend's outbound side.
#[derive(Debug)]
pub enum BackendEvent {
    /// μ-law 8 kHz audio ready for the telephony sink (already transcoded).
    Audio(AudioFrame),
    /// The current spoken turn finished.
    TurnComplete,
    /// The backend abandoned the turn mid-playback; the provider's playout
    /// buffer should be cleared before audio resumes.
    Interrupted,
    /// A completed conversation turn to record on the session.
    Transcript { role: Role, text: String },
    /// Case-creation request (validated by the orchestrator, not here).
    Tool(ToolInvocation),
    /// The backend has no more events; the call winds down cleanly.
    Closed,
}

/// A configured-but-unstarted backend. `start` performs connection/session
/// setup and triggers the greeting turn (neither backend speaks first on its
/// own); `split` hands one direction to each bridge loop.
#[async_trait]
pub trait VoiceBackend: Send {
    async fn start(&mut self) -> Result<(), BackendError>;

    fn split(self: Box<Self>) -> (Box<dyn BackendSink>, Box<dyn BackendStream>);
}

/// Caller → backend direction, owned by the uplink loop.
#[async_trait]
pub trait BackendSink: Send {
    /// Forward one admitted inbound frame. The adapter transcodes to its own
    /// wire format; frames dropped by the echo gate never reach this call.
    async fn forward_inbound(&mut self, frame: AudioFrame) -> Result<(), BackendError>;
}

/// Backend → caller direction, owned by the downlink loop.
#[async_trait]
pub trait BackendStream: Send {
    /// Wait for the next outbound event.
    async fn poll_outbound(&mut self) -> Result<BackendEvent, BackendError>;

    /// The orchestrator accepted the invocation and created the case; the
    /// backend should produce the terminal spoken turn ("help is on the
    /// way…").
    async fn complete_tool(
        &mut self,
        invocation: &ToolInvocation,
        case_id: &str,
    ) -> Result<(), BackendError>;

    /// The invocation was malformed (missing fields); the backend should
    /// continue the conversation so the caller can supply what is missing.
    async fn reject_tool(
        &mut self,
        invocation: &ToolInvocation,
        missing: &[&str],
    ) -> Result<(), BackendError>;
}
