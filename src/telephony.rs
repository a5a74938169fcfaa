//! Telephony duplex adapter: the provider's Media Stream WebSocket.
//!
//! Inbound, the provider sends JSON text frames — `connected`, `start`,
//! `media`, `stop`, `mark`, `dtmf` — with one base64 μ-law chunk per `media`
//! event. Outbound, we send `media` events whose payload is always exactly
//! one 20 ms wire frame (160 bytes of 8 kHz μ-law), and `clear` to flush the
//! provider's playout buffer on interruption.

use async_trait::async_trait;
use axum::extract::ws::{Message, WebSocket};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use std::collections::HashMap;
use tracing::{debug, info, warn};

use crate::codec::{FRAME_BYTES, MULAW_SILENCE};

/// How many protocol frames we will read while waiting for `start` before
/// giving up on the handshake.
const HANDSHAKE_FRAME_LIMIT: usize = 8;

#[derive(Debug, thiserror::Error)]
pub enum TelephonyError {
    #[error("telephony socket error: {0}")]
    Socket(#[from] axum::Error),

    #[error("telephony socket closed")]
    Closed,

    #[error("telephony handshake failed: {0}")]
    Handshake(String),
}

/// One parsed provider event. Unknown event names map to [`TwilioEvent::Unknown`]
/// and are ignored rather than faulting the stream.
#[derive(Debug, Deserialize)]
#[serde(tag = "event", rename_all = "lowercase")]
pub enum TwilioEvent {
    Connected {
        #[serde(default)]
        protocol: Option<String>,
        #[serde(default)]
        version: Option<String>,
    },
    Start {
        #[serde(rename = "streamSid")]
        stream_sid: String,
        start: StartMeta,
    },
    Media {
        media: MediaMeta,
    },
    Stop {
        #[serde(default)]
        stop: StopMeta,
    },
    Mark {
        #[serde(default)]
        mark: serde_json::Value,
    },
    Dtmf {
        #[serde(default)]
        dtmf: DtmfMeta,
    },
    #[serde(other)]
    Unknown,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StartMeta {
    #[serde(default)]
    pub call_sid: String,
    #[serde(default)]
    pub custom_parameters: HashMap<String, String>,
}

#[derive(Debug, Default, Deserialize)]
pub struct MediaMeta {
    #[serde(default)]
    pub track: String,
    #[serde(default)]
    pub payload: String,
}

impl MediaMeta {
    /// Only caller-side audio is forwarded upward; outbound-track echoes of
    /// our own media are not.
    pub fn is_inbound(&self) -> bool {
        self.track == "inbound"
    }

    /// Decode the base64 μ-law payload. Malformed base64 is a per-frame
    /// decode fault: the caller drops the frame and the stream continues.
    pub fn mulaw_bytes(&self) -> Vec<u8> {
        BASE64.decode(&self.payload).unwrap_or_default()
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StopMeta {
    #[serde(default)]
    pub call_sid: String,
}

#[derive(Debug, Default, Deserialize)]
pub struct DtmfMeta {
    #[serde(default)]
    pub digit: String,
}

/// Identifiers delivered by the provider's `start` event.
#[derive(Debug, Clone)]
pub struct StreamInfo {
    pub stream_sid: String,
    pub call_sid: String,
    pub custom_parameters: HashMap<String, String>,
}

/// Parse one provider text frame.
pub fn parse_event(raw: &str) -> Result<TwilioEvent, serde_json::Error> {
    serde_json::from_str(raw)
}

/// Outbound `media` event carrying one wire frame.
pub fn media_message(stream_sid: &str, mulaw: &[u8]) -> String {
    serde_json::json!({
        "event": "media",
        "streamSid": stream_sid,
        "media": { "payload": BASE64.encode(mulaw) },
    })
    .to_string()
}

/// Outbound `clear` event flushing the provider's playout buffer.
pub fn clear_message(stream_sid: &str) -> String {
    serde_json::json!({
        "event": "clear",
        "streamSid": stream_sid,
    })
    .to_string()
}

/// Accumulates outbound μ-law bytes and emits only complete 160-byte wire
/// frames; the remainder is carried until more audio arrives or the turn is
/// flushed with silence padding. Oversized or undersized chunks are a
/// protocol violation the adapter must never produce.
#[derive(Debug, Default)]
pub struct FrameChunker {
    carry: Vec<u8>,
}

impl FrameChunker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append audio and drain every complete wire frame.
    pub fn push(&mut self, mulaw: &[u8]) -> Vec<Vec<u8>> {
        self.carry.extend_from_slice(mulaw);
        let mut frames = Vec::new();
        while self.carry.len() >= FRAME_BYTES {
            let rest = self.carry.split_off(FRAME_BYTES);
            frames.push(std::mem::replace(&mut self.carry, rest));
        }
        frames
    }

    /// End of a spoken turn: pad the remainder to a full frame with μ-law
    /// silence. Returns nothing when no audio is pending.
    pub fn flush(&mut self) -> Option<Vec<u8>> {
        if self.carry.is_empty() {
            return None;
        }
        let mut frame = std::mem::take(&mut self.carry);
        frame.resize(FRAME_BYTES, MULAW_SILENCE);
        Some(frame)
    }

    /// Interruption: pending audio is stale, drop it.
    pub fn discard(&mut self) {
        self.carry.clear();
    }

    pub fn pending(&self) -> usize {
        self.carry.len()
    }
}

/// Receive half of the media stream, owned by the uplink loop.
#[async_trait]
pub trait MediaSource: Send {
    /// Next parsed provider event. `Err(Closed)` when the socket is gone.
    async fn next_event(&mut self) -> Result<TwilioEvent, TelephonyError>;
}

/// Send half of the media stream, owned by the downlink loop.
#[async_trait]
pub trait MediaSink: Send {
    /// Queue outbound μ-law audio; complete wire frames are sent immediately.
    async fn send_audio(&mut self, mulaw: &[u8]) -> Result<(), TelephonyError>;
    /// Flush the current turn's remainder (padded with silence).
    async fn flush_turn(&mut self) -> Result<(), TelephonyError>;
    /// Tell the provider to drop queued playout audio (interruption).
    async fn send_clear(&mut self) -> Result<(), TelephonyError>;
}

/// Perform the provider handshake on a freshly accepted socket: consume
/// `connected`, then `start`, and return the stream identifiers. Audio frames
/// only begin after `start`; a socket that closes or stalls before then never
/// creates a call session.
pub async fn handshake(socket: &mut WebSocket) -> Result<StreamInfo, TelephonyError> {
    for _ in 0..HANDSHAKE_FRAME_LIMIT {
        let message = match socket.recv().await {
            Some(Ok(m)) => m,
            Some(Err(e)) => return Err(TelephonyError::Socket(e)),
            None => return Err(TelephonyError::Closed),
        };
        let text = match message {
            Message::Text(text) => text,
            Message::Close(_) => return Err(TelephonyError::Closed),
            _ => continue,
        };
        match parse_event(&text) {
            Ok(TwilioEvent::Connected { protocol, version }) => {
                info!(
                    protocol = protocol.as_deref().unwrap_or(""),
                    version = version.as_deref().unwrap_or(""),
                    "media stream connected"
                );
            }
            Ok(TwilioEvent::Start { stream_sid, start }) => {
                info!(
                    stream_sid = %stream_sid,
                    call_sid = %start.call_sid,
                    "media stream started"
                );
                return Ok(StreamInfo {
                    stream_sid,
                    call_sid: start.call_sid,
                    custom_parameters: start.custom_parameters,
                });
            }
            Ok(other) => {
                debug!(?other, "unexpected event before start");
            }
            Err(e) => {
                warn!(error = %e, "invalid frame during handshake");
            }
        }
    }
    Err(TelephonyError::Handshake(
        "no start event within handshake window".into(),
    ))
}

/// Split an upgraded, handshaken socket into the two directional halves the
/// bridge loops own.
pub fn split(socket: WebSocket, info: &StreamInfo) -> (TwilioSender, TwilioReceiver) {
    let (sink, stream) = socket.split();
    (
        TwilioSender {
            sink,
            stream_sid: info.stream_sid.clone(),
            chunker: FrameChunker::new(),
        },
        TwilioReceiver { stream },
    )
}

pub struct TwilioReceiver {
    stream: SplitStream<WebSocket>,
}

#[async_trait]
impl MediaSource for TwilioReceiver {
    async fn next_event(&mut self) -> Result<TwilioEvent, TelephonyError> {
        loop {
            let message = match self.stream.next().await {
                Some(Ok(m)) => m,
                Some(Err(e)) => return Err(TelephonyError::Socket(e)),
                None => return Err(TelephonyError::Closed),
            };
            match message {
                Message::Text(text) => match parse_event(&text) {
                    Ok(event) => return Ok(event),
                    Err(e) => {
                        // One bad frame never aborts the call.
                        warn!(error = %e, "invalid media stream frame");
                        continue;
                    }
                },
                Message::Close(_) => return Err(TelephonyError::Closed),
                _ => continue,
            }
        }
    }
}

pub struct TwilioSender {
    sink: SplitSink<WebSocket, Message>,
    stream_sid: String,
    chunker: FrameChunker,
}

impl TwilioSender {
    async fn send_frame(&mut self, frame: &[u8]) -> Result<(), TelephonyError> {
        let message = media_message(&self.stream_sid, frame);
        self.sink
            .send(Message::Text(message.into()))
            .await
            .map_err(TelephonyError::Socket)
    }
}

#[async_trait]
impl MediaSink for TwilioSender {
    async fn send_audio(&mut self, mulaw: &[u8]) -> Result<(), TelephonyError> {
        for frame in self.chunker.push(mulaw) {
            self.send_frame(&frame).await?;
        }
        Ok(())
    }

    async fn flush_turn(&mut self) -> Result<(), TelephonyError> {
        if let Some(frame) = self.chunker.flush() {
            self.send_frame(&frame).await?;
        }
        Ok(())
    }

    async fn send_clear(&mut self) -> Result<(), TelephonyError> {
        self.chunker.discard();
        let message = clear_message(&self.stream_sid);
        self.sink
            .send(Message::Text(message.into()))
            .await
            .map_err(TelephonyError::Socket)
    }
}
