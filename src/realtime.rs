//! Realtime speech-to-speech backend adapter.
//!
//! One persistent WebSocket to the realtime API. On connect we declare the
//! session: audio formats and rates for both directions, server-side voice
//! activity detection (the backend decides when the caller's turn ended),
//! the case-creation tool schema, and the collection instructions — then
//! trigger the greeting turn explicitly, because the backend never speaks
//! first on its own.
//!
//! Inbound caller audio is upsampled 8 kHz → 24 kHz and appended to the
//! input buffer; outbound audio deltas are downsampled 24 kHz → 8 kHz and
//! forwarded as they stream in. A completed `response.done` carrying a
//! function call becomes a [`ToolInvocation`] for the orchestrator.

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};

use crate::backend::{BackendError, BackendEvent, BackendSink, BackendStream, VoiceBackend};
use crate::codec::{self, Ratio};
use crate::extract::ToolInvocation;
use crate::session::{AudioFrame, Role};

/// The realtime API speaks 16-bit PCM at 24 kHz; the wire is 8 kHz, so the
/// rate ratio is a clean ×3.
pub const REALTIME_SAMPLE_RATE: u32 = 24_000;
const RATE_RATIO: usize = (REALTIME_SAMPLE_RATE / codec::WIRE_SAMPLE_RATE) as usize;

/// Collection instructions for the speech-to-speech model.
pub const REALTIME_INSTRUCTIONS: &str = r#"You are an emergency response assistant on a live phone call. The caller may be stressed or scared. Collect these four items one at a time, in a calm and reassuring way:
1. Full name
2. Social security number (for identification)
3. Current location (as specific as possible)
4. Description of the emergency

Be warm, calm, and reassuring. Ask for ONE thing at a time. Keep replies SHORT and natural for speech. When you have all four, call the create_emergency_case tool with every field filled in, then thank them and say: "That's everything I need. Help is being coordinated. You can hang up when you're ready. Stay safe."
Categories: fuel, medical, shelter, food_water, rescue, other. Severity 1-5 (5 = life-threatening)."#;

type WsSink = Arc<Mutex<SplitSink<WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>, Message>>>;
type WsStream = SplitStream<WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>>;

/// Server-side voice activity detection parameters: energy threshold,
/// leading-silence padding, and the trailing silence that ends a turn.
#[derive(Debug, Clone)]
pub struct VadConfig {
    pub threshold: f64,
    pub prefix_padding_ms: u32,
    pub silence_duration_ms: u32,
}

impl Default for VadConfig {
    fn default() -> Self {
        Self {
            threshold: 0.5,
            prefix_padding_ms: 300,
            silence_duration_ms: 500,
        }
    }
}

#[derive(Debug, Clone)]
pub struct RealtimeConfig {
    pub url: String,
    pub api_key: String,
    pub voice: String,
    pub instructions: String,
    pub vad: VadConfig,
}

impl RealtimeConfig {
    pub fn new(url: impl Into<String>, api_key: impl Into<String>, voice: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            api_key: api_key.into(),
            voice: voice.into(),
            instructions: REALTIME_INSTRUCTIONS.to_string(),
            vad: VadConfig::default(),
        }
    }
}

/// The `session.update` event declaring formats, VAD, voice, instructions,
/// and the tool schema.
fn session_update(config: &RealtimeConfig) -> Value {
    json!({
        "type": "session.update",
        "session": {
            "type": "realtime",
            "output_modalities": ["audio"],
            "instructions": config.instructions,
            "audio": {
                "input": {
                    "format": { "type": "audio/pcm", "rate": REALTIME_SAMPLE_RATE },
                    "turn_detection": {
                        "type": "server_vad",
                        "threshold": config.vad.threshold,
                        "prefix_padding_ms": config.vad.prefix_padding_ms,
                        "silence_duration_ms": config.vad.silence_duration_ms,
                    },
                },
                "output": {
                    "format": { "type": "audio/pcm" },
                    "voice": config.voice,
                },
            },
            "tools": [tool_schema()],
            "tool_choice": "auto",
        },
    })
}

/// Case-creation tool: six required fields, issued by the model when the
/// caller has provided everything.
fn tool_schema() -> Value {
    json!({
        "type": "function",
        "name": "create_emergency_case",
        "description": "Create the emergency case once the caller has provided their full name, social security number, location, and a description of the emergency.",
        "parameters": {
            "type": "object",
            "properties": {
                "full_name": { "type": "string" },
                "social_security_number": { "type": "string" },
                "location": { "type": "string" },
                "emergency_description": { "type": "string" },
                "category": {
                    "type": "string",
                    "enum": ["fuel", "medical", "shelter", "food_water", "rescue", "other"],
                },
                "severity": { "type": "integer", "minimum": 1, "maximum": 5 },
            },
            "required": [
                "full_name",
                "social_security_number",
                "location",
                "emergency_description",
                "category",
                "severity",
            ],
        },
    })
}

/// Pull the first function call out of a `response.done` event, as
/// `(call_id, arguments)`.
fn extract_function_call(event: &Value) -> Option<(Option<String>, String)> {
    let output = event.get("response")?.get("output")?.as_array()?;
    for item in output {
        if item.get("type").and_then(Value::as_str) == Some("function_call") {
            let call_id = item
                .get("call_id")
                .and_then(Value::as_str)
                .map(str::to_string);
            let arguments = item
                .get("arguments")
                .and_then(Value::as_str)
                .unwrap_or("{}")
                .to_string();
            return Some((call_id, arguments));
        }
    }
    None
}

/// Base64 audio from an output-audio delta event. The field is `delta` per
/// the docs; `audio` is accepted for older event shapes.
fn extract_audio_delta(event: &Value) -> Option<Vec<u8>> {
    let b64 = event
        .get("delta")
        .and_then(Value::as_str)
        .or_else(|| event.get("audio").and_then(Value::as_str))?;
    BASE64.decode(b64).ok()
}

async fn send_event(sink: &WsSink, event: Value) -> Result<(), BackendError> {
    let mut guard = sink.lock().await;
    guard
        .send(Message::text(event.to_string()))
        .await
        .map_err(BackendError::Socket)
}

/// Realtime backend, unstarted. `start` connects and configures the
/// session; `split` hands one direction to each bridge loop.
pub struct RealtimeBackend {
    config: RealtimeConfig,
    sink: Option<WsSink>,
    stream: Option<WsStream>,
}

impl RealtimeBackend {
    pub fn new(config: RealtimeConfig) -> Self {
        Self {
            config,
            sink: None,
            stream: None,
        }
    }
}

#[async_trait]
impl VoiceBackend for RealtimeBackend {
    async fn start(&mut self) -> Result<(), BackendError> {
        let mut request = self.config.url.as_str().into_client_request()?;
        let bearer = format!("Bearer {}", self.config.api_key);
        let header = HeaderValue::from_str(&bearer)
            .map_err(|_| BackendError::Protocol("api key is not a valid header value".into()))?;
        request.headers_mut().insert("Authorization", header);

        info!(url = %self.config.url, "connecting realtime backend");
        let (ws, _response) = connect_async(request).await?;
        let (sink, stream) = ws.split();
        let sink: WsSink = Arc::new(Mutex::new(sink));

        send_event(&sink, session_update(&self.config)).await?;
        // The greeting: the model only speaks when asked to respond.
        send_event(&sink, json!({"type": "response.create"})).await?;

        self.sink = Some(sink);
        self.stream = Some(stream);
        Ok(())
    }

    fn split(self: Box<Self>) -> (Box<dyn BackendSink>, Box<dyn BackendStream>) {
        let sink = self.sink;
        let stream = self.stream;
        (
            Box::new(RealtimeSink { sink: sink.clone() }),
            Box::new(RealtimeStream {
                stream,
                sink,
                seq: 0,
            }),
        )
    }
}

pub struct RealtimeSink {
    sink: Option<WsSink>,
}

#[async_trait]
impl BackendSink for RealtimeSink {
    async fn forward_inbound(&mut self, frame: AudioFrame) -> Result<(), BackendError> {
        let sink = self.sink.as_ref().ok_or(BackendError::Closed)?;
        let samples = codec::decode(&frame.payload);
        if samples.is_empty() {
            // Unusable frame; skip it, never abort the call.
            return Ok(());
        }
        let pcm = codec::resample(&samples, Ratio::Up(RATE_RATIO));
        let audio = BASE64.encode(codec::samples_to_pcm_bytes(&pcm));
        send_event(
            sink,
            json!({"type": "input_audio_buffer.append", "audio": audio}),
        )
        .await
    }
}

pub struct RealtimeStream {
    stream: Option<WsStream>,
    sink: Option<WsSink>,
    seq: u64,
}

impl RealtimeStream {
    async fn reply(&self, event: Value) -> Result<(), BackendError> {
        let sink = self.sink.as_ref().ok_or(BackendError::Closed)?;
        send_event(sink, event).await
    }

    fn handle_text(&mut self, text: &str) -> Option<Result<BackendEvent, BackendError>> {
        let event: Value = match serde_json::from_str(text) {
            Ok(v) => v,
            Err(e) => {
                // Backend protocol fault: log and keep the loop alive.
                warn!(error = %e, "unparseable realtime event");
                return None;
            }
        };
        let event_type = event.get("type").and_then(Value::as_str).unwrap_or("");
        match event_type {
            "response.output_audio.delta" => {
                let Some(pcm_bytes) = extract_audio_delta(&event) else {
                    warn!("audio delta without payload");
                    return None;
                };
                let samples = codec::pcm_bytes_to_samples(&pcm_bytes);
                if samples.is_empty() {
                    return None;
                }
                let wire = codec::encode(&codec::resample(&samples, Ratio::Down(RATE_RATIO)));
                self.seq += 1;
                Some(Ok(BackendEvent::Audio(AudioFrame::outbound_mulaw(
                    self.seq, wire,
                ))))
            }
            "response.output_audio.done" => Some(Ok(BackendEvent::TurnComplete)),
            "input_audio_buffer.speech_started" => {
                // Caller barged in while the model was still playing out.
                Some(Ok(BackendEvent::Interrupted))
            }
            "response.done" => match extract_function_call(&event) {
                Some((call_id, arguments)) => Some(Ok(BackendEvent::Tool(
                    ToolInvocation::from_function_call(call_id, &arguments),
                ))),
                None => None,
            },
            "response.output_audio_transcript.done" => {
                let text = event
                    .get("transcript")
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string();
                if text.is_empty() {
                    None
                } else {
                    Some(Ok(BackendEvent::Transcript {
                        role: Role::Assistant,
                        text,
                    }))
                }
            }
            "conversation.item.input_audio_transcription.completed" => {
                let text = event
                    .get("transcript")
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string();
                if text.is_empty() {
                    None
                } else {
                    Some(Ok(BackendEvent::Transcript {
                        role: Role::Caller,
                        text,
                    }))
                }
            }
            "error" => {
                warn!(body = %event, "realtime backend error event");
                None
            }
            other => {
                debug!(event = other, "ignoring realtime event");
                None
            }
        }
    }
}

#[async_trait]
impl BackendStream for RealtimeStream {
    async fn poll_outbound(&mut self) -> Result<BackendEvent, BackendError> {
        if self.stream.is_none() {
            return Err(BackendError::Closed);
        }
        loop {
            let next = match self.stream.as_mut() {
                Some(stream) => stream.next().await,
                None => return Err(BackendError::Closed),
            };
            let message = match next {
                Some(Ok(m)) => m,
                Some(Err(e)) => return Err(BackendError::Socket(e)),
                None => return Ok(BackendEvent::Closed),
            };
            match message {
                Message::Text(text) => {
                    if let Some(result) = self.handle_text(&text) {
                        // A turn boundary also discards whatever inbound audio
                        // accumulated during playout, so echo that predates
                        // the cooldown cannot be misread as caller speech.
                        if matches!(result, Ok(BackendEvent::TurnComplete)) {
                            self.reply(json!({"type": "input_audio_buffer.clear"}))
                                .await?;
                        }
                        return result;
                    }
                }
                Message::Ping(payload) => {
                    // Keep-alive: unanswered pings get us disconnected.
                    let sink = self.sink.as_ref().ok_or(BackendError::Closed)?;
                    let mut guard = sink.lock().await;
                    guard
                        .send(Message::Pong(payload))
                        .await
                        .map_err(BackendError::Socket)?;
                }
                Message::Close(frame) => {
                    info!(?frame, "realtime backend closed");
                    return Ok(BackendEvent::Closed);
                }
                _ => {}
            }
        }
    }

    async fn complete_tool(
        &mut self,
        invocation: &ToolInvocation,
        case_id: &str,
    ) -> Result<(), BackendError> {
        let Some(call_id) = invocation.call_id.as_deref() else {
            return Ok(());
        };
        let output = json!({"status": "case_created", "case_id": case_id}).to_string();
        self.reply(json!({
            "type": "conversation.item.create",
            "item": {
                "type": "function_call_output",
                "call_id": call_id,
                "output": output,
            },
        }))
        .await?;
        // Ask for the terminal spoken turn.
        self.reply(json!({"type": "response.create"})).await
    }

    async fn reject_tool(
        &mut self,
        invocation: &ToolInvocation,
        missing: &[&str],
    ) -> Result<(), BackendError> {
        let Some(call_id) = invocation.call_id.as_deref() else {
            return Ok(());
        };
        let output = json!({"status": "rejected", "missing_fields": missing}).to_string();
        self.reply(json!({
            "type": "conversation.item.create",
            "item": {
                "type": "function_call_output",
                "call_id": call_id,
                "output": output,
            },
        }))
        .await?;
        // Keep the conversation going so the caller can fill the gaps.
        self.reply(json!({"type": "response.create"})).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_config() -> RealtimeConfig {
        RealtimeConfig::new("wss://example.test/v1/realtime", "sk-test", "alloy")
    }

    #[test]
    fn session_update_declares_formats_vad_and_tools() {
        let update = session_update(&test_config());
        assert_eq!(update["type"], "session.update");
        let session = &update["session"];
        assert_eq!(session["audio"]["input"]["format"]["rate"], 24_000);
        let vad = &session["audio"]["input"]["turn_detection"];
        assert_eq!(vad["type"], "server_vad");
        assert_eq!(vad["threshold"], 0.5);
        assert_eq!(vad["prefix_padding_ms"], 300);
        assert_eq!(vad["silence_duration_ms"], 500);
        assert_eq!(session["audio"]["output"]["voice"], "alloy");
        assert_eq!(session["tools"][0]["name"], "create_emergency_case");
    }

    #[test]
    fn tool_schema_requires_all_six_fields() {
        let schema = tool_schema();
        let required = schema["parameters"]["required"].as_array().unwrap();
        assert_eq!(required.len(), 6);
        for field in [
            "full_name",
            "social_security_number",
            "location",
            "emergency_description",
            "category",
            "severity",
        ] {
            assert!(required.iter().any(|v| v == field), "missing {field}");
        }
    }

    #[test]
    fn function_call_extracted_from_response_done() {
        let event = json!({
            "type": "response.done",
            "response": {
                "output": [
                    { "type": "message", "content": [] },
                    {
                        "type": "function_call",
                        "name": "create_emergency_case",
                        "call_id": "call_7",
                        "arguments": "{\"severity\": 4}",
                    },
                ],
            },
        });
        let (call_id, arguments) = extract_function_call(&event).unwrap();
        assert_eq!(call_id.as_deref(), Some("call_7"));
        assert_eq!(arguments, "{\"severity\": 4}");
    }

    #[test]
    fn response_done_without_function_call_is_none() {
        let event = json!({
            "type": "response.done",
            "response": { "output": [{ "type": "message" }] },
        });
        assert!(extract_function_call(&event).is_none());
    }

    #[test]
    fn audio_delta_accepts_delta_or_audio_field() {
        let b64 = BASE64.encode([1u8, 2, 3, 4]);
        let event = json!({"type": "response.output_audio.delta", "delta": b64});
        assert_eq!(extract_audio_delta(&event).unwrap(), vec![1, 2, 3, 4]);
        let event = json!({"type": "response.output_audio.delta", "audio": BASE64.encode([5u8, 6])});
        assert_eq!(extract_audio_delta(&event).unwrap(), vec![5, 6]);
        let event = json!({"type": "response.output_audio.delta"});
        assert!(extract_audio_delta(&event).is_none());
    }

    fn test_stream() -> RealtimeStream {
        RealtimeStream {
            stream: None,
            sink: None,
            seq: 0,
        }
    }

    #[test]
    fn audio_delta_is_transcoded_to_wire_format() {
        let mut stream = test_stream();
        // 24 kHz PCM: six samples become two wire samples after the ÷3 stride.
        let pcm = codec::samples_to_pcm_bytes(&[100, 100, 100, -100, -100, -100]);
        let event = json!({
            "type": "response.output_audio.delta",
            "delta": BASE64.encode(&pcm),
        })
        .to_string();
        match stream.handle_text(&event) {
            Some(Ok(BackendEvent::Audio(frame))) => {
                assert_eq!(frame.payload.len(), 2);
                assert_eq!(frame.seq, 1);
                let decoded = codec::decode(&frame.payload);
                assert!(decoded[0] > 0 && decoded[1] < 0);
            }
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn turn_boundary_and_interruption_events() {
        let mut stream = test_stream();
        let done = json!({"type": "response.output_audio.done"}).to_string();
        assert!(matches!(
            stream.handle_text(&done),
            Some(Ok(BackendEvent::TurnComplete))
        ));
        let barge = json!({"type": "input_audio_buffer.speech_started"}).to_string();
        assert!(matches!(
            stream.handle_text(&barge),
            Some(Ok(BackendEvent::Interrupted))
        ));
    }

    #[test]
    fn unknown_and_malformed_events_are_ignored() {
        let mut stream = test_stream();
        assert!(stream
            .handle_text(&json!({"type": "session.updated"}).to_string())
            .is_none());
        assert!(stream.handle_text("not json at all").is_none());
    }

    #[test]
    fn tool_invocation_fields_flow_through() {
        let mut stream = test_stream();
        let arguments = json!({
            "full_name": "Tom Aro",
            "social_security_number": "19900101-1234",
            "location": "Sveavägen 10",
            "emergency_description": "flooding",
            "category": "rescue",
            "severity": 4,
        })
        .to_string();
        let event = json!({
            "type": "response.done",
            "response": {
                "output": [{
                    "type": "function_call",
                    "name": "create_emergency_case",
                    "call_id": "call_1",
                    "arguments": arguments,
                }],
            },
        })
        .to_string();
        match stream.handle_text(&event) {
            Some(Ok(BackendEvent::Tool(invocation))) => {
                assert!(invocation.is_valid());
                assert_eq!(invocation.call_id.as_deref(), Some("call_1"));
                assert_eq!(invocation.report.category.as_deref(), Some("rescue"));
            }
            other => panic!("unexpected: {other:?}"),
        }
    }
}
