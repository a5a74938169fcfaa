//! HTTP/WebSocket front door.
//!
//! `POST /voice` answers the provider's call webhook with TwiML connecting
//! the call to the media WebSocket at `GET /ws/voice`. When the selected
//! backend's credentials are missing, the webhook answers with a static
//! spoken message and hangs up instead — a configuration fault must never
//! leave the caller in silence.

use std::sync::Arc;

use axum::extract::ws::{WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::http::header::CONTENT_TYPE;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Form, Router};
use serde::Deserialize;
use tracing::{info, warn};

use crate::backend::VoiceBackend;
use crate::bridge::{self, BridgeServices};
use crate::collaborators::{
    CallControl, CaseStore, ChatDialogue, ElevenLabsSynthesizer, HttpCaseStore,
    TwilioCallControl, Unconfigured, WhisperTranscriber,
};
use crate::config::{BackendKind, Config};
use crate::pipeline::{PipelineBackend, PipelineCollaborators};
use crate::realtime::{RealtimeBackend, RealtimeConfig};
use crate::session::CallSession;
use crate::telephony;

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/voice", post(voice_webhook))
        .route("/ws/voice", get(voice_stream))
        .route("/healthz", get(|| async { "ok" }))
        .with_state(state)
}

/// Fields of the provider's voice webhook we care about.
#[derive(Debug, Default, Deserialize)]
pub struct VoiceWebhook {
    #[serde(rename = "CallSid", default)]
    pub call_sid: String,
    #[serde(rename = "From", default)]
    pub from: String,
    #[serde(rename = "To", default)]
    pub to: String,
}

fn xml_escape(text: &str) -> String {
    text.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
}

/// TwiML that connects the call to the bidirectional media stream.
pub fn connect_stream_twiml(ws_url: &str, call_sid: &str, from: &str, to: &str) -> String {
    format!(
        r#"<?xml version="1.0" encoding="UTF-8"?>
<Response>
  <Connect>
    <Stream url="{}">
      <Parameter name="CallSid" value="{}"/>
      <Parameter name="From" value="{}"/>
      <Parameter name="To" value="{}"/>
    </Stream>
  </Connect>
</Response>"#,
        xml_escape(ws_url),
        xml_escape(call_sid),
        xml_escape(from),
        xml_escape(to),
    )
}

/// TwiML that speaks a message and hangs up (the configuration-fault
/// fallback).
pub fn say_hangup_twiml(message: &str) -> String {
    format!(
        r#"<?xml version="1.0" encoding="UTF-8"?>
<Response>
  <Say voice="alice">{}</Say>
  <Hangup/>
</Response>"#,
        xml_escape(message),
    )
}

fn twiml_response(body: String) -> Response {
    ([(CONTENT_TYPE, "application/xml")], body).into_response()
}

async fn voice_webhook(
    State(state): State<AppState>,
    Form(webhook): Form<VoiceWebhook>,
) -> Response {
    let config = &state.config;
    info!(call_sid = %webhook.call_sid, from = %webhook.from, "voice webhook");

    let stream_url = match (config.backend_ready(), config.stream_url()) {
        (Ok(()), Some(url)) => url,
        (Err(e), _) => {
            warn!(error = %e, "backend unavailable, answering with fallback");
            return twiml_response(say_hangup_twiml(&config.fallback_message));
        }
        (_, None) => {
            warn!("PUBLIC_URL not set, answering with fallback");
            return twiml_response(say_hangup_twiml(&config.fallback_message));
        }
    };
    twiml_response(connect_stream_twiml(
        &stream_url,
        &webhook.call_sid,
        &webhook.from,
        &webhook.to,
    ))
}

fn build_backend(config: &Config) -> Option<Box<dyn VoiceBackend>> {
    config.backend_ready().ok()?;
    match config.backend {
        BackendKind::Realtime => {
            let api_key = config.openai_api_key.clone()?;
            Some(Box::new(RealtimeBackend::new(RealtimeConfig::new(
                config.realtime_url.clone(),
                api_key,
                config.realtime_voice.clone(),
            ))))
        }
        BackendKind::Pipeline => {
            let openai_key = config.openai_api_key.clone()?;
            let eleven_key = config.elevenlabs_api_key.clone()?;
            Some(Box::new(PipelineBackend::new(
                config.greeting.clone(),
                PipelineCollaborators {
                    transcriber: Box::new(WhisperTranscriber::new(
                        openai_key.clone(),
                        config.transcription_model.clone(),
                    )),
                    dialogue: Box::new(ChatDialogue::new(openai_key, config.chat_model.clone())),
                    synthesizer: Box::new(ElevenLabsSynthesizer::new(
                        eleven_key,
                        config.elevenlabs_voice_id.clone(),
                        config.elevenlabs_model_id.clone(),
                    )),
                },
            )))
        }
    }
}

fn build_services(config: &Config) -> BridgeServices {
    let case_store: Arc<dyn CaseStore> = match &config.case_intake_url {
        Some(url) => Arc::new(HttpCaseStore::new(url.clone())),
        None => Arc::new(Unconfigured("case intake")),
    };
    let call_control: Arc<dyn CallControl> =
        match (&config.twilio_account_sid, &config.twilio_auth_token) {
            (Some(sid), Some(token)) => Arc::new(TwilioCallControl::new(sid.clone(), token.clone())),
            _ => Arc::new(Unconfigured("call control")),
        };
    BridgeServices {
        case_store,
        call_control,
        echo_cooldown: bridge::ECHO_COOLDOWN,
    }
}

async fn voice_stream(State(state): State<AppState>, ws: WebSocketUpgrade) -> Response {
    ws.on_upgrade(move |socket| handle_stream(socket, state))
}

async fn handle_stream(mut socket: WebSocket, state: AppState) {
    let config = &state.config;
    let info = match telephony::handshake(&mut socket).await {
        Ok(info) => info,
        Err(e) => {
            // No stream identifier means no session was ever created.
            warn!(error = %e, "media stream handshake failed");
            return;
        }
    };

    let Some(backend) = build_backend(config) else {
        // The webhook should have answered with the fallback already; a
        // stream arriving anyway is refused rather than left hanging.
        warn!(stream_sid = %info.stream_sid, "backend unavailable, refusing stream");
        return;
    };

    let session = {
        let mut session = CallSession::new(info.call_sid.clone(), info.stream_sid.clone());
        // Custom parameters may carry the webhook's CallSid when the start
        // event omits one.
        if session.call_sid.is_empty() {
            if let Some(sid) = info.custom_parameters.get("CallSid") {
                session.call_sid = sid.clone();
            }
        }
        session
    };

    let (sender, receiver) = telephony::split(socket, &info);
    let services = build_services(config);
    let (session, stats) = bridge::run_bridge(session, backend, receiver, sender, services).await;
    info!(
        call_sid = %session.call_sid,
        stream_sid = %session.stream_sid,
        turns = session.turns().len(),
        forwarded = stats.forwarded,
        dropped = stats.dropped,
        "call finished"
    );
}
