//! External collaborator interfaces and their HTTP implementations.
//!
//! The bridge consumes these as opaque functions: speech-to-text, the
//! per-turn dialogue model, text-to-speech, the case persistence store, and
//! the provider's out-of-band call control. Each trait has exactly the
//! surface the bridge needs; everything behind it belongs to other services.

use async_trait::async_trait;
use serde_json::json;
use tracing::debug;

use crate::extract::{parse_reply_and_extraction, EmergencyReport};
use crate::session::{Role, Turn};

const OPENAI_TRANSCRIPTION_URL: &str = "https://api.openai.com/v1/audio/transcriptions";
const OPENAI_CHAT_URL: &str = "https://api.openai.com/v1/chat/completions";
const ELEVENLABS_TTS_URL: &str = "https://api.elevenlabs.io/v1/text-to-speech";
const TWILIO_API_URL: &str = "https://api.twilio.com/2010-04-01";

/// Instructions for the per-turn dialogue model. The model collects the
/// caller's details one item at a time and reports what it has extracted so
/// far on a trailing marker line.
pub const DIALOGUE_SYSTEM_PROMPT: &str = r#"You are an emergency response assistant on a live phone call. The caller may be stressed or scared. Your job is to collect critical information one piece at a time, in a calm and reassuring way.

Collect these items (in any order, one or two per turn):
1. Full name
2. Social security number (for identification)
3. Current location (as specific as possible - address, landmark, or area)
4. Description of the emergency - what happened and what they need

Guidelines:
- Be warm, calm, and reassuring. If the caller sounds stressed, acknowledge it and reassure them that help is being coordinated.
- Ask for ONE thing at a time (or at most two). Keep your replies SHORT and natural for speech - a few sentences only.
- If they give you more than one piece of information, acknowledge it and ask for the next missing piece.
- Categories are fuel, medical, shelter, food_water, rescue, other. Severity 1-5 (5 = life-threatening).
- When you have everything (full name, SSN, location, emergency description, category, severity), thank them, confirm that help is on the way, and close with: "That's everything I need. Help is being coordinated. You can hang up when you're ready. Stay safe."

Output format: First write your spoken reply (what the caller hears). Then on a new line write exactly:
VOICE_EXTRACTION: {"full_name": null or "string", "social_security_number": null or "string", "location": null or "string", "emergency_description": null or "string", "category": null or "fuel|medical|shelter|food_water|rescue|other", "severity": null or 1-5}
Use null for any field not yet provided by the caller. The JSON must be valid and on one line after VOICE_EXTRACTION:."#;

#[derive(Debug, thiserror::Error)]
pub enum CollaboratorError {
    #[error("collaborator transport error: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("collaborator api error: status={status} body={body}")]
    Api { status: u16, body: String },

    #[error("persistence error: {0}")]
    Persistence(String),

    #[error("{0} is not configured")]
    NotConfigured(&'static str),
}

/// `transcribe(audioBytes) -> text | empty`.
#[async_trait]
pub trait Transcriber: Send + Sync {
    /// Transcribe one WAV utterance. `None` means no usable speech.
    async fn transcribe(&self, wav: &[u8]) -> Result<Option<String>, CollaboratorError>;
}

/// Reply produced by one dialogue turn.
#[derive(Debug, Clone)]
pub struct DialogueReply {
    /// What the caller hears (handed to the synthesizer).
    pub text: String,
    /// What the model extracted so far; merged into the session report.
    pub extraction: EmergencyReport,
}

/// `dialogueTurn(history, utterance) -> (replyText, extractionFields)`.
#[async_trait]
pub trait Dialogue: Send + Sync {
    async fn next_turn(
        &self,
        history: &[Turn],
        utterance: &str,
    ) -> Result<DialogueReply, CollaboratorError>;
}

/// `synthesize(text) -> audioBytes | empty`. Output is μ-law 8 kHz, ready
/// for the wire.
#[async_trait]
pub trait Synthesizer: Send + Sync {
    async fn synthesize(&self, text: &str) -> Result<Vec<u8>, CollaboratorError>;
}

/// `createCase(extractionFields) -> caseID`. Create-only; a failure is a
/// `Persistence` error the orchestrator logs but does not retry mid-call.
#[async_trait]
pub trait CaseStore: Send + Sync {
    async fn create_case(
        &self,
        report: &EmergencyReport,
        reporter: &str,
    ) -> Result<String, CollaboratorError>;
}

/// Out-of-band "end call" operation keyed by call identifier, used only
/// after the terminal spoken turn completes.
#[async_trait]
pub trait CallControl: Send + Sync {
    async fn end_call(&self, call_sid: &str) -> Result<(), CollaboratorError>;
}

async fn error_for_status(response: reqwest::Response) -> Result<reqwest::Response, CollaboratorError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    Err(CollaboratorError::Api {
        status: status.as_u16(),
        body: body.chars().take(500).collect(),
    })
}

/// Whisper-style transcription over HTTP.
pub struct WhisperTranscriber {
    client: reqwest::Client,
    api_key: String,
    model: String,
}

impl WhisperTranscriber {
    pub fn new(api_key: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            api_key: api_key.into(),
            model: model.into(),
        }
    }
}

#[async_trait]
impl Transcriber for WhisperTranscriber {
    async fn transcribe(&self, wav: &[u8]) -> Result<Option<String>, CollaboratorError> {
        if wav.is_empty() {
            return Ok(None);
        }
        let file = reqwest::multipart::Part::bytes(wav.to_vec())
            .file_name("audio.wav")
            .mime_str("audio/wav")?;
        let form = reqwest::multipart::Form::new()
            .part("file", file)
            .text("model", self.model.clone())
            .text("response_format", "text");
        let response = self
            .client
            .post(OPENAI_TRANSCRIPTION_URL)
            .bearer_auth(&self.api_key)
            .multipart(form)
            .send()
            .await?;
        let text = error_for_status(response).await?.text().await?;
        let text = text.trim();
        if text.is_empty() {
            Ok(None)
        } else {
            Ok(Some(text.to_string()))
        }
    }
}

/// Chat-completion dialogue model with the extraction-marker contract.
pub struct ChatDialogue {
    client: reqwest::Client,
    api_key: String,
    model: String,
}

impl ChatDialogue {
    pub fn new(api_key: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            api_key: api_key.into(),
            model: model.into(),
        }
    }
}

/// Thread the prior turns plus the new utterance into a chat message list.
fn build_chat_messages(history: &[Turn], utterance: &str) -> Vec<serde_json::Value> {
    let mut messages = vec![json!({"role": "system", "content": DIALOGUE_SYSTEM_PROMPT})];
    for turn in history {
        let role = match turn.role {
            Role::Caller => "user",
            Role::Assistant => "assistant",
        };
        messages.push(json!({"role": role, "content": turn.text}));
    }
    messages.push(json!({"role": "user", "content": utterance}));
    messages
}

#[async_trait]
impl Dialogue for ChatDialogue {
    async fn next_turn(
        &self,
        history: &[Turn],
        utterance: &str,
    ) -> Result<DialogueReply, CollaboratorError> {
        let body = json!({
            "model": self.model,
            "temperature": 0.6,
            "messages": build_chat_messages(history, utterance),
        });
        let response = self
            .client
            .post(OPENAI_CHAT_URL)
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await?;
        let value: serde_json::Value = error_for_status(response).await?.json().await?;
        let raw = value["choices"][0]["message"]["content"]
            .as_str()
            .unwrap_or_default();
        let (text, extraction) = parse_reply_and_extraction(raw);
        debug!(reply_len = text.len(), "dialogue turn complete");
        Ok(DialogueReply { text, extraction })
    }
}

/// ElevenLabs text-to-speech, asked for μ-law 8 kHz directly so no further
/// transcoding is needed on the way to the wire.
pub struct ElevenLabsSynthesizer {
    client: reqwest::Client,
    api_key: String,
    voice_id: String,
    model_id: String,
}

impl ElevenLabsSynthesizer {
    pub fn new(
        api_key: impl Into<String>,
        voice_id: impl Into<String>,
        model_id: impl Into<String>,
    ) -> Self {
        Self {
            client: reqwest::Client::new(),
            api_key: api_key.into(),
            voice_id: voice_id.into(),
            model_id: model_id.into(),
        }
    }
}

#[async_trait]
impl Synthesizer for ElevenLabsSynthesizer {
    async fn synthesize(&self, text: &str) -> Result<Vec<u8>, CollaboratorError> {
        let text = text.trim();
        if text.is_empty() {
            return Ok(Vec::new());
        }
        let url = format!(
            "{ELEVENLABS_TTS_URL}/{}?output_format=ulaw_8000",
            self.voice_id
        );
        let response = self
            .client
            .post(url)
            .header("xi-api-key", &self.api_key)
            .header("Accept", "audio/*")
            .json(&json!({"text": text, "model_id": self.model_id}))
            .send()
            .await?;
        let audio = error_for_status(response).await?.bytes().await?;
        Ok(audio.to_vec())
    }
}

/// Posts the completed report to the case intake endpoint.
pub struct HttpCaseStore {
    client: reqwest::Client,
    intake_url: String,
}

impl HttpCaseStore {
    pub fn new(intake_url: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            intake_url: intake_url.into(),
        }
    }
}

#[async_trait]
impl CaseStore for HttpCaseStore {
    async fn create_case(
        &self,
        report: &EmergencyReport,
        reporter: &str,
    ) -> Result<String, CollaboratorError> {
        let response = self
            .client
            .post(&self.intake_url)
            .json(&json!({"reporter": reporter, "report": report}))
            .send()
            .await
            .map_err(|e| CollaboratorError::Persistence(e.to_string()))?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(CollaboratorError::Persistence(format!(
                "case intake rejected: status={status} body={}",
                body.chars().take(200).collect::<String>()
            )));
        }
        let value: serde_json::Value = response
            .json()
            .await
            .map_err(|e| CollaboratorError::Persistence(e.to_string()))?;
        value["case_id"]
            .as_str()
            .or_else(|| value["id"].as_str())
            .map(str::to_string)
            .ok_or_else(|| CollaboratorError::Persistence("case intake returned no case id".into()))
    }
}

/// Provider REST call control: mark the call completed, which hangs it up.
pub struct TwilioCallControl {
    client: reqwest::Client,
    account_sid: String,
    auth_token: String,
}

impl TwilioCallControl {
    pub fn new(account_sid: impl Into<String>, auth_token: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            account_sid: account_sid.into(),
            auth_token: auth_token.into(),
        }
    }
}

#[async_trait]
impl CallControl for TwilioCallControl {
    async fn end_call(&self, call_sid: &str) -> Result<(), CollaboratorError> {
        let url = format!(
            "{TWILIO_API_URL}/Accounts/{}/Calls/{call_sid}.json",
            self.account_sid
        );
        let response = self
            .client
            .post(url)
            .basic_auth(&self.account_sid, Some(&self.auth_token))
            .form(&[("Status", "completed")])
            .send()
            .await?;
        error_for_status(response).await?;
        Ok(())
    }
}

/// Stand-in for a collaborator whose credentials are absent. Every call
/// fails with a `NotConfigured` error; the orchestrator logs it and the call
/// carries on per the fault taxonomy.
pub struct Unconfigured(pub &'static str);

#[async_trait]
impl CaseStore for Unconfigured {
    async fn create_case(
        &self,
        _report: &EmergencyReport,
        _reporter: &str,
    ) -> Result<String, CollaboratorError> {
        Err(CollaboratorError::NotConfigured(self.0))
    }
}

#[async_trait]
impl CallControl for Unconfigured {
    async fn end_call(&self, _call_sid: &str) -> Result<(), CollaboratorError> {
        Err(CollaboratorError::NotConfigured(self.0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chat_messages_thread_history_in_order() {
        let history = vec![
            Turn {
                role: Role::Caller,
                text: "hello".into(),
            },
            Turn {
                role: Role::Assistant,
                text: "what is your name?".into(),
            },
        ];
        let messages = build_chat_messages(&history, "Tom Aro");
        assert_eq!(messages.len(), 4);
        assert_eq!(messages[0]["role"], "system");
        assert_eq!(messages[1]["role"], "user");
        assert_eq!(messages[1]["content"], "hello");
        assert_eq!(messages[2]["role"], "assistant");
        assert_eq!(messages[3]["role"], "user");
        assert_eq!(messages[3]["content"], "Tom Aro");
    }

    #[test]
    fn system_prompt_carries_the_extraction_marker() {
        assert!(DIALOGUE_SYSTEM_PROMPT.contains(crate::extract::EXTRACTION_MARKER));
    }
}
