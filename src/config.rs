//! Environment configuration.
//!
//! Twelve-factor style: everything comes from environment variables (with a
//! `.env` loaded at startup). Credentials stay optional at load time —
//! whether the selected backend can actually run is checked per call, and a
//! missing credential downgrades the webhook to the static spoken fallback
//! instead of leaving the caller in silence.

use std::env;

/// Which speech-AI backend bridges the calls.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendKind {
    /// Continuous speech-to-speech realtime API.
    Realtime,
    /// Silence-triggered transcription → dialogue → synthesis.
    Pipeline,
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("missing environment variables: {0:?}")]
    MissingCredentials(Vec<&'static str>),
}

#[derive(Debug, Clone)]
pub struct Config {
    /// Bind address for the HTTP/WebSocket front door.
    pub bind_addr: String,
    /// Public base URL the provider reaches us at (https://…); the media
    /// stream URL is derived from it.
    pub public_url: Option<String>,
    pub backend: BackendKind,

    pub openai_api_key: Option<String>,
    pub realtime_url: String,
    pub realtime_voice: String,
    pub chat_model: String,
    pub transcription_model: String,

    pub elevenlabs_api_key: Option<String>,
    pub elevenlabs_voice_id: String,
    pub elevenlabs_model_id: String,

    pub case_intake_url: Option<String>,

    pub twilio_account_sid: Option<String>,
    pub twilio_auth_token: Option<String>,

    /// First spoken turn of the pipeline backend.
    pub greeting: String,
    /// Spoken by the webhook fallback when the backend cannot start.
    pub fallback_message: String,
}

fn var(name: &str) -> Option<String> {
    env::var(name).ok().filter(|v| !v.trim().is_empty())
}

fn var_or(name: &str, default: &str) -> String {
    var(name).unwrap_or_else(|| default.to_string())
}

impl Config {
    pub fn from_env() -> Self {
        let backend = match var_or("VOICE_BACKEND", "realtime").to_lowercase().as_str() {
            "pipeline" => BackendKind::Pipeline,
            _ => BackendKind::Realtime,
        };
        Self {
            bind_addr: var_or("BIND_ADDR", "0.0.0.0:8080"),
            public_url: var("PUBLIC_URL"),
            backend,
            openai_api_key: var("OPENAI_API_KEY"),
            realtime_url: var_or(
                "OPENAI_REALTIME_URL",
                "wss://api.openai.com/v1/realtime?model=gpt-realtime",
            ),
            realtime_voice: var_or("OPENAI_REALTIME_VOICE", "alloy"),
            chat_model: var_or("OPENAI_CHAT_MODEL", "gpt-4o-mini"),
            transcription_model: var_or("OPENAI_TRANSCRIPTION_MODEL", "whisper-1"),
            elevenlabs_api_key: var("ELEVEN_LABS_API_KEY"),
            elevenlabs_voice_id: var_or("ELEVEN_LABS_VOICE_ID", "21m00Tcm4TlvDq8ikWAM"),
            elevenlabs_model_id: var_or("ELEVEN_LABS_MODEL_ID", "eleven_multilingual_v2"),
            case_intake_url: var("CASE_INTAKE_URL"),
            twilio_account_sid: var("TWILIO_ACCOUNT_SID"),
            twilio_auth_token: var("TWILIO_AUTH_TOKEN"),
            greeting: var_or(
                "VOICE_GREETING",
                "Emergency response line. I'm here to help. Can you start by telling me your full name?",
            ),
            fallback_message: var_or(
                "VOICE_FALLBACK_MESSAGE",
                "We are sorry, the voice assistant is unavailable right now. Please call back shortly.",
            ),
        }
    }

    /// Credentials the selected backend needs before a bridge may start.
    /// Missing ones are a configuration fault: the call gets the static
    /// spoken fallback instead.
    pub fn backend_ready(&self) -> Result<(), ConfigError> {
        let mut missing = Vec::new();
        match self.backend {
            BackendKind::Realtime => {
                if self.openai_api_key.is_none() {
                    missing.push("OPENAI_API_KEY");
                }
            }
            BackendKind::Pipeline => {
                if self.openai_api_key.is_none() {
                    missing.push("OPENAI_API_KEY");
                }
                if self.elevenlabs_api_key.is_none() {
                    missing.push("ELEVEN_LABS_API_KEY");
                }
            }
        }
        if missing.is_empty() {
            Ok(())
        } else {
            Err(ConfigError::MissingCredentials(missing))
        }
    }

    /// Media stream URL handed to the provider in the connect TwiML.
    pub fn stream_url(&self) -> Option<String> {
        let base = self.public_url.as_deref()?;
        let base = base
            .replace("https://", "wss://")
            .replace("http://", "ws://");
        Some(format!("{}/ws/voice", base.trim_end_matches('/')))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_config() -> Config {
        Config {
            bind_addr: "0.0.0.0:8080".into(),
            public_url: Some("https://bridge.example.org".into()),
            backend: BackendKind::Realtime,
            openai_api_key: Some("sk-test".into()),
            realtime_url: "wss://api.openai.com/v1/realtime?model=gpt-realtime".into(),
            realtime_voice: "alloy".into(),
            chat_model: "gpt-4o-mini".into(),
            transcription_model: "whisper-1".into(),
            elevenlabs_api_key: Some("el-test".into()),
            elevenlabs_voice_id: "21m00Tcm4TlvDq8ikWAM".into(),
            elevenlabs_model_id: "eleven_multilingual_v2".into(),
            case_intake_url: None,
            twilio_account_sid: None,
            twilio_auth_token: None,
            greeting: "hello".into(),
            fallback_message: "unavailable".into(),
        }
    }

    #[test]
    fn realtime_backend_needs_only_the_realtime_key() {
        let mut config = base_config();
        config.elevenlabs_api_key = None;
        assert!(config.backend_ready().is_ok());
        config.openai_api_key = None;
        match config.backend_ready() {
            Err(ConfigError::MissingCredentials(missing)) => {
                assert_eq!(missing, vec!["OPENAI_API_KEY"]);
            }
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn pipeline_backend_needs_both_keys() {
        let mut config = base_config();
        config.backend = BackendKind::Pipeline;
        assert!(config.backend_ready().is_ok());
        config.elevenlabs_api_key = None;
        match config.backend_ready() {
            Err(ConfigError::MissingCredentials(missing)) => {
                assert_eq!(missing, vec!["ELEVEN_LABS_API_KEY"]);
            }
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn stream_url_swaps_scheme_and_appends_route() {
        let config = base_config();
        assert_eq!(
            config.stream_url().as_deref(),
            Some("wss://bridge.example.org/ws/voice")
        );
        let mut config = base_config();
        config.public_url = None;
        assert!(config.stream_url().is_none());
    }
}
