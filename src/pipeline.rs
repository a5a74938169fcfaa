//! Turn-based pipeline backend adapter.
//!
//! No persistent backend connection: this side watches the caller's audio
//! for a second of silence, treats everything before the silence window as
//! one utterance, and runs transcription → dialogue → synthesis as three
//! sequential collaborator calls per turn. The synthesized reply streams
//! back one wire frame per frame interval so the provider's playout buffer
//! is never overrun.

use async_trait::async_trait;
use std::time::Duration;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio::time::sleep;
use tracing::{debug, info, warn};

use crate::backend::{BackendError, BackendEvent, BackendSink, BackendStream, VoiceBackend};
use crate::codec::{self, FRAME_BYTES, FRAME_MILLIS, WIRE_SAMPLE_RATE};
use crate::collaborators::{Dialogue, Synthesizer, Transcriber};
use crate::extract::{EmergencyReport, ToolInvocation};
use crate::session::{AudioFrame, Role, Turn};

/// A chunk is silent when the RMS of its decoded samples is below this.
pub const SILENCE_RMS_THRESHOLD: f64 = 200.0;

/// Consecutive silent frames that end an utterance (~1 s at 20 ms frames).
pub const SILENCE_FRAMES_FOR_TURN: usize = 50;

/// Minimum utterance length worth transcribing (~0.5 s); anything shorter
/// is noise, not a turn.
pub const MIN_UTTERANCE_FRAMES: usize = 25;

/// Spoken when a collaborator fails mid-turn; the call stays open so the
/// caller can try again.
const APOLOGY_TEXT: &str = "I'm sorry, I had a small problem. Please try again.";

/// Rolling frame buffer with a consecutive-silence counter.
///
/// Every inbound frame is appended; when the silence counter crosses the
/// threshold, the buffered audio *preceding* the silence window is one
/// utterance. The minimum-length guard discards utterances too short to be
/// speech. After firing, continued silence does not fire again until voice
/// resumes.
#[derive(Debug)]
pub struct UtteranceSegmenter {
    frames: Vec<Vec<u8>>,
    consecutive_silent: usize,
    fired: bool,
    silence_threshold: f64,
    silence_frames: usize,
    min_frames: usize,
}

impl UtteranceSegmenter {
    pub fn new(silence_threshold: f64, silence_frames: usize, min_frames: usize) -> Self {
        Self {
            frames: Vec::new(),
            consecutive_silent: 0,
            fired: false,
            silence_threshold,
            silence_frames,
            min_frames,
        }
    }

    /// Feed one μ-law frame; returns the utterance's μ-law bytes when a turn
    /// closes and survives the length guard.
    pub fn push_frame(&mut self, mulaw: &[u8]) -> Option<Vec<u8>> {
        let loudness = codec::rms(&codec::decode(mulaw));
        let silent = loudness < self.silence_threshold;
        self.frames.push(mulaw.to_vec());

        if !silent {
            self.consecutive_silent = 0;
            self.fired = false;
            return None;
        }

        self.consecutive_silent += 1;
        if self.consecutive_silent < self.silence_frames || self.fired {
            return None;
        }
        self.fired = true;

        let speech_len = self.frames.len() - self.silence_frames;
        let speech: Vec<Vec<u8>> = self.frames.drain(..).take(speech_len).collect();
        if speech.len() < self.min_frames {
            debug!(frames = speech.len(), "utterance below length guard, discarded");
            return None;
        }
        Some(speech.concat())
    }
}

impl Default for UtteranceSegmenter {
    fn default() -> Self {
        Self::new(
            SILENCE_RMS_THRESHOLD,
            SILENCE_FRAMES_FOR_TURN,
            MIN_UTTERANCE_FRAMES,
        )
    }
}

/// The three per-turn collaborators.
pub struct PipelineCollaborators {
    pub transcriber: Box<dyn Transcriber>,
    pub dialogue: Box<dyn Dialogue>,
    pub synthesizer: Box<dyn Synthesizer>,
}

/// Pipeline backend, unstarted. `start` speaks the greeting; `split` hands
/// the segmenting/transcribing side to the uplink loop and the paced event
/// queue to the downlink loop.
pub struct PipelineBackend {
    greeting: String,
    collaborators: Option<PipelineCollaborators>,
    tx: UnboundedSender<BackendEvent>,
    rx: Option<UnboundedReceiver<BackendEvent>>,
    history: Vec<Turn>,
    seq: u64,
}

impl PipelineBackend {
    pub fn new(greeting: impl Into<String>, collaborators: PipelineCollaborators) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            greeting: greeting.into(),
            collaborators: Some(collaborators),
            tx,
            rx: Some(rx),
            history: Vec::new(),
            seq: 0,
        }
    }
}

#[async_trait]
impl VoiceBackend for PipelineBackend {
    async fn start(&mut self) -> Result<(), BackendError> {
        let Some(collaborators) = self.collaborators.as_ref() else {
            return Err(BackendError::Closed);
        };
        // Greeting turn: an emergency line speaks first.
        match collaborators.synthesizer.synthesize(&self.greeting).await {
            Ok(audio) if !audio.is_empty() => {
                self.history.push(Turn {
                    role: Role::Assistant,
                    text: self.greeting.clone(),
                });
                queue_event(
                    &self.tx,
                    BackendEvent::Transcript {
                        role: Role::Assistant,
                        text: self.greeting.clone(),
                    },
                );
                let mut seq = self.seq;
                queue_audio(&self.tx, &audio, &mut seq);
                self.seq = seq;
                queue_event(&self.tx, BackendEvent::TurnComplete);
            }
            Ok(_) => debug!("greeting synthesis returned no audio"),
            Err(e) => warn!(error = %e, "greeting synthesis failed"),
        }
        Ok(())
    }

    fn split(self: Box<Self>) -> (Box<dyn BackendSink>, Box<dyn BackendStream>) {
        let collaborators = self.collaborators;
        (
            Box::new(PipelineSink {
                collaborators,
                segmenter: UtteranceSegmenter::default(),
                history: self.history,
                report: EmergencyReport::default(),
                tx: self.tx,
                seq: self.seq,
            }),
            Box::new(PipelineStream { rx: self.rx }),
        )
    }
}

fn queue_event(tx: &UnboundedSender<BackendEvent>, event: BackendEvent) {
    // The receiver half only disappears at teardown; late events are moot.
    let _ = tx.send(event);
}

/// Queue synthesized μ-law audio as wire-frame-sized events.
fn queue_audio(tx: &UnboundedSender<BackendEvent>, mulaw: &[u8], seq: &mut u64) {
    for chunk in mulaw.chunks(FRAME_BYTES) {
        *seq += 1;
        queue_event(
            tx,
            BackendEvent::Audio(AudioFrame::outbound_mulaw(*seq, chunk.to_vec())),
        );
    }
}

pub struct PipelineSink {
    collaborators: Option<PipelineCollaborators>,
    segmenter: UtteranceSegmenter,
    history: Vec<Turn>,
    report: EmergencyReport,
    tx: UnboundedSender<BackendEvent>,
    seq: u64,
}

impl PipelineSink {
    async fn speak(&mut self, text: &str) {
        let Some(collaborators) = self.collaborators.as_ref() else {
            return;
        };
        match collaborators.synthesizer.synthesize(text).await {
            Ok(audio) if !audio.is_empty() => {
                queue_audio(&self.tx, &audio, &mut self.seq);
                queue_event(&self.tx, BackendEvent::TurnComplete);
            }
            Ok(_) => debug!("synthesis returned no audio"),
            Err(e) => warn!(error = %e, "synthesis failed"),
        }
    }

    /// One complete caller utterance: transcribe, run the dialogue model with
    /// the prior turns, surface what it extracted, and speak the reply.
    /// Collaborator failures keep the call alive — log, apologize, listen on.
    async fn run_turn(&mut self, utterance: Vec<u8>) {
        let Some(collaborators) = self.collaborators.as_ref() else {
            return;
        };
        let samples = codec::decode(&utterance);
        let wav = codec::wav_from_samples(&samples, WIRE_SAMPLE_RATE);
        if wav.is_empty() {
            return;
        }

        let transcript = match collaborators.transcriber.transcribe(&wav).await {
            Ok(Some(text)) => text,
            Ok(None) => {
                debug!("utterance produced no transcript");
                return;
            }
            Err(e) => {
                warn!(error = %e, "transcription failed");
                self.speak(APOLOGY_TEXT).await;
                return;
            }
        };
        info!(transcript = %transcript, "caller utterance");
        queue_event(
            &self.tx,
            BackendEvent::Transcript {
                role: Role::Caller,
                text: transcript.clone(),
            },
        );

        let reply = match collaborators
            .dialogue
            .next_turn(&self.history, &transcript)
            .await
        {
            Ok(reply) => reply,
            Err(e) => {
                warn!(error = %e, "dialogue turn failed");
                self.history.push(Turn {
                    role: Role::Caller,
                    text: transcript,
                });
                self.speak(APOLOGY_TEXT).await;
                return;
            }
        };

        self.history.push(Turn {
            role: Role::Caller,
            text: transcript,
        });
        self.history.push(Turn {
            role: Role::Assistant,
            text: reply.text.clone(),
        });
        queue_event(
            &self.tx,
            BackendEvent::Transcript {
                role: Role::Assistant,
                text: reply.text.clone(),
            },
        );

        self.report.merge(reply.extraction);
        if self.report.is_complete() {
            // All six fields collected: hand the orchestrator the invocation
            // before the terminal reply audio, so the case exists by the time
            // the goodbye finishes playing.
            queue_event(
                &self.tx,
                BackendEvent::Tool(ToolInvocation {
                    call_id: None,
                    report: self.report.clone(),
                }),
            );
        }

        self.speak(&reply.text).await;
    }
}

#[async_trait]
impl BackendSink for PipelineSink {
    async fn forward_inbound(&mut self, frame: AudioFrame) -> Result<(), BackendError> {
        if let Some(utterance) = self.segmenter.push_frame(&frame.payload) {
            self.run_turn(utterance).await;
        }
        Ok(())
    }
}

pub struct PipelineStream {
    rx: Option<UnboundedReceiver<BackendEvent>>,
}

#[async_trait]
impl BackendStream for PipelineStream {
    async fn poll_outbound(&mut self) -> Result<BackendEvent, BackendError> {
        let Some(rx) = self.rx.as_mut() else {
            return Err(BackendError::Closed);
        };
        match rx.recv().await {
            Some(BackendEvent::Audio(frame)) => {
                // One wire frame per frame interval keeps the provider's
                // playout buffer from overrunning.
                sleep(Duration::from_millis(FRAME_MILLIS)).await;
                Ok(BackendEvent::Audio(frame))
            }
            Some(event) => Ok(event),
            None => Ok(BackendEvent::Closed),
        }
    }

    async fn complete_tool(
        &mut self,
        _invocation: &ToolInvocation,
        _case_id: &str,
    ) -> Result<(), BackendError> {
        // The terminal reply was queued with the invocation; nothing to ask for.
        Ok(())
    }

    async fn reject_tool(
        &mut self,
        _invocation: &ToolInvocation,
        _missing: &[&str],
    ) -> Result<(), BackendError> {
        // The dialogue keeps asking for missing fields on its own.
        Ok(())
    }
}
