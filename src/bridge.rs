//! Bridge orchestrator: wires the telephony adapter to a speech backend for
//! one call.
//!
//! For the duration of streaming exactly two loops run concurrently: the
//! uplink loop reads telephony events and forwards admitted caller audio to
//! the backend, the downlink loop polls the backend and forwards its audio
//! to the telephony sink. The only state they share is the half-duplex
//! [`SpeechGate`] (downlink writes, uplink reads). Whichever loop exits
//! first cancels the other at its next await point, so a dead socket never
//! leaves an orphaned reader or audio written into a closed peer.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, error, info, warn};

use crate::backend::{BackendEvent, VoiceBackend};
use crate::collaborators::{CallControl, CaseStore};
use crate::session::{AudioFrame, BridgeState, CallSession, SpeechGate};
use crate::telephony::{MediaSink, MediaSource, TwilioEvent};

/// Caller audio is discarded while the assistant speaks and for this long
/// after its last outbound audio, so the assistant's own voice leaking back
/// through the phone line is not misread as caller speech.
pub const ECHO_COOLDOWN: Duration = Duration::from_millis(1500);

/// Orchestrator-side collaborators: the case store invoked on a valid tool
/// invocation and the out-of-band call control used to hang up.
pub struct BridgeServices {
    pub case_store: Arc<dyn CaseStore>,
    pub call_control: Arc<dyn CallControl>,
    pub echo_cooldown: Duration,
}

/// Per-call forwarding counters, logged at teardown.
#[derive(Debug, Default, Clone, Copy)]
pub struct BridgeStats {
    pub forwarded: u64,
    pub dropped: u64,
}

/// Run one call to completion. Returns the session (in `Closed` state) and
/// the uplink forwarding counters.
pub async fn run_bridge(
    mut session: CallSession,
    mut backend: Box<dyn VoiceBackend>,
    mut source: impl MediaSource,
    mut media_sink: impl MediaSink,
    services: BridgeServices,
) -> (CallSession, BridgeStats) {
    if let Err(e) = session.advance(BridgeState::Streaming) {
        warn!(error = %e, "session not in connecting state");
    }

    if let Err(e) = backend.start().await {
        // Transport/configuration fault before any audio: the call ends
        // cleanly and the webhook-side fallback covers the caller.
        error!(error = %e, call_sid = %session.call_sid, "backend start failed");
        let _ = session.advance(BridgeState::Closed);
        return (session, BridgeStats::default());
    }
    let (mut backend_sink, mut backend_stream) = backend.split();

    if let Err(e) = session.advance(BridgeState::Listening) {
        warn!(error = %e, "could not enter listening");
    }

    let gate = SpeechGate::new();
    let cooldown = services.echo_cooldown;
    let mut stats = BridgeStats::default();

    {
        let stats = &mut stats;
        let gate = &gate;
        let session = &mut session;

        let uplink = async {
            loop {
                match source.next_event().await {
                    Ok(TwilioEvent::Media { media }) => {
                        if !media.is_inbound() {
                            continue;
                        }
                        let payload = media.mulaw_bytes();
                        if payload.is_empty() {
                            // Decode fault: drop the frame, never the call.
                            continue;
                        }
                        if gate.is_terminating() {
                            continue;
                        }
                        if gate.in_cooldown(cooldown) {
                            stats.dropped += 1;
                            continue;
                        }
                        stats.forwarded += 1;
                        let frame = AudioFrame::inbound_mulaw(stats.forwarded, payload);
                        if let Err(e) = backend_sink.forward_inbound(frame).await {
                            warn!(error = %e, "backend rejected inbound audio");
                            break;
                        }
                    }
                    Ok(TwilioEvent::Stop { stop }) => {
                        info!(call_sid = %stop.call_sid, "telephony stop");
                        break;
                    }
                    Ok(TwilioEvent::Dtmf { dtmf }) => {
                        info!(digit = %dtmf.digit, "dtmf");
                    }
                    Ok(TwilioEvent::Mark { mark }) => {
                        debug!(?mark, "mark");
                    }
                    Ok(other) => {
                        debug!(?other, "ignoring telephony event mid-call");
                    }
                    Err(e) => {
                        info!(error = %e, "telephony stream ended");
                        break;
                    }
                }
            }
        };

        let downlink = async {
            loop {
                let event = match backend_stream.poll_outbound().await {
                    Ok(event) => event,
                    Err(e) => {
                        info!(error = %e, "backend stream ended");
                        break;
                    }
                };
                match event {
                    BackendEvent::Audio(frame) => {
                        if session.state() == BridgeState::Listening {
                            let _ = session.advance(BridgeState::Speaking);
                        }
                        gate.note_outbound_audio();
                        if let Err(e) = media_sink.send_audio(&frame.payload).await {
                            warn!(error = %e, "telephony sink rejected audio");
                            break;
                        }
                    }
                    BackendEvent::TurnComplete => {
                        gate.finish_turn();
                        if let Err(e) = media_sink.flush_turn().await {
                            warn!(error = %e, "telephony sink rejected turn flush");
                            break;
                        }
                        if session.state() == BridgeState::CaseCreated {
                            // The terminal spoken turn has fully flushed; hang
                            // up out-of-band and wind the call down.
                            gate.begin_terminating();
                            let _ = session.advance(BridgeState::Terminating);
                            if let Err(e) =
                                services.call_control.end_call(&session.call_sid).await
                            {
                                error!(error = %e, "end call failed");
                            }
                            break;
                        }
                        let _ = session.advance(BridgeState::Listening);
                    }
                    BackendEvent::Interrupted => {
                        // Whatever is queued at the provider is stale.
                        gate.finish_turn();
                        if let Err(e) = media_sink.send_clear().await {
                            warn!(error = %e, "telephony sink rejected clear");
                            break;
                        }
                        let _ = session.advance(BridgeState::Listening);
                    }
                    BackendEvent::Transcript { role, text } => {
                        session.push_turn(role, text);
                    }
                    BackendEvent::Tool(invocation) => {
                        let missing = invocation.report.missing_fields();
                        if !missing.is_empty() {
                            // Protocol error, not a partial case: the caller
                            // gets another chance to fill the gaps.
                            warn!(?missing, "tool invocation missing fields, ignored");
                            if let Err(e) =
                                backend_stream.reject_tool(&invocation, &missing).await
                            {
                                warn!(error = %e, "tool rejection failed");
                                break;
                            }
                            continue;
                        }
                        let reporter = format!("voice-{}", session.call_sid);
                        match services
                            .case_store
                            .create_case(&invocation.report, &reporter)
                            .await
                        {
                            Ok(case_id) => {
                                info!(case_id = %case_id, "case created");
                                session.merge_report(invocation.report.clone());
                                let _ = session.advance(BridgeState::CaseCreated);
                                if let Err(e) =
                                    backend_stream.complete_tool(&invocation, &case_id).await
                                {
                                    warn!(error = %e, "tool completion failed");
                                    break;
                                }
                            }
                            Err(e) => {
                                // Logged, not retried mid-call; the caller
                                // stays in the conversation.
                                error!(error = %e, "case creation failed");
                            }
                        }
                    }
                    BackendEvent::Closed => {
                        info!("backend closed");
                        break;
                    }
                }
            }
        };

        tokio::pin!(uplink);
        tokio::pin!(downlink);
        tokio::select! {
            _ = &mut uplink => debug!("uplink loop finished first"),
            _ = &mut downlink => debug!("downlink loop finished first"),
        }
    }

    let _ = session.advance(BridgeState::Closed);
    info!(
        call_sid = %session.call_sid,
        forwarded = stats.forwarded,
        dropped = stats.dropped,
        "bridge closed"
    );
    (session, stats)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{BackendError, BackendSink, BackendStream};
    use crate::codec;
    use crate::collaborators::{
        CollaboratorError, Dialogue, DialogueReply, Synthesizer, Transcriber,
    };
    use crate::extract::{EmergencyReport, ToolInvocation};
    use crate::pipeline::{PipelineBackend, PipelineCollaborators};
    use crate::session::Role;
    use crate::telephony::{MediaMeta, StopMeta, TelephonyError};
    use async_trait::async_trait;
    use base64::engine::general_purpose::STANDARD as BASE64;
    use base64::Engine;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};
    use tokio::sync::Notify;

    fn media_event(payload: &[u8]) -> TwilioEvent {
        TwilioEvent::Media {
            media: MediaMeta {
                track: "inbound".into(),
                payload: BASE64.encode(payload),
            },
        }
    }

    fn stop_event() -> TwilioEvent {
        TwilioEvent::Stop {
            stop: StopMeta {
                call_sid: "CA1".into(),
            },
        }
    }

    fn full_report() -> EmergencyReport {
        EmergencyReport {
            full_name: Some("Tom Aro".into()),
            social_security_number: Some("19900101-1234".into()),
            location: Some("Sveavägen 10, Stockholm".into()),
            latitude: None,
            longitude: None,
            emergency_description: Some("Trapped by flood water".into()),
            category: Some("rescue".into()),
            severity: Some(4),
        }
    }

    struct ScriptedSource {
        events: VecDeque<TwilioEvent>,
        wait_for: Option<Arc<Notify>>,
    }

    impl ScriptedSource {
        fn new(events: Vec<TwilioEvent>) -> Self {
            Self {
                events: events.into(),
                wait_for: None,
            }
        }

        /// A source that never produces anything: the downlink side drives
        /// the scenario.
        fn silent_forever() -> Self {
            Self {
                events: VecDeque::new(),
                wait_for: Some(Arc::new(Notify::new())),
            }
        }
    }

    #[async_trait]
    impl MediaSource for ScriptedSource {
        async fn next_event(&mut self) -> Result<TwilioEvent, TelephonyError> {
            if let Some(notify) = self.wait_for.take() {
                notify.notified().await;
            }
            self.events.pop_front().ok_or(TelephonyError::Closed)
        }
    }

    #[derive(Debug, PartialEq)]
    enum SinkOp {
        Audio(usize),
        Flush,
        Clear,
    }

    struct RecordingSink {
        ops: Arc<Mutex<Vec<SinkOp>>>,
        first_audio: Option<Arc<Notify>>,
    }

    impl RecordingSink {
        fn new() -> (Self, Arc<Mutex<Vec<SinkOp>>>) {
            let ops = Arc::new(Mutex::new(Vec::new()));
            (
                Self {
                    ops: ops.clone(),
                    first_audio: None,
                },
                ops,
            )
        }
    }

    #[async_trait]
    impl MediaSink for RecordingSink {
        async fn send_audio(&mut self, mulaw: &[u8]) -> Result<(), TelephonyError> {
            self.ops.lock().unwrap().push(SinkOp::Audio(mulaw.len()));
            if let Some(notify) = self.first_audio.take() {
                notify.notify_one();
            }
            Ok(())
        }

        async fn flush_turn(&mut self) -> Result<(), TelephonyError> {
            self.ops.lock().unwrap().push(SinkOp::Flush);
            Ok(())
        }

        async fn send_clear(&mut self) -> Result<(), TelephonyError> {
            self.ops.lock().unwrap().push(SinkOp::Clear);
            Ok(())
        }
    }

    struct ScriptedBackend {
        events: VecDeque<BackendEvent>,
        hang_when_empty: bool,
        forwarded: Arc<AtomicUsize>,
        completions: Arc<Mutex<Vec<String>>>,
        rejections: Arc<Mutex<Vec<Vec<String>>>>,
    }

    impl ScriptedBackend {
        fn new(events: Vec<BackendEvent>, hang_when_empty: bool) -> Self {
            Self {
                events: events.into(),
                hang_when_empty,
                forwarded: Arc::new(AtomicUsize::new(0)),
                completions: Arc::new(Mutex::new(Vec::new())),
                rejections: Arc::new(Mutex::new(Vec::new())),
            }
        }
    }

    #[async_trait]
    impl VoiceBackend for ScriptedBackend {
        async fn start(&mut self) -> Result<(), BackendError> {
            Ok(())
        }

        fn split(self: Box<Self>) -> (Box<dyn BackendSink>, Box<dyn BackendStream>) {
            (
                Box::new(CountingBackendSink {
                    forwarded: self.forwarded,
                }),
                Box::new(ScriptedBackendStream {
                    events: self.events,
                    hang_when_empty: self.hang_when_empty,
                    completions: self.completions,
                    rejections: self.rejections,
                }),
            )
        }
    }

    struct CountingBackendSink {
        forwarded: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl BackendSink for CountingBackendSink {
        async fn forward_inbound(&mut self, _frame: AudioFrame) -> Result<(), BackendError> {
            self.forwarded.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    struct ScriptedBackendStream {
        events: VecDeque<BackendEvent>,
        hang_when_empty: bool,
        completions: Arc<Mutex<Vec<String>>>,
        rejections: Arc<Mutex<Vec<Vec<String>>>>,
    }

    #[async_trait]
    impl BackendStream for ScriptedBackendStream {
        async fn poll_outbound(&mut self) -> Result<BackendEvent, BackendError> {
            match self.events.pop_front() {
                Some(event) => Ok(event),
                None if self.hang_when_empty => std::future::pending().await,
                None => Ok(BackendEvent::Closed),
            }
        }

        async fn complete_tool(
            &mut self,
            _invocation: &ToolInvocation,
            case_id: &str,
        ) -> Result<(), BackendError> {
            self.completions.lock().unwrap().push(case_id.to_string());
            Ok(())
        }

        async fn reject_tool(
            &mut self,
            _invocation: &ToolInvocation,
            missing: &[&str],
        ) -> Result<(), BackendError> {
            self.rejections
                .lock()
                .unwrap()
                .push(missing.iter().map(|s| s.to_string()).collect());
            Ok(())
        }
    }

    struct CountingCaseStore {
        calls: Arc<AtomicUsize>,
        fail: bool,
    }

    #[async_trait]
    impl CaseStore for CountingCaseStore {
        async fn create_case(
            &self,
            _report: &EmergencyReport,
            _reporter: &str,
        ) -> Result<String, CollaboratorError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                Err(CollaboratorError::Persistence("store offline".into()))
            } else {
                Ok("case-123".into())
            }
        }
    }

    struct CountingCallControl {
        calls: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl CallControl for CountingCallControl {
        async fn end_call(&self, _call_sid: &str) -> Result<(), CollaboratorError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    struct TestServices {
        services: BridgeServices,
        case_calls: Arc<AtomicUsize>,
        end_calls: Arc<AtomicUsize>,
    }

    fn test_services(fail_case_store: bool) -> TestServices {
        let case_calls = Arc::new(AtomicUsize::new(0));
        let end_calls = Arc::new(AtomicUsize::new(0));
        TestServices {
            services: BridgeServices {
                case_store: Arc::new(CountingCaseStore {
                    calls: case_calls.clone(),
                    fail: fail_case_store,
                }),
                call_control: Arc::new(CountingCallControl {
                    calls: end_calls.clone(),
                }),
                echo_cooldown: ECHO_COOLDOWN,
            },
            case_calls,
            end_calls,
        }
    }

    struct CountingTranscriber {
        calls: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl Transcriber for CountingTranscriber {
        async fn transcribe(&self, _wav: &[u8]) -> Result<Option<String>, CollaboratorError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(Some("anything".into()))
        }
    }

    struct NoDialogue;

    #[async_trait]
    impl Dialogue for NoDialogue {
        async fn next_turn(
            &self,
            _history: &[crate::session::Turn],
            _utterance: &str,
        ) -> Result<DialogueReply, CollaboratorError> {
            Ok(DialogueReply {
                text: String::new(),
                extraction: EmergencyReport::default(),
            })
        }
    }

    struct SilentSynthesizer;

    #[async_trait]
    impl Synthesizer for SilentSynthesizer {
        async fn synthesize(&self, _text: &str) -> Result<Vec<u8>, CollaboratorError> {
            Ok(Vec::new())
        }
    }

    /// `start` + a minute of silence + `stop`: the pipeline variant must
    /// never invoke transcription and the call must reach `Closed` cleanly.
    #[tokio::test]
    async fn silent_call_closes_without_transcription() {
        let transcriptions = Arc::new(AtomicUsize::new(0));
        let backend = Box::new(PipelineBackend::new(
            "greeting",
            PipelineCollaborators {
                transcriber: Box::new(CountingTranscriber {
                    calls: transcriptions.clone(),
                }),
                dialogue: Box::new(NoDialogue),
                synthesizer: Box::new(SilentSynthesizer),
            },
        ));

        let silent = vec![codec::MULAW_SILENCE; codec::FRAME_BYTES];
        let mut events: Vec<TwilioEvent> = (0..60).map(|_| media_event(&silent)).collect();
        events.push(stop_event());
        let source = ScriptedSource::new(events);
        let (sink, _ops) = RecordingSink::new();

        let t = test_services(false);
        let session = CallSession::new("CA1", "MZ1");
        let (session, stats) = run_bridge(session, backend, source, sink, t.services).await;

        assert_eq!(transcriptions.load(Ordering::SeqCst), 0);
        assert_eq!(session.state(), BridgeState::Closed);
        assert_eq!(stats.forwarded, 60);
        assert_eq!(t.case_calls.load(Ordering::SeqCst), 0);
        assert_eq!(t.end_calls.load(Ordering::SeqCst), 0);
    }

    /// A complete function call: the case is created exactly once, one final
    /// spoken turn plays out, and exactly one end-call control operation is
    /// issued.
    #[tokio::test]
    async fn complete_tool_call_creates_case_and_terminates() {
        let backend = Box::new(ScriptedBackend::new(
            vec![
                BackendEvent::Tool(ToolInvocation {
                    call_id: Some("call_1".into()),
                    report: full_report(),
                }),
                BackendEvent::Audio(AudioFrame::outbound_mulaw(
                    1,
                    vec![codec::MULAW_SILENCE; codec::FRAME_BYTES],
                )),
                BackendEvent::TurnComplete,
            ],
            false,
        ));
        let completions = backend.completions.clone();
        let source = ScriptedSource::silent_forever();
        let (sink, ops) = RecordingSink::new();

        let t = test_services(false);
        let session = CallSession::new("CA1", "MZ1");
        let (session, _stats) = run_bridge(session, backend, source, sink, t.services).await;

        assert_eq!(t.case_calls.load(Ordering::SeqCst), 1);
        assert_eq!(t.end_calls.load(Ordering::SeqCst), 1);
        assert_eq!(*completions.lock().unwrap(), vec!["case-123".to_string()]);
        assert_eq!(session.state(), BridgeState::Closed);
        assert_eq!(session.report().category.as_deref(), Some("rescue"));
        // The terminal turn flushed to the caller before the hangup.
        let ops = ops.lock().unwrap();
        assert_eq!(*ops, vec![SinkOp::Audio(codec::FRAME_BYTES), SinkOp::Flush]);
    }

    /// Five of six fields: no case, no hangup; the invocation is rejected
    /// back to the backend and the conversation carries on in listening.
    #[tokio::test]
    async fn malformed_tool_call_is_ignored_and_call_continues() {
        let mut report = full_report();
        report.severity = None;
        let backend = Box::new(ScriptedBackend::new(
            vec![
                BackendEvent::Tool(ToolInvocation {
                    call_id: Some("call_1".into()),
                    report,
                }),
                BackendEvent::Transcript {
                    role: Role::Caller,
                    text: "it's pretty bad".into(),
                },
            ],
            false,
        ));
        let completions = backend.completions.clone();
        let rejections = backend.rejections.clone();
        let source = ScriptedSource::silent_forever();
        let (sink, _ops) = RecordingSink::new();

        let t = test_services(false);
        let session = CallSession::new("CA1", "MZ1");
        let (session, _stats) = run_bridge(session, backend, source, sink, t.services).await;

        assert_eq!(t.case_calls.load(Ordering::SeqCst), 0);
        assert_eq!(t.end_calls.load(Ordering::SeqCst), 0);
        assert!(completions.lock().unwrap().is_empty());
        assert_eq!(*rejections.lock().unwrap(), vec![vec!["severity".to_string()]]);
        // The transcript after the rejection proves the loop kept running.
        assert_eq!(session.turns().len(), 1);
        assert_eq!(session.state(), BridgeState::Closed);
    }

    /// Inbound frames arriving while the assistant speaks are dropped:
    /// nothing reaches the backend and the drop counter increments.
    #[tokio::test]
    async fn inbound_frames_while_speaking_are_dropped() {
        let backend = Box::new(ScriptedBackend::new(
            vec![BackendEvent::Audio(AudioFrame::outbound_mulaw(
                1,
                vec![codec::MULAW_SILENCE; codec::FRAME_BYTES],
            ))],
            true,
        ));
        let forwarded = backend.forwarded.clone();

        // The source releases its frames only after the first outbound chunk
        // has been played, so `speaking` is already set.
        let gate_open = Arc::new(Notify::new());
        let voiced = vec![0x40u8; codec::FRAME_BYTES];
        let mut events: Vec<TwilioEvent> = (0..5).map(|_| media_event(&voiced)).collect();
        events.push(stop_event());
        let mut source = ScriptedSource::new(events);
        source.wait_for = Some(gate_open.clone());

        let (mut sink, _ops) = RecordingSink::new();
        sink.first_audio = Some(gate_open);

        let t = test_services(false);
        let session = CallSession::new("CA1", "MZ1");
        let (session, stats) = run_bridge(session, backend, source, sink, t.services).await;

        assert_eq!(stats.forwarded, 0);
        assert_eq!(stats.dropped, 5);
        assert_eq!(forwarded.load(Ordering::SeqCst), 0);
        assert_eq!(session.state(), BridgeState::Closed);
    }

    /// An interruption mid-playback clears the provider's playout buffer
    /// before outbound audio resumes.
    #[tokio::test]
    async fn interruption_clears_before_audio_resumes() {
        let chunk = vec![codec::MULAW_SILENCE; codec::FRAME_BYTES];
        let backend = Box::new(ScriptedBackend::new(
            vec![
                BackendEvent::Audio(AudioFrame::outbound_mulaw(1, chunk.clone())),
                BackendEvent::Interrupted,
                BackendEvent::Audio(AudioFrame::outbound_mulaw(2, chunk)),
                BackendEvent::TurnComplete,
            ],
            false,
        ));
        let source = ScriptedSource::silent_forever();
        let (sink, ops) = RecordingSink::new();

        let t = test_services(false);
        let session = CallSession::new("CA1", "MZ1");
        let (session, _stats) = run_bridge(session, backend, source, sink, t.services).await;

        let ops = ops.lock().unwrap();
        assert_eq!(
            *ops,
            vec![
                SinkOp::Audio(codec::FRAME_BYTES),
                SinkOp::Clear,
                SinkOp::Audio(codec::FRAME_BYTES),
                SinkOp::Flush,
            ]
        );
        assert_eq!(session.state(), BridgeState::Closed);
    }

    /// A persistence failure is logged, never retried, and never fatal: the
    /// call keeps listening.
    #[tokio::test]
    async fn case_store_failure_keeps_call_listening() {
        let backend = Box::new(ScriptedBackend::new(
            vec![
                BackendEvent::Tool(ToolInvocation {
                    call_id: Some("call_1".into()),
                    report: full_report(),
                }),
                BackendEvent::Transcript {
                    role: Role::Assistant,
                    text: "still here with you".into(),
                },
            ],
            false,
        ));
        let completions = backend.completions.clone();
        let source = ScriptedSource::silent_forever();
        let (sink, _ops) = RecordingSink::new();

        let t = test_services(true);
        let session = CallSession::new("CA1", "MZ1");
        let (session, _stats) = run_bridge(session, backend, source, sink, t.services).await;

        assert_eq!(t.case_calls.load(Ordering::SeqCst), 1);
        assert_eq!(t.end_calls.load(Ordering::SeqCst), 0);
        assert!(completions.lock().unwrap().is_empty());
        assert_eq!(session.turns().len(), 1);
        assert_eq!(session.state(), BridgeState::Closed);
    }
}

