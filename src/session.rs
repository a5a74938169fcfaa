//! Per-call session state: audio frame tagging, conversation history, the
//! half-duplex speech gate shared by the two forwarding loops, and the call
//! lifecycle state machine.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{Duration, Instant};

use crate::extract::EmergencyReport;

/// Which way a frame is travelling through the bridge.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Caller → backend.
    Inbound,
    /// Backend → caller.
    Outbound,
}

/// Audio encoding of a frame's payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Encoding {
    /// 8-bit G.711 μ-law at 8 kHz (the wire format).
    MuLaw8k,
    /// 16-bit little-endian linear PCM at the given rate.
    LinearPcm { rate: u32 },
}

/// One ≈20 ms chunk of audio moving through the bridge. Produced once,
/// moved to its single consumer, never retained after forwarding.
#[derive(Debug)]
pub struct AudioFrame {
    pub direction: Direction,
    pub encoding: Encoding,
    /// Monotonic per-direction sequence number.
    pub seq: u64,
    pub payload: Vec<u8>,
}

impl AudioFrame {
    pub fn inbound_mulaw(seq: u64, payload: Vec<u8>) -> Self {
        Self {
            direction: Direction::Inbound,
            encoding: Encoding::MuLaw8k,
            seq,
            payload,
        }
    }

    pub fn outbound_mulaw(seq: u64, payload: Vec<u8>) -> Self {
        Self {
            direction: Direction::Outbound,
            encoding: Encoding::MuLaw8k,
            seq,
            payload,
        }
    }
}

/// Speaker of one conversation turn.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Caller,
    Assistant,
}

/// One exchange unit of dialogue.
#[derive(Debug, Clone)]
pub struct Turn {
    pub role: Role,
    pub text: String,
}

/// Half-duplex gate shared between the two forwarding loops.
///
/// Single-writer discipline: only the backend→telephony loop sets the
/// speaking flag and outbound timestamp; the telephony→backend loop only
/// reads them to decide whether to drop a frame. A race admits or drops at
/// most one extra frame, so plain atomics are enough — no lock.
#[derive(Debug)]
pub struct SpeechGate {
    speaking: AtomicBool,
    /// Milliseconds since gate creation of the last outbound audio; 0 means
    /// no audio has been emitted yet.
    last_outbound_ms: AtomicU64,
    terminating: AtomicBool,
    epoch: Instant,
}

impl SpeechGate {
    pub fn new() -> Self {
        Self {
            speaking: AtomicBool::new(false),
            last_outbound_ms: AtomicU64::new(0),
            terminating: AtomicBool::new(false),
            epoch: Instant::now(),
        }
    }

    fn now_ms(&self) -> u64 {
        // +1 so a stamp at t=0 is distinguishable from "never".
        self.epoch.elapsed().as_millis() as u64 + 1
    }

    /// Called by the downlink loop on every outbound audio chunk.
    pub fn note_outbound_audio(&self) {
        self.speaking.store(true, Ordering::Relaxed);
        self.last_outbound_ms.store(self.now_ms(), Ordering::Relaxed);
    }

    /// Called by the downlink loop when a spoken turn completes: the
    /// assistant stops speaking and the cooldown window starts counting from
    /// the turn boundary.
    pub fn finish_turn(&self) {
        self.speaking.store(false, Ordering::Relaxed);
        self.last_outbound_ms.store(self.now_ms(), Ordering::Relaxed);
    }

    pub fn is_speaking(&self) -> bool {
        self.speaking.load(Ordering::Relaxed)
    }

    /// True while assistant audio is playing or for `cooldown` after the last
    /// outbound chunk — the window in which caller-side audio is discarded so
    /// the assistant's own voice leaking back through the phone line is not
    /// misread as caller speech.
    pub fn in_cooldown(&self, cooldown: Duration) -> bool {
        if self.speaking.load(Ordering::Relaxed) {
            return true;
        }
        let last = self.last_outbound_ms.load(Ordering::Relaxed);
        if last == 0 {
            return false;
        }
        let elapsed = self.now_ms().saturating_sub(last);
        elapsed < cooldown.as_millis() as u64
    }

    /// Once termination begins no new inbound audio is admitted; queued
    /// outbound audio is still allowed to flush.
    pub fn begin_terminating(&self) {
        self.terminating.store(true, Ordering::Relaxed);
    }

    pub fn is_terminating(&self) -> bool {
        self.terminating.load(Ordering::Relaxed)
    }
}

impl Default for SpeechGate {
    fn default() -> Self {
        Self::new()
    }
}

/// Lifecycle of one bridged call.
///
/// `Connecting → Streaming → {Listening ⇄ Speaking} → CaseCreated →
/// Terminating → Closed`. `Closed` is additionally reachable from any state
/// because either socket can die at any time (transport faults are fatal but
/// clean).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BridgeState {
    Connecting,
    Streaming,
    Listening,
    Speaking,
    CaseCreated,
    Terminating,
    Closed,
}

impl BridgeState {
    fn allows(self, next: BridgeState) -> bool {
        use BridgeState::*;
        if next == Closed {
            return true;
        }
        matches!(
            (self, next),
            (Connecting, Streaming)
                | (Streaming, Listening)
                | (Listening, Speaking)
                | (Speaking, Listening)
                | (Listening, CaseCreated)
                | (Speaking, CaseCreated)
                | (CaseCreated, Terminating)
        )
    }
}

#[derive(Debug, thiserror::Error)]
#[error("illegal bridge state transition {from:?} -> {to:?}")]
pub struct StateError {
    pub from: BridgeState,
    pub to: BridgeState,
}

/// One per active phone call. Created when the telephony side delivers the
/// stream identifier, owned exclusively by the bridge orchestrator, and
/// destroyed exactly once when the call ends.
#[derive(Debug)]
pub struct CallSession {
    pub call_sid: String,
    pub stream_sid: String,
    state: BridgeState,
    turns: Vec<Turn>,
    report: EmergencyReport,
}

impl CallSession {
    pub fn new(call_sid: impl Into<String>, stream_sid: impl Into<String>) -> Self {
        Self {
            call_sid: call_sid.into(),
            stream_sid: stream_sid.into(),
            state: BridgeState::Connecting,
            turns: Vec::new(),
            report: EmergencyReport::default(),
        }
    }

    pub fn state(&self) -> BridgeState {
        self.state
    }

    /// Advance the lifecycle, rejecting transitions the state machine does
    /// not allow. Re-entering the current state is a no-op (turn boundaries
    /// oscillate between Listening and Speaking at frame rate).
    pub fn advance(&mut self, next: BridgeState) -> Result<(), StateError> {
        if self.state == next {
            return Ok(());
        }
        if !self.state.allows(next) {
            return Err(StateError {
                from: self.state,
                to: next,
            });
        }
        self.state = next;
        Ok(())
    }

    pub fn push_turn(&mut self, role: Role, text: impl Into<String>) {
        self.turns.push(Turn {
            role,
            text: text.into(),
        });
    }

    pub fn turns(&self) -> &[Turn] {
        &self.turns
    }

    /// Fold a partial extraction into the session's report (last non-null
    /// write wins per field).
    pub fn merge_report(&mut self, update: EmergencyReport) {
        self.report.merge(update);
    }

    pub fn report(&self) -> &EmergencyReport {
        &self.report
    }
}
