//! G.711 μ-law codec and telephony audio helpers.
//!
//! The telephony side speaks 8-bit μ-law PCM at 8 kHz; the speech backends
//! want 16-bit linear PCM at 16 or 24 kHz. Everything in this module is a
//! stateless pure function: expansion and compression per ITU-T G.711,
//! nearest-neighbor resampling between the wire rate and a backend rate, an
//! RMS loudness estimate for silence classification, and a minimal WAV
//! container for handing one utterance to the transcription service.
//!
//! Malformed input never faults a call: every function returns an empty
//! result for unusable bytes and callers skip the frame.

use std::io::Cursor;
use std::sync::OnceLock;

/// Sample rate of the telephony media stream.
pub const WIRE_SAMPLE_RATE: u32 = 8_000;

/// One outbound media chunk: 20 ms of 8 kHz μ-law.
pub const FRAME_BYTES: usize = 160;

/// Wall-clock duration of one wire frame.
pub const FRAME_MILLIS: u64 = 20;

/// μ-law code for zero amplitude, used to pad a turn's final chunk.
pub const MULAW_SILENCE: u8 = 0xFF;

const BIAS: i32 = 0x84;
const CLIP: i32 = 8031;

static EXPAND_TABLE: OnceLock<[i16; 256]> = OnceLock::new();

/// 256-entry μ-law expansion table, built once per process and read-only
/// afterwards, so it is shared across calls without locking.
fn expand_table() -> &'static [i16; 256] {
    EXPAND_TABLE.get_or_init(|| {
        let mut table = [0i16; 256];
        for (code, entry) in table.iter_mut().enumerate() {
            let u = !(code as u8);
            let exponent = (u >> 4) & 0x07;
            let mantissa = (u & 0x0F) as i32;
            // Magnitude on the 13-bit scale: the decoder's output range is
            // exactly the encoder's clip range [-8031, 8031], which makes the
            // pair a true inverse (modulo the quantizer itself).
            let magnitude = ((((mantissa << 3) + BIAS) << exponent) - BIAS) >> 2;
            *entry = if u & 0x80 != 0 {
                -magnitude as i16
            } else {
                magnitude as i16
            };
        }
        table
    })
}

/// Expand μ-law bytes to 16-bit linear samples. One byte per sample; empty
/// input yields an empty result.
pub fn decode(mu_law: &[u8]) -> Vec<i16> {
    let table = expand_table();
    mu_law.iter().map(|&b| table[b as usize]).collect()
}

/// Compress one linear sample to its μ-law code: clip to [-8031, 8031], add
/// the 0x84 bias, locate the 3-bit exponent by magnitude, take the 4-bit
/// mantissa, and emit the one's complement with the sign bit.
pub fn encode_sample(sample: i16) -> u8 {
    let mut magnitude = sample as i32;
    let sign = if magnitude < 0 {
        magnitude = -magnitude;
        0x80
    } else {
        0x00
    };
    if magnitude > CLIP {
        magnitude = CLIP;
    }
    let biased = (magnitude << 2) + BIAS;
    let mut exponent = 7;
    for e in 0..8 {
        if biased <= 0xFF << e {
            exponent = e;
            break;
        }
    }
    let mantissa = (biased >> (exponent + 3)) & 0x0F;
    !((sign | (exponent << 4) | mantissa) as u8)
}

/// Compress linear samples to μ-law bytes.
pub fn encode(samples: &[i16]) -> Vec<u8> {
    samples.iter().map(|&s| encode_sample(s)).collect()
}

/// Integer resampling ratio for [`resample`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Ratio {
    /// Repeat every sample `n` times (8 kHz → 16/24 kHz).
    Up(usize),
    /// Keep every `n`th sample (16/24 kHz → 8 kHz).
    Down(usize),
}

/// Nearest-neighbor resampling by an integer ratio.
///
/// This is a deliberate quality shortcut: repeating or striding samples
/// aliases, but is intelligible over a phone line and costs nothing. A
/// replacement with a filtered resampler must keep the length contract
/// (`n` samples → `n·r` or `ceil(n/r)` samples).
pub fn resample(samples: &[i16], ratio: Ratio) -> Vec<i16> {
    match ratio {
        Ratio::Up(0) | Ratio::Down(0) => Vec::new(),
        Ratio::Up(factor) => {
            let mut out = Vec::with_capacity(samples.len() * factor);
            for &s in samples {
                for _ in 0..factor {
                    out.push(s);
                }
            }
            out
        }
        Ratio::Down(factor) => samples.iter().copied().step_by(factor).collect(),
    }
}

/// Root-mean-square loudness of a sample window. Used only to classify a
/// frame as speech or silence, never for decoding quality. Empty input is 0.
pub fn rms(samples: &[i16]) -> f64 {
    if samples.is_empty() {
        return 0.0;
    }
    let sum_sq: f64 = samples.iter().map(|&s| (s as f64) * (s as f64)).sum();
    (sum_sq / samples.len() as f64).sqrt()
}

/// Reinterpret little-endian PCM bytes as 16-bit samples. Odd-length input
/// is malformed and yields an empty result.
pub fn pcm_bytes_to_samples(bytes: &[u8]) -> Vec<i16> {
    if bytes.len() % 2 != 0 {
        return Vec::new();
    }
    bytes
        .chunks_exact(2)
        .map(|pair| i16::from_le_bytes([pair[0], pair[1]]))
        .collect()
}

/// Serialize 16-bit samples as little-endian PCM bytes.
pub fn samples_to_pcm_bytes(samples: &[i16]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(samples.len() * 2);
    for &s in samples {
        bytes.extend_from_slice(&s.to_le_bytes());
    }
    bytes
}

/// Wrap mono 16-bit samples in a minimal WAV container for the transcription
/// service. Empty input (or a write failure, which cannot happen on an
/// in-memory cursor) yields an empty result.
pub fn wav_from_samples(samples: &[i16], sample_rate: u32) -> Vec<u8> {
    if samples.is_empty() {
        return Vec::new();
    }
    let spec = hound::WavSpec {
        channels: 1,
        sample_rate,
        bits_per_sample: 16,
        sample_format: hound::SampleFormat::Int,
    };
    let mut cursor = Cursor::new(Vec::new());
    {
        let mut writer = match hound::WavWriter::new(&mut cursor, spec) {
            Ok(w) => w,
            Err(_) => return Vec::new(),
        };
        for &s in samples {
            if writer.write_sample(s).is_err() {
                return Vec::new();
            }
        }
        if writer.finalize().is_err() {
            return Vec::new();
        }
    }
    cursor.into_inner()
}
