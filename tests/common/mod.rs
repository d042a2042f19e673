//! Shared helpers for the scenario tests.
#![allow(dead_code)]

use sonance::api;
use sonance::device::CollectSink;
use sonance::Handle;

/// The library is process-global; tests share one initialization.
pub fn ensure_init() {
    match api::initialize() {
        Ok(()) => {}
        Err(e) if e.code() == sonance::ErrorCode::AlreadyInitialized => {}
        Err(e) => panic!("initialize failed: {e}"),
    }
}

/// A context running over an in-process sink capped at `limit_frames`.
pub fn sink_context(limit_frames: usize) -> (Handle, CollectSink) {
    ensure_init();
    let sink = CollectSink::with_limit(limit_frames);
    let ctx = api::create_context_with_output(Box::new(sink.clone())).unwrap();
    (ctx, sink)
}

/// Mono 16-bit PCM WAV bytes for the given samples.
pub fn wav_bytes(samples: &[f32], sample_rate: u32) -> Vec<u8> {
    let data_len = (samples.len() * 2) as u32;
    let mut out = Vec::with_capacity(44 + data_len as usize);
    out.extend_from_slice(b"RIFF");
    out.extend_from_slice(&(36 + data_len).to_le_bytes());
    out.extend_from_slice(b"WAVE");
    out.extend_from_slice(b"fmt ");
    out.extend_from_slice(&16u32.to_le_bytes());
    out.extend_from_slice(&1u16.to_le_bytes()); // PCM
    out.extend_from_slice(&1u16.to_le_bytes()); // mono
    out.extend_from_slice(&sample_rate.to_le_bytes());
    out.extend_from_slice(&(sample_rate * 2).to_le_bytes()); // byte rate
    out.extend_from_slice(&2u16.to_le_bytes()); // block align
    out.extend_from_slice(&16u16.to_le_bytes()); // bits per sample
    out.extend_from_slice(b"data");
    out.extend_from_slice(&data_len.to_le_bytes());
    for &sample in samples {
        let quantized = (sample.clamp(-1.0, 1.0) * 32767.0) as i16;
        out.extend_from_slice(&quantized.to_le_bytes());
    }
    out
}

/// One second's worth of sine at `freq` Hz and unit amplitude.
pub fn sine(freq: f32, frames: usize, sample_rate: u32) -> Vec<f32> {
    (0..frames)
        .map(|i| (2.0 * std::f32::consts::PI * freq * i as f32 / sample_rate as f32).sin())
        .collect()
}

pub fn peak(samples: &[f32]) -> f32 {
    samples.iter().fold(0.0f32, |acc, &s| acc.max(s.abs()))
}

pub fn rms(samples: &[f32]) -> f32 {
    if samples.is_empty() {
        return 0.0;
    }
    (samples.iter().map(|s| s * s).sum::<f32>() / samples.len() as f32).sqrt()
}
