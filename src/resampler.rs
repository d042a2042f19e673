//! Streaming resampler bridging decoder sample rates to the engine rate.
//!
//! Fixed-output-size wrapper over rubato: each call produces exactly one
//! engine block, and the caller asks how many input frames to decode first.
//! Streaming generators run one of these per generator, on the background
//! worker thread, so the audio thread never resamples.

use crate::error::{Result, SonanceError};
use rubato::{FastFixedOut, PolynomialDegree, Resampler};

pub struct StreamingResampler {
    resampler: FastFixedOut<f32>,
    channels: usize,
    /// Deinterleaved input staging, one Vec per channel.
    input: Vec<Vec<f32>>,
    /// Deinterleaved output staging.
    output: Vec<Vec<f32>>,
}

impl StreamingResampler {
    /// Build a resampler converting `source_rate` to `target_rate`,
    /// producing `output_frames` frames per call.
    pub fn new(
        source_rate: u32,
        target_rate: u32,
        channels: usize,
        output_frames: usize,
    ) -> Result<Self> {
        if source_rate == 0 || target_rate == 0 || channels == 0 || output_frames == 0 {
            return Err(SonanceError::Internal(
                "resampler parameters must be non-zero".to_string(),
            ));
        }

        let resampler = FastFixedOut::new(
            target_rate as f64 / source_rate as f64,
            1.0,
            PolynomialDegree::Septic,
            output_frames,
            channels,
        )
        .map_err(|e| SonanceError::Decoder(format!("failed to create resampler: {e}")))?;

        let max_input = resampler.input_frames_max();
        Ok(Self {
            resampler,
            channels,
            input: vec![vec![0.0; max_input]; channels],
            output: vec![vec![0.0; output_frames]; channels],
        })
    }

    /// How many input frames the next [`process_interleaved`] call needs.
    ///
    /// [`process_interleaved`]: StreamingResampler::process_interleaved
    pub fn input_frames_needed(&self) -> usize {
        self.resampler.input_frames_next()
    }

    /// Resample exactly [`input_frames_needed`] frames of interleaved input
    /// into `out`, which must hold one full output block. Returns the frames
    /// written (always the configured output size).
    ///
    /// [`input_frames_needed`]: StreamingResampler::input_frames_needed
    pub fn process_interleaved(&mut self, input: &[f32], out: &mut [f32]) -> Result<usize> {
        let frames_in = self.input_frames_needed();
        debug_assert_eq!(input.len(), frames_in * self.channels);

        for (ch, lane) in self.input.iter_mut().enumerate() {
            lane.resize(frames_in, 0.0);
            for (frame, sample) in lane.iter_mut().enumerate() {
                *sample = input[frame * self.channels + ch];
            }
        }

        let (_, frames_out) = self
            .resampler
            .process_into_buffer(&self.input, &mut self.output, None)
            .map_err(|e| SonanceError::Decoder(format!("resampling: {e}")))?;

        for frame in 0..frames_out {
            for ch in 0..self.channels {
                out[frame * self.channels + ch] = self.output[ch][frame];
            }
        }
        Ok(frames_out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sine_interleaved(frames: usize, channels: usize, rate: f32, freq: f32) -> Vec<f32> {
        let mut out = Vec::with_capacity(frames * channels);
        for i in 0..frames {
            let t = i as f32 / rate;
            let sample = (2.0 * std::f32::consts::PI * freq * t).sin() * 0.5;
            for _ in 0..channels {
                out.push(sample);
            }
        }
        out
    }

    #[test]
    fn rejects_zero_parameters() {
        assert!(StreamingResampler::new(0, 44100, 2, 256).is_err());
        assert!(StreamingResampler::new(48000, 44100, 0, 256).is_err());
    }

    #[test]
    fn downsampling_produces_full_blocks() {
        let mut resampler = StreamingResampler::new(48000, 44100, 2, 256).unwrap();
        let mut out = vec![0.0f32; 256 * 2];
        for _ in 0..8 {
            let needed = resampler.input_frames_needed();
            let input = sine_interleaved(needed, 2, 48000.0, 440.0);
            let frames = resampler.process_interleaved(&input, &mut out).unwrap();
            assert_eq!(frames, 256);
        }
    }

    #[test]
    fn upsampling_preserves_amplitude_roughly() {
        let mut resampler = StreamingResampler::new(22050, 44100, 1, 256).unwrap();
        let mut out = vec![0.0f32; 256];
        let mut peak = 0.0f32;
        for _ in 0..32 {
            let needed = resampler.input_frames_needed();
            let input = sine_interleaved(needed, 1, 22050.0, 440.0);
            resampler.process_interleaved(&input, &mut out).unwrap();
            peak = out.iter().fold(peak, |acc, &s| acc.max(s.abs()));
        }
        assert!(peak > 0.4 && peak < 0.6, "peak was {peak}");
    }
}
