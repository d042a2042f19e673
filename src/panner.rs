//! The panner bank.
//!
//! Spatialized sources each own one [`PannerLane`], allocated from the
//! context's [`PannerBank`]. A lane takes a mono block plus an
//! azimuth/elevation/scalar triple and writes a stereo block into the
//! master bus, ramping ear gains across the block so movement never clicks.
//!
//! Two strategies exist. `Stereo` is a plain constant-power pan.
//! `Hrtf` shares the pan law but additionally runs a head-shadow one-pole
//! on the far ear, standing in for a full HRIR convolution engine; the lane
//! interface is shaped so such an engine drops in without touching sources.

use crate::config::BLOCK_SIZE;
use crate::filter_design::{design_one_pole, IirFilterState};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

/// Panning strategy. Discriminants are stable and part of the external
/// surface.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(i32)]
pub enum PannerStrategy {
    #[default]
    Hrtf = 0,
    Stereo = 1,
}

impl PannerStrategy {
    pub fn from_i64(value: i64) -> Self {
        match value {
            1 => PannerStrategy::Stereo,
            _ => PannerStrategy::Hrtf,
        }
    }
}

/// Tracks lane allocation across a context, mostly for diagnostics; lanes
/// release themselves when their source dies.
#[derive(Debug, Default)]
pub struct PannerBank {
    active_lanes: AtomicUsize,
}

impl PannerBank {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn allocate_lane(self: &Arc<Self>, strategy: PannerStrategy) -> PannerLane {
        self.active_lanes.fetch_add(1, Ordering::Relaxed);
        log::debug!(
            "allocated {strategy:?} panner lane ({} active)",
            self.active_lanes.load(Ordering::Relaxed)
        );
        PannerLane::new(strategy, self.clone())
    }

    pub fn active_lanes(&self) -> usize {
        self.active_lanes.load(Ordering::Relaxed)
    }
}

/// One source's slot in the panner bank.
pub struct PannerLane {
    strategy: PannerStrategy,
    bank: Arc<PannerBank>,
    /// Target ear gains for the current block.
    target_left: f32,
    target_right: f32,
    /// Ear gains at the end of the previous block.
    current_left: f32,
    current_right: f32,
    /// Head-shadow filters, used by the Hrtf strategy only.
    shadow_left: IirFilterState,
    shadow_right: IirFilterState,
    /// Shadow openness per ear: 1 = unfiltered.
    shadow_mix_left: f32,
    shadow_mix_right: f32,
    primed: bool,
}

impl PannerLane {
    fn new(strategy: PannerStrategy, bank: Arc<PannerBank>) -> Self {
        let shadow = design_one_pole(0.6);
        Self {
            strategy,
            bank,
            target_left: std::f32::consts::FRAC_1_SQRT_2,
            target_right: std::f32::consts::FRAC_1_SQRT_2,
            current_left: std::f32::consts::FRAC_1_SQRT_2,
            current_right: std::f32::consts::FRAC_1_SQRT_2,
            shadow_left: IirFilterState::new(&shadow, 1),
            shadow_right: IirFilterState::new(&shadow, 1),
            shadow_mix_left: 1.0,
            shadow_mix_right: 1.0,
            primed: false,
        }
    }

    pub fn strategy(&self) -> PannerStrategy {
        self.strategy
    }

    /// Update the lane from spherical angles (degrees; azimuth clockwise
    /// from straight ahead).
    pub fn set_angles(&mut self, azimuth: f64, elevation: f64) {
        let az = azimuth.to_radians();
        let el = elevation.to_radians();
        // Project onto the horizontal pan axis; overhead sources collapse
        // to center.
        self.set_scalar(az.sin() * el.cos());
    }

    /// Update the lane from a plain panning scalar in [-1, 1]
    /// (-1 = hard left).
    pub fn set_scalar(&mut self, scalar: f64) {
        let scalar = scalar.clamp(-1.0, 1.0);
        // Constant-power law.
        let angle = (scalar + 1.0) * std::f64::consts::FRAC_PI_4;
        self.target_left = angle.cos() as f32;
        self.target_right = angle.sin() as f32;

        if self.strategy == PannerStrategy::Hrtf {
            // The far ear sits in the head's acoustic shadow; duck its
            // high end proportionally to how far off-center the source is.
            let off_center = scalar.abs() as f32;
            self.shadow_mix_left = if scalar > 0.0 { 1.0 - 0.8 * off_center } else { 1.0 };
            self.shadow_mix_right = if scalar < 0.0 { 1.0 - 0.8 * off_center } else { 1.0 };
        }
    }

    /// Pan one mono block into an interleaved stereo bus, adding.
    pub fn pan_block(&mut self, mono: &[f32; BLOCK_SIZE], out: &mut [f32]) {
        debug_assert!(out.len() >= BLOCK_SIZE * 2);
        if !self.primed {
            // First block after allocation: no previous gains to ramp from.
            self.current_left = self.target_left;
            self.current_right = self.target_right;
            self.primed = true;
        }

        let step_left = (self.target_left - self.current_left) / BLOCK_SIZE as f32;
        let step_right = (self.target_right - self.current_right) / BLOCK_SIZE as f32;

        match self.strategy {
            PannerStrategy::Stereo => {
                for (i, &sample) in mono.iter().enumerate() {
                    let l = self.current_left + step_left * i as f32;
                    let r = self.current_right + step_right * i as f32;
                    out[i * 2] += sample * l;
                    out[i * 2 + 1] += sample * r;
                }
            }
            PannerStrategy::Hrtf => {
                let mut left = *mono;
                let mut right = *mono;
                self.shadow_left.process_block(&mut left);
                self.shadow_right.process_block(&mut right);
                for i in 0..BLOCK_SIZE {
                    let l = self.current_left + step_left * i as f32;
                    let r = self.current_right + step_right * i as f32;
                    let dry = mono[i];
                    let wet_l = left[i] + (dry - left[i]) * self.shadow_mix_left;
                    let wet_r = right[i] + (dry - right[i]) * self.shadow_mix_right;
                    out[i * 2] += wet_l * l;
                    out[i * 2 + 1] += wet_r * r;
                }
            }
        }

        self.current_left = self.target_left;
        self.current_right = self.target_right;
    }
}

impl Drop for PannerLane {
    fn drop(&mut self) {
        self.bank.active_lanes.fetch_sub(1, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn block_of(value: f32) -> [f32; BLOCK_SIZE] {
        [value; BLOCK_SIZE]
    }

    fn run_lane(lane: &mut PannerLane, blocks: usize) -> Vec<f32> {
        let mono = block_of(1.0);
        let mut out = vec![0.0f32; BLOCK_SIZE * 2];
        for _ in 0..blocks {
            out.fill(0.0);
            lane.pan_block(&mono, &mut out);
        }
        out
    }

    #[test]
    fn bank_counts_lanes() {
        let bank = PannerBank::new();
        let lane = bank.allocate_lane(PannerStrategy::Stereo);
        assert_eq!(bank.active_lanes(), 1);
        drop(lane);
        assert_eq!(bank.active_lanes(), 0);
    }

    #[test]
    fn hard_right_silences_left() {
        let bank = PannerBank::new();
        let mut lane = bank.allocate_lane(PannerStrategy::Stereo);
        lane.set_scalar(1.0);
        let out = run_lane(&mut lane, 2);
        let (left, right) = (out[10], out[11]);
        assert!(left.abs() < 1e-6, "left leaked: {left}");
        assert!((right - 1.0).abs() < 1e-5, "right was {right}");
    }

    #[test]
    fn center_is_constant_power() {
        let bank = PannerBank::new();
        let mut lane = bank.allocate_lane(PannerStrategy::Stereo);
        lane.set_scalar(0.0);
        let out = run_lane(&mut lane, 2);
        let power = out[10] * out[10] + out[11] * out[11];
        assert!((power - 1.0).abs() < 1e-5);
    }

    #[test]
    fn azimuth_90_pans_right() {
        let bank = PannerBank::new();
        let mut lane = bank.allocate_lane(PannerStrategy::Stereo);
        lane.set_angles(90.0, 0.0);
        let out = run_lane(&mut lane, 2);
        assert!(out[11] > 0.9);
        assert!(out[10].abs() < 1e-4);
    }

    #[test]
    fn hrtf_far_ear_is_attenuated() {
        let bank = PannerBank::new();
        let mut lane = bank.allocate_lane(PannerStrategy::Hrtf);
        lane.set_angles(90.0, 0.0);
        // Nyquist-rate content is where the head shadow bites.
        let mut mono = [0.0f32; BLOCK_SIZE];
        for (i, s) in mono.iter_mut().enumerate() {
            *s = if i % 2 == 0 { 1.0 } else { -1.0 };
        }
        let mut out = vec![0.0f32; BLOCK_SIZE * 2];
        for _ in 0..4 {
            out.fill(0.0);
            lane.pan_block(&mono, &mut out);
        }
        let left_peak = out.iter().step_by(2).fold(0.0f32, |a, &s| a.max(s.abs()));
        let right_peak = out[1..]
            .iter()
            .step_by(2)
            .fold(0.0f32, |a, &s| a.max(s.abs()));
        // Hard right: left ear is both panned down and shadow-filtered.
        assert!(left_peak < right_peak * 0.25, "{left_peak} vs {right_peak}");
    }
}
