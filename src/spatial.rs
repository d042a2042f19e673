//! Distance models and spatial gain.
//!
//! Modeled after the WebAudio distance models. A 3D source resolves its
//! gain from listener distance through one of these every block; the result
//! is fed to a fade driver, so parameter jumps never zipper.

use crate::math::{db_to_gain, smoothstep};

/// Distance attenuation model. Discriminants are stable and part of the
/// external surface.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(i32)]
pub enum DistanceModel {
    #[default]
    None = 0,
    Linear = 1,
    Exponential = 2,
    Inverse = 3,
}

impl DistanceModel {
    pub fn from_i64(value: i64) -> Self {
        match value {
            1 => DistanceModel::Linear,
            2 => DistanceModel::Exponential,
            3 => DistanceModel::Inverse,
            _ => DistanceModel::None,
        }
    }
}

/// The full distance-attenuation parameter set carried by 3D sources (and,
/// as defaults, by the context).
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DistanceParams {
    pub model: DistanceModel,
    pub distance_ref: f64,
    pub distance_max: f64,
    pub rolloff: f64,
    /// Extra gain in dB applied as the listener gets very close.
    pub closeness_boost: f64,
    pub closeness_boost_distance: f64,
}

impl Default for DistanceParams {
    fn default() -> Self {
        Self {
            model: DistanceModel::Linear,
            distance_ref: 1.0,
            distance_max: 50.0,
            rolloff: 1.0,
            closeness_boost: 0.0,
            closeness_boost_distance: 0.0,
        }
    }
}

impl DistanceParams {
    /// Gain for a source at `distance`, before the closeness boost.
    pub fn model_gain(&self, distance: f64) -> f64 {
        let r = self.distance_ref.max(0.0);
        let m = self.distance_max.max(r);
        let k = self.rolloff;
        let d = distance.clamp(r, m);

        match self.model {
            DistanceModel::None => 1.0,
            DistanceModel::Linear => {
                if m <= r {
                    return 1.0;
                }
                (1.0 - k * (d - r) / (m - r)).clamp(0.0, 1.0)
            }
            DistanceModel::Inverse => {
                if d <= r || r == 0.0 {
                    1.0
                } else {
                    r / (r + k * (d - r))
                }
            }
            DistanceModel::Exponential => {
                if r == 0.0 {
                    0.0
                } else {
                    (d / r).powf(-k)
                }
            }
        }
    }

    /// Full spatial gain including the smoothstep closeness boost: inside
    /// `closeness_boost_distance` the gain rises toward `closeness_boost`
    /// dB above the model gain at distance zero.
    pub fn gain_at(&self, distance: f64) -> f64 {
        let base = self.model_gain(distance);
        let c = self.closeness_boost_distance;
        if self.closeness_boost <= 0.0 || c <= 0.0 || distance >= c {
            return base;
        }
        let t = smoothstep(1.0 - distance / c);
        base * db_to_gain(self.closeness_boost * t)
    }
}
