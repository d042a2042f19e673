//! Vector math for spatialization.

pub use glam::DVec3;

/// An orthonormal listener frame derived from the listener's `at`/`up`
/// orientation pair. `right` is `at x up`; all three are unit length.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ListenerFrame {
    pub position: DVec3,
    pub at: DVec3,
    pub up: DVec3,
    pub right: DVec3,
}

impl ListenerFrame {
    /// Build a frame from a position triple and an `(at, up)` sextuple.
    ///
    /// Degenerate orientations (zero-length or parallel vectors) fall back
    /// to the default frame rather than producing NaNs in the mix.
    pub fn new(position: [f64; 3], orientation: [f64; 6]) -> Self {
        let position = DVec3::from_array(position);
        let at = DVec3::new(orientation[0], orientation[1], orientation[2]);
        let up = DVec3::new(orientation[3], orientation[4], orientation[5]);

        let at = at.try_normalize().unwrap_or(DVec3::Y);
        let up = up.try_normalize().unwrap_or(DVec3::Z);
        let right = match at.cross(up).try_normalize() {
            Some(r) => r,
            None => return Self::default_at(position),
        };

        Self { position, at, up, right }
    }

    fn default_at(position: DVec3) -> Self {
        Self {
            position,
            at: DVec3::Y,
            up: DVec3::Z,
            right: DVec3::X,
        }
    }

    /// Azimuth and elevation of `point` in this frame, in degrees.
    ///
    /// Azimuth is measured clockwise from `at` (0 = straight ahead,
    /// 90 = hard right) in [0, 360); elevation is in [-90, 90]. A point at
    /// the listener position resolves to straight ahead.
    pub fn angles_to(&self, point: DVec3) -> (f64, f64) {
        let direction = match (point - self.position).try_normalize() {
            Some(d) => d,
            None => return (0.0, 0.0),
        };

        let x = direction.dot(self.right);
        let y = direction.dot(self.at);
        let z = direction.dot(self.up).clamp(-1.0, 1.0);

        let mut azimuth = x.atan2(y).to_degrees();
        if azimuth < 0.0 {
            azimuth += 360.0;
        }
        let elevation = z.asin().to_degrees();
        (azimuth, elevation)
    }

    /// Euclidean distance from the listener to `point`.
    pub fn distance_to(&self, point: DVec3) -> f64 {
        self.position.distance(point)
    }
}

impl Default for ListenerFrame {
    fn default() -> Self {
        Self::default_at(DVec3::ZERO)
    }
}

/// Hermite smoothstep on the unit interval, clamped outside it.
pub fn smoothstep(t: f64) -> f64 {
    let t = t.clamp(0.0, 1.0);
    t * t * (3.0 - 2.0 * t)
}

/// Convert a decibel value to a linear gain factor.
pub fn db_to_gain(db: f64) -> f64 {
    10.0_f64.powf(db / 20.0)
}

#[cfg(test)]
mod tests {
    use super::*;

    const DEFAULT_ORIENTATION: [f64; 6] = [0.0, 1.0, 0.0, 0.0, 0.0, 1.0];

    #[test]
    fn default_frame_faces_positive_y() {
        let frame = ListenerFrame::new([0.0; 3], DEFAULT_ORIENTATION);
        assert_eq!(frame.at, DVec3::Y);
        assert_eq!(frame.right, DVec3::X);
    }

    #[test]
    fn point_to_the_right_is_90_degrees() {
        let frame = ListenerFrame::new([0.0; 3], DEFAULT_ORIENTATION);
        let (azimuth, elevation) = frame.angles_to(DVec3::new(1.0, 0.0, 0.0));
        assert!((azimuth - 90.0).abs() < 1e-9);
        assert!(elevation.abs() < 1e-9);
    }

    #[test]
    fn point_behind_is_180_degrees() {
        let frame = ListenerFrame::new([0.0; 3], DEFAULT_ORIENTATION);
        let (azimuth, _) = frame.angles_to(DVec3::new(0.0, -1.0, 0.0));
        assert!((azimuth - 180.0).abs() < 1e-9);
    }

    #[test]
    fn point_above_is_positive_elevation() {
        let frame = ListenerFrame::new([0.0; 3], DEFAULT_ORIENTATION);
        let (_, elevation) = frame.angles_to(DVec3::new(0.0, 0.0, 1.0));
        assert!((elevation - 90.0).abs() < 1e-9);
    }

    #[test]
    fn degenerate_orientation_falls_back() {
        let frame = ListenerFrame::new([0.0; 3], [0.0; 6]);
        assert_eq!(frame.at, DVec3::Y);
    }

    #[test]
    fn smoothstep_endpoints() {
        assert_eq!(smoothstep(-1.0), 0.0);
        assert_eq!(smoothstep(2.0), 1.0);
        assert!((smoothstep(0.5) - 0.5).abs() < 1e-12);
    }
}
