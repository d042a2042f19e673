//! IIR filter design kit.
//!
//! Pure functions producing coefficient sets for the runtime filters used by
//! sources and effects. Conventions shared by the whole kit:
//!
//! - Denominators are normalized so the leading coefficient is 1, and that
//!   leading 1 is *stripped* from storage; `den_coefs` starts at a1.
//! - Any multiplicative gain needed to restore the intended response is
//!   carried in the separate `gain` field, never baked into `num_coefs`.
//! - Biquads take `omega = frequency / sample_rate`, which must lie in the
//!   open interval (0, 0.5). Out-of-range values are clamped inward; the kit
//!   never fails.
//!
//! The biquad formulas are the Audio-EQ-cookbook forms (RBJ); the windowed
//! sinc uses a Blackman-Harris window with its DC gain normalized to 1.

use std::f64::consts::PI;

/// Butterworth Q, the default for lowpass/highpass/allpass.
pub const DEFAULT_Q: f64 = 0.7071135624381276;

const OMEGA_MIN: f64 = 1e-5;
const OMEGA_MAX: f64 = 0.5 - 1e-5;

/// Coefficients for an IIR filter of arbitrary order.
///
/// `den_coefs` omits the implicit leading 1.
#[derive(Debug, Clone, PartialEq)]
pub struct IirFilterDef {
    pub num_coefs: Vec<f64>,
    pub den_coefs: Vec<f64>,
    pub gain: f64,
}

impl IirFilterDef {
    /// The identity filter: passes input through unchanged.
    pub fn identity() -> Self {
        Self {
            num_coefs: vec![1.0],
            den_coefs: vec![],
            gain: 1.0,
        }
    }

    /// Evaluate the transfer function at `z = e^(j * 2π * omega)`,
    /// returning `(re, im)`.
    pub fn response_at(&self, omega: f64) -> (f64, f64) {
        let w = 2.0 * PI * omega;
        let eval = |coefs: &[f64], leading: Option<f64>| -> (f64, f64) {
            let mut re = 0.0;
            let mut im = 0.0;
            let offset = usize::from(leading.is_some());
            if let Some(l) = leading {
                re += l;
            }
            for (i, &c) in coefs.iter().enumerate() {
                let phase = w * (i + offset) as f64;
                re += c * phase.cos();
                im -= c * phase.sin();
            }
            (re, im)
        };

        let (nr, ni) = eval(&self.num_coefs, None);
        let (dr, di) = eval(&self.den_coefs, Some(1.0));
        let denom = dr * dr + di * di;
        (
            self.gain * (nr * dr + ni * di) / denom,
            self.gain * (ni * dr - nr * di) / denom,
        )
    }

    /// Magnitude of the response at `omega`.
    pub fn magnitude_at(&self, omega: f64) -> f64 {
        let (re, im) = self.response_at(omega);
        (re * re + im * im).sqrt()
    }
}

fn clamp_omega(omega: f64) -> f64 {
    omega.clamp(OMEGA_MIN, OMEGA_MAX)
}

/// A single-zero filter with the zero on the real axis.
pub fn design_one_zero(zero: f64) -> IirFilterDef {
    IirFilterDef {
        num_coefs: vec![1.0, -zero],
        den_coefs: vec![],
        gain: 1.0 / (1.0 + zero.abs()),
    }
}

/// A single-pole filter with the pole on the real axis.
pub fn design_one_pole(pole: f64) -> IirFilterDef {
    IirFilterDef {
        num_coefs: vec![1.0],
        den_coefs: vec![-pole],
        gain: 1.0 - pole.abs(),
    }
}

/// A DC blocker: zero at DC, pole just inside the unit circle.
pub fn design_dc_blocker(r: f64) -> IirFilterDef {
    IirFilterDef {
        num_coefs: vec![1.0, -1.0],
        den_coefs: vec![-r],
        // Unity gain at Nyquist.
        gain: (1.0 + r) / 2.0,
    }
}

/// Shared scaffolding for the cookbook biquads: normalize by a0 and strip it.
fn biquad(b: [f64; 3], a: [f64; 3]) -> IirFilterDef {
    let a0 = a[0];
    IirFilterDef {
        num_coefs: vec![b[0] / a0, b[1] / a0, b[2] / a0],
        den_coefs: vec![a[1] / a0, a[2] / a0],
        gain: 1.0,
    }
}

struct BiquadTrig {
    cos_w0: f64,
    sin_w0: f64,
}

fn biquad_trig(omega: f64) -> BiquadTrig {
    let w0 = 2.0 * PI * clamp_omega(omega);
    BiquadTrig {
        cos_w0: w0.cos(),
        sin_w0: w0.sin(),
    }
}

pub fn design_audio_eq_lowpass(omega: f64, q: f64) -> IirFilterDef {
    let t = biquad_trig(omega);
    let alpha = t.sin_w0 / (2.0 * q);
    biquad(
        [
            (1.0 - t.cos_w0) / 2.0,
            1.0 - t.cos_w0,
            (1.0 - t.cos_w0) / 2.0,
        ],
        [1.0 + alpha, -2.0 * t.cos_w0, 1.0 - alpha],
    )
}

pub fn design_audio_eq_highpass(omega: f64, q: f64) -> IirFilterDef {
    let t = biquad_trig(omega);
    let alpha = t.sin_w0 / (2.0 * q);
    biquad(
        [
            (1.0 + t.cos_w0) / 2.0,
            -(1.0 + t.cos_w0),
            (1.0 + t.cos_w0) / 2.0,
        ],
        [1.0 + alpha, -2.0 * t.cos_w0, 1.0 - alpha],
    )
}

/// Bandpass, 0 dB peak gain variant.
pub fn design_audio_eq_bandpass(omega: f64, bw: f64) -> IirFilterDef {
    let t = biquad_trig(omega);
    let w0 = 2.0 * PI * clamp_omega(omega);
    let alpha = t.sin_w0 * ((2.0f64).ln() / 2.0 * bw * w0 / t.sin_w0).sinh();
    biquad(
        [alpha, 0.0, -alpha],
        [1.0 + alpha, -2.0 * t.cos_w0, 1.0 - alpha],
    )
}

/// Band reject, in audio EQ terminology.
pub fn design_audio_eq_notch(omega: f64, bw: f64) -> IirFilterDef {
    let t = biquad_trig(omega);
    let w0 = 2.0 * PI * clamp_omega(omega);
    let alpha = t.sin_w0 * ((2.0f64).ln() / 2.0 * bw * w0 / t.sin_w0).sinh();
    biquad(
        [1.0, -2.0 * t.cos_w0, 1.0],
        [1.0 + alpha, -2.0 * t.cos_w0, 1.0 - alpha],
    )
}

pub fn design_audio_eq_allpass(omega: f64, q: f64) -> IirFilterDef {
    let t = biquad_trig(omega);
    let alpha = t.sin_w0 / (2.0 * q);
    biquad(
        [1.0 - alpha, -2.0 * t.cos_w0, 1.0 + alpha],
        [1.0 + alpha, -2.0 * t.cos_w0, 1.0 - alpha],
    )
}

pub fn design_audio_eq_peaking(omega: f64, bw: f64, dbgain: f64) -> IirFilterDef {
    let t = biquad_trig(omega);
    let w0 = 2.0 * PI * clamp_omega(omega);
    let a = 10.0_f64.powf(dbgain / 40.0);
    let alpha = t.sin_w0 * ((2.0f64).ln() / 2.0 * bw * w0 / t.sin_w0).sinh();
    biquad(
        [1.0 + alpha * a, -2.0 * t.cos_w0, 1.0 - alpha * a],
        [1.0 + alpha / a, -2.0 * t.cos_w0, 1.0 - alpha / a],
    )
}

pub fn design_audio_eq_lowshelf(omega: f64, db_gain: f64, slope: f64) -> IirFilterDef {
    let t = biquad_trig(omega);
    let a = 10.0_f64.powf(db_gain / 40.0);
    let alpha = t.sin_w0 / 2.0 * ((a + 1.0 / a) * (1.0 / slope - 1.0) + 2.0).sqrt();
    let two_sqrt_a_alpha = 2.0 * a.sqrt() * alpha;
    biquad(
        [
            a * ((a + 1.0) - (a - 1.0) * t.cos_w0 + two_sqrt_a_alpha),
            2.0 * a * ((a - 1.0) - (a + 1.0) * t.cos_w0),
            a * ((a + 1.0) - (a - 1.0) * t.cos_w0 - two_sqrt_a_alpha),
        ],
        [
            (a + 1.0) + (a - 1.0) * t.cos_w0 + two_sqrt_a_alpha,
            -2.0 * ((a - 1.0) + (a + 1.0) * t.cos_w0),
            (a + 1.0) + (a - 1.0) * t.cos_w0 - two_sqrt_a_alpha,
        ],
    )
}

pub fn design_audio_eq_highshelf(omega: f64, db_gain: f64, slope: f64) -> IirFilterDef {
    let t = biquad_trig(omega);
    let a = 10.0_f64.powf(db_gain / 40.0);
    let alpha = t.sin_w0 / 2.0 * ((a + 1.0 / a) * (1.0 / slope - 1.0) + 2.0).sqrt();
    let two_sqrt_a_alpha = 2.0 * a.sqrt() * alpha;
    biquad(
        [
            a * ((a + 1.0) + (a - 1.0) * t.cos_w0 + two_sqrt_a_alpha),
            -2.0 * a * ((a - 1.0) + (a + 1.0) * t.cos_w0),
            a * ((a + 1.0) + (a - 1.0) * t.cos_w0 - two_sqrt_a_alpha),
        ],
        [
            (a + 1.0) - (a - 1.0) * t.cos_w0 + two_sqrt_a_alpha,
            2.0 * ((a - 1.0) - (a + 1.0) * t.cos_w0),
            (a + 1.0) - (a - 1.0) * t.cos_w0 - two_sqrt_a_alpha,
        ],
    )
}

/// A Blackman-Harris-windowed sinc lowpass. `n` must be odd; the center tap
/// is forced to 1 and DC gain is normalized to 1, with a small constant in
/// the normalization denominator so tiny filters cannot divide by zero.
pub fn design_sinc_lowpass(n: usize, omega: f64) -> IirFilterDef {
    assert!(n % 2 == 1, "windowed sinc length must be odd");
    let omega = clamp_omega(omega);
    let center = (n - 1) as f64 / 2.0;
    let mut coefs = vec![0.0; n];

    for (i, c) in coefs.iter_mut().enumerate() {
        let x = PI * (i as f64 - center) * omega * 2.0;
        let y = i as f64 / (n - 1) as f64 * 2.0 * PI;
        let window =
            0.35875 - 0.48829 * y.cos() + 0.14128 * (2.0 * y).cos() - 0.01168 * (3.0 * y).cos();
        *c = if i as f64 == center {
            1.0
        } else {
            x.sin() / x * window
        };
    }

    let dc: f64 = coefs.iter().sum();
    IirFilterDef {
        num_coefs: coefs,
        den_coefs: vec![],
        gain: 1.0 / (dc + 0.01),
    }
}

/// Combine two filters into one whose response is their product: numerators
/// and denominators are convolved (with the implicit leading denominator 1s
/// restored for the convolution and stripped again for storage), gains
/// multiply.
pub fn combine(f1: &IirFilterDef, f2: &IirFilterDef) -> IirFilterDef {
    let num_len = f1.num_coefs.len() + f2.num_coefs.len() - 1;
    let mut num = vec![0.0; num_len];
    for (i, &a) in f1.num_coefs.iter().enumerate() {
        for (j, &b) in f2.num_coefs.iter().enumerate() {
            num[i + j] += a * b;
        }
    }

    let den1_len = f1.den_coefs.len() + 1;
    let den2_len = f2.den_coefs.len() + 1;
    let mut den = vec![0.0; den1_len + den2_len - 1];
    for i in 0..den1_len {
        let a = if i == 0 { 1.0 } else { f1.den_coefs[i - 1] };
        for j in 0..den2_len {
            let b = if j == 0 { 1.0 } else { f2.den_coefs[j - 1] };
            den[i + j] += a * b;
        }
    }

    IirFilterDef {
        num_coefs: num,
        den_coefs: den[1..].to_vec(),
        gain: f1.gain * f2.gain,
    }
}

/// Fixed-size biquad coefficients, the property-value form of a filter.
///
/// `a1`/`a2` follow the stripped-leading-1 convention of the design kit.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BiquadConfig {
    pub b0: f64,
    pub b1: f64,
    pub b2: f64,
    pub a1: f64,
    pub a2: f64,
    pub gain: f64,
}

impl BiquadConfig {
    pub fn identity() -> Self {
        Self {
            b0: 1.0,
            b1: 0.0,
            b2: 0.0,
            a1: 0.0,
            a2: 0.0,
            gain: 1.0,
        }
    }

    pub fn is_identity(&self) -> bool {
        *self == Self::identity()
    }

    /// Capture a designed filter of order <= 2 into the fixed form.
    pub fn from_def(def: &IirFilterDef) -> Option<Self> {
        if def.num_coefs.len() > 3 || def.den_coefs.len() > 2 {
            return None;
        }
        let b = |i: usize| def.num_coefs.get(i).copied().unwrap_or(0.0);
        let a = |i: usize| def.den_coefs.get(i).copied().unwrap_or(0.0);
        Some(Self {
            b0: b(0),
            b1: b(1),
            b2: b(2),
            a1: a(0),
            a2: a(1),
            gain: def.gain,
        })
    }

    pub fn to_def(self) -> IirFilterDef {
        IirFilterDef {
            num_coefs: vec![self.b0, self.b1, self.b2],
            den_coefs: vec![self.a1, self.a2],
            gain: self.gain,
        }
    }
}

impl Default for BiquadConfig {
    fn default() -> Self {
        Self::identity()
    }
}

/// Runtime state for a designed filter: direct form II transposed with
/// per-channel state and f64 accumulators.
#[derive(Debug, Clone)]
pub struct IirFilterState {
    /// Numerator with the def's gain folded in.
    num: Vec<f64>,
    /// Denominator without the leading 1.
    den: Vec<f64>,
    /// One delay line per channel, `order - 1` entries each.
    state: Vec<Vec<f64>>,
}

impl IirFilterState {
    pub fn new(def: &IirFilterDef, channels: usize) -> Self {
        let order = def.num_coefs.len().max(def.den_coefs.len() + 1);
        let mut num: Vec<f64> = def.num_coefs.iter().map(|c| c * def.gain).collect();
        num.resize(order, 0.0);
        let mut den = def.den_coefs.clone();
        den.resize(order - 1, 0.0);
        Self {
            num,
            den,
            state: vec![vec![0.0; order.saturating_sub(1)]; channels],
        }
    }

    pub fn channels(&self) -> usize {
        self.state.len()
    }

    /// Replace the coefficients, keeping state so a parameter sweep does not
    /// click. The new def must have the same order or smaller.
    pub fn set_def(&mut self, def: &IirFilterDef) {
        let order = self.num.len();
        let mut num: Vec<f64> = def.num_coefs.iter().map(|c| c * def.gain).collect();
        num.resize(order, 0.0);
        let mut den = def.den_coefs.clone();
        den.resize(order - 1, 0.0);
        self.num = num;
        self.den = den;
    }

    pub fn reset(&mut self) {
        for line in &mut self.state {
            line.fill(0.0);
        }
    }

    /// Filter an interleaved block in place.
    pub fn process_block(&mut self, block: &mut [f32]) {
        let channels = self.state.len();
        if channels == 0 {
            return;
        }
        let taps = self.state[0].len();
        for frame in block.chunks_exact_mut(channels) {
            for (ch, sample) in frame.iter_mut().enumerate() {
                let x = *sample as f64;
                let line = &mut self.state[ch];
                let y = self.num[0] * x + line.first().copied().unwrap_or(0.0);
                for k in 0..taps {
                    let next = if k + 1 < taps { line[k + 1] } else { 0.0 };
                    line[k] = self.num[k + 1] * x - self.den[k] * y + next;
                }
                *sample = flush_denormal(y as f32);
            }
        }
    }
}

/// Zero out denormal-range values so feedback paths never hit the slow path.
#[inline]
pub fn flush_denormal(x: f32) -> f32 {
    if x.abs() < 1e-30 {
        0.0
    } else {
        x
    }
}
