//! Noise generation.
//!
//! Three algorithms: uniform white noise, Voss-McCartney 1/f approximation
//! (a bank of octave-spaced random holds), and brown noise built from an
//! integrator tamed by the filter kit's DC blocker. Channels are fully
//! decorrelated and the count is fixed at construction.

use crate::config::BLOCK_SIZE;
use crate::context::Context;
use crate::error::Result;
use crate::fade::FadeDriver;
use crate::filter_design::{design_dc_blocker, IirFilterState};
use crate::generators::GeneratorExec;
use crate::object::{BaseObject, ObjectHeader, ObjectType};
use crate::properties::{DoubleCell, IntCell, Property, PropertyValue};
use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};
use std::any::Any;
use std::sync::{Arc, Mutex};

/// Noise algorithm selector. Discriminants are stable and part of the
/// external surface.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(i32)]
pub enum NoiseType {
    #[default]
    Uniform = 0,
    /// Voss-McCartney 1/f.
    Vm = 1,
    FilteredBrown = 2,
}

impl NoiseType {
    pub fn from_i64(value: i64) -> Self {
        match value {
            1 => NoiseType::Vm,
            2 => NoiseType::FilteredBrown,
            _ => NoiseType::Uniform,
        }
    }
}

const VM_OCTAVES: usize = 12;

/// Per-channel Voss-McCartney state: one random hold per octave plus a
/// running counter whose trailing zeros pick the hold to refresh.
struct VmState {
    octaves: [f32; VM_OCTAVES],
    counter: u32,
}

impl VmState {
    fn new(rng: &mut SmallRng) -> Self {
        let mut octaves = [0.0f32; VM_OCTAVES];
        for o in &mut octaves {
            *o = rng.gen_range(-1.0..1.0);
        }
        Self { octaves, counter: 0 }
    }

    fn next(&mut self, rng: &mut SmallRng) -> f32 {
        self.counter = self.counter.wrapping_add(1);
        let index = (self.counter.trailing_zeros() as usize) % VM_OCTAVES;
        self.octaves[index] = rng.gen_range(-1.0..1.0);
        let sum: f32 = self.octaves.iter().sum::<f32>() + rng.gen_range(-1.0..1.0);
        sum / (VM_OCTAVES + 1) as f32
    }
}

/// Per-channel brown state: leaky integrator followed by a DC blocker.
struct BrownState {
    integrator: f32,
    dc_blocker: IirFilterState,
}

impl BrownState {
    fn new() -> Self {
        Self {
            integrator: 0.0,
            dc_blocker: IirFilterState::new(&design_dc_blocker(0.995), 1),
        }
    }

    fn next(&mut self, white: f32) -> f32 {
        // The leak keeps the walk bounded; the DC blocker removes what
        // drift remains.
        self.integrator = self.integrator * 0.995 + white * 0.1;
        let mut sample = [self.integrator];
        self.dc_blocker.process_block(&mut sample);
        sample[0]
    }
}

struct ChannelState {
    rng: SmallRng,
    vm: VmState,
    brown: BrownState,
}

struct NoiseDsp {
    channels: Vec<ChannelState>,
    gain_fade: FadeDriver,
}

pub struct NoiseGenerator {
    header: ObjectHeader,
    context: Arc<Context>,
    channel_count: usize,

    noise_type: IntCell,
    gain: DoubleCell,

    dsp: Mutex<NoiseDsp>,
}

impl NoiseGenerator {
    pub fn new(context: Arc<Context>, channels: usize) -> Arc<Self> {
        let channels = channels.clamp(1, crate::config::MAX_CHANNELS);
        let channel_states = (0..channels)
            .map(|_| {
                let mut rng = SmallRng::from_entropy();
                let vm = VmState::new(&mut rng);
                ChannelState {
                    rng,
                    vm,
                    brown: BrownState::new(),
                }
            })
            .collect();
        Arc::new(Self {
            header: ObjectHeader::new(),
            context,
            channel_count: channels,
            noise_type: IntCell::new(NoiseType::default() as i64),
            gain: DoubleCell::new(1.0),
            dsp: Mutex::new(NoiseDsp {
                channels: channel_states,
                gain_fade: FadeDriver::new(1.0),
            }),
        })
    }
}

impl GeneratorExec for NoiseGenerator {
    fn channels(&self) -> usize {
        self.channel_count
    }

    fn generate_block(&self, block: u64, out: &mut [f32]) {
        let mut dsp = self.dsp.lock().unwrap();
        if let Some(gain) = self.gain.acquire() {
            dsp.gain_fade.set_target(block, gain as f32);
        }
        let algorithm = NoiseType::from_i64(self.noise_type.get());
        let channel_count = self.channel_count;

        let gain_fade = dsp.gain_fade;
        let channels = &mut dsp.channels;
        gain_fade.drive(block, BLOCK_SIZE, |frame, gain| {
            for (ch, state) in channels.iter_mut().enumerate() {
                let sample = match algorithm {
                    NoiseType::Uniform => state.rng.gen_range(-1.0..1.0),
                    NoiseType::Vm => state.vm.next(&mut state.rng),
                    NoiseType::FilteredBrown => {
                        let white = state.rng.gen_range(-1.0..1.0);
                        state.brown.next(white)
                    }
                };
                out[frame * channel_count + ch] += gain * sample;
            }
        });
    }
}

impl BaseObject for NoiseGenerator {
    fn header(&self) -> &ObjectHeader {
        &self.header
    }

    fn object_type(&self) -> ObjectType {
        ObjectType::NoiseGenerator
    }

    fn set_property(&self, property: Property, value: PropertyValue) -> Result<()> {
        match (property, value) {
            (Property::Gain, PropertyValue::Double(v)) => self.gain.set(v),
            (Property::NoiseType, PropertyValue::Int(v)) => self.noise_type.set(v),
            (property, _) => {
                return Err(crate::object::unknown_property(self.object_type(), property))
            }
        }
        Ok(())
    }

    fn get_property(&self, property: Property) -> Result<PropertyValue> {
        Ok(match property {
            Property::Gain => PropertyValue::Double(self.gain.get()),
            Property::NoiseType => PropertyValue::Int(self.noise_type.get()),
            property => {
                return Err(crate::object::unknown_property(self.object_type(), property))
            }
        })
    }

    fn owning_context(&self) -> Option<Arc<Context>> {
        Some(self.context.clone())
    }

    fn as_any_arc(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::CollectSink;

    fn noise(channels: usize) -> (Arc<Context>, Arc<NoiseGenerator>) {
        let context = Context::new(Box::new(CollectSink::with_limit(1024))).unwrap();
        let generator = NoiseGenerator::new(context.clone(), channels);
        (context, generator)
    }

    fn rms(samples: &[f32]) -> f32 {
        (samples.iter().map(|s| s * s).sum::<f32>() / samples.len() as f32).sqrt()
    }

    #[test]
    fn uniform_noise_is_bounded_and_nonzero() {
        let (context, generator) = noise(2);
        let mut out = vec![0.0f32; BLOCK_SIZE * 2];
        for b in 1..8 {
            out.fill(0.0);
            generator.generate_block(b, &mut out);
        }
        assert!(out.iter().all(|s| s.abs() <= 1.0));
        assert!(rms(&out) > 0.1);
        context.shutdown();
    }

    #[test]
    fn all_algorithms_produce_output() {
        let (context, generator) = noise(1);
        for algorithm in [NoiseType::Uniform, NoiseType::Vm, NoiseType::FilteredBrown] {
            generator
                .set_property(Property::NoiseType, PropertyValue::Int(algorithm as i64))
                .unwrap();
            let mut out = vec![0.0f32; BLOCK_SIZE];
            // Let filters settle.
            for b in 1..16 {
                out.fill(0.0);
                generator.generate_block(b, &mut out);
            }
            assert!(rms(&out) > 1e-4, "{algorithm:?} was silent");
        }
        context.shutdown();
    }

    #[test]
    fn brown_noise_has_less_high_frequency_energy_than_white() {
        let (context, generator) = noise(1);
        let collect = |gen: &Arc<NoiseGenerator>, blocks: std::ops::Range<u64>| {
            let mut all = Vec::new();
            let mut out = vec![0.0f32; BLOCK_SIZE];
            for b in blocks {
                out.fill(0.0);
                gen.generate_block(b, &mut out);
                all.extend_from_slice(&out);
            }
            all
        };
        let white = collect(&generator, 1..32);
        generator
            .set_property(
                Property::NoiseType,
                PropertyValue::Int(NoiseType::FilteredBrown as i64),
            )
            .unwrap();
        let brown = collect(&generator, 32..64);

        // Ratio of first-difference energy to signal energy is a crude
        // high-frequency measure.
        let hf_ratio = |s: &[f32]| {
            let diff: f32 = s.windows(2).map(|w| (w[1] - w[0]).powi(2)).sum();
            let total: f32 = s.iter().map(|v| v * v).sum();
            diff / total.max(1e-12)
        };
        assert!(hf_ratio(&brown) < hf_ratio(&white) * 0.5);
        context.shutdown();
    }

    #[test]
    fn channel_count_is_clamped_and_fixed() {
        let (context, generator) = noise(500);
        assert_eq!(generator.channels(), crate::config::MAX_CHANNELS);
        context.shutdown();
    }
}
