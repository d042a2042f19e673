//! Sources: consume generators, filter, spatialize, and feed the master
//! bus and effect sends.

mod direct;
mod panned;
mod source3d;

pub use direct::DirectSource;
pub use panned::PannedSource;
pub use source3d::Source3D;

use crate::config::{BLOCK_SIZE, MAX_CHANNELS, OUTPUT_CHANNELS};
use crate::context::{Context, EffectExec};
use crate::fade::FadeDriver;
use crate::filter_design::{BiquadConfig, IirFilterState};
use crate::generators::GeneratorExec;
use crate::properties::{BiquadCell, DoubleCell, Property, PropertyValue};
use std::sync::{Arc, Mutex, Weak};

/// One effect send: a routed effect plus the send gain.
pub(crate) struct EffectRoute {
    pub effect: Weak<dyn EffectExec>,
    pub gain: f32,
}

/// DSP state common to every source type. `channels` is the width of the
/// staging path: 2 for direct sources, 1 for sources that pan.
pub(crate) struct SourceDsp {
    pub gain_fade: FadeDriver,
    filter: IirFilterState,
    filter_direct: IirFilterState,
    filter_input: IirFilterState,
    /// Effect sends run post-pan, so this one is always stereo.
    filter_effects: IirFilterState,
    staging: Vec<f32>,
    gen_scratch: Vec<f32>,
}

/// Everything shared by the three source types: the generator set, the
/// filter chain, the gain envelope, and the effect routes.
pub(crate) struct SourceBase {
    pub context: Arc<Context>,
    channels: usize,
    generators: Mutex<Vec<Arc<dyn GeneratorExec>>>,
    routes: Mutex<Vec<Option<EffectRoute>>>,

    pub gain: DoubleCell,
    pub filter: BiquadCell,
    pub filter_direct: BiquadCell,
    pub filter_effects: BiquadCell,
    pub filter_input: BiquadCell,

    pub dsp: Mutex<SourceDsp>,
}

impl SourceBase {
    pub fn new(context: Arc<Context>, channels: usize) -> Self {
        let identity = BiquadConfig::identity();
        Self {
            context,
            channels,
            generators: Mutex::new(Vec::new()),
            routes: Mutex::new(Vec::new()),
            gain: DoubleCell::new(1.0),
            filter: BiquadCell::new(identity),
            filter_direct: BiquadCell::new(identity),
            filter_effects: BiquadCell::new(identity),
            filter_input: BiquadCell::new(identity),
            dsp: Mutex::new(SourceDsp {
                gain_fade: FadeDriver::new(1.0),
                filter: IirFilterState::new(&identity.to_def(), channels),
                filter_direct: IirFilterState::new(&identity.to_def(), channels),
                filter_input: IirFilterState::new(&identity.to_def(), channels),
                filter_effects: IirFilterState::new(&identity.to_def(), OUTPUT_CHANNELS),
                staging: vec![0.0; BLOCK_SIZE * channels],
                gen_scratch: vec![0.0; BLOCK_SIZE * MAX_CHANNELS],
            }),
        }
    }

    /* -------------------------------------------------------------- *
     * Generator membership (audio thread, via invokables)
     * -------------------------------------------------------------- */

    pub fn add_generator(&self, generator: Arc<dyn GeneratorExec>) {
        let mut generators = self.generators.lock().unwrap();
        if !generators.iter().any(|g| Arc::ptr_eq(g, &generator)) {
            generators.push(generator);
        }
    }

    pub fn remove_generator(&self, generator: &Arc<dyn GeneratorExec>) {
        self.generators
            .lock()
            .unwrap()
            .retain(|g| !Arc::ptr_eq(g, generator));
    }

    /// Install, replace, or clear the route in `slot`.
    pub fn set_route(&self, slot: usize, route: Option<EffectRoute>) {
        let mut routes = self.routes.lock().unwrap();
        if routes.len() <= slot {
            routes.resize_with(slot + 1, || None);
        }
        routes[slot] = route;
    }

    /* -------------------------------------------------------------- *
     * Block processing helpers
     * -------------------------------------------------------------- */

    /// Refresh filter runtime state from any property writes.
    pub fn sync_filters(&self, dsp: &mut SourceDsp) {
        if let Some(config) = self.filter.acquire() {
            dsp.filter.set_def(&config.to_def());
        }
        if let Some(config) = self.filter_direct.acquire() {
            dsp.filter_direct.set_def(&config.to_def());
        }
        if let Some(config) = self.filter_input.acquire() {
            dsp.filter_input.set_def(&config.to_def());
        }
        if let Some(config) = self.filter_effects.acquire() {
            dsp.filter_effects.set_def(&config.to_def());
        }
    }

    /// Sum every attached generator into the staging buffer, remixing each
    /// one's channel count into the source's: mono broadcasts, wider
    /// layouts fold down by averaging.
    pub fn mix_generators(&self, block: u64, dsp: &mut SourceDsp) {
        dsp.staging.fill(0.0);
        let generators = self.generators.lock().unwrap();
        for generator in generators.iter() {
            if generator.header().is_permanently_dead() {
                continue;
            }
            let gen_channels = generator.channels().clamp(1, MAX_CHANNELS);
            let scratch = &mut dsp.gen_scratch[..BLOCK_SIZE * gen_channels];
            scratch.fill(0.0);
            generator.generate_block(block, scratch);
            remix_into(scratch, gen_channels, &mut dsp.staging, self.channels);
        }
    }

    /// Run input filter then the generic filter over the staging buffer.
    pub fn apply_front_filters(&self, dsp: &mut SourceDsp) {
        let SourceDsp {
            filter,
            filter_input,
            staging,
            ..
        } = dsp;
        filter_input.process_block(staging);
        filter.process_block(staging);
    }

    /// Feed a finished stereo block through the effects filter and into
    /// every routed send.
    pub fn feed_effect_sends(&self, stereo: &[f32; BLOCK_SIZE * OUTPUT_CHANNELS], dsp: &mut SourceDsp) {
        let routes = self.routes.lock().unwrap();
        if routes.iter().all(|r| r.is_none()) {
            return;
        }
        let mut filtered = *stereo;
        dsp.filter_effects.process_block(&mut filtered);
        for route in routes.iter().flatten() {
            let Some(effect) = route.effect.upgrade() else {
                continue;
            };
            if effect.header().is_permanently_dead() {
                continue;
            }
            if route.gain == 1.0 {
                effect.accumulate_input(&filtered);
            } else {
                let mut scaled = filtered;
                for sample in &mut scaled {
                    *sample *= route.gain;
                }
                effect.accumulate_input(&scaled);
            }
        }
    }

    /* -------------------------------------------------------------- *
     * Shared property plumbing
     * -------------------------------------------------------------- */

    pub fn set_common_property(&self, property: Property, value: &PropertyValue) -> bool {
        match (property, value) {
            (Property::Gain, PropertyValue::Double(v)) => self.gain.set(*v),
            (Property::Filter, PropertyValue::Biquad(v)) => self.filter.set(*v),
            (Property::FilterDirect, PropertyValue::Biquad(v)) => self.filter_direct.set(*v),
            (Property::FilterEffects, PropertyValue::Biquad(v)) => self.filter_effects.set(*v),
            (Property::FilterInput, PropertyValue::Biquad(v)) => self.filter_input.set(*v),
            _ => return false,
        }
        true
    }

    pub fn get_common_property(&self, property: Property) -> Option<PropertyValue> {
        Some(match property {
            Property::Gain => PropertyValue::Double(self.gain.get()),
            Property::Filter => PropertyValue::Biquad(self.filter.get()),
            Property::FilterDirect => PropertyValue::Biquad(self.filter_direct.get()),
            Property::FilterEffects => PropertyValue::Biquad(self.filter_effects.get()),
            Property::FilterInput => PropertyValue::Biquad(self.filter_input.get()),
            _ => return None,
        })
    }
}

/// Add `input` (interleaved, `in_channels` wide) into `out` (interleaved,
/// `out_channels` wide), adapting the layout. Mono broadcasts to every
/// output channel; wider-than-output layouts fold down by averaging the
/// channels that land on each output slot.
pub(crate) fn remix_into(input: &[f32], in_channels: usize, out: &mut [f32], out_channels: usize) {
    if in_channels == out_channels {
        for (o, i) in out.iter_mut().zip(input.iter()) {
            *o += *i;
        }
        return;
    }

    if in_channels == 1 {
        for frame in 0..BLOCK_SIZE {
            let sample = input[frame];
            for ch in 0..out_channels {
                out[frame * out_channels + ch] += sample;
            }
        }
        return;
    }

    // Fold down: input channel c contributes to output slot c % out, scaled
    // so a frame of equal samples keeps its level.
    let per_slot = (in_channels as f32 / out_channels as f32).ceil();
    let scale = 1.0 / per_slot;
    for frame in 0..BLOCK_SIZE {
        for ch in 0..in_channels {
            let slot = ch % out_channels;
            out[frame * out_channels + slot] += input[frame * in_channels + ch] * scale;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn remix_identity_adds() {
        let input = vec![0.5f32; BLOCK_SIZE * 2];
        let mut out = vec![0.25f32; BLOCK_SIZE * 2];
        remix_into(&input, 2, &mut out, 2);
        assert!((out[0] - 0.75).abs() < 1e-6);
    }

    #[test]
    fn remix_broadcasts_mono() {
        let input = vec![0.5f32; BLOCK_SIZE];
        let mut out = vec![0.0f32; BLOCK_SIZE * 2];
        remix_into(&input, 1, &mut out, 2);
        assert_eq!(out[0], 0.5);
        assert_eq!(out[1], 0.5);
    }

    #[test]
    fn remix_folds_stereo_to_mono() {
        let mut input = vec![0.0f32; BLOCK_SIZE * 2];
        for frame in 0..BLOCK_SIZE {
            input[frame * 2] = 0.4;
            input[frame * 2 + 1] = 0.8;
        }
        let mut out = vec![0.0f32; BLOCK_SIZE];
        remix_into(&input, 2, &mut out, 1);
        // Both channels averaged into the single slot.
        assert!((out[0] - 0.6).abs() < 1e-6);
    }
}
