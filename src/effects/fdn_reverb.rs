//! A feedback-delay-network reverb.
//!
//! The parameter surface (mean free path, t60, shelved late-reflection
//! rolloffs, diffusion, delay-line modulation, pre-delay, input lowpass) is
//! fixed; the interior is a 4-line FDN with a Hadamard feedback matrix,
//! per-line decay gains derived from t60, per-line shelving from the
//! lf/hf rolloff pairs, and slow sinusoidal modulation of the read taps.

use crate::config::{BLOCK_SIZE, OUTPUT_CHANNELS, SR};
use crate::context::{Context, EffectExec};
use crate::effects::EffectBase;
use crate::error::Result;
use crate::fade::FadeDriver;
use crate::filter_design::{
    combine, design_audio_eq_highshelf, design_audio_eq_lowpass, design_audio_eq_lowshelf,
    IirFilterState, DEFAULT_Q,
};
use crate::object::{BaseObject, ObjectHeader, ObjectType};
use crate::properties::{DoubleCell, IntCell, Property, PropertyValue};
use std::any::Any;
use std::sync::{Arc, Mutex, Weak};

const LINES: usize = 4;
/// Relative spread of the four line lengths around the mean free path.
const LINE_RATIOS: [f64; LINES] = [0.82, 0.94, 1.07, 1.17];
/// Modulation phase offsets decorrelate the lines.
const LINE_PHASES: [f32; LINES] = [0.0, 1.57, 3.14, 4.71];

struct FdnDsp {
    lines: [Vec<f32>; LINES],
    write: [usize; LINES],
    line_gains: [f32; LINES],
    damping: [IirFilterState; LINES],
    predelay: Vec<f32>,
    predelay_write: usize,
    input_filter: IirFilterState,
    lfo_phase: f32,
    gain_fade: FadeDriver,
    /// Derived-state rebuild is needed (a structural parameter changed).
    stale: bool,
}

pub struct GlobalFdnReverb {
    header: ObjectHeader,
    base: EffectBase,

    input_filter_enabled: IntCell,
    input_filter_cutoff: DoubleCell,
    mean_free_path: DoubleCell,
    t60: DoubleCell,
    lf_rolloff: DoubleCell,
    lf_reference: DoubleCell,
    hf_rolloff: DoubleCell,
    hf_reference: DoubleCell,
    diffusion: DoubleCell,
    modulation_depth: DoubleCell,
    modulation_frequency: DoubleCell,
    late_reflections_delay: DoubleCell,

    dsp: Mutex<FdnDsp>,
}

impl GlobalFdnReverb {
    pub fn new(context: Weak<Context>) -> Arc<Self> {
        let identity = crate::filter_design::IirFilterDef::identity();
        Arc::new(Self {
            header: ObjectHeader::new(),
            base: EffectBase::new(context),
            input_filter_enabled: IntCell::new(1),
            input_filter_cutoff: DoubleCell::new(2000.0),
            mean_free_path: DoubleCell::new(0.1),
            t60: DoubleCell::new(1.0),
            lf_rolloff: DoubleCell::new(1.0),
            lf_reference: DoubleCell::new(200.0),
            hf_rolloff: DoubleCell::new(-0.5),
            hf_reference: DoubleCell::new(500.0),
            diffusion: DoubleCell::new(1.0),
            modulation_depth: DoubleCell::new(0.01),
            modulation_frequency: DoubleCell::new(0.25),
            late_reflections_delay: DoubleCell::new(0.01),
            dsp: Mutex::new(FdnDsp {
                lines: std::array::from_fn(|_| Vec::new()),
                write: [0; LINES],
                line_gains: [0.0; LINES],
                damping: std::array::from_fn(|_| IirFilterState::new(&identity, 1)),
                predelay: Vec::new(),
                predelay_write: 0,
                input_filter: IirFilterState::new(&identity, 1),
                lfo_phase: 0.0,
                gain_fade: FadeDriver::new(1.0),
                stale: true,
            }),
        })
    }

    /// Recompute everything derived from the structural parameters. Runs on
    /// the audio thread when a latched property changed.
    fn rebuild(&self, dsp: &mut FdnDsp) {
        let mean_free_path = self.mean_free_path.get().max(1e-3);
        let t60 = self.t60.get().max(1e-2);

        for i in 0..LINES {
            let delay_secs = mean_free_path * LINE_RATIOS[i];
            let frames = ((delay_secs * SR as f64) as usize).max(BLOCK_SIZE);
            if dsp.lines[i].len() != frames {
                dsp.lines[i] = vec![0.0; frames];
                dsp.write[i] = 0;
            }
            // Standard t60 relation: -60 dB after t60 seconds of feedback.
            dsp.line_gains[i] = 10.0f64.powf(-3.0 * delay_secs / t60) as f32;

            // Shelving in the feedback path shapes the decay spectrum.
            let lf = design_audio_eq_lowshelf(
                (self.lf_reference.get() / SR as f64).clamp(1e-4, 0.49),
                6.0 * (self.lf_rolloff.get() - 1.0),
                1.0,
            );
            let hf = design_audio_eq_highshelf(
                (self.hf_reference.get() / SR as f64).clamp(1e-4, 0.49),
                6.0 * self.hf_rolloff.get(),
                1.0,
            );
            dsp.damping[i] = IirFilterState::new(&combine(&lf, &hf), 1);
        }

        let predelay_frames =
            ((self.late_reflections_delay.get() * SR as f64) as usize).max(1);
        if dsp.predelay.len() != predelay_frames {
            dsp.predelay = vec![0.0; predelay_frames];
            dsp.predelay_write = 0;
        }

        let cutoff_omega = (self.input_filter_cutoff.get() / SR as f64).clamp(1e-4, 0.49);
        dsp.input_filter =
            IirFilterState::new(&design_audio_eq_lowpass(cutoff_omega, DEFAULT_Q), 1);

        dsp.stale = false;
        log::debug!(
            "fdn rebuilt: mfp {mean_free_path:.3}s t60 {t60:.2}s line gains {:?}",
            dsp.line_gains
        );
    }

    fn mark_stale_if_changed(&self, dsp: &mut FdnDsp) {
        let structural = [
            self.mean_free_path.acquire().is_some(),
            self.t60.acquire().is_some(),
            self.lf_rolloff.acquire().is_some(),
            self.lf_reference.acquire().is_some(),
            self.hf_rolloff.acquire().is_some(),
            self.hf_reference.acquire().is_some(),
            self.late_reflections_delay.acquire().is_some(),
            self.input_filter_cutoff.acquire().is_some(),
        ];
        if structural.into_iter().any(|changed| changed) {
            dsp.stale = true;
        }
    }
}

impl EffectExec for GlobalFdnReverb {
    fn accumulate_input(&self, block: &[f32]) {
        self.base.accumulate(block);
    }

    fn run_block(&self, block: u64, master: &mut [f32]) {
        let mut dsp = self.dsp.lock().unwrap();
        if let Some(gain) = self.base.gain.acquire() {
            dsp.gain_fade.set_target(block, gain as f32);
        }
        self.mark_stale_if_changed(&mut dsp);
        if dsp.stale {
            self.rebuild(&mut dsp);
        }

        let mut input = [0.0f32; BLOCK_SIZE * OUTPUT_CHANNELS];
        self.base.take_input(&mut input);

        // Mono-sum the send; the tail is re-stereoized by the line taps.
        let mut mono = [0.0f32; BLOCK_SIZE];
        for frame in 0..BLOCK_SIZE {
            mono[frame] = 0.5 * (input[frame * 2] + input[frame * 2 + 1]);
        }
        if self.input_filter_enabled.get() != 0 {
            dsp.input_filter.process_block(&mut mono);
        }

        let diffusion = self.diffusion.get() as f32;
        let mod_depth_frames =
            (self.modulation_depth.get() * 0.01 * SR as f64) as f32;
        let lfo_step =
            (2.0 * std::f32::consts::PI * self.modulation_frequency.get() as f32) / SR as f32;

        let FdnDsp {
            lines,
            write,
            line_gains,
            damping,
            predelay,
            predelay_write,
            lfo_phase,
            gain_fade,
            ..
        } = &mut *dsp;

        let mut wet = [0.0f32; BLOCK_SIZE * OUTPUT_CHANNELS];
        for frame in 0..BLOCK_SIZE {
            // Pre-delay the dry input.
            let delayed = predelay[*predelay_write];
            predelay[*predelay_write] = mono[frame];
            *predelay_write = (*predelay_write + 1) % predelay.len();

            // Read each line at its oldest sample (full line delay), with a
            // slow modulated offset shortening the delay for chorusing.
            let mut outs = [0.0f32; LINES];
            for i in 0..LINES {
                let len = lines[i].len();
                let modulation = mod_depth_frames * (*lfo_phase + LINE_PHASES[i]).sin();
                let read_pos = write[i] as f32 + modulation.abs();
                let base = read_pos.floor() as usize % len;
                let next = (base + 1) % len;
                let fraction = read_pos - read_pos.floor();
                outs[i] = lines[i][base] + (lines[i][next] - lines[i][base]) * fraction;
            }

            // Hadamard feedback, blended toward straight recirculation by
            // (1 - diffusion).
            let h = [
                0.5 * (outs[0] + outs[1] + outs[2] + outs[3]),
                0.5 * (outs[0] - outs[1] + outs[2] - outs[3]),
                0.5 * (outs[0] + outs[1] - outs[2] - outs[3]),
                0.5 * (outs[0] - outs[1] - outs[2] + outs[3]),
            ];
            for i in 0..LINES {
                let mixed = outs[i] + (h[i] - outs[i]) * diffusion;
                let mut fed = [mixed * line_gains[i]];
                damping[i].process_block(&mut fed);
                lines[i][write[i]] = delayed + fed[0];
                write[i] = (write[i] + 1) % lines[i].len();
            }
            *lfo_phase += lfo_step;
            if *lfo_phase > 2.0 * std::f32::consts::PI {
                *lfo_phase -= 2.0 * std::f32::consts::PI;
            }

            // Two decorrelated output mixes.
            wet[frame * 2] = 0.5 * (outs[0] + outs[2]);
            wet[frame * 2 + 1] = 0.5 * (outs[1] + outs[3]);
        }

        gain_fade.drive(block, BLOCK_SIZE, |frame, gain| {
            master[frame * 2] += wet[frame * 2] * gain;
            master[frame * 2 + 1] += wet[frame * 2 + 1] * gain;
        });
    }
}

impl BaseObject for GlobalFdnReverb {
    fn header(&self) -> &ObjectHeader {
        &self.header
    }

    fn object_type(&self) -> ObjectType {
        ObjectType::GlobalFdnReverb
    }

    fn set_property(&self, property: Property, value: PropertyValue) -> Result<()> {
        match (property, value) {
            (Property::Gain, PropertyValue::Double(v)) => self.base.gain.set(v),
            (Property::InputFilterEnabled, PropertyValue::Int(v)) => {
                self.input_filter_enabled.set(v)
            }
            (Property::InputFilterCutoff, PropertyValue::Double(v)) => {
                self.input_filter_cutoff.set(v)
            }
            (Property::MeanFreePath, PropertyValue::Double(v)) => self.mean_free_path.set(v),
            (Property::T60, PropertyValue::Double(v)) => self.t60.set(v),
            (Property::LateReflectionsLfRolloff, PropertyValue::Double(v)) => {
                self.lf_rolloff.set(v)
            }
            (Property::LateReflectionsLfReference, PropertyValue::Double(v)) => {
                self.lf_reference.set(v)
            }
            (Property::LateReflectionsHfRolloff, PropertyValue::Double(v)) => {
                self.hf_rolloff.set(v)
            }
            (Property::LateReflectionsHfReference, PropertyValue::Double(v)) => {
                self.hf_reference.set(v)
            }
            (Property::LateReflectionsDiffusion, PropertyValue::Double(v)) => {
                self.diffusion.set(v)
            }
            (Property::LateReflectionsModulationDepth, PropertyValue::Double(v)) => {
                self.modulation_depth.set(v)
            }
            (Property::LateReflectionsModulationFrequency, PropertyValue::Double(v)) => {
                self.modulation_frequency.set(v)
            }
            (Property::LateReflectionsDelay, PropertyValue::Double(v)) => {
                self.late_reflections_delay.set(v)
            }
            (property, _) => {
                return Err(crate::object::unknown_property(self.object_type(), property))
            }
        }
        Ok(())
    }

    fn get_property(&self, property: Property) -> Result<PropertyValue> {
        Ok(match property {
            Property::Gain => PropertyValue::Double(self.base.gain.get()),
            Property::InputFilterEnabled => PropertyValue::Int(self.input_filter_enabled.get()),
            Property::InputFilterCutoff => PropertyValue::Double(self.input_filter_cutoff.get()),
            Property::MeanFreePath => PropertyValue::Double(self.mean_free_path.get()),
            Property::T60 => PropertyValue::Double(self.t60.get()),
            Property::LateReflectionsLfRolloff => PropertyValue::Double(self.lf_rolloff.get()),
            Property::LateReflectionsLfReference => PropertyValue::Double(self.lf_reference.get()),
            Property::LateReflectionsHfRolloff => PropertyValue::Double(self.hf_rolloff.get()),
            Property::LateReflectionsHfReference => PropertyValue::Double(self.hf_reference.get()),
            Property::LateReflectionsDiffusion => PropertyValue::Double(self.diffusion.get()),
            Property::LateReflectionsModulationDepth => {
                PropertyValue::Double(self.modulation_depth.get())
            }
            Property::LateReflectionsModulationFrequency => {
                PropertyValue::Double(self.modulation_frequency.get())
            }
            Property::LateReflectionsDelay => {
                PropertyValue::Double(self.late_reflections_delay.get())
            }
            property => {
                return Err(crate::object::unknown_property(self.object_type(), property))
            }
        })
    }

    fn init_in_audio_thread(self: Arc<Self>) {
        if let Some(context) = self.base.context.upgrade() {
            let effect: Arc<dyn EffectExec> = self.clone();
            context.register_effect(&effect);
        }
    }

    fn owning_context(&self) -> Option<Arc<Context>> {
        self.base.context.upgrade()
    }

    fn as_any_arc(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
        self
    }
}
