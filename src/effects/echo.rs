//! A tapped stereo delay line.
//!
//! Users supply any number of taps, each with its own delay and per-ear
//! gain. Taps are installed atomically from the control plane; the delay
//! line is sized to the longest tap.

use crate::config::{BLOCK_SIZE, OUTPUT_CHANNELS, SR};
use crate::context::{Context, EffectExec};
use crate::effects::EffectBase;
use crate::error::{Result, SonanceError};
use crate::fade::FadeDriver;
use crate::filter_design::{BiquadConfig, IirFilterState};
use crate::object::{BaseObject, ObjectHeader, ObjectType};
use crate::properties::{BiquadCell, Property, PropertyValue};
use std::any::Any;
use std::sync::{Arc, Mutex, Weak};

/// Longest supported tap delay, in seconds.
const MAX_TAP_DELAY_SECS: f64 = 5.0;

/// One echo tap, delay in seconds.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EchoTapConfig {
    pub delay: f64,
    pub gain_l: f32,
    pub gain_r: f32,
}

struct Tap {
    delay_frames: usize,
    gain_l: f32,
    gain_r: f32,
}

struct EchoDsp {
    /// Interleaved stereo ring holding the send history.
    line: Vec<f32>,
    line_frames: usize,
    write_frame: usize,
    taps: Vec<Tap>,
    gain_fade: FadeDriver,
    input_filter: IirFilterState,
    input_scratch: [f32; BLOCK_SIZE * OUTPUT_CHANNELS],
}

pub struct GlobalEcho {
    header: ObjectHeader,
    base: EffectBase,
    filter_input: BiquadCell,
    dsp: Mutex<EchoDsp>,
}

impl GlobalEcho {
    pub fn new(context: Weak<Context>) -> Arc<Self> {
        let identity = BiquadConfig::identity();
        Arc::new(Self {
            header: ObjectHeader::new(),
            base: EffectBase::new(context),
            filter_input: BiquadCell::new(identity),
            dsp: Mutex::new(EchoDsp {
                line: Vec::new(),
                line_frames: 0,
                write_frame: 0,
                taps: Vec::new(),
                gain_fade: FadeDriver::new(1.0),
                input_filter: IirFilterState::new(&identity.to_def(), OUTPUT_CHANNELS),
                input_scratch: [0.0; BLOCK_SIZE * OUTPUT_CHANNELS],
            }),
        })
    }

    /// Replace the tap set. Called on the audio thread via an invokable so
    /// the swap is atomic with respect to block processing.
    pub fn set_taps(&self, taps: &[EchoTapConfig]) -> Result<()> {
        let mut compiled = Vec::with_capacity(taps.len());
        let mut longest = 0usize;
        for tap in taps {
            if !(0.0..=MAX_TAP_DELAY_SECS).contains(&tap.delay) {
                return Err(SonanceError::Range {
                    property: "echo tap delay",
                    value: tap.delay,
                    min: 0.0,
                    max: MAX_TAP_DELAY_SECS,
                });
            }
            let delay_frames = (tap.delay * SR as f64).round() as usize;
            longest = longest.max(delay_frames);
            compiled.push(Tap {
                delay_frames,
                gain_l: tap.gain_l,
                gain_r: tap.gain_r,
            });
        }

        let mut dsp = self.dsp.lock().unwrap();
        let needed_frames = longest + BLOCK_SIZE + 1;
        if dsp.line_frames < needed_frames {
            dsp.line = vec![0.0; needed_frames * OUTPUT_CHANNELS];
            dsp.line_frames = needed_frames;
            dsp.write_frame = 0;
        }
        dsp.taps = compiled;
        Ok(())
    }
}

impl EffectExec for GlobalEcho {
    fn accumulate_input(&self, block: &[f32]) {
        self.base.accumulate(block);
    }

    fn run_block(&self, block: u64, master: &mut [f32]) {
        let mut dsp = self.dsp.lock().unwrap();
        if let Some(gain) = self.base.gain.acquire() {
            dsp.gain_fade.set_target(block, gain as f32);
        }

        let mut input = [0.0f32; BLOCK_SIZE * OUTPUT_CHANNELS];
        self.base.take_input(&mut input);
        if let Some(config) = self.filter_input.acquire() {
            dsp.input_filter.set_def(&config.to_def());
        }
        dsp.input_filter.process_block(&mut input);
        dsp.input_scratch = input;

        if dsp.taps.is_empty() || dsp.line_frames == 0 {
            return;
        }

        let EchoDsp {
            line,
            line_frames,
            write_frame,
            taps,
            gain_fade,
            input_scratch,
            ..
        } = &mut *dsp;

        gain_fade.drive(block, BLOCK_SIZE, |frame, gain| {
            let w = (*write_frame + frame) % *line_frames;
            line[w * 2] = input_scratch[frame * 2];
            line[w * 2 + 1] = input_scratch[frame * 2 + 1];

            let mut out_l = 0.0f32;
            let mut out_r = 0.0f32;
            for tap in taps.iter() {
                let read = (w + *line_frames - tap.delay_frames) % *line_frames;
                out_l += line[read * 2] * tap.gain_l;
                out_r += line[read * 2 + 1] * tap.gain_r;
            }
            master[frame * 2] += out_l * gain;
            master[frame * 2 + 1] += out_r * gain;
        });

        dsp.write_frame = (dsp.write_frame + BLOCK_SIZE) % dsp.line_frames;
    }
}

impl BaseObject for GlobalEcho {
    fn header(&self) -> &ObjectHeader {
        &self.header
    }

    fn object_type(&self) -> ObjectType {
        ObjectType::GlobalEcho
    }

    fn set_property(&self, property: Property, value: PropertyValue) -> Result<()> {
        match (property, value) {
            (Property::Gain, PropertyValue::Double(v)) => self.base.gain.set(v),
            (Property::FilterInput, PropertyValue::Biquad(v)) => self.filter_input.set(v),
            (property, _) => {
                return Err(crate::object::unknown_property(self.object_type(), property))
            }
        }
        Ok(())
    }

    fn get_property(&self, property: Property) -> Result<PropertyValue> {
        Ok(match property {
            Property::Gain => PropertyValue::Double(self.base.gain.get()),
            Property::FilterInput => PropertyValue::Biquad(self.filter_input.get()),
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

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::CollectSink;

    fn echo() -> (Arc<Context>, Arc<GlobalEcho>) {
        let context = Context::new(Box::new(CollectSink::with_limit(1024))).unwrap();
        let effect = GlobalEcho::new(Arc::downgrade(&context));
        (context, effect)
    }

    #[test]
    fn rejects_absurd_delays() {
        let (context, effect) = echo();
        let err = effect
            .set_taps(&[EchoTapConfig {
                delay: 60.0,
                gain_l: 1.0,
                gain_r: 1.0,
            }])
            .unwrap_err();
        assert!(matches!(err, SonanceError::Range { .. }));
        context.shutdown();
    }

    #[test]
    fn tap_appears_after_its_delay() {
        let (context, effect) = echo();
        // One-block delay, unity gains.
        let delay_blocks = 1;
        effect
            .set_taps(&[EchoTapConfig {
                delay: (BLOCK_SIZE * delay_blocks) as f64 / SR as f64,
                gain_l: 1.0,
                gain_r: 0.5,
            }])
            .unwrap();

        let mut master = vec![0.0f32; BLOCK_SIZE * OUTPUT_CHANNELS];
        // Feed an impulse block.
        let mut impulse = [0.0f32; BLOCK_SIZE * OUTPUT_CHANNELS];
        impulse[0] = 1.0;
        impulse[1] = 1.0;
        effect.accumulate_input(&impulse);
        effect.run_block(1, &mut master);
        assert!(master.iter().all(|&s| s == 0.0), "echo leaked early");

        // Next block: the tap fires.
        effect.run_block(2, &mut master);
        assert!((master[0] - 1.0).abs() < 1e-6);
        assert!((master[1] - 0.5).abs() < 1e-6);
        context.shutdown();
    }

    #[test]
    fn no_taps_is_silence() {
        let (context, effect) = echo();
        let mut master = vec![0.0f32; BLOCK_SIZE * OUTPUT_CHANNELS];
        let mut input = [0.0f32; BLOCK_SIZE * OUTPUT_CHANNELS];
        input.fill(0.7);
        effect.accumulate_input(&input);
        effect.run_block(1, &mut master);
        assert!(master.iter().all(|&s| s == 0.0));
        context.shutdown();
    }
}
