//! Random-access playback of an in-memory buffer.

use crate::buffer::{BufferData, BufferObject};
use crate::config::{BLOCK_SIZE, SR};
use crate::context::Context;
use crate::error::Result;
use crate::events::EventType;
use crate::fade::FadeDriver;
use crate::generators::GeneratorExec;
use crate::object::{BaseObject, ObjectHeader, ObjectType};
use crate::properties::{DoubleCell, IntCell, ObjectCell, ObjectRef, Property, PropertyValue};
use std::any::Any;
use std::sync::{Arc, Mutex, Weak};

struct BufferGenDsp {
    data: Option<Arc<BufferData>>,
    /// Playback cursor in frames; fractional because of pitch bend.
    position_frames: f64,
    /// One Finished per playthrough; re-armed by seeks and buffer swaps.
    finished_sent: bool,
    gain_fade: FadeDriver,
}

/// Plays a [`BufferObject`] with looping and linear-interpolation pitch
/// bend. Emits `Looped` on wrap and `Finished` once at end-of-buffer.
pub struct BufferGenerator {
    header: ObjectHeader,
    context: Arc<Context>,
    weak_self: Weak<Self>,

    buffer: ObjectCell,
    position: DoubleCell,
    looping: IntCell,
    pitch_bend: DoubleCell,
    gain: DoubleCell,

    dsp: Mutex<BufferGenDsp>,
}

impl BufferGenerator {
    pub fn new(context: Arc<Context>) -> Arc<Self> {
        Arc::new_cyclic(|weak_self| Self {
            header: ObjectHeader::new(),
            context,
            weak_self: weak_self.clone(),
            buffer: ObjectCell::new(ObjectRef::null()),
            position: DoubleCell::new(0.0),
            looping: IntCell::new(0),
            pitch_bend: DoubleCell::new(1.0),
            gain: DoubleCell::new(1.0),
            dsp: Mutex::new(BufferGenDsp {
                data: None,
                position_frames: 0.0,
                finished_sent: false,
                gain_fade: FadeDriver::new(1.0),
            }),
        })
    }

    fn send_event(&self, event_type: EventType) {
        if let Some(this) = self.weak_self.upgrade() {
            let source: Arc<dyn BaseObject> = this;
            self.context.send_event(event_type, &source);
        }
    }

    /// Pull the latest user writes into DSP state. Buffer swaps reset the
    /// cursor; seeks re-arm the finished latch.
    fn sync_properties(&self, block: u64, dsp: &mut BufferGenDsp) {
        if let Some(gain) = self.gain.acquire() {
            dsp.gain_fade.set_target(block, gain as f32);
        }
        if let Some(buffer_ref) = self.buffer.acquire() {
            dsp.data = buffer_ref
                .object
                .and_then(|o| o.as_any_arc().downcast::<BufferObject>().ok())
                .map(|b| b.data());
            dsp.position_frames = 0.0;
            dsp.finished_sent = false;
            self.position.set_internal(0.0);
        }
        if let Some(seconds) = self.position.acquire() {
            let frames = dsp.data.as_ref().map(|d| d.frames()).unwrap_or(0);
            dsp.position_frames = (seconds * SR as f64).clamp(0.0, frames as f64);
            dsp.finished_sent = false;
        }
    }
}

impl GeneratorExec for BufferGenerator {
    fn channels(&self) -> usize {
        self.dsp
            .lock()
            .unwrap()
            .data
            .as_ref()
            .map(|d| d.channels())
            .unwrap_or(1)
    }

    fn generate_block(&self, block: u64, out: &mut [f32]) {
        let mut dsp = self.dsp.lock().unwrap();
        self.sync_properties(block, &mut dsp);

        let Some(data) = dsp.data.clone() else {
            return;
        };
        let frames = data.frames();
        if frames == 0 {
            return;
        }

        let channels = data.channels();
        if out.len() < BLOCK_SIZE * channels {
            // A buffer with a different channel count landed this block;
            // the caller sized its scratch from the old count. Skip one
            // block and the counts agree again.
            return;
        }
        let looping = self.looping.get() != 0;
        let pitch = self.pitch_bend.get().max(0.0);
        let samples = data.samples();

        let mut position = dsp.position_frames;
        let mut looped = 0u32;
        let mut finished = false;

        let gain_fade = dsp.gain_fade;
        gain_fade.drive(block, BLOCK_SIZE, |frame, gain| {
            if finished {
                return;
            }
            if position >= frames as f64 {
                if looping {
                    // A buffer shorter than the pitch step can wrap more
                    // than once.
                    while position >= frames as f64 {
                        position -= frames as f64;
                        looped += 1;
                    }
                } else {
                    finished = true;
                    return;
                }
            }

            let base = position.floor() as usize;
            let fraction = (position - base as f64) as f32;
            let next = if base + 1 < frames {
                base + 1
            } else if looping {
                0
            } else {
                base
            };
            for ch in 0..channels {
                let a = samples[base * channels + ch];
                let b = samples[next * channels + ch];
                out[frame * channels + ch] += gain * (a + (b - a) * fraction);
            }
            position += pitch;
        });

        dsp.position_frames = position.min(frames as f64);
        self.position.set_internal(dsp.position_frames / SR as f64);

        for _ in 0..looped {
            self.send_event(EventType::Looped);
        }
        if finished && !dsp.finished_sent {
            dsp.finished_sent = true;
            self.send_event(EventType::Finished);
        }
    }
}

impl BaseObject for BufferGenerator {
    fn header(&self) -> &ObjectHeader {
        &self.header
    }

    fn object_type(&self) -> ObjectType {
        ObjectType::BufferGenerator
    }

    fn set_property(&self, property: Property, value: PropertyValue) -> Result<()> {
        match (property, value) {
            (Property::Gain, PropertyValue::Double(v)) => self.gain.set(v),
            (Property::Buffer, PropertyValue::Object(v)) => self.buffer.set(v),
            (Property::Position, PropertyValue::Double(v)) => self.position.set(v),
            (Property::Looping, PropertyValue::Int(v)) => self.looping.set(v),
            (Property::PitchBend, PropertyValue::Double(v)) => self.pitch_bend.set(v),
            (property, _) => {
                return Err(crate::object::unknown_property(self.object_type(), property))
            }
        }
        Ok(())
    }

    fn get_property(&self, property: Property) -> Result<PropertyValue> {
        Ok(match property {
            Property::Gain => PropertyValue::Double(self.gain.get()),
            Property::Buffer => PropertyValue::Object(self.buffer.get()),
            Property::Position => PropertyValue::Double(self.position.get()),
            Property::Looping => PropertyValue::Int(self.looping.get()),
            Property::PitchBend => PropertyValue::Double(self.pitch_bend.get()),
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

    fn generator_with_ramp(frames: usize) -> (Arc<Context>, Arc<BufferGenerator>) {
        let context = Context::new(Box::new(CollectSink::with_limit(1024))).unwrap();
        let generator = BufferGenerator::new(context.clone());
        let samples: Vec<f32> = (0..frames).map(|i| i as f32 / frames as f32).collect();
        let data = BufferData::new(1, samples).unwrap();
        let buffer = BufferObject::new(data);
        let arc: Arc<dyn BaseObject> = buffer;
        generator
            .set_property(
                Property::Buffer,
                PropertyValue::Object(ObjectRef {
                    handle: 1,
                    object: Some(arc),
                }),
            )
            .unwrap();
        (context, generator)
    }

    #[test]
    fn plays_buffer_contents() {
        let (context, generator) = generator_with_ramp(BLOCK_SIZE * 2);
        let mut out = vec![0.0f32; BLOCK_SIZE];
        generator.generate_block(1, &mut out);
        assert_eq!(out[0], 0.0);
        assert!((out[100] - 100.0 / (BLOCK_SIZE * 2) as f32).abs() < 1e-6);
        context.shutdown();
    }

    #[test]
    fn stops_at_end_without_looping() {
        let (context, generator) = generator_with_ramp(BLOCK_SIZE / 2);
        let mut out = vec![0.0f32; BLOCK_SIZE];
        generator.generate_block(1, &mut out);
        // Second half of the block is untouched.
        assert!(out[BLOCK_SIZE - 1] == 0.0);
        // Subsequent blocks stay silent.
        out.fill(0.0);
        generator.generate_block(2, &mut out);
        assert!(out.iter().all(|&s| s == 0.0));
        context.shutdown();
    }

    #[test]
    fn loops_and_wraps_position() {
        let (context, generator) = generator_with_ramp(BLOCK_SIZE / 2);
        generator
            .set_property(Property::Looping, PropertyValue::Int(1))
            .unwrap();
        let mut out = vec![0.0f32; BLOCK_SIZE];
        generator.generate_block(1, &mut out);
        // Wrapped content fills the whole block.
        assert!(out[BLOCK_SIZE - 8].abs() > 0.0);
        context.shutdown();
    }

    #[test]
    fn pitch_bend_doubles_consumption() {
        let (context, generator) = generator_with_ramp(BLOCK_SIZE * 4);
        generator
            .set_property(Property::PitchBend, PropertyValue::Double(2.0))
            .unwrap();
        let mut out = vec![0.0f32; BLOCK_SIZE];
        generator.generate_block(1, &mut out);
        let position = match generator.get_property(Property::Position).unwrap() {
            PropertyValue::Double(v) => v,
            _ => unreachable!(),
        };
        let expected = 2.0 * BLOCK_SIZE as f64 / SR as f64;
        assert!((position - expected).abs() < 1e-9, "position {position}");
        context.shutdown();
    }
}
