//! Source with explicit panning: azimuth/elevation or a raw scalar.
//! Listener position is ignored.

use crate::config::{BLOCK_SIZE, OUTPUT_CHANNELS};
use crate::context::{Context, SourceExec};
use crate::error::Result;
use crate::math::ListenerFrame;
use crate::object::{BaseObject, ObjectHeader, ObjectType};
use crate::panner::{PannerLane, PannerStrategy};
use crate::properties::{DoubleCell, IntCell, Property, PropertyValue};
use crate::sources::SourceBase;
use std::any::Any;
use std::sync::{Arc, Mutex};

pub struct PannedSource {
    header: ObjectHeader,
    base: SourceBase,

    azimuth: DoubleCell,
    elevation: DoubleCell,
    panning_scalar: DoubleCell,
    panner_strategy: IntCell,

    /// Allocated on the audio thread during second-phase init.
    lane: Mutex<Option<PannerLane>>,
}

impl PannedSource {
    pub fn new(context: Arc<Context>) -> Arc<Self> {
        let strategy = context.default_panner_strategy();
        Arc::new(Self {
            header: ObjectHeader::new(),
            base: SourceBase::new(context, 1),
            azimuth: DoubleCell::new(0.0),
            elevation: DoubleCell::new(0.0),
            panning_scalar: DoubleCell::new(0.0),
            panner_strategy: IntCell::new(strategy as i64),
            lane: Mutex::new(None),
        })
    }

    pub(crate) fn base(&self) -> &SourceBase {
        &self.base
    }

    fn update_lane(&self, lane: &mut PannerLane) {
        // The most recent write wins between the angle pair and the scalar.
        let scalar = self.panning_scalar.acquire();
        let azimuth = self.azimuth.acquire();
        let elevation = self.elevation.acquire();
        if let Some(scalar) = scalar {
            lane.set_scalar(scalar);
        } else if azimuth.is_some() || elevation.is_some() {
            lane.set_angles(
                azimuth.unwrap_or_else(|| self.azimuth.get()),
                elevation.unwrap_or_else(|| self.elevation.get()),
            );
        }
    }
}

impl SourceExec for PannedSource {
    fn run_block(&self, block: u64, _listener: &ListenerFrame, master: &mut [f32]) {
        let mut lane_slot = self.lane.lock().unwrap();
        let Some(lane) = lane_slot.as_mut() else {
            return;
        };

        let mut dsp = self.base.dsp.lock().unwrap();
        if let Some(gain) = self.base.gain.acquire() {
            dsp.gain_fade.set_target(block, gain as f32);
        }
        self.base.sync_filters(&mut dsp);
        self.base.mix_generators(block, &mut dsp);
        self.base.apply_front_filters(&mut dsp);
        self.update_lane(lane);

        // Mono chain: direct filter and gain, then pan to stereo.
        let mut mono = [0.0f32; BLOCK_SIZE];
        mono.copy_from_slice(&dsp.staging[..BLOCK_SIZE]);
        dsp.filter_direct.process_block(&mut mono);
        let gain_fade = dsp.gain_fade;
        gain_fade.drive(block, BLOCK_SIZE, |frame, gain| {
            mono[frame] *= gain;
        });

        let mut panned = [0.0f32; BLOCK_SIZE * OUTPUT_CHANNELS];
        lane.pan_block(&mono, &mut panned);

        for (m, s) in master.iter_mut().zip(panned.iter()) {
            *m += *s;
        }
        self.base.feed_effect_sends(&panned, &mut dsp);
    }
}

impl BaseObject for PannedSource {
    fn header(&self) -> &ObjectHeader {
        &self.header
    }

    fn object_type(&self) -> ObjectType {
        ObjectType::PannedSource
    }

    fn set_property(&self, property: Property, value: PropertyValue) -> Result<()> {
        if self.base.set_common_property(property, &value) {
            return Ok(());
        }
        match (property, value) {
            (Property::Azimuth, PropertyValue::Double(v)) => self.azimuth.set(v),
            (Property::Elevation, PropertyValue::Double(v)) => self.elevation.set(v),
            (Property::PanningScalar, PropertyValue::Double(v)) => self.panning_scalar.set(v),
            (Property::PannerStrategy, PropertyValue::Int(v)) => self.panner_strategy.set(v),
            (property, _) => {
                return Err(crate::object::unknown_property(self.object_type(), property))
            }
        }
        Ok(())
    }

    fn get_property(&self, property: Property) -> Result<PropertyValue> {
        if let Some(value) = self.base.get_common_property(property) {
            return Ok(value);
        }
        Ok(match property {
            Property::Azimuth => PropertyValue::Double(self.azimuth.get()),
            Property::Elevation => PropertyValue::Double(self.elevation.get()),
            Property::PanningScalar => PropertyValue::Double(self.panning_scalar.get()),
            Property::PannerStrategy => PropertyValue::Int(self.panner_strategy.get()),
            property => {
                return Err(crate::object::unknown_property(self.object_type(), property))
            }
        })
    }

    fn init_in_audio_thread(self: Arc<Self>) {
        let strategy = PannerStrategy::from_i64(self.panner_strategy.get());
        let lane = self.base.context.allocate_panner_lane(strategy);
        *self.lane.lock().unwrap() = Some(lane);
        let source: Arc<dyn SourceExec> = self.clone();
        self.base.context.register_source(&source);
    }

    fn owning_context(&self) -> Option<Arc<Context>> {
        Some(self.base.context.clone())
    }

    fn as_any_arc(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::CollectSink;
    use crate::generators::NoiseGenerator;

    fn panned_with_noise() -> (Arc<Context>, Arc<PannedSource>) {
        let context =
            crate::context::Context::new(Box::new(CollectSink::with_limit(1024))).unwrap();
        let source = PannedSource::new(context.clone());
        source
            .set_property(
                Property::PannerStrategy,
                PropertyValue::Int(PannerStrategy::Stereo as i64),
            )
            .unwrap();
        source.clone().init_in_audio_thread();
        let generator = NoiseGenerator::new(context.clone(), 1);
        source.base().add_generator(generator);
        (context, source)
    }

    #[test]
    fn hard_left_scalar_keeps_right_channel_quiet() {
        let (context, source) = panned_with_noise();
        source
            .set_property(Property::PanningScalar, PropertyValue::Double(-1.0))
            .unwrap();
        let listener = ListenerFrame::default();
        let mut master = vec![0.0f32; BLOCK_SIZE * OUTPUT_CHANNELS];
        for block in 1..4 {
            master.fill(0.0);
            source.run_block(block, &listener, &mut master);
        }
        let left: f32 = master.iter().step_by(2).map(|s| s.abs()).sum();
        let right: f32 = master[1..].iter().step_by(2).map(|s| s.abs()).sum();
        assert!(left > 0.0);
        assert!(right < left * 1e-3);
        context.shutdown();
    }

    #[test]
    fn without_lane_the_source_is_silent() {
        let context =
            crate::context::Context::new(Box::new(CollectSink::with_limit(1024))).unwrap();
        let source = PannedSource::new(context.clone());
        let listener = ListenerFrame::default();
        let mut master = vec![0.0f32; BLOCK_SIZE * OUTPUT_CHANNELS];
        source.run_block(1, &listener, &mut master);
        assert!(master.iter().all(|&s| s == 0.0));
        context.shutdown();
    }
}
