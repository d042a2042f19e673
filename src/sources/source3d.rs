//! Fully spatialized source: angles from the listener frame, gain from the
//! distance model.

use crate::config::{BLOCK_SIZE, OUTPUT_CHANNELS};
use crate::context::{Context, SourceExec};
use crate::error::Result;
use crate::math::{DVec3, ListenerFrame};
use crate::object::{BaseObject, ObjectHeader, ObjectType};
use crate::panner::{PannerLane, PannerStrategy};
use crate::properties::{Double3Cell, DoubleCell, IntCell, Property, PropertyValue};
use crate::spatial::{DistanceModel, DistanceParams};
use std::any::Any;
use std::sync::{Arc, Mutex};

pub struct Source3D {
    header: ObjectHeader,
    base: crate::sources::SourceBase,

    position: Double3Cell,
    panner_strategy: IntCell,
    distance_model: IntCell,
    distance_ref: DoubleCell,
    distance_max: DoubleCell,
    rolloff: DoubleCell,
    closeness_boost: DoubleCell,
    closeness_boost_distance: DoubleCell,

    lane: Mutex<Option<PannerLane>>,
}

impl Source3D {
    /// Constructed with the context's current distance-model defaults; the
    /// per-source properties diverge from there.
    pub fn new(context: Arc<Context>) -> Arc<Self> {
        let defaults = context.default_distance_params();
        let strategy = context.default_panner_strategy();
        Arc::new(Self {
            header: ObjectHeader::new(),
            base: crate::sources::SourceBase::new(context, 1),
            position: Double3Cell::new([0.0; 3]),
            panner_strategy: IntCell::new(strategy as i64),
            distance_model: IntCell::new(defaults.model as i64),
            distance_ref: DoubleCell::new(defaults.distance_ref),
            distance_max: DoubleCell::new(defaults.distance_max),
            rolloff: DoubleCell::new(defaults.rolloff),
            closeness_boost: DoubleCell::new(defaults.closeness_boost),
            closeness_boost_distance: DoubleCell::new(defaults.closeness_boost_distance),
            lane: Mutex::new(None),
        })
    }

    pub(crate) fn base(&self) -> &crate::sources::SourceBase {
        &self.base
    }

    fn distance_params(&self) -> DistanceParams {
        DistanceParams {
            model: DistanceModel::from_i64(self.distance_model.get()),
            distance_ref: self.distance_ref.get(),
            distance_max: self.distance_max.get(),
            rolloff: self.rolloff.get(),
            closeness_boost: self.closeness_boost.get(),
            closeness_boost_distance: self.closeness_boost_distance.get(),
        }
    }
}

impl SourceExec for Source3D {
    fn run_block(&self, block: u64, listener: &ListenerFrame, master: &mut [f32]) {
        let mut lane_slot = self.lane.lock().unwrap();
        let Some(lane) = lane_slot.as_mut() else {
            return;
        };

        let mut dsp = self.base.dsp.lock().unwrap();
        self.base.sync_filters(&mut dsp);
        self.base.mix_generators(block, &mut dsp);
        self.base.apply_front_filters(&mut dsp);

        // Spatialize: angles drive the lane, distance drives the gain, and
        // both ride fades so movement is smooth at block granularity.
        let position = DVec3::from_array(self.position.get());
        let (azimuth, elevation) = listener.angles_to(position);
        lane.set_angles(azimuth, elevation);

        let distance = listener.distance_to(position);
        let spatial_gain = self.distance_params().gain_at(distance);
        let total_gain = (self.base.gain.get() * spatial_gain) as f32;
        dsp.gain_fade.set_target(block, total_gain);
        // The gain cell's latch is folded into the recomputation above.
        let _ = self.base.gain.acquire();

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

impl BaseObject for Source3D {
    fn header(&self) -> &ObjectHeader {
        &self.header
    }

    fn object_type(&self) -> ObjectType {
        ObjectType::Source3D
    }

    fn set_property(&self, property: Property, value: PropertyValue) -> Result<()> {
        if self.base.set_common_property(property, &value) {
            return Ok(());
        }
        match (property, value) {
            (Property::Position, PropertyValue::Double3(v)) => self.position.set(v),
            (Property::PannerStrategy, PropertyValue::Int(v)) => self.panner_strategy.set(v),
            (Property::DistanceModel, PropertyValue::Int(v)) => self.distance_model.set(v),
            (Property::DistanceRef, PropertyValue::Double(v)) => self.distance_ref.set(v),
            (Property::DistanceMax, PropertyValue::Double(v)) => self.distance_max.set(v),
            (Property::Rolloff, PropertyValue::Double(v)) => self.rolloff.set(v),
            (Property::ClosenessBoost, PropertyValue::Double(v)) => self.closeness_boost.set(v),
            (Property::ClosenessBoostDistance, PropertyValue::Double(v)) => {
                self.closeness_boost_distance.set(v)
            }
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
            Property::Position => PropertyValue::Double3(self.position.get()),
            Property::PannerStrategy => PropertyValue::Int(self.panner_strategy.get()),
            Property::DistanceModel => PropertyValue::Int(self.distance_model.get()),
            Property::DistanceRef => PropertyValue::Double(self.distance_ref.get()),
            Property::DistanceMax => PropertyValue::Double(self.distance_max.get()),
            Property::Rolloff => PropertyValue::Double(self.rolloff.get()),
            Property::ClosenessBoost => PropertyValue::Double(self.closeness_boost.get()),
            Property::ClosenessBoostDistance => {
                PropertyValue::Double(self.closeness_boost_distance.get())
            }
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
