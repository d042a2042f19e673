//! Non-spatialized source: generator mix goes straight to the master.

use crate::config::{BLOCK_SIZE, OUTPUT_CHANNELS};
use crate::context::{Context, SourceExec};
use crate::error::Result;
use crate::math::ListenerFrame;
use crate::object::{BaseObject, ObjectHeader, ObjectType};
use crate::properties::{Property, PropertyValue};
use crate::sources::SourceBase;
use std::any::Any;
use std::sync::{Arc, Mutex};

pub struct DirectSource {
    header: ObjectHeader,
    base: SourceBase,
    /// Direct-path staging after the per-path filter.
    direct_scratch: Mutex<[f32; BLOCK_SIZE * OUTPUT_CHANNELS]>,
}

impl DirectSource {
    pub fn new(context: Arc<Context>) -> Arc<Self> {
        Arc::new(Self {
            header: ObjectHeader::new(),
            base: SourceBase::new(context, OUTPUT_CHANNELS),
            direct_scratch: Mutex::new([0.0; BLOCK_SIZE * OUTPUT_CHANNELS]),
        })
    }

    pub(crate) fn base(&self) -> &SourceBase {
        &self.base
    }
}

impl SourceExec for DirectSource {
    fn run_block(&self, block: u64, _listener: &ListenerFrame, master: &mut [f32]) {
        let mut dsp = self.base.dsp.lock().unwrap();
        if let Some(gain) = self.base.gain.acquire() {
            dsp.gain_fade.set_target(block, gain as f32);
        }
        self.base.sync_filters(&mut dsp);
        self.base.mix_generators(block, &mut dsp);
        self.base.apply_front_filters(&mut dsp);

        // Gain rides the staging buffer so the direct path and the effect
        // sends hear the same envelope.
        let gain_fade = dsp.gain_fade;
        {
            let staging = &mut dsp.staging;
            gain_fade.drive(block, BLOCK_SIZE, |frame, gain| {
                for ch in 0..OUTPUT_CHANNELS {
                    staging[frame * OUTPUT_CHANNELS + ch] *= gain;
                }
            });
        }

        let mut direct = self.direct_scratch.lock().unwrap();
        direct.copy_from_slice(&dsp.staging);
        dsp.filter_direct.process_block(&mut direct[..]);
        for (m, s) in master.iter_mut().zip(direct.iter()) {
            *m += *s;
        }

        // Sends are pre-direct-filter, post-gain.
        let mut sends = [0.0f32; BLOCK_SIZE * OUTPUT_CHANNELS];
        sends.copy_from_slice(&dsp.staging);
        self.base.feed_effect_sends(&sends, &mut dsp);
    }
}

impl BaseObject for DirectSource {
    fn header(&self) -> &ObjectHeader {
        &self.header
    }

    fn object_type(&self) -> ObjectType {
        ObjectType::DirectSource
    }

    fn set_property(&self, property: Property, value: PropertyValue) -> Result<()> {
        if self.base.set_common_property(property, &value) {
            return Ok(());
        }
        Err(crate::object::unknown_property(self.object_type(), property))
    }

    fn get_property(&self, property: Property) -> Result<PropertyValue> {
        self.base
            .get_common_property(property)
            .ok_or_else(|| crate::object::unknown_property(self.object_type(), property))
    }

    fn init_in_audio_thread(self: Arc<Self>) {
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
