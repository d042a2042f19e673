//! Global effects: read an accumulated send bus, write into the master.

mod echo;
mod fdn_reverb;

pub use echo::{EchoTapConfig, GlobalEcho};
pub use fdn_reverb::GlobalFdnReverb;

use crate::config::{BLOCK_SIZE, OUTPUT_CHANNELS};
use crate::context::Context;
use crate::properties::DoubleCell;
use std::sync::{Mutex, Weak};

/// Plumbing shared by the global effects: the send bus sources accumulate
/// into, the output gain cell, and a weak back-reference to the context
/// (weak, because the context strongly owns its effects).
pub(crate) struct EffectBase {
    pub context: Weak<Context>,
    pub gain: DoubleCell,
    input_bus: Mutex<[f32; BLOCK_SIZE * OUTPUT_CHANNELS]>,
}

impl EffectBase {
    pub fn new(context: Weak<Context>) -> Self {
        Self {
            context,
            gain: DoubleCell::new(1.0),
            input_bus: Mutex::new([0.0; BLOCK_SIZE * OUTPUT_CHANNELS]),
        }
    }

    /// Add a stereo block into the send bus. Called by sources during their
    /// part of the block, strictly before the effect itself runs.
    pub fn accumulate(&self, block: &[f32]) {
        let mut bus = self.input_bus.lock().unwrap();
        for (b, s) in bus.iter_mut().zip(block.iter()) {
            *b += *s;
        }
    }

    /// Move the accumulated send into `dest` and clear the bus for the next
    /// block.
    pub fn take_input(&self, dest: &mut [f32; BLOCK_SIZE * OUTPUT_CHANNELS]) {
        let mut bus = self.input_bus.lock().unwrap();
        dest.copy_from_slice(&bus[..]);
        bus.fill(0.0);
    }
}
