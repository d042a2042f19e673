//! Compile-time engine configuration.
//!
//! The engine runs at a fixed sample rate and block size; devices that want
//! something else are bridged by the output backend. Changing these requires
//! a recompile by design, since every DSP buffer in the crate is sized from
//! them.

/// Sample rate of the engine, in hertz. Decoded assets are resampled to this
/// rate at load (buffers) or on the fly (streaming generators).
pub const SR: u32 = 44100;

/// Frames per audio block. All generators, sources, and effects produce and
/// consume exactly one block per audio-thread iteration.
pub const BLOCK_SIZE: usize = 256;

/// Upper bound on the channel count of any generator or bus.
pub const MAX_CHANNELS: usize = 16;

/// Channels of the master bus and the device sink. Sources always pan or
/// remix down to this.
pub const OUTPUT_CHANNELS: usize = 2;

/// Maximum invokables executed per block before the remainder is deferred to
/// the next block, bounding control-plane work on the audio thread.
pub const MAX_INVOKABLES_PER_BLOCK: usize = 32;

/// Capacity of the property-write ring. Writers block (briefly) when the
/// ring is full; the audio thread drains it fully every block.
pub const PROPERTY_RING_CAPACITY: usize = 1024;

/// Lookahead of the streaming generator background pipeline, in seconds.
pub const STREAMING_LOOKAHEAD_SECS: f64 = 0.1;

/// Number of block-sized commands circulating between a streaming
/// generator's audio side and its background decode worker.
pub const fn streaming_command_count() -> usize {
    let numer = (STREAMING_LOOKAHEAD_SECS * SR as f64) as usize;
    // Round up to whole blocks.
    (numer + BLOCK_SIZE - 1) / BLOCK_SIZE
}
