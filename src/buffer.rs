//! Immutable PCM assets.
//!
//! A [`BufferObject`] is decoded and resampled to the engine rate once at
//! creation, then shared read-only by any number of buffer generators. The
//! sample data lives behind its own `Arc` so generators can keep playing a
//! buffer whose handle the user has already freed.

use crate::config;
use crate::error::{Result, SonanceError};
use crate::decoding::AudioDecoder;
use crate::object::{BaseObject, ObjectHeader, ObjectType};
use crate::properties::{Property, PropertyValue};
use std::any::Any;
use std::sync::Arc;

/// The PCM payload: interleaved f32 at the engine sample rate.
#[derive(Debug)]
pub struct BufferData {
    channels: usize,
    frames: usize,
    samples: Vec<f32>,
}

impl BufferData {
    pub fn new(channels: usize, samples: Vec<f32>) -> Result<Self> {
        if channels == 0 || channels > config::MAX_CHANNELS {
            return Err(SonanceError::Decoder(format!(
                "unsupported channel count: {channels}"
            )));
        }
        let frames = samples.len() / channels;
        Ok(Self {
            channels,
            frames,
            samples,
        })
    }

    pub fn channels(&self) -> usize {
        self.channels
    }

    pub fn frames(&self) -> usize {
        self.frames
    }

    pub fn duration_seconds(&self) -> f64 {
        self.frames as f64 / config::SR as f64
    }

    pub fn samples(&self) -> &[f32] {
        &self.samples
    }

    /// One interleaved frame; out of range reads as silence.
    #[inline]
    pub fn frame(&self, index: usize) -> &[f32] {
        if index >= self.frames {
            return &[];
        }
        let start = index * self.channels;
        &self.samples[start..start + self.channels]
    }
}

/// Decode an entire stream and resample it to the engine rate.
///
/// Whole assets land in memory here, so this is the one decode path that
/// can plausibly exhaust it; allocation failures surface as
/// [`SonanceError::OutOfMemory`] instead of aborting.
pub fn decode_to_buffer_data(mut decoder: Box<dyn AudioDecoder>) -> Result<BufferData> {
    let channels = decoder.channels();
    let source_rate = decoder.sample_rate();

    let mut samples: Vec<f32> = Vec::new();
    if let Some(frames) = decoder.duration_frames() {
        samples
            .try_reserve(frames as usize * channels)
            .map_err(|_| SonanceError::OutOfMemory)?;
    }
    let mut chunk = vec![0.0f32; config::BLOCK_SIZE * channels];
    loop {
        let got = decoder.write_samples_interleaved(config::BLOCK_SIZE, &mut chunk)?;
        if got == 0 {
            break;
        }
        samples
            .try_reserve(got * channels)
            .map_err(|_| SonanceError::OutOfMemory)?;
        samples.extend_from_slice(&chunk[..got * channels]);
    }

    if source_rate != config::SR {
        samples = resample_interleaved(&samples, channels, source_rate, config::SR)?;
    }

    log::debug!(
        "decoded buffer: {} frame(s), {channels} channel(s) (source rate {source_rate} Hz)",
        samples.len() / channels
    );
    BufferData::new(channels, samples)
}

/// Whole-asset resample using rubato's FFT path, channel by channel.
fn resample_interleaved(
    samples: &[f32],
    channels: usize,
    source_rate: u32,
    target_rate: u32,
) -> Result<Vec<f32>> {
    use rubato::{FftFixedIn, Resampler};

    const CHUNK: usize = 1024;
    let frames = samples.len() / channels;

    let mut resampler = FftFixedIn::<f32>::new(
        source_rate as usize,
        target_rate as usize,
        CHUNK,
        2,
        channels,
    )
    .map_err(|e| SonanceError::Decoder(format!("failed to create resampler: {e}")))?;

    let mut lanes: Vec<Vec<f32>> = vec![Vec::with_capacity(frames); channels];
    for frame in samples.chunks_exact(channels) {
        for (ch, &sample) in frame.iter().enumerate() {
            lanes[ch].push(sample);
        }
    }

    let mut out_lanes: Vec<Vec<f32>> = vec![Vec::new(); channels];
    let mut cursor = 0;
    while cursor < frames {
        let take = CHUNK.min(frames - cursor);
        let mut input: Vec<Vec<f32>> = Vec::with_capacity(channels);
        for lane in &lanes {
            let mut chunk = vec![0.0f32; CHUNK];
            chunk[..take].copy_from_slice(&lane[cursor..cursor + take]);
            input.push(chunk);
        }
        let output = resampler
            .process(&input, None)
            .map_err(|e| SonanceError::Decoder(format!("resampling: {e}")))?;
        for (ch, lane) in output.into_iter().enumerate() {
            out_lanes[ch].extend_from_slice(&lane);
        }
        cursor += take;
    }

    let out_frames = out_lanes[0].len();
    let mut interleaved = Vec::with_capacity(out_frames * channels);
    for frame in 0..out_frames {
        for lane in &out_lanes {
            interleaved.push(lane[frame]);
        }
    }
    Ok(interleaved)
}

/// The handle-reachable buffer object.
pub struct BufferObject {
    header: ObjectHeader,
    data: Arc<BufferData>,
}

impl BufferObject {
    pub fn new(data: BufferData) -> Arc<Self> {
        Arc::new(Self {
            header: ObjectHeader::new(),
            data: Arc::new(data),
        })
    }

    pub fn data(&self) -> Arc<BufferData> {
        self.data.clone()
    }
}

impl BaseObject for BufferObject {
    fn header(&self) -> &ObjectHeader {
        &self.header
    }

    fn object_type(&self) -> ObjectType {
        ObjectType::Buffer
    }

    fn set_property(&self, property: Property, _value: PropertyValue) -> Result<()> {
        Err(crate::object::unknown_property(self.object_type(), property))
    }

    fn get_property(&self, property: Property) -> Result<PropertyValue> {
        Err(crate::object::unknown_property(self.object_type(), property))
    }

    fn as_any_arc(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
        self
    }
}
