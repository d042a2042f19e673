//! Streamed playback: decode on a worker thread, mix on the audio thread.
//!
//! A fixed set of block-sized commands circulates between the two threads
//! over a pair of bounded channels: `free` (audio -> worker) and `filled`
//! (worker -> audio). The worker pops a free command, honors any pending
//! seek, decodes (through a resampler when the stream's rate differs from
//! the engine's), records loop/finish counts, and pushes it back filled.
//! The audio thread mixes one filled command per block, forwards the
//! recorded events, and returns the command. If `filled` is empty the block
//! is an underrun and plays as silence; a starved worker can therefore
//! never stall audio.

use crate::config::{streaming_command_count, BLOCK_SIZE, MAX_CHANNELS, SR};
use crate::context::Context;
use crate::decoding::AudioDecoder;
use crate::error::Result;
use crate::events::EventType;
use crate::fade::FadeDriver;
use crate::generators::GeneratorExec;
use crate::object::{BaseObject, ObjectHeader, ObjectType};
use crate::properties::{DoubleCell, IntCell, Property, PropertyValue};
use crate::resampler::StreamingResampler;
use crossbeam_channel::{bounded, Receiver, Sender};
use std::any::Any;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};

/// One circulating unit of decoded audio plus its bookkeeping.
struct StreamCommand {
    /// `BLOCK_SIZE * channels` interleaved samples.
    buffer: Vec<f32>,
    /// Seek request (seconds) set by the audio side when the user moved the
    /// position property.
    seek: Option<f64>,
    looped_count: u32,
    finished_count: u32,
    /// Stream position after this block, in seconds.
    final_position: f64,
}

/// State shared with the worker without keeping the generator alive.
struct StreamShared {
    looping: AtomicBool,
}

struct StreamingDsp {
    gain_fade: FadeDriver,
}

/// Worker-thread state. Owns the decoder outright; nothing here is ever
/// touched by the audio thread.
struct Worker {
    decoder: Box<dyn AudioDecoder>,
    resampler: Option<StreamingResampler>,
    scratch: Vec<f32>,
    channels: usize,
    position: f64,
    sent_finished: bool,
    shared: Arc<StreamShared>,
    free_rx: Receiver<StreamCommand>,
    filled_tx: Sender<StreamCommand>,
}

struct FillOutcome {
    position: f64,
    looped_count: u32,
    finished_count: u32,
}

/// Decode `frames` frames, looping by seeking back to zero when allowed.
/// The `just_looped` latch keeps a zero-length stream from spinning: after
/// a loop seek we demand data before looping again.
fn fill_from_decoder(
    decoder: &mut dyn AudioDecoder,
    frames: usize,
    channels: usize,
    dest: &mut [f32],
    looping: bool,
    position_in: f64,
) -> Result<FillOutcome> {
    let sr = decoder.sample_rate() as f64;
    let mut outcome = FillOutcome {
        position: position_in,
        looped_count: 0,
        finished_count: 0,
    };
    let mut needed = frames;
    let mut cursor = 0usize;
    let mut just_looped = false;

    while needed > 0 {
        let got = decoder.write_samples_interleaved(needed, &mut dest[cursor..])?;
        cursor += got * channels;
        needed -= got;
        outcome.position += got as f64 / sr;
        if got > 0 {
            just_looped = false;
        }
        if needed > 0 && !just_looped && looping && decoder.supports_seek() {
            outcome.looped_count += 1;
            decoder.seek_seconds(0.0)?;
            just_looped = true;
            outcome.position = 0.0;
        } else if needed > 0 {
            outcome.finished_count += 1;
            break;
        }
    }

    dest[cursor..].fill(0.0);
    Ok(outcome)
}

impl Worker {
    fn run(mut self) {
        log::debug!("streaming decode worker started");
        while let Ok(mut command) = self.free_rx.recv() {
            self.fill_command(&mut command);
            if self.filled_tx.send(command).is_err() {
                break;
            }
        }
        log::debug!("streaming decode worker exiting");
    }

    fn fill_command(&mut self, command: &mut StreamCommand) {
        command.buffer.fill(0.0);
        command.looped_count = 0;
        command.finished_count = 0;

        let looping = self.shared.looping.load(Ordering::Acquire);
        let result = self.fill_inner(command, looping);
        match result {
            Ok(outcome) => {
                self.position = outcome.position;
                command.looped_count = outcome.looped_count;
                command.finished_count = outcome.finished_count;
                command.final_position = self.position;
                // One Finished per playthrough, re-armed by seeks.
                if self.sent_finished {
                    command.finished_count = 0;
                } else if command.finished_count > 0 {
                    self.sent_finished = true;
                }
            }
            Err(err) => {
                // The command still circulates so the audio thread never
                // starves silently; this block just plays as silence.
                log::error!("streaming decode failed, recovering: {err}");
                command.final_position = self.position;
            }
        }
    }

    fn fill_inner(&mut self, command: &mut StreamCommand, looping: bool) -> Result<FillOutcome> {
        if let Some(seek) = command.seek.take() {
            if self.decoder.supports_seek() {
                self.position = seek;
                self.decoder.seek_seconds(seek)?;
            }
            // Any successful seek request re-arms Finished, wherever it
            // landed.
            self.sent_finished = false;
        }

        match &mut self.resampler {
            None => fill_from_decoder(
                self.decoder.as_mut(),
                BLOCK_SIZE,
                self.channels,
                &mut command.buffer,
                looping,
                self.position,
            ),
            Some(resampler) => {
                let needed = resampler.input_frames_needed();
                self.scratch.resize(needed * self.channels, 0.0);
                let outcome = fill_from_decoder(
                    self.decoder.as_mut(),
                    needed,
                    self.channels,
                    &mut self.scratch,
                    looping,
                    self.position,
                )?;
                resampler.process_interleaved(&self.scratch, &mut command.buffer)?;
                Ok(outcome)
            }
        }
    }
}

/// Streams audio from a decoder that may be slower than real time.
pub struct StreamingGenerator {
    header: ObjectHeader,
    context: Arc<Context>,
    weak_self: Weak<Self>,
    channel_count: usize,

    position: DoubleCell,
    looping: IntCell,
    gain: DoubleCell,

    shared: Arc<StreamShared>,
    free_tx: Sender<StreamCommand>,
    filled_rx: Receiver<StreamCommand>,
    dsp: Mutex<StreamingDsp>,
}

impl StreamingGenerator {
    pub fn new(context: Arc<Context>, decoder: Box<dyn AudioDecoder>) -> Result<Arc<Self>> {
        let channels = decoder.channels().clamp(1, MAX_CHANNELS);
        let decoder_rate = decoder.sample_rate();
        let resampler = if decoder_rate != SR {
            log::info!("streaming generator resampling {decoder_rate} Hz -> {SR} Hz");
            Some(StreamingResampler::new(decoder_rate, SR, channels, BLOCK_SIZE)?)
        } else {
            None
        };

        let command_count = streaming_command_count();
        let (free_tx, free_rx) = bounded(command_count);
        let (filled_tx, filled_rx) = bounded(command_count);
        for _ in 0..command_count {
            free_tx
                .send(StreamCommand {
                    buffer: vec![0.0; BLOCK_SIZE * channels],
                    seek: None,
                    looped_count: 0,
                    finished_count: 0,
                    final_position: 0.0,
                })
                .expect("fresh command ring cannot be full");
        }

        let shared = Arc::new(StreamShared {
            looping: AtomicBool::new(false),
        });

        let worker = Worker {
            decoder,
            resampler,
            scratch: Vec::new(),
            channels,
            position: 0.0,
            sent_finished: false,
            shared: shared.clone(),
            free_rx,
            filled_tx,
        };
        std::thread::Builder::new()
            .name("sonance-stream".to_string())
            .spawn(move || worker.run())
            .expect("failed to spawn streaming worker");

        Ok(Arc::new_cyclic(|weak_self| Self {
            header: ObjectHeader::new(),
            context,
            weak_self: weak_self.clone(),
            channel_count: channels,
            position: DoubleCell::new(0.0),
            looping: IntCell::new(0),
            gain: DoubleCell::new(1.0),
            shared,
            free_tx,
            filled_rx,
            dsp: Mutex::new(StreamingDsp {
                gain_fade: FadeDriver::new(1.0),
            }),
        }))
    }

    fn send_event(&self, event_type: EventType) {
        if let Some(this) = self.weak_self.upgrade() {
            let source: Arc<dyn BaseObject> = this;
            self.context.send_event(event_type, &source);
        }
    }
}

impl GeneratorExec for StreamingGenerator {
    fn channels(&self) -> usize {
        self.channel_count
    }

    fn generate_block(&self, block: u64, out: &mut [f32]) {
        let mut dsp = self.dsp.lock().unwrap();
        if let Some(gain) = self.gain.acquire() {
            dsp.gain_fade.set_target(block, gain as f32);
        }
        self.shared
            .looping
            .store(self.looping.get() != 0, Ordering::Release);

        let Ok(mut command) = self.filled_rx.try_recv() else {
            // Underrun: the worker is behind; this block is silence.
            log::debug!("streaming generator underrun at block {block}");
            return;
        };

        let channels = self.channel_count;
        let buffer = &command.buffer;
        dsp.gain_fade.drive(block, BLOCK_SIZE, |frame, gain| {
            for ch in 0..channels {
                out[frame * channels + ch] += gain * buffer[frame * channels + ch];
            }
        });

        for _ in 0..command.looped_count {
            self.send_event(EventType::Looped);
        }
        for _ in 0..command.finished_count {
            self.send_event(EventType::Finished);
        }

        command.seek = self.position.acquire();
        self.position.set_internal(command.final_position);

        // Cannot fail: the ring holds every command ever created.
        let _ = self.free_tx.send(command);
    }
}

impl BaseObject for StreamingGenerator {
    fn header(&self) -> &ObjectHeader {
        &self.header
    }

    fn object_type(&self) -> ObjectType {
        ObjectType::StreamingGenerator
    }

    fn set_property(&self, property: Property, value: PropertyValue) -> Result<()> {
        match (property, value) {
            (Property::Gain, PropertyValue::Double(v)) => self.gain.set(v),
            (Property::Position, PropertyValue::Double(v)) => self.position.set(v),
            (Property::Looping, PropertyValue::Int(v)) => self.looping.set(v),
            (property, _) => {
                return Err(crate::object::unknown_property(self.object_type(), property))
            }
        }
        Ok(())
    }

    fn get_property(&self, property: Property) -> Result<PropertyValue> {
        Ok(match property {
            Property::Gain => PropertyValue::Double(self.gain.get()),
            Property::Position => PropertyValue::Double(self.position.get()),
            Property::Looping => PropertyValue::Int(self.looping.get()),
            property => {
                return Err(crate::object::unknown_property(self.object_type(), property))
            }
        })
    }

    fn init_in_audio_thread(self: Arc<Self>) {
        // A fresh generator must not treat its initial position as a user
        // seek; the worker is already running ahead and the seek would
        // audibly restart the stream.
        self.position.mark_unchanged();
    }

    fn owning_context(&self) -> Option<Arc<Context>> {
        Some(self.context.clone())
    }

    fn as_any_arc(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
        self
    }
}
