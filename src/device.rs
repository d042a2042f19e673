//! Audio output backends.
//!
//! The audio thread hands finished blocks to an [`AudioOutput`]; the
//! default backend feeds a cpal stream through a bounded block ring. The
//! device callback never blocks: when the ring is empty it plays silence
//! and counts an underrun. The blocking side is the audio thread's
//! `write_block`, which is what paces block production at real-time rate.

use crate::config::{BLOCK_SIZE, OUTPUT_CHANNELS, SR};
use crate::error::{Result, SonanceError};
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use crossbeam_channel::{bounded, Receiver, Sender, TrySendError};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

/// Destination for finished interleaved blocks.
pub trait AudioOutput: Send {
    /// Deliver one interleaved block of `BLOCK_SIZE * OUTPUT_CHANNELS`
    /// samples. May block until the sink has room; this is the audio
    /// thread's pacing point.
    fn write_block(&mut self, block: &[f32]) -> Result<()>;
}

/// Number of blocks buffered between the audio thread and the device
/// callback (~12 ms at the engine rate).
const DEVICE_RING_BLOCKS: usize = 2;

/// cpal-backed output.
///
/// `cpal::Stream` is not `Send`, but this sink has to travel to the
/// context's audio thread. The stream therefore lives on a small keeper
/// thread that builds it, plays it, and parks; the sink itself is just the
/// channel ends feeding the device callback.
pub struct CpalOutput {
    blocks_tx: Sender<Vec<f32>>,
    recycle_rx: Receiver<Vec<f32>>,
    underruns: Arc<AtomicU64>,
    stop: Arc<std::sync::atomic::AtomicBool>,
    keeper: Option<std::thread::JoinHandle<()>>,
}

impl CpalOutput {
    /// Open the default output device at the engine's rate and channel
    /// count.
    pub fn open() -> Result<Self> {
        let (blocks_tx, blocks_rx) = bounded::<Vec<f32>>(DEVICE_RING_BLOCKS);
        let (recycle_tx, recycle_rx) = bounded::<Vec<f32>>(DEVICE_RING_BLOCKS + 1);
        let underruns = Arc::new(AtomicU64::new(0));
        let stop = Arc::new(std::sync::atomic::AtomicBool::new(false));
        let (ready_tx, ready_rx) = bounded::<Result<()>>(1);

        let callback_underruns = underruns.clone();
        let keeper_stop = stop.clone();
        let keeper = std::thread::Builder::new()
            .name("sonance-device".to_string())
            .spawn(move || {
                let stream = match build_stream(blocks_rx, recycle_tx, callback_underruns) {
                    Ok(stream) => {
                        let _ = ready_tx.send(Ok(()));
                        stream
                    }
                    Err(e) => {
                        let _ = ready_tx.send(Err(e));
                        return;
                    }
                };
                while !keeper_stop.load(Ordering::Acquire) {
                    std::thread::park();
                }
                drop(stream);
            })
            .map_err(|e| SonanceError::AudioDevice(format!("failed to spawn keeper: {e}")))?;

        ready_rx
            .recv()
            .map_err(|_| SonanceError::AudioDevice("device keeper died".into()))??;

        log::info!(
            "opened output device at {SR} Hz, {OUTPUT_CHANNELS} channel(s), {DEVICE_RING_BLOCKS}-block ring"
        );

        Ok(Self {
            blocks_tx,
            recycle_rx,
            underruns,
            stop,
            keeper: Some(keeper),
        })
    }

    pub fn underruns(&self) -> u64 {
        self.underruns.load(Ordering::Relaxed)
    }
}

/// Build and start the device stream. Runs on the keeper thread.
fn build_stream(
    blocks_rx: Receiver<Vec<f32>>,
    recycle_tx: Sender<Vec<f32>>,
    underruns: Arc<AtomicU64>,
) -> Result<cpal::Stream> {
    let host = cpal::default_host();
    let device = host
        .default_output_device()
        .ok_or_else(|| SonanceError::AudioDevice("no default output device".into()))?;

    let config = cpal::StreamConfig {
        channels: OUTPUT_CHANNELS as u16,
        sample_rate: cpal::SampleRate(SR),
        buffer_size: cpal::BufferSize::Default,
    };

    let mut pending: Option<(Vec<f32>, usize)> = None;
    let stream = device
        .build_output_stream(
            &config,
            move |data: &mut [f32], _: &cpal::OutputCallbackInfo| {
                let mut cursor = 0;
                while cursor < data.len() {
                    let (block, consumed) = match pending.take() {
                        Some(entry) => entry,
                        None => match blocks_rx.try_recv() {
                            Ok(block) => (block, 0),
                            Err(_) => {
                                // Underrun: the engine fell behind; play
                                // silence rather than stalling the device.
                                data[cursor..].fill(0.0);
                                underruns.fetch_add(1, Ordering::Relaxed);
                                return;
                            }
                        },
                    };
                    let take = (block.len() - consumed).min(data.len() - cursor);
                    data[cursor..cursor + take].copy_from_slice(&block[consumed..consumed + take]);
                    cursor += take;
                    if consumed + take < block.len() {
                        pending = Some((block, consumed + take));
                    } else {
                        match recycle_tx.try_send(block) {
                            Ok(()) | Err(TrySendError::Full(_)) => {}
                            Err(TrySendError::Disconnected(_)) => return,
                        }
                    }
                }
            },
            |err| log::error!("audio stream error: {err}"),
            None,
        )
        .map_err(|e| SonanceError::AudioDevice(format!("failed to build stream: {e}")))?;

    stream
        .play()
        .map_err(|e| SonanceError::AudioDevice(format!("failed to start stream: {e}")))?;
    Ok(stream)
}

impl AudioOutput for CpalOutput {
    fn write_block(&mut self, block: &[f32]) -> Result<()> {
        let mut storage = self
            .recycle_rx
            .try_recv()
            .unwrap_or_else(|_| Vec::with_capacity(BLOCK_SIZE * OUTPUT_CHANNELS));
        storage.clear();
        storage.extend_from_slice(block);
        self.blocks_tx
            .send(storage)
            .map_err(|_| SonanceError::AudioDevice("output stream closed".into()))
    }
}

impl Drop for CpalOutput {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::Release);
        if let Some(keeper) = self.keeper.take() {
            keeper.thread().unpark();
            let _ = keeper.join();
        }
    }
}

/// In-process sink for tests and offline use: collects blocks up to a
/// frame limit, then throttles the producer and discards. Clone the handle
/// before passing the sink to a context; reads go through the clone.
#[derive(Clone)]
pub struct CollectSink {
    samples: Arc<Mutex<Vec<f32>>>,
    limit_frames: usize,
}

impl CollectSink {
    /// A sink that keeps at most `limit_frames` frames. Once full it keeps
    /// accepting writes (the engine must not stall) but stops storing and
    /// briefly sleeps so a free-running context does not spin a core.
    pub fn with_limit(limit_frames: usize) -> Self {
        Self {
            samples: Arc::new(Mutex::new(Vec::new())),
            limit_frames,
        }
    }

    pub fn new() -> Self {
        Self::with_limit(usize::MAX)
    }

    /// Everything written so far, interleaved.
    pub fn samples(&self) -> Vec<f32> {
        self.samples.lock().unwrap().clone()
    }

    pub fn frames_written(&self) -> usize {
        self.samples.lock().unwrap().len() / OUTPUT_CHANNELS
    }

    /// Spin until the sink holds at least `frames` frames.
    pub fn wait_for_frames(&self, frames: usize) {
        while self.frames_written() < frames.min(self.limit_frames) {
            std::thread::sleep(std::time::Duration::from_millis(1));
        }
    }

    pub fn clear(&self) {
        self.samples.lock().unwrap().clear();
    }
}

impl Default for CollectSink {
    fn default() -> Self {
        Self::new()
    }
}

impl AudioOutput for CollectSink {
    fn write_block(&mut self, block: &[f32]) -> Result<()> {
        {
            let mut samples = self.samples.lock().unwrap();
            if samples.len() / OUTPUT_CHANNELS < self.limit_frames {
                samples.extend_from_slice(block);
                return Ok(());
            }
        }
        std::thread::sleep(std::time::Duration::from_micros(500));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn collect_sink_accumulates() {
        let sink = CollectSink::new();
        let mut writer = sink.clone();
        writer.write_block(&[0.5; BLOCK_SIZE * OUTPUT_CHANNELS]).unwrap();
        writer.write_block(&[0.25; BLOCK_SIZE * OUTPUT_CHANNELS]).unwrap();
        assert_eq!(sink.frames_written(), BLOCK_SIZE * 2);
        assert_eq!(sink.samples()[0], 0.5);
    }
}
