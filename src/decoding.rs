//! Audio decoding.
//!
//! [`AudioDecoder`] is the engine-facing contract: pull interleaved f32
//! frames, optionally seek. The default implementation runs everything
//! symphonia can probe (wav, flac, ogg/vorbis, mp3, ...) over any
//! [`ByteStream`]. Raw-sample test decoders implement the same trait, which
//! is how the scenario tests feed the streaming pipeline without files.

use crate::error::{Result, SonanceError};
use crate::streams::ByteStream;
use symphonia::core::audio::SampleBuffer;
use symphonia::core::codecs::{Decoder as SymphoniaCodecDecoder, DecoderOptions};
use symphonia::core::errors::Error as SymphoniaError;
use symphonia::core::formats::{FormatOptions, FormatReader, SeekMode, SeekTo};
use symphonia::core::io::{MediaSource, MediaSourceStream};
use symphonia::core::meta::MetadataOptions;
use symphonia::core::probe::Hint;
use symphonia::core::units::Time;

/// A source of decoded PCM.
pub trait AudioDecoder: Send {
    fn channels(&self) -> usize;

    fn sample_rate(&self) -> u32;

    /// Decode up to `frames` frames into `out` (interleaved, at least
    /// `frames * channels` long). Returns the number of frames written;
    /// 0 means end of stream.
    fn write_samples_interleaved(&mut self, frames: usize, out: &mut [f32]) -> Result<usize>;

    /// Whether `seek_seconds` can be expected to work.
    fn supports_seek(&self) -> bool;

    fn seek_seconds(&mut self, seconds: f64) -> Result<()>;

    /// Total length in frames, when the container knows it.
    fn duration_frames(&self) -> Option<u64>;
}

/// Bridges a [`ByteStream`] into symphonia's IO layer.
struct StreamMediaSource {
    inner: Box<dyn ByteStream>,
}

impl std::io::Read for StreamMediaSource {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        self.inner.read(buf)
    }
}

impl std::io::Seek for StreamMediaSource {
    fn seek(&mut self, pos: std::io::SeekFrom) -> std::io::Result<u64> {
        self.inner.seek(pos)
    }
}

impl MediaSource for StreamMediaSource {
    fn is_seekable(&self) -> bool {
        self.inner.is_seekable()
    }

    fn byte_len(&self) -> Option<u64> {
        self.inner.size()
    }
}

/// Symphonia-backed decoder over an arbitrary byte stream.
pub struct SymphoniaDecoder {
    format: Box<dyn FormatReader>,
    decoder: Box<dyn SymphoniaCodecDecoder>,
    track_id: u32,
    channels: usize,
    sample_rate: u32,
    duration_frames: Option<u64>,
    seekable: bool,
    /// Decoded samples not yet handed out.
    leftover: Vec<f32>,
    leftover_pos: usize,
}

impl SymphoniaDecoder {
    pub fn new(stream: Box<dyn ByteStream>, extension_hint: Option<&str>) -> Result<Self> {
        let seekable = stream.is_seekable();
        let source = StreamMediaSource { inner: stream };
        let mss = MediaSourceStream::new(Box::new(source), Default::default());

        let mut hint = Hint::new();
        if let Some(ext) = extension_hint {
            hint.with_extension(ext);
        }

        let probed = symphonia::default::get_probe()
            .format(
                &hint,
                mss,
                &FormatOptions::default(),
                &MetadataOptions::default(),
            )
            .map_err(|e| SonanceError::Decoder(format!("failed to probe format: {e}")))?;

        let format = probed.format;
        let track = format
            .default_track()
            .ok_or_else(|| SonanceError::Decoder("no default audio track".to_string()))?;

        let sample_rate = track
            .codec_params
            .sample_rate
            .ok_or_else(|| SonanceError::Decoder("sample rate not found".to_string()))?;
        let channels = track
            .codec_params
            .channels
            .ok_or_else(|| SonanceError::Decoder("channel count not found".to_string()))?
            .count();
        let duration_frames = track.codec_params.n_frames;
        let track_id = track.id;

        let decoder = symphonia::default::get_codecs()
            .make(&track.codec_params, &DecoderOptions::default())
            .map_err(|e| SonanceError::Decoder(format!("failed to create decoder: {e}")))?;

        log::debug!(
            "decoder ready: {channels} channel(s) at {sample_rate} Hz, seekable: {seekable}"
        );

        Ok(Self {
            format,
            decoder,
            track_id,
            channels,
            sample_rate,
            duration_frames,
            seekable,
            leftover: Vec::new(),
            leftover_pos: 0,
        })
    }

    /// Decode the next packet into `leftover`. Returns false at end of
    /// stream.
    fn refill(&mut self) -> Result<bool> {
        loop {
            let packet = match self.format.next_packet() {
                Ok(packet) => packet,
                // Symphonia signals end-of-stream through IO errors.
                Err(SymphoniaError::IoError(_)) => return Ok(false),
                Err(SymphoniaError::ResetRequired) => {
                    self.decoder.reset();
                    continue;
                }
                Err(e) => return Err(SonanceError::Decoder(format!("packet read: {e}"))),
            };
            if packet.track_id() != self.track_id {
                continue;
            }

            let decoded = match self.decoder.decode(&packet) {
                Ok(decoded) => decoded,
                Err(SymphoniaError::IoError(_)) => return Ok(false),
                // Recoverable corruption: skip the packet.
                Err(SymphoniaError::DecodeError(_)) => continue,
                Err(e) => return Err(SonanceError::Decoder(format!("decode: {e}"))),
            };

            let spec = *decoded.spec();
            let mut sample_buf = SampleBuffer::<f32>::new(decoded.capacity() as u64, spec);
            sample_buf.copy_interleaved_ref(decoded);
            if sample_buf.samples().is_empty() {
                continue;
            }
            self.leftover.clear();
            self.leftover.extend_from_slice(sample_buf.samples());
            self.leftover_pos = 0;
            return Ok(true);
        }
    }
}

impl AudioDecoder for SymphoniaDecoder {
    fn channels(&self) -> usize {
        self.channels
    }

    fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    fn write_samples_interleaved(&mut self, frames: usize, out: &mut [f32]) -> Result<usize> {
        let wanted = frames * self.channels;
        let mut written = 0;
        while written < wanted {
            if self.leftover_pos >= self.leftover.len() && !self.refill()? {
                break;
            }
            let available = &self.leftover[self.leftover_pos..];
            let take = available.len().min(wanted - written);
            out[written..written + take].copy_from_slice(&available[..take]);
            self.leftover_pos += take;
            written += take;
        }
        Ok(written / self.channels)
    }

    fn supports_seek(&self) -> bool {
        self.seekable
    }

    fn seek_seconds(&mut self, seconds: f64) -> Result<()> {
        self.format
            .seek(
                SeekMode::Accurate,
                SeekTo::Time {
                    time: Time::from(seconds),
                    track_id: Some(self.track_id),
                },
            )
            .map_err(|e| SonanceError::Decoder(format!("seek: {e}")))?;
        self.decoder.reset();
        self.leftover.clear();
        self.leftover_pos = 0;
        Ok(())
    }

    fn duration_frames(&self) -> Option<u64> {
        self.duration_frames
    }
}

/// Open a decoder for a `(protocol, path, options)` triple.
pub fn decoder_for_protocol(
    protocol: &str,
    path: &str,
    options: &str,
) -> Result<Box<dyn AudioDecoder>> {
    let stream = crate::streams::open_stream(protocol, path, options)?;
    let hint = crate::streams::extension_hint(path);
    decoder_for_stream(stream, hint.as_deref())
}

/// Open a decoder over an already-open byte stream.
pub fn decoder_for_stream(
    stream: Box<dyn ByteStream>,
    extension_hint: Option<&str>,
) -> Result<Box<dyn AudioDecoder>> {
    Ok(Box::new(SymphoniaDecoder::new(stream, extension_hint)?))
}
