//! Audio decoder using Symphonia.
//!
//! Decodes the containers the device serves (AAC/ADTS, FLAC, MP3, MP4, Ogg
//! Vorbis, WAV) into interleaved `f32` samples and exposes them as a
//! [`rodio::Source`].
//!
//! Input comes from a [`ChunkReader`], so reads may block while the rest of
//! the file is still being pulled from the device. Decoders are therefore
//! created on a blocking thread and only read from the audio thread.

use std::{
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::Duration,
};

use rodio::source::SeekError;
use symphonia::{
    core::{
        audio::SampleBuffer,
        codecs::{CodecRegistry, DecoderOptions},
        errors::Error as SymphoniaError,
        formats::{FormatOptions, FormatReader, SeekMode, SeekTo},
        io::{MediaSource, MediaSourceStream, MediaSourceStreamOptions},
        meta::MetadataOptions,
        probe::{Hint, Probe},
    },
    default::{
        codecs::{AacDecoder, FlacDecoder, MpaDecoder, PcmDecoder, VorbisDecoder},
        formats::{AdtsReader, FlacReader, IsoMp4Reader, MpaReader, OggReader, WavReader},
    },
};

use crate::{
    buffer::{ChunkReader, BUFFER_LEN},
    error::{Error, Result},
    track::Codec,
};

/// Sample type produced for playback.
pub type SampleFormat = f32;

/// Sample rate to assume when the codec does not specify one.
pub const DEFAULT_SAMPLE_RATE: u32 = 44_100;

/// Channel count to assume when the codec does not specify one.
const DEFAULT_CHANNELS: u16 = 2;

/// Maximum number of consecutive corrupted packets to skip before giving up.
const MAX_RETRIES: usize = 3;

pub struct Decoder {
    /// Format reader (demuxer) for extracting encoded audio packets
    demuxer: Box<dyn FormatReader>,

    /// Codec decoder for converting encoded packets to PCM samples
    decoder: Box<dyn symphonia::core::codecs::Decoder>,

    seek_mode: SeekMode,

    /// Reusable sample buffer to minimize allocations
    buffer: Option<SampleBuffer<SampleFormat>>,

    /// Current position in the sample buffer
    position: usize,

    channels: u16,
    sample_rate: u32,
    total_duration: Option<Duration>,
    total_samples: Option<usize>,

    /// Seeks are only honored while the shared owner equals this source's
    /// generation
    seek_guard: Option<(Arc<AtomicU64>, u64)>,
}

impl Decoder {
    /// Creates a decoder for `codec`, probing all formats when it is unknown.
    ///
    /// Blocks until enough of the file has arrived to read the container
    /// headers.
    ///
    /// # Errors
    ///
    /// Returns an error if the format is not recognized, no audio track is
    /// found, or the codec cannot be initialized.
    pub fn new(codec: Option<Codec>, reader: ChunkReader) -> Result<Self> {
        // Twice the buffer length to allow for Symphonia's read-ahead behavior,
        // and 64 kB minimum that Symphonia asserts for its ring buffer.
        let buffer_len = usize::max(64 * 1024, BUFFER_LEN * 2);
        let source: Box<dyn MediaSource> = Box::new(reader);
        let stream = MediaSourceStream::new(source, MediaSourceStreamOptions { buffer_len });

        let mut hint = Hint::new();
        let mut codecs = CodecRegistry::default();
        let mut readers = Probe::default();
        let (codecs, formats) = if let Some(codec) = codec {
            match codec {
                Codec::ADTS => {
                    codecs.register_all::<AacDecoder>();
                    readers.register_all::<AdtsReader>();
                }
                Codec::FLAC => {
                    codecs.register_all::<FlacDecoder>();
                    readers.register_all::<FlacReader>();
                }
                Codec::MP3 => {
                    codecs.register_all::<MpaDecoder>();
                    readers.register_all::<MpaReader>();
                }
                Codec::MP4 => {
                    // MP4 files can contain many audio codecs, but most likely AAC.
                    codecs.register_all::<AacDecoder>();
                    readers.register_all::<IsoMp4Reader>();
                }
                Codec::OGG => {
                    codecs.register_all::<VorbisDecoder>();
                    readers.register_all::<OggReader>();
                }
                Codec::WAV => {
                    codecs.register_all::<PcmDecoder>();
                    readers.register_all::<WavReader>();
                }
            }

            hint.with_extension(codec.extension());
            hint.mime_type(codec.mime_type());

            (&codecs, &readers)
        } else {
            (
                symphonia::default::get_codecs(),
                symphonia::default::get_probe(),
            )
        };

        // Coarse seeking estimates byte offsets from the bitrate, which is
        // only right for constant bitrate streams with a known length.
        let seek_mode = if codec == Some(Codec::WAV) && stream.byte_len().is_some() {
            SeekMode::Coarse
        } else {
            SeekMode::Accurate
        };

        let demuxer = formats
            .format(
                &hint,
                stream,
                &FormatOptions {
                    enable_gapless: true,
                    ..Default::default()
                },
                &MetadataOptions::default(),
            )?
            .format;
        let default_track = demuxer
            .default_track()
            .ok_or(Error::not_found("default track not found"))?;

        let codec_params = &default_track.codec_params;
        let decoder = codecs.make(codec_params, &DecoderOptions::default())?;

        // The decoder may know more than the container did.
        let codec_params = decoder.codec_params();
        let sample_rate = codec_params.sample_rate.unwrap_or(DEFAULT_SAMPLE_RATE);
        let channels = codec_params.channels.map_or(DEFAULT_CHANNELS, |channels| {
            u16::try_from(channels.count()).unwrap_or(u16::MAX)
        });

        let mut total_duration = None;
        if let Some(time_base) = codec_params.time_base {
            if let Some(frames) = codec_params.n_frames {
                total_duration = Some(time_base.calc_time(frames).into());
            }
        }
        let total_samples = codec_params.n_frames.and_then(|frames| {
            frames
                .checked_mul(channels.into())
                .and_then(|samples| usize::try_from(samples).ok())
        });

        debug!(
            "decoding {} at {sample_rate} Hz, {channels} channels, duration {total_duration:?}",
            codec.map_or_else(|| "detected format".to_owned(), |codec| codec.to_string())
        );

        Ok(Self {
            demuxer,
            decoder,
            seek_mode,

            buffer: None,
            position: 0,

            channels,
            sample_rate,
            total_duration,
            total_samples,

            seek_guard: None,
        })
    }

    /// Refuses seeks unless `owner` holds `generation`.
    ///
    /// rodio hands a seek order to whichever source it finds queued, which
    /// may be a later one than the order was meant for.
    pub fn guard_seeks(&mut self, owner: Arc<AtomicU64>, generation: u64) {
        self.seek_guard = Some((owner, generation));
    }
}

impl rodio::Source for Decoder {
    #[inline]
    fn current_frame_len(&self) -> Option<usize> {
        self.buffer.as_ref().map(SampleBuffer::len)
    }

    #[inline]
    fn channels(&self) -> u16 {
        self.channels
    }

    #[inline]
    fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    /// Returns `None` if the container does not state the number of frames.
    #[inline]
    fn total_duration(&self) -> Option<Duration> {
        self.total_duration
    }

    fn try_seek(&mut self, pos: Duration) -> std::result::Result<(), SeekError> {
        if let Some((owner, generation)) = &self.seek_guard {
            if owner.load(Ordering::Acquire) != *generation {
                return Err(SeekError::Other(Box::new(Error::aborted(
                    "seek was meant for another source",
                ))));
            }
        }

        self.demuxer
            .seek(
                self.seek_mode,
                SeekTo::Time {
                    // `track_id: None` implies the default track
                    track_id: None,
                    time: pos.into(),
                },
            )
            .map_err(|e| SeekError::Other(Box::new(e)))?;

        // Seeking is a demuxer operation, so the decoder cannot reliably
        // know when a seek took place. Reset it to avoid audio glitches.
        self.decoder.reset();
        self.buffer = None;
        self.position = 0;

        Ok(())
    }
}

impl Iterator for Decoder {
    type Item = SampleFormat;

    fn next(&mut self) -> Option<Self::Item> {
        if self
            .buffer
            .as_ref()
            .is_none_or(|buffer| self.position >= buffer.len())
        {
            let mut skipped = 0;
            loop {
                if skipped > MAX_RETRIES {
                    error!("skipped too many packets, giving up");
                    return None;
                }

                match self.demuxer.next_packet() {
                    Ok(packet) => {
                        let decoded = match self.decoder.decode(&packet) {
                            Ok(decoded) => decoded,
                            Err(SymphoniaError::DecodeError(e)) => {
                                warn!("skipping malformed packet: {e}");
                                skipped += 1;
                                continue;
                            }
                            Err(e) => {
                                error!("{e}");
                                return None;
                            }
                        };
                        let buffer = match self.buffer.as_mut() {
                            Some(buffer) => buffer,
                            None => self.buffer.insert(SampleBuffer::new(
                                decoded.capacity() as u64,
                                *decoded.spec(),
                            )),
                        };
                        buffer.copy_interleaved_ref(decoded);
                        self.position = 0;
                        break;
                    }

                    Err(SymphoniaError::IoError(e)) => {
                        match e.kind() {
                            std::io::ErrorKind::UnexpectedEof => (),
                            std::io::ErrorKind::ConnectionAborted => {
                                debug!("input aborted");
                            }
                            _ => error!("{e}"),
                        }
                        return None;
                    }
                    Err(SymphoniaError::DecodeError(e)) => {
                        warn!("skipping malformed packet: {e}");
                        skipped += 1;
                    }
                    Err(SymphoniaError::ResetRequired) => {
                        self.decoder.reset();
                    }
                    Err(e) => {
                        error!("{e}");
                        return None;
                    }
                }
            }
        }

        let sample = *self
            .buffer
            .as_ref()
            .and_then(|buf| buf.samples().get(self.position))?;
        self.position = self.position.checked_add(1)?;

        Some(sample)
    }

    #[inline]
    fn size_hint(&self) -> (usize, Option<usize>) {
        (0, self.total_samples)
    }
}
