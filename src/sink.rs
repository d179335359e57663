//! Audio sink the engine drives.
//!
//! A sink renders audio in one of two ways:
//! * Progressive append: an append source is opened for a mime type and fed
//!   chunk by chunk while playback may already run
//! * Blob: a complete payload is registered as a single-use handle and
//!   attached as the source
//!
//! Sinks report back through [`SinkEvent`]s which the caller tags with the
//! session the source was opened or attached under. Every method that
//! completes asynchronously does so by a later event, never by reentering
//! the engine.

use std::{fmt, time::Duration};

use crate::{error::Result, sequencer::SessionId};

/// Handle to an assembled payload registered with the sink.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct BlobId(pub u64);

impl fmt::Display for BlobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "blob:{}", self.0)
    }
}

/// Span of playback time that can currently be sought to.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct SeekableRange {
    pub start: Duration,
    pub end: Duration,
}

impl SeekableRange {
    #[must_use]
    pub fn new(start: Duration, end: Duration) -> Self {
        Self {
            start: start.min(end),
            end,
        }
    }

    #[must_use]
    pub fn contains(&self, position: Duration) -> bool {
        position >= self.start && position <= self.end
    }
}

/// Why a sink refused a seek.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SeekRejected {
    /// Not enough data has arrived yet to seek there. Worth retrying later.
    NotBuffered,
    /// Nothing to seek in.
    NoSource,
    Failed(String),
}

impl fmt::Display for SeekRejected {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NotBuffered => write!(f, "position not buffered yet"),
            Self::NoSource => write!(f, "no source attached"),
            Self::Failed(reason) => write!(f, "{reason}"),
        }
    }
}

/// Lifecycle events reported by a sink.
#[derive(Clone, Debug, PartialEq)]
pub enum SinkEvent {
    /// The append source is ready to accept data.
    SourceOpen,
    /// The last `append` has been consumed.
    AppendComplete,
    /// Enough data is buffered to start or resume rendering.
    CanPlay,
    LoadedMetadata {
        /// `None` when the duration is unbounded or unknown.
        duration: Option<Duration>,
    },
    TimeUpdate {
        position: Duration,
    },
    /// A seek the sink accepted has been applied.
    Seeked {
        position: Duration,
    },
    Playing,
    Paused,
    Ended,
    Error(String),
}

impl fmt::Display for SinkEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::LoadedMetadata { duration } => write!(f, "loaded metadata ({duration:?})"),
            Self::TimeUpdate { position } => write!(f, "time update ({position:?})"),
            Self::Seeked { position } => write!(f, "seeked ({position:?})"),
            Self::Error(e) => write!(f, "error: {e}"),
            other => write!(f, "{other:?}"),
        }
    }
}

pub trait AudioSink {
    /// Whether an append source can be opened for `mime`.
    fn supports_progressive_append(&self, mime: &str) -> bool;

    /// Opens an append source for `mime`, reporting
    /// [`SinkEvent::SourceOpen`] once it is ready.
    ///
    /// # Errors
    ///
    /// Returns an error if the sink rejects the mime type.
    fn open_append(&mut self, session: SessionId, mime: &str, size: Option<u64>) -> Result<()>;

    /// Appends the next chunk, reporting [`SinkEvent::AppendComplete`] once
    /// it is consumed.
    ///
    /// # Errors
    ///
    /// Returns an error if no append source is open or the data is rejected.
    fn append(&mut self, bytes: Vec<u8>) -> Result<()>;

    /// Signals that no more data will be appended.
    ///
    /// # Errors
    ///
    /// Returns an error if no append source is open.
    fn end_of_stream(&mut self) -> Result<()>;

    /// Registers a complete payload as a single-use handle.
    ///
    /// # Errors
    ///
    /// Returns an error if the payload cannot be stored.
    fn create_blob(&mut self, payload: Vec<u8>, mime: &str) -> Result<BlobId>;

    /// Attaches a blob as the source.
    ///
    /// # Errors
    ///
    /// Returns an error if the blob is unknown or cannot be decoded.
    fn attach_blob(&mut self, session: SessionId, blob: BlobId) -> Result<()>;

    /// Releases a blob. Unknown or already released blobs are ignored.
    fn revoke_blob(&mut self, blob: BlobId);

    /// # Errors
    ///
    /// Returns an error if nothing is attached.
    fn play(&mut self) -> Result<()>;

    fn pause(&mut self);

    /// Starts a seek. Sinks that cannot apply it right away report
    /// [`SinkEvent::Seeked`] once they have.
    ///
    /// # Errors
    ///
    /// Returns why the seek could not be applied.
    fn seek(&mut self, position: Duration) -> std::result::Result<(), SeekRejected>;

    fn seekable(&self) -> Option<SeekableRange>;

    fn set_volume(&mut self, volume: f32);

    /// Drops the current source and any pending appends.
    fn detach(&mut self);
}
