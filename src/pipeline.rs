//! Playback pipeline state for one session.
//!
//! The mode is decided once, before the start command goes out, by probing
//! the sink for progressive append support. It never changes afterwards:
//! switching mid-stream could interleave bytes from two strategies.
//!
//! The pipeline does not call the sink itself. Each input returns an
//! [`Action`] for the engine to carry out, which keeps ordering decisions
//! here and side effects behind the engine's staleness check.

use std::{fmt, mem};

use crate::sink::{AudioSink, BlobId};

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum Mode {
    /// Chunks are appended to a source that can render while receiving.
    ProgressiveAppend,
    /// Chunks are collected and played from one assembled payload.
    BufferedDownload,
}

impl Mode {
    /// Probes `sink` for progressive append support for `mime`.
    pub fn probe<S: AudioSink + ?Sized>(sink: &S, mime: &str) -> Self {
        if sink.supports_progressive_append(mime) {
            Self::ProgressiveAppend
        } else {
            Self::BufferedDownload
        }
    }
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ProgressiveAppend => write!(f, "progressive append"),
            Self::BufferedDownload => write!(f, "buffered download"),
        }
    }
}

/// What the engine should do next.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Action {
    Nothing,
    /// Request the next chunk.
    Pull,
    Append(Vec<u8>),
    EndOfStream,
    /// Register the assembled payload and attach it.
    Attach(Vec<u8>),
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Pipeline {
    ProgressiveAppend {
        source_open: bool,
        append_in_flight: bool,
        eos_pending: bool,
    },
    BufferedDownload {
        parts: Vec<Vec<u8>>,
        blob: Option<BlobId>,
    },
}

impl Pipeline {
    #[must_use]
    pub fn new(mode: Mode) -> Self {
        match mode {
            Mode::ProgressiveAppend => Self::ProgressiveAppend {
                source_open: false,
                append_in_flight: false,
                eos_pending: false,
            },
            Mode::BufferedDownload => Self::BufferedDownload {
                parts: Vec::new(),
                blob: None,
            },
        }
    }

    #[must_use]
    pub fn mode(&self) -> Mode {
        match self {
            Self::ProgressiveAppend { .. } => Mode::ProgressiveAppend,
            Self::BufferedDownload { .. } => Mode::BufferedDownload,
        }
    }

    /// Called once the start command was acknowledged. Buffered downloads
    /// start pulling right away; progressive appends wait for the source.
    #[must_use]
    pub fn on_started(&self) -> Action {
        match self {
            Self::ProgressiveAppend { .. } => Action::Nothing,
            Self::BufferedDownload { .. } => Action::Pull,
        }
    }

    /// Called when the sink's append source opened.
    pub fn on_source_open(&mut self) -> Action {
        match self {
            Self::ProgressiveAppend { source_open, .. } => {
                if *source_open {
                    return Action::Nothing;
                }
                *source_open = true;
                Action::Pull
            }
            Self::BufferedDownload { .. } => Action::Nothing,
        }
    }

    /// Called for every chunk payload, in arrival order.
    pub fn on_chunk(&mut self, bytes: Vec<u8>) -> Action {
        match self {
            Self::ProgressiveAppend {
                append_in_flight, ..
            } => {
                *append_in_flight = true;
                Action::Append(bytes)
            }
            Self::BufferedDownload { parts, .. } => {
                parts.push(bytes);
                Action::Pull
            }
        }
    }

    /// Called when the sink consumed the last append.
    pub fn on_append_complete(&mut self) -> Action {
        match self {
            Self::ProgressiveAppend {
                append_in_flight,
                eos_pending,
                ..
            } => {
                if !mem::take(append_in_flight) {
                    return Action::Nothing;
                }
                if mem::take(eos_pending) {
                    Action::EndOfStream
                } else {
                    Action::Pull
                }
            }
            Self::BufferedDownload { .. } => Action::Nothing,
        }
    }

    /// Called when the device reports end of file.
    pub fn on_eof(&mut self) -> Action {
        match self {
            Self::ProgressiveAppend {
                append_in_flight,
                eos_pending,
                ..
            } => {
                if *append_in_flight {
                    *eos_pending = true;
                    Action::Nothing
                } else {
                    Action::EndOfStream
                }
            }
            Self::BufferedDownload { parts, .. } => {
                let parts = mem::take(parts);
                Action::Attach(parts.concat())
            }
        }
    }

    /// Remembers the blob created for the assembled payload.
    pub fn set_blob(&mut self, id: BlobId) {
        if let Self::BufferedDownload { blob, .. } = self {
            *blob = Some(id);
        }
    }

    /// Hands out the blob for release. Returns it at most once.
    pub fn take_blob(&mut self) -> Option<BlobId> {
        match self {
            Self::BufferedDownload { blob, .. } => blob.take(),
            Self::ProgressiveAppend { .. } => None,
        }
    }

    /// Number of bytes collected so far by a buffered download.
    #[must_use]
    pub fn buffered_len(&self) -> usize {
        match self {
            Self::BufferedDownload { parts, .. } => parts.iter().map(Vec::len).sum(),
            Self::ProgressiveAppend { .. } => 0,
        }
    }
}
