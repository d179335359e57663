//! Music streaming messages on the device's media WebSocket.
//!
//! The media endpoint is shared with the camera relay, so replies carry a
//! `type` discriminator and anything that is not about music is ignored.
//!
//! # Wire Format
//!
//! Commands:
//! ```json
//! {"cmd": "music_start", "fs": "sd", "path": "/music/a.mp3", "mime": "audio/mpeg", "chunkSize": 16384}
//! {"cmd": "music_next", "maxBytes": 16384}
//! {"cmd": "music_stop"}
//! ```
//!
//! Replies:
//! ```json
//! {"type": "music_start", "ok": true, "mime": "audio/mpeg", "chunkSize": 16384, "size": 3145728}
//! {"type": "music_chunk", "ok": true, "len": 16384, "eof": false, "offset": 16384}
//! {"type": "music_chunk", "ok": true, "len": 0, "eof": true, "offset": 3145728}
//! {"type": "media_ack", "ok": false, "cmd": "music_start", "error": "file_open_failed"}
//! ```
//!
//! Every `music_chunk` header with a non-zero `len` is followed by exactly one
//! binary frame of that length.

use std::{fmt, str::FromStr};

use serde::{Deserialize, Serialize};

use crate::error::Error;

/// Storage the device serves files from.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Hash, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Filesystem {
    /// SD card, the device default for music
    #[default]
    Sd,
    /// Internal LittleFS flash
    Lfs,
}

impl fmt::Display for Filesystem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Sd => write!(f, "sd"),
            Self::Lfs => write!(f, "lfs"),
        }
    }
}

impl FromStr for Filesystem {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "sd" => Ok(Self::Sd),
            "lfs" | "littlefs" => Ok(Self::Lfs),
            _ => Err(Error::invalid_argument(format!("unknown filesystem: {s}"))),
        }
    }
}

/// Smallest and largest chunk size the device accepts on `music_start`.
pub const CHUNK_SIZE_MIN: u32 = 4 * 1024;
pub const CHUNK_SIZE_MAX: u32 = 128 * 1024;

/// Smallest and largest read the device performs for one `music_next`.
pub const MAX_BYTES_MIN: u32 = 1024;
pub const MAX_BYTES_MAX: u32 = 64 * 1024;

/// Client-to-device command.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(tag = "cmd", rename_all = "snake_case")]
pub enum Command {
    MusicStart {
        fs: Filesystem,
        path: String,
        /// Requested mime type; the device may answer with another one.
        mime: String,
        #[serde(rename = "chunkSize")]
        chunk_size: u32,
    },
    MusicNext {
        #[serde(rename = "maxBytes", skip_serializing_if = "Option::is_none")]
        max_bytes: Option<u32>,
    },
    MusicStop,
}

impl Command {
    /// Builds a start command, clamping the chunk size into the range the
    /// device accepts and normalizing the path to be absolute.
    #[must_use]
    pub fn start(fs: Filesystem, path: &str, mime: &str, chunk_size: u32) -> Self {
        let path = if path.starts_with('/') {
            path.to_owned()
        } else {
            format!("/{path}")
        };

        Self::MusicStart {
            fs,
            path,
            mime: mime.to_owned(),
            chunk_size: chunk_size.clamp(CHUNK_SIZE_MIN, CHUNK_SIZE_MAX),
        }
    }

    #[must_use]
    pub fn next(max_bytes: Option<u32>) -> Self {
        Self::MusicNext {
            max_bytes: max_bytes.map(|bytes| bytes.clamp(MAX_BYTES_MIN, MAX_BYTES_MAX)),
        }
    }

    /// Serializes the command into the text frame sent to the device.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization fails, which only happens on
    /// allocation failure.
    pub fn to_text(&self) -> crate::error::Result<String> {
        serde_json::to_string(self).map_err(Into::into)
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::MusicStart {
                fs,
                path,
                mime,
                chunk_size,
            } => write!(f, "music_start {fs}:{path} ({mime}, {chunk_size} bytes)"),
            Self::MusicNext { .. } => write!(f, "music_next"),
            Self::MusicStop => write!(f, "music_stop"),
        }
    }
}

const fn yes() -> bool {
    true
}

/// Device-to-client control reply.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Reply {
    /// Acknowledgement of a successful `music_start`.
    MusicStart {
        #[serde(default = "yes")]
        ok: bool,
        /// Negotiated mime type
        mime: Option<String>,
        #[serde(rename = "chunkSize")]
        chunk_size: Option<u32>,
        /// Total file size in bytes, when the device could stat the file
        size: Option<u64>,
    },

    /// Announces the next binary frame, or end of track.
    MusicChunk {
        #[serde(default)]
        len: u32,
        #[serde(default)]
        eof: bool,
        /// Byte offset into the file after this chunk
        offset: Option<u64>,
    },

    MusicStop,

    /// Generic acknowledgement, used by the device for every failure.
    MediaAck {
        #[serde(default = "yes")]
        ok: bool,
        cmd: Option<String>,
        error: Option<String>,
        detail: Option<String>,
    },

    /// Anything else sent on the shared endpoint, such as camera frames.
    #[serde(other)]
    Other,
}

impl Reply {
    /// Returns the device-side failure carried by this reply, if any.
    #[must_use]
    pub fn failure(&self) -> Option<Error> {
        match self {
            Self::MediaAck {
                ok: false,
                cmd,
                error,
                detail,
            } => {
                let code = error.as_deref().unwrap_or("unknown");
                let cmd = cmd.as_deref().unwrap_or("command");
                let message = match detail {
                    Some(detail) => format!("{cmd} failed: {code} ({detail})"),
                    None => format!("{cmd} failed: {code}"),
                };
                Some(device_error(code, message))
            }
            Self::MusicStart { ok: false, .. } => {
                Some(Error::unknown("music_start acknowledged with failure"))
            }
            _ => None,
        }
    }
}

/// Maps a device error code onto an error kind.
fn device_error(code: &str, message: String) -> Error {
    match code {
        "missing_path" | "invalid_path" => Error::invalid_argument(message),
        "file_open_failed" => Error::not_found(message),
        "too_many_streams" | "stream_alloc_failed" => Error::resource_exhausted(message),
        "no_active_stream" => Error::failed_precondition(message),
        "unknown_cmd" => Error::unimplemented(message),
        _ => Error::internal(message),
    }
}
