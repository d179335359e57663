use std::{fmt, path::Path};

use crate::protocol::files;

/// Audio container formats the device may serve.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum Codec {
    /// AAC in ADTS framing
    ADTS,
    FLAC,
    MP3,
    MP4,
    OGG,
    WAV,
}

impl Codec {
    /// Resolves a codec from a mime type, ignoring any parameters such as
    /// `; codecs=...`.
    #[must_use]
    pub fn from_mime(mime: &str) -> Option<Self> {
        let essence = mime.split(';').next().unwrap_or_default().trim();
        match essence.to_ascii_lowercase().as_str() {
            "audio/mpeg" | "audio/mp3" => Some(Self::MP3),
            "audio/aac" | "audio/aacp" => Some(Self::ADTS),
            "audio/flac" | "audio/x-flac" => Some(Self::FLAC),
            "audio/mp4" | "audio/x-m4a" => Some(Self::MP4),
            "audio/ogg" | "application/ogg" => Some(Self::OGG),
            "audio/wav" | "audio/wave" | "audio/x-wav" => Some(Self::WAV),
            _ => None,
        }
    }

    #[must_use]
    pub fn from_extension(extension: &str) -> Option<Self> {
        match extension.to_ascii_lowercase().as_str() {
            "mp3" => Some(Self::MP3),
            "aac" => Some(Self::ADTS),
            "flac" => Some(Self::FLAC),
            "m4a" | "mp4" => Some(Self::MP4),
            "ogg" | "oga" => Some(Self::OGG),
            "wav" => Some(Self::WAV),
            _ => None,
        }
    }

    #[must_use]
    pub fn mime_type(self) -> &'static str {
        match self {
            Self::ADTS => "audio/aac",
            Self::FLAC => "audio/flac",
            Self::MP3 => "audio/mpeg",
            Self::MP4 => "audio/mp4",
            Self::OGG => "audio/ogg",
            Self::WAV => "audio/wav",
        }
    }

    #[must_use]
    pub fn extension(self) -> &'static str {
        match self {
            Self::ADTS => "aac",
            Self::FLAC => "flac",
            Self::MP3 => "mp3",
            Self::MP4 => "m4a",
            Self::OGG => "ogg",
            Self::WAV => "wav",
        }
    }
}

impl fmt::Display for Codec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.extension())
    }
}

/// A playable file on the device, as found in a directory listing.
///
/// Descriptors are read-only snapshots: the engine never mutates them and a
/// new listing replaces them wholesale.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct TrackDescriptor {
    pub display_name: String,
    pub storage_path: String,
    pub size_bytes: u64,
}

impl TrackDescriptor {
    #[must_use]
    pub fn codec(&self) -> Option<Codec> {
        Path::new(&self.storage_path)
            .extension()
            .and_then(|extension| extension.to_str())
            .and_then(Codec::from_extension)
    }

    /// The mime type to request from the device. The device may negotiate a
    /// different one in its acknowledgement.
    #[must_use]
    pub fn mime_hint(&self) -> &'static str {
        self.codec().map_or("audio/mpeg", Codec::mime_type)
    }
}

impl TryFrom<files::Entry> for TrackDescriptor {
    type Error = files::Entry;

    /// Accepts regular files with a recognized audio extension and hands
    /// anything else back.
    fn try_from(entry: files::Entry) -> Result<Self, Self::Error> {
        let is_audio = Path::new(&entry.name)
            .extension()
            .and_then(|extension| extension.to_str())
            .and_then(Codec::from_extension)
            .is_some();

        if entry.is_directory || !is_audio {
            return Err(entry);
        }

        Ok(Self {
            display_name: entry.name,
            storage_path: entry.path,
            size_bytes: entry.size,
        })
    }
}

impl fmt::Display for TrackDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "\"{}\"", self.display_name)
    }
}
