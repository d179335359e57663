//! Player configuration.
//!
//! Loaded from an optional TOML file; every key has a default so an empty or
//! missing file yields a working configuration for a device reachable as
//! `espwifi.local`.
//!
//! ```toml
//! host = "192.168.4.1"
//! token = "..."
//! fs = "sd"
//! music_dir = "/music"
//! chunk_size = 16384
//! stop_grace = 750
//! ```

use std::{fs, io, path::Path, time::Duration};

use serde::Deserialize;
use url::Url;
use veil::Redact;

use crate::{
    error::{Error, Result},
    protocol::media::Filesystem,
};

#[derive(Clone, PartialEq, Deserialize, Redact)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    /// Device host name or address, optionally with a port.
    pub host: String,

    /// Use TLS for both HTTP and WebSocket connections.
    pub secure: bool,

    /// Device access token.
    #[redact]
    pub token: Option<String>,

    /// Storage the music directory lives on.
    pub fs: Filesystem,

    pub music_dir: String,

    /// Chunk size requested on `music_start`.
    pub chunk_size: u32,

    /// Read size requested on `music_next`; the device default if unset.
    pub max_bytes: Option<u32>,

    /// Milliseconds after a stop during which sink errors are not reported.
    pub stop_grace: u64,

    /// Bytes to buffer before decoding starts.
    pub prefetch: usize,

    /// Initial volume between 0.0 and 1.0.
    pub volume: f32,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: "espwifi.local".to_owned(),
            secure: false,
            token: None,
            fs: Filesystem::default(),
            music_dir: "/music".to_owned(),
            chunk_size: 16 * 1024,
            max_bytes: None,
            stop_grace: 750,
            prefetch: 64 * 1024,
            volume: 1.0,
        }
    }
}

impl Config {
    /// Configuration files should be small; refuse anything larger.
    const MAX_FILE_SIZE: u64 = 64 * 1024;

    /// Loads the configuration from `path`, or the defaults if the file does
    /// not exist.
    ///
    /// # Errors
    ///
    /// Returns an error if the file exists but cannot be read, is too large,
    /// or is not valid TOML for this structure.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let attributes = match fs::metadata(path) {
            Ok(attributes) => attributes,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                info!("{} not found, using defaults", path.display());
                return Ok(Self::default());
            }
            Err(e) => return Err(e.into()),
        };

        if attributes.len() > Self::MAX_FILE_SIZE {
            return Err(Error::out_of_range(format!(
                "{} is too large",
                path.display()
            )));
        }

        let contents = fs::read_to_string(path)?;
        let config: Self = toml::from_str(&contents)?;
        debug!("loaded {}", path.display());

        config.validate()?;
        Ok(config)
    }

    /// # Errors
    ///
    /// Returns `InvalidArgument` for settings the player cannot work with.
    pub fn validate(&self) -> Result<()> {
        if self.host.is_empty() {
            return Err(Error::invalid_argument("host cannot be empty"));
        }
        if !(0.0..=1.0).contains(&self.volume) {
            return Err(Error::invalid_argument(format!(
                "volume {} is not between 0.0 and 1.0",
                self.volume
            )));
        }
        if self.music_dir.contains("..") {
            return Err(Error::invalid_argument(format!(
                "invalid music directory: {}",
                self.music_dir
            )));
        }
        Ok(())
    }

    #[must_use]
    pub fn stop_grace(&self) -> Duration {
        Duration::from_millis(self.stop_grace)
    }

    /// URL of the media WebSocket endpoint.
    ///
    /// # Errors
    ///
    /// Returns an error if the host does not form a valid URL.
    pub fn media_url(&self) -> Result<Url> {
        let scheme = if self.secure { "wss" } else { "ws" };
        let mut url = Url::parse(&format!("{scheme}://{}/ws/media", self.host))?;
        if let Some(token) = &self.token {
            url.query_pairs_mut().append_pair("token", token);
        }
        Ok(url)
    }

    /// URL of the file listing endpoint for `dir`.
    ///
    /// # Errors
    ///
    /// Returns an error if the host does not form a valid URL.
    pub fn files_url(&self, dir: &str) -> Result<Url> {
        let scheme = if self.secure { "https" } else { "http" };
        let mut url = Url::parse(&format!("{scheme}://{}/api/files", self.host))?;
        url.query_pairs_mut()
            .append_pair("fs", &self.fs.to_string())
            .append_pair("path", dir);
        Ok(url)
    }
}
