//! Track listings from the device file browser API.
//!
//! The gateway lists a directory on the device and turns the audio files in
//! it into [`TrackDescriptor`]s. The result is a snapshot: the player keeps
//! it until the listing is fetched again.

use std::time::Duration;

use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION};

use crate::{
    config::Config,
    error::{Error, Result},
    protocol::{self, files::Listing},
    track::TrackDescriptor,
};

pub struct Gateway {
    http_client: reqwest::Client,
    config: Config,
}

impl Gateway {
    /// Devices on a local network answer quickly or not at all.
    const TIMEOUT: Duration = Duration::from_secs(10);

    /// Creates a gateway for the device in `config`.
    ///
    /// # Errors
    ///
    /// Returns an error if the token cannot be used as a header value or the
    /// HTTP client cannot be built.
    pub fn new(config: &Config) -> Result<Self> {
        let mut headers = HeaderMap::new();
        if let Some(token) = &config.token {
            let mut bearer = HeaderValue::from_str(&format!("Bearer {token}"))
                .map_err(|e| Error::invalid_argument(format!("invalid token: {e}")))?;
            bearer.set_sensitive(true);
            headers.insert(AUTHORIZATION, bearer);
        }

        let user_agent = format!("{}/{}", env!("CARGO_PKG_NAME"), env!("CARGO_PKG_VERSION"));
        trace!("user agent: {user_agent}");

        let http_client = reqwest::Client::builder()
            .default_headers(headers)
            .user_agent(user_agent)
            .timeout(Self::TIMEOUT)
            .build()?;

        Ok(Self {
            http_client,
            config: config.clone(),
        })
    }

    /// Lists the playable tracks in `dir`, sorted by name.
    ///
    /// # Errors
    ///
    /// Returns an error if the request fails, the device answers with an
    /// error status, or the listing cannot be parsed.
    pub async fn list(&self, dir: &str) -> Result<Vec<TrackDescriptor>> {
        let url = self.config.files_url(dir)?;
        debug!("listing {dir} on {}", self.config.fs);

        let response = self
            .http_client
            .get(url)
            .send()
            .await?
            .error_for_status()?;
        let body = response.text().await?;
        let listing: Listing = protocol::json(&body, "files")?;

        Ok(tracks(listing))
    }
}

/// Keeps the audio files of a listing, ordered case-insensitively by name.
#[must_use]
pub fn tracks(listing: Listing) -> Vec<TrackDescriptor> {
    let mut tracks: Vec<TrackDescriptor> = listing
        .files
        .into_iter()
        .filter_map(|entry| match TrackDescriptor::try_from(entry) {
            Ok(track) => Some(track),
            Err(entry) => {
                trace!("skipping {}", entry.path);
                None
            }
        })
        .collect();

    tracks.sort_by_cached_key(|track| track.display_name.to_lowercase());
    tracks
}
