//! Wire types for the ESPWiFi device APIs.
//!
//! # Submodules
//!
//! * [`media`] - Commands and replies on the `/ws/media` WebSocket
//! * [`files`] - Directory listings from the `/api/files` endpoint
//!
//! Both APIs speak JSON. Binary payloads on the media channel are raw frames
//! and never pass through this module.

pub mod files;
pub mod media;

use crate::error::Result;
use serde::Deserialize;
use std::fmt::Debug;

/// Parses and logs a JSON document received from the device.
///
/// # Errors
///
/// Returns an error if the body is not valid JSON or does not match `T`.
///
/// # Logging
///
/// * Success: logs the parsed structure at TRACE level
/// * Parse error: logs the raw JSON at TRACE level if it is valid JSON at all
/// * Invalid JSON: logs an error and the raw text
pub fn json<T>(body: &str, origin: &str) -> Result<T>
where
    T: for<'de> Deserialize<'de> + Debug,
{
    match serde_json::from_str(body) {
        Ok(result) => {
            trace!("{origin}: {result:?}");
            Ok(result)
        }
        Err(e) => {
            if let Ok(json) = serde_json::from_str::<serde_json::Value>(body) {
                trace!("{origin}: {json:#?}");
            } else {
                error!("{origin}: failed parsing response ({e:?})");
                trace!("{body}");
            }
            Err(e.into())
        }
    }
}
