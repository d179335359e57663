//! Directory listings from the device file browser API.
//!
//! ```json
//! {"files": [
//!     {"name": "a.mp3", "path": "/music/a.mp3", "isDirectory": false, "size": 3145728, "modified": 1700000000}
//! ]}
//! ```

use serde::Deserialize;

#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize)]
pub struct Listing {
    #[serde(default)]
    pub files: Vec<Entry>,
}

#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Entry {
    pub name: String,
    pub path: String,
    #[serde(default)]
    pub is_directory: bool,
    #[serde(default)]
    pub size: u64,
    /// Modification time in seconds since the epoch
    #[serde(default)]
    pub modified: i64,
}
