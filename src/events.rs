//! Notifications pushed by the player.
//!
//! The player sends these on every state transition, so observers such as a
//! now-playing display or a camera relay competing for bandwidth can follow
//! playback without polling.
//!
//! # Example
//!
//! ```rust
//! use espwifi_player::events::Event;
//!
//! fn handle_event(event: Event) {
//!     match event {
//!         Event::PlaybackChanged { is_playing: true, .. } => println!("playing"),
//!         Event::TrackChanged { index } => println!("now at track {index}"),
//!         Event::Failed => println!("track failed"),
//!         _ => {}
//!     }
//! }
//! ```

use crate::state::CastState;

/// Events emitted by the player.
///
/// Events are cheap to copy. Details such as the failure message are read
/// from the player's state.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum Event {
    /// Playing or paused flags changed.
    PlaybackChanged { is_playing: bool, is_paused: bool },

    /// A different track was selected, by the user or by auto-advance.
    TrackChanged { index: usize },

    /// The current track failed to play.
    ///
    /// Playback does not advance on its own after a failure.
    Failed,

    /// Remote playback connection state changed.
    CastChanged(CastState),
}
