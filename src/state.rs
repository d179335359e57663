//! Playback state as seen by the rest of the application.

use std::{fmt, time::Duration};

/// Transport status of the player.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Hash)]
pub enum Status {
    #[default]
    Stopped,
    Connecting,
    Playing,
    Paused,
    Errored,
}

/// Inputs to the status machine, from user actions and sink events.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum Input {
    /// A track was selected.
    Select,
    /// The sink started rendering.
    Playing,
    /// The sink paused.
    Paused,
    /// The track played to its end.
    Ended,
    Stop,
    Fail,
}

impl Status {
    /// Pure transition function. Returns `None` for inputs that do not apply
    /// in the current status.
    #[must_use]
    pub fn next(self, input: Input) -> Option<Self> {
        use Status::{Connecting, Errored, Paused, Playing, Stopped};

        match (self, input) {
            (_, Input::Select) => Some(Connecting),
            (_, Input::Stop) => Some(Stopped),
            (_, Input::Fail) => Some(Errored),
            (Connecting | Playing | Paused, Input::Playing) => Some(Playing),
            (Connecting | Playing | Paused, Input::Paused) => Some(Paused),
            (Connecting | Playing | Paused, Input::Ended) => Some(Stopped),
            _ => None,
        }
    }

    /// Whether auto-advance may follow the end of a track.
    #[must_use]
    pub fn advances(self) -> bool {
        self != Self::Errored
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Stopped => write!(f, "stopped"),
            Self::Connecting => write!(f, "connecting"),
            Self::Playing => write!(f, "playing"),
            Self::Paused => write!(f, "paused"),
            Self::Errored => write!(f, "errored"),
        }
    }
}

/// Connection state of remote playback.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Hash)]
pub enum CastState {
    #[default]
    Disconnected,
    Connecting,
    Connected,
}

impl fmt::Display for CastState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Disconnected => write!(f, "disconnected"),
            Self::Connecting => write!(f, "connecting"),
            Self::Connected => write!(f, "connected"),
        }
    }
}

impl std::str::FromStr for CastState {
    type Err = crate::error::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "disconnected" => Ok(Self::Disconnected),
            "connecting" => Ok(Self::Connecting),
            "connected" => Ok(Self::Connected),
            other => Err(crate::error::Error::invalid_argument(format!(
                "unknown cast state: {other}"
            ))),
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct PlaybackState {
    pub status: Status,
    pub is_playing: bool,
    pub is_paused: bool,
    pub current_time: Duration,
    /// Always finite. Falls back to the end of the seekable range when the
    /// metadata reports no bounded duration.
    pub duration: Option<Duration>,
    /// Between 0.0 and 1.0.
    pub volume: f32,
    pub cast_state: CastState,
    pub user_paused: bool,
    pub last_error: Option<String>,
}

impl Default for PlaybackState {
    fn default() -> Self {
        Self {
            status: Status::default(),
            is_playing: false,
            is_paused: false,
            current_time: Duration::ZERO,
            duration: None,
            volume: 1.0,
            cast_state: CastState::default(),
            user_paused: false,
            last_error: None,
        }
    }
}

impl PlaybackState {
    /// Applies `input` and mirrors the resulting status in the flags.
    /// Returns whether the status changed.
    pub fn apply(&mut self, input: Input) -> bool {
        let Some(next) = self.status.next(input) else {
            trace!("ignoring {input:?} while {}", self.status);
            return false;
        };

        let changed = next != self.status;
        if changed {
            debug!("playback {} -> {next}", self.status);
        }
        self.status = next;
        self.is_playing = next == Status::Playing;
        self.is_paused = next == Status::Paused;
        changed
    }

    /// Clears per-track fields when a new track starts.
    pub fn reset_track(&mut self) {
        self.current_time = Duration::ZERO;
        self.duration = None;
        self.last_error = None;
    }

    /// Volume control is owned by the remote endpoint while casting.
    #[must_use]
    pub fn volume_enabled(&self) -> bool {
        self.cast_state != CastState::Connected
    }
}

/// Index of the track next to `current` in a list of `len` tracks, wrapping
/// around at both ends.
#[must_use]
pub fn adjacent(current: Option<usize>, len: usize, forward: bool) -> Option<usize> {
    if len == 0 {
        return None;
    }

    let index = match current {
        Some(current) if forward => current.saturating_add(1) % len,
        Some(current) => current.checked_sub(1).unwrap_or(len - 1) % len,
        None if forward => 0,
        None => len - 1,
    };
    Some(index)
}
