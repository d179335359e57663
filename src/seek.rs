//! Seeking within the current track.
//!
//! Seeks never reach the device. The sink maps time to bytes itself and the
//! pull protocol keeps delivering the file front to back, so a seek ahead of
//! the received data is parked until the sink can honor it.

use std::time::Duration;

use crate::sink::{AudioSink, SeekRejected, SeekableRange};

/// A seek gesture in progress.
#[derive(Copy, Clone, Debug, Default, PartialEq)]
pub struct SeekRequest {
    pub requested_seconds: f64,
    pub committed: bool,
}

/// Clamps `seconds` into the seekable range, or into `[0, duration]` while no
/// range is known. Without either, only the lower bound applies.
#[must_use]
pub fn clamp(seconds: f64, range: Option<SeekableRange>, duration: Option<Duration>) -> Duration {
    let seconds = if seconds.is_finite() {
        seconds.max(0.0)
    } else if seconds == f64::INFINITY {
        f64::MAX
    } else {
        0.0
    };

    let bounds = range.or_else(|| duration.map(|end| SeekableRange::new(Duration::ZERO, end)));
    match bounds {
        Some(range) => {
            let start = range.start.as_secs_f64();
            let end = range.end.as_secs_f64();
            Duration::from_secs_f64(seconds.max(start).min(end))
        }
        None => Duration::try_from_secs_f64(seconds).unwrap_or(Duration::MAX),
    }
}

#[derive(Clone, Debug, Default)]
pub struct SeekController {
    request: Option<SeekRequest>,
    /// Target the sink could not reach yet, in requested seconds.
    pending: Option<f64>,
}

impl SeekController {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Updates the displayed position while scrubbing. Does not touch the
    /// sink.
    pub fn preview(&mut self, seconds: f64) {
        self.request = Some(SeekRequest {
            requested_seconds: seconds,
            committed: false,
        });
    }

    /// The position to display instead of the playback time, if scrubbing.
    #[must_use]
    pub fn preview_position(&self) -> Option<f64> {
        self.request
            .filter(|request| !request.committed)
            .map(|request| request.requested_seconds)
    }

    #[must_use]
    pub fn pending(&self) -> Option<f64> {
        self.pending
    }

    /// Commits a seek. Returns the position applied to the sink, or `None`
    /// if it was deferred or failed.
    pub fn commit<S: AudioSink + ?Sized>(
        &mut self,
        sink: &mut S,
        seconds: f64,
        duration: Option<Duration>,
    ) -> Option<Duration> {
        self.request = Some(SeekRequest {
            requested_seconds: seconds,
            committed: true,
        });
        self.pending = None;
        self.apply(sink, seconds, duration)
    }

    /// Holds a seek until the sink has a source to apply it to.
    pub fn defer(&mut self, seconds: f64) {
        self.request = Some(SeekRequest {
            requested_seconds: seconds,
            committed: true,
        });
        self.pending = Some(seconds);
    }

    /// Retries a deferred seek. Called when the sink signals it has more
    /// data.
    pub fn retry<S: AudioSink + ?Sized>(
        &mut self,
        sink: &mut S,
        duration: Option<Duration>,
    ) -> Option<Duration> {
        let seconds = self.pending.take()?;
        trace!("retrying seek to {seconds:.1}s");
        self.apply(sink, seconds, duration)
    }

    fn apply<S: AudioSink + ?Sized>(
        &mut self,
        sink: &mut S,
        seconds: f64,
        duration: Option<Duration>,
    ) -> Option<Duration> {
        let position = clamp(seconds, sink.seekable(), duration);
        match sink.seek(position) {
            Ok(()) => {
                debug!("seeked to {:.1}s", position.as_secs_f64());
                self.request = None;
                Some(position)
            }
            Err(SeekRejected::NotBuffered) => {
                debug!(
                    "deferring seek to {:.1}s until more data is buffered",
                    position.as_secs_f64()
                );
                self.pending = Some(seconds);
                None
            }
            Err(e) => {
                warn!("seek to {:.1}s failed: {e}", position.as_secs_f64());
                self.request = None;
                None
            }
        }
    }

    /// Forgets any gesture and deferred target.
    pub fn reset(&mut self) {
        self.request = None;
        self.pending = None;
    }
}
