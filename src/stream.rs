//! Chunk transport protocol for one streaming session.
//!
//! The device serves a track by pull: the client starts the stream, then asks
//! for each chunk with `music_next`. Every pull is answered by exactly one
//! chunk header followed by one binary frame of the announced length, or by
//! an end-of-file header without a frame. Backpressure is simply not pulling.
//!
//! [`Stream`] is a sans-IO state machine. It returns the commands to send and
//! the payloads to hand on, and never touches the channel itself.
//!
//! ```text
//! Idle -> Requesting -> Streaming -> Draining -> Closed
//!            |              |
//!            +--------------+---- failure / stop ----> Closed
//! ```

use std::fmt;

use crate::{
    error::{Error, Result},
    protocol::media::{Command, Filesystem, Reply},
};

/// Lifecycle phase of a stream.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Hash)]
pub enum Phase {
    #[default]
    Idle,
    /// Start command sent, waiting for the acknowledgement.
    Requesting,
    /// Acknowledged, chunks are being pulled.
    Streaming,
    /// End of file received, local assembly is finishing.
    Draining,
    Closed,
}

/// Inputs that move a stream between phases.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum Input {
    Start,
    Acknowledged,
    EndOfFile,
    Finished,
    /// Failure or stop, from any phase.
    Abort,
}

impl Phase {
    /// Pure transition function. Returns `None` for transitions the protocol
    /// does not allow.
    #[must_use]
    pub fn next(self, input: Input) -> Option<Self> {
        match (self, input) {
            (_, Input::Abort) => Some(Self::Closed),
            (Self::Idle, Input::Start) => Some(Self::Requesting),
            (Self::Requesting, Input::Acknowledged) => Some(Self::Streaming),
            (Self::Streaming, Input::EndOfFile) => Some(Self::Draining),
            (Self::Draining, Input::Finished) => Some(Self::Closed),
            _ => None,
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{self:?}")
    }
}

/// Where the current pull stands.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Hash)]
enum Pull {
    #[default]
    Parked,
    AwaitingHeader,
    AwaitingFrame(u32),
}

/// What a reply meant for the session.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Progress {
    /// The device accepted the start command.
    Started {
        mime: String,
        size: Option<u64>,
    },
    /// A chunk of `len` bytes is announced; its frame follows.
    Announced { len: u32 },
    /// No more chunks.
    EndOfFile,
}

#[derive(Clone, Debug, Default)]
pub struct Stream {
    phase: Phase,
    pull: Pull,
    mime_hint: String,
    negotiated_mime: Option<String>,
    size: Option<u64>,
    max_bytes: Option<u32>,
    received: u64,
    chunks: u64,
}

impl Stream {
    #[must_use]
    pub fn new(mime_hint: impl Into<String>, max_bytes: Option<u32>) -> Self {
        Self {
            mime_hint: mime_hint.into(),
            max_bytes,
            ..Self::default()
        }
    }

    #[must_use]
    pub fn phase(&self) -> Phase {
        self.phase
    }

    #[must_use]
    pub fn mime_hint(&self) -> &str {
        &self.mime_hint
    }

    /// The mime type the device settled on, once acknowledged.
    #[must_use]
    pub fn negotiated_mime(&self) -> Option<&str> {
        self.negotiated_mime.as_deref()
    }

    /// Length of the frame currently expected, if a header was received.
    #[must_use]
    pub fn pending_chunk_len(&self) -> Option<u32> {
        match self.pull {
            Pull::AwaitingFrame(len) => Some(len),
            _ => None,
        }
    }

    /// Whether a pull was sent and not yet fully answered.
    #[must_use]
    pub fn is_pulling(&self) -> bool {
        self.pull != Pull::Parked
    }

    /// Total size announced by the device.
    #[must_use]
    pub fn size(&self) -> Option<u64> {
        self.size
    }

    #[must_use]
    pub fn received(&self) -> u64 {
        self.received
    }

    fn transition(&mut self, input: Input) -> bool {
        match self.phase.next(input) {
            Some(phase) => {
                trace!("stream {} -> {phase} on {input:?}", self.phase);
                self.phase = phase;
                true
            }
            None => false,
        }
    }

    /// Builds the start command and moves to `Requesting`.
    ///
    /// # Errors
    ///
    /// Returns `InvalidArgument` if the path is empty or tries to traverse
    /// upwards, and `FailedPrecondition` if the stream was already started.
    pub fn start(&mut self, fs: Filesystem, path: &str, chunk_size: u32) -> Result<Command> {
        if path.is_empty() {
            return Err(Error::invalid_argument("missing path"));
        }
        if path.contains("..") {
            return Err(Error::invalid_argument(format!("invalid path: {path}")));
        }
        if !self.transition(Input::Start) {
            return Err(Error::failed_precondition(format!(
                "cannot start stream in phase {}",
                self.phase
            )));
        }

        Ok(Command::start(fs, path, &self.mime_hint, chunk_size))
    }

    /// Handles a control reply.
    ///
    /// Returns `Ok(None)` for replies that carry nothing for this session,
    /// including out-of-place headers, which are logged and ignored.
    ///
    /// # Errors
    ///
    /// Returns the device failure if the reply reports one, or `DataLoss` if
    /// the device announced an empty chunk without end of file. Either way
    /// the stream is closed.
    pub fn on_reply(&mut self, reply: Reply) -> Result<Option<Progress>> {
        if let Some(e) = reply.failure() {
            self.transition(Input::Abort);
            return Err(e);
        }

        match reply {
            Reply::MusicStart { mime, size, .. } => {
                if !self.transition(Input::Acknowledged) {
                    warn!("ignoring start acknowledgement in phase {}", self.phase);
                    return Ok(None);
                }

                let mime = mime.unwrap_or_else(|| self.mime_hint.clone());
                if mime != self.mime_hint {
                    debug!("device negotiated {mime} instead of {}", self.mime_hint);
                }
                self.negotiated_mime = Some(mime.clone());
                self.size = size;
                Ok(Some(Progress::Started { mime, size }))
            }

            Reply::MusicChunk { len, eof, offset } => {
                if self.phase != Phase::Streaming || self.pull != Pull::AwaitingHeader {
                    warn!(
                        "ignoring chunk header without pull (phase {}, {:?})",
                        self.phase, self.pull
                    );
                    return Ok(None);
                }

                if eof {
                    self.pull = Pull::Parked;
                    self.transition(Input::EndOfFile);
                    debug!(
                        "end of file after {} chunks, {} bytes",
                        self.chunks, self.received
                    );
                    return Ok(Some(Progress::EndOfFile));
                }

                if len == 0 {
                    self.transition(Input::Abort);
                    return Err(Error::data_loss(format!(
                        "device sent empty chunk at offset {}",
                        offset.unwrap_or(self.received)
                    )));
                }

                self.pull = Pull::AwaitingFrame(len);
                Ok(Some(Progress::Announced { len }))
            }

            Reply::MusicStop | Reply::MediaAck { .. } | Reply::Other => Ok(None),
        }
    }

    /// Handles a binary frame. Returns the payload if it answers the
    /// outstanding header, or `None` if it is a protocol violation.
    pub fn on_frame(&mut self, frame: Vec<u8>) -> Option<Vec<u8>> {
        let Pull::AwaitingFrame(len) = self.pull else {
            warn!("ignoring {} byte frame without chunk header", frame.len());
            return None;
        };

        if frame.len() != len as usize {
            warn!(
                "ignoring {} byte frame, header announced {len} bytes",
                frame.len()
            );
            return None;
        }

        self.pull = Pull::Parked;
        self.received = self.received.saturating_add(frame.len() as u64);
        self.chunks = self.chunks.saturating_add(1);
        trace!("chunk {} received ({} bytes total)", self.chunks, self.received);
        Some(frame)
    }

    /// Builds the next pull command.
    ///
    /// Returns `None` unless the stream is streaming with no pull
    /// outstanding, so two pulls are never in flight at once.
    pub fn request_next(&mut self) -> Option<Command> {
        if self.phase != Phase::Streaming {
            trace!("not pulling in phase {}", self.phase);
            return None;
        }
        if self.pull != Pull::Parked {
            debug!("pull already outstanding ({:?})", self.pull);
            return None;
        }

        self.pull = Pull::AwaitingHeader;
        Some(Command::next(self.max_bytes))
    }

    /// Marks local assembly after end of file as complete.
    pub fn finish(&mut self) {
        if !self.transition(Input::Finished) {
            trace!("finish ignored in phase {}", self.phase);
        }
    }

    /// Closes the stream. Returns the stop command to send if the device may
    /// still hold state for it and the channel can carry it.
    pub fn stop(&mut self, channel_open: bool) -> Option<Command> {
        let was_started = matches!(
            self.phase,
            Phase::Requesting | Phase::Streaming | Phase::Draining
        );
        self.transition(Input::Abort);
        self.pull = Pull::Parked;
        (was_started && channel_open).then_some(Command::MusicStop)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn streaming() -> Stream {
        let mut stream = Stream::new("audio/mpeg", None);
        stream.start(Filesystem::Sd, "/music/a.mp3", 16384).unwrap();
        stream
            .on_reply(Reply::MusicStart {
                ok: true,
                mime: Some("audio/mpeg".to_owned()),
                chunk_size: Some(16384),
                size: Some(6),
            })
            .unwrap();
        stream
    }

    fn header(len: u32) -> Reply {
        Reply::MusicChunk {
            len,
            eof: false,
            offset: None,
        }
    }

    #[test]
    fn transition_table() {
        assert_eq!(Phase::Idle.next(Input::Start), Some(Phase::Requesting));
        assert_eq!(
            Phase::Requesting.next(Input::Acknowledged),
            Some(Phase::Streaming)
        );
        assert_eq!(
            Phase::Streaming.next(Input::EndOfFile),
            Some(Phase::Draining)
        );
        assert_eq!(Phase::Draining.next(Input::Finished), Some(Phase::Closed));
        assert_eq!(Phase::Closed.next(Input::Abort), Some(Phase::Closed));

        assert_eq!(Phase::Idle.next(Input::Acknowledged), None);
        assert_eq!(Phase::Requesting.next(Input::EndOfFile), None);
        assert_eq!(Phase::Closed.next(Input::Start), None);
    }

    #[test]
    fn rejects_traversal_paths() {
        let mut stream = Stream::new("audio/mpeg", None);
        assert!(stream.start(Filesystem::Sd, "/music/../secret", 4096).is_err());
        assert!(stream.start(Filesystem::Sd, "", 4096).is_err());
        assert_eq!(stream.phase(), Phase::Idle);
    }

    #[test]
    fn negotiated_mime_overrides_hint() {
        let mut stream = Stream::new("audio/mpeg", None);
        stream.start(Filesystem::Lfs, "a.mp3", 4096).unwrap();
        let progress = stream
            .on_reply(Reply::MusicStart {
                ok: true,
                mime: Some("audio/ogg".to_owned()),
                chunk_size: None,
                size: None,
            })
            .unwrap();

        assert_eq!(
            progress,
            Some(Progress::Started {
                mime: "audio/ogg".to_owned(),
                size: None
            })
        );
        assert_eq!(stream.negotiated_mime(), Some("audio/ogg"));
        assert_eq!(stream.phase(), Phase::Streaming);
    }

    #[test]
    fn failed_ack_closes_stream() {
        let mut stream = Stream::new("audio/mpeg", None);
        stream.start(Filesystem::Sd, "/a.mp3", 4096).unwrap();
        let result = stream.on_reply(Reply::MediaAck {
            ok: false,
            cmd: Some("music_start".to_owned()),
            error: Some("file_open_failed".to_owned()),
            detail: None,
        });

        assert!(result.is_err());
        assert_eq!(stream.phase(), Phase::Closed);
    }

    #[test]
    fn one_pull_at_a_time() {
        let mut stream = streaming();
        assert!(stream.request_next().is_some());
        assert!(stream.request_next().is_none());

        stream.on_reply(header(3)).unwrap();
        assert_eq!(stream.pending_chunk_len(), Some(3));
        assert!(stream.request_next().is_none());

        assert_eq!(stream.on_frame(vec![1, 2, 3]), Some(vec![1, 2, 3]));
        assert!(stream.request_next().is_some());
    }

    #[test]
    fn violations_are_ignored() {
        let mut stream = streaming();

        // Header without a pull.
        assert_eq!(stream.on_reply(header(3)).unwrap(), None);
        // Frame without a header.
        assert_eq!(stream.on_frame(vec![0; 3]), None);

        stream.request_next();
        stream.on_reply(header(3)).unwrap();
        // Frame of the wrong length leaves the pull outstanding.
        assert_eq!(stream.on_frame(vec![0; 2]), None);
        assert_eq!(stream.pending_chunk_len(), Some(3));
        assert_eq!(stream.received(), 0);
        assert_eq!(stream.phase(), Phase::Streaming);
    }

    #[test]
    fn empty_chunk_without_eof_is_fatal() {
        let mut stream = streaming();
        stream.request_next();
        assert!(stream.on_reply(header(0)).is_err());
        assert_eq!(stream.phase(), Phase::Closed);
    }

    #[test]
    fn eof_drains_then_closes() {
        let mut stream = streaming();
        stream.request_next();
        let progress = stream
            .on_reply(Reply::MusicChunk {
                len: 0,
                eof: true,
                offset: Some(6),
            })
            .unwrap();

        assert_eq!(progress, Some(Progress::EndOfFile));
        assert_eq!(stream.phase(), Phase::Draining);
        assert!(stream.request_next().is_none());

        stream.finish();
        assert_eq!(stream.phase(), Phase::Closed);
    }

    #[test]
    fn stop_only_sends_when_started_and_open() {
        let mut idle = Stream::new("audio/mpeg", None);
        assert_eq!(idle.stop(true), None);

        let mut stream = streaming();
        assert_eq!(stream.stop(false), None);

        let mut stream = streaming();
        assert_eq!(stream.stop(true), Some(Command::MusicStop));
        assert_eq!(stream.stop(true), None);
        assert_eq!(stream.phase(), Phase::Closed);
    }
}
