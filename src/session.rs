//! The one active streaming session.

use crate::{
    pipeline::{Mode, Pipeline},
    sequencer::SessionId,
    stream::Stream,
    track::TrackDescriptor,
};

/// State of the session's message channel.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Hash)]
pub enum Channel {
    #[default]
    Connecting,
    Open,
    Closed,
}

/// Everything owned by one attempt to stream one track.
///
/// Only the engine holds a session, and at most one at a time. Dropping out
/// of the engine's slot goes through the reaper.
#[derive(Debug)]
pub struct StreamSession {
    pub id: SessionId,
    pub track: TrackDescriptor,
    pub channel: Channel,
    pub stream: Stream,
    pub pipeline: Pipeline,
}

impl StreamSession {
    #[must_use]
    pub fn new(
        id: SessionId,
        track: TrackDescriptor,
        mode: Mode,
        max_bytes: Option<u32>,
    ) -> Self {
        let stream = Stream::new(track.mime_hint(), max_bytes);
        Self {
            id,
            track,
            channel: Channel::default(),
            stream,
            pipeline: Pipeline::new(mode),
        }
    }

    /// The mime type to feed the sink: negotiated if known, else the hint.
    #[must_use]
    pub fn mime(&self) -> &str {
        self.stream
            .negotiated_mime()
            .unwrap_or_else(|| self.stream.mime_hint())
    }
}
