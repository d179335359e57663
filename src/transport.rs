//! Message channel to the device media endpoint.
//!
//! One channel is opened per session. Channels carry text control records
//! and binary frames, delivered in send order and tagged with the session
//! they were opened for.

use std::fmt;

use url::Url;

use crate::{error::Result, protocol::media::Command, sequencer::SessionId};

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ChannelEvent {
    /// The channel finished connecting.
    Opened,
    Text(String),
    Binary(Vec<u8>),
    /// The peer closed the channel, optionally with a reason.
    Closed(Option<String>),
    Failed(String),
}

impl fmt::Display for ChannelEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Opened => write!(f, "opened"),
            Self::Text(text) => write!(f, "text ({} bytes)", text.len()),
            Self::Binary(bytes) => write!(f, "binary ({} bytes)", bytes.len()),
            Self::Closed(Some(reason)) => write!(f, "closed ({reason})"),
            Self::Closed(None) => write!(f, "closed"),
            Self::Failed(e) => write!(f, "failed ({e})"),
        }
    }
}

pub trait Transport {
    /// Starts connecting a channel for `session`. Completion is reported as
    /// [`ChannelEvent::Opened`].
    ///
    /// # Errors
    ///
    /// Returns an error if the connection cannot be initiated at all.
    fn open(&mut self, session: SessionId, url: &Url) -> Result<()>;

    /// Queues a command on the channel of `session`.
    ///
    /// # Errors
    ///
    /// Returns an error if the channel is gone.
    fn send(&mut self, session: SessionId, command: &Command) -> Result<()>;

    /// Closes the channel of `session`. A channel that is still connecting
    /// is closed as soon as it connects. Closing an unknown channel is a
    /// no-op.
    fn close(&mut self, session: SessionId);
}
