//! Session identifiers and staleness checks.
//!
//! Every track selection mints a new [`SessionId`]. Anything that happens
//! asynchronously on behalf of a session (channel messages, sink callbacks,
//! append completions) carries the id it was started under and is compared
//! against the live counter before it may have side effects.

use std::{fmt, num::NonZeroU64};

/// Identifier of one attempt to stream one track.
///
/// Ids are strictly increasing and never reused within a [`Sequencer`].
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SessionId(NonZeroU64);

impl SessionId {
    #[must_use]
    pub fn get(self) -> u64 {
        self.0.get()
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Monotonic session counter.
///
/// The counter starts at zero, meaning no session has ever been current.
#[derive(Clone, Debug, Default)]
pub struct Sequencer {
    current: u64,
}

impl Sequencer {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Mints a new session id and makes it current.
    ///
    /// All previously minted ids become stale the moment this returns.
    pub fn begin(&mut self) -> SessionId {
        self.current = self.current.saturating_add(1);
        trace!("session {} is now current", self.current);
        // Incremented from at least zero, so never zero.
        SessionId(NonZeroU64::new(self.current).unwrap_or(NonZeroU64::MIN))
    }

    /// Invalidates the current session without starting a new one.
    ///
    /// Used by an explicit stop: callbacks still in flight for the stopped
    /// session fail [`is_current`](Self::is_current) from here on.
    pub fn invalidate(&mut self) {
        let _ = self.begin();
    }

    #[must_use]
    pub fn is_current(&self, id: SessionId) -> bool {
        id.get() == self.current
    }

    /// Returns the current id, or `None` if no session was ever started.
    #[must_use]
    pub fn current(&self) -> Option<SessionId> {
        NonZeroU64::new(self.current).map(SessionId)
    }
}
