//! Teardown of a streaming session.
//!
//! Every exit path (track switch, stop, failure, shutdown) funnels through
//! [`reap`]. It takes the session out of its slot first, so a second call
//! finds nothing and does nothing.

use crate::{
    session::{Channel, StreamSession},
    sequencer::SessionId,
    sink::AudioSink,
    transport::Transport,
};

/// Releases everything held by the session in `slot`. Returns the id of the
/// reaped session, or `None` if there was nothing to reap.
///
/// Never fails: errors while sending the stop command are logged and
/// swallowed, as teardown also runs during error recovery.
pub fn reap<T, S>(slot: &mut Option<StreamSession>, transport: &mut T, sink: &mut S) -> Option<SessionId>
where
    T: Transport + ?Sized,
    S: AudioSink + ?Sized,
{
    let mut session = slot.take()?;
    let id = session.id;

    // While still connecting, the transport drops the channel as soon as it
    // opens, without a stop command.
    let open = session.channel == Channel::Open;
    if let Some(command) = session.stream.stop(open) {
        if let Err(e) = transport.send(id, &command) {
            debug!("session {id}: stop not sent: {e}");
        }
    }
    transport.close(id);
    session.channel = Channel::Closed;

    if let Some(blob) = session.pipeline.take_blob() {
        debug!("session {id}: revoking {blob}");
        sink.revoke_blob(blob);
    }

    sink.pause();
    sink.detach();

    debug!("session {id}: reaped");
    Some(id)
}
