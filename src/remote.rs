//! WebSocket channels to the device media endpoint.
//!
//! [`WsTransport`] runs one task per session. The task connects, reports
//! [`ChannelEvent::Opened`], and from then on relays commands to the device
//! and frames back to the caller until either side closes. Every event is
//! tagged with the session it belongs to; the player decides whether it is
//! still interested.
//!
//! A channel closed while still connecting is shut down right after the
//! handshake completes, without reporting it as opened.

use std::collections::HashMap;

use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc::{self, error::TryRecvError};
use tokio_tungstenite::tungstenite::Message as WebsocketMessage;
use url::Url;

use crate::{
    error::{Error, Result},
    protocol::media::Command,
    sequencer::SessionId,
    transport::{ChannelEvent, Transport},
};

/// Events from all channels, tagged with their session.
pub type ChannelEvents = mpsc::UnboundedSender<(SessionId, ChannelEvent)>;

#[derive(Debug)]
enum Control {
    Send(String),
    Close,
}

#[derive(Debug)]
pub struct WsTransport {
    channels: HashMap<SessionId, mpsc::UnboundedSender<Control>>,
    event_tx: ChannelEvents,
}

impl WsTransport {
    #[must_use]
    pub fn new(event_tx: ChannelEvents) -> Self {
        Self {
            channels: HashMap::new(),
            event_tx,
        }
    }

    /// Number of channels not yet closed by the caller.
    #[must_use]
    pub fn len(&self) -> usize {
        self.channels.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.channels.is_empty()
    }
}

impl Transport for WsTransport {
    fn open(&mut self, session: SessionId, url: &Url) -> Result<()> {
        match url.scheme() {
            "ws" | "wss" => (),
            scheme => {
                return Err(Error::invalid_argument(format!(
                    "unsupported scheme for media channel: {scheme}"
                )))
            }
        }

        let (control_tx, control_rx) = mpsc::unbounded_channel();
        if let Some(previous) = self.channels.insert(session, control_tx) {
            let _ = previous.send(Control::Close);
        }

        debug!("session {session}: connecting to {}", url.host_str().unwrap_or_default());
        tokio::spawn(run(session, url.clone(), control_rx, self.event_tx.clone()));
        Ok(())
    }

    fn send(&mut self, session: SessionId, command: &Command) -> Result<()> {
        let text = command.to_text()?;
        let channel = self
            .channels
            .get(&session)
            .ok_or_else(|| Error::unavailable(format!("no channel for session {session}")))?;

        trace!("session {session}: sending {command}");
        channel
            .send(Control::Send(text))
            .map_err(|_| Error::unavailable(format!("channel of session {session} is gone")))
    }

    fn close(&mut self, session: SessionId) {
        if let Some(channel) = self.channels.remove(&session) {
            trace!("session {session}: closing channel");
            let _ = channel.send(Control::Close);
        }
    }
}

/// Drives one channel until it closes.
async fn run(
    session: SessionId,
    url: Url,
    mut control_rx: mpsc::UnboundedReceiver<Control>,
    event_tx: ChannelEvents,
) {
    let emit = |event: ChannelEvent| {
        if event_tx.send((session, event)).is_err() {
            trace!("session {session}: event receiver dropped");
        }
    };

    let (mut ws_tx, mut ws_rx) = match tokio_tungstenite::connect_async(url.as_str()).await {
        Ok((ws_stream, _)) => ws_stream.split(),
        Err(e) => {
            emit(ChannelEvent::Failed(e.to_string()));
            return;
        }
    };

    // Closed while connecting: hang up without ever reporting it open.
    let mut queued = Vec::new();
    loop {
        match control_rx.try_recv() {
            Ok(Control::Send(text)) => queued.push(text),
            Ok(Control::Close) | Err(TryRecvError::Disconnected) => {
                debug!("session {session}: closing channel that connected after stop");
                let _ = ws_tx.close().await;
                return;
            }
            Err(TryRecvError::Empty) => break,
        }
    }

    emit(ChannelEvent::Opened);
    for text in queued {
        if let Err(e) = ws_tx.send(WebsocketMessage::text(text)).await {
            emit(ChannelEvent::Failed(e.to_string()));
            return;
        }
    }

    loop {
        tokio::select! {
            control = control_rx.recv() => match control {
                Some(Control::Send(text)) => {
                    if let Err(e) = ws_tx.send(WebsocketMessage::text(text)).await {
                        emit(ChannelEvent::Failed(e.to_string()));
                        break;
                    }
                }
                Some(Control::Close) | None => {
                    if let Err(e) = ws_tx.close().await {
                        trace!("session {session}: close failed: {e}");
                    }
                    break;
                }
            },

            message = ws_rx.next() => match message {
                Some(Ok(WebsocketMessage::Text(text))) => {
                    emit(ChannelEvent::Text(text.as_str().to_owned()));
                }
                Some(Ok(WebsocketMessage::Binary(bytes))) => {
                    emit(ChannelEvent::Binary(bytes.to_vec()));
                }
                Some(Ok(WebsocketMessage::Close(frame))) => {
                    let reason = frame
                        .map(|frame| frame.reason.as_str().to_owned())
                        .filter(|reason| !reason.is_empty());
                    emit(ChannelEvent::Closed(reason));
                    break;
                }
                // Pings are answered by tungstenite on the next read or write.
                Some(Ok(_)) => trace!("session {session}: ignoring control frame"),
                Some(Err(e)) => {
                    emit(ChannelEvent::Failed(e.to_string()));
                    break;
                }
                None => {
                    emit(ChannelEvent::Closed(None));
                    break;
                }
            },
        }
    }

    trace!("session {session}: channel task done");
}
