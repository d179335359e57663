//! Track-streaming engine.
//!
//! The [`Player`] pulls a track from the device over a per-session message
//! channel and feeds it to an audio sink, either progressively or after
//! downloading it whole. It performs no I/O itself: the caller delivers
//! channel and sink events, tagged with the session they belong to, and the
//! player drives its [`Transport`] and [`AudioSink`] in response.
//!
//! # Sessions
//!
//! Every track selection mints a new session id. Events are checked against
//! the current id before anything else happens, so callbacks from a session
//! that was switched away from or stopped fall through as no-ops. At most one
//! session is held at a time and every exit path tears it down through the
//! reaper.
//!
//! # Failures
//!
//! A failure ends the current track: the session is reaped, the state moves
//! to `Errored` and an [`Event::Failed`] is sent. Nothing is retried and
//! playback does not advance on its own. Sink errors that arrive shortly
//! after an intentional stop are expected teardown noise and only logged.

use std::time::{Duration, Instant};

use tokio::sync::mpsc;
use url::Url;

use crate::{
    config::Config,
    error::{Error, Result},
    events::Event,
    pipeline::{Action, Mode},
    protocol::{
        self,
        media::{Filesystem, Reply},
    },
    reaper,
    seek::SeekController,
    sequencer::{Sequencer, SessionId},
    session::{Channel, StreamSession},
    sink::{AudioSink, SinkEvent},
    state::{self, CastState, Input, PlaybackState, Status},
    stream::{Phase, Progress},
    track::TrackDescriptor,
    transport::{ChannelEvent, Transport},
};

pub struct Player<T: Transport, S: AudioSink> {
    transport: T,
    sink: S,

    url: Url,
    fs: Filesystem,
    chunk_size: u32,
    max_bytes: Option<u32>,
    stop_grace: Duration,

    sequencer: Sequencer,
    session: Option<StreamSession>,
    /// Set while the sink holds a source that can play.
    playable: bool,

    tracks: Vec<TrackDescriptor>,
    current: Option<usize>,

    state: PlaybackState,
    seek: SeekController,
    stopped_at: Option<Instant>,

    event_tx: Option<mpsc::UnboundedSender<Event>>,
}

impl<T: Transport, S: AudioSink> Player<T, S> {
    /// Creates a stopped player.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration does not yield a valid media
    /// endpoint URL.
    pub fn new(config: &Config, transport: T, mut sink: S) -> Result<Self> {
        let url = config.media_url()?;
        let volume = config.volume.clamp(0.0, 1.0);
        sink.set_volume(volume);

        Ok(Self {
            transport,
            sink,

            url,
            fs: config.fs,
            chunk_size: config.chunk_size,
            max_bytes: config.max_bytes,
            stop_grace: config.stop_grace(),

            sequencer: Sequencer::new(),
            session: None,
            playable: false,

            tracks: Vec::new(),
            current: None,

            state: PlaybackState {
                volume,
                ..PlaybackState::default()
            },
            seek: SeekController::new(),
            stopped_at: None,

            event_tx: None,
        })
    }

    /// Registers a channel to receive playback events.
    pub fn register(&mut self, event_tx: mpsc::UnboundedSender<Event>) {
        self.event_tx = Some(event_tx);
    }

    fn notify(&self, event: Event) {
        if let Some(event_tx) = &self.event_tx {
            if let Err(e) = event_tx.send(event) {
                error!("failed to send event: {e}");
            }
        }
    }

    fn transition(&mut self, input: Input) {
        if self.state.apply(input) {
            self.notify(Event::PlaybackChanged {
                is_playing: self.state.is_playing,
                is_paused: self.state.is_paused,
            });
        }
    }

    #[must_use]
    pub fn state(&self) -> &PlaybackState {
        &self.state
    }

    #[must_use]
    pub fn tracks(&self) -> &[TrackDescriptor] {
        &self.tracks
    }

    /// Index of the selected track.
    #[must_use]
    pub fn current(&self) -> Option<usize> {
        self.current
    }

    /// Id of the active session, if any.
    #[must_use]
    pub fn session_id(&self) -> Option<SessionId> {
        self.session.as_ref().map(|session| session.id)
    }

    #[must_use]
    pub fn transport(&self) -> &T {
        &self.transport
    }

    #[must_use]
    pub fn sink(&self) -> &S {
        &self.sink
    }

    pub fn sink_mut(&mut self) -> &mut S {
        &mut self.sink
    }

    /// Position to display: the scrub preview while dragging, otherwise the
    /// playback time.
    #[must_use]
    pub fn display_time(&self) -> Duration {
        self.seek
            .preview_position()
            .and_then(|seconds| Duration::try_from_secs_f64(seconds.max(0.0)).ok())
            .unwrap_or(self.state.current_time)
    }

    /// Replaces the track list. The selected track keeps its selection if it
    /// is still listed.
    pub fn set_tracks(&mut self, tracks: Vec<TrackDescriptor>) {
        let selected = self
            .current
            .and_then(|index| self.tracks.get(index))
            .map(|track| track.storage_path.clone());
        self.current = selected.and_then(|path| {
            tracks
                .iter()
                .position(|track| track.storage_path == path)
        });

        info!("track list has {} tracks", tracks.len());
        self.tracks = tracks;
    }

    /// Starts streaming the track at `index`, superseding any current
    /// session. A superseded session is stopped as of `now`.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` if there is no track at `index`. Failures to
    /// stream the track are reported through the playback state instead.
    pub fn select(&mut self, index: usize, now: Instant) -> Result<()> {
        let track = self
            .tracks
            .get(index)
            .cloned()
            .ok_or_else(|| Error::not_found(format!("no track at index {index}")))?;

        // Mint first: from here on, anything the old session still has in
        // flight is stale.
        let id = self.sequencer.begin();
        if self.reap().is_some() {
            self.stopped_at = Some(now);
        }
        self.seek.reset();
        self.state.reset_track();
        self.state.user_paused = false;

        let mode = Mode::probe(&self.sink, track.mime_hint());
        info!("session {id}: streaming {track} using {mode}");

        self.session = Some(StreamSession::new(id, track, mode, self.max_bytes));
        self.current = Some(index);
        self.transition(Input::Select);
        self.notify(Event::TrackChanged { index });

        if let Err(e) = self.transport.open(id, &self.url) {
            self.fail(e);
        }

        Ok(())
    }

    /// Plays the selected track, starting it if it is not streaming.
    pub fn play(&mut self, now: Instant) {
        self.state.user_paused = false;

        if self.session.is_none() {
            let first = (!self.tracks.is_empty()).then_some(0);
            let Some(index) = self.current.or(first) else {
                info!("nothing to play");
                return;
            };
            if let Err(e) = self.select(index, now) {
                error!("{e}");
            }
            return;
        }

        if !self.playable {
            debug!("playback starts once enough data is buffered");
            // Back to waiting for the source.
            if self.state.status == Status::Paused {
                self.transition(Input::Select);
            }
            return;
        }

        if let Err(e) = self.sink.play() {
            self.fail(e);
        }
    }

    pub fn pause(&mut self) {
        if self.session.is_none() {
            return;
        }

        self.state.user_paused = true;
        if self.playable {
            self.sink.pause();
        } else {
            // No source yet to report the pause.
            self.transition(Input::Paused);
        }
    }

    pub fn toggle(&mut self, now: Instant) {
        if self.state.is_playing {
            self.pause();
        } else {
            self.play(now);
        }
    }

    /// Stops playback and tears down the session. Calling it again, or with
    /// nothing playing, changes nothing.
    pub fn stop(&mut self, now: Instant) {
        if self.session.is_none() && self.state.status == Status::Stopped {
            trace!("already stopped");
            return;
        }

        // Invalidate before closing, so callbacks racing the close are stale.
        self.sequencer.invalidate();
        self.stopped_at = Some(now);
        self.reap();
        self.seek.reset();
        self.transition(Input::Stop);
    }

    /// Selects the next track, wrapping around to the first.
    pub fn next(&mut self, now: Instant) {
        self.skip(true, now);
    }

    /// Selects the previous track, wrapping around to the last.
    pub fn previous(&mut self, now: Instant) {
        self.skip(false, now);
    }

    fn skip(&mut self, forward: bool, now: Instant) {
        match state::adjacent(self.current, self.tracks.len(), forward) {
            Some(index) => {
                if let Err(e) = self.select(index, now) {
                    error!("{e}");
                }
            }
            None => info!("no tracks to skip to"),
        }
    }

    /// Updates the scrub preview without seeking.
    pub fn preview_seek(&mut self, seconds: f64) {
        self.seek.preview(seconds);
    }

    /// Seeks to `seconds`, clamped to what the sink can reach. Returns the
    /// applied position, or `None` if the seek was deferred or dropped.
    ///
    /// A seek before the source can play is held until it can.
    pub fn seek(&mut self, seconds: f64) -> Option<Duration> {
        if self.session.is_none() {
            debug!("no source to seek in");
            self.seek.reset();
            return None;
        }
        if !self.playable {
            debug!("deferring seek to {seconds:.1}s until the source can play");
            self.seek.defer(seconds);
            return None;
        }

        let position = self
            .seek
            .commit(&mut self.sink, seconds, self.state.duration)?;
        self.state.current_time = position;
        Some(position)
    }

    /// Sets the volume, unless a cast receiver owns it. Returns whether the
    /// volume was applied.
    pub fn set_volume(&mut self, volume: f32) -> bool {
        if !self.state.volume_enabled() {
            info!("volume is controlled by the cast receiver");
            return false;
        }

        let volume = volume.clamp(0.0, 1.0);
        self.sink.set_volume(volume);
        self.state.volume = volume;
        true
    }

    pub fn set_cast_state(&mut self, cast_state: CastState) {
        if self.state.cast_state != cast_state {
            debug!("cast {} -> {cast_state}", self.state.cast_state);
            self.state.cast_state = cast_state;
            self.notify(Event::CastChanged(cast_state));
        }
    }

    /// Handles an event from the channel of session `id`.
    pub fn handle_channel(&mut self, id: SessionId, event: ChannelEvent) {
        if !self.is_current(id) {
            trace!("session {id}: dropping stale {event}");
            return;
        }

        if let Err(e) = self.on_channel(id, event) {
            self.fail(e);
        }
    }

    /// Handles a sink event, tagged with the session its source was opened
    /// or attached under.
    pub fn handle_sink(&mut self, id: Option<SessionId>, event: SinkEvent, now: Instant) {
        match (id, &event) {
            (Some(id), _) if !self.is_current(id) => {
                trace!("session {id}: dropping stale sink {event}");
                return;
            }
            (None, SinkEvent::Error(message)) => {
                // Sources torn down on stop report errors after detaching.
                if self
                    .stopped_at
                    .is_some_and(|at| now.saturating_duration_since(at) < self.stop_grace)
                {
                    debug!("ignoring sink error during stop: {message}");
                    return;
                }
            }
            (None, _) => {
                trace!("dropping untagged sink {event}");
                return;
            }
            _ => (),
        }

        if let Err(e) = self.on_sink(event, now) {
            self.fail(e);
        }
    }

    /// Tears down everything before exit.
    pub fn shutdown(&mut self, now: Instant) {
        self.stop(now);
    }

    fn is_current(&self, id: SessionId) -> bool {
        self.sequencer.is_current(id) && self.session_id() == Some(id)
    }

    fn reap(&mut self) -> Option<SessionId> {
        self.playable = false;
        reaper::reap(&mut self.session, &mut self.transport, &mut self.sink)
    }

    fn fail(&mut self, e: Error) {
        match self.session_id() {
            Some(id) => error!("session {id}: {e}"),
            None => error!("{e}"),
        }

        self.sequencer.invalidate();
        self.reap();
        self.seek.reset();
        self.state.last_error = Some(e.to_string());

        if self.state.status != Status::Errored {
            self.transition(Input::Fail);
            self.notify(Event::Failed);
        }
    }

    fn on_channel(&mut self, id: SessionId, event: ChannelEvent) -> Result<()> {
        let Some(session) = self.session.as_mut() else {
            return Ok(());
        };

        match event {
            ChannelEvent::Opened => {
                debug!("session {id}: channel open");
                session.channel = Channel::Open;
                let command =
                    session
                        .stream
                        .start(self.fs, &session.track.storage_path, self.chunk_size)?;
                self.transport.send(id, &command)
            }

            ChannelEvent::Text(text) => {
                let reply = protocol::json::<Reply>(&text, "media")
                    .map_err(|e| Error::data_loss(format!("malformed reply: {e}")))?;
                self.on_reply(id, reply)
            }

            ChannelEvent::Binary(frame) => {
                let Some(chunk) = session.stream.on_frame(frame) else {
                    return Ok(());
                };
                let action = session.pipeline.on_chunk(chunk);
                self.perform(action)
            }

            ChannelEvent::Closed(reason) => {
                session.channel = Channel::Closed;
                let reason = reason.unwrap_or_else(|| "no reason given".to_owned());
                match session.stream.phase() {
                    Phase::Draining | Phase::Closed => {
                        debug!("session {id}: channel closed after end of file ({reason})");
                        Ok(())
                    }
                    _ => Err(Error::unavailable(format!("channel closed: {reason}"))),
                }
            }

            ChannelEvent::Failed(e) => {
                session.channel = Channel::Closed;
                Err(Error::unavailable(format!("channel failed: {e}")))
            }
        }
    }

    fn on_reply(&mut self, id: SessionId, reply: Reply) -> Result<()> {
        let Some(session) = self.session.as_mut() else {
            return Ok(());
        };

        match session.stream.on_reply(reply)? {
            Some(Progress::Started { mime, size }) => {
                info!(
                    "session {id}: device streams {mime}{}",
                    size.map(|size| format!(" ({size} bytes)"))
                        .unwrap_or_default()
                );
                match session.pipeline.mode() {
                    Mode::ProgressiveAppend => self.sink.open_append(id, &mime, size),
                    Mode::BufferedDownload => {
                        let action = session.pipeline.on_started();
                        self.perform(action)
                    }
                }
            }

            Some(Progress::Announced { len }) => {
                trace!("session {id}: expecting {len} bytes");
                Ok(())
            }

            Some(Progress::EndOfFile) => {
                let action = session.pipeline.on_eof();
                self.perform(action)
            }

            None => Ok(()),
        }
    }

    fn on_sink(&mut self, event: SinkEvent, now: Instant) -> Result<()> {
        trace!("sink {event}");

        match event {
            SinkEvent::SourceOpen => {
                if let Some(session) = self.session.as_mut() {
                    let action = session.pipeline.on_source_open();
                    self.perform(action)?;
                }
            }

            SinkEvent::AppendComplete => {
                if let Some(session) = self.session.as_mut() {
                    let action = session.pipeline.on_append_complete();
                    self.perform(action)?;
                }
                self.retry_seek();
            }

            SinkEvent::CanPlay => {
                self.playable = self.session.is_some();
                self.retry_seek();
                if self.playable
                    && self.state.status == Status::Connecting
                    && !self.state.user_paused
                {
                    self.sink.play()?;
                }
            }

            SinkEvent::LoadedMetadata { duration } => {
                self.state.duration = duration
                    .or_else(|| self.sink.seekable().map(|range| range.end))
                    .filter(|duration| *duration > Duration::ZERO);
                debug!("duration {:?}", self.state.duration);
            }

            SinkEvent::TimeUpdate { position } => {
                self.state.current_time = position;
                if self.state.duration.is_none() {
                    self.state.duration = self.sink.seekable().map(|range| range.end);
                }
            }

            SinkEvent::Seeked { position } => {
                debug!("seek to {:.1}s applied", position.as_secs_f64());
                self.state.current_time = position;
            }

            SinkEvent::Playing => {
                self.state.user_paused = false;
                self.transition(Input::Playing);
            }

            SinkEvent::Paused => self.transition(Input::Paused),

            SinkEvent::Ended => self.on_ended(now),

            SinkEvent::Error(message) => {
                return Err(Error::data_loss(format!("audio output failed: {message}")));
            }
        }

        Ok(())
    }

    fn on_ended(&mut self, now: Instant) {
        if !self.state.status.advances() {
            return;
        }

        let finished = self.current;
        self.reap();
        self.transition(Input::Ended);

        match state::adjacent(finished, self.tracks.len(), true) {
            Some(index) => {
                debug!("advancing to track {index}");
                if let Err(e) = self.select(index, now) {
                    error!("{e}");
                }
            }
            None => info!("end of track list"),
        }
    }

    fn retry_seek(&mut self) {
        if self.seek.pending().is_none() {
            return;
        }
        if let Some(position) = self.seek.retry(&mut self.sink, self.state.duration) {
            self.state.current_time = position;
        }
    }

    /// Carries out a pipeline action for the current session.
    fn perform(&mut self, action: Action) -> Result<()> {
        let Some(session) = self.session.as_mut() else {
            return Ok(());
        };
        let id = session.id;

        match action {
            Action::Nothing => (),

            Action::Pull => {
                if let Some(command) = session.stream.request_next() {
                    self.transport.send(id, &command)?;
                }
            }

            Action::Append(chunk) => {
                trace!("session {id}: appending {} bytes", chunk.len());
                self.sink.append(chunk)?;
            }

            Action::EndOfStream => {
                debug!("session {id}: end of stream");
                self.sink.end_of_stream()?;
                session.stream.finish();
            }

            Action::Attach(payload) => {
                debug!("session {id}: assembled {} bytes", payload.len());
                let blob = self.sink.create_blob(payload, session.mime())?;
                session.pipeline.set_blob(blob);
                self.sink.attach_blob(id, blob)?;
                session.stream.finish();

                self.playable = true;
                if !self.state.user_paused {
                    self.sink.play()?;
                }
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        error::ErrorKind,
        protocol::media::Command,
        sink::SeekableRange,
        testing::{MockSink, MockTransport, SinkCall},
    };

    type TestPlayer = Player<MockTransport, MockSink>;

    fn track(name: &str) -> TrackDescriptor {
        TrackDescriptor {
            display_name: name.to_owned(),
            storage_path: format!("/music/{name}"),
            size_bytes: 6,
        }
    }

    fn player() -> (TestPlayer, mpsc::UnboundedReceiver<Event>) {
        let mut player = Player::new(
            &Config::default(),
            MockTransport::default(),
            MockSink::default(),
        )
        .unwrap();
        player.set_tracks(vec![track("a.mp3"), track("b.mp3"), track("c.ogg")]);

        let (event_tx, event_rx) = mpsc::unbounded_channel();
        player.register(event_tx);
        (player, event_rx)
    }

    fn events(event_rx: &mut mpsc::UnboundedReceiver<Event>) -> Vec<Event> {
        let mut events = Vec::new();
        while let Ok(event) = event_rx.try_recv() {
            events.push(event);
        }
        events
    }

    fn text(json: &str) -> ChannelEvent {
        ChannelEvent::Text(json.to_owned())
    }

    fn ack(mime: &str) -> ChannelEvent {
        text(&format!(
            r#"{{"type":"music_start","ok":true,"mime":"{mime}","size":6}}"#
        ))
    }

    fn header(len: usize) -> ChannelEvent {
        text(&format!(
            r#"{{"type":"music_chunk","ok":true,"len":{len},"eof":false}}"#
        ))
    }

    fn eof() -> ChannelEvent {
        text(r#"{"type":"music_chunk","ok":true,"len":0,"eof":true}"#)
    }

    /// Selects `index` and drives the session up to the first pull.
    fn start(player: &mut TestPlayer, index: usize, now: Instant) -> SessionId {
        player.select(index, now).unwrap();
        let id = player.session_id().unwrap();
        player.handle_channel(id, ChannelEvent::Opened);

        let mime = player.tracks()[index].mime_hint();
        player.handle_channel(id, ack(mime));
        if player.sink().supports_progressive_append(mime) {
            player.handle_sink(Some(id), SinkEvent::SourceOpen, now);
        }
        id
    }

    /// Delivers one chunk in response to an outstanding pull.
    fn chunk(player: &mut TestPlayer, id: SessionId, bytes: &[u8]) {
        player.handle_channel(id, header(bytes.len()));
        player.handle_channel(id, ChannelEvent::Binary(bytes.to_vec()));
    }

    // ========================================
    // Sessions
    // ========================================

    #[test]
    fn start_command_follows_open() {
        let (mut player, _) = player();
        player.select(0, Instant::now()).unwrap();
        let id = player.session_id().unwrap();

        assert_eq!(player.transport().opened, vec![id]);
        assert!(player.transport().sent.is_empty());

        player.handle_channel(id, ChannelEvent::Opened);
        assert_eq!(
            player.transport().sent_to(id),
            vec![&Command::start(
                Filesystem::Sd,
                "/music/a.mp3",
                "audio/mpeg",
                16 * 1024
            )]
        );
        assert_eq!(player.state().status, Status::Connecting);
    }

    #[test]
    fn switching_tracks_drops_stale_session() {
        let now = Instant::now();
        let (mut player, _) = player();

        let a = start(&mut player, 0, now);
        chunk(&mut player, a, &[1, 1]);
        player.handle_sink(Some(a), SinkEvent::AppendComplete, now);

        // B is selected before A's second chunk arrives.
        player.select(1, now).unwrap();
        let b = player.session_id().unwrap();
        assert_ne!(a, b);
        assert!(player.transport().closed.contains(&a));

        chunk(&mut player, a, &[2, 2]);
        player.handle_sink(Some(a), SinkEvent::AppendComplete, now);
        chunk(&mut player, a, &[3, 3]);
        player.handle_channel(a, eof());
        player.handle_sink(Some(a), SinkEvent::Ended, now);

        assert_eq!(player.sink().appended(), vec![vec![1, 1]]);
        assert_eq!(player.current(), Some(1));

        player.handle_channel(b, ChannelEvent::Opened);
        player.handle_channel(b, ack("audio/mpeg"));
        player.handle_sink(Some(b), SinkEvent::SourceOpen, now);
        chunk(&mut player, b, &[9]);

        assert_eq!(player.sink().appended(), vec![vec![1, 1], vec![9]]);
        assert_eq!(
            player.sink().count(&SinkCall::OpenAppend(b, "audio/mpeg".to_owned())),
            1
        );
        assert_eq!(player.state().status, Status::Connecting);
    }

    #[test]
    fn stop_while_connecting_sends_nothing() {
        let now = Instant::now();
        let (mut player, mut event_rx) = player();
        player.select(0, now).unwrap();
        let id = player.session_id().unwrap();

        player.stop(now);
        player.handle_channel(id, ChannelEvent::Opened);
        player.handle_channel(id, ChannelEvent::Closed(None));

        assert!(player.transport().sent.is_empty());
        assert_eq!(player.transport().closed, vec![id]);
        assert_eq!(player.state().status, Status::Stopped);
        assert_eq!(player.state().last_error, None);
        assert!(!events(&mut event_rx).contains(&Event::Failed));
    }

    #[test]
    fn stop_is_idempotent() {
        let now = Instant::now();
        let (mut player, mut event_rx) = player();
        start(&mut player, 0, now);
        events(&mut event_rx);

        player.stop(now);
        let calls = player.sink().calls.clone();
        let closed = player.transport().closed.clone();
        let sent = player.transport().sent.clone();
        let state = player.state().clone();
        let after_first = events(&mut event_rx);

        player.stop(now);
        assert_eq!(player.sink().calls, calls);
        assert_eq!(player.transport().closed, closed);
        assert_eq!(player.transport().sent, sent);
        assert_eq!(*player.state(), state);
        assert!(events(&mut event_rx).is_empty());

        assert_eq!(
            after_first,
            vec![Event::PlaybackChanged {
                is_playing: false,
                is_paused: false
            }]
        );
        assert_eq!(
            sent.last().map(|(_, command)| command),
            Some(&Command::MusicStop)
        );
    }

    #[test]
    fn stop_on_idle_player_is_a_no_op() {
        let (mut player, mut event_rx) = player();
        player.stop(Instant::now());

        assert!(player.transport().closed.is_empty());
        assert!(player.sink().calls.iter().all(|call| matches!(call, SinkCall::SetVolume(_))));
        assert!(events(&mut event_rx).is_empty());
    }

    // ========================================
    // Progressive append
    // ========================================

    #[test]
    fn pulls_wait_for_append_completion() {
        let now = Instant::now();
        let (mut player, _) = player();
        let id = start(&mut player, 0, now);
        assert_eq!(player.transport().pulls(id), 1);

        chunk(&mut player, id, &[1, 2]);
        assert_eq!(player.transport().pulls(id), 1);

        player.handle_sink(Some(id), SinkEvent::AppendComplete, now);
        assert_eq!(player.transport().pulls(id), 2);

        chunk(&mut player, id, &[3]);
        assert_eq!(player.transport().pulls(id), 2);
        player.handle_sink(Some(id), SinkEvent::AppendComplete, now);
        assert_eq!(player.transport().pulls(id), 3);

        player.handle_channel(id, eof());
        assert_eq!(player.sink().count(&SinkCall::EndOfStream), 1);
        assert_eq!(player.transport().pulls(id), 3);
        assert_eq!(player.sink().appended(), vec![vec![1, 2], vec![3]]);
    }

    #[test]
    fn playback_starts_when_sink_can_play() {
        let now = Instant::now();
        let (mut player, mut event_rx) = player();
        let id = start(&mut player, 0, now);
        chunk(&mut player, id, &[1, 2]);

        player.handle_sink(Some(id), SinkEvent::CanPlay, now);
        assert_eq!(player.sink().count(&SinkCall::Play), 1);

        player.handle_sink(Some(id), SinkEvent::Playing, now);
        assert!(player.state().is_playing);
        assert!(events(&mut event_rx).contains(&Event::PlaybackChanged {
            is_playing: true,
            is_paused: false
        }));
    }

    #[test]
    fn user_pause_holds_back_autoplay() {
        let now = Instant::now();
        let (mut player, _) = player();
        let id = start(&mut player, 0, now);

        player.pause();
        assert!(player.state().is_paused);

        player.handle_sink(Some(id), SinkEvent::CanPlay, now);
        assert_eq!(player.sink().count(&SinkCall::Play), 0);
    }

    #[test]
    fn rejected_negotiated_mime_fails_session() {
        let (mut player, mut event_rx) = player();
        player.select(0, Instant::now()).unwrap();
        let id = player.session_id().unwrap();
        player.handle_channel(id, ChannelEvent::Opened);

        // Probed as progressive for mp3, but the device negotiates mp4.
        player.handle_channel(id, ack("audio/mp4"));

        assert_eq!(player.state().status, Status::Errored);
        assert_eq!(player.session_id(), None);
        assert!(events(&mut event_rx).contains(&Event::Failed));
    }

    // ========================================
    // Buffered download
    // ========================================

    #[test]
    fn buffered_download_plays_after_eof_only() {
        let now = Instant::now();
        let (mut player, _) = player();
        let id = start(&mut player, 2, now);

        assert!(!player
            .sink()
            .calls
            .iter()
            .any(|call| matches!(call, SinkCall::OpenAppend(..))));

        chunk(&mut player, id, &[1, 2]);
        chunk(&mut player, id, &[3]);
        chunk(&mut player, id, &[4, 5, 6]);
        assert_eq!(player.transport().pulls(id), 4);
        assert_eq!(player.sink().count(&SinkCall::Play), 0);
        assert!(player.sink().blobs.is_empty());

        player.handle_channel(id, eof());

        assert_eq!(player.sink().blobs.len(), 1);
        assert_eq!(player.sink().blobs[0].1, vec![1, 2, 3, 4, 5, 6]);
        let blob = player.sink().blobs[0].0;
        let attach = player.sink().position(&SinkCall::AttachBlob(id, blob));
        let play = player.sink().position(&SinkCall::Play);
        assert!(attach.is_some() && play > attach);
    }

    #[test]
    fn blob_is_revoked_exactly_once() {
        let now = Instant::now();
        let (mut player, _) = player();
        let id = start(&mut player, 2, now);
        chunk(&mut player, id, &[1]);
        player.handle_channel(id, eof());
        let blob = player.sink().blobs[0].0;

        player.stop(now);
        player.stop(now);
        player.next(now);

        assert_eq!(player.sink().count(&SinkCall::RevokeBlob(blob)), 1);
    }

    #[test]
    fn close_after_eof_is_benign() {
        let now = Instant::now();
        let (mut player, _) = player();
        let id = start(&mut player, 2, now);
        chunk(&mut player, id, &[1]);
        player.handle_channel(id, eof());
        player.handle_channel(id, ChannelEvent::Closed(None));

        assert_eq!(player.state().status, Status::Connecting);
        assert_eq!(player.state().last_error, None);
    }

    #[test]
    fn switching_buffered_tracks_drops_stale_download() {
        let now = Instant::now();
        let (mut player, _) = player();
        player.set_tracks(vec![track("c.ogg"), track("d.ogg")]);

        let a = start(&mut player, 0, now);
        chunk(&mut player, a, &[1, 1]);

        player.select(1, now).unwrap();
        let b = player.session_id().unwrap();
        assert!(player.transport().closed.contains(&a));

        chunk(&mut player, a, &[2, 2]);
        player.handle_channel(a, eof());
        player.handle_sink(Some(a), SinkEvent::CanPlay, now);
        assert!(player.sink().blobs.is_empty());
        assert_eq!(player.sink().count(&SinkCall::Play), 0);

        player.handle_channel(b, ChannelEvent::Opened);
        player.handle_channel(b, ack("audio/ogg"));
        chunk(&mut player, b, &[7]);
        player.handle_channel(b, eof());

        assert_eq!(player.sink().blobs.len(), 1);
        assert_eq!(player.sink().blobs[0].1, vec![7]);
        let blob = player.sink().blobs[0].0;
        assert_eq!(player.sink().count(&SinkCall::AttachBlob(b, blob)), 1);
        assert_eq!(player.current(), Some(1));
    }

    // ========================================
    // Failures
    // ========================================

    #[test]
    fn refused_channel_fails_session() {
        let mut player = Player::new(
            &Config::default(),
            MockTransport {
                refuse_open: true,
                ..MockTransport::default()
            },
            MockSink::default(),
        )
        .unwrap();
        player.set_tracks(vec![track("a.mp3")]);
        let (event_tx, mut event_rx) = mpsc::unbounded_channel();
        player.register(event_tx);

        assert!(player.select(0, Instant::now()).is_ok());

        assert_eq!(player.state().status, Status::Errored);
        assert_eq!(player.session_id(), None);
        assert!(player
            .state()
            .last_error
            .as_deref()
            .is_some_and(|e| e.contains("refused")));
        assert!(events(&mut event_rx).contains(&Event::Failed));
        assert!(player.transport().opened.is_empty());
    }

    #[test]
    fn stale_decoder_error_spares_next_session() {
        let now = Instant::now();
        let (mut player, mut event_rx) = player();
        let a = start(&mut player, 0, now);

        player.select(1, now).unwrap();
        let b = player.session_id().unwrap();
        player.handle_channel(b, ChannelEvent::Opened);
        events(&mut event_rx);

        // Past the grace window of the switch.
        let late = now + Duration::from_secs(2);
        player.handle_sink(Some(a), SinkEvent::Error("input aborted".to_owned()), late);

        assert_eq!(player.session_id(), Some(b));
        assert_eq!(player.state().status, Status::Connecting);
        assert_eq!(player.state().last_error, None);
        assert!(!events(&mut event_rx).contains(&Event::Failed));
    }

    #[test]
    fn failed_ack_errors_without_advancing() {
        let now = Instant::now();
        let (mut player, mut event_rx) = player();
        player.select(0, now).unwrap();
        let id = player.session_id().unwrap();
        player.handle_channel(id, ChannelEvent::Opened);
        player.handle_channel(
            id,
            text(r#"{"ok":false,"type":"media_ack","cmd":"music_start","error":"file_open_failed"}"#),
        );

        assert_eq!(player.state().status, Status::Errored);
        assert!(player.state().last_error.is_some());
        assert!(events(&mut event_rx).contains(&Event::Failed));

        player.handle_sink(Some(id), SinkEvent::Ended, now);
        assert_eq!(player.current(), Some(0));
        assert_eq!(player.session_id(), None);
    }

    #[test]
    fn malformed_reply_aborts() {
        let (mut player, _) = player();
        player.select(0, Instant::now()).unwrap();
        let id = player.session_id().unwrap();
        player.handle_channel(id, ChannelEvent::Opened);
        player.handle_channel(id, text("{not json"));

        assert_eq!(player.state().status, Status::Errored);
        assert!(player.transport().closed.contains(&id));
    }

    #[test]
    fn unexpected_close_fails_session() {
        let now = Instant::now();
        let (mut player, _) = player();
        let id = start(&mut player, 0, now);
        player.handle_channel(id, ChannelEvent::Closed(Some("going away".to_owned())));

        assert_eq!(player.state().status, Status::Errored);
    }

    #[test]
    fn sink_errors_during_stop_are_suppressed() {
        let now = Instant::now();
        let (mut player, mut event_rx) = player();
        let id = start(&mut player, 0, now);
        player.stop(now);
        events(&mut event_rx);

        let soon = now + Duration::from_millis(100);
        player.handle_sink(Some(id), SinkEvent::Error("aborted".to_owned()), soon);
        player.handle_sink(None, SinkEvent::Error("aborted".to_owned()), soon);
        assert_eq!(player.state().status, Status::Stopped);
        assert!(events(&mut event_rx).is_empty());

        let late = now + Duration::from_secs(2);
        player.handle_sink(None, SinkEvent::Error("device lost".to_owned()), late);
        assert_eq!(player.state().status, Status::Errored);
        assert!(events(&mut event_rx).contains(&Event::Failed));
    }

    #[test]
    fn unknown_index_is_not_found() {
        let (mut player, _) = player();
        let e = player.select(7, Instant::now()).unwrap_err();
        assert_eq!(e.kind, ErrorKind::NotFound);
        assert!(player.transport().opened.is_empty());
    }

    // ========================================
    // Transport controls
    // ========================================

    #[test]
    fn ended_wraps_to_first_track() {
        let now = Instant::now();
        let (mut player, mut event_rx) = player();
        let id = start(&mut player, 2, now);
        chunk(&mut player, id, &[1]);
        player.handle_channel(id, eof());
        player.handle_sink(Some(id), SinkEvent::Playing, now);

        player.handle_sink(Some(id), SinkEvent::Ended, now);

        assert_eq!(player.current(), Some(0));
        assert_eq!(player.state().status, Status::Connecting);
        assert!(events(&mut event_rx).contains(&Event::TrackChanged { index: 0 }));
    }

    #[test]
    fn skip_wraps_both_ways() {
        let (mut player, _) = player();
        player.previous(Instant::now());
        assert_eq!(player.current(), Some(2));
        player.next(Instant::now());
        assert_eq!(player.current(), Some(0));
        player.previous(Instant::now());
        assert_eq!(player.current(), Some(2));
    }

    #[test]
    fn casting_disables_local_volume() {
        let (mut player, mut event_rx) = player();
        assert!(player.set_volume(0.5));
        assert_eq!(player.state().volume, 0.5);

        player.set_cast_state(CastState::Connected);
        assert!(!player.set_volume(0.1));
        assert_eq!(player.state().volume, 0.5);
        assert_eq!(player.sink().count(&SinkCall::SetVolume(0.1)), 0);
        assert!(events(&mut event_rx).contains(&Event::CastChanged(CastState::Connected)));
    }

    // ========================================
    // Seeking
    // ========================================

    fn playable(player: &mut TestPlayer, now: Instant) -> SessionId {
        let id = start(player, 0, now);
        chunk(player, id, &[1, 2]);
        player.handle_sink(Some(id), SinkEvent::CanPlay, now);
        id
    }

    #[test]
    fn seek_clamps_to_seekable_end() {
        let now = Instant::now();
        let (mut player, _) = player();
        playable(&mut player, now);
        player.sink_mut().seekable = Some(SeekableRange::new(
            Duration::ZERO,
            Duration::from_secs(42),
        ));

        player.preview_seek(90.0);
        assert_eq!(player.display_time(), Duration::from_secs(90));
        assert!(player.sink().seeks().is_empty());

        assert_eq!(player.seek(90.0), Some(Duration::from_secs(42)));
        assert_eq!(player.sink().seeks(), vec![Duration::from_secs(42)]);
        assert_eq!(player.display_time(), Duration::from_secs(42));
    }

    #[test]
    fn seek_waits_for_buffered_data() {
        let now = Instant::now();
        let (mut player, _) = player();
        let id = playable(&mut player, now);
        player.sink_mut().buffered_until = Some(Duration::from_secs(5));

        assert_eq!(player.seek(30.0), None);
        assert!(player.sink().seeks().is_empty());

        player.sink_mut().buffered_until = Some(Duration::from_secs(60));
        player.handle_sink(Some(id), SinkEvent::AppendComplete, now);
        assert_eq!(player.sink().seeks(), vec![Duration::from_secs(30)]);
        assert_eq!(player.state().current_time, Duration::from_secs(30));
    }

    #[test]
    fn seek_before_playable_waits_for_source() {
        let now = Instant::now();
        let (mut player, _) = player();
        let id = start(&mut player, 2, now);
        chunk(&mut player, id, &[1, 2]);

        assert_eq!(player.seek(5.0), None);
        assert!(player.sink().seeks().is_empty());

        player.handle_channel(id, eof());
        player.handle_sink(
            Some(id),
            SinkEvent::LoadedMetadata {
                duration: Some(Duration::from_secs(60)),
            },
            now,
        );
        player.handle_sink(Some(id), SinkEvent::CanPlay, now);

        assert_eq!(player.sink().seeks(), vec![Duration::from_secs(5)]);
        assert_eq!(player.state().current_time, Duration::from_secs(5));
    }

    #[test]
    fn seeked_event_moves_playback_time() {
        let now = Instant::now();
        let (mut player, _) = player();
        let id = playable(&mut player, now);

        player.handle_sink(
            Some(id),
            SinkEvent::Seeked {
                position: Duration::from_secs(7),
            },
            now,
        );
        assert_eq!(player.state().current_time, Duration::from_secs(7));
        assert_eq!(player.display_time(), Duration::from_secs(7));
    }

    #[test]
    fn seek_without_source_is_dropped() {
        let (mut player, _) = player();
        assert_eq!(player.seek(10.0), None);
        assert!(player.sink().seeks().is_empty());
    }

    #[test]
    fn unbounded_duration_falls_back_to_seekable_end() {
        let now = Instant::now();
        let (mut player, _) = player();
        let id = playable(&mut player, now);
        player.sink_mut().seekable = Some(SeekableRange::new(
            Duration::ZERO,
            Duration::from_secs(12),
        ));

        player.handle_sink(Some(id), SinkEvent::LoadedMetadata { duration: None }, now);
        assert_eq!(player.state().duration, Some(Duration::from_secs(12)));
    }
}
