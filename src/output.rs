//! Native audio output through rodio.
//!
//! [`RodioSink`] implements [`AudioSink`] on a rodio [`Sink`]. Appended
//! chunks go into a [`ChunkFeed`]; a decoder is built on a blocking thread
//! and queued on the sink once the download has prefetched enough, while
//! later chunks keep arriving underneath it.
//!
//! Sink events are sent over a channel tagged with the session the source
//! was opened under, including errors from sources that were detached in the
//! meantime. Only errors no source can be held responsible for go out
//! untagged.
//!
//! rodio does not report position or completion by itself, so the caller
//! drives [`RodioSink::poll`] periodically.

use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Mutex, OnceLock,
    },
    time::Duration,
};

use bytes::Bytes;
use rodio::{OutputStreamHandle, Sink};
use tokio::sync::mpsc;

use crate::{
    buffer::ChunkFeed,
    decoder::Decoder,
    error::{Error, Result},
    sequencer::SessionId,
    sink::{AudioSink, BlobId, SeekRejected, SeekableRange, SinkEvent},
    track::Codec,
};

/// Sink events, tagged with the session of the source they concern.
pub type SinkEvents = mpsc::UnboundedSender<(Option<SessionId>, SinkEvent)>;

/// Whether `codec` can be decoded from the front of a partial file.
///
/// MP4 keeps its index wherever the muxer put it, often at the end, and is
/// only played from complete downloads. Ogg is kept off the append path
/// until seeking in partial Ogg streams is dependable.
#[must_use]
pub fn is_progressive(codec: Codec) -> bool {
    matches!(codec, Codec::ADTS | Codec::FLAC | Codec::MP3 | Codec::WAV)
}

fn send(event_tx: &SinkEvents, session: Option<SessionId>, event: SinkEvent) {
    if event_tx.send((session, event)).is_err() {
        trace!("sink event receiver dropped");
    }
}

struct Source {
    session: SessionId,
    generation: u64,
    codec: Option<Codec>,
    feed: ChunkFeed,
    decoding: bool,
    /// Set by the decoder thread once the decoder is queued
    duration: Arc<OnceLock<Option<Duration>>>,
    seeked: bool,
    ended: bool,
}

pub struct RodioSink {
    sink: Arc<Sink>,

    /// Bumped on every detach so decoder threads can tell they are stale
    generation: Arc<Mutex<u64>>,
    /// Generation of the source the last seek was issued for
    seek_owner: Arc<AtomicU64>,
    prefetch: u64,
    event_tx: SinkEvents,

    source: Option<Source>,
    blobs: HashMap<BlobId, (Bytes, Option<Codec>)>,
    next_blob: u64,
}

impl RodioSink {
    /// Creates a paused sink on an output stream.
    ///
    /// Reads of an append source wait until `prefetch` bytes have arrived or
    /// the stream ends, whichever comes first.
    ///
    /// # Errors
    ///
    /// Returns an error if the output device rejects the sink.
    pub fn new(handle: &OutputStreamHandle, prefetch: usize, event_tx: SinkEvents) -> Result<Self> {
        let sink = Sink::try_new(handle)?;
        Ok(Self::with_sink(sink, prefetch, event_tx))
    }

    fn with_sink(sink: Sink, prefetch: usize, event_tx: SinkEvents) -> Self {
        sink.pause();

        Self {
            sink: Arc::new(sink),

            generation: Arc::new(Mutex::new(0)),
            seek_owner: Arc::new(AtomicU64::new(0)),
            prefetch: prefetch as u64,
            event_tx,

            source: None,
            blobs: HashMap::new(),
            next_blob: 1,
        }
    }

    fn emit(&self, event: SinkEvent) {
        let session = self.source.as_ref().map(|source| source.session);
        send(&self.event_tx, session, event);
    }

    fn attach(&mut self, session: SessionId, codec: Option<Codec>, feed: ChunkFeed) -> Result<()> {
        self.detach();
        let generation = *self.generation.lock()?;
        self.source = Some(Source {
            session,
            generation,
            codec,
            feed,
            decoding: false,
            duration: Arc::new(OnceLock::new()),
            seeked: false,
            ended: false,
        });
        Ok(())
    }

    /// Starts the download of the current source and builds its decoder on
    /// a blocking thread.
    fn decode(&mut self) -> Result<()> {
        let Some(source) = self.source.as_mut() else {
            return Ok(());
        };
        if source.decoding {
            return Ok(());
        }
        source.decoding = true;

        let session = source.session;
        let generation = source.generation;
        let codec = source.codec;
        let reader = source.feed.start(self.prefetch)?;
        let duration = Arc::clone(&source.duration);
        let current = Arc::clone(&self.generation);
        let seek_owner = Arc::clone(&self.seek_owner);
        let sink = Arc::clone(&self.sink);
        let event_tx = self.event_tx.clone();

        debug!("session {session}: starting decoder");
        tokio::spawn(async move {
            let reader = match reader.await {
                Ok(reader) => reader,
                Err(e) => {
                    send(&event_tx, Some(session), SinkEvent::Error(e.to_string()));
                    return;
                }
            };

            tokio::task::spawn_blocking(move || {
                let result = Decoder::new(codec, reader);
                let Ok(guard) = current.lock() else {
                    error!("session {session}: sink state poisoned");
                    return;
                };

                match result {
                    Ok(mut decoder) if *guard == generation => {
                        let total = rodio::Source::total_duration(&decoder);
                        let _ = duration.set(total);
                        decoder.guard_seeks(seek_owner, generation);
                        sink.append(decoder);
                        drop(guard);

                        send(&event_tx, Some(session), SinkEvent::LoadedMetadata { duration: total });
                        send(&event_tx, Some(session), SinkEvent::CanPlay);
                    }
                    Ok(_) => trace!("session {session}: dropping decoder of detached source"),
                    Err(e) => {
                        drop(guard);
                        send(&event_tx, Some(session), SinkEvent::Error(e.to_string()));
                    }
                }
            });
        });

        Ok(())
    }

    /// Reports the playback position and the end of the source.
    pub fn poll(&mut self) {
        let Some(source) = self.source.as_mut() else {
            return;
        };
        if source.ended || source.duration.get().is_none() {
            return;
        }

        if self.sink.empty() {
            source.ended = true;
            if source.feed.is_finished() {
                self.emit(SinkEvent::Ended);
            } else {
                self.emit(SinkEvent::Error(
                    "decoder stopped before end of stream".to_owned(),
                ));
            }
        } else if !self.sink.is_paused() {
            let position = self.sink.get_pos();
            self.emit(SinkEvent::TimeUpdate { position });
        }
    }
}

impl AudioSink for RodioSink {
    fn supports_progressive_append(&self, mime: &str) -> bool {
        Codec::from_mime(mime).is_some_and(is_progressive)
    }

    fn open_append(&mut self, session: SessionId, mime: &str, size: Option<u64>) -> Result<()> {
        let codec = Codec::from_mime(mime)
            .filter(|codec| is_progressive(*codec))
            .ok_or_else(|| Error::unimplemented(format!("cannot append {mime}")))?;

        self.attach(session, Some(codec), ChunkFeed::new(size))?;
        self.decode()?;
        self.emit(SinkEvent::SourceOpen);
        Ok(())
    }

    fn append(&mut self, bytes: Vec<u8>) -> Result<()> {
        let source = self
            .source
            .as_mut()
            .ok_or_else(|| Error::failed_precondition("no append source open"))?;
        source.feed.push(bytes.into())?;

        self.emit(SinkEvent::AppendComplete);
        Ok(())
    }

    fn end_of_stream(&mut self) -> Result<()> {
        let source = self
            .source
            .as_mut()
            .ok_or_else(|| Error::failed_precondition("no append source open"))?;
        source.feed.finish();
        Ok(())
    }

    fn create_blob(&mut self, payload: Vec<u8>, mime: &str) -> Result<BlobId> {
        if payload.is_empty() {
            return Err(Error::invalid_argument("empty payload"));
        }

        let blob = BlobId(self.next_blob);
        self.next_blob += 1;
        trace!("{blob}: {} bytes of {mime}", payload.len());
        self.blobs
            .insert(blob, (payload.into(), Codec::from_mime(mime)));
        Ok(blob)
    }

    fn attach_blob(&mut self, session: SessionId, blob: BlobId) -> Result<()> {
        let (payload, codec) = self
            .blobs
            .get(&blob)
            .cloned()
            .ok_or_else(|| Error::not_found(format!("{blob} not registered")))?;

        self.attach(session, codec, ChunkFeed::complete(payload))?;
        self.decode()
    }

    fn revoke_blob(&mut self, blob: BlobId) {
        if self.blobs.remove(&blob).is_some() {
            trace!("{blob} revoked");
        }
    }

    fn play(&mut self) -> Result<()> {
        if self.source.is_none() {
            return Err(Error::failed_precondition("nothing attached"));
        }
        self.sink.play();
        self.emit(SinkEvent::Playing);
        Ok(())
    }

    fn pause(&mut self) {
        self.sink.pause();
        if self.source.is_some() {
            self.emit(SinkEvent::Paused);
        }
    }

    /// Hands the seek to the audio thread and returns. Completion is
    /// reported as [`SinkEvent::Seeked`].
    fn seek(&mut self, position: Duration) -> std::result::Result<(), SeekRejected> {
        let range = self.seekable();
        let source = self.source.as_mut().ok_or(SeekRejected::NoSource)?;
        if source.duration.get().is_none() || range.is_some_and(|range| !range.contains(position)) {
            return Err(SeekRejected::NotBuffered);
        }

        source.seeked = true;
        let session = source.session;
        self.seek_owner.store(source.generation, Ordering::Release);

        // rodio blocks until the audio thread has applied the seek, which
        // may have to wait for the decoder's next read.
        let sink = Arc::clone(&self.sink);
        let event_tx = self.event_tx.clone();
        tokio::task::spawn_blocking(move || {
            let event = match sink.try_seek(position) {
                Ok(()) => SinkEvent::Seeked { position },
                Err(e) => {
                    warn!("session {session}: seek to {position:?} failed: {e}");
                    SinkEvent::TimeUpdate {
                        position: sink.get_pos(),
                    }
                }
            };
            send(&event_tx, Some(session), event);
        });

        Ok(())
    }

    fn seekable(&self) -> Option<SeekableRange> {
        let source = self.source.as_ref()?;
        let duration = (*source.duration.get()?)?;
        let progress = source.feed.progress()?;
        Some(SeekableRange::new(
            Duration::ZERO,
            duration.mul_f64(progress),
        ))
    }

    fn set_volume(&mut self, volume: f32) {
        self.sink.set_volume(volume);
    }

    fn detach(&mut self) {
        let source = self.source.take();
        if let Some(source) = &source {
            trace!("session {}: detaching source", source.session);
            // Clearing waits for the audio thread, which may be blocked in a
            // read of this source.
            source.feed.cancel();
        }

        match self.generation.lock() {
            Ok(mut generation) => {
                *generation += 1;
                self.sink.clear();

                // A seek order the cleared source never picked up would stay
                // with the sink, and so would the thread waiting on it.
                // Replacing it releases the waiter; the next source refuses
                // the replacement.
                if source.is_some_and(|source| source.seeked) && self.sink.empty() {
                    let _ = self.sink.try_seek(Duration::ZERO);
                }
            }
            Err(e) => error!("{e}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::{
        sync::atomic::AtomicBool,
        thread::{self, JoinHandle},
    };

    use rodio::queue::SourcesQueueOutput;

    use super::*;
    use crate::{sequencer::Sequencer, testing::wav};

    type Events = mpsc::UnboundedReceiver<(Option<SessionId>, SinkEvent)>;

    /// Stands in for the audio device, pulling samples as fast as it can.
    struct Output {
        stop: Arc<AtomicBool>,
        thread: Option<JoinHandle<()>>,
    }

    impl Output {
        fn drain(mut output: SourcesQueueOutput<f32>) -> Self {
            let stop = Arc::new(AtomicBool::new(false));
            let thread = thread::spawn({
                let stop = Arc::clone(&stop);
                move || while !stop.load(Ordering::Relaxed) && output.next().is_some() {}
            });
            Self {
                stop,
                thread: Some(thread),
            }
        }
    }

    impl Drop for Output {
        fn drop(&mut self) {
            self.stop.store(true, Ordering::Relaxed);
            if let Some(thread) = self.thread.take() {
                let _ = thread.join();
            }
        }
    }

    async fn wait_for(
        events: &mut Events,
        mut wanted: impl FnMut(Option<SessionId>, &SinkEvent) -> bool,
    ) -> bool {
        let wait = async {
            while let Some((session, event)) = events.recv().await {
                if wanted(session, &event) {
                    return true;
                }
            }
            false
        };
        tokio::time::timeout(Duration::from_secs(3), wait)
            .await
            .unwrap_or(false)
    }

    /// Plays the first 8 KiB of an 88 KiB file, so the decoder runs dry and
    /// blocks the output in a read.
    async fn underrun() -> (RodioSink, Output, Events, SessionId) {
        let (sink, output) = Sink::new_idle();
        let (event_tx, mut events) = mpsc::unbounded_channel();
        let mut sink = RodioSink::with_sink(sink, 4 * 1024, event_tx);
        let output = Output::drain(output);

        let session = Sequencer::new().begin();
        let file = wav(88 * 1024);
        sink.open_append(session, "audio/wav", Some(file.len() as u64))
            .unwrap();
        sink.append(file[..8 * 1024].to_vec()).unwrap();

        assert!(wait_for(&mut events, |_, event| *event == SinkEvent::CanPlay).await);
        sink.play().unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;

        (sink, output, events, session)
    }

    async fn detach_in_time(mut sink: RodioSink) -> RodioSink {
        let detached = tokio::task::spawn_blocking(move || {
            sink.detach();
            sink
        });
        tokio::time::timeout(Duration::from_secs(3), detached)
            .await
            .expect("detach blocked on the audio thread")
            .unwrap()
    }

    #[test]
    fn appends_only_front_decodable_codecs() {
        assert!(is_progressive(Codec::MP3));
        assert!(is_progressive(Codec::ADTS));
        assert!(is_progressive(Codec::FLAC));
        assert!(is_progressive(Codec::WAV));
        assert!(!is_progressive(Codec::MP4));
        assert!(!is_progressive(Codec::OGG));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn detach_returns_while_decoder_waits_for_data() {
        let (sink, _output, _events, _) = underrun().await;

        let sink = detach_in_time(sink).await;
        assert!(sink.seekable().is_none());
        assert!(sink.sink.empty());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn seek_returns_while_decoder_waits_for_data() {
        let (mut sink, _output, mut events, session) = underrun().await;

        // Nothing past the tail is offered while 80 KiB are missing.
        assert_eq!(
            sink.seekable(),
            Some(SeekableRange::new(Duration::ZERO, Duration::ZERO))
        );
        assert_eq!(
            sink.seek(Duration::from_millis(200)),
            Err(SeekRejected::NotBuffered)
        );

        let seek = tokio::task::spawn_blocking(move || {
            let result = sink.seek(Duration::ZERO);
            (sink, result)
        });
        let (sink, result) = tokio::time::timeout(Duration::from_secs(1), seek)
            .await
            .expect("seek blocked on the audio thread")
            .unwrap();
        assert_eq!(result, Ok(()));

        // The seek cannot complete until the source goes away, and then
        // reports to its own session.
        let _sink = detach_in_time(sink).await;
        assert!(
            wait_for(&mut events, |id, event| id == Some(session)
                && matches!(event, SinkEvent::Seeked { .. } | SinkEvent::TimeUpdate { .. }))
            .await
        );
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn blob_plays_to_the_end() {
        let (sink, output) = Sink::new_idle();
        let (event_tx, mut events) = mpsc::unbounded_channel();
        let mut sink = RodioSink::with_sink(sink, 4 * 1024, event_tx);
        let _output = Output::drain(output);

        let session = Sequencer::new().begin();
        let blob = sink.create_blob(wav(16 * 1024), "audio/wav").unwrap();
        sink.attach_blob(session, blob).unwrap();
        assert!(wait_for(&mut events, |_, event| *event == SinkEvent::CanPlay).await);

        // 4096 frames at 44.1 kHz, all of it seekable once downloaded.
        let duration = Duration::from_secs_f64(4096.0 / 44_100.0);
        let mut range = None;
        for _ in 0..100 {
            range = sink.seekable();
            if range.is_some_and(|range| range.end > Duration::ZERO) {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        let range = range.unwrap();
        assert_eq!(range.start, Duration::ZERO);
        assert!(range.end.abs_diff(duration) < Duration::from_millis(1));

        sink.play().unwrap();
        let mut ended = false;
        for _ in 0..100 {
            sink.poll();
            if sink.sink.empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        sink.poll();
        while let Ok((id, event)) = events.try_recv() {
            ended |= id == Some(session) && event == SinkEvent::Ended;
        }
        assert!(ended);
    }
}
