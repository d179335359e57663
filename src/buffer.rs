//! Chunk-fed downloads backing playback.
//!
//! The device delivers a track in pulled chunks. A [`ChunkFeed`] hands them
//! to a `stream-download` task through a channel; the task stores them in
//! memory and serves a blocking [`ChunkReader`] to the decoder. Reads past
//! the received data wait until more arrives, the feed finishes, or the feed
//! is cancelled on teardown.
//!
//! # Example
//!
//! ```no_run
//! use std::io::Read;
//! use espwifi_player::{buffer::ChunkFeed, error::Error};
//!
//! # async fn example() -> espwifi_player::error::Result<()> {
//! let mut feed = ChunkFeed::new(Some(6));
//! let reader = feed.start(0)?;
//!
//! feed.push(vec![1, 2, 3].into())?;
//! feed.push(vec![4, 5, 6].into())?;
//! feed.finish();
//!
//! let mut reader = reader.await?;
//! let bytes = tokio::task::spawn_blocking(move || {
//!     let mut bytes = Vec::new();
//!     reader.read_to_end(&mut bytes).map(|_| bytes)
//! })
//! .await
//! .map_err(Error::internal)??;
//! assert_eq!(bytes, vec![1, 2, 3, 4, 5, 6]);
//! # Ok(())
//! # }
//! ```

use std::{
    convert::Infallible,
    future::{self, Future},
    io::{self, Read, Seek, SeekFrom},
    pin::Pin,
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc,
    },
    task::{Context, Poll},
    time::Duration,
};

use bytes::Bytes;
use futures_util::Stream;
use stream_download::{
    source::SourceStream, storage::memory::MemoryStorageProvider, Settings, StreamDownload,
    StreamPhase, StreamState,
};
use symphonia::core::io::MediaSource;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::error::{Error, Result};

/// Read size the decoder is set up for (32 KiB).
///
/// Symphonia reads sequentially in increasing chunks up to 32 KiB.
pub const BUFFER_LEN: usize = 32 * 1024;

/// Received bytes at the download front that are not offered for seeking.
///
/// Symphonia keeps up to this much read ahead of the packet it decodes.
pub const TAIL_LEN: u64 = 2 * BUFFER_LEN as u64;

/// How long the feed may go without a chunk before the download task logs a
/// stall. Nothing is retried: the next pull resumes the feed.
const STALL_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Default)]
struct Progress {
    downloaded: AtomicU64,
    complete: AtomicBool,
}

/// Chunks in the order they were pushed, ending when the feed finishes.
#[derive(Debug)]
pub struct ChunkStream {
    rx: mpsc::UnboundedReceiver<Bytes>,
    size: Option<u64>,
}

impl Stream for ChunkStream {
    type Item = std::result::Result<Bytes, Infallible>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.rx.poll_recv(cx).map(|chunk| chunk.map(Ok))
    }
}

impl SourceStream for ChunkStream {
    type Params = Self;
    type StreamCreationError = Infallible;

    fn create(
        params: Self::Params,
    ) -> impl Future<Output = std::result::Result<Self, Self::StreamCreationError>> + Send {
        future::ready(Ok(params))
    }

    fn content_length(&self) -> Option<u64> {
        self.size
    }

    fn seek_range(
        &mut self,
        _start: u64,
        _end: Option<u64>,
    ) -> impl Future<Output = io::Result<()>> + Send {
        future::ready(Err(io::Error::new(
            io::ErrorKind::Unsupported,
            "chunks arrive front to back",
        )))
    }

    fn reconnect(&mut self, _current_position: u64) -> impl Future<Output = io::Result<()>> + Send {
        future::ready(Ok(()))
    }

    fn supports_seek(&self) -> bool {
        false
    }
}

/// Writer side of a download.
#[derive(Debug)]
pub struct ChunkFeed {
    tx: Option<mpsc::UnboundedSender<Bytes>>,
    /// Taken when the download starts
    stream: Option<ChunkStream>,
    size: Option<u64>,
    progress: Arc<Progress>,
    cancel: CancellationToken,
}

impl ChunkFeed {
    /// Creates a feed for a file of `size` bytes, if known.
    #[must_use]
    pub fn new(size: Option<u64>) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            tx: Some(tx),
            stream: Some(ChunkStream { rx, size }),
            size,
            progress: Arc::default(),
            cancel: CancellationToken::new(),
        }
    }

    /// Creates a finished feed holding a complete payload.
    #[must_use]
    pub fn complete(payload: Bytes) -> Self {
        let mut feed = Self::new(Some(payload.len() as u64));
        if let Err(e) = feed.push(payload) {
            error!("{e}");
        }
        feed.finish();
        feed
    }

    /// Queues the next chunk for the download task.
    ///
    /// # Errors
    ///
    /// Returns `Aborted` if the feed was cancelled, or `FailedPrecondition`
    /// if it was already finished.
    pub fn push(&mut self, chunk: Bytes) -> Result<()> {
        if self.cancel.is_cancelled() {
            return Err(Error::aborted("download cancelled"));
        }
        let tx = self
            .tx
            .as_ref()
            .ok_or_else(|| Error::failed_precondition("download already finished"))?;
        tx.send(chunk)
            .map_err(|_| Error::aborted("download task stopped"))
    }

    /// Ends the stream once the queued chunks are stored.
    pub fn finish(&mut self) {
        self.tx = None;
    }

    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.tx.is_none()
    }

    /// Fails reads that are waiting for data, and any that follow.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Fraction of the file that can be read without waiting, short of
    /// [`TAIL_LEN`] until the download completes. `None` while the size is
    /// unknown.
    #[must_use]
    pub fn progress(&self) -> Option<f64> {
        if self.progress.complete.load(Ordering::Acquire) {
            return Some(1.0);
        }

        let size = self.size.filter(|size| *size > 0)?;
        let readable = self
            .progress
            .downloaded
            .load(Ordering::Acquire)
            .saturating_sub(TAIL_LEN);

        #[expect(clippy::cast_precision_loss)]
        let progress = readable as f64 / size as f64;
        Some(progress.min(1.0))
    }

    /// Starts the download task. The returned future resolves to the reader
    /// as soon as the task runs; reads then wait until `prefetch` bytes have
    /// arrived or the feed finishes.
    ///
    /// # Errors
    ///
    /// Returns `FailedPrecondition` if the download was started before.
    pub fn start(
        &mut self,
        prefetch: u64,
    ) -> Result<impl Future<Output = Result<ChunkReader>> + Send + 'static> {
        let stream = self
            .stream
            .take()
            .ok_or_else(|| Error::failed_precondition("download already started"))?;

        let progress = Arc::clone(&self.progress);
        let callback = move |_: &ChunkStream, state: StreamState, _: &CancellationToken| {
            progress
                .downloaded
                .store(state.current_position, Ordering::Release);
            if matches!(state.phase, StreamPhase::Complete) {
                progress.complete.store(true, Ordering::Release);
            }
        };
        let settings = Settings::default()
            .on_progress(callback)
            .prefetch_bytes(prefetch)
            .retry_timeout(STALL_TIMEOUT);

        let cancel = self.cancel.clone();
        let size = self.size;

        Ok(async move {
            let download =
                StreamDownload::from_stream(stream, MemoryStorageProvider, settings).await?;

            // The download token is also cancelled when the download ends.
            let finished = download.get_cancellation_token();
            let cancelled = cancel.clone();
            tokio::spawn(async move {
                tokio::select! {
                    () = cancelled.cancelled() => finished.cancel(),
                    () = finished.cancelled() => (),
                }
            });

            Ok(ChunkReader {
                download,
                cancel,
                size,
            })
        })
    }
}

/// Blocking reader over a download.
pub struct ChunkReader {
    download: StreamDownload<MemoryStorageProvider>,
    cancel: CancellationToken,
    size: Option<u64>,
}

impl ChunkReader {
    /// Reports failures caused by cancelling the feed as aborted, which the
    /// decoder treats as the end of input.
    fn map_err(&self, e: io::Error) -> io::Error {
        if self.cancel.is_cancelled() {
            io::Error::new(io::ErrorKind::ConnectionAborted, e)
        } else {
            e
        }
    }
}

impl Read for ChunkReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.download.read(buf).map_err(|e| self.map_err(e))
    }
}

impl Seek for ChunkReader {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        self.download.seek(pos).map_err(|e| self.map_err(e))
    }
}

impl MediaSource for ChunkReader {
    /// Positions ahead of the received data are waited for.
    #[inline]
    fn is_seekable(&self) -> bool {
        true
    }

    #[inline]
    fn byte_len(&self) -> Option<u64> {
        self.size
    }
}
