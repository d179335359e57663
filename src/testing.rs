//! Recording doubles for the transport and the sink.

use std::time::Duration;

use crate::{
    error::{Error, Result},
    protocol::media::Command,
    sequencer::SessionId,
    sink::{AudioSink, BlobId, SeekRejected, SeekableRange},
    track::Codec,
    transport::Transport,
};

#[derive(Debug, Default)]
pub struct MockTransport {
    pub opened: Vec<SessionId>,
    pub sent: Vec<(SessionId, Command)>,
    pub closed: Vec<SessionId>,
    pub refuse_open: bool,
}

impl MockTransport {
    /// Commands sent on the channel of `session`.
    pub fn sent_to(&self, session: SessionId) -> Vec<&Command> {
        self.sent
            .iter()
            .filter(|(id, _)| *id == session)
            .map(|(_, command)| command)
            .collect()
    }

    pub fn pulls(&self, session: SessionId) -> usize {
        self.sent_to(session)
            .into_iter()
            .filter(|command| matches!(command, Command::MusicNext { .. }))
            .count()
    }
}

impl Transport for MockTransport {
    fn open(&mut self, session: SessionId, _url: &url::Url) -> Result<()> {
        if self.refuse_open {
            return Err(Error::unavailable("refused"));
        }
        self.opened.push(session);
        Ok(())
    }

    fn send(&mut self, session: SessionId, command: &Command) -> Result<()> {
        self.sent.push((session, command.clone()));
        Ok(())
    }

    fn close(&mut self, session: SessionId) {
        self.closed.push(session);
    }
}

#[derive(Clone, Debug, PartialEq)]
pub enum SinkCall {
    OpenAppend(SessionId, String),
    Append(Vec<u8>),
    EndOfStream,
    CreateBlob(usize),
    AttachBlob(SessionId, BlobId),
    RevokeBlob(BlobId),
    Play,
    Pause,
    Seek(Duration),
    SetVolume(f32),
    Detach,
}

#[derive(Debug)]
pub struct MockSink {
    /// Codecs that support progressive append.
    pub progressive: Vec<Codec>,
    pub calls: Vec<SinkCall>,
    pub seekable: Option<SeekableRange>,
    /// Seeks past this position are rejected as not buffered.
    pub buffered_until: Option<Duration>,
    pub blobs: Vec<(BlobId, Vec<u8>)>,
    next_blob: u64,
}

impl Default for MockSink {
    fn default() -> Self {
        Self {
            progressive: vec![Codec::MP3, Codec::ADTS, Codec::FLAC, Codec::WAV],
            calls: Vec::new(),
            seekable: None,
            buffered_until: None,
            blobs: Vec::new(),
            next_blob: 1,
        }
    }
}

impl MockSink {
    pub fn appended(&self) -> Vec<Vec<u8>> {
        self.calls
            .iter()
            .filter_map(|call| match call {
                SinkCall::Append(bytes) => Some(bytes.clone()),
                _ => None,
            })
            .collect()
    }

    pub fn count(&self, wanted: &SinkCall) -> usize {
        self.calls.iter().filter(|call| *call == wanted).count()
    }

    pub fn position(&self, wanted: &SinkCall) -> Option<usize> {
        self.calls.iter().position(|call| call == wanted)
    }

    pub fn seeks(&self) -> Vec<Duration> {
        self.calls
            .iter()
            .filter_map(|call| match call {
                SinkCall::Seek(position) => Some(*position),
                _ => None,
            })
            .collect()
    }
}

impl AudioSink for MockSink {
    fn supports_progressive_append(&self, mime: &str) -> bool {
        Codec::from_mime(mime).is_some_and(|codec| self.progressive.contains(&codec))
    }

    fn open_append(&mut self, session: SessionId, mime: &str, _size: Option<u64>) -> Result<()> {
        if !self.supports_progressive_append(mime) {
            return Err(Error::unimplemented(format!("{mime} not supported")));
        }
        self.calls.push(SinkCall::OpenAppend(session, mime.to_owned()));
        Ok(())
    }

    fn append(&mut self, bytes: Vec<u8>) -> Result<()> {
        self.calls.push(SinkCall::Append(bytes));
        Ok(())
    }

    fn end_of_stream(&mut self) -> Result<()> {
        self.calls.push(SinkCall::EndOfStream);
        Ok(())
    }

    fn create_blob(&mut self, payload: Vec<u8>, _mime: &str) -> Result<BlobId> {
        let id = BlobId(self.next_blob);
        self.next_blob += 1;
        self.calls.push(SinkCall::CreateBlob(payload.len()));
        self.blobs.push((id, payload));
        Ok(id)
    }

    fn attach_blob(&mut self, session: SessionId, blob: BlobId) -> Result<()> {
        self.calls.push(SinkCall::AttachBlob(session, blob));
        Ok(())
    }

    fn revoke_blob(&mut self, blob: BlobId) {
        self.calls.push(SinkCall::RevokeBlob(blob));
    }

    fn play(&mut self) -> Result<()> {
        self.calls.push(SinkCall::Play);
        Ok(())
    }

    fn pause(&mut self) {
        self.calls.push(SinkCall::Pause);
    }

    fn seek(&mut self, position: Duration) -> std::result::Result<(), SeekRejected> {
        if self.buffered_until.is_some_and(|until| position > until) {
            return Err(SeekRejected::NotBuffered);
        }
        self.calls.push(SinkCall::Seek(position));
        Ok(())
    }

    fn seekable(&self) -> Option<SeekableRange> {
        self.seekable
    }

    fn set_volume(&mut self, volume: f32) {
        self.calls.push(SinkCall::SetVolume(volume));
    }

    fn detach(&mut self) {
        self.calls.push(SinkCall::Detach);
    }
}

/// A 16-bit stereo 44.1 kHz PCM WAV file of silence with `data_len` bytes
/// of samples.
pub fn wav(data_len: u32) -> Vec<u8> {
    let mut wav = Vec::with_capacity(44 + data_len as usize);
    wav.extend_from_slice(b"RIFF");
    wav.extend_from_slice(&(36 + data_len).to_le_bytes());
    wav.extend_from_slice(b"WAVEfmt ");
    wav.extend_from_slice(&16_u32.to_le_bytes());
    wav.extend_from_slice(&1_u16.to_le_bytes()); // PCM
    wav.extend_from_slice(&2_u16.to_le_bytes());
    wav.extend_from_slice(&44_100_u32.to_le_bytes());
    wav.extend_from_slice(&(44_100_u32 * 4).to_le_bytes());
    wav.extend_from_slice(&4_u16.to_le_bytes());
    wav.extend_from_slice(&16_u16.to_le_bytes());
    wav.extend_from_slice(b"data");
    wav.extend_from_slice(&data_len.to_le_bytes());
    wav.resize(44 + data_len as usize, 0);
    wav
}
