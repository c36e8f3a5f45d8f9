//! Length-prefixed message framing.
//!
//! Every message on the wire is `u32 length (little-endian) || payload`. The
//! codec is a tokio-util `Decoder`/`Encoder` so it can sit under `FramedRead`
//! and `FramedWrite` on any AsyncRead/AsyncWrite (pipes, duplex streams, ...).
//!
//! End of stream is only clean when it lands on a message boundary. Anything
//! else leaves the stream desynchronized and surfaces as [`FrameError::Truncated`].

use std::fmt;
use std::io;

use futures::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_util::bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder, FramedRead, FramedWrite};

/// Size of the length prefix.
pub const HEADER_LEN: usize = 4;

/// Which part of the framing was in progress when something went wrong.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Length,
    Payload,
    Write,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Length => f.write_str("length read"),
            Self::Payload => f.write_str("payload read"),
            Self::Write => f.write_str("write"),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    /// The underlying read or write primitive failed.
    #[error("{phase} failed: {source}")]
    Transport {
        phase: Phase,
        #[source]
        source: io::Error,
    },

    /// The peer closed the channel part-way through a message.
    #[error("channel closed during {phase}: received {received} of {expected} bytes")]
    Truncated {
        phase: Phase,
        expected: usize,
        received: usize,
    },

    #[error("message of {len} bytes exceeds the 4-byte length prefix")]
    Oversized { len: usize },
}

impl FrameError {
    pub fn phase(&self) -> Phase {
        match self {
            Self::Transport { phase, .. } | Self::Truncated { phase, .. } => *phase,
            Self::Oversized { .. } => Phase::Write,
        }
    }

    /// Re-tag a transport error with the phase the caller knows it was in.
    fn with_phase(self, phase: Phase) -> Self {
        match self {
            Self::Transport { source, .. } => Self::Transport { phase, source },
            other => other,
        }
    }
}

/// Needed by the codec traits. The phase is refined by [`MessageReader`] and
/// [`MessageWriter`], which know what they were doing.
impl From<io::Error> for FrameError {
    fn from(source: io::Error) -> Self {
        Self::Transport {
            phase: Phase::Length,
            source,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DecodeState {
    Head,
    Data(usize),
}

/// Codec for `[len:u32 LE][payload]` messages.
#[derive(Debug)]
pub struct MessageCodec {
    state: DecodeState,
}

impl Default for MessageCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl MessageCodec {
    pub fn new() -> Self {
        Self {
            state: DecodeState::Head,
        }
    }

    /// Phase a read is currently in: waiting for a length or for a payload.
    pub fn phase(&self) -> Phase {
        match self.state {
            DecodeState::Head => Phase::Length,
            DecodeState::Data(_) => Phase::Payload,
        }
    }
}

fn length_prefix(len: usize) -> Result<u32, FrameError> {
    u32::try_from(len).map_err(|_| FrameError::Oversized { len })
}

impl Decoder for MessageCodec {
    type Item = Bytes;
    type Error = FrameError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        let len = match self.state {
            DecodeState::Head => {
                if src.len() < HEADER_LEN {
                    src.reserve(HEADER_LEN - src.len());
                    return Ok(None);
                }
                let len = src.get_u32_le() as usize;
                self.state = DecodeState::Data(len);
                len
            }
            DecodeState::Data(len) => len,
        };

        if src.len() < len {
            return Ok(None);
        }

        self.state = DecodeState::Head;
        Ok(Some(src.split_to(len).freeze()))
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if let Some(frame) = self.decode(src)? {
            return Ok(Some(frame));
        }
        match self.state {
            DecodeState::Head if src.is_empty() => Ok(None),
            DecodeState::Head => Err(FrameError::Truncated {
                phase: Phase::Length,
                expected: HEADER_LEN,
                received: src.len(),
            }),
            DecodeState::Data(len) => Err(FrameError::Truncated {
                phase: Phase::Payload,
                expected: len,
                received: src.len(),
            }),
        }
    }
}

impl Encoder<Bytes> for MessageCodec {
    type Error = FrameError;

    fn encode(&mut self, item: Bytes, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let len = length_prefix(item.len())?;
        dst.reserve(HEADER_LEN + item.len());
        dst.put_u32_le(len);
        dst.extend_from_slice(&item);
        tracing::trace!(len = item.len(), "Encoding message");
        Ok(())
    }
}

/// Read half of a channel, yielding whole messages.
pub struct MessageReader<R> {
    inner: FramedRead<R, MessageCodec>,
}

impl<R: AsyncRead + Unpin> MessageReader<R> {
    pub fn new(reader: R) -> Self {
        Self {
            inner: FramedRead::new(reader, MessageCodec::new()),
        }
    }

    /// Read the next message. `Ok(None)` is a clean end of stream: the peer
    /// closed its write end exactly on a message boundary.
    pub async fn read_message(&mut self) -> Result<Option<Bytes>, FrameError> {
        match self.inner.next().await {
            Some(Ok(payload)) => {
                tracing::trace!(len = payload.len(), "Decoded message");
                Ok(Some(payload))
            }
            Some(Err(e)) => Err(e.with_phase(self.inner.decoder().phase())),
            None => Ok(None),
        }
    }

    pub fn into_inner(self) -> R {
        self.inner.into_inner()
    }
}

/// Write half of a channel.
pub struct MessageWriter<W> {
    inner: FramedWrite<W, MessageCodec>,
}

impl<W: AsyncWrite + Unpin> MessageWriter<W> {
    pub fn new(writer: W) -> Self {
        Self {
            inner: FramedWrite::new(writer, MessageCodec::new()),
        }
    }

    /// Write one message and flush it.
    pub async fn write_message(&mut self, payload: impl Into<Bytes>) -> Result<(), FrameError> {
        self.inner
            .send(payload.into())
            .await
            .map_err(|e| e.with_phase(Phase::Write))
    }

    /// Buffer one message without flushing. Pair with [`MessageWriter::flush`].
    pub async fn feed_message(&mut self, payload: impl Into<Bytes>) -> Result<(), FrameError> {
        self.inner
            .feed(payload.into())
            .await
            .map_err(|e| e.with_phase(Phase::Write))
    }

    pub async fn flush(&mut self) -> Result<(), FrameError> {
        SinkExt::<Bytes>::flush(&mut self.inner)
            .await
            .map_err(|e| e.with_phase(Phase::Write))
    }

    pub fn into_inner(self) -> W {
        self.inner.into_inner()
    }
}
