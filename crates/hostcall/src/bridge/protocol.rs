//! Request/response protocol on top of the message framing.
//!
//! - **Request**: two messages, `name` then `argument`.
//! - **Response**: one message, the result string or [`BAD_API_SENTINEL`].
//!
//! There are no request identifiers: a response is matched to a request by
//! position alone, so exactly one request may be outstanding per channel pair.

use std::fmt;

use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_util::bytes::Bytes;

use super::codec::{FrameError, MessageReader, MessageWriter, Phase};

/// Reserved result meaning "no operation with that name".
pub const BAD_API_SENTINEL: &str = "__BAD API__";

/// Identifies one worker session in logs on both sides of the channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(uuid::Uuid);

impl SessionId {
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4())
    }

    pub fn as_uuid(&self) -> &uuid::Uuid {
        &self.0
    }

    pub fn parse(s: &str) -> Result<Self, uuid::Error> {
        let uuid = uuid::Uuid::parse_str(s)?;
        Ok(Self(uuid))
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Which string of a request or response failed to decode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Field {
    Name,
    Argument,
    Result,
}

impl fmt::Display for Field {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Name => f.write_str("request name"),
            Self::Argument => f.write_str("request argument"),
            Self::Result => f.write_str("response"),
        }
    }
}

/// Fatal errors for a session. None of these can be recovered from: the
/// length-prefixed stream cannot be resynchronized once it goes wrong.
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error(transparent)]
    Frame(#[from] FrameError),

    #[error("channel closed after request name '{name}' without an argument")]
    MissingArgument { name: String },

    #[error("peer closed the channel before responding to '{name}'")]
    PeerClosed { name: String },

    #[error("{field} is not valid UTF-8")]
    InvalidUtf8 { field: Field },

    /// An earlier exchange for `name` was abandoned part-way, so the next
    /// message on the channel cannot be matched to anything.
    #[error("exchange for '{name}' did not complete; channel is out of sync")]
    Desynchronized { name: String },
}

impl SessionError {
    /// Framing phase the failure happened in, for diagnostics.
    pub fn phase(&self) -> Phase {
        match self {
            Self::Frame(e) => e.phase(),
            Self::MissingArgument { .. }
            | Self::PeerClosed { .. }
            | Self::Desynchronized { .. } => Phase::Length,
            Self::InvalidUtf8 { .. } => Phase::Payload,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
    pub name: String,
    pub argument: String,
}

impl Request {
    pub fn new(name: impl Into<String>, argument: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            argument: argument.into(),
        }
    }
}

/// Outcome of a request. On the wire this is always a single string.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Response {
    Value(String),
    UnknownOperation,
}

impl Response {
    pub fn into_wire(self) -> String {
        match self {
            Self::Value(value) => value,
            Self::UnknownOperation => BAD_API_SENTINEL.to_string(),
        }
    }

    /// Classify a received result. A handler that genuinely returns the
    /// sentinel is indistinguishable from an unknown operation.
    pub fn from_wire(value: String) -> Self {
        if value == BAD_API_SENTINEL {
            Self::UnknownOperation
        } else {
            Self::Value(value)
        }
    }

    pub fn is_unknown_operation(&self) -> bool {
        matches!(self, Self::UnknownOperation)
    }
}

fn decode_utf8(bytes: Bytes, field: Field) -> Result<String, SessionError> {
    String::from_utf8(bytes.to_vec()).map_err(|_| SessionError::InvalidUtf8 { field })
}

/// Write both messages of a request and flush them together.
pub async fn write_request<W: AsyncWrite + Unpin>(
    writer: &mut MessageWriter<W>,
    request: &Request,
) -> Result<(), SessionError> {
    writer
        .feed_message(Bytes::copy_from_slice(request.name.as_bytes()))
        .await?;
    writer
        .feed_message(Bytes::copy_from_slice(request.argument.as_bytes()))
        .await?;
    writer.flush().await?;
    Ok(())
}

/// Read the next request.
///
/// `Ok(None)` means the peer closed its write end between requests, which is
/// the only place a clean end of stream is accepted.
pub async fn read_request<R: AsyncRead + Unpin>(
    reader: &mut MessageReader<R>,
) -> Result<Option<Request>, SessionError> {
    let Some(name) = read_request_name(reader).await? else {
        return Ok(None);
    };
    read_request_argument(reader, name).await.map(Some)
}

/// First half of [`read_request`]. Dropping this future loses nothing: a
/// partially read message stays buffered in the reader.
pub(crate) async fn read_request_name<R: AsyncRead + Unpin>(
    reader: &mut MessageReader<R>,
) -> Result<Option<String>, SessionError> {
    match reader.read_message().await? {
        Some(name) => decode_utf8(name, Field::Name).map(Some),
        None => Ok(None),
    }
}

/// Second half of [`read_request`], once `name` has been consumed.
pub(crate) async fn read_request_argument<R: AsyncRead + Unpin>(
    reader: &mut MessageReader<R>,
    name: String,
) -> Result<Request, SessionError> {
    let Some(argument) = reader.read_message().await? else {
        return Err(SessionError::MissingArgument { name });
    };
    let argument = decode_utf8(argument, Field::Argument)?;
    Ok(Request { name, argument })
}

pub async fn write_response<W: AsyncWrite + Unpin>(
    writer: &mut MessageWriter<W>,
    response: Response,
) -> Result<(), SessionError> {
    writer.write_message(response.into_wire()).await?;
    Ok(())
}

/// Read the single response to `name`. End of stream here is a violation:
/// the peer must answer every request before closing.
pub async fn read_response<R: AsyncRead + Unpin>(
    reader: &mut MessageReader<R>,
    name: &str,
) -> Result<String, SessionError> {
    match reader.read_message().await? {
        Some(bytes) => decode_utf8(bytes, Field::Result),
        None => Err(SessionError::PeerClosed {
            name: name.to_string(),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncWriteExt;

    #[test]
    fn unknown_operation_uses_sentinel_on_the_wire() {
        assert_eq!(Response::UnknownOperation.into_wire(), "__BAD API__");
        assert_eq!(
            Response::from_wire("__BAD API__".to_string()),
            Response::UnknownOperation
        );
        assert_eq!(
            Response::from_wire("__BAD API__ ".to_string()),
            Response::Value("__BAD API__ ".to_string())
        );
    }

    #[test]
    fn session_id_displays_as_uuid() {
        let id = SessionId::parse("550e8400-e29b-41d4-a716-446655440000").unwrap();
        assert_eq!(id.to_string(), "550e8400-e29b-41d4-a716-446655440000");
        assert_ne!(SessionId::new(), SessionId::new());
    }

    #[tokio::test]
    async fn request_is_two_messages_on_the_wire() {
        let (a, mut b) = tokio::io::duplex(64);
        let mut writer = MessageWriter::new(a);
        write_request(&mut writer, &Request::new("foo", "100"))
            .await
            .unwrap();
        drop(writer);

        let mut wire = Vec::new();
        tokio::io::AsyncReadExt::read_to_end(&mut b, &mut wire)
            .await
            .unwrap();
        assert_eq!(wire, b"\x03\x00\x00\x00foo\x03\x00\x00\x00100");
    }

    #[tokio::test]
    async fn request_roundtrips_with_empty_argument() {
        let (a, b) = tokio::io::duplex(4);
        let sent = Request::new("ping", "");
        let to_send = sent.clone();
        let task = tokio::spawn(async move {
            let mut writer = MessageWriter::new(a);
            write_request(&mut writer, &to_send).await.unwrap();
        });

        let mut reader = MessageReader::new(b);
        assert_eq!(read_request(&mut reader).await.unwrap(), Some(sent));
        task.await.unwrap();
        assert_eq!(read_request(&mut reader).await.unwrap(), None);
    }

    #[tokio::test]
    async fn eof_between_name_and_argument_is_fatal() {
        let (a, b) = tokio::io::duplex(64);
        let mut writer = MessageWriter::new(a);
        writer.write_message("foo").await.unwrap();
        drop(writer);

        let mut reader = MessageReader::new(b);
        let err = read_request(&mut reader).await.unwrap_err();
        insta::assert_snapshot!(err, @"channel closed after request name 'foo' without an argument");
    }

    #[tokio::test]
    async fn non_utf8_name_is_rejected() {
        let (mut a, b) = tokio::io::duplex(64);
        a.write_all(&[2, 0, 0, 0, 0xc3, 0x28, 0, 0, 0, 0])
            .await
            .unwrap();
        drop(a);

        let mut reader = MessageReader::new(b);
        let err = read_request(&mut reader).await.unwrap_err();
        assert!(matches!(
            err,
            SessionError::InvalidUtf8 { field: Field::Name }
        ));
        assert_eq!(err.phase(), Phase::Payload);
    }

    #[tokio::test]
    async fn missing_response_is_peer_closed() {
        let (a, b) = tokio::io::duplex(64);
        drop(a);

        let mut reader = MessageReader::new(b);
        let err = read_response(&mut reader, "foo").await.unwrap_err();
        assert!(matches!(err, SessionError::PeerClosed { ref name } if name == "foo"));
    }
}
