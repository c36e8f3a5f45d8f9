//! Worker side: issue calls to the host over the inherited channel.
//!
//! Calls are strictly sequential. [`Caller::call`] takes `&mut self`, so a
//! second call cannot start while the first is being polled; the protocol has
//! no request identifiers to untangle interleaved responses.
//!
//! A call whose future is dropped before its response arrives (a timeout,
//! a lost `select!` branch) leaves that response on the channel. The caller
//! records the call as pending until the response is read, and once a call is
//! abandoned or fails every later call returns
//! [`SessionError::Desynchronized`] without touching the channel.

use tokio::io::{AsyncRead, AsyncWrite};

use crate::bridge::codec::{MessageReader, MessageWriter};
use crate::bridge::protocol::{Request, Response, SessionError, read_response, write_request};

/// Call stub: sends a named request with one argument and waits for the
/// single response.
pub struct Caller<R, W> {
    reader: MessageReader<R>,
    writer: MessageWriter<W>,
    calls: u64,
    /// Name of the call between its first write and its response.
    pending: Option<String>,
}

impl<R, W> Caller<R, W>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    /// `reader` carries responses in, `writer` carries requests out.
    pub fn new(reader: R, writer: W) -> Self {
        Self {
            reader: MessageReader::new(reader),
            writer: MessageWriter::new(writer),
            calls: 0,
            pending: None,
        }
    }

    /// Invoke `name` with `argument` and return the raw result, which is
    /// `"__BAD API__"` when the peer has no such operation.
    ///
    /// Errors are fatal for the caller: after one, every call fails.
    pub async fn call(&mut self, name: &str, argument: &str) -> Result<String, SessionError> {
        if let Some(pending) = &self.pending {
            tracing::error!(name, pending = %pending, "Refusing call on desynchronized channel");
            return Err(SessionError::Desynchronized {
                name: pending.clone(),
            });
        }

        self.pending = Some(name.to_string());
        let request = Request::new(name, argument);
        write_request(&mut self.writer, &request).await?;
        let result = read_response(&mut self.reader, name).await?;
        self.pending = None;
        self.calls += 1;
        tracing::trace!(name, result_len = result.len(), "Call completed");
        Ok(result)
    }

    /// Like [`Caller::call`] but classifies the sentinel.
    pub async fn call_operation(
        &mut self,
        name: &str,
        argument: &str,
    ) -> Result<Response, SessionError> {
        self.call(name, argument).await.map(Response::from_wire)
    }

    /// Number of calls that completed.
    pub fn calls(&self) -> u64 {
        self.calls
    }

    /// True once a call failed or was abandoned mid-exchange.
    pub fn is_desynchronized(&self) -> bool {
        self.pending.is_some()
    }

    /// Give back the underlying streams. Dropping the writer closes the
    /// channel towards the peer, which is how the host learns we are done.
    pub fn into_inner(self) -> (R, W) {
        (self.reader.into_inner(), self.writer.into_inner())
    }
}

#[cfg(unix)]
pub use self::unix::{PipeCaller, connect_from_env};

#[cfg(unix)]
mod unix {
    use tokio::net::unix::pipe::{Receiver, Sender};

    use super::Caller;
    use crate::bridge::channel::{ChannelError, WorkerEnds};
    use crate::bridge::protocol::SessionId;

    pub type PipeCaller = Caller<Receiver, Sender>;

    /// Claim the channel ends passed by the host and build a caller on them.
    /// Must run inside a tokio runtime.
    pub fn connect_from_env() -> Result<(SessionId, PipeCaller), ChannelError> {
        let (session, ends) = WorkerEnds::from_env()?;
        let (reader, writer) = ends.into_async()?;
        tracing::info!(session = %session, "Connected to host");
        Ok((session, Caller::new(reader, writer)))
    }
}
