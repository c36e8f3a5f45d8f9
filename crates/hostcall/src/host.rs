//! Host side: spawn a worker and service its requests.
//!
//! Flow:
//! 1. Create the channel pair
//! 2. Spawn the worker with only its two ends inheritable
//! 3. Drop the host's copy of the worker's ends
//! 4. Serve requests until the worker closes its write end
//! 5. Reap the worker (separately, via [`WorkerSession::wait`])

use std::ffi::OsString;
use std::io;
use std::process::{ExitStatus, Stdio};

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::unix::pipe::{Receiver, Sender};
use tokio::process::{Child, ChildStdout, Command};

use crate::bridge::channel::{CHANNEL_ENV, ChannelError, ChannelPair, mark_inheritable};
use crate::bridge::codec::{MessageReader, MessageWriter};
use crate::bridge::protocol::{
    SessionError, SessionId, read_request_argument, read_request_name, write_response,
};
use crate::dispatch::OperationTable;

/// Where the worker's stdout goes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum WorkerStdout {
    #[default]
    Inherit,
    Piped,
    Null,
}

impl WorkerStdout {
    fn stdio(self) -> Stdio {
        match self {
            Self::Inherit => Stdio::inherit(),
            Self::Piped => Stdio::piped(),
            Self::Null => Stdio::null(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct HostConfig {
    pub program: OsString,
    pub args: Vec<OsString>,
    pub envs: Vec<(OsString, OsString)>,
    pub stdout: WorkerStdout,
}

impl HostConfig {
    pub fn new(program: impl Into<OsString>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            envs: Vec::new(),
            stdout: WorkerStdout::default(),
        }
    }

    pub fn with_arg(mut self, arg: impl Into<OsString>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn with_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<OsString>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn with_env(mut self, key: impl Into<OsString>, value: impl Into<OsString>) -> Self {
        self.envs.push((key.into(), value.into()));
        self
    }

    pub fn with_stdout(mut self, stdout: WorkerStdout) -> Self {
        self.stdout = stdout;
        self
    }
}

#[derive(Debug, thiserror::Error)]
pub enum HostError {
    #[error("failed to set up channel: {0}")]
    Channel(#[from] ChannelError),

    #[error("failed to spawn worker: {0}")]
    Spawn(#[source] io::Error),

    #[error(transparent)]
    Session(#[from] SessionError),

    #[error("worker session was already served")]
    AlreadyServed,

    #[error("failed to wait for worker: {0}")]
    Wait(#[source] io::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopState {
    Serving,
    Closed,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ServeSummary {
    /// Requests answered, including unknown operations.
    pub requests: u64,
    pub unknown_operations: u64,
}

/// Read loop servicing one peer's requests, one at a time.
///
/// Generic over the transport so it runs on inherited pipes, in-memory
/// streams, or in the mirrored direction (worker serving the host).
///
/// Dropping a [`HostLoop::step`] future while it waits for a request is
/// harmless. Dropping it after the request name was read leaves the exchange
/// pending, and the next step closes the loop with
/// [`SessionError::Desynchronized`].
pub struct HostLoop<R, W> {
    ends: Option<(MessageReader<R>, MessageWriter<W>)>,
    /// Request being handled, from its name until its response is written.
    pending: Option<String>,
    summary: ServeSummary,
}

impl<R, W> HostLoop<R, W>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    /// `reader` carries requests in, `writer` carries responses out.
    pub fn new(reader: R, writer: W) -> Self {
        Self {
            ends: Some((MessageReader::new(reader), MessageWriter::new(writer))),
            pending: None,
            summary: ServeSummary::default(),
        }
    }

    pub fn state(&self) -> LoopState {
        if self.ends.is_some() && self.pending.is_none() {
            LoopState::Serving
        } else {
            LoopState::Closed
        }
    }

    pub fn summary(&self) -> ServeSummary {
        self.summary
    }

    /// Run one transition: answer one request, or close on end of stream.
    ///
    /// Any error also closes the loop; the stream cannot be resynchronized.
    pub async fn step(&mut self, table: &OperationTable) -> Result<LoopState, SessionError> {
        if let Some(name) = self.pending.take() {
            tracing::error!(
                name = %name,
                "Previous request was abandoned mid-exchange, closing"
            );
            self.ends = None;
            return Err(SessionError::Desynchronized { name });
        }
        let Some((reader, writer)) = self.ends.as_mut() else {
            return Ok(LoopState::Closed);
        };

        let name = match read_request_name(reader).await {
            Ok(Some(name)) => name,
            Ok(None) => {
                tracing::debug!(
                    requests = self.summary.requests,
                    "Peer closed its channel, closing"
                );
                self.ends = None;
                return Ok(LoopState::Closed);
            }
            Err(e) => {
                self.ends = None;
                return Err(e);
            }
        };

        self.pending = Some(name.clone());
        let request = match read_request_argument(reader, name).await {
            Ok(request) => request,
            Err(e) => {
                self.pending = None;
                self.ends = None;
                return Err(e);
            }
        };

        tracing::trace!(name = %request.name, "Request received");
        let response = table.dispatch(&request.name, &request.argument);
        if response.is_unknown_operation() {
            self.summary.unknown_operations += 1;
        }

        if let Err(e) = write_response(writer, response).await {
            self.pending = None;
            self.ends = None;
            return Err(e);
        }
        self.pending = None;
        self.summary.requests += 1;
        Ok(LoopState::Serving)
    }

    /// Serve until the peer closes its write end.
    pub async fn run(mut self, table: &OperationTable) -> Result<ServeSummary, SessionError> {
        while self.step(table).await? == LoopState::Serving {}
        Ok(self.summary)
    }
}

/// A spawned worker and the host's ends of its channel.
pub struct WorkerSession {
    session: SessionId,
    child: Child,
    host_loop: Option<HostLoop<Receiver, Sender>>,
}

impl WorkerSession {
    pub fn session(&self) -> SessionId {
        self.session
    }

    pub fn id(&self) -> Option<u32> {
        self.child.id()
    }

    pub fn take_stdout(&mut self) -> Option<ChildStdout> {
        self.child.stdout.take()
    }

    /// Serve the worker's requests until it closes its channel. The host's
    /// channel ends are closed when this returns, on success or failure.
    pub async fn serve(&mut self, table: &OperationTable) -> Result<ServeSummary, HostError> {
        let host_loop = self.host_loop.take().ok_or(HostError::AlreadyServed)?;

        tracing::debug!(session = %self.session, operations = table.len(), "Serving worker");
        match host_loop.run(table).await {
            Ok(summary) => {
                tracing::info!(
                    session = %self.session,
                    requests = summary.requests,
                    unknown_operations = summary.unknown_operations,
                    "Worker session closed"
                );
                Ok(summary)
            }
            Err(e) => {
                tracing::error!(
                    session = %self.session,
                    phase = %e.phase(),
                    error = %e,
                    "Worker session failed"
                );
                Err(e.into())
            }
        }
    }

    pub async fn wait(&mut self) -> Result<ExitStatus, HostError> {
        let status = self.child.wait().await.map_err(HostError::Wait)?;
        tracing::debug!(session = %self.session, %status, "Worker exited");
        Ok(status)
    }
}

/// Spawn a worker connected to a fresh channel pair.
///
/// The worker finds its ends through [`CHANNEL_ENV`]. On every failure path
/// the channel ends created here are closed before returning.
///
/// Nothing here awaits. It is `async` because the host's ends are registered
/// with the tokio reactor, which needs a running runtime; an async signature
/// makes that requirement part of the type.
pub async fn spawn_worker(config: HostConfig) -> Result<WorkerSession, HostError> {
    let session = SessionId::new();
    let (host_ends, worker_ends) = ChannelPair::create()?.split();
    let info = worker_ends.info(session);

    let mut command = Command::new(&config.program);
    command
        .args(&config.args)
        .envs(config.envs.iter().map(|(k, v)| (k, v)))
        .env(CHANNEL_ENV, info.to_env_value()?)
        .stdout(config.stdout.stdio())
        .stderr(Stdio::inherit());

    let inherited = worker_ends.raw_fds();
    let inherit = move || -> io::Result<()> {
        for fd in inherited {
            // SAFETY: the parent keeps `worker_ends` open until spawn returns,
            // so both descriptors are open in the forked child.
            unsafe { mark_inheritable(fd)? };
        }
        Ok(())
    };
    // SAFETY: the closure only issues fcntl calls, which are async-signal-safe.
    unsafe {
        command.pre_exec(inherit);
    }

    tracing::info!(session = %session, program = ?config.program, "Spawning worker");
    let child = command.spawn().map_err(HostError::Spawn)?;

    // The worker has its copies now; the host must not hold the worker→host
    // write end or it would never see end of stream.
    drop(worker_ends);

    let (reader, writer) = host_ends.into_async().map_err(ChannelError::from)?;
    tracing::debug!(session = %session, pid = ?child.id(), "Worker spawned");

    Ok(WorkerSession {
        session,
        child,
        host_loop: Some(HostLoop::new(reader, writer)),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::worker::Caller;

    fn demo_table() -> OperationTable {
        OperationTable::builder()
            .register("foo", |arg| format!("Foo was called with arg {arg}"))
            .register("bar", |arg| format!("Bar was called with arg {arg}"))
            .build()
            .unwrap()
    }

    /// Host loop and caller wired back to back through small in-memory pipes.
    fn wire() -> (
        HostLoop<tokio::io::DuplexStream, tokio::io::DuplexStream>,
        Caller<tokio::io::DuplexStream, tokio::io::DuplexStream>,
    ) {
        let (to_host_w, to_host_r) = tokio::io::duplex(7);
        let (to_worker_w, to_worker_r) = tokio::io::duplex(7);
        (
            HostLoop::new(to_host_r, to_worker_w),
            Caller::new(to_worker_r, to_host_w),
        )
    }

    #[tokio::test]
    async fn serves_calls_then_closes_cleanly() {
        let (host_loop, mut caller) = wire();
        let table = demo_table();

        let worker = tokio::spawn(async move {
            let foo = caller.call("foo", "100").await.unwrap();
            let baz = caller.call("baz", "x").await.unwrap();
            let again = caller.call("bar", "after-miss").await.unwrap();
            (foo, baz, again)
        });

        let summary = host_loop.run(&table).await.unwrap();
        let (foo, baz, again) = worker.await.unwrap();

        assert_eq!(foo, "Foo was called with arg 100");
        assert_eq!(baz, "__BAD API__");
        assert_eq!(again, "Bar was called with arg after-miss");
        assert_eq!(
            summary,
            ServeSummary {
                requests: 3,
                unknown_operations: 1
            }
        );
    }

    #[tokio::test]
    async fn alternating_calls_get_responses_in_order() {
        let (host_loop, mut caller) = wire();
        let table = demo_table();

        let worker = tokio::spawn(async move {
            let mut responses = Vec::new();
            for i in 0..10 {
                responses.push(caller.call("foo", &i.to_string()).await.unwrap());
                responses.push(caller.call("bar", &i.to_string()).await.unwrap());
            }
            responses
        });

        let summary = host_loop.run(&table).await.unwrap();
        let responses = worker.await.unwrap();

        assert_eq!(summary.requests, 20);
        assert_eq!(responses.len(), 20);
        for i in 0..10 {
            assert_eq!(responses[2 * i], format!("Foo was called with arg {i}"));
            assert_eq!(responses[2 * i + 1], format!("Bar was called with arg {i}"));
        }
    }

    #[tokio::test]
    async fn step_walks_the_state_machine() {
        let (mut host_loop, mut caller) = wire();
        let table = demo_table();
        assert_eq!(host_loop.state(), LoopState::Serving);

        let worker = tokio::spawn(async move { caller.call("foo", "1").await.unwrap() });
        assert_eq!(host_loop.step(&table).await.unwrap(), LoopState::Serving);
        assert_eq!(worker.await.unwrap(), "Foo was called with arg 1");

        // The caller was dropped with the task: its write end is closed.
        assert_eq!(host_loop.step(&table).await.unwrap(), LoopState::Closed);
        assert_eq!(host_loop.state(), LoopState::Closed);
        assert_eq!(host_loop.step(&table).await.unwrap(), LoopState::Closed);
        assert_eq!(host_loop.summary().requests, 1);
    }

    #[tokio::test]
    async fn immediate_close_is_not_an_error() {
        let (host_loop, caller) = wire();
        drop(caller);
        let summary = host_loop.run(&demo_table()).await.unwrap();
        assert_eq!(summary, ServeSummary::default());
    }

    #[tokio::test]
    async fn truncated_request_is_fatal() {
        use tokio::io::AsyncWriteExt;

        let (mut to_host_w, to_host_r) = tokio::io::duplex(64);
        let (to_worker_w, _to_worker_r) = tokio::io::duplex(64);
        let mut host_loop = HostLoop::new(to_host_r, to_worker_w);

        to_host_w.write_all(&[3, 0, 0, 0, b'f', b'o']).await.unwrap();
        drop(to_host_w);

        let err = host_loop.step(&demo_table()).await.unwrap_err();
        insta::assert_snapshot!(err, @"channel closed during payload read: received 2 of 3 bytes");
        assert_eq!(host_loop.state(), LoopState::Closed);
    }

    #[tokio::test]
    async fn abandoned_step_closes_the_loop() {
        use std::time::Duration;

        use crate::bridge::protocol::{Request, write_request};

        let (to_host_w, to_host_r) = tokio::io::duplex(64);
        // One byte of room: the response cannot be written until the worker reads.
        let (to_worker_w, _to_worker_r) = tokio::io::duplex(1);
        let mut host_loop = HostLoop::new(to_host_r, to_worker_w);
        let table = demo_table();

        let mut writer = MessageWriter::new(to_host_w);
        write_request(&mut writer, &Request::new("foo", "1"))
            .await
            .unwrap();

        let attempt =
            tokio::time::timeout(Duration::from_millis(20), host_loop.step(&table)).await;
        assert!(attempt.is_err());
        assert_eq!(host_loop.state(), LoopState::Closed);

        let err = host_loop.step(&table).await.unwrap_err();
        insta::assert_snapshot!(err, @"exchange for 'foo' did not complete; channel is out of sync");
        assert_eq!(host_loop.step(&table).await.unwrap(), LoopState::Closed);
        assert_eq!(host_loop.summary().requests, 0);
    }

    #[tokio::test]
    async fn mirrored_direction_uses_the_same_loop() {
        // Here the "worker" owns the table and the host is the caller.
        let (to_worker_w, to_worker_r) = tokio::io::duplex(16);
        let (to_host_w, to_host_r) = tokio::io::duplex(16);
        let worker_loop = HostLoop::new(to_worker_r, to_host_w);
        let mut host_caller = Caller::new(to_host_r, to_worker_w);

        let served = tokio::spawn(async move { worker_loop.run(&demo_table()).await.unwrap() });
        assert_eq!(
            host_caller.call("bar", "7").await.unwrap(),
            "Bar was called with arg 7"
        );
        drop(host_caller);
        assert_eq!(served.await.unwrap().requests, 1);
    }

    #[test]
    fn host_config_builder() {
        let config = HostConfig::new("/bin/worker")
            .with_arg("a")
            .with_args(["b", "c"])
            .with_env("HOSTCALL_LOG", "debug")
            .with_stdout(WorkerStdout::Piped);
        assert_eq!(config.program, OsString::from("/bin/worker"));
        assert_eq!(config.args, ["a", "b", "c"].map(OsString::from));
        assert_eq!(config.envs.len(), 1);
        assert_eq!(config.stdout, WorkerStdout::Piped);
    }
}
