//! hostcall: synchronous RPC from a worker subprocess to its host over a
//! pair of inherited anonymous pipes.

pub mod bridge;
pub mod dispatch;
#[cfg(unix)]
pub mod host;
pub mod logging;
pub mod worker;

pub use bridge::codec::{FrameError, MessageCodec, MessageReader, MessageWriter, Phase};
pub use bridge::protocol::{BAD_API_SENTINEL, Request, Response, SessionError, SessionId};
pub use dispatch::{OperationTable, RegistryError};
pub use worker::Caller;

#[cfg(unix)]
pub use bridge::channel::{CHANNEL_ENV, ChannelError, ChannelPair, ChildChannelInfo};
#[cfg(unix)]
pub use host::{
    HostConfig, HostError, HostLoop, LoopState, ServeSummary, WorkerSession, WorkerStdout,
    spawn_worker,
};
#[cfg(unix)]
pub use worker::{PipeCaller, connect_from_env};
