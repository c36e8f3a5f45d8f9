//! Anonymous pipe pair connecting host and worker.
//!
//! Two unidirectional pipes give a full-duplex channel:
//!
//! ```text
//!   host  write ──── host→worker ────▶ read   worker
//!   host  read  ◀─── worker→host ───── write  worker
//! ```
//!
//! All four ends are created close-on-exec. When spawning, only the worker's
//! two ends are made inheritable, and only inside the forked child, so the
//! host's ends never leak into the worker. The host drops its copy of the
//! worker's ends straight after spawn. Without that, the worker→host pipe
//! would keep a writer alive in the host and end of stream would never arrive.
//!
//! The worker learns which descriptors to use from [`CHANNEL_ENV`].

use std::io;
use std::os::fd::{AsFd, AsRawFd, BorrowedFd, FromRawFd, OwnedFd, RawFd};
use std::sync::atomic::{AtomicBool, Ordering};

use nix::errno::Errno;
use nix::fcntl::{FcntlArg, FdFlag, fcntl};
use nix::unistd::pipe;
use serde::{Deserialize, Serialize};
use tokio::net::unix::pipe::{Receiver, Sender};

use super::protocol::SessionId;

/// Environment variable carrying [`ChildChannelInfo`] as JSON.
pub const CHANNEL_ENV: &str = "HOSTCALL_CHANNEL";

/// Lowest descriptor the worker's ends may use. 0, 1 and 2 are stdio, which
/// the child overwrites with `dup2` before the channel is made inheritable.
pub const MIN_WORKER_FD: RawFd = 3;

/// Set once the worker has taken ownership of the inherited descriptors.
static CLAIMED: AtomicBool = AtomicBool::new(false);

#[derive(Debug, thiserror::Error)]
pub enum ChannelError {
    #[error("HOSTCALL_CHANNEL is not set (not spawned by a hostcall host?)")]
    MissingEnv,

    #[error("invalid channel info: {0}")]
    InvalidInfo(#[from] serde_json::Error),

    #[error("channel handle {fd} is not an open descriptor")]
    InvalidHandle { fd: RawFd },

    #[error("inherited channel handles were already claimed")]
    AlreadyClaimed,

    #[error("pipe operation failed: {0}")]
    Os(#[from] Errno),

    #[error(transparent)]
    Io(#[from] io::Error),
}

/// Information passed to the worker so it can find its channel ends.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChildChannelInfo {
    pub session: SessionId,
    /// Read end of host→worker.
    pub read_fd: RawFd,
    /// Write end of worker→host.
    pub write_fd: RawFd,
}

impl ChildChannelInfo {
    pub fn to_env_value(&self) -> Result<String, ChannelError> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn from_env_value(value: &str) -> Result<Self, ChannelError> {
        Ok(serde_json::from_str(value)?)
    }

    pub fn from_env() -> Result<Self, ChannelError> {
        let value = std::env::var(CHANNEL_ENV).map_err(|_| ChannelError::MissingEnv)?;
        Self::from_env_value(&value)
    }
}

fn set_cloexec(fd: impl AsFd, on: bool) -> Result<(), Errno> {
    let flags = if on {
        FdFlag::FD_CLOEXEC
    } else {
        FdFlag::empty()
    };
    fcntl(fd, FcntlArg::F_SETFD(flags)).map(drop)
}

/// Clear close-on-exec on `fd`. Meant for the forked child before exec:
/// a single fcntl call, no allocation.
///
/// # Safety
///
/// `fd` must be an open descriptor for the duration of the call.
pub(crate) unsafe fn mark_inheritable(fd: RawFd) -> io::Result<()> {
    // SAFETY: the caller guarantees `fd` is open.
    let fd = unsafe { BorrowedFd::borrow_raw(fd) };
    set_cloexec(fd, false).map_err(io::Error::from)
}

/// Move `fd` to a number at or above `min`, keeping close-on-exec. The
/// original descriptor is closed.
fn lift_above(fd: OwnedFd, min: RawFd) -> Result<OwnedFd, Errno> {
    if fd.as_raw_fd() >= min {
        return Ok(fd);
    }
    let lifted = fcntl(&fd, FcntlArg::F_DUPFD_CLOEXEC(min))?;
    // SAFETY: F_DUPFD_CLOEXEC returned a new descriptor that nothing else owns.
    Ok(unsafe { OwnedFd::from_raw_fd(lifted) })
}

fn into_async(read: OwnedFd, write: OwnedFd) -> io::Result<(Receiver, Sender)> {
    let receiver = Receiver::from_owned_fd(read)?;
    let sender = Sender::from_owned_fd(write)?;
    Ok((receiver, sender))
}

/// All four ends of a freshly created channel.
pub struct ChannelPair {
    host: HostEnds,
    worker: WorkerEnds,
}

impl ChannelPair {
    pub fn create() -> Result<Self, ChannelError> {
        let (to_worker_read, to_worker_write) = pipe()?;
        let (to_host_read, to_host_write) = pipe()?;

        for fd in [
            &to_worker_read,
            &to_worker_write,
            &to_host_read,
            &to_host_write,
        ] {
            set_cloexec(fd, true)?;
        }
        // A host started with stdio closed gets low numbers from pipe().
        let to_worker_read = lift_above(to_worker_read, MIN_WORKER_FD)?;
        let to_host_write = lift_above(to_host_write, MIN_WORKER_FD)?;

        tracing::trace!(
            to_worker_read = to_worker_read.as_raw_fd(),
            to_worker_write = to_worker_write.as_raw_fd(),
            to_host_read = to_host_read.as_raw_fd(),
            to_host_write = to_host_write.as_raw_fd(),
            "Created channel pair"
        );

        Ok(Self {
            host: HostEnds {
                read: to_host_read,
                write: to_worker_write,
            },
            worker: WorkerEnds {
                read: to_worker_read,
                write: to_host_write,
            },
        })
    }

    pub fn split(self) -> (HostEnds, WorkerEnds) {
        (self.host, self.worker)
    }
}

/// Ends kept by the host: read of worker→host, write of host→worker.
pub struct HostEnds {
    read: OwnedFd,
    write: OwnedFd,
}

impl HostEnds {
    /// Register the ends with the tokio reactor. Must run inside a runtime.
    pub fn into_async(self) -> io::Result<(Receiver, Sender)> {
        into_async(self.read, self.write)
    }
}

/// Ends used by the worker: read of host→worker, write of worker→host.
pub struct WorkerEnds {
    read: OwnedFd,
    write: OwnedFd,
}

impl WorkerEnds {
    pub fn info(&self, session: SessionId) -> ChildChannelInfo {
        ChildChannelInfo {
            session,
            read_fd: self.read.as_raw_fd(),
            write_fd: self.write.as_raw_fd(),
        }
    }

    pub(crate) fn raw_fds(&self) -> [RawFd; 2] {
        [self.read.as_raw_fd(), self.write.as_raw_fd()]
    }

    /// Take ownership of the descriptors named in `info`.
    ///
    /// Both descriptors are checked to be open and are set close-on-exec
    /// again, so the worker's own children do not inherit them.
    ///
    /// # Safety
    ///
    /// The descriptors must belong to this process and nothing else may own
    /// or close them afterwards.
    pub unsafe fn from_info(info: &ChildChannelInfo) -> Result<Self, ChannelError> {
        if info.read_fd == info.write_fd {
            return Err(ChannelError::InvalidHandle { fd: info.write_fd });
        }
        for fd in [info.read_fd, info.write_fd] {
            if fd < MIN_WORKER_FD {
                return Err(ChannelError::InvalidHandle { fd });
            }
            // SAFETY: fd is above stdio; F_GETFD on a closed fd only reports EBADF.
            let borrowed = unsafe { BorrowedFd::borrow_raw(fd) };
            match fcntl(borrowed, FcntlArg::F_GETFD) {
                Ok(_) => {}
                Err(Errno::EBADF) => return Err(ChannelError::InvalidHandle { fd }),
                Err(e) => return Err(e.into()),
            }
        }

        // SAFETY: both fds are open and the caller guarantees exclusive ownership.
        let (read, write) = unsafe {
            (
                OwnedFd::from_raw_fd(info.read_fd),
                OwnedFd::from_raw_fd(info.write_fd),
            )
        };
        set_cloexec(&read, true)?;
        set_cloexec(&write, true)?;

        Ok(Self { read, write })
    }

    /// Claim the descriptors the host passed through [`CHANNEL_ENV`]. Works
    /// once per process.
    pub fn from_env() -> Result<(SessionId, Self), ChannelError> {
        let info = ChildChannelInfo::from_env()?;
        if CLAIMED.swap(true, Ordering::SeqCst) {
            return Err(ChannelError::AlreadyClaimed);
        }
        // SAFETY: the host handed these descriptors to this process alone and
        // CLAIMED ensures they are taken at most once.
        let ends = unsafe { Self::from_info(&info)? };
        tracing::debug!(
            session = %info.session,
            read_fd = info.read_fd,
            write_fd = info.write_fd,
            "Claimed inherited channel"
        );
        Ok((info.session, ends))
    }

    /// Register the ends with the tokio reactor. Must run inside a runtime.
    pub fn into_async(self) -> io::Result<(Receiver, Sender)> {
        into_async(self.read, self.write)
    }
}
