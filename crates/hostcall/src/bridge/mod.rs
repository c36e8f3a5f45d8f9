//! IPC bridge between a host and its worker subprocess.
//!
//! # Architecture
//!
//! - **codec**: length-prefixed message framing over AsyncRead/AsyncWrite
//! - **protocol**: requests (name + argument), responses, session errors
//! - **channel**: the inherited pipe pair and its handoff to the worker

#[cfg(unix)]
pub mod channel;
pub mod codec;
pub mod protocol;
