//! Host-side collaborator interfaces.
//!
//! The endpoint never owns the TCP socket, the epoll loop, or the RPC
//! parser; it drives them through the traits here. The host hands the
//! endpoint a connected byte stream and readiness callbacks, and the
//! endpoint reports received bytes and failures back.

pub mod framing;

pub use framing::MessageFramer;

use std::net::SocketAddr;
use std::os::unix::io::RawFd;
use std::sync::Mutex;

use crate::memory::ChunkedBuf;

/// Whether the connection runs over the RDMA queue-pair or stays on the
/// plain byte stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RdmaState {
    Unknown,
    On,
    Off,
}

/// The established byte-stream connection the endpoint is attached to.
pub trait HostConnection: Send + Sync {
    /// Descriptor of the connected byte stream.
    fn fd(&self) -> RawFd;

    /// Host-assigned socket identifier (the `sid` of the wire protocol).
    fn id(&self) -> u64;

    fn remote_side(&self) -> SocketAddr;

    /// True on the connecting (client) side, false on the accepted side.
    fn created_by_connect(&self) -> bool;

    /// Append target for bytes delivered to the application.
    fn read_buf(&self) -> &Mutex<ChunkedBuf>;

    fn rdma_state(&self) -> RdmaState;

    fn set_rdma_state(&self, state: RdmaState);

    /// Wake a writer blocked on write-readiness.
    fn wake_as_epoll_out(&self);

    /// Fail the connection; further completions are drained undelivered.
    fn set_failed(&self, err: i32, msg: &str);

    fn failed(&self) -> bool;
}

/// Multiplexes descriptor readiness onto consumer identifiers.
pub trait EventDispatcher: Send + Sync {
    fn add_consumer(&self, socket_id: u64, fd: RawFd) -> std::io::Result<()>;
}
