//! Connection-manager abstraction.
//!
//! Wraps the rdmacm event stream and queue-pair creation behind a trait so
//! the handshake state machine can be driven by any event source. All calls
//! are non-blocking: operations that would wait report [`CmProgress::Pending`]
//! and complete later through an event on the CM descriptor.

use std::io;
use std::net::SocketAddr;
use std::os::unix::io::RawFd;
use std::sync::Arc;

use super::cq::CqHandle;
use super::verbs::RdmaQp;

/// Event tags surfaced by the connection manager (plus the internal accept
/// wakeup delivered over the pipe).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CmEvent {
    None,
    AddrResolved,
    RouteResolved,
    Established,
    Accept,
    Disconnect,
    Other,
    Error,
}

/// Outcome of a non-blocking CM call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CmProgress {
    /// Completed synchronously; the state machine may advance directly.
    Done,
    /// In flight; completion arrives as a CM event.
    Pending,
}

/// One rdmacm identifier bound to a connection attempt.
pub trait RdmaCm: Send {
    /// Descriptor to register with the event dispatcher.
    fn get_fd(&self) -> RawFd;

    /// Drain one pending event, or [`CmEvent::None`].
    fn get_cm_event(&mut self) -> CmEvent;

    fn resolve_addr(&mut self, remote: SocketAddr) -> io::Result<CmProgress>;

    fn resolve_route(&mut self) -> io::Result<CmProgress>;

    /// Initiate the connect carrying `private_data` (the serialized
    /// connect-request).
    fn connect(&mut self, private_data: &[u8]) -> io::Result<CmProgress>;

    /// Accept the pending request carrying `private_data` (the serialized
    /// connect-response).
    fn accept(&mut self, private_data: &[u8]) -> io::Result<CmProgress>;

    /// Private data attached to the peer's connect-response, if any.
    fn conn_data(&self) -> Option<Vec<u8>>;

    /// Create the RC queue-pair attached to `cq`; completions carry `wr_id`.
    fn create_qp(
        &mut self,
        sq_depth: u32,
        rq_depth: u32,
        cq: &Arc<dyn CqHandle>,
        wr_id: u64,
    ) -> io::Result<Arc<dyn RdmaQp>>;
}

/// Creates CM identifiers for client-side connects.
pub trait CmFactory: Send + Sync {
    fn create(&self) -> io::Result<Box<dyn RdmaCm>>;
}
