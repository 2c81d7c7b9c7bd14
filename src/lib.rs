//! RDMA-accelerated transport endpoint.
//!
//! A per-connection state machine that establishes an RC queue-pair
//! alongside an existing TCP socket and moves application bytes over
//! Send-with-Immediate work requests:
//!
//! - **Handshake** piggybacking on the byte stream: hello + nonce out, the
//!   server's socket id back, then an rdmacm connect bound to that socket.
//!   Peers that do not speak RDMA fall back to the plain stream.
//! - **Credit-based flow control**: the window tracks the peer's receive
//!   queue; ACKs piggyback on data sends in the immediate field, with pure
//!   ACKs when traffic is one-sided.
//! - **Completion suppression**: sends are signaled and solicited in
//!   batches to keep CQE volume and peer wakeups down.
//! - **Zero-copy buffers**: scatter/gather lists are cut out of chunked
//!   buffers whose blocks live in pre-registered memory; blocks allocated
//!   before registration are copied into the pool once.
//!
//! The host byte-stream connection, event dispatcher, message parser, and
//! connection manager are collaborators reached through traits; see
//! [`transport`] and [`drivers::rdma`]. Hardware-backed implementations
//! (device context, memory registration, CQ polling) live behind the
//! `rdma` feature.

pub mod config;
pub mod drivers;
pub mod error;
pub mod memory;
pub mod transport;

pub use config::RdmaConfig;
pub use error::{Error, Result};
