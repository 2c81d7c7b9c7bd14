use std::io;

use thiserror::Error;

/// errno reported for verbs runtime failures.
pub const ERDMA: i32 = 4001;
/// errno reported for connection-manager transport failures.
pub const ERDMACM: i32 = 4002;

/// Errors surfaced by the RDMA endpoint.
#[derive(Debug, Error)]
pub enum Error {
    /// Handshake event inconsistent with the current state.
    #[error("protocol violation: {0}")]
    Protocol(&'static str),
    /// Connection-manager transport failure.
    #[error("rdmacm: {0}")]
    Cm(String),
    /// Verbs runtime failure (post or completion error).
    #[error("rdma: {0}")]
    Rdma(String),
    /// Allocation or registration failure.
    #[error("resource: {0}")]
    Resource(String),
    /// No send credit available; retry when the window refills.
    #[error("send window exhausted")]
    WouldBlock,
    /// Underlying descriptor I/O failure.
    #[error(transparent)]
    Io(#[from] io::Error),
}

impl Error {
    /// errno delivered to `HostConnection::set_failed`.
    pub fn errno(&self) -> i32 {
        match self {
            Error::Protocol(_) => libc::EPROTO,
            Error::Cm(_) => ERDMACM,
            Error::Rdma(_) => ERDMA,
            Error::Resource(_) => libc::ENOMEM,
            Error::WouldBlock => libc::EAGAIN,
            Error::Io(e) => e.raw_os_error().unwrap_or(libc::EIO),
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
