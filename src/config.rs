//! Endpoint configuration knobs.

use crate::memory::DEFAULT_PAYLOAD;

/// Queue depths never drop below this, whatever the buffer sizes say.
pub const MIN_QUEUE_SIZE: usize = 16;

/// Configuration for the RDMA endpoint.
///
/// The buffer sizes are rough recommendations: the real limit is the number
/// of work requests, so the queue depths are derived by dividing by the
/// default payload block size.
#[derive(Debug, Clone)]
pub struct RdmaConfig {
    /// Nominal send buffer bytes; determines the send queue depth.
    pub sbuf_size: usize,
    /// Nominal receive buffer bytes; determines the receive queue depth.
    pub rbuf_size: usize,
    /// Deliver received blocks by reference-cut instead of copying.
    pub recv_zerocopy: bool,
    /// Run the completion pump on a dedicated OS thread instead of inline
    /// on the CQ poller.
    pub usercode_in_pthread: bool,
}

impl Default for RdmaConfig {
    fn default() -> Self {
        Self {
            sbuf_size: 1 << 20,
            rbuf_size: 1 << 20,
            recv_zerocopy: true,
            usercode_in_pthread: false,
        }
    }
}

impl RdmaConfig {
    #[inline]
    pub fn new() -> Self {
        Self::default()
    }

    #[inline]
    pub fn with_sbuf_size(mut self, bytes: usize) -> Self {
        self.sbuf_size = bytes;
        self
    }

    #[inline]
    pub fn with_rbuf_size(mut self, bytes: usize) -> Self {
        self.rbuf_size = bytes;
        self
    }

    #[inline]
    pub fn with_recv_zerocopy(mut self, enabled: bool) -> Self {
        self.recv_zerocopy = enabled;
        self
    }

    #[inline]
    pub fn with_usercode_in_pthread(mut self, enabled: bool) -> Self {
        self.usercode_in_pthread = enabled;
        self
    }

    /// Send queue depth derived from `sbuf_size`.
    #[inline]
    pub fn sq_size(&self) -> usize {
        (self.sbuf_size / DEFAULT_PAYLOAD + 1).max(MIN_QUEUE_SIZE)
    }

    /// Receive queue depth derived from `rbuf_size`.
    #[inline]
    pub fn rq_size(&self) -> usize {
        (self.rbuf_size / DEFAULT_PAYLOAD + 1).max(MIN_QUEUE_SIZE)
    }
}
