//! Per-connection RDMA endpoint.
//!
//! One endpoint is attached to one established byte-stream connection. It
//! negotiates an RC queue-pair bound to the same logical socket, then moves
//! application bytes over Send-with-Immediate work requests under
//! credit-based flow control, with piggyback ACKs carried in the
//! immediate-data field.
//!
//! Three actors drive an endpoint concurrently: the I/O reactor calling
//! [`Endpoint::handshake`] and the send path, the completion pump, and the
//! listener's accept thread. The send and receive rings are
//! single-producer/single-consumer between the send path (advances
//! `sq_current`) and the pump (advances `sq_sent`, reposts at
//! `rq_received`); the credit window and pending-ACK counters are atomics.

mod handshake;
pub mod protocol;
mod pump;
mod recv;
mod send;

pub use pump::CompletionPump;

use std::net::IpAddr;
use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};

use crate::config::RdmaConfig;
use crate::drivers::rdma::cm::{CmFactory, RdmaCm};
use crate::drivers::rdma::cq::{CqBroker, CqHandle};
use crate::drivers::rdma::verbs::RdmaQp;
use crate::error::{Error, Result};
use crate::memory::{BlockPool, ChunkedBuf, MemoryRegistry};
use crate::transport::{EventDispatcher, HostConnection, MessageFramer};

use protocol::{ConnectRequest, RANDOM_LENGTH, RESERVED_WR_NUM};

/// Predicate deciding whether a remote address may use RDMA at all.
pub type ClusterFilter = Box<dyn Fn(IpAddr) -> bool + Send + Sync>;

/// Shared collaborators every endpoint of a host needs.
pub struct EndpointContext {
    pub dispatcher: Arc<dyn EventDispatcher>,
    pub cq_broker: Arc<dyn CqBroker>,
    pub cm_factory: Arc<dyn CmFactory>,
    pub registry: Arc<MemoryRegistry>,
    pub pool: Arc<BlockPool>,
    pub framer: Arc<dyn MessageFramer>,
    /// RDMA needs switch-level PFC/ECN, so it is confined to a cluster;
    /// peers outside it stay on the plain byte stream.
    pub in_cluster: ClusterFilter,
}

/// Handshake lifecycle. Transitions are monotonic along one side's path;
/// only [`Endpoint::reset`] returns to `Uninitialized`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    Uninitialized,
    HelloC,
    HelloS,
    AddrResolving,
    RouteResolving,
    Connecting,
    Accepting,
    Established,
}

/// Outcome of one handshake step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeProgress {
    /// Waiting for the next event; re-dispatch on readiness.
    Again,
    /// Graceful disconnect observed in the established state.
    Done,
    /// The peer is not RDMA-capable; its bytes were moved to the host read
    /// buffer (total now available).
    BytesForHost(usize),
    /// End of stream on the byte-stream descriptor.
    Closed,
}

pub(crate) struct HandshakeState {
    pub(crate) status: Status,
    pub(crate) handshake_buf: ChunkedBuf,
    pub(crate) rand_str: [u8; RANDOM_LENGTH],
    pub(crate) remote_sid: u64,
    pub(crate) pipefd: [RawFd; 2],
    pub(crate) rcm: Option<Box<dyn RdmaCm>>,
}

pub(crate) struct SendRing {
    /// Retainer per in-flight send; a slot stays non-empty until the peer's
    /// ACK covers it.
    pub(crate) sbuf: Vec<ChunkedBuf>,
    /// Next slot to fill.
    pub(crate) sq_current: usize,
    /// Oldest unacknowledged slot.
    pub(crate) sq_sent: usize,
    pub(crate) sq_unsignaled: usize,
    pub(crate) unsolicited: usize,
    pub(crate) accumulated_ack: usize,
}

pub(crate) struct RecvRing {
    pub(crate) rbuf: Vec<ChunkedBuf>,
    /// Raw base address of each posted block, for copy-mode delivery and
    /// reposting.
    pub(crate) rbuf_data: Vec<usize>,
    /// Next slot to repost.
    pub(crate) rq_received: usize,
}

/// One-shot open gate: the client handshake parks here until
/// `start_handshake` has published the initial window.
struct StartGate {
    opened: Mutex<bool>,
    cv: Condvar,
}

impl StartGate {
    fn new() -> Self {
        Self {
            opened: Mutex::new(false),
            cv: Condvar::new(),
        }
    }

    fn open(&self) {
        let mut opened = self.opened.lock().expect("start gate poisoned");
        *opened = true;
        self.cv.notify_all();
    }

    fn close(&self) {
        *self.opened.lock().expect("start gate poisoned") = false;
    }

    fn wait(&self) {
        let mut opened = self.opened.lock().expect("start gate poisoned");
        while !*opened {
            opened = self.cv.wait(opened).expect("start gate poisoned");
        }
    }
}

pub struct Endpoint {
    conn: Arc<dyn HostConnection>,
    ctx: Arc<EndpointContext>,
    config: RdmaConfig,

    /// Configured queue depths (fixed after construction; the *windows*
    /// negotiate down, the depths do not).
    sq_size: usize,
    rq_size: usize,

    /// Credits granted by the peer (≤ `sq_size`).
    local_window_capacity: AtomicUsize,
    /// Credits we grant the peer (≤ `rq_size`).
    remote_window_capacity: AtomicUsize,
    /// Available send credits.
    window: AtomicUsize,
    /// Receive completions not yet reflected back to the peer as credit.
    new_rq_wrs: AtomicU32,

    start_gate: StartGate,

    hs: Mutex<HandshakeState>,
    sq: Mutex<SendRing>,
    rq: Mutex<RecvRing>,
    qp: Mutex<Option<Arc<dyn RdmaQp>>>,
    rcq: Mutex<Option<Arc<dyn CqHandle>>>,
    pump: Mutex<Option<CompletionPump>>,
}

impl Endpoint {
    pub fn new(
        conn: Arc<dyn HostConnection>,
        ctx: Arc<EndpointContext>,
        config: RdmaConfig,
    ) -> Arc<Self> {
        let sq_size = config.sq_size();
        let rq_size = config.rq_size();
        Arc::new(Self {
            conn,
            ctx,
            config,
            sq_size,
            rq_size,
            local_window_capacity: AtomicUsize::new(sq_size),
            remote_window_capacity: AtomicUsize::new(rq_size),
            window: AtomicUsize::new(sq_size),
            new_rq_wrs: AtomicU32::new(0),
            start_gate: StartGate::new(),
            hs: Mutex::new(HandshakeState {
                status: Status::Uninitialized,
                handshake_buf: ChunkedBuf::new(),
                rand_str: [0; RANDOM_LENGTH],
                remote_sid: 0,
                pipefd: [-1, -1],
                rcm: None,
            }),
            sq: Mutex::new(SendRing {
                sbuf: Vec::new(),
                sq_current: 0,
                sq_sent: 0,
                sq_unsignaled: 0,
                unsolicited: 0,
                accumulated_ack: 0,
            }),
            rq: Mutex::new(RecvRing {
                rbuf: Vec::new(),
                rbuf_data: Vec::new(),
                rq_received: 0,
            }),
            qp: Mutex::new(None),
            rcq: Mutex::new(None),
            pump: Mutex::new(None),
        })
    }

    #[inline]
    pub fn conn(&self) -> &Arc<dyn HostConnection> {
        &self.conn
    }

    #[inline]
    pub(crate) fn framer(&self) -> &Arc<dyn MessageFramer> {
        &self.ctx.framer
    }

    pub fn status(&self) -> Status {
        self.lock_hs().status
    }

    /// True when at least one send credit is available.
    pub fn is_writable(&self) -> bool {
        self.window.load(Ordering::Relaxed) > 0
    }

    pub fn window(&self) -> usize {
        self.window.load(Ordering::Relaxed)
    }

    pub fn local_window_capacity(&self) -> usize {
        self.local_window_capacity.load(Ordering::Relaxed)
    }

    pub fn remote_window_capacity(&self) -> usize {
        self.remote_window_capacity.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn sq_size(&self) -> usize {
        self.sq_size
    }

    #[inline]
    pub fn rq_size(&self) -> usize {
        self.rq_size
    }

    pub(crate) fn lock_hs(&self) -> MutexGuard<'_, HandshakeState> {
        self.hs.lock().expect("handshake state poisoned")
    }

    pub(crate) fn lock_sq(&self) -> MutexGuard<'_, SendRing> {
        self.sq.lock().expect("send ring poisoned")
    }

    pub(crate) fn lock_rq(&self) -> MutexGuard<'_, RecvRing> {
        self.rq.lock().expect("recv ring poisoned")
    }

    pub(crate) fn current_qp(&self) -> Result<Arc<dyn RdmaQp>> {
        self.qp
            .lock()
            .expect("qp slot poisoned")
            .clone()
            .ok_or(Error::Protocol("queue pair not allocated"))
    }

    /// Acquire the CQ handle, start the completion task if the CQ is
    /// shared, create the QP, and prefill the receive queue.
    pub(crate) fn allocate_resources(
        self: &Arc<Self>,
        hs: &mut HandshakeState,
    ) -> Result<()> {
        let pump = CompletionPump::new(Arc::downgrade(self));

        // CQ capacity is hard to estimate; twice the SQ+RQ sum works.
        let capacity = 2 * (self.sq_size + self.rq_size);
        let rcq = self
            .ctx
            .cq_broker
            .get_one(self.conn.id(), capacity, pump.clone())
            .map_err(|e| Error::Resource(e.to_string()))?;

        if rcq.is_shared() && self.config.usercode_in_pthread {
            pump.start_worker(self.conn.id());
        }

        let rcm = hs
            .rcm
            .as_mut()
            .ok_or(Error::Protocol("no connection manager"))?;
        let qp = rcm
            .create_qp(
                (self.sq_size + RESERVED_WR_NUM) as u32,
                (self.rq_size + RESERVED_WR_NUM) as u32,
                &rcq,
                self.conn.id(),
            )
            .map_err(|e| Error::Rdma(e.to_string()))?;

        *self.qp.lock().expect("qp slot poisoned") = Some(qp);
        *self.rcq.lock().expect("cq slot poisoned") = Some(rcq);
        *self.pump.lock().expect("pump slot poisoned") = Some(pump);

        {
            let mut sq = self.lock_sq();
            sq.sbuf = (0..self.sq_size).map(|_| ChunkedBuf::new()).collect();
            sq.sq_current = 0;
            sq.sq_sent = 0;
        }
        let ring_len = self.rq_size + RESERVED_WR_NUM;
        {
            let mut rq = self.lock_rq();
            rq.rbuf = (0..ring_len).map(|_| ChunkedBuf::new()).collect();
            rq.rbuf_data = vec![0; ring_len];
            rq.rq_received = 0;
        }

        self.post_recv(ring_len as u32)
    }

    /// Stop the completion task (without joining it), drop the buffers and
    /// the CM, and give the CQ handle back.
    pub(crate) fn deallocate_resources(&self, hs: &mut HandshakeState) {
        if let Some(pump) = self.pump.lock().expect("pump slot poisoned").take() {
            pump.stop();
        }
        {
            let mut sq = self.lock_sq();
            sq.sbuf.clear();
        }
        {
            let mut rq = self.lock_rq();
            rq.rbuf.clear();
            rq.rbuf_data.clear();
        }
        hs.rcm = None;
        if let Some(rcq) = self.rcq.lock().expect("cq slot poisoned").take() {
            if rcq.is_shared() {
                rcq.release();
            }
        }
        *self.qp.lock().expect("qp slot poisoned") = None;
    }

    /// Release everything and return to `Uninitialized`.
    pub fn reset(&self) {
        let mut hs = self.lock_hs();
        for fd in hs.pipefd.iter_mut() {
            if *fd >= 0 {
                unsafe { libc::close(*fd) };
                *fd = -1;
            }
        }

        self.deallocate_resources(&mut hs);

        hs.status = Status::Uninitialized;
        hs.handshake_buf.clear();
        hs.remote_sid = 0;
        hs.rand_str = [0; RANDOM_LENGTH];
        {
            let mut sq = self.lock_sq();
            sq.sq_current = 0;
            sq.sq_sent = 0;
            sq.sq_unsignaled = 0;
            sq.unsolicited = 0;
            sq.accumulated_ack = 0;
        }
        self.lock_rq().rq_received = 0;
        self.local_window_capacity.store(self.sq_size, Ordering::Relaxed);
        self.remote_window_capacity.store(self.rq_size, Ordering::Relaxed);
        self.window.store(self.sq_size, Ordering::Relaxed);
        self.new_rq_wrs.store(0, Ordering::Relaxed);
        self.start_gate.close();
    }

    pub(crate) fn wait_started(&self) {
        self.start_gate.wait();
    }

    pub(crate) fn open_start_gate(&self) {
        self.start_gate.open();
    }

    /// Negotiate windows against the peer's advertised queue sizes.
    pub(crate) fn negotiate_from_request(&self, req: &ConnectRequest) {
        if self.sq_size > req.rq_size as usize {
            self.local_window_capacity
                .store(req.rq_size as usize, Ordering::Relaxed);
            self.window.store(req.rq_size as usize, Ordering::Relaxed);
        }
        if self.rq_size > req.sq_size as usize {
            self.remote_window_capacity
                .store(req.sq_size as usize, Ordering::Relaxed);
        }
    }
}

impl Drop for Endpoint {
    fn drop(&mut self) {
        self.reset();
    }
}
