//! Two-sided handshake state machine.
//!
//! The RDMA connection is negotiated on top of an already-connected byte
//! stream so that ordinary tooling still sees a TCP connection, and so the
//! accept path can bind an incoming rdmacm request to its originating
//! socket:
//!
//! 1. the client writes a hello (magic + nonce) on the stream,
//! 2. the server stores the nonce and replies with its socket id (`sid`),
//!    or 0 when it does not speak RDMA,
//! 3. the client connects through rdmacm carrying `sid` and the nonce,
//! 4. the listener looks the endpoint up by `sid`, verifies the nonce, and
//!    wakes the endpoint's state machine through its pipe.
//!
//! [`Endpoint::handshake`] multiplexes three event sources in order: bytes
//! on the stream, the CM event channel, and the wakeup pipe. Synchronous CM
//! completions collapse several transitions into one call by looping until
//! the next step would suspend.

use std::io;
use std::os::unix::io::RawFd;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use rand::Rng;
use tracing::warn;

use super::protocol::{
    ConnectRequest, ConnectResponse, HELLO_LENGTH, MAGIC_LENGTH, MAGIC_STR, SID_LENGTH,
};
use super::{Endpoint, HandshakeProgress, HandshakeState, Status};
use crate::drivers::rdma::cm::{CmEvent, CmProgress, RdmaCm};
use crate::error::{Error, Result};
use crate::transport::RdmaState;

fn init_pipe(pipefd: &mut [RawFd; 2]) -> Result<()> {
    debug_assert!(pipefd[0] < 0 && pipefd[1] < 0);
    let mut fds = [0i32; 2];
    if unsafe { libc::pipe(fds.as_mut_ptr()) } != 0 {
        return Err(io::Error::last_os_error().into());
    }
    for fd in fds {
        unsafe {
            libc::fcntl(fd, libc::F_SETFD, libc::FD_CLOEXEC);
            let flags = libc::fcntl(fd, libc::F_GETFL);
            libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK);
        }
    }
    pipefd[0] = fds[0];
    pipefd[1] = fds[1];
    Ok(())
}

/// Write the whole buffer, retrying short and would-block writes. Only used
/// for the few handshake bytes at the start of a connection, where a single
/// write almost always suffices.
fn write_all_fd(fd: RawFd, buf: &[u8]) -> Result<()> {
    let mut written = 0;
    while written < buf.len() {
        let nw = unsafe {
            libc::write(
                fd,
                buf[written..].as_ptr() as *const libc::c_void,
                buf.len() - written,
            )
        };
        if nw < 0 {
            let e = io::Error::last_os_error();
            match e.kind() {
                io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted => continue,
                _ => return Err(e.into()),
            }
        }
        written += nw as usize;
    }
    Ok(())
}

impl Endpoint {
    /// Client-side kickoff: decide whether the peer may use RDMA at all,
    /// write the hello, and publish the initial window.
    pub fn start_handshake(&self) -> Result<()> {
        let mut hs = self.lock_hs();
        debug_assert_eq!(hs.status, Status::Uninitialized);

        if !(self.ctx.in_cluster)(self.conn.remote_side().ip()) {
            warn!("destination is not in the rdma cluster");
            self.conn.set_rdma_state(RdmaState::Off);
            self.open_start_gate();
            return Ok(());
        }
        hs.status = Status::HelloC;

        let mut hello = [0u8; HELLO_LENGTH];
        hello[..MAGIC_LENGTH].copy_from_slice(MAGIC_STR);
        rand::thread_rng().fill(&mut hs.rand_str[..]);
        hello[MAGIC_LENGTH..].copy_from_slice(&hs.rand_str);

        self.window.store(self.sq_size, Ordering::Release);
        // The reactor may fire as soon as the gate opens; it still serializes
        // behind the state lock held here until the hello is out.
        self.open_start_gate();

        if let Err(e) = write_all_fd(self.conn.fd(), &hello) {
            warn!("failed to write hello on fd={}: {e}", self.conn.fd());
            return Err(e);
        }
        Ok(())
    }

    /// Advance the handshake by one event: bytes on the stream first, then
    /// the CM channel, then the wakeup pipe.
    pub fn handshake(self: &Arc<Self>) -> Result<HandshakeProgress> {
        let client = self.conn.created_by_connect();
        if client && self.status() == Status::Uninitialized {
            // The kickoff publishes the window and hello before opening the
            // gate, so everything it wrote is visible after this returns.
            self.wait_started();
        }
        let mut hs = self.lock_hs();

        let max_len = HELLO_LENGTH.max(SID_LENGTH);
        let read_len = match hs.handshake_buf.append_from_fd(self.conn.fd(), max_len) {
            Ok(0) => return Ok(HandshakeProgress::Closed),
            Ok(n) => n,
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => 0,
            Err(e) => return Err(e.into()),
        };

        let mut event = CmEvent::None;
        if read_len == 0 {
            if let Some(rcm) = hs.rcm.as_mut() {
                event = rcm.get_cm_event();
            }
            if event == CmEvent::None {
                if hs.pipefd[0] < 0 {
                    return Err(Error::Protocol("no handshake event source"));
                }
                let mut byte = 0u8;
                let nr = unsafe {
                    libc::read(hs.pipefd[0], (&mut byte as *mut u8).cast(), 1)
                };
                match nr {
                    1 => event = CmEvent::Accept,
                    0 => return Err(Error::Protocol("handshake pipe closed")),
                    _ => {
                        let e = io::Error::last_os_error();
                        if e.kind() == io::ErrorKind::WouldBlock {
                            return Ok(HandshakeProgress::Again);
                        }
                        return Err(e.into());
                    }
                }
            }
        }

        if matches!(event, CmEvent::Other | CmEvent::Error) {
            return Err(Error::Cm("unexpected connection manager event".into()));
        }

        if client {
            self.handshake_at_client(&mut hs, event)
        } else {
            self.handshake_at_server(&mut hs, event)
        }
    }

    /// CM-descriptor readiness entry point: drains one CM event while the
    /// byte stream is quiet and routes it into the state machine.
    pub fn complete_handshake(self: &Arc<Self>) -> Result<HandshakeProgress> {
        let mut hs = self.lock_hs();
        let event = match hs.rcm.as_mut() {
            Some(rcm) => rcm.get_cm_event(),
            None => return Err(Error::Protocol("no connection manager")),
        };
        match event {
            CmEvent::Established | CmEvent::Disconnect => {
                if self.conn.created_by_connect() {
                    self.handshake_at_client(&mut hs, event)
                } else {
                    self.handshake_at_server(&mut hs, event)
                }
            }
            CmEvent::None => Ok(HandshakeProgress::Again),
            _ => Err(Error::Cm(format!("unexpected event {:?}", event))),
        }
    }

    fn handshake_at_client(
        self: &Arc<Self>,
        hs: &mut HandshakeState,
        event: CmEvent,
    ) -> Result<HandshakeProgress> {
        // `event` is consumed by the first state that inspects it; states
        // reached by a synchronous CM completion see `None` and skip the
        // check (the original's direct-pass fall-through).
        let mut event = Some(event);
        loop {
            match hs.status {
                Status::HelloC => {
                    if !matches!(event.take(), Some(CmEvent::None)) {
                        return Err(Error::Protocol("unexpected event before server reply"));
                    }
                    if hs.handshake_buf.len() < SID_LENGTH {
                        return Ok(HandshakeProgress::Again);
                    }
                    let mut tmp = [0u8; SID_LENGTH];
                    hs.handshake_buf.copy_to(&mut tmp);
                    hs.handshake_buf.cutn_discard(SID_LENGTH);
                    let sid = u64::from_be_bytes(tmp);
                    if sid == 0 {
                        // Server does not speak RDMA; whatever follows the
                        // reply is application data.
                        if !hs.handshake_buf.is_empty() {
                            self.conn
                                .read_buf()
                                .lock()
                                .expect("read buffer poisoned")
                                .append_buf(&mut hs.handshake_buf);
                        }
                        self.conn.set_rdma_state(RdmaState::Off);
                        self.conn.wake_as_epoll_out();
                        return Ok(HandshakeProgress::Again);
                    }
                    hs.handshake_buf.clear();
                    hs.remote_sid = sid;

                    let rcm = self
                        .ctx
                        .cm_factory
                        .create()
                        .map_err(|e| Error::Cm(e.to_string()))?;
                    if let Err(e) = self.ctx.dispatcher.add_consumer(self.conn.id(), rcm.get_fd())
                    {
                        warn!("failed to add rdmacm fd into event dispatcher: {e}");
                        return Err(e.into());
                    }
                    hs.rcm = Some(rcm);

                    hs.status = Status::AddrResolving;
                    let remote = self.conn.remote_side();
                    let rcm = hs.rcm.as_mut().ok_or(Error::Protocol("no cm"))?;
                    match rcm.resolve_addr(remote) {
                        Ok(CmProgress::Done) => continue,
                        Ok(CmProgress::Pending) => return Ok(HandshakeProgress::Again),
                        Err(e) => return Err(Error::Cm(e.to_string())),
                    }
                }
                Status::AddrResolving => {
                    if let Some(ev) = event.take() {
                        if ev != CmEvent::AddrResolved {
                            return Err(Error::Protocol("expected address resolution"));
                        }
                    }
                    hs.status = Status::RouteResolving;
                    let rcm = hs.rcm.as_mut().ok_or(Error::Protocol("no cm"))?;
                    match rcm.resolve_route() {
                        Ok(CmProgress::Done) => continue,
                        Ok(CmProgress::Pending) => return Ok(HandshakeProgress::Again),
                        Err(e) => return Err(Error::Cm(e.to_string())),
                    }
                }
                Status::RouteResolving => {
                    if let Some(ev) = event.take() {
                        if ev != CmEvent::RouteResolved {
                            return Err(Error::Protocol("expected route resolution"));
                        }
                    }
                    if let Err(e) = self.allocate_resources(hs) {
                        warn!("failed to allocate resources for rdma: {e}");
                        return Err(e);
                    }

                    let req = ConnectRequest {
                        sid: hs.remote_sid,
                        rand_str: hs.rand_str,
                        rq_size: self.rq_size as u32,
                        sq_size: self.sq_size as u32,
                    };
                    hs.status = Status::Connecting;
                    let rcm = hs.rcm.as_mut().ok_or(Error::Protocol("no cm"))?;
                    match rcm.connect(&req.serialize()) {
                        Ok(CmProgress::Done) => continue,
                        Ok(CmProgress::Pending) => return Ok(HandshakeProgress::Again),
                        Err(e) => return Err(Error::Cm(e.to_string())),
                    }
                }
                Status::Connecting => {
                    if let Some(ev) = event.take() {
                        if ev != CmEvent::Established {
                            return Err(Error::Protocol("expected establishment"));
                        }
                    }
                    let rcm = hs.rcm.as_ref().ok_or(Error::Protocol("no cm"))?;
                    let data = rcm
                        .conn_data()
                        .ok_or(Error::Protocol("missing connect response"))?;
                    let res = ConnectResponse::deserialize(&data)
                        .ok_or(Error::Protocol("short connect response"))?;
                    if (res.rq_size as usize) < self.sq_size {
                        self.local_window_capacity
                            .store(res.rq_size as usize, Ordering::Relaxed);
                        self.window.store(res.rq_size as usize, Ordering::Relaxed);
                    }
                    if (res.sq_size as usize) < self.rq_size {
                        self.remote_window_capacity
                            .store(res.sq_size as usize, Ordering::Relaxed);
                    }

                    hs.status = Status::Established;
                    self.conn.set_rdma_state(RdmaState::On);
                    self.conn.wake_as_epoll_out();
                    return Ok(HandshakeProgress::Again);
                }
                Status::Established => {
                    return match event.take() {
                        Some(CmEvent::Disconnect) => Ok(HandshakeProgress::Done),
                        _ => Err(Error::Protocol("unexpected event when established")),
                    };
                }
                _ => return Err(Error::Protocol("incorrect rdma handshake protocol")),
            }
        }
    }

    fn handshake_at_server(
        self: &Arc<Self>,
        hs: &mut HandshakeState,
        event: CmEvent,
    ) -> Result<HandshakeProgress> {
        let mut event = Some(event);
        loop {
            match hs.status {
                Status::Uninitialized => {
                    if !matches!(event.take(), Some(CmEvent::None)) {
                        return Err(Error::Protocol("unexpected event before hello"));
                    }
                    if hs.handshake_buf.len() < HELLO_LENGTH {
                        return Ok(HandshakeProgress::Again);
                    }
                    let mut tmp = [0u8; HELLO_LENGTH];
                    hs.handshake_buf.copy_to(&mut tmp);
                    if &tmp[..MAGIC_LENGTH] != MAGIC_STR {
                        // Client does not speak RDMA: everything read so far
                        // is application data.
                        let mut read_buf =
                            self.conn.read_buf().lock().expect("read buffer poisoned");
                        read_buf.append_buf(&mut hs.handshake_buf);
                        self.conn.set_rdma_state(RdmaState::Off);
                        return Ok(HandshakeProgress::BytesForHost(read_buf.len()));
                    }
                    hs.rand_str.copy_from_slice(&tmp[MAGIC_LENGTH..HELLO_LENGTH]);

                    init_pipe(&mut hs.pipefd)?;

                    hs.handshake_buf.clear();
                    hs.status = Status::HelloS;
                    let sid = self.conn.id().to_be_bytes();
                    if let Err(e) = write_all_fd(self.conn.fd(), &sid) {
                        warn!("failed to write on fd={}: {e}", self.conn.fd());
                        return Err(e);
                    }
                    return Ok(HandshakeProgress::Again);
                }
                Status::HelloS => {
                    if !matches!(event.take(), Some(CmEvent::Accept)) {
                        return Err(Error::Protocol("expected accept wakeup"));
                    }
                    if let Err(e) = self.allocate_resources(hs) {
                        warn!("failed to allocate resources for rdma: {e}");
                        return Err(e);
                    }
                    {
                        let rcm = hs.rcm.as_ref().ok_or(Error::Protocol("no cm"))?;
                        if let Err(e) =
                            self.ctx.dispatcher.add_consumer(self.conn.id(), rcm.get_fd())
                        {
                            warn!("failed to add rdmacm fd into event dispatcher: {e}");
                            return Err(e.into());
                        }
                    }

                    let res = ConnectResponse {
                        rq_size: self.rq_size as u32,
                        sq_size: self.sq_size as u32,
                    };
                    hs.status = Status::Accepting;
                    let rcm = hs.rcm.as_mut().ok_or(Error::Protocol("no cm"))?;
                    match rcm.accept(&res.serialize()) {
                        Ok(CmProgress::Done) => continue,
                        Ok(CmProgress::Pending) => return Ok(HandshakeProgress::Again),
                        Err(e) => return Err(Error::Cm(e.to_string())),
                    }
                }
                Status::Accepting => {
                    if let Some(ev) = event.take() {
                        if ev != CmEvent::Established {
                            return Err(Error::Protocol("expected establishment"));
                        }
                    }
                    hs.status = Status::Established;
                    self.conn.set_rdma_state(RdmaState::On);
                    return Ok(HandshakeProgress::Again);
                }
                Status::Established => {
                    return match event.take() {
                        Some(CmEvent::Disconnect) => Ok(HandshakeProgress::Done),
                        _ => Err(Error::Protocol("unexpected event when established")),
                    };
                }
                _ => return Err(Error::Protocol("incorrect rdma handshake protocol")),
            }
        }
    }

    /// Adopt the CM of a verified accept and wake the handshake driver.
    ///
    /// Any mismatch is reported as an error for the caller to drop; the
    /// connection itself is only failed when the dispatcher registration
    /// fails (past that point the endpoint cannot make progress).
    pub(crate) fn init_from_accept(
        &self,
        rcm: Box<dyn RdmaCm>,
        req: &ConnectRequest,
    ) -> Result<()> {
        let mut hs = self.lock_hs();
        if hs.rand_str != req.rand_str {
            return Err(Error::Protocol("random number is not matched"));
        }
        if hs.rcm.is_some() {
            return Err(Error::Protocol("rdma connection already exists"));
        }
        if hs.pipefd[0] < 0 {
            return Err(Error::Protocol("endpoint has no accept pipe"));
        }
        hs.rcm = Some(rcm);

        if let Err(e) = self
            .ctx
            .dispatcher
            .add_consumer(self.conn.id(), hs.pipefd[0])
        {
            let errno = e.raw_os_error().unwrap_or(libc::EIO);
            self.conn
                .set_failed(errno, "failed to add pipe fd to event dispatcher");
            return Err(e.into());
        }

        self.negotiate_from_request(req);

        write_all_fd(hs.pipefd[1], &[0u8])
    }
}
