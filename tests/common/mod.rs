//! Mock collaborators driving the endpoint without RDMA hardware.
#![allow(dead_code)]

use std::collections::VecDeque;
use std::io;
use std::net::SocketAddr;
use std::os::unix::io::{AsRawFd, RawFd};
use std::os::unix::net::UnixStream;
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use rnet::drivers::rdma::cm::{CmEvent, CmFactory, CmProgress, RdmaCm};
use rnet::drivers::rdma::cq::{CqBroker, CqHandle};
use rnet::drivers::rdma::endpoint::{CompletionPump, Endpoint, EndpointContext};
use rnet::drivers::rdma::verbs::{RdmaQp, RecvWr, SendWr};
use rnet::memory::{BlockPool, ChunkedBuf, MemoryRegistrar, MemoryRegistry, RegionHandle};
use rnet::transport::{EventDispatcher, HostConnection, MessageFramer, RdmaState};
use rnet::RdmaConfig;

pub const TEST_LKEY: u32 = 0x1234;

pub struct MockConn {
    stream: UnixStream,
    pub peer: Mutex<UnixStream>,
    id: u64,
    client: bool,
    read_buf: Mutex<ChunkedBuf>,
    state: Mutex<RdmaState>,
    pub wakes: AtomicUsize,
    failed: AtomicBool,
    pub fail_errno: AtomicI32,
}

impl MockConn {
    pub fn new(id: u64, client: bool) -> Arc<Self> {
        let (ours, peer) = UnixStream::pair().expect("socketpair");
        ours.set_nonblocking(true).expect("nonblocking");
        Arc::new(Self {
            stream: ours,
            peer: Mutex::new(peer),
            id,
            client,
            read_buf: Mutex::new(ChunkedBuf::new()),
            state: Mutex::new(RdmaState::Unknown),
            wakes: AtomicUsize::new(0),
            failed: AtomicBool::new(false),
            fail_errno: AtomicI32::new(0),
        })
    }

    pub fn peer_write(&self, bytes: &[u8]) {
        use std::io::Write;
        self.peer.lock().unwrap().write_all(bytes).unwrap();
    }

    pub fn peer_read_exact(&self, n: usize) -> Vec<u8> {
        use std::io::Read;
        let mut out = vec![0u8; n];
        self.peer.lock().unwrap().read_exact(&mut out).unwrap();
        out
    }
}

impl HostConnection for MockConn {
    fn fd(&self) -> RawFd {
        self.stream.as_raw_fd()
    }

    fn id(&self) -> u64 {
        self.id
    }

    fn remote_side(&self) -> SocketAddr {
        "10.0.0.2:9000".parse().unwrap()
    }

    fn created_by_connect(&self) -> bool {
        self.client
    }

    fn read_buf(&self) -> &Mutex<ChunkedBuf> {
        &self.read_buf
    }

    fn rdma_state(&self) -> RdmaState {
        *self.state.lock().unwrap()
    }

    fn set_rdma_state(&self, state: RdmaState) {
        *self.state.lock().unwrap() = state;
    }

    fn wake_as_epoll_out(&self) {
        self.wakes.fetch_add(1, Ordering::Relaxed);
    }

    fn set_failed(&self, err: i32, _msg: &str) {
        self.failed.store(true, Ordering::Relaxed);
        self.fail_errno.store(err, Ordering::Relaxed);
    }

    fn failed(&self) -> bool {
        self.failed.load(Ordering::Relaxed)
    }
}

#[derive(Default)]
pub struct MockDispatcher {
    pub consumers: Mutex<Vec<(u64, RawFd)>>,
}

impl EventDispatcher for MockDispatcher {
    fn add_consumer(&self, socket_id: u64, fd: RawFd) -> io::Result<()> {
        self.consumers.lock().unwrap().push((socket_id, fd));
        Ok(())
    }
}

#[derive(Default)]
pub struct MockFramer {
    pub calls: Mutex<Vec<(u64, usize)>>,
}

impl MessageFramer for MockFramer {
    fn process_new_message(
        &self,
        conn: &Arc<dyn HostConnection>,
        new_bytes: usize,
        _received_us: i64,
    ) -> io::Result<()> {
        self.calls.lock().unwrap().push((conn.id(), new_bytes));
        Ok(())
    }
}

#[derive(Default)]
pub struct MockQp {
    pub sends: Mutex<Vec<SendWr>>,
    pub recvs: Mutex<Vec<RecvWr>>,
    pub fail_send: AtomicBool,
}

impl RdmaQp for MockQp {
    fn post_send(&self, wr: &SendWr) -> io::Result<()> {
        if self.fail_send.load(Ordering::Relaxed) {
            return Err(io::Error::other("injected post_send failure"));
        }
        self.sends.lock().unwrap().push(wr.clone());
        Ok(())
    }

    fn post_recv(&self, wr: &RecvWr) -> io::Result<()> {
        self.recvs.lock().unwrap().push(*wr);
        Ok(())
    }
}

pub struct MockCmState {
    pub events: Mutex<VecDeque<CmEvent>>,
    pub resolve_addr_result: Mutex<CmProgress>,
    pub resolve_route_result: Mutex<CmProgress>,
    pub connect_result: Mutex<CmProgress>,
    pub accept_result: Mutex<CmProgress>,
    pub connect_data: Mutex<Option<Vec<u8>>>,
    pub accept_data: Mutex<Option<Vec<u8>>>,
    pub conn_response: Mutex<Option<Vec<u8>>>,
    pub qp: Arc<MockQp>,
    pub qp_depths: Mutex<Option<(u32, u32)>>,
    pub resolved_addr: Mutex<Option<SocketAddr>>,
}

impl MockCmState {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            events: Mutex::new(VecDeque::new()),
            resolve_addr_result: Mutex::new(CmProgress::Done),
            resolve_route_result: Mutex::new(CmProgress::Done),
            connect_result: Mutex::new(CmProgress::Done),
            accept_result: Mutex::new(CmProgress::Done),
            connect_data: Mutex::new(None),
            accept_data: Mutex::new(None),
            conn_response: Mutex::new(None),
            qp: Arc::new(MockQp::default()),
            qp_depths: Mutex::new(None),
            resolved_addr: Mutex::new(None),
        })
    }

    pub fn push_event(&self, ev: CmEvent) {
        self.events.lock().unwrap().push_back(ev);
    }
}

pub struct MockCm(pub Arc<MockCmState>);

impl RdmaCm for MockCm {
    fn get_fd(&self) -> RawFd {
        99
    }

    fn get_cm_event(&mut self) -> CmEvent {
        self.0
            .events
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or(CmEvent::None)
    }

    fn resolve_addr(&mut self, remote: SocketAddr) -> io::Result<CmProgress> {
        *self.0.resolved_addr.lock().unwrap() = Some(remote);
        Ok(*self.0.resolve_addr_result.lock().unwrap())
    }

    fn resolve_route(&mut self) -> io::Result<CmProgress> {
        Ok(*self.0.resolve_route_result.lock().unwrap())
    }

    fn connect(&mut self, private_data: &[u8]) -> io::Result<CmProgress> {
        *self.0.connect_data.lock().unwrap() = Some(private_data.to_vec());
        Ok(*self.0.connect_result.lock().unwrap())
    }

    fn accept(&mut self, private_data: &[u8]) -> io::Result<CmProgress> {
        *self.0.accept_data.lock().unwrap() = Some(private_data.to_vec());
        Ok(*self.0.accept_result.lock().unwrap())
    }

    fn conn_data(&self) -> Option<Vec<u8>> {
        self.0.conn_response.lock().unwrap().clone()
    }

    fn create_qp(
        &mut self,
        sq_depth: u32,
        rq_depth: u32,
        _cq: &Arc<dyn CqHandle>,
        _wr_id: u64,
    ) -> io::Result<Arc<dyn RdmaQp>> {
        *self.0.qp_depths.lock().unwrap() = Some((sq_depth, rq_depth));
        Ok(Arc::clone(&self.0.qp) as Arc<dyn RdmaQp>)
    }
}

pub struct MockCmFactory {
    pub state: Arc<MockCmState>,
    pub created: AtomicUsize,
}

impl CmFactory for MockCmFactory {
    fn create(&self) -> io::Result<Box<dyn RdmaCm>> {
        self.created.fetch_add(1, Ordering::Relaxed);
        Ok(Box::new(MockCm(Arc::clone(&self.state))))
    }
}

pub struct MockCqHandle {
    pub shared: bool,
    pub released: AtomicBool,
}

impl CqHandle for MockCqHandle {
    fn is_shared(&self) -> bool {
        self.shared
    }

    fn release(&self) {
        self.released.store(true, Ordering::Relaxed);
    }

    fn as_any(&self) -> &dyn std::any::Any {
        self
    }
}

pub struct MockBroker {
    pub shared: bool,
    pub pumps: Mutex<Vec<CompletionPump>>,
    pub handles: Mutex<Vec<Arc<MockCqHandle>>>,
    pub capacities: Mutex<Vec<usize>>,
}

impl MockBroker {
    pub fn new(shared: bool) -> Arc<Self> {
        Arc::new(Self {
            shared,
            pumps: Mutex::new(Vec::new()),
            handles: Mutex::new(Vec::new()),
            capacities: Mutex::new(Vec::new()),
        })
    }

    pub fn pump(&self) -> CompletionPump {
        self.pumps.lock().unwrap().last().unwrap().clone()
    }
}

impl CqBroker for MockBroker {
    fn get_one(
        &self,
        _conn_id: u64,
        capacity: usize,
        pump: CompletionPump,
    ) -> io::Result<Arc<dyn CqHandle>> {
        self.capacities.lock().unwrap().push(capacity);
        self.pumps.lock().unwrap().push(pump);
        let handle = Arc::new(MockCqHandle {
            shared: self.shared,
            released: AtomicBool::new(false),
        });
        self.handles.lock().unwrap().push(Arc::clone(&handle));
        Ok(handle)
    }
}

pub struct FakeRegistrar(pub u32);

impl MemoryRegistrar for FakeRegistrar {
    fn register(&self, _addr: usize, _len: usize) -> io::Result<RegionHandle> {
        Ok(RegionHandle {
            lkey: self.0,
            guard: Box::new(()),
        })
    }
}

pub struct TestRig {
    pub conn: Arc<MockConn>,
    pub ep: Arc<Endpoint>,
    pub cm: Arc<MockCmState>,
    pub dispatcher: Arc<MockDispatcher>,
    pub framer: Arc<MockFramer>,
    pub broker: Arc<MockBroker>,
    pub registry: Arc<MemoryRegistry>,
    pub pool: Arc<BlockPool>,
}

impl TestRig {
    pub fn qp(&self) -> &Arc<MockQp> {
        &self.cm.qp
    }
}

pub fn rig_with(client: bool, config: RdmaConfig, in_cluster: bool) -> TestRig {
    rig_full(client, config, in_cluster, 64)
}

pub fn rig_full(client: bool, config: RdmaConfig, in_cluster: bool, pool_chunks: usize) -> TestRig {
    let conn = MockConn::new(42, client);
    let registry = Arc::new(MemoryRegistry::new());
    let pool = Arc::new(BlockPool::new(&FakeRegistrar(TEST_LKEY), &registry, pool_chunks).unwrap());
    let cm = MockCmState::new();
    let dispatcher = Arc::new(MockDispatcher::default());
    let framer = Arc::new(MockFramer::default());
    let broker = MockBroker::new(true);

    let ctx = Arc::new(EndpointContext {
        dispatcher: Arc::clone(&dispatcher) as Arc<dyn EventDispatcher>,
        cq_broker: Arc::clone(&broker) as Arc<dyn CqBroker>,
        cm_factory: Arc::new(MockCmFactory {
            state: Arc::clone(&cm),
            created: AtomicUsize::new(0),
        }),
        registry: Arc::clone(&registry),
        pool: Arc::clone(&pool),
        framer: Arc::clone(&framer) as Arc<dyn MessageFramer>,
        in_cluster: Box::new(move |_| in_cluster),
    });

    let ep = Endpoint::new(
        Arc::clone(&conn) as Arc<dyn HostConnection>,
        ctx,
        config,
    );

    TestRig {
        conn,
        ep,
        cm,
        dispatcher,
        framer,
        broker,
        registry,
        pool,
    }
}

/// Small queues: sq_size = rq_size = 16.
pub fn small_config() -> RdmaConfig {
    RdmaConfig::new().with_sbuf_size(0).with_rbuf_size(0)
}

pub fn rig(client: bool) -> TestRig {
    rig_with(client, small_config(), true)
}

/// Drive a client rig to ESTABLISHED in one handshake call (every CM step
/// completes synchronously). The server's advertised sizes come from
/// `response`.
pub fn establish_client(rig: &TestRig, response: &[u8]) {
    rig.ep.start_handshake().unwrap();
    let _hello = rig.conn.peer_read_exact(12);
    *rig.cm.conn_response.lock().unwrap() = Some(response.to_vec());
    rig.conn.peer_write(&77u64.to_be_bytes());
    let progress = rig.ep.handshake().unwrap();
    assert_eq!(progress, rnet::drivers::rdma::HandshakeProgress::Again);
    assert_eq!(rig.ep.status(), rnet::drivers::rdma::Status::Established);
}

/// A buffer of `blocks` fully-filled registered pool blocks.
pub fn registered_buf(pool: &BlockPool, blocks: usize, fill: u8) -> ChunkedBuf {
    let mut buf = ChunkedBuf::new();
    for _ in 0..blocks {
        let block = pool.alloc_block().unwrap();
        let cap = block.capacity();
        block.append(&vec![fill; cap]);
        buf.append_block(block, 0, cap);
    }
    buf
}

/// A buffer holding `data` in one registered pool block.
pub fn registered_buf_bytes(pool: &BlockPool, data: &[u8]) -> ChunkedBuf {
    let block = pool.alloc_block().unwrap();
    block.append(data);
    let mut buf = ChunkedBuf::new();
    buf.append_block(block, 0, data.len());
    buf
}
