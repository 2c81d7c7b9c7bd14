//! Completion records and the completion-queue broker.
//!
//! CQs may be shared across endpoints. The broker hands out per-endpoint
//! handles and routes every polled completion to the owning endpoint's
//! pump, keyed by the work-request id (the host socket id).

use std::any::Any;
use std::io;
use std::sync::Arc;

use super::endpoint::CompletionPump;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompletionKind {
    /// Send completion of data.
    Send,
    /// Send completion of a pure ACK.
    Write,
    /// Receive completion of data.
    Recv,
    /// Receive completion of a pure ACK.
    RecvWithImm,
    Error,
}

/// One completion-queue entry, reduced to what the endpoint needs.
#[derive(Debug, Clone, Copy)]
pub struct RdmaCompletion {
    pub kind: CompletionKind,
    /// Valid payload bytes for receive completions.
    pub len: u32,
    /// Credit count carried in the immediate-data field.
    pub imm: u32,
}

/// An endpoint's claim on a completion queue.
pub trait CqHandle: Send + Sync {
    fn is_shared(&self) -> bool;

    /// Give the claim back; a shared CQ keeps serving other endpoints.
    fn release(&self);

    /// Access to the concrete queue for QP creation.
    fn as_any(&self) -> &dyn Any;
}

/// Source of completion queues.
///
/// `get_one` attaches `pump` as the completion sink for `conn_id`. When the
/// returned handle is exclusive, the broker drives the pump from its own
/// poller (the pump processes inline); a shared handle leaves worker
/// ownership to the endpoint.
pub trait CqBroker: Send + Sync {
    fn get_one(
        &self,
        conn_id: u64,
        capacity: usize,
        pump: CompletionPump,
    ) -> io::Result<Arc<dyn CqHandle>>;
}

#[cfg(feature = "rdma")]
pub use hw::SharedCqBroker;

#[cfg(feature = "rdma")]
mod hw {
    use super::*;
    use crate::drivers::rdma::context::RdmaContext;

    use dashmap::DashMap;
    use sideway::ibverbs::completion::{
        GenericCompletionQueue, PollCompletionQueueError, WorkCompletionOperationType,
        WorkCompletionStatus,
    };
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::thread;
    use std::time::Duration;
    use tracing::warn;

    /// One CQ polled for every endpoint registered with it.
    pub struct SharedCqBroker {
        cq: GenericCompletionQueue,
        pumps: Arc<DashMap<u64, CompletionPump>>,
        shutdown: Arc<AtomicBool>,
        join_handle: std::sync::Mutex<Option<thread::JoinHandle<()>>>,
    }

    // SAFETY: the queue handle is only polled from the broker's own thread;
    // the routing map and flags are thread-safe.
    unsafe impl Send for SharedCqBroker {}
    unsafe impl Sync for SharedCqBroker {}

    impl SharedCqBroker {
        pub fn new(context: &RdmaContext, cqe: u32) -> io::Result<Arc<Self>> {
            let cq: GenericCompletionQueue = context
                .ctx
                .create_cq_builder()
                .setup_cqe(cqe)
                .build()
                .map_err(|e| io::Error::other(e.to_string()))?
                .into();

            let pumps = Arc::new(DashMap::<u64, CompletionPump>::new());
            let shutdown = Arc::new(AtomicBool::new(false));

            let cq_clone = cq.clone();
            let pumps_clone = Arc::clone(&pumps);
            let shutdown_clone = Arc::clone(&shutdown);
            let join_handle = thread::Builder::new()
                .name("rdma-cq-poll".to_string())
                .spawn(move || poll_loop(cq_clone, pumps_clone, shutdown_clone))?;

            Ok(Arc::new(Self {
                cq,
                pumps,
                shutdown,
                join_handle: std::sync::Mutex::new(Some(join_handle)),
            }))
        }

        pub fn queue(&self) -> GenericCompletionQueue {
            self.cq.clone()
        }
    }

    impl CqBroker for SharedCqBroker {
        fn get_one(
            &self,
            conn_id: u64,
            _capacity: usize,
            pump: CompletionPump,
        ) -> io::Result<Arc<dyn CqHandle>> {
            self.pumps.insert(conn_id, pump);
            Ok(Arc::new(SharedCqHandle {
                pumps: Arc::clone(&self.pumps),
                cq: self.cq.clone(),
                conn_id,
            }))
        }
    }

    impl Drop for SharedCqBroker {
        fn drop(&mut self) {
            self.shutdown.store(true, Ordering::Relaxed);
            if let Ok(mut guard) = self.join_handle.lock() {
                if let Some(handle) = guard.take() {
                    let _ = handle.join();
                }
            }
        }
    }

    pub struct SharedCqHandle {
        pumps: Arc<DashMap<u64, CompletionPump>>,
        cq: GenericCompletionQueue,
        conn_id: u64,
    }

    // SAFETY: the queue handle held here is only used to clone a reference
    // for QP creation; polling stays on the broker thread.
    unsafe impl Send for SharedCqHandle {}
    unsafe impl Sync for SharedCqHandle {}

    impl SharedCqHandle {
        pub fn queue(&self) -> GenericCompletionQueue {
            self.cq.clone()
        }
    }

    impl CqHandle for SharedCqHandle {
        fn is_shared(&self) -> bool {
            true
        }

        fn release(&self) {
            self.pumps.remove(&self.conn_id);
        }

        fn as_any(&self) -> &dyn Any {
            self
        }
    }

    fn poll_loop(
        cq: GenericCompletionQueue,
        pumps: Arc<DashMap<u64, CompletionPump>>,
        shutdown: Arc<AtomicBool>,
    ) {
        let mut idle_count: u32 = 0;

        while !shutdown.load(Ordering::Relaxed) {
            match cq.start_poll() {
                Ok(poller) => {
                    let mut count = 0;
                    for completion in poller {
                        count += 1;
                        idle_count = 0;
                        let status = WorkCompletionStatus::from(completion.status());
                        let opcode = WorkCompletionOperationType::from(completion.opcode());
                        let wr_id = completion.wr_id();
                        let len = completion.byte_len();
                        let imm = completion.imm_data().unwrap_or(0);

                        let kind = if status != WorkCompletionStatus::Success {
                            warn!(
                                "rdma completion error: status={:?} opcode={:?} wr_id={}",
                                status, opcode, wr_id
                            );
                            CompletionKind::Error
                        } else {
                            match opcode {
                                WorkCompletionOperationType::Receive => CompletionKind::Recv,
                                WorkCompletionOperationType::ReceiveWithImmediate => {
                                    CompletionKind::RecvWithImm
                                }
                                _ => CompletionKind::Send,
                            }
                        };

                        match pumps.get(&wr_id) {
                            Some(pump) => pump.push(RdmaCompletion { kind, len, imm }),
                            None => warn!("completion for unknown socket id {}", wr_id),
                        }
                    }
                    if count == 0 {
                        idle_count = idle_count.saturating_add(1);
                    }
                }
                Err(PollCompletionQueueError::CompletionQueueEmpty) => {
                    idle_count = idle_count.saturating_add(1);
                }
                Err(e) => {
                    warn!("failed to poll completion queue: {:?}", e);
                    idle_count = idle_count.saturating_add(1);
                }
            }

            // Busy-poll briefly, then yield, then sleep.
            if idle_count > 100 {
                thread::sleep(Duration::from_micros(10));
            } else if idle_count > 10 {
                thread::yield_now();
            }
        }
    }
}
