//! Serialized completion pump.
//!
//! Completions for one endpoint must be handled in order. A shared CQ is
//! polled on behalf of many endpoints, so each endpoint owns a pump the
//! broker pushes into; depending on configuration the pump processes inline
//! on the poller thread or hands off to a dedicated worker thread.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::thread;
use std::time::{SystemTime, UNIX_EPOCH};

use tracing::warn;

use super::Endpoint;
use crate::drivers::rdma::cq::RdmaCompletion;

enum PumpMsg {
    Completion(RdmaCompletion),
    Stop,
}

/// Per-endpoint serialized completion sink.
///
/// Cloned into the CQ broker; every clone pushes into the same queue.
#[derive(Clone)]
pub struct CompletionPump {
    tx: flume::Sender<PumpMsg>,
    rx: flume::Receiver<PumpMsg>,
    stopped: Arc<AtomicBool>,
    threaded: Arc<AtomicBool>,
    target: Weak<Endpoint>,
}

impl CompletionPump {
    pub(crate) fn new(target: Weak<Endpoint>) -> Self {
        let (tx, rx) = flume::unbounded();
        Self {
            tx,
            rx,
            stopped: Arc::new(AtomicBool::new(false)),
            threaded: Arc::new(AtomicBool::new(false)),
            target,
        }
    }

    /// Deliver one completion. Inline unless a worker thread was started.
    pub fn push(&self, rc: RdmaCompletion) {
        if self.stopped.load(Ordering::Relaxed) {
            return;
        }
        if self.threaded.load(Ordering::Relaxed) {
            let _ = self.tx.send(PumpMsg::Completion(rc));
        } else {
            self.process(&rc);
        }
    }

    /// Hand processing to a dedicated worker thread.
    pub(crate) fn start_worker(&self, conn_id: u64) {
        if self.threaded.swap(true, Ordering::Relaxed) {
            return;
        }
        let pump = self.clone();
        let spawned = thread::Builder::new()
            .name(format!("rdma-pump-{}", conn_id))
            .spawn(move || pump.run());
        if let Err(e) = spawned {
            warn!("failed to spawn completion worker, falling back to inline: {e}");
            self.threaded.store(false, Ordering::Relaxed);
        }
    }

    /// Stop accepting completions. Never joins the worker: it exits on its
    /// own once it sees the sentinel, and joining from teardown could
    /// deadlock if teardown runs on the worker itself.
    pub fn stop(&self) {
        self.stopped.store(true, Ordering::Relaxed);
        let _ = self.tx.send(PumpMsg::Stop);
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::Relaxed)
    }

    fn run(&self) {
        while let Ok(msg) = self.rx.recv() {
            match msg {
                PumpMsg::Completion(rc) => self.process(&rc),
                PumpMsg::Stop => break,
            }
        }
    }

    fn process(&self, rc: &RdmaCompletion) {
        let Some(ep) = self.target.upgrade() else {
            return;
        };
        // A stopped queue or a failed connection drains undelivered.
        if self.stopped.load(Ordering::Relaxed) || ep.conn().failed() {
            return;
        }
        match ep.handle_completion(rc) {
            Ok(0) => {}
            Ok(nr) => {
                let received_us = now_us();
                if let Err(e) = ep.framer().process_new_message(ep.conn(), nr, received_us) {
                    warn!("message framer rejected {} received bytes: {e}", nr);
                }
            }
            Err(e) => {
                warn!("failed to handle rdma completion: {e}");
                ep.conn().set_failed(e.errno(), "failed to handle rdma completion");
            }
        }
    }
}

fn now_us() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_micros() as i64)
        .unwrap_or(0)
}
