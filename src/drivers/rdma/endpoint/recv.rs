//! Receive engine and completion handler.
//!
//! Send completions carry no accounting: the peer's immediate-data count is
//! what clears retained send buffers and refills the window, so in-order RC
//! delivery makes `sq_sent` advance exactly in posting order.

use std::sync::atomic::Ordering;

use super::protocol::RESERVED_WR_NUM;
use super::Endpoint;
use crate::drivers::rdma::cq::{CompletionKind, RdmaCompletion};
use crate::drivers::rdma::verbs::{RecvWr, Sge};
use crate::error::{Error, Result};
use crate::memory::{ChunkedBuf, DEFAULT_PAYLOAD};
use crate::transport::RdmaState;

impl Endpoint {
    /// Handle one completion. Returns the received byte count (0 for
    /// send-side and pure-ACK completions).
    pub fn handle_completion(&self, rc: &RdmaCompletion) -> Result<usize> {
        // Completions can arrive before the ESTABLISHED CM event is
        // observed, so force the state here.
        self.conn.set_rdma_state(RdmaState::On);

        match rc.kind {
            // Send-side accounting is driven by the peer's ACK on the
            // receive path, not by our own completions.
            CompletionKind::Send | CompletionKind::Write => Ok(0),
            CompletionKind::Recv => {
                debug_assert!(rc.len > 0);
                self.deliver(rc.len as usize);
                self.finish_recv(rc)
            }
            CompletionKind::RecvWithImm => self.finish_recv(rc),
            CompletionKind::Error => Err(Error::Rdma("completion with error status".into())),
        }
    }

    /// Move the valid prefix of the current receive block into the host
    /// read buffer, by reference or by copy.
    fn deliver(&self, len: usize) {
        let mut rq = self.lock_rq();
        let slot = rq.rq_received;
        if self.config.recv_zerocopy {
            let mut tmp = ChunkedBuf::new();
            rq.rbuf[slot].cutn(&mut tmp, len);
            drop(rq);
            self.conn
                .read_buf()
                .lock()
                .expect("read buffer poisoned")
                .append_buf(&mut tmp);
        } else {
            let addr = rq.rbuf_data[slot];
            // Only the first `len` bytes of the posted block are valid.
            let data = unsafe { std::slice::from_raw_parts(addr as *const u8, len) };
            self.conn
                .read_buf()
                .lock()
                .expect("read buffer poisoned")
                .append_slice(data);
            drop(rq);
        }
    }

    /// Credit return, repost, and piggyback-ACK bookkeeping shared by data
    /// and pure-ACK receive completions.
    fn finish_recv(&self, rc: &RdmaCompletion) -> Result<usize> {
        if rc.imm > 0 {
            // The peer reclaimed `imm` of our receives: the oldest `imm`
            // in-flight sends are fully delivered.
            {
                let mut sq = self.lock_sq();
                for _ in 0..rc.imm {
                    let slot = sq.sq_sent;
                    debug_assert!(!sq.sbuf[slot].is_empty());
                    sq.sbuf[slot].clear();
                    sq.sq_sent = (slot + 1) % self.sq_size;
                }
            }
            if self.window.fetch_add(rc.imm as usize, Ordering::Relaxed) == 0 {
                self.conn.wake_as_epoll_out();
            }
        }

        self.post_recv(1)?;

        if rc.len > 0 {
            let acc = self.new_rq_wrs.fetch_add(1, Ordering::Relaxed) + 1;
            if acc as usize > self.remote_window_capacity.load(Ordering::Relaxed) / 2 {
                // Return the accumulated credits as a pure ACK; whoever
                // swaps the counter owns reflecting it to the peer.
                let imm = self.new_rq_wrs.swap(0, Ordering::Relaxed);
                self.send_imm(imm)?;
            }
        }

        Ok(rc.len as usize)
    }

    /// Post `num` receive work requests starting at `rq_received`, each
    /// covering a full payload block.
    pub fn post_recv(&self, num: u32) -> Result<()> {
        if num == 0 {
            return Ok(());
        }
        let qp = self.current_qp()?;
        let mut rq = self.lock_rq();
        let ring_len = self.rq_size + RESERVED_WR_NUM;
        for _ in 0..num {
            let slot = rq.rq_received;
            if self.config.recv_zerocopy || rq.rbuf[slot].is_empty() {
                rq.rbuf[slot].clear();
                let block = self
                    .ctx
                    .pool
                    .alloc_block()
                    .ok_or_else(|| Error::Resource("block pool exhausted".into()))?;
                block.mark_full();
                rq.rbuf_data[slot] = block.base();
                rq.rbuf[slot].append_block(block, 0, DEFAULT_PAYLOAD);
            }
            let addr = rq.rbuf_data[slot];
            let wr = RecvWr {
                wr_id: self.conn.id(),
                sge: Sge {
                    addr: addr as u64,
                    len: DEFAULT_PAYLOAD as u32,
                    lkey: self.ctx.registry.get_lkey(addr),
                },
            };
            if let Err(e) = qp.post_recv(&wr) {
                rq.rbuf[slot].clear();
                return Err(Error::Rdma(e.to_string()));
            }
            rq.rq_received = (slot + 1) % ring_len;
        }
        Ok(())
    }
}
