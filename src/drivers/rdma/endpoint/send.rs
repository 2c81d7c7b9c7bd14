//! Send engine: cuts application buffers into scatter/gather lists and
//! posts Send-with-Immediate work requests under the credit window.

use std::sync::atomic::Ordering;

use tracing::warn;

use super::{Endpoint, SendRing};
use crate::drivers::rdma::verbs::{SendFlags, SendOpcode, SendWr, Sge};
use crate::error::{Error, Result};
use crate::memory::{BlockPool, ChunkedBuf, MemoryRegistry, DEFAULT_PAYLOAD};

/// Payloads at or below this are inlined into the work request.
const INLINE_THRESHOLD: usize = 64;

/// Cut the front of `src` into scatter/gather entries, retaining the moved
/// bytes in `to`, bounded by the remaining entry budget and `max_len`.
///
/// All entries of one work request must share a local key: the first cut
/// block establishes `lkey`, and a block with a different key terminates
/// the cut (it starts the next request). A leading block outside registered
/// memory is copied into a fresh pool block and replaces the original
/// prefix.
pub(crate) fn cut_into_sglist(
    src: &mut ChunkedBuf,
    to: &mut ChunkedBuf,
    sges: &mut Vec<Sge>,
    max_sge: usize,
    max_len: usize,
    lkey: &mut u32,
    registry: &MemoryRegistry,
    pool: &BlockPool,
) -> Result<usize> {
    let mut len = 0usize;
    let num = src.ref_num().min(max_sge.saturating_sub(sges.len()));
    for i in 0..num {
        if len == max_len {
            break;
        }
        let (ref_len, ref_addr) = {
            let r = src.ref_at(i);
            (r.len, r.data() as usize)
        };
        let this_lkey = registry.get_lkey(ref_addr);
        if *lkey == 0 {
            *lkey = this_lkey;
        } else if this_lkey != *lkey {
            break;
        }
        if *lkey == 0 {
            // The block was allocated before registration was set up. Copy
            // up to one payload into a registered block and cut from the
            // copy; the original prefix is dropped in its stead.
            debug_assert_eq!(i, 0);
            let copy_len = ref_len.min(max_len).min(DEFAULT_PAYLOAD);
            let block = pool
                .alloc_block()
                .ok_or_else(|| Error::Resource("block pool exhausted".into()))?;
            {
                let r = src.ref_at(0);
                let copied = block.append(&r.as_slice()[..copy_len]);
                debug_assert_eq!(copied, copy_len);
            }
            let mut tmp = ChunkedBuf::new();
            tmp.append_block(block, 0, copy_len);
            let n = cut_into_sglist(&mut tmp, to, sges, max_sge, copy_len, lkey, registry, pool)?;
            src.cutn_discard(n);
            return Ok(n);
        }
        let take = if len + ref_len > max_len {
            if ref_len <= DEFAULT_PAYLOAD {
                // Leave the block whole for the next request instead of
                // splitting a message boundary inside it.
                break;
            }
            max_len - len
        } else {
            ref_len
        };
        sges.push(Sge {
            addr: ref_addr as u64,
            len: take as u32,
            lkey: *lkey,
        });
        len += take;
        if take < ref_len {
            break;
        }
    }
    if len > 0 {
        src.cutn(to, len);
    }
    Ok(len)
}

impl Endpoint {
    /// Consume up to one work request's worth of bytes from `bufs` and post
    /// it. Returns the bytes posted, or [`Error::WouldBlock`] (with no side
    /// effects) when no send credit is available.
    pub fn cut_from_buf_list(&self, bufs: &mut [ChunkedBuf]) -> Result<usize> {
        debug_assert!(!bufs.is_empty());
        if self
            .window
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |w| w.checked_sub(1))
            .is_err()
        {
            return Err(Error::WouldBlock);
        }

        let qp = self.current_qp()?;
        let mut sq = self.lock_sq();
        let imm = self.new_rq_wrs.swap(0, Ordering::Relaxed);

        let slot = sq.sq_current;
        debug_assert!(sq.sbuf[slot].is_empty());

        let nw = self.do_cut(&mut sq, slot, bufs, imm, &*qp)?;

        sq.sq_current = (slot + 1) % self.sq_size;
        Ok(nw)
    }

    fn do_cut(
        &self,
        sq: &mut SendRing,
        slot: usize,
        bufs: &mut [ChunkedBuf],
        imm: u32,
        qp: &dyn crate::drivers::rdma::verbs::RdmaQp,
    ) -> Result<usize> {
        let registry = &self.ctx.registry;
        let pool = &self.ctx.pool;
        let max_sge = registry.max_sge();

        let mut sges: Vec<Sge> = Vec::with_capacity(max_sge);
        let mut lkey = 0u32;
        let mut total = 0usize;
        let mut current = 0usize;
        // Split the retainer out of the ring so the cut can fill it while
        // the counters stay reachable.
        let mut to = std::mem::take(&mut sq.sbuf[slot]);

        while sges.len() < max_sge && total < DEFAULT_PAYLOAD && current < bufs.len() {
            if bufs[current].is_empty() {
                current += 1;
                continue;
            }
            let n = cut_into_sglist(
                &mut bufs[current],
                &mut to,
                &mut sges,
                max_sge,
                DEFAULT_PAYLOAD - total,
                &mut lkey,
                registry,
                pool,
            );
            let n = match n {
                Ok(n) => n,
                Err(e) => {
                    sq.sbuf[slot] = to;
                    return Err(e);
                }
            };
            if n == 0 {
                // Key change, or a full block left whole for the next
                // request.
                break;
            }
            total += n;
        }
        sq.sbuf[slot] = to;

        let mut flags = SendFlags::default();
        if total <= INLINE_THRESHOLD {
            flags.inline = true;
        }

        // Suppress receive-side wakeups unless the peer has something to
        // act on.
        let local_cap = self.local_window_capacity.load(Ordering::Relaxed);
        let remote_cap = self.remote_window_capacity.load(Ordering::Relaxed);
        let finished_message = current > 0 || bufs.get(current).map_or(true, |b| b.is_empty());
        let solicited = if finished_message {
            true
        } else {
            sq.unsolicited += 1;
            sq.accumulated_ack += imm as usize;
            sq.unsolicited > local_cap / 4 || sq.accumulated_ack > remote_cap / 4
        };
        if solicited {
            flags.solicited = true;
            sq.unsolicited = 0;
            sq.accumulated_ack = 0;
        }

        // Suppress send-side CQEs; a later signaled completion reports the
        // unsignaled ones in RC order.
        sq.sq_unsignaled += 1;
        if sq.sq_unsignaled >= local_cap / 4 {
            flags.signaled = true;
            sq.sq_unsignaled = 0;
        }

        let wr = SendWr {
            wr_id: self.conn.id(),
            opcode: SendOpcode::SendWithImm,
            imm,
            flags,
            sges,
        };
        if let Err(e) = qp.post_send(&wr) {
            // Window accounting already guaranteed queue capacity, so a
            // post failure is unrecoverable.
            warn!("failed to post send: {e}");
            return Err(Error::Rdma(e.to_string()));
        }
        Ok(total)
    }

    /// Post a zero-length write-with-immediate as a pure ACK returning
    /// `imm` receive credits to the peer.
    pub fn send_imm(&self, imm: u32) -> Result<()> {
        if imm == 0 {
            return Ok(());
        }
        let qp = self.current_qp()?;
        let wr = SendWr {
            wr_id: self.conn.id(),
            opcode: SendOpcode::WriteWithImm,
            imm,
            flags: SendFlags {
                signaled: true,
                solicited: true,
                inline: false,
            },
            sges: Vec::new(),
        };
        if let Err(e) = qp.post_send(&wr) {
            warn!("failed to post pure ack: {e}");
            return Err(Error::Rdma(e.to_string()));
        }
        Ok(())
    }

    /// Outstanding (posted but unacknowledged) sends.
    pub fn inflight_sends(&self) -> usize {
        let sq = self.lock_sq();
        (sq.sq_current + self.sq_size - sq.sq_sent) % self.sq_size
    }
}
