//! Task-local batching of unordered operations.
//!
//! Small RMA and non-fetching AMO requests routed through the
//! `*_unordered` entry points accumulate in per-task buffers and go
//! out as one vectorised submission. The engine flushes at task fence
//! points and ends (flush + free) at task termination.

use bitflags::bitflags;
use nodeset::Bitmap;

use crate::amo::{amo_nf_v, AmoDt, AmoNfVEntry, AmoOp, AmoValue, Datum};
use crate::rma::{get_v, put_v, RmaVEntry};
use crate::task::with_task_prv;
use crate::Comm;

/// Largest transfer handled as an unordered operation.
pub const MAX_UNORDERED_TRANS_SZ: usize = 1024;

/// Maximum operations in one chained submission; provisional, not yet
/// tuned.
pub(crate) const MAX_CHAINED: usize = crate::ctx::MAX_TXNS_IN_FLIGHT;

bitflags! {
    /// Which task-local buffers an operation targets.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct BuffType: u8 {
        const AMO_NF = 1 << 0;
        const GET = 1 << 1;
        const PUT = 1 << 2;
    }
}

/// Buffered PUTs, with the source bytes staged in registered scratch
/// so the caller's buffer can be reused immediately and the batch can
/// transfer directly.
pub(crate) struct PutBuff {
    entries: Vec<RmaVEntry>,
    data: crate::mem::RegBuf,
    node_bitmap: Bitmap,
}

impl PutBuff {
    fn new(comm: &Comm) -> Box<PutBuff> {
        Box::new(PutBuff {
            entries: Vec::with_capacity(MAX_CHAINED),
            data: comm.mem().alloc_bounce(MAX_CHAINED * MAX_UNORDERED_TRANS_SZ),
            node_bitmap: Bitmap::new(comm.num_nodes()),
        })
    }

    fn slot_addr(&self, vi: usize) -> usize {
        self.data.addr() + vi * MAX_UNORDERED_TRANS_SZ
    }

    fn flush(&mut self, comm: &Comm) {
        if !self.entries.is_empty() {
            tracing::trace!(len = self.entries.len(), "flushing buffered PUTs");
            put_v(comm, &self.entries, &mut self.node_bitmap);
            self.entries.clear();
        }
    }
}

/// Buffered GETs.
pub(crate) struct GetBuff {
    entries: Vec<RmaVEntry>,
}

impl GetBuff {
    fn new() -> Box<GetBuff> {
        Box::new(GetBuff {
            entries: Vec::with_capacity(MAX_CHAINED),
        })
    }

    fn flush(&mut self, comm: &Comm) {
        if !self.entries.is_empty() {
            tracing::trace!(len = self.entries.len(), "flushing buffered GETs");
            get_v(comm, &self.entries);
            self.entries.clear();
        }
    }
}

/// Buffered non-fetching AMOs.
pub(crate) struct AmoNfBuff {
    entries: Vec<AmoNfVEntry>,
}

impl AmoNfBuff {
    fn new() -> Box<AmoNfBuff> {
        Box::new(AmoNfBuff {
            entries: Vec::with_capacity(MAX_CHAINED),
        })
    }

    fn flush(&mut self, comm: &Comm) {
        if !self.entries.is_empty() {
            tracing::trace!(len = self.entries.len(), "flushing buffered AMOs");
            amo_nf_v(comm, &self.entries);
            self.entries.clear();
        }
    }
}

impl Comm {
    /// Flush the named task-local buffers.
    pub(crate) fn task_local_buff_flush(&self, t: BuffType) {
        with_task_prv(self, |prv| {
            if t.contains(BuffType::AMO_NF) {
                if let Some(b) = prv.amo_nf_buff.borrow_mut().as_mut() {
                    b.flush(self);
                }
            }
            if t.contains(BuffType::GET) {
                if let Some(b) = prv.get_buff.borrow_mut().as_mut() {
                    b.flush(self);
                }
            }
            if t.contains(BuffType::PUT) {
                if let Some(b) = prv.put_buff.borrow_mut().as_mut() {
                    b.flush(self);
                }
            }
        });
    }

    /// Flush and free the named task-local buffers.
    pub(crate) fn task_local_buff_end(&self, t: BuffType) {
        with_task_prv(self, |prv| {
            if t.contains(BuffType::AMO_NF) {
                if let Some(mut b) = prv.amo_nf_buff.borrow_mut().take() {
                    b.flush(self);
                }
            }
            if t.contains(BuffType::GET) {
                if let Some(mut b) = prv.get_buff.borrow_mut().take() {
                    b.flush(self);
                }
            }
            if t.contains(BuffType::PUT) {
                if let Some(mut b) = prv.put_buff.borrow_mut().take() {
                    b.flush(self);
                }
            }
        });
    }
}

/// Buffer a PUT when it qualifies (small enough, remotely keyed);
/// otherwise issue it directly.
pub(crate) unsafe fn do_remote_put_buff(
    comm: &Comm,
    src: *const u8,
    node: usize,
    raddr: usize,
    size: usize,
) {
    let Some((key, off)) = comm.mem().remote_key(node, raddr, size) else {
        unsafe { crate::rma::put(comm, src, node, raddr, size) };
        return;
    };
    if size > MAX_UNORDERED_TRANS_SZ {
        unsafe { crate::rma::put(comm, src, node, raddr, size) };
        return;
    }

    with_task_prv(comm, |prv| {
        let mut slot = prv.put_buff.borrow_mut();
        let buff = slot.get_or_insert_with(|| PutBuff::new(comm));
        let vi = buff.entries.len();
        let staged = buff.slot_addr(vi);
        // Safety: each slot is MAX_UNORDERED_TRANS_SZ bytes of scratch
        // and size fits it.
        unsafe { std::ptr::copy_nonoverlapping(src, staged as *mut u8, size) };
        buff.entries.push(RmaVEntry {
            addr: staged,
            node,
            key,
            off,
            size,
        });
        if buff.entries.len() == MAX_CHAINED {
            buff.flush(comm);
        }
    });
}

/// Buffer a GET when it qualifies; otherwise issue it directly.
pub(crate) unsafe fn do_remote_get_buff(
    comm: &Comm,
    dst: *mut u8,
    node: usize,
    raddr: usize,
    size: usize,
) {
    let Some((key, off)) = comm.mem().remote_key(node, raddr, size) else {
        unsafe { crate::rma::get(comm, dst, node, raddr, size) };
        return;
    };
    if size > MAX_UNORDERED_TRANS_SZ || !comm.mem().local_covered(dst as usize, size) {
        unsafe { crate::rma::get(comm, dst, node, raddr, size) };
        return;
    }

    with_task_prv(comm, |prv| {
        let mut slot = prv.get_buff.borrow_mut();
        let buff = slot.get_or_insert_with(GetBuff::new);
        buff.entries.push(RmaVEntry {
            addr: dst as usize,
            node,
            key,
            off,
            size,
        });
        if buff.entries.len() == MAX_CHAINED {
            buff.flush(comm);
        }
    });
}

/// Buffer a non-fetching AMO when the native path can take it;
/// otherwise fall through to the ordinary dispatch.
pub(crate) unsafe fn do_remote_amo_nf_buff(
    comm: &Comm,
    opnd1: Datum,
    node: usize,
    obj: usize,
    op: AmoOp,
    dt: AmoDt,
) {
    // "Unordered" exists only for actual network atomics.
    if comm.num_nodes() <= 1 {
        unsafe { crate::amo::cpu_amo(obj as *mut u8, Some(opnd1), None, None, op, dt) };
        return;
    }

    comm.retire_delayed_am_done(false);

    let size = dt.size();
    if !comm.atomic_valid(dt) || comm.mem().remote_key(node, obj, size).is_none() {
        if node == comm.node_id() {
            unsafe { crate::amo::cpu_amo(obj as *mut u8, Some(opnd1), None, None, op, dt) };
        } else {
            crate::am::am_request_amo(comm, node, obj, Some(opnd1), None, None, op, dt);
        }
        return;
    }
    let (key, off) = comm.mem().remote_key(node, obj, size).unwrap();

    with_task_prv(comm, |prv| {
        let mut slot = prv.amo_nf_buff.borrow_mut();
        let buff = slot.get_or_insert_with(AmoNfBuff::new);
        buff.entries.push(AmoNfVEntry {
            opnd1,
            node,
            key,
            off,
            op,
            dt,
        });
        if buff.entries.len() == MAX_CHAINED {
            buff.flush(comm);
        }
    });
}

impl Comm {
    /// PUT that may be coalesced with other unordered operations.
    /// Ordered only by task fences.
    ///
    /// # Safety
    /// As for [`Comm::put`].
    pub unsafe fn put_unordered(&self, src: *const u8, node: usize, raddr: *mut u8, size: usize) {
        self.retire_delayed_am_done(false);
        if size == 0 {
            return;
        }
        if node == self.node_id() {
            // Safety: both local; caller vouches for the ranges.
            unsafe { std::ptr::copy(src, raddr, size) };
            return;
        }
        unsafe { do_remote_put_buff(self, src, node, raddr as usize, size) };
    }

    /// GET that may be coalesced with other unordered operations.
    /// Ordered only by task fences.
    ///
    /// # Safety
    /// As for [`Comm::get`].
    pub unsafe fn get_unordered(&self, dst: *mut u8, node: usize, raddr: *const u8, size: usize) {
        self.retire_delayed_am_done(false);
        if size == 0 {
            return;
        }
        if node == self.node_id() {
            unsafe { std::ptr::copy(raddr, dst, size) };
            return;
        }
        unsafe { do_remote_get_buff(self, dst, node, raddr as usize, size) };
    }

    /// Unordered atomic add; ordered only by task fences.
    ///
    /// # Safety
    /// As for [`Comm::amo_write`].
    pub unsafe fn amo_add_unordered<T: AmoValue>(&self, operand: T, node: usize, obj: *mut T) {
        unsafe {
            do_remote_amo_nf_buff(self, operand.to_datum(), node, obj as usize, AmoOp::Sum, T::DT)
        };
    }

    /// Unordered atomic subtract; ordered only by task fences.
    ///
    /// # Safety
    /// As for [`Comm::amo_write`].
    pub unsafe fn amo_sub_unordered<T: AmoValue>(&self, operand: T, node: usize, obj: *mut T) {
        unsafe { self.amo_add_unordered(operand.negate_for_sub(), node, obj) };
    }

    /// Fence for unordered RMA: buffered PUTs and GETs complete before
    /// this returns.
    pub fn rma_unordered_task_fence(&self) {
        self.task_local_buff_flush(BuffType::GET | BuffType::PUT);
    }

    /// Fence for unordered AMOs.
    pub fn amo_unordered_task_fence(&self) {
        self.task_local_buff_flush(BuffType::AMO_NF);
    }

    /// Fence for everything unordered, releasing the buffers too.
    pub fn unordered_task_fence(&self) {
        self.task_local_buff_end(BuffType::AMO_NF | BuffType::GET | BuffType::PUT);
    }
}
