//! The RMA engine: PUT and GET for arbitrary sizes.
//!
//! Transfers above the provider's maximum message size are chunked.
//! When the remote address has no registration key the transfer runs
//! inverted through an active message (the target does the opposite
//! RMA against us); when the local address is unusable as a transfer
//! buffer it is staged through registered scratch.

use std::ptr;

use nodeset::Bitmap;

use crate::ctx::TciState;
use crate::mem::RegBuf;
use crate::order::TxnTrk;
use crate::Comm;

// Fire-and-forget context ids, for completion-event debugging.
pub(crate) const ID_PUT: u64 = 1;
pub(crate) const ID_GET: u64 = 2;
pub(crate) const ID_GET_V: u64 = 3;
pub(crate) const ID_PUT_V: u64 = 4;
pub(crate) const ID_AMO_NF: u64 = 5;
pub(crate) const ID_DONE: u64 = 6;

/// PUT `size` bytes from `src` to `raddr` on `node`.
///
/// # Safety
/// `src` must be valid for reads of `size` bytes; `raddr` must be a
/// valid object address on `node` for the duration of the call.
pub(crate) unsafe fn put(comm: &Comm, src: *const u8, node: usize, raddr: usize, size: usize) {
    // Don't ask the provider to transfer more than it wants to.
    let max = comm.max_msg_size();
    if size > max {
        tracing::trace!(node, size, "splitting large PUT");
        let mut at = 0;
        while at < size {
            let chunk = max.min(size - at);
            unsafe { put_one(comm, src.add(at), node, raddr + at, chunk) };
            at += chunk;
        }
        return;
    }
    unsafe { put_one(comm, src, node, raddr, size) };
}

unsafe fn put_one(comm: &Comm, src: *const u8, node: usize, raddr: usize, size: usize) {
    tracing::trace!(node, raddr, size, "PUT");

    if let Some((key, off)) = comm.mem().remote_key(node, raddr, size) {
        // The remote address is RMA-accessible; write it directly.
        let mut _bounce: Option<RegBuf> = None;
        let mut my_src = src;
        if !comm.mem().local_covered(src as usize, size) {
            let b = comm.mem().alloc_bounce(size);
            unsafe { ptr::copy_nonoverlapping(src, b.as_mut_ptr(), size) };
            my_src = b.as_ptr();
            _bounce = Some(b);
        }

        let tci = comm.tci_alloc();
        let st = tci.st();
        let dc = comm.have_delivery_complete();

        // With delivery-complete, completion implies visibility: write
        // and wait. With message ordering, visibility needs a dummy
        // GET on the same endpoint pair; without a bound context that
        // must happen right here, and a transfer too big to inject
        // cannot return before its source is consumed either. Only a
        // small inject on a bound context may complete lazily, with
        // the target node recorded for a later flush.
        if dc || !tci.bound() || size > comm.inject_size() {
            let (ctx, flag) = st.trk_done();
            let write_ctx = if dc { ctx } else { TxnTrk::Id(ID_PUT).encode() };
            comm.ride_out_eagain(st, |s| unsafe {
                s.tx.write(
                    my_src,
                    size,
                    comm.ctx().rx_rma_addr(node),
                    off,
                    key,
                    write_ctx,
                )
            });
            st.txns_out += 1;
            st.txns_sent += 1;

            if !dc {
                tracing::trace!(node, "dummy GET for PUT ordering");
                let dst = comm.order().ghost_addr(comm.node_id()) as usize;
                let ghost = comm.order().ghost_addr(node) as usize;
                unsafe { get_ll(comm, dst as *mut u8, node, ghost, 1, ctx, st) };
            }

            comm.wait_txn_complete(st, Some(&flag));
        } else {
            comm.ride_out_eagain(st, |s| unsafe {
                s.tx.inject_write(my_src, size, comm.ctx().rx_rma_addr(node), off, key)
            });
            st.txns_sent += 1;
            comm.note_injected_put(node);
        }
    } else {
        // Not RMA-accessible: make sure our side is, then have the
        // target GET from us.
        let mut _bounce: Option<RegBuf> = None;
        let mut my_src = src as usize;
        if comm.mem().local_key(my_src, size).is_none() {
            let b = comm.mem().alloc_bounce(size);
            unsafe { ptr::copy_nonoverlapping(src, b.as_mut_ptr(), size) };
            my_src = b.addr();
            _bounce = Some(b);
        }
        tracing::trace!(node, raddr, size, "PUT via AM GET");
        crate::am::am_request_rma(comm, node, crate::am::RmaDir::Get, raddr, my_src, size);
    }
}

/// GET `size` bytes from `raddr` on `node` into `dst`.
///
/// # Safety
/// `dst` must be valid for writes of `size` bytes; `raddr` must be a
/// valid object address on `node` for the duration of the call.
pub(crate) unsafe fn get(comm: &Comm, dst: *mut u8, node: usize, raddr: usize, size: usize) {
    let max = comm.max_msg_size();
    if size > max {
        tracing::trace!(node, size, "splitting large GET");
        let mut at = 0;
        while at < size {
            let chunk = max.min(size - at);
            unsafe { get_one(comm, dst.add(at), node, raddr + at, chunk) };
            at += chunk;
        }
        return;
    }
    unsafe { get_one(comm, dst, node, raddr, size) };
}

unsafe fn get_one(comm: &Comm, dst: *mut u8, node: usize, raddr: usize, size: usize) {
    tracing::trace!(node, raddr, size, "GET");

    if let Some((key, off)) = comm.mem().remote_key(node, raddr, size) {
        let mut bounce: Option<RegBuf> = None;
        let mut my_dst = dst;
        if !comm.mem().local_covered(dst as usize, size) {
            let b = comm.mem().alloc_bounce(size);
            my_dst = b.as_mut_ptr();
            bounce = Some(b);
        }

        let tci = comm.tci_alloc();
        let st = tci.st();

        let (ctx, flag) = if st.cq.is_some() {
            let (c, f) = st.trk_done();
            (c, Some(f))
        } else {
            (TxnTrk::Id(ID_GET).encode(), None)
        };

        comm.ride_out_eagain(st, |s| unsafe {
            s.tx.read(my_dst, size, comm.ctx().rx_rma_addr(node), off, key, ctx)
        });
        st.txns_out += 1;
        st.txns_sent += 1;

        // This GET forces any outstanding PUT to the same node into
        // visibility, so the flush it would have needed is covered.
        if !comm.have_delivery_complete() && tci.bound() {
            comm.clear_put_bitmap_node(node);
        }

        comm.wait_txn_complete(st, flag.as_ref());

        if let Some(b) = bounce {
            unsafe { ptr::copy_nonoverlapping(b.as_ptr(), dst, size) };
        }
    } else {
        let mut bounce: Option<RegBuf> = None;
        let mut my_dst = dst as usize;
        if comm.mem().local_key(my_dst, size).is_none() {
            let b = comm.mem().alloc_bounce(size);
            my_dst = b.addr();
            bounce = Some(b);
        }
        tracing::trace!(node, raddr, size, "GET via AM PUT");
        crate::am::am_request_rma(comm, node, crate::am::RmaDir::Put, raddr, my_dst, size);
        if let Some(b) = bounce {
            unsafe { ptr::copy_nonoverlapping(b.as_ptr(), dst, size) };
        }
    }
}

/// Low-level PUT on a caller-held context: no fallback, no chunking,
/// no waiting. The remote address must resolve.
///
/// # Safety
/// As for [`put`]; additionally both addresses must be registered.
pub(crate) unsafe fn put_ll(
    comm: &Comm,
    src: *const u8,
    node: usize,
    raddr: usize,
    size: usize,
    ctx: u64,
    st: &mut TciState,
    use_inject: bool,
) {
    let (key, off) = comm
        .mem()
        .remote_key(node, raddr, size)
        .unwrap_or_else(|| comm.fatal(comm.mem().io_err_unreachable(node, raddr, size)));

    // Injected writes generate no completion event, so don't count
    // them as outstanding.
    if use_inject && size <= comm.inject_size() {
        comm.ride_out_eagain(st, |s| unsafe {
            s.tx.inject_write(src, size, comm.ctx().rx_rma_addr(node), off, key)
        });
        st.txns_sent += 1;
    } else {
        comm.ride_out_eagain(st, |s| unsafe {
            s.tx.write(src, size, comm.ctx().rx_rma_addr(node), off, key, ctx)
        });
        st.txns_out += 1;
        st.txns_sent += 1;
    }
}

/// Low-level GET on a caller-held context: no fallback, no chunking,
/// no waiting. The remote address must resolve.
///
/// # Safety
/// As for [`get`]; additionally both addresses must be registered.
pub(crate) unsafe fn get_ll(
    comm: &Comm,
    dst: *mut u8,
    node: usize,
    raddr: usize,
    size: usize,
    ctx: u64,
    st: &mut TciState,
) {
    let (key, off) = comm
        .mem()
        .remote_key(node, raddr, size)
        .unwrap_or_else(|| comm.fatal(comm.mem().io_err_unreachable(node, raddr, size)));

    comm.ride_out_eagain(st, |s| unsafe {
        s.tx.read(dst, size, comm.ctx().rx_rma_addr(node), off, key, ctx)
    });
    st.txns_out += 1;
    st.txns_sent += 1;
}

/// One entry of a vectorised PUT or GET; the key and offset were
/// resolved when the entry was buffered.
#[derive(Debug, Clone, Copy)]
pub(crate) struct RmaVEntry {
    pub addr: usize,
    pub node: usize,
    pub key: u64,
    pub off: u64,
    pub size: usize,
}

/// Submit a batch of PUTs as one chained group, then force them all
/// visible. `b` records the nodes touched.
pub(crate) fn put_v(comm: &Comm, entries: &[RmaVEntry], b: &mut Bitmap) {
    if entries.is_empty() {
        return;
    }
    tracing::trace!(len = entries.len(), "vectorised PUT");

    let tci = comm.tci_alloc();
    let st = tci.st();
    reserve_cq_room(comm, st, entries.len());

    b.zero();
    for (vi, e) in entries.iter().enumerate() {
        let more = vi < entries.len() - 1;
        comm.ride_out_eagain(st, |s| unsafe {
            s.tx.writemsg(
                e.addr as *const u8,
                e.size,
                comm.ctx().rx_rma_addr(e.node),
                e.off,
                e.key,
                TxnTrk::Id(ID_PUT_V).encode(),
                more,
            )
        });
        st.txns_out += 1;
        st.txns_sent += 1;
        b.set(e.node);
    }

    // Restore the consistency invariant for everything we just wrote.
    comm.mcm_release_all_nodes(b, st);
}

/// Submit a batch of GETs as one chained group and wait for them all.
pub(crate) fn get_v(comm: &Comm, entries: &[RmaVEntry]) {
    if entries.is_empty() {
        return;
    }
    tracing::trace!(len = entries.len(), "vectorised GET");

    let tci = comm.tci_alloc();
    let st = tci.st();
    reserve_cq_room(comm, st, entries.len());

    for (vi, e) in entries.iter().enumerate() {
        st.txns_out += 1;
        st.txns_sent += 1;
        let chain_on = st.txns_out < comm.ctx().tx_cq_len as u64 && vi < entries.len() - 1;
        comm.ride_out_eagain(st, |s| unsafe {
            s.tx.readmsg(
                e.addr as *mut u8,
                e.size,
                comm.ctx().rx_rma_addr(e.node),
                e.off,
                e.key,
                TxnTrk::Id(ID_GET_V).encode(),
                chain_on,
            )
        });
        if !chain_on {
            while st.txns_out > 0 {
                comm.ensure_progress(st);
            }
        }
    }
}

/// Make sure the context's CQ can absorb `want` more transactions.
pub(crate) fn reserve_cq_room(comm: &Comm, st: &mut TciState, want: usize) {
    if st.cq.is_some() {
        let cq_len = comm.ctx().tx_cq_len as u64;
        if want as u64 > cq_len.saturating_sub(st.txns_out) {
            comm.check_tx_completions(st);
            while want as u64 > cq_len.saturating_sub(st.txns_out) {
                comm.tasking().yield_now();
                comm.check_tx_completions(st);
            }
        }
    }
}
