//! Ordering and visibility: the memory-consistency core.
//!
//! With a delivery-complete provider, a completed PUT is visible at
//! the target and nothing here has work to do. With a message-order
//! provider, injected PUTs complete locally, so each task records the
//! nodes it has PUT to in a bitmap and, at points where those PUTs
//! must be visible, issues a one-byte dummy GET from each recorded
//! node's ordering ghost word on the same bound transmit context. The
//! provider's read-after-write guarantee forces the earlier PUTs into
//! visibility before the GET completes.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use nodeset::Bitmap;

use crate::ctx::TciState;
use crate::mem::RegBuf;
use crate::oob::OutOfBand;
use crate::task::{with_task_prv, TaskPrv};
use crate::Comm;

/// Completion context carried on a fabric operation: either an opaque
/// id (fire-and-forget) or the key of a blocking waiter's slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum TxnTrk {
    Id(u64),
    Done(usize),
}

const TRK_TAG_SHIFT: u32 = 63;
const TRK_PAYLOAD_MASK: u64 = (1 << TRK_TAG_SHIFT) - 1;

impl TxnTrk {
    pub fn encode(self) -> u64 {
        match self {
            TxnTrk::Id(id) => {
                debug_assert_eq!(id & !TRK_PAYLOAD_MASK, 0);
                id & TRK_PAYLOAD_MASK
            }
            TxnTrk::Done(key) => (1 << TRK_TAG_SHIFT) | (key as u64 & TRK_PAYLOAD_MASK),
        }
    }

    pub fn decode(ctx: u64) -> TxnTrk {
        if ctx >> TRK_TAG_SHIFT == 0 {
            TxnTrk::Id(ctx)
        } else {
            TxnTrk::Done((ctx & TRK_PAYLOAD_MASK) as usize)
        }
    }
}

impl TciState {
    /// Register a blocking waiter; returns the wire context and the
    /// flag the waiter spins on.
    pub(crate) fn trk_done(&mut self) -> (u64, Arc<AtomicBool>) {
        let flag = Arc::new(AtomicBool::new(false));
        let key = self.done_slots.insert(Arc::clone(&flag));
        (TxnTrk::Done(key).encode(), flag)
    }
}

/// Per-node ordering ghost word and the map of every node's copy.
///
/// The word's contents are meaningless; it exists only as a target for
/// dummy GETs, and any node may scribble on it at any time.
pub(crate) struct OrderState {
    _dummy: RegBuf,
    dummy_map: Vec<u64>,
}

impl OrderState {
    pub fn new(comm_mem: &crate::mem::MemTab, oob: &dyn OutOfBand, num_nodes: usize) -> Self {
        let dummy = comm_mem.alloc_bounce(4);
        assert!(
            comm_mem.local_key(dummy.addr(), 4).is_some(),
            "ordering ghost word must be registered"
        );
        let mine = (dummy.addr() as u64).to_le_bytes();
        let mut all = vec![0u8; 8 * num_nodes];
        oob.all_gather(&mine, &mut all);
        let dummy_map = (0..num_nodes)
            .map(|n| u64::from_le_bytes(all[n * 8..(n + 1) * 8].try_into().unwrap()))
            .collect();
        Self {
            _dummy: dummy,
            dummy_map,
        }
    }

    pub fn ghost_addr(&self, node: usize) -> u64 {
        self.dummy_map[node]
    }
}

impl Comm {
    /// Spin until the transaction identified by `trk` completes,
    /// driving progress while waiting.
    pub(crate) fn wait_txn_complete(&self, st: &mut TciState, trk: Option<&Arc<AtomicBool>>) {
        self.ensure_progress(st);
        match trk {
            Some(flag) => {
                while !flag.load(Ordering::Acquire) {
                    self.tasking().yield_now();
                    self.ensure_progress(st);
                }
            }
            None => {
                while st.txns_out > 0 {
                    self.tasking().yield_now();
                    self.ensure_progress(st);
                }
            }
        }
    }

    /// Force PUTs previously issued to `node` on this context into
    /// visibility: dummy GET of the node's ghost word, then wait.
    pub(crate) fn mcm_release_one_node(&self, node: usize, st: &mut TciState) {
        tracing::trace!(node, "dummy GET for ordering");
        let dst = self.order().ghost_addr(self.node_id()) as usize;
        let src = self.order().ghost_addr(node);
        if st.cq.is_some() {
            let (ctx, flag) = st.trk_done();
            // Safety: both ends are the registered ghost words.
            unsafe { crate::rma::get_ll(self, dst as *mut u8, node, src as usize, 1, ctx, st) };
            self.wait_txn_complete(st, Some(&flag));
        } else {
            unsafe {
                crate::rma::get_ll(
                    self,
                    dst as *mut u8,
                    node,
                    src as usize,
                    1,
                    TxnTrk::Id(0).encode(),
                    st,
                )
            };
            self.wait_txn_complete(st, None);
        }
    }

    /// Dummy-GET every node in the bitmap, clearing it as we go. The
    /// effects of these transactions don't matter, only that they
    /// complete after the recorded PUTs become visible.
    pub(crate) fn mcm_release_all_nodes(&self, b: &mut Bitmap, st: &mut TciState) {
        let nodes: Vec<usize> = b.iter_set().collect();
        for node in nodes {
            b.clear(node);
            self.check_tx_completions(st);
            // With a CQ, leave room for at least one transaction.
            while st.cq.is_some() && st.txns_out >= self.ctx().tx_cq_len as u64 {
                self.tasking().yield_now();
                self.check_tx_completions(st);
            }
            self.mcm_release_one_node(node, st);
        }
    }

    /// Make one node's outstanding PUTs visible, if any were recorded.
    /// Only message-order mode with a bound context ever records any.
    pub(crate) fn wait_for_puts_vis_one_node(&self, node: usize, tci: &crate::ctx::Tci<'_>) {
        if !self.have_delivery_complete() && tci.bound() {
            with_task_prv(self, |prv| {
                let mut bm = prv.put_bitmap.borrow_mut();
                if let Some(b) = bm.as_mut() {
                    if b.test(node) {
                        b.clear(node);
                        self.mcm_release_one_node(node, tci.st());
                    }
                }
            });
        }
    }

    /// Make every outstanding PUT visible. At task end the bitmap is
    /// also freed.
    pub(crate) fn wait_for_puts_vis_all_nodes(
        &self,
        tci: Option<&crate::ctx::Tci<'_>>,
        task_is_ending: bool,
    ) {
        if self.num_nodes() <= 1 || self.have_delivery_complete() {
            return;
        }
        let held;
        let tci = match tci {
            Some(t) => t,
            None => {
                held = self.tci_alloc();
                &held
            }
        };
        if tci.bound() {
            with_task_prv(self, |prv| {
                let mut bm = prv.put_bitmap.borrow_mut();
                if let Some(b) = bm.as_mut() {
                    self.mcm_release_all_nodes(b, tci.st());
                }
                if task_is_ending {
                    *bm = None;
                }
            });
        }
    }

    /// Record an injected PUT to `node` in the task's bitmap.
    pub(crate) fn note_injected_put(&self, node: usize) {
        with_task_prv(self, |prv| {
            let mut bm = prv.put_bitmap.borrow_mut();
            bm.get_or_insert_with(|| Bitmap::new(self.num_nodes())).set(node);
        });
    }

    /// Clear `node` from the task's bitmap: a real GET to the node
    /// subsumes the flush.
    pub(crate) fn clear_put_bitmap_node(&self, node: usize) {
        with_task_prv(self, |prv| {
            if let Some(b) = prv.put_bitmap.borrow_mut().as_mut() {
                b.clear(node);
            }
        });
    }

    /// Whether the calling task still holds PUTs whose visibility has
    /// not been forced (diagnostic).
    pub fn has_pending_put_visibility(&self) -> bool {
        with_task_prv(self, |prv| {
            prv.put_bitmap
                .borrow()
                .as_ref()
                .map(|b| !b.is_empty())
                .unwrap_or(false)
        })
    }
}

// =============================================================================
// Delayed-blocking AM completion
// =============================================================================

/// Outcome of arranging delayed completion for a non-fetching AMO.
pub(crate) enum DelayedDone {
    /// Spin on this task-private byte at the next MCM-significant
    /// operation; the request carries its address.
    Installed(usize),
    /// The task is ending; nothing after this can observe the AMO, so
    /// issue it strictly non-blocking.
    TaskEnding,
}

impl Comm {
    pub(crate) fn set_up_delayed_am_done(&self) -> DelayedDone {
        with_task_prv(self, |prv: &TaskPrv| {
            if prv.task_is_ending.get() {
                return DelayedDone::TaskEnding;
            }
            let addr = prv.delayed_done_addr(self);
            prv.reset_delayed_done();
            prv.am_done_pending.set(true);
            DelayedDone::Installed(addr)
        })
    }

    /// Wait out any delayed-blocking AM before the next operation with
    /// MCM implications.
    pub(crate) fn retire_delayed_am_done(&self, task_is_ending: bool) {
        with_task_prv(self, |prv| {
            if prv.am_done_pending.get() {
                let addr = prv.delayed_done.borrow().as_ref().unwrap().addr();
                crate::am::am_wait_for_done(self, addr);
                prv.am_done_pending.set(false);
            }
            if task_is_ending {
                prv.task_is_ending.set(true);
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn trk_round_trip() {
        for trk in [TxnTrk::Id(0), TxnTrk::Id(12345), TxnTrk::Done(0), TxnTrk::Done(77)] {
            assert_eq!(TxnTrk::decode(trk.encode()), trk);
        }
    }

    #[test]
    fn trk_tag_separation() {
        // The id space and the waiter-slot space never collide.
        assert_ne!(TxnTrk::Id(5).encode(), TxnTrk::Done(5).encode());
    }
}
