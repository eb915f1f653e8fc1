//! Endpoint construction and the transmit-context table.
//!
//! Each node owns one receive endpoint for AM requests, one receive
//! endpoint for RMA/AMO targets, and a table of transmit contexts.
//! The table is partitioned: entries `[0, num_workers)` serve
//! application tasks, the final entry is reserved for the AM handler.
//! A bound entry is permanently owned by one thread so the provider's
//! per-endpoint-pair orderings hold across calls; a non-bound entry is
//! acquired and released per operation.

use std::cell::Cell;
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::cell::UnsafeCell;

use fabric::{
    AddressVector, Counter, Domain, FabricAddr, PollSet, RxCq, RxEndpoint, TxCompletion,
    TxContext, TxCq, WaitSet,
};
use slab::Slab;

use crate::env::CommEnv;
use crate::error::{open_file_limit_msg, Error, Result};
use crate::oob::OutOfBand;
use crate::provider::ProvCtl;
use crate::task::Tasking;
use crate::Comm;

/// Maximum transactions outstanding in one chained submission.
pub(crate) const MAX_TXNS_IN_FLIGHT: usize = 64;

/// Number of AM handlers. Table partitioning and the handler loop
/// assume exactly one; revisit both before raising this.
pub(crate) const NUM_AM_HANDLERS: usize = 1;

/// Poll-set ids for the handler loop.
pub(crate) const POLL_ID_AM_RX: u64 = 1;
pub(crate) const POLL_ID_RMA_RX: u64 = 2;
pub(crate) const POLL_ID_HANDLER_TX: u64 = 3;

/// How the RMA target endpoint reports completions; chosen at init so
/// either backend stays possible.
pub(crate) enum RxRmaCmpl {
    Cq(RxCq),
    Cntr(Counter),
}

/// Mutable state of one transmit context; exclusively owned by the
/// allocating thread while the entry is allocated.
pub(crate) struct TciState {
    pub tx: TxContext,
    pub cq: Option<TxCq>,
    pub cntr: Option<Counter>,
    pub is_handler: bool,
    /// Transactions in flight now.
    pub txns_out: u64,
    /// Transactions ever initiated.
    pub txns_sent: u64,
    /// Waiter slots for blocking completion contexts.
    pub done_slots: Slab<Arc<AtomicBool>>,
}

pub(crate) struct TciEntry {
    allocated: AtomicBool,
    bound: AtomicBool,
    inner: UnsafeCell<TciState>,
}

// Safety: `inner` is only accessed by the unique thread that holds the
// entry per the allocated/bound protocol in `tci_alloc`/`Tci::drop`.
unsafe impl Sync for TciEntry {}

/// Endpoint and context table for one node.
pub(crate) struct CtxTab {
    pub av: AddressVector,
    /// Fabric addresses of every node's rx endpoints: `2n` is the AM
    /// endpoint, `2n + 1` the RMA endpoint.
    rx_addrs: Vec<FabricAddr>,
    pub num_tx_ctxs: usize,
    pub num_workers: usize,
    pub fixed_assignments: bool,
    pub use_scalable_ep: bool,
    pub tx_cq_len: usize,
    entries: Box<[TciEntry]>,
    pub rx_msg_ep: RxEndpoint,
    pub rx_msg_cq: RxCq,
    rx_rma_ep: RxEndpoint,
    pub rx_rma: RxRmaCmpl,
    pub poll_set: Option<PollSet>,
    pub wait_set: Option<WaitSet>,
}

thread_local! {
    /// Last context index used by this thread, keyed by runtime
    /// instance; checked first on alloc.
    static LAST_TCI: Cell<Option<(usize, usize)>> = const { Cell::new(None) };
    /// Rotor for the free-entry search, keyed the same way.
    static LAST_IW: Cell<(usize, usize)> = const { Cell::new((usize::MAX, 0)) };
    /// Whether this thread is the AM handler.
    static IS_AM_HANDLER: Cell<bool> = const { Cell::new(false) };
}

pub(crate) fn mark_am_handler_thread() {
    IS_AM_HANDLER.with(|f| f.set(true));
}

pub(crate) fn is_am_handler_thread() -> bool {
    IS_AM_HANDLER.with(|f| f.get())
}

impl CtxTab {
    pub fn new(
        domain: &Domain,
        oob: &dyn OutOfBand,
        env: &CommEnv,
        tasking: &dyn Tasking,
        num_nodes: usize,
        prov_ctl: &ProvCtl,
    ) -> Result<CtxTab> {
        let info = domain.info();
        let use_scalable_ep = info.domain_attr.max_ep_tx_ctx > 1 && env.use_scalable_ep();

        let (num_tx_ctxs, num_workers, fixed_assignments) =
            Self::num_ctxs(domain, env, tasking, use_scalable_ep);
        tracing::debug!(
            num_tx_ctxs,
            num_workers,
            fixed_assignments,
            use_scalable_ep,
            "transmit context table sized"
        );

        // Poll and wait sets, if the provider supports them. We either
        // get both or use neither.
        let (poll_set, wait_set) = if prov_ctl.no_wait_sets {
            (None, None)
        } else {
            match (domain.poll_open(), domain.wait_open()) {
                (Ok(p), Ok(w)) => (Some(p), Some(w)),
                _ => (None, None),
            }
        };

        let mut av_count = 2 * num_nodes;
        if prov_ctl.size_avs_by_num_eps {
            // Some utility providers track per-endpoint address state
            // and size their tables from the AV count.
            av_count *= num_tx_ctxs;
        }
        let av = domain.av_open(av_count).map_err(Error::Io)?;

        // Worker contexts get completion queues so they can tell what
        // kind of thing completed; size them for a full chained batch
        // plus slack for responses in flight.
        let tx_cq_len = 100 + MAX_TXNS_IN_FLIGHT;
        let mut entries = Vec::with_capacity(num_tx_ctxs);
        for i in 0..num_tx_ctxs {
            let is_handler = i >= num_workers;
            let cq = if is_handler {
                domain.cq_open_tx(100, wait_set.as_ref()).map_err(Error::Io)?
            } else {
                domain.cq_open_tx(tx_cq_len, None).map_err(Error::Io)?
            };
            let tx = domain
                .tx_context(&av, TxCompletion::Cq(&cq))
                .map_err(Error::Io)?;
            entries.push(TciEntry {
                allocated: AtomicBool::new(false),
                bound: AtomicBool::new(false),
                inner: UnsafeCell::new(TciState {
                    tx,
                    cq: Some(cq),
                    cntr: None,
                    is_handler,
                    txns_out: 0,
                    txns_sent: 0,
                    done_slots: Slab::new(),
                }),
            });
        }

        // Receive endpoints: AM requests on a CQ sized for much of the
        // job sending at once; RMA targets on a CQ (or a counter when
        // the provider prefers them).
        let rx_msg_cq = domain
            .cq_open_rx(num_nodes * num_workers, wait_set.as_ref())
            .map_err(Error::Io)?;
        let rx_msg_ep = domain.rx_endpoint(&av, &rx_msg_cq).map_err(Error::Io)?;

        let rx_rma_cq = domain
            .cq_open_rx(num_nodes * num_workers, wait_set.as_ref())
            .map_err(Error::Io)?;
        let rx_rma_ep = domain.rx_endpoint(&av, &rx_rma_cq).map_err(Error::Io)?;
        let rx_rma = if info.domain_attr.cntr_cnt > 0 {
            RxRmaCmpl::Cntr(domain.cntr_open().map_err(Error::Io)?)
        } else {
            RxRmaCmpl::Cq(rx_rma_cq)
        };

        if let Some(ps) = &poll_set {
            ps.add_rx(POLL_ID_AM_RX, &rx_msg_cq);
            if let RxRmaCmpl::Cq(cq) = &rx_rma {
                ps.add_rx(POLL_ID_RMA_RX, cq);
            }
            let handler = entries.last().unwrap();
            // Safety: init-time, single-threaded; no entry is allocated yet.
            let st = unsafe { &*handler.inner.get() };
            ps.add_tx(POLL_ID_HANDLER_TX, st.cq.as_ref().unwrap());
        }

        // Exchange endpoint names and build the address table: two
        // entries per node, AM first.
        let mut my_names = [0u8; 16];
        my_names[..8].copy_from_slice(&rx_msg_ep.name().0);
        my_names[8..].copy_from_slice(&rx_rma_ep.name().0);
        let mut all_names = vec![0u8; 16 * num_nodes];
        oob.all_gather(&my_names, &mut all_names);

        let mut names = Vec::with_capacity(2 * num_nodes);
        for n in 0..num_nodes {
            let at = n * 16;
            names.push(fabric::EpName(all_names[at..at + 8].try_into().unwrap()));
            names.push(fabric::EpName(all_names[at + 8..at + 16].try_into().unwrap()));
        }
        let rx_addrs = av.insert(&names);
        if rx_addrs.len() != 2 * num_nodes {
            return Err(Error::OobMismatch(format!(
                "address vector holds {} entries, expected {}",
                rx_addrs.len(),
                2 * num_nodes
            )));
        }

        Ok(CtxTab {
            av,
            rx_addrs,
            num_tx_ctxs,
            num_workers,
            fixed_assignments,
            use_scalable_ep,
            tx_cq_len,
            entries: entries.into_boxed_slice(),
            rx_msg_ep,
            rx_msg_cq,
            rx_rma_ep,
            rx_rma,
            poll_set,
            wait_set,
        })
    }

    /// Size the context table: provider maximum, capped by configured
    /// concurrency, capped by useful parallelism; with a fixed-thread
    /// tasking layer, one private context per fixed thread plus one
    /// spare enables permanent binding.
    fn num_ctxs(
        domain: &Domain,
        env: &CommEnv,
        tasking: &dyn Tasking,
        use_scalable_ep: bool,
    ) -> (usize, usize, bool) {
        let attr = &domain.info().domain_attr;
        let mut max_workers = if use_scalable_ep {
            attr.max_ep_tx_ctx - NUM_AM_HANDLERS
        } else {
            attr.ep_cnt - NUM_AM_HANDLERS
        };
        assert!(max_workers > 0, "provider offers no worker tx contexts");

        if let Some(conc) = env.concurrency {
            if conc > 0 && max_workers > conc {
                max_workers = conc;
            }
        }

        let fixed = tasking.fixed_num_threads();
        let fixed_assignments;
        if fixed > 0 {
            assert_eq!(fixed, tasking.max_par(), "fixed threads vs max parallelism");
            if max_workers > fixed + 1 {
                max_workers = fixed + 1;
            }
            fixed_assignments = max_workers == fixed + 1;
        } else {
            let max_par = tasking.max_par();
            if max_workers > max_par {
                max_workers = max_par;
            }
            fixed_assignments = false;
        }

        (max_workers + NUM_AM_HANDLERS, max_workers, fixed_assignments)
    }

    #[inline]
    pub fn rx_msg_addr(&self, node: usize) -> FabricAddr {
        self.rx_addrs[2 * node]
    }

    #[inline]
    pub fn rx_rma_addr(&self, node: usize) -> FabricAddr {
        self.rx_addrs[2 * node + 1]
    }

    pub fn rx_rma_ep(&self) -> &RxEndpoint {
        &self.rx_rma_ep
    }

    /// The first worker context's transmit side, for init-time probes
    /// whose answer is the same on every endpoint.
    pub fn tx0(&self) -> &TxContext {
        // Safety: init-time use only, before any entry is allocated.
        unsafe { &(*self.entries[0].inner.get()).tx }
    }

    fn entry(&self, idx: usize) -> &TciEntry {
        &self.entries[idx]
    }
}

/// Guard over an allocated transmit-context entry. Bound entries stay
/// allocated when the guard drops; floating entries are released.
pub(crate) struct Tci<'a> {
    tab: &'a CtxTab,
    pub idx: usize,
}

impl Tci<'_> {
    /// Exclusive access to the context state.
    ///
    /// Safety of the cast: the allocation protocol gives the holding
    /// thread exclusive ownership of `inner`. Callers must not hold
    /// two live references from separate `st()` calls.
    #[allow(clippy::mut_from_ref)]
    pub fn st(&self) -> &mut TciState {
        unsafe { &mut *self.tab.entry(self.idx).inner.get() }
    }

    pub fn bound(&self) -> bool {
        self.tab.entry(self.idx).bound.load(Ordering::Relaxed)
    }
}

impl Drop for Tci<'_> {
    fn drop(&mut self) {
        let entry = self.tab.entry(self.idx);
        if !entry.bound.load(Ordering::Relaxed) {
            entry.allocated.store(false, Ordering::Release);
        }
    }
}

impl Comm {
    /// Allocate a transmit context for the calling task.
    pub(crate) fn tci_alloc(&self) -> Tci<'_> {
        self.tci_alloc_common(false)
    }

    /// Allocate and bind the AM handler's reserved context.
    pub(crate) fn tci_alloc_for_handler(&self) -> Tci<'_> {
        self.tci_alloc_common(true)
    }

    fn tci_alloc_common(&self, bind_to_am_handler: bool) -> Tci<'_> {
        let tab = self.ctx();

        // Fast path: the last context this thread used, if it is bound
        // to us or can be re-acquired.
        if !bind_to_am_handler {
            if let Some((uid, idx)) = LAST_TCI.with(|c| c.get()) {
                if uid == self.uid() {
                    let entry = tab.entry(idx);
                    if entry.bound.load(Ordering::Relaxed) {
                        return Tci { tab, idx };
                    }
                    if !entry.allocated.swap(true, Ordering::Acquire) {
                        return Tci { tab, idx };
                    }
                }
            }
        }

        let idx = self.find_free_tci(bind_to_am_handler);
        let entry = tab.entry(idx);
        if bind_to_am_handler
            || (tab.fixed_assignments && self.tasking().is_fixed_thread())
        {
            entry.bound.store(true, Ordering::Relaxed);
        }
        tracing::trace!(
            idx,
            bound = entry.bound.load(Ordering::Relaxed),
            "allocated tx context"
        );
        LAST_TCI.with(|c| c.set(Some((self.uid(), idx))));
        Tci { tab, idx }
    }

    fn find_free_tci(&self, bind_to_am_handler: bool) -> usize {
        let tab = self.ctx();

        if bind_to_am_handler {
            // The handler block is the table tail; one handler only.
            let idx = tab.num_workers;
            let was = tab.entry(idx).allocated.swap(true, Ordering::Acquire);
            assert!(!was, "AM handler tx context already allocated");
            return idx;
        }

        // Search the worker block, starting after this thread's last
        // stop. Only give up if every entry is bound: then no entry can
        // ever come free.
        loop {
            let start = LAST_IW.with(|c| {
                let (uid, iw) = c.get();
                if uid == self.uid() {
                    iw
                } else {
                    0
                }
            });
            let mut iw = start;
            let mut all_bound = true;
            loop {
                iw += 1;
                if iw >= tab.num_workers {
                    iw = 0;
                }
                let entry = tab.entry(iw);
                all_bound = all_bound && entry.bound.load(Ordering::Relaxed);
                if !entry.allocated.swap(true, Ordering::Acquire) {
                    LAST_IW.with(|c| c.set((self.uid(), iw)));
                    return iw;
                }
                if iw == start {
                    break;
                }
            }
            if all_bound {
                self.fatal_msg("all worker tx contexts are bound; none can come free");
            }
            self.tasking().yield_now();
        }
    }

    /// Check the RMA target endpoint's completion object. The backend
    /// was chosen at init; both just drain, since inbound RMA needs no
    /// explicit action.
    pub(crate) fn check_rx_rma_completions(&self) {
        match &self.ctx().rx_rma {
            RxRmaCmpl::Cq(cq) => {
                let mut entries = [fabric::RxEntry {
                    flags: fabric::RxFlags::RECV,
                    buf: 0,
                    len: 0,
                }; 1];
                if let Err(e) = cq.read(&mut entries) {
                    self.fatal(e);
                }
            }
            RxRmaCmpl::Cntr(cntr) => {
                let _ = cntr.read();
            }
        }
    }

    /// Drive progress on a context: consume its transmit completions,
    /// and for the AM handler also the inbound-RMA side.
    pub(crate) fn ensure_progress(&self, st: &mut TciState) {
        self.check_tx_completions(st);
        if st.is_handler && self.ctx().poll_set.is_none() {
            self.check_rx_rma_completions();
        }
    }

    /// Consume pending transmit completions on `st`, waking any
    /// blocking waiters they identify.
    pub(crate) fn check_tx_completions(&self, st: &mut TciState) {
        if let Some(cq) = &st.cq {
            let mut entries = [fabric::TxEntry { context: 0 }; MAX_TXNS_IN_FLIGHT];
            let n = match cq.read(&mut entries) {
                Ok(n) => n,
                Err(e) => self.fatal(e),
            };
            st.txns_out -= n as u64;
            for e in &entries[..n] {
                match crate::order::TxnTrk::decode(e.context) {
                    crate::order::TxnTrk::Done(key) => {
                        let flag = st.done_slots.remove(key);
                        flag.store(true, Ordering::Release);
                    }
                    crate::order::TxnTrk::Id(_) => {}
                }
            }
        } else if let Some(cntr) = &st.cntr {
            let count = cntr.read();
            assert!(
                count <= st.txns_sent,
                "completion counter {count} exceeds transactions sent {}",
                st.txns_sent
            );
            st.txns_out = st.txns_sent - count;
        }
    }

    /// Retry `f` while the fabric reports a transient "again",
    /// driving progress between attempts.
    pub(crate) fn ride_out_eagain(
        &self,
        st: &mut TciState,
        mut f: impl FnMut(&TciState) -> io::Result<()>,
    ) {
        loop {
            match f(st) {
                Ok(()) => return,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    self.ensure_progress(st);
                    if is_am_handler_thread() && self.am_handlers_exiting() {
                        return;
                    }
                }
                Err(e) => self.fatal(e),
            }
        }
    }
}

impl Comm {
    /// Abort the process over an unrecoverable fabric error.
    pub(crate) fn fatal(&self, e: io::Error) -> ! {
        if e.raw_os_error() == Some(libc::EMFILE) {
            self.fatal_msg(&open_file_limit_msg(self.num_nodes(), self.ctx().num_tx_ctxs));
        }
        self.fatal_msg(&format!("fabric error: {e}"));
    }

    pub(crate) fn fatal_msg(&self, msg: &str) -> ! {
        tracing::error!(node = self.node_id(), "{msg}");
        if self.env().abort_on_error {
            eprintln!("node {}: {msg}", self.node_id());
            std::process::abort();
        }
        panic!("node {}: {msg}", self.node_id());
    }
}
