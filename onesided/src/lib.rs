//! One-sided communication runtime: remote memory access, remote
//! atomics, and active messages between the nodes of a parallel job.
//!
//! # Architecture
//!
//! ```text
//! user op ──► RMA / AMO / AM engine ──► tx-context scheduler ──► fabric
//!                                                                  │
//!      initiator ◄── done-flag PUT ◄── AM handler / CPU AMO ◄── rx endpoint
//! ```
//!
//! A [`Comm`] owns one node's slice of the job: the selected provider,
//! the registered-memory table, the endpoint and transmit-context
//! fabric, the ordering layer that upholds the memory consistency
//! model, and the active-message handler. Operations never return
//! fabric errors; after initialization they either succeed or
//! terminate the process.
//!
//! Construction needs a fabric node handle, an out-of-band bootstrap
//! channel, and (optionally) a tasking layer and a table of functions
//! reachable by remote execute-on requests.

pub mod am;
pub mod amo;
pub mod barrier;
pub mod buff;
pub mod ctx;
pub mod env;
pub mod error;
pub mod mem;
pub mod oob;
pub mod order;
pub mod provider;
pub mod rma;
pub mod task;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::ThreadId;

pub use amo::{AmoDt, AmoInt, AmoOp, AmoValue};
pub use buff::{BuffType, MAX_UNORDERED_TRANS_SZ};
pub use am::MAX_EXECON_INLINE;
pub use env::CommEnv;
pub use error::{Error, Result};
pub use oob::{MeshOob, OutOfBand};
pub use task::{Tasking, ThreadTasking};

use am::{am_request_execute_on, am_request_shutdown};
use ctx::CtxTab;
use mem::MemTab;
use order::OrderState;

/// A function reachable by remote execute-on requests.
pub type ExecFn = fn(&Comm, &[u8]);

/// Builder for one node's communication runtime.
pub struct CommBuilder {
    node: fabric::Node,
    oob: Arc<dyn OutOfBand>,
    tasking: Arc<dyn Tasking>,
    env: Option<CommEnv>,
    fn_table: Vec<ExecFn>,
    fixed_heap: Option<(usize, usize)>,
    private_table: Vec<(usize, usize)>,
}

impl CommBuilder {
    pub fn new(node: fabric::Node, oob: Arc<dyn OutOfBand>) -> CommBuilder {
        CommBuilder {
            node,
            oob,
            tasking: Arc::new(ThreadTasking::new()),
            env: None,
            fn_table: Vec::new(),
            fixed_heap: None,
            private_table: Vec::new(),
        }
    }

    /// Substitute a tasking layer.
    pub fn tasking(mut self, tasking: Arc<dyn Tasking>) -> Self {
        self.tasking = tasking;
        self
    }

    /// Substitute a configuration block (defaults to the process
    /// environment).
    pub fn env(mut self, env: CommEnv) -> Self {
        self.env = Some(env);
        self
    }

    /// Register the functions reachable by execute-on requests. All
    /// nodes must register the same table in the same order.
    pub fn fn_table(mut self, fns: Vec<ExecFn>) -> Self {
        self.fn_table = fns;
        self
    }

    /// Supply the fixed heap for providers that need explicit
    /// registration.
    ///
    /// # Safety
    /// The range must stay valid for the life of the runtime and be
    /// usable for remote reads and writes.
    pub unsafe fn fixed_heap(mut self, addr: *mut u8, len: usize) -> Self {
        self.fixed_heap = Some((addr as usize, len));
        self
    }

    /// Register the private-broadcast table: per-id local destinations
    /// for [`Comm::broadcast_private`]. All nodes must register tables
    /// of the same shape.
    ///
    /// # Safety
    /// Every entry must stay valid for the life of the runtime.
    pub unsafe fn private_table(mut self, tab: Vec<(*mut u8, usize)>) -> Self {
        self.private_table = tab.into_iter().map(|(p, l)| (p as usize, l)).collect();
        self
    }

    /// Initialize this node's runtime. Collective: every node of the
    /// job must call `build` for any of them to return.
    pub fn build(self) -> Result<Arc<Comm>> {
        let env = self.env.unwrap_or_else(|| CommEnv::global().clone());
        let node_id = self.node.id() as usize;
        let num_nodes = self.node.num_nodes();

        let selection = provider::select(&self.node, &env, self.fixed_heap.is_some(), num_nodes)?;
        let domain = fabric::Domain::open(&selection.info)?;

        let ctx = CtxTab::new(
            &domain,
            self.oob.as_ref(),
            &env,
            self.tasking.as_ref(),
            num_nodes,
            &selection.prov_ctl,
        )?;
        let mem = MemTab::new(&domain, &ctx, self.oob.as_ref(), num_nodes, self.fixed_heap)?;
        let order = OrderState::new(&mem, self.oob.as_ref(), num_nodes);
        let amo_valid = amo::probe_atomic_valid(&ctx);
        let am = am::AmState::new(&ctx, num_nodes);
        let bar = barrier::BarState::new(&mem, self.oob.as_ref(), node_id, num_nodes);

        // Share the private-broadcast destinations around.
        let priv_map = {
            let mut lens = vec![0u8; 8 * num_nodes];
            self.oob
                .all_gather(&(self.private_table.len() as u64).to_le_bytes(), &mut lens);
            for n in 0..num_nodes {
                let l = u64::from_le_bytes(lens[n * 8..(n + 1) * 8].try_into().unwrap());
                if l as usize != self.private_table.len() {
                    return Err(Error::OobMismatch(format!(
                        "private-broadcast table has {} entries here, {l} on node {n}",
                        self.private_table.len()
                    )));
                }
            }
            let mut map = vec![0u64; self.private_table.len() * num_nodes];
            for (id, (addr, _len)) in self.private_table.iter().enumerate() {
                let mut all = vec![0u8; 8 * num_nodes];
                self.oob.all_gather(&(*addr as u64).to_le_bytes(), &mut all);
                for n in 0..num_nodes {
                    map[id * num_nodes + n] =
                        u64::from_le_bytes(all[n * 8..(n + 1) * 8].try_into().unwrap());
                }
            }
            map
        };

        tracing::debug!(
            node = node_id,
            num_nodes,
            provider = %selection.info.fabric_attr.prov_name,
            delivery_complete = selection.have_delivery_complete,
            scalable_mem = mem.scalable(),
            "communication layer configured"
        );

        static NEXT_UID: std::sync::atomic::AtomicUsize = std::sync::atomic::AtomicUsize::new(0);

        let comm = Arc::new(Comm {
            uid: NEXT_UID.fetch_add(1, Ordering::Relaxed),
            node_id,
            num_nodes,
            env,
            oob: self.oob,
            tasking: self.tasking,
            fn_table: self.fn_table,
            have_delivery_complete: selection.have_delivery_complete,
            domain,
            ctx,
            mem,
            order,
            amo_valid,
            am,
            bar,
            private_table: self.private_table,
            priv_map,
            init_thread: std::thread::current().id(),
            finalized: AtomicBool::new(false),
        });

        am::start_am_handlers(&comm);

        // Don't let anyone proceed until every node's handler is up;
        // from here on the tree barrier and liveness probes are safe.
        comm.oob.barrier();
        if node_id == 0 && num_nodes > 1 {
            comm.enable_liveness_checks();
        }

        Ok(comm)
    }
}

/// One node's communication runtime.
pub struct Comm {
    /// Distinguishes runtime instances sharing one process, so that
    /// per-thread caches never leak across jobs.
    uid: usize,
    node_id: usize,
    num_nodes: usize,
    env: CommEnv,
    oob: Arc<dyn OutOfBand>,
    tasking: Arc<dyn Tasking>,
    fn_table: Vec<ExecFn>,
    have_delivery_complete: bool,
    domain: fabric::Domain,
    ctx: CtxTab,
    mem: MemTab,
    order: OrderState,
    amo_valid: [bool; 6],
    am: am::AmState,
    bar: barrier::BarState,
    private_table: Vec<(usize, usize)>,
    priv_map: Vec<u64>,
    init_thread: ThreadId,
    finalized: AtomicBool,
}

// Accessors for the engine modules.
impl Comm {
    pub(crate) fn uid(&self) -> usize {
        self.uid
    }

    pub fn node_id(&self) -> usize {
        self.node_id
    }

    pub fn num_nodes(&self) -> usize {
        self.num_nodes
    }

    pub(crate) fn env(&self) -> &CommEnv {
        &self.env
    }

    pub(crate) fn ctx(&self) -> &CtxTab {
        &self.ctx
    }

    pub(crate) fn mem(&self) -> &MemTab {
        &self.mem
    }

    pub(crate) fn order(&self) -> &OrderState {
        &self.order
    }

    pub(crate) fn am(&self) -> &am::AmState {
        &self.am
    }

    pub(crate) fn bar(&self) -> &barrier::BarState {
        &self.bar
    }

    pub(crate) fn oob(&self) -> &dyn OutOfBand {
        self.oob.as_ref()
    }

    pub(crate) fn tasking(&self) -> &dyn Tasking {
        self.tasking.as_ref()
    }

    pub(crate) fn fn_table(&self) -> &[ExecFn] {
        &self.fn_table
    }

    pub(crate) fn have_delivery_complete(&self) -> bool {
        self.have_delivery_complete
    }

    pub(crate) fn amo_valid(&self) -> &[bool; 6] {
        &self.amo_valid
    }

    pub(crate) fn max_msg_size(&self) -> usize {
        self.domain.info().ep_attr.max_msg_size
    }

    pub(crate) fn inject_size(&self) -> usize {
        self.domain.info().tx_attr.inject_size
    }

    pub(crate) fn init_thread(&self) -> ThreadId {
        self.init_thread
    }
}

// RMA interface.
impl Comm {
    /// PUT `size` bytes from `src` into `raddr` on `node`. On return
    /// the transfer is ordered per the consistency model: later
    /// operations that must observe it will.
    ///
    /// # Safety
    /// `src` must be valid for `size` reads; `raddr` must be a valid
    /// object on `node` for `size` writes, not concurrently accessed
    /// non-atomically.
    pub unsafe fn put(&self, src: *const u8, node: usize, raddr: *mut u8, size: usize) {
        self.retire_delayed_am_done(false);
        assert!(!src.is_null() && !raddr.is_null());
        if size == 0 {
            return;
        }
        if node == self.node_id {
            // Safety: both sides local; ranges may overlap.
            unsafe { std::ptr::copy(src, raddr, size) };
            return;
        }
        unsafe { rma::put(self, src, node, raddr as usize, size) };
    }

    /// GET `size` bytes from `raddr` on `node` into `dst`. Complete on
    /// return.
    ///
    /// # Safety
    /// `dst` must be valid for `size` writes; `raddr` must be a valid
    /// object on `node` for `size` reads.
    pub unsafe fn get(&self, dst: *mut u8, node: usize, raddr: *const u8, size: usize) {
        self.retire_delayed_am_done(false);
        assert!(!dst.is_null() && !raddr.is_null());
        if size == 0 {
            return;
        }
        if node == self.node_id {
            unsafe { std::ptr::copy(raddr, dst, size) };
            return;
        }
        unsafe { rma::get(self, dst, node, raddr as usize, size) };
    }
}

// Active-message interface.
impl Comm {
    /// Run `fn_table[fid]` on `node` with `arg`, blocking until the
    /// body returns there.
    pub fn execute_on(&self, node: usize, fid: usize, arg: &[u8]) {
        assert_ne!(node, self.node_id, "local on-stmts never reach the comm layer");
        am_request_execute_on(self, node, fid, arg, false, true);
    }

    /// Run `fn_table[fid]` on `node` without waiting for the body.
    pub fn execute_on_nb(&self, node: usize, fid: usize, arg: &[u8]) {
        assert_ne!(node, self.node_id, "local on-stmts never reach the comm layer");
        am_request_execute_on(self, node, fid, arg, false, false);
    }

    /// Run a short, non-blocking-safe body inline on `node`'s AM
    /// handler, blocking until it returns.
    pub fn execute_on_fast(&self, node: usize, fid: usize, arg: &[u8]) {
        assert_ne!(node, self.node_id, "local on-stmts never reach the comm layer");
        am_request_execute_on(self, node, fid, arg, true, true);
    }

    /// PUT the local private-table entry `id` to its counterpart on
    /// every other node.
    ///
    /// # Safety
    /// Remote table entries must be valid per the builder contract.
    pub unsafe fn broadcast_private(&self, id: usize) {
        let (addr, len) = self.private_table[id];
        for n in 0..self.num_nodes {
            if n != self.node_id {
                let dst = self.priv_map[id * self.num_nodes + n] as usize;
                unsafe { rma::put(self, addr as *const u8, n, dst, len) };
            }
        }
    }
}

// Task lifecycle hooks.
impl Comm {
    /// Called when a task is created: pending delayed completions and
    /// PUT visibility must not leak into the new task.
    pub fn task_create(&self) {
        self.retire_delayed_am_done(false);
        self.wait_for_puts_vis_all_nodes(None, false);
    }

    /// Called when a task ends: batch buffers drain and free, delayed
    /// completions retire, outstanding PUTs become visible.
    pub fn task_end(&self) {
        self.task_local_buff_end(BuffType::AMO_NF | BuffType::GET | BuffType::PUT);
        self.retire_delayed_am_done(true);
        self.wait_for_puts_vis_all_nodes(None, true);
    }

    /// Run `f` bracketed by the task lifecycle hooks.
    pub fn run_task(&self, f: impl FnOnce()) {
        self.task_create();
        f();
        self.task_end();
    }
}

// Shutdown.
impl Comm {
    /// Tear the job down. Node 0 tells every other node to shut down;
    /// the others wait to hear it. Collective; call once per node,
    /// after which only `Drop` may touch the runtime.
    pub fn finalize(&self) {
        if self.finalized.swap(true, Ordering::AcqRel) {
            return;
        }

        if self.num_nodes > 1 {
            if self.node_id == 0 {
                for n in 1..self.num_nodes {
                    am_request_shutdown(self, n);
                }
            } else {
                self.wait_for_shutdown();
            }
            self.barrier();
        }

        am::stop_am_handlers(self);
        self.oob.barrier();
        tracing::debug!(node = self.node_id, "communication layer shut down");
    }
}
