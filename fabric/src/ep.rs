//! Transmit contexts and receive endpoints.
//!
//! A `TxContext` issues sends, RMA, and atomics toward addresses
//! resolved through an address vector. A `RxEndpoint` is a message
//! target backed by posted multi-receive buffers. RMA and atomics
//! address a node's exposed memory regions directly and never touch
//! its receive endpoints.

use std::io;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::cq::{Counter, EventQueue, TxCq, TxEntry};
use crate::domain::AvShared;
use crate::info::Caps;
use crate::inproc::{execute_amo, AmoDt, AmoOp, Node, RxEpShared};
use crate::FabricAddr;

/// Serializable endpoint name: node id plus endpoint index.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EpName(pub [u8; 8]);

impl EpName {
    pub(crate) fn new(node: u32, index: u32) -> Self {
        let mut b = [0u8; 8];
        b[..4].copy_from_slice(&node.to_le_bytes());
        b[4..].copy_from_slice(&index.to_le_bytes());
        Self(b)
    }

    pub(crate) fn decode(&self) -> (u32, u32) {
        (
            u32::from_le_bytes(self.0[..4].try_into().unwrap()),
            u32::from_le_bytes(self.0[4..].try_into().unwrap()),
        )
    }
}

/// Where a transmit context reports completions.
pub(crate) enum CmplSink {
    Cq(Arc<EventQueue<TxEntry>>),
    Cntr(Arc<AtomicU64>),
}

impl CmplSink {
    fn complete(&self, ctx: u64) {
        match self {
            CmplSink::Cq(q) => q.push(TxEntry { context: ctx }),
            CmplSink::Cntr(c) => {
                c.fetch_add(1, Ordering::AcqRel);
            }
        }
    }
}

/// One transmit context.
pub struct TxContext {
    pub(crate) node: Node,
    pub(crate) av: Arc<AvShared>,
    pub(crate) sink: CmplSink,
    pub(crate) caps: Caps,
    pub(crate) inject_size: usize,
    pub(crate) max_msg_size: usize,
}

impl TxContext {
    fn dest_node(&self, dest: FabricAddr) -> io::Result<(u32, u32)> {
        self.av.lookup(dest)
    }

    fn check_len(&self, len: usize) -> io::Result<()> {
        if len > self.max_msg_size {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("transfer of {len} exceeds max_msg_size {}", self.max_msg_size),
            ));
        }
        Ok(())
    }

    fn virt_addr_keyed(&self) -> bool {
        self.node
            .cl
            .config
            .mr_mode
            .contains(crate::info::MrMode::VIRT_ADDR)
    }

    /// Send a message to a receive endpoint, generating a completion.
    pub fn send(&self, buf: &[u8], dest: FabricAddr, ctx: u64) -> io::Result<()> {
        self.check_len(buf.len())?;
        let (node, ep) = self.dest_node(dest)?;
        let target = Arc::clone(&self.node.peer(node).rx_eps.lock().unwrap()[ep as usize]);
        target.deposit(buf)?;
        self.node.shared().stats.sends.fetch_add(1, Ordering::Relaxed);
        self.sink.complete(ctx);
        Ok(())
    }

    /// Send a small message with no completion event.
    pub fn inject(&self, buf: &[u8], dest: FabricAddr) -> io::Result<()> {
        if buf.len() > self.inject_size {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("inject of {} exceeds inject_size {}", buf.len(), self.inject_size),
            ));
        }
        let (node, ep) = self.dest_node(dest)?;
        let target = Arc::clone(&self.node.peer(node).rx_eps.lock().unwrap()[ep as usize]);
        target.deposit(buf)?;
        self.node.shared().stats.injects.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// RMA write into a target region, generating a completion.
    ///
    /// # Safety
    /// `src` must be valid for reads of `len` bytes. The target range,
    /// resolved from `(key, raddr)`, must stay valid for writes for
    /// the duration of the call (guaranteed when the region is
    /// registered and not concurrently unregistered).
    pub unsafe fn write(
        &self,
        src: *const u8,
        len: usize,
        dest: FabricAddr,
        raddr: u64,
        key: u64,
        ctx: u64,
    ) -> io::Result<()> {
        self.check_len(len)?;
        let (node, _) = self.dest_node(dest)?;
        let addr = self
            .node
            .peer(node)
            .resolve(self.virt_addr_keyed(), key, raddr, len)?;
        unsafe { std::ptr::copy(src, addr as *mut u8, len) };
        self.node.shared().stats.rma_writes.fetch_add(1, Ordering::Relaxed);
        self.sink.complete(ctx);
        Ok(())
    }

    /// RMA write with no completion event. Limited to `inject_size`.
    ///
    /// # Safety
    /// As for [`TxContext::write`].
    pub unsafe fn inject_write(
        &self,
        src: *const u8,
        len: usize,
        dest: FabricAddr,
        raddr: u64,
        key: u64,
    ) -> io::Result<()> {
        if len > self.inject_size {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("inject_write of {len} exceeds inject_size {}", self.inject_size),
            ));
        }
        let (node, _) = self.dest_node(dest)?;
        let addr = self
            .node
            .peer(node)
            .resolve(self.virt_addr_keyed(), key, raddr, len)?;
        unsafe { std::ptr::copy(src, addr as *mut u8, len) };
        self.node.shared().stats.injects.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// Batched RMA write; `more` marks all but the last of a batch.
    ///
    /// # Safety
    /// As for [`TxContext::write`].
    pub unsafe fn writemsg(
        &self,
        src: *const u8,
        len: usize,
        dest: FabricAddr,
        raddr: u64,
        key: u64,
        ctx: u64,
        more: bool,
    ) -> io::Result<()> {
        let _ = more; // submission hint only
        unsafe { self.write(src, len, dest, raddr, key, ctx) }
    }

    /// RMA read from a target region, generating a completion.
    ///
    /// # Safety
    /// `dst` must be valid for writes of `len` bytes; target range as
    /// for [`TxContext::write`].
    pub unsafe fn read(
        &self,
        dst: *mut u8,
        len: usize,
        dest: FabricAddr,
        raddr: u64,
        key: u64,
        ctx: u64,
    ) -> io::Result<()> {
        self.check_len(len)?;
        let (node, _) = self.dest_node(dest)?;
        let addr = self
            .node
            .peer(node)
            .resolve(self.virt_addr_keyed(), key, raddr, len)?;
        unsafe { std::ptr::copy(addr as *const u8, dst, len) };
        self.node.shared().stats.rma_reads.fetch_add(1, Ordering::Relaxed);
        self.sink.complete(ctx);
        Ok(())
    }

    /// Batched RMA read; `more` marks all but the last of a batch.
    ///
    /// # Safety
    /// As for [`TxContext::read`].
    pub unsafe fn readmsg(
        &self,
        dst: *mut u8,
        len: usize,
        dest: FabricAddr,
        raddr: u64,
        key: u64,
        ctx: u64,
        more: bool,
    ) -> io::Result<()> {
        let _ = more;
        unsafe { self.read(dst, len, dest, raddr, key, ctx) }
    }

    fn amo_common(
        &self,
        dest: FabricAddr,
        raddr: u64,
        key: u64,
        dt: AmoDt,
        op: AmoOp,
        opnd1: [u8; 8],
        opnd2: [u8; 8],
        result: Option<&mut [u8; 8]>,
        ctx: u64,
    ) -> io::Result<()> {
        if !self.caps.contains(Caps::ATOMIC) {
            return Err(io::Error::new(
                io::ErrorKind::Unsupported,
                "endpoint lacks atomic capability",
            ));
        }
        let (node, _) = self.dest_node(dest)?;
        let addr = self
            .node
            .peer(node)
            .resolve(self.virt_addr_keyed(), key, raddr, dt.size())?;
        // Safety: the resolved range is registered target memory of at
        // least dt.size() bytes; atomics require natural alignment,
        // which registered atomic objects provide.
        unsafe { execute_amo(addr, op, dt, opnd1, opnd2, result) };
        self.node.shared().stats.amos.fetch_add(1, Ordering::Relaxed);
        self.sink.complete(ctx);
        Ok(())
    }

    /// Non-fetching atomic.
    pub fn atomic(
        &self,
        op: AmoOp,
        dt: AmoDt,
        opnd1: [u8; 8],
        dest: FabricAddr,
        raddr: u64,
        key: u64,
        ctx: u64,
    ) -> io::Result<()> {
        self.amo_common(dest, raddr, key, dt, op, opnd1, [0; 8], None, ctx)
    }

    /// Batched non-fetching atomic; `more` marks all but the last.
    pub fn atomicmsg(
        &self,
        op: AmoOp,
        dt: AmoDt,
        opnd1: [u8; 8],
        dest: FabricAddr,
        raddr: u64,
        key: u64,
        ctx: u64,
        more: bool,
    ) -> io::Result<()> {
        let _ = more;
        self.atomic(op, dt, opnd1, dest, raddr, key, ctx)
    }

    /// Fetching atomic; the prior value lands in `result`.
    pub fn fetch_atomic(
        &self,
        op: AmoOp,
        dt: AmoDt,
        opnd1: [u8; 8],
        result: &mut [u8; 8],
        dest: FabricAddr,
        raddr: u64,
        key: u64,
        ctx: u64,
    ) -> io::Result<()> {
        self.amo_common(dest, raddr, key, dt, op, opnd1, [0; 8], Some(result), ctx)
    }

    /// Compare-and-swap; the prior value lands in `result`.
    pub fn compare_atomic(
        &self,
        dt: AmoDt,
        expected: [u8; 8],
        desired: [u8; 8],
        result: &mut [u8; 8],
        dest: FabricAddr,
        raddr: u64,
        key: u64,
        ctx: u64,
    ) -> io::Result<()> {
        self.amo_common(
            dest,
            raddr,
            key,
            dt,
            AmoOp::Cswap,
            expected,
            desired,
            Some(result),
            ctx,
        )
    }

    /// Whether the provider can perform `op` on `dt` natively.
    pub fn atomic_valid(&self, dt: AmoDt, op: AmoOp) -> bool {
        let _ = (dt, op);
        self.caps.contains(Caps::ATOMIC) && self.node.cl.config.native_atomics
    }

    /// Whether the fetching form of `op` on `dt` is available.
    pub fn fetch_atomic_valid(&self, dt: AmoDt, op: AmoOp) -> bool {
        self.atomic_valid(dt, op)
    }

    /// Whether the comparing form of `op` on `dt` is available.
    pub fn compare_atomic_valid(&self, dt: AmoDt, op: AmoOp) -> bool {
        self.atomic_valid(dt, op)
    }
}

/// Bind a counter to a transmit context at creation time by passing
/// one of these instead of a CQ.
pub enum TxCompletion<'a> {
    Cq(&'a TxCq),
    Cntr(&'a Counter),
}

/// One receive endpoint.
pub struct RxEndpoint {
    pub(crate) node: Node,
    pub(crate) sh: Arc<RxEpShared>,
    pub(crate) index: u32,
}

impl RxEndpoint {
    /// The endpoint's name, for insertion into peers' address vectors.
    pub fn name(&self) -> EpName {
        EpName::new(self.node.id, self.index)
    }

    /// Set the smallest remaining space at which a posted buffer is
    /// considered exhausted and released.
    pub fn set_min_multi_recv(&self, sz: usize) {
        self.sh.set_min_multi_recv(sz);
    }

    /// Post a multi-receive landing buffer.
    ///
    /// # Safety
    /// `buf` must stay valid for writes of `len` bytes until the
    /// buffer-released completion for it has been consumed.
    pub unsafe fn post_multi_recv(&self, buf: *mut u8, len: usize) -> io::Result<()> {
        self.sh.post(buf as usize, len);
        Ok(())
    }
}
