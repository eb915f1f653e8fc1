//! In-process provider: a cluster of fabric nodes inside one OS process.
//!
//! Every node is a handle onto shared cluster state. RMA and atomic
//! verbs execute synchronously in the initiating thread against the
//! target node's exposed memory, messages are deposited directly into
//! the target's posted multi-receive buffer, and completions are queued
//! on the initiator's completion object before the verb returns. The
//! provider therefore always behaves at least as strongly as whatever
//! completion level and orderings it advertises.
//!
//! The advertised capabilities are configurable so that callers which
//! adapt to weaker providers (message-order-only completion, no native
//! atomics, small `max_msg_size`) can be exercised against this one.

use std::io;
use std::sync::atomic::{
    AtomicI32, AtomicI64, AtomicU32, AtomicU64, Ordering,
};
use std::sync::{Arc, Mutex};

use crate::cq::{EventQueue, RxEntry, RxFlags, RxItem};
use crate::info::{Caps, Hints, Info, MrMode, MsgOrder, OpFlags, Progress};

/// Multi-receive deposits are aligned to this many bytes.
const DEPOSIT_ALIGN: usize = 8;

/// Cluster-wide configuration, fixed at launch.
#[derive(Debug, Clone)]
pub struct ClusterConfig {
    /// Number of nodes in the cluster.
    pub num_nodes: usize,
    /// Provider name stack reported in `Info`, e.g. `"inproc"`.
    pub prov_name: String,
    /// Whether delivery-complete may be advertised.
    pub delivery_complete: bool,
    /// Message orderings that may be advertised.
    pub msg_order: MsgOrder,
    /// Whether native atomics may be advertised.
    pub native_atomics: bool,
    /// Registration modes this provider requires of its callers.
    /// Empty means scalable registration.
    pub mr_mode: MrMode,
    /// Largest single transfer accepted.
    pub max_msg_size: usize,
    /// Largest inject accepted.
    pub inject_size: usize,
    /// Transmit contexts available on a scalable endpoint.
    pub max_ep_tx_ctx: usize,
    /// Regular endpoints available per domain.
    pub ep_cnt: usize,
    /// Whether poll/wait sets are supported.
    pub wait_sets: bool,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            num_nodes: 1,
            prov_name: "inproc".to_string(),
            delivery_complete: true,
            msg_order: MsgOrder::RAW | MsgOrder::WAW | MsgOrder::SAW | MsgOrder::SAS,
            native_atomics: true,
            mr_mode: MrMode::empty(),
            max_msg_size: 1 << 30,
            inject_size: 1 << 10,
            max_ep_tx_ctx: 16,
            ep_cnt: 64,
            wait_sets: true,
        }
    }
}

/// Per-node operation counters, readable by tests and diagnostics.
#[derive(Debug, Default)]
pub(crate) struct Stats {
    pub rma_writes: AtomicU64,
    pub rma_reads: AtomicU64,
    pub amos: AtomicU64,
    pub sends: AtomicU64,
    pub injects: AtomicU64,
}

/// Snapshot of a node's operation counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StatsSnapshot {
    /// RMA writes initiated by this node.
    pub rma_writes: u64,
    /// RMA reads initiated by this node.
    pub rma_reads: u64,
    /// Atomic operations initiated by this node.
    pub amos: u64,
    /// Messages sent (with completion) by this node.
    pub sends: u64,
    /// Messages and writes injected (no completion) by this node.
    pub injects: u64,
}

/// One exposed memory region.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Exposure {
    pub key: u64,
    pub base: usize,
    pub len: usize,
}

/// One posted multi-receive buffer.
struct Posted {
    base: usize,
    len: usize,
    used: usize,
}

/// Multi-receive bookkeeping for one receive endpoint.
struct MultiRecv {
    posted: std::collections::VecDeque<Posted>,
    min_multi_recv: usize,
}

/// Shared state of one receive endpoint.
pub(crate) struct RxEpShared {
    pub(crate) cq: Arc<EventQueue<RxItem>>,
    mr: Mutex<MultiRecv>,
}

impl RxEpShared {
    pub(crate) fn new(cq: Arc<EventQueue<RxItem>>) -> Arc<Self> {
        Arc::new(Self {
            cq,
            mr: Mutex::new(MultiRecv {
                posted: std::collections::VecDeque::new(),
                min_multi_recv: 0,
            }),
        })
    }

    pub(crate) fn set_min_multi_recv(&self, sz: usize) {
        self.mr.lock().unwrap().min_multi_recv = sz;
    }

    pub(crate) fn post(&self, base: usize, len: usize) {
        self.mr.lock().unwrap().posted.push_back(Posted {
            base,
            len,
            used: 0,
        });
    }

    /// Copy `bytes` into the currently posted buffer and queue a
    /// receive completion. Fails with `WouldBlock` when no posted
    /// buffer has room, so the sender can drive progress and retry.
    pub(crate) fn deposit(&self, bytes: &[u8]) -> io::Result<()> {
        let need = (bytes.len() + DEPOSIT_ALIGN - 1) & !(DEPOSIT_ALIGN - 1);
        let mut mr = self.mr.lock().unwrap();
        loop {
            let min_mr = mr.min_multi_recv;
            let Some(front) = mr.posted.front_mut() else {
                return Err(io::ErrorKind::WouldBlock.into());
            };
            let avail = front.len - front.used;
            if avail >= need {
                let dst = front.base + front.used;
                // Safety: the posted buffer is owned by the consumer for
                // the lifetime of the posting and covers [base, base+len);
                // `used + need <= len` was just checked.
                unsafe {
                    std::ptr::copy_nonoverlapping(
                        bytes.as_ptr(),
                        dst as *mut u8,
                        bytes.len(),
                    );
                }
                front.used += need;
                let mut flags = RxFlags::RECV;
                if front.len - front.used < min_mr {
                    flags |= RxFlags::MULTI_RECV;
                    mr.posted.pop_front();
                }
                self.cq.push(RxItem::Entry(RxEntry {
                    flags,
                    buf: dst,
                    len: bytes.len(),
                }));
                return Ok(());
            }
            if front.used == 0 {
                // The message can never fit this buffer.
                let buf_len = front.len;
                mr.posted.pop_front();
                self.cq.push(RxItem::Truncated {
                    msg_len: bytes.len(),
                    buf_len,
                });
                return Ok(());
            }
            // Front buffer is short on space; release it and move on.
            front.used = front.len;
            mr.posted.pop_front();
            self.cq.push(RxItem::Entry(RxEntry {
                flags: RxFlags::MULTI_RECV,
                buf: 0,
                len: 0,
            }));
        }
    }
}

/// Shared state of one node.
pub(crate) struct NodeShared {
    pub(crate) exposures: Mutex<Vec<Exposure>>,
    pub(crate) next_key: AtomicU64,
    pub(crate) rx_eps: Mutex<Vec<Arc<RxEpShared>>>,
    pub(crate) stats: Stats,
}

/// Shared state of the whole cluster.
pub(crate) struct ClusterShared {
    pub(crate) config: ClusterConfig,
    pub(crate) nodes: Vec<NodeShared>,
}

/// Launch a cluster and hand out one `Node` per member.
pub struct Cluster;

impl Cluster {
    pub fn launch(config: ClusterConfig) -> Vec<Node> {
        let nodes = (0..config.num_nodes)
            .map(|_| NodeShared {
                exposures: Mutex::new(Vec::new()),
                next_key: AtomicU64::new(1),
                rx_eps: Mutex::new(Vec::new()),
                stats: Stats::default(),
            })
            .collect();
        let cl = Arc::new(ClusterShared { config, nodes });
        (0..cl.config.num_nodes as u32)
            .map(|id| Node {
                id,
                cl: Arc::clone(&cl),
            })
            .collect()
    }
}

/// Handle onto one cluster member. Cheap to clone.
#[derive(Clone)]
pub struct Node {
    pub(crate) id: u32,
    pub(crate) cl: Arc<ClusterShared>,
}

impl std::fmt::Debug for Node {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Node")
            .field("id", &self.id)
            .field("num_nodes", &self.cl.config.num_nodes)
            .finish()
    }
}

impl Node {
    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn num_nodes(&self) -> usize {
        self.cl.config.num_nodes
    }

    pub(crate) fn shared(&self) -> &NodeShared {
        &self.cl.nodes[self.id as usize]
    }

    pub(crate) fn peer(&self, id: u32) -> &NodeShared {
        &self.cl.nodes[id as usize]
    }

    /// Snapshot this node's operation counters.
    pub fn stats(&self) -> StatsSnapshot {
        let s = &self.shared().stats;
        StatsSnapshot {
            rma_writes: s.rma_writes.load(Ordering::Relaxed),
            rma_reads: s.rma_reads.load(Ordering::Relaxed),
            amos: s.amos.load(Ordering::Relaxed),
            sends: s.sends.load(Ordering::Relaxed),
            injects: s.injects.load(Ordering::Relaxed),
        }
    }

    pub(crate) fn getinfo(&self, hints: &Hints) -> Vec<Info> {
        let cfg = &self.cl.config;

        let mut supported = Caps::MSG
            | Caps::MULTI_RECV
            | Caps::RMA
            | Caps::LOCAL_COMM
            | Caps::REMOTE_COMM;
        if cfg.native_atomics {
            supported |= Caps::ATOMIC;
        }
        if !supported.contains(hints.caps) {
            return Vec::new();
        }

        let want_dc = hints.tx_attr.op_flags.contains(OpFlags::DELIVERY_COMPLETE);
        if want_dc && !cfg.delivery_complete {
            return Vec::new();
        }
        if !cfg.msg_order.contains(hints.tx_attr.msg_order)
            || !cfg.msg_order.contains(hints.rx_attr.msg_order)
        {
            return Vec::new();
        }
        // The caller must be able to cope with every mode bit this
        // provider requires.
        if !hints.domain_attr.mr_mode.contains(cfg.mr_mode) {
            return Vec::new();
        }

        let mut tx_attr = hints.tx_attr.clone();
        tx_attr.op_flags = OpFlags::COMPLETION
            | if want_dc {
                OpFlags::DELIVERY_COMPLETE
            } else {
                OpFlags::empty()
            };
        tx_attr.inject_size = cfg.inject_size;

        let mut domain_attr = hints.domain_attr.clone();
        domain_attr.mr_mode = cfg.mr_mode;
        domain_attr.max_ep_tx_ctx = cfg.max_ep_tx_ctx;
        domain_attr.ep_cnt = cfg.ep_cnt;
        domain_attr.cntr_cnt = 0;
        // Verbs execute in the initiator's thread, so transfers finish
        // without anyone polling.
        domain_attr.data_progress = Progress::Auto;

        let mut ep_attr = hints.ep_attr.clone();
        ep_attr.max_msg_size = cfg.max_msg_size;

        vec![Info {
            caps: hints.caps,
            tx_attr,
            rx_attr: hints.rx_attr.clone(),
            ep_attr,
            domain_attr,
            fabric_attr: crate::info::FabricAttr {
                prov_name: cfg.prov_name.clone(),
            },
            node: self.clone(),
        }]
    }
}

impl NodeShared {
    /// Translate `(key, offset, len)` into a local virtual address, or
    /// fail if no exposure covers the range.
    pub(crate) fn resolve(
        &self,
        virt_addr_keyed: bool,
        key: u64,
        off: u64,
        len: usize,
    ) -> io::Result<usize> {
        let exposures = self.exposures.lock().unwrap();
        for e in exposures.iter() {
            if e.key != key {
                continue;
            }
            let addr = if virt_addr_keyed || e.base == 0 {
                off as usize
            } else {
                e.base + off as usize
            };
            let rel = addr.wrapping_sub(e.base);
            if addr >= e.base && rel <= e.len && e.len - rel >= len {
                return Ok(addr);
            }
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("rma range [{off:#x}, +{len:#x}) outside region key {key}"),
            ));
        }
        Err(io::Error::new(
            io::ErrorKind::NotFound,
            format!("no memory region with key {key}"),
        ))
    }
}

// =============================================================================
// Atomic execution
// =============================================================================

/// Atomic operation kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AmoOp {
    Sum,
    Bor,
    Band,
    Bxor,
    Write,
    Read,
    Cswap,
}

/// Atomic operand datatypes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum AmoDt {
    I32,
    U32,
    I64,
    U64,
    F32,
    F64,
}

impl AmoDt {
    pub fn size(self) -> usize {
        match self {
            AmoDt::I32 | AmoDt::U32 | AmoDt::F32 => 4,
            AmoDt::I64 | AmoDt::U64 | AmoDt::F64 => 8,
        }
    }
}

/// Execute an atomic op on a local address using host atomics.
///
/// `opnd1`/`opnd2`/`result` are little-endian datum images, 8 bytes
/// each with the low `dt.size()` bytes significant. Both the native
/// network path and the CPU fallback path funnel through host atomics,
/// so mixed-path operations on one object linearise.
///
/// # Safety
/// `obj` must be a valid, suitably aligned address of `dt.size()`
/// bytes that is only ever accessed atomically.
pub(crate) unsafe fn execute_amo(
    obj: usize,
    op: AmoOp,
    dt: AmoDt,
    opnd1: [u8; 8],
    opnd2: [u8; 8],
    result: Option<&mut [u8; 8]>,
) {
    macro_rules! int_amo {
        ($atomic:ty, $prim:ty) => {{
            let a = unsafe { <$atomic>::from_ptr(obj as *mut $prim) };
            let o1 = <$prim>::from_le_bytes(opnd1[..dt.size()].try_into().unwrap());
            let old: $prim = match op {
                AmoOp::Sum => a.fetch_add(o1, Ordering::AcqRel),
                AmoOp::Bor => a.fetch_or(o1, Ordering::AcqRel),
                AmoOp::Band => a.fetch_and(o1, Ordering::AcqRel),
                AmoOp::Bxor => a.fetch_xor(o1, Ordering::AcqRel),
                AmoOp::Write => {
                    if result.is_some() {
                        a.swap(o1, Ordering::AcqRel)
                    } else {
                        a.store(o1, Ordering::Release);
                        0
                    }
                }
                AmoOp::Read => a.load(Ordering::Acquire),
                AmoOp::Cswap => {
                    let o2 =
                        <$prim>::from_le_bytes(opnd2[..dt.size()].try_into().unwrap());
                    match a.compare_exchange(o1, o2, Ordering::AcqRel, Ordering::Acquire)
                    {
                        Ok(v) => v,
                        Err(v) => v,
                    }
                }
            };
            if let Some(res) = result {
                res[..dt.size()].copy_from_slice(&old.to_le_bytes());
            }
        }};
    }

    macro_rules! float_amo {
        ($bits_atomic:ty, $bits:ty, $float:ty) => {{
            let a = unsafe { <$bits_atomic>::from_ptr(obj as *mut $bits) };
            let o1 = <$float>::from_le_bytes(opnd1[..dt.size()].try_into().unwrap());
            let old_bits: $bits = match op {
                // No integer identity for float addition: CAS loop on
                // the bit pattern.
                AmoOp::Sum => {
                    let mut cur = a.load(Ordering::Acquire);
                    loop {
                        let new = (<$float>::from_bits(cur) + o1).to_bits();
                        match a.compare_exchange_weak(
                            cur,
                            new,
                            Ordering::AcqRel,
                            Ordering::Acquire,
                        ) {
                            Ok(_) => break cur,
                            Err(v) => cur = v,
                        }
                    }
                }
                AmoOp::Write => {
                    if result.is_some() {
                        a.swap(o1.to_bits(), Ordering::AcqRel)
                    } else {
                        a.store(o1.to_bits(), Ordering::Release);
                        0
                    }
                }
                AmoOp::Read => a.load(Ordering::Acquire),
                AmoOp::Cswap => {
                    let o2 =
                        <$float>::from_le_bytes(opnd2[..dt.size()].try_into().unwrap());
                    match a.compare_exchange(
                        o1.to_bits(),
                        o2.to_bits(),
                        Ordering::AcqRel,
                        Ordering::Acquire,
                    ) {
                        Ok(v) => v,
                        Err(v) => v,
                    }
                }
                AmoOp::Bor | AmoOp::Band | AmoOp::Bxor => {
                    unreachable!("bitwise atomic on float type")
                }
            };
            if let Some(res) = result {
                res[..dt.size()].copy_from_slice(&old_bits.to_le_bytes());
            }
        }};
    }

    match dt {
        AmoDt::I32 => int_amo!(AtomicI32, i32),
        AmoDt::U32 => int_amo!(AtomicU32, u32),
        AmoDt::I64 => int_amo!(AtomicI64, i64),
        AmoDt::U64 => int_amo!(AtomicU64, u64),
        AmoDt::F32 => float_amo!(AtomicU32, u32, f32),
        AmoDt::F64 => float_amo!(AtomicU64, u64, f64),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn deposit_and_swap() {
        let cq = EventQueue::new();
        let ep = RxEpShared::new(Arc::clone(&cq));
        let mut buf_a = vec![0u8; 64];
        let mut buf_b = vec![0u8; 64];
        ep.set_min_multi_recv(32);
        ep.post(buf_a.as_mut_ptr() as usize, buf_a.len());
        ep.post(buf_b.as_mut_ptr() as usize, buf_b.len());

        // First deposit fits; 24 bytes left after the second (aligned)
        // deposit, which is under min_multi_recv, so the buffer is
        // released with the completion.
        ep.deposit(&[1u8; 16]).unwrap();
        ep.deposit(&[2u8; 24]).unwrap();
        let e1 = match cq.pop().unwrap() {
            RxItem::Entry(e) => e,
            other => panic!("unexpected {other:?}"),
        };
        assert_eq!(e1.flags, RxFlags::RECV);
        assert_eq!(e1.len, 16);
        let e2 = match cq.pop().unwrap() {
            RxItem::Entry(e) => e,
            other => panic!("unexpected {other:?}"),
        };
        assert!(e2.flags.contains(RxFlags::MULTI_RECV));

        // Third deposit lands in the second buffer.
        ep.deposit(&[3u8; 8]).unwrap();
        let e3 = match cq.pop().unwrap() {
            RxItem::Entry(e) => e,
            other => panic!("unexpected {other:?}"),
        };
        assert_eq!(e3.len, 8);
        assert_eq!(unsafe { *(e3.buf as *const u8) }, 3);
        assert_eq!(buf_b[0], 3);
    }

    #[test]
    fn deposit_without_buffer_would_block() {
        let cq = EventQueue::new();
        let ep = RxEpShared::new(cq);
        let err = ep.deposit(&[0u8; 8]).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::WouldBlock);
    }

    #[test]
    fn amo_int_sum_and_cswap() {
        let mut x: u64 = 5;
        let obj = &mut x as *mut u64 as usize;
        let mut opnd1 = [0u8; 8];
        opnd1.copy_from_slice(&3u64.to_le_bytes());
        unsafe {
            execute_amo(obj, AmoOp::Sum, AmoDt::U64, opnd1, [0; 8], None);
        }
        assert_eq!(x, 8);

        let mut expected = [0u8; 8];
        expected.copy_from_slice(&8u64.to_le_bytes());
        let mut desired = [0u8; 8];
        desired.copy_from_slice(&11u64.to_le_bytes());
        let mut result = [0u8; 8];
        unsafe {
            execute_amo(
                obj,
                AmoOp::Cswap,
                AmoDt::U64,
                expected,
                desired,
                Some(&mut result),
            );
        }
        assert_eq!(u64::from_le_bytes(result), 8);
        assert_eq!(x, 11);
    }

    #[test]
    fn amo_float_sum() {
        let mut x: f64 = 1.5;
        let obj = &mut x as *mut f64 as usize;
        let mut opnd1 = [0u8; 8];
        opnd1.copy_from_slice(&2.25f64.to_le_bytes());
        let mut result = [0u8; 8];
        unsafe {
            execute_amo(obj, AmoOp::Sum, AmoDt::F64, opnd1, [0; 8], Some(&mut result));
        }
        assert_eq!(f64::from_le_bytes(result), 1.5);
        assert_eq!(x, 3.75);
    }
}
