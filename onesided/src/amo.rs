//! The AMO engine: remote atomics with native, CPU, and AM paths.
//!
//! An operation goes over the network only when the provider handles
//! its datatype/operation family natively and the target address is
//! remotely accessible; otherwise it executes on a CPU at the owner
//! (directly when local, via an active message when not). Both paths
//! funnel into host atomics on the object, so they linearise against
//! each other.

use std::sync::atomic::{AtomicI32, AtomicI64, AtomicU32, AtomicU64, Ordering};

pub use fabric::{AmoDt, AmoOp};

use crate::ctx::CtxTab;
use crate::order::TxnTrk;
use crate::rma::{reserve_cq_room, ID_AMO_NF};
use crate::Comm;

/// A little-endian operand image; the low `dt.size()` bytes matter.
pub(crate) type Datum = [u8; 8];

pub(crate) fn dt_index(dt: AmoDt) -> usize {
    match dt {
        AmoDt::I32 => 0,
        AmoDt::U32 => 1,
        AmoDt::I64 => 2,
        AmoDt::U64 => 3,
        AmoDt::F32 => 4,
        AmoDt::F64 => 5,
    }
}

/// Probe the provider for every operation family the runtime may
/// request. A datatype is natively usable only if every probe passes.
pub(crate) fn probe_atomic_valid(ctx: &CtxTab) -> [bool; 6] {
    let tx = ctx.tx0();
    let mut valid = [false; 6];

    for dt in [AmoDt::I32, AmoDt::U32, AmoDt::I64, AmoDt::U64] {
        valid[dt_index(dt)] = tx.atomic_valid(dt, AmoOp::Sum)
            && tx.atomic_valid(dt, AmoOp::Bor)
            && tx.atomic_valid(dt, AmoOp::Band)
            && tx.atomic_valid(dt, AmoOp::Bxor)
            && tx.atomic_valid(dt, AmoOp::Write)
            && tx.fetch_atomic_valid(dt, AmoOp::Sum)
            && tx.fetch_atomic_valid(dt, AmoOp::Bor)
            && tx.fetch_atomic_valid(dt, AmoOp::Band)
            && tx.fetch_atomic_valid(dt, AmoOp::Bxor)
            && tx.fetch_atomic_valid(dt, AmoOp::Read)
            && tx.fetch_atomic_valid(dt, AmoOp::Write)
            && tx.compare_atomic_valid(dt, AmoOp::Cswap);
    }
    // For reals only sum, read, write, and cswap matter.
    for dt in [AmoDt::F32, AmoDt::F64] {
        valid[dt_index(dt)] = tx.atomic_valid(dt, AmoOp::Sum)
            && tx.atomic_valid(dt, AmoOp::Write)
            && tx.fetch_atomic_valid(dt, AmoOp::Sum)
            && tx.fetch_atomic_valid(dt, AmoOp::Read)
            && tx.fetch_atomic_valid(dt, AmoOp::Write)
            && tx.compare_atomic_valid(dt, AmoOp::Cswap);
    }
    valid
}

// =============================================================================
// CPU execution
// =============================================================================

/// Execute an AMO on a local object with host atomic primitives.
///
/// # Safety
/// `obj` must be a valid, naturally aligned object of `dt.size()`
/// bytes that is only accessed atomically; `result`, when present,
/// must be valid for `dt.size()` byte writes.
pub(crate) unsafe fn cpu_amo(
    obj: *mut u8,
    opnd1: Option<Datum>,
    opnd2: Option<Datum>,
    result: Option<*mut u8>,
    op: AmoOp,
    dt: AmoDt,
) {
    let o1 = opnd1.unwrap_or_default();
    let o2 = opnd2.unwrap_or_default();

    macro_rules! store_result {
        ($val:expr, $prim:ty) => {
            if let Some(res) = result {
                let bytes = <$prim>::to_le_bytes($val);
                unsafe { std::ptr::copy_nonoverlapping(bytes.as_ptr(), res, dt.size()) };
            }
        };
    }

    macro_rules! int_amo {
        ($atomic:ty, $prim:ty) => {{
            // Safety: caller guarantees alignment and atomic-only use.
            let a = unsafe { <$atomic>::from_ptr(obj as *mut $prim) };
            let v1 = <$prim>::from_le_bytes(o1[..dt.size()].try_into().unwrap());
            let old: $prim = match op {
                AmoOp::Write => {
                    if result.is_some() {
                        a.swap(v1, Ordering::AcqRel)
                    } else {
                        a.store(v1, Ordering::Release);
                        0
                    }
                }
                AmoOp::Read => a.load(Ordering::Acquire),
                AmoOp::Cswap => {
                    let v2 = <$prim>::from_le_bytes(o2[..dt.size()].try_into().unwrap());
                    match a.compare_exchange(v1, v2, Ordering::AcqRel, Ordering::Acquire) {
                        Ok(v) | Err(v) => v,
                    }
                }
                AmoOp::Band => a.fetch_and(v1, Ordering::AcqRel),
                AmoOp::Bor => a.fetch_or(v1, Ordering::AcqRel),
                AmoOp::Bxor => a.fetch_xor(v1, Ordering::AcqRel),
                AmoOp::Sum => a.fetch_add(v1, Ordering::AcqRel),
            };
            store_result!(old, $prim);
        }};
    }

    macro_rules! float_amo {
        ($atomic:ty, $bits:ty, $float:ty) => {{
            // Safety: as above; float objects are accessed through
            // their same-sized integer bit patterns.
            let a = unsafe { <$atomic>::from_ptr(obj as *mut $bits) };
            let v1 = <$float>::from_le_bytes(o1[..dt.size()].try_into().unwrap());
            let old_bits: $bits = match op {
                AmoOp::Write => {
                    if result.is_some() {
                        a.swap(v1.to_bits(), Ordering::AcqRel)
                    } else {
                        a.store(v1.to_bits(), Ordering::Release);
                        0
                    }
                }
                AmoOp::Read => a.load(Ordering::Acquire),
                AmoOp::Cswap => {
                    let v2 = <$float>::from_le_bytes(o2[..dt.size()].try_into().unwrap());
                    match a.compare_exchange(
                        v1.to_bits(),
                        v2.to_bits(),
                        Ordering::AcqRel,
                        Ordering::Acquire,
                    ) {
                        Ok(v) | Err(v) => v,
                    }
                }
                // There is no integer fetch-add identity for float
                // addition; loop on compare-exchange instead.
                AmoOp::Sum => {
                    let mut cur = a.load(Ordering::Acquire);
                    loop {
                        let new = (<$float>::from_bits(cur) + v1).to_bits();
                        match a.compare_exchange_weak(
                            cur,
                            new,
                            Ordering::AcqRel,
                            Ordering::Acquire,
                        ) {
                            Ok(_) => break cur,
                            Err(seen) => cur = seen,
                        }
                    }
                }
                AmoOp::Band | AmoOp::Bor | AmoOp::Bxor => {
                    unreachable!("bitwise AMO on a real type")
                }
            };
            store_result!(old_bits, $bits);
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

// =============================================================================
// Dispatch
// =============================================================================

impl Comm {
    pub(crate) fn atomic_valid(&self, dt: AmoDt) -> bool {
        self.amo_valid()[dt_index(dt)]
    }
}

/// Route one AMO to the native network path, the local CPU, or a
/// remote CPU via active message.
pub(crate) unsafe fn do_amo(
    comm: &Comm,
    node: usize,
    obj: usize,
    opnd1: Option<Datum>,
    opnd2: Option<Datum>,
    result: Option<*mut u8>,
    op: AmoOp,
    dt: AmoDt,
) {
    if comm.num_nodes() <= 1 {
        unsafe { cpu_amo(obj as *mut u8, opnd1, opnd2, result, op, dt) };
        return;
    }

    comm.retire_delayed_am_done(false);

    let size = dt.size();
    if !comm.atomic_valid(dt) || comm.mem().remote_key(node, obj, size).is_none() {
        // The network can't do this one; run it on a CPU at the owner.
        if node == comm.node_id() {
            if op != AmoOp::Read {
                comm.wait_for_puts_vis_all_nodes(None, false);
            }
            unsafe { cpu_amo(obj as *mut u8, opnd1, opnd2, result, op, dt) };
        } else {
            crate::am::am_request_amo(comm, node, obj, opnd1, opnd2, result, op, dt);
        }
    } else {
        unsafe { ofi_amo(comm, node, obj, opnd1, opnd2, result, op, dt) };
    }
}

/// Native network AMO.
unsafe fn ofi_amo(
    comm: &Comm,
    node: usize,
    obj: usize,
    opnd1: Option<Datum>,
    opnd2: Option<Datum>,
    result: Option<*mut u8>,
    op: AmoOp,
    dt: AmoDt,
) {
    let size = dt.size();
    let (key, off) = comm.mem().remote_key(node, obj, size).unwrap();

    // Stage the result in registered scratch when the caller's buffer
    // is not usable as a transfer target.
    let mut res_bounce = None;
    let res_ptr = match result {
        Some(p) if !comm.mem().local_covered(p as usize, size) => {
            let b = comm.mem().alloc_bounce(size);
            let ptr = b.as_mut_ptr();
            res_bounce = Some(b);
            Some(ptr)
        }
        other => other,
    };

    let tci = comm.tci_alloc();

    // Anything that writes must order after our outstanding PUTs.
    if op != AmoOp::Read {
        comm.wait_for_puts_vis_all_nodes(Some(&tci), false);
    }

    let st = tci.st();
    let (ctx, flag) = if st.cq.is_some() {
        let (c, f) = st.trk_done();
        (c, Some(f))
    } else {
        (TxnTrk::Id(ID_AMO_NF).encode(), None)
    };

    let mut res_datum: Datum = [0; 8];
    let dest = comm.ctx().rx_rma_addr(node);
    // Fetching READ has no operand; pass a zeroed one regardless, for
    // providers that fault on a missing operand buffer.
    let o1 = opnd1.unwrap_or_default();

    let r = if op == AmoOp::Cswap {
        st.tx
            .compare_atomic(dt, o1, opnd2.unwrap(), &mut res_datum, dest, off, key, ctx)
    } else if res_ptr.is_some() {
        st.tx
            .fetch_atomic(op, dt, o1, &mut res_datum, dest, off, key, ctx)
    } else {
        st.tx.atomic(op, dt, o1, dest, off, key, ctx)
    };
    if let Err(e) = r {
        comm.fatal(e);
    }
    st.txns_out += 1;
    st.txns_sent += 1;

    comm.wait_txn_complete(st, flag.as_ref());

    if let Some(p) = res_ptr {
        // Safety: `p` is valid for `size` writes per the caller.
        unsafe { std::ptr::copy_nonoverlapping(res_datum.as_ptr(), p, size) };
        if res_bounce.is_some() {
            if let Some(orig) = result {
                unsafe { std::ptr::copy_nonoverlapping(p, orig, size) };
            }
        }
    }
}

/// One buffered non-fetching AMO.
#[derive(Debug, Clone, Copy)]
pub(crate) struct AmoNfVEntry {
    pub opnd1: Datum,
    pub node: usize,
    pub key: u64,
    pub off: u64,
    pub op: AmoOp,
    pub dt: AmoDt,
}

/// Submit a batch of non-fetching AMOs as one chained group. The
/// batch completes collectively; nothing waits per operation.
pub(crate) fn amo_nf_v(comm: &Comm, entries: &[AmoNfVEntry]) {
    if entries.is_empty() {
        return;
    }
    tracing::trace!(len = entries.len(), "vectorised non-fetching AMO");

    let tci = comm.tci_alloc();
    let st = tci.st();
    reserve_cq_room(comm, st, entries.len());

    for (vi, e) in entries.iter().enumerate() {
        let more = vi < entries.len() - 1;
        comm.ride_out_eagain(st, |s| {
            s.tx.atomicmsg(
                e.op,
                e.dt,
                e.opnd1,
                comm.ctx().rx_rma_addr(e.node),
                e.off,
                e.key,
                TxnTrk::Id(ID_AMO_NF).encode(),
                more,
            )
        });
        st.txns_out += 1;
        st.txns_sent += 1;
    }
}

// =============================================================================
// Typed interface
// =============================================================================

mod sealed {
    pub trait Sealed {}
}

/// Types eligible for remote atomic operations.
pub trait AmoValue: Copy + sealed::Sealed {
    #[doc(hidden)]
    const DT: AmoDt;
    #[doc(hidden)]
    fn to_datum(self) -> Datum;
    #[doc(hidden)]
    fn from_datum(d: Datum) -> Self;
    #[doc(hidden)]
    fn negate_for_sub(self) -> Self;
}

/// Integer types, additionally eligible for bitwise operations.
pub trait AmoInt: AmoValue {}

macro_rules! impl_amo_value {
    ($t:ty, $dt:expr, $neg:expr) => {
        impl sealed::Sealed for $t {}
        impl AmoValue for $t {
            const DT: AmoDt = $dt;
            fn to_datum(self) -> Datum {
                let mut d = Datum::default();
                d[..std::mem::size_of::<$t>()].copy_from_slice(&self.to_le_bytes());
                d
            }
            fn from_datum(d: Datum) -> Self {
                <$t>::from_le_bytes(d[..std::mem::size_of::<$t>()].try_into().unwrap())
            }
            fn negate_for_sub(self) -> Self {
                ($neg)(self)
            }
        }
    };
}

// Subtraction becomes addition of the negated operand. Negating the
// extreme negative value leaves it unchanged: two's-complement
// overflow of the sign is treated as a no-op.
impl_amo_value!(i32, AmoDt::I32, |x: i32| if x == i32::MIN { x } else { -x });
impl_amo_value!(i64, AmoDt::I64, |x: i64| if x == i64::MIN { x } else { -x });
impl_amo_value!(u32, AmoDt::U32, |x: u32| x.wrapping_neg());
impl_amo_value!(u64, AmoDt::U64, |x: u64| x.wrapping_neg());
impl_amo_value!(f32, AmoDt::F32, |x: f32| -x);
impl_amo_value!(f64, AmoDt::F64, |x: f64| -x);

impl AmoInt for i32 {}
impl AmoInt for u32 {}
impl AmoInt for i64 {}
impl AmoInt for u64 {}

macro_rules! fetch_into {
    ($comm:expr, $node:expr, $obj:expr, $o1:expr, $o2:expr, $op:expr, $t:ty) => {{
        let mut res: Datum = [0; 8];
        unsafe {
            do_amo(
                $comm,
                $node,
                $obj as usize,
                $o1,
                $o2,
                Some(res.as_mut_ptr()),
                $op,
                <$t>::DT,
            )
        };
        <$t>::from_datum(res)
    }};
}

impl Comm {
    /// Atomically store `desired` into `obj` on `node`.
    ///
    /// # Safety
    /// `obj` must be a valid, naturally aligned `T` on `node` that is
    /// only accessed atomically. The same holds for every other `amo_*`
    /// method.
    pub unsafe fn amo_write<T: AmoValue>(&self, desired: T, node: usize, obj: *mut T) {
        unsafe {
            do_amo(
                self,
                node,
                obj as usize,
                Some(desired.to_datum()),
                None,
                None,
                AmoOp::Write,
                T::DT,
            )
        };
    }

    /// Atomically read `obj` on `node`.
    ///
    /// # Safety
    /// See [`Comm::amo_write`].
    pub unsafe fn amo_read<T: AmoValue>(&self, node: usize, obj: *mut T) -> T {
        fetch_into!(self, node, obj, None, None, AmoOp::Read, T)
    }

    /// Atomically exchange `obj` on `node` with `desired`.
    ///
    /// # Safety
    /// See [`Comm::amo_write`].
    pub unsafe fn amo_xchg<T: AmoValue>(&self, desired: T, node: usize, obj: *mut T) -> T {
        fetch_into!(self, node, obj, Some(desired.to_datum()), None, AmoOp::Write, T)
    }

    /// Atomically compare-and-swap; returns the prior value, which
    /// equals `expected` iff the swap happened.
    ///
    /// # Safety
    /// See [`Comm::amo_write`].
    pub unsafe fn amo_cmpxchg<T: AmoValue>(
        &self,
        expected: T,
        desired: T,
        node: usize,
        obj: *mut T,
    ) -> T {
        fetch_into!(
            self,
            node,
            obj,
            Some(expected.to_datum()),
            Some(desired.to_datum()),
            AmoOp::Cswap,
            T
        )
    }

    /// Atomic add.
    ///
    /// # Safety
    /// See [`Comm::amo_write`].
    pub unsafe fn amo_add<T: AmoValue>(&self, operand: T, node: usize, obj: *mut T) {
        unsafe {
            do_amo(
                self,
                node,
                obj as usize,
                Some(operand.to_datum()),
                None,
                None,
                AmoOp::Sum,
                T::DT,
            )
        };
    }

    /// Atomic fetch-and-add; returns the prior value.
    ///
    /// # Safety
    /// See [`Comm::amo_write`].
    pub unsafe fn amo_fetch_add<T: AmoValue>(&self, operand: T, node: usize, obj: *mut T) -> T {
        fetch_into!(self, node, obj, Some(operand.to_datum()), None, AmoOp::Sum, T)
    }

    /// Atomic subtract.
    ///
    /// # Safety
    /// See [`Comm::amo_write`].
    pub unsafe fn amo_sub<T: AmoValue>(&self, operand: T, node: usize, obj: *mut T) {
        unsafe { self.amo_add(operand.negate_for_sub(), node, obj) };
    }

    /// Atomic fetch-and-subtract; returns the prior value.
    ///
    /// # Safety
    /// See [`Comm::amo_write`].
    pub unsafe fn amo_fetch_sub<T: AmoValue>(&self, operand: T, node: usize, obj: *mut T) -> T {
        unsafe { self.amo_fetch_add(operand.negate_for_sub(), node, obj) }
    }
}

macro_rules! bitwise_api {
    ($name:ident, $fetch_name:ident, $op:expr) => {
        impl Comm {
            /// Bitwise atomic.
            ///
            /// # Safety
            /// See [`Comm::amo_write`].
            pub unsafe fn $name<T: AmoInt>(&self, operand: T, node: usize, obj: *mut T) {
                unsafe {
                    do_amo(
                        self,
                        node,
                        obj as usize,
                        Some(operand.to_datum()),
                        None,
                        None,
                        $op,
                        T::DT,
                    )
                };
            }

            /// Fetching bitwise atomic; returns the prior value.
            ///
            /// # Safety
            /// See [`Comm::amo_write`].
            pub unsafe fn $fetch_name<T: AmoInt>(
                &self,
                operand: T,
                node: usize,
                obj: *mut T,
            ) -> T {
                fetch_into!(self, node, obj, Some(operand.to_datum()), None, $op, T)
            }
        }
    };
}

bitwise_api!(amo_and, amo_fetch_and, AmoOp::Band);
bitwise_api!(amo_or, amo_fetch_or, AmoOp::Bor);
bitwise_api!(amo_xor, amo_fetch_xor, AmoOp::Bxor);

#[cfg(test)]
mod tests {
    use super::*;

    unsafe fn run(obj: *mut u8, o1: Option<Datum>, o2: Option<Datum>, op: AmoOp, dt: AmoDt) -> Datum {
        let mut res: Datum = [0; 8];
        cpu_amo(obj, o1, o2, Some(res.as_mut_ptr()), op, dt);
        res
    }

    #[test]
    fn cpu_amo_add_zero_is_noop() {
        let mut x: u64 = 42;
        let res = unsafe {
            run(
                &mut x as *mut u64 as *mut u8,
                Some(0u64.to_datum()),
                None,
                AmoOp::Sum,
                AmoDt::U64,
            )
        };
        assert_eq!(u64::from_datum(res), 42);
        assert_eq!(x, 42);
    }

    #[test]
    fn cpu_amo_cswap_matches() {
        let mut x: u64 = 5;
        let res = unsafe {
            run(
                &mut x as *mut u64 as *mut u8,
                Some(5u64.to_datum()),
                Some(9u64.to_datum()),
                AmoOp::Cswap,
                AmoDt::U64,
            )
        };
        assert_eq!(u64::from_datum(res), 5);
        assert_eq!(x, 9);
    }

    #[test]
    fn cpu_amo_cswap_mismatch_leaves_object() {
        let mut x: i32 = -3;
        let res = unsafe {
            run(
                &mut x as *mut i32 as *mut u8,
                Some(1i32.to_datum()),
                Some(7i32.to_datum()),
                AmoOp::Cswap,
                AmoDt::I32,
            )
        };
        assert_eq!(i32::from_datum(res), -3);
        assert_eq!(x, -3);
    }

    #[test]
    fn cpu_amo_bitwise() {
        let mut x: u32 = 0b1100;
        unsafe {
            cpu_amo(
                &mut x as *mut u32 as *mut u8,
                Some(0b1010u32.to_datum()),
                None,
                None,
                AmoOp::Bxor,
                AmoDt::U32,
            )
        };
        assert_eq!(x, 0b0110);
    }

    #[test]
    fn cpu_amo_float_add() {
        let mut x: f64 = 0.5;
        let res = unsafe {
            run(
                &mut x as *mut f64 as *mut u8,
                Some(1.75f64.to_datum()),
                None,
                AmoOp::Sum,
                AmoDt::F64,
            )
        };
        assert_eq!(f64::from_datum(res), 0.5);
        assert_eq!(x, 2.25);
    }

    #[test]
    fn cpu_amo_write_and_exchange() {
        let mut x: u32 = 1;
        unsafe {
            cpu_amo(
                &mut x as *mut u32 as *mut u8,
                Some(2u32.to_datum()),
                None,
                None,
                AmoOp::Write,
                AmoDt::U32,
            )
        };
        assert_eq!(x, 2);
        let res = unsafe {
            run(
                &mut x as *mut u32 as *mut u8,
                Some(3u32.to_datum()),
                None,
                AmoOp::Write,
                AmoDt::U32,
            )
        };
        assert_eq!(u32::from_datum(res), 2);
        assert_eq!(x, 3);
    }

    #[test]
    fn negate_preserves_int_min() {
        assert_eq!(i32::MIN.negate_for_sub(), i32::MIN);
        assert_eq!(i64::MIN.negate_for_sub(), i64::MIN);
        assert_eq!(5i32.negate_for_sub(), -5);
        assert_eq!(3u32.negate_for_sub(), 3u32.wrapping_neg());
    }
}
