//! End-to-end tests for RMA, AMOs, and active messages on an
//! in-process cluster.

mod common;

use std::sync::atomic::{AtomicU64, Ordering};

use common::*;
use onesided::Comm;

// =============================================================================
// RMA
// =============================================================================

#[test]
fn put_get_round_trip() {
    run_job(JobConfig::new(4), |comm, ctx| {
        let me = comm.node_id();
        // Every node exposes a 128 KiB buffer.
        let mut target = vec![0u8; 128 << 10].into_boxed_slice();
        ctx.ex.publish(0, me, target.as_ptr() as u64);
        ctx.ex.sync();

        if me == 0 {
            // Bytewise equality across assorted sizes and alignments.
            for (i, &(size, align)) in
                [(1usize, 0usize), (3, 1), (8, 0), (13, 5), (256, 7), (1024, 0), (65536, 3)]
                    .iter()
                    .enumerate()
            {
                let peer = 1 + (i % 3);
                let raddr = ctx.ex.get(0, peer) as usize + 64 * i + align;
                let src: Vec<u8> = (0..size).map(|b| (b * 7 + i + 1) as u8).collect();
                let mut back = vec![0u8; size];
                unsafe {
                    comm.put(src.as_ptr(), peer, raddr as *mut u8, size);
                    comm.get(back.as_mut_ptr(), peer, raddr as *const u8, size);
                }
                assert_eq!(src, back, "size {size} align {align}");
            }
        }
        ctx.ex.sync();
        // Writes land in real peer memory, not just the echo path:
        // transfer 0 put a single 0x01 byte at node 1's buffer start.
        if me == 1 {
            assert_eq!(target[0], 1);
        }
        ctx.ex.sync();
        drop(target);
    });
}

#[test]
fn zero_size_and_self_rma() {
    run_job(JobConfig::new(2), |comm, ctx| {
        let me = comm.node_id();
        if me == 0 {
            let src = [1u8, 2, 3, 4];
            let mut dst = [0u8; 4];

            // Zero-size transfers return immediately, touching nothing.
            unsafe {
                comm.put(src.as_ptr(), 1, dst.as_mut_ptr(), 0);
                comm.get(dst.as_mut_ptr(), 1, src.as_ptr(), 0);
            }
            assert_eq!(dst, [0; 4]);

            // Self-directed RMA degenerates to a local move.
            unsafe {
                comm.put(src.as_ptr(), 0, dst.as_mut_ptr(), 4);
            }
            assert_eq!(dst, src);
        }
        ctx.ex.sync();
    });
}

#[test]
fn transfers_chunk_at_max_msg_size() {
    let mut cfg = JobConfig::new(2);
    cfg.cluster.max_msg_size = 4096;
    run_job(cfg, |comm, ctx| {
        let me = comm.node_id();
        let target = vec![0u8; 3 * 4096].into_boxed_slice();
        ctx.ex.publish(0, me, target.as_ptr() as u64);
        ctx.ex.sync();

        if me == 0 {
            let raddr = ctx.ex.get(0, 1) as usize;

            // Exactly max_msg_size: one transfer.
            let src: Vec<u8> = (0..4096).map(|b| b as u8).collect();
            let before = ctx.fab.stats().rma_writes;
            unsafe { comm.put(src.as_ptr(), 1, raddr as *mut u8, 4096) };
            assert_eq!(ctx.fab.stats().rma_writes - before, 1);

            // One byte more: two transfers, the second of size 1.
            let src2: Vec<u8> = (0..4097).map(|b| (b % 251) as u8).collect();
            let before = ctx.fab.stats().rma_writes;
            unsafe { comm.put(src2.as_ptr(), 1, raddr as *mut u8, 4097) };
            assert_eq!(ctx.fab.stats().rma_writes - before, 2);

            let mut back = vec![0u8; 4097];
            unsafe { comm.get(back.as_mut_ptr(), 1, raddr as *const u8, 4097) };
            assert_eq!(src2, back);
        }
        ctx.ex.sync();
        drop(target);
    });
}

// =============================================================================
// Execute-on
// =============================================================================

static EXEC_SUM: AtomicU64 = AtomicU64::new(0);

fn sum_payload(_comm: &Comm, arg: &[u8]) {
    let sum = arg.iter().fold(0u64, |a, &b| a.wrapping_add(b as u64));
    EXEC_SUM.store(sum | 1 << 63, Ordering::Release);
}

#[test]
fn execute_on_inline_blocking() {
    let mut cfg = JobConfig::new(2);
    cfg.fn_table = vec![sum_payload];
    run_job(cfg, |comm, ctx| {
        if comm.node_id() == 0 {
            let arg: Vec<u8> = (0..100u32).map(|b| b as u8).collect();
            let expected = arg.iter().fold(0u64, |a, &b| a.wrapping_add(b as u64));
            comm.execute_on(1, 0, &arg);
            // Blocking: the body has run by the time we return.
            assert_eq!(EXEC_SUM.load(Ordering::Acquire), expected | 1 << 63);
        }
        ctx.ex.sync();
    });
}

static FAST_HITS: AtomicU64 = AtomicU64::new(0);

fn bump(_comm: &Comm, _arg: &[u8]) {
    FAST_HITS.fetch_add(1, Ordering::AcqRel);
}

#[test]
fn execute_on_fast_runs_inline() {
    let mut cfg = JobConfig::new(3);
    cfg.fn_table = vec![bump];
    run_job(cfg, |comm, ctx| {
        if comm.node_id() == 0 {
            for peer in 1..3 {
                comm.execute_on_fast(peer, 0, &[]);
            }
            assert_eq!(FAST_HITS.load(Ordering::Acquire), 2);
        }
        ctx.ex.sync();
    });
}

static LARGE_SUM: AtomicU64 = AtomicU64::new(0);

fn sum_large(_comm: &Comm, arg: &[u8]) {
    let sum = arg.iter().fold(0u64, |a, &b| a.wrapping_add(b as u64));
    LARGE_SUM.store(sum | 1 << 63, Ordering::Release);
}

#[test]
fn execute_on_large_payload_is_pulled() {
    let mut cfg = JobConfig::new(4);
    cfg.fn_table = vec![sum_large];
    run_job(cfg, |comm, ctx| {
        if comm.node_id() == 0 {
            // 2 KiB exceeds the inline cap; the handler GETs it back
            // from us before invoking the body.
            let arg: Vec<u8> = (0..2048u32).map(|b| (b % 249) as u8).collect();
            let expected = arg.iter().fold(0u64, |a, &b| a.wrapping_add(b as u64));
            comm.execute_on(3, 0, &arg);
            assert_eq!(LARGE_SUM.load(Ordering::Acquire), expected | 1 << 63);
        }
        ctx.ex.sync();
    });
}

static NB_SUM: AtomicU64 = AtomicU64::new(0);

fn sum_nb(_comm: &Comm, arg: &[u8]) {
    let sum = arg.iter().fold(0u64, |a, &b| a.wrapping_add(b as u64));
    NB_SUM.store(sum | 1 << 63, Ordering::Release);
}

#[test]
fn execute_on_large_nonblocking() {
    let mut cfg = JobConfig::new(2);
    cfg.fn_table = vec![sum_nb];
    run_job(cfg, |comm, ctx| {
        if comm.node_id() == 0 {
            let arg: Vec<u8> = (0..5000u32).map(|b| (b % 241) as u8).collect();
            let expected = arg.iter().fold(0u64, |a, &b| a.wrapping_add(b as u64));
            comm.execute_on_nb(1, 0, &arg);
            // The payload was copied before return; the original can
            // die now. Wait for the body to observe the copy.
            drop(arg);
            wait_until("non-blocking on-stmt body", || {
                NB_SUM.load(Ordering::Acquire) == expected | 1 << 63
            });
        }
        ctx.ex.sync();
    });
}

// =============================================================================
// AMOs
// =============================================================================

fn cswap_scenario(comm: &Comm, ctx: &NodeCtx, obj: &mut Box<u64>) {
    let me = comm.node_id();
    if me == 2 {
        **obj = 5;
        ctx.ex.publish(0, 2, obj.as_ref() as *const u64 as u64);
    }
    ctx.ex.sync();

    if me == 0 {
        let addr = ctx.ex.get(0, 2) as usize as *mut u64;
        let old = unsafe { comm.amo_cmpxchg(5u64, 9, 2, addr) };
        assert_eq!(old, 5);
        let now = unsafe { comm.amo_read(2, addr) };
        assert_eq!(now, 9);
        // A failing compare leaves the object alone.
        let old = unsafe { comm.amo_cmpxchg(5u64, 1, 2, addr) };
        assert_eq!(old, 9);
    }
    ctx.ex.sync();
    if me == 2 {
        assert_eq!(**obj, 9);
    }
    ctx.ex.sync();
}

#[test]
fn amo_cswap_native() {
    run_job(JobConfig::new(3).native_atomics(), |comm, ctx| {
        let mut obj = Box::new(0u64);
        cswap_scenario(&comm, &ctx, &mut obj);
        if comm.node_id() == 0 {
            // The probes passed, so the op went over the network.
            assert!(ctx.fab.stats().amos >= 2);
        }
    });
}

#[test]
fn amo_cswap_am_path() {
    // Without the atomic capability hint the provider reports no
    // native atomics, so the same scenario runs CPU-side at the owner
    // with identical observable results.
    run_job(JobConfig::new(3), |comm, ctx| {
        let mut obj = Box::new(0u64);
        cswap_scenario(&comm, &ctx, &mut obj);
        if comm.node_id() == 0 {
            assert_eq!(ctx.fab.stats().amos, 0);
        }
    });
}

#[test]
fn amo_arithmetic_and_bitwise() {
    run_job(JobConfig::new(2), |comm, ctx| {
        let me = comm.node_id();
        let mut int_obj = Box::new(0u64);
        let mut float_obj = Box::new(0f64);
        if me == 1 {
            ctx.ex.publish(0, 1, int_obj.as_ref() as *const u64 as u64);
            ctx.ex.publish(1, 1, float_obj.as_ref() as *const f64 as u64);
        }
        ctx.ex.sync();

        if me == 0 {
            let iobj = ctx.ex.get(0, 1) as usize as *mut u64;
            let fobj = ctx.ex.get(1, 1) as usize as *mut f64;
            unsafe {
                comm.amo_write(0b1111u64, 1, iobj);
                comm.amo_and(0b1010u64, 1, iobj);
                assert_eq!(comm.amo_fetch_or(0b0100u64, 1, iobj), 0b1010);
                comm.amo_xor(0b0001u64, 1, iobj);
                assert_eq!(comm.amo_read(1, iobj), 0b1111);

                comm.amo_add(40u64, 1, iobj);
                assert_eq!(comm.amo_fetch_sub(5u64, 1, iobj), 0b1111 + 40);
                assert_eq!(comm.amo_read(1, iobj), 0b1111 + 35);

                // Add by zero is a no-op.
                let before = comm.amo_read(1, iobj);
                comm.amo_add(0u64, 1, iobj);
                assert_eq!(comm.amo_read(1, iobj), before);

                comm.amo_write(1.5f64, 1, fobj);
                comm.amo_add(2.25f64, 1, fobj);
                assert_eq!(comm.amo_read(1, fobj), 3.75);
                let old = comm.amo_xchg(10.0f64, 1, fobj);
                assert_eq!(old, 3.75);
            }
        }
        ctx.ex.sync();
        if me == 1 {
            assert_eq!(*int_obj, 0b1111 + 35);
            assert_eq!(*float_obj, 10.0);
        }
        ctx.ex.sync();
    });
}

// =============================================================================
// Registration fallbacks
// =============================================================================

#[test]
fn basic_registration_direct_and_am_fallback() {
    run_job(
        JobConfig::new(2).basic_registration(1 << 20),
        |comm, ctx| {
            let me = comm.node_id();
            let (heap_base, _heap_len) = ctx.heap.expect("basic job has a heap");
            // An object outside the registered heap: reachable only by
            // AM-mediated transfer.
            let outside = vec![0u8; 512].into_boxed_slice();
            ctx.ex.publish(0, me, heap_base as u64);
            ctx.ex.publish(1, me, outside.as_ptr() as u64);
            ctx.ex.sync();

            if me == 0 {
                let peer_heap = ctx.ex.get(0, 1) as usize;
                let peer_outside = ctx.ex.get(1, 1) as usize;
                let src: Vec<u8> = (0..512).map(|b| (b % 127) as u8).collect();
                let mut back = vec![0u8; 512];

                // In-heap: direct RMA.
                let before = ctx.fab.stats().sends;
                unsafe {
                    comm.put(src.as_ptr(), 1, (peer_heap + 4096) as *mut u8, 512);
                    comm.get(back.as_mut_ptr(), 1, (peer_heap + 4096) as *const u8, 512);
                }
                assert_eq!(src, back);
                assert_eq!(ctx.fab.stats().sends, before, "no AM traffic expected");

                // Out-of-heap: the transfer inverts through the AM
                // handler, with identical results.
                let before = ctx.fab.stats().sends;
                let mut back2 = vec![0u8; 512];
                unsafe {
                    comm.put(src.as_ptr(), 1, peer_outside as *mut u8, 512);
                    comm.get(back2.as_mut_ptr(), 1, peer_outside as *const u8, 512);
                }
                assert_eq!(src, back2);
                assert!(ctx.fab.stats().sends > before, "AM fallback expected");
            }
            ctx.ex.sync();
            if me == 1 {
                assert_eq!(outside[0], 0);
                assert_eq!(outside[1], 1 % 127);
            }
            ctx.ex.sync();
            drop(outside);
        },
    );
}

// =============================================================================
// Misc
// =============================================================================

#[test]
fn single_node_job() {
    run_job(JobConfig::new(1), |comm, ctx| {
        assert_eq!(comm.num_nodes(), 1);
        let src = [9u8; 16];
        let mut dst = [0u8; 16];
        unsafe {
            comm.put(src.as_ptr(), 0, dst.as_mut_ptr(), 16);
        }
        assert_eq!(dst, src);

        let mut x = 1u64;
        let old = unsafe { comm.amo_fetch_add(4u64, 0, &mut x) };
        assert_eq!((old, x), (1, 5));

        comm.barrier();
        ctx.ex.sync();
    });
}

#[test]
fn broadcast_private_reaches_all_nodes() {
    use std::sync::{Arc, Barrier};

    common::init_tracing();
    let n = 3;
    let nodes = fabric::Cluster::launch(fabric::ClusterConfig {
        num_nodes: n,
        ..Default::default()
    });
    let oobs = onesided::MeshOob::cluster(n);
    let gate = Arc::new(Barrier::new(n));

    let handles: Vec<_> = nodes
        .into_iter()
        .zip(oobs)
        .map(|(node, oob)| {
            let gate = Arc::clone(&gate);
            std::thread::spawn(move || {
                let me = node.id() as usize;
                let mut slot = Box::new([0u64; 1]);
                if me == 0 {
                    slot[0] = 0xfeed;
                }
                let comm = unsafe {
                    onesided::CommBuilder::new(node, Arc::new(oob))
                        .private_table(vec![(slot.as_mut_ptr() as *mut u8, 8)])
                }
                .build()
                .expect("init");

                if me == 0 {
                    unsafe { comm.broadcast_private(0) };
                }
                common::wait_until("private broadcast", || slot[0] == 0xfeed);
                // Hold teardown until every node has checked its slot.
                gate.wait();
                comm.finalize();
                drop(slot);
            })
        })
        .collect();
    for h in handles {
        h.join().unwrap();
    }
}
