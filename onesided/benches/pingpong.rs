//! Round-trip latency of small PUT/GET pairs over the in-process
//! provider.

use std::sync::mpsc;
use std::sync::Arc;

use criterion::{criterion_group, criterion_main, Criterion, Throughput};
use fabric::{Cluster, ClusterConfig};
use onesided::{CommBuilder, MeshOob, ThreadTasking};

fn bench_put_get(c: &mut Criterion) {
    let mut nodes = Cluster::launch(ClusterConfig {
        num_nodes: 2,
        ..Default::default()
    });
    let mut oobs = MeshOob::cluster(2);
    let node1 = nodes.remove(1);
    let oob1 = oobs.remove(1);
    let node0 = nodes.remove(0);
    let oob0 = oobs.remove(0);

    let (addr_tx, addr_rx) = mpsc::channel::<u64>();
    let (stop_tx, stop_rx) = mpsc::channel::<()>();

    let peer = std::thread::spawn(move || {
        ThreadTasking::mark_fixed_thread();
        let comm = CommBuilder::new(node1, Arc::new(oob1))
            .tasking(Arc::new(ThreadTasking::with_fixed_threads(1)))
            .build()
            .expect("node 1 init");
        let target = vec![0u8; 4096].into_boxed_slice();
        addr_tx.send(target.as_ptr() as u64).unwrap();
        stop_rx.recv().unwrap();
        comm.finalize();
        drop(target);
    });

    ThreadTasking::mark_fixed_thread();
    let comm = CommBuilder::new(node0, Arc::new(oob0))
        .tasking(Arc::new(ThreadTasking::with_fixed_threads(1)))
        .build()
        .expect("node 0 init");
    let raddr = addr_rx.recv().unwrap() as usize;

    let mut group = c.benchmark_group("pingpong");
    for size in [8usize, 256, 4096] {
        group.throughput(Throughput::Bytes(2 * size as u64));
        group.bench_function(format!("put_get_{size}"), |b| {
            let src: Vec<u8> = (0..size).map(|x| x as u8).collect();
            let mut dst = vec![0u8; size];
            b.iter(|| unsafe {
                comm.put(src.as_ptr(), 1, raddr as *mut u8, size);
                comm.get(dst.as_mut_ptr(), 1, raddr as *const u8, size);
            });
        });
    }
    group.finish();

    stop_tx.send(()).unwrap();
    comm.finalize();
    peer.join().unwrap();
}

criterion_group!(benches, bench_put_get);
criterion_main!(benches);
