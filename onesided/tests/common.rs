//! Shared harness: spin up an in-process cluster of communication
//! runtimes, one node per thread, with a side channel for tests to
//! trade buffer addresses.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Barrier, Once};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use fabric::{Cluster, ClusterConfig};
use onesided::{Comm, CommBuilder, CommEnv, ExecFn, MeshOob, ThreadTasking};

pub fn init_tracing() {
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    });
}

/// Spin until `cond` holds, failing after a generous timeout.
#[allow(dead_code)]
pub fn wait_until(what: &str, mut cond: impl FnMut() -> bool) {
    let start = Instant::now();
    while !cond() {
        if start.elapsed() > Duration::from_secs(20) {
            panic!("timed out waiting for {what}");
        }
        std::thread::yield_now();
    }
}

/// Address slots tests use to publish buffer locations to peers.
pub struct Exchange {
    n: usize,
    slots: Vec<AtomicU64>,
    barrier: Barrier,
}

pub const EX_SLOTS: usize = 8;

impl Exchange {
    fn new(n: usize) -> Arc<Exchange> {
        Arc::new(Exchange {
            n,
            slots: (0..n * EX_SLOTS).map(|_| AtomicU64::new(0)).collect(),
            barrier: Barrier::new(n),
        })
    }

    pub fn publish(&self, slot: usize, node: usize, v: u64) {
        self.slots[slot * self.n + node].store(v, Ordering::Release);
    }

    pub fn get(&self, slot: usize, node: usize) -> u64 {
        self.slots[slot * self.n + node].load(Ordering::Acquire)
    }

    /// Rendezvous of all node bodies.
    pub fn sync(&self) {
        self.barrier.wait();
    }
}

/// Per-node handles a test body works with.
pub struct NodeCtx {
    /// The fabric node, for its diagnostic op counters.
    pub fab: fabric::Node,
    pub ex: Arc<Exchange>,
    /// `(base, len)` of the registered heap in basic-registration jobs.
    pub heap: Option<(usize, usize)>,
}

pub struct JobConfig {
    pub cluster: ClusterConfig,
    pub env: CommEnv,
    pub fn_table: Vec<ExecFn>,
    /// Mark every node thread fixed, enabling bound tx contexts.
    pub fixed_threads: bool,
    /// Per-node fixed heap size; switches on basic registration.
    pub fixed_heap_size: Option<usize>,
}

impl JobConfig {
    pub fn new(num_nodes: usize) -> JobConfig {
        JobConfig {
            cluster: ClusterConfig {
                num_nodes,
                ..Default::default()
            },
            env: CommEnv::default(),
            fn_table: Vec::new(),
            fixed_threads: true,
            fixed_heap_size: None,
        }
    }

    /// A provider without delivery-complete, forcing the ordering
    /// layer to earn its keep.
    #[allow(dead_code)]
    pub fn message_order(mut self) -> JobConfig {
        self.cluster.delivery_complete = false;
        self
    }

    /// A provider demanding explicit registration of a fixed heap.
    #[allow(dead_code)]
    pub fn basic_registration(mut self, heap_size: usize) -> JobConfig {
        self.cluster.mr_mode =
            fabric::MrMode::LOCAL | fabric::MrMode::VIRT_ADDR | fabric::MrMode::PROV_KEY;
        self.fixed_heap_size = Some(heap_size);
        self
    }

    /// Hint the atomic capability so native network AMOs are eligible.
    #[allow(dead_code)]
    pub fn native_atomics(mut self) -> JobConfig {
        self.env.hints_caps_atomic = true;
        self
    }
}

/// Run `body(comm, ctx)` on every node of a fresh job, each on its own
/// thread, and join them all.
pub fn run_job<F>(cfg: JobConfig, body: F)
where
    F: Fn(Arc<Comm>, NodeCtx) + Send + Sync + 'static,
{
    init_tracing();
    let n = cfg.cluster.num_nodes;
    let nodes = Cluster::launch(cfg.cluster);
    let oobs = MeshOob::cluster(n);
    let ex = Exchange::new(n);
    let body = Arc::new(body);

    let handles: Vec<JoinHandle<()>> = nodes
        .into_iter()
        .zip(oobs)
        .map(|(node, oob)| {
            let body = Arc::clone(&body);
            let ex = Arc::clone(&ex);
            let env = cfg.env.clone();
            let fn_table = cfg.fn_table.clone();
            let fixed = cfg.fixed_threads;
            let heap_size = cfg.fixed_heap_size;
            std::thread::Builder::new()
                .name(format!("node-{}", node.id()))
                .spawn(move || {
                    let tasking = Arc::new(if fixed {
                        ThreadTasking::with_fixed_threads(1)
                    } else {
                        ThreadTasking::new()
                    });
                    if fixed {
                        ThreadTasking::mark_fixed_thread();
                    }

                    let mut heap_storage: Option<Box<[u8]>> = None;
                    let mut builder = CommBuilder::new(node.clone(), Arc::new(oob))
                        .tasking(tasking)
                        .env(env)
                        .fn_table(fn_table);
                    let mut heap = None;
                    if let Some(sz) = heap_size {
                        let mut h = vec![0u8; sz].into_boxed_slice();
                        heap = Some((h.as_ptr() as usize, sz));
                        // Safety: the heap outlives the runtime; it is
                        // dropped only after finalize below.
                        builder = unsafe { builder.fixed_heap(h.as_mut_ptr(), sz) };
                        heap_storage = Some(h);
                    }

                    let comm = builder.build().expect("initializing comm layer");
                    body(
                        Arc::clone(&comm),
                        NodeCtx {
                            fab: node,
                            ex,
                            heap,
                        },
                    );
                    comm.finalize();
                    drop(heap_storage);
                })
                .expect("spawning node thread")
        })
        .collect();

    for h in handles {
        h.join().expect("node thread panicked");
    }
}
