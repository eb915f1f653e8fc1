//! Fabric transport surface for one-sided communication runtimes.
//!
//! The API follows the shape of an OFI-style transport: providers
//! are discovered through hint-filtered [`getinfo`] queries, a
//! [`Domain`] is opened from the selected [`Info`], and the domain
//! hands out transmit contexts, receive endpoints, address vectors,
//! completion queues/counters, and registered memory regions.
//!
//! One provider ships with the crate: the in-process cluster in
//! [`inproc`], used by test suites and single-machine runs. Its
//! advertised capabilities are configurable so callers can be
//! exercised against weak providers (no delivery-complete, no native
//! atomics, small message limits) as well as strong ones.

pub mod cq;
pub mod domain;
pub mod ep;
pub mod info;
pub mod inproc;

pub use cq::{Counter, PollSet, RxCq, RxEntry, RxFlags, TxCq, TxEntry, WaitSet};
pub use domain::{AddressVector, Domain, MemoryRegion, MrDesc};
pub use ep::{EpName, RxEndpoint, TxCompletion, TxContext};
pub use info::{
    getinfo, Access, AvType, Caps, DomainAttr, EpAttr, EpType, FabricAttr, Hints, Info,
    MrMode, MsgOrder, OpFlags, Progress, RxAttr, Threading, TxAttr,
};
pub use inproc::{AmoDt, AmoOp, Cluster, ClusterConfig, Node, StatsSnapshot};

/// An entry in a table-style address vector.
pub type FabricAddr = u64;

#[cfg(test)]
mod tests {
    use super::*;

    fn two_nodes() -> Vec<Node> {
        Cluster::launch(ClusterConfig {
            num_nodes: 2,
            ..Default::default()
        })
    }

    fn base_hints() -> Hints {
        Hints {
            caps: Caps::MSG | Caps::MULTI_RECV | Caps::RMA | Caps::LOCAL_COMM | Caps::REMOTE_COMM,
            ..Default::default()
        }
    }

    fn open_domain(node: &Node) -> Domain {
        let infos = getinfo(node, &base_hints());
        Domain::open(&infos[0]).unwrap()
    }

    #[test]
    fn getinfo_respects_delivery_complete() {
        let nodes = Cluster::launch(ClusterConfig {
            num_nodes: 1,
            delivery_complete: false,
            ..Default::default()
        });
        let mut hints = base_hints();
        hints.tx_attr.op_flags = OpFlags::DELIVERY_COMPLETE;
        assert!(getinfo(&nodes[0], &hints).is_empty());

        hints.tx_attr.op_flags = OpFlags::COMPLETION;
        hints.tx_attr.msg_order = MsgOrder::RAW | MsgOrder::WAW | MsgOrder::SAW;
        let infos = getinfo(&nodes[0], &hints);
        assert_eq!(infos.len(), 1);
        assert!(!infos[0].tx_attr.op_flags.contains(OpFlags::DELIVERY_COMPLETE));
    }

    #[test]
    fn rma_write_read_between_nodes() {
        let nodes = two_nodes();
        let d0 = open_domain(&nodes[0]);
        let d1 = open_domain(&nodes[1]);

        // Scalable-style registration: whole address space, key 0.
        let _mr1 = unsafe {
            d1.register(std::ptr::null_mut(), usize::MAX, Access::all(), 0)
                .unwrap()
        };
        let _mr0 = unsafe {
            d0.register(std::ptr::null_mut(), usize::MAX, Access::all(), 0)
                .unwrap()
        };

        let av = d0.av_open(4).unwrap();
        let rx_cq = d1.cq_open_rx(16, None).unwrap();
        let rx = d1.rx_endpoint(&d1.av_open(4).unwrap(), &rx_cq).unwrap();
        let addrs = av.insert(&[rx.name()]);

        let tx_cq = d0.cq_open_tx(16, None).unwrap();
        let tx = d0.tx_context(&av, TxCompletion::Cq(&tx_cq)).unwrap();

        let mut target = [0u8; 8];
        let src = [0xAAu8; 8];
        unsafe {
            tx.write(
                src.as_ptr(),
                8,
                addrs[0],
                target.as_mut_ptr() as u64,
                0,
                7,
            )
            .unwrap();
        }
        assert_eq!(target, [0xAA; 8]);

        let mut entries = [TxEntry { context: 0 }; 4];
        assert_eq!(tx_cq.read(&mut entries).unwrap(), 1);
        assert_eq!(entries[0].context, 7);

        let mut back = [0u8; 8];
        unsafe {
            tx.read(
                back.as_mut_ptr(),
                8,
                addrs[0],
                target.as_ptr() as u64,
                0,
                8,
            )
            .unwrap();
        }
        assert_eq!(back, [0xAA; 8]);
        assert_eq!(nodes[0].stats().rma_writes, 1);
        assert_eq!(nodes[0].stats().rma_reads, 1);
    }

    #[test]
    fn basic_mode_offset_resolution() {
        let nodes = Cluster::launch(ClusterConfig {
            num_nodes: 2,
            mr_mode: MrMode::PROV_KEY | MrMode::VIRT_ADDR,
            ..Default::default()
        });
        let mut hints = base_hints();
        hints.domain_attr.mr_mode = MrMode::PROV_KEY | MrMode::VIRT_ADDR | MrMode::LOCAL;
        let d0 = Domain::open(&getinfo(&nodes[0], &hints)[0]).unwrap();
        let d1 = Domain::open(&getinfo(&nodes[1], &hints)[0]).unwrap();

        let mut heap = vec![0u8; 256];
        let mr = unsafe {
            d1.register(heap.as_mut_ptr(), heap.len(), Access::all(), 0)
                .unwrap()
        };
        assert_ne!(mr.key(), 0); // provider-chosen

        let av = d0.av_open(2).unwrap();
        let rx_cq = d1.cq_open_rx(4, None).unwrap();
        let rx = d1.rx_endpoint(&d1.av_open(2).unwrap(), &rx_cq).unwrap();
        let addrs = av.insert(&[rx.name()]);
        let tx_cq = d0.cq_open_tx(4, None).unwrap();
        let tx = d0.tx_context(&av, TxCompletion::Cq(&tx_cq)).unwrap();

        // Offset-based addressing: off = addr - base.
        let src = [5u8; 4];
        unsafe {
            tx.write(src.as_ptr(), 4, addrs[0], heap.as_ptr() as u64 + 16, mr.key(), 0)
                .unwrap();
        }
        assert_eq!(&heap[16..20], &[5, 5, 5, 5]);

        // Out-of-range RMA fails.
        let err = unsafe {
            tx.write(src.as_ptr(), 4, addrs[0], heap.as_ptr() as u64 + 255, mr.key(), 0)
        }
        .unwrap_err();
        assert_eq!(err.kind(), std::io::ErrorKind::InvalidInput);
    }

    #[test]
    fn send_lands_in_posted_buffer() {
        let nodes = two_nodes();
        let d0 = open_domain(&nodes[0]);
        let d1 = open_domain(&nodes[1]);

        let av = d0.av_open(2).unwrap();
        let rx_cq = d1.cq_open_rx(8, None).unwrap();
        let rx = d1.rx_endpoint(&d1.av_open(2).unwrap(), &rx_cq).unwrap();
        let addrs = av.insert(&[rx.name()]);

        let mut lz = vec![0u8; 4096];
        rx.set_min_multi_recv(64);
        unsafe { rx.post_multi_recv(lz.as_mut_ptr(), lz.len()).unwrap() };

        let tx_cq = d0.cq_open_tx(8, None).unwrap();
        let tx = d0.tx_context(&av, TxCompletion::Cq(&tx_cq)).unwrap();
        tx.send(b"hello fabric", addrs[0], 42).unwrap();

        let mut entries = [RxEntry {
            flags: RxFlags::RECV,
            buf: 0,
            len: 0,
        }; 4];
        let n = rx_cq.read(&mut entries).unwrap();
        assert_eq!(n, 1);
        assert!(entries[0].flags.contains(RxFlags::RECV));
        let got =
            unsafe { std::slice::from_raw_parts(entries[0].buf as *const u8, entries[0].len) };
        assert_eq!(got, b"hello fabric");
    }
}
