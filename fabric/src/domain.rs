//! Fabric access domains: memory registration, address vectors, and
//! object construction.

use std::io;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use crate::cq::{Counter, EventQueue, PollSet, RxCq, TxCq, WaitSet};
use crate::ep::{CmplSink, EpName, RxEndpoint, TxCompletion, TxContext};
use crate::info::{Access, Info, MrMode};
use crate::inproc::{Exposure, Node, RxEpShared};
use crate::FabricAddr;

/// Shared address-vector state: a dense table of endpoint names.
pub(crate) struct AvShared {
    entries: Mutex<Vec<(u32, u32)>>,
}

impl AvShared {
    pub(crate) fn lookup(&self, addr: FabricAddr) -> io::Result<(u32, u32)> {
        self.entries
            .lock()
            .unwrap()
            .get(addr as usize)
            .copied()
            .ok_or_else(|| {
                io::Error::new(
                    io::ErrorKind::NotFound,
                    format!("fabric address {addr} not in address vector"),
                )
            })
    }
}

/// Table-style address vector.
#[derive(Clone)]
pub struct AddressVector {
    pub(crate) sh: Arc<AvShared>,
}

impl AddressVector {
    /// Insert endpoint names; returns one fabric address per name, in
    /// insertion order.
    pub fn insert(&self, names: &[EpName]) -> Vec<FabricAddr> {
        let mut entries = self.sh.entries.lock().unwrap();
        let first = entries.len() as u64;
        entries.extend(names.iter().map(|n| n.decode()));
        (first..first + names.len() as u64).collect()
    }
}

/// A registered memory region. Deregistered on drop.
pub struct MemoryRegion {
    node: Node,
    key: u64,
}

/// Opaque local descriptor for a registered region.
#[derive(Debug, Clone, Copy)]
pub struct MrDesc(pub(crate) u64);

impl MemoryRegion {
    /// The remote key peers use to address this region.
    pub fn key(&self) -> u64 {
        self.key
    }

    /// The local descriptor to pass with local buffers.
    pub fn desc(&self) -> MrDesc {
        MrDesc(self.key)
    }

    /// Bind the region to a receive endpoint (for providers whose
    /// registration mode requires it).
    pub fn bind(&self, _ep: &RxEndpoint) -> io::Result<()> {
        Ok(())
    }

    /// Enable the region after binding.
    pub fn enable(&self) -> io::Result<()> {
        Ok(())
    }
}

impl Drop for MemoryRegion {
    fn drop(&mut self) {
        let mut exposures = self.node.shared().exposures.lock().unwrap();
        exposures.retain(|e| e.key != self.key);
    }
}

/// A fabric access domain on one node.
pub struct Domain {
    pub(crate) node: Node,
    pub(crate) info: Info,
}

impl Domain {
    /// Open a domain from a selected provider instance.
    pub fn open(info: &Info) -> io::Result<Domain> {
        Ok(Domain {
            node: info.node.clone(),
            info: info.clone(),
        })
    }

    pub fn info(&self) -> &Info {
        &self.info
    }

    /// Register `[addr, addr+len)` for remote access.
    ///
    /// With provider-chosen keys the requested key is ignored;
    /// otherwise the region gets exactly `requested_key`.
    ///
    /// # Safety
    /// The range must stay valid (and not be concurrently freed) until
    /// the returned region is dropped. Remote peers will read and
    /// write it per `access`.
    pub unsafe fn register(
        &self,
        addr: *mut u8,
        len: usize,
        access: Access,
        requested_key: u64,
    ) -> io::Result<MemoryRegion> {
        let _ = access;
        let sh = self.node.shared();
        let key = if self.info.domain_attr.mr_mode.contains(MrMode::PROV_KEY) {
            sh.next_key.fetch_add(1, Ordering::Relaxed)
        } else {
            requested_key
        };
        let mut exposures = sh.exposures.lock().unwrap();
        if exposures.iter().any(|e| e.key == key) {
            return Err(io::Error::new(
                io::ErrorKind::AlreadyExists,
                format!("memory region key {key} already registered"),
            ));
        }
        exposures.push(Exposure {
            key,
            base: addr as usize,
            len,
        });
        Ok(MemoryRegion {
            node: self.node.clone(),
            key,
        })
    }

    /// Open an address vector sized for `count` entries.
    pub fn av_open(&self, count: usize) -> io::Result<AddressVector> {
        Ok(AddressVector {
            sh: Arc::new(AvShared {
                entries: Mutex::new(Vec::with_capacity(count)),
            }),
        })
    }

    /// Open a transmit completion queue, optionally wired to a wait set.
    pub fn cq_open_tx(&self, size: usize, wait: Option<&WaitSet>) -> io::Result<TxCq> {
        let cq = TxCq {
            sh: EventQueue::new(),
            size,
        };
        if let Some(ws) = wait {
            ws.attach_tx(&cq);
        }
        Ok(cq)
    }

    /// Open a receive completion queue, optionally wired to a wait set.
    pub fn cq_open_rx(&self, size: usize, wait: Option<&WaitSet>) -> io::Result<RxCq> {
        let _ = size;
        let cq = RxCq {
            sh: EventQueue::new(),
        };
        if let Some(ws) = wait {
            ws.attach_rx(&cq);
        }
        Ok(cq)
    }

    /// Open a completion counter.
    pub fn cntr_open(&self) -> io::Result<Counter> {
        if self.info.domain_attr.cntr_cnt == 0 {
            return Err(io::Error::new(
                io::ErrorKind::Unsupported,
                "provider has no completion counters",
            ));
        }
        Ok(Counter {
            count: Arc::new(AtomicU64::new(0)),
        })
    }

    /// Open a poll set, if the provider supports them.
    pub fn poll_open(&self) -> io::Result<PollSet> {
        if !self.node.cl.config.wait_sets {
            return Err(io::Error::new(
                io::ErrorKind::Unsupported,
                "provider does not support poll sets",
            ));
        }
        Ok(PollSet::new())
    }

    /// Open a wait set, if the provider supports them.
    pub fn wait_open(&self) -> io::Result<WaitSet> {
        if !self.node.cl.config.wait_sets {
            return Err(io::Error::new(
                io::ErrorKind::Unsupported,
                "provider does not support wait sets",
            ));
        }
        Ok(WaitSet::new())
    }

    /// Create a transmit context reporting completions to `cmpl`.
    pub fn tx_context(
        &self,
        av: &AddressVector,
        cmpl: TxCompletion<'_>,
    ) -> io::Result<TxContext> {
        let sink = match cmpl {
            TxCompletion::Cq(cq) => CmplSink::Cq(Arc::clone(&cq.sh)),
            TxCompletion::Cntr(c) => CmplSink::Cntr(Arc::clone(&c.count)),
        };
        Ok(TxContext {
            node: self.node.clone(),
            av: Arc::clone(&av.sh),
            sink,
            caps: self.info.caps,
            inject_size: self.info.tx_attr.inject_size,
            max_msg_size: self.info.ep_attr.max_msg_size,
        })
    }

    /// Create a receive endpoint whose events go to `cq`.
    pub fn rx_endpoint(&self, av: &AddressVector, cq: &RxCq) -> io::Result<RxEndpoint> {
        let _ = av;
        let sh = RxEpShared::new(Arc::clone(&cq.sh));
        let mut eps = self.node.shared().rx_eps.lock().unwrap();
        let index = eps.len() as u32;
        eps.push(Arc::clone(&sh));
        Ok(RxEndpoint {
            node: self.node.clone(),
            sh,
            index,
        })
    }
}
