//! Memory registration table and registered scratch memory.
//!
//! Two modes. Scalable: one logical region covers all of memory under
//! key 0 and nothing needs per-transfer lookup. Basic: the caller's
//! fixed heap plus an internal scratch arena are registered explicitly
//! and every node holds a replica of every other node's table, gathered
//! once over the out-of-band channel. The table is immutable after
//! initialization.

use std::io;
use std::sync::{Arc, Mutex};

use fabric::{Access, Domain, MemoryRegion, MrMode};

use crate::ctx::CtxTab;
use crate::error::{Error, Result};
use crate::oob::OutOfBand;

/// Maximum registered regions per node.
pub(crate) const MAX_MR: usize = 10;

/// Bytes of registered scratch carried in basic mode.
const ARENA_SIZE: usize = 4 << 20;

/// Scratch allocation alignment.
const ARENA_ALIGN: usize = 16;

/// One registered region, as shared with peers.
#[derive(Debug, Clone, Copy, Default)]
pub(crate) struct MemEntry {
    pub addr: usize,
    pub base: usize,
    pub size: usize,
    pub key: u64,
}

const ENTRY_BYTES: usize = 32;
const TAB_BYTES: usize = 8 + MAX_MR * ENTRY_BYTES;

fn encode_tab(entries: &[MemEntry]) -> [u8; TAB_BYTES] {
    let mut out = [0u8; TAB_BYTES];
    out[..8].copy_from_slice(&(entries.len() as u64).to_le_bytes());
    for (i, e) in entries.iter().enumerate() {
        let at = 8 + i * ENTRY_BYTES;
        out[at..at + 8].copy_from_slice(&(e.addr as u64).to_le_bytes());
        out[at + 8..at + 16].copy_from_slice(&(e.base as u64).to_le_bytes());
        out[at + 16..at + 24].copy_from_slice(&(e.size as u64).to_le_bytes());
        out[at + 24..at + 32].copy_from_slice(&e.key.to_le_bytes());
    }
    out
}

fn decode_tab(buf: &[u8]) -> Vec<MemEntry> {
    let n = u64::from_le_bytes(buf[..8].try_into().unwrap()) as usize;
    (0..n)
        .map(|i| {
            let at = 8 + i * ENTRY_BYTES;
            MemEntry {
                addr: u64::from_le_bytes(buf[at..at + 8].try_into().unwrap()) as usize,
                base: u64::from_le_bytes(buf[at + 8..at + 16].try_into().unwrap()) as usize,
                size: u64::from_le_bytes(buf[at + 16..at + 24].try_into().unwrap()) as usize,
                key: u64::from_le_bytes(buf[at + 24..at + 32].try_into().unwrap()),
            }
        })
        .collect()
}

// =============================================================================
// Registered scratch arena
// =============================================================================

struct ArenaInner {
    base: usize,
    len: usize,
    /// Free list of (offset, len), kept sorted by offset.
    free: Mutex<Vec<(usize, usize)>>,
    /// Keeps the backing storage alive; freed when the arena drops.
    _backing: Box<[u8]>,
}

/// First-fit allocator over one registered region.
#[derive(Clone)]
pub(crate) struct Arena {
    inner: Arc<ArenaInner>,
}

impl Arena {
    fn new(len: usize) -> Self {
        let backing = vec![0u8; len].into_boxed_slice();
        let base = backing.as_ptr() as usize;
        Self {
            inner: Arc::new(ArenaInner {
                base,
                len,
                free: Mutex::new(vec![(0, len)]),
                _backing: backing,
            }),
        }
    }

    fn base(&self) -> usize {
        self.inner.base
    }

    fn len(&self) -> usize {
        self.inner.len
    }

    fn contains(&self, addr: usize) -> bool {
        addr >= self.inner.base && addr < self.inner.base + self.inner.len
    }

    fn alloc(&self, size: usize) -> Option<usize> {
        let size = (size.max(1) + ARENA_ALIGN - 1) & !(ARENA_ALIGN - 1);
        let mut free = self.inner.free.lock().unwrap();
        for i in 0..free.len() {
            let (off, avail) = free[i];
            if avail >= size {
                if avail == size {
                    free.remove(i);
                } else {
                    free[i] = (off + size, avail - size);
                }
                return Some(self.inner.base + off);
            }
        }
        None
    }

    fn free(&self, addr: usize, size: usize) {
        let size = (size.max(1) + ARENA_ALIGN - 1) & !(ARENA_ALIGN - 1);
        let off = addr - self.inner.base;
        let mut free = self.inner.free.lock().unwrap();
        let at = free.partition_point(|&(o, _)| o < off);
        free.insert(at, (off, size));
        // Coalesce with neighbors.
        if at + 1 < free.len() && free[at].0 + free[at].1 == free[at + 1].0 {
            free[at].1 += free[at + 1].1;
            free.remove(at + 1);
        }
        if at > 0 && free[at - 1].0 + free[at - 1].1 == free[at].0 {
            free[at - 1].1 += free[at].1;
            free.remove(at);
        }
    }
}

enum RegOrigin {
    /// Plain heap memory; valid only in scalable mode.
    Heap(Box<[u8]>),
    /// Carved out of the registered arena.
    Arena(Arena),
}

/// A registered scratch buffer with a stable address.
pub(crate) struct RegBuf {
    addr: usize,
    len: usize,
    origin: RegOrigin,
}

impl RegBuf {
    pub fn addr(&self) -> usize {
        self.addr
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn as_ptr(&self) -> *const u8 {
        self.addr as *const u8
    }

    pub fn as_mut_ptr(&self) -> *mut u8 {
        self.addr as *mut u8
    }

    /// Leak the buffer, returning its raw address and length. Freed
    /// later with [`MemTab::free_raw`], possibly by a remote request.
    pub fn into_raw(self) -> (usize, usize) {
        let (addr, len) = (self.addr, self.len);
        let _leaked = std::mem::ManuallyDrop::new(self);
        (addr, len)
    }
}

impl Drop for RegBuf {
    fn drop(&mut self) {
        if let RegOrigin::Arena(a) = &self.origin {
            a.free(self.addr, self.len);
        }
    }
}

// =============================================================================
// Registration table
// =============================================================================

pub(crate) struct MemTab {
    scalable: bool,
    /// Local buffers must be registered before use as RMA sources.
    mr_local: bool,
    regions: Vec<MemEntry>,
    /// Keeps registrations alive for the life of the table.
    _mrs: Vec<MemoryRegion>,
    /// Per-node replica of every node's table; empty in scalable mode.
    map: Vec<Vec<MemEntry>>,
    arena: Option<Arena>,
    num_nodes: usize,
}

impl MemTab {
    pub fn new(
        domain: &Domain,
        ctx: &CtxTab,
        oob: &dyn OutOfBand,
        num_nodes: usize,
        fixed_heap: Option<(usize, usize)>,
    ) -> Result<MemTab> {
        let mr_mode = domain.info().domain_attr.mr_mode;
        let basic_bits =
            MrMode::LOCAL | MrMode::VIRT_ADDR | MrMode::PROV_KEY | MrMode::ALLOCATED;
        let scalable = (mr_mode & basic_bits).is_empty() && fixed_heap.is_none();
        let mr_local = mr_mode.contains(MrMode::LOCAL);
        let virt = mr_mode.contains(MrMode::VIRT_ADDR);
        let prov_key = mr_mode.contains(MrMode::PROV_KEY);

        let mut regions: Vec<MemEntry> = Vec::new();
        let mut arena = None;

        if scalable {
            regions.push(MemEntry {
                addr: 0,
                base: 0,
                size: usize::MAX,
                key: 0,
            });
        } else {
            let (heap_addr, heap_size) = fixed_heap.ok_or_else(|| Error::NoFixedHeap {
                prov_name: domain.info().fabric_attr.prov_name.clone(),
            })?;
            regions.push(MemEntry {
                addr: heap_addr,
                base: if virt { 0 } else { heap_addr },
                size: heap_size,
                key: 0,
            });
            // The layer's own scratch (bounce buffers, done bytes,
            // barrier flags) comes from the global allocator, not the
            // caller's heap, so it gets its own region.
            let a = Arena::new(ARENA_SIZE);
            regions.push(MemEntry {
                addr: a.base(),
                base: if virt { 0 } else { a.base() },
                size: a.len(),
                key: 0,
            });
            arena = Some(a);
        }
        assert!(regions.len() <= MAX_MR);

        let mut access = Access::RECV | Access::REMOTE_READ | Access::REMOTE_WRITE;
        if mr_local {
            access |= Access::SEND | Access::READ | Access::WRITE;
        }

        let mut mrs = Vec::new();
        for (i, r) in regions.iter_mut().enumerate() {
            tracing::debug!(
                region = i,
                addr = format_args!("{:#x}", r.addr),
                size = format_args!("{:#x}", r.size),
                "registering memory region"
            );
            // Safety: the region is either the whole address space
            // (scalable), the caller-pinned fixed heap, or the arena
            // backing owned by this table; all outlive the table.
            let mr = unsafe {
                domain.register(
                    r.addr as *mut u8,
                    r.size,
                    access,
                    if prov_key { 0 } else { i as u64 },
                )
            }
            .map_err(Error::Io)?;
            r.key = mr.key();
            if !prov_key && mr.key() != i as u64 {
                return Err(Error::OobMismatch(format!(
                    "provider ignored requested key {i}"
                )));
            }
            if mr_mode.contains(MrMode::ENDPOINT) {
                mr.bind(ctx.rx_rma_ep()).map_err(Error::Io)?;
                mr.enable().map_err(Error::Io)?;
            }
            mrs.push(mr);
        }

        // Share the tables around unless every address is implicitly
        // covered anyway.
        let map = if scalable {
            Vec::new()
        } else {
            let mine = encode_tab(&regions);
            let mut all = vec![0u8; TAB_BYTES * num_nodes];
            oob.all_gather(&mine, &mut all);
            (0..num_nodes)
                .map(|n| decode_tab(&all[n * TAB_BYTES..(n + 1) * TAB_BYTES]))
                .collect()
        };

        Ok(MemTab {
            scalable,
            mr_local,
            regions,
            _mrs: mrs,
            map,
            arena,
            num_nodes,
        })
    }

    pub fn scalable(&self) -> bool {
        self.scalable
    }

    /// Whether a local buffer can be used directly as a transfer
    /// source/target. Always true unless the provider demands local
    /// registration.
    pub fn local_covered(&self, addr: usize, size: usize) -> bool {
        if !self.mr_local {
            return true;
        }
        self.covered(&self.regions, addr, size).is_some()
    }

    /// Resolve a remote address to `(key, offset)` against `node`'s
    /// replica of the registration table.
    pub fn remote_key(&self, node: usize, addr: usize, size: usize) -> Option<(u64, u64)> {
        if self.scalable {
            return Some((0, addr as u64));
        }
        debug_assert!(node < self.num_nodes);
        let entry = self.covered(&self.map[node], addr, size)?;
        Some((entry.key, (addr - entry.base) as u64))
    }

    /// Resolve a local address the same way peers would.
    pub fn local_key(&self, addr: usize, size: usize) -> Option<(u64, u64)> {
        if self.scalable {
            return Some((0, addr as u64));
        }
        let entry = self.covered(&self.regions, addr, size)?;
        Some((entry.key, (addr - entry.base) as u64))
    }

    fn covered<'t>(&self, tab: &'t [MemEntry], addr: usize, size: usize) -> Option<&'t MemEntry> {
        tab.iter().find(|e| {
            addr >= e.addr && e.size.checked_sub(addr - e.addr).is_some_and(|r| r >= size)
        })
    }

    /// Allocate registered scratch with a stable address.
    pub fn alloc_bounce(&self, size: usize) -> RegBuf {
        match &self.arena {
            None => {
                let b = vec![0u8; size].into_boxed_slice();
                RegBuf {
                    addr: b.as_ptr() as usize,
                    len: size,
                    origin: RegOrigin::Heap(b),
                }
            }
            Some(a) => {
                let addr = a
                    .alloc(size)
                    .unwrap_or_else(|| panic!("registered scratch arena exhausted ({size} B)"));
                RegBuf {
                    addr,
                    len: size,
                    origin: RegOrigin::Arena(a.clone()),
                }
            }
        }
    }

    /// Free memory previously leaked with [`RegBuf::into_raw`]. The
    /// request may arrive from a remote node (payload-copy release).
    pub fn free_raw(&self, addr: usize, len: usize) {
        if let Some(a) = &self.arena {
            if a.contains(addr) {
                a.free(addr, len);
                return;
            }
        }
        // Safety: the allocation was produced by `alloc_bounce` in
        // scalable mode (a boxed slice of exactly `len` bytes) and
        // leaked via `into_raw`.
        unsafe {
            drop(Box::from_raw(std::ptr::slice_from_raw_parts_mut(
                addr as *mut u8,
                len,
            )));
        }
    }

    pub fn io_err_unreachable(&self, node: usize, addr: usize, size: usize) -> io::Error {
        io::Error::new(
            io::ErrorKind::NotFound,
            format!("address {addr:#x}+{size:#x} on node {node} is not remotely accessible"),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn arena_alloc_free_coalesce() {
        let a = Arena::new(1024);
        let p1 = a.alloc(100).unwrap();
        let p2 = a.alloc(200).unwrap();
        let p3 = a.alloc(300).unwrap();
        a.free(p2, 200);
        a.free(p1, 100);
        a.free(p3, 300);
        // After coalescing everything, a full-size alloc succeeds.
        let p4 = a.alloc(1024).unwrap();
        assert_eq!(p4, a.base());
        a.free(p4, 1024);
    }

    #[test]
    fn arena_exhaustion() {
        let a = Arena::new(64);
        assert!(a.alloc(64).is_some());
        assert!(a.alloc(16).is_none());
    }

    #[test]
    fn tab_codec_round_trip() {
        let entries = vec![
            MemEntry {
                addr: 0x1000,
                base: 0,
                size: 0x800,
                key: 3,
            },
            MemEntry {
                addr: 0x9000,
                base: 0x9000,
                size: 0x100,
                key: 7,
            },
        ];
        let decoded = decode_tab(&encode_tab(&entries));
        assert_eq!(decoded.len(), 2);
        assert_eq!(decoded[0].addr, 0x1000);
        assert_eq!(decoded[1].key, 7);
    }
}
