//! Split-phase tree barrier and job shutdown.
//!
//! A fan-out-64 tree rooted at node 0. Notification propagates up:
//! each node waits for its children's notify flags, then PUTs a 1 into
//! its slot in its parent's flag array. Release propagates down: after
//! its own release (or, for the root, after all children notify), a
//! node zeroes its flags and PUTs a 1 into each child's release flag,
//! leaving every flag 0 for the next round. Waiters task-yield between
//! polls because the PUTs may need to run via active message.

use std::sync::atomic::{AtomicU32, Ordering};

use crate::mem::{MemTab, RegBuf};
use crate::oob::OutOfBand;
use crate::Comm;

/// Tree fan-out.
pub(crate) const BAR_TREE_NUM_CHILDREN: usize = 64;

const NOTIFY_BYTES: usize = BAR_TREE_NUM_CHILDREN * 4;
const RELEASE_OFFSET: usize = NOTIFY_BYTES;
const BAR_INFO_BYTES: usize = NOTIFY_BYTES + 4;

/// Shape of the node graph below and above one node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct TreeShape {
    pub child_first: usize,
    pub num_children: usize,
    pub parent: usize,
}

pub(crate) fn tree_shape(node: usize, num_nodes: usize) -> TreeShape {
    let child_first = BAR_TREE_NUM_CHILDREN * node + 1;
    let num_children = if child_first >= num_nodes {
        0
    } else {
        BAR_TREE_NUM_CHILDREN.min(num_nodes - child_first)
    };
    let parent = node.saturating_sub(1) / BAR_TREE_NUM_CHILDREN;
    TreeShape {
        child_first,
        num_children,
        parent,
    }
}

/// Per-node barrier flags plus the addresses of everyone else's.
pub(crate) struct BarState {
    info: RegBuf,
    map: Vec<u64>,
    shape: TreeShape,
}

impl BarState {
    pub fn new(mem: &MemTab, oob: &dyn OutOfBand, node: usize, num_nodes: usize) -> BarState {
        let info = mem.alloc_bounce(BAR_INFO_BYTES);
        // All flags must start 0.
        // Safety: fresh scratch of BAR_INFO_BYTES bytes.
        unsafe { std::ptr::write_bytes(info.as_mut_ptr(), 0, BAR_INFO_BYTES) };
        let mine = (info.addr() as u64).to_le_bytes();
        let mut all = vec![0u8; 8 * num_nodes];
        oob.all_gather(&mine, &mut all);
        let map = (0..num_nodes)
            .map(|n| u64::from_le_bytes(all[n * 8..(n + 1) * 8].try_into().unwrap()))
            .collect();
        BarState {
            info,
            map,
            shape: tree_shape(node, num_nodes),
        }
    }

    fn flag(&self, offset: usize) -> &AtomicU32 {
        // Safety: offset < BAR_INFO_BYTES and 4-aligned; the flags are
        // written remotely by 4-byte PUTs and read here atomically.
        unsafe { AtomicU32::from_ptr((self.info.addr() + offset) as *mut u32) }
    }

    fn child_notify(&self, i: usize) -> &AtomicU32 {
        self.flag(i * 4)
    }

    fn parent_release(&self) -> &AtomicU32 {
        self.flag(RELEASE_OFFSET)
    }

    /// Address of my notify slot in `parent`'s flag array.
    fn parent_notify_addr(&self, node: usize) -> usize {
        let par_child = (node - 1) % BAR_TREE_NUM_CHILDREN;
        self.map[self.shape.parent] as usize + par_child * 4
    }

    fn child_release_addr(&self, child: usize) -> usize {
        self.map[child] as usize + RELEASE_OFFSET
    }
}

impl Comm {
    /// Block until every node reaches the barrier.
    pub fn barrier(&self) {
        if self.num_nodes() == 1 {
            return;
        }

        // Before the handlers are alive, or on the thread that ran
        // initialization, the tree's PUT traffic can't flow; fall back
        // to the out-of-band barrier.
        if std::thread::current().id() == self.init_thread() || self.am_handlers_active() == 0 {
            tracing::trace!(node = self.node_id(), "barrier via out-of-band");
            self.oob().barrier();
            return;
        }

        tracing::trace!(node = self.node_id(), "barrier");

        // Our own outstanding non-fetching AMOs and PUTs must be
        // visible first; other tasks' operations are the caller's
        // responsibility.
        self.retire_delayed_am_done(false);
        self.wait_for_puts_vis_all_nodes(None, false);

        let bar = self.bar();
        let shape = bar.shape;

        // Phase 1: wait for the children to check in.
        for i in 0..shape.num_children {
            while bar.child_notify(i).load(Ordering::Acquire) == 0 {
                self.tasking().yield_now();
            }
        }

        let one: u32 = 1;

        if self.node_id() != 0 {
            // Phase 2: tell the parent, then wait to be released.
            let notify = bar.parent_notify_addr(self.node_id());
            // Safety: flag addresses were exchanged at init and stay
            // registered for the job's lifetime.
            unsafe {
                crate::rma::put(
                    self,
                    (&one as *const u32).cast(),
                    shape.parent,
                    notify,
                    4,
                )
            };
            while bar.parent_release().load(Ordering::Acquire) == 0 {
                self.tasking().yield_now();
            }
        }

        // Reset for the next round, then release the subtree.
        for i in 0..shape.num_children {
            bar.child_notify(i).store(0, Ordering::Release);
        }
        bar.parent_release().store(0, Ordering::Release);

        for i in 0..shape.num_children {
            let child = shape.child_first + i;
            let release = bar.child_release_addr(child);
            unsafe {
                crate::rma::put(
                    self,
                    (&one as *const u32).cast(),
                    child,
                    release,
                    4,
                )
            };
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn root_children_at_various_sizes() {
        assert_eq!(tree_shape(0, 1).num_children, 0);
        assert_eq!(tree_shape(0, 2).num_children, 1);
        // Fan-out 64: a 64-node job fills the root's child list short
        // by none; node 0 has min(64, N-1) children.
        assert_eq!(tree_shape(0, 64).num_children, 63);
        assert_eq!(tree_shape(0, 65).num_children, 64);
        assert_eq!(tree_shape(0, 200).num_children, 64);
    }

    #[test]
    fn deep_tree_parents() {
        let s = tree_shape(65, 200);
        assert_eq!(s.parent, 1);
        assert_eq!(tree_shape(1, 200).child_first, 65);
        // Node 65 is slot (65-1) % 64 == 0 of its parent.
        assert_eq!((65 - 1) % BAR_TREE_NUM_CHILDREN, 0);
    }

    #[test]
    fn leaf_has_no_children() {
        let s = tree_shape(150, 200);
        assert_eq!(s.num_children, 0);
        assert_eq!(s.parent, (150 - 1) / 64);
    }
}
