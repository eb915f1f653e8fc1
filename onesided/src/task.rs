//! Tasking-layer seam and task-private communication state.
//!
//! The runtime does not own threads or tasks; a tasking layer supplies
//! them through the [`Tasking`] trait. The default [`ThreadTasking`]
//! backs every task with one OS thread, which makes the thread-local
//! block below exactly task-private. A multiplexing tasking layer must
//! pin tasks to fixed threads (`is_fixed_thread`) before transmit
//! contexts may be bound.

use std::cell::{Cell, RefCell};
use std::sync::atomic::Ordering;

use nodeset::Bitmap;

use crate::buff::{AmoNfBuff, GetBuff, PutBuff};
use crate::mem::RegBuf;

/// Operations the communication layer requires of the tasking layer.
pub trait Tasking: Send + Sync + 'static {
    /// Spawn the dedicated communication task (the AM handler).
    fn create_comm_task(&self, f: Box<dyn FnOnce() + Send>);

    /// Spawn a task moved here by a remote node.
    fn start_moved_task(&self, f: Box<dyn FnOnce() + Send>);

    /// Let another task run.
    fn yield_now(&self);

    /// Is the calling thread stable for the life of the process?
    fn is_fixed_thread(&self) -> bool;

    /// Number of fixed threads, 0 when the layer has none.
    fn fixed_num_threads(&self) -> usize;

    /// Maximum useful parallelism.
    fn max_par(&self) -> usize;
}

thread_local! {
    static FIXED_THREAD: Cell<bool> = const { Cell::new(false) };
}

/// Thread-per-task tasking layer.
pub struct ThreadTasking {
    fixed_threads: usize,
}

impl ThreadTasking {
    /// A layer with no fixed threads: transmit contexts float.
    pub fn new() -> Self {
        Self { fixed_threads: 0 }
    }

    /// A layer whose application threads are fixed. Each of the
    /// `fixed_threads` application threads must call
    /// [`ThreadTasking::mark_fixed_thread`] before communicating.
    pub fn with_fixed_threads(fixed_threads: usize) -> Self {
        Self { fixed_threads }
    }

    /// Declare the calling thread permanently associated with its task.
    pub fn mark_fixed_thread() {
        FIXED_THREAD.with(|f| f.set(true));
    }
}

impl Default for ThreadTasking {
    fn default() -> Self {
        Self::new()
    }
}

impl Tasking for ThreadTasking {
    fn create_comm_task(&self, f: Box<dyn FnOnce() + Send>) {
        std::thread::Builder::new()
            .name("am-handler".to_string())
            .spawn(f)
            .expect("spawning comm task");
    }

    fn start_moved_task(&self, f: Box<dyn FnOnce() + Send>) {
        std::thread::Builder::new()
            .name("moved-task".to_string())
            .spawn(f)
            .expect("spawning moved task");
    }

    fn yield_now(&self) {
        std::thread::yield_now();
    }

    fn is_fixed_thread(&self) -> bool {
        FIXED_THREAD.with(|f| f.get())
    }

    fn fixed_num_threads(&self) -> usize {
        self.fixed_threads
    }

    fn max_par(&self) -> usize {
        if self.fixed_threads > 0 {
            self.fixed_threads
        } else {
            std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1)
        }
    }
}

/// Per-task communication state.
///
/// Lives in thread-local storage, created lazily on first use and
/// keyed by runtime instance in `with_task_prv`.
#[derive(Default)]
pub(crate) struct TaskPrv {
    /// Done byte for a delayed-blocking AM, lazily allocated from
    /// registered scratch so remote PUTs can land in it.
    pub delayed_done: RefCell<Option<RegBuf>>,
    /// A delayed-blocking AM is outstanding.
    pub am_done_pending: Cell<bool>,
    /// The task has entered its ending sequence.
    pub task_is_ending: Cell<bool>,
    /// Nodes holding injected PUTs not yet forced visible.
    pub put_bitmap: RefCell<Option<Bitmap>>,
    /// Source byte for done-indicator PUTs sent from this thread.
    pub done_src: RefCell<Option<RegBuf>>,
    pub put_buff: RefCell<Option<Box<PutBuff>>>,
    pub get_buff: RefCell<Option<Box<GetBuff>>>,
    pub amo_nf_buff: RefCell<Option<Box<AmoNfBuff>>>,
}

thread_local! {
    static TASK_PRV_UID: Cell<usize> = const { Cell::new(usize::MAX) };
    static TASK_PRV: TaskPrv = TaskPrv::default();
}

/// Run `f` with the calling task's private state for `comm`'s job.
///
/// The state is keyed by runtime instance so a pooled thread touching
/// a second job (as test harness threads do) starts clean.
pub(crate) fn with_task_prv<R>(comm: &crate::Comm, f: impl FnOnce(&TaskPrv) -> R) -> R {
    TASK_PRV_UID.with(|uid| {
        if uid.get() != comm.uid() {
            TASK_PRV.with(|prv| prv.reset());
            uid.set(comm.uid());
        }
    });
    TASK_PRV.with(f)
}

impl TaskPrv {
    /// Forget all state; the thread is starting over against a
    /// different runtime instance.
    fn reset(&self) {
        *self.delayed_done.borrow_mut() = None;
        self.am_done_pending.set(false);
        self.task_is_ending.set(false);
        *self.put_bitmap.borrow_mut() = None;
        *self.done_src.borrow_mut() = None;
        *self.put_buff.borrow_mut() = None;
        *self.get_buff.borrow_mut() = None;
        *self.amo_nf_buff.borrow_mut() = None;
    }

    /// Address of the delayed-done byte, allocating it on first use.
    pub fn delayed_done_addr(&self, comm: &crate::Comm) -> usize {
        let mut slot = self.delayed_done.borrow_mut();
        if slot.is_none() {
            *slot = Some(comm.mem().alloc_bounce(1));
        }
        slot.as_ref().unwrap().addr()
    }

    /// Zero the delayed-done byte with release ordering.
    pub fn reset_delayed_done(&self) {
        let slot = self.delayed_done.borrow();
        let addr = slot.as_ref().unwrap().addr();
        // Safety: the byte lives in registered scratch owned by this
        // task and is only written remotely via one-byte PUTs.
        unsafe { std::sync::atomic::AtomicU8::from_ptr(addr as *mut u8) }
            .store(0, Ordering::Release);
    }
}
