//! Completion queues, counters, and poll/wait sets.
//!
//! Transmit completions carry only the caller's 64-bit context.
//! Receive completions describe where in a posted multi-receive buffer
//! a message landed, plus a flag telling the consumer that the buffer
//! has been released and the next posted one is now in use.

use std::collections::VecDeque;
use std::io;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::time::Duration;

use bitflags::bitflags;

/// A transmit completion event.
#[derive(Debug, Clone, Copy)]
pub struct TxEntry {
    /// Context value supplied when the operation was posted.
    pub context: u64,
}

bitflags! {
    /// Flags on a receive completion.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct RxFlags: u32 {
        /// A message was received; `buf`/`len` describe it.
        const RECV = 1 << 0;
        /// The multi-receive buffer is exhausted and released.
        const MULTI_RECV = 1 << 1;
    }
}

/// A receive completion event.
#[derive(Debug, Clone, Copy)]
pub struct RxEntry {
    pub flags: RxFlags,
    /// Address of the received message inside the posted buffer.
    /// Zero when the entry only signals buffer release.
    pub buf: usize,
    /// Length of the received message in bytes.
    pub len: usize,
}

/// Internal receive-queue item: an event or a deferred error.
#[derive(Debug, Clone, Copy)]
pub(crate) enum RxItem {
    Entry(RxEntry),
    /// A message did not fit the posted buffer at all.
    Truncated { msg_len: usize, buf_len: usize },
}

/// Signal shared between event queues and a wait set.
pub(crate) struct WaitSignal {
    state: Mutex<bool>,
    cv: Condvar,
}

impl WaitSignal {
    fn new() -> Self {
        Self {
            state: Mutex::new(false),
            cv: Condvar::new(),
        }
    }

    pub(crate) fn notify(&self) {
        let mut armed = self.state.lock().unwrap();
        *armed = true;
        self.cv.notify_all();
    }

    fn wait(&self, timeout: Duration) -> bool {
        let mut armed = self.state.lock().unwrap();
        if !*armed {
            let (guard, _res) = self.cv.wait_timeout(armed, timeout).unwrap();
            armed = guard;
        }
        let was = *armed;
        *armed = false;
        was
    }
}

/// Shared event queue behind both CQ flavors.
pub(crate) struct EventQueue<T> {
    q: Mutex<VecDeque<T>>,
    signal: Mutex<Option<Arc<WaitSignal>>>,
}

impl<T> EventQueue<T> {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self {
            q: Mutex::new(VecDeque::new()),
            signal: Mutex::new(None),
        })
    }

    pub(crate) fn push(&self, item: T) {
        self.q.lock().unwrap().push_back(item);
        if let Some(sig) = self.signal.lock().unwrap().as_ref() {
            sig.notify();
        }
    }

    pub(crate) fn pop(&self) -> Option<T> {
        self.q.lock().unwrap().pop_front()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.q.lock().unwrap().is_empty()
    }

    fn attach(&self, sig: &Arc<WaitSignal>) {
        *self.signal.lock().unwrap() = Some(Arc::clone(sig));
    }
}

/// Transmit completion queue.
pub struct TxCq {
    pub(crate) sh: Arc<EventQueue<TxEntry>>,
    /// Capacity hint; the queue itself is unbounded.
    pub(crate) size: usize,
}

impl TxCq {
    /// Read up to `out.len()` completions. Returns the count read.
    pub fn read(&self, out: &mut [TxEntry]) -> io::Result<usize> {
        let mut n = 0;
        while n < out.len() {
            match self.sh.pop() {
                Some(e) => {
                    out[n] = e;
                    n += 1;
                }
                None => break,
            }
        }
        Ok(n)
    }

    pub fn size(&self) -> usize {
        self.size
    }
}

/// Receive completion queue.
pub struct RxCq {
    pub(crate) sh: Arc<EventQueue<RxItem>>,
}

impl RxCq {
    /// Read up to `out.len()` completions.
    ///
    /// A truncation error is fatal to the endpoint: it means a message
    /// could not fit the posted multi-receive buffer, which implies a
    /// misconfigured minimum buffer reservation.
    pub fn read(&self, out: &mut [RxEntry]) -> io::Result<usize> {
        let mut n = 0;
        while n < out.len() {
            match self.sh.pop() {
                Some(RxItem::Entry(e)) => {
                    out[n] = e;
                    n += 1;
                }
                Some(RxItem::Truncated { msg_len, buf_len }) => {
                    return Err(io::Error::other(format!(
                        "multi-recv buffer truncation: message len {msg_len}, \
                         buffer len {buf_len}"
                    )));
                }
                None => break,
            }
        }
        Ok(n)
    }
}

/// Completion counter: counts operations completed on a context.
pub struct Counter {
    pub(crate) count: Arc<AtomicU64>,
}

impl Counter {
    pub fn read(&self) -> u64 {
        self.count.load(Ordering::Acquire)
    }
}

/// Source registered with a poll set.
pub(crate) enum PollSrc {
    Tx(Arc<EventQueue<TxEntry>>),
    Rx(Arc<EventQueue<RxItem>>),
}

/// A set of event sources that can be checked in one call.
///
/// `poll` returns the caller-chosen ids of sources with pending events.
pub struct PollSet {
    srcs: Mutex<Vec<(u64, PollSrc)>>,
}

impl PollSet {
    pub(crate) fn new() -> Self {
        Self {
            srcs: Mutex::new(Vec::new()),
        }
    }

    pub fn add_tx(&self, id: u64, cq: &TxCq) {
        self.srcs.lock().unwrap().push((id, PollSrc::Tx(Arc::clone(&cq.sh))));
    }

    pub fn add_rx(&self, id: u64, cq: &RxCq) {
        self.srcs.lock().unwrap().push((id, PollSrc::Rx(Arc::clone(&cq.sh))));
    }

    /// Collect ids of sources with at least one pending event.
    pub fn poll(&self, out: &mut Vec<u64>) -> usize {
        out.clear();
        for (id, src) in self.srcs.lock().unwrap().iter() {
            let ready = match src {
                PollSrc::Tx(q) => !q.is_empty(),
                PollSrc::Rx(q) => !q.is_empty(),
            };
            if ready {
                out.push(*id);
            }
        }
        out.len()
    }
}

/// Blocks until any attached event queue receives an event.
pub struct WaitSet {
    pub(crate) sig: Arc<WaitSignal>,
}

impl WaitSet {
    pub(crate) fn new() -> Self {
        Self {
            sig: Arc::new(WaitSignal::new()),
        }
    }

    pub(crate) fn attach_tx(&self, cq: &TxCq) {
        cq.sh.attach(&self.sig);
    }

    pub(crate) fn attach_rx(&self, cq: &RxCq) {
        cq.sh.attach(&self.sig);
    }

    /// Wait up to `timeout` for an event. Returns true if signalled.
    pub fn wait(&self, timeout: Duration) -> bool {
        self.sig.wait(timeout)
    }
}
