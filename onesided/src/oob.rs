//! Out-of-band bootstrap channel.
//!
//! Used only during startup for address and key exchange, plus one
//! barrier during shutdown. The trait is the seam for a job launcher's
//! channel (PMI, MPI, TCP); the in-process mesh implementation serves
//! clusters living in one OS process.

use std::sync::{Arc, Condvar, Mutex};

/// The out-of-band collective surface.
pub trait OutOfBand: Send + Sync {
    /// Gather `mine` from every node into `all`, ordered by node id.
    /// `all.len()` must be `mine.len() * num_nodes`.
    fn all_gather(&self, mine: &[u8], all: &mut [u8]);

    /// Broadcast `buf` from `root` to every node.
    fn broadcast(&self, buf: &mut [u8], root: usize);

    /// Block until every node has arrived.
    fn barrier(&self);
}

struct RoundState {
    slots: Vec<Option<Vec<u8>>>,
    arrived: usize,
    consumed: usize,
    ready: bool,
}

struct MeshShared {
    n: usize,
    state: Mutex<RoundState>,
    cv: Condvar,
}

/// In-process mesh: one shared rendezvous per cluster.
pub struct MeshOob {
    id: usize,
    sh: Arc<MeshShared>,
}

impl MeshOob {
    /// Create the OOB channels for an `n`-node in-process cluster.
    pub fn cluster(n: usize) -> Vec<MeshOob> {
        let sh = Arc::new(MeshShared {
            n,
            state: Mutex::new(RoundState {
                slots: vec![None; n],
                arrived: 0,
                consumed: 0,
                ready: false,
            }),
            cv: Condvar::new(),
        });
        (0..n)
            .map(|id| MeshOob {
                id,
                sh: Arc::clone(&sh),
            })
            .collect()
    }

    /// One collective round: contribute, wait for everyone, read all
    /// contributions, and leave only after the round is reset.
    fn round(&self, contribution: Vec<u8>) -> Vec<Vec<u8>> {
        let sh = &self.sh;
        let mut st = sh.state.lock().unwrap();

        // Wait out a previous round that is still being drained.
        while st.ready {
            st = sh.cv.wait(st).unwrap();
        }

        st.slots[self.id] = Some(contribution);
        st.arrived += 1;
        if st.arrived == sh.n {
            st.ready = true;
            sh.cv.notify_all();
        } else {
            while !st.ready {
                st = sh.cv.wait(st).unwrap();
            }
        }

        let out: Vec<Vec<u8>> = st.slots.iter().map(|s| s.clone().unwrap()).collect();

        st.consumed += 1;
        if st.consumed == sh.n {
            st.slots.iter_mut().for_each(|s| *s = None);
            st.arrived = 0;
            st.consumed = 0;
            st.ready = false;
            sh.cv.notify_all();
        }
        out
    }
}

impl OutOfBand for MeshOob {
    fn all_gather(&self, mine: &[u8], all: &mut [u8]) {
        assert_eq!(all.len(), mine.len() * self.sh.n);
        let parts = self.round(mine.to_vec());
        for (i, part) in parts.iter().enumerate() {
            all[i * mine.len()..(i + 1) * mine.len()].copy_from_slice(part);
        }
    }

    fn broadcast(&self, buf: &mut [u8], root: usize) {
        let mine = if self.id == root {
            buf.to_vec()
        } else {
            Vec::new()
        };
        let parts = self.round(mine);
        if self.id != root {
            buf.copy_from_slice(&parts[root]);
        }
    }

    fn barrier(&self) {
        let _ = self.round(Vec::new());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn all_gather_orders_by_id() {
        let oobs = MeshOob::cluster(4);
        let handles: Vec<_> = oobs
            .into_iter()
            .enumerate()
            .map(|(id, oob)| {
                thread::spawn(move || {
                    let mine = [id as u8; 3];
                    let mut all = [0u8; 12];
                    oob.all_gather(&mine, &mut all);
                    for n in 0..4 {
                        assert_eq!(&all[n * 3..n * 3 + 3], &[n as u8; 3]);
                    }
                    // A second round must not see stale state.
                    let mine2 = [10 + id as u8];
                    let mut all2 = [0u8; 4];
                    oob.all_gather(&mine2, &mut all2);
                    assert_eq!(all2, [10, 11, 12, 13]);
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
    }

    #[test]
    fn broadcast_from_nonzero_root() {
        let oobs = MeshOob::cluster(3);
        let handles: Vec<_> = oobs
            .into_iter()
            .enumerate()
            .map(|(id, oob)| {
                thread::spawn(move || {
                    let mut buf = if id == 2 { vec![7u8, 8, 9] } else { vec![0u8; 3] };
                    oob.broadcast(&mut buf, 2);
                    assert_eq!(buf, vec![7, 8, 9]);
                    oob.barrier();
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
    }
}
