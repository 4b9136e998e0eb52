//! Anonymous pipes.
//!
//! A pipe is a FIFO vnode over a 4 KiB ring. Readers block (cancellably)
//! while the ring is empty and writers remain; writers block while it is
//! full and readers remain. The last writer dropping its open file wakes
//! readers into EOF; writing with no readers left is `EPIPE`.

use crate::errno::{Errno, Result};
use crate::fs::file::FileMode;
use crate::fs::vnode::{Stat, Vnode, VnodeKind};
use crate::sync::spinlock::Spinlock;
use crate::task::sched::{self, WaitQueue};
use alloc::collections::VecDeque;
use alloc::sync::Arc;
use core::sync::atomic::{AtomicUsize, Ordering};

/// Ring capacity in bytes.
pub const PIPE_BUF_SIZE: usize = 4096;

static NEXT_PIPE_INO: AtomicUsize = AtomicUsize::new(1);

struct PipeState {
    buf: VecDeque<u8>,
    /// Live open files holding the read end.
    readers: usize,
    /// Live open files holding the write end.
    writers: usize,
}

pub struct PipeVnode {
    ino: usize,
    state: Spinlock<PipeState>,
    readers_q: WaitQueue,
    writers_q: WaitQueue,
}

impl PipeVnode {
    /// A fresh pipe with no ends open yet; `opened` registers each end.
    pub fn create() -> Arc<PipeVnode> {
        Arc::new(PipeVnode {
            ino: NEXT_PIPE_INO.fetch_add(1, Ordering::Relaxed),
            state: Spinlock::new(PipeState {
                buf: VecDeque::with_capacity(PIPE_BUF_SIZE),
                readers: 0,
                writers: 0,
            }),
            readers_q: WaitQueue::new(),
            writers_q: WaitQueue::new(),
        })
    }

    /// Register an open file on this pipe.
    pub fn opened(&self, mode: FileMode) {
        let mut st = self.state.lock();
        if mode.contains(FileMode::READ) {
            st.readers += 1;
        }
        if mode.contains(FileMode::WRITE) {
            st.writers += 1;
        }
    }

    /// Bytes currently buffered.
    pub fn buffered(&self) -> usize {
        self.state.lock().buf.len()
    }
}

impl Vnode for PipeVnode {
    fn ino(&self) -> usize {
        self.ino
    }

    fn kind(&self) -> VnodeKind {
        VnodeKind::Fifo
    }

    fn len(&self) -> usize {
        self.buffered()
    }

    /// Pipe reads ignore the cursor.
    fn read(&self, _off: usize, buf: &mut [u8]) -> Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        loop {
            let drained = {
                let mut st = self.state.lock();
                if !st.buf.is_empty() {
                    let n = core::cmp::min(buf.len(), st.buf.len());
                    for slot in buf[..n].iter_mut() {
                        *slot = st.buf.pop_front().expect("ring emptied mid-drain");
                    }
                    Some(n)
                } else if st.writers == 0 {
                    Some(0) // EOF
                } else {
                    None
                }
            };
            match drained {
                Some(n) => {
                    if n > 0 {
                        sched::broadcast_on(&self.writers_q);
                    }
                    return Ok(n);
                }
                None => sched::cancellable_sleep_on(&self.readers_q)?,
            }
        }
    }

    /// Pipe writes ignore the cursor and block until everything is in the
    /// ring (or the readers disappear).
    fn write(&self, _off: usize, data: &[u8]) -> Result<usize> {
        let mut written = 0;
        while written < data.len() {
            let progressed = {
                let mut st = self.state.lock();
                if st.readers == 0 {
                    return Err(Errno::EPIPE);
                }
                let space = PIPE_BUF_SIZE - st.buf.len();
                if space > 0 {
                    let n = core::cmp::min(space, data.len() - written);
                    for &b in &data[written..written + n] {
                        st.buf.push_back(b);
                    }
                    written += n;
                    true
                } else {
                    false
                }
            };
            if progressed {
                sched::broadcast_on(&self.readers_q);
            } else {
                sched::cancellable_sleep_on(&self.writers_q)?;
            }
        }
        Ok(written)
    }

    fn stat(&self) -> Result<Stat> {
        Ok(Stat {
            ino: self.ino,
            kind: VnodeKind::Fifo,
            len: self.buffered(),
            nlink: 0,
        })
    }

    /// An open file on this pipe went away; retire its end and wake the
    /// other side so it can observe EOF / EPIPE.
    fn release(&self, mode: FileMode) {
        let (wake_readers, wake_writers) = {
            let mut st = self.state.lock();
            let mut wr = false;
            let mut ww = false;
            if mode.contains(FileMode::READ) {
                st.readers -= 1;
                ww = st.readers == 0;
            }
            if mode.contains(FileMode::WRITE) {
                st.writers -= 1;
                wr = st.writers == 0;
            }
            (wr, ww)
        };
        if wake_readers {
            sched::broadcast_on(&self.readers_q);
        }
        if wake_writers {
            sched::broadcast_on(&self.writers_q);
        }
    }
}
