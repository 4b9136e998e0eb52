//! Sleeping mutex for thread context.
//!
//! NEVER lock or unlock one of these from interrupt context; contended
//! acquires put the caller to sleep. Unlock hands the mutex directly to the
//! head of the wait queue, so there is no unlocked window for a third thread
//! to race through.

use crate::errno::{Errno, Result};
use crate::sync::spinlock::Spinlock;
use crate::task::sched::{self, WaitQueue};
use crate::task::thread::{Thread, ThreadId};
use alloc::sync::Arc;

/// A non-recursive sleeping mutex. Locking a mutex the caller already holds
/// is a deadlock attempt and trips an assertion.
pub struct KMutex {
    holder: Spinlock<Option<ThreadId>>,
    waitq: WaitQueue,
}

impl KMutex {
    pub const fn new() -> KMutex {
        KMutex {
            holder: Spinlock::new(None),
            waitq: WaitQueue::new(),
        }
    }

    fn holder_id(&self) -> Option<ThreadId> {
        *self.holder.lock()
    }

    /// True iff the current thread holds this mutex.
    pub fn held_by_current(&self) -> bool {
        self.holder_id() == Some(sched::curthr().id())
    }

    /// Acquire the mutex, sleeping (non-cancellably) while it is held.
    pub fn lock(&self) {
        let me = sched::curthr();
        self.assert_not_holder(&me);
        let contended = {
            let mut holder = self.holder.lock();
            match *holder {
                None => {
                    *holder = Some(me.id());
                    false
                }
                Some(_) => true,
            }
        };
        if contended {
            // The unlocker hands us the mutex before waking us.
            sched::sleep_on(&self.waitq);
            assert!(self.held_by_current(), "woken without being handed the mutex");
        }
    }

    /// Like [`lock`](KMutex::lock), but the sleep is cancellable. If the
    /// acquire is cancelled after the mutex was already handed over (the
    /// unlock raced the cancellation), the mutex is released before
    /// reporting `EINTR`.
    pub fn lock_cancellable(&self) -> Result<()> {
        let me = sched::curthr();
        self.assert_not_holder(&me);
        if me.cancelled() {
            return Err(Errno::EINTR);
        }
        let contended = {
            let mut holder = self.holder.lock();
            match *holder {
                None => {
                    *holder = Some(me.id());
                    false
                }
                Some(_) => true,
            }
        };
        if contended {
            if let Err(e) = sched::cancellable_sleep_on(&self.waitq) {
                if self.held_by_current() {
                    self.unlock();
                }
                return Err(e);
            }
        }
        Ok(())
    }

    /// Release the mutex. If anybody is waiting, the thread at the head of
    /// the queue becomes the holder and is made runnable; this never blocks.
    pub fn unlock(&self) {
        let me = sched::curthr();
        {
            let mut holder = self.holder.lock();
            assert_eq!(*holder, Some(me.id()), "unlock by a thread that is not the holder");
            *holder = None;
        }
        if !self.waitq.is_empty() {
            let next = sched::wakeup_on(&self.waitq);
            *self.holder.lock() = Some(next.id());
        }
        assert!(!self.held_by_current());
    }

    fn assert_not_holder(&self, me: &Arc<Thread>) {
        assert!(
            self.holder_id() != Some(me.id()),
            "recursive mutex lock (deadlock attempt)"
        );
    }
}

impl Default for KMutex {
    fn default() -> Self {
        KMutex::new()
    }
}
