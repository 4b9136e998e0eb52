//! Cooperative scheduler: wait queues, the run queue, and `switch`.
//!
//! Single CPU, cooperative: a context switch happens only at explicit
//! suspension points (sleep, yield, mutex acquire, exit). The run queue is
//! shared with interrupt context, so every touch of it happens with the IPL
//! raised to HIGH; the outgoing thread's previous IPL is a stack local here
//! and is therefore restored when that thread resumes, which makes the IPL a
//! per-thread property across `switch`.
//!
//! Wait queues are FIFO: enqueue at the head, dequeue at the tail.

use crate::arch::context::context_switch;
use crate::arch::intr;
use crate::errno::{Errno, Result};
use crate::memory::pagetable;
use crate::sync::spinlock::Spinlock;
use crate::task::process::Process;
use crate::task::thread::{Thread, ThreadState, Wchan};
use alloc::collections::VecDeque;
use alloc::sync::Arc;

/// A queue of sleeping threads.
///
/// A thread's wait-channel back-pointer equals the queue it resides in, or
/// is null iff the thread is not sleeping.
pub struct WaitQueue {
    q: Spinlock<VecDeque<Arc<Thread>>>,
}

impl WaitQueue {
    pub const fn new() -> WaitQueue {
        WaitQueue { q: Spinlock::new(VecDeque::new()) }
    }

    pub fn is_empty(&self) -> bool {
        self.q.lock().is_empty()
    }

    pub fn len(&self) -> usize {
        self.q.lock().len()
    }

    /// Park `thr` on this queue in `state`. The thread must not already be
    /// on a queue.
    fn enqueue(&self, thr: Arc<Thread>, state: ThreadState) {
        {
            let mut inner = thr.inner.lock();
            assert!(inner.wchan.is_null(), "thread is already on a queue");
            inner.state = state;
            inner.wchan = Wchan(self as *const WaitQueue);
        }
        self.q.lock().push_front(thr);
    }

    /// Unpark the thread at the tail, clearing its wait channel.
    fn dequeue(&self) -> Option<Arc<Thread>> {
        let thr = self.q.lock().pop_back()?;
        thr.inner.lock().wchan = Wchan::NULL;
        Some(thr)
    }

    /// Remove a specific thread (cancellation path).
    fn remove(&self, thr: &Arc<Thread>) {
        let mut q = self.q.lock();
        let pos = q
            .iter()
            .position(|t| Arc::ptr_eq(t, thr))
            .expect("thread not on the queue its wait channel names");
        q.remove(pos);
        thr.inner.lock().wchan = Wchan::NULL;
    }
}

impl Default for WaitQueue {
    fn default() -> Self {
        WaitQueue::new()
    }
}

/// The run queue. Threads on it are in the `Run` state.
static RUN_QUEUE: WaitQueue = WaitQueue::new();

struct Current {
    thr: Arc<Thread>,
    proc: Arc<Process>,
}

static CURRENT: Spinlock<Option<Current>> = Spinlock::new(None);

/// Reset scheduler state for a fresh boot.
pub fn sched_init() {
    RUN_QUEUE.q.lock().clear();
    *CURRENT.lock() = None;
    intr::set_ipl(intr::IPL_LOW);
}

/// The currently executing thread. Panics outside thread context.
pub fn curthr() -> Arc<Thread> {
    CURRENT.lock().as_ref().expect("no current thread").thr.clone()
}

/// The currently executing process. Panics outside thread context.
pub fn curproc() -> Arc<Process> {
    CURRENT.lock().as_ref().expect("no current process").proc.clone()
}

/// True once the bootstrap has installed a current thread.
pub fn have_current() -> bool {
    CURRENT.lock().is_some()
}

/// Install the boot thread as current (bootstrap only).
pub fn set_current(thr: Arc<Thread>, proc: Arc<Process>) {
    let mut cur = CURRENT.lock();
    assert!(cur.is_none(), "current thread already installed");
    *cur = Some(Current { thr, proc });
}

/// Drop the current-thread reference (shutdown only).
pub fn clear_current() {
    *CURRENT.lock() = None;
}

/// Make `thr` runnable. It must not already be on the run queue.
pub fn make_runnable(thr: Arc<Thread>) {
    let old_ipl = intr::raise_ipl(intr::IPL_HIGH);
    {
        let inner = thr.inner.lock();
        assert!(
            !core::ptr::eq(inner.wchan.0, &RUN_QUEUE as *const WaitQueue),
            "thread is already on the run queue"
        );
    }
    RUN_QUEUE.enqueue(thr, ThreadState::Run);
    intr::set_ipl(old_ipl);
}

/// Put the current thread to sleep on `q` until `wakeup_on`/`broadcast_on`.
pub fn sleep_on(q: &WaitQueue) {
    q.enqueue(curthr(), ThreadState::Sleep);
    switch();
}

/// Like [`sleep_on`], but the sleep can be cancelled. Checks the cancelled
/// flag both before sleeping and after waking.
pub fn cancellable_sleep_on(q: &WaitQueue) -> Result<()> {
    let thr = curthr();
    if thr.cancelled() {
        return Err(Errno::EINTR);
    }
    q.enqueue(thr, ThreadState::SleepCancellable);
    switch();
    if curthr().cancelled() {
        return Err(Errno::EINTR);
    }
    Ok(())
}

/// Wake the thread at the tail of `q`. The queue must not be empty.
pub fn wakeup_on(q: &WaitQueue) -> Arc<Thread> {
    assert!(!q.is_empty(), "wakeup_on an empty queue");
    let thr = q.dequeue().expect("queue emptied underneath wakeup_on");
    {
        let state = thr.inner.lock().state;
        assert!(
            state == ThreadState::Sleep || state == ThreadState::SleepCancellable,
            "woken thread was not sleeping"
        );
    }
    make_runnable(thr.clone());
    thr
}

/// Wake every thread on `q`, in FIFO order. The caller stays runnable.
pub fn broadcast_on(q: &WaitQueue) {
    while !q.is_empty() {
        wakeup_on(q);
    }
}

/// Latch the cancelled flag on `thr` and, if it is in a cancellable sleep,
/// lift it out of its wait queue onto the run queue. A thread in a
/// non-cancellable sleep keeps sleeping; it observes the flag at its next
/// cancellable call.
pub fn cancel(thr: &Arc<Thread>) {
    let (state, wchan) = {
        let mut inner = thr.inner.lock();
        inner.cancelled = true;
        (inner.state, inner.wchan.0)
    };
    if state == ThreadState::SleepCancellable {
        assert!(!wchan.is_null(), "cancellable sleeper has no wait channel");
        // The queue outlives its sleepers; nothing ran since we read the
        // pointer, so it still names the queue the thread is on.
        let q = unsafe { &*wchan };
        q.remove(thr);
        make_runnable(thr.clone());
    }
}

/// Yield the CPU: requeue the current thread and pick the next one.
pub fn yield_now() {
    make_runnable(curthr());
    switch();
}

/// Suspend the current thread and run the next thread off the run queue.
///
/// If the run queue is empty, every thread is waiting for an interrupt: the
/// IPL is lowered so that interrupt can be delivered, the CPU waits for it,
/// and the dequeue is retried. The caller's IPL is saved on its own stack
/// and restored when it resumes.
pub fn switch() {
    let old_ipl = intr::raise_ipl(intr::IPL_HIGH);

    let next = loop {
        if let Some(t) = RUN_QUEUE.dequeue() {
            break t;
        }
        intr::set_ipl(intr::IPL_LOW);
        intr::wait();
        intr::raise_ipl(intr::IPL_HIGH);
    };

    let next_proc = next.proc().expect("runnable thread without a process");
    let new_ctx = next.ctx_ptr();

    // Reload the page-table base for the incoming address space.
    if let Some(pd) = next.pagedir() {
        pagetable::activate(pd);
    }

    let old_ctx = {
        let mut cur = CURRENT.lock();
        let prev = cur.take().expect("switch with no current thread");
        let old_ctx = prev.thr.ctx_ptr();
        *cur = Some(Current { thr: next, proc: next_proc });
        old_ctx
        // `prev` drops here: the outgoing thread survives on whatever queue
        // or process list holds it, and nothing runs before the context save
        // below completes.
    };

    unsafe { context_switch(old_ctx, new_ctx) };

    intr::set_ipl(old_ipl);
}
