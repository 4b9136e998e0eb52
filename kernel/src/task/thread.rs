//! Kernel threads.
//!
//! A thread owns its kernel stack (allocated from the page allocator) and a
//! saved context. All mutable bookkeeping (state, cancellation, wait channel,
//! return value, errno) sits behind a spinlock; the context itself is only
//! touched by the scheduler while the IPL is raised.

use crate::arch::context::Context;
use crate::arch::intr;
use crate::errno::Result;
use crate::memory::pagetable::PageDir;
use crate::memory::{phys, PAGE_SIZE};
use crate::sync::spinlock::Spinlock;
use crate::task::process::Process;
use crate::task::sched::{self, WaitQueue};
use alloc::boxed::Box;
use alloc::sync::{Arc, Weak};
use core::cell::UnsafeCell;
use core::sync::atomic::{AtomicU64, Ordering};

/// Kernel stack size in pages.
pub const DEFAULT_STACK_PAGES: usize = 32;

pub type ThreadId = u64;

static NEXT_TID: AtomicU64 = AtomicU64::new(1);

/// Thread run states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThreadState {
    /// Not yet attached to the scheduler.
    NoState,
    /// Running or on the run queue.
    Run,
    /// Sleeping on a wait queue; only wakeup/broadcast can lift it out.
    Sleep,
    /// Sleeping on a wait queue; cancellation can also lift it out.
    SleepCancellable,
    /// Exited; waiting to be reaped along with its process.
    Exited,
}

/// A kernel stack allocated with `page_alloc_n`, freed on drop.
struct KernelStack {
    base: phys::PhysAddr,
    pages: usize,
}

impl KernelStack {
    fn alloc() -> Result<KernelStack> {
        let base = phys::page_alloc_n(DEFAULT_STACK_PAGES)?;
        Ok(KernelStack { base, pages: DEFAULT_STACK_PAGES })
    }

    /// One past the highest usable byte; page-aligned, hence 16-aligned.
    fn top(&self) -> usize {
        self.base.as_usize() + self.pages * PAGE_SIZE
    }
}

impl Drop for KernelStack {
    fn drop(&mut self) {
        phys::page_free_n(self.base, self.pages);
    }
}

/// The wait queue a sleeping thread is parked on. Null when not sleeping.
///
/// Stored as a raw pointer: the queue lives inside a `Process`, a mutex, or
/// a static, all of which outlive their sleepers on a cooperative CPU.
pub(crate) struct Wchan(pub(crate) *const WaitQueue);

// The pointer is only dereferenced from thread context with the IPL raised.
unsafe impl Send for Wchan {}

impl Wchan {
    pub(crate) const NULL: Wchan = Wchan(core::ptr::null());

    pub(crate) fn is_null(&self) -> bool {
        self.0.is_null()
    }
}

pub(crate) struct ThreadInner {
    pub(crate) state: ThreadState,
    pub(crate) cancelled: bool,
    pub(crate) retval: i64,
    pub(crate) errno: i32,
    pub(crate) wchan: Wchan,
    pub(crate) proc: Weak<Process>,
}

type ThreadEntry = Box<dyn FnOnce() -> i64 + Send>;

pub struct Thread {
    id: ThreadId,
    /// None only for the boot thread, which runs on the loader-provided stack.
    stack: Option<KernelStack>,
    ctx: UnsafeCell<Context>,
    /// Page directory this thread runs under; mirrors its process's.
    pagedir: Spinlock<Option<Arc<PageDir>>>,
    /// Entry closure, taken by `thread_bootstrap` on first run.
    entry: Spinlock<Option<ThreadEntry>>,
    pub(crate) inner: Spinlock<ThreadInner>,
}

// The context cell is only accessed by the scheduler on one CPU with the IPL
// raised; everything else is behind locks.
unsafe impl Send for Thread {}
unsafe impl Sync for Thread {}

impl Thread {
    /// Create a thread for `proc` that will begin execution in `entry`.
    ///
    /// The thread starts in the `Run` state but is not yet on the run queue;
    /// the caller hands it to `sched::make_runnable` when ready.
    pub fn create(proc: &Arc<Process>, entry: ThreadEntry) -> Result<Arc<Thread>> {
        let stack = KernelStack::alloc()?;
        let ctx = Context::prepare(stack.top());
        let thread = Arc::new(Thread {
            id: NEXT_TID.fetch_add(1, Ordering::Relaxed),
            stack: Some(stack),
            ctx: UnsafeCell::new(ctx),
            pagedir: Spinlock::new(Some(proc.pagedir())),
            entry: Spinlock::new(Some(entry)),
            inner: Spinlock::new(ThreadInner {
                state: ThreadState::Run,
                cancelled: false,
                retval: 0,
                errno: 0,
                wchan: Wchan::NULL,
                proc: Arc::downgrade(proc),
            }),
        });
        proc.attach_thread(&thread);
        log::trace!("thread {} created for pid {}", thread.id, proc.pid());
        Ok(thread)
    }

    /// Clone `thr` for fork: same stack size on a fresh stack, duplicated
    /// errno and cancellation flag, not attached to any process. The clone
    /// begins execution in `entry` under `pagedir`.
    pub fn clone_thread(
        thr: &Arc<Thread>,
        pagedir: Arc<PageDir>,
        entry: ThreadEntry,
    ) -> Result<Arc<Thread>> {
        let (errno, cancelled) = {
            let inner = thr.inner.lock();
            assert_eq!(inner.state, ThreadState::Run, "cloning a thread that is not running");
            (inner.errno, inner.cancelled)
        };
        let stack = KernelStack::alloc()?;
        let ctx = Context::prepare(stack.top());
        Ok(Arc::new(Thread {
            id: NEXT_TID.fetch_add(1, Ordering::Relaxed),
            stack: Some(stack),
            ctx: UnsafeCell::new(ctx),
            pagedir: Spinlock::new(Some(pagedir)),
            entry: Spinlock::new(Some(entry)),
            inner: Spinlock::new(ThreadInner {
                state: ThreadState::Run,
                cancelled,
                retval: 0,
                errno,
                wchan: Wchan::NULL,
                proc: Weak::new(),
            }),
        }))
    }

    /// Wrap the currently executing boot context in a thread so the
    /// bootstrap code becomes the idle process's thread. Its context is
    /// filled in by the first switch away from it.
    pub fn adopt_boot_context(proc: &Arc<Process>) -> Arc<Thread> {
        let thread = Arc::new(Thread {
            id: NEXT_TID.fetch_add(1, Ordering::Relaxed),
            stack: None,
            ctx: UnsafeCell::new(Context::zeroed()),
            pagedir: Spinlock::new(Some(proc.pagedir())),
            entry: Spinlock::new(None),
            inner: Spinlock::new(ThreadInner {
                state: ThreadState::Run,
                cancelled: false,
                retval: 0,
                errno: 0,
                wchan: Wchan::NULL,
                proc: Arc::downgrade(proc),
            }),
        });
        proc.attach_thread(&thread);
        thread
    }

    pub fn id(&self) -> ThreadId {
        self.id
    }

    /// True for the thread wrapped around the boot context, which has no
    /// kernel-allocated stack of its own.
    pub fn is_boot_thread(&self) -> bool {
        self.stack.is_none()
    }

    pub fn state(&self) -> ThreadState {
        self.inner.lock().state
    }

    pub fn cancelled(&self) -> bool {
        self.inner.lock().cancelled
    }

    pub fn retval(&self) -> i64 {
        self.inner.lock().retval
    }

    pub fn errno(&self) -> i32 {
        self.inner.lock().errno
    }

    pub fn set_errno(&self, errno: i32) {
        self.inner.lock().errno = errno;
    }

    pub fn proc(&self) -> Option<Arc<Process>> {
        self.inner.lock().proc.upgrade()
    }

    pub(crate) fn set_proc(&self, proc: &Arc<Process>) {
        self.inner.lock().proc = Arc::downgrade(proc);
    }

    pub(crate) fn pagedir(&self) -> Option<Arc<PageDir>> {
        self.pagedir.lock().clone()
    }

    pub(crate) fn ctx_ptr(&self) -> *mut Context {
        self.ctx.get()
    }

    pub(crate) fn take_entry(&self) -> Option<ThreadEntry> {
        self.entry.lock().take()
    }
}

/// Cancel `thr` with the given return value.
///
/// Cancelling the current thread is equivalent to exiting with that value.
/// Otherwise the cancellation flag is latched and, if the thread is in a
/// cancellable sleep, it is lifted onto the run queue so it resumes with
/// `EINTR`.
pub fn thread_cancel(thr: &Arc<Thread>, retval: i64) {
    if Arc::ptr_eq(thr, &sched::curthr()) {
        thread_exit(retval);
    }
    thr.inner.lock().retval = retval;
    sched::cancel(thr);
}

/// Exit the current thread with `retval`. Never returns: the process is
/// cleaned up and the scheduler picks somebody else.
pub fn thread_exit(retval: i64) -> ! {
    let thr = sched::curthr();
    {
        let inner = thr.inner.lock();
        assert!(inner.wchan.is_null(), "exiting thread is still on a queue");
    }
    {
        thr.inner.lock().retval = retval;
    }
    drop(thr);
    crate::task::process::proc_thread_exited(retval);
}

/// First Rust code on a brand-new thread's stack, reached via the arch
/// trampoline. Lowers the IPL (the switch ran with interrupts masked), runs
/// the entry closure, and exits with its return value.
pub extern "C" fn thread_bootstrap() -> ! {
    intr::set_ipl(intr::IPL_LOW);
    let entry = {
        let thr = sched::curthr();
        thr.take_entry().expect("thread started without an entry")
    };
    let retval = entry();
    // A cancellation latched while the entry ran carries the canceller's
    // value (a kill's exit status) in preference to the entry's own.
    let retval = {
        let thr = sched::curthr();
        let inner = thr.inner.lock();
        if inner.cancelled { inner.retval } else { retval }
    };
    thread_exit(retval);
}
