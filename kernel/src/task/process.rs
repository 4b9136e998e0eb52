//! Processes: creation, exit, wait, kill.
//!
//! Single thread per process. A process that exits becomes a DEAD zombie —
//! still parented — until `do_waitpid` reaps it; orphans are adopted by the
//! init process (pid 1). The idle process (pid 0) is the bootstrap context
//! and never exits.

use crate::errno::{Errno, Result};
use crate::fs::file::FdTable;
use crate::fs::vnode::Vnode;
use crate::memory::pagetable::PageDir;
use crate::memory::vmmap::VmMap;
use crate::sync::spinlock::Spinlock;
use crate::task::sched::{self, WaitQueue};
use crate::task::thread::{self, Thread, ThreadState};
use alloc::string::String;
use alloc::sync::{Arc, Weak};
use alloc::vec::Vec;

pub type Pid = i32;

pub const PID_IDLE: Pid = 0;
pub const PID_INIT: Pid = 1;

/// Size of the pid space; allocation wraps past this.
pub const PROC_MAX_COUNT: Pid = 65536;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcState {
    Running,
    Dead,
}

pub(crate) struct ProcInner {
    pub(crate) state: ProcState,
    pub(crate) status: i32,
    pub(crate) parent: Weak<Process>,
    pub(crate) children: Vec<Arc<Process>>,
    pub(crate) threads: Vec<Arc<Thread>>,
}

/// Heap bookkeeping seeded by the loader (see `memory::brk`).
#[derive(Default)]
pub struct BrkState {
    pub start_brk: usize,
    pub brk: usize,
}

pub struct Process {
    pid: Pid,
    name: String,
    pagedir: Arc<PageDir>,
    /// The parent sleeps here in `do_waitpid`; children broadcast on exit.
    pub wait: WaitQueue,
    pub(crate) inner: Spinlock<ProcInner>,
    cwd: Spinlock<Option<Arc<dyn Vnode>>>,
    pub files: Spinlock<FdTable>,
    pub vmmap: Spinlock<VmMap>,
    pub brk: Spinlock<BrkState>,
}

static PROC_LIST: Spinlock<Vec<Arc<Process>>> = Spinlock::new(Vec::new());
static INIT_PROC: Spinlock<Option<Arc<Process>>> = Spinlock::new(None);
static NEXT_PID: Spinlock<Pid> = Spinlock::new(0);

/// Reset process bookkeeping for a fresh boot.
pub fn proc_init() {
    PROC_LIST.lock().clear();
    *INIT_PROC.lock() = None;
    *NEXT_PID.lock() = 0;
}

/// The init process, once created.
pub fn initproc() -> Option<Arc<Process>> {
    INIT_PROC.lock().clone()
}

/// Find a process by pid.
pub fn proc_lookup(pid: Pid) -> Option<Arc<Process>> {
    PROC_LIST.lock().iter().find(|p| p.pid == pid).cloned()
}

/// Snapshot of the global process list.
pub fn proc_list() -> Vec<Arc<Process>> {
    PROC_LIST.lock().clone()
}

/// Next free pid: linear scan from the last allocation, wrapping at
/// [`PROC_MAX_COUNT`]. Panics only if the whole pid space is live.
fn alloc_pid() -> Pid {
    let list = PROC_LIST.lock();
    let mut next = NEXT_PID.lock();
    let start = *next;
    let mut pid = start;
    loop {
        if !list.iter().any(|p| p.pid == pid) {
            *next = (pid + 1) % PROC_MAX_COUNT;
            return pid;
        }
        pid = (pid + 1) % PROC_MAX_COUNT;
        assert!(pid != start, "pid space exhausted");
    }
}

/// Create a new process named `name`, parented to the current process.
///
/// The process is RUNNING but has no threads yet. The first process created
/// must become the idle process (pid 0); the second, init (pid 1), which is
/// recorded as the adoption target for orphans.
pub fn proc_create(name: &str) -> Result<Arc<Process>> {
    let pid = alloc_pid();
    let parent = if sched::have_current() { Some(sched::curproc()) } else { None };

    assert!(pid != PID_IDLE || PROC_LIST.lock().is_empty(), "idle pid reallocated");
    assert!(
        pid != PID_INIT || parent.as_ref().map(|p| p.pid) == Some(PID_IDLE),
        "init must be created by idle"
    );

    let cwd = crate::fs::vfs_root();
    let proc = Arc::new(Process {
        pid,
        name: String::from(name),
        pagedir: PageDir::new(),
        wait: WaitQueue::new(),
        inner: Spinlock::new(ProcInner {
            state: ProcState::Running,
            status: 0,
            parent: parent.as_ref().map(Arc::downgrade).unwrap_or_default(),
            children: Vec::new(),
            threads: Vec::new(),
        }),
        cwd: Spinlock::new(cwd),
        files: Spinlock::new(FdTable::new()),
        vmmap: Spinlock::new(VmMap::new()),
        brk: Spinlock::new(BrkState::default()),
    });

    if let Some(parent) = &parent {
        parent.inner.lock().children.push(proc.clone());
    }
    PROC_LIST.lock().push(proc.clone());
    if pid == PID_INIT {
        *INIT_PROC.lock() = Some(proc.clone());
    }
    log::debug!("proc {} ({:?}) created", pid, name);
    Ok(proc)
}

impl Process {
    pub fn pid(&self) -> Pid {
        self.pid
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn state(&self) -> ProcState {
        self.inner.lock().state
    }

    pub fn status(&self) -> i32 {
        self.inner.lock().status
    }

    pub fn parent(&self) -> Option<Arc<Process>> {
        self.inner.lock().parent.upgrade()
    }

    pub fn pagedir(&self) -> Arc<PageDir> {
        self.pagedir.clone()
    }

    pub fn cwd(&self) -> Option<Arc<dyn Vnode>> {
        self.cwd.lock().clone()
    }

    /// Replace the working directory, dropping the reference to the old one.
    pub fn set_cwd(&self, vn: Arc<dyn Vnode>) {
        *self.cwd.lock() = Some(vn);
    }

    pub(crate) fn attach_thread(&self, thr: &Arc<Thread>) {
        self.inner.lock().threads.push(thr.clone());
    }

    /// The process's single thread (while it has one).
    pub fn main_thread(&self) -> Option<Arc<Thread>> {
        self.inner.lock().threads.last().cloned()
    }
}

/// Clean up as much of the current process as can be done from within it:
/// close every fd, drop the cwd reference, tear down the address space,
/// reparent children to init, mark DEAD, and wake the parent. The parent
/// finishes destruction in `do_waitpid`; until then the process is a zombie.
fn proc_cleanup(status: i32) {
    let proc = sched::curproc();
    let init = initproc().expect("proc_cleanup before init exists");
    assert!(proc.pid >= PID_INIT, "idle process must never exit");

    let parent = proc.parent().expect("exiting process has no parent");

    // Reparent children to init. Init itself must have reaped everything.
    let orphans: Vec<Arc<Process>> = {
        let mut inner = proc.inner.lock();
        inner.status = status;
        inner.state = ProcState::Dead;
        core::mem::take(&mut inner.children)
    };
    if proc.pid == PID_INIT {
        assert!(orphans.is_empty(), "init exited with live children");
    }
    for child in orphans {
        child.inner.lock().parent = Arc::downgrade(&init);
        init.inner.lock().children.push(child);
    }

    *proc.cwd.lock() = None;
    proc.files.lock().close_all();
    proc.vmmap.lock().destroy();

    log::debug!("proc {} ({}) exiting with status {}", proc.pid, proc.name, status);
    sched::broadcast_on(&parent.wait);
    sched::curthr().inner.lock().state = ThreadState::Exited;
}

/// Called from the thread-exit path: clean up the process and schedule
/// somebody else. Never returns.
pub fn proc_thread_exited(retval: i64) -> ! {
    proc_cleanup(retval as i32);
    sched::switch();
    unreachable!("exited thread was scheduled again");
}

/// Exit the current process with `status`. On the one-thread-per-process
/// target cancelling self *is* exiting, so this runs the exit path
/// directly.
///
/// Frames abandoned by the final switch never run their destructors, so
/// nothing here may hold a reference past the `thread_exit` call.
pub fn do_exit(status: i32) -> ! {
    {
        let thr = sched::curthr();
        thr.inner.lock().cancelled = true;
    }
    thread::thread_exit(status as i64);
}

/// Kill `p` with `status`. Killing the current process is `do_exit` and
/// does not return; otherwise every thread of `p` is cancelled.
pub fn proc_kill(p: &Arc<Process>, status: i32) {
    if Arc::ptr_eq(p, &sched::curproc()) {
        do_exit(status);
    }
    let threads: Vec<Arc<Thread>> = p.inner.lock().threads.clone();
    for thr in threads {
        thread::thread_cancel(&thr, status as i64);
    }
}

/// Kill every process except idle, direct children of idle, and the
/// current process — which is killed last (if eligible) and then this does
/// not return.
pub fn proc_kill_all() {
    let cur = sched::curproc();
    let victims: Vec<Arc<Process>> = PROC_LIST
        .lock()
        .iter()
        .filter(|p| {
            p.pid != PID_IDLE
                && p.parent().map(|pp| pp.pid != PID_IDLE).unwrap_or(false)
                && !Arc::ptr_eq(p, &cur)
        })
        .cloned()
        .collect();
    for p in &victims {
        proc_kill(p, 0);
    }
    let cur_parent_idle = cur.parent().map(|pp| pp.pid == PID_IDLE).unwrap_or(true);
    if cur.pid != PID_IDLE && !cur_parent_idle {
        proc_kill(&cur, 0);
    }
}

/// Wait for a child to exit and reap it.
///
/// `pid == -1` waits for any child; `pid > 0` for that specific child.
/// Returns the reaped child's pid and exit status, or `ECHILD` if no
/// matching child exists. Options other than 0 are not supported.
pub fn do_waitpid(pid: Pid, options: i32) -> Result<(Pid, i32)> {
    if options != 0 || (pid != -1 && pid <= 0) {
        return Err(Errno::EINVAL);
    }
    let proc = sched::curproc();
    loop {
        // Scan the children for a match; harvest the first dead one.
        let (dead, any_match) = {
            let inner = proc.inner.lock();
            let mut dead = None;
            let mut any_match = false;
            for child in inner.children.iter() {
                if pid != -1 && child.pid != pid {
                    continue;
                }
                any_match = true;
                if child.state() == ProcState::Dead {
                    dead = Some(child.clone());
                    break;
                }
            }
            (dead, any_match)
        };

        if let Some(child) = dead {
            let status = child.status();

            // Destroy the child's thread (frees its kernel stack) and sever
            // the parent link.
            {
                let mut cinner = child.inner.lock();
                cinner.threads.clear();
                cinner.parent = Weak::new();
            }
            proc.inner.lock().children.retain(|c| !Arc::ptr_eq(c, &child));
            PROC_LIST.lock().retain(|c| !Arc::ptr_eq(c, &child));
            if child.pid == PID_INIT {
                *INIT_PROC.lock() = None;
            }
            log::debug!("proc {} reaped child {} (status {})", proc.pid, child.pid, status);
            // The page directory dies with the last reference, right here
            // unless it is still the active one (the scheduler replaced it
            // when the child switched away for good).
            return Ok((child.pid, status));
        }

        if !any_match {
            return Err(Errno::ECHILD);
        }

        sched::sleep_on(&proc.wait);
    }
}

/// Remove the idle process from the global list at shutdown. Boot-harness
/// only: the idle process never exits through `do_exit`.
pub fn teardown_idle(idle: &Arc<Process>) {
    assert_eq!(idle.pid, PID_IDLE);
    {
        let mut inner = idle.inner.lock();
        inner.threads.clear();
        assert!(inner.children.is_empty(), "idle still has unreaped children");
    }
    *idle.cwd.lock() = None;
    idle.files.lock().close_all();
    idle.vmmap.lock().destroy();
    PROC_LIST.lock().retain(|p| !Arc::ptr_eq(p, idle));
    *INIT_PROC.lock() = None;
}
