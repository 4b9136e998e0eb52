//! Bootstrap: subsystem init, the idle process, and the init process.
//!
//! The boot context becomes the idle process (pid 0): it spawns init
//! (pid 1), makes it runnable, waits for it, and tears the kernel down. On
//! hardware this is the tail of `kmain`; hosted, [`run`] is also the test
//! harness — each call boots a fresh kernel, runs `init_main` as the init
//! process, and returns its exit status.
//!
//! Boots must not overlap: callers (the test harness) serialize.

use crate::errno::user_result;
use crate::memory::pagetable;
use crate::task::process::{self, Pid, PID_IDLE, PID_INIT};
use crate::task::sched;
use crate::task::thread::Thread;
use alloc::boxed::Box;

/// Boot the kernel, run `init_main` as the init process, reap it, shut
/// down, and return init's exit status.
pub fn run<F>(init_main: F) -> i32
where
    F: FnOnce() -> i64 + Send + 'static,
{
    // Subsystem init, leaves first.
    sched::sched_init();
    process::proc_init();
    crate::fs::vfs_init();

    // The boot context becomes the idle process's thread.
    let idle = process::proc_create("idle").expect("cannot create the idle process");
    assert_eq!(idle.pid(), PID_IDLE);
    let idle_thr = Thread::adopt_boot_context(&idle);
    sched::set_current(idle_thr, idle.clone());
    pagetable::activate(idle.pagedir());

    // Init: pid 1, the adoption target for orphans.
    let init = process::proc_create("init").expect("cannot create the init process");
    assert_eq!(init.pid(), PID_INIT);
    let entry: Box<dyn FnOnce() -> i64 + Send> = Box::new(init_main);
    let init_thr = Thread::create(&init, entry).expect("cannot create the init thread");
    drop(init);
    sched::make_runnable(init_thr);

    // Idle's only job from here: wait for init.
    let (pid, status) = process::do_waitpid(-1, 0).expect("waiting for init failed");
    assert_eq!(pid, PID_INIT, "idle reaped something other than init");

    // Teardown.
    sched::clear_current();
    pagetable::deactivate();
    process::teardown_idle(&idle);
    drop(idle);
    crate::fs::vfs_shutdown();

    log::debug!("kernel halted cleanly (init status {})", status);
    status
}

/// Spawn a child process of the current process running `main`, in the
/// style of the kernel test harness: create, thread, runnable. Returns the
/// child's pid.
pub fn spawn_kproc<F>(name: &str, main: F) -> Pid
where
    F: FnOnce() -> i64 + Send + 'static,
{
    let proc = process::proc_create(name).expect("cannot create process");
    let entry: Box<dyn FnOnce() -> i64 + Send> = Box::new(main);
    let thr = Thread::create(&proc, entry).expect("cannot create thread");
    sched::make_runnable(thr);
    proc.pid()
}

/// Run `f` and convert its result to the userland convention (non-negative
/// or -1 with errno on the current thread), as the syscall dispatcher would.
pub fn as_user_call(f: impl FnOnce() -> crate::errno::Result<i64>) -> i64 {
    user_result(f())
}
