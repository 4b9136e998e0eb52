//! Shared harness: boots are serialized per test binary because the kernel
//! is a global singleton (one CPU, one process table, one mounted root).

use std::sync::{Mutex, MutexGuard, OnceLock};

fn boot_lock() -> MutexGuard<'static, ()> {
    static LOCK: OnceLock<Mutex<()>> = OnceLock::new();
    LOCK.get_or_init(|| Mutex::new(()))
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Boot a fresh kernel, run `init_main` as the init process, and return its
/// exit status.
pub fn boot<F>(init_main: F) -> i32
where
    F: FnOnce() -> i64 + Send + 'static,
{
    let _guard = boot_lock();
    let _ = env_logger::builder().is_test(true).try_init();
    rook_kernel::boot::run(init_main)
}

/// Resource counters sampled while the boot lock is held, so concurrent
/// tests cannot perturb them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[allow(dead_code)]
pub struct Ledger {
    pub pages: usize,
    pub anon: u64,
    pub shadow: u64,
}

#[allow(dead_code)]
fn sample() -> Ledger {
    Ledger {
        pages: rook_kernel::memory::phys::pages_in_use(),
        anon: rook_kernel::memory::anon::anon_count(),
        shadow: rook_kernel::memory::shadow::shadow_count(),
    }
}

/// Like [`boot`], but also returns the resource ledger from before and
/// after the run (both sampled under the boot lock).
#[allow(dead_code)]
pub fn boot_with_ledger<F>(init_main: F) -> (i32, Ledger, Ledger)
where
    F: FnOnce() -> i64 + Send + 'static,
{
    let _guard = boot_lock();
    let _ = env_logger::builder().is_test(true).try_init();
    let before = sample();
    let status = rook_kernel::boot::run(init_main);
    let after = sample();
    (status, before, after)
}
