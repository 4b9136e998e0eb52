//! Kernel error numbers.
//!
//! Every fallible core operation returns `Result<T, Errno>`; internal helpers
//! never touch the per-thread errno. The userland convention (return -1 and
//! stash a positive errno on the current thread) is applied only at the
//! syscall boundary via [`user_result`].

/// Numeric error kinds, matching the classic positive errno values.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum Errno {
    /// Operation not permitted.
    EPERM = 1,
    /// No such file or directory.
    ENOENT = 2,
    /// Interrupted (cancellable wait was cancelled).
    EINTR = 4,
    /// No such device or address.
    ENXIO = 6,
    /// Bad file descriptor.
    EBADF = 9,
    /// No child processes.
    ECHILD = 10,
    /// Out of memory.
    ENOMEM = 12,
    /// Permission denied.
    EACCES = 13,
    /// Bad address (user pointer invalid).
    EFAULT = 14,
    /// File exists.
    EEXIST = 17,
    /// Not a directory.
    ENOTDIR = 20,
    /// Is a directory.
    EISDIR = 21,
    /// Invalid argument.
    EINVAL = 22,
    /// Too many open files.
    EMFILE = 24,
    /// Broken pipe.
    EPIPE = 32,
    /// File name too long.
    ENAMETOOLONG = 36,
    /// Function not implemented.
    ENOSYS = 38,
    /// Directory not empty.
    ENOTEMPTY = 39,
}

pub type Result<T> = core::result::Result<T, Errno>;

impl Errno {
    /// The positive numeric value of this error.
    pub fn as_i32(self) -> i32 {
        self as i32
    }
}

/// Convert a core result into the userland convention: a non-negative value
/// on success, or -1 with the positive errno stored on the current thread.
pub fn user_result(res: Result<i64>) -> i64 {
    match res {
        Ok(v) => v,
        Err(e) => {
            crate::task::sched::curthr().set_errno(e.as_i32());
            -1
        }
    }
}
