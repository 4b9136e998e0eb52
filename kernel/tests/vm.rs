//! Virtual memory: mmap/munmap/brk, the fault handler, and fork's
//! copy-on-write, all exercised through the hosted MMU walk.

mod common;

use rook_kernel::errno::Errno;
use rook_kernel::fs::file::{O_CREAT, O_RDONLY, O_RDWR};
use rook_kernel::fs::open::do_open;
use rook_kernel::fs::syscall::{do_close, do_read, do_write};
use rook_kernel::memory::brk::{do_brk, setup_heap};
use rook_kernel::memory::fault::{user_read, user_write};
use rook_kernel::memory::mmap::{do_mmap, do_munmap};
use rook_kernel::memory::vmmap::{MapFlags, Prot};
use rook_kernel::memory::{PAGE_SIZE, USER_MEM_HIGH};
use rook_kernel::task::fork::do_fork;
use rook_kernel::task::process::do_waitpid;
use rook_kernel::task::sched;

const VA: usize = 0x1000_0000;

fn rw_anon() -> (Prot, MapFlags) {
    (Prot::READ | Prot::WRITE, MapFlags::PRIVATE | MapFlags::ANON | MapFlags::FIXED)
}

#[test]
fn anon_mapping_reads_zeroes_and_holds_writes() {
    let status = common::boot(|| {
        let (prot, flags) = rw_anon();
        let va = do_mmap(VA, PAGE_SIZE, prot, flags, -1, 0).unwrap();
        if va != VA {
            return 1;
        }
        let mut buf = [0xffu8; 16];
        user_read(va, &mut buf);
        if buf != [0u8; 16] {
            return 2;
        }
        user_write(va + 5, b"hello");
        user_read(va, &mut buf);
        if &buf[5..10] != b"hello" {
            return 3;
        }
        do_munmap(va, PAGE_SIZE).unwrap();
        0
    });
    assert_eq!(status, 0);
}

#[test]
fn mmap_validates_its_arguments() {
    let status = common::boot(|| {
        let e = |r: Result<usize, Errno>| r.unwrap_err();
        let (prot, _) = rw_anon();
        let anonpriv = MapFlags::PRIVATE | MapFlags::ANON;

        if e(do_mmap(VA + 1, PAGE_SIZE, prot, anonpriv | MapFlags::FIXED, -1, 0)) != Errno::EINVAL {
            return 1;
        }
        if e(do_mmap(VA, 0, prot, anonpriv, -1, 0)) != Errno::EINVAL {
            return 2;
        }
        if e(do_mmap(0, PAGE_SIZE, prot, anonpriv | MapFlags::FIXED, -1, 0)) != Errno::EINVAL {
            return 3;
        }
        if e(do_mmap(0, PAGE_SIZE, prot, MapFlags::ANON, -1, 0)) != Errno::EINVAL {
            return 4;
        }
        let both = MapFlags::SHARED | MapFlags::PRIVATE | MapFlags::ANON;
        if e(do_mmap(0, PAGE_SIZE, prot, both, -1, 0)) != Errno::EINVAL {
            return 5;
        }
        if e(do_mmap(0, PAGE_SIZE, prot, MapFlags::PRIVATE, 19, 0)) != Errno::EBADF {
            return 6;
        }
        // Write-shared mappings need a writable descriptor.
        do_close(do_open("/f", O_CREAT | O_RDWR).unwrap() as i32).unwrap();
        let fd = do_open("/f", O_RDONLY).unwrap() as i32;
        if e(do_mmap(0, PAGE_SIZE, prot, MapFlags::SHARED, fd, 0)) != Errno::EACCES {
            return 7;
        }
        do_close(fd).unwrap();
        0
    });
    assert_eq!(status, 0);
}

#[test]
fn munmap_then_remap_leaves_the_map_identical() {
    let status = common::boot(|| {
        let (prot, flags) = rw_anon();
        let snapshot = || {
            let proc = sched::curproc();
            let map = proc.vmmap.lock();
            map.areas()
                .iter()
                .map(|a| (a.start, a.end, a.off))
                .collect::<Vec<_>>()
        };
        let before = snapshot();
        let va = do_mmap(VA, 4 * PAGE_SIZE, prot, flags, -1, 0).unwrap();
        user_write(va, b"payload");
        do_munmap(va, 4 * PAGE_SIZE).unwrap();
        if snapshot() != before {
            return 1;
        }
        0
    });
    assert_eq!(status, 0);
}

#[test]
fn fault_on_unmapped_address_kills_the_process() {
    let status = common::boot(|| {
        let pid = do_fork(Box::new(|| {
            user_write(0x7000_0000, b"boom");
            0
        }))
        .unwrap();
        let (_, st) = do_waitpid(pid, 0).unwrap();
        if st != Errno::EFAULT.as_i32() {
            return 1;
        }
        0
    });
    assert_eq!(status, 0);
}

#[test]
fn fault_against_protection_kills_the_process() {
    let status = common::boot(|| {
        let va = do_mmap(
            VA,
            PAGE_SIZE,
            Prot::READ,
            MapFlags::PRIVATE | MapFlags::ANON | MapFlags::FIXED,
            -1,
            0,
        )
        .unwrap();
        // Reading is fine.
        let mut b = [0u8; 1];
        user_read(va, &mut b);
        // Writing is not; the child dies with the fault status.
        let pid = do_fork(Box::new(move || {
            user_write(va, b"x");
            0
        }))
        .unwrap();
        let (_, st) = do_waitpid(pid, 0).unwrap();
        if st != Errno::EFAULT.as_i32() {
            return 1;
        }
        do_munmap(va, PAGE_SIZE).unwrap();
        0
    });
    assert_eq!(status, 0);
}

#[test]
fn exec_fault_needs_exec_protection() {
    let status = common::boot(|| {
        use rook_kernel::memory::fault::user_exec;
        let va = do_mmap(
            VA,
            PAGE_SIZE,
            Prot::READ | Prot::EXEC,
            MapFlags::PRIVATE | MapFlags::ANON | MapFlags::FIXED,
            -1,
            0,
        )
        .unwrap();
        // Fetching from an executable mapping works...
        user_exec(va);
        do_munmap(va, PAGE_SIZE).unwrap();

        // ...and from a read-only one it kills the process.
        let nva = do_mmap(
            VA,
            PAGE_SIZE,
            Prot::READ,
            MapFlags::PRIVATE | MapFlags::ANON | MapFlags::FIXED,
            -1,
            0,
        )
        .unwrap();
        let pid = do_fork(Box::new(move || {
            user_exec(nva);
            0
        }))
        .unwrap();
        let (_, st) = do_waitpid(pid, 0).unwrap();
        if st != Errno::EFAULT.as_i32() {
            return 1;
        }
        do_munmap(nva, PAGE_SIZE).unwrap();
        0
    });
    assert_eq!(status, 0);
}

#[test]
fn fork_copy_on_write_isolates_parent_and_child() {
    let status = common::boot(|| {
        let (prot, flags) = rw_anon();
        let va = do_mmap(VA, PAGE_SIZE, prot, flags, -1, 0).unwrap();
        user_write(va, &[0xAA]);

        let pid = do_fork(Box::new(move || {
            let mut b = [0u8; 1];
            user_read(va, &mut b);
            if b[0] != 0xAA {
                return 1;
            }
            user_write(va, &[0xBB]);
            user_read(va, &mut b);
            if b[0] != 0xBB {
                return 2;
            }
            0
        }))
        .unwrap();

        let (_, st) = do_waitpid(pid, 0).unwrap();
        if st != 0 {
            return st as i64;
        }
        // The child's write stayed in the child.
        let mut b = [0u8; 1];
        user_read(va, &mut b);
        if b[0] != 0xAA {
            return 3;
        }
        do_munmap(va, PAGE_SIZE).unwrap();
        0
    });
    assert_eq!(status, 0);
}

#[test]
fn fork_shares_shared_mappings() {
    let status = common::boot(|| {
        let va = do_mmap(
            VA,
            PAGE_SIZE,
            Prot::READ | Prot::WRITE,
            MapFlags::SHARED | MapFlags::ANON | MapFlags::FIXED,
            -1,
            0,
        )
        .unwrap();
        user_write(va, &[1]);
        let pid = do_fork(Box::new(move || {
            user_write(va, &[2]);
            0
        }))
        .unwrap();
        do_waitpid(pid, 0).unwrap();
        let mut b = [0u8; 1];
        user_read(va, &mut b);
        // Shared: the child's write is visible here.
        if b[0] != 2 {
            return 1;
        }
        do_munmap(va, PAGE_SIZE).unwrap();
        0
    });
    assert_eq!(status, 0);
}

#[test]
fn nested_forks_stack_shadows_without_cross_talk() {
    let status = common::boot(|| {
        let (prot, flags) = rw_anon();
        let va = do_mmap(VA, PAGE_SIZE, prot, flags, -1, 0).unwrap();
        user_write(va, &[10]);

        let pid = do_fork(Box::new(move || {
            // Child sees the parent's byte, then forks again.
            let mut b = [0u8; 1];
            user_read(va, &mut b);
            if b[0] != 10 {
                return 1;
            }
            let gpid = do_fork(Box::new(move || {
                let mut b = [0u8; 1];
                user_read(va, &mut b);
                if b[0] != 10 {
                    return 1;
                }
                user_write(va, &[30]);
                0
            }))
            .unwrap();
            let (_, st) = do_waitpid(gpid, 0).unwrap();
            if st != 0 {
                return 2;
            }
            user_write(va, &[20]);
            let mut b = [0u8; 1];
            user_read(va, &mut b);
            if b[0] != 20 {
                return 3;
            }
            0
        }))
        .unwrap();

        let (_, st) = do_waitpid(pid, 0).unwrap();
        if st != 0 {
            return st as i64;
        }
        let mut b = [0u8; 1];
        user_read(va, &mut b);
        if b[0] != 10 {
            return 4;
        }
        do_munmap(va, PAGE_SIZE).unwrap();
        0
    });
    assert_eq!(status, 0);
}

#[test]
fn shadow_and_anon_objects_self_collect() {
    let (status, before, after) = common::boot_with_ledger(|| {
        let (prot, flags) = rw_anon();
        let va = do_mmap(VA, PAGE_SIZE, prot, flags, -1, 0).unwrap();
        user_write(va, &[1]);
        let pid = do_fork(Box::new(move || {
            user_write(va, &[2]);
            0
        }))
        .unwrap();
        do_waitpid(pid, 0).unwrap();
        do_munmap(va, PAGE_SIZE).unwrap();
        0
    });
    assert_eq!(status, 0);
    assert_eq!(after.anon, before.anon);
    assert_eq!(after.shadow, before.shadow);
}

#[test]
fn physical_pages_are_returned_after_boot() {
    let (status, before, after) = common::boot_with_ledger(|| {
        let (prot, flags) = rw_anon();
        let va = do_mmap(VA, 8 * PAGE_SIZE, prot, flags, -1, 0).unwrap();
        for i in 0..8 {
            user_write(va + i * PAGE_SIZE, &[i as u8]);
        }
        let pid = do_fork(Box::new(move || {
            user_write(va, &[0xcc]);
            0
        }))
        .unwrap();
        do_waitpid(pid, 0).unwrap();
        0
    });
    assert_eq!(status, 0);
    assert_eq!(after.pages, before.pages);
}

#[test]
fn brk_grows_and_shrinks_the_heap() {
    let status = common::boot(|| {
        let start = 0x0800_0400;
        setup_heap(start).unwrap();
        if do_brk(0).unwrap() != start {
            return 1;
        }
        // Grow by two pages and touch them.
        let new = do_brk(start + 2 * PAGE_SIZE).unwrap();
        if new != start + 2 * PAGE_SIZE {
            return 2;
        }
        user_write(start, b"heap bytes");
        let mut buf = [0u8; 10];
        user_read(start, &mut buf);
        if &buf != b"heap bytes" {
            return 3;
        }
        // Shrink back to empty.
        if do_brk(start).unwrap() != start {
            return 4;
        }
        // Below start_brk and past the ceiling are both refused.
        if do_brk(start - 1).unwrap_err() != Errno::ENOMEM {
            return 5;
        }
        if do_brk(USER_MEM_HIGH + 1).unwrap_err() != Errno::ENOMEM {
            return 6;
        }
        0
    });
    assert_eq!(status, 0);
}

#[test]
fn brk_cannot_grow_into_a_mapping() {
    let status = common::boot(|| {
        let start = 0x0800_0400;
        setup_heap(start).unwrap();
        // Wall off the page right above the heap.
        let wall = 0x0800_2000;
        do_mmap(
            wall,
            PAGE_SIZE,
            Prot::READ,
            MapFlags::PRIVATE | MapFlags::ANON | MapFlags::FIXED,
            -1,
            0,
        )
        .unwrap();
        if do_brk(wall + PAGE_SIZE).unwrap_err() != Errno::ENOMEM {
            return 1;
        }
        // Up to the wall is fine.
        if do_brk(wall).is_err() {
            return 2;
        }
        0
    });
    assert_eq!(status, 0);
}

#[test]
fn file_mappings_see_and_publish_file_bytes() {
    let status = common::boot(|| {
        let fd = do_open("/data", O_CREAT | O_RDWR).unwrap() as i32;
        do_write(fd, b"file contents here").unwrap();

        // Shared mapping reads through to the file...
        let va = do_mmap(0, PAGE_SIZE, Prot::READ | Prot::WRITE, MapFlags::SHARED, fd, 0).unwrap();
        let mut buf = [0u8; 18];
        user_read(va, &mut buf);
        if &buf != b"file contents here" {
            return 1;
        }

        // ...and a cleaned dirty page lands back in it.
        user_write(va, b"FILE");
        let root = rook_kernel::fs::vfs_root().unwrap();
        let vn = root.lookup("data").unwrap();
        let obj = vn.mmap().unwrap();
        obj.clean_page(0).unwrap();
        let mut back = [0u8; 4];
        rook_kernel::fs::syscall::do_lseek(fd, 0, rook_kernel::fs::syscall::Whence::Set).unwrap();
        do_read(fd, &mut back).unwrap();
        if &back != b"FILE" {
            return 3;
        }

        // A private mapping of the same file keeps its writes to itself.
        let pva =
            do_mmap(0, PAGE_SIZE, Prot::READ | Prot::WRITE, MapFlags::PRIVATE, fd, 0).unwrap();
        user_write(pva, b"none");
        rook_kernel::fs::syscall::do_lseek(fd, 0, rook_kernel::fs::syscall::Whence::Set).unwrap();
        do_read(fd, &mut back).unwrap();
        if &back != b"FILE" {
            return 4;
        }

        do_munmap(va, PAGE_SIZE).unwrap();
        do_munmap(pva, PAGE_SIZE).unwrap();
        do_close(fd).unwrap();
        0
    });
    assert_eq!(status, 0);
}
