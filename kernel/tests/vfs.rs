//! The VFS surface: open/read/write/dup, directories, links, pipes, and the
//! path-resolution edge cases.

mod common;

use rook_kernel::errno::Errno;
use rook_kernel::fs::file::{O_APPEND, O_CREAT, O_RDONLY, O_RDWR, O_WRONLY, NFILES};
use rook_kernel::fs::open::do_open;
use rook_kernel::fs::syscall::{
    do_chdir, do_close, do_dup, do_dup2, do_getdents, do_link, do_lseek, do_mkdir, do_mknod,
    do_pipe, do_read, do_rename, do_rmdir, do_stat, do_unlink, do_write, Whence,
};
use rook_kernel::fs::vnode::VnodeKind;
use rook_kernel::fs::NAME_MAX;
use rook_kernel::task::fork::do_fork;
use rook_kernel::task::process::do_waitpid;
use rook_kernel::task::sched;

#[test]
fn open_write_seek_read_round_trip() {
    let status = common::boot(|| {
        let fd = do_open("/f", O_CREAT | O_RDWR).unwrap() as i32;
        if do_write(fd, b"abc").unwrap() != 3 {
            return 1;
        }
        do_lseek(fd, 0, Whence::Set).unwrap();
        let mut buf = [0u8; 3];
        if do_read(fd, &mut buf).unwrap() != 3 || &buf != b"abc" {
            return 2;
        }
        do_close(fd).unwrap();
        0
    });
    assert_eq!(status, 0);
}

#[test]
fn open_close_is_a_noop_on_the_fs() {
    let status = common::boot(|| {
        do_close(do_open("/f", O_CREAT | O_RDWR).unwrap() as i32).unwrap();
        let nodes = rook_kernel::fs::root_fs().unwrap().live_nodes();
        let fd = do_open("/f", O_RDONLY).unwrap() as i32;
        do_close(fd).unwrap();
        if rook_kernel::fs::root_fs().unwrap().live_nodes() != nodes {
            return 1;
        }
        0
    });
    assert_eq!(status, 0);
}

#[test]
fn open_rejects_bad_flag_combinations() {
    let status = common::boot(|| {
        match do_open("/x", O_WRONLY | O_RDWR) {
            Err(Errno::EINVAL) => {}
            _ => return 1,
        }
        // Write-opening a directory is EISDIR.
        do_mkdir("/d").unwrap();
        match do_open("/d", O_WRONLY) {
            Err(Errno::EISDIR) => {}
            _ => return 2,
        }
        // Missing file without O_CREAT.
        match do_open("/missing", O_RDONLY) {
            Err(Errno::ENOENT) => {}
            _ => return 3,
        }
        0
    });
    assert_eq!(status, 0);
}

#[test]
fn append_mode_writes_at_the_end() {
    let status = common::boot(|| {
        let fd = do_open("/log", O_CREAT | O_RDWR).unwrap() as i32;
        do_write(fd, b"one").unwrap();
        do_close(fd).unwrap();

        let fd = do_open("/log", O_WRONLY | O_APPEND).unwrap() as i32;
        do_write(fd, b"two").unwrap();
        do_close(fd).unwrap();

        let fd = do_open("/log", O_RDONLY).unwrap() as i32;
        let mut buf = [0u8; 6];
        do_read(fd, &mut buf).unwrap();
        do_close(fd).unwrap();
        if &buf != b"onetwo" {
            return 1;
        }
        0
    });
    assert_eq!(status, 0);
}

#[test]
fn read_requires_read_mode_and_files() {
    let status = common::boot(|| {
        do_close(do_open("/f", O_CREAT | O_RDWR).unwrap() as i32).unwrap();
        let fd = do_open("/f", O_WRONLY).unwrap() as i32;
        match do_read(fd, &mut [0u8; 4]) {
            Err(Errno::EBADF) => {}
            _ => return 1,
        }
        do_close(fd).unwrap();

        do_mkdir("/d").unwrap();
        let fd = do_open("/d", O_RDONLY).unwrap() as i32;
        match do_read(fd, &mut [0u8; 4]) {
            Err(Errno::EISDIR) => {}
            _ => return 2,
        }
        do_close(fd).unwrap();

        match do_read(99, &mut [0u8; 4]) {
            Err(Errno::EBADF) => {}
            _ => return 3,
        }
        0
    });
    assert_eq!(status, 0);
}

#[test]
fn dup_shares_the_cursor() {
    let status = common::boot(|| {
        let fd = do_open("/f", O_CREAT | O_RDWR).unwrap() as i32;
        do_write(fd, b"abcdef").unwrap();
        do_lseek(fd, 0, Whence::Set).unwrap();

        let fd2 = do_dup(fd).unwrap() as i32;
        let mut buf = [0u8; 3];
        do_read(fd, &mut buf).unwrap();
        // The duplicate continues where the original stopped.
        do_read(fd2, &mut buf).unwrap();
        if &buf != b"def" {
            return 1;
        }
        // Closing one leaves the other valid.
        do_close(fd).unwrap();
        do_lseek(fd2, 0, Whence::Set).unwrap();
        do_read(fd2, &mut buf).unwrap();
        if &buf != b"abc" {
            return 2;
        }
        do_close(fd2).unwrap();
        0
    });
    assert_eq!(status, 0);
}

#[test]
fn dup2_closes_its_target_first() {
    let status = common::boot(|| {
        let a = do_open("/a", O_CREAT | O_RDWR).unwrap() as i32;
        let b = do_open("/b", O_CREAT | O_RDWR).unwrap() as i32;
        do_write(a, b"from a").unwrap();

        if do_dup2(a, b).unwrap() != b as usize {
            return 1;
        }
        // b now reads a's file.
        do_lseek(b, 0, Whence::Set).unwrap();
        let mut buf = [0u8; 6];
        do_read(b, &mut buf).unwrap();
        if &buf != b"from a" {
            return 2;
        }
        // dup2 onto itself is a no-op.
        if do_dup2(a, a).unwrap() != a as usize {
            return 3;
        }
        match do_dup2(a, NFILES as i32) {
            Err(Errno::EBADF) => {}
            _ => return 4,
        }
        do_close(a).unwrap();
        do_close(b).unwrap();
        0
    });
    assert_eq!(status, 0);
}

#[test]
fn fd_table_exhaustion_is_emfile() {
    let status = common::boot(|| {
        do_close(do_open("/f", O_CREAT | O_RDWR).unwrap() as i32).unwrap();
        let mut fds = Vec::new();
        for _ in 0..NFILES {
            fds.push(do_open("/f", O_RDONLY).unwrap() as i32);
        }
        match do_open("/f", O_RDONLY) {
            Err(Errno::EMFILE) => {}
            _ => return 1,
        }
        for fd in fds {
            do_close(fd).unwrap();
        }
        0
    });
    assert_eq!(status, 0);
}

#[test]
fn mkdir_rmdir_semantics() {
    let status = common::boot(|| {
        do_mkdir("/a").unwrap();
        do_mkdir("/a/b").unwrap();
        match do_rmdir("/a") {
            Err(Errno::ENOTEMPTY) => {}
            _ => return 1,
        }
        do_rmdir("/a/b").unwrap();
        do_rmdir("/a").unwrap();
        match do_stat("/a") {
            Err(Errno::ENOENT) => {}
            _ => return 2,
        }
        // The parent is restored to its original shape.
        match do_mkdir("/") {
            Err(Errno::EEXIST) => {}
            _ => return 3,
        }
        match do_rmdir("/a/.") {
            Err(e) if e == Errno::EINVAL || e == Errno::ENOENT => {}
            _ => return 4,
        }
        do_mkdir("/a").unwrap();
        match do_rmdir("/a/.") {
            Err(Errno::EINVAL) => {}
            _ => return 5,
        }
        match do_rmdir("/a/..") {
            Err(Errno::ENOTEMPTY) => {}
            _ => return 6,
        }
        do_rmdir("/a").unwrap();
        0
    });
    assert_eq!(status, 0);
}

#[test]
fn name_length_boundary() {
    let status = common::boot(|| {
        let ok: String = std::iter::repeat('x').take(NAME_MAX).collect();
        let long: String = std::iter::repeat('x').take(NAME_MAX + 1).collect();
        do_mkdir(&format!("/{}", ok)).unwrap();
        if do_stat(&format!("/{}", ok)).is_err() {
            return 1;
        }
        match do_mkdir(&format!("/{}", long)) {
            Err(Errno::ENAMETOOLONG) => {}
            _ => return 2,
        }
        0
    });
    assert_eq!(status, 0);
}

#[test]
fn link_unlink_rename() {
    let status = common::boot(|| {
        let fd = do_open("/f", O_CREAT | O_RDWR).unwrap() as i32;
        do_write(fd, b"abc").unwrap();
        do_close(fd).unwrap();

        do_link("/f", "/g").unwrap();
        if do_stat("/f").unwrap().nlink != 2 {
            return 1;
        }
        match do_link("/f", "/g") {
            Err(Errno::EEXIST) => {}
            _ => return 2,
        }
        do_unlink("/f").unwrap();
        // Content is still reachable through the other link.
        let fd = do_open("/g", O_RDONLY).unwrap() as i32;
        let mut buf = [0u8; 3];
        do_read(fd, &mut buf).unwrap();
        do_close(fd).unwrap();
        if &buf != b"abc" {
            return 3;
        }

        do_rename("/g", "/h").unwrap();
        match do_stat("/g") {
            Err(Errno::ENOENT) => {}
            _ => return 4,
        }
        if do_stat("/h").unwrap().nlink != 1 {
            return 5;
        }

        // Directories cannot be linked or unlinked.
        do_mkdir("/d").unwrap();
        match do_link("/d", "/d2") {
            Err(Errno::EPERM) => {}
            _ => return 6,
        }
        match do_unlink("/d") {
            Err(Errno::EPERM) => {}
            _ => return 7,
        }
        0
    });
    assert_eq!(status, 0);
}

#[test]
fn chdir_changes_relative_resolution() {
    let status = common::boot(|| {
        do_mkdir("/a").unwrap();
        do_chdir("/a").unwrap();
        do_close(do_open("rel", O_CREAT | O_RDWR).unwrap() as i32).unwrap();
        if do_stat("/a/rel").is_err() {
            return 1;
        }
        do_chdir("..").unwrap();
        if do_stat("a/rel").is_err() {
            return 2;
        }
        match do_chdir("/a/rel") {
            Err(Errno::ENOTDIR) => {}
            _ => return 3,
        }
        0
    });
    assert_eq!(status, 0);
}

#[test]
fn getdents_walks_the_directory() {
    let status = common::boot(|| {
        do_mkdir("/dir").unwrap();
        do_close(do_open("/dir/one", O_CREAT | O_RDWR).unwrap() as i32).unwrap();
        do_mkdir("/dir/two").unwrap();

        let fd = do_open("/dir", O_RDONLY).unwrap() as i32;
        let mut entries = Vec::new();
        // Read two at a time until exhaustion.
        loop {
            let n = do_getdents(fd, &mut entries, 2).unwrap();
            if n == 0 {
                break;
            }
        }
        do_close(fd).unwrap();

        let names: Vec<&str> = entries.iter().map(|d| d.name.as_str()).collect();
        if names != [".", "..", "one", "two"] {
            return 1;
        }
        // Not a directory: ENOTDIR.
        let fd = do_open("/dir/one", O_RDONLY).unwrap() as i32;
        match do_getdents(fd, &mut entries, 1) {
            Err(Errno::ENOTDIR) => {}
            _ => return 2,
        }
        do_close(fd).unwrap();
        0
    });
    assert_eq!(status, 0);
}

#[test]
fn lseek_boundaries() {
    let status = common::boot(|| {
        let fd = do_open("/f", O_CREAT | O_RDWR).unwrap() as i32;
        do_write(fd, b"0123456789").unwrap();
        // Exactly end-of-file is fine.
        if do_lseek(fd, 0, Whence::End).unwrap() != 10 {
            return 1;
        }
        if do_lseek(fd, -10, Whence::End).unwrap() != 0 {
            return 2;
        }
        match do_lseek(fd, -11, Whence::End) {
            Err(Errno::EINVAL) => {}
            _ => return 3,
        }
        match do_lseek(fd, -1, Whence::Set) {
            Err(Errno::EINVAL) => {}
            _ => return 4,
        }
        do_close(fd).unwrap();
        0
    });
    assert_eq!(status, 0);
}

#[test]
fn stat_and_mknod() {
    let status = common::boot(|| {
        match do_stat("") {
            Err(Errno::EINVAL) => {}
            _ => return 1,
        }
        let st = do_stat("/").unwrap();
        if st.kind != VnodeKind::Directory {
            return 2;
        }
        do_mknod("/null", VnodeKind::CharDev, 0x0101).unwrap();
        if do_stat("/null").unwrap().kind != VnodeKind::CharDev {
            return 3;
        }
        match do_mknod("/null", VnodeKind::CharDev, 0x0101) {
            Err(Errno::EEXIST) => {}
            _ => return 4,
        }
        match do_mknod("/reg", VnodeKind::Regular, 0) {
            Err(Errno::EINVAL) => {}
            _ => return 5,
        }
        // Device data ops are not wired to drivers here.
        let fd = do_open("/null", O_RDONLY).unwrap() as i32;
        match do_read(fd, &mut [0u8; 1]) {
            Err(Errno::ENXIO) => {}
            _ => return 6,
        }
        do_close(fd).unwrap();
        0
    });
    assert_eq!(status, 0);
}

#[test]
fn pipe_round_trip_and_eof() {
    let status = common::boot(|| {
        let (rfd, wfd) = do_pipe().unwrap();
        let (rfd, wfd) = (rfd as i32, wfd as i32);
        if do_write(wfd, b"hello").unwrap() != 5 {
            return 1;
        }
        let mut buf = [0u8; 5];
        if do_read(rfd, &mut buf).unwrap() != 5 || &buf != b"hello" {
            return 2;
        }
        // Last writer gone: drained ring then EOF.
        do_write(wfd, b"x").unwrap();
        do_close(wfd).unwrap();
        let mut one = [0u8; 4];
        if do_read(rfd, &mut one).unwrap() != 1 {
            return 3;
        }
        if do_read(rfd, &mut one).unwrap() != 0 {
            return 4;
        }
        do_close(rfd).unwrap();

        // No readers: EPIPE.
        let (rfd, wfd) = do_pipe().unwrap();
        do_close(rfd as i32).unwrap();
        match do_write(wfd as i32, b"z") {
            Err(Errno::EPIPE) => {}
            _ => return 5,
        }
        do_close(wfd as i32).unwrap();
        0
    });
    assert_eq!(status, 0);
}

#[test]
fn pipe_blocks_readers_until_data_arrives() {
    let status = common::boot(|| {
        let (rfd, wfd) = do_pipe().unwrap();
        let (rfd, wfd) = (rfd as i32, wfd as i32);

        let pid = do_fork(Box::new(move || {
            // Shed our copy of the write end, then block for data.
            do_close(wfd).unwrap();
            let mut buf = [0u8; 2];
            if do_read(rfd, &mut buf).unwrap() != 2 || &buf != b"hi" {
                return 1;
            }
            do_close(rfd).unwrap();
            0
        }))
        .unwrap();

        // Let the child block on the empty pipe first.
        for _ in 0..10 {
            sched::yield_now();
        }
        do_close(rfd).unwrap();
        do_write(wfd, b"hi").unwrap();
        do_close(wfd).unwrap();

        let (_, st) = do_waitpid(pid, 0).unwrap();
        st as i64
    });
    assert_eq!(status, 0);
}

#[test]
fn fork_shares_the_descriptor_table() {
    let status = common::boot(|| {
        let fd = do_open("/f", O_CREAT | O_RDWR).unwrap() as i32;
        do_write(fd, b"parent").unwrap();

        let pid = do_fork(Box::new(move || {
            // Same open file, same cursor.
            do_write(fd, b"+child").unwrap();
            0
        }))
        .unwrap();
        do_waitpid(pid, 0).unwrap();

        do_lseek(fd, 0, Whence::Set).unwrap();
        let mut buf = [0u8; 12];
        do_read(fd, &mut buf).unwrap();
        do_close(fd).unwrap();
        if &buf != b"parent+child" {
            return 1;
        }
        0
    });
    assert_eq!(status, 0);
}
