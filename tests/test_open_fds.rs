use std::fs;
use std::os::unix::prelude::*;

use cloexec_fds::{FdEnumerator, FdSource, OpenFdSet};

fn is_fd_open(fd: RawFd) -> bool {
    unsafe { libc::fcntl(fd, libc::F_GETFD) >= 0 }
}

fn run_basic_test(callback: fn(fd1: RawFd, fd2: RawFd, fd3: RawFd)) {
    let f1 = fs::File::open("/").unwrap();
    let f2 = fs::File::open("/").unwrap();
    let f3 = fs::File::open("/").unwrap();

    let fd1 = f1.as_raw_fd();
    let fd2 = f2.as_raw_fd();
    let fd3 = f3.as_raw_fd();

    drop(f3);

    assert!(is_fd_open(fd1));
    assert!(is_fd_open(fd2));
    assert!(!is_fd_open(fd3));

    callback(fd1, fd2, fd3);
}

fn snapshot_test(fd1: RawFd, fd2: RawFd, fd3: RawFd) {
    let set = FdEnumerator::new().snapshot();

    assert!(set.contains(fd1));
    assert!(set.contains(fd2));
    assert!(!set.contains(fd3));

    let fds: Vec<RawFd> = set.fds().collect();
    let mut sorted = fds.clone();
    sorted.sort_unstable();
    sorted.dedup();
    assert_eq!(fds, sorted);

    // std opens everything close-on-exec
    for ent in &set {
        if ent.fd() == fd1 || ent.fd() == fd2 {
            assert_eq!(ent.is_cloexec(), Some(true));
        }
    }
}

fn matches_fcntl_scan_test(_fd1: RawFd, _fd2: RawFd, _fd3: RawFd) {
    let set = FdEnumerator::new().snapshot();
    let max = set.fds().max().unwrap_or(2);

    // The enumerator's own descriptor is closed again by now, so the two must agree exactly
    for fd in 0..=max + 16 {
        assert_eq!(set.contains(fd), is_fd_open(fd), "fd {}", fd);
    }
}

fn count_test(fd1: RawFd, fd2: RawFd, _fd3: RawFd) {
    let before = FdEnumerator::new().count();
    assert_eq!(before, FdEnumerator::new().snapshot().len());
    assert_eq!(before, cloexec_fds::count_open_fds());

    let dup1 = unsafe { libc::dup(fd1) };
    let dup2 = unsafe { libc::dup(fd2) };
    assert!(dup1 >= 0 && dup2 >= 0);

    assert_eq!(cloexec_fds::count_open_fds(), before + 2);

    unsafe {
        libc::close(dup1);
        libc::close(dup2);
    }

    assert_eq!(cloexec_fds::count_open_fds(), before);
}

fn inheritable_test(fd1: RawFd, _fd2: RawFd, _fd3: RawFd) {
    let before = cloexec_fds::open_fds();

    // dup() never copies FD_CLOEXEC
    let dup = unsafe { libc::dup(fd1) };
    assert!(dup >= 0);

    let after = cloexec_fds::open_fds();
    assert_eq!(after.len(), before.len() + 1);
    assert_eq!(after.inheritable_count(), before.inheritable_count() + 1);
    assert_eq!(cloexec_fds::is_cloexec(dup).unwrap(), false);

    cloexec_fds::set_cloexec(dup).unwrap();
    assert_eq!(cloexec_fds::is_cloexec(dup).unwrap(), true);

    let marked = cloexec_fds::open_fds();
    assert_eq!(marked.inheritable_count(), before.inheritable_count());

    unsafe {
        libc::close(dup);
    }
}

fn verbose_test(fd1: RawFd, _fd2: RawFd, _fd3: RawFd) {
    let set = FdEnumerator::new().verbose(true).snapshot();
    let plain = FdEnumerator::new().snapshot();

    // Verbosity only adds detail
    assert_eq!(
        set.fds().collect::<Vec<_>>(),
        plain.fds().collect::<Vec<_>>()
    );

    if FdSource::current().unwrap() == FdSource::ProcSelfFd {
        let ent = set.iter().find(|ent| ent.fd() == fd1).unwrap();
        assert_eq!(ent.target(), Some("/"));
    }

    let listing = set.to_string();
    assert_eq!(listing.lines().count(), set.len());
    assert!(listing.contains(&format!("={}, path=", fd1)));

    assert_eq!(cloexec_fds::list_open_fds(), plain.len());
}

fn empty_set_test(_fd1: RawFd, _fd2: RawFd, _fd3: RawFd) {
    let set = OpenFdSet::default();
    assert_eq!(set.to_string(), "");
    assert_eq!(set.inheritable_count(), 0);
}

#[test]
fn run_tests() {
    // Run all tests here because these tests can't be run in parallel

    run_basic_test(snapshot_test);
    run_basic_test(matches_fcntl_scan_test);

    run_basic_test(count_test);
    run_basic_test(inheritable_test);

    run_basic_test(verbose_test);
    run_basic_test(empty_set_test);
}
