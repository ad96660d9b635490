//! # Why is this crate useful?
//!
//! By default, any file descriptors opened by a process are inherited by any of that process's
//! children. A descriptor that is opened without the close-on-exec flag and then leaks into a
//! spawned program can keep sockets alive, hold locks, or hand a privileged file to code that
//! should never see it.
//!
//! Setting the flag *after* the descriptor is created leaves a window in which another thread
//! may `fork()` and `exec()`, taking the descriptor with it. This crate provides creation
//! primitives that set the flag atomically where the platform allows it, and tooling to check,
//! from a test, that nothing leaked.
//!
//! # Creation primitives
//!
//! - [`socket_cloexec()`]
//! - [`dupfd_cloexec()`]
//! - [`recvmsg_cloexec()`] (and the safe wrapper [`recv_with_fds()`])
//! - [`event_queue_cloexec()`]
//! - [`accept_cloexec()`]
//!
//! Each one uses the atomic flag if [`capability()`] reports it as `Native`. Otherwise (or if
//! the kernel rejects the flag at runtime) it creates the descriptor and then marks it
//! close-on-exec. Either way, a returned descriptor always has `FD_CLOEXEC` set; if the flag
//! could not be applied, the descriptor is closed and [`CloexecError::Harden`] is returned.
//!
//! **Note**: the non-atomic path is still racy with respect to concurrent `fork()`s. This is
//! inherent to the platforms that need it.
//!
//! # Leak checking
//!
//! ```no_run
//! // Open descriptors the way the code under test does
//! let _sock = cloexec_fds::socket_cloexec(libc::AF_UNIX, libc::SOCK_STREAM, 0).unwrap();
//!
//! // stdin, stdout and stderr should be the only survivors
//! cloexec_fds::exec_fd_leak_check(3u32);
//! ```
//!
//! [`exec_fd_leak_check()`] replaces the current process with the `exec-fd-leak-checker`
//! program, which exits successfully only if it finds exactly the expected number of open
//! descriptors. Run it in a forked child and check the exit status.
//!
//! Set `TEST_BUILD_DIR` to the directory holding the checker and `TEST_DEBUG_FD_LEAK_CHECK=1`
//! to list the open descriptors before each check.
//!
//! # Test helpers
//!
//! - [`FdEnumerator`] lists (or just counts) the descriptors open in the current process.
//! - [`sleep()`] and [`sleep_secs()`] wait without disturbing a pending `alarm()`.
//! - [`disable_coredumps()`] keeps tests that crash on purpose from leaving core files.
//!
//! # Faults
//!
//! If the environment is broken in a way that makes results meaningless (for example,
//! `/proc/self/fd` lists a non-numeric entry), the helpers above report a [`Fault`] and abort
//! the process. The `try_*` variants return the fault instead.

mod capability;
mod cloexec;
mod coredump;
mod fault;
mod fdlist;
mod leak;
mod sys;
mod timer;
mod util;

pub use capability::{capability, override_capability, Capability, Primitive};
pub use cloexec::{
    accept_cloexec, dupfd_cloexec, event_queue_cloexec, recv_with_fds, recvmsg_cloexec,
    socket_cloexec, CloexecError,
};
pub use coredump::disable_coredumps;
pub use fault::{fatal, Fault};
pub use fdlist::{
    count_open_fds, list_open_fds, open_fds, FdEnumerator, FdSource, OpenFd, OpenFdSet,
};
pub use leak::{
    exec_fd_leak_check, ExpectedFdCount, LeakCheck, LeakCheckConfig, ParseCountError,
    BUILD_DIR_VAR, DEBUG_VAR, LEAK_CHECKER_NAME,
};
pub use timer::{sleep, sleep_secs, try_sleep, try_sleep_secs};
pub use util::{is_cloexec, set_cloexec};
