use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use cloexec_fds::Fault;

extern "C" fn ignore_signal(_sig: libc::c_int) {}

static ALARMS: AtomicUsize = AtomicUsize::new(0);

extern "C" fn count_alarm(_sig: libc::c_int) {
    ALARMS.fetch_add(1, Ordering::SeqCst);
}

fn set_sigalrm_handler(handler: libc::sighandler_t) {
    unsafe {
        let mut action: libc::sigaction = std::mem::zeroed();
        action.sa_sigaction = handler;
        // No SA_RESTART, so the sleep sees EINTR
        action.sa_flags = 0;
        libc::sigemptyset(&mut action.sa_mask);
        assert_eq!(
            libc::sigaction(libc::SIGALRM, &action, std::ptr::null_mut()),
            0
        );
    }
}

/// Run `child` in a forked (and therefore single-threaded) process so that `SIGALRM` is
/// delivered to the sleeping thread. Returns the raw wait status.
fn run_in_child(child: fn() -> libc::c_int) -> libc::c_int {
    match unsafe { libc::fork() } {
        -1 => panic!("fork() failed: {}", std::io::Error::last_os_error()),
        0 => unsafe { libc::_exit(child()) },
        pid => {
            let mut status = 0;
            assert_eq!(unsafe { libc::waitpid(pid, &mut status, 0) }, pid);
            status
        }
    }
}

fn alarm_preserved_test() {
    unsafe {
        libc::alarm(5);
    }

    let start = Instant::now();
    cloexec_fds::sleep(Duration::from_millis(50));
    assert!(start.elapsed() >= Duration::from_millis(50));

    // Still pending, and not pushed back
    let remaining = unsafe { libc::alarm(0) };
    assert!(remaining >= 1 && remaining <= 5, "{}", remaining);
}

fn alarm_fires_child() -> libc::c_int {
    set_sigalrm_handler(count_alarm as libc::sighandler_t);

    unsafe {
        libc::alarm(1);
    }
    cloexec_fds::sleep(Duration::from_millis(50));

    if ALARMS.load(Ordering::SeqCst) != 0 {
        return 1;
    }

    // Re-arm with whatever is left; a cancelled alarm would leave pause() waiting forever
    let remaining = unsafe { libc::alarm(0) };
    if remaining == 0 {
        return 2;
    }
    unsafe {
        libc::alarm(remaining);
        libc::pause();
    }

    if ALARMS.load(Ordering::SeqCst) == 1 {
        0
    } else {
        3
    }
}

fn alarm_fires_test() {
    let status = run_in_child(alarm_fires_child);
    assert!(libc::WIFEXITED(status), "{:#x}", status);
    assert_eq!(libc::WEXITSTATUS(status), 0);
}

fn interrupted_child() -> libc::c_int {
    set_sigalrm_handler(ignore_signal as libc::sighandler_t);

    let start = Instant::now();
    unsafe {
        libc::alarm(1);
    }

    match cloexec_fds::try_sleep(Duration::from_secs(3)) {
        Err(Fault::WaitInterrupted(err))
            if err.raw_os_error() == Some(libc::EINTR)
                && start.elapsed() < Duration::from_secs(3) =>
        {
            0
        }
        _ => 1,
    }
}

fn interrupted_fatal_child() -> libc::c_int {
    cloexec_fds::disable_coredumps();
    set_sigalrm_handler(ignore_signal as libc::sighandler_t);

    unsafe {
        libc::alarm(1);
    }
    cloexec_fds::sleep_secs(3);

    // Unreachable if the interruption aborted
    0
}

fn interrupted_test() {
    let status = run_in_child(interrupted_child);
    assert!(libc::WIFEXITED(status));
    assert_eq!(libc::WEXITSTATUS(status), 0);

    let status = run_in_child(interrupted_fatal_child);
    assert!(libc::WIFSIGNALED(status), "{:#x}", status);
    assert_eq!(libc::WTERMSIG(status), libc::SIGABRT);
}

fn default_handler_test() {
    set_sigalrm_handler(libc::SIG_DFL);

    cloexec_fds::try_sleep(Duration::from_millis(10)).unwrap();
    cloexec_fds::try_sleep_secs(0).unwrap();
}

#[test]
fn run_tests() {
    // Run all tests here because alarms are process-wide

    alarm_preserved_test();
    alarm_fires_test();
    interrupted_test();
    default_handler_test();
}
