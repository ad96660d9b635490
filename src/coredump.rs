/// Try to stop the current process from dumping core.
///
/// Useful ahead of tests that crash on purpose, so they don't leave core files behind or wake
/// up a crash handler service. This zeroes the soft `RLIMIT_CORE` and, on Linux, clears the
/// dumpable attribute (which also makes the process harder to attach a debugger to).
///
/// Both steps are best-effort; failures are only logged.
pub fn disable_coredumps() {
    let mut rlim = std::mem::MaybeUninit::<libc::rlimit>::uninit();

    if unsafe { libc::getrlimit(libc::RLIMIT_CORE, rlim.as_mut_ptr()) } == 0 {
        let mut rlim = unsafe { rlim.assume_init() };
        rlim.rlim_cur = 0;

        if unsafe { libc::setrlimit(libc::RLIMIT_CORE, &rlim) } != 0 {
            log::debug!(
                "setrlimit(RLIMIT_CORE) failed: {}",
                std::io::Error::last_os_error()
            );
        }
    } else {
        log::debug!(
            "getrlimit(RLIMIT_CORE) failed: {}",
            std::io::Error::last_os_error()
        );
    }

    clear_dumpable();
}

#[cfg(any(target_os = "linux", target_os = "android"))]
fn clear_dumpable() {
    if unsafe { libc::prctl(libc::PR_SET_DUMPABLE, 0, 0, 0, 0) } != 0 {
        log::debug!(
            "prctl(PR_SET_DUMPABLE) failed: {}",
            std::io::Error::last_os_error()
        );
    }
}

#[cfg(not(any(target_os = "linux", target_os = "android")))]
#[inline]
fn clear_dumpable() {}
