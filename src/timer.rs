//! Sleeping without disturbing `alarm()`-based test timeouts.
//!
//! `sleep()` and `usleep()` may be implemented with `SIGALRM`, so calling them while a test
//! runner has an alarm pending can cancel or retarget that alarm. These functions use
//! `nanosleep()`, which does not touch the alarm timer.
//!
//! An alarm that fires *during* the sleep interrupts it. That means the caller broke the rule
//! that it must not sleep across its own timeout, so the plain forms abort.

use std::convert::TryFrom;
use std::io;
use std::time::Duration;

use crate::fault::{Fault, OrFatal};

fn nanosleep(ts: &libc::timespec) -> Result<(), Fault> {
    if unsafe { libc::nanosleep(ts, std::ptr::null_mut()) } == 0 {
        Ok(())
    } else {
        Err(Fault::WaitInterrupted(io::Error::last_os_error()))
    }
}

fn duration_to_timespec(duration: Duration) -> libc::timespec {
    libc::timespec {
        tv_sec: libc::time_t::try_from(duration.as_secs()).unwrap_or(libc::time_t::MAX),
        tv_nsec: duration.subsec_nanos() as _,
    }
}

pub fn try_sleep(duration: Duration) -> Result<(), Fault> {
    nanosleep(&duration_to_timespec(duration))
}

/// Block the calling thread for at least `duration`.
#[inline]
pub fn sleep(duration: Duration) {
    try_sleep(duration).or_fatal()
}

pub fn try_sleep_secs(secs: u32) -> Result<(), Fault> {
    nanosleep(&libc::timespec {
        tv_sec: libc::time_t::try_from(secs).unwrap_or(libc::time_t::MAX),
        tv_nsec: 0,
    })
}

/// Block the calling thread for at least `secs` seconds.
#[inline]
pub fn sleep_secs(secs: u32) {
    try_sleep_secs(secs).or_fatal()
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::time::Instant;

    #[test]
    fn test_timespec_normalized() {
        let ts = duration_to_timespec(Duration::from_micros(1_500_000));
        assert_eq!(ts.tv_sec, 1);
        assert_eq!(ts.tv_nsec, 500_000_000);

        let ts = duration_to_timespec(Duration::from_micros(250));
        assert_eq!(ts.tv_sec, 0);
        assert_eq!(ts.tv_nsec, 250_000);

        let ts = duration_to_timespec(Duration::from_secs(u64::MAX));
        assert_eq!(ts.tv_sec, libc::time_t::MAX);
    }

    #[test]
    fn test_sleep_duration() {
        let wait = Duration::from_millis(20);
        let start = Instant::now();
        sleep(wait);
        assert!(start.elapsed() >= wait);

        let start = Instant::now();
        sleep(Duration::from_secs(0));
        assert!(start.elapsed() < Duration::from_secs(1));
    }

    #[test]
    fn test_sleep_secs() {
        let start = Instant::now();
        sleep_secs(1);
        assert!(start.elapsed() >= Duration::from_secs(1));

        try_sleep_secs(0).unwrap();
    }
}
