use std::io;
use std::os::unix::io::RawFd;

/// Wrap the return value of a libc function in an [`io::Result`].
///
/// If the return value is -1, [`last_os_error()`](io::Error::last_os_error) is returned.
#[inline]
pub fn check_ret(ret: libc::c_int) -> io::Result<libc::c_int> {
    if ret == -1 {
        Err(io::Error::last_os_error())
    } else {
        Ok(ret)
    }
}

#[inline]
pub fn check_ret_size(ret: libc::ssize_t) -> io::Result<usize> {
    if ret < 0 {
        Err(io::Error::last_os_error())
    } else {
        Ok(ret as usize)
    }
}

#[cfg(test)]
#[inline]
pub fn is_fd_valid(fd: RawFd) -> bool {
    unsafe { libc::fcntl(fd, libc::F_GETFD) >= 0 }
}

#[inline]
pub fn fd_flags(fd: RawFd) -> io::Result<libc::c_int> {
    check_ret(unsafe { libc::fcntl(fd, libc::F_GETFD) })
}

/// Set the `FD_CLOEXEC` flag on `fd`, preserving any other descriptor flags.
///
/// Setting the flag after the descriptor was created leaves a window in which a concurrently
/// forking thread can inherit it. Prefer the atomic constructors in this crate.
pub fn set_cloexec(fd: RawFd) -> io::Result<()> {
    let flags = fd_flags(fd)?;

    if flags & libc::FD_CLOEXEC != libc::FD_CLOEXEC {
        check_ret(unsafe { libc::fcntl(fd, libc::F_SETFD, flags | libc::FD_CLOEXEC) })?;
    }

    Ok(())
}

/// Check whether `fd` carries the `FD_CLOEXEC` flag.
pub fn is_cloexec(fd: RawFd) -> io::Result<bool> {
    Ok(fd_flags(fd)? & libc::FD_CLOEXEC == libc::FD_CLOEXEC)
}

/// Parse an unsigned base-10 integer. Signs, whitespace, empty input and overflow are all
/// rejected.
pub fn parse_int_bytes<I: Iterator<Item = u8>>(it: I) -> Option<libc::c_int> {
    let mut num: libc::c_int = 0;
    let mut seen_any = false;

    for ch in it {
        if ch.is_ascii_digit() {
            num = num
                .checked_mul(10)?
                .checked_add((ch - b'0') as libc::c_int)?;
            seen_any = true;
        } else {
            return None;
        }
    }

    if seen_any {
        Some(num)
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn with_fd<F: FnOnce(RawFd)>(f: F) {
        let fd = unsafe { libc::open(b"/\0".as_ptr() as *const _, libc::O_RDONLY) };
        assert!(fd >= 0);

        f(fd);

        unsafe {
            libc::close(fd);
        }
    }

    #[test]
    fn test_parse_int_bytes() {
        assert_eq!(parse_int_bytes(b"0".iter().cloned()), Some(0));
        assert_eq!(parse_int_bytes(b"10".iter().cloned()), Some(10));
        assert_eq!(parse_int_bytes(b"1423".iter().cloned()), Some(1423));

        assert_eq!(parse_int_bytes(b" 0".iter().cloned()), None);
        assert_eq!(parse_int_bytes(b"0 ".iter().cloned()), None);
        assert_eq!(parse_int_bytes(b"-1".iter().cloned()), None);
        assert_eq!(parse_int_bytes(b"+1".iter().cloned()), None);
        assert_eq!(parse_int_bytes(b"1.".iter().cloned()), None);
        assert_eq!(parse_int_bytes(b".".iter().cloned()), None);
        assert_eq!(parse_int_bytes(b"".iter().cloned()), None);

        let too_big = (libc::c_int::MAX as libc::c_uint + 1).to_string();
        assert_eq!(parse_int_bytes(too_big.bytes()), None);
    }

    #[test]
    fn test_check_ret() {
        assert_eq!(check_ret(0).unwrap(), 0);
        assert_eq!(check_ret(7).unwrap(), 7);
        assert_eq!(check_ret_size(12).unwrap(), 12);

        assert!(check_ret(unsafe { libc::close(-1) }).is_err());
        let err = check_ret(unsafe { libc::fcntl(-1, libc::F_GETFD) }).unwrap_err();
        assert_eq!(err.raw_os_error(), Some(libc::EBADF));
    }

    #[test]
    fn test_is_fd_valid() {
        assert!(!is_fd_valid(-1));
        assert!(!is_fd_valid(libc::c_int::MAX));

        with_fd(|fd| {
            assert!(is_fd_valid(fd));
        });
    }

    #[test]
    fn test_set_cloexec() {
        assert_eq!(set_cloexec(-1).unwrap_err().raw_os_error(), Some(libc::EBADF));
        assert!(set_cloexec(libc::c_int::MAX).is_err());

        with_fd(|fd| {
            assert!(!is_cloexec(fd).unwrap());
            set_cloexec(fd).unwrap();
            assert!(is_cloexec(fd).unwrap());

            // Already set; nothing to do
            set_cloexec(fd).unwrap();
            assert!(is_cloexec(fd).unwrap());
        });
    }
}
