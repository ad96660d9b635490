use std::io;
use std::os::unix::io::{AsRawFd, BorrowedFd, FromRawFd, OwnedFd, RawFd};

use crate::capability::{self, Capability, Primitive};
use crate::util::{check_ret, check_ret_size, set_cloexec};

/// Errors from the close-on-exec constructors.
#[derive(Debug, thiserror::Error)]
pub enum CloexecError {
    /// The underlying primitive failed. The OS error is passed through untouched.
    #[error(transparent)]
    Os(io::Error),

    /// The primitive succeeded, but the new descriptor could not be marked close-on-exec. It has
    /// already been closed.
    #[error("descriptor created but could not be marked close-on-exec: {0}")]
    Harden(#[source] io::Error),
}

impl CloexecError {
    #[inline]
    pub fn raw_os_error(&self) -> Option<i32> {
        match self {
            CloexecError::Os(e) | CloexecError::Harden(e) => e.raw_os_error(),
        }
    }

    #[inline]
    pub fn is_harden(&self) -> bool {
        matches!(self, CloexecError::Harden(_))
    }
}

impl From<CloexecError> for io::Error {
    fn from(err: CloexecError) -> Self {
        match err {
            CloexecError::Os(e) | CloexecError::Harden(e) => e,
        }
    }
}

pub type Result<T> = std::result::Result<T, CloexecError>;

/// Run the atomic form of `primitive` if the host supports it, otherwise (or if the kernel
/// rejects the flag with `EINVAL`) the create-then-mark fallback.
///
/// An `EINVAL` only demotes the primitive if the fallback then succeeds; otherwise the
/// arguments were bad and the fallback's error is returned.
fn with_fallback<T, A, F>(primitive: Primitive, atomic: A, fallback: F) -> Result<T>
where
    A: FnOnce() -> io::Result<T>,
    F: FnOnce() -> Result<T>,
{
    if capability::capability(primitive) != Capability::Native {
        return fallback();
    }

    match atomic() {
        Err(e) if e.raw_os_error() == Some(libc::EINVAL) => {
            let res = fallback();
            if res.is_ok() {
                capability::demote(primitive);
            }
            res
        }
        res => res.map_err(CloexecError::Os),
    }
}

/// Take ownership of `fd` and mark it close-on-exec, closing it if that fails.
fn set_cloexec_or_close(fd: RawFd) -> Result<OwnedFd> {
    harden_with(fd, set_cloexec)
}

fn harden_with<M: FnOnce(RawFd) -> io::Result<()>>(fd: RawFd, mark: M) -> Result<OwnedFd> {
    let fd = unsafe { OwnedFd::from_raw_fd(fd) };
    mark(fd.as_raw_fd()).map_err(|err| {
        log::warn!("closing fd {}: cannot set FD_CLOEXEC: {}", fd.as_raw_fd(), err);
        CloexecError::Harden(err)
    })?;
    Ok(fd)
}

#[inline]
fn owned(fd: libc::c_int) -> io::Result<OwnedFd> {
    check_ret(fd).map(|fd| unsafe { OwnedFd::from_raw_fd(fd) })
}

/// Create a socket with the close-on-exec flag set.
pub fn socket_cloexec(
    domain: libc::c_int,
    ty: libc::c_int,
    protocol: libc::c_int,
) -> Result<OwnedFd> {
    with_fallback(
        Primitive::Socket,
        || socket_atomic(domain, ty, protocol),
        || socket_fallback(domain, ty, protocol),
    )
}

#[cfg(any(
    target_os = "linux",
    target_os = "android",
    target_os = "freebsd",
    target_os = "netbsd",
    target_os = "openbsd",
    target_os = "dragonfly",
))]
fn socket_atomic(
    domain: libc::c_int,
    ty: libc::c_int,
    protocol: libc::c_int,
) -> io::Result<OwnedFd> {
    owned(unsafe { libc::socket(domain, ty | libc::SOCK_CLOEXEC, protocol) })
}

#[cfg(not(any(
    target_os = "linux",
    target_os = "android",
    target_os = "freebsd",
    target_os = "netbsd",
    target_os = "openbsd",
    target_os = "dragonfly",
)))]
fn socket_atomic(
    _domain: libc::c_int,
    _ty: libc::c_int,
    _protocol: libc::c_int,
) -> io::Result<OwnedFd> {
    Err(io::Error::from_raw_os_error(libc::EINVAL))
}

fn socket_fallback(
    domain: libc::c_int,
    ty: libc::c_int,
    protocol: libc::c_int,
) -> Result<OwnedFd> {
    let fd = check_ret(unsafe { libc::socket(domain, ty, protocol) }).map_err(CloexecError::Os)?;
    set_cloexec_or_close(fd)
}

/// Duplicate `fd` onto the lowest free descriptor number that is `>= minfd`, with the
/// close-on-exec flag set on the copy.
pub fn dupfd_cloexec(fd: BorrowedFd<'_>, minfd: RawFd) -> Result<OwnedFd> {
    let fd = fd.as_raw_fd();

    with_fallback(
        Primitive::DupFd,
        || owned(unsafe { libc::fcntl(fd, libc::F_DUPFD_CLOEXEC, minfd) }),
        || dupfd_fallback(fd, minfd),
    )
}

fn dupfd_fallback(fd: RawFd, minfd: RawFd) -> Result<OwnedFd> {
    let newfd =
        check_ret(unsafe { libc::fcntl(fd, libc::F_DUPFD, minfd) }).map_err(CloexecError::Os)?;
    set_cloexec_or_close(newfd)
}

/// Receive a message; every descriptor passed in it via `SCM_RIGHTS` comes out close-on-exec.
///
/// Returns the number of bytes received. If the received descriptors cannot all be marked,
/// every one of them is closed and [`CloexecError::Harden`] is returned.
///
/// # Safety
///
/// `msg` must describe valid, writable buffers (`msg_iov` and, if non-null, `msg_control`).
pub unsafe fn recvmsg_cloexec(
    sockfd: BorrowedFd<'_>,
    msg: &mut libc::msghdr,
    flags: libc::c_int,
) -> Result<usize> {
    let sockfd = sockfd.as_raw_fd();
    // Only one of the two paths below touches the header per call
    let msg: *mut libc::msghdr = msg;

    match capability::capability(Primitive::RecvMsg) {
        // Don't pass the flag through even if the caller did; the kernel would mangle the
        // control messages.
        Capability::Broken => {
            recvmsg_fallback(sockfd, &mut *msg, flags & !recvmsg_cloexec_flag())
        }
        _ => with_fallback(
            Primitive::RecvMsg,
            || recvmsg_atomic(sockfd, &mut *msg, flags),
            || recvmsg_fallback(sockfd, &mut *msg, flags),
        ),
    }
}

#[cfg(any(target_os = "linux", target_os = "android", target_os = "freebsd"))]
#[inline]
fn recvmsg_cloexec_flag() -> libc::c_int {
    crate::sys::MSG_CMSG_CLOEXEC
}

#[cfg(not(any(target_os = "linux", target_os = "android", target_os = "freebsd")))]
#[inline]
fn recvmsg_cloexec_flag() -> libc::c_int {
    0
}

#[cfg(any(target_os = "linux", target_os = "android", target_os = "freebsd"))]
unsafe fn recvmsg_atomic(
    sockfd: RawFd,
    msg: &mut libc::msghdr,
    flags: libc::c_int,
) -> io::Result<usize> {
    check_ret_size(libc::recvmsg(sockfd, msg, flags | recvmsg_cloexec_flag()))
}

#[cfg(not(any(target_os = "linux", target_os = "android", target_os = "freebsd")))]
unsafe fn recvmsg_atomic(
    _sockfd: RawFd,
    _msg: &mut libc::msghdr,
    _flags: libc::c_int,
) -> io::Result<usize> {
    Err(io::Error::from_raw_os_error(libc::EINVAL))
}

unsafe fn recvmsg_fallback(
    sockfd: RawFd,
    msg: &mut libc::msghdr,
    flags: libc::c_int,
) -> Result<usize> {
    let len = check_ret_size(libc::recvmsg(sockfd, msg, flags)).map_err(CloexecError::Os)?;

    harden_received(msg, set_cloexec)?;

    Ok(len)
}

/// Apply `mark` to every descriptor received in `msg`. If any mark fails, every received
/// descriptor is closed.
unsafe fn harden_received<M>(msg: &libc::msghdr, mut mark: M) -> Result<()>
where
    M: FnMut(RawFd) -> io::Result<()>,
{
    let mut failure = None;
    for_each_received_fd(msg, |fd| {
        if failure.is_none() {
            if let Err(e) = mark(fd) {
                failure = Some(e);
            }
        }
    });

    match failure {
        Some(e) => {
            log::warn!("closing received descriptors: cannot set FD_CLOEXEC: {}", e);
            for_each_received_fd(msg, |fd| {
                libc::close(fd);
            });
            Err(CloexecError::Harden(e))
        }
        None => Ok(()),
    }
}

/// Call `f` on every descriptor carried in the `SCM_RIGHTS` control messages of `msg`.
unsafe fn for_each_received_fd<F: FnMut(RawFd)>(msg: &libc::msghdr, mut f: F) {
    if msg.msg_control.is_null() {
        return;
    }

    let mut cmsg = libc::CMSG_FIRSTHDR(msg);
    while !cmsg.is_null() {
        let hdr = &*cmsg;

        if hdr.cmsg_level == libc::SOL_SOCKET && hdr.cmsg_type == libc::SCM_RIGHTS {
            let data = libc::CMSG_DATA(cmsg) as *const RawFd;
            let payload = hdr.cmsg_len as usize - libc::CMSG_LEN(0) as usize;

            for i in 0..payload / std::mem::size_of::<RawFd>() {
                f(std::ptr::read_unaligned(data.add(i)));
            }
        }

        cmsg = libc::CMSG_NXTHDR(msg, cmsg);
    }
}

/// Receive into `buf`, accepting up to `max_fds` descriptors passed with `SCM_RIGHTS`.
///
/// Returns the number of bytes received and the descriptors, all close-on-exec.
pub fn recv_with_fds(
    sockfd: BorrowedFd<'_>,
    buf: &mut [u8],
    max_fds: usize,
) -> Result<(usize, Vec<OwnedFd>)> {
    let mut iov = libc::iovec {
        iov_base: buf.as_mut_ptr() as *mut libc::c_void,
        iov_len: buf.len(),
    };

    let space = if max_fds == 0 {
        0
    } else {
        unsafe { libc::CMSG_SPACE((max_fds * std::mem::size_of::<RawFd>()) as _) as usize }
    };
    // u64 words keep the control buffer aligned for cmsghdr
    let mut control = vec![0u64; (space + 7) / 8];

    let mut msg: libc::msghdr = unsafe { std::mem::zeroed() };
    msg.msg_iov = &mut iov;
    msg.msg_iovlen = 1;
    if space > 0 {
        msg.msg_control = control.as_mut_ptr() as *mut libc::c_void;
        msg.msg_controllen = space as _;
    }

    let len = unsafe { recvmsg_cloexec(sockfd, &mut msg, 0)? };

    if msg.msg_flags & libc::MSG_CTRUNC != 0 {
        log::warn!("control data truncated; some passed descriptors were dropped");
    }

    let mut fds = Vec::new();
    unsafe {
        for_each_received_fd(&msg, |fd| fds.push(OwnedFd::from_raw_fd(fd)));
    }

    Ok((len, fds))
}

/// Create an event queue (epoll on Linux, kqueue on the BSDs and macOS) with the close-on-exec
/// flag set.
pub fn event_queue_cloexec() -> Result<OwnedFd> {
    with_fallback(Primitive::EventQueue, event_queue_atomic, event_queue_fallback)
}

#[cfg(any(target_os = "linux", target_os = "android"))]
fn event_queue_atomic() -> io::Result<OwnedFd> {
    owned(unsafe { libc::epoll_create1(libc::EPOLL_CLOEXEC) })
}

#[cfg(not(any(target_os = "linux", target_os = "android")))]
fn event_queue_atomic() -> io::Result<OwnedFd> {
    Err(io::Error::from_raw_os_error(libc::EINVAL))
}

#[cfg(any(target_os = "linux", target_os = "android"))]
fn event_queue_fallback() -> Result<OwnedFd> {
    // The size hint is ignored but must be positive
    let fd = check_ret(unsafe { libc::epoll_create(1) }).map_err(CloexecError::Os)?;
    set_cloexec_or_close(fd)
}

#[cfg(any(
    target_os = "macos",
    target_os = "ios",
    target_os = "freebsd",
    target_os = "netbsd",
    target_os = "openbsd",
    target_os = "dragonfly",
))]
fn event_queue_fallback() -> Result<OwnedFd> {
    let fd = check_ret(unsafe { libc::kqueue() }).map_err(CloexecError::Os)?;
    set_cloexec_or_close(fd)
}

#[cfg(not(any(
    target_os = "linux",
    target_os = "android",
    target_os = "macos",
    target_os = "ios",
    target_os = "freebsd",
    target_os = "netbsd",
    target_os = "openbsd",
    target_os = "dragonfly",
)))]
fn event_queue_fallback() -> Result<OwnedFd> {
    Err(CloexecError::Os(io::Error::from_raw_os_error(libc::ENOSYS)))
}

/// Accept a connection on a listening socket; the new connection is close-on-exec.
///
/// If `addr` is given, the peer address is written into it. Returns the connected socket and
/// the length of the address the kernel reported.
pub fn accept_cloexec(
    sockfd: BorrowedFd<'_>,
    addr: Option<&mut libc::sockaddr_storage>,
) -> Result<(OwnedFd, libc::socklen_t)> {
    let sockfd = sockfd.as_raw_fd();

    let (addr_ptr, mut addrlen) = match addr {
        Some(storage) => (
            storage as *mut libc::sockaddr_storage as *mut libc::sockaddr,
            std::mem::size_of::<libc::sockaddr_storage>() as libc::socklen_t,
        ),
        None => (std::ptr::null_mut(), 0),
    };
    let addrlen_ptr = if addr_ptr.is_null() {
        std::ptr::null_mut()
    } else {
        &mut addrlen as *mut libc::socklen_t
    };

    let fd = with_fallback(
        Primitive::Accept,
        || unsafe { accept_atomic(sockfd, addr_ptr, addrlen_ptr) },
        || unsafe { accept_fallback(sockfd, addr_ptr, addrlen_ptr) },
    )?;

    Ok((fd, addrlen))
}

#[cfg(any(
    target_os = "linux",
    target_os = "android",
    target_os = "freebsd",
    target_os = "netbsd",
    target_os = "openbsd",
    target_os = "dragonfly",
))]
unsafe fn accept_atomic(
    sockfd: RawFd,
    addr: *mut libc::sockaddr,
    addrlen: *mut libc::socklen_t,
) -> io::Result<OwnedFd> {
    owned(libc::accept4(sockfd, addr, addrlen, libc::SOCK_CLOEXEC))
}

#[cfg(not(any(
    target_os = "linux",
    target_os = "android",
    target_os = "freebsd",
    target_os = "netbsd",
    target_os = "openbsd",
    target_os = "dragonfly",
)))]
unsafe fn accept_atomic(
    _sockfd: RawFd,
    _addr: *mut libc::sockaddr,
    _addrlen: *mut libc::socklen_t,
) -> io::Result<OwnedFd> {
    Err(io::Error::from_raw_os_error(libc::EINVAL))
}

unsafe fn accept_fallback(
    sockfd: RawFd,
    addr: *mut libc::sockaddr,
    addrlen: *mut libc::socklen_t,
) -> Result<OwnedFd> {
    let fd = check_ret(libc::accept(sockfd, addr, addrlen)).map_err(CloexecError::Os)?;
    set_cloexec_or_close(fd)
}
