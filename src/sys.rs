#[cfg(target_os = "freebsd")]
pub const KERN_PROC_NFDS: libc::c_int = 43;

#[cfg(target_os = "freebsd")]
pub const KERN_PROC_FILEDESC: libc::c_int = 33;

// struct kinfo_file begins with `int kf_structsize; int kf_type; int kf_fd;`. Only those three
// fields are read, so the rest of the (large, version-dependent) layout is left opaque.
#[cfg(target_os = "freebsd")]
pub const KF_STRUCTSIZE_OFFSET: usize = 0;
#[cfg(target_os = "freebsd")]
pub const KF_FD_OFFSET: usize = 8;

#[cfg(target_os = "freebsd")]
pub const MSG_CMSG_CLOEXEC: libc::c_int = 0x0004_0000;

#[cfg(any(target_os = "linux", target_os = "android"))]
pub const MSG_CMSG_CLOEXEC: libc::c_int = libc::MSG_CMSG_CLOEXEC;

#[cfg(target_os = "linux")]
#[inline]
pub unsafe fn errno_location() -> *mut libc::c_int {
    libc::__errno_location()
}

#[cfg(any(target_os = "android", target_os = "netbsd", target_os = "openbsd"))]
#[inline]
pub unsafe fn errno_location() -> *mut libc::c_int {
    libc::__errno()
}

#[cfg(any(
    target_os = "macos",
    target_os = "ios",
    target_os = "freebsd",
    target_os = "dragonfly"
))]
#[inline]
pub unsafe fn errno_location() -> *mut libc::c_int {
    libc::__error()
}

#[cfg(any(target_os = "solaris", target_os = "illumos"))]
#[inline]
pub unsafe fn errno_location() -> *mut libc::c_int {
    libc::___errno()
}

#[inline]
pub fn clear_errno() {
    unsafe {
        *errno_location() = 0;
    }
}
