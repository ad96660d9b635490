use std::ffi::CStr;
use std::io;
use std::os::unix::io::RawFd;

use crate::fault::Fault;
use crate::sys;
use crate::util::{check_ret, parse_int_bytes};

/// An open descriptor directory (`/proc/self/fd` or `/dev/fd`) with one entry per open
/// descriptor of the calling process.
pub struct DirFds {
    path: &'static CStr,
    dir: *mut libc::DIR,
    dirfd: RawFd,
}

impl DirFds {
    pub fn open(path: &'static CStr) -> io::Result<Self> {
        let dirfd = check_ret(unsafe {
            libc::open(
                path.as_ptr(),
                libc::O_RDONLY | libc::O_DIRECTORY | libc::O_CLOEXEC,
            )
        })?;

        let dir = unsafe { libc::fdopendir(dirfd) };
        if dir.is_null() {
            let err = io::Error::last_os_error();
            unsafe {
                libc::close(dirfd);
            }
            return Err(err);
        }

        Ok(Self { path, dir, dirfd })
    }

    /// Call `f` with every descriptor listed in the directory, except the directory's own.
    ///
    /// An entry that is not a descriptor number, a read error, or a listing that never mentions
    /// the directory's own descriptor is a [`Fault`].
    pub fn for_each<F: FnMut(RawFd, &CStr)>(&mut self, mut f: F) -> Result<(), Fault> {
        let mut found_self = false;

        loop {
            sys::clear_errno();
            let ent = unsafe { libc::readdir(self.dir) };

            if ent.is_null() {
                let err = io::Error::last_os_error();
                if err.raw_os_error() != Some(0) {
                    return Err(Fault::ReadFailed {
                        path: self.path_str(),
                        source: err,
                    });
                }
                break;
            }

            let name = unsafe { CStr::from_ptr((*ent).d_name.as_ptr()) };
            let bytes = name.to_bytes();

            if bytes == b"." || bytes == b".." {
                continue;
            }

            let fd = parse_int_bytes(bytes.iter().cloned()).ok_or_else(|| {
                Fault::UnexpectedEntry(String::from_utf8_lossy(bytes).into_owned())
            })?;

            if fd == self.dirfd {
                found_self = true;
                continue;
            }

            f(fd, name);
        }

        if found_self {
            Ok(())
        } else {
            Err(Fault::SelfNotObserved(self.dirfd))
        }
    }

    /// Resolve what the entry `name` refers to. Not every system exposes the entries as
    /// symlinks, so this may return `None`.
    pub fn read_target(&self, name: &CStr) -> Option<String> {
        let mut buf = [0u8; libc::PATH_MAX as usize];

        let len = unsafe {
            libc::readlinkat(
                self.dirfd,
                name.as_ptr(),
                buf.as_mut_ptr() as *mut libc::c_char,
                buf.len(),
            )
        };

        if len < 0 {
            None
        } else {
            Some(String::from_utf8_lossy(&buf[..len as usize]).into_owned())
        }
    }

    #[inline]
    pub fn path_str(&self) -> &'static str {
        self.path.to_str().unwrap_or("<descriptor directory>")
    }
}

impl Drop for DirFds {
    fn drop(&mut self) {
        // Also closes dirfd
        unsafe {
            libc::closedir(self.dir);
        }
    }
}
