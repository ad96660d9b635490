use std::ffi::CStr;
use std::fmt;
use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicU8, Ordering};

use crate::fault::{Fault, OrFatal};

mod dirfd;
#[cfg(target_os = "freebsd")]
mod proctable;

use dirfd::DirFds;

/// One descriptor from an [`OpenFdSet`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct OpenFd {
    fd: RawFd,
    flags: Option<libc::c_int>,
    target: Option<String>,
}

impl OpenFd {
    #[inline]
    pub fn fd(&self) -> RawFd {
        self.fd
    }

    /// The descriptor flags (`F_GETFD`) at snapshot time, if they could be read.
    #[inline]
    pub fn flags(&self) -> Option<libc::c_int> {
        self.flags
    }

    #[inline]
    pub fn is_cloexec(&self) -> Option<bool> {
        self.flags
            .map(|flags| flags & libc::FD_CLOEXEC == libc::FD_CLOEXEC)
    }

    /// What the descriptor refers to. Only filled in by verbose snapshots, and only where the
    /// system exposes it.
    #[inline]
    pub fn target(&self) -> Option<&str> {
        self.target.as_deref()
    }
}

/// A point-in-time listing of the descriptors open in this process, in ascending order.
///
/// The descriptor used to take the listing is never part of it.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct OpenFdSet {
    entries: Vec<OpenFd>,
}

impl OpenFdSet {
    #[inline]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn contains(&self, fd: RawFd) -> bool {
        self.entries.binary_search_by_key(&fd, |ent| ent.fd).is_ok()
    }

    #[inline]
    pub fn iter(&self) -> std::slice::Iter<'_, OpenFd> {
        self.entries.iter()
    }

    pub fn fds(&self) -> impl Iterator<Item = RawFd> + '_ {
        self.entries.iter().map(|ent| ent.fd)
    }

    /// The number of descriptors that would survive an `exec()`: those whose flags were read
    /// and do not include `FD_CLOEXEC`.
    pub fn inheritable_count(&self) -> usize {
        self.entries
            .iter()
            .filter(|ent| ent.is_cloexec() == Some(false))
            .count()
    }
}

impl<'a> IntoIterator for &'a OpenFdSet {
    type Item = &'a OpenFd;
    type IntoIter = std::slice::Iter<'a, OpenFd>;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}

impl fmt::Display for OpenFdSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, ent) in self.entries.iter().enumerate() {
            write!(
                f,
                "fd[{}]={}, path={}",
                i,
                ent.fd,
                ent.target.as_deref().unwrap_or("?")
            )?;

            match ent.flags {
                Some(flags) => {
                    write!(f, ", flags={:#x}", flags)?;
                    if flags & libc::FD_CLOEXEC == libc::FD_CLOEXEC {
                        f.write_str(" (includes FD_CLOEXEC)")?;
                    }
                }
                None => f.write_str(", flags=?")?,
            }

            writeln!(f)?;
        }

        Ok(())
    }
}

/// Where the list of open descriptors comes from on this host.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FdSource {
    /// `/proc/self/fd`
    ProcSelfFd,
    /// `/dev/fd`
    DevFd,
    /// The kernel's per-process descriptor table, cross-checked against a count-only query.
    ProcessTable,
}

// 0=unresolved
static SOURCE: AtomicU8 = AtomicU8::new(0);

impl FdSource {
    /// The source used by every enumeration in this process, chosen on first use.
    pub fn current() -> Result<Self, Fault> {
        match SOURCE.load(Ordering::Relaxed) {
            1 => Ok(FdSource::ProcSelfFd),
            2 => Ok(FdSource::DevFd),
            3 => Ok(FdSource::ProcessTable),

            _ => {
                let source = Self::detect()?;
                SOURCE.store(source.as_u8(), Ordering::Relaxed);
                log::debug!("enumerating descriptors via {:?}", source);
                Ok(source)
            }
        }
    }

    #[inline]
    fn as_u8(self) -> u8 {
        match self {
            FdSource::ProcSelfFd => 1,
            FdSource::DevFd => 2,
            FdSource::ProcessTable => 3,
        }
    }

    fn path(self) -> Option<&'static CStr> {
        match self {
            FdSource::ProcSelfFd => Some(proc_self_fd()),
            FdSource::DevFd => Some(dev_fd()),
            FdSource::ProcessTable => None,
        }
    }

    #[cfg(any(target_os = "linux", target_os = "android"))]
    fn detect() -> Result<Self, Fault> {
        // /dev/fd is normally a symlink to /proc/self/fd, but some minimal environments only
        // provide one of the two
        try_dir(FdSource::ProcSelfFd).or_else(|err| try_dir(FdSource::DevFd).map_err(|_| err))
    }

    #[cfg(any(target_os = "macos", target_os = "ios"))]
    fn detect() -> Result<Self, Fault> {
        try_dir(FdSource::DevFd)
    }

    #[cfg(target_os = "netbsd")]
    fn detect() -> Result<Self, Fault> {
        // /dev/fd is a static directory on NetBSD
        try_dir(FdSource::ProcSelfFd)
    }

    #[cfg(any(target_os = "solaris", target_os = "illumos"))]
    fn detect() -> Result<Self, Fault> {
        try_dir(FdSource::DevFd).or_else(|err| try_dir(FdSource::ProcSelfFd).map_err(|_| err))
    }

    #[cfg(target_os = "freebsd")]
    fn detect() -> Result<Self, Fault> {
        // /dev/fd is usually a static directory with only entries for 0, 1, and 2. It is only
        // accurate when an fdescfs is mounted there, which puts it on a different device than
        // /dev.
        let mut dev_stat = std::mem::MaybeUninit::uninit();
        let mut devfd_stat = std::mem::MaybeUninit::uninit();

        let is_fdescfs = unsafe {
            libc::stat(b"/dev\0".as_ptr() as *const _, dev_stat.as_mut_ptr()) == 0
                && libc::stat(dev_fd().as_ptr(), devfd_stat.as_mut_ptr()) == 0
                && dev_stat.assume_init().st_dev != devfd_stat.assume_init().st_dev
        };

        if is_fdescfs {
            if let Ok(source) = try_dir(FdSource::DevFd) {
                return Ok(source);
            }
        }

        Ok(FdSource::ProcessTable)
    }

    #[cfg(not(any(
        target_os = "linux",
        target_os = "android",
        target_os = "macos",
        target_os = "ios",
        target_os = "netbsd",
        target_os = "solaris",
        target_os = "illumos",
        target_os = "freebsd",
    )))]
    fn detect() -> Result<Self, Fault> {
        Err(Fault::NoSource)
    }
}

#[inline]
fn proc_self_fd() -> &'static CStr {
    unsafe { CStr::from_bytes_with_nul_unchecked(b"/proc/self/fd\0") }
}

#[inline]
fn dev_fd() -> &'static CStr {
    unsafe { CStr::from_bytes_with_nul_unchecked(b"/dev/fd\0") }
}

#[cfg_attr(
    not(any(
        target_os = "linux",
        target_os = "android",
        target_os = "macos",
        target_os = "ios",
        target_os = "netbsd",
        target_os = "solaris",
        target_os = "illumos",
        target_os = "freebsd",
    )),
    allow(dead_code)
)]
fn try_dir(source: FdSource) -> Result<FdSource, Fault> {
    open_dir(source.path().ok_or(Fault::NoSource)?).map(|_| source)
}

fn open_dir(path: &'static CStr) -> Result<DirFds, Fault> {
    DirFds::open(path).map_err(|err| Fault::SourceUnavailable {
        path: path.to_str().unwrap_or("<descriptor directory>"),
        source: err,
    })
}

#[cfg(target_os = "freebsd")]
fn process_table_fds() -> Result<Vec<RawFd>, Fault> {
    proctable::list_fds()
}

#[cfg(target_os = "freebsd")]
fn process_table_count() -> Result<usize, Fault> {
    proctable::count_fds()
}

#[cfg(not(target_os = "freebsd"))]
fn process_table_fds() -> Result<Vec<RawFd>, Fault> {
    Err(Fault::NoSource)
}

#[cfg(not(target_os = "freebsd"))]
fn process_table_count() -> Result<usize, Fault> {
    Err(Fault::NoSource)
}

#[inline]
fn read_flags(fd: RawFd) -> Option<libc::c_int> {
    crate::util::fd_flags(fd).ok()
}

/// A "builder" for taking [`OpenFdSet`] snapshots.
///
/// Faults (an unreadable or malformed introspection source, a count mismatch) abort the process
/// from [`snapshot()`](Self::snapshot) and [`count()`](Self::count). The `try_*` forms return
/// them instead.
#[derive(Clone, Debug, Default)]
pub struct FdEnumerator {
    verbose: bool,
}

impl FdEnumerator {
    #[inline]
    pub fn new() -> Self {
        Self { verbose: false }
    }

    /// Set whether snapshots resolve what each descriptor refers to (default is `false`).
    ///
    /// This only adds diagnostic detail; the set of descriptors is the same either way.
    #[inline]
    pub fn verbose(&mut self, verbose: bool) -> &mut Self {
        self.verbose = verbose;
        self
    }

    pub fn try_snapshot(&self) -> Result<OpenFdSet, Fault> {
        let source = FdSource::current()?;

        let mut entries = Vec::new();

        match source.path() {
            Some(path) => {
                let mut dir = open_dir(path)?;
                let verbose = self.verbose;

                let mut found = Vec::new();
                dir.for_each(|fd, name| {
                    found.push((fd, name.to_owned()));
                })?;

                for (fd, name) in found {
                    entries.push(OpenFd {
                        fd,
                        flags: read_flags(fd),
                        target: if verbose { dir.read_target(&name) } else { None },
                    });
                }
            }

            None => {
                for fd in process_table_fds()? {
                    entries.push(OpenFd {
                        fd,
                        flags: read_flags(fd),
                        target: None,
                    });
                }
            }
        }

        entries.sort_unstable_by_key(|ent| ent.fd);

        Ok(OpenFdSet { entries })
    }

    #[inline]
    pub fn snapshot(&self) -> OpenFdSet {
        self.try_snapshot().or_fatal()
    }

    /// Count the open descriptors without collecting any per-descriptor detail.
    pub fn try_count(&self) -> Result<usize, Fault> {
        match FdSource::current()?.path() {
            Some(path) => {
                let mut count = 0;
                open_dir(path)?.for_each(|_, _| count += 1)?;
                Ok(count)
            }
            None => process_table_count(),
        }
    }

    #[inline]
    pub fn count(&self) -> usize {
        self.try_count().or_fatal()
    }
}

/// Take a snapshot of the open descriptors.
#[inline]
pub fn open_fds() -> OpenFdSet {
    FdEnumerator::new().snapshot()
}

/// Count the open descriptors.
#[inline]
pub fn count_open_fds() -> usize {
    FdEnumerator::new().count()
}

/// Print every open descriptor, with its target and flags, to stderr. Returns the count.
pub fn list_open_fds() -> usize {
    let set = FdEnumerator::new().verbose(true).snapshot();
    eprint!("{}", set);
    set.len()
}
