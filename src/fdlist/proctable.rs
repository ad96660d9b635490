//! Descriptor listing from the FreeBSD process table (`kern.proc.filedesc`), for systems that
//! don't have an fdescfs mounted on `/dev/fd`.

use std::io;
use std::os::unix::io::RawFd;

use crate::fault::Fault;
use crate::sys;

/// List the open descriptors of the current process, checked against `kern.proc.nfds`.
pub fn list_fds() -> Result<Vec<RawFd>, Fault> {
    let buf = filedesc_table()?;
    let fds = parse_kinfo_files(&buf)?;

    let counted = count_fds()?;
    if fds.len() != counted {
        return Err(Fault::CountMismatch {
            listed: fds.len(),
            counted,
        });
    }

    Ok(fds)
}

/// Ask the kernel how many descriptors the current process has open.
pub fn count_fds() -> Result<usize, Fault> {
    let mib = [libc::CTL_KERN, libc::KERN_PROC, sys::KERN_PROC_NFDS, 0];
    let mut nfds: libc::c_int = 0;
    let mut oldlen = std::mem::size_of::<libc::c_int>();

    if unsafe {
        libc::sysctl(
            mib.as_ptr(),
            mib.len() as libc::c_uint,
            &mut nfds as *mut libc::c_int as *mut libc::c_void,
            &mut oldlen,
            std::ptr::null(),
            0,
        )
    } != 0
    {
        return Err(Fault::ProcessTable(io::Error::last_os_error()));
    }

    if nfds < 0 {
        return Err(Fault::ProcessTable(io::Error::from_raw_os_error(
            libc::EINVAL,
        )));
    }

    Ok(nfds as usize)
}

fn filedesc_table() -> Result<Vec<u8>, Fault> {
    let mib = [
        libc::CTL_KERN,
        libc::KERN_PROC,
        sys::KERN_PROC_FILEDESC,
        unsafe { libc::getpid() },
    ];

    loop {
        let mut len = 0;
        if unsafe {
            libc::sysctl(
                mib.as_ptr(),
                mib.len() as libc::c_uint,
                std::ptr::null_mut(),
                &mut len,
                std::ptr::null(),
                0,
            )
        } != 0
        {
            return Err(Fault::ProcessTable(io::Error::last_os_error()));
        }

        // Leave room for descriptors opened by other threads in the meantime
        len = len * 4 / 3;
        let mut buf = vec![0u8; len];

        if unsafe {
            libc::sysctl(
                mib.as_ptr(),
                mib.len() as libc::c_uint,
                buf.as_mut_ptr() as *mut libc::c_void,
                &mut len,
                std::ptr::null(),
                0,
            )
        } == 0
        {
            buf.truncate(len);
            return Ok(buf);
        }

        let err = io::Error::last_os_error();
        if err.raw_os_error() != Some(libc::ENOMEM) {
            return Err(Fault::ProcessTable(err));
        }
    }
}

#[inline]
fn read_int(buf: &[u8], offset: usize) -> Option<libc::c_int> {
    let mut bytes = [0u8; std::mem::size_of::<libc::c_int>()];
    bytes.copy_from_slice(buf.get(offset..offset + bytes.len())?);
    Some(libc::c_int::from_ne_bytes(bytes))
}

/// Pull the descriptor numbers out of a packed array of `struct kinfo_file` records. Negative
/// numbers mark the cwd, root directory and similar non-descriptor entries; they are skipped.
fn parse_kinfo_files(buf: &[u8]) -> Result<Vec<RawFd>, Fault> {
    let mut fds = Vec::new();
    let mut offset = 0;

    while offset < buf.len() {
        let structsize = read_int(buf, offset + sys::KF_STRUCTSIZE_OFFSET);
        let fd = read_int(buf, offset + sys::KF_FD_OFFSET);

        match (structsize, fd) {
            (Some(structsize), Some(fd)) if structsize as usize > sys::KF_FD_OFFSET => {
                if fd >= 0 {
                    fds.push(fd);
                }
                offset += structsize as usize;
            }
            _ => {
                return Err(Fault::ProcessTable(io::Error::new(
                    io::ErrorKind::InvalidData,
                    "truncated kinfo_file record",
                )))
            }
        }
    }

    fds.sort_unstable();
    Ok(fds)
}
