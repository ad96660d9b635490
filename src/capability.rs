//! Which close-on-exec mechanism each primitive uses on this host.
//!
//! Each [`Primitive`] resolves to a [`Capability`] the first time it is used. The answer is
//! cached for the lifetime of the process, except that a native primitive is demoted to
//! [`Capability::Emulated`] if the kernel turns out to reject the atomic flag.

use std::sync::atomic::{AtomicU8, Ordering};

/// A descriptor-creating operation that has an atomic close-on-exec form.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Primitive {
    Socket,
    DupFd,
    RecvMsg,
    EventQueue,
    Accept,
}

impl Primitive {
    pub const ALL: [Primitive; 5] = [
        Primitive::Socket,
        Primitive::DupFd,
        Primitive::RecvMsg,
        Primitive::EventQueue,
        Primitive::Accept,
    ];

    #[inline]
    fn index(self) -> usize {
        match self {
            Primitive::Socket => 0,
            Primitive::DupFd => 1,
            Primitive::RecvMsg => 2,
            Primitive::EventQueue => 3,
            Primitive::Accept => 4,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Primitive::Socket => "socket",
            Primitive::DupFd => "dupfd",
            Primitive::RecvMsg => "recvmsg",
            Primitive::EventQueue => "event queue",
            Primitive::Accept => "accept",
        }
    }
}

/// How a primitive obtains a close-on-exec descriptor.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Capability {
    /// The creating call takes a close-on-exec flag and applies it atomically.
    Native,
    /// The descriptor is created plainly, then marked with `fcntl()` before the wrapper returns.
    /// Another thread that forks in between inherits the descriptor.
    Emulated,
    /// The kernel accepts the atomic flag but is known to mishandle it, so the emulated path is
    /// used instead.
    Broken,
}

impl Capability {
    #[inline]
    fn from_u8(val: u8) -> Option<Self> {
        match val {
            0 => Some(Capability::Native),
            1 => Some(Capability::Emulated),
            2 => Some(Capability::Broken),
            _ => None,
        }
    }

    #[inline]
    fn as_u8(self) -> u8 {
        match self {
            Capability::Native => 0,
            Capability::Emulated => 1,
            Capability::Broken => 2,
        }
    }
}

const UNPROBED: u8 = u8::MAX;

#[allow(clippy::declare_interior_mutable_const)]
const UNPROBED_SLOT: AtomicU8 = AtomicU8::new(UNPROBED);

static CAPABILITIES: [AtomicU8; 5] = [UNPROBED_SLOT; 5];

/// Return the capability for `primitive`, probing it on first use.
pub fn capability(primitive: Primitive) -> Capability {
    let slot = &CAPABILITIES[primitive.index()];

    if let Some(cap) = Capability::from_u8(slot.load(Ordering::Relaxed)) {
        return cap;
    }

    let probed = probe(primitive);

    // Another thread may have probed (or been demoted) first; its answer wins.
    match slot.compare_exchange(
        UNPROBED,
        probed.as_u8(),
        Ordering::Relaxed,
        Ordering::Relaxed,
    ) {
        Ok(_) => {
            log::debug!("{} close-on-exec capability: {:?}", primitive.name(), probed);
            probed
        }
        Err(current) => Capability::from_u8(current).unwrap_or(probed),
    }
}

/// Force `primitive` onto a particular code path for the rest of the process.
///
/// This exists so the emulated and broken-kernel paths can be exercised on hosts where the
/// atomic flag works. Every path still returns close-on-exec descriptors.
pub fn override_capability(primitive: Primitive, cap: Capability) {
    CAPABILITIES[primitive.index()].store(cap.as_u8(), Ordering::Relaxed);
}

/// Record that the kernel rejected the atomic flag for `primitive`.
pub(crate) fn demote(primitive: Primitive) {
    if CAPABILITIES[primitive.index()]
        .compare_exchange(
            Capability::Native.as_u8(),
            Capability::Emulated.as_u8(),
            Ordering::Relaxed,
            Ordering::Relaxed,
        )
        .is_ok()
    {
        log::warn!(
            "kernel rejected atomic close-on-exec for {}; falling back to fcntl()",
            primitive.name()
        );
    }
}

fn probe(primitive: Primitive) -> Capability {
    match primitive {
        Primitive::Socket | Primitive::Accept => {
            if cfg!(any(
                target_os = "linux",
                target_os = "android",
                target_os = "freebsd",
                target_os = "netbsd",
                target_os = "openbsd",
                target_os = "dragonfly",
            )) {
                Capability::Native
            } else {
                Capability::Emulated
            }
        }

        // F_DUPFD_CLOEXEC is POSIX.1-2008
        Primitive::DupFd => Capability::Native,

        Primitive::RecvMsg => probe_recvmsg(),

        Primitive::EventQueue => {
            if cfg!(any(target_os = "linux", target_os = "android")) {
                Capability::Native
            } else {
                Capability::Emulated
            }
        }
    }
}

#[cfg(any(target_os = "linux", target_os = "android"))]
fn probe_recvmsg() -> Capability {
    Capability::Native
}

#[cfg(target_os = "freebsd")]
fn probe_recvmsg() -> Capability {
    match freebsd_osreldate() {
        Some(osreldate) if !msg_cmsg_cloexec_broken(osreldate) => Capability::Native,
        // If the version can't be read, don't trust the flag
        _ => Capability::Broken,
    }
}

#[cfg(not(any(target_os = "linux", target_os = "android", target_os = "freebsd")))]
fn probe_recvmsg() -> Capability {
    Capability::Emulated
}

/// FreeBSD mishandled MSG_CMSG_CLOEXEC between 2015 and 2021. The fix landed in 1300502 on the
/// 13 branch and in 1400006 on the 14 branch.
#[cfg_attr(not(target_os = "freebsd"), allow(dead_code))]
fn msg_cmsg_cloexec_broken(osreldate: libc::c_int) -> bool {
    osreldate < 1_300_502 || (1_400_000..1_400_006).contains(&osreldate)
}

#[cfg(target_os = "freebsd")]
fn freebsd_osreldate() -> Option<libc::c_int> {
    const OSRELDATE_MIB: [libc::c_int; 2] = [libc::CTL_KERN, libc::KERN_OSRELDATE];

    let mut osreldate: libc::c_int = 0;
    let mut oldlen = std::mem::size_of::<libc::c_int>();

    if unsafe {
        libc::sysctl(
            OSRELDATE_MIB.as_ptr(),
            OSRELDATE_MIB.len() as _,
            &mut osreldate as *mut _ as *mut _,
            &mut oldlen,
            std::ptr::null(),
            0,
        )
    } == 0
    {
        Some(osreldate)
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_capability_u8_mapping() {
        for &cap in &[Capability::Native, Capability::Emulated, Capability::Broken] {
            assert_eq!(Capability::from_u8(cap.as_u8()), Some(cap));
        }
        assert_eq!(Capability::from_u8(UNPROBED), None);
    }

    #[test]
    fn test_primitive_indices_distinct() {
        let mut seen = [false; 5];
        for &prim in Primitive::ALL.iter() {
            assert!(!seen[prim.index()]);
            seen[prim.index()] = true;
        }
    }

    #[test]
    fn test_probe_is_stable() {
        // DupFd is never overridden by other unit tests
        let first = capability(Primitive::DupFd);
        assert_eq!(capability(Primitive::DupFd), first);
        assert_eq!(first, probe(Primitive::DupFd));
    }

    #[test]
    fn test_msg_cmsg_cloexec_window() {
        assert!(msg_cmsg_cloexec_broken(1_100_000));
        assert!(msg_cmsg_cloexec_broken(1_300_501));
        assert!(!msg_cmsg_cloexec_broken(1_300_502));
        assert!(!msg_cmsg_cloexec_broken(1_399_999));
        assert!(msg_cmsg_cloexec_broken(1_400_000));
        assert!(msg_cmsg_cloexec_broken(1_400_005));
        assert!(!msg_cmsg_cloexec_broken(1_400_006));
        assert!(!msg_cmsg_cloexec_broken(1_500_000));
    }

    #[cfg(any(target_os = "linux", target_os = "android"))]
    #[test]
    fn test_linux_probes_native() {
        assert_eq!(probe(Primitive::Socket), Capability::Native);
        assert_eq!(probe(Primitive::RecvMsg), Capability::Native);
        assert_eq!(probe(Primitive::EventQueue), Capability::Native);
        assert_eq!(probe(Primitive::Accept), Capability::Native);
    }
}
