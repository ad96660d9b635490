//! Checking for descriptor leaks across `exec()`.
//!
//! The test replaces itself with the `exec-fd-leak-checker` program, passing the number of
//! descriptors the new image should find open. Descriptors marked close-on-exec vanish during
//! the `exec()`; anything else that is still open shows up in the checker's count.

use std::ffi::{CStr, CString, OsStr, OsString};
use std::fmt;
use std::io;
use std::os::unix::ffi::OsStrExt;
use std::path::{Path, PathBuf};

use crate::fault::{Fault, OrFatal};

/// File name of the auxiliary checker executable.
pub const LEAK_CHECKER_NAME: &str = "exec-fd-leak-checker";

/// Environment variable naming the directory that holds [`LEAK_CHECKER_NAME`].
pub const BUILD_DIR_VAR: &str = "TEST_BUILD_DIR";

/// Environment variable that, when set to a true-ish value, lists the open descriptors before
/// every leak check.
///
/// Being set is not enough: an empty value, `0`, `false`, `no` or `off` (any case) keeps the
/// listing off, so `TEST_DEBUG_FD_LEAK_CHECK=0` stays silent.
pub const DEBUG_VAR: &str = "TEST_DEBUG_FD_LEAK_CHECK";

/// The number of descriptors a leak check expects the checker to find.
///
/// The decimal form always fits in [`ExpectedFdCount::MAX_ENCODED_LEN`] bytes, NUL included.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ExpectedFdCount(u32);

#[derive(Debug, PartialEq, Eq, thiserror::Error)]
#[error("invalid descriptor count '{0}'")]
pub struct ParseCountError(String);

impl ExpectedFdCount {
    pub const MAX_ENCODED_LEN: usize = 16;

    #[inline]
    pub fn new(count: u32) -> Self {
        Self(count)
    }

    #[inline]
    pub fn get(self) -> u32 {
        self.0
    }

    /// Parse the checker's argument: ASCII digits only, no sign or whitespace.
    pub fn parse(s: &str) -> Result<Self, ParseCountError> {
        if s.is_empty() || !s.bytes().all(|ch| ch.is_ascii_digit()) {
            return Err(ParseCountError(s.to_owned()));
        }

        s.parse()
            .map(Self)
            .map_err(|_| ParseCountError(s.to_owned()))
    }

    #[inline]
    pub fn matches(self, count: usize) -> bool {
        count == self.0 as usize
    }

    fn encode(self) -> CString {
        let encoded = self.0.to_string();
        debug_assert!(encoded.len() < Self::MAX_ENCODED_LEN);
        // Digits never contain NUL
        CString::new(encoded).unwrap_or_default()
    }
}

impl From<u32> for ExpectedFdCount {
    #[inline]
    fn from(count: u32) -> Self {
        Self(count)
    }
}

impl fmt::Display for ExpectedFdCount {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Where to find the checker, and whether to list descriptors before running it.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LeakCheckConfig {
    build_dir: PathBuf,
    debug: bool,
}

impl Default for LeakCheckConfig {
    fn default() -> Self {
        Self {
            build_dir: PathBuf::from("."),
            debug: false,
        }
    }
}

impl LeakCheckConfig {
    /// Read [`BUILD_DIR_VAR`] and [`DEBUG_VAR`] from the environment.
    pub fn from_env() -> Self {
        Self::from_vars(
            std::env::var_os(BUILD_DIR_VAR),
            std::env::var_os(DEBUG_VAR),
        )
    }

    fn from_vars(build_dir: Option<OsString>, debug: Option<OsString>) -> Self {
        let mut config = Self::default();

        if let Some(dir) = build_dir.filter(|dir| !dir.is_empty()) {
            config.build_dir = PathBuf::from(dir);
        }
        config.debug = debug.as_deref().map_or(false, is_enabled);

        config
    }

    #[inline]
    pub fn build_dir<P: Into<PathBuf>>(&mut self, dir: P) -> &mut Self {
        self.build_dir = dir.into();
        self
    }

    #[inline]
    pub fn debug(&mut self, debug: bool) -> &mut Self {
        self.debug = debug;
        self
    }

    #[inline]
    pub fn is_debug(&self) -> bool {
        self.debug
    }

    pub fn checker_path(&self) -> PathBuf {
        self.build_dir.join(LEAK_CHECKER_NAME)
    }
}

fn is_enabled(val: &OsStr) -> bool {
    match val.to_str() {
        Some(val) => {
            let val = val.trim();
            !(val.is_empty()
                || val == "0"
                || val.eq_ignore_ascii_case("false")
                || val.eq_ignore_ascii_case("no")
                || val.eq_ignore_ascii_case("off"))
        }
        None => true,
    }
}

/// A fully prepared leak check.
///
/// Building one resolves the path and formats every string up front, so that
/// [`exec()`](Self::exec) neither allocates nor takes locks. That makes it safe to call in the
/// child of a `fork()` in a multi-threaded program.
#[derive(Debug)]
pub struct LeakCheck {
    path: CString,
    argv0: CString,
    count: CString,
    expected: ExpectedFdCount,
    failure_msg: Vec<u8>,
}

impl LeakCheck {
    pub fn new(config: &LeakCheckConfig, expected: ExpectedFdCount) -> Result<Self, Fault> {
        let path = config.checker_path();

        let c_path = path_to_cstring(&path).map_err(|source| Fault::ExecFailed {
            path: path.clone(),
            count: expected.to_string(),
            source,
        })?;

        let failure_msg = format!(
            "Failed to execute '{} {}'\n",
            path.display(),
            expected
        )
        .into_bytes();

        Ok(Self {
            path: c_path,
            argv0: CString::new(LEAK_CHECKER_NAME).unwrap_or_default(),
            count: expected.encode(),
            expected,
            failure_msg,
        })
    }

    #[inline]
    pub fn expected(&self) -> ExpectedFdCount {
        self.expected
    }

    #[inline]
    pub fn path(&self) -> &CStr {
        &self.path
    }

    fn execv(&self) {
        let argv = [
            self.argv0.as_ptr(),
            self.count.as_ptr(),
            std::ptr::null(),
        ];

        unsafe {
            libc::execv(self.path.as_ptr(), argv.as_ptr());
        }
    }

    /// Replace the current process with the checker. Only returns if `execv()` failed, handing
    /// back the fault.
    pub fn try_exec(&self) -> Fault {
        self.execv();
        let source = io::Error::last_os_error();

        Fault::ExecFailed {
            path: PathBuf::from(OsStr::from_bytes(self.path.as_bytes())),
            count: self.expected.to_string(),
            source,
        }
    }

    /// Replace the current process with the checker, aborting if that fails.
    pub fn exec(&self) -> ! {
        self.execv();

        unsafe {
            libc::write(
                libc::STDERR_FILENO,
                self.failure_msg.as_ptr() as *const libc::c_void,
                self.failure_msg.len(),
            );
        }
        std::process::abort()
    }
}

fn path_to_cstring(path: &Path) -> io::Result<CString> {
    CString::new(path.as_os_str().as_bytes())
        .map_err(|err| io::Error::new(io::ErrorKind::InvalidInput, err))
}

/// Run a leak check configured from the environment. Never returns.
///
/// The checker must find exactly `expected` open descriptors after the `exec()`, or it fails
/// the test.
pub fn exec_fd_leak_check<C: Into<ExpectedFdCount>>(expected: C) -> ! {
    let expected = expected.into();
    let config = LeakCheckConfig::from_env();

    if config.is_debug() {
        eprintln!("Calling exec_fd_leak_check({})", expected);
        eprintln!("FDs before exec");
        crate::fdlist::list_open_fds();
    }

    LeakCheck::new(&config, expected).or_fatal().exec()
}
