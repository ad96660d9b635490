//! Fatal contract violations.
//!
//! A [`Fault`] means the environment is broken in a way the caller cannot recover from: the
//! descriptor introspection source returned nonsense, two independent counts disagree, a wait
//! was interrupted, or the leak checker could not be executed. The `try_*` functions in this
//! crate hand faults back so they can be inspected; everything else passes them to [`fatal()`].

use std::io;
use std::os::unix::io::RawFd;
use std::path::PathBuf;

#[derive(Debug, thiserror::Error)]
pub enum Fault {
    #[error("opening {path} failed: {source}")]
    SourceUnavailable {
        path: &'static str,
        #[source]
        source: io::Error,
    },

    #[error("no descriptor introspection source is available on this platform")]
    NoSource,

    #[error("reading {path} failed: {source}")]
    ReadFailed {
        path: &'static str,
        #[source]
        source: io::Error,
    },

    #[error("unexpected file name '{0}'")]
    UnexpectedEntry(String),

    #[error("did not see fd {0} from opening the descriptor directory")]
    SelfNotObserved(RawFd),

    #[error("process table lists {listed} descriptors but the kernel counts {counted}")]
    CountMismatch { listed: usize, counted: usize },

    #[error("querying the process descriptor table failed: {0}")]
    ProcessTable(#[source] io::Error),

    #[error("sleep did not complete: {0}")]
    WaitInterrupted(#[source] io::Error),

    #[error("failed to execute '{} {count}': {source}", path.display())]
    ExecFailed {
        path: PathBuf,
        count: String,
        #[source]
        source: io::Error,
    },
}

/// Report `fault` and abort the process.
#[cold]
pub fn fatal(fault: Fault) -> ! {
    log::error!("{}", fault);
    eprintln!("{}", fault);
    std::process::abort()
}

/// Unwrap a fallible result, aborting the process on a fault.
pub(crate) trait OrFatal<T> {
    fn or_fatal(self) -> T;
}

impl<T> OrFatal<T> for Result<T, Fault> {
    #[inline]
    fn or_fatal(self) -> T {
        match self {
            Ok(value) => value,
            Err(fault) => fatal(fault),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fault_messages() {
        assert_eq!(
            Fault::UnexpectedEntry("abc".into()).to_string(),
            "unexpected file name 'abc'"
        );
        assert_eq!(
            Fault::CountMismatch {
                listed: 4,
                counted: 5
            }
            .to_string(),
            "process table lists 4 descriptors but the kernel counts 5"
        );
        assert_eq!(
            Fault::SelfNotObserved(9).to_string(),
            "did not see fd 9 from opening the descriptor directory"
        );

        let fault = Fault::ExecFailed {
            path: PathBuf::from("./exec-fd-leak-checker"),
            count: "3".into(),
            source: io::Error::from_raw_os_error(libc::ENOENT),
        };
        assert!(fault
            .to_string()
            .starts_with("failed to execute './exec-fd-leak-checker 3': "));
    }

    #[test]
    fn test_or_fatal_passes_values() {
        let ok: Result<u8, Fault> = Ok(3);
        assert_eq!(ok.or_fatal(), 3);
    }
}
