//! Exec'd into by leak-check tests. Counts the descriptors this process inherited and compares
//! the count against the one given on the command line.
//!
//! Exit codes: 0 = counts match, 1 = mismatch (the open descriptors are listed on stderr),
//! 2 = bad arguments.

use std::process::exit;

use cloexec_fds::{list_open_fds, ExpectedFdCount, FdEnumerator};

fn main() {
    let mut args = std::env::args_os().skip(1);

    let arg = match (args.next(), args.next()) {
        (Some(arg), None) => arg,
        _ => {
            eprintln!("Usage: exec-fd-leak-checker <expected fd count>");
            exit(2);
        }
    };

    let expected = match arg.to_str().map(ExpectedFdCount::parse) {
        Some(Ok(expected)) => expected,
        Some(Err(err)) => {
            eprintln!("{}", err);
            exit(2);
        }
        None => {
            eprintln!("invalid descriptor count {:?}", arg);
            exit(2);
        }
    };

    let count = FdEnumerator::new().count();
    if expected.matches(count) {
        exit(0);
    }

    eprintln!(
        "Expected {} open file descriptors, but found {}",
        expected, count
    );
    list_open_fds();
    exit(1);
}
