//! This crate implements the sandbox layer of the judge worker. The sandbox
//! is responsible for executing untrusted programs in one-shot containers
//! under strict resource supervision.
//!
//! The sandbox implements:
//!
//! * A resource controller over a named kernel memory cgroup: ceilings on
//! RSS+swap, peak usage observation and task-set liveness;
//!
//! * A bounded capture sink that silently truncates program output past a
//! fixed ceiling;
//!
//! * The contract an external container runtime has to fulfill to back the
//! executor;
//!
//! * The executor itself: create a container tied to a resource group, attach
//! its stdio, run it exactly once, and report exit code, peak memory, wall
//! time and captured output while enforcing the time and memory limits.
//!

#[macro_use]
extern crate error_chain;
extern crate log;

mod cgroup;
mod executor;
mod runtime;
mod sink;

#[cfg(any(test, feature = "testing"))]
pub mod testing;

use std::cmp::Ordering;
use std::fmt::{Display, Formatter};

pub use cgroup::{Cgroup, DEFAULT_CGROUP_ROOT};
pub use executor::{ExecSpec, Executor};
pub use runtime::{ArchiveEntry, ContainerRuntime, ContainerSpec};
pub use sink::{BoundedWriter, OUTPUT_LIMIT};

error_chain! {
    types {
        Error, ErrorKind, ResultExt, Result;
    }

    foreign_links {
        Io(::std::io::Error);
    }

    errors {
        Provision(msg: String) {
            description("failed to provision execution resources")
            display("failed to provision execution resources: {}", msg)
        }

        RuntimeApi(msg: String) {
            description("container runtime operation failed")
            display("container runtime operation failed: {}", msg)
        }

        TimingFile(msg: String) {
            description("malformed timing file")
            display("malformed timing file: {}", msg)
        }

        Cleanup(msg: String) {
            description("failed to release execution resources")
            display("failed to release execution resources: {}", msg)
        }
    }
}

/// Measurement of the size of a block of memory.
#[derive(Clone, Copy, Debug, Eq)]
pub enum MemorySize {
    /// Measurement in bytes.
    Bytes(usize),

    /// Measurement in kilobytes.
    KiloBytes(usize),

    /// Measurement in megabytes.
    MegaBytes(usize),

    /// Measurement in gigabytes.
    GigaBytes(usize)
}

impl MemorySize {
    /// Convert the current measurement to memory size in bytes.
    pub fn bytes(&self) -> usize {
        match self {
            MemorySize::Bytes(s) => *s,
            MemorySize::KiloBytes(s) => s * 1024,
            MemorySize::MegaBytes(s) => s * 1024 * 1024,
            MemorySize::GigaBytes(s) => s * 1024 * 1024 * 1024
        }
    }
}

impl PartialEq for MemorySize {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl PartialOrd for MemorySize {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for MemorySize {
    fn cmp(&self, other: &Self) -> Ordering {
        self.bytes().cmp(&other.bytes())
    }
}

impl From<usize> for MemorySize {
    fn from(value: usize) -> MemorySize {
        MemorySize::Bytes(value)
    }
}

impl Display for MemorySize {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            MemorySize::Bytes(s) => f.write_fmt(format_args!("{} B", s)),
            MemorySize::KiloBytes(s) => f.write_fmt(format_args!("{} KB", s)),
            MemorySize::MegaBytes(s) => f.write_fmt(format_args!("{} MB", s)),
            MemorySize::GigaBytes(s) => f.write_fmt(format_args!("{} GB", s))
        }
    }
}

/// Terminal status of one container execution.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ExecStatus {
    /// The container ran to completion within its limits.
    Finished,

    /// The container's wall time exceeded the configured ceiling.
    TimeLimitExceeded,

    /// The container's peak memory usage reached the configured ceiling.
    MemoryLimitExceeded,

    /// The execution could not be carried out or measured.
    Error
}

/// Result of a single container execution.
#[derive(Clone, Debug)]
pub struct ExecReport {
    /// Terminal status of the execution.
    pub status: ExecStatus,

    /// Wall time consumed, in milliseconds.
    pub time_ms: u64,

    /// Peak memory usage observed by the resource controller.
    pub memory: MemorySize,

    /// Exit code of the executed program.
    pub exit_code: i32,

    /// Captured standard output, truncated at `OUTPUT_LIMIT`.
    pub stdout: String,

    /// Captured standard error, truncated at `OUTPUT_LIMIT`.
    pub stderr: String
}

impl ExecReport {
    /// Create an `ExecReport` carrying an execution error diagnostic.
    pub fn error<T>(diagnostic: T) -> ExecReport
        where T: Into<String> {
        ExecReport {
            status: ExecStatus::Error,
            time_ms: 0,
            memory: MemorySize::Bytes(0),
            exit_code: 0,
            stdout: String::new(),
            stderr: diagnostic.into()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::MemorySize;

    #[test]
    fn test_memory_size_to_bytes() {
        assert_eq!(2, MemorySize::Bytes(2).bytes());
        assert_eq!(2 * 1024, MemorySize::KiloBytes(2).bytes());
        assert_eq!(2 * 1024 * 1024, MemorySize::MegaBytes(2).bytes());
        assert_eq!(2usize * 1024 * 1024 * 1024, MemorySize::GigaBytes(2).bytes());
    }

    #[test]
    fn test_memory_size_ord() {
        assert!(MemorySize::KiloBytes(1) > MemorySize::Bytes(1023));
        assert_eq!(MemorySize::MegaBytes(1), MemorySize::KiloBytes(1024));
    }
}
