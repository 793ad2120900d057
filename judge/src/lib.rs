//! This crate implements the core logic of the judge worker: the
//! per-submission pipeline that compiles a program once and streams every
//! test case through a sandbox executor, and the coordinator that turns
//! dispatcher requests into pipelines and pipeline status frames into
//! dispatcher verdicts.
//!

#[macro_use]
extern crate error_chain;
extern crate crossbeam_channel;
extern crate log;
extern crate rand;
extern crate sandbox;
#[cfg(feature = "serde")]
extern crate serde;

mod coordinator;
mod languages;
mod pipeline;
pub mod protocol;

use std::fmt::{Display, Formatter};
use std::path::PathBuf;
use std::sync::Arc;

use sandbox::{ContainerRuntime, MemorySize, DEFAULT_CGROUP_ROOT};

pub use coordinator::judge_submission;
pub use languages::{Language, LanguageCatalog};
pub use pipeline::Judge;

error_chain! {
    types {
        Error, ErrorKind, ResultExt, Result;
    }

    links {
        Sandbox(::sandbox::Error, ::sandbox::ErrorKind);
    }

    foreign_links {
        Io(::std::io::Error);
    }
}

/// Verdict code of one test case or of a whole submission.
///
/// The codes are ordered by severity: folding a submission's per-case codes
/// with `max` yields the aggregate code, and `Finished` is the identity of
/// that fold.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum JudgeResult {
    /// The program ran to completion; the verdict is up to the caller.
    Finished,

    /// The program exited with a non-zero code.
    RuntimeError,

    /// The program hit the memory ceiling.
    MemoryLimitExceeded,

    /// The program hit the wall time ceiling.
    TimeLimitExceeded,

    /// The pipeline itself failed.
    InternalError,

    /// Progress marker; never terminal.
    Judging,

    /// The compiler rejected the program.
    CompileError,

    /// The compiler hit the wall time ceiling.
    CompileTimeLimitExceeded,

    /// The compiler hit the memory ceiling.
    CompileMemoryLimitExceeded
}

impl Display for JudgeResult {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            JudgeResult::Finished => "Finished",
            JudgeResult::RuntimeError => "RuntimeError",
            JudgeResult::MemoryLimitExceeded => "MemoryLimitExceeded",
            JudgeResult::TimeLimitExceeded => "TimeLimitExceeded",
            JudgeResult::InternalError => "InternalError",
            JudgeResult::Judging => "Judging",
            JudgeResult::CompileError => "CompileError",
            JudgeResult::CompileTimeLimitExceeded => "CompileTimeLimitExceeded",
            JudgeResult::CompileMemoryLimitExceeded => "CompileMemoryLimitExceeded"
        })
    }
}

/// One frame of a pipeline's status stream.
#[derive(Clone, Debug)]
pub struct JudgeStatus {
    /// Index of the test case the frame refers to; `-1` for the aggregate.
    pub case: i32,

    /// Verdict code of the frame.
    pub code: JudgeResult,

    /// Wall time in milliseconds; `-1` when invalidated.
    pub time_ms: i64,

    /// Peak memory in bytes; `-1` when invalidated.
    pub memory_bytes: i64,

    /// Captured program output, on per-case `Finished` frames.
    pub stdout: Option<String>,

    /// Captured error output, or a human readable diagnostic.
    pub stderr: Option<String>
}

impl JudgeStatus {
    /// Create a per-case frame with the given code and no measurements.
    pub fn case(case: i32, code: JudgeResult) -> JudgeStatus {
        JudgeStatus {
            case,
            code,
            time_ms: 0,
            memory_bytes: 0,
            stdout: None,
            stderr: None
        }
    }

    /// Create an aggregate frame.
    pub fn aggregate(code: JudgeResult, time_ms: i64, memory_bytes: i64) -> JudgeStatus {
        JudgeStatus {
            case: -1,
            code,
            time_ms,
            memory_bytes,
            stdout: None,
            stderr: None
        }
    }

    /// Create the aggregate frame a pipeline dies with.
    pub fn internal_error<T>(diagnostic: T) -> JudgeStatus
        where T: Into<String> {
        JudgeStatus {
            case: -1,
            code: JudgeResult::InternalError,
            time_ms: -1,
            memory_bytes: -1,
            stdout: None,
            stderr: Some(diagnostic.into())
        }
    }
}

/// A test case flowing into a judge pipeline.
#[derive(Clone, Debug)]
pub struct TestCase {
    /// Dense index of the case within its submission.
    pub id: i32,

    /// Input payload.
    pub input: String,

    /// Expected-output payload. When present, both payloads are
    /// materialized as `/input` and `/output` inside the container and
    /// stdin is left empty; when absent the input is piped to stdin.
    pub output: Option<String>
}

/// How to run one phase of a submission inside a container.
#[derive(Clone, Debug)]
pub struct ExecRequest {
    /// Image the phase's container is created from.
    pub image: String,

    /// Argument vector of the phase.
    pub argv: Vec<String>
}

/// Environment shared by every pipeline on this worker.
pub struct JudgeEnv {
    /// The container runtime client. Constructed once at startup and shared
    /// process-wide.
    pub runtime: Arc<dyn ContainerRuntime>,

    /// Directory under which per-submission work directories are created.
    pub workdir_root: PathBuf,

    /// CPU share granted to judge containers, as a percentage of one core.
    pub cpu_usage: u32,

    /// Mount point of the memory cgroup hierarchy.
    pub cgroup_root: PathBuf
}

impl JudgeEnv {
    /// Create a `JudgeEnv` with a full core of CPU and the default cgroup
    /// hierarchy mount point.
    pub fn new<P>(runtime: Arc<dyn ContainerRuntime>, workdir_root: P) -> JudgeEnv
        where P: Into<PathBuf> {
        JudgeEnv {
            runtime,
            workdir_root: workdir_root.into(),
            cpu_usage: 100,
            cgroup_root: PathBuf::from(DEFAULT_CGROUP_ROOT)
        }
    }
}

/// Convert a megabyte count from a dispatcher request into a `MemorySize`.
fn megabytes(count: u64) -> MemorySize {
    MemorySize::MegaBytes(count as usize)
}
