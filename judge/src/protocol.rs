//! This module defines the data model of the dispatcher wire protocol.
//! Requests and verdicts travel as JSON over the transfer channel; the
//! numeric enum encodings are part of the protocol.
//!

use std::collections::BTreeMap;

#[cfg(feature = "serde")]
use serde::de::{self, Deserializer};
#[cfg(feature = "serde")]
use serde::ser::Serializer;
#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

/// Verdict mode requested for a submission.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum JudgeType {
    /// Compare captured stdout with the expected output byte for byte.
    PerfectMatch = 0,

    /// Run a submission-supplied checker program over the judged program's
    /// output.
    RunningCode = 1
}

#[cfg(feature = "serde")]
impl Serialize for JudgeType {
    fn serialize<S>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error>
        where S: Serializer {
        serializer.serialize_i64(*self as i64)
    }
}

#[cfg(feature = "serde")]
impl<'de> Deserialize<'de> for JudgeType {
    fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
        where D: Deserializer<'de> {
        match i64::deserialize(deserializer)? {
            0 => Ok(JudgeType::PerfectMatch),
            1 => Ok(JudgeType::RunningCode),
            value => Err(de::Error::custom(format!("unknown judge type: {}", value)))
        }
    }
}

/// Wire status of a dispatcher verdict.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SubmissionStatus {
    /// Queued at the dispatcher; never produced by the worker.
    InQueue = 0,

    /// The submission (or one of its cases) is being judged.
    Judging = 1,

    /// The case passed, or every case of the submission passed.
    Accepted = 2,

    /// The produced output does not match the expectation.
    WrongAnswer = 3,

    /// The program hit the wall time ceiling.
    TimeLimitExceeded = 4,

    /// The program hit the memory ceiling.
    MemoryLimitExceeded = 5,

    /// The program exited with a non-zero code.
    RuntimeError = 6,

    /// The compiler rejected the program.
    CompileError = 7,

    /// The worker failed; not the submission's fault.
    InternalError = 8
}

#[cfg(feature = "serde")]
impl Serialize for SubmissionStatus {
    fn serialize<S>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error>
        where S: Serializer {
        serializer.serialize_i64(*self as i64)
    }
}

#[cfg(feature = "serde")]
impl<'de> Deserialize<'de> for SubmissionStatus {
    fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
        where D: Deserializer<'de> {
        match i64::deserialize(deserializer)? {
            0 => Ok(SubmissionStatus::InQueue),
            1 => Ok(SubmissionStatus::Judging),
            2 => Ok(SubmissionStatus::Accepted),
            3 => Ok(SubmissionStatus::WrongAnswer),
            4 => Ok(SubmissionStatus::TimeLimitExceeded),
            5 => Ok(SubmissionStatus::MemoryLimitExceeded),
            6 => Ok(SubmissionStatus::RuntimeError),
            7 => Ok(SubmissionStatus::CompileError),
            8 => Ok(SubmissionStatus::InternalError),
            value => Err(de::Error::custom(format!("unknown submission status: {}", value)))
        }
    }
}

/// One test case of a submission request.
#[derive(Clone, Debug)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct CaseData {
    /// Display name of the case.
    #[cfg_attr(feature = "serde", serde(default))]
    pub name: String,

    /// Input payload.
    pub input: String,

    /// Expected output payload.
    #[cfg_attr(feature = "serde", serde(default))]
    pub output: String
}

/// A submission judging request, as decoded from the dispatcher channel.
#[derive(Clone, Debug)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct JudgeRequest {
    /// Submission identifier; echoed on every verdict.
    pub sid: i64,

    /// The submitted source code.
    pub code: String,

    /// Language identifier, resolved against the catalog.
    pub lang: i64,

    /// Verdict mode.
    #[cfg_attr(feature = "serde", serde(rename = "type"))]
    pub judge_type: JudgeType,

    /// Checker source code; only meaningful for `RunningCode`.
    #[cfg_attr(feature = "serde", serde(default))]
    pub checker: String,

    /// Checker language identifier; only meaningful for `RunningCode`.
    #[cfg_attr(feature = "serde", serde(default))]
    pub checker_lang: i64,

    /// Test cases by ascending index.
    pub cases: BTreeMap<u32, CaseData>,

    /// Per-case wall time limit, in seconds.
    pub time: u64,

    /// Per-case memory limit, in megabytes.
    pub mem: u64
}

/// One dispatcher verdict frame.
#[derive(Clone, Debug)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct JudgeResponse {
    /// Submission identifier.
    pub sid: i64,

    /// Verdict status.
    pub status: SubmissionStatus,

    /// Human readable message: compiler diagnostics, internal error
    /// descriptions and the like.
    #[cfg_attr(feature = "serde", serde(default))]
    pub msg: String,

    /// Wall time in milliseconds; `-1` when not meaningful.
    pub time: i64,

    /// Peak memory in kilobytes; `-1` when not meaningful.
    pub mem: i64,

    /// Case index; `-1` denotes the aggregate.
    pub case: i32,

    /// Display name of the case, empty on aggregate frames.
    #[cfg_attr(feature = "serde", serde(default))]
    pub case_name: String
}

impl JudgeResponse {
    /// Create a blank frame for the given submission, as used by the
    /// transfer handshake.
    pub fn blank(sid: i64) -> JudgeResponse {
        JudgeResponse {
            sid,
            status: SubmissionStatus::InQueue,
            msg: String::new(),
            time: 0,
            mem: 0,
            case: 0,
            case_name: String::new()
        }
    }

    /// Create an aggregate frame for the given submission.
    pub fn aggregate(sid: i64, status: SubmissionStatus) -> JudgeResponse {
        JudgeResponse {
            sid,
            status,
            msg: String::new(),
            time: 0,
            mem: 0,
            case: -1,
            case_name: String::new()
        }
    }

    /// Create a per-case frame for the given submission.
    pub fn case<N>(sid: i64, case: i32, case_name: N, status: SubmissionStatus) -> JudgeResponse
        where N: Into<String> {
        JudgeResponse {
            sid,
            status,
            msg: String::new(),
            time: 0,
            mem: 0,
            case,
            case_name: case_name.into()
        }
    }
}
