//! This module implements the submission coordinator. One coordinator runs
//! per dispatcher request: it resolves the requested languages, spawns the
//! primary judge pipeline and, for checker-based judging, a second pipeline
//! consuming the primary's outputs, and folds the status frames of both
//! into dispatcher verdicts.
//!

use std::sync::Arc;

use crossbeam_channel::{unbounded, Receiver, Sender};

use crate::languages::{Language, LanguageCatalog};
use crate::pipeline::Judge;
use crate::protocol::{CaseData, JudgeRequest, JudgeResponse, JudgeType, SubmissionStatus};
use crate::{megabytes, ExecRequest, JudgeEnv, JudgeResult, JudgeStatus, TestCase};

/// Memory ceiling of checker pipelines, in megabytes.
const CHECKER_MEMORY_LIMIT_MB: u64 = 256;

/// Wall time ceiling of checker pipelines, in milliseconds.
const CHECKER_TIME_LIMIT_MS: u64 = 3_000;

/// Judge one submission request, streaming dispatcher verdicts into
/// `responses`. Returns when the submission's aggregate verdict has been
/// forwarded.
pub fn judge_submission(env: Arc<JudgeEnv>, catalog: &LanguageCatalog,
    request: JudgeRequest, responses: &Sender<JudgeResponse>) {
    let sid = request.sid;
    log::info!("submission {}: accepted for judging", sid);

    let language = match catalog.find(request.lang) {
        Some(language) => language.clone(),
        None => {
            log::error!("submission {}: unknown language {}", sid, request.lang);
            respond_unknown_language(sid, responses);
            return;
        }
    };
    let checker_language = match request.judge_type {
        JudgeType::RunningCode => match catalog.find(request.checker_lang) {
            Some(language) => Some(language.clone()),
            None => {
                log::error!("submission {}: unknown checker language {}",
                    sid, request.checker_lang);
                respond_unknown_language(sid, responses);
                return;
            }
        },
        JudgeType::PerfectMatch => None
    };

    // The response stream of a fresh submission opens with an aggregate
    // Judging frame; the transfer layer marks it for the dispatcher.
    send(responses, JudgeResponse::aggregate(sid, SubmissionStatus::Judging));

    // Cases in ascending request order, re-indexed densely.
    let cases: Vec<CaseData> = request.cases.values().cloned().collect();

    let judge = build_judge(&language, &request.code, request.time * 1000, request.mem);
    let (status_tx, status_rx) = unbounded();
    let (cases_tx, cases_rx) = unbounded();
    let (kill_tx, kill_rx) = unbounded::<()>();
    spawn_pipeline(env.clone(), judge, status_tx, cases_rx, kill_rx);

    for (index, case) in cases.iter().enumerate() {
        let envelope = TestCase {
            id: index as i32,
            input: case.input.clone(),
            output: None
        };
        if cases_tx.send(envelope).is_err() {
            break;
        }
    }
    drop(cases_tx);

    match request.judge_type {
        JudgeType::PerfectMatch =>
            route_perfect_match(sid, &cases, status_rx, responses),
        JudgeType::RunningCode =>
            route_with_checker(
                env,
                sid,
                &cases,
                checker_language.expect("checker language resolved above"),
                &request.checker,
                status_rx,
                responses)
    }

    // Closing the kill channel unblocks the primary pipeline in case it is
    // still running.
    drop(kill_tx);
    log::info!("submission {}: judging finished", sid);
}

/// Spawn a judge pipeline on its own thread.
fn spawn_pipeline(env: Arc<JudgeEnv>, judge: Judge,
    status: Sender<JudgeStatus>, cases: Receiver<TestCase>, kill: Receiver<()>) {
    std::thread::spawn(move || judge.run(&env, status, cases, kill));
}

/// Build the pipeline descriptor for a program in the given language.
fn build_judge(language: &Language, code: &str,
    time_limit_ms: u64, memory_limit_mb: u64) -> Judge {
    Judge {
        code: code.to_owned(),
        source_file_name: language.source_file_name.clone(),
        compile: if language.compile {
            Some(ExecRequest {
                image: language.compile_image.clone(),
                argv: language.compile_cmd.clone()
            })
        } else {
            None
        },
        exec: ExecRequest {
            image: language.exec_image.clone(),
            argv: language.exec_cmd.clone()
        },
        time_limit_ms,
        memory_limit: megabytes(memory_limit_mb)
    }
}

/// Route the primary pipeline's frames for perfect-match judging. The
/// pipeline does not know the expected outputs, so the wrong-answer
/// decision is made here.
fn route_perfect_match(sid: i64, cases: &[CaseData],
    status_rx: Receiver<JudgeStatus>, responses: &Sender<JudgeResponse>) {
    let mut wrong_answer = false;

    for frame in status_rx.iter() {
        if frame.case < 0 {
            let response = if frame.code == JudgeResult::Finished {
                if wrong_answer {
                    let mut response = JudgeResponse::aggregate(
                        sid, SubmissionStatus::WrongAnswer);
                    response.time = -1;
                    response.mem = -1;
                    response
                } else {
                    let mut response = JudgeResponse::aggregate(
                        sid, SubmissionStatus::Accepted);
                    response.time = frame.time_ms;
                    response.mem = kilobytes(frame.memory_bytes);
                    response
                }
            } else {
                aggregate_response(sid, &frame)
            };
            send(responses, response);

            // The aggregate frame is the last one by contract.
            return;
        }

        let name = case_name(cases, frame.case);
        match frame.code {
            JudgeResult::Judging => send(responses,
                JudgeResponse::case(sid, frame.case, name, SubmissionStatus::Judging)),
            JudgeResult::Finished => {
                let expected = cases.get(frame.case as usize)
                    .map(|case| case.output.as_str())
                    .unwrap_or("");
                let produced = frame.stdout.as_ref()
                    .map(|stdout| stdout.as_str())
                    .unwrap_or("");

                let status = if produced == expected {
                    SubmissionStatus::Accepted
                } else {
                    wrong_answer = true;
                    SubmissionStatus::WrongAnswer
                };
                let mut response = JudgeResponse::case(sid, frame.case, name, status);
                response.time = frame.time_ms;
                response.mem = kilobytes(frame.memory_bytes);
                send(responses, response);
            },
            code => {
                let mut response = JudgeResponse::case(
                    sid, frame.case, name, status_of(code));
                response.msg = frame.stderr.clone().unwrap_or_default();
                send(responses, response);
            }
        }
    }
}

/// Route the frames of the primary and the checker pipeline for
/// checker-based judging.
///
/// Finished primary cases become provisional verdicts and are re-run
/// through the checker with the case input at `/input` and the primary's
/// output at `/output`; the checker's exit code decides between Accepted
/// and WrongAnswer. Cases the primary already failed are forwarded as-is
/// and never reach the checker.
fn route_with_checker(env: Arc<JudgeEnv>, sid: i64, cases: &[CaseData],
    checker_language: Language, checker_code: &str,
    primary_rx: Receiver<JudgeStatus>, responses: &Sender<JudgeResponse>) {
    let checker = build_judge(
        &checker_language, checker_code, CHECKER_TIME_LIMIT_MS, CHECKER_MEMORY_LIMIT_MB);

    let (checker_status_tx, checker_status_rx) = unbounded();
    let (checker_cases_tx, checker_cases_rx) = unbounded();
    let (checker_kill_tx, checker_kill_rx) = unbounded::<()>();
    spawn_pipeline(env, checker, checker_status_tx, checker_cases_rx, checker_kill_rx);

    let mut provisional: Vec<Option<JudgeResponse>> = vec![None; cases.len()];
    let mut wrong_answer = false;
    let mut primary_aggregate: Option<JudgeStatus> = None;
    let mut checker_cases_tx = Some(checker_cases_tx);
    let mut primary_rx = primary_rx;

    enum Routed {
        Primary(Option<JudgeStatus>),
        Checker(Option<JudgeStatus>)
    }

    loop {
        let routed = crossbeam_channel::select! {
            recv(primary_rx) -> frame => Routed::Primary(frame.ok()),
            recv(checker_status_rx) -> frame => Routed::Checker(frame.ok())
        };

        match routed {
            Routed::Primary(Some(frame)) => handle_primary_frame(
                sid,
                cases,
                frame,
                &mut provisional,
                &mut primary_aggregate,
                &mut checker_cases_tx,
                responses),
            Routed::Primary(None) => {
                // The primary stream is complete; keep draining the
                // checker.
                primary_rx = crossbeam_channel::never();
            },
            Routed::Checker(Some(frame)) => {
                let done = handle_checker_frame(
                    sid,
                    cases,
                    frame,
                    &mut provisional,
                    &mut wrong_answer,
                    &primary_aggregate,
                    responses);
                if done {
                    // The checker kill channel closes on return, unblocking
                    // the checker pipeline if it is somehow still alive.
                    drop(checker_kill_tx);
                    return;
                }
            },
            Routed::Checker(None) => {
                log::error!(
                    "submission {}: checker stream closed without an aggregate", sid);
                send(responses, JudgeResponse::aggregate(
                    sid, SubmissionStatus::InternalError));
                return;
            }
        }
    }
}

/// Process one frame of the primary pipeline during checker-based judging.
fn handle_primary_frame(sid: i64, cases: &[CaseData], frame: JudgeStatus,
    provisional: &mut Vec<Option<JudgeResponse>>,
    primary_aggregate: &mut Option<JudgeStatus>,
    checker_cases_tx: &mut Option<Sender<TestCase>>,
    responses: &Sender<JudgeResponse>) {
    if frame.case < 0 {
        // Closing the checker's case queue lets it wind down once the
        // already scheduled runs are done.
        *primary_aggregate = Some(frame);
        checker_cases_tx.take();
        return;
    }

    let name = case_name(cases, frame.case);
    match frame.code {
        JudgeResult::Judging => send(responses,
            JudgeResponse::case(sid, frame.case, name, SubmissionStatus::Judging)),
        JudgeResult::Finished => {
            let mut response = JudgeResponse::case(
                sid, frame.case, name, SubmissionStatus::Accepted);
            response.time = frame.time_ms;
            response.mem = kilobytes(frame.memory_bytes);
            if let Some(slot) = provisional.get_mut(frame.case as usize) {
                *slot = Some(response);
            }

            let envelope = TestCase {
                id: frame.case,
                input: cases.get(frame.case as usize)
                    .map(|case| case.input.clone())
                    .unwrap_or_default(),
                output: Some(frame.stdout.unwrap_or_default())
            };
            if let Some(tx) = checker_cases_tx.as_ref() {
                let _ = tx.send(envelope);
            }
        },
        code => {
            // A case the primary already failed never reaches the checker.
            let mut response = JudgeResponse::case(
                sid, frame.case, name, status_of(code));
            response.msg = frame.stderr.clone().unwrap_or_default();
            send(responses, response);
        }
    }
}

/// Process one frame of the checker pipeline. Returns `true` once the
/// checker's aggregate frame has been translated and forwarded.
fn handle_checker_frame(sid: i64, cases: &[CaseData], frame: JudgeStatus,
    provisional: &mut Vec<Option<JudgeResponse>>,
    wrong_answer: &mut bool,
    primary_aggregate: &Option<JudgeStatus>,
    responses: &Sender<JudgeResponse>) -> bool {
    if frame.case < 0 {
        let response = match *primary_aggregate {
            Some(ref aggregate) if aggregate.code != JudgeResult::Finished =>
                aggregate_response(sid, aggregate),
            // A checker aggregate of RuntimeError only restates that some
            // case was rejected; anything above that means the checker
            // pipeline itself fell over.
            _ if frame.code > JudgeResult::RuntimeError => {
                let mut response = JudgeResponse::aggregate(
                    sid, SubmissionStatus::InternalError);
                response.time = -1;
                response.mem = -1;
                response.msg = format!("Checker Program: {}", frame.code);
                response
            },
            _ if *wrong_answer => {
                let mut response = JudgeResponse::aggregate(
                    sid, SubmissionStatus::WrongAnswer);
                response.time = -1;
                response.mem = -1;
                response
            },
            ref aggregate => {
                let mut response = JudgeResponse::aggregate(
                    sid, SubmissionStatus::Accepted);
                response.time = aggregate.as_ref().map(|a| a.time_ms).unwrap_or(-1);
                response.mem = aggregate.as_ref()
                    .map(|a| kilobytes(a.memory_bytes))
                    .unwrap_or(-1);
                response
            }
        };
        send(responses, response);
        return true;
    }

    // The checker's own progress markers are internal; the dispatcher saw a
    // Judging frame for the case already.
    if frame.code == JudgeResult::Judging {
        return false;
    }

    let slot = provisional.get_mut(frame.case as usize)
        .and_then(|slot| slot.take());
    match frame.code {
        JudgeResult::Finished => match slot {
            Some(response) => send(responses, response),
            None => log::error!(
                "submission {}: checker verdict for unknown case {}", sid, frame.case)
        },
        JudgeResult::RuntimeError => {
            *wrong_answer = true;
            let mut response = slot.unwrap_or_else(|| JudgeResponse::case(
                sid, frame.case, case_name(cases, frame.case),
                SubmissionStatus::WrongAnswer));
            response.status = SubmissionStatus::WrongAnswer;
            send(responses, response);
        },
        code => {
            let mut response = JudgeResponse::case(
                sid, frame.case, case_name(cases, frame.case),
                SubmissionStatus::InternalError);
            response.msg = format!("Checker Program: {}", code);
            send(responses, response);
        }
    }

    false
}

/// Map an aggregate status frame onto a dispatcher verdict.
fn aggregate_response(sid: i64, frame: &JudgeStatus) -> JudgeResponse {
    let mut response = JudgeResponse::aggregate(sid, status_of(frame.code));
    response.time = frame.time_ms;
    response.mem = kilobytes(frame.memory_bytes);
    response.msg = match frame.code {
        // The wire status set has no dedicated compile-limit entries.
        JudgeResult::CompileTimeLimitExceeded => "compile time limit exceeded".to_owned(),
        JudgeResult::CompileMemoryLimitExceeded => "compile memory limit exceeded".to_owned(),
        _ => frame.stderr.clone().unwrap_or_default()
    };
    response
}

/// Map an internal verdict code onto a wire status.
fn status_of(code: JudgeResult) -> SubmissionStatus {
    match code {
        JudgeResult::Finished => SubmissionStatus::Accepted,
        JudgeResult::RuntimeError => SubmissionStatus::RuntimeError,
        JudgeResult::MemoryLimitExceeded => SubmissionStatus::MemoryLimitExceeded,
        JudgeResult::TimeLimitExceeded => SubmissionStatus::TimeLimitExceeded,
        JudgeResult::InternalError => SubmissionStatus::InternalError,
        JudgeResult::Judging => SubmissionStatus::Judging,
        JudgeResult::CompileError
            | JudgeResult::CompileTimeLimitExceeded
            | JudgeResult::CompileMemoryLimitExceeded => SubmissionStatus::CompileError
    }
}

/// Report an unresolvable language as a single aggregate verdict.
fn respond_unknown_language(sid: i64, responses: &Sender<JudgeResponse>) {
    let mut response = JudgeResponse::aggregate(sid, SubmissionStatus::InternalError);
    response.time = -1;
    response.mem = -1;
    response.msg = "Unknown Language".to_owned();
    send(responses, response);
}

/// Convert a byte count (or the `-1` sentinel) into kilobytes.
fn kilobytes(bytes: i64) -> i64 {
    if bytes < 0 {
        -1
    } else {
        bytes / 1024
    }
}

/// Get the display name of a case by its dense index.
fn case_name(cases: &[CaseData], index: i32) -> String {
    cases.get(index as usize)
        .map(|case| case.name.clone())
        .unwrap_or_default()
}

/// Push a verdict into the response stream. The receiver going away is
/// nothing the coordinator can act on.
fn send(responses: &Sender<JudgeResponse>, response: JudgeResponse) {
    if responses.send(response).is_err() {
        log::debug!("response receiver is gone, verdict dropped");
    }
}
