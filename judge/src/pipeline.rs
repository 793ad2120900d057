//! This module implements the judge pipeline: the per-submission driver
//! that provisions an identity and a work directory, materializes the
//! submitted source, optionally compiles it, and streams every test case
//! through a sandbox executor while folding per-case codes into the
//! aggregate.
//!

use std::fs::{DirBuilder, OpenOptions};
use std::io::Write;
use std::os::unix::fs::{DirBuilderExt, OpenOptionsExt, PermissionsExt};
use std::path::{Path, PathBuf};

use crossbeam_channel::{Receiver, Sender};
use rand::Rng;

use sandbox::{ArchiveEntry, ExecReport, ExecSpec, ExecStatus, Executor, MemorySize};

use crate::{ExecRequest, JudgeEnv, JudgeResult, JudgeStatus, Result, TestCase};

/// Memory ceiling of compile containers.
const COMPILE_MEMORY_LIMIT: MemorySize = MemorySize::MegaBytes(512);

/// Wall time ceiling of compile containers, in milliseconds.
const COMPILE_TIME_LIMIT_MS: u64 = 10_000;

/// Alphabet of submission identifiers.
const IDENT_CHARSET: &[u8] =
    b"abcdefghijklmnopqrstuvwxyzABCDEFGHIJKLMNOPQRSTUVWXYZ0123456789";

/// Length of submission identifiers.
const IDENT_LEN: usize = 16;

/// Draw a fresh submission identifier. Work directory, container names and
/// resource group names of the pipeline all derive from it.
fn random_identifier() -> String {
    let mut rng = rand::thread_rng();
    (0..IDENT_LEN)
        .map(|_| IDENT_CHARSET[rng.gen_range(0, IDENT_CHARSET.len())] as char)
        .collect()
}

/// Describe one judge pipeline: the program, its optional compile phase and
/// the per-case limits.
#[derive(Clone, Debug)]
pub struct Judge {
    /// The submitted source code.
    pub code: String,

    /// Name the source is materialized under in the work directory.
    pub source_file_name: String,

    /// The compile phase, absent for interpreted languages.
    pub compile: Option<ExecRequest>,

    /// The execute phase.
    pub exec: ExecRequest,

    /// Per-case wall time ceiling, in milliseconds.
    pub time_limit_ms: u64,

    /// Per-case memory ceiling.
    pub memory_limit: MemorySize
}

/// Outcome of the compile phase.
enum CompilePhase {
    /// Compilation succeeded (or was not needed); proceed to execution.
    Continue,

    /// The pipeline ends with the given aggregate frame.
    Stop(JudgeStatus)
}

impl Judge {
    /// Run the pipeline.
    ///
    /// Emits a finite stream of frames into `status` and closes it on exit:
    /// per-case frames in the order the cases arrive on `cases`, the
    /// aggregate frame last. A message on `kill` (or its disconnection)
    /// aborts the pipeline with an `InternalError` aggregate. All resources
    /// provisioned under the pipeline's identifier are released on every
    /// path out of here.
    pub fn run(&self, env: &JudgeEnv,
        status: Sender<JudgeStatus>, cases: Receiver<TestCase>, kill: Receiver<()>) {
        let id = random_identifier();
        log::info!("pipeline {}: starting", id);

        let workdir = match self.provision(env, &id) {
            Ok(workdir) => workdir,
            Err(e) => {
                emit(&status, JudgeStatus::internal_error(
                    format!("failed to provision the working directory: {}", e)));
                return;
            }
        };
        let _workdir = WorkDirGuard { path: workdir.clone() };

        if let Some(ref compile) = self.compile {
            log::debug!("pipeline {}: compiling", id);
            match self.run_compiler(env, &id, compile, &workdir) {
                CompilePhase::Continue => (),
                CompilePhase::Stop(frame) => {
                    emit(&status, frame);
                    return;
                }
            }
        }

        let mut spec = ExecSpec::new(
            id.as_str(),
            self.exec.image.as_str(),
            self.exec.argv.clone(),
            self.memory_limit,
            self.time_limit_ms);
        spec.binds = vec![format!("{}:/work:ro", workdir.display())];
        spec.cpu_usage = env.cpu_usage;
        spec.cgroup_root = env.cgroup_root.clone();

        let executor = match Executor::new(env.runtime.clone(), spec) {
            Ok(executor) => executor,
            Err(e) => {
                emit(&status, JudgeStatus::internal_error(
                    format!("failed to create the judge container: {}", e)));
                return;
            }
        };
        let executor = ExecutorGuard { inner: executor };

        let mut max_code = JudgeResult::Finished;
        let mut max_time: i64 = 0;
        let mut max_memory: i64 = 0;

        loop {
            let case = crossbeam_channel::select! {
                recv(kill) -> _ => {
                    // Cancellation requested, or the coordinator went away.
                    log::warn!("pipeline {}: killed", id);
                    emit(&status, JudgeStatus::aggregate(JudgeResult::InternalError, -1, -1));
                    return;
                },
                recv(cases) -> case => match case {
                    Ok(case) => case,
                    Err(..) => break
                }
            };

            emit(&status, JudgeStatus::case(case.id, JudgeResult::Judging));
            let report = run_case(&executor.inner, &case);
            log::debug!("pipeline {}: case {} finished as {:?}", id, case.id, report.status);

            let time_ms = report.time_ms as i64;
            let memory_bytes = report.memory.bytes() as i64;

            let (frame, code) = match report.status {
                ExecStatus::Error => {
                    let mut frame = JudgeStatus::case(case.id, JudgeResult::InternalError);
                    frame.stderr = Some(
                        format!("failed to execute the program: {}", report.stderr));
                    (frame, JudgeResult::InternalError)
                },
                ExecStatus::MemoryLimitExceeded => (
                    JudgeStatus::case(case.id, JudgeResult::MemoryLimitExceeded),
                    JudgeResult::MemoryLimitExceeded
                ),
                ExecStatus::TimeLimitExceeded => (
                    JudgeStatus::case(case.id, JudgeResult::TimeLimitExceeded),
                    JudgeResult::TimeLimitExceeded
                ),
                ExecStatus::Finished if report.exit_code != 0 => (
                    JudgeStatus::case(case.id, JudgeResult::RuntimeError),
                    JudgeResult::RuntimeError
                ),
                ExecStatus::Finished => {
                    let mut frame = JudgeStatus::case(case.id, JudgeResult::Finished);
                    frame.time_ms = time_ms;
                    frame.memory_bytes = memory_bytes;
                    frame.stdout = Some(report.stdout);
                    frame.stderr = Some(report.stderr);
                    (frame, JudgeResult::Finished)
                }
            };
            emit(&status, frame);

            max_code = std::cmp::max(max_code, code);
            if code != JudgeResult::Finished {
                // Measurements of a failed submission are meaningless.
                max_time = -1;
                max_memory = -1;
            } else if max_time >= 0 && max_memory >= 0 {
                max_time = std::cmp::max(max_time, time_ms);
                max_memory = std::cmp::max(max_memory, memory_bytes);
            }
        }

        log::info!("pipeline {}: finished as {:?}", id, max_code);
        emit(&status, JudgeStatus::aggregate(max_code, max_time, max_memory));
    }

    /// Create the work directory and materialize the submitted source.
    fn provision(&self, env: &JudgeEnv, id: &str) -> Result<PathBuf> {
        let workdir = env.workdir_root.join(id);
        DirBuilder::new().mode(0o777).create(&workdir)?;
        // The mode given to mkdir is filtered by the umask; the container
        // side needs the full bits to write build artifacts as an
        // unprivileged user.
        std::fs::set_permissions(&workdir, std::fs::Permissions::from_mode(0o777))?;

        let source = workdir.join(&self.source_file_name);
        let mut file = OpenOptions::new()
            .write(true)
            .create_new(true)
            .mode(0o644)
            .open(&source)?;
        file.write_all(self.code.as_bytes())?;

        Ok(workdir)
    }

    /// Run the compile phase in its own short-lived executor.
    fn run_compiler(&self, env: &JudgeEnv, id: &str, compile: &ExecRequest,
        workdir: &Path) -> CompilePhase {
        let mut spec = ExecSpec::new(
            id,
            compile.image.as_str(),
            compile.argv.clone(),
            COMPILE_MEMORY_LIMIT,
            COMPILE_TIME_LIMIT_MS);
        spec.binds = vec![format!("{}:/work", workdir.display())];
        spec.cpu_usage = env.cpu_usage;
        spec.cgroup_root = env.cgroup_root.clone();

        let executor = match Executor::new(env.runtime.clone(), spec) {
            Ok(executor) => executor,
            Err(e) => return CompilePhase::Stop(JudgeStatus::internal_error(
                format!("failed to create the compile container: {}", e)))
        };
        let report = executor.run(b"");
        if let Err(e) = executor.delete() {
            log::error!("pipeline {}: compile cleanup failed: {}", id, e);
        }

        match report.status {
            ExecStatus::Error => CompilePhase::Stop(JudgeStatus::internal_error(
                format!("failed to execute the compiler: {}", report.stderr))),
            ExecStatus::MemoryLimitExceeded => CompilePhase::Stop(
                JudgeStatus::aggregate(JudgeResult::CompileMemoryLimitExceeded, -1, -1)),
            ExecStatus::TimeLimitExceeded => CompilePhase::Stop(
                JudgeStatus::aggregate(JudgeResult::CompileTimeLimitExceeded, -1, -1)),
            ExecStatus::Finished if report.exit_code != 0 => {
                let mut frame = JudgeStatus::aggregate(JudgeResult::CompileError, -1, -1);
                frame.stderr = Some(format!("{}{}", report.stdout, report.stderr));
                CompilePhase::Stop(frame)
            },
            ExecStatus::Finished => CompilePhase::Continue
        }
    }
}

/// Run one test case through the execute-phase executor.
fn run_case(executor: &Executor, case: &TestCase) -> ExecReport {
    match case.output {
        Some(ref expected) => {
            let payloads = [
                ArchiveEntry::new("input", case.input.as_bytes()),
                ArchiveEntry::new("output", expected.as_bytes()),
            ];
            if let Err(e) = executor.copy_in("/", &payloads) {
                return ExecReport::error(
                    format!("cannot materialize the test case payloads: {}", e));
            }
            executor.run(b"")
        },
        None => executor.run(case.input.as_bytes())
    }
}

/// Push a frame into the status stream. The receiver going away is nothing
/// the pipeline can act on.
fn emit(status: &Sender<JudgeStatus>, frame: JudgeStatus) {
    if status.send(frame).is_err() {
        log::debug!("status receiver is gone, frame dropped");
    }
}

/// Removes the pipeline's work directory on scope exit.
struct WorkDirGuard {
    path: PathBuf
}

impl Drop for WorkDirGuard {
    fn drop(&mut self) {
        if let Err(e) = std::fs::remove_dir_all(&self.path) {
            log::warn!("cannot remove work directory {}: {}", self.path.display(), e);
        }
    }
}

/// Deletes the execute-phase executor on scope exit.
struct ExecutorGuard {
    inner: Executor
}

impl Drop for ExecutorGuard {
    fn drop(&mut self) {
        if let Err(e) = self.inner.delete() {
            log::error!("failed to delete executor {}: {}", self.inner.name(), e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::sync::Arc;

    use crossbeam_channel::unbounded;
    use tempfile::TempDir;

    use sandbox::testing::{ScriptedInvocation, ScriptedOutcome, ScriptedRuntime};
    use sandbox::ContainerRuntime;

    struct Fixture {
        env: JudgeEnv,
        runtime: Arc<ScriptedRuntime>,
        workdir_root: TempDir,
        _cgroup_root: TempDir
    }

    fn fixture<F>(script: F) -> Fixture
        where F: Fn(&ScriptedInvocation) -> ScriptedOutcome + Send + Sync + 'static {
        let workdir_root = TempDir::new().unwrap();
        let cgroup_root = TempDir::new().unwrap();
        let runtime = Arc::new(ScriptedRuntime::new(cgroup_root.path(), script));

        let shared: Arc<dyn ContainerRuntime> = runtime.clone();
        let mut env = JudgeEnv::new(shared, workdir_root.path());
        env.cgroup_root = cgroup_root.path().to_path_buf();

        Fixture { env, runtime, workdir_root, _cgroup_root: cgroup_root }
    }

    fn plain_judge() -> Judge {
        Judge {
            code: "print(input())".to_owned(),
            source_file_name: "main.py".to_owned(),
            compile: None,
            exec: ExecRequest {
                image: "img/run".to_owned(),
                argv: vec!["python".to_owned(), "/work/main.py".to_owned()]
            },
            time_limit_ms: 1000,
            memory_limit: MemorySize::MegaBytes(128)
        }
    }

    fn compiled_judge() -> Judge {
        let mut judge = plain_judge();
        judge.source_file_name = "main.c".to_owned();
        judge.compile = Some(ExecRequest {
            image: "img/compile".to_owned(),
            argv: vec!["gcc".to_owned(), "/work/main.c".to_owned()]
        });
        judge
    }

    fn run_to_frames(judge: &Judge, env: &JudgeEnv, cases: Vec<TestCase>) -> Vec<JudgeStatus> {
        let (status_tx, status_rx) = unbounded();
        let (cases_tx, cases_rx) = unbounded();
        let (_kill_tx, kill_rx) = unbounded::<()>();

        for case in cases {
            cases_tx.send(case).unwrap();
        }
        drop(cases_tx);

        judge.run(env, status_tx, cases_rx, kill_rx);
        status_rx.try_iter().collect()
    }

    fn case(id: i32, input: &str) -> TestCase {
        TestCase { id, input: input.to_owned(), output: None }
    }

    #[test]
    fn frames_arrive_in_enqueue_order_with_the_aggregate_last() {
        let fx = fixture(|invocation| {
            let mut outcome = ScriptedOutcome::default();
            outcome.stdout = invocation.stdin.clone();
            outcome.seconds = 0.05 * invocation.stdin.len() as f64;
            outcome.peak_memory = 1024 * invocation.stdin.len();
            outcome
        });
        let frames = run_to_frames(&plain_judge(), &fx.env, vec![
            case(0, "hi\n"),
            case(1, "x\n"),
        ]);

        let shape: Vec<(i32, JudgeResult)> =
            frames.iter().map(|f| (f.case, f.code)).collect();
        assert_eq!(vec![
            (0, JudgeResult::Judging),
            (0, JudgeResult::Finished),
            (1, JudgeResult::Judging),
            (1, JudgeResult::Finished),
            (-1, JudgeResult::Finished),
        ], shape);

        assert_eq!(Some("hi\n"), frames[1].stdout.as_ref().map(|s| s.as_str()));
        assert_eq!(150, frames[1].time_ms);
        assert_eq!(3 * 1024, frames[1].memory_bytes);

        // The aggregate carries the maxima over the accepted cases.
        let aggregate = frames.last().unwrap();
        assert_eq!(150, aggregate.time_ms);
        assert_eq!(3 * 1024, aggregate.memory_bytes);
    }

    #[test]
    fn everything_is_released_on_exit() {
        let fx = fixture(|_| ScriptedOutcome::default());
        run_to_frames(&plain_judge(), &fx.env, vec![case(0, "in\n")]);

        assert!(fx.runtime.container_names().is_empty());
        assert_eq!(0, std::fs::read_dir(fx.workdir_root.path()).unwrap().count());
        assert_eq!(0, std::fs::read_dir(fx.env.cgroup_root.as_path()).unwrap().count());
    }

    #[test]
    fn compile_failure_is_a_single_aggregate_frame() {
        let fx = fixture(|invocation| {
            assert_eq!("img/compile", invocation.spec.image);
            let mut outcome = ScriptedOutcome::default();
            outcome.exit_code = 2;
            outcome.stderr = b"main.c:1: error: expected expression\n".to_vec();
            outcome
        });
        let frames = run_to_frames(&compiled_judge(), &fx.env, vec![case(0, "")]);

        assert_eq!(1, frames.len());
        assert_eq!(-1, frames[0].case);
        assert_eq!(JudgeResult::CompileError, frames[0].code);
        assert!(frames[0].stderr.as_ref().unwrap().contains("expected expression"));
        assert!(fx.runtime.container_names().is_empty());
    }

    #[test]
    fn successful_compilation_proceeds_to_execution() {
        let fx = fixture(|invocation| {
            let mut outcome = ScriptedOutcome::default();
            match invocation.spec.image.as_str() {
                "img/compile" => (),
                "img/run" => outcome.stdout = b"ok\n".to_vec(),
                image => panic!("unexpected image: {}", image)
            }
            outcome
        });
        let frames = run_to_frames(&compiled_judge(), &fx.env, vec![case(0, "")]);

        let shape: Vec<(i32, JudgeResult)> =
            frames.iter().map(|f| (f.case, f.code)).collect();
        assert_eq!(vec![
            (0, JudgeResult::Judging),
            (0, JudgeResult::Finished),
            (-1, JudgeResult::Finished),
        ], shape);
    }

    #[test]
    fn nonzero_exit_is_a_runtime_error_with_invalidated_measurements() {
        let fx = fixture(|_| {
            let mut outcome = ScriptedOutcome::default();
            outcome.exit_code = 1;
            outcome
        });
        let frames = run_to_frames(&plain_judge(), &fx.env, vec![case(0, "")]);

        assert_eq!(JudgeResult::RuntimeError, frames[1].code);
        let aggregate = frames.last().unwrap();
        assert_eq!(JudgeResult::RuntimeError, aggregate.code);
        assert_eq!(-1, aggregate.time_ms);
        assert_eq!(-1, aggregate.memory_bytes);
    }

    #[test]
    fn overlong_run_is_a_time_limit_everywhere() {
        let fx = fixture(|_| {
            let mut outcome = ScriptedOutcome::default();
            outcome.seconds = 5.0;
            outcome.signal = Some(15);
            outcome.exit_code = 124;
            outcome
        });
        let frames = run_to_frames(&plain_judge(), &fx.env, vec![case(0, "")]);

        assert_eq!(JudgeResult::TimeLimitExceeded, frames[1].code);
        let aggregate = frames.last().unwrap();
        assert_eq!(JudgeResult::TimeLimitExceeded, aggregate.code);
        assert_eq!(-1, aggregate.time_ms);
        assert_eq!(-1, aggregate.memory_bytes);
    }

    #[test]
    fn oversized_peak_is_a_memory_limit() {
        let fx = fixture(|_| {
            let mut outcome = ScriptedOutcome::default();
            outcome.peak_memory = 2 * 1024 * 1024 * 1024;
            outcome
        });
        let frames = run_to_frames(&plain_judge(), &fx.env, vec![case(0, "")]);

        assert_eq!(JudgeResult::MemoryLimitExceeded, frames[1].code);
        assert_eq!(JudgeResult::MemoryLimitExceeded, frames.last().unwrap().code);
    }

    #[test]
    fn attached_expected_output_is_materialized_in_the_container() {
        let fx = fixture(|invocation| {
            assert!(invocation.stdin.is_empty());
            let mut outcome = ScriptedOutcome::default();
            outcome.stdout = invocation.files.get("/output").cloned().unwrap();
            outcome.stderr = invocation.files.get("/input").cloned().unwrap();
            outcome
        });
        let judge = plain_judge();
        let frames = run_to_frames(&judge, &fx.env, vec![
            TestCase { id: 0, input: "7 11\n".to_owned(), output: Some("18\n".to_owned()) },
        ]);

        assert_eq!(JudgeResult::Finished, frames[1].code);
        assert_eq!(Some("18\n"), frames[1].stdout.as_ref().map(|s| s.as_str()));
        assert_eq!(Some("7 11\n"), frames[1].stderr.as_ref().map(|s| s.as_str()));
    }

    #[test]
    fn kill_signal_aborts_with_an_internal_error() {
        let fx = fixture(|_| ScriptedOutcome::default());

        let (status_tx, status_rx) = unbounded();
        let (_cases_tx, cases_rx) = unbounded::<TestCase>();
        let (kill_tx, kill_rx) = unbounded();
        kill_tx.send(()).unwrap();

        plain_judge().run(&fx.env, status_tx, cases_rx, kill_rx);
        let frames: Vec<JudgeStatus> = status_rx.try_iter().collect();

        assert_eq!(1, frames.len());
        assert_eq!(-1, frames[0].case);
        assert_eq!(JudgeResult::InternalError, frames[0].code);
        assert!(fx.runtime.container_names().is_empty());
        assert_eq!(0, std::fs::read_dir(fx.workdir_root.path()).unwrap().count());
    }

    #[test]
    fn provisioning_failure_is_an_internal_error() {
        let fx = fixture(|_| ScriptedOutcome::default());
        let mut env = JudgeEnv::new(fx.env.runtime.clone(), "/nonexistent/judge/root");
        env.cgroup_root = fx.env.cgroup_root.clone();

        let frames = run_to_frames(&plain_judge(), &env, vec![case(0, "")]);
        assert_eq!(1, frames.len());
        assert_eq!(JudgeResult::InternalError, frames[0].code);
        assert!(frames[0].stderr.is_some());
    }

    #[test]
    fn source_is_materialized_with_the_configured_name() {
        let fx = fixture(|invocation| {
            // The work directory is bound read-only at /work during the
            // execute phase.
            assert_eq!(1, invocation.spec.binds.len());
            assert!(invocation.spec.binds[0].ends_with(":/work:ro"));
            ScriptedOutcome::default()
        });
        let judge = plain_judge();
        let frames = run_to_frames(&judge, &fx.env, vec![case(0, "")]);
        assert_eq!(JudgeResult::Finished, frames.last().unwrap().code);
    }
}
