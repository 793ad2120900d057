//! This module implements the sandbox executor. An executor owns one
//! resource group and one container; every call to `run` is a fresh attempt
//! of that container, and deleting the executor removes both.
//!

use std::io::Write;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use crate::cgroup::{Cgroup, DEFAULT_CGROUP_ROOT};
use crate::runtime::{ArchiveEntry, ContainerRuntime, ContainerSpec};
use crate::sink::BoundedWriter;
use crate::{Error, ErrorKind, ExecReport, ExecStatus, MemorySize, Result, ResultExt};

/// Path of the timing wrapper's output file inside the container.
const TIMING_FILE: &str = "/tmp/time.txt";

/// Scheduling period the CPU quota applies to, in microseconds.
const CPU_PERIOD_US: u64 = 100_000;

/// Interval of the wall clock watcher's polling loop.
const WATCH_INTERVAL: Duration = Duration::from_nanos(100);

/// Configuration of a sandbox executor.
#[derive(Clone, Debug)]
pub struct ExecSpec {
    /// Name shared by the container and its resource group.
    pub name: String,

    /// Image the container is created from.
    pub image: String,

    /// Argument vector of the program under execution, without the timing
    /// wrapper prefix.
    pub argv: Vec<String>,

    /// Bind mounts, in `host:container[:ro]` notation.
    pub binds: Vec<String>,

    /// Ceiling on the memory available to the container.
    pub memory_limit: MemorySize,

    /// Ceiling on the container's wall time, in milliseconds.
    pub time_limit_ms: u64,

    /// CPU share granted to the container, as a percentage of one core.
    pub cpu_usage: u32,

    /// Mount point of the memory cgroup hierarchy.
    pub cgroup_root: PathBuf
}

impl ExecSpec {
    /// Create an `ExecSpec` with the default cgroup hierarchy mount point,
    /// no binds and a full core of CPU.
    pub fn new<N, I>(name: N, image: I, argv: Vec<String>,
        memory_limit: MemorySize, time_limit_ms: u64) -> ExecSpec
        where N: Into<String>, I: Into<String> {
        ExecSpec {
            name: name.into(),
            image: image.into(),
            argv,
            binds: Vec::new(),
            memory_limit,
            time_limit_ms,
            cpu_usage: 100,
            cgroup_root: PathBuf::from(DEFAULT_CGROUP_ROOT)
        }
    }
}

/// A one-shot sandboxed execution.
///
/// The container is named after its resource group and parented under it in
/// the cgroup hierarchy, so the kernel accounts the whole container process
/// tree against the group's ceiling.
pub struct Executor {
    /// Name shared by the container and the resource group.
    name: String,

    /// Ceiling on the container's memory usage.
    memory_limit: MemorySize,

    /// Ceiling on the container's wall time, in milliseconds.
    time_limit_ms: u64,

    /// The resource group the container is tied to.
    cgroup: Cgroup,

    /// The runtime backing the container operations.
    runtime: Arc<dyn ContainerRuntime>
}

impl Executor {
    /// Create the resource group, apply the memory ceiling and create the
    /// container. Partial resources are released again when any setup step
    /// fails.
    pub fn new(runtime: Arc<dyn ContainerRuntime>, spec: ExecSpec) -> Result<Executor> {
        let cgroup = Cgroup::create(&spec.cgroup_root, &spec.name)?;

        if let Err(e) = cgroup.set_memory_limit(spec.memory_limit) {
            let _ = cgroup.delete();
            return Err(e);
        }

        let container = ContainerSpec {
            name: spec.name.clone(),
            image: spec.image.clone(),
            argv: wrap_argv(&spec.argv, spec.time_limit_ms),
            user: String::new(),
            binds: spec.binds.clone(),
            cgroup_parent: format!("/{}", spec.name),
            cpu_period_us: CPU_PERIOD_US,
            cpu_quota_us: u64::from(spec.cpu_usage) * 1_000
        };
        if let Err(e) = runtime.create_container(&container) {
            let _ = cgroup.delete();
            return Err(Error::from(ErrorKind::Provision(
                format!("cannot create container \"{}\": {}", spec.name, e))));
        }

        log::debug!("executor {} provisioned with image {}", spec.name, spec.image);
        Ok(Executor {
            name: spec.name,
            memory_limit: spec.memory_limit,
            time_limit_ms: spec.time_limit_ms,
            cgroup,
            runtime
        })
    }

    /// Get the name shared by the container and the resource group.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Execute the container's single attempt.
    ///
    /// The three stdio attachments are opened concurrently and the container
    /// is only started once all of them signalled readiness; starting
    /// earlier would lose the program's initial output. `stdin_payload` is
    /// written to the container's stdin, which is then closed so the program
    /// observes EOF.
    pub fn run(&self, stdin_payload: &[u8]) -> ExecReport {
        let (ready_tx, ready_rx) = mpsc::channel();

        let stdin_thread = self.spawn_stdin_writer(stdin_payload.to_vec(), ready_tx.clone());
        let stdout_thread = self.spawn_capture(false, ready_tx.clone());
        let stderr_thread = self.spawn_capture(true, ready_tx);

        for _ in 0..3 {
            match ready_rx.recv() {
                Ok(Ok(())) => (),
                Ok(Err(msg)) => return ExecReport::error(
                    format!("failed to attach container stdio: {}", msg)),
                Err(..) => return ExecReport::error("container stdio attachment failed")
            }
        }

        let stop = Arc::new(AtomicBool::new(false));
        let watcher = spawn_watcher(
            self.cgroup.clone(),
            self.runtime.clone(),
            self.name.clone(),
            self.time_limit_ms,
            stop.clone());

        if let Err(e) = self.runtime.start_container(&self.name) {
            stop.store(true, Ordering::Relaxed);
            let _ = watcher.join();
            return ExecReport::error(format!("failed to start the container: {}", e));
        }

        // Drain both output streams to EOF before looking at any
        // measurement.
        let stdout = stdout_thread.join().unwrap_or_else(|_| Vec::new());
        let stderr = stderr_thread.join().unwrap_or_else(|_| Vec::new());
        let _ = stdin_thread.join();

        stop.store(true, Ordering::Relaxed);
        let watch = watcher.join().unwrap_or(WatchReport { elapsed_ms: 0, overran: false });

        let peak = match self.cgroup.peak_memory() {
            Ok(peak) => peak,
            Err(e) => return ExecReport::error(format!("cannot read peak memory usage: {}", e))
        };
        if peak >= self.memory_limit {
            return ExecReport {
                status: ExecStatus::MemoryLimitExceeded,
                time_ms: 0,
                memory: peak,
                exit_code: 0,
                stdout: String::new(),
                stderr: String::new()
            };
        }

        let raw_timing = match self.runtime.read_file(&self.name, TIMING_FILE) {
            Ok(raw) => raw,
            Err(e) => {
                if watch.overran {
                    // The watcher had to kill the container; the timing
                    // wrapper never got to record its measurements.
                    return ExecReport {
                        status: ExecStatus::TimeLimitExceeded,
                        time_ms: watch.elapsed_ms,
                        memory: peak,
                        exit_code: 0,
                        stdout: String::new(),
                        stderr: String::new()
                    };
                }
                return ExecReport::error(
                    format!("cannot copy the timing file out of the container: {}", e));
            }
        };
        let timing = match parse_timing_file(&raw_timing) {
            Ok(timing) => timing,
            Err(e) => return ExecReport::error(e.to_string())
        };

        if timing.time_ms > self.time_limit_ms {
            if let Err(e) = self.runtime.kill_container(&self.name) {
                log::debug!("cannot kill timed out container {}: {}", self.name, e);
            }
            return ExecReport {
                status: ExecStatus::TimeLimitExceeded,
                time_ms: timing.time_ms,
                memory: peak,
                exit_code: timing.exit_code,
                stdout: String::new(),
                stderr: String::new()
            };
        }

        ExecReport {
            status: ExecStatus::Finished,
            time_ms: timing.time_ms,
            memory: peak,
            exit_code: timing.exit_code,
            stdout: String::from_utf8_lossy(&stdout).into_owned(),
            stderr: String::from_utf8_lossy(&stderr).into_owned()
        }
    }

    /// Materialize the given files in the container's filesystem under
    /// `root`.
    pub fn copy_in(&self, root: &str, files: &[ArchiveEntry]) -> Result<()> {
        self.runtime.write_archive(&self.name, root, files)
            .chain_err(|| ErrorKind::RuntimeApi(
                format!("cannot copy files into container \"{}\"", self.name)))
    }

    /// Force-remove the container and delete the resource group. Both steps
    /// are always attempted; a combined diagnostic is returned when either
    /// fails. Deleting twice is safe.
    pub fn delete(&self) -> Result<()> {
        let mut failures = Vec::new();

        // The container has to go first: the daemon owns the child group
        // nested under ours.
        if let Err(e) = self.runtime.remove_container(&self.name) {
            failures.push(e.to_string());
        }
        if let Err(e) = self.cgroup.delete() {
            failures.push(e.to_string());
        }

        if failures.is_empty() {
            Ok(())
        } else {
            Err(Error::from(ErrorKind::Cleanup(failures.join("; "))))
        }
    }

    /// Spawn the thread that feeds `payload` into the container's stdin and
    /// closes it.
    fn spawn_stdin_writer(&self, payload: Vec<u8>,
        ready: mpsc::Sender<std::result::Result<(), String>>) -> JoinHandle<()> {
        let runtime = self.runtime.clone();
        let name = self.name.clone();

        std::thread::spawn(move || {
            let attach = runtime.attach_stdin(&name);
            let _ = ready.send(attach.as_ref().map(|_| ()).map_err(|e| e.to_string()));

            let mut input = match attach {
                Ok(input) => input,
                Err(..) => return
            };
            if let Err(e) = input.write_all(&payload) {
                // The program is free to exit without draining its input.
                log::debug!("stdin of container {} closed early: {}", name, e);
            }
            // Dropping the handle half-closes and closes the stream.
        })
    }

    /// Spawn the thread that drains one output stream of the container into
    /// a bounded sink.
    fn spawn_capture(&self, stderr: bool,
        ready: mpsc::Sender<std::result::Result<(), String>>) -> JoinHandle<Vec<u8>> {
        let runtime = self.runtime.clone();
        let name = self.name.clone();

        std::thread::spawn(move || {
            let attach = if stderr {
                runtime.attach_stderr(&name)
            } else {
                runtime.attach_stdout(&name)
            };
            let _ = ready.send(attach.as_ref().map(|_| ()).map_err(|e| e.to_string()));

            let mut stream = match attach {
                Ok(stream) => stream,
                Err(..) => return Vec::new()
            };
            let mut sink = BoundedWriter::with_output_limit();
            if let Err(e) = std::io::copy(&mut stream, &mut sink) {
                log::warn!("{} stream of container {} ended abnormally: {}",
                    if stderr { "stderr" } else { "stdout" }, name, e);
            }
            sink.into_bytes()
        })
    }
}

/// Prefix the caller's argv with the timing wrapper.
///
/// The wrapper records wall seconds and the exit code to the timing file,
/// arms an external timeout that delivers a signal one second past the
/// ceiling, and drops the payload to `nobody`.
fn wrap_argv(argv: &[String], time_limit_ms: u64) -> Vec<String> {
    let timeout_secs = (time_limit_ms + 999) / 1000 + 1;

    let mut wrapped = vec![
        "/usr/bin/time".to_owned(),
        "-q".to_owned(),
        "-f".to_owned(),
        "%e %x".to_owned(),
        "-o".to_owned(),
        TIMING_FILE.to_owned(),
        "/usr/bin/timeout".to_owned(),
        format!("{}s", timeout_secs),
        "/usr/bin/sudo".to_owned(),
        "-u".to_owned(),
        "nobody".to_owned(),
    ];
    wrapped.extend(argv.iter().cloned());
    wrapped
}

/// Measurements recovered from the timing wrapper's output file.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
struct Timing {
    /// Wall time of the wrapped program, in milliseconds.
    time_ms: u64,

    /// Exit code of the wrapped program. `128 + signal` when the program
    /// was terminated by a signal.
    exit_code: i32
}

/// Parse the contents of the timing wrapper's output file.
///
/// The file has one of two shapes: a single `"<seconds> <exit_code>"`
/// measurement line after a normal exit, or a diagnostic line naming the
/// delivered signal followed by the measurement line when the external
/// timeout had to intervene.
fn parse_timing_file(raw: &[u8]) -> Result<Timing> {
    let text = String::from_utf8_lossy(raw);
    let lines: Vec<&str> = text.trim_end().lines().collect();

    let (measurement, signal) = match lines.len() {
        1 => (lines[0], None),
        2 => {
            let signal = lines[0].split_whitespace().last()
                .and_then(|token| token.parse::<i32>().ok())
                .ok_or_else(|| Error::from(ErrorKind::TimingFile(
                    format!("unrecognized diagnostic line {:?}", lines[0]))))
                ?;
            (lines[1], Some(signal))
        },
        _ => return Err(Error::from(ErrorKind::TimingFile(
            format!("unexpected shape {:?}", text))))
    };

    let mut fields = measurement.split_whitespace();
    let seconds = fields.next()
        .and_then(|token| token.parse::<f64>().ok())
        .ok_or_else(|| Error::from(ErrorKind::TimingFile(
            format!("unreadable measurement line {:?}", measurement))))
        ?;
    let exit_code = fields.next()
        .and_then(|token| token.parse::<i32>().ok())
        .ok_or_else(|| Error::from(ErrorKind::TimingFile(
            format!("unreadable measurement line {:?}", measurement))))
        ?;
    if fields.next().is_some() {
        return Err(Error::from(ErrorKind::TimingFile(
            format!("unreadable measurement line {:?}", measurement))));
    }

    Ok(Timing {
        time_ms: (seconds * 1000.0).round() as u64,
        exit_code: match signal {
            Some(signal) => 128 + signal,
            None => exit_code
        }
    })
}

/// Observations of the wall clock watcher.
struct WatchReport {
    /// Wall time between the first and the last live task, in milliseconds.
    elapsed_ms: u64,

    /// Whether the watcher had to kill the container.
    overran: bool
}

/// Spawn the wall clock watcher.
///
/// The watcher polls the resource group's child task set: the clock starts
/// when tasks appear and stops when they are gone. A container whose wall
/// time exceeds the ceiling while tasks are still alive is killed on the
/// spot, which also unblocks the stream capture threads.
fn spawn_watcher(cgroup: Cgroup, runtime: Arc<dyn ContainerRuntime>, name: String,
    time_limit_ms: u64, stop: Arc<AtomicBool>) -> JoinHandle<WatchReport> {
    std::thread::spawn(move || {
        let mut started_at: Option<Instant> = None;

        while !stop.load(Ordering::Relaxed) {
            match cgroup.live_tasks() {
                Ok(Some(tasks)) => {
                    match started_at {
                        None => {
                            if !tasks.is_empty() {
                                started_at = Some(Instant::now());
                            }
                        },
                        Some(at) => {
                            let elapsed_ms = at.elapsed().as_millis() as u64;
                            if tasks.is_empty() {
                                return WatchReport { elapsed_ms, overran: false };
                            }
                            if elapsed_ms > time_limit_ms {
                                log::warn!(
                                    "container {} exceeded its wall clock ceiling, killing",
                                    name);
                                if let Err(e) = runtime.kill_container(&name) {
                                    log::error!("cannot kill container {}: {}", name, e);
                                }
                                return WatchReport { elapsed_ms, overran: true };
                            }
                        }
                    }
                },
                // The child group has not appeared yet, or the hierarchy is
                // mid-teardown.
                Ok(None) | Err(..) => ()
            }

            std::thread::sleep(WATCH_INTERVAL);
        }

        WatchReport {
            elapsed_ms: started_at.map(|at| at.elapsed().as_millis() as u64).unwrap_or(0),
            overran: false
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::testing::{ScriptedOutcome, ScriptedRuntime};

    use tempfile::TempDir;

    fn spec(root: &TempDir, name: &str) -> ExecSpec {
        let mut spec = ExecSpec::new(
            name,
            "judge/env:1",
            vec!["/work/prog".to_owned()],
            MemorySize::MegaBytes(128),
            1000);
        spec.cgroup_root = root.path().to_path_buf();
        spec
    }

    mod timing_file {
        use super::*;

        #[test]
        fn normal_shape() {
            let timing = parse_timing_file(b"0.13 0\n\n").unwrap();
            assert_eq!(Timing { time_ms: 130, exit_code: 0 }, timing);
        }

        #[test]
        fn nonzero_exit() {
            let timing = parse_timing_file(b"2.50 1\n\n").unwrap();
            assert_eq!(Timing { time_ms: 2500, exit_code: 1 }, timing);
        }

        #[test]
        fn signal_shape() {
            let raw = b"Command terminated by signal 15\n5.00 124\n\n";
            let timing = parse_timing_file(raw).unwrap();
            assert_eq!(Timing { time_ms: 5000, exit_code: 143 }, timing);
        }

        #[test]
        fn garbage_is_rejected() {
            assert!(parse_timing_file(b"").is_err());
            assert!(parse_timing_file(b"what\n").is_err());
            assert!(parse_timing_file(b"1.0 0 extra\n\n").is_err());
            assert!(parse_timing_file(b"a\nb\nc\nd\n").is_err());
        }
    }

    #[test]
    fn wrapped_argv_carries_all_three_signals() {
        let argv = vec!["/work/a.out".to_owned(), "--flag".to_owned()];
        let wrapped = wrap_argv(&argv, 1500);

        assert_eq!("/usr/bin/time", wrapped[0]);
        assert!(wrapped.contains(&"/tmp/time.txt".to_owned()));
        // ceil(1500 ms / 1000) + 1.
        assert!(wrapped.contains(&"3s".to_owned()));
        assert!(wrapped.contains(&"nobody".to_owned()));
        assert_eq!(&wrapped[wrapped.len() - 2..], &argv[..]);
    }

    #[test]
    fn finished_run_reports_measurements() {
        let root = TempDir::new().unwrap();
        let runtime = Arc::new(ScriptedRuntime::new(root.path(), |invocation| {
            let mut outcome = ScriptedOutcome::default();
            outcome.stdout = invocation.stdin.clone();
            outcome.stderr = b"warning\n".to_vec();
            outcome.seconds = 0.25;
            outcome.peak_memory = 9 * 1024 * 1024;
            outcome
        }));

        let exec = Executor::new(runtime.clone(), spec(&root, "x1")).unwrap();
        let report = exec.run(b"hello\n");

        assert_eq!(ExecStatus::Finished, report.status);
        assert_eq!(250, report.time_ms);
        assert_eq!(0, report.exit_code);
        assert_eq!("hello\n", report.stdout);
        assert_eq!("warning\n", report.stderr);
        assert_eq!(MemorySize::MegaBytes(9), report.memory);

        exec.delete().unwrap();
        assert!(runtime.container_names().is_empty());
        assert!(!root.path().join("x1").exists());
    }

    #[test]
    fn peak_at_the_ceiling_is_a_memory_limit() {
        let root = TempDir::new().unwrap();
        let runtime = Arc::new(ScriptedRuntime::new(root.path(), |_| {
            let mut outcome = ScriptedOutcome::default();
            outcome.peak_memory = 128 * 1024 * 1024;
            outcome
        }));

        let exec = Executor::new(runtime, spec(&root, "x1")).unwrap();
        let report = exec.run(b"");
        assert_eq!(ExecStatus::MemoryLimitExceeded, report.status);
        exec.delete().unwrap();
    }

    #[test]
    fn wall_time_past_the_ceiling_is_a_time_limit() {
        let root = TempDir::new().unwrap();
        let runtime = Arc::new(ScriptedRuntime::new(root.path(), |_| {
            let mut outcome = ScriptedOutcome::default();
            outcome.seconds = 5.0;
            outcome.signal = Some(15);
            outcome.exit_code = 124;
            outcome
        }));

        let exec = Executor::new(runtime, spec(&root, "x1")).unwrap();
        let report = exec.run(b"");
        assert_eq!(ExecStatus::TimeLimitExceeded, report.status);
        assert_eq!(5000, report.time_ms);
        exec.delete().unwrap();
    }

    #[test]
    fn terminating_signal_becomes_an_exit_code() {
        let root = TempDir::new().unwrap();
        let runtime = Arc::new(ScriptedRuntime::new(root.path(), |_| {
            let mut outcome = ScriptedOutcome::default();
            outcome.seconds = 0.05;
            outcome.signal = Some(11);
            outcome
        }));

        let exec = Executor::new(runtime, spec(&root, "x1")).unwrap();
        let report = exec.run(b"");
        assert_eq!(ExecStatus::Finished, report.status);
        assert_eq!(139, report.exit_code);
        exec.delete().unwrap();
    }

    #[test]
    fn copied_files_reach_the_container() {
        let root = TempDir::new().unwrap();
        let runtime = Arc::new(ScriptedRuntime::new(root.path(), |invocation| {
            let mut outcome = ScriptedOutcome::default();
            outcome.stdout = invocation.files.get("/input").cloned().unwrap_or_default();
            outcome
        }));

        let exec = Executor::new(runtime, spec(&root, "x1")).unwrap();
        exec.copy_in("/", &[
            ArchiveEntry::new("input", &b"7 11\n"[..]),
            ArchiveEntry::new("output", &b"18\n"[..]),
        ]).unwrap();

        let report = exec.run(b"");
        assert_eq!("7 11\n", report.stdout);
        exec.delete().unwrap();
    }

    #[test]
    fn failed_setup_releases_the_resource_group() {
        let root = TempDir::new().unwrap();
        let runtime = Arc::new(ScriptedRuntime::new(root.path(), |_| {
            ScriptedOutcome::default()
        }));

        let exec = Executor::new(runtime.clone(), spec(&root, "x1")).unwrap();
        // A name collision is a provision failure and must leave no second
        // group behind.
        assert!(Executor::new(runtime, spec(&root, "x1")).is_err());

        exec.delete().unwrap();
        assert!(!root.path().join("x1").exists());
    }

    #[test]
    fn delete_twice_is_safe() {
        let root = TempDir::new().unwrap();
        let runtime = Arc::new(ScriptedRuntime::new(root.path(), |_| {
            ScriptedOutcome::default()
        }));

        let exec = Executor::new(runtime, spec(&root, "x1")).unwrap();
        exec.delete().unwrap();
        exec.delete().unwrap();
    }
}
