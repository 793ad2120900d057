//! This module implements a scripted, in-process container runtime for the
//! test suites of this crate and of crates built on top of it.
//!
//! A scripted container behaves like a real one as far as the executor can
//! observe: stdio attaches before start, output appears only after start,
//! the timing wrapper leaves its file behind, and the peak memory shows up
//! in the accounting files of the container's resource group on the
//! (synthetic) cgroup hierarchy the runtime was given.
//!

use std::collections::HashMap;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Condvar, Mutex};

use crate::runtime::{ArchiveEntry, ContainerRuntime, ContainerSpec};
use crate::{Error, ErrorKind, Result};

/// What a scripted container leaves behind once it has "run".
#[derive(Clone, Debug)]
pub struct ScriptedOutcome {
    /// Bytes produced on stdout.
    pub stdout: Vec<u8>,

    /// Bytes produced on stderr.
    pub stderr: Vec<u8>,

    /// Wall seconds recorded by the timing wrapper.
    pub seconds: f64,

    /// Exit code recorded by the timing wrapper.
    pub exit_code: i32,

    /// Signal delivered by the external timeout, if any.
    pub signal: Option<i32>,

    /// Peak memory usage accounted to the resource group, in bytes.
    pub peak_memory: usize
}

impl Default for ScriptedOutcome {
    fn default() -> ScriptedOutcome {
        ScriptedOutcome {
            stdout: Vec::new(),
            stderr: Vec::new(),
            seconds: 0.01,
            exit_code: 0,
            signal: None,
            peak_memory: 4096
        }
    }
}

/// Everything a scripted container observed before it ran.
pub struct ScriptedInvocation {
    /// The creation parameters of the container.
    pub spec: ContainerSpec,

    /// Bytes written to the container's stdin.
    pub stdin: Vec<u8>,

    /// Files copied into the container, by absolute path.
    pub files: HashMap<String, Vec<u8>>
}

/// State shared between the runtime and its attached streams.
struct Shared {
    /// The script deciding each container's outcome.
    script: Box<dyn Fn(&ScriptedInvocation) -> ScriptedOutcome + Send + Sync>,

    /// Mount point of the synthetic cgroup hierarchy.
    cgroup_root: PathBuf
}

/// A scripted container runtime.
pub struct ScriptedRuntime {
    shared: Arc<Shared>,

    /// Containers by name.
    containers: Mutex<HashMap<String, Arc<ScriptedContainer>>>
}

impl ScriptedRuntime {
    /// Create a new `ScriptedRuntime`. The script is consulted once per
    /// container, after the container has been started and its stdin has
    /// been closed.
    pub fn new<P, F>(cgroup_root: P, script: F) -> ScriptedRuntime
        where P: AsRef<Path>,
              F: Fn(&ScriptedInvocation) -> ScriptedOutcome + Send + Sync + 'static {
        ScriptedRuntime {
            shared: Arc::new(Shared {
                script: Box::new(script),
                cgroup_root: cgroup_root.as_ref().to_path_buf()
            }),
            containers: Mutex::new(HashMap::new())
        }
    }

    /// Names of the containers that currently exist. Test suites use this
    /// to assert that nothing leaked.
    pub fn container_names(&self) -> Vec<String> {
        self.containers.lock().unwrap().keys().cloned().collect()
    }

    /// Look up a container by name.
    fn container(&self, name: &str) -> Result<Arc<ScriptedContainer>> {
        self.containers.lock().unwrap()
            .get(name)
            .cloned()
            .ok_or_else(|| Error::from(ErrorKind::RuntimeApi(
                format!("no such container \"{}\"", name))))
    }
}

impl ContainerRuntime for ScriptedRuntime {
    fn create_container(&self, spec: &ContainerSpec) -> Result<()> {
        let mut containers = self.containers.lock().unwrap();
        if containers.contains_key(&spec.name) {
            return Err(Error::from(ErrorKind::RuntimeApi(
                format!("container name \"{}\" already in use", spec.name))));
        }

        containers.insert(spec.name.clone(), Arc::new(ScriptedContainer::new(spec.clone())));
        Ok(())
    }

    fn start_container(&self, name: &str) -> Result<()> {
        let container = self.container(name)?;
        let mut state = container.state.lock().unwrap();
        state.started = true;
        container.cond.notify_all();
        Ok(())
    }

    fn attach_stdin(&self, name: &str) -> Result<Box<dyn Write + Send>> {
        let container = self.container(name)?;
        container.begin_cycle();
        Ok(Box::new(ScriptedStdin { container }))
    }

    fn attach_stdout(&self, name: &str) -> Result<Box<dyn Read + Send>> {
        let container = self.container(name)?;
        container.begin_cycle();
        Ok(Box::new(ScriptedOutput {
            container,
            shared: self.shared.clone(),
            stderr: false,
            pos: 0
        }))
    }

    fn attach_stderr(&self, name: &str) -> Result<Box<dyn Read + Send>> {
        let container = self.container(name)?;
        container.begin_cycle();
        Ok(Box::new(ScriptedOutput {
            container,
            shared: self.shared.clone(),
            stderr: true,
            pos: 0
        }))
    }

    fn kill_container(&self, name: &str) -> Result<()> {
        let container = self.container(name)?;
        let mut state = container.state.lock().unwrap();
        state.killed = true;
        container.cond.notify_all();
        Ok(())
    }

    fn remove_container(&self, name: &str) -> Result<()> {
        self.containers.lock().unwrap().remove(name);
        Ok(())
    }

    fn read_file(&self, name: &str, path: &str) -> Result<Vec<u8>> {
        let container = self.container(name)?;
        let state = container.state.lock().unwrap();
        state.files.get(path)
            .cloned()
            .ok_or_else(|| Error::from(ErrorKind::RuntimeApi(
                format!("container \"{}\" has no file \"{}\"", name, path))))
    }

    fn write_archive(&self, name: &str, root: &str, entries: &[ArchiveEntry]) -> Result<()> {
        let container = self.container(name)?;
        let mut state = container.state.lock().unwrap();
        for entry in entries {
            let path = format!("{}/{}", root.trim_end_matches('/'), entry.name);
            state.files.insert(path, entry.data.clone());
        }
        Ok(())
    }
}

/// A scripted container.
struct ScriptedContainer {
    state: Mutex<ContainerState>,
    cond: Condvar
}

impl ScriptedContainer {
    fn new(spec: ContainerSpec) -> ScriptedContainer {
        ScriptedContainer {
            state: Mutex::new(ContainerState {
                spec,
                stdin: Vec::new(),
                stdin_closed: false,
                started: false,
                killed: false,
                files: HashMap::new(),
                outcome: None
            }),
            cond: Condvar::new()
        }
    }

    /// An attach to a container whose previous run has completed opens a
    /// new run cycle: the daemon restarts exited containers. Copied files
    /// survive the restart.
    fn begin_cycle(&self) {
        let mut state = self.state.lock().unwrap();
        if state.outcome.is_some() {
            state.outcome = None;
            state.stdin.clear();
            state.stdin_closed = false;
            state.started = false;
            state.killed = false;
        }
    }
}

/// Mutable state of a scripted container.
struct ContainerState {
    spec: ContainerSpec,
    stdin: Vec<u8>,
    stdin_closed: bool,
    started: bool,
    killed: bool,
    files: HashMap<String, Vec<u8>>,
    outcome: Option<ScriptedOutcome>
}

/// Attached stdin of a scripted container.
struct ScriptedStdin {
    container: Arc<ScriptedContainer>
}

impl Write for ScriptedStdin {
    fn write(&mut self, data: &[u8]) -> std::io::Result<usize> {
        let mut state = self.container.state.lock().unwrap();
        state.stdin.extend_from_slice(data);
        Ok(data.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

impl Drop for ScriptedStdin {
    fn drop(&mut self) {
        let mut state = self.container.state.lock().unwrap();
        state.stdin_closed = true;
        self.container.cond.notify_all();
    }
}

/// Attached output stream of a scripted container. The first read blocks
/// until the container has been started and its stdin closed, then the
/// script decides the outcome.
struct ScriptedOutput {
    container: Arc<ScriptedContainer>,
    shared: Arc<Shared>,
    stderr: bool,
    pos: usize
}

impl Read for ScriptedOutput {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        let mut state = self.container.state.lock().unwrap();
        while !((state.started && state.stdin_closed) || state.killed)
            && state.outcome.is_none() {
            state = self.container.cond.wait(state).unwrap();
        }

        if state.outcome.is_none() {
            let invocation = ScriptedInvocation {
                spec: state.spec.clone(),
                stdin: state.stdin.clone(),
                files: state.files.clone()
            };
            let outcome = (self.shared.script)(&invocation);

            // The kernel side of the run: the peak shows up in the group's
            // accounting files and the timing wrapper leaves its file
            // behind.
            let group = self.shared.cgroup_root.join(&state.spec.name);
            let _ = std::fs::write(
                group.join("memory.max_usage_in_bytes"),
                outcome.peak_memory.to_string());
            let _ = std::fs::write(
                group.join("memory.memsw.max_usage_in_bytes"),
                outcome.peak_memory.to_string());
            state.files.insert("/tmp/time.txt".to_owned(), render_timing_file(&outcome));

            state.outcome = Some(outcome);
        }

        let outcome = state.outcome.as_ref().unwrap();
        let data = if self.stderr { &outcome.stderr } else { &outcome.stdout };
        let take = std::cmp::min(buf.len(), data.len().saturating_sub(self.pos));
        buf[..take].copy_from_slice(&data[self.pos..self.pos + take]);
        self.pos += take;
        Ok(take)
    }
}

/// Render the timing wrapper's file for the given outcome.
fn render_timing_file(outcome: &ScriptedOutcome) -> Vec<u8> {
    match outcome.signal {
        Some(signal) => format!(
            "Command terminated by signal {}\n{:.2} {}\n\n",
            signal, outcome.seconds, outcome.exit_code).into_bytes(),
        None => format!("{:.2} {}\n\n", outcome.seconds, outcome.exit_code).into_bytes()
    }
}
