//! This module defines the contract between the executor and the container
//! runtime backing it.
//!

use std::io::{Read, Write};

use crate::Result;

/// Parameters of a one-shot judge container.
///
/// Beyond the fields listed here, the runtime is required to create the
/// container with the TTY off, the network disabled, and all three stdio
/// streams attachable, keeping stdin open until it has been attached and
/// closed exactly once.
#[derive(Clone, Debug)]
pub struct ContainerSpec {
    /// Name of the container. Also used to derive its cgroup placement.
    pub name: String,

    /// Image the container is created from.
    pub image: String,

    /// Full argument vector of the container's init process.
    pub argv: Vec<String>,

    /// User the init process runs as. Empty for the image default.
    pub user: String,

    /// Bind mounts, in `host:container[:ro]` notation.
    pub binds: Vec<String>,

    /// Parent of the container's own cgroup, relative to the hierarchy
    /// root.
    pub cgroup_parent: String,

    /// Scheduling period the CPU quota applies to, in microseconds.
    pub cpu_period_us: u64,

    /// CPU time available per scheduling period, in microseconds.
    pub cpu_quota_us: u64
}

/// One file of a synthetic archive copied into a container.
#[derive(Clone, Debug)]
pub struct ArchiveEntry {
    /// File name, relative to the archive root.
    pub name: String,

    /// File contents.
    pub data: Vec<u8>
}

impl ArchiveEntry {
    /// Create a new `ArchiveEntry` value.
    pub fn new<N, D>(name: N, data: D) -> ArchiveEntry
        where N: Into<String>, D: Into<Vec<u8>> {
        ArchiveEntry {
            name: name.into(),
            data: data.into()
        }
    }
}

/// Capability set a container runtime has to provide to back the executor.
///
/// Implementations are shared process-wide and must therefore be thread
/// safe. All operations address containers by the name given at creation.
pub trait ContainerRuntime: Send + Sync {
    /// Create a container according to `spec`.
    fn create_container(&self, spec: &ContainerSpec) -> Result<()>;

    /// Start a previously created container.
    fn start_container(&self, name: &str) -> Result<()>;

    /// Attach to the container's stdin as an independent stream. Dropping
    /// the returned handle half-closes and then closes the stream, so the
    /// program inside the container observes EOF.
    fn attach_stdin(&self, name: &str) -> Result<Box<dyn Write + Send>>;

    /// Attach to the container's stdout as an independent stream. The
    /// reader reaches EOF when the stream ends.
    fn attach_stdout(&self, name: &str) -> Result<Box<dyn Read + Send>>;

    /// Attach to the container's stderr as an independent stream. The
    /// reader reaches EOF when the stream ends.
    fn attach_stderr(&self, name: &str) -> Result<Box<dyn Read + Send>>;

    /// Deliver SIGKILL to the container's init process.
    fn kill_container(&self, name: &str) -> Result<()>;

    /// Force-remove the container. Removing a container that is already
    /// gone is not an error.
    fn remove_container(&self, name: &str) -> Result<()>;

    /// Copy a single file out of the container's filesystem.
    fn read_file(&self, name: &str, path: &str) -> Result<Vec<u8>>;

    /// Copy the given entries into the container's filesystem under `root`,
    /// overwriting existing files and replacing directories by files where
    /// the names collide.
    fn write_archive(&self, name: &str, root: &str, entries: &[ArchiveEntry]) -> Result<()>;
}
