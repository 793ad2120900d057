//! This module implements the resource controller: a thin semantic layer
//! over a named kernel memory cgroup with swap accounting.
//!

use std::path::{Path, PathBuf};

use crate::{ErrorKind, MemorySize, Result, ResultExt};

/// Default mount point of the kernel memory cgroup hierarchy.
pub const DEFAULT_CGROUP_ROOT: &str = "/sys/fs/cgroup/memory";

/// A handle to a named memory cgroup.
///
/// The handle carries no kernel state of its own; cloning it yields another
/// handle to the same group.
#[derive(Clone, Debug)]
pub struct Cgroup {
    /// Absolute path of the group's directory in the cgroup hierarchy.
    path: PathBuf
}

impl Cgroup {
    /// Establish a new group named `name` under the hierarchy mounted at
    /// `root`.
    pub fn create<P>(root: P, name: &str) -> Result<Cgroup>
        where P: AsRef<Path> {
        let path = root.as_ref().join(name);
        std::fs::create_dir(&path)
            .chain_err(|| ErrorKind::Provision(
                format!("cannot create cgroup \"{}\"", path.display())))
            ?;

        // Reset the peak counters. A freshly created group reports zero
        // already; the write also materializes the accounting files on
        // synthetic hierarchies. Kernels without swap accounting refuse the
        // memsw write, which is fine.
        let _ = std::fs::write(path.join("memory.max_usage_in_bytes"), "0");
        let _ = std::fs::write(path.join("memory.memsw.max_usage_in_bytes"), "0");

        log::debug!("created cgroup at {}", path.display());
        Ok(Cgroup { path })
    }

    /// Get the path of the group's directory in the cgroup hierarchy.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Apply a ceiling on the memory available to the group's tasks. Both
    /// the RSS and the RSS+swap ceilings are written.
    pub fn set_memory_limit(&self, limit: MemorySize) -> Result<()> {
        let value = limit.bytes().to_string();
        self.write_control("memory.limit_in_bytes", &value)?;
        self.write_control("memory.memsw.limit_in_bytes", &value)?;
        Ok(())
    }

    /// Read the peak memory usage (RSS+swap) observed for the group, in
    /// bytes. May be called while tasks of the group are still running.
    ///
    /// On kernels without swap accounting the RSS-only peak is reported
    /// instead, which weakens memory limit detection accordingly.
    pub fn peak_memory(&self) -> Result<MemorySize> {
        let raw = match self.read_control("memory.memsw.max_usage_in_bytes") {
            Ok(value) => value,
            Err(..) => self.read_control("memory.max_usage_in_bytes")?
        };

        let bytes = raw.trim().parse::<usize>()
            .chain_err(|| ErrorKind::Provision(
                format!("unreadable peak usage counter in \"{}\"", self.path.display())))
            ?;
        Ok(MemorySize::Bytes(bytes))
    }

    /// Get the current membership of the child group's task set.
    ///
    /// The container daemon parents the container's own group under this
    /// one; the tasks of interest live in that child. Returns `Ok(None)`
    /// while no child group has appeared yet, and an empty set once the
    /// child's tasks are gone.
    pub fn live_tasks(&self) -> Result<Option<Vec<i32>>> {
        let entries = std::fs::read_dir(&self.path)
            .chain_err(|| ErrorKind::Provision(
                format!("cannot enumerate cgroup \"{}\"", self.path.display())))
            ?;

        let child = entries
            .filter_map(|entry| entry.ok())
            .find(|entry| entry.path().is_dir());
        let child = match child {
            Some(entry) => entry.path(),
            None => return Ok(None)
        };

        match std::fs::read_to_string(child.join("tasks")) {
            Ok(content) => Ok(Some(content.lines()
                .filter_map(|line| line.trim().parse::<i32>().ok())
                .collect())),
            // The child group vanished between the scan and the read: its
            // task set is empty.
            Err(..) => Ok(Some(Vec::new()))
        }
    }

    /// Remove the group from the hierarchy. Removing a group that is
    /// already gone is not an error.
    pub fn delete(&self) -> Result<()> {
        // Child groups and materialized control files go first. On kernel
        // hierarchies the unlinks are refused and the final rmdir alone
        // suffices.
        if let Ok(entries) = std::fs::read_dir(&self.path) {
            for entry in entries.filter_map(|entry| entry.ok()) {
                let path = entry.path();
                let _ = if path.is_dir() {
                    std::fs::remove_dir(&path)
                } else {
                    std::fs::remove_file(&path)
                };
            }
        }

        match std::fs::remove_dir(&self.path) {
            Ok(..) => Ok(()),
            Err(ref e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(crate::Error::from(ErrorKind::Cleanup(
                format!("cannot remove cgroup \"{}\": {}", self.path.display(), e))))
        }
    }

    /// Write a value into one of the group's control files.
    fn write_control(&self, control: &str, value: &str) -> Result<()> {
        let path = self.path.join(control);
        std::fs::write(&path, value)
            .chain_err(|| ErrorKind::Provision(
                format!("cannot write \"{}\"", path.display())))
    }

    /// Read the contents of one of the group's control files.
    fn read_control(&self, control: &str) -> Result<String> {
        let path = self.path.join(control);
        std::fs::read_to_string(&path)
            .chain_err(|| ErrorKind::Provision(
                format!("cannot read \"{}\"", path.display())))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use tempfile::TempDir;

    fn hierarchy() -> TempDir {
        TempDir::new().expect("cannot create temporary cgroup hierarchy")
    }

    #[test]
    fn create_and_limit() {
        let root = hierarchy();
        let group = Cgroup::create(root.path(), "g1").unwrap();
        group.set_memory_limit(MemorySize::MegaBytes(64)).unwrap();

        let limit = std::fs::read_to_string(group.path().join("memory.limit_in_bytes"))
            .unwrap();
        assert_eq!((64 * 1024 * 1024).to_string(), limit);
        let memsw = std::fs::read_to_string(group.path().join("memory.memsw.limit_in_bytes"))
            .unwrap();
        assert_eq!((64 * 1024 * 1024).to_string(), memsw);
    }

    #[test]
    fn create_collision_is_a_provision_failure() {
        let root = hierarchy();
        Cgroup::create(root.path(), "g1").unwrap();
        assert!(Cgroup::create(root.path(), "g1").is_err());
    }

    #[test]
    fn peak_memory_prefers_swap_accounting() {
        let root = hierarchy();
        let group = Cgroup::create(root.path(), "g1").unwrap();

        std::fs::write(group.path().join("memory.max_usage_in_bytes"), "100").unwrap();
        std::fs::write(group.path().join("memory.memsw.max_usage_in_bytes"), "250").unwrap();
        assert_eq!(MemorySize::Bytes(250), group.peak_memory().unwrap());
    }

    #[test]
    fn peak_memory_falls_back_to_rss() {
        let root = hierarchy();
        let group = Cgroup::create(root.path(), "g1").unwrap();

        std::fs::remove_file(group.path().join("memory.memsw.max_usage_in_bytes")).unwrap();
        std::fs::write(group.path().join("memory.max_usage_in_bytes"), "4096").unwrap();
        assert_eq!(MemorySize::Bytes(4096), group.peak_memory().unwrap());
    }

    #[test]
    fn live_tasks_tracks_the_child_group() {
        let root = hierarchy();
        let group = Cgroup::create(root.path(), "g1").unwrap();
        assert_eq!(None, group.live_tasks().unwrap());

        let child = group.path().join("fc12ab");
        std::fs::create_dir(&child).unwrap();
        std::fs::write(child.join("tasks"), "101\n102\n").unwrap();
        assert_eq!(Some(vec![101, 102]), group.live_tasks().unwrap());

        std::fs::write(child.join("tasks"), "").unwrap();
        assert_eq!(Some(Vec::new()), group.live_tasks().unwrap());
    }

    #[test]
    fn delete_is_idempotent() {
        let root = hierarchy();
        let group = Cgroup::create(root.path(), "g1").unwrap();

        group.delete().unwrap();
        assert!(!group.path().exists());
        group.delete().unwrap();
    }
}
