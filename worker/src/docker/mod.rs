//! This module implements the container runtime contract against the
//! Docker Engine HTTP API over TCP.
//!
//! Plain REST operations (create, start, kill, remove, archive transfer)
//! go through `reqwest`. The three stdio attachments cannot: attaching to
//! a container hijacks the HTTP connection, so they run over raw TCP
//! streams upgraded by hand, with the daemon's 8-byte-header stream
//! multiplexing decoded on the way out (see `attach`).
//!

mod attach;

use std::io::{Read, Write};

use reqwest::{Client as HttpClient, StatusCode};
use serde::Serialize;

use sandbox::{ArchiveEntry, ContainerRuntime, ContainerSpec};

use attach::{AttachInput, StreamDemuxer};

error_chain::error_chain! {
    types {
        Error, ErrorKind, ResultExt, Result;
    }

    foreign_links {
        Io(::std::io::Error);
        Http(::reqwest::Error);
    }

    errors {
        BadEndpoint(endpoint: String) {
            description("malformed container daemon endpoint")
            display("malformed container daemon endpoint: {}", endpoint)
        }

        Api(status: u16, msg: String) {
            description("container daemon request failed")
            display("container daemon responded {}: {}", status, msg)
        }

        Upgrade(msg: String) {
            description("attach connection upgrade failed")
            display("attach connection upgrade failed: {}", msg)
        }
    }
}

/// Container creation payload, in the Engine API shape.
#[derive(Serialize)]
#[serde(rename_all = "PascalCase")]
struct CreateBody<'a> {
    image: &'a str,
    cmd: &'a [String],
    user: &'a str,
    tty: bool,
    open_stdin: bool,
    stdin_once: bool,
    attach_stdin: bool,
    attach_stdout: bool,
    attach_stderr: bool,
    host_config: HostConfig<'a>
}

/// Host-side container configuration, in the Engine API shape.
#[derive(Serialize)]
#[serde(rename_all = "PascalCase")]
struct HostConfig<'a> {
    binds: &'a [String],
    network_mode: &'a str,
    cgroup_parent: &'a str,
    cpu_period: u64,
    cpu_quota: u64
}

/// A client to the container daemon. Constructed once at startup and shared
/// process-wide; all operations are thread safe.
pub struct DockerClient {
    /// Base URL of the REST endpoint, e.g. `http://127.0.0.1:2375`.
    base: String,

    /// `host:port` of the daemon, for the upgraded attach connections.
    addr: String,

    /// The HTTP client behind the REST operations.
    http: HttpClient
}

impl DockerClient {
    /// Create a client for the daemon at `endpoint` (`tcp://host:port`).
    pub fn new(endpoint: &str) -> Result<DockerClient> {
        let addr = endpoint
            .trim_start_matches("tcp://")
            .trim_start_matches("http://")
            .trim_end_matches('/')
            .to_owned();
        if addr.is_empty() || addr.contains('/') {
            return Err(Error::from(ErrorKind::BadEndpoint(endpoint.to_owned())));
        }

        Ok(DockerClient {
            base: format!("http://{}", addr),
            addr,
            http: HttpClient::new()
        })
    }

    /// Get the full URL of an API path.
    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base, path)
    }

    /// Turn an unsuccessful response into an `Api` error.
    fn check(response: reqwest::Response) -> Result<reqwest::Response> {
        if response.status().is_success() {
            Ok(response)
        } else {
            let status = response.status().as_u16();
            let mut response = response;
            let body = response.text().unwrap_or_default();
            Err(Error::from(ErrorKind::Api(status, body.trim().to_owned())))
        }
    }

    /// Create a container: stdio attached with stdin kept open and closed
    /// once, no TTY, no network, and the cgroup placement and CPU quota
    /// from the spec.
    fn create(&self, spec: &ContainerSpec) -> Result<()> {
        let body = CreateBody {
            image: &spec.image,
            cmd: &spec.argv,
            user: &spec.user,
            tty: false,
            open_stdin: true,
            stdin_once: true,
            attach_stdin: true,
            attach_stdout: true,
            attach_stderr: true,
            host_config: HostConfig {
                binds: &spec.binds,
                network_mode: "none",
                cgroup_parent: &spec.cgroup_parent,
                cpu_period: spec.cpu_period_us,
                cpu_quota: spec.cpu_quota_us
            }
        };

        let response = self.http
            .post(&self.url("/containers/create"))
            .query(&[("name", spec.name.as_str())])
            .json(&body)
            .send()?;
        Self::check(response)?;
        Ok(())
    }

    /// Start a created container.
    fn start(&self, name: &str) -> Result<()> {
        let response = self.http
            .post(&self.url(&format!("/containers/{}/start", name)))
            .send()?;
        Self::check(response)?;
        Ok(())
    }

    /// Deliver SIGKILL to the container's init process.
    fn kill(&self, name: &str) -> Result<()> {
        let response = self.http
            .post(&self.url(&format!("/containers/{}/kill", name)))
            .query(&[("signal", "SIGKILL")])
            .send()?;
        Self::check(response)?;
        Ok(())
    }

    /// Force-remove a container; a container that is already gone counts as
    /// removed.
    fn remove(&self, name: &str) -> Result<()> {
        let response = self.http
            .delete(&self.url(&format!("/containers/{}", name)))
            .query(&[("force", "true")])
            .send()?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(());
        }
        Self::check(response)?;
        Ok(())
    }

    /// Copy one file out of the container. The daemon answers with a tar
    /// archive holding the requested file.
    fn read_file_from(&self, name: &str, path: &str) -> Result<Vec<u8>> {
        let response = self.http
            .get(&self.url(&format!("/containers/{}/archive", name)))
            .query(&[("path", path)])
            .send()?;
        let response = Self::check(response)?;

        let mut archive = tar::Archive::new(response);
        for entry in archive.entries()? {
            let mut entry = entry?;
            if entry.header().entry_type().is_file() {
                let mut data = Vec::new();
                entry.read_to_end(&mut data)?;
                return Ok(data);
            }
        }

        Err(Error::from(ErrorKind::Api(
            200, format!("archive of \"{}\" held no regular file", path))))
    }

    /// Copy the given entries into the container under `root`.
    fn write_archive_to(&self, name: &str, root: &str,
        entries: &[ArchiveEntry]) -> Result<()> {
        let payload = build_archive(entries)?;

        let response = self.http
            .put(&self.url(&format!("/containers/{}/archive", name)))
            .query(&[("path", root), ("noOverwriteDirNonDir", "false")])
            .header("Content-Type", "application/x-tar")
            .body(payload)
            .send()?;
        Self::check(response)?;
        Ok(())
    }
}

/// Render the given entries as an in-memory tar archive.
fn build_archive(entries: &[ArchiveEntry]) -> Result<Vec<u8>> {
    let mut builder = tar::Builder::new(Vec::new());
    for entry in entries {
        let mut header = tar::Header::new_gnu();
        header.set_size(entry.data.len() as u64);
        header.set_mode(0o644);
        builder.append_data(&mut header, &entry.name, entry.data.as_slice())?;
    }
    builder.into_inner().map_err(Error::from)
}

/// Map an internal error onto the runtime contract's error space.
fn runtime_err(e: Error) -> sandbox::Error {
    sandbox::Error::from(sandbox::ErrorKind::RuntimeApi(e.to_string()))
}

impl ContainerRuntime for DockerClient {
    fn create_container(&self, spec: &ContainerSpec) -> sandbox::Result<()> {
        self.create(spec).map_err(runtime_err)
    }

    fn start_container(&self, name: &str) -> sandbox::Result<()> {
        self.start(name).map_err(runtime_err)
    }

    fn attach_stdin(&self, name: &str) -> sandbox::Result<Box<dyn Write + Send>> {
        let stream = attach::open(&self.addr, name, attach::Stream::Stdin)
            .map_err(runtime_err)?;
        Ok(Box::new(AttachInput::new(stream)))
    }

    fn attach_stdout(&self, name: &str) -> sandbox::Result<Box<dyn Read + Send>> {
        let stream = attach::open(&self.addr, name, attach::Stream::Stdout)
            .map_err(runtime_err)?;
        Ok(Box::new(StreamDemuxer::new(stream)))
    }

    fn attach_stderr(&self, name: &str) -> sandbox::Result<Box<dyn Read + Send>> {
        let stream = attach::open(&self.addr, name, attach::Stream::Stderr)
            .map_err(runtime_err)?;
        Ok(Box::new(StreamDemuxer::new(stream)))
    }

    fn kill_container(&self, name: &str) -> sandbox::Result<()> {
        self.kill(name).map_err(runtime_err)
    }

    fn remove_container(&self, name: &str) -> sandbox::Result<()> {
        self.remove(name).map_err(runtime_err)
    }

    fn read_file(&self, name: &str, path: &str) -> sandbox::Result<Vec<u8>> {
        self.read_file_from(name, path).map_err(runtime_err)
    }

    fn write_archive(&self, name: &str, root: &str,
        entries: &[ArchiveEntry]) -> sandbox::Result<()> {
        self.write_archive_to(name, root, entries).map_err(runtime_err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn endpoints_normalize_to_host_and_port() {
        let client = DockerClient::new("tcp://127.0.0.1:2375").unwrap();
        assert_eq!("http://127.0.0.1:2375", client.base);
        assert_eq!("127.0.0.1:2375", client.addr);

        let client = DockerClient::new("http://daemon:2376/").unwrap();
        assert_eq!("daemon:2376", client.addr);

        assert!(DockerClient::new("tcp://").is_err());
        assert!(DockerClient::new("tcp://host/path").is_err());
    }

    #[test]
    fn archives_round_trip_arbitrary_bytes() {
        let payload: Vec<u8> = (0..=255u8).cycle().take(4096).collect();
        let entries = [
            ArchiveEntry::new("input", payload.clone()),
            ArchiveEntry::new("output", &b"18\n"[..]),
        ];
        let raw = build_archive(&entries).unwrap();

        let mut archive = tar::Archive::new(&raw[..]);
        let mut recovered = Vec::new();
        for entry in archive.entries().unwrap() {
            let mut entry = entry.unwrap();
            let name = entry.path().unwrap().to_string_lossy().into_owned();
            let mut data = Vec::new();
            entry.read_to_end(&mut data).unwrap();
            recovered.push((name, data));
        }

        assert_eq!(2, recovered.len());
        assert_eq!("input", recovered[0].0);
        assert_eq!(payload, recovered[0].1);
        assert_eq!("output", recovered[1].0);
        assert_eq!(b"18\n".to_vec(), recovered[1].1);
    }

    #[test]
    fn create_body_serializes_in_engine_api_shape() {
        let spec = ContainerSpec {
            name: "abc".to_owned(),
            image: "judge/gcc".to_owned(),
            argv: vec!["/bin/true".to_owned()],
            user: String::new(),
            binds: vec!["/tmp/pj/abc:/work:ro".to_owned()],
            cgroup_parent: "/abc".to_owned(),
            cpu_period_us: 100_000,
            cpu_quota_us: 100_000
        };
        let body = CreateBody {
            image: &spec.image,
            cmd: &spec.argv,
            user: &spec.user,
            tty: false,
            open_stdin: true,
            stdin_once: true,
            attach_stdin: true,
            attach_stdout: true,
            attach_stderr: true,
            host_config: HostConfig {
                binds: &spec.binds,
                network_mode: "none",
                cgroup_parent: &spec.cgroup_parent,
                cpu_period: spec.cpu_period_us,
                cpu_quota: spec.cpu_quota_us
            }
        };
        let encoded = serde_json::to_string(&body).unwrap();

        assert!(encoded.contains("\"Image\":\"judge/gcc\""));
        assert!(encoded.contains("\"OpenStdin\":true"));
        assert!(encoded.contains("\"StdinOnce\":true"));
        assert!(encoded.contains("\"NetworkMode\":\"none\""));
        assert!(encoded.contains("\"CgroupParent\":\"/abc\""));
        assert!(encoded.contains("\"CpuQuota\":100000"));
    }
}
