//! The remote endpoint: expands an SSH command template, probes TCP
//! reachability before committing to any remote operation, and composes the
//! `send | [compress] | ssh … receive` transfer pipeline.
//!
//! The byte-stream pipeline stays synchronous `subprocess::Exec`, following
//! `DanielArmengod-zfs-rs::replicate::replicate_dataset`'s `sendside |
//! destside` join. One-off remote commands that aren't part of a streamed
//! transfer (creating the destination's ancestor datasets before a first
//! full send) go over an `openssh::Session` instead, the way
//! `zcrab::ssh::Connection` drives a small multi-thread tokio runtime per
//! call. The TCP probe itself is plain `std::net` — none of the five
//! example repos needed a bounded-timeout reachability check, so this one
//! corner uses the smallest stdlib primitive rather than standing in for a
//! crate the corpus would otherwise reach for.

use std::io::Read;
use std::net::{TcpStream, ToSocketAddrs};
use std::time::Duration;

use eyre::{eyre, Result, WrapErr};
use subprocess::{Exec, Popen, Redirection};

use crate::error::{EndpointUnreachable, PipelineFailure, ToolFailure};
use crate::zfs;

/// Bounded wait for the initial TCP probe. Kept short so a down replication
/// target never blocks a tick for long, per the scheduler's "never hangs"
/// design goal.
pub const PROBE_TIMEOUT: Duration = Duration::from_secs(5);

/// A configured replication peer: either "local" (no host) or a remote host
/// reached over an SSH command template.
#[derive(Debug, Clone)]
pub struct Endpoint {
    pub host: Option<String>,
    pub port: u16,
    pub command_template: String,
}

impl Endpoint {
    pub fn local() -> Self {
        Endpoint {
            host: None,
            port: 0,
            command_template: String::new(),
        }
    }

    pub fn is_local(&self) -> bool {
        self.host.is_none()
    }

    /// Expand `{host}`/`{port}` in the configured SSH command template.
    pub fn expand_command(&self) -> String {
        self.command_template
            .replace("{host}", self.host.as_deref().unwrap_or(""))
            .replace("{port}", &self.port.to_string())
    }

    /// TCP-connect to `(host, port)` with [`PROBE_TIMEOUT`]. Always succeeds
    /// for a local endpoint. Failure here means the replication step for
    /// this tick is skipped, not failed.
    pub fn probe(&self) -> std::result::Result<(), EndpointUnreachable> {
        let Some(host) = self.host.as_deref() else {
            return Ok(());
        };
        let unreachable = |source: std::io::Error| EndpointUnreachable {
            host: host.to_string(),
            port: self.port,
            source,
        };
        let addr = (host, self.port)
            .to_socket_addrs()
            .map_err(unreachable)?
            .next()
            .ok_or_else(|| {
                unreachable(std::io::Error::new(
                    std::io::ErrorKind::NotFound,
                    "host resolved to no addresses",
                ))
            })?;
        TcpStream::connect_timeout(&addr, PROBE_TIMEOUT).map_err(unreachable)?;
        Ok(())
    }

    /// Wrap a shell command so it runs on this endpoint: as-is when local,
    /// or via the expanded SSH command template when remote. Matches
    /// `DanielArmengod-zfs-rs::machine::Machine`'s `ssh {host} -- '{cmd}'`
    /// composition.
    fn wrap(&self, cmd: &str) -> Exec {
        if self.is_local() {
            Exec::shell(cmd)
        } else {
            Exec::shell(format!("{} -- '{}'", self.expand_command(), cmd))
        }
    }

    /// Build the push pipeline: `zfs send [| compress -c] | ssh … '[compress
    /// -d |] zfs receive -F target'`.
    pub fn push_pipeline(
        &self,
        source_dataset: &str,
        from_name: Option<&str>,
        to_name: &str,
        target_dataset: &str,
        compression: Option<&str>,
    ) -> Pipeline {
        let mut stages = vec![Stage {
            label: "zfs send".to_string(),
            exec: zfs::send(source_dataset, from_name, to_name),
        }];

        if let Some(tool) = compression {
            stages.push(Stage {
                label: format!("{tool} -c"),
                exec: Exec::cmd(tool).arg("-c").stderr(Redirection::Pipe),
            });
        }

        let mut remote_cmd = format!("zfs receive -F {target_dataset}");
        if let Some(tool) = compression {
            remote_cmd = format!("{tool} -d | {remote_cmd}");
        }
        stages.push(Stage {
            label: "zfs receive".to_string(),
            exec: self.wrap(&remote_cmd),
        });

        Pipeline::new(stages)
    }

    /// Build the pull pipeline: `ssh … 'zfs send [| compress -c]' | [compress
    /// -d |] zfs receive -F local`.
    pub fn pull_pipeline(
        &self,
        source_dataset: &str,
        from_name: Option<&str>,
        to_name: &str,
        local_dataset: &str,
        compression: Option<&str>,
    ) -> Pipeline {
        let mut remote_cmd = match from_name {
            Some(from) => format!("zfs send -i {source_dataset}@{from} {source_dataset}@{to_name}"),
            None => format!("zfs send {source_dataset}@{to_name}"),
        };
        if let Some(tool) = compression {
            remote_cmd = format!("{remote_cmd} | {tool} -c");
        }

        let mut stages = vec![Stage {
            label: "zfs send".to_string(),
            exec: self.wrap(&remote_cmd),
        }];

        if let Some(tool) = compression {
            stages.push(Stage {
                label: format!("{tool} -d"),
                exec: Exec::cmd(tool).arg("-d").stderr(Redirection::Pipe),
            });
        }

        stages.push(Stage {
            label: "zfs receive".to_string(),
            exec: zfs::receive(local_dataset),
        });

        Pipeline::new(stages)
    }

    /// List `dataset`'s snapshots on this endpoint, local or remote,
    /// tolerating a not-yet-created destination dataset as "no snapshots"
    /// the way `DanielArmengod-zfs-rs::machine::Machine::get_snaps` treats
    /// `MachineError::NoDataset` as distinct from a real failure.
    pub fn list_snapshots(&self, dataset: &str) -> Result<Vec<zfs::Snapshot>> {
        let cmd = format!("zfs list -H -o name,creation -t snapshot -d 1 {dataset}");
        let capture = self
            .wrap(&cmd)
            .stdout(Redirection::Pipe)
            .stderr(Redirection::Pipe)
            .capture()
            .wrap_err_with(|| format!("failed to list snapshots of {dataset}"))?;
        if !capture.exit_status.success() {
            if capture.stderr_str().contains("dataset does not exist") {
                return Ok(Vec::new());
            }
            return Err(eyre!(
                "zfs list -t snapshot {dataset} failed: {}",
                capture.stderr_str()
            ));
        }
        let lines: Vec<Vec<String>> = capture
            .stdout_str()
            .lines()
            .filter(|line| !line.is_empty())
            .map(|line| line.split('\t').map(str::trim).map(str::to_string).collect())
            .collect();
        let mut snapshots = zfs::parse_snapshot_lines(&lines)?;
        snapshots.sort_by_key(|s| s.created);
        Ok(snapshots)
    }

    /// Destroy `dataset@name` on this endpoint, local or remote.
    pub fn destroy_snapshot(&self, dataset: &str, name: &str) -> Result<()> {
        let cmd = format!("zfs destroy {dataset}@{name}");
        let capture = self
            .wrap(&cmd)
            .stderr(Redirection::Pipe)
            .capture()
            .wrap_err_with(|| format!("failed to destroy {dataset}@{name}"))?;
        if capture.exit_status.success() {
            Ok(())
        } else {
            Err(ToolFailure {
                command: cmd,
                status: format!("{:?}", capture.exit_status),
                stderr: capture.stderr_str(),
            }
            .into())
        }
    }

    /// Ensure `dataset`'s parent datasets exist on this endpoint, ahead of
    /// the first full send to a destination that doesn't exist yet. Mirrors
    /// `DanielArmengod-zfs-rs::machine::Machine::create_ancestors`, but over
    /// an `openssh::Session` for the remote case rather than a shelled-out
    /// `ssh` prefix, since this is a one-shot command, not a byte pipeline.
    #[cfg(feature = "ssh")]
    pub fn create_ancestors(&self, dataset: &str) -> Result<()> {
        let Some(parent) = dataset.rsplit_once('/').map(|(p, _)| p.to_string()) else {
            return Ok(());
        };
        let Some(host) = self.host.clone() else {
            return zfs_create_ancestors_local(&parent);
        };

        let rt = tokio::runtime::Builder::new_multi_thread()
            .enable_io()
            .build()
            .wrap_err("failed to start tokio runtime for remote ancestor creation")?;
        rt.block_on(async move {
            let session = openssh::Session::connect(&host, openssh::KnownHosts::Strict)
                .await
                .wrap_err_with(|| format!("could not open ssh session to {host}"))?;
            let output = session
                .command("zfs")
                .arg("create")
                .arg("-p")
                .arg(&parent)
                .output()
                .await
                .wrap_err_with(|| format!("failed to run `zfs create -p {parent}` on {host}"))?;
            if !output.status.success() {
                return Err(eyre!(
                    "zfs create -p {parent} on {host} exited with {:?}: {}",
                    output.status,
                    String::from_utf8_lossy(&output.stderr)
                ));
            }
            Ok(())
        })
    }
}

#[cfg(feature = "ssh")]
fn zfs_create_ancestors_local(parent: &str) -> Result<()> {
    let capture = Exec::cmd("zfs")
        .arg("create")
        .arg("-p")
        .arg(parent)
        .stderr(Redirection::Pipe)
        .capture()
        .wrap_err_with(|| format!("failed to spawn `zfs create -p {parent}`"))?;
    if capture.exit_status.success() {
        Ok(())
    } else {
        Err(eyre!(
            "zfs create -p {parent} exited with {:?}: {}",
            capture.exit_status,
            capture.stderr_str()
        ))
    }
}

/// One stage of a transfer pipeline.
pub struct Stage {
    pub label: String,
    pub exec: Exec,
}

/// A chain of OS processes wired stdout→stdin, the structured replacement
/// for shell piping the design calls for: every stage is spawned, all are
/// waited on, and the first nonzero exit is reported with that stage's full
/// stderr.
pub struct Pipeline {
    stages: Vec<Stage>,
}

impl Pipeline {
    pub fn new(stages: Vec<Stage>) -> Self {
        Pipeline { stages }
    }

    pub fn run(self) -> Result<()> {
        let n = self.stages.len();
        let mut running: Vec<(String, Popen)> = Vec::with_capacity(n);
        let mut prev_stdout: Option<std::fs::File> = None;

        for (i, stage) in self.stages.into_iter().enumerate() {
            let mut exec = stage.exec.stderr(Redirection::Pipe);
            if let Some(file) = prev_stdout.take() {
                exec = exec.stdin(Redirection::File(file));
            }
            if i + 1 != n {
                exec = exec.stdout(Redirection::Pipe);
            }
            let mut popen = exec
                .popen()
                .wrap_err_with(|| format!("failed to spawn pipeline stage `{}`", stage.label))?;
            if i + 1 != n {
                prev_stdout = popen.stdout.take();
            }
            running.push((stage.label, popen));
        }

        let mut first_failure = None;
        for (label, mut popen) in running {
            let status = popen
                .wait()
                .wrap_err_with(|| format!("failed waiting on pipeline stage `{label}`"))?;
            let mut stderr = String::new();
            if let Some(mut f) = popen.stderr.take() {
                let _ = f.read_to_string(&mut stderr);
            }
            if !status.success() && first_failure.is_none() {
                first_failure = Some(PipelineFailure {
                    stage: label,
                    status: format!("{status:?}"),
                    stderr,
                });
            }
        }

        match first_failure {
            Some(failure) => Err(failure.into()),
            None => Ok(()),
        }
    }
}
