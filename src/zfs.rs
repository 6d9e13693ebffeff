//! The ZFS adapter: issues `zfs list`/`snapshot`/`destroy`/`send`/`receive`/
//! `get` and parses their tabular output. Generalizes `zcrab::zfs`'s
//! `call_read`/`call_do` wrappers around `subprocess::Exec` to the full
//! surface named for this adapter, and borrows
//! `DanielArmengod-zfs-rs::machine::Machine`'s habit of returning a bare
//! `subprocess::Exec` builder for `send`/`receive` so callers can compose
//! pipelines instead of the adapter running them itself.

use chrono::{DateTime, TimeZone, Utc};
use eyre::{eyre, Result, WrapErr};
use subprocess::{Exec, Redirection};

use crate::error::ToolFailure;
use crate::time::is_managed_name;

/// One line of `zfs list -t snapshot`, our dataset-and-creation-instant view
/// of a snapshot. `managed` is derived from the name, not stored by ZFS.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Snapshot {
    pub dataset: String,
    pub name: String,
    pub created: DateTime<Utc>,
    pub managed: bool,
}

impl Snapshot {
    pub fn full_name(&self) -> String {
        format!("{}@{}", self.dataset, self.name)
    }
}

/// List every snapshot of `dataset`, oldest first.
pub fn list_snapshots(dataset: &str) -> Result<Vec<Snapshot>> {
    let lines = call_read("list", &["-t", "snapshot", "-o", "name,creation", "-d", "1", dataset])?;
    let mut snapshots = parse_snapshot_lines(&lines)?;
    snapshots.sort_by_key(|s| s.created);
    Ok(snapshots)
}

pub(crate) fn parse_snapshot_lines(lines: &[Vec<String>]) -> Result<Vec<Snapshot>> {
    let mut out = Vec::with_capacity(lines.len());
    for line in lines {
        match line.as_slice() {
            [full_name, creation] => {
                let (dataset, name) = full_name
                    .split_once('@')
                    .ok_or_else(|| eyre!("zfs list returned a non-snapshot name: {full_name}"))?;
                let created = parse_epoch_seconds(creation)?;
                out.push(Snapshot {
                    dataset: dataset.to_string(),
                    name: name.to_string(),
                    created,
                    managed: is_managed_name(name),
                });
            }
            other => return Err(eyre!("zfs list: unexpected column count in {other:?}")),
        }
    }
    Ok(out)
}

fn parse_epoch_seconds(s: &str) -> Result<DateTime<Utc>> {
    let secs: i64 = s
        .trim()
        .parse()
        .wrap_err_with(|| format!("zfs list: creation column `{s}` is not a Unix timestamp"))?;
    Utc.timestamp_opt(secs, 0)
        .single()
        .ok_or_else(|| eyre!("zfs list: creation timestamp {secs} out of range"))
}

/// Take `dataset@name`. A "dataset already exists" failure for exactly this
/// name is treated as success by the caller (clock-granularity collision),
/// not here, since only the caller knows whether the name it asked for is
/// the one that already exists.
pub fn create_snapshot(dataset: &str, name: &str) -> Result<()> {
    call_do("snapshot", &[&format!("{dataset}@{name}")])
}

pub fn destroy_snapshot(dataset: &str, name: &str) -> Result<()> {
    call_do("destroy", &[&format!("{dataset}@{name}")])
}

pub fn get_property(dataset: &str, property: &str) -> Result<String> {
    let lines = call_read("get", &["-o", "value", property, dataset])?;
    let line = lines
        .first()
        .ok_or_else(|| eyre!("zfs get {property} {dataset}: no output"))?;
    line.first()
        .cloned()
        .ok_or_else(|| eyre!("zfs get {property} {dataset}: empty row"))
}

/// Build (but do not run) a `zfs send` of a full stream up to and including
/// `to_name`, or an incremental stream from `from_name` to `to_name` when
/// given. Callers compose this into a pipeline (`endpoint::Pipeline`) rather
/// than running it directly.
pub fn send(dataset: &str, from_name: Option<&str>, to_name: &str) -> Exec {
    let mut args = vec!["send".to_string()];
    if let Some(from) = from_name {
        args.push("-i".to_string());
        args.push(format!("{dataset}@{from}"));
    }
    args.push(format!("{dataset}@{to_name}"));
    Exec::cmd("zfs")
        .args(&args)
        .stdout(Redirection::Pipe)
        .stderr(Redirection::Pipe)
}

/// Build (but do not run) a `zfs receive` into `dataset`, forcing a
/// rollback of conflicting state as the push/pull sequence requires.
pub fn receive(dataset: &str) -> Exec {
    Exec::cmd("zfs")
        .arg("receive")
        .arg("-F")
        .arg(dataset)
        .stdin(Redirection::Pipe)
        .stderr(Redirection::Pipe)
}

fn call_read(action: &str, args: &[&str]) -> Result<Vec<Vec<String>>> {
    let capture = Exec::cmd("zfs")
        .arg(action)
        .arg("-H")
        .args(args)
        .stdout(Redirection::Pipe)
        .stderr(Redirection::Pipe)
        .capture()
        .wrap_err_with(|| format!("failed to spawn `zfs {action}`"))?;

    if !capture.exit_status.success() {
        return Err(ToolFailure {
            command: format!("zfs {action} {}", args.join(" ")),
            status: format!("{:?}", capture.exit_status),
            stderr: capture.stderr_str(),
        }
        .into());
    }

    Ok(capture
        .stdout_str()
        .lines()
        .filter(|line| !line.is_empty())
        .map(|line| line.split('\t').map(str::trim).map(str::to_string).collect())
        .collect())
}

fn call_do(action: &str, args: &[&str]) -> Result<()> {
    let capture = Exec::cmd("zfs")
        .arg(action)
        .args(args)
        .stdout(Redirection::Pipe)
        .stderr(Redirection::Pipe)
        .capture()
        .wrap_err_with(|| format!("failed to spawn `zfs {action}`"))?;

    if capture.exit_status.success() {
        Ok(())
    } else {
        Err(ToolFailure {
            command: format!("zfs {action} {}", args.join(" ")),
            status: format!("{:?}", capture.exit_status),
            stderr: capture.stderr_str(),
        }
        .into())
    }
}
