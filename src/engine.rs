//! The per-dataset execution engine: `PRE → SNAP → REPL → POST → CLEAN`.
//! New relative to `zcrab` (which only snapshots and ages, with no
//! hooks/replication sequencing), grounded on
//! `DanielArmengod-zfs-rs::replicate::replicate_dataset` for the
//! full-vs-incremental push/pull decision and on `zcrab::main::daemon`'s
//! loop shape for how one tick is driven. No state survives a call to
//! [`run`] across ticks: the next tick re-derives everything from the live
//! snapshot lists, per this scheme's explicit "no intermediate state
//! persisted" rule.

use chrono::{DateTime, Utc};
use eyre::{Result, WrapErr};
use itertools::Itertools;
use subprocess::Redirection;

use crate::config::{DatasetConfig, Replication, TimeSpec};
use crate::error::HookFailure;
use crate::logging;
use crate::retention::{self, Candidate};
use crate::time::format_snapshot_name;
use crate::zfs;

/// What happened to the replication step of one tick.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReplicationOutcome {
    NotConfigured,
    UpToDate,
    Succeeded { sent: Vec<String> },
    SkippedUnreachable,
}

/// A full record of one tick's effects, for logging and the aux binaries.
#[derive(Debug, Clone)]
pub struct Outcome {
    pub dataset: String,
    pub snapshot_taken: Option<String>,
    pub replication: ReplicationOutcome,
    pub destroyed_local: Vec<String>,
    pub destroyed_remote: Vec<String>,
}

/// Run one dataset's due sequence. Returns `Ok(None)` for a trigger dataset
/// whose `.trigger` file was absent (a no-op, not an error).
pub fn run(config: &DatasetConfig, now: DateTime<Utc>) -> Result<Option<Outcome>> {
    if matches!(config.time, TimeSpec::Trigger) && !consume_trigger(config) {
        return Ok(None);
    }

    if let Some(cmd) = &config.preexec {
        run_hook("preexec", cmd, config.log_commands)?;
    }

    let snapshot_taken = take_snapshot(config, now)?;

    let local = zfs::list_snapshots(&config.name)
        .wrap_err_with(|| format!("failed to list snapshots of {}", config.name))?;

    let replication = replicate(config, &local)?;

    if let Some(cmd) = &config.postexec {
        run_hook("postexec", cmd, config.log_commands)?;
    }

    let replication_ran = matches!(
        replication,
        ReplicationOutcome::UpToDate | ReplicationOutcome::Succeeded { .. }
    );
    if replication_ran {
        if let Some(cmd) = &config.replicate_postexec {
            run_hook("replicate_postexec", cmd, config.log_commands)?;
        }
    }

    let (destroyed_local, destroyed_remote) = clean(config, now, &local)?;

    Ok(Some(Outcome {
        dataset: config.name.clone(),
        snapshot_taken,
        replication,
        destroyed_local,
        destroyed_remote,
    }))
}

/// Consume the dataset's `.trigger` file if present. Returns whether the
/// sequence should proceed. An unreadable or missing mountpoint is a no-op,
/// not an error; removal failure is logged but does not block the sequence.
fn consume_trigger(config: &DatasetConfig) -> bool {
    let Some(mountpoint) = &config.mountpoint else {
        return false;
    };
    let trigger_path = mountpoint.join(".trigger");
    if !trigger_path.is_file() {
        return false;
    }
    if let Err(e) = std::fs::remove_file(&trigger_path) {
        log::warn!("failed to remove trigger file {}: {e}", trigger_path.display());
    }
    true
}

fn run_hook(label: &str, cmd: &str, log_commands: bool) -> Result<()> {
    logging::log_command(log_commands, &format!("running {label}: {cmd}"));
    let capture = subprocess::Exec::shell(cmd)
        .stdout(Redirection::Pipe)
        .stderr(Redirection::Pipe)
        .capture()
        .wrap_err_with(|| format!("failed to spawn {label} hook"))?;
    if capture.exit_status.success() {
        Ok(())
    } else {
        Err(HookFailure {
            hook: label.to_string(),
            status: format!("{:?}", capture.exit_status),
            stderr: capture.stderr_str(),
        }
        .into())
    }
}

/// Take `<dataset>@<now-as-YYYYMMDDHHMM>`. A "dataset already exists"
/// failure for exactly this name is a clock-granularity collision, treated
/// as success.
fn take_snapshot(config: &DatasetConfig, now: DateTime<Utc>) -> Result<Option<String>> {
    if !config.snapshot {
        return Ok(None);
    }
    let name = format_snapshot_name(now);
    logging::log_command(config.log_commands, &format!("zfs snapshot {}@{name}", config.name));
    match zfs::create_snapshot(&config.name, &name) {
        Ok(()) => Ok(Some(name)),
        Err(e) if e.to_string().contains("dataset already exists") => Ok(Some(name)),
        Err(e) => Err(e),
    }
}

fn streamable<'a>(snapshots: &'a [zfs::Snapshot], all_snapshots: bool) -> Vec<&'a zfs::Snapshot> {
    snapshots
        .iter()
        .filter(|s| all_snapshots || s.managed)
        .collect()
}

/// The ordered `(from, to)` send steps needed to bring a peer from `common`
/// (or from nothing) up to the newest streamable snapshot: a full send
/// followed by a chain of incrementals when there is no common base, or a
/// single incremental from the common base to the newest otherwise.
fn transfer_steps(names: &[&zfs::Snapshot], common: Option<&str>) -> Vec<(Option<String>, String)> {
    if names.is_empty() {
        return Vec::new();
    }
    match common {
        None => {
            let mut steps = vec![(None, names[0].name.clone())];
            steps.extend(
                names
                    .iter()
                    .tuple_windows()
                    .map(|(from, to)| (Some(from.name.clone()), to.name.clone())),
            );
            steps
        }
        Some(base) => {
            let newest = &names.last().expect("checked non-empty").name;
            if newest == base {
                Vec::new()
            } else {
                vec![(Some(base.to_string()), newest.clone())]
            }
        }
    }
}

fn most_recent_common(local: &[&zfs::Snapshot], peer_names: &std::collections::HashSet<&str>) -> Option<String> {
    local
        .iter()
        .rev()
        .find(|s| peer_names.contains(s.name.as_str()))
        .map(|s| s.name.clone())
}

fn replicate(config: &DatasetConfig, local: &[zfs::Snapshot]) -> Result<ReplicationOutcome> {
    let Some(replication) = &config.replication else {
        return Ok(ReplicationOutcome::NotConfigured);
    };

    if let Err(unreachable) = config.endpoint.probe() {
        log::warn!("replication skipped for {}: {unreachable}", config.name);
        return Ok(ReplicationOutcome::SkippedUnreachable);
    }

    match replication {
        Replication::Push { target } => push(config, local, target),
        Replication::Pull { source } => pull(config, local, source),
    }
}

fn push(config: &DatasetConfig, local: &[zfs::Snapshot], target: &str) -> Result<ReplicationOutcome> {
    let local_names = streamable(local, config.all_snapshots);
    let remote = config
        .endpoint
        .list_snapshots(target)
        .wrap_err_with(|| format!("failed to list snapshots of push target {target}"))?;
    let remote_name_set: std::collections::HashSet<&str> = remote.iter().map(|s| s.name.as_str()).collect();
    let common = most_recent_common(&local_names, &remote_name_set);

    let steps = transfer_steps(&local_names, common.as_deref());
    if steps.is_empty() {
        return Ok(ReplicationOutcome::UpToDate);
    }

    if common.is_none() {
        #[cfg(feature = "ssh")]
        config
            .endpoint
            .create_ancestors(target)
            .wrap_err_with(|| format!("failed to create ancestors of push target {target}"))?;
    }

    let mut sent = Vec::with_capacity(steps.len());
    for (from, to) in steps {
        logging::log_command(
            config.log_commands,
            &format!(
                "push {}@{to} ({}) to {target}",
                config.name,
                from.as_deref().map_or("full".to_string(), |f| format!("incremental from {f}"))
            ),
        );
        config
            .endpoint
            .push_pipeline(&config.name, from.as_deref(), &to, target, config.compression.as_deref())
            .run()
            .wrap_err_with(|| format!("push of {}@{to} to {target} failed", config.name))?;
        sent.push(to);
    }
    Ok(ReplicationOutcome::Succeeded { sent })
}

fn pull(config: &DatasetConfig, local: &[zfs::Snapshot], source: &str) -> Result<ReplicationOutcome> {
    let remote = config
        .endpoint
        .list_snapshots(source)
        .wrap_err_with(|| format!("failed to list snapshots of pull source {source}"))?;
    let remote_names = streamable(&remote, config.all_snapshots);
    let local_name_set: std::collections::HashSet<&str> = local.iter().map(|s| s.name.as_str()).collect();
    let common = most_recent_common(&remote_names, &local_name_set);

    let steps = transfer_steps(&remote_names, common.as_deref());
    if steps.is_empty() {
        return Ok(ReplicationOutcome::UpToDate);
    }

    let mut sent = Vec::with_capacity(steps.len());
    for (from, to) in steps {
        logging::log_command(
            config.log_commands,
            &format!(
                "pull {source}@{to} ({}) into {}",
                from.as_deref().map_or("full".to_string(), |f| format!("incremental from {f}")),
                config.name
            ),
        );
        config
            .endpoint
            .pull_pipeline(source, from.as_deref(), &to, &config.name, config.compression.as_deref())
            .run()
            .wrap_err_with(|| format!("pull of {source}@{to} into {} failed", config.name))?;
        sent.push(to);
    }
    Ok(ReplicationOutcome::Succeeded { sent })
}

/// Which schema/`clean_all` pair ages the local dataset this tick: the
/// local side is the receiving side exactly when this dataset pulls from a
/// remote source, in which case `local_schema` (when set) is used instead
/// of `schema`, per spec §4.5 step 5. A push or a non-replicating dataset
/// never has its local side be the receiving side, so `schema`/`clean_all`
/// apply there unconditionally.
fn local_clean_policy(config: &DatasetConfig) -> (&crate::schema::Schema, bool) {
    match (&config.replication, &config.local_schema) {
        (Some(Replication::Pull { .. }), Some(local_schema)) => (local_schema, config.local_clean_all),
        _ => (&config.schema, config.clean_all),
    }
}

fn clean(
    config: &DatasetConfig,
    now: DateTime<Utc>,
    local: &[zfs::Snapshot],
) -> Result<(Vec<String>, Vec<String>)> {
    let (local_schema_in_use, local_clean_all_in_use) = local_clean_policy(config);

    let destroyed_local = clean_side(
        local_schema_in_use,
        local,
        now,
        local_clean_all_in_use,
        config.log_commands,
        |s| zfs::destroy_snapshot(&s.dataset, &s.name),
    )?;

    let mut destroyed_remote = Vec::new();
    if let (Some(Replication::Push { target }), Some(local_schema)) = (&config.replication, &config.local_schema) {
        let remote = config
            .endpoint
            .list_snapshots(target)
            .wrap_err_with(|| format!("failed to list snapshots of push target {target} for cleaning"))?;
        destroyed_remote = clean_side(
            local_schema,
            &remote,
            now,
            config.local_clean_all,
            config.log_commands,
            |s| config.endpoint.destroy_snapshot(&s.dataset, &s.name),
        )?;
    }

    Ok((destroyed_local, destroyed_remote))
}

fn clean_side(
    schema: &crate::schema::Schema,
    snapshots: &[zfs::Snapshot],
    now: DateTime<Utc>,
    clean_all: bool,
    log_commands: bool,
    mut destroy: impl FnMut(&zfs::Snapshot) -> Result<()>,
) -> Result<Vec<String>> {
    let candidates: Vec<Candidate> = snapshots
        .iter()
        .map(|s| Candidate { created: s.created, managed: s.managed })
        .collect();
    let verdict = retention::plan(schema, &candidates, now, clean_all);

    let mut doomed: Vec<&zfs::Snapshot> = verdict.destroy.iter().map(|&i| &snapshots[i]).collect();
    doomed.sort_by_key(|s| s.created);

    let mut destroyed = Vec::with_capacity(doomed.len());
    for snapshot in doomed {
        logging::log_command(log_commands, &format!("zfs destroy {}", snapshot.full_name()));
        destroy(snapshot)?;
        destroyed.push(snapshot.name.clone());
    }
    Ok(destroyed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TimeSpec;
    use crate::endpoint::Endpoint;
    use chrono::TimeZone;
    use std::str::FromStr;

    fn snap(dataset: &str, name: &str, created: DateTime<Utc>, managed: bool) -> zfs::Snapshot {
        zfs::Snapshot {
            dataset: dataset.to_string(),
            name: name.to_string(),
            created,
            managed,
        }
    }

    fn dataset_config(replication: Option<Replication>, local_schema: Option<&str>) -> DatasetConfig {
        DatasetConfig {
            name: "tank/data".to_string(),
            mountpoint: None,
            time: TimeSpec::Trigger,
            snapshot: true,
            schema: crate::schema::Schema::from_str("3d").unwrap(),
            local_schema: local_schema.map(|s| crate::schema::Schema::from_str(s).unwrap()),
            replication,
            endpoint: Endpoint::local(),
            compression: None,
            preexec: None,
            postexec: None,
            replicate_postexec: None,
            clean_all: false,
            local_clean_all: true,
            all_snapshots: true,
            log_commands: false,
        }
    }

    #[test]
    fn pull_with_local_schema_ages_local_side_with_it() {
        let config = dataset_config(Some(Replication::Pull { source: "origin/data".to_string() }), Some("5d"));
        let (schema, clean_all) = local_clean_policy(&config);
        assert_eq!(schema.to_string(), "5d");
        assert_eq!(clean_all, config.local_clean_all);
    }

    #[test]
    fn pull_without_local_schema_ages_local_side_with_schema() {
        let config = dataset_config(Some(Replication::Pull { source: "origin/data".to_string() }), None);
        let (schema, clean_all) = local_clean_policy(&config);
        assert_eq!(schema.to_string(), "3d");
        assert_eq!(clean_all, config.clean_all);
    }

    #[test]
    fn push_ages_local_side_with_schema_not_local_schema() {
        let config = dataset_config(Some(Replication::Push { target: "backup/data".to_string() }), Some("5d"));
        let (schema, clean_all) = local_clean_policy(&config);
        assert_eq!(schema.to_string(), "3d");
        assert_eq!(clean_all, config.clean_all);
    }

    #[test]
    fn non_replicating_ages_local_side_with_schema() {
        let config = dataset_config(None, Some("5d"));
        let (schema, clean_all) = local_clean_policy(&config);
        assert_eq!(schema.to_string(), "3d");
        assert_eq!(clean_all, config.clean_all);
    }

    #[test]
    fn transfer_steps_full_send_chains_incrementals() {
        let now = Utc.with_ymd_and_hms(2024, 1, 4, 21, 0, 0).unwrap();
        let snaps = vec![
            snap("a", "202401012100", now, true),
            snap("a", "202401022100", now, true),
            snap("a", "202401032100", now, true),
        ];
        let refs: Vec<&zfs::Snapshot> = snaps.iter().collect();
        let steps = transfer_steps(&refs, None);
        assert_eq!(
            steps,
            vec![
                (None, "202401012100".to_string()),
                (Some("202401012100".to_string()), "202401022100".to_string()),
                (Some("202401022100".to_string()), "202401032100".to_string()),
            ]
        );
    }

    #[test]
    fn transfer_steps_common_base_sends_single_incremental() {
        let now = Utc.with_ymd_and_hms(2024, 1, 2, 0, 0, 0).unwrap();
        let snaps = vec![
            snap("a", "202401010000", now, true),
            snap("a", "202401020000", now, true),
        ];
        let refs: Vec<&zfs::Snapshot> = snaps.iter().collect();
        let steps = transfer_steps(&refs, Some("202401010000"));
        assert_eq!(steps, vec![(Some("202401010000".to_string()), "202401020000".to_string())]);
    }

    #[test]
    fn transfer_steps_already_up_to_date_is_empty() {
        let now = Utc.with_ymd_and_hms(2024, 1, 2, 0, 0, 0).unwrap();
        let snaps = vec![snap("a", "202401020000", now, true)];
        let refs: Vec<&zfs::Snapshot> = snaps.iter().collect();
        let steps = transfer_steps(&refs, Some("202401020000"));
        assert!(steps.is_empty());
    }

    #[test]
    fn most_recent_common_picks_newest_shared_name() {
        let now = Utc.with_ymd_and_hms(2024, 1, 3, 0, 0, 0).unwrap();
        let snaps = vec![
            snap("a", "202401010000", now, true),
            snap("a", "202401020000", now, true),
            snap("a", "202401030000", now, true),
        ];
        let refs: Vec<&zfs::Snapshot> = snaps.iter().collect();
        let peer: std::collections::HashSet<&str> = ["202401010000", "202401020000"].into_iter().collect();
        assert_eq!(most_recent_common(&refs, &peer), Some("202401020000".to_string()));
    }
}
