//! Dataset and process configuration: INI files parsed once at load time
//! into fully resolved, validated structs. Generalizes
//! `zcrab::zfs::parse_snapshots`'s manual-field-extraction style (match on
//! exactly the columns expected, error on anything else) from tabular `zfs`
//! output to whole INI sections, per the design note that config merging
//! should happen once at load rather than dynamically at access time.

use std::collections::HashSet;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration as StdDuration;

use chrono::NaiveTime;
use ini::{Ini, Properties};

use crate::endpoint::Endpoint;
use crate::error::ConfigError;
use crate::schema::Schema;

/// When a dataset fires: either at configured clock times, or whenever its
/// `.trigger` file is present.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TimeSpec {
    Clock(Vec<NaiveTime>),
    Trigger,
}

/// Which direction (if any) this dataset replicates in.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Replication {
    Push { target: String },
    Pull { source: String },
}

/// One dataset's fully resolved configuration: `DEFAULT`, its named
/// template (if any), and its own section, merged once.
#[derive(Debug, Clone)]
pub struct DatasetConfig {
    pub name: String,
    pub mountpoint: Option<PathBuf>,
    pub time: TimeSpec,
    pub snapshot: bool,
    pub schema: Schema,
    pub local_schema: Option<Schema>,
    pub replication: Option<Replication>,
    pub endpoint: Endpoint,
    pub compression: Option<String>,
    pub preexec: Option<String>,
    pub postexec: Option<String>,
    pub replicate_postexec: Option<String>,
    pub clean_all: bool,
    pub local_clean_all: bool,
    pub all_snapshots: bool,
    pub log_commands: bool,
}

const KNOWN_KEYS: &[&str] = &[
    "mountpoint",
    "time",
    "snapshot",
    "schema",
    "local_schema",
    "replicate_target",
    "replicate_source",
    "replicate_endpoint_host",
    "replicate_endpoint_port",
    "replicate_endpoint_command",
    "compression",
    "preexec",
    "postexec",
    "replicate_postexec",
    "clean_all",
    "local_clean_all",
    "all_snapshots",
    "log_commands",
    "template",
    "replicate_endpoint",
];

/// Looks up `key` in `section`, falling back to `template` then `default`.
fn resolve<'a>(
    section: &'a Properties,
    template: Option<&'a Properties>,
    default: &'a Properties,
    key: &str,
) -> Option<&'a str> {
    section
        .get(key)
        .or_else(|| template.and_then(|t| t.get(key)))
        .or_else(|| default.get(key))
}

fn parse_bool(value: Option<&str>, default: bool) -> bool {
    match value.map(str::trim) {
        Some("true") | Some("1") | Some("yes") => true,
        Some("false") | Some("0") | Some("no") => false,
        _ => default,
    }
}

fn parse_time_spec(value: &str, section: &str) -> Result<TimeSpec, ConfigError> {
    if value.trim() == "trigger" {
        return Ok(TimeSpec::Trigger);
    }
    let mut times = Vec::new();
    for part in value.split(',') {
        let part = part.trim();
        let parsed = NaiveTime::parse_from_str(part, "%H:%M").map_err(|_| ConfigError::Invalid {
            section: section.to_string(),
            reason: format!("`{part}` is not a valid HH:MM time"),
        })?;
        times.push(parsed);
    }
    if times.is_empty() {
        return Err(ConfigError::Invalid {
            section: section.to_string(),
            reason: "`time` must be `trigger` or a non-empty HH:MM list".to_string(),
        });
    }
    Ok(TimeSpec::Clock(times))
}

/// Build one dataset's resolved configuration from its section, its
/// optional named template's section, and the dataset file's `DEFAULT`.
fn build_dataset_config(
    name: &str,
    section: &Properties,
    templates: &Ini,
    default: &Properties,
) -> Result<DatasetConfig, ConfigError> {
    for key in section.iter().map(|(k, _)| k) {
        if !KNOWN_KEYS.contains(&key) {
            return Err(ConfigError::UnknownKey {
                section: name.to_string(),
                key: key.to_string(),
            });
        }
    }

    if section.get("replicate_endpoint").is_some() {
        return Err(ConfigError::Invalid {
            section: name.to_string(),
            reason: "`replicate_endpoint` is deprecated; use `replicate_endpoint_host` and `replicate_endpoint_port`".to_string(),
        });
    }

    let template = match resolve(section, None, default, "template") {
        Some(template_name) => Some(templates.section(Some(template_name)).ok_or_else(|| {
            ConfigError::UnknownTemplate {
                section: name.to_string(),
                template: template_name.to_string(),
            }
        })?),
        None => None,
    };

    let get = |key: &str| resolve(section, template, default, key);

    if get("replicate_target").is_some() && get("replicate_source").is_some() {
        return Err(ConfigError::MutuallyExclusiveReplication {
            section: name.to_string(),
        });
    }

    let mountpoint = get("mountpoint").map(PathBuf::from);
    let time = parse_time_spec(get("time").unwrap_or("trigger"), name)?;
    let snapshot = parse_bool(get("snapshot"), true);
    let schema = get("schema")
        .map(Schema::from_str)
        .transpose()?
        .unwrap_or_else(|| Schema::from_str("0k0h0d0w0m0y").expect("static schema parses"));
    let local_schema = get("local_schema").map(Schema::from_str).transpose()?;

    let replication = if let Some(target) = get("replicate_target") {
        Some(Replication::Push { target: target.to_string() })
    } else {
        get("replicate_source").map(|source| Replication::Pull { source: source.to_string() })
    };

    let host = get("replicate_endpoint_host")
        .filter(|h| !h.is_empty())
        .map(str::to_string);
    let port = get("replicate_endpoint_port")
        .map(|p| {
            p.parse::<u16>().map_err(|_| ConfigError::Invalid {
                section: name.to_string(),
                reason: format!("`replicate_endpoint_port` value `{p}` is not a valid port"),
            })
        })
        .transpose()?
        .unwrap_or(22);
    let command_template = get("replicate_endpoint_command")
        .unwrap_or("ssh -p {port} {host}")
        .to_string();
    let endpoint = Endpoint { host, port, command_template };

    Ok(DatasetConfig {
        name: name.to_string(),
        mountpoint,
        time,
        snapshot,
        schema,
        local_schema,
        replication,
        endpoint,
        compression: get("compression").map(str::to_string),
        preexec: get("preexec").map(str::to_string),
        postexec: get("postexec").map(str::to_string),
        replicate_postexec: get("replicate_postexec").map(str::to_string),
        clean_all: parse_bool(get("clean_all"), false),
        local_clean_all: parse_bool(get("local_clean_all"), false),
        all_snapshots: parse_bool(get("all_snapshots"), true),
        log_commands: parse_bool(get("log_commands"), false),
    })
}

static EMPTY_PROPERTIES_SOURCE: &str = "";

/// Parse and validate the dataset file (plus optional template file) into
/// one resolved configuration per section, in file order.
pub fn load_dataset_file(dataset_conf: &str, template_conf: Option<&str>) -> Result<Vec<DatasetConfig>, ConfigError> {
    let ini = Ini::load_from_str(dataset_conf).map_err(|e| ConfigError::Ini(e.to_string()))?;
    let templates = match template_conf {
        Some(text) => Ini::load_from_str(text).map_err(|e| ConfigError::Ini(e.to_string()))?,
        None => Ini::load_from_str(EMPTY_PROPERTIES_SOURCE).expect("empty ini parses"),
    };

    let empty = Properties::default();
    let default = ini.section(Some("DEFAULT")).unwrap_or(&empty);

    let mut seen = HashSet::new();
    let mut datasets = Vec::new();
    for (section_name, properties) in ini.iter() {
        let Some(name) = section_name else { continue };
        if name == "DEFAULT" {
            continue;
        }
        if !seen.insert(name.to_string()) {
            return Err(ConfigError::Invalid {
                section: name.to_string(),
                reason: "duplicate dataset section".to_string(),
            });
        }
        datasets.push(build_dataset_config(name, properties, &templates, default)?);
    }

    Ok(datasets)
}

/// The daemon-wide process settings from `process.conf`'s `[zsnapd]`
/// section.
#[derive(Debug, Clone)]
pub struct ProcessConfig {
    pub dataset_config_file: PathBuf,
    pub sleep_time: StdDuration,
    pub debug_sleep_time: StdDuration,
    pub run_as_user: Option<String>,
}

pub fn load_process_file(process_conf: &str) -> Result<ProcessConfig, ConfigError> {
    let ini = Ini::load_from_str(process_conf).map_err(|e| ConfigError::Ini(e.to_string()))?;
    let section = ini.section(Some("zsnapd")).ok_or_else(|| ConfigError::Invalid {
        section: "zsnapd".to_string(),
        reason: "process file is missing the `[zsnapd]` section".to_string(),
    })?;

    let sleep_time = section
        .get("sleep_time")
        .map(parse_duration_secs)
        .transpose()?
        .unwrap_or(StdDuration::from_secs(300));
    let debug_sleep_time = section
        .get("debug_sleep_time")
        .map(parse_duration_secs)
        .transpose()?
        .unwrap_or(StdDuration::from_secs(5));

    Ok(ProcessConfig {
        dataset_config_file: section
            .get("dataset_config_file")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("/etc/zsnapd/dataset.conf")),
        sleep_time,
        debug_sleep_time,
        run_as_user: section.get("run_as_user").map(str::to_string),
    })
}

fn parse_duration_secs(s: &str) -> Result<StdDuration, ConfigError> {
    humantime::parse_duration(s)
        .or_else(|_| s.trim().parse::<u64>().map(StdDuration::from_secs))
        .map_err(|_| ConfigError::Invalid {
            section: "zsnapd".to_string(),
            reason: format!("`{s}` is not a valid duration"),
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn merges_default_and_section() {
        let text = "\
[DEFAULT]
snapshot = true
schema = 1d

[pool/data]
time = 21:00
";
        let datasets = load_dataset_file(text, None).unwrap();
        assert_eq!(datasets.len(), 1);
        assert!(datasets[0].snapshot);
        assert_eq!(datasets[0].schema.to_string(), "1d");
    }

    #[test]
    fn template_fills_gaps_between_default_and_section() {
        let dataset_conf = "\
[DEFAULT]
schema = 1d

[pool/data]
template = nightly
time = 21:00
schema = 5d
";
        let template_conf = "\
[nightly]
snapshot = true
compression = zstd
";
        let datasets = load_dataset_file(dataset_conf, Some(template_conf)).unwrap();
        assert!(datasets[0].snapshot);
        assert_eq!(datasets[0].compression.as_deref(), Some("zstd"));
        assert_eq!(datasets[0].schema.to_string(), "5d");
    }

    #[test]
    fn unknown_key_is_an_error() {
        let text = "\
[pool/data]
bogus_key = 1
";
        assert!(load_dataset_file(text, None).is_err());
    }

    #[test]
    fn mutually_exclusive_replication_is_rejected() {
        let text = "\
[pool/data]
replicate_target = backup/data
replicate_source = origin/data
";
        assert!(load_dataset_file(text, None).is_err());
    }

    #[test]
    fn deprecated_replicate_endpoint_is_rejected() {
        let text = "\
[pool/data]
replicate_endpoint = somehost:22
";
        assert!(load_dataset_file(text, None).is_err());
    }

    #[test]
    fn trigger_time_spec_parses() {
        let text = "\
[pool/data]
time = trigger
";
        let datasets = load_dataset_file(text, None).unwrap();
        assert_eq!(datasets[0].time, TimeSpec::Trigger);
    }
}
