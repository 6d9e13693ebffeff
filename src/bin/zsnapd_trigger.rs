//! `zsnapd-trigger`: write a dataset's `.trigger` file from outside the
//! daemon, for `zfs-autosnap`-style hooks (e.g. a `postcommand` in another
//! tool, or a cron job) that want to force an out-of-band tick. Accepts
//! either a mountpoint path or a dataset name, resolving the latter via
//! `zfs get mountpoint` the way `zcrab::zfs` resolves dataset properties.

use std::path::{Path, PathBuf};

use clap::Parser;

use zsnapd::endpoint::Endpoint;
use zsnapd::zfs;

#[derive(Parser, Debug)]
#[command(
    version,
    about = "Write a dataset's .trigger file to force its next scheduler tick.",
    long_about = "Usage
    zsnapd-trigger <mountpoint-or-dataset> [--probe-host HOST] [--probe-port PORT]
"
)]
struct Args {
    /// A mountpoint path, or a ZFS dataset name to resolve to one.
    target: String,

    /// Optionally probe this host's reachability before writing the trigger.
    #[arg(long = "probe-host")]
    probe_host: Option<String>,

    /// Port to probe, when `--probe-host` is given.
    #[arg(long = "probe-port", default_value_t = 22)]
    probe_port: u16,
}

fn main() {
    let args = Args::parse();

    let mountpoint = match resolve_mountpoint(&args.target) {
        Ok(path) => path,
        Err(e) => {
            eprintln!("{}: {e}", args.target);
            std::process::exit(1);
        }
    };

    if let Some(host) = &args.probe_host {
        let endpoint = Endpoint {
            host: Some(host.clone()),
            port: args.probe_port,
            command_template: String::new(),
        };
        if let Err(e) = endpoint.probe() {
            eprintln!("probe failed: {e}");
            std::process::exit(1);
        }
    }

    let trigger_path = mountpoint.join(".trigger");
    if let Err(e) = std::fs::write(&trigger_path, []) {
        eprintln!("failed to write {}: {e}", trigger_path.display());
        std::process::exit(1);
    }

    println!("wrote {}", trigger_path.display());
}

fn resolve_mountpoint(target: &str) -> Result<PathBuf, String> {
    let path = Path::new(target);
    if path.is_dir() {
        return Ok(path.to_path_buf());
    }
    let mountpoint = zfs::get_property(target, "mountpoint").map_err(|e| {
        format!("could not resolve `{target}` as a mountpoint or dataset: {e}")
    })?;
    if mountpoint == "none" || mountpoint == "-" {
        return Err(format!("dataset `{target}` has no mountpoint"));
    }
    Ok(PathBuf::from(mountpoint))
}
