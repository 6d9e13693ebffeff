//! `zsnapd-cfgtest`: parse and validate a dataset file (and optional
//! template file) without touching ZFS, printing each dataset's merged
//! configuration at DEBUG. A thin `clap::Parser` front end over
//! [`zsnapd::config::load_dataset_file`], in the same single-purpose-binary
//! style as `zsnapd`'s own CLI.

use std::path::PathBuf;

use clap::Parser;

use zsnapd::config;
use zsnapd::logging::{self, DebugLevel, Sink};

#[derive(Parser, Debug)]
#[command(
    version,
    about = "Validate a zsnapd dataset configuration file.",
    long_about = "Usage
    zsnapd-cfgtest -f dataset.conf [-t template.conf] [-v]
"
)]
struct Args {
    /// Dataset config file to validate.
    #[arg(short = 'f', long = "file", default_value = "/etc/zsnapd/dataset.conf")]
    file: PathBuf,

    /// Optional template file referenced by datasets' `template` key.
    #[arg(short = 't', long = "templates")]
    templates: Option<PathBuf>,

    /// Print each dataset's merged configuration.
    #[arg(short = 'v', long = "verbose")]
    verbose: bool,
}

fn main() {
    let args = Args::parse();
    let level = if args.verbose { DebugLevel::Verbose } else { DebugLevel::Normal };
    let _ = logging::init(Sink::Foreground, level, args.verbose);

    let dataset_conf = match std::fs::read_to_string(&args.file) {
        Ok(text) => text,
        Err(e) => {
            eprintln!("failed to read {}: {e}", args.file.display());
            std::process::exit(1);
        }
    };
    let template_conf = match &args.templates {
        Some(path) => match std::fs::read_to_string(path) {
            Ok(text) => Some(text),
            Err(e) => {
                eprintln!("failed to read {}: {e}", path.display());
                std::process::exit(1);
            }
        },
        None => None,
    };

    match config::load_dataset_file(&dataset_conf, template_conf.as_deref()) {
        Ok(datasets) => {
            for dataset in &datasets {
                log::debug!("{dataset:#?}");
            }
            println!("{}: {} dataset(s) valid", args.file.display(), datasets.len());
            std::process::exit(0);
        }
        Err(e) => {
            println!("{}: invalid: {e}", args.file.display());
            std::process::exit(1);
        }
    }
}
