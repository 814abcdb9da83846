use std::path::PathBuf;

use anyhow::Result;
use chrono::{SecondsFormat, Utc};
use clap::{Parser, Subcommand};
use ops_core::alert::Severity;
use ops_core::cfg::{self, AppId};
use ops_core::logx::{self, LogFormat};
use ops_core::schedule::Schedule;
use tracing::debug;

const APP: AppId = AppId {
    qualifier: "com",
    organization: "local",
    // Shares the daemon's config dir.
    application: "opsd",
};

#[derive(Parser)]
#[command(name = env!("CARGO_PKG_NAME"), version, about = "Operator tool for opsd")]
struct Cli {
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
    #[command(subcommand)]
    cmd: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Print the severity a log line would get.
    Classify {
        #[arg(required = true)]
        line: Vec<String>,
    },
    /// Validate a schedule expression and list its next fire times.
    Schedule {
        expr: String,
        #[arg(short = 'n', long, default_value_t = 5)]
        count: usize,
    },
    /// Print the config file path and its contents.
    Config {
        #[arg(long)]
        path: Option<PathBuf>,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let level = match cli.verbose { 0 => "warn", 1 => "info", 2 => "debug", _ => "trace" };
    logx::init(level, LogFormat::Pretty);

    match cli.cmd {
        Command::Classify { line } => {
            let line = line.join(" ");
            let severity = Severity::classify(&line);
            debug!("classified {:?} as {}", line, severity);
            println!("{severity}");
        }
        Command::Schedule { expr, count } => {
            let schedule = Schedule::parse(&expr)?;
            for t in schedule.upcoming(Utc::now(), count) {
                println!("{}", t.to_rfc3339_opts(SecondsFormat::Secs, true));
            }
        }
        Command::Config { path } => {
            let (path, cfg) = match path {
                Some(p) => {
                    let cfg = cfg::load_from(&p)?;
                    (p, cfg)
                }
                None => (cfg::config_path(&APP)?, cfg::load_or_init(&APP)?),
            };
            println!("# {}", path.display());
            print!("{}", toml::to_string_pretty(&cfg)?);
        }
    }
    Ok(())
}
