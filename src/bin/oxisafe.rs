// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

use oxisafe::{
    config::{SafeConfig, SafeDirectory},
    path::default_config_path,
    safe::RetentionSafe,
};

use anyhow::{Context, Result};
use chrono::{DateTime, Local};
use clap::{Parser, Subcommand};
use inquire::Confirm;
use std::{fs::read_to_string, path::PathBuf, process::exit};
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[derive(Debug, Clone, Parser)]
#[command(
    about,
    override_usage = "oxisafe [options] <oxisafe-command>",
    subcommand_help_heading = "Commands",
    version
)]
struct Cli {
    /// Path to configuration file.
    #[arg(short, long, global = true, value_name = "path")]
    pub config: Option<PathBuf>,

    /// Use this safe directory instead of the configured one.
    #[arg(short, long, global = true, value_name = "path")]
    pub directory: Option<PathBuf>,

    /// Pretend the current time is this many milliseconds since the epoch.
    #[arg(long, global = true, value_name = "millis")]
    pub now: Option<i64>,

    #[command(subcommand)]
    pub command: Command,
}

impl Cli {
    fn run(self) -> Result<()> {
        let safe = open_safe(self.config, self.directory)?;
        if let Some(now) = self.now {
            safe.set_time_now(now)?;
        }

        match self.command {
            Command::Store(opts) => run_store(&safe, opts),
            Command::Promote(opts) => run_promote(&safe, opts),
            Command::History(opts) => run_history(&safe, opts),
            Command::List => run_list(&safe),
            Command::Status(opts) => run_status(&safe, opts),
            Command::Schedule => run_schedule(&safe),
            Command::Clear(opts) => run_clear(&safe, opts),
        }
    }
}

#[derive(Debug, Clone, Subcommand)]
enum Command {
    /// Store new copy of source files.
    #[command(override_usage = "oxisafe store [options] <file>...")]
    Store(StoreOptions),

    /// Promote stored copies as time passes.
    #[command(override_usage = "oxisafe promote [options] [<file>]...")]
    Promote(PromoteOptions),

    /// List stored copies of source file from youngest to oldest.
    #[command(override_usage = "oxisafe history [options] <file>")]
    History(HistoryOptions),

    /// List tracked source files.
    #[command(override_usage = "oxisafe list [options]")]
    List,

    /// Show slot occupancy of source file.
    #[command(override_usage = "oxisafe status [options] <file>")]
    Status(StatusOptions),

    /// Show retention ladder of safe.
    #[command(override_usage = "oxisafe schedule [options]")]
    Schedule,

    /// Stop tracking source files, deleting their stored copies.
    #[command(override_usage = "oxisafe clear [options] [<file>]...")]
    Clear(ClearOptions),
}

#[derive(Parser, Clone, Debug)]
#[command(author, about, long_about)]
struct StoreOptions {
    /// Source files to store.
    #[arg(required = true, value_name = "file")]
    pub files: Vec<PathBuf>,
}

#[derive(Parser, Clone, Debug)]
#[command(author, about, long_about)]
struct PromoteOptions {
    /// Source files to promote. Promote every tracked file if none given.
    #[arg(value_name = "file")]
    pub files: Vec<PathBuf>,
}

#[derive(Parser, Clone, Debug)]
#[command(author, about, long_about)]
struct HistoryOptions {
    /// Tracked source file.
    #[arg(required = true, value_name = "file")]
    pub file: PathBuf,
}

#[derive(Parser, Clone, Debug)]
#[command(author, about, long_about)]
struct StatusOptions {
    /// Tracked source file.
    #[arg(required = true, value_name = "file")]
    pub file: PathBuf,
}

#[derive(Parser, Clone, Debug)]
#[command(author, about, long_about)]
struct ClearOptions {
    /// Source files to stop tracking.
    #[arg(group = "target", value_name = "file")]
    pub files: Vec<PathBuf>,

    /// Stop tracking every source file.
    #[arg(group = "target", short, long)]
    pub all: bool,

    /// Do not ask for confirmation.
    #[arg(short, long)]
    pub yes: bool,
}

fn main() {
    let layer = fmt::layer()
        .compact()
        .with_target(false)
        .with_timer(false)
        .without_time();
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new("info"))
        .unwrap();
    tracing_subscriber::registry()
        .with(layer)
        .with(filter)
        .init();

    if let Err(error) = run() {
        error!("{error:?}");
        exit(1);
    }

    exit(0)
}

fn run() -> Result<()> {
    Cli::parse().run()
}

fn open_safe(config: Option<PathBuf>, directory: Option<PathBuf>) -> Result<RetentionSafe> {
    let config_path = match config {
        Some(path) => path,
        None => default_config_path()?,
    };

    let mut config = if config_path.is_file() {
        let data = read_to_string(&config_path)
            .with_context(|| format!("failed to read {:?}", config_path.display()))?;
        data.parse::<SafeConfig>()
            .with_context(|| format!("invalid configuration {:?}", config_path.display()))?
    } else {
        SafeConfig::default()
    };

    if let Some(directory) = directory {
        config.directory = SafeDirectory::new(directory);
    }

    Ok(RetentionSafe::from_config(&config)?)
}

fn run_store(safe: &RetentionSafe, opts: StoreOptions) -> Result<()> {
    for file in opts.files {
        let copy = safe.store(&file)?;
        info!("{} -> {}", file.display(), copy.display());
    }

    Ok(())
}

fn run_promote(safe: &RetentionSafe, opts: PromoteOptions) -> Result<()> {
    if opts.files.is_empty() {
        if !safe.promote()? {
            info!("nothing to promote");
        }
        return Ok(());
    }

    for file in opts.files {
        if !safe.promote_file(&file)? {
            info!("nothing to promote for {}", file.display());
        }
    }

    Ok(())
}

fn run_history(safe: &RetentionSafe, opts: HistoryOptions) -> Result<()> {
    if !safe.contains(&opts.file) {
        warn!("{} is not tracked", opts.file.display());
        return Ok(());
    }

    for copy in safe.history(&opts.file) {
        println!("{}", copy.display());
    }

    Ok(())
}

fn run_list(safe: &RetentionSafe) -> Result<()> {
    let mut files = safe.files().into_iter().collect::<Vec<_>>();
    files.sort();
    for file in files {
        println!("{}", file.display());
    }

    Ok(())
}

fn run_status(safe: &RetentionSafe, opts: StatusOptions) -> Result<()> {
    let Some(slots) = safe.slots(&opts.file) else {
        warn!("{} is not tracked", opts.file.display());
        return Ok(());
    };

    for slot in slots {
        println!(
            "{:<6} {:>6}d  {}",
            slot.label,
            slot.max_age,
            format_time(slot.time)
        );
    }

    Ok(())
}

fn run_schedule(safe: &RetentionSafe) -> Result<()> {
    println!("{}", safe.schedule());
    for slot in safe.schedule().iter() {
        println!("{:<6} {:>6}d", slot.label, slot.max_age);
    }

    Ok(())
}

fn run_clear(safe: &RetentionSafe, opts: ClearOptions) -> Result<()> {
    if opts.all || opts.files.is_empty() {
        let prompt = format!(
            "clear all {} tracked files from {}?",
            safe.files().len(),
            safe.directory().display()
        );
        if !opts.yes && !Confirm::new(&prompt).with_default(false).prompt()? {
            info!("nothing cleared");
            return Ok(());
        }

        return Ok(safe.clear()?);
    }

    for file in opts.files {
        safe.clear_file(&file)?;
    }

    Ok(())
}

fn format_time(time: i64) -> String {
    if time == 0 {
        return "-".into();
    }

    DateTime::from_timestamp_millis(time)
        .map(|utc| {
            utc.with_timezone(&Local)
                .format("%Y-%m-%d %H:%M:%S")
                .to_string()
        })
        .unwrap_or_else(|| time.to_string())
}
