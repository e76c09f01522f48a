use crate::host::Host;
use crate::sim;
use anyhow::{bail, Result};
use clap::Parser;
use keywarp_parser::cfg;
use simplelog::{ColorChoice, CombinedLogger, ConfigBuilder, LevelFilter, TermLogger, TerminalMode};
use std::path::{Path, PathBuf};
use std::time::SystemTime;

#[derive(Parser, Debug)]
#[command(author, version, verbatim_doc_comment)]
/// keywarp: a context-aware key remapper
///
/// Rules translate input key sequences into output sequences, scoped by
/// the focused window. Events are read from a simulation script (or
/// stdin) as `press:Key` / `release:Key` / `tap:Key` steps plus `focus`
/// lines; the synthesized output is printed per line.
struct Args {
    /// Configuration file. If not specified, defaults to keywarp.conf
    /// in the current working directory and
    /// '$XDG_CONFIG_HOME/keywarp/keywarp.conf'.
    #[arg(short, long, verbatim_doc_comment)]
    config: Option<PathBuf>,

    /// Reload the configuration file when it changes.
    #[arg(short, long)]
    update: bool,

    /// Enable verbose output.
    #[arg(short, long)]
    verbose: bool,

    /// No color on error output.
    #[arg(long)]
    no_color: bool,

    /// Check the config for errors and exit.
    #[arg(long)]
    check: bool,

    /// Simulation script to evaluate; stdin when not given.
    #[arg(short, long)]
    sim: Option<PathBuf>,

    /// Execute $(…) terminal-command actions instead of only logging
    /// them.
    #[arg(long, verbatim_doc_comment)]
    run_actions: bool,
}

fn default_config() -> PathBuf {
    let local = PathBuf::from("keywarp.conf");
    if local.is_file() {
        return local;
    }
    dirs::config_dir()
        .map(|dir| dir.join("keywarp").join("keywarp.conf"))
        .unwrap_or(local)
}

fn init_logger(args: &Args) {
    let level = if args.verbose {
        LevelFilter::Debug
    } else {
        LevelFilter::Info
    };
    let color = if args.no_color {
        ColorChoice::Never
    } else {
        ColorChoice::Auto
    };
    let mut config = ConfigBuilder::new();
    let _ = config.set_time_offset_to_local();
    config.set_time_format_rfc3339();
    CombinedLogger::init(vec![TermLogger::new(
        level,
        config.build(),
        TerminalMode::Stderr,
        color,
    )])
    .expect("logger can init");
}

fn load_config(path: &Path) -> Result<cfg::Config> {
    cfg::parse_config_file(path).map_err(|e| anyhow::anyhow!("{:?}", cfg::error_with_source(e)))
}

/// Polls the configuration file's modification time and reparses it
/// when it changed; a failed reload keeps the previous configuration.
struct ConfigWatcher {
    path: PathBuf,
    modified: Option<SystemTime>,
}

impl ConfigWatcher {
    fn new(path: PathBuf) -> Self {
        let modified = mtime(&path);
        Self { path, modified }
    }

    fn poll(&mut self) -> Option<cfg::Config> {
        let modified = mtime(&self.path);
        if modified == self.modified {
            return None;
        }
        self.modified = modified;
        match load_config(&self.path) {
            Ok(config) => Some(config),
            Err(error) => {
                log::error!("reloading configuration failed: {error}");
                None
            }
        }
    }
}

fn mtime(path: &Path) -> Option<SystemTime> {
    std::fs::metadata(path).and_then(|m| m.modified()).ok()
}

fn main_impl() -> Result<()> {
    let args = Args::parse();
    init_logger(&args);
    log::info!("keywarp v{} starting", env!("CARGO_PKG_VERSION"));

    let config_path = args.config.clone().unwrap_or_else(default_config);
    if !config_path.exists() {
        bail!(
            "could not find the config file ({})\nFor more info, pass the `-h` or `--help` flags.",
            config_path.display()
        );
    }

    if args.check {
        log::info!("validating config only and exiting");
        let config = load_config(&config_path)?;
        log::info!(
            "configuration ok: {} context(s), {} action(s)",
            config.contexts.len(),
            config.actions.len()
        );
        return Ok(());
    }

    let config = load_config(&config_path)?;
    let mut host = Host::new(config, args.run_actions);

    let mut watcher = args.update.then(|| ConfigWatcher::new(config_path));
    let mut reload = move || watcher.as_mut().and_then(ConfigWatcher::poll);

    match &args.sim {
        Some(path) => {
            log::info!("evaluating simulation file {}", path.display());
            let file = std::fs::File::open(path)?;
            sim::run(&mut host, std::io::BufReader::new(file), &mut reload)
        }
        None => {
            log::info!("reading events from stdin");
            let stdin = std::io::stdin();
            sim::run(&mut host, stdin.lock(), &mut reload)
        }
    }
}

pub fn run() -> Result<()> {
    let result = main_impl();
    if let Err(ref error) = result {
        log::error!("{error}");
    }
    result
}
