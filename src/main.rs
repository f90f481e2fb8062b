//! CLI entry point for labrun
//!
//! A console consumer of the experiment engine:
//! - List the bundled experiments and their parameters
//! - Run one, printing rows and operator log lines as they arrive
//! - Browse recorded runs and annotate them
//!
//! # Usage
//!
//! ```bash
//! labrun list
//! labrun run random-walk -p interval=0.1 -p seed=7 --duration 5
//! labrun run .1 -p mode=updown --debug
//! labrun history --limit 10
//! labrun comment ramp-20240307-140509 "sample B, 4 K"
//! ```
//!
//! While a run is active, type `q` + Enter (or press Ctrl-C) to stop it and `s` + Enter to set
//! the sync marker.

use anyhow::{bail, Result};
use clap::{Parser, Subcommand};
use labrun::config::Settings;
use labrun::engine::{ExperimentEngine, RunStatus, DERIVED_COLUMNS};
use labrun::experiment::{ExperimentType, Row};
use labrun::history::RunHistory;
use labrun::log_buffer::{LogSource, OPERATOR_TARGET};
use labrun::logging::{self, LoggingConfig};
use labrun::params::ParamKind;
use labrun::samples;
use serde_json::Value;
use std::io::BufRead;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;

const POLL_INTERVAL: Duration = Duration::from_millis(50);

#[derive(Parser)]
#[command(name = "labrun")]
#[command(about = "Run, record and safely interrupt measurement procedures", long_about = None)]
struct Cli {
    /// Settings file (default: nearest labrun.toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List available experiments
    List,

    /// Run an experiment until it ends or is stopped
    Run {
        /// Registry key (e.g. .0), type id or name
        experiment: String,

        /// Parameter override, repeatable
        #[arg(short = 'p', long = "param", value_name = "NAME=VALUE")]
        params: Vec<String>,

        /// Stream only, write no files
        #[arg(long)]
        debug: bool,

        /// Stop automatically after this many seconds
        #[arg(long)]
        duration: Option<f64>,
    },

    /// List recorded runs, newest first
    History {
        /// Maximum number of runs shown
        #[arg(long, default_value_t = 20)]
        limit: usize,
    },

    /// Set the comment of a recorded run
    Comment {
        /// Run id (file stem)
        id: String,
        /// Comment text
        text: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let settings = match &cli.config {
        Some(path) => Settings::load_from(path)?,
        None => Settings::load()?,
    };
    settings.validate()?;
    // Operator lines are printed from the log buffer below
    logging::init(LoggingConfig::from_settings(&settings)?.with_directive(format!("{OPERATOR_TARGET}=off")))?;
    let settings = Arc::new(settings);

    match cli.command {
        Commands::List => list_experiments(),
        Commands::Run {
            experiment,
            params,
            debug,
            duration,
        } => run_experiment(settings, &experiment, &params, debug, duration).await,
        Commands::History { limit } => show_history(&settings, limit),
        Commands::Comment { id, text } => {
            RunHistory::new(&settings.data.base_dir).update_comment(&id, &text)?;
            println!("Comment saved for {id}");
            Ok(())
        }
    }
}

fn list_experiments() -> Result<()> {
    for entry in samples::registry().iter() {
        let info = entry.experiment.info();
        let path = if entry.groups.is_empty() {
            String::new()
        } else {
            format!(" [{}]", entry.groups.join("/"))
        };
        println!("{:<8} {}{}  {}", entry.key, info.name, path, info.description);
        for spec in info.params.iter() {
            let default = spec
                .effective_default()
                .map_or_else(|| "required".to_string(), |v| format!("default {v}"));
            let units = spec.units.as_deref().map(|u| format!(" [{u}]")).unwrap_or_default();
            let choices = match &spec.kind {
                ParamKind::Select { choices, .. } => {
                    let all: Vec<String> = choices.iter().map(ToString::to_string).collect();
                    format!(" one of {}", all.join("|"))
                }
                _ => String::new(),
            };
            println!(
                "           -p {}=<{}>{units}{choices}, {default}",
                spec.name,
                spec.kind_name()
            );
        }
    }
    Ok(())
}

async fn run_experiment(
    settings: Arc<Settings>,
    query: &str,
    assignments: &[String],
    debug: bool,
    duration: Option<f64>,
) -> Result<()> {
    let registry = samples::registry();
    let experiment: ExperimentType = registry.find(query)?.experiment;
    let overrides = experiment
        .info()
        .params
        .parse_assignments(assignments.iter().map(String::as_str))?;

    let engine = ExperimentEngine::new(settings);
    engine.on_status_change(|status| eprintln!("[{status}]"));
    engine.start(&experiment, &overrides, debug)?;

    if let Some(run) = engine.current_run() {
        eprintln!("Run {} of {}", run.run_id, run.experiment_name);
        match &run.row_file {
            Some(path) => eprintln!("Recording to {}", path.display()),
            None => eprintln!("Debug mode: nothing is recorded"),
        }
    }
    eprintln!("Type q + Enter (or Ctrl-C) to stop, s + Enter to sync");

    let header: Vec<String> = DERIVED_COLUMNS
        .iter()
        .map(|c| c.to_string())
        .chain(experiment.info().columns.iter().cloned())
        .collect();
    println!("{}", header.join(","));

    let mut commands = spawn_stdin_reader();
    let mut ticker = tokio::time::interval(POLL_INTERVAL);
    let deadline = duration.map(|secs| Instant::now() + Duration::from_secs_f64(secs.max(0.0)));
    let logs = engine.log_buffer();
    let mut next_log = 0;

    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            _ = tokio::signal::ctrl_c() => engine.stop(),
            Some(line) = commands.recv() => match line.trim() {
                "q" => engine.stop(),
                "s" => engine.sync(),
                "" => {}
                other => eprintln!("Unknown command '{other}' (q = stop, s = sync)"),
            },
        }

        if deadline.is_some_and(|d| Instant::now() >= d) && engine.status() == RunStatus::Running {
            engine.stop();
        }

        // Read status before draining so rows produced up to the end are not missed
        let status = engine.status();
        for row in engine.drain_rows() {
            println!("{}", format_row(&header, &row));
        }
        for entry in logs.since(next_log) {
            next_log = entry.seq + 1;
            let tag = match entry.source {
                LogSource::System => "",
                LogSource::User => " (user)",
            };
            eprintln!("{entry}{tag}");
        }

        if status.is_terminal() {
            break;
        }
    }

    engine.shutdown();
    if engine.status() == RunStatus::Error {
        bail!(
            "Run failed: {}",
            engine.last_error().unwrap_or_else(|| "unknown error".to_string())
        );
    }
    Ok(())
}

fn show_history(settings: &Settings, limit: usize) -> Result<()> {
    let entries = RunHistory::new(&settings.data.base_dir).list()?;
    if entries.is_empty() {
        println!("No recorded runs under {}", settings.data.base_dir.display());
        return Ok(());
    }
    for entry in entries.into_iter().take(limit) {
        println!(
            "{}  {:<16} {}{}",
            entry.started_at().format("%Y-%m-%d %H:%M:%S"),
            entry.name(),
            entry.id,
            if entry.comment.is_empty() {
                String::new()
            } else {
                format!("  # {}", entry.comment)
            }
        );
    }
    Ok(())
}

/// Lines from stdin on a plain thread; blocking reads would otherwise hold up runtime shutdown.
fn spawn_stdin_reader() -> mpsc::UnboundedReceiver<String> {
    let (tx, rx) = mpsc::unbounded_channel();
    std::thread::spawn(move || {
        for line in std::io::stdin().lock().lines() {
            match line {
                Ok(line) => {
                    if tx.send(line).is_err() {
                        break;
                    }
                }
                Err(_) => break,
            }
        }
    });
    rx
}

fn format_row(header: &[String], row: &Row) -> String {
    header
        .iter()
        .map(|column| match row.get(column) {
            None | Some(Value::Null) => String::new(),
            Some(Value::String(s)) => s.clone(),
            Some(Value::Number(n)) => {
                if let Some(f) = n.as_f64().filter(|_| n.is_f64()) {
                    format!("{f:.6}")
                } else {
                    n.to_string()
                }
            }
            Some(other) => other.to_string(),
        })
        .collect::<Vec<_>>()
        .join(",")
}
