use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::warn;

use fanout::config::DispatchConfig;
use fanout::dispatcher::Dispatcher;
use fanout::plan::Plan;
use fanout::trace::{self, DispatchTrace};

/// fanout: run a plan of independent commands under a concurrency cap.
#[derive(Parser, Debug)]
#[command(name = "fanout")]
#[command(about = "Bounded-concurrency work dispatcher", long_about = None)]
struct Cli {
    /// Enable debug logging
    #[arg(long, global = true)]
    debug: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run every item of a plan and report one verdict
    Run {
        /// Path to the plan YAML file
        path: PathBuf,

        #[command(flatten)]
        overrides: Overrides,

        /// Log failures as warnings and exit 0
        #[arg(long)]
        warn_only: bool,

        /// Print the dispatch trace after the run
        #[arg(long)]
        trace: bool,

        /// Print the dispatch report as JSON
        #[arg(long)]
        json: bool,
    },

    /// Print the plan and its effective concurrency limit without running it
    Plan {
        /// Path to the plan YAML file
        path: PathBuf,

        #[command(flatten)]
        overrides: Overrides,
    },
}

#[derive(clap::Args, Debug)]
struct Overrides {
    /// Maximum number of items running at once
    #[arg(long)]
    concurrency: Option<usize>,

    /// Items per processing unit (wins over --concurrency)
    #[arg(long)]
    per_unit: Option<usize>,

    /// Longest wait before re-checking for a free slot
    #[arg(long)]
    poll_interval_ms: Option<u64>,
}

fn print_error_chain(err: &anyhow::Error) {
    eprintln!("Error: {err}");

    let mut n = 0;
    let mut cur = err.source();
    while let Some(cause) = cur {
        eprintln!("  {n}: {cause}");
        n += 1;
        cur = cause.source();
    }
}

fn main() {
    let cli = Cli::parse();

    let filter = if cli.debug { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .without_time()
        .with_writer(std::io::stderr)
        .init();

    if let Err(err) = real_main(cli.command) {
        print_error_chain(&err);
        std::process::exit(1);
    }
}

fn real_main(command: Command) -> Result<()> {
    match command {
        Command::Run {
            path,
            overrides,
            warn_only,
            trace: do_trace,
            json,
        } => {
            let (plan, cfg) = load_plan(&path, &overrides)?;
            let source = path.display().to_string();

            let tr = Arc::new(DispatchTrace::new(source.clone()));
            let report = Dispatcher::new(&cfg)
                .with_trace(Arc::clone(&tr))
                .dispatch(plan.work_items(&source));

            if json {
                let text = serde_json::to_string_pretty(&report)
                    .context("failed to serialize dispatch report")?;
                println!("{text}");
            } else {
                println!(
                    "RUN SUMMARY: {} item(s) limit={} failed={}",
                    report.items,
                    report.effective_limit,
                    report.outcome.failure_count()
                );
            }

            if do_trace {
                trace::print_trace(&tr);
            }

            match report.into_result() {
                Ok(()) => Ok(()),
                Err(err) if warn_only => {
                    warn!(location = err.location().map_or("unknown", |l| l.as_str()), "{err}");
                    Ok(())
                }
                Err(err) => Err(err).with_context(|| format!("plan '{source}' failed")),
            }
        }
        Command::Plan { path, overrides } => {
            let (plan, cfg) = load_plan(&path, &overrides)?;
            let limit = Dispatcher::new(&cfg).effective_limit(plan.items.len());

            println!("Plan:  {}", path.display());
            println!("Items: {}", plan.items.len());
            println!("Limit: {limit}");
            for (idx, item) in plan.items.iter().enumerate() {
                println!("  {idx}. {}  command={}", item.name, item.command.join(" "));
            }
            Ok(())
        }
    }
}

/// Plan file, then `FANOUT_*` environment, then command-line flags.
fn load_plan(path: &Path, overrides: &Overrides) -> Result<(Plan, DispatchConfig)> {
    let plan = Plan::load_from_file(path)
        .with_context(|| format!("failed to load plan: {}", path.display()))?;

    let mut cfg = plan.dispatch.clone();
    cfg.apply_env_overrides()
        .context("failed to apply environment overrides")?;

    if let Some(c) = overrides.concurrency {
        cfg.concurrency_limit = Some(c);
    }
    if let Some(m) = overrides.per_unit {
        cfg.per_unit_multiplier = Some(m);
    }
    if let Some(ms) = overrides.poll_interval_ms {
        cfg.poll_interval_ms = ms;
    }
    cfg.validate().context("invalid dispatch settings")?;

    Ok((plan, cfg))
}
