// ABOUTME: Command-line entry point for pgdump-importer
// ABOUTME: Tests proxy connectivity, previews import plans and runs imports with live progress

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use dialoguer::Confirm;
use indicatif::{ProgressBar, ProgressStyle};
use pgdump_importer::config::ImporterConfig;
use pgdump_importer::import::{build_plan, Checkpoint, ConflictMode, ExecutionOrder, SummaryStatus};
use pgdump_importer::{ImportController, ImportOptions, ImportStatus, ParsedDump, RemoteClient};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "pgdump-importer")]
#[command(about = "Import parsed pg_dump files into PostgreSQL through a remote SQL proxy", long_about = None)]
#[command(version)]
struct Cli {
    /// Enable debug logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Check that the proxy can reach the target database
    TestConnection {
        #[arg(long, env = "PGDUMP_IMPORT_CONFIG", help = "Config file path")]
        config: PathBuf,
    },
    /// Show the phases and batch counts an import would run, without executing anything
    Plan {
        #[arg(long, help = "Parsed dump JSON file")]
        dump: PathBuf,

        #[arg(long, default_value = "schema-first")]
        order: ExecutionOrder,

        #[arg(long, default_value_t = pgdump_importer::import::options::DEFAULT_BATCH_SIZE)]
        batch_size: usize,

        /// Preview with ownership-sensitive statements removed
        #[arg(long)]
        skip_ownership: bool,
    },
    /// Run an import
    Import {
        #[arg(long, env = "PGDUMP_IMPORT_CONFIG", help = "Config file path")]
        config: PathBuf,

        #[arg(long, help = "Parsed dump JSON file")]
        dump: PathBuf,

        /// Overrides `import.batch_size` from the config file
        #[arg(long)]
        batch_size: Option<usize>,

        /// Overrides `import.execution_order` from the config file
        #[arg(long)]
        order: Option<ExecutionOrder>,

        /// Keep going after failed statements instead of stopping at the first failure
        #[arg(long)]
        continue_on_error: bool,

        /// How inserts handle existing rows: error, skip or update
        #[arg(long)]
        on_conflict: Option<ConflictMode>,

        /// Leave out OWNER TO, GRANT/REVOKE, table comments and row level security toggles
        #[arg(long)]
        skip_ownership: bool,

        /// Run data batches with deferred constraints and triggers disabled
        #[arg(long)]
        defer_constraints: bool,

        /// Record progress to this file so an interrupted run can be resumed
        #[arg(long)]
        checkpoint: Option<PathBuf>,

        /// Resume from the checkpoint file instead of starting over
        #[arg(long, requires = "checkpoint")]
        resume: bool,

        /// Skip the confirmation prompt
        #[arg(short, long)]
        yes: bool,
    },
}

struct ImportArgs {
    config: PathBuf,
    dump: PathBuf,
    batch_size: Option<usize>,
    order: Option<ExecutionOrder>,
    continue_on_error: bool,
    on_conflict: Option<ConflictMode>,
    skip_ownership: bool,
    defer_constraints: bool,
    checkpoint: Option<PathBuf>,
    resume: bool,
    yes: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    let ok = match cli.command {
        Commands::TestConnection { config } => test_connection(&config).await?,
        Commands::Plan {
            dump,
            order,
            batch_size,
            skip_ownership,
        } => {
            print_plan(&dump, order, batch_size, skip_ownership).await?;
            true
        }
        Commands::Import {
            config,
            dump,
            batch_size,
            order,
            continue_on_error,
            on_conflict,
            skip_ownership,
            defer_constraints,
            checkpoint,
            resume,
            yes,
        } => {
            run_import(ImportArgs {
                config,
                dump,
                batch_size,
                order,
                continue_on_error,
                on_conflict,
                skip_ownership,
                defer_constraints,
                checkpoint,
                resume,
                yes,
            })
            .await?
        }
    };

    if !ok {
        std::process::exit(1);
    }
    Ok(())
}

fn init_tracing(verbose: bool) {
    let default_level = if verbose { "debug" } else { "info" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();
}

fn build_controller(config: &ImporterConfig) -> Result<Arc<ImportController>> {
    let client = RemoteClient::new(config.proxy.url.clone(), config.proxy.timeout())?
        .with_api_key(config.proxy.api_key.clone());
    Ok(Arc::new(ImportController::new(Arc::new(client))))
}

async fn test_connection(config_path: &Path) -> Result<bool> {
    let config = ImporterConfig::load(config_path)?;
    let controller = build_controller(&config)?;

    let result = controller.test_connection(&config.connection).await;
    println!("{}", serde_json::to_string_pretty(&result)?);
    if result.success {
        info!("Connection to {} OK", config.connection.display_target());
    } else {
        warn!(
            "Connection to {} failed: {}",
            config.connection.display_target(),
            result.message
        );
    }
    Ok(result.success)
}

async fn print_plan(
    dump_path: &Path,
    order: ExecutionOrder,
    batch_size: usize,
    skip_ownership: bool,
) -> Result<()> {
    let dump = ParsedDump::load(dump_path).await?;
    let options = ImportOptions {
        execution_order: order,
        batch_size,
        skip_ownership_statements: skip_ownership,
        ..Default::default()
    };
    options.validate()?;
    let plan = build_plan(&dump, &options);

    println!("Import plan ({}, batch size {}):", order, batch_size);
    println!("{:<14} {:>10} {:>8}", "Phase", "Statements", "Batches");
    for phase in &plan.phases {
        println!(
            "{:<14} {:>10} {:>8}",
            phase.phase.to_string(),
            phase.statements.len(),
            phase.batch_count(batch_size)
        );
    }
    println!(
        "{:<14} {:>10} {:>8}",
        "total",
        plan.total_statements(),
        plan.total_batches(batch_size)
    );

    if let Some(report) = &plan.reorder {
        println!(
            "Data reordering: {} foreign keys, {} applied, {} referencing tables without data",
            report.fk_edges,
            report.applied_edges,
            report.missing_table_edges.len()
        );
        if !report.unresolved_tables.is_empty() {
            println!(
                "Unresolved (cyclic) tables: {}",
                report.unresolved_tables.join(", ")
            );
        }
    }
    if !plan.ownership_statements.is_empty() {
        println!(
            "{} ownership-sensitive statement(s) will be skipped",
            plan.ownership_statements.len()
        );
    }
    if plan.skipped_copy_statements > 0 {
        println!(
            "{} COPY FROM STDIN block(s) will be skipped",
            plan.skipped_copy_statements
        );
    }
    Ok(())
}

async fn run_import(args: ImportArgs) -> Result<bool> {
    let config = ImporterConfig::load(&args.config)?;
    let dump = ParsedDump::load(&args.dump).await?;

    let mut options = config.import.clone();
    let resume_from = match (&args.checkpoint, args.resume) {
        (Some(path), true) => match Checkpoint::load(path).await? {
            Some(checkpoint) if checkpoint.matches(&dump.fingerprint()) => {
                checkpoint.layout.apply_to(&mut options);
                Some(checkpoint)
            }
            Some(_) => bail!(
                "Checkpoint {} was taken from a different dump",
                path.display()
            ),
            None => {
                warn!(
                    "No checkpoint found at {}, starting from the beginning",
                    path.display()
                );
                None
            }
        },
        _ => None,
    };

    if let Some(batch_size) = args.batch_size {
        options.batch_size = batch_size;
    }
    if let Some(order) = args.order {
        options.execution_order = order;
    }
    if let Some(mode) = args.on_conflict {
        options.on_conflict = mode;
    }
    if args.continue_on_error {
        options.stop_on_first_error = false;
    }
    if args.skip_ownership {
        options.skip_ownership_statements = true;
    }
    if args.defer_constraints {
        options.defer_constraints_during_data = true;
    }
    if args.checkpoint.is_some() {
        options.enable_checkpoint = true;
    }
    if let Some(checkpoint) = resume_from {
        checkpoint.check_layout(&options)?;
        info!(
            "Resuming run {} at {} batch {}",
            checkpoint.run_id,
            checkpoint.phase,
            checkpoint.batch + 1
        );
        options.resume_from = Some(checkpoint.resume_point());
    }
    options.validate()?;

    if !args.yes {
        let confirmed = Confirm::new()
            .with_prompt(format!(
                "Import {} statements into {}?",
                dump.total_statements(),
                config.connection.display_target()
            ))
            .default(false)
            .interact()
            .context("Failed to read confirmation")?;
        if !confirmed {
            info!("Import aborted");
            return Ok(true);
        }
    }

    let controller = build_controller(&config)?;

    let bar = ProgressBar::new(0);
    bar.set_style(
        ProgressStyle::with_template(
            "{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} batches {msg}",
        )?
        .progress_chars("#>-"),
    );

    let ticker = {
        let controller = Arc::clone(&controller);
        let bar = bar.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_millis(250));
            loop {
                interval.tick().await;
                if let Some(progress) = controller.progress() {
                    bar.set_length(progress.total_batches as u64);
                    bar.set_position(progress.current_batch as u64);
                    let phase = progress
                        .current_phase
                        .map(|p| p.to_string())
                        .unwrap_or_default();
                    bar.set_message(format!(
                        "{} | {} ok, {} failed, ~{}s left",
                        phase,
                        progress.statements_executed,
                        progress.statements_failed,
                        progress.estimated_remaining_ms / 1000
                    ));
                }
            }
        })
    };

    let interrupt = {
        let controller = Arc::clone(&controller);
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                warn!("Interrupt received, stopping after the current batch");
                if let Err(e) = controller.cancel_import() {
                    warn!("{}", e);
                }
            }
        })
    };

    let outcome = controller
        .start_import(&dump, &config.connection, &options)
        .await;
    ticker.abort();
    interrupt.abort();
    bar.finish_and_clear();
    let status = outcome?;

    if let Some(path) = &args.checkpoint {
        if status == ImportStatus::Completed {
            Checkpoint::clear(path).await?;
        } else if let Some(checkpoint) = controller.checkpoint() {
            checkpoint.save(path).await?;
            info!(
                "Checkpoint written to {}; re-run with --resume to continue",
                path.display()
            );
        }
    }

    match controller.summary() {
        Some(summary) => {
            println!("{}", serde_json::to_string_pretty(&summary)?);
            Ok(summary.status == SummaryStatus::Success)
        }
        None => {
            warn!("Import ended as {} without a summary", status);
            Ok(false)
        }
    }
}
