use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use icms_adapters::parse_workbook;
use icms_core::{ExecutionMode, ProcessingMethod, RunSummary};
use icms_report::{EmailReportNotifier, Mailer, NoopMailer, ReportConfig, SmtpMailer};
use icms_storage::{MemoryRecordStore, PgRecordStore, RecordStore};
use icms_sync::{
    maybe_build_scheduler, IngestionRun, LocalFileRun, Orchestrator, Pipeline, SyncConfig,
};
use tracing::{info, warn};

#[derive(Debug, Parser)]
#[command(name = "icms")]
#[command(about = "ICMS collection bulletin ingestion")]
struct Cli {
    /// Log filter used when RUST_LOG is unset
    #[arg(long, global = true, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Forced run: download, load and report once
    Run(RunArgs),
    /// Register the cron job and wait for Ctrl-C
    Schedule,
    /// Apply database migrations
    Migrate,
    /// Parse a local workbook and print the header mapping
    Parse { path: PathBuf },
}

#[derive(Debug, Default, Args)]
struct RunArgs {
    /// Load into an in-memory store and skip mail delivery
    #[arg(long)]
    dry_run: bool,

    /// Override PROCESSING_METHOD
    #[arg(long)]
    method: Option<ProcessingMethod>,

    /// Use a local workbook instead of downloading
    #[arg(long)]
    file: Option<PathBuf>,
}

fn setup_logging(default_level: &str) {
    use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new(format!(
            "icms={default_level},icms_sync={default_level},icms_adapters={default_level},\
             icms_storage={default_level},icms_report={default_level}"
        ))
    });

    tracing_subscriber::registry()
        .with(filter)
        .with(
            fmt::layer()
                .with_target(false)
                .with_level(true)
                .with_writer(std::io::stderr),
        )
        .init();
}

fn build_mailer(config: &ReportConfig, dry_run: bool) -> Result<Arc<dyn Mailer>> {
    if dry_run || config.mail.username.is_none() {
        return Ok(Arc::new(NoopMailer));
    }
    let mailer = SmtpMailer::new(&config.mail).context("configuring smtp transport")?;
    Ok(Arc::new(mailer))
}

fn print_summary(summary: &RunSummary) {
    println!(
        "run complete: run_id={} method={} period={}..{} candidates={} selected={} successes={} failures={} success_rate={}% run_dir={}",
        summary.run_id,
        summary.processing_method.label(),
        summary.period_start,
        summary.period_end,
        summary.total_records,
        summary.selected_records,
        summary.successes,
        summary.failures,
        summary.success_rate_percent(),
        summary.run_dir
    );
}

async fn run_forced(mut config: SyncConfig, args: RunArgs) -> Result<()> {
    if let Some(method) = args.method {
        config.processing_method = method;
    }
    let report_config = ReportConfig::from_env();
    let mailer = build_mailer(&report_config, args.dry_run)?;
    let notifier = Arc::new(EmailReportNotifier::new(report_config, mailer));

    let pg = if args.dry_run {
        None
    } else {
        Some(PgRecordStore::connect(&config.database_url).await.context("connecting to database")?)
    };
    let store: Arc<dyn RecordStore> = match &pg {
        Some(pg) => Arc::new(pg.clone()),
        None => Arc::new(MemoryRecordStore::new()),
    };

    let pipeline = Pipeline::new(config, store)?;
    let run: Arc<dyn IngestionRun> = match args.file {
        Some(path) => Arc::new(LocalFileRun::new(pipeline, path)),
        None => Arc::new(pipeline),
    };
    let orchestrator = Orchestrator::new(run, notifier);
    let result = orchestrator.trigger(ExecutionMode::Forced).await;

    if let Some(pg) = pg {
        pg.close().await;
    }
    if let Some(summary) = result? {
        print_summary(&summary);
    }
    Ok(())
}

async fn run_scheduler(config: SyncConfig) -> Result<()> {
    let pg = PgRecordStore::connect(&config.database_url)
        .await
        .context("connecting to database")?;
    let report_config = ReportConfig::from_env();
    let mailer = build_mailer(&report_config, false)?;
    let notifier = Arc::new(EmailReportNotifier::new(report_config, mailer));

    let pipeline = Pipeline::new(config.clone(), Arc::new(pg.clone()))?;
    let orchestrator = Arc::new(Orchestrator::new(Arc::new(pipeline), notifier));

    match maybe_build_scheduler(&config, orchestrator).await? {
        Some(mut scheduler) => {
            scheduler.start().await.context("starting scheduler")?;
            info!(cron = %config.schedule, "scheduler running; press Ctrl-C to stop");
            tokio::signal::ctrl_c().await.context("waiting for shutdown signal")?;
            info!("shutdown requested");
            scheduler.shutdown().await.context("stopping scheduler")?;
        }
        None => warn!("SCHEDULER_ENABLED is false; nothing to schedule"),
    }

    pg.close().await;
    Ok(())
}

fn parse_only(path: PathBuf, header_row_index: usize) -> Result<()> {
    let parsed = parse_workbook(&path, header_row_index)
        .with_context(|| format!("parsing {}", path.display()))?;
    println!(
        "sheet={} headers={} mapped={} unmapped={} coverage={:.1}% data_rows={} skipped={} records={}",
        parsed.sheet_name,
        parsed.mapping.total_headers,
        parsed.mapping.len(),
        parsed.mapping.unmapped.len(),
        parsed.mapping.coverage_percent(),
        parsed.data_rows,
        parsed.skipped_rows,
        parsed.records.len()
    );
    for unmapped in &parsed.mapping.unmapped {
        println!("unmapped column {}: {}", unmapped.index, unmapped.header);
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let _ = dotenvy::dotenv();
    let cli = Cli::parse();
    setup_logging(&cli.log_level);

    let config = SyncConfig::from_env();
    match cli.command.unwrap_or(Commands::Run(RunArgs::default())) {
        Commands::Run(args) => run_forced(config, args).await?,
        Commands::Schedule => run_scheduler(config).await?,
        Commands::Migrate => {
            let pg = PgRecordStore::connect(&config.database_url)
                .await
                .context("connecting to database")?;
            pg.migrate().await.context("applying migrations")?;
            pg.close().await;
            println!("migrations applied");
        }
        Commands::Parse { path } => parse_only(path, config.header_row_index)?,
    }

    Ok(())
}
