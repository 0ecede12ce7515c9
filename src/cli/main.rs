//! CLI binary entry point for compendium

#[cfg(feature = "cli")]
use anyhow::{Context, bail};
#[cfg(feature = "cli")]
use clap::{Args, Parser, Subcommand};
#[cfg(feature = "cli")]
use compendium_etl::config::CONFIG_FILENAME;
#[cfg(feature = "cli")]
use compendium_etl::{
    FileSystemSource, Pipeline, PipelineConfig, RunReport, RunState, sample_config,
};
#[cfg(feature = "cli")]
use std::path::{Path, PathBuf};
#[cfg(feature = "cli")]
use tracing_subscriber::{EnvFilter, fmt};

#[cfg(feature = "cli")]
#[derive(Parser)]
#[command(name = "compendium")]
#[command(about = "Bronze/Silver ingestion pipeline for tabletop-game reference data")]
#[command(version)]
struct Cli {
    /// Configuration file
    #[arg(short, long, global = true, default_value = CONFIG_FILENAME, env = "COMPENDIUM_CONFIG")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[cfg(feature = "cli")]
#[derive(Args)]
struct OutputArgs {
    /// Print the run report as JSON
    #[arg(long)]
    json: bool,
}

#[cfg(feature = "cli")]
#[derive(Subcommand)]
enum Commands {
    /// Ingest the source tree into Bronze, then rebuild Silver
    Run {
        /// Source root directory (overrides the configuration)
        #[arg(short, long)]
        source: Option<PathBuf>,
        /// Rebuild Silver even if its Bronze inputs are unchanged
        #[arg(long)]
        force: bool,
        #[command(flatten)]
        output: OutputArgs,
    },
    /// Ingest the source tree into Bronze only
    Bronze {
        /// Source root directory (overrides the configuration)
        #[arg(short, long)]
        source: Option<PathBuf>,
        #[command(flatten)]
        output: OutputArgs,
    },
    /// Rebuild Silver from the current Bronze contents
    Silver {
        /// Rebuild even if Bronze inputs are unchanged
        #[arg(long)]
        force: bool,
        #[command(flatten)]
        output: OutputArgs,
    },
    /// Show Silver readiness and the last run
    Status {
        #[command(flatten)]
        output: OutputArgs,
    },
    /// Write a sample configuration file
    InitConfig {
        /// Overwrite an existing file
        #[arg(long)]
        overwrite: bool,
    },
}

#[cfg(feature = "cli")]
fn init_tracing() {
    let _ = fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .try_init();
}

#[cfg(feature = "cli")]
fn config_base(config_path: &Path) -> PathBuf {
    config_path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .map(Path::to_path_buf)
        .unwrap_or_else(|| PathBuf::from("."))
}

#[cfg(feature = "cli")]
fn open_pipeline(config_path: &Path, force: bool) -> anyhow::Result<(Pipeline, PathBuf)> {
    let mut config = PipelineConfig::load(config_path)
        .with_context(|| format!("loading {}", config_path.display()))?;
    if force {
        config.pipeline.force_silver = true;
    }
    let base = config_base(config_path);
    let pipeline = Pipeline::from_config(config, &base).context("opening stores")?;
    Ok((pipeline, base))
}

#[cfg(feature = "cli")]
fn source_for(pipeline: &Pipeline, base: &Path, root: Option<PathBuf>) -> FileSystemSource {
    let section = &pipeline.config().source;
    match root {
        // Command-line roots are relative to the working directory
        Some(root) => FileSystemSource::new(root, &section.pattern, section.layout),
        None => FileSystemSource::from_config(section, base),
    }
}

#[cfg(feature = "cli")]
fn print_report(report: &RunReport, json: bool) -> anyhow::Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(report)?);
        return Ok(());
    }

    println!("Run {} finished: {}", report.run_id, report.state);
    if let Some(failure) = &report.failure {
        println!("  Failure: {}", failure);
    }
    if !report.collections.is_empty() {
        println!();
        println!("Collections:");
        for (name, c) in &report.collections {
            println!(
                "  {:<32} {:?}: {} inserted, {} updated, {} skipped, {} unchanged files",
                name, c.status, c.inserted, c.updated, c.skipped, c.files_unchanged
            );
            for error in c.errors.iter().take(5) {
                println!("    - {}", error);
            }
            if c.errors.len() > 5 {
                println!("    ... and {} more", c.errors.len() - 5);
            }
        }
    }
    if !report.entities.is_empty() {
        println!();
        println!("Entity kinds:");
        for (kind, e) in &report.entities {
            println!(
                "  {:<32} {:?}: {} entities, {} deduplicated, {} skipped, {} conflicts{}",
                kind,
                e.status,
                e.produced,
                e.deduplicated,
                e.skipped,
                e.conflicts,
                if e.unchanged { " (unchanged)" } else { "" }
            );
        }
    }
    if report.integrity_count > 0 {
        println!();
        println!("Integrity notes: {}", report.integrity_count);
    }
    println!();
    println!("Silver ready: {}", report.silver_ready);
    Ok(())
}

#[cfg(feature = "cli")]
fn finish(report: RunReport, json: bool) -> anyhow::Result<()> {
    print_report(&report, json)?;
    if report.state == RunState::Failed {
        bail!(
            "run failed: {}",
            report.failure.as_deref().unwrap_or("unknown failure")
        );
    }
    Ok(())
}

#[cfg(feature = "cli")]
fn execute(cli: Cli) -> anyhow::Result<()> {
    match cli.command {
        Commands::Run {
            source,
            force,
            output,
        } => {
            let (pipeline, base) = open_pipeline(&cli.config, force)?;
            let source = source_for(&pipeline, &base, source);
            finish(pipeline.run(&source), output.json)
        }
        Commands::Bronze { source, output } => {
            let (pipeline, base) = open_pipeline(&cli.config, false)?;
            let source = source_for(&pipeline, &base, source);
            finish(pipeline.run_bronze(&source), output.json)
        }
        Commands::Silver { force, output } => {
            let (pipeline, _) = open_pipeline(&cli.config, force)?;
            finish(pipeline.run_silver(), output.json)
        }
        Commands::Status { output } => {
            let (pipeline, _) = open_pipeline(&cli.config, false)?;
            let readiness = pipeline.status()?;
            let last_run = pipeline.last_run()?;
            if output.json {
                let status = serde_json::json!({
                    "ready": readiness.ready,
                    "missing": readiness.missing,
                    "lastRun": last_run,
                });
                println!("{}", serde_json::to_string_pretty(&status)?);
                return Ok(());
            }

            println!("Silver ready: {}", readiness.ready);
            for missing in &readiness.missing {
                println!("  missing {}", missing);
            }
            match last_run {
                Some(report) => println!("Last run: {}", report.summary()),
                None => println!("Last run: none"),
            }
            Ok(())
        }
        Commands::InitConfig { overwrite } => {
            if cli.config.exists() && !overwrite {
                bail!(
                    "{} already exists (use --overwrite to replace it)",
                    cli.config.display()
                );
            }
            std::fs::write(&cli.config, sample_config())
                .with_context(|| format!("writing {}", cli.config.display()))?;
            println!("Wrote {}", cli.config.display());
            Ok(())
        }
    }
}

#[cfg(feature = "cli")]
fn main() {
    init_tracing();
    let cli = Cli::parse();

    if let Err(e) = execute(cli) {
        eprintln!("Error: {:#}", e);
        std::process::exit(1);
    }
}

#[cfg(not(feature = "cli"))]
fn main() {
    eprintln!("CLI feature is not enabled. Build with --features cli");
    std::process::exit(1);
}
