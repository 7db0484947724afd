//! PIM EmbeddingBag host - Command Line Interface
//!
//! ## Commands
//!
//! - `init-config` - Write the default run configuration
//! - `mapping` - Show how the configured workload is placed on PEs
//! - `run` - Load synthetic tables and stream lookups through the pipeline

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use pim_embedding::{
    check_inference, init_logging, init_simple_logging, synthetic_tables, EmbeddingHost,
    EmbeddingTable, FleetError, InputBatch, RankMapping, ResultBuffer, RunConfig, SyntheticSource,
};
use std::path::{Path, PathBuf};
use tracing::{info, warn};

/// Host orchestration of EmbeddingBag lookups on a PIM fleet
#[derive(Parser, Debug)]
#[command(name = "pim-embedding")]
#[command(about = "Sum-mode EmbeddingBag lookups on processing-in-memory elements", long_about = None)]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Write the default configuration file
    InitConfig {
        /// Target path (default: ~/.pim-embedding/config.toml)
        #[arg(short, long)]
        path: Option<PathBuf>,

        /// Overwrite an existing file
        #[arg(short, long)]
        force: bool,
    },

    /// Show the PE placement of the configured workload
    Mapping {
        /// Configuration file
        #[arg(short, long)]
        config: Option<PathBuf>,
    },

    /// Run synthetic lookups through the pipeline
    Run {
        /// Configuration file
        #[arg(short, long)]
        config: Option<PathBuf>,

        /// Override the configured number of iterations
        #[arg(short = 'n', long)]
        iterations: Option<usize>,

        /// Check every result against the host reference
        #[arg(long)]
        verify: bool,

        /// Override the configured log level
        #[arg(short, long)]
        log_level: Option<String>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::InitConfig { path, force } => {
            init_simple_logging("info")?;
            cmd_init_config(path, force)?;
        }

        Commands::Mapping { config } => {
            // No logging for mapping (pure display)
            let config = load_config(config.as_deref())?;
            cmd_mapping(&config)?;
        }

        Commands::Run {
            config,
            iterations,
            verify,
            log_level,
        } => {
            let mut config = load_config(config.as_deref())?;
            if let Some(level) = log_level {
                config.logging.level = level;
            }
            if let Some(n) = iterations {
                config.workload.nr_iterations = n;
            }
            config.validate().context("Invalid configuration")?;
            init_logging(&config.logging)?;
            cmd_run(config, verify).await?;
        }
    }

    Ok(())
}

/// Explicit path, else the default path if present, else built-in defaults
fn load_config(path: Option<&Path>) -> Result<RunConfig> {
    if let Some(path) = path {
        return RunConfig::load(path)
            .with_context(|| format!("Failed to load config from {}", path.display()));
    }

    let default_path = RunConfig::default_path()?;
    if default_path.exists() {
        RunConfig::load(&default_path)
            .with_context(|| format!("Failed to load config from {}", default_path.display()))
    } else {
        Ok(RunConfig::default())
    }
}

fn cmd_init_config(path: Option<PathBuf>, force: bool) -> Result<()> {
    let path = match path {
        Some(path) => path,
        None => RunConfig::default_path()?,
    };
    if path.exists() && !force {
        anyhow::bail!("{} already exists (use --force to overwrite)", path.display());
    }

    RunConfig::default()
        .save(&path)
        .with_context(|| format!("Failed to write {}", path.display()))?;

    println!("✅ Configuration written to {}", path.display());
    Ok(())
}

fn cmd_mapping(config: &RunConfig) -> Result<()> {
    let w = &config.workload;
    let mapping = RankMapping::compute(w.nr_embedding, w.nr_batches, w.nr_rows, w.nr_cols, &config.fleet)
        .context("Workload does not fit the fleet")?;

    println!("📐 Rank mapping");
    println!("   Embeddings:        {}", mapping.nr_embedding());
    println!("   Table shape:       {} x {}", mapping.nr_rows(), mapping.nr_cols());
    println!("   PEs used:          {} / {}", mapping.nr_pes(), config.fleet.max_pes);
    println!("   Columns per PE:    {}", mapping.cols_per_pe());
    println!("   Weight bytes / PE: {}", mapping.emb_data_bytes());
    println!("   Bags per call:     {} (max {})", w.nr_batches, mapping.batch_capacity());
    println!();

    println!("   {:>6}  {:>9}  columns", "PE", "embedding");
    for a in mapping.assignments() {
        println!("   {:>6}  {:>9}  {}..{}", a.pe, a.embedding, a.column_start, a.column_end);
    }
    Ok(())
}

async fn cmd_run(config: RunConfig, verify: bool) -> Result<()> {
    let workload = &config.workload;
    info!(
        nr_embedding = workload.nr_embedding,
        nr_rows = workload.nr_rows,
        nr_cols = workload.nr_cols,
        nr_batches = workload.nr_batches,
        iterations = workload.nr_iterations,
        "Starting synthetic run"
    );

    let host = EmbeddingHost::new(&config).context("Failed to set up the fleet")?;
    let tables = synthetic_tables(workload);
    host.load_weights(&tables)
        .await
        .context("Failed to load embedding tables")?;

    let mut checker = Checker::new(&tables, verify);
    let mut sink = |iteration: usize, batch: &InputBatch, results: &ResultBuffer| checker.check(iteration, batch, results);
    let report = host
        .run_pipeline(
            SyntheticSource::new(workload),
            workload.nr_iterations,
            config.pipeline.depth,
            &mut sink,
        )
        .await
        .context("Pipeline failed")?;

    let stats = host.stats();
    println!("📊 Run summary");
    println!("   Batches processed: {}", report.processed);
    println!("   Batches failed:    {}", report.failed);
    println!("   Elapsed:           {:.2} s", report.elapsed.as_secs_f64());
    println!("   Throughput:        {:.1} batches/s", report.batches_per_second());
    println!("   Avg latency:       {:.3} ms", stats.avg_latency_ms());
    println!("   Bags / second:     {:.0}", stats.bags_per_second());
    if verify {
        if checker.invalid == 0 {
            println!("✅ All {} batches match the host reference", checker.checked);
        } else {
            println!("❌ {} of {} batches differ from the host reference", checker.invalid, checker.checked);
        }
    }

    host.release().context("Failed to release the fleet")?;
    if checker.invalid > 0 {
        anyhow::bail!("verification failed");
    }
    Ok(())
}

/// Verification sink state
struct Checker<'a> {
    tables: &'a [EmbeddingTable],
    enabled: bool,
    checked: usize,
    invalid: usize,
}

impl<'a> Checker<'a> {
    fn new(tables: &'a [EmbeddingTable], enabled: bool) -> Self {
        Self {
            tables,
            enabled,
            checked: 0,
            invalid: 0,
        }
    }

    fn check(&mut self, iteration: usize, batch: &InputBatch, results: &ResultBuffer) -> Result<(), FleetError> {
        if !self.enabled {
            return Ok(());
        }
        let report = check_inference(self.tables, batch, results)?;
        self.checked += 1;
        if !report.valid {
            self.invalid += 1;
            warn!(iteration, mismatches = report.mismatch_count, "Batch failed verification");
        }
        Ok(())
    }
}
