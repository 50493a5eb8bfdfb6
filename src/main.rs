use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use flexi_logger::Logger;
use log::{error, info};
use std::path::PathBuf;

use symtemplate::entry::decompose_matrix_file;
use symtemplate::{run_longitudinal, run_symmetrization, PipelineConfig};

#[derive(Parser)]
#[command(name = "symtemplate")]
#[command(about = "Symmetric templates and longitudinal registration for multi-session MRI")]
struct Cli {
    /// Log level, overridden by RUST_LOG
    #[arg(long, default_value = "info", global = true)]
    log_level: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Build a left-right symmetric template per session
    Symmetrize(RunArgs),
    /// Register consecutive sessions and propagate contrasts
    Longitudinal(RunArgs),
    /// Print translation and Euler angles of a flirt matrix
    Decompose {
        /// 4x4 matrix file
        matrix: PathBuf,
    },
}

#[derive(Args)]
struct RunArgs {
    /// Pipeline TOML file
    #[arg(short, long)]
    config: PathBuf,

    /// Log engine commands without running them
    #[arg(long)]
    dry_run: bool,

    /// Recompute outputs that already exist
    #[arg(long)]
    force: bool,

    /// Keep intermediate images
    #[arg(long)]
    keep_tmp: bool,

    #[arg(long)]
    max_iter: Option<usize>,

    /// Convergence threshold in degrees
    #[arg(long)]
    max_angle: Option<f64>,

    /// Process sessions in parallel
    #[arg(long)]
    parallel: bool,

    #[arg(long)]
    threads: Option<usize>,
}

impl RunArgs {
    fn load(&self) -> Result<PipelineConfig> {
        let mut config = PipelineConfig::from_file(&self.config)?;
        config.dry_run |= self.dry_run;
        config.force |= self.force;
        config.keep_tmp |= self.keep_tmp;
        config.parallel_sessions |= self.parallel;
        if let Some(n) = self.max_iter {
            config.symmetrization.max_iter = n;
        }
        if let Some(angle) = self.max_angle {
            config.symmetrization.max_angle = angle;
        }
        if let Some(n) = self.threads {
            config.threads = n;
        }
        Ok(config)
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let _logger = Logger::try_with_env_or_str(&cli.log_level)
        .context("invalid log level")?
        .start()
        .context("starting logger")?;

    let report = match &cli.command {
        Commands::Symmetrize(args) => run_symmetrization(&args.load()?)?,
        Commands::Longitudinal(args) => run_longitudinal(&args.load()?)?,
        Commands::Decompose { matrix } => {
            let (m, d) = decompose_matrix_file(matrix)?;
            println!("{}", matrix.display());
            for row in m.row_iter() {
                println!("  {:>12.6} {:>12.6} {:>12.6} {:>12.6}", row[0], row[1], row[2], row[3]);
            }
            println!("{}", d);
            return Ok(());
        }
    };

    if report.has_failures() {
        error!("{} finished with failures", report.run);
        std::process::exit(1);
    }
    info!("{} finished", report.run);
    Ok(())
}
