use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use tmplcov::cli::{self, Format};
use tmplcov::config::Config;
use tmplcov::isolate::Isolation;
use tmplcov::runner::CoverageRunner;

/// tmplcov: branch coverage for templates through synthesized inputs.
#[derive(Parser)]
#[command(name = "tmplcov", version, about)]
struct Cli {
    /// TOML configuration file.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Per-permutation timeout in milliseconds.
    #[arg(long, global = true)]
    timeout_ms: Option<u64>,

    /// Scratch directory for compiled artifacts.
    #[arg(long, global = true)]
    artifact_dir: Option<PathBuf>,

    /// Execute permutations in this process instead of one child per
    /// permutation.
    #[arg(long, global = true)]
    in_process: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run every synthesized permutation and report coverage.
    Run {
        /// Path to the template.
        template: PathBuf,

        /// JSON object of explicit locals.
        #[arg(long)]
        locals: Option<PathBuf>,

        /// Report format.
        #[arg(long, value_enum, default_value = "text")]
        format: Format,

        /// Re-run once with permutations aimed at the uncovered arms.
        #[arg(long)]
        targeted: bool,
    },

    /// List branch sites and the variables their conditions read.
    Branches {
        /// Path to the template.
        template: PathBuf,
    },

    /// Show case values, block conditions, computed variables and string
    /// comparisons recovered from the template.
    Facts {
        /// Path to the template.
        template: PathBuf,
    },

    /// Print the synthesized permutation list.
    Permutations {
        /// Path to the template.
        template: PathBuf,

        /// Print as JSON.
        #[arg(long)]
        json: bool,
    },

    /// Compile a template and print the generated code.
    Compile {
        /// Path to the template.
        template: PathBuf,
    },

    /// Clear the compiled artifact directory.
    Clean,

    #[command(name = "exec-isolated", hide = true)]
    ExecIsolated,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    // The isolated child keeps stderr empty; anything there fails the run.
    if matches!(cli.command, Commands::ExecIsolated) {
        return cli::cmd_exec_isolated();
    }

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")))
        .with_writer(std::io::stderr)
        .init();

    let runner = build_runner(&cli)?;

    let output = match cli.command {
        Commands::Run {
            template,
            locals,
            format,
            targeted,
        } => cli::cmd_run(&runner, &template, locals.as_deref(), &format, targeted)?,
        Commands::Branches { template } => cli::cmd_branches(&runner, &template)?,
        Commands::Facts { template } => cli::cmd_facts(&runner, &template)?,
        Commands::Permutations { template, json } => cli::cmd_permutations(&runner, &template, json)?,
        Commands::Compile { template } => cli::cmd_compile(&runner, &template)?,
        Commands::Clean => cli::cmd_clean(&runner)?,
        Commands::ExecIsolated => return cli::cmd_exec_isolated(),
    };

    print!("{output}");
    Ok(())
}

fn build_runner(cli: &Cli) -> Result<CoverageRunner> {
    let mut config = match &cli.config {
        Some(path) => Config::from_toml_file(path)
            .with_context(|| format!("Failed to load config {}", path.display()))?,
        None => Config::default(),
    };
    if let Some(ms) = cli.timeout_ms {
        config.permutation_timeout_ms = ms;
    }
    if let Some(dir) = &cli.artifact_dir {
        config.artifact_dir = dir.clone();
    }
    let errors = config.validate();
    if !errors.is_empty() {
        anyhow::bail!("Invalid configuration: {}", errors.join("; "));
    }

    let isolation = if cli.in_process {
        Isolation::InProcess
    } else {
        Isolation::current_exe().context("Failed to locate the tmplcov executable")?
    };
    Ok(CoverageRunner::new(config, isolation))
}
