mod config;
mod generator;
mod mutation;
mod process;
mod repository;
mod scoring;
mod session;
mod testgen;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use crate::config::{Config, Secret};
use crate::generator::{Gambit, MutantGenerator};
use crate::process::{program_available, Interrupt};
use crate::repository::RepoSpec;
use crate::session::{
    AssumeYes, ConfirmationProvider, Orchestrator, RunOptions, SessionRun, StdinConfirmation,
};
use crate::testgen::{GeminiClient, TestGenerator};

#[derive(Parser)]
#[command(name = "guardian")]
#[command(version)]
#[command(about = "Mutation testing for Solidity projects, with drafted tests for surviving mutants")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Path to configuration file
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Log at debug level
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a mutation testing session
    Run(RunArgs),
    /// Check that the generator and the Solidity toolchain are installed
    Check,
    /// Build and install the mutant generator
    Install,
    /// Show the effective configuration, or write the default one
    Config {
        /// Write the default configuration file
        #[arg(long)]
        init: bool,
        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },
    /// Re-render the report of a saved session
    Report {
        /// Session directory or its session.json
        session: PathBuf,
    },
}

#[derive(Args)]
struct RunArgs {
    /// Git repository to clone
    #[arg(long, conflicts_with = "path", required_unless_present = "path")]
    repo: Option<String>,

    /// Branch to clone
    #[arg(long, default_value = "main")]
    branch: String,

    /// Access token for private repositories (falls back to GITHUB_TOKEN)
    #[arg(long, env = "GUARDIAN_GIT_TOKEN", hide_env_values = true)]
    token: Option<String>,

    /// Local project directory, tested in place
    #[arg(long)]
    path: Option<PathBuf>,

    /// Directory for session records, reports and drafted tests
    #[arg(short, long)]
    output: Option<PathBuf>,

    /// API key for test generation (falls back to GEMINI_API_KEY)
    #[arg(long, env = "GUARDIAN_API_KEY", hide_env_values = true)]
    api_key: Option<String>,

    /// Model used for test generation
    #[arg(long)]
    model: Option<String>,

    /// Mutants requested per source file
    #[arg(long)]
    mutants: Option<usize>,

    /// Command that runs the project's tests
    #[arg(long)]
    test_command: Option<String>,

    /// Keep iterating until every mutant is killed
    #[arg(long)]
    iterative: bool,

    /// Delete the clone when done (ignored for --path)
    #[arg(long)]
    cleanup: bool,

    /// Fail instead of skipping test generation when no API key is set
    #[arg(long)]
    generate_tests: bool,

    /// Answer yes to every confirmation
    #[arg(short, long)]
    yes: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = Config::load(cli.config.as_deref())?;

    // Initialize logging; RUST_LOG wins over the config file
    let level = if cli.verbose {
        "debug"
    } else {
        config.general.log_level.as_str()
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    match cli.command {
        Commands::Run(args) => run(config, args).await,
        Commands::Check => check(&config).await,
        Commands::Install => {
            let gambit = Gambit::new(&config.generator, Interrupt::new());
            gambit.install().await?;
            Ok(())
        }
        Commands::Config { init, force } => {
            if init {
                init_config(cli.config, force)
            } else {
                print!("{}", toml::to_string_pretty(&config)?);
                Ok(())
            }
        }
        Commands::Report { session } => {
            let saved = session::load_session(&session)?;
            let results = saved
                .iterations
                .last()
                .map(|it| it.mutation_results.as_slice())
                .unwrap_or_default();
            let analysis = scoring::score(results, &config.scoring);
            print!("{}", session::render_report(&saved, &analysis)?);
            Ok(())
        }
    }
}

async fn run(mut config: Config, args: RunArgs) -> Result<()> {
    if let Some(output) = args.output {
        config.session.output_dir = output;
    }
    if let Some(model) = args.model {
        config.llm.model = model;
    }
    if let Some(mutants) = args.mutants {
        config.generator.mutants_per_file = mutants;
    }
    if let Some(test_command) = args.test_command {
        config.evaluation.test_command = test_command;
    }

    let repo = match (args.repo, args.path) {
        (Some(url), _) => RepoSpec::Remote {
            url,
            branch: args.branch,
            token: args
                .token
                .or_else(|| std::env::var("GITHUB_TOKEN").ok())
                .and_then(Secret::new),
        },
        (None, Some(path)) => RepoSpec::Local { path },
        (None, None) => anyhow::bail!("Either --repo or --path is required"),
    };

    let interrupt = Interrupt::new();
    let _ctrl_c = interrupt.listen_for_ctrl_c();

    let gambit = Gambit::new(&config.generator, interrupt.clone());
    if !gambit.check_available().await {
        anyhow::bail!(
            "Mutant generator '{}' not found. Run `guardian install` or set generator.binary in the config",
            config.generator.binary
        );
    }

    let mut options = RunOptions::new(&config, &repo);
    options.iterative = args.iterative;
    options.cleanup = args.cleanup;
    options.generate_tests = args.generate_tests;

    let api_key = args
        .api_key
        .or_else(|| std::env::var("GEMINI_API_KEY").ok())
        .and_then(Secret::new);
    let test_generator = match api_key {
        Some(key) => {
            options.model = Some(config.llm.model.clone());
            let client = GeminiClient::new(&config.llm, key)?;
            tracing::info!("Test generation enabled with model {}", client.model());
            Some(TestGenerator::new(client, interrupt.clone()))
        }
        None => {
            tracing::info!("No API key configured; surviving mutants will be reported without drafted tests");
            None
        }
    };

    let run = if args.yes {
        run_session(config, options, gambit, test_generator, AssumeYes, interrupt, &repo).await?
    } else {
        run_session(
            config,
            options,
            gambit,
            test_generator,
            StdinConfirmation,
            interrupt,
            &repo,
        )
        .await?
    };

    print_summary(&run);
    Ok(())
}

async fn run_session<G: MutantGenerator, C: ConfirmationProvider>(
    config: Config,
    options: RunOptions,
    generator: G,
    test_generator: Option<TestGenerator<GeminiClient>>,
    confirmation: C,
    interrupt: Interrupt,
    repo: &RepoSpec,
) -> Result<SessionRun> {
    let orchestrator = Orchestrator::new(
        config,
        options,
        generator,
        test_generator,
        confirmation,
        interrupt,
    )?;
    Ok(orchestrator.run(repo).await?)
}

fn print_summary(run: &SessionRun) {
    let analysis = &run.analysis;
    let stats = &analysis.stats;

    tracing::info!("==============================================");
    tracing::info!(
        "Mutants: {} total, {} killed, {} survived, {} timeout, {} error",
        stats.total,
        stats.killed,
        stats.survived,
        stats.timeout,
        stats.error
    );
    tracing::info!("Basic score:    {:.2}%", analysis.basic_score);
    tracing::info!("Guardian score: {:.2}", analysis.guardian_score);

    for gap in analysis.critical_gaps.iter().take(3) {
        tracing::info!(
            "Gap (priority {}): {}:{} {} `{}` -> `{}`",
            gap.priority,
            gap.file.display(),
            gap.line,
            gap.mutation_type,
            gap.original,
            gap.mutated
        );
    }
    for recommendation in &analysis.recommendations {
        tracing::info!("- {}", recommendation);
    }
    tracing::info!("Results written to {}", run.dir.display());
}

async fn check(config: &Config) -> Result<()> {
    let gambit = Gambit::new(&config.generator, Interrupt::new());
    let gambit_ok = gambit.check_available().await;

    let tools = [
        (config.generator.binary.as_str(), gambit_ok),
        (
            config.generator.solc.as_str(),
            program_available(&config.generator.solc, &["--version"]).await,
        ),
        ("forge", program_available("forge", &["--version"]).await),
        ("git", program_available("git", &["--version"]).await),
    ];

    for (name, ok) in tools {
        tracing::info!("{:<8} {}", name, if ok { "ok" } else { "missing" });
    }

    if !gambit_ok {
        tracing::warn!("Run `guardian install` to build the mutant generator");
    }
    Ok(())
}

fn init_config(path: Option<PathBuf>, force: bool) -> Result<()> {
    let target = path
        .or_else(Config::default_config_path)
        .context("No config path available")?;
    if target.exists() && !force {
        anyhow::bail!(
            "{} already exists (use --force to overwrite)",
            target.display()
        );
    }
    let written = Config::default().save(Some(&target))?;
    tracing::info!("Wrote default configuration to {}", written.display());
    Ok(())
}
