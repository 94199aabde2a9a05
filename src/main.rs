use std::path::PathBuf;
use std::sync::atomic::Ordering;
use std::time::Duration;

use anyhow::Result;
use clap::{Args, Parser, Subcommand};

use hillclimb::config::LoopConfig;
use hillclimb::error::RevertInconsistencyError;
use hillclimb::logging;
use hillclimb::patch::HttpPatchService;
use hillclimb::runner::{build_serve_measure, measure_url, LoopRunner};

#[derive(Parser, Debug)]
#[command(
    name = "hillclimb",
    about = "Measurement-driven patch optimization loop for web game builds",
    version
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the optimization loop against a repository.
    Run(RunArgs),
    /// Take one measurement pass and print the summary as JSON.
    Measure(MeasureArgs),
}

#[derive(Args, Debug)]
struct RunArgs {
    /// Repository to optimize (defaults to current directory)
    #[arg(default_value = ".")]
    repo: PathBuf,

    /// Override the configured iteration count
    #[arg(long)]
    iterations: Option<usize>,

    /// Override samples per measurement phase
    #[arg(long)]
    repeats: Option<usize>,

    /// Measure this URL instead of the local preview server
    #[arg(long)]
    url: Option<String>,

    /// Patch service endpoint (overrides config and HILLCLIMB_SERVICE_URL)
    #[arg(long)]
    service: Option<String>,

    /// Screenshot cadence in iterations (0 disables)
    #[arg(long)]
    screenshot_every: Option<usize>,
}

#[derive(Args, Debug)]
struct MeasureArgs {
    /// Repository to measure (defaults to current directory)
    #[arg(default_value = ".")]
    repo: PathBuf,

    /// Measure this URL directly, skipping build and serve
    #[arg(long)]
    url: Option<String>,

    /// Override samples for this pass
    #[arg(long)]
    repeats: Option<usize>,
}

#[tokio::main]
async fn main() {
    logging::init();
    let cli = Cli::parse();

    let result = match cli.command {
        Commands::Run(args) => run(args).await,
        Commands::Measure(args) => measure(args).await,
    };

    if let Err(err) = result {
        if err.downcast_ref::<RevertInconsistencyError>().is_some() {
            eprintln!("fatal: {}", err);
            eprintln!("the working tree may not match the record log; inspect it before rerunning");
            std::process::exit(2);
        }
        eprintln!("error: {}", err);
        std::process::exit(1);
    }
}

async fn run(args: RunArgs) -> Result<()> {
    let repo = args.repo.canonicalize()?;
    let mut config = LoopConfig::load(&repo)?;
    if let Some(iterations) = args.iterations {
        config.iterations = iterations;
    }
    if let Some(repeats) = args.repeats {
        config.repeats = repeats;
    }
    if let Some(url) = args.url {
        config.url = Some(url);
    }
    if let Some(service) = args.service {
        config.service_endpoint = Some(service);
    }
    if let Some(every) = args.screenshot_every {
        config.screenshot_every = every;
    }
    config.validate()?;

    let endpoint = config.service_endpoint()?;
    let service = HttpPatchService::new(
        endpoint,
        Duration::from_secs(config.service_timeout_secs),
        config.service_retries,
    )?;

    eprintln!(
        "hillclimb: {} iteration(s) over {}",
        config.iterations,
        repo.display()
    );

    let mut runner = LoopRunner::new(config, service)?;

    let cancel = runner.cancel_flag();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            eprintln!("\ninterrupt received; finishing the current iteration");
            cancel.store(true, Ordering::SeqCst);
        }
    });

    let summary = runner.run().await?;
    eprintln!(
        "done: {} run, {} kept, {} reverted, {} skipped, {} failed",
        summary.iterations_run, summary.kept, summary.reverted, summary.skipped, summary.failed
    );
    Ok(())
}

async fn measure(args: MeasureArgs) -> Result<()> {
    let repo = args.repo.canonicalize()?;
    let mut config = LoopConfig::load(&repo)?;
    if let Some(repeats) = args.repeats {
        config.repeats = repeats;
    }
    config.validate()?;

    let summary = match args.url {
        Some(url) => measure_url(&config, &url, 0, "measure").await?,
        None => build_serve_measure(&config, 0, "measure").await?,
    };

    println!("{}", serde_json::to_string_pretty(&summary)?);
    Ok(())
}
