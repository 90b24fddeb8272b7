// ========================================================================================
//
//                              The multifit command line
//
// ========================================================================================
//
// Three commands over one TOML run configuration:
//
//   run      split the data, tune and fit one model per response, write artifacts
//   grid     print the hyperparameter grid a run would search
//   inspect  print the held-out metrics stored in a fit results file

use clap::{Parser, Subcommand};
use multifit::artifacts;
use multifit::batch;
use multifit::config::RunConfig;
use multifit::grid::regular_grid;
use multifit::progress::ProgressBarObserver;
use std::path::PathBuf;
use std::process;
use std::time::Instant;

#[derive(Parser)]
#[command(
    name = "multifit",
    version,
    about = "Tune and fit one supervised model per response variable",
    long_about = "Splits a table into training and test sets, then for every response column \
                 tunes a model over a regular grid with v-fold cross-validation, refits the \
                 best configuration and evaluates it on the held-out rows."
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the full batch described by a configuration file
    #[command(about = "Tune and fit every response (outputs: *_fit_results.toml and friends)")]
    Run {
        /// Path to the TOML run configuration
        #[arg(long, value_name = "PATH")]
        config: PathBuf,

        /// Override the split seed (and the fold seed when it is not set)
        #[arg(long, value_name = "N")]
        seed: Option<u64>,

        /// Override the output directory
        #[arg(long, value_name = "DIR")]
        output_dir: Option<PathBuf>,

        /// Override the number of tuning workers
        #[arg(long, value_name = "N", conflicts_with = "sequential")]
        workers: Option<usize>,

        /// Tune without a worker pool
        #[arg(long)]
        sequential: bool,
    },

    /// Print the hyperparameter grid of a configuration
    Grid {
        #[arg(long, value_name = "PATH")]
        config: PathBuf,
    },

    /// Print per-response test metrics from a fit results file
    Inspect {
        #[arg(value_name = "FIT_RESULTS")]
        path: PathBuf,
    },
}

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let cli = Cli::parse();

    let result = match cli.command {
        Commands::Run {
            config,
            seed,
            output_dir,
            workers,
            sequential,
        } => run_command(config, seed, output_dir, workers, sequential),
        Commands::Grid { config } => grid_command(config),
        Commands::Inspect { path } => inspect_command(path),
    };

    if let Err(e) = result {
        eprintln!("Error: {e}");
        process::exit(1);
    }
}

fn run_command(
    config_path: PathBuf,
    seed: Option<u64>,
    output_dir: Option<PathBuf>,
    workers: Option<usize>,
    sequential: bool,
) -> Result<(), Box<dyn std::error::Error>> {
    let start_time = Instant::now();
    let mut config = RunConfig::from_path(&config_path)?;
    if let Some(seed) = seed {
        config.split.seed = seed;
    }
    if let Some(dir) = output_dir {
        config.output.dir = dir;
    }
    if let Some(workers) = workers {
        config.parallel.enabled = true;
        config.parallel.workers = Some(workers);
    }
    if sequential {
        config.parallel.enabled = false;
    }

    let mut observer = ProgressBarObserver::new();
    let outcome = batch::run(&config, &mut observer)?;

    let results = &outcome.results;
    println!(
        "Split: {} training rows, {} test rows",
        outcome.split.train.len(),
        outcome.split.test.len()
    );
    for (i, response) in results.responses.iter().enumerate() {
        match &results.fits[i] {
            Some(fit) => {
                let metrics: Vec<String> = fit
                    .metrics
                    .iter()
                    .map(|m| format!("{} = {:.4}", m.metric, m.estimate))
                    .collect();
                println!(
                    "  #{} {response}: {} ({})",
                    i + 1,
                    fit.config.id,
                    metrics.join(", ")
                );
            }
            None => println!("  #{} {response}: failed", i + 1),
        }
    }
    println!(
        "Fitted {} of {} responses in {:.2?}. Results written to {}",
        results.succeeded(),
        results.len(),
        start_time.elapsed(),
        config.output.dir.display()
    );
    Ok(())
}

fn grid_command(config_path: PathBuf) -> Result<(), Box<dyn std::error::Error>> {
    let config = RunConfig::from_path(&config_path)?;
    config.validate()?;
    let spec = config.model_spec()?;
    let grid = regular_grid(&spec.tunable(), config.tuning.levels)?;

    println!("id\t{}", grid.params.join("\t"));
    for configuration in &grid.configurations {
        let values: Vec<String> = grid
            .params
            .iter()
            .map(|p| format!("{:.6e}", configuration.values[p]))
            .collect();
        println!("{}\t{}", configuration.id, values.join("\t"));
    }
    Ok(())
}

fn inspect_command(path: PathBuf) -> Result<(), Box<dyn std::error::Error>> {
    let slots = artifacts::load_fit_results(&path)?;
    for slot in &slots {
        match (&slot.value, &slot.error) {
            (Some(fit), _) => {
                let metrics: Vec<String> = fit
                    .metrics
                    .iter()
                    .map(|m| format!("{}\t{:.6}", m.metric, m.estimate))
                    .collect();
                for line in metrics {
                    println!("{}\t{}\t{}\t{line}", slot.index, slot.response, fit.config.id);
                }
            }
            (None, Some(error)) => println!("{}\t{}\tfailed\t{error}", slot.index, slot.response),
            (None, None) => println!("{}\t{}\tmissing", slot.index, slot.response),
        }
    }
    Ok(())
}
