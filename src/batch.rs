// ========================================================================================
//
//                       The per-response batch fitting loop
//
// ========================================================================================
//
// One tuned model per response variable. Iterations run strictly one after another;
// only the grid evaluation inside an iteration is parallel. Every iteration runs
// inside its own failure boundary: an error (or a panic) in iteration `i` is logged,
// recorded, and leaves slot `i` of every result collection empty, while the loop
// continues with `i + 1`.

use crate::artifacts::{self, ArtifactError, ArtifactPaths};
use crate::config::{ConfigError, RunConfig};
use crate::data::{DataError, Table, load_table};
use crate::folds::{FoldError, Resamples, vfold_cv};
use crate::frames::{FrameError, response_frames};
use crate::grid::{Configuration, Grid, GridError, regular_grid};
use crate::metrics::{Metric, MetricError, MetricSet};
use crate::model::{FittedModel, ModelError, ModelSpec};
use crate::pool::{PoolError, WorkerPool};
use crate::progress::BatchObserver;
use crate::recipe::{Formula, Recipe, RecipeError, Step};
use crate::split::{InitialSplit, SplitError, initial_split};
use crate::tune::{GridSearch, MetricSummary, TuneError, Tuner};
use crate::workflow::{FittedWorkflow, LastFit, Workflow, WorkflowError, last_fit};
use serde::{Deserialize, Serialize};
use std::panic::{AssertUnwindSafe, catch_unwind};
use thiserror::Error;

/// Placeholder in formula templates for the response column name.
pub const RESPONSE_PLACEHOLDER: &str = "{response}";

// ========================================================================================
//                                   Error handling
// ========================================================================================

/// Failures that abort a run. None of them can happen inside the loop.
#[derive(Error, Debug)]
pub enum BatchError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),
    #[error("Data error: {0}")]
    Data(#[from] DataError),
    #[error("Split error: {0}")]
    Split(#[from] SplitError),
    #[error("Frame error: {0}")]
    Frame(#[from] FrameError),
    #[error("Worker pool error: {0}")]
    Pool(#[from] PoolError),
    #[error("Failed to write results: {0}")]
    Artifact(#[from] ArtifactError),
    #[error("Invalid metric configuration: {0}")]
    Metric(#[from] MetricError),
    #[error("Invalid model specification: {0}")]
    Model(#[from] ModelError),
    #[error("Selection metric '{0}' is not in the metric set.")]
    SelectMetricNotInSet(Metric),
    #[error("Got {train} training frames but {test} test frames.")]
    FrameCountMismatch { train: usize, test: usize },
}

/// Failures isolated to one iteration of the loop.
#[derive(Error, Debug)]
pub enum IterationError {
    #[error("fold construction failed: {0}")]
    Folds(#[from] FoldError),
    #[error("recipe construction failed: {0}")]
    Recipe(#[from] RecipeError),
    #[error("hyperparameter grid construction failed: {0}")]
    Grid(#[from] GridError),
    #[error("tuning failed: {0}")]
    Tuning(#[from] TuneError),
    #[error("final fit failed: {0}")]
    Workflow(#[from] WorkflowError),
    #[error("the iteration panicked: {0}")]
    Panicked(String),
}

fn panic_payload_to_string(payload: Box<dyn std::any::Any + Send>) -> String {
    if let Some(msg) = payload.downcast_ref::<&str>() {
        return (*msg).to_string();
    }
    if let Some(msg) = payload.downcast_ref::<String>() {
        return msg.clone();
    }
    "unknown panic payload".to_string()
}

// ========================================================================================
//                                 Configuration types
// ========================================================================================

/// How the fold seed is chosen for each iteration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SeedPolicy {
    /// Every iteration uses the same seed, so fold assignments coincide across
    /// responses whenever their strata do.
    #[default]
    Reuse,
    /// Iteration `i` uses `seed + i - 1`.
    PerIteration,
}

impl SeedPolicy {
    pub fn seed_for(self, seed: u64, index: usize) -> u64 {
        match self {
            SeedPolicy::Reuse => seed,
            SeedPolicy::PerIteration => seed.wrapping_add(index.saturating_sub(1) as u64),
        }
    }
}

/// Everything one batch needs, shared by every iteration.
#[derive(Debug, Clone)]
pub struct BatchConfig {
    /// Model declaration with tuning placeholders.
    pub spec: ModelSpec,
    /// Formula template; `{response}` is replaced by each frame's response name.
    pub formula: String,
    pub steps: Vec<Step>,
    pub levels: usize,
    pub folds: usize,
    /// Stratify folds by the response column.
    pub stratify: bool,
    pub seed: u64,
    pub seed_policy: SeedPolicy,
    pub metrics: MetricSet,
    pub select_metric: Metric,
}

impl BatchConfig {
    /// A config with the usual defaults: ten levels, five stratified folds and
    /// seed 500 reused by every iteration. Selection uses `accuracy` when the
    /// set contains it, otherwise the set's first metric.
    pub fn new(spec: ModelSpec, metrics: MetricSet) -> Self {
        let select_metric = if metrics.contains(Metric::Accuracy) {
            Metric::Accuracy
        } else {
            metrics.metrics()[0]
        };
        Self {
            spec,
            formula: format!("{RESPONSE_PLACEHOLDER} ~ ."),
            steps: Vec::new(),
            levels: 10,
            folds: 5,
            stratify: true,
            seed: 500,
            seed_policy: SeedPolicy::Reuse,
            metrics,
            select_metric,
        }
    }

    /// Checks the parts shared by every iteration, before the loop starts.
    pub fn validate(&self) -> Result<(), BatchError> {
        self.spec.validate()?;
        self.metrics
            .validate(self.spec.mode, self.spec.options.prob_model)?;
        if !self.metrics.contains(self.select_metric) {
            return Err(BatchError::SelectMetricNotInSet(self.select_metric));
        }
        Ok(())
    }

    /// Parses the formula template and binds `{response}` on its left-hand
    /// side to `response`. The name is never lexed, so any header works.
    pub fn formula_for(&self, response: &str) -> Result<Formula, RecipeError> {
        let formula: Formula = self.formula.parse()?;
        if formula.outcome == RESPONSE_PLACEHOLDER {
            Ok(formula.with_outcome(response))
        } else {
            Ok(formula)
        }
    }
}

// ========================================================================================
//                                     Results
// ========================================================================================

/// Diagnostic for one failed iteration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IterationFailure {
    pub index: usize,
    pub response: String,
    pub message: String,
}

/// Grid search record for one response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TuningSummary {
    pub grid: Grid,
    pub selected: Configuration,
    pub metrics: Vec<MetricSummary>,
}

/// Everything one successful iteration produces.
#[derive(Debug, Clone)]
pub struct IterationArtifacts {
    /// The workflow as declared, with tuning placeholders.
    pub workflow: Workflow,
    pub fitted: FittedWorkflow,
    pub model: FittedModel,
    pub last_fit: LastFit,
    pub tuning: TuningSummary,
}

/// Positional result collections. Slot `i - 1` belongs to response `i`; a
/// failed iteration leaves `None` in every collection.
#[derive(Debug, Clone, Default)]
pub struct BatchResults {
    pub responses: Vec<String>,
    pub models: Vec<Option<FittedModel>>,
    pub workflows: Vec<Option<FittedWorkflow>>,
    pub fits: Vec<Option<LastFit>>,
    pub tuning: Vec<Option<TuningSummary>>,
    pub failures: Vec<IterationFailure>,
}

impl BatchResults {
    pub fn with_responses(responses: Vec<String>) -> Self {
        let n = responses.len();
        Self {
            responses,
            models: vec![None; n],
            workflows: vec![None; n],
            fits: vec![None; n],
            tuning: vec![None; n],
            failures: Vec::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.responses.len()
    }

    pub fn is_empty(&self) -> bool {
        self.responses.is_empty()
    }

    pub fn succeeded(&self) -> usize {
        self.models.iter().filter(|m| m.is_some()).count()
    }

    fn store(&mut self, index: usize, artifacts: IterationArtifacts) {
        let slot = index - 1;
        self.models[slot] = Some(artifacts.model);
        self.workflows[slot] = Some(artifacts.fitted);
        self.fits[slot] = Some(artifacts.last_fit);
        self.tuning[slot] = Some(artifacts.tuning);
    }
}

// ========================================================================================
//                                    The loop
// ========================================================================================

/// Runs every step for one response. `index` is 1-based.
pub fn fit_response(
    train: &Table,
    test: &Table,
    index: usize,
    config: &BatchConfig,
    tuner: &dyn Tuner,
) -> Result<IterationArtifacts, IterationError> {
    let response = train.columns().first().cloned().unwrap_or_default();

    // --- Resamples ---
    let seed = config.seed_policy.seed_for(config.seed, index);
    let strata = config.stratify.then_some(response.as_str());
    let resamples = Resamples {
        data: train,
        folds: vfold_cv(train, config.folds, strata, seed)?,
    };

    // --- Recipe, model and workflow ---
    let recipe = Recipe::from_formula(config.formula_for(&response)?, train)?.with_steps(&config.steps);
    let workflow = Workflow::new(recipe, config.spec.clone());

    // --- Grid search ---
    let grid = regular_grid(&workflow.spec().tunable(), config.levels)?;
    let performance = tuner.evaluate(&workflow, &resamples, &grid, &config.metrics)?;
    let selected = tuner.select_best(&performance, config.select_metric)?;
    log::info!(
        "Response #{index} ({response}): selected {} {:?}",
        selected.id,
        selected.values
    );

    // --- Final fit on the whole training split ---
    let finalized = workflow.finalize(&selected)?;
    let (fitted, mut evaluation) = last_fit(&finalized, train, test, &config.metrics)?;
    evaluation.resampled = performance.summary_for(&selected.id);
    let model = fitted.extract_fit_engine().clone();

    Ok(IterationArtifacts {
        workflow,
        fitted,
        model,
        last_fit: evaluation,
        tuning: TuningSummary {
            grid,
            selected,
            metrics: performance.collect_metrics(),
        },
    })
}

/// Fits every response in order, isolating per-iteration failures.
///
/// `train_frames[i]` and `test_frames[i]` are the frames of response `i + 1`.
pub fn fit_batch(
    train_frames: &[Table],
    test_frames: &[Table],
    config: &BatchConfig,
    tuner: &dyn Tuner,
    observer: &mut dyn BatchObserver,
) -> Result<BatchResults, BatchError> {
    if train_frames.len() != test_frames.len() {
        return Err(BatchError::FrameCountMismatch {
            train: train_frames.len(),
            test: test_frames.len(),
        });
    }
    config.validate()?;

    let responses: Vec<String> = train_frames
        .iter()
        .map(|t| t.columns().first().cloned().unwrap_or_default())
        .collect();
    let mut results = BatchResults::with_responses(responses.clone());
    observer.on_batch_start(train_frames.len());

    for (slot, (train, test)) in train_frames.iter().zip(test_frames).enumerate() {
        let index = slot + 1;
        let response = &responses[slot];
        observer.on_iteration_start(index, response);

        let outcome = catch_unwind(AssertUnwindSafe(|| {
            fit_response(train, test, index, config, tuner)
        }))
        .unwrap_or_else(|payload| Err(IterationError::Panicked(panic_payload_to_string(payload))));

        match outcome {
            Ok(artifacts) => {
                results.store(index, artifacts);
                observer.on_iteration_success(index, response);
            }
            Err(e) => {
                log::error!("Response #{index} ({response}) failed: {e}");
                observer.on_iteration_failure(index, response, &e);
                results.failures.push(IterationFailure {
                    index,
                    response: response.clone(),
                    message: e.to_string(),
                });
            }
        }
    }

    observer.on_batch_finish(results.succeeded(), results.failures.len());
    log::info!(
        "Batch finished: {} of {} responses fitted.",
        results.succeeded(),
        results.len()
    );
    Ok(results)
}

/// Runs the loop with an optional dedicated worker pool of `workers` threads.
///
/// The pool is created before the loop and released exactly once after it,
/// whatever the iterations did.
pub fn run_batch(
    train_frames: &[Table],
    test_frames: &[Table],
    config: &BatchConfig,
    workers: Option<usize>,
    observer: &mut dyn BatchObserver,
) -> Result<BatchResults, BatchError> {
    let pool = workers.map(WorkerPool::new).transpose()?;
    if let Some(pool) = &pool {
        observer.on_pool_ready(pool.workers());
    }

    let results = {
        let tuner = match &pool {
            Some(pool) => GridSearch::with_pool(pool),
            None => GridSearch::new(),
        };
        fit_batch(train_frames, test_frames, config, &tuner, observer)
    };

    if let Some(pool) = pool {
        let released = pool.shutdown();
        observer.on_pool_teardown(released);
    }
    results
}

/// What a full run produced.
#[derive(Debug)]
pub struct RunOutcome {
    pub split: InitialSplit,
    pub results: BatchResults,
    pub written: ArtifactPaths,
}

/// Loads, splits, fits every response and writes the artifacts.
pub fn run(config: &RunConfig, observer: &mut dyn BatchObserver) -> Result<RunOutcome, BatchError> {
    config.validate()?;
    let batch_config = config.batch_config()?;
    batch_config.validate()?;
    let layout = config.layout();

    let table = load_table(&config.data.path, &config.load_options())?;
    layout.validate(table.ncols())?;

    let strata = config.strata_column(&table);
    let split = initial_split(&table, Some(strata.as_str()), config.split.prop, config.split.seed)?;
    let train_frames = response_frames(&split.training(&table), &layout)?;
    let test_frames = response_frames(&split.testing(&table), &layout)?;

    let results = run_batch(
        &train_frames,
        &test_frames,
        &batch_config,
        config.workers(),
        observer,
    )?;
    let written = artifacts::write_all(&results, &config.output.dir, &config.output.prefix)?;
    Ok(RunOutcome {
        split,
        results,
        written,
    })
}
