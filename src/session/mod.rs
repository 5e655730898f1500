//! Session orchestration.
//!
//! A session acquires a project, generates mutants per source file, evaluates
//! them one at a time, scores the results, optionally drafts tests for the
//! survivors, and persists everything after each iteration. In iterative mode
//! it then waits for the user to add tests and re-tests the survivors.
//!
//! Evaluation is strictly sequential: the evaluator substitutes mutants into
//! the working tree in place, so two evaluations against one checkout would
//! corrupt each other.

mod report;
pub mod store;

pub use report::render as render_report;
pub use store::{load_session, SessionStore};

use crate::config::Config;
use crate::generator::{self, remappings, GenerateOptions, GeneratorError, MutantGenerator};
use crate::mutation::executor::{recover_stale_backups, EvalSettings};
use crate::mutation::{
    self, EvaluateError, MutantDescriptor, MutantIdentity, MutantStatus, MutationResult,
};
use crate::process::{run_with_timeout, shell_command, CommandStatus, Interrupt};
use crate::repository::{self, RepoError, RepoSpec};
use crate::scoring::{self, Analysis, IterationStats, TimeoutPolicy};
use crate::testgen::{GeneratedTest, TestGenerator, TextGenerator};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Build output directories whose presence means the project has been built.
const BUILD_MARKERS: &[&str] = &["out", "cache", "artifacts"];

/// Settings echoed into `session.json`. Never holds credentials.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RunOptions {
    /// Repository URL or local path
    pub source: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub branch: Option<String>,
    pub test_command: String,
    pub mutants_per_file: usize,
    pub operators: Vec<String>,
    pub iterative: bool,
    pub cleanup: bool,
    /// Fail up front when no API key is available
    pub generate_tests: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    pub timeout_policy: TimeoutPolicy,
}

impl RunOptions {
    pub fn new(config: &Config, repo: &RepoSpec) -> Self {
        Self {
            source: repo.display_source(),
            branch: match repo {
                RepoSpec::Remote { branch, .. } => Some(branch.clone()),
                RepoSpec::Local { .. } => None,
            },
            test_command: config.evaluation.test_command.clone(),
            mutants_per_file: config.generator.mutants_per_file,
            operators: config.generator.operators.clone(),
            timeout_policy: config.scoring.timeout_policy,
            ..Self::default()
        }
    }
}

/// Where the orchestrator currently is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Acquiring,
    AwaitingSetupConfirmation,
    GeneratingMutants,
    Evaluating,
    Scoring,
    GeneratingTests,
    Persisting,
}

/// How a session ended without an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionOutcome {
    /// Completed a pass, or killed every mutant in iterative mode
    Done,
    /// The user declined the setup confirmation
    Cancelled,
    /// The user stopped iterating, or the iteration cap was hit
    Stopped,
    /// Ctrl-C; everything evaluated so far was persisted
    Interrupted,
}

impl std::fmt::Display for SessionOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Done => write!(f, "done"),
            Self::Cancelled => write!(f, "cancelled"),
            Self::Stopped => write!(f, "stopped"),
            Self::Interrupted => write!(f, "interrupted"),
        }
    }
}

/// Whether tests were drafted for the survivors.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum TestGeneration {
    Generated { count: usize },
    Skipped { reason: String },
    NotNeeded,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionSummary {
    pub outcome: SessionOutcome,
    pub iterations: u32,
    pub stats: IterationStats,
    pub basic_score: f64,
    pub guardian_score: f64,
    pub test_generation: TestGeneration,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MutationIteration {
    /// 1-based, strictly increasing
    pub iteration_number: u32,
    pub timestamp: DateTime<Utc>,
    pub mutation_results: Vec<MutationResult>,
    #[serde(default)]
    pub generated_tests: Vec<GeneratedTest>,
    pub stats: IterationStats,
}

impl MutationIteration {
    fn new(
        iteration_number: u32,
        mutation_results: Vec<MutationResult>,
        generated_tests: Vec<GeneratedTest>,
    ) -> Self {
        Self {
            iteration_number,
            timestamp: Utc::now(),
            stats: IterationStats::from_results(&mutation_results),
            mutation_results,
            generated_tests,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MutationSession {
    pub session_id: String,
    pub timestamp: DateTime<Utc>,
    pub project_path: PathBuf,
    pub config: RunOptions,
    pub iterations: Vec<MutationIteration>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub summary: Option<SessionSummary>,
}

/// A finished session and where its artifacts live.
#[derive(Debug)]
pub struct SessionRun {
    pub session: MutationSession,
    pub analysis: Analysis,
    pub dir: PathBuf,
}

#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error(transparent)]
    Acquire(#[from] RepoError),
    #[error("failed to scan project: {0}")]
    Scan(String),
    #[error("no eligible Solidity source files found in {}", .0.display())]
    NoSourceFiles(PathBuf),
    #[error("baseline test run failed, fix the test suite before mutation testing:\n{0}")]
    BaselineFailed(String),
    #[error("{0} is required but was not provided")]
    MissingCredential(&'static str),
    #[error("mutant generator unavailable: {0}")]
    GeneratorUnavailable(String),
    #[error("failed to persist session: {0}")]
    Persistence(String),
}

fn persistence(e: anyhow::Error) -> SessionError {
    SessionError::Persistence(format!("{:#}", e))
}

/// Yes/no questions put to the user.
#[allow(async_fn_in_trait)]
pub trait ConfirmationProvider {
    async fn confirm(&self, question: &str) -> bool;
}

/// Asks on the terminal. Anything but `y`/`yes` is a no.
pub struct StdinConfirmation;

impl ConfirmationProvider for StdinConfirmation {
    async fn confirm(&self, question: &str) -> bool {
        use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};

        let mut stdout = tokio::io::stdout();
        let _ = stdout.write_all(format!("{} [y/N] ", question).as_bytes()).await;
        let _ = stdout.flush().await;

        let mut line = String::new();
        match BufReader::new(tokio::io::stdin()).read_line(&mut line).await {
            Ok(0) | Err(_) => false,
            Ok(_) => matches!(line.trim().to_lowercase().as_str(), "y" | "yes"),
        }
    }
}

/// Answers yes to everything, for unattended runs.
pub struct AssumeYes;

impl ConfirmationProvider for AssumeYes {
    async fn confirm(&self, question: &str) -> bool {
        tracing::info!("{} (assuming yes)", question);
        true
    }
}

/// What the loop does after persisting an iteration.
enum Next {
    Retest(Vec<MutantDescriptor>),
    Regenerate,
    Finish(SessionOutcome),
}

pub struct Orchestrator<G, T, C> {
    config: Config,
    options: RunOptions,
    generator: G,
    test_generator: Option<TestGenerator<T>>,
    confirmation: C,
    interrupt: Interrupt,
}

impl<G, T, C> Orchestrator<G, T, C>
where
    G: MutantGenerator,
    T: TextGenerator,
    C: ConfirmationProvider,
{
    pub fn new(
        config: Config,
        options: RunOptions,
        generator: G,
        test_generator: Option<TestGenerator<T>>,
        confirmation: C,
        interrupt: Interrupt,
    ) -> Result<Self, SessionError> {
        if options.generate_tests && test_generator.is_none() {
            return Err(SessionError::MissingCredential("a text-generation API key"));
        }
        Ok(Self {
            config,
            options,
            generator,
            test_generator,
            confirmation,
            interrupt,
        })
    }

    /// Run a whole session against `repo`.
    ///
    /// The checkout is released on every path, including errors.
    pub async fn run(&self, repo: &RepoSpec) -> Result<SessionRun, SessionError> {
        self.enter(SessionState::Acquiring);
        let checkout = repository::acquire(repo, &self.interrupt).await?;

        let result = self.run_in(checkout.path()).await;

        repository::release(checkout, self.options.cleanup);
        result
    }

    async fn run_in(&self, project_path: &Path) -> Result<SessionRun, SessionError> {
        let session_id = format!("guardian-{}", Utc::now().format("%Y%m%d-%H%M%S"));
        let store = SessionStore::create(&self.config.session.output_dir, &session_id)
            .map_err(persistence)?;
        let mut session = MutationSession {
            session_id: store.id().to_string(),
            timestamp: Utc::now(),
            project_path: project_path.to_path_buf(),
            config: self.options.clone(),
            iterations: Vec::new(),
            summary: None,
        };

        match recover_stale_backups(project_path) {
            Ok(0) => {}
            Ok(n) => tracing::warn!("Restored {} source file(s) from an interrupted earlier run", n),
            Err(e) => tracing::warn!("Failed to check for stale backups: {:#}", e),
        }

        let files =
            generator::find_source_files(project_path, &self.config.generator.exclude_globs)
                .map_err(|e| SessionError::Scan(format!("{:#}", e)))?;
        if files.is_empty() {
            return Err(SessionError::NoSourceFiles(project_path.to_path_buf()));
        }
        tracing::info!("Found {} source file(s) to mutate", files.len());

        if !is_built(project_path) {
            self.enter(SessionState::AwaitingSetupConfirmation);
            let question = format!(
                "{} has no build output ({}). Install its dependencies and build it first. Is the project ready?",
                project_path.display(),
                BUILD_MARKERS.join(", ")
            );
            match self.ask(&question).await {
                Some(true) => {}
                Some(false) => {
                    return self.finish(
                        session,
                        &store,
                        SessionOutcome::Cancelled,
                        skipped("session cancelled before testing"),
                    )
                }
                None => {
                    return self.finish(
                        session,
                        &store,
                        SessionOutcome::Interrupted,
                        skipped("session interrupted"),
                    )
                }
            }
        }

        if self.config.evaluation.verify_baseline && !self.verify_baseline(project_path).await? {
            return self.finish(
                session,
                &store,
                SessionOutcome::Interrupted,
                skipped("session interrupted"),
            );
        }

        let options = GenerateOptions {
            operators: self.config.generator.operators.clone(),
            max_mutants: self.config.generator.mutants_per_file,
            remappings: remappings::discover(
                project_path,
                &self.config.generator.remapping_allow_list,
                &self.config.generator.fallback_remappings,
                &self.interrupt,
            )
            .await,
        };

        let mut next = Next::Regenerate;
        let mut descriptors_by_identity: HashMap<MutantIdentity, MutantDescriptor> = HashMap::new();
        let mut no_improvement = 0u32;
        let mut tests_drafted = 0usize;
        let mut test_generation = TestGeneration::NotNeeded;

        let outcome = loop {
            let iteration_number = session.iterations.len() as u32 + 1;

            let (descriptors, retest) = match std::mem::replace(&mut next, Next::Regenerate) {
                Next::Finish(outcome) => break outcome,
                Next::Retest(descriptors) => {
                    tracing::info!(
                        "Iteration {}: re-testing {} surviving mutant(s)",
                        iteration_number,
                        descriptors.len()
                    );
                    (descriptors, true)
                }
                Next::Regenerate => {
                    tracing::info!("Iteration {}: generating mutants", iteration_number);
                    self.enter(SessionState::GeneratingMutants);
                    let (descriptors, interrupted) =
                        self.generate_all(project_path, &files, &options).await?;
                    if interrupted {
                        break SessionOutcome::Interrupted;
                    }
                    descriptors_by_identity = descriptors
                        .iter()
                        .map(|d| (d.identity(), d.clone()))
                        .collect();
                    (descriptors, false)
                }
            };

            self.enter(SessionState::Evaluating);
            let (evaluated, interrupted) = self.evaluate_all(project_path, &descriptors).await;

            let results = match session.iterations.last() {
                Some(previous) if retest => {
                    mutation::supersede(&previous.mutation_results, &evaluated)
                }
                _ => evaluated,
            };

            self.enter(SessionState::Scoring);
            let analysis = scoring::score(&results, &self.config.scoring);
            tracing::info!(
                "Iteration {}: {} killed, {} survived, {} timeout, {} error (guardian score {:.2})",
                iteration_number,
                analysis.stats.killed,
                analysis.stats.survived,
                analysis.stats.timeout,
                analysis.stats.error,
                analysis.guardian_score
            );

            let survivors: Vec<MutationResult> = results
                .iter()
                .filter(|r| r.status == MutantStatus::Survived)
                .cloned()
                .collect();
            let generated_tests = if survivors.is_empty() {
                Vec::new()
            } else if interrupted {
                if tests_drafted == 0 {
                    test_generation = skipped("session interrupted");
                }
                Vec::new()
            } else {
                match &self.test_generator {
                    None => {
                        test_generation = skipped("no text-generation API key configured");
                        tracing::warn!(
                            "{} mutant(s) survived; test generation skipped (no API key configured)",
                            survivors.len()
                        );
                        Vec::new()
                    }
                    Some(test_generator) => {
                        self.enter(SessionState::GeneratingTests);
                        let tests = test_generator.generate(&survivors, project_path).await;
                        tests_drafted += tests.len();
                        test_generation = TestGeneration::Generated {
                            count: tests_drafted,
                        };
                        tests
                    }
                }
            };

            self.enter(SessionState::Persisting);
            let iteration = MutationIteration::new(iteration_number, results, generated_tests);
            store.write_iteration(&iteration).map_err(persistence)?;
            let written = store
                .write_tests(iteration_number, &iteration.generated_tests)
                .map_err(persistence)?;
            if !written.is_empty() {
                tracing::info!(
                    "Wrote {} test file(s) to {}",
                    written.len(),
                    store.tests_dir(iteration_number).display()
                );
            }
            let previous_survived = session.iterations.last().map(|it| it.stats.survived);
            let stats = iteration.stats;
            session.iterations.push(iteration);
            store.write_session(&session).map_err(persistence)?;

            if interrupted {
                break SessionOutcome::Interrupted;
            }

            next = self
                .decide_next(
                    project_path,
                    &store,
                    iteration_number,
                    stats,
                    previous_survived,
                    &mut no_improvement,
                    &descriptors_by_identity,
                    &survivors,
                )
                .await;
        };

        self.finish(session, &store, outcome, test_generation)
    }

    #[allow(clippy::too_many_arguments)]
    async fn decide_next(
        &self,
        project_path: &Path,
        store: &SessionStore,
        iteration_number: u32,
        stats: IterationStats,
        previous_survived: Option<usize>,
        no_improvement: &mut u32,
        descriptors_by_identity: &HashMap<MutantIdentity, MutantDescriptor>,
        survivors: &[MutationResult],
    ) -> Next {
        if !self.options.iterative {
            return Next::Finish(SessionOutcome::Done);
        }
        if stats.survived == 0 {
            tracing::info!("Every mutant was killed");
            return Next::Finish(SessionOutcome::Done);
        }
        if iteration_number >= self.config.session.max_iterations {
            tracing::warn!(
                "Reached the iteration limit ({}), stopping",
                self.config.session.max_iterations
            );
            return Next::Finish(SessionOutcome::Stopped);
        }

        match previous_survived {
            Some(previous) if stats.survived < previous => *no_improvement = 0,
            Some(_) => *no_improvement += 1,
            None => {}
        }

        if *no_improvement >= self.config.session.no_improvement_limit {
            let question = format!(
                "No improvement for {} consecutive iteration(s) ({} mutant(s) still survive). Keep going?",
                no_improvement, stats.survived
            );
            match self.ask(&question).await {
                Some(true) => *no_improvement = 0,
                Some(false) => return Next::Finish(SessionOutcome::Stopped),
                None => return Next::Finish(SessionOutcome::Interrupted),
            }
        }

        let question = format!(
            "{} mutant(s) survived. Add the drafted tests (see {}) to the project, then continue to re-test. Continue?",
            stats.survived,
            store.dir().join("tests").display()
        );
        match self.ask(&question).await {
            Some(true) => {}
            Some(false) => return Next::Finish(SessionOutcome::Stopped),
            None => return Next::Finish(SessionOutcome::Interrupted),
        }

        let retest: Option<Vec<MutantDescriptor>> = survivors
            .iter()
            .map(|r| descriptors_by_identity.get(&r.identity()).cloned())
            .collect();

        match retest {
            Some(descriptors)
                if descriptors
                    .iter()
                    .all(|d| d.mutant_path(project_path).exists()) =>
            {
                Next::Retest(descriptors)
            }
            _ => {
                tracing::info!("Mutant files for the survivors are gone, regenerating all mutants");
                Next::Regenerate
            }
        }
    }

    /// Run the unmutated suite. `Ok(false)` means it was interrupted.
    async fn verify_baseline(&self, project_path: &Path) -> Result<bool, SessionError> {
        let evaluation = &self.config.evaluation;
        tracing::info!("Running baseline tests: {}", evaluation.test_command);

        let result = run_with_timeout(
            shell_command(project_path, &evaluation.test_command),
            Duration::from_secs(evaluation.timeout_seconds),
            evaluation.max_output_bytes,
            Some(&self.interrupt),
        )
        .await;

        match result.status {
            CommandStatus::Success => {
                tracing::info!("Baseline tests passed in {}ms", result.duration_ms);
                Ok(true)
            }
            CommandStatus::Interrupted => Ok(false),
            _ => Err(SessionError::BaselineFailed(result.output)),
        }
    }

    /// Generate mutants for every file, skipping files that fail.
    ///
    /// The flag is set when an interrupt cut generation short.
    async fn generate_all(
        &self,
        project_path: &Path,
        files: &[PathBuf],
        options: &GenerateOptions,
    ) -> Result<(Vec<MutantDescriptor>, bool), SessionError> {
        let mut all = Vec::new();

        for (i, file) in files.iter().enumerate() {
            if self.interrupt.is_requested() {
                return Ok((all, true));
            }

            tracing::info!("[{}/{}] Generating mutants for {}", i + 1, files.len(), file.display());
            match self.generator.generate_for_file(project_path, file, options).await {
                Ok(descriptors) => {
                    tracing::info!("  {} mutant(s)", descriptors.len());
                    all.extend(descriptors);
                }
                Err(GeneratorError::Interrupted) => return Ok((all, true)),
                Err(GeneratorError::NotAvailable(message)) => {
                    return Err(SessionError::GeneratorUnavailable(message))
                }
                Err(e) => tracing::warn!("Skipping {}: {}", file.display(), e),
            }
        }

        Ok((all, false))
    }

    /// Evaluate descriptors in order. The flag is set when interrupted.
    async fn evaluate_all(
        &self,
        project_path: &Path,
        descriptors: &[MutantDescriptor],
    ) -> (Vec<MutationResult>, bool) {
        let settings = EvalSettings::from(&self.config.evaluation);
        let mut results = Vec::with_capacity(descriptors.len());

        for (i, descriptor) in descriptors.iter().enumerate() {
            if self.interrupt.is_requested() {
                return (results, true);
            }

            tracing::debug!("[{}/{}] Evaluating mutant #{}", i + 1, descriptors.len(), descriptor.id);
            match mutation::evaluate(
                project_path,
                descriptor,
                &self.config.evaluation.test_command,
                &settings,
                &self.interrupt,
            )
            .await
            {
                Ok(result) => results.push(result),
                Err(EvaluateError::Interrupted) => {
                    tracing::warn!("Interrupted during mutant #{}; source restored", descriptor.id);
                    return (results, true);
                }
                Err(e @ EvaluateError::RestoreFailed { .. }) => {
                    tracing::error!("{}", e);
                    results.push(MutationResult::from_descriptor(
                        descriptor,
                        MutantStatus::Error,
                        e.to_string(),
                    ));
                }
            }
        }

        (results, false)
    }

    async fn ask(&self, question: &str) -> Option<bool> {
        tokio::select! {
            answer = self.confirmation.confirm(question) => Some(answer),
            _ = self.interrupt.wait() => None,
        }
    }

    fn enter(&self, state: SessionState) {
        tracing::debug!("Session state: {:?}", state);
    }

    fn finish(
        &self,
        mut session: MutationSession,
        store: &SessionStore,
        outcome: SessionOutcome,
        test_generation: TestGeneration,
    ) -> Result<SessionRun, SessionError> {
        let results = session
            .iterations
            .last()
            .map(|it| it.mutation_results.as_slice())
            .unwrap_or_default();
        let analysis = scoring::score(results, &self.config.scoring);

        session.summary = Some(SessionSummary {
            outcome,
            iterations: session.iterations.len() as u32,
            stats: analysis.stats,
            basic_score: analysis.basic_score,
            guardian_score: analysis.guardian_score,
            test_generation,
        });

        store.write_session(&session).map_err(persistence)?;
        let report = render_report(&session, &analysis).map_err(persistence)?;
        store.write_report(&report).map_err(persistence)?;

        tracing::info!("Session {} finished: {}", session.session_id, outcome);
        Ok(SessionRun {
            session,
            analysis,
            dir: store.dir().to_path_buf(),
        })
    }
}

fn skipped(reason: &str) -> TestGeneration {
    TestGeneration::Skipped {
        reason: reason.to_string(),
    }
}

/// Whether the project shows signs of having been built.
fn is_built(project_path: &Path) -> bool {
    BUILD_MARKERS
        .iter()
        .any(|marker| project_path.join(marker).is_dir())
}
