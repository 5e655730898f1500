//! Gambit adapter: config file, invocation and `mutants.log` parsing.

use super::{GenerateOptions, GeneratorError, MutantGenerator};
use crate::config::GeneratorConfig;
use crate::mutation::{MutantDescriptor, MutationType};
use crate::process::{program_available, run_with_timeout, CommandStatus, Interrupt};
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::process::Command;

const GAMBIT_GIT_URL: &str = "https://github.com/Certora/gambit.git";

/// Generator logs can be large; keep plenty for diagnostics.
const GENERATOR_OUTPUT_BYTES: usize = 1024 * 1024;

/// Timeout for building the generator from source.
const INSTALL_TIMEOUT: Duration = Duration::from_secs(30 * 60);

/// Config file consumed by `gambit mutate --json`.
#[derive(Debug, Serialize)]
struct GambitConfig {
    filename: PathBuf,
    sourceroot: PathBuf,
    skip_validate: bool,
    mutations: Vec<String>,
    outdir: PathBuf,
    solc: String,
    num_mutants: usize,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    solc_remappings: Vec<String>,
}

/// Runs the Gambit mutant generator.
pub struct Gambit {
    binary: String,
    solc: String,
    timeout: Duration,
    work_dir: PathBuf,
    interrupt: Interrupt,
}

impl Gambit {
    pub fn new(config: &GeneratorConfig, interrupt: Interrupt) -> Self {
        Self {
            binary: config.binary.clone(),
            solc: config.solc.clone(),
            timeout: Duration::from_secs(config.timeout_seconds),
            work_dir: config.work_dir.clone(),
            interrupt,
        }
    }

    /// Check if the generator binary can be run
    pub async fn check_available(&self) -> bool {
        program_available(&self.binary, &["--version"]).await
    }

    /// Build the generator from source with cargo.
    ///
    /// Fails with [`GeneratorError::InstallUnavailable`] and manual steps when no
    /// cargo toolchain is present.
    pub async fn install(&self) -> Result<(), GeneratorError> {
        if !program_available("cargo", &["--version"]).await {
            return Err(GeneratorError::InstallUnavailable(format!(
                "cargo not found. Install Rust from https://rustup.rs, then run: cargo install --locked --git {}",
                GAMBIT_GIT_URL
            )));
        }

        tracing::info!("Building gambit from {} (this can take several minutes)", GAMBIT_GIT_URL);

        let mut cmd = Command::new("cargo");
        cmd.args(["install", "--locked", "--git", GAMBIT_GIT_URL]);
        let result = run_with_timeout(
            cmd,
            INSTALL_TIMEOUT,
            GENERATOR_OUTPUT_BYTES,
            Some(&self.interrupt),
        )
        .await;

        match result.status {
            CommandStatus::Success => {
                tracing::info!("gambit installed in {}ms", result.duration_ms);
                Ok(())
            }
            CommandStatus::Interrupted => Err(GeneratorError::Interrupted),
            _ => Err(GeneratorError::NotAvailable(format!(
                "cargo install failed: {}",
                result.output.trim()
            ))),
        }
    }

    /// Output directory for one source file, relative to the project.
    fn output_dir_for(&self, file: &Path) -> PathBuf {
        self.work_dir.join("mutants").join(slug(file))
    }
}

impl MutantGenerator for Gambit {
    async fn generate_for_file(
        &self,
        project_path: &Path,
        file: &Path,
        options: &GenerateOptions,
    ) -> Result<Vec<MutantDescriptor>, GeneratorError> {
        let output_dir = self.output_dir_for(file);
        let abs_output_dir = project_path.join(&output_dir);
        let config_dir = project_path.join(&self.work_dir).join("configs");
        let config_path = config_dir.join(format!("{}.json", slug(file)));

        if abs_output_dir.exists() {
            tokio::fs::remove_dir_all(&abs_output_dir).await?;
        }
        tokio::fs::create_dir_all(&config_dir).await?;

        // Gambit resolves relative paths against the config file, so pass absolute ones
        let config = GambitConfig {
            filename: project_path.join(file),
            sourceroot: project_path.to_path_buf(),
            skip_validate: true,
            mutations: options.operators.clone(),
            outdir: abs_output_dir.clone(),
            solc: self.solc.clone(),
            num_mutants: options.max_mutants,
            solc_remappings: options.remappings.clone(),
        };
        let json = serde_json::to_string_pretty(&config)
            .map_err(|e| GeneratorError::Io(std::io::Error::other(e)))?;
        tokio::fs::write(&config_path, json).await?;

        tracing::debug!("Running {} for {}", self.binary, file.display());

        let mut cmd = Command::new(&self.binary);
        cmd.arg("mutate")
            .arg("--json")
            .arg(&config_path)
            .current_dir(project_path);

        let result = run_with_timeout(
            cmd,
            self.timeout,
            GENERATOR_OUTPUT_BYTES,
            Some(&self.interrupt),
        )
        .await;

        match result.status {
            CommandStatus::Success => {}
            CommandStatus::Failed(_) => {
                return Err(GeneratorError::Failed {
                    file: file.to_path_buf(),
                    output: result.output.trim().to_string(),
                })
            }
            CommandStatus::TimedOut => {
                return Err(GeneratorError::TimedOut {
                    file: file.to_path_buf(),
                    seconds: self.timeout.as_secs(),
                })
            }
            CommandStatus::SpawnFailed => return Err(GeneratorError::NotAvailable(result.output)),
            CommandStatus::Interrupted => return Err(GeneratorError::Interrupted),
        }

        let log_path = abs_output_dir.join("mutants.log");
        if !log_path.exists() {
            tracing::debug!("No mutants.log for {}, assuming zero mutants", file.display());
            return Ok(Vec::new());
        }

        let log = tokio::fs::read_to_string(&log_path).await?;
        let descriptors = parse_log(&log, project_path, &output_dir);

        tracing::debug!("Parsed {} mutants for {}", descriptors.len(), file.display());
        Ok(descriptors)
    }
}

/// Flatten a relative source path into a directory-safe name.
fn slug(file: &Path) -> String {
    file.with_extension("")
        .to_string_lossy()
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' { c } else { '_' })
        .collect()
}

/// Parse `mutants.log` into descriptors.
///
/// Each record is `id,type,file,line:column,original,mutated`, with CSV
/// quoting around snippets that contain commas. Unquoted fields beyond the
/// sixth are taken to belong to the mutated snippet. Malformed records are
/// skipped with a warning.
pub(crate) fn parse_log(
    contents: &str,
    project_path: &Path,
    output_dir: &Path,
) -> Vec<MutantDescriptor> {
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(false)
        .flexible(true)
        .from_reader(contents.as_bytes());

    let mut descriptors = Vec::new();

    for result in reader.records() {
        let record = match result {
            Ok(r) => r,
            Err(e) => {
                tracing::warn!("Skipping unreadable mutants.log record: {}", e);
                continue;
            }
        };
        let line = record.position().map(|p| p.line()).unwrap_or(0);

        if record.len() < 6 {
            tracing::warn!(
                "Skipping malformed mutants.log line {} ({} fields): {:?}",
                line,
                record.len(),
                record
            );
            continue;
        }

        let Ok(id) = record[0].trim().parse::<u32>() else {
            tracing::warn!("Skipping mutants.log line {}: bad id '{}'", line, &record[0]);
            continue;
        };

        let Some((line_no, column)) = parse_position(&record[3]) else {
            tracing::warn!(
                "Skipping mutants.log line {}: bad position '{}'",
                line,
                &record[3]
            );
            continue;
        };

        let file = PathBuf::from(record[2].trim());
        let file = file
            .strip_prefix(project_path)
            .map(Path::to_path_buf)
            .unwrap_or(file);

        descriptors.push(MutantDescriptor {
            id,
            mutation_type: MutationType::from(&record[1]),
            file,
            line: line_no,
            column,
            original: record[4].to_string(),
            mutated: record.iter().skip(5).collect::<Vec<_>>().join(","),
            source_output_dir: output_dir.to_path_buf(),
        });
    }

    descriptors
}

/// Parse `line:column`; a missing column defaults to 1.
fn parse_position(field: &str) -> Option<(usize, usize)> {
    let mut parts = field.trim().splitn(2, ':');
    let line = parts.next()?.trim().parse().ok()?;
    let column = match parts.next() {
        Some(c) => c.trim().parse().ok()?,
        None => 1,
    };
    Some((line, column))
}
