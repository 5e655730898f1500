//! Mutant evaluator.
//!
//! Handles backing up the original, substituting the mutant, running the
//! project's tests, and restoring the original.
//!
//! The original source is restored on every exit path. The normal path
//! restores explicitly and checks the SHA-256 of the result; a [`RestoreGuard`]
//! covers early returns, panics and dropped futures.

use crate::mutation::{MutantDescriptor, MutantStatus, MutationResult};
use crate::process::{run_with_timeout, shell_command, CommandStatus, Interrupt};
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

/// Suffix appended to a source path for its backup copy.
const BACKUP_SUFFIX: &str = ".backup";

/// Exit code of a shell whose child was stopped by SIGINT.
const SIGINT_EXIT_CODE: i32 = 130;

/// How long a test run that looks interrupted waits for the interrupt flag.
const SIGINT_GRACE: Duration = Duration::from_millis(250);

/// Directories never searched for stale backups.
const RECOVERY_SKIP_DIRS: &[&str] = &["lib", "node_modules", "out", "cache", ".git", ".guardian"];

#[derive(Debug, thiserror::Error)]
pub enum EvaluateError {
    /// An interrupt arrived during the test run. The original has been restored.
    #[error("evaluation interrupted")]
    Interrupted,
    /// The original could not be put back, or came back different.
    #[error("CRITICAL: failed to restore {}: {message}", file.display())]
    RestoreFailed { file: PathBuf, message: String },
}

/// Limits for one test run.
#[derive(Debug, Clone)]
pub struct EvalSettings {
    pub timeout: Duration,
    pub max_output_bytes: usize,
}

impl From<&crate::config::EvaluationConfig> for EvalSettings {
    fn from(config: &crate::config::EvaluationConfig) -> Self {
        Self {
            timeout: Duration::from_secs(config.timeout_seconds),
            max_output_bytes: config.max_output_bytes,
        }
    }
}

/// Path of the backup kept for `original` during evaluation.
pub fn backup_path(original: &Path) -> PathBuf {
    let mut name = original.as_os_str().to_owned();
    name.push(BACKUP_SUFFIX);
    PathBuf::from(name)
}

/// Puts the backup back over the original unless disarmed.
struct RestoreGuard {
    original: PathBuf,
    backup: PathBuf,
    armed: bool,
}

impl RestoreGuard {
    fn new(original: PathBuf, backup: PathBuf) -> Self {
        Self {
            original,
            backup,
            armed: true,
        }
    }

    async fn restore(mut self) -> std::io::Result<()> {
        tokio::fs::rename(&self.backup, &self.original).await?;
        self.armed = false;
        Ok(())
    }
}

impl Drop for RestoreGuard {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        if let Err(e) = std::fs::rename(&self.backup, &self.original) {
            tracing::error!(
                "CRITICAL: Failed to restore {} from {}: {}",
                self.original.display(),
                self.backup.display(),
                e
            );
        }
    }
}

/// Evaluate one mutant against the project's tests.
///
/// Exit code 0 means the mutant survived, any other exit code means it was
/// killed. Machinery failures become [`MutantStatus::Error`] results, not
/// `Err`; `Err` is reserved for interrupts and failed restores.
pub async fn evaluate(
    project_path: &Path,
    descriptor: &MutantDescriptor,
    test_command: &str,
    settings: &EvalSettings,
    interrupt: &Interrupt,
) -> Result<MutationResult, EvaluateError> {
    let original = descriptor.original_path(project_path);
    let mutant = descriptor.mutant_path(project_path);
    let backup = backup_path(&original);
    let start = Instant::now();

    let error_result = |message: String| {
        tracing::warn!("Mutant #{} in {}: {}", descriptor.id, descriptor.file.display(), message);
        MutationResult::from_descriptor(descriptor, MutantStatus::Error, message)
    };

    let original_hash = match hash_file(&original).await {
        Ok(h) => h,
        Err(e) => return Ok(error_result(format!("Failed to read original: {}", e))),
    };

    if let Err(e) = tokio::fs::copy(&original, &backup).await {
        let _ = tokio::fs::remove_file(&backup).await;
        return Ok(error_result(format!("Failed to back up original: {}", e)));
    }

    let guard = RestoreGuard::new(original.clone(), backup.clone());

    let outcome = if !mutant.exists() {
        Err(format!("Mutant file not found: {}", mutant.display()))
    } else if let Err(e) = tokio::fs::copy(&mutant, &original).await {
        Err(format!("Failed to substitute mutant: {}", e))
    } else {
        let cmd = shell_command(project_path, test_command);
        Ok(run_with_timeout(cmd, settings.timeout, settings.max_output_bytes, Some(interrupt)).await)
    };

    if let Err(e) = guard.restore().await {
        let message = e.to_string();
        tracing::error!("CRITICAL: Failed to restore {}: {}", original.display(), message);
        return Err(EvaluateError::RestoreFailed {
            file: descriptor.file.clone(),
            message,
        });
    }

    match hash_file(&original).await {
        Ok(h) if h == original_hash => {}
        Ok(_) => {
            tracing::error!(
                "CRITICAL: {} differs from its pre-evaluation content after restore",
                original.display()
            );
            return Err(EvaluateError::RestoreFailed {
                file: descriptor.file.clone(),
                message: "content hash changed after restore".to_string(),
            });
        }
        Err(e) => {
            return Err(EvaluateError::RestoreFailed {
                file: descriptor.file.clone(),
                message: format!("cannot verify restored file: {}", e),
            });
        }
    }

    let run = match outcome {
        Ok(run) => run,
        Err(message) => return Ok(error_result(message)),
    };

    // A test process signalled along with us can exit before the Ctrl-C
    // listener has raised the flag.
    if matches!(run.status, CommandStatus::Failed(Some(SIGINT_EXIT_CODE)) | CommandStatus::Failed(None))
        && !interrupt.is_requested()
    {
        let _ = tokio::time::timeout(SIGINT_GRACE, interrupt.wait()).await;
    }
    if interrupt.is_requested() {
        return Err(EvaluateError::Interrupted);
    }

    let status = match run.status {
        CommandStatus::Success => MutantStatus::Survived,
        CommandStatus::Failed(_) => MutantStatus::Killed,
        CommandStatus::TimedOut => MutantStatus::Timeout,
        CommandStatus::SpawnFailed => MutantStatus::Error,
        CommandStatus::Interrupted => return Err(EvaluateError::Interrupted),
    };

    let result = MutationResult::from_descriptor(descriptor, status, run.output);
    tracing::info!(
        "Mutant #{} {} ({}) = {} ({}ms)",
        descriptor.id,
        result.location(),
        descriptor.mutation_type,
        status,
        start.elapsed().as_millis()
    );

    Ok(result)
}

async fn hash_file(path: &Path) -> std::io::Result<Vec<u8>> {
    let content = tokio::fs::read(path).await?;
    Ok(Sha256::digest(&content).to_vec())
}

/// Restore `*.sol.backup` files left behind by an interrupted earlier run.
///
/// Returns the number of files restored.
pub fn recover_stale_backups(project_path: &Path) -> anyhow::Result<usize> {
    let mut restored = 0;

    for entry in walkdir::WalkDir::new(project_path)
        .follow_links(false)
        .into_iter()
        .filter_entry(|e| {
            e.path() == project_path
                || !RECOVERY_SKIP_DIRS.contains(&e.file_name().to_string_lossy().as_ref())
        })
    {
        let entry = entry?;
        let path = entry.path();
        let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
            continue;
        };
        if !entry.file_type().is_file() || !name.ends_with(".sol.backup") {
            continue;
        }

        let original = path.with_file_name(name.trim_end_matches(BACKUP_SUFFIX));
        tracing::warn!(
            "Found stale backup {}, restoring {}",
            path.display(),
            original.display()
        );
        std::fs::rename(path, &original)?;
        restored += 1;
    }

    Ok(restored)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mutation::MutationType;

    const ORIGINAL: &str = "contract Token {\n    function add(uint a, uint b) public returns (uint) { return a + b; }\n}\n";
    const MUTATED: &str = "contract Token {\n    function add(uint a, uint b) public returns (uint) { return a - b; }\n}\n";

    fn setup(with_mutant: bool) -> (tempfile::TempDir, MutantDescriptor) {
        let project = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(project.path().join("src")).unwrap();
        std::fs::write(project.path().join("src/Token.sol"), ORIGINAL).unwrap();

        let descriptor = MutantDescriptor {
            id: 1,
            mutation_type: MutationType::BinaryOp,
            file: PathBuf::from("src/Token.sol"),
            line: 2,
            column: 68,
            original: "a + b".to_string(),
            mutated: "a - b".to_string(),
            source_output_dir: PathBuf::from(".guardian/mutants/src_Token"),
        };

        if with_mutant {
            let mutant = descriptor.mutant_path(project.path());
            std::fs::create_dir_all(mutant.parent().unwrap()).unwrap();
            std::fs::write(&mutant, MUTATED).unwrap();
        }

        (project, descriptor)
    }

    fn settings() -> EvalSettings {
        EvalSettings {
            timeout: Duration::from_secs(10),
            max_output_bytes: 10_000,
        }
    }

    fn assert_restored(project: &Path) {
        let content = std::fs::read_to_string(project.join("src/Token.sol")).unwrap();
        assert_eq!(content, ORIGINAL);
        assert!(!project.join("src/Token.sol.backup").exists());
    }

    // =========================================================================
    // Classification
    // =========================================================================

    #[tokio::test]
    async fn test_passing_tests_mean_survived() {
        let (project, d) = setup(true);
        let result = evaluate(project.path(), &d, "exit 0", &settings(), &Interrupt::new())
            .await
            .unwrap();
        assert_eq!(result.status, MutantStatus::Survived);
        assert_restored(project.path());
    }

    #[tokio::test]
    async fn test_failing_tests_mean_killed() {
        let (project, d) = setup(true);
        let result = evaluate(
            project.path(),
            &d,
            "echo 'assertion failed'; exit 1",
            &settings(),
            &Interrupt::new(),
        )
        .await
        .unwrap();
        assert_eq!(result.status, MutantStatus::Killed);
        assert!(result.test_output.contains("assertion failed"));
        assert_restored(project.path());
    }

    #[tokio::test]
    async fn test_tests_run_against_substituted_mutant() {
        let (project, d) = setup(true);
        // Fails only when the mutated source is in place
        let result = evaluate(
            project.path(),
            &d,
            "grep -q 'a - b' src/Token.sol && exit 1 || exit 0",
            &settings(),
            &Interrupt::new(),
        )
        .await
        .unwrap();
        assert_eq!(result.status, MutantStatus::Killed);
        assert_restored(project.path());
    }

    #[tokio::test]
    async fn test_timeout_is_its_own_status() {
        let (project, d) = setup(true);
        let short = EvalSettings {
            timeout: Duration::from_millis(200),
            max_output_bytes: 1000,
        };
        let result = evaluate(project.path(), &d, "sleep 5", &short, &Interrupt::new())
            .await
            .unwrap();
        assert_eq!(result.status, MutantStatus::Timeout);
        assert_restored(project.path());
    }

    #[tokio::test]
    async fn test_timeout_kills_processes_started_by_tests() {
        let (project, d) = setup(true);
        let short = EvalSettings {
            timeout: Duration::from_millis(300),
            max_output_bytes: 1000,
        };
        let result = evaluate(
            project.path(),
            &d,
            "sh -c 'sleep 1; cat src/Token.sol > seen.txt'; true",
            &short,
            &Interrupt::new(),
        )
        .await
        .unwrap();
        assert_eq!(result.status, MutantStatus::Timeout);
        assert_restored(project.path());

        tokio::time::sleep(Duration::from_millis(1500)).await;
        assert!(!project.path().join("seen.txt").exists());
    }

    #[tokio::test]
    async fn test_sigint_exit_plain_is_killed() {
        let (project, d) = setup(true);
        let result = evaluate(project.path(), &d, "exit 130", &settings(), &Interrupt::new())
            .await
            .unwrap();
        assert_eq!(result.status, MutantStatus::Killed);
        assert_restored(project.path());
    }

    #[tokio::test]
    async fn test_sigint_exit_before_flag_is_interrupted() {
        let (project, d) = setup(true);
        let interrupt = Interrupt::new();
        let trigger = interrupt.clone();
        // The test process sees SIGINT first and the flag is raised shortly after
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            trigger.trigger();
        });

        let err = evaluate(project.path(), &d, "exit 130", &settings(), &interrupt)
            .await
            .unwrap_err();
        assert!(matches!(err, EvaluateError::Interrupted));
        assert_restored(project.path());
    }

    #[tokio::test]
    async fn test_output_is_truncated() {
        let (project, d) = setup(true);
        let small = EvalSettings {
            timeout: Duration::from_secs(10),
            max_output_bytes: 16,
        };
        let result = evaluate(
            project.path(),
            &d,
            "yes | head -n 500; exit 1",
            &small,
            &Interrupt::new(),
        )
        .await
        .unwrap();
        assert!(result.test_output.ends_with("...(truncated)"));
    }

    // =========================================================================
    // Machinery failures
    // =========================================================================

    #[tokio::test]
    async fn test_missing_mutant_is_error_and_tests_never_run() {
        let (project, d) = setup(false);
        let marker = project.path().join("ran");
        let result = evaluate(
            project.path(),
            &d,
            "touch ran; exit 1",
            &settings(),
            &Interrupt::new(),
        )
        .await
        .unwrap();
        assert_eq!(result.status, MutantStatus::Error);
        assert!(result.test_output.contains("Mutant file not found"));
        assert!(!marker.exists());
        assert_restored(project.path());
    }

    #[tokio::test]
    async fn test_missing_original_is_error() {
        let (project, d) = setup(true);
        std::fs::remove_file(project.path().join("src/Token.sol")).unwrap();
        let result = evaluate(project.path(), &d, "exit 0", &settings(), &Interrupt::new())
            .await
            .unwrap();
        assert_eq!(result.status, MutantStatus::Error);
        assert!(!project.path().join("src/Token.sol").exists());
        assert!(!project.path().join("src/Token.sol.backup").exists());
    }

    // =========================================================================
    // Restore
    // =========================================================================

    #[tokio::test]
    async fn test_interrupt_restores_before_returning() {
        let (project, d) = setup(true);
        let interrupt = Interrupt::new();
        interrupt.trigger();
        let err = evaluate(project.path(), &d, "sleep 5", &settings(), &interrupt)
            .await
            .unwrap_err();
        assert!(matches!(err, EvaluateError::Interrupted));
        assert_restored(project.path());
    }

    #[tokio::test]
    async fn test_dropped_evaluation_still_restores() {
        let (project, d) = setup(true);
        let path = project.path().to_path_buf();
        let interrupt = Interrupt::new();
        let s = settings();

        // Cancel mid test-run by letting the outer timeout drop the future
        let _ = tokio::time::timeout(
            Duration::from_millis(300),
            evaluate(&path, &d, "sleep 5", &s, &interrupt),
        )
        .await;

        assert_restored(project.path());
    }

    #[test]
    fn test_guard_restores_on_drop() {
        let dir = tempfile::tempdir().unwrap();
        let original = dir.path().join("A.sol");
        let backup = backup_path(&original);
        std::fs::write(&original, "original").unwrap();
        std::fs::copy(&original, &backup).unwrap();

        {
            let _guard = RestoreGuard::new(original.clone(), backup.clone());
            std::fs::write(&original, "mutated").unwrap();
        }

        assert_eq!(std::fs::read_to_string(&original).unwrap(), "original");
        assert!(!backup.exists());
    }

    #[test]
    fn test_backup_path() {
        assert_eq!(
            backup_path(Path::new("/p/src/Token.sol")),
            PathBuf::from("/p/src/Token.sol.backup")
        );
    }

    #[test]
    fn test_recover_stale_backups() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("src")).unwrap();
        std::fs::create_dir_all(dir.path().join("lib/dep")).unwrap();
        std::fs::write(dir.path().join("src/Token.sol"), "mutated").unwrap();
        std::fs::write(dir.path().join("src/Token.sol.backup"), "original").unwrap();
        std::fs::write(dir.path().join("lib/dep/X.sol.backup"), "untouched").unwrap();

        let restored = recover_stale_backups(dir.path()).unwrap();

        assert_eq!(restored, 1);
        assert_eq!(
            std::fs::read_to_string(dir.path().join("src/Token.sol")).unwrap(),
            "original"
        );
        assert!(!dir.path().join("src/Token.sol.backup").exists());
        assert!(dir.path().join("lib/dep/X.sol.backup").exists());
    }
}
