//! Mutant generation through an external generator tool.
//!
//! The generator runs once per source file. A file that yields no mutants
//! (an interface, a library of constants) is a valid outcome, not an error.

mod gambit;
pub mod remappings;

pub use gambit::Gambit;

use crate::mutation::MutantDescriptor;
use anyhow::Result;
use std::path::{Path, PathBuf};

/// Directories never scanned for contract sources.
const SKIP_DIRS: &[&str] = &[
    "lib",
    "node_modules",
    "out",
    "cache",
    "artifacts",
    "broadcast",
    "script",
    "target",
];

/// Per-file generation options.
#[derive(Debug, Clone)]
pub struct GenerateOptions {
    /// Mutation operator names to enable.
    pub operators: Vec<String>,
    pub max_mutants: usize,
    /// Import remappings, already filtered to the allow-list.
    pub remappings: Vec<String>,
}

#[derive(Debug, thiserror::Error)]
pub enum GeneratorError {
    #[error("generator not available: {0}")]
    NotAvailable(String),
    #[error("cannot install the generator automatically: {0}")]
    InstallUnavailable(String),
    #[error("generator failed for {}: {output}", file.display())]
    Failed { file: PathBuf, output: String },
    #[error("generator timed out for {} after {seconds} seconds", file.display())]
    TimedOut { file: PathBuf, seconds: u64 },
    #[error("generator interrupted")]
    Interrupted,
    #[error("generator I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Something that turns one source file into mutant descriptors.
#[allow(async_fn_in_trait)]
pub trait MutantGenerator {
    /// Generate mutants for `file` (relative to `project_path`).
    async fn generate_for_file(
        &self,
        project_path: &Path,
        file: &Path,
        options: &GenerateOptions,
    ) -> Result<Vec<MutantDescriptor>, GeneratorError>;
}

/// Whether a path looks like a test, a test helper or a mock.
pub fn is_test_or_mock(relative: &Path) -> bool {
    if relative
        .components()
        .any(|c| matches!(c.as_os_str().to_str(), Some("test") | Some("tests")))
    {
        return true;
    }

    let name = relative
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or("");
    let stem = relative
        .file_stem()
        .and_then(|n| n.to_str())
        .unwrap_or("");

    if stem.ends_with(".test") || stem.ends_with(".t") || stem.ends_with(".s") {
        return true;
    }
    if name.starts_with("Test") || stem.ends_with("Test") {
        return true;
    }

    relative.to_string_lossy().to_lowercase().contains("mock")
}

/// Find mutable Solidity sources under `project_path`.
///
/// Returns paths relative to the project, sorted for a stable run order.
pub fn find_source_files(project_path: &Path, exclude_globs: &[String]) -> Result<Vec<PathBuf>> {
    let mut files = Vec::new();

    if !project_path.is_dir() {
        return Ok(files);
    }

    let root_dir = project_path.to_path_buf();

    for entry in walkdir::WalkDir::new(project_path)
        .follow_links(false)
        .into_iter()
        .filter_entry(|e| {
            // Don't filter the root directory itself (may be a temp dir starting with .)
            if e.path() == root_dir {
                return true;
            }
            let name = e.file_name().to_string_lossy();
            !name.starts_with('.') && !SKIP_DIRS.contains(&name.as_ref())
        })
    {
        let entry = entry?;
        let path = entry.path();

        if !path.is_file() || !path.extension().is_some_and(|ext| ext == "sol") {
            continue;
        }

        let relative = path.strip_prefix(project_path).unwrap_or(path).to_path_buf();
        if is_test_or_mock(&relative) {
            tracing::debug!("Skipping test/mock file {}", relative.display());
            continue;
        }

        let relative_str = relative.to_string_lossy();
        if exclude_globs
            .iter()
            .any(|g| glob_match::glob_match(g, &relative_str))
        {
            tracing::debug!("Skipping excluded file {}", relative.display());
            continue;
        }

        files.push(relative);
    }

    files.sort();
    Ok(files)
}
