//! Repository acquisition: shallow clones into temp directories, or local paths.
//!
//! A [`Checkout`] remembers whether this module created the directory. Only
//! provider-created clones are ever removed; a caller-supplied local path
//! owns no temp directory, so [`release`] has nothing it could delete.

use crate::config::Secret;
use crate::process::{run_with_timeout, CommandStatus, Interrupt};
use reqwest::Url;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tempfile::TempDir;
use tokio::process::Command;

/// Timeout for `git clone`.
const CLONE_TIMEOUT: Duration = Duration::from_secs(300);

/// Where the contract project comes from.
#[derive(Debug, Clone)]
pub enum RepoSpec {
    /// Shallow-clone `branch` of `url`.
    Remote {
        url: String,
        branch: String,
        token: Option<Secret>,
    },
    /// Use an existing directory in place.
    Local { path: PathBuf },
}

impl RepoSpec {
    /// Where the project comes from, with any URL credentials removed.
    pub fn display_source(&self) -> String {
        match self {
            RepoSpec::Local { path } => path.display().to_string(),
            RepoSpec::Remote { url, .. } => strip_credentials(url),
        }
    }
}

/// `url` without any userinfo it carries.
fn strip_credentials(url: &str) -> String {
    match Url::parse(url) {
        Ok(mut parsed) if !parsed.username().is_empty() || parsed.password().is_some() => {
            let _ = parsed.set_username("");
            let _ = parsed.set_password(None);
            parsed.to_string()
        }
        _ => url.to_string(),
    }
}

#[derive(Debug, thiserror::Error)]
pub enum RepoError {
    #[error("project path not found: {}", .0.display())]
    PathNotFound(PathBuf),
    #[error("clone failed: {0}")]
    CloneFailed(String),
}

enum Origin {
    Local,
    Cloned(TempDir),
}

/// A working directory containing the contract project.
pub struct Checkout {
    path: PathBuf,
    origin: Origin,
}

impl Checkout {
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Whether this checkout was created by [`acquire`].
    pub fn is_cloned(&self) -> bool {
        matches!(self.origin, Origin::Cloned(_))
    }
}

impl std::fmt::Debug for Checkout {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Checkout")
            .field("path", &self.path)
            .field("cloned", &self.is_cloned())
            .finish()
    }
}

/// Provide a project directory for `spec`.
pub async fn acquire(spec: &RepoSpec, interrupt: &Interrupt) -> Result<Checkout, RepoError> {
    match spec {
        RepoSpec::Local { path } => acquire_local(path),
        RepoSpec::Remote { url, branch, token } => {
            clone(url, branch, token.as_ref(), interrupt).await
        }
    }
}

fn acquire_local(path: &Path) -> Result<Checkout, RepoError> {
    let resolved = path
        .canonicalize()
        .map_err(|_| RepoError::PathNotFound(path.to_path_buf()))?;
    if !resolved.is_dir() {
        return Err(RepoError::PathNotFound(path.to_path_buf()));
    }

    tracing::info!("Using local project at {}", resolved.display());
    Ok(Checkout {
        path: resolved,
        origin: Origin::Local,
    })
}

async fn clone(
    url: &str,
    branch: &str,
    token: Option<&Secret>,
    interrupt: &Interrupt,
) -> Result<Checkout, RepoError> {
    let temp_dir = TempDir::with_prefix("guardian-")
        .map_err(|e| RepoError::CloneFailed(format!("Failed to create temp directory: {}", e)))?;
    let target = temp_dir.path().join("repo");

    let clone_url = match token {
        Some(token) => authenticated_url(url, token),
        None => url.to_string(),
    };

    let shown_url = strip_credentials(url);
    tracing::info!("Cloning {} (branch {}) into {}", shown_url, branch, target.display());

    let mut cmd = Command::new("git");
    cmd.arg("clone")
        .arg("--depth")
        .arg("1")
        .arg("--branch")
        .arg(branch)
        .arg(&clone_url)
        .arg(&target)
        .env("GIT_TERMINAL_PROMPT", "0");

    let result = run_with_timeout(cmd, CLONE_TIMEOUT, 8192, Some(interrupt)).await;

    let scrub = |text: &str| {
        let text = text.replace(url, &shown_url);
        match token {
            Some(token) => token.redact(&text),
            None => text,
        }
    };

    match result.status {
        CommandStatus::Success => {
            tracing::info!("Clone finished in {}ms", result.duration_ms);
            Ok(Checkout {
                path: target,
                origin: Origin::Cloned(temp_dir),
            })
        }
        CommandStatus::TimedOut => Err(RepoError::CloneFailed(format!(
            "git clone timed out after {} seconds",
            CLONE_TIMEOUT.as_secs()
        ))),
        CommandStatus::Interrupted => Err(RepoError::CloneFailed("clone interrupted".to_string())),
        CommandStatus::Failed(_) | CommandStatus::SpawnFailed => {
            Err(RepoError::CloneFailed(scrub(result.output.trim())))
        }
    }
}

/// Embed `token` as the userinfo of an http(s) clone URL.
///
/// Other URL forms (ssh, scp-like) are returned unchanged.
fn authenticated_url(url: &str, token: &Secret) -> String {
    let Ok(mut parsed) = Url::parse(url) else {
        tracing::warn!("Access token ignored: clone URL is not an http(s) URL");
        return url.to_string();
    };
    if !matches!(parsed.scheme(), "http" | "https") {
        tracing::warn!("Access token ignored: clone URL is not an http(s) URL");
        return url.to_string();
    }
    if parsed.set_username("x-access-token").is_err()
        || parsed.set_password(Some(token.expose())).is_err()
    {
        return url.to_string();
    }
    parsed.to_string()
}

/// Give the checkout back.
///
/// Clones are deleted when `cleanup` is set and kept otherwise. Local paths are
/// never touched. Failures are logged, never returned.
pub fn release(checkout: Checkout, cleanup: bool) {
    match checkout.origin {
        Origin::Local => {
            tracing::debug!("Leaving local project {} in place", checkout.path.display());
        }
        Origin::Cloned(temp_dir) if cleanup => {
            let root = temp_dir.path().to_path_buf();
            match temp_dir.close() {
                Ok(()) => tracing::info!("Removed clone at {}", root.display()),
                Err(e) => tracing::warn!("Failed to remove clone at {}: {}", root.display(), e),
            }
        }
        Origin::Cloned(temp_dir) => {
            let root = temp_dir.keep();
            tracing::info!("Clone kept at {}", root.join("repo").display());
        }
    }
}
