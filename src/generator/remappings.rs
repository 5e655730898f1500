//! Import-remapping discovery for the generator.
//!
//! Forwarding every remapping a build tool reports has been seen to crash the
//! generator, so only remappings for allow-listed libraries are passed on.
//! Discovery tries each [`Strategy`] in order and falls back to configured
//! defaults when none of them produces anything usable.

use crate::process::{run_with_timeout, Interrupt};
use std::path::Path;
use std::time::Duration;
use tokio::process::Command;

/// Ways of finding a project's remappings, tried in declaration order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Strategy {
    /// stdout of `forge remappings`.
    ForgeRemappings,
    /// A `remappings.txt` at the project root.
    RemappingsFile,
}

impl Strategy {
    pub const ORDER: [Strategy; 2] = [Strategy::ForgeRemappings, Strategy::RemappingsFile];

    /// Raw remapping lines, or `None` when this strategy cannot run.
    async fn raw(&self, project_path: &Path, interrupt: &Interrupt) -> Option<String> {
        match self {
            Strategy::ForgeRemappings => {
                let mut cmd = Command::new("forge");
                cmd.arg("remappings").current_dir(project_path);
                let result =
                    run_with_timeout(cmd, Duration::from_secs(60), 64 * 1024, Some(interrupt))
                        .await;
                result.success().then_some(result.output)
            }
            Strategy::RemappingsFile => {
                let path = project_path.join("remappings.txt");
                if !path.exists() {
                    return None;
                }
                tokio::fs::read_to_string(path).await.ok()
            }
        }
    }
}

/// Discover allow-listed remappings for `project_path`.
pub async fn discover(
    project_path: &Path,
    allow_list: &[String],
    fallback: &[String],
    interrupt: &Interrupt,
) -> Vec<String> {
    for strategy in Strategy::ORDER {
        let Some(raw) = strategy.raw(project_path, interrupt).await else {
            tracing::debug!("Remapping strategy {:?} unavailable", strategy);
            continue;
        };

        let allowed = filter_allowed(&parse_lines(&raw), allow_list);
        if !allowed.is_empty() {
            tracing::info!(
                "Using {} remapping(s) from {:?}",
                allowed.len(),
                strategy
            );
            return absolutize(allowed, project_path);
        }
        tracing::debug!("Remapping strategy {:?} found nothing usable", strategy);
    }

    tracing::info!(
        "Remapping discovery found nothing, using {} default remapping(s)",
        fallback.len()
    );
    absolutize(fallback.to_vec(), project_path)
}

/// Keep lines that look like `prefix=target`.
fn parse_lines(raw: &str) -> Vec<String> {
    raw.lines()
        .map(str::trim)
        .filter(|l| !l.is_empty() && !l.starts_with('#') && l.contains('='))
        .map(String::from)
        .collect()
}

/// Keep remappings whose prefix starts with an allow-listed library, deduplicated.
fn filter_allowed(remappings: &[String], allow_list: &[String]) -> Vec<String> {
    let mut out: Vec<String> = Vec::new();
    for remapping in remappings {
        let Some((key, _)) = remapping.split_once('=') else {
            continue;
        };
        // Drop a foundry context prefix, e.g. `src/:@oz/=...`
        let prefix = key.rsplit(':').next().unwrap_or(key);
        if allow_list.iter().any(|a| prefix.starts_with(a.as_str()))
            && !out.contains(remapping)
        {
            out.push(remapping.clone());
        }
    }
    out
}

/// Resolve relative remapping targets against the project root.
fn absolutize(remappings: Vec<String>, project_path: &Path) -> Vec<String> {
    remappings
        .into_iter()
        .map(|r| match r.split_once('=') {
            Some((key, target)) if !Path::new(target).is_absolute() => {
                let mut resolved = project_path.join(target).to_string_lossy().to_string();
                if target.ends_with('/') && !resolved.ends_with('/') {
                    resolved.push('/');
                }
                format!("{}={}", key, resolved)
            }
            _ => r,
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn allow() -> Vec<String> {
        vec!["@openzeppelin/".to_string(), "forge-std/".to_string()]
    }

    #[test]
    fn test_parse_lines_skips_noise() {
        let raw = "# comment\n\nforge-std/=lib/forge-std/src/\nnot a remapping\n";
        assert_eq!(parse_lines(raw), vec!["forge-std/=lib/forge-std/src/"]);
    }

    #[test]
    fn test_filter_allowed() {
        let found = vec![
            "@openzeppelin/=lib/openzeppelin-contracts/".to_string(),
            "erc4626-tests/=lib/openzeppelin-contracts/lib/erc4626-tests/".to_string(),
            "forge-std/=lib/forge-std/src/".to_string(),
            "forge-std/=lib/forge-std/src/".to_string(),
            "src/:@openzeppelin/contracts/=lib/oz/contracts/".to_string(),
        ];
        let allowed = filter_allowed(&found, &allow());
        assert_eq!(
            allowed,
            vec![
                "@openzeppelin/=lib/openzeppelin-contracts/".to_string(),
                "forge-std/=lib/forge-std/src/".to_string(),
                "src/:@openzeppelin/contracts/=lib/oz/contracts/".to_string(),
            ]
        );
    }

    #[test]
    fn test_absolutize_keeps_trailing_slash() {
        let out = absolutize(
            vec!["forge-std/=lib/forge-std/src/".to_string()],
            Path::new("/work/p"),
        );
        assert_eq!(out, vec!["forge-std/=/work/p/lib/forge-std/src/"]);
    }

    #[test]
    fn test_absolutize_leaves_absolute_targets() {
        let out = absolutize(vec!["a/=/opt/a/".to_string()], Path::new("/work/p"));
        assert_eq!(out, vec!["a/=/opt/a/"]);
    }

    #[tokio::test]
    async fn test_discover_reads_remappings_file() {
        let project = tempfile::tempdir().unwrap();
        std::fs::write(
            project.path().join("remappings.txt"),
            "forge-std/=lib/forge-std/src/\nweird-lib/=lib/weird/\n",
        )
        .unwrap();

        let found = discover(project.path(), &allow(), &[], &Interrupt::new()).await;

        // `forge remappings` may or may not exist here; either way weird-lib is dropped
        assert!(found.iter().all(|r| !r.starts_with("weird-lib/")));
        assert!(found.iter().any(|r| r.starts_with("forge-std/=")));
    }

    #[tokio::test]
    async fn test_discover_falls_back_to_defaults() {
        let project = tempfile::tempdir().unwrap();
        let fallback = vec!["forge-std/=lib/forge-std/src/".to_string()];

        let found = discover(
            project.path(),
            &["nothing-matches/".to_string()],
            &fallback,
            &Interrupt::new(),
        )
        .await;

        assert_eq!(found.len(), 1);
        assert!(found[0].ends_with("/lib/forge-std/src/"));
    }
}
