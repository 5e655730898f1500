//! On-disk session artifacts.
//!
//! Layout under `<output>/<session_id>/`:
//! - `session.json`: the full session, rewritten after every iteration
//! - `iteration-<n>.json`: one iteration's results
//! - `report.md`: the rendered analysis
//! - `tests/iteration-<n>/<Base>.guardian.t.sol`: drafted tests
//!
//! Every write goes to a temporary sibling first and is renamed into place, so
//! an interrupted write never clobbers an earlier complete file.

use super::{MutationIteration, MutationSession};
use crate::testgen::GeneratedTest;
use anyhow::{Context, Result};
use std::path::{Path, PathBuf};

pub const SESSION_FILE: &str = "session.json";
pub const REPORT_FILE: &str = "report.md";

/// Suffixes tried after `session_id` before giving up on a fresh directory.
const MAX_ID_SUFFIX: u32 = 100;

pub struct SessionStore {
    id: String,
    dir: PathBuf,
}

impl SessionStore {
    /// Create a fresh directory for `session_id` under `output_dir`.
    ///
    /// An existing session directory is never reused: when the id is taken,
    /// `-2`, `-3`, ... are appended until a new directory can be created.
    pub fn create(output_dir: &Path, session_id: &str) -> Result<Self> {
        std::fs::create_dir_all(output_dir)
            .with_context(|| format!("Failed to create output directory {}", output_dir.display()))?;

        for n in 1..=MAX_ID_SUFFIX {
            let id = if n == 1 {
                session_id.to_string()
            } else {
                format!("{}-{}", session_id, n)
            };
            let dir = output_dir.join(&id);
            match std::fs::create_dir(&dir) {
                Ok(()) => return Ok(Self { id, dir }),
                Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => continue,
                Err(e) => {
                    return Err(e).with_context(|| {
                        format!("Failed to create session directory {}", dir.display())
                    })
                }
            }
        }

        anyhow::bail!(
            "No free session directory for {} under {}",
            session_id,
            output_dir.display()
        )
    }

    /// The id the directory was created under, possibly suffixed.
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn write_session(&self, session: &MutationSession) -> Result<PathBuf> {
        let path = self.dir.join(SESSION_FILE);
        let json = serde_json::to_vec_pretty(session).context("Failed to serialize session")?;
        write_atomic(&path, &json)?;
        Ok(path)
    }

    pub fn write_iteration(&self, iteration: &MutationIteration) -> Result<PathBuf> {
        let path = self
            .dir
            .join(format!("iteration-{}.json", iteration.iteration_number));
        let json = serde_json::to_vec_pretty(iteration).context("Failed to serialize iteration")?;
        write_atomic(&path, &json)?;
        Ok(path)
    }

    /// Directory holding the tests drafted in `iteration_number`.
    pub fn tests_dir(&self, iteration_number: u32) -> PathBuf {
        self.dir
            .join("tests")
            .join(format!("iteration-{}", iteration_number))
    }

    pub fn write_tests(&self, iteration_number: u32, tests: &[GeneratedTest]) -> Result<Vec<PathBuf>> {
        if tests.is_empty() {
            return Ok(Vec::new());
        }

        let dir = self.tests_dir(iteration_number);
        std::fs::create_dir_all(&dir)
            .with_context(|| format!("Failed to create {}", dir.display()))?;

        tests
            .iter()
            .map(|test| {
                let path = dir.join(&test.file_name);
                write_atomic(&path, test.content.as_bytes())?;
                Ok(path)
            })
            .collect()
    }

    pub fn write_report(&self, report: &str) -> Result<PathBuf> {
        let path = self.dir.join(REPORT_FILE);
        write_atomic(&path, report.as_bytes())?;
        Ok(path)
    }
}

/// Load a session written by [`SessionStore::write_session`].
///
/// `path` may be the session directory or the `session.json` file itself.
pub fn load_session(path: &Path) -> Result<MutationSession> {
    let file = if path.is_dir() {
        path.join(SESSION_FILE)
    } else {
        path.to_path_buf()
    };
    let content = std::fs::read_to_string(&file)
        .with_context(|| format!("Failed to read {}", file.display()))?;
    serde_json::from_str(&content).with_context(|| format!("Failed to parse {}", file.display()))
}

fn write_atomic(path: &Path, contents: &[u8]) -> Result<()> {
    let mut tmp_name = path.as_os_str().to_owned();
    tmp_name.push(".tmp");
    let tmp = PathBuf::from(tmp_name);

    std::fs::write(&tmp, contents).with_context(|| format!("Failed to write {}", tmp.display()))?;
    std::fs::rename(&tmp, path)
        .with_context(|| format!("Failed to move {} into place", path.display()))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scoring::IterationStats;
    use crate::session::RunOptions;

    fn session() -> MutationSession {
        MutationSession {
            session_id: "guardian-test".to_string(),
            timestamp: chrono::Utc::now(),
            project_path: PathBuf::from("/work/project"),
            config: RunOptions::default(),
            iterations: Vec::new(),
            summary: None,
        }
    }

    fn iteration(n: u32) -> MutationIteration {
        MutationIteration {
            iteration_number: n,
            timestamp: chrono::Utc::now(),
            mutation_results: Vec::new(),
            generated_tests: Vec::new(),
            stats: IterationStats::default(),
        }
    }

    #[test]
    fn test_session_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let store = SessionStore::create(dir.path(), "guardian-test").unwrap();

        let mut s = session();
        s.iterations.push(iteration(1));
        store.write_session(&s).unwrap();

        let loaded = load_session(store.dir()).unwrap();
        assert_eq!(loaded.session_id, "guardian-test");
        assert_eq!(loaded.iterations.len(), 1);
        assert!(!store.dir().join("session.json.tmp").exists());
    }

    #[test]
    fn test_same_session_id_gets_its_own_directory() {
        let dir = tempfile::tempdir().unwrap();
        let first = SessionStore::create(dir.path(), "guardian-20260101-000000").unwrap();
        first.write_report("first").unwrap();

        let second = SessionStore::create(dir.path(), "guardian-20260101-000000").unwrap();
        second.write_report("second").unwrap();

        assert_eq!(first.id(), "guardian-20260101-000000");
        assert_eq!(second.id(), "guardian-20260101-000000-2");
        assert_ne!(first.dir(), second.dir());
        assert_eq!(
            std::fs::read_to_string(first.dir().join(REPORT_FILE)).unwrap(),
            "first"
        );
    }

    #[test]
    fn test_iteration_files_accumulate() {
        let dir = tempfile::tempdir().unwrap();
        let store = SessionStore::create(dir.path(), "s").unwrap();

        store.write_iteration(&iteration(1)).unwrap();
        store.write_iteration(&iteration(2)).unwrap();

        assert!(store.dir().join("iteration-1.json").exists());
        assert!(store.dir().join("iteration-2.json").exists());
    }

    #[test]
    fn test_write_tests() {
        let dir = tempfile::tempdir().unwrap();
        let store = SessionStore::create(dir.path(), "s").unwrap();
        let test = GeneratedTest {
            file_name: "Token.guardian.t.sol".to_string(),
            source_file: PathBuf::from("src/Token.sol"),
            content: "contract T {}\n".to_string(),
            description: "d".to_string(),
            warnings: Vec::new(),
        };

        let paths = store.write_tests(2, &[test]).unwrap();

        assert_eq!(
            paths,
            vec![store.dir().join("tests/iteration-2/Token.guardian.t.sol")]
        );
        assert_eq!(std::fs::read_to_string(&paths[0]).unwrap(), "contract T {}\n");
    }

    #[test]
    fn test_write_tests_empty_creates_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let store = SessionStore::create(dir.path(), "s").unwrap();
        assert!(store.write_tests(1, &[]).unwrap().is_empty());
        assert!(!store.dir().join("tests").exists());
    }

    #[test]
    fn test_load_session_missing() {
        let dir = tempfile::tempdir().unwrap();
        assert!(load_session(dir.path()).is_err());
    }
}
