//! Test generation for surviving mutants.
//!
//! Drafts one Foundry test file per source file with survivors by prompting a
//! hosted model. Output is best-effort: a weak structural check flags
//! suspicious files but never drops them.

mod client;

pub use client::{GeminiClient, TestGenError, TextGenerator};

use crate::mutation::{MutantStatus, MutationResult};
use crate::process::Interrupt;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

/// Suffix appended to the source base name for generated test files.
pub const GENERATED_SUFFIX: &str = ".guardian.t.sol";

const LICENSE_MARKER: &str = "// SPDX-License-Identifier";
const PRAGMA_MARKER: &str = "pragma solidity";

/// Style examples longer than this are cut before prompting.
const MAX_EXAMPLE_CHARS: usize = 12_000;

const SYSTEM_INSTRUCTION: &str = "You are a Solidity test engineer writing Foundry tests. \
Respond with exactly one complete, compilable Solidity test file and nothing else. \
Start with an SPDX license identifier line. Import forge-std/Test.sol and the contract under test. \
Every test function name must start with `test`. Do not add explanations and do not wrap the code in markdown.";

/// A drafted test file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GeneratedTest {
    /// `<Base>.guardian.t.sol`
    pub file_name: String,
    /// Source file the tests target, relative to the project.
    pub source_file: PathBuf,
    pub content: String,
    pub description: String,
    /// Problems found by the structural check.
    #[serde(default)]
    pub warnings: Vec<String>,
}

pub struct TestGenerator<G> {
    client: G,
    interrupt: Interrupt,
}

impl<G: TextGenerator> TestGenerator<G> {
    pub fn new(client: G, interrupt: Interrupt) -> Self {
        Self { client, interrupt }
    }

    /// Draft tests for every source file with surviving mutants.
    ///
    /// Files whose source can't be read or whose request fails are skipped.
    pub async fn generate(
        &self,
        survived: &[MutationResult],
        project_path: &Path,
    ) -> Vec<GeneratedTest> {
        let mut by_file: BTreeMap<&Path, Vec<&MutationResult>> = BTreeMap::new();
        for result in survived.iter().filter(|r| r.status == MutantStatus::Survived) {
            by_file.entry(result.file.as_path()).or_default().push(result);
        }

        let mut tests = Vec::new();

        for (file, mutants) in by_file {
            if self.interrupt.is_requested() {
                tracing::warn!("Test generation interrupted, skipping remaining files");
                break;
            }

            match self.generate_for_file(file, &mutants, project_path).await {
                Ok(test) => {
                    if !test.warnings.is_empty() {
                        tracing::warn!(
                            "Generated {} needs review: {}",
                            test.file_name,
                            test.warnings.join("; ")
                        );
                    }
                    tracing::info!("Generated {} for {}", test.file_name, file.display());
                    tests.push(test);
                }
                Err(e) => {
                    tracing::warn!("Skipping test generation for {}: {}", file.display(), e);
                }
            }
        }

        disambiguate_file_names(&mut tests);
        tests
    }

    async fn generate_for_file(
        &self,
        file: &Path,
        mutants: &[&MutationResult],
        project_path: &Path,
    ) -> anyhow::Result<GeneratedTest> {
        use anyhow::Context;

        let source = tokio::fs::read_to_string(project_path.join(file))
            .await
            .with_context(|| format!("Failed to read {}", file.display()))?;

        let base = base_name(file);
        let example = find_style_example(project_path, &base);
        let prompt = build_prompt(file, &source, example.as_deref(), mutants);

        let raw = tokio::select! {
            r = self.client.generate(SYSTEM_INSTRUCTION, &prompt) => r?,
            _ = self.interrupt.wait() => return Err(TestGenError::Interrupted.into()),
        };

        let content = clean_response(&raw);
        let warnings = sanity_warnings(&content);

        Ok(GeneratedTest {
            file_name: format!("{}{}", base, GENERATED_SUFFIX),
            source_file: file.to_path_buf(),
            content,
            description: format!(
                "Tests targeting {} surviving mutant(s) in {}",
                mutants.len(),
                file.display()
            ),
            warnings,
        })
    }
}

/// Prefix the directory slug to file names that more than one source maps to.
///
/// `src/a/Token.sol` and `src/b/Token.sol` become `src_a_Token.guardian.t.sol`
/// and `src_b_Token.guardian.t.sol`; unique names are left alone.
fn disambiguate_file_names(tests: &mut [GeneratedTest]) {
    let mut counts: BTreeMap<String, usize> = BTreeMap::new();
    for test in tests.iter() {
        *counts.entry(test.file_name.clone()).or_default() += 1;
    }

    for test in tests.iter_mut() {
        if counts.get(&test.file_name).copied().unwrap_or(0) < 2 {
            continue;
        }
        let dir_slug = test
            .source_file
            .parent()
            .map(|p| {
                p.components()
                    .map(|c| c.as_os_str().to_string_lossy().to_string())
                    .collect::<Vec<_>>()
                    .join("_")
            })
            .unwrap_or_default();
        if !dir_slug.is_empty() {
            test.file_name = format!("{}_{}", dir_slug, test.file_name);
        }
    }
}

/// File name without directories or the `.sol` extension.
fn base_name(file: &Path) -> String {
    file.file_stem()
        .map(|s| s.to_string_lossy().to_string())
        .unwrap_or_else(|| "Contract".to_string())
}

/// An existing test to show the model the project's conventions.
///
/// Tries `test/<Base>.t.sol`, then any `*.t.sol` under `test/` that mentions
/// the contract name.
fn find_style_example(project_path: &Path, base: &str) -> Option<String> {
    let test_dir = project_path.join("test");
    let direct = test_dir.join(format!("{}.t.sol", base));
    if let Ok(content) = std::fs::read_to_string(&direct) {
        return Some(limit(content));
    }

    walkdir::WalkDir::new(&test_dir)
        .into_iter()
        .filter_map(Result::ok)
        .filter(|e| e.file_type().is_file() && e.file_name().to_string_lossy().ends_with(".t.sol"))
        .filter_map(|e| std::fs::read_to_string(e.path()).ok())
        .find(|content| content.contains(base))
        .map(limit)
}

fn limit(mut content: String) -> String {
    if content.len() > MAX_EXAMPLE_CHARS {
        let mut end = MAX_EXAMPLE_CHARS;
        while !content.is_char_boundary(end) {
            end -= 1;
        }
        content.truncate(end);
        content.push_str("\n// ...");
    }
    content
}

fn build_prompt(
    file: &Path,
    source: &str,
    example: Option<&str>,
    mutants: &[&MutationResult],
) -> String {
    let mut prompt = format!(
        "The following mutants of {} survived the existing test suite. \
         Write a Foundry test contract whose tests fail on every one of these mutants \
         while passing on the original code.\n\n",
        file.display()
    );

    prompt.push_str(&format!(
        "## Contract source ({})\n```solidity\n{}\n```\n\n",
        file.display(),
        source.trim_end()
    ));

    match example {
        Some(example) => prompt.push_str(&format!(
            "## Existing test (follow its style and setup)\n```solidity\n{}\n```\n\n",
            example.trim_end()
        )),
        None => prompt.push_str(
            "## Existing test\nNone found. Use forge-std `Test` with a `setUp` function.\n\n",
        ),
    }

    prompt.push_str("## Surviving mutants\n");
    for (i, m) in mutants.iter().enumerate() {
        prompt.push_str(&format!(
            "{}. {} at line {}, column {}\n   original: {}\n   mutated:  {}\n",
            i + 1,
            m.mutation_type,
            m.line,
            m.column,
            m.original,
            m.mutated
        ));
    }

    prompt.push_str(&format!(
        "\nThe test file will be placed in `test/`; import the contract as `../{}`.\n",
        file.display()
    ));
    prompt
}

/// Strip markdown fences and any prose before the start of the source.
fn clean_response(raw: &str) -> String {
    let mut text = raw.trim();

    if let Some(start) = text.find("```") {
        let after = &text[start + 3..];
        // Skip the language tag
        let body_start = after.find('\n').map_or(after.len(), |i| i + 1);
        let body = &after[body_start..];
        text = body.find("```").map_or(body, |end| &body[..end]);
    }

    let start = text
        .find(LICENSE_MARKER)
        .or_else(|| text.find(PRAGMA_MARKER))
        .unwrap_or(0);

    let mut cleaned = text[start..].trim().to_string();
    cleaned.push('\n');
    cleaned
}

fn sanity_warnings(content: &str) -> Vec<String> {
    let mut warnings = Vec::new();
    if !content.contains(LICENSE_MARKER) && !content.contains(PRAGMA_MARKER) {
        warnings.push("missing SPDX license or pragma header".to_string());
    }
    if !content.contains("contract ") {
        warnings.push("no contract declaration".to_string());
    }
    if !content.contains("function test") {
        warnings.push("no test function".to_string());
    }
    warnings
}
