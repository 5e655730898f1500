//! Markdown report rendering.

use super::{MutationSession, SessionOutcome, TestGeneration};
use crate::scoring::Analysis;
use anyhow::{Context, Result};
use askama::Template;

#[derive(Template)]
#[template(path = "report.md")]
struct ReportTemplate {
    session_id: String,
    source: String,
    generated_at: String,
    outcome: String,
    total: usize,
    killed: usize,
    survived: usize,
    timeout: usize,
    error: usize,
    basic_score: String,
    guardian_score: String,
    iterations: Vec<IterationRow>,
    files: Vec<FileRow>,
    types: Vec<TypeRow>,
    gaps: Vec<GapRow>,
    recommendations: Vec<String>,
    test_generation: String,
    tests: Vec<String>,
}

struct IterationRow {
    number: u32,
    total: usize,
    killed: usize,
    survived: usize,
    timeout: usize,
    error: usize,
}

struct FileRow {
    file: String,
    total: usize,
    killed: usize,
    survived: usize,
    score: String,
}

struct TypeRow {
    name: String,
    severity: u8,
    total: usize,
    killed: usize,
    survived: usize,
    score: String,
}

struct GapRow {
    priority: u32,
    location: String,
    name: String,
    original: String,
    mutated: String,
}

/// Make a snippet safe inside a table cell.
fn cell(text: &str) -> String {
    text.replace('|', "\\|").replace(['\n', '\r'], " ")
}

/// Render the report for `session`, whose latest iteration produced `analysis`.
pub fn render(session: &MutationSession, analysis: &Analysis) -> Result<String> {
    let outcome = match session.summary.as_ref().map(|s| s.outcome) {
        Some(SessionOutcome::Done) => "done",
        Some(SessionOutcome::Cancelled) => "cancelled",
        Some(SessionOutcome::Stopped) => "stopped",
        Some(SessionOutcome::Interrupted) => "interrupted",
        None => "in progress",
    };

    let test_generation = match session.summary.as_ref().map(|s| &s.test_generation) {
        Some(TestGeneration::Generated { count }) => format!(
            "{} test file(s) drafted. Review them, add them to the project's test suite, and re-run.",
            count
        ),
        Some(TestGeneration::Skipped { reason }) => format!(
            "Skipped: {}. The surviving mutants above remain unaddressed.",
            reason
        ),
        Some(TestGeneration::NotNeeded) => "Not needed: no mutants survived.".to_string(),
        None => "Pending.".to_string(),
    };

    let tests = session
        .iterations
        .iter()
        .flat_map(|it| {
            it.generated_tests.iter().map(move |t| {
                let mut line = format!(
                    "iteration {}: `{}` ({})",
                    it.iteration_number, t.file_name, t.description
                );
                if !t.warnings.is_empty() {
                    line.push_str(&format!(" - needs review: {}", t.warnings.join("; ")));
                }
                line
            })
        })
        .collect();

    let template = ReportTemplate {
        session_id: session.session_id.clone(),
        source: session.config.source.clone(),
        generated_at: chrono::Utc::now().format("%Y-%m-%d %H:%M:%S UTC").to_string(),
        outcome: outcome.to_string(),
        total: analysis.stats.total,
        killed: analysis.stats.killed,
        survived: analysis.stats.survived,
        timeout: analysis.stats.timeout,
        error: analysis.stats.error,
        basic_score: format!("{:.2}", analysis.basic_score),
        guardian_score: format!("{:.2}", analysis.guardian_score),
        iterations: session
            .iterations
            .iter()
            .map(|it| IterationRow {
                number: it.iteration_number,
                total: it.stats.total,
                killed: it.stats.killed,
                survived: it.stats.survived,
                timeout: it.stats.timeout,
                error: it.stats.error,
            })
            .collect(),
        files: analysis
            .by_file
            .iter()
            .map(|f| FileRow {
                file: f.file.display().to_string(),
                total: f.total,
                killed: f.killed,
                survived: f.survived,
                score: format!("{:.2}", f.score),
            })
            .collect(),
        types: analysis
            .by_mutation_type
            .iter()
            .map(|t| TypeRow {
                name: t.mutation_type.to_string(),
                severity: t.severity,
                total: t.total,
                killed: t.killed,
                survived: t.survived,
                score: format!("{:.2}", t.score),
            })
            .collect(),
        gaps: analysis
            .critical_gaps
            .iter()
            .map(|g| GapRow {
                priority: g.priority,
                location: format!("{}:{}:{}", g.file.display(), g.line, g.column),
                name: g.mutation_type.to_string(),
                original: cell(&g.original),
                mutated: cell(&g.mutated),
            })
            .collect(),
        recommendations: analysis.recommendations.clone(),
        test_generation,
        tests,
    };

    template.render().context("Failed to render report")
}
