//! Result aggregation and scoring.
//!
//! Everything here is a pure function of a result list and a [`ScoringPolicy`]:
//! scoring the same input twice yields the same output.

use crate::mutation::{MutantStatus, MutationResult, MutationType};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::path::PathBuf;

/// How timed-out mutants count toward the score.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TimeoutPolicy {
    /// A timeout means the suite did not pass: counted as killed.
    #[default]
    Killed,
    /// Timeouts are left out of the denominator.
    Excluded,
}

/// Heuristic scoring data, kept configurable.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScoringPolicy {
    /// Severity (1-5) per mutation operator name
    #[serde(default = "default_severities")]
    pub severities: BTreeMap<String, u8>,

    /// Severity for operators missing from the table
    #[serde(default = "default_severity")]
    pub default_severity: u8,

    /// Keywords marking input validation in the original snippet
    #[serde(default = "default_validation_keywords")]
    pub validation_keywords: Vec<String>,

    /// Keywords marking value transfer
    #[serde(default = "default_value_transfer_keywords")]
    pub value_transfer_keywords: Vec<String>,

    /// Keywords marking access control
    #[serde(default = "default_access_control_keywords")]
    pub access_control_keywords: Vec<String>,

    /// Number of survivors listed as critical gaps
    #[serde(default = "default_critical_gap_limit")]
    pub critical_gap_limit: usize,

    #[serde(default)]
    pub timeout_policy: TimeoutPolicy,
}

fn default_severities() -> BTreeMap<String, u8> {
    [
        ("require-mutation", 5),
        ("elim-delegate-mutation", 5),
        ("assignment-mutation", 4),
        ("swap-arguments-operator-mutation", 4),
        ("binary-op-mutation", 3),
        ("unary-operator-mutation", 3),
        ("delete-expression-mutation", 3),
    ]
    .into_iter()
    .map(|(k, v)| (k.to_string(), v))
    .collect()
}

fn default_severity() -> u8 {
    2
}

fn default_validation_keywords() -> Vec<String> {
    vec!["require".to_string(), "assert".to_string()]
}

fn default_value_transfer_keywords() -> Vec<String> {
    vec!["transfer".to_string(), "send".to_string()]
}

fn default_access_control_keywords() -> Vec<String> {
    vec!["owner".to_string(), "admin".to_string()]
}

fn default_critical_gap_limit() -> usize {
    10
}

impl Default for ScoringPolicy {
    fn default() -> Self {
        Self {
            severities: default_severities(),
            default_severity: default_severity(),
            validation_keywords: default_validation_keywords(),
            value_transfer_keywords: default_value_transfer_keywords(),
            access_control_keywords: default_access_control_keywords(),
            critical_gap_limit: default_critical_gap_limit(),
            timeout_policy: TimeoutPolicy::default(),
        }
    }
}

impl ScoringPolicy {
    pub fn severity(&self, mutation_type: &MutationType) -> u8 {
        self.severities
            .get(mutation_type.as_str())
            .copied()
            .unwrap_or(self.default_severity)
    }

    /// Priority of a surviving mutant for the critical-gap ranking.
    pub fn priority(&self, result: &MutationResult) -> u32 {
        let snippet = result.original.to_lowercase();
        let mentions = |keywords: &[String]| {
            keywords
                .iter()
                .any(|k| snippet.contains(&k.to_lowercase()))
        };

        let mut priority = u32::from(self.severity(&result.mutation_type)) * 10;
        if mentions(&self.validation_keywords) {
            priority += 20;
        }
        if mentions(&self.value_transfer_keywords) {
            priority += 15;
        }
        if mentions(&self.access_control_keywords) {
            priority += 10;
        }
        priority
    }
}

/// Status counts for one result list.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IterationStats {
    pub total: usize,
    pub killed: usize,
    pub survived: usize,
    pub timeout: usize,
    pub error: usize,
}

impl IterationStats {
    pub fn from_results(results: &[MutationResult]) -> Self {
        let mut stats = Self::default();
        for result in results {
            stats.total += 1;
            match result.status {
                MutantStatus::Killed => stats.killed += 1,
                MutantStatus::Survived => stats.survived += 1,
                MutantStatus::Timeout => stats.timeout += 1,
                MutantStatus::Error => stats.error += 1,
            }
        }
        stats
    }

    /// `killed / total * 100`. Timeouts count as killed, or leave the
    /// denominator under [`TimeoutPolicy::Excluded`]. Errors always stay in it.
    pub fn kill_rate(&self, policy: TimeoutPolicy) -> f64 {
        let (killed, scored) = match policy {
            TimeoutPolicy::Killed => (self.killed + self.timeout, self.total),
            TimeoutPolicy::Excluded => (self.killed, self.total - self.timeout),
        };
        if scored == 0 {
            0.0
        } else {
            killed as f64 / scored as f64 * 100.0
        }
    }
}

/// Per-file breakdown.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileStats {
    pub file: PathBuf,
    pub total: usize,
    pub killed: usize,
    pub survived: usize,
    pub score: f64,
}

/// Per-operator breakdown.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TypeStats {
    pub mutation_type: MutationType,
    pub total: usize,
    pub killed: usize,
    pub survived: usize,
    pub score: f64,
    pub severity: u8,
}

/// A high-priority surviving mutant.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CriticalGap {
    pub file: PathBuf,
    pub line: usize,
    pub column: usize,
    pub mutation_type: MutationType,
    pub original: String,
    pub mutated: String,
    pub severity: u8,
    pub priority: u32,
}

/// Everything derived from one result list.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Analysis {
    pub stats: IterationStats,
    pub basic_score: f64,
    pub guardian_score: f64,
    /// Worst performing first.
    pub by_file: Vec<FileStats>,
    /// Most problematic first.
    pub by_mutation_type: Vec<TypeStats>,
    pub critical_gaps: Vec<CriticalGap>,
    pub recommendations: Vec<String>,
}

fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

/// Plain kill rate, rounded to two decimals.
pub fn basic_score(results: &[MutationResult], policy: &ScoringPolicy) -> f64 {
    round2(IterationStats::from_results(results).kill_rate(policy.timeout_policy))
}

/// Composite score: kill rate minus survivor severity, plus a spread bonus.
pub fn guardian_score(results: &[MutationResult], policy: &ScoringPolicy) -> f64 {
    let stats = IterationStats::from_results(results);
    let base = stats.kill_rate(policy.timeout_policy);

    let severity_penalty: f64 = results
        .iter()
        .filter(|r| r.status == MutantStatus::Survived)
        .map(|r| f64::from(policy.severity(&r.mutation_type)) * 2.0)
        .sum();

    let all_files: BTreeSet<&PathBuf> = results.iter().map(|r| &r.file).collect();
    let files_with_survivors: BTreeSet<&PathBuf> = results
        .iter()
        .filter(|r| r.status == MutantStatus::Survived)
        .map(|r| &r.file)
        .collect();

    let distribution_bonus = if all_files.len() > 1 {
        files_with_survivors.len() as f64 / all_files.len() as f64 * 5.0
    } else {
        0.0
    };

    round2((base - severity_penalty + distribution_bonus).clamp(0.0, 100.0))
}

/// Aggregate a result list into scores, breakdowns and recommendations.
pub fn score(results: &[MutationResult], policy: &ScoringPolicy) -> Analysis {
    let stats = IterationStats::from_results(results);
    let basic = basic_score(results, policy);
    let guardian = guardian_score(results, policy);
    let by_file = file_breakdown(results, policy);
    let by_mutation_type = type_breakdown(results, policy);
    let critical_gaps = critical_gaps(results, policy);
    let recommendations =
        recommendations(&stats, results, &by_file, &by_mutation_type, guardian);

    Analysis {
        stats,
        basic_score: basic,
        guardian_score: guardian,
        by_file,
        by_mutation_type,
        critical_gaps,
        recommendations,
    }
}

fn file_breakdown(results: &[MutationResult], policy: &ScoringPolicy) -> Vec<FileStats> {
    let mut groups: BTreeMap<&PathBuf, Vec<MutationResult>> = BTreeMap::new();
    for result in results {
        groups.entry(&result.file).or_default().push(result.clone());
    }

    let mut files: Vec<FileStats> = groups
        .into_iter()
        .map(|(file, group)| {
            let stats = IterationStats::from_results(&group);
            FileStats {
                file: file.clone(),
                total: stats.total,
                killed: stats.killed,
                survived: stats.survived,
                score: round2(stats.kill_rate(policy.timeout_policy)),
            }
        })
        .collect();

    files.sort_by(|a, b| a.score.total_cmp(&b.score));
    files
}

fn type_breakdown(results: &[MutationResult], policy: &ScoringPolicy) -> Vec<TypeStats> {
    let mut groups: BTreeMap<&MutationType, Vec<MutationResult>> = BTreeMap::new();
    for result in results {
        groups
            .entry(&result.mutation_type)
            .or_default()
            .push(result.clone());
    }

    let mut types: Vec<TypeStats> = groups
        .into_iter()
        .map(|(mutation_type, group)| {
            let stats = IterationStats::from_results(&group);
            TypeStats {
                mutation_type: mutation_type.clone(),
                total: stats.total,
                killed: stats.killed,
                survived: stats.survived,
                score: round2(stats.kill_rate(policy.timeout_policy)),
                severity: policy.severity(mutation_type),
            }
        })
        .collect();

    let weight = |t: &TypeStats| t.score - f64::from(t.severity) * 5.0;
    types.sort_by(|a, b| weight(a).total_cmp(&weight(b)));
    types
}

fn critical_gaps(results: &[MutationResult], policy: &ScoringPolicy) -> Vec<CriticalGap> {
    let mut gaps: Vec<CriticalGap> = results
        .iter()
        .filter(|r| r.status == MutantStatus::Survived)
        .map(|r| CriticalGap {
            file: r.file.clone(),
            line: r.line,
            column: r.column,
            mutation_type: r.mutation_type.clone(),
            original: r.original.clone(),
            mutated: r.mutated.clone(),
            severity: policy.severity(&r.mutation_type),
            priority: policy.priority(r),
        })
        .collect();

    gaps.sort_by(|a, b| b.priority.cmp(&a.priority));
    gaps.truncate(policy.critical_gap_limit);
    gaps
}

fn recommendations(
    stats: &IterationStats,
    results: &[MutationResult],
    by_file: &[FileStats],
    by_mutation_type: &[TypeStats],
    guardian: f64,
) -> Vec<String> {
    if stats.survived == 0 {
        return vec![
            "All mutants were killed. The test suite caught every generated change.".to_string(),
        ];
    }

    let mut out = Vec::new();

    if let Some(worst) = by_file.iter().find(|f| f.survived > 0) {
        out.push(format!(
            "Focus on {}: {} of {} mutants survived ({:.1}% killed).",
            worst.file.display(),
            worst.survived,
            worst.total,
            worst.score
        ));
    }

    if let Some(worst) = by_mutation_type.iter().find(|t| t.survived > 0) {
        out.push(format!(
            "Most problematic mutation type is {} (severity {}/5): {} survivor(s).",
            worst.mutation_type, worst.severity, worst.survived
        ));
    }

    let survivors = || results.iter().filter(|r| r.status == MutantStatus::Survived);

    let security = survivors()
        .filter(|r| r.mutation_type.is_security_critical())
        .count();
    if security > 0 {
        out.push(format!(
            "Security: {} surviving require/delegate mutation(s). Add tests that expect reverts for invalid input and unauthorized callers.",
            security
        ));
    }

    let logic = survivors().filter(|r| r.mutation_type.is_logic()).count();
    if logic > 0 {
        out.push(format!(
            "Logic: {} surviving operator mutation(s). Add boundary-value tests around comparisons and arithmetic.",
            logic
        ));
    }

    let state = survivors().filter(|r| r.mutation_type.is_state()).count();
    if state > 0 {
        out.push(format!(
            "State: {} surviving assignment mutation(s). Assert storage values after every state-changing call.",
            state
        ));
    }

    let closing = if guardian < 50.0 {
        "Guardian score is below 50: the suite misses a large share of behaviour changes and needs substantial work."
    } else if guardian < 75.0 {
        "Guardian score is below 75: core paths are covered but important gaps remain."
    } else if guardian < 90.0 {
        "Guardian score is below 90: a solid suite, close the remaining gaps to harden it."
    } else {
        "Guardian score is 90 or above: a strong suite, only minor gaps remain."
    };
    out.push(closing.to_string());

    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn result(file: &str, kind: &str, original: &str, status: MutantStatus) -> MutationResult {
        MutationResult {
            file: PathBuf::from(file),
            line: 1,
            column: 1,
            mutation_type: MutationType::from(kind),
            original: original.to_string(),
            mutated: "mutated".to_string(),
            status,
            test_output: String::new(),
            timestamp: None,
        }
    }

    /// 7 killed, 3 surviving binary-op mutants in one file.
    fn seven_of_ten() -> Vec<MutationResult> {
        let mut results = Vec::new();
        for _ in 0..7 {
            results.push(result("src/Token.sol", "binary-op-mutation", "a + b", MutantStatus::Killed));
        }
        for _ in 0..3 {
            results.push(result("src/Token.sol", "binary-op-mutation", "a + b", MutantStatus::Survived));
        }
        results
    }

    #[test]
    fn test_basic_score_seventy_percent() {
        let results = seven_of_ten();
        let analysis = score(&results, &ScoringPolicy::default());
        assert_eq!(analysis.stats.killed, 7);
        assert_eq!(analysis.stats.survived, 3);
        assert_eq!(analysis.basic_score, 70.0);
    }

    #[test]
    fn test_guardian_single_file_has_no_distribution_bonus() {
        let results = seven_of_ten();
        // 3 survivors * severity 3 * 2 = 18
        assert_eq!(guardian_score(&results, &ScoringPolicy::default()), 52.0);
    }

    #[test]
    fn test_guardian_distribution_bonus_for_multiple_files() {
        let results = vec![
            result("src/A.sol", "binary-op-mutation", "x", MutantStatus::Killed),
            result("src/A.sol", "binary-op-mutation", "x", MutantStatus::Killed),
            result("src/A.sol", "binary-op-mutation", "x", MutantStatus::Killed),
            result("src/B.sol", "other-mutation", "y", MutantStatus::Survived),
        ];
        // base 75, penalty 2*2 = 4, bonus 1/2 * 5 = 2.5
        assert_eq!(guardian_score(&results, &ScoringPolicy::default()), 73.5);
    }

    #[test]
    fn test_guardian_clamped_at_zero() {
        let results: Vec<_> = (0..20)
            .map(|_| result("src/A.sol", "require-mutation", "require(x)", MutantStatus::Survived))
            .collect();
        assert_eq!(guardian_score(&results, &ScoringPolicy::default()), 0.0);
    }

    #[test]
    fn test_guardian_equals_basic_without_survivors_in_one_file() {
        let results = vec![
            result("src/A.sol", "binary-op-mutation", "x", MutantStatus::Killed),
            result("src/A.sol", "assignment-mutation", "y = 1", MutantStatus::Killed),
        ];
        let policy = ScoringPolicy::default();
        assert_eq!(guardian_score(&results, &policy), basic_score(&results, &policy));
        assert_eq!(basic_score(&results, &policy), 100.0);
    }

    #[test]
    fn test_guardian_bounds_on_mixed_inputs() {
        let statuses = [
            MutantStatus::Killed,
            MutantStatus::Survived,
            MutantStatus::Timeout,
            MutantStatus::Error,
        ];
        let kinds = ["require-mutation", "binary-op-mutation", "custom"];
        let policy = ScoringPolicy::default();
        for n in 1..30usize {
            let results: Vec<_> = (0..n)
                .map(|i| {
                    result(
                        &format!("src/F{}.sol", i % 4),
                        kinds[i % kinds.len()],
                        "x",
                        statuses[(i * 7) % statuses.len()],
                    )
                })
                .collect();
            let g = guardian_score(&results, &policy);
            assert!((0.0..=100.0).contains(&g), "n={n} g={g}");
        }
    }

    #[test]
    fn test_score_empty_results() {
        let analysis = score(&[], &ScoringPolicy::default());
        assert_eq!(analysis.basic_score, 0.0);
        assert_eq!(analysis.guardian_score, 0.0);
        assert!(analysis.by_file.is_empty());
        assert_eq!(analysis.recommendations.len(), 1);
    }

    #[test]
    fn test_score_is_idempotent() {
        let mut results = seven_of_ten();
        results.push(result("src/Vault.sol", "require-mutation", "require(owner == msg.sender)", MutantStatus::Survived));
        let policy = ScoringPolicy::default();
        assert_eq!(score(&results, &policy), score(&results, &policy));
    }

    #[test]
    fn test_timeout_policy() {
        let results = vec![
            result("src/A.sol", "binary-op-mutation", "x", MutantStatus::Killed),
            result("src/A.sol", "binary-op-mutation", "x", MutantStatus::Timeout),
            result("src/A.sol", "binary-op-mutation", "x", MutantStatus::Survived),
            result("src/A.sol", "binary-op-mutation", "x", MutantStatus::Error),
        ];
        let mut policy = ScoringPolicy::default();
        assert_eq!(basic_score(&results, &policy), 50.0);

        policy.timeout_policy = TimeoutPolicy::Excluded;
        assert_eq!(basic_score(&results, &policy), 33.33);
    }

    #[test]
    fn test_errors_stay_in_denominator() {
        let mut results = Vec::new();
        for _ in 0..5 {
            results.push(result("src/A.sol", "binary-op-mutation", "x", MutantStatus::Killed));
            results.push(result("src/A.sol", "binary-op-mutation", "x", MutantStatus::Error));
        }
        let policy = ScoringPolicy::default();
        assert_eq!(basic_score(&results, &policy), 50.0);
    }

    #[test]
    fn test_only_timeouts_excluded_scores_zero() {
        let results = vec![result("src/A.sol", "binary-op-mutation", "x", MutantStatus::Timeout)];
        let policy = ScoringPolicy {
            timeout_policy: TimeoutPolicy::Excluded,
            ..ScoringPolicy::default()
        };
        assert_eq!(basic_score(&results, &policy), 0.0);
    }

    #[test]
    fn test_priority_require_survivor() {
        let policy = ScoringPolicy::default();
        let r = result("src/Vault.sol", "require-mutation", "require(amount > 0)", MutantStatus::Survived);
        assert_eq!(policy.priority(&r), 70);
    }

    #[test]
    fn test_priority_stacks_keywords() {
        let policy = ScoringPolicy::default();
        let r = result(
            "src/Vault.sol",
            "delete-expression-mutation",
            "require(msg.sender == owner); token.transfer(to, amt)",
            MutantStatus::Survived,
        );
        // 3*10 + 20 + 15 + 10
        assert_eq!(policy.priority(&r), 75);
    }

    #[test]
    fn test_unmapped_type_uses_default_severity() {
        let policy = ScoringPolicy::default();
        assert_eq!(policy.severity(&MutationType::from("if-cond-mutation")), 2);
        assert_eq!(policy.severity(&MutationType::Require), 5);
    }

    #[test]
    fn test_critical_gaps_ranked_and_limited() {
        let mut results: Vec<_> = (0..12)
            .map(|_| result("src/A.sol", "binary-op-mutation", "a + b", MutantStatus::Survived))
            .collect();
        results.push(result("src/A.sol", "require-mutation", "require(ok)", MutantStatus::Survived));
        results.push(result("src/A.sol", "require-mutation", "require(ok)", MutantStatus::Killed));

        let analysis = score(&results, &ScoringPolicy::default());
        assert_eq!(analysis.critical_gaps.len(), 10);
        assert_eq!(analysis.critical_gaps[0].mutation_type, MutationType::Require);
        assert_eq!(analysis.critical_gaps[0].priority, 70);
        assert!(analysis
            .critical_gaps
            .windows(2)
            .all(|w| w[0].priority >= w[1].priority));
    }

    #[test]
    fn test_file_breakdown_sorted_worst_first() {
        let results = vec![
            result("src/Good.sol", "binary-op-mutation", "x", MutantStatus::Killed),
            result("src/Bad.sol", "binary-op-mutation", "x", MutantStatus::Survived),
            result("src/Mid.sol", "binary-op-mutation", "x", MutantStatus::Killed),
            result("src/Mid.sol", "binary-op-mutation", "x", MutantStatus::Survived),
        ];
        let analysis = score(&results, &ScoringPolicy::default());
        let order: Vec<_> = analysis.by_file.iter().map(|f| f.file.clone()).collect();
        assert_eq!(
            order,
            vec![
                PathBuf::from("src/Bad.sol"),
                PathBuf::from("src/Mid.sol"),
                PathBuf::from("src/Good.sol")
            ]
        );
    }

    #[test]
    fn test_type_breakdown_weights_severity() {
        // Same kill rate, so the higher-severity operator ranks first
        let results = vec![
            result("src/A.sol", "binary-op-mutation", "x", MutantStatus::Survived),
            result("src/A.sol", "binary-op-mutation", "x", MutantStatus::Killed),
            result("src/A.sol", "require-mutation", "require(x)", MutantStatus::Survived),
            result("src/A.sol", "require-mutation", "require(x)", MutantStatus::Killed),
        ];
        let analysis = score(&results, &ScoringPolicy::default());
        assert_eq!(analysis.by_mutation_type[0].mutation_type, MutationType::Require);
        assert_eq!(analysis.by_mutation_type[0].severity, 5);
    }

    #[test]
    fn test_recommendations_all_killed() {
        let results = vec![result("src/A.sol", "binary-op-mutation", "x", MutantStatus::Killed)];
        let analysis = score(&results, &ScoringPolicy::default());
        assert_eq!(analysis.recommendations.len(), 1);
        assert!(analysis.recommendations[0].starts_with("All mutants were killed"));
    }

    #[test]
    fn test_recommendations_order() {
        let results = vec![
            result("src/A.sol", "require-mutation", "require(x)", MutantStatus::Survived),
            result("src/A.sol", "binary-op-mutation", "a + b", MutantStatus::Survived),
            result("src/A.sol", "assignment-mutation", "x = 1", MutantStatus::Survived),
            result("src/A.sol", "assignment-mutation", "x = 1", MutantStatus::Killed),
        ];
        let analysis = score(&results, &ScoringPolicy::default());
        let recs = &analysis.recommendations;
        assert_eq!(recs.len(), 6);
        assert!(recs[0].starts_with("Focus on src/A.sol"));
        assert!(recs[1].starts_with("Most problematic mutation type"));
        assert!(recs[2].starts_with("Security"));
        assert!(recs[3].starts_with("Logic"));
        assert!(recs[4].starts_with("State"));
        assert!(recs[5].contains("below 50"));
    }

    #[test]
    fn test_stats_from_results_matches_counts() {
        let results = vec![
            result("a", "x", "x", MutantStatus::Killed),
            result("a", "x", "x", MutantStatus::Survived),
            result("a", "x", "x", MutantStatus::Timeout),
            result("a", "x", "x", MutantStatus::Error),
            result("a", "x", "x", MutantStatus::Error),
        ];
        let stats = IterationStats::from_results(&results);
        assert_eq!(
            stats,
            IterationStats {
                total: 5,
                killed: 1,
                survived: 1,
                timeout: 1,
                error: 2
            }
        );
    }
}
