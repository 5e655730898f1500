//! Mutant model and evaluation.
//!
//! This module provides:
//! - The descriptors parsed from the mutant generator's log
//! - The per-mutant results produced by the evaluator
//! - The substitute/test/classify/restore cycle (see [`executor`])

pub mod executor;

pub use executor::{evaluate, EvaluateError};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Mutation operator names understood by the generator.
pub const ALL_OPERATORS: &[&str] = &[
    "binary-op-mutation",
    "unary-operator-mutation",
    "require-mutation",
    "assignment-mutation",
    "delete-expression-mutation",
    "swap-arguments-operator-mutation",
    "elim-delegate-mutation",
];

/// Kind of code change a mutant applies.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum MutationType {
    BinaryOp,
    UnaryOperator,
    Require,
    Assignment,
    DeleteExpression,
    SwapArgumentsOperator,
    ElimDelegate,
    /// An operator this crate has no dedicated handling for.
    Other(String),
}

impl MutationType {
    pub fn as_str(&self) -> &str {
        match self {
            Self::BinaryOp => "binary-op-mutation",
            Self::UnaryOperator => "unary-operator-mutation",
            Self::Require => "require-mutation",
            Self::Assignment => "assignment-mutation",
            Self::DeleteExpression => "delete-expression-mutation",
            Self::SwapArgumentsOperator => "swap-arguments-operator-mutation",
            Self::ElimDelegate => "elim-delegate-mutation",
            Self::Other(name) => name,
        }
    }

    /// Mutations that remove checks guarding funds or permissions.
    pub fn is_security_critical(&self) -> bool {
        matches!(self, Self::Require | Self::ElimDelegate)
    }

    /// Mutations that flip arithmetic, comparison or boolean logic.
    pub fn is_logic(&self) -> bool {
        matches!(self, Self::BinaryOp | Self::UnaryOperator)
    }

    /// Mutations that corrupt stored state.
    pub fn is_state(&self) -> bool {
        matches!(self, Self::Assignment)
    }
}

impl From<&str> for MutationType {
    fn from(value: &str) -> Self {
        match value.trim() {
            "binary-op-mutation" => Self::BinaryOp,
            "unary-operator-mutation" => Self::UnaryOperator,
            "require-mutation" => Self::Require,
            "assignment-mutation" => Self::Assignment,
            "delete-expression-mutation" => Self::DeleteExpression,
            "swap-arguments-operator-mutation" => Self::SwapArgumentsOperator,
            "elim-delegate-mutation" => Self::ElimDelegate,
            other => Self::Other(other.to_string()),
        }
    }
}

impl From<String> for MutationType {
    fn from(value: String) -> Self {
        Self::from(value.as_str())
    }
}

impl From<MutationType> for String {
    fn from(value: MutationType) -> Self {
        value.as_str().to_string()
    }
}

impl std::fmt::Display for MutationType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// One proposed code change, as reported by the generator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MutantDescriptor {
    /// Generator-assigned id, unique within one generator invocation.
    pub id: u32,
    pub mutation_type: MutationType,
    /// Source file, relative to the project root.
    pub file: PathBuf,
    /// 1-based line.
    pub line: usize,
    /// 1-based column.
    pub column: usize,
    pub original: String,
    pub mutated: String,
    /// Generator output directory for this file, relative to the project root.
    pub source_output_dir: PathBuf,
}

impl MutantDescriptor {
    /// Path of the file this mutant replaces.
    pub fn original_path(&self, project_path: &Path) -> PathBuf {
        project_path.join(&self.file)
    }

    /// Path of the generator's mutated copy of the file.
    pub fn mutant_path(&self, project_path: &Path) -> PathBuf {
        project_path
            .join(&self.source_output_dir)
            .join("mutants")
            .join(self.id.to_string())
            .join(&self.file)
    }

    pub fn identity(&self) -> MutantIdentity {
        MutantIdentity {
            file: self.file.clone(),
            line: self.line,
            mutation_type: self.mutation_type.clone(),
            original: self.original.clone(),
            mutated: self.mutated.clone(),
        }
    }
}

/// Outcome of testing one mutant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MutantStatus {
    /// The test command failed - mutation was caught
    Killed,
    /// The test command passed - mutation was NOT caught
    Survived,
    /// Substitution or restore failed; the test result is meaningless
    Error,
    /// The test command exceeded its deadline
    Timeout,
}

impl std::fmt::Display for MutantStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Killed => write!(f, "killed"),
            Self::Survived => write!(f, "survived"),
            Self::Error => write!(f, "error"),
            Self::Timeout => write!(f, "timeout"),
        }
    }
}

/// Identity used to match the same mutant across iterations.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct MutantIdentity {
    pub file: PathBuf,
    pub line: usize,
    pub mutation_type: MutationType,
    pub original: String,
    pub mutated: String,
}

/// The outcome of testing exactly one mutant.
///
/// Fields are copied from the descriptor so the result stays meaningful after
/// the descriptor and the on-disk mutant are gone.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MutationResult {
    pub file: PathBuf,
    pub line: usize,
    pub column: usize,
    pub mutation_type: MutationType,
    pub original: String,
    pub mutated: String,
    pub status: MutantStatus,
    #[serde(default)]
    pub test_output: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<DateTime<Utc>>,
}

impl MutationResult {
    pub fn from_descriptor(
        descriptor: &MutantDescriptor,
        status: MutantStatus,
        test_output: String,
    ) -> Self {
        Self {
            file: descriptor.file.clone(),
            line: descriptor.line,
            column: descriptor.column,
            mutation_type: descriptor.mutation_type.clone(),
            original: descriptor.original.clone(),
            mutated: descriptor.mutated.clone(),
            status,
            test_output,
            timestamp: Some(Utc::now()),
        }
    }

    pub fn identity(&self) -> MutantIdentity {
        MutantIdentity {
            file: self.file.clone(),
            line: self.line,
            mutation_type: self.mutation_type.clone(),
            original: self.original.clone(),
            mutated: self.mutated.clone(),
        }
    }

    /// `path:line:column` for log messages.
    pub fn location(&self) -> String {
        format!("{}:{}:{}", self.file.display(), self.line, self.column)
    }
}

/// Replace earlier results with later ones that share an identity.
///
/// Order follows `earlier`, with results for new identities appended in the
/// order they appear in `later`.
pub fn supersede(earlier: &[MutationResult], later: &[MutationResult]) -> Vec<MutationResult> {
    use std::collections::HashMap;

    let latest: HashMap<MutantIdentity, &MutationResult> =
        later.iter().map(|r| (r.identity(), r)).collect();

    let mut merged: Vec<MutationResult> = earlier
        .iter()
        .map(|r| latest.get(&r.identity()).map_or(r, |l| *l).clone())
        .collect();

    let seen: std::collections::HashSet<MutantIdentity> =
        earlier.iter().map(MutationResult::identity).collect();
    merged.extend(
        later
            .iter()
            .filter(|r| !seen.contains(&r.identity()))
            .cloned(),
    );
    merged
}
