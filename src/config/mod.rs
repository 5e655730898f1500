use crate::mutation::ALL_OPERATORS;
use crate::scoring::ScoringPolicy;
use anyhow::{Context, Result};
use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Application configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// General settings
    #[serde(default)]
    pub general: GeneralConfig,

    /// Mutant generator settings
    #[serde(default)]
    pub generator: GeneratorConfig,

    /// How mutants are tested
    #[serde(default)]
    pub evaluation: EvaluationConfig,

    /// Text-generation API used to draft tests
    #[serde(default)]
    pub llm: LlmConfig,

    /// Severity table and keyword heuristics
    #[serde(default)]
    pub scoring: ScoringPolicy,

    /// Session and iteration settings
    #[serde(default)]
    pub session: SessionConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GeneralConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GeneratorConfig {
    /// Generator executable
    #[serde(default = "default_generator_binary")]
    pub binary: String,

    /// Solidity compiler handed to the generator
    #[serde(default = "default_solc")]
    pub solc: String,

    /// Timeout for one generator run, in seconds
    #[serde(default = "default_generator_timeout")]
    pub timeout_seconds: u64,

    /// Mutation operators to enable
    #[serde(default = "default_operators")]
    pub operators: Vec<String>,

    /// Mutants requested per source file
    #[serde(default = "default_mutants_per_file")]
    pub mutants_per_file: usize,

    /// Directory (relative to the project) for generator configs and output
    #[serde(default = "default_work_dir")]
    pub work_dir: PathBuf,

    /// Remapping prefixes that are safe to forward to the generator
    #[serde(default = "default_remapping_allow_list")]
    pub remapping_allow_list: Vec<String>,

    /// Remappings used when discovery finds nothing
    #[serde(default = "default_fallback_remappings")]
    pub fallback_remappings: Vec<String>,

    /// Extra glob patterns for source files that must never be mutated
    #[serde(default)]
    pub exclude_globs: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EvaluationConfig {
    /// Command that runs the project's test suite
    #[serde(default = "default_test_command")]
    pub test_command: String,

    /// Timeout for one test run, in seconds
    #[serde(default = "default_test_timeout")]
    pub timeout_seconds: u64,

    /// Maximum test output kept per mutant (bytes)
    #[serde(default = "default_max_output_bytes")]
    pub max_output_bytes: usize,

    /// Run the unmutated test suite first and abort if it fails
    #[serde(default = "default_enabled")]
    pub verify_baseline: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmConfig {
    /// Base URL of the text-generation API
    #[serde(default = "default_llm_base_url")]
    pub base_url: String,

    /// Model identifier
    #[serde(default = "default_llm_model")]
    pub model: String,

    /// Request timeout, in seconds
    #[serde(default = "default_llm_timeout")]
    pub timeout_seconds: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionConfig {
    /// Where session records, reports and generated tests are written
    #[serde(default = "default_output_dir")]
    pub output_dir: PathBuf,

    /// Hard cap on iterations in iterative mode
    #[serde(default = "default_max_iterations")]
    pub max_iterations: u32,

    /// Consecutive iterations without improvement before asking to continue
    #[serde(default = "default_no_improvement_limit")]
    pub no_improvement_limit: u32,
}

fn default_enabled() -> bool {
    true
}

// Default value functions
fn default_log_level() -> String {
    "info".to_string()
}

fn default_generator_binary() -> String {
    "gambit".to_string()
}

fn default_solc() -> String {
    "solc".to_string()
}

fn default_generator_timeout() -> u64 {
    180 // 3 minutes
}

fn default_operators() -> Vec<String> {
    ALL_OPERATORS.iter().map(|s| s.to_string()).collect()
}

fn default_mutants_per_file() -> usize {
    25
}

fn default_work_dir() -> PathBuf {
    PathBuf::from(".guardian")
}

fn default_remapping_allow_list() -> Vec<String> {
    [
        "@openzeppelin/",
        "openzeppelin-contracts/",
        "forge-std/",
        "ds-test/",
        "solmate/",
        "solady/",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}

fn default_fallback_remappings() -> Vec<String> {
    [
        "@openzeppelin/=lib/openzeppelin-contracts/",
        "forge-std/=lib/forge-std/src/",
        "ds-test/=lib/forge-std/lib/ds-test/src/",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}

fn default_test_command() -> String {
    "forge test".to_string()
}

fn default_test_timeout() -> u64 {
    120 // 2 minutes
}

fn default_max_output_bytes() -> usize {
    10_000
}

fn default_llm_base_url() -> String {
    "https://generativelanguage.googleapis.com/v1beta".to_string()
}

fn default_llm_model() -> String {
    "gemini-1.5-flash".to_string()
}

fn default_llm_timeout() -> u64 {
    120
}

fn default_output_dir() -> PathBuf {
    PathBuf::from("guardian-results")
}

fn default_max_iterations() -> u32 {
    10
}

fn default_no_improvement_limit() -> u32 {
    3
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
        }
    }
}

impl Default for GeneratorConfig {
    fn default() -> Self {
        Self {
            binary: default_generator_binary(),
            solc: default_solc(),
            timeout_seconds: default_generator_timeout(),
            operators: default_operators(),
            mutants_per_file: default_mutants_per_file(),
            work_dir: default_work_dir(),
            remapping_allow_list: default_remapping_allow_list(),
            fallback_remappings: default_fallback_remappings(),
            exclude_globs: Vec::new(),
        }
    }
}

impl Default for EvaluationConfig {
    fn default() -> Self {
        Self {
            test_command: default_test_command(),
            timeout_seconds: default_test_timeout(),
            max_output_bytes: default_max_output_bytes(),
            verify_baseline: default_enabled(),
        }
    }
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            base_url: default_llm_base_url(),
            model: default_llm_model(),
            timeout_seconds: default_llm_timeout(),
        }
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            output_dir: default_output_dir(),
            max_iterations: default_max_iterations(),
            no_improvement_limit: default_no_improvement_limit(),
        }
    }
}

impl Config {
    /// Load configuration from file, or create default if not found
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let config_path = path.map(PathBuf::from).or_else(Self::default_config_path);

        let config = if let Some(ref path) = config_path {
            if path.exists() {
                let contents = std::fs::read_to_string(path)
                    .with_context(|| format!("Failed to read config from {:?}", path))?;
                toml::from_str(&contents)
                    .with_context(|| format!("Failed to parse config from {:?}", path))?
            } else {
                Config::default()
            }
        } else {
            Config::default()
        };

        Ok(config)
    }

    /// Save configuration to file
    pub fn save(&self, path: Option<&Path>) -> Result<PathBuf> {
        let config_path = path
            .map(PathBuf::from)
            .or_else(Self::default_config_path)
            .context("No config path available")?;

        // Ensure parent directory exists
        if let Some(parent) = config_path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create config directory: {:?}", parent))?;
        }

        let contents = toml::to_string_pretty(self).context("Failed to serialize config")?;
        std::fs::write(&config_path, contents)
            .with_context(|| format!("Failed to write config to {:?}", config_path))?;

        Ok(config_path)
    }

    /// Get the default configuration file path
    pub fn default_config_path() -> Option<PathBuf> {
        ProjectDirs::from("com", "guardian", "guardian")
            .map(|dirs| dirs.config_dir().join("config.toml"))
    }
}

/// A credential that must never reach logs or persisted artifacts.
///
/// Not `Serialize`; `Debug` prints a placeholder.
#[derive(Clone, PartialEq, Eq)]
pub struct Secret(String);

impl Secret {
    /// Wrap a credential; blank values are treated as absent.
    pub fn new(value: impl Into<String>) -> Option<Self> {
        let value = value.into();
        let trimmed = value.trim();
        if trimmed.is_empty() {
            None
        } else {
            Some(Self(trimmed.to_string()))
        }
    }

    pub fn expose(&self) -> &str {
        &self.0
    }

    /// Replace every occurrence of the secret in `text`.
    pub fn redact(&self, text: &str) -> String {
        text.replace(&self.0, "***")
    }
}

impl std::fmt::Debug for Secret {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Secret(***)")
    }
}
