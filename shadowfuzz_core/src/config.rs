use crate::differential::Normalization;
use crate::executor::{
    CommandExecutor, CommandExecutorConfig, DEFAULT_OUTPUT_LIMIT, DEFAULT_STARTUP_ALLOWANCE_MS,
    DEFAULT_TIMEOUT_MS, InputDelivery, TimeoutPolicy,
};
use crate::generator::DEFAULT_GRAMMAR_MAX_DEPTH;
use crate::minimizer::DEFAULT_MAX_ATTEMPTS;
use crate::oracle::{DifferentialOracle, Oracle, SingleBackendOracle};
use crate::pool::default_workers;
use crate::render::RenderSettings;
use serde::Deserialize;
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

pub const DEFAULT_CONFIG_FILE: &str = "shadowfuzz.toml";

#[derive(Deserialize, Debug, Clone, PartialEq, Eq, Default)]
#[serde(rename_all = "kebab-case")]
pub enum ConfigInputDelivery {
    #[default]
    #[serde(rename = "stdin")]
    StdIn,
    File {
        template: String,
        #[serde(default = "default_suffix")]
        suffix: String,
    },
}

fn default_suffix() -> String {
    ".src".to_string()
}

impl From<ConfigInputDelivery> for InputDelivery {
    fn from(delivery: ConfigInputDelivery) -> Self {
        match delivery {
            ConfigInputDelivery::StdIn => InputDelivery::StdIn,
            ConfigInputDelivery::File { template, suffix } => InputDelivery::File { template, suffix },
        }
    }
}

/// One toolchain backend.
#[derive(Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
#[serde(deny_unknown_fields)]
pub struct BackendSettings {
    pub name: String,
    pub command: Vec<String>,
    #[serde(default)]
    pub input_delivery: ConfigInputDelivery,
    pub working_dir: Option<PathBuf>,
}

#[derive(Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
#[serde(deny_unknown_fields)]
pub struct FuzzerSettings {
    #[serde(default = "default_workers")]
    pub threads: usize,
    #[serde(default = "default_timeout_ms")]
    pub default_timeout_ms: u64,
    #[serde(default = "default_startup_allowance_ms")]
    pub startup_allowance_ms: u64,
    #[serde(default = "default_output_limit_bytes")]
    pub output_limit_bytes: usize,
}

fn default_timeout_ms() -> u64 {
    DEFAULT_TIMEOUT_MS
}
fn default_startup_allowance_ms() -> u64 {
    DEFAULT_STARTUP_ALLOWANCE_MS
}
fn default_output_limit_bytes() -> usize {
    DEFAULT_OUTPUT_LIMIT
}

impl Default for FuzzerSettings {
    fn default() -> Self {
        Self {
            threads: default_workers(),
            default_timeout_ms: default_timeout_ms(),
            startup_allowance_ms: default_startup_allowance_ms(),
            output_limit_bytes: default_output_limit_bytes(),
        }
    }
}

#[derive(Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
#[serde(deny_unknown_fields)]
pub struct MinimizerSettings {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: usize,
}

fn default_max_attempts() -> usize {
    DEFAULT_MAX_ATTEMPTS
}

impl Default for MinimizerSettings {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
        }
    }
}

#[derive(Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
#[serde(deny_unknown_fields)]
pub struct CorpusSettings {
    #[serde(default = "default_corpus_path")]
    pub path: PathBuf,
}

pub fn default_corpus_path() -> PathBuf {
    PathBuf::from("./.shadowfuzz_corpus")
}

impl Default for CorpusSettings {
    fn default() -> Self {
        Self {
            path: default_corpus_path(),
        }
    }
}

#[derive(Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
#[serde(deny_unknown_fields)]
pub struct GeneratorSettings {
    #[serde(default = "default_grammar_max_depth")]
    pub grammar_max_depth: usize,
    /// Grammar file used instead of the built-in one.
    pub grammar: Option<PathBuf>,
    /// Seed programs for the mutation strategy.
    #[serde(default)]
    pub seed_paths: Vec<PathBuf>,
}

fn default_grammar_max_depth() -> usize {
    DEFAULT_GRAMMAR_MAX_DEPTH
}

impl Default for GeneratorSettings {
    fn default() -> Self {
        Self {
            grammar_max_depth: default_grammar_max_depth(),
            grammar: None,
            seed_paths: Vec::new(),
        }
    }
}

#[derive(Deserialize, Debug, Clone, Default, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
#[serde(deny_unknown_fields)]
pub struct ShadowfuzzConfig {
    #[serde(default)]
    pub fuzzer: FuzzerSettings,
    /// One backend runs single-backend; two enable differential execution.
    #[serde(default)]
    pub backends: Vec<BackendSettings>,
    #[serde(default)]
    pub render: RenderSettings,
    #[serde(default)]
    pub differential: Normalization,
    #[serde(default)]
    pub minimizer: MinimizerSettings,
    #[serde(default)]
    pub corpus: CorpusSettings,
    #[serde(default)]
    pub generator: GeneratorSettings,
}

impl ShadowfuzzConfig {
    pub fn from_toml(content: &str) -> Result<Self, anyhow::Error> {
        let config: ShadowfuzzConfig = toml::from_str(content)
            .map_err(|e| anyhow::anyhow!("Failed to parse TOML configuration: {}", e))?;
        config.validate()?;
        Ok(config)
    }

    pub fn load_from_file(path: &Path) -> Result<Self, anyhow::Error> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| anyhow::anyhow!("Failed to read config file at {:?}: {}", path, e))?;
        Self::from_toml(&content)
            .map_err(|e| anyhow::anyhow!("Invalid config file {:?}: {}", path, e))
    }

    /// Loads `path` if given, else `shadowfuzz.toml` in the current directory
    /// if present, else built-in defaults.
    pub fn load_or_default(path: Option<&Path>) -> Result<Self, anyhow::Error> {
        if let Some(path) = path {
            return Self::load_from_file(path);
        }
        let default_path = Path::new(DEFAULT_CONFIG_FILE);
        if default_path.exists() {
            Self::load_from_file(default_path)
        } else {
            Ok(Self::default())
        }
    }

    pub fn validate(&self) -> Result<(), anyhow::Error> {
        if self.backends.len() > 2 {
            anyhow::bail!(
                "At most two backends can be configured, found {}",
                self.backends.len()
            );
        }
        let mut names = BTreeSet::new();
        for backend in &self.backends {
            if backend.command.is_empty() {
                anyhow::bail!("Backend '{}' has an empty command", backend.name);
            }
            if !names.insert(backend.name.as_str()) {
                anyhow::bail!("Backend name '{}' is used twice", backend.name);
            }
            if let ConfigInputDelivery::File { template, .. } = &backend.input_delivery {
                if !template.contains("{}") {
                    anyhow::bail!(
                        "Backend '{}' delivers input by file but its template has no '{{}}' placeholder",
                        backend.name
                    );
                }
            }
        }
        if self.fuzzer.threads == 0 {
            anyhow::bail!("fuzzer.threads must be at least 1");
        }
        Ok(())
    }

    pub fn executor_config(&self, backend: &BackendSettings) -> CommandExecutorConfig {
        let mut config = CommandExecutorConfig::new(backend.name.clone(), backend.command.clone());
        config.input_delivery = backend.input_delivery.clone().into();
        config.working_dir = backend.working_dir.clone();
        config.output_limit = self.fuzzer.output_limit_bytes;
        config
    }

    /// Single-backend oracle for one backend, differential for two.
    pub fn build_oracle(&self) -> Result<Box<dyn Oracle>, anyhow::Error> {
        let executor = |backend: &BackendSettings| Box::new(CommandExecutor::new(self.executor_config(backend)));
        match self.backends.as_slice() {
            [] => Err(anyhow::anyhow!(
                "No backends configured; add a [[backends]] section to the configuration"
            )),
            [only] => Ok(Box::new(SingleBackendOracle::new(executor(only)))),
            [a, b] => Ok(Box::new(DifferentialOracle::new(
                executor(a),
                executor(b),
                self.differential,
            ))),
            more => Err(anyhow::anyhow!(
                "At most two backends can be configured, found {}",
                more.len()
            )),
        }
    }

    pub fn timeout_policy(&self, override_ms: Option<u64>) -> TimeoutPolicy {
        TimeoutPolicy {
            startup_allowance_ms: self.fuzzer.startup_allowance_ms,
            default_timeout_ms: self.fuzzer.default_timeout_ms,
            override_ms,
        }
    }
}
