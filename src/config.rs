use crate::grammar::BuildMethod;
use crate::problems::ProblemKind;
use crate::tree::{Node, NodeKind};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;

pub const STORE_PATH_VAR: &str = "ARBOREAL_STORE_PATH";
pub const SEED_VAR: &str = "ARBOREAL_SEED";

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Invalid configuration value for `{field}`: {reason}")]
    Invalid { field: &'static str, reason: String },
    #[error("Could not read configuration: {0}")]
    Io(#[from] std::io::Error),
    #[error("Could not parse configuration: {0}")]
    Parse(#[from] serde_json::Error),
}

fn invalid(field: &'static str, reason: impl Into<String>) -> ConfigError {
    ConfigError::Invalid {
        field,
        reason: reason.into(),
    }
}

/// What to do when a tree fails to evaluate.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum EvalFailurePolicy {
    /// Keep the individual with the worst possible fitness.
    #[default]
    WorstFitness,
    /// Abort the generation with the evaluation error.
    Abort,
}

// --- Defaults ---

fn default_max_concurrency() -> usize {
    num_cpus::get()
}
fn default_population_size() -> usize {
    200
}
fn default_root_node() -> Node {
    Node::new(NodeKind::Root, 1, "root")
}
fn default_min_depth() -> usize {
    2
}
fn default_max_depth() -> usize {
    8
}
fn default_max_generations() -> u32 {
    100
}
fn default_fitness_criterion() -> f64 {
    1e-7
}
fn default_crossover_probability() -> f64 {
    0.5
}
fn default_mutation_probability() -> f64 {
    0.49
}
fn default_tournament_size() -> usize {
    7
}
fn default_selection_probability() -> f64 {
    0.8
}
fn default_true() -> bool {
    true
}
fn default_store_path() -> PathBuf {
    PathBuf::from("population.json")
}
fn default_islands() -> usize {
    4
}
fn default_store_path_template() -> String {
    "island_{}.json".to_string()
}
fn default_migration_probability() -> f64 {
    0.02
}

/// Settings of one evolutionary run. Immutable once the run has started.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct EvolverConfig {
    #[serde(default = "default_population_size")]
    pub population_size: usize,
    #[serde(default = "default_root_node")]
    pub root_node: Node,
    #[serde(default = "default_min_depth")]
    pub min_depth: usize,
    #[serde(default = "default_max_depth")]
    pub max_depth: usize,
    #[serde(default)]
    pub build_method: BuildMethod,
    #[serde(default = "default_max_generations")]
    pub max_generations: u32,
    /// Success once the best fitness is at or below this value.
    #[serde(default = "default_fitness_criterion")]
    pub fitness_criterion: f64,
    #[serde(default = "default_crossover_probability")]
    pub crossover_probability: f64,
    #[serde(default = "default_mutation_probability")]
    pub mutation_probability: f64,
    #[serde(default = "default_tournament_size")]
    pub tournament_size: usize,
    #[serde(default = "default_selection_probability")]
    pub selection_probability: f64,
    #[serde(default = "default_true")]
    pub start_from_scratch: bool,
    #[serde(default = "default_store_path")]
    pub store_path: PathBuf,
    #[serde(default)]
    pub seed: Option<u64>,
    #[serde(default)]
    pub eval_failure_policy: EvalFailurePolicy,
    #[serde(default = "default_max_concurrency")]
    pub max_concurrency: usize,
}

impl Default for EvolverConfig {
    fn default() -> Self {
        EvolverConfig {
            population_size: default_population_size(),
            root_node: default_root_node(),
            min_depth: default_min_depth(),
            max_depth: default_max_depth(),
            build_method: BuildMethod::default(),
            max_generations: default_max_generations(),
            fitness_criterion: default_fitness_criterion(),
            crossover_probability: default_crossover_probability(),
            mutation_probability: default_mutation_probability(),
            tournament_size: default_tournament_size(),
            selection_probability: default_selection_probability(),
            start_from_scratch: true,
            store_path: default_store_path(),
            seed: None,
            eval_failure_policy: EvalFailurePolicy::default(),
            max_concurrency: default_max_concurrency(),
        }
    }
}

fn check_probability(field: &'static str, p: f64) -> Result<(), ConfigError> {
    if (0.0..=1.0).contains(&p) {
        Ok(())
    } else {
        Err(invalid(field, format!("{p} is not a probability")))
    }
}

impl EvolverConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.population_size == 0 {
            return Err(invalid("population_size", "must be positive"));
        }
        if self.min_depth == 0 || self.min_depth > self.max_depth {
            return Err(invalid(
                "min_depth",
                format!("need 1 <= min_depth <= max_depth, got {}..{}", self.min_depth, self.max_depth),
            ));
        }
        if self.tournament_size == 0 {
            return Err(invalid("tournament_size", "must be positive"));
        }
        if self.max_concurrency == 0 {
            return Err(invalid("max_concurrency", "must be positive"));
        }
        check_probability("crossover_probability", self.crossover_probability)?;
        check_probability("mutation_probability", self.mutation_probability)?;
        check_probability("selection_probability", self.selection_probability)?;
        if self.crossover_probability + self.mutation_probability > 1.0 {
            return Err(invalid(
                "mutation_probability",
                "crossover and mutation probabilities add up to more than 1",
            ));
        }
        Ok(())
    }

    /// Applies `ARBOREAL_STORE_PATH` and `ARBOREAL_SEED` when set.
    pub fn apply_env_overrides(&mut self) -> Result<(), ConfigError> {
        if let Ok(path) = std::env::var(STORE_PATH_VAR) {
            self.store_path = PathBuf::from(path);
        }
        if let Ok(seed) = std::env::var(SEED_VAR) {
            self.seed = Some(
                seed.parse()
                    .map_err(|_| invalid("seed", format!("`{seed}` is not an integer")))?,
            );
        }
        Ok(())
    }
}

/// Settings for a ring of islands.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct IslandsConfig {
    #[serde(default = "default_islands")]
    pub islands: usize,
    /// Store path per island; `{}` is replaced by the 1-based island number.
    #[serde(default = "default_store_path_template")]
    pub store_path_template: String,
    #[serde(default = "default_migration_probability")]
    pub migration_probability: f64,
    /// Base URLs of remote workers; empty runs every island in-process.
    #[serde(default)]
    pub worker_endpoints: Vec<String>,
    #[serde(default)]
    pub evolver: EvolverConfig,
    #[serde(default)]
    pub problem: ProblemKind,
}

impl Default for IslandsConfig {
    fn default() -> Self {
        IslandsConfig {
            islands: default_islands(),
            store_path_template: default_store_path_template(),
            migration_probability: default_migration_probability(),
            worker_endpoints: Vec::new(),
            evolver: EvolverConfig::default(),
            problem: ProblemKind::default(),
        }
    }
}

impl IslandsConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.islands == 0 {
            return Err(invalid("islands", "need at least one island"));
        }
        if !self.store_path_template.contains("{}") {
            return Err(invalid(
                "store_path_template",
                format!("`{}` has no `{{}}` placeholder", self.store_path_template),
            ));
        }
        if !self.worker_endpoints.is_empty() && self.worker_endpoints.len() != self.islands {
            return Err(invalid(
                "worker_endpoints",
                format!(
                    "{} endpoints for {} islands",
                    self.worker_endpoints.len(),
                    self.islands
                ),
            ));
        }
        check_probability("migration_probability", self.migration_probability)?;
        self.evolver.validate()
    }
}

/// Single-island run settings: the evolver plus the problem it solves.
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
pub struct RunConfig {
    #[serde(default)]
    pub evolver: EvolverConfig,
    #[serde(default)]
    pub problem: ProblemKind,
}

impl RunConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.evolver.validate()
    }
}

/// Reads a JSON config file, then layers `.env` and environment overrides.
pub fn load_run_config(path: Option<&Path>) -> Result<RunConfig, ConfigError> {
    let mut config: RunConfig = match path {
        Some(path) => serde_json::from_str(&std::fs::read_to_string(path)?)?,
        None => RunConfig::default(),
    };
    dotenv::dotenv().ok();
    config.evolver.apply_env_overrides()?;
    config.validate()?;
    Ok(config)
}

pub fn load_islands_config(path: Option<&Path>) -> Result<IslandsConfig, ConfigError> {
    let mut config: IslandsConfig = match path {
        Some(path) => serde_json::from_str(&std::fs::read_to_string(path)?)?,
        None => IslandsConfig::default(),
    };
    dotenv::dotenv().ok();
    config.evolver.apply_env_overrides()?;
    config.validate()?;
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_document_takes_defaults() {
        let config: EvolverConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(config.population_size, 200);
        assert_eq!(config.root_node, Node::new(NodeKind::Root, 1, "root"));
        assert_eq!(config.fitness_criterion, 1e-7);
        assert_eq!(config.tournament_size, 7);
        assert!(config.start_from_scratch);
        assert_eq!(config.eval_failure_policy, EvalFailurePolicy::WorstFitness);
        config.validate().unwrap();
    }

    #[test]
    fn test_validation_rejects_bad_values() {
        let config = EvolverConfig {
            crossover_probability: 0.8,
            mutation_probability: 0.3,
            ..EvolverConfig::default()
        };
        assert!(config.validate().is_err());

        let config = EvolverConfig {
            min_depth: 9,
            ..EvolverConfig::default()
        };
        assert!(config.validate().is_err());

        let islands = IslandsConfig {
            store_path_template: "island.json".into(),
            ..IslandsConfig::default()
        };
        assert!(matches!(
            islands.validate(),
            Err(ConfigError::Invalid { field: "store_path_template", .. })
        ));
    }

    #[test]
    fn test_islands_config_parses_partial_document() {
        let config: IslandsConfig = serde_json::from_str(
            r#"{"islands": 3, "evolver": {"population_size": 50, "seed": 4}}"#,
        )
        .unwrap();
        assert_eq!(config.islands, 3);
        assert_eq!(config.migration_probability, 0.02);
        assert_eq!(config.evolver.population_size, 50);
        assert_eq!(config.evolver.seed, Some(4));
        config.validate().unwrap();
    }
}
