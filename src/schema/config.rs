//! Configuration types for a distributed evolution run.
//!
//! A [`FleetConfig`] is loaded once per process from a JSON file plus
//! `key=value` overrides, validated, and then passed by reference to every
//! component. It is never mutated after construction.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// File name of the effective configuration dumped into the output root.
pub const CONFIG_DUMP_NAME: &str = "config.json";

/// Top-level configuration shared by the orchestrator and its workers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FleetConfig {
    /// Shared output root visible to every node.
    pub out_dir: PathBuf,
    /// Index of this node (0 is the leader).
    #[serde(default)]
    pub node_id: usize,
    /// Total number of participating nodes.
    #[serde(default = "default_num_nodes")]
    pub num_nodes: usize,
    /// Base random seed.
    #[serde(default = "default_rng_seed")]
    pub rng_seed: u64,
    /// Population and generation settings.
    #[serde(default)]
    pub evolution: EvolutionSettings,
    /// Parent selection settings.
    #[serde(default)]
    pub tournament: TournamentConfig,
    /// Poll intervals and timeouts.
    #[serde(default)]
    pub timing: TimingConfig,
    /// Built-in parameter genome backend.
    #[serde(default)]
    pub genome: GenomeConstraints,
    /// External evaluation command.
    #[serde(default)]
    pub evaluator: EvaluatorConfig,
}

impl Default for FleetConfig {
    fn default() -> Self {
        Self {
            out_dir: PathBuf::from("output"),
            node_id: 0,
            num_nodes: default_num_nodes(),
            rng_seed: default_rng_seed(),
            evolution: EvolutionSettings::default(),
            tournament: TournamentConfig::default(),
            timing: TimingConfig::default(),
            genome: GenomeConstraints::default(),
            evaluator: EvaluatorConfig::default(),
        }
    }
}

fn default_num_nodes() -> usize {
    1
}
fn default_rng_seed() -> u64 {
    1
}

/// Population and generation settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EvolutionSettings {
    /// Number of evaluated candidates in the initial population.
    #[serde(default = "default_init_population_size")]
    pub init_population_size: usize,
    /// Setup generates `oversample_factor * init_population_size` candidates.
    #[serde(default = "default_oversample_factor")]
    pub oversample_factor: usize,
    /// Number of tournament generations after the initial population.
    #[serde(default = "default_num_generations")]
    pub num_generations: usize,
    /// Candidates added per generation (also the eligibility window size).
    #[serde(default = "default_tournaments_per_gen")]
    pub tournaments_per_gen: usize,
    /// Generation a tournament worker is running (set per phase).
    #[serde(default)]
    pub current_generation: usize,
    /// GPUs per node.
    #[serde(default = "default_num_gpus")]
    pub num_gpus: usize,
    /// Worker processes per GPU.
    #[serde(default = "default_workers_per_gpu")]
    pub workers_per_gpu: usize,
    /// Threads used to generate the oversampled setup batch.
    #[serde(default = "default_num_cpu_processes")]
    pub num_cpu_processes: usize,
}

impl Default for EvolutionSettings {
    fn default() -> Self {
        Self {
            init_population_size: default_init_population_size(),
            oversample_factor: default_oversample_factor(),
            num_generations: default_num_generations(),
            tournaments_per_gen: default_tournaments_per_gen(),
            current_generation: 0,
            num_gpus: default_num_gpus(),
            workers_per_gpu: default_workers_per_gpu(),
            num_cpu_processes: default_num_cpu_processes(),
        }
    }
}

fn default_init_population_size() -> usize {
    100
}
fn default_oversample_factor() -> usize {
    10
}
fn default_num_generations() -> usize {
    10
}
fn default_tournaments_per_gen() -> usize {
    50
}
fn default_num_gpus() -> usize {
    1
}
fn default_workers_per_gpu() -> usize {
    2
}
fn default_num_cpu_processes() -> usize {
    4
}

/// Tournament selection settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TournamentConfig {
    /// Number of eligible candidates sampled per tournament.
    #[serde(default = "default_tournament_size")]
    pub size: usize,
    /// Sample with replacement.
    #[serde(default)]
    pub with_replacement: bool,
}

impl Default for TournamentConfig {
    fn default() -> Self {
        Self {
            size: default_tournament_size(),
            with_replacement: false,
        }
    }
}

fn default_tournament_size() -> usize {
    4
}

/// Poll intervals and timeouts, in seconds.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimingConfig {
    /// Interval between population size checks while supervising workers.
    #[serde(default = "default_poll_interval")]
    pub poll_interval_secs: f64,
    /// Interval between sentinel checks on follower nodes.
    #[serde(default = "default_sentinel_poll")]
    pub sentinel_poll_secs: f64,
    /// How long a follower waits for the leader's setup sentinel.
    #[serde(default = "default_leader_wait_timeout")]
    pub leader_wait_timeout_secs: f64,
    /// Interval between retries when no parent is eligible yet.
    #[serde(default = "default_parent_wait")]
    pub parent_wait_secs: f64,
}

impl Default for TimingConfig {
    fn default() -> Self {
        Self {
            poll_interval_secs: default_poll_interval(),
            sentinel_poll_secs: default_sentinel_poll(),
            leader_wait_timeout_secs: default_leader_wait_timeout(),
            parent_wait_secs: default_parent_wait(),
        }
    }
}

impl TimingConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs_f64(self.poll_interval_secs)
    }

    pub fn sentinel_poll(&self) -> Duration {
        Duration::from_secs_f64(self.sentinel_poll_secs)
    }

    pub fn leader_wait_timeout(&self) -> Duration {
        Duration::from_secs_f64(self.leader_wait_timeout_secs)
    }

    pub fn parent_wait(&self) -> Duration {
        Duration::from_secs_f64(self.parent_wait_secs)
    }
}

fn default_poll_interval() -> f64 {
    10.0
}
fn default_sentinel_poll() -> f64 {
    60.0
}
fn default_leader_wait_timeout() -> f64 {
    3600.0
}
fn default_parent_wait() -> f64 {
    30.0
}

/// Constraints for the built-in parameter genome.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GenomeConstraints {
    /// Number of genes.
    #[serde(default = "default_dimensions")]
    pub dimensions: usize,
    /// Bounds for every gene.
    #[serde(default = "default_value_bounds")]
    pub value_bounds: (f32, f32),
    /// Mutation probability per gene (0.0-1.0).
    #[serde(default = "default_mutation_rate")]
    pub mutation_rate: f32,
    /// Mutation strength, relative to the bounds width.
    #[serde(default = "default_mutation_strength")]
    pub mutation_strength: f32,
    /// Genomes closer than this (mean absolute difference) are near-duplicates.
    #[serde(default = "default_similarity_threshold")]
    pub similarity_threshold: f32,
}

impl Default for GenomeConstraints {
    fn default() -> Self {
        Self {
            dimensions: default_dimensions(),
            value_bounds: default_value_bounds(),
            mutation_rate: default_mutation_rate(),
            mutation_strength: default_mutation_strength(),
            similarity_threshold: default_similarity_threshold(),
        }
    }
}

fn default_dimensions() -> usize {
    8
}
fn default_value_bounds() -> (f32, f32) {
    (-1.0, 1.0)
}
fn default_mutation_rate() -> f32 {
    0.2
}
fn default_mutation_strength() -> f32 {
    0.1
}
fn default_similarity_threshold() -> f32 {
    0.05
}

/// External program that evaluates one candidate.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EvaluatorConfig {
    /// Program to run.
    #[serde(default = "default_evaluator_program")]
    pub program: String,
    /// Arguments placed before the per-candidate arguments.
    #[serde(default)]
    pub args: Vec<String>,
}

impl Default for EvaluatorConfig {
    fn default() -> Self {
        Self {
            program: default_evaluator_program(),
            args: Vec::new(),
        }
    }
}

fn default_evaluator_program() -> String {
    "./evaluate.sh".to_string()
}

// ============================================================================
// Derived values
// ============================================================================

impl FleetConfig {
    /// Whether this node performs population setup.
    pub fn is_leader(&self) -> bool {
        self.node_id == 0
    }

    /// Worker processes per node.
    pub fn num_workers(&self) -> usize {
        self.evolution.num_gpus * self.evolution.workers_per_gpu
    }

    /// Size of the oversampled setup batch.
    pub fn setup_batch_size(&self) -> usize {
        self.evolution.oversample_factor * self.evolution.init_population_size
    }

    /// Lowest rank eligible as a parent in `generation`.
    pub fn min_eligible_rank(&self, generation: usize) -> usize {
        generation * self.evolution.tournaments_per_gen
    }

    /// Population size at which `generation` is complete.
    pub fn generation_target(&self, generation: usize) -> usize {
        self.evolution.init_population_size
            + (generation + 1) * self.evolution.tournaments_per_gen
    }

    /// Where the effective configuration is dumped for workers.
    pub fn dump_path(&self) -> PathBuf {
        self.out_dir.join(CONFIG_DUMP_NAME)
    }

    /// Write the effective configuration into the output root.
    pub fn dump(&self) -> Result<PathBuf, ConfigError> {
        let path = self.dump_path();
        let json = serde_json::to_string_pretty(self)?;

        // Readers only ever see a complete file.
        let staging = self.out_dir.join(format!(".{}.tmp", CONFIG_DUMP_NAME));
        fs::write(&staging, json).map_err(|source| ConfigError::Io {
            path: staging.clone(),
            source,
        })?;
        if let Err(source) = fs::rename(&staging, &path) {
            let _ = fs::remove_file(&staging);
            return Err(ConfigError::Io { path, source });
        }
        Ok(path)
    }
}

// ============================================================================
// Loading
// ============================================================================

impl FleetConfig {
    /// Load a configuration file, apply `key=value` overrides, and validate.
    pub fn load<P: AsRef<Path>>(path: P, overrides: &[String]) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let mut tree: Value = serde_json::from_str(&content)?;
        for entry in overrides {
            apply_override(&mut tree, entry)?;
        }

        let config: FleetConfig = serde_json::from_value(tree)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate configuration.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let out = self.out_dir.as_path();
        if out.as_os_str().is_empty() || out == Path::new("/") || out == Path::new("/tmp") {
            return Err(ConfigError::UnsafeOutDir(self.out_dir.clone()));
        }

        if self.num_nodes == 0 {
            return Err(ConfigError::ZeroValue("num_nodes"));
        }
        if self.node_id >= self.num_nodes {
            return Err(ConfigError::NodeOutOfRange {
                node_id: self.node_id,
                num_nodes: self.num_nodes,
            });
        }

        let evo = &self.evolution;
        let counts = [
            (evo.init_population_size, "evolution.init_population_size"),
            (evo.oversample_factor, "evolution.oversample_factor"),
            (evo.tournaments_per_gen, "evolution.tournaments_per_gen"),
            (evo.num_gpus, "evolution.num_gpus"),
            (evo.workers_per_gpu, "evolution.workers_per_gpu"),
            (evo.num_cpu_processes, "evolution.num_cpu_processes"),
            (self.tournament.size, "tournament.size"),
            (self.genome.dimensions, "genome.dimensions"),
        ];
        for (value, name) in counts {
            if value == 0 {
                return Err(ConfigError::ZeroValue(name));
            }
        }

        let timings = [
            (self.timing.poll_interval_secs, "timing.poll_interval_secs"),
            (self.timing.sentinel_poll_secs, "timing.sentinel_poll_secs"),
            (
                self.timing.leader_wait_timeout_secs,
                "timing.leader_wait_timeout_secs",
            ),
            (self.timing.parent_wait_secs, "timing.parent_wait_secs"),
        ];
        for (value, name) in timings {
            if !value.is_finite() || value <= 0.0 {
                return Err(ConfigError::InvalidDuration(name));
            }
        }

        let (lo, hi) = self.genome.value_bounds;
        if !(lo < hi) {
            return Err(ConfigError::InvalidBounds(format!(
                "genome.value_bounds min ({}) >= max ({})",
                lo, hi
            )));
        }
        if !(0.0..=1.0).contains(&self.genome.mutation_rate) {
            return Err(ConfigError::InvalidBounds(format!(
                "genome.mutation_rate {} outside [0, 1]",
                self.genome.mutation_rate
            )));
        }

        if self.evaluator.program.trim().is_empty() {
            return Err(ConfigError::MissingEvaluator);
        }

        Ok(())
    }
}

/// Apply one dotted `key=value` override to a JSON tree.
///
/// The value is parsed as JSON when possible (`3`, `true`, `[1,2]`) and
/// otherwise stored as a string. Intermediate objects are created on demand.
pub fn apply_override(tree: &mut Value, entry: &str) -> Result<(), ConfigError> {
    let (key, raw) = entry
        .split_once('=')
        .ok_or_else(|| ConfigError::InvalidOverride(entry.to_string()))?;
    let key = key.trim();
    if key.is_empty() || key.split('.').any(str::is_empty) {
        return Err(ConfigError::InvalidOverride(entry.to_string()));
    }

    let value = serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.to_string()));

    let mut node = tree;
    let mut segments = key.split('.').peekable();
    while let Some(segment) = segments.next() {
        let Value::Object(map) = node else {
            return Err(ConfigError::InvalidOverride(entry.to_string()));
        };
        if segments.peek().is_none() {
            map.insert(segment.to_string(), value);
            return Ok(());
        }
        node = map
            .entry(segment.to_string())
            .or_insert_with(|| Value::Object(Default::default()));
    }

    Ok(())
}

/// Configuration errors. All of them are fatal at startup.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read or write {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("Invalid configuration JSON: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("Override '{0}' must have the form key.path=value")]
    InvalidOverride(String),
    #[error("Output directory {0} is not a safe shared root")]
    UnsafeOutDir(PathBuf),
    #[error("{0} must be non-zero")]
    ZeroValue(&'static str),
    #[error("{0} must be a positive number of seconds")]
    InvalidDuration(&'static str),
    #[error("node_id {node_id} out of range for {num_nodes} nodes")]
    NodeOutOfRange { node_id: usize, num_nodes: usize },
    #[error("Invalid parameter bounds: {0}")]
    InvalidBounds(String),
    #[error("Evaluator program must be set")]
    MissingEvaluator,
}
