use crate::args::ParamShape;
use serde::Deserialize;
use std::collections::HashMap;
use std::path::PathBuf;

/// Engine configuration, immutable after construction.
///
/// Loaded from TOML; every field has a default so a minimal config (or none at
/// all) still yields a runnable engine.
#[derive(Deserialize, Debug, Clone)]
#[serde(rename_all = "kebab-case")]
#[serde(deny_unknown_fields)]
pub struct EngineConfig {
    /// Directory for crash artifacts, novel-input artifacts, and state files.
    #[serde(default = "default_corpus_dir")]
    pub corpus_dir: PathBuf,
    /// External mutation provider command; empty means no provider (identity).
    #[serde(default)]
    pub mutator_command: Vec<String>,
    #[serde(default = "default_mutator_max_output_bytes")]
    pub mutator_max_output_bytes: usize,
    #[serde(default = "default_mutator_timeout_ms")]
    pub mutator_timeout_ms: u64,
    /// Per-callable invocation timeout.
    #[serde(default = "default_call_timeout_ms")]
    pub call_timeout_ms: u64,
    /// Fixed inter-iteration delay (back-pressure on the session and the
    /// mutation provider channel).
    #[serde(default = "default_exec_delay_ms")]
    pub exec_delay_ms: u64,
    #[serde(default = "default_save_crashes")]
    pub save_crashes: bool,
    /// Optional seed file, one seed per non-empty line.
    #[serde(default)]
    pub seed_file: Option<PathBuf>,
    /// Optional fixed RNG seed for reproducible runs.
    #[serde(default)]
    pub rng_seed: Option<u64>,
    /// Explicit per-parameter shape descriptor (name -> scalar | sequence).
    #[serde(default)]
    pub param_shapes: HashMap<String, ParamShape>,
}

pub fn default_corpus_dir() -> PathBuf {
    PathBuf::from("./.harrier_corpus")
}

fn default_mutator_max_output_bytes() -> usize {
    10 * 1024 * 1024
}

fn default_mutator_timeout_ms() -> u64 {
    5000
}

fn default_call_timeout_ms() -> u64 {
    2000
}

fn default_exec_delay_ms() -> u64 {
    10
}

fn default_save_crashes() -> bool {
    true
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            corpus_dir: default_corpus_dir(),
            mutator_command: Vec::new(),
            mutator_max_output_bytes: default_mutator_max_output_bytes(),
            mutator_timeout_ms: default_mutator_timeout_ms(),
            call_timeout_ms: default_call_timeout_ms(),
            exec_delay_ms: default_exec_delay_ms(),
            save_crashes: default_save_crashes(),
            seed_file: None,
            rng_seed: None,
            param_shapes: HashMap::new(),
        }
    }
}

impl EngineConfig {
    pub fn load_from_file(path: &PathBuf) -> Result<Self, anyhow::Error> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| anyhow::anyhow!("Failed to read config file at {:?}: {}", path, e))?;

        let config: EngineConfig = toml::from_str(&content).map_err(|e| {
            anyhow::anyhow!("Failed to parse TOML from config file {:?}: {}", path, e)
        })?;

        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn minimal_toml_fills_in_defaults() {
        let config: EngineConfig = toml::from_str("").unwrap();
        assert_eq!(config.corpus_dir, default_corpus_dir());
        assert!(config.mutator_command.is_empty());
        assert_eq!(config.mutator_max_output_bytes, 10 * 1024 * 1024);
        assert_eq!(config.mutator_timeout_ms, 5000);
        assert_eq!(config.call_timeout_ms, 2000);
        assert_eq!(config.exec_delay_ms, 10);
        assert!(config.save_crashes);
        assert!(config.seed_file.is_none());
        assert!(config.param_shapes.is_empty());
    }

    #[test]
    fn full_toml_round_trips() {
        let config: EngineConfig = toml::from_str(
            r#"
            corpus-dir = "/tmp/corpus"
            mutator-command = ["python3", "mutate.py"]
            mutator-timeout-ms = 1000
            call-timeout-ms = 250
            exec-delay-ms = 0
            save-crashes = false
            seed-file = "seeds.txt"
            rng-seed = 42

            [param-shapes]
            query = "scalar"
            rows = "sequence"
            "#,
        )
        .unwrap();
        assert_eq!(config.corpus_dir, PathBuf::from("/tmp/corpus"));
        assert_eq!(config.mutator_command, vec!["python3", "mutate.py"]);
        assert_eq!(config.mutator_timeout_ms, 1000);
        assert_eq!(config.call_timeout_ms, 250);
        assert!(!config.save_crashes);
        assert_eq!(config.rng_seed, Some(42));
        assert_eq!(config.param_shapes.get("rows"), Some(&ParamShape::Sequence));
        assert_eq!(config.param_shapes.get("query"), Some(&ParamShape::Scalar));
    }

    #[test]
    fn unknown_fields_are_rejected() {
        let result: Result<EngineConfig, _> = toml::from_str("no-such-knob = true");
        assert!(result.is_err(), "deny_unknown_fields must reject typos");
    }

    #[test]
    fn load_from_missing_file_is_an_error() {
        let missing = PathBuf::from("/definitely/not/here/harrier.toml");
        assert!(EngineConfig::load_from_file(&missing).is_err());
    }
}
