use model::{DecoderConfig, DecoderError, SamplingConfig};
use serde::{Deserialize, Serialize};
use std::{
    fmt, fs,
    path::{Path, PathBuf},
};

use crate::objective::ObjectiveSpec;
use crate::pareto::ParetoCriteria;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TrainingConfig {
    #[serde(default)]
    pub model: DecoderConfig,
    #[serde(default)]
    pub objective: ObjectiveSpec,
    #[serde(default)]
    pub data: DataConfig,
    #[serde(default)]
    pub optimizer: OptimizerConfig,
    #[serde(default)]
    pub runtime: RuntimeConfig,
    #[serde(default)]
    pub evaluation: EvaluationConfig,
}

impl TrainingConfig {
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self, TrainingError> {
        let path = path.as_ref();
        let contents = fs::read_to_string(path)?;
        let mut config: TrainingConfig = match path.extension().and_then(|ext| ext.to_str()) {
            Some("json") => serde_json::from_str(&contents)?,
            Some("toml") | Some("tml") | None => toml::from_str(&contents)?,
            Some(other) => {
                return Err(TrainingError::ConfigFormat(format!(
                    "unsupported configuration extension '{}'",
                    other
                )));
            }
        };

        let base_dir = path.parent().unwrap_or_else(|| Path::new("."));
        config.apply_base_path(base_dir);
        config.validate()?;

        Ok(config)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, TrainingError> {
        Self::from_path(path)
    }

    /// Checks every section and reports all problems at once.
    pub fn validate(&self) -> Result<(), TrainingError> {
        let mut errors: Vec<String> = self
            .model
            .problems()
            .into_iter()
            .map(|problem| format!("model: {problem}"))
            .collect();

        errors.extend(self.objective.problems(self.data.steps_per_epoch));

        if self.data.batch_size == 0 {
            errors.push("data.batch_size must be greater than 0".to_string());
        }

        if self.data.gradient_accumulation_steps == 0 {
            errors.push("data.gradient_accumulation_steps must be greater than 0".to_string());
        }

        if let Some(0) = self.data.steps_per_epoch {
            errors.push("data.steps_per_epoch must be greater than 0".to_string());
        }

        if self.data.max_seq_len < 2 {
            errors.push("data.max_seq_len must be at least 2".to_string());
        }

        if self.data.max_seq_len > self.model.max_positions {
            errors.push(format!(
                "data.max_seq_len ({}) exceeds model.max_positions ({})",
                self.data.max_seq_len, self.model.max_positions
            ));
        }

        if self.optimizer.learning_rate <= 0.0 {
            errors.push("optimizer.learning_rate must be greater than 0".to_string());
        }

        if self.optimizer.weight_decay < 0.0 {
            errors.push("optimizer.weight_decay must be >= 0".to_string());
        }

        if !(0.0 < self.optimizer.beta1 && self.optimizer.beta1 < 1.0) {
            errors.push("optimizer.beta1 must be in (0, 1)".to_string());
        }

        if !(0.0 < self.optimizer.beta2 && self.optimizer.beta2 < 1.0) {
            errors.push("optimizer.beta2 must be in (0, 1)".to_string());
        }

        if let Some(clip) = self.optimizer.gradient_clipping {
            if clip <= 0.0 {
                errors.push("optimizer.gradient_clipping must be greater than 0".to_string());
            }
        }

        if self.runtime.log_every_n_steps == 0 {
            errors.push("runtime.log_every_n_steps must be greater than 0".to_string());
        }

        if let Some(0) = self.runtime.max_steps {
            errors.push("runtime.max_steps must be greater than 0".to_string());
        }

        if let Some(0) = self.runtime.max_epochs {
            errors.push("runtime.max_epochs must be greater than 0".to_string());
        }

        if self.runtime.max_steps.is_none() && self.runtime.max_epochs.is_none() {
            errors.push("runtime must set max_steps or max_epochs".to_string());
        }

        if let Some(0) = self.evaluation.every_n_steps {
            errors.push("evaluation.every_n_steps must be greater than 0".to_string());
        }

        if self.evaluation.iw_ll_n_samples == 0 {
            errors.push("evaluation.iw_ll_n_samples must be greater than 0".to_string());
        }

        if self.evaluation.eval_iw_ll_x_gen {
            let len = self.evaluation.max_seq_len_x_gen;
            if len < 2 || len > self.model.max_positions {
                errors.push(format!(
                    "evaluation.max_seq_len_x_gen must be in [2, {}], got {}",
                    self.model.max_positions, len
                ));
            }
            if self.evaluation.n_sequences_x_gen == 0 {
                errors.push("evaluation.n_sequences_x_gen must be greater than 0".to_string());
            }
        }

        errors.extend(
            self.evaluation
                .pareto
                .problems(self.evaluation.eval_iw_ll_x_gen),
        );

        if !errors.is_empty() {
            return Err(TrainingError::validation(errors));
        }

        Ok(())
    }

    fn apply_base_path(&mut self, base: &Path) {
        self.runtime.apply_base_path(base);
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DataConfig {
    /// Sequences per micro-batch.
    pub batch_size: usize,
    pub gradient_accumulation_steps: usize,
    /// Optimizer steps per epoch; required by cyclical schedules.
    pub steps_per_epoch: Option<usize>,
    pub max_seq_len: usize,
}

impl Default for DataConfig {
    fn default() -> Self {
        Self {
            batch_size: 8,
            gradient_accumulation_steps: 1,
            steps_per_epoch: None,
            max_seq_len: 64,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OptimizerConfig {
    pub learning_rate: f64,
    pub weight_decay: f64,
    pub beta1: f64,
    pub beta2: f64,
    pub epsilon: f64,
    /// Global gradient-norm clip.
    pub gradient_clipping: Option<f64>,
}

impl Default for OptimizerConfig {
    fn default() -> Self {
        Self {
            learning_rate: 5e-5,
            weight_decay: 0.0,
            beta1: 0.9,
            beta2: 0.999,
            epsilon: 1e-8,
            gradient_clipping: Some(1.0),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    pub seed: u64,
    pub max_steps: Option<usize>,
    pub max_epochs: Option<usize>,
    pub log_every_n_steps: usize,
    pub tensorboard_dir: Option<PathBuf>,
    /// Where the trainer state (progress and duals) is written after training.
    pub state_path: Option<PathBuf>,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            seed: 42,
            max_steps: None,
            max_epochs: Some(1),
            log_every_n_steps: 10,
            tensorboard_dir: None,
            state_path: None,
        }
    }
}

impl RuntimeConfig {
    fn apply_base_path(&mut self, base: &Path) {
        for path in [&mut self.tensorboard_dir, &mut self.state_path]
            .into_iter()
            .flatten()
        {
            absolutize_in_place(base, path);
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EvaluationConfig {
    /// Evaluate every N optimizer steps; `None` evaluates only at the end.
    pub every_n_steps: Option<usize>,
    pub max_batches: Option<usize>,
    pub iw_ll_n_samples: usize,
    /// Also score text generated from prior samples.
    pub eval_iw_ll_x_gen: bool,
    pub max_seq_len_x_gen: usize,
    pub n_sequences_x_gen: usize,
    pub sampling: Option<SamplingConfig>,
    pub pareto: ParetoCriteria,
}

impl Default for EvaluationConfig {
    fn default() -> Self {
        Self {
            every_n_steps: None,
            max_batches: None,
            iw_ll_n_samples: 10,
            eval_iw_ll_x_gen: false,
            max_seq_len_x_gen: 64,
            n_sequences_x_gen: 16,
            sampling: None,
            pareto: ParetoCriteria::default(),
        }
    }
}

fn absolutize_in_place(base: &Path, path: &mut PathBuf) {
    if path.as_os_str().is_empty() || path.is_absolute() {
        return;
    }
    let joined = base.join(&*path);
    *path = joined;
}

#[derive(Debug)]
pub enum TrainingError {
    Io(std::io::Error),
    ConfigFormat(String),
    Validation(Vec<String>),
    Initialization(String),
    Runtime(String),
}

impl TrainingError {
    pub fn initialization(message: impl Into<String>) -> Self {
        Self::Initialization(message.into())
    }

    pub fn runtime(message: impl Into<String>) -> Self {
        Self::Runtime(message.into())
    }

    pub fn validation(messages: Vec<String>) -> Self {
        Self::Validation(messages)
    }
}

impl fmt::Display for TrainingError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TrainingError::Io(err) => write!(f, "i/o error: {}", err),
            TrainingError::ConfigFormat(err) => write!(f, "failed to parse config: {}", err),
            TrainingError::Validation(messages) => {
                write!(f, "invalid configuration: {}", messages.join("; "))
            }
            TrainingError::Initialization(msg) => {
                write!(f, "trainer initialization failed: {}", msg)
            }
            TrainingError::Runtime(msg) => write!(f, "training failed: {}", msg),
        }
    }
}

impl std::error::Error for TrainingError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            TrainingError::Io(err) => Some(err),
            TrainingError::ConfigFormat(_)
            | TrainingError::Validation(_)
            | TrainingError::Initialization(_)
            | TrainingError::Runtime(_) => None,
        }
    }
}

impl From<std::io::Error> for TrainingError {
    fn from(value: std::io::Error) -> Self {
        TrainingError::Io(value)
    }
}

impl From<toml::de::Error> for TrainingError {
    fn from(value: toml::de::Error) -> Self {
        TrainingError::ConfigFormat(value.to_string())
    }
}

impl From<serde_json::Error> for TrainingError {
    fn from(value: serde_json::Error) -> Self {
        TrainingError::ConfigFormat(value.to_string())
    }
}

impl From<candle_core::Error> for TrainingError {
    fn from(value: candle_core::Error) -> Self {
        TrainingError::Runtime(value.to_string())
    }
}

impl From<DecoderError> for TrainingError {
    fn from(value: DecoderError) -> Self {
        match value {
            DecoderError::InvalidConfig(message) => TrainingError::Initialization(message),
            other => TrainingError::Runtime(other.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_config(extension: &str, contents: &str) -> (tempfile::TempDir, PathBuf) {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join(format!("train.{extension}"));
        let mut file = fs::File::create(&path).expect("config file");
        file.write_all(contents.as_bytes()).expect("write config");
        (dir, path)
    }

    #[test]
    fn defaults_are_valid() {
        assert!(TrainingConfig::default().validate().is_ok());
    }

    #[test]
    fn loads_toml_and_resolves_relative_paths() -> Result<(), TrainingError> {
        let (dir, path) = write_config(
            "toml",
            r#"
[model]
vocab_size = 32
hidden_size = 16
n_layers = 2
n_heads = 4
latent_size = 8
max_positions = 64

[objective]
name = "beta-vae"
beta = { policy = "linear", value = 1.0, ramp_length = 1000 }

[runtime]
tensorboard_dir = "runs/tb"
"#,
        );
        let config = TrainingConfig::from_path(&path)?;
        assert_eq!(config.model.latent_size, 8);
        assert_eq!(config.objective.kind(), "beta-vae");
        assert_eq!(
            config.runtime.tensorboard_dir,
            Some(dir.path().join("runs/tb"))
        );
        Ok(())
    }

    #[test]
    fn validation_reports_every_violation() {
        let (_dir, path) = write_config(
            "json",
            r#"{
                "model": { "hidden_size": 10, "n_heads": 4 },
                "objective": {
                    "name": "free-bits-beta-vae",
                    "beta": { "policy": "lagrangian", "target": 1.0 }
                },
                "data": { "batch_size": 0 },
                "evaluation": { "pareto": { "d_ks": true } }
            }"#,
        );
        match TrainingConfig::from_path(&path) {
            Err(TrainingError::Validation(messages)) => {
                assert_eq!(messages.len(), 4, "{messages:?}");
                assert!(messages.iter().any(|m| m.starts_with("model:")));
                assert!(messages.iter().any(|m| m.contains("lagrangian")));
                assert!(messages.iter().any(|m| m.contains("data.batch_size")));
                assert!(messages.iter().any(|m| m.contains("eval_iw_ll_x_gen")));
            }
            other => panic!("expected validation error, got {other:?}"),
        }
    }

    #[test]
    fn unknown_objective_and_relation_are_format_errors() {
        let (_dir, path) = write_config("toml", "[objective]\nname = \"wae\"\n");
        assert!(matches!(
            TrainingConfig::from_path(&path),
            Err(TrainingError::ConfigFormat(_))
        ));

        let (_dir, path) = write_config(
            "toml",
            "[objective]\nname = \"beta-vae\"\nbeta = { policy = \"lagrangian\", target = 0.5, relation = \"gt\" }\n",
        );
        assert!(matches!(
            TrainingConfig::from_path(&path),
            Err(TrainingError::ConfigFormat(_))
        ));
    }

    #[test]
    fn unsupported_extension_is_rejected() {
        let (_dir, path) = write_config("yaml", "model: {}");
        assert!(matches!(
            TrainingConfig::from_path(&path),
            Err(TrainingError::ConfigFormat(_))
        ));
    }
}
