use serde::{Deserialize, Serialize};

use crate::error::{DecoderError, Result};

/// Ways a latent vector can reach the decoder. Any combination may be on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LatentMechanisms {
    /// Prepend a projected memory slot to every layer's keys and values.
    pub memory: bool,
    /// Add a projected vector to every input embedding.
    pub embeddings: bool,
    /// Dedicated cross-attention sublayer over `[null, memory]`.
    pub cross_attention: bool,
    /// Sigmoid gate mixing each layer output with its memory slice.
    pub gating: bool,
}

impl Default for LatentMechanisms {
    fn default() -> Self {
        Self {
            memory: true,
            embeddings: true,
            cross_attention: false,
            gating: false,
        }
    }
}

impl LatentMechanisms {
    pub fn any(&self) -> bool {
        self.memory || self.embeddings || self.cross_attention || self.gating
    }

    /// Whether the projector has to produce per-layer memory.
    pub fn needs_memory(&self) -> bool {
        self.memory || self.cross_attention || self.gating
    }
}

/// Hyperparameters of the latent-conditioned decoder.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DecoderConfig {
    pub vocab_size: usize,
    pub hidden_size: usize,
    pub n_layers: usize,
    pub n_heads: usize,
    pub latent_size: usize,
    pub max_positions: usize,
    pub ff_ratio: usize,
    pub layer_norm_epsilon: f64,
    pub initializer_range: f64,
    pub attn_dropout_p: Option<f32>,
    pub resid_dropout_p: Option<f32>,
    /// Probability of zeroing a token embedding during training.
    pub drop_inputs_prob: Option<f32>,
    pub pad_token_id: u32,
    pub bos_token_id: u32,
    pub eos_token_id: u32,
    pub mechanisms: LatentMechanisms,
}

impl Default for DecoderConfig {
    fn default() -> Self {
        Self {
            vocab_size: 50_265,
            hidden_size: 768,
            n_layers: 12,
            n_heads: 12,
            latent_size: 768,
            max_positions: 1024,
            ff_ratio: 4,
            layer_norm_epsilon: 1e-5,
            initializer_range: 0.02,
            attn_dropout_p: Some(0.1),
            resid_dropout_p: Some(0.1),
            drop_inputs_prob: None,
            pad_token_id: 1,
            bos_token_id: 0,
            eos_token_id: 2,
            mechanisms: LatentMechanisms::default(),
        }
    }
}

impl DecoderConfig {
    pub fn head_dim(&self) -> usize {
        self.hidden_size / self.n_heads.max(1)
    }

    /// Every structural problem with the configuration, in declaration order.
    pub fn problems(&self) -> Vec<String> {
        let mut problems = Vec::new();
        for (name, value) in [
            ("vocab_size", self.vocab_size),
            ("hidden_size", self.hidden_size),
            ("n_layers", self.n_layers),
            ("n_heads", self.n_heads),
            ("latent_size", self.latent_size),
            ("max_positions", self.max_positions),
            ("ff_ratio", self.ff_ratio),
        ] {
            if value == 0 {
                problems.push(format!("{name} must be greater than zero"));
            }
        }
        if self.n_heads > 0 && self.hidden_size % self.n_heads != 0 {
            problems.push(format!(
                "hidden_size ({}) must be divisible by n_heads ({})",
                self.hidden_size, self.n_heads
            ));
        }
        if self.layer_norm_epsilon <= 0.0 {
            problems.push("layer_norm_epsilon must be positive".into());
        }
        if self.initializer_range <= 0.0 {
            problems.push("initializer_range must be positive".into());
        }
        for (name, value) in [
            ("attn_dropout_p", self.attn_dropout_p),
            ("resid_dropout_p", self.resid_dropout_p),
            ("drop_inputs_prob", self.drop_inputs_prob),
        ] {
            if let Some(p) = value {
                if !(0.0..1.0).contains(&p) {
                    problems.push(format!("{name} must be in [0, 1), got {p}"));
                }
            }
        }
        for (name, id) in [
            ("pad_token_id", self.pad_token_id),
            ("bos_token_id", self.bos_token_id),
            ("eos_token_id", self.eos_token_id),
        ] {
            if id as usize >= self.vocab_size {
                problems.push(format!("{name} ({id}) is outside the vocabulary"));
            }
        }
        if !self.mechanisms.any() {
            problems.push("at least one latent mechanism must be enabled".into());
        }
        problems
    }

    pub fn validate(&self) -> Result<()> {
        let problems = self.problems();
        if problems.is_empty() {
            Ok(())
        } else {
            Err(DecoderError::InvalidConfig(problems.join("; ")))
        }
    }
}
