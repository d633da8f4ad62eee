//! Configuration options shared by all attention implementations.
//!
//! The [`Config`] struct captures run-time knobs such as dropout that callers
//! can tune without swapping implementations.

/// Precision used for the score/softmax reductions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PrecisionPolicy {
    /// Promote q/k/v to `f32` before computing scores.
    #[default]
    ForceF32,
    /// Compute in the incoming dtype.
    Inherit,
}

/// Configuration driving attention behaviour.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Config {
    /// Probability for dropout applied to attention weights during training.
    ///
    /// When `None`, dropout is disabled and the computation is deterministic.
    pub dropout_p: Option<f32>,
    /// Reduction precision.
    pub precision: PrecisionPolicy,
    /// Whether the post-softmax probabilities should be handed back.
    pub return_probs: bool,
}

impl Config {
    /// Evaluation-time copy of this configuration (no dropout).
    pub fn without_dropout(&self) -> Self {
        Self {
            dropout_p: None,
            ..self.clone()
        }
    }
}
