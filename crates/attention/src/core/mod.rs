//! Core traits and types shared across attention implementations.
//!
//! Implementations operate on tensors with layout
//! `[batch, n_heads, seq_len, head_dim]`. Keys and values may be longer than
//! the queries when a latent memory prefix has been prepended, or shorter
//! for latent cross-attention.

pub mod config;
pub mod errors;

use candle_core::Tensor;

pub use config::{Config, PrecisionPolicy};
pub use errors::AttentionError;

/// Result of a single attention call.
#[derive(Debug, Clone)]
pub struct AttentionOutput {
    /// Attended values shaped like `q`.
    pub context: Tensor,
    /// Softmax weights `[batch, heads, q_len, k_len]`, present only when
    /// [`Config::return_probs`] was set.
    pub probs: Option<Tensor>,
}

/// Unified interface for attention kernels.
///
/// * `q` is `[batch, n_heads, q_len, head_dim]`; `k` and `v` are
///   `[batch, n_heads, k_len, head_dim]`.
/// * Masks, when present, must be shaped `[batch, 1 or n_heads, q_len, k_len]`.
/// * The returned context mirrors the layout and dtype of `q`.
pub trait Attention {
    /// Compute attention with an optional additive mask.
    fn attend(
        &self,
        q: &Tensor,
        k: &Tensor,
        v: &Tensor,
        mask: Option<&Tensor>,
        config: &Config,
    ) -> Result<AttentionOutput, AttentionError>;
}
