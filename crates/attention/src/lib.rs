//! Exact causal self-attention primitives for the latent-conditioned decoder.
//!
//! Tensors follow the layout `[batch, n_heads, seq_len, head_dim]`. Queries
//! cover the real tokens only, while keys and values may carry a prefix of
//! latent memory slots that precede the first token. Masks are additive `f32`
//! tensors; the causal builders offset the diagonal by the prefix length so
//! every query always sees the whole memory prefix and never a future token.
//!
//! Dropout is a train-only concern controlled via [`Config::dropout_p`].
//! Attention probabilities are only materialised for the caller when
//! [`Config::return_probs`] is set.

pub mod core;
pub mod masks;
pub mod reference;

pub use core::{Attention, AttentionError, AttentionOutput, Config, PrecisionPolicy};
pub use reference::ExactAttention;
