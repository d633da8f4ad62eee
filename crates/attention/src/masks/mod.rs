//! Mask utilities shared by attention implementations.
//!
//! All masks produced here are additive tensors with dtype `f32`, shaped
//! `[batch, num_heads, q_len, k_len]`. Values are either `0.0` (keep) or
//! `f32::NEG_INFINITY` (discard) to align with Candle's softmax-friendly
//! masking behaviour. When `k_len > q_len` the leading `k_len - q_len` keys
//! are latent memory slots that every query may attend to.

pub mod causal;
pub mod padding;

use candle_core::DType;

/// Dtype shared by all additive masks.
pub const MASK_DTYPE: DType = DType::F32;

pub use causal::{build_causal_mask, build_prefixed_causal_mask};
pub use padding::{padding_mask_from_attention, padding_mask_from_booleans};

#[cfg(test)]
mod tests;
