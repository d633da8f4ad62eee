//! Builders for causal attention masks.
//!
//! The resulting tensors have dtype [`MASK_DTYPE`](super::MASK_DTYPE) and shape
//! `[batch, num_heads, q_len, k_len]`. Entries are `0.0` where attention is
//! permitted and `f32::NEG_INFINITY` otherwise.

use candle_core::{DType, Device, Result, Tensor};

/// Construct a causal mask for the supplied sequence dimensions.
///
/// When `k_len > q_len`, queries are assumed to align with the most recent
/// `q_len` keys, allowing access to the extended prefix.
pub fn build_causal_mask(
    device: &Device,
    batch: usize,
    num_heads: usize,
    q_len: usize,
    k_len: usize,
) -> Result<Tensor> {
    let offset = k_len.saturating_sub(q_len) as u32;
    // Query `q` may see every key up to `q + offset`.
    let last_visible = Tensor::arange(offset, offset + q_len as u32, device)?.reshape((q_len, 1))?;
    let keys = Tensor::arange(0u32, k_len as u32, device)?.reshape((1, k_len))?;
    let visible = keys.broadcast_le(&last_visible)?;

    let keep = Tensor::zeros((q_len, k_len), DType::F32, device)?;
    let drop = Tensor::full(f32::NEG_INFINITY, (q_len, k_len), device)?;
    visible
        .where_cond(&keep, &drop)?
        .broadcast_as((batch, num_heads, q_len, k_len))?
        .contiguous()
}

/// Causal mask over `prefix_len` memory slots followed by `seq_len` tokens.
///
/// The head dimension is `1` so the mask broadcasts over every head.
pub fn build_prefixed_causal_mask(
    device: &Device,
    batch: usize,
    seq_len: usize,
    prefix_len: usize,
) -> Result<Tensor> {
    build_causal_mask(device, batch, 1, seq_len, seq_len + prefix_len)
}
