//! Builders for padding masks used to drop padded keys.
//!
//! All padding masks share the dtype and layout described in
//! [`super::MASK_DTYPE`](super::MASK_DTYPE). Memory prefix slots are never
//! padded, and a query always keeps its own position so that fully padded
//! rows cannot produce `NaN` after the softmax.

use candle_core::{DType, Device, Error, Result, Tensor};

/// Construct padding masks from boolean padding indicators.
///
/// Each inner slice corresponds to a batch element and must share the same
/// length. `true` indicates a padded (masked) token. The resulting mask is
/// shaped `[batch, 1, seq_len, prefix_len + seq_len]`.
pub fn padding_mask_from_booleans(
    device: &Device,
    padding: &[Vec<bool>],
    prefix_len: usize,
) -> Result<Tensor> {
    if padding.is_empty() {
        return Tensor::zeros((0, 1, 0, prefix_len), super::MASK_DTYPE, device);
    }

    let seq_len = padding[0].len();
    if padding.iter().any(|mask| mask.len() != seq_len) {
        return Err(Error::Msg(
            "all boolean padding masks must share seq_len".into(),
        ));
    }

    let batch = padding.len();
    let k_len = prefix_len + seq_len;
    let mut data = vec![0f32; batch * seq_len * k_len];

    for (b, mask) in padding.iter().enumerate() {
        for q in 0..seq_len {
            let row_start = ((b * seq_len) + q) * k_len;
            for (t, &is_padding) in mask.iter().enumerate() {
                if is_padding && t != q {
                    data[row_start + prefix_len + t] = f32::NEG_INFINITY;
                }
            }
        }
    }

    Tensor::from_vec(data, (batch, 1, seq_len, k_len), device)
}

/// Construct a padding mask from a `(batch, seq_len)` attention mask where
/// non-zero marks a real token.
pub fn padding_mask_from_attention(attention_mask: &Tensor, prefix_len: usize) -> Result<Tensor> {
    let (batch, seq_len) = attention_mask.dims2()?;
    let rows = attention_mask.to_dtype(DType::F32)?.to_vec2::<f32>()?;
    let padding: Vec<Vec<bool>> = rows
        .into_iter()
        .map(|row| row.into_iter().map(|value| value == 0.0).collect())
        .collect();
    if padding.len() != batch || padding.iter().any(|row| row.len() != seq_len) {
        return Err(Error::Msg("attention mask rows are ragged".into()));
    }
    padding_mask_from_booleans(attention_mask.device(), &padding, prefix_len)
}
