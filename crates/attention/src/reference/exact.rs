//! Reference attention kernel.
//!
//! Keys and values may differ in length from the queries: self-attention
//! carries a prefix of latent memory slots, and latent cross-attention uses a
//! handful of slots for every query. The supplied mask is responsible for
//! keeping memory slots visible.

use std::sync::OnceLock;

use candle_core::{DType, Tensor};
use candle_nn::ops::{dropout, softmax_last_dim};

use crate::core::{Attention, AttentionError, AttentionOutput, Config, PrecisionPolicy};
use crate::masks::MASK_DTYPE;

/// Numerically stable, portable attention kernel.
#[derive(Debug, Default)]
pub struct ExactAttention {
    first_call: OnceLock<()>,
}

impl ExactAttention {
    pub fn new() -> Self {
        Self::default()
    }
}

fn invalid(context: impl Into<String>) -> AttentionError {
    AttentionError::InvalidShape {
        context: context.into(),
    }
}

fn validate_mask(
    mask: &Tensor,
    q: &Tensor,
    dims: (usize, usize, usize, usize),
) -> Result<Tensor, AttentionError> {
    let (batch, heads, q_len, k_len) = dims;
    if !q.device().same_device(mask.device()) {
        return Err(invalid("mask must reside on the same device as q"));
    }
    if mask.dtype() != MASK_DTYPE {
        return Err(AttentionError::UnsupportedDType {
            requested: format!("mask expects dtype {MASK_DTYPE:?}, got {:?}", mask.dtype()),
        });
    }
    let (mb, mh, mq, mk) = mask
        .dims4()
        .map_err(|_| invalid("mask must have shape [batch|1, heads|1, q_len, k_len]"))?;
    if (mb != batch && mb != 1) || mq != q_len || mk != k_len {
        return Err(invalid(format!(
            "mask shape mismatch: expected [{batch}, 1|{heads}, {q_len}, {k_len}] got [{mb}, {mh}, {mq}, {mk}]"
        )));
    }
    if mh != 1 && mh != heads {
        return Err(invalid(format!(
            "mask head dimension must be 1 or {heads}, got {mh}"
        )));
    }
    Ok(mask.broadcast_as((batch, heads, q_len, k_len))?)
}

impl Attention for ExactAttention {
    fn attend(
        &self,
        q: &Tensor,
        k: &Tensor,
        v: &Tensor,
        mask: Option<&Tensor>,
        config: &Config,
    ) -> Result<AttentionOutput, AttentionError> {
        if self.first_call.set(()).is_ok() {
            log::info!(
                "attention::reference init precision={:?} dropout={:?} return_probs={}",
                config.precision,
                config.dropout_p,
                config.return_probs
            );
        }

        let device = q.device();
        if !device.same_device(k.device()) || !device.same_device(v.device()) {
            return Err(invalid("q, k, v must reside on the same device"));
        }

        let dtype = q.dtype();
        if dtype != k.dtype() || dtype != v.dtype() {
            return Err(invalid("q, k, v must share the same dtype"));
        }
        if !matches!(dtype, DType::F32 | DType::F16 | DType::BF16) {
            return Err(AttentionError::UnsupportedDType {
                requested: format!("{dtype:?}"),
            });
        }

        let (batch, heads, q_len, head_dim) = q
            .dims4()
            .map_err(|_| invalid("q must have shape [batch, heads, q_len, head_dim]"))?;
        let (kb, kh, k_len, kd) = k
            .dims4()
            .map_err(|_| invalid("k must have shape [batch, heads, k_len, head_dim]"))?;
        let (vb, vh, vk, vd) = v
            .dims4()
            .map_err(|_| invalid("v must have shape [batch, heads, k_len, head_dim]"))?;

        if kb != batch || kh != heads || kd != head_dim {
            return Err(invalid(format!(
                "k shape mismatch: expected [{batch}, {heads}, ?, {head_dim}] got [{kb}, {kh}, {k_len}, {kd}]"
            )));
        }
        if vb != batch || vh != heads || vk != k_len || vd != head_dim {
            return Err(invalid(format!(
                "v shape mismatch: expected [{batch}, {heads}, {k_len}, {head_dim}] got [{vb}, {vh}, {vk}, {vd}]"
            )));
        }

        let (q_work, k_work, v_work) = match config.precision {
            PrecisionPolicy::ForceF32 => (
                q.to_dtype(DType::F32)?,
                k.to_dtype(DType::F32)?,
                v.to_dtype(DType::F32)?,
            ),
            PrecisionPolicy::Inherit => (q.clone(), k.clone(), v.clone()),
        };

        let scale = 1.0 / (head_dim as f64).sqrt();
        let k_t = k_work.transpose(2, 3)?.contiguous()?;
        let mut scores = (q_work.contiguous()?.matmul(&k_t)? * scale)?;

        if let Some(mask) = mask {
            let mask = validate_mask(mask, q, (batch, heads, q_len, k_len))?;
            scores = scores.broadcast_add(&mask.to_dtype(scores.dtype())?)?;
        }

        let probs = softmax_last_dim(&scores)?;

        let weights = match config.dropout_p {
            Some(p) if !(0.0..1.0).contains(&p) => {
                return Err(invalid(format!(
                    "dropout probability must be in [0, 1), got {p}"
                )));
            }
            Some(p) if p > 0.0 => dropout(&probs, p)?,
            _ => probs.clone(),
        };

        let context = weights.matmul(&v_work.contiguous()?)?.to_dtype(dtype)?;
        let probs = if config.return_probs {
            Some(probs)
        } else {
            None
        };
        Ok(AttentionOutput { context, probs })
    }
}
