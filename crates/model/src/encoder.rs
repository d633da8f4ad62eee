//! Encoder seam producing the approximate posterior.

use candle_core::{DType, Tensor, D};
use candle_nn::{Embedding, Linear, Module, VarBuilder};

use crate::config::DecoderConfig;
use crate::error::Result;
use crate::init::{normal_embedding, normal_linear};
use crate::posterior::Posterior;

/// Anything that maps token ids to a diagonal Gaussian posterior.
pub trait LatentEncoder {
    fn encode(&self, input_ids: &Tensor, attention_mask: Option<&Tensor>) -> Result<Posterior>;
}

/// Masked mean of token embeddings followed by a `(mu, logvar)` head.
#[derive(Debug)]
pub struct MeanPoolEncoder {
    embedding: Embedding,
    head: Linear,
    latent_size: usize,
}

impl MeanPoolEncoder {
    pub fn new(config: &DecoderConfig, vb: VarBuilder) -> Result<Self> {
        let std = config.initializer_range;
        Ok(Self {
            embedding: normal_embedding(
                config.vocab_size,
                config.hidden_size,
                std,
                vb.pp("embedding"),
            )?,
            head: normal_linear(
                config.hidden_size,
                2 * config.latent_size,
                std,
                true,
                vb.pp("posterior_head"),
            )?,
            latent_size: config.latent_size,
        })
    }
}

impl LatentEncoder for MeanPoolEncoder {
    fn encode(&self, input_ids: &Tensor, attention_mask: Option<&Tensor>) -> Result<Posterior> {
        let ids = input_ids.to_dtype(DType::U32)?;
        let embedded = self.embedding.forward(&ids)?;
        let (batch, seq, _) = embedded.dims3()?;
        let mask = match attention_mask {
            Some(mask) => mask.to_dtype(DType::F32)?,
            None => Tensor::ones((batch, seq), DType::F32, embedded.device())?,
        };
        let counts = mask.sum_keepdim(1)?.clamp(1.0, f64::INFINITY)?;
        let pooled = embedded
            .broadcast_mul(&mask.unsqueeze(D::Minus1)?)?
            .sum(1)?
            .broadcast_div(&counts)?;
        let stats = self.head.forward(&pooled)?;
        let mu = stats.narrow(D::Minus1, 0, self.latent_size)?;
        let logvar = stats.narrow(D::Minus1, self.latent_size, self.latent_size)?;
        Ok(Posterior::new(mu.contiguous()?, logvar.contiguous()?)?)
    }
}
