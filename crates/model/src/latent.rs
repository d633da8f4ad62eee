//! Projection of a latent vector into decoder-consumable conditioning.

use candle_core::{Tensor, D};
use candle_nn::{Linear, Module, VarBuilder};

use crate::config::DecoderConfig;
use crate::error::{DecoderError, Result};
use crate::init::normal_linear;

/// Per-forward conditioning handed to the decoder.
///
/// `memory` holds one `(batch, 1, hidden)` slice per layer; `embedding` is a
/// `(batch, hidden)` vector added to every input position.
#[derive(Debug, Clone, Default)]
pub struct ConditioningBundle {
    pub memory: Option<Vec<Tensor>>,
    pub embedding: Option<Tensor>,
}

impl ConditioningBundle {
    pub fn is_empty(&self) -> bool {
        self.memory.is_none() && self.embedding.is_none()
    }

    pub fn batch_size(&self) -> Result<usize> {
        if let Some(embedding) = &self.embedding {
            return Ok(embedding.dim(0)?);
        }
        match self.memory.as_ref().and_then(|memory| memory.first()) {
            Some(slice) => Ok(slice.dim(0)?),
            None => Err(DecoderError::NoConditioning),
        }
    }
}

/// Two independently toggled linear maps from the latent space.
#[derive(Debug, Clone)]
pub struct LatentProjector {
    hidden_size: usize,
    n_layers: usize,
    to_memory: Option<Linear>,
    to_embedding: Option<Linear>,
}

impl LatentProjector {
    pub fn new(config: &DecoderConfig, vb: VarBuilder) -> Result<Self> {
        Self::with_maps(
            config,
            config.mechanisms.needs_memory(),
            config.mechanisms.embeddings,
            vb,
        )
    }

    /// Build with explicit map toggles, independent of the decoder mechanisms.
    pub fn with_maps(
        config: &DecoderConfig,
        memory: bool,
        embeddings: bool,
        vb: VarBuilder,
    ) -> Result<Self> {
        let std = config.initializer_range;
        let to_memory = if memory {
            Some(normal_linear(
                config.latent_size,
                config.hidden_size * config.n_layers,
                std,
                true,
                vb.pp("latent_to_memory"),
            )?)
        } else {
            None
        };
        let to_embedding = if embeddings {
            Some(normal_linear(
                config.latent_size,
                config.hidden_size,
                std,
                true,
                vb.pp("latent_to_embedding"),
            )?)
        } else {
            None
        };
        Ok(Self {
            hidden_size: config.hidden_size,
            n_layers: config.n_layers,
            to_memory,
            to_embedding,
        })
    }

    /// Project `(batch, latent_size)` into a fresh conditioning bundle.
    pub fn project(&self, latent: &Tensor) -> Result<ConditioningBundle> {
        let memory = match &self.to_memory {
            Some(map) => {
                let projected = map.forward(latent)?.unsqueeze(1)?;
                let slices = (0..self.n_layers)
                    .map(|layer| {
                        projected.narrow(D::Minus1, layer * self.hidden_size, self.hidden_size)
                    })
                    .collect::<candle_core::Result<Vec<_>>>()?;
                Some(slices)
            }
            None => None,
        };
        let embedding = match &self.to_embedding {
            Some(map) => Some(map.forward(latent)?),
            None => None,
        };
        Ok(ConditioningBundle { memory, embedding })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::LatentMechanisms;
    use candle_core::{DType, Device};
    use candle_nn::VarMap;

    fn small_config(mechanisms: LatentMechanisms) -> DecoderConfig {
        DecoderConfig {
            vocab_size: 11,
            hidden_size: 8,
            n_layers: 3,
            n_heads: 2,
            latent_size: 4,
            max_positions: 16,
            mechanisms,
            ..DecoderConfig::default()
        }
    }

    #[test]
    fn memory_is_split_per_layer() -> Result<()> {
        let device = Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
        let projector = LatentProjector::new(&small_config(LatentMechanisms::default()), vb)?;
        let latent = Tensor::randn(0f32, 1f32, (5, 4), &device)?;

        let bundle = projector.project(&latent)?;
        let memory = bundle.memory.expect("memory map enabled");
        assert_eq!(memory.len(), 3);
        for slice in &memory {
            assert_eq!(slice.dims(), &[5, 1, 8]);
        }
        assert_eq!(bundle.embedding.expect("embedding map").dims(), &[5, 8]);
        Ok(())
    }

    #[test]
    fn disabled_maps_yield_none() -> Result<()> {
        let device = Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
        let config = small_config(LatentMechanisms::default());
        let projector = LatentProjector::with_maps(&config, false, false, vb)?;
        let bundle = projector.project(&Tensor::zeros((2, 4), DType::F32, &device)?)?;
        assert!(bundle.is_empty());
        assert!(matches!(
            bundle.batch_size(),
            Err(DecoderError::NoConditioning)
        ));
        Ok(())
    }

    #[test]
    fn biases_start_at_zero() -> Result<()> {
        let device = Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
        let projector = LatentProjector::new(&small_config(LatentMechanisms::default()), vb)?;
        let bundle = projector.project(&Tensor::zeros((1, 4), DType::F32, &device)?)?;
        let embedding = bundle.embedding.expect("embedding map");
        let values = embedding.flatten_all()?.to_vec1::<f32>()?;
        assert!(values.iter().all(|v| *v == 0.0));
        Ok(())
    }
}
