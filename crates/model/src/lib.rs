//! Latent-conditioned transformer decoder.
//!
//! A latent vector reaches the decoder through a [`LatentProjector`], which
//! produces a [`ConditioningBundle`] of per-layer memory and/or an additive
//! embedding. [`ConditionedDecoder`] consumes the bundle for teacher-forced
//! passes and [`AutoregressiveSampler`] drives it step by step for generation.

pub mod block;
pub mod config;
pub mod decoder;
pub mod encoder;
pub mod error;
pub mod filtering;
mod init;
pub mod latent;
pub mod posterior;
pub mod reduction;
pub mod sampler;

pub use block::DecoderBlock;
pub use config::{DecoderConfig, LatentMechanisms};
pub use decoder::{
    ConditionedDecoder, DecoderInput, DecoderOutputs, ForwardOptions, OutputKind,
    RequestedOutputs,
};
pub use encoder::{LatentEncoder, MeanPoolEncoder};
pub use error::DecoderError;
pub use filtering::SamplingConfig;
pub use latent::{ConditioningBundle, LatentProjector};
pub use posterior::Posterior;
pub use reduction::{Reduction, TwoStageReduction};
pub use sampler::{AutoregressiveSampler, SampleOutputs, SamplerConfig, SamplerState};
