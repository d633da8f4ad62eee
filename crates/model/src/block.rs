use std::fmt;

use attention::{Attention, Config as AttentionConfig, ExactAttention};
use candle_core::{bail, Result as CandleResult, Tensor, D};
use candle_nn::ops::{dropout, sigmoid};
use candle_nn::{layer_norm, LayerNorm, Linear, Module, VarBuilder};

use crate::config::DecoderConfig;
use crate::error::{DecoderError, Result};
use crate::init::normal_linear;

/// Latent cross-attention sublayer. Keys and values are `[null, memory]`.
struct LatentCrossAttention {
    norm: LayerNorm,
    q_proj: Linear,
    kv_proj: Linear,
    out_proj: Linear,
    null_slot: Tensor,
}

/// Per-call switches for a block forward.
#[derive(Debug, Clone, Copy, Default)]
pub struct BlockOptions {
    /// Prepend the layer memory to the self-attention keys/values.
    pub memory_prefix: bool,
    /// Report how much attention mass lands on the latent slot.
    pub capture_latent_attention: bool,
    pub train: bool,
}

#[derive(Debug)]
pub struct BlockOutput {
    pub hidden: Tensor,
    /// `(batch, heads, seq)` attention mass on the latent memory.
    pub latent_attention: Option<Tensor>,
}

/// Pre-norm decoder block with optional latent memory, cross-attention and gating.
pub struct DecoderBlock {
    hidden_dim: usize,
    heads: usize,
    head_dim: usize,
    norm_attn: LayerNorm,
    norm_mlp: LayerNorm,
    qkv_proj: Linear,
    out_proj: Linear,
    fc_in: Linear,
    fc_out: Linear,
    cross: Option<LatentCrossAttention>,
    gate: Option<Linear>,
    attention: ExactAttention,
    attention_config: AttentionConfig,
    resid_dropout_p: Option<f32>,
}

impl fmt::Debug for DecoderBlock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DecoderBlock")
            .field("hidden_dim", &self.hidden_dim)
            .field("heads", &self.heads)
            .field("head_dim", &self.head_dim)
            .field("cross_attention", &self.cross.is_some())
            .field("gating", &self.gate.is_some())
            .finish()
    }
}

impl DecoderBlock {
    pub fn new(config: &DecoderConfig, vb: VarBuilder) -> Result<Self> {
        let hidden = config.hidden_size;
        let std = config.initializer_range;
        let eps = config.layer_norm_epsilon;

        let cross = if config.mechanisms.cross_attention {
            let vb = vb.pp("cross");
            Some(LatentCrossAttention {
                norm: layer_norm(hidden, eps, vb.pp("ln"))?,
                q_proj: normal_linear(hidden, hidden, std, true, vb.pp("q_proj"))?,
                kv_proj: normal_linear(hidden, 2 * hidden, std, true, vb.pp("kv_proj"))?,
                out_proj: normal_linear(hidden, hidden, std, true, vb.pp("out_proj"))?,
                null_slot: vb.get_with_hints(
                    (1, 1, hidden),
                    "null_slot",
                    candle_nn::init::Init::Randn {
                        mean: 0.0,
                        stdev: std,
                    },
                )?,
            })
        } else {
            None
        };
        let gate = if config.mechanisms.gating {
            Some(normal_linear(2 * hidden, hidden, std, true, vb.pp("gate"))?)
        } else {
            None
        };

        Ok(Self {
            hidden_dim: hidden,
            heads: config.n_heads,
            head_dim: config.head_dim(),
            norm_attn: layer_norm(hidden, eps, vb.pp("ln_1"))?,
            norm_mlp: layer_norm(hidden, eps, vb.pp("ln_2"))?,
            qkv_proj: normal_linear(hidden, 3 * hidden, std, true, vb.pp("attn.qkv_proj"))?,
            out_proj: normal_linear(hidden, hidden, std, true, vb.pp("attn.out_proj"))?,
            fc_in: normal_linear(hidden, config.ff_ratio * hidden, std, true, vb.pp("mlp.fc_in"))?,
            fc_out: normal_linear(config.ff_ratio * hidden, hidden, std, true, vb.pp("mlp.fc_out"))?,
            cross,
            gate,
            attention: ExactAttention::new(),
            attention_config: AttentionConfig {
                dropout_p: config.attn_dropout_p,
                ..AttentionConfig::default()
            },
            resid_dropout_p: config.resid_dropout_p,
        })
    }

    fn expand_to_heads(&self, tensor: &Tensor) -> CandleResult<Tensor> {
        let (batch, seq, hidden) = tensor.dims3()?;
        if hidden != self.hidden_dim {
            bail!(
                "attention input expected hidden {} got {hidden}",
                self.hidden_dim
            );
        }
        tensor
            .reshape((batch, seq, self.heads, self.head_dim))?
            .transpose(1, 2)?
            .contiguous()
    }

    fn merge_from_heads(&self, tensor: &Tensor) -> CandleResult<Tensor> {
        let (batch, _, seq, _) = tensor.dims4()?;
        tensor
            .transpose(1, 2)?
            .contiguous()?
            .reshape((batch, seq, self.hidden_dim))
    }

    fn attention_config(&self, train: bool, capture: bool) -> AttentionConfig {
        let config = if train {
            self.attention_config.clone()
        } else {
            self.attention_config.without_dropout()
        };
        AttentionConfig {
            return_probs: capture,
            ..config
        }
    }

    fn residual_dropout(&self, tensor: Tensor, train: bool) -> CandleResult<Tensor> {
        match self.resid_dropout_p {
            Some(p) if train && p > 0.0 => dropout(&tensor, p),
            _ => Ok(tensor),
        }
    }

    fn split_qkv(&self, projected: &Tensor) -> CandleResult<(Tensor, Tensor, Tensor)> {
        let q = projected.narrow(D::Minus1, 0, self.hidden_dim)?;
        let k = projected.narrow(D::Minus1, self.hidden_dim, self.hidden_dim)?;
        let v = projected.narrow(D::Minus1, 2 * self.hidden_dim, self.hidden_dim)?;
        Ok((q, k, v))
    }

    /// Forward pass through the block.
    ///
    /// `mask` must already account for the memory prefix when
    /// `options.memory_prefix` is set.
    pub fn forward(
        &self,
        hidden: &Tensor,
        memory: Option<&Tensor>,
        mask: &Tensor,
        options: BlockOptions,
    ) -> Result<BlockOutput> {
        let normed = self.norm_attn.forward(hidden)?;
        let (q, mut k, mut v) = self.split_qkv(&self.qkv_proj.forward(&normed)?)?;

        let mut prefix_len = 0;
        if options.memory_prefix {
            let memory = memory.ok_or(DecoderError::MissingMechanism {
                output: "memory prefix",
                mechanism: "memory",
            })?;
            // Memory bypasses the layer norm and goes straight through k/v.
            let (_, mem_k, mem_v) = self.split_qkv(&self.qkv_proj.forward(memory)?)?;
            k = Tensor::cat(&[&mem_k, &k], 1)?;
            v = Tensor::cat(&[&mem_v, &v], 1)?;
            prefix_len = mem_k.dim(1)?;
        }

        let capture_self = options.capture_latent_attention && options.memory_prefix;
        let attn = self.attention.attend(
            &self.expand_to_heads(&q)?,
            &self.expand_to_heads(&k)?,
            &self.expand_to_heads(&v)?,
            Some(mask),
            &self.attention_config(options.train, capture_self),
        )?;
        let mut latent_attention = match (&attn.probs, capture_self) {
            (Some(probs), true) => Some(probs.narrow(D::Minus1, 0, prefix_len)?.sum(D::Minus1)?),
            _ => None,
        };

        let projected = self.out_proj.forward(&self.merge_from_heads(&attn.context)?)?;
        let mut hidden = (hidden + self.residual_dropout(projected, options.train)?)?;

        if let Some(cross) = &self.cross {
            let memory = memory.ok_or(DecoderError::MissingMechanism {
                output: "cross-attention",
                mechanism: "memory",
            })?;
            let capture_cross = options.capture_latent_attention && latent_attention.is_none();
            let (update, mass) = self.cross_attend(cross, &hidden, memory, options.train, capture_cross)?;
            hidden = (hidden + self.residual_dropout(update, options.train)?)?;
            if capture_cross {
                latent_attention = mass;
            }
        }

        let normed_mlp = self.norm_mlp.forward(&hidden)?;
        let mlp_out = self.fc_out.forward(&self.fc_in.forward(&normed_mlp)?.gelu()?)?;
        let mut hidden = (hidden + self.residual_dropout(mlp_out, options.train)?)?;

        if let Some(gate) = &self.gate {
            let memory = memory.ok_or(DecoderError::MissingMechanism {
                output: "gating",
                mechanism: "memory",
            })?;
            let (batch, seq, _) = hidden.dims3()?;
            let memory = memory.broadcast_as((batch, seq, self.hidden_dim))?;
            let g = sigmoid(&gate.forward(&Tensor::cat(&[&hidden, &memory], D::Minus1)?)?)?;
            hidden = ((g.affine(-1.0, 1.0)? * &hidden)? + (g * memory)?)?;
        }

        Ok(BlockOutput {
            hidden,
            latent_attention,
        })
    }

    fn cross_attend(
        &self,
        cross: &LatentCrossAttention,
        hidden: &Tensor,
        memory: &Tensor,
        train: bool,
        capture: bool,
    ) -> Result<(Tensor, Option<Tensor>)> {
        let batch = hidden.dim(0)?;
        let null = cross.null_slot.broadcast_as((batch, 1, self.hidden_dim))?;
        let slots = Tensor::cat(&[&null, memory], 1)?;
        let kv = cross.kv_proj.forward(&slots)?;
        let k = kv.narrow(D::Minus1, 0, self.hidden_dim)?;
        let v = kv.narrow(D::Minus1, self.hidden_dim, self.hidden_dim)?;
        let q = cross.q_proj.forward(&cross.norm.forward(hidden)?)?;

        let attn = self.attention.attend(
            &self.expand_to_heads(&q)?,
            &self.expand_to_heads(&k)?,
            &self.expand_to_heads(&v)?,
            None,
            &self.attention_config(train, true),
        )?;
        let mass = match (capture, attn.probs) {
            // Slot 0 is the null slot, slot 1 the memory.
            (true, Some(probs)) => Some(probs.narrow(D::Minus1, 1, 1)?.squeeze(D::Minus1)?),
            _ => None,
        };
        let update = cross.out_proj.forward(&self.merge_from_heads(&attn.context)?)?;
        Ok((update, mass))
    }
}
