//! The latent-conditioned autoregressive decoder.
//!
//! A forward pass only computes what the caller asked for through
//! [`RequestedOutputs`]. Logit-derived outputs use the shift-by-one
//! convention: position `t` of `logits`, `probabilities` and `predictions`
//! predicts token `t + 1`, so all three are `(batch, seq - 1, ..)`.

use attention::masks::{build_prefixed_causal_mask, padding_mask_from_attention};
use candle_core::{DType, Tensor, D};
use candle_nn::ops::{log_softmax, softmax_last_dim};
use candle_nn::{layer_norm, Embedding, LayerNorm, Linear, Module, VarBuilder};

use crate::block::{BlockOptions, DecoderBlock};
use crate::config::DecoderConfig;
use crate::error::{DecoderError, Result};
use crate::filtering::{sample_predictions, SamplingConfig};
use crate::init::normal_embedding;
use crate::latent::ConditioningBundle;
use crate::reduction::{Reduction, TwoStageReduction};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputKind {
    Logits,
    Probabilities,
    Predictions,
    CrossEntropy,
    ExactMatch,
    AttentionToLatent,
    HiddenStates,
    LastHiddenState,
}

impl OutputKind {
    const fn bit(self) -> u16 {
        1 << self as u16
    }
}

/// Set of outputs a forward pass should produce.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RequestedOutputs(u16);

impl RequestedOutputs {
    pub const fn empty() -> Self {
        Self(0)
    }

    pub fn of(kinds: &[OutputKind]) -> Self {
        kinds.iter().fold(Self::empty(), |set, kind| set.with(*kind))
    }

    pub const fn with(self, kind: OutputKind) -> Self {
        Self(self.0 | kind.bit())
    }

    pub const fn contains(self, kind: OutputKind) -> bool {
        self.0 & kind.bit() != 0
    }

    pub fn needs_logits(self) -> bool {
        [
            OutputKind::Logits,
            OutputKind::Probabilities,
            OutputKind::Predictions,
            OutputKind::CrossEntropy,
            OutputKind::ExactMatch,
        ]
        .iter()
        .any(|kind| self.contains(*kind))
    }

    pub fn needs_labels(self) -> bool {
        self.contains(OutputKind::CrossEntropy) || self.contains(OutputKind::ExactMatch)
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ForwardOptions {
    pub outputs: RequestedOutputs,
    pub cross_entropy: TwoStageReduction,
    pub exact_match: TwoStageReduction,
    /// Sample predictions from the filtered distribution instead of argmax.
    pub sampling: Option<SamplingConfig>,
    pub train: bool,
}

impl Default for ForwardOptions {
    fn default() -> Self {
        Self {
            outputs: RequestedOutputs::empty(),
            cross_entropy: TwoStageReduction::new(Reduction::Sum, Reduction::Mean),
            exact_match: TwoStageReduction::new(Reduction::Mean, Reduction::Mean),
            sampling: None,
            train: false,
        }
    }
}

impl ForwardOptions {
    pub fn requesting(kinds: &[OutputKind]) -> Self {
        Self {
            outputs: RequestedOutputs::of(kinds),
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct DecoderInput<'a> {
    pub input_ids: &'a Tensor,
    pub attention_mask: Option<&'a Tensor>,
    pub labels: Option<&'a Tensor>,
}

impl<'a> DecoderInput<'a> {
    pub fn new(input_ids: &'a Tensor) -> Self {
        Self {
            input_ids,
            attention_mask: None,
            labels: None,
        }
    }

    pub fn with_attention_mask(self, attention_mask: &'a Tensor) -> Self {
        Self {
            attention_mask: Some(attention_mask),
            ..self
        }
    }

    pub fn with_labels(self, labels: &'a Tensor) -> Self {
        Self {
            labels: Some(labels),
            ..self
        }
    }
}

/// Result record; a field is `Some` exactly when it was requested.
#[derive(Debug, Clone, Default)]
pub struct DecoderOutputs {
    /// `(batch, seq - 1, vocab)`
    pub logits: Option<Tensor>,
    /// `(batch, seq - 1, vocab)`
    pub probabilities: Option<Tensor>,
    /// `(batch, seq - 1)`, `u32`
    pub predictions: Option<Tensor>,
    pub cross_entropy: Option<Tensor>,
    pub exact_match: Option<Tensor>,
    /// `(batch, n_layers, heads, seq)`
    pub attention_to_latent: Option<Tensor>,
    /// `(batch, n_layers + 1, seq, hidden)`
    pub hidden_states: Option<Tensor>,
    /// `(batch, seq, hidden)`
    pub last_hidden_state: Option<Tensor>,
}

/// Causal transformer decoder conditioned on a [`ConditioningBundle`].
#[derive(Debug)]
pub struct ConditionedDecoder {
    config: DecoderConfig,
    wte: Embedding,
    wpe: Embedding,
    blocks: Vec<DecoderBlock>,
    ln_f: LayerNorm,
    lm_head: Linear,
}

impl ConditionedDecoder {
    pub fn new(config: DecoderConfig, vb: VarBuilder) -> Result<Self> {
        config.validate()?;
        let std = config.initializer_range;
        let wte = normal_embedding(config.vocab_size, config.hidden_size, std, vb.pp("wte"))?;
        let wpe = normal_embedding(config.max_positions, config.hidden_size, std, vb.pp("wpe"))?;
        let blocks = (0..config.n_layers)
            .map(|layer| DecoderBlock::new(&config, vb.pp(format!("h.{layer}"))))
            .collect::<Result<Vec<_>>>()?;
        let ln_f = layer_norm(config.hidden_size, config.layer_norm_epsilon, vb.pp("ln_f"))?;
        // Output projection is tied to the token embedding.
        let lm_head = Linear::new(wte.embeddings().clone(), None);
        log::debug!(
            "decoder built layers={} hidden={} mechanisms={:?}",
            config.n_layers,
            config.hidden_size,
            config.mechanisms
        );
        Ok(Self {
            config,
            wte,
            wpe,
            blocks,
            ln_f,
            lm_head,
        })
    }

    pub fn config(&self) -> &DecoderConfig {
        &self.config
    }

    fn check_request(
        &self,
        input: &DecoderInput<'_>,
        bundle: &ConditioningBundle,
        options: &ForwardOptions,
    ) -> Result<(usize, usize)> {
        if bundle.is_empty() {
            return Err(DecoderError::NoConditioning);
        }
        let mechanisms = self.config.mechanisms;
        match &bundle.memory {
            Some(memory) if memory.len() != self.config.n_layers => {
                return Err(DecoderError::MemoryLayerMismatch {
                    expected: self.config.n_layers,
                    actual: memory.len(),
                });
            }
            None if mechanisms.needs_memory() => {
                return Err(DecoderError::MemoryLayerMismatch {
                    expected: self.config.n_layers,
                    actual: 0,
                });
            }
            _ => {}
        }
        if options.outputs.contains(OutputKind::AttentionToLatent)
            && !(mechanisms.memory || mechanisms.cross_attention)
        {
            return Err(DecoderError::MissingMechanism {
                output: "attention_to_latent",
                mechanism: "memory or cross_attention",
            });
        }

        let (batch, seq) = input.input_ids.dims2()?;
        if seq > self.config.max_positions {
            return Err(DecoderError::SequenceTooLong {
                len: seq,
                max: self.config.max_positions,
            });
        }
        if options.outputs.needs_logits() && seq < 2 {
            return Err(DecoderError::SequenceTooShort(seq));
        }
        if options.outputs.needs_labels() {
            let labels = input.labels.ok_or(DecoderError::MissingLabels)?;
            if labels.dims() != input.input_ids.dims() {
                return Err(DecoderError::LabelShape {
                    labels: labels.dims().to_vec(),
                    inputs: input.input_ids.dims().to_vec(),
                });
            }
        }
        Ok((batch, seq))
    }

    fn embed(
        &self,
        input_ids: &Tensor,
        bundle: &ConditioningBundle,
        train: bool,
    ) -> Result<Tensor> {
        let (batch, seq) = input_ids.dims2()?;
        let device = input_ids.device();
        let mut tokens = self.wte.forward(input_ids)?;

        if let Some(p) = self.config.drop_inputs_prob.filter(|p| train && *p > 0.0) {
            let keep = Tensor::rand(0f32, 1f32, (batch, seq), device)?
                .ge(p)?
                .to_dtype(tokens.dtype())?;
            tokens = tokens.broadcast_mul(&keep.unsqueeze(D::Minus1)?)?;
        }

        let positions = Tensor::arange(0u32, seq as u32, device)?;
        let mut hidden = tokens.broadcast_add(&self.wpe.forward(&positions)?)?;
        if let Some(latent) = &bundle.embedding {
            hidden = hidden.broadcast_add(&latent.unsqueeze(1)?)?;
        }
        Ok(hidden)
    }

    /// Teacher-forced forward pass.
    pub fn forward(
        &self,
        input: &DecoderInput<'_>,
        bundle: &ConditioningBundle,
        options: &ForwardOptions,
    ) -> Result<DecoderOutputs> {
        let (_, seq) = self.check_request(input, bundle, options)?;
        let requested = options.outputs;
        let input_ids = input.input_ids.to_dtype(DType::U32)?;
        let device = input_ids.device();

        let mut hidden = self.embed(&input_ids, bundle, options.train)?;

        let memory_prefix = self.config.mechanisms.memory;
        let prefix_len = usize::from(memory_prefix);
        let mut mask = build_prefixed_causal_mask(device, 1, seq, prefix_len)?;
        if let Some(attention_mask) = input.attention_mask {
            mask = mask.broadcast_add(&padding_mask_from_attention(attention_mask, prefix_len)?)?;
        }

        let want_hidden = requested.contains(OutputKind::HiddenStates);
        let want_latent = requested.contains(OutputKind::AttentionToLatent);
        let mut hidden_states = Vec::new();
        let mut latent_attention = Vec::new();
        let block_options = BlockOptions {
            memory_prefix,
            capture_latent_attention: want_latent,
            train: options.train,
        };

        for (layer, block) in self.blocks.iter().enumerate() {
            if want_hidden {
                hidden_states.push(hidden.clone());
            }
            let memory = bundle.memory.as_ref().map(|memory| &memory[layer]);
            let out = block.forward(&hidden, memory, &mask, block_options)?;
            hidden = out.hidden;
            if let Some(mass) = out.latent_attention {
                latent_attention.push(mass);
            }
        }
        let last_hidden = self.ln_f.forward(&hidden)?;

        let mut outputs = DecoderOutputs::default();
        if want_hidden {
            hidden_states.push(last_hidden.clone());
            outputs.hidden_states = Some(Tensor::stack(&hidden_states, 1)?);
        }
        if want_latent {
            outputs.attention_to_latent = Some(Tensor::stack(&latent_attention, 1)?);
        }
        if requested.contains(OutputKind::LastHiddenState) {
            outputs.last_hidden_state = Some(last_hidden.clone());
        }
        if !requested.needs_logits() {
            return Ok(outputs);
        }

        let logits = self
            .lm_head
            .forward(&last_hidden)?
            .narrow(1, 0, seq - 1)?
            .contiguous()?;

        let predictions = if requested.contains(OutputKind::Predictions) {
            Some(match &options.sampling {
                Some(sampling) => sample_predictions(&logits, sampling)?,
                None => logits.argmax(D::Minus1)?,
            })
        } else {
            None
        };

        if requested.needs_labels() {
            let labels = input
                .labels
                .ok_or(DecoderError::MissingLabels)?
                .to_dtype(DType::U32)?;
            let targets = labels.narrow(1, 1, seq - 1)?.contiguous()?;
            let mut token_mask = targets.ne(self.config.pad_token_id)?.to_dtype(DType::F32)?;
            if let Some(attention_mask) = input.attention_mask {
                let shifted = attention_mask.narrow(1, 1, seq - 1)?.to_dtype(DType::F32)?;
                token_mask = token_mask.mul(&shifted)?;
            }

            if requested.contains(OutputKind::CrossEntropy) {
                let log_probs = log_softmax(&logits, D::Minus1)?;
                let nll = log_probs
                    .gather(&targets.unsqueeze(D::Minus1)?, D::Minus1)?
                    .squeeze(D::Minus1)?
                    .neg()?;
                outputs.cross_entropy = Some(options.cross_entropy.apply(&nll, &token_mask)?);
            }
            if requested.contains(OutputKind::ExactMatch) {
                // Scored against the greedy choice even when predictions are sampled.
                let greedy = logits.argmax(D::Minus1)?;
                let correct = greedy.eq(&targets)?.to_dtype(DType::F32)?;
                outputs.exact_match = Some(options.exact_match.apply(&correct, &token_mask)?);
            }
        }

        if requested.contains(OutputKind::Probabilities) {
            outputs.probabilities = Some(softmax_last_dim(&logits)?);
        }
        if requested.contains(OutputKind::Predictions) {
            outputs.predictions = predictions;
        }
        if requested.contains(OutputKind::Logits) {
            outputs.logits = Some(logits);
        }
        Ok(outputs)
    }
}
