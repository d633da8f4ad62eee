//! Step-wise autoregressive generation from latent vectors.
//!
//! A run seeds every row with `[bos, eos]` and performs exactly
//! `max_seq_len - 1` decoder calls. Each call reads the prediction made at the
//! position just before `eos` and splices it in front of `eos`.

use candle_core::{DType, Device, Tensor};

use crate::decoder::{ConditionedDecoder, DecoderInput, ForwardOptions, OutputKind, RequestedOutputs};
use crate::error::{DecoderError, Result};
use crate::filtering::SamplingConfig;
use crate::latent::{ConditioningBundle, LatentProjector};
use crate::reduction::{Reduction, TwoStageReduction};

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SamplerConfig {
    /// Final length including `bos` and `eos`.
    pub max_seq_len: usize,
    /// Auxiliary per-step outputs to record. Predictions are always produced.
    pub outputs: RequestedOutputs,
    pub cross_entropy: TwoStageReduction,
    pub exact_match: TwoStageReduction,
    /// Seed `s` is used as `s + step` for each step.
    pub sampling: Option<SamplingConfig>,
}

impl Default for SamplerConfig {
    fn default() -> Self {
        Self {
            max_seq_len: 32,
            outputs: RequestedOutputs::empty(),
            cross_entropy: TwoStageReduction::new(Reduction::Sum, Reduction::Mean),
            exact_match: TwoStageReduction::new(Reduction::Mean, Reduction::Mean),
            sampling: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SamplerState {
    Init,
    Step(usize),
    Done,
}

#[derive(Debug, Clone)]
pub struct SampleOutputs {
    /// Generated ids without `bos`/`eos`, `(batch, max_seq_len - 1)`.
    pub predictions: Tensor,
    /// `(batch, steps, vocab)`
    pub logits: Option<Tensor>,
    /// `(batch, steps, vocab)`
    pub probabilities: Option<Tensor>,
    /// `(batch, n_layers, heads, steps)`
    pub attention_to_latent: Option<Tensor>,
    /// `(batch, n_layers + 1, steps, hidden)`
    pub hidden_states: Option<Tensor>,
    /// `(batch, steps, hidden)`
    pub last_hidden_state: Option<Tensor>,
    pub cross_entropy: Option<Tensor>,
    pub exact_match: Option<Tensor>,
}

/// Pre-allocated, step-indexed slots for every recordable output.
#[derive(Debug, Default)]
struct StepBuffers {
    logits: Vec<Option<Tensor>>,
    probabilities: Vec<Option<Tensor>>,
    attention_to_latent: Vec<Option<Tensor>>,
    hidden_states: Vec<Option<Tensor>>,
    last_hidden_state: Vec<Option<Tensor>>,
    cross_entropy: Vec<Option<Tensor>>,
    exact_match: Vec<Option<Tensor>>,
}

impl StepBuffers {
    fn with_steps(steps: usize) -> Self {
        Self {
            logits: vec![None; steps],
            probabilities: vec![None; steps],
            attention_to_latent: vec![None; steps],
            hidden_states: vec![None; steps],
            last_hidden_state: vec![None; steps],
            cross_entropy: vec![None; steps],
            exact_match: vec![None; steps],
        }
    }
}

fn stack_slots(slots: Vec<Option<Tensor>>, dim: usize) -> Result<Option<Tensor>> {
    let filled: Option<Vec<Tensor>> = slots.into_iter().collect();
    match filled {
        Some(tensors) if !tensors.is_empty() => Ok(Some(Tensor::stack(&tensors, dim)?)),
        _ => Ok(None),
    }
}

#[derive(Debug)]
pub struct AutoregressiveSampler<'a> {
    decoder: &'a ConditionedDecoder,
    projector: &'a LatentProjector,
    config: SamplerConfig,
    state: SamplerState,
    device: Device,
    bundle: ConditioningBundle,
    tokens: Vec<Vec<u32>>,
    labels: Option<Tensor>,
    buffers: StepBuffers,
}

impl<'a> AutoregressiveSampler<'a> {
    pub fn new(
        decoder: &'a ConditionedDecoder,
        projector: &'a LatentProjector,
        config: SamplerConfig,
    ) -> Result<Self> {
        let max_positions = decoder.config().max_positions;
        if config.max_seq_len < 2 || config.max_seq_len > max_positions {
            return Err(DecoderError::InvalidConfig(format!(
                "max_seq_len must be in [2, {max_positions}], got {}",
                config.max_seq_len
            )));
        }
        Ok(Self {
            decoder,
            projector,
            config,
            state: SamplerState::Init,
            device: Device::Cpu,
            bundle: ConditioningBundle::default(),
            tokens: Vec::new(),
            labels: None,
            buffers: StepBuffers::default(),
        })
    }

    pub fn state(&self) -> SamplerState {
        self.state
    }

    fn steps(&self) -> usize {
        self.config.max_seq_len - 1
    }

    fn wants(&self, kind: OutputKind) -> bool {
        self.config.outputs.contains(kind)
    }

    /// INIT: project the latent once and seed `[bos, eos]` rows.
    pub fn start(&mut self, latent: &Tensor, labels: Option<&Tensor>) -> Result<()> {
        if self.state != SamplerState::Init {
            return Err(DecoderError::InvalidConfig(
                "sampler has already been started".into(),
            ));
        }
        let wants_labels = self.config.outputs.needs_labels();
        let labels = match (wants_labels, labels) {
            (true, None) => return Err(DecoderError::MissingLabels),
            (true, Some(labels)) => {
                let (batch, width) = labels.dims2()?;
                if batch != latent.dim(0)? || width < self.config.max_seq_len {
                    return Err(DecoderError::LabelShape {
                        labels: labels.dims().to_vec(),
                        inputs: vec![latent.dim(0)?, self.config.max_seq_len],
                    });
                }
                Some(labels.to_dtype(DType::U32)?)
            }
            (false, _) => None,
        };

        let decoder_config = self.decoder.config();
        let batch = latent.dim(0)?;
        self.device = latent.device().clone();
        self.bundle = self.projector.project(latent)?;
        self.tokens = (0..batch)
            .map(|_| {
                let mut row = Vec::with_capacity(self.config.max_seq_len + 1);
                row.push(decoder_config.bos_token_id);
                row.push(decoder_config.eos_token_id);
                row
            })
            .collect();
        self.labels = labels;
        self.buffers = StepBuffers::with_steps(self.steps());
        self.state = SamplerState::Step(0);
        Ok(())
    }

    /// STEP: one decoder call, one new token per row.
    pub fn step(&mut self) -> Result<SamplerState> {
        let step = match self.state {
            SamplerState::Step(step) => step,
            SamplerState::Init => {
                return Err(DecoderError::InvalidConfig(
                    "sampler must be started before stepping".into(),
                ))
            }
            SamplerState::Done => return Ok(SamplerState::Done),
        };

        let batch = self.tokens.len();
        let seq = step + 2;
        let flat: Vec<u32> = self.tokens.iter().flatten().copied().collect();
        let input_ids = Tensor::from_vec(flat, (batch, seq), &self.device)?;
        let labels = match &self.labels {
            Some(labels) => Some(labels.narrow(1, 0, seq)?),
            None => None,
        };

        let options = ForwardOptions {
            outputs: self.config.outputs.with(OutputKind::Predictions),
            cross_entropy: TwoStageReduction::NONE,
            exact_match: TwoStageReduction::NONE,
            sampling: self
                .config
                .sampling
                .map(|sampling| sampling.with_seed(sampling.seed.wrapping_add(step as u64))),
            train: false,
        };
        let mut input = DecoderInput::new(&input_ids);
        if let Some(labels) = &labels {
            input = input.with_labels(labels);
        }
        let outputs = self.decoder.forward(&input, &self.bundle, &options)?;

        // Query position `seq - 2` is the last real token; `seq - 1` is eos.
        let at = seq - 2;
        let predictions = outputs
            .predictions
            .ok_or(DecoderError::MissingMechanism {
                output: "predictions",
                mechanism: "logits",
            })?
            .narrow(1, at, 1)?
            .squeeze(1)?
            .to_vec1::<u32>()?;
        for (row, token) in self.tokens.iter_mut().zip(predictions) {
            let eos_at = row.len() - 1;
            row.insert(eos_at, token);
        }

        let pick = |tensor: Option<Tensor>, dim: usize| -> Result<Option<Tensor>> {
            match tensor {
                Some(tensor) => Ok(Some(tensor.narrow(dim, at, 1)?.squeeze(dim)?)),
                None => Ok(None),
            }
        };
        if self.wants(OutputKind::Logits) {
            self.buffers.logits[step] = pick(outputs.logits, 1)?;
        }
        if self.wants(OutputKind::Probabilities) {
            self.buffers.probabilities[step] = pick(outputs.probabilities, 1)?;
        }
        if self.wants(OutputKind::AttentionToLatent) {
            self.buffers.attention_to_latent[step] = pick(outputs.attention_to_latent, 3)?;
        }
        if self.wants(OutputKind::HiddenStates) {
            self.buffers.hidden_states[step] = pick(outputs.hidden_states, 2)?;
        }
        if self.wants(OutputKind::LastHiddenState) {
            self.buffers.last_hidden_state[step] = pick(outputs.last_hidden_state, 1)?;
        }
        if self.wants(OutputKind::CrossEntropy) {
            self.buffers.cross_entropy[step] = pick(outputs.cross_entropy, 1)?;
        }
        if self.wants(OutputKind::ExactMatch) {
            self.buffers.exact_match[step] = pick(outputs.exact_match, 1)?;
        }

        self.state = if step + 1 == self.steps() {
            SamplerState::Done
        } else {
            SamplerState::Step(step + 1)
        };
        Ok(self.state)
    }

    /// DONE: assemble generated ids and the recorded auxiliaries.
    pub fn finish(self) -> Result<SampleOutputs> {
        if self.state != SamplerState::Done {
            return Err(DecoderError::InvalidConfig(format!(
                "sampler finished in state {:?}",
                self.state
            )));
        }
        let steps = self.steps();
        let batch = self.tokens.len();
        let generated: Vec<u32> = self
            .tokens
            .iter()
            .flat_map(|row| row[1..row.len() - 1].iter().copied())
            .collect();
        let predictions = Tensor::from_vec(generated, (batch, steps), &self.device)?;

        let valid = match &self.labels {
            Some(labels) => Some(
                labels
                    .narrow(1, 1, steps)?
                    .ne(self.decoder.config().pad_token_id)?
                    .to_dtype(DType::F32)?,
            ),
            None => None,
        };
        let reduce = |slots: Vec<Option<Tensor>>,
                      reduction: TwoStageReduction|
         -> Result<Option<Tensor>> {
            match (stack_slots(slots, 1)?, &valid) {
                (Some(values), Some(mask)) => Ok(Some(reduction.apply(&values, mask)?)),
                _ => Ok(None),
            }
        };

        let StepBuffers {
            logits,
            probabilities,
            attention_to_latent,
            hidden_states,
            last_hidden_state,
            cross_entropy,
            exact_match,
        } = self.buffers;
        Ok(SampleOutputs {
            predictions,
            logits: stack_slots(logits, 1)?,
            probabilities: stack_slots(probabilities, 1)?,
            attention_to_latent: stack_slots(attention_to_latent, 3)?,
            hidden_states: stack_slots(hidden_states, 2)?,
            last_hidden_state: stack_slots(last_hidden_state, 1)?,
            cross_entropy: reduce(cross_entropy, self.config.cross_entropy)?,
            exact_match: reduce(exact_match, self.config.exact_match)?,
        })
    }

    /// Run INIT, every STEP and DONE in one call.
    pub fn generate(mut self, latent: &Tensor, labels: Option<&Tensor>) -> Result<SampleOutputs> {
        self.start(latent, labels)?;
        while self.step()? != SamplerState::Done {}
        self.finish()
    }
}

/// Greedy or filtered generation for a batch of latents.
pub fn generate(
    decoder: &ConditionedDecoder,
    projector: &LatentProjector,
    latent: &Tensor,
    config: SamplerConfig,
) -> Result<Tensor> {
    let outputs = AutoregressiveSampler::new(decoder, projector, config)?.generate(latent, None)?;
    Ok(outputs.predictions)
}
