//! Importance-weighted log-likelihood and generated-text overlap evaluation.

use candle_core::{DType, Device, Tensor};
use model::posterior::standard_normal_log_density;
use model::{
    ConditionedDecoder, DecoderInput, ForwardOptions, LatentEncoder, LatentProjector, OutputKind,
    Reduction, RequestedOutputs, SamplerConfig, TwoStageReduction,
};
use serde::{Deserialize, Serialize};

use crate::divergence::log_sum_exp;
use crate::metrics::Metrics;
use crate::objective::scalar;
use crate::pareto::{Candidate, Criterion};
use crate::TrainingError;

/// Importance-weighted estimate of `log p(x)` for one sequence.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct IwEstimate {
    pub log_likelihood: f64,
    pub per_word: f64,
    /// Predicted positions that count towards the likelihood.
    pub tokens: usize,
}

/// Borrowed model parts needed to score sequences.
#[derive(Clone, Copy)]
pub struct VaeParts<'a> {
    pub encoder: &'a dyn LatentEncoder,
    pub projector: &'a LatentProjector,
    pub decoder: &'a ConditionedDecoder,
}

fn counted_tokens(ids: &[u32], mask: Option<&[u32]>, pad: u32) -> usize {
    (1..ids.len())
        .filter(|&t| ids[t] != pad && mask.map_or(true, |mask| mask[t] != 0))
        .count()
}

/// `log (1/n) sum_k p(x|z_k) p(z_k) / q(z_k|x)` for every row of the batch.
///
/// Each row is expanded to `(n_samples, seq)` and decoded as its own batch.
pub fn iw_log_likelihood(
    parts: VaeParts<'_>,
    input_ids: &Tensor,
    attention_mask: Option<&Tensor>,
    n_samples: usize,
) -> Result<Vec<IwEstimate>, TrainingError> {
    if n_samples == 0 {
        return Err(TrainingError::runtime("iw_ll_n_samples must be greater than 0"));
    }
    let input_ids = input_ids.to_dtype(DType::U32)?;
    let attention_mask = match attention_mask {
        Some(mask) => Some(mask.to_dtype(DType::U32)?),
        None => None,
    };
    let (batch, seq) = input_ids.dims2()?;
    let pad = parts.decoder.config().pad_token_id;
    let posterior = parts.encoder.encode(&input_ids, attention_mask.as_ref())?;
    let options = ForwardOptions {
        outputs: RequestedOutputs::of(&[OutputKind::CrossEntropy]),
        cross_entropy: TwoStageReduction::new(Reduction::Sum, Reduction::None),
        train: false,
        ..ForwardOptions::default()
    };
    let log_n = (n_samples as f64).ln();

    let mut estimates = Vec::with_capacity(batch);
    for row in 0..batch {
        let expand = |t: &Tensor| -> candle_core::Result<Tensor> {
            t.narrow(0, row, 1)?.broadcast_as((n_samples, seq))?.contiguous()
        };
        let ids = expand(&input_ids)?;
        let mask = match &attention_mask {
            Some(mask) => Some(expand(mask)?),
            None => None,
        };

        let row_posterior = posterior.expand_row(row, n_samples)?;
        let z = row_posterior.sample()?;
        let bundle = parts.projector.project(&z)?;
        let mut input = DecoderInput::new(&ids).with_labels(&ids);
        if let Some(mask) = &mask {
            input = input.with_attention_mask(mask);
        }
        let outputs = parts.decoder.forward(&input, &bundle, &options)?;
        let nll = outputs
            .cross_entropy
            .ok_or_else(|| TrainingError::runtime("decoder returned no cross-entropy"))?;

        let log_weights = ((standard_normal_log_density(&z)? - nll)? - row_posterior.log_q(&z)?)?;
        let log_likelihood = scalar(&(log_sum_exp(&log_weights, 0)? - log_n)?)?;

        let row_ids = input_ids.get(row)?.to_vec1::<u32>()?;
        let row_mask = match &attention_mask {
            Some(mask) => Some(mask.get(row)?.to_vec1::<u32>()?),
            None => None,
        };
        let tokens = counted_tokens(&row_ids, row_mask.as_deref(), pad);
        estimates.push(IwEstimate {
            log_likelihood,
            per_word: log_likelihood / tokens.max(1) as f64,
            tokens,
        });
    }
    Ok(estimates)
}

/// Wraps generated ids as `[bos, tokens.., eos]` rows cut at the first
/// generated `eos`, padded to `max_seq_len`. Returns `(ids, mask)`.
pub fn frame_generated(
    generated: &Tensor,
    max_seq_len: usize,
    bos: u32,
    eos: u32,
    pad: u32,
) -> Result<(Tensor, Tensor), TrainingError> {
    let rows = generated.to_dtype(DType::U32)?.to_vec2::<u32>()?;
    let body = max_seq_len.saturating_sub(2);
    let mut ids = Vec::with_capacity(rows.len() * max_seq_len);
    let mut mask = Vec::with_capacity(rows.len() * max_seq_len);
    for row in &rows {
        let len = row
            .iter()
            .position(|&token| token == eos)
            .unwrap_or(row.len())
            .min(body);
        let mut framed = Vec::with_capacity(max_seq_len);
        framed.push(bos);
        framed.extend_from_slice(&row[..len]);
        framed.push(eos);
        let valid = framed.len();
        framed.resize(max_seq_len, pad);
        ids.extend(framed);
        mask.extend((0..max_seq_len).map(|t| u32::from(t < valid)));
    }
    let shape = (rows.len(), max_seq_len);
    let device = generated.device();
    Ok((
        Tensor::from_vec(ids, shape, device)?,
        Tensor::from_vec(mask, shape, device)?,
    ))
}

/// Generates from prior samples, then scores the generated text with the
/// importance-weighted estimator.
pub fn generated_iw_log_likelihood(
    parts: VaeParts<'_>,
    n_sequences: usize,
    n_samples: usize,
    sampler: SamplerConfig,
    device: &Device,
) -> Result<Vec<IwEstimate>, TrainingError> {
    let config = parts.decoder.config();
    let z = Tensor::randn(0f32, 1f32, (n_sequences, config.latent_size), device)?;
    let generated = model::sampler::generate(parts.decoder, parts.projector, &z, sampler)?;
    let (ids, mask) = frame_generated(
        &generated,
        sampler.max_seq_len,
        config.bos_token_id,
        config.eos_token_id,
        config.pad_token_id,
    )?;
    iw_log_likelihood(parts, &ids, Some(&mask), n_samples)
}

/// Two-sample Kolmogorov-Smirnov statistic.
pub fn ks_statistic(a: &[f64], b: &[f64]) -> Result<f64, TrainingError> {
    if a.is_empty() || b.is_empty() {
        return Err(TrainingError::runtime(
            "ks statistic requires two non-empty samples",
        ));
    }
    let mut a = a.to_vec();
    let mut b = b.to_vec();
    a.sort_by(f64::total_cmp);
    b.sort_by(f64::total_cmp);
    let (n, m) = (a.len() as f64, b.len() as f64);
    let (mut i, mut j) = (0, 0);
    let mut distance = 0.0f64;
    while i < a.len() && j < b.len() {
        let x = a[i].min(b[j]);
        while i < a.len() && a[i] <= x {
            i += 1;
        }
        while j < b.len() && b[j] <= x {
            j += 1;
        }
        distance = distance.max((i as f64 / n - j as f64 / m).abs());
    }
    Ok(distance)
}

/// Aggregated evaluation results for one checkpoint.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EvaluationReport {
    pub step: usize,
    /// Batch means of the objective metrics (rate, reconstruction, elbo, ...).
    pub metrics: Metrics,
    pub iw_ll_per_word: Option<f64>,
    pub iw_ll_x_gen_per_word: Option<f64>,
    /// KS distance between per-word IW LL of data and of generated text.
    pub d_ks: Option<f64>,
}

impl EvaluationReport {
    pub fn value(&self, criterion: Criterion) -> Option<f64> {
        match criterion {
            Criterion::Rate => self.metrics.get("rate").copied(),
            Criterion::Distortion => self.metrics.get("reconstruction").copied(),
            Criterion::Mmd => self.metrics.get("mmd").copied(),
            Criterion::Elbo => self.metrics.get("elbo").copied(),
            Criterion::IwLl => self.iw_ll_per_word,
            Criterion::IwLlXGen => self.iw_ll_x_gen_per_word,
            Criterion::DKs => self.d_ks,
        }
    }

    pub fn candidate(&self, criteria: &[Criterion]) -> Result<Candidate, TrainingError> {
        let values = criteria
            .iter()
            .map(|criterion| {
                self.value(*criterion)
                    .map(|value| (*criterion, value))
                    .ok_or_else(|| {
                        TrainingError::runtime(format!(
                            "evaluation did not produce '{}'",
                            criterion.name()
                        ))
                    })
            })
            .collect::<Result<_, _>>()?;
        Ok(Candidate {
            step: self.step,
            values,
        })
    }
}

pub fn mean_per_word(estimates: &[IwEstimate]) -> Option<f64> {
    if estimates.is_empty() {
        return None;
    }
    Some(estimates.iter().map(|e| e.per_word).sum::<f64>() / estimates.len() as f64)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ks_of_identical_samples_is_zero() -> Result<(), TrainingError> {
        let sample = [0.3, -1.0, 2.5, 0.3, 7.0];
        assert_eq!(ks_statistic(&sample, &sample)?, 0.0);
        Ok(())
    }

    #[test]
    fn ks_of_disjoint_samples_is_one() -> Result<(), TrainingError> {
        assert_eq!(ks_statistic(&[1.0, 2.0], &[5.0, 6.0, 7.0])?, 1.0);
        let partial = ks_statistic(&[1.0, 2.0, 3.0, 4.0], &[3.5, 4.5])?;
        assert!((partial - 0.75).abs() < 1e-12);
        assert!(ks_statistic(&[], &[1.0]).is_err());
        Ok(())
    }

    #[test]
    fn generated_rows_are_framed_and_cut_at_eos() -> Result<(), TrainingError> {
        let device = Device::Cpu;
        let generated = Tensor::new(&[[5u32, 6, 2, 7], [8, 9, 10, 11]], &device)?;
        let (ids, mask) = frame_generated(&generated, 5, 0, 2, 1)?;
        assert_eq!(
            ids.to_vec2::<u32>()?,
            vec![vec![0, 5, 6, 2, 1], vec![0, 8, 9, 10, 2]]
        );
        assert_eq!(
            mask.to_vec2::<u32>()?,
            vec![vec![1, 1, 1, 1, 0], vec![1, 1, 1, 1, 1]]
        );
        Ok(())
    }

    #[test]
    fn token_count_skips_first_position_padding_and_mask() {
        assert_eq!(counted_tokens(&[0, 4, 5, 2, 1], None, 1), 3);
        assert_eq!(counted_tokens(&[0, 4, 5, 2], Some(&[1, 1, 0, 0]), 1), 1);
    }
}
