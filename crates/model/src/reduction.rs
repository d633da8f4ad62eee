//! Two-stage (sequence, then batch) reductions for per-token statistics.

use candle_core::{DType, Result, Tensor};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Reduction {
    None,
    Sum,
    Mean,
}

/// Reduce along the sequence first, then along the batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TwoStageReduction {
    pub sequence: Reduction,
    pub batch: Reduction,
}

impl TwoStageReduction {
    pub const NONE: Self = Self::new(Reduction::None, Reduction::None);

    pub const fn new(sequence: Reduction, batch: Reduction) -> Self {
        Self { sequence, batch }
    }

    /// Reduce `values` `(batch, len)` under `mask` `(batch, len)`.
    ///
    /// Masked positions are zeroed. A sequence `mean` divides by that
    /// sequence's count of valid positions (at least one).
    pub fn apply(&self, values: &Tensor, mask: &Tensor) -> Result<Tensor> {
        let mask = mask.to_dtype(values.dtype())?;
        let masked = values.mul(&mask)?;
        let per_sequence = match self.sequence {
            Reduction::None => masked,
            Reduction::Sum => masked.sum(1)?,
            Reduction::Mean => {
                let counts = mask.sum(1)?.clamp(1.0, f64::INFINITY)?;
                masked.sum(1)?.div(&counts)?
            }
        };
        match self.batch {
            Reduction::None => Ok(per_sequence),
            Reduction::Sum => per_sequence.sum(0),
            Reduction::Mean => per_sequence.mean(0),
        }
    }
}

impl Default for TwoStageReduction {
    fn default() -> Self {
        Self::new(Reduction::Sum, Reduction::Mean)
    }
}

/// All-ones mask matching the leading two dims of `values`.
pub fn full_mask(values: &Tensor) -> Result<Tensor> {
    let (batch, len) = values.dims2()?;
    Tensor::ones((batch, len), DType::F32, values.device())
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;

    fn fixtures() -> Result<(Tensor, Tensor)> {
        let device = Device::Cpu;
        let values = Tensor::from_vec(vec![1f32, 2., 3., 4., 5., 6.], (2, 3), &device)?;
        let mask = Tensor::from_vec(vec![1f32, 1., 0., 1., 1., 1.], (2, 3), &device)?;
        Ok((values, mask))
    }

    #[test]
    fn sequence_mean_uses_valid_count() -> Result<()> {
        let (values, mask) = fixtures()?;
        let out = TwoStageReduction::new(Reduction::Mean, Reduction::None).apply(&values, &mask)?;
        assert_eq!(out.to_vec1::<f32>()?, vec![1.5, 5.0]);
        Ok(())
    }

    #[test]
    fn none_then_reduce_matches_direct_reduction() -> Result<()> {
        let (values, mask) = fixtures()?;
        let direct = TwoStageReduction::new(Reduction::Sum, Reduction::Mean)
            .apply(&values, &mask)?
            .to_vec0::<f32>()?;
        let raw = TwoStageReduction::NONE.apply(&values, &mask)?;
        let later = TwoStageReduction::new(Reduction::Sum, Reduction::Mean)
            .apply(&raw, &full_mask(&raw)?)?
            .to_vec0::<f32>()?;
        assert!((direct - later).abs() < 1e-6);
        assert!((direct - 9.0).abs() < 1e-6);
        Ok(())
    }

    #[test]
    fn batch_sum_of_sequence_sums_is_total() -> Result<()> {
        let (values, mask) = fixtures()?;
        let out = TwoStageReduction::new(Reduction::Sum, Reduction::Sum).apply(&values, &mask)?;
        assert_eq!(out.to_vec0::<f32>()?, 18.0);
        Ok(())
    }

    #[test]
    fn reduction_names_deserialize_lowercase() {
        let parsed: TwoStageReduction =
            serde_json::from_str(r#"{"sequence":"mean","batch":"none"}"#).unwrap();
        assert_eq!(parsed, TwoStageReduction::new(Reduction::Mean, Reduction::None));
    }
}
