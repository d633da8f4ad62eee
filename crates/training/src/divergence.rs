//! Latent-space divergence estimators used by the objectives.
//!
//! All functions take a batch of latent samples `z` of shape
//! `(batch, latent_size)` and return scalar tensors that stay attached to the
//! autograd graph.

use std::f64::consts::PI;

use candle_core::{Result, Tensor, D};
use model::posterior::{standard_normal_log_density, Posterior};

/// Lower bound on the KDE bandwidth so tiny or collapsed batches stay finite.
pub const KDE_BANDWIDTH_FLOOR: f64 = 1e-2;

/// Numerically stable `log(sum(exp(x)))` along `dim`.
pub fn log_sum_exp(values: &Tensor, dim: usize) -> Result<Tensor> {
    let max = values.max_keepdim(dim)?.detach();
    let shifted = values.broadcast_sub(&max)?;
    shifted.exp()?.sum_keepdim(dim)?.log()?.add(&max)?.squeeze(dim)
}

/// Total KL to the prior, summed over dimensions.
pub fn rate(kl_per_dim: &Tensor) -> Result<Tensor> {
    kl_per_dim.sum_all()
}

/// `sum_d max(KL_d, free_bits)`.
pub fn free_bits_kl(kl_per_dim: &Tensor, free_bits: f64) -> Result<Tensor> {
    kl_per_dim.clamp(free_bits, f64::INFINITY)?.sum_all()
}

/// Minibatch-weighted estimates of the KL decomposition terms.
#[derive(Debug, Clone)]
pub struct KlDecomposition {
    /// `E[log q(z|x) - log q(z)]`
    pub mutual_information: Tensor,
    /// `E[log q(z) - sum_d log q(z_d)]`
    pub total_correlation: Tensor,
    /// `E[sum_d log q(z_d) - log p(z)]`
    pub dimension_wise_kl: Tensor,
    /// `E[log q(z) - log p(z)]`
    pub marginal_kl: Tensor,
}

/// Decomposes the aggregate posterior KL with the minibatch-weighted
/// estimator, using the batch itself as the sample of `q(z)`.
pub fn decompose_kl(posterior: &Posterior, z: &Tensor) -> Result<KlDecomposition> {
    let (batch, _) = z.dims2()?;
    let log_batch = (batch as f64).ln();

    // (i, j, d): log q(z_i,d | x_j)
    let z_i = z.unsqueeze(1)?;
    let mu_j = posterior.mu.unsqueeze(0)?;
    let logvar_j = posterior.logvar.unsqueeze(0)?;
    let diff = z_i.broadcast_sub(&mu_j)?;
    let pairwise = diff
        .sqr()?
        .broadcast_div(&logvar_j.exp()?)?
        .broadcast_add(&logvar_j)?
        .affine(-0.5, -0.5 * (2.0 * PI).ln())?;

    let log_qz_given_x = posterior.log_q(z)?;
    let log_qz = (log_sum_exp(&pairwise.sum(D::Minus1)?, 1)? - log_batch)?;
    let log_prod_qzi = (log_sum_exp(&pairwise, 1)? - log_batch)?.sum(D::Minus1)?;
    let log_pz = standard_normal_log_density(z)?;

    Ok(KlDecomposition {
        mutual_information: (&log_qz_given_x - &log_qz)?.mean_all()?,
        total_correlation: (&log_qz - &log_prod_qzi)?.mean_all()?,
        dimension_wise_kl: (&log_prod_qzi - &log_pz)?.mean_all()?,
        marginal_kl: (&log_qz - &log_pz)?.mean_all()?,
    })
}

fn gaussian_kernel(x: &Tensor, y: &Tensor) -> Result<Tensor> {
    let dims = x.dim(D::Minus1)? as f64;
    let diff = x.unsqueeze(1)?.broadcast_sub(&y.unsqueeze(0)?)?;
    diff.sqr()?.sum(D::Minus1)?.affine(-1.0 / dims, 0.0)?.exp()
}

/// Maximum mean discrepancy between two sample sets with the kernel
/// `exp(-||x - y||^2 / latent_size)`.
pub fn mmd(z: &Tensor, prior_samples: &Tensor) -> Result<Tensor> {
    let zz = gaussian_kernel(z, z)?.mean_all()?;
    let pp = gaussian_kernel(prior_samples, prior_samples)?.mean_all()?;
    let zp = gaussian_kernel(z, prior_samples)?.mean_all()?;
    (zz + pp)? - zp.affine(2.0, 0.0)?
}

/// MMD between `z` and an equally sized draw from `N(0, I)`.
pub fn mmd_to_prior(z: &Tensor) -> Result<Tensor> {
    let prior = z.randn_like(0.0, 1.0)?.detach();
    mmd(z, &prior)
}

/// Sum over dimensions of `KL(q(z_d) || N(0, 1))`, with each 1-D aggregate
/// marginal `q(z_d)` estimated by a Gaussian KDE over the batch.
///
/// The bandwidth follows Silverman's rule `1.06 * std * B^(-1/5)`, floored at
/// `bandwidth_floor`, and is treated as a constant.
pub fn kde_marginal_kl(z: &Tensor, bandwidth_floor: f64) -> Result<Tensor> {
    let (batch, _) = z.dims2()?;
    let log_batch = (batch as f64).ln();
    let silverman = 1.06 * (batch as f64).powf(-0.2);

    let centered = z.broadcast_sub(&z.mean_keepdim(0)?)?;
    let std = centered.sqr()?.mean_keepdim(0)?.sqrt()?;
    let bandwidth = std
        .affine(silverman, 0.0)?
        .clamp(bandwidth_floor, f64::INFINITY)?
        .detach();

    // (i, j, d): log N(z_i,d; z_j,d, h_d^2)
    let diff = z.unsqueeze(1)?.broadcast_sub(&z.unsqueeze(0)?)?;
    let scaled = diff.broadcast_div(&bandwidth.unsqueeze(0)?)?;
    let log_kernel = scaled
        .sqr()?
        .affine(-0.5, -0.5 * (2.0 * PI).ln())?
        .broadcast_sub(&bandwidth.log()?.unsqueeze(0)?)?;
    let log_q = (log_sum_exp(&log_kernel, 1)? - log_batch)?;
    let log_p = z.sqr()?.affine(-0.5, -0.5 * (2.0 * PI).ln())?;
    (log_q - log_p)?.mean(0)?.sum_all()
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device};

    fn scalar(t: &Tensor) -> Result<f32> {
        t.to_dtype(DType::F32)?.to_vec0::<f32>()
    }

    #[test]
    fn log_sum_exp_is_stable_for_large_values() -> Result<()> {
        let device = Device::Cpu;
        let values = Tensor::new(&[[1000f32, 1000.0], [0.0, 0.0]], &device)?;
        let out = log_sum_exp(&values, 1)?.to_vec1::<f32>()?;
        assert!((out[0] - (1000.0 + 2f32.ln())).abs() < 1e-3);
        assert!((out[1] - 2f32.ln()).abs() < 1e-6);
        Ok(())
    }

    #[test]
    fn free_bits_floor_each_dimension() -> Result<()> {
        let device = Device::Cpu;
        let kl = Tensor::new(&[0.05f32, 0.2, 0.0], &device)?;
        let clipped = scalar(&free_bits_kl(&kl, 0.1)?)?;
        assert!((clipped - 0.4).abs() < 1e-6);
        assert!((scalar(&rate(&kl)?)? - 0.25).abs() < 1e-6);
        Ok(())
    }

    #[test]
    fn decomposition_terms_sum_to_marginal_kl() -> Result<()> {
        let device = Device::Cpu;
        let posterior = Posterior::new(
            Tensor::randn(0f32, 1.0, (6, 3), &device)?,
            Tensor::randn(0f32, 0.3, (6, 3), &device)?,
        )?;
        let z = posterior.sample()?;
        let terms = decompose_kl(&posterior, &z)?;
        let tc = scalar(&terms.total_correlation)?;
        let dim = scalar(&terms.dimension_wise_kl)?;
        let marginal = scalar(&terms.marginal_kl)?;
        assert!((tc + dim - marginal).abs() < 1e-3);
        assert!(scalar(&terms.mutual_information)?.is_finite());
        Ok(())
    }

    #[test]
    fn mmd_of_identical_sets_is_zero() -> Result<()> {
        let device = Device::Cpu;
        let z = Tensor::randn(0f32, 1.0, (5, 4), &device)?;
        assert!(scalar(&mmd(&z, &z)?)?.abs() < 1e-6);
        let shifted = (z.clone() + 5.0)?;
        assert!(scalar(&mmd(&z, &shifted)?)? > 0.1);
        Ok(())
    }

    #[test]
    fn tiny_batches_stay_finite() -> Result<()> {
        let device = Device::Cpu;
        let single = Tensor::new(&[[0.3f32, -1.2]], &device)?;
        assert!(scalar(&mmd_to_prior(&single)?)?.is_finite());
        assert!(scalar(&kde_marginal_kl(&single, KDE_BANDWIDTH_FLOOR)?)?.is_finite());

        let collapsed = Tensor::zeros((4, 2), DType::F32, &device)?;
        assert!(scalar(&kde_marginal_kl(&collapsed, KDE_BANDWIDTH_FLOOR)?)?.is_finite());
        Ok(())
    }
}
