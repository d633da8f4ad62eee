//! Diagonal Gaussian approximate posterior `q(z|x)` and the standard prior.

use std::f64::consts::PI;

use candle_core::{Result, Tensor, D};

/// `q(z|x) = N(mu, diag(exp(logvar)))`, both `(batch, latent_size)`.
#[derive(Debug, Clone)]
pub struct Posterior {
    pub mu: Tensor,
    pub logvar: Tensor,
}

impl Posterior {
    pub fn new(mu: Tensor, logvar: Tensor) -> Result<Self> {
        if mu.dims() != logvar.dims() {
            candle_core::bail!(
                "posterior mu {:?} and logvar {:?} must share a shape",
                mu.dims(),
                logvar.dims()
            );
        }
        Ok(Self { mu, logvar })
    }

    pub fn latent_size(&self) -> Result<usize> {
        self.mu.dim(D::Minus1)
    }

    /// Reparameterised sample `mu + exp(logvar / 2) * eps`.
    pub fn sample(&self) -> Result<Tensor> {
        let eps = self.mu.randn_like(0.0, 1.0)?;
        &self.mu + (self.logvar.affine(0.5, 0.0)?.exp()? * eps)?
    }

    /// `n` reparameterised samples for every row, `(n, batch, latent_size)`.
    pub fn sample_n(&self, n: usize) -> Result<Tensor> {
        let samples = (0..n).map(|_| self.sample()).collect::<Result<Vec<_>>>()?;
        Tensor::stack(&samples, 0)
    }

    /// `log q(z|x)` summed over latent dimensions.
    ///
    /// `z` may carry extra leading sample dimensions; they broadcast.
    pub fn log_q(&self, z: &Tensor) -> Result<Tensor> {
        gaussian_log_density(z, &self.mu, &self.logvar)
    }

    /// Analytic `KL(q || N(0, I))` per dimension, averaged over the batch.
    pub fn kl_per_dim(&self) -> Result<Tensor> {
        let var = self.logvar.exp()?;
        let kl = ((self.mu.sqr()? + var)? - &self.logvar)?.affine(0.5, -0.5)?;
        kl.mean(0)
    }

    /// Row `index` repeated `n` times, as a `(n, latent_size)` posterior.
    pub fn expand_row(&self, index: usize, n: usize) -> Result<Self> {
        let row = |t: &Tensor| -> Result<Tensor> {
            let latent = t.dim(D::Minus1)?;
            t.narrow(0, index, 1)?.broadcast_as((n, latent))?.contiguous()
        };
        Ok(Self {
            mu: row(&self.mu)?,
            logvar: row(&self.logvar)?,
        })
    }
}

/// Diagonal Gaussian log density summed over the last dimension.
pub fn gaussian_log_density(z: &Tensor, mu: &Tensor, logvar: &Tensor) -> Result<Tensor> {
    let latent = z.dim(D::Minus1)? as f64;
    let diff = z.broadcast_sub(mu)?;
    let scaled = diff.sqr()?.broadcast_div(&logvar.exp()?)?;
    let quad = scaled.broadcast_add(logvar)?.sum(D::Minus1)?;
    quad.affine(-0.5, -0.5 * latent * (2.0 * PI).ln())
}

/// `log N(z; 0, I)` summed over the last dimension.
pub fn standard_normal_log_density(z: &Tensor) -> Result<Tensor> {
    let latent = z.dim(D::Minus1)? as f64;
    z.sqr()?
        .sum(D::Minus1)?
        .affine(-0.5, -0.5 * latent * (2.0 * PI).ln())
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device};

    #[test]
    fn standard_posterior_has_zero_kl() -> Result<()> {
        let device = Device::Cpu;
        let zeros = Tensor::zeros((4, 3), DType::F32, &device)?;
        let posterior = Posterior::new(zeros.clone(), zeros)?;
        let kl = posterior.kl_per_dim()?.to_vec1::<f32>()?;
        assert!(kl.iter().all(|v| v.abs() < 1e-7));
        Ok(())
    }

    #[test]
    fn kl_matches_closed_form() -> Result<()> {
        let device = Device::Cpu;
        let mu = Tensor::new(&[[1f32, 0.0]], &device)?;
        let logvar = Tensor::new(&[[0f32, 2f32.ln()]], &device)?;
        let kl = Posterior::new(mu, logvar)?.kl_per_dim()?.to_vec1::<f32>()?;
        assert!((kl[0] - 0.5).abs() < 1e-6);
        let expected = 0.5 * (2.0 - 2f32.ln() - 1.0);
        assert!((kl[1] - expected).abs() < 1e-6);
        Ok(())
    }

    #[test]
    fn log_densities_agree_for_standard_posterior() -> Result<()> {
        let device = Device::Cpu;
        let zeros = Tensor::zeros((2, 5), DType::F32, &device)?;
        let posterior = Posterior::new(zeros.clone(), zeros)?;
        let z = Tensor::randn(0f32, 1f32, (3, 2, 5), &device)?;
        let lq = posterior.log_q(&z)?;
        let lp = standard_normal_log_density(&z)?;
        assert_eq!(lq.dims(), &[3, 2]);
        let diff = (lq - lp)?.abs()?.max_all()?.to_vec0::<f32>()?;
        assert!(diff < 1e-5);
        Ok(())
    }

    #[test]
    fn sample_n_stacks_leading_dimension() -> Result<()> {
        let device = Device::Cpu;
        let posterior = Posterior::new(
            Tensor::ones((2, 3), DType::F32, &device)?,
            Tensor::full(-20f32, (2, 3), &device)?,
        )?;
        let samples = posterior.sample_n(4)?;
        assert_eq!(samples.dims(), &[4, 2, 3]);
        // Near-zero variance collapses onto the mean.
        let values = samples.flatten_all()?.to_vec1::<f32>()?;
        assert!(values.iter().all(|v| (v - 1.0).abs() < 1e-3));
        Ok(())
    }

    #[test]
    fn repeated_sampling_leaves_parameters_intact() -> Result<()> {
        let device = Device::Cpu;
        let mu = Tensor::new(&[[2f32, -1.0]], &device)?;
        let posterior = Posterior::new(mu, Tensor::full(-30f32, (1, 2), &device)?)?;
        let first = posterior.sample()?;
        let second = posterior.sample()?;
        assert_eq!(posterior.mu.to_vec2::<f32>()?, vec![vec![2.0, -1.0]]);
        let gap = (first - second)?.abs()?.max_all()?.to_vec0::<f32>()?;
        assert!(gap < 1e-4);
        Ok(())
    }
}
