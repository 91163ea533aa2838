use candle_core::{bail, Result, Tensor};

use crate::candle_log_density::log_density_gaussian;

/// Diagonal Gaussian posterior q(z|x) = N(μ, diag(σ²)) produced by an encoder
///
/// Borrowed view over the encoder's output; nothing is copied and
/// gradients flow back into both tensors.
#[derive(Clone, Copy, Debug)]
pub struct LatentDist<'a> {
    /// Posterior mean μ: shape (B, D) or (B, T, D)
    pub mean: &'a Tensor,
    /// Posterior log-variance ln σ²: same shape as `mean`
    pub ln_var: &'a Tensor,
}

impl<'a> LatentDist<'a> {
    pub fn new(mean: &'a Tensor, ln_var: &'a Tensor) -> Result<Self> {
        if mean.dims() != ln_var.dims() {
            bail!(
                "latent mean {:?} and log-variance {:?} must share a shape",
                mean.dims(),
                ln_var.dims()
            );
        }
        Ok(Self { mean, ln_var })
    }

    /// log q(z|x): each sample under its own posterior, summed over the
    /// last (latent) axis
    pub fn log_prob(&self, z: &Tensor) -> Result<Tensor> {
        log_density_gaussian(z, self.mean, self.ln_var)?.sum(z.rank() - 1)
    }

    pub fn dims(&self) -> &[usize] {
        self.mean.dims()
    }
}
