use candle_core::{Result, Tensor};
use clap::{ArgAction, Args};

use crate::candle_latent_dist::LatentDist;
use crate::candle_loss_functions::*;

/// Regulariser hyperparameters, meant to be flattened into a trainer's
/// command line
#[derive(Args, Clone, Debug)]
pub struct LossConfig {
    #[arg(long, default_value = "1.0", help = "Weight of mutual information (α)")]
    pub alpha: f64,

    #[arg(long, default_value = "6.0", help = "Weight of total correlation (β)")]
    pub beta: f64,

    #[arg(long, default_value = "0.0", help = "Weight of block KL against N(0, I) (γ)")]
    pub gamma: f64,

    #[arg(long, default_value = "0.0", help = "Weight of windowed KL against N(μ, Σ) (ζ)")]
    pub zeta: f64,

    #[arg(long, default_value = "10000", help = "Number of training examples (N)")]
    pub n_data: usize,

    #[arg(long, default_value = "1", help = "Half-window length (T); windows span 2T steps")]
    pub half_window: usize,

    #[arg(long, default_value_t = true, action = ArgAction::Set, help = "Minibatch stratified sampling")]
    pub is_mss: bool,
}

impl Default for LossConfig {
    fn default() -> Self {
        Self {
            alpha: 1.0,
            beta: 6.0,
            gamma: 0.0,
            zeta: 0.0,
            n_data: 10_000,
            half_window: 1,
            is_mss: true,
        }
    }
}

impl LossConfig {
    pub fn btcvae_loss(&self, latent_dist: &LatentDist, latent_sample: &Tensor) -> Result<Tensor> {
        btcvae_loss(
            latent_dist,
            latent_sample,
            self.n_data,
            self.is_mss,
            self.alpha,
            self.beta,
        )
    }

    pub fn btcvae_loss_windowed(
        &self,
        latent_dist: &LatentDist,
        latent_sample: &Tensor,
    ) -> Result<Tensor> {
        btcvae_loss_windowed(
            latent_dist,
            latent_sample,
            self.n_data,
            self.half_window,
            self.is_mss,
            self.alpha,
            self.beta,
        )
    }

    pub fn vdca_rate_loss(
        &self,
        latent_dist: &LatentDist,
        latent_sample: &Tensor,
        hmask: &Tensor,
        cov: &Tensor,
    ) -> Result<Tensor> {
        vdca_rate_loss(latent_dist, latent_sample, hmask, self.half_window, cov)
    }

    pub fn vdca_loss_terms(
        &self,
        latent_dist: &LatentDist,
        latent_sample: &Tensor,
        mu: &Tensor,
        cov: &Tensor,
        cov_l: &Tensor,
    ) -> Result<BlockDecomposition> {
        vdca_loss_terms(
            latent_dist,
            latent_sample,
            mu,
            cov,
            cov_l,
            self.half_window,
            self.n_data,
        )
    }

    pub fn vdca_loss_junwen(
        &self,
        latent_dist: &LatentDist,
        latent_sample: &Tensor,
        mu: &Tensor,
        cov: &Tensor,
        cov_l: &Tensor,
    ) -> Result<Tensor> {
        self.vdca_loss_terms(latent_dist, latent_sample, mu, cov, cov_l)?
            .blend(self.alpha, self.beta, self.gamma, self.zeta)
    }
}
