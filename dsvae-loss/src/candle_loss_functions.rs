use candle_core::{Result, Tensor};
use log::debug;

use crate::candle_aggregate::*;
use crate::candle_latent_dist::LatentDist;
use crate::candle_windowed_prior::{Prior, WindowedGaussianPrior};
use crate::candle_windows::{sliding_window_mean, LatentWindows};

/// β-TCVAE regulariser on a static latent batch
///
/// loss = α * E[log q(z|x) - log q(z)] + β * E[log q(z) - log Π_k q(z_k)]
///
/// The dimension-wise KL E[log Π_k q(z_k) - log p(z)] is left out of
/// the loss; see [`LogProbs::decompose`] to monitor it.
///
/// * `latent_dist` - posterior (B, D)
/// * `latent_sample` - z, shape (B, D)
/// * `n_data` - dataset size
/// * `is_mss` - minibatch stratified sampling
/// * `alpha` - weight of mutual information
/// * `beta` - weight of total correlation
///
pub fn btcvae_loss(
    latent_dist: &LatentDist,
    latent_sample: &Tensor,
    n_data: usize,
    is_mss: bool,
    alpha: f64,
    beta: f64,
) -> Result<Tensor> {
    let log_probs = aggregate_log_probs(latent_sample, latent_dist, n_data, is_mss)?;
    let Decomposition { mi, tc, .. } = log_probs.decompose()?;
    (mi * alpha)? + (tc * beta)?
}

/// β-TCVAE regulariser over windows of a latent series
///
/// Same blend as [`btcvae_loss`], averaged over batch and window axes.
///
/// * `latent_dist` - posterior (B, L, d)
/// * `latent_sample` - z, shape (B, L, d)
/// * `half_window` - T
///
pub fn btcvae_loss_windowed(
    latent_dist: &LatentDist,
    latent_sample: &Tensor,
    n_data: usize,
    half_window: usize,
    is_mss: bool,
    alpha: f64,
    beta: f64,
) -> Result<Tensor> {
    let log_probs = aggregate_log_probs_windowed(
        latent_sample,
        latent_dist,
        n_data,
        half_window,
        is_mss,
        PosteriorSet::All,
    )?;
    let Decomposition { mi, tc, .. } = log_probs.decompose()?;
    (mi * alpha)? + (tc * beta)?
}

/// Masked rate against the correlated window prior
///
/// rate(b, w) = log q(z_bw | x) - log N(z_bw; 0, Σ)
/// loss = Σ rate * m / Σ m
///
/// where m is the validity mask averaged over each window. An all-zero
/// mask gives 0/0 = NaN.
///
/// * `latent_dist` - posterior (B, L, d)
/// * `latent_sample` - z, shape (B, L, d)
/// * `hmask` - validity mask, shape (B, L)
/// * `half_window` - T
/// * `cov` - window covariance Σ, shape (2T·d, 2T·d)
///
pub fn vdca_rate_loss(
    latent_dist: &LatentDist,
    latent_sample: &Tensor,
    hmask: &Tensor,
    half_window: usize,
    cov: &Tensor,
) -> Result<Tensor> {
    let prior = WindowedGaussianPrior::from_cov(cov)?;
    let windows = LatentWindows::new(latent_sample, latent_dist, half_window)?;

    let log_q_zcx = windows.log_q_zcx()?;
    let log_pz = prior.log_prob(&windows.z)?;

    let mask_bw = sliding_window_mean(&hmask.to_dtype(latent_sample.dtype())?, half_window)?;

    let rate_bw = (log_q_zcx - log_pz)?;
    (rate_bw * &mask_bw)?.sum_all()? / mask_bw.sum_all()?
}

/// Block-local decomposition plus the windowed KL against the
/// correlated prior
pub struct BlockDecomposition {
    /// E[log q(z|x) - log q(z)] on windows
    pub mi: Tensor,
    /// E[log q(z) - log Π_k q(z_k)] on windows
    pub tc: Tensor,
    /// E[log q(z) - log p(z)] on windows, p = N(0, I)
    pub kl_block: Tensor,
    /// E[log q(z|x) - log N(z; μ, Σ)] on windows, unmasked
    pub kl: Tensor,
}

impl BlockDecomposition {
    /// α * mi + β * tc + γ * kl_block + ζ * kl
    pub fn blend(&self, alpha: f64, beta: f64, gamma: f64, zeta: f64) -> Result<Tensor> {
        let loss = ((&self.mi * alpha)? + (&self.tc * beta)?)?;
        let loss = (loss + (&self.kl_block * gamma)?)?;
        loss + (&self.kl * zeta)?
    }
}

/// Ingredients of [`vdca_loss_junwen`]
///
/// * `latent_dist` - posterior (B, L, d)
/// * `latent_sample` - z, shape (B, L, d)
/// * `mu` - prior mean over a window, 2T·d elements
/// * `cov` - window covariance Σ
/// * `cov_l` - lower Cholesky factor of Σ
/// * `half_window` - T
/// * `n_data` - dataset size (not used by window comparisons)
///
pub fn vdca_loss_terms(
    latent_dist: &LatentDist,
    latent_sample: &Tensor,
    mu: &Tensor,
    cov: &Tensor,
    cov_l: &Tensor,
    half_window: usize,
    n_data: usize,
) -> Result<BlockDecomposition> {
    let prior = WindowedGaussianPrior::new(mu, cov, Some(cov_l))?;
    let windows = LatentWindows::new(latent_sample, latent_dist, half_window)?;

    debug!(
        "block decomposition over {} windows (n_data = {})",
        windows.num_windows()?,
        n_data
    );

    let block = aggregate_window_log_probs(&windows, PosteriorSet::SkipFirst)?;

    let mi = (&block.log_q_zcx - &block.log_qz)?.mean_all()?;
    let tc = (&block.log_qz - &block.log_prod_qzi)?.mean_all()?;
    let kl_block = (&block.log_qz - &block.log_pz)?.mean_all()?;

    let log_pz = prior.log_prob(&windows.z)?;
    let kl = (&block.log_q_zcx - log_pz)?.mean_all()?;

    Ok(BlockDecomposition {
        mi,
        tc,
        kl_block,
        kl,
    })
}

/// Sequential regulariser blending block-local MI/TC/KL with the
/// windowed KL against the correlated prior
///
/// loss = α * mi + β * tc + γ * kl_block + ζ * kl
///
/// With γ = ζ = 0 only the block MI/TC terms remain.
#[allow(clippy::too_many_arguments)]
pub fn vdca_loss_junwen(
    latent_dist: &LatentDist,
    latent_sample: &Tensor,
    mu: &Tensor,
    cov: &Tensor,
    cov_l: &Tensor,
    half_window: usize,
    n_data: usize,
    alpha: f64,
    beta: f64,
    gamma: f64,
    zeta: f64,
) -> Result<Tensor> {
    vdca_loss_terms(
        latent_dist,
        latent_sample,
        mu,
        cov,
        cov_l,
        half_window,
        n_data,
    )?
    .blend(alpha, beta, gamma, zeta)
}
