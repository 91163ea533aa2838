use candle_core::{bail, Result, Tensor};
use log::debug;

use crate::candle_latent_dist::LatentDist;
use crate::candle_log_density::{log_importance_weight_matrix, matrix_log_density_gaussian};
use crate::candle_windowed_prior::{Prior, StandardNormalPrior};
use crate::candle_windows::LatentWindows;

/// Per-example (or per-window) log-densities of a latent batch
///
/// Shapes are (B,) for the static estimator and (B, W) for the windowed one.
pub struct LogProbs {
    /// log p(z) under N(0, I)
    pub log_pz: Tensor,
    /// log q(z), aggregate posterior estimated from the minibatch
    pub log_qz: Tensor,
    /// log Π_k q(z_k), product of aggregate marginals
    pub log_prod_qzi: Tensor,
    /// log q(z|x), each sample under its own posterior
    pub log_q_zcx: Tensor,
}

/// Batch means of the KL decomposition terms
pub struct Decomposition {
    /// I[z;x] ≈ E[log q(z|x) - log q(z)]
    pub mi: Tensor,
    /// TC[z] ≈ E[log q(z) - log Π_k q(z_k)]
    pub tc: Tensor,
    /// KL[Π_k q(z_k) || p(z)] ≈ E[log Π_k q(z_k) - log p(z)]
    pub dw_kl: Tensor,
}

impl LogProbs {
    pub fn decompose(&self) -> Result<Decomposition> {
        Ok(Decomposition {
            mi: (&self.log_q_zcx - &self.log_qz)?.mean_all()?,
            tc: (&self.log_qz - &self.log_prod_qzi)?.mean_all()?,
            dw_kl: (&self.log_prod_qzi - &self.log_pz)?.mean_all()?,
        })
    }
}

/// Which windows serve as mixture components for log q(z)
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PosteriorSet {
    /// every window of the series
    All,
    /// every window but the first (`mat[:, :, 1:, :]`)
    SkipFirst,
}

/// Minibatch estimate of log p(z), log q(z), log Π_k q(z_k), log q(z|x)
///
/// log q(z_i) = logsumexp_j Σ_k log q(z_ik | x_j)
/// log Π_k q(z_ik) = Σ_k logsumexp_j log q(z_ik | x_j)
///
/// Without stratification the minibatch estimate of log q(z) carries
/// no 1/B normalisation, so it sits log(B) above the average density.
///
/// # Arguments
/// * `latent_sample` - z, shape (B, D)
/// * `latent_dist` - posterior parameters, shape (B, D) each
/// * `n_data` - dataset size N for the stratified weights
/// * `is_mss` - add log importance weights for minibatch stratified sampling
pub fn aggregate_log_probs(
    latent_sample: &Tensor,
    latent_dist: &LatentDist,
    n_data: usize,
    is_mss: bool,
) -> Result<LogProbs> {
    let (batch_size, _latent_dim) = latent_sample.dims2()?;
    if latent_sample.dims() != latent_dist.dims() {
        bail!(
            "latent sample {:?} and posterior {:?} must share a shape",
            latent_sample.dims(),
            latent_dist.dims()
        );
    }

    let log_q_zcx = latent_dist.log_prob(latent_sample)?;
    let log_pz = StandardNormalPrior.log_prob(latent_sample)?;

    // [i, j, k] = log q(z_ik | x_j): (B, B, D)
    let mut mat_log_qz =
        matrix_log_density_gaussian(latent_sample, latent_dist.mean, latent_dist.ln_var)?;

    if is_mss {
        let log_iw_bb = log_importance_weight_matrix(
            batch_size,
            n_data,
            latent_sample.dtype(),
            latent_sample.device(),
        )?;
        mat_log_qz = mat_log_qz.broadcast_add(&log_iw_bb.unsqueeze(2)?)?;
    }

    debug!(
        "aggregate log-probs: batch {}, pairs {:?}, stratified {}",
        batch_size,
        mat_log_qz.dims(),
        is_mss
    );

    let log_qz = mat_log_qz.sum(2)?.log_sum_exp(1)?;
    let log_prod_qzi = mat_log_qz.log_sum_exp(1)?.sum(1)?;

    Ok(LogProbs {
        log_pz,
        log_qz,
        log_prod_qzi,
        log_q_zcx,
    })
}

/// Windowed minibatch estimate over a latent series
///
/// The series is cut into overlapping windows of 2T steps and each
/// window is compared against the windows of the same series: within
/// batch element b,
///
/// log q(z_bi) = logsumexp_j Σ_k log q(z_bik | x_bj)
///
/// Stratified weights concern examples, not windows, so `n_data` and
/// `is_mss` do not enter the window comparison.
///
/// # Arguments
/// * `latent_sample` - z, shape (B, L, d)
/// * `latent_dist` - posterior parameters, shape (B, L, d) each
/// * `n_data` - dataset size (unused by the window comparison)
/// * `half_window` - T, windows span 2T steps
/// * `is_mss` - ignored for windows
/// * `posteriors` - which windows act as mixture components
///
/// # Returns
/// `LogProbs` of shape (B, L - 2T)
pub fn aggregate_log_probs_windowed(
    latent_sample: &Tensor,
    latent_dist: &LatentDist,
    n_data: usize,
    half_window: usize,
    is_mss: bool,
    posteriors: PosteriorSet,
) -> Result<LogProbs> {
    if is_mss {
        debug!(
            "stratified weights (n_data = {}) are not applied to window comparisons",
            n_data
        );
    }
    let windows = LatentWindows::new(latent_sample, latent_dist, half_window)?;
    aggregate_window_log_probs(&windows, posteriors)
}

/// [`aggregate_log_probs_windowed`] on windows that are already cut
pub fn aggregate_window_log_probs(
    windows: &LatentWindows,
    posteriors: PosteriorSet,
) -> Result<LogProbs> {
    let log_q_zcx = windows.log_q_zcx()?;
    let log_pz = StandardNormalPrior.log_prob(&windows.z)?;

    // [b, i, j, k] = log q(z_bik | x_bj): (B, W, W, K)
    let mat_log_qz = matrix_log_density_gaussian(&windows.z, &windows.mean, &windows.ln_var)?;

    let mat_log_qz = match posteriors {
        PosteriorSet::All => mat_log_qz,
        PosteriorSet::SkipFirst => {
            let n_win = mat_log_qz.dim(2)?;
            if n_win < 2 {
                bail!("skipping the first window leaves no posterior to compare against");
            }
            mat_log_qz.narrow(2, 1, n_win - 1)?
        }
    };

    debug!(
        "windowed log-probs: pairs {:?}, posteriors {:?}",
        mat_log_qz.dims(),
        posteriors
    );

    let log_qz = mat_log_qz.sum(3)?.log_sum_exp(2)?;
    let log_prod_qzi = mat_log_qz.log_sum_exp(2)?.sum(2)?;

    Ok(LogProbs {
        log_pz,
        log_qz,
        log_prod_qzi,
        log_q_zcx,
    })
}
