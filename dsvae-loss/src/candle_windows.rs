use candle_core::{bail, Result, Tensor};

use crate::candle_latent_dist::LatentDist;

/// Number of window positions over a series of `seq_len` steps with
/// windows of 2T steps: `seq_len - 2T`
///
/// Windows start at t = 0, 1, ..., seq_len - 2T - 1.
pub fn num_windows(seq_len: usize, half_window: usize) -> Result<usize> {
    if half_window == 0 {
        bail!("half-window length must be positive");
    }
    if seq_len <= 2 * half_window {
        bail!(
            "series of {} steps is too short for windows of {} steps",
            seq_len,
            2 * half_window
        );
    }
    Ok(seq_len - 2 * half_window)
}

/// Slide a window of 2T steps over a latent series
///
/// The series is flattened to (B, L·d) and cut into blocks of 2T·d
/// elements with a stride of d elements (one time step).
///
/// * `x_btd` - latent series, shape (B, L, d)
/// * `half_window` - T
///
/// # Returns
/// Windows, shape (B, L - 2T, 2T·d)
pub fn sliding_windows(x_btd: &Tensor, half_window: usize) -> Result<Tensor> {
    let (nb, nt, nd) = x_btd.dims3()?;
    let n_win = num_windows(nt, half_window)?;
    let width = 2 * half_window * nd;

    let x_flat = x_btd.reshape((nb, nt * nd))?;

    let windows = (0..n_win)
        .map(|w| x_flat.narrow(1, w * nd, width))
        .collect::<Result<Vec<_>>>()?;

    Tensor::stack(&windows, 1)
}

/// Average a per-step validity mask over the same windows as
/// [`sliding_windows`]
///
/// * `mask_bt` - mask, shape (B, L), 1 for valid steps and 0 for padding
/// * `half_window` - T
///
/// # Returns
/// Window weights, shape (B, L - 2T)
pub fn sliding_window_mean(mask_bt: &Tensor, half_window: usize) -> Result<Tensor> {
    let (_, nt) = mask_bt.dims2()?;
    let n_win = num_windows(nt, half_window)?;

    let cols = (0..n_win)
        .map(|w| mask_bt.narrow(1, w, 2 * half_window)?.mean_keepdim(1))
        .collect::<Result<Vec<_>>>()?;

    Tensor::cat(&cols, 1)
}

/// Latent samples and posterior parameters cut into the same windows
pub struct LatentWindows {
    /// Windowed samples: (B, W, 2T·d)
    pub z: Tensor,
    /// Windowed posterior means: (B, W, 2T·d)
    pub mean: Tensor,
    /// Windowed posterior log-variances: (B, W, 2T·d)
    pub ln_var: Tensor,
}

impl LatentWindows {
    pub fn new(latent_sample: &Tensor, latent_dist: &LatentDist, half_window: usize) -> Result<Self> {
        if latent_sample.dims() != latent_dist.dims() {
            bail!(
                "latent sample {:?} and posterior {:?} must share a shape",
                latent_sample.dims(),
                latent_dist.dims()
            );
        }

        Ok(Self {
            z: sliding_windows(latent_sample, half_window)?,
            mean: sliding_windows(latent_dist.mean, half_window)?,
            ln_var: sliding_windows(latent_dist.ln_var, half_window)?,
        })
    }

    /// The windowed posterior as a [`LatentDist`]
    pub fn dist(&self) -> LatentDist<'_> {
        LatentDist {
            mean: &self.mean,
            ln_var: &self.ln_var,
        }
    }

    /// log q(z|x) of every window under its own posterior: (B, W)
    pub fn log_q_zcx(&self) -> Result<Tensor> {
        self.dist().log_prob(&self.z)
    }

    pub fn num_windows(&self) -> Result<usize> {
        self.z.dim(1)
    }
}
