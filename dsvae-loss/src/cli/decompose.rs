use anyhow::Result;
use candle_core::{DType, Device, Tensor};
use candle_nn::{VarBuilder, VarMap};
use clap::Args;
use log::{info, warn};

use crate::candle_aggregate::aggregate_log_probs;
use crate::candle_latent_dist::LatentDist;
use crate::candle_loss_config::LossConfig;

#[derive(Args, Debug)]
pub struct DecomposeArgs {
    #[arg(long, default_value = "64")]
    pub batch_size: usize,

    #[arg(long, default_value = "16")]
    pub seq_len: usize,

    #[arg(long, default_value = "4")]
    pub latent_dim: usize,

    #[command(flatten)]
    pub loss: LossConfig,

    #[arg(long)]
    pub gpu: bool,

    #[arg(short, long)]
    pub verbose: bool,
}

/// Stand-in for an encoder's output: trainable (B, L, d) posterior
/// parameters q(z|x) = N(μ, diag(σ²))
pub struct SyntheticPosterior {
    mean: Tensor,
    ln_var: Tensor,
}

impl SyntheticPosterior {
    pub fn new(vb: VarBuilder, nb: usize, nt: usize, nd: usize) -> candle_core::Result<Self> {
        let mean = vb.get_with_hints(
            (nb, nt, nd),
            "mean",
            candle_nn::Init::Randn {
                mean: 0.0,
                stdev: 1.0,
            },
        )?;
        let ln_var = vb.get_with_hints(
            (nb, nt, nd),
            "ln_var",
            candle_nn::Init::Randn {
                mean: -1.0,
                stdev: 0.1,
            },
        )?;
        Ok(Self { mean, ln_var })
    }

    pub fn dist(&self) -> LatentDist<'_> {
        LatentDist {
            mean: &self.mean,
            ln_var: &self.ln_var,
        }
    }

    /// z = μ + σ * ε, ε ~ N(0, I)
    pub fn sample(&self) -> candle_core::Result<Tensor> {
        let epsilon = Tensor::randn(0f32, 1f32, self.mean.shape(), self.mean.device())?
            .to_dtype(self.mean.dtype())?;
        let std = (&self.ln_var * 0.5)?.exp()?;
        &self.mean + epsilon.mul(&std)?
    }

    /// Posterior at a single time step: (B, d) each
    pub fn at_step(&self, t: usize) -> candle_core::Result<(Tensor, Tensor)> {
        Ok((
            self.mean.narrow(1, t, 1)?.squeeze(1)?,
            self.ln_var.narrow(1, t, 1)?.squeeze(1)?,
        ))
    }
}

fn scalar(x: &Tensor) -> candle_core::Result<f32> {
    x.to_dtype(DType::F32)?.to_scalar::<f32>()
}

/// First accelerator the build supports, or CPU when none is available
fn pick_device(gpu: bool) -> Device {
    if !gpu {
        return Device::Cpu;
    }
    let accelerated = if cfg!(target_os = "macos") {
        Device::new_metal(0)
    } else {
        Device::new_cuda(0)
    };
    accelerated.unwrap_or_else(|err| {
        warn!("no GPU backend ({}), falling back to CPU", err);
        Device::Cpu
    })
}

pub fn run(args: &DecomposeArgs) -> Result<()> {
    let device = pick_device(args.gpu);
    info!("Using device: {:?}", device);

    let config = &args.loss;
    let (nb, nt, nd) = (args.batch_size, args.seq_len, args.latent_dim);

    if config.is_mss && config.n_data < nb {
        anyhow::bail!("--n-data must be at least --batch-size for stratified sampling");
    }

    let varmap = VarMap::new();
    let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
    let posterior = SyntheticPosterior::new(vb.pp("posterior"), nb, nt, nd)?;

    let z_btd = posterior.sample()?;
    let dist_btd = posterior.dist();

    if args.verbose {
        info!("latent series: {:?}", z_btd.dims());
        info!("config: {:?}", config);
    }

    //
    // static decomposition on the first step
    //

    let z_bd = z_btd.narrow(1, 0, 1)?.squeeze(1)?;
    let (mean_bd, ln_var_bd) = posterior.at_step(0)?;
    let dist_bd = LatentDist::new(&mean_bd, &ln_var_bd)?;

    let terms = aggregate_log_probs(&z_bd, &dist_bd, config.n_data, config.is_mss)?.decompose()?;
    info!(
        "static   MI {:.4}  TC {:.4}  dim-wise KL {:.4}",
        scalar(&terms.mi)?,
        scalar(&terms.tc)?,
        scalar(&terms.dw_kl)?
    );

    let btc = config.btcvae_loss(&dist_bd, &z_bd)?;
    info!("btcvae loss: {:.4}", scalar(&btc)?);

    //
    // windowed decomposition with an identity window covariance
    //

    let k = 2 * config.half_window * nd;
    let cov = Tensor::eye(k, DType::F32, &device)?;
    let mu = Tensor::zeros(k, DType::F32, &device)?;
    let hmask = Tensor::ones((nb, nt), DType::F32, &device)?;

    let btc_windowed = config.btcvae_loss_windowed(&dist_btd, &z_btd)?;
    info!("windowed btcvae loss: {:.4}", scalar(&btc_windowed)?);

    let rate = config.vdca_rate_loss(&dist_btd, &z_btd, &hmask, &cov)?;
    info!("windowed rate: {:.4}", scalar(&rate)?);

    let block = config.vdca_loss_terms(&dist_btd, &z_btd, &mu, &cov, &cov)?;
    info!(
        "windowed MI {:.4}  TC {:.4}  block KL {:.4}  KL {:.4}",
        scalar(&block.mi)?,
        scalar(&block.tc)?,
        scalar(&block.kl_block)?,
        scalar(&block.kl)?
    );

    let vdca = block.blend(config.alpha, config.beta, config.gamma, config.zeta)?;
    info!("vdca loss: {:.4}", scalar(&vdca)?);

    //
    // gradients back to the posterior parameters
    //

    let total = ((btc + btc_windowed)? + (vdca + rate)?)?;
    let grads = total.backward()?;

    for (name, param) in [("mean", &posterior.mean), ("ln_var", &posterior.ln_var)] {
        let grad = grads
            .get(param)
            .ok_or_else(|| anyhow::anyhow!("no gradient reached the posterior {}", name))?;
        let norm = scalar(&grad.sqr()?.sum_all()?.sqrt()?)?;
        info!("|d loss / d {}| = {:.4}", name, norm);
        if !norm.is_finite() {
            anyhow::bail!("non-finite gradient for the posterior {}", name);
        }
    }

    Ok(())
}
