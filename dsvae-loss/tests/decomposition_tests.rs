use approx::assert_abs_diff_eq;
use candle_core::{DType, Device, Result, Tensor, Var};

use dsvae_loss::candle_aggregate::*;
use dsvae_loss::candle_latent_dist::LatentDist;
use dsvae_loss::candle_log_density::*;
use dsvae_loss::candle_loss_functions::*;
use dsvae_loss::candle_windowed_prior::{Prior, WindowedGaussianPrior};
use dsvae_loss::candle_windows::LatentWindows;

fn ln_2pi() -> f64 {
    (2.0 * std::f64::consts::PI).ln()
}

fn randn(shape: &[usize], stdev: f64) -> Result<Tensor> {
    Tensor::randn(0f64, stdev, shape, &Device::Cpu)
}

#[test]
fn zero_latents_static_scenario() -> Result<()> {
    let z = Tensor::zeros((4, 2), DType::F64, &Device::Cpu)?;
    let dist = LatentDist::new(&z, &z)?;

    let lp = aggregate_log_probs(&z, &dist, 100, false)?;
    let log_q_zcx: Vec<f64> = lp.log_q_zcx.to_vec1()?;
    let log_pz: Vec<f64> = lp.log_pz.to_vec1()?;

    for (q, p) in log_q_zcx.iter().zip(log_pz.iter()) {
        assert_abs_diff_eq!(*q, -ln_2pi(), epsilon = 1e-12);
        assert_abs_diff_eq!(*q, -1.8379, epsilon = 1e-4);
        assert_abs_diff_eq!(*p, *q, epsilon = 1e-12);
    }

    // the plain minibatch estimate of log q(z) is log(B) too high
    let mi: f64 = lp.decompose()?.mi.to_scalar()?;
    assert_abs_diff_eq!(mi, -(4f64.ln()), epsilon = 1e-10);

    // stratified weights enter every latent dimension before the sum over D,
    // so log q(z_i) = log q(z_i|x_i) + ln Σ_j w_ij^D and log Π_k q(z_ik) is unshifted
    let nd = 2;
    let weights: Vec<Vec<f64>> = log_importance_weight_matrix(4, 100, DType::F64, &Device::Cpu)?
        .exp()?
        .to_vec2()?;
    let shift = weights[0].iter().map(|w| w.powi(nd)).sum::<f64>().ln();

    let lp = aggregate_log_probs(&z, &dist, 100, true)?;
    let log_qz: Vec<f64> = lp.log_qz.to_vec1()?;
    for lq in log_qz {
        assert_abs_diff_eq!(lq, -ln_2pi() + shift, epsilon = 1e-10);
    }

    let terms = lp.decompose()?;
    assert_abs_diff_eq!(terms.mi.to_scalar::<f64>()?, -shift, epsilon = 1e-10);
    assert_abs_diff_eq!(terms.tc.to_scalar::<f64>()?, shift, epsilon = 1e-10);
    assert_abs_diff_eq!(terms.mi.to_scalar::<f64>()?, 1.1182, epsilon = 1e-4);
    Ok(())
}

#[test]
fn log_qz_within_log_sum_exp_bounds() -> Result<()> {
    let nb = 5;
    let z = randn(&[nb, 3], 1.0)?;
    let mean = randn(&[nb, 3], 1.0)?;
    let ln_var = randn(&[nb, 3], 0.3)?;
    let dist = LatentDist::new(&mean, &ln_var)?;

    let rows: Vec<Vec<f64>> = matrix_log_density_gaussian(&z, &mean, &ln_var)?
        .sum(2)?
        .to_vec2()?;
    let log_qz: Vec<f64> = aggregate_log_probs(&z, &dist, 100, false)?
        .log_qz
        .to_vec1()?;

    for (row, &lq) in rows.iter().zip(log_qz.iter()) {
        let max = row.iter().cloned().fold(f64::NEG_INFINITY, f64::max);
        for &v in row.iter() {
            assert!(lq >= v - 1e-12);
        }
        assert!(lq <= (nb as f64).ln() + max + 1e-12);
    }
    Ok(())
}

#[test]
fn all_pairs_axes_are_not_swapped() -> Result<()> {
    let z = Tensor::new(&[[0.0f64, 1.0], [2.0, -1.0], [-0.5, 0.5]], &Device::Cpu)?;
    let mean = Tensor::new(&[[1.0f64, 0.0], [-1.0, 2.0], [0.5, 0.5]], &Device::Cpu)?;
    let ln_var = Tensor::new(&[[0.0f64, 0.5], [-0.5, 0.0], [0.2, 0.1]], &Device::Cpu)?;

    let mat: Vec<Vec<f64>> = matrix_log_density_gaussian(&z, &mean, &ln_var)?
        .sum(2)?
        .to_vec2()?;

    // entry [0][1]: sample 0 under posterior 1
    let expected: f64 = log_density_gaussian(&z.get(0)?, &mean.get(1)?, &ln_var.get(1)?)?
        .sum_all()?
        .to_scalar()?;
    assert_abs_diff_eq!(mat[0][1], expected, epsilon = 1e-12);

    let mut asymmetric = false;
    for i in 0..3 {
        for j in 0..3 {
            if (mat[i][j] - mat[j][i]).abs() > 1e-6 {
                asymmetric = true;
            }
        }
    }
    assert!(asymmetric);
    Ok(())
}

#[test]
fn shared_posterior_gives_constant_rows() -> Result<()> {
    let z = randn(&[4, 3], 1.0)?;
    let mean = Tensor::new(&[0.5f64, -0.5, 1.0], &Device::Cpu)?
        .unsqueeze(0)?
        .repeat((4, 1))?;
    let ln_var = mean.zeros_like()?;

    let mat: Vec<Vec<f64>> = matrix_log_density_gaussian(&z, &mean, &ln_var)?
        .sum(2)?
        .to_vec2()?;

    for row in mat.iter() {
        for &v in row.iter() {
            assert_abs_diff_eq!(v, row[0], epsilon = 1e-12);
        }
    }
    Ok(())
}

#[test]
fn static_posterior_must_match_sample_shape() -> Result<()> {
    let z = randn(&[4, 2], 1.0)?;

    for shape in [[1, 2], [4, 1]] {
        let mean = randn(&shape, 1.0)?;
        let ln_var = mean.zeros_like()?;
        let dist = LatentDist::new(&mean, &ln_var)?;
        assert!(aggregate_log_probs(&z, &dist, 100, false).is_err());
        assert!(btcvae_loss(&dist, &z, 100, false, 1.0, 6.0).is_err());
    }
    Ok(())
}

#[test]
fn btcvae_zero_weights_is_zero() -> Result<()> {
    let z = randn(&[8, 4], 1.0)?;
    let mean = randn(&[8, 4], 1.0)?;
    let ln_var = randn(&[8, 4], 0.2)?;
    let dist = LatentDist::new(&mean, &ln_var)?;

    for is_mss in [true, false] {
        let loss: f64 = btcvae_loss(&dist, &z, 1000, is_mss, 0.0, 0.0)?.to_scalar()?;
        assert_eq!(loss, 0.0);
    }
    Ok(())
}

#[test]
fn btcvae_matches_decomposition() -> Result<()> {
    let z = randn(&[8, 4], 1.0)?;
    let mean = randn(&[8, 4], 1.0)?;
    let ln_var = randn(&[8, 4], 0.2)?;
    let dist = LatentDist::new(&mean, &ln_var)?;

    let terms = aggregate_log_probs(&z, &dist, 1000, true)?.decompose()?;
    let mi: f64 = terms.mi.to_scalar()?;
    let tc: f64 = terms.tc.to_scalar()?;

    // dimension-wise KL does not enter the loss
    let loss: f64 = btcvae_loss(&dist, &z, 1000, true, 1.0, 6.0)?.to_scalar()?;
    assert_abs_diff_eq!(loss, mi + 6.0 * tc, epsilon = 1e-10);
    Ok(())
}

#[test]
fn windowed_estimator_window_count() -> Result<()> {
    // T = 1, d = 1, L = 4 → L - 2T = 2 windows of width 2T·d = 2
    let z = randn(&[1, 4, 1], 1.0)?;
    let ln_var = z.zeros_like()?;
    let dist = LatentDist::new(&z, &ln_var)?;

    let windows = LatentWindows::new(&z, &dist, 1)?;
    assert_eq!(windows.z.dims(), &[1, 2, 2]);

    let lp = aggregate_log_probs_windowed(&z, &dist, 10, 1, false, PosteriorSet::All)?;
    assert_eq!(lp.log_qz.dims(), &[1, 2]);
    Ok(())
}

#[test]
fn windowed_estimator_ignores_stratification() -> Result<()> {
    let z = randn(&[2, 6, 2], 1.0)?;
    let mean = randn(&[2, 6, 2], 1.0)?;
    let ln_var = randn(&[2, 6, 2], 0.2)?;
    let dist = LatentDist::new(&mean, &ln_var)?;

    let with_mss = aggregate_log_probs_windowed(&z, &dist, 10, 1, true, PosteriorSet::All)?;
    let without = aggregate_log_probs_windowed(&z, &dist, 10, 1, false, PosteriorSet::All)?;

    let a: Vec<Vec<f64>> = with_mss.log_qz.to_vec2()?;
    let b: Vec<Vec<f64>> = without.log_qz.to_vec2()?;
    assert_eq!(a, b);
    Ok(())
}

fn diagonal(values: &[f64]) -> Result<Tensor> {
    let k = values.len();
    let mut data = vec![0.0; k * k];
    for (i, &v) in values.iter().enumerate() {
        data[i * k + i] = v;
    }
    Tensor::from_vec(data, (k, k), &Device::Cpu)
}

fn diagonal_window_prior(k: usize) -> Result<(Tensor, Tensor, Tensor)> {
    let var: Vec<f64> = (0..k).map(|i| 1.0 + 0.5 * (i % 2) as f64).collect();
    let sd: Vec<f64> = var.iter().map(|v| v.sqrt()).collect();

    let cov = diagonal(&var)?;
    let cov_l = diagonal(&sd)?;
    let mu = randn(&[k], 0.5)?;
    Ok((mu, cov, cov_l))
}

#[test]
fn junwen_without_window_kl_is_block_mi_tc() -> Result<()> {
    let (nb, nt, nd, half) = (3, 7, 2, 1);
    let z = randn(&[nb, nt, nd], 1.0)?;
    let mean = randn(&[nb, nt, nd], 1.0)?;
    let ln_var = randn(&[nb, nt, nd], 0.2)?;
    let dist = LatentDist::new(&mean, &ln_var)?;
    let (mu, cov, cov_l) = diagonal_window_prior(2 * half * nd)?;

    let terms = vdca_loss_terms(&dist, &z, &mu, &cov, &cov_l, half, 100)?;
    let mi: f64 = terms.mi.to_scalar()?;
    let tc: f64 = terms.tc.to_scalar()?;

    let loss: f64 =
        vdca_loss_junwen(&dist, &z, &mu, &cov, &cov_l, half, 100, 1.5, 2.0, 0.0, 0.0)?
            .to_scalar()?;
    assert_abs_diff_eq!(loss, 1.5 * mi + 2.0 * tc, epsilon = 1e-10);

    let kl_block: f64 = terms.kl_block.to_scalar()?;
    let kl: f64 = terms.kl.to_scalar()?;
    let full: f64 =
        vdca_loss_junwen(&dist, &z, &mu, &cov, &cov_l, half, 100, 1.5, 2.0, 0.3, 0.7)?
            .to_scalar()?;
    assert_abs_diff_eq!(
        full,
        1.5 * mi + 2.0 * tc + 0.3 * kl_block + 0.7 * kl,
        epsilon = 1e-10
    );
    Ok(())
}

#[test]
fn rate_loss_with_all_zero_mask_is_nan() -> Result<()> {
    let z = randn(&[2, 5, 1], 1.0)?;
    let ln_var = z.zeros_like()?;
    let dist = LatentDist::new(&z, &ln_var)?;
    let cov = Tensor::eye(2, DType::F64, &Device::Cpu)?;
    let hmask = Tensor::zeros((2, 5), DType::F64, &Device::Cpu)?;

    let loss: f64 = vdca_rate_loss(&dist, &z, &hmask, 1, &cov)?.to_scalar()?;
    assert!(loss.is_nan());
    Ok(())
}

#[test]
fn rate_loss_full_mask_matches_window_kl() -> Result<()> {
    let (nb, nt, nd, half) = (2, 6, 2, 1);
    let k = 2 * half * nd;
    let z = randn(&[nb, nt, nd], 1.0)?;
    let mean = randn(&[nb, nt, nd], 1.0)?;
    let ln_var = randn(&[nb, nt, nd], 0.2)?;
    let dist = LatentDist::new(&mean, &ln_var)?;

    let eye = Tensor::eye(k, DType::F64, &Device::Cpu)?;
    let mu = Tensor::zeros(k, DType::F64, &Device::Cpu)?;
    let hmask = Tensor::ones((nb, nt), DType::F64, &Device::Cpu)?;

    let rate: f64 = vdca_rate_loss(&dist, &z, &hmask, half, &eye)?.to_scalar()?;
    let kl: f64 = vdca_loss_terms(&dist, &z, &mu, &eye, &eye, half, 100)?
        .kl
        .to_scalar()?;
    assert_abs_diff_eq!(rate, kl, epsilon = 1e-10);
    Ok(())
}

#[test]
fn rate_loss_weights_windows_by_mask() -> Result<()> {
    // L = 5, T = 1: window weights [1, 1, 0.5] from mask [1, 1, 1, 0, 0]
    let z = randn(&[1, 5, 1], 1.0)?;
    let mean = randn(&[1, 5, 1], 1.0)?;
    let ln_var = randn(&[1, 5, 1], 0.2)?;
    let dist = LatentDist::new(&mean, &ln_var)?;
    let cov = Tensor::new(&[[1.0f64, 0.3], [0.3, 1.0]], &Device::Cpu)?;
    let hmask = Tensor::new(&[[1.0f64, 1.0, 1.0, 0.0, 0.0]], &Device::Cpu)?;

    let windows = LatentWindows::new(&z, &dist, 1)?;
    let prior = WindowedGaussianPrior::from_cov(&cov)?;
    let rate: Vec<f64> = (windows.log_q_zcx()? - prior.log_prob(&windows.z)?)?
        .squeeze(0)?
        .to_vec1()?;
    let expected = (rate[0] + rate[1] + 0.5 * rate[2]) / 2.5;

    let loss: f64 = vdca_rate_loss(&dist, &z, &hmask, 1, &cov)?.to_scalar()?;
    assert_abs_diff_eq!(loss, expected, epsilon = 1e-10);
    Ok(())
}

#[test]
fn gradients_reach_posterior_parameters() -> Result<()> {
    let dev = Device::Cpu;
    let (nb, nt, nd, half) = (4, 6, 2, 1);
    let k = 2 * half * nd;

    let mean = Var::from_tensor(&Tensor::randn(0f32, 1f32, (nb, nt, nd), &dev)?)?;
    let ln_var = Var::from_tensor(&Tensor::randn(-1f32, 0.1f32, (nb, nt, nd), &dev)?)?;

    let epsilon = Tensor::randn(0f32, 1f32, (nb, nt, nd), &dev)?;
    let z = (mean.as_tensor() + epsilon.mul(&(ln_var.as_tensor() * 0.5)?.exp()?)?)?;
    let dist = LatentDist::new(mean.as_tensor(), ln_var.as_tensor())?;

    let cov = Tensor::eye(k, DType::F32, &dev)?;
    let mu = Tensor::zeros(k, DType::F32, &dev)?;
    let hmask = Tensor::ones((nb, nt), DType::F32, &dev)?;

    let z_bd = z.narrow(1, 0, 1)?.squeeze(1)?;
    let mean_bd = mean.as_tensor().narrow(1, 0, 1)?.squeeze(1)?;
    let ln_var_bd = ln_var.as_tensor().narrow(1, 0, 1)?.squeeze(1)?;
    let dist_bd = LatentDist::new(&mean_bd, &ln_var_bd)?;

    let loss = btcvae_loss(&dist_bd, &z_bd, 100, true, 1.0, 6.0)?;
    let loss = (loss + vdca_rate_loss(&dist, &z, &hmask, half, &cov)?)?;
    let loss = (loss
        + vdca_loss_junwen(&dist, &z, &mu, &cov, &cov, half, 100, 1.0, 6.0, 1.0, 1.0)?)?;

    let grads = loss.backward()?;
    for var in [&mean, &ln_var] {
        let grad = grads.get(var.as_tensor()).expect("missing gradient");
        let norm: f32 = grad.sqr()?.sum_all()?.sqrt()?.to_scalar()?;
        assert!(norm.is_finite());
        assert!(norm > 0.0);
    }
    Ok(())
}
