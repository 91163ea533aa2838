use candle_core::{bail, DType, Device, Result, Tensor};

/// Elementwise log-density of a diagonal Gaussian
///
/// log N(x; μ, σ²) = -0.5 * [ln(2π) + ln σ² + (x - μ)² / σ²]
///
/// No reduction is applied; the arguments are broadcast against each
/// other, so identical shapes give an output of that same shape.
///
/// * `x` - points to evaluate
/// * `mu` - Gaussian mean
/// * `ln_var` - Gaussian log-variance
///
pub fn log_density_gaussian(x: &Tensor, mu: &Tensor, ln_var: &Tensor) -> Result<Tensor> {
    let ln_2pi = (2.0 * std::f64::consts::PI).ln();

    // (x - μ)² * exp(-ln σ²)
    let inv_var = ln_var.neg()?.exp()?;
    let sq_dist = x.broadcast_sub(mu)?.sqr()?.broadcast_mul(&inv_var)?;

    (sq_dist.broadcast_add(ln_var)? + ln_2pi)? * (-0.5)
}

/// All-pairs log-density: every point under every posterior
///
/// The pairing axis is the second-to-last axis of `x` (examples for a
/// `(B, D)` batch, windows for a `(B, W, K)` batch). The output gains
/// one axis right after it:
///
/// * `(B, D)` → `(B, B, D)` where `out[i, j, :]` is point i under posterior j
/// * `(B, W, K)` → `(B, W, W, K)` where `out[b, i, j, :]` is window i under window j
///
/// The point index always comes first; the posterior index is the axis
/// `log_sum_exp` reduces over downstream.
///
/// * `x` - points, rank ≥ 2
/// * `mu` - posterior means, same shape as `x`
/// * `ln_var` - posterior log-variances, same shape as `x`
///
pub fn matrix_log_density_gaussian(x: &Tensor, mu: &Tensor, ln_var: &Tensor) -> Result<Tensor> {
    if x.rank() < 2 {
        bail!(
            "all-pairs log-density needs a pairing axis, got shape {:?}",
            x.dims()
        );
    }
    let pair = x.rank() - 2;

    let x_i = x.unsqueeze(pair + 1)?;
    let mu_j = mu.unsqueeze(pair)?;
    let ln_var_j = ln_var.unsqueeze(pair)?;

    log_density_gaussian(&x_i, &mu_j, &ln_var_j)
}

/// Log importance weights for minibatch stratified sampling
///
/// With M = B - 1 and N the dataset size, row i of the weight matrix
/// holds
///
/// * 1/N on the diagonal (the example's own posterior)
/// * (N - M) / (N M) at column (i + 1) mod B (the stratified neighbour)
/// * 1/M elsewhere
///
/// so every row sums to one. Returned in log space, shape (B, B).
///
/// * `batch_size` - B, at least 2
/// * `n_data` - N, total number of training examples
///
pub fn log_importance_weight_matrix(
    batch_size: usize,
    n_data: usize,
    dtype: DType,
    device: &Device,
) -> Result<Tensor> {
    if batch_size < 2 {
        bail!(
            "stratified sampling needs at least two examples per batch, got {}",
            batch_size
        );
    }

    let nn = n_data as f64;
    let mm = (batch_size - 1) as f64;
    let strat_weight = (nn - mm) / (nn * mm);

    let mut w_bb = vec![1.0 / mm; batch_size * batch_size];
    for i in 0..batch_size {
        w_bb[i * batch_size + i] = 1.0 / nn;
        w_bb[i * batch_size + (i + 1) % batch_size] = strat_weight;
    }

    let log_w_bb: Vec<f64> = w_bb.iter().map(|w| w.ln()).collect();

    Tensor::from_vec(log_w_bb, (batch_size, batch_size), device)?.to_dtype(dtype)
}
