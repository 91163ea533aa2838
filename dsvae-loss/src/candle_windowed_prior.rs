use candle_core::{bail, DType, Result, Tensor};

use crate::candle_log_density::log_density_gaussian;

/// Prior distribution over latent vectors.
pub trait Prior {
    /// Compute log p(z) under the prior.
    ///
    /// # Arguments
    /// * `z` - Latent samples, shape (..., K)
    ///
    /// # Returns
    /// Log prior probability, shape (...) summed over the last axis
    fn log_prob(&self, z: &Tensor) -> Result<Tensor>;
}

/// Isotropic prior p(z) = N(0, I)
pub struct StandardNormalPrior;

impl Prior for StandardNormalPrior {
    fn log_prob(&self, z: &Tensor) -> Result<Tensor> {
        let zeros = z.zeros_like()?;
        log_density_gaussian(z, &zeros, &zeros)?.sum(z.rank() - 1)
    }
}

/// Correlated prior over a flattened window of 2T latent vectors
///
/// p(z) = N(μ, Σ) with Σ of size (2T·d, 2T·d).
///
/// log p(z) = -0.5 * [K ln(2π) + ln|Σ| + (z - μ)' Σ⁻¹ (z - μ)]
///
/// Σ is a fixed input, so Σ⁻¹ and ln|Σ| are computed once on
/// construction; gradients flow through z (and μ).
pub struct WindowedGaussianPrior {
    /// Prior mean μ: shape (K,)
    mu: Tensor,
    /// Precision Σ⁻¹: shape (K, K)
    precision: Tensor,
    /// ln|Σ|
    log_det: f64,
    dim: usize,
}

impl WindowedGaussianPrior {
    /// Create a prior from a mean, a covariance and optionally its lower
    /// Cholesky factor.
    ///
    /// # Arguments
    /// * `mu` - Prior mean, shape (K,)
    /// * `cov` - Covariance Σ, shape (K, K), symmetric positive definite
    /// * `cov_l` - Lower factor L with Σ = L L'; when given, ln|Σ| = 2 Σ_k ln L_kk
    pub fn new(mu: &Tensor, cov: &Tensor, cov_l: Option<&Tensor>) -> Result<Self> {
        let (dim, dim_col) = cov.dims2()?;
        if dim != dim_col {
            bail!("covariance must be square, got {:?}", cov.dims());
        }
        if mu.elem_count() != dim {
            bail!(
                "prior mean has {} elements, covariance expects {}",
                mu.elem_count(),
                dim
            );
        }

        let cov_data: Vec<f64> = cov.to_dtype(DType::F64)?.flatten_all()?.to_vec1()?;
        let cov_nal = nalgebra::DMatrix::from_row_slice(dim, dim, &cov_data);

        let chol = cov_nal.cholesky().ok_or_else(|| {
            candle_core::Error::Msg("covariance is not positive definite".to_string())
        })?;

        let log_det = match cov_l {
            Some(cov_l) => {
                if cov_l.dims() != cov.dims() {
                    bail!(
                        "Cholesky factor {:?} does not match covariance {:?}",
                        cov_l.dims(),
                        cov.dims()
                    );
                }
                let l_data: Vec<f64> = cov_l.to_dtype(DType::F64)?.flatten_all()?.to_vec1()?;
                let l_diag: Vec<f64> = (0..dim).map(|k| l_data[k * dim + k]).collect();
                if l_diag.iter().any(|&l_kk| l_kk.is_nan() || l_kk <= 0.0) {
                    bail!("Cholesky factor needs a positive diagonal, got {:?}", l_diag);
                }
                2.0 * l_diag.iter().map(|l_kk| l_kk.ln()).sum::<f64>()
            }
            None => 2.0 * chol.l().diagonal().iter().map(|l_kk| l_kk.ln()).sum::<f64>(),
        };

        // column-major inverse, transposed to row-major for candle
        let prec_nal = chol.inverse();
        let prec_data: Vec<f64> = prec_nal.transpose().iter().cloned().collect();
        let precision =
            Tensor::from_vec(prec_data, (dim, dim), cov.device())?.to_dtype(cov.dtype())?;

        Ok(Self {
            mu: mu.flatten_all()?,
            precision,
            log_det,
            dim,
        })
    }

    /// Zero-mean prior from the covariance alone
    pub fn from_cov(cov: &Tensor) -> Result<Self> {
        let (dim, _) = cov.dims2()?;
        let mu = Tensor::zeros(dim, cov.dtype(), cov.device())?;
        Self::new(&mu, cov, None)
    }

    /// Flattened window size K = 2T·d
    pub fn dim(&self) -> usize {
        self.dim
    }

    pub fn log_det(&self) -> f64 {
        self.log_det
    }
}

impl Prior for WindowedGaussianPrior {
    /// # Arguments
    /// * `z` - Flattened windows, shape (..., K)
    ///
    /// # Returns
    /// Log prior probability, shape (...)
    fn log_prob(&self, z: &Tensor) -> Result<Tensor> {
        let dims = z.dims().to_vec();
        let last = match dims.last() {
            Some(&k) if k == self.dim => dims.len() - 1,
            _ => bail!(
                "windows {:?} do not match prior of dimension {}",
                dims,
                self.dim
            ),
        };

        let dtype = z.dtype();
        let ln_2pi = (2.0 * std::f64::consts::PI).ln();

        // (z - μ) as rows: (n, K)
        let n_rows = z.elem_count() / self.dim;
        let centered = z
            .broadcast_sub(&self.mu.to_dtype(dtype)?)?
            .reshape((n_rows, self.dim))?;

        // (z - μ)' Σ⁻¹ (z - μ): (n,)
        let quad = centered
            .matmul(&self.precision.to_dtype(dtype)?)?
            .mul(&centered)?
            .sum(1)?;

        let const_term = self.dim as f64 * ln_2pi + self.log_det;
        let log_prob = ((quad + const_term)? * (-0.5))?;

        log_prob.reshape(&dims[..last])
    }
}
