use ndarray::{Array2, ArrayView1};

/// Smallest stabilizer allowed in the reweighting step.
const MIN_STABILIZER: f64 = 1e-12;

/// Coordinate descent stops once no coefficient moves more than this, relative to the largest
/// coefficient.
const SWEEP_TOLERANCE: f64 = 1e-9;

/// solves min_a 0.5 ||x - D a||^2 + lambda * sum_j w_j |a_j| by cyclic coordinate descent, given
/// the Gram matrix G = D^T D and the correlations D^T x. `alpha` is used as the starting point
/// and holds the solution on return; `residual` is scratch space holding D^T x - G a.
/// Returns the number of sweeps performed.
pub fn weighted_lasso(
    gram: &Array2<f64>,
    dtx: &[f64],
    weights: &[f64],
    lambda: f64,
    positive: bool,
    max_sweeps: usize,
    alpha: &mut [f64],
    residual: &mut [f64],
) -> usize {
    let n_atoms = dtx.len();
    assert_eq!(gram.dim(), (n_atoms, n_atoms), "gram matrix does not match the number of atoms");
    assert!(weights.len() == n_atoms && alpha.len() == n_atoms && residual.len() == n_atoms);

    residual.copy_from_slice(dtx);
    for (j, &a) in alpha.iter().enumerate() {
        if a != 0. {
            residual.iter_mut().zip(gram.row(j)).for_each(|(r, &g)| *r -= g * a);
        }
    }

    let mut sweeps = 0;
    while sweeps < max_sweeps {
        sweeps += 1;
        let mut max_delta = 0f64;
        let mut max_coef = 0f64;
        for j in 0..n_atoms {
            let g_jj = gram[[j, j]];
            if g_jj <= 0. {
                continue;
            }
            let z = residual[j] + g_jj * alpha[j];
            let threshold = lambda * weights[j];
            let updated = if positive {
                (z - threshold).max(0.) / g_jj
            } else {
                z.signum() * (z.abs() - threshold).max(0.) / g_jj
            };
            let delta = updated - alpha[j];
            if delta != 0. {
                // gram is symmetric, so row j is column j
                residual.iter_mut().zip(gram.row(j)).for_each(|(r, &g)| *r -= g * delta);
                alpha[j] = updated;
                max_delta = max_delta.max(delta.abs());
            }
            max_coef = max_coef.max(updated.abs());
        }
        if max_delta <= SWEEP_TOLERANCE * max_coef.max(1.) {
            break;
        }
    }
    sweeps
}

#[derive(Debug, Clone)]
pub struct CodingParams {
    pub positive: bool,
    /// multiplies the noise level to give the L1 penalty
    pub penalty_scale: f64,
    /// exponent on the coefficient magnitude in the reweighting
    pub tau: f64,
    /// multiplies the noise level to give the reweighting stabilizer
    pub stabilizer: f64,
    pub tolerance: f64,
    pub max_sweeps: usize,
}

#[derive(Debug, Clone)]
pub struct SparseCode {
    pub coefficients: Vec<f64>,
    /// number of reweighted solves that were run
    pub iterations: usize,
}

impl SparseCode {
    pub fn nnz(&self) -> usize {
        self.coefficients.iter().filter(|&&a| a != 0.).count()
    }
}

/// Iteratively reweighted L1 coding against a fixed dictionary. Each solve penalizes coefficient
/// j by lambda * w_j; after a solve the weights become eps / (|a_j|^tau + eps), so coefficients
/// that were found large are released on the next pass and small ones keep the full penalty.
/// Both lambda and eps scale with the noise level of the vector being coded.
pub struct ReweightedCoder<'a> {
    dictionary: &'a Array2<f64>,
    gram: Array2<f64>,
    params: CodingParams,
    /// expected largest correlation of unit-variance white noise with any atom
    noise_gain: f64,
}

impl<'a> ReweightedCoder<'a> {
    pub fn new(dictionary: &'a Array2<f64>, params: CodingParams) -> Self {
        let gram = dictionary.t().dot(dictionary);
        let n_atoms = dictionary.ncols().max(2) as f64;
        Self {
            dictionary,
            gram,
            params,
            noise_gain: (2. * n_atoms.ln()).sqrt(),
        }
    }

    pub fn n_atoms(&self) -> usize {
        self.dictionary.ncols()
    }

    /// L1 penalty for a vector with noise standard deviation `sigma`
    pub fn penalty(&self, sigma: f64) -> f64 {
        self.params.penalty_scale * sigma * self.noise_gain
    }

    pub fn code(&self, x: &[f64], sigma: f64, n_iter: usize) -> SparseCode {
        let n_atoms = self.n_atoms();
        let dtx = self.dictionary.t().dot(&ArrayView1::from(x)).to_vec();
        let lambda = self.penalty(sigma);
        let eps = (self.params.stabilizer * sigma).max(MIN_STABILIZER);

        let mut weights = vec![1.; n_atoms];
        let mut alpha = vec![0.; n_atoms];
        let mut previous: Option<Vec<f64>> = None;
        let mut residual = vec![0.; n_atoms];
        let mut iterations = 0;

        for _ in 0..n_iter.max(1) {
            weighted_lasso(&self.gram, &dtx, &weights, lambda, self.params.positive, self.params.max_sweeps, &mut alpha, &mut residual);
            iterations += 1;

            if let Some(prev) = &previous {
                let change = prev.iter().zip(&alpha).map(|(p, a)| (p - a).abs()).fold(0., f64::max);
                if change < self.params.tolerance {
                    break;
                }
            }

            weights.iter_mut().zip(&alpha).for_each(|(w, &a)| {
                *w = eps / (a.abs().powf(self.params.tau) + eps);
            });
            previous = Some(alpha.clone());
        }

        SparseCode { coefficients: alpha, iterations }
    }

    /// D a, touching only the atoms in use
    pub fn reconstruct(&self, code: &SparseCode) -> Vec<f64> {
        let mut x = vec![0.; self.dictionary.nrows()];
        for (j, &a) in code.coefficients.iter().enumerate() {
            if a != 0. {
                x.iter_mut().zip(self.dictionary.column(j)).for_each(|(x, &d)| *x += a * d);
            }
        }
        x
    }
}
