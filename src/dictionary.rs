// Online dictionary learning
// Atoms are fitted with the mini-batch scheme of Mairal et al. (2010): sparse-code a batch
// against the current dictionary, fold the codes into the running statistics A = sum a a^T and
// B = sum x a^T, then refresh each atom by one pass of block coordinate descent on A and B.

use crate::error::{DenoiseError, Result};
use crate::sparse_coding::weighted_lasso;
use ndarray::{Array1, Array2, Axis, Zip};
use rand::rngs::StdRng;
use rand::seq::index::sample;
use rand::{Rng, SeedableRng};
use rayon::prelude::*;
use tracing::debug;

/// Atom update is skipped when its accumulated code energy is below this.
const MIN_ATOM_ENERGY: f64 = 1e-12;

/// Relative size of the jitter added to initial atoms drawn from the training set.
const INIT_JITTER: f64 = 1e-2;

#[derive(Debug, Clone)]
pub struct DictionaryParams {
    pub n_atoms: usize,
    pub lambda: f64,
    pub iterations: usize,
    pub batch_size: usize,
    pub positive: bool,
    pub max_sweeps: usize,
    pub seed: u64,
}

/// Scales every column to unit L2 norm. Columns with no energy are left as they are.
pub fn normalize_columns(matrix: &mut Array2<f64>) {
    matrix.axis_iter_mut(Axis(1)).for_each(|mut col| {
        let norm = col.dot(&col).sqrt();
        if norm > 0. {
            col.mapv_inplace(|v| v / norm);
        }
    });
}

fn initial_atom(training: &Array2<f64>, rng: &mut StdRng, positive: bool) -> Array1<f64> {
    let n = training.ncols();
    let mut atom = training.column(rng.random_range(0..n)).to_owned();
    let scale = atom.iter().fold(0f64, |m, v| m.max(v.abs())).max(1.) * INIT_JITTER;
    atom.mapv_inplace(|v| {
        let jitter = scale * rng.random::<f64>();
        if positive { (v + jitter).max(0.) } else { v + jitter - 0.5 * scale }
    });
    let norm = atom.dot(&atom).sqrt();
    if norm > 0. {
        atom.mapv_inplace(|v| v / norm);
    }
    atom
}

/// learns a dictionary of `n_atoms` columns from the training vectors stored as the columns of
/// `training` (expected to have unit norm). `block` only labels errors.
pub fn learn_dictionary(training: &Array2<f64>, params: &DictionaryParams, block: &[usize]) -> Result<Array2<f64>> {
    let (dim, n_train) = training.dim();
    if n_train == 0 || params.n_atoms == 0 {
        return Err(DenoiseError::InvalidParameter("dictionary learning needs training vectors and atoms".to_string()));
    }

    let mut rng = StdRng::seed_from_u64(params.seed);
    let mut dictionary = Array2::<f64>::zeros((dim, params.n_atoms));
    for mut atom in dictionary.axis_iter_mut(Axis(1)) {
        atom.assign(&initial_atom(training, &mut rng, params.positive));
    }

    let batch_size = params.batch_size.clamp(1, n_train);
    let mut a_stat = Array2::<f64>::zeros((params.n_atoms, params.n_atoms));
    let mut b_stat = Array2::<f64>::zeros((dim, params.n_atoms));
    let ones = vec![1.; params.n_atoms];

    for t in 0..params.iterations {
        let batch = sample(&mut rng, n_train, batch_size).into_vec();
        let gram = dictionary.t().dot(&dictionary);
        let correlations = dictionary.t().dot(&training.select(Axis(1), &batch));

        let codes: Vec<Vec<f64>> = correlations.axis_iter(Axis(1)).into_par_iter().map(|dtx| {
            let dtx = dtx.to_vec();
            let mut alpha = vec![0.; params.n_atoms];
            let mut residual = vec![0.; params.n_atoms];
            weighted_lasso(&gram, &dtx, &ones, params.lambda, params.positive, params.max_sweeps, &mut alpha, &mut residual);
            alpha
        }).collect();

        // older statistics are down-weighted so that codes from the early, poor dictionaries fade
        let theta = if t < batch_size { (t * batch_size) as f64 } else { (batch_size * batch_size + t - batch_size) as f64 };
        let beta = ((theta + 1. - batch_size as f64) / (theta + 1.)).max(0.);
        a_stat *= beta;
        b_stat *= beta;

        for (alpha, &sample_idx) in codes.iter().zip(&batch) {
            let active: Vec<(usize, f64)> = alpha.iter().copied().enumerate().filter(|(_, a)| *a != 0.).collect();
            for &(i, ai) in &active {
                for &(j, aj) in &active {
                    a_stat[[i, j]] += ai * aj;
                }
                Zip::from(b_stat.column_mut(i)).and(training.column(sample_idx)).for_each(|b, &x| *b += x * ai);
            }
        }

        update_atoms(&mut dictionary, &a_stat, &b_stat, training, &mut rng, params.positive);
    }

    normalize_columns(&mut dictionary);
    if !dictionary.iter().all(|v| v.is_finite()) {
        return Err(DenoiseError::NonFinite { stage: "learning the dictionary", block: block.to_vec() });
    }
    debug!("learned {} atoms of dimension {} from {} training vectors", params.n_atoms, dim, n_train);
    Ok(dictionary)
}

/// one pass of block coordinate descent over the atoms. Atoms that no code has used yet are
/// redrawn from the training set.
fn update_atoms(dictionary: &mut Array2<f64>, a_stat: &Array2<f64>, b_stat: &Array2<f64>, training: &Array2<f64>, rng: &mut StdRng, positive: bool) {
    for j in 0..dictionary.ncols() {
        let a_jj = a_stat[[j, j]];
        if a_jj < MIN_ATOM_ENERGY {
            let atom = initial_atom(training, rng, positive);
            dictionary.column_mut(j).assign(&atom);
            continue;
        }
        let da = dictionary.dot(&a_stat.column(j));
        let mut u = &b_stat.column(j) - &da;
        u /= a_jj;
        u += &dictionary.column(j);
        if positive {
            u.mapv_inplace(|v| v.max(0.));
        }
        let norm = u.dot(&u).sqrt();
        if norm == 0. {
            u = initial_atom(training, rng, positive);
        } else {
            u /= norm.max(1.);
        }
        dictionary.column_mut(j).assign(&u);
    }
}

#[cfg(test)]
mod tests {
    use crate::dictionary::{learn_dictionary, normalize_columns, DictionaryParams};
    use approx::assert_abs_diff_eq;
    use ndarray::{Array2, Axis};

    fn params(n_atoms: usize) -> DictionaryParams {
        DictionaryParams {
            n_atoms,
            lambda: 0.1,
            iterations: 30,
            batch_size: 16,
            positive: true,
            max_sweeps: 100,
            seed: 3,
        }
    }

    #[test]
    fn atoms_have_unit_norm_and_are_non_negative() {
        let mut training = Array2::from_shape_fn((12, 40), |(i, j)| ((i * 7 + j * 3) % 11) as f64 + 1.);
        normalize_columns(&mut training);
        let d = learn_dictionary(&training, &params(24), &[0, 1]).unwrap();
        assert_eq!(d.dim(), (12, 24));
        assert!(d.iter().all(|&v| v >= 0.));
        for col in d.axis_iter(Axis(1)) {
            assert_abs_diff_eq!(col.dot(&col), 1., epsilon = 1e-9);
        }
    }

    #[test]
    fn identical_training_vectors_are_learned() {
        let mut training = Array2::from_shape_fn((8, 5), |(i, _)| (i + 1) as f64);
        normalize_columns(&mut training);
        let d = learn_dictionary(&training, &params(16), &[0]).unwrap();
        // every atom that was used stays close to the only training direction
        let best = d.axis_iter(Axis(1)).map(|a| a.dot(&training.column(0))).fold(0., f64::max);
        assert!(best > 0.99, "best correlation {}", best);
    }

    #[test]
    fn learning_is_seeded() {
        let mut training = Array2::from_shape_fn((6, 30), |(i, j)| ((i + 1) * (j % 4 + 1)) as f64);
        normalize_columns(&mut training);
        let a = learn_dictionary(&training, &params(10), &[0]).unwrap();
        let b = learn_dictionary(&training, &params(10), &[0]).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn empty_training_set_is_rejected() {
        let training = Array2::<f64>::zeros((6, 0));
        assert!(learn_dictionary(&training, &params(4), &[0]).is_err());
    }
}
