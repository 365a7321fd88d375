use crate::array_utils::median_in_place;
use crate::block::{add_window, read_window, WindowGrid};
use crate::dictionary::{learn_dictionary, normalize_columns};
use crate::error::{DenoiseError, Result};
use crate::sparse_coding::ReweightedCoder;
use crate::DenoiseParams;
use ndarray::{Array2, Array3, Array4, ArrayView4, ShapeBuilder, Zip};
use rayon::prelude::*;
use std::time::Instant;
use tracing::{debug, warn};

/// Number of windows coded in parallel before their results are added to the block.
const WINDOW_BATCH_SIZE: usize = 4096;

/// Denoises spatio-angular blocks: full spatial extent, a handful of channels. Dictionary atoms
/// and codes live on windows of `spatial_block`^3 voxels across all channels of the block.
pub struct BlockDenoiser<'a> {
    mask: &'a Array3<bool>,
    variance: &'a Array3<f32>,
    params: &'a DenoiseParams,
    window: [usize; 3],
}

struct DenoisedWindow {
    corner: [usize; 3],
    values: Vec<f64>,
    weight: f64,
}

impl<'a> BlockDenoiser<'a> {
    pub fn new(mask: &'a Array3<bool>, variance: &'a Array3<f32>, params: &'a DenoiseParams) -> Self {
        let s = params.spatial_block;
        Self { mask, variance, params, window: [s, s, s] }
    }

    /// returns a denoised copy of `block`. Voxels outside the mask are copied from the input.
    /// `channels` labels the block in logs and errors.
    pub fn denoise(&self, block: ArrayView4<f32>, channels: &[usize]) -> Result<Array4<f32>> {
        let (nx, ny, nz, nc) = block.dim();
        if self.mask.dim() != (nx, ny, nz) {
            return Err(DenoiseError::ShapeMismatch {
                what: "mask",
                expected: vec![nx, ny, nz],
                actual: self.mask.shape().to_vec(),
            });
        }
        if self.variance.dim() != (nx, ny, nz) {
            return Err(DenoiseError::ShapeMismatch {
                what: "noise variance",
                expected: vec![nx, ny, nz],
                actual: self.variance.shape().to_vec(),
            });
        }
        let vol_size = [nx, ny, nz];
        let dim = self.window.iter().product::<usize>() * nc;

        let now = Instant::now();
        let training = self.training_set(&block, vol_size, channels)?;
        if training.ncols() == 0 {
            warn!("no masked training windows for block {:?}, passing it through", channels);
            return Ok(block.to_owned());
        }
        let dictionary = learn_dictionary(&training, &self.params.dictionary_params(dim), channels)?;
        debug!("block {:?}: dictionary learned from {} windows in {} ms", channels, training.ncols(), now.elapsed().as_millis());

        let coder = ReweightedCoder::new(&dictionary, self.params.coding_params());
        let grid = WindowGrid::new(vol_size, self.window, self.params.overlap)?;
        let windows: Vec<usize> = (0..grid.n_windows()).filter(|&w| self.mask[grid.center(w)]).collect();

        let mut sum = Array4::<f64>::zeros((nx, ny, nz, nc));
        let mut weights = Array3::<f64>::zeros((nx, ny, nz));
        for batch in windows.chunks(WINDOW_BATCH_SIZE) {
            let denoised = batch.par_iter()
                .map(|&w| self.denoise_window(&coder, &block, grid.corner(w), channels))
                .collect::<Result<Vec<DenoisedWindow>>>()?;
            for d in denoised {
                add_window(&mut sum, &mut weights, &d.corner, &self.window, &d.values, d.weight);
            }
        }

        let mut out = block.to_owned();
        Zip::indexed(&mut out).par_for_each(|(x, y, z, c), v| {
            let w = weights[[x, y, z]];
            if self.mask[[x, y, z]] && w > 0. {
                *v = (sum[[x, y, z, c]] / w) as f32;
            }
        });
        debug!("block {:?}: coded {} windows in {} ms", channels, windows.len(), now.elapsed().as_millis());
        Ok(out)
    }

    /// non-overlapping windows centered in the mask, all-zero windows dropped, scaled to unit norm
    fn training_set(&self, block: &ArrayView4<f32>, vol_size: [usize; 3], channels: &[usize]) -> Result<Array2<f64>> {
        let dim = self.window.iter().product::<usize>() * block.dim().3;
        let grid = WindowGrid::new(vol_size, self.window, 0)?;
        let mut patch = vec![0.; dim];
        let mut columns = Vec::<f64>::new();
        for w in 0..grid.n_windows() {
            if !self.mask[grid.center(w)] {
                continue;
            }
            read_window(block, &grid.corner(w), &self.window, &mut patch);
            if !patch.iter().all(|v| v.is_finite()) {
                return Err(DenoiseError::NonFinite { stage: "building the training set", block: channels.to_vec() });
            }
            if patch.iter().all(|&v| v == 0.) {
                continue;
            }
            columns.extend_from_slice(&patch);
        }
        let n = columns.len() / dim;
        let mut training = Array2::from_shape_vec((dim, n).f(), columns)
            .map_err(|e| DenoiseError::InvalidParameter(e.to_string()))?;
        normalize_columns(&mut training);
        Ok(training)
    }

    /// median noise variance over the voxels a window reads, NaN if any of them is not finite
    fn window_sigma(&self, corner: [usize; 3]) -> f64 {
        let (nx, ny, nz) = self.variance.dim();
        let mut values = Vec::with_capacity(self.window.iter().product());
        for i in 0..self.window[0] {
            for j in 0..self.window[1] {
                for k in 0..self.window[2] {
                    let x = (corner[0] + i).min(nx - 1);
                    let y = (corner[1] + j).min(ny - 1);
                    let z = (corner[2] + k).min(nz - 1);
                    values.push(self.variance[[x, y, z]]);
                }
            }
        }
        if !values.iter().all(|v| v.is_finite()) {
            return f64::NAN;
        }
        (median_in_place(&mut values).max(0.) as f64).sqrt()
    }

    fn denoise_window(&self, coder: &ReweightedCoder, block: &ArrayView4<f32>, corner: [usize; 3], channels: &[usize]) -> Result<DenoisedWindow> {
        let mut values = vec![0.; self.window.iter().product::<usize>() * block.dim().3];
        read_window(block, &corner, &self.window, &mut values);

        let sigma = self.window_sigma(corner);
        if !sigma.is_finite() || !values.iter().all(|v| v.is_finite()) {
            return Err(DenoiseError::NonFinite { stage: "sparse coding", block: channels.to_vec() });
        }
        if sigma == 0. {
            return Ok(DenoisedWindow { corner, values, weight: 1. });
        }

        let code = coder.code(&values, sigma, self.params.iterations);
        let values = coder.reconstruct(&code);
        if !values.iter().all(|v| v.is_finite()) {
            return Err(DenoiseError::NonFinite { stage: "sparse coding", block: channels.to_vec() });
        }
        Ok(DenoisedWindow { corner, values, weight: 1. / (code.nnz() + 1) as f64 })
    }
}

#[cfg(test)]
mod tests {
    use crate::denoiser::BlockDenoiser;
    use crate::error::DenoiseError;
    use crate::DenoiseParams;
    use approx::assert_abs_diff_eq;
    use ndarray::{Array3, Array4};
    use rand::rngs::StdRng;
    use rand::SeedableRng;
    use rand_distr::{Distribution, Normal};

    fn params() -> DenoiseParams {
        DenoiseParams {
            dictionary_iterations: 20,
            dictionary_batch_size: 64,
            iterations: 5,
            ..DenoiseParams::default()
        }
    }

    fn clean_block() -> Array4<f32> {
        Array4::from_shape_fn((9, 9, 8, 4), |(x, y, z, c)| {
            100. + 15. * c as f32 + 0.5 * (x + y + z) as f32
        })
    }

    #[test]
    fn constant_noiseless_block_is_unchanged() {
        let block = Array4::from_elem((5, 5, 5, 3), 42f32);
        let mask = Array3::from_elem((5, 5, 5), true);
        let variance = Array3::zeros((5, 5, 5));
        let params = params();
        for n_iter in [1, 10] {
            let params = DenoiseParams { iterations: n_iter, ..params.clone() };
            let out = BlockDenoiser::new(&mask, &variance, &params).denoise(block.view(), &[0, 1, 2]).unwrap();
            for (a, b) in out.iter().zip(block.iter()) {
                assert_abs_diff_eq!(a, b, epsilon = 1e-4);
            }
        }
    }

    #[test]
    fn noise_is_reduced() {
        let clean = clean_block();
        let mut rng = StdRng::seed_from_u64(11);
        let normal = Normal::new(0f32, 5.).unwrap();
        let noisy = clean.mapv(|v| v + normal.sample(&mut rng));
        let mask = Array3::from_elem((9, 9, 8), true);
        let variance = Array3::from_elem((9, 9, 8), 25f32);
        let params = params();

        let out = BlockDenoiser::new(&mask, &variance, &params).denoise(noisy.view(), &[0, 1, 2, 3]).unwrap();
        let rmse = |a: &Array4<f32>| (a.iter().zip(clean.iter()).map(|(u, v)| (u - v).powi(2)).sum::<f32>() / a.len() as f32).sqrt();
        let before = rmse(&noisy);
        let after = rmse(&out);
        assert!(after < before, "rmse went from {} to {}", before, after);
        assert!(out.iter().all(|v| v.is_finite()));
    }

    #[test]
    fn voxels_outside_the_mask_pass_through() {
        let clean = clean_block();
        let mut rng = StdRng::seed_from_u64(5);
        let normal = Normal::new(0f32, 5.).unwrap();
        let noisy = clean.mapv(|v| v + normal.sample(&mut rng));
        let mask = Array3::from_shape_fn((9, 9, 8), |(x, _, _)| x < 3);
        let variance = Array3::from_elem((9, 9, 8), 25f32);
        let params = params();

        let out = BlockDenoiser::new(&mask, &variance, &params).denoise(noisy.view(), &[0, 1, 2, 3]).unwrap();
        for ((x, y, z, c), &v) in out.indexed_iter() {
            if !mask[[x, y, z]] {
                assert_eq!(v, noisy[[x, y, z, c]]);
            }
        }
    }

    #[test]
    fn empty_mask_passes_block_through() {
        let block = clean_block();
        let mask = Array3::from_elem((9, 9, 8), false);
        let variance = Array3::from_elem((9, 9, 8), 25f32);
        let params = params();
        let out = BlockDenoiser::new(&mask, &variance, &params).denoise(block.view(), &[0]).unwrap();
        assert_eq!(out, block);
    }

    #[test]
    fn mask_shape_is_checked() {
        let block = clean_block();
        let mask = Array3::from_elem((9, 9, 7), true);
        let variance = Array3::from_elem((9, 9, 8), 25f32);
        let params = params();
        assert!(BlockDenoiser::new(&mask, &variance, &params).denoise(block.view(), &[0]).is_err());
    }

    #[test]
    fn non_finite_input_is_rejected() {
        let mask = Array3::from_elem((9, 9, 8), true);
        let variance = Array3::from_elem((9, 9, 8), 25f32);
        let params = params();
        for bad in [f32::NAN, f32::INFINITY, f32::NEG_INFINITY] {
            let mut block = clean_block();
            block[[4, 4, 4, 2]] = bad;
            let result = BlockDenoiser::new(&mask, &variance, &params).denoise(block.view(), &[0, 1, 2, 3]);
            assert!(matches!(result, Err(DenoiseError::NonFinite { .. })), "{} was accepted", bad);
        }
    }

    #[test]
    fn non_finite_voxel_outside_training_windows_is_rejected() {
        // only windows centered at x < 3 are masked, the bad voxel is read by coding windows alone
        let mask = Array3::from_shape_fn((9, 9, 8), |(x, _, _)| x < 3);
        let variance = Array3::from_elem((9, 9, 8), 25f32);
        let params = params();
        let mut block = clean_block();
        block[[3, 0, 0, 1]] = f32::NAN;
        let result = BlockDenoiser::new(&mask, &variance, &params).denoise(block.view(), &[0, 1, 2, 3]);
        assert!(matches!(result, Err(DenoiseError::NonFinite { stage: "sparse coding", .. })));
    }

    #[test]
    fn non_finite_noise_is_rejected() {
        let mask = Array3::from_elem((9, 9, 8), true);
        let params = params();
        let mut one_nan = Array3::from_elem((9, 9, 8), 25f32);
        one_nan[[6, 2, 5]] = f32::NAN;
        for variance in [Array3::from_elem((9, 9, 8), f32::INFINITY), one_nan] {
            let result = BlockDenoiser::new(&mask, &variance, &params).denoise(clean_block().view(), &[0, 1, 2, 3]);
            assert!(matches!(result, Err(DenoiseError::NonFinite { stage: "sparse coding", .. })));
        }
    }
}
