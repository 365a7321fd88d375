pub mod angular;
mod array_utils;
pub mod assembler;
pub mod block;
pub mod denoiser;
pub mod dictionary;
pub mod error;
pub mod gradient_table;
pub mod nifti_io;
pub mod scheduler;
pub mod sparse_coding;

use crate::assembler::denoise_volume;
use crate::dictionary::DictionaryParams;
use crate::error::{DenoiseError, Result};
use crate::gradient_table::GradientTable;
use crate::nifti_io::{read_nifti, write_nifti, NiftiImage};
use crate::sparse_coding::CodingParams;
use clap::Parser;
use ndarray::{Array3, ArrayD, Axis, Ix3, Ix4};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Instant;
use tracing::info;

/// Command line of the denoiser.
#[derive(Debug, Parser)]
#[command(about = "Denoise diffusion MRI volumes with spatio-angular sparse dictionaries")]
pub struct DenoiseArgs {
    /// 4-D diffusion volume to denoise (.nii or .nii.gz)
    pub input: PathBuf,
    /// path of the denoised volume
    pub output: PathBuf,
    /// number of diffusion directions denoised together (a direction and its closest neighbors)
    pub block_size: usize,
    /// b-values text file
    pub bvals: PathBuf,
    /// b-vectors text file (3 x N or N x 3)
    pub bvecs: PathBuf,
    /// noise standard deviation volume, 3-D or one volume per channel
    pub sigma: PathBuf,
    /// number of worker threads [default: all cores]
    #[arg(long)]
    pub cores: Option<usize>,
    /// number of reweighting iterations [default: 10]
    #[arg(long)]
    pub iterations: Option<usize>,
    /// only voxels inside this mask are denoised
    #[arg(long)]
    pub mask: Option<PathBuf>,
    /// the directions already cover the whole sphere; do not add antipodes in the neighbor search
    #[arg(long = "no_symmetry")]
    pub no_symmetry: bool,
    /// overwrite the output if it exists
    #[arg(short, long)]
    pub force: bool,
    /// parameter file (toml) written by nlsam-params
    #[arg(long)]
    pub params: Option<PathBuf>,
}

/// Tunable settings of a denoising run. Missing fields in a parameter file take their defaults.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DenoiseParams {
    /// edge length of the cubic spatial window
    pub spatial_block: usize,
    /// overlap between neighboring coding windows; spatial_block - 1 gives a stride of one voxel
    pub overlap: usize,
    /// volumes with a b-value at or below this are baselines
    pub b0_threshold: f32,
    /// replace the baseline with the voxel-wise maximum over all channels before denoising
    pub signal_boost: bool,
    /// only denoise enough blocks to cover every direction once
    pub greedy_subsampler: bool,
    pub no_symmetry: bool,
    /// reweighting iterations of the sparse coding
    pub iterations: usize,
    /// number of atoms relative to the window dimension
    pub dictionary_atoms_factor: f64,
    pub dictionary_iterations: usize,
    pub dictionary_batch_size: usize,
    /// L1 weight while learning is this over sqrt(window dimension)
    pub dictionary_lambda_scale: f64,
    pub positive_codes: bool,
    pub noise_penalty_scale: f64,
    pub reweight_tau: f64,
    pub reweight_stabilizer: f64,
    pub convergence_tolerance: f64,
    pub max_coordinate_sweeps: usize,
    pub seed: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cores: Option<usize>,
}

impl Default for DenoiseParams {
    fn default() -> Self {
        Self {
            spatial_block: 3,
            overlap: 2,
            b0_threshold: 10.,
            signal_boost: true,
            greedy_subsampler: true,
            no_symmetry: false,
            iterations: 10,
            dictionary_atoms_factor: 2.,
            dictionary_iterations: 150,
            dictionary_batch_size: 500,
            dictionary_lambda_scale: 1.2,
            positive_codes: true,
            noise_penalty_scale: 1.,
            reweight_tau: 1.,
            reweight_stabilizer: 1.,
            convergence_tolerance: 1e-5,
            max_coordinate_sweeps: 100,
            seed: 1234,
            cores: None,
        }
    }
}

impl DenoiseParams {
    pub fn from_file(toml_file: impl AsRef<Path>) -> Result<Self> {
        let toml_str = fs::read_to_string(toml_file)?;
        Ok(toml::from_str(&toml_str)?)
    }

    pub fn validate(&self) -> Result<()> {
        let invalid = |msg: &str| Err(DenoiseError::InvalidParameter(msg.to_string()));
        if self.spatial_block == 0 {
            return invalid("spatial_block must be at least 1");
        }
        if self.overlap >= self.spatial_block {
            return invalid("overlap must be smaller than spatial_block");
        }
        if self.iterations == 0 || self.dictionary_batch_size == 0 || self.max_coordinate_sweeps == 0 {
            return invalid("iteration counts and batch sizes must be at least 1");
        }
        if !(self.dictionary_atoms_factor > 0.) {
            return invalid("dictionary_atoms_factor must be positive");
        }
        let non_negative = [
            self.dictionary_lambda_scale,
            self.noise_penalty_scale,
            self.reweight_stabilizer,
            self.convergence_tolerance,
        ];
        if non_negative.iter().any(|v| !(*v >= 0.) || !v.is_finite()) || !(self.reweight_tau > 0.) {
            return invalid("penalty, reweighting and tolerance settings must be finite and non-negative");
        }
        if !self.b0_threshold.is_finite() {
            return invalid("b0_threshold must be finite");
        }
        if self.cores == Some(0) {
            return invalid("cores must be at least 1");
        }
        Ok(())
    }

    /// block shape [s, s, s, a] for an angular block of `a` directions. The denoised blocks carry
    /// the baseline as an extra channel.
    pub fn block_shape(&self, angular_block: usize) -> [usize; 4] {
        let s = self.spatial_block;
        [s, s, s, angular_block]
    }

    pub fn dictionary_params(&self, dim: usize) -> DictionaryParams {
        DictionaryParams {
            n_atoms: ((self.dictionary_atoms_factor * dim as f64).ceil() as usize).max(1),
            lambda: self.dictionary_lambda_scale / (dim as f64).sqrt(),
            iterations: self.dictionary_iterations,
            batch_size: self.dictionary_batch_size,
            positive: self.positive_codes,
            max_sweeps: self.max_coordinate_sweeps,
            seed: self.seed,
        }
    }

    pub fn coding_params(&self) -> CodingParams {
        CodingParams {
            positive: self.positive_codes,
            penalty_scale: self.noise_penalty_scale,
            tau: self.reweight_tau,
            stabilizer: self.reweight_stabilizer,
            tolerance: self.convergence_tolerance,
            max_sweeps: self.max_coordinate_sweeps,
        }
    }
}

/// accepts a 3-D volume, or a 4-D volume with a single entry along the 4th axis
fn into_volume3(data: ArrayD<f32>, path: &Path) -> Result<Array3<f32>> {
    let single_channel = matches!(data.shape(), [_, _, _, 1]);
    let data = if single_channel { data.index_axis_move(Axis(3), 0) } else { data };
    data.into_dimensionality::<Ix3>()
        .map_err(|_| DenoiseError::InvalidNifti(format!("{} is not a 3-D volume", path.display())))
}

/// loads a mask volume; any nonzero voxel is inside the mask
pub fn load_mask(path: impl AsRef<Path>) -> Result<Array3<bool>> {
    let path = path.as_ref();
    let image = read_nifti(path)?;
    Ok(into_volume3(image.data, path)?.mapv(|v| v != 0.))
}

/// loads a noise standard deviation volume and returns the per-voxel variance. A 4-D sigma must
/// have one volume per data channel; its variances are averaged over channels.
pub fn load_variance(path: impl AsRef<Path>, n_channels: usize) -> Result<Array3<f32>> {
    let path = path.as_ref();
    let sigma = read_nifti(path)?.data;
    let shape = sigma.shape().to_vec();
    if shape.len() == 4 && shape[3] != 1 {
        if shape[3] != n_channels {
            return Err(DenoiseError::ShapeMismatch {
                what: "sigma",
                expected: vec![shape[0], shape[1], shape[2], n_channels],
                actual: shape,
            });
        }
        let variance = sigma.mapv(|s| s * s).mean_axis(Axis(3))
            .ok_or_else(|| DenoiseError::InvalidNifti(format!("{} is empty", path.display())))?;
        return into_volume3(variance, path);
    }
    Ok(into_volume3(sigma, path)?.mapv(|s| s * s))
}

/// runs the denoiser from the command line arguments
pub fn denoise_exec(args: &DenoiseArgs) -> Result<()> {
    if args.output.exists() && !args.force {
        return Err(DenoiseError::OutputExists(args.output.clone()));
    }

    let mut params = match &args.params {
        Some(file) => DenoiseParams::from_file(file)?,
        None => DenoiseParams::default(),
    };
    if let Some(iterations) = args.iterations {
        params.iterations = iterations;
    }
    if args.cores.is_some() {
        params.cores = args.cores;
    }
    params.no_symmetry |= args.no_symmetry;
    params.validate()?;

    info!("loading data ...");
    let now = Instant::now();
    let NiftiImage { header, data } = read_nifti(&args.input)?;
    let data = data.into_dimensionality::<Ix4>()
        .map_err(|_| DenoiseError::InvalidNifti(format!("{} is not a 4-D volume", args.input.display())))?;
    let [nx, ny, nz, nc]: [usize; 4] = data.dim().into();
    info!("loaded volume of size {:?} in {:.03} secs", [nx, ny, nz, nc], now.elapsed().as_secs_f32());

    let table = GradientTable::from_files(&args.bvals, &args.bvecs)?;
    let mask = args.mask.as_ref().map(load_mask).transpose()?;
    let variance = load_variance(&args.sigma, nc)?;

    let block_shape = params.block_shape(args.block_size);
    let denoised = denoise_volume(&data, &table, mask.as_ref(), &variance, &block_shape, &params)?;

    write_nifti(&args.output, &header, &denoised.into_dyn())?;
    info!("wrote denoised volume to {}", args.output.display());
    Ok(())
}
