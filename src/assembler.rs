use crate::angular::{angular_neighbors, neighbor_candidates};
use crate::block::Accumulator;
use crate::denoiser::BlockDenoiser;
use crate::error::{DenoiseError, Result};
use crate::gradient_table::GradientTable;
use crate::scheduler::{schedule_blocks, ScheduledBlock};
use crate::DenoiseParams;
use ndarray::{Array3, Array4, ArrayView4, Axis};
use rayon::prelude::*;
use rayon::ThreadPoolBuilder;
use std::sync::mpsc;
use std::thread;
use std::time::Instant;
use tracing::{debug, info};

/// Where the baseline and diffusion-weighted volumes sit in the acquired channel order. The
/// collapsed volume holds the averaged baseline at channel 0 followed by the diffusion-weighted
/// channels in acquisition order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BaselineLayout {
    baselines: Vec<usize>,
    dwis: Vec<usize>,
}

impl BaselineLayout {
    pub fn from_table(table: &GradientTable, threshold: f32) -> Result<Self> {
        let mask = table.baseline_mask(threshold);
        let baselines: Vec<usize> = mask.iter().enumerate().filter(|(_, &b)| b).map(|(i, _)| i).collect();
        if baselines.is_empty() {
            return Err(DenoiseError::NoBaseline { threshold });
        }
        let dwis = mask.iter().enumerate().filter(|(_, &b)| !b).map(|(i, _)| i).collect();
        Ok(Self { baselines, dwis })
    }

    pub fn baselines(&self) -> &[usize] {
        &self.baselines
    }

    pub fn dwis(&self) -> &[usize] {
        &self.dwis
    }

    pub fn n_channels(&self) -> usize {
        self.baselines.len() + self.dwis.len()
    }

    /// channels of the collapsed volume that a block over diffusion channels `dwi_set` reads:
    /// the baseline first, then the diffusion channels
    pub fn block_channels(dwi_set: &[usize]) -> Vec<usize> {
        std::iter::once(0).chain(dwi_set.iter().map(|&d| d + 1)).collect()
    }
}

/// averages all baselines into channel 0 and appends the diffusion-weighted channels
pub fn collapse_baselines(data: &Array4<f32>, layout: &BaselineLayout) -> Array4<f32> {
    let (nx, ny, nz, _) = data.dim();
    let mut collapsed = Array4::<f32>::zeros((nx, ny, nz, layout.dwis.len() + 1));
    let mean_b0 = data.select(Axis(3), &layout.baselines).mean_axis(Axis(3));
    if let Some(mean_b0) = mean_b0 {
        collapsed.index_axis_mut(Axis(3), 0).assign(&mean_b0);
    }
    for (i, &d) in layout.dwis.iter().enumerate() {
        collapsed.index_axis_mut(Axis(3), i + 1).assign(&data.index_axis(Axis(3), d));
    }
    collapsed
}

/// replaces the baseline (channel 0) with the largest value found across channels at each voxel
pub fn signal_boost(collapsed: &mut Array4<f32>) {
    let max = collapsed.map_axis(Axis(3), |lane| lane.iter().copied().fold(f32::NEG_INFINITY, f32::max));
    collapsed.index_axis_mut(Axis(3), 0).assign(&max);
}

/// puts a copy of the denoised baseline back at every original baseline position
pub fn expand_baselines(collapsed: &Array4<f32>, layout: &BaselineLayout) -> Result<Array4<f32>> {
    let (nx, ny, nz, nc) = collapsed.dim();
    if nc != layout.dwis.len() + 1 {
        return Err(DenoiseError::ShapeMismatch {
            what: "collapsed volume",
            expected: vec![nx, ny, nz, layout.dwis.len() + 1],
            actual: vec![nx, ny, nz, nc],
        });
    }
    let mut expanded = Array4::<f32>::zeros((nx, ny, nz, layout.n_channels()));
    let b0 = collapsed.index_axis(Axis(3), 0);
    for &b in &layout.baselines {
        expanded.index_axis_mut(Axis(3), b).assign(&b0);
    }
    for (i, &d) in layout.dwis.iter().enumerate() {
        expanded.index_axis_mut(Axis(3), d).assign(&collapsed.index_axis(Axis(3), i + 1));
    }
    Ok(expanded)
}

/// checks a block shape [s, s, s, a] against the data shape: same rank, the window fits in the
/// volume and matches the configured spatial block, and at least one diffusion direction is asked
/// for. The baseline is added to every block on top of its `a` directions.
pub fn validate_block_shape(block_shape: &[usize], data_shape: &[usize], spatial_block: usize) -> Result<()> {
    if block_shape.len() != data_shape.len() || block_shape.len() != 4 {
        return Err(DenoiseError::BlockRank { block: block_shape.to_vec(), data: data_shape.to_vec() });
    }
    if block_shape[..3].iter().zip(&data_shape[..3]).any(|(b, d)| b > d) {
        return Err(DenoiseError::ShapeMismatch {
            what: "block",
            expected: data_shape.to_vec(),
            actual: block_shape.to_vec(),
        });
    }
    if block_shape[..3].iter().any(|&b| b != spatial_block) {
        return Err(DenoiseError::InvalidParameter(format!(
            "block shape {:?} does not match the spatial block size {}", block_shape, spatial_block
        )));
    }
    if block_shape[3] == 0 {
        return Err(DenoiseError::InvalidParameter(format!(
            "block shape {:?} needs at least one diffusion direction", block_shape
        )));
    }
    Ok(())
}

/// denoises a 4-D diffusion volume indexed [x, y, z, channel] and returns a volume of the same
/// shape. Every configuration problem is reported before any block is denoised.
pub fn denoise_volume(
    data: &Array4<f32>,
    table: &GradientTable,
    mask: Option<&Array3<bool>>,
    variance: &Array3<f32>,
    block_shape: &[usize],
    params: &DenoiseParams,
) -> Result<Array4<f32>> {
    params.validate()?;
    let (nx, ny, nz, nc) = data.dim();
    if table.n_volumes() != nc {
        return Err(DenoiseError::ShapeMismatch {
            what: "gradient table",
            expected: vec![nc],
            actual: vec![table.n_volumes()],
        });
    }
    if let Some(mask) = mask {
        if mask.dim() != (nx, ny, nz) {
            return Err(DenoiseError::ShapeMismatch {
                what: "mask",
                expected: vec![nx, ny, nz],
                actual: mask.shape().to_vec(),
            });
        }
    }
    if variance.dim() != (nx, ny, nz) {
        return Err(DenoiseError::ShapeMismatch {
            what: "noise variance",
            expected: vec![nx, ny, nz],
            actual: variance.shape().to_vec(),
        });
    }
    validate_block_shape(block_shape, data.shape(), params.spatial_block)?;

    let layout = BaselineLayout::from_table(table, params.b0_threshold)?;
    info!("found {} b0s at position {:?}", layout.baselines.len(), layout.baselines);

    let dwi_bvecs: Vec<[f32; 3]> = layout.dwis.iter().map(|&d| table.bvecs()[d]).collect();
    let candidates = neighbor_candidates(&dwi_bvecs, !params.no_symmetry);
    let angular_block = block_shape[3];
    let neighbors = angular_neighbors(&candidates, dwi_bvecs.len(), angular_block - 1)?;
    let blocks = schedule_blocks(&neighbors, params.greedy_subsampler);
    info!("denoising {} blocks of {} directions out of {} possible", blocks.len(), angular_block, dwi_bvecs.len());

    let mut collapsed = collapse_baselines(data, &layout);
    if params.signal_boost {
        signal_boost(&mut collapsed);
    }
    let full_mask;
    let mask = match mask {
        Some(mask) => mask,
        None => {
            full_mask = Array3::from_elem((nx, ny, nz), true);
            &full_mask
        }
    };

    let pool = ThreadPoolBuilder::new().num_threads(params.cores.unwrap_or(0)).build()?;
    info!("using {} worker threads", pool.current_num_threads());
    let denoiser = BlockDenoiser::new(mask, variance, params);
    let now = Instant::now();
    let denoised = accumulate_blocks(&pool, |block, channels| denoiser.denoise(block, channels), &collapsed, &blocks)?;
    info!("denoised {} blocks in {:.03} secs", blocks.len(), now.elapsed().as_secs_f32());

    expand_baselines(&denoised, &layout)
}

/// runs every scheduled block on the pool and funnels the results to a single accumulating
/// thread through a bounded channel
fn accumulate_blocks<F>(pool: &rayon::ThreadPool, denoise: F, collapsed: &Array4<f32>, blocks: &[ScheduledBlock]) -> Result<Array4<f32>>
where
    F: Fn(ArrayView4<f32>, &[usize]) -> Result<Array4<f32>> + Sync,
{
    let shape: [usize; 4] = collapsed.dim().into();
    let n_blocks = blocks.len();
    let (tx, rx) = mpsc::sync_channel::<(Vec<usize>, Array4<f32>)>(pool.current_num_threads());

    thread::scope(|scope| -> Result<Array4<f32>> {
        let consumer = scope.spawn(move || -> Result<Array4<f32>> {
            let mut accumulator = Accumulator::new(shape);
            for (i, (channels, block)) in rx.into_iter().enumerate() {
                accumulator.add_block(&channels, &block)?;
                debug!("accumulated block {}/{}", i + 1, n_blocks);
            }
            accumulator.finalize()
        });

        let produced = pool.install(|| {
            blocks.par_iter().enumerate().try_for_each_with(tx, |tx, (i, block)| -> Result<()> {
                let now = Instant::now();
                let channels = BaselineLayout::block_channels(&block.channels);
                let input = collapsed.select(Axis(3), &channels);
                let denoised = denoise(input.view(), &block.channels)?;
                info!("block {}/{} {:?} done in {:.03} secs", i + 1, n_blocks, block.channels, now.elapsed().as_secs_f32());
                tx.send((channels, denoised)).map_err(|_| DenoiseError::AccumulatorClosed)
            })
        });

        let accumulated = match consumer.join() {
            Ok(result) => result,
            Err(panic) => std::panic::resume_unwind(panic),
        };
        // a closed channel means the accumulator failed first; a gap means a block failed first
        match (produced, accumulated) {
            (Err(DenoiseError::AccumulatorClosed), Err(e)) => Err(e),
            (Err(e), _) => Err(e),
            (Ok(()), accumulated) => accumulated,
        }
    })
}
