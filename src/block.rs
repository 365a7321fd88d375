use crate::array_utils::index_to_subscript3;
use crate::error::{DenoiseError, Result};
use ndarray::{Array3, Array4, ArrayView4, Axis, Zip};

/// calculates the lower corners of windows along one axis. Windows advance by `stride` and the
/// last window is pulled back so that it ends on the volume boundary, so every voxel is covered.
/// If the axis is shorter than the window, a single window at 0 is returned and reads past the
/// end are edge-padded.
fn window_starts(len: usize, window: usize, stride: usize) -> Vec<usize> {
    if len <= window {
        return vec![0];
    }
    let last = len - window;
    let mut starts: Vec<usize> = (0..=last).step_by(stride).collect();
    if starts.last() != Some(&last) {
        starts.push(last);
    }
    starts
}

/// The set of spatial windows slid over a volume with a given overlap.
#[derive(Debug, Clone)]
pub struct WindowGrid {
    vol_size: [usize; 3],
    window: [usize; 3],
    starts: [Vec<usize>; 3],
}

impl WindowGrid {
    pub fn new(vol_size: [usize; 3], window: [usize; 3], overlap: usize) -> Result<Self> {
        if window.iter().any(|&w| w == 0) {
            return Err(DenoiseError::InvalidParameter(format!("window size {:?} must be non-zero", window)));
        }
        if window.iter().any(|&w| overlap >= w) {
            return Err(DenoiseError::InvalidParameter(format!(
                "overlap {} must be smaller than the window size {:?}", overlap, window
            )));
        }
        let starts = [0, 1, 2].map(|ax| window_starts(vol_size[ax], window[ax], window[ax] - overlap));
        Ok(Self { vol_size, window, starts })
    }

    pub fn grid_size(&self) -> [usize; 3] {
        [self.starts[0].len(), self.starts[1].len(), self.starts[2].len()]
    }

    pub fn n_windows(&self) -> usize {
        self.grid_size().iter().product()
    }

    /// lower corner of a window in volume coordinates
    pub fn corner(&self, window_idx: usize) -> [usize; 3] {
        let sub = index_to_subscript3(window_idx, &self.grid_size());
        [self.starts[0][sub[0]], self.starts[1][sub[1]], self.starts[2][sub[2]]]
    }

    /// voxel at the middle of a window, clamped to the volume
    pub fn center(&self, window_idx: usize) -> [usize; 3] {
        let corner = self.corner(window_idx);
        [0, 1, 2].map(|ax| (corner[ax] + self.window[ax] / 2).min(self.vol_size[ax] - 1))
    }
}

/// reads a window of every channel into a patch vector. The vector is ordered x, y, z, channel
/// with channel fastest. Coordinates past the volume edge repeat the edge voxel.
pub fn read_window(data: &ArrayView4<f32>, corner: &[usize; 3], window: &[usize; 3], patch: &mut [f64]) {
    let (nx, ny, nz, nc) = data.dim();
    assert_eq!(patch.len(), window.iter().product::<usize>() * nc, "unexpected patch vector length");
    let mut idx = 0;
    for i in 0..window[0] {
        let x = (corner[0] + i).min(nx - 1);
        for j in 0..window[1] {
            let y = (corner[1] + j).min(ny - 1);
            for k in 0..window[2] {
                let z = (corner[2] + k).min(nz - 1);
                for c in 0..nc {
                    patch[idx] = data[[x, y, z, c]] as f64;
                    idx += 1;
                }
            }
        }
    }
}

/// adds a weighted patch vector back into the running sum of a block. Voxels that fall outside
/// the volume (edge padding) are dropped.
pub fn add_window(sum: &mut Array4<f64>, weights: &mut Array3<f64>, corner: &[usize; 3], window: &[usize; 3], patch: &[f64], weight: f64) {
    let (nx, ny, nz, nc) = sum.dim();
    assert_eq!(patch.len(), window.iter().product::<usize>() * nc, "unexpected patch vector length");
    let mut idx = 0;
    for i in 0..window[0] {
        let x = corner[0] + i;
        for j in 0..window[1] {
            let y = corner[1] + j;
            for k in 0..window[2] {
                let z = corner[2] + k;
                if x < nx && y < ny && z < nz {
                    for c in 0..nc {
                        sum[[x, y, z, c]] += weight * patch[idx + c];
                    }
                    weights[[x, y, z]] += weight;
                }
                idx += nc;
            }
        }
    }
}

/// Overlap-add of denoised blocks into the full volume. Each block writes a set of channels
/// over the whole spatial extent; the final volume is the per-element average of everything
/// that was written to it.
#[derive(Debug)]
pub struct Accumulator {
    sum: Array4<f32>,
    multiplicity: Array4<u32>,
}

impl Accumulator {
    pub fn new(shape: [usize; 4]) -> Self {
        Self {
            sum: Array4::zeros(shape),
            multiplicity: Array4::zeros(shape),
        }
    }

    /// adds a denoised block. Channel `c` of the block lands on channel `channels[c]` of the volume.
    pub fn add_block(&mut self, channels: &[usize], block: &Array4<f32>) -> Result<()> {
        let (nx, ny, nz, nq) = self.sum.dim();
        let (bx, by, bz, bc) = block.dim();
        if [bx, by, bz, bc] != [nx, ny, nz, channels.len()] {
            return Err(DenoiseError::ShapeMismatch {
                what: "denoised block",
                expected: vec![nx, ny, nz, channels.len()],
                actual: vec![bx, by, bz, bc],
            });
        }
        if let Some(&bad) = channels.iter().find(|&&ch| ch >= nq) {
            return Err(DenoiseError::InvalidParameter(format!("block channel {} out of range for {} channels", bad, nq)));
        }
        for (c, &ch) in channels.iter().enumerate() {
            Zip::from(self.sum.index_axis_mut(Axis(3), ch))
                .and(self.multiplicity.index_axis_mut(Axis(3), ch))
                .and(block.index_axis(Axis(3), c))
                .for_each(|s, m, &v| {
                    *s += v;
                    *m += 1;
                });
        }
        Ok(())
    }

    /// divides the running sums by their multiplicity. Every element must have been written at
    /// least once; a zero multiplicity means the block schedule left a gap.
    pub fn finalize(self) -> Result<Array4<f32>> {
        let Self { mut sum, multiplicity } = self;
        for (channel, counts) in multiplicity.axis_iter(Axis(3)).enumerate() {
            if counts.iter().any(|&m| m == 0) {
                return Err(DenoiseError::Uncovered { channel });
            }
        }
        Zip::from(&mut sum).and(&multiplicity).for_each(|s, &m| *s /= m as f32);
        Ok(sum)
    }
}

#[cfg(test)]
mod tests {
    use crate::block::{add_window, read_window, window_starts, Accumulator, WindowGrid};
    use crate::error::DenoiseError;
    use ndarray::{Array3, Array4};

    #[test]
    fn window_starts_cover_axis() {
        assert_eq!(window_starts(10, 3, 3), vec![0, 3, 6, 7]);
        assert_eq!(window_starts(10, 3, 1), (0..=7).collect::<Vec<_>>());
        assert_eq!(window_starts(9, 3, 3), vec![0, 3, 6]);
        assert_eq!(window_starts(2, 3, 1), vec![0]);
    }

    #[test]
    fn grid_rejects_full_overlap() {
        assert!(WindowGrid::new([8, 8, 8], [3, 3, 3], 3).is_err());
        assert!(WindowGrid::new([8, 8, 8], [3, 3, 3], 2).is_ok());
    }

    #[test]
    fn grid_centers_stay_in_volume() {
        let grid = WindowGrid::new([2, 7, 5], [3, 3, 3], 1).unwrap();
        for w in 0..grid.n_windows() {
            let c = grid.center(w);
            assert!(c[0] < 2 && c[1] < 7 && c[2] < 5, "center {:?} out of bounds", c);
        }
    }

    #[test]
    fn read_then_add_windows_reproduces_volume() {
        // every voxel is covered by some window, so averaging the windows returns the volume
        let vol_size = [5, 4, 6];
        let volume = Array4::from_shape_fn((5, 4, 6, 2), |(i, j, k, c)| (i + 10 * j + 100 * k + 1000 * c) as f32);
        let grid = WindowGrid::new(vol_size, [3, 3, 3], 1).unwrap();
        let mut sum = Array4::<f64>::zeros((5, 4, 6, 2));
        let mut weights = Array3::<f64>::zeros((5, 4, 6));
        let mut patch = vec![0.; 27 * 2];
        for w in 0..grid.n_windows() {
            let corner = grid.corner(w);
            read_window(&volume.view(), &corner, &[3, 3, 3], &mut patch);
            add_window(&mut sum, &mut weights, &corner, &[3, 3, 3], &patch, 0.5);
        }
        assert!(weights.iter().all(|&w| w > 0.));
        for ((i, j, k, c), &v) in volume.indexed_iter() {
            let avg = sum[[i, j, k, c]] / weights[[i, j, k]];
            assert!((avg - v as f64).abs() < 1e-9);
        }
    }

    #[test]
    fn read_window_pads_with_edge() {
        let volume = Array4::from_shape_fn((2, 2, 2, 1), |(i, j, k, _)| (i * 4 + j * 2 + k) as f32);
        let mut patch = vec![0.; 27];
        read_window(&volume.view(), &[0, 0, 0], &[3, 3, 3], &mut patch);
        // the last x plane repeats x = 1
        assert_eq!(patch[2 * 9], volume[[1, 0, 0, 0]] as f64);
        assert_eq!(patch[26], volume[[1, 1, 1, 0]] as f64);
    }

    #[test]
    fn accumulator_averages_double_coverage() {
        let mut acc = Accumulator::new([2, 2, 2, 3]);
        acc.add_block(&[0, 1], &Array4::from_elem((2, 2, 2, 2), 2.0)).unwrap();
        acc.add_block(&[0, 2], &Array4::from_elem((2, 2, 2, 2), 4.0)).unwrap();
        let out = acc.finalize().unwrap();
        assert!(out.index_axis(ndarray::Axis(3), 0).iter().all(|&v| v == 3.0));
        assert!(out.index_axis(ndarray::Axis(3), 1).iter().all(|&v| v == 2.0));
        assert!(out.index_axis(ndarray::Axis(3), 2).iter().all(|&v| v == 4.0));
    }

    #[test]
    fn accumulator_reports_gaps() {
        let mut acc = Accumulator::new([2, 2, 2, 3]);
        acc.add_block(&[0, 2], &Array4::ones((2, 2, 2, 2))).unwrap();
        match acc.finalize() {
            Err(DenoiseError::Uncovered { channel }) => assert_eq!(channel, 1),
            other => panic!("expected an uncovered channel, got {:?}", other),
        }
    }

    #[test]
    fn accumulator_rejects_wrong_block_shape() {
        let mut acc = Accumulator::new([2, 2, 2, 3]);
        assert!(acc.add_block(&[0, 1], &Array4::ones((2, 2, 2, 3))).is_err());
    }
}
