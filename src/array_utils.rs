// Array utilities for row-major [x, y, z] grids

#[inline(always)]
pub fn index_to_subscript3(index: usize, size: &[usize; 3]) -> [usize; 3] {
    let yz_stride = size[1] * size[2];
    let ix = index / yz_stride;
    let rem = index % yz_stride;
    let iy = rem / size[2];
    let iz = rem % size[2];
    [ix, iy, iz]
}

/// median of a buffer, reordering it in place. Returns 0 for an empty buffer.
pub fn median_in_place(values: &mut [f32]) -> f32 {
    if values.is_empty() {
        return 0.;
    }
    let n = values.len();
    let mid = n / 2;
    let (lower, upper, _) = values.select_nth_unstable_by(mid, |a, b| a.total_cmp(b));
    if n % 2 == 1 {
        *upper
    } else {
        let below = lower.iter().copied().fold(f32::NEG_INFINITY, f32::max);
        0.5 * (below + *upper)
    }
}

#[cfg(test)]
mod tests {
    use crate::array_utils::{index_to_subscript3, median_in_place};
    use ndarray::Array3;

    #[test]
    fn subscripts_round_trip() {
        let size = [4, 3, 5];
        // same order as a standard layout array
        let grid = Array3::<u8>::zeros(size);
        for (idx, ((x, y, z), _)) in grid.indexed_iter().enumerate() {
            assert_eq!(index_to_subscript3(idx, &size), [x, y, z]);
        }
        assert_eq!(index_to_subscript3(1, &size), [0, 0, 1]);
    }

    #[test]
    fn median_odd_and_even() {
        let mut odd = [5., 1., 3.];
        assert_eq!(median_in_place(&mut odd), 3.);
        let mut even = [4., 1., 3., 2.];
        assert_eq!(median_in_place(&mut even), 2.5);
        assert_eq!(median_in_place(&mut []), 0.);
    }
}
