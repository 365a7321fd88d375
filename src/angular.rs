use crate::error::{DenoiseError, Result};
use ndarray::Array2;

/// builds the candidate directions for the neighbor search. When the acquisition only covers
/// one hemisphere, each direction is paired with its antipode (appended after all originals) so
/// that directions close to the opposite pole are still found.
pub fn neighbor_candidates(bvecs: &[[f32; 3]], add_antipodes: bool) -> Vec<[f64; 3]> {
    let originals = bvecs.iter().map(|v| [v[0] as f64, v[1] as f64, v[2] as f64]);
    if add_antipodes {
        let antipodes = bvecs.iter().map(|v| [-v[0] as f64, -v[1] as f64, -v[2] as f64]);
        originals.chain(antipodes).collect()
    } else {
        originals.collect()
    }
}

fn normalized(v: &[f64; 3]) -> [f64; 3] {
    let norm = (v[0] * v[0] + v[1] * v[1] + v[2] * v[2]).sqrt();
    if norm > 0. {
        [v[0] / norm, v[1] / norm, v[2] / norm]
    } else {
        [0., 0., 0.]
    }
}

/// symmetric matrix of angles (radians) between every pair of directions
pub fn angle_matrix(directions: &[[f64; 3]]) -> Array2<f64> {
    let unit: Vec<[f64; 3]> = directions.iter().map(normalized).collect();
    let n = unit.len();
    let mut angles = Array2::zeros((n, n));
    for i in 0..n {
        for j in i..n {
            let a = &unit[i];
            let b = &unit[j];
            let dot = (a[0] * b[0] + a[1] * b[1] + a[2] * b[2]).clamp(-1., 1.);
            let angle = if i == j { 0. } else { dot.acos() };
            angles[[i, j]] = angle;
            angles[[j, i]] = angle;
        }
    }
    angles
}

/// finds the `k` closest directions for each of `n_channels` channels. `candidates` holds either
/// the channel directions or the channel directions followed by their antipodes; candidate
/// indices are folded back onto channels modulo `n_channels`. The channel itself is never one of
/// its neighbors, neighbors are distinct, and ties resolve to the lowest candidate index.
pub fn angular_neighbors(candidates: &[[f64; 3]], n_channels: usize, k: usize) -> Result<Vec<Vec<usize>>> {
    if candidates.len() != n_channels && candidates.len() != 2 * n_channels {
        return Err(DenoiseError::InvalidParameter(format!(
            "{} candidate directions do not match {} channels", candidates.len(), n_channels
        )));
    }
    if k >= n_channels {
        return Err(DenoiseError::InsufficientNeighbors {
            requested: k,
            available: n_channels.saturating_sub(1),
        });
    }

    let angles = angle_matrix(candidates);
    let n_candidates = candidates.len();

    let neighbors = (0..n_channels).map(|channel| {
        let row = angles.row(channel);
        let mut order: Vec<usize> = (0..n_candidates).collect();
        // stable sort keeps index order among equal angles
        order.sort_by(|&a, &b| row[a].total_cmp(&row[b]));

        let mut selected = Vec::with_capacity(k);
        for candidate in order {
            if selected.len() == k {
                break;
            }
            let neighbor = candidate % n_channels;
            if neighbor != channel && !selected.contains(&neighbor) {
                selected.push(neighbor);
            }
        }
        selected
    }).collect();

    Ok(neighbors)
}
