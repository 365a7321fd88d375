use crate::error::{DenoiseError, Result};
use std::fs;
use std::path::Path;

/// b-values and b-vectors of an acquisition, one entry per volume
#[derive(Debug, Clone, PartialEq)]
pub struct GradientTable {
    bvals: Vec<f32>,
    bvecs: Vec<[f32; 3]>,
}

impl GradientTable {
    pub fn new(bvals: Vec<f32>, bvecs: Vec<[f32; 3]>) -> Result<Self> {
        if bvals.len() != bvecs.len() {
            return Err(DenoiseError::GradientTable(format!(
                "found {} b-values but {} b-vectors", bvals.len(), bvecs.len()
            )));
        }
        Ok(Self { bvals, bvecs })
    }

    pub fn from_files(bvals: impl AsRef<Path>, bvecs: impl AsRef<Path>) -> Result<Self> {
        Self::new(read_bvals(bvals)?, read_bvecs(bvecs)?)
    }

    pub fn n_volumes(&self) -> usize {
        self.bvals.len()
    }

    pub fn bvecs(&self) -> &[[f32; 3]] {
        &self.bvecs
    }

    /// true for every volume with a b-value at or below the threshold
    pub fn baseline_mask(&self, threshold: f32) -> Vec<bool> {
        self.bvals.iter().map(|&b| b <= threshold).collect()
    }
}

fn parse_rows(path: &Path) -> Result<Vec<Vec<f32>>> {
    let text = fs::read_to_string(path)?;
    text.lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .map(|line| {
            line.split(|c: char| c.is_whitespace() || c == ',')
                .filter(|s| !s.is_empty())
                .map(|s| s.parse::<f32>().map_err(|_| {
                    DenoiseError::GradientTable(format!("invalid value '{}' in {}", s, path.display()))
                }))
                .collect::<Result<Vec<f32>>>()
        })
        .collect()
}

/// read b-values from a text file with whitespace delimiter, on one or several lines
pub fn read_bvals(txt_file: impl AsRef<Path>) -> Result<Vec<f32>> {
    let rows = parse_rows(txt_file.as_ref())?;
    Ok(rows.into_iter().flatten().collect())
}

/// read b-vectors from a text file with whitespace delimiter. Both the FSL layout (3 rows of N
/// values) and one vector per line (N rows of 3 values) are accepted; 3 rows of equal length
/// are read as FSL.
pub fn read_bvecs(txt_file: impl AsRef<Path>) -> Result<Vec<[f32; 3]>> {
    let path = txt_file.as_ref();
    let rows = parse_rows(path)?;
    if rows.len() == 3 && rows.iter().all(|r| r.len() == rows[0].len()) {
        let n = rows[0].len();
        return Ok((0..n).map(|i| [rows[0][i], rows[1][i], rows[2][i]]).collect());
    }
    if rows.iter().all(|r| r.len() == 3) {
        return Ok(rows.into_iter().map(|r| [r[0], r[1], r[2]]).collect());
    }
    Err(DenoiseError::GradientTable(format!(
        "{} is neither 3 x N nor N x 3", path.display()
    )))
}
