use crate::error::{DensityError, Result};
use log::warn;
use serde::{Deserialize, Serialize};

// bin counts and half-open value ranges of a 2-D colour grid
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct BinLayout {
    pub bins: [usize; 2],
    pub ranges: [[f32; 2]; 2],
}

impl BinLayout {
    pub fn new(bins: [usize; 2], ranges: [[f32; 2]; 2]) -> Result<BinLayout> {
        if bins[0] == 0 || bins[1] == 0 {
            return Err(DensityError::InvalidParameter(format!(
                "bin counts must be positive, got {:?}",
                bins
            )));
        }
        for r in ranges.iter() {
            if !(r[1] > r[0]) {
                return Err(DensityError::InvalidParameter(format!(
                    "empty channel range {:?}",
                    r
                )));
            }
        }
        Ok(BinLayout { bins, ranges })
    }

    pub fn cell_count(&self) -> usize {
        self.bins[0] * self.bins[1]
    }

    pub fn bin_width(&self, axis: usize) -> f64 {
        (self.ranges[axis][1] - self.ranges[axis][0]) as f64 / self.bins[axis] as f64
    }

    pub fn bin_area(&self) -> f64 {
        self.bin_width(0) * self.bin_width(1)
    }

    // values outside the range land in the nearest edge bin
    fn axis_bin(&self, axis: usize, value: f32) -> usize {
        let [lo, hi] = self.ranges[axis];
        let n = self.bins[axis];
        let scaled = ((value - lo) / (hi - lo) * n as f32).floor();
        if scaled <= 0.0 {
            0
        } else {
            (scaled as usize).min(n - 1)
        }
    }

    // bin indices of a channel pair, clamped to the grid
    pub fn bin_of(&self, c1: f32, c2: f32) -> (usize, usize) {
        (self.axis_bin(0, c1), self.axis_bin(1, c2))
    }

    pub fn bin_center(&self, i: usize, j: usize) -> [f64; 2] {
        [
            self.ranges[0][0] as f64 + (i as f64 + 0.5) * self.bin_width(0),
            self.ranges[1][0] as f64 + (j as f64 + 0.5) * self.bin_width(1),
        ]
    }

    pub fn index(&self, i: usize, j: usize) -> usize {
        i * self.bins[1] + j
    }
}

// an immutable, row-major grid of per-bin values
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct LookupGrid {
    layout: BinLayout,
    values: Vec<f32>,
}

impl LookupGrid {
    pub fn from_values(layout: BinLayout, values: Vec<f32>) -> Result<LookupGrid> {
        if values.len() != layout.cell_count() {
            return Err(DensityError::DimensionMismatch {
                expected: layout.cell_count(),
                actual: values.len(),
            });
        }
        Ok(LookupGrid { layout, values })
    }

    pub fn layout(&self) -> &BinLayout {
        &self.layout
    }

    pub fn values(&self) -> &[f32] {
        &self.values
    }

    pub fn get(&self, i: usize, j: usize) -> f32 {
        self.values[self.layout.index(i, j)]
    }

    // value of the cell a channel pair falls into
    #[inline]
    pub fn lookup(&self, c1: f32, c2: f32) -> f32 {
        let (i, j) = self.layout.bin_of(c1, c2);
        self.get(i, j)
    }
}

// a grid plus whether it had to fall back because the source was degenerate
#[derive(Clone, Debug)]
pub struct Normalized {
    pub grid: LookupGrid,
    pub degenerate: bool,
}

// min-max rescales `values` into `[0, 1]`; constant or non-finite input is an error
pub fn try_min_max(values: &[f64]) -> Result<Vec<f32>> {
    if values.iter().any(|v| !v.is_finite()) {
        return Err(DensityError::InvalidParameter(
            "grid contains non-finite values".to_string(),
        ));
    }
    let min = values.iter().cloned().fold(f64::INFINITY, f64::min);
    let max = values.iter().cloned().fold(f64::NEG_INFINITY, f64::max);
    if !(max > min) {
        return Err(DensityError::DegenerateHistogram);
    }
    let range = max - min;
    return Ok(values
        .iter()
        .map(|v| ((v - min) / range).clamp(0.0, 1.0) as f32)
        .collect());
}

// min-max normalisation with the degenerate fallback applied:
// all-zero stays zero, any other constant grid becomes all ones
pub fn min_max_grid(layout: BinLayout, values: &[f64]) -> Result<Normalized> {
    match try_min_max(values) {
        Ok(scaled) => Ok(Normalized {
            grid: LookupGrid::from_values(layout, scaled)?,
            degenerate: false,
        }),
        Err(DensityError::DegenerateHistogram) => {
            let fill = if values.first().map_or(true, |v| *v == 0.0) {
                0.0
            } else {
                1.0
            };
            warn!("degenerate grid, falling back to constant {}", fill);
            Ok(Normalized {
                grid: LookupGrid::from_values(layout, vec![fill; values.len()])?,
                degenerate: true,
            })
        }
        Err(e) => Err(e),
    }
}
