use super::gmm::ColorSample;
use super::lookup::{min_max_grid, try_min_max, BinLayout, LookupGrid, Normalized};
use super::Density;
use crate::error::{DensityError, Result};
use image::{GrayImage, RgbImage};
use log::{debug, warn};
use nalgebra::DVector;
use serde::{Deserialize, Serialize};

// joint 2-D histogram over two channels of a preprocessed frame
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Histogram {
    layout: BinLayout,
    channels: [usize; 2],
    counts: Vec<f64>,
}

fn check_mask(image: &RgbImage, mask: Option<&GrayImage>) -> Result<()> {
    if let Some(mask) = mask {
        if mask.dimensions() != image.dimensions() {
            return Err(DensityError::MaskSizeMismatch {
                mask: mask.dimensions(),
                frame: image.dimensions(),
            });
        }
    }
    Ok(())
}

fn check_rate(alpha: f64) -> Result<()> {
    if !(0.0..=1.0).contains(&alpha) {
        return Err(DensityError::InvalidParameter(format!(
            "blend rate must lie in [0, 1], got {}",
            alpha
        )));
    }
    Ok(())
}

impl Histogram {
    pub fn new(layout: BinLayout, channels: [usize; 2]) -> Result<Histogram> {
        if channels.iter().any(|c| *c > 2) {
            return Err(DensityError::InvalidParameter(format!(
                "channel indices must be < 3, got {:?}",
                channels
            )));
        }
        Ok(Histogram {
            counts: vec![0.0; layout.cell_count()],
            layout,
            channels,
        })
    }

    // builds a histogram from the pixels of `image` selected by `mask`
    pub fn from_image(
        layout: BinLayout,
        channels: [usize; 2],
        image: &RgbImage,
        mask: Option<&GrayImage>,
    ) -> Result<Histogram> {
        let mut hist = Histogram::new(layout, channels)?;
        hist.fit(image, mask)?;
        Ok(hist)
    }

    // replaces the counts with those of the masked region; zero mask pixels are skipped
    pub fn fit(&mut self, image: &RgbImage, mask: Option<&GrayImage>) -> Result<()> {
        check_mask(image, mask)?;

        let mut counts = vec![0.0; self.layout.cell_count()];
        let [a, b] = self.channels;
        for (x, y, pixel) in image.enumerate_pixels() {
            if let Some(mask) = mask {
                if mask.get_pixel(x, y)[0] == 0 {
                    continue;
                }
            }
            let (i, j) = self.layout.bin_of(pixel[a] as f32, pixel[b] as f32);
            counts[self.layout.index(i, j)] += 1.0;
        }
        self.counts = counts;

        debug!(
            "histogram fit: {} pixels over {} bins, peak {}",
            self.total_mass(),
            self.layout.cell_count(),
            self.max_count()
        );
        Ok(())
    }

    // blends the histogram of a new region in: `H = (1 - alpha) H + alpha H_new`
    pub fn update(&mut self, image: &RgbImage, mask: Option<&GrayImage>, alpha: f64) -> Result<()> {
        check_rate(alpha)?;
        let fresh = Histogram::from_image(self.layout, self.channels, image, mask)?;
        self.blend(&fresh, alpha)
    }

    // pointwise blend with a histogram of identical layout and channels
    pub fn blend(&mut self, other: &Histogram, alpha: f64) -> Result<()> {
        check_rate(alpha)?;
        if self.layout != other.layout || self.channels != other.channels {
            return Err(DensityError::LayoutMismatch);
        }
        let keep = 1.0 - alpha;
        for (h, n) in self.counts.iter_mut().zip(other.counts.iter()) {
            *h = keep * *h + alpha * n;
        }
        Ok(())
    }

    pub fn layout(&self) -> &BinLayout {
        &self.layout
    }

    pub fn channels(&self) -> [usize; 2] {
        self.channels
    }

    pub fn counts(&self) -> &[f64] {
        &self.counts
    }

    pub fn get(&self, i: usize, j: usize) -> f64 {
        self.counts[self.layout.index(i, j)]
    }

    pub fn total_mass(&self) -> f64 {
        self.counts.iter().sum()
    }

    pub fn max_count(&self) -> f64 {
        self.counts.iter().cloned().fold(0.0, f64::max)
    }

    // min-max scaling into `[0, 1]`, failing on a degenerate histogram
    pub fn try_normalized(&self) -> Result<LookupGrid> {
        let scaled = try_min_max(&self.counts)?;
        LookupGrid::from_values(self.layout, scaled)
    }

    // min-max scaling into `[0, 1]` with the constant fallback for
    // degenerate histograms
    pub fn normalized(&self) -> Result<Normalized> {
        min_max_grid(self.layout, &self.counts)
    }

    // counts divided by the total mass so the cells sum to one, uniform if there is no mass
    pub fn probability_mass(&self) -> Result<Normalized> {
        let total = self.total_mass();
        let cells = self.layout.cell_count();
        if total > 0.0 && total.is_finite() {
            let values = self.counts.iter().map(|c| (c / total) as f32).collect();
            return Ok(Normalized {
                grid: LookupGrid::from_values(self.layout, values)?,
                degenerate: false,
            });
        }
        warn!("histogram has no mass, using a uniform distribution");
        Ok(Normalized {
            grid: LookupGrid::from_values(self.layout, vec![1.0 / cells as f32; cells])?,
            degenerate: true,
        })
    }

    // one weighted sample per non-empty bin, located at the bin centre
    pub fn samples(&self) -> Vec<ColorSample> {
        let [n1, n2] = self.layout.bins;
        let mut samples = Vec::new();
        for i in 0..n1 {
            for j in 0..n2 {
                let weight = self.get(i, j);
                if weight > 0.0 {
                    let center = self.layout.bin_center(i, j);
                    samples.push(ColorSample {
                        value: DVector::from_row_slice(&center),
                        weight,
                    });
                }
            }
        }
        return samples;
    }
}

impl Density for Histogram {
    fn dimensions(&self) -> usize {
        2
    }

    // piecewise constant: bin mass over bin area
    fn evaluate(&self, point: &[f64]) -> Result<f64> {
        if point.len() != 2 {
            return Err(DensityError::DimensionMismatch {
                expected: 2,
                actual: point.len(),
            });
        }
        let total = self.total_mass();
        if total <= 0.0 {
            return Ok(0.0);
        }
        let (i, j) = self.layout.bin_of(point[0] as f32, point[1] as f32);
        Ok(self.get(i, j) / total / self.layout.bin_area())
    }

    fn to_lookup_grid(&self, layout: &BinLayout) -> Result<Normalized> {
        if *layout == self.layout {
            return self.normalized();
        }
        let [n1, n2] = layout.bins;
        let mut values = Vec::with_capacity(layout.cell_count());
        for i in 0..n1 {
            for j in 0..n2 {
                values.push(self.evaluate(&layout.bin_center(i, j))?);
            }
        }
        min_max_grid(*layout, &values)
    }
}
