//! Colour-density models for per-pixel backprojection.
//!
//! A stage learns the joint distribution of two colour channels from a
//! training region, either as a normalised histogram or as a Gaussian
//! mixture fitted to that histogram, and scores every pixel of later frames
//! by how well its colour matches. See [`color_model`] for the stages.

use glob::glob;
use image::RgbImage;
use log::{info, warn};
use std::path::Path;
use std::path::PathBuf;

pub mod color_model;
pub mod colorspace;
pub mod error;
pub mod persist;

pub use color_model::backproject::LikelihoodMap;
pub use color_model::bayes::BayesSettings;
pub use color_model::gmm::{GmmSettings, MixtureModel};
pub use color_model::histogram::Histogram;
pub use color_model::lookup::{BinLayout, LookupGrid};
pub use color_model::{
    BackprojectorConfig, BayesBackprojector, ColorStage, Density, GmmBackprojector,
    HistogramBackprojector,
};
pub use colorspace::ColorSpace;
pub use error::{DensityError, Result};

/// Paths matching a glob pattern, sorted; unreadable entries are skipped.
pub fn list_frames(pattern: &str) -> Result<Vec<PathBuf>> {
    let entries = glob(pattern)
        .map_err(|e| DensityError::InvalidParameter(format!("bad pattern {}: {}", pattern, e)))?;

    let mut paths: Vec<PathBuf> = entries
        // remove all unreadable paths
        .filter_map(|entry| match entry {
            Ok(path) => Some(path),
            Err(e) => {
                warn!("skipping {}", e);
                None
            }
        })
        .collect();
    paths.sort();
    return Ok(paths);
}

// takes a vector of generics: 'everything that looks and quacks like a std::path::Path'
pub fn import_images<P: AsRef<Path>>(paths: &[P]) -> Result<Vec<RgbImage>> {
    let mut images: Vec<RgbImage> = Vec::new();
    for path in paths {
        images.push(image::open(path)?.to_rgb8());
    }
    info!("slurped {} images into memory", images.len());
    return Ok(images);
}

/// Scales a likelihood map into an 8-bit image for viewing.
///
/// Values are divided by `scale` (use 1.0 for maps already in `[0, 1]`) and
/// saturate at white.
pub fn to_gray(map: &LikelihoodMap, scale: f32) -> image::GrayImage {
    let mut out = image::GrayImage::new(map.width(), map.height());
    for (src, dst) in map.pixels().zip(out.pixels_mut()) {
        let v = if scale > 0.0 { src[0] / scale } else { 0.0 };
        dst[0] = (v.clamp(0.0, 1.0) * 255.0).round() as u8;
    }
    out
}
