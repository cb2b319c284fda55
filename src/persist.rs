//! Saving and loading trained models as JSON.
//!
//! A histogram is stored as its layout, channel pair and flat list of cell
//! counts; a mixture as its dimensionality and list of components. Loaded
//! values are checked before they are handed back.

use crate::color_model::gmm::MixtureModel;
use crate::color_model::histogram::Histogram;
use crate::error::{DensityError, Result};
use log::debug;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::fs::File;
use std::io::{BufReader, BufWriter, Write};
use std::path::Path;

pub fn save_json<T: Serialize, P: AsRef<Path>>(value: &T, path: P) -> Result<()> {
    let file = File::create(path.as_ref())?;
    let mut writer = BufWriter::new(file);
    serde_json::to_writer_pretty(&mut writer, value)?;
    writer.flush()?;
    debug!("wrote {}", path.as_ref().display());
    Ok(())
}

pub fn load_json<T: DeserializeOwned, P: AsRef<Path>>(path: P) -> Result<T> {
    let file = File::open(path.as_ref())?;
    let value = serde_json::from_reader(BufReader::new(file))?;
    Ok(value)
}

pub fn load_histogram<P: AsRef<Path>>(path: P) -> Result<Histogram> {
    let stored: Histogram = load_json(path)?;

    let expected = stored.layout().cell_count();
    if stored.counts().len() != expected {
        return Err(DensityError::DimensionMismatch {
            expected,
            actual: stored.counts().len(),
        });
    }
    if stored.counts().iter().any(|c| !(c.is_finite() && *c >= 0.0)) {
        return Err(DensityError::InvalidParameter(
            "stored histogram has negative or non-finite counts".to_string(),
        ));
    }
    // re-runs the layout and channel checks
    Histogram::new(*stored.layout(), stored.channels())?;
    Ok(stored)
}

pub fn load_mixture<P: AsRef<Path>>(path: P) -> Result<MixtureModel> {
    let stored: MixtureModel = load_json(path)?;
    MixtureModel::from_components(stored.dimensions(), stored.components().to_vec())
}
