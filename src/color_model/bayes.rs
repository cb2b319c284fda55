use super::backproject::{backproject, LikelihoodMap};
use super::histogram::Histogram;
use super::lookup::LookupGrid;
use crate::error::{DensityError, Result};
use image::RgbImage;
use log::warn;
use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct BayesSettings {
    // apriori values below this are raised to it before dividing
    pub denominator_floor: f32,
    // prior probability of the target colour
    pub prior_scale: f32,
}

impl Default for BayesSettings {
    fn default() -> Self {
        BayesSettings {
            denominator_floor: 1e-6,
            prior_scale: 0.5,
        }
    }
}

// posterior map plus the number of pixels whose denominator was clamped
#[derive(Clone, Debug)]
pub struct Posterior {
    pub map: LikelihoodMap,
    pub clamped: usize,
}

// `numerator / denominator`, refusing denominators below `floor`
pub fn checked_ratio(numerator: f32, denominator: f32, floor: f32) -> Result<f32> {
    if !(denominator >= floor) {
        return Err(DensityError::DivisionByNearZero {
            value: denominator as f64,
            floor: floor as f64,
        });
    }
    Ok(numerator / denominator)
}

// bayesian posterior of `target` against the frame's own colour distribution:
// target * prior_scale / max(apriori, denominator_floor), apriori being the
// unit-mass histogram of the whole frame on the target layout
pub fn posterior(
    image: &RgbImage,
    channels: [usize; 2],
    target: &LookupGrid,
    settings: &BayesSettings,
) -> Result<Posterior> {
    if !(settings.denominator_floor > 0.0) {
        return Err(DensityError::InvalidParameter(format!(
            "denominator floor must be positive, got {}",
            settings.denominator_floor
        )));
    }

    let scene = Histogram::from_image(*target.layout(), channels, image, None)?;
    let apriori_grid = scene.probability_mass()?.grid;
    let mut map = backproject(image, channels, &apriori_grid);
    let target_map = backproject(image, channels, target);

    let floor = settings.denominator_floor;
    let mut clamped = 0;
    for (out, t) in map.iter_mut().zip(target_map.iter()) {
        let numerator = t * settings.prior_scale;
        *out = match checked_ratio(numerator, *out, floor) {
            Ok(v) => v,
            Err(_) => {
                clamped += 1;
                numerator / floor
            }
        };
    }

    if clamped > 0 {
        warn!("posterior: clamped {} near-zero apriori values", clamped);
    }
    Ok(Posterior { map, clamped })
}
