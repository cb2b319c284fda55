use super::histogram::Histogram;
use super::lookup::{min_max_grid, BinLayout, Normalized};
use super::Density;
use crate::error::{DensityError, Result};
use log::{debug, info};
use nalgebra::linalg::Cholesky;
use nalgebra::{DMatrix, DVector, Dyn};
use serde::{Deserialize, Serialize};

// rows whose unnormalised responsibilities sum below this get a uniform split
const RESPONSIBILITY_FLOOR: f64 = 1e-300;

/// A point in channel space together with how many pixels it stands for.
#[derive(Clone, Debug, PartialEq)]
pub struct ColorSample {
    pub value: DVector<f64>,
    pub weight: f64,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct GaussianComponent {
    // non-negative, adds up to one across components
    pub weight: f64,
    pub mean: DVector<f64>,
    // symmetric positive definite
    pub covariance: DMatrix<f64>,
}

// a component with its covariance factorised once, ready for repeated evaluation
struct PreparedComponent {
    weight: f64,
    mean: DVector<f64>,
    cholesky: Cholesky<f64, Dyn>,
    // 1 / ((2 pi)^(d/2) * sqrt(det))
    norm: f64,
}

impl PreparedComponent {
    fn new(component: &GaussianComponent, index: usize) -> Result<PreparedComponent> {
        let cholesky = component
            .covariance
            .clone()
            .cholesky()
            .ok_or(DensityError::SingularCovariance { component: index })?;

        // sqrt(det) is the product of the diagonal of L
        let sqrt_det: f64 = cholesky.l_dirty().diagonal().iter().product();
        let d = component.mean.len() as i32;
        let norm = 1.0 / ((2.0 * std::f64::consts::PI).sqrt().powi(d) * sqrt_det);
        if !norm.is_finite() || norm <= 0.0 {
            return Err(DensityError::SingularCovariance { component: index });
        }

        Ok(PreparedComponent {
            weight: component.weight,
            mean: component.mean.clone(),
            cholesky,
            norm,
        })
    }

    fn density(&self, x: &DVector<f64>) -> f64 {
        let diff = x - &self.mean;
        let solved = self.cholesky.solve(&diff);
        let mahalanobis_sq = diff.dot(&solved);
        return self.norm * (-0.5 * mahalanobis_sq).exp();
    }

    // this component's contribution to the mixture density at x
    fn weighted_contribution(&self, x: &DVector<f64>) -> f64 {
        self.weight * self.density(x)
    }
}

fn prepare(components: &[GaussianComponent]) -> Result<Vec<PreparedComponent>> {
    components
        .iter()
        .enumerate()
        .map(|(k, c)| PreparedComponent::new(c, k))
        .collect()
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct GmmSettings {
    pub components: usize,
    pub max_iterations: usize,
    // stop once the log-likelihood improves by less than this fraction
    pub min_relative_gain: f64,
    // isotropic variance every component starts with; keep it large to avoid early collapse
    pub initial_variance: f64,
    // added to the covariance diagonal after every M-step
    pub regularization: f64,
}

impl Default for GmmSettings {
    fn default() -> Self {
        GmmSettings {
            components: 4,
            max_iterations: 30,
            min_relative_gain: 0.01,
            initial_variance: 500.0,
            regularization: 1e-6,
        }
    }
}

impl GmmSettings {
    fn validate(&self) -> Result<()> {
        if self.components == 0 {
            return Err(DensityError::InvalidParameter(
                "a mixture needs at least one component".to_string(),
            ));
        }
        if self.max_iterations == 0 {
            return Err(DensityError::InvalidParameter(
                "max_iterations must be positive".to_string(),
            ));
        }
        if !(self.initial_variance > 0.0) || !(self.regularization >= 0.0) {
            return Err(DensityError::InvalidParameter(format!(
                "initial_variance {} / regularization {} out of range",
                self.initial_variance, self.regularization
            )));
        }
        Ok(())
    }
}

/// Diagnostics of a single EM run.
#[derive(Clone, Debug, PartialEq)]
pub struct FitReport {
    pub iterations: usize,
    // weighted log-likelihood after each M-step
    pub log_likelihoods: Vec<f64>,
    pub converged: bool,
}

fn empty_responsibilities() -> DMatrix<f64> {
    DMatrix::zeros(0, 0)
}

/// A weighted sum of multivariate Gaussians.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct MixtureModel {
    dimensions: usize,
    components: Vec<GaussianComponent>,
    // N x K membership probabilities of the last training set, rebuilt each EM iteration
    #[serde(skip, default = "empty_responsibilities")]
    responsibilities: DMatrix<f64>,
}

impl MixtureModel {
    /// Builds a mixture from explicit parameters.
    ///
    /// Every mean and covariance must match `dimensions`, the covariances
    /// must be invertible and the weights must sum to one.
    pub fn from_components(
        dimensions: usize,
        components: Vec<GaussianComponent>,
    ) -> Result<MixtureModel> {
        if components.is_empty() {
            return Err(DensityError::InvalidParameter(
                "a mixture needs at least one component".to_string(),
            ));
        }
        for c in components.iter() {
            if c.mean.len() != dimensions {
                return Err(DensityError::DimensionMismatch {
                    expected: dimensions,
                    actual: c.mean.len(),
                });
            }
            if c.covariance.nrows() != dimensions || c.covariance.ncols() != dimensions {
                return Err(DensityError::DimensionMismatch {
                    expected: dimensions,
                    actual: c.covariance.nrows().max(c.covariance.ncols()),
                });
            }
        }
        let total: f64 = components.iter().map(|c| c.weight).sum();
        if components.iter().any(|c| c.weight < 0.0) || (total - 1.0).abs() > 1e-6 {
            return Err(DensityError::InvalidParameter(format!(
                "component weights must be non-negative and sum to 1, got {}",
                total
            )));
        }
        prepare(&components)?;

        Ok(MixtureModel {
            dimensions,
            components,
            responsibilities: empty_responsibilities(),
        })
    }

    /// Fits a mixture to the non-empty bins of a histogram.
    pub fn from_histogram(
        histogram: &Histogram,
        settings: &GmmSettings,
    ) -> Result<(MixtureModel, FitReport)> {
        MixtureModel::fit(&histogram.samples(), 2, settings)
    }

    /// Runs expectation-maximization on weighted samples.
    ///
    /// Samples with zero weight are ignored. Components are seeded from
    /// contiguous groups of the samples in the order given, so the fit is
    /// deterministic.
    pub fn fit(
        samples: &[ColorSample],
        dimensions: usize,
        settings: &GmmSettings,
    ) -> Result<(MixtureModel, FitReport)> {
        settings.validate()?;
        for s in samples.iter() {
            if s.value.len() != dimensions {
                return Err(DensityError::DimensionMismatch {
                    expected: dimensions,
                    actual: s.value.len(),
                });
            }
        }
        let samples: Vec<&ColorSample> = samples
            .iter()
            .filter(|s| s.weight > 0.0 && s.weight.is_finite())
            .collect();
        if samples.is_empty() {
            return Err(DensityError::EmptySampleSet);
        }

        let k_count = settings.components;
        let total_weight: f64 = samples.iter().map(|s| s.weight).sum();

        let mut model = MixtureModel {
            dimensions,
            components: seed_components(&samples, dimensions, settings),
            responsibilities: DMatrix::zeros(samples.len(), k_count),
        };
        let mut prepared = prepare(&model.components)?;

        let mut report = FitReport {
            iterations: 0,
            log_likelihoods: Vec::new(),
            converged: false,
        };

        for step in 0..settings.max_iterations {
            model.expectation(&samples, &prepared);
            model.maximization(&samples, total_weight, settings.regularization);
            prepared = prepare(&model.components)?;

            let log_likelihood = log_likelihood(&samples, &prepared);
            report.iterations = step + 1;
            report.log_likelihoods.push(log_likelihood);

            debug!(
                "EM step {}: log-likelihood {:.6}, {}",
                step,
                log_likelihood,
                model.summary()
            );

            // the first step has nothing to compare against
            if step > 0 {
                let last = report.log_likelihoods[step - 1];
                let gain = if last != 0.0 {
                    (log_likelihood - last) / last.abs()
                } else {
                    log_likelihood - last
                };
                if gain < settings.min_relative_gain {
                    report.converged = true;
                    break;
                }
            }
        }

        info!(
            "fitted {} components to {} samples in {} iterations (converged: {})",
            k_count,
            samples.len(),
            report.iterations,
            report.converged
        );
        return Ok((model, report));
    }

    // E-step: posterior membership of every sample in every component
    fn expectation(&mut self, samples: &[&ColorSample], prepared: &[PreparedComponent]) {
        let k_count = prepared.len();
        for (i, s) in samples.iter().enumerate() {
            let mut sum = 0.0;
            for (k, c) in prepared.iter().enumerate() {
                let r = c.weighted_contribution(&s.value);
                self.responsibilities[(i, k)] = r;
                sum += r;
            }
            if sum > RESPONSIBILITY_FLOOR && sum.is_finite() {
                for k in 0..k_count {
                    self.responsibilities[(i, k)] /= sum;
                }
            } else {
                for k in 0..k_count {
                    self.responsibilities[(i, k)] = 1.0 / k_count as f64;
                }
            }
        }
    }

    // M-step: re-estimate weights, means and covariances from the responsibilities
    fn maximization(&mut self, samples: &[&ColorSample], total_weight: f64, regularization: f64) {
        let d = self.dimensions;
        for (k, component) in self.components.iter_mut().enumerate() {
            let mut mass = 0.0;
            let mut mean = DVector::zeros(d);
            for (i, s) in samples.iter().enumerate() {
                let w = s.weight * self.responsibilities[(i, k)];
                mass += w;
                mean += &s.value * w;
            }

            component.weight = mass / total_weight;
            // an abandoned component keeps its previous shape with zero weight
            if !(mass > 0.0) {
                continue;
            }
            mean /= mass;

            let mut covariance = DMatrix::zeros(d, d);
            for (i, s) in samples.iter().enumerate() {
                let w = s.weight * self.responsibilities[(i, k)];
                let diff = &s.value - &mean;
                covariance += (&diff * diff.transpose()) * w;
            }
            covariance /= mass;
            covariance = (&covariance + covariance.transpose()) * 0.5;
            for j in 0..d {
                covariance[(j, j)] += regularization;
            }

            component.mean = mean;
            component.covariance = covariance;
        }
    }

    pub fn dimensions(&self) -> usize {
        self.dimensions
    }

    pub fn components(&self) -> &[GaussianComponent] {
        &self.components
    }

    /// Membership probabilities from the last EM iteration (N x K).
    pub fn responsibilities(&self) -> &DMatrix<f64> {
        &self.responsibilities
    }

    // debug method to dump the current state of the model
    pub fn summary(&self) -> String {
        let weights: Vec<f64> = self.components.iter().map(|c| c.weight).collect();
        let means: Vec<Vec<f64>> = self
            .components
            .iter()
            .map(|c| c.mean.iter().cloned().collect())
            .collect();
        return format!(
            "components: {}, weights: {:?}, means: {:?}",
            self.components.len(),
            weights,
            means
        );
    }

    fn check_dimensions(&self, len: usize) -> Result<()> {
        if len != self.dimensions {
            return Err(DensityError::DimensionMismatch {
                expected: self.dimensions,
                actual: len,
            });
        }
        Ok(())
    }

    /// Mixture density at `x`.
    pub fn density(&self, x: &[f64]) -> Result<f64> {
        self.check_dimensions(x.len())?;
        let x = DVector::from_column_slice(x);
        let prepared = prepare(&self.components)?;
        Ok(prepared.iter().map(|c| c.weighted_contribution(&x)).sum())
    }

    /// Weighted contribution of a single component at `x`.
    pub fn component_density(&self, component: usize, x: &[f64]) -> Result<f64> {
        self.check_dimensions(x.len())?;
        let c = self.components.get(component).ok_or_else(|| {
            DensityError::InvalidParameter(format!("no component {}", component))
        })?;
        let prepared = PreparedComponent::new(c, component)?;
        Ok(prepared.weighted_contribution(&DVector::from_column_slice(x)))
    }

    /// Samples the density at every bin centre of `layout`, scales by the
    /// bin area so each cell approximates its probability mass, and min-max
    /// normalises the result.
    pub fn make_lookup(&self, layout: &BinLayout) -> Result<Normalized> {
        self.check_dimensions(2)?;
        let prepared = prepare(&self.components)?;
        let area = layout.bin_area();
        let [n1, n2] = layout.bins;

        let mut values = Vec::with_capacity(layout.cell_count());
        for i in 0..n1 {
            for j in 0..n2 {
                let x = DVector::from_row_slice(&layout.bin_center(i, j));
                let p: f64 = prepared.iter().map(|c| c.weighted_contribution(&x)).sum();
                values.push(p * area);
            }
        }
        min_max_grid(*layout, &values)
    }
}

impl Density for MixtureModel {
    fn dimensions(&self) -> usize {
        self.dimensions
    }

    fn evaluate(&self, point: &[f64]) -> Result<f64> {
        self.density(point)
    }

    fn to_lookup_grid(&self, layout: &BinLayout) -> Result<Normalized> {
        self.make_lookup(layout)
    }
}

fn weighted_centroid(samples: &[&ColorSample], dimensions: usize) -> DVector<f64> {
    let mut sum = DVector::zeros(dimensions);
    let mut mass = 0.0;
    for s in samples.iter() {
        sum += &s.value * s.weight;
        mass += s.weight;
    }
    return sum / mass;
}

// split the samples by position into K contiguous groups of (nearly) equal size;
// each group's centroid seeds one mean. Empty groups fall back to the global centroid.
fn seed_components(
    samples: &[&ColorSample],
    dimensions: usize,
    settings: &GmmSettings,
) -> Vec<GaussianComponent> {
    let n = samples.len();
    let k_count = settings.components;
    let global = weighted_centroid(samples, dimensions);

    (0..k_count)
        .map(|k| {
            let group = &samples[k * n / k_count..(k + 1) * n / k_count];
            let mean = if group.is_empty() {
                global.clone()
            } else {
                weighted_centroid(group, dimensions)
            };
            GaussianComponent {
                weight: 1.0 / k_count as f64,
                mean,
                covariance: DMatrix::identity(dimensions, dimensions) * settings.initial_variance,
            }
        })
        .collect()
}

fn log_likelihood(samples: &[&ColorSample], prepared: &[PreparedComponent]) -> f64 {
    samples
        .iter()
        .map(|s| {
            let p: f64 = prepared.iter().map(|c| c.weighted_contribution(&s.value)).sum();
            s.weight * p.max(f64::MIN_POSITIVE).ln()
        })
        .sum()
}
