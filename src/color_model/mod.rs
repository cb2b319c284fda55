use crate::color_model::backproject::{backproject, LikelihoodMap};
use crate::color_model::bayes::{posterior, BayesSettings, Posterior};
use crate::color_model::gmm::{GmmSettings, MixtureModel};
use crate::color_model::histogram::Histogram;
use crate::color_model::lookup::{BinLayout, LookupGrid, Normalized};
use crate::color_model::snapshot::SnapshotCell;
use crate::colorspace::{preprocess, ColorSpace};
use crate::error::{DensityError, Result};
use image::{GrayImage, RgbImage};
use log::{debug, info, warn};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::Arc;

pub mod backproject;
pub mod bayes;
pub mod gmm;
pub mod histogram;
pub mod lookup;
pub mod snapshot;

/// A density over a 2-D colour plane that can be sampled into a lookup grid.
pub trait Density {
    fn dimensions(&self) -> usize;

    /// Density value at `point`; fails if `point` has the wrong length.
    fn evaluate(&self, point: &[f64]) -> Result<f64>;

    /// Discretises the density over `layout`, min-max normalised to `[0, 1]`.
    fn to_lookup_grid(&self, layout: &BinLayout) -> Result<Normalized>;
}

/// Which colour space and which bins a stage models.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct BackprojectorConfig {
    pub color_space: ColorSpace,
    pub bins: [usize; 2],
    // radius of the square median filter applied after conversion, 0 disables it
    pub median_radius: u32,
    // overrides for the colour space defaults
    pub channels: Option<[usize; 2]>,
    pub ranges: Option<[[f32; 2]; 2]>,
}

impl Default for BackprojectorConfig {
    fn default() -> Self {
        BackprojectorConfig {
            color_space: ColorSpace::Hls,
            bins: [32, 32],
            median_radius: 2,
            channels: None,
            ranges: None,
        }
    }
}

impl BackprojectorConfig {
    pub fn new(color_space: ColorSpace, bins: [usize; 2]) -> BackprojectorConfig {
        BackprojectorConfig {
            color_space,
            bins,
            ..BackprojectorConfig::default()
        }
    }

    pub fn with_channels(mut self, channels: [usize; 2]) -> BackprojectorConfig {
        self.channels = Some(channels);
        self
    }

    pub fn with_ranges(mut self, ranges: [[f32; 2]; 2]) -> BackprojectorConfig {
        self.ranges = Some(ranges);
        self
    }

    pub fn with_median_radius(mut self, radius: u32) -> BackprojectorConfig {
        self.median_radius = radius;
        self
    }

    pub fn channels(&self) -> [usize; 2] {
        self.channels
            .unwrap_or_else(|| self.color_space.default_channels())
    }

    pub fn layout(&self) -> Result<BinLayout> {
        BinLayout::new(
            self.bins,
            self.ranges
                .unwrap_or_else(|| self.color_space.default_ranges()),
        )
    }
}

/// A pipeline stage that learns a colour model and scores frames against it.
///
/// All methods take `&self`: a stage can be shared between a training
/// caller and a frame-processing caller. Training is serialised; scoring
/// reads whatever model snapshot was current when it started.
pub trait ColorStage: Send + Sync {
    /// Trains from the masked region of `frame`, replacing any earlier model.
    fn fit(&self, frame: &RgbImage, mask: Option<&GrayImage>) -> Result<()>;

    /// Blends the masked region of `frame` into the model at rate `alpha`.
    fn update(&self, frame: &RgbImage, mask: Option<&GrayImage>, alpha: f64) -> Result<()>;

    /// Scores every pixel of `frame`. Untrained stages return an all-zero map.
    fn backproject(&self, frame: &RgbImage) -> Result<LikelihoodMap>;

    fn is_ready(&self) -> bool;

    /// The accumulated raw histogram, if trained.
    fn histogram(&self) -> Option<Histogram>;

    /// Trains from a whole reference image on disk.
    fn fit_from_file(&self, path: &Path) -> Result<()> {
        let frame = image::open(path)?.to_rgb8();
        info!("training from {}", path.display());
        self.fit(&frame, None)
    }
}

// state shared by every stage: the raw histogram and the published grid
struct StageCore {
    config: BackprojectorConfig,
    layout: BinLayout,
    channels: [usize; 2],
    accumulator: Mutex<Option<Histogram>>,
    published: SnapshotCell<LookupGrid>,
}

impl StageCore {
    fn new(config: BackprojectorConfig) -> Result<StageCore> {
        let layout = config.layout()?;
        let channels = config.channels();
        // validates the channel pair up front
        Histogram::new(layout, channels)?;
        Ok(StageCore {
            config,
            layout,
            channels,
            accumulator: Mutex::new(None),
            published: SnapshotCell::empty(),
        })
    }

    fn preprocess(&self, frame: &RgbImage) -> RgbImage {
        preprocess(frame, self.config.color_space, self.config.median_radius)
    }

    // builds the next histogram off to the side, derives a grid from it and
    // only then commits both. A failed build leaves the previous model in place.
    fn retrain<F>(
        &self,
        frame: &RgbImage,
        mask: Option<&GrayImage>,
        alpha: Option<f64>,
        build: F,
    ) -> Result<Histogram>
    where
        F: FnOnce(&Histogram) -> Result<LookupGrid>,
    {
        let converted = self.preprocess(frame);
        let mut accumulator = self.accumulator.lock();

        let next = match (accumulator.as_ref(), alpha) {
            (Some(current), Some(alpha)) => {
                let mut next = current.clone();
                next.update(&converted, mask, alpha)?;
                next
            }
            _ => Histogram::from_image(self.layout, self.channels, &converted, mask)?,
        };

        let grid = build(&next)?;
        *accumulator = Some(next.clone());
        self.published.publish(grid);
        Ok(next)
    }

    fn restore<F>(&self, histogram: Histogram, build: F) -> Result<()>
    where
        F: FnOnce(&Histogram) -> Result<LookupGrid>,
    {
        if *histogram.layout() != self.layout || histogram.channels() != self.channels {
            return Err(DensityError::LayoutMismatch);
        }
        let mut accumulator = self.accumulator.lock();
        let grid = build(&histogram)?;
        *accumulator = Some(histogram);
        self.published.publish(grid);
        Ok(())
    }

    fn histogram(&self) -> Option<Histogram> {
        self.accumulator.lock().clone()
    }

    fn lookup(&self) -> Option<Arc<LookupGrid>> {
        self.published.load()
    }

    fn zeros(frame: &RgbImage) -> LikelihoodMap {
        LikelihoodMap::new(frame.width(), frame.height())
    }
}

// discretise any density over the stage layout, warning on a flat result
fn density_grid<D: Density>(density: &D, layout: &BinLayout) -> Result<LookupGrid> {
    let normalized = density.to_lookup_grid(layout)?;
    if normalized.degenerate {
        warn!("training region produced a degenerate density");
    }
    Ok(normalized.grid)
}

fn normalized_grid(histogram: &Histogram) -> Result<LookupGrid> {
    density_grid(histogram, histogram.layout())
}

/// Scores pixels by the min-max normalised histogram of the training region.
pub struct HistogramBackprojector {
    core: StageCore,
}

impl HistogramBackprojector {
    pub fn new(config: BackprojectorConfig) -> Result<HistogramBackprojector> {
        Ok(HistogramBackprojector {
            core: StageCore::new(config)?,
        })
    }

    pub fn config(&self) -> &BackprojectorConfig {
        &self.core.config
    }

    /// The grid backprojection currently reads.
    pub fn lookup(&self) -> Option<Arc<LookupGrid>> {
        self.core.lookup()
    }

    /// Installs a previously saved histogram as the model.
    pub fn restore_histogram(&self, histogram: Histogram) -> Result<()> {
        self.core.restore(histogram, normalized_grid)
    }
}

impl ColorStage for HistogramBackprojector {
    fn fit(&self, frame: &RgbImage, mask: Option<&GrayImage>) -> Result<()> {
        let hist = self.core.retrain(frame, mask, None, normalized_grid)?;
        info!("histogram model trained on {} pixels", hist.total_mass());
        Ok(())
    }

    fn update(&self, frame: &RgbImage, mask: Option<&GrayImage>, alpha: f64) -> Result<()> {
        self.core.retrain(frame, mask, Some(alpha), normalized_grid)?;
        Ok(())
    }

    fn backproject(&self, frame: &RgbImage) -> Result<LikelihoodMap> {
        match self.core.lookup() {
            Some(grid) => Ok(backproject(
                &self.core.preprocess(frame),
                self.core.channels,
                &grid,
            )),
            None => Ok(StageCore::zeros(frame)),
        }
    }

    fn is_ready(&self) -> bool {
        self.core.published.is_published()
    }

    fn histogram(&self) -> Option<Histogram> {
        self.core.histogram()
    }
}

/// Scores pixels by the target histogram relative to the frame's own colours.
pub struct BayesBackprojector {
    core: StageCore,
    settings: BayesSettings,
}

impl BayesBackprojector {
    pub fn new(config: BackprojectorConfig, settings: BayesSettings) -> Result<BayesBackprojector> {
        Ok(BayesBackprojector {
            core: StageCore::new(config)?,
            settings,
        })
    }

    pub fn restore_histogram(&self, histogram: Histogram) -> Result<()> {
        self.core.restore(histogram, normalized_grid)
    }

    /// Posterior map together with the count of clamped denominators.
    pub fn posterior(&self, frame: &RgbImage) -> Result<Posterior> {
        match self.core.lookup() {
            Some(target) => posterior(
                &self.core.preprocess(frame),
                self.core.channels,
                &target,
                &self.settings,
            ),
            None => Ok(Posterior {
                map: StageCore::zeros(frame),
                clamped: 0,
            }),
        }
    }
}

impl ColorStage for BayesBackprojector {
    fn fit(&self, frame: &RgbImage, mask: Option<&GrayImage>) -> Result<()> {
        self.core.retrain(frame, mask, None, normalized_grid)?;
        Ok(())
    }

    fn update(&self, frame: &RgbImage, mask: Option<&GrayImage>, alpha: f64) -> Result<()> {
        self.core.retrain(frame, mask, Some(alpha), normalized_grid)?;
        Ok(())
    }

    fn backproject(&self, frame: &RgbImage) -> Result<LikelihoodMap> {
        Ok(self.posterior(frame)?.map)
    }

    fn is_ready(&self) -> bool {
        self.core.published.is_published()
    }

    fn histogram(&self) -> Option<Histogram> {
        self.core.histogram()
    }
}

/// Scores pixels by a Gaussian mixture fitted to the training histogram.
///
/// Every fit or update re-runs EM from scratch on the accumulated histogram.
pub struct GmmBackprojector {
    core: StageCore,
    settings: GmmSettings,
    model: SnapshotCell<MixtureModel>,
}

impl GmmBackprojector {
    pub fn new(config: BackprojectorConfig, settings: GmmSettings) -> Result<GmmBackprojector> {
        Ok(GmmBackprojector {
            core: StageCore::new(config)?,
            settings,
            model: SnapshotCell::empty(),
        })
    }

    pub fn settings(&self) -> &GmmSettings {
        &self.settings
    }

    pub fn model(&self) -> Option<Arc<MixtureModel>> {
        self.model.load()
    }

    pub fn lookup(&self) -> Option<Arc<LookupGrid>> {
        self.core.lookup()
    }

    // fit the mixture, keep it, and hand back its lookup grid.
    // a histogram without mass has nothing to fit: no model, all-zero grid
    fn mixture_grid(&self, histogram: &Histogram) -> Result<LookupGrid> {
        if !(histogram.total_mass() > 0.0) {
            warn!("training region is empty, publishing a zero mixture grid");
            let flat = density_grid(histogram, &self.core.layout)?;
            self.model.clear();
            return Ok(flat);
        }
        let (model, report) = MixtureModel::from_histogram(histogram, &self.settings)?;
        let grid = density_grid(&model, &self.core.layout)?;
        debug!("mixture grid built after {} EM iterations", report.iterations);
        self.model.publish(model);
        Ok(grid)
    }

    pub fn restore_histogram(&self, histogram: Histogram) -> Result<()> {
        self.core
            .restore(histogram, |h| self.mixture_grid(h))
    }

    /// Installs a saved mixture directly, without refitting.
    ///
    /// The mixture carries no histogram, so the accumulator is cleared: a
    /// later `update` starts over from its own frame, like a fresh `fit`.
    pub fn restore_model(&self, model: MixtureModel) -> Result<()> {
        let grid = density_grid(&model, &self.core.layout)?;
        let mut accumulator = self.core.accumulator.lock();
        *accumulator = None;
        self.model.publish(model);
        self.core.published.publish(grid);
        Ok(())
    }
}

impl ColorStage for GmmBackprojector {
    fn fit(&self, frame: &RgbImage, mask: Option<&GrayImage>) -> Result<()> {
        self.core
            .retrain(frame, mask, None, |h| self.mixture_grid(h))?;
        Ok(())
    }

    fn update(&self, frame: &RgbImage, mask: Option<&GrayImage>, alpha: f64) -> Result<()> {
        self.core
            .retrain(frame, mask, Some(alpha), |h| self.mixture_grid(h))?;
        Ok(())
    }

    fn backproject(&self, frame: &RgbImage) -> Result<LikelihoodMap> {
        match self.core.lookup() {
            Some(grid) => Ok(backproject(
                &self.core.preprocess(frame),
                self.core.channels,
                &grid,
            )),
            None => Ok(StageCore::zeros(frame)),
        }
    }

    fn is_ready(&self) -> bool {
        self.core.published.is_published()
    }

    fn histogram(&self) -> Option<Histogram> {
        self.core.histogram()
    }
}

#[cfg(test)]
mod tests {

    // use all symbols found in the rest of this file.
    use super::*;
    use image::{Luma, Rgb};
    use std::thread;

    fn plain_config() -> BackprojectorConfig {
        BackprojectorConfig::new(ColorSpace::Rgb, [4, 4])
            .with_ranges([[0.0, 100.0], [0.0, 100.0]])
            .with_median_radius(0)
    }

    #[test]
    fn test_config_defaults_follow_color_space() {
        let yuv = BackprojectorConfig::new(ColorSpace::Yuv, [16, 16]);
        assert_eq!(yuv.channels(), [1, 2]);
        let hsv = BackprojectorConfig::new(ColorSpace::Hsv, [16, 16]);
        assert_eq!(hsv.layout().unwrap().ranges, [[0.0, 180.0], [0.0, 256.0]]);
        let custom = hsv.with_channels([1, 2]);
        assert_eq!(custom.channels(), [1, 2]);
    }

    #[test]
    fn test_bad_channels_rejected() {
        let config = plain_config().with_channels([0, 3]);
        assert!(HistogramBackprojector::new(config).is_err());
    }

    #[test]
    fn test_untrained_stage_returns_zeros() {
        let stage = HistogramBackprojector::new(plain_config()).unwrap();
        assert!(!stage.is_ready());
        let map = stage.backproject(&RgbImage::new(6, 5)).unwrap();
        assert_eq!(map.dimensions(), (6, 5));
        assert!(map.iter().all(|v| *v == 0.0));
    }

    #[test]
    fn test_histogram_stage_scores_training_colour() {
        let stage = HistogramBackprojector::new(plain_config()).unwrap();
        let frame = RgbImage::from_fn(10, 10, |x, _| {
            if x < 5 {
                Rgb([30, 30, 0])
            } else {
                Rgb([90, 10, 0])
            }
        });
        let mask = GrayImage::from_fn(10, 10, |x, _| Luma([if x < 5 { 1 } else { 0 }]));
        stage.fit(&frame, Some(&mask)).unwrap();
        assert!(stage.is_ready());

        let map = stage.backproject(&frame).unwrap();
        assert_eq!(map.get_pixel(0, 0)[0], 1.0);
        assert_eq!(map.get_pixel(9, 9)[0], 0.0);
    }

    #[test]
    fn test_update_before_fit_acts_as_fit() {
        let stage = HistogramBackprojector::new(plain_config()).unwrap();
        let frame = RgbImage::from_pixel(4, 4, Rgb([30, 30, 0]));
        stage.update(&frame, None, 0.1).unwrap();
        assert_eq!(stage.histogram().unwrap().total_mass(), 16.0);
    }

    #[test]
    fn test_failed_update_keeps_previous_model() {
        let stage = HistogramBackprojector::new(plain_config()).unwrap();
        let frame = RgbImage::from_pixel(4, 4, Rgb([30, 30, 0]));
        stage.fit(&frame, None).unwrap();
        let before = stage.lookup().unwrap();

        assert!(stage.update(&frame, None, 2.0).is_err());
        let bad_mask = GrayImage::new(2, 2);
        assert!(stage.update(&frame, Some(&bad_mask), 0.5).is_err());

        assert!(Arc::ptr_eq(&before, &stage.lookup().unwrap()));
    }

    #[test]
    fn test_restore_rejects_other_layout() {
        let stage = HistogramBackprojector::new(plain_config()).unwrap();
        let layout = BinLayout::new([8, 8], [[0.0, 100.0], [0.0, 100.0]]).unwrap();
        let hist = Histogram::new(layout, [0, 1]).unwrap();
        assert!(matches!(
            stage.restore_histogram(hist),
            Err(DensityError::LayoutMismatch)
        ));
    }

    #[test]
    fn test_gmm_stage_publishes_model_and_grid() {
        let stage = GmmBackprojector::new(plain_config(), GmmSettings::default()).unwrap();
        assert!(stage.model().is_none());

        let frame = RgbImage::from_fn(12, 12, |x, y| Rgb([(20 + x) as u8, (60 + y) as u8, 0]));
        stage.fit(&frame, None).unwrap();

        assert!(stage.is_ready());
        assert_eq!(stage.model().unwrap().components().len(), 4);
        let map = stage.backproject(&frame).unwrap();
        assert!(map.iter().all(|v| (0.0..=1.0).contains(v)));
        assert!(map.iter().cloned().fold(0.0f32, f32::max) > 0.5);
    }

    #[test]
    fn test_gmm_stage_empty_mask_falls_back_to_zeros() {
        let stage = GmmBackprojector::new(plain_config(), GmmSettings::default()).unwrap();
        let frame = RgbImage::from_pixel(8, 8, Rgb([30, 30, 0]));
        stage.fit(&frame, None).unwrap();
        assert!(stage.model().is_some());

        let empty = GrayImage::new(8, 8);
        stage.fit(&frame, Some(&empty)).unwrap();
        assert!(stage.is_ready());
        assert!(stage.model().is_none());
        assert!(stage.backproject(&frame).unwrap().iter().all(|v| *v == 0.0));

        // an empty update on an empty accumulator stays flat too
        stage.update(&frame, Some(&empty), 0.5).unwrap();
        assert!(stage.backproject(&frame).unwrap().iter().all(|v| *v == 0.0));
    }

    #[test]
    fn test_restore_model_drops_stale_histogram() {
        let stage = GmmBackprojector::new(plain_config(), GmmSettings::default()).unwrap();
        let red = RgbImage::from_pixel(6, 6, Rgb([90, 10, 0]));
        let green = RgbImage::from_pixel(6, 6, Rgb([10, 90, 0]));
        stage.fit(&red, None).unwrap();

        let other = GmmBackprojector::new(plain_config(), GmmSettings::default()).unwrap();
        other.fit(&green, None).unwrap();
        let model = (*other.model().unwrap()).clone();

        stage.restore_model(model).unwrap();
        assert!(stage.histogram().is_none());
        assert!(stage.backproject(&green).unwrap().get_pixel(0, 0)[0] > 0.99);

        // nothing of the red training survives into the next update
        stage.update(&green, None, 0.1).unwrap();
        assert_eq!(stage.histogram().unwrap().total_mass(), 36.0);
        assert_eq!(stage.backproject(&red).unwrap().get_pixel(0, 0)[0], 0.0);
    }

    #[test]
    fn test_bayes_stage_untrained_and_trained() {
        let stage = BayesBackprojector::new(plain_config(), BayesSettings::default()).unwrap();
        let frame = RgbImage::from_fn(8, 8, |x, _| {
            if x < 2 {
                Rgb([30, 30, 0])
            } else {
                Rgb([90, 10, 0])
            }
        });
        let untrained = stage.posterior(&frame).unwrap();
        assert_eq!(untrained.clamped, 0);
        assert!(untrained.map.iter().all(|v| *v == 0.0));

        let mask = GrayImage::from_fn(8, 8, |x, _| Luma([if x < 2 { 255 } else { 0 }]));
        stage.fit(&frame, Some(&mask)).unwrap();
        let map = stage.backproject(&frame).unwrap();
        // target colour covers a quarter of the frame
        assert!((map.get_pixel(0, 0)[0] - 2.0).abs() < 1e-5);
        assert_eq!(map.get_pixel(7, 7)[0], 0.0);
    }

    #[test]
    fn test_retraining_while_scoring() {
        let stage = Arc::new(HistogramBackprojector::new(plain_config()).unwrap());
        let a = RgbImage::from_pixel(16, 16, Rgb([10, 10, 0]));
        let b = RgbImage::from_pixel(16, 16, Rgb([90, 90, 0]));
        stage.fit(&a, None).unwrap();

        let trainer = {
            let stage = Arc::clone(&stage);
            let (a, b) = (a.clone(), b.clone());
            thread::spawn(move || {
                for i in 0..50 {
                    let frame = if i % 2 == 0 { &b } else { &a };
                    stage.fit(frame, None).unwrap();
                }
            })
        };

        // every map is uniform: scored entirely by one snapshot or the other
        for _ in 0..50 {
            let map = stage.backproject(&a).unwrap();
            let first = map.get_pixel(0, 0)[0];
            assert!(first == 0.0 || first == 1.0);
            assert!(map.iter().all(|v| *v == first));
        }
        trainer.join().unwrap();
    }
}
