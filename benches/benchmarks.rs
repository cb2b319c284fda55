use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion};
use color_density::color_model::backproject::backproject;
use color_density::colorspace::preprocess;
use color_density::{
    BackprojectorConfig, BayesBackprojector, BayesSettings, ColorSpace, ColorStage,
    GmmBackprojector, GmmSettings, Histogram, HistogramBackprojector, MixtureModel,
};
use image::Rgb;
use image::RgbImage;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

/// RGB image to use in benchmarks. This is neither noise nor
/// similar to natural images - it's just a convenience method
/// to produce an image that's not constant.
/// Lifted from the imageproc crate.
pub fn rgb_bench_image(width: u32, height: u32, seed_a: u32, seed_b: u32) -> RgbImage {
    use std::cmp;
    let mut image = RgbImage::new(width, height);

    for y in 0..image.height() {
        for x in 0..image.width() {
            let r = (x % seed_a + y % seed_b) as u8;
            let g = 255u8 - r;
            let b = cmp::min(r, g);
            image.put_pixel(x, y, Rgb([r, g, b]));
        }
    }
    image
}

// noisy frame around two colours, so the histogram has a few busy regions
fn two_colour_frame(width: u32, height: u32) -> RgbImage {
    let mut rng = StdRng::seed_from_u64(42);
    RgbImage::from_fn(width, height, |x, _| {
        let base: [i32; 3] = if x < width / 2 { [200, 40, 40] } else { [40, 60, 190] };
        let mut px = [0u8; 3];
        for (c, b) in px.iter_mut().zip(base.iter()) {
            *c = (b + rng.gen_range(-20..=20)).clamp(0, 255) as u8;
        }
        Rgb(px)
    })
}

fn default_config() -> BackprojectorConfig {
    BackprojectorConfig::new(ColorSpace::Hls, [32, 32])
}

fn bench_histogram_fit(c: &mut Criterion) {
    let config = default_config();
    let frame = preprocess(&two_colour_frame(320, 240), config.color_space, 0);
    let layout = config.layout().unwrap();

    c.bench_function("histogram_fit_320x240", move |b| {
        b.iter(|| Histogram::from_image(layout, config.channels(), &frame, None).unwrap())
    });
}

fn bench_em_fit(c: &mut Criterion) {
    let config = default_config();
    let frame = preprocess(&two_colour_frame(320, 240), config.color_space, 0);
    let hist = Histogram::from_image(config.layout().unwrap(), config.channels(), &frame, None).unwrap();

    let mut group = c.benchmark_group("em_fit_vs_components");
    for k in [1usize, 2, 4, 8].iter() {
        let settings = GmmSettings {
            components: *k,
            ..GmmSettings::default()
        };
        group.bench_with_input(BenchmarkId::from_parameter(k), &settings, |b, settings| {
            b.iter(|| MixtureModel::from_histogram(&hist, settings).unwrap())
        });
    }
    group.finish();
}

fn bench_backproject_vs_image_size(c: &mut Criterion) {
    let stage = HistogramBackprojector::new(default_config().with_median_radius(0)).unwrap();
    stage.fit(&two_colour_frame(64, 64), None).unwrap();
    let grid = stage.lookup().unwrap();
    let channels = stage.config().channels();

    let mut group = c.benchmark_group("backproject_vs_image_size");
    for dims in [(320u32, 240u32), (640, 480), (1280, 720)].iter() {
        let frame = rgb_bench_image(dims.0, dims.1, 40, 60);
        group.bench_with_input(
            BenchmarkId::from_parameter(format!("{}x{}", dims.0, dims.1)),
            &frame,
            |b, frame| b.iter(|| backproject(frame, channels, &grid)),
        );
    }
    group.finish();
}

fn bench_stages_single_frame(c: &mut Criterion) {
    let train = two_colour_frame(160, 120);
    let frame = rgb_bench_image(320, 240, 40, 60);

    let hist = HistogramBackprojector::new(default_config()).unwrap();
    hist.fit(&train, None).unwrap();
    let bayes = BayesBackprojector::new(default_config(), BayesSettings::default()).unwrap();
    bayes.fit(&train, None).unwrap();
    let gmm = GmmBackprojector::new(default_config(), GmmSettings::default()).unwrap();
    gmm.fit(&train, None).unwrap();

    c.bench_function("stage_histogram_320x240", |b| {
        b.iter(|| hist.backproject(&frame).unwrap())
    });
    c.bench_function("stage_bayes_320x240", |b| {
        b.iter(|| bayes.backproject(&frame).unwrap())
    });
    c.bench_function("stage_gmm_320x240", |b| {
        b.iter(|| gmm.backproject(&frame).unwrap())
    });
}

// // Utility functions
fn bench_color_conversion(c: &mut Criterion) {
    let frame = rgb_bench_image(320, 240, 40, 60);
    c.bench_function("hls_convert_320x240", |b| {
        b.iter(|| ColorSpace::Hls.convert(&frame))
    });
}

criterion_group!(utils, bench_color_conversion);
criterion_group!(
    model_fitting,
    bench_histogram_fit,
    bench_em_fit,
    bench_backproject_vs_image_size,
    bench_stages_single_frame
);
criterion_main!(utils, model_fitting);
