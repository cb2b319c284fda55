use clap::{Parser, ValueEnum};
use color_density::persist::save_json;
use color_density::{
    import_images, list_frames, to_gray, BackprojectorConfig, BayesBackprojector, BayesSettings,
    ColorSpace, ColorStage, GmmBackprojector, GmmSettings, HistogramBackprojector,
};
use log::{error, info};
use std::fs;
use std::path::PathBuf;
use std::process::ExitCode;

#[derive(Clone, Copy, Debug, ValueEnum)]
enum Mode {
    Histogram,
    Bayes,
    Gmm,
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum Space {
    Rgb,
    Hsv,
    Hls,
    Yuv,
}

impl From<Space> for ColorSpace {
    fn from(space: Space) -> ColorSpace {
        match space {
            Space::Rgb => ColorSpace::Rgb,
            Space::Hsv => ColorSpace::Hsv,
            Space::Hls => ColorSpace::Hls,
            Space::Yuv => ColorSpace::Yuv,
        }
    }
}

/// Train a colour model on one image and backproject a set of frames with it.
#[derive(Parser, Debug)]
#[command(name = "backproject")]
struct Args {
    /// Training image
    #[arg(long)]
    train: PathBuf,
    /// Optional training mask; non-zero pixels are used
    #[arg(long)]
    mask: Option<PathBuf>,
    /// Glob pattern for the frames to score
    #[arg(long)]
    frames: String,
    /// Output directory for the likelihood maps
    #[arg(long, default_value = "out")]
    out: PathBuf,
    #[arg(long, value_enum, default_value = "histogram")]
    mode: Mode,
    #[arg(long, value_enum, default_value = "hls")]
    space: Space,
    /// Bins per channel
    #[arg(long, default_value_t = 32)]
    bins: usize,
    #[arg(long, default_value_t = 2)]
    median_radius: u32,
    /// Mixture components (gmm mode)
    #[arg(long, default_value_t = 4)]
    components: usize,
    /// Blend every scored frame back into the model at this rate
    #[arg(long)]
    update_rate: Option<f64>,
    /// Save the trained histogram as JSON
    #[arg(long)]
    save_model: Option<PathBuf>,
}

fn build_stage(args: &Args) -> color_density::Result<Box<dyn ColorStage>> {
    let config = BackprojectorConfig::new(args.space.into(), [args.bins, args.bins])
        .with_median_radius(args.median_radius);
    let stage: Box<dyn ColorStage> = match args.mode {
        Mode::Histogram => Box::new(HistogramBackprojector::new(config)?),
        Mode::Bayes => Box::new(BayesBackprojector::new(config, BayesSettings::default())?),
        Mode::Gmm => {
            let settings = GmmSettings {
                components: args.components,
                ..GmmSettings::default()
            };
            Box::new(GmmBackprojector::new(config, settings)?)
        }
    };
    Ok(stage)
}

fn run(args: &Args) -> color_density::Result<()> {
    let stage = build_stage(args)?;

    let train = image::open(&args.train)?.to_rgb8();
    let mask = match &args.mask {
        Some(path) => Some(image::open(path)?.to_luma8()),
        None => None,
    };
    stage.fit(&train, mask.as_ref())?;

    if let Some(path) = &args.save_model {
        if let Some(hist) = stage.histogram() {
            save_json(&hist, path)?;
            info!("saved model histogram to {}", path.display());
        }
    }

    fs::create_dir_all(&args.out)?;
    let paths = list_frames(&args.frames)?;
    let frames = import_images(&paths)?;

    // posterior ratios run past 1; show them relative to the prior
    let scale = match args.mode {
        Mode::Bayes => 1.0 / BayesSettings::default().prior_scale,
        _ => 1.0,
    };

    for (i, frame) in frames.iter().enumerate() {
        let map = stage.backproject(frame)?;

        // add leading zeroes for easier downstream proc with ffmpeg
        let target = args.out.join(format!("backprojected_{:04}.png", i));
        to_gray(&map, scale).save(&target)?;

        if let Some(rate) = args.update_rate {
            stage.update(frame, None, rate)?;
        }
        info!("processed frame {} -> {}", i, target.display());
    }
    Ok(())
}

fn main() -> ExitCode {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();

    match run(&args) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{}", e);
            ExitCode::FAILURE
        }
    }
}
