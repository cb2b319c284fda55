use image::{Rgb, RgbImage};
use imageproc::filter::median_filter;
use palette::{FromColor, Hsl, Hsv, Srgb};
use serde::{Deserialize, Serialize};

/// Colour spaces a frame can be converted into before modelling.
///
/// All conversions produce 8-bit channels. Hue is stored halved so it fits
/// into `[0, 180)`; every other channel spans `[0, 256)`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ColorSpace {
    Rgb,
    Hsv,
    Hls,
    Yuv,
}

impl ColorSpace {
    /// The two channels that carry chroma information in this space.
    pub fn default_channels(&self) -> [usize; 2] {
        match self {
            ColorSpace::Yuv => [1, 2],
            _ => [0, 1],
        }
    }

    /// Value ranges of the default channels, upper bound exclusive.
    pub fn default_ranges(&self) -> [[f32; 2]; 2] {
        match self {
            ColorSpace::Hsv | ColorSpace::Hls => [[0.0, 180.0], [0.0, 256.0]],
            ColorSpace::Rgb | ColorSpace::Yuv => [[0.0, 256.0], [0.0, 256.0]],
        }
    }

    pub fn convert_pixel(&self, pixel: &Rgb<u8>) -> Rgb<u8> {
        match self {
            ColorSpace::Rgb => *pixel,
            ColorSpace::Hsv => rgb_to_hsv(pixel),
            ColorSpace::Hls => rgb_to_hls(pixel),
            ColorSpace::Yuv => rgb_to_yuv(pixel),
        }
    }

    pub fn convert(&self, frame: &RgbImage) -> RgbImage {
        if *self == ColorSpace::Rgb {
            return frame.clone();
        }
        let mut out = RgbImage::new(frame.width(), frame.height());
        for (src, dst) in frame.pixels().zip(out.pixels_mut()) {
            *dst = self.convert_pixel(src);
        }
        return out;
    }
}

/// Converts a frame into `space` and smooths it with a square median filter.
///
/// A radius of zero skips the filter.
pub fn preprocess(frame: &RgbImage, space: ColorSpace, median_radius: u32) -> RgbImage {
    let converted = space.convert(frame);
    if median_radius == 0 {
        return converted;
    }
    median_filter(&converted, median_radius, median_radius)
}

fn to_u8(v: f32) -> u8 {
    v.round().clamp(0.0, 255.0) as u8
}

fn halved_hue(degrees: f32) -> u8 {
    // 359 degrees would otherwise round up to 180
    ((degrees / 2.0).round() as u32 % 180) as u8
}

fn to_srgb(pixel: &Rgb<u8>) -> Srgb<f32> {
    Srgb::new(
        pixel[0] as f32 / 255.0,
        pixel[1] as f32 / 255.0,
        pixel[2] as f32 / 255.0,
    )
}

fn rgb_to_hsv(pixel: &Rgb<u8>) -> Rgb<u8> {
    let hsv: Hsv = Hsv::from_color(to_srgb(pixel));
    Rgb([
        halved_hue(hsv.hue.into_positive_degrees()),
        to_u8(hsv.saturation * 255.0),
        to_u8(hsv.value * 255.0),
    ])
}

// stored in OpenCV channel order: hue, lightness, saturation
fn rgb_to_hls(pixel: &Rgb<u8>) -> Rgb<u8> {
    let hsl: Hsl = Hsl::from_color(to_srgb(pixel));
    Rgb([
        halved_hue(hsl.hue.into_positive_degrees()),
        to_u8(hsl.lightness * 255.0),
        to_u8(hsl.saturation * 255.0),
    ])
}

fn rgb_to_yuv(pixel: &Rgb<u8>) -> Rgb<u8> {
    let [r, g, b] = pixel.0.map(|c| c as f32);
    let y = 0.299 * r + 0.587 * g + 0.114 * b;
    let u = 0.492 * (b - y) + 128.0;
    let v = 0.877 * (r - y) + 128.0;
    Rgb([to_u8(y), to_u8(u), to_u8(v)])
}
