use super::lookup::LookupGrid;
use image::{ImageBuffer, Luma, RgbImage};
#[cfg(feature = "parallel")]
use rayon::prelude::*;

// per-pixel likelihood image, one `f32` per pixel
pub type LikelihoodMap = ImageBuffer<Luma<f32>, Vec<f32>>;

fn fill_row(src: &[u8], channels: [usize; 2], grid: &LookupGrid, dst: &mut [f32]) {
    let [a, b] = channels;
    for (pixel, out) in src.chunks_exact(3).zip(dst.iter_mut()) {
        *out = grid.lookup(pixel[a] as f32, pixel[b] as f32);
    }
}

// maps every pixel of a preprocessed frame through `grid`; out-of-range
// channel values use the nearest edge cell
pub fn backproject(image: &RgbImage, channels: [usize; 2], grid: &LookupGrid) -> LikelihoodMap {
    let (width, height) = image.dimensions();
    let mut map = LikelihoodMap::new(width, height);
    if width == 0 || height == 0 {
        return map;
    }

    let src_stride = width as usize * 3;
    let dst_stride = width as usize;
    let src: &[u8] = image.as_raw();

    #[cfg(feature = "parallel")]
    {
        map.par_chunks_mut(dst_stride)
            .zip(src.par_chunks(src_stride))
            .for_each(|(dst, row)| fill_row(row, channels, grid, dst));
    }
    #[cfg(not(feature = "parallel"))]
    {
        for (dst, row) in map.chunks_mut(dst_stride).zip(src.chunks(src_stride)) {
            fill_row(row, channels, grid, dst);
        }
    }

    return map;
}
