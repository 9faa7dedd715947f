//! Normalizes the caller's raw pixel buffer into `f32` working planes.
//!
//! Multi-channel data is stored planar: all R samples, then G, then B.
//! Only the first (luminance) plane is read, except by `downsample` which
//! averages every channel over each block.

use anyhow::{bail, Result};
use ndarray::Array2;

use crate::model::{SampleType, Statistic, SubFrame};

trait Sample {
    const SIZE: usize;
    fn read(bytes: &[u8]) -> f64;
    fn write(value: f64, out: &mut Vec<u8>);
}

macro_rules! impl_sample {
    ($ty:ty) => {
        impl Sample for $ty {
            const SIZE: usize = std::mem::size_of::<$ty>();

            #[inline(always)]
            fn read(bytes: &[u8]) -> f64 {
                <$ty>::from_ne_bytes(bytes.try_into().unwrap()) as f64
            }

            #[inline(always)]
            fn write(value: f64, out: &mut Vec<u8>) {
                out.extend_from_slice(&(value as $ty).to_ne_bytes());
            }
        }
    };
}

impl_sample!(u8);
impl_sample!(i16);
impl_sample!(u16);
impl_sample!(i32);
impl_sample!(u32);
impl_sample!(f32);
impl_sample!(f64);

fn read_rect<T: Sample>(stats: &Statistic, buffer: &[u8], rect: SubFrame) -> Array2<f32> {
    let stride = stats.width as usize;
    let mut plane = Array2::<f32>::zeros((rect.height as usize, rect.width as usize));
    for row in 0..rect.height as usize {
        let src_row = rect.y as usize + row;
        for col in 0..rect.width as usize
        {
            let src_col = rect.x as usize + col;
            let idx = (src_row * stride + src_col) * T::SIZE;
            plane[[row, col]] = T::read(&buffer[idx..idx + T::SIZE]) as f32;
        }
    }
    plane
}

/// Extract the luminance plane over `rect` as `f32`, row-major.
pub fn float_plane(stats: &Statistic, buffer: &[u8], rect: SubFrame) -> Result<Array2<f32>> {
    if !rect.fits_within(stats) {
        bail!(
            "sub-rect {}x{}+{}+{} exceeds image {}x{}",
            rect.width, rect.height, rect.x, rect.y, stats.width, stats.height
        );
    }
    Ok(match stats.sample_type {
        SampleType::U8 => read_rect::<u8>(stats, buffer, rect),
        SampleType::I16 => read_rect::<i16>(stats, buffer, rect),
        SampleType::U16 => read_rect::<u16>(stats, buffer, rect),
        SampleType::I32 => read_rect::<i32>(stats, buffer, rect),
        SampleType::U32 => read_rect::<u32>(stats, buffer, rect),
        SampleType::F32 => read_rect::<f32>(stats, buffer, rect),
        SampleType::F64 => read_rect::<f64>(stats, buffer, rect),
    })
}

fn downsample_typed<T: Sample>(stats: &Statistic, buffer: &[u8], d: usize) -> Vec<u8> {
    let w = stats.width as usize;
    let h = stats.height as usize;
    let channels = stats.channels as usize;
    let plane_len = w * h;
    let out_w = w / d;
    let out_h = h / d;
    let mut out = Vec::with_capacity(out_w * out_h * T::SIZE);

    for oy in 0..out_h {
        for ox in 0..out_w {
            let mut total = 0.0f64;
            for c in 0..channels {
                let plane = c * plane_len;
                for dy in 0..d {
                    let row = (oy * d + dy) * w + ox * d;
                    for dx in 0..d {
                        let idx = (plane + row + dx) * T::SIZE;
                        total += T::read(&buffer[idx..idx + T::SIZE]);
                    }
                }
            }
            T::write(total / (d * d * channels) as f64, &mut out);
        }
    }
    out
}

/// Block-average the image by integer factor `d`, producing a mono buffer
/// of the same sample type with floor-divided dimensions. Channels are
/// averaged into the blocks. An arcsec-per-pixel scale hint must be
/// multiplied by `d` to stay valid on the result.
pub fn downsample(stats: &Statistic, buffer: &[u8], d: u32) -> Result<(Statistic, Vec<u8>)> {
    let d = d as usize;
    if d < 2 {
        bail!("downsample factor must be >= 2, got {}", d);
    }
    if stats.width as usize / d == 0 || stats.height as usize / d == 0 {
        bail!(
            "downsample factor {} leaves no pixels of a {}x{} image",
            d, stats.width, stats.height
        );
    }
    let out = match stats.sample_type {
        SampleType::U8 => downsample_typed::<u8>(stats, buffer, d),
        SampleType::I16 => downsample_typed::<i16>(stats, buffer, d),
        SampleType::U16 => downsample_typed::<u16>(stats, buffer, d),
        SampleType::I32 => downsample_typed::<i32>(stats, buffer, d),
        SampleType::U32 => downsample_typed::<u32>(stats, buffer, d),
        SampleType::F32 => downsample_typed::<f32>(stats, buffer, d),
        SampleType::F64 => downsample_typed::<f64>(stats, buffer, d),
    };
    let new_stats = Statistic::new(
        stats.width / d as u32,
        stats.height / d as u32,
        1,
        stats.sample_type,
    );
    Ok((new_stats, out))
}
