use crate::config::Normalization;
use image::{imageops::FilterType, RgbImage};
use ndarray::{Array, Ix4};
use thiserror::Error;

pub const INPUT_SIZE: u32 = 224;
pub const CHANNELS: usize = 3;

#[derive(Error, Debug)]
pub enum DecodeError {
    #[error("empty image buffer")]
    Empty,
    #[error("unrecognised image data: {0}")]
    Format(std::io::Error),
    #[error("invalid image data: {0}")]
    Decode(#[from] image::ImageError),
    #[error("image has zero extent ({width}x{height})")]
    ZeroExtent { width: u32, height: u32 },
}

/// Decodes a raw upload into an 8-bit RGB image.
pub fn decode_image(bytes: &[u8]) -> Result<RgbImage, DecodeError> {
    if bytes.is_empty() {
        return Err(DecodeError::Empty);
    }

    let reader = image::ImageReader::new(std::io::Cursor::new(bytes))
        .with_guessed_format()
        .map_err(DecodeError::Format)?;
    let decoded = reader.decode()?.to_rgb8();

    let (width, height) = decoded.dimensions();
    if width == 0 || height == 0 {
        return Err(DecodeError::ZeroExtent { width, height });
    }

    Ok(decoded)
}

/// Resizes to 224x224 and scales into the engine's value range, NHWC with a batch axis.
pub fn preprocess(image: &RgbImage, normalization: Normalization) -> Array<f32, Ix4> {
    let resized = image::imageops::resize(image, INPUT_SIZE, INPUT_SIZE, FilterType::Triangle);
    let side = INPUT_SIZE as usize;

    let mut input = Array::zeros((1, side, side, CHANNELS));
    for (x, y, pixel) in resized.enumerate_pixels() {
        let (x, y) = (x as usize, y as usize);
        for (c, value) in pixel.0.iter().enumerate() {
            input[[0, y, x, c]] = scale(*value, normalization);
        }
    }

    input
}

fn scale(value: u8, normalization: Normalization) -> f32 {
    match normalization {
        Normalization::MobileNet => (value as f32) / 127.5 - 1.,
        Normalization::Unit => (value as f32) / 255.,
    }
}

/// Decode then preprocess, the path every uploaded view takes.
pub fn prepare_image(
    bytes: &[u8],
    normalization: Normalization,
) -> Result<Array<f32, Ix4>, DecodeError> {
    let image = decode_image(bytes)?;
    Ok(preprocess(&image, normalization))
}
