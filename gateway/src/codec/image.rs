//! Raw image bodies (PNG, JPEG and BMP in, PNG out).

use std::io::Cursor;

use bytes::Bytes;
use image::{DynamicImage, GrayImage, ImageFormat, RgbImage, RgbaImage};

use modelgate_common::{DType, Image, PixelFormat, Tensor};

use crate::error::{GatewayError, Result};

pub const PNG_CONTENT_TYPE: &str = "image/png";

/// Decode an encoded image. Images with alpha become RGBA8, single-channel
/// images GRAY8, everything else RGB8.
pub fn decode(data: &[u8]) -> Result<Image> {
    let decoded = image::load_from_memory(data)
        .map_err(|e| GatewayError::BadRequest(format!("cannot decode image: {}", e)))?;
    from_dynamic(decoded)
}

pub fn from_dynamic(decoded: DynamicImage) -> Result<Image> {
    let (width, height) = (decoded.width(), decoded.height());
    let (format, pixels) = match decoded {
        DynamicImage::ImageLuma8(buf) => (PixelFormat::Gray8, buf.into_raw()),
        other if other.color().has_alpha() => (PixelFormat::Rgba8, other.into_rgba8().into_raw()),
        other if other.color().channel_count() == 1 => {
            (PixelFormat::Gray8, other.into_luma8().into_raw())
        }
        other => (PixelFormat::Rgb8, other.into_rgb8().into_raw()),
    };
    Ok(Image::new(format, width, height, pixels)?)
}

/// The image as an `image` crate buffer. BGR8 is reordered to RGB.
pub fn to_dynamic(image: &Image) -> Result<DynamicImage> {
    let (width, height) = (image.width(), image.height());
    let pixels = image.pixels().to_vec();
    let invalid = || GatewayError::Internal("image buffer does not match its dimensions".into());
    Ok(match image.format() {
        PixelFormat::Rgb8 => {
            DynamicImage::ImageRgb8(RgbImage::from_raw(width, height, pixels).ok_or_else(invalid)?)
        }
        PixelFormat::Bgr8 => {
            let mut pixels = pixels;
            for px in pixels.chunks_exact_mut(3) {
                px.swap(0, 2);
            }
            DynamicImage::ImageRgb8(RgbImage::from_raw(width, height, pixels).ok_or_else(invalid)?)
        }
        PixelFormat::Rgba8 => {
            DynamicImage::ImageRgba8(RgbaImage::from_raw(width, height, pixels).ok_or_else(invalid)?)
        }
        PixelFormat::Gray8 => {
            DynamicImage::ImageLuma8(GrayImage::from_raw(width, height, pixels).ok_or_else(invalid)?)
        }
    })
}

pub fn encode_png(image: &Image) -> Result<Bytes> {
    let dynamic = to_dynamic(image)?;
    let mut buf = Cursor::new(Vec::new());
    dynamic
        .write_to(&mut buf, ImageFormat::Png)
        .map_err(|e| GatewayError::Internal(format!("cannot encode png: {}", e)))?;
    Ok(Bytes::from(buf.into_inner()))
}

/// Interpret a `u8` tensor shaped `[h, w, c]` (c = 1, 3 or 4) as an image.
pub fn image_from_tensor(tensor: &Tensor) -> Option<Image> {
    if tensor.dtype() != DType::U8 {
        return None;
    }
    let format = match tensor.shape() {
        [_, _, 1] => PixelFormat::Gray8,
        [_, _, 3] => PixelFormat::Rgb8,
        [_, _, 4] => PixelFormat::Rgba8,
        _ => return None,
    };
    Image::from_tensor(tensor, format).ok()
}
