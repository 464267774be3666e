//! Decoded raster images.

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::dtype::DType;
use crate::error::ValueError;
use crate::tensor::Tensor;

/// Pixel layout of an [`Image`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PixelFormat {
    Rgb8,
    Rgba8,
    Gray8,
    Bgr8,
}

impl PixelFormat {
    pub fn channels(self) -> usize {
        match self {
            PixelFormat::Rgb8 | PixelFormat::Bgr8 => 3,
            PixelFormat::Rgba8 => 4,
            PixelFormat::Gray8 => 1,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            PixelFormat::Rgb8 => "rgb8",
            PixelFormat::Rgba8 => "rgba8",
            PixelFormat::Gray8 => "gray8",
            PixelFormat::Bgr8 => "bgr8",
        }
    }
}

impl std::fmt::Display for PixelFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A row-major 8-bit image.
#[derive(Debug, Clone, PartialEq)]
pub struct Image {
    format: PixelFormat,
    width: u32,
    height: u32,
    pixels: Bytes,
}

impl Image {
    pub fn new(
        format: PixelFormat,
        width: u32,
        height: u32,
        pixels: impl Into<Bytes>,
    ) -> Result<Self, ValueError> {
        let pixels = pixels.into();
        let expected = width as usize * height as usize * format.channels();
        if pixels.len() != expected {
            return Err(ValueError::ImageBuffer {
                width,
                height,
                expected,
                actual: pixels.len(),
            });
        }
        Ok(Self {
            format,
            width,
            height,
            pixels,
        })
    }

    /// An all-black image.
    pub fn zeroed(format: PixelFormat, width: u32, height: u32) -> Self {
        let len = width as usize * height as usize * format.channels();
        Self {
            format,
            width,
            height,
            pixels: Bytes::from(vec![0u8; len]),
        }
    }

    pub fn format(&self) -> PixelFormat {
        self.format
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn pixels(&self) -> &Bytes {
        &self.pixels
    }

    /// View as a `u8` tensor shaped `[height, width, channels]`.
    pub fn to_tensor(&self) -> Tensor {
        let shape = vec![
            self.height as usize,
            self.width as usize,
            self.format.channels(),
        ];
        // the buffer length was checked when the image was built
        Tensor::from_checked_payload(DType::U8, shape, self.pixels.clone())
    }

    /// Inverse of [`Image::to_tensor`]: a `u8` tensor shaped
    /// `[height, width, channels]` with channels matching `format`.
    pub fn from_tensor(tensor: &Tensor, format: PixelFormat) -> Result<Self, ValueError> {
        if tensor.dtype() != DType::U8 {
            return Err(ValueError::ImageTensor(format!(
                "expected u8 elements, got {}",
                tensor.dtype()
            )));
        }
        let shape = tensor.shape();
        if shape.len() != 3 || shape[2] != format.channels() {
            return Err(ValueError::ImageTensor(format!(
                "expected shape [h, w, {}], got {:?}",
                format.channels(),
                shape
            )));
        }
        let pixels = tensor
            .payload()
            .cloned()
            .ok_or(ValueError::NotNumeric(tensor.dtype()))?;
        Image::new(format, shape[1] as u32, shape[0] as u32, pixels)
    }
}
