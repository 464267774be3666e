//! Image to tensor conversion: resize, center crop, normalize, lay out.

use async_trait::async_trait;
use image::imageops::FilterType;
use image::DynamicImage;
use ndarray::{Array3, Axis};

use modelgate_common::{DType, Dim, FieldSpec, Image, Record, Schema, Tensor, Value};

use crate::codec;
use crate::config::{ColorOrder, ImageStepConfig, Interpolation, Size, TensorLayout};
use crate::error::{GatewayError, Result};
use crate::stage::{RequestContext, Stage};

/// Produces an `f32` tensor whose shape depends only on configuration:
/// `[1, C, H, W]` / `[1, H, W, C]`, without the leading 1 when `batch_dim`
/// is off.
pub struct ImageLoadingStage {
    config: ImageStepConfig,
    schema_in: Schema,
    schema_out: Schema,
}

impl ImageLoadingStage {
    pub fn new(config: ImageStepConfig) -> Self {
        let shape = output_shape(&config)
            .map(|dims| dims.into_iter().map(Dim::Fixed).collect())
            .unwrap_or_default();
        Self {
            schema_in: Schema::new(vec![FieldSpec::new(config.input.clone(), config.input_kind)]),
            schema_out: Schema::new(vec![FieldSpec::tensor(config.output.clone())
                .with_dtype(DType::F32)
                .with_shape(shape)]),
            config,
        }
    }

    fn source_image(&self, input: &Record) -> Result<Image> {
        match input.get(&self.config.input) {
            Some(Value::Image(image)) => Ok(image.clone()),
            Some(Value::Bytes(bytes)) => codec::image::decode(bytes),
            Some(other) => Err(GatewayError::SchemaMismatch(format!(
                "field '{}': expected image or bytes, got {}",
                self.config.input,
                other.kind()
            ))),
            None => Err(GatewayError::BadRequest(format!(
                "missing required field '{}'",
                self.config.input
            ))),
        }
    }
}

fn output_shape(config: &ImageStepConfig) -> Option<Vec<usize>> {
    let size = config.output_size()?;
    let (h, w, c) = (size.height as usize, size.width as usize, config.color.channels());
    let mut shape = match config.layout {
        TensorLayout::Nchw => vec![c, h, w],
        TensorLayout::Nhwc => vec![h, w, c],
    };
    if config.batch_dim {
        shape.insert(0, 1);
    }
    Some(shape)
}

#[async_trait]
impl Stage for ImageLoadingStage {
    fn name(&self) -> &str {
        &self.config.name
    }

    fn kind(&self) -> &'static str {
        "image"
    }

    fn schema_in(&self) -> &Schema {
        &self.schema_in
    }

    fn schema_out(&self) -> &Schema {
        &self.schema_out
    }

    async fn apply(&self, input: &Record, _ctx: &RequestContext) -> Result<Record> {
        let image = self.source_image(input)?;
        let tensor = to_tensor(&self.config, &image)?;
        Ok(Record::new().with(self.config.output.clone(), tensor)?)
    }
}

fn filter(interpolation: Interpolation) -> FilterType {
    match interpolation {
        Interpolation::Bilinear => FilterType::Triangle,
        Interpolation::Nearest => FilterType::Nearest,
    }
}

fn center_crop(image: DynamicImage, crop: Size) -> Result<DynamicImage> {
    let (width, height) = (image.width(), image.height());
    if crop.width > width || crop.height > height {
        return Err(GatewayError::SchemaMismatch(format!(
            "cannot crop {}x{} from {}x{} image",
            crop.width, crop.height, width, height
        )));
    }
    let x = (width - crop.width) / 2;
    let y = (height - crop.height) / 2;
    Ok(image.crop_imm(x, y, crop.width, crop.height))
}

/// Run the configured preprocessing on one image.
pub fn to_tensor(config: &ImageStepConfig, image: &Image) -> Result<Tensor> {
    let mut dynamic = codec::image::to_dynamic(image)?;
    if let Some(size) = config.resize {
        dynamic = dynamic.resize_exact(size.width, size.height, filter(config.interpolation));
    }
    if let Some(crop) = config.crop {
        dynamic = center_crop(dynamic, crop)?;
    }

    let (width, height) = (dynamic.width() as usize, dynamic.height() as usize);
    let channels = config.color.channels();
    let raw = match config.color {
        ColorOrder::Rgb => dynamic.into_rgb8().into_raw(),
        ColorOrder::Bgr => {
            let mut raw = dynamic.into_rgb8().into_raw();
            for px in raw.chunks_exact_mut(3) {
                px.swap(0, 2);
            }
            raw
        }
        ColorOrder::Gray => dynamic.into_luma8().into_raw(),
    };

    let hwc = Array3::from_shape_vec((height, width, channels), raw)
        .map_err(|e| GatewayError::Internal(format!("pixel buffer shape: {}", e)))?;
    let mut hwc = hwc.mapv(|v| v as f32 * config.scale);
    for (c, mut plane) in hwc.axis_iter_mut(Axis(2)).enumerate() {
        let mean = per_channel(&config.mean, c, 0.0);
        let std = per_channel(&config.std, c, 1.0);
        plane.mapv_inplace(|v| (v - mean) / std);
    }

    let (values, mut shape): (Vec<f32>, Vec<usize>) = match config.layout {
        TensorLayout::Nhwc => (hwc.iter().copied().collect(), vec![height, width, channels]),
        TensorLayout::Nchw => {
            let chw = hwc.permuted_axes([2, 0, 1]);
            (chw.iter().copied().collect(), vec![channels, height, width])
        }
    };
    if config.batch_dim {
        shape.insert(0, 1);
    }
    Ok(Tensor::from_f32(shape, &values)?)
}

/// A one-value list applies to every channel; an empty list means `default`.
fn per_channel(values: &[f32], channel: usize, default: f32) -> f32 {
    match values {
        [] => default,
        [single] => *single,
        many => many.get(channel).copied().unwrap_or(default),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use modelgate_common::{PixelFormat, ValueKind};
    use std::time::Duration;

    fn config(layout: TensorLayout) -> ImageStepConfig {
        ImageStepConfig {
            name: "load".into(),
            input: "image".into(),
            input_kind: ValueKind::Image,
            output: "image_tensor".into(),
            layout,
            resize: Some(Size { width: 4, height: 2 }),
            crop: None,
            interpolation: Interpolation::Nearest,
            color: ColorOrder::Rgb,
            scale: 1.0,
            mean: vec![],
            std: vec![],
            batch_dim: true,
        }
    }

    /// 4x2 image whose red channel counts pixels, green is 100, blue 200.
    fn gradient() -> Image {
        let mut pixels = Vec::new();
        for i in 0..8u8 {
            pixels.extend_from_slice(&[i, 100, 200]);
        }
        Image::new(PixelFormat::Rgb8, 4, 2, pixels).unwrap()
    }

    #[test]
    fn test_nhwc_layout() {
        let tensor = to_tensor(&config(TensorLayout::Nhwc), &gradient()).unwrap();
        assert_eq!(tensor.shape(), &[1, 2, 4, 3]);
        let values = tensor.to_f32_vec().unwrap();
        assert_eq!(&values[..6], &[0.0, 100.0, 200.0, 1.0, 100.0, 200.0]);
    }

    #[test]
    fn test_nchw_layout() {
        let tensor = to_tensor(&config(TensorLayout::Nchw), &gradient()).unwrap();
        assert_eq!(tensor.shape(), &[1, 3, 2, 4]);
        let values = tensor.to_f32_vec().unwrap();
        assert_eq!(&values[..8], &[0.0, 1.0, 2.0, 3.0, 4.0, 5.0, 6.0, 7.0]);
        assert!(values[8..16].iter().all(|v| *v == 100.0));
    }

    #[test]
    fn test_normalization_per_channel() {
        let mut config = config(TensorLayout::Nhwc);
        config.scale = 1.0 / 255.0;
        config.mean = vec![0.0, 100.0 / 255.0, 0.0];
        config.std = vec![1.0, 1.0, 0.5];
        let values = to_tensor(&config, &gradient()).unwrap().to_f32_vec().unwrap();
        assert!(values[1].abs() < 1e-6);
        assert!((values[2] - 2.0 * 200.0 / 255.0).abs() < 1e-6);
    }

    #[test]
    fn test_resize_and_center_crop() {
        let mut config = config(TensorLayout::Nhwc);
        config.resize = Some(Size { width: 8, height: 4 });
        config.crop = Some(Size { width: 2, height: 2 });
        config.batch_dim = false;
        let tensor = to_tensor(&config, &gradient()).unwrap();
        assert_eq!(tensor.shape(), &[2, 2, 3]);
    }

    #[test]
    fn test_bgr_and_gray() {
        let mut bgr = config(TensorLayout::Nhwc);
        bgr.color = ColorOrder::Bgr;
        let values = to_tensor(&bgr, &gradient()).unwrap().to_f32_vec().unwrap();
        assert_eq!(&values[..3], &[200.0, 100.0, 0.0]);

        let mut gray = config(TensorLayout::Nchw);
        gray.color = ColorOrder::Gray;
        assert_eq!(to_tensor(&gray, &gradient()).unwrap().shape(), &[1, 1, 2, 4]);
    }

    #[tokio::test]
    async fn test_output_matches_declared_schema() {
        let mut config = config(TensorLayout::Nchw);
        config.resize = Some(Size { width: 16, height: 16 });
        let stage = ImageLoadingStage::new(config);
        let input = Record::new().with("image", gradient()).unwrap();
        let output = stage
            .apply(&input, &RequestContext::new(Duration::from_secs(1)))
            .await
            .unwrap();
        stage.schema_out().validate(&output).unwrap();
        assert_eq!(
            output.get("image_tensor").and_then(Value::as_tensor).unwrap().shape(),
            &[1, 3, 16, 16]
        );
    }

    #[tokio::test]
    async fn test_bytes_input_is_decoded() {
        let mut config = config(TensorLayout::Nhwc);
        config.input_kind = ValueKind::Bytes;
        let stage = ImageLoadingStage::new(config);
        let png = codec::image::encode_png(&gradient()).unwrap();
        let input = Record::new().with("image", Value::Bytes(png)).unwrap();
        let output = stage
            .apply(&input, &RequestContext::new(Duration::from_secs(1)))
            .await
            .unwrap();
        assert_eq!(
            output.get("image_tensor").and_then(Value::as_tensor).unwrap().shape(),
            &[1, 2, 4, 3]
        );
    }
}
