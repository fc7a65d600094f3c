use anyhow::{anyhow, Context, Result};
use image::codecs::jpeg::JpegEncoder;
use image::{DynamicImage, ExtendedColorType, ImageEncoder, ImageFormat, ImageReader, Rgb, RgbImage};
use std::io::Cursor;

use crate::core::types::TargetFormat;

/// Decode/encode capability used by the local conversion strategies.
///
/// Implementations must be cheap to share; strategies hold them behind `Arc`.
pub trait ImageCodec: Send + Sync {
    /// Decode bytes, using the declared MIME type first and content sniffing second
    fn decode(&self, bytes: &[u8], mime_hint: Option<&str>) -> Result<DynamicImage>;

    /// Encode an opaque RGB raster into the target format
    fn encode(&self, pixels: &RgbImage, format: TargetFormat, quality: f32) -> Result<Vec<u8>>;
}

/// `image`-crate backed codec
#[derive(Debug, Clone, Copy, Default)]
pub struct RasterCodec;

impl ImageCodec for RasterCodec {
    fn decode(&self, bytes: &[u8], mime_hint: Option<&str>) -> Result<DynamicImage> {
        let declared = mime_hint
            .map(|m| m.split(';').next().unwrap_or(m).trim())
            .and_then(ImageFormat::from_mime_type);

        if let Some(format) = declared {
            if let Ok(img) = image::load_from_memory_with_format(bytes, format) {
                return Ok(img);
            }
        }

        ImageReader::new(Cursor::new(bytes))
            .with_guessed_format()
            .context("Failed to sniff image format")?
            .decode()
            .context("Failed to decode image")
    }

    fn encode(&self, pixels: &RgbImage, format: TargetFormat, quality: f32) -> Result<Vec<u8>> {
        let mut out = Vec::new();
        let (width, height) = pixels.dimensions();
        match format {
            TargetFormat::Jpeg => {
                JpegEncoder::new_with_quality(&mut out, jpeg_quality(quality))
                    .write_image(pixels.as_raw(), width, height, ExtendedColorType::Rgb8)
                    .context("Failed to encode JPEG")?;
            }
            TargetFormat::WebP => {
                let encoded = webp::Encoder::from_rgb(pixels.as_raw(), width, height)
                    .encode_simple(false, webp_quality(quality))
                    .map_err(|e| anyhow!("Failed to encode WebP: {:?}", e))?;
                out.extend_from_slice(&encoded);
            }
        }
        Ok(out)
    }
}

/// Map a 0..1 quality onto the JPEG 1..=100 scale
pub fn jpeg_quality(quality: f32) -> u8 {
    (quality.clamp(0.0, 1.0) * 100.0).round().clamp(1.0, 100.0) as u8
}

/// Map a 0..1 quality onto the libwebp 0..100 scale
pub fn webp_quality(quality: f32) -> f32 {
    (quality.clamp(0.0, 1.0) * 100.0).max(1.0)
}

/// Flatten an image onto an opaque white background.
///
/// Every encode goes through this so transparent regions never turn black in
/// formats without alpha.
pub fn composite_on_white(img: &DynamicImage) -> RgbImage {
    let rgba = img.to_rgba8();
    let (width, height) = rgba.dimensions();
    let mut out = RgbImage::from_pixel(width, height, Rgb([255, 255, 255]));
    for (x, y, px) in rgba.enumerate_pixels() {
        let alpha = px[3] as f32 / 255.0;
        out.put_pixel(
            x,
            y,
            Rgb([
                blend(px[0], 255, alpha),
                blend(px[1], 255, alpha),
                blend(px[2], 255, alpha),
            ]),
        );
    }
    out
}

fn blend(fg: u8, bg: u8, alpha: f32) -> u8 {
    (fg as f32 * alpha + bg as f32 * (1.0 - alpha)).round() as u8
}

/// PNG bytes for a solid-colour image
#[cfg(test)]
pub fn solid_png(width: u32, height: u32, rgba: [u8; 4]) -> Result<Vec<u8>> {
    let img = DynamicImage::ImageRgba8(image::RgbaImage::from_pixel(width, height, image::Rgba(rgba)));
    let mut png_bytes = Vec::new();
    img.write_to(&mut Cursor::new(&mut png_bytes), ImageFormat::Png)
        .context("Failed to encode image as PNG")?;
    Ok(png_bytes)
}
