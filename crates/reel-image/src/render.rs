//! Pure resize and encode steps.

use std::io::Cursor;

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use image::imageops::FilterType;
use image::{DynamicImage, ImageFormat, Rgba, RgbaImage};
use reel_core::{Error, Fit, ImageDerivativeSpec, Result};

/// Largest width or height libwebp can encode.
pub const MAX_WEBP_DIMENSION: u32 = 16383;

/// `<label>-<width>p.webp`
pub fn file_name(label: &str, spec: &ImageDerivativeSpec) -> String {
    format!("{label}-{}p.webp", spec.width)
}

/// Reject specs that cannot produce an image before any pixels are touched.
pub fn check_spec(spec: &ImageDerivativeSpec) -> Result<()> {
    if spec.width == 0 || spec.height == 0 {
        return Err(Error::Derivative(format!("{spec}: zero dimension")));
    }
    if spec.width > MAX_WEBP_DIMENSION || spec.height > MAX_WEBP_DIMENSION {
        return Err(Error::Derivative(format!(
            "{spec}: exceeds the {MAX_WEBP_DIMENSION}px encoder limit"
        )));
    }
    Ok(())
}

/// Resize `img` to exactly the spec's dimensions.
///
/// Contain scales to fit and centres the result on a transparent canvas.
/// Cover scales to fill and crops the overflow around the centre.
pub fn resize(img: &DynamicImage, spec: &ImageDerivativeSpec) -> RgbaImage {
    match spec.fit {
        Fit::Cover => img
            .resize_to_fill(spec.width, spec.height, FilterType::Lanczos3)
            .to_rgba8(),
        Fit::Contain => {
            let fitted = img
                .resize(spec.width, spec.height, FilterType::Lanczos3)
                .to_rgba8();
            if fitted.dimensions() == (spec.width, spec.height) {
                return fitted;
            }
            let mut canvas = RgbaImage::from_pixel(spec.width, spec.height, Rgba([0, 0, 0, 0]));
            let x = (spec.width - fitted.width()) / 2;
            let y = (spec.height - fitted.height()) / 2;
            image::imageops::overlay(&mut canvas, &fitted, i64::from(x), i64::from(y));
            canvas
        }
    }
}

/// Lossy WebP with alpha.
pub fn encode_webp(img: &RgbaImage, quality: f32) -> Result<Vec<u8>> {
    let (width, height) = img.dimensions();
    if width > MAX_WEBP_DIMENSION || height > MAX_WEBP_DIMENSION {
        return Err(Error::Derivative(format!(
            "{width}x{height} exceeds the {MAX_WEBP_DIMENSION}px encoder limit"
        )));
    }
    let encoder = webp::Encoder::from_rgba(img.as_raw(), width, height);
    let memory = encoder
        .encode_simple(false, quality.clamp(0.0, 100.0))
        .map_err(|e| Error::Derivative(format!("webp encoding failed: {e:?}")))?;
    Ok(memory.to_vec())
}

/// PNG as a `data:` URI.
pub fn encode_data_uri(img: &RgbaImage) -> Result<String> {
    let mut buf = Cursor::new(Vec::new());
    DynamicImage::ImageRgba8(img.clone())
        .write_to(&mut buf, ImageFormat::Png)
        .map_err(|e| Error::Derivative(format!("png encoding failed: {e}")))?;
    Ok(format!(
        "data:image/png;base64,{}",
        STANDARD.encode(buf.into_inner())
    ))
}
