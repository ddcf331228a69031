//! Page image preparation: resize, PNG-encode, and data-URI wrapping.
//!
//! PNG is used because it is lossless; compression artefacts on small print
//! hurt recognition far more than the extra bytes cost.

use base64::{engine::general_purpose::STANDARD, Engine as _};
use image::DynamicImage;
use std::io::Cursor;
use tracing::debug;

/// Shrink `img` so its longest edge is at most `max_edge`, keeping aspect.
///
/// Images already within bounds are returned unchanged (never upscaled).
pub fn fit_within(img: DynamicImage, max_edge: u32) -> DynamicImage {
    let (w, h) = (img.width(), img.height());
    if w.max(h) <= max_edge {
        return img;
    }
    let resized = img.resize(max_edge, max_edge, image::imageops::FilterType::Lanczos3);
    debug!(
        "Resized page {}x{} → {}x{}",
        w,
        h,
        resized.width(),
        resized.height()
    );
    resized
}

/// Encode as PNG bytes.
pub fn encode_png(img: &DynamicImage) -> Result<Vec<u8>, image::ImageError> {
    let mut buf = Vec::new();
    img.write_to(&mut Cursor::new(&mut buf), image::ImageFormat::Png)?;
    Ok(buf)
}

/// `data:<mime>;base64,<payload>` for embedding in a JSON request body.
pub fn data_uri(bytes: &[u8], mime_type: &str) -> String {
    format!("data:{};base64,{}", mime_type, STANDARD.encode(bytes))
}
