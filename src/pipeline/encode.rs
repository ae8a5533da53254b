//! Image encoding: rendered page → PNG bytes → base64 `ImageData`.
//!
//! Pages are encoded to PNG once, inside the render thread. The same bytes
//! are stored in the blob store and, base64-wrapped, sent to the vision
//! model. Lossless PNG keeps small price digits legible.

use base64::{engine::general_purpose::STANDARD, Engine as _};
use edgequake_llm::ImageData;
use image::DynamicImage;
use std::io::Cursor;
use tracing::debug;

/// Encode a rasterised page as PNG.
pub fn encode_png(img: &DynamicImage) -> Result<Vec<u8>, image::ImageError> {
    let mut buf = Vec::new();
    img.write_to(&mut Cursor::new(&mut buf), image::ImageFormat::Png)?;
    debug!("Encoded page → {} bytes PNG", buf.len());
    Ok(buf)
}

/// Wrap PNG bytes for the vision API.
///
/// `detail: "high"` keeps the full tile budget; fine print such as unit
/// prices is lost at the low setting.
pub fn image_data(png: &[u8]) -> ImageData {
    ImageData::new(STANDARD.encode(png), "image/png").with_detail("high")
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{Rgba, RgbaImage};

    #[test]
    fn encode_small_image() {
        let img = DynamicImage::ImageRgba8(RgbaImage::from_pixel(10, 10, Rgba([255, 0, 0, 255])));
        let png = encode_png(&img).expect("encode should succeed");
        assert!(png.starts_with(&[0x89, b'P', b'N', b'G']));

        let data = image_data(&png);
        assert_eq!(data.mime_type, "image/png");
        let decoded = STANDARD.decode(&data.data).expect("valid base64");
        assert_eq!(decoded, png);
    }
}
