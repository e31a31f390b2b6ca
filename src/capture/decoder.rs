use jpeg_decoder::Decoder;

use super::backend::CaptureError;
use super::frame::PixelFormat;

/// Decodes a captured buffer into packed RGB24.
pub fn decode_to_rgb(data: &[u8], format: PixelFormat) -> Result<Vec<u8>, CaptureError> {
    match format {
        PixelFormat::Rgb24 => Ok(data.to_vec()),
        PixelFormat::Mjpeg => {
            let mut decoder = Decoder::new(data);
            decoder
                .decode()
                .map_err(|e| CaptureError::Decode(format!("jpeg: {e}")))
        }
        PixelFormat::Yuyv4 => Ok(yuyv_to_rgb(data)),
    }
}

/// YUYV 4:2:2 to RGB24, BT.601 integer approximation.
fn yuyv_to_rgb(data: &[u8]) -> Vec<u8> {
    let mut rgb = Vec::with_capacity(data.len() / 2 * 3);
    for chunk in data.chunks_exact(4) {
        let (y0, u, y1, v) = (chunk[0], chunk[1], chunk[2], chunk[3]);
        for y in [y0, y1] {
            let c = y as i32 - 16;
            let d = u as i32 - 128;
            let e = v as i32 - 128;
            rgb.push(clamp8((298 * c + 409 * e + 128) >> 8));
            rgb.push(clamp8((298 * c - 100 * d - 208 * e + 128) >> 8));
            rgb.push(clamp8((298 * c + 516 * d + 128) >> 8));
        }
    }
    rgb
}

fn clamp8(v: i32) -> u8 {
    v.clamp(0, 255) as u8
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rgb_passthrough() {
        let data = [1u8, 2, 3, 4, 5, 6];
        let out = decode_to_rgb(&data, PixelFormat::Rgb24).unwrap();
        assert_eq!(out, data);
    }

    #[test]
    fn yuyv_gray_midpoint() {
        // Y=128, U=V=128 decodes to a neutral gray
        let out = decode_to_rgb(&[128, 128, 128, 128], PixelFormat::Yuyv4).unwrap();
        assert_eq!(out.len(), 6);
        for v in out {
            assert!((125..=135).contains(&v), "expected gray, got {v}");
        }
    }

    #[test]
    fn jpeg_roundtrip_decodes() {
        // Encode a tiny RGB image with the `image` crate, decode it back here
        let mut jpeg = Vec::new();
        let pixels = vec![200u8; 8 * 8 * 3];
        image::codecs::jpeg::JpegEncoder::new_with_quality(&mut jpeg, 90)
            .encode(&pixels, 8, 8, image::ExtendedColorType::Rgb8)
            .unwrap();

        let out = decode_to_rgb(&jpeg, PixelFormat::Mjpeg).unwrap();
        assert_eq!(out.len(), 8 * 8 * 3);
    }

    #[test]
    fn bad_jpeg_is_decode_error() {
        let err = decode_to_rgb(&[0u8; 16], PixelFormat::Mjpeg).unwrap_err();
        assert!(matches!(err, CaptureError::Decode(_)));
    }
}
