//! Shared media domain types.
//!
//! Currently this covers the structural checks used to decide whether a
//! payload fetched from a camera "looks like" a still image: leading
//! signature bytes for the common still formats, and start-of-image
//! detection inside a multipart MJPEG stream.

use memchr::memmem;

/// JPEG start-of-image marker followed by the first marker prefix.
const JPEG_SOI: [u8; 3] = [0xFF, 0xD8, 0xFF];
const PNG_SIGNATURE: [u8; 8] = [0x89, b'P', b'N', b'G', 0x0D, 0x0A, 0x1A, 0x0A];

/// Still image container detected from leading bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ImageFormat {
    Jpeg,
    Png,
    Gif,
    Bmp,
    WebP,
}

impl ImageFormat {
    /// Minimum number of leading bytes needed to tell every format apart.
    pub const SNIFF_LEN: usize = 12;

    /// Identify a still image from its leading signature bytes.
    pub fn sniff(data: &[u8]) -> Option<Self> {
        if data.starts_with(&JPEG_SOI) {
            return Some(Self::Jpeg);
        }
        if data.starts_with(&PNG_SIGNATURE) {
            return Some(Self::Png);
        }
        if data.starts_with(b"GIF87a") || data.starts_with(b"GIF89a") {
            return Some(Self::Gif);
        }
        // "BM" alone is too weak; require the 14 byte file header to be present.
        if data.len() >= 14 && data.starts_with(b"BM") {
            return Some(Self::Bmp);
        }
        if data.len() >= 12 && &data[0..4] == b"RIFF" && &data[8..12] == b"WEBP" {
            return Some(Self::WebP);
        }
        None
    }

    /// MIME type commonly used for this format.
    pub fn mime_type(&self) -> &'static str {
        match self {
            ImageFormat::Jpeg => "image/jpeg",
            ImageFormat::Png => "image/png",
            ImageFormat::Gif => "image/gif",
            ImageFormat::Bmp => "image/bmp",
            ImageFormat::WebP => "image/webp",
        }
    }
}

impl std::fmt::Display for ImageFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ImageFormat::Jpeg => "JPEG",
            ImageFormat::Png => "PNG",
            ImageFormat::Gif => "GIF",
            ImageFormat::Bmp => "BMP",
            ImageFormat::WebP => "WebP",
        };
        f.write_str(name)
    }
}

/// Offset of the first JPEG start-of-image marker in `data`, if any.
///
/// MJPEG-over-HTTP streams (`multipart/x-mixed-replace`) interleave part
/// headers with JPEG frames, so the marker is searched anywhere in the buffer.
pub fn find_jpeg_start(data: &[u8]) -> Option<usize> {
    memmem::find(data, &JPEG_SOI)
}

/// Whether the payload looks like an HTML or plain-text error page.
///
/// Cameras frequently answer with a login or error page and a `200` status.
pub fn looks_like_markup(data: &[u8]) -> bool {
    let trimmed = data
        .iter()
        .position(|b| !b.is_ascii_whitespace())
        .map(|start| &data[start..])
        .unwrap_or_default();
    let head = &trimmed[..trimmed.len().min(16)];
    let head = head.to_ascii_lowercase();
    head.starts_with(b"<!doctype")
        || head.starts_with(b"<html")
        || head.starts_with(b"<?xml")
        || head.starts_with(b"{")
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case(&[0xFF, 0xD8, 0xFF, 0xE0, 0x00, 0x10], Some(ImageFormat::Jpeg))]
    #[case(&[0x89, b'P', b'N', b'G', 0x0D, 0x0A, 0x1A, 0x0A, 0x00], Some(ImageFormat::Png))]
    #[case(b"GIF89a\x01\x00", Some(ImageFormat::Gif))]
    #[case(b"BM\x36\x00\x0c\x00\x00\x00\x00\x00\x36\x00\x00\x00", Some(ImageFormat::Bmp))]
    #[case(b"RIFF\x24\x00\x00\x00WEBPVP8 ", Some(ImageFormat::WebP))]
    #[case(b"BM", None)]
    #[case(b"<html><body>401</body></html>", None)]
    #[case(&[], None)]
    fn test_sniff(#[case] data: &[u8], #[case] expected: Option<ImageFormat>) {
        assert_eq!(ImageFormat::sniff(data), expected);
    }

    #[test]
    fn test_find_jpeg_start_in_multipart() {
        let mut body = b"--myboundary\r\nContent-Type: image/jpeg\r\nContent-Length: 4\r\n\r\n".to_vec();
        let offset = body.len();
        body.extend_from_slice(&[0xFF, 0xD8, 0xFF, 0xDB]);
        assert_eq!(find_jpeg_start(&body), Some(offset));
        assert_eq!(find_jpeg_start(b"--myboundary\r\n"), None);
    }

    #[test]
    fn test_looks_like_markup() {
        assert!(looks_like_markup(b"  \r\n<!DOCTYPE html><html>"));
        assert!(looks_like_markup(b"<HTML>"));
        assert!(looks_like_markup(b"{\"error\":\"unauthorized\"}"));
        assert!(!looks_like_markup(&[0xFF, 0xD8, 0xFF]));
        assert!(!looks_like_markup(b""));
    }

    #[test]
    fn test_display_and_mime() {
        assert_eq!(ImageFormat::Jpeg.to_string(), "JPEG");
        assert_eq!(ImageFormat::WebP.mime_type(), "image/webp");
    }
}
