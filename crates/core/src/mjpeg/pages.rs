use std::io::Cursor;

use bytes::Bytes;
use image::{ImageFormat, Rgba, RgbaImage};
use rand::RngExt;

use crate::error::Result;

pub const PIN_REQUEST_PATH: &str = "/pinrequest";
pub const FAVICON_PATH: &str = "/favicon.ico";
const DEFAULT_STREAM_PATH: &str = "/stream.mjpeg";

const INDEX_HTML: &str = r#"<!DOCTYPE html>
<html>
<head>
<meta charset="utf-8">
<meta name="viewport" content="width=device-width, initial-scale=1">
<title>ScreenStream</title>
<style>
html, body { margin: 0; height: 100%; background: #000; }
img { display: block; margin: auto; max-width: 100%; max-height: 100vh; }
</style>
</head>
<body>
<img id="stream" src="STREAM_ADDRESS" alt="">
<script>
var img = document.getElementById("stream");
img.onerror = function () { setTimeout(function () { img.src = "STREAM_ADDRESS?" + Date.now(); }, 1000); };
</script>
</body>
</html>
"#;

const PIN_HTML: &str = r#"<!DOCTYPE html>
<html>
<head>
<meta charset="utf-8">
<meta name="viewport" content="width=device-width, initial-scale=1">
<title>ScreenStream</title>
</head>
<body>
<h3>Stream requires PIN</h3>
<form action="PIN_REQUEST_ADDRESS" method="get">
<input type="password" name="pin" inputmode="numeric" autofocus>
<input type="submit" value="Submit">
</form>
<p>WRONG_PIN_MESSAGE</p>
</body>
</html>
"#;

const BLOCKED_HTML: &str = r#"<!DOCTYPE html>
<html>
<head><meta charset="utf-8"><title>ScreenStream</title></head>
<body><h3>Address blocked. Too many wrong PINs, try again later.</h3></body>
</html>
"#;

const ALPHANUMERIC: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789";

/// `len` random ASCII letters and digits.
pub fn random_string(len: usize) -> String {
    let mut rng = rand::rng();
    (0..len)
        .map(|_| char::from(ALPHANUMERIC[rng.random_range(0..ALPHANUMERIC.len())]))
        .collect()
}

/// Static content of one server run.
///
/// Built on start: when PIN protection is on the stream lives at a
/// random 16-character path so it cannot be guessed past the PIN page.
#[derive(Debug, Clone)]
pub struct Pages {
    pub stream_path: String,
    /// Single latest frame, `stream_path` with `.jpeg` instead of `.mjpeg`.
    pub jpeg_path: String,
    pub index: String,
    pub pin_request: String,
    pub pin_error: String,
    pub blocked: String,
    pub favicon: Bytes,
}

impl Pages {
    pub fn new(pin_enabled: bool) -> Result<Self> {
        let stream_path = if pin_enabled {
            format!("/{}.mjpeg", random_string(16))
        } else {
            DEFAULT_STREAM_PATH.to_string()
        };
        let jpeg_path = format!("{}.jpeg", stream_path.trim_end_matches(".mjpeg"));

        let pin_page = PIN_HTML.replacen("PIN_REQUEST_ADDRESS", PIN_REQUEST_PATH, 1);
        Ok(Self {
            index: INDEX_HTML.replace("STREAM_ADDRESS", &stream_path),
            pin_request: pin_page.replacen("WRONG_PIN_MESSAGE", "&nbsp;", 1),
            pin_error: pin_page.replacen("WRONG_PIN_MESSAGE", "Wrong PIN", 1),
            blocked: BLOCKED_HTML.to_string(),
            favicon: favicon()?,
            stream_path,
            jpeg_path,
        })
    }
}

/// 32x32 PNG: a dark screen outline with a play triangle.
fn favicon() -> Result<Bytes> {
    const SIZE: u32 = 32;
    let icon = RgbaImage::from_fn(SIZE, SIZE, |x, y| {
        let border = x < 2 || y < 4 || x >= SIZE - 2 || y >= SIZE - 4;
        let triangle = (11..22).contains(&x) && y.abs_diff(16) <= (22 - x) / 2;
        if border {
            Rgba([40, 40, 40, 255])
        } else if triangle {
            Rgba([76, 175, 80, 255])
        } else {
            Rgba([0, 0, 0, 0])
        }
    });
    let mut out = Cursor::new(Vec::new());
    icon.write_to(&mut out, ImageFormat::Png)?;
    Ok(Bytes::from(out.into_inner()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fixed_path_without_pin() {
        let pages = Pages::new(false).unwrap();
        assert_eq!(pages.stream_path, "/stream.mjpeg");
        assert_eq!(pages.jpeg_path, "/stream.jpeg");
        assert!(pages.index.contains(r#"src="/stream.mjpeg""#));
        assert!(!pages.index.contains("STREAM_ADDRESS"));
    }

    #[test]
    fn random_path_with_pin() {
        let a = Pages::new(true).unwrap();
        let b = Pages::new(true).unwrap();
        assert_eq!(a.stream_path.len(), 1 + 16 + ".mjpeg".len());
        assert_ne!(a.stream_path, b.stream_path);
        assert!(a.pin_error.contains("Wrong PIN"));
        assert!(!a.pin_request.contains("WRONG_PIN_MESSAGE"));
        assert!(a.pin_request.contains(r#"action="/pinrequest""#));
    }

    #[test]
    fn favicon_is_png() {
        let pages = Pages::new(false).unwrap();
        assert_eq!(&pages.favicon[1..4], b"PNG");
        let decoded =
            image::load_from_memory_with_format(&pages.favicon, ImageFormat::Png).unwrap();
        assert_eq!(decoded.width(), 32);
    }
}
