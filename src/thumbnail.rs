//! Thumbnail rendering for dashboard rows.
//!
//! Content fetched from the node is decoded, scaled down to fit the given
//! bounds (never scaled up), and re-encoded - PNG stays PNG, everything
//! else becomes JPEG.

use std::io::Cursor;

use anyhow::{Context, Result};
use bytes::Bytes;
use image::{DynamicImage, ImageFormat};

/// Shrink `data` to fit within `max_w` x `max_h`, preserving aspect ratio.
///
/// Content that is not a decodable image is an error; the caller decides
/// whether that is worth more than a log line.
pub fn shrink(data: &[u8], max_w: u32, max_h: u32) -> Result<Bytes> {
    let format = image::guess_format(data).context("parsing image for thumbnail")?;
    let src = image::load_from_memory_with_format(data, format)
        .context("parsing image for thumbnail")?;

    let scaled = if src.width() > max_w || src.height() > max_h {
        src.thumbnail(max_w, max_h)
    } else {
        src
    };

    let mut out = Vec::new();
    match format {
        ImageFormat::Png => {
            scaled
                .write_to(&mut Cursor::new(&mut out), ImageFormat::Png)
                .context("encoding png thumbnail")?;
        }
        _ => {
            // JPEG has no alpha channel.
            DynamicImage::ImageRgb8(scaled.to_rgb8())
                .write_to(&mut Cursor::new(&mut out), ImageFormat::Jpeg)
                .context("encoding jpeg thumbnail")?;
        }
    }
    Ok(Bytes::from(out))
}
