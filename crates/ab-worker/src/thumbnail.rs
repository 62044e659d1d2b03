use std::io::Cursor;

use image::{ImageFormat, ImageResult};

pub const THUMBNAIL_SIDE: u32 = 128;

/// Scale a PNG down so its longer side is at most `max_side`, keeping the
/// aspect ratio, and re-encode it as PNG.
pub fn make_thumbnail(png: &[u8], max_side: u32) -> ImageResult<Vec<u8>> {
    let image = image::load_from_memory_with_format(png, ImageFormat::Png)?;
    let thumbnail = if image.width() <= max_side && image.height() <= max_side {
        image
    } else {
        image.thumbnail(max_side, max_side)
    };

    let mut out = Vec::new();
    thumbnail.write_to(&mut Cursor::new(&mut out), ImageFormat::Png)?;
    Ok(out)
}
