//! Translucent text watermarks on served images.

use crate::font;
use crate::image::MapImage;
use image::{DynamicImage, Rgba};
use tilegate_core::WatermarkOpts;

const FONT_SCALE: u32 = 2;

/// Stamps the watermark text repeatedly across the image. Rows alternate
/// their horizontal offset so tiled output does not form straight columns.
pub fn apply_watermark(image: &mut MapImage, opts: &WatermarkOpts) {
	if opts.text.is_empty() || opts.opacity == 0 {
		return;
	}
	let mut rgba = image.to_rgba();
	let (width, height) = rgba.dimensions();

	let color = Rgba([opts.color[0], opts.color[1], opts.color[2], opts.opacity]);
	let text_w = font::text_width(&opts.text, FONT_SCALE);
	let text_h = font::GLYPH_HEIGHT * FONT_SCALE;

	let spacing = if opts.spacing_wide { 4 } else { 2 };
	let step_x = (text_w * spacing).max(1) as i64;
	let step_y = (text_h * spacing * 2).max(1) as i64;

	let mut row = 0i64;
	let mut y = (step_y / 2) - i64::from(text_h / 2);
	while y < i64::from(height) {
		let offset = if row % 2 == 0 { 0 } else { step_x / 2 };
		let mut x = offset - i64::from(text_w);
		while x < i64::from(width) {
			font::draw_text(&mut rgba, x, y, &opts.text, FONT_SCALE, color);
			x += step_x;
		}
		row += 1;
		y += step_y;
	}

	let bbox = *image.bbox();
	let srs = image.srs();
	let opts_image = image.opts().clone();
	*image = MapImage::new(DynamicImage::ImageRgba8(rgba), bbox, srs, opts_image);
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::image::ImageOpts;
	use tilegate_core::{MapBBox, Srs};

	fn blank() -> MapImage {
		MapImage::blank(
			(256, 256),
			MapBBox::new(0.0, 0.0, 1.0, 1.0),
			Srs::WGS84,
			ImageOpts::default(),
		)
	}

	#[test]
	fn watermark_touches_pixels() {
		let mut image = blank();
		apply_watermark(
			&mut image,
			&WatermarkOpts {
				text: "TILEGATE".to_string(),
				opacity: 40,
				color: [0, 0, 0],
				spacing_wide: false,
			},
		);
		let rgba = image.to_rgba();
		let stamped = rgba.pixels().filter(|p| p.0 != [255, 255, 255, 255]).count();
		assert!(stamped > 100, "watermark stamped {stamped} pixels");
	}

	#[test]
	fn empty_text_is_a_no_op() {
		let mut image = blank();
		apply_watermark(
			&mut image,
			&WatermarkOpts {
				text: String::new(),
				opacity: 40,
				color: [0, 0, 0],
				spacing_wide: false,
			},
		);
		assert_eq!(image.single_color(), Some([255, 255, 255, 255]));
	}
}
