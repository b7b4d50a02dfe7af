//! Minimal built-in 5×7 bitmap font.
//!
//! Covers digits, upper-case letters and the punctuation needed for
//! coordinate labels and watermark text. No font files are required at
//! runtime; unknown characters render as blanks.

use image::{Rgba, RgbaImage};

pub const GLYPH_WIDTH: u32 = 5;
pub const GLYPH_HEIGHT: u32 = 7;
/// Horizontal advance including one column of spacing.
pub const ADVANCE: u32 = GLYPH_WIDTH + 1;

/// Each glyph is 7 rows of 5 bits, most significant bit left.
fn glyph(c: char) -> Option<[u8; 7]> {
	let rows = match c.to_ascii_uppercase() {
		'0' => [0x0E, 0x11, 0x13, 0x15, 0x19, 0x11, 0x0E],
		'1' => [0x04, 0x0C, 0x04, 0x04, 0x04, 0x04, 0x0E],
		'2' => [0x0E, 0x11, 0x01, 0x02, 0x04, 0x08, 0x1F],
		'3' => [0x1F, 0x02, 0x04, 0x02, 0x01, 0x11, 0x0E],
		'4' => [0x02, 0x06, 0x0A, 0x12, 0x1F, 0x02, 0x02],
		'5' => [0x1F, 0x10, 0x1E, 0x01, 0x01, 0x11, 0x0E],
		'6' => [0x06, 0x08, 0x10, 0x1E, 0x11, 0x11, 0x0E],
		'7' => [0x1F, 0x01, 0x02, 0x04, 0x08, 0x08, 0x08],
		'8' => [0x0E, 0x11, 0x11, 0x0E, 0x11, 0x11, 0x0E],
		'9' => [0x0E, 0x11, 0x11, 0x0F, 0x01, 0x02, 0x0C],
		'A' => [0x0E, 0x11, 0x11, 0x1F, 0x11, 0x11, 0x11],
		'B' => [0x1E, 0x11, 0x11, 0x1E, 0x11, 0x11, 0x1E],
		'C' => [0x0E, 0x11, 0x10, 0x10, 0x10, 0x11, 0x0E],
		'D' => [0x1C, 0x12, 0x11, 0x11, 0x11, 0x12, 0x1C],
		'E' => [0x1F, 0x10, 0x10, 0x1E, 0x10, 0x10, 0x1F],
		'F' => [0x1F, 0x10, 0x10, 0x1E, 0x10, 0x10, 0x10],
		'G' => [0x0E, 0x11, 0x10, 0x17, 0x11, 0x11, 0x0F],
		'H' => [0x11, 0x11, 0x11, 0x1F, 0x11, 0x11, 0x11],
		'I' => [0x0E, 0x04, 0x04, 0x04, 0x04, 0x04, 0x0E],
		'J' => [0x07, 0x02, 0x02, 0x02, 0x02, 0x12, 0x0C],
		'K' => [0x11, 0x12, 0x14, 0x18, 0x14, 0x12, 0x11],
		'L' => [0x10, 0x10, 0x10, 0x10, 0x10, 0x10, 0x1F],
		'M' => [0x11, 0x1B, 0x15, 0x15, 0x11, 0x11, 0x11],
		'N' => [0x11, 0x19, 0x15, 0x13, 0x11, 0x11, 0x11],
		'O' => [0x0E, 0x11, 0x11, 0x11, 0x11, 0x11, 0x0E],
		'P' => [0x1E, 0x11, 0x11, 0x1E, 0x10, 0x10, 0x10],
		'Q' => [0x0E, 0x11, 0x11, 0x11, 0x15, 0x12, 0x0D],
		'R' => [0x1E, 0x11, 0x11, 0x1E, 0x14, 0x12, 0x11],
		'S' => [0x0F, 0x10, 0x10, 0x0E, 0x01, 0x01, 0x1E],
		'T' => [0x1F, 0x04, 0x04, 0x04, 0x04, 0x04, 0x04],
		'U' => [0x11, 0x11, 0x11, 0x11, 0x11, 0x11, 0x0E],
		'V' => [0x11, 0x11, 0x11, 0x11, 0x11, 0x0A, 0x04],
		'W' => [0x11, 0x11, 0x11, 0x15, 0x15, 0x1B, 0x11],
		'X' => [0x11, 0x11, 0x0A, 0x04, 0x0A, 0x11, 0x11],
		'Y' => [0x11, 0x11, 0x0A, 0x04, 0x04, 0x04, 0x04],
		'Z' => [0x1F, 0x01, 0x02, 0x04, 0x08, 0x10, 0x1F],
		'-' => [0x00, 0x00, 0x00, 0x1F, 0x00, 0x00, 0x00],
		'+' => [0x00, 0x04, 0x04, 0x1F, 0x04, 0x04, 0x00],
		'.' => [0x00, 0x00, 0x00, 0x00, 0x00, 0x0C, 0x0C],
		',' => [0x00, 0x00, 0x00, 0x00, 0x0C, 0x04, 0x08],
		':' => [0x00, 0x0C, 0x0C, 0x00, 0x0C, 0x0C, 0x00],
		'/' => [0x01, 0x01, 0x02, 0x04, 0x08, 0x10, 0x10],
		'(' => [0x02, 0x04, 0x08, 0x08, 0x08, 0x04, 0x02],
		')' => [0x08, 0x04, 0x02, 0x02, 0x02, 0x04, 0x08],
		'=' => [0x00, 0x00, 0x1F, 0x00, 0x1F, 0x00, 0x00],
		' ' => [0x00; 7],
		_ => return None,
	};
	Some(rows)
}

/// Pixel width of `text` at `scale`.
pub fn text_width(text: &str, scale: u32) -> u32 {
	(text.chars().count() as u32) * ADVANCE * scale
}

/// Stamps `text` onto `img` with its top-left corner at `(x, y)`. The
/// color's alpha acts as coverage: glyph pixels are alpha-blended over the
/// image. Characters partially outside the image are clipped.
pub fn draw_text(img: &mut RgbaImage, x: i64, y: i64, text: &str, scale: u32, color: Rgba<u8>) {
	let mut pen_x = x;
	for c in text.chars() {
		if let Some(rows) = glyph(c) {
			for (row, bits) in rows.iter().enumerate() {
				for col in 0..GLYPH_WIDTH {
					if bits & (1 << (GLYPH_WIDTH - 1 - col)) == 0 {
						continue;
					}
					for sy in 0..scale {
						for sx in 0..scale {
							let px = pen_x + i64::from(col * scale + sx);
							let py = y + i64::from(row as u32 * scale + sy);
							if px >= 0 && py >= 0 && px < i64::from(img.width()) && py < i64::from(img.height()) {
								blend_pixel(img, px as u32, py as u32, color);
							}
						}
					}
				}
			}
		}
		pen_x += i64::from(ADVANCE * scale);
	}
}

fn blend_pixel(img: &mut RgbaImage, x: u32, y: u32, color: Rgba<u8>) {
	let dst = img.get_pixel_mut(x, y);
	let src_a = u32::from(color.0[3]);
	let dst_a = u32::from(dst.0[3]);
	let out_a = src_a + dst_a * (255 - src_a) / 255;
	if out_a == 0 {
		return;
	}
	for c in 0..3 {
		let src_c = u32::from(color.0[c]);
		let dst_c = u32::from(dst.0[c]);
		dst.0[c] = ((src_c * src_a + dst_c * dst_a * (255 - src_a) / 255) / out_a) as u8;
	}
	dst.0[3] = out_a as u8;
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn draws_inside_bounds() {
		let mut img = RgbaImage::new(64, 16);
		draw_text(&mut img, 2, 2, "Z5 X3", 1, Rgba([255, 0, 0, 255]));
		let drawn = img.pixels().filter(|p| p.0[3] > 0).count();
		assert!(drawn > 20, "glyphs produced {drawn} pixels");
	}

	#[test]
	fn clipping_does_not_panic() {
		let mut img = RgbaImage::new(8, 8);
		draw_text(&mut img, -3, -3, "88", 2, Rgba([0, 0, 0, 255]));
		draw_text(&mut img, 6, 6, "88", 2, Rgba([0, 0, 0, 255]));
	}

	#[test]
	fn unknown_characters_are_blank() {
		let mut img = RgbaImage::new(32, 16);
		draw_text(&mut img, 0, 0, "\u{00e4}\u{00f6}", 1, Rgba([255, 255, 255, 255]));
		assert!(img.pixels().all(|p| p.0[3] == 0));
	}

	#[test]
	fn width_accounts_for_spacing() {
		assert_eq!(text_width("ABC", 1), 18);
		assert_eq!(text_width("ABC", 2), 36);
	}
}
