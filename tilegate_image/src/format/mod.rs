//! Encoding and decoding of tile images.
//!
//! PNG, JPEG and WebP run through the `image` crate codecs; 8-bit paletted
//! PNG is quantized here and written with the `png` crate; GeoTIFF is
//! written by the strip writer in [`geotiff`]. The `mixed` mode picks PNG
//! or JPEG per tile depending on transparency.

mod geotiff;

use crate::image::ImageOpts;
use crate::quantize;
use anyhow::{bail, Result};
use image::codecs::{jpeg::JpegEncoder, png::PngEncoder, webp::WebPEncoder};
use image::{DynamicImage, ExtendedColorType, ImageEncoder, RgbImage, RgbaImage};
use tilegate_core::{ImageError, MapBBox, Srs, TileFormat};

/// An encoded tile plus the format it was actually encoded in (relevant
/// for `mixed` caches, where PNG and JPEG tiles coexist).
#[derive(Debug, Clone, PartialEq)]
pub struct EncodedImage {
	pub bytes: Vec<u8>,
	pub format: TileFormat,
}

impl EncodedImage {
	pub fn mime(&self) -> &str {
		self.format.as_mime_str()
	}
}

/// Decodes PNG/JPEG/WebP/TIFF bytes.
pub fn decode(bytes: &[u8]) -> Result<DynamicImage> {
	image::load_from_memory(bytes).map_err(|e| ImageError::Decode(e.to_string()).into())
}

/// Encodes `image` according to `opts`. `georef` is embedded into GeoTIFF
/// output and ignored by the other formats.
pub fn encode(
	image: &DynamicImage,
	opts: &ImageOpts,
	georef: Option<(MapBBox, Srs)>,
) -> Result<EncodedImage> {
	match opts.format {
		TileFormat::PNG => encode_png(image, opts),
		TileFormat::PNG8 => encode_png8(image, opts),
		TileFormat::JPEG => encode_jpeg(image, opts),
		TileFormat::WEBP => encode_webp(image),
		TileFormat::TIFF => geotiff::encode(image, opts, georef),
		TileFormat::MIXED => {
			let has_alpha = image
				.as_rgba8()
				.map(|img| img.pixels().any(|p| p.0[3] < 255))
				.unwrap_or_else(|| image.to_rgba8().pixels().any(|p| p.0[3] < 255));
			if has_alpha {
				let opts = ImageOpts {
					format: TileFormat::PNG,
					transparent: true,
					..opts.clone()
				};
				encode_png(image, &opts)
			} else {
				encode_jpeg(image, opts)
			}
		}
	}
}

fn encode_png(image: &DynamicImage, opts: &ImageOpts) -> Result<EncodedImage> {
	let mut bytes = Vec::new();
	let encoder = PngEncoder::new(&mut bytes);
	let result = if opts.transparent {
		let rgba = image.to_rgba8();
		encoder.write_image(rgba.as_raw(), rgba.width(), rgba.height(), ExtendedColorType::Rgba8)
	} else {
		let rgb = flatten(image, opts.bgcolor);
		encoder.write_image(rgb.as_raw(), rgb.width(), rgb.height(), ExtendedColorType::Rgb8)
	};
	result.map_err(|e| ImageError::Encode(e.to_string()))?;
	Ok(EncodedImage {
		bytes,
		format: TileFormat::PNG,
	})
}

fn encode_png8(image: &DynamicImage, opts: &ImageOpts) -> Result<EncodedImage> {
	let rgba = image.to_rgba8();
	let quantized = quantize::median_cut(&rgba, opts.colors.min(256), opts.transparent);

	let mut bytes = Vec::new();
	{
		let mut encoder = png::Encoder::new(&mut bytes, rgba.width(), rgba.height());
		encoder.set_color(png::ColorType::Indexed);
		encoder.set_depth(png::BitDepth::Eight);
		let mut palette = Vec::with_capacity(quantized.palette.len() * 3);
		for [r, g, b] in &quantized.palette {
			palette.extend_from_slice(&[*r, *g, *b]);
		}
		encoder.set_palette(palette);
		if let Some(transparent_index) = quantized.transparent_index {
			// the reserved index is the only entry with alpha 0
			let mut trns = vec![255u8; quantized.palette.len()];
			trns[transparent_index as usize] = 0;
			encoder.set_trns(trns);
		}
		let mut writer = encoder
			.write_header()
			.map_err(|e| ImageError::Encode(e.to_string()))?;
		writer
			.write_image_data(&quantized.indices)
			.map_err(|e| ImageError::Encode(e.to_string()))?;
	}
	Ok(EncodedImage {
		bytes,
		format: TileFormat::PNG8,
	})
}

fn encode_jpeg(image: &DynamicImage, opts: &ImageOpts) -> Result<EncodedImage> {
	let rgb = flatten(image, opts.bgcolor);
	let mut bytes = Vec::new();
	let encoder = JpegEncoder::new_with_quality(&mut bytes, opts.jpeg_quality);
	encoder
		.write_image(rgb.as_raw(), rgb.width(), rgb.height(), ExtendedColorType::Rgb8)
		.map_err(|e| ImageError::Encode(e.to_string()))?;
	Ok(EncodedImage {
		bytes,
		format: TileFormat::JPEG,
	})
}

fn encode_webp(image: &DynamicImage) -> Result<EncodedImage> {
	let rgba = image.to_rgba8();
	let mut bytes = Vec::new();
	let encoder = WebPEncoder::new_lossless(&mut bytes);
	encoder
		.encode(rgba.as_raw(), rgba.width(), rgba.height(), ExtendedColorType::Rgba8)
		.map_err(|e| ImageError::Encode(e.to_string()))?;
	Ok(EncodedImage {
		bytes,
		format: TileFormat::WEBP,
	})
}

/// Composites alpha onto `bgcolor`, yielding an opaque RGB image.
pub fn flatten(image: &DynamicImage, bgcolor: [u8; 3]) -> RgbImage {
	match image {
		DynamicImage::ImageRgb8(rgb) => rgb.clone(),
		_ => {
			let rgba: RgbaImage = image.to_rgba8();
			let mut rgb = RgbImage::new(rgba.width(), rgba.height());
			for (src, dst) in rgba.pixels().zip(rgb.pixels_mut()) {
				let alpha = u16::from(src.0[3]);
				for c in 0..3 {
					dst.0[c] = ((u16::from(src.0[c]) * alpha + u16::from(bgcolor[c]) * (255 - alpha)) / 255) as u8;
				}
			}
			rgb
		}
	}
}

/// Checks the magic bytes of an encoded tile; a truncated or foreign
/// payload is reported as corrupt instead of being decoded blindly.
pub fn sniff_format(bytes: &[u8]) -> Result<TileFormat> {
	if bytes.len() >= 8 && bytes[..8] == [0x89, b'P', b'N', b'G', b'\r', b'\n', 0x1a, b'\n'] {
		Ok(TileFormat::PNG)
	} else if bytes.len() >= 3 && bytes[..3] == [0xff, 0xd8, 0xff] {
		Ok(TileFormat::JPEG)
	} else if bytes.len() >= 12 && &bytes[..4] == b"RIFF" && &bytes[8..12] == b"WEBP" {
		Ok(TileFormat::WEBP)
	} else if bytes.len() >= 4 && (&bytes[..4] == b"II*\0" || &bytes[..4] == b"MM\0*") {
		Ok(TileFormat::TIFF)
	} else {
		bail!(ImageError::Decode("unrecognized image header".to_string()))
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use image::Rgba;

	fn checkered(alpha: u8) -> DynamicImage {
		let mut img = RgbaImage::new(8, 8);
		for (x, y, pixel) in img.enumerate_pixels_mut() {
			*pixel = if (x + y) % 2 == 0 {
				Rgba([200, 0, 0, 255])
			} else {
				Rgba([0, 0, 200, alpha])
			};
		}
		DynamicImage::ImageRgba8(img)
	}

	#[test]
	fn png_round_trip_keeps_alpha() {
		let opts = ImageOpts {
			transparent: true,
			..ImageOpts::default()
		};
		let encoded = encode(&checkered(0), &opts, None).unwrap();
		assert_eq!(encoded.format, TileFormat::PNG);
		assert_eq!(sniff_format(&encoded.bytes).unwrap(), TileFormat::PNG);

		let decoded = decode(&encoded.bytes).unwrap().to_rgba8();
		assert_eq!(decoded.get_pixel(1, 0).0[3], 0);
		assert_eq!(decoded.get_pixel(0, 0).0, [200, 0, 0, 255]);
	}

	#[test]
	fn jpeg_flattens_onto_background() {
		let opts = ImageOpts {
			format: TileFormat::JPEG,
			bgcolor: [255, 255, 255],
			..ImageOpts::default()
		};
		let encoded = encode(&checkered(0), &opts, None).unwrap();
		assert_eq!(encoded.format, TileFormat::JPEG);
		assert_eq!(encoded.mime(), "image/jpeg");

		let decoded = decode(&encoded.bytes).unwrap().to_rgba8();
		// the transparent squares became background-ish white
		assert!(decoded.get_pixel(1, 0).0[0] > 200);
	}

	#[test]
	fn mixed_picks_png_for_alpha_and_jpeg_for_opaque() {
		let opts = ImageOpts {
			format: TileFormat::MIXED,
			..ImageOpts::default()
		};
		let with_alpha = encode(&checkered(10), &opts, None).unwrap();
		assert_eq!(with_alpha.format, TileFormat::PNG);
		assert_eq!(with_alpha.mime(), "image/png");

		let opaque = encode(&checkered(255), &opts, None).unwrap();
		assert_eq!(opaque.format, TileFormat::JPEG);
	}

	#[test]
	fn png8_stays_decodable() {
		let opts = ImageOpts {
			format: TileFormat::PNG8,
			transparent: true,
			..ImageOpts::default()
		};
		let encoded = encode(&checkered(0), &opts, None).unwrap();
		assert_eq!(encoded.format, TileFormat::PNG8);

		let decoded = decode(&encoded.bytes).unwrap().to_rgba8();
		assert_eq!(decoded.dimensions(), (8, 8));
		assert_eq!(decoded.get_pixel(1, 0).0[3], 0, "transparent index survives");
		assert_eq!(decoded.get_pixel(0, 0).0, [200, 0, 0, 255]);
	}

	#[test]
	fn webp_round_trip() {
		let encoded = encode_webp(&checkered(255)).unwrap();
		assert_eq!(sniff_format(&encoded.bytes).unwrap(), TileFormat::WEBP);
		let decoded = decode(&encoded.bytes).unwrap();
		assert_eq!(decoded.to_rgba8().get_pixel(0, 0).0, [200, 0, 0, 255]);
	}

	#[test]
	fn sniff_rejects_garbage() {
		assert!(sniff_format(b"not an image").is_err());
		assert!(sniff_format(b"").is_err());
	}
}
