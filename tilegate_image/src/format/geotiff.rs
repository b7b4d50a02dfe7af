//! GeoTIFF strip writer.
//!
//! Writes a baseline little-endian TIFF with one strip, deflate-compressed
//! pixel data and the three GeoTIFF tags (pixel scale, tiepoint, geokey
//! directory) carrying the georeference. Readers that ignore GeoTIFF tags
//! still see a plain TIFF.

use crate::image::ImageOpts;
use crate::format::EncodedImage;
use anyhow::Result;
use byteorder::{LittleEndian, WriteBytesExt};
use flate2::{write::ZlibEncoder, Compression};
use image::DynamicImage;
use std::io::Write;
use tilegate_core::{ImageError, MapBBox, Srs, TileFormat};

const TAG_IMAGE_WIDTH: u16 = 256;
const TAG_IMAGE_LENGTH: u16 = 257;
const TAG_BITS_PER_SAMPLE: u16 = 258;
const TAG_COMPRESSION: u16 = 259;
const TAG_PHOTOMETRIC: u16 = 262;
const TAG_STRIP_OFFSETS: u16 = 273;
const TAG_SAMPLES_PER_PIXEL: u16 = 277;
const TAG_ROWS_PER_STRIP: u16 = 278;
const TAG_STRIP_BYTE_COUNTS: u16 = 279;
const TAG_PLANAR_CONFIG: u16 = 284;
const TAG_EXTRA_SAMPLES: u16 = 338;
const TAG_MODEL_PIXEL_SCALE: u16 = 33550;
const TAG_MODEL_TIEPOINT: u16 = 33922;
const TAG_GEO_KEY_DIRECTORY: u16 = 34735;

const TYPE_SHORT: u16 = 3;
const TYPE_LONG: u16 = 4;
const TYPE_DOUBLE: u16 = 12;

const COMPRESSION_DEFLATE: u16 = 8;

/// Encodes `image` as (Geo)TIFF. Alpha is kept as an unassociated extra
/// sample when `opts.transparent` is set, otherwise flattened onto the
/// background color.
pub fn encode(
	image: &DynamicImage,
	opts: &ImageOpts,
	georef: Option<(MapBBox, Srs)>,
) -> Result<EncodedImage> {
	let (raw, samples): (Vec<u8>, u16) = if opts.transparent {
		(image.to_rgba8().into_raw(), 4)
	} else {
		(super::flatten(image, opts.bgcolor).into_raw(), 3)
	};
	let (width, height) = (image.width(), image.height());

	let mut deflater = ZlibEncoder::new(Vec::new(), Compression::default());
	deflater
		.write_all(&raw)
		.and_then(|_| deflater.finish())
		.map_err(|e| ImageError::Encode(e.to_string()))
		.map(|data| build_tiff(data, width, height, samples, georef))?
		.map(|bytes| EncodedImage {
			bytes,
			format: TileFormat::TIFF,
		})
}

fn build_tiff(
	strip: Vec<u8>,
	width: u32,
	height: u32,
	samples: u16,
	georef: Option<(MapBBox, Srs)>,
) -> Result<Vec<u8>> {
	// layout: header (8) | strip data (padded even) | IFD | external values
	let strip_offset = 8u32;
	let mut strip = strip;
	if strip.len() % 2 == 1 {
		strip.push(0);
	}
	let ifd_offset = strip_offset + strip.len() as u32;

	let mut entries: Vec<(u16, u16, u32, EntryValue)> = vec![
		(TAG_IMAGE_WIDTH, TYPE_LONG, 1, EntryValue::Inline(width)),
		(TAG_IMAGE_LENGTH, TYPE_LONG, 1, EntryValue::Inline(height)),
		(
			TAG_BITS_PER_SAMPLE,
			TYPE_SHORT,
			u32::from(samples),
			EntryValue::Shorts(vec![8; samples as usize]),
		),
		(
			TAG_COMPRESSION,
			TYPE_SHORT,
			1,
			EntryValue::Inline(u32::from(COMPRESSION_DEFLATE)),
		),
		(TAG_PHOTOMETRIC, TYPE_SHORT, 1, EntryValue::Inline(2)),
		(TAG_STRIP_OFFSETS, TYPE_LONG, 1, EntryValue::Inline(strip_offset)),
		(
			TAG_SAMPLES_PER_PIXEL,
			TYPE_SHORT,
			1,
			EntryValue::Inline(u32::from(samples)),
		),
		(TAG_ROWS_PER_STRIP, TYPE_LONG, 1, EntryValue::Inline(height)),
		(
			TAG_STRIP_BYTE_COUNTS,
			TYPE_LONG,
			1,
			EntryValue::Inline(strip.len() as u32),
		),
		(TAG_PLANAR_CONFIG, TYPE_SHORT, 1, EntryValue::Inline(1)),
	];
	if samples == 4 {
		// unassociated alpha
		entries.push((TAG_EXTRA_SAMPLES, TYPE_SHORT, 1, EntryValue::Inline(2)));
	}

	if let Some((bbox, srs)) = georef {
		let res_x = bbox.width() / f64::from(width);
		let res_y = bbox.height() / f64::from(height);
		entries.push((
			TAG_MODEL_PIXEL_SCALE,
			TYPE_DOUBLE,
			3,
			EntryValue::Doubles(vec![res_x, res_y, 0.0]),
		));
		// raster (0, 0) is the top-left corner of the bbox
		entries.push((
			TAG_MODEL_TIEPOINT,
			TYPE_DOUBLE,
			6,
			EntryValue::Doubles(vec![0.0, 0.0, 0.0, bbox.0, bbox.3, 0.0]),
		));
		let (model_type, code_key) = if srs.is_geographic() {
			(2u16, 2048u16)
		} else {
			(1u16, 3072u16)
		};
		entries.push((
			TAG_GEO_KEY_DIRECTORY,
			TYPE_SHORT,
			16,
			EntryValue::Shorts(vec![
				1, 1, 0, 3,
				1024, 0, 1, model_type,
				1025, 0, 1, 1,
				code_key, 0, 1, srs.code() as u16,
			]),
		));
	}
	entries.sort_by_key(|(tag, _, _, _)| *tag);

	// external value area starts right after the IFD
	let external_offset = ifd_offset + 2 + entries.len() as u32 * 12 + 4;
	let mut external: Vec<u8> = Vec::new();

	let mut out = Vec::with_capacity(strip.len() + 256);
	out.extend_from_slice(b"II");
	out.write_u16::<LittleEndian>(42)?;
	out.write_u32::<LittleEndian>(ifd_offset)?;
	out.extend_from_slice(&strip);

	out.write_u16::<LittleEndian>(entries.len() as u16)?;
	for (tag, field_type, count, value) in &entries {
		out.write_u16::<LittleEndian>(*tag)?;
		out.write_u16::<LittleEndian>(*field_type)?;
		out.write_u32::<LittleEndian>(*count)?;
		match value {
			EntryValue::Inline(v) => {
				if *field_type == TYPE_SHORT {
					out.write_u16::<LittleEndian>(*v as u16)?;
					out.write_u16::<LittleEndian>(0)?;
				} else {
					out.write_u32::<LittleEndian>(*v)?;
				}
			}
			EntryValue::Shorts(values) => {
				if values.len() <= 2 {
					for v in values {
						out.write_u16::<LittleEndian>(*v)?;
					}
					for _ in values.len()..2 {
						out.write_u16::<LittleEndian>(0)?;
					}
				} else {
					out.write_u32::<LittleEndian>(external_offset + external.len() as u32)?;
					for v in values {
						external.write_u16::<LittleEndian>(*v)?;
					}
				}
			}
			EntryValue::Doubles(values) => {
				out.write_u32::<LittleEndian>(external_offset + external.len() as u32)?;
				for v in values {
					external.write_f64::<LittleEndian>(*v)?;
				}
			}
		}
	}
	// single IFD
	out.write_u32::<LittleEndian>(0)?;
	out.extend_from_slice(&external);
	Ok(out)
}

enum EntryValue {
	Inline(u32),
	Shorts(Vec<u16>),
	Doubles(Vec<f64>),
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::format::{decode, sniff_format};
	use byteorder::{ByteOrder, LittleEndian};
	use image::{Rgba, RgbaImage};

	fn sample() -> DynamicImage {
		let mut img = RgbaImage::new(16, 8);
		for (x, _, pixel) in img.enumerate_pixels_mut() {
			*pixel = Rgba([(x * 16) as u8, 50, 100, 255]);
		}
		DynamicImage::ImageRgba8(img)
	}

	fn find_tag(bytes: &[u8], wanted: u16) -> Option<(u16, u32, u32)> {
		let ifd_offset = LittleEndian::read_u32(&bytes[4..8]) as usize;
		let count = LittleEndian::read_u16(&bytes[ifd_offset..]) as usize;
		for i in 0..count {
			let entry = ifd_offset + 2 + i * 12;
			let tag = LittleEndian::read_u16(&bytes[entry..]);
			if tag == wanted {
				return Some((
					LittleEndian::read_u16(&bytes[entry + 2..]),
					LittleEndian::read_u32(&bytes[entry + 4..]),
					LittleEndian::read_u32(&bytes[entry + 8..]),
				));
			}
		}
		None
	}

	#[test]
	fn tiff_round_trip() {
		let opts = ImageOpts {
			format: TileFormat::TIFF,
			..ImageOpts::default()
		};
		let encoded = encode(&sample(), &opts, None).unwrap();
		assert_eq!(sniff_format(&encoded.bytes).unwrap(), TileFormat::TIFF);

		let decoded = decode(&encoded.bytes).unwrap();
		assert_eq!((decoded.width(), decoded.height()), (16, 8));
		assert_eq!(decoded.to_rgba8().get_pixel(3, 0).0[0], 48);
	}

	#[test]
	fn georeference_tags_present() {
		let opts = ImageOpts {
			format: TileFormat::TIFF,
			..ImageOpts::default()
		};
		let bbox = MapBBox::new(1000.0, 2000.0, 1160.0, 2080.0);
		let encoded = encode(&sample(), &opts, Some((bbox, Srs::WEBMERCATOR))).unwrap();

		let (field_type, count, offset) = find_tag(&encoded.bytes, TAG_MODEL_PIXEL_SCALE).unwrap();
		assert_eq!((field_type, count), (TYPE_DOUBLE, 3));
		let res_x = LittleEndian::read_f64(&encoded.bytes[offset as usize..]);
		assert_eq!(res_x, 10.0);

		let (_, count, offset) = find_tag(&encoded.bytes, TAG_MODEL_TIEPOINT).unwrap();
		assert_eq!(count, 6);
		let origin_x = LittleEndian::read_f64(&encoded.bytes[offset as usize + 24..]);
		let origin_y = LittleEndian::read_f64(&encoded.bytes[offset as usize + 32..]);
		assert_eq!((origin_x, origin_y), (1000.0, 2080.0));

		let (_, count, offset) = find_tag(&encoded.bytes, TAG_GEO_KEY_DIRECTORY).unwrap();
		assert_eq!(count, 16);
		let keys_start = offset as usize;
		// last geokey row carries the EPSG code
		let code = LittleEndian::read_u16(&encoded.bytes[keys_start + 15 * 2..]);
		assert_eq!(code, 3857);
	}

	#[test]
	fn transparent_tiff_keeps_alpha_sample() {
		let opts = ImageOpts {
			format: TileFormat::TIFF,
			transparent: true,
			..ImageOpts::default()
		};
		let mut img = RgbaImage::from_pixel(4, 4, Rgba([10, 20, 30, 255]));
		img.put_pixel(0, 0, Rgba([0, 0, 0, 0]));
		let encoded = encode(&DynamicImage::ImageRgba8(img), &opts, None).unwrap();

		let decoded = decode(&encoded.bytes).unwrap().to_rgba8();
		assert_eq!(decoded.get_pixel(0, 0).0[3], 0);
		assert_eq!(decoded.get_pixel(1, 1).0, [10, 20, 30, 255]);
	}
}
