//! The georeferenced raster buffer.

use crate::format::{self, EncodedImage};
use anyhow::Result;
use image::{DynamicImage, Rgba, RgbaImage};
use tilegate_core::{MapBBox, Resampling, Srs, TileFormat};

/// Encoding and transparency options attached to an image.
#[derive(Debug, Clone, PartialEq)]
pub struct ImageOpts {
	pub format: TileFormat,
	pub transparent: bool,
	/// Background for opaque output and for flattening alpha into JPEG.
	pub bgcolor: [u8; 3],
	/// A color that is rewritten to full transparency after decoding.
	pub transparent_color: Option<[u8; 3]>,
	/// Palette size for 8-bit output.
	pub colors: u16,
	pub resampling: Resampling,
	pub jpeg_quality: u8,
}

impl Default for ImageOpts {
	fn default() -> Self {
		ImageOpts {
			format: TileFormat::PNG,
			transparent: false,
			bgcolor: [255, 255, 255],
			transparent_color: None,
			colors: 256,
			resampling: Resampling::default(),
			jpeg_quality: 90,
		}
	}
}

impl ImageOpts {
	pub fn transparent_png() -> ImageOpts {
		ImageOpts {
			transparent: true,
			..ImageOpts::default()
		}
	}
}

/// An in-memory raster with georeference and encoding options.
///
/// Created by sources and cache reads; only the transformer and the merger
/// produce new ones from it. Pixel data is kept as RGBA throughout the
/// pipeline, paletted and grayscale inputs are expanded on decode.
#[derive(Debug, Clone)]
pub struct MapImage {
	image: DynamicImage,
	bbox: MapBBox,
	srs: Srs,
	opts: ImageOpts,
}

impl MapImage {
	pub fn new(image: DynamicImage, bbox: MapBBox, srs: Srs, opts: ImageOpts) -> MapImage {
		MapImage {
			image,
			bbox,
			srs,
			opts,
		}
	}

	/// A blank image: fully transparent when `opts.transparent`, otherwise
	/// filled with `opts.bgcolor`.
	pub fn blank(size: (u32, u32), bbox: MapBBox, srs: Srs, opts: ImageOpts) -> MapImage {
		let pixel = if opts.transparent {
			Rgba([0, 0, 0, 0])
		} else {
			let [r, g, b] = opts.bgcolor;
			Rgba([r, g, b, 255])
		};
		let buffer = RgbaImage::from_pixel(size.0, size.1, pixel);
		MapImage::new(DynamicImage::ImageRgba8(buffer), bbox, srs, opts)
	}

	/// Decodes an encoded tile/map response.
	///
	/// Applies the `transparent_color` substitution when configured.
	pub fn from_bytes(bytes: &[u8], bbox: MapBBox, srs: Srs, opts: ImageOpts) -> Result<MapImage> {
		let image = format::decode(bytes)?;
		let mut map_image = MapImage::new(image, bbox, srs, opts);
		if let Some(color) = map_image.opts.transparent_color {
			map_image.replace_transparent_color(color);
		}
		Ok(map_image)
	}

	pub fn size(&self) -> (u32, u32) {
		(self.image.width(), self.image.height())
	}

	pub fn bbox(&self) -> &MapBBox {
		&self.bbox
	}

	pub fn srs(&self) -> Srs {
		self.srs
	}

	pub fn opts(&self) -> &ImageOpts {
		&self.opts
	}

	pub fn set_opts(&mut self, opts: ImageOpts) {
		self.opts = opts;
	}

	pub fn dynamic(&self) -> &DynamicImage {
		&self.image
	}

	pub fn into_dynamic(self) -> DynamicImage {
		self.image
	}

	/// The pixel resolution in SRS units per pixel.
	pub fn resolution(&self) -> f64 {
		self.bbox.resolution_for_size(self.size())
	}

	/// The image as RGBA, converting lazily when the source was RGB,
	/// grayscale or paletted.
	pub fn to_rgba(&self) -> RgbaImage {
		self.image.to_rgba8()
	}

	/// Whether any pixel is not fully opaque.
	pub fn has_transparency(&self) -> bool {
		match &self.image {
			DynamicImage::ImageRgb8(_) | DynamicImage::ImageLuma8(_) => false,
			DynamicImage::ImageRgba8(img) => img.pixels().any(|p| p.0[3] < 255),
			DynamicImage::ImageLumaA8(img) => img.pixels().any(|p| p.0[1] < 255),
			other => other.to_rgba8().pixels().any(|p| p.0[3] < 255),
		}
	}

	/// When every pixel has the same value, returns it. Used for the
	/// empty-tile marker and the single-color link optimization.
	pub fn single_color(&self) -> Option<[u8; 4]> {
		let rgba = self.to_rgba();
		let mut pixels = rgba.pixels();
		let first = pixels.next()?.0;
		if pixels.all(|p| p.0 == first) {
			Some(first)
		} else {
			None
		}
	}

	/// Whether the image is uniformly fully transparent.
	pub fn is_blank(&self) -> bool {
		matches!(self.single_color(), Some([_, _, _, 0]))
	}

	/// Cuts out a pixel rectangle as a new image with the matching bbox.
	pub fn sub_image(&self, x: u32, y: u32, w: u32, h: u32) -> MapImage {
		let view = self.image.crop_imm(x, y, w, h);
		let (width, height) = self.size();
		let res_x = self.bbox.width() / f64::from(width);
		let res_y = self.bbox.height() / f64::from(height);
		let bbox = MapBBox::new(
			self.bbox.0 + f64::from(x) * res_x,
			self.bbox.3 - f64::from(y + h) * res_y,
			self.bbox.0 + f64::from(x + w) * res_x,
			self.bbox.3 - f64::from(y) * res_y,
		);
		MapImage::new(view, bbox, self.srs, self.opts.clone())
	}

	/// Rewrites every pixel matching `color` (ignoring alpha) to full
	/// transparency.
	pub fn replace_transparent_color(&mut self, color: [u8; 3]) {
		let mut rgba = self.to_rgba();
		for pixel in rgba.pixels_mut() {
			if pixel.0[0] == color[0] && pixel.0[1] == color[1] && pixel.0[2] == color[2] {
				pixel.0[3] = 0;
			}
		}
		self.image = DynamicImage::ImageRgba8(rgba);
	}

	/// Multiplies the alpha channel with `mask` (one byte per pixel,
	/// row-major). Pixels outside the mask become transparent.
	pub fn apply_alpha_mask(&mut self, mask: &[u8]) {
		let mut rgba = self.to_rgba();
		debug_assert_eq!(mask.len(), (rgba.width() * rgba.height()) as usize);
		for (i, pixel) in rgba.pixels_mut().enumerate() {
			let m = u16::from(mask[i]);
			pixel.0[3] = ((u16::from(pixel.0[3]) * m) / 255) as u8;
		}
		self.image = DynamicImage::ImageRgba8(rgba);
	}

	/// Encodes with the image's own options.
	pub fn encode(&self) -> Result<EncodedImage> {
		format::encode(&self.image, &self.opts, Some((self.bbox, self.srs)))
	}

	/// Encodes with explicit options (e.g. the cache's storage format
	/// instead of the request format).
	pub fn encode_as(&self, opts: &ImageOpts) -> Result<EncodedImage> {
		format::encode(&self.image, opts, Some((self.bbox, self.srs)))
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	fn bbox() -> MapBBox {
		MapBBox::new(0.0, 0.0, 100.0, 100.0)
	}

	#[test]
	fn blank_transparent_and_opaque() {
		let transparent = MapImage::blank((4, 4), bbox(), Srs::WGS84, ImageOpts::transparent_png());
		assert!(transparent.is_blank());
		assert!(transparent.has_transparency());

		let opts = ImageOpts {
			bgcolor: [10, 20, 30],
			..ImageOpts::default()
		};
		let opaque = MapImage::blank((4, 4), bbox(), Srs::WGS84, opts);
		assert_eq!(opaque.single_color(), Some([10, 20, 30, 255]));
		assert!(!opaque.has_transparency());
	}

	#[test]
	fn sub_image_bbox() {
		let img = MapImage::blank((100, 100), bbox(), Srs::WGS84, ImageOpts::default());
		let sub = img.sub_image(10, 20, 30, 40);
		assert_eq!(sub.size(), (30, 40));
		// pixel y is counted from the top, map y from the bottom
		assert_eq!(sub.bbox().as_array(), [10.0, 40.0, 40.0, 80.0]);
	}

	#[test]
	fn transparent_color_substitution() {
		let mut buffer = RgbaImage::from_pixel(2, 1, Rgba([255, 255, 255, 255]));
		buffer.put_pixel(1, 0, Rgba([1, 2, 3, 255]));
		let mut img = MapImage::new(
			DynamicImage::ImageRgba8(buffer),
			bbox(),
			Srs::WGS84,
			ImageOpts::default(),
		);
		img.replace_transparent_color([255, 255, 255]);
		let rgba = img.to_rgba();
		assert_eq!(rgba.get_pixel(0, 0).0[3], 0);
		assert_eq!(rgba.get_pixel(1, 0).0[3], 255);
	}

	#[test]
	fn alpha_mask() {
		let mut img = MapImage::blank((2, 1), bbox(), Srs::WGS84, ImageOpts::default());
		img.apply_alpha_mask(&[255, 0]);
		let rgba = img.to_rgba();
		assert_eq!(rgba.get_pixel(0, 0).0[3], 255);
		assert_eq!(rgba.get_pixel(1, 0).0[3], 0);
	}

	#[test]
	fn decode_round_trip() {
		let img = MapImage::blank((8, 8), bbox(), Srs::WGS84, ImageOpts::transparent_png());
		let encoded = img.encode().unwrap();
		assert_eq!(encoded.format, TileFormat::PNG);

		let decoded = MapImage::from_bytes(&encoded.bytes, bbox(), Srs::WGS84, ImageOpts::default()).unwrap();
		assert_eq!(decoded.size(), (8, 8));
		assert!(decoded.is_blank());
	}
}
