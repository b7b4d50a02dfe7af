//! Rescaling and reprojection.
//!
//! Same-SRS transforms are a pure affine mapping between the two bboxes.
//! Cross-SRS transforms approximate the projection with a coordinate mesh:
//! the inverse transformation is evaluated on a coarse node grid and
//! bilinearly interpolated in between, then each target pixel samples the
//! source with the configured filter. Paletted and grayscale sources are
//! expanded to RGBA before any non-nearest sampling.

use crate::image::MapImage;
use anyhow::Result;
use image::{DynamicImage, Rgba, RgbaImage};
use std::sync::Arc;
use tilegate_core::{MapBBox, Resampling, Srs, SrsRegistry};

/// Mesh node spacing in target pixels. Projection curvature across 16px is
/// far below one pixel for all supported systems.
const MESH_STEP: u32 = 16;

/// Reprojects and rescales [`MapImage`]s.
#[derive(Debug, Clone)]
pub struct ImageTransformer {
	registry: Arc<SrsRegistry>,
}

impl ImageTransformer {
	pub fn new(registry: Arc<SrsRegistry>) -> ImageTransformer {
		ImageTransformer { registry }
	}

	pub fn registry(&self) -> &Arc<SrsRegistry> {
		&self.registry
	}

	/// Produces a new image of `dst_size` covering `dst_bbox` in `dst_srs`,
	/// sampled from `src`. Target pixels outside the source become fully
	/// transparent.
	pub fn transform(
		&self,
		src: &MapImage,
		dst_bbox: &MapBBox,
		dst_srs: Srs,
		dst_size: (u32, u32),
		resampling: Resampling,
	) -> Result<MapImage> {
		if src.srs() == dst_srs && src.bbox() == dst_bbox && src.size() == dst_size {
			return Ok(src.clone());
		}

		let src_rgba = src.to_rgba();
		let (dst_w, dst_h) = dst_size;
		let mut out = RgbaImage::new(dst_w, dst_h);

		let to_src_px = self.source_pixel_mesh(src, dst_bbox, dst_srs, dst_size)?;
		for row in 0..dst_h {
			for col in 0..dst_w {
				let (fx, fy) = to_src_px.lookup(col, row);
				let pixel = match resampling {
					Resampling::Nearest => sample_nearest(&src_rgba, fx, fy),
					Resampling::Bilinear => sample_bilinear(&src_rgba, fx, fy),
					Resampling::Bicubic => sample_bicubic(&src_rgba, fx, fy),
				};
				out.put_pixel(col, row, Rgba(pixel));
			}
		}

		Ok(MapImage::new(
			DynamicImage::ImageRgba8(out),
			*dst_bbox,
			dst_srs,
			src.opts().clone(),
		))
	}

	/// Builds the dst-pixel → src-pixel coordinate mesh.
	fn source_pixel_mesh(
		&self,
		src: &MapImage,
		dst_bbox: &MapBBox,
		dst_srs: Srs,
		dst_size: (u32, u32),
	) -> Result<PixelMesh> {
		let (dst_w, dst_h) = dst_size;
		let cols = dst_w.div_ceil(MESH_STEP) + 1;
		let rows = dst_h.div_ceil(MESH_STEP) + 1;

		let src_bbox = *src.bbox();
		let (src_w, src_h) = src.size();
		let src_res_x = src_bbox.width() / f64::from(src_w);
		let src_res_y = src_bbox.height() / f64::from(src_h);
		let dst_res_x = dst_bbox.width() / f64::from(dst_w);
		let dst_res_y = dst_bbox.height() / f64::from(dst_h);

		// nodes may lie past the right/bottom image edge; they only serve
		// as interpolation anchors for the last partial cell
		let same_srs = src.srs() == dst_srs;
		let mut nodes = Vec::with_capacity((cols * rows) as usize);
		for row in 0..rows {
			let py = f64::from(row * MESH_STEP);
			let map_y = dst_bbox.3 - py * dst_res_y;
			for col in 0..cols {
				let px = f64::from(col * MESH_STEP);
				let map_x = dst_bbox.0 + px * dst_res_x;
				let (sx, sy) = if same_srs {
					(map_x, map_y)
				} else {
					self.registry.transform(dst_srs, src.srs(), (map_x, map_y))?
				};
				nodes.push((
					(sx - src_bbox.0) / src_res_x - 0.5,
					(src_bbox.3 - sy) / src_res_y - 0.5,
				));
			}
		}

		Ok(PixelMesh {
			nodes,
			cols,
			dst_size,
		})
	}
}

/// Source pixel coordinates on a node grid, bilinearly interpolated per
/// target pixel.
struct PixelMesh {
	nodes: Vec<(f64, f64)>,
	cols: u32,
	dst_size: (u32, u32),
}

impl PixelMesh {
	fn lookup(&self, col: u32, row: u32) -> (f64, f64) {
		let px = f64::from(col) + 0.5;
		let py = f64::from(row) + 0.5;
		let step = f64::from(MESH_STEP);
		let fx = px / step;
		let fy = py / step;
		let cx = (fx.floor() as u32).min(self.dst_size.0.div_ceil(MESH_STEP) - 1);
		let cy = (fy.floor() as u32).min(self.dst_size.1.div_ceil(MESH_STEP) - 1);
		let tx = fx - f64::from(cx);
		let ty = fy - f64::from(cy);

		let idx = |x: u32, y: u32| (y * self.cols + x) as usize;
		let n00 = self.nodes[idx(cx, cy)];
		let n10 = self.nodes[idx(cx + 1, cy)];
		let n01 = self.nodes[idx(cx, cy + 1)];
		let n11 = self.nodes[idx(cx + 1, cy + 1)];

		let top = (n00.0 + (n10.0 - n00.0) * tx, n00.1 + (n10.1 - n00.1) * tx);
		let bottom = (n01.0 + (n11.0 - n01.0) * tx, n01.1 + (n11.1 - n01.1) * tx);
		(top.0 + (bottom.0 - top.0) * ty, top.1 + (bottom.1 - top.1) * ty)
	}
}

fn pixel_at(img: &RgbaImage, x: i64, y: i64) -> [u8; 4] {
	if x < 0 || y < 0 || x >= i64::from(img.width()) || y >= i64::from(img.height()) {
		[0, 0, 0, 0]
	} else {
		img.get_pixel(x as u32, y as u32).0
	}
}

fn sample_nearest(img: &RgbaImage, fx: f64, fy: f64) -> [u8; 4] {
	pixel_at(img, fx.round() as i64, fy.round() as i64)
}

fn sample_bilinear(img: &RgbaImage, fx: f64, fy: f64) -> [u8; 4] {
	let x0 = fx.floor() as i64;
	let y0 = fy.floor() as i64;
	let tx = fx - x0 as f64;
	let ty = fy - y0 as f64;

	let mut out = [0u8; 4];
	for c in 0..4 {
		let p00 = f64::from(pixel_at(img, x0, y0)[c]);
		let p10 = f64::from(pixel_at(img, x0 + 1, y0)[c]);
		let p01 = f64::from(pixel_at(img, x0, y0 + 1)[c]);
		let p11 = f64::from(pixel_at(img, x0 + 1, y0 + 1)[c]);
		let top = p00 + (p10 - p00) * tx;
		let bottom = p01 + (p11 - p01) * tx;
		out[c] = (top + (bottom - top) * ty).round().clamp(0.0, 255.0) as u8;
	}
	out
}

/// Catmull-Rom kernel.
fn cubic_weight(t: f64) -> f64 {
	let t = t.abs();
	if t <= 1.0 {
		1.5 * t * t * t - 2.5 * t * t + 1.0
	} else if t < 2.0 {
		-0.5 * t * t * t + 2.5 * t * t - 4.0 * t + 2.0
	} else {
		0.0
	}
}

fn sample_bicubic(img: &RgbaImage, fx: f64, fy: f64) -> [u8; 4] {
	let x0 = fx.floor() as i64;
	let y0 = fy.floor() as i64;
	let tx = fx - x0 as f64;
	let ty = fy - y0 as f64;

	let mut out = [0u8; 4];
	for c in 0..4 {
		let mut value = 0.0;
		let mut weight_sum = 0.0;
		for dy in -1i64..=2 {
			let wy = cubic_weight(f64::from(dy as i32) - ty);
			for dx in -1i64..=2 {
				let wx = cubic_weight(f64::from(dx as i32) - tx);
				let w = wx * wy;
				value += w * f64::from(pixel_at(img, x0 + dx, y0 + dy)[c]);
				weight_sum += w;
			}
		}
		if weight_sum.abs() > f64::EPSILON {
			value /= weight_sum;
		}
		out[c] = value.round().clamp(0.0, 255.0) as u8;
	}
	out
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::image::ImageOpts;

	fn registry() -> Arc<SrsRegistry> {
		Arc::new(SrsRegistry::new())
	}

	fn gradient(size: u32, bbox: MapBBox, srs: Srs) -> MapImage {
		let mut img = RgbaImage::new(size, size);
		for (x, _, pixel) in img.enumerate_pixels_mut() {
			let v = (x * 255 / (size - 1)) as u8;
			*pixel = Rgba([v, v, v, 255]);
		}
		MapImage::new(DynamicImage::ImageRgba8(img), bbox, srs, ImageOpts::default())
	}

	#[test]
	fn identity_transform_is_a_clone() {
		let bbox = MapBBox::new(0.0, 0.0, 64.0, 64.0);
		let src = gradient(64, bbox, Srs::WGS84);
		let transformer = ImageTransformer::new(registry());
		let out = transformer
			.transform(&src, &bbox, Srs::WGS84, (64, 64), Resampling::Bicubic)
			.unwrap();
		assert_eq!(out.to_rgba(), src.to_rgba());
	}

	#[test]
	fn downscale_halves() {
		let bbox = MapBBox::new(0.0, 0.0, 64.0, 64.0);
		let src = gradient(64, bbox, Srs::WGS84);
		let transformer = ImageTransformer::new(registry());
		let out = transformer
			.transform(&src, &bbox, Srs::WGS84, (32, 32), Resampling::Bilinear)
			.unwrap();
		assert_eq!(out.size(), (32, 32));
		// gradient is preserved: left dark, right bright
		let rgba = out.to_rgba();
		assert!(rgba.get_pixel(0, 16).0[0] < 16);
		assert!(rgba.get_pixel(31, 16).0[0] > 239);
	}

	#[test]
	fn crop_takes_the_right_region() {
		let bbox = MapBBox::new(0.0, 0.0, 64.0, 64.0);
		let src = gradient(64, bbox, Srs::WGS84);
		let transformer = ImageTransformer::new(registry());
		// right half only
		let out = transformer
			.transform(
				&src,
				&MapBBox::new(32.0, 0.0, 64.0, 64.0),
				Srs::WGS84,
				(32, 64),
				Resampling::Nearest,
			)
			.unwrap();
		let rgba = out.to_rgba();
		assert!(rgba.get_pixel(0, 0).0[0] > 100, "left edge of crop is mid-gradient");
	}

	#[test]
	fn outside_source_is_transparent() {
		let bbox = MapBBox::new(0.0, 0.0, 64.0, 64.0);
		let src = gradient(64, bbox, Srs::WGS84);
		let transformer = ImageTransformer::new(registry());
		// target extends west of the source
		let out = transformer
			.transform(
				&src,
				&MapBBox::new(-64.0, 0.0, 64.0, 64.0),
				Srs::WGS84,
				(128, 64),
				Resampling::Nearest,
			)
			.unwrap();
		let rgba = out.to_rgba();
		assert_eq!(rgba.get_pixel(10, 10).0[3], 0);
		assert_eq!(rgba.get_pixel(100, 10).0[3], 255);
	}

	#[test]
	fn reprojection_geodetic_to_mercator() {
		// a geodetic world image reprojected into a mercator world image
		let src = gradient(
			256,
			MapBBox::new(-180.0, -90.0, 180.0, 90.0),
			Srs::WGS84,
		);
		let transformer = ImageTransformer::new(registry());
		let e = 20037508.342789244;
		let out = transformer
			.transform(
				&src,
				&MapBBox::new(-e, -e, e, e),
				Srs::WEBMERCATOR,
				(256, 256),
				Resampling::Bilinear,
			)
			.unwrap();
		assert_eq!(out.size(), (256, 256));
		let rgba = out.to_rgba();
		// the x gradient survives reprojection (y is stretched, x is linear)
		assert!(rgba.get_pixel(5, 128).0[0] < 20);
		assert!(rgba.get_pixel(250, 128).0[0] > 235);
		// the mercator image is fully covered
		assert_eq!(rgba.get_pixel(128, 5).0[3], 255);
		assert_eq!(rgba.get_pixel(128, 250).0[3], 255);
	}

	#[test]
	fn cubic_kernel_properties() {
		assert_eq!(cubic_weight(0.0), 1.0);
		assert_eq!(cubic_weight(1.0), 0.0);
		assert_eq!(cubic_weight(2.0), 0.0);
		assert!(cubic_weight(0.5) > 0.5);
		assert!(cubic_weight(1.5) < 0.0);
	}
}
