//! Layer compositing and band merging.

use crate::image::{ImageOpts, MapImage};
use anyhow::{ensure, Result};
use image::{DynamicImage, Rgba, RgbaImage};
use tilegate_core::{MapBBox, MergeMethod, Srs};

/// One entry of a merge stack: an image plus an optional opacity override
/// (0.0 fully transparent, 1.0 as-is).
#[derive(Debug, Clone)]
pub struct MergeLayer {
	pub image: MapImage,
	pub opacity: Option<f64>,
}

impl MergeLayer {
	pub fn new(image: MapImage) -> MergeLayer {
		MergeLayer { image, opacity: None }
	}

	pub fn with_opacity(image: MapImage, opacity: f64) -> MergeLayer {
		MergeLayer {
			image,
			opacity: Some(opacity),
		}
	}

	/// An opaque layer obscures everything below it.
	fn is_opaque(&self) -> bool {
		self.opacity.map_or(true, |o| o >= 1.0) && !self.image.has_transparency()
	}
}

/// Composites `layers` bottom to top over a blank background.
///
/// All layers must already share `bbox`, SRS and `size` (the transformer
/// aligns them first). Layers below the topmost fully opaque entry are
/// skipped, they cannot contribute to the result.
pub fn merge_layers(
	layers: Vec<MergeLayer>,
	size: (u32, u32),
	bbox: MapBBox,
	srs: Srs,
	opts: ImageOpts,
	method: MergeMethod,
) -> Result<MapImage> {
	let start = layers
		.iter()
		.rposition(|layer| layer.image.size() == size && layer.opacity.is_none() && layer.is_opaque())
		.unwrap_or(0);

	let mut out = MapImage::blank(size, bbox, srs, opts).to_rgba();
	for layer in &layers[start..] {
		ensure!(
			layer.image.size() == size,
			"merge layer size {:?} does not match target {:?}",
			layer.image.size(),
			size
		);
		let src = layer.image.to_rgba();
		let opacity = layer.opacity.unwrap_or(1.0).clamp(0.0, 1.0);
		match method {
			MergeMethod::Composite => alpha_over(&mut out, &src, opacity),
			MergeMethod::Max => max_bands(&mut out, &src),
		}
	}

	let opts = layers
		.into_iter()
		.next()
		.map(|l| l.image.opts().clone())
		.unwrap_or_default();
	Ok(MapImage::new(DynamicImage::ImageRgba8(out), bbox, srs, opts))
}

/// Standard alpha-over compositing (not a paste): the source alpha blends
/// against the accumulated destination, preserving destination alpha where
/// the source is transparent.
fn alpha_over(dst: &mut RgbaImage, src: &RgbaImage, opacity: f64) {
	for (dst_pixel, src_pixel) in dst.pixels_mut().zip(src.pixels()) {
		let src_a = f64::from(src_pixel.0[3]) / 255.0 * opacity;
		if src_a <= 0.0 {
			continue;
		}
		let dst_a = f64::from(dst_pixel.0[3]) / 255.0;
		let out_a = src_a + dst_a * (1.0 - src_a);
		if out_a <= 0.0 {
			*dst_pixel = Rgba([0, 0, 0, 0]);
			continue;
		}
		for c in 0..3 {
			let src_c = f64::from(src_pixel.0[c]);
			let dst_c = f64::from(dst_pixel.0[c]);
			let out_c = (src_c * src_a + dst_c * dst_a * (1.0 - src_a)) / out_a;
			dst_pixel.0[c] = out_c.round().clamp(0.0, 255.0) as u8;
		}
		dst_pixel.0[3] = (out_a * 255.0).round().clamp(0.0, 255.0) as u8;
	}
}

fn max_bands(dst: &mut RgbaImage, src: &RgbaImage) {
	for (dst_pixel, src_pixel) in dst.pixels_mut().zip(src.pixels()) {
		for c in 0..4 {
			dst_pixel.0[c] = dst_pixel.0[c].max(src_pixel.0[c]);
		}
	}
}

/// One input to a band-merge output channel: channel `band` of source
/// `source_index`, scaled by `factor`. Contributions to the same output
/// channel are summed.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BandSelect {
	pub source_index: usize,
	pub band: usize,
	pub factor: f64,
}

impl BandSelect {
	pub fn new(source_index: usize, band: usize) -> BandSelect {
		BandSelect {
			source_index,
			band,
			factor: 1.0,
		}
	}
}

/// Synthesizes an image by picking channels from `sources` according to
/// the per-output-channel selections `[r, g, b, a]`. An empty alpha
/// selection yields full opacity.
pub fn band_merge(
	sources: &[MapImage],
	channels: &[Vec<BandSelect>; 4],
	size: (u32, u32),
	bbox: MapBBox,
	srs: Srs,
	opts: ImageOpts,
) -> Result<MapImage> {
	for selections in channels {
		for selection in selections {
			ensure!(
				selection.source_index < sources.len(),
				"band source index {} out of range ({} sources)",
				selection.source_index,
				sources.len()
			);
			ensure!(selection.band < 4, "band index {} out of range", selection.band);
		}
	}
	let rasters: Vec<RgbaImage> = sources.iter().map(|s| s.to_rgba()).collect();
	for raster in &rasters {
		ensure!(
			raster.dimensions() == size,
			"band source size {:?} does not match target {:?}",
			raster.dimensions(),
			size
		);
	}

	let mut out = RgbaImage::new(size.0, size.1);
	for (i, pixel) in out.pixels_mut().enumerate() {
		let x = (i as u32) % size.0;
		let y = (i as u32) / size.0;
		for (c, selections) in channels.iter().enumerate() {
			if selections.is_empty() {
				pixel.0[c] = if c == 3 { 255 } else { 0 };
				continue;
			}
			let mut sum = 0.0;
			for selection in selections {
				let value = rasters[selection.source_index].get_pixel(x, y).0[selection.band];
				sum += f64::from(value) * selection.factor;
			}
			pixel.0[c] = sum.round().clamp(0.0, 255.0) as u8;
		}
	}
	Ok(MapImage::new(DynamicImage::ImageRgba8(out), bbox, srs, opts))
}

#[cfg(test)]
mod tests {
	use super::*;

	fn bbox() -> MapBBox {
		MapBBox::new(0.0, 0.0, 10.0, 10.0)
	}

	fn solid(color: [u8; 4]) -> MapImage {
		let img = RgbaImage::from_pixel(4, 4, Rgba(color));
		MapImage::new(
			DynamicImage::ImageRgba8(img),
			bbox(),
			Srs::WGS84,
			ImageOpts::default(),
		)
	}

	#[test]
	fn alpha_over_blends() {
		let layers = vec![
			MergeLayer::new(solid([200, 0, 0, 255])),
			MergeLayer::new(solid([0, 0, 200, 128])),
		];
		let merged = merge_layers(
			layers,
			(4, 4),
			bbox(),
			Srs::WGS84,
			ImageOpts::transparent_png(),
			MergeMethod::Composite,
		)
		.unwrap();
		let pixel = merged.to_rgba().get_pixel(0, 0).0;
		// roughly half red, half blue, fully opaque
		assert_eq!(pixel[3], 255);
		assert!(pixel[0] > 90 && pixel[0] < 110, "red {}", pixel[0]);
		assert!(pixel[2] > 90 && pixel[2] < 110, "blue {}", pixel[2]);
	}

	#[test]
	fn transparent_layer_preserves_base(){
		let layers = vec![
			MergeLayer::new(solid([10, 20, 30, 255])),
			MergeLayer::new(solid([0, 0, 0, 0])),
		];
		let merged = merge_layers(
			layers,
			(4, 4),
			bbox(),
			Srs::WGS84,
			ImageOpts::transparent_png(),
			MergeMethod::Composite,
		)
		.unwrap();
		assert_eq!(merged.to_rgba().get_pixel(2, 2).0, [10, 20, 30, 255]);
	}

	#[test]
	fn opaque_layer_resets_stack() {
		let layers = vec![
			MergeLayer::new(solid([255, 0, 0, 255])),
			// fully opaque: the red base cannot show through
			MergeLayer::new(solid([0, 255, 0, 255])),
			MergeLayer::new(solid([0, 0, 255, 100])),
		];
		let merged = merge_layers(
			layers,
			(4, 4),
			bbox(),
			Srs::WGS84,
			ImageOpts::transparent_png(),
			MergeMethod::Composite,
		)
		.unwrap();
		let pixel = merged.to_rgba().get_pixel(0, 0).0;
		assert_eq!(pixel[0], 0, "red layer below the opaque green never contributes");
	}

	#[test]
	fn opacity_override() {
		let layers = vec![
			MergeLayer::new(solid([0, 0, 0, 255])),
			MergeLayer::with_opacity(solid([255, 255, 255, 255]), 0.5),
		];
		let merged = merge_layers(
			layers,
			(4, 4),
			bbox(),
			Srs::WGS84,
			ImageOpts::transparent_png(),
			MergeMethod::Composite,
		)
		.unwrap();
		let pixel = merged.to_rgba().get_pixel(0, 0).0;
		assert!(pixel[0] > 120 && pixel[0] < 135);
	}

	#[test]
	fn merge_onto_transparent_background() {
		let layers = vec![MergeLayer::new(solid([50, 60, 70, 128]))];
		let merged = merge_layers(
			layers,
			(4, 4),
			bbox(),
			Srs::WGS84,
			ImageOpts::transparent_png(),
			MergeMethod::Composite,
		)
		.unwrap();
		let pixel = merged.to_rgba().get_pixel(0, 0).0;
		// color survives un-darkened, alpha stays partial
		assert_eq!(pixel[..3], [50, 60, 70]);
		assert_eq!(pixel[3], 128);
	}

	#[test]
	fn max_band_merge() {
		let layers = vec![
			MergeLayer::new(solid([100, 0, 50, 255])),
			MergeLayer::new(solid([20, 200, 10, 255])),
		];
		let merged = merge_layers(
			layers,
			(4, 4),
			bbox(),
			Srs::WGS84,
			ImageOpts::transparent_png(),
			MergeMethod::Max,
		)
		.unwrap();
		assert_eq!(merged.to_rgba().get_pixel(0, 0).0, [100, 200, 50, 255]);
	}

	#[test]
	fn band_merge_picks_channels() {
		let red = solid([200, 10, 10, 255]);
		let green = solid([10, 150, 10, 255]);
		let channels = [
			vec![BandSelect::new(0, 0)],
			vec![BandSelect::new(1, 1)],
			vec![BandSelect {
				source_index: 0,
				band: 0,
				factor: 0.5,
			}],
			vec![],
		];
		let merged = band_merge(
			&[red, green],
			&channels,
			(4, 4),
			bbox(),
			Srs::WGS84,
			ImageOpts::default(),
		)
		.unwrap();
		assert_eq!(merged.to_rgba().get_pixel(0, 0).0, [200, 150, 100, 255]);
	}

	#[test]
	fn band_merge_rejects_bad_index() {
		let channels = [vec![BandSelect::new(5, 0)], vec![], vec![], vec![]];
		assert!(band_merge(
			&[solid([0, 0, 0, 255])],
			&channels,
			(4, 4),
			bbox(),
			Srs::WGS84,
			ImageOpts::default(),
		)
		.is_err());
	}
}
