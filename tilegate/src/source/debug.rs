//! Debug source: renders the request parameters into the image.
//!
//! Useful as an overlay while setting up grids and caches: each produced
//! image carries its bbox and resolution as text plus a border marking
//! the tile edge.

use super::{MapQuery, Source, SourceResponse};
use anyhow::Result;
use async_trait::async_trait;
use image::{DynamicImage, Rgba, RgbaImage};
use tilegate_image::{font, ImageOpts, MapImage};

#[derive(Debug, Default)]
pub struct DebugSource {}

impl DebugSource {
	pub fn new() -> DebugSource {
		DebugSource {}
	}
}

#[async_trait]
impl Source for DebugSource {
	async fn get_map(&self, query: &MapQuery) -> Result<SourceResponse> {
		let (w, h) = query.size;
		let mut img = RgbaImage::new(w, h);

		let border = Rgba([255, 0, 0, 160]);
		for x in 0..w {
			img.put_pixel(x, 0, border);
			img.put_pixel(x, h - 1, border);
		}
		for y in 0..h {
			img.put_pixel(0, y, border);
			img.put_pixel(w - 1, y, border);
		}

		let res = query.bbox.resolution_for_size(query.size);
		let color = Rgba([0, 0, 0, 255]);
		font::draw_text(&mut img, 4, 4, &format!("RES {res:.4}"), 1, color);
		font::draw_text(&mut img, 4, 14, &format!("{:.1}", query.bbox.0), 1, color);
		font::draw_text(&mut img, 4, 24, &format!("{:.1}", query.bbox.1), 1, color);

		let image = MapImage::new(
			DynamicImage::ImageRgba8(img),
			query.bbox,
			query.srs,
			ImageOpts::transparent_png(),
		);
		// debug output must never end up in a cache
		Ok(SourceResponse::uncacheable(image))
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use tilegate_core::{MapBBox, Srs, TileFormat};

	#[tokio::test]
	async fn renders_border_and_text() {
		let source = DebugSource::new();
		let response = source
			.get_map(&MapQuery {
				bbox: MapBBox::new(0.0, 0.0, 100.0, 100.0),
				size: (128, 128),
				srs: Srs::WGS84,
				format: TileFormat::PNG,
				transparent: true,
			})
			.await
			.unwrap();
		assert!(!response.cacheable);
		let rgba = response.image.to_rgba();
		assert_eq!(rgba.get_pixel(0, 0).0[0], 255, "border drawn");
		let text_pixels = rgba.pixels().filter(|p| p.0 == [0, 0, 0, 255]).count();
		assert!(text_pixels > 30, "text drawn ({text_pixels} px)");
	}
}
