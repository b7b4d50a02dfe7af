//! Median-cut palette quantization for 8-bit PNG output.

use image::RgbaImage;
use std::collections::HashMap;

/// A paletted rendition of an RGBA image.
#[derive(Debug, Clone)]
pub struct Quantized {
	pub palette: Vec<[u8; 3]>,
	/// One palette index per pixel, row-major.
	pub indices: Vec<u8>,
	/// The palette slot reserved for fully transparent pixels.
	pub transparent_index: Option<u8>,
}

/// Quantizes `image` to at most `max_colors` palette entries.
///
/// With `transparent` set, palette slot 0 is reserved for transparency and
/// every pixel with alpha below 128 maps to it.
pub fn median_cut(image: &RgbaImage, max_colors: u16, transparent: bool) -> Quantized {
	let max_colors = max_colors.clamp(2, 256) as usize;
	let reserved = usize::from(transparent);

	// histogram of opaque colors
	let mut histogram: HashMap<[u8; 3], u32> = HashMap::new();
	for pixel in image.pixels() {
		if transparent && pixel.0[3] < 128 {
			continue;
		}
		*histogram.entry([pixel.0[0], pixel.0[1], pixel.0[2]]).or_insert(0) += 1;
	}

	let colors: Vec<([u8; 3], u32)> = histogram.into_iter().collect();
	let boxes = split_boxes(colors, max_colors - reserved);

	let mut palette = Vec::with_capacity(reserved + boxes.len());
	if transparent {
		palette.push([0, 0, 0]);
	}
	let mut lookup: HashMap<[u8; 3], u8> = HashMap::new();
	for color_box in &boxes {
		let index = palette.len() as u8;
		palette.push(average(color_box));
		for (color, _) in color_box {
			lookup.insert(*color, index);
		}
	}
	// a fully transparent image has no opaque colors at all
	if palette.len() == reserved {
		palette.push([0, 0, 0]);
	}

	let transparent_index = transparent.then_some(0u8);
	let fallback = reserved as u8;
	let indices = image
		.pixels()
		.map(|pixel| {
			if transparent && pixel.0[3] < 128 {
				0
			} else {
				let color = [pixel.0[0], pixel.0[1], pixel.0[2]];
				*lookup.get(&color).unwrap_or(&fallback)
			}
		})
		.collect();

	Quantized {
		palette,
		indices,
		transparent_index,
	}
}

fn split_boxes(colors: Vec<([u8; 3], u32)>, target: usize) -> Vec<Vec<([u8; 3], u32)>> {
	let mut boxes = vec![colors];
	boxes.retain(|b| !b.is_empty());

	while boxes.len() < target {
		// split the box with the widest channel range
		let split_at = boxes
			.iter()
			.enumerate()
			.filter(|(_, b)| b.len() > 1)
			.max_by_key(|(_, b)| widest_range(b).1)
			.map(|(i, _)| i);
		let Some(i) = split_at else {
			break;
		};

		let mut color_box = boxes.swap_remove(i);
		let (channel, _) = widest_range(&color_box);
		color_box.sort_by_key(|(c, _)| c[channel]);
		let half = color_box.len() / 2;
		let upper = color_box.split_off(half);
		boxes.push(color_box);
		boxes.push(upper);
	}
	boxes
}

fn widest_range(color_box: &[([u8; 3], u32)]) -> (usize, u8) {
	let mut min = [255u8; 3];
	let mut max = [0u8; 3];
	for (color, _) in color_box {
		for c in 0..3 {
			min[c] = min[c].min(color[c]);
			max[c] = max[c].max(color[c]);
		}
	}
	(0..3)
		.map(|c| (c, max[c] - min[c]))
		.max_by_key(|(_, range)| *range)
		.unwrap()
}

fn average(color_box: &[([u8; 3], u32)]) -> [u8; 3] {
	let mut sum = [0u64; 3];
	let mut total = 0u64;
	for (color, count) in color_box {
		for c in 0..3 {
			sum[c] += u64::from(color[c]) * u64::from(*count);
		}
		total += u64::from(*count);
	}
	if total == 0 {
		return [0, 0, 0];
	}
	[
		(sum[0] / total) as u8,
		(sum[1] / total) as u8,
		(sum[2] / total) as u8,
	]
}
