use anyhow::{ensure, Result};
use std::fmt::Debug;

/// An axis-aligned bounding box in SRS units, represented by four `f64`
/// values: `[min_x, min_y, max_x, max_y]`.
///
/// Unlike a geographic bbox this carries no fixed value range; the valid
/// area depends on the SRS it is interpreted in. Logically `min_x <= max_x`
/// and `min_y <= max_y`.
#[derive(Clone, Copy, PartialEq)]
pub struct MapBBox(pub f64, pub f64, pub f64, pub f64);

impl MapBBox {
	/// Creates a new `MapBBox` from `[x_min, y_min, x_max, y_max]`.
	pub fn new(x_min: f64, y_min: f64, x_max: f64, y_max: f64) -> MapBBox {
		MapBBox(x_min, y_min, x_max, y_max)
	}

	/// Returns the bounding box as `[min_x, min_y, max_x, max_y]`.
	pub fn as_array(&self) -> [f64; 4] {
		[self.0, self.1, self.2, self.3]
	}

	/// Returns the bounding box as a comma separated string
	/// `min_x,min_y,max_x,max_y` (the WMS BBOX parameter form).
	pub fn as_string_list(&self) -> String {
		format!("{},{},{},{}", self.0, self.1, self.2, self.3)
	}

	pub fn width(&self) -> f64 {
		self.2 - self.0
	}

	pub fn height(&self) -> f64 {
		self.3 - self.1
	}

	/// A bbox is degenerate when it covers no area.
	pub fn is_degenerate(&self) -> bool {
		self.width() <= 0.0 || self.height() <= 0.0
	}

	pub fn center(&self) -> (f64, f64) {
		((self.0 + self.2) / 2.0, (self.1 + self.3) / 2.0)
	}

	/// Expands the bbox (in place) so that it includes `other`.
	pub fn extend(&mut self, other: &MapBBox) {
		self.0 = self.0.min(other.0);
		self.1 = self.1.min(other.1);
		self.2 = self.2.max(other.2);
		self.3 = self.3.max(other.3);
	}

	/// Non-mutating version of [`MapBBox::extend`].
	pub fn extended(mut self, other: &MapBBox) -> MapBBox {
		self.extend(other);
		self
	}

	/// Shrinks the bbox (in place) to the common area with `other`.
	/// The result may be degenerate when the boxes do not overlap.
	pub fn intersect(&mut self, other: &MapBBox) {
		self.0 = self.0.max(other.0);
		self.1 = self.1.max(other.1);
		self.2 = self.2.min(other.2);
		self.3 = self.3.min(other.3);
	}

	/// Non-mutating version of [`MapBBox::intersect`].
	pub fn intersected(mut self, other: &MapBBox) -> MapBBox {
		self.intersect(other);
		self
	}

	/// Whether the two boxes share any area. Touching edges do not count
	/// as an intersection.
	pub fn intersects(&self, other: &MapBBox) -> bool {
		self.0 < other.2 && self.2 > other.0 && self.1 < other.3 && self.3 > other.1
	}

	/// Whether `other` lies completely inside this bbox.
	pub fn contains_bbox(&self, other: &MapBBox) -> bool {
		self.0 <= other.0 && self.1 <= other.1 && self.2 >= other.2 && self.3 >= other.3
	}

	pub fn contains_point(&self, x: f64, y: f64) -> bool {
		x >= self.0 && x <= self.2 && y >= self.1 && y <= self.3
	}

	/// Returns a copy grown by `units` on every side.
	pub fn buffered(&self, units: f64) -> MapBBox {
		MapBBox(self.0 - units, self.1 - units, self.2 + units, self.3 + units)
	}

	/// The pixel resolution (units per pixel) this bbox has when rendered
	/// at `size` pixels. Uses the larger of the two axis resolutions.
	pub fn resolution_for_size(&self, size: (u32, u32)) -> f64 {
		let rx = self.width() / f64::from(size.0.max(1));
		let ry = self.height() / f64::from(size.1.max(1));
		rx.max(ry)
	}

	/// Validates that min <= max on both axes.
	pub fn check(&self) -> Result<()> {
		ensure!(self.0 <= self.2, "x_min ({}) must be <= x_max ({})", self.0, self.2);
		ensure!(self.1 <= self.3, "y_min ({}) must be <= y_max ({})", self.1, self.3);
		Ok(())
	}
}

impl Debug for MapBBox {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.write_str(&self.as_string_list())
	}
}

impl From<&[f64; 4]> for MapBBox {
	fn from(input: &[f64; 4]) -> Self {
		MapBBox(input[0], input[1], input[2], input[3])
	}
}

impl TryFrom<Vec<f64>> for MapBBox {
	type Error = anyhow::Error;

	fn try_from(input: Vec<f64>) -> Result<Self> {
		ensure!(input.len() == 4, "bbox must have 4 elements");
		Ok(MapBBox(input[0], input[1], input[2], input[3]))
	}
}
