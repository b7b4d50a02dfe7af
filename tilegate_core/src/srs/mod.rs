//! Spatial reference handling.
//!
//! `Srs` is an opaque handle around an EPSG code. Transformations run
//! through a [`SrsRegistry`]: a small set of built-in projections
//! (geodetic, spherical mercator, ellipsoidal UTM) plus any user-registered
//! [`Projection`] implementations. A full geodesy library can be plugged in
//! through that trait; the core never links one.

mod projections;

pub use projections::{Projection, SphericalMercator, TransverseMercator};

use crate::{MapBBox, SourceError};
use anyhow::Result;
use std::{collections::HashMap, fmt, str::FromStr, sync::Arc};

/// Number of sample points per bbox edge when transforming bounding boxes.
/// Densifying keeps curved edges (e.g. mercator → geodetic) inside the box.
const BBOX_EDGE_SAMPLES: u32 = 16;

/// An EPSG-coded spatial reference system.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Srs {
	code: u32,
}

impl Srs {
	pub const WGS84: Srs = Srs { code: 4326 };
	pub const WEBMERCATOR: Srs = Srs { code: 3857 };

	pub fn new(code: u32) -> Srs {
		Srs { code }
	}

	pub fn code(&self) -> u32 {
		self.code
	}

	/// WMS 1.3.0 axis order: geographic systems are north/east (lat before
	/// lon), projected systems east/north.
	pub fn is_axis_order_ne(&self) -> bool {
		matches!(self.code, 4326 | 4258 | 4267 | 4269 | 4301 | 4817)
	}

	pub fn is_geographic(&self) -> bool {
		self.is_axis_order_ne() || self.code == 84
	}

	/// The area this SRS is defined for, in its own units. Requests are
	/// clipped to this area before transformation so that coordinates never
	/// wrap across the ±180° seam.
	pub fn valid_bbox(&self) -> MapBBox {
		match self.code {
			84 | 4326 | 4258 | 4267 | 4269 | 4301 | 4817 => MapBBox::new(-180.0, -90.0, 180.0, 90.0),
			3857 | 900913 | 102100 | 102113 => {
				const E: f64 = 20037508.342789244;
				MapBBox::new(-E, -E, E, E)
			}
			// projected systems without a registered extent: effectively unbounded
			_ => MapBBox::new(f64::MIN, f64::MIN, f64::MAX, f64::MAX),
		}
	}
}

impl FromStr for Srs {
	type Err = anyhow::Error;

	/// Parses `EPSG:4326`, `epsg:4326`, `CRS:84` and bare numeric codes.
	fn from_str(value: &str) -> Result<Self> {
		let value = value.trim();
		let code = if let Some(code) = value.to_uppercase().strip_prefix("EPSG:") {
			code.parse::<u32>()?
		} else if value.eq_ignore_ascii_case("CRS:84") {
			84
		} else {
			value.parse::<u32>()?
		};
		Ok(Srs { code })
	}
}

impl fmt::Display for Srs {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		if self.code == 84 {
			f.write_str("CRS:84")
		} else {
			write!(f, "EPSG:{}", self.code)
		}
	}
}

impl fmt::Debug for Srs {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		fmt::Display::fmt(self, f)
	}
}

/// Resolves `Srs` handles to projections and transforms coordinates.
///
/// Immutable after configuration; cheap to share via `Arc`.
#[derive(Default)]
pub struct SrsRegistry {
	custom: HashMap<u32, Arc<dyn Projection>>,
}

impl SrsRegistry {
	pub fn new() -> SrsRegistry {
		SrsRegistry::default()
	}

	/// Registers an external projection for `code`, overriding any built-in.
	pub fn register(&mut self, code: u32, projection: Arc<dyn Projection>) {
		self.custom.insert(code, projection);
	}

	/// Looks up the projection for `srs`.
	///
	/// # Errors
	/// `SourceError::UnsupportedSrs` when neither a custom nor a built-in
	/// projection exists.
	pub fn projection(&self, srs: Srs) -> Result<Arc<dyn Projection>> {
		if let Some(projection) = self.custom.get(&srs.code()) {
			return Ok(projection.clone());
		}
		projections::builtin(srs.code()).ok_or_else(|| SourceError::UnsupportedSrs(srs.to_string()).into())
	}

	pub fn supports(&self, srs: Srs) -> bool {
		self.custom.contains_key(&srs.code()) || projections::builtin(srs.code()).is_some()
	}

	/// Transforms a single point from `from` to `to`.
	pub fn transform(&self, from: Srs, to: Srs, point: (f64, f64)) -> Result<(f64, f64)> {
		if from == to {
			return Ok(point);
		}
		let lonlat = self.projection(from)?.inverse(point);
		Ok(self.projection(to)?.forward(lonlat))
	}

	/// Transforms a bounding box by densifying its edges and taking the
	/// envelope of the transformed samples. The input is clipped to the
	/// source SRS's valid area first to avoid longitude wrapping.
	pub fn transform_bbox(&self, from: Srs, to: Srs, bbox: &MapBBox) -> Result<MapBBox> {
		if from == to {
			return Ok(*bbox);
		}
		let bbox = bbox.intersected(&from.valid_bbox());
		let inverse = self.projection(from)?;
		let forward = self.projection(to)?;

		let mut out: Option<MapBBox> = None;
		let n = f64::from(BBOX_EDGE_SAMPLES);
		for i in 0..=BBOX_EDGE_SAMPLES {
			let t = f64::from(i) / n;
			let x = bbox.0 + bbox.width() * t;
			let y = bbox.1 + bbox.height() * t;
			for point in [
				(x, bbox.1),
				(x, bbox.3),
				(bbox.0, y),
				(bbox.2, y),
			] {
				let (px, py) = forward.forward(inverse.inverse(point));
				let point_bbox = MapBBox::new(px, py, px, py);
				match &mut out {
					Some(b) => b.extend(&point_bbox),
					None => out = Some(point_bbox),
				}
			}
		}
		Ok(out.unwrap())
	}
}

impl fmt::Debug for SrsRegistry {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.debug_struct("SrsRegistry")
			.field("custom", &self.custom.keys().collect::<Vec<_>>())
			.finish()
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	fn registry() -> SrsRegistry {
		SrsRegistry::new()
	}

	#[test]
	fn parse_and_display() {
		assert_eq!("EPSG:3857".parse::<Srs>().unwrap(), Srs::WEBMERCATOR);
		assert_eq!("epsg:4326".parse::<Srs>().unwrap(), Srs::WGS84);
		assert_eq!("CRS:84".parse::<Srs>().unwrap().to_string(), "CRS:84");
		assert_eq!(Srs::new(25832).to_string(), "EPSG:25832");
		assert!("EPSG:abc".parse::<Srs>().is_err());
	}

	#[test]
	fn axis_order() {
		assert!(Srs::WGS84.is_axis_order_ne());
		assert!(!Srs::WEBMERCATOR.is_axis_order_ne());
		assert!(!Srs::new(25832).is_axis_order_ne());
	}

	#[test]
	fn identity_transform() {
		let p = registry()
			.transform(Srs::WGS84, Srs::WGS84, (8.0, 50.0))
			.unwrap();
		assert_eq!(p, (8.0, 50.0));
	}

	#[test]
	fn geodetic_to_mercator_round_trip() {
		let reg = registry();
		let (x, y) = reg.transform(Srs::WGS84, Srs::WEBMERCATOR, (8.0, 50.0)).unwrap();
		assert!((x - 890555.9263461898).abs() < 1e-6);
		assert!((y - 6446275.841017158).abs() < 1e-6);

		let (lon, lat) = reg.transform(Srs::WEBMERCATOR, Srs::WGS84, (x, y)).unwrap();
		assert!((lon - 8.0).abs() < 1e-9);
		assert!((lat - 50.0).abs() < 1e-9);
	}

	#[test]
	fn utm_round_trip() {
		let reg = registry();
		let utm32 = Srs::new(25832);
		// Munich-ish
		let (e, n) = reg.transform(Srs::WGS84, utm32, (11.575, 48.137)).unwrap();
		assert!((e - 691_000.0).abs() < 2_000.0, "easting {e}");
		assert!((n - 5_334_000.0).abs() < 2_000.0, "northing {n}");

		let (lon, lat) = reg.transform(utm32, Srs::WGS84, (e, n)).unwrap();
		assert!((lon - 11.575).abs() < 1e-7);
		assert!((lat - 48.137).abs() < 1e-7);
	}

	#[test]
	fn unknown_srs_is_rejected() {
		let err = registry().projection(Srs::new(31467)).unwrap_err();
		assert!(err.to_string().contains("EPSG:31467"));
	}

	#[test]
	fn custom_projection_overrides() {
		#[derive(Debug)]
		struct Flip;
		impl Projection for Flip {
			fn forward(&self, (lon, lat): (f64, f64)) -> (f64, f64) {
				(lat, lon)
			}
			fn inverse(&self, (x, y): (f64, f64)) -> (f64, f64) {
				(y, x)
			}
		}

		let mut reg = registry();
		reg.register(31467, Arc::new(Flip));
		assert!(reg.supports(Srs::new(31467)));
		let p = reg.transform(Srs::WGS84, Srs::new(31467), (8.0, 50.0)).unwrap();
		assert_eq!(p, (50.0, 8.0));
	}

	#[test]
	fn bbox_transform_densifies_edges() {
		let reg = registry();
		// The top edge of a wide mercator box bulges north in lat/lon space;
		// the envelope must contain the bulge.
		let bbox = MapBBox::new(-10_000_000.0, 4_000_000.0, 10_000_000.0, 8_000_000.0);
		let geo = reg.transform_bbox(Srs::WEBMERCATOR, Srs::WGS84, &bbox).unwrap();
		assert!(geo.0 < -89.0 && geo.2 > 89.0);
		assert!(geo.3 > 57.0);
	}

	#[test]
	fn bbox_transform_clips_to_valid_area() {
		let reg = registry();
		let too_wide = MapBBox::new(-200.0, -95.0, 200.0, 95.0);
		let merc = reg.transform_bbox(Srs::WGS84, Srs::WEBMERCATOR, &too_wide).unwrap();
		let world = Srs::WEBMERCATOR.valid_bbox();
		assert!(merc.0 >= world.0 - 1.0 && merc.2 <= world.2 + 1.0);
	}
}
