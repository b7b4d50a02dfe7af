//! Geometric coverages.
//!
//! A coverage restricts where a source or cache is authoritative. It is a
//! bbox, a multi-polygon, or a boolean combination of sub-coverages, always
//! tagged with the SRS its coordinates live in. The tile manager only needs
//! the predicate interface (`contains` / `intersects`) plus mask
//! rasterization for clipping; heavier geometry engines can pre-simplify
//! the rings before they get here.
//!
//! `contains` may under-report and `intersects` may over-report for nested
//! boolean combinations; both directions are safe (an extra clip or an
//! extra source request, never a wrong pixel).

use crate::{CoverageError, MapBBox, Srs, SrsRegistry};
use anyhow::{bail, ensure, Context, Result};

/// A closed ring of `[x, y]` vertices. First and last vertex are the same.
pub type Ring = Vec<[f64; 2]>;

/// One outer ring plus any number of holes.
#[derive(Debug, Clone, PartialEq)]
pub struct PolygonGeom {
	pub rings: Vec<Ring>,
}

impl PolygonGeom {
	pub fn new(rings: Vec<Ring>) -> Result<PolygonGeom> {
		ensure!(!rings.is_empty(), CoverageError::InvalidGeometry("polygon without rings".to_string()));
		for ring in &rings {
			ensure!(
				ring.len() >= 4,
				CoverageError::InvalidGeometry(format!("ring with only {} vertices", ring.len()))
			);
			ensure!(
				ring.first() == ring.last(),
				CoverageError::InvalidGeometry("ring is not closed".to_string())
			);
		}
		Ok(PolygonGeom { rings })
	}

	fn bbox(&self) -> MapBBox {
		let mut bbox: Option<MapBBox> = None;
		for [x, y] in self.rings.iter().flatten() {
			let point = MapBBox::new(*x, *y, *x, *y);
			match &mut bbox {
				Some(b) => b.extend(&point),
				None => bbox = Some(point),
			}
		}
		bbox.unwrap()
	}

	/// Even-odd point-in-polygon over all rings (holes cancel out).
	fn contains_point(&self, x: f64, y: f64) -> bool {
		let mut inside = false;
		for ring in &self.rings {
			for pair in ring.windows(2) {
				let [x1, y1] = pair[0];
				let [x2, y2] = pair[1];
				if (y1 > y) != (y2 > y) {
					let x_cross = x1 + (y - y1) / (y2 - y1) * (x2 - x1);
					if x < x_cross {
						inside = !inside;
					}
				}
			}
		}
		inside
	}

	fn any_edge_intersects_bbox(&self, bbox: &MapBBox) -> bool {
		self.rings.iter().any(|ring| {
			ring.windows(2).any(|pair| {
				segment_intersects_bbox(pair[0], pair[1], bbox)
			})
		})
	}
}

fn segment_intersects_bbox(a: [f64; 2], b: [f64; 2], bbox: &MapBBox) -> bool {
	// trivial accept/reject first
	if bbox.contains_point(a[0], a[1]) || bbox.contains_point(b[0], b[1]) {
		return true;
	}
	if (a[0] < bbox.0 && b[0] < bbox.0)
		|| (a[0] > bbox.2 && b[0] > bbox.2)
		|| (a[1] < bbox.1 && b[1] < bbox.1)
		|| (a[1] > bbox.3 && b[1] > bbox.3)
	{
		return false;
	}
	let corners = [
		[bbox.0, bbox.1],
		[bbox.2, bbox.1],
		[bbox.2, bbox.3],
		[bbox.0, bbox.3],
	];
	(0..4).any(|i| segments_cross(a, b, corners[i], corners[(i + 1) % 4]))
}

fn segments_cross(a: [f64; 2], b: [f64; 2], c: [f64; 2], d: [f64; 2]) -> bool {
	fn orient(p: [f64; 2], q: [f64; 2], r: [f64; 2]) -> f64 {
		(q[0] - p[0]) * (r[1] - p[1]) - (q[1] - p[1]) * (r[0] - p[0])
	}
	let o1 = orient(a, b, c);
	let o2 = orient(a, b, d);
	let o3 = orient(c, d, a);
	let o4 = orient(c, d, b);
	(o1 * o2 < 0.0) && (o3 * o4 < 0.0)
}

#[derive(Debug, Clone, PartialEq)]
enum CoverageGeom {
	/// The bbox alone is the geometry.
	BBox,
	MultiPolygon(Vec<PolygonGeom>),
	Union(Vec<Coverage>),
	Intersection(Vec<Coverage>),
	/// First minus the rest.
	Difference(Vec<Coverage>),
	Empty,
}

/// A geometric region in one SRS, used to gate source requests and cache
/// writes.
#[derive(Debug, Clone, PartialEq)]
pub struct Coverage {
	srs: Srs,
	bbox: MapBBox,
	geom: CoverageGeom,
}

impl Coverage {
	pub fn bbox(srs: Srs, bbox: MapBBox) -> Coverage {
		Coverage {
			srs,
			bbox,
			geom: CoverageGeom::BBox,
		}
	}

	pub fn polygon(srs: Srs, polygons: Vec<PolygonGeom>) -> Result<Coverage> {
		ensure!(
			!polygons.is_empty(),
			CoverageError::InvalidGeometry("multi-polygon without polygons".to_string())
		);
		let mut bbox = polygons[0].bbox();
		for polygon in &polygons[1..] {
			bbox.extend(&polygon.bbox());
		}
		Ok(Coverage {
			srs,
			bbox,
			geom: CoverageGeom::MultiPolygon(polygons),
		})
	}

	/// The empty coverage; a no-op for seeding, never contains or
	/// intersects anything.
	pub fn empty(srs: Srs) -> Coverage {
		Coverage {
			srs,
			bbox: MapBBox::new(0.0, 0.0, 0.0, 0.0),
			geom: CoverageGeom::Empty,
		}
	}

	pub fn union(parts: Vec<Coverage>) -> Result<Coverage> {
		Self::combine(parts, false)
	}

	pub fn intersection(parts: Vec<Coverage>) -> Result<Coverage> {
		let coverage = Self::combine(parts, true)?;
		// disjoint parts can only produce the empty coverage
		if coverage.bbox.is_degenerate() {
			return Ok(Coverage::empty(coverage.srs));
		}
		Ok(coverage)
	}

	pub fn difference(parts: Vec<Coverage>) -> Result<Coverage> {
		ensure!(parts.len() >= 2, CoverageError::InvalidGeometry("difference needs >= 2 parts".to_string()));
		// subtracting a coverage from itself leaves nothing
		if parts[1..].contains(&parts[0]) {
			return Ok(Coverage::empty(parts[0].srs));
		}
		let srs = parts[0].srs;
		let bbox = parts[0].bbox;
		for part in &parts {
			ensure!(part.srs == srs, CoverageError::InvalidGeometry("difference parts must share one SRS".to_string()));
		}
		Ok(Coverage {
			srs,
			bbox,
			geom: CoverageGeom::Difference(parts),
		})
	}

	fn combine(parts: Vec<Coverage>, intersection: bool) -> Result<Coverage> {
		ensure!(!parts.is_empty(), CoverageError::InvalidGeometry("empty combination".to_string()));
		let srs = parts[0].srs;
		for part in &parts {
			ensure!(part.srs == srs, CoverageError::InvalidGeometry("combined parts must share one SRS".to_string()));
		}
		let mut bbox = parts[0].bbox;
		for part in &parts[1..] {
			if intersection {
				bbox.intersect(&part.bbox);
			} else {
				bbox.extend(&part.bbox);
			}
		}
		Ok(Coverage {
			srs,
			bbox,
			geom: if intersection {
				CoverageGeom::Intersection(parts)
			} else {
				CoverageGeom::Union(parts)
			},
		})
	}

	pub fn srs(&self) -> Srs {
		self.srs
	}

	/// The envelope of the coverage in its own SRS.
	pub fn extent(&self) -> &MapBBox {
		&self.bbox
	}

	pub fn is_empty(&self) -> bool {
		matches!(self.geom, CoverageGeom::Empty)
	}

	/// Whether `bbox` (in the coverage SRS) lies completely inside.
	pub fn contains(&self, bbox: &MapBBox) -> bool {
		match &self.geom {
			CoverageGeom::Empty => false,
			CoverageGeom::BBox => self.bbox.contains_bbox(bbox),
			CoverageGeom::MultiPolygon(polygons) => {
				if !self.bbox.contains_bbox(bbox) {
					return false;
				}
				polygons.iter().any(|p| {
					let corners_inside = [
						(bbox.0, bbox.1),
						(bbox.2, bbox.1),
						(bbox.2, bbox.3),
						(bbox.0, bbox.3),
					]
					.iter()
					.all(|(x, y)| p.contains_point(*x, *y));
					corners_inside && !p.any_edge_intersects_bbox(bbox)
				})
			}
			CoverageGeom::Union(parts) => parts.iter().any(|p| p.contains(bbox)),
			CoverageGeom::Intersection(parts) => parts.iter().all(|p| p.contains(bbox)),
			CoverageGeom::Difference(parts) => {
				parts[0].contains(bbox) && !parts[1..].iter().any(|p| p.intersects(bbox))
			}
		}
	}

	/// Whether `bbox` (in the coverage SRS) shares any area.
	pub fn intersects(&self, bbox: &MapBBox) -> bool {
		match &self.geom {
			CoverageGeom::Empty => false,
			CoverageGeom::BBox => self.bbox.intersects(bbox),
			CoverageGeom::MultiPolygon(polygons) => {
				if !self.bbox.intersects(bbox) {
					return false;
				}
				polygons.iter().any(|p| {
					[
						(bbox.0, bbox.1),
						(bbox.2, bbox.1),
						(bbox.2, bbox.3),
						(bbox.0, bbox.3),
					]
					.iter()
					.any(|(x, y)| p.contains_point(*x, *y))
						|| p.rings.iter().flatten().any(|[x, y]| bbox.contains_point(*x, *y))
						|| p.any_edge_intersects_bbox(bbox)
				})
			}
			CoverageGeom::Union(parts) => parts.iter().any(|p| p.intersects(bbox)),
			CoverageGeom::Intersection(parts) => parts.iter().all(|p| p.intersects(bbox)),
			CoverageGeom::Difference(parts) => parts[0].intersects(bbox),
		}
	}

	/// Reprojects the coverage into `srs`, densifying polygon edges is the
	/// caller's concern (rings are transformed vertex by vertex).
	pub fn transform_to(&self, srs: Srs, registry: &SrsRegistry) -> Result<Coverage> {
		if srs == self.srs {
			return Ok(self.clone());
		}
		let bbox = registry.transform_bbox(self.srs, srs, &self.bbox)?;
		let geom = match &self.geom {
			CoverageGeom::Empty => CoverageGeom::Empty,
			CoverageGeom::BBox => CoverageGeom::BBox,
			CoverageGeom::MultiPolygon(polygons) => {
				let mut out = Vec::with_capacity(polygons.len());
				for polygon in polygons {
					let mut rings = Vec::with_capacity(polygon.rings.len());
					for ring in &polygon.rings {
						let mut transformed = Vec::with_capacity(ring.len());
						for [x, y] in ring {
							let (tx, ty) = registry.transform(self.srs, srs, (*x, *y))?;
							transformed.push([tx, ty]);
						}
						rings.push(transformed);
					}
					out.push(PolygonGeom { rings });
				}
				CoverageGeom::MultiPolygon(out)
			}
			CoverageGeom::Union(parts) => CoverageGeom::Union(Self::transform_parts(parts, srs, registry)?),
			CoverageGeom::Intersection(parts) => {
				CoverageGeom::Intersection(Self::transform_parts(parts, srs, registry)?)
			}
			CoverageGeom::Difference(parts) => {
				CoverageGeom::Difference(Self::transform_parts(parts, srs, registry)?)
			}
		};
		Ok(Coverage { srs, bbox, geom })
	}

	fn transform_parts(parts: &[Coverage], srs: Srs, registry: &SrsRegistry) -> Result<Vec<Coverage>> {
		parts.iter().map(|p| p.transform_to(srs, registry)).collect()
	}

	/// Rasterizes the coverage into an alpha mask (0 = outside, 255 =
	/// inside) for an image of `size` pixels covering `bbox` (y down).
	/// Clipping that turns a polygon into several parts needs no special
	/// casing here; every covered pixel is decided independently.
	pub fn rasterize_mask(&self, bbox: &MapBBox, size: (u32, u32)) -> Vec<u8> {
		let (w, h) = size;
		let mut mask = vec![0u8; (w as usize) * (h as usize)];
		if self.is_empty() || w == 0 || h == 0 {
			return mask;
		}
		let step_x = bbox.width() / f64::from(w);
		let step_y = bbox.height() / f64::from(h);
		for row in 0..h {
			let y = bbox.3 - (f64::from(row) + 0.5) * step_y;
			for col in 0..w {
				let x = bbox.0 + (f64::from(col) + 0.5) * step_x;
				if self.covers_point(x, y) {
					mask[(row * w + col) as usize] = 255;
				}
			}
		}
		mask
	}

	fn covers_point(&self, x: f64, y: f64) -> bool {
		match &self.geom {
			CoverageGeom::Empty => false,
			CoverageGeom::BBox => self.bbox.contains_point(x, y),
			CoverageGeom::MultiPolygon(polygons) => polygons.iter().any(|p| p.contains_point(x, y)),
			CoverageGeom::Union(parts) => parts.iter().any(|p| p.covers_point(x, y)),
			CoverageGeom::Intersection(parts) => parts.iter().all(|p| p.covers_point(x, y)),
			CoverageGeom::Difference(parts) => {
				parts[0].covers_point(x, y) && !parts[1..].iter().any(|p| p.covers_point(x, y))
			}
		}
	}

	/// Builds a coverage from a GeoJSON geometry, feature or feature
	/// collection (`Polygon` and `MultiPolygon` geometries only).
	pub fn from_geojson(srs: Srs, json: &str) -> Result<Coverage> {
		let value: serde_json::Value = serde_json::from_str(json)
			.map_err(|e| CoverageError::Parse(format!("invalid GeoJSON: {e}")))?;
		let mut polygons = Vec::new();
		collect_geojson_polygons(&value, &mut polygons)?;
		ensure!(
			!polygons.is_empty(),
			CoverageError::Parse("GeoJSON contains no polygon geometry".to_string())
		);
		Coverage::polygon(srs, polygons)
	}

	/// Builds a coverage from WKT `POLYGON` or `MULTIPOLYGON` text.
	pub fn from_wkt(srs: Srs, wkt: &str) -> Result<Coverage> {
		let trimmed = wkt.trim();
		let upper = trimmed.to_uppercase();
		let polygons = if let Some(rest) = upper.strip_prefix("MULTIPOLYGON") {
			let body = &trimmed[trimmed.len() - rest.len()..];
			parse_wkt_multipolygon(body)?
		} else if let Some(rest) = upper.strip_prefix("POLYGON") {
			let body = &trimmed[trimmed.len() - rest.len()..];
			vec![parse_wkt_polygon(body)?]
		} else {
			bail!(CoverageError::Parse("expected POLYGON or MULTIPOLYGON".to_string()));
		};
		Coverage::polygon(srs, polygons)
	}
}

fn collect_geojson_polygons(value: &serde_json::Value, out: &mut Vec<PolygonGeom>) -> Result<()> {
	match value.get("type").and_then(|t| t.as_str()) {
		Some("FeatureCollection") => {
			for feature in value
				.get("features")
				.and_then(|f| f.as_array())
				.map(|a| a.as_slice())
				.unwrap_or_default()
			{
				collect_geojson_polygons(feature, out)?;
			}
		}
		Some("Feature") => {
			if let Some(geometry) = value.get("geometry") {
				collect_geojson_polygons(geometry, out)?;
			}
		}
		Some("Polygon") => {
			let coords = value
				.get("coordinates")
				.context("Polygon without coordinates")?;
			out.push(geojson_polygon(coords)?);
		}
		Some("MultiPolygon") => {
			let coords = value
				.get("coordinates")
				.and_then(|c| c.as_array())
				.context("MultiPolygon without coordinates")?;
			for polygon in coords {
				out.push(geojson_polygon(polygon)?);
			}
		}
		// points/lines contribute nothing to an area coverage
		Some(_) => {}
		None => bail!(CoverageError::Parse("GeoJSON object without type".to_string())),
	}
	Ok(())
}

fn geojson_polygon(coords: &serde_json::Value) -> Result<PolygonGeom> {
	let rings_json = coords.as_array().context("polygon coordinates must be an array")?;
	let mut rings = Vec::with_capacity(rings_json.len());
	for ring_json in rings_json {
		let vertices = ring_json.as_array().context("ring must be an array")?;
		let mut ring = Vec::with_capacity(vertices.len());
		for vertex in vertices {
			let pair = vertex.as_array().context("vertex must be an array")?;
			ensure!(pair.len() >= 2, CoverageError::Parse("vertex with < 2 values".to_string()));
			ring.push([
				pair[0].as_f64().context("vertex x must be a number")?,
				pair[1].as_f64().context("vertex y must be a number")?,
			]);
		}
		rings.push(ring);
	}
	PolygonGeom::new(rings)
}

fn parse_wkt_polygon(body: &str) -> Result<PolygonGeom> {
	let inner = strip_parens(body.trim())?;
	let mut rings = Vec::new();
	for ring_text in split_top_level(inner) {
		let ring_inner = strip_parens(ring_text.trim())?;
		let mut ring = Vec::new();
		for vertex in ring_inner.split(',') {
			let mut numbers = vertex.split_whitespace();
			let x: f64 = numbers
				.next()
				.context("WKT vertex without x")?
				.parse()
				.map_err(|_| CoverageError::Parse(format!("bad WKT number in '{vertex}'")))?;
			let y: f64 = numbers
				.next()
				.context("WKT vertex without y")?
				.parse()
				.map_err(|_| CoverageError::Parse(format!("bad WKT number in '{vertex}'")))?;
			ring.push([x, y]);
		}
		rings.push(ring);
	}
	PolygonGeom::new(rings)
}

fn parse_wkt_multipolygon(body: &str) -> Result<Vec<PolygonGeom>> {
	let inner = strip_parens(body.trim())?;
	split_top_level(inner).iter().map(|p| parse_wkt_polygon(p)).collect()
}

fn strip_parens(text: &str) -> Result<&str> {
	let text = text.trim();
	if text.starts_with('(') && text.ends_with(')') {
		Ok(&text[1..text.len() - 1])
	} else {
		bail!(CoverageError::Parse(format!("expected parenthesized WKT group, got '{text}'")))
	}
}

/// Splits `(a), (b), (c)` into the parenthesized groups at depth zero.
fn split_top_level(text: &str) -> Vec<String> {
	let mut parts = Vec::new();
	let mut depth = 0usize;
	let mut start = None;
	for (i, c) in text.char_indices() {
		match c {
			'(' => {
				if depth == 0 {
					start = Some(i);
				}
				depth += 1;
			}
			')' => {
				depth -= 1;
				if depth == 0 {
					if let Some(s) = start.take() {
						parts.push(text[s..=i].to_string());
					}
				}
			}
			_ => {}
		}
	}
	parts
}

#[cfg(test)]
mod tests {
	use super::*;

	fn unit_square() -> Coverage {
		Coverage::polygon(
			Srs::WGS84,
			vec![PolygonGeom::new(vec![vec![
				[0.0, 0.0],
				[10.0, 0.0],
				[10.0, 10.0],
				[0.0, 10.0],
				[0.0, 0.0],
			]])
			.unwrap()],
		)
		.unwrap()
	}

	#[test]
	fn bbox_coverage_predicates() {
		let cov = Coverage::bbox(Srs::WGS84, MapBBox::new(0.0, 0.0, 10.0, 10.0));
		assert!(cov.contains(&MapBBox::new(1.0, 1.0, 9.0, 9.0)));
		assert!(!cov.contains(&MapBBox::new(-1.0, 1.0, 9.0, 9.0)));
		assert!(cov.intersects(&MapBBox::new(9.0, 9.0, 20.0, 20.0)));
		assert!(!cov.intersects(&MapBBox::new(11.0, 11.0, 20.0, 20.0)));
	}

	#[test]
	fn polygon_coverage_predicates() {
		let cov = unit_square();
		assert!(cov.contains(&MapBBox::new(2.0, 2.0, 8.0, 8.0)));
		assert!(!cov.contains(&MapBBox::new(-2.0, 2.0, 8.0, 8.0)));
		assert!(cov.intersects(&MapBBox::new(8.0, 8.0, 12.0, 12.0)));
		assert!(!cov.intersects(&MapBBox::new(10.5, 10.5, 12.0, 12.0)));
	}

	#[test]
	fn polygon_with_hole() {
		let cov = Coverage::polygon(
			Srs::WGS84,
			vec![PolygonGeom::new(vec![
				vec![[0.0, 0.0], [10.0, 0.0], [10.0, 10.0], [0.0, 10.0], [0.0, 0.0]],
				vec![[4.0, 4.0], [6.0, 4.0], [6.0, 6.0], [4.0, 6.0], [4.0, 4.0]],
			])
			.unwrap()],
		)
		.unwrap();
		// the hole is not covered
		assert!(!cov.contains(&MapBBox::new(4.5, 4.5, 5.5, 5.5)));
		assert!(cov.contains(&MapBBox::new(1.0, 1.0, 3.0, 3.0)));
	}

	#[test]
	fn union_and_intersection_predicates() {
		let left = Coverage::bbox(Srs::WGS84, MapBBox::new(0.0, 0.0, 10.0, 10.0));
		let right = Coverage::bbox(Srs::WGS84, MapBBox::new(5.0, 0.0, 15.0, 10.0));

		let union = Coverage::union(vec![left.clone(), right.clone()]).unwrap();
		assert!(union.contains(&MapBBox::new(12.0, 1.0, 14.0, 9.0)));
		assert_eq!(union.extent().as_array(), [0.0, 0.0, 15.0, 10.0]);

		let inter = Coverage::intersection(vec![left.clone(), right.clone()]).unwrap();
		assert!(inter.contains(&MapBBox::new(6.0, 1.0, 9.0, 9.0)));
		assert!(!inter.contains(&MapBBox::new(1.0, 1.0, 4.0, 4.0)));
		assert_eq!(inter.extent().as_array(), [5.0, 0.0, 10.0, 10.0]);

		// commutativity
		let inter_rev = Coverage::intersection(vec![right, left]).unwrap();
		assert_eq!(inter.extent(), inter_rev.extent());
	}

	#[test]
	fn disjoint_intersection_is_empty() {
		let a = Coverage::bbox(Srs::WGS84, MapBBox::new(0.0, 0.0, 1.0, 1.0));
		let b = Coverage::bbox(Srs::WGS84, MapBBox::new(5.0, 5.0, 6.0, 6.0));
		let inter = Coverage::intersection(vec![a, b]).unwrap();
		assert!(inter.is_empty());
		assert!(!inter.intersects(&MapBBox::new(0.0, 0.0, 10.0, 10.0)));
	}

	#[test]
	fn difference_of_self_is_empty() {
		let a = unit_square();
		let diff = Coverage::difference(vec![a.clone(), a]).unwrap();
		assert!(diff.is_empty());
	}

	#[test]
	fn difference_predicates() {
		let outer = Coverage::bbox(Srs::WGS84, MapBBox::new(0.0, 0.0, 10.0, 10.0));
		let cutout = Coverage::bbox(Srs::WGS84, MapBBox::new(4.0, 4.0, 6.0, 6.0));
		let diff = Coverage::difference(vec![outer, cutout]).unwrap();
		assert!(diff.contains(&MapBBox::new(0.5, 0.5, 3.0, 3.0)));
		assert!(!diff.contains(&MapBBox::new(4.5, 4.5, 5.5, 5.5)));
		assert!(!diff.contains(&MapBBox::new(3.0, 3.0, 7.0, 7.0)));
	}

	#[test]
	fn empty_coverage_is_inert() {
		let empty = Coverage::empty(Srs::WGS84);
		assert!(!empty.contains(&MapBBox::new(0.0, 0.0, 1.0, 1.0)));
		assert!(!empty.intersects(&MapBBox::new(0.0, 0.0, 1.0, 1.0)));
		assert!(empty.rasterize_mask(&MapBBox::new(0.0, 0.0, 1.0, 1.0), (4, 4)).iter().all(|v| *v == 0));
	}

	#[test]
	fn mask_rasterization() {
		let cov = unit_square();
		// image covering 0..20 x 0..20: left half of each row inside
		let mask = cov.rasterize_mask(&MapBBox::new(0.0, 0.0, 20.0, 20.0), (4, 4));
		#[rustfmt::skip]
		assert_eq!(
			mask,
			vec![
				0, 0, 0, 0,
				0, 0, 0, 0,
				255, 255, 0, 0,
				255, 255, 0, 0,
			]
		);
	}

	#[test]
	fn geojson_ingestion() {
		let json = r#"{
			"type": "Feature",
			"geometry": {
				"type": "Polygon",
				"coordinates": [[[0.0, 0.0], [10.0, 0.0], [10.0, 10.0], [0.0, 10.0], [0.0, 0.0]]]
			}
		}"#;
		let cov = Coverage::from_geojson(Srs::WGS84, json).unwrap();
		assert!(cov.contains(&MapBBox::new(1.0, 1.0, 9.0, 9.0)));
		assert_eq!(cov.extent().as_array(), [0.0, 0.0, 10.0, 10.0]);
	}

	#[test]
	fn geojson_without_polygons_is_rejected() {
		let json = r#"{"type": "Point", "coordinates": [1.0, 2.0]}"#;
		assert!(Coverage::from_geojson(Srs::WGS84, json).is_err());
	}

	#[test]
	fn wkt_ingestion() {
		let cov = Coverage::from_wkt(Srs::WGS84, "POLYGON ((0 0, 10 0, 10 10, 0 10, 0 0))").unwrap();
		assert!(cov.contains(&MapBBox::new(1.0, 1.0, 9.0, 9.0)));

		let multi = Coverage::from_wkt(
			Srs::WGS84,
			"MULTIPOLYGON (((0 0, 5 0, 5 5, 0 5, 0 0)), ((20 20, 25 20, 25 25, 20 25, 20 20)))",
		)
		.unwrap();
		assert!(multi.intersects(&MapBBox::new(21.0, 21.0, 22.0, 22.0)));
		assert!(!multi.intersects(&MapBBox::new(10.0, 10.0, 15.0, 15.0)));
	}

	#[test]
	fn transform_keeps_shape() {
		let reg = SrsRegistry::new();
		let cov = unit_square();
		let merc = cov.transform_to(Srs::WEBMERCATOR, &reg).unwrap();
		assert_eq!(merc.srs(), Srs::WEBMERCATOR);
		assert!(merc.contains(&MapBBox::new(200_000.0, 200_000.0, 400_000.0, 400_000.0)));
	}
}
