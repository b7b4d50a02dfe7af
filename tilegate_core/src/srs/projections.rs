//! Built-in projections: geodetic pass-through, spherical mercator and
//! ellipsoidal transverse mercator (UTM).

use std::f64::consts::PI;
use std::sync::Arc;

/// A projection maps geographic WGS84 coordinates (lon/lat in degrees) to
/// projected coordinates and back. External geodesy engines plug in here.
pub trait Projection: Send + Sync + std::fmt::Debug {
	/// Geographic (lon, lat) in degrees → projected (x, y).
	fn forward(&self, lonlat: (f64, f64)) -> (f64, f64);
	/// Projected (x, y) → geographic (lon, lat) in degrees.
	fn inverse(&self, xy: (f64, f64)) -> (f64, f64);
}

/// Resolves the built-in projection for an EPSG code.
pub(super) fn builtin(code: u32) -> Option<Arc<dyn Projection>> {
	match code {
		84 | 4326 | 4258 | 4267 | 4269 | 4301 | 4817 => Some(Arc::new(Geodetic)),
		3857 | 900913 | 102100 | 102113 => Some(Arc::new(SphericalMercator)),
		// ETRS89 / UTM zones 28N..38N
		25828..=25838 => Some(Arc::new(TransverseMercator::utm((code - 25800) as u8, false))),
		// WGS84 / UTM north and south
		32601..=32660 => Some(Arc::new(TransverseMercator::utm((code - 32600) as u8, false))),
		32701..=32760 => Some(Arc::new(TransverseMercator::utm((code - 32700) as u8, true))),
		_ => None,
	}
}

/// Identity projection for geographic systems.
#[derive(Debug)]
struct Geodetic;

impl Projection for Geodetic {
	fn forward(&self, lonlat: (f64, f64)) -> (f64, f64) {
		lonlat
	}
	fn inverse(&self, xy: (f64, f64)) -> (f64, f64) {
		xy
	}
}

/// Web mercator (EPSG:3857). Latitudes are clamped to the projection's
/// defined range so poles map to finite coordinates.
#[derive(Debug)]
pub struct SphericalMercator;

const EARTH_RADIUS: f64 = 6378137.0;
const MERCATOR_MAX_LAT: f64 = 85.05112877980659;

impl Projection for SphericalMercator {
	fn forward(&self, (lon, lat): (f64, f64)) -> (f64, f64) {
		let lat = lat.clamp(-MERCATOR_MAX_LAT, MERCATOR_MAX_LAT);
		let x = EARTH_RADIUS * lon.to_radians();
		let y = EARTH_RADIUS * (PI / 4.0 + lat.to_radians() / 2.0).tan().ln();
		(x, y)
	}

	fn inverse(&self, (x, y): (f64, f64)) -> (f64, f64) {
		let lon = (x / EARTH_RADIUS).to_degrees();
		let lat = (2.0 * (y / EARTH_RADIUS).exp().atan() - PI / 2.0).to_degrees();
		(lon, lat)
	}
}

/// Ellipsoidal transverse mercator on GRS80/WGS84 (the two are identical at
/// the series precision used here), after Krüger/Karney. Accurate to well
/// under a millimeter within a UTM zone.
#[derive(Debug)]
pub struct TransverseMercator {
	lon0: f64,
	k0: f64,
	false_easting: f64,
	false_northing: f64,
	// derived ellipsoid constants
	a_hat: f64,
	e: f64,
	alpha: [f64; 3],
	beta: [f64; 3],
}

impl TransverseMercator {
	const A: f64 = 6378137.0;
	const F: f64 = 1.0 / 298.257222101;

	pub fn new(lon0: f64, k0: f64, false_easting: f64, false_northing: f64) -> TransverseMercator {
		let n = Self::F / (2.0 - Self::F);
		let n2 = n * n;
		let n3 = n2 * n;
		let a_hat = Self::A / (1.0 + n) * (1.0 + n2 / 4.0 + n2 * n2 / 64.0);
		let e = (Self::F * (2.0 - Self::F)).sqrt();
		TransverseMercator {
			lon0,
			k0,
			false_easting,
			false_northing,
			a_hat,
			e,
			alpha: [
				n / 2.0 - 2.0 * n2 / 3.0 + 5.0 * n3 / 16.0,
				13.0 * n2 / 48.0 - 3.0 * n3 / 5.0,
				61.0 * n3 / 240.0,
			],
			beta: [
				n / 2.0 - 2.0 * n2 / 3.0 + 37.0 * n3 / 96.0,
				n2 / 48.0 + n3 / 15.0,
				17.0 * n3 / 480.0,
			],
		}
	}

	/// Standard UTM parameters for `zone` (1..=60).
	pub fn utm(zone: u8, south: bool) -> TransverseMercator {
		let lon0 = f64::from(zone) * 6.0 - 183.0;
		let false_northing = if south { 10_000_000.0 } else { 0.0 };
		TransverseMercator::new(lon0, 0.9996, 500_000.0, false_northing)
	}
}

impl Projection for TransverseMercator {
	fn forward(&self, (lon, lat): (f64, f64)) -> (f64, f64) {
		let phi = lat.to_radians();
		let lambda = (lon - self.lon0).to_radians();

		let t = (phi.sin().atanh() - self.e * (self.e * phi.sin()).atanh()).sinh();
		let xi = (t / lambda.cos()).atan();
		let eta = (lambda.sin() / (t * t + lambda.cos() * lambda.cos()).sqrt()).asinh();

		let mut xi_sum = xi;
		let mut eta_sum = eta;
		for (j, a) in self.alpha.iter().enumerate() {
			let k = 2.0 * (j as f64 + 1.0);
			xi_sum += a * (k * xi).sin() * (k * eta).cosh();
			eta_sum += a * (k * xi).cos() * (k * eta).sinh();
		}

		(
			self.false_easting + self.k0 * self.a_hat * eta_sum,
			self.false_northing + self.k0 * self.a_hat * xi_sum,
		)
	}

	fn inverse(&self, (x, y): (f64, f64)) -> (f64, f64) {
		let xi = (y - self.false_northing) / (self.k0 * self.a_hat);
		let eta = (x - self.false_easting) / (self.k0 * self.a_hat);

		let mut xi_p = xi;
		let mut eta_p = eta;
		for (j, b) in self.beta.iter().enumerate() {
			let k = 2.0 * (j as f64 + 1.0);
			xi_p -= b * (k * xi).sin() * (k * eta).cosh();
			eta_p -= b * (k * xi).cos() * (k * eta).sinh();
		}

		let tau_p = xi_p.sin() / (eta_p.sinh().powi(2) + xi_p.cos().powi(2)).sqrt();
		let lambda = (eta_p.sinh() / xi_p.cos()).atan();

		// Newton iteration recovering the ellipsoidal tan(phi) from the
		// conformal tan(chi).
		let mut tau = tau_p;
		for _ in 0..5 {
			let sigma = (self.e * (self.e * tau / (1.0 + tau * tau).sqrt()).atanh()).sinh();
			let tau_i = tau * (1.0 + sigma * sigma).sqrt() - sigma * (1.0 + tau * tau).sqrt();
			let d_tau = (tau_p - tau_i) * (1.0 + (1.0 - self.e * self.e) * tau * tau)
				/ ((1.0 - self.e * self.e) * (1.0 + tau * tau).sqrt() * (1.0 + tau_i * tau_i).sqrt());
			tau += d_tau;
			if d_tau.abs() < 1e-14 {
				break;
			}
		}

		(self.lon0 + lambda.to_degrees(), tau.atan().to_degrees())
	}
}
