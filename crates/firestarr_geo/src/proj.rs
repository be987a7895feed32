//! Coordinate reference systems and pure-Rust projection math.
//!
//! Implements the two projections the pipeline needs without linking PROJ:
//! transverse Mercator (the UTM zone rasters the simulator runs in) and the
//! secant Lambert conformal conic used as the comparison CRS for area
//! computation and output merging (EPSG:3978, Canada Atlas Lambert).
//!
//! Series expansions follow Snyder, "Map Projections - A Working Manual"
//! (USGS PP 1395), eq. 8-9..8-25 and 15-1..15-11.

use crate::{GeoError, Result};
use serde::{Deserialize, Serialize};

/// Semi-major axis / flattening pairs for the ellipsoids in play.
#[derive(Debug, Clone, Copy, PartialEq)]
struct Ellipsoid {
    a: f64,
    f: f64,
}

const WGS84: Ellipsoid = Ellipsoid {
    a: 6_378_137.0,
    f: 1.0 / 298.257_223_563,
};
const GRS80: Ellipsoid = Ellipsoid {
    a: 6_378_137.0,
    f: 1.0 / 298.257_222_101,
};

impl Ellipsoid {
    fn e2(&self) -> f64 {
        self.f * (2.0 - self.f)
    }
}

/// The coordinate systems the pipeline works in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Crs {
    /// Geographic WGS84 (EPSG:4326), coordinates are lon/lat degrees.
    Wgs84,
    /// UTM on WGS84 (EPSG:326xx north / 327xx south).
    Utm { zone: u8, north: bool },
    /// Canada Atlas Lambert (EPSG:3978), NAD83 / GRS80.
    LambertCanada,
}

impl Crs {
    pub fn epsg(&self) -> u32 {
        match self {
            Crs::Wgs84 => 4326,
            Crs::Utm { zone, north: true } => 32600 + u32::from(*zone),
            Crs::Utm { zone, north: false } => 32700 + u32::from(*zone),
            Crs::LambertCanada => 3978,
        }
    }

    pub fn from_epsg(code: u32) -> Option<Crs> {
        match code {
            4326 => Some(Crs::Wgs84),
            3978 => Some(Crs::LambertCanada),
            32601..=32660 => Some(Crs::Utm {
                zone: (code - 32600) as u8,
                north: true,
            }),
            32701..=32760 => Some(Crs::Utm {
                zone: (code - 32700) as u8,
                north: false,
            }),
            _ => None,
        }
    }

    fn ellipsoid(&self) -> Ellipsoid {
        match self {
            Crs::Wgs84 | Crs::Utm { .. } => WGS84,
            Crs::LambertCanada => GRS80,
        }
    }
}

impl std::fmt::Display for Crs {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "EPSG:{}", self.epsg())
    }
}

/// UTM zone containing a longitude.
pub fn utm_zone_for_lon(lon: f64) -> u8 {
    (((lon + 180.0) / 6.0).floor() as i32 + 1).clamp(1, 60) as u8
}

/// Central meridian of a UTM zone in degrees.
pub fn utm_central_meridian(zone: u8) -> f64 {
    f64::from(zone) * 6.0 - 183.0
}

/// Transform a coordinate pair between two CRS.
///
/// Geographic coordinates are (lon, lat) in degrees; projected coordinates
/// are (easting, northing) in meters.
pub fn transform(x: f64, y: f64, from: Crs, to: Crs) -> Result<(f64, f64)> {
    if from == to {
        return Ok((x, y));
    }
    let (lon, lat) = to_lonlat(x, y, from)?;
    from_lonlat(lon, lat, to)
}

fn to_lonlat(x: f64, y: f64, crs: Crs) -> Result<(f64, f64)> {
    match crs {
        Crs::Wgs84 => Ok((x, y)),
        Crs::Utm { zone, north } => tm_inverse(&crs.ellipsoid(), zone, north, x, y),
        Crs::LambertCanada => lcc_inverse(&crs.ellipsoid(), x, y),
    }
}

fn from_lonlat(lon: f64, lat: f64, crs: Crs) -> Result<(f64, f64)> {
    if !(-90.0..=90.0).contains(&lat) {
        return Err(GeoError::Projection(format!(
            "latitude {lat} out of range [-90, 90]"
        )));
    }
    match crs {
        Crs::Wgs84 => Ok((lon, lat)),
        Crs::Utm { zone, north } => tm_forward(&crs.ellipsoid(), zone, north, lon, lat),
        Crs::LambertCanada => lcc_forward(&crs.ellipsoid(), lon, lat),
    }
}

// ---------------------------------------------------------------------------
// Transverse Mercator (Snyder 8-9..8-25), UTM parameterization
// ---------------------------------------------------------------------------

const UTM_K0: f64 = 0.9996;
const UTM_FALSE_EASTING: f64 = 500_000.0;
const UTM_FALSE_NORTHING_S: f64 = 10_000_000.0;

/// Meridional arc length from the equator (Snyder 3-21).
fn meridional_arc(ell: &Ellipsoid, phi: f64) -> f64 {
    let e2 = ell.e2();
    let e4 = e2 * e2;
    let e6 = e4 * e2;
    ell.a
        * ((1.0 - e2 / 4.0 - 3.0 * e4 / 64.0 - 5.0 * e6 / 256.0) * phi
            - (3.0 * e2 / 8.0 + 3.0 * e4 / 32.0 + 45.0 * e6 / 1024.0) * (2.0 * phi).sin()
            + (15.0 * e4 / 256.0 + 45.0 * e6 / 1024.0) * (4.0 * phi).sin()
            - (35.0 * e6 / 3072.0) * (6.0 * phi).sin())
}

fn tm_forward(ell: &Ellipsoid, zone: u8, north: bool, lon: f64, lat: f64) -> Result<(f64, f64)> {
    let e2 = ell.e2();
    let ep2 = e2 / (1.0 - e2);
    let phi = lat.to_radians();
    let dlam = normalize_lon(lon - utm_central_meridian(zone)).to_radians();

    let sin_phi = phi.sin();
    let cos_phi = phi.cos();
    let n = ell.a / (1.0 - e2 * sin_phi * sin_phi).sqrt();
    let t = (sin_phi / cos_phi).powi(2);
    let c = ep2 * cos_phi * cos_phi;
    let a = dlam * cos_phi;
    let m = meridional_arc(ell, phi);

    let a2 = a * a;
    let a3 = a2 * a;
    let a4 = a3 * a;
    let a5 = a4 * a;
    let a6 = a5 * a;

    let x = UTM_K0
        * n
        * (a + (1.0 - t + c) * a3 / 6.0
            + (5.0 - 18.0 * t + t * t + 72.0 * c - 58.0 * ep2) * a5 / 120.0)
        + UTM_FALSE_EASTING;
    let mut y = UTM_K0
        * (m + n
            * (sin_phi / cos_phi)
            * (a2 / 2.0
                + (5.0 - t + 9.0 * c + 4.0 * c * c) * a4 / 24.0
                + (61.0 - 58.0 * t + t * t + 600.0 * c - 330.0 * ep2) * a6 / 720.0));
    if !north {
        y += UTM_FALSE_NORTHING_S;
    }
    Ok((x, y))
}

fn tm_inverse(ell: &Ellipsoid, zone: u8, north: bool, x: f64, y: f64) -> Result<(f64, f64)> {
    let e2 = ell.e2();
    let ep2 = e2 / (1.0 - e2);
    let e4 = e2 * e2;
    let e6 = e4 * e2;

    let x = x - UTM_FALSE_EASTING;
    let y = if north { y } else { y - UTM_FALSE_NORTHING_S };

    let m = y / UTM_K0;
    let mu = m / (ell.a * (1.0 - e2 / 4.0 - 3.0 * e4 / 64.0 - 5.0 * e6 / 256.0));
    let sqrt1me2 = (1.0 - e2).sqrt();
    let e1 = (1.0 - sqrt1me2) / (1.0 + sqrt1me2);
    let e1_2 = e1 * e1;
    let e1_3 = e1_2 * e1;
    let e1_4 = e1_3 * e1;

    // footpoint latitude (Snyder 3-26)
    let phi1 = mu
        + (3.0 * e1 / 2.0 - 27.0 * e1_3 / 32.0) * (2.0 * mu).sin()
        + (21.0 * e1_2 / 16.0 - 55.0 * e1_4 / 32.0) * (4.0 * mu).sin()
        + (151.0 * e1_3 / 96.0) * (6.0 * mu).sin()
        + (1097.0 * e1_4 / 512.0) * (8.0 * mu).sin();

    let sin_phi1 = phi1.sin();
    let cos_phi1 = phi1.cos();
    let c1 = ep2 * cos_phi1 * cos_phi1;
    let t1 = (sin_phi1 / cos_phi1).powi(2);
    let n1 = ell.a / (1.0 - e2 * sin_phi1 * sin_phi1).sqrt();
    let r1 = ell.a * (1.0 - e2) / (1.0 - e2 * sin_phi1 * sin_phi1).powf(1.5);
    let d = x / (n1 * UTM_K0);

    let d2 = d * d;
    let d3 = d2 * d;
    let d4 = d3 * d;
    let d5 = d4 * d;
    let d6 = d5 * d;

    let phi = phi1
        - (n1 * sin_phi1 / cos_phi1 / r1)
            * (d2 / 2.0
                - (5.0 + 3.0 * t1 + 10.0 * c1 - 4.0 * c1 * c1 - 9.0 * ep2) * d4 / 24.0
                + (61.0 + 90.0 * t1 + 298.0 * c1 + 45.0 * t1 * t1 - 252.0 * ep2 - 3.0 * c1 * c1)
                    * d6
                    / 720.0);
    let dlam = (d - (1.0 + 2.0 * t1 + c1) * d3 / 6.0
        + (5.0 - 2.0 * c1 + 28.0 * t1 - 3.0 * c1 * c1 + 8.0 * ep2 + 24.0 * t1 * t1) * d5 / 120.0)
        / cos_phi1;

    let lon = normalize_lon(utm_central_meridian(zone) + dlam.to_degrees());
    Ok((lon, phi.to_degrees()))
}

// ---------------------------------------------------------------------------
// Lambert conformal conic, secant form (Snyder 15-1..15-11)
// EPSG:3978 parameters: sp 49/77, origin 49N 95W, false origin 0/0
// ---------------------------------------------------------------------------

const LCC_SP1_DEG: f64 = 49.0;
const LCC_SP2_DEG: f64 = 77.0;
const LCC_LAT0_DEG: f64 = 49.0;
const LCC_LON0_DEG: f64 = -95.0;

struct LccParams {
    a: f64,
    e: f64,
    n: f64,
    f_big: f64,
    rho0: f64,
    lam0: f64,
}

fn lcc_params(ell: &Ellipsoid) -> LccParams {
    let e = ell.e2().sqrt();
    let m = |phi: f64| phi.cos() / (1.0 - ell.e2() * phi.sin().powi(2)).sqrt();
    let t = |phi: f64| {
        ((std::f64::consts::FRAC_PI_4 - phi / 2.0).tan())
            / (((1.0 - e * phi.sin()) / (1.0 + e * phi.sin())).powf(e / 2.0))
    };
    let phi1 = LCC_SP1_DEG.to_radians();
    let phi2 = LCC_SP2_DEG.to_radians();
    let phi0 = LCC_LAT0_DEG.to_radians();
    let (m1, m2) = (m(phi1), m(phi2));
    let (t1, t2) = (t(phi1), t(phi2));
    let n = (m1.ln() - m2.ln()) / (t1.ln() - t2.ln());
    let f_big = m1 / (n * t1.powf(n));
    let rho0 = ell.a * f_big * t(phi0).powf(n);
    LccParams {
        a: ell.a,
        e,
        n,
        f_big,
        rho0,
        lam0: LCC_LON0_DEG.to_radians(),
    }
}

fn lcc_forward(ell: &Ellipsoid, lon: f64, lat: f64) -> Result<(f64, f64)> {
    let p = lcc_params(ell);
    let phi = lat.to_radians();
    let lam = lon.to_radians();
    let t = ((std::f64::consts::FRAC_PI_4 - phi / 2.0).tan())
        / (((1.0 - p.e * phi.sin()) / (1.0 + p.e * phi.sin())).powf(p.e / 2.0));
    let rho = p.a * p.f_big * t.powf(p.n);
    let theta = p.n * normalize_lon((lam - p.lam0).to_degrees()).to_radians();
    Ok((rho * theta.sin(), p.rho0 - rho * theta.cos()))
}

fn lcc_inverse(ell: &Ellipsoid, x: f64, y: f64) -> Result<(f64, f64)> {
    let p = lcc_params(ell);
    let rho = (x * x + (p.rho0 - y) * (p.rho0 - y)).sqrt() * p.n.signum();
    let theta = x.atan2(p.rho0 - y);
    let t = (rho / (p.a * p.f_big)).powf(1.0 / p.n);
    // iterate Snyder 7-9 for the conformal latitude inverse
    let mut phi = std::f64::consts::FRAC_PI_2 - 2.0 * t.atan();
    for _ in 0..8 {
        let next = std::f64::consts::FRAC_PI_2
            - 2.0
                * (t * ((1.0 - p.e * phi.sin()) / (1.0 + p.e * phi.sin())).powf(p.e / 2.0)).atan();
        if (next - phi).abs() < 1e-12 {
            phi = next;
            break;
        }
        phi = next;
    }
    let lam = theta / p.n + p.lam0;
    Ok((normalize_lon(lam.to_degrees()), phi.to_degrees()))
}

fn normalize_lon(lon: f64) -> f64 {
    let mut l = lon;
    while l > 180.0 {
        l -= 360.0;
    }
    while l < -180.0 {
        l += 360.0;
    }
    l
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_utm_central_meridian_maps_to_false_easting() {
        let crs = Crs::Utm {
            zone: 15,
            north: true,
        };
        let (x, y) = transform(-93.0, 50.0, Crs::Wgs84, crs).unwrap();
        assert!((x - 500_000.0).abs() < 0.001, "x = {x}");
        assert!(y > 5_000_000.0 && y < 6_000_000.0, "y = {y}");
    }

    #[test]
    fn test_utm_roundtrip() {
        let crs = Crs::Utm {
            zone: 15,
            north: true,
        };
        for (lon, lat) in [(-89.024, 52.01), (-91.5, 48.0), (-95.9, 60.0)] {
            let (x, y) = transform(lon, lat, Crs::Wgs84, crs).unwrap();
            let (lon2, lat2) = transform(x, y, crs, Crs::Wgs84).unwrap();
            assert!((lon - lon2).abs() < 1e-8, "lon {lon} -> {lon2}");
            assert!((lat - lat2).abs() < 1e-8, "lat {lat} -> {lat2}");
        }
    }

    #[test]
    fn test_lambert_origin() {
        // projection origin maps to the false origin
        let (x, y) = transform(-95.0, 49.0, Crs::Wgs84, Crs::LambertCanada).unwrap();
        assert!(x.abs() < 0.001, "x = {x}");
        assert!(y.abs() < 0.001, "y = {y}");
    }

    #[test]
    fn test_lambert_roundtrip() {
        for (lon, lat) in [(-89.024, 52.01), (-120.0, 55.0), (-60.0, 47.0)] {
            let (x, y) = transform(lon, lat, Crs::Wgs84, Crs::LambertCanada).unwrap();
            let (lon2, lat2) = transform(x, y, Crs::LambertCanada, Crs::Wgs84).unwrap();
            assert!((lon - lon2).abs() < 1e-8, "lon {lon} -> {lon2}");
            assert!((lat - lat2).abs() < 1e-8, "lat {lat} -> {lat2}");
        }
    }

    #[test]
    fn test_utm_to_lambert_chains_through_geographic() {
        let utm = Crs::Utm {
            zone: 15,
            north: true,
        };
        let (x, y) = transform(-89.024, 52.01, Crs::Wgs84, utm).unwrap();
        let (lx, ly) = transform(x, y, utm, Crs::LambertCanada).unwrap();
        let (dx, dy) = transform(-89.024, 52.01, Crs::Wgs84, Crs::LambertCanada).unwrap();
        assert!((lx - dx).abs() < 0.01 && (ly - dy).abs() < 0.01);
    }

    #[test]
    fn test_zone_for_lon() {
        assert_eq!(utm_zone_for_lon(-93.0), 15);
        assert_eq!(utm_zone_for_lon(-89.024), 16);
        assert_eq!(utm_central_meridian(15), -93.0);
    }

    #[test]
    fn test_epsg_roundtrip() {
        for crs in [
            Crs::Wgs84,
            Crs::LambertCanada,
            Crs::Utm {
                zone: 15,
                north: true,
            },
            Crs::Utm {
                zone: 33,
                north: false,
            },
        ] {
            assert_eq!(Crs::from_epsg(crs.epsg()), Some(crs));
        }
    }
}
