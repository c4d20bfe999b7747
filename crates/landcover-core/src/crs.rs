//! Coordinate reference systems and the transforms between them.
//! All coordinate math uses f64.
//!
//! Supported systems: WGS84 lon/lat (EPSG:4326), Web Mercator (EPSG:3857)
//! and the WGS84 UTM zones (EPSG:326xx north, 327xx south). Web Mercator
//! ↔ WGS84 uses closed-form spherical formulas; every other pair goes
//! through `proj4rs`.

use std::f64::consts::PI;
use std::fmt;

use geo::{coord, MapCoords, MultiPolygon};
use proj4rs::proj::Proj;
use proj4rs::transform::transform;
use serde::{Deserialize, Serialize};

use crate::error::{AnalysisError, Result};

const EPSG_WGS84: u32 = 4326;
const EPSG_WEB_MERCATOR: u32 = 3857;
const EPSG_UTM_NORTH_BASE: u32 = 32600;
const EPSG_UTM_SOUTH_BASE: u32 = 32700;

/// Half the equatorial circumference of the Web Mercator sphere, in metres.
const HALF_EARTH: f64 = 20_037_508.342_789_244;

/// A coordinate reference system, serialised as its EPSG code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "u32", into = "u32")]
pub enum Crs {
    /// Geographic lon/lat in degrees.
    Wgs84,
    /// Spherical Web Mercator in metres.
    WebMercator,
    /// Universal Transverse Mercator in metres. `zone` is 1–60.
    Utm { zone: u8, north: bool },
}

impl Crs {
    pub fn from_epsg(code: u32) -> Option<Self> {
        match code {
            EPSG_WGS84 => Some(Crs::Wgs84),
            EPSG_WEB_MERCATOR => Some(Crs::WebMercator),
            c if (EPSG_UTM_NORTH_BASE + 1..=EPSG_UTM_NORTH_BASE + 60).contains(&c) => {
                Some(Crs::Utm { zone: (c - EPSG_UTM_NORTH_BASE) as u8, north: true })
            }
            c if (EPSG_UTM_SOUTH_BASE + 1..=EPSG_UTM_SOUTH_BASE + 60).contains(&c) => {
                Some(Crs::Utm { zone: (c - EPSG_UTM_SOUTH_BASE) as u8, north: false })
            }
            _ => None,
        }
    }

    pub fn epsg(self) -> u32 {
        match self {
            Crs::Wgs84 => EPSG_WGS84,
            Crs::WebMercator => EPSG_WEB_MERCATOR,
            Crs::Utm { zone, north: true } => EPSG_UTM_NORTH_BASE + zone as u32,
            Crs::Utm { zone, north: false } => EPSG_UTM_SOUTH_BASE + zone as u32,
        }
    }

    /// True when coordinates are degrees rather than metres.
    pub fn is_geographic(self) -> bool {
        matches!(self, Crs::Wgs84)
    }

    /// The UTM zone containing (lon, lat).
    ///
    /// zone = ⌊(lon + 180) / 6⌋ + 1, clamped to 1–60 so lon = 180 stays in zone 60.
    pub fn utm_for(lon: f64, lat: f64) -> Self {
        let zone = (((lon + 180.0) / 6.0).floor() as i64 + 1).clamp(1, 60) as u8;
        Crs::Utm { zone, north: lat >= 0.0 }
    }

    fn proj_string(self) -> String {
        match self {
            Crs::Wgs84 => "+proj=longlat +datum=WGS84 +no_defs".to_string(),
            Crs::WebMercator => {
                "+proj=merc +a=6378137 +b=6378137 +lat_ts=0 +lon_0=0 +x_0=0 +y_0=0 +k=1 +units=m +no_defs"
                    .to_string()
            }
            Crs::Utm { zone, north } => {
                let south = if north { "" } else { "+south " };
                format!("+proj=utm +zone={zone} {south}+datum=WGS84 +units=m +no_defs")
            }
        }
    }
}

impl fmt::Display for Crs {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "EPSG:{}", self.epsg())
    }
}

impl TryFrom<u32> for Crs {
    type Error = String;

    fn try_from(code: u32) -> std::result::Result<Self, Self::Error> {
        Crs::from_epsg(code).ok_or_else(|| format!("EPSG:{code} is not supported"))
    }
}

impl From<Crs> for u32 {
    fn from(crs: Crs) -> u32 {
        crs.epsg()
    }
}

// ── Transforms ────────────────────────────────────────────────────────────────

#[inline]
fn lonlat_to_merc(lon: f64, lat: f64) -> (f64, f64) {
    let x = lon * HALF_EARTH / 180.0;
    if lat.abs() >= 90.0 {
        return (x, f64::NAN);
    }
    let y = (PI / 4.0 + lat.to_radians() / 2.0).tan().ln() * HALF_EARTH / PI;
    (x, y)
}

#[inline]
fn merc_to_lonlat(x: f64, y: f64) -> (f64, f64) {
    let lon = x * 180.0 / HALF_EARTH;
    let lat = (2.0 * (y * PI / HALF_EARTH).exp().atan() - PI / 2.0).to_degrees();
    (lon, lat)
}

enum Strategy {
    Identity,
    LonLatToMerc,
    MercToLonLat,
    Proj(Box<(Proj, Proj)>),
}

/// A reusable transform from one [`Crs`] to another.
pub struct CrsTransform {
    source: Crs,
    target: Crs,
    strategy: Strategy,
}

impl fmt::Debug for CrsTransform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CrsTransform")
            .field("source", &self.source)
            .field("target", &self.target)
            .finish_non_exhaustive()
    }
}

impl CrsTransform {
    pub fn new(source: Crs, target: Crs) -> Result<Self> {
        let strategy = match (source, target) {
            (s, t) if s == t => Strategy::Identity,
            (Crs::Wgs84, Crs::WebMercator) => Strategy::LonLatToMerc,
            (Crs::WebMercator, Crs::Wgs84) => Strategy::MercToLonLat,
            (s, t) => {
                let src = Proj::from_proj_string(&s.proj_string()).map_err(|e| {
                    AnalysisError::Projection { detail: format!("cannot initialise {s}: {e:?}") }
                })?;
                let dst = Proj::from_proj_string(&t.proj_string()).map_err(|e| {
                    AnalysisError::Projection { detail: format!("cannot initialise {t}: {e:?}") }
                })?;
                Strategy::Proj(Box::new((src, dst)))
            }
        };
        Ok(Self { source, target, strategy })
    }

    pub fn source(&self) -> Crs {
        self.source
    }

    pub fn target(&self) -> Crs {
        self.target
    }

    /// Transform one coordinate pair. Geographic values are in degrees.
    pub fn transform(&self, x: f64, y: f64) -> Result<(f64, f64)> {
        let (ox, oy) = match &self.strategy {
            Strategy::Identity => (x, y),
            Strategy::LonLatToMerc => lonlat_to_merc(x, y),
            Strategy::MercToLonLat => merc_to_lonlat(x, y),
            Strategy::Proj(pair) => {
                let (src, dst) = pair.as_ref();
                let mut point = if self.source.is_geographic() {
                    (x.to_radians(), y.to_radians(), 0.0)
                } else {
                    (x, y, 0.0)
                };
                transform(src, dst, &mut point).map_err(|e| AnalysisError::Projection {
                    detail: format!("{} → {} at ({x}, {y}): {e:?}", self.source, self.target),
                })?;
                if self.target.is_geographic() {
                    (point.0.to_degrees(), point.1.to_degrees())
                } else {
                    (point.0, point.1)
                }
            }
        };

        if !ox.is_finite() || !oy.is_finite() {
            return Err(AnalysisError::Projection {
                detail: format!("{} → {} at ({x}, {y}) is not finite", self.source, self.target),
            });
        }
        Ok((ox, oy))
    }

    /// Transform every vertex of a multipolygon.
    pub fn transform_geometry(&self, geometry: &MultiPolygon<f64>) -> Result<MultiPolygon<f64>> {
        if matches!(self.strategy, Strategy::Identity) {
            return Ok(geometry.clone());
        }
        geometry.try_map_coords(|c| self.transform(c.x, c.y).map(|(x, y)| coord! { x: x, y: y }))
    }
}
