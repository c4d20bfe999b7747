use serde::{Deserialize, Serialize};

use crate::crs::Crs;
use crate::error::{AnalysisError, Result};

/// Affine pixel → world transform in GDAL coefficient order:
///
///   x = origin_x + col · pixel_width  + row · row_rotation
///   y = origin_y + col · col_rotation + row · pixel_height
///
/// `(col, row)` are continuous pixel coordinates; the centre of pixel
/// `(c, r)` is `(c + 0.5, r + 0.5)`. North-up rasters have zero rotation
/// and a negative `pixel_height`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GeoTransform {
    pub origin_x: f64,
    pub pixel_width: f64,
    pub row_rotation: f64,
    pub origin_y: f64,
    pub col_rotation: f64,
    pub pixel_height: f64,
}

impl GeoTransform {
    /// North-up transform with square-or-rectangular pixels.
    pub fn north_up(origin_x: f64, origin_y: f64, pixel_width: f64, pixel_height: f64) -> Self {
        Self {
            origin_x,
            pixel_width,
            row_rotation: 0.0,
            origin_y,
            col_rotation: 0.0,
            pixel_height: -pixel_height.abs(),
        }
    }

    /// Build from GDAL's six-coefficient array.
    pub fn from_gdal(c: [f64; 6]) -> Self {
        Self {
            origin_x: c[0],
            pixel_width: c[1],
            row_rotation: c[2],
            origin_y: c[3],
            col_rotation: c[4],
            pixel_height: c[5],
        }
    }

    pub fn to_gdal(&self) -> [f64; 6] {
        [
            self.origin_x,
            self.pixel_width,
            self.row_rotation,
            self.origin_y,
            self.col_rotation,
            self.pixel_height,
        ]
    }

    fn determinant(&self) -> f64 {
        self.pixel_width * self.pixel_height - self.row_rotation * self.col_rotation
    }

    pub fn is_invertible(&self) -> bool {
        let det = self.determinant();
        det.is_finite() && det.abs() > f64::EPSILON * 1e-6
    }

    /// Continuous pixel coordinates → world coordinates.
    #[inline]
    pub fn apply(&self, col: f64, row: f64) -> (f64, f64) {
        (
            self.origin_x + col * self.pixel_width + row * self.row_rotation,
            self.origin_y + col * self.col_rotation + row * self.pixel_height,
        )
    }

    /// World coordinates → continuous pixel coordinates `(col, row)`.
    /// Returns None for a singular transform.
    #[inline]
    pub fn invert(&self, x: f64, y: f64) -> Option<(f64, f64)> {
        if !self.is_invertible() {
            return None;
        }
        let det = self.determinant();
        let dx = x - self.origin_x;
        let dy = y - self.origin_y;
        let col = (dx * self.pixel_height - dy * self.row_rotation) / det;
        let row = (dy * self.pixel_width - dx * self.col_rotation) / det;
        Some((col, row))
    }

    /// Area of one pixel in squared CRS units.
    pub fn pixel_area(&self) -> f64 {
        self.determinant().abs()
    }
}

/// A categorical raster: one class code per pixel, row-major, row 0 at the
/// transform origin. Negative codes never count as valid classes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CategoricalRaster {
    pub data: Vec<i32>,
    pub width: usize,
    pub height: usize,
    pub crs: Crs,
    pub transform: GeoTransform,
    /// The raster's own nodata sentinel, if its source declared one.
    pub nodata: Option<i32>,
}

impl CategoricalRaster {
    /// Wrap a row-major buffer, checking its length against the shape.
    pub fn new(
        data: Vec<i32>,
        width: usize,
        height: usize,
        crs: Crs,
        transform: GeoTransform,
        nodata: Option<i32>,
    ) -> Result<Self> {
        let raster = Self { data, width, height, crs, transform, nodata };
        raster.validate()?;
        Ok(raster)
    }

    /// Check the buffer length against the shape and that the transform is
    /// invertible. Rasters assembled field by field are only checked here.
    pub fn validate(&self) -> Result<()> {
        let expected = self.width.checked_mul(self.height);
        if expected != Some(self.data.len()) {
            return Err(AnalysisError::parameter(
                "raster.data",
                format!(
                    "expected {}×{} values, got {}",
                    self.width,
                    self.height,
                    self.data.len()
                ),
            ));
        }
        if !self.transform.is_invertible() {
            return Err(AnalysisError::parameter("raster.transform", "transform is singular"));
        }
        Ok(())
    }

    /// A raster filled with one class code.
    pub fn filled(width: usize, height: usize, crs: Crs, transform: GeoTransform, fill: i32) -> Self {
        Self { data: vec![fill; width * height], width, height, crs, transform, nodata: None }
    }

    #[inline]
    pub fn get(&self, row: usize, col: usize) -> i32 {
        self.data[row * self.width + col]
    }

    #[inline]
    pub fn set(&mut self, row: usize, col: usize, val: i32) {
        self.data[row * self.width + col] = val;
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Check that both rasters are well formed and that `other` shares CRS,
    /// transform and shape with `self`.
    pub fn check_aligned(&self, other: &CategoricalRaster) -> Result<()> {
        self.validate()?;
        other.validate()?;
        let mismatch = |detail: String| Err(AnalysisError::RasterMisalignment { detail });
        if self.width != other.width || self.height != other.height {
            return mismatch(format!(
                "shape {}×{} vs {}×{}",
                self.width, self.height, other.width, other.height
            ));
        }
        if self.crs != other.crs {
            return mismatch(format!("crs {} vs {}", self.crs, other.crs));
        }
        if self.transform != other.transform {
            return mismatch(format!(
                "transform {:?} vs {:?}",
                self.transform.to_gdal(),
                other.transform.to_gdal()
            ));
        }
        Ok(())
    }
}
