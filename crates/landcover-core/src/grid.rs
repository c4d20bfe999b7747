//! Grid tiling: partitions an AOI into fixed-size square cells.
//!
//! The AOI is reprojected into a metric CRS, covered with a lattice of
//! `cell_size_m` squares anchored at the floor of its bounding-box minimum,
//! and every lattice square is clipped to the AOI. Squares that do not
//! overlap the AOI are dropped. Surviving cells are reprojected into the
//! output CRS and numbered from 1.
//!
//! Sweep order is part of the contract: x ascending in the outer loop,
//! y ascending in the inner loop. The same AOI, cell size and options
//! always produce the same cells with the same ids.

use geo::{Area, BooleanOps, BoundingRect, Coord, Intersects, Line, LineString, MultiPolygon, Polygon, Rect};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::crs::{Crs, CrsTransform};
use crate::error::{AnalysisError, Result};

/// The area of interest: one or more polygons in a known CRS.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Aoi {
    pub geometry: MultiPolygon<f64>,
    pub crs: Crs,
}

impl Aoi {
    /// Validate and wrap an AOI geometry.
    pub fn new(geometry: MultiPolygon<f64>, crs: Crs) -> Result<Self> {
        validate_geometry(&geometry, crs, "aoi")?;
        Ok(Self { geometry, crs })
    }

    pub fn from_polygon(polygon: Polygon<f64>, crs: Crs) -> Result<Self> {
        Self::new(MultiPolygon::new(vec![polygon]), crs)
    }
}

/// Axis-aligned bounds of a cell, in the grid's CRS.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Bounds {
    pub min_x: f64,
    pub min_y: f64,
    pub max_x: f64,
    pub max_y: f64,
}

impl Bounds {
    fn of(geometry: &MultiPolygon<f64>) -> Option<Self> {
        geometry.bounding_rect().map(|r| Self {
            min_x: r.min().x,
            min_y: r.min().y,
            max_x: r.max().x,
            max_y: r.max().y,
        })
    }

    pub fn width(&self) -> f64 {
        self.max_x - self.min_x
    }

    pub fn height(&self) -> f64 {
        self.max_y - self.min_y
    }
}

/// One analysis cell: a lattice square clipped to the AOI.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GridCell {
    pub grid_id: u32,
    pub geometry: MultiPolygon<f64>,
    /// None when the geometry is empty.
    pub bounds: Option<Bounds>,
}

impl GridCell {
    /// Build a cell, deriving its bounds from the geometry.
    pub fn new(grid_id: u32, geometry: MultiPolygon<f64>) -> Self {
        let bounds = Bounds::of(&geometry);
        Self { grid_id, geometry, bounds }
    }

    pub fn is_empty(&self) -> bool {
        self.geometry.0.is_empty()
    }
}

/// An ordered set of cells sharing one CRS, ascending by `grid_id`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Grid {
    pub crs: Crs,
    cells: Vec<GridCell>,
}

impl Grid {
    /// Assemble a grid from cells loaded elsewhere. Ids must be positive and
    /// unique; cells are reordered by ascending id.
    pub fn from_cells(crs: Crs, mut cells: Vec<GridCell>) -> Result<Self> {
        cells.sort_by_key(|c| c.grid_id);
        if cells.first().is_some_and(|c| c.grid_id == 0) {
            return Err(AnalysisError::parameter("grid_id", "ids must start at 1"));
        }
        if let Some(pair) = cells.windows(2).find(|w| w[0].grid_id == w[1].grid_id) {
            return Err(AnalysisError::parameter(
                "grid_id",
                format!("id {} appears more than once", pair[0].grid_id),
            ));
        }
        Ok(Self { crs, cells })
    }

    /// The AOI itself as the only cell (`grid_id` 1), reprojected to
    /// `output_crs`. Used when tiling produced no cells.
    pub fn whole_aoi(aoi: &Aoi, output_crs: Crs) -> Result<Self> {
        let to_output = CrsTransform::new(aoi.crs, output_crs)?;
        let geometry = to_output.transform_geometry(&union_all(&aoi.geometry))?;
        Ok(Self { crs: output_crs, cells: vec![GridCell::new(1, geometry)] })
    }

    pub fn cells(&self) -> &[GridCell] {
        &self.cells
    }

    pub fn len(&self) -> usize {
        self.cells.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cells.is_empty()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, GridCell> {
        self.cells.iter()
    }

    pub fn get(&self, grid_id: u32) -> Option<&GridCell> {
        self.cells
            .binary_search_by_key(&grid_id, |c| c.grid_id)
            .ok()
            .map(|i| &self.cells[i])
    }

    /// Reproject every cell into `target`.
    pub fn to_crs(&self, target: Crs) -> Result<Grid> {
        let t = CrsTransform::new(self.crs, target)?;
        let cells = self
            .cells
            .iter()
            .map(|c| Ok(GridCell::new(c.grid_id, t.transform_geometry(&c.geometry)?)))
            .collect::<Result<Vec<_>>>()?;
        Ok(Grid { crs: target, cells })
    }
}

// ── Options ───────────────────────────────────────────────────────────────────

/// Metric CRS used for tiling.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MetricProjection {
    /// UTM zone of the AOI's bounding-box centre.
    #[default]
    Utm,
    /// Spherical Web Mercator (EPSG:3857). Cell sides are metres on the
    /// projection plane, not on the ground, away from the equator.
    WebMercator,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GridOptions {
    pub metric_projection: MetricProjection,
    pub output_crs: Crs,
}

impl Default for GridOptions {
    fn default() -> Self {
        Self { metric_projection: MetricProjection::Utm, output_crs: Crs::Wgs84 }
    }
}

// ── Builder ───────────────────────────────────────────────────────────────────

/// Most lattice squares one AOI may be swept with. Keeps ids within `u32`.
pub const MAX_LATTICE_SQUARES: usize = 100_000_000;

/// Partition `aoi` into `cell_size_m` squares clipped to its boundary.
///
/// Returns an empty grid when no lattice square overlaps the AOI; that is a
/// signal for the caller to fall back to [`Grid::whole_aoi`], not an error.
pub fn build_grid(aoi: &Aoi, cell_size_m: f64, options: &GridOptions) -> Result<Grid> {
    if !cell_size_m.is_finite() || cell_size_m <= 0.0 {
        return Err(AnalysisError::parameter(
            "cell_size_m",
            format!("must be a positive number of metres, got {cell_size_m}"),
        ));
    }
    validate_geometry(&aoi.geometry, aoi.crs, "aoi")?;

    let metric = metric_crs_for(aoi, options.metric_projection)?;
    if metric.is_geographic() {
        return Err(AnalysisError::parameter("metric_projection", "tiling CRS must be metric"));
    }
    let to_metric = CrsTransform::new(aoi.crs, metric)?;
    let metric_aoi = union_all(&to_metric.transform_geometry(&aoi.geometry)?);
    let bbox = metric_aoi
        .bounding_rect()
        .ok_or_else(|| AnalysisError::geometry("aoi", "geometry has no extent"))?;

    let x0 = bbox.min().x.floor();
    let y0 = bbox.min().y.floor();
    let n_cols = lattice_steps(x0, bbox.max().x.ceil(), cell_size_m);
    let n_rows = lattice_steps(y0, bbox.max().y.ceil(), cell_size_m);
    let lattice = n_cols
        .checked_mul(n_rows)
        .filter(|&n| n <= MAX_LATTICE_SQUARES)
        .ok_or_else(|| {
            AnalysisError::parameter(
                "cell_size_m",
                format!(
                    "{cell_size_m} m cells need a {n_cols}×{n_rows} lattice, more than {MAX_LATTICE_SQUARES} squares"
                ),
            )
        })?;
    debug!(%metric, n_cols, n_rows, cell_size_m, "tiling AOI");

    let to_output = CrsTransform::new(metric, options.output_crs)?;
    let mut cells = Vec::new();

    for i in 0..n_cols {
        let x = x0 + i as f64 * cell_size_m;
        for j in 0..n_rows {
            let y = y0 + j as f64 * cell_size_m;
            let square = Rect::new(
                Coord { x, y },
                Coord { x: x + cell_size_m, y: y + cell_size_m },
            )
            .to_polygon();
            if !square.intersects(&metric_aoi) {
                continue;
            }
            let mut clipped = MultiPolygon::new(vec![square]).intersection(&metric_aoi);
            clipped.0.retain(|p| p.unsigned_area() > 0.0);
            if clipped.0.is_empty() {
                continue;
            }
            let grid_id = u32::try_from(cells.len() + 1)
                .map_err(|_| AnalysisError::parameter("cell_size_m", "grid ids exceed u32"))?;
            cells.push(GridCell::new(grid_id, to_output.transform_geometry(&clipped)?));
        }
    }

    info!(cells = cells.len(), lattice, "grid built");
    Ok(Grid { crs: options.output_crs, cells })
}

/// Number of lattice lines `start + k·step` strictly below `end`.
fn lattice_steps(start: f64, end: f64, step: f64) -> usize {
    if end <= start {
        return 0;
    }
    ((end - start) / step).ceil() as usize
}

fn metric_crs_for(aoi: &Aoi, projection: MetricProjection) -> Result<Crs> {
    match projection {
        MetricProjection::WebMercator => Ok(Crs::WebMercator),
        MetricProjection::Utm => {
            let bbox = aoi
                .geometry
                .bounding_rect()
                .ok_or_else(|| AnalysisError::geometry("aoi", "geometry has no extent"))?;
            let c = bbox.center();
            let (lon, lat) = CrsTransform::new(aoi.crs, Crs::Wgs84)?.transform(c.x, c.y)?;
            Ok(Crs::utm_for(lon, lat))
        }
    }
}

/// Dissolve all member polygons into one non-overlapping multipolygon.
pub fn union_all(geometry: &MultiPolygon<f64>) -> MultiPolygon<f64> {
    let mut polygons = geometry.0.iter();
    let Some(first) = polygons.next() else {
        return MultiPolygon::new(Vec::new());
    };
    polygons.fold(MultiPolygon::new(vec![first.clone()]), |acc, p| {
        acc.union(&MultiPolygon::new(vec![p.clone()]))
    })
}

/// Reject empty, non-finite, out-of-range, self-intersecting or zero-area
/// geometries.
pub fn validate_geometry(geometry: &MultiPolygon<f64>, crs: Crs, context: &str) -> Result<()> {
    if geometry.0.is_empty() {
        return Err(AnalysisError::geometry(context, "geometry is empty"));
    }
    for (k, polygon) in geometry.0.iter().enumerate() {
        let rings = std::iter::once(polygon.exterior()).chain(polygon.interiors().iter());
        for ring in rings {
            // Closed rings repeat the first coordinate, so a triangle has 4.
            if ring.0.len() < 4 {
                return Err(AnalysisError::geometry(
                    context,
                    format!("polygon {k} has a ring with fewer than 3 distinct vertices"),
                ));
            }
            for c in &ring.0 {
                if !c.x.is_finite() || !c.y.is_finite() {
                    return Err(AnalysisError::geometry(context, format!("polygon {k} has a non-finite vertex")));
                }
                if crs.is_geographic() && (c.x.abs() > 180.0 || c.y.abs() > 90.0) {
                    return Err(AnalysisError::geometry(
                        context,
                        format!("polygon {k} vertex ({}, {}) is outside lon/lat range", c.x, c.y),
                    ));
                }
            }
            if ring_self_intersects(ring) {
                return Err(AnalysisError::geometry(context, format!("polygon {k} has a self-intersecting ring")));
            }
        }
        if Polygon::new(polygon.exterior().clone(), vec![]).unsigned_area() <= 0.0 {
            return Err(AnalysisError::geometry(context, format!("polygon {k} has zero area")));
        }
    }
    Ok(())
}

/// True when two non-adjacent edges of a closed ring touch or cross.
fn ring_self_intersects(ring: &LineString<f64>) -> bool {
    let mut vertices = ring.0.clone();
    vertices.dedup();
    let edges: Vec<Line<f64>> = vertices.windows(2).map(|w| Line::new(w[0], w[1])).collect();
    let n = edges.len();
    for i in 0..n {
        for j in i + 2..n {
            // First and last edges meet at the closing vertex.
            if i == 0 && j == n - 1 {
                continue;
            }
            if edges[i].intersects(&edges[j]) {
                return true;
            }
        }
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use geo::polygon;

    fn mercator_options() -> GridOptions {
        GridOptions { metric_projection: MetricProjection::WebMercator, output_crs: Crs::WebMercator }
    }

    fn square_aoi(x: f64, y: f64, side: f64) -> Aoi {
        let p = Rect::new(Coord { x, y }, Coord { x: x + side, y: y + side }).to_polygon();
        Aoi::from_polygon(p, Crs::WebMercator).unwrap()
    }

    #[test]
    fn rejects_non_positive_cell_size() {
        let aoi = square_aoi(0.0, 0.0, 100.0);
        for size in [0.0, -10.0, f64::NAN] {
            let err = build_grid(&aoi, size, &mercator_options()).unwrap_err();
            assert!(matches!(err, AnalysisError::InvalidParameter { .. }));
        }
    }

    #[test]
    fn rejects_invalid_aoi() {
        assert!(Aoi::new(MultiPolygon::new(vec![]), Crs::Wgs84).is_err());

        let flat = polygon![(x: 0.0, y: 0.0), (x: 1.0, y: 0.0), (x: 2.0, y: 0.0)];
        let err = Aoi::from_polygon(flat, Crs::Wgs84).unwrap_err();
        assert!(matches!(err, AnalysisError::InvalidGeometry { .. }));

        let off_globe = polygon![(x: 170.0, y: 0.0), (x: 190.0, y: 0.0), (x: 190.0, y: 5.0)];
        assert!(Aoi::from_polygon(off_globe, Crs::Wgs84).is_err());

        // Bowtie: its two long edges cross.
        let bowtie = polygon![
            (x: 0.0, y: 0.0), (x: 3000.0, y: 2000.0), (x: 3000.0, y: 0.0), (x: 0.0, y: 1000.0),
        ];
        let err = Aoi::from_polygon(bowtie.clone(), Crs::WebMercator).unwrap_err();
        assert!(matches!(err, AnalysisError::InvalidGeometry { .. }));
        let bare = Aoi { geometry: MultiPolygon::new(vec![bowtie]), crs: Crs::WebMercator };
        assert!(build_grid(&bare, 1000.0, &mercator_options()).is_err());

        // A hole that crosses its own edges is caught too.
        let hole = LineString::from(vec![(10.0, 10.0), (50.0, 50.0), (50.0, 10.0), (10.0, 50.0), (10.0, 10.0)]);
        let outer = Rect::new(Coord { x: 0.0, y: 0.0 }, Coord { x: 100.0, y: 100.0 }).to_polygon();
        let holed = Polygon::new(outer.exterior().clone(), vec![hole]);
        assert!(Aoi::from_polygon(holed, Crs::WebMercator).is_err());

        // An Aoi assembled by hand still gets checked by the builder.
        let bare = Aoi { geometry: MultiPolygon::new(vec![]), crs: Crs::WebMercator };
        let err = build_grid(&bare, 10.0, &mercator_options()).unwrap_err();
        assert!(matches!(err, AnalysisError::InvalidGeometry { .. }));
    }

    #[test]
    fn repeated_and_concave_vertices_are_not_self_intersections() {
        let repeated = polygon![
            (x: 0.0, y: 0.0), (x: 100.0, y: 0.0), (x: 100.0, y: 0.0), (x: 100.0, y: 100.0), (x: 0.0, y: 100.0),
        ];
        assert!(Aoi::from_polygon(repeated, Crs::WebMercator).is_ok());

        let l_shape = polygon![
            (x: 0.0, y: 0.0), (x: 200.0, y: 0.0), (x: 200.0, y: 100.0),
            (x: 100.0, y: 100.0), (x: 100.0, y: 200.0), (x: 0.0, y: 200.0),
        ];
        assert!(Aoi::from_polygon(l_shape, Crs::WebMercator).is_ok());
    }

    #[test]
    fn oversized_lattice_is_rejected() {
        let aoi = square_aoi(0.0, 0.0, 1_000_000.0);
        let err = build_grid(&aoi, 0.01, &mercator_options()).unwrap_err();
        assert!(matches!(err, AnalysisError::InvalidParameter { ref name, .. } if name == "cell_size_m"));
    }

    #[test]
    fn empty_cell_has_no_bounds() {
        let cell = GridCell::new(5, MultiPolygon::new(vec![]));
        assert!(cell.is_empty());
        assert_eq!(cell.bounds, None);

        let full = GridCell::new(6, square_aoi(-10.0, -20.0, 5.0).geometry);
        let b = full.bounds.unwrap();
        assert_eq!((b.min_x, b.min_y, b.max_x, b.max_y), (-10.0, -20.0, -5.0, -15.0));
    }

    #[test]
    fn sweep_order_is_x_outer_y_inner() {
        let aoi = square_aoi(0.0, 0.0, 2000.0);
        let grid = build_grid(&aoi, 1000.0, &mercator_options()).unwrap();
        assert_eq!(grid.len(), 4);

        let origins: Vec<(f64, f64)> = grid.iter().map(|c| c.bounds.map(|b| (b.min_x, b.min_y)).unwrap()).collect();
        assert_eq!(origins, vec![(0.0, 0.0), (0.0, 1000.0), (1000.0, 0.0), (1000.0, 1000.0)]);
        let ids: Vec<u32> = grid.iter().map(|c| c.grid_id).collect();
        assert_eq!(ids, vec![1, 2, 3, 4]);
    }

    #[test]
    fn cells_are_clipped_to_the_aoi() {
        // Triangle: the upper-right lattice square only touches the hypotenuse.
        let tri = polygon![(x: 0.0, y: 0.0), (x: 2000.0, y: 0.0), (x: 0.0, y: 2000.0)];
        let aoi = Aoi::from_polygon(tri, Crs::WebMercator).unwrap();
        let grid = build_grid(&aoi, 1000.0, &mercator_options()).unwrap();

        assert_eq!(grid.len(), 3);
        let total: f64 = grid.iter().map(|c| c.geometry.unsigned_area()).sum();
        assert_relative_eq!(total, aoi.geometry.unsigned_area(), max_relative = 1e-9);
        // Lower-left cell is a full square, the two others are half squares.
        assert_relative_eq!(grid.cells()[0].geometry.unsigned_area(), 1.0e6, max_relative = 1e-9);
        assert_relative_eq!(grid.cells()[1].geometry.unsigned_area(), 0.5e6, max_relative = 1e-9);
    }

    #[test]
    fn aoi_smaller_than_one_cell_yields_single_cell_equal_to_aoi() {
        let aoi = square_aoi(10.25, 20.5, 300.0);
        let grid = build_grid(&aoi, 1000.0, &mercator_options()).unwrap();
        assert_eq!(grid.len(), 1);
        let cell = &grid.cells()[0];
        assert_eq!(cell.grid_id, 1);
        assert_relative_eq!(cell.geometry.unsigned_area(), 90_000.0, max_relative = 1e-9);
        let outside = cell.geometry.difference(&aoi.geometry).unsigned_area();
        assert!(outside < 1e-6);
    }

    #[test]
    fn geographic_aoi_is_tiled_in_metres() {
        // ~0.1° box near Bogotá; 5 km cells in UTM 18N cover it with a few cells.
        let p = polygon![
            (x: -74.10, y: 4.60), (x: -74.00, y: 4.60),
            (x: -74.00, y: 4.70), (x: -74.10, y: 4.70),
        ];
        let aoi = Aoi::from_polygon(p, Crs::Wgs84).unwrap();
        let grid = build_grid(&aoi, 5000.0, &GridOptions::default()).unwrap();

        assert_eq!(grid.crs, Crs::Wgs84);
        assert!(grid.len() >= 9 && grid.len() <= 16, "got {} cells", grid.len());
        for cell in grid.iter() {
            // Every cell is at most ~5 km ≈ 0.045° wide.
            let b = cell.bounds.unwrap();
            assert!(b.width() < 0.05 && b.height() < 0.05);
            assert!(b.min_x >= -74.10 - 1e-6 && b.max_x <= -74.00 + 1e-6);
        }
        let total: f64 = grid.iter().map(|c| c.geometry.unsigned_area()).sum();
        assert_relative_eq!(total, aoi.geometry.unsigned_area(), max_relative = 1e-4);
    }

    #[test]
    fn rebuilding_is_idempotent() {
        let p = polygon![
            (x: -73.9, y: 5.1), (x: -73.7, y: 5.05), (x: -73.65, y: 5.3), (x: -73.85, y: 5.25),
        ];
        let aoi = Aoi::from_polygon(p, Crs::Wgs84).unwrap();
        let a = build_grid(&aoi, 4000.0, &GridOptions::default()).unwrap();
        let b = build_grid(&aoi, 4000.0, &GridOptions::default()).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn overlapping_parts_are_dissolved() {
        let a = Rect::new(Coord { x: 0.0, y: 0.0 }, Coord { x: 600.0, y: 600.0 }).to_polygon();
        let b = Rect::new(Coord { x: 300.0, y: 300.0 }, Coord { x: 900.0, y: 900.0 }).to_polygon();
        let aoi = Aoi::new(MultiPolygon::new(vec![a, b]), Crs::WebMercator).unwrap();
        let grid = build_grid(&aoi, 10_000.0, &mercator_options()).unwrap();
        assert_eq!(grid.len(), 1);
        // 2 × 360 000 − 90 000 overlap.
        assert_relative_eq!(grid.cells()[0].geometry.unsigned_area(), 630_000.0, max_relative = 1e-9);
    }

    #[test]
    fn whole_aoi_fallback_is_single_cell() {
        let aoi = square_aoi(0.0, 0.0, 50.0);
        let grid = Grid::whole_aoi(&aoi, Crs::WebMercator).unwrap();
        assert_eq!(grid.len(), 1);
        assert_eq!(grid.get(1).and_then(|c| c.bounds).map(|b| b.max_x), Some(50.0));
    }

    #[test]
    fn from_cells_sorts_and_checks_ids() {
        let g = |id| GridCell::new(id, square_aoi(id as f64, 0.0, 1.0).geometry);
        let grid = Grid::from_cells(Crs::WebMercator, vec![g(3), g(1), g(2)]).unwrap();
        let ids: Vec<u32> = grid.iter().map(|c| c.grid_id).collect();
        assert_eq!(ids, vec![1, 2, 3]);
        assert!(Grid::from_cells(Crs::WebMercator, vec![g(1), g(1)]).is_err());
        assert!(Grid::from_cells(Crs::WebMercator, vec![g(0)]).is_err());
    }
}
