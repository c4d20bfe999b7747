/// Land-cover transition tool: tiles an AOI into square cells, counts class
/// transitions between two Dynamic World GeoTIFF snapshots, and writes the
/// grid, the per-cell table, the class composition and the area report.
///
/// Outputs, under `<output>/<name>/`:
///   grid_<name>_<cell>m.geojson   cells with their grid_id
///   <name>_transitions.csv        one row per cell, four columns per rule
///   <name>_composition.csv        per-cell class shares before/after
///   <name>_report.json            hectares per rule and the max cell
use std::fs;
use std::io::{self, BufWriter, Read, Seek, Write};
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use clap::Parser;
use geo::{Coord, LineString, MultiPolygon, Polygon};
use serde::Deserialize;
use serde_json::json;
use tiff::decoder::{Decoder, DecodingResult, Limits};
use tiff::tags::Tag;
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

use landcover_core::classes::{all_codes, LandCoverClass};
use landcover_core::composition::{class_composition, compare_compositions, ClassChange};
use landcover_core::pipeline::analyze_aoi;
use landcover_core::transitions::RuleCounts;
use landcover_core::{
    AnalysisConfig, Aoi, CategoricalRaster, CellStatus, Crs, GeoTransform, Grid, TransitionRecord,
    TransitionRule,
};

// ── Constants ────────────────────────────────────────────────────────────────

/// Environment variable holding the tracing filter.
const LOG_ENV: &str = "LANDCOVER_LOG";

// GeoTIFF / GDAL tag codes.
const TAG_MODEL_PIXEL_SCALE: u16 = 33550;
const TAG_MODEL_TIEPOINT: u16 = 33922;
const TAG_MODEL_TRANSFORMATION: u16 = 34264;
const TAG_GEO_KEY_DIRECTORY: u16 = 34735;
const TAG_GDAL_NODATA: u16 = 42113;

// GeoKey ids carrying an EPSG code.
const GEOKEY_GEOGRAPHIC_TYPE: u32 = 2048;
const GEOKEY_PROJECTED_CS_TYPE: u32 = 3072;

// ── CLI ──────────────────────────────────────────────────────────────────────

#[derive(Parser, Debug)]
#[command(
    name = "transitions",
    about = "Grid an AOI and count land-cover transitions between two categorical GeoTIFFs"
)]
struct Args {
    /// AOI as GeoJSON (Polygon, MultiPolygon, Feature or FeatureCollection), WGS84 lon/lat
    #[arg(long)]
    aoi: PathBuf,

    /// Class raster of the earlier snapshot
    #[arg(long)]
    before: PathBuf,

    /// Class raster of the later snapshot, aligned with --before
    #[arg(long)]
    after: PathBuf,

    /// Output root directory (created if absent)
    #[arg(short, long, default_value = "data/output")]
    output: PathBuf,

    /// Analysis configuration as JSON; missing fields take their defaults
    #[arg(long)]
    config: Option<PathBuf>,

    /// Cell side in metres, overriding the config
    #[arg(long)]
    cell_size: Option<f64>,

    /// EPSG code of both rasters, overriding their GeoKey directory
    #[arg(long)]
    raster_epsg: Option<u32>,

    /// AOI name used for output paths (default: the AOI file stem)
    #[arg(long)]
    name: Option<String>,

    /// Log at debug level unless LANDCOVER_LOG says otherwise
    #[arg(short, long)]
    verbose: bool,
}

fn init_tracing(verbose: bool) {
    let default = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_env(LOG_ENV).unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .with_target(false)
        .init();
}

fn load_config(args: &Args) -> Result<AnalysisConfig> {
    let mut config = match &args.config {
        Some(path) => {
            let text = fs::read_to_string(path)
                .with_context(|| format!("Cannot read {}", path.display()))?;
            AnalysisConfig::from_json_str(&text)
                .with_context(|| format!("Invalid config {}", path.display()))?
        }
        None => AnalysisConfig::default(),
    };
    if let Some(cell_size) = args.cell_size {
        config.cell_size_m = cell_size;
    }
    config.validate().context("Invalid configuration")?;
    Ok(config)
}

// ── GeoJSON input ────────────────────────────────────────────────────────────

/// Polygon rings as GeoJSON positions; extra ordinates (z) are ignored.
type Rings = Vec<Vec<Vec<f64>>>;

#[derive(Deserialize)]
#[serde(tag = "type")]
enum GeoJson {
    FeatureCollection { features: Vec<Feature> },
    Feature(Feature),
    Polygon { coordinates: Rings },
    MultiPolygon { coordinates: Vec<Rings> },
}

#[derive(Deserialize)]
struct Feature {
    geometry: Option<Geometry>,
}

#[derive(Deserialize)]
#[serde(tag = "type")]
enum Geometry {
    Polygon { coordinates: Rings },
    MultiPolygon { coordinates: Vec<Rings> },
    #[serde(other)]
    Other,
}

/// Collect every polygon of a GeoJSON document into one multipolygon.
/// Non-areal features are skipped with a warning.
fn parse_aoi_geojson(text: &str) -> Result<MultiPolygon<f64>> {
    let doc: GeoJson = serde_json::from_str(text).context("AOI is not a GeoJSON polygon document")?;
    let mut polygons = Vec::new();

    match doc {
        GeoJson::FeatureCollection { features } => {
            for geometry in features.into_iter().filter_map(|f| f.geometry) {
                push_geometry(geometry, &mut polygons)?;
            }
        }
        GeoJson::Feature(Feature { geometry }) => {
            if let Some(geometry) = geometry {
                push_geometry(geometry, &mut polygons)?;
            }
        }
        GeoJson::Polygon { coordinates } => polygons.push(polygon_from_rings(coordinates)?),
        GeoJson::MultiPolygon { coordinates } => {
            push_geometry(Geometry::MultiPolygon { coordinates }, &mut polygons)?
        }
    }

    if polygons.is_empty() {
        bail!("AOI contains no polygon");
    }
    Ok(MultiPolygon::new(polygons))
}

fn push_geometry(geometry: Geometry, polygons: &mut Vec<Polygon<f64>>) -> Result<()> {
    match geometry {
        Geometry::Polygon { coordinates } => polygons.push(polygon_from_rings(coordinates)?),
        Geometry::MultiPolygon { coordinates } => {
            for rings in coordinates {
                polygons.push(polygon_from_rings(rings)?);
            }
        }
        Geometry::Other => warn!("skipping non-polygon AOI feature"),
    }
    Ok(())
}

fn polygon_from_rings(rings: Rings) -> Result<Polygon<f64>> {
    let mut rings = rings.into_iter().map(ring_from_positions);
    let exterior = rings.next().context("polygon has no rings")??;
    let interiors = rings.collect::<Result<Vec<_>>>()?;
    Ok(Polygon::new(exterior, interiors))
}

fn ring_from_positions(positions: Vec<Vec<f64>>) -> Result<LineString<f64>> {
    positions
        .into_iter()
        .map(|p| match p.as_slice() {
            [x, y, ..] => Ok(Coord { x: *x, y: *y }),
            _ => bail!("position with fewer than two ordinates"),
        })
        .collect::<Result<Vec<_>>>()
        .map(LineString::new)
}

// ── GeoTIFF input ────────────────────────────────────────────────────────────

fn tag(code: u16) -> Tag {
    Tag::from_u16_exhaustive(code)
}

/// Decode a single-band class raster with its georeferencing.
///
/// TIFF storage order: row 0 = north edge, which is the order
/// `CategoricalRaster` uses, so rows are kept as stored.
fn read_raster(path: &Path, epsg_override: Option<u32>) -> Result<CategoricalRaster> {
    let file = fs::File::open(path).with_context(|| format!("Cannot open {}", path.display()))?;
    let mut decoder = Decoder::new(io::BufReader::new(file))
        .with_context(|| format!("{} is not a valid TIFF", path.display()))?
        .with_limits(Limits::unlimited());

    let (width, height) = decoder.dimensions()?;
    let (width, height) = (width as usize, height as usize);
    let transform = read_geotransform(&mut decoder)
        .with_context(|| format!("Cannot georeference {}", path.display()))?;

    let epsg = match epsg_override {
        Some(code) => code,
        None => read_epsg(&mut decoder)?
            .with_context(|| format!("No EPSG code in {}; pass --raster-epsg", path.display()))?,
    };
    let crs = Crs::from_epsg(epsg).with_context(|| format!("Unsupported raster CRS EPSG:{epsg}"))?;
    let nodata = read_gdal_nodata(&mut decoder)?;

    let image = decoder
        .read_image()
        .with_context(|| format!("Cannot decode pixels of {}", path.display()))?;
    let data = class_codes(image, width * height)?;
    debug!(path = %path.display(), width, height, %crs, ?nodata, "raster loaded");

    CategoricalRaster::new(data, width, height, crs, transform, nodata)
        .with_context(|| format!("Invalid raster {}", path.display()))
}

fn read_geotransform<R: Read + Seek>(decoder: &mut Decoder<R>) -> Result<GeoTransform> {
    if let Some(matrix) = decoder.find_tag(tag(TAG_MODEL_TRANSFORMATION))? {
        return geotransform_from_matrix(&matrix.into_f64_vec()?);
    }
    let scale = decoder
        .find_tag(tag(TAG_MODEL_PIXEL_SCALE))?
        .context("missing ModelPixelScale tag")?
        .into_f64_vec()?;
    let tiepoint = decoder
        .find_tag(tag(TAG_MODEL_TIEPOINT))?
        .context("missing ModelTiepoint tag")?
        .into_f64_vec()?;
    geotransform_from_tiepoint(&scale, &tiepoint)
}

/// Pixel scale (sx, sy, sz) and tiepoint (i, j, k, x, y, z): raster point
/// (i, j) sits at world (x, y), y decreasing with rows.
fn geotransform_from_tiepoint(scale: &[f64], tiepoint: &[f64]) -> Result<GeoTransform> {
    if scale.len() < 2 || tiepoint.len() < 6 {
        bail!("malformed ModelPixelScale/ModelTiepoint tags");
    }
    let (sx, sy) = (scale[0], scale[1]);
    let (i, j, x, y) = (tiepoint[0], tiepoint[1], tiepoint[3], tiepoint[4]);
    Ok(GeoTransform::north_up(x - i * sx, y + j * sy, sx, sy))
}

/// Row-major 4×4 model transformation → GDAL coefficients.
fn geotransform_from_matrix(m: &[f64]) -> Result<GeoTransform> {
    if m.len() < 16 {
        bail!("ModelTransformation tag has {} values, expected 16", m.len());
    }
    Ok(GeoTransform::from_gdal([m[3], m[0], m[1], m[7], m[4], m[5]]))
}

fn read_epsg<R: Read + Seek>(decoder: &mut Decoder<R>) -> Result<Option<u32>> {
    Ok(match decoder.find_tag(tag(TAG_GEO_KEY_DIRECTORY))? {
        Some(keys) => epsg_from_geokeys(&keys.into_u32_vec()?),
        None => None,
    })
}

/// GeoKey directory: a 4-value header (version, revision, minor, count)
/// then `count` entries of (key id, location, count, value). Only inline
/// values (location 0) are read; a projected CRS wins over a geographic one.
fn epsg_from_geokeys(keys: &[u32]) -> Option<u32> {
    let count = *keys.get(3)? as usize;
    let mut geographic = None;
    for entry in keys.get(4..)?.chunks_exact(4).take(count) {
        if entry[1] != 0 {
            continue;
        }
        match entry[0] {
            GEOKEY_PROJECTED_CS_TYPE => return Some(entry[3]),
            GEOKEY_GEOGRAPHIC_TYPE => geographic = Some(entry[3]),
            _ => {}
        }
    }
    geographic
}

fn read_gdal_nodata<R: Read + Seek>(decoder: &mut Decoder<R>) -> Result<Option<i32>> {
    let Some(value) = decoder.find_tag(tag(TAG_GDAL_NODATA))? else {
        return Ok(None);
    };
    let text = value.into_string()?;
    Ok(parse_nodata(&text))
}

/// GDAL stores nodata as ASCII. Only integral values can mark a class pixel.
fn parse_nodata(text: &str) -> Option<i32> {
    let v: f64 = text.trim_matches(char::from(0)).trim().parse().ok()?;
    (v.is_finite() && v.fract() == 0.0 && v >= i32::MIN as f64 && v <= i32::MAX as f64).then_some(v as i32)
}

/// Convert decoded samples into class codes. Multi-band images keep their
/// first band. Non-finite floats become -1, which never counts as valid.
fn class_codes(image: DecodingResult, n_pixels: usize) -> Result<Vec<i32>> {
    let float_code = |v: f64| if v.is_finite() { v.round() as i32 } else { -1 };
    let values: Vec<i32> = match image {
        DecodingResult::U8(v) => v.into_iter().map(i32::from).collect(),
        DecodingResult::U16(v) => v.into_iter().map(i32::from).collect(),
        DecodingResult::U32(v) => v.into_iter().map(|x| i32::try_from(x).unwrap_or(-1)).collect(),
        DecodingResult::I8(v) => v.into_iter().map(i32::from).collect(),
        DecodingResult::I16(v) => v.into_iter().map(i32::from).collect(),
        DecodingResult::I32(v) => v,
        DecodingResult::F32(v) => v.into_iter().map(|x| float_code(f64::from(x))).collect(),
        DecodingResult::F64(v) => v.into_iter().map(float_code).collect(),
        _ => bail!("unsupported pixel type for a class raster"),
    };

    if n_pixels == 0 || values.len() % n_pixels != 0 {
        bail!("decoded {} samples for {} pixels", values.len(), n_pixels);
    }
    let bands = values.len() / n_pixels;
    if bands == 1 {
        return Ok(values);
    }
    warn!(bands, "multi-band raster; using band 1");
    Ok(values.into_iter().step_by(bands).collect())
}

// ── Outputs ──────────────────────────────────────────────────────────────────

fn multipolygon_coordinates(mp: &MultiPolygon<f64>) -> Vec<Vec<Vec<[f64; 2]>>> {
    mp.0.iter()
        .map(|p| {
            std::iter::once(p.exterior())
                .chain(p.interiors())
                .map(|ring| ring.coords().map(|c| [c.x, c.y]).collect())
                .collect()
        })
        .collect()
}

/// RFC 7946 feature collection of the grid. Non-WGS84 grids carry the
/// legacy named `crs` member so GIS tools place them correctly.
fn grid_geojson(grid: &Grid) -> serde_json::Value {
    let features: Vec<serde_json::Value> = grid
        .iter()
        .map(|cell| {
            json!({
                "type": "Feature",
                "properties": { "grid_id": cell.grid_id },
                "geometry": {
                    "type": "MultiPolygon",
                    "coordinates": multipolygon_coordinates(&cell.geometry),
                },
            })
        })
        .collect();
    let mut doc = json!({ "type": "FeatureCollection", "features": features });
    if grid.crs != Crs::Wgs84 {
        doc["crs"] = json!({
            "type": "name",
            "properties": { "name": format!("urn:ogc:def:crs:EPSG::{}", grid.crs.epsg()) },
        });
    }
    doc
}

fn status_label(status: CellStatus) -> &'static str {
    match status {
        CellStatus::Ok => "ok",
        CellStatus::NoValidPixels => "no_valid_pixels",
        CellStatus::EmptyGeometry => "empty_geometry",
        CellStatus::Failed => "failed",
    }
}

/// Rule names are restricted to `[A-Za-z0-9_-]`, so no field needs quoting.
fn write_transitions_csv<W: Write>(
    out: &mut W,
    rules: &[TransitionRule],
    records: &[TransitionRecord],
) -> io::Result<()> {
    write!(out, "grid_id,n_pixels,n_valid,status")?;
    for rule in rules {
        write!(out, ",{0}_n_origin,{0}_n_match,{0}_pct_of_cell,{0}_pct_of_origin", rule.name)?;
    }
    writeln!(out)?;

    for r in records {
        write!(out, "{},{},{},{}", r.grid_id, r.n_pixels, r.n_valid, status_label(r.status))?;
        for RuleCounts { n_origin, n_match, pct_of_cell, pct_of_origin, .. } in &r.rules {
            write!(out, ",{n_origin},{n_match},{pct_of_cell:.4},{pct_of_origin:.4}")?;
        }
        writeln!(out)?;
    }
    Ok(())
}

fn write_composition_csv<W: Write>(out: &mut W, changes: &[ClassChange]) -> io::Result<()> {
    writeln!(out, "grid_id,class,class_name,percent_before,percent_after,change_pct")?;
    for c in changes {
        let name = LandCoverClass::from_code(c.class).map_or("unknown", LandCoverClass::name);
        writeln!(
            out,
            "{},{},{},{:.4},{:.4},{:.4}",
            c.grid_id, c.class, name, c.percent_before, c.percent_after, c.change_pct
        )?;
    }
    Ok(())
}

fn write_file(path: &Path, write: impl FnOnce(&mut BufWriter<fs::File>) -> io::Result<()>) -> Result<()> {
    let file = fs::File::create(path).with_context(|| format!("Cannot create {}", path.display()))?;
    let mut out = BufWriter::new(file);
    write(&mut out)
        .and_then(|_| out.flush())
        .with_context(|| format!("Write failed: {}", path.display()))
}

fn aoi_name(args: &Args) -> Result<String> {
    match &args.name {
        Some(name) => Ok(name.clone()),
        None => args
            .aoi
            .file_stem()
            .and_then(|s| s.to_str())
            .map(str::to_string)
            .with_context(|| format!("Cannot derive a name from {}; pass --name", args.aoi.display())),
    }
}

// ── Main ─────────────────────────────────────────────────────────────────────

fn main() -> Result<()> {
    let args = Args::parse();
    init_tracing(args.verbose);

    let config = load_config(&args)?;
    let name = aoi_name(&args)?;

    let aoi_text = fs::read_to_string(&args.aoi)
        .with_context(|| format!("Cannot read {}", args.aoi.display()))?;
    let aoi = Aoi::new(parse_aoi_geojson(&aoi_text)?, Crs::Wgs84)
        .with_context(|| format!("Invalid AOI geometry in {}", args.aoi.display()))?;

    let before = read_raster(&args.before, args.raster_epsg)?;
    let after = read_raster(&args.after, args.raster_epsg)?;

    let analysis = analyze_aoi(&name, &aoi, &before, &after, &config, None)
        .with_context(|| format!("Analysis of {name} failed"))?;

    let out_dir = args.output.join(&name);
    fs::create_dir_all(&out_dir).with_context(|| format!("Cannot create {}", out_dir.display()))?;

    let grid_path = out_dir.join(format!("grid_{name}_{}m.geojson", config.cell_size_m));
    let grid_json = serde_json::to_string(&grid_geojson(&analysis.grid))?;
    fs::write(&grid_path, grid_json).with_context(|| format!("Write failed: {}", grid_path.display()))?;

    let csv_path = out_dir.join(format!("{name}_transitions.csv"));
    write_file(&csv_path, |out| write_transitions_csv(out, &config.rules, &analysis.records))?;

    let classes = all_codes();
    let on_failure = config.cell_failure_policy;
    let shares_before =
        class_composition(&analysis.grid, &before, &classes, on_failure).context("Composition failed")?;
    let shares_after =
        class_composition(&analysis.grid, &after, &classes, on_failure).context("Composition failed")?;
    let composition_path = out_dir.join(format!("{name}_composition.csv"));
    write_file(&composition_path, |out| {
        write_composition_csv(out, &compare_compositions(&shares_before, &shares_after))
    })?;

    let report_path = out_dir.join(format!("{name}_report.json"));
    fs::write(&report_path, serde_json::to_string_pretty(&analysis.report)?)
        .with_context(|| format!("Write failed: {}", report_path.display()))?;

    info!(aoi = %name, cells = analysis.grid.len(), output = %out_dir.display(), "done");
    Ok(())
}
