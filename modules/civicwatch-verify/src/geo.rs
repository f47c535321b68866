//! Geospatial cell index for proximity queries.
//!
//! Reports are bucketed into precision-7 geohash cells (~153m x 153m).
//! A proximity query expands the center cell to its 8 neighbors so that two
//! reports meters apart on opposite sides of a cell edge still find each
//! other; an exact haversine cutoff is applied to the candidates afterwards,
//! since the 3x3 block spans well beyond the intended radius.

use geohash::Coord;

use civicwatch_common::VerifyError;

/// Geohash precision for report cells. Precision 7 yields ~153m x 153m
/// cells, matching the intended duplicate-proximity radius.
pub const CELL_PRECISION: usize = 7;

/// Haversine cutoff (meters) applied to proximity candidates.
pub const DEFAULT_PROXIMITY_RADIUS_M: f64 = 150.0;

/// Encode a point into its precision-7 cell key.
pub fn encode_cell(lat: f64, lng: f64) -> Result<String, VerifyError> {
    geohash::encode(Coord { x: lng, y: lat }, CELL_PRECISION)
        .map_err(|e| VerifyError::InvalidLocation(e.to_string()))
}

/// The cell itself plus its 8 adjacent cells. Falls back to the lone center
/// cell if neighbor expansion fails (possible only at the poles).
pub fn cell_with_neighbors(cell: &str) -> Vec<String> {
    let mut cells = vec![cell.to_string()];
    if let Ok(n) = geohash::neighbors(cell) {
        for adjacent in [n.n, n.ne, n.e, n.se, n.s, n.sw, n.w, n.nw] {
            if !cells.contains(&adjacent) {
                cells.push(adjacent);
            }
        }
    }
    cells
}
