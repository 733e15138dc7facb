use geo::{Distance, Geodesic, Point};
use serde::Serialize;

use crate::error::ApiError;

// Meridian/equatorial degree lengths used only to size the SQL prefilter box.
const KM_PER_DEG_LAT: f64 = 110.574;
const KM_PER_DEG_LON_EQUATOR: f64 = 111.320;

/// WGS84 coordinate pair (SRID 4326).
#[derive(Debug, Clone, Copy, Serialize)]
pub struct GeoPoint {
    pub latitude: f64,
    pub longitude: f64,
}

impl GeoPoint {
    pub fn new(latitude: f64, longitude: f64) -> Self {
        Self {
            latitude,
            longitude,
        }
    }
}

pub fn validate_coordinates(latitude: f64, longitude: f64) -> Result<(), ApiError> {
    if !latitude.is_finite() || !(-90.0..=90.0).contains(&latitude) {
        return Err(ApiError::validation(format!(
            "latitude {latitude} is outside [-90, 90]"
        )));
    }
    if !longitude.is_finite() || !(-180.0..=180.0).contains(&longitude) {
        return Err(ApiError::validation(format!(
            "longitude {longitude} is outside [-180, 180]"
        )));
    }
    Ok(())
}

/// Ellipsoidal (Karney) distance in meters. Matches the `geography` distance
/// semantics of a PostGIS `ST_DWithin`, not planar math on raw degrees.
pub fn geodesic_distance_m(a: GeoPoint, b: GeoPoint) -> f64 {
    Geodesic::distance(
        Point::new(a.longitude, a.latitude),
        Point::new(b.longitude, b.latitude),
    )
}

#[derive(Debug, Clone, Copy)]
pub struct BoundingBox {
    pub min_lat: f64,
    pub max_lat: f64,
    pub min_lon: f64,
    pub max_lon: f64,
}

/// Padded lat/lon box guaranteed to contain every point within `radius_km`
/// of `center`. Only a coarse SQL prefilter; the exact geodesic check runs
/// on the rows it admits. Near the poles (or when the box would cross the
/// antimeridian) the longitude range widens to the full span instead of
/// wrongly excluding candidates.
pub fn bounding_box(center: GeoPoint, radius_km: f64) -> BoundingBox {
    let pad = 1.05;
    let lat_delta = (radius_km / KM_PER_DEG_LAT) * pad;
    let min_lat = (center.latitude - lat_delta).max(-90.0);
    let max_lat = (center.latitude + lat_delta).min(90.0);

    let cos_lat = center.latitude.to_radians().cos();
    let lon_delta = if cos_lat <= 1e-6 {
        360.0
    } else {
        (radius_km / (KM_PER_DEG_LON_EQUATOR * cos_lat)) * pad
    };

    let (min_lon, max_lon) = if lon_delta >= 180.0
        || center.longitude - lon_delta < -180.0
        || center.longitude + lon_delta > 180.0
    {
        (-180.0, 180.0)
    } else {
        (center.longitude - lon_delta, center.longitude + lon_delta)
    };

    BoundingBox {
        min_lat,
        max_lat,
        min_lon,
        max_lon,
    }
}
