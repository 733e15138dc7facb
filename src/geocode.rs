use std::time::Duration;

use anyhow::Context;
use serde::Serialize;
use serde_json::Value;

use crate::error::ApiError;
use crate::geo::GeoPoint;

/// Photon returns at most this many candidates; the first one seeds the
/// proximity search, the rest are disambiguation suggestions.
const CANDIDATE_LIMIT: u32 = 5;

/// One geocoding candidate, normalized from the raw provider document.
/// Every provider field is optional at this boundary.
#[derive(Debug, Clone, Serialize)]
pub struct AddressCandidate {
    pub street: Option<String>,
    pub district: Option<String>,
    pub city: Option<String>,
    pub county: Option<String>,
    pub state: Option<String>,
    pub postcode: Option<String>,
    pub country: Option<String>,
    pub name: Option<String>,
    pub location: GeoPoint,
}

impl AddressCandidate {
    /// Single display string with absent fields skipped.
    pub fn display_label(&self) -> String {
        [
            &self.name,
            &self.street,
            &self.district,
            &self.city,
            &self.county,
            &self.state,
            &self.postcode,
            &self.country,
        ]
        .into_iter()
        .filter_map(|f| f.as_deref())
        .collect::<Vec<_>>()
        .join(", ")
    }
}

pub struct PhotonClient {
    http: reqwest::Client,
    base_url: String,
}

impl PhotonClient {
    pub fn new(base_url: &str, timeout: Duration) -> anyhow::Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .context("build geocoder http client")?;
        Ok(Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    /// Resolves a free-text address to candidate locations. Blank input is a
    /// validation error (checked before any network call); an unreachable or
    /// non-success geocoder degrades to an empty list, never a hard failure.
    pub async fn resolve(&self, address: &str) -> Result<Vec<AddressCandidate>, ApiError> {
        let address = address.trim();
        if address.is_empty() {
            return Err(ApiError::validation("address must not be blank"));
        }

        let url = format!("{}/api/", self.base_url);
        let limit = CANDIDATE_LIMIT.to_string();
        let response = match self
            .http
            .get(&url)
            .query(&[("q", address), ("limit", limit.as_str())])
            .send()
            .await
        {
            Ok(r) => r,
            Err(e) => {
                tracing::warn!("geocoder unreachable: {e}");
                return Ok(Vec::new());
            }
        };

        if !response.status().is_success() {
            tracing::warn!("geocoder returned {}", response.status());
            return Ok(Vec::new());
        }

        let body: Value = match response.json().await {
            Ok(v) => v,
            Err(e) => {
                tracing::warn!("geocoder response was not valid JSON: {e}");
                return Ok(Vec::new());
            }
        };

        Ok(parse_photon_features(&body))
    }
}

/// Translates the untyped GeoJSON document into typed candidates. Features
/// without a usable `[lon, lat]` coordinate pair are skipped.
pub fn parse_photon_features(body: &Value) -> Vec<AddressCandidate> {
    let Some(features) = body.get("features").and_then(|f| f.as_array()) else {
        return Vec::new();
    };

    let mut out = Vec::new();
    for feature in features {
        let coords = feature
            .get("geometry")
            .and_then(|g| g.get("coordinates"))
            .and_then(|c| c.as_array());
        let Some(coords) = coords else {
            continue;
        };
        // Photon coordinates arrive [lon, lat].
        let (Some(lon), Some(lat)) = (
            coords.first().and_then(Value::as_f64),
            coords.get(1).and_then(Value::as_f64),
        ) else {
            continue;
        };

        let props = feature.get("properties");
        out.push(AddressCandidate {
            street: clean_field(props, "street"),
            district: clean_field(props, "district"),
            city: clean_field(props, "city"),
            county: clean_field(props, "county"),
            state: clean_field(props, "state"),
            postcode: clean_field(props, "postcode"),
            country: clean_field(props, "country"),
            name: clean_field(props, "name"),
            location: GeoPoint::new(lat, lon),
        });
    }
    out
}

/// Providers emit missing fields as absent keys, empty strings, or the
/// literal string "null"; all three normalize to None.
fn clean_field(props: Option<&Value>, key: &str) -> Option<String> {
    props
        .and_then(|p| p.get(key))
        .and_then(|v| v.as_str())
        .map(str::trim)
        .filter(|s| !s.is_empty() && !s.eq_ignore_ascii_case("null"))
        .map(|s| s.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn feature(props: Value, coords: Value) -> Value {
        json!({
            "features": [{
                "geometry": { "coordinates": coords },
                "properties": props
            }]
        })
    }

    #[test]
    fn parses_a_full_feature_with_lon_lat_ordering() {
        let body = feature(
            json!({
                "street": "Rua Rio Branco",
                "district": "Centro",
                "city": "Marília",
                "state": "São Paulo",
                "postcode": "17500-090",
                "country": "Brasil",
                "name": "Santa Casa"
            }),
            json!([-49.9630, -22.2364]),
        );
        let candidates = parse_photon_features(&body);
        assert_eq!(candidates.len(), 1);
        let c = &candidates[0];
        assert_eq!(c.location.latitude, -22.2364);
        assert_eq!(c.location.longitude, -49.9630);
        assert_eq!(c.city.as_deref(), Some("Marília"));
        assert_eq!(c.county, None);
    }

    #[test]
    fn normalizes_null_placeholders_and_blanks_to_absent() {
        let body = feature(
            json!({
                "street": "null",
                "district": "  ",
                "city": "Marília",
                "name": "NULL"
            }),
            json!([-49.9630, -22.2364]),
        );
        let c = &parse_photon_features(&body)[0];
        assert_eq!(c.street, None);
        assert_eq!(c.district, None);
        assert_eq!(c.name, None);
        assert_eq!(c.city.as_deref(), Some("Marília"));
    }

    #[test]
    fn skips_features_without_usable_coordinates() {
        let body = json!({
            "features": [
                { "geometry": { "coordinates": [] }, "properties": {} },
                { "geometry": { "coordinates": ["x", "y"] }, "properties": {} },
                { "properties": { "city": "Marília" } },
                { "geometry": { "coordinates": [-49.9, -22.2] }, "properties": {} }
            ]
        });
        let candidates = parse_photon_features(&body);
        assert_eq!(candidates.len(), 1);
        assert_eq!(candidates[0].location.longitude, -49.9);
    }

    #[test]
    fn empty_or_shapeless_documents_yield_no_candidates() {
        assert!(parse_photon_features(&json!({})).is_empty());
        assert!(parse_photon_features(&json!({ "features": [] })).is_empty());
        assert!(parse_photon_features(&json!("nonsense")).is_empty());
    }

    #[test]
    fn display_label_skips_absent_fields() {
        let body = feature(
            json!({
                "name": "Santa Casa",
                "city": "Marília",
                "state": "São Paulo",
                "street": "null"
            }),
            json!([-49.9630, -22.2364]),
        );
        let c = &parse_photon_features(&body)[0];
        assert_eq!(c.display_label(), "Santa Casa, Marília, São Paulo");
    }

    #[tokio::test]
    async fn blank_address_is_rejected_before_any_network_call() {
        // Unroutable base URL: if a request were attempted it would error
        // rather than return Validation.
        let client = PhotonClient::new("http://127.0.0.1:9", Duration::from_secs(1)).unwrap();
        for input in ["", "   ", "\t\n"] {
            match client.resolve(input).await {
                Err(ApiError::Validation(_)) => {}
                other => panic!("expected validation error, got {other:?}"),
            }
        }
    }

    #[tokio::test]
    async fn unreachable_geocoder_degrades_to_empty_list() {
        let client = PhotonClient::new("http://127.0.0.1:9", Duration::from_secs(1)).unwrap();
        let candidates = client.resolve("Rua Rio Branco, Marília").await.unwrap();
        assert!(candidates.is_empty());
    }
}
