use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use axum::extract::{Path as AxumPath, Query, State};
use axum::routing::get;
use axum::{Json, Router};
use duckdb::Connection;
use serde::Deserialize;
use tokio::sync::Mutex;
use tower_http::cors::{Any, CorsLayer};

use crate::cli::ServeArgs;
use crate::error::ApiError;
use crate::geocode::{AddressCandidate, PhotonClient};
use crate::query::{self, EstablishmentResult, NearbyQuery, Specialty};
use crate::storage::{StoragePaths, open_store};

const DEFAULT_RADIUS_KM: f64 = 5.0;

#[derive(Clone)]
struct AppState {
    db: Arc<Mutex<Connection>>,
    geocoder: Arc<PhotonClient>,
}

pub async fn run(opts: ServeArgs) -> anyhow::Result<()> {
    let paths = StoragePaths::new(&opts.data_dir);
    let conn = open_store(&paths)?;
    tracing::info!("Opened CNES database at {}", paths.duckdb_path.display());

    let geocoder = PhotonClient::new(
        &opts.photon_url,
        Duration::from_secs(opts.geocode_timeout_secs),
    )?;

    let state = AppState {
        db: Arc::new(Mutex::new(conn)),
        geocoder: Arc::new(geocoder),
    };
    let app = build_router(state);

    let addr: SocketAddr = format!("{}:{}", opts.host, opts.port)
        .parse()
        .context("parse host:port")?;

    tracing::info!("Listening on http://{}", addr);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;
    Ok(())
}

fn build_router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/address/search", get(api_address_search))
        .route("/establishments/nearby", get(api_nearby))
        .route("/establishments/:code", get(api_establishment))
        .route("/specialties", get(api_specialties))
        .layer(cors)
        .with_state(state)
}

#[derive(Debug, Deserialize)]
struct AddressParams {
    address: String,
}

async fn api_address_search(
    State(st): State<AppState>,
    Query(p): Query<AddressParams>,
) -> Result<Json<Vec<AddressCandidate>>, ApiError> {
    let candidates = st.geocoder.resolve(&p.address).await?;
    if candidates.is_empty() {
        return Err(ApiError::not_found("no address candidates found"));
    }
    tracing::debug!("primary candidate: {}", candidates[0].display_label());
    Ok(Json(candidates))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct NearbyParams {
    latitude: f64,
    longitude: f64,
    #[serde(default = "default_radius_km")]
    radius_km: f64,
    specialty_id: Option<String>,
    doctor_name: Option<String>,
    insurance_id: Option<i64>,
}

fn default_radius_km() -> f64 {
    DEFAULT_RADIUS_KM
}

async fn api_nearby(
    State(st): State<AppState>,
    Query(p): Query<NearbyParams>,
) -> Result<Json<Vec<EstablishmentResult>>, ApiError> {
    let q = NearbyQuery {
        latitude: p.latitude,
        longitude: p.longitude,
        radius_km: p.radius_km,
        specialty_code: p.specialty_id,
        doctor_name: p.doctor_name,
        insurance_id: p.insurance_id,
    };
    let db = st.db.lock().await;
    Ok(Json(query::find_nearby(&db, &q)?))
}

async fn api_establishment(
    State(st): State<AppState>,
    AxumPath(code): AxumPath<String>,
) -> Result<Json<EstablishmentResult>, ApiError> {
    let db = st.db.lock().await;
    let result = query::get_by_code(&db, &code)?
        .ok_or_else(|| ApiError::not_found(format!("establishment {code} not found")))?;
    Ok(Json(result))
}

async fn api_specialties(
    State(st): State<AppState>,
) -> Result<Json<Vec<Specialty>>, ApiError> {
    let db = st.db.lock().await;
    Ok(Json(query::list_specialties(&db)?))
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use http_body_util::BodyExt;
    use serde_json::Value;
    use tower::ServiceExt;

    fn test_state() -> AppState {
        let conn = Connection::open_in_memory().unwrap();
        conn.execute_batch(
            r#"
            CREATE TABLE establishments(
                code TEXT, name TEXT, tax_id TEXT, street TEXT, number TEXT,
                neighborhood TEXT, city TEXT, state TEXT, phone TEXT,
                latitude DOUBLE, longitude DOUBLE
            );
            CREATE TABLE professionals(
                code TEXT, name TEXT, registration_number TEXT, specialty_code TEXT
            );
            CREATE TABLE staff_links(
                establishment_code TEXT, professional_code TEXT, specialty_code TEXT
            );
            CREATE TABLE specialties(code TEXT, name TEXT);
            CREATE TABLE insurances(id BIGINT, name TEXT);
            CREATE TABLE establishment_insurances(establishment_code TEXT, insurance_id BIGINT);

            INSERT INTO establishments VALUES
              ('2077469', 'Santa Casa de Marília', '11.222.333/0001-44', 'Rua Rio Branco',
               '500', 'Centro', 'Marília', 'SP', '(14) 3402-1000', -22.2337, -49.9630);
            INSERT INTO professionals VALUES
              ('P1', 'Dra. Ana Cardoso', 'CNS100', 'CARD');
            INSERT INTO staff_links VALUES ('2077469', 'P1', NULL);
            INSERT INTO specialties VALUES ('CARD', 'Cardiologia');
            "#,
        )
        .unwrap();

        // Unroutable geocoder: every resolve degrades to "no candidates".
        let geocoder =
            PhotonClient::new("http://127.0.0.1:9", Duration::from_secs(1)).unwrap();
        AppState {
            db: Arc::new(Mutex::new(conn)),
            geocoder: Arc::new(geocoder),
        }
    }

    async fn get_json(uri: &str) -> (StatusCode, Value) {
        let app = build_router(test_state());
        let response = app
            .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
            .await
            .unwrap();
        let status = response.status();
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        let body = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
        (status, body)
    }

    #[tokio::test]
    async fn nearby_returns_establishments_with_camel_case_fields() {
        let (status, body) =
            get_json("/establishments/nearby?latitude=-22.2364&longitude=-49.9630&radiusKm=1")
                .await;
        assert_eq!(status, StatusCode::OK);
        let results = body.as_array().unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0]["code"], "2077469");
        assert_eq!(results[0]["taxId"], "11.222.333/0001-44");
        assert_eq!(results[0]["staff"][0]["professionalCode"], "P1");
        assert_eq!(results[0]["staff"][0]["registrationNumber"], "CNS100");
        assert_eq!(results[0]["staff"][0]["specialtyName"], "Cardiologia");
    }

    #[tokio::test]
    async fn nearby_defaults_the_radius_to_five_km() {
        let (status, body) =
            get_json("/establishments/nearby?latitude=-22.2364&longitude=-49.9630").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body.as_array().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn nearby_rejects_a_non_positive_radius() {
        let (status, _) =
            get_json("/establishments/nearby?latitude=-22.2364&longitude=-49.9630&radiusKm=0")
                .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn nearby_requires_coordinates() {
        let (status, _) = get_json("/establishments/nearby?radiusKm=1").await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn establishment_lookup_maps_unknown_codes_to_404() {
        let (status, body) = get_json("/establishments/2077469").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["name"], "Santa Casa de Marília");

        let (status, _) = get_json("/establishments/0000000").await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn specialties_catalog_passthrough() {
        let (status, body) = get_json("/specialties").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body[0]["id"], "CARD");
        assert_eq!(body[0]["name"], "Cardiologia");
    }

    #[tokio::test]
    async fn blank_address_is_a_400() {
        let (status, _) = get_json("/address/search?address=%20%20").await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn unresolvable_address_is_a_404_not_a_500() {
        let (status, _) = get_json("/address/search?address=Rua%20Rio%20Branco").await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }
}
