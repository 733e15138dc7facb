use std::collections::{HashMap, HashSet};

use duckdb::types::{ToSql, ToSqlOutput};
use duckdb::{Connection, params_from_iter};
use serde::Serialize;

use crate::error::ApiError;
use crate::geo::{self, GeoPoint};

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EstablishmentResult {
    pub code: String,
    pub name: Option<String>,
    pub tax_id: Option<String>,
    pub street: Option<String>,
    pub number: Option<String>,
    pub neighborhood: Option<String>,
    pub city: Option<String>,
    pub state: Option<String>,
    pub phone: Option<String>,
    pub latitude: f64,
    pub longitude: f64,
    pub staff: Vec<StaffMember>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StaffMember {
    pub professional_code: String,
    pub name: Option<String>,
    pub registration_number: Option<String>,
    pub specialty_name: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct Specialty {
    pub id: String,
    pub name: Option<String>,
}

#[derive(Debug, Clone)]
pub struct NearbyQuery {
    pub latitude: f64,
    pub longitude: f64,
    pub radius_km: f64,
    pub specialty_code: Option<String>,
    pub doctor_name: Option<String>,
    pub insurance_id: Option<i64>,
}

/// One flat row of the establishment/staff left join. Establishments with no
/// (matching) staff still produce a row, with the professional columns NULL.
#[derive(Debug, Clone)]
struct JoinedRow {
    code: String,
    name: Option<String>,
    tax_id: Option<String>,
    street: Option<String>,
    number: Option<String>,
    neighborhood: Option<String>,
    city: Option<String>,
    state: Option<String>,
    phone: Option<String>,
    latitude: f64,
    longitude: f64,
    professional_code: Option<String>,
    professional_name: Option<String>,
    registration_number: Option<String>,
    specialty_code: Option<String>,
    specialty_name: Option<String>,
}

const SELECT_JOINED: &str = r#"
    SELECT
      e.code,
      e.name,
      e.tax_id,
      e.street,
      e.number,
      e.neighborhood,
      e.city,
      e.state,
      e.phone,
      e.latitude,
      e.longitude,
      p.code AS professional_code,
      p.name AS professional_name,
      p.registration_number,
      COALESCE(sl.specialty_code, p.specialty_code) AS specialty_code,
      s.name AS specialty_name
    FROM establishments e
    LEFT JOIN staff_links sl ON sl.establishment_code = e.code
    LEFT JOIN professionals p ON p.code = sl.professional_code
    LEFT JOIN specialties s ON s.code = COALESCE(sl.specialty_code, p.specialty_code)
"#;

/// A bound SQL value. Every user-supplied value goes through one of these;
/// nothing is ever spliced into the SQL text.
#[derive(Debug, Clone)]
enum SqlValue {
    Text(String),
    Int(i64),
    Float(f64),
}

impl ToSql for SqlValue {
    fn to_sql(&self) -> duckdb::Result<ToSqlOutput<'_>> {
        match self {
            Self::Text(s) => s.to_sql(),
            Self::Int(i) => i.to_sql(),
            Self::Float(f) => f.to_sql(),
        }
    }
}

/// Conjunction of parameterized predicates over the establishment row `e`.
#[derive(Debug, Default)]
struct SqlFilter {
    clauses: Vec<String>,
    params: Vec<SqlValue>,
}

impl SqlFilter {
    fn push(&mut self, clause: &str, values: impl IntoIterator<Item = SqlValue>) {
        self.clauses.push(clause.to_string());
        self.params.extend(values);
    }

    fn where_sql(&self) -> String {
        format!("WHERE {}", self.clauses.join(" AND "))
    }
}

/// Staff-level predicates applied to roster membership after regrouping.
#[derive(Debug, Default)]
struct StaffFilter {
    doctor_name_lower: Option<String>,
    specialty_code: Option<String>,
}

impl StaffFilter {
    fn matches(&self, row: &JoinedRow) -> bool {
        if let Some(needle) = &self.doctor_name_lower {
            match &row.professional_name {
                Some(name) if name.to_lowercase().contains(needle) => {}
                _ => return false,
            }
        }
        if let Some(code) = &self.specialty_code {
            if row.specialty_code.as_deref() != Some(code.as_str()) {
                return false;
            }
        }
        true
    }
}

fn normalized(value: Option<&str>) -> Option<&str> {
    value.map(str::trim).filter(|s| !s.is_empty())
}

/// Radius-bounded spatial join: establishments within `radius_km` of the
/// reference point, each carrying its nested staff roster.
///
/// Establishment survival is existential per filter (one EXISTS subquery
/// each), so different staff members may satisfy different filters; roster
/// membership requires a staff row to satisfy every active staff filter.
/// The bounding box narrows candidates in SQL; the authoritative radius
/// predicate is the exact geodesic check, inclusive at the boundary.
pub fn find_nearby(
    conn: &Connection,
    q: &NearbyQuery,
) -> Result<Vec<EstablishmentResult>, ApiError> {
    geo::validate_coordinates(q.latitude, q.longitude)?;
    if !q.radius_km.is_finite() || q.radius_km <= 0.0 {
        return Err(ApiError::validation(format!(
            "radiusKm must be a positive number, got {}",
            q.radius_km
        )));
    }

    let center = GeoPoint::new(q.latitude, q.longitude);
    let bbox = geo::bounding_box(center, q.radius_km);

    let mut filter = SqlFilter::default();
    filter.push(
        "e.latitude BETWEEN ? AND ?",
        [SqlValue::Float(bbox.min_lat), SqlValue::Float(bbox.max_lat)],
    );
    filter.push(
        "e.longitude BETWEEN ? AND ?",
        [SqlValue::Float(bbox.min_lon), SqlValue::Float(bbox.max_lon)],
    );

    let doctor_name = normalized(q.doctor_name.as_deref());
    if let Some(name) = doctor_name {
        filter.push(
            "EXISTS (SELECT 1 FROM staff_links fl \
             JOIN professionals fp ON fp.code = fl.professional_code \
             WHERE fl.establishment_code = e.code AND fp.name ILIKE ?)",
            [SqlValue::Text(format!("%{name}%"))],
        );
    }

    let specialty_code = normalized(q.specialty_code.as_deref());
    if let Some(code) = specialty_code {
        filter.push(
            "EXISTS (SELECT 1 FROM staff_links fl \
             LEFT JOIN professionals fp ON fp.code = fl.professional_code \
             WHERE fl.establishment_code = e.code \
             AND COALESCE(fl.specialty_code, fp.specialty_code) = ?)",
            [SqlValue::Text(code.to_string())],
        );
    }

    if let Some(insurance_id) = q.insurance_id {
        filter.push(
            "EXISTS (SELECT 1 FROM establishment_insurances ei \
             WHERE ei.establishment_code = e.code AND ei.insurance_id = ?)",
            [SqlValue::Int(insurance_id)],
        );
    }

    let mut rows = fetch_joined_rows(conn, &filter)?;

    let radius_m = q.radius_km * 1000.0;
    rows.retain(|r| {
        geo::geodesic_distance_m(center, GeoPoint::new(r.latitude, r.longitude)) <= radius_m
    });

    let staff_filter = StaffFilter {
        doctor_name_lower: doctor_name.map(|s| s.to_lowercase()),
        specialty_code: specialty_code.map(|s| s.to_string()),
    };
    let grouped = group_rows(rows, &staff_filter);

    // Nearest first; ties broken by code for determinism.
    let mut scored: Vec<(f64, EstablishmentResult)> = grouped
        .into_iter()
        .map(|e| {
            let d = geo::geodesic_distance_m(center, GeoPoint::new(e.latitude, e.longitude));
            (d, e)
        })
        .collect();
    scored.sort_by(|a, b| a.0.total_cmp(&b.0).then_with(|| a.1.code.cmp(&b.1.code)));

    Ok(scored.into_iter().map(|(_, e)| e).collect())
}

/// Single establishment by CNES code, full roster, no spatial predicate.
pub fn get_by_code(
    conn: &Connection,
    code: &str,
) -> Result<Option<EstablishmentResult>, ApiError> {
    let mut filter = SqlFilter::default();
    filter.push("e.code = ?", [SqlValue::Text(code.to_string())]);

    let rows = fetch_joined_rows(conn, &filter)?;
    Ok(group_rows(rows, &StaffFilter::default()).into_iter().next())
}

pub fn list_specialties(conn: &Connection) -> Result<Vec<Specialty>, ApiError> {
    let mut stmt = conn.prepare("SELECT code, name FROM specialties ORDER BY name ASC")?;
    let rows = stmt.query_map([], |row| {
        Ok(Specialty {
            id: row.get::<usize, String>(0)?,
            name: row.get::<usize, Option<String>>(1)?,
        })
    })?;
    let mut out = Vec::new();
    for r in rows {
        out.push(r?);
    }
    Ok(out)
}

fn fetch_joined_rows(conn: &Connection, filter: &SqlFilter) -> Result<Vec<JoinedRow>, ApiError> {
    let sql = format!(
        "{SELECT_JOINED} {} ORDER BY e.code ASC, p.code ASC",
        filter.where_sql()
    );
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt.query_map(params_from_iter(filter.params.iter()), |row| {
        Ok((
            row.get::<usize, String>(0)?,
            row.get::<usize, Option<String>>(1)?,
            row.get::<usize, Option<String>>(2)?,
            row.get::<usize, Option<String>>(3)?,
            row.get::<usize, Option<String>>(4)?,
            row.get::<usize, Option<String>>(5)?,
            row.get::<usize, Option<String>>(6)?,
            row.get::<usize, Option<String>>(7)?,
            row.get::<usize, Option<String>>(8)?,
            row.get::<usize, Option<f64>>(9)?,
            row.get::<usize, Option<f64>>(10)?,
            row.get::<usize, Option<String>>(11)?,
            row.get::<usize, Option<String>>(12)?,
            row.get::<usize, Option<String>>(13)?,
            row.get::<usize, Option<String>>(14)?,
            row.get::<usize, Option<String>>(15)?,
        ))
    })?;

    let mut out = Vec::new();
    for r in rows {
        let (
            code,
            name,
            tax_id,
            street,
            number,
            neighborhood,
            city,
            state,
            phone,
            latitude,
            longitude,
            professional_code,
            professional_name,
            registration_number,
            specialty_code,
            specialty_name,
        ) = r?;

        // An establishment without a valid point is excluded, not fatal.
        let (Some(latitude), Some(longitude)) = (latitude, longitude) else {
            continue;
        };

        out.push(JoinedRow {
            code,
            name,
            tax_id,
            street,
            number,
            neighborhood,
            city,
            state,
            phone,
            latitude,
            longitude,
            professional_code,
            professional_name,
            registration_number,
            specialty_code,
            specialty_name,
        });
    }
    Ok(out)
}

/// Folds flat joined rows into one record per establishment code, preserving
/// first-seen order. Rows with a NULL professional code exist only to carry
/// the establishment and add no roster entry; roster entries are
/// deduplicated by professional code and limited to rows passing the staff
/// filter.
fn group_rows(rows: Vec<JoinedRow>, staff_filter: &StaffFilter) -> Vec<EstablishmentResult> {
    let mut order: Vec<String> = Vec::new();
    let mut by_code: HashMap<String, EstablishmentResult> = HashMap::new();
    let mut seen_staff: HashMap<String, HashSet<String>> = HashMap::new();

    for row in rows {
        if !by_code.contains_key(&row.code) {
            order.push(row.code.clone());
            by_code.insert(
                row.code.clone(),
                EstablishmentResult {
                    code: row.code.clone(),
                    name: row.name.clone(),
                    tax_id: row.tax_id.clone(),
                    street: row.street.clone(),
                    number: row.number.clone(),
                    neighborhood: row.neighborhood.clone(),
                    city: row.city.clone(),
                    state: row.state.clone(),
                    phone: row.phone.clone(),
                    latitude: row.latitude,
                    longitude: row.longitude,
                    staff: Vec::new(),
                },
            );
        }

        let Some(professional_code) = row.professional_code.clone() else {
            continue;
        };
        if !staff_filter.matches(&row) {
            continue;
        }
        let seen = seen_staff.entry(row.code.clone()).or_default();
        if !seen.insert(professional_code.clone()) {
            continue;
        }
        if let Some(entry) = by_code.get_mut(&row.code) {
            entry.staff.push(StaffMember {
                professional_code,
                name: row.professional_name,
                registration_number: row.registration_number,
                specialty_name: row.specialty_name,
            });
        }
    }

    order
        .into_iter()
        .filter_map(|code| by_code.remove(&code))
        .collect()
}
