use std::path::{Path, PathBuf};

use anyhow::{Context, anyhow};
use duckdb::Connection;

/// Tables the bulk-import job must have loaded before the API can serve.
const REQUIRED_TABLES: &[&str] = &[
    "establishments",
    "professionals",
    "staff_links",
    "specialties",
    "insurances",
    "establishment_insurances",
];

#[derive(Debug, Clone)]
pub struct StoragePaths {
    pub duckdb_path: PathBuf,
}

impl StoragePaths {
    pub fn new(data_dir: impl Into<PathBuf>) -> Self {
        let data_dir: PathBuf = data_dir.into();
        Self {
            duckdb_path: data_dir.join("cnes.duckdb"),
        }
    }
}

/// Opens the CNES database and fails fast (with a remediation hint) when the
/// file or any required table is missing.
pub fn open_store(paths: &StoragePaths) -> anyhow::Result<Connection> {
    if !file_present_nonempty(&paths.duckdb_path) {
        return Err(anyhow!(
            "CNES database not found at {}. Load the CNES extract first.",
            paths.duckdb_path.display()
        ));
    }

    let conn = Connection::open(&paths.duckdb_path)
        .with_context(|| format!("open duckdb at {}", paths.duckdb_path.display()))?;
    verify_tables(&conn)?;
    Ok(conn)
}

pub fn verify_tables(conn: &Connection) -> anyhow::Result<()> {
    for table in REQUIRED_TABLES {
        let sql = format!("SELECT * FROM {table} LIMIT 1");
        conn.prepare(&sql)
            .map_err(|e| anyhow!("required table {table} is not queryable: {e}"))?;
    }
    Ok(())
}

pub fn file_present_nonempty(path: &Path) -> bool {
    match std::fs::metadata(path) {
        Ok(m) => m.is_file() && m.len() > 0,
        Err(_) => false,
    }
}
