use std::fs;
use std::path::{Path, PathBuf};

use log::info;
use rusqlite::Connection;

use aideon_taxis_core::{Model, TaxisError, TaxisResult};

use crate::TaxisConfig;

const DEFAULT_DB_NAME: &str = "taxis.sqlite";

pub fn load_or_init_config(base: &Path) -> TaxisResult<TaxisConfig> {
    let default_sqlite = base.join(DEFAULT_DB_NAME);
    TaxisConfig::load_or_init(base, &default_sqlite)
}

/// Opens the configured SQLite database with foreign keys enforced. Schema
/// creation is left to the caller.
pub fn open_sqlite(config: &TaxisConfig, base: &Path) -> TaxisResult<Connection> {
    let path = config.sqlite_path(base)?;
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .map_err(|err| TaxisError::storage(format!("create database dir: {err}")))?;
    }
    let conn = Connection::open(&path)
        .map_err(|err| TaxisError::storage(format!("open {}: {err}", path.display())))?;
    conn.pragma_update(None, "foreign_keys", true)
        .map_err(|err| TaxisError::storage(format!("enable foreign keys: {err}")))?;
    info!("taxis: opened sqlite database {}", path.display());
    Ok(conn)
}

pub fn load_model(config: &TaxisConfig, base: &Path) -> TaxisResult<Model> {
    let path = config.model_path(base)?;
    let raw = fs::read_to_string(&path)
        .map_err(|err| TaxisError::storage(format!("read model {}: {err}", path.display())))?;
    let model = Model::from_json(&raw)?;
    info!(
        "taxis: loaded model {} with {} types",
        model.version().unwrap_or("unversioned"),
        aideon_taxis_core::MetadataResolver::entity_types(&model).len()
    );
    Ok(model)
}

pub fn default_sqlite_path(base: &Path) -> PathBuf {
    base.join(DEFAULT_DB_NAME)
}
