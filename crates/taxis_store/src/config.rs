use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use aideon_taxis_core::{FeedbackMode, TaxisError, TaxisResult, WriteOptions};

use crate::Dialect;

const DEFAULT_CONFIG_NAME: &str = "taxis.json";

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "backend", rename_all = "lowercase")]
pub enum DatabaseConfig {
    Sqlite { path: Option<String> },
    Postgres { url: String },
    Mysql { url: String },
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct WriteConfig {
    pub optimistic_lock: Option<bool>,
    pub check_mandatory: Option<bool>,
    pub audit: Option<bool>,
    pub feedback_mode: Option<FeedbackMode>,
}

impl WriteConfig {
    pub fn with_defaults() -> Self {
        Self {
            optimistic_lock: Some(true),
            check_mandatory: Some(true),
            audit: Some(true),
            feedback_mode: Some(FeedbackMode::Collect),
        }
    }

    pub fn options(&self) -> WriteOptions {
        let defaults = WriteOptions::default();
        WriteOptions {
            optimistic_lock: self.optimistic_lock.unwrap_or(defaults.optimistic_lock),
            check_mandatory: self.check_mandatory.unwrap_or(defaults.check_mandatory),
            feedback: self.feedback_mode.unwrap_or(defaults.feedback),
        }
    }
}

/// Bookkeeping column names present on every entity table.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ColumnNames {
    pub identifier: String,
    pub entity_type: String,
    pub version: String,
    pub created_timestamp: String,
    pub created_by_id: String,
    pub created_by_name: String,
    pub updated_timestamp: String,
    pub updated_by_id: String,
    pub updated_by_name: String,
}

impl Default for ColumnNames {
    fn default() -> Self {
        Self {
            identifier: "__identifier".into(),
            entity_type: "__entity_type".into(),
            version: "__version".into(),
            created_timestamp: "__created_timestamp".into(),
            created_by_id: "__created_by_id".into(),
            created_by_name: "__created_by_name".into(),
            updated_timestamp: "__updated_timestamp".into(),
            updated_by_id: "__updated_by_id".into(),
            updated_by_name: "__updated_by_name".into(),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TaxisConfig {
    pub database: DatabaseConfig,
    pub write: Option<WriteConfig>,
    pub columns: Option<ColumnNames>,
    pub model_path: Option<String>,
}

impl TaxisConfig {
    pub fn default_sqlite(path: impl Into<String>) -> Self {
        Self {
            database: DatabaseConfig::Sqlite {
                path: Some(path.into()),
            },
            write: Some(WriteConfig::with_defaults()),
            columns: None,
            model_path: Some("model.json".to_string()),
        }
    }

    pub fn load_or_init(base_dir: &Path, default_sqlite_path: &Path) -> TaxisResult<Self> {
        fs::create_dir_all(base_dir)
            .map_err(|err| TaxisError::storage(format!("create config dir: {err}")))?;
        let config_path = base_dir.join(DEFAULT_CONFIG_NAME);
        if config_path.exists() {
            let raw = fs::read_to_string(&config_path)
                .map_err(|err| TaxisError::storage(format!("read config: {err}")))?;
            let config: TaxisConfig =
                serde_json::from_str(&raw).map_err(|err| TaxisError::invalid(err.to_string()))?;
            return Ok(config);
        }
        let default = TaxisConfig::default_sqlite(default_sqlite_path.to_string_lossy());
        let payload = serde_json::to_string_pretty(&default)
            .map_err(|err| TaxisError::storage(format!("serialize config: {err}")))?;
        fs::write(&config_path, payload)
            .map_err(|err| TaxisError::storage(format!("write config: {err}")))?;
        Ok(default)
    }

    pub fn sqlite_path(&self, base_dir: &Path) -> TaxisResult<PathBuf> {
        match &self.database {
            DatabaseConfig::Sqlite { path } => {
                let path = path.clone().unwrap_or_else(|| "taxis.sqlite".to_string());
                Ok(resolve(base_dir, &path))
            }
            _ => Err(TaxisError::invalid("config is not sqlite backend")),
        }
    }

    pub fn model_path(&self, base_dir: &Path) -> TaxisResult<PathBuf> {
        self.model_path
            .as_deref()
            .map(|path| resolve(base_dir, path))
            .ok_or_else(|| TaxisError::invalid("config has no model_path"))
    }

    pub fn backend_name(&self) -> &'static str {
        self.dialect().name()
    }

    pub fn dialect(&self) -> Dialect {
        match self.database {
            DatabaseConfig::Sqlite { .. } => Dialect::Sqlite,
            DatabaseConfig::Postgres { .. } => Dialect::Postgres,
            DatabaseConfig::Mysql { .. } => Dialect::Mysql,
        }
    }

    pub fn connection_url(&self) -> Option<&str> {
        match &self.database {
            DatabaseConfig::Sqlite { .. } => None,
            DatabaseConfig::Postgres { url } | DatabaseConfig::Mysql { url } => Some(url.as_str()),
        }
    }

    pub fn write_options(&self) -> WriteOptions {
        self.write
            .as_ref()
            .map(WriteConfig::options)
            .unwrap_or_default()
    }

    pub fn audit_enabled(&self) -> bool {
        self.write
            .as_ref()
            .and_then(|write| write.audit)
            .unwrap_or(true)
    }

    pub fn column_names(&self) -> ColumnNames {
        self.columns.clone().unwrap_or_default()
    }
}

fn resolve(base_dir: &Path, path: &str) -> PathBuf {
    let candidate = PathBuf::from(path);
    if candidate.is_absolute() {
        candidate
    } else {
        base_dir.join(candidate)
    }
}
