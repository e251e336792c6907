use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{CoreError, CoreResult};

/// Which backend a manager is opened on.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    #[default]
    Memory,
    Sqlite,
}

/// Configuration for opening a [`Manager`](crate::Manager).
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Storage engine.
    pub backend: BackendKind,
    /// Database file for the SQLite backend. `None` opens an in-memory database.
    pub path: Option<PathBuf>,
    /// Truncate every table when the store is opened.
    pub reset_on_open: bool,
    /// Reclaim free space after a reset.
    pub compact_on_reset: bool,
    /// Buffer size of each event subscriber.
    pub event_capacity: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            backend: BackendKind::Memory,
            path: None,
            reset_on_open: false,
            compact_on_reset: true,
            event_capacity: 1024,
        }
    }
}

impl StoreConfig {
    /// An in-memory store.
    pub fn memory() -> Self {
        Self::default()
    }

    /// A SQLite store at `path`.
    pub fn sqlite(path: impl Into<PathBuf>) -> Self {
        Self {
            backend: BackendKind::Sqlite,
            path: Some(path.into()),
            ..Default::default()
        }
    }

    pub fn from_toml_str(input: &str) -> CoreResult<Self> {
        let config: Self = toml::from_str(input).map_err(|e| CoreError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Read and parse a TOML file.
    pub fn load(path: impl AsRef<Path>) -> CoreResult<Self> {
        let path = path.as_ref();
        let input = std::fs::read_to_string(path)
            .map_err(|e| CoreError::Config(format!("{}: {e}", path.display())))?;
        Self::from_toml_str(&input)
    }

    pub fn to_toml_string(&self) -> CoreResult<String> {
        toml::to_string(self).map_err(|e| CoreError::Config(e.to_string()))
    }

    fn validate(&self) -> CoreResult<()> {
        if self.event_capacity == 0 {
            return Err(CoreError::Config("event_capacity must be positive".into()));
        }
        if self.backend == BackendKind::Memory && self.path.is_some() {
            return Err(CoreError::Config(
                "path is only meaningful for the sqlite backend".into(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_document_is_default() {
        let config = StoreConfig::from_toml_str("").unwrap();
        assert_eq!(config, StoreConfig::default());
        assert!(config.compact_on_reset);
        assert_eq!(config.event_capacity, 1024);
    }

    #[test]
    fn parses_sqlite_section() {
        let config = StoreConfig::from_toml_str(
            r#"
            backend = "sqlite"
            path = "data/strata.db"
            reset_on_open = true
            "#,
        )
        .unwrap();
        assert_eq!(config.backend, BackendKind::Sqlite);
        assert_eq!(config.path, Some(PathBuf::from("data/strata.db")));
        assert!(config.reset_on_open);
    }

    #[test]
    fn rejects_invalid_values() {
        assert!(matches!(
            StoreConfig::from_toml_str("event_capacity = 0"),
            Err(CoreError::Config(_))
        ));
        assert!(StoreConfig::from_toml_str("backend = \"postgres\"").is_err());
        assert!(StoreConfig::from_toml_str("path = \"x.db\"").is_err());
    }

    #[test]
    fn load_reads_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("strata.toml");
        let config = StoreConfig::sqlite(dir.path().join("s.db"));
        std::fs::write(&path, config.to_toml_string().unwrap()).unwrap();
        assert_eq!(StoreConfig::load(&path).unwrap(), config);
        assert!(StoreConfig::load(dir.path().join("missing.toml")).is_err());
    }
}
