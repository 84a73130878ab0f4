//! Read-only lookup into the host data catalog
//!
//! The catalog owns dataset records; this crate only resolves URL paths and
//! dataset names to `(id, name, title)`.

use crate::config::CatalogConfig;
use crate::db::StatStore;
use crate::error::{Error, Result};
use crate::types::CatalogEntity;
use regex::Regex;
use rusqlite::{params, OptionalExtension};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::io::Read;

/// Extracts dataset names from URL paths.
#[derive(Debug, Clone)]
pub struct DatasetUrlPattern {
    pattern: Regex,
    prefix: String,
}

impl DatasetUrlPattern {
    pub fn new(pattern: &str, prefix: &str) -> Result<Self> {
        let pattern = Regex::new(pattern)
            .map_err(|e| Error::Config(format!("invalid dataset url pattern: {}", e)))?;
        if pattern.captures_len() < 2 {
            return Err(Error::Config(
                "dataset url pattern needs a capture group for the dataset name".to_string(),
            ));
        }
        Ok(Self {
            pattern,
            prefix: prefix.to_string(),
        })
    }

    pub fn from_config(config: &CatalogConfig) -> Result<Self> {
        Self::new(&config.dataset_url_pattern, &config.dataset_url_prefix)
    }

    /// Dataset name embedded in `url`, ignoring any query string or fragment.
    pub fn dataset_name<'u>(&self, url: &'u str) -> Option<&'u str> {
        let path = url.split(['?', '#']).next().unwrap_or(url);
        self.pattern
            .captures(path)
            .and_then(|caps| caps.get(1))
            .map(|m| m.as_str())
    }

    /// Path prefix shared by every dataset URL (used in LIKE filters).
    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    /// Provider filter expression matching dataset page paths.
    pub fn provider_filter(&self) -> String {
        format!("ga:pagePath=~^{}", self.prefix)
    }
}

impl Default for DatasetUrlPattern {
    fn default() -> Self {
        let config = CatalogConfig::default();
        Self {
            pattern: Regex::new(&config.dataset_url_pattern).expect("default pattern is valid"),
            prefix: config.dataset_url_prefix,
        }
    }
}

/// Read interface onto the host catalog.
pub trait Catalog {
    /// Look up a dataset by its name.
    fn find_by_name(&self, name: &str) -> Result<Option<CatalogEntity>>;

    /// The URL pattern used to resolve page paths to dataset names.
    fn url_pattern(&self) -> &DatasetUrlPattern;

    /// Resolve a URL path to the dataset it belongs to.
    ///
    /// Returns `None` when the path is not a dataset URL or names a dataset
    /// the catalog does not know.
    fn find_by_url(&self, url: &str) -> Result<Option<CatalogEntity>> {
        match self.url_pattern().dataset_name(url) {
            Some(name) => self.find_by_name(name),
            None => Ok(None),
        }
    }
}

/// In-memory catalog.
#[derive(Debug, Default, Clone)]
pub struct StaticCatalog {
    entities: BTreeMap<String, CatalogEntity>,
    pattern: DatasetUrlPattern,
}

impl StaticCatalog {
    pub fn new(pattern: DatasetUrlPattern) -> Self {
        Self {
            entities: BTreeMap::new(),
            pattern,
        }
    }

    /// Add a dataset, using its name as the id.
    pub fn with_dataset(mut self, name: &str, title: &str) -> Self {
        self.insert(CatalogEntity {
            id: name.to_string(),
            name: name.to_string(),
            title: title.to_string(),
        });
        self
    }

    pub fn insert(&mut self, entity: CatalogEntity) {
        self.entities.insert(entity.name.clone(), entity);
    }
}

impl Catalog for StaticCatalog {
    fn find_by_name(&self, name: &str) -> Result<Option<CatalogEntity>> {
        Ok(self.entities.get(name).cloned())
    }

    fn url_pattern(&self) -> &DatasetUrlPattern {
        &self.pattern
    }
}

const UPSERT_PACKAGE: &str = r#"
    INSERT INTO catalog_packages (name, id, title)
    VALUES (?1, ?2, ?3)
    ON CONFLICT(name) DO UPDATE SET
        id = excluded.id,
        title = excluded.title
"#;

/// One row of a catalog export.
#[derive(Debug, Deserialize)]
struct CatalogRecord {
    name: String,
    title: String,
    #[serde(default)]
    id: Option<String>,
}

/// Catalog backed by the `catalog_packages` mirror table.
pub struct SqliteCatalog<'a> {
    store: &'a StatStore,
    pattern: DatasetUrlPattern,
}

impl<'a> SqliteCatalog<'a> {
    pub fn new(store: &'a StatStore, pattern: DatasetUrlPattern) -> Self {
        Self { store, pattern }
    }

    /// Insert or update a mirrored dataset record.
    pub fn upsert(&self, entity: &CatalogEntity) -> Result<()> {
        let conn = self.store.connection()?;
        conn.execute(UPSERT_PACKAGE, params![entity.name, entity.id, entity.title])?;
        Ok(())
    }

    /// Mirror a catalog export with columns `name,title[,id]`.
    ///
    /// A missing id defaults to the name. Rows with an empty name are
    /// skipped. Everything is written in one transaction.
    pub fn import_csv<R: Read>(&self, reader: R) -> Result<usize> {
        let mut records = csv::ReaderBuilder::new()
            .trim(csv::Trim::All)
            .flexible(true)
            .from_reader(reader);

        let mut conn = self.store.connection()?;
        let tx = conn.transaction()?;
        let mut imported = 0;
        for (line, record) in records.deserialize::<CatalogRecord>().enumerate() {
            let record = record?;
            if record.name.is_empty() {
                tracing::warn!(line = line + 2, "Skipping catalog row without a name");
                continue;
            }
            let id = record
                .id
                .filter(|id| !id.is_empty())
                .unwrap_or_else(|| record.name.clone());
            tx.execute(UPSERT_PACKAGE, params![record.name, id, record.title])?;
            imported += 1;
        }
        tx.commit()?;

        tracing::info!(imported, "Imported catalog export");
        Ok(imported)
    }

    pub fn count(&self) -> Result<i64> {
        let conn = self.store.connection()?;
        Ok(conn.query_row("SELECT COUNT(*) FROM catalog_packages", [], |r| r.get(0))?)
    }
}

impl Catalog for SqliteCatalog<'_> {
    fn find_by_name(&self, name: &str) -> Result<Option<CatalogEntity>> {
        let conn = self.store.connection()?;
        conn.query_row(
            "SELECT id, name, title FROM catalog_packages WHERE name = ?",
            [name],
            |row| {
                Ok(CatalogEntity {
                    id: row.get(0)?,
                    name: row.get(1)?,
                    title: row.get(2)?,
                })
            },
        )
        .optional()
        .map_err(Error::from)
    }

    fn url_pattern(&self) -> &DatasetUrlPattern {
        &self.pattern
    }
}
