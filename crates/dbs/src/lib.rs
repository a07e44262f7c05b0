//! WHAIS storage engine.
//!
//! A database is a directory of table files plus a catalog listing the
//! persistent tables. Temporary tables live in a separate scratch
//! directory and disappear with their handles.

pub mod btree;
pub mod cache;
pub mod errors;
pub mod store;
pub mod table;

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use ahash::AHashMap;
use itertools::Itertools;
use whais_core::types::FieldSpec;

pub use errors::{DbsError, Result};
pub use table::{StorageConfig, Table};

const CATALOG_FILE: &str = "tables.cat";

fn valid_name(name: &str) -> bool {
    !name.is_empty()
        && !name.starts_with(|c: char| c.is_ascii_digit())
        && name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_')
}

/// Handle over one database directory. Shared across sessions; tables are
/// handed out as shared references and can only be deleted when no
/// reference besides the catalog's own remains.
pub struct DbsHandle {
    name: String,
    dir: PathBuf,
    temp_dir: PathBuf,
    cfg: StorageConfig,
    tables: Mutex<AHashMap<String, Arc<Table>>>,
    temp_serial: Mutex<u64>,
}

impl DbsHandle {
    pub fn open(name: &str, dir: &Path, temp_dir: &Path, cfg: StorageConfig) -> Result<Self> {
        if !valid_name(name) {
            return Err(DbsError::InvalidParameters("invalid database name"));
        }
        std::fs::create_dir_all(dir)?;
        std::fs::create_dir_all(temp_dir)?;

        // Scratch files from a previous run are garbage by definition.
        for entry in walkdir::WalkDir::new(temp_dir)
            .min_depth(1)
            .max_depth(1)
            .into_iter()
            .flatten()
        {
            if entry.file_type().is_file() {
                let _ = std::fs::remove_file(entry.path());
            }
        }

        Ok(Self {
            name: name.to_string(),
            dir: dir.to_path_buf(),
            temp_dir: temp_dir.to_path_buf(),
            cfg,
            tables: Mutex::new(AHashMap::new()),
            temp_serial: Mutex::new(0),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    fn catalog_path(&self) -> PathBuf {
        self.dir.join(CATALOG_FILE)
    }

    fn read_catalog(&self) -> Result<Vec<String>> {
        match std::fs::read_to_string(self.catalog_path()) {
            Ok(content) => Ok(content
                .lines()
                .map(str::trim)
                .filter(|l| !l.is_empty())
                .map(String::from)
                .collect()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Vec::new()),
            Err(e) => Err(e.into()),
        }
    }

    fn write_catalog(&self, names: &[String]) -> Result<()> {
        let mut content = names.join("\n");
        content.push('\n');
        std::fs::write(self.catalog_path(), content)?;
        Ok(())
    }

    /// Names of the persistent tables, sorted.
    pub fn table_names(&self) -> Result<Vec<String>> {
        Ok(self.read_catalog()?.into_iter().sorted().collect())
    }

    pub fn has_table(&self, name: &str) -> Result<bool> {
        Ok(self.read_catalog()?.iter().any(|n| n == name))
    }

    /// Create a persistent table and register it in the catalog.
    pub fn add_table(&self, name: &str, fields: Vec<FieldSpec>) -> Result<Arc<Table>> {
        if !valid_name(name) {
            return Err(DbsError::InvalidParameters("invalid table name"));
        }
        let mut catalog = self.read_catalog()?;
        if catalog.iter().any(|n| n == name) {
            return Err(DbsError::TableExists(name.to_string()));
        }
        let table = Arc::new(Table::create(&self.dir, name, fields, self.cfg, true)?);
        catalog.push(name.to_string());
        self.write_catalog(&catalog)?;
        self.tables
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(name.to_string(), Arc::clone(&table));
        log::info!("database '{}': created table '{name}'", self.name);
        Ok(table)
    }

    /// Fetch a shared reference to a persistent table, opening it on first
    /// use.
    pub fn retrieve_table(&self, name: &str) -> Result<Arc<Table>> {
        let mut tables = self.tables.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(table) = tables.get(name) {
            return Ok(Arc::clone(table));
        }
        if !self.read_catalog()?.iter().any(|n| n == name) {
            return Err(DbsError::TableNotFound(name.to_string()));
        }
        let table = Arc::new(Table::open(&self.dir, name, self.cfg)?);
        tables.insert(name.to_string(), Arc::clone(&table));
        Ok(table)
    }

    /// Drop a persistent table. Fails while any reference outside the
    /// catalog's registry is still alive.
    pub fn delete_table(&self, name: &str) -> Result<()> {
        let mut tables = self.tables.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(table) = tables.get(name) {
            if Arc::strong_count(table) > 1 {
                return Err(DbsError::TableInUse(name.to_string()));
            }
            tables.remove(name);
        }
        let mut catalog = self.read_catalog()?;
        let before = catalog.len();
        catalog.retain(|n| n != name);
        if catalog.len() == before {
            return Err(DbsError::TableNotFound(name.to_string()));
        }
        self.write_catalog(&catalog)?;

        for suffix in ["wt", "wv", "wv.map"] {
            let _ = std::fs::remove_file(self.dir.join(format!("{name}.{suffix}")));
        }
        for entry in walkdir::WalkDir::new(&self.dir)
            .min_depth(1)
            .max_depth(1)
            .into_iter()
            .flatten()
        {
            let file_name = entry.file_name().to_string_lossy().into_owned();
            if file_name.starts_with(&format!("{name}.wi")) {
                let _ = std::fs::remove_file(entry.path());
            }
        }
        log::info!("database '{}': deleted table '{name}'", self.name);
        Ok(())
    }

    /// Create a session-scoped table in the scratch directory.
    pub fn create_temp_table(&self, fields: Vec<FieldSpec>) -> Result<Arc<Table>> {
        let serial = {
            let mut serial = self.temp_serial.lock().unwrap_or_else(|e| e.into_inner());
            *serial += 1;
            *serial
        };
        let name = format!("temp_{}_{serial}", std::process::id());
        Ok(Arc::new(Table::create(
            &self.temp_dir,
            &name,
            fields,
            self.cfg,
            false,
        )?))
    }

    /// Flush every open table.
    pub fn sync(&self) -> Result<()> {
        let tables = self.tables.lock().unwrap_or_else(|e| e.into_inner());
        for table in tables.values() {
            table.sync()?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use whais_core::types::TypeId;
    use whais_core::value::{Scalar, Value};

    fn open_handle(dir: &tempfile::TempDir) -> DbsHandle {
        DbsHandle::open(
            "testdb",
            &dir.path().join("data"),
            &dir.path().join("tmp"),
            StorageConfig::default(),
        )
        .unwrap()
    }

    fn int_field() -> Vec<FieldSpec> {
        vec![FieldSpec::new("v", TypeId::Int64, false)]
    }

    #[test]
    fn catalog_tracks_tables() {
        let dir = tempfile::tempdir().unwrap();
        let dbs = open_handle(&dir);
        dbs.add_table("alpha", int_field()).unwrap();
        dbs.add_table("beta", int_field()).unwrap();
        assert_eq!(dbs.table_names().unwrap(), vec!["alpha", "beta"]);
        assert!(matches!(
            dbs.add_table("alpha", int_field()),
            Err(DbsError::TableExists(_))
        ));
    }

    #[test]
    fn delete_requires_no_live_references() {
        let dir = tempfile::tempdir().unwrap();
        let dbs = open_handle(&dir);
        dbs.add_table("alpha", int_field()).unwrap();
        let held = dbs.retrieve_table("alpha").unwrap();
        assert!(matches!(
            dbs.delete_table("alpha"),
            Err(DbsError::TableInUse(_))
        ));
        drop(held);
        dbs.delete_table("alpha").unwrap();
        assert!(matches!(
            dbs.retrieve_table("alpha"),
            Err(DbsError::TableNotFound(_))
        ));
    }

    #[test]
    fn tables_reload_from_catalog() {
        let dir = tempfile::tempdir().unwrap();
        {
            let dbs = open_handle(&dir);
            let table = dbs.add_table("alpha", int_field()).unwrap();
            let row = table.add_row().unwrap();
            table
                .set(row, 0, &Value::Scalar(Scalar::Int64(Some(-9))))
                .unwrap();
            dbs.sync().unwrap();
        }
        let dbs = open_handle(&dir);
        let table = dbs.retrieve_table("alpha").unwrap();
        assert_eq!(
            table.get(0, 0).unwrap(),
            Value::Scalar(Scalar::Int64(Some(-9)))
        );
    }

    #[test]
    fn temp_tables_do_not_touch_the_catalog() {
        let dir = tempfile::tempdir().unwrap();
        let dbs = open_handle(&dir);
        let temp = dbs.create_temp_table(int_field()).unwrap();
        temp.add_row().unwrap();
        assert!(dbs.table_names().unwrap().is_empty());
        assert!(!temp.is_persistent());
    }
}
