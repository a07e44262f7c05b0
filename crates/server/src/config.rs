//! Server configuration.
//!
//! An ini-style file with a `[whaisd]` section for the process-wide knobs
//! and one `[db:<name>]` section per served database. Values below their
//! documented minimum clamp upward with a logged warning.

use std::path::{Path, PathBuf};

use configparser::ini::Ini;

pub const DEFAULT_LISTEN_PORT: u16 = 1761;
pub const DEFAULT_TABLE_BLOCK_SIZE: usize = 4098;
pub const DEFAULT_TABLE_BLOCK_COUNT: usize = 1024;
pub const DEFAULT_VL_BLOCK_SIZE: usize = 1024;
pub const DEFAULT_VL_BLOCK_COUNT: usize = 4098;
pub const DEFAULT_TEMP_CACHE: usize = 512;
pub const DEFAULT_MAX_FRAME: u32 = 65_536;
pub const DEFAULT_MAX_STACK: usize = 4096;

pub const MIN_TABLE_BLOCK_SIZE: usize = 1024;
pub const MIN_TABLE_BLOCK_COUNT: usize = 128;
pub const MIN_VL_BLOCK_SIZE: usize = 1024;
pub const MIN_VL_BLOCK_COUNT: usize = 128;
pub const MIN_TEMP_CACHE: usize = 128;
pub const MIN_MAX_FRAME: u32 = 512;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("cannot read configuration: {0}")]
    Unreadable(String),
    #[error("bad value for '{key}': {reason}")]
    BadValue { key: String, reason: String },
    #[error("no databases are configured")]
    NoDatabases,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DatabaseConfig {
    pub name: String,
    pub directory: PathBuf,
    pub object_files: Vec<PathBuf>,
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub listen_port: u16,
    pub table_block_size: usize,
    pub table_block_count: usize,
    pub vl_block_size: usize,
    pub vl_block_count: usize,
    pub temporals_cache: usize,
    pub max_frame_size: u32,
    pub max_stack_count: usize,
    pub working_directory: PathBuf,
    pub temp_directory: PathBuf,
    pub log_file: Option<PathBuf>,
    pub show_debug: bool,
    pub databases: Vec<DatabaseConfig>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_port: DEFAULT_LISTEN_PORT,
            table_block_size: DEFAULT_TABLE_BLOCK_SIZE,
            table_block_count: DEFAULT_TABLE_BLOCK_COUNT,
            vl_block_size: DEFAULT_VL_BLOCK_SIZE,
            vl_block_count: DEFAULT_VL_BLOCK_COUNT,
            temporals_cache: DEFAULT_TEMP_CACHE,
            max_frame_size: DEFAULT_MAX_FRAME,
            max_stack_count: DEFAULT_MAX_STACK,
            working_directory: PathBuf::from("."),
            temp_directory: std::env::temp_dir(),
            log_file: None,
            show_debug: false,
            databases: Vec::new(),
        }
    }
}

fn clamped(key: &str, value: usize, min: usize) -> usize {
    if value < min {
        log::warn!("configuration '{key}' below minimum, clamped to {min}");
        min
    } else {
        value
    }
}

impl ServerConfig {
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let mut ini = Ini::new();
        let content = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::Unreadable(format!("{}: {e}", path.display())))?;
        ini.read(content).map_err(ConfigError::Unreadable)?;
        Self::from_ini(&ini)
    }

    fn from_ini(ini: &Ini) -> Result<Self, ConfigError> {
        let mut config = Self::default();
        let section = "whaisd";

        let number = |key: &str| -> Result<Option<usize>, ConfigError> {
            match ini.get(section, key) {
                None => Ok(None),
                Some(raw) => raw
                    .parse::<usize>()
                    .map(Some)
                    .map_err(|e| ConfigError::BadValue {
                        key: key.to_string(),
                        reason: e.to_string(),
                    }),
            }
        };

        if let Some(port) = number("port")? {
            config.listen_port =
                u16::try_from(port).map_err(|_| ConfigError::BadValue {
                    key: "port".into(),
                    reason: "outside the TCP port range".into(),
                })?;
            if config.listen_port == 0 {
                return Err(ConfigError::BadValue {
                    key: "port".into(),
                    reason: "port 0 is not listenable".into(),
                });
            }
        }
        if let Some(v) = number("table_block_size")? {
            config.table_block_size = clamped("table_block_size", v, MIN_TABLE_BLOCK_SIZE);
        }
        if let Some(v) = number("table_block_count")? {
            config.table_block_count = clamped("table_block_count", v, MIN_TABLE_BLOCK_COUNT);
        }
        if let Some(v) = number("vl_block_size")? {
            config.vl_block_size = clamped("vl_block_size", v, MIN_VL_BLOCK_SIZE);
        }
        if let Some(v) = number("vl_block_count")? {
            config.vl_block_count = clamped("vl_block_count", v, MIN_VL_BLOCK_COUNT);
        }
        if let Some(v) = number("temporals_cache")? {
            config.temporals_cache = clamped("temporals_cache", v, MIN_TEMP_CACHE);
        }
        if let Some(v) = number("max_frame_size")? {
            config.max_frame_size =
                clamped("max_frame_size", v, MIN_MAX_FRAME as usize) as u32;
        }
        if let Some(v) = number("max_stack_count")? {
            config.max_stack_count = v;
        }
        if let Some(dir) = ini.get(section, "working_directory") {
            config.working_directory = PathBuf::from(dir);
        }
        if let Some(dir) = ini.get(section, "temp_directory") {
            config.temp_directory = PathBuf::from(dir);
        }
        if let Some(file) = ini.get(section, "log_file") {
            config.log_file = Some(PathBuf::from(file));
        }
        if let Some(value) = ini.getboolcoerce(section, "show_debug").ok().flatten() {
            config.show_debug = value;
        }

        for full_name in ini.sections() {
            let Some(db_name) = full_name.strip_prefix("db:") else {
                continue;
            };
            let directory = ini
                .get(&full_name, "directory")
                .map(PathBuf::from)
                .unwrap_or_else(|| config.working_directory.join(db_name));
            let object_files = ini
                .get(&full_name, "object_files")
                .map(|raw| {
                    raw.split(',')
                        .map(str::trim)
                        .filter(|p| !p.is_empty())
                        .map(PathBuf::from)
                        .collect()
                })
                .unwrap_or_default();
            config.databases.push(DatabaseConfig {
                name: db_name.to_string(),
                directory,
                object_files,
            });
        }
        config.databases.sort_by(|a, b| a.name.cmp(&b.name));

        Ok(config)
    }

    pub fn storage(&self) -> whais_dbs::StorageConfig {
        whais_dbs::StorageConfig {
            table_block_size: self.table_block_size,
            table_block_count: self.table_block_count,
            vl_block_size: self.vl_block_size,
            vl_block_count: self.vl_block_count,
            ..whais_dbs::StorageConfig::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::io::Write;

    fn parse(content: &str) -> Result<ServerConfig, ConfigError> {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(content.as_bytes()).unwrap();
        ServerConfig::from_file(file.path())
    }

    #[test]
    fn defaults_apply_when_keys_are_absent() {
        let config = parse("[whaisd]\n").unwrap();
        assert_eq!(config.listen_port, DEFAULT_LISTEN_PORT);
        assert_eq!(config.table_block_size, DEFAULT_TABLE_BLOCK_SIZE);
        assert_eq!(config.vl_block_count, DEFAULT_VL_BLOCK_COUNT);
        assert_eq!(config.temporals_cache, DEFAULT_TEMP_CACHE);
        assert!(config.databases.is_empty());
    }

    #[test]
    fn minimums_clamp_low_values() {
        let config = parse(
            "[whaisd]\n\
             table_block_size = 10\n\
             table_block_count = 5\n\
             vl_block_size = 100\n\
             vl_block_count = 1\n\
             temporals_cache = 2\n",
        )
        .unwrap();
        assert_eq!(config.table_block_size, MIN_TABLE_BLOCK_SIZE);
        assert_eq!(config.table_block_count, MIN_TABLE_BLOCK_COUNT);
        assert_eq!(config.vl_block_size, MIN_VL_BLOCK_SIZE);
        assert_eq!(config.vl_block_count, MIN_VL_BLOCK_COUNT);
        assert_eq!(config.temporals_cache, MIN_TEMP_CACHE);
    }

    #[test]
    fn databases_come_from_their_sections() {
        let config = parse(
            "[whaisd]\n\
             port = 1900\n\
             working_directory = /srv/whais\n\
             [db:orders]\n\
             object_files = orders.wo, reports.wo\n\
             [db:inventory]\n\
             directory = /mnt/fast/inventory\n",
        )
        .unwrap();
        assert_eq!(config.listen_port, 1900);
        assert_eq!(config.databases.len(), 2);
        assert_eq!(config.databases[0].name, "inventory");
        assert_eq!(
            config.databases[0].directory,
            PathBuf::from("/mnt/fast/inventory")
        );
        assert_eq!(config.databases[1].name, "orders");
        assert_eq!(
            config.databases[1].directory,
            PathBuf::from("/srv/whais/orders")
        );
        assert_eq!(config.databases[1].object_files.len(), 2);
    }

    #[test]
    fn bad_port_is_an_error() {
        assert!(matches!(
            parse("[whaisd]\nport = 99999\n"),
            Err(ConfigError::BadValue { .. })
        ));
        assert!(matches!(
            parse("[whaisd]\nport = oops\n"),
            Err(ConfigError::BadValue { .. })
        ));
    }
}
