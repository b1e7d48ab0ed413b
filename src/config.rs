//! # Database Configuration
//!
//! Build-time knobs for a [`crate::Db`] instance. The defaults mirror a
//! production deployment; tests shrink the catalog and initial extent sizes
//! to keep scratch directories small.

use std::path::{Path, PathBuf};

/// Largest extent the growth policy will produce.
pub const MAX_EXTENT_SIZE: usize = 0x7ff000;

#[derive(Debug, Clone)]
pub struct Config {
    /// Root data directory (`--dbpath` in the original deployment).
    pub db_path: PathBuf,
    /// When set, each database lives in its own subdirectory of `db_path`.
    pub directory_per_db: bool,
    /// Size of the `.ns` catalog file in mebibytes.
    pub ns_size_mb: usize,
    /// Size of the first extent allocated for a new collection, before the
    /// growth policy takes over.
    pub initial_extent_size: usize,
    /// Initial size of a newly created data file.
    pub data_file_size: usize,
}

impl Config {
    pub fn new(db_path: impl Into<PathBuf>) -> Self {
        Self {
            db_path: db_path.into(),
            directory_per_db: false,
            ns_size_mb: 16,
            initial_extent_size: 0x2000,
            data_file_size: 16 * 1024 * 1024,
        }
    }

    pub fn builder(db_path: impl Into<PathBuf>) -> ConfigBuilder {
        ConfigBuilder {
            config: Self::new(db_path),
        }
    }

    pub fn db_path(&self) -> &Path {
        &self.db_path
    }
}

#[derive(Debug)]
pub struct ConfigBuilder {
    config: Config,
}

impl ConfigBuilder {
    pub fn directory_per_db(mut self, yes: bool) -> Self {
        self.config.directory_per_db = yes;
        self
    }

    pub fn ns_size_mb(mut self, mb: usize) -> Self {
        self.config.ns_size_mb = mb;
        self
    }

    pub fn initial_extent_size(mut self, bytes: usize) -> Self {
        self.config.initial_extent_size = bytes;
        self
    }

    pub fn data_file_size(mut self, bytes: usize) -> Self {
        self.config.data_file_size = bytes;
        self
    }

    pub fn build(self) -> Config {
        self.config
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_production_sized() {
        let config = Config::new("/data/db");
        assert_eq!(config.ns_size_mb, 16);
        assert!(!config.directory_per_db);
        assert_eq!(config.db_path(), Path::new("/data/db"));
    }

    #[test]
    fn builder_overrides_stick() {
        let config = Config::builder("/tmp/x")
            .directory_per_db(true)
            .ns_size_mb(1)
            .initial_extent_size(4096)
            .build();
        assert!(config.directory_per_db);
        assert_eq!(config.ns_size_mb, 1);
        assert_eq!(config.initial_extent_size, 4096);
    }
}
