use std::path::{Path, PathBuf};

#[derive(Debug, Clone)]
pub struct StoragePaths {
    pub source_dir: PathBuf,
    pub duckdb_path: PathBuf,
    pub meta_path: PathBuf,
}

impl StoragePaths {
    pub fn new(data_dir: impl Into<PathBuf>) -> Self {
        let data_dir: PathBuf = data_dir.into();
        Self {
            source_dir: data_dir.join("source"),
            duckdb_path: data_dir.join("dashboard.duckdb"),
            meta_path: data_dir.join("meta.json"),
        }
    }

    /// Where a downloaded extract named `file_name` is kept.
    pub fn source_file(&self, file_name: &str) -> PathBuf {
        self.source_dir.join(file_name)
    }

    pub fn ensure_dirs(&self) -> std::io::Result<()> {
        std::fs::create_dir_all(&self.source_dir)?;
        if let Some(parent) = self.duckdb_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        Ok(())
    }
}

pub fn file_present_nonempty(path: &Path) -> bool {
    match std::fs::metadata(path) {
        Ok(m) => m.is_file() && m.len() > 0,
        Err(_) => false,
    }
}
