use std::path::{Path, PathBuf};

#[derive(Debug, Clone)]
pub struct StoragePaths {
    pub source_dir: PathBuf,
}

#[derive(Debug, Clone)]
pub struct SourceFiles {
    pub diagnosis: PathBuf,
    pub procedure: PathBuf,
    pub seed_records: Option<PathBuf>,
}

impl StoragePaths {
    pub fn new(data_dir: impl Into<PathBuf>) -> Self {
        let data_dir: PathBuf = data_dir.into();
        let source_dir = data_dir.join("source");
        Self { source_dir }
    }

    /// Local destination for a downloaded source. The extension of the file in the
    /// remote repo is kept so DuckDB can pick the right reader.
    pub fn source_file(&self, stem: &str, path_in_repo: &str) -> PathBuf {
        let ext = Path::new(path_in_repo)
            .extension()
            .and_then(|x| x.to_str())
            .map(str::to_ascii_lowercase)
            .unwrap_or_else(|| "parquet".to_string());
        self.source_dir.join(format!("{stem}.{ext}"))
    }

    pub fn ensure_dirs(&self) -> std::io::Result<()> {
        std::fs::create_dir_all(&self.source_dir)?;
        Ok(())
    }
}

pub fn file_present_nonempty(path: &Path) -> bool {
    match std::fs::metadata(path) {
        Ok(m) => m.is_file() && m.len() > 0,
        Err(_) => false,
    }
}
