//! Code-to-description reference catalog.
//!
//! Loaded once at startup from Parquet/CSV files through an in-memory DuckDB
//! connection, then shared read-only across requests. Diagnosis and procedure
//! codes live in separate namespaces.

use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};

use duckdb::Connection;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Namespace {
    Diagnosis,
    Procedure,
}

impl fmt::Display for Namespace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Namespace::Diagnosis => f.write_str("diagnosis"),
            Namespace::Procedure => f.write_str("procedure"),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum CatalogLoadError {
    #[error("{kind} source {} does not exist or is empty", .path.display())]
    Missing { kind: String, path: PathBuf },

    #[error("unsupported input extension for {}; use .csv or .parquet", .path.display())]
    UnsupportedFormat { path: PathBuf },

    #[error("failed reading {kind} source {}", .path.display())]
    Query {
        kind: String,
        path: PathBuf,
        #[source]
        source: duckdb::Error,
    },

    #[error("{kind} source {} yielded no usable rows", .path.display())]
    Empty { kind: String, path: PathBuf },
}

/// A file plus the columns holding the code and its description.
#[derive(Debug, Clone)]
pub struct CatalogSource {
    pub path: PathBuf,
    pub code_column: String,
    pub description_column: String,
}

#[derive(Debug, Clone)]
pub struct CatalogSources {
    pub diagnosis: CatalogSource,
    pub procedure: CatalogSource,
}

/// Result of a lookup. On a miss the raw code doubles as its description.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedCode {
    pub code: String,
    pub description: String,
    pub found: bool,
}

#[derive(Debug, Default)]
pub struct Catalog {
    diagnosis: HashMap<String, String>,
    procedure: HashMap<String, String>,
}

impl Catalog {
    pub fn from_entries<D, P, S1, S2, S3, S4>(diagnosis: D, procedure: P) -> Self
    where
        D: IntoIterator<Item = (S1, S2)>,
        P: IntoIterator<Item = (S3, S4)>,
        S1: AsRef<str>,
        S2: AsRef<str>,
        S3: AsRef<str>,
        S4: AsRef<str>,
    {
        Self {
            diagnosis: build_map(diagnosis),
            procedure: build_map(procedure),
        }
    }

    pub fn load(sources: &CatalogSources) -> Result<Self, CatalogLoadError> {
        let conn = Connection::open_in_memory().map_err(|source| CatalogLoadError::Query {
            kind: "catalog".to_string(),
            path: PathBuf::new(),
            source,
        })?;

        let diagnosis = read_pairs(&conn, &sources.diagnosis, Namespace::Diagnosis)?;
        let procedure = read_pairs(&conn, &sources.procedure, Namespace::Procedure)?;
        let catalog = Self::from_entries(diagnosis, procedure);

        for (ns, source) in [
            (Namespace::Diagnosis, &sources.diagnosis),
            (Namespace::Procedure, &sources.procedure),
        ] {
            if catalog.len(ns) == 0 {
                return Err(CatalogLoadError::Empty {
                    kind: ns.to_string(),
                    path: source.path.clone(),
                });
            }
        }
        Ok(catalog)
    }

    pub fn resolve(&self, code: &str, namespace: Namespace) -> ResolvedCode {
        let code = code.trim();
        match self.map(namespace).get(&normalize_code(code)) {
            Some(description) => ResolvedCode {
                code: code.to_string(),
                description: description.clone(),
                found: true,
            },
            None => {
                tracing::debug!(%namespace, code, "catalog miss; using raw code as description");
                ResolvedCode {
                    code: code.to_string(),
                    description: code.to_string(),
                    found: false,
                }
            }
        }
    }

    pub fn len(&self, namespace: Namespace) -> usize {
        self.map(namespace).len()
    }

    fn map(&self, namespace: Namespace) -> &HashMap<String, String> {
        match namespace {
            Namespace::Diagnosis => &self.diagnosis,
            Namespace::Procedure => &self.procedure,
        }
    }
}

pub(crate) fn normalize_code(code: &str) -> String {
    code.trim().to_ascii_uppercase()
}

fn build_map<I, S1, S2>(entries: I) -> HashMap<String, String>
where
    I: IntoIterator<Item = (S1, S2)>,
    S1: AsRef<str>,
    S2: AsRef<str>,
{
    let mut out = HashMap::new();
    for (code, description) in entries {
        let code = normalize_code(code.as_ref());
        let description = description.as_ref().trim();
        if code.is_empty() || description.is_empty() {
            continue;
        }
        // First description wins for duplicated codes.
        out.entry(code).or_insert_with(|| description.to_string());
    }
    out
}

fn read_pairs(
    conn: &Connection,
    source: &CatalogSource,
    namespace: Namespace,
) -> Result<Vec<(String, String)>, CatalogLoadError> {
    let query_err = |e: duckdb::Error| CatalogLoadError::Query {
        kind: namespace.to_string(),
        path: source.path.clone(),
        source: e,
    };

    let from = source_expr(&source.path, &namespace.to_string())?;
    let sql = format!(
        "
        SELECT
          TRIM(CAST({code} AS VARCHAR)) AS code,
          TRIM(CAST({desc} AS VARCHAR)) AS description
        FROM {from}
        WHERE {code} IS NOT NULL
        ",
        code = quote_ident(&source.code_column),
        desc = quote_ident(&source.description_column),
    );

    let mut stmt = conn.prepare(&sql).map_err(query_err)?;
    let rows = stmt
        .query_map([], |row| {
            Ok((row.get::<usize, String>(0)?, row.get::<usize, Option<String>>(1)?))
        })
        .map_err(query_err)?;

    let mut out = Vec::new();
    for r in rows {
        let (code, description) = r.map_err(query_err)?;
        if let Some(description) = description {
            out.push((code, description));
        }
    }
    tracing::info!(
        %namespace,
        rows = out.len(),
        path = %source.path.display(),
        "read catalog source"
    );
    Ok(out)
}

/// DuckDB table function reading `path` according to its extension.
pub(crate) fn source_expr(path: &Path, kind: &str) -> Result<String, CatalogLoadError> {
    if !crate::storage::file_present_nonempty(path) {
        return Err(CatalogLoadError::Missing {
            kind: kind.to_string(),
            path: path.to_path_buf(),
        });
    }
    let escaped = path.to_string_lossy().replace('\'', "''");
    let extension = path
        .extension()
        .and_then(|x| x.to_str())
        .unwrap_or("")
        .to_ascii_lowercase();
    match extension.as_str() {
        "parquet" => Ok(format!("read_parquet('{escaped}')")),
        "csv" => Ok(format!(
            "read_csv_auto('{escaped}', header=true, all_varchar=true)"
        )),
        _ => Err(CatalogLoadError::UnsupportedFormat {
            path: path.to_path_buf(),
        }),
    }
}

pub(crate) fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}
