//! Seed clinical notes used as few-shot examples in the prompt.

use std::collections::HashSet;
use std::path::Path;

use duckdb::Connection;
use rand::Rng;
use rand::seq::SliceRandom;

use crate::catalog::{CatalogLoadError, normalize_code, source_expr};

pub const EXAMPLES_PER_PROMPT: usize = 2;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SeedExample {
    /// Codes attached to the note, as stored in the seed dataset.
    pub codes: String,
    pub synonyms: String,
    pub note: String,
    pub cpt_codes: Vec<String>,
}

#[derive(Debug, Default)]
pub struct ExampleBank {
    examples: Vec<SeedExample>,
}

impl ExampleBank {
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn from_examples(examples: Vec<SeedExample>) -> Self {
        Self { examples }
    }

    /// Reads `text`, `all_codes`, `approx_synonyms` and `cpt` columns. Rows without a
    /// note are skipped.
    pub fn load(path: &Path) -> Result<Self, CatalogLoadError> {
        let query_err = |e: duckdb::Error| CatalogLoadError::Query {
            kind: "seed records".to_string(),
            path: path.to_path_buf(),
            source: e,
        };

        let from = source_expr(path, "seed records")?;
        let conn = Connection::open_in_memory().map_err(query_err)?;
        let sql = format!(
            r#"
            SELECT
              CAST("text" AS VARCHAR),
              COALESCE(CAST("all_codes" AS VARCHAR), ''),
              COALESCE(CAST("approx_synonyms" AS VARCHAR), ''),
              COALESCE(CAST("cpt" AS VARCHAR), '')
            FROM {from}
            WHERE "text" IS NOT NULL AND TRIM(CAST("text" AS VARCHAR)) <> ''
            "#
        );

        let mut stmt = conn.prepare(&sql).map_err(query_err)?;
        let rows = stmt
            .query_map([], |row| {
                let cpt: String = row.get(3)?;
                Ok(SeedExample {
                    note: row.get(0)?,
                    codes: row.get(1)?,
                    synonyms: row.get(2)?,
                    cpt_codes: split_codes(&cpt),
                })
            })
            .map_err(query_err)?;

        let mut examples = Vec::new();
        for r in rows {
            examples.push(r.map_err(query_err)?);
        }
        if examples.is_empty() {
            return Err(CatalogLoadError::Empty {
                kind: "seed records".to_string(),
                path: path.to_path_buf(),
            });
        }
        tracing::info!(rows = examples.len(), path = %path.display(), "read seed records");
        Ok(Self { examples })
    }

    pub fn len(&self) -> usize {
        self.examples.len()
    }

    /// Picks up to [`EXAMPLES_PER_PROMPT`] distinct examples. Notes sharing a procedure
    /// code with the request come first; the rest is topped up at random. Codes compare
    /// the same way catalog lookups do.
    pub fn select<R: Rng + ?Sized>(
        &self,
        procedure_codes: &[String],
        rng: &mut R,
    ) -> Vec<&SeedExample> {
        let wanted: HashSet<String> = procedure_codes
            .iter()
            .map(|c| normalize_code(c))
            .collect();
        let matching: Vec<usize> = self
            .examples
            .iter()
            .enumerate()
            .filter(|(_, ex)| ex.cpt_codes.iter().any(|c| wanted.contains(c)))
            .map(|(i, _)| i)
            .collect();

        let mut picked: Vec<usize> = matching
            .choose_multiple(rng, EXAMPLES_PER_PROMPT)
            .copied()
            .collect();

        if picked.len() < EXAMPLES_PER_PROMPT {
            if picked.is_empty() && !self.examples.is_empty() {
                tracing::debug!(
                    codes = ?procedure_codes,
                    "no seed records share the requested procedure codes; using random examples"
                );
            }
            let rest: Vec<usize> = (0..self.examples.len())
                .filter(|i| !picked.contains(i))
                .collect();
            picked.extend(
                rest.choose_multiple(rng, EXAMPLES_PER_PROMPT - picked.len())
                    .copied(),
            );
        }

        picked.into_iter().map(|i| &self.examples[i]).collect()
    }
}

fn split_codes(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(normalize_code)
        .filter(|c| !c.is_empty())
        .collect()
}
