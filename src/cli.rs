use std::time::Duration;

use clap::{Parser, Subcommand};

use crate::catalog::{CatalogSource, CatalogSources};
use crate::generation::RetryPolicy;
use crate::storage::SourceFiles;

const DEFAULT_DATA_DIR: &str = concat!(env!("CARGO_MANIFEST_DIR"), "/data");

/// One day; also caps backoff delays (in milliseconds).
const MAX_DURATION_SECS: u64 = 86_400;

#[derive(Parser, Debug)]
#[command(name = "record-generator")]
#[command(
    about = "Synthetic clinical note generator (code catalogs + LLM completions)",
    long_about = None
)]
pub struct Args {
    #[command(subcommand)]
    pub cmd: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Download catalog and seed record inputs (if missing) into the data directory.
    Fetch(FetchArgs),
    /// Load catalogs and serve the HTTP API.
    Serve(ServeArgs),
}

#[derive(clap::Args, Debug, Clone)]
pub struct FetchArgs {
    /// Backend data directory (downloaded catalogs and seed records).
    #[arg(long, env = "DATA_DIR", default_value = DEFAULT_DATA_DIR)]
    pub data_dir: String,

    /// Hugging Face hub endpoint.
    #[arg(long, env = "HF_ENDPOINT", default_value = "https://huggingface.co")]
    pub hf_endpoint: String,

    /// Hugging Face access token, sent as a bearer credential on downloads.
    #[arg(long, env = "HF_TOKEN", hide_env_values = true)]
    pub hf_token: Option<String>,

    /// Hugging Face revision (branch/tag/commit) used for every source.
    #[arg(long, default_value = "main")]
    pub hf_revision: String,

    /// Do not download missing inputs; error instead.
    #[arg(long)]
    pub offline: bool,

    /// Re-download inputs even if they already exist.
    #[arg(long)]
    pub force_download: bool,

    /// Dataset repo holding the diagnosis (ICD-10-CM) catalog.
    #[arg(long, default_value = "jilp00/enriched-icdcm-data")]
    pub icd_repo: String,

    /// Path of the diagnosis catalog file inside its repo (.parquet or .csv).
    #[arg(long, default_value = "data/train-00000-of-00001.parquet")]
    pub icd_path: String,

    /// Use an existing local diagnosis catalog file instead of downloading.
    #[arg(long, env = "ICD_CATALOG_FILE")]
    pub icd_file: Option<String>,

    #[arg(long, default_value = "codes")]
    pub icd_code_column: String,

    #[arg(long, default_value = "code_details")]
    pub icd_description_column: String,

    /// Dataset repo holding the procedure (CPT/HCPCS) catalog.
    #[arg(long, default_value = "mkieffer/Medicaid-Provider-Spending")]
    pub cpt_repo: String,

    /// Path of the procedure catalog file inside its repo (.parquet or .csv).
    #[arg(long, default_value = "data/hcpcs_code_mapping.csv")]
    pub cpt_path: String,

    /// Use an existing local procedure catalog file instead of downloading.
    #[arg(long, env = "CPT_CATALOG_FILE")]
    pub cpt_file: Option<String>,

    #[arg(long, default_value = "hcpcs_code")]
    pub cpt_code_column: String,

    #[arg(long, default_value = "long_desc")]
    pub cpt_description_column: String,

    /// Dataset repo holding seed clinical notes used as few-shot examples.
    #[arg(long, default_value = "jilp00/enhanced-medical-records")]
    pub seed_repo: String,

    #[arg(long, default_value = "data/train-00000-of-00001.parquet")]
    pub seed_path: String,

    /// Use an existing local seed records file instead of downloading.
    #[arg(long, env = "SEED_RECORDS_FILE")]
    pub seed_file: Option<String>,

    /// Skip seed records entirely (prompts carry no examples).
    #[arg(long)]
    pub no_seed_records: bool,
}

#[derive(clap::Args, Debug, Clone)]
pub struct ServeArgs {
    #[command(flatten)]
    pub fetch: FetchArgs,

    #[arg(long, default_value = "0.0.0.0")]
    pub host: String,

    #[arg(long, default_value_t = 8000)]
    pub port: u16,

    /// Credential for the completion service.
    #[arg(long, env = "OPENAI_API_KEY", hide_env_values = true)]
    pub openai_api_key: String,

    #[arg(long, env = "OPENAI_BASE_URL", default_value = "https://api.openai.com/v1")]
    pub openai_base_url: String,

    /// Model used when a request does not name one.
    #[arg(long, env = "DEFAULT_MODEL", default_value = "gpt-3.5-turbo-1106")]
    pub default_model: String,

    /// Model tried with a fresh retry budget once the requested model is unavailable.
    #[arg(long, env = "FALLBACK_MODEL")]
    pub fallback_model: Option<String>,

    /// Max attempts per model for transient completion failures.
    #[arg(long, default_value_t = 6)]
    pub max_attempts: u32,

    #[arg(
        long,
        default_value_t = 1000,
        value_parser = clap::value_parser!(u64).range(0..=MAX_DURATION_SECS * 1000)
    )]
    pub base_delay_ms: u64,

    #[arg(long, default_value_t = 2.0)]
    pub backoff_multiplier: f64,

    #[arg(
        long,
        default_value_t = 60_000,
        value_parser = clap::value_parser!(u64).range(0..=MAX_DURATION_SECS * 1000)
    )]
    pub max_delay_ms: u64,

    /// Disable random jitter on backoff delays.
    #[arg(long)]
    pub no_jitter: bool,

    /// Timeout for a single completion attempt.
    #[arg(
        long,
        default_value_t = 120,
        value_parser = clap::value_parser!(u64).range(1..=MAX_DURATION_SECS)
    )]
    pub attempt_timeout_secs: u64,

    /// Allowed CORS origin (repeatable). Use "*" to allow any origin.
    #[arg(
        long = "allowed-origin",
        env = "ALLOWED_ORIGINS",
        value_delimiter = ',',
        default_value = "http://localhost:3000"
    )]
    pub allowed_origins: Vec<String>,
}

impl FetchArgs {
    /// Pairs the resolved input files with their configured column names.
    pub fn catalog_sources(&self, files: &SourceFiles) -> CatalogSources {
        CatalogSources {
            diagnosis: CatalogSource {
                path: files.diagnosis.clone(),
                code_column: self.icd_code_column.clone(),
                description_column: self.icd_description_column.clone(),
            },
            procedure: CatalogSource {
                path: files.procedure.clone(),
                code_column: self.cpt_code_column.clone(),
                description_column: self.cpt_description_column.clone(),
            },
        }
    }
}

impl ServeArgs {
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.max_attempts.max(1),
            base_delay: Duration::from_millis(self.base_delay_ms),
            multiplier: self.backoff_multiplier.max(1.0),
            max_delay: Duration::from_millis(self.max_delay_ms),
            jitter: !self.no_jitter,
            attempt_timeout: Duration::from_secs(
                self.attempt_timeout_secs.clamp(1, MAX_DURATION_SECS),
            ),
        }
    }
}
