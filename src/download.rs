use std::path::{Path, PathBuf};

use anyhow::{Context, anyhow};
use futures_util::StreamExt;
use reqwest::header::AUTHORIZATION;
use tokio::io::AsyncWriteExt;

use crate::catalog::{Catalog, Namespace};
use crate::cli::FetchArgs;
use crate::seeds::ExampleBank;
use crate::storage::{SourceFiles, StoragePaths, file_present_nonempty};

/// One dataset file on the Hugging Face hub.
#[derive(Debug, Clone)]
struct HubFile<'a> {
    repo: &'a str,
    path_in_repo: &'a str,
}

pub async fn run(opts: FetchArgs) -> anyhow::Result<()> {
    let paths = StoragePaths::new(&opts.data_dir);
    let files = ensure_inputs(&paths, &opts).await?;

    // Parse once so a wrong column name fails here rather than at serve time.
    let catalog = Catalog::load(&opts.catalog_sources(&files)).context("load reference catalogs")?;
    let seed_examples = match &files.seed_records {
        Some(path) => ExampleBank::load(path).context("load seed records")?.len(),
        None => 0,
    };

    tracing::info!(
        diagnosis = %files.diagnosis.display(),
        diagnosis_codes = catalog.len(Namespace::Diagnosis),
        procedure = %files.procedure.display(),
        procedure_codes = catalog.len(Namespace::Procedure),
        seed_examples,
        "Inputs ready"
    );
    Ok(())
}

pub async fn ensure_inputs(paths: &StoragePaths, opts: &FetchArgs) -> anyhow::Result<SourceFiles> {
    tracing::info!("Ensuring catalog inputs (hub downloads with local reuse when available)...");
    paths.ensure_dirs().context("create data directories")?;

    let client = reqwest::Client::builder()
        .user_agent("record-generator/0.1")
        .build()
        .context("build HTTP client")?;

    let diagnosis = ensure_source(
        &client,
        paths,
        opts,
        "diagnosis",
        opts.icd_file.as_deref(),
        HubFile {
            repo: &opts.icd_repo,
            path_in_repo: &opts.icd_path,
        },
    )
    .await
    .context("diagnosis catalog")?;

    let procedure = ensure_source(
        &client,
        paths,
        opts,
        "procedure",
        opts.cpt_file.as_deref(),
        HubFile {
            repo: &opts.cpt_repo,
            path_in_repo: &opts.cpt_path,
        },
    )
    .await
    .context("procedure catalog")?;

    let seed_records = if opts.no_seed_records {
        tracing::info!("Seed records disabled; prompts will carry no examples");
        None
    } else {
        let path = ensure_source(
            &client,
            paths,
            opts,
            "seed_records",
            opts.seed_file.as_deref(),
            HubFile {
                repo: &opts.seed_repo,
                path_in_repo: &opts.seed_path,
            },
        )
        .await
        .context("seed records")?;
        Some(path)
    };

    Ok(SourceFiles {
        diagnosis,
        procedure,
        seed_records,
    })
}

async fn ensure_source(
    client: &reqwest::Client,
    paths: &StoragePaths,
    opts: &FetchArgs,
    stem: &str,
    local_override: Option<&str>,
    hub: HubFile<'_>,
) -> anyhow::Result<PathBuf> {
    if let Some(p) = local_override {
        let p = PathBuf::from(p);
        if !file_present_nonempty(&p) {
            return Err(anyhow!("Local {stem} file {} is missing or empty", p.display()));
        }
        return Ok(p);
    }

    let dest = paths.source_file(stem, hub.path_in_repo);
    if !opts.force_download && file_present_nonempty(&dest) {
        return Ok(dest);
    }

    let url = hf_resolve_url(&opts.hf_endpoint, hub.repo, &opts.hf_revision, hub.path_in_repo);
    if opts.offline {
        return Err(anyhow!(
            "Missing required input at {} (run without --offline to auto-download from {}).",
            dest.display(),
            url
        ));
    }

    ensure_download(client, &url, &dest, opts.hf_token.as_deref(), opts.force_download).await?;
    Ok(dest)
}

fn hf_resolve_url(endpoint: &str, repo: &str, rev: &str, path_in_repo: &str) -> String {
    let endpoint = endpoint.trim_end_matches('/');
    let path_in_repo = path_in_repo.trim_start_matches('/');
    format!("{endpoint}/datasets/{repo}/resolve/{rev}/{path_in_repo}")
}

async fn ensure_download(
    client: &reqwest::Client,
    url: &str,
    dest: &Path,
    token: Option<&str>,
    force: bool,
) -> anyhow::Result<()> {
    if !force && file_present_nonempty(dest) {
        return Ok(());
    }

    let tmp = tmp_path(dest);
    if let Some(parent) = dest.parent() {
        tokio::fs::create_dir_all(parent).await.ok();
    }

    tracing::info!("Downloading {} -> {}", url, dest.display());

    let mut req = client.get(url);
    if let Some(token) = token.filter(|t| !t.trim().is_empty()) {
        req = req.header(AUTHORIZATION, format!("Bearer {}", token.trim()));
    }
    let resp = req.send().await.with_context(|| format!("GET {url}"))?;

    if !resp.status().is_success() {
        return Err(anyhow!("Download failed ({}): {}", resp.status(), url));
    }

    if let Err(e) = write_body(resp, &tmp, url).await {
        tokio::fs::remove_file(&tmp).await.ok();
        return Err(e);
    }

    tokio::fs::rename(&tmp, dest)
        .await
        .with_context(|| format!("rename {} -> {}", tmp.display(), dest.display()))?;

    Ok(())
}

async fn write_body(resp: reqwest::Response, tmp: &Path, url: &str) -> anyhow::Result<()> {
    let mut file = tokio::fs::File::create(tmp)
        .await
        .with_context(|| format!("create {}", tmp.display()))?;

    let mut downloaded: u64 = 0;
    let mut stream = resp.bytes_stream();
    while let Some(chunk) = stream.next().await {
        let chunk = chunk.with_context(|| format!("read body chunk from {url}"))?;
        downloaded += chunk.len() as u64;
        file.write_all(&chunk).await?;

        if downloaded % (50 * 1024 * 1024) < chunk.len() as u64 {
            tracing::info!("... downloaded {} MB", downloaded / (1024 * 1024));
        }
    }

    file.flush().await?;
    Ok(())
}

fn tmp_path(dest: &Path) -> PathBuf {
    let fname = dest
        .file_name()
        .and_then(|s| s.to_str())
        .unwrap_or("download");
    dest.with_file_name(format!("{fname}.part"))
}
