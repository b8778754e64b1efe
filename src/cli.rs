//! Command implementations behind the `unitdocs` binary.
//!
//! Each `run_*` function wires the same collaborators the server uses
//! ([`AppState::from_config`]) and prints its result to stdout.

use anyhow::{bail, Context, Result};
use serde::Serialize;
use std::path::PathBuf;

use crate::blob::content_type_for;
use crate::config::Config;
use crate::models::{Development, UnitIdentity, UploadFile};
use crate::server::AppState;
use crate::train::IngestOptions;

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

pub async fn run_add_development(
    config: &Config,
    id: &str,
    name: &str,
    tenant: Option<String>,
) -> Result<()> {
    let state = AppState::from_config(config).await?;
    state
        .store
        .add_development(&Development {
            id: id.to_string(),
            tenant_id: tenant,
            name: name.to_string(),
        })
        .await?;
    println!("Development {} saved.", id);
    Ok(())
}

pub async fn run_add_unit(
    config: &Config,
    unit_id: &str,
    development_id: &str,
    house_type: Option<String>,
) -> Result<()> {
    let state = AppState::from_config(config).await?;
    if state.store.development(development_id).await?.is_none() {
        bail!("Development not found: {}", development_id);
    }
    state
        .store
        .add_unit(&UnitIdentity {
            unit_id: unit_id.to_string(),
            development_id: development_id.to_string(),
            house_type_code: house_type,
        })
        .await?;
    println!("Unit {} saved.", unit_id);
    Ok(())
}

/// Ingests local files the way `POST /train` ingests an upload.
pub async fn run_train(
    config: &Config,
    development_id: &str,
    paths: &[PathBuf],
    options: IngestOptions,
) -> Result<()> {
    let state = AppState::from_config(config).await?;

    let mut files = Vec::with_capacity(paths.len());
    for path in paths {
        let bytes = tokio::fs::read(path)
            .await
            .with_context(|| format!("Failed to read {}", path.display()))?;
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| path.display().to_string());
        let content_type = content_type_for(&name);
        files.push(UploadFile::new(name, content_type, bytes));
    }

    let outcome = state
        .trainer
        .handle_upload_with(development_id, files, options)
        .await?;
    print_json(&outcome.to_response())?;
    if !outcome.success() {
        bail!("All files failed to ingest");
    }
    Ok(())
}

pub async fn run_jobs(config: &Config, tenant_id: &str, development_id: &str, limit: i64) -> Result<()> {
    let state = AppState::from_config(config).await?;
    let jobs = state.store.jobs_for(tenant_id, development_id, limit).await?;
    if jobs.is_empty() {
        println!("No training jobs.");
        return Ok(());
    }
    for job in jobs {
        println!(
            "{}  {:<10}  {:>4} chunks  {}{}",
            job.id,
            job.status.as_str(),
            job.chunks,
            job.file_name,
            job.error.as_deref().map(|e| format!("  ({})", e)).unwrap_or_default()
        );
    }
    Ok(())
}

pub async fn run_classify(config: &Config, file_name: &str, title: Option<&str>) -> Result<()> {
    let state = AppState::from_config(config).await?;
    let classification = state.classifier.classify(file_name, title, None).await;
    print_json(&classification)
}

pub async fn run_resolve(
    config: &Config,
    unit_id: &str,
    hint: &str,
    context: Option<&str>,
) -> Result<()> {
    let state = AppState::from_config(config).await?;
    let resolution = state.resolver.resolve(unit_id, hint, context).await;
    print_json(&resolution)
}

pub async fn run_floor_plans(config: &Config, unit_id: &str) -> Result<()> {
    let state = AppState::from_config(config).await?;
    let resolution = state.floor_plans.find(unit_id).await;
    print_json(&resolution)
}

/// Clears `key` on one limiter, or on every limiter when `limiter` is
/// `None`.
pub async fn run_rate_limit_reset(config: &Config, key: &str, limiter: Option<&str>) -> Result<()> {
    let state = AppState::from_config(config).await?;
    let limiters = &state.limiters;
    let targets = match limiter {
        Some(name) => vec![limiters
            .by_name(name)
            .with_context(|| format!("Unknown limiter: {}", name))?],
        None => vec![
            &limiters.admin,
            &limiters.developer,
            &limiters.developer_burst,
            &limiters.homeowner,
            &limiters.ip,
            &limiters.chat,
            &limiters.train,
            &limiters.upload,
        ],
    };
    for target in targets {
        target.reset(key).await?;
    }
    println!("Rate limit reset for {}.", key);
    Ok(())
}
