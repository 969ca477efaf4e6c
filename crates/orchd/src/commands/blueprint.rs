//! `orchd blueprint` — push, pull, list and delete revisions.

use std::path::Path;

use anyhow::{Context, Result, bail};
use orch_core::{BlueprintId, OrchConfig, Tag};
use tracing::info;
use uuid::Uuid;

use super::{blueprint_store, offline_service, print_json};

pub async fn push(
    config: &OrchConfig,
    path: &Path,
    blueprint: Option<BlueprintId>,
    message: Option<&str>,
    reference: Option<Tag>,
) -> Result<()> {
    if !path.is_dir() {
        bail!("{} is not a directory", path.display());
    }
    let store = blueprint_store(config).await?;
    let blueprint_id = blueprint.unwrap_or_else(Uuid::new_v4);
    let saved = store
        .save(blueprint_id, path, message, reference)
        .await
        .with_context(|| format!("saving {}", path.display()))?;
    info!(%blueprint_id, tag = %saved.tag, "revision pushed");
    print_json(&serde_json::json!({
        "blueprint_id": saved.blueprint_id,
        "version_id": saved.tag,
        "commit": saved.commit_sha,
    }))
}

pub async fn pull(
    config: &OrchConfig,
    blueprint_id: BlueprintId,
    version: Option<Tag>,
    dest: &Path,
) -> Result<()> {
    let store = blueprint_store(config).await?;
    let tag = store.fetch(blueprint_id, version, dest).await?;
    println!("{tag} -> {}", dest.display());
    Ok(())
}

pub async fn tags(config: &OrchConfig, blueprint_id: BlueprintId) -> Result<()> {
    let store = blueprint_store(config).await?;
    for version in store.versions(blueprint_id).await? {
        println!("{}\t{}", version.tag, version.message.unwrap_or_default());
    }
    Ok(())
}

pub async fn delete(config: &OrchConfig, blueprint_id: BlueprintId, force: bool) -> Result<()> {
    let (service, _receiver) = offline_service(config).await?;
    let tags = service.delete_blueprint(blueprint_id, force).await?;
    println!("deleted blueprint {blueprint_id} ({tags} revisions)");
    Ok(())
}
