use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::Serialize;
use tracing::{debug, error, info, warn};
use vsync_adapters::{NewCollection, TargetApi, WriteResponse};
use vsync_core::{CollectionParent, PreparedItem, TargetItem, WrittenItem, MAX_BATCH_SIZE};
use vsync_storage::write_atomic;

use crate::{CollectionCatalog, SyncError};

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FailedWrite {
    pub source_id: String,
    /// HTTP-style code reported by Target; absent when the whole request failed.
    pub code: Option<u16>,
    pub message: String,
    pub payload: TargetItem,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct UnchangedItem {
    pub source_id: String,
    pub key: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct WriteOutcome {
    pub successful: Vec<WrittenItem>,
    pub unchanged: Vec<UnchangedItem>,
    pub failed: Vec<FailedWrite>,
}

impl WriteOutcome {
    pub fn len(&self) -> usize {
        self.successful.len() + self.unchanged.len() + self.failed.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Bulk writer for Target items and collections.
pub struct TargetWriter {
    api: Arc<dyn TargetApi>,
    catalog: Arc<CollectionCatalog>,
    failure_artifact: PathBuf,
}

impl TargetWriter {
    pub fn new(api: Arc<dyn TargetApi>, catalog: Arc<CollectionCatalog>, failure_artifact: impl Into<PathBuf>) -> Self {
        Self {
            api,
            catalog,
            failure_artifact: failure_artifact.into(),
        }
    }

    pub fn failure_artifact(&self) -> &Path {
        &self.failure_artifact
    }

    /// One bulk write whose failures replace the artifact. A clean call leaves
    /// an empty list there, so the artifact always describes the latest call.
    pub async fn write_items(&self, items: &[PreparedItem]) -> Result<WriteOutcome, SyncError> {
        let outcome = self.submit(items).await?;
        if let Err(err) = self.persist_failures(&outcome.failed).await {
            error!(error = %err, "could not record failed writes");
        }
        Ok(outcome)
    }

    /// One bulk write without touching the artifact. Response entries are
    /// matched back to `items` by index.
    pub async fn submit(&self, items: &[PreparedItem]) -> Result<WriteOutcome, SyncError> {
        if items.is_empty() {
            return Err(SyncError::EmptyBatch);
        }
        if items.len() > MAX_BATCH_SIZE {
            return Err(SyncError::BatchTooLarge {
                len: items.len(),
                max: MAX_BATCH_SIZE,
            });
        }

        let payloads: Vec<TargetItem> = items.iter().map(|prepared| prepared.item.clone()).collect();
        let response = self.api.write_items(&payloads).await?;
        let outcome = match_response(items, &response);
        info!(
            submitted = items.len(),
            successful = outcome.successful.len(),
            unchanged = outcome.unchanged.len(),
            failed = outcome.failed.len(),
            "target write completed"
        );
        Ok(outcome)
    }

    /// Replace the failure artifact with `failures`.
    pub async fn persist_failures(&self, failures: &[FailedWrite]) -> Result<(), SyncError> {
        let bytes = serde_json::to_vec_pretty(failures).map_err(|e| SyncError::Artifact(e.into()))?;
        write_atomic(&self.failure_artifact, &bytes)
            .await
            .map_err(SyncError::Artifact)?;
        if failures.is_empty() {
            debug!(path = %self.failure_artifact.display(), "failure artifact cleared");
        } else {
            warn!(
                path = %self.failure_artifact.display(),
                failed = failures.len(),
                "failed writes recorded"
            );
        }
        Ok(())
    }

    pub async fn create_collection(&self, name: &str, parent: CollectionParent) -> Result<String, SyncError> {
        let parent_id = self
            .catalog
            .parent_id(parent)
            .ok_or(SyncError::UnconfiguredParent(parent))?;
        let request = NewCollection {
            name: name.to_string(),
            parent_collection: parent_id.to_string(),
        };
        let response = self.api.create_collections(std::slice::from_ref(&request)).await?;

        if let Some(entry) = response.successful.get("0") {
            info!(name, parent = %parent, key = %entry.key, "collection created");
            return Ok(entry.key.clone());
        }
        let reason = response
            .failed
            .get("0")
            .map(|failure| format!("{} ({})", failure.message, failure.code))
            .unwrap_or_else(|| "no entry in response".to_string());
        Err(SyncError::MissingCollectionId {
            name: name.to_string(),
            reason,
        })
    }

    /// Parent kind given as text, e.g. from the command line.
    pub async fn create_collection_in(&self, name: &str, parent: &str) -> Result<String, SyncError> {
        let parent: CollectionParent = parent.parse()?;
        self.create_collection(name, parent).await
    }
}

fn match_response(items: &[PreparedItem], response: &WriteResponse) -> WriteOutcome {
    let mut outcome = WriteOutcome::default();
    for (index, prepared) in items.iter().enumerate() {
        let slot = index.to_string();
        if let Some(entry) = response.successful.get(&slot) {
            outcome.successful.push(WrittenItem {
                source_id: prepared.source_id.clone(),
                key: entry.key.clone(),
                version: entry.version,
                created: !prepared.item.is_update(),
                title: prepared.item.title.clone(),
                url: Some(prepared.item.url.clone()).filter(|url| !url.is_empty()),
            });
        } else if let Some(key) = response.unchanged.get(&slot) {
            outcome.unchanged.push(UnchangedItem {
                source_id: prepared.source_id.clone(),
                key: key.clone(),
            });
        } else if let Some(failure) = response.failed.get(&slot) {
            outcome.failed.push(FailedWrite {
                source_id: prepared.source_id.clone(),
                code: Some(failure.code),
                message: failure.message.clone(),
                payload: prepared.item.clone(),
            });
        } else {
            outcome.failed.push(FailedWrite {
                source_id: prepared.source_id.clone(),
                code: None,
                message: "target response has no entry for this item".to_string(),
                payload: prepared.item.clone(),
            });
        }
    }

    let stray = response
        .successful
        .keys()
        .chain(response.unchanged.keys())
        .chain(response.failed.keys())
        .filter(|slot| vsync_adapters::parse_index(slot).map_or(true, |i| i >= items.len()))
        .count();
    if stray > 0 {
        warn!(stray, "target response has entries outside the submitted batch");
    }
    outcome
}
