use std::sync::Arc;

use serde::Serialize;
use tracing::{error, info};
use vsync_adapters::SourceApi;
use vsync_core::{UpdateInstruction, MAX_BATCH_SIZE};

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct UpdateReport {
    pub applied: Vec<UpdateInstruction>,
    pub failed: Vec<UpdateInstruction>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub errors: Vec<String>,
}

impl UpdateReport {
    pub fn is_complete(&self) -> bool {
        self.failed.is_empty()
    }
}

/// Patches Source rows in batches of at most [`MAX_BATCH_SIZE`].
pub struct SourceUpdater {
    api: Arc<dyn SourceApi>,
}

impl SourceUpdater {
    pub fn new(api: Arc<dyn SourceApi>) -> Self {
        Self { api }
    }

    /// Chunks run one after another in input order. A rejected chunk is recorded
    /// in the report and the remaining chunks are still sent.
    pub async fn apply(&self, table: &str, instructions: &[UpdateInstruction]) -> UpdateReport {
        let mut report = UpdateReport::default();
        for (index, chunk) in instructions.chunks(MAX_BATCH_SIZE).enumerate() {
            match self.api.update_records(table, chunk).await {
                Ok(updated) => {
                    info!(table, chunk = index, rows = updated.len(), "source rows updated");
                    report.applied.extend_from_slice(chunk);
                }
                Err(err) => {
                    error!(table, chunk = index, rows = chunk.len(), error = %err, "source update chunk failed");
                    report.failed.extend_from_slice(chunk);
                    report.errors.push(err.to_string());
                }
            }
        }
        report
    }
}
