//! Synchronization engine: paginated Source reads, item transformation, chunked Target
//! writes and back-propagation of Target tokens into Source.

mod catalog;
mod config;
mod pipeline;
mod reader;
mod reconcile;
mod transform;
mod updater;
mod writer;

#[cfg(test)]
mod test_support;

use thiserror::Error;
use vsync_adapters::ApiError;
use vsync_core::{CollectionParent, UnknownCollectionParent};

pub use catalog::CollectionCatalog;
pub use config::SyncConfig;
pub use pipeline::{run_sync_once_from_env, RunSummary, SyncPipeline};
pub use reader::{ListQuery, PageWalk, SourceReader};
pub use reconcile::{
    ReconcileSettings, Reconciler, SyncKind, SyncReport, SyncSummary, TransformFailure,
};
pub use transform::{build_creators, build_extra, FormattedItem, SeriesRegistry, TransformSettings, Transformer};
pub use updater::{SourceUpdater, UpdateReport};
pub use writer::{FailedWrite, TargetWriter, UnchangedItem, WriteOutcome};

pub const CRATE_NAME: &str = "vsync-sync";

#[derive(Debug, Error)]
pub enum SyncError {
    #[error("upstream api error: {0}")]
    Api(#[from] ApiError),
    #[error("response cache: {0:#}")]
    Cache(anyhow::Error),
    #[error("decoding source row {id}: {source}")]
    Decode {
        id: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("item template does not match the target schema: {0}")]
    Template(#[source] serde_json::Error),
    #[error("writing failure artifact: {0:#}")]
    Artifact(anyhow::Error),
    #[error("collection catalog: {0}")]
    Catalog(#[from] serde_yaml::Error),
    #[error("write batch is empty")]
    EmptyBatch,
    #[error("write batch of {len} items exceeds the limit of {max}")]
    BatchTooLarge { len: usize, max: usize },
    #[error(transparent)]
    UnknownCollectionParent(#[from] UnknownCollectionParent),
    #[error("no collection id configured for the `{0}` parent")]
    UnconfiguredParent(CollectionParent),
    #[error("target returned no collection id for '{name}': {reason}")]
    MissingCollectionId { name: String, reason: String },
}
