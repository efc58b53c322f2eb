use std::sync::Arc;

use anyhow::Context;
use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{info, info_span, Instrument};
use uuid::Uuid;
use vsync_adapters::{HttpSourceApi, HttpTargetApi, LogNotifier, Notifier, SourceApi, TargetApi, WebhookNotifier};
use vsync_core::{ListFilter, SourceRecord};
use vsync_storage::{HttpClientConfig, JsonClient, RateLimiter, ResponseCache};

use crate::{
    CollectionCatalog, ListQuery, ReconcileSettings, Reconciler, SourceReader, SourceUpdater, SyncConfig,
    SyncError, SyncKind, SyncSummary, TargetWriter, TransformSettings, Transformer,
};

const TARGET_API_VERSION: &str = "3";

#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub listed: usize,
    pub create: Option<SyncSummary>,
    pub update: Option<SyncSummary>,
}

impl RunSummary {
    pub fn written(&self) -> usize {
        [&self.create, &self.update]
            .into_iter()
            .flatten()
            .map(SyncSummary::successful)
            .sum()
    }
}

/// Fully wired engine: one reader, writer, updater and reconciler sharing one
/// rate limiter per upstream API.
pub struct SyncPipeline {
    config: SyncConfig,
    reader: SourceReader,
    updater: Arc<SourceUpdater>,
    writer: Arc<TargetWriter>,
    reconciler: Reconciler,
}

impl SyncPipeline {
    pub fn new(config: SyncConfig) -> anyhow::Result<Self> {
        let source_limiter = Arc::new(RateLimiter::new("source", config.source_min_interval));
        let target_limiter = Arc::new(RateLimiter::new("target", config.target_min_interval));

        let source_http = JsonClient::new(
            HttpClientConfig {
                timeout: config.http_timeout(),
                user_agent: Some(config.user_agent.clone()),
                bearer_token: config.source_token.clone(),
                ..HttpClientConfig::default()
            },
            source_limiter,
        )
        .context("building source http client")?;

        let mut target_headers = vec![("Zotero-API-Version".to_string(), TARGET_API_VERSION.to_string())];
        if let Some(key) = &config.target_api_key {
            target_headers.push(("Zotero-API-Key".to_string(), key.clone()));
        }
        let target_http = JsonClient::new(
            HttpClientConfig {
                timeout: config.http_timeout(),
                user_agent: Some(config.user_agent.clone()),
                default_headers: target_headers,
                ..HttpClientConfig::default()
            },
            target_limiter,
        )
        .context("building target http client")?;

        let notifier: Arc<dyn Notifier> = match &config.webhook_url {
            Some(url) => {
                let http = JsonClient::new(
                    HttpClientConfig {
                        timeout: config.http_timeout(),
                        user_agent: Some(config.user_agent.clone()),
                        ..HttpClientConfig::default()
                    },
                    Arc::new(RateLimiter::new("notifier", std::time::Duration::ZERO)),
                )
                .context("building notifier http client")?;
                Arc::new(WebhookNotifier::new(http, url.clone()))
            }
            None => Arc::new(LogNotifier),
        };

        let source = Arc::new(HttpSourceApi::new(
            source_http,
            config.source_base_url.clone(),
            config.source_base_id.clone(),
        ));
        let target = Arc::new(HttpTargetApi::new(
            target_http,
            config.target_base_url.clone(),
            config.target_library.clone(),
        ));
        let catalog = CollectionCatalog::load(&config.collections_file)?;
        Ok(Self::from_parts(config, source, target, notifier, catalog))
    }

    pub fn from_parts(
        config: SyncConfig,
        source: Arc<dyn SourceApi>,
        target: Arc<dyn TargetApi>,
        notifier: Arc<dyn Notifier>,
        catalog: CollectionCatalog,
    ) -> Self {
        let catalog = Arc::new(catalog);
        let cache = config
            .cache_enabled
            .then(|| ResponseCache::new(config.cache_dir.clone()));
        let reader = SourceReader::new(source.clone(), config.videos_table.clone(), cache);
        let updater = Arc::new(SourceUpdater::new(source));
        let writer = Arc::new(TargetWriter::new(
            target.clone(),
            catalog.clone(),
            config.failure_artifact.clone(),
        ));
        let transformer = Arc::new(Transformer::new(
            writer.clone(),
            updater.clone(),
            catalog,
            TransformSettings {
                display_offset: config.display_offset(),
                series_table: config.series_table.clone(),
            },
        ));
        let reconciler = Reconciler::new(
            target,
            transformer,
            writer.clone(),
            updater.clone(),
            notifier,
            ReconcileSettings {
                videos_table: config.videos_table.clone(),
                chunk_delay: config.chunk_delay,
                notify_threshold: config.notify_threshold,
                notify_pause: config.notify_pause,
                transform_concurrency: config.transform_concurrency,
            },
        );
        Self {
            config,
            reader,
            updater,
            writer,
            reconciler,
        }
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    pub fn reader(&self) -> &SourceReader {
        &self.reader
    }

    pub fn updater(&self) -> &SourceUpdater {
        &self.updater
    }

    pub fn writer(&self) -> &TargetWriter {
        &self.writer
    }

    pub fn reconciler(&self) -> &Reconciler {
        &self.reconciler
    }

    /// Read the matching rows fresh from Source, then run a create pass for rows
    /// without a token and an update pass for the rest.
    pub async fn run_once(&self, filter: ListFilter) -> Result<RunSummary, SyncError> {
        let run_id = Uuid::new_v4();
        let started_at = Utc::now();
        let span = info_span!("sync_run", %run_id);

        async move {
            let query = ListQuery {
                filter,
                page_size: self.config.default_page_size,
                refresh: true,
                ..ListQuery::default()
            };
            let records = self.reader.list_records(&query).await?;
            let (updates, creates): (Vec<SourceRecord>, Vec<SourceRecord>) =
                records.iter().cloned().partition(|r| r.target_token().is_some());
            info!(listed = records.len(), creates = creates.len(), updates = updates.len(), "sync run started");

            let create = if creates.is_empty() {
                None
            } else {
                Some(self.reconciler.sync_all(&creates, SyncKind::Create).await?.into_summary())
            };
            let update = if updates.is_empty() {
                None
            } else {
                Some(self.reconciler.sync_all(&updates, SyncKind::Update).await?.into_summary())
            };

            let summary = RunSummary {
                run_id,
                started_at,
                finished_at: Utc::now(),
                listed: records.len(),
                create,
                update,
            };
            info!(written = summary.written(), "sync run finished");
            Ok(summary)
        }
        .instrument(span)
        .await
    }
}

pub async fn run_sync_once_from_env(filter: ListFilter) -> anyhow::Result<RunSummary> {
    let config = SyncConfig::from_env();
    let pipeline = SyncPipeline::new(config)?;
    Ok(pipeline.run_once(filter).await?)
}
