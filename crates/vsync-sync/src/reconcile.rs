use std::sync::Arc;
use std::time::Duration;

use futures::stream::{self, StreamExt};
use serde::Serialize;
use tracing::{error, info, info_span, warn, Instrument};
use uuid::Uuid;
use vsync_adapters::{Notifier, TargetApi};
use vsync_core::{
    batch_count, PreparedItem, SourceRecord, UpdateInstruction, WrittenItem, ITEM_TYPE, MAX_BATCH_SIZE,
};

use crate::{FailedWrite, SourceUpdater, SyncError, TargetWriter, Transformer, UnchangedItem};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncKind {
    #[default]
    Create,
    Update,
}

#[derive(Debug, Clone)]
pub struct ReconcileSettings {
    pub videos_table: String,
    pub chunk_delay: Duration,
    pub notify_threshold: usize,
    pub notify_pause: Duration,
    pub transform_concurrency: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TransformFailure {
    pub source_id: String,
    pub message: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct SyncSummary {
    pub kind: SyncKind,
    pub submitted: usize,
    pub chunks: usize,
    pub written: Vec<WrittenItem>,
    pub unchanged: Vec<UnchangedItem>,
    pub failed: Vec<FailedWrite>,
    pub transform_failures: Vec<TransformFailure>,
    /// Token patches accepted by Source.
    pub back_synced: Vec<UpdateInstruction>,
    /// Items written to Target whose token could not be stored on the Source row.
    pub orphaned: Vec<UpdateInstruction>,
    pub notified: usize,
    pub notify_failures: usize,
    pub unpersisted_series: Vec<String>,
}

impl SyncSummary {
    fn new(kind: SyncKind, submitted: usize) -> Self {
        Self {
            kind,
            submitted,
            ..Self::default()
        }
    }

    pub fn successful(&self) -> usize {
        self.written.len()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", content = "summary", rename_all = "snake_case")]
pub enum SyncReport {
    Processed(SyncSummary),
    NothingWritten(SyncSummary),
}

impl SyncReport {
    pub fn summary(&self) -> &SyncSummary {
        match self {
            Self::Processed(summary) | Self::NothingWritten(summary) => summary,
        }
    }

    pub fn into_summary(self) -> SyncSummary {
        match self {
            Self::Processed(summary) | Self::NothingWritten(summary) => summary,
        }
    }

    pub fn is_processed(&self) -> bool {
        matches!(self, Self::Processed(_))
    }
}

/// Drives one create or update pass from Source rows to Target and back.
pub struct Reconciler {
    target: Arc<dyn TargetApi>,
    transformer: Arc<Transformer>,
    writer: Arc<TargetWriter>,
    updater: Arc<SourceUpdater>,
    notifier: Arc<dyn Notifier>,
    settings: ReconcileSettings,
}

impl Reconciler {
    pub fn new(
        target: Arc<dyn TargetApi>,
        transformer: Arc<Transformer>,
        writer: Arc<TargetWriter>,
        updater: Arc<SourceUpdater>,
        notifier: Arc<dyn Notifier>,
        settings: ReconcileSettings,
    ) -> Self {
        Self {
            target,
            transformer,
            writer,
            updater,
            notifier,
            settings,
        }
    }

    pub async fn sync_all(&self, records: &[SourceRecord], kind: SyncKind) -> Result<SyncReport, SyncError> {
        let run_id = Uuid::new_v4();
        let span = info_span!("sync_pass", %run_id, kind = ?kind, records = records.len());
        self.sync_all_inner(records, kind).instrument(span).await
    }

    async fn sync_all_inner(&self, records: &[SourceRecord], kind: SyncKind) -> Result<SyncReport, SyncError> {
        let mut summary = SyncSummary::new(kind, records.len());
        if records.is_empty() {
            return Ok(SyncReport::NothingWritten(summary));
        }

        let template = self.target.item_template(ITEM_TYPE).await?;
        let prepared = self.transform_all(records, &template, &mut summary).await;
        self.write_chunks(&prepared, &mut summary).await;
        if let Err(err) = self.writer.persist_failures(&summary.failed).await {
            error!(error = %err, "could not record failed writes");
        }

        if kind == SyncKind::Create {
            self.announce(&mut summary).await;
        }
        self.back_sync(&mut summary).await;

        info!(
            written = summary.written.len(),
            unchanged = summary.unchanged.len(),
            failed = summary.failed.len(),
            transform_failures = summary.transform_failures.len(),
            orphaned = summary.orphaned.len(),
            "sync pass finished"
        );
        Ok(if summary.written.is_empty() {
            SyncReport::NothingWritten(summary)
        } else {
            SyncReport::Processed(summary)
        })
    }

    async fn transform_all(
        &self,
        records: &[SourceRecord],
        template: &serde_json::Map<String, serde_json::Value>,
        summary: &mut SyncSummary,
    ) -> Vec<PreparedItem> {
        let futures: Vec<_> = records
            .iter()
            .map(|record| async move { (record, self.transformer.format_item(record, template).await) })
            .collect();
        let results: Vec<_> = stream::iter(futures)
            .buffered(self.settings.transform_concurrency.max(1))
            .collect()
            .await;

        let mut prepared = Vec::with_capacity(results.len());
        for (record, result) in results {
            match result {
                Ok(formatted) => {
                    prepared.push(formatted.prepared);
                    summary.unpersisted_series.extend(formatted.unpersisted_series);
                }
                Err(err) => {
                    warn!(record = %record.id, error = %err, "record skipped: transform failed");
                    summary.transform_failures.push(TransformFailure {
                        source_id: record.id.clone(),
                        message: err.to_string(),
                    });
                }
            }
        }
        prepared
    }

    async fn write_chunks(&self, prepared: &[PreparedItem], summary: &mut SyncSummary) {
        let total = batch_count(prepared.len());
        for (index, chunk) in prepared.chunks(MAX_BATCH_SIZE).enumerate() {
            if index > 0 && !self.settings.chunk_delay.is_zero() {
                tokio::time::sleep(self.settings.chunk_delay).await;
            }
            summary.chunks += 1;
            match self.writer.submit(chunk).await {
                Ok(outcome) => {
                    info!(chunk = index + 1, of = total, successful = outcome.successful.len(), "chunk written");
                    summary.written.extend(outcome.successful);
                    summary.unchanged.extend(outcome.unchanged);
                    summary.failed.extend(outcome.failed);
                }
                Err(err) => {
                    error!(chunk = index + 1, of = total, error = %err, "chunk write failed");
                    summary.failed.extend(chunk.iter().map(|p| FailedWrite {
                        source_id: p.source_id.clone(),
                        code: None,
                        message: err.to_string(),
                        payload: p.item.clone(),
                    }));
                }
            }
        }
    }

    /// Announce created items, pausing between calls once the threshold is passed.
    async fn announce(&self, summary: &mut SyncSummary) {
        let created = summary.written.iter().filter(|w| w.created);
        for (sent, item) in created.enumerate() {
            if sent >= self.settings.notify_threshold && !self.settings.notify_pause.is_zero() {
                tokio::time::sleep(self.settings.notify_pause).await;
            }
            match self.notifier.announce(item).await {
                Ok(()) => summary.notified += 1,
                Err(err) => {
                    warn!(source_id = %item.source_id, error = %err, "announcement failed");
                    summary.notify_failures += 1;
                }
            }
        }
    }

    /// Store each new token on its Source row. Rows that cannot be patched are
    /// reported as orphaned; the Target item is left in place.
    async fn back_sync(&self, summary: &mut SyncSummary) {
        if summary.written.is_empty() {
            return;
        }
        let instructions: Vec<_> = summary
            .written
            .iter()
            .map(|w| UpdateInstruction::target_token(w.source_id.as_str(), &w.key, w.version))
            .collect();
        let report = self.updater.apply(&self.settings.videos_table, &instructions).await;
        if !report.is_complete() {
            error!(
                orphaned = report.failed.len(),
                errors = ?report.errors,
                "target items written but their tokens were not stored in source; a later create pass will duplicate them"
            );
        }
        summary.back_synced = report.applied;
        summary.orphaned = report.failed;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{harness, record, video_rows, Harness, VIDEOS};
    use vsync_adapters::{FixtureSource, FixtureTarget, RecordingNotifier};

    fn records(count: usize) -> Vec<SourceRecord> {
        (1..=count)
            .map(|i| record(&format!("rec{i:02}"), &format!("Video {i}")))
            .collect()
    }

    fn default_harness(rows: usize) -> Harness {
        harness(
            FixtureSource::new().with_table(VIDEOS, video_rows(rows)),
            FixtureTarget::new(),
            RecordingNotifier::new(),
        )
    }

    #[tokio::test]
    async fn empty_input_writes_nothing() {
        let h = default_harness(0);
        let report = h.pipeline.reconciler().sync_all(&[], SyncKind::Create).await.unwrap();
        assert!(!report.is_processed());
        assert_eq!(h.target.template_calls(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn records_are_written_in_chunks_of_fifty_with_a_delay_between() {
        let h = default_harness(120);
        let start = tokio::time::Instant::now();

        let report = h
            .pipeline
            .reconciler()
            .sync_all(&records(120), SyncKind::Create)
            .await
            .unwrap();

        assert_eq!(h.target.write_batches().await, vec![50, 50, 20]);
        assert!(start.elapsed() >= h.pipeline.config().chunk_delay * 2);
        assert_eq!(h.target.template_calls(), 1);
        let summary = report.summary();
        assert_eq!(summary.chunks, 3);
        assert_eq!(summary.successful(), 120);
        let order: Vec<_> = summary.written.iter().map(|w| w.source_id.clone()).collect();
        let expected: Vec<_> = records(120).into_iter().map(|r| r.id).collect();
        assert_eq!(order, expected);
    }

    #[tokio::test]
    async fn failures_go_to_the_artifact_and_successes_are_back_synced() {
        let h = harness(
            FixtureSource::new().with_table(VIDEOS, video_rows(5)),
            FixtureTarget::new().rejecting_titles(["Video 2", "Video 4"]),
            RecordingNotifier::new(),
        );

        let report = h
            .pipeline
            .reconciler()
            .sync_all(&records(5), SyncKind::Create)
            .await
            .unwrap();
        let summary = report.summary();
        assert!(report.is_processed());
        assert_eq!(summary.failed.len(), 2);
        assert_eq!(summary.back_synced.len(), 3);
        assert!(summary.orphaned.is_empty());

        let artifact: Vec<serde_json::Value> =
            serde_json::from_slice(&std::fs::read(&h.pipeline.config().failure_artifact).unwrap()).unwrap();
        assert_eq!(artifact.len(), 2);

        let row = h.source.row(VIDEOS, "rec01").await.unwrap();
        assert_eq!(row.fields["key"], summary.written[0].key.as_str());
        assert_eq!(row.fields["version"], 1);
        assert!(h.source.row(VIDEOS, "rec02").await.unwrap().fields.get("key").is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn a_failed_chunk_is_recorded_and_later_chunks_still_run() {
        let h = default_harness(150);
        h.target.fail_write_call(1).await;

        let report = h
            .pipeline
            .reconciler()
            .sync_all(&records(150), SyncKind::Create)
            .await
            .unwrap();
        let summary = report.summary();

        assert_eq!(summary.chunks, 3);
        assert_eq!(h.target.write_batches().await, vec![50, 50]);
        assert_eq!(summary.failed.len(), 50);
        assert!(summary.failed.iter().all(|f| f.code.is_none()));
        assert_eq!(summary.failed[0].source_id, "rec51");
        assert_eq!(summary.failed[49].source_id, "rec100");

        let artifact: Vec<serde_json::Value> =
            serde_json::from_slice(&std::fs::read(&h.pipeline.config().failure_artifact).unwrap()).unwrap();
        assert_eq!(artifact.len(), 50);
        assert_eq!(artifact[0]["source_id"], "rec51");
        assert!(artifact.iter().all(|entry| entry["code"].is_null()));

        assert_eq!(summary.back_synced.len(), 100);
        let synced: Vec<_> = summary.back_synced.iter().map(|u| u.id.as_str()).collect();
        assert_eq!(synced[49], "rec50");
        assert_eq!(synced[50], "rec101");
        assert!(h.source.row(VIDEOS, "rec120").await.unwrap().fields.get("key").is_some());
        assert!(h.source.row(VIDEOS, "rec75").await.unwrap().fields.get("key").is_none());
    }

    #[tokio::test]
    async fn clean_pass_clears_the_previous_failure_artifact() {
        let h = default_harness(2);
        let artifact_path = h.pipeline.config().failure_artifact.clone();
        std::fs::write(&artifact_path, br#"[{"source_id": "recOld"}]"#).unwrap();

        h.pipeline
            .reconciler()
            .sync_all(&records(2), SyncKind::Create)
            .await
            .unwrap();

        let artifact: Vec<serde_json::Value> = serde_json::from_slice(&std::fs::read(&artifact_path).unwrap()).unwrap();
        assert!(artifact.is_empty());
    }

    #[tokio::test]
    async fn only_created_items_are_announced_and_notifier_errors_are_counted() {
        let h = harness(
            FixtureSource::new().with_table(VIDEOS, video_rows(4)),
            FixtureTarget::new(),
            RecordingNotifier::new().failing_first(1),
        );
        let report = h
            .pipeline
            .reconciler()
            .sync_all(&records(4), SyncKind::Create)
            .await
            .unwrap();
        let summary = report.summary();
        assert_eq!(summary.notified, 3);
        assert_eq!(summary.notify_failures, 1);
        assert_eq!(h.notifier.announced().await.len(), 3);
        assert_eq!(summary.back_synced.len(), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn announcements_pause_after_the_threshold() {
        let h = default_harness(34);
        let start = tokio::time::Instant::now();
        let report = h
            .pipeline
            .reconciler()
            .sync_all(&records(34), SyncKind::Create)
            .await
            .unwrap();
        assert_eq!(report.summary().notified, 34);
        let config = h.pipeline.config();
        assert!(start.elapsed() >= config.notify_pause * 4);
    }

    #[tokio::test]
    async fn update_pass_carries_tokens_and_skips_announcements() {
        let h = default_harness(2);
        let created = h
            .pipeline
            .reconciler()
            .sync_all(&records(2), SyncKind::Create)
            .await
            .unwrap()
            .into_summary();

        let mut updated = records(2);
        for (rec, written) in updated.iter_mut().zip(&created.written) {
            rec.fields.key = Some(written.key.clone());
            rec.fields.version = Some(written.version);
        }
        updated[0].fields.title = Some("Video 1 (remastered)".into());

        let report = h
            .pipeline
            .reconciler()
            .sync_all(&updated, SyncKind::Update)
            .await
            .unwrap();
        let summary = report.summary();
        assert_eq!(summary.successful(), 1);
        assert_eq!(summary.unchanged.len(), 1);
        assert!(!summary.written[0].created);
        assert_eq!(summary.written[0].version, 2);
        assert_eq!(h.notifier.announced().await.len(), 2);
        assert_eq!(h.target.item_count().await, 2);

        let row = h.source.row(VIDEOS, "rec01").await.unwrap();
        assert_eq!(row.fields["version"], 2);
    }

    #[tokio::test]
    async fn nothing_written_when_every_item_fails() {
        let h = harness(
            FixtureSource::new().with_table(VIDEOS, video_rows(1)),
            FixtureTarget::new().rejecting_titles(["Video 1"]),
            RecordingNotifier::new(),
        );
        let report = h
            .pipeline
            .reconciler()
            .sync_all(&records(1), SyncKind::Create)
            .await
            .unwrap();
        assert!(matches!(report, SyncReport::NothingWritten(_)));
        assert!(h.notifier.announced().await.is_empty());
    }

    #[tokio::test]
    async fn back_sync_failure_leaves_items_orphaned() {
        let h = default_harness(3);
        h.source.fail_updates(true).await;
        let report = h
            .pipeline
            .reconciler()
            .sync_all(&records(3), SyncKind::Create)
            .await
            .unwrap();
        let summary = report.summary();
        assert!(report.is_processed());
        assert_eq!(summary.orphaned.len(), 3);
        assert!(summary.back_synced.is_empty());
        assert_eq!(h.target.item_count().await, 3);
    }
}
