use std::sync::Arc;
use std::time::Duration;

use chrono::{TimeZone, Utc};
use serde_json::json;
use tempfile::TempDir;
use vsync_adapters::{FixtureSource, FixtureTarget, RawRecord, RecordingNotifier};
use vsync_core::{CollectionParent, PreparedItem, RecordFields, SourceRecord, TargetItem};

use crate::{CollectionCatalog, SyncConfig, SyncPipeline};

pub const VIDEOS: &str = "Videos";
pub const SERIES: &str = "Series";

pub fn catalog() -> CollectionCatalog {
    CollectionCatalog::new(
        [
            (CollectionParent::Series, "SERIES01".to_string()),
            (CollectionParent::Topics, "TOPICS01".to_string()),
        ],
        [("Astronomy".to_string(), "ASTRO001".to_string())],
    )
}

/// Row `i` is titled `Video i` and was created and modified on 2021-01-`i` (day wraps at 28).
pub fn video_rows(count: usize) -> Vec<RawRecord> {
    (1..=count)
        .map(|i| {
            let day = ((i - 1) % 28 + 1) as u32;
            let ts = Utc.with_ymd_and_hms(2021, 1, day, 0, 0, 0).unwrap().to_rfc3339();
            RawRecord {
                id: format!("rec{i:02}"),
                fields: json!({
                    "title": format!("Video {i}"),
                    "duration": 60 * i,
                    "created": ts,
                    "modified": ts,
                })
                .as_object()
                .cloned()
                .unwrap(),
            }
        })
        .collect()
}

pub fn record(id: &str, title: &str) -> SourceRecord {
    SourceRecord {
        id: id.to_string(),
        fields: RecordFields {
            title: Some(title.to_string()),
            created: Some(Utc.with_ymd_and_hms(2021, 1, 1, 0, 0, 0).unwrap()),
            ..Default::default()
        },
    }
}

pub fn prepared(source_id: &str, title: &str, token: Option<(&str, u64)>) -> PreparedItem {
    let mut item = TargetItem {
        item_type: "videoRecording".to_string(),
        title: title.to_string(),
        ..Default::default()
    };
    item.set_token(token.map(|(key, version)| (key.to_string(), version)));
    PreparedItem {
        source_id: source_id.to_string(),
        item,
    }
}

pub struct Harness {
    pub source: Arc<FixtureSource>,
    pub target: Arc<FixtureTarget>,
    pub notifier: Arc<RecordingNotifier>,
    pub pipeline: SyncPipeline,
    pub _dir: TempDir,
}

pub fn test_config(dir: &TempDir) -> SyncConfig {
    SyncConfig {
        cache_dir: dir.path().join("cache"),
        failure_artifact: dir.path().join("failed-writes.json"),
        collections_file: dir.path().join("collections.yaml"),
        source_min_interval: Duration::ZERO,
        target_min_interval: Duration::ZERO,
        chunk_delay: Duration::from_secs(1),
        notify_pause: Duration::from_millis(500),
        ..SyncConfig::default()
    }
}

pub fn harness(source: FixtureSource, target: FixtureTarget, notifier: RecordingNotifier) -> Harness {
    let dir = tempfile::tempdir().unwrap();
    let source = Arc::new(source);
    let target = Arc::new(target);
    let notifier = Arc::new(notifier);
    let pipeline = SyncPipeline::from_parts(
        test_config(&dir),
        source.clone(),
        target.clone(),
        notifier.clone(),
        catalog(),
    );
    Harness {
        source,
        target,
        notifier,
        pipeline,
        _dir: dir,
    }
}
