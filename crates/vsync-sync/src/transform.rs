use std::collections::HashMap;
use std::sync::Arc;

use chrono::FixedOffset;
use serde_json::{Map as JsonMap, Value as JsonValue};
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};
use vsync_core::{
    format_duration, format_timestamp, CollectionParent, Creator, ItemTag, PreparedItem, RecordFields,
    SourceRecord, TargetItem, UpdateInstruction, ITEM_TYPE, SERIES_COLLECTION_FIELD, UNKNOWN_CREATOR,
};

use crate::{CollectionCatalog, SourceUpdater, SyncError, TargetWriter};

#[derive(Debug, Clone)]
pub struct TransformSettings {
    pub display_offset: FixedOffset,
    pub series_table: String,
}

/// Process-wide memo of series collections, with one creation lock per series name.
#[derive(Debug, Default)]
pub struct SeriesRegistry {
    locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
    resolved: Mutex<HashMap<String, String>>,
}

impl SeriesRegistry {
    async fn lock_for(&self, name: &str) -> Arc<Mutex<()>> {
        self.locks
            .lock()
            .await
            .entry(name.to_string())
            .or_default()
            .clone()
    }

    pub async fn resolved(&self, name: &str) -> Option<String> {
        self.resolved.lock().await.get(name).cloned()
    }

    async fn remember(&self, name: &str, id: &str) {
        self.resolved.lock().await.insert(name.to_string(), id.to_string());
    }
}

/// A transformed record. `unpersisted_series` names a series collection this
/// record created whose id could not be written back to its Source row.
#[derive(Debug, Clone, PartialEq)]
pub struct FormattedItem {
    pub prepared: PreparedItem,
    pub unpersisted_series: Option<String>,
}

struct SeriesLink {
    collection_id: String,
    /// Series name, when its new collection id is missing from Source.
    unpersisted: Option<String>,
}

impl SeriesLink {
    fn stored(collection_id: impl Into<String>) -> Self {
        Self {
            collection_id: collection_id.into(),
            unpersisted: None,
        }
    }
}

/// Turns Source rows into Target item payloads.
pub struct Transformer {
    writer: Arc<TargetWriter>,
    updater: Arc<SourceUpdater>,
    catalog: Arc<CollectionCatalog>,
    series: SeriesRegistry,
    settings: TransformSettings,
}

impl Transformer {
    pub fn new(
        writer: Arc<TargetWriter>,
        updater: Arc<SourceUpdater>,
        catalog: Arc<CollectionCatalog>,
        settings: TransformSettings,
    ) -> Self {
        Self {
            writer,
            updater,
            catalog,
            series: SeriesRegistry::default(),
            settings,
        }
    }

    pub fn series(&self) -> &SeriesRegistry {
        &self.series
    }

    pub async fn format_item(
        &self,
        record: &SourceRecord,
        template: &JsonMap<String, JsonValue>,
    ) -> Result<FormattedItem, SyncError> {
        let mut item: TargetItem =
            serde_json::from_value(JsonValue::Object(template.clone())).map_err(SyncError::Template)?;
        let f = &record.fields;

        item.item_type = ITEM_TYPE.to_string();
        item.title = f.title.clone().unwrap_or_default();
        item.creators = build_creators(f);
        item.abstract_note = text(&f.description);
        item.series_title = f.series_name.first().cloned().unwrap_or_default();
        item.volume = f.volume.clone().or_else(|| f.number.clone()).unwrap_or_default();
        item.number_of_volumes = f.series_count.map(|n| n.to_string()).unwrap_or_default();
        item.video_recording_format = text(&f.format);
        item.place = text(&f.location);
        item.studio = f.publisher.clone().or_else(|| f.provider.clone()).unwrap_or_default();
        item.date = text(&f.year);
        item.running_time = f
            .duration
            .map(|secs| format_duration(secs.max(0.0).round() as u64))
            .unwrap_or_default();
        item.language = text(&f.language);
        item.url = text(&f.url);
        item.access_date = f
            .access_date
            .or(f.created)
            .map(|ts| format_timestamp(ts, self.settings.display_offset))
            .unwrap_or_default();
        item.archive = text(&f.provider);
        item.archive_location = text(&f.external_id);
        item.call_number = text(&f.internal_id);
        item.extra = build_extra(f);
        item.tags = f.tags.iter().map(|tag| ItemTag { tag: tag.clone() }).collect();

        let mut collections = Vec::new();
        if let Some(topic) = f.topic.as_deref().filter(|t| !t.trim().is_empty()) {
            match self.catalog.topic_id(topic) {
                Some(id) => collections.push(id.to_string()),
                None => debug!(record = %record.id, topic, "topic has no collection mapping"),
            }
        }
        let mut unpersisted_series = None;
        if let Some(link) = self.resolve_series(record).await? {
            collections.push(link.collection_id);
            unpersisted_series = link.unpersisted;
        }
        item.collections = collections;
        item.set_token(record.target_token());

        Ok(FormattedItem {
            prepared: PreparedItem {
                source_id: record.id.clone(),
                item,
            },
            unpersisted_series,
        })
    }

    async fn resolve_series(&self, record: &SourceRecord) -> Result<Option<SeriesLink>, SyncError> {
        let f = &record.fields;
        if let Some(cached) = f.series_collection.iter().find(|id| !id.trim().is_empty()) {
            return Ok(Some(SeriesLink::stored(cached.as_str())));
        }
        let Some(name) = f.series_name.first().map(|s| s.trim()).filter(|s| !s.is_empty()) else {
            return Ok(None);
        };

        let lock = self.series.lock_for(name).await;
        let _guard = lock.lock().await;
        if let Some(id) = self.series.resolved(name).await {
            return Ok(Some(SeriesLink::stored(id)));
        }

        let id = self.writer.create_collection(name, CollectionParent::Series).await?;
        let stored = match f.series_record.first() {
            Some(series_row) => {
                let patch = UpdateInstruction::new(series_row.as_str()).with_field(SERIES_COLLECTION_FIELD, id.as_str());
                let report = self.updater.apply(&self.settings.series_table, &[patch]).await;
                if report.is_complete() {
                    info!(series = name, collection = %id, "series collection stored on source row");
                    true
                } else {
                    error!(
                        series = name,
                        collection = %id,
                        errors = ?report.errors,
                        "series collection created but not stored on source row"
                    );
                    false
                }
            }
            None => {
                warn!(series = name, collection = %id, record = %record.id, "series has no linked source row");
                false
            }
        };
        self.series.remember(name, &id).await;
        Ok(Some(SeriesLink {
            collection_id: id,
            unpersisted: (!stored).then(|| name.to_string()),
        }))
    }
}

fn text(value: &Option<String>) -> String {
    value.clone().unwrap_or_default()
}

fn non_blank(value: Option<&String>) -> Option<&str> {
    value.map(|s| s.trim()).filter(|s| !s.is_empty())
}

/// Pair first and last names by position; entries missing a part fall back to a single name.
pub fn build_creators(fields: &RecordFields) -> Vec<Creator> {
    let count = fields
        .presenter_first
        .len()
        .max(fields.presenter_last.len())
        .max(fields.presenter_name.len());

    let mut creators = Vec::with_capacity(count);
    for i in 0..count {
        let first = non_blank(fields.presenter_first.get(i));
        let last = non_blank(fields.presenter_last.get(i));
        match (first, last) {
            (Some(first), Some(last)) => creators.push(Creator::split(first, last)),
            (first, last) => {
                if let Some(name) = non_blank(fields.presenter_name.get(i)).or(first).or(last) {
                    creators.push(Creator::single(name));
                }
            }
        }
    }
    if creators.is_empty() {
        creators.push(Creator::single(UNKNOWN_CREATOR));
    }
    creators
}

/// `Label: value` lines for the supplementary fields that are present.
pub fn build_extra(fields: &RecordFields) -> String {
    let tags = (!fields.tags.is_empty()).then(|| fields.tags.join(", "));
    [
        ("Topic", fields.topic.clone()),
        ("Tags", tags),
        ("Location", fields.location.clone()),
        ("Map Code", fields.map_code.clone()),
        ("Related Link", fields.related_link.clone()),
    ]
    .into_iter()
    .filter_map(|(label, value)| {
        value
            .filter(|v| !v.trim().is_empty())
            .map(|v| format!("{label}: {v}"))
    })
    .collect::<Vec<_>>()
    .join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{catalog, record, SERIES};
    use chrono::{TimeZone, Utc};
    use futures::future::join_all;
    use serde_json::json;
    use vsync_adapters::{video_recording_template, FixtureSource, FixtureTarget, RawRecord};
    use vsync_core::CreatorName;

    struct Rig {
        source: Arc<FixtureSource>,
        target: Arc<FixtureTarget>,
        transformer: Transformer,
        _dir: tempfile::TempDir,
    }

    fn rig(series_rows: Vec<RawRecord>) -> Rig {
        let dir = tempfile::tempdir().unwrap();
        let source = Arc::new(FixtureSource::new().with_table(SERIES, series_rows));
        let target = Arc::new(FixtureTarget::new());
        let catalog = Arc::new(catalog());
        let writer = Arc::new(TargetWriter::new(target.clone(), catalog.clone(), dir.path().join("failed.json")));
        let updater = Arc::new(SourceUpdater::new(source.clone()));
        let transformer = Transformer::new(
            writer,
            updater,
            catalog,
            TransformSettings {
                display_offset: FixedOffset::west_opt(5 * 3600).unwrap(),
                series_table: SERIES.to_string(),
            },
        );
        Rig {
            source,
            target,
            transformer,
            _dir: dir,
        }
    }

    fn series_row(id: &str, name: &str) -> RawRecord {
        RawRecord {
            id: id.to_string(),
            fields: json!({ "name": name }).as_object().cloned().unwrap(),
        }
    }

    #[test]
    fn paired_names_become_split_creators() {
        let fields = RecordFields {
            presenter_first: vec!["Jane".into()],
            presenter_last: vec!["Doe".into()],
            ..Default::default()
        };
        assert_eq!(build_creators(&fields), vec![Creator::split("Jane", "Doe")]);
        assert_eq!(
            serde_json::to_value(&build_creators(&fields)[0]).unwrap(),
            json!({"creatorType": "contributor", "firstName": "Jane", "lastName": "Doe"})
        );
    }

    #[test]
    fn no_presenter_data_yields_unknown() {
        let creators = build_creators(&RecordFields::default());
        assert_eq!(creators.len(), 1);
        assert_eq!(
            creators[0].name,
            CreatorName::Single {
                name: UNKNOWN_CREATOR.to_string()
            }
        );
    }

    #[test]
    fn incomplete_pairs_fall_back_to_single_names() {
        let fields = RecordFields {
            presenter_first: vec!["Jane".into(), "Carl".into(), "".into()],
            presenter_last: vec!["Doe".into()],
            presenter_name: vec!["".into(), "Carl Sagan".into(), "The Narrator".into()],
            ..Default::default()
        };
        assert_eq!(
            build_creators(&fields),
            vec![
                Creator::split("Jane", "Doe"),
                Creator::single("Carl Sagan"),
                Creator::single("The Narrator"),
            ]
        );
    }

    #[test]
    fn extra_lists_present_fields_only() {
        let fields = RecordFields {
            topic: Some("Astronomy".into()),
            tags: vec!["space".into(), "planets".into()],
            map_code: Some("".into()),
            related_link: Some("https://example.org/notes".into()),
            ..Default::default()
        };
        assert_eq!(
            build_extra(&fields),
            "Topic: Astronomy\nTags: space, planets\nRelated Link: https://example.org/notes"
        );
        assert_eq!(build_extra(&RecordFields::default()), "");
    }

    #[tokio::test]
    async fn record_maps_onto_the_template() {
        let rig = rig(Vec::new());
        let mut rec = record("rec1", "Rings of Saturn");
        rec.fields.duration = Some(9244.0);
        rec.fields.topic = Some("astronomy".into());
        rec.fields.year = Some("2019".into());
        rec.fields.created = Some(Utc.with_ymd_and_hms(2020, 12, 7, 21, 55, 43).unwrap());
        rec.fields.url = Some("https://example.org/rings".into());

        let prepared = rig
            .transformer
            .format_item(&rec, &video_recording_template())
            .await
            .unwrap()
            .prepared;
        let item = &prepared.item;
        assert_eq!(prepared.source_id, "rec1");
        assert_eq!(item.title, "Rings of Saturn");
        assert_eq!(item.running_time, "2:34:04");
        assert_eq!(item.access_date, "2020-12-07 16:55:43");
        assert_eq!(item.date, "2019");
        assert_eq!(item.collections, vec!["ASTRO001".to_string()]);
        assert!(!item.is_update());
        assert!(item.other.contains_key("rights"));

        let value = serde_json::to_value(item).unwrap();
        assert!(value.get("key").is_none());
        assert_eq!(value["itemType"], "videoRecording");
    }

    #[tokio::test]
    async fn item_type_is_fixed_whatever_the_template_says() {
        let rig = rig(Vec::new());
        let mut template = video_recording_template();
        template.insert("itemType".to_string(), json!("film"));

        let formatted = rig.transformer.format_item(&record("rec1", "Rings"), &template).await.unwrap();
        assert_eq!(formatted.prepared.item.item_type, ITEM_TYPE);
    }

    #[tokio::test]
    async fn token_on_the_record_makes_an_update_payload() {
        let rig = rig(Vec::new());
        let mut rec = record("rec1", "Rings");
        rec.fields.key = Some("ITEM0042".into());
        rec.fields.version = Some(9);
        rec.fields.topic = Some("Unmapped".into());

        let prepared = rig
            .transformer
            .format_item(&rec, &video_recording_template())
            .await
            .unwrap()
            .prepared;
        assert!(prepared.item.is_update());
        assert_eq!(prepared.item.key.as_deref(), Some("ITEM0042"));
        assert_eq!(prepared.item.version, Some(9));
        assert!(prepared.item.collections.is_empty());
    }

    #[tokio::test]
    async fn cached_series_id_is_reused() {
        let rig = rig(Vec::new());
        let mut rec = record("rec1", "Episode 1");
        rec.fields.series_name = vec!["Cosmos".into()];
        rec.fields.series_collection = vec!["CACHED01".into()];

        let formatted = rig
            .transformer
            .format_item(&rec, &video_recording_template())
            .await
            .unwrap();
        assert_eq!(formatted.prepared.item.collections, vec!["CACHED01".to_string()]);
        assert_eq!(formatted.unpersisted_series, None);
        assert_eq!(rig.target.collection_calls(), 0);
    }

    #[tokio::test]
    async fn concurrent_transforms_create_one_collection_per_series() {
        let rig = rig(vec![series_row("ser1", "Cosmos")]);
        let records: Vec<_> = (1..=6)
            .map(|i| {
                let mut rec = record(&format!("rec{i}"), &format!("Episode {i}"));
                rec.fields.series_name = vec!["Cosmos".into()];
                rec.fields.series_record = vec!["ser1".into()];
                rec
            })
            .collect();
        let template = video_recording_template();

        let formatted: Vec<_> = join_all(records.iter().map(|r| rig.transformer.format_item(r, &template)))
            .await
            .into_iter()
            .map(Result::unwrap)
            .collect();
        assert!(formatted.iter().all(|f| f.unpersisted_series.is_none()));
        let ids: Vec<_> = formatted.into_iter().map(|f| f.prepared.item.collections).collect();

        assert_eq!(rig.target.collection_calls(), 1);
        assert!(ids.iter().all(|c| c == &ids[0]));
        let stored = rig.source.row(SERIES, "ser1").await.unwrap();
        assert_eq!(stored.fields[SERIES_COLLECTION_FIELD], json!(ids[0][0]));
        assert_eq!(rig.transformer.series().resolved("Cosmos").await, Some(ids[0][0].clone()));
    }

    #[tokio::test]
    async fn failed_series_back_patch_is_reported_but_collection_is_used() {
        let rig = rig(Vec::new());
        let mut rec = record("rec1", "Episode 1");
        rec.fields.series_name = vec!["Nova".into()];
        rec.fields.series_record = vec!["serMissing".into()];

        let first = rig
            .transformer
            .format_item(&rec, &video_recording_template())
            .await
            .unwrap();
        assert_eq!(first.prepared.item.collections.len(), 1);
        assert_eq!(first.unpersisted_series.as_deref(), Some("Nova"));

        let mut sibling = record("rec2", "Episode 2");
        sibling.fields.series_name = vec!["Nova".into()];
        let second = rig
            .transformer
            .format_item(&sibling, &video_recording_template())
            .await
            .unwrap();
        assert_eq!(second.prepared.item.collections, first.prepared.item.collections);
        assert_eq!(second.unpersisted_series, None);
        assert_eq!(rig.target.collection_calls(), 1);
    }
}
