//! Core domain model for VSYNC: source rows, target items, collection kinds and patch batches.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, FixedOffset, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map as JsonMap, Value as JsonValue};
use thiserror::Error;

pub const CRATE_NAME: &str = "vsync-core";

/// Largest number of items either API accepts in one write call.
pub const MAX_BATCH_SIZE: usize = 50;

/// The only Target item type written. [`TargetItem`]'s typed fields belong to it.
pub const ITEM_TYPE: &str = "videoRecording";

/// Literal used when a record carries no presenter data at all.
pub const UNKNOWN_CREATOR: &str = "Unknown";

/// Source columns requested from and projected out of every listing.
pub const PROJECTED_FIELDS: &[&str] = &[
    "key",
    "version",
    "title",
    "url",
    "year",
    "description",
    "duration",
    "format",
    "topic",
    "tags",
    "relatedLink",
    "seriesName",
    "seriesRecord",
    "seriesCollection",
    "seriesCount",
    "volume",
    "number",
    "publisher",
    "presenterFirst",
    "presenterLast",
    "presenterName",
    "language",
    "location",
    "mapCode",
    "provider",
    "externalId",
    "internalId",
    "accessDate",
    "created",
    "modified",
];

/// Column on a series row that caches the Target collection id created for it.
pub const SERIES_COLLECTION_FIELD: &str = "collectionKey";

/// One row of the Source video table, restricted to the projected columns.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceRecord {
    pub id: String,
    #[serde(flatten)]
    pub fields: RecordFields,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RecordFields {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub key: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub version: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none", deserialize_with = "de_opt_text")]
    pub year: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Running time in seconds.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duration: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub format: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub topic: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub related_link: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub series_name: Vec<String>,
    /// Linked row id(s) in the series table.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub series_record: Vec<String>,
    /// Lookup of the collection id already cached on the series row.
    #[serde(skip_serializing_if = "Vec::is_empty", deserialize_with = "de_text_list")]
    pub series_collection: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub series_count: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none", deserialize_with = "de_opt_text")]
    pub volume: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none", deserialize_with = "de_opt_text")]
    pub number: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub publisher: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub presenter_first: Vec<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub presenter_last: Vec<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub presenter_name: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub language: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub location: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub map_code: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub provider: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none", deserialize_with = "de_opt_text")]
    pub external_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none", deserialize_with = "de_opt_text")]
    pub internal_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub access_date: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub created: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub modified: Option<DateTime<Utc>>,
}

impl SourceRecord {
    /// The Target token previously written back onto this row, if both halves are present.
    pub fn target_token(&self) -> Option<(String, u64)> {
        match (&self.fields.key, self.fields.version) {
            (Some(key), Some(version)) if !key.trim().is_empty() => Some((key.clone(), version)),
            _ => None,
        }
    }
}

/// Source columns hold free text, but some tables type ids and years as numbers.
fn de_opt_text<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(match Option::<JsonValue>::deserialize(deserializer)? {
        None | Some(JsonValue::Null) => None,
        Some(JsonValue::String(s)) => Some(s),
        Some(other) => Some(other.to_string()),
    })
}

fn de_text_list<'de, D>(deserializer: D) -> Result<Vec<String>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(match Option::<JsonValue>::deserialize(deserializer)? {
        None | Some(JsonValue::Null) => Vec::new(),
        Some(JsonValue::String(s)) => vec![s],
        Some(JsonValue::Array(values)) => values
            .into_iter()
            .filter_map(|v| match v {
                JsonValue::String(s) => Some(s),
                JsonValue::Null => None,
                other => Some(other.to_string()),
            })
            .collect(),
        Some(other) => vec![other.to_string()],
    })
}

/// Server-side row predicate; at most one is ever sent per query.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RecordPredicate {
    CreatedAfter(DateTime<Utc>),
    ModifiedAfter(DateTime<Utc>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ListFilter {
    pub created_after: Option<DateTime<Utc>>,
    pub modified_after: Option<DateTime<Utc>>,
}

impl ListFilter {
    /// A modification bound wins over a creation bound when both are supplied.
    pub fn predicate(&self) -> Option<RecordPredicate> {
        if let Some(ts) = self.modified_after {
            return Some(RecordPredicate::ModifiedAfter(ts));
        }
        self.created_after.map(RecordPredicate::CreatedAfter)
    }
}

impl RecordPredicate {
    pub fn matches(&self, record: &SourceRecord) -> bool {
        match self {
            Self::CreatedAfter(ts) => record.fields.created.is_some_and(|c| c > *ts),
            Self::ModifiedAfter(ts) => record.fields.modified.is_some_and(|m| m > *ts),
        }
    }
}

/// Patch instruction for a single Source row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UpdateInstruction {
    pub id: String,
    pub fields: JsonMap<String, JsonValue>,
}

impl UpdateInstruction {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            fields: JsonMap::new(),
        }
    }

    pub fn with_field(mut self, name: &str, value: impl Into<JsonValue>) -> Self {
        self.fields.insert(name.to_string(), value.into());
        self
    }

    /// Back-sync patch assigning a Target token onto the originating row.
    pub fn target_token(id: impl Into<String>, key: &str, version: u64) -> Self {
        Self::new(id).with_field("key", key).with_field("version", version)
    }
}

/// Fixed parents of the two-level Target collection hierarchy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CollectionParent {
    Series,
    Topics,
}

impl CollectionParent {
    pub const ALL: [CollectionParent; 2] = [CollectionParent::Series, CollectionParent::Topics];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Series => "series",
            Self::Topics => "topics",
        }
    }
}

impl fmt::Display for CollectionParent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unrecognized collection parent `{0}`")]
pub struct UnknownCollectionParent(pub String);

impl FromStr for CollectionParent {
    type Err = UnknownCollectionParent;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "series" => Ok(Self::Series),
            "topics" => Ok(Self::Topics),
            other => Err(UnknownCollectionParent(other.to_string())),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Creator {
    pub creator_type: String,
    #[serde(flatten)]
    pub name: CreatorName,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum CreatorName {
    #[serde(rename_all = "camelCase")]
    Split { first_name: String, last_name: String },
    Single { name: String },
}

impl Creator {
    pub fn split(first: impl Into<String>, last: impl Into<String>) -> Self {
        Self {
            creator_type: "contributor".to_string(),
            name: CreatorName::Split {
                first_name: first.into(),
                last_name: last.into(),
            },
        }
    }

    pub fn single(name: impl Into<String>) -> Self {
        Self {
            creator_type: "contributor".to_string(),
            name: CreatorName::Single { name: name.into() },
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ItemTag {
    pub tag: String,
}

/// Item payload in the Target schema.
///
/// Fields the engine fills are typed; every other key of the write template is
/// preserved in `other` so the payload stays schema-complete. `key` and
/// `version` form the optimistic-concurrency token and are only serialized on
/// update payloads.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct TargetItem {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub key: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub version: Option<u64>,
    pub item_type: String,
    pub title: String,
    pub creators: Vec<Creator>,
    pub abstract_note: String,
    pub series_title: String,
    pub volume: String,
    pub number_of_volumes: String,
    pub video_recording_format: String,
    pub place: String,
    pub studio: String,
    pub date: String,
    pub running_time: String,
    pub language: String,
    pub url: String,
    pub access_date: String,
    pub archive: String,
    pub archive_location: String,
    pub call_number: String,
    pub extra: String,
    pub collections: Vec<String>,
    pub tags: Vec<ItemTag>,
    #[serde(flatten)]
    pub other: JsonMap<String, JsonValue>,
}

impl TargetItem {
    pub fn is_update(&self) -> bool {
        self.key.is_some() && self.version.is_some()
    }

    pub fn set_token(&mut self, token: Option<(String, u64)>) {
        match token {
            Some((key, version)) => {
                self.key = Some(key);
                self.version = Some(version);
            }
            None => {
                self.key = None;
                self.version = None;
            }
        }
    }
}

/// A transformed item together with the Source row it came from.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PreparedItem {
    pub source_id: String,
    pub item: TargetItem,
}

/// An item Target accepted, with the token it assigned.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WrittenItem {
    pub source_id: String,
    pub key: String,
    pub version: u64,
    /// True when the submitted payload carried no token.
    pub created: bool,
    pub title: String,
    pub url: Option<String>,
}

/// `h:mm:ss`, or `m:ss` below one hour.
pub fn format_duration(total_seconds: u64) -> String {
    let hours = total_seconds / 3600;
    let minutes = (total_seconds % 3600) / 60;
    let seconds = total_seconds % 60;
    if hours > 0 {
        format!("{hours}:{minutes:02}:{seconds:02}")
    } else {
        format!("{minutes}:{seconds:02}")
    }
}

pub fn format_timestamp(ts: DateTime<Utc>, offset: FixedOffset) -> String {
    ts.with_timezone(&offset).format("%Y-%m-%d %H:%M:%S").to_string()
}

/// Number of write calls needed for `len` items.
pub fn batch_count(len: usize) -> usize {
    len.div_ceil(MAX_BATCH_SIZE)
}
