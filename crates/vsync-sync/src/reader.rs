use std::sync::Arc;

use tracing::{debug, info, warn};
use vsync_adapters::{PageRequest, SourceApi, MAX_PAGE_SIZE};
use vsync_core::{ListFilter, SourceRecord, PROJECTED_FIELDS};
use vsync_storage::{CacheKey, ResponseCache};

use crate::SyncError;

/// One listing request against the video table.
#[derive(Debug, Clone, PartialEq)]
pub struct ListQuery {
    pub filter: ListFilter,
    pub page_size: usize,
    pub max_records: Option<usize>,
    /// 1-based page to return; the whole result is still walked and cached.
    pub page: Option<usize>,
    /// Skip the cache lookup; a successful walk still replaces the entry.
    pub refresh: bool,
}

impl Default for ListQuery {
    fn default() -> Self {
        Self {
            filter: ListFilter::default(),
            page_size: MAX_PAGE_SIZE,
            max_records: None,
            page: None,
            refresh: false,
        }
    }
}

impl ListQuery {
    pub fn max_records(&self) -> Option<usize> {
        self.max_records.filter(|max| *max > 0)
    }

    pub fn page(&self) -> Option<usize> {
        self.page.filter(|page| *page > 0)
    }

    /// Page size actually sent: within the Source limit and never above `max_records`.
    pub fn effective_page_size(&self) -> usize {
        let size = self.page_size.clamp(1, MAX_PAGE_SIZE);
        match self.max_records() {
            Some(max) if max < size => max,
            _ => size,
        }
    }

    fn page_request(&self) -> PageRequest {
        PageRequest {
            page_size: self.effective_page_size(),
            max_records: self.max_records(),
            offset: None,
            predicate: self.filter.predicate(),
            fields: PROJECTED_FIELDS.iter().map(|f| f.to_string()).collect(),
        }
    }
}

/// Sequential walk over the pages of one query.
///
/// Each call to [`PageWalk::next_page`] issues at most one Source request; the
/// walk ends when Source stops returning a continuation offset or
/// `max_records` rows have been yielded.
pub struct PageWalk<'a> {
    api: &'a dyn SourceApi,
    table: &'a str,
    request: PageRequest,
    remaining: Option<usize>,
    pages: usize,
    done: bool,
}

impl<'a> PageWalk<'a> {
    pub fn new(api: &'a dyn SourceApi, table: &'a str, query: &ListQuery) -> Self {
        Self {
            api,
            table,
            request: query.page_request(),
            remaining: query.max_records(),
            pages: 0,
            done: false,
        }
    }

    pub fn pages_fetched(&self) -> usize {
        self.pages
    }

    pub async fn next_page(&mut self) -> Result<Option<Vec<SourceRecord>>, SyncError> {
        if self.done {
            return Ok(None);
        }
        let page = self.api.list_page(self.table, &self.request).await?;
        self.pages += 1;

        let mut rows = page
            .records
            .iter()
            .map(|raw| {
                raw.project(PROJECTED_FIELDS).map_err(|source| SyncError::Decode {
                    id: raw.id.clone(),
                    source,
                })
            })
            .collect::<Result<Vec<_>, _>>()?;

        if let Some(remaining) = self.remaining.as_mut() {
            rows.truncate(*remaining);
            *remaining -= rows.len();
            if *remaining == 0 {
                self.done = true;
            }
        }
        match page.offset {
            Some(offset) if !self.done => self.request.offset = Some(offset),
            _ => self.done = true,
        }
        debug!(table = self.table, page = self.pages, rows = rows.len(), "source page read");
        Ok(Some(rows))
    }
}

/// Cache-first reader over one Source table.
pub struct SourceReader {
    api: Arc<dyn SourceApi>,
    table: String,
    cache: Option<ResponseCache>,
}

impl SourceReader {
    pub fn new(api: Arc<dyn SourceApi>, table: impl Into<String>, cache: Option<ResponseCache>) -> Self {
        Self {
            api,
            table: table.into(),
            cache,
        }
    }

    pub fn table(&self) -> &str {
        &self.table
    }

    pub fn walk<'a>(&'a self, query: &ListQuery) -> PageWalk<'a> {
        PageWalk::new(self.api.as_ref(), &self.table, query)
    }

    /// The page number is not part of the key: every page of a query shares the
    /// cached full result.
    pub fn cache_key(&self, query: &ListQuery) -> CacheKey {
        let mut params = vec![("pageSize".to_string(), query.effective_page_size().to_string())];
        if let Some(max) = query.max_records() {
            params.push(("maxRecords".to_string(), max.to_string()));
        }
        if let Some(ts) = query.filter.created_after {
            params.push(("createdAfter".to_string(), ts.to_rfc3339()));
        }
        if let Some(ts) = query.filter.modified_after {
            params.push(("modifiedAfter".to_string(), ts.to_rfc3339()));
        }
        CacheKey::new(&self.table, &params)
    }

    pub async fn list_records(&self, query: &ListQuery) -> Result<Vec<SourceRecord>, SyncError> {
        let key = self.cache_key(query);

        if let (Some(cache), false) = (&self.cache, query.refresh) {
            if let Some(rows) = cache
                .read::<Vec<SourceRecord>>(&key)
                .await
                .map_err(SyncError::Cache)?
            {
                info!(table = %self.table, signature = key.signature(), rows = rows.len(), "listing served from cache");
                return Ok(select_page(rows, query));
            }
        }

        let mut walk = self.walk(query);
        let mut all = Vec::new();
        let mut requested = None;
        while let Some(rows) = walk.next_page().await? {
            if query.page() == Some(walk.pages_fetched()) {
                requested = Some(rows.clone());
            }
            all.extend(rows);
        }
        info!(
            table = %self.table,
            signature = key.signature(),
            pages = walk.pages_fetched(),
            rows = all.len(),
            "listing fetched from source"
        );

        if let Some(cache) = &self.cache {
            if let Err(err) = cache.write(&key, &all).await {
                warn!(signature = key.signature(), error = %err, "failed to store listing in cache");
            }
        }

        Ok(match query.page() {
            Some(_) => requested.unwrap_or_default(),
            None => all,
        })
    }
}

/// Slice a cached full result the same way Source paginates it.
fn select_page(rows: Vec<SourceRecord>, query: &ListQuery) -> Vec<SourceRecord> {
    match query.page() {
        None => rows,
        Some(page) => rows
            .chunks(query.effective_page_size())
            .nth(page - 1)
            .map(<[SourceRecord]>::to_vec)
            .unwrap_or_default(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{video_rows, VIDEOS};
    use chrono::{TimeZone, Utc};
    use vsync_adapters::FixtureSource;

    fn reader(source: Arc<FixtureSource>, dir: &std::path::Path) -> SourceReader {
        SourceReader::new(source, VIDEOS, Some(ResponseCache::new(dir.join("cache"))))
    }

    #[tokio::test]
    async fn rows_are_capped_by_max_records() {
        let dir = tempfile::tempdir().unwrap();
        let source = Arc::new(FixtureSource::new().with_table(VIDEOS, video_rows(7)));
        let reader = reader(source.clone(), dir.path());

        let query = ListQuery {
            page_size: 2,
            max_records: Some(5),
            ..ListQuery::default()
        };
        let rows = reader.list_records(&query).await.unwrap();
        assert_eq!(rows.len(), 5);
        assert_eq!(source.list_calls(), 3);
        assert_eq!(rows[0].id, "rec01");
        assert_eq!(rows[4].id, "rec05");
    }

    #[tokio::test]
    async fn max_records_below_page_size_clamps_the_page() {
        let query = ListQuery {
            page_size: 50,
            max_records: Some(3),
            ..ListQuery::default()
        };
        assert_eq!(query.effective_page_size(), 3);
        let oversized = ListQuery {
            page_size: 500,
            ..ListQuery::default()
        };
        assert_eq!(oversized.effective_page_size(), MAX_PAGE_SIZE);

        let dir = tempfile::tempdir().unwrap();
        let source = Arc::new(FixtureSource::new().with_table(VIDEOS, video_rows(10)));
        let rows = reader(source.clone(), dir.path()).list_records(&query).await.unwrap();
        assert_eq!(rows.len(), 3);
        assert_eq!(source.list_calls(), 1);
    }

    #[tokio::test]
    async fn page_request_walks_everything_and_caches_the_full_result() {
        let dir = tempfile::tempdir().unwrap();
        let source = Arc::new(FixtureSource::new().with_table(VIDEOS, video_rows(5)));
        let reader = reader(source.clone(), dir.path());

        let query = ListQuery {
            page_size: 2,
            page: Some(2),
            ..ListQuery::default()
        };
        let page = reader.list_records(&query).await.unwrap();
        let ids: Vec<_> = page.iter().map(|r| r.id.as_str()).collect();
        assert_eq!(ids, vec!["rec03", "rec04"]);
        assert_eq!(source.list_calls(), 3);

        let again = reader.list_records(&query).await.unwrap();
        assert_eq!(again, page);
        assert_eq!(source.list_calls(), 3);

        let full = reader
            .list_records(&ListQuery {
                page: None,
                ..query.clone()
            })
            .await
            .unwrap();
        assert_eq!(full.len(), 5);
        assert_eq!(source.list_calls(), 3);

        let past_end = reader
            .list_records(&ListQuery {
                page: Some(9),
                ..query
            })
            .await
            .unwrap();
        assert!(past_end.is_empty());
    }

    #[tokio::test]
    async fn repeated_queries_are_served_identically_from_cache() {
        let dir = tempfile::tempdir().unwrap();
        let source = Arc::new(FixtureSource::new().with_table(VIDEOS, video_rows(4)));
        let reader = reader(source.clone(), dir.path());

        let first = reader.list_records(&ListQuery::default()).await.unwrap();
        let calls = source.list_calls();
        let second = reader.list_records(&ListQuery::default()).await.unwrap();
        assert_eq!(
            serde_json::to_vec(&first).unwrap(),
            serde_json::to_vec(&second).unwrap()
        );
        assert_eq!(source.list_calls(), calls);

        let refreshed = reader
            .list_records(&ListQuery {
                refresh: true,
                ..ListQuery::default()
            })
            .await
            .unwrap();
        assert_eq!(refreshed, first);
        assert_eq!(source.list_calls(), calls + 1);
    }

    #[tokio::test]
    async fn filters_never_share_cache_entries() {
        let dir = tempfile::tempdir().unwrap();
        let source = Arc::new(FixtureSource::new().with_table(VIDEOS, video_rows(6)));
        let reader = reader(source.clone(), dir.path());

        let early = ListQuery {
            filter: ListFilter {
                created_after: Some(Utc.with_ymd_and_hms(2021, 1, 2, 12, 0, 0).unwrap()),
                modified_after: None,
            },
            ..ListQuery::default()
        };
        let late = ListQuery {
            filter: ListFilter {
                created_after: Some(Utc.with_ymd_and_hms(2021, 1, 4, 12, 0, 0).unwrap()),
                modified_after: None,
            },
            ..ListQuery::default()
        };
        assert_ne!(reader.cache_key(&early).digest(), reader.cache_key(&late).digest());

        let early_rows = reader.list_records(&early).await.unwrap();
        let late_rows = reader.list_records(&late).await.unwrap();
        assert_eq!(early_rows.len(), 4);
        assert_eq!(late_rows.len(), 2);
        assert_eq!(source.list_calls(), 2);
    }

    #[tokio::test]
    async fn failed_walk_writes_no_cache_entry() {
        let dir = tempfile::tempdir().unwrap();
        let source = Arc::new(FixtureSource::new().with_table(VIDEOS, video_rows(5)));
        let reader = reader(source.clone(), dir.path());
        let query = ListQuery {
            page_size: 2,
            ..ListQuery::default()
        };

        source.fail_list_call(1).await;
        let err = reader.list_records(&query).await.unwrap_err();
        assert!(matches!(err, SyncError::Api(_)));
        assert!(!dir.path().join("cache").join(format!("{}.json", reader.cache_key(&query).digest())).exists());

        let rows = reader.list_records(&query).await.unwrap();
        assert_eq!(rows.len(), 5);
    }

    #[tokio::test]
    async fn walk_projects_whitelisted_columns_only() {
        let source = FixtureSource::new().with_table(
            VIDEOS,
            vec![vsync_adapters::RawRecord {
                id: "recX".into(),
                fields: serde_json::json!({"title": "Rings", "secretNotes": "drop me"})
                    .as_object()
                    .cloned()
                    .unwrap(),
            }],
        );
        let mut walk = PageWalk::new(&source, VIDEOS, &ListQuery::default());
        let rows = walk.next_page().await.unwrap().unwrap();
        assert_eq!(rows[0].fields.title.as_deref(), Some("Rings"));
        let value = serde_json::to_value(&rows[0]).unwrap();
        assert!(value.get("secretNotes").is_none());
        assert!(walk.next_page().await.unwrap().is_none());
        assert_eq!(walk.pages_fetched(), 1);
    }
}
