use super::cursor::PullCursor;
use crate::error::{SyncError, SyncResult};
use crate::remote::RemoteFeatures;
use crate::settings::SettingsStore;
use chrono::{DateTime, Utc};
use mobisync_core::{columns, format_timestamp, Filter, OrderBy, QueryDescription, SortDirection};
use tracing::debug;

/// Delta-token bookkeeping of an incremental pull.
#[derive(Debug, Clone, PartialEq)]
pub struct IncrementalState {
    table: String,
    query_id: String,
    original_filter: Option<Filter>,
    ordered: bool,
    delta_token: DateTime<Utc>,
    max_updated_at: DateTime<Utc>,
    filter_token: DateTime<Utc>,
}

impl IncrementalState {
    /// The token the current filter is based on.
    pub fn delta_token(&self) -> DateTime<Utc> {
        self.delta_token
    }

    /// Largest `updatedAt` seen so far.
    pub fn max_updated_at(&self) -> DateTime<Utc> {
        self.max_updated_at
    }

    fn apply_filter(&mut self, query: &mut QueryDescription) {
        self.filter_token = self.delta_token;
        let clause = Filter::ge(columns::UPDATED_AT, format_timestamp(self.delta_token));
        query.filter = Some(match &self.original_filter {
            Some(filter) => filter.clone().and(clause),
            None => clause,
        });
    }

    async fn save_max(&mut self, settings: &dyn SettingsStore) -> SyncResult<bool> {
        if self.max_updated_at <= self.delta_token {
            return Ok(false);
        }
        settings
            .set_delta_token(&self.table, &self.query_id, self.max_updated_at)
            .await?;
        self.delta_token = self.max_updated_at;
        Ok(true)
    }
}

/// Paging policy of a pull.
///
/// `Bounded` pages with skip/top over a fixed query. `Incremental` also
/// restricts the query to rows changed since the saved delta token, and
/// moves the token forward as pages are applied.
#[derive(Debug, Clone, PartialEq)]
pub enum PullStrategy {
    /// Plain skip/top paging.
    Bounded {
        /// Rows per page.
        page_size: u64,
        /// Whether the remote honors skip/top.
        skip_top: bool,
    },
    /// Delta-token paging.
    Incremental {
        /// Rows per page.
        page_size: u64,
        /// Whether the remote honors skip/top.
        skip_top: bool,
        /// Token state.
        state: IncrementalState,
    },
}

impl PullStrategy {
    /// Plain paging over the query.
    pub fn bounded(page_size: u64, features: RemoteFeatures) -> Self {
        PullStrategy::Bounded {
            page_size,
            skip_top: features.skip_top,
        }
    }

    /// Delta-token paging for `query_id`. The token is loaded by
    /// [`initialize`](Self::initialize).
    pub fn incremental(
        page_size: u64,
        features: RemoteFeatures,
        query: &QueryDescription,
        query_id: impl Into<String>,
        ordered: bool,
    ) -> Self {
        PullStrategy::Incremental {
            page_size,
            skip_top: features.skip_top,
            state: IncrementalState {
                table: query.table.clone(),
                query_id: query_id.into(),
                original_filter: query.filter.clone(),
                ordered: ordered && features.ordering,
                delta_token: DateTime::<Utc>::UNIX_EPOCH,
                max_updated_at: DateTime::<Utc>::UNIX_EPOCH,
                filter_token: DateTime::<Utc>::UNIX_EPOCH,
            },
        }
    }

    fn paging(&self) -> (u64, bool) {
        match self {
            PullStrategy::Bounded { page_size, skip_top }
            | PullStrategy::Incremental {
                page_size,
                skip_top,
                ..
            } => (*page_size, *skip_top),
        }
    }

    /// Token state, for incremental pulls.
    pub fn incremental_state(&self) -> Option<&IncrementalState> {
        match self {
            PullStrategy::Incremental { state, .. } => Some(state),
            PullStrategy::Bounded { .. } => None,
        }
    }

    /// Prepares the first request.
    pub async fn initialize(
        &mut self,
        query: &mut QueryDescription,
        cursor: &PullCursor,
        settings: &dyn SettingsStore,
    ) -> SyncResult<()> {
        let (page_size, skip_top) = self.paging();
        if skip_top {
            query.skip = Some(query.skip.unwrap_or(0));
            query.top = Some(
                query
                    .top
                    .unwrap_or(page_size)
                    .min(page_size)
                    .min(cursor.remaining()),
            );
        } else if query.skip.is_some() || query.top.is_some() {
            return Err(SyncError::invalid_operation(format!(
                "table {} does not support skip and top",
                query.table
            )));
        }

        if let PullStrategy::Incremental { state, .. } = self {
            let token = settings.delta_token(&state.table, &state.query_id).await?;
            state.delta_token = token;
            state.max_updated_at = token;
            state.apply_filter(query);
            if state.ordered {
                query.ordering = vec![OrderBy {
                    field: columns::UPDATED_AT.to_string(),
                    direction: SortDirection::Ascending,
                }];
            }
            query.include_deleted = true;
            debug!(
                table = %state.table,
                query_id = %state.query_id,
                token = %token,
                "incremental pull starting"
            );
        }
        Ok(())
    }

    /// Records the `updatedAt` of an applied row.
    pub fn set_updated_at(&mut self, updated_at: DateTime<Utc>) {
        if let PullStrategy::Incremental { state, .. } = self {
            if updated_at > state.max_updated_at {
                state.max_updated_at = updated_at;
            }
        }
    }

    /// Called after a page was written to the store.
    ///
    /// Ordered incremental pulls save the token here, so an interrupted pull
    /// resumes after the last applied page.
    pub async fn on_results_processed(&mut self, settings: &dyn SettingsStore) -> SyncResult<()> {
        if let PullStrategy::Incremental { state, .. } = self {
            if state.ordered {
                state.save_max(settings).await?;
            }
        }
        Ok(())
    }

    /// Prepares the request for the next page when the remote gave no link.
    ///
    /// Returns false when there is nothing more to request.
    pub async fn move_to_next_page(
        &mut self,
        query: &mut QueryDescription,
        cursor: &mut PullCursor,
        settings: &dyn SettingsStore,
    ) -> SyncResult<bool> {
        let (page_size, skip_top) = self.paging();

        if let PullStrategy::Incremental { state, .. } = self {
            // A skip offset means nothing once the filter moves, so restart
            // from the top of the new result set.
            if state.ordered && skip_top && state.max_updated_at > state.filter_token {
                state.save_max(settings).await?;
                state.apply_filter(query);
                cursor.reset();
                query.skip = Some(0);
                query.top = Some(page_size.min(cursor.remaining()));
                return Ok(!cursor.complete());
            }
        }

        if cursor.complete() || !skip_top {
            return Ok(false);
        }
        query.skip = Some(cursor.position());
        query.top = Some(page_size.min(cursor.remaining()));
        Ok(true)
    }

    /// Called once the pull has drained its result set.
    pub async fn pull_complete(&mut self, settings: &dyn SettingsStore) -> SyncResult<()> {
        if let PullStrategy::Incremental { state, .. } = self {
            state.save_max(settings).await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::settings::SyncSettings;
    use chrono::TimeZone;
    use mobisync_core::MemoryStore;
    use std::sync::Arc;

    fn settings() -> SyncSettings {
        SyncSettings::new(Arc::new(MemoryStore::new()))
    }

    fn ts(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap()
    }

    #[tokio::test]
    async fn bounded_clamps_top() {
        let settings = settings();
        let mut query = QueryDescription::new("todo").with_top(500);
        let cursor = PullCursor::new(&query);
        let mut strategy = PullStrategy::bounded(50, RemoteFeatures::default());

        strategy.initialize(&mut query, &cursor, &settings).await.unwrap();
        assert_eq!(query.skip, Some(0));
        assert_eq!(query.top, Some(50));
    }

    #[tokio::test]
    async fn bounded_pages_by_position() {
        let settings = settings();
        let mut query = QueryDescription::new("todo").with_top(120);
        let mut cursor = PullCursor::new(&query);
        let mut strategy = PullStrategy::bounded(50, RemoteFeatures::default());
        strategy.initialize(&mut query, &cursor, &settings).await.unwrap();

        for _ in 0..50 {
            cursor.on_next();
        }
        assert!(strategy
            .move_to_next_page(&mut query, &mut cursor, &settings)
            .await
            .unwrap());
        assert_eq!(query.skip, Some(50));
        assert_eq!(query.top, Some(50));

        for _ in 0..70 {
            cursor.on_next();
        }
        assert!(!strategy
            .move_to_next_page(&mut query, &mut cursor, &settings)
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn skip_top_required_when_requested() {
        let settings = settings();
        let features = RemoteFeatures {
            skip_top: false,
            ..RemoteFeatures::default()
        };

        let mut query = QueryDescription::new("todo").with_top(5);
        let cursor = PullCursor::new(&query);
        let err = PullStrategy::bounded(50, features)
            .initialize(&mut query, &cursor, &settings)
            .await
            .unwrap_err();
        assert!(matches!(err, SyncError::InvalidOperation(_)));

        let mut query = QueryDescription::new("todo");
        let mut cursor = PullCursor::new(&query);
        let mut strategy = PullStrategy::bounded(50, features);
        strategy.initialize(&mut query, &cursor, &settings).await.unwrap();
        assert_eq!(query.top, None);
        assert!(!strategy
            .move_to_next_page(&mut query, &mut cursor, &settings)
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn incremental_rewrites_query() {
        let settings = settings();
        settings.set_delta_token("todo", "all", ts(10)).await.unwrap();

        let original = Filter::eq("done", false);
        let mut query = QueryDescription::new("todo").with_filter(original.clone());
        let cursor = PullCursor::new(&query);
        let mut strategy =
            PullStrategy::incremental(50, RemoteFeatures::default(), &query, "all", true);
        strategy.initialize(&mut query, &cursor, &settings).await.unwrap();

        let expected = original.and(Filter::ge("updatedAt", format_timestamp(ts(10))));
        assert_eq!(query.filter, Some(expected));
        assert_eq!(query.ordering.len(), 1);
        assert_eq!(query.ordering[0].field, "updatedAt");
        assert!(query.include_deleted);
        assert_eq!(strategy.incremental_state().unwrap().delta_token(), ts(10));
    }

    #[tokio::test]
    async fn incremental_advances_token_between_pages() {
        let settings = settings();
        let mut query = QueryDescription::new("todo");
        let mut cursor = PullCursor::new(&query);
        let mut strategy =
            PullStrategy::incremental(2, RemoteFeatures::default(), &query, "all", true);
        strategy.initialize(&mut query, &cursor, &settings).await.unwrap();

        cursor.on_next();
        strategy.set_updated_at(ts(1));
        cursor.on_next();
        strategy.set_updated_at(ts(2));
        strategy.on_results_processed(&settings).await.unwrap();

        assert!(strategy
            .move_to_next_page(&mut query, &mut cursor, &settings)
            .await
            .unwrap());
        assert_eq!(query.skip, Some(0));
        assert_eq!(query.filter, Some(Filter::ge("updatedAt", format_timestamp(ts(2)))));
        assert_eq!(settings.delta_token("todo", "all").await.unwrap(), ts(2));

        // No progress: fall back to skipping past what was read.
        cursor.on_next();
        strategy.set_updated_at(ts(2));
        assert!(strategy
            .move_to_next_page(&mut query, &mut cursor, &settings)
            .await
            .unwrap());
        assert_eq!(query.skip, Some(1));
    }

    #[tokio::test]
    async fn token_never_moves_backwards() {
        let settings = settings();
        settings.set_delta_token("todo", "all", ts(100)).await.unwrap();

        let mut query = QueryDescription::new("todo");
        let cursor = PullCursor::new(&query);
        let mut strategy =
            PullStrategy::incremental(50, RemoteFeatures::default(), &query, "all", true);
        strategy.initialize(&mut query, &cursor, &settings).await.unwrap();

        strategy.set_updated_at(ts(5));
        strategy.pull_complete(&settings).await.unwrap();
        assert_eq!(settings.delta_token("todo", "all").await.unwrap(), ts(100));
    }

    #[tokio::test]
    async fn unordered_saves_only_on_completion() {
        let settings = settings();
        let mut query = QueryDescription::new("todo");
        let cursor = PullCursor::new(&query);
        let mut strategy =
            PullStrategy::incremental(50, RemoteFeatures::default(), &query, "all", false);
        strategy.initialize(&mut query, &cursor, &settings).await.unwrap();
        assert!(query.ordering.is_empty());

        strategy.set_updated_at(ts(7));
        strategy.on_results_processed(&settings).await.unwrap();
        assert_eq!(
            settings.delta_token("todo", "all").await.unwrap(),
            DateTime::<Utc>::UNIX_EPOCH
        );

        strategy.pull_complete(&settings).await.unwrap();
        assert_eq!(settings.delta_token("todo", "all").await.unwrap(), ts(7));
    }
}
