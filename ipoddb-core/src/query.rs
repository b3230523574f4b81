//! In-memory query engine over track snapshots
//!
//! A [`QueryMaker`] collects filters, ordering, a limit and the kind of result
//! wanted, then runs over a slice of tracks. [`QueryMaker::spawn`] runs the
//! same query on a worker thread; the returned [`QueryHandle`] can abort it.
//! Cancellation is cooperative and checked once per record.

use std::cmp::Ordering as CmpOrdering;
use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{Error, Result};
use crate::track::Track;

/// Track attribute a filter, ordering or return value refers to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Field {
    Title,
    Artist,
    Album,
    Genre,
    Composer,
    Comment,
    Path,
    Id,
    Year,
    TrackNumber,
    DiscNumber,
    Length,
    Bitrate,
    SampleRate,
    FileSize,
    PlayCount,
    Rating,
    Bpm,
}

impl Field {
    pub fn is_numeric(self) -> bool {
        !matches!(
            self,
            Field::Title
                | Field::Artist
                | Field::Album
                | Field::Genre
                | Field::Composer
                | Field::Comment
                | Field::Path
        )
    }

    /// Numeric value, `None` for text fields
    pub fn number(self, track: &Track) -> Option<i64> {
        let value = match self {
            Field::Id => track.id as i64,
            Field::Year => track.year as i64,
            Field::TrackNumber => track.track_number as i64,
            Field::DiscNumber => track.disc_number as i64,
            Field::Length => track.length_ms as i64,
            Field::Bitrate => track.bitrate as i64,
            Field::SampleRate => track.sample_rate as i64,
            Field::FileSize => track.file_size as i64,
            Field::PlayCount => track.play_count as i64,
            Field::Rating => track.rating as i64,
            Field::Bpm => track.bpm as i64,
            _ => return None,
        };
        Some(value)
    }

    /// Textual value; numbers are rendered in decimal
    pub fn text(self, track: &Track) -> String {
        match self {
            Field::Title => track.title().to_string(),
            Field::Artist => track.artist().to_string(),
            Field::Album => track.album().to_string(),
            Field::Genre => track.genre().to_string(),
            Field::Composer => track.composer().to_string(),
            Field::Comment => track.comment().to_string(),
            Field::Path => track.path().to_string(),
            numeric => numeric.number(track).unwrap_or_default().to_string(),
        }
    }

    fn compare(self, a: &Track, b: &Track) -> CmpOrdering {
        match (self.number(a), self.number(b)) {
            (Some(x), Some(y)) => x.cmp(&y),
            _ => self
                .text(a)
                .to_lowercase()
                .cmp(&self.text(b).to_lowercase()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TextMatch {
    #[default]
    Contains,
    Equals,
    StartsWith,
    EndsWith,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NumberCompare {
    #[default]
    Equals,
    Less,
    Greater,
}

/// Predicate over a single track
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Filter {
    /// Case-insensitive text match
    Text {
        field: Field,
        value: String,
        #[serde(default)]
        mode: TextMatch,
    },
    Number {
        field: Field,
        value: i64,
        #[serde(default)]
        compare: NumberCompare,
    },
    Not { filter: Box<Filter> },
    All { filters: Vec<Filter> },
    Any { filters: Vec<Filter> },
}

impl Filter {
    pub fn text(field: Field, value: impl Into<String>, mode: TextMatch) -> Self {
        Filter::Text {
            field,
            value: value.into(),
            mode,
        }
    }

    pub fn number(field: Field, value: i64, compare: NumberCompare) -> Self {
        Filter::Number {
            field,
            value,
            compare,
        }
    }

    pub fn matches(&self, track: &Track) -> bool {
        match self {
            Filter::Text { field, value, mode } => {
                let haystack = field.text(track).to_lowercase();
                let needle = value.to_lowercase();
                match mode {
                    TextMatch::Contains => haystack.contains(&needle),
                    TextMatch::Equals => haystack == needle,
                    TextMatch::StartsWith => haystack.starts_with(&needle),
                    TextMatch::EndsWith => haystack.ends_with(&needle),
                }
            }
            Filter::Number {
                field,
                value,
                compare,
            } => match field.number(track) {
                Some(n) => match compare {
                    NumberCompare::Equals => n == *value,
                    NumberCompare::Less => n < *value,
                    NumberCompare::Greater => n > *value,
                },
                None => false,
            },
            Filter::Not { filter } => !filter.matches(track),
            Filter::All { filters } => filters.iter().all(|f| f.matches(track)),
            Filter::Any { filters } => filters.iter().any(|f| f.matches(track)),
        }
    }
}

/// What a query returns
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueryType {
    #[default]
    Tracks,
    Artists,
    Albums,
    Genres,
    Composers,
    Years,
    /// Per-track return values or aggregates
    Custom,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AggregateFunction {
    Count,
    Sum,
    Min,
    Max,
    Average,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Aggregate {
    pub function: AggregateFunction,
    pub field: Field,
}

impl Aggregate {
    /// Rendered result, empty when there is nothing to aggregate
    fn value(&self, tracks: &[&Track]) -> String {
        if self.function == AggregateFunction::Count {
            return tracks.len().to_string();
        }
        let values: Vec<i64> = tracks.iter().filter_map(|t| self.field.number(t)).collect();
        if values.is_empty() {
            return String::new();
        }
        match self.function {
            AggregateFunction::Count => values.len().to_string(),
            AggregateFunction::Sum => values.iter().sum::<i64>().to_string(),
            AggregateFunction::Min => values.iter().min().copied().unwrap_or_default().to_string(),
            AggregateFunction::Max => values.iter().max().copied().unwrap_or_default().to_string(),
            AggregateFunction::Average => {
                (values.iter().sum::<i64>() / values.len() as i64).to_string()
            }
        }
    }
}

/// Complete query description, also the wire form
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Query {
    #[serde(default)]
    pub query_type: QueryType,
    #[serde(default)]
    pub filters: Vec<Filter>,
    /// Match any filter instead of all of them
    #[serde(default)]
    pub match_any: bool,
    #[serde(default)]
    pub order_by: Option<Field>,
    #[serde(default)]
    pub descending: bool,
    #[serde(default)]
    pub limit: Option<usize>,
    /// Per-track values for custom queries
    #[serde(default)]
    pub returns: Vec<Field>,
    /// Aggregates for custom queries, take precedence over `returns`
    #[serde(default)]
    pub aggregates: Vec<Aggregate>,
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct AlbumKey {
    pub artist: String,
    pub album: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "items", rename_all = "snake_case")]
pub enum QueryResult {
    Tracks(Vec<Track>),
    /// Distinct artists, genres or composers
    Values(Vec<String>),
    Albums(Vec<AlbumKey>),
    Years(Vec<u32>),
    /// One row per track, or a single row of aggregates
    Custom(Vec<Vec<String>>),
}

impl QueryResult {
    pub fn len(&self) -> usize {
        match self {
            QueryResult::Tracks(v) => v.len(),
            QueryResult::Values(v) => v.len(),
            QueryResult::Albums(v) => v.len(),
            QueryResult::Years(v) => v.len(),
            QueryResult::Custom(v) => v.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Query builder
#[derive(Debug, Clone, Default)]
pub struct QueryMaker {
    query: Query,
}

impl QueryMaker {
    pub fn new(query_type: QueryType) -> Self {
        Self {
            query: Query {
                query_type,
                ..Query::default()
            },
        }
    }

    pub fn from_query(query: Query) -> Self {
        Self { query }
    }

    pub fn query(&self) -> &Query {
        &self.query
    }

    pub fn add_filter(mut self, filter: Filter) -> Self {
        self.query.filters.push(filter);
        self
    }

    /// Keep only tracks that do not match `filter`
    pub fn exclude_filter(mut self, filter: Filter) -> Self {
        self.query.filters.push(Filter::Not {
            filter: Box::new(filter),
        });
        self
    }

    pub fn match_any(mut self, any: bool) -> Self {
        self.query.match_any = any;
        self
    }

    pub fn order_by(mut self, field: Field, descending: bool) -> Self {
        self.query.order_by = Some(field);
        self.query.descending = descending;
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.query.limit = Some(limit);
        self
    }

    pub fn add_return_value(mut self, field: Field) -> Self {
        self.query.returns.push(field);
        self
    }

    pub fn add_aggregate(mut self, function: AggregateFunction, field: Field) -> Self {
        self.query.aggregates.push(Aggregate { function, field });
        self
    }

    /// Run on the calling thread
    pub fn run(&self, tracks: &[Track]) -> Result<QueryResult> {
        execute(&self.query, tracks, &AtomicBool::new(false))
    }

    /// Run on a worker thread over an owned snapshot
    pub fn spawn(self, tracks: Vec<Track>) -> QueryHandle {
        let cancel = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&cancel);
        let query = self.query;
        let thread = thread::spawn(move || execute(&query, &tracks, &flag));
        QueryHandle {
            cancel,
            thread: Some(thread),
        }
    }
}

/// Cloneable handle that aborts a running query
#[derive(Debug, Clone)]
pub struct AbortHandle(Arc<AtomicBool>);

impl AbortHandle {
    pub fn abort(&self) {
        self.0.store(true, Ordering::SeqCst);
    }
}

/// A query running on a worker thread
///
/// Dropping the handle aborts the query.
#[derive(Debug)]
pub struct QueryHandle {
    cancel: Arc<AtomicBool>,
    thread: Option<JoinHandle<Result<QueryResult>>>,
}

impl QueryHandle {
    pub fn abort(&self) {
        self.cancel.store(true, Ordering::SeqCst);
    }

    pub fn abort_handle(&self) -> AbortHandle {
        AbortHandle(Arc::clone(&self.cancel))
    }

    pub fn is_finished(&self) -> bool {
        self.thread.as_ref().map_or(true, |t| t.is_finished())
    }

    /// Block until the worker is done
    pub fn wait(mut self) -> Result<QueryResult> {
        let thread = self
            .thread
            .take()
            .ok_or_else(|| Error::Internal("query already joined".into()))?;
        thread
            .join()
            .map_err(|_| Error::Internal("query worker panicked".into()))?
    }
}

impl Drop for QueryHandle {
    fn drop(&mut self) {
        if self.thread.is_some() {
            self.abort();
        }
    }
}

fn execute(query: &Query, tracks: &[Track], cancel: &AtomicBool) -> Result<QueryResult> {
    let mut matched: Vec<&Track> = Vec::new();
    for track in tracks {
        if cancel.load(Ordering::Relaxed) {
            debug!("query cancelled after {} of {} tracks", matched.len(), tracks.len());
            return Err(Error::Cancelled);
        }
        if matches_filters(query, track) {
            matched.push(track);
        }
    }

    let result = match query.query_type {
        QueryType::Tracks => {
            sort_tracks(query, &mut matched);
            let tracks = limited(matched, query.limit).into_iter().cloned().collect();
            QueryResult::Tracks(tracks)
        }
        QueryType::Artists => QueryResult::Values(distinct(query, &matched, Field::Artist)),
        QueryType::Genres => QueryResult::Values(distinct(query, &matched, Field::Genre)),
        QueryType::Composers => QueryResult::Values(distinct(query, &matched, Field::Composer)),
        QueryType::Albums => {
            let albums: BTreeSet<AlbumKey> = matched
                .iter()
                .map(|t| AlbumKey {
                    artist: t.artist().to_string(),
                    album: t.album().to_string(),
                })
                .collect();
            QueryResult::Albums(ordered(albums.into_iter().collect(), query))
        }
        QueryType::Years => {
            let years: BTreeSet<u32> = matched
                .iter()
                .map(|t| t.year)
                .filter(|&y| y != 0)
                .collect();
            QueryResult::Years(ordered(years.into_iter().collect(), query))
        }
        QueryType::Custom => {
            if !query.aggregates.is_empty() {
                // aggregates ignore ordering and limit
                let row = query.aggregates.iter().map(|a| a.value(&matched)).collect();
                QueryResult::Custom(vec![row])
            } else {
                sort_tracks(query, &mut matched);
                let rows = limited(matched, query.limit)
                    .into_iter()
                    .map(|t| query.returns.iter().map(|f| f.text(t)).collect())
                    .collect();
                QueryResult::Custom(rows)
            }
        }
    };
    Ok(result)
}

fn matches_filters(query: &Query, track: &Track) -> bool {
    if query.filters.is_empty() {
        return true;
    }
    if query.match_any {
        query.filters.iter().any(|f| f.matches(track))
    } else {
        query.filters.iter().all(|f| f.matches(track))
    }
}

fn sort_tracks(query: &Query, tracks: &mut [&Track]) {
    let Some(field) = query.order_by else {
        return;
    };
    // stable, so equal keys keep snapshot order
    tracks.sort_by(|a, b| {
        let ord = field.compare(a, b);
        if query.descending {
            ord.reverse()
        } else {
            ord
        }
    });
}

fn distinct(query: &Query, tracks: &[&Track], field: Field) -> Vec<String> {
    let values: BTreeSet<String> = tracks
        .iter()
        .map(|t| field.text(t))
        .filter(|v| !v.is_empty())
        .collect();
    ordered(values.into_iter().collect(), query)
}

/// Sorted distinct values, reversed when descending, then limited
fn ordered<T>(mut values: Vec<T>, query: &Query) -> Vec<T> {
    if query.descending {
        values.reverse();
    }
    limited(values, query.limit)
}

fn limited<T>(mut values: Vec<T>, limit: Option<usize>) -> Vec<T> {
    if let Some(limit) = limit {
        values.truncate(limit);
    }
    values
}
