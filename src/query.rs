//! Document queries: filters, history modes, ordering, and cursors.
//!
//! A query runs in two phases: in `Latest` history mode the per-path winner
//! is chosen *before* the filter is applied, so a filter can only narrow the
//! winner set, never promote a losing document into looking like the winner.

use serde::{Deserialize, Serialize};

use crate::{
    document::Document,
    keys::AuthorAddress,
};

/// Which documents of a path's history a query sees.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum HistoryMode {
    /// Every surviving document, one per (path, author).
    #[default]
    All,
    /// Only the per-path winner under the `(timestamp, signature)` order.
    Latest,
}

/// Orderings a query can ask for.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrderBy {
    /// Path ascending, ties broken by timestamp descending.
    #[default]
    Path,
    /// Local index ascending. This is the sync cursor order.
    LocalIndexAsc,
    /// Local index descending.
    LocalIndexDesc,
}

/// Pagination cursor: results strictly after this point, in query order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum StartAfter {
    /// Skip documents with a path less than or equal to this one.
    Path(String),
    /// Skip documents with a local index at or before this one (in the
    /// direction of the ordering).
    LocalIndex(u64),
}

/// Document filter. All set conditions must hold.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Filter {
    /// Exact path match.
    pub path: Option<String>,
    /// Path prefix match.
    pub path_starts_with: Option<String>,
    /// Path suffix match.
    pub path_ends_with: Option<String>,
    /// Exact author match.
    pub author: Option<AuthorAddress>,
    /// Timestamp strictly greater than.
    pub timestamp_gt: Option<u64>,
    /// Timestamp strictly less than.
    pub timestamp_lt: Option<u64>,
    /// Content length strictly greater than.
    pub content_length_gt: Option<u64>,
    /// Content length strictly less than.
    pub content_length_lt: Option<u64>,
}

impl Filter {
    /// Test whether a document passes every set condition.
    pub fn matches(&self, doc: &Document) -> bool {
        if let Some(path) = &self.path {
            if &doc.path != path {
                return false;
            }
        }
        if let Some(prefix) = &self.path_starts_with {
            if !doc.path.starts_with(prefix.as_str()) {
                return false;
            }
        }
        if let Some(suffix) = &self.path_ends_with {
            if !doc.path.ends_with(suffix.as_str()) {
                return false;
            }
        }
        if let Some(author) = &self.author {
            if &doc.author != author {
                return false;
            }
        }
        if let Some(gt) = self.timestamp_gt {
            if doc.timestamp <= gt {
                return false;
            }
        }
        if let Some(lt) = self.timestamp_lt {
            if doc.timestamp >= lt {
                return false;
            }
        }
        if let Some(gt) = self.content_length_gt {
            if doc.content_len() <= gt {
                return false;
            }
        }
        if let Some(lt) = self.content_length_lt {
            if doc.content_len() >= lt {
                return false;
            }
        }
        true
    }
}

/// A document query.
///
/// Build one with [`Query::all`] or [`Query::latest_per_path`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Query {
    pub(crate) history: HistoryMode,
    pub(crate) order_by: OrderBy,
    pub(crate) filter: Filter,
    pub(crate) start_after: Option<StartAfter>,
    pub(crate) limit: Option<usize>,
}

impl Default for Query {
    fn default() -> Self {
        Query::all().build()
    }
}

impl Query {
    /// Query every surviving document.
    pub fn all() -> QueryBuilder<AllDocs> {
        QueryBuilder::default()
    }

    /// Query only the winner per path, chosen before any filter applies.
    pub fn latest_per_path() -> QueryBuilder<LatestPerPath> {
        QueryBuilder::default()
    }

    /// The history mode of this query.
    pub fn history(&self) -> HistoryMode {
        self.history
    }

    /// The ordering of this query.
    pub fn order_by(&self) -> OrderBy {
        self.order_by
    }

    /// The maximum number of documents to return.
    pub fn limit(&self) -> Option<usize> {
        self.limit
    }
}

/// Marker kind for [`QueryBuilder`]: all surviving documents.
#[derive(Debug, Clone, Copy, Default)]
pub struct AllDocs;

/// Marker kind for [`QueryBuilder`]: per-path winners only.
#[derive(Debug, Clone, Copy, Default)]
pub struct LatestPerPath;

/// Builder for [`Query`].
#[derive(Debug, Clone, Default)]
pub struct QueryBuilder<K> {
    kind: K,
    order_by: OrderBy,
    filter: Filter,
    start_after: Option<StartAfter>,
    limit: Option<usize>,
}

impl<K> QueryBuilder<K> {
    /// Filter by exact path.
    pub fn path_exact(mut self, path: impl Into<String>) -> Self {
        self.filter.path = Some(path.into());
        self
    }

    /// Filter by path prefix.
    pub fn path_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.filter.path_starts_with = Some(prefix.into());
        self
    }

    /// Filter by path suffix.
    pub fn path_suffix(mut self, suffix: impl Into<String>) -> Self {
        self.filter.path_ends_with = Some(suffix.into());
        self
    }

    /// Filter by author.
    pub fn author(mut self, author: AuthorAddress) -> Self {
        self.filter.author = Some(author);
        self
    }

    /// Filter by timestamp strictly greater than `t`.
    pub fn timestamp_gt(mut self, t: u64) -> Self {
        self.filter.timestamp_gt = Some(t);
        self
    }

    /// Filter by timestamp strictly less than `t`.
    pub fn timestamp_lt(mut self, t: u64) -> Self {
        self.filter.timestamp_lt = Some(t);
        self
    }

    /// Filter by content length strictly greater than `len`.
    pub fn content_length_gt(mut self, len: u64) -> Self {
        self.filter.content_length_gt = Some(len);
        self
    }

    /// Filter by content length strictly less than `len`.
    pub fn content_length_lt(mut self, len: u64) -> Self {
        self.filter.content_length_lt = Some(len);
        self
    }

    /// Set the ordering.
    pub fn order_by(mut self, order_by: OrderBy) -> Self {
        self.order_by = order_by;
        self
    }

    /// Return only documents strictly after this path, in query order.
    pub fn start_after_path(mut self, path: impl Into<String>) -> Self {
        self.start_after = Some(StartAfter::Path(path.into()));
        self
    }

    /// Return only documents strictly after this local index, in query order.
    pub fn start_after_local_index(mut self, local_index: u64) -> Self {
        self.start_after = Some(StartAfter::LocalIndex(local_index));
        self
    }

    /// Set the maximum number of documents to return.
    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }
}

impl QueryBuilder<AllDocs> {
    /// Build the query.
    pub fn build(self) -> Query {
        Query {
            history: HistoryMode::All,
            order_by: self.order_by,
            filter: self.filter,
            start_after: self.start_after,
            limit: self.limit,
        }
    }
}

impl QueryBuilder<LatestPerPath> {
    /// Build the query.
    pub fn build(self) -> Query {
        Query {
            history: HistoryMode::Latest,
            order_by: self.order_by,
            filter: self.filter,
            start_after: self.start_after,
            limit: self.limit,
        }
    }
}

/// Run a query over a snapshot of a share's surviving documents.
///
/// Shared by driver implementations so they all agree on the two-phase
/// group-then-filter semantics. `docs` must contain at most one document per
/// (path, author); expired documents are dropped here against `now`.
pub(crate) fn run_query(
    docs: impl IntoIterator<Item = Document>,
    query: &Query,
    now: u64,
) -> Vec<Document> {
    let live = docs.into_iter().filter(|doc| !doc.is_expired(now));

    // Phase one: pick per-path winners before any filtering, so filters
    // cannot resurrect a losing document.
    let mut docs: Vec<Document> = match query.history {
        HistoryMode::All => live.collect(),
        HistoryMode::Latest => {
            let mut winners: Vec<Document> = Vec::new();
            for doc in live {
                match winners.iter_mut().find(|w| w.path == doc.path) {
                    Some(winner) => {
                        if doc.cmp_newer(winner) == std::cmp::Ordering::Greater {
                            *winner = doc;
                        }
                    }
                    None => winners.push(doc),
                }
            }
            winners
        }
    };

    // Phase two: filter, order, cursor, limit.
    docs.retain(|doc| query.filter.matches(doc));

    match query.order_by {
        OrderBy::Path => docs.sort_by(|a, b| {
            a.path
                .cmp(&b.path)
                .then_with(|| b.timestamp.cmp(&a.timestamp))
                .then_with(|| b.signature.cmp(&a.signature))
        }),
        OrderBy::LocalIndexAsc => docs.sort_by_key(|doc| doc.local_index),
        OrderBy::LocalIndexDesc => {
            docs.sort_by_key(|doc| std::cmp::Reverse(doc.local_index))
        }
    }

    if let Some(start_after) = &query.start_after {
        docs.retain(|doc| match start_after {
            StartAfter::Path(path) => doc.path.as_str() > path.as_str(),
            StartAfter::LocalIndex(index) => match query.order_by {
                OrderBy::LocalIndexDesc => doc.local_index < *index,
                _ => doc.local_index > *index,
            },
        });
    }

    if let Some(limit) = query.limit {
        docs.truncate(limit);
    }

    docs
}
