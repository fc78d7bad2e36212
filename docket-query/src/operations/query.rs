//! Find operation for reading documents.

use std::time::Duration;

use bson::Document;
use futures::Stream;
use serde::de::DeserializeOwned;

use crate::client::Collection;
use crate::context::OpContext;
use crate::cursor::Cursor;
use crate::error::{QueryError, QueryResult};
use crate::options::{Collation, Hint, OptionSet, RequestOptions, RequestShape};
use crate::sort::SortSpec;
use crate::store::{CursorRequest, Request};

/// A find over one collection.
///
/// Settings accumulate until a terminal ([`Query::one`], [`Query::all`],
/// [`Query::count`] or [`Query::cursor`]) consumes the builder. Each
/// terminal compiles only the settings its request understands.
///
/// # Example
///
/// ```rust,ignore
/// let users: Vec<User> = client
///     .database("app")
///     .collection("users")
///     .find(&ctx, doc! { "age": { "$gte": 21 } })
///     .sort(["-age", "name"])
///     .skip(10)
///     .limit(10)
///     .all()
///     .await?;
/// ```
pub struct Query {
    collection: Collection,
    ctx: OpContext,
    filter: Document,
    options: OptionSet,
}

impl Query {
    pub(crate) fn new(collection: Collection, ctx: OpContext, filter: Document) -> Self {
        Self {
            collection,
            ctx,
            filter,
            options: OptionSet::new(),
        }
    }

    /// Documents per batch.
    pub fn batch_size(mut self, n: u32) -> Self {
        self.options.batch_size = Some(n);
        self
    }

    /// Index to use.
    pub fn hint(mut self, hint: impl Into<Hint>) -> Self {
        self.options.hint = Some(hint.into());
        self
    }

    /// Maximum number of documents. A negative limit returns a single
    /// batch.
    pub fn limit(mut self, n: i64) -> Self {
        self.options.limit = Some(n);
        self
    }

    /// Fields to include or exclude.
    pub fn select(mut self, projection: Document) -> Self {
        self.options.projection = Some(projection);
        self
    }

    /// Documents to skip.
    pub fn skip(mut self, n: u64) -> Self {
        self.options.skip = Some(n);
        self
    }

    /// Sort order in the sort mini-language (`"-age"`, `"+name"`,
    /// `"$textScore:score"`). Calling it with no fields leaves the current
    /// sort untouched.
    pub fn sort<I, S>(mut self, fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let fields: Vec<S> = fields.into_iter().collect();
        if !fields.is_empty() {
            self.options.sort = Some(SortSpec::parse(fields));
        }
        self
    }

    /// Allow spilling to disk.
    pub fn allow_disk_use(mut self, allow: bool) -> Self {
        self.options.allow_disk_use = Some(allow);
        self
    }

    /// Return partial results when some shards are down.
    pub fn allow_partial_results(mut self, allow: bool) -> Self {
        self.options.allow_partial_results = Some(allow);
        self
    }

    /// String comparison rules.
    pub fn collation(mut self, collation: Collation) -> Self {
        self.options.collation = Some(collation);
        self
    }

    /// Comment attached to the command.
    pub fn comment(mut self, comment: impl Into<String>) -> Self {
        self.options.comment = Some(comment.into());
        self
    }

    /// Exclusive upper index bound.
    pub fn max(mut self, bound: Document) -> Self {
        self.options.max = Some(bound);
        self
    }

    /// Maximum wait for new data on tailable cursors.
    pub fn max_await_time(mut self, wait: Duration) -> Self {
        self.options.max_await_time = Some(wait);
        self
    }

    /// Server-side time limit.
    pub fn max_time(mut self, limit: Duration) -> Self {
        self.options.max_time = Some(limit);
        self
    }

    /// Inclusive lower index bound.
    pub fn min(mut self, bound: Document) -> Self {
        self.options.min = Some(bound);
        self
    }

    /// Disable the idle cursor timeout.
    pub fn no_cursor_timeout(mut self, enabled: bool) -> Self {
        self.options.no_cursor_timeout = Some(enabled);
        self
    }

    /// Return only index keys.
    pub fn return_key(mut self, enabled: bool) -> Self {
        self.options.return_key = Some(enabled);
        self
    }

    /// Include each document's record id.
    pub fn show_record_id(mut self, enabled: bool) -> Self {
        self.options.show_record_id = Some(enabled);
        self
    }

    /// The settings accumulated so far.
    pub fn options(&self) -> &OptionSet {
        &self.options
    }

    /// Compile the settings for `shape` without running anything.
    pub fn compile(&self, shape: RequestShape) -> RequestOptions {
        self.options.compile(shape)
    }

    /// Decode the first matching document. Fails with a no-documents error
    /// when nothing matches.
    pub async fn one<T: DeserializeOwned>(self) -> QueryResult<T> {
        let request = Request::FindOne {
            ns: self.collection.namespace().clone(),
            filter: self.filter,
            options: self.options.compile(RequestShape::FindOne),
        };
        let found = self.collection.execute(&self.ctx, request).await?.into_document()?;
        let document = found.ok_or_else(QueryError::no_documents)?;
        Ok(bson::from_document(document)?)
    }

    /// Decode every matching document.
    pub async fn all<T: DeserializeOwned>(self) -> QueryResult<Vec<T>> {
        let ctx = self.ctx.clone();
        let mut cursor = self.cursor().await;
        let result = cursor.all(&ctx).await;
        if result.is_err() {
            let _ = cursor.close(&ctx).await;
        }
        result
    }

    /// Count matching documents, honoring skip and limit.
    pub async fn count(self) -> QueryResult<u64> {
        let request = Request::Count {
            ns: self.collection.namespace().clone(),
            filter: self.filter,
            options: self.options.compile(RequestShape::Count),
        };
        self.collection.execute(&self.ctx, request).await?.into_count()
    }

    /// Open a cursor over the matching documents. Opening errors are
    /// captured in the cursor.
    pub async fn cursor(self) -> Cursor {
        let request = CursorRequest::Find {
            ns: self.collection.namespace().clone(),
            filter: self.filter,
            options: self.options.compile(RequestShape::Find),
        };
        self.collection.open_cursor(&self.ctx, request).await
    }

    /// Open a cursor and expose it as a stream of decoded documents.
    pub async fn stream<T>(self) -> impl Stream<Item = QueryResult<T>> + Send
    where
        T: DeserializeOwned + Send + 'static,
    {
        let ctx = self.ctx.clone();
        self.cursor().await.into_stream(ctx)
    }
}
