//! Distinct values of a field.

use std::time::Duration;

use bson::{Bson, Document};
use serde::de::DeserializeOwned;

use crate::client::Collection;
use crate::context::OpContext;
use crate::error::{QueryError, QueryResult};
use crate::options::{Collation, OptionSet, RequestShape};
use crate::store::Request;

/// Distinct values of one field across the matching documents.
pub struct Distinct {
    collection: Collection,
    ctx: OpContext,
    field: String,
    filter: Document,
    options: OptionSet,
}

impl Distinct {
    pub(crate) fn new(collection: Collection, ctx: OpContext, field: String, filter: Document) -> Self {
        Self {
            collection,
            ctx,
            field,
            filter,
            options: OptionSet::new(),
        }
    }

    /// String comparison rules.
    pub fn collation(mut self, collation: Collation) -> Self {
        self.options.collation = Some(collation);
        self
    }

    /// Server-side time limit.
    pub fn max_time(mut self, limit: Duration) -> Self {
        self.options.max_time = Some(limit);
        self
    }

    /// Fetch the raw values.
    pub async fn apply_raw(self) -> QueryResult<Vec<Bson>> {
        if self.field.is_empty() {
            return Err(QueryError::usage("distinct needs a field name"));
        }
        let request = Request::Distinct {
            ns: self.collection.namespace().clone(),
            field: self.field,
            filter: self.filter,
            options: self.options.compile(RequestShape::Distinct),
        };
        self.collection.execute(&self.ctx, request).await?.into_values()
    }

    /// Fetch the values decoded as `T`.
    pub async fn apply<T: DeserializeOwned>(self) -> QueryResult<Vec<T>> {
        self.apply_raw()
            .await?
            .into_iter()
            .map(|value| bson::from_bson(value).map_err(QueryError::from))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{RecordingStore, client_for};
    use bson::doc;

    #[tokio::test]
    async fn test_empty_field_is_usage_error() {
        let store = RecordingStore::new();
        let client = client_for(store.clone());
        let ctx = OpContext::background();
        let err = client
            .database("app")
            .collection("users")
            .distinct(&ctx, "", doc! {})
            .apply_raw()
            .await
            .unwrap_err();
        assert!(err.is_usage());
        assert!(store.last_request().is_none());
    }

    #[tokio::test]
    async fn test_request_carries_field_and_filter() {
        let store = RecordingStore::new();
        let client = client_for(store.clone());
        let ctx = OpContext::background();
        let values: Vec<String> = client
            .database("app")
            .collection("users")
            .distinct(&ctx, "city", doc! { "active": true })
            .max_time(Duration::from_millis(100))
            .apply()
            .await
            .unwrap();
        assert!(values.is_empty());

        match store.last_request().unwrap() {
            Request::Distinct { field, filter, options, .. } => {
                assert_eq!(field, "city");
                assert_eq!(filter, doc! { "active": true });
                assert_eq!(options.max_time_ms(), Some(100));
            }
            other => panic!("unexpected request {:?}", other),
        }
    }
}
