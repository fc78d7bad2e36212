//! Index management.
//!
//! Index keys use the same prefix rules as sorting: `"-field"` is a
//! descending key, `"field"` or `"+field"` an ascending one.

use std::time::Duration;

use crate::client::Collection;
use crate::context::OpContext;
use crate::error::{QueryError, QueryResult};
use crate::sort::{index_keys, index_name};
use crate::store::{IndexModel, IndexOptions, Request};

/// Index operations on one collection.
#[derive(Debug, Clone)]
pub struct IndexView {
    collection: Collection,
}

impl IndexView {
    pub(crate) fn new(collection: Collection) -> Self {
        Self { collection }
    }

    /// Create an index on prefixed keys and return its name.
    pub async fn create<S: AsRef<str>>(
        &self,
        ctx: &OpContext,
        keys: &[S],
        options: IndexOptions,
    ) -> QueryResult<String> {
        let keys = index_keys(keys);
        if keys.is_empty() {
            return Err(QueryError::usage("an index needs at least one key"));
        }
        let model = IndexModel { keys, options };
        let name = model.name();
        let request = Request::CreateIndexes {
            ns: self.collection.namespace().clone(),
            indexes: vec![model],
        };
        let names = self.collection.execute(ctx, request).await?.into_names()?;
        Ok(names.into_iter().next().unwrap_or(name))
    }

    /// Create a named index.
    pub async fn create_index<S: AsRef<str>>(
        &self,
        ctx: &OpContext,
        name: &str,
        keys: &[S],
    ) -> QueryResult<String> {
        let options = IndexOptions {
            name: Some(name.to_string()),
            ..IndexOptions::default()
        };
        self.create(ctx, keys, options).await
    }

    /// Create a named unique index.
    pub async fn create_unique_index<S: AsRef<str>>(
        &self,
        ctx: &OpContext,
        name: &str,
        keys: &[S],
    ) -> QueryResult<String> {
        let options = IndexOptions {
            name: Some(name.to_string()),
            unique: Some(true),
            ..IndexOptions::default()
        };
        self.create(ctx, keys, options).await
    }

    /// Create a named index whose documents expire `ttl` after the
    /// indexed date.
    pub async fn create_ttl_index<S: AsRef<str>>(
        &self,
        ctx: &OpContext,
        name: &str,
        keys: &[S],
        ttl: Duration,
    ) -> QueryResult<String> {
        let options = IndexOptions {
            name: Some(name.to_string()),
            expire_after: Some(ttl),
            ..IndexOptions::default()
        };
        self.create(ctx, keys, options).await
    }

    /// Drop the index built on these prefixed keys, using the
    /// conventional derived name.
    pub async fn drop_index<S: AsRef<str>>(&self, ctx: &OpContext, keys: &[S]) -> QueryResult<()> {
        let name = index_name(keys);
        if name.is_empty() {
            return Err(QueryError::usage("an index needs at least one key"));
        }
        self.drop(ctx, &name).await
    }

    /// Drop an index by name.
    pub async fn drop(&self, ctx: &OpContext, name: &str) -> QueryResult<()> {
        if name == "*" {
            return Err(QueryError::usage("use drop_all to drop every index"));
        }
        let request = Request::DropIndexes {
            ns: self.collection.namespace().clone(),
            name: name.to_string(),
        };
        self.collection.execute(ctx, request).await?;
        Ok(())
    }

    /// Drop every index except the one on `_id`.
    pub async fn drop_all(&self, ctx: &OpContext) -> QueryResult<()> {
        let request = Request::DropIndexes {
            ns: self.collection.namespace().clone(),
            name: "*".to_string(),
        };
        self.collection.execute(ctx, request).await?;
        Ok(())
    }

    /// Names of the collection's indexes.
    pub async fn list(&self, ctx: &OpContext) -> QueryResult<Vec<String>> {
        let request = Request::ListIndexes {
            ns: self.collection.namespace().clone(),
        };
        self.collection.execute(ctx, request).await?.into_names()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{RecordingStore, client_for};
    use bson::doc;
    use pretty_assertions::assert_eq;

    #[tokio::test]
    async fn test_drop_index_derives_name() {
        let store = RecordingStore::new();
        let client = client_for(store.clone());
        let ctx = OpContext::background();
        client
            .database("app")
            .collection("users")
            .indexes()
            .drop_index(&ctx, &["-age", "name"])
            .await
            .unwrap();

        match store.last_request().unwrap() {
            Request::DropIndexes { name, .. } => assert_eq!(name, "age_-1_name_1"),
            other => panic!("unexpected request {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_create_ttl_index() {
        let store = RecordingStore::new();
        let client = client_for(store.clone());
        let ctx = OpContext::background();
        let name = client
            .database("app")
            .collection("sessions")
            .indexes()
            .create_ttl_index(&ctx, "expiry", &["createdAt"], Duration::from_secs(3600))
            .await
            .unwrap();
        assert_eq!(name, "expiry");

        match store.last_request().unwrap() {
            Request::CreateIndexes { indexes, .. } => {
                assert_eq!(indexes[0].keys, doc! { "createdAt": 1 });
                assert_eq!(indexes[0].options.expire_after, Some(Duration::from_secs(3600)));
            }
            other => panic!("unexpected request {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_create_without_keys_is_usage_error() {
        let client = client_for(RecordingStore::new());
        let ctx = OpContext::background();
        let err = client
            .database("app")
            .collection("users")
            .indexes()
            .create(&ctx, &[] as &[&str], IndexOptions::default())
            .await
            .unwrap_err();
        assert!(err.is_usage());
    }
}
