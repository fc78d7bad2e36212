//! Atomic find-and-modify operations.
//!
//! One builder type serves all three variants; the marker parameter
//! decides which settings are available:
//!
//! | Variant | `upsert` | `return_document` | `array_filters` |
//! |---------|----------|-------------------|-----------------|
//! | [`FindUpdate`] | yes | yes | yes |
//! | [`FindReplace`] | yes | yes | no |
//! | [`FindDelete`] | no | no | no |

use std::marker::PhantomData;
use std::time::Duration;

use bson::Document;
use serde::de::DeserializeOwned;

use crate::client::Collection;
use crate::context::OpContext;
use crate::error::QueryResult;
use crate::options::{Collation, Hint, OptionSet, RequestOptions, RequestShape, ReturnDocument};
use crate::store::{Modification, Request};

/// Marker for update variants.
#[derive(Debug)]
pub enum UpdateKind {}
/// Marker for replace variants.
#[derive(Debug)]
pub enum ReplaceKind {}
/// Marker for delete variants.
#[derive(Debug)]
pub enum DeleteKind {}

/// Find one document, update it, and return it.
pub type FindUpdate = FindAndModify<UpdateKind>;
/// Find one document, replace it, and return it.
pub type FindReplace = FindAndModify<ReplaceKind>;
/// Find one document, delete it, and return it.
pub type FindDelete = FindAndModify<DeleteKind>;

/// An atomic find-and-modify over one collection.
pub struct FindAndModify<K> {
    collection: Collection,
    ctx: OpContext,
    filter: Document,
    modification: QueryResult<Modification>,
    options: OptionSet,
    _kind: PhantomData<K>,
}

impl<K> FindAndModify<K> {
    fn with(collection: Collection, ctx: OpContext, filter: Document, modification: QueryResult<Modification>) -> Self {
        Self {
            collection,
            ctx,
            filter,
            modification,
            options: OptionSet::new(),
            _kind: PhantomData,
        }
    }

    /// Skip schema validation.
    pub fn bypass_document_validation(mut self, bypass: bool) -> Self {
        self.options.bypass_document_validation = Some(bypass);
        self
    }

    /// String comparison rules.
    pub fn collation(mut self, collation: Collation) -> Self {
        self.options.collation = Some(collation);
        self
    }

    /// Index to use.
    pub fn hint(mut self, hint: impl Into<Hint>) -> Self {
        self.options.hint = Some(hint.into());
        self
    }

    /// Server-side time limit.
    pub fn max_time(mut self, limit: Duration) -> Self {
        self.options.max_time = Some(limit);
        self
    }

    /// Fields of the returned document.
    pub fn select(mut self, projection: Document) -> Self {
        self.options.projection = Some(projection);
        self
    }

    /// Which match to modify when several do, in the sort mini-language.
    pub fn sort<I, S>(mut self, fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let fields: Vec<S> = fields.into_iter().collect();
        if !fields.is_empty() {
            self.options.sort = Some(crate::sort::SortSpec::parse(fields));
        }
        self
    }

    /// The compiled options this request would send.
    pub fn compile(&self) -> RequestOptions {
        self.options.compile(RequestShape::FindAndModify)
    }

    /// Run the request and decode the returned document, if any.
    pub async fn apply<T: DeserializeOwned>(self) -> QueryResult<Option<T>> {
        match self.apply_raw().await? {
            Some(document) => Ok(Some(bson::from_document(document)?)),
            None => Ok(None),
        }
    }

    /// Run the request and return the raw document, if any.
    pub async fn apply_raw(self) -> QueryResult<Option<Document>> {
        let modification = self.modification.map_err(|err| err.with_context("find and modify"))?;
        let request = Request::FindAndModify {
            ns: self.collection.namespace().clone(),
            filter: self.filter,
            modification,
            options: self.options.compile(RequestShape::FindAndModify),
        };
        self.collection.execute(&self.ctx, request).await?.into_document()
    }
}

impl FindAndModify<UpdateKind> {
    pub(crate) fn update(collection: Collection, ctx: OpContext, filter: Document, update: Document) -> Self {
        Self::with(collection, ctx, filter, Ok(Modification::Update(update)))
    }

    /// Insert when nothing matches.
    pub fn upsert(mut self, upsert: bool) -> Self {
        self.options.upsert = Some(upsert);
        self
    }

    /// Return the document before or after the update.
    pub fn return_document(mut self, which: ReturnDocument) -> Self {
        self.options.return_document = Some(which);
        self
    }

    /// Filters selecting the array elements to update.
    pub fn array_filters(mut self, filters: Vec<Document>) -> Self {
        self.options.array_filters = Some(filters);
        self
    }
}

impl FindAndModify<ReplaceKind> {
    pub(crate) fn replace(
        collection: Collection,
        ctx: OpContext,
        filter: Document,
        replacement: QueryResult<Document>,
    ) -> Self {
        Self::with(collection, ctx, filter, replacement.map(Modification::Replace))
    }

    /// Insert when nothing matches.
    pub fn upsert(mut self, upsert: bool) -> Self {
        self.options.upsert = Some(upsert);
        self
    }

    /// Return the document before or after the replacement.
    pub fn return_document(mut self, which: ReturnDocument) -> Self {
        self.options.return_document = Some(which);
        self
    }
}

impl FindAndModify<DeleteKind> {
    pub(crate) fn delete(collection: Collection, ctx: OpContext, filter: Document) -> Self {
        Self::with(collection, ctx, filter, Ok(Modification::Delete))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{RecordingStore, client_for};
    use bson::doc;
    use pretty_assertions::assert_eq;

    #[tokio::test]
    async fn test_update_options() {
        let store = RecordingStore::new();
        let client = client_for(store.clone());
        let ctx = OpContext::background();

        let found: Option<Document> = client
            .database("app")
            .collection("counters")
            .find_one_and_update(&ctx, doc! { "_id": "seq" }, doc! { "$inc": { "n": 1 } })
            .upsert(true)
            .return_document(ReturnDocument::After)
            .sort(["-n"])
            .apply()
            .await
            .unwrap();
        assert_eq!(found, None);

        match store.last_request().unwrap() {
            Request::FindAndModify { modification, options, .. } => {
                assert_eq!(modification, Modification::Update(doc! { "$inc": { "n": 1 } }));
                assert_eq!(options.upsert, Some(true));
                assert_eq!(options.return_document, Some(ReturnDocument::After));
                assert_eq!(options.sort.unwrap().to_document(), doc! { "n": -1 });
            }
            other => panic!("unexpected request {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_replace_encoding_error_is_deferred() {
        let store = RecordingStore::new();
        let client = client_for(store.clone());
        let ctx = OpContext::background();

        let err = client
            .database("app")
            .collection("users")
            .find_one_and_replace(&ctx, doc! { "_id": 1 }, &"not a document")
            .apply_raw()
            .await
            .unwrap_err();
        assert_eq!(err.code, crate::ErrorCode::Serialization);
        assert!(store.last_request().is_none());
    }

    #[tokio::test]
    async fn test_delete_has_no_upsert() {
        let store = RecordingStore::new();
        let client = client_for(store.clone());
        let ctx = OpContext::background();
        client
            .database("app")
            .collection("users")
            .find_one_and_delete(&ctx, doc! { "_id": 1 })
            .apply_raw()
            .await
            .unwrap();
        match store.last_request().unwrap() {
            Request::FindAndModify { modification, options, .. } => {
                assert_eq!(modification, Modification::Delete);
                assert_eq!(options.upsert, None);
            }
            other => panic!("unexpected request {:?}", other),
        }
    }
}
