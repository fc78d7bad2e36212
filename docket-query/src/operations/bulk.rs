//! Bulk write batches.

use bson::{Bson, Document, doc};
use serde::Serialize;
use tracing::debug;

use crate::client::Collection;
use crate::context::OpContext;
use crate::error::{QueryError, QueryResult};
use crate::oid::{ensure_id, to_document};
use crate::options::{OptionSet, RequestShape};
use crate::store::{BulkResult, Request, WriteModel};

/// An ordered batch of writes against one collection.
///
/// Documents are encoded as they are added; the first encoding failure is
/// kept and reported by [`Bulk::apply`] without touching the store.
///
/// ```rust,ignore
/// let result = users
///     .bulk(&ctx)
///     .insert_one(&doc! { "_id": "uid3", "name": "carol" })
///     .update_id("uid1", doc! { "$set": { "active": true } })
///     .delete_many(doc! { "expired": true })
///     .ordered(false)
///     .apply()
///     .await?;
/// ```
pub struct Bulk {
    collection: Collection,
    ctx: OpContext,
    models: Vec<WriteModel>,
    options: OptionSet,
    error: Option<QueryError>,
}

impl Bulk {
    pub(crate) fn new(collection: Collection, ctx: OpContext) -> Self {
        Self {
            collection,
            ctx,
            models: Vec::new(),
            options: OptionSet::new(),
            error: None,
        }
    }

    fn encode<T: Serialize + ?Sized>(&mut self, value: &T) -> Option<Document> {
        match to_document(value) {
            Ok(document) => Some(document),
            Err(err) => {
                self.error.get_or_insert(err);
                None
            }
        }
    }

    /// Stop at the first failing write (default) or run every write.
    pub fn ordered(mut self, ordered: bool) -> Self {
        self.options.ordered = Some(ordered);
        self
    }

    /// Skip schema validation.
    pub fn bypass_document_validation(mut self, bypass: bool) -> Self {
        self.options.bypass_document_validation = Some(bypass);
        self
    }

    /// Append a prepared write.
    pub fn add_model(mut self, model: WriteModel) -> Self {
        self.models.push(model);
        self
    }

    /// Number of writes queued.
    pub fn len(&self) -> usize {
        self.models.len()
    }

    /// Whether no write is queued.
    pub fn is_empty(&self) -> bool {
        self.models.is_empty()
    }

    /// Insert a document.
    pub fn insert_one<T: Serialize + ?Sized>(mut self, document: &T) -> Self {
        if let Some(mut document) = self.encode(document) {
            ensure_id(&mut document);
            self.models.push(WriteModel::InsertOne { document });
        }
        self
    }

    /// Insert `document` only if nothing matches `filter`.
    pub fn insert_one_nx<T: Serialize + ?Sized>(mut self, filter: Document, document: &T) -> Self {
        if let Some(document) = self.encode(document) {
            self.models.push(WriteModel::UpdateOne {
                filter,
                update: doc! { "$setOnInsert": document },
                upsert: true,
            });
        }
        self
    }

    /// Replace the first match, inserting when nothing matches.
    pub fn repsert_one<T: Serialize + ?Sized>(mut self, filter: Document, replacement: &T) -> Self {
        if let Some(replacement) = self.encode(replacement) {
            self.models.push(WriteModel::ReplaceOne {
                filter,
                replacement,
                upsert: true,
            });
        }
        self
    }

    /// Replace the first match.
    pub fn replace_one<T: Serialize + ?Sized>(mut self, filter: Document, replacement: &T) -> Self {
        if let Some(replacement) = self.encode(replacement) {
            self.models.push(WriteModel::ReplaceOne {
                filter,
                replacement,
                upsert: false,
            });
        }
        self
    }

    /// Update the first match, inserting when nothing matches.
    pub fn upsert_one(self, filter: Document, update: Document) -> Self {
        self.add_model(WriteModel::UpdateOne {
            filter,
            update,
            upsert: true,
        })
    }

    /// Update the document with `_id`, inserting it when missing.
    pub fn upsert_id(self, id: impl Into<Bson>, update: Document) -> Self {
        self.upsert_one(doc! { "_id": id.into() }, update)
    }

    /// Update every match, inserting when nothing matches.
    pub fn upsert(self, filter: Document, update: Document) -> Self {
        self.add_model(WriteModel::UpdateMany {
            filter,
            update,
            upsert: true,
        })
    }

    /// Update the first match.
    pub fn update_one(self, filter: Document, update: Document) -> Self {
        self.add_model(WriteModel::UpdateOne {
            filter,
            update,
            upsert: false,
        })
    }

    /// Update the document with `_id`.
    pub fn update_id(self, id: impl Into<Bson>, update: Document) -> Self {
        self.update_one(doc! { "_id": id.into() }, update)
    }

    /// Update every match.
    pub fn update_many(self, filter: Document, update: Document) -> Self {
        self.add_model(WriteModel::UpdateMany {
            filter,
            update,
            upsert: false,
        })
    }

    /// Delete the first match.
    pub fn delete_one(self, filter: Document) -> Self {
        self.add_model(WriteModel::DeleteOne { filter })
    }

    /// Delete the document with `_id`.
    pub fn delete_id(self, id: impl Into<Bson>) -> Self {
        self.delete_one(doc! { "_id": id.into() })
    }

    /// Delete every match.
    pub fn delete_many(self, filter: Document) -> Self {
        self.add_model(WriteModel::DeleteMany { filter })
    }

    /// Run the batch. An empty batch is a usage error and never reaches
    /// the store.
    pub async fn apply(self) -> QueryResult<BulkResult> {
        if let Some(err) = self.error {
            return Err(err.with_context("bulk write"));
        }
        if self.models.is_empty() {
            return Err(QueryError::usage("bulk write needs at least one model"));
        }
        debug!(ns = %self.collection.namespace(), writes = self.models.len(), "bulk write");
        let request = Request::BulkWrite {
            ns: self.collection.namespace().clone(),
            models: self.models,
            options: self.options.compile(RequestShape::BulkWrite),
        };
        self.collection.execute(&self.ctx, request).await?.into_bulk()
    }
}
