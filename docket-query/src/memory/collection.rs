//! One collection's documents and indexes, and the operations on them.

use bson::{Bson, Document};

use super::compare::{bson_eq, collect_path, get_path};
use super::events::Change;
use super::matcher::matches;
use super::pipeline::{compare_by_keys, project, run_pipeline, sort_documents, spec_keys};
use super::update::{apply_replacement, apply_update, upsert_seed, validate_replacement, validate_update};
use crate::error::{QueryError, QueryResult};
use crate::oid::ensure_id;
use crate::options::{RequestOptions, ReturnDocument};
use crate::store::{BulkResult, IndexModel, Modification, WriteModel};

/// Name of the implicit index on `_id`.
pub(crate) const ID_INDEX: &str = "_id_";

const INDEX_NOT_FOUND: i32 = 27;
const INVALID_OPTIONS: i32 = 72;
const INDEX_KEY_SPECS_CONFLICT: i32 = 86;

#[derive(Debug, Clone, Default)]
pub(crate) struct CollectionData {
    pub(crate) docs: Vec<Document>,
    pub(crate) indexes: Vec<IndexModel>,
    /// Bumped on every committed write; transactions compare it on commit.
    pub(crate) version: u64,
}

impl CollectionData {
    fn matching(&self, filter: &Document) -> QueryResult<Vec<usize>> {
        let mut hits = Vec::new();
        for (i, doc) in self.docs.iter().enumerate() {
            if matches(doc, filter)? {
                hits.push(i);
            }
        }
        Ok(hits)
    }

    fn first_match(&self, filter: &Document, options: &RequestOptions) -> QueryResult<Option<usize>> {
        let mut hits = self.matching(filter)?;
        if let Some(sort) = &options.sort {
            let keys = spec_keys(sort);
            hits.sort_by(|a, b| compare_by_keys(&self.docs[*a], &self.docs[*b], &keys));
        }
        Ok(hits.first().copied())
    }

    fn shape(doc: Document, options: &RequestOptions) -> QueryResult<Document> {
        match &options.projection {
            Some(projection) => project(&doc, projection),
            None => Ok(doc),
        }
    }

    /// Matching documents after sort, skip, limit and projection.
    pub(crate) fn find(&self, filter: &Document, options: &RequestOptions) -> QueryResult<Vec<Document>> {
        let mut docs: Vec<Document> = self
            .matching(filter)?
            .into_iter()
            .map(|i| self.docs[i].clone())
            .collect();
        if let Some(sort) = &options.sort {
            sort_documents(&mut docs, &spec_keys(sort));
        }
        let skip = options.skip.unwrap_or(0) as usize;
        let limit = match options.limit {
            Some(n) if n != 0 => n.unsigned_abs() as usize,
            _ => usize::MAX,
        };
        docs.into_iter()
            .skip(skip)
            .take(limit)
            .map(|doc| Self::shape(doc, options))
            .collect()
    }

    pub(crate) fn count(&self, filter: &Document, options: &RequestOptions) -> QueryResult<u64> {
        let n = self.matching(filter)?.len();
        let n = n.saturating_sub(options.skip.unwrap_or(0) as usize);
        let n = match options.limit {
            Some(limit) if limit != 0 => n.min(limit.unsigned_abs() as usize),
            _ => n,
        };
        Ok(n as u64)
    }

    /// Distinct values at `field`; array values contribute their elements.
    pub(crate) fn distinct(&self, field: &str, filter: &Document) -> QueryResult<Vec<Bson>> {
        let mut out: Vec<Bson> = Vec::new();
        for i in self.matching(filter)? {
            for value in collect_path(&self.docs[i], field) {
                let values = match value {
                    Bson::Array(items) => items,
                    other => vec![other],
                };
                for value in values {
                    if !out.iter().any(|seen| bson_eq(seen, &value)) {
                        out.push(value);
                    }
                }
            }
        }
        Ok(out)
    }

    pub(crate) fn aggregate(&self, pipeline: &[Document]) -> QueryResult<Vec<Document>> {
        run_pipeline(self.docs.clone(), pipeline)
    }

    fn unique_key(index: &IndexModel, doc: &Document) -> Option<Vec<Bson>> {
        let values: Vec<Option<&Bson>> = index.keys.keys().map(|path| get_path(doc, path)).collect();
        if index.options.sparse == Some(true) && values.iter().all(Option::is_none) {
            return None;
        }
        Some(values.into_iter().map(|v| v.cloned().unwrap_or(Bson::Null)).collect())
    }

    fn check_unique(&self, candidate: &Document, skip: Option<usize>) -> QueryResult<()> {
        let others = self
            .docs
            .iter()
            .enumerate()
            .filter(|(i, _)| Some(*i) != skip)
            .map(|(_, doc)| doc);

        let id = candidate.get("_id");
        for other in others.clone() {
            if let (Some(a), Some(b)) = (id, other.get("_id")) {
                if bson_eq(a, b) {
                    return Err(QueryError::duplicate_key(format!(
                        "E11000 duplicate key error index: {} dup key: {{ _id: {} }}",
                        ID_INDEX, a
                    )));
                }
            }
        }

        for index in self.indexes.iter().filter(|ix| ix.options.unique == Some(true)) {
            let Some(key) = Self::unique_key(index, candidate) else {
                continue;
            };
            for other in others.clone() {
                let clash = Self::unique_key(index, other).is_some_and(|theirs| {
                    theirs.len() == key.len() && theirs.iter().zip(&key).all(|(a, b)| bson_eq(a, b))
                });
                if clash {
                    return Err(QueryError::duplicate_key(format!(
                        "E11000 duplicate key error index: {} dup key: {:?}",
                        index.name(),
                        key
                    )));
                }
            }
        }
        Ok(())
    }

    fn insert(&mut self, mut doc: Document, changes: &mut Vec<Change>) -> QueryResult<Bson> {
        let id = ensure_id(&mut doc);
        self.check_unique(&doc, None)?;
        changes.push(Change::insert(id.clone(), doc.clone()));
        self.docs.push(doc);
        Ok(id)
    }

    /// Store `next` at `index`. Returns whether the document changed.
    fn store_at(&mut self, index: usize, next: Document, replace: bool, changes: &mut Vec<Change>) -> QueryResult<bool> {
        if self.docs[index] == next {
            return Ok(false);
        }
        self.check_unique(&next, Some(index))?;
        let id = next.get("_id").cloned().unwrap_or(Bson::Null);
        let change = if replace {
            Change::replace(id, next.clone())
        } else {
            Change::update(id, &self.docs[index], next.clone())
        };
        changes.push(change);
        self.docs[index] = next;
        Ok(true)
    }

    fn upsert_document(filter: &Document, modification: &Modification) -> QueryResult<Document> {
        let seed = upsert_seed(filter)?;
        match modification {
            Modification::Update(update) => {
                let mut doc = seed;
                apply_update(&mut doc, update, true)?;
                Ok(doc)
            }
            Modification::Replace(replacement) => {
                let mut doc = Document::new();
                if let Some(id) = replacement.get("_id").or_else(|| seed.get("_id")) {
                    doc.insert("_id", id.clone());
                }
                for (key, value) in replacement {
                    if key != "_id" {
                        doc.insert(key.clone(), value.clone());
                    }
                }
                Ok(doc)
            }
            Modification::Delete => Err(QueryError::internal("delete cannot upsert")),
        }
    }

    /// Apply one write of a bulk batch.
    pub(crate) fn write(
        &mut self,
        model: &WriteModel,
        index: usize,
        result: &mut BulkResult,
        changes: &mut Vec<Change>,
    ) -> QueryResult<()> {
        match model {
            WriteModel::InsertOne { document } => {
                let id = self.insert(document.clone(), changes)?;
                result.inserted_count += 1;
                result.inserted_ids.insert(index, id);
            }
            WriteModel::UpdateOne { filter, update, upsert } | WriteModel::UpdateMany { filter, update, upsert } => {
                validate_update(update)?;
                let many = matches!(model, WriteModel::UpdateMany { .. });
                let mut hits = self.matching(filter)?;
                if !many {
                    hits.truncate(1);
                }
                if hits.is_empty() && *upsert {
                    let doc = Self::upsert_document(filter, &Modification::Update(update.clone()))?;
                    let id = self.insert(doc, changes)?;
                    result.upserted_count += 1;
                    result.upserted_ids.insert(index, id);
                }
                for i in hits {
                    result.matched_count += 1;
                    let mut next = self.docs[i].clone();
                    apply_update(&mut next, update, false)?;
                    if self.store_at(i, next, false, changes)? {
                        result.modified_count += 1;
                    }
                }
            }
            WriteModel::ReplaceOne { filter, replacement, upsert } => {
                validate_replacement(replacement)?;
                match self.matching(filter)?.first().copied() {
                    Some(i) => {
                        result.matched_count += 1;
                        let next = apply_replacement(&self.docs[i], replacement)?;
                        if self.store_at(i, next, true, changes)? {
                            result.modified_count += 1;
                        }
                    }
                    None if *upsert => {
                        let doc = Self::upsert_document(filter, &Modification::Replace(replacement.clone()))?;
                        let id = self.insert(doc, changes)?;
                        result.upserted_count += 1;
                        result.upserted_ids.insert(index, id);
                    }
                    None => {}
                }
            }
            WriteModel::DeleteOne { filter } | WriteModel::DeleteMany { filter } => {
                let mut hits = self.matching(filter)?;
                if matches!(model, WriteModel::DeleteOne { .. }) {
                    hits.truncate(1);
                }
                for i in hits.into_iter().rev() {
                    let removed = self.docs.remove(i);
                    changes.push(Change::delete(removed.get("_id").cloned().unwrap_or(Bson::Null)));
                    result.deleted_count += 1;
                }
            }
        }
        Ok(())
    }

    /// Atomically modify the first match and return the chosen version.
    pub(crate) fn find_and_modify(
        &mut self,
        filter: &Document,
        modification: &Modification,
        options: &RequestOptions,
        changes: &mut Vec<Change>,
    ) -> QueryResult<Option<Document>> {
        match modification {
            Modification::Update(update) => validate_update(update)?,
            Modification::Replace(replacement) => validate_replacement(replacement)?,
            Modification::Delete => {}
        }
        let after = options.return_document == Some(ReturnDocument::After);

        let Some(i) = self.first_match(filter, options)? else {
            if options.upsert != Some(true) || matches!(modification, Modification::Delete) {
                return Ok(None);
            }
            let doc = Self::upsert_document(filter, modification)?;
            self.insert(doc, changes)?;
            return if after {
                Self::shape(self.docs[self.docs.len() - 1].clone(), options).map(Some)
            } else {
                Ok(None)
            };
        };

        let before = self.docs[i].clone();
        let returned = match modification {
            Modification::Update(update) => {
                let mut next = before.clone();
                apply_update(&mut next, update, false)?;
                self.store_at(i, next.clone(), false, changes)?;
                if after { next } else { before }
            }
            Modification::Replace(replacement) => {
                let next = apply_replacement(&before, replacement)?;
                self.store_at(i, next.clone(), true, changes)?;
                if after { next } else { before }
            }
            Modification::Delete => {
                self.docs.remove(i);
                changes.push(Change::delete(before.get("_id").cloned().unwrap_or(Bson::Null)));
                before
            }
        };
        Self::shape(returned, options).map(Some)
    }

    pub(crate) fn create_indexes(&mut self, indexes: &[IndexModel]) -> QueryResult<Vec<String>> {
        let mut names = Vec::with_capacity(indexes.len());
        for index in indexes {
            let name = index.name();
            if let Some(existing) = self.indexes.iter().find(|ix| ix.name() == name) {
                if existing.keys != index.keys || existing.options.unique != index.options.unique {
                    return Err(QueryError::command(
                        INDEX_KEY_SPECS_CONFLICT,
                        format!("an index named {} already exists with different options", name),
                    ));
                }
                names.push(name);
                continue;
            }
            if index.options.unique == Some(true) {
                let mut seen: Vec<Vec<Bson>> = Vec::new();
                for doc in &self.docs {
                    if let Some(key) = Self::unique_key(index, doc) {
                        if seen.iter().any(|k| k.iter().zip(&key).all(|(a, b)| bson_eq(a, b))) {
                            return Err(QueryError::duplicate_key(format!(
                                "E11000 duplicate key error index: {} dup key: {:?}",
                                name, key
                            )));
                        }
                        seen.push(key);
                    }
                }
            }
            self.indexes.push(index.clone());
            names.push(name);
        }
        Ok(names)
    }

    pub(crate) fn drop_index(&mut self, name: &str) -> QueryResult<()> {
        if name == "*" {
            self.indexes.clear();
            return Ok(());
        }
        if name == ID_INDEX {
            return Err(QueryError::command(INVALID_OPTIONS, "cannot drop _id index"));
        }
        let before = self.indexes.len();
        self.indexes.retain(|ix| ix.name() != name);
        if self.indexes.len() == before {
            return Err(QueryError::command(
                INDEX_NOT_FOUND,
                format!("index not found with name [{}]", name),
            ));
        }
        Ok(())
    }

    pub(crate) fn index_names(&self) -> Vec<String> {
        std::iter::once(ID_INDEX.to_string())
            .chain(self.indexes.iter().map(IndexModel::name))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sort::SortSpec;
    use crate::store::IndexOptions;
    use bson::doc;
    use pretty_assertions::assert_eq;

    fn seeded() -> CollectionData {
        CollectionData {
            docs: vec![
                doc! { "_id": 1, "name": "ada", "age": 36 },
                doc! { "_id": 2, "name": "bob", "age": 25 },
                doc! { "_id": 3, "name": "cyd", "age": 41 },
            ],
            ..CollectionData::default()
        }
    }

    #[test]
    fn test_find_sort_skip_limit_project() {
        let coll = seeded();
        let options = RequestOptions {
            sort: Some(SortSpec::parse(["-age"])),
            skip: Some(1),
            limit: Some(1),
            projection: Some(doc! { "name": 1, "_id": 0 }),
            ..RequestOptions::default()
        };
        assert_eq!(coll.find(&doc! {}, &options).unwrap(), vec![doc! { "name": "ada" }]);
    }

    #[test]
    fn test_count_applies_skip_and_limit() {
        let coll = seeded();
        let options = RequestOptions {
            skip: Some(1),
            limit: Some(5),
            ..RequestOptions::default()
        };
        assert_eq!(coll.count(&doc! {}, &options).unwrap(), 2);
        assert_eq!(coll.count(&doc! { "age": { "$gt": 30 } }, &RequestOptions::default()).unwrap(), 2);
    }

    #[test]
    fn test_duplicate_id_rejected() {
        let mut coll = seeded();
        let mut result = BulkResult::default();
        let mut changes = Vec::new();
        let err = coll
            .write(&WriteModel::InsertOne { document: doc! { "_id": 2 } }, 0, &mut result, &mut changes)
            .unwrap_err();
        assert!(err.is_duplicate_key());
        assert_eq!(coll.docs.len(), 3);
        assert!(changes.is_empty());
    }

    #[test]
    fn test_unique_index_enforced() {
        let mut coll = seeded();
        coll.create_indexes(&[IndexModel {
            keys: doc! { "name": 1 },
            options: IndexOptions { unique: Some(true), ..IndexOptions::default() },
        }])
        .unwrap();
        let mut result = BulkResult::default();
        let err = coll
            .write(
                &WriteModel::UpdateOne { filter: doc! { "_id": 2 }, update: doc! { "$set": { "name": "ada" } }, upsert: false },
                0,
                &mut result,
                &mut Vec::new(),
            )
            .unwrap_err();
        assert!(err.is_duplicate_key());
        assert_eq!(coll.docs[1].get_str("name").unwrap(), "bob");
    }

    #[test]
    fn test_update_many_and_upsert() {
        let mut coll = seeded();
        let mut result = BulkResult::default();
        let mut changes = Vec::new();
        coll.write(
            &WriteModel::UpdateMany { filter: doc! { "age": { "$gt": 30 } }, update: doc! { "$inc": { "age": 1 } }, upsert: false },
            0,
            &mut result,
            &mut changes,
        )
        .unwrap();
        coll.write(
            &WriteModel::UpdateOne { filter: doc! { "_id": 9 }, update: doc! { "$set": { "name": "new" } }, upsert: true },
            1,
            &mut result,
            &mut changes,
        )
        .unwrap();
        assert_eq!(result.matched_count, 2);
        assert_eq!(result.modified_count, 2);
        assert_eq!(result.upserted_ids.get(&1), Some(&Bson::Int32(9)));
        assert_eq!(coll.docs[3], doc! { "_id": 9, "name": "new" });
        assert_eq!(changes.len(), 3);
    }

    #[test]
    fn test_find_and_modify_returns_requested_version() {
        let mut coll = seeded();
        let options = RequestOptions {
            sort: Some(SortSpec::parse(["age"])),
            return_document: Some(ReturnDocument::After),
            ..RequestOptions::default()
        };
        let found = coll
            .find_and_modify(&doc! {}, &Modification::Update(doc! { "$set": { "seen": true } }), &options, &mut Vec::new())
            .unwrap();
        assert_eq!(found, Some(doc! { "_id": 2, "name": "bob", "age": 25, "seen": true }));

        let deleted = coll
            .find_and_modify(&doc! { "_id": 3 }, &Modification::Delete, &RequestOptions::default(), &mut Vec::new())
            .unwrap();
        assert_eq!(deleted.unwrap().get_i32("_id").unwrap(), 3);
        assert_eq!(coll.docs.len(), 2);
    }

    #[test]
    fn test_drop_index_errors() {
        let mut coll = seeded();
        assert_eq!(coll.drop_index("nope").unwrap_err().server_code, Some(INDEX_NOT_FOUND));
        assert!(coll.drop_index(ID_INDEX).is_err());
        assert_eq!(coll.index_names(), vec![ID_INDEX.to_string()]);
    }
}
