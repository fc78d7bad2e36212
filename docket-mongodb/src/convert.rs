//! Translation of docket request options into driver option structs.
//!
//! Only options a request actually set are carried over; everything else is
//! left to the driver's defaults.

use bson::{Bson, Document};
use docket_query::{
    Collation, FullDocument, Hint, IndexModel, RequestOptions, ReturnDocument, ServerStatus,
    TopologyKind, WriteModel,
};
use mongodb::change_stream::event::ResumeToken;
use mongodb::options::{
    AggregateOptions, ChangeStreamOptions, CountOptions, DeleteOptions, DistinctOptions,
    FindOneAndDeleteOptions, FindOneAndReplaceOptions, FindOneAndUpdateOptions, FindOneOptions,
    FindOptions, FullDocumentType, InsertManyOptions, ReplaceOptions, UpdateOptions,
};

use crate::error::{MongoError, MongoResult};

fn hint(hint: &Hint) -> mongodb::options::Hint {
    match hint {
        Hint::Name(name) => mongodb::options::Hint::Name(name.clone()),
        Hint::Keys(keys) => mongodb::options::Hint::Keys(keys.clone()),
    }
}

fn collation(options: &RequestOptions) -> MongoResult<Option<mongodb::options::Collation>> {
    options
        .collation
        .as_ref()
        .map(|c: &Collation| bson::from_document(c.to_document()).map_err(MongoError::from))
        .transpose()
}

fn comment(options: &RequestOptions) -> Option<Bson> {
    options.comment.clone().map(Bson::String)
}

fn sort(options: &RequestOptions) -> Option<Document> {
    options.sort.as_ref().map(|s| s.to_document())
}

/// A find limit the server accepts: zero means none, and the magnitude
/// must fit in a non-negative `i64`.
pub(crate) fn find_limit(limit: Option<i64>) -> Option<i64> {
    limit.filter(|n| *n != 0).map(|n| n.max(-i64::MAX))
}

/// A count limit: the sign is irrelevant, zero means none.
pub(crate) fn count_limit(limit: Option<i64>) -> Option<u64> {
    limit
        .filter(|n| *n != 0)
        .map(|n| n.unsigned_abs().min(i64::MAX as u64))
}

/// Skip counts beyond `i64::MAX` are clamped; the server stores them as
/// signed 64-bit integers.
fn skip(options: &RequestOptions) -> Option<u64> {
    options.skip.map(|n| n.min(i64::MAX as u64))
}

/// Options for a cursor-returning `find`.
pub(crate) fn find_options(options: &RequestOptions) -> MongoResult<FindOptions> {
    let mut out = FindOptions::default();
    out.projection = options.projection.clone();
    out.sort = sort(options);
    out.skip = skip(options);
    out.limit = find_limit(options.limit);
    out.batch_size = options.batch_size;
    out.hint = options.hint.as_ref().map(hint);
    out.collation = collation(options)?;
    out.comment = options.comment.clone();
    out.max_time = options.max_time;
    out.max_await_time = options.max_await_time;
    out.max = options.max.clone();
    out.min = options.min.clone();
    out.allow_disk_use = options.allow_disk_use;
    out.allow_partial_results = options.allow_partial_results;
    out.no_cursor_timeout = options.no_cursor_timeout;
    out.return_key = options.return_key;
    out.show_record_id = options.show_record_id;
    Ok(out)
}

/// Options for `find_one`.
pub(crate) fn find_one_options(options: &RequestOptions) -> MongoResult<FindOneOptions> {
    let mut out = FindOneOptions::default();
    out.projection = options.projection.clone();
    out.sort = sort(options);
    out.skip = skip(options);
    out.hint = options.hint.as_ref().map(hint);
    out.collation = collation(options)?;
    out.comment = options.comment.clone();
    out.max_time = options.max_time;
    out.max = options.max.clone();
    out.min = options.min.clone();
    out.allow_partial_results = options.allow_partial_results;
    out.return_key = options.return_key;
    out.show_record_id = options.show_record_id;
    Ok(out)
}

/// Options for `count_documents`.
pub(crate) fn count_options(options: &RequestOptions) -> MongoResult<CountOptions> {
    let mut out = CountOptions::default();
    out.skip = skip(options);
    out.limit = count_limit(options.limit);
    out.hint = options.hint.as_ref().map(hint);
    out.collation = collation(options)?;
    out.comment = comment(options);
    out.max_time = options.max_time;
    Ok(out)
}

/// Options for `aggregate`.
pub(crate) fn aggregate_options(options: &RequestOptions) -> MongoResult<AggregateOptions> {
    let mut out = AggregateOptions::default();
    out.allow_disk_use = options.allow_disk_use;
    out.batch_size = options.batch_size;
    out.bypass_document_validation = options.bypass_document_validation;
    out.hint = options.hint.as_ref().map(hint);
    out.collation = collation(options)?;
    out.comment = options.comment.clone();
    out.max_time = options.max_time;
    out.max_await_time = options.max_await_time;
    Ok(out)
}

/// Options for `distinct`.
pub(crate) fn distinct_options(options: &RequestOptions) -> MongoResult<DistinctOptions> {
    let mut out = DistinctOptions::default();
    out.collation = collation(options)?;
    out.comment = comment(options);
    out.max_time = options.max_time;
    Ok(out)
}

fn return_document(options: &RequestOptions) -> Option<mongodb::options::ReturnDocument> {
    options.return_document.map(|r| match r {
        ReturnDocument::Before => mongodb::options::ReturnDocument::Before,
        ReturnDocument::After => mongodb::options::ReturnDocument::After,
    })
}

/// Options for `find_one_and_update`.
pub(crate) fn find_one_and_update_options(
    options: &RequestOptions,
) -> MongoResult<FindOneAndUpdateOptions> {
    let mut out = FindOneAndUpdateOptions::default();
    out.array_filters = options.array_filters.clone();
    out.bypass_document_validation = options.bypass_document_validation;
    out.projection = options.projection.clone();
    out.sort = sort(options);
    out.upsert = options.upsert;
    out.return_document = return_document(options);
    out.hint = options.hint.as_ref().map(hint);
    out.collation = collation(options)?;
    out.comment = comment(options);
    out.max_time = options.max_time;
    Ok(out)
}

/// Options for `find_one_and_replace`.
pub(crate) fn find_one_and_replace_options(
    options: &RequestOptions,
) -> MongoResult<FindOneAndReplaceOptions> {
    let mut out = FindOneAndReplaceOptions::default();
    out.bypass_document_validation = options.bypass_document_validation;
    out.projection = options.projection.clone();
    out.sort = sort(options);
    out.upsert = options.upsert;
    out.return_document = return_document(options);
    out.hint = options.hint.as_ref().map(hint);
    out.collation = collation(options)?;
    out.comment = comment(options);
    out.max_time = options.max_time;
    Ok(out)
}

/// Options for `find_one_and_delete`.
pub(crate) fn find_one_and_delete_options(
    options: &RequestOptions,
) -> MongoResult<FindOneAndDeleteOptions> {
    let mut out = FindOneAndDeleteOptions::default();
    out.projection = options.projection.clone();
    out.sort = sort(options);
    out.hint = options.hint.as_ref().map(hint);
    out.collation = collation(options)?;
    out.comment = comment(options);
    out.max_time = options.max_time;
    Ok(out)
}

/// A resume token as the driver expects it.
pub(crate) fn resume_token(token: &Document) -> MongoResult<ResumeToken> {
    Ok(bson::from_document(token.clone())?)
}

/// A driver resume token as a plain document.
pub(crate) fn token_document(token: &ResumeToken) -> Option<Document> {
    match bson::to_bson(token) {
        Ok(Bson::Document(doc)) => Some(doc),
        _ => None,
    }
}

/// Options for `watch`.
pub(crate) fn change_stream_options(options: &RequestOptions) -> MongoResult<ChangeStreamOptions> {
    let mut out = ChangeStreamOptions::default();
    out.full_document = options.full_document.and_then(|mode| match mode {
        FullDocument::Default => None,
        FullDocument::UpdateLookup => Some(FullDocumentType::UpdateLookup),
        FullDocument::WhenAvailable => Some(FullDocumentType::WhenAvailable),
        FullDocument::Required => Some(FullDocumentType::Required),
    });
    out.resume_after = options.resume_after.as_ref().map(resume_token).transpose()?;
    out.start_after = options.start_after.as_ref().map(resume_token).transpose()?;
    out.start_at_operation_time = options.start_at_operation_time;
    out.batch_size = options.batch_size;
    out.max_await_time = options.max_await_time;
    out.collation = collation(options)?;
    Ok(out)
}

/// A run of consecutive writes of one bulk batch. Inserts are grouped so
/// they go out as a single `insert_many`; every other model runs alone.
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum WriteRun {
    /// Consecutive inserts starting at model `offset`.
    Insert {
        offset: usize,
        documents: Vec<Document>,
    },
    /// One non-insert model at `index`.
    Single { index: usize, model: WriteModel },
}

/// Split a bulk batch into runs, preserving model order.
pub(crate) fn write_runs(models: Vec<WriteModel>) -> Vec<WriteRun> {
    let mut runs: Vec<WriteRun> = Vec::new();
    for (index, model) in models.into_iter().enumerate() {
        match (model, runs.last_mut()) {
            (WriteModel::InsertOne { document }, Some(WriteRun::Insert { documents, .. })) => {
                documents.push(document);
            }
            (WriteModel::InsertOne { document }, _) => runs.push(WriteRun::Insert {
                offset: index,
                documents: vec![document],
            }),
            (model, _) => runs.push(WriteRun::Single { index, model }),
        }
    }
    runs
}

/// Options for a run of inserts.
pub(crate) fn insert_many_options(options: &RequestOptions) -> InsertManyOptions {
    let mut out = InsertManyOptions::default();
    out.ordered = Some(options.is_ordered());
    out.bypass_document_validation = options.bypass_document_validation;
    out
}

/// Options for one update model.
pub(crate) fn update_options(upsert: bool, options: &RequestOptions) -> UpdateOptions {
    let mut out = UpdateOptions::default();
    out.upsert = Some(upsert);
    out.bypass_document_validation = options.bypass_document_validation;
    out
}

/// Options for one replace model.
pub(crate) fn replace_options(upsert: bool, options: &RequestOptions) -> ReplaceOptions {
    let mut out = ReplaceOptions::default();
    out.upsert = Some(upsert);
    out.bypass_document_validation = options.bypass_document_validation;
    out
}

/// Options for one delete model.
pub(crate) fn delete_options() -> DeleteOptions {
    DeleteOptions::default()
}

/// Index models for `create_indexes`.
pub(crate) fn index_models(indexes: &[IndexModel]) -> Vec<mongodb::IndexModel> {
    indexes
        .iter()
        .map(|index| {
            let mut options = mongodb::options::IndexOptions::default();
            options.name = Some(index.name());
            options.unique = index.options.unique;
            options.sparse = index.options.sparse;
            options.expire_after = index.options.expire_after;

            let mut model = mongodb::IndexModel::default();
            model.keys = index.keys.clone();
            model.options = Some(options);
            model
        })
        .collect()
}

/// Combine `buildInfo` and `hello` replies into a status report.
pub(crate) fn server_status(build_info: &Document, hello: &Document) -> MongoResult<ServerStatus> {
    let version = build_info
        .get_str("version")
        .map_err(|_| MongoError::reply("buildInfo", "missing version"))?
        .to_string();
    let topology = if hello.contains_key("serviceId") {
        TopologyKind::LoadBalanced
    } else if hello.get_str("msg").ok() == Some("isdbgrid") {
        TopologyKind::Sharded
    } else if hello.contains_key("setName") {
        TopologyKind::ReplicaSet
    } else {
        TopologyKind::Single
    };
    Ok(ServerStatus { version, topology })
}

#[cfg(test)]
mod tests {
    use super::*;
    use bson::doc;
    use docket_query::{IndexOptions, SortSpec};
    use pretty_assertions::assert_eq;
    use std::time::Duration;

    #[test]
    fn test_find_options_carry_only_set_fields() {
        let options = RequestOptions {
            sort: Some(SortSpec::parse(["-age"])),
            skip: Some(5),
            limit: Some(10),
            batch_size: Some(20),
            hint: Some(Hint::from("age_1")),
            comment: Some("report".into()),
            ..RequestOptions::default()
        };
        let find = find_options(&options).unwrap();
        assert_eq!(find.sort, Some(doc! { "age": -1 }));
        assert_eq!(find.skip, Some(5));
        assert_eq!(find.limit, Some(10));
        assert_eq!(find.batch_size, Some(20));
        assert_eq!(find.comment.as_deref(), Some("report"));
        assert!(matches!(find.hint, Some(mongodb::options::Hint::Name(ref n)) if n == "age_1"));
        assert!(find.projection.is_none());
        assert!(find.collation.is_none());
        assert!(find.no_cursor_timeout.is_none());
    }

    #[test]
    fn test_extreme_limits_and_skips_are_clamped() {
        assert_eq!(find_limit(Some(i64::MIN)), Some(-i64::MAX));
        assert_eq!(find_limit(Some(-3)), Some(-3));
        assert_eq!(find_limit(Some(0)), None);
        assert_eq!(count_limit(Some(i64::MIN)), Some(i64::MAX as u64));
        assert_eq!(count_limit(Some(-4)), Some(4));
        assert_eq!(count_limit(Some(0)), None);

        let options = RequestOptions {
            skip: Some(u64::MAX),
            limit: Some(i64::MIN),
            ..RequestOptions::default()
        };
        let find = find_options(&options).unwrap();
        assert_eq!(find.skip, Some(i64::MAX as u64));
        assert_eq!(find.limit, Some(-i64::MAX));
        let count = count_options(&options).unwrap();
        assert_eq!(count.skip, Some(i64::MAX as u64));
        assert_eq!(count.limit, Some(i64::MAX as u64));
    }

    #[test]
    fn test_collation_converts() {
        let options = RequestOptions {
            collation: Some(Collation::new("fr").strength(2).numeric_ordering(true)),
            ..RequestOptions::default()
        };
        let collation = aggregate_options(&options).unwrap().collation.unwrap();
        assert_eq!(collation.locale, "fr");
        assert_eq!(collation.numeric_ordering, Some(true));
        assert!(collation.strength.is_some());
    }

    #[test]
    fn test_find_and_modify_options() {
        let options = RequestOptions {
            return_document: Some(ReturnDocument::After),
            upsert: Some(true),
            projection: Some(doc! { "name": 1 }),
            array_filters: Some(vec![doc! { "x.n": { "$gt": 1 } }]),
            ..RequestOptions::default()
        };
        let update = find_one_and_update_options(&options).unwrap();
        assert!(matches!(update.return_document, Some(mongodb::options::ReturnDocument::After)));
        assert_eq!(update.upsert, Some(true));
        assert_eq!(update.projection, Some(doc! { "name": 1 }));
        assert_eq!(update.array_filters.map(|f| f.len()), Some(1));

        let delete = find_one_and_delete_options(&RequestOptions::default()).unwrap();
        assert!(delete.projection.is_none());
        assert!(delete.sort.is_none());
    }

    #[test]
    fn test_write_runs_group_inserts() {
        let models = vec![
            WriteModel::InsertOne { document: doc! { "_id": 1 } },
            WriteModel::InsertOne { document: doc! { "_id": 2 } },
            WriteModel::UpdateOne { filter: doc! { "_id": 1 }, update: doc! { "$set": { "a": 1 } }, upsert: false },
            WriteModel::DeleteMany { filter: doc! {} },
            WriteModel::InsertOne { document: doc! { "_id": 3 } },
        ];
        let runs = write_runs(models);
        assert_eq!(runs.len(), 4);
        assert_eq!(
            runs[0],
            WriteRun::Insert { offset: 0, documents: vec![doc! { "_id": 1 }, doc! { "_id": 2 }] }
        );
        assert!(matches!(runs[1], WriteRun::Single { index: 2, .. }));
        assert!(matches!(runs[2], WriteRun::Single { index: 3, model: WriteModel::DeleteMany { .. } }));
        assert_eq!(runs[3], WriteRun::Insert { offset: 4, documents: vec![doc! { "_id": 3 }] });
    }

    #[test]
    fn test_insert_options_follow_ordering() {
        let options = RequestOptions {
            ordered: Some(false),
            bypass_document_validation: Some(true),
            ..RequestOptions::default()
        };
        let insert = insert_many_options(&options);
        assert_eq!(insert.ordered, Some(false));
        assert_eq!(insert.bypass_document_validation, Some(true));
        assert_eq!(insert_many_options(&RequestOptions::default()).ordered, Some(true));
    }

    #[test]
    fn test_index_models() {
        let indexes = vec![IndexModel {
            keys: doc! { "expires": 1 },
            options: IndexOptions {
                expire_after: Some(Duration::from_secs(3600)),
                unique: Some(true),
                ..IndexOptions::default()
            },
        }];
        let models = index_models(&indexes);
        assert_eq!(models[0].keys, doc! { "expires": 1 });
        let options = models[0].options.as_ref().unwrap();
        assert_eq!(options.name.as_deref(), Some("expires_1"));
        assert_eq!(options.unique, Some(true));
        assert_eq!(options.expire_after, Some(Duration::from_secs(3600)));
    }

    #[test]
    fn test_change_stream_options() {
        let options = RequestOptions {
            full_document: Some(FullDocument::UpdateLookup),
            batch_size: Some(8),
            ..RequestOptions::default()
        };
        let stream = change_stream_options(&options).unwrap();
        assert!(matches!(stream.full_document, Some(FullDocumentType::UpdateLookup)));
        assert_eq!(stream.batch_size, Some(8));
        assert!(stream.resume_after.is_none());

        let default = RequestOptions {
            full_document: Some(FullDocument::Default),
            ..RequestOptions::default()
        };
        assert!(change_stream_options(&default).unwrap().full_document.is_none());
    }

    #[test]
    fn test_resume_token_round_trips() {
        let token = doc! { "_data": "8263A1" };
        let driver = resume_token(&token).unwrap();
        assert_eq!(token_document(&driver), Some(token));
    }

    #[test]
    fn test_server_status_topology() {
        let build = doc! { "version": "7.0.2", "ok": 1 };
        let status = server_status(&build, &doc! { "setName": "rs0", "isWritablePrimary": true }).unwrap();
        assert_eq!(status.topology, TopologyKind::ReplicaSet);
        assert_eq!(status.version, "7.0.2");

        let status = server_status(&build, &doc! { "msg": "isdbgrid" }).unwrap();
        assert_eq!(status.topology, TopologyKind::Sharded);

        let status = server_status(&build, &doc! { "isWritablePrimary": true }).unwrap();
        assert_eq!(status.topology, TopologyKind::Single);

        assert!(server_status(&doc! {}, &doc! {}).is_err());
    }
}
