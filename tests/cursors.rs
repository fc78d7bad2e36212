//! End-to-end cursor, change stream and builder tests against the
//! in-memory store.

use std::time::Duration;

use docket::memory::MemoryStore;
use docket::prelude::*;
use docket::{ErrorCode, OperationType};
use futures::StreamExt;
use pretty_assertions::assert_eq;
use serde::Deserialize;

#[derive(Debug, Deserialize, PartialEq)]
struct Person {
    #[serde(rename = "_id")]
    id: i32,
    name: String,
    age: i32,
}

async fn people() -> (Client, Collection) {
    let ctx = OpContext::background();
    let client = Client::connect(MemoryStore::new(), &ctx).await.unwrap();
    let people = client.database("app").collection("people");
    people
        .insert_many(
            &ctx,
            vec![
                doc! { "_id": 1, "name": "ada", "age": 36 },
                doc! { "_id": 2, "name": "bob", "age": 25 },
                doc! { "_id": 3, "name": "cy", "age": 41 },
                doc! { "_id": 4, "name": "dee", "age": 25 },
            ],
        )
        .await
        .unwrap();
    (client, people)
}

#[tokio::test]
async fn test_failed_cursor_is_sticky() {
    let (_, people) = people().await;
    let ctx = OpContext::background();

    let mut cursor = people
        .aggregate(&ctx, vec![doc! { "$bogus": {} }])
        .cursor()
        .await;

    let err = cursor.error().cloned().unwrap();
    assert_eq!(err.code, ErrorCode::InvalidPipeline);
    assert_eq!(cursor.id(), 0);
    assert_eq!(cursor.remaining_batch_length(), 0);
    assert!(!cursor.next(&ctx).await);
    assert!(!cursor.try_next(&ctx).await);
    assert_eq!(cursor.one::<Document>().unwrap_err().code, err.code);
    assert_eq!(cursor.all::<Document>(&ctx).await.unwrap_err().code, err.code);
    assert_eq!(cursor.close(&ctx).await.unwrap_err().code, err.code);
}

#[tokio::test]
async fn test_cursor_walks_batches() {
    let (_, people) = people().await;
    let ctx = OpContext::background();

    let mut cursor = people
        .find(&ctx, doc! {})
        .sort(["-age", "name"])
        .batch_size(2)
        .cursor()
        .await;

    let mut names = Vec::new();
    while cursor.next(&ctx).await {
        let person: Person = cursor.one().unwrap();
        names.push(person.name);
    }
    assert!(cursor.error().is_none());
    assert_eq!(names, vec!["cy", "ada", "bob", "dee"]);
    cursor.close(&ctx).await.unwrap();
    cursor.close(&ctx).await.unwrap();
}

#[tokio::test]
async fn test_find_paging_and_projection() {
    let (_, people) = people().await;
    let ctx = OpContext::background();

    let page: Vec<Document> = people
        .find(&ctx, doc! { "age": { "$gte": 25 } })
        .sort(["_id"])
        .skip(1)
        .limit(2)
        .select(doc! { "name": 1, "_id": 0 })
        .all()
        .await
        .unwrap();
    assert_eq!(page, vec![doc! { "name": "bob" }, doc! { "name": "cy" }]);

    let count = people.find(&ctx, doc! { "age": 25 }).count().await.unwrap();
    assert_eq!(count, 2);

    let err = people.find(&ctx, doc! { "age": 99 }).one::<Person>().await.unwrap_err();
    assert!(err.is_no_documents());
}

#[tokio::test]
async fn test_query_stream() {
    let (_, people) = people().await;
    let ctx = OpContext::background();

    let ids: Vec<i32> = people
        .find(&ctx, doc! { "age": 25 })
        .sort(["_id"])
        .stream::<Person>()
        .await
        .map(|person| person.unwrap().id)
        .collect()
        .await;
    assert_eq!(ids, vec![2, 4]);
}

#[tokio::test]
async fn test_aggregate_group() {
    let (_, people) = people().await;
    let ctx = OpContext::background();

    let groups: Vec<Document> = people
        .aggregate(
            &ctx,
            vec![
                doc! { "$group": { "_id": "$age", "n": { "$sum": 1 } } },
                doc! { "$sort": { "n": -1, "_id": 1 } },
            ],
        )
        .all()
        .await
        .unwrap();
    assert_eq!(groups[0].get_i32("_id").unwrap(), 25);
    assert_eq!(groups.len(), 3);

    let err = people
        .aggregate(&ctx, vec![doc! { "$match": { "age": 99 } }])
        .one::<Document>()
        .await
        .unwrap_err();
    assert!(err.is_no_documents());
}

#[tokio::test]
async fn test_distinct_and_find_and_modify() {
    let (_, people) = people().await;
    let ctx = OpContext::background();

    let mut ages = people.distinct(&ctx, "age", doc! {}).apply_raw().await.unwrap();
    ages.sort_by_key(|age| age.as_i32());
    assert_eq!(ages, vec![Bson::Int32(25), Bson::Int32(36), Bson::Int32(41)]);

    let after: Option<Person> = people
        .find_one_and_update(&ctx, doc! { "_id": 2 }, doc! { "$inc": { "age": 1 } })
        .return_document(ReturnDocument::After)
        .apply()
        .await
        .unwrap();
    assert_eq!(after.map(|p| p.age), Some(26));

    let removed: Option<Person> = people
        .find_one_and_delete(&ctx, doc! { "age": { "$gt": 40 } })
        .apply()
        .await
        .unwrap();
    assert_eq!(removed.map(|p| p.name), Some("cy".to_string()));
    assert_eq!(people.count_documents(&ctx, doc! {}).await.unwrap(), 3);
}

#[tokio::test]
async fn test_bulk_in_transaction() {
    let (client, people) = people().await;
    let ctx = OpContext::background();

    let tx = client.begin(&ctx).await.unwrap();
    let result = people
        .bulk(tx.context())
        .insert_one(&doc! { "_id": 5, "name": "eve", "age": 30 })
        .update_id(1, doc! { "$set": { "age": 37 } })
        .upsert_id(6, doc! { "$set": { "name": "fay", "age": 50 } })
        .delete_id(3)
        .apply()
        .await
        .unwrap();
    assert_eq!(result.inserted_count, 1);
    assert_eq!(result.modified_count, 1);
    assert_eq!(result.upserted_count, 1);
    assert_eq!(result.deleted_count, 1);
    assert_eq!(people.count_documents(&ctx, doc! {}).await.unwrap(), 4);

    tx.commit(&ctx).await.unwrap();
    assert_eq!(people.count_documents(&ctx, doc! {}).await.unwrap(), 5);
}

#[tokio::test]
async fn test_change_stream_sees_committed_writes() {
    let (client, people) = people().await;
    let ctx = OpContext::background();

    let mut stream = people
        .watch(&ctx)
        .pipeline(vec![doc! { "$match": { "operationType": "insert" } }])
        .stream()
        .await;
    assert!(stream.error().is_none());

    let tx = client.begin(&ctx).await.unwrap();
    people
        .insert_one(tx.context(), &doc! { "_id": 7, "name": "gus", "age": 19 })
        .await
        .unwrap();
    assert!(!stream.try_next(&ctx).await);
    tx.commit(&ctx).await.unwrap();

    let waiting = ctx.with_timeout(Duration::from_secs(5));
    assert!(stream.next(&waiting).await);
    let event = stream.event::<Person>().unwrap();
    assert_eq!(event.operation_type, OperationType::Insert);
    assert_eq!(event.document_key, Some(doc! { "_id": 7 }));
    assert_eq!(event.full_document.map(|p| p.name), Some("gus".to_string()));
    assert_eq!(stream.resume_token(), Some(event.id));
    stream.close(&ctx).await.unwrap();
}

#[tokio::test]
async fn test_change_stream_in_transaction_is_sticky() {
    let (client, people) = people().await;
    let ctx = OpContext::background();

    let tx = client.begin(&ctx).await.unwrap();
    let mut stream = people.watch(tx.context()).stream().await;
    assert!(stream.error().is_some());
    assert!(!stream.next(&ctx).await);
    assert!(stream.event::<Document>().is_err());
    tx.rollback(&ctx).await.unwrap();
}
