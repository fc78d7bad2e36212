//! Document identity helpers.

use bson::oid::ObjectId;
use bson::{Bson, Document};
use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::error::{QueryError, QueryResult};

/// Generate a fresh ObjectId.
pub fn new_object_id() -> ObjectId {
    ObjectId::new()
}

/// Parse a 24-character hex ObjectId.
pub fn object_id_from_hex(hex: &str) -> QueryResult<ObjectId> {
    ObjectId::parse_str(hex)
        .map_err(|err| QueryError::decode(format!("invalid ObjectId {:?}: {}", hex, err)))
}

/// Whether `hex` is a well-formed ObjectId.
pub fn is_valid_object_id(hex: &str) -> bool {
    ObjectId::parse_str(hex).is_ok()
}

/// Creation time embedded in an ObjectId.
pub fn object_id_time(id: &ObjectId) -> DateTime<Utc> {
    id.timestamp().to_chrono()
}

/// Return the document's `_id`, inserting a fresh ObjectId first when it
/// has none.
pub fn ensure_id(document: &mut Document) -> Bson {
    if let Some(id) = document.get("_id") {
        return id.clone();
    }
    let id = Bson::ObjectId(ObjectId::new());
    document.insert("_id", id.clone());
    id
}

/// Encode a value as a BSON document.
pub fn to_document<T: Serialize + ?Sized>(value: &T) -> QueryResult<Document> {
    Ok(bson::to_document(value)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use bson::doc;

    #[test]
    fn test_ensure_id_keeps_existing() {
        let mut d = doc! { "_id": "uid1" };
        assert_eq!(ensure_id(&mut d), Bson::String("uid1".into()));
        assert_eq!(d.len(), 1);
    }

    #[test]
    fn test_ensure_id_generates() {
        let mut d = doc! { "name": "x" };
        let id = ensure_id(&mut d);
        assert!(matches!(id, Bson::ObjectId(_)));
        assert_eq!(d.get("_id"), Some(&id));
    }

    #[test]
    fn test_object_id_from_hex() {
        let id = new_object_id();
        assert_eq!(object_id_from_hex(&id.to_hex()).unwrap(), id);
        assert!(object_id_from_hex("nope").unwrap_err().is_decode());
        assert!(is_valid_object_id("507f1f77bcf86cd799439011"));
        assert!(!is_valid_object_id("507f1f77bcf86cd79943901"));
    }

    #[test]
    fn test_object_id_time_is_recent() {
        let id = new_object_id();
        let age = Utc::now() - object_id_time(&id);
        assert!(age.num_seconds() < 60);
    }

    #[test]
    fn test_to_document_rejects_scalars() {
        assert!(to_document(&5_i32).is_err());
        assert_eq!(to_document(&doc! { "a": 1 }).unwrap(), doc! { "a": 1 });
    }
}
