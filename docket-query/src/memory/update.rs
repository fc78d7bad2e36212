//! Update operators, replacements and upsert seeding.

use bson::{Bson, DateTime, Document};

use super::compare::{add_numbers, bson_eq, compare_bson, get_path, mul_numbers, remove_path, set_path};
use super::matcher::{matches, matches_field};
use crate::error::{QueryError, QueryResult};

/// Check that an update document only holds operators.
pub(crate) fn validate_update(update: &Document) -> QueryResult<()> {
    if update.is_empty() {
        return Err(QueryError::invalid_update("update document is empty"));
    }
    if let Some(key) = update.keys().find(|k| !k.starts_with('$')) {
        return Err(QueryError::invalid_update(format!(
            "update document requires operators, found field {:?}",
            key
        )));
    }
    Ok(())
}

/// Check that a replacement holds no operators.
pub(crate) fn validate_replacement(replacement: &Document) -> QueryResult<()> {
    if let Some(key) = replacement.keys().find(|k| k.starts_with('$')) {
        return Err(QueryError::invalid_update(format!(
            "replacement document must not contain operator {}",
            key
        )));
    }
    Ok(())
}

/// Apply update operators to `doc` in place.
///
/// `inserting` is set when the document is being created by an upsert,
/// which enables `$setOnInsert`.
pub(crate) fn apply_update(doc: &mut Document, update: &Document, inserting: bool) -> QueryResult<()> {
    validate_update(update)?;
    let original_id = doc.get("_id").cloned();

    for (op, fields) in update {
        let Bson::Document(fields) = fields else {
            return Err(QueryError::invalid_update(format!("{} needs a document", op)));
        };
        for (path, value) in fields {
            apply_one(doc, op, path, value, inserting)?;
        }
    }

    if let Some(id) = original_id {
        if !doc.get("_id").is_some_and(|now| bson_eq(now, &id)) {
            return Err(QueryError::invalid_update("the _id field cannot be changed"));
        }
    }
    Ok(())
}

fn apply_one(doc: &mut Document, op: &str, path: &str, value: &Bson, inserting: bool) -> QueryResult<()> {
    match op {
        "$set" => set_path(doc, path, value.clone()),
        "$setOnInsert" => {
            if inserting {
                set_path(doc, path, value.clone())
            } else {
                Ok(())
            }
        }
        "$unset" => {
            remove_path(doc, path);
            Ok(())
        }
        "$inc" | "$mul" => {
            let current = match get_path(doc, path) {
                Some(v) => v.clone(),
                None if op == "$inc" => Bson::Int32(0),
                None => zero_like(value),
            };
            let next = if op == "$inc" {
                add_numbers(&current, value)
            } else {
                mul_numbers(&current, value)
            };
            let next = next.ok_or_else(|| {
                QueryError::invalid_update(format!("{} needs numeric values at {:?}", op, path))
            })?;
            set_path(doc, path, next)
        }
        "$min" | "$max" => {
            let replace = match get_path(doc, path) {
                None => true,
                Some(current) => {
                    let order = compare_bson(value, current);
                    if op == "$min" { order.is_lt() } else { order.is_gt() }
                }
            };
            if replace {
                set_path(doc, path, value.clone())?;
            }
            Ok(())
        }
        "$rename" => {
            let Bson::String(target) = value else {
                return Err(QueryError::invalid_update("$rename target must be a string"));
            };
            if let Some(moved) = remove_path(doc, path) {
                set_path(doc, target, moved)?;
            }
            Ok(())
        }
        "$currentDate" => set_path(doc, path, Bson::DateTime(DateTime::now())),
        "$push" | "$addToSet" => {
            let items = match value {
                Bson::Document(spec) if spec.contains_key("$each") => match spec.get("$each") {
                    Some(Bson::Array(items)) => items.clone(),
                    _ => return Err(QueryError::invalid_update("$each needs an array")),
                },
                other => vec![other.clone()],
            };
            let array = array_at(doc, path, op)?;
            for item in items {
                if op == "$push" || !array.iter().any(|existing| bson_eq(existing, &item)) {
                    array.push(item);
                }
            }
            Ok(())
        }
        "$pull" => {
            let array = array_at(doc, path, op)?;
            let mut kept = Vec::with_capacity(array.len());
            for item in array.drain(..) {
                if !pull_matches(&item, value)? {
                    kept.push(item);
                }
            }
            *array = kept;
            Ok(())
        }
        "$pop" => {
            let array = array_at(doc, path, op)?;
            if super::compare::as_f64(value).is_some_and(|n| n < 0.0) {
                if !array.is_empty() {
                    array.remove(0);
                }
            } else {
                array.pop();
            }
            Ok(())
        }
        other => Err(QueryError::invalid_update(format!("unknown update operator {}", other))),
    }
}

fn zero_like(value: &Bson) -> Bson {
    match value {
        Bson::Int64(_) => Bson::Int64(0),
        Bson::Double(_) => Bson::Double(0.0),
        _ => Bson::Int32(0),
    }
}

fn array_at<'a>(doc: &'a mut Document, path: &str, op: &str) -> QueryResult<&'a mut Vec<Bson>> {
    if get_path(doc, path).is_none() {
        set_path(doc, path, Bson::Array(Vec::new()))?;
    }
    let mut current: &mut Document = doc;
    let mut parts = path.split('.').peekable();
    while let Some(part) = parts.next() {
        let value = current
            .get_mut(part)
            .ok_or_else(|| QueryError::invalid_update(format!("{} path {:?} is not reachable", op, path)))?;
        if parts.peek().is_none() {
            return match value {
                Bson::Array(items) => Ok(items),
                _ => Err(QueryError::invalid_update(format!("{} needs an array at {:?}", op, path))),
            };
        }
        current = match value {
            Bson::Document(inner) => inner,
            _ => {
                return Err(QueryError::invalid_update(format!("{} path {:?} is not reachable", op, path)));
            }
        };
    }
    Err(QueryError::invalid_update(format!("{} needs a field path", op)))
}

fn pull_matches(item: &Bson, condition: &Bson) -> QueryResult<bool> {
    match (item, condition) {
        (Bson::Document(inner), Bson::Document(cond)) if !cond.keys().any(|k| k.starts_with('$')) => {
            matches(inner, cond)
        }
        (_, Bson::Document(cond)) if cond.keys().all(|k| k.starts_with('$')) => {
            matches_field(std::slice::from_ref(item), condition)
        }
        _ => Ok(bson_eq(item, condition)),
    }
}

/// Replace `doc` with `replacement`, keeping its `_id`.
pub(crate) fn apply_replacement(doc: &Document, replacement: &Document) -> QueryResult<Document> {
    validate_replacement(replacement)?;
    let mut out = Document::new();
    match (doc.get("_id"), replacement.get("_id")) {
        (Some(old), Some(new)) if !bson_eq(old, new) => {
            return Err(QueryError::invalid_update("the _id field cannot be changed"));
        }
        (Some(old), _) => {
            out.insert("_id", old.clone());
        }
        (None, _) => {}
    }
    for (key, value) in replacement {
        if key != "_id" || !out.contains_key("_id") {
            out.insert(key.clone(), value.clone());
        }
    }
    Ok(out)
}

/// The equality fields of a filter, used as the base of an upserted
/// document.
pub(crate) fn upsert_seed(filter: &Document) -> QueryResult<Document> {
    let mut seed = Document::new();
    collect_equalities(filter, &mut seed)?;
    Ok(seed)
}

fn collect_equalities(filter: &Document, seed: &mut Document) -> QueryResult<()> {
    for (key, value) in filter {
        if key == "$and" {
            if let Bson::Array(clauses) = value {
                for clause in clauses {
                    if let Bson::Document(sub) = clause {
                        collect_equalities(sub, seed)?;
                    }
                }
            }
            continue;
        }
        if key.starts_with('$') {
            continue;
        }
        match value {
            Bson::Document(ops) if ops.keys().next().is_some_and(|k| k.starts_with('$')) => {
                if let Some(eq) = ops.get("$eq") {
                    set_path(seed, key, eq.clone())?;
                }
            }
            other => set_path(seed, key, other.clone())?,
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use bson::doc;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_set_inc_unset() {
        let mut d = doc! { "_id": 1, "n": 1, "old": true };
        apply_update(&mut d, &doc! { "$set": { "a.b": "x" }, "$inc": { "n": 2, "m": 1 }, "$unset": { "old": "" } }, false).unwrap();
        assert_eq!(d, doc! { "_id": 1, "n": 3, "a": { "b": "x" }, "m": 1 });
    }

    #[test]
    fn test_array_operators() {
        let mut d = doc! { "_id": 1, "tags": ["a"] };
        apply_update(&mut d, &doc! { "$push": { "tags": { "$each": ["b", "c"] } } }, false).unwrap();
        apply_update(&mut d, &doc! { "$addToSet": { "tags": "a" } }, false).unwrap();
        apply_update(&mut d, &doc! { "$pull": { "tags": "b" } }, false).unwrap();
        assert_eq!(d.get_array("tags").unwrap(), &vec![Bson::from("a"), Bson::from("c")]);
        apply_update(&mut d, &doc! { "$pop": { "tags": -1 } }, false).unwrap();
        assert_eq!(d.get_array("tags").unwrap(), &vec![Bson::from("c")]);
    }

    #[test]
    fn test_pull_with_condition() {
        let mut d = doc! { "_id": 1, "scores": [1, 5, 9] };
        apply_update(&mut d, &doc! { "$pull": { "scores": { "$gte": 5 } } }, false).unwrap();
        assert_eq!(d, doc! { "_id": 1, "scores": [1] });
    }

    #[test]
    fn test_min_max_rename() {
        let mut d = doc! { "_id": 1, "lo": 5, "hi": 5, "x": 1 };
        apply_update(&mut d, &doc! { "$min": { "lo": 3 }, "$max": { "hi": 3 }, "$rename": { "x": "y" } }, false).unwrap();
        assert_eq!(d, doc! { "_id": 1, "lo": 3, "hi": 5, "y": 1 });
    }

    #[test]
    fn test_set_on_insert_only_when_inserting() {
        let mut d = doc! { "_id": 1 };
        apply_update(&mut d, &doc! { "$setOnInsert": { "created": true } }, false).unwrap();
        assert_eq!(d, doc! { "_id": 1 });
        apply_update(&mut d, &doc! { "$setOnInsert": { "created": true } }, true).unwrap();
        assert_eq!(d, doc! { "_id": 1, "created": true });
    }

    #[test]
    fn test_rejects_bad_updates() {
        let mut d = doc! { "_id": 1, "name": "x" };
        assert!(apply_update(&mut d, &doc! { "name": "y" }, false).is_err());
        assert!(apply_update(&mut d, &doc! { "$set": { "_id": 2 } }, false).is_err());
        assert!(apply_update(&mut d, &doc! { "$inc": { "name": 1 } }, false).is_err());
        assert!(apply_update(&mut d, &doc! { "$frob": { "name": 1 } }, false).is_err());
    }

    #[test]
    fn test_replacement_keeps_id() {
        let replaced = apply_replacement(&doc! { "_id": 7, "a": 1 }, &doc! { "b": 2 }).unwrap();
        assert_eq!(replaced, doc! { "_id": 7, "b": 2 });
        assert!(apply_replacement(&doc! { "_id": 7 }, &doc! { "_id": 8 }).is_err());
        assert!(apply_replacement(&doc! { "_id": 7 }, &doc! { "$set": { "a": 1 } }).is_err());
    }

    #[test]
    fn test_upsert_seed() {
        let seed = upsert_seed(&doc! {
            "_id": "seq",
            "kind": { "$eq": "counter" },
            "n": { "$gt": 1 },
            "$and": [ { "owner.name": "ada" } ],
        })
        .unwrap();
        assert_eq!(seed, doc! { "_id": "seq", "kind": "counter", "owner": { "name": "ada" } });
    }
}
