//! Query filter evaluation.
//!
//! Supports the common query operators: comparison (`$eq`, `$ne`, `$gt`,
//! `$gte`, `$lt`, `$lte`, `$in`, `$nin`), element (`$exists`, `$type`),
//! evaluation (`$regex`, `$options`), array (`$size`, `$all`,
//! `$elemMatch`), and the logical combinators `$and`, `$or`, `$nor` and
//! `$not`.

use std::cmp::Ordering;

use bson::{Bson, Document};
use regex_lite::Regex;

use super::compare::{bson_eq, collect_path, compare_bson, same_bracket};
use crate::error::{QueryError, QueryResult};

/// Check whether `doc` satisfies `filter`.
pub(crate) fn matches(doc: &Document, filter: &Document) -> QueryResult<bool> {
    for (key, condition) in filter {
        let ok = match key.as_str() {
            "$and" => all_of(doc, condition, "$and")?.iter().all(|m| *m),
            "$or" => all_of(doc, condition, "$or")?.iter().any(|m| *m),
            "$nor" => !all_of(doc, condition, "$nor")?.iter().any(|m| *m),
            "$comment" => true,
            op if op.starts_with('$') => {
                return Err(QueryError::invalid_filter(format!("unknown top level operator {}", op)));
            }
            path => matches_field(&collect_path(doc, path), condition)?,
        };
        if !ok {
            return Ok(false);
        }
    }
    Ok(true)
}

fn all_of(doc: &Document, clauses: &Bson, op: &str) -> QueryResult<Vec<bool>> {
    let Bson::Array(clauses) = clauses else {
        return Err(QueryError::invalid_filter(format!("{} needs an array", op)));
    };
    if clauses.is_empty() {
        return Err(QueryError::invalid_filter(format!("{} needs a non-empty array", op)));
    }
    clauses
        .iter()
        .map(|clause| match clause {
            Bson::Document(sub) => matches(doc, sub),
            _ => Err(QueryError::invalid_filter(format!("{} entries must be documents", op))),
        })
        .collect()
}

fn is_operator_doc(value: &Bson) -> Option<&Document> {
    match value {
        Bson::Document(d) if d.keys().next().is_some_and(|k| k.starts_with('$')) => Some(d),
        _ => None,
    }
}

/// Evaluate a field condition against the values found at its path.
pub(crate) fn matches_field(candidates: &[Bson], condition: &Bson) -> QueryResult<bool> {
    match is_operator_doc(condition) {
        Some(ops) => eval_ops(candidates, ops),
        None => Ok(equals_any(candidates, condition)),
    }
}

fn equals_any(candidates: &[Bson], value: &Bson) -> bool {
    if matches!(value, Bson::Null) && candidates.is_empty() {
        return true;
    }
    candidates.iter().any(|candidate| {
        bson_eq(candidate, value)
            || matches!(candidate, Bson::Array(items) if items.iter().any(|item| bson_eq(item, value)))
    })
}

/// Candidates plus the elements of array candidates.
fn expanded(candidates: &[Bson]) -> impl Iterator<Item = &Bson> {
    candidates.iter().flat_map(|candidate| {
        let elements: &[Bson] = match candidate {
            Bson::Array(items) => items,
            _ => &[],
        };
        std::iter::once(candidate).chain(elements.iter())
    })
}

fn compare_any(candidates: &[Bson], value: &Bson, accept: fn(Ordering) -> bool) -> bool {
    expanded(candidates)
        .any(|candidate| same_bracket(candidate, value) && accept(compare_bson(candidate, value)))
}

fn eval_ops(candidates: &[Bson], ops: &Document) -> QueryResult<bool> {
    let options = ops.get_str("$options").unwrap_or("");
    for (op, operand) in ops {
        let ok = match op.as_str() {
            "$eq" => equals_any(candidates, operand),
            "$ne" => !equals_any(candidates, operand),
            "$gt" => compare_any(candidates, operand, |o| o == Ordering::Greater),
            "$gte" => compare_any(candidates, operand, |o| o != Ordering::Less),
            "$lt" => compare_any(candidates, operand, |o| o == Ordering::Less),
            "$lte" => compare_any(candidates, operand, |o| o != Ordering::Greater),
            "$in" => in_list(candidates, operand, "$in")?,
            "$nin" => !in_list(candidates, operand, "$nin")?,
            "$exists" => candidates.is_empty() != super::compare::is_truthy(operand),
            "$type" => type_matches(candidates, operand)?,
            "$regex" => {
                let regex = compile_regex(operand, options)?;
                expanded(candidates).any(|c| regex_matches(&regex, c))
            }
            "$options" => true,
            "$size" => {
                let size = operand
                    .as_i64()
                    .or_else(|| operand.as_i32().map(i64::from))
                    .ok_or_else(|| QueryError::invalid_filter("$size needs a number"))?;
                candidates
                    .iter()
                    .any(|c| matches!(c, Bson::Array(items) if items.len() as i64 == size))
            }
            "$all" => {
                let Bson::Array(wanted) = operand else {
                    return Err(QueryError::invalid_filter("$all needs an array"));
                };
                !wanted.is_empty() && wanted.iter().all(|w| equals_any(candidates, w))
            }
            "$elemMatch" => {
                let Bson::Document(sub) = operand else {
                    return Err(QueryError::invalid_filter("$elemMatch needs a document"));
                };
                elem_match(candidates, sub)?
            }
            "$not" => match operand {
                Bson::Document(sub) => !eval_ops(candidates, sub)?,
                Bson::RegularExpression(_) => !matches_field(candidates, operand)?,
                _ => return Err(QueryError::invalid_filter("$not needs a document or a regex")),
            },
            other => {
                return Err(QueryError::invalid_filter(format!("unknown operator {}", other)));
            }
        };
        if !ok {
            return Ok(false);
        }
    }
    Ok(true)
}

fn in_list(candidates: &[Bson], operand: &Bson, op: &str) -> QueryResult<bool> {
    let Bson::Array(values) = operand else {
        return Err(QueryError::invalid_filter(format!("{} needs an array", op)));
    };
    for value in values {
        let hit = match value {
            Bson::RegularExpression(re) => {
                let regex = build_regex(&re.pattern, &re.options)?;
                expanded(candidates).any(|c| regex_matches(&regex, c))
            }
            other => equals_any(candidates, other),
        };
        if hit {
            return Ok(true);
        }
    }
    Ok(false)
}

fn elem_match(candidates: &[Bson], sub: &Document) -> QueryResult<bool> {
    let operator_form = sub.keys().all(|k| k.starts_with('$') && !matches!(k.as_str(), "$and" | "$or" | "$nor"));
    for candidate in candidates {
        let Bson::Array(items) = candidate else {
            continue;
        };
        for item in items {
            let hit = match item {
                Bson::Document(inner) if !operator_form => matches(inner, sub)?,
                other if operator_form => eval_ops(std::slice::from_ref(other), sub)?,
                _ => false,
            };
            if hit {
                return Ok(true);
            }
        }
    }
    Ok(false)
}

fn type_name(value: &Bson) -> &'static str {
    match value {
        Bson::Double(_) => "double",
        Bson::String(_) => "string",
        Bson::Document(_) => "object",
        Bson::Array(_) => "array",
        Bson::Binary(_) => "binData",
        Bson::ObjectId(_) => "objectId",
        Bson::Boolean(_) => "bool",
        Bson::DateTime(_) => "date",
        Bson::Null => "null",
        Bson::RegularExpression(_) => "regex",
        Bson::Int32(_) => "int",
        Bson::Timestamp(_) => "timestamp",
        Bson::Int64(_) => "long",
        Bson::Decimal128(_) => "decimal",
        _ => "other",
    }
}

fn type_matches(candidates: &[Bson], operand: &Bson) -> QueryResult<bool> {
    let wanted: Vec<&str> = match operand {
        Bson::String(name) => vec![name.as_str()],
        Bson::Array(names) => names.iter().filter_map(Bson::as_str).collect(),
        _ => return Err(QueryError::invalid_filter("$type needs a type name")),
    };
    Ok(expanded(candidates).any(|c| {
        let name = type_name(c);
        wanted
            .iter()
            .any(|w| *w == name || (*w == "number" && matches!(name, "double" | "int" | "long" | "decimal")))
    }))
}

fn compile_regex(operand: &Bson, options: &str) -> QueryResult<Regex> {
    match operand {
        Bson::String(pattern) => build_regex(pattern, options),
        Bson::RegularExpression(re) => {
            let flags = if options.is_empty() { re.options.as_str() } else { options };
            build_regex(&re.pattern, flags)
        }
        _ => Err(QueryError::invalid_filter("$regex needs a string")),
    }
}

fn build_regex(pattern: &str, options: &str) -> QueryResult<Regex> {
    let flags: String = options.chars().filter(|c| matches!(c, 'i' | 'm' | 's' | 'x')).collect();
    let source = if flags.is_empty() {
        pattern.to_string()
    } else {
        format!("(?{}){}", flags, pattern)
    };
    Regex::new(&source).map_err(|e| QueryError::invalid_filter(format!("bad regex {:?}: {}", pattern, e)))
}

fn regex_matches(regex: &Regex, value: &Bson) -> bool {
    matches!(value, Bson::String(s) if regex.is_match(s))
}

#[cfg(test)]
mod tests {
    use super::*;
    use bson::doc;

    fn user() -> Document {
        doc! {
            "_id": 1,
            "name": "ada",
            "age": 36,
            "tags": ["admin", "ops"],
            "address": { "city": "London" },
            "orders": [ { "sku": "a", "qty": 2 }, { "sku": "b", "qty": 5 } ],
        }
    }

    #[test]
    fn test_equality_and_paths() {
        let d = user();
        assert!(matches(&d, &doc! { "name": "ada" }).unwrap());
        assert!(matches(&d, &doc! { "address.city": "London" }).unwrap());
        assert!(matches(&d, &doc! { "tags": "ops" }).unwrap());
        assert!(matches(&d, &doc! { "orders.sku": "b" }).unwrap());
        assert!(!matches(&d, &doc! { "name": "bob" }).unwrap());
        assert!(matches(&d, &doc! { "missing": null }).unwrap());
    }

    #[test]
    fn test_comparisons() {
        let d = user();
        assert!(matches(&d, &doc! { "age": { "$gt": 30, "$lte": 36 } }).unwrap());
        assert!(!matches(&d, &doc! { "age": { "$lt": 30 } }).unwrap());
        assert!(!matches(&d, &doc! { "age": { "$gt": "a" } }).unwrap());
        assert!(matches(&d, &doc! { "orders.qty": { "$gte": 5 } }).unwrap());
        assert!(matches(&d, &doc! { "age": { "$in": [1, 36] } }).unwrap());
        assert!(matches(&d, &doc! { "age": { "$nin": [1, 2] } }).unwrap());
        assert!(matches(&d, &doc! { "age": { "$ne": 2 } }).unwrap());
    }

    #[test]
    fn test_logical() {
        let d = user();
        assert!(matches(&d, &doc! { "$or": [ { "age": 1 }, { "name": "ada" } ] }).unwrap());
        assert!(!matches(&d, &doc! { "$and": [ { "age": 36 }, { "name": "bob" } ] }).unwrap());
        assert!(matches(&d, &doc! { "$nor": [ { "age": 1 } ] }).unwrap());
        assert!(matches(&d, &doc! { "age": { "$not": { "$lt": 10 } } }).unwrap());
    }

    #[test]
    fn test_element_and_array_operators() {
        let d = user();
        assert!(matches(&d, &doc! { "tags": { "$exists": true } }).unwrap());
        assert!(matches(&d, &doc! { "nope": { "$exists": false } }).unwrap());
        assert!(matches(&d, &doc! { "tags": { "$size": 2 } }).unwrap());
        assert!(matches(&d, &doc! { "tags": { "$all": ["ops", "admin"] } }).unwrap());
        assert!(matches(&d, &doc! { "orders": { "$elemMatch": { "sku": "b", "qty": { "$gt": 3 } } } }).unwrap());
        assert!(!matches(&d, &doc! { "orders": { "$elemMatch": { "sku": "a", "qty": { "$gt": 3 } } } }).unwrap());
        assert!(matches(&d, &doc! { "age": { "$type": "number" } }).unwrap());
    }

    #[test]
    fn test_regex() {
        let d = user();
        assert!(matches(&d, &doc! { "name": { "$regex": "^A", "$options": "i" } }).unwrap());
        assert!(!matches(&d, &doc! { "name": { "$regex": "^A" } }).unwrap());
    }

    #[test]
    fn test_unknown_operator_is_rejected() {
        let d = user();
        let err = matches(&d, &doc! { "age": { "$near": 1 } }).unwrap_err();
        assert_eq!(err.code, crate::ErrorCode::InvalidFilter);
        assert!(matches(&d, &doc! { "$where": "1" }).is_err());
    }
}
