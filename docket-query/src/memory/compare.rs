//! BSON ordering, equality, arithmetic and dotted-path access.

use std::cmp::Ordering;

use bson::{Bson, Document};

use crate::error::{QueryError, QueryResult};

fn type_rank(value: &Bson) -> u8 {
    match value {
        Bson::MinKey => 1,
        Bson::Null | Bson::Undefined => 2,
        Bson::Int32(_) | Bson::Int64(_) | Bson::Double(_) | Bson::Decimal128(_) => 3,
        Bson::String(_) | Bson::Symbol(_) => 4,
        Bson::Document(_) => 5,
        Bson::Array(_) => 6,
        Bson::Binary(_) => 7,
        Bson::ObjectId(_) => 8,
        Bson::Boolean(_) => 9,
        Bson::DateTime(_) => 10,
        Bson::Timestamp(_) => 11,
        Bson::RegularExpression(_) => 12,
        Bson::MaxKey => 14,
        _ => 13,
    }
}

/// Whether two values fall in the same comparison bracket.
pub(crate) fn same_bracket(a: &Bson, b: &Bson) -> bool {
    type_rank(a) == type_rank(b)
}

pub(crate) fn as_f64(value: &Bson) -> Option<f64> {
    match value {
        Bson::Int32(n) => Some(*n as f64),
        Bson::Int64(n) => Some(*n as f64),
        Bson::Double(n) => Some(*n),
        _ => None,
    }
}

fn as_i64(value: &Bson) -> Option<i64> {
    match value {
        Bson::Int32(n) => Some(*n as i64),
        Bson::Int64(n) => Some(*n),
        _ => None,
    }
}

/// Total order over BSON values: type brackets first, then values.
pub(crate) fn compare_bson(a: &Bson, b: &Bson) -> Ordering {
    let (ra, rb) = (type_rank(a), type_rank(b));
    if ra != rb {
        return ra.cmp(&rb);
    }
    match (a, b) {
        _ if ra == 3 => match (as_i64(a), as_i64(b)) {
            (Some(x), Some(y)) => x.cmp(&y),
            _ => match (as_f64(a), as_f64(b)) {
                (Some(x), Some(y)) => x.partial_cmp(&y).unwrap_or(Ordering::Equal),
                _ => Ordering::Equal,
            },
        },
        (Bson::String(x), Bson::String(y)) => x.cmp(y),
        (Bson::Symbol(x), Bson::Symbol(y)) => x.cmp(y),
        (Bson::Document(x), Bson::Document(y)) => compare_documents(x, y),
        (Bson::Array(x), Bson::Array(y)) => {
            for (l, r) in x.iter().zip(y.iter()) {
                match compare_bson(l, r) {
                    Ordering::Equal => continue,
                    other => return other,
                }
            }
            x.len().cmp(&y.len())
        }
        (Bson::Binary(x), Bson::Binary(y)) => x.bytes.cmp(&y.bytes),
        (Bson::ObjectId(x), Bson::ObjectId(y)) => x.bytes().cmp(&y.bytes()),
        (Bson::Boolean(x), Bson::Boolean(y)) => x.cmp(y),
        (Bson::DateTime(x), Bson::DateTime(y)) => x.timestamp_millis().cmp(&y.timestamp_millis()),
        (Bson::Timestamp(x), Bson::Timestamp(y)) => (x.time, x.increment).cmp(&(y.time, y.increment)),
        (Bson::RegularExpression(x), Bson::RegularExpression(y)) => {
            (&x.pattern, &x.options).cmp(&(&y.pattern, &y.options))
        }
        _ => Ordering::Equal,
    }
}

fn compare_documents(x: &Document, y: &Document) -> Ordering {
    for ((kx, vx), (ky, vy)) in x.iter().zip(y.iter()) {
        match compare_bson(vx, vy) {
            Ordering::Equal => {}
            other => return other,
        }
        match kx.cmp(ky) {
            Ordering::Equal => {}
            other => return other,
        }
    }
    x.len().cmp(&y.len())
}

/// Value equality under the BSON order (so `1` equals `1.0`).
pub(crate) fn bson_eq(a: &Bson, b: &Bson) -> bool {
    compare_bson(a, b) == Ordering::Equal
}

/// Whether a value counts as "on" in projections and flags.
pub(crate) fn is_truthy(value: &Bson) -> bool {
    match value {
        Bson::Boolean(b) => *b,
        Bson::Null | Bson::Undefined => false,
        other => as_f64(other).is_none_or(|n| n != 0.0),
    }
}

/// Add two numbers, widening as needed.
pub(crate) fn add_numbers(a: &Bson, b: &Bson) -> Option<Bson> {
    match (a, b) {
        (Bson::Int32(x), Bson::Int32(y)) => Some(
            x.checked_add(*y)
                .map(Bson::Int32)
                .unwrap_or(Bson::Int64(*x as i64 + *y as i64)),
        ),
        _ => match (as_i64(a), as_i64(b)) {
            (Some(x), Some(y)) => Some(Bson::Int64(x.wrapping_add(y))),
            _ => Some(Bson::Double(as_f64(a)? + as_f64(b)?)),
        },
    }
}

/// Multiply two numbers, widening as needed.
pub(crate) fn mul_numbers(a: &Bson, b: &Bson) -> Option<Bson> {
    match (a, b) {
        (Bson::Int32(x), Bson::Int32(y)) => Some(
            x.checked_mul(*y)
                .map(Bson::Int32)
                .unwrap_or(Bson::Int64(*x as i64 * *y as i64)),
        ),
        _ => match (as_i64(a), as_i64(b)) {
            (Some(x), Some(y)) => Some(Bson::Int64(x.wrapping_mul(y))),
            _ => Some(Bson::Double(as_f64(a)? * as_f64(b)?)),
        },
    }
}

/// The value at a dotted path, following numeric segments into arrays.
pub(crate) fn get_path<'a>(doc: &'a Document, path: &str) -> Option<&'a Bson> {
    let mut parts = path.split('.');
    let mut current = doc.get(parts.next()?)?;
    for part in parts {
        current = match current {
            Bson::Document(inner) => inner.get(part)?,
            Bson::Array(items) => items.get(part.parse::<usize>().ok()?)?,
            _ => return None,
        };
    }
    Some(current)
}

/// Every value reachable at a dotted path. Non-numeric segments fan out
/// over arrays of documents.
pub(crate) fn collect_path(doc: &Document, path: &str) -> Vec<Bson> {
    let parts: Vec<&str> = path.split('.').collect();
    let mut out = Vec::new();
    collect_from_doc(doc, &parts, &mut out);
    out
}

fn collect_from_doc(doc: &Document, parts: &[&str], out: &mut Vec<Bson>) {
    let Some((head, rest)) = parts.split_first() else {
        return;
    };
    if let Some(value) = doc.get(*head) {
        collect_from_value(value, rest, out);
    }
}

fn collect_from_value(value: &Bson, parts: &[&str], out: &mut Vec<Bson>) {
    let Some((head, rest)) = parts.split_first() else {
        out.push(value.clone());
        return;
    };
    match value {
        Bson::Document(inner) => collect_from_doc(inner, parts, out),
        Bson::Array(items) => {
            if let Ok(index) = head.parse::<usize>() {
                if let Some(item) = items.get(index) {
                    collect_from_value(item, rest, out);
                }
            } else {
                for item in items {
                    if let Bson::Document(inner) = item {
                        collect_from_doc(inner, parts, out);
                    }
                }
            }
        }
        _ => {}
    }
}

/// Set the value at a dotted path, creating intermediate documents.
pub(crate) fn set_path(doc: &mut Document, path: &str, value: Bson) -> QueryResult<()> {
    let (head, rest) = match path.split_once('.') {
        Some((head, rest)) => (head, Some(rest)),
        None => (path, None),
    };
    if head.is_empty() {
        return Err(QueryError::invalid_update(format!("empty field name in path {:?}", path)));
    }
    let Some(rest) = rest else {
        doc.insert(head, value);
        return Ok(());
    };
    if !doc.contains_key(head) {
        doc.insert(head, Document::new());
    }
    match doc.get_mut(head) {
        Some(Bson::Document(inner)) => set_path(inner, rest, value),
        Some(Bson::Array(items)) => set_in_array(items, rest, value, path),
        _ => Err(QueryError::invalid_update(format!(
            "cannot create field in non-document value at {:?}",
            path
        ))),
    }
}

/// Most nulls a positional `$set` may add to reach its index.
const MAX_ARRAY_PADDING: usize = 1_500_000;

fn set_in_array(items: &mut Vec<Bson>, rest: &str, value: Bson, path: &str) -> QueryResult<()> {
    let (head, tail) = match rest.split_once('.') {
        Some((head, tail)) => (head, Some(tail)),
        None => (rest, None),
    };
    let index: usize = head
        .parse()
        .map_err(|_| QueryError::invalid_update(format!("non-numeric array index in {:?}", path)))?;
    if index >= items.len() {
        if index - items.len() > MAX_ARRAY_PADDING {
            return Err(QueryError::invalid_update(format!(
                "{:?} would pad the array with more than {} nulls",
                path, MAX_ARRAY_PADDING
            )));
        }
        items.resize(index + 1, Bson::Null);
    }
    match tail {
        None => {
            items[index] = value;
            Ok(())
        }
        Some(tail) => {
            if !matches!(items[index], Bson::Document(_)) {
                items[index] = Bson::Document(Document::new());
            }
            match &mut items[index] {
                Bson::Document(inner) => set_path(inner, tail, value),
                _ => Ok(()),
            }
        }
    }
}

/// Remove the value at a dotted path. Returns the removed value.
pub(crate) fn remove_path(doc: &mut Document, path: &str) -> Option<Bson> {
    match path.split_once('.') {
        None => doc.remove(path),
        Some((head, rest)) => match doc.get_mut(head)? {
            Bson::Document(inner) => remove_path(inner, rest),
            _ => None,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bson::{bson, doc};
    use pretty_assertions::assert_eq;

    #[test]
    fn test_numeric_equality_across_types() {
        assert!(bson_eq(&Bson::Int32(1), &Bson::Double(1.0)));
        assert!(bson_eq(&Bson::Int64(7), &Bson::Int32(7)));
        assert_eq!(compare_bson(&Bson::Int32(2), &Bson::Double(1.5)), Ordering::Greater);
    }

    #[test]
    fn test_type_brackets() {
        assert_eq!(compare_bson(&Bson::Null, &Bson::Int32(0)), Ordering::Less);
        assert_eq!(compare_bson(&Bson::Int32(100), &Bson::String("a".into())), Ordering::Less);
        assert_eq!(compare_bson(&Bson::String("b".into()), &Bson::String("a".into())), Ordering::Greater);
    }

    #[test]
    fn test_paths() {
        let d = doc! { "a": { "b": [ { "c": 1 }, { "c": 2 } ] } };
        assert_eq!(get_path(&d, "a.b.1.c"), Some(&Bson::Int32(2)));
        assert_eq!(get_path(&d, "a.x"), None);
        assert_eq!(collect_path(&d, "a.b.c"), vec![Bson::Int32(1), Bson::Int32(2)]);
    }

    #[test]
    fn test_set_and_remove_path() {
        let mut d = doc! { "a": 1 };
        set_path(&mut d, "b.c.d", Bson::Int32(5)).unwrap();
        assert_eq!(d, doc! { "a": 1, "b": { "c": { "d": 5 } } });
        assert_eq!(remove_path(&mut d, "b.c.d"), Some(Bson::Int32(5)));
        assert_eq!(d, doc! { "a": 1, "b": { "c": {} } });
        assert!(set_path(&mut d, "a.x", Bson::Int32(1)).is_err());
    }

    #[test]
    fn test_set_in_array() {
        let mut d = doc! { "tags": ["a", "b"] };
        set_path(&mut d, "tags.1", bson!("z")).unwrap();
        assert_eq!(d, doc! { "tags": ["a", "z"] });

        set_path(&mut d, "tags.4", bson!("e")).unwrap();
        assert_eq!(d, doc! { "tags": ["a", "z", Bson::Null, Bson::Null, "e"] });
    }

    #[test]
    fn test_set_in_array_refuses_huge_padding() {
        let mut d = doc! { "arr": [1] };
        let err = set_path(&mut d, "arr.100000000000", bson!(1)).unwrap_err();
        assert_eq!(err.code, crate::ErrorCode::InvalidUpdate);
        assert_eq!(d, doc! { "arr": [1] });
    }

    #[test]
    fn test_add_numbers_widens() {
        assert_eq!(add_numbers(&Bson::Int32(i32::MAX), &Bson::Int32(1)), Some(Bson::Int64(i32::MAX as i64 + 1)));
        assert_eq!(add_numbers(&Bson::Int32(1), &Bson::Double(0.5)), Some(Bson::Double(1.5)));
        assert_eq!(add_numbers(&Bson::String("x".into()), &Bson::Int32(1)), None);
    }
}
