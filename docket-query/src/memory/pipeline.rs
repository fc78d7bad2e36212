//! Sorting, projection and aggregation stages.

use std::cmp::Ordering;

use bson::{Bson, Document};

use super::compare::{add_numbers, as_f64, bson_eq, compare_bson, get_path, is_truthy, mul_numbers, remove_path, set_path};
use super::matcher::matches;
use crate::error::{QueryError, QueryResult};
use crate::sort::{SortKey, SortSpec};

/// Sort documents in place by `(path, descending)` keys. The sort is
/// stable, so ties keep insertion order.
pub(crate) fn sort_documents(docs: &mut [Document], keys: &[(String, bool)]) {
    if keys.is_empty() {
        return;
    }
    docs.sort_by(|a, b| compare_by_keys(a, b, keys));
}

/// Order two documents by `(path, descending)` keys. Missing fields sort
/// as null.
pub(crate) fn compare_by_keys(a: &Document, b: &Document, keys: &[(String, bool)]) -> Ordering {
    for (path, descending) in keys {
        let left = get_path(a, path).unwrap_or(&Bson::Null);
        let right = get_path(b, path).unwrap_or(&Bson::Null);
        let order = compare_bson(left, right);
        let order = if *descending { order.reverse() } else { order };
        if order != Ordering::Equal {
            return order;
        }
    }
    Ordering::Equal
}

/// Sort keys of a parsed sort. Metadata keys do not order anything here.
pub(crate) fn spec_keys(spec: &SortSpec) -> Vec<(String, bool)> {
    spec.keys()
        .iter()
        .filter_map(|key| match key {
            SortKey::Field { name, direction } => {
                Some((name.clone(), *direction == crate::sort::SortDirection::Descending))
            }
            SortKey::Meta { .. } => None,
        })
        .collect()
}

fn document_keys(sort: &Document) -> QueryResult<Vec<(String, bool)>> {
    sort.iter()
        .map(|(path, dir)| match as_f64(dir) {
            Some(n) if n == 1.0 => Ok((path.clone(), false)),
            Some(n) if n == -1.0 => Ok((path.clone(), true)),
            _ => Err(QueryError::invalid_pipeline(format!("bad sort direction for {:?}", path))),
        })
        .collect()
}

/// Apply a find projection.
pub(crate) fn project(doc: &Document, projection: &Document) -> QueryResult<Document> {
    let mut include = Vec::new();
    let mut exclude = Vec::new();
    for (path, flag) in projection {
        if path == "_id" || matches!(flag, Bson::Document(_)) {
            continue;
        }
        if is_truthy(flag) {
            include.push(path.as_str());
        } else {
            exclude.push(path.as_str());
        }
    }
    if !include.is_empty() && !exclude.is_empty() {
        return Err(QueryError::invalid_filter("projection cannot mix inclusion and exclusion"));
    }
    let keep_id = projection.get("_id").is_none_or(is_truthy);

    if include.is_empty() {
        let mut out = doc.clone();
        for path in exclude {
            remove_path(&mut out, path);
        }
        if !keep_id {
            out.remove("_id");
        }
        return Ok(out);
    }

    let mut out = Document::new();
    if keep_id {
        if let Some(id) = doc.get("_id") {
            out.insert("_id", id.clone());
        }
    }
    for path in include {
        if let Some(value) = get_path(doc, path) {
            set_path(&mut out, path, value.clone())?;
        }
    }
    Ok(out)
}

/// Evaluate an aggregation expression against a document.
pub(crate) fn eval_expr(doc: &Document, expr: &Bson) -> QueryResult<Bson> {
    match expr {
        Bson::String(s) if s.starts_with('$') => Ok(get_path(doc, &s[1..]).cloned().unwrap_or(Bson::Null)),
        Bson::Array(items) => Ok(Bson::Array(
            items.iter().map(|item| eval_expr(doc, item)).collect::<QueryResult<_>>()?,
        )),
        Bson::Document(spec) => match spec.iter().next() {
            Some((op, args)) if op.starts_with('$') && spec.len() == 1 => eval_operator(doc, op, args),
            _ => {
                let mut out = Document::new();
                for (key, value) in spec {
                    out.insert(key.clone(), eval_expr(doc, value)?);
                }
                Ok(Bson::Document(out))
            }
        },
        other => Ok(other.clone()),
    }
}

fn eval_args(doc: &Document, args: &Bson) -> QueryResult<Vec<Bson>> {
    match args {
        Bson::Array(items) => items.iter().map(|item| eval_expr(doc, item)).collect(),
        other => Ok(vec![eval_expr(doc, other)?]),
    }
}

fn eval_operator(doc: &Document, op: &str, args: &Bson) -> QueryResult<Bson> {
    match op {
        "$literal" => Ok(args.clone()),
        "$add" | "$multiply" => {
            let combine = if op == "$add" { add_numbers } else { mul_numbers };
            let mut values = eval_args(doc, args)?.into_iter();
            let first = values.next().unwrap_or(Bson::Int32(0));
            values.try_fold(first, |acc, value| {
                combine(&acc, &value)
                    .ok_or_else(|| QueryError::invalid_pipeline(format!("{} needs numbers", op)))
            })
        }
        "$subtract" => match eval_args(doc, args)?.as_slice() {
            [a, b] => {
                let negated = mul_numbers(b, &Bson::Int32(-1));
                negated
                    .and_then(|neg| add_numbers(a, &neg))
                    .ok_or_else(|| QueryError::invalid_pipeline("$subtract needs numbers"))
            }
            _ => Err(QueryError::invalid_pipeline("$subtract needs two arguments")),
        },
        "$concat" => {
            let mut out = String::new();
            for value in eval_args(doc, args)? {
                match value {
                    Bson::String(s) => out.push_str(&s),
                    Bson::Null => return Ok(Bson::Null),
                    _ => return Err(QueryError::invalid_pipeline("$concat needs strings")),
                }
            }
            Ok(Bson::String(out))
        }
        "$ifNull" => {
            let values = eval_args(doc, args)?;
            Ok(values
                .iter()
                .find(|v| !matches!(v, Bson::Null | Bson::Undefined))
                .cloned()
                .unwrap_or(Bson::Null))
        }
        "$size" => match eval_expr(doc, args)? {
            Bson::Array(items) => Ok(Bson::Int32(items.len() as i32)),
            _ => Err(QueryError::invalid_pipeline("$size needs an array")),
        },
        other => Err(QueryError::invalid_pipeline(format!("unsupported expression operator {}", other))),
    }
}

/// Run an aggregation pipeline over `docs`.
pub(crate) fn run_pipeline(mut docs: Vec<Document>, pipeline: &[Document]) -> QueryResult<Vec<Document>> {
    for stage in pipeline {
        let mut entries = stage.iter();
        let (name, spec) = match (entries.next(), entries.next()) {
            (Some(entry), None) => entry,
            _ => return Err(QueryError::invalid_pipeline("each stage needs exactly one field")),
        };
        docs = run_stage(docs, name, spec)?;
    }
    Ok(docs)
}

fn stage_doc<'a>(name: &str, spec: &'a Bson) -> QueryResult<&'a Document> {
    match spec {
        Bson::Document(d) => Ok(d),
        _ => Err(QueryError::invalid_pipeline(format!("{} needs a document", name))),
    }
}

fn stage_count(name: &str, spec: &Bson) -> QueryResult<usize> {
    match as_f64(spec) {
        Some(n) if n >= 0.0 => Ok(n as usize),
        _ => Err(QueryError::invalid_pipeline(format!("{} needs a non-negative number", name))),
    }
}

fn run_stage(mut docs: Vec<Document>, name: &str, spec: &Bson) -> QueryResult<Vec<Document>> {
    match name {
        "$match" => {
            let filter = stage_doc(name, spec)?;
            let mut out = Vec::with_capacity(docs.len());
            for doc in docs {
                if matches(&doc, filter)? {
                    out.push(doc);
                }
            }
            Ok(out)
        }
        "$sort" => {
            sort_documents(&mut docs, &document_keys(stage_doc(name, spec)?)?);
            Ok(docs)
        }
        "$skip" => Ok(docs.into_iter().skip(stage_count(name, spec)?).collect()),
        "$limit" => Ok(docs.into_iter().take(stage_count(name, spec)?).collect()),
        "$project" => {
            let spec = stage_doc(name, spec)?;
            docs.iter().map(|doc| project_stage(doc, spec)).collect()
        }
        "$addFields" | "$set" => {
            let spec = stage_doc(name, spec)?;
            docs.into_iter()
                .map(|mut doc| {
                    for (path, expr) in spec {
                        let value = eval_expr(&doc, expr)?;
                        set_path(&mut doc, path, value).map_err(|e| QueryError::invalid_pipeline(e.message))?;
                    }
                    Ok(doc)
                })
                .collect()
        }
        "$unset" => {
            let paths: Vec<String> = match spec {
                Bson::String(path) => vec![path.clone()],
                Bson::Array(items) => items.iter().filter_map(|i| i.as_str().map(str::to_string)).collect(),
                _ => return Err(QueryError::invalid_pipeline("$unset needs a field or a list of fields")),
            };
            for doc in &mut docs {
                for path in &paths {
                    remove_path(doc, path);
                }
            }
            Ok(docs)
        }
        "$count" => {
            let Bson::String(field) = spec else {
                return Err(QueryError::invalid_pipeline("$count needs a field name"));
            };
            if docs.is_empty() {
                return Ok(Vec::new());
            }
            let mut out = Document::new();
            out.insert(field.clone(), Bson::Int64(docs.len() as i64));
            Ok(vec![out])
        }
        "$unwind" => unwind(docs, spec),
        "$group" => group(docs, stage_doc(name, spec)?),
        "$replaceRoot" | "$replaceWith" => {
            let expr = if name == "$replaceRoot" {
                stage_doc(name, spec)?
                    .get("newRoot")
                    .ok_or_else(|| QueryError::invalid_pipeline("$replaceRoot needs newRoot"))?
            } else {
                spec
            };
            docs.iter()
                .map(|doc| match eval_expr(doc, expr)? {
                    Bson::Document(root) => Ok(root),
                    _ => Err(QueryError::invalid_pipeline("new root must be a document")),
                })
                .collect()
        }
        "$out" | "$merge" | "$lookup" | "$graphLookup" | "$facet" | "$changeStream" => Err(
            QueryError::unsupported(format!("{} is not supported by the in-memory store", name)),
        ),
        other => Err(QueryError::invalid_pipeline(format!("unknown stage {}", other))),
    }
}

fn project_stage(doc: &Document, spec: &Document) -> QueryResult<Document> {
    let computed = spec
        .iter()
        .any(|(k, v)| k != "_id" && !matches!(v, Bson::Int32(_) | Bson::Int64(_) | Bson::Double(_) | Bson::Boolean(_)));
    if !computed {
        return project(doc, spec).map_err(|e| QueryError::invalid_pipeline(e.message));
    }
    let mut out = Document::new();
    if spec.get("_id").is_none_or(is_truthy) {
        if let Some(id) = doc.get("_id") {
            out.insert("_id", id.clone());
        }
    }
    for (path, value) in spec {
        if path == "_id" && matches!(value, Bson::Int32(_) | Bson::Int64(_) | Bson::Double(_) | Bson::Boolean(_)) {
            continue;
        }
        let value = match value {
            Bson::Int32(_) | Bson::Int64(_) | Bson::Double(_) | Bson::Boolean(_) if is_truthy(value) => {
                match get_path(doc, path) {
                    Some(v) => v.clone(),
                    None => continue,
                }
            }
            Bson::Int32(_) | Bson::Int64(_) | Bson::Double(_) | Bson::Boolean(_) => {
                return Err(QueryError::invalid_pipeline("cannot exclude fields while computing new ones"));
            }
            expr => eval_expr(doc, expr)?,
        };
        set_path(&mut out, path, value).map_err(|e| QueryError::invalid_pipeline(e.message))?;
    }
    Ok(out)
}

fn unwind(docs: Vec<Document>, spec: &Bson) -> QueryResult<Vec<Document>> {
    let (path, preserve) = match spec {
        Bson::String(path) => (path.as_str(), false),
        Bson::Document(options) => (
            options
                .get_str("path")
                .map_err(|_| QueryError::invalid_pipeline("$unwind needs a path"))?,
            options.get_bool("preserveNullAndEmptyArrays").unwrap_or(false),
        ),
        _ => return Err(QueryError::invalid_pipeline("$unwind needs a path")),
    };
    let path = path
        .strip_prefix('$')
        .ok_or_else(|| QueryError::invalid_pipeline("$unwind path must start with $"))?;

    let mut out = Vec::new();
    for doc in docs {
        match get_path(&doc, path).cloned() {
            Some(Bson::Array(items)) if !items.is_empty() => {
                for item in items {
                    let mut copy = doc.clone();
                    set_path(&mut copy, path, item).map_err(|e| QueryError::invalid_pipeline(e.message))?;
                    out.push(copy);
                }
            }
            Some(Bson::Array(_)) | Some(Bson::Null) | None => {
                if preserve {
                    let mut copy = doc.clone();
                    if matches!(get_path(&copy, path), Some(Bson::Array(_))) {
                        remove_path(&mut copy, path);
                    }
                    out.push(copy);
                }
            }
            Some(_) => out.push(doc),
        }
    }
    Ok(out)
}

enum Accumulator {
    Sum(Bson),
    Avg(f64, u64),
    Min(Option<Bson>),
    Max(Option<Bson>),
    First(Option<Bson>),
    Last(Bson),
    Push(Vec<Bson>),
    AddToSet(Vec<Bson>),
    Count(i64),
}

impl Accumulator {
    fn new(op: &str) -> QueryResult<Self> {
        Ok(match op {
            "$sum" => Self::Sum(Bson::Int32(0)),
            "$avg" => Self::Avg(0.0, 0),
            "$min" => Self::Min(None),
            "$max" => Self::Max(None),
            "$first" => Self::First(None),
            "$last" => Self::Last(Bson::Null),
            "$push" => Self::Push(Vec::new()),
            "$addToSet" => Self::AddToSet(Vec::new()),
            "$count" => Self::Count(0),
            other => return Err(QueryError::invalid_pipeline(format!("unknown accumulator {}", other))),
        })
    }

    fn feed(&mut self, value: Bson) {
        let present = !matches!(value, Bson::Null | Bson::Undefined);
        match self {
            Self::Sum(total) => {
                if let Some(next) = add_numbers(total, &value) {
                    *total = next;
                }
            }
            Self::Avg(sum, n) => {
                if let Some(v) = as_f64(&value) {
                    *sum += v;
                    *n += 1;
                }
            }
            Self::Min(best) => {
                if present && best.as_ref().is_none_or(|b| compare_bson(&value, b).is_lt()) {
                    *best = Some(value);
                }
            }
            Self::Max(best) => {
                if present && best.as_ref().is_none_or(|b| compare_bson(&value, b).is_gt()) {
                    *best = Some(value);
                }
            }
            Self::First(first) => {
                if first.is_none() {
                    *first = Some(value);
                }
            }
            Self::Last(last) => *last = value,
            Self::Push(items) => items.push(value),
            Self::AddToSet(items) => {
                if !items.iter().any(|item| bson_eq(item, &value)) {
                    items.push(value);
                }
            }
            Self::Count(n) => *n += 1,
        }
    }

    fn finish(self) -> Bson {
        match self {
            Self::Sum(total) => total,
            Self::Avg(_, 0) => Bson::Null,
            Self::Avg(sum, n) => Bson::Double(sum / n as f64),
            Self::Min(v) | Self::Max(v) | Self::First(v) => v.unwrap_or(Bson::Null),
            Self::Last(v) => v,
            Self::Push(items) | Self::AddToSet(items) => Bson::Array(items),
            Self::Count(n) => Bson::Int64(n),
        }
    }
}

fn group(docs: Vec<Document>, spec: &Document) -> QueryResult<Vec<Document>> {
    let key_expr = spec
        .get("_id")
        .ok_or_else(|| QueryError::invalid_pipeline("$group needs an _id"))?;

    let mut fields = Vec::new();
    for (name, acc) in spec {
        if name == "_id" {
            continue;
        }
        let Bson::Document(acc) = acc else {
            return Err(QueryError::invalid_pipeline(format!("accumulator {:?} must be a document", name)));
        };
        let Some((op, expr)) = acc.iter().next() else {
            return Err(QueryError::invalid_pipeline(format!("accumulator {:?} is empty", name)));
        };
        Accumulator::new(op)?;
        fields.push((name.clone(), op.clone(), expr.clone()));
    }

    let mut groups: Vec<(Bson, Vec<Accumulator>)> = Vec::new();
    for doc in &docs {
        let key = eval_expr(doc, key_expr)?;
        let index = match groups.iter().position(|(k, _)| bson_eq(k, &key)) {
            Some(index) => index,
            None => {
                let accs = fields
                    .iter()
                    .map(|(_, op, _)| Accumulator::new(op))
                    .collect::<QueryResult<Vec<_>>>()?;
                groups.push((key, accs));
                groups.len() - 1
            }
        };
        for ((_, _, expr), acc) in fields.iter().zip(groups[index].1.iter_mut()) {
            acc.feed(eval_expr(doc, expr)?);
        }
    }

    Ok(groups
        .into_iter()
        .map(|(key, accs)| {
            let mut out = Document::new();
            out.insert("_id", key);
            for ((name, _, _), acc) in fields.iter().zip(accs) {
                out.insert(name.clone(), acc.finish());
            }
            out
        })
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use bson::doc;
    use pretty_assertions::assert_eq;

    fn orders() -> Vec<Document> {
        vec![
            doc! { "_id": 1, "user": "ada", "total": 10, "items": ["a", "b"] },
            doc! { "_id": 2, "user": "bob", "total": 5, "items": [] },
            doc! { "_id": 3, "user": "ada", "total": 7, "items": ["c"] },
        ]
    }

    #[test]
    fn test_sort_documents_stable() {
        let mut docs = orders();
        sort_documents(&mut docs, &[("user".into(), true)]);
        let ids: Vec<i32> = docs.iter().map(|d| d.get_i32("_id").unwrap()).collect();
        assert_eq!(ids, vec![2, 1, 3]);
    }

    #[test]
    fn test_projection_modes() {
        let doc = doc! { "_id": 1, "a": 1, "b": { "c": 2, "d": 3 } };
        assert_eq!(project(&doc, &doc! { "b.c": 1 }).unwrap(), doc! { "_id": 1, "b": { "c": 2 } });
        assert_eq!(project(&doc, &doc! { "a": 0, "_id": 0 }).unwrap(), doc! { "b": { "c": 2, "d": 3 } });
        assert_eq!(project(&doc, &doc! { "a": 1, "_id": 0 }).unwrap(), doc! { "a": 1 });
        assert!(project(&doc, &doc! { "a": 1, "b": 0 }).is_err());
    }

    #[test]
    fn test_group_and_sort() {
        let out = run_pipeline(
            orders(),
            &[
                doc! { "$group": { "_id": "$user", "sum": { "$sum": "$total" }, "n": { "$sum": 1 } } },
                doc! { "$sort": { "sum": -1 } },
            ],
        )
        .unwrap();
        assert_eq!(
            out,
            vec![
                doc! { "_id": "ada", "sum": 17, "n": 2 },
                doc! { "_id": "bob", "sum": 5, "n": 1 },
            ]
        );
    }

    #[test]
    fn test_unwind_and_count() {
        let out = run_pipeline(orders(), &[doc! { "$unwind": "$items" }, doc! { "$count": "n" }]).unwrap();
        assert_eq!(out, vec![doc! { "n": 3_i64 }]);

        let preserved = run_pipeline(
            orders(),
            &[doc! { "$unwind": { "path": "$items", "preserveNullAndEmptyArrays": true } }],
        )
        .unwrap();
        assert_eq!(preserved.len(), 4);
    }

    #[test]
    fn test_project_with_expressions() {
        let out = run_pipeline(
            orders(),
            &[
                doc! { "$match": { "_id": 1 } },
                doc! { "$project": { "_id": 0, "who": "$user", "double": { "$multiply": ["$total", 2] } } },
            ],
        )
        .unwrap();
        assert_eq!(out, vec![doc! { "who": "ada", "double": 20 }]);
    }

    #[test]
    fn test_unknown_and_unsupported_stages() {
        let err = run_pipeline(orders(), &[doc! { "$frobnicate": {} }]).unwrap_err();
        assert_eq!(err.code, crate::ErrorCode::InvalidPipeline);
        let err = run_pipeline(orders(), &[doc! { "$out": "copy" }]).unwrap_err();
        assert_eq!(err.code, crate::ErrorCode::UnsupportedOperation);
    }
}
