//! Request options and the option compiler.
//!
//! Builders accumulate settings in an [`OptionSet`]. When a terminal
//! operation runs, [`OptionSet::compile`] picks the settings that apply to
//! the request's [`RequestShape`] and produces an immutable
//! [`RequestOptions`]. Absent settings stay absent: stores fall back to
//! their own defaults for anything left unset.

use std::time::Duration;

use bson::{Document, Timestamp, doc};
use serde::{Deserialize, Serialize};

use crate::sort::SortSpec;

/// Index hint: either an index name or its key pattern.
#[derive(Debug, Clone, PartialEq)]
pub enum Hint {
    /// Index name.
    Name(String),
    /// Index key pattern.
    Keys(Document),
}

impl Hint {
    /// The hint as a BSON value.
    pub fn to_bson(&self) -> bson::Bson {
        match self {
            Self::Name(name) => bson::Bson::String(name.clone()),
            Self::Keys(keys) => bson::Bson::Document(keys.clone()),
        }
    }
}

impl From<&str> for Hint {
    fn from(name: &str) -> Self {
        Self::Name(name.to_string())
    }
}

impl From<String> for Hint {
    fn from(name: String) -> Self {
        Self::Name(name)
    }
}

impl From<Document> for Hint {
    fn from(keys: Document) -> Self {
        Self::Keys(keys)
    }
}

/// Language-specific string comparison rules.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Collation {
    /// ICU locale.
    pub locale: String,
    /// Case-sensitive comparison at strength 1 or 2.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub case_level: Option<bool>,
    /// Sort order of case differences (`upper`, `lower`, `off`).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub case_first: Option<String>,
    /// Comparison level, 1 to 5.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub strength: Option<i32>,
    /// Compare numeric strings as numbers.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub numeric_ordering: Option<bool>,
    /// Whether whitespace and punctuation are considered base characters.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub alternate: Option<String>,
    /// Characters ignored under `alternate: "shifted"`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_variable: Option<String>,
    /// Check whether text requires normalization.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub normalization: Option<bool>,
    /// Sort strings with diacritics from the back of the string.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub backwards: Option<bool>,
}

impl Collation {
    /// Create a collation for `locale`.
    pub fn new(locale: impl Into<String>) -> Self {
        Self {
            locale: locale.into(),
            case_level: None,
            case_first: None,
            strength: None,
            numeric_ordering: None,
            alternate: None,
            max_variable: None,
            normalization: None,
            backwards: None,
        }
    }

    /// Set the comparison strength.
    pub fn strength(mut self, strength: i32) -> Self {
        self.strength = Some(strength);
        self
    }

    /// Enable case-level comparison.
    pub fn case_level(mut self, enabled: bool) -> Self {
        self.case_level = Some(enabled);
        self
    }

    /// Compare numeric strings as numbers.
    pub fn numeric_ordering(mut self, enabled: bool) -> Self {
        self.numeric_ordering = Some(enabled);
        self
    }

    /// The collation as a BSON document.
    pub fn to_document(&self) -> Document {
        let mut out = doc! { "locale": &self.locale };
        if let Some(v) = self.case_level {
            out.insert("caseLevel", v);
        }
        if let Some(ref v) = self.case_first {
            out.insert("caseFirst", v.as_str());
        }
        if let Some(v) = self.strength {
            out.insert("strength", v);
        }
        if let Some(v) = self.numeric_ordering {
            out.insert("numericOrdering", v);
        }
        if let Some(ref v) = self.alternate {
            out.insert("alternate", v.as_str());
        }
        if let Some(ref v) = self.max_variable {
            out.insert("maxVariable", v.as_str());
        }
        if let Some(v) = self.normalization {
            out.insert("normalization", v);
        }
        if let Some(v) = self.backwards {
            out.insert("backwards", v);
        }
        out
    }
}

/// Which version of a document find-and-modify returns.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ReturnDocument {
    /// The document as it was before the modification.
    #[default]
    Before,
    /// The document as it is after the modification.
    After,
}

/// How change events carry the full document of updates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FullDocument {
    /// Only inserts and replaces carry the full document.
    #[default]
    Default,
    /// Look up the current document for updates.
    UpdateLookup,
    /// Include the post-image when it is available.
    WhenAvailable,
    /// Include the post-image, failing if it is unavailable.
    Required,
}

impl FullDocument {
    /// The wire name of the mode.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Default => "default",
            Self::UpdateLookup => "updateLookup",
            Self::WhenAvailable => "whenAvailable",
            Self::Required => "required",
        }
    }
}

/// Read isolation level.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReadConcern {
    /// Return the instance's most recent data.
    Local,
    /// Return data acknowledged by a majority of members.
    Majority,
    /// Read from a consistent snapshot.
    Snapshot,
    /// Linearizable reads.
    Linearizable,
    /// Return available data without consistency guarantees.
    Available,
}

impl ReadConcern {
    /// The wire name of the level.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Local => "local",
            Self::Majority => "majority",
            Self::Snapshot => "snapshot",
            Self::Linearizable => "linearizable",
            Self::Available => "available",
        }
    }
}

/// Write acknowledgment level.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WriteConcern {
    /// Acknowledged by this many members.
    W(u32),
    /// Acknowledged by a majority of members.
    Majority,
    /// Acknowledged according to a custom tag set.
    Tag(String),
}

impl WriteConcern {
    /// The write concern as a BSON document.
    pub fn to_document(&self) -> Document {
        match self {
            Self::W(n) => doc! { "w": *n as i64 },
            Self::Majority => doc! { "w": "majority" },
            Self::Tag(tag) => doc! { "w": tag.as_str() },
        }
    }
}

/// The kind of request an option set is compiled for.
///
/// Each shape accepts a different subset of settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RequestShape {
    /// Multi-document find.
    Find,
    /// Single-document find.
    FindOne,
    /// Document count.
    Count,
    /// Aggregation pipeline.
    Aggregate,
    /// Distinct values of a field.
    Distinct,
    /// Atomic find-and-modify.
    FindAndModify,
    /// Bulk write batch.
    BulkWrite,
    /// Change stream.
    Watch,
}

/// Settings accumulated by a builder.
///
/// Every field is optional; unset fields never reach the request.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct OptionSet {
    pub(crate) projection: Option<Document>,
    pub(crate) sort: Option<SortSpec>,
    pub(crate) skip: Option<u64>,
    pub(crate) limit: Option<i64>,
    pub(crate) batch_size: Option<u32>,
    pub(crate) hint: Option<Hint>,
    pub(crate) collation: Option<Collation>,
    pub(crate) comment: Option<String>,
    pub(crate) max_time: Option<Duration>,
    pub(crate) max_await_time: Option<Duration>,
    pub(crate) max: Option<Document>,
    pub(crate) min: Option<Document>,
    pub(crate) allow_disk_use: Option<bool>,
    pub(crate) allow_partial_results: Option<bool>,
    pub(crate) no_cursor_timeout: Option<bool>,
    pub(crate) return_key: Option<bool>,
    pub(crate) show_record_id: Option<bool>,
    pub(crate) upsert: Option<bool>,
    pub(crate) bypass_document_validation: Option<bool>,
    pub(crate) ordered: Option<bool>,
    pub(crate) return_document: Option<ReturnDocument>,
    pub(crate) array_filters: Option<Vec<Document>>,
    pub(crate) full_document: Option<FullDocument>,
    pub(crate) resume_after: Option<Document>,
    pub(crate) start_after: Option<Document>,
    pub(crate) start_at_operation_time: Option<Timestamp>,
}

/// An immutable request descriptor's option block.
///
/// Produced by [`OptionSet::compile`]; only fields applicable to the
/// request shape it was compiled for can be set.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RequestOptions {
    /// Fields to include or exclude.
    pub projection: Option<Document>,
    /// Sort order.
    pub sort: Option<SortSpec>,
    /// Documents to skip.
    pub skip: Option<u64>,
    /// Maximum documents to return. Negative means a single batch.
    pub limit: Option<i64>,
    /// Documents per batch.
    pub batch_size: Option<u32>,
    /// Index to use.
    pub hint: Option<Hint>,
    /// String comparison rules.
    pub collation: Option<Collation>,
    /// Comment attached to the command for profiling.
    pub comment: Option<String>,
    /// Server-side time limit.
    pub max_time: Option<Duration>,
    /// Maximum wait for new data on tailable reads.
    pub max_await_time: Option<Duration>,
    /// Exclusive upper index bound.
    pub max: Option<Document>,
    /// Inclusive lower index bound.
    pub min: Option<Document>,
    /// Allow spilling to disk.
    pub allow_disk_use: Option<bool>,
    /// Return partial results when shards are down.
    pub allow_partial_results: Option<bool>,
    /// Disable the idle cursor timeout.
    pub no_cursor_timeout: Option<bool>,
    /// Return only index keys.
    pub return_key: Option<bool>,
    /// Include the record id of each document.
    pub show_record_id: Option<bool>,
    /// Insert when nothing matches.
    pub upsert: Option<bool>,
    /// Skip schema validation.
    pub bypass_document_validation: Option<bool>,
    /// Stop a bulk batch at the first failure.
    pub ordered: Option<bool>,
    /// Which version of the document find-and-modify returns.
    pub return_document: Option<ReturnDocument>,
    /// Filters selecting array elements to update.
    pub array_filters: Option<Vec<Document>>,
    /// Full-document mode of change events.
    pub full_document: Option<FullDocument>,
    /// Resume a change stream after this token.
    pub resume_after: Option<Document>,
    /// Start a change stream after this token.
    pub start_after: Option<Document>,
    /// Start a change stream at this cluster time.
    pub start_at_operation_time: Option<Timestamp>,
}

fn pick<T: Clone>(allowed: bool, value: &Option<T>) -> Option<T> {
    if allowed { value.clone() } else { None }
}

impl OptionSet {
    /// Create an empty option set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Check if no setting was applied.
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }

    /// The sort order accumulated so far.
    pub fn sort_spec(&self) -> Option<&SortSpec> {
        self.sort.as_ref()
    }

    /// Compile the settings that apply to `shape` into request options.
    ///
    /// Compiling is pure: the same set and shape always produce the same
    /// options, and the set itself is left untouched.
    pub fn compile(&self, shape: RequestShape) -> RequestOptions {
        use RequestShape::*;
        let on = |shapes: &[RequestShape]| shapes.contains(&shape);

        RequestOptions {
            projection: pick(on(&[Find, FindOne, FindAndModify]), &self.projection),
            sort: pick(on(&[Find, FindOne, FindAndModify]), &self.sort),
            skip: pick(on(&[Find, FindOne, Count]), &self.skip),
            limit: pick(on(&[Find, Count]), &self.limit),
            batch_size: pick(on(&[Find, Aggregate, Watch]), &self.batch_size),
            hint: pick(on(&[Find, FindOne, Count, Aggregate, FindAndModify]), &self.hint),
            collation: pick(!on(&[BulkWrite]), &self.collation),
            comment: pick(on(&[Find, FindOne, Aggregate]), &self.comment),
            max_time: pick(
                on(&[Find, FindOne, Count, Aggregate, Distinct, FindAndModify]),
                &self.max_time,
            ),
            max_await_time: pick(on(&[Find, Aggregate, Watch]), &self.max_await_time),
            max: pick(on(&[Find, FindOne]), &self.max),
            min: pick(on(&[Find, FindOne]), &self.min),
            allow_disk_use: pick(on(&[Find, Aggregate]), &self.allow_disk_use),
            allow_partial_results: pick(on(&[Find, FindOne]), &self.allow_partial_results),
            no_cursor_timeout: pick(on(&[Find]), &self.no_cursor_timeout),
            return_key: pick(on(&[Find, FindOne]), &self.return_key),
            show_record_id: pick(on(&[Find, FindOne]), &self.show_record_id),
            upsert: pick(on(&[FindAndModify]), &self.upsert),
            bypass_document_validation: pick(
                on(&[Aggregate, FindAndModify, BulkWrite]),
                &self.bypass_document_validation,
            ),
            ordered: pick(on(&[BulkWrite]), &self.ordered),
            return_document: pick(on(&[FindAndModify]), &self.return_document),
            array_filters: pick(on(&[FindAndModify]), &self.array_filters),
            full_document: pick(on(&[Watch]), &self.full_document),
            resume_after: pick(on(&[Watch]), &self.resume_after),
            start_after: pick(on(&[Watch]), &self.start_after),
            start_at_operation_time: pick(on(&[Watch]), &self.start_at_operation_time),
        }
    }
}

impl RequestOptions {
    /// Whether a bulk batch stops at the first failure. Defaults to true.
    pub fn is_ordered(&self) -> bool {
        self.ordered.unwrap_or(true)
    }

    /// The server-side time limit in milliseconds.
    pub fn max_time_ms(&self) -> Option<i64> {
        self.max_time.map(|d| d.as_millis() as i64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn sample() -> OptionSet {
        OptionSet {
            projection: Some(doc! { "name": 1 }),
            sort: Some(SortSpec::parse(["-age"])),
            skip: Some(5),
            limit: Some(10),
            batch_size: Some(100),
            hint: Some(Hint::from("age_1")),
            max_time: Some(Duration::from_millis(250)),
            upsert: Some(true),
            ordered: Some(false),
            ..OptionSet::default()
        }
    }

    #[test]
    fn test_empty_set_compiles_to_empty_options() {
        let set = OptionSet::new();
        assert!(set.is_empty());
        assert_eq!(set.compile(RequestShape::Find), RequestOptions::default());
    }

    #[test]
    fn test_compile_is_deterministic() {
        let set = sample();
        assert_eq!(set.compile(RequestShape::Find), set.compile(RequestShape::Find));
        assert_eq!(set, sample());
    }

    #[test]
    fn test_find_one_drops_limit_and_batch_size() {
        let opts = sample().compile(RequestShape::FindOne);
        assert_eq!(opts.limit, None);
        assert_eq!(opts.batch_size, None);
        assert_eq!(opts.skip, Some(5));
        assert_eq!(opts.projection, Some(doc! { "name": 1 }));
    }

    #[test]
    fn test_count_subset() {
        let opts = sample().compile(RequestShape::Count);
        assert_eq!(opts.skip, Some(5));
        assert_eq!(opts.limit, Some(10));
        assert_eq!(opts.hint, Some(Hint::Name("age_1".into())));
        assert_eq!(opts.projection, None);
        assert_eq!(opts.sort, None);
    }

    #[test]
    fn test_bulk_subset() {
        let opts = sample().compile(RequestShape::BulkWrite);
        assert!(!opts.is_ordered());
        assert_eq!(opts.upsert, None);
        assert_eq!(opts.max_time, None);
    }

    #[test]
    fn test_max_time_ms() {
        let opts = sample().compile(RequestShape::Aggregate);
        assert_eq!(opts.max_time_ms(), Some(250));
        assert!(RequestOptions::default().is_ordered());
    }

    #[test]
    fn test_collation_document() {
        let collation = Collation::new("en").strength(2).numeric_ordering(true);
        assert_eq!(
            collation.to_document(),
            doc! { "locale": "en", "strength": 2, "numericOrdering": true }
        );
    }

    #[test]
    fn test_write_concern_document() {
        assert_eq!(WriteConcern::Majority.to_document(), doc! { "w": "majority" });
        assert_eq!(WriteConcern::W(2).to_document(), doc! { "w": 2_i64 });
    }
}
