//! The sort mini-language.
//!
//! Sort keys are written as strings:
//! - `"name"` or `"+name"` sorts ascending
//! - `"-name"` sorts descending
//! - `"$textScore:score"` sorts by the text search score, stored under
//!   `score`
//!
//! The same prefix rules describe index keys, so [`sort_field`] is shared
//! with index creation and index-name derivation.
//!
//! ```rust
//! use bson::doc;
//! use docket_query::SortSpec;
//!
//! let spec = SortSpec::parse(["-age", "name", "$textScore:score"]);
//! assert_eq!(
//!     spec.to_document(),
//!     doc! { "age": -1, "name": 1, "score": { "$meta": "textScore" } },
//! );
//! ```

use bson::{Document, doc};

/// Direction of a sort or index key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum SortDirection {
    /// Smallest first.
    #[default]
    Ascending,
    /// Largest first.
    Descending,
}

impl SortDirection {
    /// The numeric wire form: 1 or -1.
    pub fn as_i32(&self) -> i32 {
        match self {
            Self::Ascending => 1,
            Self::Descending => -1,
        }
    }
}

/// One parsed sort key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SortKey {
    /// Sort on a field value.
    Field {
        /// Field path.
        name: String,
        /// Direction.
        direction: SortDirection,
    },
    /// Sort on a metadata value such as the text score.
    Meta {
        /// Field the metadata is projected into.
        name: String,
        /// Metadata kind (e.g. `textScore`).
        kind: String,
    },
}

impl SortKey {
    /// The field this key sorts on.
    pub fn name(&self) -> &str {
        match self {
            Self::Field { name, .. } | Self::Meta { name, .. } => name,
        }
    }
}

/// An ordered list of sort keys.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SortSpec {
    keys: Vec<SortKey>,
}

impl SortSpec {
    /// Parse sort strings. Strings whose field name is empty are skipped.
    pub fn parse<I, S>(fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let keys = fields
            .into_iter()
            .filter_map(|field| parse_sort_key(field.as_ref()))
            .collect();
        Self { keys }
    }

    /// The parsed keys in order.
    pub fn keys(&self) -> &[SortKey] {
        &self.keys
    }

    /// Check if there are no keys.
    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    /// Number of keys.
    pub fn len(&self) -> usize {
        self.keys.len()
    }

    /// The sort as an ordered BSON document.
    pub fn to_document(&self) -> Document {
        let mut out = Document::new();
        for key in &self.keys {
            match key {
                SortKey::Field { name, direction } => {
                    out.insert(name.clone(), direction.as_i32());
                }
                SortKey::Meta { name, kind } => {
                    out.insert(name.clone(), doc! { "$meta": kind.as_str() });
                }
            }
        }
        out
    }
}

/// Split a direction prefix off a field: `-` means descending, `+` or no
/// prefix means ascending.
pub fn sort_field(field: &str) -> (&str, SortDirection) {
    if let Some(rest) = field.strip_prefix('-') {
        (rest, SortDirection::Descending)
    } else if let Some(rest) = field.strip_prefix('+') {
        (rest, SortDirection::Ascending)
    } else {
        (field, SortDirection::Ascending)
    }
}

/// Parse one sort string. Returns `None` when the field name is empty.
pub fn parse_sort_key(raw: &str) -> Option<SortKey> {
    let mut kind = "";
    let mut field = raw;
    if field.starts_with('$') {
        if let Some(colon) = field.find(':') {
            if colon > 1 && colon < field.len() - 1 {
                kind = &field[1..colon];
                field = &field[colon + 1..];
            }
        }
    }

    let (name, direction) = sort_field(field);
    if name.is_empty() {
        return None;
    }

    if kind == "textScore" {
        Some(SortKey::Meta {
            name: name.to_string(),
            kind: kind.to_string(),
        })
    } else {
        Some(SortKey::Field {
            name: name.to_string(),
            direction,
        })
    }
}

/// Build an index key pattern from prefixed field strings.
pub fn index_keys<S: AsRef<str>>(fields: &[S]) -> Document {
    let mut keys = Document::new();
    for field in fields {
        let (name, direction) = sort_field(field.as_ref());
        if !name.is_empty() {
            keys.insert(name, direction.as_i32());
        }
    }
    keys
}

/// Derive the conventional index name from prefixed field strings:
/// `field_dir` pairs joined by `_` (e.g. `["-age", "name"]` gives
/// `age_-1_name_1`).
pub fn index_name<S: AsRef<str>>(fields: &[S]) -> String {
    fields
        .iter()
        .filter_map(|field| {
            let (name, direction) = sort_field(field.as_ref());
            (!name.is_empty()).then(|| format!("{}_{}", name, direction.as_i32()))
        })
        .collect::<Vec<_>>()
        .join("_")
}

/// Derive the conventional index name from a key pattern document.
pub fn index_name_for(keys: &Document) -> String {
    keys.iter()
        .map(|(name, value)| match value {
            bson::Bson::String(s) => format!("{}_{}", name, s),
            other => format!("{}_{}", name, other),
        })
        .collect::<Vec<_>>()
        .join("_")
}
