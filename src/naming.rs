//! Identifier sanitisation and source-collection patterns
//!
//! Collection and column names are derived from file names and JSON keys, so
//! they have to be turned into identifiers every SQL backend accepts.

use std::collections::HashSet;

use once_cell::sync::Lazy;

/// Maximum identifier length kept after sanitisation
pub const MAX_IDENTIFIER_LENGTH: usize = 58;

/// Columns every Bronze table carries in addition to its inferred schema
pub const SYSTEM_COLUMNS: [&str; 3] = ["content_key", "source_path", "ingested_at"];

static RESERVED: Lazy<HashSet<&'static str>> = Lazy::new(|| {
    [
        "all", "analyse", "analyze", "and", "any", "array", "as", "asc", "asymmetric",
        "authorization", "between", "binary", "both", "case", "cast", "check", "collate",
        "column", "constraint", "create", "cross", "current_catalog", "current_date",
        "current_role", "current_schema", "current_time", "current_timestamp", "current_user",
        "default", "deferrable", "desc", "distinct", "do", "else", "end", "except", "false",
        "fetch", "for", "foreign", "freeze", "from", "full", "grant", "group", "having", "ilike",
        "in", "initially", "inner", "intersect", "into", "is", "isnull", "join", "lateral",
        "leading", "left", "like", "limit", "localtime", "localtimestamp", "natural", "not",
        "notnull", "null", "offset", "on", "only", "or", "order", "outer", "over", "overlaps",
        "placing", "primary", "references", "returning", "right", "select", "session_user",
        "similar", "some", "symmetric", "table", "then", "to", "trailing", "true", "union",
        "unique", "user", "using", "variadic", "verbose", "when", "where", "window", "with",
    ]
    .into_iter()
    .collect()
});

/// Turn an arbitrary name into a lower-case SQL identifier.
///
/// Non-alphanumeric characters become `_`. Names that are empty, start with a
/// digit or underscore, or collide with a reserved word or a Bronze system
/// column are prefixed with `c_`.
pub fn sanitize_identifier(name: &str) -> String {
    let mut out: String = name
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() {
                c.to_ascii_lowercase()
            } else {
                '_'
            }
        })
        .collect();

    if out.is_empty() {
        return "c_empty".to_string();
    }

    let needs_prefix = out.starts_with(|c: char| c.is_ascii_digit() || c == '_')
        || RESERVED.contains(out.as_str())
        || SYSTEM_COLUMNS.contains(&out.as_str());
    if needs_prefix {
        out.insert_str(0, "c_");
    }
    out.truncate(MAX_IDENTIFIER_LENGTH);
    out
}

/// Whether a string is already a valid sanitised identifier
pub fn is_valid_identifier(name: &str) -> bool {
    !name.is_empty() && sanitize_identifier(name) == name
}

/// Quote an identifier for use in generated SQL
pub fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

/// A collection-name pattern such as `spells_*` or `items`
#[derive(Debug, Clone)]
pub struct SourcePattern {
    raw: String,
    pattern: Option<glob::Pattern>,
}

impl SourcePattern {
    pub fn new(raw: &str) -> Self {
        Self {
            raw: raw.to_string(),
            pattern: glob::Pattern::new(raw).ok(),
        }
    }

    pub fn matches(&self, collection: &str) -> bool {
        match &self.pattern {
            Some(pattern) => pattern.matches(collection),
            None => self.raw == collection,
        }
    }

    pub fn as_str(&self) -> &str {
        &self.raw
    }
}

/// Rank a collection against a priority-ordered pattern list.
///
/// Returns the index of the first matching pattern, or `None` if the
/// collection does not contribute.
pub fn priority_rank(patterns: &[String], collection: &str) -> Option<usize> {
    patterns
        .iter()
        .position(|p| SourcePattern::new(p).matches(collection))
}
