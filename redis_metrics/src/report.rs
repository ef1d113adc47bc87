//! Parsing of `INFO` reports.
//!
//! A report is line oriented text. Each interesting line is `field:value`,
//! section headers (`# Memory`) and blank lines carry no colon and are
//! skipped. Some values are themselves lists of `key=value` pairs joined by
//! commas, for instance `db0:keys=5266,expires=5213,avg_ttl=1345519`. Those are
//! split by [`parse_fields`] when a section needs them.
//!
//! Neither parser fails. A field that can't be read is dropped so that an
//! unknown or malformed line never stops the rest of the report from being
//! exported.

use std::collections::{BTreeMap, btree_map};

use rustc_hash::FxHashMap;

/// Field injected in place of a report when a node could not be reached.
pub const DOWN_MARKER: &str = "down";

/// A parsed report: field name to raw, untyped value.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Report {
    fields: BTreeMap<String, String>,
}

impl Report {
    /// The report recorded for a node that failed its probe. It holds only
    /// [`DOWN_MARKER`].
    #[must_use]
    pub fn down() -> Self {
        let mut fields = BTreeMap::new();
        fields.insert(DOWN_MARKER.to_string(), String::new());
        Self { fields }
    }

    /// Whether this report marks its node as unavailable.
    #[must_use]
    pub fn is_down(&self) -> bool {
        self.fields.contains_key(DOWN_MARKER)
    }

    /// Look up the raw value of `field`.
    #[must_use]
    pub fn get(&self, field: &str) -> Option<&str> {
        self.fields.get(field).map(String::as_str)
    }

    /// Iterate fields in name order.
    pub fn iter(&self) -> btree_map::Iter<'_, String, String> {
        self.fields.iter()
    }

    /// Number of fields in the report.
    #[must_use]
    pub fn len(&self) -> usize {
        self.fields.len()
    }

    /// Whether the report has no fields at all.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }
}

impl FromIterator<(String, String)> for Report {
    fn from_iter<T: IntoIterator<Item = (String, String)>>(iter: T) -> Self {
        Self {
            fields: iter.into_iter().collect(),
        }
    }
}

impl<'a> IntoIterator for &'a Report {
    type Item = (&'a String, &'a String);
    type IntoIter = btree_map::Iter<'a, String, String>;

    fn into_iter(self) -> Self::IntoIter {
        self.fields.iter()
    }
}

/// Parse the text of an `INFO` reply.
///
/// Lines are terminated by `\r\n`, a bare `\n` is accepted too. Each line is
/// split at its first colon only, so values such as `master_host:10.0.0.1`
/// or `executable:/usr/bin/redis-server` keep any later colons. The field
/// name is trimmed, the value is kept as is apart from the line terminator.
/// When a field repeats the last occurrence wins.
#[must_use]
pub fn parse(text: &str) -> Report {
    text.lines()
        .filter_map(|line| {
            let (field, value) = line.split_once(':')?;
            let field = field.trim();
            if field.is_empty() {
                return None;
            }
            Some((field.to_string(), value.to_string()))
        })
        .collect()
}

/// Split a `k1=v1,k2=v2` value into its sub-fields.
///
/// Each comma separated segment is split at its first `=`, anything after
/// that belongs to the value. Segments without `=` or with an empty key are
/// dropped.
#[must_use]
pub fn parse_fields(value: &str) -> FxHashMap<&str, &str> {
    value
        .split(',')
        .filter_map(|segment| {
            let (key, value) = segment.split_once('=')?;
            let key = key.trim();
            if key.is_empty() {
                return None;
            }
            Some((key, value.trim()))
        })
        .collect()
}
