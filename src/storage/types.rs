//! Core data types for the head index
//!
//! This module defines the fundamental types shared by the WAL and the index:
//! - `ChunkMeta`: time range, size and checksum of one immutable chunk
//! - `LabelSet`: the sorted label set identifying a series
//! - `ChunkRef`: one query result, a chunk resolved to its tenant and series

use crate::storage::error::{HeadError, HeadResult};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::iter::Peekable;
use std::str::{Chars, FromStr};
use xxhash_rust::xxh3::Xxh3;

/// Tenant-scoped series identity: a stable hash of the series' label set.
///
/// Always computed by the caller; the index stores whatever it is given.
pub type Fingerprint = u64;

const LABEL_SEP: [u8; 1] = [0xff];

/// Metadata for one immutable data chunk
///
/// Times are Unix milliseconds, both bounds inclusive.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct ChunkMeta {
    /// Integrity checksum of the chunk payload
    pub checksum: u32,
    /// Earliest sample timestamp
    pub min_time: i64,
    /// Latest sample timestamp
    pub max_time: i64,
    /// Encoded size in KiB
    pub kb: u32,
    /// Number of entries in the chunk
    pub entries: u32,
}

impl ChunkMeta {
    pub fn new(min_time: i64, max_time: i64, checksum: u32) -> Self {
        Self {
            checksum,
            min_time,
            max_time,
            kb: 0,
            entries: 0,
        }
    }

    /// Builder method: set encoded size
    pub fn size_kb(mut self, kb: u32) -> Self {
        self.kb = kb;
        self
    }

    /// Builder method: set entry count
    pub fn entries(mut self, entries: u32) -> Self {
        self.entries = entries;
        self
    }

    /// Check if this chunk intersects the inclusive range `[from, through]`
    pub fn overlaps(&self, from: i64, through: i64) -> bool {
        self.min_time <= through && self.max_time >= from
    }
}

/// A single `name="value"` pair
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Label {
    pub name: String,
    pub value: String,
}

/// Label set of a series, kept sorted by name with unique names
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct LabelSet(Vec<Label>);

impl LabelSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build from arbitrary pairs; on duplicate names the last value wins
    pub fn from_pairs<K, V>(pairs: impl IntoIterator<Item = (K, V)>) -> Self
    where
        K: Into<String>,
        V: Into<String>,
    {
        let sorted: BTreeMap<String, String> = pairs
            .into_iter()
            .map(|(k, v)| (k.into(), v.into()))
            .collect();

        Self(
            sorted
                .into_iter()
                .map(|(name, value)| Label { name, value })
                .collect(),
        )
    }

    /// Builder method: set a label, replacing any existing value
    pub fn with(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        let label = Label {
            name: name.into(),
            value: value.into(),
        };
        match self.0.binary_search_by(|l| l.name.cmp(&label.name)) {
            Ok(idx) => self.0[idx] = label,
            Err(idx) => self.0.insert(idx, label),
        }
        self
    }

    /// Get the value of a label
    pub fn get(&self, name: &str) -> Option<&str> {
        self.0
            .binary_search_by(|l| l.name.as_str().cmp(name))
            .ok()
            .map(|idx| self.0[idx].value.as_str())
    }

    pub fn iter(&self) -> impl Iterator<Item = &Label> {
        self.0.iter()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Conventional fingerprint for this label set.
    ///
    /// xxh3 over `name 0xff value 0xff` for every label in name order.
    pub fn stable_hash(&self) -> Fingerprint {
        let mut hasher = Xxh3::new();
        for label in &self.0 {
            hasher.update(label.name.as_bytes());
            hasher.update(&LABEL_SEP);
            hasher.update(label.value.as_bytes());
            hasher.update(&LABEL_SEP);
        }
        hasher.digest()
    }
}

impl fmt::Display for LabelSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{{")?;
        for (i, label) in self.0.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{}=", label.name)?;
            write_quoted(f, &label.value)?;
        }
        write!(f, "}}")
    }
}

impl FromStr for LabelSet {
    type Err = HeadError;

    /// Parse `{foo="bar", bazz="buzz"}`
    fn from_str(s: &str) -> HeadResult<Self> {
        let invalid = |reason: &str| HeadError::InvalidLabels(format!("{}: {}", reason, s));

        let body = s
            .trim()
            .strip_prefix('{')
            .and_then(|b| b.strip_suffix('}'))
            .ok_or_else(|| invalid("expected {...}"))?;

        let mut pairs = Vec::new();
        let mut chars = body.chars().peekable();
        loop {
            skip_whitespace(&mut chars);
            if chars.peek().is_none() {
                break;
            }

            let name = read_label_name(&mut chars);
            if name.is_empty() {
                return Err(invalid("missing label name"));
            }
            skip_whitespace(&mut chars);
            if chars.next() != Some('=') {
                return Err(invalid("expected '='"));
            }
            skip_whitespace(&mut chars);
            let value = read_quoted(&mut chars).ok_or_else(|| invalid("bad quoted value"))?;
            pairs.push((name, value));

            skip_whitespace(&mut chars);
            match chars.next() {
                None => break,
                Some(',') => continue,
                Some(_) => return Err(invalid("expected ','")),
            }
        }

        Ok(Self::from_pairs(pairs))
    }
}

pub(crate) fn skip_whitespace(chars: &mut Peekable<Chars<'_>>) {
    while chars.peek().is_some_and(|c| c.is_whitespace()) {
        chars.next();
    }
}

pub(crate) fn read_label_name(chars: &mut Peekable<Chars<'_>>) -> String {
    let mut name = String::new();
    while let Some(&c) = chars.peek() {
        if c.is_ascii_alphanumeric() || c == '_' {
            name.push(c);
            chars.next();
        } else {
            break;
        }
    }
    name
}

/// Write `value` double-quoted, escaping what `read_quoted` unescapes
pub(crate) fn write_quoted(f: &mut fmt::Formatter<'_>, value: &str) -> fmt::Result {
    write!(f, "\"")?;
    for c in value.chars() {
        match c {
            '"' => write!(f, "\\\"")?,
            '\\' => write!(f, "\\\\")?,
            '\n' => write!(f, "\\n")?,
            c => write!(f, "{}", c)?,
        }
    }
    write!(f, "\"")
}

/// Read a double-quoted string with `\"`, `\\` and `\n` escapes
pub(crate) fn read_quoted(chars: &mut Peekable<Chars<'_>>) -> Option<String> {
    if chars.next()? != '"' {
        return None;
    }
    let mut out = String::new();
    loop {
        match chars.next()? {
            '"' => return Some(out),
            '\\' => match chars.next()? {
                'n' => out.push('\n'),
                other => out.push(other),
            },
            c => out.push(c),
        }
    }
}

/// A chunk resolved against its tenant and series; the unit of query output
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ChunkRef {
    pub tenant: String,
    pub fingerprint: Fingerprint,
    pub start: i64,
    pub end: i64,
    pub checksum: u32,
}

impl ChunkRef {
    pub fn from_meta(tenant: &str, fingerprint: Fingerprint, meta: &ChunkMeta) -> Self {
        Self {
            tenant: tenant.to_string(),
            fingerprint,
            start: meta.min_time,
            end: meta.max_time,
            checksum: meta.checksum,
        }
    }
}
