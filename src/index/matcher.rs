//! Label matchers
//!
//! A matcher tests one label of a series. A series without the label is
//! tested as if the label had the empty value, so `env=""` selects series
//! that lack `env` and `env=~".+"` selects series that carry it.

use crate::storage::error::{HeadError, HeadResult};
use crate::storage::types::{read_label_name, read_quoted, skip_whitespace, write_quoted, LabelSet};
use regex::Regex;
use std::fmt;
use std::str::FromStr;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MatchType {
    Equal,
    NotEqual,
    Regex,
    NotRegex,
}

impl MatchType {
    fn operator(&self) -> &'static str {
        match self {
            MatchType::Equal => "=",
            MatchType::NotEqual => "!=",
            MatchType::Regex => "=~",
            MatchType::NotRegex => "!~",
        }
    }
}

#[derive(Debug, Clone)]
pub struct Matcher {
    name: String,
    value: String,
    kind: MatchType,
    /// Anchored form of `value`, compiled for regex kinds
    re: Option<Regex>,
}

impl Matcher {
    pub fn new(kind: MatchType, name: impl Into<String>, value: impl Into<String>) -> HeadResult<Self> {
        let value = value.into();
        let re = match kind {
            MatchType::Regex | MatchType::NotRegex => {
                Some(Regex::new(&format!("^(?:{})$", value))?)
            }
            MatchType::Equal | MatchType::NotEqual => None,
        };

        Ok(Self {
            name: name.into(),
            value,
            kind,
            re,
        })
    }

    pub fn equal(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
            kind: MatchType::Equal,
            re: None,
        }
    }

    pub fn regex(name: impl Into<String>, pattern: impl Into<String>) -> HeadResult<Self> {
        Self::new(MatchType::Regex, name, pattern)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn value(&self) -> &str {
        &self.value
    }

    pub fn kind(&self) -> MatchType {
        self.kind
    }

    pub fn matches_value(&self, value: &str) -> bool {
        match (self.kind, &self.re) {
            (MatchType::Equal, _) => value == self.value,
            (MatchType::NotEqual, _) => value != self.value,
            (MatchType::Regex, Some(re)) => re.is_match(value),
            (MatchType::NotRegex, Some(re)) => !re.is_match(value),
            // Regex kinds are always compiled in `new`
            (MatchType::Regex, None) | (MatchType::NotRegex, None) => false,
        }
    }

    pub fn matches(&self, labels: &LabelSet) -> bool {
        self.matches_value(labels.get(&self.name).unwrap_or(""))
    }
}

/// True if every matcher accepts the label set. An empty list accepts all.
pub fn matches_all(matchers: &[Matcher], labels: &LabelSet) -> bool {
    matchers.iter().all(|m| m.matches(labels))
}

impl PartialEq for Matcher {
    fn eq(&self, other: &Self) -> bool {
        self.kind == other.kind && self.name == other.name && self.value == other.value
    }
}

impl fmt::Display for Matcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", self.name, self.kind.operator())?;
        write_quoted(f, &self.value)
    }
}

impl FromStr for Matcher {
    type Err = HeadError;

    /// Parse `name="v"`, `name!="v"`, `name=~"re"` or `name!~"re"`
    fn from_str(s: &str) -> HeadResult<Self> {
        let invalid = |reason: &str| HeadError::InvalidMatcher(format!("{}: {}", reason, s));

        let mut chars = s.trim().chars().peekable();
        let name = read_label_name(&mut chars);
        if name.is_empty() {
            return Err(invalid("missing label name"));
        }
        skip_whitespace(&mut chars);

        let kind = match (chars.next(), chars.peek().copied()) {
            (Some('='), Some('~')) => MatchType::Regex,
            (Some('!'), Some('=')) => MatchType::NotEqual,
            (Some('!'), Some('~')) => MatchType::NotRegex,
            (Some('='), _) => MatchType::Equal,
            _ => return Err(invalid("expected one of =, !=, =~, !~")),
        };
        if kind != MatchType::Equal {
            chars.next();
        }

        skip_whitespace(&mut chars);
        let value = read_quoted(&mut chars).ok_or_else(|| invalid("bad quoted value"))?;
        skip_whitespace(&mut chars);
        if chars.next().is_some() {
            return Err(invalid("trailing characters"));
        }

        Self::new(kind, name, value)
    }
}
