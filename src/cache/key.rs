//! Query keys and the patterns used to select them.

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::hash::{Hash, Hasher};

use crate::error::{QueryError, Result};

/// One primitive segment of a query key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum KeyPart {
  Int(i64),
  Bool(bool),
  Str(String),
}

impl KeyPart {
  fn render(&self, out: &mut String) {
    match self {
      KeyPart::Int(n) => out.push_str(&n.to_string()),
      KeyPart::Bool(b) => out.push_str(if *b { "true" } else { "false" }),
      KeyPart::Str(s) => {
        for c in s.chars() {
          if c == ':' || c == '\\' {
            out.push('\\');
          }
          out.push(c);
        }
      }
    }
  }
}

impl From<&str> for KeyPart {
  fn from(s: &str) -> Self {
    KeyPart::Str(s.to_string())
  }
}

impl From<String> for KeyPart {
  fn from(s: String) -> Self {
    KeyPart::Str(s)
  }
}

impl From<i64> for KeyPart {
  fn from(n: i64) -> Self {
    KeyPart::Int(n)
  }
}

impl From<i32> for KeyPart {
  fn from(n: i32) -> Self {
    KeyPart::Int(n as i64)
  }
}

impl From<u32> for KeyPart {
  fn from(n: u32) -> Self {
    KeyPart::Int(n as i64)
  }
}

impl From<usize> for KeyPart {
  fn from(n: usize) -> Self {
    KeyPart::Int(n as i64)
  }
}

impl From<bool> for KeyPart {
  fn from(b: bool) -> Self {
    KeyPart::Bool(b)
  }
}

/// An ordered sequence of key parts, compared by its canonical string.
///
/// Parts are joined with `:`; a `:` or `\` inside a string part is escaped with `\`,
/// so `["a:b"]` and `["a", "b"]` stay distinct.
#[derive(Clone, Serialize, Deserialize)]
#[serde(from = "Vec<KeyPart>", into = "Vec<KeyPart>")]
pub struct QueryKey {
  parts: Vec<KeyPart>,
  canonical: String,
}

impl QueryKey {
  pub fn new(parts: Vec<KeyPart>) -> Self {
    let mut canonical = String::new();
    for (i, part) in parts.iter().enumerate() {
      if i > 0 {
        canonical.push(':');
      }
      part.render(&mut canonical);
    }
    Self { parts, canonical }
  }

  /// Start a key from its first part, e.g. `QueryKey::root("user").with(42)`.
  pub fn root(part: impl Into<KeyPart>) -> Self {
    Self::new(vec![part.into()])
  }

  /// Return a new key extended by one part.
  pub fn with(&self, part: impl Into<KeyPart>) -> Self {
    let mut parts = self.parts.clone();
    parts.push(part.into());
    Self::new(parts)
  }

  /// Parse a canonical string back into parts. Integer-looking parts become `Int`.
  pub fn parse(s: &str) -> Self {
    let mut parts = Vec::new();
    let mut current = String::new();
    let mut chars = s.chars();
    while let Some(c) = chars.next() {
      match c {
        '\\' => {
          if let Some(next) = chars.next() {
            current.push(next);
          }
        }
        ':' => parts.push(Self::parse_part(std::mem::take(&mut current))),
        _ => current.push(c),
      }
    }
    parts.push(Self::parse_part(current));
    Self::new(parts)
  }

  fn parse_part(s: String) -> KeyPart {
    match s.parse::<i64>() {
      Ok(n) => KeyPart::Int(n),
      Err(_) => KeyPart::Str(s),
    }
  }

  pub fn parts(&self) -> &[KeyPart] {
    &self.parts
  }

  pub fn canonical(&self) -> &str {
    &self.canonical
  }

  /// First part rendered as text, used as the entity kind / profile prefix.
  pub fn head(&self) -> Option<String> {
    self.parts.first().map(|p| {
      let mut s = String::new();
      p.render(&mut s);
      s
    })
  }

  /// Whether this key equals `prefix` or extends it by whole parts.
  pub fn starts_with(&self, prefix: &QueryKey) -> bool {
    self.canonical == prefix.canonical
      || (self.canonical.starts_with(&prefix.canonical)
        && self.canonical[prefix.canonical.len()..].starts_with(':'))
  }
}

impl From<Vec<KeyPart>> for QueryKey {
  fn from(parts: Vec<KeyPart>) -> Self {
    Self::new(parts)
  }
}

impl From<QueryKey> for Vec<KeyPart> {
  fn from(key: QueryKey) -> Self {
    key.parts
  }
}

impl From<&str> for QueryKey {
  fn from(s: &str) -> Self {
    Self::parse(s)
  }
}

impl PartialEq for QueryKey {
  fn eq(&self, other: &Self) -> bool {
    self.canonical == other.canonical
  }
}

impl Eq for QueryKey {}

impl Hash for QueryKey {
  fn hash<H: Hasher>(&self, state: &mut H) {
    self.canonical.hash(state);
  }
}

impl fmt::Debug for QueryKey {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "QueryKey({})", self.canonical)
  }
}

impl fmt::Display for QueryKey {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(&self.canonical)
  }
}

/// Selects a set of cache entries by key.
#[derive(Debug, Clone)]
pub enum KeyPattern {
  /// Exactly one key.
  Exact(QueryKey),
  /// The key and every key extending it by whole parts.
  Prefix(QueryKey),
  /// `*` matches any run of characters in the canonical string.
  Glob { source: String, regex: Regex },
}

impl KeyPattern {
  pub fn exact(key: impl Into<QueryKey>) -> Self {
    KeyPattern::Exact(key.into())
  }

  pub fn prefix(key: impl Into<QueryKey>) -> Self {
    KeyPattern::Prefix(key.into())
  }

  pub fn glob(source: &str) -> Result<Self> {
    let body = source
      .split('*')
      .map(regex::escape)
      .collect::<Vec<_>>()
      .join(".*");
    let regex = Regex::new(&format!("^{}$", body))
      .map_err(|e| QueryError::Validation(format!("invalid pattern '{}': {}", source, e)))?;
    Ok(KeyPattern::Glob {
      source: source.to_string(),
      regex,
    })
  }

  /// Parse pattern text: anything containing `*` is a glob, everything else a prefix.
  pub fn parse(s: &str) -> Result<Self> {
    if s.contains('*') {
      Self::glob(s)
    } else {
      Ok(KeyPattern::Prefix(QueryKey::parse(s)))
    }
  }

  pub fn matches(&self, key: &QueryKey) -> bool {
    match self {
      KeyPattern::Exact(k) => k == key,
      KeyPattern::Prefix(p) => key.starts_with(p),
      KeyPattern::Glob { regex, .. } => regex.is_match(key.canonical()),
    }
  }
}

impl From<QueryKey> for KeyPattern {
  fn from(key: QueryKey) -> Self {
    KeyPattern::Exact(key)
  }
}

impl fmt::Display for KeyPattern {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      KeyPattern::Exact(k) => write!(f, "{}", k),
      KeyPattern::Prefix(k) => write!(f, "{}:*", k),
      KeyPattern::Glob { source, .. } => f.write_str(source),
    }
  }
}
