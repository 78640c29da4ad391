//! Related-entity prefetching.
//!
//! After an entity of some kind is fetched, the orchestrator looks up which child
//! queries usually follow it (a project's tasks, a user's settings, ...) and warms
//! them in the background.

use serde_json::Value;
use std::collections::HashMap;
use std::sync::RwLock;
use tracing::{debug, warn};

use crate::cache::{Fetcher, KeyPart, QueryKey};
use crate::error::QueryError;
use crate::executor::{QueryExecutor, QueryOptions, RetryPolicy};

#[derive(Debug, Clone, PartialEq, Eq)]
enum TemplatePart {
  Literal(KeyPart),
  Field(String),
}

/// A key template such as `project:{id}:tasks`.
///
/// `{field}` placeholders are filled from top-level fields of the source payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyTemplate {
  parts: Vec<TemplatePart>,
}

impl KeyTemplate {
  pub fn parse(template: &str) -> Self {
    let parts = QueryKey::parse(template)
      .parts()
      .iter()
      .map(|part| match part {
        KeyPart::Str(s) if s.starts_with('{') && s.ends_with('}') && s.len() > 2 => {
          TemplatePart::Field(s[1..s.len() - 1].to_string())
        }
        other => TemplatePart::Literal(other.clone()),
      })
      .collect();
    Self { parts }
  }

  /// Keys derived from `data`. An array payload yields one key per element.
  pub fn resolve(&self, data: &Value) -> Vec<QueryKey> {
    match data {
      Value::Array(items) => items.iter().filter_map(|item| self.resolve_one(item)).collect(),
      other => self.resolve_one(other).into_iter().collect(),
    }
  }

  fn resolve_one(&self, item: &Value) -> Option<QueryKey> {
    let mut parts = Vec::with_capacity(self.parts.len());
    for part in &self.parts {
      match part {
        TemplatePart::Literal(p) => parts.push(p.clone()),
        TemplatePart::Field(name) => match item.get(name) {
          Some(Value::String(s)) => parts.push(KeyPart::Str(s.clone())),
          Some(Value::Bool(b)) => parts.push(KeyPart::Bool(*b)),
          Some(Value::Number(n)) if n.is_i64() => parts.push(KeyPart::Int(n.as_i64()?)),
          _ => {
            debug!(field = %name, "Prefetch template field missing from payload");
            return None;
          }
        },
      }
    }
    Some(QueryKey::new(parts))
  }
}

/// One child query to warm after an entity of the source kind loads.
#[derive(Clone)]
pub struct Relation {
  pub template: KeyTemplate,
  pub fetcher: Fetcher,
  /// Kind of the child entity, so prefetches can chain.
  pub child_kind: Option<String>,
}

impl Relation {
  pub fn new(template: &str, fetcher: Fetcher) -> Self {
    Self {
      template: KeyTemplate::parse(template),
      fetcher,
      child_kind: None,
    }
  }

  pub fn with_child_kind(mut self, kind: impl Into<String>) -> Self {
    self.child_kind = Some(kind.into());
    self
  }
}

/// Static relation table from entity kind to child queries.
#[derive(Default)]
pub struct PrefetchOrchestrator {
  relations: RwLock<HashMap<String, Vec<Relation>>>,
}

impl PrefetchOrchestrator {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn register(&self, kind: impl Into<String>, relation: Relation) {
    self
      .relations
      .write()
      .unwrap_or_else(|e| e.into_inner())
      .entry(kind.into())
      .or_default()
      .push(relation);
  }

  /// Issue background fetches for everything related to `data`.
  ///
  /// Returns the number of fetches issued. Keys that are already fresh are skipped.
  /// Failures are logged here and never reach the caller.
  pub fn prefetch_related(&self, executor: &QueryExecutor, kind: &str, data: &Value) -> usize {
    let relations = match self
      .relations
      .read()
      .unwrap_or_else(|e| e.into_inner())
      .get(kind)
    {
      Some(relations) => relations.clone(),
      None => {
        let err = QueryError::UnknownCollaborator(format!("no prefetch relations for '{}'", kind));
        warn!("{}", err);
        return 0;
      }
    };

    let mut issued = 0;
    for relation in relations {
      for key in relation.template.resolve(data) {
        if executor.is_fresh(&key) {
          continue;
        }

        let mut options = QueryOptions::default().with_retry(RetryPolicy::none());
        options.prefetch_kind = relation.child_kind.clone();
        let fetcher = relation.fetcher.clone();
        let exec = executor.clone();
        debug!(key = %key, source = kind, "Prefetching related query");

        executor.scheduler().spawn(async move {
          match exec.execute(&key, fetcher, &options).await {
            Ok(_) => {}
            Err(e) if e.is_abort() => {}
            Err(e) => warn!(key = %key, "Prefetch failed: {}", e),
          }
        });
        issued += 1;
      }
    }
    issued
  }
}
