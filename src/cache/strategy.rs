//! Strategy profiles: default TTL behaviour per family of keys.

use serde::Deserialize;
use std::time::Duration;

use super::key::QueryKey;

/// Preset freshness strategies.
#[derive(Debug, Clone, Copy, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Strategy {
  /// Reference data that practically never changes
  Static,
  /// Data that changes occasionally
  #[default]
  SemiStatic,
  /// User-facing data that changes during a session
  Dynamic,
  /// Data that should be polled
  Realtime,
}

impl Strategy {
  pub fn profile(self) -> StrategyProfile {
    match self {
      Strategy::Static => {
        StrategyProfile::new(Duration::from_secs(60 * 60), Duration::from_secs(24 * 60 * 60))
      }
      Strategy::SemiStatic => {
        StrategyProfile::new(Duration::from_secs(5 * 60), Duration::from_secs(30 * 60))
      }
      Strategy::Dynamic => {
        StrategyProfile::new(Duration::from_secs(30), Duration::from_secs(5 * 60)).with_focus(true)
      }
      Strategy::Realtime => StrategyProfile::new(Duration::ZERO, Duration::from_secs(60))
        .with_focus(true)
        .with_interval(Duration::from_secs(10)),
    }
  }
}

/// A bundle of freshness settings applied to every key under a prefix.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StrategyProfile {
  pub stale_time: Duration,
  pub gc_time: Duration,
  pub refetch_on_focus: bool,
  pub refetch_interval: Option<Duration>,
}

impl StrategyProfile {
  /// `stale_time` is clamped to `gc_time` so an entry never expires before it goes stale.
  pub fn new(stale_time: Duration, gc_time: Duration) -> Self {
    Self {
      stale_time: stale_time.min(gc_time),
      gc_time,
      refetch_on_focus: false,
      refetch_interval: None,
    }
  }

  pub fn with_focus(mut self, refetch_on_focus: bool) -> Self {
    self.refetch_on_focus = refetch_on_focus;
    self
  }

  pub fn with_interval(mut self, interval: Duration) -> Self {
    self.refetch_interval = Some(interval);
    self
  }
}

impl Default for StrategyProfile {
  fn default() -> Self {
    Strategy::default().profile()
  }
}

/// Prefix → profile bindings, resolved longest prefix first.
#[derive(Debug, Clone, Default)]
pub struct ProfileTable {
  bindings: Vec<(QueryKey, StrategyProfile)>,
  default: StrategyProfile,
}

impl ProfileTable {
  pub fn new(default: StrategyProfile) -> Self {
    Self {
      bindings: Vec::new(),
      default,
    }
  }

  pub fn bind(mut self, prefix: impl Into<QueryKey>, profile: StrategyProfile) -> Self {
    self.bindings.push((prefix.into(), profile));
    self
      .bindings
      .sort_by(|a, b| b.0.parts().len().cmp(&a.0.parts().len()));
    self
  }

  pub fn resolve(&self, key: &QueryKey) -> StrategyProfile {
    self
      .bindings
      .iter()
      .find(|(prefix, _)| key.starts_with(prefix))
      .map(|(_, profile)| *profile)
      .unwrap_or(self.default)
  }
}
