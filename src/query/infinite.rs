use serde_json::Value;
use std::sync::Arc;
use tokio::sync::broadcast::{self, error::TryRecvError};
use tokio::sync::mpsc;
use tracing::debug;

use crate::cache::{decode, EntryStatus, Fetcher, KeyPattern, Payload, QueryKey};
use crate::client::{QueryClient, Subscription};
use crate::error::{QueryError, Result};
use crate::executor::QueryOptions;

type HasMoreFn<T> = Arc<dyn Fn(&T) -> bool + Send + Sync>;

/// Page results tagged with the generation that requested them.
type PageMessage = (u64, QueryKey, Result<Value>);

/// Accumulates pages stored under `key + [page]`, numbered from 1.
///
/// The fetcher receives the page key; the page number is its last part. Every loaded
/// page stays subscribed, so invalidating the pages refetches them and `poll` swaps
/// the fresh data in place.
pub struct InfiniteQuery<T> {
  client: QueryClient,
  key: QueryKey,
  fetcher: Fetcher,
  options: QueryOptions,
  has_more_fn: HasMoreFn<T>,
  pages: Vec<T>,
  /// Stored value of each loaded page, to tell real updates from repeats
  raw: Vec<Value>,
  /// Keeps each loaded page entry alive and refetchable
  subscriptions: Vec<Subscription>,
  has_more: bool,
  loading: bool,
  error: Option<QueryError>,
  /// Bumped by `reset`; results from older generations are discarded.
  generation: u64,
  tx: mpsc::UnboundedSender<PageMessage>,
  rx: mpsc::UnboundedReceiver<PageMessage>,
  changes: broadcast::Receiver<QueryKey>,
}

impl<T: Payload> InfiniteQuery<T> {
  /// `has_more` decides, for each arriving page, whether another one follows.
  pub fn new<F>(client: &QueryClient, key: impl Into<QueryKey>, fetcher: Fetcher, has_more: F) -> Self
  where
    F: Fn(&T) -> bool + Send + Sync + 'static,
  {
    let key = key.into();
    let (tx, rx) = mpsc::unbounded_channel();
    Self {
      client: client.clone(),
      changes: client.changes(),
      key,
      fetcher,
      options: QueryOptions::default(),
      has_more_fn: Arc::new(has_more),
      pages: Vec::new(),
      raw: Vec::new(),
      subscriptions: Vec::new(),
      has_more: true,
      loading: false,
      error: None,
      generation: 0,
      tx,
      rx,
    }
  }

  pub fn with_options(mut self, options: QueryOptions) -> Self {
    self.options = options;
    self
  }

  pub fn pages(&self) -> &[T] {
    &self.pages
  }

  pub fn has_more(&self) -> bool {
    self.has_more
  }

  pub fn is_loading(&self) -> bool {
    self.loading
  }

  pub fn error(&self) -> Option<&QueryError> {
    self.error.as_ref()
  }

  fn page_key(&self, page: usize) -> QueryKey {
    self.key.with(page)
  }

  /// Fetch the next page. Returns `false` if there is none or one is already loading.
  pub fn load_more(&mut self) -> bool {
    if !self.has_more || self.loading {
      return false;
    }

    let page_key = self.page_key(self.pages.len() + 1);
    let client = self.client.clone();
    let fetcher = self.fetcher.clone();
    let options = self.options.clone();
    let generation = self.generation;
    let tx = self.tx.clone();
    debug!(key = %page_key, "Loading next page");

    self.loading = true;
    self.error = None;
    self.client.scheduler().spawn(async move {
      let result = client.fetch(&page_key, fetcher, &options).await;
      let _ = tx.send((generation, page_key, result.map(|hit| hit.data)));
    });
    true
  }

  /// Drop accumulated pages and their cache entries, and start over from page 1.
  pub fn reset(&mut self) {
    let loaded = self.pages.len();
    self.pages.clear();
    self.raw.clear();
    self.subscriptions.clear();
    for page in 1..=loaded {
      self
        .client
        .clear(Some(&KeyPattern::exact(self.page_key(page))));
    }
    self.generation += 1;
    self.has_more = true;
    self.loading = false;
    self.error = None;
  }

  /// Apply arrived pages. Returns `true` if anything changed.
  pub fn poll(&mut self) -> bool {
    let mut changed = false;
    while let Ok((generation, page_key, result)) = self.rx.try_recv() {
      if generation != self.generation {
        debug!(key = %self.key, "Discarding page loaded before reset");
        continue;
      }

      self.loading = false;
      match result.and_then(|raw| decode::<T>(&raw).map(|data| (data, raw))) {
        Ok((data, raw)) => {
          self.has_more = (self.has_more_fn)(&data);
          self.subscriptions.push(self.client.subscribe(&page_key));
          self.pages.push(data);
          self.raw.push(raw);
        }
        Err(e) => self.error = Some(e),
      }
      changed = true;
    }

    for index in self.touched_pages() {
      changed |= self.sync_page(index);
    }
    changed
  }

  /// Indices of loaded pages named by pending change notifications.
  fn touched_pages(&mut self) -> Vec<usize> {
    let mut touched = vec![false; self.pages.len()];
    loop {
      match self.changes.try_recv() {
        Ok(changed) => {
          if let Some(index) = (1..=self.pages.len()).find(|&page| self.page_key(page) == changed) {
            touched[index - 1] = true;
          }
        }
        Err(TryRecvError::Lagged(_)) => touched.iter_mut().for_each(|t| *t = true),
        Err(TryRecvError::Empty) | Err(TryRecvError::Closed) => break,
      }
    }
    touched
      .into_iter()
      .enumerate()
      .filter_map(|(index, t)| t.then_some(index))
      .collect()
  }

  /// Replace a loaded page with its entry's current data, if that changed.
  fn sync_page(&mut self, index: usize) -> bool {
    let Some(entry) = self.client.get_entry(&self.page_key(index + 1)) else {
      return false;
    };
    let raw = match (entry.status, entry.data) {
      (EntryStatus::Success, Some(raw)) if raw != self.raw[index] => raw,
      _ => return false,
    };

    match decode::<T>(&raw) {
      Ok(data) => {
        if index + 1 == self.pages.len() {
          self.has_more = (self.has_more_fn)(&data);
        }
        self.pages[index] = data;
        self.raw[index] = raw;
      }
      Err(e) => self.error = Some(e),
    }
    true
  }
}

impl<T: std::fmt::Debug> std::fmt::Debug for InfiniteQuery<T> {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("InfiniteQuery")
      .field("key", &self.key)
      .field("pages", &self.pages)
      .field("has_more", &self.has_more)
      .field("loading", &self.loading)
      .finish_non_exhaustive()
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::cache::{typed_fetcher, KeyPart};
  use crate::clock::ManualClock;
  use crate::executor::RetryPolicy;
  use crate::invalidation::InvalidationRule;
  use std::sync::atomic::{AtomicUsize, Ordering};
  use std::time::Duration;

  fn client() -> QueryClient {
    QueryClient::builder()
      .clock(ManualClock::default())
      .retry(RetryPolicy::none())
      .build()
  }

  /// Three pages of two items each.
  fn pages_fetcher(calls: Arc<AtomicUsize>) -> Fetcher {
    typed_fetcher(move |key: QueryKey| {
      let calls = calls.clone();
      async move {
        calls.fetch_add(1, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(20)).await;
        let page = match key.parts().last() {
          Some(KeyPart::Int(n)) => *n,
          _ => return Err(QueryError::Validation("missing page".into())),
        };
        Ok((1..=2).map(|i| (page - 1) * 2 + i).collect::<Vec<i64>>())
      }
    })
  }

  fn below_three_pages(page: &Vec<i64>) -> bool {
    page.last().map_or(false, |last| *last < 6)
  }

  #[tokio::test(start_paused = true)]
  async fn test_pages_accumulate_until_exhausted() {
    let client = client();
    let calls = Arc::new(AtomicUsize::new(0));
    let mut query =
      InfiniteQuery::new(&client, "feed", pages_fetcher(calls.clone()), below_three_pages);

    for _ in 0..3 {
      assert!(query.load_more());
      tokio::time::sleep(Duration::from_millis(30)).await;
      assert!(query.poll());
    }

    assert_eq!(query.pages(), &[vec![1, 2], vec![3, 4], vec![5, 6]]);
    assert!(!query.has_more());
    assert!(!query.load_more());
    assert_eq!(calls.load(Ordering::SeqCst), 3);
  }

  #[tokio::test(start_paused = true)]
  async fn test_load_more_while_loading_is_ignored() {
    let client = client();
    let calls = Arc::new(AtomicUsize::new(0));
    let mut query =
      InfiniteQuery::new(&client, "feed", pages_fetcher(calls.clone()), below_three_pages);

    assert!(query.load_more());
    assert!(!query.load_more());
    tokio::time::sleep(Duration::from_millis(30)).await;
    query.poll();

    assert_eq!(query.pages().len(), 1);
    assert_eq!(calls.load(Ordering::SeqCst), 1);
  }

  #[tokio::test(start_paused = true)]
  async fn test_reset_discards_in_flight_page_and_refetches() {
    let client = client();
    let calls = Arc::new(AtomicUsize::new(0));
    let mut query =
      InfiniteQuery::new(&client, "feed", pages_fetcher(calls.clone()), below_three_pages);

    query.load_more();
    tokio::time::sleep(Duration::from_millis(30)).await;
    query.poll();
    query.load_more();

    query.reset();
    assert!(query.pages().is_empty());
    assert!(query.has_more());
    assert!(client.get_entry(&QueryKey::parse("feed:1")).is_none());

    tokio::time::sleep(Duration::from_millis(30)).await;
    assert!(!query.poll());
    assert!(query.pages().is_empty());

    assert!(query.load_more());
    tokio::time::sleep(Duration::from_millis(30)).await;
    assert!(query.poll());
    assert_eq!(query.pages(), &[vec![1, 2]]);
    assert_eq!(calls.load(Ordering::SeqCst), 3);
  }

  #[tokio::test(start_paused = true)]
  async fn test_invalidating_pages_refreshes_them_in_place() {
    let client = client();
    let version = Arc::new(AtomicUsize::new(0));
    let v = version.clone();
    let f = typed_fetcher(move |key: QueryKey| {
      let v = v.clone();
      async move {
        tokio::time::sleep(Duration::from_millis(20)).await;
        let page = match key.parts().last() {
          Some(KeyPart::Int(n)) => *n,
          _ => return Err(QueryError::Validation("missing page".into())),
        };
        Ok(vec![page * 10 + v.load(Ordering::SeqCst) as i64])
      }
    });
    let mut query: InfiniteQuery<Vec<i64>> = InfiniteQuery::new(&client, "feed", f, |_| true);

    for _ in 0..2 {
      query.load_more();
      tokio::time::sleep(Duration::from_millis(30)).await;
      query.poll();
    }
    assert_eq!(query.pages(), &[vec![10], vec![20]]);
    assert_eq!(client.stats().active_queries, 2);

    version.store(1, Ordering::SeqCst);
    client.register_rule(
      "feed.changed",
      InvalidationRule::new().immediate(KeyPattern::prefix("feed")),
    );
    let report = client.invalidate("feed.changed", None);
    assert_eq!(report.refetched, 2);

    tokio::time::sleep(Duration::from_millis(30)).await;
    assert!(query.poll());
    assert_eq!(query.pages(), &[vec![11], vec![21]]);
    assert!(!query.poll());
  }
}
