//! Duplicate call suppression.
//!
//! A [`Group`] runs at most one future per key at a time. Callers that arrive
//! while a call for the same key is in flight wait for that call and receive a
//! clone of its result, whether it succeeded or failed. Once the call finishes
//! the key is released, so the next caller starts a fresh call.
//!
//! The tool registry keys calls by `<tool>-<version>`. The chart-repo
//! coordinator uses a single fixed key for the whole process.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use futures::FutureExt;
use futures::future::{BoxFuture, Shared};
use parking_lot::Mutex;

type SharedCall<T, E> = Shared<BoxFuture<'static, Result<T, E>>>;

/// A set of in-flight calls keyed by name.
pub struct Group<T, E>
where
  T: Clone + Send + Sync + 'static,
  E: Clone + Send + Sync + 'static,
{
  calls: Arc<Mutex<HashMap<String, SharedCall<T, E>>>>,
}

impl<T, E> Default for Group<T, E>
where
  T: Clone + Send + Sync + 'static,
  E: Clone + Send + Sync + 'static,
{
  fn default() -> Self {
    Self {
      calls: Arc::new(Mutex::new(HashMap::new())),
    }
  }
}

impl<T, E> Group<T, E>
where
  T: Clone + Send + Sync + 'static,
  E: Clone + Send + Sync + 'static,
{
  pub fn new() -> Self {
    Self::default()
  }

  /// Run `make()` for `key` unless a call for `key` is already in flight.
  ///
  /// Returns the call result and whether the result was shared with other
  /// callers (`true` for every caller that joined an existing call).
  pub async fn work<F, Fut>(&self, key: &str, make: F) -> (Result<T, E>, bool)
  where
    F: FnOnce() -> Fut,
    Fut: Future<Output = Result<T, E>> + Send + 'static,
  {
    let (call, shared) = {
      let mut calls = self.calls.lock();
      match calls.get(key) {
        Some(call) => (call.clone(), true),
        None => {
          let call = make().boxed().shared();
          calls.insert(key.to_string(), call.clone());
          (call, false)
        }
      }
    };

    let _guard = ReleaseGuard {
      calls: self.calls.clone(),
      key: key.to_string(),
      call: call.clone(),
    };

    (call.await, shared)
  }

  /// Number of keys with a call in flight.
  pub fn in_flight(&self) -> usize {
    self.calls.lock().len()
  }
}

struct ReleaseGuard<T, E>
where
  T: Clone + Send + Sync + 'static,
  E: Clone + Send + Sync + 'static,
{
  calls: Arc<Mutex<HashMap<String, SharedCall<T, E>>>>,
  key: String,
  call: SharedCall<T, E>,
}

impl<T, E> Drop for ReleaseGuard<T, E>
where
  T: Clone + Send + Sync + 'static,
  E: Clone + Send + Sync + 'static,
{
  fn drop(&mut self) {
    // An unfinished call stays registered; the next caller resumes polling it.
    if self.call.peek().is_none() {
      return;
    }
    let mut calls = self.calls.lock();
    if calls.get(&self.key).is_some_and(|c| Shared::ptr_eq(c, &self.call)) {
      calls.remove(&self.key);
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use std::sync::atomic::{AtomicUsize, Ordering};
  use std::time::Duration;

  #[tokio::test]
  async fn concurrent_callers_share_one_call() {
    let group: Arc<Group<String, String>> = Arc::new(Group::new());
    let runs = Arc::new(AtomicUsize::new(0));

    let mut handles = Vec::new();
    for _ in 0..20 {
      let group = group.clone();
      let runs = runs.clone();
      handles.push(tokio::spawn(async move {
        group
          .work("key", move || async move {
            runs.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(100)).await;
            Ok::<_, String>("done".to_string())
          })
          .await
      }));
    }

    let mut shared = 0;
    for handle in handles {
      let (result, was_shared) = handle.await.unwrap();
      assert_eq!(result.unwrap(), "done");
      if was_shared {
        shared += 1;
      }
    }

    assert_eq!(runs.load(Ordering::SeqCst), 1);
    assert_eq!(shared, 19);
    assert_eq!(group.in_flight(), 0);
  }

  #[tokio::test]
  async fn errors_are_shared_and_not_cached() {
    let group: Group<u32, String> = Group::new();

    let (first, _) = group.work("k", || async { Err::<u32, _>("boom".to_string()) }).await;
    assert_eq!(first.unwrap_err(), "boom");

    let (second, shared) = group.work("k", || async { Ok::<_, String>(7) }).await;
    assert_eq!(second.unwrap(), 7);
    assert!(!shared);
  }

  #[tokio::test]
  async fn different_keys_run_in_parallel() {
    let group: Arc<Group<u32, String>> = Arc::new(Group::new());
    let runs = Arc::new(AtomicUsize::new(0));

    let a = {
      let runs = runs.clone();
      group.work("a", move || async move {
        runs.fetch_add(1, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(50)).await;
        Ok::<_, String>(1)
      })
    };
    let b = {
      let runs = runs.clone();
      group.work("b", move || async move {
        runs.fetch_add(1, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(50)).await;
        Ok::<_, String>(2)
      })
    };

    let ((ra, _), (rb, _)) = tokio::join!(a, b);
    assert_eq!(ra.unwrap(), 1);
    assert_eq!(rb.unwrap(), 2);
    assert_eq!(runs.load(Ordering::SeqCst), 2);
  }
}
