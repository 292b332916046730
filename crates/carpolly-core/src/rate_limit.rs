//! Advisory sliding-window rate limiter.
//!
//! Tracks recent operation timestamps per operation name. The state is owned
//! by whoever constructs the limiter and is lost on restart; it throttles an
//! honest client and is not a security boundary.

use std::{
  collections::{HashMap, VecDeque},
  sync::{Mutex, PoisonError},
  time::{Duration, Instant},
};

pub const DEFAULT_MAX_OPERATIONS: usize = 10;
pub const DEFAULT_WINDOW: Duration = Duration::from_secs(60);

#[derive(Debug)]
pub struct RateLimiter {
  max_operations: usize,
  window:         Duration,
  recent:         Mutex<HashMap<String, VecDeque<Instant>>>,
}

impl Default for RateLimiter {
  fn default() -> Self { Self::new(DEFAULT_MAX_OPERATIONS, DEFAULT_WINDOW) }
}

impl RateLimiter {
  pub fn new(max_operations: usize, window: Duration) -> Self {
    Self {
      max_operations,
      window,
      recent: Mutex::new(HashMap::new()),
    }
  }

  pub fn max_operations(&self) -> usize { self.max_operations }

  pub fn window(&self) -> Duration { self.window }

  /// Record an attempt of `operation` now. Returns `false`, recording
  /// nothing, if the window is already full.
  pub fn check(&self, operation: &str) -> bool {
    self.check_at(operation, Instant::now())
  }

  /// [`Self::check`] against an explicit clock reading.
  pub fn check_at(&self, operation: &str, now: Instant) -> bool {
    let mut recent = self.recent.lock().unwrap_or_else(PoisonError::into_inner);
    let stamps = recent.entry(operation.to_owned()).or_default();

    while stamps
      .front()
      .is_some_and(|t| now.saturating_duration_since(*t) >= self.window)
    {
      stamps.pop_front();
    }

    if stamps.len() >= self.max_operations {
      return false;
    }
    stamps.push_back(now);
    true
  }

  /// Forget all recorded attempts.
  pub fn reset(&self) {
    self
      .recent
      .lock()
      .unwrap_or_else(PoisonError::into_inner)
      .clear();
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn blocks_once_window_is_full() {
    let limiter = RateLimiter::new(3, Duration::from_secs(60));
    let t0 = Instant::now();

    assert!(limiter.check_at("create_driver", t0));
    assert!(limiter.check_at("create_driver", t0));
    assert!(limiter.check_at("create_driver", t0));
    assert!(!limiter.check_at("create_driver", t0));

    // other operations have their own window
    assert!(limiter.check_at("create_consumer", t0));
  }

  #[test]
  fn window_slides() {
    let limiter = RateLimiter::new(2, Duration::from_secs(60));
    let t0 = Instant::now();

    assert!(limiter.check_at("op", t0));
    assert!(limiter.check_at("op", t0 + Duration::from_secs(30)));
    assert!(!limiter.check_at("op", t0 + Duration::from_secs(59)));

    // the first attempt has aged out
    assert!(limiter.check_at("op", t0 + Duration::from_secs(60)));
    assert!(!limiter.check_at("op", t0 + Duration::from_secs(61)));
  }

  #[test]
  fn rejected_attempts_are_not_recorded() {
    let limiter = RateLimiter::new(1, Duration::from_secs(10));
    let t0 = Instant::now();

    assert!(limiter.check_at("op", t0));
    for s in 1..10 {
      assert!(!limiter.check_at("op", t0 + Duration::from_secs(s)));
    }
    assert!(limiter.check_at("op", t0 + Duration::from_secs(10)));
  }

  #[test]
  fn reset_clears_history() {
    let limiter = RateLimiter::new(1, Duration::from_secs(60));
    assert!(limiter.check("op"));
    assert!(!limiter.check("op"));
    limiter.reset();
    assert!(limiter.check("op"));
  }
}
