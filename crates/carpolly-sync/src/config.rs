//! Client configuration.
//!
//! Loaded from an optional TOML file, then overridden by `CARPOLLY_`-prefixed
//! environment variables. Nested keys use `__`, so
//! `CARPOLLY_RATE_LIMIT__MAX_OPERATIONS=20` sets `rate_limit.max_operations`.

use std::{
  path::{Path, PathBuf},
  time::Duration,
};

use carpolly_core::rate_limit::{
  DEFAULT_MAX_OPERATIONS, DEFAULT_WINDOW, RateLimiter,
};
use serde::Deserialize;

use crate::Result;

const ENV_PREFIX: &str = "CARPOLLY";

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
  /// SQLite file backing the local store. `None` means in-memory.
  pub store_path:   Option<PathBuf>,
  pub rate_limit:   RateLimitConfig,
  pub subscription: SubscriptionConfig,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct RateLimitConfig {
  pub enabled:        bool,
  pub max_operations: usize,
  pub window_secs:    u64,
}

impl Default for RateLimitConfig {
  fn default() -> Self {
    Self {
      enabled:        true,
      max_operations: DEFAULT_MAX_OPERATIONS,
      window_secs:    DEFAULT_WINDOW.as_secs(),
    }
  }
}

impl RateLimitConfig {
  /// A fresh limiter, or `None` when limiting is disabled.
  pub fn limiter(&self) -> Option<RateLimiter> {
    self.enabled.then(|| {
      RateLimiter::new(
        self.max_operations,
        Duration::from_secs(self.window_secs),
      )
    })
  }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct SubscriptionConfig {
  /// Capacity of each watched polly's refresh queue.
  pub event_buffer: usize,
}

impl Default for SubscriptionConfig {
  fn default() -> Self { Self { event_buffer: 64 } }
}

impl ClientConfig {
  /// Load from `path` (if given and present) and the process environment.
  pub fn load(path: Option<&Path>) -> Result<Self> {
    Self::load_layered(path, None)
  }

  /// Like [`Self::load`], reading environment overrides from `env` instead of
  /// the process environment when given.
  pub fn load_layered(
    path: Option<&Path>,
    env: Option<config::Map<String, String>>,
  ) -> Result<Self> {
    let mut builder = config::Config::builder();
    if let Some(path) = path {
      builder = builder.add_source(config::File::from(path).required(false));
    }

    let settings = builder
      .add_source(
        config::Environment::with_prefix(ENV_PREFIX)
          .prefix_separator("_")
          .separator("__")
          .try_parsing(true)
          .source(env),
      )
      .build()?;

    Ok(settings.try_deserialize()?)
  }

  /// The store path with a leading `~/` expanded to `$HOME`.
  pub fn resolved_store_path(&self) -> Option<PathBuf> {
    self.store_path.as_deref().map(expand_tilde)
  }
}

fn expand_tilde(path: &Path) -> PathBuf {
  let s = path.to_string_lossy();
  if let Some(rest) = s.strip_prefix("~/")
    && let Ok(home) = std::env::var("HOME")
  {
    return PathBuf::from(home).join(rest);
  }
  path.to_path_buf()
}
