//! Domain model: the nested view of one carpool group.
//!
//! A [`Polly`] owns an ordered list of [`Driver`]s (each owning its assigned
//! [`Consumer`]s) plus a flat waiting list. These are read models assembled
//! from many documents; the `New*` and `*Patch` types are the write-side
//! inputs.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// ─── Read model ──────────────────────────────────────────────────────────────

/// The root carpool-coordination aggregate for one trip or event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Polly {
  /// Caller-supplied UUID.
  pub id:           String,
  pub description:  String,
  /// Server-assigned; never changes after creation.
  pub created:      DateTime<Utc>,
  /// Server-assigned; bumped by every mutation anywhere in the hierarchy.
  pub updated_at:   DateTime<Utc>,
  pub drivers:      Vec<Driver>,
  /// Passengers not yet assigned to a driver.
  pub waiting_list: Vec<Consumer>,
}

impl Polly {
  pub fn driver(&self, driver_id: &str) -> Option<&Driver> {
    self.drivers.iter().find(|d| d.id == driver_id)
  }

  /// Assigned passengers plus the waiting list.
  pub fn passenger_count(&self) -> usize {
    self.drivers.iter().map(|d| d.consumers.len()).sum::<usize>()
      + self.waiting_list.len()
  }
}

/// A ride offer with a seat capacity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Driver {
  /// Store-assigned.
  pub id:           String,
  pub name:         String,
  /// Meeting details.
  pub description:  String,
  pub spots:        u32,
  /// Server-assigned; bumped by every update of this driver.
  pub last_updated: DateTime<Utc>,
  pub consumers:    Vec<Consumer>,
}

impl Driver {
  pub fn available_spots(&self) -> usize {
    (self.spots as usize).saturating_sub(self.consumers.len())
  }

  pub fn is_full(&self) -> bool { self.available_spots() == 0 }
}

/// A passenger, either assigned to a driver or on the waiting list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Consumer {
  /// Store-assigned.
  pub id:       String,
  pub name:     String,
  pub comments: Option<String>,
}

// ─── Write model ─────────────────────────────────────────────────────────────

/// An inline nested collection supplied at creation time.
///
/// `Absent` and `Empty` both create nothing; they are kept apart so callers
/// can tell "not supplied" from "explicitly none".
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum Nested<T> {
  #[default]
  Absent,
  Empty,
  Present(Vec<T>),
}

impl<T> Nested<T> {
  pub fn items(&self) -> &[T] {
    match self {
      Self::Present(items) => items,
      Self::Absent | Self::Empty => &[],
    }
  }

  pub fn len(&self) -> usize { self.items().len() }

  pub fn is_empty(&self) -> bool { self.items().is_empty() }
}

impl<T> From<Vec<T>> for Nested<T> {
  fn from(items: Vec<T>) -> Self {
    if items.is_empty() { Self::Empty } else { Self::Present(items) }
  }
}

/// Input to `create_polly`. The identifier is passed separately because it is
/// caller-chosen and becomes the document path, not a field.
#[derive(Debug, Clone, Default)]
pub struct NewPolly {
  pub description:  String,
  pub drivers:      Nested<NewDriver>,
  pub waiting_list: Nested<NewConsumer>,
}

impl NewPolly {
  pub fn new(description: impl Into<String>) -> Self {
    Self { description: description.into(), ..Default::default() }
  }
}

/// Input to `create_driver`.
#[derive(Debug, Clone)]
pub struct NewDriver {
  pub name:        String,
  pub description: String,
  pub spots:       u32,
  pub consumers:   Nested<NewConsumer>,
}

impl NewDriver {
  pub fn new(
    name: impl Into<String>,
    description: impl Into<String>,
    spots: u32,
  ) -> Self {
    Self {
      name: name.into(),
      description: description.into(),
      spots,
      consumers: Nested::Absent,
    }
  }
}

/// Input to `create_consumer` / `create_waiting_list_consumer`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewConsumer {
  pub name:     String,
  pub comments: Option<String>,
}

impl NewConsumer {
  pub fn new(name: impl Into<String>) -> Self {
    Self { name: name.into(), comments: None }
  }

  pub fn with_comments(mut self, comments: impl Into<String>) -> Self {
    self.comments = Some(comments.into());
    self
  }
}

/// Partial update of a polly root. `None` leaves a field untouched.
#[derive(Debug, Clone, Default)]
pub struct PollyPatch {
  pub description: Option<String>,
}

/// Partial update of a driver. `None` leaves a field untouched.
#[derive(Debug, Clone, Default)]
pub struct DriverPatch {
  pub name:        Option<String>,
  pub description: Option<String>,
  pub spots:       Option<u32>,
}

/// Partial update of a consumer.
#[derive(Debug, Clone, Default)]
pub struct ConsumerPatch {
  pub name:     Option<String>,
  /// `None` leaves comments untouched; `Some(None)` clears them.
  pub comments: Option<Option<String>>,
}

/// Where a consumer document lives.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ConsumerSlot {
  WaitingList,
  Driver(String),
}

#[cfg(test)]
mod tests {
  use chrono::Utc;

  use super::*;

  fn consumer(name: &str) -> Consumer {
    Consumer { id: name.to_lowercase(), name: name.into(), comments: None }
  }

  #[test]
  fn available_spots_saturates() {
    let mut driver = Driver {
      id:           "d1".into(),
      name:         "Alex".into(),
      description:  "Meet at lot B".into(),
      spots:        1,
      last_updated: Utc::now(),
      consumers:    vec![consumer("Sam")],
    };
    assert!(driver.is_full());

    driver.consumers.push(consumer("Kim"));
    assert_eq!(driver.available_spots(), 0);

    driver.spots = 4;
    assert_eq!(driver.available_spots(), 2);
  }

  #[test]
  fn nested_from_vec_distinguishes_empty() {
    let empty: Nested<NewConsumer> = Vec::new().into();
    assert_eq!(empty, Nested::Empty);
    assert!(Nested::<NewConsumer>::Absent.is_empty());

    let present: Nested<NewConsumer> = vec![NewConsumer::new("Sam")].into();
    assert_eq!(present.len(), 1);
  }
}
