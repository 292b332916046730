//! Document paths of the polly hierarchy.
//!
//! ```text
//! pollies/{polly}
//! pollies/{polly}/drivers/{driver}
//! pollies/{polly}/drivers/{driver}/consumers/{consumer}
//! pollies/{polly}/consumers/{consumer}          (waiting list)
//! ```

use carpolly_core::{
  Result,
  document::{CollectionPath, DocPath},
  model::ConsumerSlot,
};

pub const POLLIES: &str = "pollies";
pub const DRIVERS: &str = "drivers";
pub const CONSUMERS: &str = "consumers";

pub fn pollies() -> Result<CollectionPath> { CollectionPath::root(POLLIES) }

pub fn polly(polly_id: &str) -> Result<DocPath> { pollies()?.doc(polly_id) }

pub fn drivers(polly_id: &str) -> Result<CollectionPath> {
  polly(polly_id)?.collection(DRIVERS)
}

pub fn driver(polly_id: &str, driver_id: &str) -> Result<DocPath> {
  drivers(polly_id)?.doc(driver_id)
}

/// Passengers assigned to a driver.
pub fn driver_consumers(
  polly_id: &str,
  driver_id: &str,
) -> Result<CollectionPath> {
  driver(polly_id, driver_id)?.collection(CONSUMERS)
}

pub fn driver_consumer(
  polly_id: &str,
  driver_id: &str,
  consumer_id: &str,
) -> Result<DocPath> {
  driver_consumers(polly_id, driver_id)?.doc(consumer_id)
}

/// The polly's waiting list.
pub fn waiting_list(polly_id: &str) -> Result<CollectionPath> {
  polly(polly_id)?.collection(CONSUMERS)
}

pub fn waiting_list_consumer(
  polly_id: &str,
  consumer_id: &str,
) -> Result<DocPath> {
  waiting_list(polly_id)?.doc(consumer_id)
}

/// The consumer collection behind `slot`.
pub fn slot_consumers(
  polly_id: &str,
  slot: &ConsumerSlot,
) -> Result<CollectionPath> {
  match slot {
    ConsumerSlot::WaitingList => waiting_list(polly_id),
    ConsumerSlot::Driver(driver_id) => driver_consumers(polly_id, driver_id),
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn layout_matches_hierarchy() {
    assert_eq!(polly("p").unwrap().as_str(), "pollies/p");
    assert_eq!(driver("p", "d").unwrap().as_str(), "pollies/p/drivers/d");
    assert_eq!(
      driver_consumer("p", "d", "c").unwrap().as_str(),
      "pollies/p/drivers/d/consumers/c"
    );
    assert_eq!(
      waiting_list_consumer("p", "c").unwrap().as_str(),
      "pollies/p/consumers/c"
    );
    assert_eq!(
      slot_consumers("p", &ConsumerSlot::Driver("d".into())).unwrap(),
      driver_consumers("p", "d").unwrap()
    );
  }

  #[test]
  fn ids_cannot_escape_their_segment() {
    assert!(driver("p", "d/consumers").is_err());
    assert!(polly("").is_err());
  }
}
