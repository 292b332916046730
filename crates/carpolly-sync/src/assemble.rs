//! Reassembly of a full [`Polly`] aggregate from its documents.

use carpolly_core::{document::Document, model::Polly, store::DocumentStore};

use crate::{Result, error::store_err, mapper, paths};

/// Read and assemble a polly. `None` if the root document is absent.
pub async fn load_polly<S: DocumentStore>(
  store: &S,
  polly_id: &str,
) -> Result<Option<Polly>> {
  let root = store
    .get_document(paths::polly(polly_id)?)
    .await
    .map_err(store_err)?;
  let Some(root) = root else {
    return Ok(None);
  };

  let drivers = store
    .list_children(paths::drivers(polly_id)?)
    .await
    .map_err(store_err)?;

  assemble_from(store, polly_id, &root, &drivers).await.map(Some)
}

/// Assemble around an already-read root and driver list, reading every
/// driver's consumers and the waiting list fresh.
pub async fn assemble_from<S: DocumentStore>(
  store: &S,
  polly_id: &str,
  root: &Document,
  driver_docs: &[Document],
) -> Result<Polly> {
  let mut drivers = Vec::with_capacity(driver_docs.len());
  for doc in driver_docs {
    let consumers = store
      .list_children(paths::driver_consumers(polly_id, doc.id())?)
      .await
      .map_err(store_err)?
      .iter()
      .map(mapper::consumer_from_document)
      .collect::<carpolly_core::Result<Vec<_>>>()?;
    drivers.push(mapper::driver_from_document(doc, consumers)?);
  }

  let waiting_list = store
    .list_children(paths::waiting_list(polly_id)?)
    .await
    .map_err(store_err)?
    .iter()
    .map(mapper::consumer_from_document)
    .collect::<carpolly_core::Result<Vec<_>>>()?;

  Ok(mapper::polly_from_parts(root, drivers, waiting_list)?)
}
