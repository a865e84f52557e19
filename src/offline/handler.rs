//! Replays queued HTTP writes through the signer and the network.

use std::sync::Arc;

use futures::future::BoxFuture;
use tracing::debug;

use super::mutation::{MutationEnvelope, MutationHandler, PendingMutation, ReplayError};
use crate::network::{Fetcher, RequestSigner};

/// Rebuilds the request from a `MutationEnvelope` payload, signs it and
/// sends it. Any non-2xx answer counts as a failed replay.
pub struct HttpMutationHandler {
  fetcher: Arc<dyn Fetcher>,
  signer: Arc<dyn RequestSigner>,
}

impl HttpMutationHandler {
  pub fn new(fetcher: Arc<dyn Fetcher>, signer: Arc<dyn RequestSigner>) -> Self {
    Self { fetcher, signer }
  }
}

impl MutationHandler for HttpMutationHandler {
  fn dispatch(&self, mutation: &PendingMutation) -> BoxFuture<'static, Result<(), ReplayError>> {
    let request = MutationEnvelope::from_value(&mutation.payload).and_then(|e| e.into_request());
    let fetcher = Arc::clone(&self.fetcher);
    let signer = Arc::clone(&self.signer);
    let id = mutation.id;

    Box::pin(async move {
      let mut request = request?;
      // Signed at dispatch so the signature timestamp is current
      signer.sign(&mut request);
      debug!(id, method = %request.method, url = %request.url, "replaying mutation");

      fetcher.fetch(request).await?.error_for_status()?;
      Ok(())
    })
  }
}
