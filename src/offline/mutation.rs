//! Queued write records and their replay envelope.

use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use reqwest::Method;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use url::Url;

use crate::http::Request;
use crate::network::FetchError;

/// Lifecycle of a queued mutation.
///
/// `pending` -> `syncing` -> removed on success, or `failed` until the next
/// replay or a manual retry puts it back in line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MutationStatus {
  Pending,
  Syncing,
  Failed,
  Synced,
}

/// A write that could not reach the network.
///
/// Serialized in camelCase: status displays read the persisted list directly.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PendingMutation {
  /// Monotonic; creation order
  pub id: u64,
  /// Logical operation name, e.g. "customer.update"
  pub action: String,
  /// Whatever the handler needs to replay the call
  pub payload: Value,
  pub created_at: DateTime<Utc>,
  pub status: MutationStatus,
  #[serde(default)]
  pub attempts: u32,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub last_error: Option<String>,
}

#[derive(Debug, Error)]
pub enum ReplayError {
  #[error(transparent)]
  Fetch(#[from] FetchError),

  #[error("invalid mutation payload: {0}")]
  InvalidPayload(String),
}

impl ReplayError {
  /// No response at all: the mutation is not at fault and stays queued.
  pub fn is_unreachable(&self) -> bool {
    matches!(self, Self::Fetch(FetchError::Unreachable(_)))
  }

  /// The server answered, so connectivity is back even though the call failed.
  pub fn reached_network(&self) -> bool {
    matches!(self, Self::Fetch(FetchError::Rejected { .. }))
  }
}

/// Performs the network call behind a queued mutation.
pub trait MutationHandler: Send + Sync + 'static {
  fn dispatch(&self, mutation: &PendingMutation) -> BoxFuture<'static, Result<(), ReplayError>>;
}

/// Payload of a queued HTTP write: enough to rebuild the request.
///
/// The body is kept as text; writes here are JSON or form bodies.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MutationEnvelope {
  pub method: String,
  pub url: String,
  #[serde(default, skip_serializing_if = "Vec::is_empty")]
  pub headers: Vec<(String, String)>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub body: Option<String>,
}

impl MutationEnvelope {
  /// Capture a request for later replay. Fails for non-UTF-8 bodies.
  pub fn from_request(request: &Request) -> Result<Self, ReplayError> {
    let body = request
      .body
      .as_ref()
      .map(|bytes| {
        String::from_utf8(bytes.clone())
          .map_err(|_| ReplayError::InvalidPayload("body is not valid UTF-8".to_string()))
      })
      .transpose()?;

    Ok(Self {
      method: request.method.as_str().to_string(),
      url: request.url.to_string(),
      headers: request.headers.clone(),
      body,
    })
  }

  pub fn into_request(self) -> Result<Request, ReplayError> {
    let method = Method::from_bytes(self.method.as_bytes())
      .map_err(|_| ReplayError::InvalidPayload(format!("bad method {:?}", self.method)))?;
    let url = Url::parse(&self.url)
      .map_err(|e| ReplayError::InvalidPayload(format!("bad url {:?}: {}", self.url, e)))?;

    let mut request = Request::new(method, url);
    request.headers = self.headers;
    request.body = self.body.map(String::into_bytes);
    Ok(request)
  }

  pub fn to_value(&self) -> Value {
    serde_json::to_value(self).unwrap_or(Value::Null)
  }

  pub fn from_value(value: &Value) -> Result<Self, ReplayError> {
    serde_json::from_value(value.clone()).map_err(|e| ReplayError::InvalidPayload(e.to_string()))
  }
}
