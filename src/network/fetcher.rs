//! The network seam: a trait every outbound call goes through, and the
//! reqwest-backed implementation.

use std::sync::Arc;
use std::time::Duration;

use color_eyre::{eyre::eyre, Result};
use futures::future::BoxFuture;
use thiserror::Error;
use tracing::debug;

use crate::http::{Request, Response};

/// Maximum length for response bodies carried in error messages
const MAX_ERROR_BODY_LENGTH: usize = 500;

/// Why a network call produced no usable result.
///
/// "Offline" is the absence of a response object: the request never got an
/// answer (connect refused, DNS, timeout, reset). A server that answered with
/// a non-2xx status was reachable and is `Rejected` instead.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum FetchError {
  #[error("network unreachable: {0}")]
  Unreachable(String),

  #[error("request rejected with status {status}: {body}")]
  Rejected { status: u16, body: String },

  /// The request itself is unusable (bad header, redirect policy, undecodable
  /// body). Retrying or queuing it cannot help.
  #[error("request could not be completed: {0}")]
  Invalid(String),
}

impl FetchError {
  pub fn is_unreachable(&self) -> bool {
    matches!(self, Self::Unreachable(_))
  }

  /// Build a `Rejected` error from a response, truncating the body.
  pub fn rejected(response: &Response) -> Self {
    let body = response.text();
    let body = if body.len() <= MAX_ERROR_BODY_LENGTH {
      body
    } else {
      let mut cut = MAX_ERROR_BODY_LENGTH;
      while !body.is_char_boundary(cut) {
        cut -= 1;
      }
      format!("{}... (truncated, {} total bytes)", &body[..cut], body.len())
    };
    Self::Rejected {
      status: response.status,
      body,
    }
  }
}

impl Response {
  /// Turn a non-2xx response into `FetchError::Rejected`.
  pub fn error_for_status(self) -> Result<Self, FetchError> {
    if self.is_success() {
      Ok(self)
    } else {
      Err(FetchError::rejected(&self))
    }
  }
}

pub type FetchFuture = BoxFuture<'static, Result<Response, FetchError>>;

/// Issues a single network call.
///
/// Resolves with `Ok` for any status the server returned; only a missing
/// response is an error.
pub trait Fetcher: Send + Sync + 'static {
  fn fetch(&self, request: Request) -> FetchFuture;
}

impl<T: Fetcher + ?Sized> Fetcher for Arc<T> {
  fn fetch(&self, request: Request) -> FetchFuture {
    (**self).fetch(request)
  }
}

/// reqwest-backed fetcher.
#[derive(Clone)]
pub struct HttpFetcher {
  client: reqwest::Client,
}

impl HttpFetcher {
  pub fn new(timeout: Duration) -> Result<Self> {
    let client = reqwest::Client::builder()
      .timeout(timeout)
      .build()
      .map_err(|e| eyre!("Failed to create HTTP client: {}", e))?;

    Ok(Self { client })
  }
}

impl Fetcher for HttpFetcher {
  fn fetch(&self, request: Request) -> FetchFuture {
    let client = self.client.clone();

    Box::pin(async move {
      debug!(method = %request.method, url = %request.url, "network fetch");

      let mut builder = client.request(request.method.clone(), request.url.clone());
      for (name, value) in &request.headers {
        builder = builder.header(name.as_str(), value.as_str());
      }
      if let Some(body) = request.body {
        builder = builder.body(body);
      }

      let response = builder.send().await.map_err(send_error)?;

      let status = response.status().as_u16();
      let headers = response
        .headers()
        .iter()
        .filter_map(|(name, value)| {
          value
            .to_str()
            .ok()
            .map(|v| (name.as_str().to_string(), v.to_string()))
        })
        .collect();

      let body = response.bytes().await.map_err(body_error)?.to_vec();

      Ok(Response {
        status,
        headers,
        body,
      })
    })
  }
}

/// Only transport failures count as unreachable; builder and redirect errors
/// would fail the same way on every attempt.
fn send_error(e: reqwest::Error) -> FetchError {
  if e.is_connect() || e.is_timeout() || e.is_request() {
    FetchError::Unreachable(e.to_string())
  } else {
    FetchError::Invalid(e.to_string())
  }
}

// A connection dropped mid-body is still "no usable response"; a body that
// arrived but cannot be decoded is not
fn body_error(e: reqwest::Error) -> FetchError {
  if e.is_decode() {
    FetchError::Invalid(e.to_string())
  } else {
    FetchError::Unreachable(e.to_string())
  }
}
