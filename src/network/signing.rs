//! Pre-send hook for mutating calls.
//!
//! Signing itself (HMAC over method, path, body and timestamp) lives with the
//! host application. This layer only guarantees the hook runs before every
//! mutating dispatch, direct or replayed.

use crate::http::Request;

pub trait RequestSigner: Send + Sync {
  fn sign(&self, request: &mut Request);
}

/// Leaves requests untouched.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopSigner;

impl RequestSigner for NoopSigner {
  fn sign(&self, _request: &mut Request) {}
}

impl<F> RequestSigner for F
where
  F: Fn(&mut Request) + Send + Sync,
{
  fn sign(&self, request: &mut Request) {
    self(request)
  }
}
