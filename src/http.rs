//! Request and response snapshots passed through the interception layer.

use reqwest::Method;
use serde::{Deserialize, Serialize};
use url::Url;

/// What the host application declared it will do with the response.
///
/// Mirrors the destinations a browser attaches to a fetch; `Empty` means
/// nothing was declared (plain `fetch()` / XHR style calls).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Destination {
  #[default]
  Empty,
  Document,
  Script,
  Style,
  Image,
  Font,
  Manifest,
}

impl Destination {
  /// Destinations served from the static asset store.
  pub fn is_static_asset(self) -> bool {
    matches!(
      self,
      Self::Script | Self::Style | Self::Image | Self::Font | Self::Manifest
    )
  }
}

/// An outbound request.
#[derive(Debug, Clone)]
pub struct Request {
  pub method: Method,
  pub url: Url,
  pub headers: Vec<(String, String)>,
  pub body: Option<Vec<u8>>,
  pub destination: Destination,
  /// Tagged by the caller as never cacheable
  pub no_store: bool,
}

impl Request {
  pub fn new(method: Method, url: Url) -> Self {
    Self {
      method,
      url,
      headers: Vec::new(),
      body: None,
      destination: Destination::Empty,
      no_store: false,
    }
  }

  pub fn get(url: Url) -> Self {
    Self::new(Method::GET, url)
  }

  pub fn head(url: Url) -> Self {
    Self::new(Method::HEAD, url)
  }

  pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
    self.headers.push((name.into(), value.into()));
    self
  }

  pub fn with_body(mut self, body: impl Into<Vec<u8>>) -> Self {
    self.body = Some(body.into());
    self
  }

  pub fn with_destination(mut self, destination: Destination) -> Self {
    self.destination = destination;
    self
  }

  pub fn no_store(mut self) -> Self {
    self.no_store = true;
    self
  }

  /// Case-insensitive header lookup.
  pub fn header(&self, name: &str) -> Option<&str> {
    find_header(&self.headers, name)
  }

  /// Identity used as the cache key: method plus URL without fragment.
  ///
  /// `Url` already lower-cases scheme and host and drops default ports.
  pub fn cache_key(&self) -> String {
    let mut url = self.url.clone();
    url.set_fragment(None);
    format!("{} {}", self.method.as_str(), url)
  }
}

/// A fully buffered response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
  pub status: u16,
  pub headers: Vec<(String, String)>,
  pub body: Vec<u8>,
}

impl Response {
  pub fn new(status: u16, body: impl Into<Vec<u8>>) -> Self {
    Self {
      status,
      headers: Vec::new(),
      body: body.into(),
    }
  }

  pub fn ok(body: impl Into<Vec<u8>>) -> Self {
    Self::new(200, body)
  }

  pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
    self.set_header(name, value);
    self
  }

  /// Replace any existing header of the same name.
  pub fn set_header(&mut self, name: impl Into<String>, value: impl Into<String>) {
    let name = name.into();
    self.headers.retain(|(k, _)| !k.eq_ignore_ascii_case(&name));
    self.headers.push((name, value.into()));
  }

  pub fn header(&self, name: &str) -> Option<&str> {
    find_header(&self.headers, name)
  }

  /// 2xx status.
  pub fn is_success(&self) -> bool {
    (200..300).contains(&self.status)
  }

  pub fn text(&self) -> String {
    String::from_utf8_lossy(&self.body).into_owned()
  }
}

fn find_header<'a>(headers: &'a [(String, String)], name: &str) -> Option<&'a str> {
  headers
    .iter()
    .find(|(k, _)| k.eq_ignore_ascii_case(name))
    .map(|(_, v)| v.as_str())
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_cache_key_normalizes_url() {
    let a = Request::get(Url::parse("HTTP://Example.COM:80/logo.png#top").unwrap());
    let b = Request::get(Url::parse("http://example.com/logo.png").unwrap());
    assert_eq!(a.cache_key(), b.cache_key());
    assert_eq!(b.cache_key(), "GET http://example.com/logo.png");
  }

  #[test]
  fn test_cache_key_includes_method_and_query() {
    let url = Url::parse("http://example.com/api/users?page=2").unwrap();
    let get = Request::get(url.clone());
    let head = Request::head(url);
    assert_ne!(get.cache_key(), head.cache_key());
    assert!(get.cache_key().ends_with("?page=2"));
  }

  #[test]
  fn test_set_header_replaces_case_insensitively() {
    let mut response = Response::ok("x").with_header("Content-Type", "text/plain");
    response.set_header("content-type", "application/json");
    assert_eq!(response.headers.len(), 1);
    assert_eq!(response.header("CONTENT-TYPE"), Some("application/json"));
  }

  #[test]
  fn test_is_success() {
    assert!(Response::new(204, "").is_success());
    assert!(!Response::new(304, "").is_success());
    assert!(!Response::new(500, "").is_success());
  }
}
