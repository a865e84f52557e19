//! Request classification into route categories.

use reqwest::Method;

use crate::config::RouteConfig;
use crate::http::{Destination, Request};

/// Role of a request, which selects the caching strategy and store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouteClass {
  /// Content-hashed static files: cache-first
  StaticAsset,
  /// Backend API calls: network-first, short freshness window
  ApiCall,
  /// Full page navigations: network-first, long freshness window
  Document,
  /// Everything else: stale-while-revalidate
  Other,
}

/// Classify a request. Pure and total; unmatched requests are `Other`.
///
/// Checked in order: API prefix, document navigation, static asset
/// (declared destination, path prefix, then file extension).
pub fn classify(request: &Request, routes: &RouteConfig) -> RouteClass {
  let path = request.url.path();

  if path.starts_with(&routes.api_prefix) {
    return RouteClass::ApiCall;
  }

  let is_read = request.method == Method::GET || request.method == Method::HEAD;
  if is_read && (request.destination == Destination::Document || accepts_html(request)) {
    return RouteClass::Document;
  }

  if request.destination.is_static_asset()
    || routes.static_prefixes.iter().any(|p| path.starts_with(p))
    || has_static_extension(path, &routes.static_extensions)
  {
    return RouteClass::StaticAsset;
  }

  RouteClass::Other
}

fn accepts_html(request: &Request) -> bool {
  request
    .header("accept")
    .is_some_and(|accept| accept.to_ascii_lowercase().contains("text/html"))
}

fn has_static_extension(path: &str, extensions: &[String]) -> bool {
  let file = path.rsplit('/').next().unwrap_or(path);
  match file.rsplit_once('.') {
    Some((stem, ext)) if !stem.is_empty() => {
      extensions.iter().any(|e| e.eq_ignore_ascii_case(ext))
    }
    _ => false,
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use url::Url;

  fn get(path: &str) -> Request {
    Request::get(Url::parse("http://app.test").unwrap().join(path).unwrap())
  }

  fn classify_default(request: &Request) -> RouteClass {
    classify(request, &RouteConfig::default())
  }

  #[test]
  fn test_api_prefix() {
    assert_eq!(classify_default(&get("/api/customers?page=1")), RouteClass::ApiCall);
    // Prefix wins even over an html accept header
    let req = get("/api/report").with_header("Accept", "text/html");
    assert_eq!(classify_default(&req), RouteClass::ApiCall);
  }

  #[test]
  fn test_documents() {
    let nav = get("/customers/42").with_destination(Destination::Document);
    assert_eq!(classify_default(&nav), RouteClass::Document);

    let accept = get("/orders").with_header("Accept", "Text/HTML,application/xhtml+xml");
    assert_eq!(classify_default(&accept), RouteClass::Document);

    let mut post = get("/orders").with_header("Accept", "text/html");
    post.method = Method::POST;
    assert_eq!(classify_default(&post), RouteClass::Other);
  }

  #[test]
  fn test_static_assets() {
    assert_eq!(classify_default(&get("/logo.png")), RouteClass::StaticAsset);
    assert_eq!(classify_default(&get("/assets/app.3f9a1c.js")), RouteClass::StaticAsset);
    assert_eq!(classify_default(&get("/fonts/Inter.WOFF2")), RouteClass::StaticAsset);
    let declared = get("/avatar/7").with_destination(Destination::Image);
    assert_eq!(classify_default(&declared), RouteClass::StaticAsset);
  }

  #[test]
  fn test_everything_else_is_other() {
    assert_eq!(classify_default(&get("/")), RouteClass::Other);
    assert_eq!(classify_default(&get("/manifest")), RouteClass::Other);
    assert_eq!(classify_default(&get("/.png")), RouteClass::Other);
    assert_eq!(classify_default(&get("/reports/q3.pdf")), RouteClass::Other);
  }

  #[test]
  fn test_custom_routes() {
    let routes = RouteConfig {
      api_prefix: "/v2/".into(),
      static_prefixes: vec!["/cdn/".into()],
      static_extensions: vec!["pdf".into()],
    };
    assert_eq!(classify(&get("/v2/users"), &routes), RouteClass::ApiCall);
    assert_eq!(classify(&get("/api/users"), &routes), RouteClass::Other);
    assert_eq!(classify(&get("/cdn/blob"), &routes), RouteClass::StaticAsset);
    assert_eq!(classify(&get("/reports/q3.pdf"), &routes), RouteClass::StaticAsset);
  }
}
