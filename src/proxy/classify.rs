use serde::{Deserialize, Serialize};
use std::fmt;
use url::Url;

use crate::net::Headers;

/// What kind of resource a captured exchange carried
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResourceType {
    Fetch,
    Document,
    Script,
    Stylesheet,
    Image,
    Font,
    Manifest,
    Other,
}

impl fmt::Display for ResourceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ResourceType::Fetch => "fetch",
            ResourceType::Document => "document",
            ResourceType::Script => "script",
            ResourceType::Stylesheet => "stylesheet",
            ResourceType::Image => "image",
            ResourceType::Font => "font",
            ResourceType::Manifest => "manifest",
            ResourceType::Other => "other",
        };
        f.write_str(name)
    }
}

/// How the browser says a request was issued
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Initiator {
    /// fetch() or XMLHttpRequest
    Fetch,
    /// Top-level or frame navigation
    Navigation,
    /// Sub-resource load, with the `Sec-Fetch-Dest` value
    Subresource(String),
    /// No usable request metadata
    Unknown,
}

impl Initiator {
    /// Read the initiator from request metadata.
    ///
    /// `Sec-Fetch-Dest: empty` is what Chromium sends for fetch/XHR, with or
    /// without `X-Requested-With`; the latter is only consulted when the
    /// fetch metadata headers are absent.
    pub fn from_headers(headers: &Headers) -> Self {
        let dest = headers.get("sec-fetch-dest").map(|v| v.trim().to_ascii_lowercase());
        let mode = headers.get("sec-fetch-mode").map(|v| v.trim().to_ascii_lowercase());

        match dest.as_deref() {
            Some("empty") => return Initiator::Fetch,
            Some("document") | Some("iframe") | Some("frame") => return Initiator::Navigation,
            _ => {}
        }

        if mode.as_deref() == Some("navigate") {
            return Initiator::Navigation;
        }

        if let Some(dest) = dest {
            return Initiator::Subresource(dest);
        }

        let legacy_xhr = headers
            .get("x-requested-with")
            .map(|v| v.eq_ignore_ascii_case("xmlhttprequest"))
            .unwrap_or(false);
        if legacy_xhr {
            Initiator::Fetch
        } else {
            Initiator::Unknown
        }
    }
}

/// Tag a captured exchange.
///
/// Order: fetch initiator, then response content type, then the
/// destination hint, then the URL extension. Nothing recognized is `other`.
pub fn classify(url: &str, request_headers: &Headers, content_type: Option<&str>) -> ResourceType {
    let initiator = Initiator::from_headers(request_headers);
    if initiator == Initiator::Fetch {
        return ResourceType::Fetch;
    }

    if let Some(kind) = content_type.and_then(from_content_type) {
        return kind;
    }

    let hinted = match &initiator {
        Initiator::Navigation => Some(ResourceType::Document),
        Initiator::Subresource(dest) => from_destination(dest),
        _ => None,
    };
    if let Some(kind) = hinted {
        return kind;
    }

    from_extension(url).unwrap_or(ResourceType::Other)
}

fn from_content_type(content_type: &str) -> Option<ResourceType> {
    let media = content_type
        .split(';')
        .next()
        .unwrap_or("")
        .trim()
        .to_ascii_lowercase();

    let kind = match media.as_str() {
        "text/html" | "application/xhtml+xml" => ResourceType::Document,
        "text/css" => ResourceType::Stylesheet,
        "application/manifest+json" => ResourceType::Manifest,
        m if m.contains("javascript") || m.contains("ecmascript") => ResourceType::Script,
        m if m.starts_with("image/") => ResourceType::Image,
        m if m.starts_with("font/") || m.contains("font-") || m.ends_with("font") => {
            ResourceType::Font
        }
        _ => return None,
    };
    Some(kind)
}

fn from_destination(dest: &str) -> Option<ResourceType> {
    let kind = match dest {
        "script" | "worker" | "sharedworker" | "serviceworker" => ResourceType::Script,
        "style" => ResourceType::Stylesheet,
        "image" => ResourceType::Image,
        "font" => ResourceType::Font,
        "manifest" => ResourceType::Manifest,
        _ => return None,
    };
    Some(kind)
}

fn from_extension(url: &str) -> Option<ResourceType> {
    let parsed = Url::parse(url).ok()?;
    let last = parsed.path_segments()?.last()?;
    let (_, ext) = last.rsplit_once('.')?;

    let kind = match ext.to_ascii_lowercase().as_str() {
        "html" | "htm" | "xhtml" => ResourceType::Document,
        "js" | "mjs" => ResourceType::Script,
        "css" => ResourceType::Stylesheet,
        "png" | "jpg" | "jpeg" | "gif" | "webp" | "svg" | "ico" | "avif" | "bmp" => {
            ResourceType::Image
        }
        "woff" | "woff2" | "ttf" | "otf" | "eot" => ResourceType::Font,
        "webmanifest" => ResourceType::Manifest,
        _ => return None,
    };
    Some(kind)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn headers(pairs: &[(&str, &str)]) -> Headers {
        pairs.iter().copied().collect()
    }

    #[test]
    fn test_json_fetch_is_fetch() {
        let request = headers(&[("Sec-Fetch-Dest", "empty"), ("Sec-Fetch-Mode", "cors")]);
        assert_eq!(
            classify("https://example.com/api/items", &request, Some("application/json")),
            ResourceType::Fetch
        );
    }

    #[test]
    fn test_fetch_detected_without_legacy_xhr_header() {
        // Modern fetch() calls do not send X-Requested-With
        let request = headers(&[("sec-fetch-dest", "EMPTY")]);
        assert_eq!(classify("https://example.com/graphql", &request, None), ResourceType::Fetch);
    }

    #[test]
    fn test_legacy_xhr_header_is_a_fallback() {
        let request = headers(&[("X-Requested-With", "XMLHttpRequest")]);
        assert_eq!(
            classify("http://example.com/search.php", &request, Some("text/html")),
            ResourceType::Fetch
        );
    }

    #[test]
    fn test_html_navigation_is_document() {
        let request = headers(&[("Sec-Fetch-Dest", "document"), ("Sec-Fetch-Mode", "navigate")]);
        assert_eq!(
            classify("https://example.com/", &request, Some("text/html; charset=utf-8")),
            ResourceType::Document
        );
    }

    #[test]
    fn test_json_without_fetch_initiator_is_not_fetch() {
        let request = headers(&[("Sec-Fetch-Dest", "script")]);
        assert_eq!(
            classify("https://example.com/data.json", &request, Some("application/json")),
            ResourceType::Script
        );
    }

    #[test]
    fn test_content_type_mapping() {
        let none = Headers::new();
        assert_eq!(classify("http://a/x", &none, Some("text/css")), ResourceType::Stylesheet);
        assert_eq!(
            classify("http://a/x", &none, Some("application/javascript")),
            ResourceType::Script
        );
        assert_eq!(classify("http://a/x", &none, Some("image/webp")), ResourceType::Image);
        assert_eq!(classify("http://a/x", &none, Some("font/woff2")), ResourceType::Font);
        assert_eq!(
            classify("http://a/x", &none, Some("application/manifest+json")),
            ResourceType::Manifest
        );
    }

    #[test]
    fn test_extension_fallback_without_response() {
        let none = Headers::new();
        assert_eq!(classify("http://a/static/app.JS?v=3", &none, None), ResourceType::Script);
        assert_eq!(classify("http://a/logo.svg", &none, None), ResourceType::Image);
        assert_eq!(classify("http://a/fonts/x.woff2", &none, None), ResourceType::Font);
    }

    #[test]
    fn test_unrecognized_is_other() {
        let none = Headers::new();
        assert_eq!(classify("http://example.com/beacon", &none, None), ResourceType::Other);
        assert_eq!(classify("not a url", &none, None), ResourceType::Other);
        assert_eq!(
            classify("http://example.com/blob", &none, Some("application/octet-stream")),
            ResourceType::Other
        );
    }

    #[test]
    fn test_initiator_from_headers() {
        assert_eq!(Initiator::from_headers(&Headers::new()), Initiator::Unknown);
        assert_eq!(
            Initiator::from_headers(&headers(&[("Sec-Fetch-Mode", "navigate")])),
            Initiator::Navigation
        );
        assert_eq!(
            Initiator::from_headers(&headers(&[("Sec-Fetch-Dest", "image")])),
            Initiator::Subresource("image".into())
        );
    }
}
