//! Tech-fingerprinting and CDN detection from response headers and
//! body content, in the style of `rootsignal-archive::router`'s
//! pattern-dispatch (a flat list of `contains` checks rather than a
//! generic rule engine — the fingerprint table is short enough that a
//! more general mechanism would just be indirection).

use reqwest::header::HeaderMap;

struct HeaderSignature {
    technology: &'static str,
    header: &'static str,
    needle: &'static str,
}

const HEADER_SIGNATURES: &[HeaderSignature] = &[
    HeaderSignature { technology: "nginx", header: "server", needle: "nginx" },
    HeaderSignature { technology: "apache", header: "server", needle: "apache" },
    HeaderSignature { technology: "iis", header: "server", needle: "microsoft-iis" },
    HeaderSignature { technology: "php", header: "x-powered-by", needle: "php" },
    HeaderSignature { technology: "asp.net", header: "x-powered-by", needle: "asp.net" },
    HeaderSignature { technology: "express", header: "x-powered-by", needle: "express" },
];

struct BodySignature {
    technology: &'static str,
    needle: &'static str,
}

const BODY_SIGNATURES: &[BodySignature] = &[
    BodySignature { technology: "wordpress", needle: "wp-content" },
    BodySignature { technology: "drupal", needle: "drupal.settings" },
    BodySignature { technology: "react", needle: "data-reactroot" },
    BodySignature { technology: "next.js", needle: "__next" },
    BodySignature { technology: "shopify", needle: "cdn.shopify.com" },
];

/// Extract the `Server` header, if present.
pub fn server_header(headers: &HeaderMap) -> Option<String> {
    headers
        .get("server")
        .and_then(|v| v.to_str().ok())
        .map(|s| s.to_string())
}

/// Best-effort `<title>` extraction from the first chunk of HTML.
pub fn extract_title(body: &str) -> Option<String> {
    let lower = body.to_lowercase();
    let start = lower.find("<title")?;
    let after_open = lower[start..].find('>')? + start + 1;
    let end = lower[after_open..].find("</title>")? + after_open;
    let title = body.get(after_open..end)?.trim();
    if title.is_empty() {
        None
    } else {
        Some(title.to_string())
    }
}

/// Flag every technology whose header or body signature matches.
pub fn detect_technologies(headers: &HeaderMap, body: &str) -> Vec<String> {
    let lower_body = body.to_lowercase();
    let mut found = Vec::new();

    for sig in HEADER_SIGNATURES {
        if let Some(value) = headers.get(sig.header).and_then(|v| v.to_str().ok()) {
            if value.to_lowercase().contains(sig.needle) {
                found.push(sig.technology.to_string());
            }
        }
    }
    for sig in BODY_SIGNATURES {
        if lower_body.contains(sig.needle) {
            found.push(sig.technology.to_string());
        }
    }
    found.sort();
    found.dedup();
    found
}

/// Identify a fronting CDN from well-known header fingerprints.
pub fn detect_cdn(headers: &HeaderMap) -> Option<String> {
    if headers.contains_key("cf-ray") {
        return Some("cloudflare".to_string());
    }
    if headers.contains_key("x-served-by") || headers.contains_key("x-fastly-request-id") {
        return Some("fastly".to_string());
    }
    if let Some(server) = headers.get("server").and_then(|v| v.to_str().ok()) {
        let lower = server.to_lowercase();
        if lower.contains("cloudflare") {
            return Some("cloudflare".to_string());
        }
        if lower.contains("cloudfront") {
            return Some("cloudfront".to_string());
        }
    }
    if headers.contains_key("x-amz-cf-id") {
        return Some("cloudfront".to_string());
    }
    None
}
