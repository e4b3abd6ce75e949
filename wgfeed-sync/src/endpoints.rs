//! Endpoint set algebra.
//!
//! Pure, order-preserving operations over a subscription's candidate
//! endpoint URLs. The server defines the endpoint *set*; the client owns
//! the *ordering* (learned preferences, failure demotion).

use std::collections::HashSet;

use url::Url;

/// Decodes a JSON-encoded endpoint list.
///
/// Blank or unparseable stored text yields an empty list rather than an
/// error; a subscription with corrupt endpoint state simply has no
/// endpoints until the next successful apply rewrites them.
pub fn decode(endpoints_json: &str) -> Vec<String> {
    if endpoints_json.trim().is_empty() {
        return Vec::new();
    }
    serde_json::from_str(endpoints_json).unwrap_or_default()
}

/// Encodes an endpoint list for persistence.
pub fn encode(endpoints: &[String]) -> String {
    serde_json::to_string(endpoints).unwrap_or_else(|_| "[]".to_string())
}

/// Merges server endpoints into the local list while preserving local order.
///
/// Rules:
/// - The server defines the set of endpoints.
/// - The client keeps its current ordering for endpoints still on the server.
/// - Endpoints removed by the server are removed locally.
/// - New endpoints are appended in server order.
pub fn merge_preserve_local_order(local: &[String], server: &[String]) -> Vec<String> {
    if server.is_empty() {
        return Vec::new();
    }

    let server_set: HashSet<&str> = server.iter().map(String::as_str).collect();

    let mut out = Vec::with_capacity(server.len());
    let mut seen: HashSet<&str> = HashSet::with_capacity(server.len());

    for ep in local {
        if server_set.contains(ep.as_str()) && seen.insert(ep.as_str()) {
            out.push(ep.clone());
        }
    }

    for ep in server {
        if seen.insert(ep.as_str()) {
            out.push(ep.clone());
        }
    }

    out
}

/// Stable-partitions `ordered` so endpoints in `failed` move to the back,
/// preserving relative order within both groups.
pub fn demote_failed(ordered: &[String], failed: &HashSet<String>) -> Vec<String> {
    if failed.is_empty() || ordered.is_empty() {
        return ordered.to_vec();
    }

    let mut ok = Vec::with_capacity(ordered.len());
    let mut bad = Vec::new();
    for ep in ordered {
        if failed.contains(ep) {
            bad.push(ep.clone());
        } else {
            ok.push(ep.clone());
        }
    }
    ok.extend(bad);
    ok
}

/// Returns endpoints with `preferred` moved to the front when present,
/// preserving the relative order of the rest.
pub fn ordered(endpoints: &[String], preferred: Option<&str>) -> Vec<String> {
    let Some(preferred) = preferred.filter(|p| !p.trim().is_empty()) else {
        return endpoints.to_vec();
    };

    if !endpoints.iter().any(|ep| ep == preferred) {
        return endpoints.to_vec();
    }

    let mut out = Vec::with_capacity(endpoints.len());
    out.push(preferred.to_string());
    for ep in endpoints {
        if ep != preferred {
            out.push(ep.clone());
        }
    }
    out
}

/// Strips a URL fragment (`#...`) if present.
///
/// Setup URLs may carry an age key fragment; fragments are never sent in
/// HTTP requests.
pub fn strip_fragment(url: &str) -> String {
    if !url.contains('#') {
        return url.to_string();
    }
    match Url::parse(url) {
        Ok(mut parsed) => {
            parsed.set_fragment(None);
            parsed.to_string()
        }
        // Unparseable input: best-effort textual strip.
        Err(_) => url.split('#').next().unwrap_or(url).to_string(),
    }
}

/// Reduces an endpoint URL to `scheme://host[:port]` for safe logging.
pub fn endpoint_origin(endpoint: &str) -> String {
    match Url::parse(endpoint.trim()) {
        Ok(parsed) => {
            let host = parsed.host_str().unwrap_or("");
            match parsed.port() {
                Some(port) => format!("{}://{host}:{port}", parsed.scheme()),
                None => format!("{}://{host}", parsed.scheme()),
            }
        }
        Err(_) => "<invalid-url>".to_string(),
    }
}
