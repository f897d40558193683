//! Conversion between stored media references and fetchable URLs.
//!
//! Media is always stored as a path under [`UPLOAD_BASE_PATH`]. Clients turn
//! those paths back into absolute URLs against the chat server's origin.

use url::Url;

/// Path under which uploaded media is served.
pub const UPLOAD_BASE_PATH: &str = "/uploads";

const UPLOAD_MARKER: &str = "/uploads/";

fn parse_ref_list(value: &str) -> Option<Vec<String>> {
    let trimmed = value.trim();
    if !trimmed.starts_with('[') {
        return None;
    }
    serde_json::from_str(trimmed).ok()
}

/// Splits a `mediaUrl` value into its references.
///
/// A JSON array of strings yields each element; anything else is a single
/// reference.
pub fn split_refs(value: &str) -> Vec<String> {
    if value.is_empty() {
        return Vec::new();
    }
    parse_ref_list(value).unwrap_or_else(|| vec![value.to_string()])
}

/// Rewrites a media reference into its path relative to the media root.
///
/// Already-relative values are returned as they are. Absolute URLs keep the
/// path from `/uploads/` onward, dropping scheme, host and query. Values in
/// which the marker cannot be found, including malformed ones, pass through
/// unchanged. JSON arrays of references are rewritten element-wise.
pub fn to_relative_url(value: &str) -> String {
    if value.is_empty() {
        return String::new();
    }

    if let Some(items) = parse_ref_list(value) {
        let mapped: Vec<String> = items.iter().map(|item| to_relative_url(item)).collect();
        if mapped == items {
            return value.to_string();
        }
        if let Ok(json) = serde_json::to_string(&mapped) {
            return json;
        }
    }

    if value.starts_with('/') {
        return value.to_string();
    }

    match Url::parse(value) {
        Ok(url) => {
            if let Some(idx) = url.path().find(UPLOAD_MARKER) {
                return url.path()[idx..].to_string();
            }
        }
        Err(_) => {
            if let Some(idx) = value.find(UPLOAD_MARKER) {
                return value[idx..].to_string();
            }
        }
    }

    value.to_string()
}

/// True when `value` carries its own scheme and host.
pub fn is_absolute_http(value: &str) -> bool {
    let lower = value.trim_start().to_ascii_lowercase();
    lower.starts_with("http://") || lower.starts_with("https://")
}

/// Whether every reference in `value` honours the relative-path form.
pub fn is_relative(value: &str) -> bool {
    split_refs(value).iter().all(|item| !is_absolute_http(item))
}

/// Trims a configured origin and strips trailing slashes.
pub fn normalize_origin(raw: &str) -> String {
    raw.trim().trim_end_matches('/').to_string()
}

/// Resolves a single stored reference to a directly fetchable URL.
pub fn resolve_media_url(origin: &str, reference: &str) -> String {
    if is_absolute_http(reference) {
        return reference.to_string();
    }
    if reference.starts_with('/') {
        return format!("{}{reference}", normalize_origin(origin));
    }
    reference.to_string()
}

/// Resolves every reference carried by a `mediaUrl` value.
pub fn resolve_media_urls(origin: &str, value: &str) -> Vec<String> {
    split_refs(value)
        .iter()
        .map(|item| resolve_media_url(origin, item))
        .collect()
}
