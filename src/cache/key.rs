//! Cache key derivation
//!
//! Keys are plain file names: ASCII letters, digits, `.`, `_` and `-`.

use crate::engine::{Normalized, Operation};
use sha2::{Digest, Sha256};
use std::path::Path;

/// Longest URL basename carried into a download key
const MAX_NAME_LEN: usize = 64;

/// Key of the downloaded copy of `url`
///
/// The first 32 hex characters of the URL's SHA256 spread entries evenly
/// across shards; the sanitized basename of the URL path follows so
/// derived transform keys stay recognizable.
pub fn download_key(url: &str) -> String {
    let digest = Sha256::digest(url.as_bytes());
    let hash = hex::encode(&digest[..16]);

    match sanitize(url_basename(url)) {
        name if name.is_empty() => hash,
        name => format!("{}_{}", hash, name),
    }
}

/// Key of one transformed variant of `source`
///
/// `<source>_<op>_q<quality>_<w>x<h>_<x>ox<y>oy[_<gravity>][_<overlay>][_<format>]`
pub fn transform_key(source: &Path, operation: Operation, params: &Normalized) -> String {
    let base = source
        .file_name()
        .map(|n| sanitize(&n.to_string_lossy()))
        .unwrap_or_default();

    let mut key = format!(
        "{}_{}_q{}_{}x{}_{}ox{}oy",
        base, operation, params.quality, params.width, params.height, params.x, params.y
    );

    if let Some(gravity) = params.gravity {
        key.push('_');
        key.push_str(&gravity.as_str().to_ascii_lowercase());
    }
    if let Some(overlay) = params.overlay {
        key.push('_');
        key.push_str(overlay.as_str());
    }
    if let Some(format) = params.format {
        key.push('_');
        key.push_str(format.extension());
    }
    key
}

/// Last path segment of a URL, without query or fragment
fn url_basename(url: &str) -> &str {
    let without_query = url.split(['?', '#']).next().unwrap_or_default();
    let without_scheme = without_query
        .split_once("://")
        .map(|(_, rest)| rest)
        .unwrap_or(without_query);

    match without_scheme.split_once('/') {
        Some((_host, path)) => path.rsplit('/').next().unwrap_or_default(),
        None => "",
    }
}

fn sanitize(name: &str) -> String {
    let cleaned: String = name
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-') {
                c
            } else {
                '_'
            }
        })
        .take(MAX_NAME_LEN)
        .collect();

    // Never produce "." or ".." on their own
    if cleaned.chars().all(|c| c == '.') {
        String::new()
    } else {
        cleaned
    }
}
