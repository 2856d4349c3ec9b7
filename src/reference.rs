//! Parsing of image references into [`ImageReference`] records.
//!
//! Parsing never fails. A reference that cannot be fully understood (most
//! commonly one without a tag) still yields a record, and later stages treat
//! the missing pieces as invalidity.

use std::collections::HashMap;
use std::sync::Mutex;

use tracing::{debug, warn};

use crate::model::{ImageReference, Registry};

/// Engine URI schemes stripped from a reference before it is split.
const ENGINE_PREFIXES: &[&str] = &["docker://", "shub://"];

/// Markers used to classify the registry from the host segment of a reference.
///
/// Checked in order and the first hit wins, so more specific markers come
/// before the shorter markers they contain.
const REGISTRY_MARKERS: &[(&str, Registry)] = &[
    ("docker.pkg.github.com", Registry::Github),
    ("ghcr.io", Registry::Ghcr),
    ("quay.io", Registry::Quay),
    ("dockerhub", Registry::Dockerhub),
    ("quay", Registry::Quay),
    ("github", Registry::Github),
    ("ghcr", Registry::Ghcr),
    ("shub", Registry::Shub),
];

pub fn sanitize(url: &str) -> String {
    let mut sanitized = url.trim().to_string();
    for prefix in ENGINE_PREFIXES {
        if let Some(stripped) = sanitized.strip_prefix(prefix) {
            sanitized = stripped.to_string();
        }
    }
    sanitized
}

/// Classifies the registry of a raw reference.
///
/// Only the leading host segment is inspected, so organisation and image
/// names such as `biocontainers/github-backup` stay on Docker Hub.
pub fn detect_registry(url: &str) -> Registry {
    let registry = if url.trim().starts_with("shub://") {
        Registry::Shub
    } else {
        host_segment(&sanitize(url))
            .and_then(|host| REGISTRY_MARKERS.iter().find(|(marker, _)| host.contains(marker)))
            .map(|(_, registry)| *registry)
            .unwrap_or(Registry::Dockerhub)
    };
    debug!(url, registry = %registry, "classified registry");
    registry
}

/// The first path segment, when the reference has more than `org/name`.
///
/// Registry hosts also count as a host when followed by a single segment,
/// as in `ghcr.io/image`.
fn host_segment(sanitized: &str) -> Option<&str> {
    let mut segments = sanitized.split('/');
    let first = segments.next()?;
    let rest = segments.count();
    let looks_like_host = first.contains('.') || first.contains(':') || first == "localhost";
    (rest >= 2 || (rest == 1 && looks_like_host)).then_some(first)
}

/// Splits a sanitized reference into `(org, name, tag)`.
pub fn split(sanitized: &str) -> (String, String, Option<String>) {
    let mut segments = sanitized.rsplit('/');
    let image_tag = segments.next().unwrap_or_default();
    let org = segments.next().unwrap_or("library");
    match image_tag.split_once(':') {
        Some((name, tag)) if !tag.is_empty() => {
            (org.to_string(), name.to_string(), Some(tag.to_string()))
        }
        Some((name, _)) => (org.to_string(), name.to_string(), None),
        None => (org.to_string(), image_tag.to_string(), None),
    }
}

/// Builds the canonical record for `url`.
pub fn parse(url: &str) -> ImageReference {
    let sanitized = sanitize(url);
    let registry = detect_registry(url);
    let (org, name, tag) = split(&sanitized);
    if tag.is_none() {
        warn!(url, "no tag was given");
    }
    let full_url = registry.full_url(&org, &name);
    ImageReference { url: url.to_string(), sanitized, registry, org, name, tag, full_url }
}

/// Memoizes [`parse`] per raw reference.
#[derive(Debug, Default)]
pub struct ReferenceResolver {
    parsed: Mutex<HashMap<String, ImageReference>>,
}

impl ReferenceResolver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn resolve(&self, url: &str) -> ImageReference {
        let mut parsed = self.parsed.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        parsed.entry(url.to_string()).or_insert_with(|| parse(url)).clone()
    }
}
