//! Tag listings from the public registry APIs.

use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, Mutex};

use serde_json::Value;
use tracing::{debug, error, warn};

use crate::http::{Fetch, HttpClient};
use crate::model::{ImageReference, Registry};

const DOCKERHUB_TAGS: &str = "https://hub.docker.com/v2/repositories";
const QUAY_TAGS: &str = "https://quay.io/api/v1/repository";

type TagKey = (Registry, String, String);

/// Process-lifetime cache of tag listings keyed by (registry, org, name).
#[derive(Default)]
pub struct TagIndex {
    tags: Mutex<HashMap<TagKey, Arc<BTreeSet<String>>>>,
}

impl TagIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn tags(&self, http: &dyn HttpClient, reference: &ImageReference) -> Arc<BTreeSet<String>> {
        let key = reference.tag_key();
        if let Some(tags) = self.lock().get(&key) {
            return Arc::clone(tags);
        }
        let tags = Arc::new(query_tags(http, reference));
        self.lock().entry(key).or_insert_with(|| Arc::clone(&tags)).clone()
    }

    pub fn has_tag(&self, http: &dyn HttpClient, reference: &ImageReference) -> bool {
        match &reference.tag {
            Some(tag) => self.tags(http, reference).contains(tag),
            None => false,
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<TagKey, Arc<BTreeSet<String>>>> {
        self.tags.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

fn query_tags(http: &dyn HttpClient, reference: &ImageReference) -> BTreeSet<String> {
    let (org, name) = (&reference.org, &reference.name);
    let (first_page, key) = match reference.registry {
        Registry::Dockerhub => (format!("{DOCKERHUB_TAGS}/{org}/{name}/tags/"), "results"),
        Registry::Quay => (format!("{QUAY_TAGS}/{org}/{name}/tag/"), "tags"),
        other => {
            error!(url = %reference, registry = %other, "unable to query tags");
            return BTreeSet::new();
        }
    };

    let mut tags = BTreeSet::new();
    let mut next = Some(first_page.clone());
    let mut page = 1u32;
    while let Some(query) = next.take() {
        let response = match http.get_json(&query) {
            Fetch::Found(response) => response,
            Fetch::NotFound => {
                warn!(query = %query, "no tag listing found");
                return BTreeSet::new();
            }
            Fetch::Transient(reason) => {
                warn!(query = %query, reason = %reason, "no response from tag listing");
                return BTreeSet::new();
            }
        };
        tags.extend(tag_names(&response, key));
        next = next_page(&response, &first_page, &mut page);
    }
    debug!(url = %reference, count = tags.len(), "collected tags");
    tags
}

fn tag_names(response: &Value, key: &str) -> Vec<String> {
    response
        .get(key)
        .and_then(Value::as_array)
        .into_iter()
        .flatten()
        .filter_map(|entry| entry.get("name").and_then(Value::as_str))
        .map(str::to_string)
        .collect()
}

/// Docker Hub links the next page with `next`; quay sets `has_additional`.
fn next_page(response: &Value, first_page: &str, page: &mut u32) -> Option<String> {
    if let Some(next) = response.get("next").and_then(Value::as_str)
        && !next.is_empty()
    {
        return Some(next.to_string());
    }
    if response.get("has_additional").and_then(Value::as_bool).unwrap_or(false) {
        *page += 1;
        return Some(format!("{first_page}?page={page}"));
    }
    None
}
