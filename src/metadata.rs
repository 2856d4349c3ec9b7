//! Descriptive metadata for images from external tool catalogs.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use serde_json::Value;
use tracing::debug;

use crate::http::{Fetch, HttpClient};
use crate::model::{ImageReference, Metadata};

/// Tool catalog lookups by image name, shared by validation and metadata.
pub struct Catalog {
    http: Arc<dyn HttpClient>,
    primary_url: String,
    fallback_url: String,
    records: Mutex<HashMap<String, Fetch<Value>>>,
}

impl Catalog {
    pub fn new(http: Arc<dyn HttpClient>, primary_url: &str, fallback_url: &str) -> Self {
        Self {
            http,
            primary_url: primary_url.trim_end_matches('/').to_string(),
            fallback_url: fallback_url.trim_end_matches('/').to_string(),
            records: Mutex::new(HashMap::new()),
        }
    }

    /// Primary catalog record for `name`, requested at most once per process.
    pub fn tool(&self, name: &str) -> Fetch<Value> {
        if let Some(record) = self.lock().get(name) {
            return record.clone();
        }
        let record = self.http.get_json(&format!("{}/{name}?format=json", self.primary_url));
        self.lock().entry(name.to_string()).or_insert(record).clone()
    }

    pub fn fallback(&self, name: &str) -> Fetch<Value> {
        self.http.get_json(&format!("{}/{name}", self.fallback_url))
    }

    /// True when the catalog lists the tool only as a `Library`.
    ///
    /// A missing or unreachable record is not evidence of anything.
    pub fn is_library(&self, name: &str) -> bool {
        match self.tool(name) {
            Fetch::Found(record) => {
                let types: Vec<&str> = record
                    .get("toolType")
                    .and_then(Value::as_array)
                    .map(|types| types.iter().filter_map(Value::as_str).collect())
                    .unwrap_or_default();
                types == ["Library"]
            }
            Fetch::NotFound | Fetch::Transient(_) => false,
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, Fetch<Value>>> {
        self.records.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

pub struct MetadataFetcher {
    catalog: Arc<Catalog>,
}

impl MetadataFetcher {
    pub fn new(catalog: Arc<Catalog>) -> Self {
        Self { catalog }
    }

    /// Builds metadata from the first source that knows the image.
    pub fn fetch(&self, reference: &ImageReference) -> Metadata {
        let name = &reference.name;
        let catalog_record = self.catalog.tool(name).found();
        if let Some(metadata) = catalog_record.and_then(|record| from_catalog(&record)) {
            debug!(url = %reference, "metadata from tool catalog");
            return metadata;
        }
        let fallback_record = self.catalog.fallback(name).found();
        if let Some(metadata) = fallback_record.and_then(|record| from_fallback(&record)) {
            debug!(url = %reference, "metadata from fallback catalog");
            return metadata;
        }
        debug!(url = %reference, "no catalog record, using placeholder metadata");
        Metadata::placeholder(name)
    }
}

fn from_catalog(record: &Value) -> Option<Metadata> {
    let description = record.get("description")?.as_str()?.to_string();
    let keywords = record
        .get("topic")
        .and_then(Value::as_array)
        .into_iter()
        .flatten()
        .filter_map(|topic| topic.get("term").and_then(Value::as_str))
        .filter(|term| *term != "N/A")
        .map(str::to_string)
        .collect();
    let categories = record
        .get("function")
        .and_then(Value::as_array)
        .into_iter()
        .flatten()
        .filter_map(|function| function.get("operation").and_then(Value::as_array))
        .flatten()
        .filter_map(|operation| operation.get("term").and_then(Value::as_str))
        .map(str::to_string)
        .collect();
    let homepage = record.get("homepage").and_then(Value::as_str).map(str::to_string);
    Some(Metadata { categories, keywords, description, homepage })
}

fn from_fallback(record: &Value) -> Option<Metadata> {
    let description = record.get("description")?.as_str()?.to_string();
    let homepage = record.get("homepage_url").and_then(Value::as_str).map(str::to_string);
    Some(Metadata {
        categories: vec!["Unknown".to_string()],
        keywords: vec!["Container".to_string()],
        description,
        homepage,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reference::parse;
    use serde_json::json;

    struct Canned(HashMap<String, Value>);

    impl HttpClient for Canned {
        fn get_json(&self, url: &str) -> Fetch<Value> {
            match self.0.get(url) {
                Some(value) => Fetch::Found(value.clone()),
                None => Fetch::NotFound,
            }
        }
    }

    fn catalog(entries: Vec<(&str, Value)>) -> Arc<Catalog> {
        let http =
            Canned(entries.into_iter().map(|(url, value)| (url.to_string(), value)).collect());
        Arc::new(Catalog::new(
            Arc::new(http),
            "https://catalog.test/tool/",
            "https://fallback.test",
        ))
    }

    #[test]
    fn catalog_record_populates_every_field() {
        let catalog = catalog(vec![(
            "https://catalog.test/tool/bwa?format=json",
            json!({
                "description": "Fast, accurate, memory-efficient aligner",
                "homepage": "http://bio-bwa.sourceforge.net",
                "topic": [{"term": "Mapping"}, {"term": "N/A"}],
                "function": [{"operation": [{"term": "Read mapping"}]}],
                "toolType": ["Command-line tool"]
            }),
        )]);
        let metadata =
            MetadataFetcher::new(Arc::clone(&catalog)).fetch(&parse("biocontainers/bwa:v1"));
        assert_eq!(metadata.keywords, vec!["Mapping"]);
        assert_eq!(metadata.categories, vec!["Read mapping"]);
        assert_eq!(metadata.homepage.as_deref(), Some("http://bio-bwa.sourceforge.net"));
        assert!(!catalog.is_library("bwa"));
    }

    #[test]
    fn fallback_catalog_uses_generic_terms() {
        let catalog = catalog(vec![(
            "https://fallback.test/ubuntu",
            json!({"description": "Ubuntu", "homepage_url": "https://ubuntu.com"}),
        )]);
        let metadata = MetadataFetcher::new(catalog).fetch(&parse("ubuntu:bionic"));
        assert_eq!(metadata.description, "Ubuntu");
        assert_eq!(metadata.keywords, vec!["Container"]);
        assert_eq!(metadata.categories, vec!["Unknown"]);
        assert_eq!(metadata.homepage.as_deref(), Some("https://ubuntu.com"));
    }

    #[test]
    fn unknown_tool_gets_placeholder() {
        let metadata = MetadataFetcher::new(catalog(vec![])).fetch(&parse("org/mystery:1"));
        assert_eq!(metadata, Metadata::placeholder("mystery"));
        assert_eq!(metadata.description, "The mystery package");
        assert_eq!(metadata.homepage, None);
    }

    #[test]
    fn library_only_tools_are_flagged() {
        let catalog = catalog(vec![
            ("https://catalog.test/tool/pysam?format=json", json!({"toolType": ["Library"]})),
            (
                "https://catalog.test/tool/both?format=json",
                json!({"toolType": ["Library", "Command-line tool"]}),
            ),
        ]);
        assert!(catalog.is_library("pysam"));
        assert!(!catalog.is_library("both"));
        assert!(!catalog.is_library("absent"));
    }
}
