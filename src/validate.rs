use std::sync::Arc;

use globset::GlobSet;
use tracing::{debug, warn};

use crate::http::HttpClient;
use crate::metadata::Catalog;
use crate::model::ImageReference;
use crate::registry::TagIndex;

/// Decides whether a reference names a real, pullable, wanted image.
pub struct Validator {
    http: Arc<dyn HttpClient>,
    catalog: Arc<Catalog>,
    tags: TagIndex,
    exclude: Option<GlobSet>,
}

impl Validator {
    pub fn new(http: Arc<dyn HttpClient>, catalog: Arc<Catalog>, exclude: Option<GlobSet>) -> Self {
        Self { http, catalog, tags: TagIndex::new(), exclude }
    }

    pub fn is_valid(&self, reference: &ImageReference, include_libs: bool) -> bool {
        if reference.registry.requires_auth() {
            debug!(
                url = %reference,
                registry = %reference.registry,
                "registry requires authentication"
            );
            return false;
        }
        let Some(tag) = reference.tag.as_deref() else {
            warn!(url = %reference, "excluding reference without a tag");
            return false;
        };
        if let Some(exclude) = &self.exclude
            && exclude.is_match(&reference.sanitized)
        {
            debug!(url = %reference, "matches an exclude pattern");
            return false;
        }
        if !include_libs && self.catalog.is_library(&reference.name) {
            debug!(url = %reference, "excluding library");
            return false;
        }
        if !self.tags.has_tag(self.http.as_ref(), reference) {
            warn!(url = %reference, tag, "tag not found in registry");
            return false;
        }
        debug!(url = %reference, "valid");
        true
    }
}
