use std::collections::BTreeSet;
use std::fmt;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Hosting service an image reference points at.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Registry {
    Dockerhub,
    Quay,
    Github,
    Ghcr,
    Shub,
}

impl Registry {
    pub fn as_str(&self) -> &'static str {
        match self {
            Registry::Dockerhub => "dockerhub",
            Registry::Quay => "quay",
            Registry::Github => "github",
            Registry::Ghcr => "ghcr",
            Registry::Shub => "shub",
        }
    }

    pub fn display_name(&self) -> &'static str {
        match self {
            Registry::Dockerhub => "Docker Hub",
            Registry::Quay => "Quay",
            Registry::Github => "GitHub Packages",
            Registry::Ghcr => "GitHub Container Registry",
            Registry::Shub => "Singularity Hub",
        }
    }

    /// Browsable web page for `org/name` on this registry.
    pub fn full_url(&self, org: &str, name: &str) -> String {
        match self {
            Registry::Dockerhub => format!("https://hub.docker.com/r/{org}/{name}"),
            Registry::Quay => format!("https://quay.io/repository/{org}/{name}"),
            Registry::Github => format!("https://docker.pkg.github.com/{org}/{name}"),
            Registry::Ghcr => format!("https://ghcr.io/{org}/{name}"),
            Registry::Shub => format!("https://singularity-hub.org/{org}/{name}"),
        }
    }

    /// Registries that need credentials modcrane does not manage.
    pub fn requires_auth(&self) -> bool {
        matches!(self, Registry::Github | Registry::Ghcr | Registry::Shub)
    }
}

impl fmt::Display for Registry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Canonical record derived from a user supplied image reference.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ImageReference {
    /// The reference exactly as it was supplied.
    pub url: String,
    pub sanitized: String,
    pub registry: Registry,
    pub org: String,
    pub name: String,
    pub tag: Option<String>,
    pub full_url: String,
}

impl ImageReference {
    /// Reference handed to `docker pull`.
    pub fn docker_url(&self) -> &str {
        &self.sanitized
    }

    /// Reference handed to `singularity pull`.
    pub fn singularity_url(&self) -> String {
        format!("docker://{}", self.sanitized)
    }

    /// Key of the per-image tag listing shared by every tag of the same image.
    pub fn tag_key(&self) -> (Registry, String, String) {
        (self.registry, self.org.clone(), self.name.clone())
    }

    pub fn module_tag(&self, prefix: Option<&str>) -> String {
        let tag = self.tag.as_deref().unwrap_or("latest");
        match prefix {
            Some(prefix) if !prefix.is_empty() => format!("{prefix}-{tag}"),
            _ => tag.to_string(),
        }
    }
}

impl fmt::Display for ImageReference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.url)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Metadata {
    pub categories: Vec<String>,
    pub keywords: Vec<String>,
    pub description: String,
    pub homepage: Option<String>,
}

impl Metadata {
    pub fn placeholder(name: &str) -> Self {
        Metadata {
            categories: vec!["Unknown".to_string()],
            keywords: vec!["Container".to_string()],
            description: format!("The {name} package"),
            homepage: None,
        }
    }
}

/// Local handle of a pulled image.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ImageHandle {
    /// Image lives in a container daemon and is addressed by reference.
    Daemon(String),
    /// Image is a file on disk.
    File(PathBuf),
}

impl ImageHandle {
    pub fn as_arg(&self) -> String {
        match self {
            ImageHandle::Daemon(reference) => reference.clone(),
            ImageHandle::File(path) => path.display().to_string(),
        }
    }
}

/// Everything the pipeline knows about one reference.
#[derive(Debug, Clone)]
pub struct ImageRecord {
    pub reference: ImageReference,
    pub metadata: Option<Metadata>,
    pub image: Option<ImageHandle>,
}

impl ImageRecord {
    pub fn new(reference: ImageReference) -> Self {
        Self { reference, metadata: None, image: None }
    }
}

/// Outcome of a full `run` used for the closing summary.
#[derive(Debug, Clone, Default)]
pub struct RunReport {
    pub valid: BTreeSet<String>,
    pub invalid: BTreeSet<String>,
    pub blocked: usize,
    pub written: Vec<PathBuf>,
}

impl RunReport {
    pub fn is_empty(&self) -> bool {
        self.valid.is_empty()
    }
}
