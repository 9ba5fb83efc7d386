//! Image reference parsing
//!
//! An [`ImageReference`] locates a repository, optionally narrowed to a tag and/or a digest:
//! `[registry/]path[:tag][@sha256:...]`. References are normalized on parse the way the
//! docker client does it, so `busybox` and `docker.io/library/busybox` compare equal.

use crate::digest::Digest;
use crate::error::RegistryError;
use regex::Regex;
use std::fmt;
use std::str::FromStr;
use std::sync::LazyLock;

pub const DOCKER_DEFAULT_REGISTRY: &str = "docker.io";
pub const DOCKER_DEFAULT_V2_REGISTRY: &str = "registry-1.docker.io";
pub const DOCKER_DEFAULT_NAMESPACE: &str = "library";

static COMPONENT_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[a-z0-9]+(?:(?:[._]|__|[-]*)[a-z0-9]+)*$").expect("valid component regex")
});

static TAG_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[\w][\w.-]{0,127}$").expect("valid tag regex"));

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ImageReference {
    pub registry: String,
    /// Repository path within the registry (`namespace/name`)
    pub repository: String,
    pub tag: Option<String>,
    pub digest: Option<Digest>,
}

impl ImageReference {
    pub fn parse(input: &str) -> Result<Self, RegistryError> {
        let input = input.trim();
        if input.is_empty() {
            return Err(RegistryError::Parse("image reference may not be empty".to_string()));
        }
        if input.contains("://") {
            return Err(RegistryError::Parse(format!(
                "image reference may not contain a scheme: {}",
                input
            )));
        }

        let (name_part, digest) = match input.split_once('@') {
            Some((name, digest)) => (name, Some(Digest::parse(digest)?)),
            None => (input, None),
        };

        let last_slash = name_part.rfind('/').map(|i| i + 1).unwrap_or(0);
        let (name, tag) = match name_part[last_slash..].rfind(':') {
            Some(i) => {
                let split = last_slash + i;
                (&name_part[..split], Some(name_part[split + 1..].to_string()))
            }
            None => (name_part, None),
        };

        if let Some(tag) = &tag {
            if !TAG_RE.is_match(tag) {
                return Err(RegistryError::Parse(format!("invalid tag format: {}", input)));
            }
        }

        let mut components: Vec<&str> = name.split('/').collect();
        let registry = if components.len() > 1 && is_registry_component(components[0]) {
            components.remove(0).to_string()
        } else {
            DOCKER_DEFAULT_REGISTRY.to_string()
        };
        let registry = match registry.as_str() {
            "index.docker.io" | DOCKER_DEFAULT_V2_REGISTRY => DOCKER_DEFAULT_REGISTRY.to_string(),
            _ => registry,
        };

        if components.is_empty() || components.iter().any(|c| !COMPONENT_RE.is_match(c)) {
            return Err(RegistryError::Parse(format!(
                "invalid repository name: {}",
                input
            )));
        }
        if registry == DOCKER_DEFAULT_REGISTRY && components.len() == 1 {
            components.insert(0, DOCKER_DEFAULT_NAMESPACE);
        }

        Ok(Self {
            registry,
            repository: components.join("/"),
            tag,
            digest,
        })
    }

    /// The repository name used in registry API paths
    pub fn repository_name(&self) -> &str {
        &self.repository
    }

    /// Host to contact for the v2 API
    pub fn registry_host(&self) -> &str {
        if self.registry == DOCKER_DEFAULT_REGISTRY {
            DOCKER_DEFAULT_V2_REGISTRY
        } else {
            &self.registry
        }
    }

    /// The same repository without tag or digest
    pub fn as_repository(&self) -> Self {
        Self {
            registry: self.registry.clone(),
            repository: self.repository.clone(),
            tag: None,
            digest: None,
        }
    }

    pub fn with_tag(&self, tag: &str) -> Self {
        let mut r = self.as_repository();
        r.tag = Some(tag.to_string());
        r
    }

    pub fn with_digest(&self, digest: &Digest) -> Self {
        let mut r = self.as_repository();
        r.digest = Some(digest.clone());
        r
    }

    /// `registry/repository`
    pub fn exact_repository(&self) -> String {
        format!("{}/{}", self.registry, self.repository)
    }
}

fn is_registry_component(component: &str) -> bool {
    component.contains('.') || component.contains(':') || component == "localhost"
}

impl fmt::Display for ImageReference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.registry, self.repository)?;
        if let Some(tag) = &self.tag {
            write!(f, ":{}", tag)?;
        }
        if let Some(digest) = &self.digest {
            write!(f, "@{}", digest)?;
        }
        Ok(())
    }
}

impl FromStr for ImageReference {
    type Err = RegistryError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        ImageReference::parse(s)
    }
}
